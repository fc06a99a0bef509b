//! Message store: typed operations over the `messages` and
//! `message_events` relations.
//!
//! Expected schema (migrations are owned by the deployment):
//! `messages(id PK, session_id, role, content_text, content_render jsonb,
//! last_seq int8, stream_status, total_cost_usd float8)` and
//! `message_events(id PK, session_id, message_id, stream_id, seq int8,
//! event_type, render_payload jsonb, created_at)` with an index on
//! `(session_id, seq)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use sc_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    InProgress,
    Completed,
    Interrupted,
    Failed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::InProgress => "in_progress",
            StreamStatus::Completed => "completed",
            StreamStatus::Interrupted => "interrupted",
            StreamStatus::Failed => "failed",
        }
    }
}

/// One render event queued for persistence.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub session_id: String,
    pub message_id: Uuid,
    pub stream_id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub render_payload: Value,
}

/// One persisted render event, as read back for replay.
#[derive(Debug, Clone)]
pub struct PersistedEvent {
    pub id: Uuid,
    pub session_id: String,
    pub message_id: Uuid,
    pub stream_id: Uuid,
    pub seq: i64,
    pub event_type: String,
    pub render_payload: Value,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// INSERT a message row and return its id.  User rows are `completed`
    /// at insert; assistant rows begin `in_progress`.
    async fn create_message(
        &self,
        session_id: &str,
        content: &str,
        role: MessageRole,
    ) -> Result<Uuid>;

    async fn append_event(&self, event: &EventRow) -> Result<()>;

    async fn append_events_batch(&self, events: &[EventRow]) -> Result<()>;

    async fn update_message_snapshot(
        &self,
        message_id: Uuid,
        content_text: &str,
        content_render: &Value,
        last_seq: i64,
        stream_status: StreamStatus,
        total_cost_usd: f64,
    ) -> Result<()>;

    /// `COALESCE(MAX(seq), 0) + 1`, scoped to the session.
    async fn get_next_seq(&self, session_id: &str) -> Result<i64>;

    /// Whether the session has a completed assistant message.
    async fn has_prior_assistant(&self, session_id: &str) -> Result<bool>;

    /// Events with `seq > after_seq`, ascending.
    async fn get_events_after(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> Result<Vec<PersistedEvent>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Postgres implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create_message(
        &self,
        session_id: &str,
        content: &str,
        role: MessageRole,
    ) -> Result<Uuid> {
        let message_id = Uuid::new_v4();
        let stream_status = match role {
            MessageRole::Assistant => StreamStatus::InProgress,
            MessageRole::User => StreamStatus::Completed,
        };
        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content_text, stream_status) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(message_id)
        .bind(session_id)
        .bind(role.as_str())
        .bind(strip_null_bytes(content))
        .bind(stream_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(message_id)
    }

    async fn append_event(&self, event: &EventRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_events \
             (id, session_id, message_id, stream_id, seq, event_type, render_payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(&event.session_id)
        .bind(event.message_id)
        .bind(event.stream_id)
        .bind(event.seq)
        .bind(&event.event_type)
        .bind(sanitize_json(event.render_payload.clone()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn append_events_batch(&self, events: &[EventRow]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO message_events \
             (id, session_id, message_id, stream_id, seq, event_type, render_payload) ",
        );
        builder.push_values(events, |mut row, event| {
            row.push_bind(Uuid::new_v4())
                .push_bind(&event.session_id)
                .push_bind(event.message_id)
                .push_bind(event.stream_id)
                .push_bind(event.seq)
                .push_bind(&event.event_type)
                .push_bind(sanitize_json(event.render_payload.clone()));
        });
        builder.build().execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn update_message_snapshot(
        &self,
        message_id: Uuid,
        content_text: &str,
        content_render: &Value,
        last_seq: i64,
        stream_status: StreamStatus,
        total_cost_usd: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE messages \
             SET content_text = $1, content_render = $2, last_seq = $3, \
                 stream_status = $4, total_cost_usd = $5 \
             WHERE id = $6",
        )
        .bind(strip_null_bytes(content_text))
        .bind(sanitize_json(content_render.clone()))
        .bind(last_seq)
        .bind(stream_status.as_str())
        .bind(total_cost_usd)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_next_seq(&self, session_id: &str) -> Result<i64> {
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM message_events WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(next)
    }

    async fn has_prior_assistant(&self, session_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM messages \
             WHERE session_id = $1 AND role = 'assistant' AND stream_status = 'completed' \
             LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn get_events_after(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> Result<Vec<PersistedEvent>> {
        let rows = sqlx::query(
            "SELECT id, session_id, message_id, stream_id, seq, event_type, \
                    render_payload, created_at \
             FROM message_events \
             WHERE session_id = $1 AND seq > $2 \
             ORDER BY seq ASC",
        )
        .bind(session_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| PersistedEvent {
                id: row.get("id"),
                session_id: row.get("session_id"),
                message_id: row.get("message_id"),
                stream_id: row.get("stream_id"),
                seq: row.get("seq"),
                event_type: row.get("event_type"),
                render_payload: row.get("render_payload"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Null-byte hygiene
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Remove null bytes, which Postgres text columns reject.
pub fn strip_null_bytes(s: &str) -> String {
    s.replace('\0', "")
}

/// Recursively remove null bytes from every string in a JSON value
/// (jsonb rejects `\u0000` anywhere, keys included).
pub fn sanitize_json(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(strip_null_bytes(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_json).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (strip_null_bytes(&k), sanitize_json(v)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_null_bytes_from_text() {
        assert_eq!(strip_null_bytes("a\0b\0"), "ab");
        assert_eq!(strip_null_bytes("clean"), "clean");
    }

    #[test]
    fn sanitizes_nested_json() {
        let dirty = json!({
            "te\0xt": "a\0b",
            "nested": { "list": ["x\0", 1, null, { "k": "\0" }] },
        });
        let clean = sanitize_json(dirty);
        assert_eq!(
            clean,
            json!({
                "text": "ab",
                "nested": { "list": ["x", 1, null, { "k": "" }] },
            })
        );
    }

    #[test]
    fn status_and_role_strings() {
        assert_eq!(StreamStatus::InProgress.as_str(), "in_progress");
        assert_eq!(StreamStatus::Interrupted.as_str(), "interrupted");
        assert_eq!(MessageRole::Assistant.as_str(), "assistant");
    }
}
