//! Chat API endpoints.
//!
//! - `POST   /chat`                — persist the turn, start streaming
//! - `GET    /stream/:session_id`  — SSE replay + live subscription
//! - `DELETE /stream/:session_id`  — cancel the active generation

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;
use serde::Deserialize;

use crate::chat::StreamItem;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub after_seq: i64,
}

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn post_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Response {
    let session_id = match header_value(&headers, "x-session-id") {
        Some(id) if !id.is_empty() => id,
        _ => return api_error(StatusCode::BAD_REQUEST, "X-Session-ID header is required"),
    };
    let sandbox_name = header_value(&headers, "x-sandbox-name").unwrap_or_default();

    if body.prompt.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "prompt is required");
    }

    match state
        .chat
        .initiate_chat_completion(&session_id, &sandbox_name, &body.prompt)
        .await
    {
        Ok(response) => Json(serde_json::json!(response)).into_response(),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "chat initiation failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /stream/:session_id (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let stream = state
        .chat
        .create_event_stream(session_id, query.after_seq)
        .map(|item| {
            Ok::<_, std::convert::Infallible>(match item {
                StreamItem::Event(envelope) => Event::default()
                    .event("stream")
                    .data(serde_json::to_string(&envelope).unwrap_or_default()),
                StreamItem::Ping => Event::default().event("ping").data(""),
            })
        });

    Sse::new(stream)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /stream/:session_id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn delete_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state.chat.stop_stream(&session_id).await;
    StatusCode::NO_CONTENT
}
