//! The render-event schema: small typed records designed for direct UI
//! consumption, and the envelope that wraps them on the live bus and the
//! SSE stream.
//!
//! The `kind` set is closed; subscribers treat `complete`, `cancelled` and
//! `error` as terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Render events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Events emitted while streaming one assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    System { data: Value },
    AssistantText { text: String },
    AssistantThinking { thinking: String },
    ToolStarted { tool: ToolPayload },
    ToolCompleted { tool: ToolPayload },
    ToolFailed { tool: ToolPayload },
    UserText { text: String },
    PromptSuggestions { suggestions: Vec<Value> },
    Complete { total_cost_usd: f64, usage: Option<Value> },
    Cancelled,
    Error { message: String, error_type: String },
}

impl RenderEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RenderEvent::System { .. } => "system",
            RenderEvent::AssistantText { .. } => "assistant_text",
            RenderEvent::AssistantThinking { .. } => "assistant_thinking",
            RenderEvent::ToolStarted { .. } => "tool_started",
            RenderEvent::ToolCompleted { .. } => "tool_completed",
            RenderEvent::ToolFailed { .. } => "tool_failed",
            RenderEvent::UserText { .. } => "user_text",
            RenderEvent::PromptSuggestions { .. } => "prompt_suggestions",
            RenderEvent::Complete { .. } => "complete",
            RenderEvent::Cancelled => "cancelled",
            RenderEvent::Error { .. } => "error",
        }
    }

    /// Split into `(kind, payload)`.  The payload is what lands in
    /// `message_events.render_payload` and the envelope's `payload` field;
    /// the kind never appears inside it.
    pub fn into_parts(self) -> (&'static str, Value) {
        let kind = self.kind();
        let payload = match self {
            RenderEvent::System { data } => json!({ "data": data }),
            RenderEvent::AssistantText { text } => json!({ "text": text }),
            RenderEvent::AssistantThinking { thinking } => json!({ "thinking": thinking }),
            RenderEvent::ToolStarted { tool }
            | RenderEvent::ToolCompleted { tool }
            | RenderEvent::ToolFailed { tool } => json!({ "tool": tool }),
            RenderEvent::UserText { text } => json!({ "text": text }),
            RenderEvent::PromptSuggestions { suggestions } => {
                json!({ "suggestions": suggestions })
            }
            RenderEvent::Complete { total_cost_usd, usage } => match usage {
                Some(usage) => json!({ "total_cost_usd": total_cost_usd, "usage": usage }),
                None => json!({ "total_cost_usd": total_cost_usd }),
            },
            RenderEvent::Cancelled => json!({}),
            RenderEvent::Error { message, error_type } => {
                json!({ "message": message, "type": error_type })
            }
        };
        (kind, payload)
    }
}

/// Terminal envelope kinds: the subscriber closes the stream after one.
pub fn is_terminal_kind(kind: &str) -> bool {
    matches!(kind, "complete" | "cancelled" | "error")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The `tool` object carried by `tool_started` / `tool_completed` /
/// `tool_failed` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPayload {
    pub id: String,
    pub name: String,
    pub title: String,
    pub status: ToolStatus,
    pub parent_id: Option<String>,
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Started,
    Completed,
    Failed,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The wire shape wrapping every render event on both the live bus and
/// the SSE stream.  Field names are camelCase on the wire and fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnvelope {
    pub session_id: String,
    pub message_id: Uuid,
    pub stream_id: Uuid,
    pub seq: i64,
    pub kind: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl StreamEnvelope {
    pub fn build(
        session_id: &str,
        message_id: Uuid,
        stream_id: Uuid,
        seq: i64,
        kind: &str,
        payload: Value,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_id,
            stream_id,
            seq,
            kind: kind.to_string(),
            payload,
            ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_field_names_are_camel_case() {
        let env = StreamEnvelope::build(
            "s1",
            Uuid::nil(),
            Uuid::nil(),
            7,
            "assistant_text",
            json!({ "text": "hello" }),
        );
        let v = serde_json::to_value(&env).unwrap();
        for key in ["sessionId", "messageId", "streamId", "seq", "kind", "payload", "ts"] {
            assert!(v.get(key).is_some(), "missing wire field {key}");
        }
        assert_eq!(v["seq"], 7);
        assert_eq!(v["payload"]["text"], "hello");
    }

    #[test]
    fn error_payload_carries_type_field() {
        let (kind, payload) = RenderEvent::Error {
            message: "agent process exited with code 1".into(),
            error_type: "ProcessError".into(),
        }
        .into_parts();
        assert_eq!(kind, "error");
        assert_eq!(payload["type"], "ProcessError");
    }

    #[test]
    fn complete_omits_absent_usage() {
        let (_, with) = RenderEvent::Complete {
            total_cost_usd: 0.5,
            usage: Some(json!({ "output_tokens": 10 })),
        }
        .into_parts();
        assert!(with.get("usage").is_some());

        let (_, without) = RenderEvent::Complete { total_cost_usd: 0.5, usage: None }.into_parts();
        assert!(without.get("usage").is_none());
    }

    #[test]
    fn terminal_kinds() {
        assert!(is_terminal_kind("complete"));
        assert!(is_terminal_kind("cancelled"));
        assert!(is_terminal_kind("error"));
        assert!(!is_terminal_kind("assistant_text"));
        assert!(!is_terminal_kind("ping"));
    }

    #[test]
    fn tool_payload_omits_result_and_error_when_absent() {
        let payload = ToolPayload {
            id: "T1".into(),
            name: "Bash".into(),
            title: "Bash(ls)".into(),
            status: ToolStatus::Started,
            parent_id: None,
            input: Some(json!({ "command": "ls" })),
            result: None,
            error: None,
        };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["status"], "started");
        assert!(v.get("result").is_none());
        assert!(v.get("error").is_none());
        // parent_id and input are always present, null when unset.
        assert!(v.get("parent_id").is_some());
    }
}
