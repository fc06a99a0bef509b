//! Mutable state for a single streaming run.

use std::time::Instant;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::runtime::cancel::CancelEvent;
use crate::store::EventRow;

/// Input to one background turn.
#[derive(Debug, Clone)]
pub struct ChatStreamRequest {
    pub prompt: String,
    pub session_id: String,
    pub sandbox_name: String,
    pub assistant_message_id: Uuid,
}

/// How the run ended; drives the snapshot's final stream status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Completed,
    Cancelled,
    Failed,
}

/// Per-turn state owned by the stream runtime.
pub struct StreamContext {
    pub session_id: String,
    pub message_id: Uuid,
    pub stream_id: Uuid,
    pub seq: i64,
    pub snapshot: SnapshotAccumulator,
    pub cancel: CancelEvent,
    pub last_flush_at: Instant,
    pub events_since_flush: usize,
    pub pending_events: Vec<EventRow>,
    pub terminal: Option<TerminalState>,
    pub total_cost_usd: f64,
}

impl StreamContext {
    pub fn new(session_id: String, message_id: Uuid, cancel: CancelEvent) -> Self {
        Self {
            session_id,
            message_id,
            stream_id: Uuid::new_v4(),
            seq: 0,
            snapshot: SnapshotAccumulator::default(),
            cancel,
            last_flush_at: Instant::now(),
            events_since_flush: 0,
            pending_events: Vec::new(),
            terminal: None,
            total_cost_usd: 0.0,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot accumulator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rolling view of the assistant message: the ordered event list plus the
/// concatenated text parts.
#[derive(Debug, Default)]
pub struct SnapshotAccumulator {
    events: Vec<Value>,
    text_parts: Vec<String>,
}

impl SnapshotAccumulator {
    pub fn add_event(&mut self, kind: &str, payload: &Value) {
        if kind == "assistant_text" {
            if let Some(text) = payload.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    self.text_parts.push(text.to_string());
                }
            }
        }

        let mut entry = json!({ "type": kind });
        if let (Some(entry_map), Some(payload_map)) = (entry.as_object_mut(), payload.as_object())
        {
            for (k, v) in payload_map {
                entry_map.insert(k.clone(), v.clone());
            }
        }
        self.events.push(entry);
    }

    pub fn content_text(&self) -> String {
        self.text_parts.concat()
    }

    pub fn to_render(&self) -> Value {
        json!({ "events": self.events })
    }
}
