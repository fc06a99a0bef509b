//! Wire protocol spoken by the agent CLI over sandbox stdio.
//!
//! Each line of agent stdout is one JSON document; each prompt sent to the
//! agent is one JSON line on stdin.  Variants not modelled here are skipped
//! by the client so protocol additions stay non-breaking.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One message emitted by the agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Lifecycle notifications (`subtype = "init"` carries the agent-side
    /// session id).
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Assistant output: one or more content blocks.
    Assistant {
        message: MessageBody,
        #[serde(default)]
        parent_tool_use_id: Option<String>,
    },

    /// Echoed user-side content (command output, tool results).
    User { message: MessageBody },

    /// Terminal accounting record for the turn.  No content.
    Result {
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<serde_json::Value>,
    },
}

impl AgentMessage {
    /// Whether this message terminates a turn's response stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentMessage::Result { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content blocks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<serde_json::Value>,
        #[serde(default)]
        is_error: Option<bool>,
    },
}
