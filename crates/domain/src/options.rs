//! Agent launch options: everything that shapes the process inside the
//! sandbox and the conversation it resumes.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Options for one agent session.
///
/// The maps are `BTreeMap` so serialization is key-ordered; the registry's
/// configuration fingerprint relies on that stability.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOptions {
    /// Structured system-prompt selector, e.g. `{"type":"preset","name":"claude_code"}`.
    pub system_prompt: Value,
    /// Extra environment for the agent process.
    pub env: BTreeMap<String, String>,
    /// MCP server definitions, keyed by server name.
    pub mcp_servers: BTreeMap<String, Value>,
    /// Tools the agent must not use.
    pub disallowed_tools: Vec<String>,
    /// Working directory inside the sandbox.
    pub cwd: String,
    /// User to run as (container backends only; pod exec cannot switch).
    pub user: Option<String>,
    /// Model override; empty selector when `None`.
    pub model: Option<String>,
    pub permission_mode: String,
    /// Resume the previous conversation instead of starting fresh.
    pub continue_conversation: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            system_prompt: Value::Null,
            env: BTreeMap::new(),
            mcp_servers: BTreeMap::new(),
            disallowed_tools: Vec::new(),
            cwd: "/home/agent".into(),
            user: None,
            model: None,
            permission_mode: "bypassPermissions".into(),
            continue_conversation: false,
        }
    }
}

impl AgentOptions {
    /// The subset of options whose change invalidates a reused session,
    /// serialized with stable key order.  The registry hashes this.
    pub fn fingerprint_source(&self) -> String {
        #[derive(Serialize)]
        struct FingerprintFields<'a> {
            system_prompt: &'a Value,
            env: &'a BTreeMap<String, String>,
            mcp_servers: &'a BTreeMap<String, Value>,
            disallowed_tools: &'a [String],
        }

        serde_json::to_string(&FingerprintFields {
            system_prompt: &self.system_prompt,
            env: &self.env,
            mcp_servers: &self.mcp_servers,
            disallowed_tools: &self.disallowed_tools,
        })
        .unwrap_or_default()
    }
}
