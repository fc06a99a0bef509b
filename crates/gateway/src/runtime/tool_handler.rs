//! Tool lifecycle tracking: in-flight tool calls keyed by use id, turned
//! into `tool_started` / `tool_completed` / `tool_failed` render events.

use std::collections::HashMap;

use serde_json::Value;

use sc_domain::render::{RenderEvent, ToolPayload, ToolStatus};

const MAX_DESC_LEN: usize = 60;

/// A tool call awaiting its result.
#[derive(Debug, Clone)]
struct ActiveToolState {
    id: String,
    name: String,
    title: String,
    parent_id: Option<String>,
    input: Option<Value>,
}

impl ActiveToolState {
    fn to_payload(&self, status: ToolStatus) -> ToolPayload {
        ToolPayload {
            id: self.id.clone(),
            name: self.name.clone(),
            title: self.title.clone(),
            status,
            parent_id: self.parent_id.clone(),
            input: self.input.clone(),
            result: None,
            error: None,
        }
    }
}

#[derive(Default)]
pub struct ToolHandlerRegistry {
    active: HashMap<String, ActiveToolState>,
}

impl ToolHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tool-use block and emit `tool_started`.
    pub fn start_tool(
        &mut self,
        id: &str,
        name: &str,
        input: &Value,
        parent_tool_id: Option<&str>,
    ) -> Option<RenderEvent> {
        if id.is_empty() {
            return None;
        }

        let input_copy = input.is_object().then(|| input.clone());
        let state = ActiveToolState {
            id: id.to_string(),
            name: name.to_string(),
            title: format_tool_title(name, input_copy.as_ref()),
            parent_id: parent_tool_id.map(str::to_string),
            input: input_copy,
        };
        self.active.insert(id.to_string(), state.clone());

        Some(RenderEvent::ToolStarted {
            tool: state.to_payload(ToolStatus::Started),
        })
    }

    /// Resolve a tool result and emit `tool_completed` or `tool_failed`.
    ///
    /// A missing state (out-of-order result) gets an `unknown` placeholder
    /// rather than dropping the event.
    pub fn finish_tool(
        &mut self,
        tool_use_id: &str,
        raw_result: Option<&Value>,
        is_error: bool,
    ) -> Option<RenderEvent> {
        if tool_use_id.is_empty() {
            return None;
        }

        let state = self.active.remove(tool_use_id).unwrap_or(ActiveToolState {
            id: tool_use_id.to_string(),
            name: "unknown".into(),
            title: "Unknown tool".into(),
            parent_id: None,
            input: None,
        });

        if is_error {
            let mut tool = state.to_payload(ToolStatus::Failed);
            tool.error = Some(stringify_result(raw_result));
            Some(RenderEvent::ToolFailed { tool })
        } else {
            let mut tool = state.to_payload(ToolStatus::Completed);
            tool.result = Some(normalize_result(raw_result));
            Some(RenderEvent::ToolCompleted { tool })
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Titles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build a descriptive title like `Bash(ls -la)` or `Read(/etc/hosts)`.
///
/// MCP tool names (`mcp__<server>__<tool>`) reduce to the tool segment
/// with underscores turned into spaces.
fn format_tool_title(tool_name: &str, tool_input: Option<&Value>) -> String {
    let mut base = tool_name.to_string();
    if tool_name.starts_with("mcp__") {
        let parts: Vec<&str> = tool_name.splitn(3, "__").collect();
        if parts.len() == 3 {
            base = parts[2].replace('_', " ");
        }
    }

    let Some(input) = tool_input else { return base };
    let desc = extract_tool_description(tool_name, input);
    if desc.is_empty() {
        base
    } else {
        format!("{base}({desc})")
    }
}

/// A short human-readable description from the tool's input parameters.
fn extract_tool_description(tool_name: &str, input: &Value) -> String {
    let field = |key: &str| -> Option<String> {
        input
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(truncate_desc)
    };

    match tool_name {
        "Bash" | "bash" => {
            return field("description").or_else(|| field("command")).unwrap_or_default()
        }
        "Task" | "task" => return field("description").unwrap_or_default(),
        "Read" | "read" | "Write" | "write" | "Edit" | "edit" => {
            return field("file_path").unwrap_or_default()
        }
        "Glob" | "glob" | "Grep" | "grep" => return field("pattern").unwrap_or_default(),
        "WebFetch" | "web_fetch" => return field("url").unwrap_or_default(),
        "WebSearch" | "web_search" => return field("query").unwrap_or_default(),
        "TodoWrite" | "TaskCreate" => return field("subject").unwrap_or_default(),
        _ => {}
    }

    // Generic fallback over common parameter names, for tools without a
    // dedicated projection.
    for key in ["description", "prompt", "query", "file_path", "pattern", "command"] {
        if let Some(desc) = field(key) {
            return desc;
        }
    }
    String::new()
}

/// First line only, at most 60 characters, `…` when truncated.
fn truncate_desc(s: &str) -> String {
    let first_line = s.trim().lines().next().unwrap_or("").trim();
    let chars: Vec<char> = first_line.chars().collect();
    if chars.len() > MAX_DESC_LEN {
        let mut out: String = chars[..MAX_DESC_LEN - 1].iter().collect();
        out.push('\u{2026}');
        out
    } else {
        first_line.to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whole-document JSON strings are parsed, other strings stay text;
/// lists and maps recurse; everything else passes through.
fn normalize_result(result: Option<&Value>) -> Value {
    let Some(result) = result else { return Value::Null };
    match result {
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| normalize_result(Some(v))).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_result(Some(v))))
                .collect(),
        ),
        Value::String(s) => {
            let text = s.trim();
            if text.is_empty() {
                return Value::String(String::new());
            }
            match serde_json::from_str::<Value>(text) {
                Ok(parsed) => parsed,
                Err(_) => Value::String(text.to_string()),
            }
        }
        other => other.clone(),
    }
}

fn stringify_result(result: Option<&Value>) -> String {
    match result {
        None => Value::Null.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
