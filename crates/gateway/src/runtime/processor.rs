//! Translates the agent's polymorphic message stream into render events,
//! accumulating turn cost and usage on the side.

use regex::Regex;
use serde_json::Value;

use sc_domain::message::{AgentMessage, ContentBlock};
use sc_domain::render::RenderEvent;

use crate::runtime::tool_handler::ToolHandlerRegistry;

type SessionInitCallback = Box<dyn Fn(&str) + Send>;

pub struct StreamProcessor {
    tools: ToolHandlerRegistry,
    on_session_init: Option<SessionInitCallback>,
    pub total_cost_usd: f64,
    pub usage: Option<Value>,
    suggestions_re: Regex,
    command_stdout_re: Regex,
}

impl StreamProcessor {
    pub fn new(tools: ToolHandlerRegistry) -> Self {
        Self {
            tools,
            on_session_init: None,
            total_cost_usd: 0.0,
            usage: None,
            suggestions_re: Regex::new(
                r"(?s)<prompt_suggestions>\s*(.*?)\s*</prompt_suggestions>",
            )
            .expect("static regex"),
            command_stdout_re: Regex::new(r"(?s)<local-command-stdout>(.*?)</local-command-stdout>")
                .expect("static regex"),
        }
    }

    /// Invoked with the agent-side session id when a `System` init message
    /// arrives.
    pub fn on_session_init(mut self, callback: SessionInitCallback) -> Self {
        self.on_session_init = Some(callback);
        self
    }

    /// Events for one agent message.  Unknown variants never reach here;
    /// the client's parser already skipped them.
    pub fn process_message(&mut self, message: AgentMessage) -> Vec<RenderEvent> {
        match message {
            AgentMessage::System { session_id, .. } => self.process_system(session_id),
            AgentMessage::Assistant { message, parent_tool_use_id } => {
                self.process_assistant(message.content, parent_tool_use_id.as_deref())
            }
            AgentMessage::User { message } => self.process_user(message.content),
            AgentMessage::Result { total_cost_usd, usage } => {
                if let Some(cost) = total_cost_usd {
                    self.total_cost_usd += cost;
                }
                if let Some(usage) = usage {
                    self.usage = Some(usage);
                }
                Vec::new()
            }
        }
    }

    fn process_system(&mut self, session_id: Option<String>) -> Vec<RenderEvent> {
        if let (Some(callback), Some(session_id)) = (&self.on_session_init, &session_id) {
            callback(session_id);
        }
        vec![RenderEvent::System {
            data: serde_json::json!({ "subtype": "session_init" }),
        }]
    }

    fn process_assistant(
        &mut self,
        blocks: Vec<ContentBlock>,
        parent_tool_id: Option<&str>,
    ) -> Vec<RenderEvent> {
        let mut events = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } => events.extend(self.process_text_block(&text)),
                ContentBlock::Thinking { thinking } => {
                    if !thinking.is_empty() {
                        events.push(RenderEvent::AssistantThinking { thinking });
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    events.extend(self.tools.start_tool(&id, &name, &input, parent_tool_id));
                }
                ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                    events.extend(self.tools.finish_tool(
                        &tool_use_id,
                        content.as_ref(),
                        is_error.unwrap_or(false),
                    ));
                }
            }
        }
        events
    }

    /// Extract a `<prompt_suggestions>` block when its body is a JSON
    /// array; the wrapper is stripped from the text either way.
    fn process_text_block(&mut self, text: &str) -> Vec<RenderEvent> {
        let mut events = Vec::new();
        let mut remaining = text.to_string();

        if let Some(captures) = self.suggestions_re.captures(text) {
            let raw = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            if let Ok(Value::Array(suggestions)) = serde_json::from_str::<Value>(raw) {
                events.push(RenderEvent::PromptSuggestions { suggestions });
            }
            remaining = self.suggestions_re.replace_all(text, "").trim().to_string();
        }

        if !remaining.is_empty() {
            events.push(RenderEvent::AssistantText { text: remaining });
        }
        events
    }

    fn process_user(&mut self, blocks: Vec<ContentBlock>) -> Vec<RenderEvent> {
        let mut events = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } => {
                    let text = match self.command_stdout_re.captures(&text) {
                        Some(captures) => captures
                            .get(1)
                            .map(|m| m.as_str().trim().to_string())
                            .unwrap_or_default(),
                        None => text,
                    };
                    if !text.is_empty() {
                        events.push(RenderEvent::UserText { text });
                    }
                }
                ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                    events.extend(self.tools.finish_tool(
                        &tool_use_id,
                        content.as_ref(),
                        is_error.unwrap_or(false),
                    ));
                }
                ContentBlock::Thinking { .. } | ContentBlock::ToolUse { .. } => {}
            }
        }
        events
    }
}
