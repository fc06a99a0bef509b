use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_core::Stream;
use serde_json::json;

use sc_domain::message::AgentMessage;
use sc_domain::options::AgentOptions;
use sc_domain::{Error, Result};
use sc_sandbox::SandboxTransport;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drives one agent process: send prompts, stream typed messages back,
/// interrupt, and shut down.  Shared behind `Arc`; the transport serializes
/// stdin writes so concurrent callers never interleave.
pub struct AgentClient {
    options: AgentOptions,
    transport: Arc<dyn SandboxTransport>,
    connected: AtomicBool,
    request_counter: AtomicU64,
}

impl AgentClient {
    pub fn new(options: AgentOptions, transport: Arc<dyn SandboxTransport>) -> Self {
        Self {
            options,
            transport,
            connected: AtomicBool::new(false),
            request_counter: AtomicU64::new(0),
        }
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub async fn connect(&self) -> Result<()> {
        self.transport.connect().await?;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Send one user prompt.
    pub async fn query(&self, prompt: &str) -> Result<()> {
        let line = json!({
            "type": "user",
            "message": { "role": "user", "content": prompt },
        });
        self.send_line(&line).await
    }

    /// Ask the agent to stop the in-flight turn.
    pub async fn interrupt(&self) -> Result<()> {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let line = json!({
            "type": "control_request",
            "request_id": format!("req_{n}"),
            "request": { "subtype": "interrupt" },
        });
        self.send_line(&line).await
    }

    /// Stream the messages of one turn's response.
    ///
    /// Lines that do not parse as an [`AgentMessage`] (control responses,
    /// protocol additions) are skipped.  The stream ends after the `Result`
    /// message; if the channel closes first, it ends with the transport's
    /// exit error.
    pub fn receive_response(&self) -> impl Stream<Item = Result<AgentMessage>> + Send + '_ {
        let transport = self.transport.clone();
        async_stream::stream! {
            let mut buffer = String::new();
            loop {
                match transport.recv_chunk().await {
                    Some(chunk) => {
                        buffer.push_str(&chunk);
                        while let Some(pos) = buffer.find('\n') {
                            let line: String = buffer.drain(..=pos).collect();
                            match parse_line(line.trim()) {
                                Some(msg) => {
                                    let terminal = msg.is_terminal();
                                    yield Ok(msg);
                                    if terminal {
                                        return;
                                    }
                                }
                                None => continue,
                            }
                        }
                    }
                    None => {
                        // Flush a trailing line the process emitted without
                        // a newline before exiting.
                        if let Some(msg) = parse_line(buffer.trim()) {
                            let terminal = msg.is_terminal();
                            yield Ok(msg);
                            if terminal {
                                return;
                            }
                        }
                        yield Err(match transport.exit_error() {
                            Some(err) => err,
                            None => Error::Connection("agent output channel closed".into()),
                        });
                        return;
                    }
                }
            }
        }
    }

    /// Half-close the conversation: no more input will be sent.
    pub async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.transport.close_stdin().await?;
        }
        Ok(())
    }

    async fn send_line(&self, value: &serde_json::Value) -> Result<()> {
        let mut line = value.to_string();
        line.push('\n');
        self.transport.send(&line).await
    }
}

fn parse_line(line: &str) -> Option<AgentMessage> {
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<AgentMessage>(line) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::debug!(error = %e, "skipping unrecognized agent line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use parking_lot::Mutex;
    use sc_domain::message::ContentBlock;
    use std::collections::VecDeque;

    /// Scripted transport: hands out canned stdout chunks, records writes.
    struct ScriptedTransport {
        chunks: tokio::sync::Mutex<VecDeque<String>>,
        sent: Mutex<Vec<String>>,
        exit: Mutex<Option<i64>>,
    }

    impl ScriptedTransport {
        fn new(chunks: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                chunks: tokio::sync::Mutex::new(
                    chunks.iter().map(|s| s.to_string()).collect(),
                ),
                sent: Mutex::new(Vec::new()),
                exit: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl SandboxTransport for ScriptedTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        fn is_ready(&self) -> bool {
            true
        }
        async fn send(&self, data: &str) -> Result<()> {
            self.sent.lock().push(data.to_string());
            Ok(())
        }
        async fn recv_chunk(&self) -> Option<String> {
            self.chunks.lock().await.pop_front()
        }
        async fn close_stdin(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {}
        fn exit_error(&self) -> Option<Error> {
            (*self.exit.lock()).map(|code| Error::Process { exit_code: code })
        }
    }

    fn client_over(chunks: &[&str]) -> (AgentClient, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::new(chunks);
        (
            AgentClient::new(AgentOptions::default(), transport.clone()),
            transport,
        )
    }

    #[tokio::test]
    async fn streams_messages_until_result() {
        let (client, _) = client_over(&[
            "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"he",
            "llo\"}]}}\n{\"type\":\"result\",\"total_cost_usd\":0.01}\n",
        ]);
        let messages: Vec<_> = client.receive_response().collect().await;
        assert_eq!(messages.len(), 2);
        match messages[0].as_ref().unwrap() {
            AgentMessage::Assistant { message, .. } => {
                assert!(matches!(&message.content[0], ContentBlock::Text { text } if text == "hello"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(messages[1].as_ref().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn skips_unknown_lines() {
        let (client, _) = client_over(&[
            "{\"type\":\"control_response\",\"response\":{}}\n",
            "not json at all\n",
            "{\"type\":\"result\"}\n",
        ]);
        let messages: Vec<_> = client.receive_response().collect().await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].as_ref().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn channel_close_surfaces_exit_error() {
        let (client, transport) = client_over(&[]);
        *transport.exit.lock() = Some(137);
        let messages: Vec<_> = client.receive_response().collect().await;
        assert_eq!(messages.len(), 1);
        match messages[0].as_ref().unwrap_err() {
            Error::Process { exit_code } => assert_eq!(*exit_code, 137),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_close_without_exit_is_connection_error() {
        let (client, _) = client_over(&[]);
        let messages: Vec<_> = client.receive_response().collect().await;
        assert!(matches!(
            messages[0].as_ref().unwrap_err(),
            Error::Connection(_)
        ));
    }

    #[tokio::test]
    async fn trailing_result_without_newline_is_flushed() {
        let (client, _) = client_over(&["{\"type\":\"result\",\"total_cost_usd\":0.02}"]);
        let messages: Vec<_> = client.receive_response().collect().await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].as_ref().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn query_and_interrupt_write_protocol_lines() {
        let (client, transport) = client_over(&[]);
        client.query("hi there").await.unwrap();
        client.interrupt().await.unwrap();
        client.interrupt().await.unwrap();

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 3);
        let prompt: serde_json::Value = serde_json::from_str(sent[0].trim()).unwrap();
        assert_eq!(prompt["type"], "user");
        assert_eq!(prompt["message"]["content"], "hi there");

        let first: serde_json::Value = serde_json::from_str(sent[1].trim()).unwrap();
        let second: serde_json::Value = serde_json::from_str(sent[2].trim()).unwrap();
        assert_eq!(first["request"]["subtype"], "interrupt");
        assert_ne!(first["request_id"], second["request_id"]);
        assert!(sent.iter().all(|line| line.ends_with('\n')));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (client, _) = client_over(&[]);
        client.connect().await.unwrap();
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
    }

    #[test]
    fn options_are_retained() {
        let (client, _) = client_over(&[]);
        assert_eq!(client.options().permission_mode, "bypassPermissions");
    }
}
