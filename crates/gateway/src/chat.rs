//! Chat service: initiates turns and serves the replay-then-live
//! subscription protocol.

use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use futures_util::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use sc_domain::render::{is_terminal_kind, StreamEnvelope};
use sc_domain::Result;

use crate::bus::{live_topic, LiveBus};
use crate::registry::SessionRegistry;
use crate::runtime::{ChatStreamRequest, ChatStreamRuntime};
use crate::store::{MessageRole, MessageStore, PersistedEvent};

/// Idle gap after which a keepalive ping is sent to the subscriber.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// One item on a subscriber's stream.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(StreamEnvelope),
    Ping,
}

#[derive(Debug, Serialize)]
pub struct InitiateResponse {
    pub message_id: Uuid,
    pub session_id: String,
}

pub struct ChatService {
    store: Arc<dyn MessageStore>,
    bus: Arc<dyn LiveBus>,
    runtime: Arc<ChatStreamRuntime>,
    registry: Arc<SessionRegistry>,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        bus: Arc<dyn LiveBus>,
        runtime: Arc<ChatStreamRuntime>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self { store, bus, runtime, registry }
    }

    /// Persist the user message and a placeholder assistant reply, then
    /// kick off the background streaming task.
    pub async fn initiate_chat_completion(
        &self,
        session_id: &str,
        sandbox_name: &str,
        prompt: &str,
    ) -> Result<InitiateResponse> {
        self.store
            .create_message(session_id, prompt, MessageRole::User)
            .await?;
        let assistant_message_id = self
            .store
            .create_message(session_id, "", MessageRole::Assistant)
            .await?;

        let request = ChatStreamRequest {
            prompt: prompt.to_string(),
            session_id: session_id.to_string(),
            sandbox_name: sandbox_name.to_string(),
            assistant_message_id,
        };
        let task = self.runtime.start_background_chat(request);

        // Park the handle on the live session when one already exists so
        // the registry can cancel or await it.
        if let Some(session) = self.registry.get_session(session_id).await {
            *session.active_generation_task.lock() = Some(task);
        }

        Ok(InitiateResponse {
            message_id: assistant_message_id,
            session_id: session_id.to_string(),
        })
    }

    /// Replay persisted events with `seq > after_seq`, then follow the
    /// live topic, deduplicating across the handover by seq.  A terminal
    /// live envelope closes the stream; 30 s of silence yields a ping.
    pub fn create_event_stream(
        &self,
        session_id: String,
        after_seq: i64,
    ) -> impl Stream<Item = StreamItem> + Send + 'static {
        let store = self.store.clone();
        let bus = self.bus.clone();

        async_stream::stream! {
            // Subscribe before emitting backlog; the seq filter below
            // drops whatever arrives on both paths.
            let live = match bus.subscribe(&live_topic(&session_id)).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "live subscribe failed");
                    None
                }
            };

            let mut max_seq = after_seq;
            match store.get_events_after(&session_id, after_seq).await {
                Ok(backlog) => {
                    for event in backlog {
                        if event.seq > max_seq {
                            max_seq = event.seq;
                        }
                        yield StreamItem::Event(envelope_from_persisted(event));
                    }
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "backlog fetch failed");
                }
            }

            let Some(mut live) = live else { return };
            loop {
                match tokio::time::timeout(PING_INTERVAL, live.next()).await {
                    Err(_) => {
                        yield StreamItem::Ping;
                    }
                    Ok(None) => break,
                    Ok(Some(payload)) => {
                        let envelope: StreamEnvelope = match serde_json::from_str(&payload) {
                            Ok(envelope) => envelope,
                            Err(_) => {
                                tracing::warn!(
                                    session_id = %session_id,
                                    payload = %payload,
                                    "invalid JSON from live bus"
                                );
                                continue;
                            }
                        };
                        if envelope.seq <= max_seq {
                            // Already replayed from the backlog.
                            continue;
                        }
                        max_seq = envelope.seq;
                        let terminal = is_terminal_kind(&envelope.kind);
                        yield StreamItem::Event(envelope);
                        if terminal {
                            break;
                        }
                    }
                }
            }
            // Dropping the subscription releases the bus connection.
        }
    }

    /// Signal cancellation of the active generation for a chat.
    pub async fn stop_stream(&self, session_id: &str) {
        self.registry.cancel_generation(session_id).await;
    }
}

fn envelope_from_persisted(event: PersistedEvent) -> StreamEnvelope {
    StreamEnvelope {
        session_id: event.session_id,
        message_id: event.message_id,
        stream_id: event.stream_id,
        seq: event.seq,
        kind: event.event_type,
        payload: event.render_payload,
        ts: event.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventRow;
    use crate::testutil::{FakeBus, FakeStore};
    use sc_domain::config::Settings;
    use serde_json::json;

    struct Harness {
        service: ChatService,
        store: Arc<FakeStore>,
        bus: Arc<FakeBus>,
    }

    fn harness() -> Harness {
        let store = FakeStore::new();
        let bus = FakeBus::new();
        let registry = Arc::new(SessionRegistry::new());
        let runtime = Arc::new(ChatStreamRuntime::new(
            Arc::new(Settings::default()),
            store.clone(),
            bus.clone(),
            registry.clone(),
        ));
        Harness {
            service: ChatService::new(store.clone(), bus.clone(), runtime, registry),
            store,
            bus,
        }
    }

    fn seed_event(store: &FakeStore, session_id: &str, seq: i64, kind: &str) {
        store.events.lock().push(EventRow {
            session_id: session_id.into(),
            message_id: Uuid::new_v4(),
            stream_id: Uuid::new_v4(),
            seq,
            event_type: kind.into(),
            render_payload: json!({ "text": format!("event {seq}") }),
        });
    }

    fn live_envelope(session_id: &str, seq: i64, kind: &str) -> String {
        serde_json::to_string(&StreamEnvelope::build(
            session_id,
            Uuid::nil(),
            Uuid::nil(),
            seq,
            kind,
            json!({}),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn replay_then_live_handover_dedups_by_seq() {
        let h = harness();
        seed_event(&h.store, "s1", 1, "assistant_text");
        seed_event(&h.store, "s1", 2, "complete");

        let mut stream = Box::pin(h.service.create_event_stream("s1".into(), 0));

        // Backlog first, in seq order.
        let StreamItem::Event(first) = stream.next().await.unwrap() else { panic!("want event") };
        let StreamItem::Event(second) = stream.next().await.unwrap() else { panic!("want event") };
        assert_eq!((first.seq, second.seq), (1, 2));

        // A duplicate of seq 2 on the bus is dropped; new seqs flow, and a
        // terminal kind closes the stream.
        h.bus.publish("chat:stream:live:s1", live_envelope("s1", 2, "complete")).await.unwrap();
        h.bus.publish("chat:stream:live:s1", live_envelope("s1", 3, "assistant_text")).await.unwrap();
        h.bus.publish("chat:stream:live:s1", live_envelope("s1", 4, "complete")).await.unwrap();

        let StreamItem::Event(third) = stream.next().await.unwrap() else { panic!("want event") };
        assert_eq!(third.seq, 3);
        let StreamItem::Event(fourth) = stream.next().await.unwrap() else { panic!("want event") };
        assert_eq!((fourth.seq, fourth.kind.as_str()), (4, "complete"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn after_seq_beyond_latest_yields_live_only() {
        let h = harness();
        seed_event(&h.store, "s1", 1, "assistant_text");
        seed_event(&h.store, "s1", 2, "complete");

        let mut stream = Box::pin(h.service.create_event_stream("s1".into(), 2));
        let bus = h.bus.clone();
        tokio::spawn(async move {
            // Published once the subscriber is registered.
            tokio::time::sleep(Duration::from_millis(50)).await;
            bus.publish("chat:stream:live:s1", live_envelope("s1", 3, "error")).await.unwrap();
        });

        let StreamItem::Event(event) = stream.next().await.unwrap() else { panic!("want event") };
        assert_eq!(event.seq, 3);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn non_json_bus_payloads_are_skipped() {
        let h = harness();
        let mut stream = Box::pin(h.service.create_event_stream("s1".into(), 0));
        let bus = h.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            bus.publish("chat:stream:live:s1", "not json".into()).await.unwrap();
            bus.publish("chat:stream:live:s1", live_envelope("s1", 1, "cancelled")).await.unwrap();
        });

        let StreamItem::Event(event) = stream.next().await.unwrap() else { panic!("want event") };
        assert_eq!(event.kind, "cancelled");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_subscriber_receives_pings() {
        let h = harness();
        let mut stream = Box::pin(h.service.create_event_stream("s1".into(), 0));
        // With no traffic, the 30s idle timer trips (auto-advanced time).
        assert!(matches!(stream.next().await.unwrap(), StreamItem::Ping));
        assert!(matches!(stream.next().await.unwrap(), StreamItem::Ping));
    }

    #[tokio::test]
    async fn initiate_persists_user_and_placeholder() {
        let h = harness();
        let response = h
            .service
            .initiate_chat_completion("s1", "box", "hello agent")
            .await
            .unwrap();
        assert_eq!(response.session_id, "s1");

        let messages = h.store.messages.lock().clone();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content_text, "hello agent");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content_text, "");
        assert_eq!(messages[1].id, response.message_id);
    }
}
