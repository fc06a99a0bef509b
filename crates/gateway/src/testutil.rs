//! In-memory fakes shared by the gateway's unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use sc_domain::{Error, Result};
use sc_sandbox::SandboxTransport;

use crate::bus::{BusStream, LiveBus};
use crate::store::{EventRow, MessageRole, MessageStore, PersistedEvent, StreamStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScriptedTransport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A transport that replays canned stdout chunks and records writes.
pub struct ScriptedTransport {
    chunks: tokio::sync::Mutex<VecDeque<String>>,
    /// When set, an exhausted script blocks instead of closing, so tests
    /// can exercise cancellation of an in-flight turn.
    hold_open: AtomicBool,
    ready: AtomicBool,
    fail_connect: AtomicBool,
    connect_count: AtomicUsize,
    close_count: AtomicUsize,
    sent: Mutex<Vec<String>>,
    exit_code: Mutex<Option<i64>>,
}

impl ScriptedTransport {
    pub fn ready(chunks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            chunks: tokio::sync::Mutex::new(chunks.iter().map(|s| s.to_string()).collect()),
            hold_open: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
            connect_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            exit_code: Mutex::new(None),
        })
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn hold_open(&self) {
        self.hold_open.store(true, Ordering::SeqCst);
    }

    pub fn set_exit_code(&self, code: i64) {
        *self.exit_code.lock() = Some(code);
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SandboxTransport for ScriptedTransport {
    async fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connection("scripted connect failure".into()));
        }
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn send(&self, data: &str) -> Result<()> {
        self.sent.lock().push(data.to_string());
        Ok(())
    }

    async fn recv_chunk(&self) -> Option<String> {
        loop {
            if let Some(chunk) = self.chunks.lock().await.pop_front() {
                return Some(chunk);
            }
            if !self.hold_open.load(Ordering::SeqCst) {
                return None;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn close_stdin(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
    }

    fn exit_error(&self) -> Option<Error> {
        (*self.exit_code.lock()).map(|code| Error::Process { exit_code: code })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FakeStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub session_id: String,
    pub role: &'static str,
    pub content_text: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotUpdate {
    pub message_id: Uuid,
    pub content_text: String,
    pub content_render: Value,
    pub last_seq: i64,
    pub stream_status: StreamStatus,
    pub total_cost_usd: f64,
}

#[derive(Default)]
pub struct FakeStore {
    pub messages: Mutex<Vec<StoredMessage>>,
    pub events: Mutex<Vec<EventRow>>,
    pub snapshots: Mutex<Vec<SnapshotUpdate>>,
    pub fail_batch: AtomicBool,
    pub fail_row_seqs: Mutex<HashSet<i64>>,
    pub prior_assistant: AtomicBool,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_snapshot(&self) -> Option<SnapshotUpdate> {
        self.snapshots.lock().last().cloned()
    }

    pub fn event_kinds(&self) -> Vec<(i64, String)> {
        let mut kinds: Vec<(i64, String)> = self
            .events
            .lock()
            .iter()
            .map(|e| (e.seq, e.event_type.clone()))
            .collect();
        kinds.sort();
        kinds
    }
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn create_message(
        &self,
        session_id: &str,
        content: &str,
        role: MessageRole,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.messages.lock().push(StoredMessage {
            id,
            session_id: session_id.to_string(),
            role: role.as_str(),
            content_text: content.to_string(),
        });
        Ok(id)
    }

    async fn append_event(&self, event: &EventRow) -> Result<()> {
        if self.fail_row_seqs.lock().contains(&event.seq) {
            return Err(Error::Database(format!("row insert failed for seq {}", event.seq)));
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn append_events_batch(&self, events: &[EventRow]) -> Result<()> {
        if self.fail_batch.load(Ordering::SeqCst) {
            return Err(Error::Database("batch insert failed".into()));
        }
        self.events.lock().extend(events.iter().cloned());
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
        self.snapshots.lock().push(SnapshotUpdate {
            message_id,
            content_text: content_text.to_string(),
            content_render: content_render.clone(),
            last_seq,
            stream_status,
            total_cost_usd,
        });
        Ok(())
    }

    async fn get_next_seq(&self, session_id: &str) -> Result<i64> {
        let max = self
            .events
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.seq)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn has_prior_assistant(&self, _session_id: &str) -> Result<bool> {
        Ok(self.prior_assistant.load(Ordering::SeqCst))
    }

    async fn get_events_after(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> Result<Vec<PersistedEvent>> {
        let mut rows: Vec<PersistedEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id && e.seq > after_seq)
            .map(|e| PersistedEvent {
                id: Uuid::new_v4(),
                session_id: e.session_id.clone(),
                message_id: e.message_id,
                stream_id: e.stream_id,
                seq: e.seq,
                event_type: e.event_type.clone(),
                render_payload: e.render_payload.clone(),
                created_at: Utc::now(),
            })
            .collect();
        rows.sort_by_key(|e| e.seq);
        Ok(rows)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// FakeBus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct FakeBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
    pub published: Mutex<Vec<(String, String)>>,
    pub fail_publish: AtomicBool,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl LiveBus for FakeBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Bus("fake publish failure".into()));
        }
        self.published.lock().push((topic.to_string(), payload.clone()));
        if let Some(senders) = self.subscribers.lock().get_mut(topic) {
            senders.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusStream> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.subscribers.lock().entry(topic.to_string()).or_default().push(tx);
        Ok(Box::pin(async_stream::stream! {
            while let Some(payload) = rx.recv().await {
                yield payload;
            }
        }))
    }
}
