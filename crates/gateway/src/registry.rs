//! Session registry: the process-wide cache of live agent connections,
//! keyed by chat id.
//!
//! A session is reused only while its sandbox id and configuration
//! fingerprint are unchanged and its transport reports ready; anything
//! else closes the stale session and builds a fresh one.  Teardown always
//! runs task-cancel → client-disconnect → transport-close, each step's
//! errors swallowed so shutdown completes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use sc_agent::AgentClient;
use sc_domain::options::AgentOptions;
use sc_domain::Result;
use sc_sandbox::SandboxTransport;

use crate::runtime::cancel::CancelEvent;

const TASK_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

pub type TransportFactory = Box<dyn Fn() -> Arc<dyn SandboxTransport> + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChatSession
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One live agent connection.
pub struct ChatSession {
    pub chat_id: String,
    pub sandbox_id: String,
    pub transport: Arc<dyn SandboxTransport>,
    pub client: Arc<AgentClient>,
    pub config_fingerprint: String,
    pub active_generation_task: Mutex<Option<JoinHandle<()>>>,
    pub cancel_event: CancelEvent,
    /// Serializes client-mutating operations: at most one in-flight turn.
    pub turn_lock: tokio::sync::Mutex<()>,
    last_used_at: Mutex<Instant>,
}

impl ChatSession {
    pub fn touch(&self) {
        *self.last_used_at.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.lock().elapsed()
    }

    #[cfg(test)]
    pub fn backdate(&self, age: Duration) {
        *self.last_used_at.lock() = Instant::now() - age;
    }

    fn task_is_running(&self) -> bool {
        self.active_generation_task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionRegistry {
    sessions: tokio::sync::Mutex<HashMap<String, Arc<ChatSession>>>,
    pending_cancels: Mutex<HashSet<String>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            pending_cancels: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve the session for a chat, building a fresh one when the
    /// sandbox, options fingerprint, or transport readiness drifted.
    pub async fn get_or_create(
        &self,
        chat_id: &str,
        sandbox_id: &str,
        options: AgentOptions,
        transport_factory: TransportFactory,
    ) -> Result<Arc<ChatSession>> {
        let mut sessions = self.sessions.lock().await;

        let fingerprint = options_fingerprint(&options);

        if let Some(session) = sessions.get(chat_id).cloned() {
            let reusable = session.sandbox_id == sandbox_id
                && session.config_fingerprint == fingerprint
                && session.transport.is_ready();
            if reusable {
                session.touch();
                return Ok(session);
            }
            tracing::info!(
                chat_id = %chat_id,
                sandbox_id = %sandbox_id,
                "session configuration drifted, restarting"
            );
            sessions.remove(chat_id);
            close_session(&session).await;
        }

        let session =
            create_session(chat_id, sandbox_id, fingerprint, options, transport_factory).await?;
        sessions.insert(chat_id.to_string(), session.clone());
        session.touch();
        Ok(session)
    }

    pub async fn get_session(&self, chat_id: &str) -> Option<Arc<ChatSession>> {
        self.sessions.lock().await.get(chat_id).cloned()
    }

    /// Flag the chat for cancellation, set the session's cancel event, and
    /// interrupt the agent.  Interrupt failures are logged and swallowed.
    pub async fn cancel_generation(&self, chat_id: &str) {
        self.pending_cancels.lock().insert(chat_id.to_string());

        let session = match self.get_session(chat_id).await {
            Some(session) => session,
            None => return,
        };
        session.cancel_event.set();
        if let Err(e) = session.client.interrupt().await {
            tracing::debug!(chat_id = %chat_id, error = %e, "interrupt failed");
        }
    }

    /// One-shot: true at most once per `cancel_generation` that preceded
    /// the turn.
    pub fn consume_pending_cancel(&self, chat_id: &str) -> bool {
        self.pending_cancels.lock().remove(chat_id)
    }

    pub async fn terminate(&self, chat_id: &str) {
        let session = self.sessions.lock().await.remove(chat_id);
        if let Some(session) = session {
            close_session(&session).await;
        }
    }

    pub async fn terminate_all(&self) {
        let sessions: Vec<_> = {
            let mut map = self.sessions.lock().await;
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            close_session(&session).await;
        }
    }

    /// Evict sessions idle for at least `ttl` whose generation task is
    /// absent or finished.  Closing happens outside the registry lock.
    pub async fn reap_idle(&self, ttl: Duration) {
        let expired: Vec<Arc<ChatSession>> = {
            let mut sessions = self.sessions.lock().await;
            let expired_ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| !session.task_is_running() && session.idle_for() >= ttl)
                .map(|(chat_id, _)| chat_id.clone())
                .collect();
            expired_ids
                .iter()
                .filter_map(|chat_id| sessions.remove(chat_id))
                .collect()
        };

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "reaping idle chat sessions");
        }
        for session in expired {
            close_session(&session).await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Construction / teardown
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// sha256 over the canonical JSON of the invalidating option subset.
pub fn options_fingerprint(options: &AgentOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(options.fingerprint_source().as_bytes());
    hex::encode(hasher.finalize())
}

async fn create_session(
    chat_id: &str,
    sandbox_id: &str,
    config_fingerprint: String,
    options: AgentOptions,
    transport_factory: TransportFactory,
) -> Result<Arc<ChatSession>> {
    let transport = transport_factory();
    let client = Arc::new(AgentClient::new(options, transport.clone()));

    if let Err(e) = client.connect().await {
        // Unwind both halves before propagating.
        if let Err(disconnect_err) = client.disconnect().await {
            tracing::debug!(chat_id = %chat_id, error = %disconnect_err, "disconnect during unwind failed");
        }
        transport.close().await;
        return Err(e);
    }

    Ok(Arc::new(ChatSession {
        chat_id: chat_id.to_string(),
        sandbox_id: sandbox_id.to_string(),
        transport,
        client,
        config_fingerprint,
        active_generation_task: Mutex::new(None),
        cancel_event: CancelEvent::new(),
        turn_lock: tokio::sync::Mutex::new(()),
        last_used_at: Mutex::new(Instant::now()),
    }))
}

/// (1) cancel the active task and wait up to 5 s, aborting it outright if
/// it does not exit, (2) disconnect the client, (3) close the transport.
/// Every step's errors are logged and swallowed.
async fn close_session(session: &ChatSession) {
    let task = session.active_generation_task.lock().take();
    if let Some(mut task) = task {
        if !task.is_finished() {
            // Cooperative first: the stream loop observes the event and
            // runs its final flush.  A task stuck outside the loop (e.g.
            // blocked sending the prompt) is torn down forcefully.
            session.cancel_event.set();
            match tokio::time::timeout(TASK_CANCEL_TIMEOUT, &mut task).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::debug!(
                        chat_id = %session.chat_id,
                        "timed out waiting for task cancellation, aborting"
                    );
                    task.abort();
                }
            }
        }
    }

    if let Err(e) = session.client.disconnect().await {
        tracing::debug!(chat_id = %session.chat_id, error = %e, "error disconnecting session");
    }

    session.transport.close().await;
}
