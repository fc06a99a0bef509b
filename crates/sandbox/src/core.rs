//! State and helpers shared by every transport backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sc_domain::options::AgentOptions;
use sc_domain::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Stdout channel capacity.  The reader task blocks on a full channel, so
/// a slow consumer backpressures the agent's stdout.
const STDOUT_CHANNEL_CAPACITY: usize = 256;

/// Why the agent process is gone.
#[derive(Debug, Clone)]
pub enum ExitReason {
    /// The process exited with a nonzero code.
    Exited(i64),
    /// The process or its exec record disappeared.
    Lost(String),
}

/// Backend-independent transport state.
pub struct TransportCore {
    sandbox_id: String,
    options: AgentOptions,
    ready: AtomicBool,
    stdin_closed: AtomicBool,
    exit: Mutex<Option<ExitReason>>,
    stdout_rx: tokio::sync::Mutex<Option<mpsc::Receiver<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransportCore {
    pub fn new(sandbox_id: impl Into<String>, options: AgentOptions) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            options,
            ready: AtomicBool::new(false),
            stdin_closed: AtomicBool::new(false),
            exit: Mutex::new(None),
            stdout_rx: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    // ── readiness / stdin flags ─────────────────────────────────────

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_stdin_open(&self) {
        self.stdin_closed.store(false, Ordering::Release);
    }

    pub fn mark_stdin_closed(&self) {
        self.stdin_closed.store(true, Ordering::Release);
    }

    pub fn stdin_closed(&self) -> bool {
        self.stdin_closed.load(Ordering::Acquire)
    }

    // ── exit status ─────────────────────────────────────────────────

    /// Record the terminal exit reason.  First writer wins.
    pub fn record_exit(&self, reason: ExitReason) {
        let mut slot = self.exit.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    pub fn clear_exit(&self) {
        *self.exit.lock() = None;
    }

    pub fn exit_error(&self) -> Option<Error> {
        self.exit.lock().as_ref().map(|reason| match reason {
            ExitReason::Exited(code) => Error::Process { exit_code: *code },
            ExitReason::Lost(msg) => Error::Connection(msg.clone()),
        })
    }

    // ── stdout channel ──────────────────────────────────────────────

    /// Install a fresh stdout channel and hand the sender to the reader
    /// task.  Dropping the sender (reader exit or abort) is the sequence
    /// sentinel: `recv_chunk` then yields `None` forever.
    pub async fn open_stdout_channel(&self) -> mpsc::Sender<String> {
        let (tx, rx) = mpsc::channel(STDOUT_CHANNEL_CAPACITY);
        *self.stdout_rx.lock().await = Some(rx);
        tx
    }

    pub async fn recv_chunk(&self) -> Option<String> {
        let mut guard = self.stdout_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    // ── supervisory tasks ───────────────────────────────────────────

    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub fn abort_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    // ── launch helpers ──────────────────────────────────────────────

    /// Environment, working directory and user for the agent process.
    pub fn prepare_environment(&self) -> (BTreeMap<String, String>, String, Option<String>) {
        (
            self.options.env.clone(),
            self.options.cwd.clone(),
            self.options.user.clone(),
        )
    }

    /// The agent CLI invocation, launched as `bash -c 'exec <command>'`.
    pub fn build_agent_command(&self) -> String {
        let mut cmd = String::from(
            "claude --input-format stream-json --output-format stream-json --verbose",
        );

        if let Some(model) = self.options.model.as_deref() {
            if !model.is_empty() {
                cmd.push_str(&format!(" --model {}", shell_quote(model)));
            }
        }
        if !self.options.permission_mode.is_empty() {
            cmd.push_str(&format!(
                " --permission-mode {}",
                shell_quote(&self.options.permission_mode)
            ));
        }
        if let serde_json::Value::String(prompt) = &self.options.system_prompt {
            cmd.push_str(&format!(" --system-prompt {}", shell_quote(prompt)));
        }
        if !self.options.disallowed_tools.is_empty() {
            cmd.push_str(&format!(
                " --disallowed-tools {}",
                shell_quote(&self.options.disallowed_tools.join(","))
            ));
        }
        if self.options.continue_conversation {
            cmd.push_str(" --continue");
        }

        cmd
    }
}

/// Single-quote a string for safe shell interpolation (`'` → `'\''`).
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
