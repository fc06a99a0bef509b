//! Pod-exec transport.
//!
//! Execs into a pre-existing pod over the Kubernetes attach protocol (a
//! websocket multiplexing stdin/stdout/stderr/error with a one-byte channel
//! prefix; the demultiplexing is delegated to kube's attach client, so
//! channel selection stays confined to the reader wiring below).
//!
//! Pod exec honors neither `user` nor a working directory, so the agent is
//! launched through a shell wrapper that exports the environment, changes
//! directory, then `exec`s the CLI.  Every interpolated value is
//! single-quoted.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, AttachedProcess};
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use sc_domain::options::AgentOptions;
use sc_domain::{Error, Result};

use crate::core::{shell_quote, ExitReason, TransportCore};
use crate::{SandboxTransport, StderrObserver};

const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const DEFAULT_CONTAINER: &str = "agent";

type StdinWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct K8sInner {
    stdin: Option<StdinWriter>,
    /// Held so the attach websocket stays open for the session's lifetime.
    attached: Option<AttachedProcess>,
}

pub struct K8sSandboxTransport {
    core: Arc<TransportCore>,
    container: String,
    namespace: Option<String>,
    stderr: Option<StderrObserver>,
    inner: tokio::sync::Mutex<K8sInner>,
}

impl K8sSandboxTransport {
    pub fn new(
        sandbox_id: impl Into<String>,
        options: AgentOptions,
        stderr: Option<StderrObserver>,
    ) -> Self {
        Self {
            core: Arc::new(TransportCore::new(sandbox_id, options)),
            container: DEFAULT_CONTAINER.into(),
            namespace: None,
            stderr,
            inner: tokio::sync::Mutex::new(K8sInner::default()),
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    fn resolve_namespace(&self) -> String {
        if let Some(ns) = &self.namespace {
            return ns.clone();
        }
        namespace_from_serviceaccount()
    }

    /// `export K='v' … && cd '<cwd>' && exec <agent-command>`.
    fn build_shell_command(&self) -> String {
        let (envs, cwd, _user) = self.core.prepare_environment();
        let mut parts: Vec<String> = Vec::new();
        if !envs.is_empty() {
            let exports: Vec<String> = envs
                .iter()
                .map(|(k, v)| format!("{k}={}", shell_quote(v)))
                .collect();
            parts.push(format!("export {}", exports.join(" ")));
        }
        parts.push(format!("cd {}", shell_quote(&cwd)));
        parts.push(format!("exec {}", self.core.build_agent_command()));
        parts.join(" && ")
    }

    fn spawn_stdout_reader(
        &self,
        mut stdout: impl tokio::io::AsyncRead + Unpin + Send + 'static,
        tx: tokio::sync::mpsc::Sender<String>,
    ) {
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "pod exec stdout reader error");
                        break;
                    }
                }
            }
            // tx drops here: the sentinel for recv_chunk.
        });
        self.core.track_task(handle);
    }

    fn spawn_stderr_reader(
        &self,
        mut stderr_stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) {
        let observer = self.stderr.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match stderr_stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Some(observer) = &observer {
                            observer(&String::from_utf8_lossy(&buf[..n]));
                        }
                    }
                }
            }
        });
        self.core.track_task(handle);
    }

    fn spawn_monitor(
        &self,
        status: impl std::future::Future<Output = Option<Status>> + Send + 'static,
    ) {
        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            match status.await {
                Some(status) => {
                    if status.status.as_deref() != Some("Success") {
                        core.record_exit(ExitReason::Exited(exit_code_from_status(&status)));
                    }
                }
                None => {
                    core.record_exit(ExitReason::Lost("exec status channel closed".into()));
                }
            }
            core.set_ready(false);
        });
        self.core.track_task(handle);
    }
}

fn namespace_from_serviceaccount() -> String {
    namespace_from_file(NAMESPACE_FILE)
}

fn namespace_from_file(path: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(ns) => ns.trim().to_string(),
        Err(_) => "default".into(),
    }
}

/// The error channel's final status document carries the exit code as a
/// cause with reason `ExitCode`.
fn exit_code_from_status(status: &Status) -> i64 {
    status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.trim().parse::<i64>().ok())
        .unwrap_or(-1)
}

#[async_trait]
impl SandboxTransport for K8sSandboxTransport {
    async fn connect(&self) -> Result<()> {
        if self.core.is_ready() {
            return Ok(());
        }
        self.core.mark_stdin_open();
        self.core.clear_exit();

        let client = Client::try_default()
            .await
            .map_err(|e| Error::Connection(format!("failed to load K8s config: {e}")))?;
        let namespace = self.resolve_namespace();
        let pods: Api<Pod> = Api::namespaced(client, &namespace);

        let shell = self.build_shell_command();
        let params = AttachParams::default()
            .container(self.container.clone())
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .tty(false);

        let mut attached = pods
            .exec(self.core.sandbox_id(), ["bash", "-c", shell.as_str()], &params)
            .await
            .map_err(|e| {
                Error::Connection(format!(
                    "failed to exec into pod {}: {e}",
                    self.core.sandbox_id()
                ))
            })?;

        let stdout = attached
            .stdout()
            .ok_or_else(|| Error::Connection("pod exec stdout unavailable".into()))?;
        let stdin = attached
            .stdin()
            .ok_or_else(|| Error::Connection("pod exec stdin unavailable".into()))?;
        let status = attached
            .take_status()
            .ok_or_else(|| Error::Connection("pod exec status unavailable".into()))?;

        let tx = self.core.open_stdout_channel().await;
        self.spawn_stdout_reader(stdout, tx);
        if let Some(stderr_stream) = attached.stderr() {
            self.spawn_stderr_reader(stderr_stream);
        }
        self.spawn_monitor(status);

        let mut inner = self.inner.lock().await;
        inner.stdin = Some(Box::new(stdin));
        inner.attached = Some(attached);
        drop(inner);

        self.core.set_ready(true);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    async fn send(&self, data: &str) -> Result<()> {
        if let Some(err) = self.core.exit_error() {
            return Err(err);
        }
        if self.core.stdin_closed() {
            return Err(Error::Connection("stdin is closed".into()));
        }
        let mut inner = self.inner.lock().await;
        let stdin = inner
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Connection("websocket not available".into()))?;
        stdin
            .write_all(data.as_bytes())
            .await
            .map_err(|e| Error::Connection(format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Connection(format!("stdin flush failed: {e}")))?;
        Ok(())
    }

    async fn recv_chunk(&self) -> Option<String> {
        self.core.recv_chunk().await
    }

    async fn close_stdin(&self) -> Result<()> {
        // Pod exec cannot half-close stdin; an empty write is the closest
        // equivalent, and the flag stops further sends at this layer.
        let mut inner = self.inner.lock().await;
        if let Some(stdin) = inner.stdin.as_mut() {
            let _ = stdin.write_all(b"").await;
            let _ = stdin.flush().await;
        }
        self.core.mark_stdin_closed();
        Ok(())
    }

    async fn close(&self) {
        self.core.set_ready(false);
        self.core.abort_tasks();

        let mut inner = self.inner.lock().await;
        inner.stdin = None;
        // Dropping the attached process closes the websocket.
        inner.attached = None;
    }

    fn exit_error(&self) -> Option<Error> {
        self.core.exit_error()
    }
}
