//! Container-exec transport.
//!
//! Attaches to a pre-existing container (started if stopped), launches the
//! agent CLI through `docker exec`, and demultiplexes the attached stream's
//! tagged stdout/stderr records.  Liveness is observed by polling the
//! exec-inspect endpoint every 500 ms.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, LogOutput, StartContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use sc_domain::options::AgentOptions;
use sc_domain::{Error, Result};

use crate::core::{ExitReason, TransportCore};
use crate::{SandboxTransport, StderrObserver};

const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct DockerConfig {
    /// Daemon address; `None` uses the local defaults (unix socket).
    pub host: Option<String>,
}

type StdinWriter = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Default)]
struct DockerInner {
    docker: Option<Docker>,
    exec_id: Option<String>,
    stdin: Option<StdinWriter>,
}

pub struct DockerSandboxTransport {
    core: Arc<TransportCore>,
    config: DockerConfig,
    stderr: Option<StderrObserver>,
    inner: tokio::sync::Mutex<DockerInner>,
}

impl DockerSandboxTransport {
    pub fn new(
        sandbox_id: impl Into<String>,
        config: DockerConfig,
        options: AgentOptions,
        stderr: Option<StderrObserver>,
    ) -> Self {
        Self {
            core: Arc::new(TransportCore::new(sandbox_id, options)),
            config,
            stderr,
            inner: tokio::sync::Mutex::new(DockerInner::default()),
        }
    }

    fn connect_docker(&self) -> Result<Docker> {
        let result = match self.config.host.as_deref() {
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        };
        result.map_err(|e| Error::Connection(format!("failed to connect to Docker: {e}")))
    }

    /// Resolve the sandbox container, starting it when stopped.
    async fn ensure_container_running(&self, docker: &Docker) -> Result<()> {
        let name = self.core.sandbox_id();
        let info = docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::Connection(format!("failed to connect to sandbox {name}: {e}")))?;

        let running = info.state.as_ref().and_then(|s| s.running).unwrap_or(false);
        if !running {
            docker
                .start_container(name, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| Error::Connection(format!("failed to start sandbox {name}: {e}")))?;
        }
        Ok(())
    }

    fn spawn_reader(
        &self,
        mut output: Pin<
            Box<dyn futures_util::Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>,
        >,
        tx: tokio::sync::mpsc::Sender<String>,
    ) {
        let stderr = self.stderr.clone();
        let handle = tokio::spawn(async move {
            while let Some(record) = output.next().await {
                match record {
                    Ok(LogOutput::StdOut { message }) => {
                        let chunk = String::from_utf8_lossy(&message).into_owned();
                        if tx.send(chunk).await.is_err() {
                            break;
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        if let Some(observer) = &stderr {
                            observer(&String::from_utf8_lossy(&message));
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "exec stream reader error");
                        break;
                    }
                }
            }
            // tx drops here: the sentinel for recv_chunk.
        });
        self.core.track_task(handle);
    }

    fn spawn_monitor(&self, docker: Docker, exec_id: String) {
        let core = self.core.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(MONITOR_POLL_INTERVAL).await;
                if !core.is_ready() {
                    break;
                }
                match docker.inspect_exec(&exec_id).await {
                    Err(e) => {
                        core.record_exit(ExitReason::Lost(format!(
                            "agent process disappeared: {e}"
                        )));
                        break;
                    }
                    Ok(info) => {
                        if info.running != Some(true) {
                            let exit_code = info.exit_code.unwrap_or(-1);
                            if exit_code != 0 {
                                core.record_exit(ExitReason::Exited(exit_code));
                            }
                            break;
                        }
                    }
                }
            }
            core.set_ready(false);
        });
        self.core.track_task(handle);
    }
}

/// SIGKILL the exec'd process group, as root, via a second exec.
async fn kill_exec_process(docker: &Docker, container: &str, exec_id: &str) {
    let info = match docker.inspect_exec(exec_id).await {
        Ok(info) => info,
        Err(_) => return,
    };
    if info.running != Some(true) {
        return;
    }
    let Some(pid) = info.pid else { return };

    let options = CreateExecOptions::<String> {
        cmd: Some(vec!["/bin/kill".into(), "-KILL".into(), format!("-{pid}")]),
        user: Some("root".into()),
        ..Default::default()
    };
    match docker.create_exec(container, options).await {
        Ok(exec) => {
            let start = StartExecOptions { detach: true, ..Default::default() };
            if let Err(e) = docker.start_exec(&exec.id, Some(start)).await {
                tracing::debug!(error = %e, "failed to kill exec process");
            }
        }
        Err(e) => tracing::debug!(error = %e, "failed to kill exec process"),
    }
}

#[async_trait]
impl SandboxTransport for DockerSandboxTransport {
    async fn connect(&self) -> Result<()> {
        if self.core.is_ready() {
            return Ok(());
        }
        self.core.mark_stdin_open();
        self.core.clear_exit();

        let docker = self.connect_docker()?;
        self.ensure_container_running(&docker).await?;

        let (envs, cwd, user) = self.core.prepare_environment();
        let env: Vec<String> = envs.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let options = CreateExecOptions::<String> {
            cmd: Some(vec![
                "bash".into(),
                "-c".into(),
                format!("exec {}", self.core.build_agent_command()),
            ]),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            env: Some(env),
            working_dir: Some(cwd),
            user,
            ..Default::default()
        };

        let exec = docker
            .create_exec(self.core.sandbox_id(), options)
            .await
            .map_err(|e| Error::Connection(format!("failed to start agent CLI: {e}")))?;

        let started = docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| Error::Connection(format!("failed to start agent CLI: {e}")))?;

        let (output, input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(Error::Connection("exec started detached; no stream".into()))
            }
        };

        let tx = self.core.open_stdout_channel().await;
        self.spawn_reader(output, tx);
        self.spawn_monitor(docker.clone(), exec.id.clone());

        let mut inner = self.inner.lock().await;
        inner.docker = Some(docker);
        inner.exec_id = Some(exec.id);
        inner.stdin = Some(input);
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
            .ok_or_else(|| Error::Connection("stream not available".into()))?;
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
        let mut inner = self.inner.lock().await;
        if let Some(stdin) = inner.stdin.as_mut() {
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "stdin shutdown failed");
            }
        }
        self.core.mark_stdin_closed();
        Ok(())
    }

    async fn close(&self) {
        self.core.set_ready(false);
        self.core.abort_tasks();

        let mut inner = self.inner.lock().await;
        if let (Some(docker), Some(exec_id)) = (inner.docker.clone(), inner.exec_id.clone()) {
            kill_exec_process(&docker, self.core.sandbox_id(), &exec_id).await;
        }
        inner.stdin = None;
        inner.exec_id = None;
        inner.docker = None;
    }

    fn exit_error(&self) -> Option<Error> {
        self.core.exit_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_before_connect_fails_closed() {
        let transport = DockerSandboxTransport::new(
            "box-1",
            DockerConfig::default(),
            AgentOptions::default(),
            None,
        );
        let err = transport.send("hello\n").await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(!transport.is_ready());
    }

    #[tokio::test]
    async fn send_surfaces_recorded_exit_error() {
        let transport = DockerSandboxTransport::new(
            "box-1",
            DockerConfig::default(),
            AgentOptions::default(),
            None,
        );
        transport.core.record_exit(ExitReason::Exited(2));
        match transport.send("x").await {
            Err(Error::Process { exit_code }) => assert_eq!(exit_code, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_after_close_stdin_fails() {
        let transport = DockerSandboxTransport::new(
            "box-1",
            DockerConfig::default(),
            AgentOptions::default(),
            None,
        );
        transport.close_stdin().await.unwrap();
        assert!(matches!(transport.send("x").await, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = DockerSandboxTransport::new(
            "box-1",
            DockerConfig::default(),
            AgentOptions::default(),
            None,
        );
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_ready());
    }
}
