//! Sandbox transports: a uniform stdio channel to an agent process running
//! inside a pre-existing sandbox (a container or a pod).
//!
//! Both backends share [`core::TransportCore`]: a bounded stdout channel,
//! readiness and stdin flags, the recorded exit status, and the supervisory
//! task handles.  The backend owns only substrate wiring: how to attach,
//! how channels are demultiplexed, how liveness is observed.

pub mod core;
pub mod docker;
pub mod k8s;

use async_trait::async_trait;
use sc_domain::{Error, Result};

/// Observer invoked with each decoded stderr chunk.
pub type StderrObserver = std::sync::Arc<dyn Fn(&str) + Send + Sync>;

/// A bidirectional line-delimited channel to an agent process in a sandbox.
///
/// Implementations are shared behind `Arc`; all operations take `&self`.
/// Stdin has a single logical writer: `send` serializes concurrent callers
/// internally so partial writes never interleave.
#[async_trait]
pub trait SandboxTransport: Send + Sync {
    /// Attach to the sandbox and launch the agent process.  Starts the
    /// reader and monitor tasks.  Fails with [`Error::Connection`] when the
    /// sandbox is unreachable, missing, or the launch fails.
    async fn connect(&self) -> Result<()>;

    fn is_ready(&self) -> bool;

    /// Append bytes to the agent's stdin.
    async fn send(&self, data: &str) -> Result<()>;

    /// Next decoded stdout chunk.  `None` terminates the sequence once the
    /// channel closed or the process exited; the sequence never restarts.
    async fn recv_chunk(&self) -> Option<String>;

    /// Half-close stdin.  Backends that cannot half-close perform the
    /// closest no-op equivalent.
    async fn close_stdin(&self) -> Result<()>;

    /// Tear everything down: supervisory tasks, the child process, the
    /// underlying channel.  Idempotent.
    async fn close(&self);

    /// The terminal error recorded by the monitor, if the process exited
    /// nonzero or disappeared.
    fn exit_error(&self) -> Option<Error>;
}
