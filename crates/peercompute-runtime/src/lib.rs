//! Container runtime port.
//!
//! The scheduler talks to whatever container engine is present through this
//! narrow trait; the Docker implementation shells out to the docker CLI and
//! enforces the isolation policy on every container it starts. Alternate
//! engines (containerd, gVisor) plug in here.

pub mod docker;
pub mod policy;

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

pub use docker::DockerRuntime;
pub use policy::SecurityPolicy;

/// Label marking containers managed by this daemon
pub const MANAGED_LABEL: &str = "peercompute.managed";
/// Label storing the deployment id
pub const DEPLOYMENT_ID_LABEL: &str = "peercompute.deployment-id";
/// Label storing the requester's peer id
pub const REQUESTER_ID_LABEL: &str = "peercompute.requester-id";

/// Graceful stop timeout before the container is killed
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime not available: {0}")]
    NotAvailable(String),

    #[error("failed to pull image {image}: {message}")]
    Pull { image: String, message: String },

    #[error("failed to start container: {0}")]
    Start(String),

    #[error("failed to stop container: {0}")]
    Stop(String),

    #[error("failed to read logs: {0}")]
    Logs(String),

    #[error("failed to inspect container: {0}")]
    Inspect(String),

    #[error("security policy violation: {0}")]
    Policy(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Everything the runtime needs to start one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub deployment_id: String,
    pub requester_id: String,
    pub image: String,
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
    /// Container port published on 127.0.0.1 (0 = not published)
    pub expose_port: u16,
    pub environment: BTreeMap<String, String>,
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit: u64,
}

/// A container found via the managed label, used by crash cleanup.
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub id: String,
    pub deployment_id: Option<String>,
    pub requester_id: Option<String>,
}

/// Byte stream of container logs. Holds the producing child process so the
/// pipe stays open for as long as the stream is read.
pub struct LogStream {
    child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
}

impl LogStream {
    pub(crate) fn new(
        mut child: tokio::process::Child,
    ) -> RuntimeResult<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Logs("log process has no stdout".into()))?;
        Ok(LogStream { child, stdout })
    }

    /// Terminate the underlying log process.
    pub async fn shutdown(mut self) {
        let _ = self.child.kill().await;
    }
}

impl AsyncRead for LogStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

/// The narrow contract between the scheduler and the container engine.
#[async_trait]
pub trait RuntimePort: Send + Sync {
    /// Liveness check; called once at startup and by health probes.
    async fn ping(&self) -> RuntimeResult<()>;

    /// Pull an image. Idempotent, blocking, honors cancellation.
    async fn pull(&self, image: &str, cancel: &CancellationToken) -> RuntimeResult<()>;

    /// Start a container, returning the engine's container handle.
    async fn run(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    /// Stop and remove a container, graceful up to `timeout`, then forced.
    async fn stop(&self, handle: &str, timeout: Duration) -> RuntimeResult<()>;

    /// Stream container logs.
    async fn logs(&self, handle: &str, follow: bool, tail: Option<usize>)
        -> RuntimeResult<LogStream>;

    /// Current resource usage.
    async fn stats(&self, handle: &str) -> RuntimeResult<ContainerStats>;

    /// Whether the container process is still alive; used by the watchdog.
    async fn is_running(&self, handle: &str) -> RuntimeResult<bool>;

    /// All containers carrying the managed label, including those left over
    /// from a previous daemon run.
    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedContainer>>;

    /// Stop and remove every managed container. Called once on shutdown and
    /// for crash cleanup at startup.
    async fn cleanup_all(&self) -> RuntimeResult<()>;
}
