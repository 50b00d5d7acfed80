//! Container runtime adapter.
//!
//! Abstracts the container engine behind the `ContainerRuntime` trait so the
//! executor is agnostic of the underlying technology, and so tests can run
//! against a fake. The Docker implementation lives in `docker/`.

pub mod docker;
mod lines;
mod path;

#[cfg(test)]
pub mod fake;

pub use lines::LineAssembler;
pub use path::{WorkspacePathMap, WORKSPACE_ROOT};

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Error type for runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Container provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("Image pull failed: {0}")]
    ImagePull(String),

    #[error("Path {0:?} is outside the project working tree")]
    PathOutsideWorkspace(PathBuf),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// A bind mount into the build container
#[derive(Debug, Clone)]
pub struct MountSpec {
    /// Source path on the host
    pub source: PathBuf,
    /// Target path in the container
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to provision one build container
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub image: String,
    /// Container name; unique per build
    pub name: String,
    pub mounts: Vec<MountSpec>,
    pub env: HashMap<String, String>,
    /// Mount the host engine socket (Docker-in-Docker)
    pub allow_host_engine: bool,
}

/// Handle to a provisioned container
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

/// Which output stream a line arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamChannel {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamChannel::Stdout => write!(f, "stdout"),
            StreamChannel::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of command output
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub channel: StreamChannel,
    pub line: String,
}

/// How stdin is wired for an exec'd command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdinMode {
    /// No stdin; the command reads EOF immediately
    #[default]
    None,
    /// Attach stdin to the exec stream
    Inherit,
}

/// A command to run inside a provisioned container
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub cmd: String,
    pub args: Vec<String>,
    /// Path rule for this build's working tree
    pub workspace: WorkspacePathMap,
    /// Host-side working directory; translated by the workspace path rule
    pub workdir: PathBuf,
    pub env: HashMap<String, String>,
    pub stdin: StdinMode,
    /// Per-exec deadline inherited from the build
    pub deadline: Duration,
}

/// Trait defining the container runtime interface.
///
/// Operations that remove state (`stop`, `remove`) are idempotent: a missing
/// container is success, not an error.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a container bound to a long-running no-op process so later
    /// exec calls have a stable target
    async fn provision(&self, spec: &ProvisionSpec) -> RuntimeResult<ContainerHandle>;

    /// Run a command, streaming line-delimited output into `output`.
    /// Returns the exit code. Cancellation and deadline expiry kill the
    /// exec'd process tree and close the stream.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        spec: &ExecSpec,
        output: mpsc::Sender<OutputLine>,
        ctx: CancellationToken,
    ) -> RuntimeResult<i64>;

    /// Probe tool availability inside the container
    async fn which(&self, handle: &ContainerHandle, cmd: &str) -> RuntimeResult<bool>;

    /// Stop the container, allowing a short grace period
    async fn stop(&self, handle: &ContainerHandle) -> RuntimeResult<()>;

    /// Remove the container and its anonymous volumes
    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()>;
}
