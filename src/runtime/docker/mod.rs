//! Docker implementation of the container runtime

mod container;
mod exec;

use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::DockerConfiguration;

use super::{
    ContainerHandle, ContainerRuntime, ExecSpec, OutputLine, ProvisionSpec, RuntimeError,
    RuntimeResult,
};

/// Container runtime backed by the Docker Engine API.
///
/// Engine calls go through a small semaphore so a burst of builds cannot
/// overwhelm the host daemon. Works against root or rootless daemons; the
/// socket path comes from configuration.
pub struct DockerRuntime {
    client: Docker,
    /// Bounds concurrent engine API calls
    limiter: Arc<Semaphore>,
}

impl DockerRuntime {
    /// Connect to the engine socket from configuration
    pub fn new(config: &DockerConfiguration) -> RuntimeResult<Self> {
        let client = Docker::connect_with_unix(
            &config.socket_path,
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(RuntimeError::Docker)?;

        Ok(Self {
            client,
            limiter: Arc::new(Semaphore::new(config.engine_concurrency.max(1))),
        })
    }

    /// Wrap an existing client (used by diagnostics)
    pub fn with_client(client: Docker, engine_concurrency: usize) -> Self {
        Self {
            client,
            limiter: Arc::new(Semaphore::new(engine_concurrency.max(1))),
        }
    }

    pub(crate) fn docker(&self) -> &Docker {
        &self.client
    }

    pub(crate) async fn engine_slot(&self) -> tokio::sync::SemaphorePermit<'_> {
        // Closed only on drop, which cannot race an in-flight call
        self.limiter
            .acquire()
            .await
            .unwrap_or_else(|_| unreachable!("engine limiter closed"))
    }

    /// Verify the engine answers; used by the diagnostics command
    pub async fn ping(&self) -> RuntimeResult<()> {
        self.client.ping().await.map_err(RuntimeError::Docker)?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn provision(&self, spec: &ProvisionSpec) -> RuntimeResult<ContainerHandle> {
        container::provision(self, spec).await
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        spec: &ExecSpec,
        output: mpsc::Sender<OutputLine>,
        ctx: CancellationToken,
    ) -> RuntimeResult<i64> {
        exec::run(self, handle, spec, output, ctx).await
    }

    async fn which(&self, handle: &ContainerHandle, cmd: &str) -> RuntimeResult<bool> {
        exec::which(self, handle, cmd).await
    }

    async fn stop(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        container::stop(self, handle).await
    }

    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        container::remove(self, handle).await
    }
}
