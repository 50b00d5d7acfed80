//! Scriptable in-memory runtime for tests.
//!
//! Commands are matched by their shell command line; each match replays
//! scripted output lines and an exit code. Provision/stop/remove calls are
//! recorded so tests can assert teardown ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ContainerHandle, ContainerRuntime, ExecSpec, OutputLine, ProvisionSpec, RuntimeError,
    RuntimeResult, StreamChannel,
};

/// Scripted result for one command
#[derive(Debug, Clone)]
pub struct FakeExec {
    pub exit_code: i64,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Simulated run time; lets tests exercise cancel and deadline paths
    pub delay: Duration,
}

impl FakeExec {
    pub fn success(stdout: &[&str]) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            stderr: Vec::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn failure(exit_code: i64, stderr: &[&str]) -> Self {
        Self {
            exit_code,
            stdout: Vec::new(),
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
            delay: Duration::ZERO,
        }
    }

    pub fn sleeping(delay: Duration) -> Self {
        Self {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            delay,
        }
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    scripted: Mutex<HashMap<String, FakeExec>>,
    pub provisioned: Mutex<Vec<ProvisionSpec>>,
    pub executed: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    fail_provision: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, command: &str, result: FakeExec) {
        self.scripted.lock().insert(command.to_string(), result);
    }

    /// Make the next provision call fail with an infrastructure error
    pub fn fail_provisioning(&self) {
        self.fail_provision.store(true, Ordering::SeqCst);
    }

    fn command_key(spec: &ExecSpec) -> String {
        // Phases run as `sh -c <command>`; key on the command itself
        if spec.cmd == "sh" && spec.args.len() == 2 && spec.args[0] == "-c" {
            spec.args[1].clone()
        } else {
            spec.cmd.clone()
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn provision(&self, spec: &ProvisionSpec) -> RuntimeResult<ContainerHandle> {
        if self.fail_provision.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::ProvisionFailed("engine unavailable".into()));
        }
        self.provisioned.lock().push(spec.clone());
        Ok(ContainerHandle {
            id: format!("fake-{}", spec.name),
            name: spec.name.clone(),
        })
    }

    async fn exec(
        &self,
        _handle: &ContainerHandle,
        spec: &ExecSpec,
        output: mpsc::Sender<OutputLine>,
        ctx: CancellationToken,
    ) -> RuntimeResult<i64> {
        let key = Self::command_key(spec);
        self.executed.lock().push(key.clone());

        let scripted = self
            .scripted
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| FakeExec::success(&[]));

        if scripted.delay > Duration::ZERO {
            if scripted.delay >= spec.deadline {
                tokio::select! {
                    _ = ctx.cancelled() => return Err(RuntimeError::Cancelled),
                    _ = tokio::time::sleep(spec.deadline) => return Err(RuntimeError::Timeout),
                }
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(RuntimeError::Cancelled),
                _ = tokio::time::sleep(scripted.delay) => {}
            }
        }
        if ctx.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        for line in &scripted.stdout {
            let _ = output
                .send(OutputLine {
                    channel: StreamChannel::Stdout,
                    line: line.clone(),
                })
                .await;
        }
        for line in &scripted.stderr {
            let _ = output
                .send(OutputLine {
                    channel: StreamChannel::Stderr,
                    line: line.clone(),
                })
                .await;
        }

        Ok(scripted.exit_code)
    }

    async fn which(&self, _handle: &ContainerHandle, cmd: &str) -> RuntimeResult<bool> {
        Ok(self.scripted.lock().contains_key(cmd))
    }

    async fn stop(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.stopped.lock().push(handle.name.clone());
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> RuntimeResult<()> {
        self.removed.lock().push(handle.name.clone());
        Ok(())
    }
}
