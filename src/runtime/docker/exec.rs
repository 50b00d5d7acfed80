//! Command execution with streamed output

use std::time::Duration;

use bollard::container::{KillContainerOptions, LogOutput};
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::runtime::{
    ContainerHandle, ExecSpec, LineAssembler, OutputLine, RuntimeError, RuntimeResult,
    StreamChannel,
};

use super::DockerRuntime;

/// How long to keep polling for an exit code after the output stream closes,
/// so trailing engine-side buffers are captured
const QUENCH_DELAY: Duration = Duration::from_secs(5);

const QUENCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Run a command inside the container, pushing each completed output line
/// into `output`. Returns the exit code.
///
/// The working directory is translated through the workspace path rule
/// before it reaches the engine. On cancellation or deadline expiry the
/// container is SIGKILLed, taking the exec's process tree with it.
pub async fn run(
    runtime: &DockerRuntime,
    handle: &ContainerHandle,
    spec: &ExecSpec,
    output: mpsc::Sender<OutputLine>,
    ctx: CancellationToken,
) -> RuntimeResult<i64> {
    // The workdir must live inside the build's working tree
    let container_workdir = spec.workspace.to_container(&spec.workdir)?;

    let env_vars: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let mut cmd = Vec::with_capacity(spec.args.len() + 1);
    cmd.push(spec.cmd.clone());
    cmd.extend(spec.args.iter().cloned());

    let exec = {
        let _slot = runtime.engine_slot().await;
        runtime
            .docker()
            .create_exec(
                &handle.name,
                CreateExecOptions {
                    attach_stdin: Some(spec.stdin == crate::runtime::StdinMode::Inherit),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(container_workdir),
                    env: Some(env_vars),
                    cmd: Some(cmd),
                    ..Default::default()
                },
            )
            .await
            .map_err(RuntimeError::Docker)?
    };

    let results = runtime
        .docker()
        .start_exec(&exec.id, None)
        .await
        .map_err(RuntimeError::Docker)?;

    let StartExecResults::Attached { output: mut stream, .. } = results else {
        return Err(RuntimeError::Other("exec started detached".into()));
    };

    let mut stdout_lines = LineAssembler::new();
    let mut stderr_lines = LineAssembler::new();

    let deadline = tokio::time::sleep(spec.deadline);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                kill_container(runtime, handle).await;
                return Err(RuntimeError::Cancelled);
            }
            _ = &mut deadline => {
                warn!(container = %handle.name, cmd = %spec.cmd, "Exec deadline exceeded");
                kill_container(runtime, handle).await;
                return Err(RuntimeError::Timeout);
            }
            chunk = stream.next() => {
                match chunk {
                    Some(Ok(LogOutput::StdOut { message })) => {
                        for line in stdout_lines.push(&message) {
                            send_line(&output, StreamChannel::Stdout, line).await;
                        }
                    }
                    Some(Ok(LogOutput::StdErr { message })) => {
                        for line in stderr_lines.push(&message) {
                            send_line(&output, StreamChannel::Stderr, line).await;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        // At most one partial line can be lost on an
                        // abnormal break; flush what we have first.
                        warn!(container = %handle.name, "Error reading exec output: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // Flush trailing partial lines from both channels
    if let Some(line) = stdout_lines.finish() {
        send_line(&output, StreamChannel::Stdout, line).await;
    }
    if let Some(line) = stderr_lines.finish() {
        send_line(&output, StreamChannel::Stderr, line).await;
    }

    wait_exit_code(runtime, &exec.id).await
}

/// Probe whether a command is available inside the container
pub async fn which(
    runtime: &DockerRuntime,
    handle: &ContainerHandle,
    cmd: &str,
) -> RuntimeResult<bool> {
    let _slot = runtime.engine_slot().await;

    let exec = runtime
        .docker()
        .create_exec(
            &handle.name,
            CreateExecOptions {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("command -v {}", shell_words::quote(cmd)),
                ]),
                ..Default::default()
            },
        )
        .await
        .map_err(RuntimeError::Docker)?;

    let results = runtime
        .docker()
        .start_exec(&exec.id, None)
        .await
        .map_err(RuntimeError::Docker)?;

    if let StartExecResults::Attached { mut output, .. } = results {
        // Drain; the probe's output is irrelevant
        while output.next().await.is_some() {}
    }

    let code = wait_exit_code(runtime, &exec.id).await?;
    Ok(code == 0)
}

/// Exit-code retrieval with a bounded quench window after stream close
async fn wait_exit_code(runtime: &DockerRuntime, exec_id: &str) -> RuntimeResult<i64> {
    let quench = tokio::time::Instant::now() + QUENCH_DELAY;

    loop {
        let inspect = runtime
            .docker()
            .inspect_exec(exec_id)
            .await
            .map_err(RuntimeError::Docker)?;

        if inspect.running != Some(true) {
            let code = inspect.exit_code.unwrap_or(-1);
            debug!(exec_id, code, "Exec finished");
            return Ok(code);
        }

        if tokio::time::Instant::now() >= quench {
            return Err(RuntimeError::Other(format!(
                "exec {} still running after output stream closed",
                exec_id
            )));
        }

        tokio::time::sleep(QUENCH_POLL_INTERVAL).await;
    }
}

/// Kill the whole container; exec processes have no narrower kill surface
/// in the engine API
async fn kill_container(runtime: &DockerRuntime, handle: &ContainerHandle) {
    let options = KillContainerOptions { signal: "SIGKILL" };
    match runtime
        .docker()
        .kill_container(&handle.name, Some(options))
        .await
    {
        Ok(_) => debug!("Killed container {}", handle.name),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }) => {}
        Err(e) => warn!("Failed to kill container {}: {}", handle.name, e),
    }
}

async fn send_line(output: &mpsc::Sender<OutputLine>, channel: StreamChannel, line: String) {
    // A closed receiver means the build is being torn down; dropping the
    // line is correct.
    let _ = output.send(OutputLine { channel, line }).await;
}
