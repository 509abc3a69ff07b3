//! Launching the worker process and draining its stderr.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::ipc::error::IpcError;

/// A freshly spawned worker with its pipes taken out.
pub struct SpawnedWorker {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn the configured worker with piped stdio.
///
/// The child is killed if its handle is dropped, so a client that goes away
/// without disconnecting does not orphan the worker.
///
/// # Errors
///
/// Returns `IpcError::Spawn` if the program cannot be started or a pipe
/// is unavailable.
pub fn spawn_worker(config: &WorkerConfig) -> Result<SpawnedWorker, IpcError> {
    info!("Starting worker: {} {}", config.command, config.args.join(" "));

    let mut command = Command::new(&config.command);
    command
        .args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &config.working_dir {
        command.current_dir(dir);
    }

    let spawn_error = |source: std::io::Error| IpcError::Spawn {
        command: config.command.clone(),
        source,
    };

    let mut child = command.spawn().map_err(spawn_error)?;

    let missing_pipe = |name: &str| {
        spawn_error(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("{} pipe unavailable after spawn", name),
        ))
    };
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    debug!(pid = ?child.id(), "Worker process spawned");

    Ok(SpawnedWorker {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Forward the worker's stderr to the log, one line at a time.
///
/// Stderr is diagnostic text only and is never parsed as protocol.
pub fn drain_stderr(stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => warn!(target: "worker_stderr", "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!("Stopped reading worker stderr: {}", e);
                    break;
                }
            }
        }
    })
}

/// Stop a worker whose stdin has already been closed.
///
/// Waits up to `grace` for a clean exit, then kills it.
pub async fn shutdown_worker(mut child: Child, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Worker exited cleanly: {}", status);
            return;
        }
        Ok(Err(e)) => {
            warn!("Error waiting for worker: {}", e);
        }
        Err(_) => {
            warn!("Worker didn't exit within {:?}, killing", grace);
        }
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to kill worker: {}", e);
    }
}
