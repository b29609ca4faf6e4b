use anvil_core::{Action, AnvilError, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a finished subprocess left behind. A non-zero exit code is not an
/// error at this layer; the executor decides how to report it.
#[derive(Debug)]
pub struct SpawnOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl SpawnOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run the action's command under the execution root with exactly the
/// declared environment, capturing stdio into scoped buffers. Honors the
/// per-action timeout and the build-wide cancellation token; both shut the
/// subprocess down with SIGTERM followed, after the grace period, by
/// SIGKILL.
pub async fn run_command(
    action: &Action,
    root: &Path,
    grace: Duration,
    cancel: &CancellationToken,
) -> Result<SpawnOutcome> {
    let argv = &action.command;
    debug_assert!(!argv.is_empty(), "middleman actions are not spawned");

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .env_clear()
        .envs(&action.env)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| AnvilError::SpawnFailed {
        action: action.action_ref(),
        message: e.to_string(),
    })?;

    // Drain stdio concurrently with the wait so a chatty action cannot
    // deadlock on a full pipe.
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    enum Interrupt {
        TimedOut,
        Cancelled,
    }

    let timeout = action.timeout();
    // The wait future borrows the child; arm bodies stay free of it so the
    // borrow ends with the select, before the shutdown path runs.
    let waited = tokio::select! {
        status = child.wait() => Ok(status),
        _ = sleep_or_forever(timeout) => Err(Interrupt::TimedOut),
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
    };
    let status = match waited {
        Ok(status) => status.map_err(AnvilError::from)?,
        Err(Interrupt::TimedOut) => {
            warn!(action = %action.action_ref(), "action timed out; terminating");
            shutdown(&mut child, grace).await;
            return Err(AnvilError::Timeout {
                action: action.action_ref(),
                after: timeout.unwrap_or_default(),
            });
        }
        Err(Interrupt::Cancelled) => {
            debug!(action = %action.action_ref(), "build cancelled; terminating action");
            shutdown(&mut child, grace).await;
            return Err(AnvilError::Cancelled);
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    Ok(SpawnOutcome {
        code: status.code(),
        signal,
        stdout,
        stderr,
    })
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending::<()>().await,
    }
}

/// SIGTERM, then SIGKILL once the grace period expires.
async fn shutdown(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.kill().await;
}

/// The last portion of a stdio stream, for failure summaries.
pub fn tail(buf: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(buf);
    let mut start = text.len().saturating_sub(max);
    // Avoid splitting a character.
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    text[start..].to_string()
}
