//! Helpers for running child processes with timeouts and bounded output.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

/// How long to keep draining output after the child exits. A backgrounded
/// grandchild can hold the pipes open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<Captured>>;

/// Captured child process output.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal (including on timeout).
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Human-readable report: exit status, stdout, stderr, and any truncation or timeout notices.
    pub fn report(&self, label: &str) -> String {
        let mut out = match (self.timed_out, self.exit_code) {
            (true, _) => format!("[{label} timed out]\n"),
            (false, Some(code)) => format!("[{label} exited with code {code}]\n"),
            (false, None) => format!("[{label} terminated by signal]\n"),
        };
        let stdout = self.stdout_lossy();
        if !stdout.trim().is_empty() {
            out.push_str(&stdout);
            if !stdout.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str(&self.stdout_truncated_notice(label));
        let stderr = self.stderr_lossy();
        if !stderr.trim().is_empty() {
            out.push_str(&stderr);
            if !stderr.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str(&self.stderr_truncated_notice(label));
        out
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!("[{label} stdout truncated {} bytes]\n", self.stdout_truncated)
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!("[{label} stderr truncated {} bytes]\n", self.stderr_truncated)
        } else {
            String::new()
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// The child is killed on timeout, and also if the returned future is dropped.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub async fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(std::process::Stdio::piped());
    } else {
        cmd.stdin(std::process::Stdio::null());
    }
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            Some(tokio::spawn(async move {
                child_stdin.write_all(&input).await?;
                child_stdin.shutdown().await
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_capture = SharedCapture::default();
    let stderr_capture = SharedCapture::default();
    let stdout_handle = tokio::spawn(read_stream_limited(
        stdout,
        output_limit_bytes,
        Arc::clone(&stdout_capture),
    ));
    let stderr_handle = tokio::spawn(read_stream_limited(
        stderr,
        output_limit_bytes,
        Arc::clone(&stderr_capture),
    ));

    let mut timed_out = false;
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.context("wait for command")?,
        Err(_) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().await.context("kill command")?;
            child.wait().await.context("wait command after kill")?
        }
    };

    if let Some(handle) = stdin_handle {
        // A child that exits without draining stdin closes the pipe; that is not an error here.
        if let Ok(Err(e)) = handle.await {
            debug!(err = %e, "stdin not fully written");
        }
    }
    let (stdout, stdout_truncated) = drain_output(stdout_handle, &stdout_capture)
        .await
        .context("join stdout")?;
    let (stderr, stderr_truncated) = drain_output(stderr_handle, &stderr_capture)
        .await
        .context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        exit_code: status.code(),
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Wait (bounded by [`DRAIN_GRACE`]) for a reader to hit EOF, then take what it captured.
async fn drain_output(
    mut handle: JoinHandle<Result<()>>,
    capture: &SharedCapture,
) -> Result<(Vec<u8>, usize)> {
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => return Err(anyhow!("output reader task failed: {e}")),
        Err(_) => {
            warn!("output pipe still open after exit, keeping partial output");
            handle.abort();
        }
    }
    let mut captured = capture
        .lock()
        .map_err(|_| anyhow!("output capture lock poisoned"))?;
    let captured = std::mem::take(&mut *captured);
    Ok((captured.bytes, captured.truncated))
}

async fn read_stream_limited<R: AsyncRead + Unpin>(
    mut reader: R,
    limit: usize,
    capture: SharedCapture,
) -> Result<()> {
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await.context("read output")?;
        if n == 0 {
            break;
        }
        let mut captured = capture
            .lock()
            .map_err(|_| anyhow!("output capture lock poisoned"))?;
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(remaining);
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }

    Ok(())
}

/// Build a command from an argv vector.
pub fn command_from_argv(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let output = run_command_with_timeout(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            1024,
        )
        .await
        .expect("run");
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout_lossy(), "out\n");
        assert_eq!(output.stderr_lossy(), "err\n");
        assert!(!output.success());
        assert!(output.report("check").contains("exited with code 3"));
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let output = run_command_with_timeout(
            sh("cat"),
            Some(b"hello".to_vec()),
            Duration::from_secs(10),
            1024,
        )
        .await
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout, b"hello");
    }

    #[tokio::test]
    async fn output_beyond_limit_is_truncated() {
        let output = run_command_with_timeout(
            sh("printf '0123456789'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .await
        .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.report("x").contains("stdout truncated 6 bytes"));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let output = run_command_with_timeout(
            sh("exec sleep 30"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .await
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
        assert!(output.report("slow").contains("timed out"));
    }

    /// Verifies a backgrounded grandchild cannot stall the call.
    ///
    /// The daemon inherits stdout and outlives its parent. Asserts: the call
    /// returns promptly with the parent's output and exit code.
    #[tokio::test]
    async fn backgrounded_daemon_does_not_hold_the_call_open() {
        let started = std::time::Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 30 & echo started"),
            None,
            Duration::from_secs(60),
            1024,
        )
        .await
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout_lossy(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(20));
    }
}
