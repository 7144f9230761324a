//! Helpers for running child processes with timeouts, bounded output, and
//! cooperative interruption.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Cooperative stop flag shared between the executor and process waits.
///
/// Cloning shares the underlying flag. The wait loop polls it so an
/// in-flight engine subprocess can be force-terminated on interrupt.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub interrupted: bool,
}

impl CommandOutput {
    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Run a command with a timeout, capturing stdout/stderr without risking
/// pipe deadlocks. Output is read concurrently while the child runs;
/// `output_limit_bytes` bounds the bytes kept in memory (the pipes are
/// still drained). The wait loop polls `interrupt` between slices and
/// kills the child when a stop is requested.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    interrupt: &InterruptHandle,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(err).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut interrupted = false;
    let status = loop {
        if interrupt.is_stop_requested() {
            warn!("interrupt requested, killing child");
            interrupted = true;
            child.kill().context("kill command")?;
            break child.wait().context("wait command after interrupt")?;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            break child.wait().context("wait command after kill")?;
        }
        let slice = remaining.min(WAIT_SLICE);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, interrupted, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        interrupted,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf hello");
        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(5),
            1000,
            &InterruptHandle::new(),
        )
        .expect("run");

        assert!(output.status.success());
        assert_eq!(output.stdout_utf8(), "hello");
        assert!(!output.timed_out);
        assert!(!output.interrupted);
    }

    #[test]
    fn feeds_stdin_to_child() {
        let mut cmd = Command::new("cat");
        cmd.arg("-");
        let output = run_command_with_timeout(
            cmd,
            Some(b"from stdin"),
            Duration::from_secs(5),
            1000,
            &InterruptHandle::new(),
        )
        .expect("run");
        assert_eq!(output.stdout_utf8(), "from stdin");
    }

    #[test]
    fn times_out_and_kills_slow_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_millis(200),
            1000,
            &InterruptHandle::new(),
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn interrupt_kills_child_before_timeout() {
        let interrupt = InterruptHandle::new();
        interrupt.request_stop();

        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let start = Instant::now();
        let output =
            run_command_with_timeout(cmd, None, Duration::from_secs(10), 1000, &interrupt)
                .expect("run");

        assert!(output.interrupted);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn bounds_captured_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf '%01000d' 7");
        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(5),
            100,
            &InterruptHandle::new(),
        )
        .expect("run");
        assert_eq!(output.stdout.len(), 100);
        assert_eq!(output.stdout_truncated, 900);
    }
}
