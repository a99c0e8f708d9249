//! Running a test command with a timeout and bounded output capture.
//!
//! On Unix the command leads its own process group. When the leader exits or
//! times out, the whole group is killed, so test runners that fork workers
//! (`npm` -> `sh` -> `node`) cannot outlive their trial or keep the output
//! pipes open.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long output readers may lag behind the exit of the command.
pub const READER_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// A stream was still open after [`READER_GRACE`]; its capture is incomplete.
    pub output_detached: bool,
}

impl CommandOutput {
    /// Render stdout and stderr as a single log document.
    pub fn render_log(&self) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str("\n[killed after timeout]\n");
        }
        if self.output_detached {
            buf.push_str("\n[output still open after exit, capture incomplete]\n");
        }
        buf
    }
}

/// Bytes kept from one stream plus the count of bytes dropped past the limit.
type Captured = (Vec<u8>, usize);

/// Background reader draining one pipe of the child.
struct StreamReader {
    name: &'static str,
    handle: JoinHandle<Result<Captured>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(name: &'static str, pipe: R, limit: usize) -> Self {
        let handle = thread::spawn(move || read_stream_limited(pipe, limit));
        Self { name, handle }
    }

    /// Wait for the reader until `deadline`. `None` means the pipe is still
    /// held open by some process; the thread is left to finish on its own.
    fn finish(self, deadline: Instant) -> Result<Option<Captured>> {
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(stream = self.name, "output pipe still open, detaching reader");
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(10));
        }
        match self.handle.join() {
            Ok(result) => result.map(Some).with_context(|| format!("read {}", self.name)),
            Err(_) => Err(anyhow!("{} reader thread panicked", self.name)),
        }
    }
}

/// Run `cmd` with stdin closed, capturing up to `output_limit_bytes` of each
/// output stream.
///
/// Both pipes are drained while the command runs. A command that outlives
/// `timeout` is killed together with its process group and reaped before
/// this returns. Spawn and wait failures are errors; exit codes are not.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_reader = StreamReader::spawn("stdout", stdout, output_limit_bytes);
    let stderr_reader = StreamReader::spawn("stderr", stderr, output_limit_bytes);

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => {
            kill_stragglers(&child);
            (status, false)
        }
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            kill_tree(&mut child)?;
            (child.wait().context("wait command after kill")?, true)
        }
    };

    let deadline = Instant::now() + READER_GRACE;
    let stdout = stdout_reader.finish(deadline)?;
    let stderr = stderr_reader.finish(deadline)?;
    let output_detached = stdout.is_none() || stderr.is_none();
    let (stdout, stdout_truncated) = stdout.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr.unwrap_or_default();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, output_detached, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        output_detached,
    })
}

/// Kill the command and everything it started.
#[cfg(unix)]
fn kill_tree(child: &mut Child) -> Result<()> {
    match signal_process_group(child.id()) {
        Ok(()) => Ok(()),
        Err(err) => {
            warn!(err = %err, "failed to kill process group, killing leader only");
            child.kill().context("kill command")
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> Result<()> {
    child.kill().context("kill command")
}

/// Processes the command left running in its group after it exited.
#[cfg(unix)]
fn kill_stragglers(child: &Child) {
    if let Err(err) = signal_process_group(child.id()) {
        warn!(err = %err, "failed to kill leftover processes");
    }
}

#[cfg(not(unix))]
fn kill_stragglers(_child: &Child) {}

/// SIGKILL every process in group `pgid`. An already empty group is not an error.
#[cfg(unix)]
#[allow(unsafe_code)]
fn signal_process_group(pgid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| std::io::Error::other(format!("pid {pgid} out of range")))?;
    // SAFETY: killpg takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Captured> {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(kept.len()));
        kept.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }

    Ok((kept, dropped))
}
