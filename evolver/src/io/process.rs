//! Helpers for running child processes with timeouts and bounded output.

use std::io::{ErrorKind, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stdout followed by stderr, lossily decoded.
    ///
    /// The engine splits its diagnostics across both streams, so parsers see
    /// them as one text.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&self.stderr));
        }
        text
    }
}

/// True when `err` comes from spawning a program that does not exist.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == ErrorKind::NotFound)
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is fed and output is read on helper threads while the child runs.
/// `output_limit_bytes` bounds the amount of stdout/stderr stored in memory
/// (bytes beyond this are discarded while still draining the pipe).
///
/// On unix the child leads its own process group. On timeout the whole group
/// is killed and `timed_out` is set. Processes left behind by the child that
/// still hold the output pipes after [`PIPE_GRACE`] are killed too, so the
/// call returns within `timeout` plus a bounded grace period.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
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
    let pid = child.id();

    let stdin_done = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let result = match child_stdin.write_all(&input) {
                    // The child may exit without reading its input.
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
                    other => other,
                };
                let _ = tx.send(result);
            });
            Some(rx)
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

    let stdout_reader = StreamReader::spawn("stdout", stdout, output_limit_bytes);
    let stderr_reader = StreamReader::spawn("stderr", stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(pid);
            if let Err(e) = child.kill() {
                debug!(err = %e, "kill after group kill failed");
            }
            child.wait().context("wait command after kill")?
        }
    };

    finish_readers(pid, [&stdout_reader, &stderr_reader])?;

    if let Some(rx) = stdin_done {
        match rx.recv_timeout(PIPE_GRACE) {
            Ok(Ok(())) => {}
            Ok(Err(e)) if timed_out => debug!(err = %e, "stdin write interrupted by timeout"),
            Ok(Err(e)) => return Err(e).context("write stdin"),
            Err(RecvTimeoutError::Timeout) => warn!("stdin writer still blocked; detaching"),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("stdin writer thread panicked"));
            }
        }
    }

    let (stdout, stdout_truncated) = stdout_reader.take();
    let (stderr, stderr_truncated) = stderr_reader.take();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// How long output pipes may stay open after the child has exited.
pub const PIPE_GRACE: Duration = Duration::from_secs(2);

/// Wait for both readers to hit EOF.
///
/// Pipes still open at the deadline belong to leftover processes of the
/// child's group; those are killed and the readers get one more grace period
/// before they are detached with whatever they captured.
fn finish_readers(pid: u32, readers: [&StreamReader; 2]) -> Result<()> {
    let mut open = wait_readers(&readers, Instant::now() + PIPE_GRACE)?;
    if open.is_empty() {
        return Ok(());
    }
    warn!(pid, "output pipes still open after exit; killing leftover processes");
    kill_process_group(pid);
    open = wait_readers(&open, Instant::now() + PIPE_GRACE)?;
    for reader in open {
        warn!(stream = reader.name, "output reader detached");
    }
    Ok(())
}

/// Readers that did not finish by `deadline`.
fn wait_readers<'a>(readers: &[&'a StreamReader], deadline: Instant) -> Result<Vec<&'a StreamReader>> {
    let mut open = Vec::new();
    for reader in readers {
        match reader
            .done
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            Ok(result) => result.with_context(|| format!("read {}", reader.name))?,
            Err(RecvTimeoutError::Timeout) => open.push(*reader),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("{} reader thread panicked", reader.name));
            }
        }
    }
    Ok(open)
}

/// SIGKILL every process in the group led by `pid`. Best effort.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let group = format!("-{pid}");
    match Command::new("kill")
        .args(["-s", "KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => debug!(pid, "process group killed"),
        // The group is already gone.
        Ok(status) => debug!(pid, code = ?status.code(), "process group kill reported failure"),
        Err(e) => warn!(pid, err = %e, "could not run kill for process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

/// Drains one output pipe on a helper thread into a shared buffer.
struct StreamReader {
    name: &'static str,
    captured: Arc<Mutex<Captured>>,
    done: Receiver<Result<()>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(name: &'static str, reader: R, limit: usize) -> Self {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&captured);
        let (tx, done) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(read_stream_limited(reader, limit, &sink));
        });
        Self {
            name,
            captured,
            done,
        }
    }

    fn take(&self) -> (Vec<u8>, usize) {
        let mut captured = self.captured.lock().unwrap_or_else(PoisonError::into_inner);
        (std::mem::take(&mut captured.bytes), captured.truncated)
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Captured>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = limit.saturating_sub(captured.bytes.len());
        let keep = n.min(remaining);
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.truncated += n - keep;
    }
}
