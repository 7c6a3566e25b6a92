//! The archiver: the external compressor process reading every named pipe
//!
//! In pipe mode the compressor is started with `-FI` so it reads the FIFOs
//! until EOF instead of skipping them, and `-` so the archive goes to stdout.
//! Both output streams are drained by dedicated threads from the moment the
//! process starts; a compressor blocked on a full stdout pipe would otherwise
//! stop reading its inputs and stall every feeder behind it.

use crate::config::PipelineConfig;
use crate::error::{PipeZipError, Result};
use crate::liveness::Signal;
use crate::orchestrator::{Participant, Status};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Read size of the output drains
const DRAIN_CHUNK: usize = 64 * 1024;

/// Build the compressor arguments for pipe mode
///
/// `-q` quiet, `-D` no directory entries, `-nw` no wildcard expansion,
/// `-FI` read FIFOs, `-<level>` compression level, `-` write to stdout.
pub fn pipe_mode_args(compression_level: u32, names: &[String]) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-q", "-D", "-nw", "-FI"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(OsString::from(format!("-{compression_level}")));
    args.push(OsString::from("-"));
    args.extend(names.iter().map(OsString::from));
    args
}

/// Run the compressor synchronously (non-pipe mode), capturing its output
///
/// Only used for environment self-tests; builds always go through [`Archiver::start`].
pub fn run_sync(config: &PipelineConfig, args: &[&str], dir: &Path) -> io::Result<Output> {
    Command::new(&config.program)
        .args(&config.leading_args)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
}

/// How the archiver process ended
#[derive(Debug)]
enum Exit {
    Status(ExitStatus),
    TimedOut(Duration),
    Lost(String),
}

/// One output stream being drained on its own thread
struct Drain {
    result: Receiver<io::Result<Vec<u8>>>,
}

impl Drain {
    fn spawn<R: Read + Send + 'static>(stream: R, label: &str, signal: Signal) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::Builder::new()
            .name(format!("pipe-zip-{label}"))
            .spawn(move || {
                let result = drain(stream, &signal);
                signal.exited();
                let _ = tx.send(result);
            })?;
        Ok(Self { result: rx })
    }

    /// Wait for the stream to hit EOF, at most `limit` when given
    fn collect(&self, limit: Option<Duration>) -> io::Result<Vec<u8>> {
        let result = match limit {
            None => self.result.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(limit) => self.result.recv_timeout(limit),
        };
        match result {
            Ok(output) => output,
            Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "output stream was not closed",
            )),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::Other,
                "output drain thread panicked",
            )),
        }
    }
}

fn drain<R: Read>(mut stream: R, signal: &Signal) -> io::Result<Vec<u8>> {
    let mut output = Vec::new();
    let mut buffer = vec![0u8; DRAIN_CHUNK];
    loop {
        match stream.read(&mut buffer) {
            Ok(0) => return Ok(output),
            Ok(n) => {
                output.extend_from_slice(&buffer[..n]);
                signal.activity();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// The running compressor process
pub struct Archiver {
    command: String,
    child: Child,
    started: Instant,
    timeout: Option<Duration>,
    stdout: Drain,
    stderr: Drain,
    exit: Option<Exit>,
}

impl Archiver {
    /// Spawn the compressor in pipe mode and return immediately
    pub(crate) fn start(
        config: &PipelineConfig,
        names: &[String],
        dir: &Path,
        signal: Signal,
    ) -> Result<Self> {
        let args = pipe_mode_args(config.compression_level, names);
        let command = render_command(config, &args);

        let spawned = Command::new(&config.program)
            .args(&config.leading_args)
            .args(&args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return Err(PipeZipError::ProcessFailure {
                    participant: Participant::Archiver,
                    command,
                    code: None,
                    reason: format!("failed to start: {e}"),
                    stderr: String::new(),
                })
            }
        };

        let drains = take_streams(&mut child).and_then(|(stdout, stderr)| {
            Ok((
                Drain::spawn(stdout, "stdout", signal.clone())?,
                Drain::spawn(stderr, "stderr", signal)?,
            ))
        });
        let (stdout, stderr) = match drains {
            Ok(drains) => drains,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PipeZipError::ProcessFailure {
                    participant: Participant::Archiver,
                    command,
                    code: None,
                    reason: format!("failed to capture output: {e}"),
                    stderr: String::new(),
                });
            }
        };

        debug!(command = %command, pid = child.id(), "started archiver");

        Ok(Self {
            command,
            child,
            started: Instant::now(),
            timeout: config.build_timeout,
            stdout,
            stderr,
            exit: None,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Check for termination, enforcing the build timeout
    pub(crate) fn service(&mut self) -> Status {
        if self.exit.is_some() {
            return Status::Terminated;
        }

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(status = %status, "archiver exited");
                self.exit = Some(Exit::Status(status));
                Status::Terminated
            }
            Ok(None) => match self.timeout {
                Some(limit) if self.started.elapsed() >= limit => {
                    warn!(timeout = ?limit, "archiver timed out, killing it");
                    self.reap_killed();
                    self.exit = Some(Exit::TimedOut(limit));
                    Status::Terminated
                }
                _ => Status::Running,
            },
            Err(e) => {
                self.reap_killed();
                self.exit = Some(Exit::Lost(format!("failed to query status: {e}")));
                Status::Terminated
            }
        }
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exit.is_some()
    }

    /// Exited on its own with status 0
    pub(crate) fn succeeded(&self) -> bool {
        matches!(&self.exit, Some(Exit::Status(status)) if status.success())
    }

    /// Poll until the process exits or `deadline` passes
    pub(crate) fn wait_until(&mut self, deadline: Instant) -> bool {
        while self.service() == Status::Running {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    /// Stop a still running process
    pub(crate) fn kill(&mut self) {
        if self.exit.is_none() {
            self.reap_killed();
            self.exit = Some(Exit::Lost("killed after another participant failed".to_string()));
        }
    }

    fn reap_killed(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Collect the archive of a terminated archiver
    pub(crate) fn finish(mut self) -> Result<Vec<u8>> {
        if self.exit.is_none() {
            let status = self.child.wait()?;
            self.exit = Some(Exit::Status(status));
        }

        if !self.succeeded() {
            return Err(self.into_failure(None));
        }

        let stdout = self.stdout.collect(None)?;
        let stderr = self.stderr.collect(None)?;
        if !stderr.is_empty() {
            debug!(stderr = %String::from_utf8_lossy(&stderr).trim(), "archiver stderr");
        }
        Ok(stdout)
    }

    /// Build the error describing this archiver's failure
    ///
    /// Waits at most `grace` for the captured stderr when given.
    pub(crate) fn into_failure(mut self, grace: Option<Duration>) -> PipeZipError {
        self.kill();

        let (code, reason) = match &self.exit {
            Some(Exit::Status(status)) => (status.code(), describe_status(status)),
            Some(Exit::TimedOut(limit)) => (None, format!("timed out after {limit:?}")),
            Some(Exit::Lost(reason)) => (None, reason.clone()),
            None => (None, "did not terminate".to_string()),
        };
        let stderr = self
            .stderr
            .collect(grace)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();

        PipeZipError::ProcessFailure {
            participant: Participant::Archiver,
            command: self.command,
            code,
            reason,
            stderr,
        }
    }
}

impl std::fmt::Debug for Archiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archiver")
            .field("command", &self.command)
            .field("exit", &self.exit)
            .finish()
    }
}

fn take_streams(child: &mut Child) -> io::Result<(ChildStdout, ChildStderr)> {
    let missing = || io::Error::new(io::ErrorKind::Other, "output pipe missing");
    let stdout = child.stdout.take().ok_or_else(missing)?;
    let stderr = child.stderr.take().ok_or_else(missing)?;
    Ok((stdout, stderr))
}

fn render_command(config: &PipelineConfig, args: &[OsString]) -> String {
    std::iter::once(&config.program)
        .chain(config.leading_args.iter())
        .chain(args.iter())
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(unix)]
fn describe_status(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("killed by signal {signal}"),
        (None, None) => status.to_string(),
    }
}

#[cfg(not(unix))]
fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => status.to_string(),
    }
}
