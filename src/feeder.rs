//! Feeders: one worker per entry copying its source into the entry's named pipe
//!
//! A feeder never blocks on the pipe. The write end is opened non-blocking
//! (retrying until the archiver opens the read end) and full-pipe writes are
//! retried after a short pause, so a cancelled build always gets its workers
//! back. Only the source itself may block, e.g. a slow network read.

use crate::channel;
use crate::liveness::{Backoff, Heartbeat, Signal};
use crate::orchestrator::{Participant, Status};
use crate::registry::{Entry, EntrySource};
use crc32fast::Hasher as Crc32;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Size of the copy buffer
const CHUNK_SIZE: usize = 64 * 1024;

/// Pause bounds while waiting for the reader to open or drain the pipe
const MIN_RETRY: Duration = Duration::from_millis(1);
const MAX_RETRY: Duration = Duration::from_millis(20);

/// Summary of one successfully fed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedReport {
    /// Archive name
    pub name: String,
    /// Bytes copied into the pipe
    pub bytes: u64,
    /// CRC-32 of the copied bytes
    pub crc32: u32,
}

/// Where a feeder is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedPhase {
    /// Waiting for the archiver to open the pipe
    Waiting = 0,
    /// Pipe open, copying bytes
    Streaming = 1,
    /// Worker returned
    Done = 2,
}

impl FeedPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FeedPhase::Waiting,
            1 => FeedPhase::Streaming,
            _ => FeedPhase::Done,
        }
    }
}

/// Failure of a feeder worker
#[derive(Debug, Clone)]
pub(crate) struct FeedFailure {
    pub kind: io::ErrorKind,
    pub message: String,
}

/// Running or finished feeder owned by the orchestrator
pub struct Feeder {
    name: String,
    command: String,
    phase: Arc<AtomicU8>,
    heartbeat: Arc<Heartbeat>,
    handle: Option<JoinHandle<io::Result<FeedReport>>>,
    outcome: Option<Result<FeedReport, FeedFailure>>,
}

impl Feeder {
    /// Spawn the worker for `entry` and return immediately
    pub(crate) fn start(
        index: usize,
        entry: Entry,
        signal: Signal,
        cancel: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let name = entry.name.clone();
        let command = format!(
            "feed {} <{}> -> {}",
            entry.name,
            entry.source.kind(),
            entry.pipe.display()
        );
        let phase = Arc::new(AtomicU8::new(FeedPhase::Waiting as u8));
        let heartbeat = signal.heartbeat();

        let worker_phase = Arc::clone(&phase);
        let handle = thread::Builder::new()
            .name(format!("pipe-zip-feed-{index}"))
            .spawn(move || {
                let result = feed(entry, &signal, &cancel, &worker_phase);
                worker_phase.store(FeedPhase::Done as u8, Ordering::Release);
                signal.exited();
                result
            })?;

        debug!(entry = %name, "started feeder");

        Ok(Self {
            name,
            command,
            phase,
            heartbeat,
            handle: Some(handle),
            outcome: None,
        })
    }

    /// Archive name this feeder writes
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description of what the worker does, used in error reports
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn participant(&self) -> Participant {
        Participant::Feeder {
            entry: self.name.clone(),
        }
    }

    pub fn phase(&self) -> FeedPhase {
        FeedPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Time since this feeder last moved a byte
    pub fn idle_for(&self, now: Instant) -> Duration {
        self.heartbeat.idle_for(now)
    }

    /// Check for termination and collect the worker's result once it returned
    pub(crate) fn service(&mut self) -> Status {
        if self.outcome.is_some() {
            return Status::Terminated;
        }

        let finished = self
            .handle
            .as_ref()
            .map_or(false, |handle| handle.is_finished());
        if !finished {
            return Status::Running;
        }

        if let Some(handle) = self.handle.take() {
            let outcome = match handle.join() {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(e)) => Err(FeedFailure {
                    kind: e.kind(),
                    message: e.to_string(),
                }),
                Err(_) => Err(FeedFailure {
                    kind: io::ErrorKind::Other,
                    message: "feeder thread panicked".to_string(),
                }),
            };
            self.outcome = Some(outcome);
        }
        Status::Terminated
    }

    /// The failure of a terminated feeder, if it failed
    pub(crate) fn failure(&self) -> Option<&FeedFailure> {
        match &self.outcome {
            Some(Err(failure)) => Some(failure),
            _ => None,
        }
    }

    /// Give up on a worker that did not wind down in time
    pub(crate) fn detach(&mut self) {
        if self.handle.take().is_some() {
            self.outcome = Some(Err(FeedFailure {
                kind: io::ErrorKind::TimedOut,
                message: "worker did not stop and was detached".to_string(),
            }));
        }
    }

    /// Report of a terminated feeder
    pub(crate) fn into_report(self) -> Result<FeedReport, FeedFailure> {
        self.outcome.unwrap_or_else(|| {
            Err(FeedFailure {
                kind: io::ErrorKind::Other,
                message: "feeder still running".to_string(),
            })
        })
    }
}

impl std::fmt::Debug for Feeder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feeder")
            .field("name", &self.name)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Worker body: rewind, open, copy, close
fn feed(
    entry: Entry,
    signal: &Signal,
    cancel: &AtomicBool,
    phase: &AtomicU8,
) -> io::Result<FeedReport> {
    let Entry {
        name,
        pipe,
        mut source,
    } = entry;

    let mut slice: &[u8];
    let reader: &mut dyn Read = match &mut source {
        EntrySource::Bytes(data) => {
            slice = data.as_slice();
            &mut slice
        }
        EntrySource::Stream(stream) => stream,
        EntrySource::Seekable(stream) => {
            stream
                .seek(SeekFrom::Start(0))
                .map_err(|e| context(e, "rewinding source"))?;
            stream
        }
    };

    let mut output = open_pipe(&pipe, cancel)?;
    phase.store(FeedPhase::Streaming as u8, Ordering::Release);
    signal.activity();
    trace!(entry = %name, "pipe opened by reader");

    let mut crc = Crc32::new();
    let mut bytes = 0u64;
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        check_cancelled(cancel)?;

        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(context(e, "reading source")),
        };

        crc.update(&buffer[..read]);
        bytes += read as u64;

        write_chunk(&mut output, &buffer[..read], signal, cancel)
            .map_err(|e| context(e, "writing pipe"))?;
    }

    output.flush().map_err(|e| context(e, "writing pipe"))?;
    drop(output);

    let report = FeedReport {
        name,
        bytes,
        crc32: crc.finalize(),
    };
    debug!(entry = %report.name, bytes = report.bytes, "feeder finished");
    Ok(report)
}

/// Open the pipe's write end once the archiver holds the read end
fn open_pipe(pipe: &Path, cancel: &AtomicBool) -> io::Result<File> {
    let mut retry = Backoff::new(MIN_RETRY, MAX_RETRY);
    loop {
        check_cancelled(cancel)?;
        match channel::try_open_writer(pipe) {
            Ok(Some(file)) => return Ok(file),
            Ok(None) => thread::sleep(retry.next()),
            Err(e) => return Err(context(e, "opening pipe")),
        }
    }
}

/// Write a whole chunk to a non-blocking pipe
fn write_chunk(
    output: &mut File,
    mut data: &[u8],
    signal: &Signal,
    cancel: &AtomicBool,
) -> io::Result<()> {
    let mut retry = Backoff::new(MIN_RETRY, MAX_RETRY);
    while !data.is_empty() {
        match output.write(data) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "pipe accepted no bytes",
                ))
            }
            Ok(n) => {
                data = &data[n..];
                retry.reset();
                signal.activity();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                check_cancelled(cancel)?;
                thread::sleep(retry.next());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn check_cancelled(cancel: &AtomicBool) -> io::Result<()> {
    if cancel.load(Ordering::Acquire) {
        Err(io::Error::new(io::ErrorKind::Interrupted, "build cancelled"))
    } else {
        Ok(())
    }
}

fn context(err: io::Error, what: &str) -> io::Error {
    io::Error::new(err.kind(), format!("{what}: {err}"))
}
