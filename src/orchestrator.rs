//! Build orchestration: provision pipes, start every participant, keep them
//! all moving until they terminate, then reap and validate
//!
//! ```text
//! Idle -> Provisioning -> Running -> Draining -> Reaping -> Done
//!              \              \           \           \
//!               +--------------+-----------+-----------+--> Failed
//! ```
//!
//! The orchestrating thread never blocks on a single participant. It waits on
//! an event channel fed by every worker (bytes moved, worker exited) with a
//! bounded timeout, then services each participant in turn. The timeout
//! adapts: it restarts at `poll_interval` whenever something moved and doubles
//! up to `max_poll_interval` while the pipeline is quiet. It only bounds how
//! late a process exit or a timeout is noticed.

use crate::archiver::Archiver;
use crate::channel;
use crate::config::{PipelineConfig, MAX_COMPRESSION_LEVEL, MIN_COMPRESSION_LEVEL};
use crate::error::{PipeZipError, Result};
use crate::feeder::{FeedPhase, FeedReport, Feeder};
use crate::liveness::{Backoff, Event, Heartbeat, Signal};
use crate::listing;
use crate::registry::Entry;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A process or worker taking part in a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Participant {
    /// The compressor process
    Archiver,
    /// The worker feeding one entry
    Feeder { entry: String },
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Participant::Archiver => write!(f, "archiver"),
            Participant::Feeder { entry } => write!(f, "feeder for '{}'", entry),
        }
    }
}

/// Result of servicing a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Terminated,
}

/// Build protocol states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    Provisioning,
    Running,
    Draining,
    Reaping,
    Done,
    Failed,
}

/// A finished archive and what went into it
#[derive(Debug, Clone)]
pub struct BuildResult {
    archive: Vec<u8>,
    entries: Vec<FeedReport>,
    elapsed: Duration,
}

impl BuildResult {
    /// The archive bytes
    pub fn archive(&self) -> &[u8] {
        &self.archive
    }

    /// Take the archive bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.archive
    }

    /// One report per entry, in registration order
    pub fn entries(&self) -> &[FeedReport] {
        &self.entries
    }

    /// Uncompressed bytes fed into the archive
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|entry| entry.bytes).sum()
    }

    /// Wall time of the build
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Who brought a build down
#[derive(Debug)]
enum Culprit {
    Archiver,
    Feeder {
        index: usize,
        kind: io::ErrorKind,
        reason: String,
    },
}

/// Drives one build from registered entries to archive bytes
#[derive(Debug)]
pub struct Orchestrator<'a> {
    config: &'a PipelineConfig,
    root: &'a Path,
    state: BuildState,
}

impl<'a> Orchestrator<'a> {
    /// Prepare a build whose participants run inside `root`
    pub fn new(config: &'a PipelineConfig, root: &'a Path) -> Self {
        Self {
            config,
            root,
            state: BuildState::Idle,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    fn transition(&mut self, next: BuildState) {
        debug!(from = ?self.state, to = ?next, "build state");
        self.state = next;
    }

    /// Run the whole build protocol over `entries`
    pub fn run(&mut self, entries: Vec<Entry>) -> Result<BuildResult> {
        let started = Instant::now();

        let level = self.config.compression_level;
        if !(MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&level) {
            self.transition(BuildState::Failed);
            return Err(PipeZipError::ContractViolation(format!(
                "compression level {level} is not supported for named pipe input (expected 1 to 9)"
            )));
        }

        // The compressor refuses to write an archive without inputs
        if entries.is_empty() {
            self.transition(BuildState::Done);
            info!("built empty archive");
            return Ok(BuildResult {
                archive: listing::empty_archive(),
                entries: Vec::new(),
                elapsed: started.elapsed(),
            });
        }

        self.transition(BuildState::Provisioning);
        if let Err(e) = channel::provision(&entries) {
            self.transition(BuildState::Failed);
            return Err(e);
        }

        self.transition(BuildState::Running);
        let (events_tx, events) = crossbeam_channel::unbounded();
        let pipeline = Arc::new(Heartbeat::new(started));
        let cancel = Arc::new(AtomicBool::new(false));
        let names: Vec<String> = entries.iter().map(|entry| entry.name.clone()).collect();

        // Reader first, so it is waiting on the first pipe as the feeders come up
        let signal = Signal::new(Arc::clone(&pipeline), events_tx.clone());
        let mut archiver = match Archiver::start(self.config, &names, self.root, signal) {
            Ok(archiver) => archiver,
            Err(e) => {
                self.transition(BuildState::Failed);
                return Err(e);
            }
        };

        let mut feeders = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let signal = Signal::new(Arc::clone(&pipeline), events_tx.clone());
            match Feeder::start(index, entry, signal, Arc::clone(&cancel)) {
                Ok(feeder) => feeders.push(feeder),
                Err(e) => {
                    self.transition(BuildState::Failed);
                    self.wind_down(&mut archiver, &mut feeders, &cancel, &events);
                    let err = PipeZipError::ProcessFailure {
                        participant: Participant::Feeder {
                            entry: names[index].clone(),
                        },
                        command: format!("feed {}", names[index]),
                        code: None,
                        reason: format!("failed to start: {e}"),
                        stderr: String::new(),
                    };
                    warn!(error = %err, "build failed");
                    return Err(err);
                }
            }
        }
        drop(events_tx);

        self.transition(BuildState::Draining);
        if let Err(culprit) = self.drain(&mut archiver, &mut feeders, &pipeline, &events) {
            return Err(self.fail(culprit, archiver, &mut feeders, &cancel, &events));
        }

        self.transition(BuildState::Reaping);
        let archive = match archiver.finish() {
            Ok(archive) => archive,
            Err(e) => {
                self.transition(BuildState::Failed);
                return Err(e);
            }
        };

        let mut reports = Vec::with_capacity(feeders.len());
        for feeder in feeders {
            let participant = feeder.participant();
            let command = feeder.command().to_string();
            match feeder.into_report() {
                Ok(report) => reports.push(report),
                Err(failure) => {
                    self.transition(BuildState::Failed);
                    return Err(PipeZipError::ProcessFailure {
                        participant,
                        command,
                        code: None,
                        reason: failure.message,
                        stderr: String::new(),
                    });
                }
            }
        }

        if self.config.verify_listing {
            if let Err(e) = listing::verify(&archive, &reports) {
                self.transition(BuildState::Failed);
                return Err(e);
            }
        }

        self.transition(BuildState::Done);
        let result = BuildResult {
            archive,
            entries: reports,
            elapsed: started.elapsed(),
        };
        info!(
            entries = result.entries.len(),
            bytes = result.total_bytes(),
            archive_bytes = result.archive.len(),
            elapsed = ?result.elapsed,
            "built archive"
        );
        Ok(result)
    }

    /// Service every participant until all of them terminated
    fn drain(
        &self,
        archiver: &mut Archiver,
        feeders: &mut [Feeder],
        pipeline: &Heartbeat,
        events: &Receiver<Event>,
    ) -> std::result::Result<(), Culprit> {
        let mut wait = Backoff::new(self.config.poll_interval, self.config.max_poll_interval);

        loop {
            let mut running = 0usize;

            match archiver.service() {
                Status::Running => running += 1,
                Status::Terminated if !archiver.succeeded() => return Err(Culprit::Archiver),
                Status::Terminated => {}
            }

            for (index, feeder) in feeders.iter_mut().enumerate() {
                match feeder.service() {
                    Status::Running => {
                        running += 1;
                        // Nobody will ever open this pipe again
                        if archiver.has_exited() && feeder.phase() == FeedPhase::Waiting {
                            return Err(Culprit::Feeder {
                                index,
                                kind: io::ErrorKind::BrokenPipe,
                                reason: "archiver exited without opening the pipe".to_string(),
                            });
                        }
                    }
                    Status::Terminated => {
                        if let Some(failure) = feeder.failure() {
                            return Err(Culprit::Feeder {
                                index,
                                kind: failure.kind,
                                reason: failure.message.clone(),
                            });
                        }
                    }
                }
            }

            if running == 0 {
                return Ok(());
            }

            if let Some(limit) = self.config.idle_timeout {
                let now = Instant::now();
                if pipeline.idle_for(now) >= limit {
                    // The first unfinished entry is the one the archiver is stuck on
                    if let Some(index) = feeders.iter().position(|f| f.phase() != FeedPhase::Done) {
                        return Err(Culprit::Feeder {
                            index,
                            kind: io::ErrorKind::TimedOut,
                            reason: format!(
                                "stalled: no activity for {:?}",
                                feeders[index].idle_for(now).min(pipeline.idle_for(now))
                            ),
                        });
                    }
                }
            }

            match events.recv_timeout(wait.current()) {
                Ok(_) => {
                    // Coalesce the backlog into this wake-up
                    while events.try_recv().is_ok() {}
                    wait.reset();
                }
                Err(RecvTimeoutError::Timeout) => {
                    wait.next();
                }
                // Every worker is gone; only the process exit is left to observe
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(wait.next()),
            }
        }
    }

    /// Cancel everything, reap what can be reaped and describe the failure
    fn fail(
        &mut self,
        culprit: Culprit,
        mut archiver: Archiver,
        feeders: &mut [Feeder],
        cancel: &AtomicBool,
        events: &Receiver<Event>,
    ) -> PipeZipError {
        self.transition(BuildState::Failed);
        cancel.store(true, Ordering::Release);
        let grace = self.config.abort_grace;
        let deadline = Instant::now() + grace.min(Duration::from_millis(200));

        // A broken pipe usually means the archiver died first; prefer its story
        let culprit = match culprit {
            Culprit::Feeder {
                kind: io::ErrorKind::BrokenPipe,
                ..
            } if archiver.wait_until(deadline) && !archiver.succeeded() =>
            {
                Culprit::Archiver
            }
            other => other,
        };

        self.wind_down(&mut archiver, feeders, cancel, events);

        let err = match culprit {
            Culprit::Archiver => archiver.into_failure(Some(grace)),
            Culprit::Feeder { index, reason, .. } => {
                let feeder = &feeders[index];
                PipeZipError::ProcessFailure {
                    participant: feeder.participant(),
                    command: feeder.command().to_string(),
                    code: None,
                    reason,
                    stderr: String::new(),
                }
            }
        };

        warn!(error = %err, "build failed");
        err
    }

    /// Stop the archiver and give feeders `abort_grace` to notice the cancellation
    ///
    /// Feeders stuck inside a blocking source read are detached.
    fn wind_down(
        &self,
        archiver: &mut Archiver,
        feeders: &mut [Feeder],
        cancel: &AtomicBool,
        events: &Receiver<Event>,
    ) {
        cancel.store(true, Ordering::Release);
        archiver.kill();

        let deadline = Instant::now() + self.config.abort_grace;
        while feeders
            .iter_mut()
            .any(|feeder| feeder.service() == Status::Running)
        {
            if Instant::now() >= deadline {
                break;
            }
            let _ = events.recv_timeout(Duration::from_millis(10));
        }

        for feeder in feeders.iter_mut() {
            if feeder.service() == Status::Running {
                warn!(entry = %feeder.name(), "feeder did not stop in time, detaching it");
                feeder.detach();
            }
        }
    }
}
