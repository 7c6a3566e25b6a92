//! Activity tracking shared between participants and the orchestrator

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wake-up reasons sent to the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// Bytes moved somewhere in the pipeline
    Activity,
    /// A worker thread is about to return
    Exited,
}

/// Last moment a participant moved a byte, as an offset from a shared epoch
#[derive(Debug)]
pub(crate) struct Heartbeat {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl Heartbeat {
    pub(crate) fn new(epoch: Instant) -> Self {
        let heartbeat = Self {
            epoch,
            last_ms: AtomicU64::new(0),
        };
        heartbeat.beat();
        heartbeat
    }

    pub(crate) fn beat(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        let last = self.epoch + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }
}

/// Handle a worker thread uses to report progress
#[derive(Debug, Clone)]
pub(crate) struct Signal {
    own: Arc<Heartbeat>,
    pipeline: Arc<Heartbeat>,
    events: Sender<Event>,
}

impl Signal {
    pub(crate) fn new(pipeline: Arc<Heartbeat>, events: Sender<Event>) -> Self {
        let epoch = pipeline.epoch;
        Self {
            own: Arc::new(Heartbeat::new(epoch)),
            pipeline,
            events,
        }
    }

    pub(crate) fn heartbeat(&self) -> Arc<Heartbeat> {
        Arc::clone(&self.own)
    }

    pub(crate) fn activity(&self) {
        self.own.beat();
        self.pipeline.beat();
        // The orchestrator may already be gone on a failed build
        let _ = self.events.send(Event::Activity);
    }

    pub(crate) fn exited(&self) {
        let _ = self.events.send(Event::Exited);
    }
}

/// Adaptive wait between liveness checks: doubles while idle, resets on activity
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Return the current wait and grow the next one
    pub(crate) fn next(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * 2).min(self.max);
        wait
    }
}
