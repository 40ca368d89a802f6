//! Graceful shutdown.
//!
//! The first stop request stops the source and starts draining: no new
//! frames are accepted, and the pipeline waits for the queue to empty. A
//! second request while draining abandons the wait. Either way the queue
//! sender is then dropped and every worker is joined, so a frame already
//! taken by a worker is always finished.

use crate::queue::FrameSender;
use crate::source::SourceControl;
use crate::worker::{WorkerPool, WorkerStatsSnapshot};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

/// Default interval between queue length checks while draining.
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Process exit code after a forced abort (128 + SIGINT).
pub const EXIT_ABORTED: i32 = 130;

/// Lifecycle phase of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Running = 0,
    Draining = 1,
    Terminated = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

/// How draining ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue emptied.
    Drained,

    /// A second stop request cut the wait short.
    Aborted,
}

impl DrainOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Drained => 0,
            Self::Aborted => EXIT_ABORTED,
        }
    }
}

/// Coordinates stop requests, draining and worker shutdown.
///
/// Shared behind an `Arc` with the signal handler.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    phase: AtomicU8,
    stop_requests: AtomicU8,
    forced: AtomicBool,
    control: SourceControl,
    poll_interval: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator that stops the source behind `control`.
    pub fn new(control: SourceControl, poll_interval: Duration) -> Self {
        Self {
            phase: AtomicU8::new(Phase::Running as u8),
            stop_requests: AtomicU8::new(0),
            forced: AtomicBool::new(false),
            control,
            poll_interval,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Whether a second stop request forced an abort.
    pub fn is_aborted(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Handle an interrupt.
    ///
    /// The first request stops the source; a second request forces an abort
    /// if the pipeline has not terminated yet. Draining entered without a
    /// request does not count.
    pub fn request_stop(&self) {
        if self.phase() == Phase::Terminated {
            return;
        }

        let requests = self
            .stop_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)))
            .unwrap_or(u8::MAX)
            .saturating_add(1);

        if requests == 1 {
            tracing::info!("Shutdown signal received, stopping gracefully...");
            let _ = self.transition(Phase::Running, Phase::Draining);
            self.control.stop();
        } else if !self.forced.swap(true, Ordering::SeqCst) {
            tracing::warn!("Second shutdown signal received, aborting drain");
        }
    }

    /// Enter draining without a signal, e.g. when the source ended.
    pub fn begin_drain(&self) {
        if self.transition(Phase::Running, Phase::Draining).is_ok() {
            tracing::info!("Draining queue");
            self.control.stop();
        }
    }

    /// Wait until `pending()` reports an empty queue or an abort is forced.
    pub fn drain<P>(&self, pending: P) -> DrainOutcome
    where
        P: Fn() -> usize,
    {
        self.begin_drain();

        loop {
            if self.is_aborted() {
                let left = pending();
                tracing::warn!("Drain aborted with {} frames still queued", left);
                return DrainOutcome::Aborted;
            }

            let left = pending();
            if left == 0 {
                tracing::info!("Queue drained");
                return DrainOutcome::Drained;
            }

            tracing::info!("Draining: {} frames left", left);
            thread::sleep(self.poll_interval);
        }
    }

    /// Close the queue and join every worker.
    ///
    /// Workers finish whatever is still queued before they exit.
    pub fn terminate(&self, sender: FrameSender, pool: WorkerPool) -> WorkerStatsSnapshot {
        drop(sender);
        tracing::info!("Waiting for {} workers to finish...", pool.size());
        let stats = pool.join();
        self.phase.store(Phase::Terminated as u8, Ordering::SeqCst);
        tracing::info!("All workers stopped");
        stats
    }

    fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(Phase::from_u8)
    }
}
