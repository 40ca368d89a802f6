//! Per-frame dispatch on the source thread.
//!
//! The dispatcher is the callback a [`FrameSource`](crate::source::FrameSource)
//! runs for every frame. It does three things, outermost first:
//!
//! 1. refreshes the membership cache when the refresh interval has elapsed
//! 2. measures the incoming frame rate
//! 3. forwards the latest sampled cursor to the source and enqueues the frame
//!
//! The gates are driven by the clock reading taken for each frame, so they
//! only fire while frames are arriving.

use crate::cursor::CursorTracker;
use crate::membership::{FollowsSource, MembershipRefresher};
use crate::queue::FrameSender;
use crate::source::SourceControl;
use crate::Result;
use skymark_core::Frame;
use skymark_core::metrics::{increment, set_gauge};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default interval between membership refreshes.
pub const DEFAULT_MEMBERSHIP_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Default rate measurement window.
pub const DEFAULT_MEASURE_INTERVAL: Duration = Duration::from_secs(10);

/// Membership refresher as held by the dispatcher.
pub type DynRefresher = MembershipRefresher<Arc<dyn FollowsSource>>;

/// Fires once per `interval`.
#[derive(Debug, Clone)]
pub struct RefreshGate {
    interval: Duration,
    last: Instant,
}

impl RefreshGate {
    /// Create a gate that last fired at `now`.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last: now,
        }
    }

    /// Whether the interval has elapsed; if so, restart it from `now`.
    pub fn tick(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// Counts frames and reports a per-second rate once per window.
#[derive(Debug, Clone)]
pub struct RateMeter {
    interval: Duration,
    count: u64,
    start: Instant,
}

impl RateMeter {
    /// Create a meter whose first window starts at `now`.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            count: 0,
            start: now,
        }
    }

    /// Count one frame. Returns the rate when a window closes.
    pub fn record(&mut self, now: Instant) -> Option<u64> {
        self.count += 1;
        if now.saturating_duration_since(self.start) < self.interval {
            return None;
        }

        let rate = self.count / self.interval.as_secs().max(1);
        self.count = 0;
        self.start = now;
        Some(rate)
    }
}

/// Routes frames from the source into the work queue.
pub struct IngestDispatcher {
    sender: FrameSender,
    cursor: Arc<CursorTracker>,
    control: SourceControl,
    refresher: Option<DynRefresher>,
    refresh_gate: RefreshGate,
    rate_meter: RateMeter,
    last_reported_cursor: Option<i64>,
    frames_dispatched: u64,
}

impl IngestDispatcher {
    /// Create a dispatcher with default gate intervals.
    pub fn new(sender: FrameSender, cursor: Arc<CursorTracker>, control: SourceControl) -> Self {
        let now = Instant::now();
        Self {
            sender,
            cursor,
            control,
            refresher: None,
            refresh_gate: RefreshGate::new(DEFAULT_MEMBERSHIP_REFRESH_INTERVAL, now),
            rate_meter: RateMeter::new(DEFAULT_MEASURE_INTERVAL, now),
            last_reported_cursor: None,
            frames_dispatched: 0,
        }
    }

    /// Refresh membership through `refresher` every `interval`.
    ///
    /// The first refresh is expected to have happened already.
    pub fn with_refresher(mut self, refresher: DynRefresher, interval: Duration) -> Self {
        self.refresher = Some(refresher);
        self.refresh_gate = RefreshGate::new(interval, Instant::now());
        self
    }

    /// Report the frame rate every `interval`.
    pub fn with_measure_interval(mut self, interval: Duration) -> Self {
        self.rate_meter = RateMeter::new(interval, Instant::now());
        self
    }

    /// Handle a frame using the current time.
    pub fn on_frame(&mut self, frame: Frame) -> Result<bool> {
        self.on_frame_at(frame, Instant::now())
    }

    /// Handle a frame observed at `now`.
    ///
    /// Returns `Ok(false)` once the source has been asked to stop, so no
    /// frames are accepted after a stop request. Blocks while the queue is
    /// full.
    pub fn on_frame_at(&mut self, frame: Frame, now: Instant) -> Result<bool> {
        if !self.control.is_running() {
            return Ok(false);
        }

        if let Some(refresher) = &self.refresher
            && self.refresh_gate.tick(now)
            && let Err(e) = refresher.refresh()
        {
            tracing::warn!("Membership refresh failed, keeping previous snapshot: {}", e);
        }

        if let Some(rate) = self.rate_meter.record(now) {
            tracing::debug!("{} events/s", rate);
            set_gauge("listener_events_per_second", rate as f64);
        }

        let cursor = self.cursor.get();
        if cursor.is_some() && cursor != self.last_reported_cursor {
            if let Some(seq) = cursor {
                self.control.update_cursor(seq);
                set_gauge("listener_cursor", seq as f64);
            }
            self.last_reported_cursor = cursor;
        }

        self.sender.send(frame)?;
        self.frames_dispatched += 1;
        increment("listener_frames_received_total", 1);
        set_gauge("listener_queue_depth", self.sender.len() as f64);
        Ok(true)
    }

    /// Frames waiting in the queue.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// Frames enqueued so far.
    pub fn frames_dispatched(&self) -> u64 {
        self.frames_dispatched
    }

    /// Give up the queue sender. Dropping it lets the workers exit.
    pub fn into_sender(self) -> FrameSender {
        self.sender
    }
}
