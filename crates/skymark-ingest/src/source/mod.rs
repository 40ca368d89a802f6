//! Frame source adapters.
//!
//! A source produces raw [`Frame`]s in delivery order and hands each one to
//! the dispatcher callback on its own thread. Decoding happens later, in the
//! workers.
//!
//! # Available Sources
//!
//! - [`FirehoseSource`] - Live `subscribeRepos` WebSocket stream
//! - [`ReplaySource`] - Length-prefixed frame recordings
//!
//! # Architecture
//!
//! All sources implement [`FrameSource`]. Stopping and cursor hand-off go
//! through a cloneable [`SourceControl`], so the shutdown handler and the
//! dispatcher can reach a source that is busy inside [`FrameSource::run`].

mod firehose;
mod replay;

pub use firehose::{FirehoseConfig, FirehoseSource};
pub use replay::{FrameRecorder, ReplaySource};

use crate::{Error, Result};
use skymark_core::Frame;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// A source of raw firehose frames.
pub trait FrameSource {
    /// Human-readable name for this source (used in logs).
    fn name(&self) -> &'static str;

    /// Handle for stopping the source and passing it resume cursors.
    fn control(&self) -> SourceControl;

    /// Deliver frames until the source ends or is stopped.
    ///
    /// `on_frame` returns `Ok(true)` to continue, `Ok(false)` to stop
    /// gracefully, or `Err` to abort. Non-fatal stream errors (dropped
    /// connections, error frames) are reported through `on_error` and the
    /// source carries on.
    fn run<F, E>(&mut self, on_frame: F, on_error: E) -> Result<SourceStats>
    where
        F: FnMut(Frame) -> Result<bool>,
        E: FnMut(&Error);
}

/// Shared stop flag and resume cursor for a running source.
#[derive(Debug, Clone)]
pub struct SourceControl {
    running: Arc<AtomicBool>,
    cursor: Arc<AtomicI64>,
}

impl SourceControl {
    /// Create a control handle, optionally seeded with a resume cursor.
    pub fn new(start_cursor: Option<i64>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            cursor: Arc::new(AtomicI64::new(start_cursor.unwrap_or(0))),
        }
    }

    /// Ask the source to stop. Takes effect within the source's poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the source should keep delivering frames.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Record the sequence number to resume from on the next connection.
    ///
    /// Never blocks and never affects the current connection.
    pub fn update_cursor(&self, seq: i64) {
        self.cursor.store(seq, Ordering::Release);
    }

    /// The sequence number to resume from, if any.
    pub fn resume_cursor(&self) -> Option<i64> {
        match self.cursor.load(Ordering::Acquire) {
            0 => None,
            seq => Some(seq),
        }
    }
}

/// Statistics from running a frame source.
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    /// Frames handed to the callback.
    pub frames_received: u64,

    /// Payload bytes handed to the callback.
    pub bytes_received: u64,

    /// Successful reconnections after a dropped connection.
    pub reconnects: u64,

    /// Non-fatal errors reported through `on_error`.
    pub stream_errors: u64,

    /// Whether the source stopped because the callback asked it to.
    pub stopped_by_handler: bool,
}
