//! Resume cursor sampling.
//!
//! Workers record a recently processed stream sequence number so a
//! reconnect can resume near where the stream left off. Only every
//! [`CURSOR_SAMPLE_INTERVAL`]th sequence number is recorded, and the stored
//! value never moves backwards even though workers finish out of order.

use std::sync::atomic::{AtomicI64, Ordering};

/// Sequence numbers divisible by this are recorded.
pub const CURSOR_SAMPLE_INTERVAL: i64 = 20;

/// Lock-free holder of the last sampled sequence number.
#[derive(Debug, Default)]
pub struct CursorTracker {
    seq: AtomicI64,
}

impl CursorTracker {
    /// Create an unset tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a processed sequence number.
    ///
    /// Returns `true` if it was sampled and advanced the cursor.
    pub fn observe(&self, seq: i64) -> bool {
        if seq <= 0 || seq % CURSOR_SAMPLE_INTERVAL != 0 {
            return false;
        }
        self.seq.fetch_max(seq, Ordering::AcqRel) < seq
    }

    /// The last sampled sequence number, if any.
    pub fn get(&self) -> Option<i64> {
        match self.seq.load(Ordering::Acquire) {
            0 => None,
            seq => Some(seq),
        }
    }
}
