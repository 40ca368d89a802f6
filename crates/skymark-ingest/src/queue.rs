//! Bounded work queue between the dispatcher and the workers.
//!
//! A single producer (the dispatcher) and many consumers (the workers) share
//! one `crossbeam_channel::bounded` channel. `send` blocks while the queue is
//! full, which pushes backpressure into the stream reader. Dropping the
//! sender is the terminate signal: workers finish whatever is still queued
//! and then see a disconnected channel.

use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use skymark_core::Frame;

/// Default queue capacity in frames.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Create a bounded work queue.
pub fn work_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (FrameSender { tx }, FrameReceiver { rx })
}

/// Producer half, owned by the dispatcher.
#[derive(Debug)]
pub struct FrameSender {
    tx: Sender<Frame>,
}

impl FrameSender {
    /// Enqueue a frame, blocking while the queue is full.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).map_err(|_| Error::QueueClosed)
    }

    /// Frames currently waiting.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// Whether no frames are waiting.
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }
}

/// Consumer half, cloned into every worker.
#[derive(Debug, Clone)]
pub struct FrameReceiver {
    rx: Receiver<Frame>,
}

impl FrameReceiver {
    /// Block until a frame arrives. `None` once the sender is dropped and
    /// the queue is empty.
    pub fn recv(&self) -> Option<Frame> {
        self.rx.recv().ok()
    }

    /// Frames currently waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no frames are waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
