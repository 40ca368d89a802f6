//! Shared test doubles.

use crate::cursor::CursorTracker;
use crate::membership::MembershipCache;
use crate::publish::{OutputQueue, Publisher};
use crate::worker::{WorkerContext, WorkerStats};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const MEMBER: &str = "did:plc:member";

/// Publisher that keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(OutputQueue, serde_json::Value)>>,
    delay: Option<Duration>,
    fail_queue: Option<OutputQueue>,
    panic_on_publish: bool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before recording each message.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail every publish to `queue`.
    pub fn failing(queue: OutputQueue) -> Self {
        Self {
            fail_queue: Some(queue),
            ..Self::default()
        }
    }

    /// Panic on every publish.
    pub fn panicking() -> Self {
        Self {
            panic_on_publish: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<(OutputQueue, serde_json::Value)> {
        self.messages.lock().clone()
    }

    pub fn on(&self, queue: OutputQueue) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .iter()
            .filter(|(q, _)| *q == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, queue: OutputQueue, body: &str) -> Result<()> {
        if self.panic_on_publish {
            panic!("publisher exploded");
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail_queue == Some(queue) {
            return Err(Error::Publish("queue unavailable".to_string()));
        }
        let value = serde_json::from_str(body)?;
        self.messages.lock().push((queue, value));
        Ok(())
    }
}

/// A worker context whose only member is [`MEMBER`].
pub fn context(publisher: Arc<RecordingPublisher>) -> WorkerContext {
    WorkerContext {
        cursor: Arc::new(CursorTracker::new()),
        members: Arc::new(MembershipCache::from_members([MEMBER])),
        publisher,
        stats: Arc::new(WorkerStats::default()),
    }
}
