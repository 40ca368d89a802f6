//! Skymark firehose listener pipeline.
//!
//! This crate consumes the Bluesky repository firehose, picks out image
//! posts written by accounts the bot follows, and routes them to one of two
//! downstream queues for the watermarking service.
//!
//! # Modules
//!
//! - [`source`] - Frame sources (live firehose, recorded replays)
//! - [`dispatcher`] - Per-frame gating, cursor hand-off and enqueueing
//! - [`worker`] - Decode, classify and publish on a pool of threads
//! - [`membership`] - Followed-account set and its refresher
//! - [`classify`] - Alt-text driven post classification
//! - [`publish`] - Queue publishers (SQS, dry run)
//! - [`shutdown`] - Drain-then-terminate shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Frame Source   │  (firehose WebSocket, replay file)
//! └────────┬────────┘
//!          │  dispatcher: membership refresh, rate meter, cursor hand-off
//!          ▼
//! ┌─────────────────┐
//! │   Work Queue    │  Bounded; blocks the source when full
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  Worker Pool    │  Decode commit, classify posts against membership
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   Publisher     │  watermark image queue / watermarking queue
//! └─────────────────┘
//! ```
//!
//! Nothing is persisted: the resume cursor lives in memory and is only used
//! to reconnect within one process lifetime.

pub mod classify;
pub mod config;
pub mod cursor;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod membership;
pub mod publish;
pub mod queue;
pub mod shutdown;
pub mod source;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use classify::{Classification, classify};
pub use config::{Args, InputSource, ListenerConfig, PublishTarget};
pub use cursor::CursorTracker;
pub use dispatcher::IngestDispatcher;
pub use listener::{Listener, ListenerReport};
pub use membership::{BskyFollowsClient, FollowsSource, MembershipCache, MembershipRefresher};
pub use publish::{LogPublisher, OutputQueue, PostDescriptor, Publisher, SqsPublisher};
pub use shutdown::{DrainOutcome, ShutdownCoordinator};
pub use source::{FirehoseConfig, FirehoseSource, FrameSource, ReplaySource, SourceStats};
pub use worker::{WorkerPool, WorkerStatsSnapshot};
