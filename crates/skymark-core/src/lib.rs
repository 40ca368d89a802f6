//! Core types and decoding for the skymark firehose listener.
//!
//! This crate provides:
//! - Firehose frame decoding (DAG-CBOR header + body) into [`StreamMessage`]
//! - CAR block extraction via iroh-car ([`BlockMap`])
//! - AT-URI construction for repository operations ([`AtUri`])
//! - Typed `app.bsky.*` records with `$type` validation ([`Record`])
//! - Prometheus metrics helpers
//! - Shared error types
//!
//! Everything here is pure decoding: no network, no shared state. The
//! ingestion pipeline lives in `skymark-ingest`.

mod aturi;
mod car;
mod error;
mod frame;
pub mod metrics;
mod record;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// XRPC method that streams repository commits.
pub const SUBSCRIBE_REPOS_PATH: &str = "/xrpc/com.atproto.sync.subscribeRepos";

pub use aturi::AtUri;
pub use car::BlockMap;
pub use error::{Error, Result};
pub use frame::{Action, Commit, ErrorBody, Frame, RepoOp, StreamMessage, decode_frame};
pub use record::{
    BlobRef, Embed, EmbeddedImage, FOLLOW_COLLECTION, FollowRecord, POST_COLLECTION, PostRecord,
    Record,
};
