//! Downstream queue publishing.
//!
//! Classified posts become [`PostDescriptor`] JSON messages on one of two
//! queues. Publishing is fire-and-forget from the pipeline's point of view:
//! a failure is logged and counted by the caller, never retried.
//!
//! # Available Publishers
//!
//! - [`SqsPublisher`] - Amazon SQS via `aws-sdk-sqs`
//! - [`LogPublisher`] - Logs message bodies (dry run)

mod sqs;

pub use sqs::SqsPublisher;

use crate::Result;
use crate::classify::Classification;
use serde::Serialize;

/// Downstream queue a descriptor is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputQueue {
    /// Reference watermark images (`SET_WATERMARK_IMG_QUEUE_URL`).
    WatermarkImage,

    /// Images to watermark (`WATERMARKING_QUEUE_URL`).
    Watermarking,
}

impl OutputQueue {
    /// Route a classification; `None` means publish nothing.
    pub fn for_classification(classification: Classification) -> Option<Self> {
        match classification {
            Classification::NotOfInterest => None,
            Classification::WatermarkReference => Some(Self::WatermarkImage),
            Classification::WatermarkableContent => Some(Self::Watermarking),
        }
    }

    /// Metric label value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WatermarkImage => "watermark_image",
            Self::Watermarking => "watermarking",
        }
    }
}

/// Message body describing a post to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostDescriptor {
    /// CID of the post record.
    pub cid: String,

    /// `at://` URI of the post.
    pub uri: String,

    /// DID of the author.
    pub author_did: String,

    /// Client-declared creation time, verbatim from the record.
    pub created_at: String,

    /// Set only on reference watermark messages.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_watermark: bool,
}

impl PostDescriptor {
    /// Serialize to the JSON message body.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A sink for queue messages.
///
/// Called concurrently from every worker thread.
pub trait Publisher: Send + Sync {
    /// Send `body` to `queue`.
    fn publish(&self, queue: OutputQueue, body: &str) -> Result<()>;
}

impl<T: Publisher + ?Sized> Publisher for std::sync::Arc<T> {
    fn publish(&self, queue: OutputQueue, body: &str) -> Result<()> {
        (**self).publish(queue, body)
    }
}

/// Dry-run publisher that only logs.
#[derive(Debug, Default)]
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, queue: OutputQueue, body: &str) -> Result<()> {
        tracing::info!(queue = queue.as_str(), "dry run: {}", body);
        Ok(())
    }
}
