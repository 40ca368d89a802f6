//! Amazon SQS publisher.

use super::{OutputQueue, Publisher};
use crate::{Error, Result};
use aws_sdk_sqs::Client as SqsClient;
use aws_sdk_sqs::error::DisplayErrorContext;
use tokio::runtime::Handle;

/// Sends descriptors to SQS.
///
/// The SDK is async; worker threads are plain OS threads, so each publish
/// blocks on the shared runtime through `handle`. Never call from inside
/// that runtime.
pub struct SqsPublisher {
    client: SqsClient,
    handle: Handle,
    watermark_image_queue_url: String,
    watermarking_queue_url: String,
}

impl SqsPublisher {
    /// Build a publisher from the default AWS credential and region chain.
    pub async fn from_env(
        handle: Handle,
        watermark_image_queue_url: String,
        watermarking_queue_url: String,
    ) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        tracing::info!(
            region = ?config.region(),
            "SQS publisher ready: watermark image queue {}, watermarking queue {}",
            watermark_image_queue_url,
            watermarking_queue_url
        );

        Self {
            client: SqsClient::new(&config),
            handle,
            watermark_image_queue_url,
            watermarking_queue_url,
        }
    }

    fn queue_url(&self, queue: OutputQueue) -> &str {
        match queue {
            OutputQueue::WatermarkImage => &self.watermark_image_queue_url,
            OutputQueue::Watermarking => &self.watermarking_queue_url,
        }
    }
}

impl Publisher for SqsPublisher {
    fn publish(&self, queue: OutputQueue, body: &str) -> Result<()> {
        let request = self
            .client
            .send_message()
            .queue_url(self.queue_url(queue))
            .message_body(body)
            .send();

        let output = self
            .handle
            .block_on(request)
            .map_err(|e| Error::Publish(DisplayErrorContext(&e).to_string()))?;

        tracing::debug!(
            queue = queue.as_str(),
            message_id = output.message_id().unwrap_or("-"),
            "Sent message"
        );
        Ok(())
    }
}
