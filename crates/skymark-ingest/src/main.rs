//! Skymark firehose listener.
//!
//! Watches the Bluesky firehose for image posts by accounts the bot follows
//! and sends a descriptor for each one to SQS: reference watermark images
//! (alt text `wmset`) to one queue, everything else eligible to the other.
//!
//! # Usage
//!
//! ```bash
//! # Live firehose, publishing to SQS
//! skymark-listener \
//!     --bot-did did:plc:examplebot \
//!     --watermark-image-queue-url https://sqs.us-east-1.amazonaws.com/123/set-watermark \
//!     --watermarking-queue-url https://sqs.us-east-1.amazonaws.com/123/watermarking
//!
//! # Log descriptors instead of publishing, and keep a recording
//! skymark-listener --bot-did did:plc:examplebot --dry-run --record frames.bin
//!
//! # Replay a recording on one worker
//! skymark-listener --bot-did did:plc:examplebot --dry-run --replay frames.bin --workers 1
//! ```
//!
//! Every flag also reads an environment variable; a `.env` file (or the file
//! named by `DOTENV_PATH`) is loaded first when present.
//!
//! # Graceful Shutdown
//!
//! The listener handles SIGINT (Ctrl+C) and SIGTERM:
//! 1. Stops reading from the firehose
//! 2. Waits for queued frames to be processed
//! 3. Joins the workers and exits 0
//!
//! A second signal while waiting abandons the queue and exits 130.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use metrics::gauge;
use skymark_core::metrics::{init_metrics, start_metrics_server};
use skymark_ingest::shutdown::EXIT_ABORTED;
use skymark_ingest::{
    Args, BskyFollowsClient, DrainOutcome, FollowsSource, ListenerConfig, ListenerReport,
    Listener, LogPublisher, PublishTarget, Publisher, SqsPublisher,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let dotenv_path = std::env::var("DOTENV_PATH").unwrap_or_else(|_| ".env".to_string());
    let dotenv_loaded = dotenvy::from_path(&dotenv_path).is_ok();

    let args = Args::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Skymark firehose listener starting...");
    if dotenv_loaded {
        tracing::info!("Loaded environment from {}", dotenv_path);
    }

    let config = ListenerConfig::from_args(args).context("Invalid configuration")?;

    // The runtime only drives the metrics server and the AWS SDK; the
    // pipeline itself runs on plain threads.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("skymark-rt")
        .build()
        .context("Failed to start tokio runtime")?;

    if config.metrics_port > 0 {
        let metrics_handle = init_metrics().context("Failed to install metrics recorder")?;
        runtime
            .block_on(start_metrics_server(config.metrics_port, metrics_handle))
            .context("Failed to start metrics server")?;
        gauge!("listener_running").set(1.0);
    }

    let publisher: Arc<dyn Publisher> = match &config.publish {
        PublishTarget::DryRun => {
            tracing::info!("Dry run: descriptors are logged, not published");
            Arc::new(LogPublisher)
        }
        PublishTarget::Sqs {
            watermark_image_queue_url,
            watermarking_queue_url,
        } => Arc::new(runtime.block_on(SqsPublisher::from_env(
            runtime.handle().clone(),
            watermark_image_queue_url.clone(),
            watermarking_queue_url.clone(),
        ))),
    };

    let follows: Arc<dyn FollowsSource> = Arc::new(
        BskyFollowsClient::new(&config.appview_url).context("Failed to build AppView client")?,
    );

    let listener = Listener::new(config, publisher, follows);
    let report = listener
        .run_configured(|shutdown| {
            ctrlc::set_handler(move || shutdown.request_stop())?;
            Ok(())
        })
        .context("Listener failed")?;

    gauge!("listener_running").set(0.0);
    log_summary(&report);

    if report.outcome == DrainOutcome::Aborted {
        std::process::exit(EXIT_ABORTED);
    }

    Ok(())
}

fn log_summary(report: &ListenerReport) {
    let workers = &report.workers;

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Source:               {}", report.source_name);
    tracing::info!("Frames received:      {}", report.source.frames_received);
    tracing::info!("Bytes received:       {}", report.source.bytes_received);
    tracing::info!("Reconnects:           {}", report.source.reconnects);
    tracing::info!("Frames processed:     {}", workers.frames_processed);
    tracing::info!("Frames skipped:       {}", workers.commits_skipped);
    tracing::info!("Decode errors:        {}", workers.decode_errors);
    tracing::info!("Posts classified:     {}", workers.posts_classified);
    tracing::info!("Descriptors sent:     {}", workers.published);
    tracing::info!("Publish errors:       {}", workers.publish_errors);
    tracing::info!("Worker panics:        {}", workers.panics);
    tracing::info!("Members:              {}", report.members);
    match report.cursor {
        Some(seq) => tracing::info!("Last cursor:          {}", seq),
        None => tracing::info!("Last cursor:          -"),
    }
    if report.outcome == DrainOutcome::Aborted {
        tracing::warn!("Drain aborted; queued frames were dropped");
    }
    tracing::info!("═══════════════════════════════════════════════════════");
}
