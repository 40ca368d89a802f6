//! Listener configuration.
//!
//! Command-line flags with environment fallbacks are parsed by clap into
//! [`Args`], then validated and resolved into a [`ListenerConfig`].

use crate::worker::default_worker_count;
use crate::{Error, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Default firehose relay.
pub const DEFAULT_FIREHOSE_URL: &str = "wss://bsky.network";

/// Default public AppView used to list follows.
pub const DEFAULT_APPVIEW_URL: &str = "https://public.api.bsky.app";

/// Bluesky firehose listener for the watermark bot.
#[derive(Parser, Debug, Clone)]
#[command(name = "skymark-listener")]
#[command(about = "Routes watermark-eligible image posts from the Bluesky firehose to SQS")]
#[command(version)]
pub struct Args {
    /// DID of the bot account whose follows are watched
    #[arg(long, env = "BOT_USERID")]
    pub bot_did: String,

    /// Firehose relay base URL
    #[arg(long, env = "FIREHOSE_URL", default_value = DEFAULT_FIREHOSE_URL)]
    pub firehose_url: String,

    /// AppView base URL used for follow listing
    #[arg(long, env = "BSKY_APPVIEW_URL", default_value = DEFAULT_APPVIEW_URL)]
    pub appview_url: String,

    /// SQS queue URL for reference watermark images
    #[arg(long, env = "SET_WATERMARK_IMG_QUEUE_URL")]
    pub watermark_image_queue_url: Option<String>,

    /// SQS queue URL for images to watermark
    #[arg(long, env = "WATERMARKING_QUEUE_URL")]
    pub watermarking_queue_url: Option<String>,

    /// Worker threads (0 = CPUs * 2 - 1)
    #[arg(long, env = "LISTENER_WORKERS", default_value = "0")]
    pub workers: usize,

    /// Work queue capacity in frames
    #[arg(long, env = "LISTENER_QUEUE_CAPACITY", default_value = "10000")]
    pub queue_capacity: usize,

    /// Seconds between membership refreshes
    #[arg(long, default_value = "300")]
    pub membership_refresh_secs: u64,

    /// Seconds between event rate measurements
    #[arg(long, default_value = "10")]
    pub measure_interval_secs: u64,

    /// Milliseconds between queue checks while draining
    #[arg(long, default_value = "200")]
    pub drain_poll_ms: u64,

    /// Firehose sequence number to resume from
    #[arg(long, env = "FIREHOSE_START_CURSOR")]
    pub start_cursor: Option<i64>,

    /// Read frames from a recording instead of the firehose
    #[arg(long, conflicts_with = "record")]
    pub replay: Option<PathBuf>,

    /// Append every received firehose frame to a recording
    #[arg(long)]
    pub record: Option<PathBuf>,

    /// Log descriptors instead of sending them to SQS
    #[arg(long)]
    pub dry_run: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    pub metrics_port: u16,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Where descriptors are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    /// Log descriptors only.
    DryRun,

    /// Send to SQS.
    Sqs {
        watermark_image_queue_url: String,
        watermarking_queue_url: String,
    },
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Live firehose, optionally recording frames to a file.
    Firehose {
        url: String,
        record: Option<PathBuf>,
    },

    /// A previously recorded file.
    Replay(PathBuf),
}

/// Validated listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bot_did: String,
    pub appview_url: String,
    pub input: InputSource,
    pub publish: PublishTarget,
    pub workers: usize,
    pub queue_capacity: usize,
    pub membership_refresh_interval: Duration,
    pub measure_interval: Duration,
    pub drain_poll_interval: Duration,
    pub start_cursor: Option<i64>,
    pub metrics_port: u16,
}

impl ListenerConfig {
    /// Validate parsed arguments.
    pub fn from_args(args: Args) -> Result<Self> {
        if !args.bot_did.starts_with("did:") {
            return Err(Error::Config(format!(
                "bot DID must start with 'did:', got '{}'",
                args.bot_did
            )));
        }
        if args.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be positive".to_string()));
        }
        if args.membership_refresh_secs == 0 || args.measure_interval_secs == 0 {
            return Err(Error::Config("intervals must be positive".to_string()));
        }
        if args.drain_poll_ms == 0 {
            return Err(Error::Config("drain poll interval must be positive".to_string()));
        }
        if let Some(cursor) = args.start_cursor
            && cursor <= 0
        {
            return Err(Error::Config(format!(
                "start cursor must be positive, got {cursor}"
            )));
        }

        let publish = if args.dry_run {
            PublishTarget::DryRun
        } else {
            match (args.watermark_image_queue_url, args.watermarking_queue_url) {
                (Some(watermark_image_queue_url), Some(watermarking_queue_url)) => {
                    PublishTarget::Sqs {
                        watermark_image_queue_url,
                        watermarking_queue_url,
                    }
                }
                _ => {
                    return Err(Error::Config(
                        "SET_WATERMARK_IMG_QUEUE_URL and WATERMARKING_QUEUE_URL are required \
                         unless --dry-run is set"
                            .to_string(),
                    ));
                }
            }
        };

        let input = match args.replay {
            Some(path) => InputSource::Replay(path),
            None => {
                let url = args.firehose_url.trim_end_matches('/').to_string();
                if !(url.starts_with("wss://") || url.starts_with("ws://")) {
                    return Err(Error::Config(format!(
                        "firehose URL must use ws:// or wss://, got '{url}'"
                    )));
                }
                InputSource::Firehose {
                    url,
                    record: args.record,
                }
            }
        };

        let workers = match args.workers {
            0 => default_worker_count(),
            n => n,
        };

        Ok(Self {
            bot_did: args.bot_did,
            appview_url: args.appview_url.trim_end_matches('/').to_string(),
            input,
            publish,
            workers,
            queue_capacity: args.queue_capacity,
            membership_refresh_interval: Duration::from_secs(args.membership_refresh_secs),
            measure_interval: Duration::from_secs(args.measure_interval_secs),
            drain_poll_interval: Duration::from_millis(args.drain_poll_ms),
            start_cursor: args.start_cursor,
            metrics_port: args.metrics_port,
        })
    }
}
