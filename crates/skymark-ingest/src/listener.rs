//! Pipeline assembly.
//!
//! [`Listener`] owns the long-lived collaborators (publisher and follows
//! listing) and runs one frame source to completion:
//!
//! ```text
//! membership refresh ─▶ worker pool ─▶ source.run(dispatcher) ─▶ drain ─▶ terminate
//! ```

use crate::config::{InputSource, ListenerConfig};
use crate::cursor::CursorTracker;
use crate::dispatcher::IngestDispatcher;
use crate::membership::{FollowsSource, MembershipCache, MembershipRefresher};
use crate::publish::Publisher;
use crate::queue::work_queue;
use crate::shutdown::{DrainOutcome, ShutdownCoordinator};
use crate::source::{FirehoseConfig, FirehoseSource, FrameSource, ReplaySource, SourceStats};
use crate::worker::{WorkerContext, WorkerPool, WorkerStats, WorkerStatsSnapshot};
use crate::Result;
use std::sync::Arc;

/// What a finished run did.
#[derive(Debug, Clone)]
pub struct ListenerReport {
    /// Name of the source that ran.
    pub source_name: &'static str,

    /// Source-side counters.
    pub source: SourceStats,

    /// Worker-side counters.
    pub workers: WorkerStatsSnapshot,

    /// Members at the last successful refresh.
    pub members: usize,

    /// Last sampled cursor.
    pub cursor: Option<i64>,

    /// How shutdown ended.
    pub outcome: DrainOutcome,
}

impl ListenerReport {
    /// Process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// Runs the ingest pipeline.
pub struct Listener {
    config: ListenerConfig,
    publisher: Arc<dyn Publisher>,
    follows: Arc<dyn FollowsSource>,
}

impl Listener {
    /// Create a listener.
    pub fn new(
        config: ListenerConfig,
        publisher: Arc<dyn Publisher>,
        follows: Arc<dyn FollowsSource>,
    ) -> Self {
        Self {
            config,
            publisher,
            follows,
        }
    }

    /// Build the configured source and run it.
    ///
    /// `install` receives the shutdown coordinator before any frame is read,
    /// so the caller can hook it up to process signals.
    pub fn run_configured<H>(&self, install: H) -> Result<ListenerReport>
    where
        H: FnOnce(Arc<ShutdownCoordinator>) -> Result<()>,
    {
        match &self.config.input {
            InputSource::Firehose { url, record } => {
                let config = FirehoseConfig {
                    url: url.clone(),
                    record: record.clone(),
                    ..Default::default()
                };
                let source = FirehoseSource::new(config, self.config.start_cursor)?;
                let shutdown = self.coordinator(&source);
                install(Arc::clone(&shutdown))?;
                self.run(source, &shutdown)
            }
            InputSource::Replay(path) => {
                tracing::info!("Replaying frames from {}", path.display());
                let source = ReplaySource::open(path)?;
                let shutdown = self.coordinator(&source);
                install(Arc::clone(&shutdown))?;
                self.run(source, &shutdown)
            }
        }
    }

    /// Create a shutdown coordinator for `source`.
    pub fn coordinator<S: FrameSource>(&self, source: &S) -> Arc<ShutdownCoordinator> {
        Arc::new(ShutdownCoordinator::new(
            source.control(),
            self.config.drain_poll_interval,
        ))
    }

    /// Run `source` until it ends or `shutdown` stops it.
    ///
    /// Fails before reading any frame if the initial membership listing
    /// fails. A fatal source error is returned after the workers have
    /// finished the frames already queued.
    pub fn run<S: FrameSource>(
        &self,
        mut source: S,
        shutdown: &ShutdownCoordinator,
    ) -> Result<ListenerReport> {
        let members = Arc::new(MembershipCache::new());
        let refresher = MembershipRefresher::new(
            Arc::clone(&self.follows),
            self.config.bot_did.clone(),
            Arc::clone(&members),
        );
        tracing::info!("Loading membership for {}", self.config.bot_did);
        if let Err(e) = refresher.refresh() {
            tracing::error!("Initial membership refresh failed: {}", e);
            return Err(e);
        }

        let cursor = Arc::new(CursorTracker::new());
        let ctx = WorkerContext {
            cursor: Arc::clone(&cursor),
            members: Arc::clone(&members),
            publisher: Arc::clone(&self.publisher),
            stats: Arc::new(WorkerStats::default()),
        };

        let (sender, receiver) = work_queue(self.config.queue_capacity);
        let pool = WorkerPool::start(self.config.workers, receiver, ctx)?;

        let mut dispatcher = IngestDispatcher::new(sender, Arc::clone(&cursor), source.control())
            .with_refresher(refresher, self.config.membership_refresh_interval)
            .with_measure_interval(self.config.measure_interval);

        tracing::info!(
            "Reading frames from {} source with {} workers (queue capacity {})",
            source.name(),
            pool.size(),
            self.config.queue_capacity
        );

        let result = source.run(
            |frame| dispatcher.on_frame(frame),
            |e| tracing::warn!("Stream error: {}", e),
        );

        let source_stats = match result {
            Ok(stats) => {
                tracing::info!(
                    "Source {} finished after {} frames",
                    source.name(),
                    stats.frames_received
                );
                stats
            }
            Err(e) => {
                tracing::error!(
                    "Source {} failed, finishing {} queued frames before exit: {}",
                    source.name(),
                    dispatcher.pending(),
                    e
                );
                shutdown.terminate(dispatcher.into_sender(), pool);
                return Err(e);
            }
        };

        let outcome = shutdown.drain(|| dispatcher.pending());
        let workers = match outcome {
            DrainOutcome::Drained => shutdown.terminate(dispatcher.into_sender(), pool),
            DrainOutcome::Aborted => pool.stats(),
        };

        Ok(ListenerReport {
            source_name: source.name(),
            source: source_stats,
            workers,
            members: members.len(),
            cursor: cursor.get(),
            outcome,
        })
    }
}
