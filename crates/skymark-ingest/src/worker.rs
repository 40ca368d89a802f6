//! Worker pool: decode, classify and publish.
//!
//! Each worker is a named OS thread that takes frames off the shared queue
//! until the queue is closed and empty. Everything that can go wrong with a
//! single frame (bad CBOR, a broken CAR slice, a record of the wrong type, a
//! failed publish, even a panic) is logged and counted, and the worker moves
//! on to the next frame.

use crate::classify::{Classification, classify};
use crate::cursor::CursorTracker;
use crate::membership::MembershipCache;
use crate::publish::{OutputQueue, PostDescriptor, Publisher};
use crate::queue::FrameReceiver;
use crate::Result;
use chrono::{DateTime, Utc};
use skymark_core::metrics::{increment, increment_labeled, observe};
use skymark_core::{
    Action, AtUri, BlockMap, Commit, Frame, POST_COLLECTION, Record, StreamMessage,
};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Collections whose created records are decoded and acted on.
pub const INTERESTED_COLLECTIONS: &[&str] = &[POST_COLLECTION];

/// Default pool size: twice the CPU count minus one, at least one.
pub fn default_worker_count() -> usize {
    (num_cpus::get() * 2).saturating_sub(1).max(1)
}

/// Shared state every worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub cursor: Arc<CursorTracker>,
    pub members: Arc<MembershipCache>,
    pub publisher: Arc<dyn Publisher>,
    pub stats: Arc<WorkerStats>,
}

/// Pool-wide counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    frames_processed: AtomicU64,
    decode_errors: AtomicU64,
    commits_skipped: AtomicU64,
    posts_classified: AtomicU64,
    published: AtomicU64,
    publish_errors: AtomicU64,
    panics: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    pub frames_processed: u64,
    pub decode_errors: u64,
    pub commits_skipped: u64,
    pub posts_classified: u64,
    pub published: u64,
    pub publish_errors: u64,
    pub panics: u64,
}

impl WorkerStats {
    /// Read every counter.
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            commits_skipped: self.commits_skipped.load(Ordering::Relaxed),
            posts_classified: self.posts_classified.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

/// Why a frame produced no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The payload could not be decoded.
    Undecodable,
    /// Not a `#commit` message.
    NotCommit,
    /// The commit carried no blocks.
    NoBlocks,
    /// The commit's CAR slice could not be read.
    BadBlocks,
}

impl SkipReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Undecodable => "undecodable",
            Self::NotCommit => "not_commit",
            Self::NoBlocks => "no_blocks",
            Self::BadBlocks => "bad_blocks",
        }
    }
}

/// Result of processing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Skipped(SkipReason),
    Processed {
        /// Created posts that were classified.
        posts: usize,
        /// Descriptors successfully published.
        published: usize,
    },
}

/// A record created by a commit.
#[derive(Debug, Clone)]
pub struct CreatedRecord {
    pub uri: AtUri,
    pub cid: String,
    pub author: String,
    pub record: Record,
}

/// A record deleted by a commit.
#[derive(Debug, Clone)]
pub struct DeletedRecord {
    pub uri: AtUri,
}

/// Operations of one commit touching a single collection.
#[derive(Debug, Clone, Default)]
pub struct CollectionOps {
    pub created: Vec<CreatedRecord>,
    pub deleted: Vec<DeletedRecord>,
}

/// Group a commit's operations by collection.
///
/// Creates are kept only for `interested` collections and only when the
/// record block is present and decodes to the collection's type. Deletes
/// are kept for every collection. Updates are dropped.
pub fn operations_by_collection(
    commit: &Commit,
    blocks: &BlockMap,
    interested: &[&str],
) -> HashMap<String, CollectionOps> {
    let mut by_collection: HashMap<String, CollectionOps> = HashMap::new();

    for op in &commit.ops {
        let action = match op.action() {
            Some(Action::Update) | None => continue,
            Some(action) => action,
        };

        let uri = match AtUri::from_repo_path(&commit.repo, &op.path) {
            Ok(uri) => uri,
            Err(e) => {
                tracing::debug!("Skipping op in commit {}: {}", commit.seq, e);
                continue;
            }
        };

        match action {
            Action::Create => {
                if !interested.contains(&uri.collection()) {
                    continue;
                }
                let Some(cid) = op.cid.map(|cid| cid.to_string()) else {
                    continue;
                };
                let Some(bytes) = blocks.get(&cid) else {
                    tracing::debug!("No block for {} in commit {}", uri, commit.seq);
                    continue;
                };
                let record = match Record::decode(uri.collection(), bytes) {
                    Ok(Some(record)) => record,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::debug!("Skipping record {}: {}", uri, e);
                        continue;
                    }
                };

                by_collection
                    .entry(uri.collection().to_string())
                    .or_default()
                    .created
                    .push(CreatedRecord {
                        uri,
                        cid,
                        author: commit.repo.clone(),
                        record,
                    });
            }
            Action::Delete => {
                by_collection
                    .entry(uri.collection().to_string())
                    .or_default()
                    .deleted
                    .push(DeletedRecord { uri });
            }
            Action::Update => {}
        }
    }

    by_collection
}

/// Decode, classify and publish a single frame.
pub fn process_frame(frame: &Frame, ctx: &WorkerContext) -> FrameOutcome {
    let commit = match frame.decode() {
        Ok(StreamMessage::Commit(commit)) => commit,
        Ok(StreamMessage::Error(body)) => {
            tracing::warn!(
                "Stream error frame: {} ({})",
                body.error,
                body.message.as_deref().unwrap_or("no message")
            );
            return skip(ctx, SkipReason::NotCommit);
        }
        Ok(StreamMessage::Other(kind)) => {
            tracing::debug!("Ignoring {} message", kind);
            return skip(ctx, SkipReason::NotCommit);
        }
        Err(e) => {
            tracing::debug!("Failed to decode frame {}: {}", frame.index, e);
            ctx.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            increment("worker_decode_errors_total", 1);
            return skip(ctx, SkipReason::Undecodable);
        }
    };

    if ctx.cursor.observe(commit.seq) {
        tracing::trace!("Cursor advanced to {}", commit.seq);
    }
    record_commit_lag(&commit);

    if !commit.has_blocks() {
        return skip(ctx, SkipReason::NoBlocks);
    }

    let blocks = match BlockMap::decode(&commit.blocks) {
        Ok(blocks) => blocks,
        Err(e) => {
            tracing::debug!("Bad blocks in commit {}: {}", commit.seq, e);
            ctx.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            increment("worker_decode_errors_total", 1);
            return skip(ctx, SkipReason::BadBlocks);
        }
    };

    let mut ops = operations_by_collection(&commit, &blocks, INTERESTED_COLLECTIONS);
    let posts = ops.remove(POST_COLLECTION).unwrap_or_default();

    let mut classified = 0;
    let mut published = 0;
    for created in &posts.created {
        let Record::Post(post) = &created.record else {
            continue;
        };

        let classification = classify(post, &created.author, &ctx.members);
        classified += 1;
        ctx.stats.posts_classified.fetch_add(1, Ordering::Relaxed);
        increment_labeled(
            "worker_posts_classified_total",
            "classification",
            classification.as_str(),
        );

        let Some(queue) = OutputQueue::for_classification(classification) else {
            continue;
        };

        let descriptor = PostDescriptor {
            cid: created.cid.clone(),
            uri: created.uri.to_string(),
            author_did: created.author.clone(),
            created_at: post.created_at.clone(),
            is_watermark: classification == Classification::WatermarkReference,
        };

        if publish(ctx, queue, &descriptor).is_ok() {
            published += 1;
        }
    }

    FrameOutcome::Processed {
        posts: classified,
        published,
    }
}

fn publish(ctx: &WorkerContext, queue: OutputQueue, descriptor: &PostDescriptor) -> Result<()> {
    let result = descriptor
        .to_json()
        .and_then(|body| {
            tracing::info!("{}", body);
            ctx.publisher.publish(queue, &body)
        });

    match &result {
        Ok(()) => {
            ctx.stats.published.fetch_add(1, Ordering::Relaxed);
            increment_labeled("worker_published_total", "queue", queue.as_str());
        }
        Err(e) => {
            tracing::warn!(
                "Failed to publish {} to {}: {}",
                descriptor.uri,
                queue.as_str(),
                e
            );
            ctx.stats.publish_errors.fetch_add(1, Ordering::Relaxed);
            increment_labeled("worker_publish_errors_total", "queue", queue.as_str());
        }
    }
    result
}

fn skip(ctx: &WorkerContext, reason: SkipReason) -> FrameOutcome {
    ctx.stats.commits_skipped.fetch_add(1, Ordering::Relaxed);
    increment_labeled("worker_commits_skipped_total", "reason", reason.as_str());
    FrameOutcome::Skipped(reason)
}

fn record_commit_lag(commit: &Commit) {
    let Some(time) = commit.time.as_deref() else {
        return;
    };
    if let Ok(committed) = DateTime::parse_from_rfc3339(time) {
        let lag = Utc::now().signed_duration_since(committed);
        observe("worker_commit_lag_seconds", lag.num_milliseconds() as f64 / 1000.0);
    }
}

/// A running set of worker threads.
pub struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    /// Spawn `workers` threads consuming from `receiver`.
    pub fn start(workers: usize, receiver: FrameReceiver, ctx: WorkerContext) -> Result<Self> {
        let stats = Arc::clone(&ctx.stats);
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers.max(1) {
            let receiver = receiver.clone();
            let ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || run_worker(id, receiver, ctx))?;
            handles.push(handle);
        }

        tracing::info!("Started {} workers", handles.len());
        Ok(Self { handles, stats })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Current counters.
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for every worker to exit.
    ///
    /// Workers exit once the queue sender is dropped and the queue is empty.
    pub fn join(self) -> WorkerStatsSnapshot {
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if let Err(e) = handle.join() {
                tracing::error!("{} exited abnormally: {:?}", name, e);
            }
        }
        self.stats.snapshot()
    }
}

fn run_worker(id: usize, receiver: FrameReceiver, ctx: WorkerContext) {
    tracing::debug!("Worker {} started", id);

    while let Some(frame) = receiver.recv() {
        let index = frame.index;
        if catch_unwind(AssertUnwindSafe(|| process_frame(&frame, &ctx))).is_err() {
            tracing::error!("Worker {} panicked while processing frame {}", id, index);
            ctx.stats.panics.fetch_add(1, Ordering::Relaxed);
            increment("worker_panics_total", 1);
        }
        ctx.stats.frames_processed.fetch_add(1, Ordering::Relaxed);
        increment("worker_frames_processed_total", 1);
    }

    tracing::debug!("Worker {} stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::work_queue;
    use crate::testing::{MEMBER, RecordingPublisher, context};
    use skymark_core::testing::{CommitBuilder, ImageSpec, encode_error_frame, encode_follow,
        encode_message_frame, encode_post, encode_typed_post};

    const POST_PATH: &str = "app.bsky.feed.post/3kpost";

    fn image_post(alt: Option<&str>) -> Vec<u8> {
        encode_post("look", &[ImageSpec::new(alt, "image/jpeg")])
    }

    #[test]
    fn test_reference_image_scenario() {
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = context(Arc::clone(&publisher));
        let frame = CommitBuilder::new(100, MEMBER)
            .create(POST_PATH, image_post(Some("wmset")))
            .frame(0);

        let outcome = process_frame(&frame, &ctx);
        assert_eq!(
            outcome,
            FrameOutcome::Processed {
                posts: 1,
                published: 1
            }
        );
        assert!(publisher.on(OutputQueue::Watermarking).is_empty());

        let messages = publisher.on(OutputQueue::WatermarkImage);
        assert_eq!(messages.len(), 1);
        let body = &messages[0];
        assert_eq!(body["is_watermark"], serde_json::json!(true));
        assert_eq!(body["author_did"], MEMBER);
        assert_eq!(
            body["uri"],
            format!("at://{MEMBER}/{POST_PATH}").as_str()
        );
        assert_eq!(body["created_at"], skymark_core::testing::FIXTURE_CREATED_AT);
        assert!(body["cid"].as_str().unwrap().starts_with('b'));

        assert_eq!(ctx.cursor.get(), Some(100));
    }

    #[test]
    fn test_content_image_goes_to_watermarking_queue() {
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = context(Arc::clone(&publisher));
        let frame = CommitBuilder::new(7, MEMBER)
            .create(POST_PATH, image_post(Some("my cat")))
            .frame(0);

        process_frame(&frame, &ctx);
        let messages = publisher.on(OutputQueue::Watermarking);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].get("is_watermark").is_none());
        assert!(publisher.on(OutputQueue::WatermarkImage).is_empty());
        assert_eq!(ctx.cursor.get(), None, "seq 7 is not sampled");
    }

    #[test]
    fn test_opt_out_publishes_nothing() {
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = context(Arc::clone(&publisher));
        let frame = CommitBuilder::new(101, MEMBER)
            .create(POST_PATH, image_post(Some("nown")))
            .frame(0);

        let outcome = process_frame(&frame, &ctx);
        assert_eq!(
            outcome,
            FrameOutcome::Processed {
                posts: 1,
                published: 0
            }
        );
        assert!(publisher.messages().is_empty());
    }

    #[test]
    fn test_updates_never_publish() {
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = context(Arc::clone(&publisher));
        let frame = CommitBuilder::new(5, MEMBER)
            .update(POST_PATH, image_post(None))
            .frame(0);

        let outcome = process_frame(&frame, &ctx);
        assert_eq!(
            outcome,
            FrameOutcome::Processed {
                posts: 0,
                published: 0
            }
        );
        assert!(publisher.messages().is_empty());
    }

    #[test]
    fn test_non_member_publishes_nothing() {
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = context(Arc::clone(&publisher));
        let frame = CommitBuilder::new(5, "did:plc:stranger")
            .create(POST_PATH, image_post(Some("wmset")))
            .frame(0);

        process_frame(&frame, &ctx);
        assert!(publisher.messages().is_empty());
    }

    #[test]
    fn test_commit_without_blocks_still_advances_cursor() {
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = context(Arc::clone(&publisher));
        let frame = CommitBuilder::new(40, MEMBER)
            .create(POST_PATH, image_post(None))
            .without_blocks()
            .frame(0);

        assert_eq!(
            process_frame(&frame, &ctx),
            FrameOutcome::Skipped(SkipReason::NoBlocks)
        );
        assert_eq!(ctx.cursor.get(), Some(40));
        assert!(publisher.messages().is_empty());
    }

    #[test]
    fn test_non_commit_and_garbage_frames_are_skipped() {
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = context(Arc::clone(&publisher));

        let identity = Frame::new(
            0,
            encode_message_frame("#identity", &serde_json::json!({"seq": 60, "did": MEMBER})),
        );
        assert_eq!(
            process_frame(&identity, &ctx),
            FrameOutcome::Skipped(SkipReason::NotCommit)
        );

        let error = Frame::new(1, encode_error_frame("ConsumerTooSlow", None));
        assert_eq!(
            process_frame(&error, &ctx),
            FrameOutcome::Skipped(SkipReason::NotCommit)
        );

        let garbage = Frame::new(2, vec![0xff, 0xfe, 0xfd]);
        assert_eq!(
            process_frame(&garbage, &ctx),
            FrameOutcome::Skipped(SkipReason::Undecodable)
        );

        let stats = ctx.stats.snapshot();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.commits_skipped, 3);
        assert_eq!(ctx.cursor.get(), None);
    }

    #[test]
    fn test_missing_block_and_wrong_type_are_skipped() {
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = context(Arc::clone(&publisher));
        let frame = CommitBuilder::new(9, MEMBER)
            .create_dangling("app.bsky.feed.post/3kgone")
            .create(
                "app.bsky.feed.post/3kwrong",
                encode_typed_post("app.bsky.feed.repost", "x", &[ImageSpec::new(None, "image/png")]),
            )
            .create("app.bsky.feed.post/3kgood", image_post(None))
            .frame(0);

        assert_eq!(
            process_frame(&frame, &ctx),
            FrameOutcome::Processed {
                posts: 1,
                published: 1
            }
        );
        let messages = publisher.on(OutputQueue::Watermarking);
        assert_eq!(messages.len(), 1);
        assert!(messages[0]["uri"].as_str().unwrap().ends_with("/3kgood"));
    }

    #[test]
    fn test_publish_failure_is_counted_and_processing_continues() {
        let publisher = Arc::new(RecordingPublisher::failing(OutputQueue::WatermarkImage));
        let ctx = context(Arc::clone(&publisher));
        let frame = CommitBuilder::new(11, MEMBER)
            .create("app.bsky.feed.post/3ka", image_post(Some("wmset")))
            .create("app.bsky.feed.post/3kb", image_post(None))
            .frame(0);

        assert_eq!(
            process_frame(&frame, &ctx),
            FrameOutcome::Processed {
                posts: 2,
                published: 1
            }
        );
        assert_eq!(publisher.on(OutputQueue::Watermarking).len(), 1);
        let stats = ctx.stats.snapshot();
        assert_eq!(stats.publish_errors, 1);
        assert_eq!(stats.published, 1);
    }

    #[test]
    fn test_operations_by_collection_groups_creates_and_deletes() {
        let payload = CommitBuilder::new(3, MEMBER)
            .create(POST_PATH, image_post(None))
            .create("app.bsky.graph.follow/3kf", encode_follow("did:plc:other"))
            .update("app.bsky.feed.post/3kupd", image_post(None))
            .delete("app.bsky.feed.post/3kold")
            .delete("app.bsky.graph.follow/3kgone")
            .encode();
        let StreamMessage::Commit(commit) = skymark_core::decode_frame(&payload).unwrap() else {
            panic!("expected a commit");
        };
        let blocks = BlockMap::decode(&commit.blocks).unwrap();

        let ops = operations_by_collection(&commit, &blocks, INTERESTED_COLLECTIONS);

        let posts = &ops[POST_COLLECTION];
        assert_eq!(posts.created.len(), 1);
        assert_eq!(posts.created[0].uri.rkey(), "3kpost");
        assert_eq!(posts.created[0].author, MEMBER);
        assert!(matches!(posts.created[0].record, Record::Post(_)));
        assert_eq!(posts.deleted.len(), 1);
        assert_eq!(posts.deleted[0].uri.rkey(), "3kold");

        let follows = &ops["app.bsky.graph.follow"];
        assert!(follows.created.is_empty(), "follows are not interesting");
        assert_eq!(follows.deleted.len(), 1);
    }

    #[test]
    fn test_pool_processes_everything_then_exits() {
        let publisher = Arc::new(RecordingPublisher::new());
        let ctx = context(Arc::clone(&publisher));
        let (tx, rx) = work_queue(16);
        let pool = WorkerPool::start(3, rx, ctx).unwrap();
        assert_eq!(pool.size(), 3);

        for seq in 1..=10 {
            let frame = CommitBuilder::new(seq, MEMBER)
                .create(POST_PATH, image_post(None))
                .frame(seq as u64);
            tx.send(frame).unwrap();
        }
        drop(tx);

        let stats = pool.join();
        assert_eq!(stats.frames_processed, 10);
        assert_eq!(stats.published, 10);
        assert_eq!(publisher.on(OutputQueue::Watermarking).len(), 10);
    }

    #[test]
    fn test_panic_is_contained() {
        let publisher = Arc::new(RecordingPublisher::panicking());
        let ctx = context(Arc::clone(&publisher));
        let (tx, rx) = work_queue(4);
        let pool = WorkerPool::start(1, rx, ctx).unwrap();

        for seq in 1..=2 {
            tx.send(
                CommitBuilder::new(seq, MEMBER)
                    .create(POST_PATH, image_post(None))
                    .frame(seq as u64),
            )
            .unwrap();
        }
        drop(tx);

        let stats = pool.join();
        assert_eq!(stats.frames_processed, 2);
        assert_eq!(stats.panics, 2);
    }

    #[test]
    fn test_default_worker_count() {
        assert!(default_worker_count() >= 1);
        assert_eq!(default_worker_count(), num_cpus::get() * 2 - 1);
    }
}
