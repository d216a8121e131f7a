// src/feed.rs
//! One destination: its compiled policy, its worker pool, and the handler that
//! turns admitted events into stored post records.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::{JobError, PoolError};
use crate::event::{Event, FeedPost};
use crate::policy::MatchingPolicy;
use crate::store::{PostRecord, PostStore, PostWriter};
use crate::worker::{BackoffFn, WorkHandler, WorkItem, WorkItemResult, WorkerPool};

/// Build the stored form of `post`. `None` when the event has no commit.
pub fn post_record(event: &Event, post: &FeedPost, indexed_at: i64) -> Option<PostRecord> {
    let uri = event.uri()?;
    let commit = event.commit.as_ref()?;
    Some(PostRecord {
        uri,
        cid: commit.cid.clone(),
        reply_parent: post.reply.as_ref().map(|r| r.parent.uri.clone()),
        reply_root: post.reply.as_ref().map(|r| r.root.uri.clone()),
        indexed_at,
    })
}

/// Pool handler for one feed. Re-checks the policy so a post submitted under
/// an older decision is still judged by the current one.
pub struct PostHandler {
    feed: String,
    policy: Arc<MatchingPolicy>,
    writer: PostWriter,
    debug: bool,
}

impl PostHandler {
    pub fn new(feed: impl Into<String>, policy: Arc<MatchingPolicy>, writer: PostWriter, debug: bool) -> Self {
        Self {
            feed: feed.into(),
            policy,
            writer,
            debug,
        }
    }

    fn echo(&self, event: &Event, post: &FeedPost) {
        let at = DateTime::<Utc>::from_timestamp_micros(event.time_us)
            .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
            .unwrap_or_default();
        info!("[{}] {} |({})| {}", self.feed, at, event.did, post.text);
    }
}

#[async_trait]
impl WorkHandler<Arc<Event>> for PostHandler {
    async fn handle(&self, item: &WorkItem<Arc<Event>>) -> Result<(), JobError> {
        let event = item.payload();
        let post = event.decode_post().map_err(JobError::fatal)?;

        if !self.policy.evaluate(&post.text, post.is_reply()) {
            debug!(feed = %self.feed, job_id = item.seq(), "post no longer matches");
            return Ok(());
        }

        let record = post_record(event, &post, Utc::now().timestamp_millis())
            .ok_or_else(|| JobError::fatal("event has no commit"))?;
        debug!(feed = %self.feed, uri = %record.uri, "post match");

        self.writer.send(record).await.map_err(JobError::retryable)?;

        if self.debug {
            self.echo(event, &post);
        }
        Ok(())
    }
}

/// A configured feed, wired and running.
pub struct Destination {
    config: Arc<FeedConfig>,
    policy: Arc<MatchingPolicy>,
    store: Arc<dyn PostStore>,
    pool: WorkerPool<Arc<Event>>,
    writer_task: JoinHandle<()>,
    dead_letter_task: Option<JoinHandle<()>>,
}

impl Destination {
    /// Spawn the writer, start the pool and (when enabled) a dead-letter logger.
    /// Must be called inside a Tokio runtime.
    pub fn start(
        config: FeedConfig,
        policy: MatchingPolicy,
        store: Arc<dyn PostStore>,
        writer_capacity: usize,
        debug: bool,
        backoff: Option<BackoffFn>,
    ) -> Self {
        let policy = Arc::new(policy);
        let (writer, writer_task) = PostWriter::spawn(&config.id, store.clone(), writer_capacity);
        let handler = Arc::new(PostHandler::new(&config.id, policy.clone(), writer, debug));

        let backoff = backoff.unwrap_or_else(|| config.pool.backoff());
        let pool = WorkerPool::new(
            config.pool.pool_config(&format!("{}-worker", config.id)),
            handler,
            Some(backoff),
        );
        let dead_letter_task = pool
            .take_dead_letters()
            .map(|rx| tokio::spawn(log_dead_letters(config.id.clone(), rx)));
        pool.start();

        Self {
            config: Arc::new(config),
            policy,
            store,
            pool,
            writer_task,
            dead_letter_task,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &Arc<FeedConfig> {
        &self.config
    }

    pub fn policy(&self) -> &MatchingPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn PostStore> {
        &self.store
    }

    pub fn pool(&self) -> &WorkerPool<Arc<Event>> {
        &self.pool
    }

    pub async fn submit(&self, event: Arc<Event>) -> Result<u64, PoolError> {
        self.pool.submit(event).await
    }

    /// Stop the pool (waiting for in-flight handler calls), then let the writer
    /// flush what it already holds.
    pub async fn stop(self) {
        let Destination {
            config,
            pool,
            writer_task,
            dead_letter_task,
            ..
        } = self;
        pool.stop().await;
        // Dropping the pool drops the handler and with it the last writer handle.
        drop(pool);
        if let Err(e) = writer_task.await {
            warn!(feed = %config.id, error = %e, "post writer ended abnormally");
        }
        if let Some(task) = dead_letter_task {
            if let Err(e) = task.await {
                warn!(feed = %config.id, error = %e, "dead-letter logger ended abnormally");
            }
        }
        info!(feed = %config.id, "feed stopped");
    }
}

async fn log_dead_letters(feed: String, mut rx: mpsc::Receiver<WorkItemResult<Arc<Event>>>) {
    while let Some(dead) = rx.recv().await {
        warn!(
            feed = %feed,
            job_id = dead.item.seq(),
            attempts = dead.item.attempts(),
            uri = %dead.item.payload().uri().unwrap_or_default(),
            error = %dead.reason,
            "dead-lettered post"
        );
    }
}
