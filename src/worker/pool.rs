// src/worker/pool.rs
//! Bounded, retrying job pool.
//!
//! ```text
//! submit ──► intake (bounded mpsc) ──┐
//!                                    ├──► runner × concurrency ──► handler
//! retry deque (bounded) ◄────────────┘        │ Ok        -> done
//!        ▲                                    │ Retryable -> backoff, retry deque
//!        └────────────────────────────────────┘ Fatal / budget spent -> dead letter | log
//! ```
//!
//! Each runner first takes a retry item whose delay has elapsed, then waits on
//! fresh intake, a retry wake-up, or cancellation. Not-yet-eligible retry items
//! stay in the deque and are rotated to its tail when skipped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{JobError, PoolError};
use crate::worker::backoff::{default_backoff, BackoffFn};
use crate::worker::item::{WorkItem, WorkItemResult};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(100);

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        metrics::describe_counter!("pool_jobs_submitted_total", "Jobs accepted into a pool.");
        metrics::describe_counter!("pool_jobs_succeeded_total", "Jobs whose handler succeeded.");
        metrics::describe_counter!("pool_jobs_retried_total", "Retries scheduled after a failure.");
        metrics::describe_counter!(
            "pool_jobs_failed_total",
            "Jobs that failed terminally (fatal or out of retries)."
        );
        metrics::describe_counter!(
            "pool_dead_letter_total",
            "Terminal failures delivered to a dead-letter queue."
        );
    });
}

/// The work performed for each item. Returning `Err` triggers retry handling.
#[async_trait]
pub trait WorkHandler<P>: Send + Sync {
    async fn handle(&self, item: &WorkItem<P>) -> Result<(), JobError>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub concurrency: usize,
    pub max_retries: u32,
    /// Capacity of the intake, retry and dead-letter queues.
    pub queue_capacity: usize,
    pub dead_letter: bool,
    /// Longest a runner waits before re-checking the retry deque.
    pub idle_poll: Duration,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dead_letter: false,
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n.max(1);
        self
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = enabled;
        self
    }

    pub fn with_idle_poll(mut self, poll: Duration) -> Self {
        self.idle_poll = poll;
        self
    }
}

/// Snapshot of queue depths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: usize,
    pub retrying: usize,
    pub dead_letters: usize,
}

struct RetryQueue<P> {
    items: Mutex<VecDeque<WorkItem<P>>>,
    capacity: usize,
}

impl<P> RetryQueue<P> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<WorkItem<P>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands the item back when the deque is full.
    fn push(&self, item: WorkItem<P>) -> Result<(), WorkItem<P>> {
        let mut q = self.lock();
        if q.len() >= self.capacity {
            return Err(item);
        }
        q.push_back(item);
        Ok(())
    }

    /// First eligible item; skipped items go to the tail.
    fn pop_eligible(&self, now: Instant) -> Option<WorkItem<P>> {
        let mut q = self.lock();
        for _ in 0..q.len() {
            let item = q.pop_front()?;
            if item.is_eligible(now) {
                return Some(item);
            }
            q.push_back(item);
        }
        None
    }

    fn next_due(&self) -> Option<Instant> {
        self.lock().iter().map(WorkItem::not_before).min()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

struct Shared<P> {
    config: PoolConfig,
    handler: Arc<dyn WorkHandler<P>>,
    backoff: BackoffFn,
    seq: AtomicU64,
    intake_tx: mpsc::Sender<WorkItem<P>>,
    intake_rx: AsyncMutex<mpsc::Receiver<WorkItem<P>>>,
    retry: RetryQueue<P>,
    retry_ready: Notify,
    dead_letter_tx: Option<mpsc::Sender<WorkItemResult<P>>>,
    shutdown: watch::Sender<bool>,
}

pub struct WorkerPool<P> {
    shared: Arc<Shared<P>>,
    runners: Mutex<Vec<JoinHandle<()>>>,
    dead_letter_rx: Mutex<Option<mpsc::Receiver<WorkItemResult<P>>>>,
}

impl<P> WorkerPool<P>
where
    P: Send + Sync + 'static,
{
    /// Create a stopped-until-started pool. `backoff = None` uses the default
    /// exponential backoff.
    pub fn new(config: PoolConfig, handler: Arc<dyn WorkHandler<P>>, backoff: Option<BackoffFn>) -> Self {
        ensure_metrics_described();
        let capacity = config.queue_capacity.max(1);
        let (intake_tx, intake_rx) = mpsc::channel(capacity);
        let (dead_letter_tx, dead_letter_rx) = if config.dead_letter {
            let (tx, rx) = mpsc::channel(capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                retry: RetryQueue::new(capacity),
                config,
                handler,
                backoff: backoff.unwrap_or_else(default_backoff),
                seq: AtomicU64::new(0),
                intake_tx,
                intake_rx: AsyncMutex::new(intake_rx),
                retry_ready: Notify::new(),
                dead_letter_tx,
                shutdown,
            }),
            runners: Mutex::new(Vec::new()),
            dead_letter_rx: Mutex::new(dead_letter_rx),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Spawn one runner per concurrency slot. Must be called inside a Tokio runtime.
    pub fn start(&self) {
        let mut runners = self.runners.lock().unwrap_or_else(PoisonError::into_inner);
        if !runners.is_empty() || self.is_stopped() {
            warn!(worker = %self.name(), "worker pool already started or stopped");
            return;
        }
        for id in 0..self.shared.config.concurrency.max(1) {
            let shared = self.shared.clone();
            runners.push(tokio::spawn(shared.run(id)));
            info!(worker = %self.name(), id, "worker starting");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Queue `payload` with a fresh sequence number and a full retry budget.
    ///
    /// Waits while the intake queue is full; fails once the pool is stopped.
    pub async fn submit(&self, payload: P) -> Result<u64, PoolError> {
        let stopped = || PoolError::Stopped(self.name().to_string());
        if self.is_stopped() {
            return Err(stopped());
        }

        let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let item = WorkItem::new(self.name(), seq, payload, self.shared.config.max_retries);

        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::select! {
            sent = self.shared.intake_tx.send(item) => sent.map_err(|_| stopped())?,
            _ = shutdown.wait_for(|stopped| *stopped) => return Err(stopped()),
        }

        counter!("pool_jobs_submitted_total", "pool" => self.name().to_string()).increment(1);
        debug!(worker = %self.name(), job_id = seq, "queued job");
        Ok(seq)
    }

    /// Receiver for terminal failures; `None` when dead-lettering is disabled
    /// or the receiver was already taken.
    pub fn take_dead_letters(&self) -> Option<mpsc::Receiver<WorkItemResult<P>>> {
        self.dead_letter_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn stats(&self) -> PoolStats {
        let queued_in = |max: usize, free: usize| max.saturating_sub(free);
        PoolStats {
            queued: queued_in(self.shared.intake_tx.max_capacity(), self.shared.intake_tx.capacity()),
            retrying: self.shared.retry.len(),
            dead_letters: self
                .shared
                .dead_letter_tx
                .as_ref()
                .map(|tx| queued_in(tx.max_capacity(), tx.capacity()))
                .unwrap_or(0),
        }
    }

    /// Cancel all runners and wait for handler calls already in progress.
    ///
    /// Queued and retrying items are logged and released, not delivered.
    pub async fn stop(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }

        let handles = std::mem::take(&mut *self.runners.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(worker = %self.name(), error = %e, "worker runner ended abnormally");
            }
        }

        let stats = self.stats();
        if stats.queued + stats.retrying + stats.dead_letters > 0 {
            warn!(
                worker = %self.name(),
                new_items = stats.queued,
                retry_items = stats.retrying,
                dlq_items = stats.dead_letters,
                "worker has remaining in flight work at shutdown"
            );
        }

        let mut intake = self.shared.intake_rx.lock().await;
        intake.close();
        while intake.try_recv().is_ok() {}
        self.shared.retry.clear();
        info!(worker = %self.name(), "worker pool stopped");
    }
}

impl<P> Drop for WorkerPool<P> {
    fn drop(&mut self) {
        // Runners hold their own Arc; make sure they wind down.
        self.shared.shutdown.send_replace(true);
    }
}

impl<P> Shared<P>
where
    P: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn run(self: Arc<Self>, id: usize) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            if let Some(item) = self.retry.pop_eligible(Instant::now()) {
                self.process(item, id).await;
                continue;
            }

            let idle = self.config.idle_poll;
            let wait = self
                .retry
                .next_due()
                .map(|due| due.saturating_duration_since(Instant::now()).min(idle))
                .unwrap_or(idle);

            tokio::select! {
                biased;
                _ = shutdown.changed() => {}
                fresh = self.next_fresh() => match fresh {
                    Some(item) => self.process(item, id).await,
                    None => break,
                },
                _ = self.retry_ready.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!(worker = %self.name(), id, reason = "cancelled", "worker stopping");
    }

    async fn next_fresh(&self) -> Option<WorkItem<P>> {
        self.intake_rx.lock().await.recv().await
    }

    async fn process(&self, mut item: WorkItem<P>, runner: usize) {
        let seq = item.seq();
        let err = match self.handler.handle(&item).await {
            Ok(()) => {
                counter!("pool_jobs_succeeded_total", "pool" => self.name().to_string()).increment(1);
                debug!(worker = %self.name(), runner, job_id = seq, "job done");
                return;
            }
            Err(err) => err,
        };

        error!(
            worker = %self.name(),
            runner,
            job_id = seq,
            attempts = item.attempts(),
            error = %err,
            "worker failed processing job"
        );

        if err.is_fatal() || item.retries_remaining() < 1 {
            self.fail(item, err);
            return;
        }

        let delay = (self.backoff)(item.attempts());
        item.schedule_retry(delay, Instant::now());
        match self.retry.push(item) {
            Ok(()) => {
                counter!("pool_jobs_retried_total", "pool" => self.name().to_string()).increment(1);
                info!(worker = %self.name(), job_id = seq, retry_in = ?delay, "worker scheduled retry for job");
                self.retry_ready.notify_waiters();
            }
            Err(item) => {
                warn!(worker = %self.name(), job_id = seq, "retry queue full, failing job");
                self.fail(item, JobError::retryable(format!("retry queue full: {}", err.reason())));
            }
        }
    }

    fn fail(&self, item: WorkItem<P>, reason: JobError) {
        counter!("pool_jobs_failed_total", "pool" => self.name().to_string()).increment(1);
        let seq = item.seq();
        let attempts = item.attempts();

        let Some(tx) = &self.dead_letter_tx else {
            warn!(worker = %self.name(), job_id = seq, attempts, error = %reason, "dropping failed job");
            return;
        };

        match tx.try_send(WorkItemResult { item, reason }) {
            Ok(()) => {
                counter!("pool_dead_letter_total", "pool" => self.name().to_string()).increment(1);
                info!(worker = %self.name(), job_id = seq, attempts, "job moved to dead-letter queue");
            }
            Err(TrySendError::Full(res)) => {
                error!(
                    worker = %self.name(),
                    job_id = seq,
                    error = %res.reason,
                    "dead-letter queue full, dropping failed job"
                );
            }
            Err(TrySendError::Closed(res)) => {
                warn!(
                    worker = %self.name(),
                    job_id = seq,
                    error = %res.reason,
                    "dead-letter receiver gone, dropping failed job"
                );
            }
        }
    }
}
