// src/ingest/consumer.rs
//! Event consumer loop: pulls from an [`EventSource`], tracks the resumption
//! cursor, reconnects on failure and hands every event to the dispatcher.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::ingest::types::EventSource;

/// How far behind the last seen event a reconnect resumes, in microseconds.
pub const REWIND_US: i64 = 100_000;

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub reconnect_pause: Duration,
    pub stats_interval: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            reconnect_pause: Duration::from_secs(1),
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Why [`run_consumer`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    Shutdown,
    EndOfStream,
}

/// Counters shared between the consumer and its stats reporter.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    events_read: AtomicU64,
    bytes_read: AtomicU64,
    cursor: AtomicI64,
}

impl ConsumerStats {
    pub fn new(cursor: Option<i64>) -> Arc<Self> {
        let stats = Self::default();
        stats.cursor.store(cursor.unwrap_or(0), Ordering::Relaxed);
        Arc::new(stats)
    }

    pub fn events_read(&self) -> u64 {
        self.events_read.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Time of the last event seen (unix micros); `None` before the first one.
    pub fn cursor(&self) -> Option<i64> {
        Some(self.cursor.load(Ordering::Relaxed)).filter(|c| *c > 0)
    }

    fn record(&self, time_us: i64, bytes: usize) {
        self.events_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
        self.cursor.fetch_max(time_us, Ordering::Relaxed);
    }

    fn log(&self) {
        let events = self.events_read();
        let bytes = self.bytes_read();
        info!(
            events_read = events,
            bytes_read = bytes,
            avg_event_size = if events == 0 { 0 } else { bytes / events },
            cursor = self.cursor().unwrap_or_default(),
            "stats"
        );
    }
}

/// Log stats every `every` until shutdown.
pub fn spawn_stats_reporter(
    stats: Arc<ConsumerStats>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => stats.log(),
            }
        }
    })
}

/// Consume until shutdown or end of stream. The resumption cursor lives in
/// `stats` so a caller can resume a later run from it.
pub async fn run_consumer(
    source: &mut dyn EventSource,
    dispatcher: &Dispatcher,
    stats: &ConsumerStats,
    mut shutdown: watch::Receiver<bool>,
    opts: &ConsumerOptions,
) -> ConsumerExit {
    crate::ingest::ensure_metrics_described();
    let mut resume = stats.cursor();
    'connect: loop {
        if *shutdown.borrow_and_update() {
            return ConsumerExit::Shutdown;
        }
        if let Err(e) = source.connect(resume).await {
            warn!(source = source.name(), error = %e, "failed to connect event source");
            if pause(&mut shutdown, opts.reconnect_pause).await {
                return ConsumerExit::Shutdown;
            }
            continue 'connect;
        }
        info!(source = source.name(), cursor = resume.unwrap_or_default(), "event source connected");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => return ConsumerExit::Shutdown,
                next = source.next_event() => next,
            };
            match next {
                Ok(Some(ev)) => {
                    counter!("consumer_events_read_total").increment(1);
                    stats.record(ev.event.time_us, ev.bytes);
                    dispatcher.dispatch(ev.event).await;
                }
                Ok(None) => {
                    info!(source = source.name(), "event source ended");
                    return ConsumerExit::EndOfStream;
                }
                Err(e) => {
                    resume = stats.cursor().map(|c| c - REWIND_US);
                    warn!(source = source.name(), error = %e, "event source failed, reconnecting");
                    if pause(&mut shutdown, opts.reconnect_pause).await {
                        return ConsumerExit::Shutdown;
                    }
                    continue 'connect;
                }
            }
        }
    }
}

/// Sleep unless shutdown arrives first. Returns true on shutdown.
async fn pause(shutdown: &mut watch::Receiver<bool>, d: Duration) -> bool {
    tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => true,
        _ = tokio::time::sleep(d) => false,
    }
}
