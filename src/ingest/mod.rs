// src/ingest/mod.rs
pub mod consumer;
pub mod jsonl;
pub mod types;

pub use consumer::{run_consumer, spawn_stats_reporter, ConsumerExit, ConsumerOptions, ConsumerStats};
pub use jsonl::JsonLinesSource;
pub use types::{EventSource, SourceEvent};

use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        metrics::describe_counter!("consumer_events_read_total", "Events read from the event source.");
        metrics::describe_counter!(
            "consumer_malformed_events_total",
            "Source lines that could not be decoded as events."
        );
    });
}
