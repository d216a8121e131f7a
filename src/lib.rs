// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod analyzer;
pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod feed;
pub mod ingest;
pub mod metrics;
pub mod policy;
pub mod store;
pub mod supervisor;
pub mod worker;

// ---- Re-exports for stable public API ----
pub use crate::analyzer::{SentimentMatch, TextAnalyzer};
pub use crate::api::create_router;
pub use crate::config::AppConfig;
pub use crate::dispatch::Dispatcher;
pub use crate::policy::{Admission, MatchingPolicy};
pub use crate::worker::{WorkHandler, WorkItem, WorkerPool};
