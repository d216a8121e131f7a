// src/worker/mod.rs
//! Generic retrying job pool used by every feed destination.

pub mod backoff;
pub mod item;
pub mod pool;

pub use backoff::{constant, default_backoff, exponential, BackoffFn};
pub use item::{WorkItem, WorkItemResult};
pub use pool::{PoolConfig, PoolStats, WorkHandler, WorkerPool};
