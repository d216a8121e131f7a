// src/ingest/types.rs
use anyhow::Result;

use crate::event::Event;

/// One decoded event plus its encoded size, for throughput stats.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
    pub event: Event,
    pub bytes: usize,
}

/// A resumable stream of events.
#[async_trait::async_trait]
pub trait EventSource: Send {
    fn name(&self) -> &'static str;

    /// (Re)attach to the stream. Events older than `cursor` (unix micros) are
    /// not delivered.
    async fn connect(&mut self, cursor: Option<i64>) -> Result<()>;

    /// Next event; `Ok(None)` once the stream has ended for good.
    ///
    /// Must be cancel safe: the consumer races it against shutdown, and a
    /// dropped call must not lose a partially read event.
    async fn next_event(&mut self) -> Result<Option<SourceEvent>>;
}
