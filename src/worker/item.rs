// src/worker/item.rs
use std::time::Duration;

use tokio::time::Instant;

use crate::error::JobError;

/// A unit of pending work owned by one pool.
///
/// Only the pool's runners touch the retry bookkeeping; a given item sits in
/// exactly one queue (or one runner) at a time.
#[derive(Debug, Clone)]
pub struct WorkItem<P> {
    pool: String,
    seq: u64,
    payload: P,
    attempts: u32,
    retries_remaining: u32,
    not_before: Instant,
}

impl<P> WorkItem<P> {
    pub(crate) fn new(pool: &str, seq: u64, payload: P, retries: u32) -> Self {
        Self {
            pool: pool.to_string(),
            seq,
            payload,
            attempts: 0,
            retries_remaining: retries,
            not_before: Instant::now(),
        }
    }

    /// Name of the pool (destination) that owns this item.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Failed attempts that were rescheduled so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn not_before(&self) -> Instant {
        self.not_before
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        now >= self.not_before
    }

    /// Spend one retry and park the item until `now + delay`.
    pub(crate) fn schedule_retry(&mut self, delay: Duration, now: Instant) {
        self.attempts += 1;
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
        self.not_before = now + delay;
    }
}

/// A terminally failed item and the error from its last attempt.
#[derive(Debug)]
pub struct WorkItemResult<P> {
    pub item: WorkItem<P>,
    pub reason: JobError,
}
