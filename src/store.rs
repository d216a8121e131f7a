// src/store.rs
//! Post persistence: the record type, keyset cursor, the `PostStore` seam and
//! the buffered single-consumer writer feeding it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::CursorError;

pub const DEFAULT_WRITER_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub uri: String,
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_root: Option<String>,
    /// Unix milliseconds at which the post was admitted.
    pub indexed_at: i64,
}

impl PostRecord {
    pub fn cursor(&self) -> FeedCursor {
        FeedCursor {
            indexed_at: self.indexed_at,
            cid: self.cid.clone(),
        }
    }
}

/// Keyset position `<indexed_at>::<cid>`; a page continues strictly after it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeedCursor {
    pub indexed_at: i64,
    pub cid: String,
}

impl FromStr for FeedCursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ts, cid) = s.split_once("::").ok_or(CursorError::Malformed)?;
        if ts.is_empty() || cid.is_empty() {
            return Err(CursorError::Malformed);
        }
        let indexed_at = ts.parse::<i64>().map_err(|_| CursorError::Malformed)?;
        Ok(Self {
            indexed_at,
            cid: cid.to_string(),
        })
    }
}

impl fmt::Display for FeedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.indexed_at, self.cid)
    }
}

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Insert unless a record with the same URI exists. Returns whether it was stored.
    async fn insert(&self, record: PostRecord) -> Result<bool>;

    /// Up to `limit` records ordered by `(indexed_at, cid)` descending, strictly
    /// after `after` when given.
    async fn page(&self, limit: usize, after: Option<&FeedCursor>) -> Result<Vec<PostRecord>>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[derive(Default)]
struct Tables {
    by_uri: HashMap<String, PostRecord>,
    order: BTreeSet<(i64, String, String)>,
}

/// Process-local store. Survives config reloads when shared by `Arc`, not restarts.
#[derive(Default)]
pub struct InMemoryPostStore {
    tables: RwLock<Tables>,
}

impl InMemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PostStore for InMemoryPostStore {
    async fn insert(&self, record: PostRecord) -> Result<bool> {
        let mut t = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if t.by_uri.contains_key(&record.uri) {
            return Ok(false);
        }
        t.order
            .insert((record.indexed_at, record.cid.clone(), record.uri.clone()));
        t.by_uri.insert(record.uri.clone(), record);
        Ok(true)
    }

    async fn page(&self, limit: usize, after: Option<&FeedCursor>) -> Result<Vec<PostRecord>> {
        let t = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let keys: Box<dyn Iterator<Item = &(i64, String, String)> + '_> = match after {
            // Everything sorting below (ts, cid, "") is strictly before the cursor key.
            Some(c) => Box::new(t.order.range(..(c.indexed_at, c.cid.clone(), String::new())).rev()),
            None => Box::new(t.order.iter().rev()),
        };
        Ok(keys
            .take(limit)
            .filter_map(|(_, _, uri)| t.by_uri.get(uri).cloned())
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_uri
            .len())
    }
}

/// Fire-and-forget handle onto a feed's single writer task.
#[derive(Clone)]
pub struct PostWriter {
    feed: Arc<str>,
    tx: mpsc::Sender<PostRecord>,
}

impl PostWriter {
    /// Start the consumer task. It exits once every `PostWriter` clone is dropped
    /// and the buffer is drained.
    pub fn spawn(feed: &str, store: Arc<dyn PostStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let feed: Arc<str> = Arc::from(feed);
        let handle = tokio::spawn(drain(feed.clone(), store, rx));
        (Self { feed, tx }, handle)
    }

    /// Waits while the buffer is full; fails once the consumer is gone.
    pub async fn send(&self, record: PostRecord) -> Result<()> {
        self.tx
            .send(record)
            .await
            .map_err(|_| anyhow!("post writer for feed `{}` is closed", self.feed))
    }
}

async fn drain(feed: Arc<str>, store: Arc<dyn PostStore>, mut rx: mpsc::Receiver<PostRecord>) {
    while let Some(record) = rx.recv().await {
        let uri = record.uri.clone();
        match store.insert(record).await {
            Ok(true) => {
                counter!("store_posts_written_total", "feed" => feed.to_string()).increment(1);
                debug!(feed = %feed, %uri, "stored post");
            }
            Ok(false) => debug!(feed = %feed, %uri, "post already stored"),
            Err(e) => error!(feed = %feed, %uri, error = %e, "failed to store post"),
        }
    }
    info!(feed = %feed, "post writer stopped");
}
