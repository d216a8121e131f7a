// src/ingest/jsonl.rs
//! Replays Jetstream events from newline-delimited JSON (a capture file or stdin).

use std::path::Path;

use anyhow::{Context, Result};
use metrics::counter;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::event::Event;
use crate::ingest::types::{EventSource, SourceEvent};

pub struct JsonLinesSource<R> {
    reader: R,
    cursor: Option<i64>,
    /// Bytes of the line being read. Survives a cancelled `next_event`.
    line: Vec<u8>,
    line_no: u64,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            cursor: None,
            line: Vec::new(),
            line_no: 0,
        }
    }
}

impl JsonLinesSource<BufReader<tokio::fs::File>> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open event file {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl JsonLinesSource<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait::async_trait]
impl<R> EventSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn connect(&mut self, cursor: Option<i64>) -> Result<()> {
        // A byte stream cannot seek back; the cursor only filters what follows.
        self.cursor = cursor;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
        loop {
            // `read_until` appends, so a partial line from a cancelled call is
            // completed here rather than lost.
            let read = self.reader.read_until(b'\n', &mut self.line).await?;
            if read == 0 && self.line.is_empty() {
                return Ok(None);
            }
            let line = std::mem::take(&mut self.line);
            self.line_no += 1;

            let raw = match std::str::from_utf8(&line) {
                Ok(raw) => raw.trim(),
                Err(e) => {
                    counter!("consumer_malformed_events_total").increment(1);
                    warn!(line = self.line_no, error = %e, "skipping non-utf8 line");
                    continue;
                }
            };
            if raw.is_empty() {
                continue;
            }
            let event = match Event::from_json(raw) {
                Ok(event) => event,
                Err(e) => {
                    counter!("consumer_malformed_events_total").increment(1);
                    warn!(line = self.line_no, error = %e, "skipping undecodable event");
                    continue;
                }
            };
            if self.cursor.is_some_and(|c| event.time_us < c) {
                debug!(line = self.line_no, time_us = event.time_us, "skipping event before cursor");
                continue;
            }
            return Ok(Some(SourceEvent {
                event,
                bytes: line.len(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINES: &str = concat!(
        r#"{"did":"a","time_us":10,"kind":"identity"}"#,
        "\n\n",
        "not json\n",
        r#"{"did":"b","time_us":20,"kind":"commit","commit":{"operation":"delete","collection":"app.bsky.feed.post","rkey":"k"}}"#,
        "\n",
        r#"{"did":"c","time_us":30,"kind":"account"}"#,
    );

    #[tokio::test]
    async fn reads_events_and_skips_garbage() {
        let mut src = JsonLinesSource::new(LINES.as_bytes());
        src.connect(None).await.unwrap();
        let mut dids = Vec::new();
        while let Some(ev) = src.next_event().await.unwrap() {
            assert!(ev.bytes > 0);
            dids.push(ev.event.did);
        }
        assert_eq!(dids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cursor_skips_older_events() {
        let mut src = JsonLinesSource::new(LINES.as_bytes());
        src.connect(Some(20)).await.unwrap();
        let first = src.next_event().await.unwrap().unwrap();
        assert_eq!(first.event.time_us, 20);
    }

    #[tokio::test]
    async fn cancelled_read_keeps_partial_line() {
        use std::time::Duration;
        use tokio::io::AsyncWriteExt;

        let (mut tx, rx) = tokio::io::duplex(256);
        let mut src = JsonLinesSource::new(BufReader::new(rx));
        src.connect(None).await.unwrap();

        tx.write_all(br#"{"did":"a","time_us":1,"#).await.unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(50), src.next_event()).await;
        assert!(pending.is_err());

        tx.write_all(b"\"kind\":\"identity\"}\n").await.unwrap();
        tx.write_all(br#"{"did":"b","time_us":2,"kind":"identity"}"#).await.unwrap();
        tx.write_all(b"\n").await.unwrap();
        drop(tx);

        let mut dids = Vec::new();
        while let Some(ev) = src.next_event().await.unwrap() {
            dids.push(ev.event.did);
        }
        assert_eq!(dids, vec!["a", "b"]);
    }
}
