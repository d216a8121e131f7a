// src/dispatch.rs
//! Fan-out of inbound events to every destination whose policy admits them.

use std::sync::Arc;

use metrics::counter;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, FeedConfig};
use crate::error::ConfigError;
use crate::event::Event;
use crate::feed::Destination;
use crate::store::PostStore;
use crate::worker::BackoffFn;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        metrics::describe_counter!("feed_events_total", "Events offered to the dispatcher.");
        metrics::describe_counter!("feed_posts_admitted_total", "Posts admitted per feed.");
        metrics::describe_counter!(
            "feed_posts_rejected_total",
            "Posts rejected per feed, labelled by deciding rule."
        );
    });
}

pub struct Dispatcher {
    destinations: Vec<Destination>,
}

impl Dispatcher {
    /// Build and start one destination per configured feed. `store_for` supplies
    /// each feed's store so callers can keep stores alive across reloads.
    pub fn start(
        config: &AppConfig,
        store_for: impl FnMut(&FeedConfig) -> Arc<dyn PostStore>,
    ) -> Result<Self, ConfigError> {
        Self::start_with_backoff(config, store_for, None)
    }

    /// As [`Dispatcher::start`], overriding every pool's backoff.
    pub fn start_with_backoff(
        config: &AppConfig,
        mut store_for: impl FnMut(&FeedConfig) -> Arc<dyn PostStore>,
        backoff: Option<BackoffFn>,
    ) -> Result<Self, ConfigError> {
        ensure_metrics_described();
        let analyzers = config.build_analyzers()?;

        // Compile everything before starting anything.
        let policies = config
            .feeds
            .iter()
            .map(|f| f.build_policy(&analyzers))
            .collect::<Result<Vec<_>, _>>()?;

        let destinations = config
            .feeds
            .iter()
            .zip(policies)
            .map(|(feed, policy)| {
                info!(feed = %feed.id, name = %feed.name, "starting feed");
                Destination::start(
                    feed.clone(),
                    policy,
                    store_for(feed),
                    config.writer_capacity,
                    config.debug,
                    backoff.clone(),
                )
            })
            .collect();

        Ok(Self { destinations })
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn destination(&self, id: &str) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.id() == id)
    }

    /// Offer `event` to every destination. Returns how many accepted it.
    ///
    /// Blocks while an admitting destination's intake is full.
    pub async fn dispatch(&self, event: Event) -> usize {
        counter!("feed_events_total").increment(1);
        if !event.is_post_write() {
            return 0;
        }

        let post = match event.decode_post() {
            Ok(post) => post,
            Err(e) => {
                warn!(did = %event.did, error = %e, "skipping malformed post");
                return 0;
            }
        };

        let event = Arc::new(event);
        let mut accepted = 0;
        for dest in &self.destinations {
            let decision = dest.policy().decide(&post.text, post.is_reply());
            if !decision.is_admitted() {
                counter!(
                    "feed_posts_rejected_total",
                    "feed" => dest.id().to_string(),
                    "rule" => decision.label()
                )
                .increment(1);
                continue;
            }

            counter!("feed_posts_admitted_total", "feed" => dest.id().to_string()).increment(1);
            match dest.submit(event.clone()).await {
                Ok(job_id) => {
                    debug!(feed = %dest.id(), job_id, rule = decision.label(), "post admitted");
                    accepted += 1;
                }
                Err(e) => warn!(feed = %dest.id(), error = %e, "could not queue post"),
            }
        }
        accepted
    }

    /// Stop every destination; each waits for its in-flight handler calls.
    pub async fn stop_all(self) {
        for dest in self.destinations {
            dest.stop().await;
        }
    }
}
