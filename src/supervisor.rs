// src/supervisor.rs
//! Service lifecycle: build destinations and listeners from config, consume
//! until told to stop or reload, tear everything down, and on reload start
//! over from a freshly read config.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{create_router, FeedApiState};
use crate::config::AppConfig;
use crate::dispatch::Dispatcher;
use crate::ingest::{run_consumer, spawn_stats_reporter, ConsumerOptions, ConsumerStats, EventSource};
use crate::store::{InMemoryPostStore, PostStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Reload,
}

/// Forward OS signals: Ctrl-C and SIGTERM stop, SIGHUP reloads.
pub fn spawn_signal_forwarder(tx: mpsc::Sender<Signal>) -> Result<JoinHandle<()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        let mut hup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
        Ok(tokio::spawn(async move {
            loop {
                let sig = tokio::select! {
                    _ = tokio::signal::ctrl_c() => Signal::Shutdown,
                    _ = term.recv() => Signal::Shutdown,
                    _ = hup.recv() => Signal::Reload,
                };
                info!(signal = ?sig, "signal received");
                if tx.send(sig).await.is_err() || sig == Signal::Shutdown {
                    break;
                }
            }
        }))
    }
    #[cfg(not(unix))]
    {
        Ok(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(Signal::Shutdown).await;
            }
        }))
    }
}

pub struct Supervisor {
    config_path: PathBuf,
    source: Box<dyn EventSource>,
    signals: mpsc::Receiver<Signal>,
    stores: HashMap<String, Arc<dyn PostStore>>,
    stats: Arc<ConsumerStats>,
    options: ConsumerOptions,
}

impl Supervisor {
    pub fn new(config_path: impl Into<PathBuf>, source: Box<dyn EventSource>, signals: mpsc::Receiver<Signal>) -> Self {
        Self {
            config_path: config_path.into(),
            source,
            signals,
            stores: HashMap::new(),
            stats: ConsumerStats::new(None),
            options: ConsumerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }

    /// Store used for `feed`; created on first use and kept across reloads.
    pub fn store(&mut self, feed: &str) -> Arc<dyn PostStore> {
        store_entry(&mut self.stores, feed)
    }

    /// Run until a shutdown signal (or the signal channel closes).
    ///
    /// A reload whose config fails to load or start ends the run with that error.
    pub async fn run(mut self, initial: AppConfig) -> Result<()> {
        let mut config = initial;
        loop {
            let signal = self.run_generation(&config).await?;
            if signal != Signal::Reload {
                info!("shutdown");
                return Ok(());
            }
            info!(path = %self.config_path.display(), "reloading configuration");
            config = AppConfig::from_path(&self.config_path).map_err(|e| {
                error!(error = %e, "reload failed, service stopped");
                anyhow::Error::new(e)
            })?;
        }
    }

    async fn run_generation(&mut self, config: &AppConfig) -> Result<Signal> {
        let dispatcher = {
            let stores = &mut self.stores;
            Dispatcher::start(config, |feed| store_entry(stores, &feed.id))?
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let listeners = match bind_listeners(&dispatcher, &stop_rx).await {
            Ok(listeners) => listeners,
            Err(e) => {
                dispatcher.stop_all().await;
                return Err(e);
            }
        };
        let reporter = spawn_stats_reporter(self.stats.clone(), self.options.stats_interval, stop_rx.clone());

        let signal = {
            let consumer = run_consumer(
                self.source.as_mut(),
                &dispatcher,
                &self.stats,
                stop_rx.clone(),
                &self.options,
            );
            tokio::pin!(consumer);
            let mut consumer_done = false;

            let signal = loop {
                tokio::select! {
                    sig = self.signals.recv() => break sig.unwrap_or(Signal::Shutdown),
                    exit = &mut consumer, if !consumer_done => {
                        consumer_done = true;
                        info!(?exit, "consumer finished; serving until signalled");
                    }
                }
            };
            stop_tx.send_replace(true);
            if !consumer_done {
                consumer.await;
            }
            signal
        };

        dispatcher.stop_all().await;
        for listener in listeners {
            match listener.await {
                Ok(Err(e)) => warn!(error = %e, "feed listener failed"),
                Err(e) => warn!(error = %e, "feed listener task failed"),
                Ok(Ok(())) => {}
            }
        }
        let _ = reporter.await;
        Ok(signal)
    }
}

fn store_entry(stores: &mut HashMap<String, Arc<dyn PostStore>>, feed: &str) -> Arc<dyn PostStore> {
    stores
        .entry(feed.to_string())
        .or_insert_with(|| Arc::new(InMemoryPostStore::new()))
        .clone()
}

/// Bind every feed's listener before serving any, so a bad address fails the
/// whole generation.
async fn bind_listeners(
    dispatcher: &Dispatcher,
    stop: &watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<Result<()>>>> {
    let mut bound = Vec::new();
    for dest in dispatcher.destinations() {
        let addr = dest.config().bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("feed `{}`: failed to bind {addr}", dest.id()))?;
        let state = FeedApiState {
            feed: dest.config().clone(),
            store: dest.store().clone(),
        };
        bound.push((dest.id().to_string(), listener, state));
    }

    Ok(bound
        .into_iter()
        .map(|(feed, listener, state)| {
            let mut stop = stop.clone();
            tokio::spawn(async move {
                let addr = listener.local_addr()?;
                info!(feed = %feed, %addr, "feed listener started");
                axum::serve(listener, create_router(state))
                    .with_graceful_shutdown(async move {
                        let _ = stop.wait_for(|s| *s).await;
                    })
                    .await?;
                info!(feed = %feed, "feed listener stopped");
                Ok::<(), anyhow::Error>(())
            })
        })
        .collect())
}
