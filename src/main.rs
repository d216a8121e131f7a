//! Feed generator service: binary entrypoint.
//! Loads the feed config, starts the metrics listener, then hands control to
//! the supervisor until a shutdown signal arrives.
//!
//! Events are read as JSON lines from the file named by `EVENTS_PATH`, or from
//! stdin when it is unset.

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feed_sieve::config::{config_path, AppConfig};
use feed_sieve::ingest::{EventSource, JsonLinesSource};
use feed_sieve::metrics::Metrics;
use feed_sieve::supervisor::{spawn_signal_forwarder, Supervisor};

const ENV_EVENTS_PATH: &str = "EVENTS_PATH";
const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

/// `RUST_LOG` filter (default `info`); `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(ENV_LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn open_source() -> anyhow::Result<Box<dyn EventSource>> {
    let source: Box<dyn EventSource> = match std::env::var(ENV_EVENTS_PATH) {
        Ok(path) => Box::new(JsonLinesSource::open(path).await?),
        Err(_) => Box::new(JsonLinesSource::stdin()),
    };
    Ok(source)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let path = config_path();
    let config = AppConfig::from_path(&path)
        .with_context(|| format!("failed to load feed config from {}", path.display()))?;
    info!(path = %path.display(), feeds = config.feeds.len(), "configuration loaded");

    if let Some(port) = config.metrics_port {
        let metrics = Metrics::init(config.feeds.len())?;
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("failed to bind metrics port {port}"))?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics.router()).await {
                error!(error = %e, "metrics listener failed");
            }
        });
        info!(port, "metrics listener started");
    }

    let (signal_tx, signal_rx) = mpsc::channel(4);
    spawn_signal_forwarder(signal_tx)?;

    let source = open_source().await?;
    Supervisor::new(path, source, signal_rx).run(config).await
}
