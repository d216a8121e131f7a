// tests/supervisor.rs
//
// Full service lifecycle over a replayed event stream: consume, reload, stop.

use std::fs;
use std::time::Duration;

use tokio::sync::mpsc;

use feed_sieve::config::AppConfig;
use feed_sieve::ingest::{ConsumerOptions, JsonLinesSource};
use feed_sieve::store::PostStore;
use feed_sieve::supervisor::{Signal, Supervisor};

const CONFIG: &str = r#"
[[feeds]]
id = "cats"
name = "Cats"
host = "127.0.0.1"
port = 0
match_expr = "cat"
"#;

fn events() -> &'static [u8] {
    concat!(
        r#"{"did":"did:plc:a","time_us":1000,"kind":"commit","commit":{"operation":"create","collection":"app.bsky.feed.post","rkey":"1","cid":"c1","record":{"text":"a cat"}}}"#,
        "\n",
        r#"{"did":"did:plc:a","time_us":2000,"kind":"commit","commit":{"operation":"create","collection":"app.bsky.feed.post","rkey":"2","cid":"c2","record":{"text":"a dog"}}}"#,
        "\n",
        r#"{"did":"did:plc:a","time_us":3000,"kind":"commit","commit":{"operation":"create","collection":"app.bsky.feed.post","rkey":"3","cid":"c3","record":{"text":"another cat"}}}"#,
        "\n",
    )
    .as_bytes()
}

fn options() -> ConsumerOptions {
    ConsumerOptions {
        reconnect_pause: Duration::from_millis(5),
        stats_interval: Duration::from_millis(50),
    }
}

async fn wait_for_len(store: &dyn PostStore, n: usize) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while store.len().await.unwrap() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("posts stored in time");
}

#[tokio::test]
async fn reload_keeps_stores_and_shutdown_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feeds.toml");
    fs::write(&path, CONFIG).unwrap();
    let cfg = AppConfig::from_path(&path).unwrap();

    let (tx, rx) = mpsc::channel(4);
    let mut sup = Supervisor::new(&path, Box::new(JsonLinesSource::new(events())), rx).with_options(options());
    let store = sup.store("cats");
    let stats = sup.stats().clone();
    let run = tokio::spawn(sup.run(cfg));

    wait_for_len(store.as_ref(), 2).await;
    assert_eq!(stats.events_read(), 3);
    assert_eq!(stats.cursor(), Some(3000));

    tx.send(Signal::Reload).await.unwrap();
    tx.send(Signal::Shutdown).await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("supervisor stops")
        .expect("join")
        .expect("clean shutdown");

    assert_eq!(store.len().await.unwrap(), 2);
}

#[tokio::test]
async fn failed_reload_stops_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feeds.toml");
    fs::write(&path, CONFIG).unwrap();
    let cfg = AppConfig::from_path(&path).unwrap();

    let (tx, rx) = mpsc::channel(4);
    let sup = Supervisor::new(&path, Box::new(JsonLinesSource::new(events())), rx).with_options(options());
    let run = tokio::spawn(sup.run(cfg));

    fs::write(&path, CONFIG.replace("match_expr = \"cat\"", "match_expr = \"(cat\"")).unwrap();
    tx.send(Signal::Reload).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("supervisor stops")
        .expect("join");
    assert!(result.is_err());
}
