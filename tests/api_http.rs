// tests/api_http.rs
//
// HTTP-level tests for the per-feed router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use feed_sieve::api::{create_router, FeedApiState};
use feed_sieve::config::AppConfig;
use feed_sieve::store::{InMemoryPostStore, PostRecord, PostStore};

const BODY_LIMIT: usize = 1024 * 1024;

const CONFIG: &str = r#"
[[feeds]]
id = "plain"
name = "Plain"
port = 0

[[feeds]]
id = "pinned"
name = "Pinned"
port = 0
pinned_uri = "at://did:plc:me/app.bsky.feed.post/pin"

[feeds.publish]
service_host = "feeds.example.com"
service_did = "did:web:feeds.example.com"
"#;

async fn router_for(feed: &str, records: &[(&str, i64, &str)]) -> Router {
    let cfg = AppConfig::from_toml_str(CONFIG).expect("config");
    let store = Arc::new(InMemoryPostStore::new());
    for (uri, ts, cid) in records {
        store
            .insert(PostRecord {
                uri: uri.to_string(),
                cid: cid.to_string(),
                reply_parent: None,
                reply_root: None,
                indexed_at: *ts,
            })
            .await
            .unwrap();
    }
    create_router(FeedApiState {
        feed: Arc::new(cfg.feed(feed).expect("feed").clone()),
        store,
    })
}

async fn get(app: Router, uri: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, String::from_utf8(bytes).expect("utf8"))
}

fn skeleton_posts(body: &str) -> (String, Vec<String>) {
    let v: Json = serde_json::from_str(body).expect("json body");
    let cursor = v["cursor"].as_str().expect("cursor").to_string();
    let posts = v["feed"]
        .as_array()
        .expect("feed array")
        .iter()
        .map(|p| p["post"].as_str().expect("post uri").to_string())
        .collect();
    (cursor, posts)
}

const SKELETON: &str = "/xrpc/app.bsky.feed.getFeedSkeleton?feed=at://did:plc:me/app.bsky.feed.generator/plain";

#[tokio::test]
async fn health_returns_ok() {
    let (status, body) = get(router_for("plain", &[]).await, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn cursor_round_trip_walks_pages() {
    let records = [("at://b", 100, "b"), ("at://a", 90, "a")];

    let (status, body) = get(router_for("plain", &records).await, &format!("{SKELETON}&limit=1")).await;
    assert_eq!(status, StatusCode::OK);
    let (cursor, posts) = skeleton_posts(&body);
    assert_eq!(posts, vec!["at://b"]);
    assert_eq!(cursor, "100::b");

    let (status, body) = get(
        router_for("plain", &records).await,
        &format!("{SKELETON}&limit=1&cursor={cursor}"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (cursor, posts) = skeleton_posts(&body);
    assert_eq!(posts, vec!["at://a"]);
    assert_eq!(cursor, "90::a");

    let (status, body) = get(
        router_for("plain", &records).await,
        &format!("{SKELETON}&limit=1&cursor={cursor}"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Posts not found");
}

#[tokio::test]
async fn default_limit_and_order() {
    let records: Vec<(String, i64, String)> = (0..30)
        .map(|i| (format!("at://p{i}"), 1_000 + i, format!("c{i}")))
        .collect();
    let borrowed: Vec<(&str, i64, &str)> = records
        .iter()
        .map(|(u, t, c)| (u.as_str(), *t, c.as_str()))
        .collect();

    let (status, body) = get(router_for("plain", &borrowed).await, SKELETON).await;
    assert_eq!(status, StatusCode::OK);
    let (cursor, posts) = skeleton_posts(&body);
    assert_eq!(posts.len(), 25);
    assert_eq!(posts[0], "at://p29");
    assert_eq!(cursor, "1005::c5");
}

#[tokio::test]
async fn pinned_post_leads_first_page_only() {
    let records = [("at://b", 100, "b"), ("at://a", 90, "a")];
    let uri = "/xrpc/app.bsky.feed.getFeedSkeleton?limit=1";

    let (_, body) = get(router_for("pinned", &records).await, uri).await;
    let (_, posts) = skeleton_posts(&body);
    assert_eq!(posts, vec!["at://did:plc:me/app.bsky.feed.post/pin", "at://b"]);

    let (_, body) = get(router_for("pinned", &records).await, &format!("{uri}&cursor=100::b")).await;
    let (_, posts) = skeleton_posts(&body);
    assert_eq!(posts, vec!["at://a"]);
}

#[tokio::test]
async fn malformed_params_are_client_errors() {
    let records = [("at://b", 100, "b")];
    for query in ["limit=abc", "limit=0", "limit=-1", "cursor=nonsense", "cursor=abc::b", "cursor=100::"] {
        let (status, body) = get(router_for("plain", &records).await, &format!("{SKELETON}&{query}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{query}");
        assert!(body.starts_with("Bad request: malformed"), "{query}: {body}");
    }
}

#[tokio::test]
async fn empty_feed_is_not_found() {
    let (status, _) = get(router_for("plain", &[]).await, SKELETON).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn did_document_served_when_published() {
    for path in ["/.well-known/did.json", "/.well-known/atproto-did"] {
        let (status, body) = get(router_for("pinned", &[]).await, path).await;
        assert_eq!(status, StatusCode::OK);
        let v: Json = serde_json::from_str(&body).unwrap();
        assert_eq!(v["id"], "did:web:feeds.example.com");
        assert_eq!(v["service"][0]["type"], "BskyFeedGenerator");
        assert_eq!(v["service"][0]["serviceEndpoint"], "https://feeds.example.com");
    }

    let (status, _) = get(router_for("plain", &[]).await, "/.well-known/did.json").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
