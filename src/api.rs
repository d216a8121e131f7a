// src/api.rs
//! Per-feed HTTP surface: the feed skeleton listing, the DID document and a
//! health check.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::FeedConfig;
use crate::store::{FeedCursor, PostStore};

pub const DEFAULT_LIMIT: usize = 25;
pub const MAX_LIMIT: usize = 100;

#[derive(Clone)]
pub struct FeedApiState {
    pub feed: Arc<FeedConfig>,
    pub store: Arc<dyn PostStore>,
}

pub fn create_router(state: FeedApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/xrpc/app.bsky.feed.getFeedSkeleton", get(get_feed_skeleton))
        .route("/.well-known/did.json", get(did_document))
        .route("/.well-known/atproto-did", get(did_document))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct SkeletonParams {
    #[serde(default)]
    pub feed: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkeletonItem {
    pub post: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedSkeleton {
    pub cursor: String,
    pub feed: Vec<SkeletonItem>,
}

/// Empty or missing means the default; anything else must be a positive integer.
fn parse_limit(raw: Option<&str>) -> Option<usize> {
    match raw.map(str::trim) {
        None | Some("") => Some(DEFAULT_LIMIT),
        Some(s) => s
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .map(|n| n.min(MAX_LIMIT)),
    }
}

fn bad_request(what: &str) -> Response {
    (StatusCode::BAD_REQUEST, format!("Bad request: malformed {what}")).into_response()
}

async fn get_feed_skeleton(
    State(state): State<FeedApiState>,
    Query(params): Query<SkeletonParams>,
) -> Response {
    info!(
        feed = params.feed.as_deref().unwrap_or_default(),
        limit = params.limit.as_deref().unwrap_or_default(),
        cursor = params.cursor.as_deref().unwrap_or_default(),
        "getFeedSkeleton params"
    );

    let Some(limit) = parse_limit(params.limit.as_deref()) else {
        return bad_request("limit param");
    };
    let cursor = match params.cursor.as_deref().filter(|c| !c.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<FeedCursor>() {
            Ok(c) => Some(c),
            Err(_) => return bad_request("cursor"),
        },
    };

    let posts = match state.store.page(limit, cursor.as_ref()).await {
        Ok(posts) => posts,
        Err(e) => {
            error!(feed = %state.feed.id, error = %e, "failed to read posts");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response();
        }
    };
    let Some(last) = posts.last() else {
        return (StatusCode::NOT_FOUND, "Posts not found").into_response();
    };

    let mut feed = Vec::with_capacity(posts.len() + 1);
    if cursor.is_none() {
        if let Some(pinned) = state.feed.pinned_uri.as_ref().filter(|p| !p.is_empty()) {
            feed.push(SkeletonItem { post: pinned.clone() });
        }
    }
    let next = last.cursor().to_string();
    feed.extend(posts.into_iter().map(|p| SkeletonItem { post: p.uri }));

    Json(FeedSkeleton { cursor: next, feed }).into_response()
}

async fn did_document(State(state): State<FeedApiState>) -> Response {
    let Some(publish) = state.feed.publish.as_ref() else {
        return (StatusCode::NOT_FOUND, "Not found").into_response();
    };
    Json(json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": publish.service_did,
        "service": [{
            "id": "#bsky_fg",
            "type": "BskyFeedGenerator",
            "serviceEndpoint": format!("https://{}", publish.service_host),
        }]
    }))
    .into_response()
}
