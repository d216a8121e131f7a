// src/event.rs
//! Jetstream event model: the commit envelope and the `app.bsky.feed.post`
//! record carried inside it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

pub const POST_COLLECTION: &str = "app.bsky.feed.post";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Commit,
    Identity,
    Account,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    #[serde(default)]
    pub rev: String,
    pub operation: Operation,
    pub collection: String,
    pub rkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    #[serde(default)]
    pub cid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub did: String,
    pub time_us: i64,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<Commit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub root: StrongRef,
    pub parent: StrongRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPost {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub langs: Vec<String>,
}

impl FeedPost {
    pub fn is_reply(&self) -> bool {
        self.reply.is_some()
    }
}

impl Event {
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// A create/update commit in the post collection.
    pub fn is_post_write(&self) -> bool {
        matches!(
            &self.commit,
            Some(c) if c.collection == POST_COLLECTION
                && matches!(c.operation, Operation::Create | Operation::Update)
        )
    }

    /// `at://<did>/<collection>/<rkey>`, if the event carries a commit.
    pub fn uri(&self) -> Option<String> {
        self.commit
            .as_ref()
            .map(|c| format!("at://{}/{}/{}", self.did, c.collection, c.rkey))
    }

    pub fn decode_post(&self) -> Result<FeedPost, DecodeError> {
        let commit = self.commit.as_ref().ok_or(DecodeError::MissingCommit)?;
        let record = commit.record.as_ref().ok_or(DecodeError::MissingRecord)?;
        Ok(FeedPost::deserialize(record)?)
    }
}
