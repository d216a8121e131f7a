// src/error.rs
//! Error types shared across the matching engine, the worker pool and config loading.

use std::fmt;

/// Problems detected while constructing a `TextAnalyzer`.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("pattern must not be empty")]
    EmptyPattern,

    #[error("trigger must not be empty")]
    EmptyTrigger,

    #[error("confidence for pattern `{pattern}` is not a finite number")]
    NonFiniteWeight { pattern: String },

    #[error("threshold is not a finite number")]
    NonFiniteThreshold,
}

/// Problems detected while compiling a feed's matching policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("feed `{feed}`: invalid {which} expression: {source}")]
    Regex {
        feed: String,
        which: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("feed `{feed}`: analyzer `{analyzer}` is invalid: {source}")]
    Analyzer {
        feed: String,
        analyzer: String,
        #[source]
        source: AnalyzerError,
    },

    #[error("feed `{feed}`: unknown exclusion filter `{analyzer}`")]
    UnknownFilter { feed: String, analyzer: String },
}

/// Configuration loading/validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate feed id `{0}`")]
    DuplicateFeed(String),

    #[error("duplicate analyzer id `{0}`")]
    DuplicateAnalyzer(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Errors returned by `WorkerPool::submit`.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool `{0}` is stopped")]
    Stopped(String),
}

/// Failure reported by a work handler.
///
/// `Fatal` failures are never retried; `Retryable` ones are rescheduled while
/// the item still has retry budget left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    Fatal(String),
    Retryable(String),
}

impl JobError {
    pub fn fatal(reason: impl fmt::Display) -> Self {
        JobError::Fatal(reason.to_string())
    }

    pub fn retryable(reason: impl fmt::Display) -> Self {
        JobError::Retryable(reason.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Fatal(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            JobError::Fatal(r) | JobError::Retryable(r) => r,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Fatal(r) => write!(f, "fatal: {r}"),
            JobError::Retryable(r) => write!(f, "{r}"),
        }
    }
}

impl std::error::Error for JobError {}

/// A post record could not be decoded from an event.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("event has no commit")]
    MissingCommit,

    #[error("commit has no record")]
    MissingRecord,

    #[error("failed to unmarshal post: {0}")]
    Json(#[from] serde_json::Error),
}

/// A feed pagination cursor did not have the `<timestamp>::<cid>` shape.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("malformed cursor")]
    Malformed,
}
