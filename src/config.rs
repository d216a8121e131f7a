// src/config.rs
//! Declarative feed configuration (TOML): shared analyzers, per-feed matching
//! rules, listener settings and pool tuning.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::analyzer::TextAnalyzer;
use crate::error::{ConfigError, PolicyError};
use crate::policy::MatchingPolicy;
use crate::store::DEFAULT_WRITER_CAPACITY;
use crate::worker::{exponential, BackoffFn, PoolConfig};

// --- env defaults & names ---
pub const DEFAULT_FEEDS_CONFIG_PATH: &str = "config/feeds.toml";
pub const ENV_FEEDS_CONFIG_PATH: &str = "FEEDS_CONFIG_PATH";

/// Resolve the config path from `FEEDS_CONFIG_PATH`, falling back to the default.
pub fn config_path() -> PathBuf {
    std::env::var(ENV_FEEDS_CONFIG_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_FEEDS_CONFIG_PATH))
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed_owner: String,
    #[serde(default)]
    pub feed_base: String,
    /// Echo every matched post to the log.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default = "default_writer_capacity")]
    pub writer_capacity: usize,
    #[serde(default)]
    pub analyzers: Vec<AnalyzerConfig>,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyzerConfig {
    /// Required for `[[analyzers]]`; ignored for inline `match_analyzer` blocks.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub any_trigger: bool,
    #[serde(default)]
    pub threshold: f64,
    #[serde(default)]
    pub patterns: BTreeMap<String, f64>,
}

impl AnalyzerConfig {
    pub fn build(&self) -> Result<TextAnalyzer, crate::error::AnalyzerError> {
        TextAnalyzer::new(
            self.triggers.clone(),
            self.patterns.clone(),
            self.threshold,
            self.any_trigger,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub id: String,
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub pinned_uri: Option<String>,
    #[serde(default)]
    pub match_expr: Option<String>,
    #[serde(default)]
    pub force_expr: Option<String>,
    #[serde(default)]
    pub include_replies: bool,
    #[serde(default)]
    pub exclusion_filters: Vec<String>,
    #[serde(default)]
    pub match_analyzer: Option<AnalyzerConfig>,
    #[serde(default)]
    pub publish: Option<PublishConfig>,
    #[serde(default)]
    pub pool: PoolSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    pub service_host: String,
    pub service_did: String,
    #[serde(default)]
    pub service_icon: Option<String>,
    #[serde(default)]
    pub service_short_name: Option<String>,
    #[serde(default)]
    pub service_human_name: Option<String>,
    #[serde(default)]
    pub service_description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub concurrency: usize,
    pub max_retries: u32,
    pub dead_letter: bool,
    pub queue_capacity: usize,
    pub backoff_base_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: 3,
            dead_letter: false,
            queue_capacity: 256,
            backoff_base_ms: 5_000,
        }
    }
}

impl PoolSettings {
    pub fn pool_config(&self, name: &str) -> PoolConfig {
        PoolConfig::new(name)
            .with_concurrency(self.concurrency)
            .with_max_retries(self.max_retries)
            .with_queue_capacity(self.queue_capacity)
            .with_dead_letter(self.dead_letter)
    }

    pub fn backoff(&self) -> BackoffFn {
        exponential(Duration::from_millis(self.backoff_base_ms))
    }
}

fn default_writer_capacity() -> usize {
    DEFAULT_WRITER_CAPACITY
}

impl AppConfig {
    /// Read, parse and validate the file at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `FEEDS_CONFIG_PATH` or `config/feeds.toml`.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::from_path(config_path())
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(toml_str)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural checks plus a trial build of every analyzer and policy, so a
    /// config that loads is a config that runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.writer_capacity == 0 {
            return Err(invalid("writer_capacity", "must be at least 1"));
        }

        let mut ids = HashSet::new();
        for a in &self.analyzers {
            if a.id.is_empty() {
                return Err(invalid("analyzers.id", "must not be empty"));
            }
            if !ids.insert(a.id.as_str()) {
                return Err(ConfigError::DuplicateAnalyzer(a.id.clone()));
            }
        }

        let mut feeds = HashSet::new();
        for f in &self.feeds {
            if f.id.is_empty() {
                return Err(invalid("feeds.id", "must not be empty"));
            }
            if !feeds.insert(f.id.as_str()) {
                return Err(ConfigError::DuplicateFeed(f.id.clone()));
            }
            if f.pool.concurrency == 0 {
                return Err(invalid(format!("feeds.{}.pool.concurrency", f.id), "must be at least 1"));
            }
            if f.pool.queue_capacity == 0 {
                return Err(invalid(format!("feeds.{}.pool.queue_capacity", f.id), "must be at least 1"));
            }
        }

        let analyzers = self.build_analyzers()?;
        for f in &self.feeds {
            f.build_policy(&analyzers)?;
        }
        Ok(())
    }

    /// Compile the shared `[[analyzers]]` by id.
    pub fn build_analyzers(&self) -> Result<BTreeMap<String, Arc<TextAnalyzer>>, ConfigError> {
        self.analyzers
            .iter()
            .map(|a| {
                let built = a.build().map_err(|source| PolicyError::Analyzer {
                    feed: String::new(),
                    analyzer: a.id.clone(),
                    source,
                })?;
                Ok((a.id.clone(), Arc::new(built)))
            })
            .collect()
    }

    pub fn feed(&self, id: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| f.id == id)
    }
}

impl FeedConfig {
    /// Compile this feed's policy against the shared analyzers.
    pub fn build_policy(
        &self,
        analyzers: &BTreeMap<String, Arc<TextAnalyzer>>,
    ) -> Result<MatchingPolicy, PolicyError> {
        let mut builder = MatchingPolicy::builder(&self.id).include_replies(self.include_replies);
        if let Some(expr) = &self.force_expr {
            builder = builder.force_expr(expr.as_str());
        }
        if let Some(expr) = &self.match_expr {
            builder = builder.match_expr(expr.as_str());
        }
        for name in &self.exclusion_filters {
            let analyzer = analyzers.get(name).ok_or_else(|| PolicyError::UnknownFilter {
                feed: self.id.clone(),
                analyzer: name.clone(),
            })?;
            builder = builder.exclusion_filter(name.as_str(), analyzer.clone());
        }
        if let Some(inline) = &self.match_analyzer {
            let analyzer = inline.build().map_err(|source| PolicyError::Analyzer {
                feed: self.id.clone(),
                analyzer: "match_analyzer".to_string(),
                source,
            })?;
            builder = builder.semantic(Arc::new(analyzer));
        }
        builder.build()
    }

    /// Listener address; host defaults to all interfaces.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host.as_deref().unwrap_or("0.0.0.0"), self.port)
    }

    /// `at://<owner>/app.bsky.feed.generator/<id>`
    pub fn feed_uri(&self, owner: &str) -> String {
        format!("at://{owner}/app.bsky.feed.generator/{}", self.id)
    }
}

fn invalid(key: impl Into<String>, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalyzerError;

    const SAMPLE: &str = r#"
feed_owner = "did:plc:owner"
feed_base = "feeds.example.com"

[[analyzers]]
id = "doom"
triggers = ["news"]
threshold = 3.0
patterns = { "we are doomed" = 2.0, "collapse" = 1.5 }

[[feeds]]
id = "cats"
name = "Cats"
port = 6502
match_expr = "\\bcats?\\b"
exclusion_filters = ["doom"]

[feeds.pool]
concurrency = 2
dead_letter = true

[[feeds]]
id = "space"
name = "Space"
port = 6503
[feeds.match_analyzer]
patterns = { "launch" = 1.0, "orbit" = 1.0 }
threshold = 2.0
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.feeds.len(), 2);
        assert!(!cfg.debug);
        assert_eq!(cfg.writer_capacity, DEFAULT_WRITER_CAPACITY);

        let cats = cfg.feed("cats").unwrap();
        assert_eq!(cats.pool.concurrency, 2);
        assert_eq!(cats.pool.max_retries, 3);
        assert!(cats.pool.dead_letter);
        assert_eq!(cats.bind_addr(), "0.0.0.0:6502");
        assert_eq!(
            cats.feed_uri(&cfg.feed_owner),
            "at://did:plc:owner/app.bsky.feed.generator/cats"
        );

        let space = cfg.feed("space").unwrap();
        assert_eq!(space.pool.queue_capacity, 256);
        assert_eq!(space.pool.backoff_base_ms, 5_000);
    }

    #[test]
    fn built_policies_follow_config() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        let analyzers = cfg.build_analyzers().unwrap();

        let cats = cfg.feed("cats").unwrap().build_policy(&analyzers).unwrap();
        assert!(cats.evaluate("my cat", false));
        assert!(!cats.evaluate("cat news: we are doomed, we are doomed", false));

        let space = cfg.feed("space").unwrap().build_policy(&analyzers).unwrap();
        assert!(space.evaluate("launch into orbit", true));
        assert!(!space.evaluate("launch day", false));
    }

    #[test]
    fn unknown_exclusion_filter_is_rejected() {
        let toml = r#"
[[feeds]]
id = "a"
name = "A"
port = 1
exclusion_filters = ["missing"]
"#;
        let err = AppConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Policy(PolicyError::UnknownFilter { .. })), "{err}");
    }

    #[test]
    fn duplicate_feed_ids_are_rejected() {
        let toml = r#"
[[feeds]]
id = "a"
name = "A"
port = 1

[[feeds]]
id = "a"
name = "Again"
port = 2
"#;
        assert!(matches!(
            AppConfig::from_toml_str(toml),
            Err(ConfigError::DuplicateFeed(id)) if id == "a"
        ));
    }

    #[test]
    fn invalid_regex_fails_at_load() {
        let toml = r#"
[[feeds]]
id = "a"
name = "A"
port = 1
match_expr = "(unclosed"
"#;
        assert!(matches!(
            AppConfig::from_toml_str(toml),
            Err(ConfigError::Policy(PolicyError::Regex { .. }))
        ));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let toml = r#"
[[feeds]]
id = "a"
name = "A"
port = 1
[feeds.pool]
concurrency = 0
"#;
        assert!(matches!(
            AppConfig::from_toml_str(toml),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn empty_pattern_is_a_config_error() {
        let toml = r#"
[[analyzers]]
id = "bad"
patterns = { "" = 1.0 }
"#;
        assert!(matches!(
            AppConfig::from_toml_str(toml),
            Err(ConfigError::Policy(PolicyError::Analyzer { .. }))
        ));
    }

    #[test]
    fn blank_inline_pattern_is_a_config_error() {
        let toml = r#"
[[feeds]]
id = "a"
name = "A"
port = 1
[feeds.match_analyzer]
patterns = { "   " = 1.0 }
"#;
        assert!(matches!(
            AppConfig::from_toml_str(toml),
            Err(ConfigError::Policy(PolicyError::Analyzer {
                source: AnalyzerError::EmptyPattern,
                ..
            }))
        ));
    }
}
