// src/policy.rs
//! Per-feed matching policy: force/match expressions, reply rules, exclusion
//! filters and an optional semantic matcher folded into one admit/reject call.
//!
//! Decision order (first decisive rule wins):
//!
//! ```text
//! force_expr matches              -> admit (bypasses replies + filters)
//! match_expr set                  -> must match, reply rule must allow,
//!                                    then any flagged exclusion filter rejects
//! only a semantic analyzer set    -> admit iff it flags the text
//! nothing configured              -> admit everything
//! ```
//!
//! Expressions are compiled (case-insensitive) in [`PolicyBuilder::build`];
//! a built policy is never mutated. A config reload builds a new one.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use tracing::info;

use crate::analyzer::TextAnalyzer;
use crate::error::PolicyError;

/// Why a post was admitted or rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Forced,
    Matched,
    Excluded { filter: String, score: f64 },
    ReplyExcluded,
    NoMatch,
    SemanticMatch { score: f64 },
    SemanticMiss { score: f64 },
    Open,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(
            self,
            Admission::Forced | Admission::Matched | Admission::SemanticMatch { .. } | Admission::Open
        )
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Admission::Forced => "forced",
            Admission::Matched => "matched",
            Admission::Excluded { .. } => "excluded",
            Admission::ReplyExcluded => "reply_excluded",
            Admission::NoMatch => "no_match",
            Admission::SemanticMatch { .. } => "semantic_match",
            Admission::SemanticMiss { .. } => "semantic_miss",
            Admission::Open => "open",
        }
    }
}

#[derive(Debug)]
pub struct MatchingPolicy {
    feed: String,
    force: Option<Regex>,
    matcher: Option<Regex>,
    include_replies: bool,
    filters: BTreeMap<String, Arc<TextAnalyzer>>,
    semantic: Option<Arc<TextAnalyzer>>,
}

impl MatchingPolicy {
    pub fn builder(feed: impl Into<String>) -> PolicyBuilder {
        PolicyBuilder {
            feed: feed.into(),
            force_expr: None,
            match_expr: None,
            include_replies: false,
            filters: BTreeMap::new(),
            semantic: None,
        }
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    /// Admit/reject only.
    pub fn evaluate(&self, text: &str, is_reply: bool) -> bool {
        self.decide(text, is_reply).is_admitted()
    }

    /// Full decision with the rule that settled it.
    pub fn decide(&self, text: &str, is_reply: bool) -> Admission {
        if let Some(force) = &self.force {
            if force.is_match(text) {
                return Admission::Forced;
            }
        }

        if let Some(matcher) = &self.matcher {
            if !matcher.is_match(text) {
                return Admission::NoMatch;
            }
            if is_reply && !self.include_replies {
                return Admission::ReplyExcluded;
            }
            return match self.should_filter(text) {
                Some((filter, score)) => Admission::Excluded { filter, score },
                None => Admission::Matched,
            };
        }

        if let Some(semantic) = &self.semantic {
            let (score, flagged) = semantic.score(text);
            return if flagged {
                Admission::SemanticMatch { score }
            } else {
                Admission::SemanticMiss { score }
            };
        }

        Admission::Open
    }

    /// First exclusion filter (by name order) that flags `text`, with its score.
    pub fn should_filter(&self, text: &str) -> Option<(String, f64)> {
        for (name, analyzer) in &self.filters {
            let (score, flagged) = analyzer.score(text);
            if flagged {
                info!(
                    feed = %self.feed,
                    analyzer = %name,
                    score,
                    text,
                    "excluding post due to sentiment score"
                );
                return Some((name.clone(), score));
            }
        }
        None
    }
}

/// Collects the raw policy settings; [`PolicyBuilder::build`] compiles them.
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    feed: String,
    force_expr: Option<String>,
    match_expr: Option<String>,
    include_replies: bool,
    filters: BTreeMap<String, Arc<TextAnalyzer>>,
    semantic: Option<Arc<TextAnalyzer>>,
}

impl PolicyBuilder {
    /// Empty strings count as "not configured".
    pub fn force_expr(mut self, expr: impl Into<String>) -> Self {
        self.force_expr = Some(expr.into()).filter(|e| !e.is_empty());
        self
    }

    pub fn match_expr(mut self, expr: impl Into<String>) -> Self {
        self.match_expr = Some(expr.into()).filter(|e| !e.is_empty());
        self
    }

    pub fn include_replies(mut self, include: bool) -> Self {
        self.include_replies = include;
        self
    }

    pub fn exclusion_filter(mut self, name: impl Into<String>, analyzer: Arc<TextAnalyzer>) -> Self {
        self.filters.insert(name.into(), analyzer);
        self
    }

    pub fn semantic(mut self, analyzer: Arc<TextAnalyzer>) -> Self {
        self.semantic = Some(analyzer);
        self
    }

    pub fn build(self) -> Result<MatchingPolicy, PolicyError> {
        let force = compile(&self.feed, "force", self.force_expr.as_deref())?;
        let matcher = compile(&self.feed, "match", self.match_expr.as_deref())?;
        Ok(MatchingPolicy {
            feed: self.feed,
            force,
            matcher,
            include_replies: self.include_replies,
            filters: self.filters,
            semantic: self.semantic,
        })
    }
}

fn compile(feed: &str, which: &'static str, expr: Option<&str>) -> Result<Option<Regex>, PolicyError> {
    expr.map(|e| {
        RegexBuilder::new(e)
            .case_insensitive(true)
            .build()
            .map_err(|source| PolicyError::Regex {
                feed: feed.to_string(),
                which,
                source,
            })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat_filter() -> Arc<TextAnalyzer> {
        let patterns = [("cat".to_string(), 5.0)].into_iter().collect();
        Arc::new(TextAnalyzer::new(vec![], patterns, 3.0, false).unwrap())
    }

    #[test]
    fn force_expression_overrides_replies_and_filters() {
        let p = MatchingPolicy::builder("f")
            .force_expr("urgent")
            .match_expr("cat")
            .include_replies(false)
            .exclusion_filter("cats", cat_filter())
            .build()
            .unwrap();
        assert!(p.evaluate("urgent dog", true));
        assert_eq!(p.decide("URGENT cat", true), Admission::Forced);
    }

    #[test]
    fn reply_is_rejected_unless_replies_included() {
        let p = MatchingPolicy::builder("f").match_expr("cat").build().unwrap();
        assert!(!p.evaluate("I love cats", true));
        assert_eq!(p.decide("I love cats", true), Admission::ReplyExcluded);
        assert!(p.evaluate("I love cats", false));

        let with_replies = MatchingPolicy::builder("f")
            .match_expr("cat")
            .include_replies(true)
            .build()
            .unwrap();
        assert!(with_replies.evaluate("I love cats", true));
    }

    #[test]
    fn exclusion_filter_vetoes_a_match() {
        let p = MatchingPolicy::builder("f")
            .match_expr("cat")
            .exclusion_filter("cats", cat_filter())
            .build()
            .unwrap();
        let d = p.decide("my cat is great", false);
        assert_eq!(
            d,
            Admission::Excluded {
                filter: "cats".into(),
                score: 5.0
            }
        );
        assert!(!d.is_admitted());
    }

    #[test]
    fn match_expression_is_case_insensitive() {
        let p = MatchingPolicy::builder("f").match_expr(r"\bRust\b").build().unwrap();
        assert!(p.evaluate("learning rust today", false));
        assert!(!p.evaluate("rusty nails", false));
    }

    #[test]
    fn semantic_analyzer_alone_decides() {
        let patterns = [("launch".to_string(), 1.0)].into_iter().collect();
        let semantic = Arc::new(TextAnalyzer::new(vec![], patterns, 2.0, true).unwrap());
        let p = MatchingPolicy::builder("f").semantic(semantic).build().unwrap();
        assert!(p.evaluate("launch, launch!", false));
        assert_eq!(p.decide("one launch", false), Admission::SemanticMiss { score: 1.0 });
    }

    #[test]
    fn semantic_analyzer_has_no_filter_step() {
        let patterns = [("cat".to_string(), 1.0)].into_iter().collect();
        let semantic = Arc::new(TextAnalyzer::new(vec![], patterns, 1.0, true).unwrap());
        let p = MatchingPolicy::builder("f")
            .semantic(semantic)
            .exclusion_filter("cats", cat_filter())
            .build()
            .unwrap();
        assert!(p.evaluate("my cat", true));
    }

    #[test]
    fn match_expression_takes_precedence_over_semantic() {
        let patterns = [("dog".to_string(), 1.0)].into_iter().collect();
        let semantic = Arc::new(TextAnalyzer::new(vec![], patterns, 1.0, true).unwrap());
        let p = MatchingPolicy::builder("f")
            .match_expr("cat")
            .semantic(semantic)
            .build()
            .unwrap();
        assert!(!p.evaluate("dog", false));
        assert!(p.evaluate("cat", false));
    }

    #[test]
    fn empty_policy_admits_everything() {
        let p = MatchingPolicy::builder("firehose").build().unwrap();
        assert_eq!(p.decide("anything", true), Admission::Open);
        let p = MatchingPolicy::builder("firehose").match_expr("").force_expr("").build().unwrap();
        assert!(p.evaluate("anything", false));
    }

    #[test]
    fn bad_expression_fails_at_build() {
        let err = MatchingPolicy::builder("broken").match_expr("(unclosed").build().unwrap_err();
        match err {
            PolicyError::Regex { feed, which, .. } => {
                assert_eq!(feed, "broken");
                assert_eq!(which, "match");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(MatchingPolicy::builder("broken").force_expr("[").build().is_err());
    }
}
