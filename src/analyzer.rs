// src/analyzer.rs
//! Pattern scorer: trigger-gated, weighted substring matching over normalized text.
//!
//! An analyzer is built once from config and is read-only afterwards, so a
//! single instance can be shared by every runner of every pool.

use std::collections::BTreeMap;

use crate::error::AnalyzerError;

/// Bytes of surrounding text captured on each side of a match (widened to whitespace).
const CONTEXT_RADIUS: usize = 60;

/// A substring and the confidence it contributes per occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub text: String,
    pub confidence: f64,
}

/// One occurrence of a pattern in a normalized text.
#[derive(Debug, Clone, PartialEq)]
pub struct SentimentMatch {
    pub pattern: String,
    pub context: String,
    /// Byte offset into the normalized text.
    pub start: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct TextAnalyzer {
    triggers: Vec<String>,
    patterns: Vec<Pattern>,
    threshold: f64,
    any_trigger: bool,
}

impl TextAnalyzer {
    /// Build an analyzer. Triggers and patterns are lower-cased here because
    /// evaluation always runs against lower-cased text.
    pub fn new(
        triggers: Vec<String>,
        patterns: BTreeMap<String, f64>,
        threshold: f64,
        any_trigger: bool,
    ) -> Result<Self, AnalyzerError> {
        if !threshold.is_finite() {
            return Err(AnalyzerError::NonFiniteThreshold);
        }

        let triggers = triggers
            .into_iter()
            .map(|t| {
                if t.trim().is_empty() {
                    Err(AnalyzerError::EmptyTrigger)
                } else {
                    Ok(t.to_lowercase())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let patterns = patterns
            .into_iter()
            .map(|(text, confidence)| {
                // Padding is kept so " art " stays a whole-word needle. A blank
                // needle would match at every offset.
                let text = text.to_lowercase();
                if text.trim().is_empty() {
                    return Err(AnalyzerError::EmptyPattern);
                }
                if !confidence.is_finite() {
                    return Err(AnalyzerError::NonFiniteWeight { pattern: text });
                }
                Ok(Pattern { text, confidence })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            triggers,
            patterns,
            threshold,
            any_trigger,
        })
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// True when the trigger gate is open for `text`.
    ///
    /// No triggers: always open. `any_trigger`: one trigger suffices.
    /// Otherwise every trigger must be present.
    pub fn has_triggers(&self, text: &str) -> bool {
        if self.triggers.is_empty() {
            return true;
        }
        let lower = text.to_lowercase();
        if self.any_trigger {
            self.triggers.iter().any(|t| lower.contains(t.as_str()))
        } else {
            self.triggers.iter().all(|t| lower.contains(t.as_str()))
        }
    }

    /// Every non-overlapping occurrence of every pattern, with context.
    /// Occurrences of different patterns may overlap and are all reported.
    pub fn analyze_text(&self, text: &str) -> Vec<SentimentMatch> {
        let normalized = normalize_text(text);
        let mut matches = Vec::new();
        for p in &self.patterns {
            for (start, found) in normalized.match_indices(p.text.as_str()) {
                matches.push(SentimentMatch {
                    pattern: p.text.clone(),
                    context: context_window(&normalized, start, start + found.len()),
                    start,
                    confidence: p.confidence,
                });
            }
        }
        matches
    }

    /// Returns `(total confidence, flagged)` where `flagged = total >= threshold`.
    /// A closed trigger gate short-circuits to `(0.0, false)`.
    pub fn score(&self, text: &str) -> (f64, bool) {
        if !self.has_triggers(text) {
            return (0.0, false);
        }
        let normalized = normalize_text(text);
        let total: f64 = self
            .patterns
            .iter()
            .map(|p| normalized.matches(p.text.as_str()).count() as f64 * p.confidence)
            .sum();
        (total, total >= self.threshold)
    }
}

/// Lower-case and collapse whitespace runs into single spaces.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Slice `[start, end)` widened by `CONTEXT_RADIUS` and then out to whitespace.
///
/// Widening stops only before an ASCII whitespace byte or at either end of the
/// string, so both bounds always land on char boundaries.
fn context_window(text: &str, start: usize, end: usize) -> String {
    let bytes = text.as_bytes();
    let mut from = start.saturating_sub(CONTEXT_RADIUS);
    let mut to = (end + CONTEXT_RADIUS).min(bytes.len());

    while from > 0 && !bytes[from - 1].is_ascii_whitespace() {
        from -= 1;
    }
    while to < bytes.len() && !bytes[to].is_ascii_whitespace() {
        to += 1;
    }
    text.get(from..to).map(str::to_string).unwrap_or_default()
}
