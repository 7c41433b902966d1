//! Boundary rules.
//!
//! The time-gap rule is always available and is evaluated first. The other
//! rules implement [`BoundaryRule`]; when one fails the threader falls back
//! to a plain baseline gap for that decision.

use super::OpenThread;
use crate::config::ThreadingConfig;
use crate::types::{BoundaryReason, Message, Role};
use regex_lite::Regex;
use std::collections::BTreeSet;
use thiserror::Error;

/// Outcome of evaluating one rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    pub fired: bool,
    /// How close the rule came to firing, in [0, 1]
    pub strength: f64,
}

impl Signal {
    pub const QUIET: Signal = Signal {
        fired: false,
        strength: 0.0,
    };
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("similarity is not a finite number ({0})")]
    NonFinite(f64),

    #[error("{0}")]
    Failed(String),
}

/// A boundary heuristic other than the time gap.
pub trait BoundaryRule: Send + Sync {
    fn reason(&self) -> BoundaryReason;

    fn evaluate(&self, thread: &OpenThread, message: &Message) -> Result<Signal, RuleError>;
}

// ============================================
// Adaptive time gap
// ============================================

#[derive(Debug, Clone)]
pub struct TimeGapRule {
    baseline_ms: i64,
    fast_ms: i64,
    slow_ms: i64,
    fast_cadence_ms: i64,
    slow_cadence_ms: i64,
}

impl TimeGapRule {
    pub fn new(config: &ThreadingConfig) -> Self {
        Self {
            baseline_ms: config.time_gap_baseline_ms,
            fast_ms: config.time_gap_fast_ms,
            slow_ms: config.time_gap_slow_ms,
            fast_cadence_ms: config.fast_cadence_ms,
            slow_cadence_ms: config.slow_cadence_ms,
        }
    }

    /// Gap threshold adapted to the thread's average cadence.
    pub fn threshold_ms(&self, thread: &OpenThread) -> i64 {
        match thread.average_gap_ms() {
            Some(avg) if avg < self.fast_cadence_ms as f64 => self.fast_ms,
            Some(avg) if avg > self.slow_cadence_ms as f64 => self.slow_ms,
            _ => self.baseline_ms,
        }
    }

    pub fn evaluate(&self, thread: &OpenThread, message: &Message) -> Signal {
        Self::signal(thread.gap_to_ms(message), self.threshold_ms(thread))
    }

    /// Non-adaptive decision used when another rule failed.
    pub fn evaluate_baseline(&self, thread: &OpenThread, message: &Message) -> Signal {
        Self::signal(thread.gap_to_ms(message), self.baseline_ms)
    }

    fn signal(gap_ms: i64, threshold_ms: i64) -> Signal {
        Signal {
            fired: gap_ms > threshold_ms,
            strength: (gap_ms as f64 / threshold_ms as f64).clamp(0.0, 1.0),
        }
    }
}

// ============================================
// Explicit topic-change language
// ============================================

const TOPIC_CHANGE_PATTERN: &str = r"(?i)\b(let'?s\s+(switch|move)\s+to|switching\s+(gears|to)|different\s+question|change\s+of\s+topic|changing\s+the\s+subject|moving\s+on\s+to|unrelated\s+question|new\s+topic|on\s+another\s+note|separate\s+question)\b";

/// Fires on user messages that announce a change of subject.
///
/// A pattern that fails to compile leaves the rule unavailable; every
/// evaluation then reports an error and the threader degrades the decision.
pub struct TopicChangeRule {
    pattern: Option<Regex>,
}

impl TopicChangeRule {
    pub fn new() -> Self {
        Self::with_pattern(TOPIC_CHANGE_PATTERN)
    }

    pub fn with_pattern(pattern: &str) -> Self {
        let compiled = Regex::new(pattern);
        if let Err(e) = &compiled {
            tracing::warn!(error = %e, "Topic-change pattern rejected, rule disabled");
        }
        Self {
            pattern: compiled.ok(),
        }
    }

    pub fn is_topic_change(&self, text: &str) -> bool {
        self.pattern.as_ref().is_some_and(|p| p.is_match(text))
    }
}

impl Default for TopicChangeRule {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundaryRule for TopicChangeRule {
    fn reason(&self) -> BoundaryReason {
        BoundaryReason::TopicChange
    }

    fn evaluate(&self, _thread: &OpenThread, message: &Message) -> Result<Signal, RuleError> {
        if message.role != Role::User {
            return Ok(Signal::QUIET);
        }
        let pattern = self
            .pattern
            .as_ref()
            .ok_or_else(|| RuleError::Failed("topic-change pattern unavailable".to_string()))?;
        if pattern.is_match(&message.content) {
            Ok(Signal {
                fired: true,
                strength: 1.0,
            })
        } else {
            Ok(Signal::QUIET)
        }
    }
}

// ============================================
// Tool-usage pattern break
// ============================================

/// Fires when a message's tools have little in common with the recent window.
pub struct ToolPatternRule {
    threshold: f64,
    min_pattern: usize,
}

impl ToolPatternRule {
    pub fn new(config: &ThreadingConfig) -> Self {
        Self {
            threshold: config.tool_similarity_threshold,
            min_pattern: config.min_tool_pattern,
        }
    }
}

/// |A ∩ B| / |A ∪ B|; two empty sets are identical.
pub fn jaccard(a: &BTreeSet<&str>, b: &BTreeSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

impl BoundaryRule for ToolPatternRule {
    fn reason(&self) -> BoundaryReason {
        BoundaryReason::ToolPatternBreak
    }

    fn evaluate(&self, thread: &OpenThread, message: &Message) -> Result<Signal, RuleError> {
        let incoming: BTreeSet<&str> = message.tool_names().into_iter().collect();
        if incoming.is_empty() || thread.tool_using_in_window() < self.min_pattern {
            return Ok(Signal::QUIET);
        }

        let window = thread.window_tools();
        let similarity = jaccard(&window, &incoming);
        if !similarity.is_finite() {
            return Err(RuleError::NonFinite(similarity));
        }

        Ok(Signal {
            fired: similarity < self.threshold,
            strength: 1.0 - similarity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_change_phrases() {
        let rule = TopicChangeRule::new();
        for text in [
            "Let's switch to the database layer",
            "lets move to something else",
            "Different question: how do I deploy?",
            "change of topic - what about CI",
            "Moving on to the parser",
            "unrelated question, but",
            "New topic: logging",
            "On another note, the tests fail",
        ] {
            assert!(rule.is_topic_change(text), "{}", text);
        }
        assert!(!rule.is_topic_change("switch the flag to true"));
        assert!(!rule.is_topic_change("the topic is threading"));
    }

    #[test]
    fn test_jaccard() {
        let a: BTreeSet<&str> = ["Read", "Edit"].into_iter().collect();
        let b: BTreeSet<&str> = ["Read"].into_iter().collect();
        let c: BTreeSet<&str> = ["Bash"].into_iter().collect();
        assert_eq!(jaccard(&a, &b), 0.5);
        assert_eq!(jaccard(&a, &c), 0.0);
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 1.0);
    }
}
