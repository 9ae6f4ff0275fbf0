//! Per-feature tracking of which tests move between failing and passing.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Failing tests observed after one implementation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub failing: BTreeSet<String>,
    pub recorded_at: DateTime<Utc>,
}

/// How a feature's failing set changed between its last two attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestProgression {
    pub feature_id: String,
    pub currently_failing: BTreeSet<String>,
    /// Failing last attempt, passing now
    pub newly_passing: BTreeSet<String>,
    /// Failing last attempt and still failing
    pub persistently_failing: BTreeSet<String>,
    /// Passing (or absent) last attempt, failing now
    pub newly_failing: BTreeSet<String>,
    pub attempt_history: Vec<AttemptRecord>,
}

impl TestProgression {
    /// At least one test started passing and nothing regressed.
    pub fn is_improving(&self) -> bool {
        !self.newly_passing.is_empty() && self.newly_failing.is_empty()
    }

    /// A later attempt that fixed nothing.
    pub fn is_stalled(&self) -> bool {
        self.attempt_history.len() > 1
            && self.newly_passing.is_empty()
            && !self.currently_failing.is_empty()
    }
}

/// Thread-safe store of progressions, one per feature.
#[derive(Debug, Default)]
pub struct ProgressionTracker {
    by_feature: DashMap<String, TestProgression>,
}

impl ProgressionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the failing set for `attempt` and diff it against the previous attempt.
    pub fn track(
        &self,
        feature_id: &str,
        current_failures: BTreeSet<String>,
        attempt: u32,
    ) -> TestProgression {
        let mut entry = self
            .by_feature
            .entry(feature_id.to_string())
            .or_insert_with(|| TestProgression {
                feature_id: feature_id.to_string(),
                ..TestProgression::default()
            });
        let progression = entry.value_mut();

        match progression.attempt_history.last() {
            Some(previous) => {
                let previous = &previous.failing;
                progression.newly_passing =
                    previous.difference(&current_failures).cloned().collect();
                progression.persistently_failing =
                    previous.intersection(&current_failures).cloned().collect();
                progression.newly_failing =
                    current_failures.difference(previous).cloned().collect();
            }
            None => {
                progression.newly_passing.clear();
                progression.persistently_failing.clear();
                progression.newly_failing.clear();
            }
        }

        progression.currently_failing = current_failures.clone();
        progression.attempt_history.push(AttemptRecord {
            attempt,
            failing: current_failures,
            recorded_at: Utc::now(),
        });

        progression.clone()
    }

    pub fn get(&self, feature_id: &str) -> Option<TestProgression> {
        self.by_feature.get(feature_id).map(|p| p.value().clone())
    }

    pub fn reset(&self, feature_id: &str) {
        self.by_feature.remove(feature_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_attempt_has_no_diff() {
        let tracker = ProgressionTracker::new();
        let p = tracker.track("f", set(&["t1", "t2"]), 0);

        assert_eq!(p.currently_failing, set(&["t1", "t2"]));
        assert!(p.newly_passing.is_empty());
        assert!(p.persistently_failing.is_empty());
        assert!(p.newly_failing.is_empty());
        assert_eq!(p.attempt_history.len(), 1);
        assert!(!p.is_stalled());
    }

    #[test]
    fn test_progress_between_attempts() {
        let tracker = ProgressionTracker::new();
        tracker.track("f", set(&["t1", "t2", "t3"]), 0);
        let p = tracker.track("f", set(&["t3"]), 1);

        assert_eq!(p.newly_passing, set(&["t1", "t2"]));
        assert_eq!(p.persistently_failing, set(&["t3"]));
        assert!(p.newly_failing.is_empty());
        assert_eq!(p.attempt_history.len(), 2);
        assert!(p.is_improving());
    }

    #[test]
    fn test_regressions_are_reported() {
        let tracker = ProgressionTracker::new();
        tracker.track("f", set(&["t1"]), 0);
        let p = tracker.track("f", set(&["t2"]), 1);

        assert_eq!(p.newly_passing, set(&["t1"]));
        assert_eq!(p.newly_failing, set(&["t2"]));
        assert!(!p.is_improving());
    }

    #[test]
    fn test_stalled_attempt() {
        let tracker = ProgressionTracker::new();
        tracker.track("f", set(&["t1"]), 0);
        let p = tracker.track("f", set(&["t1"]), 1);
        assert!(p.is_stalled());
    }

    #[test]
    fn test_features_are_independent() {
        let tracker = ProgressionTracker::new();
        tracker.track("a", set(&["t1"]), 0);
        tracker.track("b", set(&["t9"]), 0);

        let a = tracker.track("a", set(&[]), 1);
        assert_eq!(a.newly_passing, set(&["t1"]));
        assert_eq!(tracker.get("b").unwrap().currently_failing, set(&["t9"]));

        tracker.reset("a");
        assert!(tracker.get("a").is_none());
    }
}
