//! RED → YELLOW → GREEN phase discipline for features.
//!
//! This module provides:
//! - `Phase`, a closed enum with an explicit transition table
//! - `PhaseTransitionRecord`, the append-only audit entry
//! - `PhaseTracker`, the only component allowed to move a feature between phases
//!
//! ```text
//! RED --(tests pass)--> YELLOW --(review approved)--> GREEN (terminal)
//!  ^                      |
//!  +--(review rejected)---+
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::errors::PhaseError;
use crate::events::{EngineEvent, EventSink};

/// Development phase of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    /// Tests written and failing; no accepted implementation yet
    Red,
    /// Tests pass, awaiting review
    Yellow,
    /// Review approved (terminal)
    Green,
}

/// Every legal edge of the phase state machine.
const TRANSITIONS: &[(Phase, Phase)] = &[
    (Phase::Red, Phase::Yellow),
    (Phase::Yellow, Phase::Green),
    (Phase::Yellow, Phase::Red),
];

impl Phase {
    /// Check whether moving from `self` to `target` is in the transition table.
    pub fn can_transition_to(self, target: Phase) -> bool {
        TRANSITIONS.contains(&(self, target))
    }

    /// GREEN is the only terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Green)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Red => "RED",
            Phase::Yellow => "YELLOW",
            Phase::Green => "GREEN",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RED" => Ok(Phase::Red),
            "YELLOW" => Ok(Phase::Yellow),
            "GREEN" => Ok(Phase::Green),
            _ => anyhow::bail!("Invalid phase '{}'. Valid values: RED, YELLOW, GREEN", s),
        }
    }
}

/// One entry of a feature's phase history.
///
/// `from` is `None` only for the entry record written by `start_feature`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransitionRecord {
    pub feature_id: String,
    pub from: Option<Phase>,
    pub to: Phase,
    pub timestamp: DateTime<Utc>,
}

impl PhaseTransitionRecord {
    /// Whether this record is a real edge rather than the entry record.
    pub fn is_transition(&self) -> bool {
        self.from.is_some()
    }

    /// Whether this record is a review rejection (YELLOW → RED).
    pub fn is_rejection(&self) -> bool {
        self.from == Some(Phase::Yellow) && self.to == Phase::Red
    }
}

/// Time a feature spent in each non-terminal phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDurations {
    #[serde(with = "duration_millis")]
    pub red: Duration,
    #[serde(with = "duration_millis")]
    pub yellow: Duration,
}

impl PhaseDurations {
    pub fn total(&self) -> Duration {
        self.red + self.yellow
    }
}

/// Per-feature phase state machine with a shared, append-only transition log.
///
/// Phase state is partitioned per feature, so concurrent features never contend
/// on each other's entries; only the log itself is behind a mutex.
pub struct PhaseTracker {
    phases: DashMap<String, Phase>,
    log: Mutex<Vec<PhaseTransitionRecord>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phases: DashMap::new(),
            log: Mutex::new(Vec::new()),
            sink: None,
        }
    }

    /// Forward every record to an event sink as it is appended.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Put a feature into RED. Requires a non-empty test suite and fails if the
    /// feature was already started.
    pub fn start_feature(&self, feature_id: &str, test_file_count: usize) -> Result<Phase, PhaseError> {
        if test_file_count == 0 {
            return Err(PhaseError::MissingTests(feature_id.to_string()));
        }

        let record = match self.phases.entry(feature_id.to_string()) {
            Entry::Occupied(_) => return Err(PhaseError::AlreadyStarted(feature_id.to_string())),
            Entry::Vacant(slot) => {
                let record = PhaseTransitionRecord {
                    feature_id: feature_id.to_string(),
                    from: None,
                    to: Phase::Red,
                    timestamp: Utc::now(),
                };
                // Log while holding the entry so history order matches state order.
                self.append(record.clone());
                slot.insert(Phase::Red);
                record
            }
        };
        self.notify(record);
        Ok(Phase::Red)
    }

    /// Move a feature to `target` if the edge exists in the transition table.
    pub fn transition(&self, feature_id: &str, target: Phase) -> Result<Phase, PhaseError> {
        let mut current = self
            .phases
            .get_mut(feature_id)
            .ok_or_else(|| PhaseError::NotStarted(feature_id.to_string()))?;

        let from = *current;
        if !from.can_transition_to(target) {
            return Err(PhaseError::IllegalTransition {
                feature: feature_id.to_string(),
                from,
                to: target,
            });
        }

        let record = PhaseTransitionRecord {
            feature_id: feature_id.to_string(),
            from: Some(from),
            to: target,
            timestamp: Utc::now(),
        };
        self.append(record.clone());
        *current = target;
        drop(current);

        self.notify(record);
        Ok(target)
    }

    /// Current phase, or `None` if the feature was never started.
    pub fn current_phase(&self, feature_id: &str) -> Option<Phase> {
        self.phases.get(feature_id).map(|p| *p)
    }

    /// Gate that must pass before any implementation request. Non-retryable on failure.
    pub fn enforce_red_before_implementation(&self, feature_id: &str) -> Result<(), PhaseError> {
        match self.current_phase(feature_id) {
            None => Err(PhaseError::NotStarted(feature_id.to_string())),
            Some(Phase::Red) => Ok(()),
            Some(phase) => Err(PhaseError::ImplementationOutsideRed {
                feature: feature_id.to_string(),
                phase,
            }),
        }
    }

    /// Entry record followed by every transition for a feature, oldest first.
    pub fn history(&self, feature_id: &str) -> Vec<PhaseTransitionRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.feature_id == feature_id)
            .collect()
    }

    /// Only the real edges (entry record excluded).
    pub fn transitions(&self, feature_id: &str) -> Vec<PhaseTransitionRecord> {
        self.history(feature_id)
            .into_iter()
            .filter(PhaseTransitionRecord::is_transition)
            .collect()
    }

    /// Number of review rejections recorded for a feature.
    pub fn rejections(&self, feature_id: &str) -> usize {
        self.history(feature_id)
            .iter()
            .filter(|r| r.is_rejection())
            .count()
    }

    /// Full log across all features.
    pub fn records(&self) -> Vec<PhaseTransitionRecord> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sum the time spent in RED and YELLOW. An open phase is measured up to now.
    pub fn phase_durations(&self, feature_id: &str) -> PhaseDurations {
        let history = self.history(feature_id);
        let mut durations = PhaseDurations::default();

        for (i, record) in history.iter().enumerate() {
            let end = history
                .get(i + 1)
                .map(|next| next.timestamp)
                .unwrap_or_else(Utc::now);
            let spent = (end - record.timestamp).to_std().unwrap_or_default();
            match record.to {
                Phase::Red => durations.red += spent,
                Phase::Yellow => durations.yellow += spent,
                Phase::Green => {}
            }
        }

        durations
    }

    /// Current phase of every started feature.
    pub fn snapshot(&self) -> HashMap<String, Phase> {
        self.phases
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    fn append(&self, record: PhaseTransitionRecord) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Forward a record to the sink. Must be called with no phase entry held,
    /// so sinks may read the tracker.
    fn notify(&self, record: PhaseTransitionRecord) {
        if let Some(ref sink) = self.sink {
            sink.emit(EngineEvent::PhaseTransition { record });
        }
    }
}

/// Serde helpers for Duration serialization as milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;

    fn started(tracker: &PhaseTracker, id: &str) {
        tracker.start_feature(id, 1).unwrap();
    }

    #[test]
    fn test_transition_table() {
        assert!(Phase::Red.can_transition_to(Phase::Yellow));
        assert!(Phase::Yellow.can_transition_to(Phase::Green));
        assert!(Phase::Yellow.can_transition_to(Phase::Red));

        assert!(!Phase::Red.can_transition_to(Phase::Green));
        assert!(!Phase::Red.can_transition_to(Phase::Red));
        assert!(!Phase::Green.can_transition_to(Phase::Red));
        assert!(!Phase::Green.can_transition_to(Phase::Yellow));
        assert!(!Phase::Yellow.can_transition_to(Phase::Yellow));
    }

    #[test]
    fn test_phase_serialization() {
        assert_eq!(serde_json::to_string(&Phase::Red).unwrap(), "\"RED\"");
        let parsed: Phase = serde_json::from_str("\"YELLOW\"").unwrap();
        assert_eq!(parsed, Phase::Yellow);
        assert_eq!("green".parse::<Phase>().unwrap(), Phase::Green);
        assert!("blue".parse::<Phase>().is_err());
    }

    #[test]
    fn test_start_feature_enters_red() {
        let tracker = PhaseTracker::new();
        assert_eq!(tracker.start_feature("a", 2).unwrap(), Phase::Red);
        assert_eq!(tracker.current_phase("a"), Some(Phase::Red));
    }

    #[test]
    fn test_start_feature_twice_fails() {
        let tracker = PhaseTracker::new();
        started(&tracker, "a");
        assert_eq!(
            tracker.start_feature("a", 1),
            Err(PhaseError::AlreadyStarted("a".into()))
        );
        assert_eq!(tracker.history("a").len(), 1);
    }

    #[test]
    fn test_start_feature_requires_tests() {
        let tracker = PhaseTracker::new();
        assert_eq!(
            tracker.start_feature("a", 0),
            Err(PhaseError::MissingTests("a".into()))
        );
        assert_eq!(tracker.current_phase("a"), None);
    }

    #[test]
    fn test_full_cycle_with_rejection() {
        let tracker = PhaseTracker::new();
        started(&tracker, "a");
        tracker.transition("a", Phase::Yellow).unwrap();
        tracker.transition("a", Phase::Red).unwrap();
        tracker.transition("a", Phase::Yellow).unwrap();
        tracker.transition("a", Phase::Green).unwrap();

        let phases: Vec<Phase> = tracker.history("a").iter().map(|r| r.to).collect();
        assert_eq!(
            phases,
            vec![Phase::Red, Phase::Yellow, Phase::Red, Phase::Yellow, Phase::Green]
        );
        assert_eq!(tracker.transitions("a").len(), 4);
        assert_eq!(tracker.rejections("a"), 1);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let tracker = PhaseTracker::new();
        started(&tracker, "a");

        let err = tracker.transition("a", Phase::Green).unwrap_err();
        assert!(matches!(err, PhaseError::IllegalTransition { from: Phase::Red, to: Phase::Green, .. }));

        tracker.transition("a", Phase::Yellow).unwrap();
        tracker.transition("a", Phase::Green).unwrap();
        assert!(tracker.transition("a", Phase::Red).is_err());
        assert!(tracker.transition("a", Phase::Yellow).is_err());
        assert_eq!(tracker.current_phase("a"), Some(Phase::Green));
    }

    #[test]
    fn test_transition_unknown_feature() {
        let tracker = PhaseTracker::new();
        assert_eq!(
            tracker.transition("ghost", Phase::Yellow),
            Err(PhaseError::NotStarted("ghost".into()))
        );
    }

    #[test]
    fn test_enforce_red_gate() {
        let tracker = PhaseTracker::new();
        assert!(tracker.enforce_red_before_implementation("a").is_err());

        started(&tracker, "a");
        assert!(tracker.enforce_red_before_implementation("a").is_ok());

        tracker.transition("a", Phase::Yellow).unwrap();
        assert!(matches!(
            tracker.enforce_red_before_implementation("a"),
            Err(PhaseError::ImplementationOutsideRed { phase: Phase::Yellow, .. })
        ));

        tracker.transition("a", Phase::Green).unwrap();
        assert!(matches!(
            tracker.enforce_red_before_implementation("a"),
            Err(PhaseError::ImplementationOutsideRed { phase: Phase::Green, .. })
        ));
    }

    #[test]
    fn test_history_only_contains_legal_edges() {
        let tracker = PhaseTracker::new();
        started(&tracker, "a");
        let _ = tracker.transition("a", Phase::Green);
        tracker.transition("a", Phase::Yellow).unwrap();
        let _ = tracker.transition("a", Phase::Yellow);
        tracker.transition("a", Phase::Green).unwrap();

        for record in tracker.transitions("a") {
            let from = record.from.unwrap();
            assert!(from.can_transition_to(record.to));
        }
        assert_eq!(tracker.transitions("a").len(), 2);
    }

    #[test]
    fn test_concurrent_features_keep_separate_histories() {
        let tracker = Arc::new(PhaseTracker::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let id = format!("f{}", i);
                    tracker.start_feature(&id, 1).unwrap();
                    tracker.transition(&id, Phase::Yellow).unwrap();
                    tracker.transition(&id, Phase::Green).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.records().len(), 24);
        for i in 0..8 {
            assert_eq!(tracker.history(&format!("f{}", i)).len(), 3);
        }
    }

    #[test]
    fn test_phase_durations_accumulate() {
        let tracker = PhaseTracker::new();
        started(&tracker, "a");
        std::thread::sleep(Duration::from_millis(5));
        tracker.transition("a", Phase::Yellow).unwrap();
        tracker.transition("a", Phase::Green).unwrap();

        let durations = tracker.phase_durations("a");
        assert!(durations.red >= Duration::from_millis(5));
        assert!(durations.total() >= durations.red);
    }

    #[test]
    fn test_records_forwarded_to_sink() {
        let sink = Arc::new(MemorySink::new());
        let tracker = PhaseTracker::new().with_sink(sink.clone());
        started(&tracker, "a");
        tracker.transition("a", Phase::Yellow).unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], EngineEvent::PhaseTransition { .. }));
    }

    /// Sink that reads the tracker back on every event.
    #[derive(Default)]
    struct ReadBackSink {
        tracker: std::sync::OnceLock<std::sync::Weak<PhaseTracker>>,
        seen: Mutex<Vec<Option<Phase>>>,
    }

    impl EventSink for ReadBackSink {
        fn emit(&self, event: EngineEvent) {
            if let EngineEvent::PhaseTransition { record } = event
                && let Some(tracker) = self.tracker.get().and_then(std::sync::Weak::upgrade)
            {
                let phase = tracker.current_phase(&record.feature_id);
                self.seen.lock().unwrap().push(phase);
            }
        }
    }

    #[test]
    fn test_sink_can_read_tracker_during_emit() {
        let sink = Arc::new(ReadBackSink::default());
        let tracker = Arc::new(PhaseTracker::new().with_sink(sink.clone()));
        assert!(sink.tracker.set(Arc::downgrade(&tracker)).is_ok());

        started(&tracker, "a");
        tracker.transition("a", Phase::Yellow).unwrap();
        tracker.transition("a", Phase::Green).unwrap();

        assert_eq!(
            *sink.seen.lock().unwrap(),
            vec![Some(Phase::Red), Some(Phase::Yellow), Some(Phase::Green)]
        );
    }
}
