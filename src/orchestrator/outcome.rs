//! Outcome types for feature steps and whole features.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::phase::{Phase, PhaseDurations, PhaseTransitionRecord};
use crate::retry::{ErrorClass, TestFailureContext};
use crate::store::CodeSnapshot;

/// Why a step asked for another attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryReason {
    pub class: ErrorClass,
    pub message: String,
    pub contexts: Vec<TestFailureContext>,
}

impl RetryReason {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            contexts: Vec::new(),
        }
    }

    pub fn with_contexts(mut self, contexts: Vec<TestFailureContext>) -> Self {
        self.contexts = contexts;
        self
    }
}

/// Result of one step of the feature cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<T> {
    /// The step produced its value; move on.
    Success(T),
    /// The step failed in a way that may be retried.
    Retry(RetryReason),
    /// The feature cannot continue.
    Fatal(FeatureFailure),
    /// The step was abandoned because the run was cancelled.
    Skip(String),
}

impl<T> StepOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepOutcome<U> {
        match self {
            StepOutcome::Success(value) => StepOutcome::Success(f(value)),
            StepOutcome::Retry(reason) => StepOutcome::Retry(reason),
            StepOutcome::Fatal(failure) => StepOutcome::Fatal(failure),
            StepOutcome::Skip(reason) => StepOutcome::Skip(reason),
        }
    }
}

/// Terminal status of a feature within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Green,
    Failed,
    Skipped,
    Cancelled,
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeatureStatus::Green => "green",
            FeatureStatus::Failed => "failed",
            FeatureStatus::Skipped => "skipped",
            FeatureStatus::Cancelled => "cancelled",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl FeatureFailure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl fmt::Display for FeatureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// Everything known about one feature at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureOutcome {
    pub feature_id: String,
    pub status: FeatureStatus,
    pub batch: usize,
    /// Implementation attempts made (0 if the feature never started)
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FeatureFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub history: Vec<PhaseTransitionRecord>,
    #[serde(default)]
    pub durations: PhaseDurations,
    #[serde(default)]
    pub review_rejections: u32,
    #[serde(default)]
    pub elapsed_ms: u64,
    /// Code produced by the feature; merged into the shared store when GREEN.
    #[serde(skip)]
    pub code: Option<CodeSnapshot>,
}

impl FeatureOutcome {
    fn empty(feature_id: &str, batch: usize, status: FeatureStatus) -> Self {
        Self {
            feature_id: feature_id.to_string(),
            status,
            batch,
            attempts: 0,
            final_phase: None,
            failure: None,
            skip_reason: None,
            history: Vec::new(),
            durations: PhaseDurations::default(),
            review_rejections: 0,
            elapsed_ms: 0,
            code: None,
        }
    }

    pub fn green(feature_id: &str, batch: usize, code: CodeSnapshot) -> Self {
        Self {
            final_phase: Some(Phase::Green),
            code: Some(code),
            ..Self::empty(feature_id, batch, FeatureStatus::Green)
        }
    }

    pub fn failed(feature_id: &str, batch: usize, failure: FeatureFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::empty(feature_id, batch, FeatureStatus::Failed)
        }
    }

    pub fn skipped(feature_id: &str, batch: usize, reason: &str) -> Self {
        Self {
            skip_reason: Some(reason.to_string()),
            ..Self::empty(feature_id, batch, FeatureStatus::Skipped)
        }
    }

    pub fn cancelled(feature_id: &str, batch: usize) -> Self {
        Self::empty(feature_id, batch, FeatureStatus::Cancelled)
    }

    pub fn is_green(&self) -> bool {
        self.status == FeatureStatus::Green
    }

    /// Retries used beyond the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization_and_display() {
        assert_eq!(
            serde_json::to_string(&FeatureStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert_eq!(FeatureStatus::Green.to_string(), "green");
    }

    #[test]
    fn test_outcome_constructors() {
        let green = FeatureOutcome::green("a", 0, CodeSnapshot::default());
        assert!(green.is_green());
        assert_eq!(green.final_phase, Some(Phase::Green));

        let failed = FeatureOutcome::failed(
            "b",
            1,
            FeatureFailure::new(ErrorClass::ContractViolation, "tests passed before implementation"),
        );
        assert_eq!(failed.status, FeatureStatus::Failed);
        assert_eq!(
            failed.failure.as_ref().unwrap().to_string(),
            "contract_violation: tests passed before implementation"
        );

        let skipped = FeatureOutcome::skipped("c", 2, "dependency 'b' did not reach GREEN");
        assert_eq!(skipped.status, FeatureStatus::Skipped);
        assert_eq!(skipped.retries(), 0);
    }

    #[test]
    fn test_outcome_json_omits_code() {
        let mut files = crate::collab::SourceFiles::new();
        files.insert("a.py".into(), "secret".into());
        let outcome = FeatureOutcome::green("a", 0, CodeSnapshot::new(files));
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"status\":\"green\""));

        let parsed: FeatureOutcome = serde_json::from_str(&json).unwrap();
        assert!(parsed.code.is_none());
    }

    #[test]
    fn test_step_outcome_helpers() {
        let ok: StepOutcome<u32> = StepOutcome::Success(1);
        assert!(ok.is_success());
        let retry: StepOutcome<u32> =
            StepOutcome::Retry(RetryReason::new(ErrorClass::Timeout, "slow"));
        assert!(!retry.is_success());
        assert_eq!(StepOutcome::Success(2).map(|v| v * 10), StepOutcome::Success(20));
        assert!(matches!(retry.map(|v| v + 1), StepOutcome::Retry(_)));
    }
}
