//! Retry decisions and the directives handed to the implementer.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fmt::Write as _;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::failure::{FailureExtractor, FailureType, TestFailureContext};
use super::progression::{ProgressionTracker, TestProgression};
use crate::errors::CollaboratorError;
use crate::feature::Feature;
use crate::store::CodeSnapshot;

/// Classification of a failed step, deciding whether it may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TestFailure,
    Timeout,
    CollaboratorError,
    CyclicDependency,
    MalformedFeature,
    ContractViolation,
    StorageError,
    MaxAttemptsExceeded,
    RepeatedCollaboratorError,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::TestFailure | ErrorClass::Timeout | ErrorClass::CollaboratorError
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::TestFailure => "test_failure",
            ErrorClass::Timeout => "timeout",
            ErrorClass::CollaboratorError => "collaborator_error",
            ErrorClass::CyclicDependency => "cyclic_dependency",
            ErrorClass::MalformedFeature => "malformed_feature",
            ErrorClass::ContractViolation => "contract_violation",
            ErrorClass::StorageError => "storage_error",
            ErrorClass::MaxAttemptsExceeded => "max_attempts_exceeded",
            ErrorClass::RepeatedCollaboratorError => "repeated_collaborator_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Cap on hints per directive
    pub max_hints: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_hints: 5,
        }
    }
}

/// Everything the implementer needs to make the next attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDirective {
    pub feature_id: String,
    pub attempt: u32,
    pub failures: Vec<TestFailureContext>,
    pub hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progression: Option<TestProgression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_feedback: Option<String>,
    /// Paths already present in the codebase the attempt builds on
    pub accumulated_files: Vec<String>,
}

impl RetryDirective {
    pub fn with_review_feedback(mut self, feedback: &str) -> Self {
        if !feedback.trim().is_empty() {
            self.review_feedback = Some(feedback.trim().to_string());
        }
        self
    }

    /// Plain-text rendering for implementers that take instructions as text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Retry attempt {} for feature '{}'.",
            self.attempt, self.feature_id
        );

        if !self.failures.is_empty() {
            let _ = writeln!(out, "\nFailing checks:");
            for failure in &self.failures {
                let _ = write!(out, "- [{}] {}", failure.failure_type, failure.test_name);
                if let Some(line) = failure.line_number {
                    let _ = write!(out, " (line {})", line);
                }
                let _ = write!(out, ": {}", failure.message);
                if let (Some(expected), Some(actual)) = (&failure.expected, &failure.actual) {
                    let _ = write!(out, " (expected {}, got {})", expected, actual);
                }
                out.push('\n');
            }
        }

        if !self.hints.is_empty() {
            let _ = writeln!(out, "\nHints:");
            for (i, hint) in self.hints.iter().enumerate() {
                let _ = writeln!(out, "{}. {}", i + 1, hint);
            }
        }

        if let Some(progression) = &self.progression
            && progression.attempt_history.len() > 1
        {
            let _ = writeln!(
                out,
                "\nProgress: {} newly passing, {} still failing, {} regressions.",
                progression.newly_passing.len(),
                progression.persistently_failing.len(),
                progression.newly_failing.len()
            );
            for (label, set) in [
                ("Newly passing", &progression.newly_passing),
                ("Still failing", &progression.persistently_failing),
                ("Regressed", &progression.newly_failing),
            ] {
                if !set.is_empty() {
                    let names: Vec<&str> = set.iter().map(String::as_str).collect();
                    let _ = writeln!(out, "{}: {}", label, names.join(", "));
                }
            }
        }

        if let Some(feedback) = &self.review_feedback {
            let _ = writeln!(out, "\nReviewer feedback:\n{}", feedback);
        }

        if !self.accumulated_files.is_empty() {
            let _ = writeln!(out, "\nFiles already in the codebase:");
            for path in &self.accumulated_files {
                let _ = writeln!(out, "- {}", path);
            }
        }

        out
    }
}

/// Decides whether and how to retry failed attempts.
#[derive(Debug)]
pub struct RetryPlanner {
    policy: RetryPolicy,
    extractor: FailureExtractor,
    progression: ProgressionTracker,
    /// Last collaborator error per feature, for escalating identical repeats
    last_collaborator_error: DashMap<String, String>,
}

impl Default for RetryPlanner {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryPlanner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            extractor: FailureExtractor::default(),
            progression: ProgressionTracker::new(),
            last_collaborator_error: DashMap::new(),
        }
    }

    pub fn with_extractor(mut self, extractor: FailureExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether `attempt` (0-based) may be followed by another one.
    pub fn should_retry(&self, attempt: u32, class: ErrorClass) -> bool {
        self.should_retry_within(attempt, class, self.policy.max_retries)
    }

    /// `should_retry` with a per-feature retry limit.
    pub fn should_retry_within(&self, attempt: u32, class: ErrorClass, max_retries: u32) -> bool {
        class.is_retryable() && attempt < max_retries
    }

    pub fn extract_failure_context(&self, raw_output: &str) -> Vec<TestFailureContext> {
        self.extractor.extract(raw_output)
    }

    /// Identifiers of failing tests from raw output and parsed contexts.
    /// A failed run with no recognisable test ids counts as one anonymous failure.
    pub fn failing_tests(
        &self,
        raw_output: &str,
        contexts: &[TestFailureContext],
    ) -> BTreeSet<String> {
        let mut failing = self.extractor.failing_tests(raw_output);
        failing.extend(
            contexts
                .iter()
                .filter(|c| c.test_name != "unknown")
                .map(|c| c.test_name.clone()),
        );
        if failing.is_empty() {
            failing.insert("<unidentified>".to_string());
        }
        failing
    }

    /// Actionable hints, deduplicated, capped at `max_hints`.
    pub fn generate_hints(&self, contexts: &[TestFailureContext]) -> Vec<String> {
        let mut seen = HashSet::new();
        contexts
            .iter()
            .map(Self::hint_for)
            .filter(|hint| seen.insert(hint.clone()))
            .take(self.policy.max_hints)
            .collect()
    }

    fn hint_for(ctx: &TestFailureContext) -> String {
        let component = ctx.missing_component.as_deref();
        match (ctx.failure_type, component) {
            (FailureType::Import, Some(module)) => {
                format!("Create missing module or export `{}`", module)
            }
            (FailureType::Attribute, Some(attribute)) => {
                format!("Add missing attribute `{}`", attribute)
            }
            (FailureType::Name, Some(name)) => format!("Define missing name `{}`", name),
            (FailureType::Type, Some(callable)) => format!(
                "Fix the signature or call of `{}` in {}: {}",
                callable, ctx.test_name, ctx.message
            ),
            (FailureType::Assertion, _) => match (&ctx.expected, &ctx.actual) {
                (Some(expected), Some(actual)) => format!(
                    "Fix assertion in {}: expected {} got {}",
                    ctx.test_name, expected, actual
                ),
                _ => format!("Fix assertion in {}: {}", ctx.test_name, ctx.message),
            },
            (FailureType::Timeout, _) => {
                format!("Speed up or unblock the code exercised by {}: {}", ctx.test_name, ctx.message)
            }
            (FailureType::CollaboratorError, _) => {
                format!("The previous attempt could not complete: {}", ctx.message)
            }
            _ => format!("Fix failure in {}: {}", ctx.test_name, ctx.message),
        }
    }

    pub fn track_progression(
        &self,
        feature_id: &str,
        current_failures: BTreeSet<String>,
        attempt: u32,
    ) -> TestProgression {
        self.progression.track(feature_id, current_failures, attempt)
    }

    pub fn progression(&self, feature_id: &str) -> Option<TestProgression> {
        self.progression.get(feature_id)
    }

    /// Classify a collaborator error. The same error twice in a row for one
    /// feature escalates to `RepeatedCollaboratorError`.
    pub fn classify_collaborator_error(
        &self,
        feature_id: &str,
        error: &CollaboratorError,
    ) -> ErrorClass {
        if error.is_timeout() {
            return ErrorClass::Timeout;
        }

        let signature = error.to_string();
        let previous = self
            .last_collaborator_error
            .insert(feature_id.to_string(), signature.clone());
        if previous.as_deref() == Some(signature.as_str()) {
            ErrorClass::RepeatedCollaboratorError
        } else {
            ErrorClass::CollaboratorError
        }
    }

    /// Forget the last collaborator error after a successful call.
    pub fn clear_collaborator_error(&self, feature_id: &str) {
        self.last_collaborator_error.remove(feature_id);
    }

    /// Failure context describing a collaborator error or timeout.
    pub fn collaborator_failure_context(error: &CollaboratorError) -> TestFailureContext {
        let failure_type = if error.is_timeout() {
            FailureType::Timeout
        } else {
            FailureType::CollaboratorError
        };
        TestFailureContext::new(failure_type, &error.role().to_string(), &error.to_string())
    }

    pub fn build_retry_directive(
        &self,
        feature: &Feature,
        contexts: &[TestFailureContext],
        progression: Option<&TestProgression>,
        attempt: u32,
        accumulated: &CodeSnapshot,
    ) -> RetryDirective {
        RetryDirective {
            feature_id: feature.id.clone(),
            attempt,
            failures: contexts.to_vec(),
            hints: self.generate_hints(contexts),
            progression: progression.cloned(),
            review_feedback: None,
            accumulated_files: accumulated.paths().map(String::from).collect(),
        }
    }

    /// Drop all per-feature state.
    pub fn reset(&self, feature_id: &str) {
        self.progression.reset(feature_id);
        self.last_collaborator_error.remove(feature_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CollaboratorRole;
    use std::time::Duration;

    fn assertion(test: &str, expected: &str, actual: &str) -> TestFailureContext {
        let mut ctx = TestFailureContext::new(
            FailureType::Assertion,
            test,
            &format!("assert {} == {}", actual, expected),
        );
        ctx.expected = Some(expected.to_string());
        ctx.actual = Some(actual.to_string());
        ctx
    }

    #[test]
    fn test_should_retry_respects_class_and_budget() {
        let planner = RetryPlanner::new(RetryPolicy {
            max_retries: 2,
            max_hints: 5,
        });

        assert!(planner.should_retry(0, ErrorClass::TestFailure));
        assert!(planner.should_retry(1, ErrorClass::Timeout));
        assert!(!planner.should_retry(2, ErrorClass::TestFailure));

        for class in [
            ErrorClass::CyclicDependency,
            ErrorClass::MalformedFeature,
            ErrorClass::ContractViolation,
            ErrorClass::StorageError,
            ErrorClass::MaxAttemptsExceeded,
            ErrorClass::RepeatedCollaboratorError,
        ] {
            assert!(!planner.should_retry(0, class), "{} must not retry", class);
        }

        assert!(planner.should_retry_within(4, ErrorClass::CollaboratorError, 5));
    }

    #[test]
    fn test_hints_are_capped_and_deduplicated() {
        let planner = RetryPlanner::new(RetryPolicy {
            max_retries: 3,
            max_hints: 2,
        });

        let mut import = TestFailureContext::new(FailureType::Import, "test_a", "No module named 'calc'");
        import.missing_component = Some("calc".into());

        let contexts = vec![
            import.clone(),
            import,
            assertion("test_b", "3", "4"),
            assertion("test_c", "1", "0"),
        ];

        let hints = planner.generate_hints(&contexts);
        assert_eq!(hints.len(), 2);
        assert_eq!(hints[0], "Create missing module or export `calc`");
        assert_eq!(hints[1], "Fix assertion in test_b: expected 3 got 4");
    }

    #[test]
    fn test_default_hint_cap_is_five() {
        let planner = RetryPlanner::default();
        let contexts: Vec<_> = (0..8)
            .map(|i| assertion(&format!("test_{}", i), "1", "2"))
            .collect();
        assert_eq!(planner.generate_hints(&contexts).len(), 5);
    }

    #[test]
    fn test_failing_tests_falls_back_to_anonymous() {
        let planner = RetryPlanner::default();
        let failing = planner.failing_tests("segfault", &[]);
        assert_eq!(failing.len(), 1);

        let contexts = vec![assertion("test_x", "1", "2")];
        let failing = planner.failing_tests("", &contexts);
        assert!(failing.contains("test_x"));
    }

    #[test]
    fn test_repeated_collaborator_error_escalates() {
        let planner = RetryPlanner::default();
        let err = CollaboratorError::Malformed {
            role: CollaboratorRole::Implementer,
            message: "missing field `files`".into(),
        };

        assert_eq!(
            planner.classify_collaborator_error("f", &err),
            ErrorClass::CollaboratorError
        );
        assert_eq!(
            planner.classify_collaborator_error("f", &err),
            ErrorClass::RepeatedCollaboratorError
        );

        planner.clear_collaborator_error("f");
        assert_eq!(
            planner.classify_collaborator_error("f", &err),
            ErrorClass::CollaboratorError
        );

        // A different error resets the streak.
        let other = CollaboratorError::Failed {
            role: CollaboratorRole::Implementer,
            message: "exit 1".into(),
        };
        assert_eq!(
            planner.classify_collaborator_error("f", &other),
            ErrorClass::CollaboratorError
        );
    }

    #[test]
    fn test_timeouts_never_escalate() {
        let planner = RetryPlanner::default();
        let err = CollaboratorError::Timeout {
            role: CollaboratorRole::TestRunner,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(planner.classify_collaborator_error("f", &err), ErrorClass::Timeout);
        assert_eq!(planner.classify_collaborator_error("f", &err), ErrorClass::Timeout);

        let ctx = RetryPlanner::collaborator_failure_context(&err);
        assert_eq!(ctx.failure_type, FailureType::Timeout);
        assert_eq!(ctx.test_name, "test-runner");
    }

    #[test]
    fn test_build_and_render_directive() {
        let planner = RetryPlanner::default();
        let feature = Feature::new("calc-add", "Addition");

        let mut failing = BTreeSet::new();
        failing.extend(["t1".to_string(), "t2".to_string(), "t3".to_string()]);
        planner.track_progression("calc-add", failing, 0);
        let progression = planner.track_progression("calc-add", ["t3".to_string()].into(), 1);

        let mut files = crate::collab::SourceFiles::new();
        files.insert("calc.py".into(), "def add(a, b): return a - b".into());
        let codebase = CodeSnapshot::new(files);

        let contexts = vec![assertion("t3", "3", "-1")];
        let directive = planner
            .build_retry_directive(&feature, &contexts, Some(&progression), 2, &codebase)
            .with_review_feedback("Handle negative numbers");

        assert_eq!(directive.attempt, 2);
        assert_eq!(directive.hints.len(), 1);
        assert_eq!(directive.accumulated_files, vec!["calc.py"]);

        let text = directive.render();
        assert!(text.contains("Retry attempt 2 for feature 'calc-add'"));
        assert!(text.contains("[assertion] t3"));
        assert!(text.contains("expected 3, got -1"));
        assert!(text.contains("Newly passing: t1, t2"));
        assert!(text.contains("Still failing: t3"));
        assert!(text.contains("Reviewer feedback:\nHandle negative numbers"));
        assert!(text.contains("- calc.py"));
    }

    #[test]
    fn test_extract_through_planner() {
        let planner = RetryPlanner::default();
        let contexts =
            planner.extract_failure_context("E   NameError: name 'Stack' is not defined");
        assert_eq!(contexts.len(), 1);
        assert_eq!(
            planner.generate_hints(&contexts),
            vec!["Define missing name `Stack`"]
        );
    }
}
