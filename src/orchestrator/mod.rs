//! Top-level orchestration of a feature set.

mod outcome;
mod report;
mod runner;

pub use outcome::{FeatureFailure, FeatureOutcome, FeatureStatus, RetryReason, StepOutcome};
pub use report::{CompletionReport, ProgressSnapshot, RunMetrics};
pub use runner::{FeatureOrchestrator, OrchestratorConfig};
