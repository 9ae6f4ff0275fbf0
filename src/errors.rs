//! Typed error hierarchy for the orchestration engine.
//!
//! One enum per subsystem:
//! - `ConfigError`: feature set problems that abort the whole run
//! - `PhaseError`: illegal RED/YELLOW/GREEN moves and contract gates
//! - `StoreError`: CodeStore spillover and snapshot I/O
//! - `CollaboratorError`: failures of the external test-writer/implementer/reviewer/runner
//! - `OrchestratorError`: top-level wrapper returned from a run

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::phase::Phase;

/// Fatal configuration errors. Never retried; abort the run before any feature starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Cycle detected in feature dependencies: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Unknown dependency '{dependency}' in feature '{feature}': no feature with that id exists")]
    UnknownDependency { feature: String, dependency: String },

    #[error("Duplicate feature id: {0}")]
    DuplicateFeature(String),

    #[error("Malformed feature '{feature}': {reason}")]
    MalformedFeature { feature: String, reason: String },
}

/// Errors raised by the phase tracker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseError {
    #[error("Feature {0} has already been started")]
    AlreadyStarted(String),

    #[error("Feature {0} has not been started")]
    NotStarted(String),

    #[error("Feature {0} cannot enter RED without a written test suite")]
    MissingTests(String),

    #[error("Illegal transition for feature {feature}: {from} -> {to}")]
    IllegalTransition { feature: String, from: Phase, to: Phase },

    #[error("Implementation attempted for feature {feature} while in {phase}; a failing test must exist first")]
    ImplementationOutsideRed { feature: String, phase: Phase },
}

/// Errors from the code store. Fatal for the in-flight feature attempt.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to prepare spill directory {path}: {source}")]
    SpillDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spill '{file}' to {location}: {source}")]
    SpillFailed {
        file: String,
        location: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to rehydrate '{file}' from {location}: {source}")]
    RehydrateFailed {
        file: String,
        location: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to persist unsafe path '{0}'")]
    UnsafePath(String),

    #[error("Failed to write snapshot file {path}: {source}")]
    SnapshotFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The external collaborator a call was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorRole {
    TestWriter,
    Implementer,
    Reviewer,
    TestRunner,
}

impl std::fmt::Display for CollaboratorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollaboratorRole::TestWriter => write!(f, "test-writer"),
            CollaboratorRole::Implementer => write!(f, "implementer"),
            CollaboratorRole::Reviewer => write!(f, "reviewer"),
            CollaboratorRole::TestRunner => write!(f, "test-runner"),
        }
    }
}

/// Errors from calls to external collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{role} call timed out after {}s", .timeout.as_secs_f64())]
    Timeout {
        role: CollaboratorRole,
        timeout: Duration,
    },

    #[error("{role} failed: {message}")]
    Failed {
        role: CollaboratorRole,
        message: String,
    },

    #[error("{role} returned malformed output: {message}")]
    Malformed {
        role: CollaboratorRole,
        message: String,
    },
}

impl CollaboratorError {
    /// The collaborator the failing call was addressed to.
    pub fn role(&self) -> CollaboratorRole {
        match self {
            CollaboratorError::Timeout { role, .. }
            | CollaboratorError::Failed { role, .. }
            | CollaboratorError::Malformed { role, .. } => *role,
        }
    }

    /// Whether this error is a timeout rather than a collaborator failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CollaboratorError::Timeout { .. })
    }
}

/// Errors returned from a whole orchestration run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
