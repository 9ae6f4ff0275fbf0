//! External collaborator boundary.
//!
//! The engine never generates code or runs tests itself. It calls out to four
//! collaborators through the traits below. Real implementation:
//! `CommandCollaborator`. Tests use scripted in-memory doubles.

pub mod process;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CollaboratorError;
use crate::feature::Feature;
use crate::retry::RetryDirective;
use crate::store::CodeSnapshot;

pub use process::CommandCollaborator;

/// Path -> file content.
pub type SourceFiles = BTreeMap<String, String>;

/// Tests produced by the test-writer for one feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    pub files: SourceFiles,
}

impl TestSuite {
    pub fn new(files: SourceFiles) -> Self {
        Self { files }
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.values().all(|c| c.trim().is_empty())
    }
}

/// Outcome of one test execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub passed: bool,
    #[serde(default)]
    pub raw_output: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_percent: Option<f64>,
}

impl TestRunResult {
    pub fn passed(raw_output: &str) -> Self {
        Self {
            passed: true,
            raw_output: raw_output.to_string(),
            duration_ms: 0,
            coverage_percent: None,
        }
    }

    pub fn failed(raw_output: &str) -> Self {
        Self {
            passed: false,
            raw_output: raw_output.to_string(),
            duration_ms: 0,
            coverage_percent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub approved: bool,
    #[serde(default)]
    pub feedback: String,
}

impl ReviewVerdict {
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: String::new(),
        }
    }

    pub fn reject(feedback: &str) -> Self {
        Self {
            approved: false,
            feedback: feedback.to_string(),
        }
    }
}

/// Writes tests that must fail against an absent implementation.
#[async_trait]
pub trait TestWriter: Send + Sync {
    async fn write_tests(&self, feature: &Feature) -> Result<TestSuite, CollaboratorError>;
}

/// Produces source files for a feature. `codebase` holds every file
/// completed so far plus this feature's own earlier attempts.
#[async_trait]
pub trait Implementer: Send + Sync {
    async fn implement(
        &self,
        feature: &Feature,
        codebase: &CodeSnapshot,
        directive: Option<&RetryDirective>,
    ) -> Result<SourceFiles, CollaboratorError>;
}

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(
        &self,
        feature: &Feature,
        files: &SourceFiles,
        results: &TestRunResult,
    ) -> Result<ReviewVerdict, CollaboratorError>;
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(
        &self,
        files: &SourceFiles,
        tests: &TestSuite,
        expect_failure: bool,
    ) -> Result<TestRunResult, CollaboratorError>;
}

/// The four collaborators, shared by every feature worker.
#[derive(Clone)]
pub struct Collaborators {
    pub test_writer: Arc<dyn TestWriter>,
    pub implementer: Arc<dyn Implementer>,
    pub reviewer: Arc<dyn Reviewer>,
    pub test_runner: Arc<dyn TestRunner>,
}

impl Collaborators {
    pub fn new(
        test_writer: Arc<dyn TestWriter>,
        implementer: Arc<dyn Implementer>,
        reviewer: Arc<dyn Reviewer>,
        test_runner: Arc<dyn TestRunner>,
    ) -> Self {
        Self {
            test_writer,
            implementer,
            reviewer,
            test_runner,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
