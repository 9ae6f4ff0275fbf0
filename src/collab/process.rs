//! Collaborators backed by external commands.
//!
//! Each call spawns the configured command, writes one JSON request to its
//! stdin and reads one JSON response from its stdout. Commands may print
//! surrounding text; the outermost JSON object is extracted. A non-zero exit
//! is a collaborator failure, never a test failure: test runners report
//! failing tests with `"passed": false`.
//!
//! Requests carry an `action` field (`write_tests`, `implement`, `review`,
//! `run_tests`) so one script can serve several roles.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{
    Implementer, ReviewVerdict, Reviewer, SourceFiles, TestRunResult, TestRunner, TestSuite,
    TestWriter,
};
use crate::errors::{CollaboratorError, CollaboratorRole};
use crate::feature::Feature;
use crate::retry::RetryDirective;
use crate::store::CodeSnapshot;
use crate::util::extract_json_object;

const STDERR_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    role: CollaboratorRole,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct FilesResponse {
    files: SourceFiles,
}

impl CommandCollaborator {
    /// Create a collaborator from an argv list (`[program, args...]`).
    pub fn new(role: CollaboratorRole, argv: &[String]) -> anyhow::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("No command configured for the {} collaborator", role))?;
        Ok(Self {
            role,
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn role(&self) -> CollaboratorRole {
        self.role
    }

    fn failed(&self, message: String) -> CollaboratorError {
        CollaboratorError::Failed {
            role: self.role,
            message,
        }
    }

    fn malformed(&self, message: String) -> CollaboratorError {
        CollaboratorError::Malformed {
            role: self.role,
            message,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: serde_json::Value,
    ) -> Result<T, CollaboratorError> {
        let payload = serde_json::to_vec(&request)
            .map_err(|e| self.failed(format!("Failed to encode request: {}", e)))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(role = %self.role, program = %self.program, bytes = payload.len(), "spawning collaborator");

        let mut child = cmd
            .spawn()
            .map_err(|e| self.failed(format!("Failed to spawn '{}': {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.failed("Failed to open stdin".to_string()))?;
        let writer = async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        };

        let (write_result, output) = tokio::join!(writer, child.wait_with_output());
        let output =
            output.map_err(|e| self.failed(format!("Failed to wait for '{}': {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT_CHARS).collect();
            return Err(self.failed(format!("'{}' exited with {}: {}", self.program, output.status, excerpt)));
        }
        if let Err(e) = write_result {
            // A command that exits successfully without reading stdin is fine.
            tracing::debug!(role = %self.role, error = %e, "collaborator closed stdin early");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        self.parse_response(&stdout)
    }

    fn parse_response<T: DeserializeOwned>(&self, stdout: &str) -> Result<T, CollaboratorError> {
        if let Ok(value) = serde_json::from_str::<T>(stdout.trim()) {
            return Ok(value);
        }
        let json = extract_json_object(stdout)
            .ok_or_else(|| self.malformed("no JSON object in output".to_string()))?;
        serde_json::from_str(&json).map_err(|e| self.malformed(e.to_string()))
    }
}

#[async_trait]
impl TestWriter for CommandCollaborator {
    async fn write_tests(&self, feature: &Feature) -> Result<TestSuite, CollaboratorError> {
        self.call(json!({ "action": "write_tests", "feature": feature }))
            .await
    }
}

#[async_trait]
impl Implementer for CommandCollaborator {
    async fn implement(
        &self,
        feature: &Feature,
        codebase: &CodeSnapshot,
        directive: Option<&RetryDirective>,
    ) -> Result<SourceFiles, CollaboratorError> {
        let response: FilesResponse = self
            .call(json!({
                "action": "implement",
                "feature": feature,
                "codebase": codebase.files(),
                "directive": directive,
                "instructions": directive.map(RetryDirective::render),
            }))
            .await?;
        Ok(response.files)
    }
}

#[async_trait]
impl Reviewer for CommandCollaborator {
    async fn review(
        &self,
        feature: &Feature,
        files: &SourceFiles,
        results: &TestRunResult,
    ) -> Result<ReviewVerdict, CollaboratorError> {
        self.call(json!({
            "action": "review",
            "feature": feature,
            "files": files,
            "results": results,
        }))
        .await
    }
}

#[async_trait]
impl TestRunner for CommandCollaborator {
    async fn run_tests(
        &self,
        files: &SourceFiles,
        tests: &TestSuite,
        expect_failure: bool,
    ) -> Result<TestRunResult, CollaboratorError> {
        self.call(json!({
            "action": "run_tests",
            "files": files,
            "tests": tests.files,
            "expect_failure": expect_failure,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(role: CollaboratorRole, script: &str) -> CommandCollaborator {
        let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        CommandCollaborator::new(role, &argv).unwrap()
    }

    #[test]
    fn test_new_rejects_empty_command() {
        let err = CommandCollaborator::new(CollaboratorRole::Reviewer, &[]).unwrap_err();
        assert!(err.to_string().contains("reviewer"));
    }

    #[test]
    fn test_parse_response_extracts_embedded_object() {
        let collab = sh(CollaboratorRole::Reviewer, "true");
        let verdict: ReviewVerdict = collab
            .parse_response("thinking...\n{\"approved\": false, \"feedback\": \"add docs\"}\ndone")
            .unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.feedback, "add docs");

        let err = collab.parse_response::<ReviewVerdict>("nothing here").unwrap_err();
        assert!(matches!(err, CollaboratorError::Malformed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_implementer_round_trip_through_process() {
        let collab = sh(
            CollaboratorRole::Implementer,
            r#"cat > /dev/null; echo '{"files": {"calc.py": "def add(a, b):\n    return a + b\n"}}'"#,
        );
        let files = collab
            .implement(&Feature::new("add", "Add"), &CodeSnapshot::default(), None)
            .await
            .unwrap();
        assert!(files["calc.py"].contains("return a + b"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_is_written_to_stdin() {
        // Echo the request back as the feedback field.
        let collab = sh(
            CollaboratorRole::Reviewer,
            r#"read -r line; printf '{"approved": true, "feedback": "%s"}' "$(printf '%s' "$line" | grep -o '"action":"[a-z_]*"' | tr -d '"')""#,
        );
        let verdict = collab
            .review(
                &Feature::new("a", "A"),
                &SourceFiles::new(),
                &TestRunResult::passed("ok"),
            )
            .await
            .unwrap();
        assert!(verdict.approved);
        assert_eq!(verdict.feedback, "action:review");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let collab = sh(CollaboratorRole::TestRunner, "echo 'runner crashed' >&2; exit 3");
        let err = collab
            .run_tests(&SourceFiles::new(), &TestSuite::default(), false)
            .await
            .unwrap_err();
        match err {
            CollaboratorError::Failed { role, message } => {
                assert_eq!(role, CollaboratorRole::TestRunner);
                assert!(message.contains("runner crashed"));
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_program_is_failure() {
        let argv = vec!["definitely-not-a-real-program-xyz".to_string()];
        let collab = CommandCollaborator::new(CollaboratorRole::TestWriter, &argv).unwrap();
        let err = collab.write_tests(&Feature::new("a", "A")).await.unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }
}
