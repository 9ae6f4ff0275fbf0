//! Structured failure extraction from raw test-runner output.
//!
//! Parsing is a pluggable list of `FailureMatcher`s tried in order on every
//! output line; the first matcher that recognises a line wins. The extractor
//! tracks which test each line belongs to (pytest section headers, unittest
//! `FAIL:` headers and `FAILED` summary lines) and attaches line numbers from
//! `path:line:` locations and traceback frames.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Classification of a single failing check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Import,
    Assertion,
    Attribute,
    Name,
    Type,
    /// An external call ran past its deadline
    Timeout,
    /// An external collaborator failed or returned malformed output
    CollaboratorError,
    Other,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureType::Import => "import",
            FailureType::Assertion => "assertion",
            FailureType::Attribute => "attribute",
            FailureType::Name => "name",
            FailureType::Type => "type",
            FailureType::Timeout => "timeout",
            FailureType::CollaboratorError => "collaborator_error",
            FailureType::Other => "other",
        };
        f.write_str(s)
    }
}

/// One failing check, as understood from runner output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailureContext {
    pub failure_type: FailureType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_component: Option<String>,
    pub test_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
}

impl TestFailureContext {
    pub fn new(failure_type: FailureType, test_name: &str, message: &str) -> Self {
        Self {
            failure_type,
            message: message.to_string(),
            expected: None,
            actual: None,
            missing_component: None,
            test_name: test_name.to_string(),
            line_number: None,
        }
    }

    fn from_match(m: FailureMatch, test_name: &str) -> Self {
        Self {
            failure_type: m.failure_type,
            message: m.message,
            expected: m.expected,
            actual: m.actual,
            missing_component: m.missing_component,
            test_name: test_name.to_string(),
            line_number: None,
        }
    }
}

/// What a matcher recognised on one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureMatch {
    pub failure_type: FailureType,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub missing_component: Option<String>,
}

impl FailureMatch {
    pub fn new(failure_type: FailureType, message: &str) -> Self {
        Self {
            failure_type,
            message: message.trim().to_string(),
            expected: None,
            actual: None,
            missing_component: None,
        }
    }

    fn missing(mut self, component: &str) -> Self {
        self.missing_component = Some(component.to_string());
        self
    }
}

/// Recognises one failure shape on a single output line.
pub trait FailureMatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// `line` has leading whitespace and pytest's `E ` marker removed.
    fn match_line(&self, line: &str) -> Option<FailureMatch>;
}

static IMPORT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:ModuleNotFoundError|ImportError): (?:No module named '([^']+)'|cannot import name '([^']+)'.*)",
    )
    .unwrap()
});

static ASSERT_EQ_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:AssertionError:\s*)?assert\s+(.+?)\s*==\s*(.+?)\s*$").unwrap()
});

static EXPECTED_GOT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)expected:?\s+(.+?),?\s+(?:but\s+)?(?:got|received|was):?\s+(.+?)\s*$").unwrap()
});

static ASSERTION_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:AssertionError(?::\s*(.*))?|assert\s+(.+))$").unwrap());

static ATTRIBUTE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"AttributeError: (?:'([^']+)' object|module '([^']+)'|type object '([^']+)') has no attribute '([^']+)'")
        .unwrap()
});

static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"NameError: name '([^']+)' is not defined").unwrap());

static TYPE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"TypeError: (.+)$").unwrap());

static CALLABLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[\w.]+\.)?(\w+)\(\)").unwrap());

static GENERIC_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+(?:Error|Exception)): (.+)$").unwrap());

static PYTEST_SECTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^_{3,}\s+(.+?)\s+_{3,}$").unwrap());

static UNITTEST_HEADER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:FAIL|ERROR): (\S+)").unwrap());

static FAILED_SUMMARY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:FAILED|ERROR)\s+(\S+?)(?:\s+-\s+(.*))?$").unwrap());

static LOCATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S+\.\w+:(\d+):").unwrap());

static TRACEBACK_FRAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^File "[^"]+", line (\d+)"#).unwrap());

/// `ModuleNotFoundError` / `ImportError`.
pub struct ImportErrorMatcher;

impl FailureMatcher for ImportErrorMatcher {
    fn name(&self) -> &'static str {
        "import"
    }

    fn match_line(&self, line: &str) -> Option<FailureMatch> {
        let caps = IMPORT_REGEX.captures(line)?;
        let component = caps.get(1).or_else(|| caps.get(2))?.as_str();
        Some(FailureMatch::new(FailureType::Import, line).missing(component))
    }
}

/// `assert actual == expected`, `AssertionError: ...` and "expected X, got Y".
pub struct AssertionMatcher;

impl FailureMatcher for AssertionMatcher {
    fn name(&self) -> &'static str {
        "assertion"
    }

    fn match_line(&self, line: &str) -> Option<FailureMatch> {
        if let Some(caps) = ASSERT_EQ_REGEX.captures(line) {
            let mut m = FailureMatch::new(
                FailureType::Assertion,
                line.trim_start_matches("AssertionError:").trim(),
            );
            m.actual = Some(caps[1].to_string());
            m.expected = Some(caps[2].to_string());
            return Some(m);
        }

        if let Some(caps) = EXPECTED_GOT_REGEX.captures(line) {
            let mut m = FailureMatch::new(FailureType::Assertion, line);
            m.expected = Some(caps[1].to_string());
            m.actual = Some(caps[2].to_string());
            return Some(m);
        }

        let caps = ASSERTION_ERROR_REGEX.captures(line)?;
        let detail = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str().trim())
            .filter(|s| !s.is_empty())
            .unwrap_or("AssertionError");
        Some(FailureMatch::new(FailureType::Assertion, detail))
    }
}

/// `AttributeError: 'X' object has no attribute 'y'`.
pub struct AttributeErrorMatcher;

impl FailureMatcher for AttributeErrorMatcher {
    fn name(&self) -> &'static str {
        "attribute"
    }

    fn match_line(&self, line: &str) -> Option<FailureMatch> {
        let caps = ATTRIBUTE_REGEX.captures(line)?;
        let owner = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())?;
        let attribute = &caps[4];
        Some(
            FailureMatch::new(FailureType::Attribute, line)
                .missing(&format!("{}.{}", owner, attribute)),
        )
    }
}

/// `NameError: name 'x' is not defined`.
pub struct NameErrorMatcher;

impl FailureMatcher for NameErrorMatcher {
    fn name(&self) -> &'static str {
        "name"
    }

    fn match_line(&self, line: &str) -> Option<FailureMatch> {
        let caps = NAME_REGEX.captures(line)?;
        Some(FailureMatch::new(FailureType::Name, line).missing(&caps[1]))
    }
}

/// `TypeError: ...`; names the callable when the message starts with one.
pub struct TypeErrorMatcher;

impl FailureMatcher for TypeErrorMatcher {
    fn name(&self) -> &'static str {
        "type"
    }

    fn match_line(&self, line: &str) -> Option<FailureMatch> {
        let caps = TYPE_REGEX.captures(line)?;
        let detail = &caps[1];
        let mut m = FailureMatch::new(FailureType::Type, line);
        if let Some(callable) = CALLABLE_REGEX.captures(detail) {
            m.missing_component = Some(callable[1].to_string());
        }
        Some(m)
    }
}

/// Any other `SomethingError: message` line.
pub struct GenericErrorMatcher;

impl FailureMatcher for GenericErrorMatcher {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn match_line(&self, line: &str) -> Option<FailureMatch> {
        let caps = GENERIC_ERROR_REGEX.captures(line)?;
        let failure_type = if &caps[1] == "TimeoutError" {
            FailureType::Timeout
        } else {
            FailureType::Other
        };
        Some(FailureMatch::new(failure_type, line))
    }
}

/// Runs the matchers over raw runner output.
pub struct FailureExtractor {
    matchers: Vec<Box<dyn FailureMatcher>>,
}

impl Default for FailureExtractor {
    fn default() -> Self {
        Self {
            matchers: vec![
                Box::new(ImportErrorMatcher),
                Box::new(AttributeErrorMatcher),
                Box::new(NameErrorMatcher),
                Box::new(TypeErrorMatcher),
                Box::new(AssertionMatcher),
                Box::new(GenericErrorMatcher),
            ],
        }
    }
}

impl fmt::Debug for FailureExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.matchers.iter().map(|m| m.name()).collect();
        f.debug_struct("FailureExtractor").field("matchers", &names).finish()
    }
}

/// Normalise a test id to its function name (`path::Class::test_x` -> `test_x`).
fn short_test_name(id: &str) -> &str {
    let id = id.rsplit("::").next().unwrap_or(id);
    // unittest style: test_x (module.Class)
    id.split_whitespace().next().unwrap_or(id)
}

fn strip_marker(line: &str) -> &str {
    let trimmed = line.trim();
    match trimmed.strip_prefix("E ") {
        Some(rest) => rest.trim_start(),
        None if trimmed == "E" => "",
        None => trimmed,
    }
}

impl FailureExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a matcher ahead of the built-in ones.
    pub fn with_matcher(mut self, matcher: Box<dyn FailureMatcher>) -> Self {
        self.matchers.insert(0, matcher);
        self
    }

    pub fn matcher_names(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }

    fn match_line(&self, line: &str) -> Option<FailureMatch> {
        self.matchers.iter().find_map(|m| m.match_line(line))
    }

    /// Extract deduplicated failure contexts, in order of first appearance.
    pub fn extract(&self, raw_output: &str) -> Vec<TestFailureContext> {
        let mut contexts: Vec<TestFailureContext> = Vec::new();
        let mut seen: HashSet<(String, FailureType, String)> = HashSet::new();
        let mut current_test = String::from("unknown");
        let mut section_start = 0;
        let mut pending_line: Option<u32> = None;

        for raw_line in raw_output.lines() {
            let line = strip_marker(raw_line);
            if line.is_empty() {
                continue;
            }

            if let Some(caps) = PYTEST_SECTION_REGEX
                .captures(line)
                .or_else(|| UNITTEST_HEADER_REGEX.captures(line))
            {
                current_test = short_test_name(&caps[1]).to_string();
                section_start = contexts.len();
                pending_line = None;
                continue;
            }

            if let Some(caps) = FAILED_SUMMARY_REGEX.captures(line) {
                let test = short_test_name(&caps[1]).to_string();
                if let Some(detail) = caps.get(2)
                    && let Some(m) = self.match_line(detail.as_str().trim())
                {
                    let ctx = TestFailureContext::from_match(m, &test);
                    Self::push_unique(&mut contexts, &mut seen, ctx);
                }
                continue;
            }

            if let Some(caps) = LOCATION_REGEX
                .captures(line)
                .or_else(|| TRACEBACK_FRAME_REGEX.captures(line))
            {
                let number = caps[1].parse::<u32>().ok();
                pending_line = number;
                for ctx in contexts[section_start..].iter_mut() {
                    if ctx.test_name == current_test && ctx.line_number.is_none() {
                        ctx.line_number = number;
                    }
                }
                continue;
            }

            if let Some(m) = self.match_line(line) {
                let mut ctx = TestFailureContext::from_match(m, &current_test);
                ctx.line_number = pending_line;
                Self::push_unique(&mut contexts, &mut seen, ctx);
            }
        }

        contexts
    }

    fn push_unique(
        contexts: &mut Vec<TestFailureContext>,
        seen: &mut HashSet<(String, FailureType, String)>,
        ctx: TestFailureContext,
    ) {
        let key = (ctx.test_name.clone(), ctx.failure_type, ctx.message.clone());
        if seen.insert(key) {
            contexts.push(ctx);
        }
    }

    /// Identifiers of every failing test mentioned in the output.
    pub fn failing_tests(&self, raw_output: &str) -> BTreeSet<String> {
        let mut failing = BTreeSet::new();
        for raw_line in raw_output.lines() {
            let line = strip_marker(raw_line);
            let caps = FAILED_SUMMARY_REGEX
                .captures(line)
                .or_else(|| PYTEST_SECTION_REGEX.captures(line))
                .or_else(|| UNITTEST_HEADER_REGEX.captures(line));
            if let Some(caps) = caps {
                failing.insert(short_test_name(&caps[1]).to_string());
            }
        }
        failing
    }
}
