//! Feature definitions and feature-file loading.
//!
//! Features are produced by an external planner and are immutable once loaded;
//! their phase is owned by `PhaseTracker` and their code by `CodeStore`.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Complexity level for a feature. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Low => write!(f, "low"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::High => write!(f, "high"),
        }
    }
}

/// A unit of incremental work with acceptance checks and dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// Unique, stable identifier
    pub id: String,
    /// Human-readable title
    pub title: String,
    /// What the feature should do
    #[serde(default)]
    pub description: String,
    /// Ordered acceptance checks the tests must cover
    #[serde(default)]
    pub test_criteria: Vec<String>,
    /// Ids of features that must be GREEN before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
}

impl Feature {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            test_criteria: Vec::new(),
            dependencies: Vec::new(),
            complexity: Complexity::default(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.test_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Check the feature is well formed on its own (graph-level checks live in the DAG builder).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let malformed = |reason: &str| ConfigError::MalformedFeature {
            feature: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(malformed("id must not be empty"));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(malformed("id must not contain whitespace"));
        }
        if self.title.trim().is_empty() {
            return Err(malformed("title must not be empty"));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep == &self.id {
                return Err(malformed("feature depends on itself"));
            }
            if !seen.insert(dep.as_str()) {
                return Err(malformed(&format!("dependency '{}' listed more than once", dep)));
            }
        }

        Ok(())
    }
}

/// The on-disk feature list produced by the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeaturesFile {
    /// Optional name of the artifact being built
    #[serde(default)]
    pub project: Option<String>,
    pub features: Vec<Feature>,
}

impl FeaturesFile {
    /// Load a feature list from JSON, or YAML when the extension is `.yaml`/`.yml`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read features file: {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse features YAML: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse features JSON: {}", path.display()))
        }
    }

    /// Save the feature list as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize features to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write features file: {}", path.display()))?;
        Ok(())
    }

    /// Validate every feature individually.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.features.iter().try_for_each(Feature::validate)
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }
}
