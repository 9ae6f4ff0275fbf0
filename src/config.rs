//! Engine configuration read from `.forge/forge.toml`.
//!
//! Settings are layered: file → environment → CLI. Every field has a default,
//! so an empty or missing file yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [engine]
//! max_retries = 3
//! max_parallel = 4
//! call_timeout_secs = 300
//!
//! [cache]
//! max_entries = 256
//! max_bytes = 16777216
//!
//! [store]
//! memory_threshold_bytes = 8388608
//! spill_dir = ".forge/spill"
//! snapshot_dir = ".forge/output"
//! persist_snapshot = false
//!
//! [retry]
//! max_hints = 5
//!
//! [logging]
//! format = "pretty"
//!
//! [collaborators]
//! test_writer = ["python3", "tools/write_tests.py"]
//! implementer = ["python3", "tools/implement.py"]
//! reviewer = ["python3", "tools/review.py"]
//! test_runner = ["python3", "tools/run_tests.py"]
//!
//! [features.overrides."auth-*"]
//! max_retries = 5
//! call_timeout_secs = 600
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::collab::{CommandCollaborator, Collaborators};
use crate::errors::CollaboratorRole;
use crate::orchestrator::OrchestratorConfig;
use crate::store::StoreConfig;
use crate::util::pattern_matches;

/// Core engine limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Retries allowed after the first implementation attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Concurrent feature workers
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Timeout applied to every external call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_parallel() -> usize {
    4
}

fn default_call_timeout_secs() -> u64 {
    300
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_parallel: default_max_parallel(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_bytes")]
    pub max_bytes: usize,
}

fn default_cache_entries() -> usize {
    CacheConfig::default().max_entries
}

fn default_cache_bytes() -> usize {
    CacheConfig::default().max_bytes
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            max_bytes: default_cache_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSection {
    /// Resident bytes before payloads spill to disk
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_bytes: usize,
    #[serde(default = "default_spill_dir")]
    pub spill_dir: PathBuf,
    /// Where the final code snapshot is written when `persist_snapshot` is set
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default)]
    pub persist_snapshot: bool,
}

fn default_memory_threshold() -> usize {
    StoreConfig::default().memory_threshold_bytes
}

fn default_spill_dir() -> PathBuf {
    PathBuf::from(".forge/spill")
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from(".forge/output")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: default_memory_threshold(),
            spill_dir: default_spill_dir(),
            snapshot_dir: default_snapshot_dir(),
            persist_snapshot: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySection {
    /// Cap on hints per retry directive
    #[serde(default = "default_max_hints")]
    pub max_hints: usize,
}

fn default_max_hints() -> usize {
    5
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_hints: default_max_hints(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
}

/// Commands (argv lists) backing each collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaboratorsSection {
    #[serde(default)]
    pub test_writer: Vec<String>,
    #[serde(default)]
    pub implementer: Vec<String>,
    #[serde(default)]
    pub reviewer: Vec<String>,
    #[serde(default)]
    pub test_runner: Vec<String>,
}

impl CollaboratorsSection {
    fn commands(&self) -> [(CollaboratorRole, &Vec<String>); 4] {
        [
            (CollaboratorRole::TestWriter, &self.test_writer),
            (CollaboratorRole::Implementer, &self.implementer),
            (CollaboratorRole::Reviewer, &self.reviewer),
            (CollaboratorRole::TestRunner, &self.test_runner),
        ]
    }

    /// Whether any collaborator command is configured.
    pub fn is_configured(&self) -> bool {
        self.commands().iter().any(|(_, argv)| !argv.is_empty())
    }

    /// Build command-backed collaborators running in `working_dir`.
    pub fn build(&self, working_dir: &Path) -> Result<Collaborators> {
        let make = |role: CollaboratorRole, argv: &[String]| -> Result<CommandCollaborator> {
            Ok(CommandCollaborator::new(role, argv)?.with_working_dir(working_dir))
        };
        Ok(Collaborators::new(
            Arc::new(make(CollaboratorRole::TestWriter, &self.test_writer)?),
            Arc::new(make(CollaboratorRole::Implementer, &self.implementer)?),
            Arc::new(make(CollaboratorRole::Reviewer, &self.reviewer)?),
            Arc::new(make(CollaboratorRole::TestRunner, &self.test_runner)?),
        ))
    }
}

/// Per-feature overrides selected by glob pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturesSection {
    /// Pattern-based overrides (e.g., "auth-*" -> FeatureOverride)
    #[serde(default)]
    pub overrides: BTreeMap<String, FeatureOverride>,
}

/// Effective limits for one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSettings {
    pub max_retries: u32,
    pub call_timeout: Duration,
}

/// Apply every override whose pattern matches `feature_id`, in pattern order.
/// Later matches win for fields they set.
pub fn resolve_feature_settings(
    overrides: &BTreeMap<String, FeatureOverride>,
    feature_id: &str,
    defaults: FeatureSettings,
) -> FeatureSettings {
    let mut settings = defaults;
    for (pattern, override_cfg) in overrides {
        if pattern_matches(pattern, feature_id) {
            if let Some(max_retries) = override_cfg.max_retries {
                settings.max_retries = max_retries;
            }
            if let Some(secs) = override_cfg.call_timeout_secs {
                settings.call_timeout = Duration::from_secs(secs);
            }
        }
    }
    settings
}

/// The complete forge.toml configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub collaborators: CollaboratorsSection,
    #[serde(default)]
    pub features: FeaturesSection,
}

impl ForgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse forge.toml")
    }

    /// Load `forge.toml` from `forge_dir`, or defaults if the file doesn't exist.
    pub fn load_or_default(forge_dir: &Path) -> Result<Self> {
        let config_path = forge_dir.join("forge.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize forge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `FORGE_*` environment variables. Returns warnings for values
    /// that could not be parsed; those are ignored.
    pub fn apply_env_overrides(&mut self) -> Vec<String> {
        self.apply_env_overrides_from(|key| std::env::var(key).ok())
    }

    /// `apply_env_overrides` with an explicit variable lookup.
    pub fn apply_env_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(value) = env_value(&lookup, "FORGE_MAX_RETRIES", &mut warnings) {
            self.engine.max_retries = value;
        }
        if let Some(value) = env_value(&lookup, "FORGE_MAX_PARALLEL", &mut warnings) {
            self.engine.max_parallel = value;
        }
        if let Some(value) = env_value(&lookup, "FORGE_CALL_TIMEOUT_SECS", &mut warnings) {
            self.engine.call_timeout_secs = value;
        }

        warnings
    }

    /// Defaults for features no override matches.
    pub fn default_feature_settings(&self) -> FeatureSettings {
        FeatureSettings {
            max_retries: self.engine.max_retries,
            call_timeout: Duration::from_secs(self.engine.call_timeout_secs),
        }
    }

    /// Get effective settings for a specific feature, applying pattern overrides.
    pub fn feature_settings(&self, feature_id: &str) -> FeatureSettings {
        resolve_feature_settings(
            &self.features.overrides,
            feature_id,
            self.default_feature_settings(),
        )
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_parallel == 0 {
            warnings.push("engine.max_parallel is 0; features will run one at a time".to_string());
        }
        if self.engine.call_timeout_secs == 0 {
            warnings.push("engine.call_timeout_secs is 0; every external call will time out".to_string());
        }
        if self.cache.max_entries == 0 || self.cache.max_bytes == 0 {
            warnings.push("cache capacity is 0; test results will never be cached".to_string());
        }
        if self.store.memory_threshold_bytes == 0 {
            warnings.push(
                "store.memory_threshold_bytes is 0; every stored file will spill to disk".to_string(),
            );
        }
        if self.collaborators.is_configured() {
            for (role, argv) in self.collaborators.commands() {
                if argv.first().is_none_or(|program| program.trim().is_empty()) {
                    warnings.push(format!("collaborators: no command configured for the {}", role));
                }
            }
        }
        for (pattern, override_cfg) in &self.features.overrides {
            if override_cfg.call_timeout_secs == Some(0) {
                warnings.push(format!(
                    "call_timeout_secs is 0 in override for pattern '{}'",
                    pattern
                ));
            }
        }

        warnings
    }

    /// Engine configuration with relative directories resolved against `project_dir`.
    pub fn to_orchestrator_config(&self, project_dir: &Path) -> OrchestratorConfig {
        let resolve = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                project_dir.join(path)
            }
        };

        let mut config = OrchestratorConfig::default()
            .with_max_parallel(self.engine.max_parallel)
            .with_max_retries(self.engine.max_retries)
            .with_call_timeout(Duration::from_secs(self.engine.call_timeout_secs))
            .with_max_hints(self.retry.max_hints)
            .with_cache(CacheConfig {
                max_entries: self.cache.max_entries,
                max_bytes: self.cache.max_bytes,
            })
            .with_store(StoreConfig {
                memory_threshold_bytes: self.store.memory_threshold_bytes,
                spill_dir: resolve(&self.store.spill_dir),
            })
            .with_overrides(self.features.overrides.clone());
        if self.store.persist_snapshot {
            config = config.with_snapshot_dir(resolve(&self.store.snapshot_dir));
        }
        config
    }
}

fn env_value<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    warnings: &mut Vec<String>,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warnings.push(format!("Ignoring invalid {}='{}'", key, raw));
            None
        }
    }
}

/// Resolved paths and settings for one invocation of the CLI.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    /// Path to the project directory
    pub project_dir: PathBuf,
    /// Path to the .forge directory
    pub forge_dir: PathBuf,
    /// Parsed forge.toml with environment overrides applied
    pub toml: ForgeToml,
    /// Warnings from validation and environment parsing
    pub warnings: Vec<String>,
}

impl ForgeConfig {
    /// Load `<project>/.forge/forge.toml`, or `config_path` when given.
    pub fn load(project_dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        let forge_dir = project_dir.join(".forge");

        let mut toml = match config_path {
            Some(path) => ForgeToml::load(path)?,
            None => ForgeToml::load_or_default(&forge_dir)?,
        };
        let mut warnings = toml.apply_env_overrides();
        warnings.extend(toml.validate());

        Ok(Self {
            project_dir,
            forge_dir,
            toml,
            warnings,
        })
    }

    /// Default location of forge.toml.
    pub fn config_file(&self) -> PathBuf {
        self.forge_dir.join("forge.toml")
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        self.toml.to_orchestrator_config(&self.project_dir)
    }
}
