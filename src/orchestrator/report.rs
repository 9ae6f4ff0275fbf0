//! Run-level reporting: the completion report and live progress snapshots.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::outcome::{FeatureOutcome, FeatureStatus};
use crate::cache::CacheStats;
use crate::phase::Phase;
use crate::store::{CodeSnapshot, StoreStats};

/// Aggregated counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total: usize,
    pub green: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub attempts: u32,
    pub retries: u32,
    pub review_rejections: u32,
    pub red_ms: u64,
    pub yellow_ms: u64,
    pub duration_ms: u64,
    pub cache: CacheStats,
    pub store: StoreStats,
}

impl RunMetrics {
    pub fn from_outcomes(outcomes: &[FeatureOutcome]) -> Self {
        let mut metrics = Self {
            total: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            match outcome.status {
                FeatureStatus::Green => metrics.green += 1,
                FeatureStatus::Failed => metrics.failed += 1,
                FeatureStatus::Skipped => metrics.skipped += 1,
                FeatureStatus::Cancelled => metrics.cancelled += 1,
            }
            metrics.attempts += outcome.attempts;
            metrics.retries += outcome.retries();
            metrics.review_rejections += outcome.review_rejections;
            metrics.red_ms += outcome.durations.red.as_millis() as u64;
            metrics.yellow_ms += outcome.durations.yellow.as_millis() as u64;
        }
        metrics
    }
}

/// Final result of an orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// True only if every feature reached GREEN
    pub success: bool,
    pub batches: Vec<Vec<String>>,
    /// Per-feature outcomes in execution order
    pub features: Vec<FeatureOutcome>,
    pub metrics: RunMetrics,
    /// Snapshot, persist or cleanup failures after the features finished
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_errors: Vec<String>,
    /// Accumulated code at the end of the run
    #[serde(skip)]
    pub snapshot: CodeSnapshot,
}

impl CompletionReport {
    pub fn outcome(&self, feature_id: &str) -> Option<&FeatureOutcome> {
        self.features.iter().find(|o| o.feature_id == feature_id)
    }

    pub fn with_status(&self, status: FeatureStatus) -> impl Iterator<Item = &FeatureOutcome> {
        self.features.iter().filter(move |o| o.status == status)
    }

    /// Write the report as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read report: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse report: {}", path.display()))
    }
}

/// Point-in-time view of a run in progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub green: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub in_flight: usize,
    pub current_batch: Option<usize>,
    /// Current phase of every started feature
    pub phases: HashMap<String, Phase>,
}

impl ProgressSnapshot {
    /// Share of features with a terminal status, 0-100.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 * 100.0 / self.total as f64
    }

    pub(crate) fn record(&mut self, status: FeatureStatus) {
        self.completed += 1;
        match status {
            FeatureStatus::Green => self.green += 1,
            FeatureStatus::Failed => self.failed += 1,
            FeatureStatus::Skipped => self.skipped += 1,
            FeatureStatus::Cancelled => self.cancelled += 1,
        }
    }
}
