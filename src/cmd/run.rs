//! Feature orchestration: `forge-tdd run`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use forge_tdd::config::ForgeConfig;
use forge_tdd::feature::FeaturesFile;
use forge_tdd::orchestrator::{CompletionReport, FeatureOrchestrator, FeatureStatus};

/// Command-line overrides for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_parallel: Option<usize>,
    pub max_retries: Option<u32>,
    pub report: Option<PathBuf>,
}

pub async fn cmd_run(forge: &ForgeConfig, features_path: &Path, options: RunOptions) -> Result<()> {
    for warning in &forge.warnings {
        tracing::warn!("{}", warning);
    }

    let collaborators = &forge.toml.collaborators;
    if !collaborators.is_configured() {
        anyhow::bail!(
            "No collaborators configured. Add a [collaborators] section to {} (see 'forge-tdd config init').",
            forge.config_file().display()
        );
    }

    let file = FeaturesFile::load(features_path)?;
    let collaborators = collaborators
        .build(&forge.project_dir)
        .context("Failed to build collaborators")?;

    let mut config = forge.orchestrator_config();
    if let Some(max_parallel) = options.max_parallel {
        config = config.with_max_parallel(max_parallel);
    }
    if let Some(max_retries) = options.max_retries {
        config = config.with_max_retries(max_retries);
    }

    let orchestrator = FeatureOrchestrator::new(config, collaborators);
    let cancel = orchestrator.cancellation_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let result = orchestrator.run(&file.features).await;
    watcher.abort();
    let report = result?;

    print_summary(&report);

    if let Some(path) = &options.report {
        report.save(path)?;
        println!("Report written to {}", path.display());
    }

    if !report.success {
        anyhow::bail!(
            "{} of {} features did not reach GREEN",
            report.metrics.total - report.metrics.green,
            report.metrics.total
        );
    }
    if !report.storage_errors.is_empty() {
        anyhow::bail!(
            "All features finished but the code store reported {} error(s)",
            report.storage_errors.len()
        );
    }
    Ok(())
}

fn print_summary(report: &CompletionReport) {
    println!();
    println!("Run {}", report.run_id);
    for outcome in &report.features {
        let detail = match outcome.status {
            FeatureStatus::Green => format!("{} attempt(s)", outcome.attempts),
            FeatureStatus::Failed => outcome
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            FeatureStatus::Skipped | FeatureStatus::Cancelled => {
                outcome.skip_reason.clone().unwrap_or_default()
            }
        };
        println!(
            "  [batch {}] {:<24} {:<9} {}",
            outcome.batch, outcome.feature_id, outcome.status, detail
        );
    }

    let m = &report.metrics;
    println!();
    println!(
        "{} green, {} failed, {} skipped, {} cancelled in {}ms",
        m.green, m.failed, m.skipped, m.cancelled, m.duration_ms
    );
    println!(
        "Attempts: {} ({} retries, {} review rejections); cache hit rate {:.0}%",
        m.attempts,
        m.retries,
        m.review_rejections,
        m.cache.hit_rate() * 100.0
    );
    if !report.storage_errors.is_empty() {
        println!("Storage errors:");
        for error in &report.storage_errors {
            println!("  - {}", error);
        }
    }
}
