//! Feature-file inspection: `forge-tdd plan` and `forge-tdd validate`.

use anyhow::{Context, Result};
use std::path::Path;

use forge_tdd::dag::DependencyResolver;
use forge_tdd::feature::FeaturesFile;

fn resolve(features_path: &Path) -> Result<(FeaturesFile, DependencyResolver)> {
    let file = FeaturesFile::load(features_path)?;
    let resolver = DependencyResolver::new(&file.features)
        .with_context(|| format!("Invalid feature file: {}", features_path.display()))?;
    Ok((file, resolver))
}

pub fn cmd_plan(features_path: &Path, json: bool) -> Result<()> {
    let (file, resolver) = resolve(features_path)?;
    let plan = resolver.plan();

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!();
    if let Some(project) = &file.project {
        println!("Project: {}", project);
    }
    println!(
        "Execution plan: {} features in {} batches",
        plan.feature_count(),
        plan.len()
    );
    for batch in &plan.batches {
        println!("  Batch {}: {}", batch.index, batch.feature_ids.join(", "));
    }
    println!();
    Ok(())
}

pub fn cmd_validate(features_path: &Path) -> Result<()> {
    let (_, resolver) = resolve(features_path)?;
    println!(
        "Feature file is valid: {} features in {} batches",
        resolver.features().len(),
        resolver.batches().len()
    );
    Ok(())
}
