//! Configuration view and validation commands: `forge-tdd config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    config_override: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    use forge_tdd::config::ForgeToml;

    let config_path = match config_override {
        Some(path) => path.to_path_buf(),
        None => project_dir.join(".forge").join("forge.toml"),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            let mut config = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ForgeToml::load(&config_path)?
            } else {
                println!("No forge.toml found at {}; using defaults.", config_path.display());
                ForgeToml::default()
            };
            let env_warnings = config.apply_env_overrides();
            println!();
            println!("Effective configuration (with environment overrides):");
            println!();
            print!("{}", toml::to_string_pretty(&config)?);
            for warning in env_warnings {
                println!("warning: {}", warning);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No forge.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = ForgeToml::load(&config_path)?.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("forge.toml already exists at {}", config_path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }

            ForgeToml::default().save(&config_path)?;

            println!("Created forge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [engine] max_retries, max_parallel, call_timeout_secs");
            println!("  - [collaborators] commands for test_writer, implementer, reviewer, test_runner");
            println!("  - [features.overrides.\"pattern-*\"] for feature-specific settings");
        }
    }

    Ok(())
}
