use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "forge-tdd")]
#[command(version, about = "Drive features through RED → YELLOW → GREEN with retries, caching and parallel batches")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to forge.toml (defaults to <project>/.forge/forge.toml)
    #[arg(long, global = true, env = "FORGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the dependency batches for a feature file
    Plan {
        /// Feature file (JSON or YAML)
        #[arg(short, long)]
        features: PathBuf,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a feature file for malformed features, unknown dependencies and cycles
    Validate {
        #[arg(short, long)]
        features: PathBuf,
    },
    /// Run every feature through the phase cycle
    Run {
        #[arg(short, long)]
        features: PathBuf,
        /// Maximum concurrent features (overrides forge.toml)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Retries after the first attempt (overrides forge.toml)
        #[arg(long)]
        max_retries: Option<u32>,
        /// Write the completion report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default forge.toml file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Config { command } => {
            forge_tdd::logging::init(Default::default(), cli.verbose);
            cmd::cmd_config(&project_dir, cli.config.as_deref(), command.clone())?;
        }
        Commands::Plan { features, json } => {
            forge_tdd::logging::init(Default::default(), cli.verbose);
            cmd::cmd_plan(features, *json)?;
        }
        Commands::Validate { features } => {
            forge_tdd::logging::init(Default::default(), cli.verbose);
            cmd::cmd_validate(features)?;
        }
        Commands::Run {
            features,
            max_parallel,
            max_retries,
            report,
        } => {
            let forge = forge_tdd::config::ForgeConfig::load(&project_dir, cli.config.as_deref())?;
            forge_tdd::logging::init(forge.toml.logging.format, cli.verbose);
            let options = cmd::RunOptions {
                max_parallel: *max_parallel,
                max_retries: *max_retries,
                report: report.clone(),
            };
            cmd::cmd_run(&forge, features, options).await?;
        }
    }

    Ok(())
}
