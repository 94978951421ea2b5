use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared by intake binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Subcommands of the worker binary
#[derive(Subcommand, Debug, Clone, Default, PartialEq, Eq)]
pub enum CommonCommands {
    /// Run the poll loop until stopped (default behavior)
    #[default]
    Start,
    /// Run exactly one reconciliation cycle and exit
    Once,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use crate::storage::UploadLocation;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Initialize logging based on CLI arguments.
    ///
    /// `--quiet` and `--verbose` win over `RUST_LOG`; without either flag
    /// `RUST_LOG` is honoured and defaults to `info`.
    pub fn init_logging(args: &CommonArgs) {
        let filter = if args.quiet {
            EnvFilter::new("warn")
        } else if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        };

        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            let reconciler = &config.reconciler;
            println!("Intake Configuration:");
            println!("=====================");
            println!("Database DSN: {}", config.database.dsn);
            match UploadLocation::parse(&config.storage.dsn) {
                Ok(location) => println!("Upload store: {location}"),
                Err(e) => println!("Upload store: invalid ({e:#})"),
            }
            println!("Scan prefix: {}", reconciler.scan_prefix);
            println!(
                "Supported extensions: {}",
                reconciler.supported_extensions.join(", ")
            );
            println!("Concurrency: {}", reconciler.concurrency);
            println!("Poll interval: {:?}", reconciler.poll_interval);
            println!("Retry limit: {}", reconciler.retry_limit);
            println!("Failure threshold: {}", reconciler.failure_threshold);
            println!("Prune stale attempts: {}", reconciler.prune_stale_attempts);
            println!(
                "Pipeline: {} {}",
                config.pipeline.command,
                config.pipeline.args.join(" ")
            );
            println!("Pipeline timeout: {:?}", config.pipeline.timeout);
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        if config.database.dsn.is_empty() {
            anyhow::bail!("Database DSN cannot be empty");
        }

        UploadLocation::parse(&config.storage.dsn).context("Invalid storage configuration")?;

        if config.pipeline.command.trim().is_empty() {
            anyhow::bail!("Pipeline command cannot be empty");
        }

        if config.pipeline.timeout.is_zero() {
            anyhow::bail!("Pipeline timeout must be positive");
        }

        config
            .reconciler
            .validate()
            .context("Invalid reconciler configuration")?;

        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle commands that don't require starting the worker.
    ///
    /// Returns `true` when the command was fully handled.
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start | CommonCommands::Once => Ok(false),
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
