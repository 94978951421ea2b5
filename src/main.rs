//! Intake reconciliation worker
//!
//! Polls the upload bucket, reconciles objects against the pipeline's
//! database records and feeds the remaining ones to the processing pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::cli::{CommonArgs, CommonCommands, utils};
use common::Database;
use common::config::Configuration;
use common::storage::create_object_store;
use reconciler::{AudioStore, CommandPipeline, CycleOutcome, Poller, PollerExit};

#[derive(Parser, Debug)]
#[command(name = "intake", author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<CommonCommands>,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

async fn build_poller(config: &Configuration) -> Result<(Database, Arc<Poller>)> {
    let object_store =
        create_object_store(&config.storage).context("Failed to create object store")?;
    let database = Database::new(&config.database.dsn)
        .await
        .context("Failed to connect to database")?;
    log::info!(
        "Retry ledger on {} database, scanning '{}'",
        database.backend_name(),
        config.reconciler.scan_prefix
    );

    let pipeline = Arc::new(CommandPipeline::new(&config.pipeline));
    let poller = Arc::new(Poller::new(
        config.reconciler.clone(),
        database.clone(),
        AudioStore::new(object_store),
        pipeline,
    ));
    Ok((database, poller))
}

async fn run_once(poller: &Poller) -> Result<()> {
    match poller.tick().await {
        CycleOutcome::Completed(report) => {
            let json = serde_json::to_string_pretty(&report)
                .context("Failed to serialize cycle report")?;
            println!("{json}");
            Ok(())
        }
        CycleOutcome::Failed { error, .. } => {
            Err(anyhow::Error::new(error).context("Reconciliation cycle failed"))
        }
        CycleOutcome::Skipped | CycleOutcome::Halted => {
            anyhow::bail!("Reconciliation cycle did not run")
        }
    }
}

async fn run_loop(poller: Arc<Poller>) -> Result<()> {
    let mut handle = poller.start();
    log::info!("Intake worker running, waiting for shutdown signal");

    // the loop also ends on its own when the circuit breaker opens
    let exit = tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal?;
            None
        }
        exit = handle.wait() => Some(exit.context("Poller task panicked")?),
    };

    let exit = match exit {
        Some(exit) => exit,
        None => {
            log::info!("Stopping poller after the current cycle");
            handle.stop();
            handle.wait().await.context("Poller task panicked")?
        }
    };

    match exit {
        PollerExit::Stopped => Ok(()),
        PollerExit::CircuitOpen {
            consecutive_failures,
        } => anyhow::bail!(
            "Poller stopped after {consecutive_failures} consecutive database failures"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    utils::init_logging(&args.common);

    let config = utils::load_config(args.common.config.as_ref())?;
    let command = args.command.unwrap_or_default();

    if utils::handle_common_command(&command, &config)? {
        return Ok(());
    }

    utils::validate_config(&config)?;

    log::info!("Starting intake worker ({})", utils::version_info());
    let (database, poller) = build_poller(&config).await?;

    let result = match command {
        CommonCommands::Once => run_once(&poller).await,
        _ => run_loop(poller).await,
    };

    database.close().await;
    result
}
