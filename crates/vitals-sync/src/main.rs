use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use vitals_sync::cli::commands;
use vitals_sync::config::Config;

#[derive(Parser)]
#[command(name = "vitals")]
#[command(author, version, about = "Health metric sync client and ingestion backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the YAML configuration file
    #[arg(short, long, global = true, env = "VITALS_CONFIG")]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "VITALS_LOG")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion API and aggregation workers
    Serve,
    /// Drain the aggregation queue once
    Aggregate {
        /// Recompute every aggregate for this user afterwards
        #[arg(long, value_name = "USER_ID")]
        rebuild: Option<String>,
    },
    /// Sync device samples to the backend
    Sync {
        /// Force a full historical backfill
        #[arg(long)]
        initial: bool,
        /// Keep running, syncing periodically and on network restoration
        #[arg(long)]
        watch: bool,
    },
    /// Show local sync status per metric
    Status,
    /// Print the dashboard view as JSON
    Dashboard,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_or_default(cli.config.as_deref()).context("loading configuration")?;
    config.validate().context("validating configuration")?;

    match cli.command {
        Commands::Serve => commands::serve(&config).await.context("serve")?,
        Commands::Aggregate { rebuild } => {
            commands::aggregate(&config, rebuild).await.context("aggregate")?
        }
        Commands::Sync { initial, watch } => commands::sync_run(&config, initial, watch)
            .await
            .context("sync")?,
        Commands::Status => commands::sync_status(&config).await.context("status")?,
        Commands::Dashboard => commands::dashboard(&config).await.context("dashboard")?,
    }

    Ok(())
}
