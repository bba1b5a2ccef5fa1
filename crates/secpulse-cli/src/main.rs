use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secpulse_core::parse_days_spec;
use secpulse_storage::{PgStore, RunLogQuery};
use secpulse_sync::{SyncConfig, SyncRuntime};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "secpulse")]
#[command(about = "Security telemetry collection and aggregation")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect from every configured source, or just one.
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Run the HTTP API (and the scheduler, if enabled).
    Serve,
    /// Print the last known status of every source.
    Status,
    /// Print a page of the run log, newest first.
    Logs {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        per_page: usize,
    },
    /// Print the security summary for a trailing window such as `7d`.
    Summary {
        #[arg(long, default_value = "7d")]
        window: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source: None } => {
            let outcomes = secpulse_sync::run_sync_once_from_env().await?;
            print_json(&outcomes)?;
        }
        Commands::Sync {
            source: Some(source),
        } => {
            let runtime = SyncRuntime::from_env().await?;
            let outcome = runtime
                .orchestrator
                .collect_one(&source)
                .await
                .with_context(|| format!("collecting from {source}"))?;
            print_json(&outcome)?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgStore::connect(&url).await.context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => secpulse_web::serve_from_env().await?,
        Commands::Status => {
            let runtime = SyncRuntime::from_env().await?;
            let statuses = runtime
                .orchestrator
                .source_statuses()
                .await
                .context("reading source statuses")?;
            print_json(&statuses)?;
        }
        Commands::Logs {
            source,
            page,
            per_page,
        } => {
            let runtime = SyncRuntime::from_env().await?;
            let query = RunLogQuery {
                source,
                page: Some(page),
                per_page: Some(per_page),
            };
            let logs = runtime
                .store
                .run_logs(&query)
                .await
                .context("reading run log")?;
            print_json(&logs)?;
        }
        Commands::Summary { window } => {
            let days =
                parse_days_spec(&window).with_context(|| format!("invalid window {window:?}"))?;
            let runtime = SyncRuntime::from_env().await?;
            let served = runtime.summaries.summary(days).await?;
            print_json(&served)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
