use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pulse_storage::PgDocumentStore;
use pulse_sync::{build_orchestrator, maybe_build_scheduler, BootstrapOptions, SyncConfig};
use pulse_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pulse-cli")]
#[command(about = "Search Pulse ingestion command-line interface")]
struct Cli {
    /// Log line format; falls back to PULSE_LOG_FORMAT.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one site for an inclusive date range and print the result as JSON.
    Ingest {
        #[arg(long)]
        site: String,
        /// First day, YYYY-MM-DD.
        #[arg(long)]
        start: String,
        /// Last day, YYYY-MM-DD.
        #[arg(long)]
        end: String,
        /// Keep rows in memory instead of writing them to the configured store.
        #[arg(long)]
        dry_run: bool,
    },
    /// Serve the HTTP trigger (and the scheduler when enabled).
    Serve {
        #[arg(long, env = "PULSE_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Apply Postgres migrations.
    Migrate,
    /// Run scheduled ingestion until interrupted.
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(format: Option<LogFormat>) {
    let format = format.unwrap_or_else(|| match std::env::var("PULSE_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Text,
    });
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().with_current_span(true).init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    let config = SyncConfig::from_env().context("reading configuration")?;

    match cli.command {
        Commands::Ingest {
            site,
            start,
            end,
            dry_run,
        } => {
            let orchestrator = build_orchestrator(&config, BootstrapOptions { dry_run })
                .await
                .context("building ingestion services")?;
            let result = orchestrator.run(&site, &start, &end).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                bail!("ingestion rejected: site, start and end must be set and dates must be YYYY-MM-DD");
            }
        }
        Commands::Serve { port } => {
            let orchestrator = Arc::new(
                build_orchestrator(&config, BootstrapOptions::default())
                    .await
                    .context("building ingestion services")?,
            );
            let mut scheduler = maybe_build_scheduler(&config, orchestrator.clone()).await?;
            if let Some(sched) = scheduler.as_ref() {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler started");
            }
            pulse_web::serve(AppState::new(orchestrator), port).await?;
            if let Some(sched) = scheduler.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Migrate => {
            let store = PgDocumentStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let orchestrator = Arc::new(
                build_orchestrator(&config, BootstrapOptions::default())
                    .await
                    .context("building ingestion services")?,
            );
            let Some(mut sched) = maybe_build_scheduler(&config, orchestrator).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, sites_file = %config.sites_file.display(), "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
