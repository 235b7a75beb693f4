use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tender_core::SyncRequest;
use tender_store::SourceRegistry;

#[derive(Debug, Parser)]
#[command(name = "tender-cli")]
#[command(about = "Tender sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync invocation.
    Sync {
        /// Sync a single source by name, even if disabled.
        #[arg(long)]
        source: Option<String>,
        /// Select every enabled source regardless of schedule.
        #[arg(long)]
        force_all: bool,
    },
    /// Serve the HTTP trigger API plus the cron scheduler, if enabled.
    Serve,
    /// List the configured sources and their health.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let coordinator = tender_sync::coordinator_from_env().await?;

    match cli.command.unwrap_or(Commands::Sync {
        source: None,
        force_all: false,
    }) {
        Commands::Sync { source, force_all } => {
            let request = SyncRequest {
                triggered_by: Some("cli".to_string()),
                source,
                force_all,
            };
            let report = coordinator.run_sync(request).await?;
            println!(
                "sync complete: sources={} found={} inserted={} updated={}",
                report.sources_processed,
                report.total_opportunities_found,
                report.total_inserted,
                report.total_updated
            );
            for result in &report.results {
                println!(
                    "  {} {:?}: found={} inserted={} updated={} errors={}",
                    result.source,
                    result.status,
                    result.found,
                    result.inserted,
                    result.updated,
                    result.errors.len()
                );
            }
        }
        Commands::Serve => {
            let mut scheduler = tender_sync::maybe_build_scheduler(coordinator.clone()).await?;
            if let Some(scheduler) = scheduler.as_mut() {
                scheduler.start().await.context("starting scheduler")?;
            }
            tender_web::serve_from_env(coordinator).await?;
        }
        Commands::Sources => {
            for source in coordinator.registry().list_all().await? {
                println!(
                    "{}\tkind={:?}\tenabled={}\tinterval_minutes={:?}\tnext_sync_at={:?}\tok={}\terr={}",
                    source.name,
                    source.kind,
                    source.enabled,
                    source.interval_minutes,
                    source.next_sync_at,
                    source.success_count,
                    source.error_count
                );
            }
        }
    }

    Ok(())
}
