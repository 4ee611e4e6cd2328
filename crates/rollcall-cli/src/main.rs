use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_adapters::{HttpSiteSession, SiteSession};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rollcall")]
#[command(about = "Track online profiles into a spreadsheet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass and exit.
    Sync,
    /// Run sync passes on the configured cron schedule until Ctrl-C.
    Watch,
    /// List the identifiers the next run would process.
    Discover,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rollcall=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let report = rollcall_sync::run_sync_once_from_env().await?;
            let summary = &report.summary;
            println!(
                "sync complete: run={} run_id={} profiles={} processed={} success={} failed={} new={} updated={} unchanged={}",
                summary.run_no,
                report.run_id,
                summary.targeted,
                summary.seen,
                summary.succeeded,
                summary.failed,
                summary.new,
                summary.updated,
                summary.unchanged
            );
            if let Some(err) = report.error {
                return Err(anyhow::Error::new(err).context("sync run did not complete"));
            }
        }
        Commands::Watch => {
            let pipeline = Arc::new(rollcall_sync::pipeline_from_env()?);
            let site = pipeline.config().site_config();
            let scheduler = pipeline
                .clone()
                .maybe_build_scheduler(move || -> Box<dyn SiteSession> {
                    Box::new(HttpSiteSession::new(site.clone()))
                })
                .await?;
            let Some(mut scheduler) = scheduler else {
                bail!("scheduler disabled; set ROLLCALL_SCHEDULER_ENABLED=true to use watch");
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "watching for online profiles");

            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down scheduler");
            scheduler.shutdown().await.context("stopping scheduler")?;
            pipeline.wait_idle().await;
        }
        Commands::Discover => {
            let targets = rollcall_sync::discover_online_from_env().await?;
            for nickname in &targets {
                println!("{nickname}");
            }
            eprintln!("{} online", targets.len());
        }
    }

    Ok(())
}
