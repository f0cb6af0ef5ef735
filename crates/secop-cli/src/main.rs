use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use secop_core::{aggregate_daily, filter_window, SourceId, TimeWindow, DAILY_METRIC_COLUMNS};
use secop_sync::{IngestConfig, IngestPipeline};
use secop_web::{AppState, DashboardConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "secop")]
#[command(about = "SECOP procurement monitor: daily ingest and dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every source forward from its watermark and merge into the local stores.
    Ingest,
    /// Serve the dashboard; also runs the ingest scheduler when SECOP_SCHEDULER_ENABLED is set.
    Serve,
    /// Run ingest on SECOP_INGEST_CRON until interrupted.
    Schedule,
    /// Print the daily metric table of one source from the local store.
    Metrics {
        #[arg(long, default_value = "secop1")]
        source: String,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = secop_sync::run_ingest_once_from_env().await?;
            for line in summary.status_lines() {
                println!("{line}");
            }
        }
        Commands::Serve => {
            let pipeline = Arc::new(IngestPipeline::new(IngestConfig::from_env())?);
            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %pipeline.config().ingest_cron, "ingest scheduler started");
            }
            secop_web::serve(AppState::new(".", DashboardConfig::from_env())).await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(IngestPipeline::new(IngestConfig::from_env())?);
            let mut sched = pipeline.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            println!("ingest scheduled with cron '{}'; Ctrl+C to stop", pipeline.config().ingest_cron);
            tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Metrics { source, days } => {
            let source = SourceId::from_slug(&source)
                .with_context(|| format!("unknown source '{source}' (expected secop1 or secop2)"))?;
            let config = IngestConfig::from_env();
            let schema = source.schema();
            let records = config.store_for(source).load()?;
            let window = TimeWindow::last_n_days(Local::now().date_naive(), days);
            let windowed = filter_window(&records, schema.date_field, window);
            let rows = aggregate_daily(&windowed, schema.date_field, schema.value_field, schema.label);

            println!("{}", DAILY_METRIC_COLUMNS.join("\t"));
            for row in &rows {
                println!(
                    "{}\t{}\t{:.2}\t{:.2}\t{}",
                    row.date, row.contracts, row.sum_millions, row.avg_millions, row.source
                );
            }
            if rows.is_empty() {
                eprintln!("no data for {} in the last {days} days", schema.label);
            }
        }
    }

    Ok(())
}
