use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use spx_setup_engine::replay::{backfill_range, SessionReplayer};
use spx_setup_engine::setup_core::cache::MemoryKvStore;
use spx_setup_engine::setup_core::market_state::HeuristicRegimeClassifier;
use spx_setup_engine::sources::archive::{list_archive_dates, ArchiveDataSource};
use spx_setup_engine::sources::snapshot_dir::SnapshotDir;
use spx_setup_engine::sources::store::FileSetupStore;
use spx_setup_engine::{DetectOptions, SetupEngine};

#[derive(Parser, Debug)]
#[command(name = "pipeline")]
#[command(about = "SPX setup detection, historical replay & backfill")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one forced detection cycle against a snapshot directory
    Detect {
        /// Directory holding levels.json, gex.json, fib.json, regime.json, flow.json, bars.json
        #[arg(short, long, env = "SPX_SNAPSHOT_DIR", default_value = "data/live")]
        snapshot_dir: PathBuf,

        /// Evaluation time (RFC 3339), defaults to now
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Replay one session minute by minute and backtest it
    Replay {
        /// Directory of YYYYMMDD.json.zst session archives
        #[arg(short, long, env = "SPX_ARCHIVE_DIR", default_value = "data/archive")]
        archive_dir: PathBuf,

        /// Output directory for stored setups and backtest rows
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// Session date (YYYYMMDD format)
        #[arg(short = 'D', long)]
        date: String,
    },

    /// Purge and replay every weekday in a date range
    Backfill {
        /// Directory of YYYYMMDD.json.zst session archives
        #[arg(short, long, env = "SPX_ARCHIVE_DIR", default_value = "data/archive")]
        archive_dir: PathBuf,

        /// Output directory for stored setups and backtest rows
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,

        /// First date (YYYYMMDD format)
        #[arg(long)]
        from: String,

        /// Last date, inclusive (YYYYMMDD format)
        #[arg(long)]
        to: String,
    },

    /// List the session archives available for replay
    Archives {
        /// Directory of YYYYMMDD.json.zst session archives
        #[arg(short, long, env = "SPX_ARCHIVE_DIR", default_value = "data/archive")]
        archive_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = if args.verbose { "spx_setup_engine=debug" } else { "spx_setup_engine=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    match args.command {
        Commands::Detect { snapshot_dir, as_of } => {
            run_detect(snapshot_dir, as_of).await?;
        }
        Commands::Replay { archive_dir, output_dir, date } => {
            run_replay(archive_dir, output_dir, parse_date(&date)?).await?;
        }
        Commands::Backfill { archive_dir, output_dir, from, to } => {
            run_backfill(archive_dir, output_dir, parse_date(&from)?, parse_date(&to)?).await?;
        }
        Commands::Archives { archive_dir } => {
            let dates = list_archive_dates(&archive_dir)?;
            info!("Found {} archives in {:?}", dates.len(), archive_dir);
            for date in dates {
                println!("{}", date);
            }
        }
    }

    Ok(())
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .with_context(|| format!("Invalid date {:?}, expected YYYYMMDD", raw))
}

fn replayer(archive_dir: PathBuf, output_dir: PathBuf) -> SessionReplayer {
    SessionReplayer::new(
        Arc::new(ArchiveDataSource::new(archive_dir)),
        Arc::new(HeuristicRegimeClassifier::default()),
        Arc::new(FileSetupStore::new(output_dir)),
    )
}

async fn run_detect(snapshot_dir: PathBuf, as_of: Option<String>) -> Result<()> {
    info!("=== DETECT MODE ===");
    info!("Snapshot directory: {:?}", snapshot_dir);

    let as_of = as_of
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .with_context(|| format!("Invalid --as-of {:?}", raw))
        })
        .transpose()?;

    let engine = SetupEngine::new(
        Some(SnapshotDir::new(snapshot_dir).into_sources()),
        Arc::new(MemoryKvStore::new()),
    );
    let setups = engine
        .detect_active_setups(DetectOptions { as_of, ..DetectOptions::forced() })
        .await?;

    println!("{}", serde_json::to_string_pretty(&setups)?);
    Ok(())
}

async fn run_replay(archive_dir: PathBuf, output_dir: PathBuf, date: NaiveDate) -> Result<()> {
    info!("=== REPLAY MODE ===");
    info!("Archive directory: {:?}", archive_dir);
    info!("Output directory: {:?}", output_dir);

    let result = replayer(archive_dir, output_dir).replay_date(date).await?;

    println!("\n=== REPLAY {} ===", date);
    println!("Setups generated:       {}", result.setups_generated);
    println!("Triggered (backtest):   {}", result.setups_triggered_at_generation);
    if let Some(analytics) = result.backtest {
        println!("Resolved:               {}", analytics.resolved_count);
        println!("T1 win rate:            {:.2}%", analytics.t1_win_rate_pct);
        println!("T2 win rate:            {:.2}%", analytics.t2_win_rate_pct);
        println!("Failure rate:           {:.2}%", analytics.failure_rate_pct);
        println!("Average realized R:     {:.4}", analytics.average_realized_r);
    }
    Ok(())
}

async fn run_backfill(archive_dir: PathBuf, output_dir: PathBuf, from: NaiveDate, to: NaiveDate) -> Result<()> {
    info!("=== BACKFILL MODE ===");
    info!("Range: {} to {}", from, to);

    let summary = backfill_range(&replayer(archive_dir, output_dir), from, to).await?;

    println!("\n=== BACKFILL {} to {} ===", summary.from, summary.to);
    println!("{:<12} {:>10} {:>10}  errors", "date", "setups", "triggered");
    for row in &summary.rows {
        println!(
            "{:<12} {:>10} {:>10}  {}",
            row.date,
            row.setups_generated,
            row.setups_triggered_at_generation,
            row.errors.join("; ")
        );
    }
    println!(
        "\nAttempted {} | succeeded {} | failed {}",
        summary.attempted_days, summary.successful_days, summary.failed_days
    );
    Ok(())
}
