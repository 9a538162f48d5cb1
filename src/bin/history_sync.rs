use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use order_watchbot::config;
use order_watchbot::db;
use order_watchbot::model::JobStatus;
use order_watchbot::remote::WooSourceFactory;
use order_watchbot::sync::HistorySync;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Backfill the full order history of one store in the foreground"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Store to backfill
    #[arg(long)]
    store_id: i64,

    /// Run an existing queued job instead of creating a new one
    #[arg(long)]
    job_id: Option<String>,

    /// Seconds between progress lines
    #[arg(long, default_value = "2")]
    progress_every: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let Some(store) = db::get_store(&pool, args.store_id).await? else {
        bail!("store {} does not exist", args.store_id);
    };
    let job_id = match args.job_id {
        Some(id) => id,
        None => {
            let name = format!("History sync: {}", store.name);
            db::create_job(&pool, store.id, None, &name).await?
        }
    };
    info!(job_id = %job_id, store = %store.name, "running history sync");

    let timeout = Duration::from_secs(cfg.remote.timeout_seconds);
    let engine = HistorySync::new(pool.clone(), Arc::new(WooSourceFactory::new(timeout)))
        .with_page_size(cfg.remote.history_page_size);

    let progress = {
        let pool = pool.clone();
        let job_id = job_id.clone();
        let every = Duration::from_secs(args.progress_every.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match db::get_job(&pool, &job_id).await {
                    Ok(Some(job)) => {
                        let total = job.total.map(|t| t.to_string()).unwrap_or_else(|| "?".into());
                        println!(
                            "[{}] {}/{} {}",
                            job.status.as_str(),
                            job.progress,
                            total,
                            job.log.unwrap_or_default()
                        );
                    }
                    Ok(None) => break,
                    Err(err) => warn!(?err, "failed to read job progress"),
                }
            }
        })
    };

    let report = engine.run(store.id, &job_id).await;
    progress.abort();
    let report = report?;

    let job = db::get_job(&pool, &job_id).await?;
    let log = job.and_then(|j| j.log).unwrap_or_default();
    println!(
        "Job {} finished: {} ({} scanned, {} new) {}",
        job_id,
        report.status.as_str(),
        report.scanned,
        report.inserted,
        log
    );
    if report.status == JobStatus::Failed {
        bail!("history sync failed");
    }
    Ok(())
}
