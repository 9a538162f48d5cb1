use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use order_watchbot::config;
use order_watchbot::db;
use order_watchbot::notify::{Dispatcher, TelegramSender};
use order_watchbot::remote::WooSourceFactory;
use order_watchbot::scheduler::Scheduler;
use order_watchbot::settings;
use order_watchbot::sync::{HistorySync, IncrementalSync};

#[derive(Debug, Parser)]
#[command(author, version, about = "Poll storefronts for orders and notify over Telegram")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = Arc::new(config::load(Some(&args.config))?);
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    settings::seed_defaults(&pool, &cfg).await?;

    // Anything a previous process left mid-flight can never finish.
    let failed = db::fail_interrupted_jobs(&pool).await?;
    let cleared = db::reset_syncing_flags(&pool).await?;
    if failed > 0 || cleared > 0 {
        warn!(failed_jobs = failed, cleared_flags = cleared, "recovered from unclean shutdown");
    }

    let timeout = Duration::from_secs(cfg.remote.timeout_seconds);
    let sources = Arc::new(WooSourceFactory::new(timeout));
    let sender = Arc::new(TelegramSender::new(timeout)?);
    let notifier = Arc::new(Dispatcher::new(pool.clone(), cfg.clone(), sender));

    let incremental = Arc::new(IncrementalSync::new(
        pool.clone(),
        sources.clone(),
        notifier,
        cfg.remote.page_size,
        cfg.remote.initial_lookback_days,
    ));
    let history = Arc::new(
        HistorySync::new(pool.clone(), sources).with_page_size(cfg.remote.history_page_size),
    );
    let scheduler = Scheduler::new(pool.clone(), cfg.clone(), incremental, history);

    info!("starting order watcher");
    let refresh = Duration::from_secs(cfg.app.registry_refresh_seconds);
    let reconciler = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh);
            loop {
                ticker.tick().await;
                if let Err(err) = scheduler.reconcile().await {
                    error!(?err, "registry reconcile failed");
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    reconciler.abort();
    scheduler.shutdown().await;
    pool.close().await;
    Ok(())
}
