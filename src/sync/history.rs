//! Cancellable full-history backfill of one store.
//!
//! Runs as a Job Ledger entry: `queued -> running -> complete | failed | cancelled`.
//! The store's `syncing` flag is held for the whole run so the incremental
//! engine stays away, and released on every exit path.

use crate::db::{self, Pool};
use crate::ledger::{truncate_log, CancellationToken, LedgerCancellation, LedgerError};
use crate::model::{JobStatus, Store};
use crate::normalize::normalize;
use crate::remote::{OrderQuery, OrderSource, SortKey, SourceFactory};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// A backfill gives up after this many page fetches in a row have failed.
pub const MAX_CONSECUTIVE_PAGE_FAILURES: u32 = 3;

const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryReport {
    pub status: JobStatus,
    pub scanned: i64,
    pub inserted: i64,
}

impl HistoryReport {
    fn new(status: JobStatus) -> Self {
        Self {
            status,
            scanned: 0,
            inserted: 0,
        }
    }
}

pub struct HistorySync {
    pool: Pool,
    sources: Arc<dyn SourceFactory>,
    page_size: u32,
}

impl HistorySync {
    pub fn new(pool: Pool, sources: Arc<dyn SourceFactory>) -> Self {
        Self {
            pool,
            sources,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Run a queued job, polling the ledger for cancellation.
    pub async fn run(&self, store_id: i64, job_id: &str) -> Result<HistoryReport> {
        let token = LedgerCancellation::new(self.pool.clone(), job_id);
        self.run_with_token(store_id, job_id, &token).await
    }

    #[instrument(skip_all, fields(store_id = store_id, job_id = job_id))]
    pub async fn run_with_token(
        &self,
        store_id: i64,
        job_id: &str,
        token: &dyn CancellationToken,
    ) -> Result<HistoryReport> {
        let job = db::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownJob(job_id.to_string()))?;
        match job.status {
            JobStatus::Queued => {}
            JobStatus::Cancelled => {
                info!("job was cancelled before it started");
                return Ok(HistoryReport::new(JobStatus::Cancelled));
            }
            status => {
                return Err(LedgerError::NotQueued {
                    job_id: job_id.to_string(),
                    status,
                }
                .into())
            }
        }

        if !db::transition_job(&self.pool, job_id, JobStatus::Running, None).await? {
            let status = current_status(&self.pool, job_id).await?;
            info!(status = status.as_str(), "job left queued before it could start");
            return Ok(HistoryReport::new(status));
        }

        match self.execute(store_id, job_id, token).await {
            Ok(report) => Ok(report),
            Err(err) => {
                error!(?err, "history sync failed");
                self.fail(job_id, &format!("Error: {:#}", err)).await
            }
        }
    }

    async fn execute(
        &self,
        store_id: i64,
        job_id: &str,
        token: &dyn CancellationToken,
    ) -> Result<HistoryReport> {
        let store = db::get_store(&self.pool, store_id)
            .await?
            .ok_or_else(|| anyhow!("store {} not found", store_id))?;
        if !db::try_begin_syncing(&self.pool, store.id).await? {
            return Err(anyhow!("store {} is already syncing", store.id));
        }

        let result = self.run_locked(&store, job_id, token).await;

        if let Err(err) = db::end_syncing(&self.pool, store.id).await {
            error!(?err, "failed to release syncing flag");
        }
        result
    }

    async fn run_locked(
        &self,
        store: &Store,
        job_id: &str,
        token: &dyn CancellationToken,
    ) -> Result<HistoryReport> {
        info!(store = %store.name, "history sync started");

        let source = self.sources.orders(store)?;
        let total = source.total_orders().await?;
        db::set_job_total(&self.pool, job_id, total.map(|t| t as i64)).await?;

        let mut report = HistoryReport::new(JobStatus::Running);
        self.backfill(store, job_id, source.as_ref(), token, &mut report)
            .await?;
        if report.status != JobStatus::Running {
            return Ok(report);
        }

        if token.is_cancelled().await? {
            return self.cancel(job_id, report).await;
        }

        let summary = format!(
            "Sync complete: {} orders scanned, {} new",
            report.scanned, report.inserted
        );
        db::set_job_total(&self.pool, job_id, Some(report.scanned)).await?;
        if db::transition_job(&self.pool, job_id, JobStatus::Complete, Some(&summary)).await? {
            info!(scanned = report.scanned, inserted = report.inserted, "history sync complete");
            report.status = JobStatus::Complete;
            return Ok(report);
        }
        // Cancellation landed between the last check and the transition.
        match current_status(&self.pool, job_id).await? {
            JobStatus::Cancelling => self.cancel(job_id, report).await,
            status => Err(anyhow!("job ended in {} while completing", status.as_str())),
        }
    }

    async fn backfill(
        &self,
        store: &Store,
        job_id: &str,
        source: &dyn OrderSource,
        token: &dyn CancellationToken,
        report: &mut HistoryReport,
    ) -> Result<()> {
        let mut page: u32 = 1;
        let mut consecutive_failures = 0;

        loop {
            if token.is_cancelled().await? {
                *report = self.cancel(job_id, report.clone()).await?;
                return Ok(());
            }

            let note = format!("Fetching page {}", page);
            db::set_job_progress(&self.pool, job_id, report.scanned, Some(&note)).await?;
            let query = OrderQuery {
                page,
                per_page: self.page_size,
                modified_after: None,
                sort: SortKey::Date,
            };
            let orders = match source.fetch_page(&query).await {
                Ok(orders) => {
                    consecutive_failures = 0;
                    orders
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(page, ?err, "history page fetch failed");
                    let note = truncate_log(&format!("Page {} failed: {:#}", page, err));
                    db::set_job_log(&self.pool, job_id, &note).await?;
                    if consecutive_failures >= MAX_CONSECUTIVE_PAGE_FAILURES {
                        return Err(err.context(format!(
                            "{} consecutive page fetches failed",
                            consecutive_failures
                        )));
                    }
                    page += 1;
                    continue;
                }
            };
            if orders.is_empty() {
                return Ok(());
            }
            // A flag raised while the page was in flight discards the page.
            if token.is_cancelled().await? {
                *report = self.cancel(job_id, report.clone()).await?;
                return Ok(());
            }

            let count = orders.len();
            let mut tx = self.pool.begin().await?;
            for raw in &orders {
                report.scanned += 1;
                match normalize(raw) {
                    Ok(normalized) => {
                        if db::insert_order_if_absent_tx(&mut tx, store.id, &normalized).await? {
                            report.inserted += 1;
                        }
                    }
                    Err(err) => {
                        warn!(order_id = %raw["id"], ?err, "skipping unreadable order");
                    }
                }
            }
            tx.commit().await?;
            db::set_job_progress(&self.pool, job_id, report.scanned, None).await?;

            if count < self.page_size as usize {
                return Ok(());
            }
            page += 1;
        }
    }

    async fn cancel(&self, job_id: &str, mut report: HistoryReport) -> Result<HistoryReport> {
        let note = format!("Cancelled after {} orders", report.scanned);
        db::set_job_progress(&self.pool, job_id, report.scanned, None).await?;
        db::transition_job(&self.pool, job_id, JobStatus::Cancelled, Some(&note)).await?;
        info!(scanned = report.scanned, "history sync cancelled");
        report.status = current_status(&self.pool, job_id).await?;
        Ok(report)
    }

    async fn fail(&self, job_id: &str, message: &str) -> Result<HistoryReport> {
        let log = truncate_log(message);
        db::transition_job(&self.pool, job_id, JobStatus::Failed, Some(&log)).await?;
        let mut report = HistoryReport::new(current_status(&self.pool, job_id).await?);
        if let Some(job) = db::get_job(&self.pool, job_id).await? {
            report.scanned = job.progress;
        }
        Ok(report)
    }
}

async fn current_status(pool: &Pool, job_id: &str) -> Result<JobStatus> {
    db::get_job(pool, job_id)
        .await?
        .map(|j| j.status)
        .ok_or_else(|| LedgerError::UnknownJob(job_id.to_string()).into())
}
