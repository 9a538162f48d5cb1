//! Job ledger surface: typed errors and cooperative cancellation.
//!
//! The SQL lives in [`crate::db::jobs`]. This module adds the
//! [`CancellationToken`] seam the history engine polls at page boundaries, with
//! a ledger-backed implementation for production and an in-memory one that
//! tests can flip directly.

use crate::db::{self, Pool};
use crate::model::JobStatus;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Longest log line stored for a failed job.
pub const MAX_LOG_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sync job {0} not found")]
    UnknownJob(String),
    #[error("sync job {job_id} is {status:?} and cannot be cancelled")]
    NotCancellable { job_id: String, status: JobStatus },
    #[error("sync job {job_id} is still {status:?}")]
    StillActive { job_id: String, status: JobStatus },
    #[error("sync job {job_id} is {status:?}, expected queued")]
    NotQueued { job_id: String, status: JobStatus },
}

#[async_trait]
pub trait CancellationToken: Send + Sync {
    async fn is_cancelled(&self) -> Result<bool>;
}

/// Polls the `cancellation_requested` flag of one ledger entry.
#[derive(Debug, Clone)]
pub struct LedgerCancellation {
    pool: Pool,
    job_id: String,
}

impl LedgerCancellation {
    pub fn new(pool: Pool, job_id: impl Into<String>) -> Self {
        Self {
            pool,
            job_id: job_id.into(),
        }
    }
}

#[async_trait]
impl CancellationToken for LedgerCancellation {
    async fn is_cancelled(&self) -> Result<bool> {
        db::is_cancellation_requested(&self.pool, &self.job_id).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCancellation {
    flag: Arc<AtomicBool>,
}

impl InMemoryCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CancellationToken for InMemoryCancellation {
    async fn is_cancelled(&self) -> Result<bool> {
        Ok(self.flag.load(Ordering::SeqCst))
    }
}

/// Cut a message down to [`MAX_LOG_CHARS`] characters on a char boundary.
pub fn truncate_log(msg: &str) -> String {
    if msg.chars().count() <= MAX_LOG_CHARS {
        return msg.to_string();
    }
    let mut out: String = msg.chars().take(MAX_LOG_CHARS - 1).collect();
    out.push('…');
    out
}
