use super::repo::Pool;
use crate::ledger::LedgerError;
use crate::model::{JobStatus, SyncJob};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

const JOB_COLUMNS: &str = "job_id, store_id, user_id, name, status, progress, total, log, \
     cancellation_requested, start_time, end_time";

fn job_from_row(row: &SqliteRow) -> Result<SyncJob> {
    let job_id: String = row.get("job_id");
    let status_str: String = row.get("status");
    let status = JobStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("job {} has unknown status {}", job_id, status_str))?;
    Ok(SyncJob {
        job_id,
        store_id: row.get("store_id"),
        user_id: row.try_get::<Option<i64>, _>("user_id").ok().flatten(),
        name: row.get("name"),
        status,
        progress: row.get("progress"),
        total: row.try_get::<Option<i64>, _>("total").ok().flatten(),
        log: row.try_get::<Option<String>, _>("log").ok().flatten(),
        cancellation_requested: row.get::<bool, _>("cancellation_requested"),
        start_time: row
            .try_get::<Option<DateTime<Utc>>, _>("start_time")
            .ok()
            .flatten(),
        end_time: row
            .try_get::<Option<DateTime<Utc>>, _>("end_time")
            .ok()
            .flatten(),
    })
}

/// Record a new full-history job in `queued` and return its id.
#[instrument(skip_all)]
pub async fn create_job(
    pool: &Pool,
    store_id: i64,
    user_id: Option<i64>,
    name: &str,
) -> Result<String> {
    let job_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO sync_jobs (job_id, store_id, user_id, name, status) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&job_id)
    .bind(store_id)
    .bind(user_id)
    .bind(name)
    .bind(JobStatus::Queued.as_str())
    .execute(pool)
    .await?;
    Ok(job_id)
}

#[instrument(skip_all)]
pub async fn get_job(pool: &Pool, job_id: &str) -> Result<Option<SyncJob>> {
    let row = sqlx::query(&format!("SELECT {} FROM sync_jobs WHERE job_id = ?", JOB_COLUMNS))
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

pub async fn list_jobs(pool: &Pool) -> Result<Vec<SyncJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM sync_jobs ORDER BY id DESC",
        JOB_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_queued_jobs(pool: &Pool) -> Result<Vec<SyncJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM sync_jobs WHERE status = 'queued' ORDER BY id ASC",
        JOB_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

/// Move a job to `next` if its current status allows it. Stamps `start_time`
/// on entering `running` and `end_time` on entering a terminal status.
/// Returns false when the guard rejected the change.
#[instrument(skip_all, fields(job_id = job_id, next = next.as_str()))]
pub async fn transition_job(
    pool: &Pool,
    job_id: &str,
    next: JobStatus,
    log: Option<&str>,
) -> Result<bool> {
    let sources = JobStatus::sources_of(next);
    if sources.is_empty() {
        return Ok(false);
    }
    let placeholders = vec!["?"; sources.len()].join(", ");
    let now = Utc::now();
    let start = (next == JobStatus::Running).then_some(now);
    let end = next.is_terminal().then_some(now);

    let sql = format!(
        "UPDATE sync_jobs SET status = ?, log = COALESCE(?, log), \
         start_time = COALESCE(?, start_time), end_time = COALESCE(?, end_time) \
         WHERE job_id = ? AND status IN ({})",
        placeholders
    );
    let mut query = sqlx::query(&sql)
        .bind(next.as_str())
        .bind(log)
        .bind(start)
        .bind(end)
        .bind(job_id);
    for s in &sources {
        query = query.bind(s.as_str());
    }
    let res = query.execute(pool).await?;
    Ok(res.rows_affected() == 1)
}

pub async fn set_job_progress(
    pool: &Pool,
    job_id: &str,
    progress: i64,
    log: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET progress = ?, log = COALESCE(?, log) WHERE job_id = ?")
        .bind(progress)
        .bind(log)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_job_total(pool: &Pool, job_id: &str, total: Option<i64>) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET total = ? WHERE job_id = ?")
        .bind(total)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_job_log(pool: &Pool, job_id: &str, log: &str) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET log = ? WHERE job_id = ?")
        .bind(log)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn is_cancellation_requested(pool: &Pool, job_id: &str) -> Result<bool> {
    let flag: Option<bool> =
        sqlx::query_scalar("SELECT cancellation_requested FROM sync_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(pool)
            .await?;
    flag.ok_or_else(|| LedgerError::UnknownJob(job_id.to_string()).into())
}

/// Operator cancellation. A queued job is cancelled outright; a running job
/// moves to `cancelling` and the worker finishes the move at the next page
/// boundary. Returns the status after the request.
#[instrument(skip_all, fields(job_id = job_id))]
pub async fn request_cancellation(pool: &Pool, job_id: &str) -> Result<JobStatus> {
    loop {
        let current = get_job(pool, job_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownJob(job_id.to_string()))?
            .status;
        let next = match current {
            JobStatus::Queued => JobStatus::Cancelled,
            JobStatus::Running => JobStatus::Cancelling,
            JobStatus::Cancelling => return Ok(JobStatus::Cancelling),
            terminal => {
                return Err(LedgerError::NotCancellable {
                    job_id: job_id.to_string(),
                    status: terminal,
                }
                .into())
            }
        };
        if mark_cancelled_from(pool, job_id, current, next).await? {
            return Ok(next);
        }
        // The job moved on between the read and the write; decide again.
    }
}

/// Raise the cancellation flag and move `from -> next`, only while the job is
/// still in `from`. Returns false when the status guard rejected the write.
async fn mark_cancelled_from(
    pool: &Pool,
    job_id: &str,
    from: JobStatus,
    next: JobStatus,
) -> Result<bool> {
    let end = next.is_terminal().then(Utc::now);
    let res = sqlx::query(
        "UPDATE sync_jobs SET cancellation_requested = 1, status = ?, \
         end_time = COALESCE(?, end_time) WHERE job_id = ? AND status = ?",
    )
    .bind(next.as_str())
    .bind(end)
    .bind(job_id)
    .bind(from.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Delete a job that has finished (or is stuck in `cancelling`).
#[instrument(skip_all, fields(job_id = job_id))]
pub async fn delete_job(pool: &Pool, job_id: &str) -> Result<()> {
    let job = get_job(pool, job_id)
        .await?
        .ok_or_else(|| LedgerError::UnknownJob(job_id.to_string()))?;
    if !(job.status.is_terminal() || job.status == JobStatus::Cancelling) {
        return Err(LedgerError::StillActive {
            job_id: job_id.to_string(),
            status: job.status,
        }
        .into());
    }
    sqlx::query("DELETE FROM sync_jobs WHERE job_id = ?")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn delete_finished_jobs(pool: &Pool) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM sync_jobs WHERE status IN ('complete', 'failed', 'cancelled')",
    )
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Start-up recovery: jobs a previous process left mid-flight can never
/// finish, so they are closed as failed.
#[instrument(skip_all)]
pub async fn fail_interrupted_jobs(pool: &Pool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE sync_jobs SET status = 'failed', log = 'Interrupted by process restart', \
         end_time = ? WHERE status IN ('running', 'cancelling')",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}
