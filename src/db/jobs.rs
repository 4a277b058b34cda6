//! Job state machine operations.
//!
//! All state transitions are single transactional statements; the four-state
//! invariant (a job ID lives in exactly one state) is enforced by the guarded
//! `WHERE state = ?` clauses, which turn races into `NotInProgress`/`NotFound`
//! errors instead of double transitions.

use crate::error::QueueError;
use crate::types::{JobId, JobState, ScriptStatus, VerificationStatus};
use crate::{Error, Result};
use std::path::{Path, PathBuf};

use super::{JobRow, NewJob, Queue};
use crate::types::QueueStats;

/// Shared column list so every query returns a full [`JobRow`]
const JOB_COLUMNS: &str = "id, path, size_bytes, priority, retry_count, state, payload, \
     created_at, updated_at, completed_at, errored_at, nzb_path, error_message, \
     script_status, script_retry_count, script_last_error, script_next_retry_at, \
     script_first_failure_at, verification_status";

/// Sort field for queue listings
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobSortField {
    /// Enqueue time (default)
    #[default]
    Created,
    /// Priority
    Priority,
    /// State code
    Status,
    /// Source path
    Filename,
    /// Size in bytes
    Size,
}

impl JobSortField {
    fn column(self) -> &'static str {
        match self {
            JobSortField::Created => "created_at",
            JobSortField::Priority => "priority",
            JobSortField::Status => "state",
            JobSortField::Filename => "path",
            JobSortField::Size => "size_bytes",
        }
    }
}

/// Filter and pagination for [`Queue::list`]
#[derive(Clone, Copy, Debug)]
pub struct ListFilter {
    /// Restrict to one state, or `None` for all four (merged deterministically)
    pub state: Option<JobState>,
    /// Sort field
    pub sort: JobSortField,
    /// Ascending sort order
    pub ascending: bool,
    /// Page size
    pub limit: u32,
    /// Page offset in rows
    pub offset: u32,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            state: None,
            sort: JobSortField::default(),
            ascending: true,
            limit: 100,
            offset: 0,
        }
    }
}

impl Queue {
    /// Insert a new job into the pending state.
    ///
    /// Fails with [`QueueError::DuplicatePath`] when `allow_duplicate` is
    /// false and the path is present in any state.
    pub async fn enqueue(&self, job: &NewJob, allow_duplicate: bool) -> Result<JobId> {
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to begin enqueue transaction: {}",
                e
            )))
        })?;

        if !allow_duplicate {
            let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE path = ?")
                .bind(&job.path)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    Error::Queue(QueueError::QueryFailed(format!(
                        "Failed to check for duplicate path: {}",
                        e
                    )))
                })?;

            if existing > 0 {
                return Err(Error::Queue(QueueError::DuplicatePath(PathBuf::from(
                    &job.path,
                ))));
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                path, size_bytes, priority, retry_count, state, payload,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.path)
        .bind(job.size_bytes)
        .bind(job.priority)
        .bind(job.retry_count)
        .bind(JobState::Pending.to_i32())
        .bind(&job.payload)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to insert job: {}",
                e
            )))
        })?;

        tx.commit().await.map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to commit enqueue: {}",
                e
            )))
        })?;

        Ok(JobId(result.last_insert_rowid()))
    }

    /// Atomically claim the highest-priority pending job.
    ///
    /// The job moves to in-progress and is returned; concurrent claimers each
    /// receive distinct jobs (SQLite serializes the writing statement).
    /// Returns `None` when nothing is pending.
    pub async fn claim(&self) -> Result<Option<JobRow>> {
        let now = chrono::Utc::now().timestamp();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs SET state = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs WHERE state = ?
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(JobState::InProgress.to_i32())
        .bind(now)
        .bind(JobState::Pending.to_i32())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to claim job: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Settle an in-progress job as completed, recording its NZB path.
    pub async fn complete(&self, id: JobId, nzb_path: &Path) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, updated_at = ?, completed_at = ?, nzb_path = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(JobState::Completed.to_i32())
        .bind(now)
        .bind(now)
        .bind(nzb_path.to_string_lossy().into_owned())
        .bind(id)
        .bind(JobState::InProgress.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to complete job: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(self.missing_in_progress(id).await);
        }

        Ok(())
    }

    /// Settle an in-progress job as errored, preserving its payload.
    pub async fn fail(&self, id: JobId, error_message: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, updated_at = ?, errored_at = ?, error_message = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(JobState::Errored.to_i32())
        .bind(now)
        .bind(now)
        .bind(error_message)
        .bind(id)
        .bind(JobState::InProgress.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!("Failed to fail job: {}", e)))
        })?;

        if result.rows_affected() == 0 {
            return Err(self.missing_in_progress(id).await);
        }

        Ok(())
    }

    /// Move an in-progress job back to pending with its retry counter bumped.
    ///
    /// Used by the processor when a post failed but the job is retry-eligible.
    pub async fn requeue(&self, id: JobId) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, updated_at = ?, retry_count = retry_count + 1
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(JobState::Pending.to_i32())
        .bind(now)
        .bind(id)
        .bind(JobState::InProgress.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to requeue job: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(self.missing_in_progress(id).await);
        }

        Ok(())
    }

    /// Crash recovery: move every in-progress job back to pending.
    ///
    /// Priority and `created_at` are untouched, so recovered jobs keep their
    /// original claim order. Idempotent; returns the number of reaped rows.
    pub async fn recover(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query("UPDATE jobs SET state = ?, updated_at = ? WHERE state = ?")
            .bind(JobState::Pending.to_i32())
            .bind(now)
            .bind(JobState::InProgress.to_i32())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Queue(QueueError::QueryFailed(format!(
                    "Failed to recover in-progress jobs: {}",
                    e
                )))
            })?;

        let reaped = result.rows_affected();
        if reaped > 0 {
            tracing::info!(count = reaped, "Recovered interrupted jobs back to pending");
        }

        Ok(reaped)
    }

    /// Re-activate an errored job, preserving `retry_count` and `created_at`.
    ///
    /// This is the operator-triggered retry path; it clears the recorded
    /// error so the job is indistinguishable from a fresh pending row apart
    /// from its history.
    pub async fn retry_errored(&self, id: JobId) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?, updated_at = ?, errored_at = NULL, error_message = NULL
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(JobState::Pending.to_i32())
        .bind(now)
        .bind(id)
        .bind(JobState::Errored.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to retry job: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(Error::Queue(QueueError::NotFound(format!(
                "errored job {} not found",
                id
            ))));
        }

        Ok(())
    }

    /// Get a job by ID regardless of state.
    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!("Failed to get job: {}", e)))
        })?;

        Ok(row)
    }

    /// Paginated listing with a state filter and sort order.
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<JobRow>> {
        let direction = if filter.ascending { "ASC" } else { "DESC" };
        let order = format!(
            "{} {direction}, id {direction}",
            filter.sort.column()
        );

        let rows = if let Some(state) = filter.state {
            sqlx::query_as::<_, JobRow>(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ? ORDER BY {order} LIMIT ? OFFSET ?"
            ))
            .bind(state.to_i32())
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, JobRow>(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs ORDER BY {order} LIMIT ? OFFSET ?"
            ))
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to list jobs: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Change the priority of a pending job.
    ///
    /// Jobs in any other state refuse the update.
    pub async fn set_priority(&self, id: JobId, priority: i32) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            "UPDATE jobs SET priority = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(priority)
        .bind(now)
        .bind(id)
        .bind(JobState::Pending.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to set priority: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(Error::Queue(QueueError::NotFound(format!(
                "pending job {} not found",
                id
            ))));
        }

        Ok(())
    }

    /// Delete a job from whichever state holds it.
    ///
    /// For completed jobs the NZB file is deleted alongside; a missing file
    /// is not an error.
    pub async fn remove(&self, id: JobId) -> Result<()> {
        let job = self
            .get_job(id)
            .await?
            .ok_or_else(|| Error::Queue(QueueError::NotFound(format!("job {} not found", id))))?;

        if job.job_state() == JobState::Completed
            && let Some(nzb_path) = &job.nzb_path
            && let Err(e) = tokio::fs::remove_file(nzb_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(job_id = id.0, path = %nzb_path, error = %e, "Failed to delete NZB file");
        }

        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Queue(QueueError::QueryFailed(format!(
                    "Failed to delete job: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Count jobs per state.
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(i32, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    Error::Queue(QueueError::QueryFailed(format!(
                        "Failed to query stats: {}",
                        e
                    )))
                })?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let count = count as u64;
            match JobState::from_i32(state) {
                JobState::Pending => stats.pending = count,
                JobState::InProgress => stats.in_progress = count,
                JobState::Completed => stats.completed = count,
                JobState::Errored => stats.errored = count,
            }
            stats.total += count;
        }

        Ok(stats)
    }

    /// Empty the pending, completed, and errored states (and their NZB files).
    ///
    /// In-progress rows are left for [`Queue::recover`] to reap so that a
    /// clear issued mid-run cannot orphan a worker's job.
    pub async fn clear(&self) -> Result<()> {
        let nzb_paths: Vec<(String,)> = sqlx::query_as(
            "SELECT nzb_path FROM jobs WHERE state = ? AND nzb_path IS NOT NULL",
        )
        .bind(JobState::Completed.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to collect NZB paths: {}",
                e
            )))
        })?;

        for (path,) in nzb_paths {
            if let Err(e) = tokio::fs::remove_file(&path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path, error = %e, "Failed to delete NZB file during clear");
            }
        }

        sqlx::query("DELETE FROM jobs WHERE state IN (?, ?, ?)")
            .bind(JobState::Pending.to_i32())
            .bind(JobState::Completed.to_i32())
            .bind(JobState::Errored.to_i32())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Queue(QueueError::QueryFailed(format!(
                    "Failed to clear queue: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Delete completed rows older than `max_age_secs` along with their NZB files.
    ///
    /// Returns the number of expired rows.
    pub async fn expire_completed(&self, max_age_secs: i64) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - max_age_secs;

        let expired: Vec<(i64, Option<String>)> = sqlx::query_as(
            "SELECT id, nzb_path FROM jobs WHERE state = ? AND completed_at < ?",
        )
        .bind(JobState::Completed.to_i32())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to query expired jobs: {}",
                e
            )))
        })?;

        for (id, nzb_path) in &expired {
            if let Some(path) = nzb_path
                && let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(job_id = id, path = %path, error = %e, "Failed to delete expired NZB");
            }
        }

        let result = sqlx::query("DELETE FROM jobs WHERE state = ? AND completed_at < ?")
            .bind(JobState::Completed.to_i32())
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Queue(QueueError::QueryFailed(format!(
                    "Failed to expire completed jobs: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }

    /// Record a failed script attempt and schedule the next retry.
    ///
    /// `first_failure_at` is only stamped on the first failure.
    pub async fn mark_script_retry(
        &self,
        id: JobId,
        retry_count: i32,
        error: &str,
        next_retry_at: i64,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE jobs
            SET script_status = ?, script_retry_count = ?, script_last_error = ?,
                script_next_retry_at = ?,
                script_first_failure_at = COALESCE(script_first_failure_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(ScriptStatus::PendingRetry.to_i32())
        .bind(retry_count)
        .bind(error)
        .bind(next_retry_at)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to record script retry: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Record a successful script run, clearing all failure fields.
    pub async fn mark_script_completed(&self, id: JobId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET script_status = ?, script_last_error = NULL,
                script_next_retry_at = NULL, script_first_failure_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(ScriptStatus::Completed.to_i32())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to record script completion: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Mark the script permanently failed after its retry budget is spent.
    pub async fn mark_script_failed_permanent(&self, id: JobId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET script_status = ?, script_last_error = ?, script_next_retry_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(ScriptStatus::FailedPermanent.to_i32())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to record permanent script failure: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Completed jobs whose script retry is due, oldest schedule first.
    pub async fn due_script_retries(&self, now: i64, limit: u32) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE state = ? AND script_status = ? AND script_next_retry_at <= ?
            ORDER BY script_next_retry_at ASC
            LIMIT ?
            "#
        ))
        .bind(JobState::Completed.to_i32())
        .bind(ScriptStatus::PendingRetry.to_i32())
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to query due script retries: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Update the aggregate verification status of a completed job.
    pub async fn set_verification_status(
        &self,
        id: JobId,
        status: VerificationStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE jobs SET verification_status = ? WHERE id = ?")
            .bind(status.to_i32())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Queue(QueueError::QueryFailed(format!(
                    "Failed to set verification status: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Distinguish "no such job" from "job exists in the wrong state".
    async fn missing_in_progress(&self, id: JobId) -> Error {
        match self.get_job(id).await {
            Ok(Some(_)) => Error::Queue(QueueError::NotInProgress(id.0)),
            Ok(None) => Error::Queue(QueueError::NotFound(format!("job {} not found", id))),
            Err(e) => e,
        }
    }
}
