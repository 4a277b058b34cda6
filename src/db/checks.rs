//! Deferred per-article verification rows.
//!
//! Checks are children of completed jobs (strict parent-child FK; completed
//! rows never reference checks back). The sweeper drains them in ascending
//! `next_retry_at` order, which keeps throughput bounded but fair.

use crate::error::QueueError;
use crate::types::{CheckId, CheckStatus, JobId};
use crate::{Error, Result};

use super::{CheckCounts, CheckRow, NewCheck, Queue};

const CHECK_COLUMNS: &str = "id, job_id, message_id, groups, status, retry_count, \
     next_retry_at, first_failure_at, last_checked_at";

impl Queue {
    /// Insert deferred checks for a completed job in one transaction.
    ///
    /// `first_due_at` is when the sweeper may first attempt them (posting
    /// time plus the configured propagation delay).
    pub async fn add_checks(
        &self,
        job_id: JobId,
        checks: &[NewCheck],
        first_due_at: i64,
    ) -> Result<()> {
        if checks.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to begin check transaction: {}",
                e
            )))
        })?;

        for check in checks {
            let groups = serde_json::to_string(&check.groups)?;
            sqlx::query(
                r#"
                INSERT INTO pending_article_checks (
                    job_id, message_id, groups, status, retry_count, next_retry_at
                ) VALUES (?, ?, ?, ?, 0, ?)
                "#,
            )
            .bind(job_id)
            .bind(&check.message_id)
            .bind(groups)
            .bind(CheckStatus::Pending.to_i32())
            .bind(first_due_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Queue(QueueError::QueryFailed(format!(
                    "Failed to insert check: {}",
                    e
                )))
            })?;
        }

        tx.commit().await.map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to commit checks: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Pending checks due at `now`, in ascending `next_retry_at` order.
    pub async fn due_checks(&self, limit: u32, now: i64) -> Result<Vec<CheckRow>> {
        let rows = sqlx::query_as::<_, CheckRow>(&format!(
            r#"
            SELECT {CHECK_COLUMNS} FROM pending_article_checks
            WHERE status = ? AND next_retry_at <= ?
            ORDER BY next_retry_at ASC
            LIMIT ?
            "#
        ))
        .bind(CheckStatus::Pending.to_i32())
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to query due checks: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Resolve a check as verified.
    pub async fn mark_check_verified(&self, id: CheckId) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "UPDATE pending_article_checks SET status = ?, last_checked_at = ? WHERE id = ?",
        )
        .bind(CheckStatus::Verified.to_i32())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to mark check verified: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Resolve a check as failed (terminal).
    pub async fn mark_check_failed(&self, id: CheckId) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            "UPDATE pending_article_checks SET status = ?, last_checked_at = ? WHERE id = ?",
        )
        .bind(CheckStatus::Failed.to_i32())
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to mark check failed: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Record an unsuccessful verification attempt and reschedule.
    ///
    /// `first_failure_at` is only stamped on the first miss.
    pub async fn update_check_retry(
        &self,
        id: CheckId,
        retry_count: i32,
        next_retry_at: i64,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE pending_article_checks
            SET retry_count = ?, next_retry_at = ?, last_checked_at = ?,
                first_failure_at = COALESCE(first_failure_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to update check retry: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Aggregate check states for a job.
    pub async fn counts_for_job(&self, job_id: JobId) -> Result<CheckCounts> {
        let rows: Vec<(i32, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM pending_article_checks WHERE job_id = ? GROUP BY status",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Queue(QueueError::QueryFailed(format!(
                "Failed to count checks: {}",
                e
            )))
        })?;

        let mut counts = CheckCounts::default();
        for (status, count) in rows {
            let count = count as u64;
            counts.total += count;
            match CheckStatus::from_i32(status) {
                CheckStatus::Pending => counts.pending = count,
                CheckStatus::Failed => counts.failed = count,
                CheckStatus::Verified => {}
            }
        }

        Ok(counts)
    }
}
