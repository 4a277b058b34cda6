//! Deferred article check sweeper.
//!
//! Periodically drains due rows from the pending-checks store (FIFO by
//! `next_retry_at`, so new checks are never starved), stats each article,
//! and either resolves the check or reschedules it with exponential backoff.
//! When a job's last check resolves, its aggregate verification status is
//! rolled up onto the completed row.

use crate::db::CheckRow;
use crate::pool::StatOutcome;
use crate::types::{CheckId, Event, JobId, VerificationStatus};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Processor;
use super::script::backoff_delay;

/// Sweep cadence for due checks
const CHECK_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Due rows fetched per sweep; bounds throughput without starving anyone
const CHECK_SWEEP_BATCH: u32 = 50;

/// Cap on the check retry backoff
const MAX_CHECK_BACKOFF: Duration = Duration::from_secs(3600);

impl Processor {
    /// Spawn the deferred check sweeper.
    pub fn start_check_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let processor = self.clone();

        tokio::spawn(async move {
            if !(processor.config.post_check.enabled && processor.config.post_check.deferred) {
                return;
            }
            info!("Deferred check sweeper started");

            loop {
                tokio::select! {
                    _ = processor.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(CHECK_SWEEP_INTERVAL) => {}
                }

                let now = chrono::Utc::now().timestamp();
                let due = match processor.queue.due_checks(CHECK_SWEEP_BATCH, now).await {
                    Ok(due) => due,
                    Err(e) => {
                        warn!(error = %e, "Failed to query due checks");
                        continue;
                    }
                };

                for check in due {
                    if processor.shutdown.is_cancelled() {
                        break;
                    }
                    processor.process_check(check).await;
                }
            }

            info!("Deferred check sweeper stopped");
        })
    }

    /// Resolve or reschedule one due check.
    pub(super) async fn process_check(&self, check: CheckRow) {
        let check_id = CheckId(check.id);
        let job_id = JobId(check.job_id);
        let groups = check.group_list();

        let outcome = self.pool.stat(&check.message_id, &groups).await;

        match outcome {
            Ok(StatOutcome::Present) => {
                debug!(check_id = check.id, message_id = %check.message_id, "Article verified");
                if let Err(e) = self.queue.mark_check_verified(check_id).await {
                    warn!(check_id = check.id, error = %e, "Failed to mark check verified");
                    return;
                }
                self.emit_event(Event::CheckVerified {
                    id: check_id,
                    job_id,
                });
                self.finalize_verification(job_id).await;
            }
            Ok(StatOutcome::Absent) | Err(_) => {
                if let Err(e) = &outcome {
                    debug!(
                        check_id = check.id,
                        message_id = %check.message_id,
                        error = %e,
                        "Stat errored, treating as missing"
                    );
                }

                let retry_count = check.retry_count + 1;
                let max_attempts = self.config.post_check.max_reposts.max(1);

                if retry_count as u32 >= max_attempts {
                    warn!(
                        check_id = check.id,
                        job_id = check.job_id,
                        message_id = %check.message_id,
                        attempts = retry_count,
                        "Article never became retrievable"
                    );
                    if let Err(e) = self.queue.mark_check_failed(check_id).await {
                        warn!(check_id = check.id, error = %e, "Failed to mark check failed");
                        return;
                    }
                    self.emit_event(Event::CheckFailed {
                        id: check_id,
                        job_id,
                    });
                    self.finalize_verification(job_id).await;
                } else {
                    let delay = backoff_delay(
                        self.config.post_check.delay,
                        retry_count as u32,
                        MAX_CHECK_BACKOFF,
                    );
                    let next_retry_at = chrono::Utc::now().timestamp() + delay.as_secs() as i64;

                    if let Err(e) = self
                        .queue
                        .update_check_retry(check_id, retry_count, next_retry_at)
                        .await
                    {
                        warn!(check_id = check.id, error = %e, "Failed to reschedule check");
                    }
                }
            }
        }
    }

    /// Roll the aggregate verification status up once every check resolved.
    async fn finalize_verification(&self, job_id: JobId) {
        let counts = match self.queue.counts_for_job(job_id).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(job_id = job_id.0, error = %e, "Failed to count checks");
                return;
            }
        };

        if counts.pending > 0 {
            return;
        }

        let status = if counts.failed > 0 {
            VerificationStatus::Failed
        } else {
            VerificationStatus::Verified
        };

        info!(
            job_id = job_id.0,
            total = counts.total,
            failed = counts.failed,
            status = ?status,
            "Deferred verification resolved"
        );

        if let Err(e) = self.queue.set_verification_status(job_id, status).await {
            warn!(job_id = job_id.0, error = %e, "Failed to record verification status");
        }
    }
}
