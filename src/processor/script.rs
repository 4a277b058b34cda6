//! Post-upload hook execution and its persistent retry schedule.
//!
//! The hook is a configured command line with `$NZB_PATH` and `$FILE_PATH`
//! interpolated, run under a timeout. Failures are recorded on the completed
//! row with an exponential schedule (`base_delay * 2^(retries-1)`, capped);
//! the sweeper re-runs due hooks until they succeed or the retry budget is
//! spent.

use crate::error::ScriptError;
use crate::types::{Event, JobId, ScriptStatus};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Processor;

/// Sweep cadence for due script retries
const SCRIPT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Due rows fetched per sweep
const SCRIPT_SWEEP_BATCH: u32 = 20;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
pub(super) fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << shift).min(max)
}

/// Run a command line through the platform shell with a timeout.
async fn execute_command(command: &str, timeout: Duration) -> Result<(), ScriptError> {
    #[cfg(unix)]
    let mut cmd = {
        let mut c = tokio::process::Command::new("sh");
        c.arg("-c").arg(command);
        c
    };

    #[cfg(windows)]
    let mut cmd = {
        let mut c = tokio::process::Command::new("cmd");
        c.arg("/C").arg(command);
        c
    };

    cmd.kill_on_drop(true);

    let result = tokio::time::timeout(timeout, cmd.output()).await;

    match result {
        Ok(Ok(output)) => {
            if output.status.success() {
                Ok(())
            } else {
                Err(ScriptError::NonZeroExit {
                    code: output.status.code().unwrap_or(-1),
                })
            }
        }
        Ok(Err(e)) => Err(ScriptError::Spawn(e.to_string())),
        Err(_) => Err(ScriptError::Timeout {
            timeout_secs: timeout.as_secs(),
        }),
    }
}

impl Processor {
    /// Run one hook attempt for a completed job and persist the outcome.
    ///
    /// `prior_failures` is the script retry counter before this attempt (0
    /// for the initial post-completion run).
    pub(super) async fn run_script_attempt(
        &self,
        id: JobId,
        nzb_path: &Path,
        source_path: &Path,
        prior_failures: i32,
    ) {
        let cfg = &self.config.post_upload_script;
        let command = cfg
            .command
            .replace("$NZB_PATH", &nzb_path.to_string_lossy())
            .replace("$FILE_PATH", &source_path.to_string_lossy());

        debug!(job_id = id.0, command = %command, "Running post-upload script");

        match execute_command(&command, cfg.timeout).await {
            Ok(()) => {
                info!(job_id = id.0, "Post-upload script completed");
                if let Err(e) = self.queue.mark_script_completed(id).await {
                    warn!(job_id = id.0, error = %e, "Failed to record script completion");
                }
                self.emit_event(Event::ScriptCompleted { id });
            }
            Err(err) => {
                let exit_code = match &err {
                    ScriptError::NonZeroExit { code } => Some(*code),
                    _ => None,
                };
                let retry_count = prior_failures + 1;

                if retry_count as u32 > cfg.max_retries {
                    warn!(
                        job_id = id.0,
                        error = %err,
                        attempts = retry_count,
                        "Post-upload script failed permanently"
                    );
                    if let Err(e) = self
                        .queue
                        .mark_script_failed_permanent(id, &err.to_string())
                        .await
                    {
                        warn!(job_id = id.0, error = %e, "Failed to record permanent script failure");
                    }
                    self.emit_event(Event::ScriptFailed {
                        id,
                        exit_code,
                        permanent: true,
                    });
                    return;
                }

                let delay = backoff_delay(cfg.base_delay, retry_count as u32, cfg.max_delay);
                let next_retry_at = chrono::Utc::now().timestamp() + delay.as_secs() as i64;

                warn!(
                    job_id = id.0,
                    error = %err,
                    retry_count = retry_count,
                    next_in_secs = delay.as_secs(),
                    "Post-upload script failed, scheduling retry"
                );
                if let Err(e) = self
                    .queue
                    .mark_script_retry(id, retry_count, &err.to_string(), next_retry_at)
                    .await
                {
                    warn!(job_id = id.0, error = %e, "Failed to record script retry");
                }
                self.emit_event(Event::ScriptFailed {
                    id,
                    exit_code,
                    permanent: false,
                });
            }
        }
    }

    /// Spawn the sweeper that re-runs due script retries.
    pub fn start_script_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let processor = self.clone();

        tokio::spawn(async move {
            if !processor.config.post_upload_script.enabled {
                return;
            }
            info!("Script retry sweeper started");

            loop {
                tokio::select! {
                    _ = processor.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(SCRIPT_SWEEP_INTERVAL) => {}
                }

                let now = chrono::Utc::now().timestamp();
                let due = match processor
                    .queue
                    .due_script_retries(now, SCRIPT_SWEEP_BATCH)
                    .await
                {
                    Ok(due) => due,
                    Err(e) => {
                        warn!(error = %e, "Failed to query due script retries");
                        continue;
                    }
                };

                for job in due {
                    if processor.shutdown.is_cancelled() {
                        break;
                    }
                    debug_assert_eq!(job.script_status(), ScriptStatus::PendingRetry);

                    let Some(nzb_path) = job.nzb_path.clone() else {
                        warn!(job_id = job.id, "Due script retry without an NZB path");
                        continue;
                    };
                    processor
                        .run_script_attempt(
                            job.job_id(),
                            Path::new(&nzb_path),
                            &job.source_path(),
                            job.script_retry_count,
                        )
                        .await;
                }
            }

            info!("Script retry sweeper stopped");
        })
    }
}
