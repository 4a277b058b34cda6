//! Processor — claims jobs and drives them through their lifecycle.
//!
//! The processor is the single funnel that turns job outcomes into
//! persistent state: it claims from the queue under a concurrency semaphore,
//! runs PAR2 generation and the poster, settles the row
//! (complete/fail/requeue), and owns the global pause, auto-pause, and
//! shutdown machinery. All mutable coordination state (pause flags, the
//! running-jobs map, the ad-hoc upload slot) lives on the processor with
//! explicit accessors.
//!
//! ## Submodules
//!
//! - [`script`] — post-upload hook execution and its persistent retry sweeper
//! - [`check_sweeper`] — deferred article verification sweeper

mod check_sweeper;
mod script;

use crate::config::Config;
use crate::db::{NewCheck, NewJob, Queue};
use crate::error::{Error, Result};
use crate::nzb::NzbWriter;
use crate::par2::Par2Runner;
use crate::pool::{ConnectionPool, PoolMetricsSnapshot};
use crate::poster::{PostOutcome, Poster};
use crate::throttle::Throttle;
use crate::types::{
    Event, JobId, ProgressKind, ProgressSnapshot, QueueStats, RunningJobInfo, VerificationStatus,
};
use crate::utils::get_available_space;
use crate::watcher::DirectoryWatcher;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Poll interval when the queue is empty
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Poll interval while paused or auto-paused
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long shutdown waits for in-flight jobs to yield
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A job currently being driven by a worker
pub(crate) struct RunningJob {
    pub(crate) path: PathBuf,
    pub(crate) cancel: CancellationToken,
    pub(crate) progress: Arc<std::sync::Mutex<ProgressSnapshot>>,
    pub(crate) started: Instant,
}

/// Top-level orchestrator (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Processor {
    /// Persistent queue, shared with the watcher and sweepers
    pub(crate) queue: Arc<Queue>,
    pub(crate) config: Arc<Config>,
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    throttle: Throttle,
    poster: Arc<Poster>,
    nzb_writer: Arc<NzbWriter>,
    par2_runner: Option<Arc<Par2Runner>>,
    /// Concurrency slots, sized to `queue.max_concurrent_uploads`
    slots: Arc<Semaphore>,
    paused: Arc<AtomicBool>,
    auto_pause_reason: Arc<std::sync::Mutex<Option<String>>>,
    running: Arc<tokio::sync::Mutex<HashMap<JobId, RunningJob>>>,
    /// Cancellation handle for an ad-hoc (non-queue) upload
    ad_hoc_upload: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    accepting: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Processor {
    /// Create a processor: validates the configuration, opens the queue,
    /// recovers interrupted jobs, and prepares the output directories.
    pub async fn new(config: Config, pool: Arc<dyn ConnectionPool>) -> Result<Self> {
        config.validate()?;

        if config.par2.enabled && !config.posting.wait_for_par2 {
            // Interleaving PAR2 output with posting is unsupported; recovery
            // files are always staged fully before the upload starts.
            warn!("posting.wait_for_par2=false is not supported; PAR2 runs before posting");
        }

        tokio::fs::create_dir_all(&config.output_dir).await?;
        if config.par2.enabled {
            tokio::fs::create_dir_all(&config.par2.temp_dir).await?;
        }

        let queue = Arc::new(Queue::new(&config.queue.database_path).await?);

        // Anything left in progress by a crash goes back to pending
        queue.recover().await?;

        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);
        let throttle = Throttle::new(config.posting.throttle_rate);

        let par2_runner = if config.par2.enabled {
            Some(Arc::new(Par2Runner::new(config.par2.clone())?))
        } else {
            None
        };

        let config = Arc::new(config);
        let poster = Arc::new(Poster::new(
            Arc::clone(&config),
            Arc::clone(&pool),
            throttle.clone(),
            event_tx.clone(),
        ));
        let nzb_writer = Arc::new(NzbWriter::new(
            config.output_dir.clone(),
            config.nzb_compression.clone(),
        ));
        let slots = Arc::new(Semaphore::new(config.queue.max_concurrent_uploads));

        Ok(Self {
            queue,
            config,
            pool,
            event_tx,
            throttle,
            poster,
            nzb_writer,
            par2_runner,
            slots,
            paused: Arc::new(AtomicBool::new(false)),
            auto_pause_reason: Arc::new(std::sync::Mutex::new(None)),
            running: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            ad_hoc_upload: Arc::new(std::sync::Mutex::new(None)),
            accepting: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribe to engine events.
    ///
    /// Multiple subscribers are supported; each receives all events
    /// independently. Slow subscribers that fall behind by more than the
    /// channel buffer receive a `Lagged` error.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Spawn the main claim loop.
    ///
    /// The loop waits until the processor is neither paused nor auto-paused,
    /// takes a concurrency slot, claims the highest-priority pending job,
    /// and spawns a worker for it. It exits on shutdown.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let processor = self.clone();

        tokio::spawn(async move {
            loop {
                if processor.shutdown.is_cancelled()
                    || !processor.accepting.load(Ordering::SeqCst)
                {
                    break;
                }

                processor.refresh_auto_pause();
                if processor.paused.load(Ordering::SeqCst) || processor.is_auto_paused() {
                    tokio::select! {
                        _ = processor.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(PAUSE_POLL_INTERVAL) => continue,
                    }
                }

                // Take a slot before claiming so the claim is never wasted
                let permit = tokio::select! {
                    _ = processor.shutdown.cancelled() => break,
                    permit = Arc::clone(&processor.slots).acquire_owned() => {
                        match permit {
                            Ok(p) => p,
                            Err(_) => break, // semaphore closed
                        }
                    }
                };

                match processor.queue.claim().await {
                    Ok(Some(job)) => {
                        let worker = processor.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            worker.run_job(job).await;
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        tokio::select! {
                            _ = processor.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        error!(error = %e, "Failed to claim job");
                        tokio::select! {
                            _ = processor.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(CLAIM_POLL_INTERVAL) => {}
                        }
                    }
                }
            }

            info!("Processor claim loop stopped");
        })
    }

    /// Spawn the claim loop plus every background service (script sweeper,
    /// deferred check sweeper, retention cleanup, and the watcher when
    /// enabled).
    pub fn start_all(self: &Arc<Self>) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut handles = vec![
            self.start(),
            self.start_script_sweeper(),
            self.start_check_sweeper(),
        ];

        if self.config.queue.completed_retention_days > 0 {
            handles.push(self.start_retention_task());
        }

        if self.config.watcher.enabled {
            let watcher = Arc::new(DirectoryWatcher::new(
                Arc::clone(self),
                self.config.watcher.clone(),
            )?);
            let cancel = self.shutdown.clone();
            handles.push(tokio::spawn(watcher.run(cancel)));
        }

        Ok(handles)
    }

    /// Drive one claimed job to a settled state.
    async fn run_job(&self, job: crate::db::JobRow) {
        let id = job.job_id();
        let path = job.source_path();
        let cancel = self.shutdown.child_token();

        let progress = Arc::new(std::sync::Mutex::new(ProgressSnapshot {
            kind: ProgressKind::Par2Generation,
            current: 0,
            total: 0,
            current_percent: 0.0,
            elapsed: Duration::ZERO,
            estimated_remaining: None,
            rate_bps: 0,
            is_paused: false,
        }));

        {
            let mut running = self.running.lock().await;
            running.insert(
                id,
                RunningJob {
                    path: path.clone(),
                    cancel: cancel.clone(),
                    progress: Arc::clone(&progress),
                    started: Instant::now(),
                },
            );
        }

        self.emit_event(Event::JobStarted { id });
        info!(job_id = id.0, path = %path.display(), "Job started");

        // Keep the observer-visible snapshot current from the event stream
        let updater = self.spawn_progress_updater(id, Arc::clone(&progress));

        let result = self.execute_job(&job, &cancel, &progress).await;

        updater.abort();

        match result {
            Ok((nzb_path, outcome)) => {
                self.settle_success(&job, nzb_path, outcome).await;
            }
            Err(Error::Cancelled) if self.shutdown.is_cancelled() => {
                // Shutdown: leave the row in progress for Recover() at the
                // next startup
                info!(job_id = id.0, "Job interrupted by shutdown, left for recovery");
            }
            Err(Error::Cancelled) => {
                info!(job_id = id.0, "Job cancelled by operator");
                if let Err(e) = self.queue.fail(id, "cancelled").await {
                    warn!(job_id = id.0, error = %e, "Failed to settle cancelled job");
                }
                self.emit_event(Event::JobFailed {
                    id,
                    error: "cancelled".to_string(),
                });
            }
            Err(e) => {
                self.settle_failure(&job, e).await;
            }
        }

        self.running.lock().await.remove(&id);
        self.cleanup_par2_temp(id).await;
    }

    /// PAR2 → post → NZB for one job.
    async fn execute_job(
        &self,
        job: &crate::db::JobRow,
        cancel: &CancellationToken,
        progress: &Arc<std::sync::Mutex<ProgressSnapshot>>,
    ) -> Result<(PathBuf, PostOutcome)> {
        let id = job.job_id();
        let path = job.source_path();

        // PAR2 generation strictly precedes posting (see Processor::new)
        let mut files = vec![path.clone()];
        if let Some(runner) = &self.par2_runner {
            self.set_stage(progress, ProgressKind::Par2Generation);
            let temp_dir = self.par2_temp_dir(id);
            let event_tx = self.event_tx.clone();

            let par2_files = runner
                .create(cancel, &path, &temp_dir, move |percent| {
                    event_tx.send(Event::Par2Progress { id, percent }).ok();
                })
                .await?;
            files.extend(par2_files);
        }

        self.set_stage(progress, ProgressKind::Uploading);
        let outcome = self.poster.post_files(id, cancel, &files).await?;

        let nzb_path = self
            .nzb_writer
            .write(&self.nzb_relative_name(&path), &outcome.files)
            .await?;

        Ok((nzb_path, outcome))
    }

    /// Record a completed job: queue row, deferred checks, hook, original
    /// file deletion.
    async fn settle_success(&self, job: &crate::db::JobRow, nzb_path: PathBuf, outcome: PostOutcome) {
        let id = job.job_id();

        if let Err(e) = self.queue.complete(id, &nzb_path).await {
            error!(job_id = id.0, error = %e, "Failed to record completion");
            return;
        }

        info!(
            job_id = id.0,
            nzb = %nzb_path.display(),
            articles = outcome.total_articles,
            "Job completed"
        );
        self.emit_event(Event::JobCompleted {
            id,
            nzb_path: nzb_path.clone(),
        });

        // Deferred verification path: persist one check per article
        if self.config.post_check.enabled && self.config.post_check.deferred {
            let checks: Vec<NewCheck> = outcome
                .all_segments()
                .map(|s| NewCheck {
                    message_id: s.message_id.clone(),
                    groups: s.groups.clone(),
                })
                .collect();
            let first_due =
                chrono::Utc::now().timestamp() + self.config.post_check.delay.as_secs() as i64;

            if let Err(e) = self.queue.add_checks(id, &checks, first_due).await {
                error!(job_id = id.0, error = %e, "Failed to persist deferred checks");
            } else if let Err(e) = self
                .queue
                .set_verification_status(id, VerificationStatus::Pending)
                .await
            {
                warn!(job_id = id.0, error = %e, "Failed to mark verification pending");
            }
        }

        if self.config.post_upload_script.enabled {
            let processor = self.clone();
            let script_nzb = nzb_path.clone();
            let script_source = job.source_path();
            tokio::spawn(async move {
                processor
                    .run_script_attempt(id, &script_nzb, &script_source, 0)
                    .await;
            });
        }

        // Watch-folder mode may delete the source once it is safely posted
        if self.config.watcher.enabled && self.config.watcher.delete_original_file {
            let source = job.source_path();
            if let Err(e) = tokio::fs::remove_file(&source).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(job_id = id.0, path = %source.display(), error = %e, "Failed to delete original file");
            }
        }
    }

    /// Route a failed job to errored or back to pending.
    async fn settle_failure(&self, job: &crate::db::JobRow, err: Error) {
        let id = job.job_id();
        let message = err.to_string();

        let retryable =
            !err.is_permanent_for_job() && (job.retry_count as u32) < self.config.posting.max_retries;

        if retryable {
            warn!(
                job_id = id.0,
                error = %message,
                retry_count = job.retry_count + 1,
                "Job failed, re-queueing"
            );

            // Hold the job back for the configured delay before it becomes
            // claimable again; shutdown cuts the wait short.
            let delay = self.config.posting.retry_delay;
            if !delay.is_zero() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if let Err(e) = self.queue.requeue(id).await {
                error!(job_id = id.0, error = %e, "Failed to requeue job");
            }
            return;
        }

        error!(job_id = id.0, error = %message, "Job failed permanently");
        if let Err(e) = self.queue.fail(id, &message).await {
            error!(job_id = id.0, error = %e, "Failed to record job failure");
        }
        self.emit_event(Event::JobFailed { id, error: message });
    }

    /// Keep a running job's snapshot in sync with its progress events.
    fn spawn_progress_updater(
        &self,
        id: JobId,
        progress: Arc<std::sync::Mutex<ProgressSnapshot>>,
    ) -> tokio::task::JoinHandle<()> {
        let mut events = self.event_tx.subscribe();
        let started = Instant::now();

        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let mut snapshot = progress.lock().unwrap_or_else(|p| p.into_inner());
                match event {
                    Event::Par2Progress { id: event_id, percent } if event_id == id => {
                        snapshot.kind = ProgressKind::Par2Generation;
                        snapshot.current = percent as u64;
                        snapshot.total = 100;
                        snapshot.current_percent = percent;
                        snapshot.elapsed = started.elapsed();
                    }
                    Event::UploadProgress {
                        id: event_id,
                        posted,
                        total,
                        rate_bps,
                    } if event_id == id => {
                        snapshot.kind = ProgressKind::Uploading;
                        snapshot.current = posted;
                        snapshot.total = total;
                        snapshot.current_percent = if total > 0 {
                            (posted as f32 / total as f32) * 100.0
                        } else {
                            0.0
                        };
                        snapshot.elapsed = started.elapsed();
                        snapshot.rate_bps = rate_bps;
                        snapshot.estimated_remaining = if posted > 0 && total > posted {
                            let per_article = started.elapsed() / posted as u32;
                            Some(per_article * (total - posted) as u32)
                        } else {
                            None
                        };
                    }
                    Event::CheckProgress {
                        id: event_id,
                        checked,
                        total,
                    } if event_id == id => {
                        snapshot.kind = ProgressKind::Checking;
                        snapshot.current = checked;
                        snapshot.total = total;
                        snapshot.current_percent = if total > 0 {
                            (checked as f32 / total as f32) * 100.0
                        } else {
                            0.0
                        };
                        snapshot.elapsed = started.elapsed();
                    }
                    _ => {}
                }
            }
        })
    }

    fn set_stage(&self, progress: &Arc<std::sync::Mutex<ProgressSnapshot>>, kind: ProgressKind) {
        let mut snapshot = progress.lock().unwrap_or_else(|p| p.into_inner());
        snapshot.kind = kind;
        snapshot.current = 0;
        snapshot.current_percent = 0.0;
    }

    /// Enqueue a file for posting at default priority.
    pub async fn enqueue(&self, path: &Path) -> Result<JobId> {
        let size = tokio::fs::metadata(path).await?.len();
        self.enqueue_with(path, size, 0, false).await
    }

    /// Enqueue with explicit size, priority, and duplicate policy.
    pub(crate) async fn enqueue_with(
        &self,
        path: &Path,
        size: u64,
        priority: i32,
        allow_duplicate: bool,
    ) -> Result<JobId> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let payload = serde_json::to_string(&serde_json::json!({
            "path": path,
            "size": size,
            "priority": priority,
        }))?;

        let id = self
            .queue
            .enqueue(
                &NewJob {
                    path: path.to_string_lossy().into_owned(),
                    size_bytes: size as i64,
                    priority,
                    retry_count: 0,
                    payload,
                },
                allow_duplicate,
            )
            .await?;

        self.emit_event(Event::JobQueued {
            id,
            path: path.to_path_buf(),
        });

        Ok(id)
    }

    /// Run one file through the pipeline immediately, outside the queue.
    ///
    /// The upload is tracked so [`cancel_upload`](Self::cancel_upload) can
    /// stop it; only one ad-hoc upload runs at a time.
    pub async fn upload_file(&self, path: &Path) -> Result<PathBuf> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let cancel = self.shutdown.child_token();
        {
            let mut slot = self
                .ad_hoc_upload
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return Err(Error::Other("an ad-hoc upload is already active".to_string()));
            }
            *slot = Some(cancel.clone());
        }

        let result = async {
            let mut files = vec![path.to_path_buf()];
            if let Some(runner) = &self.par2_runner {
                let temp_dir = self.config.par2.temp_dir.join("adhoc");
                let par2_files = runner.create(&cancel, path, &temp_dir, |_| {}).await?;
                files.extend(par2_files);
            }

            let outcome = self.poster.post_files(JobId(0), &cancel, &files).await?;
            self.nzb_writer
                .write(&self.nzb_relative_name(path), &outcome.files)
                .await
        }
        .await;

        *self
            .ad_hoc_upload
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = None;

        result
    }

    /// Cancel the active ad-hoc upload, if any.
    pub fn cancel_upload(&self) {
        let slot = self.ad_hoc_upload.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(cancel) = slot.as_ref() {
            cancel.cancel();
        }
    }

    /// Pause claiming. In-flight jobs continue to their next article
    /// boundary and then idle; they are not cancelled.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Processor paused");
            self.emit_event(Event::QueuePaused);
        }
    }

    /// Resume claiming, clearing an auto-pause as well.
    pub fn resume(&self) {
        let was_paused = self.paused.swap(false, Ordering::SeqCst);
        let was_auto = self
            .auto_pause_reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .is_some();

        if was_paused || was_auto {
            info!("Processor resumed");
            self.emit_event(Event::QueueResumed);
        }
    }

    /// Whether an operator pause is in effect.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether an environmental auto-pause is in effect.
    pub fn is_auto_paused(&self) -> bool {
        self.auto_pause_reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// The auto-pause trigger description, if auto-paused.
    pub fn auto_pause_reason(&self) -> Option<String> {
        self.auto_pause_reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Evaluate auto-pause conditions (currently: free disk space at the
    /// output directory).
    fn refresh_auto_pause(&self) {
        let min_free = self.config.queue.min_free_disk_space;
        if min_free == 0 {
            return;
        }

        let available = match get_available_space(&self.config.output_dir) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "Disk space check failed");
                return;
            }
        };

        let mut reason = self
            .auto_pause_reason
            .lock()
            .unwrap_or_else(|p| p.into_inner());

        if available < min_free {
            if reason.is_none() {
                let text = format!(
                    "low disk space: {} bytes free, {} required",
                    available, min_free
                );
                warn!(available = available, required = min_free, "Auto-pausing");
                *reason = Some(text.clone());
                self.emit_event(Event::AutoPaused { reason: text });
            }
        } else if reason.take().is_some() {
            info!(available = available, "Disk space recovered, auto-resume");
            self.emit_event(Event::AutoResumed);
        }
    }

    /// Cancel a running job. It settles as errored with reason "cancelled"
    /// and is never auto-retried.
    pub async fn cancel_job(&self, id: JobId) -> Result<()> {
        let running = self.running.lock().await;
        match running.get(&id) {
            Some(job) => {
                job.cancel.cancel();
                Ok(())
            }
            None => Err(Error::Queue(crate::error::QueueError::NotFound(format!(
                "job {} is not running",
                id
            )))),
        }
    }

    /// Re-enqueue an errored job, preserving its retry count.
    pub async fn retry(&self, id: JobId) -> Result<()> {
        self.queue.retry_errored(id).await
    }

    /// Remove a job from whichever state holds it (cancelling it first when
    /// it is running). Completed jobs lose their NZB file as well.
    pub async fn remove(&self, id: JobId) -> Result<()> {
        {
            let running = self.running.lock().await;
            if let Some(job) = running.get(&id) {
                job.cancel.cancel();
            }
        }

        self.queue.remove(id).await?;
        self.emit_event(Event::JobRemoved { id });
        Ok(())
    }

    /// Change the priority of a pending job.
    pub async fn set_priority(&self, id: JobId, priority: i32) -> Result<()> {
        self.queue.set_priority(id, priority).await
    }

    /// Paginated queue listing.
    pub async fn list(&self, filter: crate::db::ListFilter) -> Result<Vec<crate::db::JobRow>> {
        self.queue.list(filter).await
    }

    /// Queue statistics.
    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// Snapshot of every running job.
    pub async fn running_jobs(&self) -> Vec<RunningJobInfo> {
        let paused = self.is_paused() || self.is_auto_paused();
        let running = self.running.lock().await;

        running
            .iter()
            .map(|(id, job)| {
                let mut progress = job
                    .progress
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone();
                progress.is_paused = paused;
                progress.elapsed = job.started.elapsed();
                RunningJobInfo {
                    id: *id,
                    path: job.path.clone(),
                    progress,
                }
            })
            .collect()
    }

    /// Whether `path` belongs to a job currently being processed.
    pub async fn is_path_active(&self, path: &Path) -> bool {
        let running = self.running.lock().await;
        running.values().any(|job| job.path == path)
    }

    /// Connection pool counters.
    pub fn pool_metrics(&self) -> PoolMetricsSnapshot {
        self.pool.metrics().snapshot()
    }

    /// Change the upload throttle at runtime; 0 removes the limit.
    ///
    /// Takes effect immediately, including for workers currently waiting on
    /// tokens.
    pub fn set_throttle_rate(&self, rate_bps: u64) {
        self.throttle.set_rate(rate_bps);
    }

    /// Current upload throttle in bytes per second (0 = unlimited).
    pub fn throttle_rate(&self) -> u64 {
        self.throttle.rate()
    }

    /// Spawn the retention cleanup task for completed rows.
    pub fn start_retention_task(&self) -> tokio::task::JoinHandle<()> {
        let processor = self.clone();

        tokio::spawn(async move {
            let max_age =
                i64::from(processor.config.queue.completed_retention_days) * 24 * 3600;
            loop {
                tokio::select! {
                    _ = processor.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                }

                match processor.queue.expire_completed(max_age).await {
                    Ok(0) => {}
                    Ok(count) => info!(count = count, "Expired completed jobs"),
                    Err(e) => warn!(error = %e, "Retention cleanup failed"),
                }
            }
        })
    }

    /// Stop accepting work, cancel in-flight jobs, and wait for them to
    /// yield.
    ///
    /// Jobs interrupted here stay in the in-progress state and are recovered
    /// to pending at the next startup, preserving at-least-once semantics.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Processor shutting down");
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            if self.running.lock().await.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("Shutdown grace period expired with jobs still running");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("Processor shut down");
        Ok(())
    }

    /// Emit an event to all subscribers; dropped silently when nobody
    /// listens.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    fn par2_temp_dir(&self, id: JobId) -> PathBuf {
        self.config.par2.temp_dir.join(format!("job_{}", id.0))
    }

    /// NZB name relative to the output directory: watched files keep their
    /// path relative to the watch directory, everything else flattens to the
    /// file name.
    fn nzb_relative_name(&self, source: &Path) -> PathBuf {
        if self.config.watcher.enabled
            && let Ok(relative) = source.strip_prefix(&self.config.watcher.watch_directory)
        {
            return relative.to_path_buf();
        }
        source
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| source.to_path_buf())
    }

    /// Best-effort removal of a job's PAR2 staging directory.
    async fn cleanup_par2_temp(&self, id: JobId) {
        if self.par2_runner.is_none() {
            return;
        }
        let temp_dir = self.par2_temp_dir(id);
        if temp_dir.exists()
            && let Err(e) = tokio::fs::remove_dir_all(&temp_dir).await
        {
            warn!(job_id = id.0, path = %temp_dir.display(), error = %e, "Failed to remove PAR2 temp dir");
        }
    }
}
