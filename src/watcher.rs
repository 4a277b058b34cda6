//! Watch-directory scanning for automatic posting
//!
//! The watcher periodically walks a directory and enqueues files once they
//! are stable: old enough, unchanged in size since the previous observation,
//! and openable for exclusive access. Partially-written files keep failing
//! one of the three gates until their producer is done with them.
//!
//! Scanning is poll-based by design: stability requires comparing
//! observations across time, which inotify-style events cannot provide.

use crate::config::WatcherConfig;
use crate::error::{Error, QueueError, Result};
use crate::processor::Processor;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A file younger than this (by mtime) is never considered stable
const STABLE_MTIME_AGE: Duration = Duration::from_secs(2);

/// Size-cache entries older than this are pruned
const CACHE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Last observed size of a candidate file
struct SizeEntry {
    size: u64,
    observed_at: Instant,
}

/// Watches a directory and enqueues stable new files
pub struct DirectoryWatcher {
    processor: Arc<Processor>,
    config: WatcherConfig,
    ignore: Option<GlobSet>,
    size_cache: Mutex<HashMap<PathBuf, SizeEntry>>,
    scan_now: Notify,
}

impl DirectoryWatcher {
    /// Create a watcher.
    ///
    /// # Errors
    /// Returns an error when an ignore pattern is not a valid glob.
    pub fn new(processor: Arc<Processor>, config: WatcherConfig) -> Result<Self> {
        let ignore = if config.ignore_patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &config.ignore_patterns {
                let glob = Glob::new(pattern)
                    .map_err(|e| Error::Watch(format!("invalid ignore pattern '{pattern}': {e}")))?;
                builder.add(glob);
            }
            Some(
                builder
                    .build()
                    .map_err(|e| Error::Watch(format!("failed to build ignore set: {e}")))?,
            )
        };

        Ok(Self {
            processor,
            config,
            ignore,
            size_cache: Mutex::new(HashMap::new()),
            scan_now: Notify::new(),
        })
    }

    /// Request an on-demand scan outside the periodic cadence.
    pub fn trigger_scan(&self) {
        self.scan_now.notify_one();
    }

    /// Run the periodic scan loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            directory = %self.config.watch_directory.display(),
            interval_secs = self.config.check_interval.as_secs(),
            "Watcher started"
        );

        loop {
            if self.in_schedule_window() {
                if let Err(e) = self.scan().await {
                    warn!(error = %e, "Watch scan failed");
                }
            } else {
                debug!("Outside schedule window, skipping scan");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.check_interval) => {}
                _ = self.scan_now.notified() => {
                    debug!("On-demand scan triggered");
                }
            }
        }

        info!("Watcher stopped");
    }

    /// Whether scanning is allowed right now.
    fn in_schedule_window(&self) -> bool {
        match &self.config.schedule {
            Some(window) => window.contains(chrono::Local::now().time()),
            None => true,
        }
    }

    /// Walk the watch directory once, enqueueing every stable candidate.
    pub async fn scan(&self) -> Result<u32> {
        self.prune_cache();

        let mut enqueued = 0u32;
        let mut entries = match tokio::fs::read_dir(&self.config.watch_directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    directory = %self.config.watch_directory.display(),
                    "Watch directory does not exist yet"
                );
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to stat candidate");
                    continue;
                }
            };

            if !metadata.is_file() {
                continue;
            }

            if self.should_enqueue(&path, &metadata).await {
                match self.enqueue(&path, metadata.len()).await {
                    Ok(()) => enqueued += 1,
                    Err(Error::Queue(QueueError::DuplicatePath(_))) => {
                        debug!(path = %path.display(), "Already queued, skipping");
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to enqueue watched file");
                    }
                }
            }
        }

        if enqueued > 0 {
            info!(count = enqueued, "Watcher enqueued new files");
        }

        Ok(enqueued)
    }

    /// Every filter and stability gate for one candidate.
    async fn should_enqueue(&self, path: &Path, metadata: &std::fs::Metadata) -> bool {
        let size = metadata.len();

        if size < self.config.min_file_size {
            return false;
        }

        if let Some(ignore) = &self.ignore
            && let Some(name) = path.file_name()
            && ignore.is_match(name)
        {
            return false;
        }

        // Below the batch threshold: defer to a later pass
        if size < self.config.size_threshold {
            return false;
        }

        if self.processor.is_path_active(path).await {
            return false;
        }

        self.is_stable(path, size, metadata).await
    }

    /// A file is stable when its mtime is old enough, its size matches the
    /// previous observation, and it can be opened for exclusive access.
    async fn is_stable(&self, path: &Path, size: u64, metadata: &std::fs::Metadata) -> bool {
        match metadata.modified() {
            Ok(mtime) => match mtime.elapsed() {
                Ok(age) if age >= STABLE_MTIME_AGE => {}
                // Too young, or mtime in the future (clock skew): not stable
                _ => return false,
            },
            Err(_) => return false,
        }

        // Size must match the last observation for this path
        {
            let mut cache = self.size_cache.lock().unwrap_or_else(|p| p.into_inner());
            match cache.get(path) {
                Some(entry) if entry.size == size => {}
                _ => {
                    cache.insert(
                        path.to_path_buf(),
                        SizeEntry {
                            size,
                            observed_at: Instant::now(),
                        },
                    );
                    return false;
                }
            }
        }

        // Exclusive-open probe: a writer still holding the file fails this
        let probe_path = path.to_path_buf();
        let opened = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&probe_path)
                .map(drop)
        })
        .await;

        matches!(opened, Ok(Ok(())))
    }

    async fn enqueue(&self, path: &Path, size: u64) -> Result<()> {
        // Deleting originals after upload means the same path can appear
        // again as a brand-new file; that mode uses the allow-duplicate path.
        let allow_duplicate = self.config.delete_original_file;

        let id = self
            .processor
            .enqueue_with(path, size, 0, allow_duplicate)
            .await?;

        info!(job_id = id.0, path = %path.display(), size = size, "Enqueued watched file");

        self.size_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(path);

        Ok(())
    }

    /// Drop size-cache entries not seen within the retention window.
    fn prune_cache(&self) {
        let mut cache = self.size_cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.retain(|_, entry| entry.observed_at.elapsed() < CACHE_MAX_AGE);
    }
}
