//! Poster — turns files into article sets and drives them through the pool.
//!
//! The poster owns the open source file handle and the in-flight articles
//! for the duration of a run; nothing here is persisted. Files are posted in
//! order (data first, then recovery files); articles within a file are
//! posted by a bounded worker pool in no mandated order, with part numbers
//! preserved for the NZB.
//!
//! Verification is one of two mutually exclusive paths:
//! - synchronous: stat every article before releasing the file, re-posting
//!   only the failed articles (bounded by `post_check.max_reposts`), or
//! - deferred: return per-article `(message_id, groups)` for the processor
//!   to persist, releasing the file immediately.

mod article;
mod upload;

pub use article::{Article, FileSpec, PartType, build_articles, random_message_id};

use crate::config::Config;
use crate::error::{Error, PostError, Result};
use crate::pool::ConnectionPool;
use crate::throttle::Throttle;
use crate::types::{Event, JobId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use upload::{PostPoolContext, UploadCounters, derive_file_hash, run_check_pool, run_post_pool};

/// One posted segment as recorded for the NZB and deferred checks
#[derive(Clone, Debug)]
pub struct PostedSegment {
    /// 1-based part number
    pub number: u32,
    /// Raw (unencoded) segment size in bytes
    pub bytes: u64,
    /// Message-ID without angle brackets
    pub message_id: String,
    /// Groups the segment was posted to
    pub groups: Vec<String>,
}

/// One fully posted file
#[derive(Clone, Debug)]
pub struct PostedFile {
    /// Source path
    pub path: PathBuf,
    /// Original filename
    pub file_name: String,
    /// File-level subject (the first segment's subject)
    pub subject: String,
    /// From header used for the file
    pub poster: String,
    /// Groups the file was posted to
    pub groups: Vec<String>,
    /// Posting timestamp (epoch seconds)
    pub posted_at: i64,
    /// SHA-256 over the hex article hashes in part-number order
    pub file_hash: String,
    /// All segments, one per article
    pub segments: Vec<PostedSegment>,
}

/// Result of posting a job's file list
#[derive(Clone, Debug)]
pub struct PostOutcome {
    /// Posted files in input order (data first, then PAR2)
    pub files: Vec<PostedFile>,
    /// Total articles posted (first-pass count, not counting re-posts)
    pub total_articles: u64,
}

impl PostOutcome {
    /// Flatten every segment for deferred check persistence.
    pub fn all_segments(&self) -> impl Iterator<Item = &PostedSegment> {
        self.files.iter().flat_map(|f| f.segments.iter())
    }
}

/// Drives article production and upload for one job at a time
pub struct Poster {
    config: Arc<Config>,
    pool: Arc<dyn ConnectionPool>,
    throttle: Throttle,
    event_tx: tokio::sync::broadcast::Sender<Event>,
}

impl Poster {
    /// Create a poster sharing the engine's pool, throttle, and event bus.
    pub fn new(
        config: Arc<Config>,
        pool: Arc<dyn ConnectionPool>,
        throttle: Throttle,
        event_tx: tokio::sync::broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            pool,
            throttle,
            event_tx,
        }
    }

    /// Post a job's files (data plus recovery) and verify per configuration.
    ///
    /// Returns the article sets for NZB generation. Any failure is surfaced
    /// after cancelling in-flight workers; partially posted articles are not
    /// rolled back (the queue decides whether to retry the job).
    pub async fn post_files(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
        paths: &[PathBuf],
    ) -> Result<PostOutcome> {
        // Build every article set up front so progress totals cover the job
        let total_files = paths.len() as u32;
        let mut file_sets = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            let metadata = tokio::fs::metadata(path).await.map_err(|e| {
                Error::Post(PostError::SourceRead {
                    path: path.clone(),
                    offset: 0,
                    reason: e.to_string(),
                })
            })?;
            let spec = FileSpec {
                path: path.clone(),
                size: metadata.len(),
                part_type: PartType::of_path(path),
                file_number: i as u32 + 1,
                total_files,
            };
            let articles = build_articles(
                &self.config.posting,
                &spec,
                self.config.maintain_original_extension,
            );
            file_sets.push((spec, articles));
        }

        let total_articles: u64 = file_sets.iter().map(|(_, a)| a.len() as u64).sum();
        let ctx = PostPoolContext {
            job_id,
            pool: Arc::clone(&self.pool),
            throttle: self.throttle.clone(),
            event_tx: self.event_tx.clone(),
            cancel: cancel.clone(),
            max_workers: self.config.effective_max_workers(),
            counters: Arc::new(UploadCounters::new(total_articles)),
            posted_at: chrono::Utc::now().timestamp(),
            retry: crate::config::RetryConfig {
                max_attempts: self.config.posting.max_retries,
                initial_delay: self.config.posting.retry_delay,
                ..Default::default()
            },
        };

        let mut files = Vec::with_capacity(file_sets.len());
        for (spec, articles) in file_sets {
            files.push(self.post_single_file(&ctx, spec, articles).await?);
        }

        Ok(PostOutcome {
            files,
            total_articles,
        })
    }

    /// Post one file's articles, then run synchronous verification when
    /// configured.
    ///
    /// The open handle is held across partial retries so a re-post cannot
    /// race source-file replacement.
    async fn post_single_file(
        &self,
        ctx: &PostPoolContext,
        spec: FileSpec,
        articles: Vec<Article>,
    ) -> Result<PostedFile> {
        let file = Arc::new(
            tokio::fs::File::open(&spec.path)
                .await
                .map_err(|e| {
                    Error::Post(PostError::SourceRead {
                        path: spec.path.clone(),
                        offset: 0,
                        reason: e.to_string(),
                    })
                })?
                .into_std()
                .await,
        );
        let articles = Arc::new(articles);
        let all_indices: Vec<usize> = (0..articles.len()).collect();

        tracing::info!(
            job_id = ctx.job_id.0,
            path = %spec.path.display(),
            articles = articles.len(),
            "Posting file"
        );

        let posted = run_post_pool(ctx, &file, &articles, &all_indices).await?;
        let mut hashes: HashMap<usize, String> =
            posted.into_iter().map(|p| (p.index, p.hash)).collect();

        let check = &self.config.post_check;
        if check.enabled && !check.deferred {
            let mut to_check = all_indices;
            let mut reposts = 0u32;

            loop {
                if !check.delay.is_zero() {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(check.delay) => {}
                    }
                }

                let failed = run_check_pool(ctx, &articles, &to_check).await?;
                if failed.is_empty() {
                    break;
                }

                if reposts >= check.max_reposts {
                    return Err(Error::Post(PostError::RepostsExhausted {
                        file: spec.path.clone(),
                        failed: failed.len(),
                        reposts,
                    }));
                }
                reposts += 1;

                tracing::warn!(
                    job_id = ctx.job_id.0,
                    path = %spec.path.display(),
                    failed = failed.len(),
                    repost = reposts,
                    "Re-posting unverified articles"
                );

                // Partial retry: only the failed articles, same open handle
                let reposted = run_post_pool(ctx, &file, &articles, &failed).await?;
                for p in reposted {
                    hashes.insert(p.index, p.hash);
                }
                to_check = failed;
            }
        }

        let hash_pairs: Vec<(u32, String)> = hashes
            .into_iter()
            .map(|(index, hash)| (articles[index].part_number, hash))
            .collect();
        let file_hash = derive_file_hash(hash_pairs);

        let segments = articles
            .iter()
            .map(|a| PostedSegment {
                number: a.part_number,
                bytes: a.size,
                message_id: a.message_id.clone(),
                groups: a.groups.clone(),
            })
            .collect();

        Ok(PostedFile {
            path: spec.path,
            file_name: articles[0].original_name.clone(),
            subject: articles[0].subject.clone(),
            poster: articles[0].from.clone(),
            groups: articles[0].groups.clone(),
            posted_at: ctx.posted_at,
            file_hash,
            segments,
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_pool;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
