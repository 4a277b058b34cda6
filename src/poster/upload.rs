//! Bounded post/check worker pools for a single file.
//!
//! Workers pull articles off a shared cursor, read their windows with
//! positional I/O (no shared seek state), throttle, encode, and post. A
//! failed worker cancels its siblings at the next article boundary. The
//! check pool stats every posted article and feeds failures back into a
//! partial re-post that reuses the same open file handle.

use crate::config::RetryConfig;
use crate::error::{Error, PostError, Result};
use crate::pool::{ArticlePayload, ConnectionPool, StatOutcome};
use crate::retry::with_retry;
use crate::throttle::Throttle;
use crate::types::{Event, JobId};
use crate::yenc::{self, YencMeta};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::article::Article;

/// Cross-platform positional file read.
///
/// Reads exactly `len` bytes from `file` at the given byte `offset`,
/// equivalent to Unix `pread`.
#[cfg(unix)]
fn read_exact_at(file: &std::fs::File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    use std::os::unix::fs::FileExt;
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}

/// Cross-platform positional file read.
///
/// Reads exactly `len` bytes from `file` at the given byte `offset`,
/// equivalent to Unix `pread`.
#[cfg(windows)]
fn read_exact_at(file: &std::fs::File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    use std::os::windows::fs::FileExt;
    let mut buf = vec![0u8; len];
    let mut read = 0;
    while read < len {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }
        read += n;
    }
    Ok(buf)
}

/// Shared progress counters for one job's upload stage
pub(super) struct UploadCounters {
    /// Articles posted across all of the job's files
    pub(super) posted: AtomicU64,
    /// Total articles the job will post
    pub(super) total: AtomicU64,
    /// Payload bytes posted
    pub(super) bytes: AtomicU64,
    /// Stage start, for rate calculation
    pub(super) started: Instant,
}

impl UploadCounters {
    pub(super) fn new(total: u64) -> Self {
        Self {
            posted: AtomicU64::new(0),
            total: AtomicU64::new(total),
            bytes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub(super) fn rate_bps(&self) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (self.bytes.load(Ordering::Relaxed) as f64 / elapsed) as u64
    }
}

/// Everything a post worker needs, cheap to clone per worker
pub(super) struct PostPoolContext {
    pub(super) job_id: JobId,
    pub(super) pool: Arc<dyn ConnectionPool>,
    pub(super) throttle: Throttle,
    pub(super) event_tx: tokio::sync::broadcast::Sender<Event>,
    pub(super) cancel: CancellationToken,
    pub(super) max_workers: usize,
    pub(super) counters: Arc<UploadCounters>,
    /// Wall-clock posting timestamp used for Date headers
    pub(super) posted_at: i64,
    /// Article-level retry schedule for transient pool failures
    pub(super) retry: RetryConfig,
}

/// One article's settled result from the post pool
pub(super) struct PostedArticle {
    /// Index into the file's article vec
    pub(super) index: usize,
    /// Hex sha256 of the article's raw window
    pub(super) hash: String,
}

/// Post a set of articles from one open file through a bounded worker pool.
///
/// `indices` selects which entries of `articles` to post (the full set on the
/// first pass, only the failed ones on a partial retry). Workers take
/// articles off a shared cursor; the first error cancels the remaining
/// workers at their next article boundary and is returned.
pub(super) async fn run_post_pool(
    ctx: &PostPoolContext,
    file: &Arc<std::fs::File>,
    articles: &Arc<Vec<Article>>,
    indices: &[usize],
) -> Result<Vec<PostedArticle>> {
    if indices.is_empty() {
        return Ok(Vec::new());
    }

    let worker_count = ctx.max_workers.max(1).min(indices.len());
    let pool_cancel = ctx.cancel.child_token();
    let cursor = Arc::new(AtomicUsize::new(0));
    let indices = Arc::new(indices.to_vec());

    let mut join_set: JoinSet<Result<Vec<PostedArticle>>> = JoinSet::new();
    for _ in 0..worker_count {
        let file = Arc::clone(file);
        let articles = Arc::clone(articles);
        let indices = Arc::clone(&indices);
        let cursor = Arc::clone(&cursor);
        let pool = Arc::clone(&ctx.pool);
        let throttle = ctx.throttle.clone();
        let event_tx = ctx.event_tx.clone();
        let counters = Arc::clone(&ctx.counters);
        let cancel = pool_cancel.clone();
        let job_id = ctx.job_id;
        let posted_at = ctx.posted_at;
        let retry = ctx.retry.clone();

        join_set.spawn(async move {
            let mut results = Vec::new();
            loop {
                let slot = cursor.fetch_add(1, Ordering::Relaxed);
                if slot >= indices.len() {
                    break;
                }
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let index = indices[slot];
                let article = &articles[index];

                let hash = post_one(
                    &file, article, &pool, &throttle, &cancel, posted_at, &retry,
                )
                .await?;

                let posted = counters.posted.fetch_add(1, Ordering::Relaxed) + 1;
                counters.bytes.fetch_add(article.size, Ordering::Relaxed);
                event_tx
                    .send(Event::UploadProgress {
                        id: job_id,
                        posted,
                        total: counters.total.load(Ordering::Relaxed),
                        rate_bps: counters.rate_bps(),
                    })
                    .ok();

                results.push(PostedArticle { index, hash });
            }
            Ok(results)
        });
    }

    let mut posted = Vec::new();
    let mut first_error: Option<Error> = None;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(mut worker_results)) => posted.append(&mut worker_results),
            Ok(Err(e)) => {
                // Stop the siblings at their next article boundary
                pool_cancel.cancel();
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(join_err) => {
                pool_cancel.cancel();
                if first_error.is_none() {
                    first_error = Some(Error::Post(PostError::WorkerFailed(
                        join_err.to_string(),
                    )));
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(posted),
    }
}

/// Read, hash, throttle, encode, and post one article.
///
/// Transient pool failures get one more retry layer here on top of the
/// pool's own; permanent rejections and exhausted retries surface upward.
async fn post_one(
    file: &Arc<std::fs::File>,
    article: &Article,
    pool: &Arc<dyn ConnectionPool>,
    throttle: &Throttle,
    cancel: &CancellationToken,
    posted_at: i64,
    retry: &RetryConfig,
) -> Result<String> {
    // Positional read off the async runtime; short but still blocking I/O
    let file_for_read = Arc::clone(file);
    let offset = article.offset;
    let size = article.size as usize;
    let path = article.original_name.clone();
    let data = tokio::task::spawn_blocking(move || read_exact_at(&file_for_read, offset, size))
        .await
        .map_err(|e| Error::Post(PostError::WorkerFailed(e.to_string())))?
        .map_err(|e| {
            Error::Post(PostError::SourceRead {
                path: path.into(),
                offset,
                reason: e.to_string(),
            })
        })?;

    let mut hasher = Sha256::new();
    hasher.update(&data);
    let hash = format!("{:x}", hasher.finalize());

    throttle.acquire(article.size).await;

    let body = yenc::encode(
        &data,
        &YencMeta {
            name: &article.file_name,
            file_size: article.file_size,
            part_number: article.part_number,
            total_parts: article.total_parts,
            offset: article.offset,
        },
    );

    let payload = ArticlePayload {
        message_id: article.message_id.clone(),
        groups: article.groups.clone(),
        headers: article.wire_headers(posted_at),
        body,
    };

    let pool_ref: &Arc<dyn ConnectionPool> = pool;
    let payload_ref = &payload;

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = with_retry(retry, || async move {
            pool_ref.post(payload_ref).await.map_err(Error::Pool)
        }) => {
            result.map_err(|e| match e {
                Error::Pool(crate::error::PoolError::Permanent(reason)) => {
                    Error::Post(PostError::ArticleRejected {
                        message_id: article.message_id.clone(),
                        reason,
                    })
                }
                other => other,
            })?;
            Ok(hash)
        }
    }
}

/// Derive the file-level hash: SHA-256 over the concatenation of the hex
/// article hashes in part-number order.
pub(super) fn derive_file_hash(mut hashes: Vec<(u32, String)>) -> String {
    hashes.sort_by_key(|(part, _)| *part);
    let mut hasher = Sha256::new();
    for (_, hash) in &hashes {
        hasher.update(hash.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Stat every selected article; returns indices whose article is absent or
/// whose check errored.
pub(super) async fn run_check_pool(
    ctx: &PostPoolContext,
    articles: &Arc<Vec<Article>>,
    indices: &[usize],
) -> Result<Vec<usize>> {
    if indices.is_empty() {
        return Ok(Vec::new());
    }

    let limit = Arc::new(Semaphore::new(ctx.max_workers.max(1)));
    let checked = Arc::new(AtomicU64::new(0));
    let total = indices.len() as u64;

    let mut join_set: JoinSet<Result<Option<usize>>> = JoinSet::new();
    for &index in indices {
        let articles = Arc::clone(articles);
        let pool = Arc::clone(&ctx.pool);
        let limit = Arc::clone(&limit);
        let cancel = ctx.cancel.clone();
        let event_tx = ctx.event_tx.clone();
        let checked = Arc::clone(&checked);
        let job_id = ctx.job_id;

        join_set.spawn(async move {
            let _permit = limit
                .acquire_owned()
                .await
                .map_err(|e| Error::Post(PostError::WorkerFailed(e.to_string())))?;

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let article = &articles[index];
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = pool.stat(&article.message_id, &article.groups) => outcome,
            };

            let done = checked.fetch_add(1, Ordering::Relaxed) + 1;
            event_tx
                .send(Event::CheckProgress {
                    id: job_id,
                    checked: done,
                    total,
                })
                .ok();

            // Absent or errored checks both count the article as failed
            match outcome {
                Ok(StatOutcome::Present) => Ok(None),
                Ok(StatOutcome::Absent) => Ok(Some(index)),
                Err(e) => {
                    tracing::debug!(
                        message_id = %article.message_id,
                        error = %e,
                        "Stat failed, counting article as unverified"
                    );
                    Ok(Some(index))
                }
            }
        });
    }

    let mut failed = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(None)) => {}
            Ok(Ok(Some(index))) => failed.push(index),
            Ok(Err(e)) => {
                join_set.abort_all();
                return Err(e);
            }
            Err(join_err) => {
                join_set.abort_all();
                return Err(Error::Post(PostError::WorkerFailed(join_err.to_string())));
            }
        }
    }

    failed.sort_unstable();
    Ok(failed)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_hash_is_order_independent_of_arrival() {
        let a = vec![
            (2, "bb".to_string()),
            (1, "aa".to_string()),
            (3, "cc".to_string()),
        ];
        let b = vec![
            (1, "aa".to_string()),
            (3, "cc".to_string()),
            (2, "bb".to_string()),
        ];
        assert_eq!(derive_file_hash(a), derive_file_hash(b));

        // And equals a straight hash of the ordered concatenation
        let mut hasher = Sha256::new();
        hasher.update(b"aabbcc");
        let expected = format!("{:x}", hasher.finalize());
        assert_eq!(
            derive_file_hash(vec![
                (1, "aa".to_string()),
                (2, "bb".to_string()),
                (3, "cc".to_string())
            ]),
            expected
        );
    }

    #[test]
    fn positional_reads_do_not_move_a_cursor() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, (0u8..=255).collect::<Vec<u8>>()).unwrap();
        let file = std::fs::File::open(&path).unwrap();

        // Interleaved reads at arbitrary offsets see consistent data
        assert_eq!(read_exact_at(&file, 10, 3).unwrap(), vec![10, 11, 12]);
        assert_eq!(read_exact_at(&file, 0, 2).unwrap(), vec![0, 1]);
        assert_eq!(read_exact_at(&file, 200, 4).unwrap(), vec![200, 201, 202, 203]);
    }

    #[test]
    fn read_past_eof_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"short").unwrap();
        let file = std::fs::File::open(&path).unwrap();

        assert!(read_exact_at(&file, 3, 10).is_err());
    }
}
