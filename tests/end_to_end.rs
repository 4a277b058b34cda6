//! End-to-end scenarios driven through the public API against a recording
//! pool.

mod common;

use common::{RecordingPool, test_config, write_source};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use usenet_post::db::ListFilter;
use usenet_post::types::ScriptStatus;
use usenet_post::{JobId, JobState, Processor};

/// Wait until the job reaches `state` or the timeout expires.
async fn wait_for_state(processor: &Processor, id: JobId, state: JobState, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        let jobs = processor
            .list(ListFilter {
                state: Some(state),
                ..Default::default()
            })
            .await
            .unwrap();
        if jobs.iter().any(|j| j.id == id.0) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} did not reach {state:?} in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn segment_sizes(nzb: &str) -> Vec<u64> {
    let re = regex::Regex::new(r#"bytes="(\d+)"\s+number="(\d+)""#).unwrap();
    let mut pairs: Vec<(u64, u64)> = re
        .captures_iter(nzb)
        .map(|c| (c[2].parse().unwrap(), c[1].parse().unwrap()))
        .collect();
    pairs.sort_unstable();
    pairs.into_iter().map(|(_, bytes)| bytes).collect()
}

#[tokio::test]
async fn one_megabyte_file_produces_four_equal_segments() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(RecordingPool::new(2));
    let processor = Processor::new(test_config(&dir, 256 * 1024, 2), Arc::clone(&pool) as Arc<dyn usenet_post::pool::ConnectionPool>)
        .await
        .unwrap();

    let source = write_source(&dir, "movie.bin", 1_048_576);
    let id = processor.enqueue(&source).await.unwrap();
    let handle = processor.start();

    wait_for_state(&processor, id, JobState::Completed, Duration::from_secs(15)).await;

    let stats = processor.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.errored, 0, "no entries in errored");

    let completed = processor
        .list(ListFilter {
            state: Some(JobState::Completed),
            ..Default::default()
        })
        .await
        .unwrap();
    let nzb_path = PathBuf::from(completed[0].nzb_path.clone().unwrap());
    assert!(nzb_path.exists());

    let nzb = std::fs::read_to_string(&nzb_path).unwrap();
    let sizes = segment_sizes(&nzb);
    assert_eq!(sizes, vec![262_144, 262_144, 262_144, 262_144]);
    assert_eq!(nzb.matches("<segment ").count(), 4);
    for number in 1..=4 {
        assert!(nzb.contains(&format!(r#"number="{number}""#)));
    }

    processor.shutdown().await.unwrap();
    handle.abort();
}

#[tokio::test]
async fn five_hundred_kilobyte_file_has_a_short_tail_segment() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(RecordingPool::new(2));
    let processor = Processor::new(test_config(&dir, 200 * 1024, 2), Arc::clone(&pool) as Arc<dyn usenet_post::pool::ConnectionPool>)
        .await
        .unwrap();

    let source = write_source(&dir, "movie.bin", 500_224);
    let id = processor.enqueue(&source).await.unwrap();
    let handle = processor.start();

    wait_for_state(&processor, id, JobState::Completed, Duration::from_secs(15)).await;

    let completed = processor
        .list(ListFilter {
            state: Some(JobState::Completed),
            ..Default::default()
        })
        .await
        .unwrap();
    let nzb = std::fs::read_to_string(completed[0].nzb_path.clone().unwrap()).unwrap();
    assert_eq!(segment_sizes(&nzb), vec![204_800, 204_800, 90_624]);

    processor.shutdown().await.unwrap();
    handle.abort();
}

#[tokio::test]
async fn verification_reposts_only_the_missing_article() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, 256 * 1024, 2);
    config.post_check.enabled = true;
    config.post_check.deferred = false;
    config.post_check.delay = Duration::ZERO;
    config.post_check.max_reposts = 1;

    let pool = Arc::new(RecordingPool::new(2));

    // Hide the first posted article from its first STAT pass; the re-post
    // records it again, so the second pass sees it.
    struct HideFirstPool {
        inner: Arc<RecordingPool>,
        hidden: std::sync::atomic::AtomicBool,
    }
    #[async_trait::async_trait]
    impl usenet_post::ConnectionPool for HideFirstPool {
        async fn post(
            &self,
            article: &usenet_post::ArticlePayload,
        ) -> Result<(), usenet_post::PoolError> {
            let result = self.inner.post(article).await;
            if result.is_ok()
                && !self
                    .hidden
                    .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                self.inner.delay_propagation(&article.message_id, 1);
            }
            result
        }
        async fn stat(
            &self,
            message_id: &str,
            groups: &[String],
        ) -> Result<usenet_post::StatOutcome, usenet_post::PoolError> {
            self.inner.stat(message_id, groups).await
        }
        fn max_connections(&self) -> usize {
            self.inner.max_connections()
        }
        fn metrics(&self) -> &usenet_post::PoolMetrics {
            self.inner.metrics()
        }
    }

    let hiding = Arc::new(HideFirstPool {
        inner: Arc::clone(&pool),
        hidden: std::sync::atomic::AtomicBool::new(false),
    });
    let processor = Processor::new(config, hiding).await.unwrap();

    let source = write_source(&dir, "movie.bin", 1_048_576); // 4 segments
    let id = processor.enqueue(&source).await.unwrap();
    let handle = processor.start();

    wait_for_state(&processor, id, JobState::Completed, Duration::from_secs(15)).await;

    // 4 original posts + exactly 1 re-post of the failed article
    assert_eq!(
        pool.post_calls.load(std::sync::atomic::Ordering::SeqCst),
        5
    );
    assert_eq!(processor.stats().await.unwrap().errored, 0);

    processor.shutdown().await.unwrap();
    handle.abort();
}

#[tokio::test]
async fn five_jobs_drain_through_two_slots() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, 1024, 2);
    config.queue.max_concurrent_uploads = 2;

    let pool = Arc::new(RecordingPool::new(2));
    let processor = Processor::new(config, Arc::clone(&pool) as Arc<dyn usenet_post::pool::ConnectionPool>).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let source = write_source(&dir, &format!("file{i}.bin"), 8192);
        ids.push(processor.enqueue(&source).await.unwrap());
    }

    let handle = processor.start();

    let deadline = Instant::now() + Duration::from_secs(30);
    let mut peak = 0usize;
    loop {
        peak = peak.max(processor.running_jobs().await.len());
        let stats = processor.stats().await.unwrap();
        if stats.completed == 5 {
            break;
        }
        assert!(Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(peak <= 2, "at most 2 jobs may be uploading, saw {peak}");
    assert_eq!(pool.posted_ids().len(), 5 * 8);

    processor.shutdown().await.unwrap();
    handle.abort();
}

#[tokio::test]
async fn duplicate_enqueue_is_rejected_and_counts_once() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(RecordingPool::new(2));
    let processor = Processor::new(test_config(&dir, 1024, 2), pool).await.unwrap();

    let source = write_source(&dir, "movie.bin", 2048);
    processor.enqueue(&source).await.unwrap();

    let err = processor.enqueue(&source).await.unwrap_err();
    assert!(matches!(
        err,
        usenet_post::Error::Queue(usenet_post::QueueError::DuplicatePath(_))
    ));

    assert_eq!(processor.stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn interrupted_jobs_reappear_pending_after_restart() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("queue.db");

    // First "process": claim a job and vanish without settling it,
    // simulating a crash mid-post.
    {
        let queue = usenet_post::Queue::new(&db_path).await.unwrap();
        let id = queue
            .enqueue(
                &usenet_post::db::NewJob {
                    path: "/files/movie.bin".to_string(),
                    size_bytes: 2048,
                    priority: 3,
                    retry_count: 0,
                    payload: "{}".to_string(),
                },
                false,
            )
            .await
            .unwrap();
        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, id.0);
        queue.close().await;
    }

    // Second "process": startup recovery moves it back to pending with the
    // same identity and priority.
    let pool = Arc::new(RecordingPool::new(2));
    let mut config = test_config(&dir, 1024, 2);
    config.queue.database_path = db_path;
    let processor = Processor::new(config, pool).await.unwrap();

    let pending = processor
        .list(ListFilter {
            state: Some(JobState::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].priority, 3);
    assert_eq!(pending[0].path, "/files/movie.bin");

    let stats = processor.stats().await.unwrap();
    assert_eq!(stats.in_progress, 0);
}

#[tokio::test]
async fn throttle_bounds_the_posting_rate() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, 1024, 2);
    // 8 KiB of payload at 4 KiB/s: the initial full bucket covers half,
    // the rest must wait about a second.
    config.posting.throttle_rate = 4 * 1024;

    let pool = Arc::new(RecordingPool::new(2));
    let processor = Processor::new(config, pool).await.unwrap();

    let source = write_source(&dir, "movie.bin", 8 * 1024);
    let start = Instant::now();
    processor.upload_file(&source).await.unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_millis(500),
        "8 KiB at 4 KiB/s finished implausibly fast: {elapsed:?}"
    );

    // And without a limit the same upload is near-instant
    let dir2 = TempDir::new().unwrap();
    let pool2 = Arc::new(RecordingPool::new(2));
    let processor2 = Processor::new(test_config(&dir2, 1024, 2), pool2)
        .await
        .unwrap();
    let source2 = write_source(&dir2, "movie.bin", 8 * 1024);
    let start = Instant::now();
    processor2.upload_file(&source2).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[cfg(unix)]
#[tokio::test]
async fn post_upload_script_retries_until_it_succeeds() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("now-succeed");
    let mut config = test_config(&dir, 1024, 2);
    config.post_upload_script.enabled = true;
    config.post_upload_script.command = format!("test -f {}", marker.display());
    config.post_upload_script.timeout = Duration::from_secs(10);
    config.post_upload_script.max_retries = 5;
    config.post_upload_script.base_delay = Duration::from_secs(1);

    let pool = Arc::new(RecordingPool::new(2));
    let processor = Processor::new(config, pool).await.unwrap();

    let source = write_source(&dir, "movie.bin", 1024);
    let id = processor.enqueue(&source).await.unwrap();

    let claim_loop = processor.start();
    let sweeper = processor.start_script_sweeper();

    wait_for_state(&processor, id, JobState::Completed, Duration::from_secs(15)).await;

    // The initial run fails (marker missing) and schedules a retry
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let jobs = processor.list(ListFilter::default()).await.unwrap();
        if jobs[0].script_status == ScriptStatus::PendingRetry.to_i32() {
            break;
        }
        assert!(Instant::now() < deadline, "script never recorded a failure");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Let it succeed on a later sweep
    std::fs::write(&marker, b"ok").unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let jobs = processor.list(ListFilter::default()).await.unwrap();
        let job = &jobs[0];
        if job.script_status == ScriptStatus::Completed.to_i32() {
            assert!(job.script_retry_count >= 1);
            assert!(job.script_first_failure_at.is_none(), "cleared on success");
            assert!(job.script_next_retry_at.is_none());
            break;
        }
        assert!(Instant::now() < deadline, "script never succeeded");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    processor.shutdown().await.unwrap();
    claim_loop.abort();
    sweeper.abort();
}

#[tokio::test]
async fn compressed_nzb_gets_the_codec_extension() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, 1024, 2);
    config.nzb_compression.enabled = true;
    config.nzb_compression.r#type = usenet_post::config::CompressionType::Zstd;
    config.nzb_compression.level = 3;

    let pool = Arc::new(RecordingPool::new(2));
    let processor = Processor::new(config, pool).await.unwrap();

    let source = write_source(&dir, "movie.bin", 2048);
    let nzb_path = processor.upload_file(&source).await.unwrap();

    assert!(nzb_path.to_string_lossy().ends_with("movie.nzb.zst"));
    let compressed = std::fs::read(&nzb_path).unwrap();
    let decompressed = zstd::stream::decode_all(&compressed[..]).unwrap();
    let text = String::from_utf8(decompressed).unwrap();
    assert!(text.contains("<segment "));
}

#[tokio::test]
async fn posted_articles_carry_complete_headers_and_yenc_bodies() {
    let dir = TempDir::new().unwrap();
    let pool = Arc::new(RecordingPool::new(2));
    let processor = Processor::new(test_config(&dir, 1024, 2), Arc::clone(&pool) as Arc<dyn usenet_post::pool::ConnectionPool>)
        .await
        .unwrap();

    let source = write_source(&dir, "movie.bin", 1536); // 2 segments
    processor.upload_file(&source).await.unwrap();

    let articles = pool.posted();
    assert_eq!(articles.len(), 2);

    for article in &articles {
        let names: Vec<&str> = article.headers.iter().map(|(n, _)| n.as_str()).collect();
        for required in ["From", "Newsgroups", "Message-ID", "Subject", "Date"] {
            assert!(names.contains(&required), "missing header {required}");
        }

        let body = String::from_utf8_lossy(&article.body);
        assert!(body.starts_with("=ybegin "));
        assert!(body.contains("=ypart "));
        assert!(body.contains("=yend "));
        assert!(body.contains("name=movie.bin"));
        assert!(body.contains("size=1536"));
    }

    // Subjects carry the canonical shape with part numbering
    let subjects: Vec<&String> = articles
        .iter()
        .map(|a| {
            &a.headers
                .iter()
                .find(|(n, _)| n == "Subject")
                .unwrap()
                .1
        })
        .collect();
    assert!(subjects.iter().any(|s| s.contains("(1/2)")));
    assert!(subjects.iter().any(|s| s.contains("(2/2)")));
}
