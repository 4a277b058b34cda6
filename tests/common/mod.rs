//! Shared fixtures for integration tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;
use usenet_post::config::{PostingConfig, QueueConfig, ServerConfig};
use usenet_post::pool::{ArticlePayload, PoolMetrics, StatOutcome};
use usenet_post::{Config, ConnectionPool, PoolError};

/// In-memory pool that records every posted article and answers STAT from
/// the recorded set. Individual message-IDs can be scripted to look absent
/// for their first N stats, emulating slow propagation.
pub struct RecordingPool {
    posted: Mutex<Vec<ArticlePayload>>,
    absent_counts: Mutex<HashMap<String, u32>>,
    pub post_calls: AtomicU64,
    pub stat_calls: AtomicU64,
    max_connections: usize,
    metrics: PoolMetrics,
}

impl RecordingPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            posted: Mutex::new(Vec::new()),
            absent_counts: Mutex::new(HashMap::new()),
            post_calls: AtomicU64::new(0),
            stat_calls: AtomicU64::new(0),
            max_connections,
            metrics: PoolMetrics::new(),
        }
    }

    /// Make a posted article invisible to its next `times` STAT calls.
    pub fn delay_propagation(&self, message_id: &str, times: u32) {
        self.absent_counts
            .lock()
            .unwrap()
            .insert(message_id.to_string(), times);
    }

    pub fn posted(&self) -> Vec<ArticlePayload> {
        self.posted.lock().unwrap().clone()
    }

    pub fn posted_ids(&self) -> Vec<String> {
        self.posted
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.message_id.clone())
            .collect()
    }
}

#[async_trait]
impl ConnectionPool for RecordingPool {
    async fn post(&self, article: &ArticlePayload) -> Result<(), PoolError> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_post(article.size_bytes());
        self.posted.lock().unwrap().push(article.clone());
        Ok(())
    }

    async fn stat(&self, message_id: &str, _groups: &[String]) -> Result<StatOutcome, PoolError> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_stat();

        {
            let mut absent = self.absent_counts.lock().unwrap();
            if let Some(remaining) = absent.get_mut(message_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(StatOutcome::Absent);
                }
                absent.remove(message_id);
            }
        }

        let present = self
            .posted
            .lock()
            .unwrap()
            .iter()
            .any(|a| a.message_id == message_id);
        Ok(if present {
            StatOutcome::Present
        } else {
            StatOutcome::Absent
        })
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }
}

/// A minimal valid config rooted in `dir` with one server.
pub fn test_config(dir: &TempDir, article_size: u64, max_connections: usize) -> Config {
    Config {
        servers: vec![ServerConfig {
            host: "news.example.com".to_string(),
            port: 563,
            username: None,
            password: None,
            tls: true,
            insecure_tls: false,
            max_connections,
            max_idle_seconds: 300,
            max_ttl_seconds: 3600,
        }],
        posting: PostingConfig {
            article_size_in_bytes: article_size,
            groups: vec!["alt.binaries.test".to_string()],
            max_retries: 0,
            ..Default::default()
        },
        queue: QueueConfig {
            database_path: dir.path().join("queue.db"),
            max_concurrent_uploads: 1,
            min_free_disk_space: 0,
            completed_retention_days: 0,
        },
        output_dir: dir.path().join("nzbs"),
        ..Default::default()
    }
}

/// Write a deterministic source file.
pub fn write_source(dir: &TempDir, name: &str, size: usize) -> PathBuf {
    let path = dir.path().join(name);
    let data: Vec<u8> = (0..size).map(|i| (i % 249) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}
