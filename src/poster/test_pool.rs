//! Scriptable in-memory pool for poster and processor tests.

use crate::error::PoolError;
use crate::pool::{ArticlePayload, ConnectionPool, PoolMetrics, StatOutcome};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// In-memory pool: remembers every posted message-ID, answers STAT from that
/// set, and can be scripted to fail posts or hide articles from checks.
pub(crate) struct MockPool {
    /// Message-IDs accepted by post
    pub(crate) posted: Mutex<Vec<String>>,
    /// IDs whose post fails permanently
    fail_post: Mutex<HashSet<String>>,
    /// IDs that report Absent for the first N stats
    hide_from_stat: Mutex<HashMap<String, u32>>,
    /// Total post calls (including failed ones)
    pub(crate) post_calls: AtomicU64,
    /// Total stat calls
    pub(crate) stat_calls: AtomicU64,
    /// High-water mark of concurrent post calls
    pub(crate) max_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    max_connections: usize,
    metrics: PoolMetrics,
}

impl MockPool {
    pub(crate) fn new(max_connections: usize) -> Self {
        Self {
            posted: Mutex::new(Vec::new()),
            fail_post: Mutex::new(HashSet::new()),
            hide_from_stat: Mutex::new(HashMap::new()),
            post_calls: AtomicU64::new(0),
            stat_calls: AtomicU64::new(0),
            max_in_flight: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_connections,
            metrics: PoolMetrics::new(),
        }
    }

    /// Script a permanent rejection for `message_id`.
    pub(crate) fn fail_post_for(&self, message_id: &str) {
        self.fail_post.lock().unwrap().insert(message_id.to_string());
    }

    /// Script `message_id` to look missing for its first `times` stats.
    pub(crate) fn hide_from_stat(&self, message_id: &str, times: u32) {
        self.hide_from_stat
            .lock()
            .unwrap()
            .insert(message_id.to_string(), times);
    }

    pub(crate) fn posted_ids(&self) -> Vec<String> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionPool for MockPool {
    async fn post(&self, article: &ArticlePayload) -> Result<(), PoolError> {
        self.post_calls.fetch_add(1, Ordering::SeqCst);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        // Let other workers overlap so the high-water mark is meaningful
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_post.lock().unwrap().contains(&article.message_id) {
            self.metrics.record_post_error();
            return Err(PoolError::Permanent("441 posting failed".to_string()));
        }

        self.posted.lock().unwrap().push(article.message_id.clone());
        self.metrics.record_post(article.size_bytes());
        Ok(())
    }

    async fn stat(&self, message_id: &str, _groups: &[String]) -> Result<StatOutcome, PoolError> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_stat();

        {
            let mut hidden = self.hide_from_stat.lock().unwrap();
            if let Some(remaining) = hidden.get_mut(message_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(StatOutcome::Absent);
                }
                hidden.remove(message_id);
            }
        }

        let present = self
            .posted
            .lock()
            .unwrap()
            .iter()
            .any(|id| id == message_id);
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
