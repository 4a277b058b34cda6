//! NNTP connection pool contract
//!
//! The pool is an external collaborator: it owns the NNTP transport, the
//! per-provider connection caps, failover between providers, and its own
//! internal retry/backoff for transient failures. The posting engine consumes
//! it through the [`ConnectionPool`] trait and treats every call as blocking
//! and cancellable from the outside.
//!
//! Implementations must uphold:
//! - `post` writes a fully-formed article to exactly one provider, retrying
//!   transient failures internally up to its configured cap before surfacing
//!   a classified [`PoolError`](crate::error::PoolError).
//! - `stat` reports whether a message-ID is retrievable from any of the given
//!   groups without transferring the body.
//! - `max_connections` is the sum of per-provider caps; the poster sizes its
//!   worker pools from it.

use crate::error::PoolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// A fully-formed article ready for the wire
///
/// Headers are ordered; the body is the yEnc-encoded payload. The pool is
/// responsible for dot-stuffing and CRLF framing.
#[derive(Clone, Debug)]
pub struct ArticlePayload {
    /// Message-ID without angle brackets
    pub message_id: String,
    /// Newsgroups the article is posted to
    pub groups: Vec<String>,
    /// Ordered header list (name, value); Message-ID and Newsgroups included
    pub headers: Vec<(String, String)>,
    /// yEnc-encoded body
    pub body: Vec<u8>,
}

impl ArticlePayload {
    /// Total payload size in bytes (headers estimated, body exact).
    pub fn size_bytes(&self) -> u64 {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len() + 4)
            .sum();
        (header_bytes + self.body.len()) as u64
    }
}

/// Result of a STAT request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatOutcome {
    /// The article is retrievable
    Present,
    /// No provider has the article
    Absent,
}

/// Point-in-time copy of pool counters
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PoolMetricsSnapshot {
    /// Payload bytes successfully posted
    pub bytes_posted: u64,
    /// Articles successfully posted
    pub articles_posted: u64,
    /// Post attempts that surfaced an error
    pub post_errors: u64,
    /// STAT requests issued
    pub stat_checks: u64,
}

/// Shared pool counters, updated with atomic adds
#[derive(Debug, Default)]
pub struct PoolMetrics {
    bytes_posted: AtomicU64,
    articles_posted: AtomicU64,
    post_errors: AtomicU64,
    stat_checks: AtomicU64,
}

impl PoolMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful post of `bytes` payload bytes
    pub fn record_post(&self, bytes: u64) {
        self.bytes_posted.fetch_add(bytes, Ordering::Relaxed);
        self.articles_posted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed post attempt
    pub fn record_post_error(&self) {
        self.post_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a STAT request
    pub fn record_stat(&self) {
        self.stat_checks.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            bytes_posted: self.bytes_posted.load(Ordering::Relaxed),
            articles_posted: self.articles_posted.load(Ordering::Relaxed),
            post_errors: self.post_errors.load(Ordering::Relaxed),
            stat_checks: self.stat_checks.load(Ordering::Relaxed),
        }
    }
}

/// Contract consumed by the poster and the deferred-check sweeper
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Post a fully-formed article to one of the configured providers.
    ///
    /// Blocks until the article is accepted or the pool's internal retries
    /// are exhausted. Callers cancel by dropping the future (the poster
    /// selects on its cancellation token).
    async fn post(&self, article: &ArticlePayload) -> Result<(), PoolError>;

    /// Check whether `message_id` is retrievable from any of `groups`.
    async fn stat(&self, message_id: &str, groups: &[String]) -> Result<StatOutcome, PoolError>;

    /// Sum of per-provider connection caps.
    fn max_connections(&self) -> usize;

    /// Shared counters for the metrics surface.
    fn metrics(&self) -> &PoolMetrics;
}
