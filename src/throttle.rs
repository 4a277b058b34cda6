//! Upload throttling using a token bucket
//!
//! The Throttle applies a global byte-rate limit across all concurrent post
//! workers using a lock-free token bucket.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Global byte-rate limiter shared across all post workers
///
/// Tokens represent payload bytes handed to the connection pool. They refill
/// at the configured rate; the bucket capacity is one second's worth of rate,
/// which bounds the burst. A rate of 0 means unlimited.
///
/// All workers share the same bucket, so bandwidth is distributed naturally
/// by demand: a worker requests its article's byte count before calling
/// `post` and waits until that many tokens have accumulated.
#[derive(Clone)]
pub struct Throttle {
    /// Rate limit in bytes per second (0 = unlimited)
    rate_bps: Arc<AtomicU64>,
    /// Available tokens (current bucket contents in bytes)
    tokens: Arc<AtomicU64>,
    /// Last refill timestamp (nanoseconds since an arbitrary epoch)
    last_refill: Arc<AtomicU64>,
}

impl Throttle {
    /// Create a new Throttle.
    ///
    /// # Arguments
    ///
    /// * `rate_bps` - Rate limit in bytes per second (0 = unlimited)
    #[must_use]
    pub fn new(rate_bps: u64) -> Self {
        let now = Self::now_nanos();

        Self {
            rate_bps: Arc::new(AtomicU64::new(rate_bps)),
            tokens: Arc::new(AtomicU64::new(rate_bps)),
            last_refill: Arc::new(AtomicU64::new(now)),
        }
    }

    /// Change the rate limit.
    ///
    /// Takes effect immediately, including for workers currently waiting in
    /// [`acquire`](Self::acquire). Raising the rate tops the bucket up by the
    /// difference; lowering it leaves already-accumulated tokens to drain.
    pub fn set_rate(&self, rate_bps: u64) {
        let old = self.rate_bps.swap(rate_bps, Ordering::SeqCst);

        if rate_bps > old {
            self.tokens.fetch_add(rate_bps - old, Ordering::SeqCst);
        }
    }

    /// Current rate limit in bytes per second (0 = unlimited).
    pub fn rate(&self) -> u64 {
        self.rate_bps.load(Ordering::Relaxed)
    }

    /// Wait until `bytes` tokens are available and consume them.
    ///
    /// Returns immediately when unlimited or when `bytes` is 0. Partial
    /// consumption is allowed while waiting, so large articles make progress
    /// under small buckets instead of starving.
    pub async fn acquire(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }

        if self.rate_bps.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut remaining = bytes;

        loop {
            // Re-read the rate each iteration so dynamic changes take effect
            let rate = self.rate_bps.load(Ordering::Relaxed);
            if rate == 0 {
                // Limit was removed while we were waiting
                return;
            }

            self.refill_tokens();

            let current = self.tokens.load(Ordering::SeqCst);
            let to_consume = remaining.min(current);

            if to_consume > 0 {
                if self
                    .tokens
                    .compare_exchange(
                        current,
                        current - to_consume,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    remaining -= to_consume;
                    if remaining == 0 {
                        return;
                    }
                }
                // CAS lost or tokens still owed
                continue;
            }

            // Empty bucket. Sleep roughly until enough tokens accrue, capped
            // at 100ms so rate changes are picked up promptly.
            let wait_ms = (remaining as f64 / rate as f64 * 1000.0) as u64;
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(10, 100))).await;
        }
    }

    /// Refill tokens based on elapsed time since the last refill.
    fn refill_tokens(&self) {
        let rate = self.rate_bps.load(Ordering::Relaxed);
        if rate == 0 {
            return;
        }

        let now = Self::now_nanos();
        let last = self.last_refill.load(Ordering::SeqCst);

        let elapsed_secs = now.saturating_sub(last) as f64 / 1_000_000_000.0;
        let tokens_to_add = (rate as f64 * elapsed_secs) as u64;

        if tokens_to_add > 0
            && self
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            // Bucket capacity is one second of rate
            let current = self.tokens.load(Ordering::SeqCst);
            let new_tokens = (current + tokens_to_add).min(rate);
            self.tokens.store(new_tokens, Ordering::SeqCst);
        }
    }

    /// Monotonic time in nanoseconds since an arbitrary process-local epoch.
    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}
