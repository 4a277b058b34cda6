//! # usenet-post
//!
//! Highly configurable backend library for Usenet binary posting.
//!
//! ## Design Philosophy
//!
//! usenet-post is designed to be:
//! - **Highly configurable** - Almost every behavior can be customized
//! - **Durable** - Jobs survive crashes with at-least-once semantics
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! The engine ingests local files, chunks them into NNTP articles, uploads
//! them through a caller-supplied connection pool, optionally generates PAR2
//! recovery files, verifies that posted articles became retrievable, and
//! emits an NZB index describing the post.
//!
//! ## Quick Start
//!
//! ```no_run
//! use usenet_post::{Config, Processor, ServerConfig};
//! use usenet_post::config::PostingConfig;
//! use std::sync::Arc;
//!
//! # fn make_pool() -> Arc<dyn usenet_post::ConnectionPool> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         servers: vec![ServerConfig {
//!             host: "news.example.com".to_string(),
//!             port: 563,
//!             username: Some("user".to_string()),
//!             password: Some("pass".to_string()),
//!             tls: true,
//!             insecure_tls: false,
//!             max_connections: 10,
//!             max_idle_seconds: 300,
//!             max_ttl_seconds: 3600,
//!         }],
//!         posting: PostingConfig {
//!             groups: vec!["alt.binaries.test".to_string()],
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     };
//!
//!     let pool = make_pool(); // your NNTP transport behind the pool trait
//!     let processor = Arc::new(Processor::new(config, pool).await?);
//!
//!     // Subscribe to events
//!     let mut events = processor.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let _handles = processor.start_all()?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Persistent job queue
pub mod db;
/// Error types
pub mod error;
/// NZB index generation
pub mod nzb;
/// PAR2 recovery file generation
pub mod par2;
/// NNTP connection pool contract
pub mod pool;
/// Article production and upload
pub mod poster;
/// Job orchestration and control surface
pub mod processor;
/// Retry logic with exponential backoff
pub mod retry;
/// Upload byte-rate throttling
pub mod throttle;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;
/// Watch-directory scanning
pub mod watcher;
/// yEnc encoding
pub mod yenc;

// Re-export commonly used types
pub use config::{Config, ObfuscationPolicy, ServerConfig};
pub use db::Queue;
pub use error::{Error, Par2Error, PoolError, PostError, QueueError, Result, ScriptError};
pub use pool::{ArticlePayload, ConnectionPool, PoolMetrics, PoolMetricsSnapshot, StatOutcome};
pub use processor::Processor;
pub use throttle::Throttle;
pub use types::{
    Event, JobId, JobState, ProgressKind, ProgressSnapshot, QueueStats, RunningJobInfo,
    ScriptStatus, VerificationStatus,
};
pub use watcher::DirectoryWatcher;

/// Helper function to run the processor with graceful signal handling.
///
/// Waits for a termination signal and then calls the processor's
/// `shutdown()` method, leaving interrupted jobs for crash recovery at the
/// next startup.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(processor: Processor) -> Result<()> {
    wait_for_signal().await;
    processor.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
