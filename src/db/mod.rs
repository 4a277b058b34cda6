//! Persistent queue for usenet-post
//!
//! Handles SQLite persistence for the job queue and the deferred article
//! check sub-store. A job lives in exactly one of four states (pending,
//! in-progress, completed, errored); the `in_progress` state doubles as the
//! crash-recovery shadow that [`Queue::recover`] reaps at startup.
//!
//! ## Submodules
//!
//! Methods on [`Queue`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations, version gate
//! - [`jobs`] — Job state machine (enqueue/claim/complete/fail/...)
//! - [`checks`] — Deferred per-article verification rows

use crate::types::{JobId, JobState, ScriptStatus, VerificationStatus};
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;

mod checks;
mod jobs;
mod migrations;

pub use jobs::{JobSortField, ListFilter};

/// New job to be inserted into the queue
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Absolute source path
    pub path: String,
    /// Size in bytes, fixed at enqueue time
    pub size_bytes: i64,
    /// Priority (higher first)
    pub priority: i32,
    /// Times this job has been re-queued after a failure
    pub retry_count: i32,
    /// Opaque payload sufficient to reconstruct the job for retry/recovery
    pub payload: String,
}

/// Job record from the database
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    /// Unique database ID, stable across state transitions
    pub id: i64,
    /// Absolute source path
    pub path: String,
    /// Size in bytes, fixed at enqueue time
    pub size_bytes: i64,
    /// Priority (higher first)
    pub priority: i32,
    /// Times this job has been re-queued after a failure
    pub retry_count: i32,
    /// Current state (see [`JobState`])
    pub state: i32,
    /// Opaque payload sufficient to reconstruct the job
    pub payload: String,
    /// Unix timestamp when the job was enqueued
    pub created_at: i64,
    /// Unix timestamp of the last state transition
    pub updated_at: i64,
    /// Unix timestamp when the job completed
    pub completed_at: Option<i64>,
    /// Unix timestamp when the job errored
    pub errored_at: Option<i64>,
    /// Path of the written NZB (completed jobs only)
    pub nzb_path: Option<String>,
    /// Error message (errored jobs only)
    pub error_message: Option<String>,
    /// Post-upload script sub-state (see [`ScriptStatus`])
    pub script_status: i32,
    /// Script retry attempts so far
    pub script_retry_count: i32,
    /// Last script failure message
    pub script_last_error: Option<String>,
    /// Unix timestamp of the next scheduled script attempt
    pub script_next_retry_at: Option<i64>,
    /// Unix timestamp of the first script failure
    pub script_first_failure_at: Option<i64>,
    /// Aggregate deferred verification status (see [`VerificationStatus`])
    pub verification_status: i32,
}

impl JobRow {
    /// Typed job ID
    pub fn job_id(&self) -> JobId {
        JobId(self.id)
    }

    /// Typed job state
    pub fn job_state(&self) -> JobState {
        JobState::from_i32(self.state)
    }

    /// Typed script status
    pub fn script_status(&self) -> ScriptStatus {
        ScriptStatus::from_i32(self.script_status)
    }

    /// Typed verification status
    pub fn verification_status(&self) -> VerificationStatus {
        VerificationStatus::from_i32(self.verification_status)
    }

    /// Source path as a `PathBuf`
    pub fn source_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }
}

/// New deferred article check to be inserted in bulk on job completion
#[derive(Debug, Clone)]
pub struct NewCheck {
    /// Message-ID to verify
    pub message_id: String,
    /// Groups the article was posted to (ordered)
    pub groups: Vec<String>,
}

/// Deferred article check record from the database
#[derive(Debug, Clone, FromRow)]
pub struct CheckRow {
    /// Unique database ID
    pub id: i64,
    /// Completed job this check belongs to
    pub job_id: i64,
    /// Message-ID to verify
    pub message_id: String,
    /// Groups as a JSON array of strings
    pub groups: String,
    /// Check status (see [`crate::types::CheckStatus`])
    pub status: i32,
    /// Verification attempts so far
    pub retry_count: i32,
    /// Unix timestamp this check becomes due
    pub next_retry_at: i64,
    /// Unix timestamp of the first failed verification
    pub first_failure_at: Option<i64>,
    /// Unix timestamp of the last verification attempt
    pub last_checked_at: Option<i64>,
}

impl CheckRow {
    /// Decode the JSON group list.
    pub fn group_list(&self) -> Vec<String> {
        serde_json::from_str(&self.groups).unwrap_or_default()
    }
}

/// Per-job aggregate of deferred check states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckCounts {
    /// All checks for the job
    pub total: u64,
    /// Checks not yet resolved
    pub pending: u64,
    /// Checks that exhausted their retries
    pub failed: u64,
}

/// Persistent queue handle for usenet-post
#[derive(Debug)]
pub struct Queue {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
