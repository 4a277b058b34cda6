//! Core types for usenet-post

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Unique identifier for a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    /// Create a new JobId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<JobId> for i64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for JobId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Unique identifier for a pending article check
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckId(pub i64);

impl CheckId {
    /// Create a new CheckId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for CheckId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<sqlx::Sqlite> for CheckId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for CheckId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for CheckId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Job state — exactly one state holds a job at any instant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed by a worker
    Pending,
    /// Claimed by a worker, not yet settled
    InProgress,
    /// Posted successfully, NZB written
    Completed,
    /// Terminal failure (or cancelled)
    Errored,
}

impl JobState {
    /// Convert integer state code to JobState enum
    pub fn from_i32(state: i32) -> Self {
        match state {
            0 => JobState::Pending,
            1 => JobState::InProgress,
            2 => JobState::Completed,
            3 => JobState::Errored,
            _ => JobState::Errored, // Default to Errored for unknown state
        }
    }

    /// Convert JobState enum to integer state code
    pub fn to_i32(&self) -> i32 {
        match self {
            JobState::Pending => 0,
            JobState::InProgress => 1,
            JobState::Completed => 2,
            JobState::Errored => 3,
        }
    }
}

/// Post-upload script sub-state on a completed job
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStatus {
    /// No script configured, or never attempted
    #[default]
    None,
    /// Script failed and is scheduled for another attempt
    PendingRetry,
    /// Script ran to completion with exit code 0
    Completed,
    /// Script exhausted its retry budget
    FailedPermanent,
}

impl ScriptStatus {
    /// Convert integer status code to ScriptStatus enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => ScriptStatus::None,
            1 => ScriptStatus::PendingRetry,
            2 => ScriptStatus::Completed,
            3 => ScriptStatus::FailedPermanent,
            _ => ScriptStatus::None,
        }
    }

    /// Convert ScriptStatus enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            ScriptStatus::None => 0,
            ScriptStatus::PendingRetry => 1,
            ScriptStatus::Completed => 2,
            ScriptStatus::FailedPermanent => 3,
        }
    }
}

/// Aggregate verification status of a completed job's deferred checks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// No deferred verification was requested
    #[default]
    None,
    /// Checks exist and some are still pending
    Pending,
    /// All checks verified
    Verified,
    /// At least one check exhausted its retries
    Failed,
}

impl VerificationStatus {
    /// Convert integer status code to VerificationStatus enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => VerificationStatus::None,
            1 => VerificationStatus::Pending,
            2 => VerificationStatus::Verified,
            3 => VerificationStatus::Failed,
            _ => VerificationStatus::None,
        }
    }

    /// Convert VerificationStatus enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            VerificationStatus::None => 0,
            VerificationStatus::Pending => 1,
            VerificationStatus::Verified => 2,
            VerificationStatus::Failed => 3,
        }
    }
}

/// Status of an individual pending article check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Not yet resolved
    Pending,
    /// Article confirmed retrievable
    Verified,
    /// Retries exhausted without the article appearing
    Failed,
}

impl CheckStatus {
    /// Convert integer status code to CheckStatus enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => CheckStatus::Pending,
            1 => CheckStatus::Verified,
            2 => CheckStatus::Failed,
            _ => CheckStatus::Failed,
        }
    }

    /// Convert CheckStatus enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            CheckStatus::Pending => 0,
            CheckStatus::Verified => 1,
            CheckStatus::Failed => 2,
        }
    }
}

/// Stage a running job is currently in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    /// Generating PAR2 recovery files
    Par2Generation,
    /// Posting articles
    Uploading,
    /// Verifying posted articles
    Checking,
}

/// Observer-visible progress snapshot for a running job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Stage this snapshot describes
    pub kind: ProgressKind,
    /// Units completed (percent for PAR2, articles otherwise)
    pub current: u64,
    /// Total units
    pub total: u64,
    /// Completion percentage (0.0 to 100.0)
    pub current_percent: f32,
    /// Time elapsed in this stage
    pub elapsed: Duration,
    /// Estimated remaining time, when the rate is meaningful
    pub estimated_remaining: Option<Duration>,
    /// Current throughput in bytes per second (0 for PAR2 generation)
    pub rate_bps: u64,
    /// Whether the processor is currently paused
    pub is_paused: bool,
}

/// Summary of a job currently being processed
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunningJobInfo {
    /// Job ID
    pub id: JobId,
    /// Source path being posted
    pub path: PathBuf,
    /// Latest progress snapshot
    pub progress: ProgressSnapshot,
}

/// Queue statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting to be claimed
    pub pending: u64,
    /// Jobs claimed but not settled
    pub in_progress: u64,
    /// Successfully posted jobs
    pub completed: u64,
    /// Terminally failed jobs
    pub errored: u64,
    /// Sum of all states
    pub total: u64,
}

/// Event emitted during the posting lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job added to the queue
    JobQueued {
        /// Job ID
        id: JobId,
        /// Source path
        path: PathBuf,
    },

    /// Job claimed by a worker and started
    JobStarted {
        /// Job ID
        id: JobId,
    },

    /// PAR2 generation progress
    Par2Progress {
        /// Job ID
        id: JobId,
        /// Completion percentage (0.0 to 100.0)
        percent: f32,
    },

    /// Upload progress update
    UploadProgress {
        /// Job ID
        id: JobId,
        /// Articles posted so far
        posted: u64,
        /// Total articles in the job
        total: u64,
        /// Current throughput in bytes per second
        rate_bps: u64,
    },

    /// Verification progress update
    CheckProgress {
        /// Job ID
        id: JobId,
        /// Articles checked so far
        checked: u64,
        /// Total articles being checked
        total: u64,
    },

    /// Job completed and NZB written
    JobCompleted {
        /// Job ID
        id: JobId,
        /// Path of the written NZB
        nzb_path: PathBuf,
    },

    /// Job settled as errored
    JobFailed {
        /// Job ID
        id: JobId,
        /// Error message
        error: String,
    },

    /// Job removed from the queue
    JobRemoved {
        /// Job ID
        id: JobId,
    },

    /// Operator paused the processor
    QueuePaused,

    /// Operator resumed the processor
    QueueResumed,

    /// Processor paused itself due to an environmental condition
    AutoPaused {
        /// Human-readable trigger description
        reason: String,
    },

    /// Auto-pause condition cleared
    AutoResumed,

    /// Post-upload script failed (will retry unless permanent)
    ScriptFailed {
        /// Job ID
        id: JobId,
        /// Exit code (if the process ran)
        exit_code: Option<i32>,
        /// Whether the retry budget is exhausted
        permanent: bool,
    },

    /// Post-upload script completed successfully
    ScriptCompleted {
        /// Job ID
        id: JobId,
    },

    /// A deferred article check was verified
    CheckVerified {
        /// Check ID
        id: CheckId,
        /// Parent job ID
        job_id: JobId,
    },

    /// A deferred article check exhausted its retries
    CheckFailed {
        /// Check ID
        id: CheckId,
        /// Parent job ID
        job_id: JobId,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_roundtrip() {
        for state in [
            JobState::Pending,
            JobState::InProgress,
            JobState::Completed,
            JobState::Errored,
        ] {
            assert_eq!(JobState::from_i32(state.to_i32()), state);
        }
        // Unknown codes degrade to Errored
        assert_eq!(JobState::from_i32(99), JobState::Errored);
    }

    #[test]
    fn script_status_roundtrip() {
        for status in [
            ScriptStatus::None,
            ScriptStatus::PendingRetry,
            ScriptStatus::Completed,
            ScriptStatus::FailedPermanent,
        ] {
            assert_eq!(ScriptStatus::from_i32(status.to_i32()), status);
        }
    }

    #[test]
    fn job_id_parses_and_displays() {
        let id: JobId = "42".parse().unwrap();
        assert_eq!(id, JobId(42));
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::JobQueued {
            id: JobId(7),
            path: PathBuf::from("/watch/a.bin"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"job_queued\""));
        assert!(json.contains("\"id\":7"));
    }
}
