//! Error types for usenet-post
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error types (Queue, Post, Par2, Script, Pool)
//! - Transient/permanent classification consumed by [`crate::retry`]
//! - Context information (job ID, file path, message-ID, exit codes)

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for usenet-post operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-post
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "posting.article_size_in_bytes")
        key: Option<String>,
    },

    /// Queue/database operation failed
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Connection pool error (post or stat against a provider)
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Posting error
    #[error("post error: {0}")]
    Post(#[from] PostError),

    /// PAR2 recovery file generation error
    #[error("par2 error: {0}")]
    Par2(#[from] Par2Error),

    /// Post-upload script error
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory watcher error
    #[error("watch error: {0}")]
    Watch(String),

    /// NZB writing error
    #[error("NZB error: {0}")]
    Nzb(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job was cancelled by the operator
    #[error("cancelled")]
    Cancelled,

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Failed to check disk space
    #[error("failed to check disk space: {0}")]
    DiskSpaceCheckFailed(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Queue/database-related errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Database schema is newer than this binary supports
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew {
        /// Version found in the database
        found: i64,
        /// Highest version this binary knows how to run
        supported: i64,
    },

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Path is already present in the queue
    #[error("duplicate path: {}", .0.display())]
    DuplicatePath(PathBuf),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Job is not in the in-progress state
    #[error("job {0} is not in progress")]
    NotInProgress(i64),
}

/// Errors surfaced by the NNTP connection pool collaborator
///
/// The pool performs its own internal retries; by the time one of these
/// reaches the poster the classification is final.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Transient failure (timeout, connection reset, server busy)
    #[error("transient pool failure: {0}")]
    Transient(String),

    /// Authentication rejected by the provider
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Article permanently rejected by the server
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Pool has been shut down
    #[error("connection pool closed")]
    Closed,
}

/// Posting errors
#[derive(Debug, Error)]
pub enum PostError {
    /// Failed to read a window of the source file
    #[error("failed to read {} at offset {offset}: {reason}", path.display())]
    SourceRead {
        /// Source file being posted
        path: PathBuf,
        /// Byte offset of the failed read
        offset: u64,
        /// Underlying I/O failure
        reason: String,
    },

    /// An article was rejected and the pool's retries were exhausted
    #[error("article {message_id} rejected: {reason}")]
    ArticleRejected {
        /// Message-ID of the rejected article
        message_id: String,
        /// Rejection reason from the pool
        reason: String,
    },

    /// Verification found missing articles after the re-post budget was spent
    #[error("{failed} article(s) still unverifiable for {} after {reposts} re-post(s)", file.display())]
    RepostsExhausted {
        /// File whose articles could not be verified
        file: PathBuf,
        /// Number of articles still missing
        failed: usize,
        /// Re-posts attempted
        reposts: u32,
    },

    /// A worker panicked or its result channel closed unexpectedly
    #[error("post worker failed: {0}")]
    WorkerFailed(String),
}

/// PAR2 process errors, mapped from the external binary's exit codes
#[derive(Debug, Error)]
pub enum Par2Error {
    /// Failed to spawn the PAR2 binary
    #[error("failed to execute par2 binary: {0}")]
    Spawn(String),

    /// Exit code 1: damage detected, repair is possible
    #[error("par2 reported repairable damage")]
    RepairPossible,

    /// Exit code 2: damage detected, repair is not possible
    #[error("par2 reported unrepairable damage")]
    RepairImpossible,

    /// Exit code 3: invalid command-line arguments
    #[error("par2 rejected its arguments: {0}")]
    InvalidArguments(String),

    /// Exit code 4: insufficient critical data to verify
    #[error("par2 has insufficient critical data")]
    InsufficientData,

    /// Exit code 5: repair attempted and failed
    #[error("par2 repair failed")]
    RepairFailed,

    /// Exit code 6: file I/O error
    #[error("par2 file I/O error")]
    FileIo,

    /// Exit code 7: internal logic error
    #[error("par2 internal logic error")]
    Logic,

    /// Exit code 8: out of memory
    #[error("par2 ran out of memory")]
    OutOfMemory,

    /// Any other nonzero exit code
    #[error("par2 exited with unexpected code {code}: {stderr}")]
    Unexpected {
        /// Raw exit code
        code: i32,
        /// Captured stderr tail
        stderr: String,
    },
}

impl Par2Error {
    /// Map a PAR2 process exit code to an error, or `None` for success.
    pub fn from_exit_code(code: i32, stderr: &str) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Par2Error::RepairPossible),
            2 => Some(Par2Error::RepairImpossible),
            3 => Some(Par2Error::InvalidArguments(stderr.to_string())),
            4 => Some(Par2Error::InsufficientData),
            5 => Some(Par2Error::RepairFailed),
            6 => Some(Par2Error::FileIo),
            7 => Some(Par2Error::Logic),
            8 => Some(Par2Error::OutOfMemory),
            other => Some(Par2Error::Unexpected {
                code: other,
                stderr: stderr.to_string(),
            }),
        }
    }
}

/// Post-upload script errors
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Failed to spawn the script
    #[error("failed to spawn script: {0}")]
    Spawn(String),

    /// Script exited with a nonzero status
    #[error("script exited with status {code}")]
    NonZeroExit {
        /// Exit code reported by the process (or -1 when killed by signal)
        code: i32,
    },

    /// Script exceeded its configured timeout
    #[error("script timed out after {timeout_secs}s")]
    Timeout {
        /// Configured timeout in seconds
        timeout_secs: u64,
    },
}

impl Error {
    /// Whether this error should route the job to the errored table immediately,
    /// bypassing the processor's re-queue path.
    ///
    /// Cancellation, configuration problems, and unreadable sources are never
    /// worth re-posting; transient pool and I/O failures are.
    pub fn is_permanent_for_job(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Config { .. } => true,
            Error::Par2(_) => true,
            Error::Post(PostError::SourceRead { .. }) => true,
            Error::Post(PostError::RepostsExhausted { .. }) => true,
            Error::Pool(PoolError::Auth(_)) => true,
            Error::Pool(PoolError::Permanent(_)) => true,
            _ => false,
        }
    }
}
