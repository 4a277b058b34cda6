//! Configuration types for usenet-post

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// NNTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for unencrypted, 563 for TLS)
    pub port: u16,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Use TLS (implicit TLS, not STARTTLS)
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Skip TLS certificate validation
    #[serde(default)]
    pub insecure_tls: bool,

    /// Maximum number of connections to this provider
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Close idle connections after this many seconds
    #[serde(default = "default_max_idle_seconds")]
    pub max_idle_seconds: u64,

    /// Recycle connections after this many seconds regardless of activity
    #[serde(default = "default_max_ttl_seconds")]
    pub max_ttl_seconds: u64,
}

/// Connection pool tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Minimum warm connections the pool keeps open
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// Interval between pool health checks
    #[serde(default = "default_health_check_interval", with = "duration_serde")]
    pub health_check_interval: Duration,

    /// Skip the provider reachability probe when the pool is created
    #[serde(default)]
    pub skip_providers_verification_on_creation: bool,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            health_check_interval: default_health_check_interval(),
            skip_providers_verification_on_creation: false,
        }
    }
}

/// Message-ID generation policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageIdFormat {
    /// Random 32-character local part with an 8.3 domain (default)
    #[default]
    Random,
    /// Seed-derived IDs carrying an NXG header on the first article
    Ngx,
}

/// How subjects, filenames, posters, and dates are rewritten
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObfuscationPolicy {
    /// Leave subject and filename as-is (default)
    #[default]
    None,
    /// Hash the filename (and, with random message-IDs, the subject)
    Partial,
    /// Fresh random subject, filename, poster, and date per article
    Full,
}

/// Which newsgroups each file is posted to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicy {
    /// Cross-post every article to all configured groups (default)
    #[default]
    All,
    /// Pick one random group per file
    EachFile,
}

/// A custom header attached to every posted article
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomHeader {
    /// Header name (e.g., "X-Uploader")
    pub name: String,
    /// Header value
    pub value: String,
}

/// Article header construction options
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PostHeadersConfig {
    /// Attach the NXG header when the policy allows it
    #[serde(default)]
    pub add_ngx_header: bool,

    /// Fixed From header; a random synthetic address is generated when unset
    #[serde(default)]
    pub default_from: Option<String>,

    /// Extra headers attached to every article
    #[serde(default)]
    pub custom_headers: Vec<CustomHeader>,
}

/// Posting behavior configuration (segmentation, workers, headers, obfuscation)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostingConfig {
    /// Finish PAR2 generation before posting begins (default: true).
    ///
    /// `false` is accepted for compatibility but treated as `true`: recovery
    /// files must be fully staged before the NZB can reference them.
    #[serde(default = "default_true")]
    pub wait_for_par2: bool,

    /// Retry attempts for a failed article post beyond the pool's own retries
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between processor-level retry attempts
    #[serde(default = "default_retry_delay", with = "duration_serde")]
    pub retry_delay: Duration,

    /// Segment size in bytes; each segment becomes one article (default: 750 KiB)
    #[serde(default = "default_article_size")]
    pub article_size_in_bytes: u64,

    /// Newsgroups to post to (at least one required)
    #[serde(default)]
    pub groups: Vec<String>,

    /// Upload throttle in bytes per second (0 = unlimited)
    #[serde(default)]
    pub throttle_rate: u64,

    /// Concurrent post workers; 0 means the sum of provider connection caps
    #[serde(default)]
    pub max_workers: usize,

    /// Message-ID generation policy
    #[serde(default)]
    pub message_id_format: MessageIdFormat,

    /// Article header construction options
    #[serde(default)]
    pub post_headers: PostHeadersConfig,

    /// Obfuscation applied to data files
    #[serde(default)]
    pub obfuscation_policy: ObfuscationPolicy,

    /// Obfuscation applied to PAR2 files
    #[serde(default)]
    pub par2_obfuscation_policy: ObfuscationPolicy,

    /// Group selection policy
    #[serde(default)]
    pub group_policy: GroupPolicy,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            wait_for_par2: true,
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            article_size_in_bytes: default_article_size(),
            groups: Vec::new(),
            throttle_rate: 0,
            max_workers: 0,
            message_id_format: MessageIdFormat::default(),
            post_headers: PostHeadersConfig::default(),
            obfuscation_policy: ObfuscationPolicy::default(),
            par2_obfuscation_policy: ObfuscationPolicy::default(),
            group_policy: GroupPolicy::default(),
        }
    }
}

/// Post-verification configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostCheckConfig {
    /// Verify posted articles via STAT
    #[serde(default)]
    pub enabled: bool,

    /// Use the deferred check path instead of synchronous in-poster checks.
    ///
    /// Exactly one path is active per job: with `false` (default) the poster
    /// stats every article before releasing the file and re-posts failures;
    /// with `true` the checks are persisted and resolved by the background
    /// sweeper after the job completes.
    #[serde(default)]
    pub deferred: bool,

    /// Wait before the first verification pass (propagation delay)
    #[serde(default = "default_check_delay", with = "duration_serde")]
    pub delay: Duration,

    /// Re-posts allowed per file before verification gives up
    #[serde(default = "default_max_reposts")]
    pub max_reposts: u32,
}

impl Default for PostCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            deferred: false,
            delay: default_check_delay(),
            max_reposts: default_max_reposts(),
        }
    }
}

/// PAR2 recovery file generation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Par2Config {
    /// Generate recovery files before posting
    #[serde(default)]
    pub enabled: bool,

    /// Path to the par2 (or parpar) binary; searched on PATH when unset
    #[serde(default)]
    pub par2_path: Option<PathBuf>,

    /// Redundancy percentage
    #[serde(default = "default_redundancy")]
    pub redundancy: u32,

    /// Recovery block size in bytes
    #[serde(default = "default_volume_size")]
    pub volume_size: u64,

    /// Maximum input slices the binary accepts
    #[serde(default = "default_max_input_slices")]
    pub max_input_slices: u32,

    /// Extra command-line options passed through verbatim
    #[serde(default)]
    pub extra_par2_options: Vec<String>,

    /// Directory where recovery files are staged before posting
    #[serde(default = "default_par2_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for Par2Config {
    fn default() -> Self {
        Self {
            enabled: false,
            par2_path: None,
            redundancy: default_redundancy(),
            volume_size: default_volume_size(),
            max_input_slices: default_max_input_slices(),
            extra_par2_options: Vec::new(),
            temp_dir: default_par2_temp_dir(),
        }
    }
}

/// Daily scan window for the watcher; a window spanning midnight is allowed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    /// Start of the window (HH:MM:SS, 24-hour format)
    #[serde(with = "time_format")]
    pub start_time: NaiveTime,

    /// End of the window (HH:MM:SS, 24-hour format)
    #[serde(with = "time_format")]
    pub end_time: NaiveTime,
}

impl ScheduleWindow {
    /// Whether `time` falls inside the window, handling midnight crossing
    /// (e.g., 22:00 to 06:00).
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start_time <= self.end_time {
            time >= self.start_time && time < self.end_time
        } else {
            time >= self.start_time || time < self.end_time
        }
    }
}

/// Watch-directory configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Enable the directory watcher
    #[serde(default)]
    pub enabled: bool,

    /// Directory scanned for new files
    #[serde(default = "default_watch_directory")]
    pub watch_directory: PathBuf,

    /// Files below this size are deferred to a later scan
    #[serde(default)]
    pub size_threshold: u64,

    /// Files below this size are never enqueued
    #[serde(default)]
    pub min_file_size: u64,

    /// Interval between scans
    #[serde(default = "default_check_interval", with = "duration_serde")]
    pub check_interval: Duration,

    /// Glob patterns matched against base names; matches are skipped
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Optional daily scan window
    #[serde(default)]
    pub schedule: Option<ScheduleWindow>,

    /// Delete the source file after a successful post.
    ///
    /// Also switches the watcher to the allow-duplicate enqueue path so a
    /// re-created file with the same name can be posted again.
    #[serde(default)]
    pub delete_original_file: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            watch_directory: default_watch_directory(),
            size_threshold: 0,
            min_file_size: 0,
            check_interval: default_check_interval(),
            ignore_patterns: Vec::new(),
            schedule: None,
            delete_original_file: false,
        }
    }
}

/// NZB compression codec
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    /// Plain XML (default)
    #[default]
    None,
    /// Zstandard, `.nzb.zst`
    Zstd,
    /// Brotli, `.nzb.br`
    Brotli,
}

/// NZB output compression configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NzbCompressionConfig {
    /// Compress written NZB files
    #[serde(default)]
    pub enabled: bool,

    /// Codec to use when enabled
    #[serde(default)]
    pub r#type: CompressionType,

    /// Codec-specific compression level
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

/// Persistent queue configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Jobs allowed in the uploading stage simultaneously
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,

    /// Auto-pause when free space at the output directory drops below this
    #[serde(default = "default_min_free_disk_space")]
    pub min_free_disk_space: u64,

    /// Delete completed rows (and their NZB files) older than this many days;
    /// 0 disables retention cleanup
    #[serde(default)]
    pub completed_retention_days: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            min_free_disk_space: default_min_free_disk_space(),
            completed_retention_days: 0,
        }
    }
}

/// Post-upload hook configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostUploadScriptConfig {
    /// Run the hook after each successful post
    #[serde(default)]
    pub enabled: bool,

    /// Command line; `$NZB_PATH` and `$FILE_PATH` are interpolated
    #[serde(default)]
    pub command: String,

    /// Kill the hook after this long
    #[serde(default = "default_script_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Retries before the hook is marked permanently failed
    #[serde(default = "default_script_max_retries")]
    pub max_retries: u32,

    /// Base delay for the exponential retry schedule
    #[serde(default = "default_script_base_delay", with = "duration_serde")]
    pub base_delay: Duration,

    /// Cap on the computed retry delay
    #[serde(default = "default_script_max_delay", with = "duration_serde")]
    pub max_delay: Duration,
}

impl Default for PostUploadScriptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: String::new(),
            timeout: default_script_timeout(),
            max_retries: default_script_max_retries(),
            base_delay: default_script_base_delay(),
            max_delay: default_script_max_delay(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Main configuration for the posting engine
///
/// Fields are organized into logical sub-configs:
/// - [`servers`](ServerConfig) — NNTP providers and per-provider caps
/// - [`posting`](PostingConfig) — segmentation, headers, obfuscation, workers
/// - [`post_check`](PostCheckConfig) — verification policy
/// - [`par2`](Par2Config) — external recovery file generation
/// - [`watcher`](WatcherConfig) — watch-directory ingestion
/// - [`queue`](QueueConfig) — persistence and concurrency
/// - [`post_upload_script`](PostUploadScriptConfig) — completion hook
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// NNTP server configurations (at least one required to post)
    pub servers: Vec<ServerConfig>,

    /// Connection pool tuning
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,

    /// Posting behavior
    #[serde(default)]
    pub posting: PostingConfig,

    /// Post-verification policy
    #[serde(default)]
    pub post_check: PostCheckConfig,

    /// PAR2 recovery file generation
    #[serde(default)]
    pub par2: Par2Config,

    /// Watch-directory ingestion
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// NZB output compression
    #[serde(default)]
    pub nzb_compression: NzbCompressionConfig,

    /// Persistent queue settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Post-upload hook
    #[serde(default)]
    pub post_upload_script: PostUploadScriptConfig,

    /// Directory NZB files are written under
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Keep the original file extension on obfuscated subject filenames
    #[serde(default)]
    pub maintain_original_extension: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            connection_pool: ConnectionPoolConfig::default(),
            posting: PostingConfig::default(),
            post_check: PostCheckConfig::default(),
            par2: Par2Config::default(),
            watcher: WatcherConfig::default(),
            nzb_compression: NzbCompressionConfig::default(),
            queue: QueueConfig::default(),
            post_upload_script: PostUploadScriptConfig::default(),
            output_dir: default_output_dir(),
            maintain_original_extension: false,
        }
    }
}

impl Config {
    /// Effective post worker count: the configured override, or the sum of
    /// provider connection caps.
    pub fn effective_max_workers(&self) -> usize {
        if self.posting.max_workers > 0 {
            self.posting.max_workers
        } else {
            self.servers
                .iter()
                .map(|s| s.max_connections)
                .sum::<usize>()
                .max(1)
        }
    }

    /// Validate settings that cannot be expressed through types alone.
    pub fn validate(&self) -> crate::Result<()> {
        if self.posting.article_size_in_bytes == 0 {
            return Err(crate::Error::Config {
                message: "article size must be positive".to_string(),
                key: Some("posting.article_size_in_bytes".to_string()),
            });
        }
        if self.posting.groups.is_empty() {
            return Err(crate::Error::Config {
                message: "at least one newsgroup is required".to_string(),
                key: Some("posting.groups".to_string()),
            });
        }
        if self.queue.max_concurrent_uploads == 0 {
            return Err(crate::Error::Config {
                message: "max_concurrent_uploads must be at least 1".to_string(),
                key: Some("queue.max_concurrent_uploads".to_string()),
            });
        }
        if self.par2.enabled && self.par2.volume_size == 0 {
            return Err(crate::Error::Config {
                message: "par2 volume size must be positive".to_string(),
                key: Some("par2.volume_size".to_string()),
            });
        }
        if self.post_upload_script.enabled && self.post_upload_script.command.trim().is_empty() {
            return Err(crate::Error::Config {
                message: "post-upload script enabled without a command".to_string(),
                key: Some("post_upload_script.command".to_string()),
            });
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    10
}

fn default_max_idle_seconds() -> u64 {
    300
}

fn default_max_ttl_seconds() -> u64 {
    3600
}

fn default_min_connections() -> usize {
    1
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_article_size() -> u64 {
    768_000
}

fn default_check_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_max_reposts() -> u32 {
    1
}

fn default_redundancy() -> u32 {
    10
}

fn default_volume_size() -> u64 {
    768_000
}

fn default_max_input_slices() -> u32 {
    4000
}

fn default_par2_temp_dir() -> PathBuf {
    PathBuf::from("./par2-temp")
}

fn default_watch_directory() -> PathBuf {
    PathBuf::from("./watch")
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_compression_level() -> i32 {
    3
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./usenet-post.db")
}

fn default_max_concurrent_uploads() -> usize {
    1
}

fn default_min_free_disk_space() -> u64 {
    256 * 1024 * 1024 // 256 MB
}

fn default_script_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_script_max_retries() -> u32 {
    5
}

fn default_script_base_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_script_max_delay() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./nzbs")
}

/// Serde module for serializing/deserializing Duration as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde module for serializing/deserializing NaiveTime as HH:MM:SS strings
mod time_format {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = time.format("%H:%M:%S").to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, "%H:%M:%S").map_err(serde::de::Error::custom)
    }
}
