//! Configuration types for replay-archiver

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

/// Placeholder substituted with the replay ID in [`SourceConfig::base_url`]
pub const ID_PLACEHOLDER: &str = "{id}";

/// Main configuration for the archiver
///
/// Fields are organized into logical sub-configs:
/// - [`source`](SourceConfig) - remote endpoint, classification, request pacing
/// - [`storage`](StorageConfig) - ledger database and blob directory
/// - [`archive`](ArchiveConfig) - ID range, concurrency, tombstone cooldown
/// - [`retry`](RetryConfig) - backoff for transient failures
///
/// Every section may be omitted from a TOML file; missing values fall back to defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote endpoint settings
    #[serde(default)]
    pub source: SourceConfig,

    /// Local persistence settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Run behaviour settings
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Backoff for transient failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Load a configuration from a TOML file and validate it
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read config file '{}': {}", path.display(), e),
            key: None,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|e| Error::Config {
            message: format!("failed to parse config file '{}': {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;

        if self.storage.blob_extension.is_empty()
            || !self
                .storage
                .blob_extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::config(
                "storage.blob_extension",
                format!(
                    "extension must be non-empty ASCII alphanumeric, got '{}'",
                    self.storage.blob_extension
                ),
            ));
        }

        if self.archive.concurrency == 0 {
            return Err(Error::config(
                "archive.concurrency",
                "at least one worker is required",
            ));
        }
        if let Some(end) = self.archive.end_id
            && end < self.archive.start_id
        {
            return Err(Error::InvalidRange {
                start: self.archive.start_id,
                end,
            });
        }
        if self.archive.rediscover_interval.is_zero() {
            return Err(Error::config(
                "archive.rediscover_interval",
                "interval must be greater than zero",
            ));
        }
        if self.archive.max_consecutive_storage_errors == 0 {
            return Err(Error::config(
                "archive.max_consecutive_storage_errors",
                "must be at least 1",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::config(
                "retry.max_attempts",
                "at least one attempt is required",
            ));
        }
        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "retry.backoff_multiplier",
                format!(
                    "multiplier must be >= 1.0, got {}",
                    self.retry.backoff_multiplier
                ),
            ));
        }

        Ok(())
    }
}

/// Remote endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Download URL template; `{id}` is replaced with the replay ID
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// HTTP statuses that mean "this replay does not exist" (default: 400, 404, 410)
    ///
    /// The upstream site answers 400 for IDs that were never assigned or were deleted.
    #[serde(default = "default_absent_statuses")]
    pub absent_statuses: Vec<u16>,

    /// Timeout for a single request (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Highest replay ID known to exist (None = derive from the ledger high-water mark)
    #[serde(default)]
    pub max_id: Option<u64>,

    /// IDs probed beyond the ledger high-water mark when `max_id` is unset (default: 500)
    #[serde(default = "default_probe_window")]
    pub probe_window: u64,

    /// Cap on requests per second across all workers (None = unlimited)
    #[serde(default)]
    pub requests_per_second: Option<u32>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            absent_statuses: default_absent_statuses(),
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
            max_id: None,
            probe_window: default_probe_window(),
            requests_per_second: None,
        }
    }
}

impl SourceConfig {
    /// Build the download URL for a replay ID
    pub fn url_for(&self, id: u64) -> String {
        self.base_url.replace(ID_PLACEHOLDER, &id.to_string())
    }

    fn validate(&self) -> Result<()> {
        if !self.base_url.contains(ID_PLACEHOLDER) {
            return Err(Error::config(
                "source.base_url",
                format!("URL template must contain {ID_PLACEHOLDER}"),
            ));
        }
        url::Url::parse(&self.url_for(0)).map_err(|e| {
            Error::config(
                "source.base_url",
                format!("'{}' is not a valid URL: {}", self.base_url, e),
            )
        })?;
        if self.requests_per_second == Some(0) {
            return Err(Error::config(
                "source.requests_per_second",
                "use no limit instead of zero requests per second",
            ));
        }
        if self.absent_statuses.iter().any(|s| (200..300).contains(s)) {
            return Err(Error::config(
                "source.absent_statuses",
                "a 2xx status cannot signal absence",
            ));
        }
        Ok(())
    }
}

/// Local persistence configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite ledger (default: "./replays.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Root directory of the content-addressed blob store (default: "./output/replays")
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// File extension given to stored blobs (default: "mcpr")
    ///
    /// Part of the addressing scheme: changing it for an existing archive makes
    /// previously stored blobs unreachable.
    #[serde(default = "default_blob_extension")]
    pub blob_extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            archive_dir: default_archive_dir(),
            blob_extension: default_blob_extension(),
        }
    }
}

/// Run behaviour configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// First replay ID of the range (default: 0)
    #[serde(default)]
    pub start_id: u64,

    /// Last replay ID of the range (None = up to the discovered upper bound)
    #[serde(default)]
    pub end_id: Option<u64>,

    /// Number of concurrent workers (default: 4)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Minimum tombstone age before an absent ID is fetched again (default: 7 days)
    ///
    /// `None` disables tombstone retries entirely.
    #[serde(default = "default_tombstone_cooldown", with = "optional_duration_serde")]
    pub tombstone_cooldown: Option<Duration>,

    /// How often discovery is re-queried during a run (default: 5 minutes)
    #[serde(default = "default_rediscover_interval", with = "duration_serde")]
    pub rediscover_interval: Duration,

    /// Consecutive storage failures after which the run halts (default: 5)
    #[serde(default = "default_max_consecutive_storage_errors")]
    pub max_consecutive_storage_errors: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            start_id: 0,
            end_id: None,
            concurrency: default_concurrency(),
            tombstone_cooldown: default_tombstone_cooldown(),
            rediscover_interval: default_rediscover_interval(),
            max_consecutive_storage_errors: default_max_consecutive_storage_errors(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total fetch attempts per ID before it is abandoned (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between attempts (default: 60 seconds)
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
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

// Default value functions
fn default_base_url() -> String {
    "https://www.replaymod.com/api/download_file?id={id}".to_string()
}

fn default_absent_statuses() -> Vec<u16> {
    vec![400, 404, 410]
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("replay-archiver/{}", env!("CARGO_PKG_VERSION"))
}

fn default_probe_window() -> u64 {
    500
}

fn default_database_path() -> PathBuf {
    PathBuf::from("replays.db")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("output/replays")
}

fn default_blob_extension() -> String {
    "mcpr".to_string()
}

fn default_concurrency() -> usize {
    4
}

fn default_tombstone_cooldown() -> Option<Duration> {
    Some(Duration::from_secs(7 * 24 * 60 * 60))
}

fn default_rediscover_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_consecutive_storage_errors() -> u32 {
    5
}

fn default_true() -> bool {
    true
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

// Duration serialization helper
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

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
