use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub fn load_config(config_file_path: Option<&Path>) -> anyhow::Result<Config> {
    let mut settings = config::Config::builder();

    if let Some(path) = config_file_path {
        settings = settings.add_source(config::File::from(path).required(true));
    }

    let settings = settings
        .add_source(
            config::Environment::with_prefix("SG")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize::<Config>()?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub search: SearchConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub locks: LockConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection string for the document store database.
    pub database: String,

    #[serde(default = "default::max_connections")]
    pub max_connections: u32,

    /// Create the database if missing and run migrations on startup.
    #[serde(default = "default::migrate")]
    pub migrate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Base url of the search engine.
    pub url: String,

    /// Per-request timeout.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::search_timeout")]
    pub timeout: Duration,

    /// Replica count restored on the target indices after a sync.
    #[serde(default = "default::replicas")]
    pub replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Number of workers turning records into bulk operations.
    #[serde(default = "default::worker_count")]
    pub worker_count: usize,

    /// Number of bulk operations submitted per request.
    #[serde(default = "default::bulk_size")]
    pub bulk_size: usize,

    /// Attempts for a bulk request hitting transient failures.
    #[serde(default = "default::bulk_attempts")]
    pub bulk_attempts: u32,

    /// Initial backoff between bulk attempts, doubled each retry.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::bulk_backoff")]
    pub bulk_backoff: Duration,

    /// Attempts for the final refresh.
    #[serde(default = "default::refresh_attempts")]
    pub refresh_attempts: u32,

    /// Initial backoff between refresh attempts, doubled each retry.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::refresh_backoff")]
    pub refresh_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            worker_count: default::worker_count(),
            bulk_size: default::bulk_size(),
            bulk_attempts: default::bulk_attempts(),
            bulk_backoff: default::bulk_backoff(),
            refresh_attempts: default::refresh_attempts(),
            refresh_backoff: default::refresh_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long an acquire waits before giving up.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::lock_acquire_timeout")]
    pub acquire_timeout: Duration,

    /// A lock whose heartbeat is older than this may be taken over.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::lock_ttl")]
    pub ttl: Duration,

    /// How often a held lock refreshes its heartbeat.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::lock_heartbeat")]
    pub heartbeat: Duration,

    /// Base delay between acquire attempts; jitter is added on top.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::lock_retry")]
    pub retry: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            acquire_timeout: default::lock_acquire_timeout(),
            ttl: default::lock_ttl(),
            heartbeat: default::lock_heartbeat(),
            retry: default::lock_retry(),
        }
    }
}

mod default {
    use std::time::Duration;

    pub fn max_connections() -> u32 {
        10
    }

    pub fn migrate() -> bool {
        true
    }

    pub fn search_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn replicas() -> u32 {
        1
    }

    pub fn worker_count() -> usize {
        4
    }

    pub fn bulk_size() -> usize {
        1000
    }

    pub fn bulk_attempts() -> u32 {
        5
    }

    pub fn bulk_backoff() -> Duration {
        Duration::from_millis(500)
    }

    pub fn refresh_attempts() -> u32 {
        5
    }

    pub fn refresh_backoff() -> Duration {
        Duration::from_secs(1)
    }

    pub fn lock_acquire_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn lock_ttl() -> Duration {
        Duration::from_secs(60)
    }

    pub fn lock_heartbeat() -> Duration {
        Duration::from_secs(20)
    }

    pub fn lock_retry() -> Duration {
        Duration::from_millis(250)
    }
}
