use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Configuration for a single [`RefreshQueue`](crate::RefreshQueue) instance.
///
/// Typically embedded in a service's config file, one section per upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Path of the JSON file used to persist the cache across restarts.
    ///
    /// Leaving this as `None` disables persistence.
    pub file_cache_path: Option<PathBuf>,

    /// Re-hydrate serialized big-number objects when loading the cache file.
    ///
    /// See [`FileCache`](crate::FileCache) for the exact semantics.
    pub enable_big_number_parsing: bool,

    /// Age after which a cached entry is considered stale.
    ///
    /// Stale entries are still served; a read of one schedules a background
    /// refresh. This never causes eviction.
    #[serde(with = "humantime_serde")]
    pub refresh_duration: Duration,

    /// Minimum spacing between successive fetch initiations.
    ///
    /// Must be chosen below the upstream's rate limit, i.e. larger than one
    /// minute divided by the allowed requests per minute.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Upper bound on how far into the future the rate gate may be pushed.
    ///
    /// Without this, a burst of distinct keys would delay the last key's
    /// fetch by `burst size * refresh_interval`.
    #[serde(with = "humantime_serde")]
    pub refresh_max_wait_time: Duration,

    /// Tag attached as a field to every log line emitted by this queue.
    pub log_tag: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        // The defaults fit an upstream allowing roughly one request every
        // two seconds, e.g. the Google Sheets per-minute read quota.
        QueueConfig {
            file_cache_path: None,
            enable_big_number_parsing: false,
            refresh_duration: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(2),
            refresh_max_wait_time: Duration::from_secs(120),
            log_tag: "refresh-queue".into(),
        }
    }
}
