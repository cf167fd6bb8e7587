//! Cache configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default retention after the last subscriber leaves.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

/// Store-wide defaults.
///
/// Durations are written in humantime form when (de)serialized, e.g.
/// `{"cache_time": "10m", "stale_time": "30s"}`. Missing fields fall back to
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    /// GC delay for entries whose subscribers never asked for a longer one.
    #[serde(with = "humantime_serde")]
    pub cache_time: Duration,

    /// Staleness window used by `observe` when the observer does not set one.
    #[serde(with = "humantime_serde")]
    pub stale_time: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            cache_time: DEFAULT_CACHE_TIME,
            stale_time: Duration::ZERO,
        }
    }
}
