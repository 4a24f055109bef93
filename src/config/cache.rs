use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Namespace and role cache configuration.
///
/// Both caches reload on every change notification. The periodic resync is a fallback
/// that bounds staleness if a notification is ever lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Seconds between full reloads. 0 disables the periodic resync.
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resync_interval_secs > 0 && self.resync_interval_secs < 5 {
            return Err(ConfigError::Validation(
                "cache.resync_interval_secs must be 0 (disabled) or at least 5".into(),
            ));
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }
}

fn default_resync_interval() -> u64 {
    300
}
