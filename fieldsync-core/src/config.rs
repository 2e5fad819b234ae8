//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConfigError, FieldsyncError, FieldsyncResult};

/// Default reuse window for cached entries (5 minutes).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);

/// Cache-wide defaults applied when a read passes no [`ReadOptions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries older than this are treated as misses.
    pub default_max_age: Duration,
    /// Whether hits within max-age are verified with a staleness probe.
    pub check_updated_by_default: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_max_age: DEFAULT_MAX_AGE,
            check_updated_by_default: true,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.default_max_age = max_age;
        self
    }

    pub fn with_check_updated(mut self, enabled: bool) -> Self {
        self.check_updated_by_default = enabled;
        self
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `FIELDSYNC_CACHE_MAX_AGE_SECS`: reuse window in seconds (default: 300)
    /// - `FIELDSYNC_CACHE_CHECK_UPDATED`: `true`/`1` to probe on hits (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            default_max_age: std::env::var("FIELDSYNC_CACHE_MAX_AGE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_max_age),
            check_updated_by_default: std::env::var("FIELDSYNC_CACHE_CHECK_UPDATED")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.check_updated_by_default),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> FieldsyncResult<()> {
        if self.default_max_age.is_zero() {
            return Err(FieldsyncError::Config(ConfigError::InvalidValue {
                field: "default_max_age".to_string(),
                value: format!("{:?}", self.default_max_age),
                reason: "default_max_age must be positive".to_string(),
            }));
        }
        Ok(())
    }

    /// Read options carrying this config's defaults.
    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            max_age: self.default_max_age,
            check_updated: self.check_updated_by_default,
        }
    }
}

/// Per-read freshness options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Reuse window for the cached entry.
    pub max_age: Duration,
    /// Verify hits with a staleness probe.
    pub check_updated: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        CacheConfig::default().read_options()
    }
}

impl ReadOptions {
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_check_updated(mut self, enabled: bool) -> Self {
        self.check_updated = enabled;
        self
    }

    /// Skip the probe; trust the max-age window alone.
    pub fn unchecked(max_age: Duration) -> Self {
        Self {
            max_age,
            check_updated: false,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
