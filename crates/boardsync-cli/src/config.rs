//! CLI configuration.

use anyhow::{Context, Result};
use std::time::Duration;
use uuid::Uuid;

/// Tool configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Site id for operations created by the `new` command
    pub site_id: String,

    /// Committed-history capacity of the operation transformer
    pub history_capacity: usize,

    /// Retention age of delete history before garbage collection
    pub gc_min_age: Duration,

    /// Resync through a full snapshot when a delivery is not causally ready
    pub resync_on_drop: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            site_id: Uuid::new_v4().to_string(),
            history_capacity: boardsync_core::DEFAULT_HISTORY_CAPACITY,
            gc_min_age: Duration::from_secs(3600),
            resync_on_drop: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BOARDSYNC_SITE_ID`: site id for created operations
    /// - `BOARDSYNC_HISTORY_CAPACITY`: transformer history capacity
    /// - `BOARDSYNC_GC_MIN_AGE_MS`: delete-history retention in milliseconds
    /// - `BOARDSYNC_RESYNC_ON_DROP`: `true` or `false`
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(site_id) = std::env::var("BOARDSYNC_SITE_ID") {
            config.site_id = site_id;
        }

        if let Ok(capacity) = std::env::var("BOARDSYNC_HISTORY_CAPACITY") {
            config.history_capacity = capacity
                .parse()
                .context("Invalid BOARDSYNC_HISTORY_CAPACITY")?;
        }

        if let Ok(age) = std::env::var("BOARDSYNC_GC_MIN_AGE_MS") {
            config.gc_min_age =
                Duration::from_millis(age.parse().context("Invalid BOARDSYNC_GC_MIN_AGE_MS")?);
        }

        if let Ok(flag) = std::env::var("BOARDSYNC_RESYNC_ON_DROP") {
            config.resync_on_drop = flag.parse().context("Invalid BOARDSYNC_RESYNC_ON_DROP")?;
        }

        Ok(config)
    }
}
