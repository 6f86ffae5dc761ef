//! Configuration module for reelcache.
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CategoryConfig;

/// Device class the session runs on.
///
/// Selects the polling interval; constrained devices poll less often.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Mobile,
}

impl DeviceClass {
    /// Poll interval for this device class given the base interval.
    pub fn poll_interval(self, base: Duration) -> Duration {
        match self {
            Self::Desktop => base,
            Self::Mobile => base + base / 2,
        }
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "desktop" => Ok(Self::Desktop),
            "mobile" => Ok(Self::Mobile),
            other => Err(format!("unknown device class: {}", other)),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    // MongoDB
    /// Connection string for the persistent tier and task store.
    /// When unset the session runs memory-only.
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,

    // Polling
    pub device_class: DeviceClass,
    pub poll_interval_base: Duration,

    // Cache
    pub categories: Vec<CategoryConfig>,
    pub sweep_interval: Duration,
    /// Largest payload the fallback tier will hold.
    pub fallback_max_item_bytes: u64,
    pub fallback_max_items: u64,

    // Tasks
    /// Recovered tasks older than this are failed instead of polled.
    pub orphan_max_age: Duration,
    /// Time constant of the simulated progress curve.
    pub progress_time_constant: Duration,

    /// User whose tasks the maintenance binary recovers.
    pub session_user_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mongodb_uri: None,
            mongodb_database: "reelcache".to_string(),
            device_class: DeviceClass::Desktop,
            poll_interval_base: Duration::from_secs(5),
            categories: CategoryConfig::defaults(),
            sweep_interval: Duration::from_secs(300),
            fallback_max_item_bytes: 64 * 1024,
            fallback_max_items: 500,
            orphan_max_age: Duration::from_secs(2 * 3600),
            progress_time_constant: Duration::from_secs(60),
            session_user_id: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let device_class = env::var("DEVICE_CLASS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.device_class);

        let mongodb_uri = env::var("MONGODB_URI")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let session_user_id = env::var("SESSION_USER_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Self {
            mongodb_uri,
            mongodb_database: env::var("MONGODB_DATABASE")
                .unwrap_or_else(|_| defaults.mongodb_database.clone()),
            device_class,
            poll_interval_base: secs_var("POLL_INTERVAL_SECS").unwrap_or(defaults.poll_interval_base),
            categories: defaults.categories,
            sweep_interval: secs_var("SWEEP_INTERVAL_SECS").unwrap_or(defaults.sweep_interval),
            fallback_max_item_bytes: parse_var("FALLBACK_MAX_ITEM_BYTES")
                .unwrap_or(defaults.fallback_max_item_bytes),
            fallback_max_items: defaults.fallback_max_items,
            orphan_max_age: secs_var("ORPHAN_MAX_AGE_SECS").unwrap_or(defaults.orphan_max_age),
            progress_time_constant: secs_var("PROGRESS_TIME_CONSTANT_SECS")
                .unwrap_or(defaults.progress_time_constant),
            session_user_id,
        }
    }

    /// Effective poll interval for the configured device class.
    pub fn poll_interval(&self) -> Duration {
        self.device_class.poll_interval(self.poll_interval_base)
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn secs_var(name: &str) -> Option<Duration> {
    parse_var::<u64>(name)
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
}
