//! Category budget configuration.

use std::time::Duration;

use serde::Serialize;

use super::CategoryId;

const MB: u64 = 1024 * 1024;
const HOUR: u64 = 3600;

/// Budget for one cache category.
///
/// Fixed at session construction; every write is checked against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryConfig {
    pub id: CategoryId,

    /// Upper bound on the summed `size_bytes` of live entries.
    pub max_total_bytes: u64,

    /// Upper bound on the number of live entries.
    pub max_items: u64,

    /// TTL applied when `put` is called without an explicit one.
    pub default_ttl: Duration,
}

impl CategoryConfig {
    /// Create a config with the given budgets.
    pub fn new(id: CategoryId, max_total_bytes: u64, max_items: u64, default_ttl: Duration) -> Self {
        Self {
            id,
            max_total_bytes,
            max_items,
            default_ttl,
        }
    }

    /// Set the byte budget (builder pattern).
    #[must_use]
    pub fn max_total_bytes(mut self, bytes: u64) -> Self {
        self.max_total_bytes = bytes;
        self
    }

    /// Set the item budget (builder pattern).
    #[must_use]
    pub fn max_items(mut self, items: u64) -> Self {
        self.max_items = items;
        self
    }

    /// Set the default TTL (builder pattern).
    #[must_use]
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Thumbnails and preview images.
    /// Large budget, long TTL.
    pub fn image() -> Self {
        Self::new(CategoryId::Image, 25 * MB, 100, Duration::from_secs(24 * HOUR))
    }

    /// Template metadata.
    /// Many small entries, half-day TTL.
    pub fn template() -> Self {
        Self::new(CategoryId::Template, 8 * MB, 200, Duration::from_secs(12 * HOUR))
    }

    /// Generated video files.
    /// Few large entries, short TTL since result URLs are signed.
    pub fn video() -> Self {
        Self::new(CategoryId::Video, 12 * MB, 50, Duration::from_secs(6 * HOUR))
    }

    /// Per-user data (profile, credits, history).
    pub fn user_data() -> Self {
        Self::new(CategoryId::UserData, 5 * MB, 200, Duration::from_secs(2 * HOUR))
    }

    /// Preset for the given category.
    pub fn for_category(id: CategoryId) -> Self {
        match id {
            CategoryId::Image => Self::image(),
            CategoryId::Template => Self::template(),
            CategoryId::Video => Self::video(),
            CategoryId::UserData => Self::user_data(),
        }
    }

    /// Presets for every category.
    pub fn defaults() -> Vec<Self> {
        CategoryId::ALL.iter().map(|&id| Self::for_category(id)).collect()
    }
}
