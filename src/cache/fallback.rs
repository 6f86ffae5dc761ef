//! Fallback tier - small Moka-backed store used while the persistent tier is down.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use moka::sync::Cache;

use super::{CategoryId, PersistedRecord};

/// Lightweight tier for small payloads.
///
/// This cache is:
/// - Shared by all categories, keyed by `(category, key)`
/// - Capped both in entry count and in the size of a single payload
/// - Clone-friendly (cloning shares the same underlying cache)
#[derive(Clone)]
pub struct FallbackTier {
    inner: Arc<Cache<(CategoryId, String), PersistedRecord>>,
    max_item_bytes: u64,
}

impl FallbackTier {
    /// Create a fallback tier holding at most `max_items` payloads of at
    /// most `max_item_bytes` each.
    pub fn new(max_items: u64, max_item_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Cache::builder().max_capacity(max_items).build()),
            max_item_bytes,
        }
    }

    /// Whether a payload of this size is accepted.
    pub fn accepts(&self, size_bytes: u64) -> bool {
        size_bytes <= self.max_item_bytes
    }

    /// Store a record. Returns `false` if it is too large.
    pub fn insert(&self, record: PersistedRecord) -> bool {
        if !self.accepts(record.payload.len() as u64) {
            return false;
        }
        self.inner
            .insert((record.category, record.key.clone()), record);
        true
    }

    /// Get a live record; expired ones are dropped on the way.
    pub fn get(&self, category: CategoryId, key: &str, now: DateTime<Utc>) -> Option<PersistedRecord> {
        let cache_key = (category, key.to_string());
        let record = self.inner.get(&cache_key)?;
        if record.is_expired(now) {
            self.inner.invalidate(&cache_key);
            return None;
        }
        Some(record)
    }

    pub fn remove(&self, category: CategoryId, key: &str) {
        self.inner.invalidate(&(category, key.to_string()));
    }

    /// Remove every record of `category`.
    pub fn clear(&self, category: CategoryId) {
        let keys: Vec<_> = self
            .inner
            .iter()
            .filter(|(k, _)| k.0 == category)
            .map(|(k, _)| (*k).clone())
            .collect();
        for key in keys {
            self.inner.invalidate(&key);
        }
    }

    /// Remove expired records. Returns how many were dropped.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<_> = self
            .inner
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(k, _)| (*k).clone())
            .collect();
        for key in &expired {
            self.inner.invalidate(key);
        }
        expired.len()
    }

    /// Get the number of entries in the tier.
    ///
    /// Note: This may not be perfectly accurate due to pending maintenance.
    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

impl std::fmt::Debug for FallbackTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackTier")
            .field("entry_count", &self.inner.entry_count())
            .field("max_item_bytes", &self.max_item_bytes)
            .finish()
    }
}
