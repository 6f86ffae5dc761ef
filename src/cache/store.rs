//! In-memory tier for a single category.
//!
//! `CacheStore` owns the entries of one category, tracks their summed size
//! and enforces the category budget with LRU eviction at the end of every
//! insert. It performs no I/O and never reads the clock itself; callers pass
//! `now` in.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{CacheError, CategoryConfig, CategoryId};

/// Metadata of a cached value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub category: CategoryId,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of a memory-tier lookup.
#[derive(Debug, PartialEq)]
pub enum Lookup<V> {
    Hit(V),
    /// Entry existed but had expired; it has been removed.
    Expired(CacheEntry),
    Absent,
}

struct Slot<V> {
    entry: CacheEntry,
    payload: V,
    /// Logical clock of the last touch, breaks timestamp ties.
    touched: u64,
    /// Logical clock of the insert that produced this value.
    revision: u64,
}

impl<V> Slot<V> {
    fn lru_rank(&self) -> (DateTime<Utc>, DateTime<Utc>, u64) {
        (self.entry.last_access_at, self.entry.created_at, self.touched)
    }
}

/// Budget-constrained key/value storage for one category.
pub struct CacheStore<V> {
    config: CategoryConfig,
    slots: HashMap<String, Slot<V>>,
    total_bytes: u64,
    ticks: u64,
    /// Bumped by every removal so in-flight promotions can detect them.
    epoch: u64,
}

impl<V: Clone> CacheStore<V> {
    pub fn new(config: CategoryConfig) -> Self {
        Self {
            config,
            slots: HashMap::new(),
            total_bytes: 0,
            ticks: 0,
            epoch: 0,
        }
    }

    pub fn config(&self) -> &CategoryConfig {
        &self.config
    }

    /// Look up `key`, refreshing its access time on a hit.
    ///
    /// Expired entries are removed and reported as [`Lookup::Expired`].
    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Lookup<V> {
        let expired = match self.slots.get(key) {
            None => return Lookup::Absent,
            Some(slot) => slot.entry.is_expired(now),
        };

        if expired {
            return match self.remove(key) {
                Some(entry) => Lookup::Expired(entry),
                None => Lookup::Absent,
            };
        }

        self.ticks += 1;
        let ticks = self.ticks;
        match self.slots.get_mut(key) {
            Some(slot) => {
                slot.entry.last_access_at = now;
                slot.touched = ticks;
                Lookup::Hit(slot.payload.clone())
            }
            None => Lookup::Absent,
        }
    }

    /// Metadata for `key` without touching it.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Identifies the value currently stored under `key`. Changes on every
    /// insert of the key; `None` once it has left the store.
    pub fn revision(&self, key: &str) -> Option<u64> {
        self.slots.get(key).map(|slot| slot.revision)
    }

    /// Insert or replace `key`, then evict until the budget holds.
    ///
    /// Returns the evicted entries. A value larger than the whole byte budget
    /// is rejected and leaves the store untouched.
    pub fn insert(
        &mut self,
        key: &str,
        payload: V,
        size_bytes: u64,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CacheEntry>, CacheError> {
        if size_bytes > self.config.max_total_bytes {
            return Err(CacheError::CacheFull {
                category: self.config.id,
                size_bytes,
                max_total_bytes: self.config.max_total_bytes,
            });
        }

        if let Some(old) = self.slots.remove(key) {
            self.total_bytes -= old.entry.size_bytes;
        }

        self.ticks += 1;
        let slot = Slot {
            entry: CacheEntry {
                key: key.to_string(),
                category: self.config.id,
                size_bytes,
                created_at,
                last_access_at: now,
                expires_at,
            },
            payload,
            touched: self.ticks,
            revision: self.ticks,
        };
        self.total_bytes += size_bytes;
        self.slots.insert(key.to_string(), slot);

        Ok(self.evict_to_budget())
    }

    /// Remove `key`, returning its metadata if it was present.
    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.total_bytes -= slot.entry.size_bytes;
        self.epoch += 1;
        Some(slot.entry)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        self.total_bytes = 0;
        self.epoch += 1;
        count
    }

    /// Remove every entry whose TTL has passed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let expired: Vec<String> = self
            .slots
            .values()
            .filter(|slot| slot.entry.is_expired(now))
            .map(|slot| slot.entry.key.clone())
            .collect();

        expired.iter().filter_map(|key| self.remove(key)).collect()
    }

    fn over_budget(&self) -> bool {
        self.total_bytes > self.config.max_total_bytes
            || self.slots.len() as u64 > self.config.max_items
    }

    /// Evict least recently used entries until the budget holds.
    fn evict_to_budget(&mut self) -> Vec<CacheEntry> {
        let mut evicted = Vec::new();
        while self.over_budget() {
            // Linear scan; categories hold at most a few hundred entries.
            let victim = self
                .slots
                .values()
                .min_by_key(|slot| slot.lru_rank())
                .map(|slot| slot.entry.key.clone());

            match victim.and_then(|key| self.remove(&key)) {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Removal counter; changes whenever an entry leaves the store.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn keys(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }
}
