//! Tier coordinator - read-through/write-through across memory, persistent
//! and fallback tiers for one category.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::store::{CacheEntry, CacheStore, Lookup};
use super::{
    CacheCategory, CacheError, CachePayload, CategoryConfig, CategoryId, FallbackTier,
    PersistedRecord, PersistentHealth, PersistentTier,
};
use crate::utils::SharedClock;
use crate::utils::clock::to_chrono;

/// Where a `get` was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    Memory,
    Persistent,
    Fallback,
}

/// Shared tiers every coordinator of a session writes through to.
#[derive(Clone)]
pub struct TierBackends {
    pub persistent: Option<Arc<dyn PersistentTier>>,
    pub health: Arc<PersistentHealth>,
    pub fallback: FallbackTier,
    pub clock: SharedClock,
}

/// Coordinates the tiers of a single category.
///
/// The memory tier is authoritative for the budget; the persistent tier is
/// written asynchronously and read only on memory misses.
pub struct TierCoordinator<C: CacheCategory> {
    memory: Arc<Mutex<CacheStore<C::Payload>>>,
    backends: TierBackends,
    _category: PhantomData<C>,
}

impl<C: CacheCategory> TierCoordinator<C> {
    pub fn new(config: CategoryConfig, backends: TierBackends) -> Self {
        debug_assert_eq!(config.id, C::ID);
        Self {
            memory: Arc::new(Mutex::new(CacheStore::new(config))),
            backends,
            _category: PhantomData,
        }
    }

    pub fn category(&self) -> CategoryId {
        C::ID
    }

    pub fn config(&self) -> CategoryConfig {
        self.memory.lock().config().clone()
    }

    fn persistent(&self) -> Option<&Arc<dyn PersistentTier>> {
        self.backends
            .persistent
            .as_ref()
            .filter(|_| self.backends.health.is_ready())
    }

    /// Look up `key`, checking memory, then persistent, then fallback.
    ///
    /// `None` means the caller should fetch the asset and `put` it.
    pub async fn get(&self, key: &str) -> Option<(C::Payload, HitSource)> {
        let now = self.backends.clock.now();

        let epoch = {
            let mut memory = self.memory.lock();
            match memory.get(key, now) {
                Lookup::Hit(payload) => return Some((payload, HitSource::Memory)),
                Lookup::Expired(entry) => {
                    debug!("Cache entry {}/{} expired", C::ID, entry.key);
                    self.forget_durable(key);
                    return None;
                }
                Lookup::Absent => memory.epoch(),
            }
        };

        let (record, source) = match self.read_durable(key).await {
            Some(found) => found,
            None => return None,
        };

        let now = self.backends.clock.now();
        if record.is_expired(now) {
            debug!("Durable entry {}/{} expired", C::ID, key);
            self.forget_durable(key);
            return None;
        }

        let payload = match C::Payload::decode(&record.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping undecodable entry {}/{}: {}", C::ID, key, e);
                self.forget_durable(key);
                return None;
            }
        };

        self.promote(key, &payload, &record, epoch, now);
        Some((payload, source))
    }

    async fn read_durable(&self, key: &str) -> Option<(PersistedRecord, HitSource)> {
        if let Some(tier) = self.persistent() {
            match tier.read(C::ID, key).await {
                Ok(Some(record)) => return Some((record, HitSource::Persistent)),
                Ok(None) => {}
                Err(e) => self.backends.health.mark_unavailable(&e.to_string()),
            }
        }

        let now = self.backends.clock.now();
        self.backends
            .fallback
            .get(C::ID, key, now)
            .map(|record| (record, HitSource::Fallback))
    }

    /// Copy a durable hit into memory unless memory changed meanwhile.
    fn promote(
        &self,
        key: &str,
        payload: &C::Payload,
        record: &PersistedRecord,
        epoch: u64,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        let evicted = {
            let mut memory = self.memory.lock();
            // A newer put wins; a delete or clear during the read must not be undone.
            if memory.contains(key) || memory.epoch() != epoch {
                return;
            }
            match memory.insert(
                key,
                payload.clone(),
                record.size_bytes,
                record.created_at,
                record.expires_at,
                now,
            ) {
                Ok(evicted) => evicted,
                Err(e) => {
                    debug!("Not promoting {}/{}: {}", C::ID, key, e);
                    return;
                }
            }
        };

        debug!("Promoted {}/{} into memory", C::ID, key);
        self.forget_evicted(evicted);
    }

    /// Store `payload` under `key`.
    ///
    /// The memory tier is updated and the budget enforced before this
    /// returns; the durable write happens in the background.
    pub fn put(
        &self,
        key: &str,
        payload: C::Payload,
        size_bytes: u64,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let now = self.backends.clock.now();

        let (evicted, expires_at, revision) = {
            let mut memory = self.memory.lock();
            let ttl = ttl.unwrap_or(memory.config().default_ttl);
            let expires_at = now
                .checked_add_signed(to_chrono(ttl))
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);
            let evicted = memory.insert(key, payload.clone(), size_bytes, now, expires_at, now)?;
            (evicted, expires_at, memory.revision(key))
        };

        if !evicted.is_empty() {
            debug!("Evicted {} {} entries to fit {}", evicted.len(), C::ID, key);
        }
        self.forget_evicted(evicted);

        let encoded = match payload.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Keeping {}/{} memory-only: {}", C::ID, key, e);
                return Ok(());
            }
        };

        let record = PersistedRecord {
            category: C::ID,
            key: key.to_string(),
            payload: encoded,
            size_bytes,
            created_at: now,
            expires_at,
        };
        // Evicted by its own insert; nothing left to persist.
        let Some(revision) = revision else {
            return Ok(());
        };
        self.write_durable(record, revision);

        Ok(())
    }

    fn write_durable(&self, record: PersistedRecord, revision: u64) {
        if let Some(tier) = self.persistent() {
            let tier = Arc::clone(tier);
            let health = Arc::clone(&self.backends.health);
            let fallback = self.backends.fallback.clone();
            let memory = Arc::downgrade(&self.memory);
            tokio::spawn(async move {
                if let Err(e) = tier.write(&record).await {
                    health.mark_unavailable(&e.to_string());
                    let Some(memory) = memory.upgrade() else {
                        return;
                    };
                    // Held across the insert so a concurrent delete or
                    // clear runs either fully before or fully after it.
                    let memory = memory.lock();
                    if memory.revision(&record.key) == Some(revision) {
                        fallback.insert(record);
                    } else {
                        debug!("{}/{} changed during a failed write, not falling back", C::ID, record.key);
                    }
                }
            });
        } else if !self.backends.fallback.insert(record) {
            debug!("{} payload too large for the fallback tier, memory-only", C::ID);
        }
    }

    /// Remove `key` from every tier.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.memory.lock().remove(key).is_some();
        self.forget_durable(key);
        removed
    }

    /// Remove every entry of this category from every tier.
    pub fn clear(&self) -> usize {
        let count = self.memory.lock().clear();
        self.backends.fallback.clear(C::ID);

        if let Some(tier) = self.persistent() {
            let tier = Arc::clone(tier);
            let health = Arc::clone(&self.backends.health);
            tokio::spawn(async move {
                if let Err(e) = tier.clear(C::ID).await {
                    health.mark_unavailable(&e.to_string());
                }
            });
        }
        count
    }

    /// Drop expired memory entries.
    pub fn purge_expired_memory(&self) -> usize {
        let now = self.backends.clock.now();
        let purged = self.memory.lock().purge_expired(now);
        purged.len()
    }

    /// Item count and summed bytes of the memory tier.
    pub fn usage(&self) -> (u64, u64) {
        let memory = self.memory.lock();
        (memory.len() as u64, memory.total_bytes())
    }

    /// Metadata for `key` without refreshing it.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.memory.lock().peek(key).cloned()
    }

    fn forget_evicted(&self, evicted: Vec<CacheEntry>) {
        for entry in evicted {
            self.forget_durable(&entry.key);
        }
    }

    /// Best-effort removal from the durable tiers.
    fn forget_durable(&self, key: &str) {
        self.backends.fallback.remove(C::ID, key);

        if let Some(tier) = self.persistent() {
            let tier = Arc::clone(tier);
            let health = Arc::clone(&self.backends.health);
            let key = key.to_string();
            tokio::spawn(async move {
                if let Err(e) = tier.remove(C::ID, &key).await {
                    health.mark_unavailable(&e.to_string());
                }
            });
        }
    }
}

impl<C: CacheCategory> std::fmt::Debug for TierCoordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (items, bytes) = self.usage();
        f.debug_struct("TierCoordinator")
            .field("category", &C::ID)
            .field("items", &items)
            .field("bytes", &bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::cache::{Blob, Images, UserData};
    use crate::testing::FakeTier;
    use crate::utils::ManualClock;

    fn backends(tier: Option<Arc<FakeTier>>, clock: &ManualClock) -> TierBackends {
        let ready = tier.is_some();
        TierBackends {
            persistent: tier.map(|t| t as Arc<dyn PersistentTier>),
            health: Arc::new(PersistentHealth::new(ready)),
            fallback: FallbackTier::new(100, 1024),
            clock: Arc::new(clock.clone()),
        }
    }

    fn png(len: usize) -> Blob {
        Blob::new("image/png", vec![1; len])
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_put_writes_through_and_promotes_after_restart() {
        let clock = ManualClock::starting_now();
        let tier = Arc::new(FakeTier::default());

        let first = TierCoordinator::<Images>::new(CategoryConfig::image(), backends(Some(tier.clone()), &clock));
        first.put("cover", png(10), 10, None).unwrap();
        settle().await;
        assert_eq!(tier.records.lock().len(), 1);

        // New session, empty memory.
        let second = TierCoordinator::<Images>::new(CategoryConfig::image(), backends(Some(tier.clone()), &clock));
        let (payload, source) = second.get("cover").await.unwrap();
        assert_eq!(payload, png(10));
        assert_eq!(source, HitSource::Persistent);

        let (_, source) = second.get("cover").await.unwrap();
        assert_eq!(source, HitSource::Memory);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_a_miss() {
        let clock = ManualClock::starting_now();
        let coordinator = TierCoordinator::<Images>::new(CategoryConfig::image(), backends(None, &clock));

        coordinator
            .put("thumb", png(4), 4, Some(Duration::from_secs(30)))
            .unwrap();
        clock.advance(Duration::from_secs(29));
        assert!(coordinator.get("thumb").await.is_some());

        clock.advance(Duration::from_secs(2));
        assert!(coordinator.get("thumb").await.is_none());
        assert_eq!(coordinator.usage(), (0, 0));
    }

    #[tokio::test]
    async fn test_expired_durable_record_not_promoted() {
        let clock = ManualClock::starting_now();
        let tier = Arc::new(FakeTier::default());

        let first = TierCoordinator::<Images>::new(CategoryConfig::image(), backends(Some(tier.clone()), &clock));
        first.put("old", png(3), 3, Some(Duration::from_secs(10))).unwrap();
        settle().await;

        clock.advance(Duration::from_secs(11));
        let second = TierCoordinator::<Images>::new(CategoryConfig::image(), backends(Some(tier.clone()), &clock));
        assert!(second.get("old").await.is_none());
        assert_eq!(second.usage(), (0, 0));
    }

    #[tokio::test]
    async fn test_oversized_put_rejected() {
        let clock = ManualClock::starting_now();
        let config = CategoryConfig::image().max_total_bytes(100);
        let coordinator = TierCoordinator::<Images>::new(config, backends(None, &clock));

        let err = coordinator.put("huge", png(101), 101, None).unwrap_err();
        assert!(matches!(err, CacheError::CacheFull { category: CategoryId::Image, .. }));
        assert!(coordinator.get("huge").await.is_none());
    }

    #[tokio::test]
    async fn test_failing_persistent_tier_degrades_to_memory() {
        let clock = ManualClock::starting_now();
        let tier = Arc::new(FakeTier::default());
        tier.failing.store(true, Ordering::SeqCst);
        let backends = backends(Some(tier.clone()), &clock);
        let health = backends.health.clone();

        let coordinator = TierCoordinator::<UserData>::new(CategoryConfig::user_data(), backends);
        coordinator
            .put("profile", serde_json::json!({"credits": 12}), 20, None)
            .unwrap();
        settle().await;

        assert!(!health.is_ready());
        let (payload, source) = coordinator.get("profile").await.unwrap();
        assert_eq!(payload["credits"], 12);
        assert_eq!(source, HitSource::Memory);
    }

    #[tokio::test]
    async fn test_fallback_tier_serves_small_payloads_when_memory_is_cold() {
        let clock = ManualClock::starting_now();
        let shared = backends(None, &clock);

        let first = TierCoordinator::<UserData>::new(CategoryConfig::user_data(), shared.clone());
        first.put("prefs", serde_json::json!({"lang": "en"}), 16, None).unwrap();

        let second = TierCoordinator::<UserData>::new(CategoryConfig::user_data(), shared);
        let (payload, source) = second.get("prefs").await.unwrap();
        assert_eq!(payload["lang"], "en");
        assert_eq!(source, HitSource::Fallback);
    }

    #[tokio::test]
    async fn test_eviction_removes_durable_copy() {
        let clock = ManualClock::starting_now();
        let tier = Arc::new(FakeTier::default());
        let config = CategoryConfig::image().max_items(1);
        let coordinator = TierCoordinator::<Images>::new(config, backends(Some(tier.clone()), &clock));

        coordinator.put("a", png(1), 1, None).unwrap();
        settle().await;
        coordinator.put("b", png(1), 1, None).unwrap();
        settle().await;

        let records = tier.records.lock();
        assert!(!records.contains_key(&(CategoryId::Image, "a".to_string())));
        assert!(records.contains_key(&(CategoryId::Image, "b".to_string())));
    }

    #[tokio::test]
    async fn test_delete_removes_from_all_tiers() {
        let clock = ManualClock::starting_now();
        let tier = Arc::new(FakeTier::default());
        let coordinator = TierCoordinator::<Images>::new(CategoryConfig::image(), backends(Some(tier.clone()), &clock));

        coordinator.put("gone", png(2), 2, None).unwrap();
        settle().await;
        assert!(coordinator.delete("gone"));
        settle().await;

        assert!(tier.records.lock().is_empty());
        assert!(coordinator.get("gone").await.is_none());
        assert!(!coordinator.delete("gone"));
    }

    #[tokio::test]
    async fn test_failed_write_after_delete_does_not_resurrect_key() {
        let clock = ManualClock::starting_now();
        let tier = Arc::new(FakeTier::default());
        tier.failing.store(true, Ordering::SeqCst);
        let backends = backends(Some(tier.clone()), &clock);
        let health = backends.health.clone();
        let coordinator = TierCoordinator::<UserData>::new(CategoryConfig::user_data(), backends);

        coordinator.put("x", serde_json::json!({"v": 1}), 8, None).unwrap();
        assert!(coordinator.delete("x"));
        settle().await;

        assert!(!health.is_ready());
        assert!(coordinator.get("x").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_write_after_clear_does_not_resurrect_keys() {
        let clock = ManualClock::starting_now();
        let tier = Arc::new(FakeTier::default());
        tier.failing.store(true, Ordering::SeqCst);
        let coordinator = TierCoordinator::<UserData>::new(
            CategoryConfig::user_data(),
            backends(Some(tier.clone()), &clock),
        );

        coordinator.put("a", serde_json::json!(1), 4, None).unwrap();
        coordinator.put("b", serde_json::json!(2), 4, None).unwrap();
        assert_eq!(coordinator.clear(), 2);
        settle().await;

        assert!(coordinator.get("a").await.is_none());
        assert!(coordinator.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_write_of_live_key_lands_in_fallback() {
        let clock = ManualClock::starting_now();
        let tier = Arc::new(FakeTier::default());
        tier.failing.store(true, Ordering::SeqCst);
        let shared = backends(Some(tier.clone()), &clock);

        let first = TierCoordinator::<UserData>::new(CategoryConfig::user_data(), shared.clone());
        first.put("prefs", serde_json::json!({"lang": "de"}), 16, None).unwrap();
        settle().await;

        // Cold memory, persistent tier marked down.
        let second = TierCoordinator::<UserData>::new(CategoryConfig::user_data(), shared);
        let (payload, source) = second.get("prefs").await.unwrap();
        assert_eq!(payload["lang"], "de");
        assert_eq!(source, HitSource::Fallback);
    }
}
