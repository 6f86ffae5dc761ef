//! Asset cache - the cache surface a session exposes to pages.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{
    CacheCategory, CacheError, CacheRegistry, CacheStatsTracker, CategoryConfig, CategoryId,
    FallbackTier, GlobalStats, Images, PersistentHealth, PersistentTier, Templates, TierBackends,
    UserData, Videos,
};
use crate::utils::SharedClock;

/// Counts removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub memory: usize,
    pub persistent: u64,
    pub fallback: usize,
}

/// Multi-category, multi-tier asset cache.
///
/// Cloning is cheap and shares the same tiers and counters.
#[derive(Clone)]
pub struct AssetCache {
    registry: Arc<CacheRegistry>,
    stats: Arc<CacheStatsTracker>,
}

impl AssetCache {
    /// Build a cache with one coordinator per entry of `categories`.
    pub fn new(
        categories: &[CategoryConfig],
        persistent: Option<Arc<dyn PersistentTier>>,
        fallback: FallbackTier,
        clock: SharedClock,
    ) -> Result<Self, CacheError> {
        let health = Arc::new(PersistentHealth::new(persistent.is_some()));
        if persistent.is_none() {
            info!("No persistent cache tier configured, running memory-only");
        }

        let registry = Arc::new(CacheRegistry::new(TierBackends {
            persistent,
            health,
            fallback,
            clock,
        }));

        for config in categories {
            match config.id {
                CategoryId::Image => registry.register::<Images>(config.clone()).map(drop)?,
                CategoryId::Template => registry.register::<Templates>(config.clone()).map(drop)?,
                CategoryId::Video => registry.register::<Videos>(config.clone()).map(drop)?,
                CategoryId::UserData => registry.register::<UserData>(config.clone()).map(drop)?,
            }
        }

        Ok(Self {
            registry,
            stats: Arc::new(CacheStatsTracker::new()),
        })
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    /// Look up `key` in category `C`, recording a hit or a miss.
    pub async fn get<C: CacheCategory>(&self, key: &str) -> Result<Option<C::Payload>, CacheError> {
        let coordinator = self.registry.require::<C>()?;
        match coordinator.get(key).await {
            Some((payload, source)) => {
                debug!("Cache hit {}/{} from {:?}", C::ID, key, source);
                self.stats.record_hit(C::ID);
                Ok(Some(payload))
            }
            None => {
                debug!("Cache miss {}/{}", C::ID, key);
                self.stats.record_miss(C::ID);
                Ok(None)
            }
        }
    }

    /// Store `payload` under `key`, using the category's default TTL when
    /// `ttl` is `None`.
    pub fn put<C: CacheCategory>(
        &self,
        key: &str,
        payload: C::Payload,
        size_bytes: u64,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.registry.require::<C>()?.put(key, payload, size_bytes, ttl)
    }

    /// Return the cached value or fetch, store and return it.
    ///
    /// `fetch` reports the payload and its size. Fetch errors are passed
    /// through; a payload too large to cache is still returned.
    pub async fn get_or_fetch<C, F, Fut, E>(&self, key: &str, fetch: F) -> Result<C::Payload, E>
    where
        C: CacheCategory,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(C::Payload, u64), E>>,
        E: From<CacheError>,
    {
        if let Some(payload) = self.get::<C>(key).await? {
            return Ok(payload);
        }

        let (payload, size_bytes) = fetch().await?;
        match self.put::<C>(key, payload.clone(), size_bytes, None) {
            Ok(()) => {}
            Err(e @ CacheError::CacheFull { .. }) => debug!("Serving uncached: {}", e),
            Err(e) => return Err(e.into()),
        }
        Ok(payload)
    }

    /// Remove `key` from category `C`. Returns whether memory held it.
    pub fn delete<C: CacheCategory>(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.registry.require::<C>()?.delete(key))
    }

    /// Clear a single category by id.
    pub fn clear_category(&self, id: CategoryId) -> usize {
        self.registry
            .erased(id)
            .map(|tier| tier.clear())
            .unwrap_or(0)
    }

    /// Clear every category in every tier.
    pub fn clear_all(&self) -> usize {
        let cleared: usize = self.registry.all_erased().iter().map(|tier| tier.clear()).sum();
        info!("Cleared {} cached entries", cleared);
        cleared
    }

    /// Usage and hit/miss counters for every category.
    pub fn global_stats(&self) -> GlobalStats {
        self.stats.global_stats(&self.registry)
    }

    pub fn stats(&self) -> &CacheStatsTracker {
        &self.stats
    }

    pub fn persistent_ready(&self) -> bool {
        self.registry.backends().health.is_ready()
    }

    /// Remove expired entries from every tier.
    ///
    /// Also pings an unavailable persistent tier and restores it if it
    /// answers.
    pub async fn sweep_expired(&self) -> SweepReport {
        let backends = self.registry.backends().clone();
        let now = backends.clock.now();
        let mut report = SweepReport::default();

        for tier in self.registry.all_erased() {
            report.memory += tier.purge_expired_memory();
        }
        report.fallback = backends.fallback.purge_expired(now);

        if let Some(persistent) = &backends.persistent {
            if !backends.health.is_ready() {
                match persistent.ping().await {
                    Ok(()) => backends.health.mark_ready(),
                    Err(e) => debug!("Persistent tier still unavailable: {}", e),
                }
            }

            if backends.health.is_ready() {
                for id in self.registry.categories() {
                    match persistent.purge_expired(id, now).await {
                        Ok(count) => report.persistent += count,
                        Err(e) => {
                            backends.health.mark_unavailable(&e.to_string());
                            break;
                        }
                    }
                }
            }
        }

        if report != SweepReport::default() {
            debug!(
                "Sweep removed {} memory, {} persistent, {} fallback entries",
                report.memory, report.persistent, report.fallback
            );
        }
        report
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `period` until the
    /// returned handle is aborted.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep_expired().await;
            }
        })
    }
}

impl std::fmt::Debug for AssetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetCache")
            .field("registry", &self.registry)
            .field("persistent_ready", &self.persistent_ready())
            .finish()
    }
}
