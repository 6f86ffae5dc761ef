//! Cache statistics - hit/miss counters and usage snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use super::{CacheRegistry, CategoryId};

#[derive(Debug, Default)]
struct HitCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Usage and counters of one category at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSnapshot {
    pub category: CategoryId,
    pub item_count: u64,
    pub total_bytes: u64,
    pub max_items: u64,
    pub max_total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Totals across categories.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    /// Whether the persistent tier is currently accepting reads and writes.
    pub persistent_ready: bool,
    pub total_items: u64,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Result of [`CacheStatsTracker::global_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalStats {
    pub summary: StatsSummary,
    pub per_category: Vec<CacheSnapshot>,
}

/// Session-lifetime hit/miss counters per category.
///
/// Counters only ever grow. Reading stats never mutates anything.
#[derive(Debug, Default)]
pub struct CacheStatsTracker {
    counters: DashMap<CategoryId, HitCounters>,
}

impl CacheStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, category: CategoryId) {
        self.counters
            .entry(category)
            .or_default()
            .hits
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, category: CategoryId) {
        self.counters
            .entry(category)
            .or_default()
            .misses
            .fetch_add(1, Ordering::Relaxed);
    }

    /// `(hits, misses)` for one category.
    pub fn counts(&self, category: CategoryId) -> (u64, u64) {
        self.counters
            .get(&category)
            .map(|c| (c.hits.load(Ordering::Relaxed), c.misses.load(Ordering::Relaxed)))
            .unwrap_or((0, 0))
    }

    /// Snapshot of every registered category plus overall totals.
    pub fn global_stats(&self, registry: &CacheRegistry) -> GlobalStats {
        let per_category: Vec<CacheSnapshot> = registry
            .all_erased()
            .iter()
            .map(|tier| {
                let config = tier.config();
                let (item_count, total_bytes) = tier.usage();
                let (hits, misses) = self.counts(config.id);
                CacheSnapshot {
                    category: config.id,
                    item_count,
                    total_bytes,
                    max_items: config.max_items,
                    max_total_bytes: config.max_total_bytes,
                    hits,
                    misses,
                    hit_rate: hit_rate(hits, misses),
                }
            })
            .collect();

        let hits = per_category.iter().map(|s| s.hits).sum();
        let misses = per_category.iter().map(|s| s.misses).sum();

        GlobalStats {
            summary: StatsSummary {
                persistent_ready: registry.backends().health.is_ready(),
                total_items: per_category.iter().map(|s| s.item_count).sum(),
                total_bytes: per_category.iter().map(|s| s.total_bytes).sum(),
                hits,
                misses,
                hit_rate: hit_rate(hits, misses),
            },
            per_category,
        }
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::{
        Blob, CategoryConfig, FallbackTier, Images, PersistentHealth, Templates, TierBackends,
    };
    use crate::utils::ManualClock;

    #[test]
    fn test_counters_per_category() {
        let stats = CacheStatsTracker::new();
        stats.record_hit(CategoryId::Image);
        stats.record_hit(CategoryId::Image);
        stats.record_miss(CategoryId::Image);
        stats.record_miss(CategoryId::Video);

        assert_eq!(stats.counts(CategoryId::Image), (2, 1));
        assert_eq!(stats.counts(CategoryId::Video), (0, 1));
        assert_eq!(stats.counts(CategoryId::Template), (0, 0));
    }

    #[test]
    fn test_global_stats_combines_usage_and_counters() {
        let registry = CacheRegistry::new(TierBackends {
            persistent: None,
            health: Arc::new(PersistentHealth::new(false)),
            fallback: FallbackTier::new(10, 1024),
            clock: Arc::new(ManualClock::starting_now()),
        });
        let images = registry.register::<Images>(CategoryConfig::image()).unwrap();
        registry.register::<Templates>(CategoryConfig::template()).unwrap();
        images.put("a", Blob::new("image/png", vec![0; 10]), 10, None).unwrap();
        images.put("b", Blob::new("image/png", vec![0; 30]), 30, None).unwrap();

        let stats = CacheStatsTracker::new();
        stats.record_hit(CategoryId::Image);
        stats.record_hit(CategoryId::Image);
        stats.record_hit(CategoryId::Image);
        stats.record_miss(CategoryId::Template);

        let global = stats.global_stats(&registry);

        assert!(!global.summary.persistent_ready);
        assert_eq!(global.summary.total_items, 2);
        assert_eq!(global.summary.total_bytes, 40);
        assert_eq!(global.summary.hits, 3);
        assert_eq!(global.summary.misses, 1);
        assert!((global.summary.hit_rate - 0.75).abs() < f64::EPSILON);

        let image = &global.per_category[0];
        assert_eq!(image.category, CategoryId::Image);
        assert_eq!(image.item_count, 2);
        assert!((image.hit_rate - 1.0).abs() < f64::EPSILON);

        // Reading twice yields the same view.
        assert_eq!(stats.global_stats(&registry), global);
    }
}
