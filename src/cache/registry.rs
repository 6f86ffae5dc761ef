//! Cache registry - Central management for the per-category coordinators.

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{CacheCategory, CacheError, CategoryConfig, CategoryId, TierBackends, TierCoordinator};

/// Type-erased operations the registry runs across all categories.
pub(crate) trait ErasedTier: Send + Sync {
    fn config(&self) -> CategoryConfig;
    fn usage(&self) -> (u64, u64);
    fn clear(&self) -> usize;
    fn purge_expired_memory(&self) -> usize;
}

impl<C: CacheCategory> ErasedTier for TierCoordinator<C> {
    fn config(&self) -> CategoryConfig {
        TierCoordinator::config(self)
    }

    fn usage(&self) -> (u64, u64) {
        TierCoordinator::usage(self)
    }

    fn clear(&self) -> usize {
        TierCoordinator::clear(self)
    }

    fn purge_expired_memory(&self) -> usize {
        TierCoordinator::purge_expired_memory(self)
    }
}

/// Internal registry entry storing a coordinator both typed and erased.
struct RegisteredTier {
    typed: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn ErasedTier>,
    type_name: &'static str,
}

/// Registry of one [`TierCoordinator`] per category.
///
/// Coordinators are created once per session; lookups are by marker type
/// so a category can only be read with the payload type it was created for.
pub struct CacheRegistry {
    tiers: RwLock<BTreeMap<CategoryId, RegisteredTier>>,
    backends: TierBackends,
}

impl CacheRegistry {
    /// Create an empty registry whose coordinators share `backends`.
    pub fn new(backends: TierBackends) -> Self {
        Self {
            tiers: RwLock::new(BTreeMap::new()),
            backends,
        }
    }

    pub fn backends(&self) -> &TierBackends {
        &self.backends
    }

    /// Create the coordinator for `C` and register it.
    ///
    /// Returns the existing coordinator if `C` is already registered.
    pub fn register<C: CacheCategory>(&self, config: CategoryConfig) -> Result<Arc<TierCoordinator<C>>, CacheError> {
        if let Some(existing) = self.get::<C>()? {
            return Ok(existing);
        }

        let mut tiers = self.tiers.write();

        // Lost a race with another registration.
        if let Some(entry) = tiers.get(&C::ID) {
            return Self::downcast::<C>(entry);
        }

        debug!("Creating cache coordinator: {}", C::ID);

        let coordinator = Arc::new(TierCoordinator::<C>::new(config, self.backends.clone()));
        tiers.insert(
            C::ID,
            RegisteredTier {
                typed: coordinator.clone(),
                erased: coordinator.clone(),
                type_name: type_name::<C>(),
            },
        );

        Ok(coordinator)
    }

    /// Get the coordinator for `C`.
    ///
    /// Returns `Ok(None)` if the category was never registered and an error
    /// if it was registered with another marker type.
    pub fn get<C: CacheCategory>(&self) -> Result<Option<Arc<TierCoordinator<C>>>, CacheError> {
        let tiers = self.tiers.read();
        tiers.get(&C::ID).map(Self::downcast::<C>).transpose()
    }

    /// Get the coordinator for `C`, failing if it is not registered.
    pub fn require<C: CacheCategory>(&self) -> Result<Arc<TierCoordinator<C>>, CacheError> {
        self.get::<C>()?
            .ok_or(CacheError::UnknownCategory(C::ID))
    }

    fn downcast<C: CacheCategory>(entry: &RegisteredTier) -> Result<Arc<TierCoordinator<C>>, CacheError> {
        Arc::clone(&entry.typed)
            .downcast::<TierCoordinator<C>>()
            .map_err(|_| CacheError::CategoryMismatch {
                category: C::ID,
                registered: entry.type_name,
                requested: type_name::<C>(),
            })
    }

    pub(crate) fn erased(&self, id: CategoryId) -> Option<Arc<dyn ErasedTier>> {
        self.tiers.read().get(&id).map(|entry| Arc::clone(&entry.erased))
    }

    pub(crate) fn all_erased(&self) -> Vec<Arc<dyn ErasedTier>> {
        self.tiers
            .read()
            .values()
            .map(|entry| Arc::clone(&entry.erased))
            .collect()
    }

    /// Check if a category is registered.
    pub fn contains(&self, id: CategoryId) -> bool {
        self.tiers.read().contains_key(&id)
    }

    /// Registered categories in id order.
    pub fn categories(&self) -> Vec<CategoryId> {
        self.tiers.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tiers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.read().is_empty()
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers = self.tiers.read();
        f.debug_struct("CacheRegistry")
            .field("category_count", &tiers.len())
            .field("categories", &tiers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::{Blob, FallbackTier, Images, PersistentHealth};
    use crate::utils::ManualClock;

    /// Impostor claiming the image category with a different payload.
    struct TextImages;

    impl CacheCategory for TextImages {
        const ID: CategoryId = CategoryId::Image;
        type Payload = String;
    }

    fn registry() -> CacheRegistry {
        CacheRegistry::new(TierBackends {
            persistent: None,
            health: Arc::new(PersistentHealth::new(false)),
            fallback: FallbackTier::new(10, 1024),
            clock: Arc::new(ManualClock::starting_now()),
        })
    }

    #[test]
    fn test_register_returns_same_coordinator() {
        let registry = registry();
        let first = registry.register::<Images>(CategoryConfig::image()).unwrap();
        let second = registry.register::<Images>(CategoryConfig::image()).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.categories(), vec![CategoryId::Image]);
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let registry = registry();
        registry.register::<Images>(CategoryConfig::image()).unwrap();

        let err = registry.get::<TextImages>().unwrap_err();
        assert!(matches!(err, CacheError::CategoryMismatch { category: CategoryId::Image, .. }));
    }

    #[test]
    fn test_require_unknown_category() {
        let registry = registry();
        assert_eq!(
            registry.require::<Images>().unwrap_err(),
            CacheError::UnknownCategory(CategoryId::Image)
        );
    }

    #[test]
    fn test_erased_view_sees_typed_writes() {
        let registry = registry();
        let images = registry.register::<Images>(CategoryConfig::image()).unwrap();
        images
            .put("a", Blob::new("image/png", vec![0; 4]), 4, None)
            .unwrap();

        let erased = registry.erased(CategoryId::Image).unwrap();
        assert_eq!(erased.usage(), (1, 4));
        assert_eq!(erased.clear(), 1);
        assert_eq!(images.usage(), (0, 0));
    }
}
