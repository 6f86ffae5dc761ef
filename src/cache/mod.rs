//! Cache module - Budgeted multi-tier asset cache.
//!
//! Remote assets (images, template metadata, videos, user data) are cached
//! per category, each with its own byte, item and TTL budget.
//!
//! ## Architecture
//!
//! - `CacheStore` - In-memory entries of one category with LRU eviction
//! - `TierCoordinator` - Memory tier plus persistent and fallback tiers
//! - `CacheRegistry` - One coordinator per category, looked up by marker type
//! - `CacheStatsTracker` - Hit/miss counters and usage snapshots
//! - `AssetCache` - The surface sessions expose to pages
//!
//! ## Usage
//!
//! ```ignore
//! let cover = match cache.get::<Images>("tpl-42/cover").await? {
//!     Some(blob) => blob,
//!     None => {
//!         let blob = fetch_cover().await?;
//!         cache.put::<Images>("tpl-42/cover", blob.clone(), blob.len() as u64, None)?;
//!         blob
//!     }
//! };
//! ```

mod assets;
mod category;
mod config;
mod coordinator;
mod error;
mod fallback;
mod registry;
mod stats;
pub mod store;
mod tier;

pub use assets::{AssetCache, SweepReport};
pub use category::{Blob, CacheCategory, CachePayload, CategoryId, Images, Templates, UserData, Videos};
pub use config::CategoryConfig;
pub use coordinator::{HitSource, TierBackends, TierCoordinator};
pub use error::CacheError;
pub use fallback::FallbackTier;
pub use registry::CacheRegistry;
pub use stats::{CacheSnapshot, CacheStatsTracker, GlobalStats, StatsSummary};
pub use store::{CacheEntry, CacheStore};
pub use tier::{PersistedRecord, PersistentHealth, PersistentTier, TierError};
