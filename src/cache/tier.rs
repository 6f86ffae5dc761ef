//! Persistent tier contract and readiness tracking.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use super::CategoryId;

/// Errors raised by a persistent tier implementation.
///
/// These never reach cache callers; they are logged and degrade the tier.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("persistent tier unavailable: {0}")]
    Unavailable(String),

    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("stored record is corrupt: {0}")]
    Codec(String),
}

/// An encoded cache entry as held by a durable tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    pub category: CategoryId,
    pub key: String,
    pub payload: Vec<u8>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PersistedRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Durable key/value blob store keyed by `(category, key)`.
///
/// Availability is best-effort: callers treat every error as a reason to
/// fall back to memory-only operation.
#[async_trait]
pub trait PersistentTier: Send + Sync {
    /// Check that the backing store answers.
    async fn ping(&self) -> Result<(), TierError>;

    async fn read(&self, category: CategoryId, key: &str) -> Result<Option<PersistedRecord>, TierError>;

    async fn write(&self, record: &PersistedRecord) -> Result<(), TierError>;

    async fn remove(&self, category: CategoryId, key: &str) -> Result<(), TierError>;

    /// Remove every record of `category`.
    async fn clear(&self, category: CategoryId) -> Result<u64, TierError>;

    /// Remove records of `category` that expired before `now`.
    async fn purge_expired(&self, category: CategoryId, now: DateTime<Utc>) -> Result<u64, TierError>;
}

/// Readiness flag of the persistent tier, shared by all categories.
#[derive(Debug)]
pub struct PersistentHealth {
    ready: AtomicBool,
}

impl PersistentHealth {
    pub fn new(ready: bool) -> Self {
        Self {
            ready: AtomicBool::new(ready),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Degrade to memory-only. Logs only on the first transition.
    pub fn mark_unavailable(&self, reason: &str) {
        if self.ready.swap(false, Ordering::AcqRel) {
            warn!("Persistent cache tier unavailable, running memory-only: {}", reason);
        }
    }

    pub fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::AcqRel) {
            info!("Persistent cache tier is available again");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_transitions() {
        let health = PersistentHealth::new(true);
        assert!(health.is_ready());

        health.mark_unavailable("disk full");
        health.mark_unavailable("still full");
        assert!(!health.is_ready());

        health.mark_ready();
        assert!(health.is_ready());
    }
}
