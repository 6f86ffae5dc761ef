//! Cache error types.

use thiserror::Error;

use super::CategoryId;

/// Errors surfaced to callers of the cache.
///
/// Persistent-tier failures never appear here; they only flip the
/// readiness flag.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A single item is larger than its category's whole byte budget.
    #[error("{category} item of {size_bytes} bytes exceeds the {max_total_bytes} byte budget")]
    CacheFull {
        category: CategoryId,
        size_bytes: u64,
        max_total_bytes: u64,
    },

    /// Payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(String),

    /// Category was registered with a different payload type.
    #[error("category {category} is registered as {registered}, requested {requested}")]
    CategoryMismatch {
        category: CategoryId,
        registered: &'static str,
        requested: &'static str,
    },

    /// Category has no registered coordinator.
    #[error("category {0} is not configured")]
    UnknownCategory(CategoryId),
}
