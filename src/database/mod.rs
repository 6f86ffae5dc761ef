//! Database module exports.

mod cache_tier;
mod mongo;
mod task_store;

pub use cache_tier::{CacheDocument, MongoCacheTier};
pub use mongo::Database;
pub use task_store::MongoTaskStore;
