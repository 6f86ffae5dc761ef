//! Reelcache - Client resource cache and video-generation task tracking.
//!
//! ## Architecture
//!
//! - `config` - Environment configuration
//! - `cache` - Budgeted multi-tier asset cache
//! - `database` - MongoDB persistent tier and task store
//! - `tasks` - Task registry, status polling and progress synthesis
//! - `session` - Per-user facade wiring everything together
//! - `utils` - Clock and formatting helpers

pub mod cache;
pub mod config;
pub mod database;
pub mod session;
pub mod tasks;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use session::{Session, SessionBackends};
