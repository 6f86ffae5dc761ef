//! Reelcache maintenance tool.
//!
//! Connects to the configured MongoDB, purges expired persistent cache
//! entries, recovers the tasks of `SESSION_USER_ID` (failing orphans) and
//! prints a JSON report.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reelcache::cache::{AssetCache, FallbackTier, GlobalStats, PersistentTier, SweepReport};
use reelcache::config::Config;
use reelcache::database::{Database, MongoCacheTier, MongoTaskStore};
use reelcache::tasks::{TaskRegistry, TaskStatus, TaskStore};
use reelcache::utils::{SharedClock, SystemClock, format_bytes};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Debug, Serialize)]
struct MaintenanceReport {
    persistent_connected: bool,
    sweep: SweepReport,
    recovered_tasks: usize,
    orphaned_tasks: usize,
    stats: GlobalStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before anything else)
    dotenvy::dotenv().ok();

    // If RUST_LOG is not set, default to "info" level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("reelcache=info,mongodb=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting reelcache maintenance...");

    let config = Config::from_env();
    info!("Configuration loaded successfully");
    info!("Device class: {:?}, poll interval {:?}", config.device_class, config.poll_interval());

    let db = match &config.mongodb_uri {
        Some(uri) => match Database::connect(uri, &config.mongodb_database).await {
            Ok(db) => Some(db),
            Err(e) => {
                warn!("MongoDB unavailable, running memory-only: {}", e);
                None
            }
        },
        None => {
            info!("MONGODB_URI not set, running memory-only");
            None
        }
    };

    let clock: SharedClock = Arc::new(SystemClock);
    let persistent = db
        .as_ref()
        .map(|db| Arc::new(MongoCacheTier::new(db)) as Arc<dyn PersistentTier>);
    let cache = AssetCache::new(
        &config.categories,
        persistent,
        FallbackTier::new(config.fallback_max_items, config.fallback_max_item_bytes),
        clock.clone(),
    )?;

    let sweep = cache.sweep_expired().await;
    info!(
        "Purged {} expired persistent entries",
        sweep.persistent
    );

    let (recovered_tasks, orphaned_tasks) = match (&db, &config.session_user_id) {
        (Some(db), Some(user_id)) => recover_tasks(db, user_id, &config, clock).await?,
        (None, Some(_)) => {
            warn!("SESSION_USER_ID set but no task store is available");
            (0, 0)
        }
        _ => (0, 0),
    };

    let stats = cache.global_stats();
    let budget: u64 = config.categories.iter().map(|c| c.max_total_bytes).sum();
    info!(
        "Cache budget {} across {} categories",
        format_bytes(budget),
        config.categories.len()
    );

    let report = MaintenanceReport {
        persistent_connected: db.is_some(),
        sweep,
        recovered_tasks,
        orphaned_tasks,
        stats,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

/// Recover `user_id`'s tasks. Returns `(recovered, orphaned)`.
async fn recover_tasks(
    db: &Database,
    user_id: &str,
    config: &Config,
    clock: SharedClock,
) -> anyhow::Result<(usize, usize)> {
    let store = Arc::new(MongoTaskStore::new(db));
    let registry = TaskRegistry::new(
        Some(store.clone() as Arc<dyn TaskStore>),
        clock,
        config.orphan_max_age,
    );

    let recovered = registry.initialize(user_id).await?;
    let orphans: Vec<_> = recovered
        .iter()
        .filter(|task| task.status == TaskStatus::Failed)
        .collect();

    // Registry writes are in the background; make sure orphans land before exit.
    for task in &orphans {
        store.save(task).await?;
        info!("Task {} marked failed: {}", task.id, task.status_text);
    }

    Ok((recovered.len(), orphans.len()))
}
