//! Session - the single surface pages use.
//!
//! One `Session` is built per signed-in user and torn down with
//! [`Session::cleanup`] on sign-out. Nothing here is global.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{AssetCache, CacheError, CategoryId, FallbackTier, GlobalStats, PersistentTier};
use crate::config::Config;
use crate::tasks::{
    GenerationParams, PollingScheduler, ProgressListener, ProgressSample, ProgressSynthesizer,
    StartOptions, Subscription, Task, TaskError, TaskEventHandler, TaskRegistry, TaskStatus,
    TaskStore, VideoGenerationApi,
};
use crate::utils::{SharedClock, SystemClock};

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionBackends {
    pub persistent: Option<Arc<dyn PersistentTier>>,
    pub task_store: Option<Arc<dyn TaskStore>>,
    pub api: Arc<dyn VideoGenerationApi>,
    pub clock: SharedClock,
}

impl SessionBackends {
    /// No persistence, system clock.
    pub fn memory_only(api: Arc<dyn VideoGenerationApi>) -> Self {
        Self {
            persistent: None,
            task_store: None,
            api,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Feeds task events into the progress synthesizer before the page sees them.
struct ProgressBridge {
    inner: Arc<dyn TaskEventHandler>,
    tasks: Arc<TaskRegistry>,
    progress: Arc<ProgressSynthesizer>,
}

impl TaskEventHandler for ProgressBridge {
    fn on_task_update(&self, task: &Task) {
        if self.tasks.contains(&task.id) {
            self.progress.record_report(task);
        }
        self.inner.on_task_update(task);
    }

    fn on_task_complete(&self, task: &Task) {
        if self.tasks.contains(&task.id) {
            self.progress.record_completion(&task.id);
        }
        self.inner.on_task_complete(task);
    }

    fn on_task_failed(&self, task: &Task) {
        if self.tasks.contains(&task.id) {
            self.progress.record_failure(&task.id);
        }
        self.inner.on_task_failed(task);
    }
}

/// Per-user facade over the asset cache and job tracking.
pub struct Session {
    user_id: String,
    cache: AssetCache,
    tasks: Arc<TaskRegistry>,
    polling: PollingScheduler,
    progress: Arc<ProgressSynthesizer>,
    api: Arc<dyn VideoGenerationApi>,
    clock: SharedClock,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    /// Recovered orphans not yet reported to a handler.
    orphans: Mutex<Vec<Task>>,
}

impl Session {
    /// Build every service of the session. Nothing runs until
    /// [`initialize`](Self::initialize).
    pub fn new(config: &Config, user_id: impl Into<String>, backends: SessionBackends) -> Result<Self, CacheError> {
        let clock = backends.clock;
        let fallback = FallbackTier::new(config.fallback_max_items, config.fallback_max_item_bytes);
        let cache = AssetCache::new(&config.categories, backends.persistent, fallback, clock.clone())?;

        let tasks = Arc::new(TaskRegistry::new(
            backends.task_store,
            clock.clone(),
            config.orphan_max_age,
        ));
        let polling = PollingScheduler::new(tasks.clone(), backends.api.clone(), config.poll_interval());
        let progress = Arc::new(ProgressSynthesizer::new(clock.clone(), config.progress_time_constant));

        // However a task leaves the registry, its samples and listeners go too.
        let weak = Arc::downgrade(&progress);
        tasks.on_removal(Arc::new(move |id: &str| {
            if let Some(progress) = weak.upgrade() {
                progress.forget(id);
            }
        }));

        Ok(Self {
            user_id: user_id.into(),
            cache,
            tasks,
            polling,
            progress,
            api: backends.api,
            clock,
            sweep_interval: config.sweep_interval,
            sweeper: Mutex::new(None),
            orphans: Mutex::new(Vec::new()),
        })
    }

    /// Recover the user's unfinished jobs and start the cache sweeper.
    ///
    /// Polling is armed if [`start_polling`](Self::start_polling) was
    /// already called and recovered jobs are active. Jobs that timed out
    /// while the user was away are reported through `on_task_failed`,
    /// right away or once polling starts.
    pub async fn initialize(&self) -> Result<Vec<Task>, TaskError> {
        let recovered = self.tasks.initialize(&self.user_id).await?;
        for task in &recovered {
            if task.status == TaskStatus::Failed {
                self.progress.record_failure(&task.id);
                self.orphans.lock().push(task.clone());
            }
            self.progress.track(task);
        }
        self.report_orphans();

        {
            let mut sweeper = self.sweeper.lock();
            if sweeper.is_none() {
                *sweeper = Some(self.cache.spawn_sweeper(self.sweep_interval));
            }
        }

        self.polling.refresh();
        info!(
            "Session initialized for {} ({} tasks recovered)",
            self.user_id,
            recovered.len()
        );
        Ok(recovered)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn cache(&self) -> &AssetCache {
        &self.cache
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn polling(&self) -> &PollingScheduler {
        &self.polling
    }

    pub fn progress(&self) -> &ProgressSynthesizer {
        &self.progress
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.cache.global_stats()
    }

    pub fn active_tasks(&self) -> Vec<Task> {
        self.tasks.active_tasks()
    }

    /// Submit a generation job and start tracking it.
    pub async fn submit_job(&self, params: &GenerationParams) -> Result<Task, TaskError> {
        let id = self.api.create_video(params).await?;
        let task = Task::pending(id, self.user_id.clone(), self.clock.now());

        if !self.tasks.register(task.clone()) {
            return Err(TaskError::Removed(task.id));
        }
        self.progress.track(&task);
        self.polling.refresh();

        info!("Submitted task {}", task.id);
        Ok(task)
    }

    /// Cancel tracking of a job. No further events or samples are
    /// delivered for it. Idempotent.
    ///
    /// Same as removing through [`tasks`](Self::tasks); the registry's
    /// removal hooks drop progress state and re-evaluate the timer.
    pub fn remove_task(&self, id: &str) -> bool {
        self.tasks.remove_task(id)
    }

    /// Start polling with `handler` receiving lifecycle events.
    pub fn start_polling(&self, handler: Arc<dyn TaskEventHandler>) {
        let bridge = ProgressBridge {
            inner: handler,
            tasks: self.tasks.clone(),
            progress: self.progress.clone(),
        };
        let installed = self.polling.start(StartOptions {
            user_id: self.user_id.clone(),
            handler: Arc::new(bridge),
        });
        if installed {
            self.report_orphans();
        }
    }

    /// Hand queued orphan failures to the polling handler, if there is one.
    fn report_orphans(&self) {
        let Some(handler) = self.polling.handler() else {
            return;
        };
        let orphans = std::mem::take(&mut *self.orphans.lock());
        for task in orphans {
            // Removed before anyone was told.
            if !self.tasks.contains(&task.id) {
                continue;
            }
            debug!("Reporting timed-out task {}", task.id);
            handler.on_task_failed(&task);
        }
    }

    pub fn stop_polling(&self) {
        self.polling.stop();
    }

    /// Subscribe to progress samples of a tracked job.
    pub fn subscribe_progress(&self, task_id: &str, listener: ProgressListener) -> Result<Subscription, TaskError> {
        let task = self.tasks.require(task_id)?;
        self.progress.track(&task);
        Ok(self.progress.subscribe(task_id, listener))
    }

    /// Progress of `task_id`, synthesized from `fallback_status` when the
    /// job is not tracked.
    pub fn progress_or(&self, task_id: &str, fallback_status: TaskStatus) -> ProgressSample {
        self.progress.get_progress_with_fallback(task_id, fallback_status)
    }

    /// Tear the session down on sign-out.
    ///
    /// Stops the timer and sweeper, drops job state and clears cached user
    /// data. Shared assets stay cached.
    pub fn cleanup(&self) {
        self.polling.stop();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.tasks.cleanup();
        self.progress.clear();
        self.orphans.lock().clear();
        let cleared = self.cache.clear_category(CategoryId::UserData);
        debug!("Cleared {} user-data entries", cleared);
        info!("Session cleaned up for {}", self.user_id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.polling.stop();
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("cache", &self.cache)
            .field("tasks", &self.tasks)
            .field("polling", &self.polling)
            .finish()
    }
}
