//! Task registry - authoritative state of in-flight generation jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{StatusReport, Task, TaskError, TaskStatus};
use super::model::status_text;
use crate::utils::{SharedClock, format_duration};

/// Durable storage for task records, used to recover jobs after a reload.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks of `user_id` that were still pending or processing.
    async fn load_active(&self, user_id: &str) -> Result<Vec<Task>, TaskError>;

    async fn save(&self, task: &Task) -> Result<(), TaskError>;

    async fn remove(&self, id: &str) -> Result<(), TaskError>;
}

/// Called with the id of every task that leaves the registry.
pub type RemovalHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Finished tasks kept readable before the oldest are dropped.
pub const DEFAULT_TERMINAL_RETENTION: usize = 32;

/// Outcome of applying a status report.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Updated(Task),
    Completed(Task),
    Failed(Task),
}

impl Transition {
    pub fn task(&self) -> &Task {
        match self {
            Self::Updated(task) | Self::Completed(task) | Self::Failed(task) => task,
        }
    }
}

/// In-memory task registry with optional write-through to a [`TaskStore`].
///
/// Terminal tasks stay readable through [`get`](Self::get) but are never
/// part of [`active_tasks`](Self::active_tasks). Only the most recently
/// finished ones are kept; older ones are dropped as new tasks finish.
///
/// Every way a task leaves the registry, user removal or pruning, runs the
/// hooks installed with [`on_removal`](Self::on_removal).
pub struct TaskRegistry {
    tasks: DashMap<String, Task>,
    /// Ids removed by the user; nothing may bring them back.
    removed: Arc<DashSet<String>>,
    store: Option<Arc<dyn TaskStore>>,
    clock: SharedClock,
    max_lifetime: Duration,
    terminal_retention: usize,
    user_id: RwLock<Option<String>>,
    hooks: RwLock<Vec<RemovalHook>>,
}

impl TaskRegistry {
    /// Create a registry. Recovered tasks older than `max_lifetime` are
    /// treated as orphaned.
    pub fn new(store: Option<Arc<dyn TaskStore>>, clock: SharedClock, max_lifetime: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            removed: Arc::new(DashSet::new()),
            store,
            clock,
            max_lifetime,
            terminal_retention: DEFAULT_TERMINAL_RETENTION,
            user_id: RwLock::new(None),
            hooks: RwLock::new(Vec::new()),
        }
    }

    /// Keep at most `count` finished tasks, plus the one that just finished.
    pub fn with_terminal_retention(mut self, count: usize) -> Self {
        self.terminal_retention = count;
        self
    }

    /// Run `hook` for every task removed from now on.
    pub fn on_removal(&self, hook: RemovalHook) {
        self.hooks.write().push(hook);
    }

    /// Recover the tasks `user_id` left active in a previous session.
    ///
    /// Returns every recovered task. Orphans are returned already failed
    /// with a timeout error and are not polled.
    pub async fn initialize(&self, user_id: &str) -> Result<Vec<Task>, TaskError> {
        *self.user_id.write() = Some(user_id.to_string());

        let Some(store) = &self.store else {
            debug!("No task store configured, nothing to recover");
            return Ok(Vec::new());
        };

        let stored = store.load_active(user_id).await?;
        let now = self.clock.now();
        let mut recovered = Vec::with_capacity(stored.len());

        for mut task in stored {
            if task.status.is_terminal() || self.removed.contains(&task.id) || self.tasks.contains_key(&task.id) {
                continue;
            }

            if task.age(now) > self.max_lifetime {
                warn!(
                    "Task {} has been running for {}, marking it failed",
                    task.id,
                    format_duration(task.age(now))
                );
                task.fail(
                    format!("Timed out after {}", format_duration(self.max_lifetime)),
                    now,
                );
                self.persist(task.clone());
            }

            self.tasks.insert(task.id.clone(), task.clone());
            recovered.push(task);
        }

        recovered.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        info!("Recovered {} tasks for user {}", recovered.len(), user_id);
        Ok(recovered)
    }

    /// Track a newly submitted task. Returns `false` if its id was removed
    /// earlier in this session.
    pub fn register(&self, task: Task) -> bool {
        if self.removed.contains(&task.id) {
            warn!("Ignoring registration of removed task {}", task.id);
            return false;
        }

        debug!("Registered task {} ({})", task.id, task.status);
        self.persist(task.clone());
        self.tasks.insert(task.id.clone(), task);
        true
    }

    /// Forget a task regardless of its state. Idempotent.
    ///
    /// Later status reports for `id` are discarded.
    pub fn remove_task(&self, id: &str) -> bool {
        let first_removal = self.removed.insert(id.to_string());
        let existed = self.tasks.remove(id).is_some();

        if first_removal {
            if let Some(store) = self.store.clone() {
                let id = id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = store.remove(&id).await {
                        warn!("Failed to delete stored task {}: {}", id, e);
                    }
                });
            }
        }

        if existed {
            debug!("Removed task {}", id);
            self.notify_removed(id);
        }
        existed
    }

    /// Pending and processing tasks, oldest first.
    pub fn active_tasks(&self) -> Vec<Task> {
        let mut active: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| entry.is_active())
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    pub fn has_active(&self) -> bool {
        self.tasks.iter().any(|entry| entry.is_active())
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.tasks.get(id).is_some_and(|task| task.is_active())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.get(id).map(|task| task.clone())
    }

    /// Like [`get`](Self::get) but fails for untracked ids.
    pub fn require(&self, id: &str) -> Result<Task, TaskError> {
        self.get(id).ok_or_else(|| TaskError::Unknown(id.to_string()))
    }

    /// User passed to the last [`initialize`](Self::initialize).
    pub fn user_id(&self) -> Option<String> {
        self.user_id.read().clone()
    }

    /// Apply a status report to an active task.
    ///
    /// Returns `None` when the task is unknown, removed or already terminal.
    pub fn apply_report(&self, id: &str, report: &StatusReport) -> Option<Transition> {
        let now = self.clock.now();

        let transition = {
            let mut entry = self.tasks.get_mut(id)?;
            let task = entry.value_mut();
            if task.status.is_terminal() {
                return None;
            }

            match report.status {
                TaskStatus::Completed => {
                    task.complete(report.video_url.clone(), now);
                    Transition::Completed(task.clone())
                }
                TaskStatus::Failed => {
                    let message = report
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "Video generation failed".to_string());
                    task.fail(message, now);
                    Transition::Failed(task.clone())
                }
                status => {
                    if task.status.can_advance_to(status) {
                        task.status = status;
                    }
                    if let Some(progress) = report.progress {
                        task.progress = progress.min(100);
                    }
                    task.status_text = status_text(task.status, task.progress, None);
                    Transition::Updated(task.clone())
                }
            }
        };

        self.persist(transition.task().clone());
        if !matches!(transition, Transition::Updated(_)) {
            self.prune_terminal(id);
        }
        Some(transition)
    }

    /// Drop the oldest finished tasks beyond the retention limit, never
    /// `newest`. Stored records are left alone.
    fn prune_terminal(&self, newest: &str) {
        let mut finished: Vec<(chrono::DateTime<chrono::Utc>, String)> = self
            .tasks
            .iter()
            .filter(|entry| entry.status.is_terminal() && entry.id != newest)
            .map(|entry| (entry.completed_at.unwrap_or(entry.started_at), entry.id.clone()))
            .collect();
        if finished.len() <= self.terminal_retention {
            return;
        }

        finished.sort();
        let excess = finished.len() - self.terminal_retention;
        for (_, id) in finished.into_iter().take(excess) {
            if self.tasks.remove(&id).is_some() {
                debug!("Pruned finished task {}", id);
                self.notify_removed(&id);
            }
        }
    }

    fn notify_removed(&self, id: &str) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            hook(id);
        }
    }

    /// Drop all in-memory state. Stored records are kept for recovery.
    pub fn cleanup(&self) {
        let count = self.tasks.len();
        self.tasks.clear();
        self.removed.clear();
        *self.user_id.write() = None;
        info!("Task registry cleaned up ({} tasks dropped)", count);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Best-effort background save.
    fn persist(&self, task: Task) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let removed = Arc::clone(&self.removed);

        tokio::spawn(async move {
            if removed.contains(&task.id) {
                return;
            }
            if let Err(e) = store.save(&task).await {
                warn!("Failed to save task {}: {}", task.id, e);
                return;
            }
            // Removed while the save was in flight.
            if removed.contains(&task.id) {
                if let Err(e) = store.remove(&task.id).await {
                    warn!("Failed to delete stored task {}: {}", task.id, e);
                }
            }
        });
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.len())
            .field("removed", &self.removed.len())
            .field("has_store", &self.store.is_some())
            .field("max_lifetime", &self.max_lifetime)
            .field("terminal_retention", &self.terminal_retention)
            .finish()
    }
}
