//! Polling scheduler - one timer querying the status of every active task.
//!
//! The timer exists only while the registry has active tasks:
//! - `start` arms it if there is work
//! - `refresh` arms or disarms it after tasks are added or removed
//! - the timer disarms itself once a tick finds nothing left to poll

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{Task, TaskRegistry, Transition, VideoGenerationApi};

/// Receives lifecycle events of polled tasks.
///
/// Events for one task arrive in order; order across tasks within a tick
/// is unspecified.
pub trait TaskEventHandler: Send + Sync {
    fn on_task_update(&self, _task: &Task) {}

    fn on_task_complete(&self, _task: &Task) {}

    fn on_task_failed(&self, _task: &Task) {}
}

/// Arguments of [`PollingScheduler::start`].
#[derive(Clone)]
pub struct StartOptions {
    pub user_id: String,
    pub handler: Arc<dyn TaskEventHandler>,
}

impl std::fmt::Debug for StartOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartOptions")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub queried: usize,
    pub updated: usize,
    pub completed: usize,
    pub failed: usize,
    /// Queries that errored; retried on the next tick.
    pub transient_errors: usize,
    /// Answers for tasks removed while the query was in flight.
    pub discarded: usize,
}

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    registry: Arc<TaskRegistry>,
    api: Arc<dyn VideoGenerationApi>,
    interval: Duration,
    timer: Mutex<Option<TimerSlot>>,
    options: Mutex<Option<StartOptions>>,
    next_generation: AtomicU64,
    /// Serializes ticks so events for a task never interleave.
    tick_lock: tokio::sync::Mutex<()>,
}

/// Single-timer status poller for a session.
///
/// Cloning is cheap and shares the same timer.
#[derive(Clone)]
pub struct PollingScheduler {
    inner: Arc<Inner>,
}

impl PollingScheduler {
    /// Create a stopped scheduler ticking every `interval`.
    ///
    /// The timer is re-evaluated whenever a task leaves `registry`, however
    /// it was removed.
    pub fn new(registry: Arc<TaskRegistry>, api: Arc<dyn VideoGenerationApi>, interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            registry: registry.clone(),
            api,
            interval,
            timer: Mutex::new(None),
            options: Mutex::new(None),
            next_generation: AtomicU64::new(0),
            tick_lock: tokio::sync::Mutex::new(()),
        });

        let weak = Arc::downgrade(&inner);
        registry.on_removal(Arc::new(move |_: &str| {
            if let Some(inner) = weak.upgrade() {
                PollingScheduler { inner }.refresh();
            }
        }));

        Self { inner }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Install the event handler and arm the timer if tasks are active.
    ///
    /// Does nothing while a timer is already running; returns whether the
    /// handler was installed.
    pub fn start(&self, options: StartOptions) -> bool {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            debug!("Polling already running, ignoring start");
            return false;
        }

        let user_id = options.user_id.clone();
        *self.inner.options.lock() = Some(options);

        if self.inner.registry.has_active() {
            self.arm(&mut timer, &user_id);
        } else {
            debug!("No active tasks for {}, polling stays idle", user_id);
        }
        true
    }

    /// Handler installed by the last [`start`](Self::start), if not stopped.
    pub fn handler(&self) -> Option<Arc<dyn TaskEventHandler>> {
        self.inner.options.lock().as_ref().map(|o| Arc::clone(&o.handler))
    }

    /// Cancel the timer and drop the handler. Idempotent.
    pub fn stop(&self) {
        let mut timer = self.inner.timer.lock();
        self.inner.options.lock().take();
        if let Some(slot) = timer.take() {
            slot.handle.abort();
            info!("Polling stopped");
        }
    }

    /// Re-evaluate the timer after the set of active tasks changed.
    pub fn refresh(&self) {
        let mut timer = self.inner.timer.lock();
        let has_active = self.inner.registry.has_active();

        if has_active && timer.is_none() {
            let user_id = self.inner.options.lock().as_ref().map(|o| o.user_id.clone());
            if let Some(user_id) = user_id {
                self.arm(&mut timer, &user_id);
            }
        } else if !has_active {
            if let Some(slot) = timer.take() {
                slot.handle.abort();
                info!("Polling stopped, no active tasks");
            }
        }
    }

    /// Whether a timer currently exists.
    pub fn is_running(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    fn arm(&self, slot: &mut Option<TimerSlot>, user_id: &str) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let interval = self.inner.interval;
        let weak = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(run_timer(weak, generation, interval));
        *slot = Some(TimerSlot { generation, handle });
        info!("Polling started for {} every {:?}", user_id, interval);
    }

    /// Clear the slot if it still belongs to `generation` and nothing is
    /// active. Returns `true` when the timer loop should exit.
    fn disarm_if_idle(&self, generation: u64) -> bool {
        let mut timer = self.inner.timer.lock();
        let owned = timer.as_ref().is_some_and(|slot| slot.generation == generation);
        if !owned {
            return true;
        }
        if self.inner.registry.has_active() {
            return false;
        }

        // Dropping our own handle detaches this task instead of aborting it.
        timer.take();
        info!("Polling stopped, no active tasks");
        true
    }

    /// Query every active task once and dispatch the resulting events.
    pub async fn poll_once(&self) -> PollSummary {
        let _tick = self.inner.tick_lock.lock().await;
        let mut summary = PollSummary::default();

        let ids: Vec<String> = self
            .inner
            .registry
            .active_tasks()
            .into_iter()
            .map(|task| task.id)
            .collect();
        if ids.is_empty() {
            return summary;
        }
        summary.queried = ids.len();

        let responses = self.inner.api.query_status_batch(&ids).await;
        let handler = self.inner.options.lock().as_ref().map(|o| Arc::clone(&o.handler));

        for (id, response) in responses {
            let report = match response {
                Ok(report) => report,
                Err(e) => {
                    warn!("Status query for task {} failed, retrying next tick: {}", id, e);
                    summary.transient_errors += 1;
                    continue;
                }
            };

            if !self.inner.registry.is_active(&id) {
                debug!("Discarding status of task {} removed mid-flight", id);
                summary.discarded += 1;
                continue;
            }

            match self.inner.registry.apply_report(&id, &report) {
                Some(Transition::Updated(task)) => {
                    summary.updated += 1;
                    if let Some(handler) = &handler {
                        handler.on_task_update(&task);
                    }
                }
                Some(Transition::Completed(task)) => {
                    summary.completed += 1;
                    info!("Task {} completed", task.id);
                    if let Some(handler) = &handler {
                        handler.on_task_complete(&task);
                    }
                }
                Some(Transition::Failed(task)) => {
                    summary.failed += 1;
                    warn!(
                        "Task {} failed: {}",
                        task.id,
                        task.error_message.as_deref().unwrap_or("unknown error")
                    );
                    if let Some(handler) = &handler {
                        handler.on_task_failed(&task);
                    }
                }
                None => summary.discarded += 1,
            }
        }

        debug!("Poll tick: {:?}", summary);
        summary
    }
}

async fn run_timer(inner: Weak<Inner>, generation: u64, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let scheduler = PollingScheduler { inner };

        if scheduler.disarm_if_idle(generation) {
            break;
        }
        scheduler.poll_once().await;
        if scheduler.disarm_if_idle(generation) {
            break;
        }
    }
}

impl std::fmt::Debug for PollingScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingScheduler")
            .field("interval", &self.inner.interval)
            .field("running", &self.is_running())
            .finish()
    }
}
