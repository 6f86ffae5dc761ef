//! Progress synthesizer - smooth, monotonic progress from sparse reports.
//!
//! Between authoritative reports the estimate follows
//!
//! ```text
//! estimate(t) = base + (ceiling - base) * (1 - exp(-(t - base_at) / tau))
//! ```
//!
//! where `base` is the last accepted report (or 0) and `ceiling` is 95, or
//! 99 once the base is already past 95. The curve slows down the longer a
//! task runs unconfirmed and never reaches its ceiling. Only completion
//! yields 100.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use super::{Task, TaskStatus};
use crate::utils::SharedClock;
use crate::utils::clock::elapsed_between;

const SOFT_CEILING: f64 = 95.0;
const HARD_CEILING: f64 = 99.0;
const DONE: f64 = 100.0;

/// Progress shown for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    pub task_id: String,
    pub status: TaskStatus,
    /// Last value reported by the service, kept even when ignored.
    pub reported_progress: Option<u8>,
    /// Smoothed value in `0.0..=100.0`.
    pub estimated_progress: f64,
    pub last_synthetic_update_at: DateTime<Utc>,
}

impl ProgressSample {
    /// Estimate rounded down to a whole percent.
    pub fn percent(&self) -> u8 {
        self.estimated_progress.floor().clamp(0.0, DONE) as u8
    }
}

/// Listener invoked with every sample emitted for a task.
pub type ProgressListener = Arc<dyn Fn(&ProgressSample) + Send + Sync>;

type ListenerMap = DashMap<String, Vec<(u64, ProgressListener)>>;

#[derive(Debug, Clone)]
struct ProgressState {
    status: TaskStatus,
    reported: Option<u8>,
    base: f64,
    base_at: DateTime<Utc>,
    estimate: f64,
    updated_at: DateTime<Utc>,
}

impl ProgressState {
    fn new(status: TaskStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            status,
            reported: None,
            base: 0.0,
            base_at: started_at,
            estimate: 0.0,
            updated_at: started_at,
        }
    }

    /// Advance the estimate to `now`. Never lowers it.
    fn advance(&mut self, now: DateTime<Utc>, tau: Duration) {
        match self.status {
            TaskStatus::Completed => self.estimate = DONE,
            TaskStatus::Failed => {}
            TaskStatus::Pending | TaskStatus::Processing => {
                let ceiling = if self.base >= SOFT_CEILING { HARD_CEILING } else { SOFT_CEILING };
                let elapsed = elapsed_between(self.base_at, now).as_secs_f64();
                let tau = tau.as_secs_f64().max(f64::EPSILON);
                let curve = self.base + (ceiling - self.base) * (1.0 - (-elapsed / tau).exp());
                self.estimate = self.estimate.max(curve.min(HARD_CEILING));
            }
        }
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    fn sample(&self, task_id: &str) -> ProgressSample {
        ProgressSample {
            task_id: task_id.to_string(),
            status: self.status,
            reported_progress: self.reported,
            estimated_progress: self.estimate,
            last_synthetic_update_at: self.updated_at,
        }
    }
}

/// Handle returned by [`ProgressSynthesizer::subscribe`].
///
/// Dropping it does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    task_id: String,
    listeners: std::sync::Weak<ListenerMap>,
}

impl Subscription {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Remove this listener. Safe to call more than once.
    pub fn unsubscribe(&self) {
        let Some(listeners) = self.listeners.upgrade() else {
            return;
        };
        let now_empty = match listeners.get_mut(&self.task_id) {
            Some(mut entry) => {
                entry.retain(|(id, _)| *id != self.id);
                entry.is_empty()
            }
            None => false,
        };
        if now_empty {
            listeners.remove_if(&self.task_id, |_, list| list.is_empty());
        }
    }
}

/// Per-task smoothed progress with fan-out to listeners.
pub struct ProgressSynthesizer {
    states: DashMap<String, ProgressState>,
    listeners: Arc<ListenerMap>,
    next_listener: AtomicU64,
    clock: SharedClock,
    time_constant: Duration,
}

impl ProgressSynthesizer {
    /// `time_constant` is the curve's tau: after one tau without reports
    /// the estimate has covered ~63% of the way to its ceiling.
    pub fn new(clock: SharedClock, time_constant: Duration) -> Self {
        Self {
            states: DashMap::new(),
            listeners: Arc::new(DashMap::new()),
            next_listener: AtomicU64::new(0),
            clock,
            time_constant,
        }
    }

    /// Start tracking `task` if it is not tracked yet.
    pub fn track(&self, task: &Task) {
        self.states.entry(task.id.clone()).or_insert_with(|| {
            let mut state = ProgressState::new(task.status, task.started_at);
            if task.status == TaskStatus::Completed {
                state.estimate = DONE;
            }
            state
        });
    }

    /// Register `listener` for samples of `task_id`.
    pub fn subscribe(&self, task_id: &str, listener: ProgressListener) -> Subscription {
        let now = self.clock.now();
        self.states
            .entry(task_id.to_string())
            .or_insert_with(|| ProgressState::new(TaskStatus::Pending, now));

        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entry(task_id.to_string())
            .or_default()
            .push((id, listener));

        Subscription {
            id,
            task_id: task_id.to_string(),
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Current sample, advancing the estimate to now.
    pub fn get_progress(&self, task_id: &str) -> Option<ProgressSample> {
        let now = self.clock.now();
        let mut state = self.states.get_mut(task_id)?;
        state.advance(now, self.time_constant);
        Some(state.sample(task_id))
    }

    /// Like [`get_progress`](Self::get_progress), synthesizing a sample
    /// for untracked tasks from `fallback_status`.
    pub fn get_progress_with_fallback(&self, task_id: &str, fallback_status: TaskStatus) -> ProgressSample {
        self.get_progress(task_id).unwrap_or_else(|| {
            let now = self.clock.now();
            let mut state = ProgressState::new(fallback_status, now);
            if fallback_status == TaskStatus::Completed {
                state.estimate = DONE;
            }
            state.sample(task_id)
        })
    }

    /// Blend a polled task state into the estimate and notify listeners.
    ///
    /// A report below the current estimate is kept as `reported_progress`
    /// but does not move the displayed value.
    pub fn record_report(&self, task: &Task) {
        let now = self.clock.now();
        // 0 means the service has not reported progress yet.
        let reported = (task.progress > 0).then_some(task.progress);

        let sample = {
            let mut state = self
                .states
                .entry(task.id.clone())
                .or_insert_with(|| ProgressState::new(task.status, task.started_at));
            if state.status.is_terminal() {
                return;
            }

            state.advance(now, self.time_constant);
            if task.status.is_terminal() {
                drop(state);
                match task.status {
                    TaskStatus::Completed => self.record_completion(&task.id),
                    _ => self.record_failure(&task.id),
                }
                return;
            }

            if state.status.can_advance_to(task.status) {
                state.status = task.status;
            }
            if let Some(value) = reported {
                state.reported = Some(value);
                let value = f64::from(value).min(HARD_CEILING);
                if value > state.estimate {
                    state.base = value;
                    state.base_at = now;
                    state.estimate = value;
                }
            }
            state.sample(&task.id)
        };

        self.emit(&sample);
    }

    /// Snap the estimate to 100. Emits only on the first call.
    pub fn record_completion(&self, task_id: &str) {
        let now = self.clock.now();
        let sample = {
            let mut state = self
                .states
                .entry(task_id.to_string())
                .or_insert_with(|| ProgressState::new(TaskStatus::Processing, now));
            if state.status == TaskStatus::Completed {
                return;
            }
            state.status = TaskStatus::Completed;
            state.estimate = DONE;
            state.updated_at = now;
            state.sample(task_id)
        };

        debug!("Progress of task {} completed", task_id);
        self.emit(&sample);
    }

    /// Freeze the estimate of a failed task.
    pub fn record_failure(&self, task_id: &str) {
        let now = self.clock.now();
        let sample = {
            let mut state = self
                .states
                .entry(task_id.to_string())
                .or_insert_with(|| ProgressState::new(TaskStatus::Processing, now));
            if state.status.is_terminal() {
                return;
            }
            state.advance(now, self.time_constant);
            state.status = TaskStatus::Failed;
            state.sample(task_id)
        };

        self.emit(&sample);
    }

    /// Advance every running task and notify its listeners.
    ///
    /// Drive this from a frame timer to animate progress between polls.
    pub fn tick(&self) -> usize {
        let now = self.clock.now();
        let samples: Vec<ProgressSample> = self
            .states
            .iter_mut()
            .filter(|entry| !entry.status.is_terminal() && self.listeners.contains_key(entry.key()))
            .map(|mut entry| {
                entry.value_mut().advance(now, self.time_constant);
                entry.value().sample(entry.key())
            })
            .collect();

        for sample in &samples {
            self.emit(sample);
        }
        samples.len()
    }

    /// Drop the state and listeners of one task.
    pub fn forget(&self, task_id: &str) {
        self.states.remove(task_id);
        self.listeners.remove(task_id);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.states.clear();
        self.listeners.clear();
    }

    pub fn is_tracked(&self, task_id: &str) -> bool {
        self.states.contains_key(task_id)
    }

    pub fn listener_count(&self, task_id: &str) -> usize {
        self.listeners.get(task_id).map(|l| l.len()).unwrap_or(0)
    }

    fn emit(&self, sample: &ProgressSample) {
        // Clone out so listeners may subscribe or unsubscribe re-entrantly.
        let listeners: Vec<ProgressListener> = match self.listeners.get(&sample.task_id) {
            Some(entry) => entry.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in listeners {
            listener(sample);
        }
    }
}

impl std::fmt::Debug for ProgressSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSynthesizer")
            .field("tasks", &self.states.len())
            .field("subscribed_tasks", &self.listeners.len())
            .field("time_constant", &self.time_constant)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::utils::{Clock, ManualClock};

    fn synthesizer(clock: &ManualClock) -> ProgressSynthesizer {
        ProgressSynthesizer::new(Arc::new(clock.clone()), Duration::from_secs(60))
    }

    fn processing(id: &str, started_at: DateTime<Utc>, progress: u8) -> Task {
        let mut task = Task::pending(id, "u1", started_at);
        task.status = TaskStatus::Processing;
        task.progress = progress;
        task
    }

    fn collector() -> (ProgressListener, Arc<Mutex<Vec<f64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: ProgressListener = Arc::new(move |s: &ProgressSample| sink.lock().push(s.estimated_progress));
        (listener, seen)
    }

    #[test]
    fn test_estimate_advances_without_reports() {
        let clock = ManualClock::starting_now();
        let progress = synthesizer(&clock);
        let t0 = clock.now();

        clock.advance(Duration::from_secs(5));
        progress.record_report(&processing("t1", t0, 0));
        let at_5 = progress.get_progress("t1").unwrap();
        assert!(at_5.estimated_progress > 0.0 && at_5.estimated_progress < 100.0);
        assert_eq!(at_5.reported_progress, None);

        clock.advance(Duration::from_secs(5));
        let at_10 = progress.get_progress("t1").unwrap();
        assert!(at_10.estimated_progress >= at_5.estimated_progress);
    }

    #[test]
    fn test_lower_report_is_ignored_for_display() {
        let clock = ManualClock::starting_now();
        let progress = synthesizer(&clock);
        let t0 = clock.now();

        progress.record_report(&processing("t2", t0, 70));
        clock.advance(Duration::from_secs(1));
        progress.record_report(&processing("t2", t0, 50));

        let sample = progress.get_progress("t2").unwrap();
        assert!(sample.estimated_progress >= 70.0);
        assert_eq!(sample.reported_progress, Some(50));
    }

    #[test]
    fn test_estimate_is_monotonic_and_below_100_until_completion() {
        let clock = ManualClock::starting_now();
        let progress = synthesizer(&clock);
        let t0 = clock.now();
        let reports = [0u8, 10, 5, 40, 40, 35, 80, 99, 100, 20, 96];

        let mut last = 0.0;
        for (i, value) in reports.iter().enumerate() {
            clock.advance(Duration::from_secs(1 + (i as u64 * 7) % 13));
            progress.record_report(&processing("t1", t0, *value));
            clock.advance(Duration::from_secs(3));
            let sample = progress.get_progress("t1").unwrap();
            assert!(sample.estimated_progress >= last, "regressed at step {}", i);
            assert!(sample.estimated_progress < 100.0);
            last = sample.estimated_progress;
        }

        // A very long silence still stays below 100.
        clock.advance(Duration::from_secs(24 * 3600));
        assert!(progress.get_progress("t1").unwrap().estimated_progress < 100.0);

        progress.record_completion("t1");
        assert_eq!(progress.get_progress("t1").unwrap().estimated_progress, 100.0);
    }

    #[test]
    fn test_completion_emits_once_to_every_listener() {
        let clock = ManualClock::starting_now();
        let progress = synthesizer(&clock);
        let (first, first_seen) = collector();
        let (second, second_seen) = collector();

        progress.subscribe("t1", first);
        progress.subscribe("t1", second);
        progress.record_report(&processing("t1", clock.now(), 30));
        progress.record_completion("t1");
        progress.record_completion("t1");

        assert_eq!(*first_seen.lock(), vec![30.0, 100.0]);
        assert_eq!(*first_seen.lock(), *second_seen.lock());
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_isolated() {
        let clock = ManualClock::starting_now();
        let progress = synthesizer(&clock);
        let (first, first_seen) = collector();
        let (second, second_seen) = collector();

        let sub = progress.subscribe("t1", first);
        progress.subscribe("t1", second);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(progress.listener_count("t1"), 1);

        progress.record_report(&processing("t1", clock.now(), 10));
        assert!(first_seen.lock().is_empty());
        assert_eq!(second_seen.lock().len(), 1);
    }

    #[test]
    fn test_forget_stops_all_callbacks() {
        let clock = ManualClock::starting_now();
        let progress = synthesizer(&clock);
        let (listener, seen) = collector();
        let sub = progress.subscribe("t1", listener);

        progress.forget("t1");
        sub.unsubscribe();
        clock.advance(Duration::from_secs(10));
        assert_eq!(progress.tick(), 0);

        assert!(seen.lock().is_empty());
        assert!(progress.get_progress("t1").is_none());
    }

    #[test]
    fn test_failure_freezes_estimate() {
        let clock = ManualClock::starting_now();
        let progress = synthesizer(&clock);
        let t0 = clock.now();
        progress.record_report(&processing("t1", t0, 40));

        progress.record_failure("t1");
        let frozen = progress.get_progress("t1").unwrap();
        clock.advance(Duration::from_secs(600));

        let later = progress.get_progress("t1").unwrap();
        assert_eq!(later.status, TaskStatus::Failed);
        assert_eq!(later.estimated_progress, frozen.estimated_progress);
        assert!(later.estimated_progress < 100.0);
    }

    #[test]
    fn test_fallback_for_untracked_task() {
        let clock = ManualClock::starting_now();
        let progress = synthesizer(&clock);

        let pending = progress.get_progress_with_fallback("nope", TaskStatus::Pending);
        assert_eq!(pending.estimated_progress, 0.0);
        assert!(!progress.is_tracked("nope"));

        let done = progress.get_progress_with_fallback("done", TaskStatus::Completed);
        assert_eq!(done.percent(), 100);
    }

    #[test]
    fn test_tick_emits_for_subscribed_running_tasks() {
        let clock = ManualClock::starting_now();
        let progress = synthesizer(&clock);
        let (listener, seen) = collector();
        progress.subscribe("t1", listener);
        progress.track(&processing("t2", clock.now(), 0));

        clock.advance(Duration::from_secs(30));
        assert_eq!(progress.tick(), 1);
        clock.advance(Duration::from_secs(30));
        progress.tick();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[1] > seen[0]);
    }
}
