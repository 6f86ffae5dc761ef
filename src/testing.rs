//! In-memory fakes of the external collaborators, shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::cache::{CategoryId, PersistedRecord, PersistentTier, TierError};
use crate::tasks::{
    ApiError, GenerationParams, StatusReport, Task, TaskError, TaskEventHandler, TaskStore,
    VideoGenerationApi,
};

/// Let spawned background writes run to completion.
pub(crate) async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Persistent tier backed by a map; every call fails while `failing` is set.
#[derive(Default)]
pub(crate) struct FakeTier {
    pub records: Mutex<HashMap<(CategoryId, String), PersistedRecord>>,
    pub failing: AtomicBool,
}

impl FakeTier {
    fn check(&self) -> Result<(), TierError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TierError::Unavailable("fake outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistentTier for FakeTier {
    async fn ping(&self) -> Result<(), TierError> {
        self.check()
    }

    async fn read(&self, category: CategoryId, key: &str) -> Result<Option<PersistedRecord>, TierError> {
        self.check()?;
        Ok(self.records.lock().get(&(category, key.to_string())).cloned())
    }

    async fn write(&self, record: &PersistedRecord) -> Result<(), TierError> {
        self.check()?;
        self.records
            .lock()
            .insert((record.category, record.key.clone()), record.clone());
        Ok(())
    }

    async fn remove(&self, category: CategoryId, key: &str) -> Result<(), TierError> {
        self.check()?;
        self.records.lock().remove(&(category, key.to_string()));
        Ok(())
    }

    async fn clear(&self, category: CategoryId) -> Result<u64, TierError> {
        self.check()?;
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|(c, _), _| *c != category);
        Ok((before - records.len()) as u64)
    }

    async fn purge_expired(&self, category: CategoryId, now: DateTime<Utc>) -> Result<u64, TierError> {
        self.check()?;
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|(c, _), record| *c != category || !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

/// Scripted generation service.
///
/// Each task answers with its current status; `fail_next` queues errors
/// served before it.
#[derive(Default)]
pub(crate) struct FakeApi {
    statuses: Mutex<HashMap<String, StatusReport>>,
    failures: Mutex<HashMap<String, VecDeque<ApiError>>>,
    calls: Mutex<Vec<(String, Instant)>>,
    gate: Mutex<Option<Arc<Notify>>>,
    next_id: AtomicU64,
    pub reject_create: AtomicBool,
}

impl FakeApi {
    pub fn set_status(&self, id: &str, report: StatusReport) {
        self.statuses.lock().insert(id.to_string(), report);
    }

    pub fn fail_next(&self, id: &str, error: ApiError) {
        self.failures
            .lock()
            .entry(id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Hold every query until the returned notify is signalled.
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn queried_ids(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl VideoGenerationApi for FakeApi {
    async fn create_video(&self, _params: &GenerationParams) -> Result<String, ApiError> {
        if self.reject_create.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected("insufficient credits".to_string()));
        }
        let id = format!("task-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.set_status(&id, StatusReport::pending());
        Ok(id)
    }

    async fn query_status(&self, task_id: &str) -> Result<StatusReport, ApiError> {
        self.calls.lock().push((task_id.to_string(), Instant::now()));

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(error) = self
            .failures
            .lock()
            .get_mut(task_id)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        self.statuses
            .lock()
            .get(task_id)
            .cloned()
            .ok_or_else(|| ApiError::Rejected(format!("no such task {}", task_id)))
    }
}

/// Task store backed by a map.
#[derive(Default)]
pub(crate) struct FakeTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
    pub failing: AtomicBool,
}

impl FakeTaskStore {
    pub fn insert(&self, task: Task) {
        self.tasks.lock().insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.lock().get(id).cloned()
    }

    fn check(&self) -> Result<(), TaskError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(TaskError::Store("fake outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskStore for FakeTaskStore {
    async fn load_active(&self, user_id: &str) -> Result<Vec<Task>, TaskError> {
        self.check()?;
        Ok(self
            .tasks
            .lock()
            .values()
            .filter(|task| task.user_id == user_id && task.is_active())
            .cloned()
            .collect())
    }

    async fn save(&self, task: &Task) -> Result<(), TaskError> {
        self.check()?;
        self.insert(task.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), TaskError> {
        self.check()?;
        self.tasks.lock().remove(id);
        Ok(())
    }
}

/// Lifecycle event seen by [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Update(String),
    Complete(String),
    Failed(String),
}

#[derive(Default)]
pub(crate) struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl TaskEventHandler for RecordingHandler {
    fn on_task_update(&self, task: &Task) {
        self.events.lock().push(Event::Update(task.id.clone()));
    }

    fn on_task_complete(&self, task: &Task) {
        self.events.lock().push(Event::Complete(task.id.clone()));
    }

    fn on_task_failed(&self, task: &Task) {
        self.events.lock().push(Event::Failed(task.id.clone()));
    }
}
