//! Test fixtures and in-memory fakes shared across the crate's tests.
//!
//! `InMemoryStorage` implements the [`Queue`] and [`Storage`] traits with
//! the same observable semantics as the Postgres backend, including the
//! FIFO claim discipline, so executor and service tests run against real
//! queue behavior without a database.

use crate::cache::ResultCache;
use crate::errors::{CacheError, PolicyError, StorageError};
use crate::model::{EventTask, Group, State, Task, TaskList, TaskListTemplate, TaskTemplate};
use crate::policy::PolicyEvaluator;
use crate::storage::{Queue, Storage, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Serializes tests that mutate process environment variables.
pub static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Default)]
struct StorageInner {
    tasks: Vec<Task>,
    tasks_history: HashMap<String, Task>,
    task_lists: Vec<TaskList>,
    task_list_history: HashMap<String, TaskList>,
    task_templates: HashMap<String, TaskTemplate>,
    task_list_templates: HashMap<String, TaskListTemplate>,
    event_tasks: Vec<EventTask>,
}

/// In-memory implementation of [`Queue`] and [`Storage`].
#[derive(Default)]
pub struct InMemoryStorage {
    inner: Mutex<StorageInner>,
    fail_add_task: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_task_template(&self, template: TaskTemplate) {
        self.inner
            .lock()
            .task_templates
            .insert(template.name.clone(), template);
    }

    pub fn seed_task_list_template(&self, template: TaskListTemplate) {
        self.inner
            .lock()
            .task_list_templates
            .insert(template.name.clone(), template);
    }

    pub fn seed_event_task(&self, event_task: EventTask) {
        self.inner.lock().event_tasks.push(event_task);
    }

    /// Make subsequent `add_task` calls fail, simulating a store outage.
    pub fn fail_add_task(&self, fail: bool) {
        self.fail_add_task.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the live task queue.
    pub fn live_tasks(&self) -> Vec<Task> {
        self.inner.lock().tasks.clone()
    }
}

#[async_trait]
impl Queue for InMemoryStorage {
    async fn add_task(&self, task: &Task) -> StorageResult<()> {
        if self.fail_add_task.load(Ordering::SeqCst) {
            return Err(StorageError::InvalidData {
                details: "simulated add_task failure".to_string(),
            });
        }
        self.inner.lock().tasks.push(task.clone());
        Ok(())
    }

    async fn poll_task(&self) -> StorageResult<Task> {
        let mut inner = self.inner.lock();
        let claimed = inner
            .tasks
            .iter_mut()
            .filter(|t| t.state == State::Created && t.group_id.is_empty())
            .min_by_key(|t| t.created_at);

        match claimed {
            Some(task) => {
                task.state = State::Pending;
                Ok(task.clone())
            }
            None => Err(StorageError::NotFound { entity: "task" }),
        }
    }

    async fn ack_task(&self, task: &Task) -> StorageResult<()> {
        self.inner.lock().tasks.retain(|t| t.id != task.id);
        Ok(())
    }

    async fn unack_task(&self, task: &Task) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some(stored) = inner.tasks.iter_mut().find(|t| t.id == task.id) {
            stored.state = State::Created;
            stored.retries = task.retries + 1;
        }
        Ok(())
    }

    async fn add_task_list(&self, list: &TaskList, tasks: &[Task]) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        inner.task_lists.push(list.clone());
        inner.tasks.extend(tasks.iter().cloned());
        Ok(())
    }

    async fn poll_task_list(&self) -> StorageResult<TaskList> {
        let mut inner = self.inner.lock();
        let claimed = inner
            .task_lists
            .iter_mut()
            .filter(|l| l.state == State::Created)
            .min_by_key(|l| l.created_at);

        match claimed {
            Some(list) => {
                list.state = State::Pending;
                Ok(list.clone())
            }
            None => Err(StorageError::NotFound { entity: "taskList" }),
        }
    }

    async fn ack_task_list(&self, list: &TaskList) -> StorageResult<()> {
        self.inner.lock().task_lists.retain(|l| l.id != list.id);
        Ok(())
    }

    async fn ack_group_tasks(&self, group: &Group) -> StorageResult<()> {
        self.inner.lock().tasks.retain(|t| t.group_id != group.id);
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn task(&self, task_id: &str) -> StorageResult<Task> {
        self.inner
            .lock()
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
            .ok_or(StorageError::NotFound { entity: "task" })
    }

    async fn task_template(&self, name: &str) -> StorageResult<TaskTemplate> {
        self.inner
            .lock()
            .task_templates
            .get(name)
            .cloned()
            .ok_or(StorageError::NotFound {
                entity: "task template",
            })
    }

    async fn task_templates(&self, names: &[String]) -> StorageResult<HashMap<String, TaskTemplate>> {
        let inner = self.inner.lock();
        Ok(names
            .iter()
            .filter_map(|name| inner.task_templates.get(name).cloned())
            .map(|template| (template.name.clone(), template))
            .collect())
    }

    async fn task_history(&self, task_id: &str) -> StorageResult<Task> {
        self.inner
            .lock()
            .tasks_history
            .get(task_id)
            .cloned()
            .ok_or(StorageError::NotFound { entity: "task" })
    }

    async fn save_task_history(&self, task: &Task) -> StorageResult<()> {
        self.inner
            .lock()
            .tasks_history
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn task_list(&self, task_list_id: &str) -> StorageResult<TaskList> {
        self.inner
            .lock()
            .task_lists
            .iter()
            .find(|l| l.id == task_list_id)
            .cloned()
            .ok_or(StorageError::NotFound { entity: "taskList" })
    }

    async fn task_list_template(&self, name: &str) -> StorageResult<TaskListTemplate> {
        self.inner
            .lock()
            .task_list_templates
            .get(name)
            .cloned()
            .ok_or(StorageError::NotFound {
                entity: "taskList template",
            })
    }

    async fn task_list_history(&self, task_list_id: &str) -> StorageResult<TaskList> {
        self.inner
            .lock()
            .task_list_history
            .get(task_list_id)
            .cloned()
            .ok_or(StorageError::NotFound { entity: "taskList" })
    }

    async fn save_task_list_history(&self, list: &TaskList) -> StorageResult<()> {
        self.inner
            .lock()
            .task_list_history
            .insert(list.id.clone(), list.clone());
        Ok(())
    }

    async fn get_group_tasks(&self, group: &Group) -> StorageResult<Vec<Task>> {
        let inner = self.inner.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .iter()
            .filter(|t| t.group_id == group.id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn event_task(&self, key: &str, namespace: &str, scope: &str) -> StorageResult<EventTask> {
        self.inner
            .lock()
            .event_tasks
            .iter()
            .find(|e| e.key == key && e.namespace == namespace && e.scope == scope)
            .cloned()
            .ok_or(StorageError::NotFound { entity: "eventTask" })
    }

    async fn requeue_stale_tasks(&self, _older_than: Duration) -> StorageResult<u64> {
        // The in-memory fake has no claim timestamps; tests drive unack
        // explicitly.
        Ok(0)
    }
}

type PolicyFn = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

/// Programmable policy evaluator: responses are registered per policy path.
#[derive(Default)]
pub struct StubPolicy {
    policies: Mutex<HashMap<String, PolicyFn>>,
    calls: Mutex<Vec<String>>,
}

impl StubPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a policy path.
    pub fn on<F>(&self, policy: &str, handler: F)
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.policies
            .lock()
            .insert(policy.to_string(), Box::new(handler));
    }

    /// Policy paths evaluated so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PolicyEvaluator for StubPolicy {
    async fn evaluate(&self, policy: &str, data: &[u8]) -> Result<Vec<u8>, PolicyError> {
        self.calls.lock().push(policy.to_string());
        let policies = self.policies.lock();
        match policies.get(policy) {
            Some(handler) => handler(data).map_err(|details| PolicyError::EvaluationFailed {
                policy: policy.to_string(),
                details,
            }),
            None => Err(PolicyError::EvaluationFailed {
                policy: policy.to_string(),
                details: "no stub registered".to_string(),
            }),
        }
    }
}

/// In-memory [`ResultCache`] keyed by the rendered composite cache key.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `set` calls fail, simulating a cache outage.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    fn render_key(key: &str, namespace: &str, scope: &str) -> String {
        format!("{}\u{0}{}\u{0}{}", key, namespace, scope)
    }
}

#[async_trait]
impl ResultCache for InMemoryCache {
    async fn set(
        &self,
        key: &str,
        namespace: &str,
        scope: &str,
        value: &[u8],
    ) -> Result<(), CacheError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(CacheError::UnexpectedStatus {
                operation: "set",
                status: 503,
            });
        }
        self.entries
            .lock()
            .insert(Self::render_key(key, namespace, scope), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str, namespace: &str, scope: &str) -> Result<Vec<u8>, CacheError> {
        self.entries
            .lock()
            .get(&Self::render_key(key, namespace, scope))
            .cloned()
            .ok_or(CacheError::NotFound {
                key: key.to_string(),
            })
    }
}

/// Insert a Created task bound to a group directly into the queue, the way
/// the task-list submission path does.
pub async fn seed_group_task(
    storage: &Arc<InMemoryStorage>,
    group_id: &str,
    name: &str,
    request_policy: &str,
) -> Task {
    let mut task = Task::from_template(&TaskTemplate {
        name: name.to_string(),
        url: String::new(),
        method: String::new(),
        request_policy: request_policy.to_string(),
        response_policy: String::new(),
        final_policy: String::new(),
        cache_namespace: String::new(),
        cache_scope: String::new(),
    });
    task.group_id = group_id.to_string();
    // Spread creation times so FIFO ordering inside the group is
    // deterministic in tests.
    task.created_at = Utc::now() + chrono::Duration::microseconds(queue_len(storage) as i64);
    storage.add_task(&task).await.expect("seed task");
    task
}

fn queue_len(storage: &Arc<InMemoryStorage>) -> usize {
    storage.live_tasks().len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standalone_task(created_offset_us: i64) -> Task {
        let mut task = Task::from_template(&TaskTemplate {
            name: "t".to_string(),
            url: String::new(),
            method: String::new(),
            request_policy: "p".to_string(),
            response_policy: String::new(),
            final_policy: String::new(),
            cache_namespace: String::new(),
            cache_scope: String::new(),
        });
        task.created_at = Utc::now() + chrono::Duration::microseconds(created_offset_us);
        task
    }

    #[tokio::test]
    async fn test_poll_claims_oldest_created_task_first() {
        let storage = InMemoryStorage::new();
        let newer = standalone_task(100);
        let older = standalone_task(0);
        storage.add_task(&newer).await.unwrap();
        storage.add_task(&older).await.unwrap();

        assert_eq!(storage.poll_task().await.unwrap().id, older.id);
        assert_eq!(storage.poll_task().await.unwrap().id, newer.id);
    }

    #[tokio::test]
    async fn test_polled_task_is_pending_and_not_reclaimable() {
        let storage = InMemoryStorage::new();
        let task = standalone_task(0);
        storage.add_task(&task).await.unwrap();

        let claimed = storage.poll_task().await.unwrap();
        assert_eq!(claimed.state, State::Pending);
        assert!(storage.poll_task().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_acked_task_never_polls_again() {
        let storage = InMemoryStorage::new();
        let task = standalone_task(0);
        storage.add_task(&task).await.unwrap();

        let claimed = storage.poll_task().await.unwrap();
        storage.ack_task(&claimed).await.unwrap();
        assert!(storage.poll_task().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unack_returns_to_created_with_one_more_retry() {
        let storage = InMemoryStorage::new();
        let task = standalone_task(0);
        storage.add_task(&task).await.unwrap();

        let claimed = storage.poll_task().await.unwrap();
        storage.unack_task(&claimed).await.unwrap();

        let stored = storage.task(&task.id).await.unwrap();
        assert_eq!(stored.state, State::Created);
        assert_eq!(stored.retries, claimed.retries + 1);
    }
}
