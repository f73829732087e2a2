//! Storage layer traits and common types.
//!
//! The two traits split the way consumers use the store: [`Queue`] carries
//! the claim/ack lifecycle used by the executors and submission services,
//! [`Storage`] carries template lookups, history and by-id reads. Both are
//! implemented by [`postgres::PostgresStorage`]; tests use the in-memory
//! implementation from `test_helpers`.
//!
//! The central contract is the atomic claim: `poll_task` / `poll_task_list`
//! must select the oldest Created record, flip it to Pending and return the
//! updated row in one atomic step, so that at most one worker claims any
//! record per poll. Any backend with a find-one-sort-and-update primitive
//! can satisfy this; the Postgres implementation uses
//! `FOR UPDATE SKIP LOCKED`.

use crate::errors::StorageError;
use crate::model::{EventTask, Group, Task, TaskList, TaskListTemplate, TaskTemplate};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod postgres;

pub use postgres::PostgresStorage;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Live-queue operations for tasks and task lists.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Insert a task into the live queue.
    async fn add_task(&self, task: &Task) -> StorageResult<()>;

    /// Atomically claim the oldest Created task with an empty group id,
    /// flipping it to Pending. Returns the updated record, or
    /// [`StorageError::NotFound`] when the queue is empty.
    async fn poll_task(&self) -> StorageResult<Task>;

    /// Remove a task from the live queue.
    async fn ack_task(&self, task: &Task) -> StorageResult<()>;

    /// Return a Pending task to Created with `retries` incremented by one,
    /// making it eligible for claiming again.
    async fn unack_task(&self, task: &Task) -> StorageResult<()>;

    /// Insert a task list and its task rows. Either both land or neither:
    /// a failed task insert removes the list record as well.
    async fn add_task_list(&self, list: &TaskList, tasks: &[Task]) -> StorageResult<()>;

    /// Atomic claim of the oldest Created task list, same discipline as
    /// [`Queue::poll_task`].
    async fn poll_task_list(&self) -> StorageResult<TaskList>;

    /// Remove a task list from the live queue.
    async fn ack_task_list(&self, list: &TaskList) -> StorageResult<()>;

    /// Remove all queue rows belonging to a group.
    async fn ack_group_tasks(&self, group: &Group) -> StorageResult<()>;
}

/// Template lookups, history and by-id reads.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn task(&self, task_id: &str) -> StorageResult<Task>;

    async fn task_template(&self, name: &str) -> StorageResult<TaskTemplate>;

    /// Template lookups by name. The result maps each found name to its
    /// definition; absent names are simply missing from the map.
    async fn task_templates(&self, names: &[String]) -> StorageResult<HashMap<String, TaskTemplate>>;

    async fn task_history(&self, task_id: &str) -> StorageResult<Task>;

    /// Archive a terminal task. Retries transient failures with bounded
    /// exponential backoff; idempotent per task id.
    async fn save_task_history(&self, task: &Task) -> StorageResult<()>;

    async fn task_list(&self, task_list_id: &str) -> StorageResult<TaskList>;

    async fn task_list_template(&self, name: &str) -> StorageResult<TaskListTemplate>;

    async fn task_list_history(&self, task_list_id: &str) -> StorageResult<TaskList>;

    /// Archive a terminal task list, with the same retry discipline as
    /// [`Storage::save_task_history`].
    async fn save_task_list_history(&self, list: &TaskList) -> StorageResult<()>;

    /// All tasks belonging to a group, oldest first.
    async fn get_group_tasks(&self, group: &Group) -> StorageResult<Vec<Task>>;

    /// Event binding lookup by composite key.
    async fn event_task(&self, key: &str, namespace: &str, scope: &str) -> StorageResult<EventTask>;

    /// Return standalone Pending tasks claimed longer than `older_than` ago
    /// to Created, without touching `retries`. Recovers tasks leaked by
    /// workers that died between claim and ack. Returns the number of rows
    /// requeued.
    async fn requeue_stale_tasks(&self, older_than: Duration) -> StorageResult<u64>;
}

#[async_trait]
impl<T: Queue + ?Sized> Queue for Arc<T> {
    async fn add_task(&self, task: &Task) -> StorageResult<()> {
        self.as_ref().add_task(task).await
    }

    async fn poll_task(&self) -> StorageResult<Task> {
        self.as_ref().poll_task().await
    }

    async fn ack_task(&self, task: &Task) -> StorageResult<()> {
        self.as_ref().ack_task(task).await
    }

    async fn unack_task(&self, task: &Task) -> StorageResult<()> {
        self.as_ref().unack_task(task).await
    }

    async fn add_task_list(&self, list: &TaskList, tasks: &[Task]) -> StorageResult<()> {
        self.as_ref().add_task_list(list, tasks).await
    }

    async fn poll_task_list(&self) -> StorageResult<TaskList> {
        self.as_ref().poll_task_list().await
    }

    async fn ack_task_list(&self, list: &TaskList) -> StorageResult<()> {
        self.as_ref().ack_task_list(list).await
    }

    async fn ack_group_tasks(&self, group: &Group) -> StorageResult<()> {
        self.as_ref().ack_group_tasks(group).await
    }
}

#[async_trait]
impl<T: Storage + ?Sized> Storage for Arc<T> {
    async fn task(&self, task_id: &str) -> StorageResult<Task> {
        self.as_ref().task(task_id).await
    }

    async fn task_template(&self, name: &str) -> StorageResult<TaskTemplate> {
        self.as_ref().task_template(name).await
    }

    async fn task_templates(&self, names: &[String]) -> StorageResult<HashMap<String, TaskTemplate>> {
        self.as_ref().task_templates(names).await
    }

    async fn task_history(&self, task_id: &str) -> StorageResult<Task> {
        self.as_ref().task_history(task_id).await
    }

    async fn save_task_history(&self, task: &Task) -> StorageResult<()> {
        self.as_ref().save_task_history(task).await
    }

    async fn task_list(&self, task_list_id: &str) -> StorageResult<TaskList> {
        self.as_ref().task_list(task_list_id).await
    }

    async fn task_list_template(&self, name: &str) -> StorageResult<TaskListTemplate> {
        self.as_ref().task_list_template(name).await
    }

    async fn task_list_history(&self, task_list_id: &str) -> StorageResult<TaskList> {
        self.as_ref().task_list_history(task_list_id).await
    }

    async fn save_task_list_history(&self, list: &TaskList) -> StorageResult<()> {
        self.as_ref().save_task_list_history(list).await
    }

    async fn get_group_tasks(&self, group: &Group) -> StorageResult<Vec<Task>> {
        self.as_ref().get_group_tasks(group).await
    }

    async fn event_task(&self, key: &str, namespace: &str, scope: &str) -> StorageResult<EventTask> {
        self.as_ref().event_task(key, namespace, scope).await
    }

    async fn requeue_stale_tasks(&self, older_than: Duration) -> StorageResult<u64> {
        self.as_ref().requeue_stale_tasks(older_than).await
    }
}
