//! Task-list executor: group-level orchestration over the list queue.
//!
//! The dispatcher limits concurrent list executions with a counting
//! semaphore instead of a worker pool, because list executions are
//! themselves concurrent internally (parallel groups fan out). A permit is
//! acquired before each poll and released when the list finishes, or
//! immediately when the poll comes back empty.
//!
//! Groups run strictly in order. Within a sequential group each task
//! receives the previous task's response as its input; within a parallel
//! group every task receives the group request and all run concurrently.
//! Failure propagates task → group → list; there are no retries at this
//! level.

use crate::cache::ResultCache;
use crate::metrics::Metrics;
use crate::model::{Execution, Group, GroupStatus, State, TaskList, TaskListStatus, TaskStatus};
use crate::runner::TaskRunner;
use crate::storage::{Queue, Storage};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct ListExecutor {
    queue: Arc<dyn Queue>,
    storage: Arc<dyn Storage>,
    cache: Arc<dyn ResultCache>,
    runner: Arc<TaskRunner>,
    workers: usize,
    poll_interval: Duration,
    metrics: Arc<Metrics>,
}

impl ListExecutor {
    pub fn new(
        queue: Arc<dyn Queue>,
        storage: Arc<dyn Storage>,
        cache: Arc<dyn ResultCache>,
        runner: Arc<TaskRunner>,
        workers: usize,
        poll_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            queue,
            storage,
            cache,
            runner,
            workers,
            poll_interval,
            metrics,
        }
    }

    /// Run the dispatcher loop until the token is cancelled, then wait for
    /// in-flight list executions to finish.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        info!(workers = self.workers, "TaskList executor started");

        let semaphore = Arc::new(Semaphore::new(self.workers));

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let list = match self.queue.poll_task_list().await {
                        Ok(list) => list,
                        Err(e) => {
                            if !e.is_not_found() {
                                error!(error = ?e, "error getting taskList from queue");
                            }
                            drop(permit);
                            continue;
                        }
                    };

                    let executor = self.clone();
                    tokio::spawn(async move {
                        executor.execute(list).await;
                        drop(permit);
                    });
                }
            }
        }

        // Wait for in-flight executions by taking every permit back.
        let _ = semaphore.acquire_many(self.workers as u32).await;
        info!("TaskList executor stopped");
        Ok(())
    }

    /// Execute a claimed task list to its terminal state and finalize it:
    /// cache the marshaled status, archive the list and ack it. Each
    /// finalization step is best-effort and logs on failure.
    pub async fn execute(&self, mut list: TaskList) {
        debug!(task_list_id = %list.id, task_list_name = %list.name, "executing taskList");
        list.state = State::Pending;
        list.started_at = Some(Utc::now());

        let mut group_statuses = Vec::with_capacity(list.groups.len());
        for group in list.groups.iter_mut() {
            let status = match self.execute_group(group).await {
                Ok(status) => status,
                Err(e) => {
                    error!(task_list_id = %list.id, group_id = %group.id, error = ?e, "error executing group");
                    group.state = State::Failed;
                    list.state = State::Failed;
                    GroupStatus {
                        id: group.id.clone(),
                        status: State::Failed,
                        tasks: Vec::new(),
                    }
                }
            };

            if status.status == State::Failed {
                list.state = State::Failed;
            }
            group_statuses.push(status);
        }

        if list.state != State::Failed {
            list.state = State::Done;
        }
        list.finished_at = Some(Utc::now());

        let status = TaskListStatus {
            id: list.id.clone(),
            status: list.state,
            groups: group_statuses,
        };

        match serde_json::to_vec(&status) {
            Ok(value) => {
                if let Err(e) = self
                    .cache
                    .set(&list.id, &list.cache_namespace, &list.cache_scope, &value)
                    .await
                {
                    error!(task_list_id = %list.id, error = ?e, "error storing taskList state in cache");
                } else {
                    debug!(task_list_id = %list.id, "taskList state is stored in cache");
                }
            }
            Err(e) => {
                error!(task_list_id = %list.id, error = ?e, "error marshaling taskList state");
            }
        }

        if let Err(e) = self.storage.save_task_list_history(&list).await {
            error!(task_list_id = %list.id, error = ?e, "error saving taskList history");
        } else {
            debug!(task_list_id = %list.id, "taskList history is saved");
        }

        if let Err(e) = self.queue.ack_task_list(&list).await {
            error!(task_list_id = %list.id, error = ?e, "failed to ack taskList in queue");
        }

        match list.state {
            State::Failed => self.metrics.task_lists_failed.incr(),
            _ => self.metrics.task_lists_executed.incr(),
        }
    }

    async fn execute_group(
        &self,
        group: &mut Group,
    ) -> Result<GroupStatus, crate::errors::StorageError> {
        match group.execution {
            Execution::Sequential => self.execute_sequential(group).await,
            Execution::Parallel => self.execute_parallel(group).await,
        }
    }

    async fn execute_sequential(
        &self,
        group: &mut Group,
    ) -> Result<GroupStatus, crate::errors::StorageError> {
        group.state = State::Pending;
        let tasks = self.storage.get_group_tasks(group).await?;

        let mut statuses = Vec::with_capacity(tasks.len());
        let mut input = group.request.clone();

        for mut task in tasks {
            // A failed group marks every subsequent task Failed without
            // executing it.
            if group.state == State::Failed {
                statuses.push(TaskStatus {
                    id: task.id.clone(),
                    status: State::Failed,
                });
                continue;
            }

            task.request = input.clone();
            if let Err(e) = self.runner.execute(&mut task).await {
                error!(task_id = %task.id, task_name = %task.name, error = ?e, "error executing task");
                task.state = State::Failed;
                group.state = State::Failed;
                statuses.push(TaskStatus {
                    id: task.id.clone(),
                    status: State::Failed,
                });
                continue;
            }
            debug!(task_id = %task.id, task_name = %task.name, "task execution completed successfully");

            statuses.push(TaskStatus {
                id: task.id.clone(),
                status: task.state,
            });

            // Pipeline chaining: this response becomes the next task's
            // request.
            input = task.response.clone();

            if let Err(e) = self
                .cache
                .set(
                    &task.id,
                    &task.cache_namespace,
                    &task.cache_scope,
                    &task.response,
                )
                .await
            {
                error!(task_id = %task.id, error = ?e, "error storing task result in cache");
                continue;
            }

            if let Err(e) = self.storage.save_task_history(&task).await {
                error!(task_id = %task.id, error = ?e, "error saving task history");
            }
        }

        if let Err(e) = self.queue.ack_group_tasks(group).await {
            error!(group_id = %group.id, error = ?e, "failed to ack group tasks in queue");
        }

        if group.state != State::Failed {
            group.state = State::Done;
        }

        Ok(GroupStatus {
            id: group.id.clone(),
            status: group.state,
            tasks: statuses,
        })
    }

    async fn execute_parallel(
        &self,
        group: &mut Group,
    ) -> Result<GroupStatus, crate::errors::StorageError> {
        group.state = State::Pending;
        let tasks = self.storage.get_group_tasks(group).await?;

        let mut join_set = JoinSet::new();
        for mut task in tasks {
            // Every task receives the group request; there is no chaining.
            task.request = group.request.clone();

            let runner = self.runner.clone();
            let cache = self.cache.clone();
            let storage = self.storage.clone();
            join_set.spawn(async move {
                if let Err(e) = runner.execute(&mut task).await {
                    error!(task_id = %task.id, task_name = %task.name, error = ?e, "error executing task");
                    task.state = State::Failed;
                    return TaskStatus {
                        id: task.id.clone(),
                        status: State::Failed,
                    };
                }
                debug!(task_id = %task.id, task_name = %task.name, "task execution completed successfully");

                let status = TaskStatus {
                    id: task.id.clone(),
                    status: task.state,
                };

                if let Err(e) = cache
                    .set(
                        &task.id,
                        &task.cache_namespace,
                        &task.cache_scope,
                        &task.response,
                    )
                    .await
                {
                    error!(task_id = %task.id, error = ?e, "error storing task result in cache");
                    return status;
                }

                if let Err(e) = storage.save_task_history(&task).await {
                    error!(task_id = %task.id, error = ?e, "error saving task history");
                }

                status
            });
        }

        let mut statuses = Vec::new();
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(status) => {
                    if status.status == State::Failed {
                        group.state = State::Failed;
                    }
                    statuses.push(status);
                }
                Err(e) => {
                    error!(group_id = %group.id, error = ?e, "group task panicked");
                    group.state = State::Failed;
                }
            }
        }

        if let Err(e) = self.queue.ack_group_tasks(group).await {
            error!(group_id = %group.id, error = ?e, "failed to ack group tasks in queue");
        }

        if group.state != State::Failed {
            group.state = State::Done;
        }

        Ok(GroupStatus {
            id: group.id.clone(),
            status: group.state,
            tasks: statuses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{InMemoryCache, InMemoryStorage, StubPolicy, seed_group_task};

    fn executor(
        storage: Arc<InMemoryStorage>,
        cache: Arc<InMemoryCache>,
        policy: StubPolicy,
    ) -> Arc<ListExecutor> {
        Arc::new(ListExecutor::new(
            storage.clone(),
            storage,
            cache,
            Arc::new(TaskRunner::new(Arc::new(policy), reqwest::Client::new())),
            5,
            Duration::from_millis(10),
            Arc::new(Metrics::new()),
        ))
    }

    fn list_with_group(group: Group) -> TaskList {
        TaskList {
            id: uuid::Uuid::new_v4().to_string(),
            name: "list".to_string(),
            state: State::Pending,
            groups: vec![group],
            request: b"{}".to_vec(),
            cache_namespace: String::new(),
            cache_scope: String::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    fn group(execution: Execution, request: &[u8]) -> Group {
        Group {
            id: uuid::Uuid::new_v4().to_string(),
            execution,
            tasks: Vec::new(),
            state: State::Created,
            request: request.to_vec(),
            final_policy: String::new(),
        }
    }

    #[tokio::test]
    async fn test_sequential_group_chains_responses() {
        let storage = Arc::new(InMemoryStorage::new());
        let cache = Arc::new(InMemoryCache::new());
        let policy = StubPolicy::new();
        policy.on("p/a", |_| Ok(b"from-a".to_vec()));
        policy.on("p/b", |input| {
            // Policy b must observe policy a's output as its input.
            assert_eq!(input, b"from-a");
            Ok(b"from-b".to_vec())
        });

        let group = group(Execution::Sequential, b"initial");
        let a = seed_group_task(&storage, &group.id, "a", "p/a").await;
        let b = seed_group_task(&storage, &group.id, "b", "p/b").await;

        let list = list_with_group(group);
        let executor = executor(storage.clone(), cache.clone(), policy);
        executor.execute(list.clone()).await;

        let archived = storage.task_list_history(&list.id).await.unwrap();
        assert_eq!(archived.state, State::Done);

        // Group queue rows are gone; per-task artifacts cached.
        assert!(storage.task(&a.id).await.unwrap_err().is_not_found());
        assert_eq!(cache.get(&a.id, "", "").await.unwrap(), b"from-a");
        assert_eq!(cache.get(&b.id, "", "").await.unwrap(), b"from-b");

        // The cached status lists both tasks done, in order.
        let cached = cache.get(&list.id, "", "").await.unwrap();
        let status: TaskListStatus = serde_json::from_slice(&cached).unwrap();
        assert_eq!(status.status, State::Done);
        assert_eq!(status.groups.len(), 1);
        let tasks = &status.groups[0].tasks;
        assert_eq!(
            tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec![a.id.as_str(), b.id.as_str()]
        );
        assert!(tasks.iter().all(|t| t.status == State::Done));
    }

    #[tokio::test]
    async fn test_sequential_failure_skips_remaining_tasks() {
        let storage = Arc::new(InMemoryStorage::new());
        let cache = Arc::new(InMemoryCache::new());
        let policy = StubPolicy::new();
        policy.on("p/fail", |_| Err("denied".to_string()));
        policy.on("p/after", |input| Ok(input.to_vec()));

        let group = group(Execution::Sequential, b"{}");
        let first = seed_group_task(&storage, &group.id, "first", "p/fail").await;
        let second = seed_group_task(&storage, &group.id, "second", "p/after").await;

        let list = list_with_group(group);
        let stub = executor(storage.clone(), cache.clone(), policy);
        stub.execute(list.clone()).await;

        let archived = storage.task_list_history(&list.id).await.unwrap();
        assert_eq!(archived.state, State::Failed);

        let cached = cache.get(&list.id, "", "").await.unwrap();
        let status: TaskListStatus = serde_json::from_slice(&cached).unwrap();
        assert_eq!(status.status, State::Failed);
        assert_eq!(status.groups[0].status, State::Failed);
        assert_eq!(status.groups[0].tasks[0].id, first.id);
        assert_eq!(status.groups[0].tasks[0].status, State::Failed);
        // The second task was marked failed without execution: no artifact.
        assert_eq!(status.groups[0].tasks[1].id, second.id);
        assert_eq!(status.groups[0].tasks[1].status, State::Failed);
        assert!(cache.get(&second.id, "", "").await.is_err());
    }

    #[tokio::test]
    async fn test_parallel_group_passes_group_request_to_every_task() {
        let storage = Arc::new(InMemoryStorage::new());
        let cache = Arc::new(InMemoryCache::new());
        let policy = StubPolicy::new();
        policy.on("p/x", |input| {
            assert_eq!(input, b"shared-input");
            Ok(b"x-done".to_vec())
        });
        policy.on("p/y", |input| {
            assert_eq!(input, b"shared-input");
            Ok(b"y-done".to_vec())
        });

        let group = group(Execution::Parallel, b"shared-input");
        let x = seed_group_task(&storage, &group.id, "x", "p/x").await;
        let y = seed_group_task(&storage, &group.id, "y", "p/y").await;

        let list = list_with_group(group);
        let stub = executor(storage.clone(), cache.clone(), policy);
        stub.execute(list.clone()).await;

        let archived = storage.task_list_history(&list.id).await.unwrap();
        assert_eq!(archived.state, State::Done);
        assert_eq!(cache.get(&x.id, "", "").await.unwrap(), b"x-done");
        assert_eq!(cache.get(&y.id, "", "").await.unwrap(), b"y-done");
    }

    #[tokio::test]
    async fn test_parallel_failure_marks_group_and_list_failed() {
        let storage = Arc::new(InMemoryStorage::new());
        let cache = Arc::new(InMemoryCache::new());
        let policy = StubPolicy::new();
        policy.on("p/x", |input| Ok(input.to_vec()));
        policy.on("p/y", |_| Err("y exploded".to_string()));
        policy.on("p/z", |input| Ok(input.to_vec()));

        let group = group(Execution::Parallel, b"{}");
        seed_group_task(&storage, &group.id, "x", "p/x").await;
        let y = seed_group_task(&storage, &group.id, "y", "p/y").await;
        seed_group_task(&storage, &group.id, "z", "p/z").await;

        let list = list_with_group(group);
        let stub = executor(storage.clone(), cache.clone(), policy);
        stub.execute(list.clone()).await;

        let archived = storage.task_list_history(&list.id).await.unwrap();
        assert_eq!(archived.state, State::Failed);

        let cached = cache.get(&list.id, "", "").await.unwrap();
        let status: TaskListStatus = serde_json::from_slice(&cached).unwrap();
        assert_eq!(status.groups[0].status, State::Failed);
        let y_status = status.groups[0]
            .tasks
            .iter()
            .find(|t| t.id == y.id)
            .unwrap();
        assert_eq!(y_status.status, State::Failed);
    }

    #[tokio::test]
    async fn test_empty_list_completes_immediately() {
        let storage = Arc::new(InMemoryStorage::new());
        let cache = Arc::new(InMemoryCache::new());

        let list = TaskList {
            id: "empty-list".to_string(),
            name: "empty".to_string(),
            state: State::Pending,
            groups: Vec::new(),
            request: b"{}".to_vec(),
            cache_namespace: String::new(),
            cache_scope: String::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let stub = executor(storage.clone(), cache.clone(), StubPolicy::new());
        stub.execute(list).await;

        let archived = storage.task_list_history("empty-list").await.unwrap();
        assert_eq!(archived.state, State::Done);

        let cached = cache.get("empty-list", "", "").await.unwrap();
        let status: TaskListStatus = serde_json::from_slice(&cached).unwrap();
        assert_eq!(status.status, State::Done);
        assert!(status.groups.is_empty());
    }

    #[tokio::test]
    async fn test_list_failure_is_terminal_no_requeue() {
        let storage = Arc::new(InMemoryStorage::new());
        let cache = Arc::new(InMemoryCache::new());
        let policy = StubPolicy::new();
        policy.on("p/fail", |_| Err("nope".to_string()));

        let group = group(Execution::Sequential, b"{}");
        seed_group_task(&storage, &group.id, "only", "p/fail").await;

        let mut list = list_with_group(group);
        list.state = State::Created;
        storage.add_task_list(&list, &[]).await.unwrap();
        let claimed = storage.poll_task_list().await.unwrap();

        let stub = executor(storage.clone(), cache, policy);
        stub.execute(claimed).await;

        // Failed lists are acked, not returned to the queue.
        assert!(storage.poll_task_list().await.unwrap_err().is_not_found());
        assert_eq!(
            storage.task_list_history(&list.id).await.unwrap().state,
            State::Failed
        );
    }
}
