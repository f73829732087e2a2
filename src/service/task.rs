//! Single-task submission and result retrieval.

use super::ServiceError;
use crate::cache::ResultCache;
use crate::model::Task;
use crate::storage::{Queue, Storage};
use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, error};

pub struct TaskService {
    storage: Arc<dyn Storage>,
    queue: Arc<dyn Queue>,
    cache: Arc<dyn ResultCache>,
}

impl TaskService {
    pub fn new(storage: Arc<dyn Storage>, queue: Arc<dyn Queue>, cache: Arc<dyn ResultCache>) -> Self {
        Self {
            storage,
            queue,
            cache,
        }
    }

    /// Create a task from the named template and put it in the queue for
    /// later execution. Returns the new task id, the client's handle for
    /// result retrieval.
    pub async fn create(
        &self,
        task_name: &str,
        data: serde_json::Value,
        cache_namespace: Option<String>,
        cache_scope: Option<String>,
    ) -> Result<String, ServiceError> {
        if task_name.is_empty() {
            return Err(ServiceError::BadRequest("missing taskName".to_string()));
        }

        let template = self
            .storage
            .task_template(task_name)
            .await
            .map_err(|e| {
                if !e.is_not_found() {
                    error!(task_name = %task_name, error = ?e, "error getting task template from storage");
                }
                ServiceError::from_storage(e, "task template not found")
            })?;

        let request = serde_json::to_vec(&data)
            .map_err(|e| ServiceError::BadRequest(format!("error marshaling request data to JSON: {}", e)))?;

        let mut task = Task::from_template(&template);
        task.request = request;

        // Caller-provided cache key fields win over the template defaults.
        if let Some(namespace) = cache_namespace.filter(|v| !v.is_empty()) {
            task.cache_namespace = namespace;
        }
        if let Some(scope) = cache_scope.filter(|v| !v.is_empty()) {
            task.cache_scope = scope;
        }

        self.queue.add_task(&task).await.map_err(|e| {
            error!(task_name = %task_name, error = ?e, "error adding task to queue");
            ServiceError::Unknown(anyhow::Error::from(e).context("failed to create task"))
        })?;

        debug!(task_id = %task.id, task_name = %task_name, "task created");
        Ok(task.id)
    }

    /// Retrieve a completed task's result from the cache. The task is
    /// looked up in history first, then in the live queue; a task that is
    /// not yet terminal reports NotFound.
    pub async fn task_result(&self, task_id: &str) -> Result<serde_json::Value, ServiceError> {
        if task_id.is_empty() {
            return Err(ServiceError::BadRequest("missing taskID".to_string()));
        }

        let task = match self.storage.task_history(task_id).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => self.storage.task(task_id).await.map_err(|e| {
                if !e.is_not_found() {
                    error!(task_id = %task_id, error = ?e, "error getting task from storage");
                }
                ServiceError::from_storage(e, "task is not found")
            })?,
            Err(e) => {
                error!(task_id = %task_id, error = ?e, "error getting task from history collection");
                return Err(ServiceError::Unknown(e.into()));
            }
        };

        if !task.state.is_terminal() {
            return Err(ServiceError::NotFound(
                "no result, task is not completed".to_string(),
            ));
        }

        let value = self
            .cache
            .get(&task.id, &task.cache_namespace, &task.cache_scope)
            .await
            .map_err(|e| {
                error!(task_id = %task_id, error = ?e, "error getting task result from cache");
                ServiceError::Unknown(e.into())
            })?;

        serde_json::from_slice(&value)
            .context("error decoding result from cache")
            .map_err(ServiceError::Unknown)
    }
}
