//! Task-list submission and status retrieval.

use super::ServiceError;
use crate::cache::ResultCache;
use crate::model::{
    Group, GroupStatus, State, Task, TaskList, TaskListStatus, TaskListTemplate, TaskStatus,
    TaskTemplate,
};
use crate::storage::{Queue, Storage};
use anyhow::Context;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

pub struct TaskListService {
    storage: Arc<dyn Storage>,
    queue: Arc<dyn Queue>,
    cache: Arc<dyn ResultCache>,
}

impl TaskListService {
    pub fn new(storage: Arc<dyn Storage>, queue: Arc<dyn Queue>, cache: Arc<dyn ResultCache>) -> Self {
        Self {
            storage,
            queue,
            cache,
        }
    }

    /// Create a task list and its tasks from the named template and put
    /// them in their queues for execution. Returns the new list id.
    pub async fn create(
        &self,
        task_list_name: &str,
        data: serde_json::Value,
        cache_namespace: Option<String>,
        cache_scope: Option<String>,
    ) -> Result<String, ServiceError> {
        if task_list_name.is_empty() {
            return Err(ServiceError::BadRequest("missing taskListName".to_string()));
        }

        let template = self
            .storage
            .task_list_template(task_list_name)
            .await
            .map_err(|e| {
                if !e.is_not_found() {
                    error!(task_list_name = %task_list_name, error = ?e, "error getting taskList template from storage");
                }
                ServiceError::from_storage(e, "taskList template not found")
            })?;

        let task_templates = self
            .storage
            .task_templates(&task_names_from_template(&template))
            .await
            .map_err(|e| {
                error!(task_list_name = %task_list_name, error = ?e, "error getting task templates from storage");
                ServiceError::Unknown(e.into())
            })?;

        let request = serde_json::to_vec(&data)
            .map_err(|e| ServiceError::BadRequest(format!("error marshaling request data to JSON: {}", e)))?;

        let mut list = TaskList {
            id: uuid::Uuid::new_v4().to_string(),
            name: template.name.clone(),
            state: State::Created,
            groups: create_groups(&template, &request),
            request,
            cache_namespace: template.cache_namespace.clone(),
            cache_scope: template.cache_scope.clone(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        // Caller-provided cache key fields win over the template defaults.
        if let Some(namespace) = cache_namespace.filter(|v| !v.is_empty()) {
            list.cache_namespace = namespace;
        }
        if let Some(scope) = cache_scope.filter(|v| !v.is_empty()) {
            list.cache_scope = scope;
        }

        let tasks = create_tasks(&list, &task_templates).map_err(|e| {
            error!(task_list_name = %task_list_name, error = %e, "failed to create tasks for taskList");
            e
        })?;

        self.queue.add_task_list(&list, &tasks).await.map_err(|e| {
            error!(task_list_name = %task_list_name, error = ?e, "error adding taskList to queue");
            ServiceError::Unknown(anyhow::Error::from(e).context("error adding taskList to queue"))
        })?;

        debug!(task_list_id = %list.id, task_list_name = %task_list_name, tasks = tasks.len(), "taskList created");
        Ok(list.id)
    }

    /// Retrieve a task list's status. Terminal lists report the artifact
    /// the list executor cached; lists still in flight have their status
    /// computed from the live queue records.
    pub async fn status(&self, task_list_id: &str) -> Result<TaskListStatus, ServiceError> {
        if task_list_id.is_empty() {
            return Err(ServiceError::BadRequest("missing taskListID".to_string()));
        }

        let list = match self.storage.task_list_history(task_list_id).await {
            Ok(list) => list,
            Err(e) if e.is_not_found() => {
                self.storage.task_list(task_list_id).await.map_err(|e| {
                    if !e.is_not_found() {
                        error!(task_list_id = %task_list_id, error = ?e, "error getting taskList from storage");
                    }
                    ServiceError::from_storage(e, "taskList is not found")
                })?
            }
            Err(e) => {
                error!(task_list_id = %task_list_id, error = ?e, "error getting taskList from history collection");
                return Err(ServiceError::Unknown(e.into()));
            }
        };

        if !list.state.is_terminal() {
            return self.calculate_status(&list).await;
        }

        let value = self
            .cache
            .get(&list.id, &list.cache_namespace, &list.cache_scope)
            .await
            .map_err(|e| {
                error!(task_list_id = %task_list_id, error = ?e, "error getting taskList result from cache");
                ServiceError::Unknown(e.into())
            })?;

        serde_json::from_slice(&value)
            .context("error decoding result from cache")
            .map_err(ServiceError::Unknown)
    }

    /// Compute the in-progress status of a list by reading each group's
    /// tasks from storage.
    async fn calculate_status(&self, list: &TaskList) -> Result<TaskListStatus, ServiceError> {
        let mut groups = Vec::with_capacity(list.groups.len());
        for group in &list.groups {
            let tasks = self.storage.get_group_tasks(group).await.map_err(|e| {
                error!(group_id = %group.id, error = ?e, "error getting group tasks");
                ServiceError::Unknown(e.into())
            })?;

            groups.push(GroupStatus {
                id: group.id.clone(),
                status: group.state,
                tasks: tasks
                    .iter()
                    .map(|task| TaskStatus {
                        id: task.id.clone(),
                        status: task.state,
                    })
                    .collect(),
            });
        }

        Ok(TaskListStatus {
            id: list.id.clone(),
            status: list.state,
            groups,
        })
    }
}

fn create_groups(template: &TaskListTemplate, request: &[u8]) -> Vec<Group> {
    template
        .groups
        .iter()
        .map(|group| Group {
            id: uuid::Uuid::new_v4().to_string(),
            execution: group.execution,
            tasks: group.tasks.clone(),
            state: State::Created,
            request: request.to_vec(),
            final_policy: group.final_policy.clone(),
        })
        .collect()
}

/// Materialize the task rows for every group of the list. Missing task
/// templates fail the whole submission.
fn create_tasks(
    list: &TaskList,
    templates: &HashMap<String, TaskTemplate>,
) -> Result<Vec<Task>, ServiceError> {
    let mut tasks = Vec::new();
    for group in &list.groups {
        for task_name in &group.tasks {
            let template = templates.get(task_name).ok_or_else(|| {
                ServiceError::NotFound("failed to find task template".to_string())
            })?;

            let mut task = Task::from_template(template);
            task.group_id = group.id.clone();

            // Cache key fields set on the list win over the task template
            // defaults.
            if !list.cache_namespace.is_empty() {
                task.cache_namespace = list.cache_namespace.clone();
            }
            if !list.cache_scope.is_empty() {
                task.cache_scope = list.cache_scope.clone();
            }

            tasks.push(task);
        }
    }
    Ok(tasks)
}

fn task_names_from_template(template: &TaskListTemplate) -> Vec<String> {
    template
        .groups
        .iter()
        .flat_map(|group| group.tasks.iter().cloned())
        .collect()
}
