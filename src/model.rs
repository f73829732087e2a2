//! Core data types for tasks, task lists and their templates.
//!
//! Templates are administrator-owned definitions stored by name. Instances
//! are created from templates on submission, carry a fresh UUID, and live in
//! the queue tables until an executor moves them to history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task, group or task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Initial state; the record is eligible for claiming.
    #[default]
    Created,
    /// A worker has claimed the record and is processing it, indicating to
    /// other workers that they must not pick it up.
    Pending,
    /// Execution completed successfully.
    Done,
    /// Execution failed terminally. Set for tasks inside a group where a
    /// later retry is not possible, and for lists with a failed group.
    Failed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Created => "created",
            State::Pending => "pending",
            State::Done => "done",
            State::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<State> {
        match value {
            "created" => Some(State::Created),
            "pending" => Some(State::Pending),
            "done" => Some(State::Done),
            "failed" => Some(State::Failed),
            _ => None,
        }
    }

    /// Done and Failed are terminal; results become readable and the record
    /// moves to history.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Done | State::Failed)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How tasks within a group are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    /// One after another, each task receiving the previous task's response
    /// as its request.
    Sequential,
    /// All at once, every task receiving the group request.
    Parallel,
}

/// A single unit of work scheduled for execution.
///
/// A task either evaluates a named policy (`request_policy` set) or performs
/// an HTTP call (`url` and `method` set). Empty strings mean "unset"; the
/// instance is invalid when neither shape is satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier, assigned on instantiation.
    pub id: String,
    /// Set when the task belongs to a task-list group; empty for standalone
    /// tasks. The single-task executor never claims grouped tasks.
    #[serde(rename = "groupID")]
    pub group_id: String,
    /// Template name this task was instantiated from.
    pub name: String,
    pub state: State,
    pub url: String,
    pub method: String,
    /// Request body sent to the policy engine or HTTP endpoint.
    pub request: Vec<u8>,
    /// Response captured after execution.
    pub response: Vec<u8>,
    pub response_code: i32,
    /// Policy evaluated as the task body.
    pub request_policy: String,
    /// Policy applied to the raw response.
    pub response_policy: String,
    /// Policy applied last, to whatever the response policy produced.
    pub final_policy: String,
    pub cache_namespace: String,
    pub cache_scope: String,
    /// Number of failed execution attempts so far.
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Instantiate a task from a stored template with a fresh identifier.
    /// The request body and any cache-field overrides are the caller's.
    pub fn from_template(template: &TaskTemplate) -> Self {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            group_id: String::new(),
            name: template.name.clone(),
            state: State::Created,
            url: template.url.clone(),
            method: template.method.clone(),
            request: Vec::new(),
            response: Vec::new(),
            response_code: 0,
            request_policy: template.request_policy.clone(),
            response_policy: template.response_policy.clone(),
            final_policy: template.final_policy.clone(),
            cache_namespace: template.cache_namespace.clone(),
            cache_scope: template.cache_scope.clone(),
            retries: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Composite cache key: `id[,namespace][,scope]` with blank components
    /// trimmed and skipped.
    pub fn cache_key(&self) -> String {
        let mut key = self.id.clone();
        let namespace = self.cache_namespace.trim();
        let scope = self.cache_scope.trim();
        if !namespace.is_empty() {
            key.push(',');
            key.push_str(namespace);
        }
        if !scope.is_empty() {
            key.push(',');
            key.push_str(scope);
        }
        key
    }
}

/// Stored definition of a named task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub request_policy: String,
    #[serde(default)]
    pub response_policy: String,
    #[serde(default)]
    pub final_policy: String,
    #[serde(default)]
    pub cache_namespace: String,
    #[serde(default)]
    pub cache_scope: String,
}

/// Ordered segment of a task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub execution: Execution,
    /// Ordered task template names.
    pub tasks: Vec<String>,
    pub state: State,
    /// Input shared among the group's tasks at group start.
    pub request: Vec<u8>,
    #[serde(default)]
    pub final_policy: String,
}

/// Group definition inside a task-list template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupTemplate {
    pub execution: Execution,
    #[serde(default)]
    pub final_policy: String,
    pub tasks: Vec<String>,
}

/// An ordered sequence of groups executed one after another.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    pub id: String,
    pub name: String,
    pub state: State,
    pub groups: Vec<Group>,
    pub request: Vec<u8>,
    pub cache_namespace: String,
    pub cache_scope: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Stored definition of a named task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListTemplate {
    pub name: String,
    #[serde(default)]
    pub cache_namespace: String,
    #[serde(default)]
    pub cache_scope: String,
    pub groups: Vec<GroupTemplate>,
}

/// Binding between an external change-event key and a task template name,
/// resolved by the event injector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventTask {
    pub key: String,
    pub namespace: String,
    pub scope: String,
    #[serde(rename = "TaskName")]
    pub task_name: String,
}

/// Status of one task inside a task-list status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: String,
    pub status: State,
}

/// Status of one group inside a task-list status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupStatus {
    pub id: String,
    pub status: State,
    #[serde(default)]
    pub tasks: Vec<TaskStatus>,
}

/// Aggregated task-list status: the artifact cached by the list executor
/// and the shape computed live for non-terminal lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListStatus {
    pub id: String,
    pub status: State,
    #[serde(default)]
    pub groups: Vec<GroupStatus>,
}
