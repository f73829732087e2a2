//! Handlers for single-task submission and result retrieval.

use crate::http::context::AppContext;
use crate::http::errors::ApiError;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::{Value, json};

pub(super) const CACHE_NAMESPACE_HEADER: &str = "x-cache-namespace";
pub(super) const CACHE_SCOPE_HEADER: &str = "x-cache-scope";

pub(super) fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// `POST /v1/task/{taskName}` — create a task from the named template and
/// queue it for execution.
pub async fn handle_create_task(
    State(context): State<AppContext>,
    Path(task_name): Path<String>,
    headers: HeaderMap,
    Json(data): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let task_id = context
        .task_service
        .create(
            &task_name,
            data,
            header_value(&headers, CACHE_NAMESPACE_HEADER),
            header_value(&headers, CACHE_SCOPE_HEADER),
        )
        .await?;

    Ok(Json(json!({ "taskID": task_id })))
}

/// `GET /v1/taskResult/{taskID}` — fetch the decoded artifact of a
/// completed task.
pub async fn handle_task_result(
    State(context): State<AppContext>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let result = context.task_service.task_result(&task_id).await?;
    Ok(Json(result))
}
