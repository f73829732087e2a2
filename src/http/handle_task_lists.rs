//! Handlers for task-list submission and status retrieval.

use crate::http::context::AppContext;
use crate::http::errors::ApiError;
use crate::http::handle_tasks::{CACHE_NAMESPACE_HEADER, CACHE_SCOPE_HEADER, header_value};
use crate::model::State as ListState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

/// `POST /v1/taskList/{taskListName}` — create a task list and its tasks
/// from the named template and queue them for execution.
pub async fn handle_create_task_list(
    State(context): State<AppContext>,
    Path(task_list_name): Path<String>,
    headers: HeaderMap,
    Json(data): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let task_list_id = context
        .task_list_service
        .create(
            &task_list_name,
            data,
            header_value(&headers, CACHE_NAMESPACE_HEADER),
            header_value(&headers, CACHE_SCOPE_HEADER),
        )
        .await?;

    Ok(Json(json!({ "taskListID": task_list_id })))
}

/// `GET /v1/taskListStatus/{taskListID}` — the list's current status. The
/// HTTP code reflects the list state: done 200, created 201, pending 202,
/// failed 207.
pub async fn handle_task_list_status(
    State(context): State<AppContext>,
    Path(task_list_id): Path<String>,
) -> Result<Response, ApiError> {
    let status = context.task_list_service.status(&task_list_id).await?;

    let code = match status.status {
        ListState::Done => StatusCode::OK,
        ListState::Created => StatusCode::CREATED,
        ListState::Pending => StatusCode::ACCEPTED,
        ListState::Failed => StatusCode::MULTI_STATUS,
    };

    Ok((code, Json(status)).into_response())
}
