//! PostgreSQL-backed storage implementation.
//!
//! The `tasks` and `task_lists` tables double as live queues. The claim
//! queries rely on `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! observe the same Created row: the subselect locks the oldest eligible
//! row, the enclosing UPDATE flips it to Pending and RETURNING hands the
//! updated record back in one round trip.

use super::{Queue, Storage, StorageResult};
use crate::errors::StorageError;
use crate::model::{EventTask, Group, State, Task, TaskList, TaskListTemplate, TaskTemplate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::error;

/// Maximum attempts for history inserts, with delays of
/// 100ms * 2^n between attempts.
const HISTORY_MAX_ATTEMPTS: u32 = 5;
const HISTORY_BASE_DELAY: Duration = Duration::from_millis(100);

const TASK_COLUMNS: &str = "id, group_id, name, state, url, method, request, response, \
     response_code, request_policy, response_policy, final_policy, \
     cache_namespace, cache_scope, retries, created_at, started_at, finished_at";

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn task_from_row(row: &PgRow) -> StorageResult<Task> {
        let state: String = row.get("state");
        Ok(Task {
            id: row.get("id"),
            group_id: row.get("group_id"),
            name: row.get("name"),
            state: State::parse(&state).ok_or_else(|| StorageError::InvalidData {
                details: format!("unknown task state: {}", state),
            })?,
            url: row.get("url"),
            method: row.get("method"),
            request: row.get("request"),
            response: row.get("response"),
            response_code: row.get("response_code"),
            request_policy: row.get("request_policy"),
            response_policy: row.get("response_policy"),
            final_policy: row.get("final_policy"),
            cache_namespace: row.get("cache_namespace"),
            cache_scope: row.get("cache_scope"),
            retries: row.get("retries"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            started_at: row.get::<Option<DateTime<Utc>>, _>("started_at"),
            finished_at: row.get::<Option<DateTime<Utc>>, _>("finished_at"),
        })
    }

    fn task_list_from_row(row: &PgRow) -> StorageResult<TaskList> {
        let state: String = row.get("state");
        let groups: serde_json::Value = row.get("groups");
        Ok(TaskList {
            id: row.get("id"),
            name: row.get("name"),
            state: State::parse(&state).ok_or_else(|| StorageError::InvalidData {
                details: format!("unknown taskList state: {}", state),
            })?,
            groups: serde_json::from_value(groups).map_err(|e| StorageError::InvalidData {
                details: format!("failed to decode taskList groups: {}", e),
            })?,
            request: row.get("request"),
            cache_namespace: row.get("cache_namespace"),
            cache_scope: row.get("cache_scope"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            started_at: row.get::<Option<DateTime<Utc>>, _>("started_at"),
            finished_at: row.get::<Option<DateTime<Utc>>, _>("finished_at"),
        })
    }

    fn template_from_row(row: &PgRow) -> TaskTemplate {
        TaskTemplate {
            name: row.get("name"),
            url: row.get("url"),
            method: row.get("method"),
            request_policy: row.get("request_policy"),
            response_policy: row.get("response_policy"),
            final_policy: row.get("final_policy"),
            cache_namespace: row.get("cache_namespace"),
            cache_scope: row.get("cache_scope"),
        }
    }

    async fn insert_task(&self, task: &Task, table: &str) -> StorageResult<()> {
        let query = format!(
            "INSERT INTO {table} ({TASK_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        );
        sqlx::query(&query)
            .bind(&task.id)
            .bind(&task.group_id)
            .bind(&task.name)
            .bind(task.state.as_str())
            .bind(&task.url)
            .bind(&task.method)
            .bind(&task.request)
            .bind(&task.response)
            .bind(task.response_code)
            .bind(&task.request_policy)
            .bind(&task.response_policy)
            .bind(&task.final_policy)
            .bind(&task.cache_namespace)
            .bind(&task.cache_scope)
            .bind(task.retries)
            .bind(task.created_at)
            .bind(task.started_at)
            .bind(task.finished_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(error = ?e, task_id = %task.id, table = table, "Failed to insert task");
                StorageError::QueryFailed { source: e }
            })?;
        Ok(())
    }
}

#[async_trait]
impl Queue for PostgresStorage {
    async fn add_task(&self, task: &Task) -> StorageResult<()> {
        self.insert_task(task, "tasks").await
    }

    async fn poll_task(&self) -> StorageResult<Task> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks SET state = 'pending', claimed_at = NOW()
            WHERE id = (
                SELECT id FROM tasks
                WHERE state = 'created' AND group_id = ''
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, "Failed to poll task queue");
            StorageError::QueryFailed { source: e }
        })?;

        match row {
            Some(row) => Self::task_from_row(&row),
            None => Err(StorageError::NotFound { entity: "task" }),
        }
    }

    async fn ack_task(&self, task: &Task) -> StorageResult<()> {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(&task.id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(error = ?e, task_id = %task.id, "Failed to ack task");
                StorageError::QueryFailed { source: e }
            })?;
        Ok(())
    }

    async fn unack_task(&self, task: &Task) -> StorageResult<()> {
        sqlx::query(
            "UPDATE tasks SET state = 'created', retries = $2, claimed_at = NULL WHERE id = $1",
        )
        .bind(&task.id)
        .bind(task.retries + 1)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, task_id = %task.id, "Failed to unack task");
            StorageError::QueryFailed { source: e }
        })?;
        Ok(())
    }

    async fn add_task_list(&self, list: &TaskList, tasks: &[Task]) -> StorageResult<()> {
        let groups = serde_json::to_value(&list.groups).map_err(|e| StorageError::InvalidData {
            details: format!("failed to encode taskList groups: {}", e),
        })?;

        // The list record and its task rows land together or not at all.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::TransactionFailed { source: e })?;

        sqlx::query(
            r#"
            INSERT INTO task_lists
                (id, name, state, groups, request, cache_namespace, cache_scope,
                 created_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&list.id)
        .bind(&list.name)
        .bind(list.state.as_str())
        .bind(&groups)
        .bind(&list.request)
        .bind(&list.cache_namespace)
        .bind(&list.cache_scope)
        .bind(list.created_at)
        .bind(list.started_at)
        .bind(list.finished_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!(error = ?e, task_list_id = %list.id, "Failed to insert taskList");
            StorageError::QueryFailed { source: e }
        })?;

        for task in tasks {
            sqlx::query(&format!(
                "INSERT INTO tasks ({TASK_COLUMNS})
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
            ))
            .bind(&task.id)
            .bind(&task.group_id)
            .bind(&task.name)
            .bind(task.state.as_str())
            .bind(&task.url)
            .bind(&task.method)
            .bind(&task.request)
            .bind(&task.response)
            .bind(task.response_code)
            .bind(&task.request_policy)
            .bind(&task.response_policy)
            .bind(&task.final_policy)
            .bind(&task.cache_namespace)
            .bind(&task.cache_scope)
            .bind(task.retries)
            .bind(task.created_at)
            .bind(task.started_at)
            .bind(task.finished_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!(error = ?e, task_id = %task.id, "Failed to insert taskList task");
                StorageError::QueryFailed { source: e }
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionFailed { source: e })?;
        Ok(())
    }

    async fn poll_task_list(&self) -> StorageResult<TaskList> {
        let row = sqlx::query(
            r#"
            UPDATE task_lists SET state = 'pending'
            WHERE id = (
                SELECT id FROM task_lists
                WHERE state = 'created'
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, name, state, groups, request, cache_namespace, cache_scope,
                      created_at, started_at, finished_at
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, "Failed to poll taskList queue");
            StorageError::QueryFailed { source: e }
        })?;

        match row {
            Some(row) => Self::task_list_from_row(&row),
            None => Err(StorageError::NotFound { entity: "taskList" }),
        }
    }

    async fn ack_task_list(&self, list: &TaskList) -> StorageResult<()> {
        sqlx::query("DELETE FROM task_lists WHERE id = $1")
            .bind(&list.id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(error = ?e, task_list_id = %list.id, "Failed to ack taskList");
                StorageError::QueryFailed { source: e }
            })?;
        Ok(())
    }

    async fn ack_group_tasks(&self, group: &Group) -> StorageResult<()> {
        sqlx::query("DELETE FROM tasks WHERE group_id = $1")
            .bind(&group.id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(error = ?e, group_id = %group.id, "Failed to ack group tasks");
                StorageError::QueryFailed { source: e }
            })?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn task(&self, task_id: &str) -> StorageResult<Task> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!(error = ?e, task_id = %task_id, "Failed to get task");
                StorageError::QueryFailed { source: e }
            })?;

        match row {
            Some(row) => Self::task_from_row(&row),
            None => Err(StorageError::NotFound { entity: "task" }),
        }
    }

    async fn task_template(&self, name: &str) -> StorageResult<TaskTemplate> {
        let row = sqlx::query(
            "SELECT name, url, method, request_policy, response_policy, final_policy, \
             cache_namespace, cache_scope FROM task_templates WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, task_name = %name, "Failed to get task template");
            StorageError::QueryFailed { source: e }
        })?;

        match row {
            Some(row) => Ok(Self::template_from_row(&row)),
            None => Err(StorageError::NotFound {
                entity: "task template",
            }),
        }
    }

    async fn task_templates(&self, names: &[String]) -> StorageResult<HashMap<String, TaskTemplate>> {
        let rows = sqlx::query(
            "SELECT name, url, method, request_policy, response_policy, final_policy, \
             cache_namespace, cache_scope FROM task_templates WHERE name = ANY($1)",
        )
        .bind(names)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, "Failed to get task templates");
            StorageError::QueryFailed { source: e }
        })?;

        let mut templates = HashMap::with_capacity(rows.len());
        for row in &rows {
            let template = Self::template_from_row(row);
            templates.insert(template.name.clone(), template);
        }
        Ok(templates)
    }

    async fn task_history(&self, task_id: &str) -> StorageResult<Task> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks_history WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, task_id = %task_id, "Failed to get task history");
            StorageError::QueryFailed { source: e }
        })?;

        match row {
            Some(row) => Self::task_from_row(&row),
            None => Err(StorageError::NotFound { entity: "task" }),
        }
    }

    async fn save_task_history(&self, task: &Task) -> StorageResult<()> {
        // Upsert keyed by id: a re-execution after a crash between history
        // save and queue ack overwrites instead of duplicating.
        let query = format!(
            r#"
            INSERT INTO tasks_history ({TASK_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                response = EXCLUDED.response,
                response_code = EXCLUDED.response_code,
                retries = EXCLUDED.retries,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at
            "#
        );

        let mut attempt = 0;
        loop {
            let result = sqlx::query(&query)
                .bind(&task.id)
                .bind(&task.group_id)
                .bind(&task.name)
                .bind(task.state.as_str())
                .bind(&task.url)
                .bind(&task.method)
                .bind(&task.request)
                .bind(&task.response)
                .bind(task.response_code)
                .bind(&task.request_policy)
                .bind(&task.response_policy)
                .bind(&task.final_policy)
                .bind(&task.cache_namespace)
                .bind(&task.cache_scope)
                .bind(task.retries)
                .bind(task.created_at)
                .bind(task.started_at)
                .bind(task.finished_at)
                .execute(&self.pool)
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempt + 1 < HISTORY_MAX_ATTEMPTS => {
                    error!(error = ?e, task_id = %task.id, attempt, "Retrying task history insert");
                    tokio::time::sleep(HISTORY_BASE_DELAY * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(error = ?e, task_id = %task.id, "Giving up on task history insert");
                    return Err(StorageError::QueryFailed { source: e });
                }
            }
        }
    }

    async fn task_list(&self, task_list_id: &str) -> StorageResult<TaskList> {
        let row = sqlx::query(
            "SELECT id, name, state, groups, request, cache_namespace, cache_scope, \
             created_at, started_at, finished_at FROM task_lists WHERE id = $1",
        )
        .bind(task_list_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, task_list_id = %task_list_id, "Failed to get taskList");
            StorageError::QueryFailed { source: e }
        })?;

        match row {
            Some(row) => Self::task_list_from_row(&row),
            None => Err(StorageError::NotFound { entity: "taskList" }),
        }
    }

    async fn task_list_template(&self, name: &str) -> StorageResult<TaskListTemplate> {
        let row = sqlx::query(
            "SELECT name, cache_namespace, cache_scope, groups \
             FROM task_list_templates WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, task_list_name = %name, "Failed to get taskList template");
            StorageError::QueryFailed { source: e }
        })?;

        let Some(row) = row else {
            return Err(StorageError::NotFound {
                entity: "taskList template",
            });
        };

        let groups: serde_json::Value = row.get("groups");
        Ok(TaskListTemplate {
            name: row.get("name"),
            cache_namespace: row.get("cache_namespace"),
            cache_scope: row.get("cache_scope"),
            groups: serde_json::from_value(groups).map_err(|e| StorageError::InvalidData {
                details: format!("failed to decode taskList template groups: {}", e),
            })?,
        })
    }

    async fn task_list_history(&self, task_list_id: &str) -> StorageResult<TaskList> {
        let row = sqlx::query(
            "SELECT id, name, state, groups, request, cache_namespace, cache_scope, \
             created_at, started_at, finished_at FROM task_list_history WHERE id = $1",
        )
        .bind(task_list_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, task_list_id = %task_list_id, "Failed to get taskList history");
            StorageError::QueryFailed { source: e }
        })?;

        match row {
            Some(row) => Self::task_list_from_row(&row),
            None => Err(StorageError::NotFound { entity: "taskList" }),
        }
    }

    async fn save_task_list_history(&self, list: &TaskList) -> StorageResult<()> {
        let groups = serde_json::to_value(&list.groups).map_err(|e| StorageError::InvalidData {
            details: format!("failed to encode taskList groups: {}", e),
        })?;

        let query = r#"
            INSERT INTO task_list_history
                (id, name, state, groups, request, cache_namespace, cache_scope,
                 created_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                groups = EXCLUDED.groups,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at
            "#;

        let mut attempt = 0;
        loop {
            let result = sqlx::query(query)
                .bind(&list.id)
                .bind(&list.name)
                .bind(list.state.as_str())
                .bind(&groups)
                .bind(&list.request)
                .bind(&list.cache_namespace)
                .bind(&list.cache_scope)
                .bind(list.created_at)
                .bind(list.started_at)
                .bind(list.finished_at)
                .execute(&self.pool)
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempt + 1 < HISTORY_MAX_ATTEMPTS => {
                    error!(error = ?e, task_list_id = %list.id, attempt, "Retrying taskList history insert");
                    tokio::time::sleep(HISTORY_BASE_DELAY * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(error = ?e, task_list_id = %list.id, "Giving up on taskList history insert");
                    return Err(StorageError::QueryFailed { source: e });
                }
            }
        }
    }

    async fn get_group_tasks(&self, group: &Group) -> StorageResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE group_id = $1 ORDER BY created_at"
        ))
        .bind(&group.id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, group_id = %group.id, "Failed to get group tasks");
            StorageError::QueryFailed { source: e }
        })?;

        rows.iter().map(Self::task_from_row).collect()
    }

    async fn event_task(&self, key: &str, namespace: &str, scope: &str) -> StorageResult<EventTask> {
        let row = sqlx::query(
            "SELECT key, namespace, scope, task_name FROM event_tasks \
             WHERE key = $1 AND namespace = $2 AND scope = $3",
        )
        .bind(key)
        .bind(namespace)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, key = %key, "Failed to get eventTask");
            StorageError::QueryFailed { source: e }
        })?;

        match row {
            Some(row) => Ok(EventTask {
                key: row.get("key"),
                namespace: row.get("namespace"),
                scope: row.get("scope"),
                task_name: row.get("task_name"),
            }),
            None => Err(StorageError::NotFound { entity: "eventTask" }),
        }
    }

    async fn requeue_stale_tasks(&self, older_than: Duration) -> StorageResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET state = 'created', claimed_at = NULL
            WHERE state = 'pending'
              AND group_id = ''
              AND claimed_at IS NOT NULL
              AND claimed_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = ?e, "Failed to requeue stale tasks");
            StorageError::QueryFailed { source: e }
        })?;

        Ok(result.rows_affected())
    }
}
