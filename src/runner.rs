//! Single-task execution semantics, shared by both executors.
//!
//! A task executes either a request policy or an HTTP call to its
//! predefined URL, then the captured response flows through the optional
//! response and final policies, each overwriting `task.response`.

use crate::errors::ExecutionError;
use crate::model::{State, Task};
use crate::policy::PolicyEvaluator;
use chrono::Utc;
use std::sync::Arc;

pub struct TaskRunner {
    policy: Arc<dyn PolicyEvaluator>,
    http_client: reqwest::Client,
}

impl TaskRunner {
    pub fn new(policy: Arc<dyn PolicyEvaluator>, http_client: reqwest::Client) -> Self {
        Self {
            policy,
            http_client,
        }
    }

    /// Execute a task in place. On success the task is Done with its
    /// response, response code and timestamps populated. On error the task
    /// state is left untouched so the caller can unack or mark it Failed.
    pub async fn execute(&self, task: &mut Task) -> Result<(), ExecutionError> {
        task.started_at = Some(Utc::now());

        let response = if !task.request_policy.is_empty() {
            let response = self
                .policy
                .evaluate(&task.request_policy, &task.request)
                .await
                .map_err(|e| ExecutionError::Policy {
                    stage: "request",
                    source: e,
                })?;
            task.response_code = 200;
            response
        } else if !task.url.is_empty() && !task.method.is_empty() {
            let (status, response) = self.do_http_task(task).await?;
            task.response_code = status;
            response
        } else {
            return Err(ExecutionError::InvalidTask);
        };

        task.response = response;

        if !task.response_policy.is_empty() {
            task.response = self
                .policy
                .evaluate(&task.response_policy, &task.response)
                .await
                .map_err(|e| ExecutionError::Policy {
                    stage: "response",
                    source: e,
                })?;
        }

        if !task.final_policy.is_empty() {
            task.response = self
                .policy
                .evaluate(&task.final_policy, &task.response)
                .await
                .map_err(|e| ExecutionError::Policy {
                    stage: "final",
                    source: e,
                })?;
        }

        task.state = State::Done;
        task.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn do_http_task(&self, task: &Task) -> Result<(i32, Vec<u8>), ExecutionError> {
        let method = reqwest::Method::from_bytes(task.method.as_bytes()).map_err(|_| {
            ExecutionError::InvalidMethod {
                method: task.method.clone(),
            }
        })?;

        let mut request = self.http_client.request(method.clone(), &task.url);
        // GET requests carry no body.
        if method != reqwest::Method::GET {
            request = request.body(task.request.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExecutionError::HttpRequest { source: e })?;

        let status = response.status().as_u16() as i32;
        let body = response
            .bytes()
            .await
            .map_err(|e| ExecutionError::HttpRequest { source: e })?;

        Ok((status, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskTemplate;
    use crate::test_helpers::StubPolicy;

    fn policy_task(request_policy: &str) -> Task {
        Task::from_template(&TaskTemplate {
            name: "test".to_string(),
            url: String::new(),
            method: String::new(),
            request_policy: request_policy.to_string(),
            response_policy: String::new(),
            final_policy: String::new(),
            cache_namespace: String::new(),
            cache_scope: String::new(),
        })
    }

    #[tokio::test]
    async fn test_invalid_task_has_neither_policy_nor_url() {
        let runner = TaskRunner::new(Arc::new(StubPolicy::new()), reqwest::Client::new());
        let mut task = policy_task("");

        let err = runner.execute(&mut task).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidTask));
        assert_ne!(task.state, State::Done);
        assert!(task.finished_at.is_none());
    }

    #[tokio::test]
    async fn test_request_policy_execution_sets_done() {
        let policy = StubPolicy::new();
        policy.on("p/echo", |input| {
            let mut out = input.to_vec();
            out.extend_from_slice(b" evaluated");
            Ok(out)
        });

        let runner = TaskRunner::new(Arc::new(policy), reqwest::Client::new());
        let mut task = policy_task("p/echo");
        task.request = b"data".to_vec();

        runner.execute(&mut task).await.unwrap();
        assert_eq!(task.state, State::Done);
        assert_eq!(task.response, b"data evaluated");
        assert_eq!(task.response_code, 200);
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_response_and_final_policies_chain() {
        let policy = StubPolicy::new();
        policy.on("p/body", |_| Ok(b"raw".to_vec()));
        policy.on("p/resp", |input| {
            let mut out = input.to_vec();
            out.extend_from_slice(b"+resp");
            Ok(out)
        });
        policy.on("p/final", |input| {
            let mut out = input.to_vec();
            out.extend_from_slice(b"+final");
            Ok(out)
        });

        let runner = TaskRunner::new(Arc::new(policy), reqwest::Client::new());
        let mut task = policy_task("p/body");
        task.response_policy = "p/resp".to_string();
        task.final_policy = "p/final".to_string();

        runner.execute(&mut task).await.unwrap();
        assert_eq!(task.response, b"raw+resp+final");
    }

    #[tokio::test]
    async fn test_final_policy_applies_to_raw_response_without_response_policy() {
        let policy = StubPolicy::new();
        policy.on("p/body", |_| Ok(b"raw".to_vec()));
        policy.on("p/final", |input| {
            let mut out = input.to_vec();
            out.extend_from_slice(b"+final");
            Ok(out)
        });

        let runner = TaskRunner::new(Arc::new(policy), reqwest::Client::new());
        let mut task = policy_task("p/body");
        task.final_policy = "p/final".to_string();

        runner.execute(&mut task).await.unwrap();
        assert_eq!(task.response, b"raw+final");
    }

    #[tokio::test]
    async fn test_policy_failure_leaves_state_untouched() {
        let policy = StubPolicy::new();
        policy.on("p/fail", |_| Err("engine unavailable".to_string()));

        let runner = TaskRunner::new(Arc::new(policy), reqwest::Client::new());
        let mut task = policy_task("p/fail");

        let err = runner.execute(&mut task).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Policy {
                stage: "request",
                ..
            }
        ));
        assert_eq!(task.state, State::Created);
    }

    #[tokio::test]
    async fn test_invalid_http_method_rejected() {
        let runner = TaskRunner::new(Arc::new(StubPolicy::new()), reqwest::Client::new());
        let mut task = policy_task("");
        task.url = "http://upstream.example".to_string();
        task.method = "NOT A METHOD".to_string();

        let err = runner.execute(&mut task).await.unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidMethod { .. }));
    }
}
