//! Event-driven task injector.
//!
//! Subscribes to an AMQP queue carrying CloudEvents 1.0 JSON envelopes and
//! converts change events into enqueued tasks. The event payload carries a
//! `key` field encoding `cacheKey[,namespace[,scope]]`; the triple resolves
//! an [`crate::model::EventTask`] binding to a task template, and the
//! materialized task's request body is the JSON encoding of that binding.
//! Only policy-backed templates are eligible for event-triggered execution.

use crate::errors::EventError;
use crate::metrics::Metrics;
use crate::model::Task;
use crate::storage::{Queue, Storage};
use lapin::options::{BasicAckOptions, BasicGetOptions, BasicRejectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_DATA_KEY: &str = "key";
const JSON_CONTENT_TYPE: &str = "application/json";

/// Delay between polls when the queue is empty.
const IDLE_DELAY: Duration = Duration::from_millis(500);
/// Delay before retrying after a bus error.
const ERROR_DELAY: Duration = Duration::from_secs(1);

/// CloudEvents 1.0 envelope, reduced to the fields the injector reads.
#[derive(Debug, Deserialize)]
struct CloudEvent {
    #[serde(default)]
    datacontenttype: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Convert one event payload into an enqueued task.
pub(crate) async fn inject_event(
    storage: &dyn Storage,
    queue: &dyn Queue,
    payload: &[u8],
) -> Result<(), EventError> {
    let event: CloudEvent =
        serde_json::from_slice(payload).map_err(|e| EventError::Decode { source: e })?;

    if event.datacontenttype.as_deref() != Some(JSON_CONTENT_TYPE) {
        return Err(EventError::InvalidContentType);
    }

    let data = event.data.ok_or(EventError::InvalidDataKey)?;
    let cache_key = data
        .get(EVENT_DATA_KEY)
        .and_then(|v| v.as_str())
        .ok_or(EventError::InvalidDataKey)?;

    // key is `cacheKey[,namespace[,scope]]`.
    let mut parts = cache_key.split(',');
    let key = parts.next().unwrap_or_default();
    if key.is_empty() {
        return Err(EventError::EmptyCacheKey);
    }
    let namespace = parts.next().unwrap_or_default();
    let scope = parts.next().unwrap_or_default();

    let event_task = storage
        .event_task(key, namespace, scope)
        .await
        .map_err(|e| EventError::Storage { source: e })?;

    let template = storage
        .task_template(&event_task.task_name)
        .await
        .map_err(|e| EventError::Storage { source: e })?;

    if template.request_policy.is_empty() {
        return Err(EventError::NotPolicyBacked);
    }

    let input = serde_json::to_vec(&event_task).map_err(|e| EventError::Decode { source: e })?;

    let mut task = Task::from_template(&template);
    task.request = input;

    queue
        .add_task(&task)
        .await
        .map_err(|e| EventError::Storage { source: e })?;

    debug!(task_id = %task.id, task_name = %task.name, key = %key, "event task enqueued");
    Ok(())
}

pub struct EventInjector {
    storage: Arc<dyn Storage>,
    queue: Arc<dyn Queue>,
    /// Kept alive for the lifetime of the injector; dropping it closes the
    /// channel.
    _connection: Connection,
    channel: Channel,
    queue_name: String,
    metrics: Arc<Metrics>,
}

impl EventInjector {
    /// Connect to the bus and declare the durable event queue.
    pub async fn connect(
        addr: &str,
        queue_name: &str,
        storage: Arc<dyn Storage>,
        queue: Arc<dyn Queue>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, EventError> {
        let connection = Connection::connect(addr, ConnectionProperties::default())
            .await
            .map_err(|e| EventError::Bus {
                operation: "connect",
                source: e,
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| EventError::Bus {
                operation: "create_channel",
                source: e,
            })?;

        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| EventError::Bus {
                operation: "queue_declare",
                source: e,
            })?;

        Ok(Self {
            storage,
            queue,
            _connection: connection,
            channel,
            queue_name: queue_name.to_string(),
            metrics,
        })
    }

    /// Poll the event queue until the token is cancelled. Handled events
    /// are acked; events that cannot become valid (malformed payload,
    /// missing binding, non-policy template) are rejected without requeue;
    /// transient storage/bus failures leave the message for redelivery.
    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        info!(queue = %self.queue_name, "Event injector started");

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                result = self.channel.basic_get(&self.queue_name, BasicGetOptions { no_ack: false }) => {
                    match result {
                        Ok(Some(delivery)) => {
                            match inject_event(self.storage.as_ref(), self.queue.as_ref(), &delivery.data).await {
                                Ok(()) => {
                                    self.metrics.events_injected.incr();
                                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                        error!(error = ?e, "failed to ack event");
                                    }
                                }
                                Err(e) if e.is_retryable() => {
                                    warn!(error = ?e, "event handling failed, leaving for redelivery");
                                    if let Err(e) = delivery
                                        .reject(BasicRejectOptions { requeue: true })
                                        .await
                                    {
                                        error!(error = ?e, "failed to requeue event");
                                    }
                                }
                                Err(e) => {
                                    warn!(error = ?e, "dropping unprocessable event");
                                    self.metrics.events_rejected.incr();
                                    if let Err(e) = delivery
                                        .reject(BasicRejectOptions { requeue: false })
                                        .await
                                    {
                                        error!(error = ?e, "failed to reject event");
                                    }
                                }
                            }
                        }
                        Ok(None) => {
                            tokio::select! {
                                () = token.cancelled() => break,
                                () = tokio::time::sleep(IDLE_DELAY) => {}
                            }
                        }
                        Err(e) => {
                            error!(error = ?e, "event queue poll failed");
                            tokio::select! {
                                () = token.cancelled() => break,
                                () = tokio::time::sleep(ERROR_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }

        info!("Event injector stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventTask, State, TaskTemplate};
    use crate::test_helpers::InMemoryStorage;

    fn seed(storage: &InMemoryStorage, request_policy: &str) {
        storage.seed_event_task(EventTask {
            key: "k1".to_string(),
            namespace: "ns1".to_string(),
            scope: "sc1".to_string(),
            task_name: "et1".to_string(),
        });
        storage.seed_task_template(TaskTemplate {
            name: "et1".to_string(),
            url: String::new(),
            method: String::new(),
            request_policy: request_policy.to_string(),
            response_policy: String::new(),
            final_policy: String::new(),
            cache_namespace: String::new(),
            cache_scope: String::new(),
        });
    }

    fn event(content_type: &str, key: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "specversion": "1.0",
            "id": "evt-1",
            "type": "com.example.cache.change",
            "source": "cache",
            "datacontenttype": content_type,
            "data": { "key": key },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_valid_event_enqueues_task_with_binding_as_request() {
        let storage = Arc::new(InMemoryStorage::new());
        seed(&storage, "p/do");

        inject_event(
            storage.as_ref(),
            storage.as_ref(),
            &event(JSON_CONTENT_TYPE, "k1,ns1,sc1"),
        )
        .await
        .unwrap();

        let task = storage.poll_task().await.unwrap();
        assert_eq!(task.name, "et1");
        assert_eq!(task.state, State::Pending);
        assert_eq!(task.retries, 0);

        let request: serde_json::Value = serde_json::from_slice(&task.request).unwrap();
        assert_eq!(request["key"], "k1");
        assert_eq!(request["namespace"], "ns1");
        assert_eq!(request["scope"], "sc1");
        assert_eq!(request["TaskName"], "et1");

        // Exactly one row was injected.
        assert!(storage.poll_task().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_non_json_content_type_rejected() {
        let storage = Arc::new(InMemoryStorage::new());
        seed(&storage, "p/do");

        let err = inject_event(
            storage.as_ref(),
            storage.as_ref(),
            &event("text/plain", "k1,ns1,sc1"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EventError::InvalidContentType));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_key_field_rejected() {
        let storage = Arc::new(InMemoryStorage::new());
        let payload = serde_json::to_vec(&serde_json::json!({
            "datacontenttype": JSON_CONTENT_TYPE,
            "data": { "other": "value" },
        }))
        .unwrap();

        let err = inject_event(storage.as_ref(), storage.as_ref(), &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::InvalidDataKey));
    }

    #[tokio::test]
    async fn test_template_without_policy_rejected() {
        let storage = Arc::new(InMemoryStorage::new());
        seed(&storage, "");

        let err = inject_event(
            storage.as_ref(),
            storage.as_ref(),
            &event(JSON_CONTENT_TYPE, "k1,ns1,sc1"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EventError::NotPolicyBacked));
        assert!(storage.poll_task().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_missing_binding_is_not_retryable() {
        let storage = Arc::new(InMemoryStorage::new());

        let err = inject_event(
            storage.as_ref(),
            storage.as_ref(),
            &event(JSON_CONTENT_TYPE, "unknown"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EventError::Storage { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_key_without_namespace_and_scope() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.seed_event_task(EventTask {
            key: "bare".to_string(),
            namespace: String::new(),
            scope: String::new(),
            task_name: "et1".to_string(),
        });
        storage.seed_task_template(TaskTemplate {
            name: "et1".to_string(),
            url: String::new(),
            method: String::new(),
            request_policy: "p/do".to_string(),
            response_policy: String::new(),
            final_policy: String::new(),
            cache_namespace: String::new(),
            cache_scope: String::new(),
        });

        inject_event(
            storage.as_ref(),
            storage.as_ref(),
            &event(JSON_CONTENT_TYPE, "bare"),
        )
        .await
        .unwrap();
        assert!(storage.poll_task().await.is_ok());
    }
}
