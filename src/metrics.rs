//! Process-local counters exposed in Prometheus exposition format.
//!
//! Counters are plain atomics bumped on the hot paths; the `/metrics`
//! endpoint renders them on demand. The metrics listener is separate from
//! the API listener so scraping stays possible while the API drains.

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters for the executors, the injector and the submission API.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Tasks claimed from the queue by the dispatcher.
    pub tasks_polled: Counter,
    /// Tasks executed to completion and acked.
    pub tasks_executed: Counter,
    /// Tasks returned to the queue for retry.
    pub tasks_retried: Counter,
    /// Tasks evicted after exhausting their retries.
    pub tasks_dropped: Counter,
    /// Task lists executed to Done.
    pub task_lists_executed: Counter,
    /// Task lists that reached Failed.
    pub task_lists_failed: Counter,
    /// Tasks enqueued by the event injector.
    pub events_injected: Counter,
    /// Events dropped as unprocessable.
    pub events_rejected: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render all counters in Prometheus exposition format.
    pub fn render(&self) -> String {
        let counters: [(&str, &str, u64); 8] = [
            (
                "taskrelay_tasks_polled_total",
                "Tasks claimed from the queue",
                self.tasks_polled.value(),
            ),
            (
                "taskrelay_tasks_executed_total",
                "Tasks executed to completion",
                self.tasks_executed.value(),
            ),
            (
                "taskrelay_tasks_retried_total",
                "Tasks returned to the queue for retry",
                self.tasks_retried.value(),
            ),
            (
                "taskrelay_tasks_dropped_total",
                "Tasks evicted after exhausting retries",
                self.tasks_dropped.value(),
            ),
            (
                "taskrelay_task_lists_executed_total",
                "Task lists executed to done",
                self.task_lists_executed.value(),
            ),
            (
                "taskrelay_task_lists_failed_total",
                "Task lists that reached failed",
                self.task_lists_failed.value(),
            ),
            (
                "taskrelay_events_injected_total",
                "Tasks enqueued by the event injector",
                self.events_injected.value(),
            ),
            (
                "taskrelay_events_rejected_total",
                "Events dropped as unprocessable",
                self.events_rejected.value(),
            ),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        }
        out
    }
}

async fn handle_metrics(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}

/// Router for the dedicated metrics listener.
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(metrics)
}
