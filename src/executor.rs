//! Single-task executor: a polling dispatcher and a pool of workers.
//!
//! The dispatcher claims tasks from the durable queue on a fixed interval
//! and hands them to idle workers over a capacity-1 channel whose receiver
//! the workers share behind a mutex. When every worker is busy the
//! dispatcher's send blocks, which stops it from over-polling the queue —
//! backpressure flows from the workers to the store.
//!
//! Completion is at-most-once per attempt: a worker either acks the task
//! (removing it from the queue) or unacks it (returning it to Created with
//! `retries` incremented). A task whose retries reach the configured cap is
//! dropped from the queue without execution.

use crate::cache::ResultCache;
use crate::metrics::Metrics;
use crate::model::Task;
use crate::runner::TaskRunner;
use crate::storage::{Queue, Storage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sweep for stale Pending claims every this many dispatcher ticks.
const SWEEP_EVERY_TICKS: u64 = 60;

pub struct Executor {
    queue: Arc<dyn Queue>,
    storage: Arc<dyn Storage>,
    cache: Arc<dyn ResultCache>,
    runner: Arc<TaskRunner>,
    workers: usize,
    poll_interval: Duration,
    max_task_retries: i32,
    claim_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn Queue>,
        storage: Arc<dyn Storage>,
        cache: Arc<dyn ResultCache>,
        runner: Arc<TaskRunner>,
        workers: usize,
        poll_interval: Duration,
        max_task_retries: i32,
        claim_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            queue,
            storage,
            cache,
            runner,
            workers,
            poll_interval,
            max_task_retries,
            claim_timeout,
            metrics,
        }
    }

    /// Run the dispatcher loop until the token is cancelled. Workers drain
    /// their in-flight task before exiting.
    pub async fn run(self, token: CancellationToken) -> anyhow::Result<()> {
        info!(workers = self.workers, "Task executor started");

        let (sender, receiver) = mpsc::channel::<Task>(1);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let worker = Worker {
                queue: self.queue.clone(),
                storage: self.storage.clone(),
                cache: self.cache.clone(),
                runner: self.runner.clone(),
                max_task_retries: self.max_task_retries,
                metrics: self.metrics.clone(),
            };
            let receiver = receiver.clone();
            handles.push(tokio::spawn(async move {
                worker.run(worker_id, receiver).await;
            }));
        }

        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.poll_interval) => {
                    ticks += 1;
                    if !self.claim_timeout.is_zero() && ticks % SWEEP_EVERY_TICKS == 0 {
                        match self.storage.requeue_stale_tasks(self.claim_timeout).await {
                            Ok(0) => {}
                            Ok(count) => warn!(count, "Returned stale pending tasks to the queue"),
                            Err(e) => error!(error = ?e, "Failed to requeue stale tasks"),
                        }
                    }

                    let task = match self.queue.poll_task().await {
                        Ok(task) => task,
                        Err(e) => {
                            if !e.is_not_found() {
                                error!(error = ?e, "error getting task from queue");
                            }
                            continue;
                        }
                    };
                    self.metrics.tasks_polled.incr();

                    // Blocks while every worker is busy; this is the
                    // backpressure point.
                    tokio::select! {
                        () = token.cancelled() => break,
                        result = sender.send(task) => {
                            if result.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Closing the channel lets each worker finish its current task and
        // exit once the queue drains.
        drop(sender);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = ?e, "Task worker panicked");
            }
        }

        info!("Task executor stopped");
        Ok(())
    }
}

struct Worker {
    queue: Arc<dyn Queue>,
    storage: Arc<dyn Storage>,
    cache: Arc<dyn ResultCache>,
    runner: Arc<TaskRunner>,
    max_task_retries: i32,
    metrics: Arc<Metrics>,
}

impl Worker {
    async fn run(&self, worker_id: usize, receiver: Arc<Mutex<mpsc::Receiver<Task>>>) {
        loop {
            let task = {
                let mut receiver = receiver.lock().await;
                receiver.recv().await
            };
            let Some(task) = task else { break };
            self.process(task).await;
        }
        debug!(worker_id, "task worker stopped");
    }

    async fn process(&self, mut task: Task) {
        if task.retries >= self.max_task_retries {
            if let Err(e) = self.queue.ack_task(&task).await {
                error!(task_id = %task.id, error = ?e, "failed to ack task in queue");
            } else {
                error!(
                    task_id = %task.id,
                    task_name = %task.name,
                    retries = task.retries,
                    "task removed from queue due to too many failed executions"
                );
                self.metrics.tasks_dropped.incr();
            }
            return;
        }

        if let Err(e) = self.runner.execute(&mut task).await {
            error!(task_id = %task.id, task_name = %task.name, error = ?e, "error executing task");
            self.unack(&task).await;
            return;
        }
        debug!(task_id = %task.id, task_name = %task.name, "task execution completed successfully");

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
            self.unack(&task).await;
            return;
        }
        debug!(task_id = %task.id, "task results are stored in cache");

        // History is best-effort: a failed archive never blocks the ack.
        if let Err(e) = self.storage.save_task_history(&task).await {
            error!(task_id = %task.id, error = ?e, "error saving task history");
        } else {
            debug!(task_id = %task.id, "task history is saved");
        }

        if let Err(e) = self.queue.ack_task(&task).await {
            error!(task_id = %task.id, error = ?e, "failed to ack task in queue");
        }
        self.metrics.tasks_executed.incr();
    }

    async fn unack(&self, task: &Task) {
        if let Err(e) = self.queue.unack_task(task).await {
            error!(task_id = %task.id, error = ?e, "failed to unack task in queue");
        }
        self.metrics.tasks_retried.incr();
    }
}
