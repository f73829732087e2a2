//! Helpers for spawning lifecycle-managed background tasks.
//!
//! Every long-running component (executors, injector, servers) is spawned
//! through these helpers so that start/stop is logged consistently and an
//! unexpected task failure shuts the whole service down.

use std::future::Future;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

/// Spawn a background task wired to the application lifecycle.
///
/// The task builder receives a child view of the cancellation token. The
/// task runs until it completes or the token fires; a task that returns an
/// error cancels the token, taking the rest of the application down with
/// it.
pub fn spawn_cancellable_task<F, Fut>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    task_builder: F,
) where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting background task");

    let cancel_token = app_token.clone();

    tracker.spawn(async move {
        match task_builder(cancel_token).await {
            Ok(()) => {
                info!(task = task_name, "Background task completed");
            }
            Err(e) => {
                error!(task = task_name, error = ?e, "Background task failed unexpectedly");
                app_token.cancel();
            }
        }
    });
}
