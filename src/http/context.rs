use crate::config::Config;
use crate::http::middleware_auth::JwksVerifier;
use crate::metrics::Metrics;
use crate::service::{TaskListService, TaskService};
use std::ops::Deref;
use std::sync::Arc;

pub struct InnerAppContext {
    pub(crate) config: Config,
    pub(crate) task_service: TaskService,
    pub(crate) task_list_service: TaskListService,
    pub(crate) verifier: Option<Arc<JwksVerifier>>,
    pub(crate) metrics: Arc<Metrics>,
}

/// Shared state handed to every handler. Cheap to clone; the inner context
/// is reference-counted.
#[derive(Clone)]
pub struct AppContext(pub(crate) Arc<InnerAppContext>);

impl Deref for AppContext {
    type Target = InnerAppContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AppContext {
    pub fn new(
        config: Config,
        task_service: TaskService,
        task_list_service: TaskListService,
        verifier: Option<Arc<JwksVerifier>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self(Arc::new(InnerAppContext {
            config,
            task_service,
            task_list_service,
            verifier,
            metrics,
        }))
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.0.metrics
    }
}
