//! Explicit task-name → handler table.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::handler::TaskHandler;

/// Route table built once at startup and shared by the dispatcher and the
/// HTTP surface.
#[derive(Clone, Default)]
pub struct TaskRouter {
    routes: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A later registration for the same name wins.
    pub fn route(mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.routes.insert(name.into(), handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.routes.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for TaskRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRouter")
            .field("routes", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{TaskFuture, TaskOutcome, TaskParams};

    struct Fixed(TaskOutcome);

    impl TaskHandler for Fixed {
        fn handle<'a>(&'a self, _params: &'a TaskParams) -> TaskFuture<'a> {
            let outcome = self.0.clone();
            Box::pin(async move { outcome })
        }
    }

    #[tokio::test]
    async fn resolves_registered_routes_only() {
        let router = TaskRouter::new()
            .route("reconcile", Arc::new(Fixed(TaskOutcome::Done)))
            .route("render-provision", Arc::new(Fixed(TaskOutcome::Pending)));

        assert_eq!(router.names(), vec!["reconcile", "render-provision"]);
        let handler = router.get("render-provision").unwrap();
        assert_eq!(handler.handle(&TaskParams::new()).await, TaskOutcome::Pending);
        assert!(router.get("unknown").is_none());
    }
}
