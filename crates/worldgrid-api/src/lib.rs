//! worldgrid-api: REST API for worldgrid.
//!
//! Provides axum route handlers for inspecting world records, issuing
//! instance operations, triggering the periodic jobs, and delivering
//! queued tasks over HTTP.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/worlds` | List world records |
//! | GET | `/api/v1/worlds/{world}` | Get one world record |
//! | POST | `/api/v1/worlds/{world}/instance` | Create the world instance |
//! | PUT | `/api/v1/worlds/{world}/instance` | Start or reset the instance |
//! | DELETE | `/api/v1/worlds/{world}/instance` | Delete the instance |
//! | GET | `/api/v1/tasks` | List queued tasks |
//! | GET | `/api/v1/dead-letters` | List dead-lettered tasks |
//! | POST | `/cron/sweep` | Run one sweep |
//! | POST | `/cron/render` | Run the render pipeline once |
//! | POST | `/tasks/{name}` | Deliver a task (form-encoded params) |

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use worldgrid_core::GridConfig;
use worldgrid_lifecycle::Lifecycle;
use worldgrid_provider::ComputeProvider;
use worldgrid_state::StateStore;
use worldgrid_tasks::{Dispatcher, RetryPolicy};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub lifecycle: Lifecycle,
    pub dispatcher: Dispatcher,
}

impl ApiState {
    /// Wire the lifecycle and a dispatcher over its task routes.
    pub fn new(
        store: StateStore,
        provider: Arc<dyn ComputeProvider>,
        config: Arc<GridConfig>,
    ) -> Self {
        let lifecycle = Lifecycle::new(store.clone(), provider, config.clone());
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(lifecycle.task_router()),
            RetryPolicy::from_config(&config.tasks),
            Duration::from_secs(config.tasks.lease_secs),
            config.tasks.batch_size,
        );
        Self {
            store,
            lifecycle,
            dispatcher,
        }
    }
}

/// Build the complete router (REST + cron triggers + task delivery).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/worlds", get(handlers::list_worlds))
        .route("/worlds/{world}", get(handlers::get_world))
        .route(
            "/worlds/{world}/instance",
            post(handlers::create_instance)
                .put(handlers::update_instance)
                .delete(handlers::delete_instance),
        )
        .route("/tasks", get(handlers::list_tasks))
        .route("/dead-letters", get(handlers::list_dead_letters))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/cron/sweep", post(handlers::cron_sweep))
        .route("/cron/render", post(handlers::cron_render))
        .route("/tasks/{name}", post(handlers::deliver_task))
        .with_state(state)
}
