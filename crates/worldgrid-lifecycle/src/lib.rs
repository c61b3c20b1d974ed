//! worldgrid-lifecycle: orchestration of world instances on an
//! asynchronous compute provider.
//!
//! Provider calls return an operation handle immediately. The
//! [`LifecycleController`] issues them and schedules a `reconcile` task; the
//! [`Reconciler`] commits the outcome once the provider reports it done.
//! Worlds with a snapshot are restored through a `create-instance` task
//! before their instance is inserted. The
//! [`SweepScheduler`] snapshots and deletes terminated instances through the
//! [`SnapshotChain`], and the [`RenderPipeline`] provisions render instances
//! from the latest snapshots.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod chain;
pub mod controller;
pub mod error;
pub mod payload;
pub mod reconciler;
pub mod render;
pub mod sweep;

pub use chain::{SnapshotChain, SnapshotFollowUp, SnapshotStart};
pub use controller::{IssuedOperation, LifecycleController, Restored};
pub use error::{LifecycleError, LifecycleResult};
pub use payload::{
    CREATE_INSTANCE_TASK, DELETE_AFTER_SNAPSHOT_TASK, OperationPayload, RECONCILE_TASK,
    RENDER_PROVISION_TASK,
};
pub use reconciler::{Reconciled, Reconciler};
pub use render::{Provisioned, RenderPipeline, RenderReport};
pub use sweep::{SweepReport, SweepScheduler, UnitAction, UnitOutcome, UnitReport};

use worldgrid_core::GridConfig;
use worldgrid_provider::ComputeProvider;
use worldgrid_state::StateStore;
use worldgrid_tasks::{TaskQueue, TaskRouter};

/// Every lifecycle component, wired against one store and provider.
#[derive(Clone)]
pub struct Lifecycle {
    pub controller: LifecycleController,
    pub reconciler: Arc<Reconciler>,
    pub chain: Arc<SnapshotChain>,
    pub sweep: SweepScheduler,
    pub render: Arc<RenderPipeline>,
}

impl Lifecycle {
    pub fn new(
        store: StateStore,
        provider: Arc<dyn ComputeProvider>,
        config: Arc<GridConfig>,
    ) -> Self {
        let queue = TaskQueue::new(store.clone());
        let controller = LifecycleController::new(
            store.clone(),
            provider.clone(),
            queue.clone(),
            config.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            provider.clone(),
            config.clone(),
        ));
        let chain = Arc::new(SnapshotChain::new(
            store.clone(),
            provider.clone(),
            queue.clone(),
            controller.clone(),
            config.clone(),
        ));
        let sweep = SweepScheduler::new(provider.clone(), chain.clone(), config.clone());
        let render = Arc::new(RenderPipeline::new(store, provider, queue, config));
        Self {
            controller,
            reconciler,
            chain,
            sweep,
            render,
        }
    }

    pub fn task_router(&self) -> TaskRouter {
        task_routes(
            Arc::new(self.controller.clone()),
            self.reconciler.clone(),
            self.chain.clone(),
            self.render.clone(),
        )
    }
}

/// The route table for every lifecycle task.
pub fn task_routes(
    controller: Arc<LifecycleController>,
    reconciler: Arc<Reconciler>,
    chain: Arc<SnapshotChain>,
    render: Arc<RenderPipeline>,
) -> TaskRouter {
    TaskRouter::new()
        .route(RECONCILE_TASK, reconciler)
        .route(CREATE_INSTANCE_TASK, controller)
        .route(DELETE_AFTER_SNAPSHOT_TASK, chain)
        .route(RENDER_PROVISION_TASK, render)
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
