//! Operation reconciler.
//!
//! Each delivery of a `reconcile` task polls the provider once:
//!
//! - operation finished: commit the world's status and resource id, clear
//!   `pending`, acknowledge;
//! - still running: stamp `last_operation` and report pending so the
//!   dispatcher redelivers later.
//!
//! A task issued under an older generation than the record's never
//! overwrites business fields; its completion is acknowledged and dropped.

use std::sync::Arc;

use tracing::{info, warn};
use worldgrid_core::GridConfig;
use worldgrid_provider::{ComputeProvider, Operation};
use worldgrid_state::{LastOperation, StateError, StateStore, WorldRecord, WorldStatus};
use worldgrid_tasks::{TaskFuture, TaskHandler, TaskOutcome, TaskParams};

use crate::controller::{release_pending, zone_or_default};
use crate::error::{LifecycleError, LifecycleResult};
use crate::payload::OperationPayload;

/// Result of one reconcile delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The finished operation was committed to the record.
    Committed(WorldStatus),
    /// The operation finished with a provider error; recorded, status kept.
    FailedOperation(String),
    /// A newer operation superseded this one.
    Stale,
    /// Not finished yet.
    Pending,
}

impl Reconciled {
    pub fn outcome(&self) -> TaskOutcome {
        match self {
            Reconciled::Pending => TaskOutcome::Pending,
            _ => TaskOutcome::Done,
        }
    }
}

/// Transaction-local abort reasons.
enum Abort {
    Stale,
    State(StateError),
}

impl From<StateError> for Abort {
    fn from(e: StateError) -> Self {
        Abort::State(e)
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: StateStore,
    provider: Arc<dyn ComputeProvider>,
    config: Arc<GridConfig>,
}

impl Reconciler {
    pub fn new(store: StateStore, provider: Arc<dyn ComputeProvider>, config: Arc<GridConfig>) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    pub async fn reconcile(&self, payload: &OperationPayload) -> LifecycleResult<Reconciled> {
        let world = payload.world_id();
        let record = self
            .store
            .get_world(world)?
            .ok_or_else(|| LifecycleError::NotFound(world.to_string()))?;
        if is_stale(&record, payload) {
            info!(%world, handle = %payload.handle, "stale reconcile task acknowledged");
            return Ok(Reconciled::Stale);
        }

        let zone = payload
            .zone
            .clone()
            .unwrap_or_else(|| zone_or_default(&record, &self.config));
        let op = self.provider.get_operation(&zone, &payload.handle).await?;

        let result = self.store.transactionally(world, |mut record| {
            if is_stale(&record, payload) {
                return Err(Abort::Stale);
            }
            apply_operation(&mut record, &op);
            Ok(record)
        });

        match result {
            Ok(_) if !op.is_done() => {
                info!(%world, handle = %op.handle, status = %op.status, "operation not done yet");
                Ok(Reconciled::Pending)
            }
            Ok(record) => match &op.error {
                Some(error) => {
                    warn!(%world, handle = %op.handle, kind = %op.kind, %error, "operation finished with error");
                    Ok(Reconciled::FailedOperation(error.clone()))
                }
                None => {
                    info!(
                        %world,
                        handle = %op.handle,
                        kind = %op.kind,
                        status = ?record.status,
                        resource_id = record.external_resource_id,
                        "operation committed"
                    );
                    Ok(Reconciled::Committed(record.status))
                }
            },
            Err(Abort::Stale) => {
                info!(%world, handle = %payload.handle, "operation superseded while polling");
                Ok(Reconciled::Stale)
            }
            Err(Abort::State(e)) => Err(e.into()),
        }
    }
}

fn is_stale(record: &WorldRecord, payload: &OperationPayload) -> bool {
    payload
        .generation
        .is_some_and(|generation| generation < record.generation)
}

/// Fold a polled operation into the record.
fn apply_operation(record: &mut WorldRecord, op: &Operation) {
    record.last_operation = Some(LastOperation {
        handle: op.handle.clone(),
        kind: op.kind.clone(),
        status: op.status,
        error: op.error.clone(),
    });
    if !op.is_done() {
        return;
    }
    if record
        .pending
        .as_ref()
        .is_some_and(|pending| pending.handle == op.handle)
    {
        record.pending = None;
    }
    if op.error.is_some() {
        return;
    }
    if op.kind.is_delete() {
        record.status = WorldStatus::NotExists;
        record.external_resource_id = 0;
    } else {
        record.status = WorldStatus::Exists;
        record.external_resource_id = op.target_id;
    }
}

impl TaskHandler for Reconciler {
    fn handle<'a>(&'a self, params: &'a TaskParams) -> TaskFuture<'a> {
        Box::pin(async move {
            let payload = match OperationPayload::from_params(params) {
                Ok(payload) => payload,
                Err(e) => return e.into_outcome(),
            };
            match self.reconcile(&payload).await {
                Ok(reconciled) => reconciled.outcome(),
                Err(e) => {
                    warn!(world = payload.world_id(), error = %e, "reconcile failed");
                    e.into_outcome()
                }
            }
        })
    }

    fn dead_lettered(&self, params: &TaskParams, reason: &str) {
        release_pending(&self.store, params, reason);
    }
}
