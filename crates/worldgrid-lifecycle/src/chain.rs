//! Snapshot-then-delete chain.
//!
//! The sweep starts a snapshot of a terminated world's data disk and
//! enqueues `delete-after-snapshot`. Once the snapshot operation finishes
//! the handler commits `latest_snapshot` and asks the controller to delete
//! the instance; the controller's own `reconcile` task later marks the
//! world `not_exists`.
//!
//! At most one snapshot per world is in flight: `start` claims
//! `snapshot_in_flight` before calling the provider and the follow-up
//! releases it. `latest_snapshot` only ever moves forward in time.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use worldgrid_core::{GridConfig, OperationHandle, WorldKey};
use worldgrid_provider::{ComputeProvider, ProviderError};
use worldgrid_state::{LastOperation, StateError, StateStore};
use worldgrid_tasks::{TaskFuture, TaskHandler, TaskOutcome, TaskParams, TaskQueue};

use crate::controller::{LifecycleController, zone_or_default};
use crate::error::{LifecycleError, LifecycleResult};
use crate::payload::{DELETE_AFTER_SNAPSHOT_TASK, OperationPayload};

/// Result of starting a snapshot for one world.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotStart {
    Issued {
        snapshot: String,
        handle: OperationHandle,
    },
    /// No record exists for the world; nothing to protect.
    Skipped,
    /// A snapshot or a delete is already in flight for the world.
    Busy(String),
}

/// Result of one `delete-after-snapshot` delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotFollowUp {
    Pending,
    /// Snapshot committed and a delete was issued.
    DeleteIssued(OperationHandle),
    /// Snapshot committed; a delete for it was already pending or the
    /// instance is already gone.
    AlreadyDeleting,
    /// The snapshot operation finished with an error; the instance is kept.
    SnapshotFailed(String),
    /// A newer snapshot was already committed; this one is left alone and
    /// the newer chain owns the delete.
    Superseded,
}

#[derive(Clone)]
pub struct SnapshotChain {
    store: StateStore,
    provider: Arc<dyn ComputeProvider>,
    queue: TaskQueue,
    controller: LifecycleController,
    config: Arc<GridConfig>,
}

impl SnapshotChain {
    pub fn new(
        store: StateStore,
        provider: Arc<dyn ComputeProvider>,
        queue: TaskQueue,
        controller: LifecycleController,
        config: Arc<GridConfig>,
    ) -> Self {
        Self {
            store,
            provider,
            queue,
            controller,
            config,
        }
    }

    /// Snapshot the world's data disk and schedule the follow-up delete.
    pub async fn start(&self, world: &str, zone: &str) -> LifecycleResult<SnapshotStart> {
        let key = WorldKey::new(world)?;
        if self.store.get_world(world)?.is_none() {
            info!(%world, "no record for terminated instance; skipping snapshot");
            return Ok(SnapshotStart::Skipped);
        }

        let naming = &self.config.naming;
        let snapshot = naming.snapshot_name(world, Utc::now());
        let disk = naming.world_disk_name(world);

        let claimed = self
            .store
            .transactionally::<_, LifecycleError>(world, |mut record| {
                if record.pending.as_ref().is_some_and(|p| p.kind.is_delete()) {
                    return Err(LifecycleError::Conflict("delete pending".to_string()));
                }
                if !record.snapshot_in_flight.is_empty() {
                    return Err(LifecycleError::Conflict(format!(
                        "snapshot {} in flight",
                        record.snapshot_in_flight
                    )));
                }
                record.snapshot_in_flight = snapshot.clone();
                Ok(record)
            });
        match claimed {
            Ok(_) => {}
            Err(LifecycleError::Conflict(reason)) => {
                info!(%world, %reason, "snapshot not started");
                return Ok(SnapshotStart::Busy(reason));
            }
            Err(e) => return Err(e),
        }

        let op = match self.provider.create_snapshot(zone, &disk, &snapshot).await {
            Ok(op) => op,
            Err(e) => {
                self.release(world, &snapshot)?;
                return Err(e.into());
            }
        };
        info!(%world, %zone, %disk, %snapshot, handle = %op.handle, "snapshot issued");

        let payload = OperationPayload::new(key, op.handle.clone())
            .with_snapshot(snapshot.clone())
            .with_zone(zone);
        self.queue.enqueue(
            DELETE_AFTER_SNAPSHOT_TASK,
            payload.to_params(),
            self.config.tasks.reconcile_delay(),
        )?;

        Ok(SnapshotStart::Issued {
            snapshot,
            handle: op.handle,
        })
    }

    /// Poll the snapshot; once done, commit it and delete the instance.
    pub async fn delete_after_snapshot(
        &self,
        payload: &OperationPayload,
    ) -> LifecycleResult<SnapshotFollowUp> {
        let world = payload.world_id();
        let snapshot = payload.require_snapshot()?;
        let record = self
            .store
            .get_world(world)?
            .ok_or_else(|| LifecycleError::NotFound(world.to_string()))?;
        let zone = payload
            .zone
            .clone()
            .unwrap_or_else(|| zone_or_default(&record, &self.config));

        let op = self.provider.get_operation(&zone, &payload.handle).await?;
        if !op.is_done() {
            info!(%world, %snapshot, status = %op.status, "snapshot not done yet");
            return Ok(SnapshotFollowUp::Pending);
        }

        if let Some(error) = &op.error {
            warn!(%world, %snapshot, %error, "snapshot failed; keeping instance");
            self.store
                .transactionally::<_, StateError>(world, |mut record| {
                    if record.snapshot_in_flight == snapshot {
                        record.snapshot_in_flight.clear();
                    }
                    record.last_operation = Some(LastOperation {
                        handle: op.handle.clone(),
                        kind: op.kind.clone(),
                        status: op.status,
                        error: Some(error.clone()),
                    });
                    Ok(record)
                })?;
            return Ok(SnapshotFollowUp::SnapshotFailed(error.clone()));
        }

        let naming = &self.config.naming;
        let mut current = true;
        let mut delete_pending = false;
        self.store
            .transactionally::<_, StateError>(world, |mut record| {
                if record.snapshot_in_flight == snapshot {
                    record.snapshot_in_flight.clear();
                }
                current = naming.supersedes_snapshot(world, snapshot, &record.latest_snapshot);
                if current {
                    record.latest_snapshot = snapshot.to_string();
                }
                delete_pending = record
                    .pending
                    .as_ref()
                    .is_some_and(|pending| pending.kind.is_delete());
                Ok(record)
            })?;

        if !current {
            warn!(%world, %snapshot, "a newer snapshot is already committed");
            return Ok(SnapshotFollowUp::Superseded);
        }
        info!(%world, %snapshot, "latest snapshot committed");

        if delete_pending {
            info!(%world, "delete already pending");
            return Ok(SnapshotFollowUp::AlreadyDeleting);
        }

        match self.controller.delete(world).await {
            Ok(issued) => Ok(SnapshotFollowUp::DeleteIssued(issued.handle)),
            Err(LifecycleError::Provider(ProviderError::NotFound(what))) => {
                info!(%world, %what, "instance already gone");
                Ok(SnapshotFollowUp::AlreadyDeleting)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the in-flight marker if it still names `snapshot`.
    fn release(&self, world: &str, snapshot: &str) -> LifecycleResult<()> {
        self.store
            .transactionally::<_, StateError>(world, |mut record| {
                if record.snapshot_in_flight == snapshot {
                    record.snapshot_in_flight.clear();
                }
                Ok(record)
            })?;
        Ok(())
    }
}

impl TaskHandler for SnapshotChain {
    fn handle<'a>(&'a self, params: &'a TaskParams) -> TaskFuture<'a> {
        Box::pin(async move {
            let payload = match OperationPayload::from_params(params) {
                Ok(payload) => payload,
                Err(e) => return e.into_outcome(),
            };
            match self.delete_after_snapshot(&payload).await {
                Ok(SnapshotFollowUp::Pending) => TaskOutcome::Pending,
                Ok(_) => TaskOutcome::Done,
                Err(e) => {
                    warn!(world = payload.world_id(), error = %e, "delete-after-snapshot failed");
                    e.into_outcome()
                }
            }
        })
    }

    fn dead_lettered(&self, params: &TaskParams, reason: &str) {
        let Ok(payload) = OperationPayload::from_params(params) else {
            return;
        };
        let Some(snapshot) = payload.snapshot.as_deref() else {
            return;
        };
        let world = payload.world_id();
        if self.store.get_world(world).ok().flatten().is_none() {
            return;
        }
        match self.release(world, snapshot) {
            Ok(()) => warn!(%world, %snapshot, %reason, "snapshot follow-up abandoned"),
            Err(e) => warn!(%world, %snapshot, error = %e, "failed to release snapshot marker"),
        }
    }
}
