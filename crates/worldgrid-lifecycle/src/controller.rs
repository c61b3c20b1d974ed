//! Lifecycle controller: issues provider calls and schedules their
//! reconciliation.
//!
//! The controller never changes a world's `status`. It records the issued
//! operation as `pending` and enqueues a `reconcile` task; the reconciler
//! commits the outcome once the provider reports it finished.
//!
//! A world with a snapshot is created in two steps: the world disk is
//! restored from `latest_snapshot`, and the `create-instance` task inserts
//! the instance with that disk attached once the restore finishes. While
//! any operation is pending, `create` is refused.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};
use worldgrid_core::{GridConfig, OperationHandle, WorldKey, idempotency_token};
use worldgrid_provider::{BootDisk, ComputeProvider, DiskSpec, InstanceSpec, Operation, ProviderError};
use worldgrid_state::{LastOperation, PendingOperation, StateError, StateStore, WorldRecord, WorldStatus};
use worldgrid_tasks::{TaskFuture, TaskHandler, TaskOutcome, TaskParams, TaskQueue};

use crate::error::{LifecycleError, LifecycleResult};
use crate::payload::{CREATE_INSTANCE_TASK, OperationPayload, RECONCILE_TASK};
use crate::epoch_secs;

/// An operation the controller issued and scheduled for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedOperation {
    pub instance_name: String,
    pub handle: OperationHandle,
    pub generation: u64,
}

/// Result of one `create-instance` delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restored {
    Pending,
    /// World disk ready; the instance insert was issued.
    InsertIssued(IssuedOperation),
    /// The restore finished with a provider error; nothing was booted.
    DiskFailed(String),
    /// The record has moved past this restore.
    Stale,
}

#[derive(Clone)]
pub struct LifecycleController {
    store: StateStore,
    provider: Arc<dyn ComputeProvider>,
    queue: TaskQueue,
    config: Arc<GridConfig>,
}

impl LifecycleController {
    pub fn new(
        store: StateStore,
        provider: Arc<dyn ComputeProvider>,
        queue: TaskQueue,
        config: Arc<GridConfig>,
    ) -> Self {
        Self {
            store,
            provider,
            queue,
            config,
        }
    }

    /// Insert the world's primary instance.
    ///
    /// `zone` defaults to the first configured zone; `ip` names a static
    /// external address and may be empty. When the world has a snapshot,
    /// the returned operation is the world disk restore.
    pub async fn create(
        &self,
        world: &str,
        zone: Option<&str>,
        ip: Option<&str>,
    ) -> LifecycleResult<IssuedOperation> {
        let key = WorldKey::new(world)?;
        let current = self
            .store
            .get_world(world)?
            .unwrap_or_else(|| WorldRecord::empty(world));
        if current.status == WorldStatus::Exists {
            return Err(LifecycleError::Conflict(format!(
                "world {world} already has an instance"
            )));
        }
        if let Some(pending) = &current.pending {
            return Err(LifecycleError::Conflict(format!(
                "world {world} has {} operation {} pending",
                pending.kind, pending.handle
            )));
        }

        let zone = zone
            .filter(|z| !z.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| zone_or_default(&current, &self.config));
        let ip = ip.filter(|ip| !ip.is_empty()).map(str::to_string);
        let generation = current.generation + 1;

        let mut spec = self.instance_spec(world, ip.clone());
        if !current.latest_snapshot.is_empty() {
            let disk = self.world_disk_spec(world, &current.latest_snapshot);
            match self.provider.insert_disk(&zone, &disk).await {
                Ok(op) => {
                    info!(%world, %zone, disk = %disk.name, snapshot = %disk.source_snapshot, handle = %op.handle, generation, "world disk restore issued");
                    self.record_pending(&key, &op, generation, |record| {
                        record.zone = zone.clone();
                        record.ip_address = ip.clone().unwrap_or_default();
                    })?;
                    let payload = OperationPayload::new(key, op.handle.clone())
                        .with_generation(generation)
                        .with_snapshot(disk.source_snapshot)
                        .with_zone(&zone);
                    self.queue.enqueue(
                        CREATE_INSTANCE_TASK,
                        payload.to_params(),
                        self.config.tasks.reconcile_delay(),
                    )?;
                    return Ok(IssuedOperation {
                        instance_name: spec.name,
                        handle: op.handle,
                        generation,
                    });
                }
                Err(ProviderError::Api { status: 409, .. }) => {
                    info!(%world, disk = %disk.name, "world disk already present; attaching it");
                    spec.attached_disks.push(disk.name);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let request_id = idempotency_token(&[world, "insert", &generation.to_string()]);

        let op = self
            .provider
            .insert_instance(&zone, &spec, &request_id)
            .await?;
        info!(%world, %zone, handle = %op.handle, generation, "instance insert issued");

        self.record_pending(&key, &op, generation, |record| {
            record.zone = zone.clone();
            record.ip_address = ip.clone().unwrap_or_default();
        })?;
        self.schedule_reconcile(&key, &op, generation, &zone)?;

        Ok(IssuedOperation {
            instance_name: spec.name,
            handle: op.handle,
            generation,
        })
    }

    /// Poll the world disk restore; once ready, insert the instance with the
    /// disk attached and schedule its reconciliation.
    pub async fn boot_restored(&self, payload: &OperationPayload) -> LifecycleResult<Restored> {
        let world = payload.world_id();
        let generation = payload
            .generation
            .ok_or_else(|| LifecycleError::Decode("missing generation".to_string()))?;
        let record = self
            .store
            .get_world(world)?
            .ok_or_else(|| LifecycleError::NotFound(world.to_string()))?;
        let owns_pending = record
            .pending
            .as_ref()
            .is_some_and(|pending| pending.handle == payload.handle);
        if generation < record.generation || !owns_pending {
            info!(%world, handle = %payload.handle, "stale create-instance task acknowledged");
            return Ok(Restored::Stale);
        }

        let zone = payload
            .zone
            .clone()
            .unwrap_or_else(|| zone_or_default(&record, &self.config));
        let op = self.provider.get_operation(&zone, &payload.handle).await?;
        if !op.is_done() {
            info!(%world, status = %op.status, "world disk not ready");
            return Ok(Restored::Pending);
        }

        if let Some(error) = &op.error {
            warn!(%world, handle = %op.handle, %error, "world disk restore failed");
            self.store
                .transactionally::<_, StateError>(world, |mut record| {
                    if record
                        .pending
                        .as_ref()
                        .is_some_and(|pending| pending.handle == op.handle)
                    {
                        record.pending = None;
                    }
                    record.last_operation = Some(LastOperation {
                        handle: op.handle.clone(),
                        kind: op.kind.clone(),
                        status: op.status,
                        error: Some(error.clone()),
                    });
                    Ok(record)
                })?;
            return Ok(Restored::DiskFailed(error.clone()));
        }

        let ip = Some(record.ip_address.clone()).filter(|ip| !ip.is_empty());
        let mut spec = self.instance_spec(world, ip);
        spec.attached_disks.push(self.config.naming.world_disk_name(world));
        let request_id = idempotency_token(&[world, "insert", &generation.to_string()]);
        let insert = self
            .provider
            .insert_instance(&zone, &spec, &request_id)
            .await?;
        info!(%world, %zone, handle = %insert.handle, generation, "instance insert issued over restored disk");

        self.record_pending(&payload.key, &insert, generation, |_| {})?;
        self.schedule_reconcile(&payload.key, &insert, generation, &zone)?;
        Ok(Restored::InsertIssued(IssuedOperation {
            instance_name: spec.name,
            handle: insert.handle,
            generation,
        }))
    }

    pub async fn start(&self, world: &str) -> LifecycleResult<IssuedOperation> {
        self.act(world, Action::Start).await
    }

    pub async fn reset(&self, world: &str) -> LifecycleResult<IssuedOperation> {
        self.act(world, Action::Reset).await
    }

    pub async fn delete(&self, world: &str) -> LifecycleResult<IssuedOperation> {
        self.act(world, Action::Delete).await
    }

    async fn act(&self, world: &str, action: Action) -> LifecycleResult<IssuedOperation> {
        let key = WorldKey::new(world)?;
        let current = self
            .store
            .get_world(world)?
            .ok_or_else(|| LifecycleError::NotFound(world.to_string()))?;
        let zone = zone_or_default(&current, &self.config);
        let name = self.config.naming.instance_name(world);
        let generation = current.generation + 1;

        let op = match action {
            Action::Start => self.provider.start_instance(&zone, &name).await?,
            Action::Reset => self.provider.reset_instance(&zone, &name).await?,
            Action::Delete => self.provider.delete_instance(&zone, &name).await?,
        };
        info!(%world, %zone, action = action.as_str(), handle = %op.handle, generation, "instance operation issued");

        self.record_pending(&key, &op, generation, |_| {})?;
        self.schedule_reconcile(&key, &op, generation, &zone)?;

        Ok(IssuedOperation {
            instance_name: name,
            handle: op.handle,
            generation,
        })
    }

    /// Build the primary instance spec from the configured template.
    pub fn instance_spec(&self, world: &str, nat_ip: Option<String>) -> InstanceSpec {
        let template = &self.config.instance;
        let mut metadata = BTreeMap::new();
        metadata.insert("startup-script-url".to_string(), template.startup_script_url.clone());
        metadata.insert("shutdown-script-url".to_string(), template.shutdown_script_url.clone());
        metadata.insert("world".to_string(), world.to_string());
        metadata.insert("state".to_string(), "new".to_string());

        InstanceSpec {
            name: self.config.naming.instance_name(world),
            machine_type: template.machine_type.clone(),
            boot_disk: BootDisk {
                source_image: template.source_image.clone(),
                disk_type: template.disk_type.clone(),
                size_gb: template.disk_size_gb,
            },
            attached_disks: Vec::new(),
            nat_ip,
            tags: template.tags.clone(),
            metadata,
            preemptible: template.preemptible,
        }
    }

    /// The world data disk restored from `snapshot`.
    pub fn world_disk_spec(&self, world: &str, snapshot: &str) -> DiskSpec {
        DiskSpec {
            name: self.config.naming.world_disk_name(world),
            source_snapshot: snapshot.to_string(),
            disk_type: self.config.instance.disk_type.clone(),
            size_gb: self.config.instance.world_disk_size_gb,
        }
    }

    fn record_pending(
        &self,
        key: &WorldKey,
        op: &Operation,
        generation: u64,
        update: impl FnOnce(&mut WorldRecord),
    ) -> LifecycleResult<WorldRecord> {
        let record = self
            .store
            .transactionally::<_, StateError>(key.world_id(), |mut record| {
                update(&mut record);
                record.generation = record.generation.max(generation);
                record.pending = Some(PendingOperation {
                    handle: op.handle.clone(),
                    kind: op.kind.clone(),
                    generation,
                    issued_at: epoch_secs(),
                });
                record.last_operation = Some(LastOperation {
                    handle: op.handle.clone(),
                    kind: op.kind.clone(),
                    status: op.status,
                    error: None,
                });
                Ok(record)
            })?;
        Ok(record)
    }

    fn schedule_reconcile(
        &self,
        key: &WorldKey,
        op: &Operation,
        generation: u64,
        zone: &str,
    ) -> LifecycleResult<()> {
        let payload = OperationPayload::new(key.clone(), op.handle.clone())
            .with_generation(generation)
            .with_zone(zone);
        self.queue.enqueue(
            RECONCILE_TASK,
            payload.to_params(),
            self.config.tasks.reconcile_delay(),
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Start,
    Reset,
    Delete,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Reset => "reset",
            Action::Delete => "delete",
        }
    }
}

impl TaskHandler for LifecycleController {
    fn handle<'a>(&'a self, params: &'a TaskParams) -> TaskFuture<'a> {
        Box::pin(async move {
            let payload = match OperationPayload::from_params(params) {
                Ok(payload) => payload,
                Err(e) => return e.into_outcome(),
            };
            match self.boot_restored(&payload).await {
                Ok(Restored::Pending) => TaskOutcome::Pending,
                Ok(_) => TaskOutcome::Done,
                Err(e) => {
                    warn!(world = payload.world_id(), error = %e, "create-instance failed");
                    e.into_outcome()
                }
            }
        })
    }

    fn dead_lettered(&self, params: &TaskParams, reason: &str) {
        release_pending(&self.store, params, reason);
    }
}

/// Forget `pending` if it still names the abandoned task's operation, so
/// the world accepts new operations again.
pub(crate) fn release_pending(store: &StateStore, params: &TaskParams, reason: &str) {
    let Ok(payload) = OperationPayload::from_params(params) else {
        return;
    };
    let world = payload.world_id();
    if store.get_world(world).ok().flatten().is_none() {
        return;
    }
    let result = store.transactionally::<_, StateError>(world, |mut record| {
        if record
            .pending
            .as_ref()
            .is_some_and(|pending| pending.handle == payload.handle)
        {
            record.pending = None;
        }
        Ok(record)
    });
    match result {
        Ok(_) => warn!(%world, handle = %payload.handle, %reason, "pending operation abandoned"),
        Err(e) => warn!(%world, error = %e, "failed to release pending operation"),
    }
}

pub(crate) fn zone_or_default(record: &WorldRecord, config: &GridConfig) -> String {
    if record.zone.is_empty() {
        config.default_zone().to_string()
    } else {
        record.zone.clone()
    }
}
