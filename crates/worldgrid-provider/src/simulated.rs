//! In-memory compute provider.
//!
//! Operations start out `PENDING` and report `DONE` after a configurable
//! number of polls; their side effects (instance created, deleted, disk
//! cloned...) are applied at that moment. Used by tests and by `worldd`
//! when no real endpoint is configured.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;
use worldgrid_core::{OperationHandle, OperationKind, OperationStatus};

use crate::error::{ProviderError, ProviderResult};
use crate::types::*;
use crate::{ComputeProvider, ProviderFuture};

/// A call received by the simulated provider, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    ListInstances { zone: String },
    InsertInstance { zone: String, name: String, request_id: String },
    StartInstance { zone: String, name: String },
    ResetInstance { zone: String, name: String },
    DeleteInstance { zone: String, name: String },
    CreateSnapshot { zone: String, disk: String, snapshot: String },
    InsertDisk { zone: String, name: String, source_snapshot: String },
    GetOperation { zone: String, handle: String },
}

impl ProviderCall {
    fn method(&self) -> &'static str {
        match self {
            ProviderCall::ListInstances { .. } => "list_instances",
            ProviderCall::InsertInstance { .. } => "insert_instance",
            ProviderCall::StartInstance { .. } => "start_instance",
            ProviderCall::ResetInstance { .. } => "reset_instance",
            ProviderCall::DeleteInstance { .. } => "delete_instance",
            ProviderCall::CreateSnapshot { .. } => "create_snapshot",
            ProviderCall::InsertDisk { .. } => "insert_disk",
            ProviderCall::GetOperation { .. } => "get_operation",
        }
    }
}

/// Side effect applied when an operation completes.
#[derive(Debug, Clone)]
enum Effect {
    Insert { zone: String, spec: InstanceSpec },
    SetStatus { zone: String, name: String, status: InstanceStatus },
    Remove { zone: String, name: String },
    Snapshot { name: String },
    Disk { zone: String, spec: DiskSpec },
}

#[derive(Debug)]
struct SimOperation {
    operation: Operation,
    polls_remaining: u32,
    effect: Option<Effect>,
}

#[derive(Debug, Default)]
struct SimState {
    instances: BTreeMap<(String, String), Instance>,
    disks: BTreeMap<(String, String), DiskSpec>,
    /// Disks attached to each instance; deleted along with it.
    attachments: BTreeMap<(String, String), Vec<String>>,
    snapshots: BTreeSet<String>,
    operations: HashMap<String, SimOperation>,
    request_ids: HashMap<String, OperationHandle>,
    /// Injected failures keyed by method name, consumed one per call.
    failures: HashMap<&'static str, Vec<String>>,
    calls: Vec<ProviderCall>,
    polls_to_complete: u32,
    next_operation: u64,
    next_resource_id: i64,
}

/// Simulated provider. Clones share the same fleet.
#[derive(Debug, Clone)]
pub struct SimulatedProvider {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SimulatedProvider {
    /// Create an empty fleet whose operations finish after `polls_to_complete`
    /// calls to `get_operation`.
    pub fn new(polls_to_complete: u32) -> Self {
        let state = SimState {
            polls_to_complete,
            next_resource_id: 1000,
            ..SimState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Place an instance directly into the fleet. Returns its id.
    pub fn add_instance(&self, zone: &str, name: &str, status: InstanceStatus) -> i64 {
        let mut state = self.lock();
        let id = state.allocate_resource_id();
        state.instances.insert(
            (zone.to_string(), name.to_string()),
            Instance {
                id,
                name: name.to_string(),
                zone: zone.to_string(),
                status,
                nat_ip: None,
            },
        );
        id
    }

    pub fn set_instance_status(&self, zone: &str, name: &str, status: InstanceStatus) {
        let mut state = self.lock();
        if let Some(instance) = state
            .instances
            .get_mut(&(zone.to_string(), name.to_string()))
        {
            instance.status = status;
        }
    }

    pub fn instance(&self, zone: &str, name: &str) -> Option<Instance> {
        self.lock()
            .instances
            .get(&(zone.to_string(), name.to_string()))
            .cloned()
    }

    pub fn disk(&self, zone: &str, name: &str) -> Option<DiskSpec> {
        self.lock()
            .disks
            .get(&(zone.to_string(), name.to_string()))
            .cloned()
    }

    /// Non-boot disks attached to an instance.
    pub fn attached_disks(&self, zone: &str, name: &str) -> Vec<String> {
        self.lock()
            .attachments
            .get(&(zone.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshots(&self) -> Vec<String> {
        self.lock().snapshots.iter().cloned().collect()
    }

    /// Id handed to the next inserted instance.
    pub fn set_next_resource_id(&self, id: i64) {
        self.lock().next_resource_id = id;
    }

    pub fn set_polls_to_complete(&self, polls: u32) {
        self.lock().polls_to_complete = polls;
    }

    /// Make the next call to `method` (e.g. `"create_snapshot"`) fail.
    pub fn fail_next(&self, method: &'static str, message: impl Into<String>) {
        self.lock()
            .failures
            .entry(method)
            .or_default()
            .push(message.into());
    }

    /// Finish an operation now, optionally with a provider-side error.
    pub fn complete_operation(&self, handle: &OperationHandle, error: Option<String>) {
        let mut state = self.lock();
        state.finish(handle.as_str(), error);
    }

    /// Finish every outstanding operation successfully.
    pub fn complete_all(&self) {
        let mut state = self.lock();
        let mut open: Vec<(u64, String)> = state
            .operations
            .iter()
            .filter(|(_, op)| !op.operation.status.is_done())
            .map(|(handle, _)| (operation_number(handle), handle.clone()))
            .collect();
        open.sort();
        for (_, handle) in open {
            state.finish(&handle, None);
        }
    }

    /// Current view of an operation without counting as a poll.
    pub fn operation(&self, handle: &OperationHandle) -> Option<Operation> {
        self.lock()
            .operations
            .get(handle.as_str())
            .map(|op| op.operation.clone())
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Number of calls to a given method.
    pub fn call_count(&self, method: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.method() == method)
            .count()
    }

    fn submit(
        &self,
        call: ProviderCall,
        kind: OperationKind,
        target_id: i64,
        effect: Effect,
    ) -> ProviderResult<Operation> {
        let mut state = self.lock();
        state.record(call)?;
        Ok(state.issue(kind, target_id, Some(effect)))
    }
}

/// Issue order of a handle minted by [`SimState::issue`].
fn operation_number(handle: &str) -> u64 {
    handle
        .strip_prefix("operation-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

impl SimState {
    fn allocate_resource_id(&mut self) -> i64 {
        let id = self.next_resource_id;
        self.next_resource_id += 1;
        id
    }

    /// Log a call and consume any failure injected for it.
    fn record(&mut self, call: ProviderCall) -> ProviderResult<()> {
        let method = call.method();
        self.calls.push(call);
        if let Some(queue) = self.failures.get_mut(method)
            && !queue.is_empty()
        {
            let message = queue.remove(0);
            debug!(method, %message, "simulated provider failure");
            return Err(ProviderError::Api {
                status: 503,
                message,
            });
        }
        Ok(())
    }

    fn issue(&mut self, kind: OperationKind, target_id: i64, effect: Option<Effect>) -> Operation {
        self.next_operation += 1;
        let handle = OperationHandle::new(format!("operation-{}", self.next_operation));
        let operation = Operation {
            handle: handle.clone(),
            kind,
            status: OperationStatus::Pending,
            target_id,
            error: None,
        };
        self.operations.insert(
            handle.as_str().to_string(),
            SimOperation {
                operation: operation.clone(),
                polls_remaining: self.polls_to_complete,
                effect,
            },
        );
        debug!(handle = %handle, kind = %operation.kind, "simulated operation issued");
        operation
    }

    fn finish(&mut self, handle: &str, error: Option<String>) {
        let Some(op) = self.operations.get_mut(handle) else {
            return;
        };
        if op.operation.status.is_done() {
            return;
        }
        op.operation.status = OperationStatus::Done;
        op.polls_remaining = 0;
        let effect = if error.is_none() { op.effect.take() } else { None };
        op.operation.error = error;
        let target_id = op.operation.target_id;
        if let Some(effect) = effect {
            self.apply(effect, target_id);
        }
    }

    fn apply(&mut self, effect: Effect, target_id: i64) {
        match effect {
            Effect::Insert { zone, spec } => {
                let instance = Instance {
                    id: target_id,
                    name: spec.name.clone(),
                    zone: zone.clone(),
                    status: InstanceStatus::Running,
                    nat_ip: spec.nat_ip.clone(),
                };
                let key = (zone, spec.name);
                self.attachments.insert(key.clone(), spec.attached_disks);
                self.instances.insert(key, instance);
            }
            Effect::SetStatus { zone, name, status } => {
                if let Some(instance) = self.instances.get_mut(&(zone, name)) {
                    instance.status = status;
                }
            }
            Effect::Remove { zone, name } => {
                let key = (zone, name);
                self.instances.remove(&key);
                for disk in self.attachments.remove(&key).unwrap_or_default() {
                    self.disks.remove(&(key.0.clone(), disk));
                }
            }
            Effect::Snapshot { name } => {
                self.snapshots.insert(name);
            }
            Effect::Disk { zone, spec } => {
                self.disks.insert((zone, spec.name.clone()), spec);
            }
        }
    }

    fn instance_id(&self, zone: &str, name: &str) -> ProviderResult<i64> {
        self.instances
            .get(&(zone.to_string(), name.to_string()))
            .map(|instance| instance.id)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {zone}/{name}")))
    }
}

impl ComputeProvider for SimulatedProvider {
    fn list_instances<'a>(&'a self, zone: &'a str) -> ProviderFuture<'a, Vec<Instance>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.record(ProviderCall::ListInstances {
                zone: zone.to_string(),
            })?;
            Ok(state
                .instances
                .values()
                .filter(|instance| instance.zone == zone)
                .cloned()
                .collect())
        })
    }

    fn insert_instance<'a>(
        &'a self,
        zone: &'a str,
        spec: &'a InstanceSpec,
        request_id: &'a str,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.lock();
            state.record(ProviderCall::InsertInstance {
                zone: zone.to_string(),
                name: spec.name.clone(),
                request_id: request_id.to_string(),
            })?;

            if let Some(handle) = state.request_ids.get(request_id)
                && let Some(existing) = state.operations.get(handle.as_str())
            {
                debug!(%request_id, handle = %handle, "replayed insert request");
                return Ok(existing.operation.clone());
            }
            if state
                .instances
                .contains_key(&(zone.to_string(), spec.name.clone()))
            {
                return Err(ProviderError::Api {
                    status: 409,
                    message: format!("instance {} already exists", spec.name),
                });
            }

            let target_id = state.allocate_resource_id();
            let effect = Effect::Insert {
                zone: zone.to_string(),
                spec: spec.clone(),
            };
            let operation = state.issue(OperationKind::Insert, target_id, Some(effect));
            state
                .request_ids
                .insert(request_id.to_string(), operation.handle.clone());
            Ok(operation)
        })
    }

    fn start_instance<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let target_id = self.lock().instance_id(zone, name)?;
            self.submit(
                ProviderCall::StartInstance {
                    zone: zone.to_string(),
                    name: name.to_string(),
                },
                OperationKind::Start,
                target_id,
                Effect::SetStatus {
                    zone: zone.to_string(),
                    name: name.to_string(),
                    status: InstanceStatus::Running,
                },
            )
        })
    }

    fn reset_instance<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let target_id = self.lock().instance_id(zone, name)?;
            self.submit(
                ProviderCall::ResetInstance {
                    zone: zone.to_string(),
                    name: name.to_string(),
                },
                OperationKind::Reset,
                target_id,
                Effect::SetStatus {
                    zone: zone.to_string(),
                    name: name.to_string(),
                    status: InstanceStatus::Running,
                },
            )
        })
    }

    fn delete_instance<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let target_id = self.lock().instance_id(zone, name)?;
            self.submit(
                ProviderCall::DeleteInstance {
                    zone: zone.to_string(),
                    name: name.to_string(),
                },
                OperationKind::Delete,
                target_id,
                Effect::Remove {
                    zone: zone.to_string(),
                    name: name.to_string(),
                },
            )
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        zone: &'a str,
        disk: &'a str,
        snapshot: &'a str,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            self.submit(
                ProviderCall::CreateSnapshot {
                    zone: zone.to_string(),
                    disk: disk.to_string(),
                    snapshot: snapshot.to_string(),
                },
                OperationKind::CreateSnapshot,
                0,
                Effect::Snapshot {
                    name: snapshot.to_string(),
                },
            )
        })
    }

    fn insert_disk<'a>(
        &'a self,
        zone: &'a str,
        spec: &'a DiskSpec,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.lock();
            state.record(ProviderCall::InsertDisk {
                zone: zone.to_string(),
                name: spec.name.clone(),
                source_snapshot: spec.source_snapshot.clone(),
            })?;
            if state
                .disks
                .contains_key(&(zone.to_string(), spec.name.clone()))
            {
                return Err(ProviderError::Api {
                    status: 409,
                    message: format!("disk {} already exists", spec.name),
                });
            }
            let target_id = state.allocate_resource_id();
            let effect = Effect::Disk {
                zone: zone.to_string(),
                spec: spec.clone(),
            };
            Ok(state.issue(OperationKind::Insert, target_id, Some(effect)))
        })
    }

    fn get_operation<'a>(
        &'a self,
        zone: &'a str,
        handle: &'a OperationHandle,
    ) -> ProviderFuture<'a, Operation> {
        Box::pin(async move {
            let mut state = self.lock();
            state.record(ProviderCall::GetOperation {
                zone: zone.to_string(),
                handle: handle.as_str().to_string(),
            })?;

            let Some(op) = state.operations.get_mut(handle.as_str()) else {
                return Err(ProviderError::NotFound(format!("operation {handle}")));
            };
            if !op.operation.status.is_done() {
                op.polls_remaining = op.polls_remaining.saturating_sub(1);
                if op.polls_remaining == 0 {
                    state.finish(handle.as_str(), None);
                } else {
                    op.operation.status = OperationStatus::Running;
                }
            }
            state
                .operations
                .get(handle.as_str())
                .map(|op| op.operation.clone())
                .ok_or_else(|| ProviderError::NotFound(format!("operation {handle}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONE: &str = "asia-east1-b";

    fn spec(name: &str) -> InstanceSpec {
        InstanceSpec {
            name: name.to_string(),
            machine_type: "n1-standard-4".to_string(),
            boot_disk: BootDisk {
                source_image: "global/images/minecraft".to_string(),
                disk_type: "pd-ssd".to_string(),
                size_gb: 100,
            },
            attached_disks: Vec::new(),
            nat_ip: Some("203.0.113.7".to_string()),
            tags: vec!["minecraft-server".to_string()],
            metadata: BTreeMap::new(),
            preemptible: true,
        }
    }

    #[tokio::test]
    async fn insert_completes_after_configured_polls() {
        let provider = SimulatedProvider::new(2);
        provider.set_next_resource_id(42);

        let op = provider
            .insert_instance(ZONE, &spec("minecraft-alpha"), "req-1")
            .await
            .unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.target_id, 42);
        assert!(provider.instance(ZONE, "minecraft-alpha").is_none());

        let first = provider.get_operation(ZONE, &op.handle).await.unwrap();
        assert_eq!(first.status, OperationStatus::Running);

        let second = provider.get_operation(ZONE, &op.handle).await.unwrap();
        assert!(second.is_done());
        assert_eq!(second.kind, OperationKind::Insert);

        let instance = provider.instance(ZONE, "minecraft-alpha").unwrap();
        assert_eq!(instance.id, 42);
        assert_eq!(instance.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn repeated_request_id_returns_original_operation() {
        let provider = SimulatedProvider::default();
        let a = provider
            .insert_instance(ZONE, &spec("minecraft-alpha"), "req-1")
            .await
            .unwrap();
        let b = provider
            .insert_instance(ZONE, &spec("minecraft-alpha"), "req-1")
            .await
            .unwrap();
        assert_eq!(a.handle, b.handle);
        assert_eq!(provider.call_count("insert_instance"), 2);
    }

    #[tokio::test]
    async fn delete_removes_instance_on_completion() {
        let provider = SimulatedProvider::default();
        let id = provider.add_instance(ZONE, "minecraft-beta", InstanceStatus::Terminated);

        let op = provider.delete_instance(ZONE, "minecraft-beta").await.unwrap();
        assert_eq!(op.target_id, id);
        assert!(provider.instance(ZONE, "minecraft-beta").is_some());

        provider.get_operation(ZONE, &op.handle).await.unwrap();
        assert!(provider.instance(ZONE, "minecraft-beta").is_none());
    }

    #[tokio::test]
    async fn deleting_an_instance_deletes_its_attached_disks() {
        let provider = SimulatedProvider::default();
        let disk = DiskSpec {
            name: "minecraft-overviewer-world-beta".to_string(),
            source_snapshot: "snap-1".to_string(),
            disk_type: "pd-ssd".to_string(),
            size_gb: 100,
        };
        let op = provider.insert_disk(ZONE, &disk).await.unwrap();
        provider.get_operation(ZONE, &op.handle).await.unwrap();

        let mut render = spec("minecraft-overviewer-beta");
        render.attached_disks = vec![disk.name.clone()];
        let op = provider.insert_instance(ZONE, &render, "req-1").await.unwrap();
        provider.get_operation(ZONE, &op.handle).await.unwrap();
        assert_eq!(provider.attached_disks(ZONE, &render.name), vec![disk.name.clone()]);

        let op = provider.delete_instance(ZONE, &render.name).await.unwrap();
        provider.get_operation(ZONE, &op.handle).await.unwrap();
        assert!(provider.disk(ZONE, &disk.name).is_none());
        assert!(provider.attached_disks(ZONE, &render.name).is_empty());

        // The name is free again for the next clone.
        provider.insert_disk(ZONE, &disk).await.unwrap();
    }

    #[tokio::test]
    async fn start_on_missing_instance_is_not_found() {
        let provider = SimulatedProvider::default();
        let err = provider.start_instance(ZONE, "ghost").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_failure_is_consumed_once() {
        let provider = SimulatedProvider::default();
        provider.fail_next("create_snapshot", "quota exceeded");

        let err = provider
            .create_snapshot(ZONE, "minecraft-world-beta", "snap-1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));

        let op = provider
            .create_snapshot(ZONE, "minecraft-world-beta", "snap-1")
            .await
            .unwrap();
        provider.get_operation(ZONE, &op.handle).await.unwrap();
        assert_eq!(provider.snapshots(), vec!["snap-1".to_string()]);
    }

    #[tokio::test]
    async fn forced_error_skips_side_effect() {
        let provider = SimulatedProvider::new(5);
        let disk = DiskSpec {
            name: "minecraft-overviewer-world-beta".to_string(),
            source_snapshot: "snap-1".to_string(),
            disk_type: "pd-ssd".to_string(),
            size_gb: 100,
        };
        let op = provider.insert_disk(ZONE, &disk).await.unwrap();
        provider.complete_operation(&op.handle, Some("snapshot missing".to_string()));

        let done = provider.get_operation(ZONE, &op.handle).await.unwrap();
        assert!(done.is_done());
        assert_eq!(done.error.as_deref(), Some("snapshot missing"));
        assert!(provider.disk(ZONE, &disk.name).is_none());
    }

    #[tokio::test]
    async fn list_is_scoped_to_zone_and_logged() {
        let provider = SimulatedProvider::default();
        provider.add_instance(ZONE, "minecraft-alpha", InstanceStatus::Running);
        provider.add_instance("us-central1-a", "minecraft-gamma", InstanceStatus::Running);

        let listed = provider.list_instances(ZONE).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "minecraft-alpha");
        assert_eq!(
            provider.calls(),
            vec![ProviderCall::ListInstances {
                zone: ZONE.to_string()
            }]
        );
    }

    #[tokio::test]
    async fn unknown_operation_is_not_found() {
        let provider = SimulatedProvider::default();
        let err = provider
            .get_operation(ZONE, &OperationHandle::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }
}
