//! Task payloads shared by the reconcile, create-instance,
//! delete-after-snapshot and render-provision handlers.

use worldgrid_core::{OperationHandle, WorldKey};
use worldgrid_tasks::TaskParams;

use crate::error::{LifecycleError, LifecycleResult};

pub const RECONCILE_TASK: &str = "reconcile";
pub const CREATE_INSTANCE_TASK: &str = "create-instance";
pub const DELETE_AFTER_SNAPSHOT_TASK: &str = "delete-after-snapshot";
pub const RENDER_PROVISION_TASK: &str = "render-provision";

const KEY: &str = "key";
const OPERATION: &str = "operation";
const GENERATION: &str = "generation";
const SNAPSHOT: &str = "snapshot";
const ZONE: &str = "zone";

/// A world key plus the provider operation a handler should poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPayload {
    pub key: WorldKey,
    pub handle: OperationHandle,
    /// Record generation the operation was issued under. Absent for tasks
    /// that do not commit lifecycle status.
    pub generation: Option<u64>,
    pub snapshot: Option<String>,
    /// Zone the operation runs in; falls back to the record's zone.
    pub zone: Option<String>,
}

impl OperationPayload {
    pub fn new(key: WorldKey, handle: OperationHandle) -> Self {
        Self {
            key,
            handle,
            generation: None,
            snapshot: None,
            zone: None,
        }
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn world_id(&self) -> &str {
        self.key.world_id()
    }

    pub fn to_params(&self) -> TaskParams {
        let mut params = TaskParams::new();
        params.insert(KEY.to_string(), self.key.encode());
        params.insert(OPERATION.to_string(), self.handle.as_str().to_string());
        if let Some(generation) = self.generation {
            params.insert(GENERATION.to_string(), generation.to_string());
        }
        if let Some(snapshot) = &self.snapshot {
            params.insert(SNAPSHOT.to_string(), snapshot.clone());
        }
        if let Some(zone) = &self.zone {
            params.insert(ZONE.to_string(), zone.clone());
        }
        params
    }

    pub fn from_params(params: &TaskParams) -> LifecycleResult<Self> {
        let key = params
            .get(KEY)
            .ok_or_else(|| LifecycleError::Decode("missing key".to_string()))?;
        let key = WorldKey::decode(key)?;

        let handle = params
            .get(OPERATION)
            .filter(|op| !op.is_empty())
            .ok_or_else(|| LifecycleError::Decode("missing operation".to_string()))?;

        let generation = params
            .get(GENERATION)
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|e| LifecycleError::Decode(format!("invalid generation {raw:?}: {e}")))
            })
            .transpose()?;

        Ok(Self {
            key,
            handle: OperationHandle::new(handle.clone()),
            generation,
            snapshot: non_empty(params.get(SNAPSHOT)),
            zone: non_empty(params.get(ZONE)),
        })
    }

    /// The snapshot name, required by the snapshot and render handlers.
    pub fn require_snapshot(&self) -> LifecycleResult<&str> {
        self.snapshot
            .as_deref()
            .ok_or_else(|| LifecycleError::Decode("missing snapshot".to_string()))
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}
