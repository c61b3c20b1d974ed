//! Domain types for the worldgrid state store.
//!
//! These types represent the persisted lifecycle record of each world and
//! the delayed tasks that drive it. All types are serializable to/from JSON
//! for storage in redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use worldgrid_core::{OperationHandle, OperationKind, OperationStatus};

/// Unique identifier for a world (the record key).
pub type WorldId = String;

/// Unique identifier for a queued task.
pub type TaskId = u64;

// ── World ─────────────────────────────────────────────────────────

/// Whether the world's primary instance exists on the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorldStatus {
    /// No instance was ever created.
    #[default]
    NoExists,
    /// An instance is present.
    Exists,
    /// The instance was torn down.
    NotExists,
}

/// The last provider operation observed for a world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastOperation {
    pub handle: OperationHandle,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// Error reported by the provider on a finished operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The operation most recently issued for a world and not yet committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOperation {
    pub handle: OperationHandle,
    pub kind: OperationKind,
    /// Record generation the operation was issued under.
    pub generation: u64,
    /// Unix timestamp (seconds) when the operation was issued.
    pub issued_at: u64,
}

/// Durable lifecycle record of one world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldRecord {
    pub world_id: WorldId,
    /// Provider-assigned instance id; 0 when absent.
    pub external_resource_id: i64,
    pub zone: String,
    pub ip_address: String,
    pub status: WorldStatus,
    #[serde(default)]
    pub last_operation: Option<LastOperation>,
    #[serde(default)]
    pub pending: Option<PendingOperation>,
    /// Incremented each time an operation is issued for this world.
    #[serde(default)]
    pub generation: u64,
    /// Most recent snapshot taken of the world disk.
    #[serde(default)]
    pub latest_snapshot: String,
    /// Snapshot issued by the chain and not yet followed up.
    #[serde(default)]
    pub snapshot_in_flight: String,
    /// Snapshot the render pipeline has already processed.
    #[serde(default)]
    pub rendered_snapshot: String,
    /// Snapshot currently being cloned for rendering.
    #[serde(default)]
    pub render_in_flight: String,
    #[serde(default)]
    pub render_instance: String,
    /// Snapshot the current render disk was cloned from.
    #[serde(default)]
    pub render_disk: String,
    /// Unix timestamp (seconds) when this record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last committed mutation.
    pub updated_at: u64,
}

impl WorldRecord {
    /// Zero-value record handed to transactions when no record exists yet.
    pub fn empty(world_id: &str) -> Self {
        Self {
            world_id: world_id.to_string(),
            external_resource_id: 0,
            zone: String::new(),
            ip_address: String::new(),
            status: WorldStatus::NoExists,
            last_operation: None,
            pending: None,
            generation: 0,
            latest_snapshot: String::new(),
            snapshot_in_flight: String::new(),
            rendered_snapshot: String::new(),
            render_in_flight: String::new(),
            render_instance: String::new(),
            render_disk: String::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    /// A snapshot exists that the render pipeline has not processed or
    /// started processing.
    pub fn needs_render(&self) -> bool {
        !self.latest_snapshot.is_empty()
            && self.latest_snapshot != self.rendered_snapshot
            && self.latest_snapshot != self.render_in_flight
    }
}

// ── Tasks ─────────────────────────────────────────────────────────

/// A delayed task waiting in the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Route name the dispatcher resolves to a handler.
    pub name: String,
    /// Flat string parameters.
    pub params: BTreeMap<String, String>,
    /// Unix timestamp (milliseconds) at which the task becomes deliverable.
    pub due_at_ms: u64,
    /// Deliveries that did not complete the task.
    pub attempts: u32,
    pub enqueued_at_ms: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// A task removed from the queue without completing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub task: TaskRecord,
    pub reason: String,
    pub dead_at_ms: u64,
}

impl TaskRecord {
    /// Build the key for the tasks and dead-letter tables.
    pub fn table_key(&self) -> String {
        task_key(self.id)
    }
}

pub(crate) fn task_key(id: TaskId) -> String {
    format!("{id:020}")
}
