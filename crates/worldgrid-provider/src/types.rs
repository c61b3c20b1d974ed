//! Provider-neutral views of compute resources and operations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use worldgrid_core::{OperationHandle, OperationKind, OperationStatus};

/// Instance lifecycle state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Stopped,
    Suspending,
    Suspended,
    Terminated,
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    pub fn is_terminated(self) -> bool {
        self == InstanceStatus::Terminated
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    pub zone: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
}

/// Boot disk created from an image together with the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootDisk {
    /// Image path relative to the project, e.g. `global/images/family/x`.
    pub source_image: String,
    pub disk_type: String,
    pub size_gb: u64,
}

/// Everything needed to insert an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub machine_type: String,
    pub boot_disk: BootDisk,
    /// Names of existing disks in the same zone to attach read-write.
    #[serde(default)]
    pub attached_disks: Vec<String>,
    /// Static external address; `None` requests an ephemeral one.
    #[serde(default)]
    pub nat_ip: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub preemptible: bool,
}

/// A disk cloned from a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub name: String,
    pub source_snapshot: String,
    pub disk_type: String,
    pub size_gb: u64,
}

/// A provider operation as last observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub handle: OperationHandle,
    pub kind: OperationKind,
    pub status: OperationStatus,
    /// Id of the resource the operation acts on; 0 when unknown.
    pub target_id: i64,
    /// Error reported for a finished operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }
}
