//! Resource naming conventions.
//!
//! Every provider-side name (instances, disks, snapshots) is derived from
//! the world id through these prefixes, and the sweep classifies instances
//! by reversing the same rules.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a provider instance by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceClass {
    /// A primary game-server instance for the contained world.
    World(String),
    /// A render instance for the contained world.
    Render(String),
    /// Not managed by worldgrid.
    Unmanaged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Naming {
    /// Prefix of primary world instances, e.g. `minecraft-alpha`.
    pub world_prefix: String,
    /// Prefix of render instances, e.g. `minecraft-overviewer-alpha`.
    pub render_prefix: String,
    /// Prefix of the world data disk and its snapshots.
    pub snapshot_prefix: String,
    /// Prefix of disks cloned for the render pipeline.
    pub render_disk_prefix: String,
}

impl Default for Naming {
    fn default() -> Self {
        Self {
            world_prefix: "minecraft-".to_string(),
            render_prefix: "minecraft-overviewer-".to_string(),
            snapshot_prefix: "minecraft-world".to_string(),
            render_disk_prefix: "minecraft-overviewer-world-".to_string(),
        }
    }
}

impl Naming {
    pub fn instance_name(&self, world: &str) -> String {
        format!("{}{world}", self.world_prefix)
    }

    pub fn render_instance_name(&self, world: &str) -> String {
        format!("{}{world}", self.render_prefix)
    }

    /// The persistent data disk attached to a world instance.
    pub fn world_disk_name(&self, world: &str) -> String {
        format!("{}-{world}", self.snapshot_prefix)
    }

    pub fn render_disk_name(&self, world: &str) -> String {
        format!("{}{world}", self.render_disk_prefix)
    }

    /// `<snapshot_prefix>-<world>-<YYYYMMDD-HHMMSS>`.
    pub fn snapshot_name(&self, world: &str, at: DateTime<Utc>) -> String {
        format!(
            "{}-{world}-{}",
            self.snapshot_prefix,
            at.format("%Y%m%d-%H%M%S")
        )
    }

    /// Timestamp embedded in a name produced by [`Naming::snapshot_name`].
    pub fn snapshot_taken_at(&self, world: &str, snapshot: &str) -> Option<NaiveDateTime> {
        let stamp = snapshot
            .strip_prefix(self.snapshot_prefix.as_str())?
            .strip_prefix('-')?
            .strip_prefix(world)?
            .strip_prefix('-')?;
        NaiveDateTime::parse_from_str(stamp, "%Y%m%d-%H%M%S").ok()
    }

    /// Whether `candidate` was taken no earlier than `current`. An empty or
    /// foreign `current` is always superseded; a foreign `candidate` never
    /// supersedes a recognised one.
    pub fn supersedes_snapshot(&self, world: &str, candidate: &str, current: &str) -> bool {
        match (
            self.snapshot_taken_at(world, candidate),
            self.snapshot_taken_at(world, current),
        ) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(candidate), Some(current)) => candidate >= current,
        }
    }

    /// Classify an instance name.
    ///
    /// The render prefix usually extends the world prefix, so it is checked
    /// first.
    pub fn classify(&self, instance_name: &str) -> InstanceClass {
        if let Some(world) = instance_name.strip_prefix(&self.render_prefix) {
            if world.is_empty() {
                return InstanceClass::Unmanaged;
            }
            return InstanceClass::Render(world.to_string());
        }
        match instance_name.strip_prefix(&self.world_prefix) {
            Some(world) if !world.is_empty() => InstanceClass::World(world.to_string()),
            _ => InstanceClass::Unmanaged,
        }
    }
}
