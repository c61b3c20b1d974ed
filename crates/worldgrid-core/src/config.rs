//! worldgrid.toml configuration parser.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working configuration against the simulated provider.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::naming::Naming;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub provider: ProviderConfig,
    pub naming: Naming,
    pub instance: InstanceTemplate,
    pub render: RenderTemplate,
    pub tasks: TaskConfig,
    pub sweep: SweepConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Simulated,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub project: String,
    /// Zones scanned by the sweep. The first zone is the default placement.
    pub zones: Vec<String>,
    /// Base URL of a Compute Engine v1 compatible endpoint.
    pub endpoint: String,
    /// Environment variable holding the bearer token.
    pub token_env: String,
    pub request_timeout_secs: u64,
    /// Simulated provider only: polls before an operation reports DONE.
    pub simulated_polls_to_complete: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Simulated,
            project: "worldgrid".to_string(),
            zones: vec!["asia-northeast1-b".to_string()],
            endpoint: "http://127.0.0.1:8085/compute/v1".to_string(),
            token_env: "WORLDGRID_TOKEN".to_string(),
            request_timeout_secs: 30,
            simulated_polls_to_complete: 1,
        }
    }
}

/// Template for primary world instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceTemplate {
    pub machine_type: String,
    pub source_image: String,
    pub disk_type: String,
    pub disk_size_gb: u64,
    /// Size of the world data disk restored from a snapshot.
    pub world_disk_size_gb: u64,
    pub tags: Vec<String>,
    pub startup_script_url: String,
    pub shutdown_script_url: String,
    pub preemptible: bool,
}

impl Default for InstanceTemplate {
    fn default() -> Self {
        Self {
            machine_type: "n1-standard-4".to_string(),
            source_image: "global/images/minecraft-image-v20151114a".to_string(),
            disk_type: "pd-ssd".to_string(),
            disk_size_gb: 100,
            world_disk_size_gb: 100,
            tags: vec!["minecraft-server".to_string()],
            startup_script_url: "gs://worldgrid-shell/minecraftserver-startup-script.sh".to_string(),
            shutdown_script_url: "gs://worldgrid-shell/minecraftserver-shutdown-script.sh"
                .to_string(),
            preemptible: true,
        }
    }
}

/// Template for render instances and the disks cloned for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderTemplate {
    pub machine_type: String,
    pub source_image: String,
    pub disk_type: String,
    pub disk_size_gb: u64,
    pub world_disk_size_gb: u64,
    pub startup_script_url: String,
    pub shutdown_script_url: String,
    pub minecraft_version: String,
    pub preemptible: bool,
}

impl Default for RenderTemplate {
    fn default() -> Self {
        Self {
            machine_type: "n1-highcpu-4".to_string(),
            source_image: "global/images/family/minecraft-overviewer".to_string(),
            disk_type: "pd-ssd".to_string(),
            disk_size_gb: 100,
            world_disk_size_gb: 100,
            startup_script_url: "gs://worldgrid-shell/minecraft-overviewer-server-startup-script.sh"
                .to_string(),
            shutdown_script_url: "gs://worldgrid-shell/minecraft-overviewer-shutdown-script.sh"
                .to_string(),
            minecraft_version: "1.12".to_string(),
            preemptible: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Delay before the first poll of a freshly issued operation.
    pub reconcile_delay_secs: u64,
    pub backoff_multiplier: u32,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
    /// How long a claimed task stays invisible before it is redelivered.
    pub lease_secs: u64,
    pub batch_size: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            reconcile_delay_secs: 30,
            backoff_multiplier: 2,
            max_delay_secs: 600,
            max_attempts: 20,
            poll_interval_ms: 1000,
            lease_secs: 120,
            batch_size: 32,
        }
    }
}

impl TaskConfig {
    pub fn reconcile_delay(&self) -> Duration {
        Duration::from_secs(self.reconcile_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    pub render_interval_secs: u64,
    pub max_concurrency: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            render_interval_secs: 600,
            max_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: GridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.provider.zones.is_empty() {
            anyhow::bail!("provider.zones must name at least one zone");
        }
        if self.naming.world_prefix.is_empty() || self.naming.render_prefix.is_empty() {
            anyhow::bail!("naming prefixes must not be empty");
        }
        if self.naming.world_prefix == self.naming.render_prefix {
            anyhow::bail!("naming.world_prefix and naming.render_prefix must differ");
        }
        if self.tasks.max_attempts == 0 {
            anyhow::bail!("tasks.max_attempts must be at least 1");
        }
        if self.sweep.max_concurrency == 0 {
            anyhow::bail!("sweep.max_concurrency must be at least 1");
        }
        Ok(())
    }

    /// Zone used when a caller does not name one.
    pub fn default_zone(&self) -> &str {
        self.provider
            .zones
            .first()
            .map(String::as_str)
            .unwrap_or("asia-northeast1-b")
    }
}
