//! Render pipeline.
//!
//! For each world whose latest snapshot has not been rendered, clone a disk
//! from the snapshot and, once the clone is ready, boot a render instance
//! with the disk attached. `render_in_flight` marks a clone in progress so
//! repeated runs never clone the same snapshot twice.
//!
//! The marker is released when the clone fails, when the render instance
//! insert fails, and when the dispatcher gives up on the provision task.
//! `render_disk` remembers which snapshot the existing render disk holds,
//! so a retry after a failed insert boots from that disk instead of
//! cloning again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use worldgrid_core::{GridConfig, WorldKey, idempotency_token};
use worldgrid_provider::{BootDisk, ComputeProvider, DiskSpec, InstanceSpec};
use worldgrid_state::{StateError, StateStore, WorldRecord};
use worldgrid_tasks::{TaskFuture, TaskHandler, TaskOutcome, TaskParams, TaskQueue};

use crate::controller::zone_or_default;
use crate::error::{LifecycleError, LifecycleResult};
use crate::payload::{OperationPayload, RENDER_PROVISION_TASK};

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderReport {
    /// `(world, snapshot)` pairs whose disk clone was started.
    pub started: Vec<(String, String)>,
    /// `(world, error)` pairs that could not be started.
    pub failures: Vec<(String, String)>,
}

impl RenderReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of one `render-provision` delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    Pending,
    /// Render instance inserted and the snapshot marked rendered.
    Started(String),
    /// The snapshot was already rendered.
    AlreadyRendered,
    /// The disk clone failed; the snapshot will be retried on the next run.
    CloneFailed(String),
}

#[derive(Clone)]
pub struct RenderPipeline {
    store: StateStore,
    provider: Arc<dyn ComputeProvider>,
    queue: TaskQueue,
    config: Arc<GridConfig>,
}

impl RenderPipeline {
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

    /// Start a disk clone for every world with an unrendered snapshot.
    pub async fn run_once(&self) -> LifecycleResult<RenderReport> {
        let mut report = RenderReport::default();
        for record in self.store.list_worlds()? {
            if !record.needs_render() {
                continue;
            }
            let world = record.world_id.clone();
            let started = if record.render_disk == record.latest_snapshot {
                let zone = zone_or_default(&record, &self.config);
                self.boot(&world, &zone, &record.latest_snapshot)
                    .await
                    .map(|_| record.latest_snapshot.clone())
            } else {
                self.start_clone(&record).await
            };
            match started {
                Ok(snapshot) => report.started.push((world, snapshot)),
                Err(e) => {
                    warn!(%world, error = %e, "render clone failed to start");
                    report.failures.push((world, e.to_string()));
                }
            }
        }
        info!(
            started = report.started.len(),
            failures = report.failures.len(),
            "render pipeline run finished"
        );
        Ok(report)
    }

    async fn start_clone(&self, record: &WorldRecord) -> LifecycleResult<String> {
        let world = record.world_id.as_str();
        let key = WorldKey::new(world)?;
        let snapshot = record.latest_snapshot.clone();
        let zone = zone_or_default(record, &self.config);
        let disk = DiskSpec {
            name: self.config.naming.render_disk_name(world),
            source_snapshot: snapshot.clone(),
            disk_type: self.config.render.disk_type.clone(),
            size_gb: self.config.render.world_disk_size_gb,
        };

        let op = self.provider.insert_disk(&zone, &disk).await?;
        info!(%world, %zone, disk = %disk.name, %snapshot, handle = %op.handle, "render disk clone issued");

        self.store
            .transactionally::<_, StateError>(world, |mut record| {
                record.render_in_flight = snapshot.clone();
                Ok(record)
            })?;

        let payload = OperationPayload::new(key, op.handle)
            .with_snapshot(snapshot.clone())
            .with_zone(zone);
        self.queue.enqueue(
            RENDER_PROVISION_TASK,
            payload.to_params(),
            self.config.tasks.reconcile_delay(),
        )?;
        Ok(snapshot)
    }

    /// Poll the disk clone; once ready, insert the render instance.
    pub async fn provision(&self, payload: &OperationPayload) -> LifecycleResult<Provisioned> {
        let world = payload.world_id();
        let snapshot = payload.require_snapshot()?;
        let record = self
            .store
            .get_world(world)?
            .ok_or_else(|| LifecycleError::NotFound(world.to_string()))?;
        if record.rendered_snapshot == snapshot {
            info!(%world, %snapshot, "snapshot already rendered");
            return Ok(Provisioned::AlreadyRendered);
        }

        let zone = payload
            .zone
            .clone()
            .unwrap_or_else(|| zone_or_default(&record, &self.config));
        let op = self.provider.get_operation(&zone, &payload.handle).await?;
        if !op.is_done() {
            info!(%world, %snapshot, status = %op.status, "render disk not ready");
            return Ok(Provisioned::Pending);
        }

        if let Some(error) = op.error {
            warn!(%world, %snapshot, %error, "render disk clone failed");
            self.release(world, snapshot)?;
            return Ok(Provisioned::CloneFailed(error));
        }

        self.store
            .transactionally::<_, StateError>(world, |mut record| {
                record.render_disk = snapshot.to_string();
                Ok(record)
            })?;

        match self.boot(world, &zone, snapshot).await {
            Ok(instance) => Ok(Provisioned::Started(instance)),
            Err(e) => {
                warn!(%world, %snapshot, error = %e, "render instance insert failed");
                self.release(world, snapshot)?;
                Err(e)
            }
        }
    }

    /// Insert the render instance over the cloned disk and mark the
    /// snapshot rendered.
    async fn boot(&self, world: &str, zone: &str, snapshot: &str) -> LifecycleResult<String> {
        let spec = self.render_spec(world);
        let request_id = idempotency_token(&[world, "render", snapshot]);
        let insert = self
            .provider
            .insert_instance(zone, &spec, &request_id)
            .await?;
        info!(%world, instance = %spec.name, handle = %insert.handle, "render instance insert issued");

        self.store
            .transactionally::<_, StateError>(world, |mut record| {
                record.rendered_snapshot = snapshot.to_string();
                record.render_instance = spec.name.clone();
                if record.render_in_flight == snapshot {
                    record.render_in_flight.clear();
                }
                Ok(record)
            })?;
        Ok(spec.name)
    }

    /// Drop the in-flight marker if it still names `snapshot`.
    fn release(&self, world: &str, snapshot: &str) -> LifecycleResult<()> {
        self.store
            .transactionally::<_, StateError>(world, |mut record| {
                if record.render_in_flight == snapshot {
                    record.render_in_flight.clear();
                }
                Ok(record)
            })?;
        Ok(())
    }

    /// Build the render instance spec from the configured template.
    pub fn render_spec(&self, world: &str) -> InstanceSpec {
        let template = &self.config.render;
        let mut metadata = BTreeMap::new();
        metadata.insert("startup-script-url".to_string(), template.startup_script_url.clone());
        metadata.insert("shutdown-script-url".to_string(), template.shutdown_script_url.clone());
        metadata.insert("world".to_string(), world.to_string());
        metadata.insert("state".to_string(), "new".to_string());
        metadata.insert("minecraft-version".to_string(), template.minecraft_version.clone());

        InstanceSpec {
            name: self.config.naming.render_instance_name(world),
            machine_type: template.machine_type.clone(),
            boot_disk: BootDisk {
                source_image: template.source_image.clone(),
                disk_type: template.disk_type.clone(),
                size_gb: template.disk_size_gb,
            },
            attached_disks: vec![self.config.naming.render_disk_name(world)],
            nat_ip: None,
            tags: Vec::new(),
            metadata,
            preemptible: template.preemptible,
        }
    }

    /// Run the pipeline loop until shutdown is signalled.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "render pipeline started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "render pipeline run failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("render pipeline shutting down");
                    break;
                }
            }
        }
    }
}

impl TaskHandler for RenderPipeline {
    fn handle<'a>(&'a self, params: &'a TaskParams) -> TaskFuture<'a> {
        Box::pin(async move {
            let payload = match OperationPayload::from_params(params) {
                Ok(payload) => payload,
                Err(e) => return e.into_outcome(),
            };
            match self.provision(&payload).await {
                Ok(Provisioned::Pending) => TaskOutcome::Pending,
                Ok(_) => TaskOutcome::Done,
                Err(e) => {
                    warn!(world = payload.world_id(), error = %e, "render-provision failed");
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
            Ok(()) => warn!(%world, %snapshot, %reason, "render provision abandoned"),
            Err(e) => warn!(%world, %snapshot, error = %e, "failed to release render marker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use worldgrid_provider::{ProviderCall, SimulatedProvider};

    use super::*;

    const ZONE: &str = "asia-northeast1-b";

    fn setup() -> (StateStore, SimulatedProvider, RenderPipeline) {
        let store = StateStore::open_in_memory().unwrap();
        let provider = SimulatedProvider::default();
        let pipeline = RenderPipeline::new(
            store.clone(),
            Arc::new(provider.clone()),
            TaskQueue::new(store.clone()),
            Arc::new(GridConfig::default()),
        );
        (store, provider, pipeline)
    }

    fn seed(store: &StateStore, world: &str, latest: &str, rendered: &str) {
        store
            .transactionally::<_, StateError>(world, |mut record| {
                record.zone = ZONE.to_string();
                record.latest_snapshot = latest.to_string();
                record.rendered_snapshot = rendered.to_string();
                Ok(record)
            })
            .unwrap();
    }

    fn queued(store: &StateStore) -> Vec<OperationPayload> {
        store
            .list_tasks()
            .unwrap()
            .iter()
            .filter(|task| task.name == RENDER_PROVISION_TASK)
            .map(|task| OperationPayload::from_params(&task.params).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn rendered_worlds_are_never_recloned() {
        let (store, provider, pipeline) = setup();
        seed(&store, "alpha", "snap-1", "snap-1");
        seed(&store, "beta", "", "");

        for _ in 0..3 {
            let report = pipeline.run_once().await.unwrap();
            assert!(report.started.is_empty());
        }
        assert_eq!(provider.call_count("insert_disk"), 0);
    }

    #[tokio::test]
    async fn in_flight_snapshot_is_cloned_once() {
        let (store, provider, pipeline) = setup();
        seed(&store, "alpha", "snap-2", "snap-1");

        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.started, vec![("alpha".to_string(), "snap-2".to_string())]);
        pipeline.run_once().await.unwrap();

        assert_eq!(provider.call_count("insert_disk"), 1);
        assert!(matches!(
            &provider.calls()[0],
            ProviderCall::InsertDisk { name, source_snapshot, .. }
                if name == "minecraft-overviewer-world-alpha" && source_snapshot == "snap-2"
        ));
        let record = store.get_world("alpha").unwrap().unwrap();
        assert_eq!(record.render_in_flight, "snap-2");
        assert_eq!(queued(&store).len(), 1);
    }

    #[tokio::test]
    async fn provision_inserts_render_instance_and_marks_rendered() {
        let (store, provider, pipeline) = setup();
        seed(&store, "alpha", "snap-2", "");
        pipeline.run_once().await.unwrap();
        let payload = queued(&store).remove(0);

        let outcome = pipeline.handle(&payload.to_params()).await;
        assert_eq!(outcome, TaskOutcome::Done);

        let record = store.get_world("alpha").unwrap().unwrap();
        assert_eq!(record.rendered_snapshot, "snap-2");
        assert_eq!(record.render_instance, "minecraft-overviewer-alpha");
        assert!(record.render_in_flight.is_empty());
        assert!(!record.needs_render());

        // Redelivery after success is a no-op.
        assert_eq!(
            pipeline.provision(&payload).await.unwrap(),
            Provisioned::AlreadyRendered
        );
        assert_eq!(provider.call_count("insert_instance"), 1);

        // And later runs do not clone again.
        pipeline.run_once().await.unwrap();
        assert_eq!(provider.call_count("insert_disk"), 1);
    }

    #[tokio::test]
    async fn provision_waits_for_clone() {
        let (store, provider, pipeline) = setup();
        provider.set_polls_to_complete(3);
        seed(&store, "alpha", "snap-2", "");
        pipeline.run_once().await.unwrap();
        let payload = queued(&store).remove(0);

        assert_eq!(pipeline.handle(&payload.to_params()).await, TaskOutcome::Pending);
        assert_eq!(provider.call_count("insert_instance"), 0);
    }

    #[tokio::test]
    async fn failed_clone_releases_in_flight_marker() {
        let (store, provider, pipeline) = setup();
        seed(&store, "alpha", "snap-2", "");
        pipeline.run_once().await.unwrap();
        let payload = queued(&store).remove(0);
        provider.complete_operation(&payload.handle, Some("snapshot not found".to_string()));

        let result = pipeline.provision(&payload).await.unwrap();
        assert!(matches!(result, Provisioned::CloneFailed(_)));
        let record = store.get_world("alpha").unwrap().unwrap();
        assert!(record.render_in_flight.is_empty());
        assert!(record.needs_render());
    }

    #[tokio::test]
    async fn failed_render_insert_boots_from_the_existing_disk_next_run() {
        let (store, provider, pipeline) = setup();
        seed(&store, "alpha", "snap-2", "");
        pipeline.run_once().await.unwrap();
        let payload = queued(&store).remove(0);
        provider.fail_next("insert_instance", "quota exceeded");

        let outcome = pipeline.handle(&payload.to_params()).await;
        assert!(matches!(outcome, TaskOutcome::Failed(_)));
        let record = store.get_world("alpha").unwrap().unwrap();
        assert!(record.render_in_flight.is_empty());
        assert_eq!(record.render_disk, "snap-2");
        assert!(record.needs_render());

        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.started, vec![("alpha".to_string(), "snap-2".to_string())]);
        assert_eq!(provider.call_count("insert_disk"), 1);
        assert_eq!(provider.call_count("insert_instance"), 2);
        let record = store.get_world("alpha").unwrap().unwrap();
        assert_eq!(record.rendered_snapshot, "snap-2");

        // The queued retry replays the same insert and finds it rendered.
        assert_eq!(
            pipeline.provision(&payload).await.unwrap(),
            Provisioned::AlreadyRendered
        );
    }

    #[tokio::test]
    async fn abandoned_provision_releases_in_flight_marker() {
        let (store, provider, pipeline) = setup();
        provider.set_polls_to_complete(100);
        seed(&store, "alpha", "snap-2", "");
        pipeline.run_once().await.unwrap();
        let payload = queued(&store).remove(0);
        assert!(!store.get_world("alpha").unwrap().unwrap().needs_render());

        pipeline.dead_lettered(&payload.to_params(), "gave up after 20 attempts");
        let record = store.get_world("alpha").unwrap().unwrap();
        assert!(record.render_in_flight.is_empty());
        assert!(record.needs_render());
    }

    #[tokio::test]
    async fn one_failing_world_does_not_stop_others() {
        let (store, provider, pipeline) = setup();
        seed(&store, "alpha", "snap-a", "");
        seed(&store, "beta", "snap-b", "");
        provider.fail_next("insert_disk", "quota");

        let report = pipeline.run_once().await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.started.len(), 1);
        assert!(!report.is_success());
    }

    #[test]
    fn render_spec_attaches_clone_disk() {
        let (_, _, pipeline) = setup();
        let spec = pipeline.render_spec("alpha");
        assert_eq!(spec.name, "minecraft-overviewer-alpha");
        assert_eq!(spec.machine_type, "n1-highcpu-4");
        assert_eq!(spec.attached_disks, vec!["minecraft-overviewer-world-alpha".to_string()]);
        assert_eq!(spec.metadata["minecraft-version"], "1.12");
    }
}
