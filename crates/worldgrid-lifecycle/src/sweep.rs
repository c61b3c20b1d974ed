//! Periodic sweep over the provider fleet.
//!
//! Terminated world instances get a snapshot-then-delete chain; terminated
//! render instances are deleted outright. Every unit runs concurrently
//! (bounded by `sweep.max_concurrency`) and the sweep waits for all of them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use worldgrid_core::{GridConfig, InstanceClass, OperationHandle};
use worldgrid_provider::ComputeProvider;

use crate::chain::{SnapshotChain, SnapshotStart};
use crate::error::LifecycleResult;

/// What a unit was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitAction {
    Snapshot { world: String },
    DeleteRender { world: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Issued(OperationHandle),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub instance: String,
    pub zone: String,
    pub action: UnitAction,
    pub outcome: UnitOutcome,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub units: Vec<UnitReport>,
}

impl SweepReport {
    /// A sweep succeeds iff every unit succeeded.
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitReport> {
        self.units
            .iter()
            .filter(|unit| matches!(unit.outcome, UnitOutcome::Failed(_)))
    }

    pub fn snapshots_issued(&self) -> usize {
        self.count_issued(|action| matches!(action, UnitAction::Snapshot { .. }))
    }

    pub fn deletes_issued(&self) -> usize {
        self.count_issued(|action| matches!(action, UnitAction::DeleteRender { .. }))
    }

    fn count_issued(&self, pred: impl Fn(&UnitAction) -> bool) -> usize {
        self.units
            .iter()
            .filter(|unit| pred(&unit.action) && matches!(unit.outcome, UnitOutcome::Issued(_)))
            .count()
    }
}

#[derive(Clone)]
pub struct SweepScheduler {
    provider: Arc<dyn ComputeProvider>,
    chain: Arc<SnapshotChain>,
    config: Arc<GridConfig>,
}

impl SweepScheduler {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        chain: Arc<SnapshotChain>,
        config: Arc<GridConfig>,
    ) -> Self {
        Self {
            provider,
            chain,
            config,
        }
    }

    /// Scan every managed zone once and join all launched units.
    ///
    /// Listing failures abort the sweep before any unit starts.
    pub async fn run_once(&self) -> LifecycleResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut work = Vec::new();
        for zone in &self.config.provider.zones {
            let instances = self.provider.list_instances(zone).await?;
            report.scanned += instances.len();
            for instance in instances {
                if !instance.status.is_terminated() {
                    continue;
                }
                let action = match self.config.naming.classify(&instance.name) {
                    InstanceClass::World(world) => UnitAction::Snapshot { world },
                    InstanceClass::Render(world) => UnitAction::DeleteRender { world },
                    InstanceClass::Unmanaged => continue,
                };
                work.push((instance.name, zone.clone(), action));
            }
        }

        let permits = Arc::new(Semaphore::new(self.config.sweep.max_concurrency.max(1)));
        let mut set = JoinSet::new();
        for (instance, zone, action) in work {
            let permits = permits.clone();
            let provider = self.provider.clone();
            let chain = self.chain.clone();
            set.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => run_unit(provider.as_ref(), &chain, &instance, &zone, &action).await,
                    Err(e) => UnitOutcome::Failed(e.to_string()),
                };
                UnitReport {
                    instance,
                    zone,
                    action,
                    outcome,
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(unit) => {
                    if let UnitOutcome::Failed(reason) = &unit.outcome {
                        warn!(instance = %unit.instance, zone = %unit.zone, %reason, "sweep unit failed");
                    }
                    report.units.push(unit);
                }
                Err(e) => {
                    error!(error = %e, "sweep unit panicked");
                    report.units.push(UnitReport {
                        instance: String::new(),
                        zone: String::new(),
                        action: UnitAction::Snapshot {
                            world: String::new(),
                        },
                        outcome: UnitOutcome::Failed(format!("unit panicked: {e}")),
                    });
                }
            }
        }
        report.units.sort_by(|a, b| a.instance.cmp(&b.instance));

        info!(
            scanned = report.scanned,
            snapshots = report.snapshots_issued(),
            deletes = report.deletes_issued(),
            failures = report.failures().count(),
            "sweep finished"
        );
        Ok(report)
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "sweep scheduler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.run_once().await {
                        Ok(report) if !report.is_success() => {
                            warn!(failures = report.failures().count(), "sweep finished with failures");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("sweep scheduler shutting down");
                    break;
                }
            }
        }
    }
}

async fn run_unit(
    provider: &dyn ComputeProvider,
    chain: &SnapshotChain,
    instance: &str,
    zone: &str,
    action: &UnitAction,
) -> UnitOutcome {
    match action {
        UnitAction::Snapshot { world } => match chain.start(world, zone).await {
            Ok(SnapshotStart::Issued { handle, .. }) => UnitOutcome::Issued(handle),
            Ok(SnapshotStart::Skipped) => UnitOutcome::Skipped(format!("no record for {world}")),
            Ok(SnapshotStart::Busy(reason)) => UnitOutcome::Skipped(format!("{world}: {reason}")),
            Err(e) => UnitOutcome::Failed(e.to_string()),
        },
        UnitAction::DeleteRender { world } => match provider.delete_instance(zone, instance).await {
            Ok(op) => {
                info!(%world, %instance, %zone, handle = %op.handle, "render instance delete issued");
                UnitOutcome::Issued(op.handle)
            }
            Err(e) => UnitOutcome::Failed(e.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use worldgrid_provider::{InstanceStatus, SimulatedProvider};
    use worldgrid_state::{StateError, StateStore};
    use worldgrid_tasks::TaskQueue;

    use super::*;
    use crate::controller::LifecycleController;

    const ZONE: &str = "asia-northeast1-b";

    fn setup() -> (StateStore, SimulatedProvider, SweepScheduler) {
        let store = StateStore::open_in_memory().unwrap();
        let provider = SimulatedProvider::default();
        let shared: Arc<dyn ComputeProvider> = Arc::new(provider.clone());
        let mut config = GridConfig::default();
        config.sweep.max_concurrency = 2;
        let config = Arc::new(config);
        let queue = TaskQueue::new(store.clone());
        let controller =
            LifecycleController::new(store.clone(), shared.clone(), queue.clone(), config.clone());
        let chain = Arc::new(SnapshotChain::new(
            store.clone(),
            shared.clone(),
            queue,
            controller,
            config.clone(),
        ));
        (store, provider.clone(), SweepScheduler::new(shared, chain, config))
    }

    fn seed(store: &StateStore, world: &str) {
        store
            .transactionally::<_, StateError>(world, |mut record| {
                record.zone = ZONE.to_string();
                Ok(record)
            })
            .unwrap();
    }

    #[tokio::test]
    async fn issues_one_snapshot_per_world_and_one_delete_per_render() {
        let (store, provider, sweep) = setup();
        for world in ["a", "b", "c"] {
            seed(&store, world);
            provider.add_instance(ZONE, &format!("minecraft-{world}"), InstanceStatus::Terminated);
        }
        provider.add_instance(ZONE, "minecraft-overviewer-a", InstanceStatus::Terminated);
        provider.add_instance(ZONE, "minecraft-overviewer-b", InstanceStatus::Terminated);
        // Ignored: running, or unmanaged.
        provider.add_instance(ZONE, "minecraft-d", InstanceStatus::Running);
        provider.add_instance(ZONE, "bastion", InstanceStatus::Terminated);

        let report = sweep.run_once().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.scanned, 7);
        assert_eq!(report.snapshots_issued(), 3);
        assert_eq!(report.deletes_issued(), 2);
        assert_eq!(provider.call_count("create_snapshot"), 3);
        assert_eq!(provider.call_count("delete_instance"), 2);
        assert_eq!(store.list_tasks().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn one_failing_unit_fails_the_sweep_but_not_its_siblings() {
        let (store, provider, sweep) = setup();
        for world in ["a", "b"] {
            seed(&store, world);
            provider.add_instance(ZONE, &format!("minecraft-{world}"), InstanceStatus::Terminated);
        }
        provider.add_instance(ZONE, "minecraft-overviewer-a", InstanceStatus::Terminated);
        provider.fail_next("create_snapshot", "rate limited");

        let report = sweep.run_once().await.unwrap();
        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.snapshots_issued(), 1);
        assert_eq!(report.deletes_issued(), 1);
    }

    #[tokio::test]
    async fn world_without_record_is_skipped_not_failed() {
        let (_store, provider, sweep) = setup();
        provider.add_instance(ZONE, "minecraft-orphan", InstanceStatus::Terminated);

        let report = sweep.run_once().await.unwrap();
        assert!(report.is_success());
        assert!(matches!(report.units[0].outcome, UnitOutcome::Skipped(_)));
        assert_eq!(provider.call_count("create_snapshot"), 0);
    }

    #[tokio::test]
    async fn back_to_back_sweeps_snapshot_a_world_once() {
        let (store, provider, sweep) = setup();
        seed(&store, "a");
        provider.add_instance(ZONE, "minecraft-a", InstanceStatus::Terminated);

        let first = sweep.run_once().await.unwrap();
        assert_eq!(first.snapshots_issued(), 1);

        // The follow-up has not run yet, so the world is still terminated.
        let second = sweep.run_once().await.unwrap();
        assert!(second.is_success());
        assert_eq!(second.snapshots_issued(), 0);
        assert!(matches!(&second.units[0].outcome, UnitOutcome::Skipped(reason) if reason.contains("in flight")));
        assert_eq!(provider.call_count("create_snapshot"), 1);
        assert_eq!(store.list_tasks().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listing_failure_aborts_sweep() {
        let (_store, provider, sweep) = setup();
        provider.fail_next("list_instances", "unavailable");
        assert!(sweep.run_once().await.is_err());
    }
}
