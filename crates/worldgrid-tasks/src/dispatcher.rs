//! Dispatcher: leases due tasks, runs handlers, applies retry policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use worldgrid_state::{StateStore, TaskRecord};

use crate::error::{TaskError, TaskResult};
use crate::handler::{TaskHandler, TaskOutcome, TaskParams};
use crate::queue::epoch_millis;
use crate::retry::RetryPolicy;
use crate::router::TaskRouter;

/// What happened to a task after one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Completed,
    /// Redelivery scheduled at the given time.
    Retrying { attempts: u32, due_at_ms: u64 },
    DeadLettered { reason: String },
}

/// Counts from one [`Dispatcher::dispatch_due`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub completed: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    /// Deliveries whose outcome could not be recorded.
    pub errors: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: StateStore,
    router: Arc<TaskRouter>,
    policy: RetryPolicy,
    lease: Duration,
    batch_size: usize,
}

impl Dispatcher {
    pub fn new(
        store: StateStore,
        router: Arc<TaskRouter>,
        policy: RetryPolicy,
        lease: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            router,
            policy,
            lease,
            batch_size: batch_size.max(1),
        }
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run a handler directly, outside the queue (externally delivered task).
    pub async fn handle_now(&self, name: &str, params: &TaskParams) -> TaskResult<TaskOutcome> {
        let handler = self
            .router
            .get(name)
            .ok_or_else(|| TaskError::UnknownRoute(name.to_string()))?;
        Ok(handler.handle(params).await)
    }

    /// Deliver one leased task and record its outcome.
    pub async fn deliver(&self, task: TaskRecord, now_ms: u64) -> TaskResult<DeliveryResult> {
        let Some(handler) = self.router.get(&task.name) else {
            let reason = format!("no handler registered for {:?}", task.name);
            warn!(task_id = task.id, name = %task.name, "unroutable task");
            self.store.dead_letter_task(&task, &reason, now_ms)?;
            return Ok(DeliveryResult::DeadLettered { reason });
        };
        let outcome = handler.handle(&task.params).await;
        debug!(task_id = task.id, name = %task.name, %outcome, "task delivered");
        self.apply(handler.as_ref(), task, outcome, now_ms)
    }

    fn apply(
        &self,
        handler: &dyn TaskHandler,
        mut task: TaskRecord,
        outcome: TaskOutcome,
        now_ms: u64,
    ) -> TaskResult<DeliveryResult> {
        match outcome {
            TaskOutcome::Done => {
                self.store.complete_task(task.id)?;
                Ok(DeliveryResult::Completed)
            }
            TaskOutcome::Rejected(_) | TaskOutcome::NotFound(_) => {
                let reason = outcome.to_string();
                warn!(task_id = task.id, name = %task.name, %reason, "task dead-lettered without retry");
                self.store.dead_letter_task(&task, &reason, now_ms)?;
                handler.dead_lettered(&task.params, &reason);
                Ok(DeliveryResult::DeadLettered { reason })
            }
            TaskOutcome::Pending | TaskOutcome::Failed(_) => {
                task.attempts += 1;
                task.last_error = match &outcome {
                    TaskOutcome::Failed(reason) => Some(reason.clone()),
                    _ => None,
                };
                if self.policy.is_exhausted(task.attempts) {
                    let reason = format!(
                        "gave up after {} attempts (last outcome: {outcome})",
                        task.attempts
                    );
                    error!(task_id = task.id, name = %task.name, attempts = task.attempts, "task exhausted retries");
                    self.store.dead_letter_task(&task, &reason, now_ms)?;
                    handler.dead_lettered(&task.params, &reason);
                    return Ok(DeliveryResult::DeadLettered { reason });
                }
                let delay = self.policy.delay_for(task.attempts);
                task.due_at_ms = now_ms.saturating_add(delay.as_millis() as u64);
                self.store.reschedule_task(&task)?;
                Ok(DeliveryResult::Retrying {
                    attempts: task.attempts,
                    due_at_ms: task.due_at_ms,
                })
            }
        }
    }

    /// Lease every task due at `now_ms` (up to the batch size) and deliver
    /// them concurrently.
    pub async fn dispatch_due(&self, now_ms: u64) -> TaskResult<DispatchReport> {
        let lease_ms = self.lease.as_millis() as u64;
        let due = self
            .store
            .claim_due_tasks(now_ms, lease_ms, self.batch_size)?;
        let mut report = DispatchReport {
            delivered: due.len(),
            ..DispatchReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let mut set = JoinSet::new();
        for task in due {
            let this = self.clone();
            set.spawn(async move {
                let task_id = task.id;
                (task_id, this.deliver(task, now_ms).await)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(DeliveryResult::Completed))) => report.completed += 1,
                Ok((_, Ok(DeliveryResult::Retrying { .. }))) => report.retrying += 1,
                Ok((_, Ok(DeliveryResult::DeadLettered { .. }))) => report.dead_lettered += 1,
                Ok((task_id, Err(e))) => {
                    // The lease expires and the task is delivered again.
                    error!(task_id, error = %e, "failed to record task outcome");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "task delivery panicked");
                    report.errors += 1;
                }
            }
        }

        info!(
            delivered = report.delivered,
            completed = report.completed,
            retrying = report.retrying,
            dead_lettered = report.dead_lettered,
            "dispatch pass finished"
        );
        Ok(report)
    }

    /// Run the dispatch loop until shutdown is signalled.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_ms = interval.as_millis() as u64,
            routes = ?self.router.names(),
            "task dispatcher started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.dispatch_due(epoch_millis()).await {
                        error!(error = %e, "task dispatch failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("task dispatcher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::handler::{TaskFuture, TaskHandler};

    /// Replays a scripted list of outcomes, then reports `Done`.
    struct Scripted {
        outcomes: Mutex<VecDeque<TaskOutcome>>,
        calls: Mutex<Vec<TaskParams>>,
        released: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<TaskOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl TaskHandler for Scripted {
        fn handle<'a>(&'a self, params: &'a TaskParams) -> TaskFuture<'a> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(params.clone());
                self.outcomes
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(TaskOutcome::Done)
            })
        }

        fn dead_lettered(&self, _params: &TaskParams, reason: &str) {
            self.released.lock().unwrap().push(reason.to_string());
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(30),
            multiplier: 2,
            max_delay: Duration::from_secs(600),
            max_attempts,
        }
    }

    fn dispatcher(store: &StateStore, handler: Arc<Scripted>, max_attempts: u32) -> Dispatcher {
        let router = TaskRouter::new().route("reconcile", handler);
        Dispatcher::new(
            store.clone(),
            Arc::new(router),
            policy(max_attempts),
            Duration::from_secs(120),
            16,
        )
    }

    fn params() -> TaskParams {
        let mut p = TaskParams::new();
        p.insert("operation".to_string(), "op-1".to_string());
        p
    }

    #[tokio::test]
    async fn done_removes_task() {
        let store = StateStore::open_in_memory().unwrap();
        let handler = Scripted::new(vec![TaskOutcome::Done]);
        let d = dispatcher(&store, handler.clone(), 5);
        store.enqueue_task("reconcile", params(), 0, 0).unwrap();

        let report = d.dispatch_due(1_000).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(store.list_tasks().unwrap().is_empty());
        assert_eq!(handler.calls.lock().unwrap()[0]["operation"], "op-1");
    }

    #[tokio::test]
    async fn pending_backs_off_exponentially_then_completes() {
        let store = StateStore::open_in_memory().unwrap();
        let handler = Scripted::new(vec![TaskOutcome::Pending, TaskOutcome::Pending]);
        let d = dispatcher(&store, handler.clone(), 5);
        store.enqueue_task("reconcile", params(), 0, 0).unwrap();

        d.dispatch_due(1_000).await.unwrap();
        let task = &store.list_tasks().unwrap()[0];
        assert_eq!(task.attempts, 1);
        assert_eq!(task.due_at_ms, 31_000);

        // Not due yet.
        assert_eq!(d.dispatch_due(30_000).await.unwrap().delivered, 0);

        d.dispatch_due(31_000).await.unwrap();
        let task = &store.list_tasks().unwrap()[0];
        assert_eq!(task.attempts, 2);
        assert_eq!(task.due_at_ms, 91_000);

        let report = d.dispatch_due(91_000).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn failures_dead_letter_after_max_attempts() {
        let store = StateStore::open_in_memory().unwrap();
        let handler = Scripted::new(vec![
            TaskOutcome::Failed("provider down".into()),
            TaskOutcome::Failed("provider down".into()),
        ]);
        let d = dispatcher(&store, handler, 2);
        let task = store.enqueue_task("reconcile", params(), 0, 0).unwrap();

        let first = d
            .deliver(store.get_task(task.id).unwrap().unwrap(), 0)
            .await
            .unwrap();
        assert!(matches!(first, DeliveryResult::Retrying { attempts: 1, .. }));
        assert_eq!(
            store.get_task(task.id).unwrap().unwrap().last_error.as_deref(),
            Some("provider down")
        );

        let second = d
            .deliver(store.get_task(task.id).unwrap().unwrap(), 0)
            .await
            .unwrap();
        assert!(matches!(second, DeliveryResult::DeadLettered { .. }));
        assert!(store.list_tasks().unwrap().is_empty());
        let letters = store.list_dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].task.attempts, 2);
    }

    #[tokio::test]
    async fn handler_is_told_when_its_task_is_dead_lettered() {
        let store = StateStore::open_in_memory().unwrap();
        let handler = Scripted::new(vec![
            TaskOutcome::Pending,
            TaskOutcome::Rejected("bad key".into()),
        ]);
        let d = dispatcher(&store, handler.clone(), 1);
        store.enqueue_task("reconcile", params(), 0, 0).unwrap();
        store.enqueue_task("reconcile", params(), 0, 0).unwrap();

        let report = d.dispatch_due(1).await.unwrap();
        assert_eq!(report.dead_lettered, 2);
        let mut released = handler.released.lock().unwrap().clone();
        released.sort();
        assert_eq!(released.len(), 2);
        assert!(released[0].starts_with("gave up after 1 attempts"));
        assert_eq!(released[1], "rejected: bad key");
    }

    #[tokio::test]
    async fn completed_tasks_release_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let handler = Scripted::new(vec![TaskOutcome::Done]);
        let d = dispatcher(&store, handler.clone(), 1);
        store.enqueue_task("reconcile", params(), 0, 0).unwrap();

        d.dispatch_due(1).await.unwrap();
        assert!(handler.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_and_not_found_are_dead_lettered_immediately() {
        let store = StateStore::open_in_memory().unwrap();
        let handler = Scripted::new(vec![
            TaskOutcome::Rejected("bad key".into()),
            TaskOutcome::NotFound("alpha".into()),
        ]);
        let d = dispatcher(&store, handler, 10);
        store.enqueue_task("reconcile", params(), 0, 0).unwrap();
        store.enqueue_task("reconcile", params(), 0, 0).unwrap();

        let report = d.dispatch_due(1).await.unwrap();
        assert_eq!(report.dead_lettered, 2);
        assert!(store.list_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_route_is_dead_lettered() {
        let store = StateStore::open_in_memory().unwrap();
        let d = dispatcher(&store, Scripted::new(vec![]), 10);
        store.enqueue_task("mystery", params(), 0, 0).unwrap();

        let report = d.dispatch_due(1).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert!(store.list_dead_letters().unwrap()[0].reason.contains("mystery"));

        let err = d.handle_now("mystery", &params()).await.unwrap_err();
        assert!(matches!(err, TaskError::UnknownRoute(_)));
    }

    #[tokio::test]
    async fn tasks_survive_restart_and_are_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.enqueue_task("reconcile", params(), 500, 0).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let handler = Scripted::new(vec![]);
        let d = dispatcher(&store, handler.clone(), 5);
        let report = d.dispatch_due(1_000).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let d = dispatcher(&store, Scripted::new(vec![]), 5);
        let (tx, rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(async move { d.run(Duration::from_millis(10), rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
