use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;
use worldgrid_state::{StateStore, TaskRecord};

use crate::error::TaskResult;
use crate::handler::TaskParams;

/// Enqueue side of the delayed task queue.
#[derive(Clone)]
pub struct TaskQueue {
    store: StateStore,
}

impl TaskQueue {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Persist a task that becomes deliverable after `delay`.
    pub fn enqueue(&self, name: &str, params: TaskParams, delay: Duration) -> TaskResult<TaskRecord> {
        let now = epoch_millis();
        let due_at_ms = now.saturating_add(delay.as_millis() as u64);
        let task = self.store.enqueue_task(name, params, due_at_ms, now)?;
        info!(task_id = task.id, name, delay_secs = delay.as_secs(), "task enqueued");
        Ok(task)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
