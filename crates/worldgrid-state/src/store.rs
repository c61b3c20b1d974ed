//! StateStore: redb-backed state persistence for worldgrid.
//!
//! World records are read freely but only written through
//! [`StateStore::transactionally`]. The task tables back the durable
//! delayed-task queue in `worldgrid-tasks`. The store supports both on-disk
//! and in-memory backends (the latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const TASK_SEQUENCE: &str = "task_sequence";

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(WORLDS).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Worlds ─────────────────────────────────────────────────────

    /// Get a world record by id.
    pub fn get_world(&self, world_id: &str) -> StateResult<Option<WorldRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORLDS).map_err(map_err!(Table))?;
        match table.get(world_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: WorldRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all world records, most recently updated first.
    pub fn list_worlds(&self) -> StateResult<Vec<WorldRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORLDS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: WorldRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        results.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(results)
    }

    /// Read-modify-write a world record atomically.
    ///
    /// `f` receives the current record, or [`WorldRecord::empty`] when none
    /// exists, and returns the record to commit. Returning an error aborts
    /// the transaction and leaves the stored record untouched. The store
    /// stamps `created_at` once and keeps `updated_at` non-decreasing.
    pub fn transactionally<F, E>(&self, world_id: &str, f: F) -> Result<WorldRecord, E>
    where
        F: FnOnce(WorldRecord) -> Result<WorldRecord, E>,
        E: From<StateError>,
    {
        self.run_world_transaction(world_id, f)?
    }

    fn run_world_transaction<F, E>(
        &self,
        world_id: &str,
        f: F,
    ) -> StateResult<Result<WorldRecord, E>>
    where
        F: FnOnce(WorldRecord) -> Result<WorldRecord, E>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(WORLDS).map_err(map_err!(Table))?;
            let current = match table.get(world_id).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice::<WorldRecord>(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => WorldRecord::empty(world_id),
            };
            let created_at = current.created_at;
            let previous_update = current.updated_at;

            let mut next = match f(current) {
                Ok(next) => next,
                // Dropping the uncommitted transaction aborts it.
                Err(e) => return Ok(Err(e)),
            };

            if next.world_id != world_id {
                return Err(StateError::KeyMismatch {
                    expected: world_id.to_string(),
                    actual: next.world_id,
                });
            }

            let now = epoch_secs();
            next.created_at = if created_at == 0 { now } else { created_at };
            next.updated_at = now.max(previous_update);

            let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            table
                .insert(world_id, value.as_slice())
                .map_err(map_err!(Write))?;
            next
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%world_id, status = ?record.status, "world record committed");
        Ok(Ok(record))
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Persist a new task and return it with its assigned id.
    pub fn enqueue_task(
        &self,
        name: &str,
        params: BTreeMap<String, String>,
        due_at_ms: u64,
        now_ms: u64,
    ) -> StateResult<TaskRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let task = {
            let id = bump_sequence(&txn, TASK_SEQUENCE)?;
            let task = TaskRecord {
                id,
                name: name.to_string(),
                params,
                due_at_ms,
                attempts: 0,
                enqueued_at_ms: now_ms,
                last_error: None,
            };
            let value = serde_json::to_vec(&task).map_err(map_err!(Serialize))?;
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            tasks
                .insert(task.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            task
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = task.id, name = %task.name, due_at_ms, "task enqueued");
        Ok(task)
    }

    /// Get a queued task by id.
    pub fn get_task(&self, id: TaskId) -> StateResult<Option<TaskRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        match table.get(task_key(id).as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let task: TaskRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// List every queued task in enqueue order.
    pub fn list_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let task: TaskRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(task);
        }
        Ok(results)
    }

    /// Lease up to `limit` due tasks.
    ///
    /// Claimed tasks get `due_at_ms = now_ms + lease_ms`, so a task whose
    /// handler never reports back (crash, hang) becomes deliverable again
    /// once the lease expires.
    pub fn claim_due_tasks(
        &self,
        now_ms: u64,
        lease_ms: u64,
        limit: usize,
    ) -> StateResult<Vec<TaskRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed = {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let mut due = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                if due.len() >= limit {
                    break;
                }
                let (_, value) = entry.map_err(map_err!(Read))?;
                let task: TaskRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if task.due_at_ms <= now_ms {
                    due.push(task);
                }
            }
            for task in &due {
                let mut leased = task.clone();
                leased.due_at_ms = now_ms.saturating_add(lease_ms);
                let value = serde_json::to_vec(&leased).map_err(map_err!(Serialize))?;
                table
                    .insert(leased.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            due
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claimed)
    }

    /// Remove a finished task. Returns true if it was still queued.
    pub fn complete_task(&self, id: TaskId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            existed = table
                .remove(task_key(id).as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = id, existed, "task completed");
        Ok(existed)
    }

    /// Overwrite a queued task (new due time, attempt count, last error).
    pub fn reschedule_task(&self, task: &TaskRecord) -> StateResult<()> {
        let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            table
                .insert(task.table_key().as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Move a task from the queue to the dead-letter table.
    pub fn dead_letter_task(
        &self,
        task: &TaskRecord,
        reason: &str,
        now_ms: u64,
    ) -> StateResult<DeadLetter> {
        let letter = DeadLetter {
            task: task.clone(),
            reason: reason.to_string(),
            dead_at_ms: now_ms,
        };
        let value = serde_json::to_vec(&letter).map_err(map_err!(Serialize))?;
        let key = task.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            tasks.remove(key.as_str()).map_err(map_err!(Write))?;
            let mut dead = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
            dead.insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = task.id, %reason, "task dead-lettered");
        Ok(letter)
    }

    /// List dead-lettered tasks, oldest first.
    pub fn list_dead_letters(&self) -> StateResult<Vec<DeadLetter>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEAD_LETTERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let letter: DeadLetter =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(letter);
        }
        Ok(results)
    }
}

fn bump_sequence(txn: &WriteTransaction, name: &str) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
