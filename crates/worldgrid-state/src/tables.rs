//! redb table definitions for the worldgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types), except `META` which holds plain counters.

use redb::TableDefinition;

/// World lifecycle records keyed by `{world_id}`.
pub const WORLDS: TableDefinition<&str, &[u8]> = TableDefinition::new("worlds");

/// Queued delayed tasks keyed by `{id:020}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Tasks that exhausted their attempts, keyed by `{id:020}`.
pub const DEAD_LETTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("dead_letters");

/// Monotonic counters keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
