//! worldgrid-state: embedded state store for worldgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for world lifecycle records and the delayed task queue.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! World records are keyed by world id; tasks by a zero-padded sequence
//! number so a full scan returns them in enqueue order.
//!
//! World records can only be mutated through
//! [`StateStore::transactionally`], which runs a read-modify-write inside a
//! single redb write transaction and stamps the record's timestamps.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
