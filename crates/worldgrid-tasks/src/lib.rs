//! worldgrid-tasks: durable delayed task queue.
//!
//! Tasks are named, carry flat string parameters, and live in the
//! `worldgrid-state` task table until a handler reports them done. Delivery
//! is at-least-once and unordered:
//!
//! - [`TaskQueue`] enqueues a task with a delay.
//! - [`TaskRouter`] maps task names to [`TaskHandler`]s, built once.
//! - [`Dispatcher`] leases due tasks, runs their handlers concurrently and
//!   applies the [`RetryPolicy`] to whatever they report.
//!
//! A handler never loops waiting for an external condition; it returns
//! [`TaskOutcome::Pending`] and the dispatcher redelivers later.

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod queue;
pub mod retry;
pub mod router;

pub use dispatcher::{DeliveryResult, DispatchReport, Dispatcher};
pub use error::{TaskError, TaskResult};
pub use handler::{TaskFuture, TaskHandler, TaskOutcome, TaskParams};
pub use queue::{TaskQueue, epoch_millis};
pub use retry::RetryPolicy;
pub use router::TaskRouter;
