//! worldgrid-provider: asynchronous compute provider client.
//!
//! Every mutating call returns an [`Operation`] immediately; the real work
//! completes later and is observed through [`ComputeProvider::get_operation`].
//!
//! Two implementations are provided:
//! - [`SimulatedProvider`]: an in-memory fleet with configurable completion
//!   latency, failure injection and a call log.
//! - [`HttpComputeProvider`]: a Compute Engine v1 shaped REST client over
//!   hyper HTTP/1.

use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod rest;
pub mod simulated;
pub mod types;

pub use error::{ProviderError, ProviderResult};
pub use rest::HttpComputeProvider;
pub use simulated::{ProviderCall, SimulatedProvider};
pub use types::*;

use worldgrid_core::OperationHandle;

/// Boxed future returned by provider calls.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = ProviderResult<T>> + Send + 'a>>;

/// The compute API the lifecycle layer drives.
///
/// Implementations must be cheap to share behind an `Arc`.
pub trait ComputeProvider: Send + Sync {
    /// List every instance in a zone.
    fn list_instances<'a>(&'a self, zone: &'a str) -> ProviderFuture<'a, Vec<Instance>>;

    /// Insert an instance. Repeating a call with the same `request_id`
    /// returns the original operation instead of creating a duplicate.
    fn insert_instance<'a>(
        &'a self,
        zone: &'a str,
        spec: &'a InstanceSpec,
        request_id: &'a str,
    ) -> ProviderFuture<'a, Operation>;

    fn start_instance<'a>(&'a self, zone: &'a str, name: &'a str)
    -> ProviderFuture<'a, Operation>;

    fn reset_instance<'a>(&'a self, zone: &'a str, name: &'a str)
    -> ProviderFuture<'a, Operation>;

    fn delete_instance<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> ProviderFuture<'a, Operation>;

    /// Snapshot a zonal disk into a global snapshot called `snapshot`.
    fn create_snapshot<'a>(
        &'a self,
        zone: &'a str,
        disk: &'a str,
        snapshot: &'a str,
    ) -> ProviderFuture<'a, Operation>;

    fn insert_disk<'a>(&'a self, zone: &'a str, spec: &'a DiskSpec)
    -> ProviderFuture<'a, Operation>;

    fn get_operation<'a>(
        &'a self,
        zone: &'a str,
        handle: &'a OperationHandle,
    ) -> ProviderFuture<'a, Operation>;
}
