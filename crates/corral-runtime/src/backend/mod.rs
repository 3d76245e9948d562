//! Backend abstraction over container pools.

pub mod linux;
pub mod routing;

use std::collections::BTreeMap;
use std::sync::Arc;

use corral_common::error::Result;
use corral_common::types::{Capacity, ContainerSpec, Handle, Properties};

use crate::container::{Container, ContainerInfo};

pub use linux::LinuxBackend;
pub use routing::{RoutePredicate, RoutingBackend};

/// Per-handle outcome of [`Backend::bulk_info`].
pub type BulkInfo = BTreeMap<Handle, Result<ContainerInfo>>;

/// The host-facing surface for managing containers.
///
/// Implementors handle the lifecycle across host restarts: `start` picks
/// up containers left by a previous run and `stop` leaves them restorable.
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Prepares the host. Runs once before [`Backend::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if host prerequisites cannot be established.
    fn setup(&self) -> Result<()>;

    /// Restores containers from a previous run and reclaims whatever they
    /// no longer hold.
    ///
    /// # Errors
    ///
    /// Returns an error if snapshots cannot be listed or pruning fails.
    /// Individual snapshots that fail to restore are skipped.
    fn start(&self) -> Result<()>;

    /// Snapshots every container so a later [`Backend::start`] can restore
    /// it.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while writing snapshots.
    fn stop(&self) -> Result<()>;

    /// Checks that the backend is usable.
    ///
    /// # Errors
    ///
    /// Returns an error describing why the backend is unhealthy.
    fn ping(&self) -> Result<()>;

    /// Reports host totals and the container limit.
    ///
    /// # Errors
    ///
    /// Returns an error if host totals cannot be read.
    fn capacity(&self) -> Result<Capacity>;

    /// Creates and starts a container.
    ///
    /// # Errors
    ///
    /// Returns `HandleExists` for a registered handle, a resource error if
    /// the pool cannot satisfy the request, or the start failure.
    fn create(&self, spec: &ContainerSpec) -> Result<Arc<dyn Container>>;

    /// Destroys a container and releases its resources.
    ///
    /// # Errors
    ///
    /// Returns `ContainerNotFound` for an unknown handle.
    fn destroy(&self, handle: &Handle) -> Result<()>;

    /// Looks a container up by handle.
    ///
    /// # Errors
    ///
    /// Returns `ContainerNotFound` for an unknown handle.
    fn lookup(&self, handle: &Handle) -> Result<Arc<dyn Container>>;

    /// Every container whose properties contain all pairs of `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the containers cannot be listed.
    fn containers(&self, filter: &Properties) -> Result<Vec<Arc<dyn Container>>>;

    /// Describes several containers at once. Failures are reported per
    /// handle and never fail the whole call.
    fn bulk_info(&self, handles: &[Handle]) -> BulkInfo;
}
