//! The tuple of resources bound to one container.

use corral_common::types::Handle;
use serde::{Deserialize, Serialize};

use crate::network::Subnet;
use crate::range::IdRange;

/// Resources issued to one container.
///
/// This is also the serialized form persisted in snapshots and fed back to
/// [`ResourcePool::restore`](crate::ResourcePool::restore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Container the resources belong to.
    pub handle: Handle,
    /// User ids; the first is the host uid of container root.
    pub uids: IdRange,
    /// The container's `/30`.
    pub network: Subnet,
    /// Host ports for mapped container ports.
    pub ports: IdRange,
}

/// What the caller asks the pool for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquireSpec {
    /// Requested handle; `None` generates one.
    pub handle: Option<Handle>,
    /// Specific subnet; `None` takes any free one.
    pub network: Option<Subnet>,
    /// Specific first uid; `None` takes any free block.
    pub uid: Option<u32>,
}

impl AcquireSpec {
    /// Asks for any resources under the given handle.
    #[must_use]
    pub fn for_handle(handle: impl Into<Handle>) -> Self {
        Self {
            handle: Some(handle.into()),
            ..Self::default()
        }
    }
}
