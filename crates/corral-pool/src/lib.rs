//! # corral-pool
//!
//! Hands out and reclaims the scarce per-container resources: a block of
//! user ids, a `/30` network subnet, and a block of host ports.
//!
//! - [`RangePool`](range::RangePool): fixed-size blocks over a numeric range.
//! - [`NetworkPool`](network::NetworkPool): `/30` subnets over a CIDR.
//! - [`ResourcePool`](resource_pool::ResourcePool): the three allocators
//!   behind one lock, keyed by container handle, with restore and prune for
//!   recovering after a restart.
//!
//! Issued blocks from one allocator are pairwise disjoint at all times.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod allocation;
pub mod network;
pub mod range;
pub mod resource_pool;

pub use allocation::{AcquireSpec, Allocation};
pub use network::Subnet;
pub use range::IdRange;
pub use resource_pool::ResourcePool;
