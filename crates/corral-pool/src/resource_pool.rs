//! The resource pool: uid, network and port allocators behind one lock.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::sync::{Mutex, MutexGuard, PoisonError};

use corral_common::config::PoolConfig;
use corral_common::error::{CorralError, Result};
use corral_common::types::Handle;

use crate::allocation::{AcquireSpec, Allocation};
use crate::network::{NetworkPool, Subnet};
use crate::range::{IdRange, RangePool};

/// Free blocks of every allocator at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeSet {
    /// Free uid blocks, ordered by start.
    pub uids: Vec<IdRange>,
    /// Free subnets, ordered by address.
    pub networks: Vec<Subnet>,
    /// Free port blocks, ordered by start.
    pub ports: Vec<IdRange>,
}

#[derive(Debug)]
struct PoolState {
    uids: RangePool,
    network: NetworkPool,
    ports: RangePool,
    allocations: BTreeMap<Handle, Allocation>,
}

impl PoolState {
    fn reserve_uids(&mut self, uid: Option<u32>) -> Result<IdRange> {
        match uid {
            Some(start) => self.uids.acquire_at(start),
            None => self
                .uids
                .acquire()
                .ok_or(CorralError::ResourceExhausted { resource: "uid" }),
        }
    }

    fn reserve_network(&mut self, subnet: Option<Subnet>) -> Result<Subnet> {
        match subnet {
            Some(subnet) => self.network.reserve(subnet).map(|()| subnet),
            None => self
                .network
                .acquire()
                .ok_or(CorralError::ResourceExhausted { resource: "network" }),
        }
    }

    fn release_parts(&mut self, allocation: &Allocation) {
        let _ = self.uids.release(allocation.uids);
        let _ = self.network.release(allocation.network);
        let _ = self.ports.release(allocation.ports);
    }
}

/// Allocates per-container resources and tracks which handle owns them.
///
/// Every operation takes the same lock for the duration of the bookkeeping
/// only, so concurrent callers never observe a half-issued allocation.
#[derive(Debug)]
pub struct ResourcePool {
    inner: Mutex<PoolState>,
}

impl ResourcePool {
    /// Builds the pool from its configured bounds.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if any of the three ranges is invalid.
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let state = PoolState {
            uids: RangePool::new("uid", config.uids)?,
            network: NetworkPool::new(&config.network)?,
            ports: RangePool::new("port", config.ports)?,
            allocations: BTreeMap::new(),
        };
        tracing::debug!(
            uids = state.uids.capacity(),
            networks = state.network.capacity(),
            ports = state.ports.capacity(),
            "resource pool ready"
        );
        Ok(Self {
            inner: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a uid block, a subnet and a port block under one handle.
    ///
    /// Parts are reserved in that order; if a later part fails the earlier
    /// ones are returned before the error is reported.
    ///
    /// # Errors
    ///
    /// - `InvalidHandle` if the handle is not a single path entry. An empty
    ///   handle is replaced by a generated one.
    /// - `HandleExists` if the handle already owns an allocation.
    /// - `ResourceExhausted` naming the first allocator with no free block.
    /// - `ResourceConflict` if a requested uid or subnet is already issued.
    /// - `Config` if a requested uid or subnet lies outside the pool.
    pub fn acquire(&self, spec: &AcquireSpec) -> Result<Allocation> {
        let handle = match &spec.handle {
            Some(handle) if !handle.as_str().is_empty() => handle.clone(),
            _ => Handle::generate(),
        };
        handle.validate()?;

        let mut state = self.state();
        if state.allocations.contains_key(&handle) {
            return Err(CorralError::HandleExists {
                handle: handle.to_string(),
            });
        }

        let uids = state.reserve_uids(spec.uid)?;
        let network = match state.reserve_network(spec.network) {
            Ok(network) => network,
            Err(e) => {
                let _ = state.uids.release(uids);
                return Err(e);
            }
        };
        let Some(ports) = state.ports.acquire() else {
            let _ = state.uids.release(uids);
            let _ = state.network.release(network);
            return Err(CorralError::ResourceExhausted { resource: "port" });
        };

        let allocation = Allocation {
            handle: handle.clone(),
            uids,
            network,
            ports,
        };
        let _ = state.allocations.insert(handle, allocation.clone());
        tracing::info!(
            handle = %allocation.handle,
            uids = %allocation.uids,
            network = %allocation.network,
            ports = %allocation.ports,
            "acquired resources"
        );
        Ok(allocation)
    }

    /// Returns every part of `allocation` to the pool.
    ///
    /// # Errors
    ///
    /// Returns `DoubleRelease` when `allocation` is not currently issued;
    /// the pool is left untouched in that case.
    pub fn release(&self, allocation: &Allocation) -> Result<()> {
        let mut state = self.state();
        if state.allocations.get(&allocation.handle) != Some(allocation) {
            tracing::error!(handle = %allocation.handle, "releasing an allocation that is not issued");
            return Err(CorralError::DoubleRelease {
                handle: allocation.handle.to_string(),
            });
        }
        let _ = state.allocations.remove(&allocation.handle);
        state.release_parts(allocation);
        tracing::info!(handle = %allocation.handle, "released resources");
        Ok(())
    }

    /// Decodes a serialized [`Allocation`] and marks it issued again.
    ///
    /// # Errors
    ///
    /// `Serialization` on malformed input, otherwise as for
    /// [`ResourcePool::restore_allocation`].
    pub fn restore(&self, reader: &mut dyn Read) -> Result<Allocation> {
        let allocation: Allocation = serde_json::from_reader(reader)?;
        self.restore_allocation(allocation)
    }

    /// Marks a previously issued allocation as issued again.
    ///
    /// Nothing is reserved unless every part is free.
    ///
    /// # Errors
    ///
    /// `InvalidHandle` if the handle is not a single path entry,
    /// `ResourceConflict` if the handle or any part is already issued,
    /// `Config` if a part is not a block of this pool.
    pub fn restore_allocation(&self, allocation: Allocation) -> Result<Allocation> {
        allocation.handle.validate()?;
        let mut state = self.state();
        if state.allocations.contains_key(&allocation.handle) {
            return Err(CorralError::ResourceConflict {
                message: format!("handle {} is already registered", allocation.handle),
            });
        }
        state.uids.check_free(allocation.uids)?;
        state.network.check_free(allocation.network)?;
        state.ports.check_free(allocation.ports)?;

        state.uids.reserve(allocation.uids)?;
        state.network.reserve(allocation.network)?;
        state.ports.reserve(allocation.ports)?;
        let _ = state
            .allocations
            .insert(allocation.handle.clone(), allocation.clone());
        tracing::info!(handle = %allocation.handle, network = %allocation.network, "restored resources");
        Ok(allocation)
    }

    /// Releases every allocation whose handle is not in `keep` and returns
    /// what was released.
    ///
    /// Meant to run once after all restores and before any new acquire.
    pub fn prune(&self, keep: &HashSet<Handle>) -> Vec<Allocation> {
        let mut state = self.state();
        let stale: Vec<Handle> = state
            .allocations
            .keys()
            .filter(|handle| !keep.contains(*handle))
            .cloned()
            .collect();

        let mut pruned = Vec::with_capacity(stale.len());
        for handle in stale {
            if let Some(allocation) = state.allocations.remove(&handle) {
                state.release_parts(&allocation);
                tracing::info!(handle = %handle, "pruned stale allocation");
                pruned.push(allocation);
            }
        }
        pruned
    }

    /// How many containers can hold resources at once.
    pub fn max_containers(&self) -> usize {
        let state = self.state();
        state
            .uids
            .capacity()
            .min(state.network.capacity())
            .min(state.ports.capacity())
    }

    /// The allocation owned by `handle`, if any.
    pub fn allocation(&self, handle: &Handle) -> Option<Allocation> {
        self.state().allocations.get(handle).cloned()
    }

    /// All issued allocations, ordered by handle.
    pub fn issued(&self) -> Vec<Allocation> {
        self.state().allocations.values().cloned().collect()
    }

    /// Currently free blocks of every allocator.
    pub fn free_set(&self) -> FreeSet {
        let state = self.state();
        FreeSet {
            uids: state.uids.free_blocks(),
            networks: state.network.free_subnets(),
            ports: state.ports.free_blocks(),
        }
    }
}
