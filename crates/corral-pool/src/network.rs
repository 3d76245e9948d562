//! Network pool handing one `/30` subnet to each container.
//!
//! Within a subnet the first usable address belongs to the host side of the
//! container's veth pair and the second to the container side.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use corral_common::constants::SUBNET_PREFIX;
use corral_common::error::{CorralError, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// Addresses per container subnet.
const SUBNET_SIZE: u32 = 1 << (32 - SUBNET_PREFIX);

/// A container's `/30` subnet, identified by its network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet(Ipv4Addr);

impl Subnet {
    /// Network address of the subnet.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.0
    }

    /// Address of the host end of the container's link.
    #[must_use]
    pub fn host_ip(&self) -> Ipv4Addr {
        self.offset(1)
    }

    /// Address of the container end of the link.
    #[must_use]
    pub fn container_ip(&self) -> Ipv4Addr {
        self.offset(2)
    }

    /// Broadcast address of the subnet.
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        self.offset(SUBNET_SIZE - 1)
    }

    fn offset(&self, n: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.0) + n)
    }

    fn from_index(base: Ipv4Addr, index: u32) -> Self {
        Self(Ipv4Addr::from(u32::from(base) + index * SUBNET_SIZE))
    }
}

impl FromStr for Subnet {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        let network: Ipv4Network = s.parse().map_err(|e| CorralError::Config {
            message: format!("malformed subnet {s}: {e}"),
        })?;
        if network.prefix() != SUBNET_PREFIX || network.ip() != network.network() {
            return Err(CorralError::Config {
                message: format!("{s} is not a /{SUBNET_PREFIX} network address"),
            });
        }
        Ok(Self(network.ip()))
    }
}

impl TryFrom<String> for Subnet {
    type Error = CorralError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(value: Subnet) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{SUBNET_PREFIX}", self.0)
    }
}

/// Hands out `/30` subnets of a configured CIDR block.
#[derive(Debug, Clone)]
pub struct NetworkPool {
    base: Ipv4Network,
    count: u32,
    free: VecDeque<u32>,
    issued: BTreeSet<u32>,
}

impl NetworkPool {
    /// Builds a pool from a CIDR such as `10.254.0.0/22`.
    ///
    /// Host bits in the address are ignored.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the CIDR is malformed or too small to hold
    /// a single `/30`.
    pub fn new(cidr: &str) -> Result<Self> {
        let parsed: Ipv4Network = cidr.parse().map_err(|e| CorralError::Config {
            message: format!("malformed network pool {cidr}: {e}"),
        })?;
        if parsed.prefix() > SUBNET_PREFIX {
            return Err(CorralError::Config {
                message: format!("network pool {cidr} is smaller than one /{SUBNET_PREFIX}"),
            });
        }
        let base = Ipv4Network::new(parsed.network(), parsed.prefix()).map_err(|e| {
            CorralError::Config {
                message: format!("malformed network pool {cidr}: {e}"),
            }
        })?;
        let count = 1u32 << (SUBNET_PREFIX - base.prefix());
        Ok(Self {
            base,
            count,
            free: (0..count).collect(),
            issued: BTreeSet::new(),
        })
    }

    /// Total number of subnets.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.count as usize
    }

    /// Number of subnets not currently issued.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Currently free subnets, ordered by address.
    #[must_use]
    pub fn free_subnets(&self) -> Vec<Subnet> {
        let mut indices: Vec<_> = self.free.iter().copied().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .map(|i| Subnet::from_index(self.base.network(), i))
            .collect()
    }

    /// Issues the next free subnet, or `None` when exhausted.
    pub fn acquire(&mut self) -> Option<Subnet> {
        let index = self.free.pop_front()?;
        let _ = self.issued.insert(index);
        Some(Subnet::from_index(self.base.network(), index))
    }

    /// Checks that `subnet` belongs to the pool and is free.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the subnet lies outside the pool and
    /// `ResourceConflict` if it is already issued.
    pub fn check_free(&self, subnet: Subnet) -> Result<()> {
        let index = self.index_of(subnet)?;
        if self.issued.contains(&index) {
            return Err(CorralError::ResourceConflict {
                message: format!("subnet {subnet} is already in use"),
            });
        }
        Ok(())
    }

    /// Marks a specific subnet as issued.
    ///
    /// # Errors
    ///
    /// As for [`NetworkPool::check_free`].
    pub fn reserve(&mut self, subnet: Subnet) -> Result<()> {
        self.check_free(subnet)?;
        let index = self.index_of(subnet)?;
        self.free.retain(|&i| i != index);
        let _ = self.issued.insert(index);
        Ok(())
    }

    /// Returns a subnet to the pool. Returns `false`, changing nothing, if it
    /// was not issued by this pool.
    pub fn release(&mut self, subnet: Subnet) -> bool {
        let Ok(index) = self.index_of(subnet) else {
            return false;
        };
        if !self.issued.remove(&index) {
            return false;
        }
        self.free.push_back(index);
        true
    }

    /// Returns whether `subnet` is currently issued.
    #[must_use]
    pub fn is_issued(&self, subnet: Subnet) -> bool {
        self.index_of(subnet)
            .is_ok_and(|index| self.issued.contains(&index))
    }

    fn index_of(&self, subnet: Subnet) -> Result<u32> {
        if !self.base.contains(subnet.network()) {
            return Err(CorralError::Config {
                message: format!("subnet {subnet} is outside the pool {}", self.base),
            });
        }
        Ok((u32::from(subnet.network()) - u32::from(self.base.network())) / SUBNET_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_22_holds_256_subnets() {
        let pool = NetworkPool::new("10.254.0.0/22").unwrap();
        assert_eq!(pool.capacity(), 256);
    }

    #[test]
    fn slash_30_holds_exactly_one() {
        let mut pool = NetworkPool::new("10.254.0.0/30").unwrap();
        let subnet = pool.acquire().unwrap();
        assert_eq!(subnet.to_string(), "10.254.0.0/30");
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn subnet_addresses() {
        let subnet: Subnet = "10.254.0.4/30".parse().unwrap();
        assert_eq!(subnet.host_ip(), Ipv4Addr::new(10, 254, 0, 5));
        assert_eq!(subnet.container_ip(), Ipv4Addr::new(10, 254, 0, 6));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(10, 254, 0, 7));
    }

    #[test]
    fn too_small_or_malformed_cidr_is_rejected() {
        assert!(matches!(
            NetworkPool::new("10.254.0.0/31"),
            Err(CorralError::Config { .. })
        ));
        assert!(matches!(
            NetworkPool::new("not-a-cidr"),
            Err(CorralError::Config { .. })
        ));
    }

    #[test]
    fn host_bits_in_pool_are_ignored() {
        let mut pool = NetworkPool::new("10.0.0.9/29").unwrap();
        assert_eq!(pool.acquire().unwrap().to_string(), "10.0.0.8/30");
    }

    #[test]
    fn subnet_must_be_aligned_slash_30() {
        assert!("10.0.0.1/30".parse::<Subnet>().is_err());
        assert!("10.0.0.0/29".parse::<Subnet>().is_err());
    }

    #[test]
    fn reserve_outside_pool_is_rejected() {
        let mut pool = NetworkPool::new("10.254.0.0/29").unwrap();
        let foreign: Subnet = "10.1.0.0/30".parse().unwrap();
        assert!(matches!(pool.reserve(foreign), Err(CorralError::Config { .. })));
    }

    #[test]
    fn reserve_then_acquire_skips_it() {
        let mut pool = NetworkPool::new("10.254.0.0/29").unwrap();
        pool.reserve("10.254.0.0/30".parse().unwrap()).unwrap();
        assert_eq!(pool.acquire().unwrap().to_string(), "10.254.0.4/30");
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn subnet_serializes_as_cidr_string() {
        let subnet: Subnet = "10.254.0.8/30".parse().unwrap();
        let json = serde_json::to_string(&subnet).unwrap();
        assert_eq!(json, "\"10.254.0.8/30\"");
        let back: Subnet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, subnet);
    }
}
