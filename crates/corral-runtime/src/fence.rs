//! Network fencing of containers.
//!
//! Rule management lives outside this workspace; the runtime only needs to
//! ask for a container's fence to be put up and torn down, and to forward
//! inbound and outbound rules.

use corral_common::error::Result;
use corral_common::types::Handle;
use corral_pool::Subnet;

/// An inbound port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetIn {
    /// Port on the host.
    pub host_port: u32,
    /// Port inside the container.
    pub container_port: u32,
}

/// An outbound allow rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetOut {
    /// Destination network in CIDR notation.
    pub network: String,
    /// Destination port, or every port when `None`.
    pub port: Option<u16>,
}

/// Configures network isolation for containers.
pub trait NetworkFencer: Send + Sync + std::fmt::Debug {
    /// Puts up the fence for a freshly started container.
    ///
    /// # Errors
    ///
    /// Returns an error if the fence cannot be configured.
    fn setup(&self, handle: &Handle, subnet: Subnet) -> Result<()>;

    /// Removes the fence of a destroyed container.
    ///
    /// # Errors
    ///
    /// Returns an error if the fence cannot be removed.
    fn teardown(&self, handle: &Handle, subnet: Subnet) -> Result<()>;

    /// Maps a host port onto a container port.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be installed.
    fn net_in(&self, handle: &Handle, rule: NetIn) -> Result<()>;

    /// Allows outbound traffic to a destination.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be installed.
    fn net_out(&self, handle: &Handle, rule: &NetOut) -> Result<()>;
}

/// Fencer that records requests in the log and changes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFencer;

impl NetworkFencer for NoopFencer {
    fn setup(&self, handle: &Handle, subnet: Subnet) -> Result<()> {
        tracing::debug!(handle = %handle, subnet = %subnet, host_ip = %subnet.host_ip(), "fence setup skipped");
        Ok(())
    }

    fn teardown(&self, handle: &Handle, subnet: Subnet) -> Result<()> {
        tracing::debug!(handle = %handle, subnet = %subnet, "fence teardown skipped");
        Ok(())
    }

    fn net_in(&self, handle: &Handle, rule: NetIn) -> Result<()> {
        tracing::debug!(handle = %handle, host_port = rule.host_port, container_port = rule.container_port, "net-in skipped");
        Ok(())
    }

    fn net_out(&self, handle: &Handle, rule: &NetOut) -> Result<()> {
        tracing::debug!(handle = %handle, network = %rule.network, port = ?rule.port, "net-out skipped");
        Ok(())
    }
}
