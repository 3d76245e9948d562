//! The container abstraction shared by every container pool.

use std::fmt;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use corral_common::error::Result;
use corral_common::types::{ContainerState, Handle, ProcessSpec, Properties, TtySpec};
use corral_daemon::client::Process;
use serde::Serialize;

/// Point-in-time description of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    /// Container handle.
    pub handle: Handle,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Host end of the container's link.
    pub host_ip: Ipv4Addr,
    /// Container end of the link.
    pub container_ip: Ipv4Addr,
    /// Depot directory of the container.
    pub container_path: PathBuf,
    /// Labels attached at creation.
    pub properties: Properties,
    /// Pids of processes started through the host, ascending.
    pub process_ids: Vec<i32>,
    /// When the container was created.
    pub created_at: DateTime<Utc>,
}

/// A live container.
///
/// Implementations are shared between the repository and callers, so every
/// method takes `&self` and synchronizes internally.
pub trait Container: Send + Sync + fmt::Debug {
    /// Unique handle.
    fn handle(&self) -> &Handle;

    /// Labels attached at creation.
    fn properties(&self) -> Properties;

    /// Idle time after which the container may be reclaimed.
    fn grace_time(&self) -> Option<Duration>;

    /// Current lifecycle state.
    fn state(&self) -> ContainerState;

    /// Starts the container's init process and waits until it is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if init cannot be started or does not report
    /// readiness in time.
    fn start(&self) -> Result<()>;

    /// Stops every process in the container. With `kill` processes are
    /// killed immediately instead of being asked to terminate first.
    ///
    /// # Errors
    ///
    /// Returns an error if the init process cannot be signalled.
    fn stop(&self, kill: bool) -> Result<()>;

    /// Describes the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the description cannot be assembled.
    fn info(&self) -> Result<ContainerInfo>;

    /// Writes everything needed to restore the container after a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    fn snapshot(&self, out: &mut dyn Write) -> Result<()>;

    /// Detaches host-side helpers ahead of a host shutdown, leaving the
    /// container itself running.
    ///
    /// # Errors
    ///
    /// Returns an error if a helper cannot be detached.
    fn cleanup(&self) -> Result<()>;

    /// Runs a program inside the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is not active or the daemon
    /// cannot start the program.
    fn run(&self, spec: &ProcessSpec, tty: Option<TtySpec>) -> Result<Box<dyn Process>>;

    /// Blocks until a process started in the container exits and returns
    /// its exit status.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is unknown to the container.
    fn attach(&self, pid: i32) -> Result<i32>;
}
