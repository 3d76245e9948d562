//! System-wide constants and default paths.

/// Default directory holding one subdirectory per container.
pub const DEFAULT_DEPOT_DIR: &str = "/var/lib/corral/depot";

/// Default location of the in-container init binary.
pub const DEFAULT_INIT_BINARY: &str = "/usr/libexec/corral/corral-initd";

/// Default network pool; each container gets one `/30` from it.
pub const DEFAULT_NETWORK_POOL: &str = "10.254.0.0/22";

/// Prefix length of the subnet handed to each container.
pub const SUBNET_PREFIX: u8 = 30;

/// First uid handed out to containers.
pub const DEFAULT_UID_POOL_START: u32 = 10_000;

/// Number of uids available to containers.
pub const DEFAULT_UID_POOL_SIZE: u32 = 256;

/// First host port handed out to containers.
pub const DEFAULT_PORT_POOL_START: u32 = 61_001;

/// Number of host ports available to containers.
pub const DEFAULT_PORT_POOL_SIZE: u32 = 5_000;

/// Seconds the host waits for the init process to report readiness.
pub const DEFAULT_RENDEZVOUS_TIMEOUT_SECS: u64 = 30;

/// Seconds between `SIGTERM` and `SIGKILL` when stopping a container.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Descriptor number of the rendezvous write end inherited by init.
pub const SYNC_WRITER_FD: i32 = 4;

/// Descriptor number of the listening socket inherited by init.
pub const HOST_SOCKET_FD: i32 = 5;

/// Name of the control socket inside a container's run directory.
pub const SOCKET_NAME: &str = "host.sock";

/// Name of the per-container run directory inside its depot directory.
pub const RUN_DIR: &str = "run";

/// Exit status published when the real status could not be collected.
pub const UNKNOWN_EXIT_STATUS: i32 = 255;

/// Application name used in log output.
pub const APP_NAME: &str = "corral";
