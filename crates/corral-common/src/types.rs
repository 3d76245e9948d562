//! Domain primitive types used across the Corral workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CorralError, Result};

/// Externally visible unique identifier for a container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
    /// Creates a handle from a caller-supplied string.
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Generates a fresh handle.
    ///
    /// Uses the first 11 hex characters of a v4 UUID, short enough to be
    /// used in interface and chain names.
    #[must_use]
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(id[..11].to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks that the handle names exactly one entry below a directory.
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for an empty handle, `.`, `..`, an absolute path or
    /// anything containing a separator.
    pub fn validate(&self) -> Result<()> {
        let mut components = Path::new(&self.0).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == self.0.as_str() => Ok(()),
            _ => Err(CorralError::InvalidHandle {
                handle: self.0.clone(),
            }),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Handle {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Free-form key/value labels attached to a container.
pub type Properties = BTreeMap<String, String>;

/// Returns whether every pair in `filter` is present in `properties` with an
/// identical value. A missing key never matches.
#[must_use]
pub fn properties_match(properties: &Properties, filter: &Properties) -> bool {
    filter
        .iter()
        .all(|(key, value)| properties.get(key).is_some_and(|v| v == value))
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Resources are acquired but the init process is not up yet.
    Creating,
    /// The init process is running and accepts requests.
    Active,
    /// The container was stopped; resources are still held.
    Stopped,
    /// The container is being torn down.
    Destroying,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Active => write!(f, "active"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroying => write!(f, "destroying"),
        }
    }
}

/// Parameters for creating a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Requested handle. `None` lets the pool generate one.
    pub handle: Option<Handle>,
    /// Root filesystem location, e.g. `/var/lib/rootfs/ubuntu`.
    pub rootfs: String,
    /// Requested `/30` subnet in CIDR notation. `None` picks any free one.
    pub network: Option<String>,
    /// Requested first uid of the container's range. `None` picks any.
    pub uid: Option<u32>,
    /// Time after which an idle container may be reclaimed.
    #[serde(default, with = "duration_secs")]
    pub grace_time: Option<Duration>,
    /// Labels attached to the container.
    #[serde(default)]
    pub properties: Properties,
}

/// Per-process resource limits, applied with `setrlimit(2)` before exec.
///
/// Each value is used as both the soft and the hard limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Address space size in bytes.
    pub r#as: Option<u64>,
    /// Core file size in bytes.
    pub core: Option<u64>,
    /// CPU time in seconds.
    pub cpu: Option<u64>,
    /// Data segment size in bytes.
    pub data: Option<u64>,
    /// Created file size in bytes.
    pub fsize: Option<u64>,
    /// Locked memory in bytes.
    pub memlock: Option<u64>,
    /// Open file descriptors.
    pub nofile: Option<u64>,
    /// Processes for the real user id.
    pub nproc: Option<u64>,
    /// Stack size in bytes.
    pub stack: Option<u64>,
}

impl ResourceLimits {
    /// Returns a copy where every limit unset in `self` is taken from
    /// `defaults`.
    #[must_use]
    pub fn merged_with(&self, defaults: &Self) -> Self {
        Self {
            r#as: self.r#as.or(defaults.r#as),
            core: self.core.or(defaults.core),
            cpu: self.cpu.or(defaults.cpu),
            data: self.data.or(defaults.data),
            fsize: self.fsize.or(defaults.fsize),
            memlock: self.memlock.or(defaults.memlock),
            nofile: self.nofile.or(defaults.nofile),
            nproc: self.nproc.or(defaults.nproc),
            stack: self.stack.or(defaults.stack),
        }
    }
}

/// A request to run a program inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Program path, resolved inside the container.
    pub path: String,
    /// Arguments, not including the program name.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment as `KEY=value` pairs.
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory. Defaults to the user's home directory.
    #[serde(default)]
    pub dir: Option<String>,
    /// User to run as. Empty keeps the daemon's own identity.
    #[serde(default)]
    pub user: String,
    /// Resource limits for the process.
    #[serde(default)]
    pub limits: ResourceLimits,
}

/// Terminal window dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    /// Columns.
    pub columns: u16,
    /// Rows.
    pub rows: u16,
}

/// Pseudo-terminal request for a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySpec {
    /// Initial window size, if any.
    pub window_size: Option<WindowSize>,
}

/// Signals that may be delivered to a container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// `SIGTERM`.
    Terminate,
    /// `SIGKILL`.
    Kill,
    /// `SIGINT`.
    Interrupt,
    /// `SIGHUP`.
    Hangup,
}

impl From<Signal> for nix::sys::signal::Signal {
    fn from(value: Signal) -> Self {
        match value {
            Signal::Terminate => Self::SIGTERM,
            Signal::Kill => Self::SIGKILL,
            Signal::Interrupt => Self::SIGINT,
            Signal::Hangup => Self::SIGHUP,
        }
    }
}

/// Host capacity reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Total physical memory.
    pub memory_in_bytes: u64,
    /// Total disk space on the depot filesystem.
    pub disk_in_bytes: u64,
    /// Number of containers the resource pool can hold at once.
    pub max_containers: u64,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_handles_differ() {
        let a = Handle::generate();
        let b = Handle::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 11);
    }

    #[test]
    fn properties_match_requires_every_pair() {
        let mut props = Properties::new();
        let _ = props.insert("app".into(), "web".into());
        let _ = props.insert("tier".into(), "front".into());

        let mut filter = Properties::new();
        let _ = filter.insert("app".into(), "web".into());
        assert!(properties_match(&props, &filter));

        let _ = filter.insert("tier".into(), "back".into());
        assert!(!properties_match(&props, &filter));
    }

    #[test]
    fn properties_match_missing_key_never_matches() {
        let props = Properties::new();
        let mut filter = Properties::new();
        let _ = filter.insert("app".into(), String::new());
        assert!(!properties_match(&props, &filter));
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(properties_match(&Properties::new(), &Properties::new()));
    }

    #[test]
    fn limits_merge_prefers_explicit_values() {
        let explicit = ResourceLimits {
            nofile: Some(64),
            ..ResourceLimits::default()
        };
        let defaults = ResourceLimits {
            nofile: Some(1024),
            nproc: Some(512),
            ..ResourceLimits::default()
        };
        let merged = explicit.merged_with(&defaults);
        assert_eq!(merged.nofile, Some(64));
        assert_eq!(merged.nproc, Some(512));
    }

    #[test]
    fn container_spec_grace_time_is_seconds() {
        let spec = ContainerSpec {
            grace_time: Some(Duration::from_secs(30)),
            ..ContainerSpec::default()
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"grace_time\":30"));
        let back: ContainerSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn handles_must_be_single_entries() {
        for bad in ["", ".", "..", "../victim", "a/b", "/abs", "c1/"] {
            assert!(
                matches!(Handle::new(bad).validate(), Err(CorralError::InvalidHandle { .. })),
                "{bad:?} accepted"
            );
        }
        assert!(Handle::new("c1").validate().is_ok());
        assert!(Handle::generate().validate().is_ok());
    }
}
