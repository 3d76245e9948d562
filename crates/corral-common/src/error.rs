//! Unified error types for the Corral workspace.
//!
//! Variants are grouped by how callers are expected to react: configuration
//! errors abort startup, resource and lookup errors go back to the caller,
//! protocol errors end a single connection, and spawn errors travel back to
//! the host in the daemon response.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CorralError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// One of the pool's allocators has no free block left.
    #[error("insufficient resources for {resource}")]
    ResourceExhausted {
        /// Allocator that ran dry (`uid`, `network` or `port`).
        resource: &'static str,
    },

    /// The requested handle is already registered.
    #[error("handle already exists: {handle}")]
    HandleExists {
        /// Handle that collided.
        handle: String,
    },

    /// A handle that cannot name a single directory entry.
    #[error("invalid handle: {handle:?}")]
    InvalidHandle {
        /// The rejected handle.
        handle: String,
    },

    /// A specific resource was requested or restored while already issued.
    #[error("resource conflict: {message}")]
    ResourceConflict {
        /// Description of the conflicting resource.
        message: String,
    },

    /// An allocation was released twice.
    #[error("allocation for {handle} released while not issued")]
    DoubleRelease {
        /// Handle of the released allocation.
        handle: String,
    },

    /// No container is registered under the handle.
    #[error("unknown handle: {handle}")]
    ContainerNotFound {
        /// Handle that was looked up.
        handle: String,
    },

    /// No process with this pid is tracked by the reaper.
    #[error("no such process: {pid}")]
    ProcessNotFound {
        /// Pid that was looked up.
        pid: i32,
    },

    /// The requested user does not exist in the container.
    #[error("unknown user: {user}")]
    UnknownUser {
        /// User name that failed to resolve.
        user: String,
    },

    /// Starting a process failed.
    #[error("failed to spawn process: {message}")]
    Spawn {
        /// Description of the failure.
        message: String,
    },

    /// The control channel carried something unexpected.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the malformed exchange.
        message: String,
    },

    /// The rendezvous between init and host failed.
    #[error("synchronization failed: {message}")]
    Sync {
        /// Description of the failure.
        message: String,
    },

    /// A system call failed.
    #[error("{operation} failed: {source}")]
    Os {
        /// Name of the failing operation.
        operation: &'static str,
        /// Underlying errno.
        source: nix::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CorralError {
    /// Wraps an I/O error together with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a failed system call.
    #[must_use]
    pub const fn os(operation: &'static str, source: nix::Error) -> Self {
        Self::Os { operation, source }
    }

    /// Returns whether the caller may retry with different parameters.
    #[must_use]
    pub const fn is_resource_error(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. } | Self::HandleExists { .. } | Self::ResourceConflict { .. }
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CorralError>;
