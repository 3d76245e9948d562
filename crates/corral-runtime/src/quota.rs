//! Disk quota enforcement for container depots.

use std::path::Path;

use corral_common::error::Result;

/// Disk limits for one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskLimits {
    /// Hard limit on bytes used.
    pub byte_hard: Option<u64>,
    /// Hard limit on inodes used.
    pub inode_hard: Option<u64>,
}

/// Disk usage of one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    /// Bytes used.
    pub bytes_used: u64,
    /// Inodes used.
    pub inodes_used: u64,
}

/// Sets and reads disk quotas.
pub trait QuotaManager: Send + Sync + std::fmt::Debug {
    /// Applies `limits` to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the quota cannot be set.
    fn set_limits(&self, path: &Path, limits: DiskLimits) -> Result<()>;

    /// Reads the limits of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the quota cannot be read.
    fn limits(&self, path: &Path) -> Result<DiskLimits>;

    /// Reads the usage of `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if usage cannot be read.
    fn usage(&self, path: &Path) -> Result<DiskUsage>;
}

/// Quota manager for hosts without quota support: accepts every limit and
/// reports no usage.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledQuota;

impl QuotaManager for DisabledQuota {
    fn set_limits(&self, path: &Path, limits: DiskLimits) -> Result<()> {
        tracing::debug!(path = %path.display(), ?limits, "quotas disabled; limit ignored");
        Ok(())
    }

    fn limits(&self, _path: &Path) -> Result<DiskLimits> {
        Ok(DiskLimits::default())
    }

    fn usage(&self, _path: &Path) -> Result<DiskUsage> {
        Ok(DiskUsage::default())
    }
}
