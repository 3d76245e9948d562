//! Host memory and disk totals for capacity reporting.

use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};

/// Source of host totals.
pub trait SystemInfo: Send + Sync + std::fmt::Debug {
    /// Total physical memory in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the total cannot be read.
    fn total_memory(&self) -> Result<u64>;

    /// Total size in bytes of the filesystem holding the depot.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem cannot be queried.
    fn total_disk(&self) -> Result<u64>;
}

/// Reads `/proc/meminfo` and `statvfs(3)` of the depot directory.
#[derive(Debug, Clone)]
pub struct ProcSystemInfo {
    depot: PathBuf,
}

impl ProcSystemInfo {
    /// Reports the disk holding `depot`.
    pub fn new(depot: impl Into<PathBuf>) -> Self {
        Self {
            depot: depot.into(),
        }
    }
}

impl SystemInfo for ProcSystemInfo {
    fn total_memory(&self) -> Result<u64> {
        let path = Path::new("/proc/meminfo");
        let meminfo = std::fs::read_to_string(path).map_err(|e| CorralError::io(path, e))?;
        parse_mem_total(&meminfo).ok_or_else(|| CorralError::Config {
            message: "MemTotal missing from /proc/meminfo".into(),
        })
    }

    fn total_disk(&self) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(&self.depot).map_err(|e| CorralError::os("statvfs", e))?;
        #[allow(clippy::useless_conversion)]
        Ok(u64::from(stat.fragment_size()) * u64::from(stat.blocks()))
    }
}

/// Extracts `MemTotal` in bytes.
fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let mut fields = rest.split_whitespace();
        let value: u64 = fields.next()?.parse().ok()?;
        match fields.next() {
            Some("kB") => Some(value * 1024),
            None => Some(value),
            Some(_) => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_total_in_kib() {
        let meminfo = "MemTotal:        2048 kB\nMemFree:  1 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(2048 * 1024));
    }

    #[test]
    fn missing_mem_total() {
        assert_eq!(parse_mem_total("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn host_totals_are_positive() {
        let dir = tempfile::tempdir().unwrap();
        let info = ProcSystemInfo::new(dir.path());
        assert!(info.total_memory().unwrap() > 0);
        assert!(info.total_disk().unwrap() > 0);
    }
}
