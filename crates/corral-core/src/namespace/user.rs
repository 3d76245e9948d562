//! User namespace id maps.
//!
//! Maps container uid/gid 0 onto the container's allocated host uid range,
//! so root inside the container is an unprivileged user on the host.

use std::path::PathBuf;

use corral_common::error::{CorralError, Result};

/// One line of a `uid_map`/`gid_map` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    /// First id inside the namespace.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of consecutive ids mapped.
    pub size: u32,
}

impl IdMapping {
    /// Maps container root onto `host_id..host_id + size`.
    #[must_use]
    pub const fn root_at(host_id: u32, size: u32) -> Self {
        Self {
            container_id: 0,
            host_id,
            size,
        }
    }

    fn line(&self) -> String {
        format!("{} {} {}", self.container_id, self.host_id, self.size)
    }
}

/// Writes the uid and gid maps of process `pid`.
///
/// Denies `setgroups` first, which the kernel requires before an
/// unprivileged writer may set a gid map.
///
/// # Errors
///
/// Returns an error if writing to `/proc/<pid>/setgroups`,
/// `/proc/<pid>/uid_map` or `/proc/<pid>/gid_map` fails.
pub fn write_id_maps(pid: u32, mapping: IdMapping) -> Result<()> {
    write_id_maps_under(&PathBuf::from("/proc"), pid, mapping)
}

fn write_id_maps_under(proc_root: &std::path::Path, pid: u32, mapping: IdMapping) -> Result<()> {
    let dir = proc_root.join(pid.to_string());
    let line = mapping.line();

    let setgroups_path = dir.join("setgroups");
    if setgroups_path.exists() {
        std::fs::write(&setgroups_path, "deny").map_err(|e| CorralError::io(&setgroups_path, e))?;
    }

    let uid_map_path = dir.join("uid_map");
    std::fs::write(&uid_map_path, &line).map_err(|e| CorralError::io(&uid_map_path, e))?;

    let gid_map_path = dir.join("gid_map");
    std::fs::write(&gid_map_path, &line).map_err(|e| CorralError::io(&gid_map_path, e))?;

    tracing::debug!(pid, map = %line, "wrote uid/gid map");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_mapping_line() {
        assert_eq!(IdMapping::root_at(10_000, 1).line(), "0 10000 1");
    }

    #[test]
    fn maps_are_written_under_pid_directory() {
        let root = tempfile::tempdir().unwrap();
        let pid_dir = root.path().join("42");
        std::fs::create_dir(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("setgroups"), "allow").unwrap();

        write_id_maps_under(root.path(), 42, IdMapping::root_at(20_000, 65_536)).unwrap();

        assert_eq!(std::fs::read_to_string(pid_dir.join("setgroups")).unwrap(), "deny");
        assert_eq!(std::fs::read_to_string(pid_dir.join("uid_map")).unwrap(), "0 20000 65536");
        assert_eq!(std::fs::read_to_string(pid_dir.join("gid_map")).unwrap(), "0 20000 65536");
    }

    #[test]
    fn missing_process_reports_path() {
        let root = tempfile::tempdir().unwrap();
        let err = write_id_maps_under(root.path(), 7, IdMapping::root_at(1, 1)).unwrap_err();
        assert!(err.to_string().contains("uid_map"));
    }
}
