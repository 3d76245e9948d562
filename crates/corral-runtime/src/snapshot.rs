//! On-disk snapshots of containers, one file per container.
//!
//! The host writes a snapshot of every container when it stops and reads
//! them back when it starts, so containers outlive a host restart.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use corral_common::error::{CorralError, Result};
use corral_common::types::{ContainerState, Handle, Properties};
use corral_pool::Allocation;
use serde::{Deserialize, Serialize};

/// Everything a Linux container needs to be rebuilt after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    /// Resources bound to the container.
    pub allocation: Allocation,
    /// Root filesystem location.
    pub rootfs: String,
    /// Labels attached at creation.
    #[serde(default)]
    pub properties: Properties,
    /// Grace time in seconds.
    #[serde(default)]
    pub grace_time_secs: Option<u64>,
    /// State when the snapshot was taken.
    pub state: ContainerState,
    /// Host pid of the container's init process, if it was running.
    #[serde(default)]
    pub init_pid: Option<i32>,
    /// When the container was created.
    pub created_at: DateTime<Utc>,
}

/// Path of the snapshot file for `handle` under `dir`.
pub fn path_for(dir: &Path, handle: &Handle) -> PathBuf {
    dir.join(handle.as_str())
}

/// Writes a snapshot file by handing a buffered writer to `write`.
///
/// # Errors
///
/// Returns an `Io` error if the file cannot be created or flushed, or
/// whatever `write` returns; the file is removed in that case.
pub fn write_file(
    dir: &Path,
    handle: &Handle,
    write: impl FnOnce(&mut dyn Write) -> Result<()>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| CorralError::io(dir, e))?;
    let path = path_for(dir, handle);
    let file = File::create(&path).map_err(|e| CorralError::io(&path, e))?;
    let mut out = BufWriter::new(file);
    if let Err(e) = write(&mut out) {
        drop(out);
        let _ = fs::remove_file(&path);
        return Err(e);
    }
    out.flush().map_err(|e| CorralError::io(&path, e))?;
    Ok(path)
}

/// Lists the snapshot files under `dir`, sorted by name. A missing
/// directory holds no snapshots.
///
/// # Errors
///
/// Returns an `Io` error if the directory exists but cannot be read.
pub fn list(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CorralError::io(dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CorralError::io(dir, e))?;
        if entry.file_type().map_err(|e| CorralError::io(entry.path(), e))?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list(&dir.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn written_files_are_listed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b", "a"] {
            let _ = write_file(dir.path(), &Handle::new(name), |out| {
                out.write_all(b"{}").map_err(|e| CorralError::io("snapshot", e))
            })
            .unwrap();
        }
        fs::create_dir(dir.path().join("not-a-snapshot")).unwrap();
        let files = list(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("a"), dir.path().join("b")]);
    }
}
