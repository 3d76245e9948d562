//! Backend driving a container pool on the local Linux host.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corral_common::error::{CorralError, Result};
use corral_common::types::{Capacity, ContainerSpec, Handle, Properties, properties_match};

use super::{Backend, BulkInfo};
use crate::container::Container;
use crate::pool::ContainerPool;
use crate::repository::ContainerRepository;
use crate::snapshot;
use crate::system_info::SystemInfo;

/// Backend that keeps containers of one [`ContainerPool`] in a
/// [`ContainerRepository`].
///
/// The pool is always touched before the repository, and never while the
/// repository is locked.
#[derive(Debug)]
pub struct LinuxBackend {
    pool: Arc<dyn ContainerPool>,
    repository: Arc<dyn ContainerRepository>,
    system: Arc<dyn SystemInfo>,
    snapshots_dir: Option<PathBuf>,
}

impl LinuxBackend {
    /// Creates a backend without snapshots.
    pub fn new(
        pool: Arc<dyn ContainerPool>,
        repository: Arc<dyn ContainerRepository>,
        system: Arc<dyn SystemInfo>,
    ) -> Self {
        Self {
            pool,
            repository,
            system,
            snapshots_dir: None,
        }
    }

    /// Writes snapshots on stop to `dir` and restores them from there on
    /// start.
    #[must_use]
    pub fn with_snapshots(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshots_dir = Some(dir.into());
        self
    }

    fn restore_snapshot(&self, path: &Path) -> Result<Handle> {
        let mut file = File::open(path).map_err(|e| CorralError::io(path, e))?;
        let container = self.pool.restore(&mut file)?;
        let handle = container.handle().clone();
        self.repository.add(container)?;
        Ok(handle)
    }

    fn save_snapshot(&self, dir: &Path, container: &dyn Container) -> Result<()> {
        container.cleanup()?;
        let path = snapshot::write_file(dir, container.handle(), |out| container.snapshot(out))?;
        tracing::info!(handle = %container.handle(), path = %path.display(), "snapshot written");
        Ok(())
    }

    fn kept_handles(&self) -> HashSet<Handle> {
        self.repository
            .all()
            .iter()
            .map(|c| c.handle().clone())
            .collect()
    }
}

impl Backend for LinuxBackend {
    fn setup(&self) -> Result<()> {
        self.pool.setup()
    }

    fn start(&self) -> Result<()> {
        if let Some(dir) = &self.snapshots_dir {
            for path in snapshot::list(dir)? {
                match self.restore_snapshot(&path) {
                    Ok(handle) => {
                        tracing::info!(handle = %handle, "container restored from snapshot");
                        if let Err(e) = fs::remove_file(&path) {
                            tracing::warn!(path = %path.display(), error = %e, "failed to remove restored snapshot");
                        }
                    }
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "failed to restore snapshot; skipping");
                    }
                }
            }
        }
        self.pool.prune(&self.kept_handles())
    }

    fn stop(&self) -> Result<()> {
        let mut first_error = None;
        for container in self.repository.all() {
            let result = match &self.snapshots_dir {
                Some(dir) => self.save_snapshot(dir, container.as_ref()),
                None => container.cleanup(),
            };
            if let Err(e) = result {
                tracing::error!(handle = %container.handle(), error = %e, "failed to save container");
                let _ = first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn capacity(&self) -> Result<Capacity> {
        Ok(Capacity {
            memory_in_bytes: self.system.total_memory()?,
            disk_in_bytes: self.system.total_disk()?,
            max_containers: u64::try_from(self.pool.max_containers()).unwrap_or(u64::MAX),
        })
    }

    fn create(&self, spec: &ContainerSpec) -> Result<Arc<dyn Container>> {
        if let Some(handle) = &spec.handle {
            if self.repository.find_by_handle(handle).is_some() {
                return Err(CorralError::HandleExists {
                    handle: handle.to_string(),
                });
            }
        }

        let container = self.pool.create(spec)?;
        if let Err(e) = container.start() {
            tracing::error!(handle = %container.handle(), error = %e, "container failed to start");
            if let Err(destroy_err) = self.pool.destroy(container.as_ref()) {
                tracing::error!(handle = %container.handle(), error = %destroy_err, "failed to destroy unstarted container");
            }
            return Err(e);
        }

        if let Err(e) = self.repository.add(Arc::clone(&container)) {
            // Lost a race for the handle after the pool accepted it.
            if let Err(destroy_err) = self.pool.destroy(container.as_ref()) {
                tracing::error!(handle = %container.handle(), error = %destroy_err, "failed to destroy duplicate container");
            }
            return Err(e);
        }
        tracing::info!(handle = %container.handle(), "container registered");
        Ok(container)
    }

    fn destroy(&self, handle: &Handle) -> Result<()> {
        let container = self.lookup(handle)?;
        self.pool.destroy(container.as_ref())?;
        self.repository.delete(handle);
        Ok(())
    }

    fn lookup(&self, handle: &Handle) -> Result<Arc<dyn Container>> {
        self.repository
            .find_by_handle(handle)
            .ok_or_else(|| CorralError::ContainerNotFound {
                handle: handle.to_string(),
            })
    }

    fn containers(&self, filter: &Properties) -> Result<Vec<Arc<dyn Container>>> {
        Ok(self
            .repository
            .all()
            .into_iter()
            .filter(|c| properties_match(&c.properties(), filter))
            .collect())
    }

    fn bulk_info(&self, handles: &[Handle]) -> BulkInfo {
        handles
            .iter()
            .map(|handle| (handle.clone(), self.lookup(handle).and_then(|c| c.info())))
            .collect()
    }
}
