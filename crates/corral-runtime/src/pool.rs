//! Container pools: bind containers to resources and lay out their depot.

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corral_common::config::CorralConfig;
use corral_common::error::{CorralError, Result};
use corral_common::types::{ContainerSpec, Handle};
use corral_daemon::reaper::Reaper;
use corral_pool::{AcquireSpec, Allocation, ResourcePool, Subnet};

use crate::container::Container;
use crate::fence::{NetworkFencer, NoopFencer};
use crate::linux_container::{ContainerSettings, LinuxContainer};
use crate::quota::{DisabledQuota, DiskLimits, QuotaManager};
use crate::snapshot::ContainerSnapshot;

/// Creates, restores and destroys containers.
pub trait ContainerPool: Send + Sync + std::fmt::Debug {
    /// Prepares host state shared by all containers.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be prepared.
    fn setup(&self) -> Result<()>;

    /// Creates a container bound to freshly acquired resources. The
    /// container is not started.
    ///
    /// # Errors
    ///
    /// Returns a resource error if the request cannot be satisfied, or an
    /// I/O error if the depot cannot be laid out. Nothing is held on error.
    fn create(&self, spec: &ContainerSpec) -> Result<Arc<dyn Container>>;

    /// Rebuilds a container from a snapshot and re-marks its resources as
    /// issued.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is malformed or its resources are
    /// already issued.
    fn restore(&self, snapshot: &mut dyn Read) -> Result<Arc<dyn Container>>;

    /// Stops a container and gives back everything it holds.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while tearing down.
    fn destroy(&self, container: &dyn Container) -> Result<()>;

    /// Releases resources and depot directories of containers not in
    /// `keep`.
    ///
    /// # Errors
    ///
    /// Returns an error if the depot cannot be listed.
    fn prune(&self, keep: &HashSet<Handle>) -> Result<()>;

    /// Number of containers the pool can hold at once.
    fn max_containers(&self) -> usize;
}

/// Pool of [`LinuxContainer`]s laid out under one depot directory.
#[derive(Debug)]
pub struct LinuxContainerPool {
    settings: Arc<ContainerSettings>,
    depot: PathBuf,
    resources: ResourcePool,
    reaper: Arc<Reaper>,
    fencer: Arc<dyn NetworkFencer>,
    quota: Arc<dyn QuotaManager>,
    disk_limits: DiskLimits,
}

impl LinuxContainerPool {
    /// Builds a pool from the host configuration with no-op fencing and no
    /// quotas.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the pool bounds are invalid.
    pub fn new(config: &CorralConfig, reaper: Arc<Reaper>) -> Result<Self> {
        Ok(Self {
            settings: Arc::new(ContainerSettings::from_config(config)),
            depot: config.depot_dir.clone(),
            resources: ResourcePool::new(&config.pool)?,
            reaper,
            fencer: Arc::new(NoopFencer),
            quota: Arc::new(DisabledQuota),
            disk_limits: DiskLimits::default(),
        })
    }

    /// Replaces the network fencer.
    #[must_use]
    pub fn with_fencer(mut self, fencer: Arc<dyn NetworkFencer>) -> Self {
        self.fencer = fencer;
        self
    }

    /// Replaces the quota manager and the limits applied to each depot
    /// directory.
    #[must_use]
    pub fn with_quota(mut self, quota: Arc<dyn QuotaManager>, limits: DiskLimits) -> Self {
        self.quota = quota;
        self.disk_limits = limits;
        self
    }

    /// Resource pool backing the containers.
    pub const fn resources(&self) -> &ResourcePool {
        &self.resources
    }

    fn container_path(&self, handle: &Handle) -> PathBuf {
        self.depot.join(handle.as_str())
    }

    fn lay_out(&self, allocation: &Allocation) -> Result<PathBuf> {
        let path = self.container_path(&allocation.handle);
        fs::create_dir_all(&path).map_err(|e| CorralError::io(&path, e))?;
        self.quota.set_limits(&path, self.disk_limits)?;
        Ok(path)
    }

    fn release_quietly(&self, allocation: &Allocation) {
        if let Err(e) = self.resources.release(allocation) {
            tracing::error!(handle = %allocation.handle, error = %e, "failed to release allocation");
        }
    }
}

fn acquire_spec(spec: &ContainerSpec) -> Result<AcquireSpec> {
    let network = spec
        .network
        .as_deref()
        .map(str::parse::<Subnet>)
        .transpose()?;
    Ok(AcquireSpec {
        handle: spec.handle.clone(),
        network,
        uid: spec.uid,
    })
}

fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CorralError::io(path, e)),
    }
}

impl ContainerPool for LinuxContainerPool {
    fn setup(&self) -> Result<()> {
        fs::create_dir_all(&self.depot).map_err(|e| CorralError::io(&self.depot, e))?;
        tracing::info!(depot = %self.depot.display(), max_containers = self.max_containers(), "container pool ready");
        Ok(())
    }

    fn create(&self, spec: &ContainerSpec) -> Result<Arc<dyn Container>> {
        let allocation = self.resources.acquire(&acquire_spec(spec)?)?;
        let path = match self.lay_out(&allocation) {
            Ok(path) => path,
            Err(e) => {
                let _ = remove_dir(&self.container_path(&allocation.handle));
                self.release_quietly(&allocation);
                return Err(e);
            }
        };
        tracing::info!(
            handle = %allocation.handle,
            uids = %allocation.uids,
            network = %allocation.network,
            ports = %allocation.ports,
            "container created"
        );
        Ok(Arc::new(LinuxContainer::new(
            allocation,
            spec,
            path,
            Arc::clone(&self.settings),
            Arc::clone(&self.reaper),
            Arc::clone(&self.fencer),
        )))
    }

    fn restore(&self, snapshot: &mut dyn Read) -> Result<Arc<dyn Container>> {
        let snapshot: ContainerSnapshot = serde_json::from_reader(snapshot)?;
        let allocation = self.resources.restore_allocation(snapshot.allocation.clone())?;
        let path = match self.lay_out(&allocation) {
            Ok(path) => path,
            Err(e) => {
                self.release_quietly(&allocation);
                return Err(e);
            }
        };
        Ok(Arc::new(LinuxContainer::restore(
            snapshot,
            path,
            Arc::clone(&self.settings),
            Arc::clone(&self.reaper),
            Arc::clone(&self.fencer),
        )))
    }

    fn destroy(&self, container: &dyn Container) -> Result<()> {
        let handle = container.handle().clone();
        container.stop(false)?;
        remove_dir(&self.container_path(&handle))?;

        match self.resources.allocation(&handle) {
            Some(allocation) => {
                self.fencer.teardown(&handle, allocation.network)?;
                self.resources.release(&allocation)?;
            }
            None => tracing::warn!(handle = %handle, "destroyed container held no allocation"),
        }
        tracing::info!(handle = %handle, "container destroyed");
        Ok(())
    }

    fn prune(&self, keep: &HashSet<Handle>) -> Result<()> {
        for allocation in self.resources.prune(keep) {
            if let Err(e) = self.fencer.teardown(&allocation.handle, allocation.network) {
                tracing::warn!(handle = %allocation.handle, error = %e, "failed to tear down fence");
            }
            tracing::info!(handle = %allocation.handle, "pruned allocation");
        }

        let entries = match fs::read_dir(&self.depot) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CorralError::io(&self.depot, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| CorralError::io(&self.depot, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if keep.contains(&Handle::new(name)) {
                continue;
            }
            if let Err(e) = remove_dir(&entry.path()) {
                tracing::warn!(path = %entry.path().display(), error = %e, "failed to prune depot entry");
            } else {
                tracing::info!(handle = name, "pruned depot directory");
            }
        }
        Ok(())
    }

    fn max_containers(&self) -> usize {
        self.resources.max_containers()
    }
}

#[cfg(test)]
mod tests {
    use corral_common::config::{NamespaceSet, PoolConfig, RangeConfig};
    use corral_common::types::ContainerState;

    use super::*;

    fn config(depot: &Path) -> CorralConfig {
        CorralConfig {
            depot_dir: depot.to_path_buf(),
            init_binary: PathBuf::from("/bin/false"),
            namespaces: NamespaceSet {
                pid: false,
                mount: false,
                network: false,
                user: false,
                ipc: false,
                uts: false,
            },
            pool: PoolConfig {
                uids: RangeConfig::new(10_000, 4),
                network: "10.254.0.0/29".into(),
                ports: RangeConfig::new(61_001, 4),
            },
            ..CorralConfig::default()
        }
    }

    fn pool(depot: &Path) -> (LinuxContainerPool, Arc<Reaper>) {
        let reaper = Reaper::start().unwrap();
        let pool = LinuxContainerPool::new(&config(depot), Arc::clone(&reaper)).unwrap();
        pool.setup().unwrap();
        (pool, reaper)
    }

    fn spec(handle: &str) -> ContainerSpec {
        ContainerSpec {
            handle: Some(Handle::new(handle)),
            ..ContainerSpec::default()
        }
    }

    #[test]
    fn create_lays_out_depot_and_destroy_releases() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, reaper) = pool(dir.path());
        assert_eq!(pool.max_containers(), 2);

        let container = pool.create(&spec("c1")).unwrap();
        assert!(dir.path().join("c1").is_dir());
        assert_eq!(pool.resources().issued().len(), 1);

        pool.destroy(container.as_ref()).unwrap();
        assert!(!dir.path().join("c1").exists());
        assert!(pool.resources().issued().is_empty());
        assert_eq!(container.state(), ContainerState::Stopped);
        reaper.stop();
    }

    #[test]
    fn handles_cannot_leave_the_depot() {
        let dir = tempfile::tempdir().unwrap();
        let depot = dir.path().join("depot");
        let (pool, reaper) = pool(&depot);
        fs::create_dir(dir.path().join("victim")).unwrap();

        for bad in ["../victim", "/etc", "a/b"] {
            assert!(matches!(
                pool.create(&spec(bad)),
                Err(CorralError::InvalidHandle { .. })
            ));
        }
        assert!(dir.path().join("victim").is_dir());
        assert!(pool.resources().issued().is_empty());

        let generated = pool.create(&spec("")).unwrap();
        assert!(!generated.handle().as_str().is_empty());
        assert!(depot.join(generated.handle().as_str()).is_dir());
        pool.destroy(generated.as_ref()).unwrap();
        assert!(depot.is_dir());
        reaper.stop();
    }

    #[test]
    fn requested_network_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, reaper) = pool(dir.path());
        let request = ContainerSpec {
            network: Some("10.254.0.4/30".into()),
            ..spec("c1")
        };
        let container = pool.create(&request).unwrap();
        let info = container.info().unwrap();
        assert_eq!(info.host_ip.to_string(), "10.254.0.5");

        let malformed = ContainerSpec {
            network: Some("10.254.0.4/24".into()),
            ..spec("c2")
        };
        assert!(matches!(pool.create(&malformed), Err(CorralError::Config { .. })));
        reaper.stop();
    }

    #[test]
    fn restore_reclaims_resources_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, reaper) = pool(dir.path());
        let container = pool.create(&spec("c1")).unwrap();
        let mut bytes = Vec::new();
        container.snapshot(&mut bytes).unwrap();

        let (fresh, fresh_reaper) = self::pool(dir.path());
        let restored = fresh.restore(&mut bytes.as_slice()).unwrap();
        assert_eq!(restored.handle().as_str(), "c1");
        assert_eq!(fresh.resources().issued().len(), 1);
        assert!(matches!(
            fresh.restore(&mut bytes.as_slice()),
            Err(CorralError::ResourceConflict { .. })
        ));
        reaper.stop();
        fresh_reaper.stop();
    }

    #[test]
    fn prune_drops_unknown_depot_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, reaper) = pool(dir.path());
        let _kept = pool.create(&spec("kept")).unwrap();
        let _dropped = pool.create(&spec("dropped")).unwrap();
        fs::create_dir(dir.path().join("stale")).unwrap();

        let keep = HashSet::from([Handle::new("kept")]);
        pool.prune(&keep).unwrap();

        assert!(dir.path().join("kept").is_dir());
        assert!(!dir.path().join("dropped").exists());
        assert!(!dir.path().join("stale").exists());
        let issued: Vec<_> = pool.resources().issued().into_iter().map(|a| a.handle).collect();
        assert_eq!(issued, vec![Handle::new("kept")]);
        reaper.stop();
    }
}
