//! Registry of live containers keyed by handle.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use corral_common::error::{CorralError, Result};
use corral_common::types::Handle;

use crate::container::Container;

/// Stores the containers a backend manages.
pub trait ContainerRepository: Send + Sync + std::fmt::Debug {
    /// Every registered container, ordered by handle.
    fn all(&self) -> Vec<Arc<dyn Container>>;

    /// Registers a container.
    ///
    /// # Errors
    ///
    /// Returns `HandleExists` if a container with the same handle is
    /// already registered.
    fn add(&self, container: Arc<dyn Container>) -> Result<()>;

    /// Looks a container up by handle.
    fn find_by_handle(&self, handle: &Handle) -> Option<Arc<dyn Container>>;

    /// Unregisters a container. Unknown handles are ignored.
    fn delete(&self, handle: &Handle);
}

/// Repository held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    containers: RwLock<BTreeMap<Handle, Arc<dyn Container>>>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContainerRepository for InMemoryRepository {
    fn all(&self) -> Vec<Arc<dyn Container>> {
        self.containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn add(&self, container: Arc<dyn Container>) -> Result<()> {
        let mut containers = self.containers.write().unwrap_or_else(PoisonError::into_inner);
        let handle = container.handle().clone();
        if containers.contains_key(&handle) {
            return Err(CorralError::HandleExists {
                handle: handle.to_string(),
            });
        }
        let _ = containers.insert(handle, container);
        Ok(())
    }

    fn find_by_handle(&self, handle: &Handle) -> Option<Arc<dyn Container>> {
        self.containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handle)
            .cloned()
    }

    fn delete(&self, handle: &Handle) {
        let _ = self
            .containers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle);
    }
}
