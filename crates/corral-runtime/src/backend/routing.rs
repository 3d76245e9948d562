//! Dispatch across several backends.
//!
//! New containers go to the first backend whose predicate matches the
//! request, or to the fallback. Calls naming a handle go to whichever
//! backend knows it.

use std::sync::Arc;

use corral_common::error::{CorralError, Result};
use corral_common::types::{Capacity, ContainerSpec, Handle, Properties};

use super::{Backend, BulkInfo};
use crate::container::Container;

/// Selects the backend that creates a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePredicate {
    /// Matches requests whose rootfs starts with the prefix, e.g.
    /// `docker://`.
    RootfsPrefix(String),
    /// Matches requests whose handle starts with the prefix.
    HandlePrefix(String),
}

impl RoutePredicate {
    /// Returns whether `spec` should go to the predicate's backend.
    pub fn matches(&self, spec: &ContainerSpec) -> bool {
        match self {
            Self::RootfsPrefix(prefix) => spec.rootfs.starts_with(prefix.as_str()),
            Self::HandlePrefix(prefix) => spec
                .handle
                .as_ref()
                .is_some_and(|h| h.as_str().starts_with(prefix.as_str())),
        }
    }
}

/// Backend that fans out to routed backends and a fallback.
#[derive(Debug)]
pub struct RoutingBackend {
    routes: Vec<(RoutePredicate, Arc<dyn Backend>)>,
    fallback: Arc<dyn Backend>,
}

impl RoutingBackend {
    /// Creates a router sending everything to `fallback`.
    pub fn new(fallback: Arc<dyn Backend>) -> Self {
        Self {
            routes: Vec::new(),
            fallback,
        }
    }

    /// Adds a route, checked after those added earlier.
    #[must_use]
    pub fn route(mut self, predicate: RoutePredicate, backend: Arc<dyn Backend>) -> Self {
        self.routes.push((predicate, backend));
        self
    }

    fn backend_for(&self, spec: &ContainerSpec) -> &Arc<dyn Backend> {
        self.routes
            .iter()
            .find(|(predicate, _)| predicate.matches(spec))
            .map_or(&self.fallback, |(_, backend)| backend)
    }

    /// Every distinct backend, routes first, fallback last.
    fn backends(&self) -> Vec<&Arc<dyn Backend>> {
        let mut distinct: Vec<&Arc<dyn Backend>> = Vec::new();
        for backend in self.routes.iter().map(|(_, b)| b).chain([&self.fallback]) {
            if !distinct.iter().any(|seen| Arc::ptr_eq(seen, backend)) {
                distinct.push(backend);
            }
        }
        distinct
    }

    fn owner_of(&self, handle: &Handle) -> Result<(&Arc<dyn Backend>, Arc<dyn Container>)> {
        self.backends()
            .into_iter()
            .find_map(|backend| backend.lookup(handle).ok().map(|c| (backend, c)))
            .ok_or_else(|| CorralError::ContainerNotFound {
                handle: handle.to_string(),
            })
    }
}

impl Backend for RoutingBackend {
    fn setup(&self) -> Result<()> {
        self.backends().into_iter().try_for_each(|b| b.setup())
    }

    fn start(&self) -> Result<()> {
        let backends = self.backends();
        for (started, backend) in backends.iter().enumerate() {
            if let Err(e) = backend.start() {
                for earlier in &backends[..started] {
                    if let Err(stop_err) = earlier.stop() {
                        tracing::error!(error = %stop_err, "failed to stop backend after start failure");
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut first_error = None;
        for backend in self.backends() {
            if let Err(e) = backend.stop() {
                tracing::error!(error = %e, "backend failed to stop");
                let _ = first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn ping(&self) -> Result<()> {
        self.backends().into_iter().try_for_each(|b| b.ping())
    }

    fn capacity(&self) -> Result<Capacity> {
        self.fallback.capacity()
    }

    fn create(&self, spec: &ContainerSpec) -> Result<Arc<dyn Container>> {
        if let Some(handle) = &spec.handle {
            if self.owner_of(handle).is_ok() {
                return Err(CorralError::HandleExists {
                    handle: handle.to_string(),
                });
            }
        }
        self.backend_for(spec).create(spec)
    }

    fn destroy(&self, handle: &Handle) -> Result<()> {
        let (backend, _) = self.owner_of(handle)?;
        backend.destroy(handle)
    }

    fn lookup(&self, handle: &Handle) -> Result<Arc<dyn Container>> {
        self.owner_of(handle).map(|(_, container)| container)
    }

    fn containers(&self, filter: &Properties) -> Result<Vec<Arc<dyn Container>>> {
        let mut all = Vec::new();
        for backend in self.backends() {
            all.extend(backend.containers(filter)?);
        }
        Ok(all)
    }

    fn bulk_info(&self, handles: &[Handle]) -> BulkInfo {
        handles
            .iter()
            .map(|handle| {
                let info = self.owner_of(handle).and_then(|(_, c)| c.info());
                (handle.clone(), info)
            })
            .collect()
    }
}
