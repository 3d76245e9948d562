//! The request handler run by `corral-initd`.

use std::sync::Arc;

use corral_common::error::Result;
use corral_common::types::{ProcessSpec, Signal, TtySpec};

use crate::listener::ConnectionHandler;
use crate::preparer::{PasswdLookup, ProcessSpecPreparer, UserLookup};
use crate::reaper::Reaper;
use crate::spawner::{SpawnedProcess, Spawner};

/// Runs, waits for and signals processes inside a container.
#[derive(Debug)]
pub struct ContainerDaemon<L = PasswdLookup> {
    preparer: ProcessSpecPreparer<L>,
    spawner: Spawner,
    reaper: Arc<Reaper>,
}

impl<L: UserLookup> ContainerDaemon<L> {
    /// Creates a daemon whose children are reaped by `reaper`.
    pub fn new(preparer: ProcessSpecPreparer<L>, reaper: Arc<Reaper>) -> Self {
        Self {
            preparer,
            spawner: Spawner::new(Arc::clone(&reaper)),
            reaper,
        }
    }
}

impl<L: UserLookup + 'static> ConnectionHandler for ContainerDaemon<L> {
    fn run(&self, spec: &ProcessSpec, tty: Option<&TtySpec>) -> Result<SpawnedProcess> {
        let params = self.preparer.prepare(spec, tty)?;
        self.spawner.spawn(params)
    }

    fn attach(&self, pid: i32) -> Result<i32> {
        tracing::debug!(pid, "attaching");
        self.reaper.wait(pid)
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        self.reaper.signal(pid, signal)
    }
}
