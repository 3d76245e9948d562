//! Collects the exit status of every process started through it.
//!
//! A single supervisor thread is the only caller of `waitpid(2)`, and only
//! for pids registered here. A child that exits before it is registered
//! stays a zombie until the next poll after registration, so the fork
//! itself runs outside the table lock.

use std::collections::{HashMap, HashSet};
use std::io;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use corral_common::constants::UNKNOWN_EXIT_STATUS;
use corral_common::error::{CorralError, Result};
use corral_common::types::Signal;
use nix::sys::signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

/// How often the supervisor polls registered children.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct ExitTable {
    running: HashSet<i32>,
    exited: HashMap<i32, i32>,
}

/// Owner of "wait for exit" for every process it spawned.
#[derive(Debug)]
pub struct Reaper {
    table: Mutex<ExitTable>,
    changed: Condvar,
    active: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    /// Starts the supervisor thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start() -> io::Result<Arc<Self>> {
        let reaper = Arc::new(Self {
            table: Mutex::new(ExitTable::default()),
            changed: Condvar::new(),
            active: AtomicBool::new(true),
            supervisor: Mutex::new(None),
        });
        let supervised = Arc::clone(&reaper);
        let handle = thread::Builder::new()
            .name("reaper".into())
            .spawn(move || supervised.supervise())?;
        *reaper
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        tracing::debug!("reaper started");
        Ok(reaper)
    }

    fn table(&self) -> MutexGuard<'_, ExitTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `command` and registers the child. Returns its pid.
    ///
    /// The returned pid must only be waited on through [`Reaper::wait`].
    ///
    /// # Errors
    ///
    /// Returns the spawn error.
    pub fn spawn(&self, command: &mut Command) -> io::Result<i32> {
        let child = command.spawn()?;
        let pid = i32::try_from(child.id()).map_err(io::Error::other)?;
        let _ = self.table().running.insert(pid);
        tracing::debug!(pid, "registered child");
        Ok(pid)
    }

    fn supervise(&self) {
        while self.active.load(Ordering::Acquire) {
            let mut table = self.table();
            let mut published = false;
            let pids: Vec<i32> = table.running.iter().copied().collect();
            for pid in pids {
                let Some(status) = poll(pid) else {
                    continue;
                };
                let _ = table.running.remove(&pid);
                let _ = table.exited.insert(pid, status);
                tracing::debug!(pid, status, "child exited");
                published = true;
            }
            if published {
                self.changed.notify_all();
            }
            let _ = self
                .changed
                .wait_timeout(table, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
        }
        tracing::debug!("reaper stopped");
    }

    /// Blocks until `pid` exits and returns its status.
    ///
    /// The status is handed out once; later calls for the same pid report
    /// `ProcessNotFound`.
    ///
    /// # Errors
    ///
    /// `ProcessNotFound` if the pid was never registered or its status was
    /// already claimed. `Os` if the reaper stops before the pid exits.
    pub fn wait(&self, pid: i32) -> Result<i32> {
        let mut table = self.table();
        loop {
            if let Some(status) = table.exited.remove(&pid) {
                return Ok(status);
            }
            if !table.running.contains(&pid) {
                return Err(CorralError::ProcessNotFound { pid });
            }
            if !self.active.load(Ordering::Acquire) {
                return Err(CorralError::os("waitpid", nix::Error::ECHILD));
            }
            table = self
                .changed
                .wait(table)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Returns the status of `pid` without claiming it. `None` while it
    /// runs.
    ///
    /// # Errors
    ///
    /// `ProcessNotFound` if the pid is unknown.
    pub fn try_status(&self, pid: i32) -> Result<Option<i32>> {
        let table = self.table();
        if let Some(&status) = table.exited.get(&pid) {
            return Ok(Some(status));
        }
        if table.running.contains(&pid) {
            return Ok(None);
        }
        Err(CorralError::ProcessNotFound { pid })
    }

    /// Pids of processes still running.
    pub fn running(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.table().running.iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Delivers `signal` to a running, registered process.
    ///
    /// # Errors
    ///
    /// `ProcessNotFound` if the pid is not running under this reaper, `Os`
    /// if `kill(2)` fails.
    pub fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        let table = self.table();
        if !table.running.contains(&pid) {
            return Err(CorralError::ProcessNotFound { pid });
        }
        signal::kill(Pid::from_raw(pid), nix::sys::signal::Signal::from(signal))
            .map_err(|e| CorralError::os("kill", e))?;
        drop(table);
        tracing::debug!(pid, ?signal, "signal delivered");
        Ok(())
    }

    /// Stops the supervisor. Waiters for processes still running are
    /// released with an error.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.changed.notify_all();
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("reaper thread panicked");
            }
        }
    }
}

/// Non-blocking check of one child. `None` while it is still running.
fn poll(pid: i32) -> Option<i32> {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Some(code),
        Ok(WaitStatus::Signaled(_, sig, _)) => Some(128 + sig as i32),
        Ok(_) => None,
        Err(e) => {
            tracing::error!(pid, error = %e, "waitpid failed");
            Some(UNKNOWN_EXIT_STATUS)
        }
    }
}
