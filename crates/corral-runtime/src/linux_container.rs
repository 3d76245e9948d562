//! Containers backed by Linux namespaces and an in-container init daemon.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use corral_common::config::{CorralConfig, NamespaceSet};
use corral_common::constants::{HOST_SOCKET_FD, RUN_DIR, SOCKET_NAME, SYNC_WRITER_FD};
use corral_common::error::{CorralError, Result};
use corral_common::types::{
    ContainerSpec, ContainerState, Handle, ProcessSpec, Properties, Signal, TtySpec,
};
use corral_core::fd;
use corral_core::namespace::{self, user::IdMapping};
use corral_daemon::client::{DaemonClient, Process};
use corral_daemon::listener::Listener;
use corral_daemon::reaper::Reaper;
use corral_daemon::rendezvous::PipeSynchronizer;
use corral_pool::Allocation;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::container::{Container, ContainerInfo};
use crate::fence::NetworkFencer;
use crate::snapshot::ContainerSnapshot;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Settings shared by every container of one host.
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Init binary executed in each container.
    pub init_binary: PathBuf,
    /// Namespaces unshared for each container.
    pub namespaces: NamespaceSet,
    /// Deadline for init to report readiness.
    pub rendezvous_timeout: Duration,
    /// Delay between asking processes to terminate and killing them.
    pub stop_timeout: Duration,
    /// Grace time for containers that do not set their own.
    pub grace_time: Option<Duration>,
}

impl ContainerSettings {
    /// Extracts the container settings from the host configuration.
    pub fn from_config(config: &CorralConfig) -> Self {
        Self {
            init_binary: config.init_binary.clone(),
            namespaces: config.namespaces,
            rendezvous_timeout: config.rendezvous_timeout(),
            stop_timeout: config.stop_timeout(),
            grace_time: config.container_grace_time(),
        }
    }
}

/// The container's init process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Init {
    /// Started by this host; the reaper owns its exit status.
    Child(i32),
    /// Started before a host restart; only signals reach it.
    Adopted(i32),
}

impl Init {
    const fn pid(self) -> i32 {
        match self {
            Self::Child(pid) | Self::Adopted(pid) => pid,
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ContainerState,
    init: Option<Init>,
    processes: BTreeSet<i32>,
}

/// A container whose processes run under `corral-initd` inside fresh
/// namespaces.
#[derive(Debug)]
pub struct LinuxContainer {
    allocation: Allocation,
    rootfs: String,
    properties: Properties,
    grace_time: Option<Duration>,
    path: PathBuf,
    created_at: DateTime<Utc>,
    settings: Arc<ContainerSettings>,
    reaper: Arc<Reaper>,
    fencer: Arc<dyn NetworkFencer>,
    client: DaemonClient,
    lifecycle: Mutex<Lifecycle>,
}

impl LinuxContainer {
    /// Creates a container in the `Creating` state. Nothing runs until
    /// [`Container::start`].
    pub fn new(
        allocation: Allocation,
        spec: &ContainerSpec,
        path: PathBuf,
        settings: Arc<ContainerSettings>,
        reaper: Arc<Reaper>,
        fencer: Arc<dyn NetworkFencer>,
    ) -> Self {
        let client = DaemonClient::new(socket_path(&path));
        Self {
            allocation,
            rootfs: spec.rootfs.clone(),
            properties: spec.properties.clone(),
            grace_time: spec.grace_time.or(settings.grace_time),
            path,
            created_at: Utc::now(),
            settings,
            reaper,
            fencer,
            client,
            lifecycle: Mutex::new(Lifecycle {
                state: ContainerState::Creating,
                init: None,
                processes: BTreeSet::new(),
            }),
        }
    }

    /// Rebuilds a container from a snapshot.
    ///
    /// A container whose init process is still alive comes back `Active`;
    /// otherwise it comes back `Stopped`.
    pub fn restore(
        snapshot: ContainerSnapshot,
        path: PathBuf,
        settings: Arc<ContainerSettings>,
        reaper: Arc<Reaper>,
        fencer: Arc<dyn NetworkFencer>,
    ) -> Self {
        let alive = snapshot
            .init_pid
            .filter(|&pid| snapshot.state == ContainerState::Active && is_alive(pid));
        let (state, init) = match alive {
            Some(pid) => (ContainerState::Active, Some(Init::Adopted(pid))),
            None => (ContainerState::Stopped, None),
        };
        tracing::info!(handle = %snapshot.allocation.handle, %state, "container restored");
        let client = DaemonClient::new(socket_path(&path));
        Self {
            rootfs: snapshot.rootfs,
            properties: snapshot.properties,
            grace_time: snapshot.grace_time_secs.map(Duration::from_secs),
            allocation: snapshot.allocation,
            path,
            created_at: snapshot.created_at,
            settings,
            reaper,
            fencer,
            client,
            lifecycle: Mutex::new(Lifecycle {
                state,
                init,
                processes: BTreeSet::new(),
            }),
        }
    }

    /// Resources bound to the container.
    pub const fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Depot directory of the container.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host pid of the init process, while it runs.
    pub fn init_pid(&self) -> Option<i32> {
        self.lifecycle().init.map(Init::pid)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ContainerState) {
        self.lifecycle().state = state;
    }

    fn init_command(&self, run_dir: &Path) -> Command {
        let mut command = Command::new(&self.settings.init_binary);
        let _ = command
            .arg("--run-dir")
            .arg(run_dir)
            .arg("--handle")
            .arg(self.allocation.handle.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if self.rootfs.starts_with('/') {
            let _ = command.arg("--rootfs").arg(&self.rootfs);
        }
        if self.settings.namespaces.pid {
            let _ = command.arg("--pid-namespace");
        }
        if self.settings.namespaces.user {
            let _ = command.arg("--user-namespace");
        }
        command
    }

    fn spawn_init(&self) -> Result<(i32, PipeSynchronizer)> {
        let run_dir = self.path.join(RUN_DIR);
        std::fs::create_dir_all(&run_dir).map_err(|e| CorralError::io(&run_dir, e))?;
        let listener = Listener::bind(&socket_path(&self.path))?;
        let (sync, writer) = PipeSynchronizer::pair()?;

        let mut command = self.init_command(&run_dir);
        let inherited = [
            (writer.as_fd().as_raw_fd(), SYNC_WRITER_FD),
            (listener.as_fd().as_raw_fd(), HOST_SOCKET_FD),
        ];
        let flags = namespace::clone_flags(&self.settings.namespaces);
        // SAFETY: the hook only calls fcntl, dup2 and unshare, none of
        // which allocate.
        unsafe {
            let _ = command.pre_exec(move || {
                fd::inherit_all(&inherited)?;
                namespace::unshare_all(flags).map_err(io::Error::from)
            });
        }

        let pid = self
            .reaper
            .spawn(&mut command)
            .map_err(|e| CorralError::Spawn {
                message: format!("{}: {e}", self.settings.init_binary.display()),
            })?;
        // Init holds the only copies now; a dead init must read as EOF.
        drop(writer);
        drop(listener);
        Ok((pid, sync))
    }

    fn await_init(&self, pid: i32, sync: PipeSynchronizer) -> Result<()> {
        if self.settings.namespaces.user {
            let host_pid = u32::try_from(pid).map_err(|_| CorralError::ProcessNotFound { pid })?;
            let uids = self.allocation.uids;
            namespace::user::write_id_maps(host_pid, IdMapping::root_at(uids.start, uids.size))?;
        }
        sync.wait(self.settings.rendezvous_timeout)?;
        self.fencer
            .setup(&self.allocation.handle, self.allocation.network)
    }

    fn signal_init(&self, init: Init, signal: Signal) {
        let result = match init {
            Init::Child(pid) => self.reaper.signal(pid, signal),
            Init::Adopted(pid) => kill(Pid::from_raw(pid), nix::sys::signal::Signal::from(signal))
                .map_err(|e| CorralError::os("kill", e)),
        };
        if let Err(e) = result {
            tracing::debug!(handle = %self.allocation.handle, pid = init.pid(), error = %e, "signal not delivered");
        }
    }

    fn has_exited(&self, init: Init) -> bool {
        match init {
            Init::Child(pid) => !matches!(self.reaper.try_status(pid), Ok(None)),
            Init::Adopted(pid) => !is_alive(pid),
        }
    }

    fn wait_for_exit(&self, init: Init, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.has_exited(init) {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        true
    }
}

fn socket_path(container_path: &Path) -> PathBuf {
    container_path.join(RUN_DIR).join(SOCKET_NAME)
}

fn is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

impl Container for LinuxContainer {
    fn handle(&self) -> &Handle {
        &self.allocation.handle
    }

    fn properties(&self) -> Properties {
        self.properties.clone()
    }

    fn grace_time(&self) -> Option<Duration> {
        self.grace_time
    }

    fn state(&self) -> ContainerState {
        self.lifecycle().state
    }

    fn start(&self) -> Result<()> {
        let state = self.state();
        if !matches!(state, ContainerState::Creating | ContainerState::Stopped) {
            return Err(CorralError::Config {
                message: format!("container {} is {state}", self.allocation.handle),
            });
        }

        let (pid, sync) = self.spawn_init()?;
        if let Err(e) = self.await_init(pid, sync) {
            tracing::warn!(handle = %self.allocation.handle, pid, error = %e, "init did not come up");
            self.signal_init(Init::Child(pid), Signal::Kill);
            let _ = self.reaper.wait(pid);
            return Err(e);
        }

        let mut lifecycle = self.lifecycle();
        lifecycle.init = Some(Init::Child(pid));
        lifecycle.state = ContainerState::Active;
        drop(lifecycle);
        tracing::info!(handle = %self.allocation.handle, pid, network = %self.allocation.network, "container started");
        Ok(())
    }

    fn stop(&self, kill: bool) -> Result<()> {
        let (init, processes) = {
            let lifecycle = self.lifecycle();
            (lifecycle.init, lifecycle.processes.clone())
        };
        let signal = if kill { Signal::Kill } else { Signal::Terminate };

        if let Some(init) = init {
            for pid in processes {
                if let Err(e) = self.client.signal(pid, signal) {
                    tracing::debug!(handle = %self.allocation.handle, pid, error = %e, "process already gone");
                }
            }
            self.signal_init(init, signal);
            if !self.wait_for_exit(init, self.settings.stop_timeout) {
                tracing::info!(handle = %self.allocation.handle, pid = init.pid(), "init ignored termination; killing");
                self.signal_init(init, Signal::Kill);
                if !self.wait_for_exit(init, self.settings.stop_timeout) {
                    return Err(CorralError::Spawn {
                        message: format!("init {} of {} did not exit", init.pid(), self.allocation.handle),
                    });
                }
            }
            if let Init::Child(pid) = init {
                let status = self.reaper.wait(pid)?;
                tracing::debug!(handle = %self.allocation.handle, pid, status, "init exited");
            }
        }

        let mut lifecycle = self.lifecycle();
        lifecycle.init = None;
        lifecycle.processes.clear();
        lifecycle.state = ContainerState::Stopped;
        drop(lifecycle);
        tracing::info!(handle = %self.allocation.handle, kill, "container stopped");
        Ok(())
    }

    fn info(&self) -> Result<ContainerInfo> {
        let lifecycle = self.lifecycle();
        Ok(ContainerInfo {
            handle: self.allocation.handle.clone(),
            state: lifecycle.state,
            host_ip: self.allocation.network.host_ip(),
            container_ip: self.allocation.network.container_ip(),
            container_path: self.path.clone(),
            properties: self.properties.clone(),
            process_ids: lifecycle.processes.iter().copied().collect(),
            created_at: self.created_at,
        })
    }

    fn snapshot(&self, out: &mut dyn Write) -> Result<()> {
        let lifecycle = self.lifecycle();
        let snapshot = ContainerSnapshot {
            allocation: self.allocation.clone(),
            rootfs: self.rootfs.clone(),
            properties: self.properties.clone(),
            grace_time_secs: self.grace_time.map(|d| d.as_secs()),
            state: lifecycle.state,
            init_pid: lifecycle.init.map(Init::pid),
            created_at: self.created_at,
        };
        drop(lifecycle);
        serde_json::to_writer(out, &snapshot)?;
        Ok(())
    }

    fn cleanup(&self) -> Result<()> {
        let detached = std::mem::take(&mut self.lifecycle().processes);
        tracing::debug!(handle = %self.allocation.handle, processes = detached.len(), "detached from processes");
        Ok(())
    }

    fn run(&self, spec: &ProcessSpec, tty: Option<TtySpec>) -> Result<Box<dyn Process>> {
        let state = self.state();
        if state != ContainerState::Active {
            return Err(CorralError::Config {
                message: format!("container {} is {state}", self.allocation.handle),
            });
        }
        let process = self.client.run(spec, tty)?;
        let _ = self.lifecycle().processes.insert(process.id());
        tracing::info!(handle = %self.allocation.handle, pid = process.id(), path = %spec.path, "process running");
        Ok(process)
    }

    fn attach(&self, pid: i32) -> Result<i32> {
        if !self.lifecycle().processes.contains(&pid) {
            return Err(CorralError::ProcessNotFound { pid });
        }
        let status = self.client.attach(pid)?;
        let _ = self.lifecycle().processes.remove(&pid);
        Ok(status)
    }
}
