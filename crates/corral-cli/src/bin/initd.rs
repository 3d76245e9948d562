//! # corral-initd — Corral container init
//!
//! Started by the host inside the container's namespaces with two
//! descriptors already open: the write end of the rendezvous pipe at 4 and
//! the listening control socket at 5. Reports readiness on the pipe, then
//! serves run, attach and signal requests until killed.

#![allow(unsafe_code)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::Parser;
use corral_common::constants::{HOST_SOCKET_FD, SYNC_WRITER_FD};
use corral_daemon::daemon::ContainerDaemon;
use corral_daemon::listener::{Listener, connection_runtime};
use corral_daemon::preparer::{PasswdLookup, ProcessSpecPreparer};
use corral_daemon::reaper::Reaper;
use corral_daemon::rendezvous::SyncWriter;
use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, Pid, chdir, chroot, fork};
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "initd.log";
const ID_MAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Corral container init.
#[derive(Parser, Debug)]
#[command(name = "corral-initd", version, about, long_about = None)]
struct Args {
    /// Host-side run directory of the container; the log goes here.
    #[arg(long)]
    run_dir: PathBuf,

    /// Handle of the container, for log context.
    #[arg(long)]
    handle: String,

    /// Directory to chroot into before serving.
    #[arg(long)]
    rootfs: Option<PathBuf>,

    /// The host unshared a PID namespace; fork its pid 1 first.
    #[arg(long)]
    pid_namespace: bool,

    /// The host unshared a user namespace; wait for its id maps.
    #[arg(long)]
    user_namespace: bool,
}

/// Everything needed to serve once readiness has been reported.
struct Prepared {
    listener: Listener,
    reaper: Arc<Reaper>,
    runtime: tokio::runtime::Runtime,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Must precede every thread: the child keeps running after fork.
    let placeholder = if args.pid_namespace {
        Some(spawn_namespace_root()?)
    } else {
        None
    };

    // SAFETY: descriptor 4 is inherited from the host and owned by nothing
    // else in this process.
    let sync = unsafe { SyncWriter::from_inherited(SYNC_WRITER_FD) }
        .context("adopting rendezvous pipe")?;

    let prepared = match prepare(&args) {
        Ok(prepared) => prepared,
        Err(e) => {
            let message = format!("{e:#}");
            tracing::error!(handle = %args.handle, error = %message, "init failed");
            let _ = sync.signal_error(message);
            return Err(e);
        }
    };
    if let Some(pid) = placeholder {
        tracing::info!(handle = %args.handle, pid = pid.as_raw(), "pid namespace root running");
    }

    let Prepared {
        listener,
        reaper,
        runtime,
    } = prepared;
    let daemon = Arc::new(ContainerDaemon::new(
        ProcessSpecPreparer::new(PasswdLookup),
        Arc::clone(&reaper),
    ));

    sync.signal_success().context("reporting readiness")?;
    tracing::info!(handle = %args.handle, "init ready");

    let result = runtime.block_on(listener.listen(daemon));
    reaper.stop();
    result.context("serving control socket")
}

fn prepare(args: &Args) -> anyhow::Result<Prepared> {
    init_logging(&args.run_dir)?;

    if args.user_namespace {
        await_id_map(ID_MAP_TIMEOUT)?;
    }

    // SAFETY: descriptor 5 is inherited from the host and owned by nothing
    // else in this process.
    let listener = unsafe { Listener::from_inherited(HOST_SOCKET_FD) }
        .context("adopting control socket")?;

    if let Some(rootfs) = &args.rootfs {
        chroot(rootfs.as_path()).with_context(|| format!("chroot into {}", rootfs.display()))?;
        chdir("/").context("chdir to new root")?;
        tracing::info!(handle = %args.handle, rootfs = %rootfs.display(), "entered root filesystem");
    }

    let reaper = Reaper::start().context("starting reaper")?;
    let runtime = connection_runtime().context("building async runtime")?;
    Ok(Prepared {
        listener,
        reaper,
        runtime,
    })
}

fn init_logging(run_dir: &Path) -> anyhow::Result<()> {
    let path = run_dir.join(LOG_FILE);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

/// Waits until the host has written this process's uid map.
fn await_id_map(timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let map = std::fs::read_to_string("/proc/self/uid_map").context("reading uid map")?;
        if !map.trim().is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("uid map not written within {timeout:?}");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Forks the first process of the new PID namespace. It becomes pid 1
/// there, reaps orphans, and dies with this process, which takes the
/// namespace down with it.
fn spawn_namespace_root() -> anyhow::Result<Pid> {
    // SAFETY: no other thread exists yet.
    match unsafe { fork() }.context("forking pid namespace root")? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => namespace_root(),
    }
}

fn namespace_root() -> ! {
    // SAFETY: plain integer arguments; closing the inherited descriptors
    // leaves the rendezvous and socket to the parent alone.
    unsafe {
        let _ = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
        let _ = libc::close(SYNC_WRITER_FD);
        let _ = libc::close(HOST_SOCKET_FD);
    }
    loop {
        if let Err(Errno::ECHILD) = waitpid(Pid::from_raw(-1), None) {
            thread::sleep(Duration::from_secs(1));
        }
    }
}
