//! Accept loop of the control socket.
//!
//! The socket is bound by the host in its own mount namespace and handed to
//! init as an inherited descriptor, so the host can connect to a path it
//! controls while the daemon serves from inside the container.

use std::io::Write;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corral_common::error::{CorralError, Result};
use corral_common::types::{ProcessSpec, Signal, TtySpec};
use corral_core::fd;
use tokio::net::UnixListener;

use crate::spawner::SpawnedProcess;
use crate::wire::{self, Request, Response};

/// Connections served at once. Each holds a blocking thread until its
/// request completes, an `attach` until the process exits; further
/// connections are accepted but wait for a free thread.
pub const MAX_CONNECTION_THREADS: usize = 1024;

/// Builds the runtime [`Listener::listen`] is meant to run on.
///
/// # Errors
///
/// Returns the error of the runtime builder.
pub fn connection_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .max_blocking_threads(MAX_CONNECTION_THREADS)
        .enable_all()
        .build()
}

/// Serves the requests arriving on a connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Starts a process.
    ///
    /// # Errors
    ///
    /// Any error is reported to the host in the response.
    fn run(&self, spec: &ProcessSpec, tty: Option<&TtySpec>) -> Result<SpawnedProcess>;

    /// Waits for a process to exit and returns its status.
    ///
    /// # Errors
    ///
    /// Any error is reported to the host in the response.
    fn attach(&self, pid: i32) -> Result<i32>;

    /// Delivers a signal to a process.
    ///
    /// # Errors
    ///
    /// Any error is reported to the host in the response.
    fn signal(&self, pid: i32, signal: Signal) -> Result<()>;
}

/// A listening Unix socket.
#[derive(Debug)]
pub struct Listener {
    socket: StdUnixListener,
    path: Option<PathBuf>,
}

impl Listener {
    /// Binds a new socket at `path`, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error if the socket cannot be bound.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| CorralError::io(path, e))?;
        }
        let socket = StdUnixListener::bind(path).map_err(|e| CorralError::io(path, e))?;
        tracing::debug!(path = %path.display(), "control socket bound");
        Ok(Self {
            socket,
            path: Some(path.to_path_buf()),
        })
    }

    /// Adopts a listening socket inherited at descriptor `raw` and marks it
    /// close-on-exec.
    ///
    /// # Safety
    ///
    /// `raw` must be an open listening Unix socket that nothing else in this
    /// process owns.
    ///
    /// # Errors
    ///
    /// Returns an error if the close-on-exec flag cannot be set.
    pub unsafe fn from_inherited(raw: RawFd) -> Result<Self> {
        // SAFETY: ownership of `raw` is transferred by the caller's contract.
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };
        fd::set_cloexec(owned.as_fd(), true)
            .map_err(|e| CorralError::io(format!("/proc/self/fd/{raw}"), e))?;
        Ok(Self {
            socket: StdUnixListener::from(owned),
            path: None,
        })
    }

    /// Path the socket was bound at, if it was bound by this process.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The listening descriptor, for handing to a child.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// Accepts connections until accepting fails.
    ///
    /// Every connection is served on its own blocking task, so a client
    /// waiting on a long-running process never stalls the accept loop. At
    /// most [`MAX_CONNECTION_THREADS`] are served at once on a runtime from
    /// [`connection_runtime`].
    ///
    /// # Errors
    ///
    /// Returns an `Io` error when the socket cannot be registered with the
    /// runtime or `accept(2)` fails.
    pub async fn listen<H: ConnectionHandler>(self, handler: Arc<H>) -> Result<()> {
        let origin = self
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("inherited socket"));
        self.socket
            .set_nonblocking(true)
            .map_err(|e| CorralError::io(&origin, e))?;
        let listener = UnixListener::from_std(self.socket).map_err(|e| CorralError::io(&origin, e))?;
        tracing::info!(socket = %origin.display(), "daemon listening");

        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| CorralError::io(&origin, e))?;
            let stream = match stream.into_std().and_then(|s| s.set_nonblocking(false).map(|()| s)) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping connection");
                    continue;
                }
            };
            let handler = Arc::clone(&handler);
            let _ = tokio::task::spawn_blocking(move || serve_connection(&*handler, &stream));
        }
    }
}

/// Reads one request from `stream`, dispatches it and writes the response.
///
/// Failures are logged and end the connection.
pub fn serve_connection<H: ConnectionHandler + ?Sized>(handler: &H, stream: &UnixStream) {
    let request = match serde_json::Deserializer::from_reader(stream)
        .into_iter::<Request>()
        .next()
    {
        Some(Ok(request)) => request,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "malformed request");
            return;
        }
        None => {
            tracing::debug!("connection closed before a request arrived");
            return;
        }
    };

    let (response, descriptors) = dispatch(handler, request);
    if let Err(e) = reply(stream, &response, &descriptors) {
        tracing::warn!(pid = response.pid, error = %e, "failed to send response");
    }
    // Closing our copies here makes a close on the host side take effect.
    drop(descriptors);
}

fn dispatch<H: ConnectionHandler + ?Sized>(handler: &H, request: Request) -> (Response, Vec<OwnedFd>) {
    match request {
        Request::Run { spec, tty } => match handler.run(&spec, tty.as_ref()) {
            Ok(spawned) => (Response::ok(spawned.pid), spawned.descriptors),
            Err(e) => {
                tracing::warn!(path = %spec.path, error = %e, "run failed");
                (Response::failed(0, &e), Vec::new())
            }
        },
        Request::Attach { pid } => match handler.attach(pid) {
            Ok(status) => (Response::exited(pid, status), Vec::new()),
            Err(e) => (Response::failed(pid, &e), Vec::new()),
        },
        Request::Signal { pid, signal } => match handler.signal(pid, signal) {
            Ok(()) => (Response::ok(pid), Vec::new()),
            Err(e) => (Response::failed(pid, &e), Vec::new()),
        },
    }
}

fn reply(stream: &UnixStream, response: &Response, descriptors: &[OwnedFd]) -> Result<()> {
    let line = wire::encode(response)?;
    let borrowed: Vec<BorrowedFd<'_>> = descriptors.iter().map(AsFd::as_fd).collect();
    let sent = fd::send_with_fds(stream.as_fd(), &line, &borrowed)
        .map_err(|e| CorralError::io("control socket", e))?;
    if sent < line.len() {
        let mut rest = stream;
        rest.write_all(&line[sent..])
            .map_err(|e| CorralError::io("control socket", e))?;
    }
    Ok(())
}
