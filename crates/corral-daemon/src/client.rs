//! Host side of the control socket.
//!
//! A [`DaemonClient`] opens one connection per request. Processes started
//! through it come back as handles owning the descriptors the daemon sent.

use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};
use corral_common::types::{ProcessSpec, Signal, TtySpec, WindowSize};
use corral_core::fd;
use corral_core::pty;

use crate::wire::{self, MAX_RESPONSE_SIZE, Request, Response};

/// A process running inside a container.
pub trait Process: Send + Sync {
    /// Pid inside the container.
    fn id(&self) -> i32;

    /// Blocks until the process exits and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot be reached or no longer knows
    /// the process.
    fn wait(&self) -> Result<i32>;

    /// Delivers a signal to the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot be reached or rejects the
    /// signal.
    fn signal(&self, signal: Signal) -> Result<()>;
}

/// Connects to a container daemon's control socket.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    /// Creates a client for the socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// The socket this client connects to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Starts a process, with a pty when `tty` is given.
    ///
    /// # Errors
    ///
    /// As for [`DaemonClient::run_with_pipes`] and
    /// [`DaemonClient::run_with_tty`].
    pub fn run(&self, spec: &ProcessSpec, tty: Option<TtySpec>) -> Result<Box<dyn Process>> {
        Ok(match tty {
            Some(tty) => Box::new(self.run_with_tty(spec, tty)?),
            None => Box::new(self.run_with_pipes(spec)?),
        })
    }

    /// Starts a process whose streams are three pipes.
    ///
    /// # Errors
    ///
    /// `Spawn` if the daemon could not start the process, `Protocol` if the
    /// response is malformed or does not carry three descriptors.
    pub fn run_with_pipes(&self, spec: &ProcessSpec) -> Result<PipeProcess> {
        let (response, fds) = self.exchange(&Request::Run {
            spec: spec.clone(),
            tty: None,
        })?;
        let response = spawned(response)?;
        let [stdin, stdout, stderr]: [OwnedFd; 3] =
            fds.try_into().map_err(|fds: Vec<OwnedFd>| CorralError::Protocol {
                message: format!("expected 3 descriptors, got {}", fds.len()),
            })?;
        Ok(PipeProcess {
            pid: response.pid,
            client: self.clone(),
            stdin: Some(File::from(stdin)),
            stdout: Some(File::from(stdout)),
            stderr: Some(File::from(stderr)),
        })
    }

    /// Starts a process attached to a new pty.
    ///
    /// # Errors
    ///
    /// `Spawn` if the daemon could not start the process, `Protocol` if the
    /// response is malformed or does not carry exactly one descriptor.
    pub fn run_with_tty(&self, spec: &ProcessSpec, tty: TtySpec) -> Result<PtyProcess> {
        let (response, fds) = self.exchange(&Request::Run {
            spec: spec.clone(),
            tty: Some(tty),
        })?;
        let response = spawned(response)?;
        let [master]: [OwnedFd; 1] =
            fds.try_into().map_err(|fds: Vec<OwnedFd>| CorralError::Protocol {
                message: format!("expected 1 descriptor, got {}", fds.len()),
            })?;
        Ok(PtyProcess {
            pid: response.pid,
            client: self.clone(),
            master: File::from(master),
        })
    }

    /// Blocks until `pid` exits and returns its exit status.
    ///
    /// # Errors
    ///
    /// `Protocol` if the daemon reports an error or omits the status.
    pub fn attach(&self, pid: i32) -> Result<i32> {
        let (response, _) = self.exchange(&Request::Attach { pid })?;
        let response = accepted(response)?;
        response.exit_status.ok_or_else(|| CorralError::Protocol {
            message: format!("no exit status for pid {pid}"),
        })
    }

    /// Delivers `signal` to `pid`.
    ///
    /// # Errors
    ///
    /// `Protocol` if the daemon rejects the request.
    pub fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        let (response, _) = self.exchange(&Request::Signal { pid, signal })?;
        accepted(response).map(|_| ())
    }

    fn exchange(&self, request: &Request) -> Result<(Response, Vec<OwnedFd>)> {
        let stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| CorralError::io(&self.socket_path, e))?;
        (&stream)
            .write_all(&wire::encode(request)?)
            .map_err(|e| CorralError::io(&self.socket_path, e))?;
        read_response(&stream).map_err(|e| match e {
            CorralError::Io { source, .. } => CorralError::io(&self.socket_path, source),
            other => other,
        })
    }
}

/// Reads one response line and every descriptor attached to it.
fn read_response(stream: &UnixStream) -> Result<(Response, Vec<OwnedFd>)> {
    let mut buf = vec![0u8; MAX_RESPONSE_SIZE];
    let mut len = 0;
    let mut fds = Vec::new();
    while len < buf.len() {
        let (n, received) =
            fd::recv_with_fds(stream, &mut buf[len..]).map_err(|e| CorralError::io("", e))?;
        fds.extend(received);
        if n == 0 {
            break;
        }
        len += n;
        if buf[..len].ends_with(b"\n") {
            break;
        }
    }
    if len == 0 {
        return Err(CorralError::Protocol {
            message: "connection closed without a response".into(),
        });
    }
    Ok((wire::decode_response(&buf[..len])?, fds))
}

fn spawned(response: Response) -> Result<Response> {
    if response.is_error() {
        return Err(CorralError::Spawn {
            message: response.error_message,
        });
    }
    Ok(response)
}

fn accepted(response: Response) -> Result<Response> {
    if response.is_error() {
        return Err(CorralError::Protocol {
            message: response.error_message,
        });
    }
    Ok(response)
}

/// A process whose standard streams are pipes.
#[derive(Debug)]
pub struct PipeProcess {
    pid: i32,
    client: DaemonClient,
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
}

impl PipeProcess {
    /// Takes the write end of the process's stdin. Dropping it sends EOF.
    pub const fn take_stdin(&mut self) -> Option<File> {
        self.stdin.take()
    }

    /// Takes the read end of the process's stdout.
    pub const fn take_stdout(&mut self) -> Option<File> {
        self.stdout.take()
    }

    /// Takes the read end of the process's stderr.
    pub const fn take_stderr(&mut self) -> Option<File> {
        self.stderr.take()
    }
}

impl Process for PipeProcess {
    fn id(&self) -> i32 {
        self.pid
    }

    fn wait(&self) -> Result<i32> {
        self.client.attach(self.pid)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        self.client.signal(self.pid, signal)
    }
}

/// A process attached to a pty.
#[derive(Debug)]
pub struct PtyProcess {
    pid: i32,
    client: DaemonClient,
    master: File,
}

impl PtyProcess {
    /// The pty master: reads return the process's output, writes become its
    /// input.
    pub const fn master(&self) -> &File {
        &self.master
    }

    /// Resizes the terminal.
    ///
    /// # Errors
    ///
    /// Returns an `Io` error if the ioctl fails.
    pub fn set_window_size(&self, size: WindowSize) -> Result<()> {
        pty::set_window_size(self.master.as_fd(), size)
            .map_err(|e| CorralError::io(format!("pty master of pid {}", self.pid), e))
    }

    /// Applies a new terminal spec. Only the window size can change.
    ///
    /// # Errors
    ///
    /// As for [`PtyProcess::set_window_size`].
    pub fn set_tty(&self, tty: TtySpec) -> Result<()> {
        match tty.window_size {
            Some(size) => self.set_window_size(size),
            None => Ok(()),
        }
    }
}

impl Process for PtyProcess {
    fn id(&self) -> i32 {
        self.pid
    }

    fn wait(&self) -> Result<i32> {
        self.client.attach(self.pid)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        self.client.signal(self.pid, signal)
    }
}
