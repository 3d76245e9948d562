//! One-shot readiness signal from the container's init process to the host.
//!
//! The host creates a pipe, passes the write end to init at a fixed
//! descriptor number and blocks on the read end. Init writes a single JSON
//! token once it is ready to serve requests, or an error token if it is not.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use corral_common::error::{CorralError, Result};
use nix::fcntl::OFlag;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Token {
    Success,
    Error { message: String },
}

/// Host side of the rendezvous: waits for the token.
#[derive(Debug)]
pub struct PipeSynchronizer {
    reader: File,
}

/// Init side of the rendezvous: writes the token.
#[derive(Debug)]
pub struct SyncWriter {
    writer: File,
}

impl PipeSynchronizer {
    /// Creates the pipe. Both ends are close-on-exec.
    ///
    /// # Errors
    ///
    /// Returns an error if `pipe2(2)` fails.
    pub fn pair() -> Result<(Self, SyncWriter)> {
        let (read, write) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| CorralError::os("pipe2", e))?;
        Ok((
            Self {
                reader: File::from(read),
            },
            SyncWriter {
                writer: File::from(write),
            },
        ))
    }

    /// Blocks until init reports, or `timeout` passes.
    ///
    /// The caller must have dropped its own copy of the write end, otherwise
    /// a dead init is only noticed through the timeout.
    ///
    /// # Errors
    ///
    /// Returns a `Sync` error if init reported a failure, closed the pipe
    /// without reporting, or did not report in time.
    pub fn wait(self, timeout: Duration) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let reader = self.reader;
        let _ = thread::Builder::new()
            .name("rendezvous".into())
            .spawn(move || {
                let mut line = String::new();
                let read = BufReader::new(reader).read_line(&mut line).map(|_| line);
                let _ = tx.send(read);
            })
            .map_err(|e| CorralError::Sync {
                message: format!("cannot start rendezvous reader: {e}"),
            })?;

        let line = match rx.recv_timeout(timeout) {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                return Err(CorralError::Sync {
                    message: format!("reading rendezvous pipe: {e}"),
                });
            }
            Err(_) => {
                return Err(CorralError::Sync {
                    message: format!("timed out after {}s waiting for init", timeout.as_secs()),
                });
            }
        };
        parse_token(&line)
    }
}

fn parse_token(line: &str) -> Result<()> {
    if line.trim().is_empty() {
        return Err(CorralError::Sync {
            message: "unexpected end of file".into(),
        });
    }
    match serde_json::from_str::<Token>(line.trim()) {
        Ok(Token::Success) => Ok(()),
        Ok(Token::Error { message }) => Err(CorralError::Sync { message }),
        Err(e) => Err(CorralError::Sync {
            message: format!("malformed rendezvous token: {e}"),
        }),
    }
}

impl SyncWriter {
    /// Adopts a write end inherited at descriptor `fd` and marks it
    /// close-on-exec so programs spawned later do not inherit it.
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor that nothing else in this process
    /// owns.
    ///
    /// # Errors
    ///
    /// Returns an error if the close-on-exec flag cannot be set.
    pub unsafe fn from_inherited(fd: RawFd) -> Result<Self> {
        // SAFETY: ownership of `fd` is transferred by the caller's contract.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        corral_core::fd::set_cloexec(owned.as_fd(), true)
            .map_err(|e| CorralError::io(format!("/proc/self/fd/{fd}"), e))?;
        Ok(Self {
            writer: File::from(owned),
        })
    }

    /// The descriptor to hand to the child.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.writer.as_fd()
    }

    /// Reports readiness.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be written.
    pub fn signal_success(self) -> Result<()> {
        self.send(&Token::Success)
    }

    /// Reports that init could not start.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be written.
    pub fn signal_error(self, message: impl Into<String>) -> Result<()> {
        self.send(&Token::Error {
            message: message.into(),
        })
    }

    fn send(mut self, token: &Token) -> Result<()> {
        let mut line = serde_json::to_vec(token)?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .map_err(|e| CorralError::Sync {
                message: format!("writing rendezvous token: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn success_is_observed() {
        let (host, init) = PipeSynchronizer::pair().unwrap();
        init.signal_success().unwrap();
        host.wait(TIMEOUT).unwrap();
    }

    #[test]
    fn error_token_carries_message() {
        let (host, init) = PipeSynchronizer::pair().unwrap();
        init.signal_error("no socket").unwrap();
        let err = host.wait(TIMEOUT).unwrap_err();
        assert!(matches!(err, CorralError::Sync { message } if message == "no socket"));
    }

    #[test]
    fn closed_pipe_is_unexpected_eof() {
        let (host, init) = PipeSynchronizer::pair().unwrap();
        drop(init);
        let err = host.wait(TIMEOUT).unwrap_err();
        assert!(matches!(err, CorralError::Sync { message } if message == "unexpected end of file"));
    }

    #[test]
    fn silence_times_out() {
        let (host, _init) = PipeSynchronizer::pair().unwrap();
        let err = host.wait(Duration::from_millis(50)).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn adopted_descriptor_is_close_on_exec() {
        let (_host, init) = PipeSynchronizer::pair().unwrap();
        // SAFETY: dup only manipulates the descriptor table.
        let raw = unsafe { libc::dup(std::os::fd::AsRawFd::as_raw_fd(&init.as_fd())) };
        assert!(raw >= 0);
        // SAFETY: `raw` was just duplicated and is owned by nothing else.
        let adopted = unsafe { SyncWriter::from_inherited(raw) }.unwrap();
        // SAFETY: F_GETFD has no memory effects.
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
        drop(adopted);
    }
}
