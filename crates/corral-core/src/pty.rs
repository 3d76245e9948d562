//! Pseudo-terminal allocation and control.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use corral_common::error::{CorralError, Result};
use corral_common::types::WindowSize;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::pty::{OpenptyResult, Winsize, openpty};

/// A freshly allocated pty pair.
///
/// The slave end is meant for the child; the master end is what gets
/// handed to the host.
#[derive(Debug)]
pub struct Pty {
    /// Master side, kept by the controlling process.
    pub master: OwnedFd,
    /// Slave side, becomes the child's terminal.
    pub slave: OwnedFd,
}

impl Pty {
    /// Opens a new pty pair, optionally with an initial window size.
    ///
    /// Both ends are close-on-exec: a child only gets the slave through
    /// its standard streams, and closing the master hangs the session up.
    ///
    /// # Errors
    ///
    /// Returns an error if `openpty(3)` or `fcntl(2)` fails.
    pub fn open(size: Option<WindowSize>) -> Result<Self> {
        let winsize = size.map(to_winsize);
        let OpenptyResult { master, slave } =
            openpty(winsize.as_ref(), None::<&nix::sys::termios::Termios>)
                .map_err(|e| CorralError::os("openpty", e))?;
        for fd in [&master, &slave] {
            let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(|e| CorralError::os("fcntl", e))?;
        }
        tracing::debug!(master = master.as_raw_fd(), slave = slave.as_raw_fd(), "pty allocated");
        Ok(Self { master, slave })
    }
}

const fn to_winsize(size: WindowSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Applies a window size to a pty master.
///
/// # Errors
///
/// Returns the OS error if the `TIOCSWINSZ` ioctl fails.
pub fn set_window_size(master: BorrowedFd<'_>, size: WindowSize) -> io::Result<()> {
    let winsize = to_winsize(size);
    // SAFETY: TIOCSWINSZ reads a winsize struct that lives for the call.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &raw const winsize) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads the window size of a pty.
///
/// # Errors
///
/// Returns the OS error if the `TIOCGWINSZ` ioctl fails.
pub fn window_size(fd: BorrowedFd<'_>) -> io::Result<WindowSize> {
    let mut winsize = to_winsize(WindowSize { columns: 0, rows: 0 });
    // SAFETY: TIOCGWINSZ writes into a winsize struct owned by this frame.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &raw mut winsize) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(WindowSize {
        columns: winsize.ws_col,
        rows: winsize.ws_row,
    })
}

/// Makes standard input the controlling terminal of a new session.
///
/// Runs in a forked child after its standard streams point at the pty
/// slave. Only async-signal-safe calls are made.
///
/// # Errors
///
/// Returns the OS error if `setsid(2)` or the `TIOCSCTTY` ioctl fails.
pub fn become_session_leader_with_tty() -> io::Result<()> {
    nix::unistd::setsid().map_err(io::Error::from)?;
    // SAFETY: TIOCSCTTY takes an integer argument and no pointers.
    if unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn open_applies_initial_size() {
        let pty = Pty::open(Some(WindowSize {
            columns: 120,
            rows: 40,
        }))
        .unwrap();
        let size = window_size(pty.slave.as_fd()).unwrap();
        assert_eq!(size.columns, 120);
        assert_eq!(size.rows, 40);
    }

    #[test]
    fn both_ends_are_close_on_exec() {
        let pty = Pty::open(None).unwrap();
        for fd in [&pty.master, &pty.slave] {
            let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn resize_is_visible_on_slave() {
        let pty = Pty::open(None).unwrap();
        set_window_size(pty.master.as_fd(), WindowSize { columns: 80, rows: 24 }).unwrap();
        let size = window_size(pty.slave.as_fd()).unwrap();
        assert_eq!(size, WindowSize { columns: 80, rows: 24 });
    }
}
