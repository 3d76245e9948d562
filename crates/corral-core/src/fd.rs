//! Descriptor hand-off across process and namespace boundaries.
//!
//! Two mechanisms are covered: clearing and re-arming `FD_CLOEXEC` on
//! descriptors a child must inherit at a fixed number, and moving
//! descriptors over a Unix socket as `SCM_RIGHTS` ancillary data.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

/// Upper bound on descriptors carried by one message (stdin, stdout, stderr).
pub const MAX_FDS_PER_MESSAGE: usize = 3;

/// Sets or clears the close-on-exec flag of a descriptor.
///
/// # Errors
///
/// Returns the OS error if `fcntl(2)` fails.
pub fn set_cloexec(fd: BorrowedFd<'_>, cloexec: bool) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: F_GETFD on a borrowed, open descriptor has no memory effects.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if cloexec {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    // SAFETY: as above; only the descriptor flag word is changed.
    if unsafe { libc::fcntl(raw, libc::F_SETFD, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Duplicates `fd` onto `target` inside a freshly forked child.
///
/// `dup2(2)` leaves the new descriptor without `FD_CLOEXEC`, so it survives
/// the following `exec`. When `fd` already equals `target` the flag is
/// cleared explicitly instead.
///
/// Only async-signal-safe calls are made, so this may run from a
/// `pre_exec` hook.
///
/// # Errors
///
/// Returns the OS error if `dup2(2)` or `fcntl(2)` fails.
pub fn inherit_at(fd: RawFd, target: RawFd) -> io::Result<()> {
    if fd == target {
        // SAFETY: the caller guarantees `fd` is open in this process.
        return set_cloexec(unsafe { BorrowedFd::borrow_raw(fd) }, false);
    }
    // SAFETY: dup2 only manipulates the descriptor table.
    if unsafe { libc::dup2(fd, target) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Places several descriptors at fixed numbers inside a forked child.
///
/// Sources are first moved above every target so that placing one
/// descriptor never clobbers another source still waiting to be placed.
/// At most [`MAX_FDS_PER_MESSAGE`] pairs are placed; no allocation happens,
/// so this may run from a `pre_exec` hook.
///
/// # Errors
///
/// Returns the OS error of the first failing `fcntl(2)` or `dup2(2)`.
pub fn inherit_all(pairs: &[(RawFd, RawFd)]) -> io::Result<()> {
    let floor = pairs.iter().map(|&(_, target)| target).max().unwrap_or(0) + 1;
    let mut moved = [(0, 0); MAX_FDS_PER_MESSAGE];
    for (slot, &(fd, target)) in moved.iter_mut().zip(pairs) {
        // SAFETY: F_DUPFD_CLOEXEC only manipulates the descriptor table.
        let high = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
        if high < 0 {
            return Err(io::Error::last_os_error());
        }
        *slot = (high, target);
    }
    for &(fd, target) in moved.iter().take(pairs.len()) {
        inherit_at(fd, target)?;
    }
    Ok(())
}

/// Sends `payload` with `fds` attached as `SCM_RIGHTS` in a single message.
///
/// The descriptors stay open on this side; dropping the owners after a
/// successful send is what hands ownership over to the receiver.
///
/// # Errors
///
/// Returns the OS error if `sendmsg(2)` fails.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn send_with_fds(socket: BorrowedFd<'_>, payload: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    let data_len = mem::size_of_val(raw.as_slice());

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr().cast_mut().cast(),
        iov_len: payload.len(),
    };

    // SAFETY: an all-zero msghdr is a valid empty message header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;

    // u64 storage keeps the control buffer aligned for cmsghdr.
    let mut control: Vec<u64> = Vec::new();
    if !raw.is_empty() {
        // SAFETY: CMSG_SPACE is pure arithmetic.
        let space = unsafe { libc::CMSG_SPACE(data_len as u32) } as usize;
        control.resize(space.div_ceil(mem::size_of::<u64>()), 0);
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        // SAFETY: msg_control points to a zeroed buffer of at least
        // CMSG_SPACE(data_len) bytes, so the first header and its data
        // area are in bounds.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
            ptr::copy_nonoverlapping(raw.as_ptr().cast::<u8>(), libc::CMSG_DATA(cmsg), data_len);
        }
    }

    // SAFETY: msg references iov, payload and control, all alive here.
    let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &raw const msg, libc::MSG_NOSIGNAL) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

/// Receives one message into `buf` together with any attached descriptors.
///
/// Received descriptors are close-on-exec. If the sender attached more than
/// [`MAX_FDS_PER_MESSAGE`] descriptors the call fails and every descriptor
/// that did arrive is closed.
///
/// # Errors
///
/// Returns the OS error if `recvmsg(2)` fails, or an error if the control
/// data was truncated.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::unnecessary_cast
)]
pub fn recv_with_fds(socket: impl AsFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    // SAFETY: CMSG_SPACE is pure arithmetic.
    let space = unsafe { libc::CMSG_SPACE((MAX_FDS_PER_MESSAGE * mem::size_of::<RawFd>()) as u32) } as usize;
    let mut control: Vec<u64> = vec![0; space.div_ceil(mem::size_of::<u64>())];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: an all-zero msghdr is a valid empty message header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = space as _;

    // SAFETY: msg references buffers that outlive the call.
    let received = unsafe {
        libc::recvmsg(
            socket.as_fd().as_raw_fd(),
            &raw mut msg,
            libc::MSG_CMSG_CLOEXEC,
        )
    };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    // SAFETY: the kernel filled msg_control with well-formed headers and
    // updated msg_controllen; the CMSG_* walkers stay within it.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize - header) / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg);
                for i in 0..count {
                    let raw_fd = ptr::read_unaligned(data.add(i * mem::size_of::<RawFd>()).cast::<RawFd>());
                    fds.push(OwnedFd::from_raw_fd(raw_fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&raw const msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::other("descriptor list truncated"));
    }
    Ok((received as usize, fds))
}
