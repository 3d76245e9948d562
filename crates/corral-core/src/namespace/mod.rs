//! Linux namespace management for container isolation.
//!
//! Translates the configured namespace set into `unshare(2)` flags and
//! writes user-namespace id maps.

pub mod user;

use corral_common::config::NamespaceSet;
use nix::sched::{CloneFlags, unshare};

/// Returns the `CLONE_NEW*` flags for the configured namespace set.
#[must_use]
pub fn clone_flags(set: &NamespaceSet) -> CloneFlags {
    let mut flags = CloneFlags::empty();
    flags.set(CloneFlags::CLONE_NEWPID, set.pid);
    flags.set(CloneFlags::CLONE_NEWNS, set.mount);
    flags.set(CloneFlags::CLONE_NEWNET, set.network);
    flags.set(CloneFlags::CLONE_NEWUSER, set.user);
    flags.set(CloneFlags::CLONE_NEWIPC, set.ipc);
    flags.set(CloneFlags::CLONE_NEWUTS, set.uts);
    flags
}

/// Moves the calling process into new namespaces.
///
/// Intended for a `pre_exec` hook of the container's init process. With
/// `CLONE_NEWPID` only the children of the caller land in the new PID
/// namespace; the init daemon forks a placeholder that becomes pid 1 there
/// before spawning anything else.
///
/// # Errors
///
/// Returns the errno of the failing `unshare(2)`.
pub fn unshare_all(flags: CloneFlags) -> nix::Result<()> {
    if flags.is_empty() {
        return Ok(());
    }
    unshare(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_set_excludes_user_namespace() {
        let flags = clone_flags(&NamespaceSet::default());
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
    }

    #[test]
    fn empty_set_unshares_nothing() {
        let set = NamespaceSet {
            pid: false,
            mount: false,
            network: false,
            user: false,
            ipc: false,
            uts: false,
        };
        let flags = clone_flags(&set);
        assert!(flags.is_empty());
        unshare_all(flags).unwrap();
    }
}
