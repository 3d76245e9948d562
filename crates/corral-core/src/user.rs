//! User resolution against the password database visible to the caller.
//!
//! Inside a container's mount namespace this reads the container's own
//! `/etc/passwd`, which is what a process spawned there must run as.

use std::path::PathBuf;

use corral_common::error::{CorralError, Result};
use nix::unistd::{Gid, Uid, User, getgid, getuid};

/// A user resolved to concrete ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Home directory.
    pub home: PathBuf,
}

impl From<User> for ResolvedUser {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        }
    }
}

/// Looks a user up by name. `Ok(None)` means the user does not exist.
///
/// # Errors
///
/// Returns an error if the password database cannot be read.
pub fn lookup(name: &str) -> Result<Option<ResolvedUser>> {
    User::from_name(name)
        .map(|user| user.map(ResolvedUser::from))
        .map_err(|e| CorralError::os("getpwnam_r", e))
}

/// Returns the identity of the calling process.
///
/// The home directory falls back to `/` when the uid has no entry.
#[must_use]
pub fn current() -> ResolvedUser {
    let uid: Uid = getuid();
    let gid: Gid = getgid();
    match User::from_uid(uid) {
        Ok(Some(user)) => ResolvedUser::from(user),
        _ => ResolvedUser {
            name: uid.to_string(),
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            home: PathBuf::from("/"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves() {
        let root = lookup("root").unwrap().expect("root exists");
        assert_eq!(root.uid, 0);
        assert_eq!(root.gid, 0);
    }

    #[test]
    fn unknown_user_is_none() {
        assert!(lookup("no-such-user-corral").unwrap().is_none());
    }

    #[test]
    fn current_matches_getuid() {
        assert_eq!(current().uid, getuid().as_raw());
    }
}
