//! Turns an abstract [`ProcessSpec`] into concrete execution parameters.

use std::path::PathBuf;

use corral_common::error::{CorralError, Result};
use corral_common::types::{ProcessSpec, ResourceLimits, TtySpec, WindowSize};
use corral_core::user::{self, ResolvedUser};

/// Resolves user names to ids.
pub trait UserLookup: Send + Sync {
    /// Looks `name` up. `Ok(None)` means no such user.
    ///
    /// # Errors
    ///
    /// Returns an error if the user database cannot be read.
    fn lookup(&self, name: &str) -> Result<Option<ResolvedUser>>;

    /// The identity of the calling process.
    fn current(&self) -> ResolvedUser;
}

/// Looks users up in the password database of the current mount namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct PasswdLookup;

impl UserLookup for PasswdLookup {
    fn lookup(&self, name: &str) -> Result<Option<ResolvedUser>> {
        user::lookup(name)
    }

    fn current(&self) -> ResolvedUser {
        user::current()
    }
}

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdio {
    /// One pty; the slave is stdin, stdout and stderr.
    Pty(Option<WindowSize>),
    /// Three separate pipes.
    Pipes,
}

/// Everything needed to start one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecParams {
    /// Program to execute.
    pub path: PathBuf,
    /// Arguments after the program name.
    pub args: Vec<String>,
    /// Complete environment of the child.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub dir: PathBuf,
    /// Identity to switch to before exec; `None` keeps the daemon's own.
    pub identity: Option<(u32, u32)>,
    /// Limits applied before exec.
    pub limits: ResourceLimits,
    /// Stream wiring.
    pub stdio: Stdio,
}

/// Prepares process specs for the [`Spawner`](crate::spawner::Spawner).
#[derive(Debug, Clone, Default)]
pub struct ProcessSpecPreparer<L = PasswdLookup> {
    users: L,
    default_limits: ResourceLimits,
}

impl<L: UserLookup> ProcessSpecPreparer<L> {
    /// Creates a preparer resolving users through `users`.
    pub fn new(users: L) -> Self {
        Self {
            users,
            default_limits: ResourceLimits::default(),
        }
    }

    /// Limits applied to every process unless its spec overrides them.
    #[must_use]
    pub const fn with_default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Resolves the user, environment, working directory, limits and stream
    /// wiring for `spec`.
    ///
    /// # Errors
    ///
    /// - `Spawn` if the path is empty or an environment entry has no `=`.
    /// - `UnknownUser` if the named user does not exist.
    pub fn prepare(&self, spec: &ProcessSpec, tty: Option<&TtySpec>) -> Result<ExecParams> {
        if spec.path.is_empty() {
            return Err(CorralError::Spawn {
                message: "empty program path".into(),
            });
        }

        let (resolved, identity) = if spec.user.is_empty() {
            (self.users.current(), None)
        } else {
            let found = self
                .users
                .lookup(&spec.user)?
                .ok_or_else(|| CorralError::UnknownUser {
                    user: spec.user.clone(),
                })?;
            let identity = Some((found.uid, found.gid));
            (found, identity)
        };

        let mut env = parse_env(&spec.env)?;
        if !env.iter().any(|(k, _)| k == "USER") {
            env.push(("USER".into(), resolved.name.clone()));
        }
        if !env.iter().any(|(k, _)| k == "HOME") {
            env.push(("HOME".into(), resolved.home.display().to_string()));
        }

        let dir = match spec.dir.as_deref() {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ if resolved.home.as_os_str().is_empty() => PathBuf::from("/"),
            _ => resolved.home,
        };

        Ok(ExecParams {
            path: PathBuf::from(&spec.path),
            args: spec.args.clone(),
            env,
            dir,
            identity,
            limits: spec.limits.merged_with(&self.default_limits),
            stdio: tty.map_or(Stdio::Pipes, |t| Stdio::Pty(t.window_size)),
        })
    }
}

fn parse_env(entries: &[String]) -> Result<Vec<(String, String)>> {
    entries
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| CorralError::Spawn {
                    message: format!("malformed environment entry {entry:?}"),
                })
        })
        .collect()
}
