//! Starts prepared processes with pipes or a pty.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio as ChildStdio};
use std::sync::Arc;

use corral_common::error::{CorralError, Result};
use corral_common::types::WindowSize;
use corral_core::pty::{self, Pty};
use corral_core::rlimit;
use nix::fcntl::OFlag;
use nix::unistd::{Gid, Uid, setgid, setuid};

use crate::preparer::{ExecParams, Stdio};
use crate::reaper::Reaper;

/// A started process and the daemon-side ends of its streams.
///
/// `descriptors` is either the pty master, or the stdin writer followed by
/// the stdout and stderr readers.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Pid of the child; its exit is collected by the reaper.
    pub pid: i32,
    /// Descriptors to hand to the host.
    pub descriptors: Vec<OwnedFd>,
}

/// Spawns processes through a [`Reaper`].
#[derive(Debug, Clone)]
pub struct Spawner {
    reaper: Arc<Reaper>,
}

impl Spawner {
    /// Creates a spawner registering children with `reaper`.
    pub const fn new(reaper: Arc<Reaper>) -> Self {
        Self { reaper }
    }

    /// Starts the process described by `params`.
    ///
    /// Descriptors opened along the way are closed if anything fails.
    ///
    /// # Errors
    ///
    /// Returns an error if a pipe or pty cannot be opened or the program
    /// cannot be started.
    pub fn spawn(&self, params: ExecParams) -> Result<SpawnedProcess> {
        let mut command = Command::new(&params.path);
        let _ = command
            .args(&params.args)
            .env_clear()
            .envs(params.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&params.dir);

        let (descriptors, with_tty) = match params.stdio {
            Stdio::Pty(size) => (vec![wire_pty(&mut command, size)?], true),
            Stdio::Pipes => (wire_pipes(&mut command)?, false),
        };

        let limits = rlimit::settings(&params.limits);
        let identity = params.identity;
        // SAFETY: the hook only makes async-signal-safe calls and does not
        // allocate.
        unsafe {
            let _ = command.pre_exec(move || {
                rlimit::apply(&limits).map_err(io::Error::from)?;
                if with_tty {
                    pty::become_session_leader_with_tty()?;
                }
                if let Some((uid, gid)) = identity {
                    if libc::setgroups(0, std::ptr::null()) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    setgid(Gid::from_raw(gid)).map_err(io::Error::from)?;
                    setuid(Uid::from_raw(uid)).map_err(io::Error::from)?;
                }
                Ok(())
            });
        }

        let pid = self
            .reaper
            .spawn(&mut command)
            .map_err(|e| CorralError::Spawn {
                message: format!("{}: {e}", params.path.display()),
            })?;
        drop(command);
        tracing::info!(pid, path = %params.path.display(), tty = with_tty, "process started");
        Ok(SpawnedProcess { pid, descriptors })
    }
}

fn wire_pty(command: &mut Command, size: Option<WindowSize>) -> Result<OwnedFd> {
    let Pty { master, slave } = Pty::open(size)?;
    let clone = |fd: &OwnedFd| {
        fd.try_clone().map_err(|e| CorralError::Spawn {
            message: format!("duplicating pty slave: {e}"),
        })
    };
    let _ = command
        .stdin(ChildStdio::from(clone(&slave)?))
        .stdout(ChildStdio::from(clone(&slave)?))
        .stderr(ChildStdio::from(slave));
    Ok(master)
}

fn wire_pipes(command: &mut Command) -> Result<Vec<OwnedFd>> {
    let pipe = || nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| CorralError::os("pipe2", e));
    let (stdin_r, stdin_w) = pipe()?;
    let (stdout_r, stdout_w) = pipe()?;
    let (stderr_r, stderr_w) = pipe()?;
    let _ = command
        .stdin(ChildStdio::from(stdin_r))
        .stdout(ChildStdio::from(stdout_w))
        .stderr(ChildStdio::from(stderr_w));
    Ok(vec![stdin_w, stdout_r, stderr_r])
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::path::PathBuf;

    use corral_common::types::ResourceLimits;

    use super::*;

    fn params(path: &str, args: &[&str], stdio: Stdio) -> ExecParams {
        ExecParams {
            path: PathBuf::from(path),
            args: args.iter().map(ToString::to_string).collect(),
            env: vec![
                ("PATH".into(), "/usr/bin:/bin".into()),
                ("GREETING".into(), "hello".into()),
            ],
            dir: PathBuf::from("/"),
            identity: None,
            limits: ResourceLimits::default(),
            stdio,
        }
    }

    #[test]
    fn pipes_carry_stdin_stdout_and_stderr() {
        let reaper = Reaper::start().unwrap();
        let spawner = Spawner::new(Arc::clone(&reaper));
        let spawned = spawner
            .spawn(params("/bin/sh", &["-c", "read x; echo out:$x; echo err:$GREETING >&2"], Stdio::Pipes))
            .unwrap();
        let mut fds = spawned.descriptors.into_iter();
        let mut stdin = File::from(fds.next().unwrap());
        let mut stdout = File::from(fds.next().unwrap());
        let mut stderr = File::from(fds.next().unwrap());

        stdin.write_all(b"ping\n").unwrap();
        drop(stdin);
        let mut out = String::new();
        let _ = stdout.read_to_string(&mut out).unwrap();
        let mut err = String::new();
        let _ = stderr.read_to_string(&mut err).unwrap();

        assert_eq!(out, "out:ping\n");
        assert_eq!(err, "err:hello\n");
        assert_eq!(reaper.wait(spawned.pid).unwrap(), 0);
        reaper.stop();
    }

    #[test]
    fn pty_child_sees_a_terminal() {
        let reaper = Reaper::start().unwrap();
        let spawner = Spawner::new(Arc::clone(&reaper));
        let size = WindowSize { columns: 100, rows: 30 };
        let spawned = spawner
            .spawn(params("/bin/sh", &["-c", "test -t 0 && stty size"], Stdio::Pty(Some(size))))
            .unwrap();
        assert_eq!(spawned.descriptors.len(), 1);
        let mut master = File::from(spawned.descriptors.into_iter().next().unwrap());

        let mut buf = [0u8; 64];
        let n = master.read(&mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("30 100"));
        assert_eq!(reaper.wait(spawned.pid).unwrap(), 0);
        reaper.stop();
    }

    fn read_until_hangup(master: &mut File) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        // EIO once the child's side of the pty is gone.
        while let Ok(n @ 1..) = master.read(&mut buf) {
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn pty_child_does_not_hold_the_master() {
        let reaper = Reaper::start().unwrap();
        let spawner = Spawner::new(Arc::clone(&reaper));
        let spawned = spawner
            .spawn(params("/bin/sh", &["-c", "ls -l /proc/$$/fd/"], Stdio::Pty(None)))
            .unwrap();
        let mut master = File::from(spawned.descriptors.into_iter().next().unwrap());

        let listing = read_until_hangup(&mut master);
        assert!(listing.contains("/dev/pts/"), "{listing}");
        assert!(!listing.contains("ptmx"), "{listing}");
        assert_eq!(reaper.wait(spawned.pid).unwrap(), 0);
        reaper.stop();
    }

    #[test]
    fn dropping_the_master_hangs_up_the_child() {
        let reaper = Reaper::start().unwrap();
        let spawner = Spawner::new(Arc::clone(&reaper));
        let spawned = spawner
            .spawn(params("/bin/sh", &["-c", "read x"], Stdio::Pty(None)))
            .unwrap();
        drop(spawned.descriptors);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while reaper.try_status(spawned.pid).unwrap().is_none() {
            assert!(std::time::Instant::now() < deadline, "child survived hangup");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_ne!(reaper.wait(spawned.pid).unwrap(), 0);
        reaper.stop();
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let reaper = Reaper::start().unwrap();
        let err = Spawner::new(Arc::clone(&reaper))
            .spawn(params("/no/such/program", &[], Stdio::Pipes))
            .unwrap_err();
        assert!(matches!(err, CorralError::Spawn { .. }));
        reaper.stop();
    }
}
