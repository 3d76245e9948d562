//! `corral exec` — Run a program in a running container.

use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::thread;

use anyhow::Context;
use clap::Args;
use corral_common::config::CorralConfig;
use corral_common::constants::{RUN_DIR, SOCKET_NAME};
use corral_common::types::{Handle, ProcessSpec, ResourceLimits, TtySpec};
use corral_daemon::client::{DaemonClient, Process};

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Handle of the container.
    pub handle: String,

    /// User to run as inside the container.
    #[arg(short, long)]
    pub user: Option<String>,

    /// Working directory inside the container.
    #[arg(short = 'w', long)]
    pub dir: Option<String>,

    /// Environment entry as `KEY=value`. Repeatable.
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Attach the program to a pseudo-terminal.
    #[arg(short, long)]
    pub tty: bool,

    /// Program and its arguments.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `exec` command and exits with the program's status.
///
/// # Errors
///
/// Returns an error if the container's daemon cannot be reached or the
/// program cannot be started.
pub fn execute(args: ExecArgs, config: &CorralConfig) -> anyhow::Result<ExitCode> {
    Handle::new(args.handle.as_str()).validate()?;
    let socket = config.depot_dir.join(&args.handle).join(RUN_DIR).join(SOCKET_NAME);
    let client = DaemonClient::new(socket);

    let (path, rest) = args.command.split_first().context("no program given")?;
    let spec = ProcessSpec {
        path: path.clone(),
        args: rest.to_vec(),
        env: args.env,
        dir: args.dir,
        user: args.user.unwrap_or_default(),
        limits: ResourceLimits::default(),
    };

    let status = if args.tty {
        run_with_tty(&client, &spec)
    } else {
        run_with_pipes(&client, &spec)
    }
    .with_context(|| format!("running {} in {}", spec.path, args.handle))?;
    tracing::debug!(handle = %args.handle, status, "program exited");

    Ok(ExitCode::from(u8::try_from(status).unwrap_or(u8::MAX)))
}

fn run_with_pipes(client: &DaemonClient, spec: &ProcessSpec) -> anyhow::Result<i32> {
    let mut process = client.run_with_pipes(spec)?;

    if let Some(mut stdin) = process.take_stdin() {
        // Detached: blocks on our stdin until the program no longer reads.
        let _ = thread::spawn(move || io::copy(&mut io::stdin(), &mut stdin));
    }
    let stdout = process
        .take_stdout()
        .map(|mut out| thread::spawn(move || io::copy(&mut out, &mut io::stdout())));
    let stderr = process
        .take_stderr()
        .map(|mut err| thread::spawn(move || io::copy(&mut err, &mut io::stderr())));

    let status = process.wait()?;
    for copier in [stdout, stderr].into_iter().flatten() {
        let _ = copier.join();
    }
    Ok(status)
}

fn run_with_tty(client: &DaemonClient, spec: &ProcessSpec) -> anyhow::Result<i32> {
    let process = client.run_with_tty(spec, TtySpec::default())?;

    let mut input = process.master().try_clone()?;
    let _ = thread::spawn(move || io::copy(&mut io::stdin(), &mut input));

    let mut output = process.master().try_clone()?;
    let reader = thread::spawn(move || {
        let mut buf = [0_u8; 4096];
        // The master reads EIO once the program's side of the pty closes.
        while let Ok(n @ 1..) = output.read(&mut buf) {
            let mut stdout = io::stdout();
            if stdout.write_all(&buf[..n]).and_then(|()| stdout.flush()).is_err() {
                break;
            }
        }
    });

    let status = process.wait()?;
    let _ = reader.join();
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_outside_the_depot_is_refused() {
        let args = ExecArgs {
            handle: "../other".into(),
            user: None,
            dir: None,
            env: Vec::new(),
            tty: false,
            command: vec!["/bin/true".into()],
        };
        let err = execute(args, &CorralConfig::default()).unwrap_err();
        assert!(err.to_string().contains("invalid handle"), "{err:#}");
    }
}
