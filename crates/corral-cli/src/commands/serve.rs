//! `corral serve` — Host containers until interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use corral_common::config::CorralConfig;
use corral_runtime::backend::Backend;

/// Arguments for the `serve` command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Seconds between health checks while serving. Zero disables them.
    #[arg(long, default_value_t = 30)]
    pub ping_interval: u64,
}

/// Executes the `serve` command: setup, start, wait for Ctrl+C, stop.
///
/// # Errors
///
/// Returns an error if the backend cannot be set up, started or stopped.
pub fn execute(args: &ServeArgs, config: &CorralConfig) -> anyhow::Result<()> {
    let (backend, reaper) = super::build_backend(config)?;
    backend.setup().context("setting up backend")?;
    backend.start().context("restoring containers")?;
    tracing::info!(depot = %config.depot_dir.display(), "corral serving");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    let tick = Duration::from_millis(250);
    let ping_every = Duration::from_secs(args.ping_interval);
    let mut since_ping = Duration::ZERO;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(tick);
        since_ping += tick;
        if !ping_every.is_zero() && since_ping >= ping_every {
            since_ping = Duration::ZERO;
            if let Err(e) = backend.ping() {
                tracing::warn!(error = %e, "backend unhealthy");
            }
        }
    }

    tracing::info!("shutting down");
    let result = backend.stop().context("saving containers");
    reaper.stop();
    result
}
