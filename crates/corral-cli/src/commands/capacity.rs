//! `corral capacity` — Report host capacity.

use anyhow::Context;
use clap::Args;
use corral_common::config::CorralConfig;
use corral_runtime::backend::Backend;

use crate::output::format_bytes;

/// Arguments for the `capacity` command.
#[derive(Args, Debug)]
pub struct CapacityArgs {
    /// Print the capacity as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Executes the `capacity` command.
///
/// # Errors
///
/// Returns an error if the depot cannot be prepared or host totals cannot
/// be read.
#[allow(clippy::print_stdout)]
pub fn execute(args: &CapacityArgs, config: &CorralConfig) -> anyhow::Result<()> {
    let (backend, reaper) = super::build_backend(config)?;
    let capacity = backend
        .setup()
        .and_then(|()| backend.capacity())
        .context("reading capacity");
    reaper.stop();
    let capacity = capacity?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&capacity)?);
    } else {
        println!("memory          {}", format_bytes(capacity.memory_in_bytes));
        println!("disk            {}", format_bytes(capacity.disk_in_bytes));
        println!("max containers  {}", capacity.max_containers);
    }
    Ok(())
}
