//! # corral — Corral host
//!
//! Hosts containers on the local machine: restores containers left by a
//! previous run, keeps them until interrupted, and snapshots them on the
//! way out.

mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    commands::execute(cli)
}
