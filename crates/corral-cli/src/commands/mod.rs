//! CLI command definitions and dispatch.

pub mod capacity;
pub mod exec;
pub mod serve;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use corral_common::config::CorralConfig;
use corral_daemon::reaper::Reaper;
use corral_runtime::backend::LinuxBackend;
use corral_runtime::pool::LinuxContainerPool;
use corral_runtime::repository::InMemoryRepository;
use corral_runtime::system_info::ProcSystemInfo;

/// Corral — host-side container runtime.
#[derive(Parser, Debug)]
#[command(name = "corral", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file. Flags below override its values.
    #[arg(long, global = true, env = "CORRAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding one subdirectory per container.
    #[arg(long, global = true, env = "CORRAL_DEPOT_DIR")]
    pub depot_dir: Option<PathBuf>,

    /// Directory for container snapshots.
    #[arg(long, global = true, env = "CORRAL_SNAPSHOTS_DIR")]
    pub snapshots_dir: Option<PathBuf>,

    /// Init binary executed inside each container.
    #[arg(long, global = true, env = "CORRAL_INIT_BINARY")]
    pub init_binary: Option<PathBuf>,

    /// Network pool in CIDR notation.
    #[arg(long, global = true, env = "CORRAL_NETWORK_POOL")]
    pub network_pool: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host containers until interrupted.
    Serve(serve::ServeArgs),
    /// Report host capacity.
    Capacity(capacity::CapacityArgs),
    /// Run a program in a running container.
    Exec(exec::ExecArgs),
}

impl Cli {
    /// Loads the configuration file, if any, and applies flag overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn config(&self) -> anyhow::Result<CorralConfig> {
        let mut config = match &self.config {
            Some(path) => CorralConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CorralConfig::default(),
        };
        if let Some(dir) = &self.depot_dir {
            config.depot_dir.clone_from(dir);
        }
        if let Some(dir) = &self.snapshots_dir {
            config.snapshots_dir = Some(dir.clone());
        }
        if let Some(binary) = &self.init_binary {
            config.init_binary.clone_from(binary);
        }
        if let Some(network) = &self.network_pool {
            config.pool.network.clone_from(network);
        }
        Ok(config)
    }
}

/// Builds the host backend described by `config`, together with the
/// reaper its containers' init processes are registered with.
///
/// # Errors
///
/// Returns an error if the reaper cannot start or the pool bounds are
/// invalid.
pub fn build_backend(config: &CorralConfig) -> anyhow::Result<(LinuxBackend, Arc<Reaper>)> {
    let reaper = Reaper::start().context("starting reaper")?;
    let pool = LinuxContainerPool::new(config, Arc::clone(&reaper)).context("building container pool")?;
    let mut backend = LinuxBackend::new(
        Arc::new(pool),
        Arc::new(InMemoryRepository::new()),
        Arc::new(ProcSystemInfo::new(&config.depot_dir)),
    );
    if let Some(dir) = &config.snapshots_dir {
        backend = backend.with_snapshots(dir);
    }
    Ok((backend, reaper))
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli.config()?;
    match cli.command {
        Command::Serve(args) => serve::execute(&args, &config).map(|()| ExitCode::SUCCESS),
        Command::Capacity(args) => capacity::execute(&args, &config).map(|()| ExitCode::SUCCESS),
        Command::Exec(args) => exec::execute(args, &config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("corral.json");
        std::fs::write(&file, r#"{"depot_dir": "/from/file", "stop_timeout_secs": 3}"#).unwrap();

        let cli = Cli::parse_from([
            "corral",
            "--config",
            file.to_str().unwrap(),
            "--network-pool",
            "10.1.0.0/24",
            "capacity",
        ]);
        let config = cli.config().unwrap();
        assert_eq!(config.depot_dir, PathBuf::from("/from/file"));
        assert_eq!(config.stop_timeout_secs, 3);
        assert_eq!(config.pool.network, "10.1.0.0/24");

        let cli = Cli::parse_from([
            "corral",
            "capacity",
            "--config",
            file.to_str().unwrap(),
            "--depot-dir",
            "/from/flag",
        ]);
        assert_eq!(cli.config().unwrap().depot_dir, PathBuf::from("/from/flag"));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["corral", "--config", "/nonexistent/corral.json", "capacity"]);
        assert!(cli.config().is_err());
    }
}
