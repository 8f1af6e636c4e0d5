//! CLI command definitions and dispatch.

pub mod init;
pub mod logs;
pub mod network;
pub mod ps;
pub mod rm;
pub mod run;
pub mod stop;

use std::path::PathBuf;

use cellar_common::config::RuntimePaths;
use cellar_common::constants::{DEFAULT_DATA_DIR, DEFAULT_STATE_DIR};
use clap::{Parser, Subcommand};

/// cellar: a minimal, daemon-less Linux container runtime.
#[derive(Parser, Debug)]
#[command(name = "cellar", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding images, layers, and mount points.
    #[arg(long, global = true, env = "CELLAR_ROOT", default_value = DEFAULT_DATA_DIR)]
    pub root: PathBuf,

    /// Directory holding container records and network state.
    #[arg(long, global = true, env = "CELLAR_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,
}

impl Cli {
    /// On-disk layout selected by the global flags.
    #[must_use]
    pub fn paths(&self) -> RuntimePaths {
        RuntimePaths::new(&self.root, &self.state_dir)
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container from an image and run a command in it.
    Run(run::RunArgs),
    /// Container init process; not for direct use.
    #[command(hide = true)]
    Init,
    /// List containers.
    Ps(ps::PsArgs),
    /// Print the output of a detached container.
    Logs(logs::LogsArgs),
    /// Stop a running container.
    Stop(stop::StopArgs),
    /// Remove a stopped container and its filesystem.
    Rm(rm::RmArgs),
    /// Manage bridge networks.
    #[command(subcommand)]
    Network(network::NetworkCommand),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let paths = cli.paths();
    match cli.command {
        Command::Run(args) => run::execute(args, paths),
        Command::Init => init::execute(),
        Command::Ps(args) => ps::execute(&args, paths),
        Command::Logs(args) => logs::execute(&args, paths),
        Command::Stop(args) => stop::execute(&args, paths),
        Command::Rm(args) => rm::execute(&args, paths),
        Command::Network(command) => network::execute(command, paths),
    }
}
