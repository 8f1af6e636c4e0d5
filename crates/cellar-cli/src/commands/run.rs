//! `cellar run`: Create a container and run a command in it.

use anyhow::Context;
use cellar_common::config::RuntimePaths;
use cellar_common::types::ResourceLimits;
use cellar_runtime::{Engine, RunOptions};
use clap::Args;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Attach the container to this terminal and wait for it to exit.
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Container name; defaults to the generated id.
    #[arg(long)]
    pub container_name: Option<String>,

    /// Bind a host directory into the container, as HOST:CONTAINER.
    #[arg(short = 'v', long)]
    pub volume_mapping: Option<String>,

    /// Extra environment entries, as KEY=VALUE:KEY=VALUE.
    #[arg(short = 'e', long, value_delimiter = ':')]
    pub environments: Vec<String>,

    /// Memory limit, e.g. 100m.
    #[arg(short = 'm', long)]
    pub memory: Option<String>,

    /// Relative CPU weight.
    #[arg(long)]
    pub cpu_shares: Option<String>,

    /// CPUs the container may run on, e.g. 0-1.
    #[arg(long)]
    pub cpuset_cpus: Option<String>,

    /// Network to attach the container to.
    #[arg(long)]
    pub network: Option<String>,

    /// Publish a container port, as HOST:CONTAINER. Repeatable.
    #[arg(short = 'p', long)]
    pub publish: Vec<String>,

    /// Image name.
    pub image: String,

    /// Command and arguments to run inside the container.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Converts the flags into engine options.
    #[must_use]
    pub fn into_options(self) -> RunOptions {
        RunOptions {
            image: self.image,
            command: self.command,
            tty: self.tty,
            name: self.container_name,
            volume: self.volume_mapping,
            env: self
                .environments
                .into_iter()
                .filter(|e| !e.is_empty())
                .collect(),
            limits: ResourceLimits {
                memory: self.memory,
                cpu_shares: self.cpu_shares,
                cpuset_cpus: self.cpuset_cpus,
            },
            network: self.network,
            publish: self.publish,
        }
    }
}

/// Executes the `run` command.
///
/// A detached container keeps running after this returns; its name is
/// printed. With `--tty` the exit code of the container becomes the exit
/// code of `cellar`.
///
/// # Errors
///
/// Returns an error if validation or any creation step fails.
pub fn execute(args: RunArgs, paths: RuntimePaths) -> anyhow::Result<()> {
    let engine = Engine::new(paths)?;
    let options = args.into_options();
    let outcome = engine
        .run(&options)
        .with_context(|| format!("failed to run {}", options.image))?;

    for warning in &outcome.warnings {
        tracing::warn!(container = %outcome.name, "{warning}");
    }
    match outcome.exit_code {
        None => {
            println!("{}", outcome.name);
            Ok(())
        }
        Some(0) => Ok(()),
        Some(code) => std::process::exit(code),
    }
}
