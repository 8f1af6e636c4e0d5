//! `cellar rm`: Remove a container and clean up its resources.

use anyhow::Context;
use cellar_common::config::RuntimePaths;
use cellar_runtime::Engine;
use clap::Args;

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container name.
    pub container: String,
}

/// Executes the `rm` command.
///
/// Releases the container's network endpoint, cgroup, and filesystem
/// layers, then deletes its record. A running container is refused.
///
/// # Errors
///
/// Returns an error if the container is unknown, still running, or any
/// teardown step fails.
pub fn execute(args: &RmArgs, paths: RuntimePaths) -> anyhow::Result<()> {
    let engine = Engine::new(paths)?;
    engine
        .remove(&args.container)
        .with_context(|| format!("failed to remove {}", args.container))?;
    println!("{}", args.container);
    Ok(())
}
