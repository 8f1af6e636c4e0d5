//! `cellar stop`: Stop a running container.

use anyhow::Context;
use cellar_common::config::RuntimePaths;
use cellar_runtime::Engine;
use clap::Args;

/// Arguments for the `stop` command.
#[derive(Args, Debug)]
pub struct StopArgs {
    /// Container name.
    pub container: String,
}

/// Executes the `stop` command.
///
/// Sends `SIGTERM`, waits for the grace period, then `SIGKILL`.
///
/// # Errors
///
/// Returns an error if the container is unknown or cannot be signaled.
pub fn execute(args: &StopArgs, paths: RuntimePaths) -> anyhow::Result<()> {
    let engine = Engine::new(paths)?;
    let record = engine
        .stop(&args.container)
        .with_context(|| format!("failed to stop {}", args.container))?;
    println!("{}", record.name);
    Ok(())
}
