//! `cellar logs`: View container logs.

use anyhow::Context;
use cellar_common::config::RuntimePaths;
use cellar_runtime::Engine;
use clap::Args;

/// Arguments for the `logs` command.
#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Container name.
    pub container: String,
}

/// Executes the `logs` command.
///
/// Prints what a detached container wrote to stdout and stderr.
///
/// # Errors
///
/// Returns an error if the container is not found or its log cannot be
/// read.
pub fn execute(args: &LogsArgs, paths: RuntimePaths) -> anyhow::Result<()> {
    let engine = Engine::new(paths)?;
    let logs = engine
        .logs(&args.container)
        .with_context(|| format!("cannot read logs of {}", args.container))?;

    if logs.is_empty() {
        eprintln!("No logs available for container: {}", args.container);
    } else {
        print!("{logs}");
    }
    Ok(())
}
