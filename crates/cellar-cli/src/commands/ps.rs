//! `cellar ps`: List containers.

use cellar_common::config::RuntimePaths;
use cellar_runtime::Engine;
use clap::Args;

use crate::output::Table;

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Only print container names.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Executes the `ps` command.
///
/// Lists every container record. A record whose init process has died
/// is reported, and saved, as exited.
///
/// # Errors
///
/// Returns an error if the records cannot be read.
pub fn execute(args: &PsArgs, paths: RuntimePaths) -> anyhow::Result<()> {
    let engine = Engine::new(paths)?;
    let containers = engine.list()?;

    if args.quiet {
        for c in &containers {
            println!("{}", c.name);
        }
        return Ok(());
    }

    let mut table = Table::new(["ID", "NAME", "PID", "STATUS", "COMMAND", "CREATED"]);
    for c in &containers {
        table.row(vec![
            c.id.to_string(),
            c.name.clone(),
            c.pid.to_string(),
            c.status.to_string(),
            c.command.clone(),
            c.create_time.clone(),
        ]);
    }
    print!("{}", table.render());
    Ok(())
}
