//! `cellar init`: Entry point of the container's init process.
//!
//! The runtime re-executes itself with this subcommand inside the new
//! namespaces. It never returns on success: the process becomes the
//! user command.

use anyhow::Context;
use cellar_core::namespace::init::run_container_init;
use cellar_core::syscall::LinuxSyscall;

/// Executes the `init` command.
///
/// # Errors
///
/// Returns an error if the command cannot be received, the root
/// transition fails, or the command cannot be executed.
pub fn execute() -> anyhow::Result<()> {
    tracing::debug!("container init starting");
    match run_container_init(&LinuxSyscall).context("container init failed")? {}
}
