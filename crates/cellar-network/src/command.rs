//! Running host networking tools.

use std::process::Command;

use cellar_common::error::{CellarError, Result};

/// Runs `program` with `args` and returns its stdout.
///
/// # Errors
///
/// Returns [`CellarError::ExternalCommand`] if the program cannot be
/// started or exits unsuccessfully; the message carries its stderr.
pub fn run(program: &str, args: &[&str]) -> Result<String> {
    tracing::trace!(program, ?args, "running command");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| CellarError::ExternalCommand {
            program: program.to_owned(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(CellarError::ExternalCommand {
            program: program.to_owned(),
            message: format!(
                "`{program} {}` exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
