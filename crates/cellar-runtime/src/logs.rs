//! Container log management.
//!
//! A detached container's stdout and stderr are redirected into a file
//! inside its record directory.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use cellar_common::config::RuntimePaths;
use cellar_common::error::{CellarError, Result};

/// Returns the log file path for a container.
#[must_use]
pub fn log_path(paths: &RuntimePaths, container: &str) -> PathBuf {
    paths.container_log(container)
}

/// Creates (or truncates) the log file the init process will write to.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created.
pub fn create_log(paths: &RuntimePaths, container: &str) -> Result<File> {
    let path = log_path(paths, container);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CellarError::io(parent, e))?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| CellarError::io(&path, e))
}

/// Reads container logs from disk.
///
/// Returns an empty string if the log file does not exist, as for a
/// container started with a terminal.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(paths: &RuntimePaths, container: &str) -> Result<String> {
    let path = log_path(paths, container);
    if !path.exists() {
        return Ok(String::new());
    }
    std::fs::read_to_string(&path).map_err(|e| CellarError::io(path, e))
}
