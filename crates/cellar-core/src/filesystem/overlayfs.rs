//! `OverlayFS` management for layered container filesystems.
//!
//! Stacks the shared read-only image layer under a per-container
//! writable layer, giving each container a copy-on-write root.

use std::path::{Path, PathBuf};

use cellar_common::error::{CellarError, Result};
use nix::mount::MsFlags;

use crate::syscall::Syscall;

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers (bottom to top).
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`.
    pub work_dir: PathBuf,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Builds the option string passed as mount data.
    ///
    /// The kernel lists lower layers top first, so `lower_dirs` is
    /// reversed when joined.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lowers = self
            .lower_dirs
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "upperdir={},lowerdir={},workdir={}",
            self.upper_dir.display(),
            lowers,
            self.work_dir.display()
        )
    }
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// All directories must already exist.
///
/// # Errors
///
/// Returns [`CellarError::Mount`] if the mount call fails.
pub fn mount_overlay(syscall: &dyn Syscall, config: &OverlayConfig) -> Result<()> {
    let opts = config.mount_options();
    syscall
        .mount(
            Some(Path::new("overlay")),
            &config.merged_dir,
            Some("overlay"),
            MsFlags::empty(),
            Some(opts.as_str()),
        )
        .map_err(|e| CellarError::Mount {
            target: config.merged_dir.clone(),
            source: e.into(),
        })?;

    tracing::info!(merged = %config.merged_dir.display(), "overlayfs mounted");
    Ok(())
}
