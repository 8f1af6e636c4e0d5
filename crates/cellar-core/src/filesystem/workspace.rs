//! Per-container filesystem workspace.
//!
//! A workspace is the shared read-only image layer, a writable upper
//! layer, an overlay scratch directory, the merged mount point, and an
//! optional host volume bound inside it. Creation stacks them in that
//! order; teardown removes them in reverse, volume first, because the
//! kernel refuses to unmount the merged root while the bind sits on it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use cellar_common::config::RuntimePaths;
use cellar_common::error::{CellarError, Result, StepErrors};
use nix::errno::Errno;
use nix::mount::MntFlags;

use super::layer;
use super::mount::bind_mount;
use super::overlayfs::{OverlayConfig, mount_overlay};
use super::volume::VolumeMapping;
use crate::syscall::Syscall;

/// Result of a successful [`Workspace::create`].
#[derive(Debug)]
pub struct MountedWorkspace {
    /// Merged root filesystem of the container.
    pub root: PathBuf,
    /// Volume bound inside the root, if one was requested and valid.
    pub volume: Option<VolumeMapping>,
    /// Why a requested volume was skipped, if it was.
    pub volume_error: Option<CellarError>,
}

/// Builds and tears down container workspaces under a [`RuntimePaths`].
pub struct Workspace<'a> {
    paths: &'a RuntimePaths,
    syscall: &'a dyn Syscall,
}

impl<'a> Workspace<'a> {
    /// Creates a workspace manager.
    #[must_use]
    pub fn new(paths: &'a RuntimePaths, syscall: &'a dyn Syscall) -> Self {
        Self { paths, syscall }
    }

    /// Ensures the read-only layer for `image` exists and returns it.
    ///
    /// An already extracted layer is reused as is.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Extraction`] if the layer is absent and the
    /// archive is missing or cannot be unpacked.
    pub fn prepare_read_only_layer(&self, image: &str) -> Result<PathBuf> {
        let target = self.paths.read_only_layer(image);
        if target.is_dir() {
            tracing::debug!(image, layer = %target.display(), "reusing extracted layer");
            return Ok(target);
        }
        let archive = layer::find_image_archive(&self.paths.image_dir(), image).ok_or_else(|| {
            CellarError::Extraction {
                image: image.to_owned(),
                message: format!("no archive in {}", self.paths.image_dir().display()),
            }
        })?;
        layer::extract_layer(image, &archive, &target)?;
        Ok(target)
    }

    /// Creates the writable upper layer of `container`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Directory`] if it cannot be created.
    pub fn prepare_write_layer(&self, container: &str) -> Result<PathBuf> {
        let dir = self.paths.write_layer(container);
        create_dir(&dir)?;
        Ok(dir)
    }

    /// Mounts the merged root of `container` over `image`'s layer.
    ///
    /// The overlay work directory is recreated empty on every call.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Directory`] or [`CellarError::Mount`].
    pub fn mount_root(&self, container: &str, image: &str) -> Result<PathBuf> {
        let merged = self.paths.mount_point(container);
        let work = self.paths.work_dir(container);
        create_dir(&merged)?;
        remove_dir_all(&work).map_err(|e| match e {
            CellarError::Io { path, source } => CellarError::Directory { path, source },
            other => other,
        })?;
        create_dir(&work)?;

        mount_overlay(
            self.syscall,
            &OverlayConfig {
                lower_dirs: vec![self.paths.read_only_layer(image)],
                upper_dir: self.paths.write_layer(container),
                work_dir: work,
                merged_dir: merged.clone(),
            },
        )?;
        Ok(merged)
    }

    /// Binds `mapping.host` at `mapping.container` inside the merged root.
    ///
    /// Both directories are created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Directory`] or [`CellarError::Mount`].
    pub fn bind_host_volume(&self, container: &str, mapping: &VolumeMapping) -> Result<PathBuf> {
        let target = mapping.target_under(&self.paths.mount_point(container));
        create_dir(&mapping.host)?;
        create_dir(&target)?;
        bind_mount(self.syscall, &mapping.host, &target)?;
        tracing::info!(
            container,
            host = %mapping.host.display(),
            target = %target.display(),
            "host volume bound"
        );
        Ok(target)
    }

    /// Builds the full workspace of `container` from `image`.
    ///
    /// A malformed `volume` does not fail creation: the workspace is
    /// returned without a volume and the parse error is reported in
    /// [`MountedWorkspace::volume_error`]. Any other failure removes
    /// whatever was already built.
    ///
    /// # Errors
    ///
    /// Returns the first layer, directory, or mount error.
    pub fn create(
        &self,
        container: &str,
        image: &str,
        volume: Option<&str>,
    ) -> Result<MountedWorkspace> {
        let _ = self.prepare_read_only_layer(image)?;
        let _ = self.prepare_write_layer(container)?;

        let root = match self.mount_root(container, image) {
            Ok(root) => root,
            Err(e) => {
                self.discard(container, None, false);
                return Err(e);
            }
        };

        let (mapping, volume_error) = match volume.map(VolumeMapping::parse).transpose() {
            Ok(mapping) => (mapping.flatten(), None),
            Err(e) => {
                tracing::warn!(container, error = %e, "ignoring volume mapping");
                (None, Some(e))
            }
        };

        if let Some(mapping) = &mapping {
            if let Err(e) = self.bind_host_volume(container, mapping) {
                self.discard(container, None, true);
                return Err(e);
            }
        }

        tracing::info!(container, image, root = %root.display(), "workspace ready");
        Ok(MountedWorkspace {
            root,
            volume: mapping,
            volume_error,
        })
    }

    /// Removes the workspace of `container`.
    ///
    /// Order: unmount the volume, unmount the merged root, remove the
    /// mount point and work directory, remove the write layer. Every step
    /// is attempted; steps whose target is already gone count as done.
    /// The mount point is left in place if the root could not be
    /// unmounted, so nothing is deleted through a live mount.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Partial`] listing every failed step.
    pub fn teardown(&self, container: &str, volume: Option<&VolumeMapping>) -> Result<()> {
        let merged = self.paths.mount_point(container);
        let mut errors = StepErrors::new();

        if let Some(mapping) = volume {
            let target = mapping.target_under(&merged);
            let _ = errors.record("unmount volume", self.unmount(&target));
        }

        let root_unmounted = errors
            .record("unmount root", self.unmount(&merged))
            .is_some();
        if root_unmounted {
            let _ = errors.record("remove mount point", remove_dir_all(&merged));
        }
        let _ = errors.record("remove work dir", remove_dir_all(&self.paths.work_dir(container)));
        let _ = errors.record(
            "remove write layer",
            remove_dir_all(&self.paths.write_layer(container)),
        );

        if errors.is_empty() {
            tracing::info!(container, "workspace removed");
        } else {
            tracing::warn!(container, failures = %errors, "workspace teardown incomplete");
        }
        errors.into_result("workspace teardown")
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        match self.syscall.umount2(target, MntFlags::empty()) {
            Ok(()) => Ok(()),
            // Not a mount point (any more), or the directory is gone.
            Err(Errno::EINVAL | Errno::ENOENT) => {
                tracing::debug!(target = %target.display(), "not mounted, skipping unmount");
                Ok(())
            }
            Err(e) => Err(CellarError::Mount {
                target: target.to_path_buf(),
                source: e.into(),
            }),
        }
    }

    fn discard(&self, container: &str, volume: Option<&VolumeMapping>, mounted: bool) {
        let result = if mounted {
            self.teardown(container, volume)
        } else {
            let mut errors = StepErrors::new();
            let _ = errors.record(
                "remove mount point",
                remove_dir_all(&self.paths.mount_point(container)),
            );
            let _ = errors.record("remove work dir", remove_dir_all(&self.paths.work_dir(container)));
            let _ = errors.record(
                "remove write layer",
                remove_dir_all(&self.paths.write_layer(container)),
            );
            errors.into_result("workspace rollback")
        };
        if let Err(e) = result {
            tracing::error!(container, error = %e, "failed to roll back workspace");
        }
    }
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| CellarError::Directory {
        path: path.to_path_buf(),
        source: e,
    })
}

fn remove_dir_all(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CellarError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::TestSyscall;

    fn seed_layer(paths: &RuntimePaths, image: &str) {
        let layer = paths.read_only_layer(image);
        std::fs::create_dir_all(layer.join("bin")).unwrap();
    }

    #[test]
    fn missing_archive_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::under(dir.path());
        let syscall = TestSyscall::new();
        let err = Workspace::new(&paths, &syscall)
            .prepare_read_only_layer("ghost")
            .unwrap_err();
        assert!(matches!(err, CellarError::Extraction { .. }));
    }

    #[test]
    fn work_dir_is_recreated_empty() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::under(dir.path());
        seed_layer(&paths, "busybox");
        let stale = paths.work_dir("c1").join("stale");
        std::fs::create_dir_all(&stale).unwrap();

        let syscall = TestSyscall::new();
        let root = Workspace::new(&paths, &syscall).mount_root("c1", "busybox").unwrap();
        assert_eq!(root, paths.mount_point("c1"));
        assert!(paths.work_dir("c1").is_dir());
        assert!(!stale.exists());
        assert!(syscall.is_mounted(&root));
    }

    #[test]
    fn malformed_volume_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::under(dir.path());
        seed_layer(&paths, "busybox");
        let syscall = TestSyscall::new();

        let ws = Workspace::new(&paths, &syscall)
            .create("c1", "busybox", Some("no-colon-here"))
            .unwrap();
        assert!(ws.volume.is_none());
        assert!(matches!(ws.volume_error, Some(CellarError::Config { .. })));
        assert_eq!(syscall.mounts().len(), 1);
    }

    #[test]
    fn failed_overlay_mount_removes_created_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::under(dir.path());
        seed_layer(&paths, "busybox");
        let syscall = TestSyscall::new();
        syscall.fail_mount(paths.mount_point("c1"), Errno::EPERM);

        let err = Workspace::new(&paths, &syscall)
            .create("c1", "busybox", None)
            .unwrap_err();
        assert!(matches!(err, CellarError::Mount { .. }));
        assert!(!paths.write_layer("c1").exists());
        assert!(!paths.work_dir("c1").exists());
        assert!(!paths.mount_point("c1").exists());
        assert!(paths.read_only_layer("busybox").exists());
    }

    #[test]
    fn root_still_mounted_keeps_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::under(dir.path());
        seed_layer(&paths, "busybox");
        let syscall = TestSyscall::new();
        let workspace = Workspace::new(&paths, &syscall);
        let ws = workspace.create("c1", "busybox", None).unwrap();
        syscall.fail_umount(&ws.root, Errno::EBUSY);

        let err = workspace.teardown("c1", None).unwrap_err();
        assert!(matches!(&err, CellarError::Partial { failures, .. } if failures.contains("unmount root")));
        assert!(ws.root.exists());
        assert!(!paths.write_layer("c1").exists());
    }
}
