//! Mount utilities for container filesystem setup.
//!
//! Handles bind mounts and the pseudo filesystems (`/proc`, `/dev`)
//! mounted inside the container after the root switch.

use std::path::Path;

use cellar_common::error::{CellarError, Result};
use nix::mount::MsFlags;

use crate::syscall::Syscall;

/// Recursively bind-mounts `source` onto `target`.
///
/// # Errors
///
/// Returns [`CellarError::Mount`] if the mount call fails.
pub fn bind_mount(syscall: &dyn Syscall, source: &Path, target: &Path) -> Result<()> {
    syscall
        .mount(
            Some(source),
            target,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )
        .map_err(|e| CellarError::Mount {
            target: target.to_path_buf(),
            source: e.into(),
        })?;
    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "bind mount created"
    );
    Ok(())
}

/// Mounts `/proc` without exec, setuid, or device access.
///
/// # Errors
///
/// Returns [`CellarError::Mount`] if the mount call fails.
pub fn mount_proc(syscall: &dyn Syscall) -> Result<()> {
    let target = Path::new("/proc");
    syscall
        .mount(
            Some(Path::new("proc")),
            target,
            Some("proc"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            None,
        )
        .map_err(|e| CellarError::Mount {
            target: target.to_path_buf(),
            source: e.into(),
        })
}

/// Mounts a fresh `tmpfs` on `/dev`.
///
/// # Errors
///
/// Returns [`CellarError::Mount`] if the mount call fails.
pub fn mount_dev(syscall: &dyn Syscall) -> Result<()> {
    let target = Path::new("/dev");
    syscall
        .mount(
            Some(Path::new("tmpfs")),
            target,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some("mode=755"),
        )
        .map_err(|e| CellarError::Mount {
            target: target.to_path_buf(),
            source: e.into(),
        })
}

/// Mounts `/proc` and `/dev` inside the (already pivoted) container root.
///
/// # Errors
///
/// Returns an error if either mount fails.
pub fn mount_essential_filesystems(syscall: &dyn Syscall) -> Result<()> {
    mount_proc(syscall)?;
    mount_dev(syscall)?;
    tracing::debug!("essential filesystems mounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::syscall::TestSyscall;

    #[test]
    fn proc_and_dev_use_restrictive_flags() {
        let syscall = TestSyscall::new();
        mount_essential_filesystems(&syscall).unwrap();
        let mounts = syscall.mounts();

        assert_eq!(mounts[0].target, PathBuf::from("/proc"));
        assert!(mounts[0].flags.contains(MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV));
        assert_eq!(mounts[1].target, PathBuf::from("/dev"));
        assert_eq!(mounts[1].fstype.as_deref(), Some("tmpfs"));
        assert_eq!(mounts[1].data.as_deref(), Some("mode=755"));
    }

    #[test]
    fn bind_is_recursive() {
        let syscall = TestSyscall::new();
        bind_mount(&syscall, Path::new("/host"), Path::new("/mnt/c1/data")).unwrap();
        let mounts = syscall.mounts();
        assert_eq!(mounts[0].flags, MsFlags::MS_BIND | MsFlags::MS_REC);
        assert_eq!(mounts[0].source, Some(PathBuf::from("/host")));
    }
}
