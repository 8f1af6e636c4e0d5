//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::io::ErrorKind;
use std::path::Path;

use cellar_common::constants::PIVOT_PUT_OLD_DIR_NAME;
use cellar_common::error::{CellarError, Result};
use nix::mount::{MntFlags, MsFlags};

use crate::syscall::Syscall;

/// Makes `new_root` the process root and detaches the old one.
///
/// The new root is first bind-mounted onto itself so it is a mount point
/// distinct from the current root, as `pivot_root(2)` requires. The old
/// root is parked under [`PIVOT_PUT_OLD_DIR_NAME`], lazily unmounted,
/// and the directory removed.
///
/// # Errors
///
/// Returns [`CellarError::RootTransition`] naming the step that failed.
pub fn pivot_root(syscall: &dyn Syscall, new_root: &Path) -> Result<()> {
    tracing::info!(new_root = %new_root.display(), "performing pivot_root");
    let step = |step: &'static str| move |e: nix::errno::Errno| CellarError::RootTransition {
        step,
        source: e.into(),
    };

    syscall
        .mount(
            Some(new_root),
            new_root,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )
        .map_err(step("bind new root"))?;

    let put_old = new_root.join(PIVOT_PUT_OLD_DIR_NAME);
    match std::fs::create_dir(&put_old) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(CellarError::RootTransition {
                step: "create put_old",
                source: e,
            });
        }
    }

    syscall
        .pivot_root(new_root, &put_old)
        .map_err(step("pivot_root"))?;
    syscall.chdir(Path::new("/")).map_err(step("chdir"))?;

    let old_root = Path::new("/").join(PIVOT_PUT_OLD_DIR_NAME);
    syscall
        .umount2(&old_root, MntFlags::MNT_DETACH)
        .map_err(step("unmount old root"))?;
    syscall.rmdir(&old_root).map_err(step("remove put_old"))?;

    tracing::debug!("root filesystem switched");
    Ok(())
}
