//! Seam between the runtime and the mount-table syscalls.
//!
//! Everything that changes the mount table or the process root goes
//! through [`Syscall`]. [`LinuxSyscall`] issues the real calls;
//! [`TestSyscall`] records them and models the kernel's refusal to
//! unmount a target that still has mounts nested below it.

mod linux;

use std::path::Path;

use nix::mount::{MntFlags, MsFlags};

pub use linux::LinuxSyscall;
pub use test::{MountArgs, SyscallCall, TestSyscall};

/// Mount-table and root-switching operations used by the runtime.
pub trait Syscall {
    /// `mount(2)`.
    ///
    /// # Errors
    ///
    /// Returns the kernel's errno on failure.
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> nix::Result<()>;

    /// `umount2(2)`.
    ///
    /// # Errors
    ///
    /// Returns the kernel's errno on failure.
    fn umount2(&self, target: &Path, flags: MntFlags) -> nix::Result<()>;

    /// `pivot_root(2)`.
    ///
    /// # Errors
    ///
    /// Returns the kernel's errno on failure.
    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> nix::Result<()>;

    /// `chdir(2)`.
    ///
    /// # Errors
    ///
    /// Returns the kernel's errno on failure.
    fn chdir(&self, path: &Path) -> nix::Result<()>;

    /// `rmdir(2)`, used on paths that only exist after a root switch.
    ///
    /// # Errors
    ///
    /// Returns the kernel's errno on failure.
    fn rmdir(&self, path: &Path) -> nix::Result<()>;
}

/// Returns the syscall implementation for the current platform.
#[must_use]
pub fn create_syscall() -> Box<dyn Syscall> {
    Box::new(LinuxSyscall)
}
