//! Linux namespace management for container isolation.
//!
//! The container's init process is created by `clone(2)` with one flag
//! per isolated namespace; [`init`] is what runs inside it.

pub mod init;

use nix::sched::CloneFlags;

/// Configuration for which namespaces to create.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate user namespace.
    pub user: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
}

impl Default for NamespaceConfig {
    /// Everything except the user namespace.
    fn default() -> Self {
        Self {
            pid: true,
            mount: true,
            network: true,
            user: false,
            ipc: true,
            uts: true,
        }
    }
}

impl NamespaceConfig {
    /// The `clone(2)` flags creating the configured namespaces.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        [
            (self.uts, CloneFlags::CLONE_NEWUTS),
            (self.pid, CloneFlags::CLONE_NEWPID),
            (self.mount, CloneFlags::CLONE_NEWNS),
            (self.network, CloneFlags::CLONE_NEWNET),
            (self.ipc, CloneFlags::CLONE_NEWIPC),
            (self.user, CloneFlags::CLONE_NEWUSER),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .fold(CloneFlags::empty(), |acc, (_, flag)| acc | flag)
    }
}
