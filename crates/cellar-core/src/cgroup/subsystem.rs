//! The per-resource subsystem abstraction and its registry.

use std::io::ErrorKind;
use std::path::Path;

use cellar_common::error::{CellarError, Result};
use cellar_common::types::ResourceLimits;

use super::cpu::CpuSubsystem;
use super::cpuset::CpusetSubsystem;
use super::hierarchy::CgroupHierarchy;
use super::memory::MemorySubsystem;

/// File listing the tasks of a v1 cgroup.
pub const TASKS_FILE: &str = "tasks";

/// One controllable resource axis of the v1 hierarchy.
///
/// Implementors only name themselves and pick their limit out of
/// [`ResourceLimits`]; path handling and file writes are shared.
pub trait Subsystem: Send + Sync {
    /// Subsystem name as it appears in mount options.
    fn name(&self) -> &'static str;

    /// Control file the limit is written to.
    fn limit_file(&self) -> &'static str;

    /// This subsystem's value in `limits`, if one was requested.
    fn limit<'l>(&self, limits: &'l ResourceLimits) -> Option<&'l str>;

    /// Readies a freshly resolved `cgroup` before anything is written to
    /// it. Most subsystems need nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be made usable.
    fn prepare(&self, _hierarchy: &CgroupHierarchy, _cgroup: &Path) -> Result<()> {
        Ok(())
    }

    /// Writes this subsystem's limit for `cgroup`. An absent or empty
    /// limit is skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be resolved or written.
    fn set(&self, hierarchy: &CgroupHierarchy, cgroup: &Path, limits: &ResourceLimits) -> Result<()> {
        let Some(value) = self.limit(limits).filter(|v| !v.is_empty()) else {
            return Ok(());
        };
        let dir = hierarchy.subsystem_path(self.name(), cgroup, true)?;
        self.prepare(hierarchy, cgroup)?;
        write_control_file(self.name(), &dir.join(self.limit_file()), value)?;
        tracing::debug!(subsystem = self.name(), value, "cgroup limit set");
        Ok(())
    }

    /// Adds `pid` to this subsystem's `cgroup`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be resolved or written.
    fn apply(&self, hierarchy: &CgroupHierarchy, cgroup: &Path, pid: u32) -> Result<()> {
        let dir = hierarchy.subsystem_path(self.name(), cgroup, true)?;
        self.prepare(hierarchy, cgroup)?;
        write_control_file(self.name(), &dir.join(TASKS_FILE), &pid.to_string())?;
        tracing::debug!(subsystem = self.name(), pid, "process added to cgroup");
        Ok(())
    }

    /// Removes this subsystem's `cgroup`. A missing one is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    fn remove(&self, hierarchy: &CgroupHierarchy, cgroup: &Path) -> Result<()> {
        let dir = match hierarchy.subsystem_path(self.name(), cgroup, false) {
            Ok(dir) => dir,
            Err(CellarError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        remove_cgroup_dir(self.name(), &dir)
    }
}

pub(super) fn write_control_file(subsystem: &str, file: &Path, value: &str) -> Result<()> {
    std::fs::write(file, value).map_err(|e| CellarError::Cgroup {
        subsystem: subsystem.to_owned(),
        path: file.to_path_buf(),
        source: e,
    })
}

/// Removes a cgroup directory.
///
/// On cgroupfs `rmdir(2)` is the only way to remove a group, as its
/// control files cannot be unlinked. A directory on an ordinary
/// filesystem falls back to recursive removal.
fn remove_cgroup_dir(subsystem: &str, dir: &Path) -> Result<()> {
    let result = match std::fs::remove_dir(dir) {
        Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => std::fs::remove_dir_all(dir),
        other => other,
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CellarError::Cgroup {
            subsystem: subsystem.to_owned(),
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// The set of subsystems a [`super::CgroupManager`] fans out over.
///
/// Built once at start-up and shared by reference.
pub struct SubsystemRegistry {
    subsystems: Vec<Box<dyn Subsystem>>,
}

impl Default for SubsystemRegistry {
    /// Registers `cpu`, `cpuset`, and `memory`.
    fn default() -> Self {
        Self {
            subsystems: vec![
                Box::new(CpuSubsystem),
                Box::new(CpusetSubsystem),
                Box::new(MemorySubsystem),
            ],
        }
    }
}

impl std::fmt::Debug for SubsystemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.subsystems.iter().map(|s| s.name())).finish()
    }
}

impl SubsystemRegistry {
    /// Creates a registry with no subsystems.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            subsystems: Vec::new(),
        }
    }

    /// Adds a subsystem.
    pub fn register(&mut self, subsystem: Box<dyn Subsystem>) {
        self.subsystems.push(subsystem);
    }

    /// Iterates in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Subsystem> {
        self.subsystems.iter().map(|s| s.as_ref())
    }

    /// Names of the registered subsystems.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(Subsystem::name).collect()
    }
}
