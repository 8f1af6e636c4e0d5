//! Cgroup v1 resource management.
//!
//! A [`CgroupManager`] binds one relative hierarchy path (for example
//! `cellar/<container>`) and fans every operation out over the
//! subsystems in a [`SubsystemRegistry`]. A failing subsystem never stops
//! the others; failures are collected and returned together.

pub mod cpu;
pub mod cpuset;
pub mod hierarchy;
pub mod memory;
pub mod subsystem;

use std::path::{Path, PathBuf};

use cellar_common::constants::CGROUP_PARENT;
use cellar_common::error::{Result, StepErrors};
use cellar_common::types::ResourceLimits;

pub use hierarchy::CgroupHierarchy;
pub use subsystem::{Subsystem, SubsystemRegistry};

/// Relative cgroup path used for `container`.
#[must_use]
pub fn container_cgroup_path(container: &str) -> PathBuf {
    Path::new(CGROUP_PARENT).join(container)
}

/// Handle to one cgroup path across every registered subsystem.
#[derive(Debug)]
pub struct CgroupManager<'a> {
    path: PathBuf,
    hierarchy: &'a CgroupHierarchy,
    subsystems: &'a SubsystemRegistry,
}

impl<'a> CgroupManager<'a> {
    /// Binds a manager to `path` relative to each subsystem root.
    #[must_use]
    pub fn new(
        path: impl Into<PathBuf>,
        hierarchy: &'a CgroupHierarchy,
        subsystems: &'a SubsystemRegistry,
    ) -> Self {
        Self {
            path: path.into(),
            hierarchy,
            subsystems,
        }
    }

    /// The bound hierarchy path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds `pid` to the group in every subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`cellar_common::error::CellarError::Partial`] naming each
    /// subsystem that failed; the others still received the pid.
    pub fn apply(&self, pid: u32) -> Result<()> {
        self.fan_out("apply cgroup", |s| s.apply(self.hierarchy, &self.path, pid))
    }

    /// Writes every non-empty limit to its subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`cellar_common::error::CellarError::Partial`] naming each
    /// subsystem that failed; the others were still written.
    pub fn set_limits(&self, limits: &ResourceLimits) -> Result<()> {
        self.fan_out("set cgroup limits", |s| s.set(self.hierarchy, &self.path, limits))
    }

    /// Removes the group from every subsystem. Missing groups are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`cellar_common::error::CellarError::Partial`] naming each
    /// subsystem whose group could not be removed.
    pub fn destroy(&self) -> Result<()> {
        self.fan_out("destroy cgroup", |s| s.remove(self.hierarchy, &self.path))
    }

    fn fan_out<F>(&self, operation: &'static str, mut f: F) -> Result<()>
    where
        F: FnMut(&dyn Subsystem) -> Result<()>,
    {
        let mut errors = StepErrors::new();
        for subsystem in self.subsystems.iter() {
            if let Err(e) = f(subsystem) {
                tracing::warn!(
                    operation,
                    subsystem = subsystem.name(),
                    path = %self.path.display(),
                    error = %e,
                    "cgroup subsystem failed"
                );
                errors.push(subsystem.name(), e);
            }
        }
        if errors.is_empty() {
            tracing::debug!(operation, path = %self.path.display(), "cgroup operation complete");
        }
        errors.into_result(operation)
    }
}

#[cfg(test)]
mod tests {
    use cellar_common::error::CellarError;

    use super::*;

    struct Roots {
        _dir: tempfile::TempDir,
        hierarchy: CgroupHierarchy,
        cpu: PathBuf,
        cpuset: PathBuf,
        memory: PathBuf,
    }

    fn roots() -> Roots {
        let dir = tempfile::tempdir().unwrap();
        let cpu = dir.path().join("cpu");
        let cpuset = dir.path().join("cpuset");
        let memory = dir.path().join("memory");
        for root in [&cpu, &cpuset, &memory] {
            std::fs::create_dir_all(root).unwrap();
        }
        let hierarchy = CgroupHierarchy::from_roots([
            ("cpu", cpu.clone()),
            ("cpuset", cpuset.clone()),
            ("memory", memory.clone()),
        ]);
        Roots { _dir: dir, hierarchy, cpu, cpuset, memory }
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            memory: Some("100m".into()),
            cpu_shares: Some("512".into()),
            cpuset_cpus: Some("0-1".into()),
        }
    }

    #[test]
    fn limits_land_in_each_subsystem_file() {
        let r = roots();
        let registry = SubsystemRegistry::default();
        let manager = CgroupManager::new(container_cgroup_path("c1"), &r.hierarchy, &registry);

        manager.set_limits(&limits()).unwrap();
        manager.apply(4242).unwrap();

        let read = |p: PathBuf| std::fs::read_to_string(p).unwrap();
        assert_eq!(read(r.cpu.join("cellar/c1/cpu.shares")), "512");
        assert_eq!(read(r.cpuset.join("cellar/c1/cpuset.cpus")), "0-1");
        assert_eq!(read(r.memory.join("cellar/c1/memory.limit_in_bytes")), "100m");
        assert_eq!(read(r.memory.join("cellar/c1/tasks")), "4242");
    }

    #[test]
    fn empty_limits_are_skipped() {
        let r = roots();
        let registry = SubsystemRegistry::default();
        let manager = CgroupManager::new("cellar/c2", &r.hierarchy, &registry);
        let limits = ResourceLimits {
            cpu_shares: Some(String::new()),
            ..ResourceLimits::default()
        };

        manager.set_limits(&limits).unwrap();
        assert!(!r.cpu.join("cellar/c2").exists());
    }

    #[test]
    fn unwritable_memory_does_not_block_cpu_and_cpuset() {
        let r = roots();
        // A regular file where the group directory should go.
        std::fs::create_dir_all(r.memory.join("cellar")).unwrap();
        std::fs::write(r.memory.join("cellar/c3"), b"").unwrap();
        let registry = SubsystemRegistry::default();
        let manager = CgroupManager::new("cellar/c3", &r.hierarchy, &registry);

        let err = manager.set_limits(&limits()).unwrap_err();

        let CellarError::Partial { failures, .. } = &err else {
            unreachable!("expected partial failure, got {err}");
        };
        assert_eq!(failures.len(), 1);
        assert!(failures.contains("memory"));
        assert_eq!(std::fs::read_to_string(r.cpu.join("cellar/c3/cpu.shares")).unwrap(), "512");
        assert_eq!(
            std::fs::read_to_string(r.cpuset.join("cellar/c3/cpuset.cpus")).unwrap(),
            "0-1"
        );
    }

    #[test]
    fn destroy_removes_groups_and_tolerates_missing_ones() {
        let r = roots();
        let registry = SubsystemRegistry::default();
        let manager = CgroupManager::new("cellar/c4", &r.hierarchy, &registry);
        manager.apply(1).unwrap();
        std::fs::remove_dir_all(r.cpuset.join("cellar/c4")).unwrap();

        manager.destroy().unwrap();
        assert!(!r.cpu.join("cellar/c4").exists());
        assert!(!r.memory.join("cellar/c4").exists());
        manager.destroy().unwrap();
    }

    #[test]
    fn unmounted_subsystem_is_reported_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let hierarchy = CgroupHierarchy::from_roots([("cpu", dir.path())]);
        let registry = SubsystemRegistry::default();
        let manager = CgroupManager::new("cellar/c5", &hierarchy, &registry);

        let err = manager.apply(7).unwrap_err();
        assert!(matches!(&err, CellarError::Partial { failures, .. }
            if failures.contains("cpuset") && failures.contains("memory") && !failures.contains("cpu")));
        assert!(dir.path().join("cellar/c5/tasks").is_file());
    }
}
