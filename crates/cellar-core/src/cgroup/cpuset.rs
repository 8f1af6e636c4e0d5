//! CPU pinning via the v1 `cpuset` subsystem.
//!
//! A new cpuset group starts with empty `cpuset.cpus` and `cpuset.mems`,
//! and the kernel refuses tasks (`ENOSPC`) until both are filled. Every
//! empty level between the subsystem root and the group inherits its
//! parent's value first.

use std::io::ErrorKind;
use std::path::{Component, Path};

use cellar_common::error::{CellarError, Result};
use cellar_common::types::ResourceLimits;

use super::hierarchy::CgroupHierarchy;
use super::subsystem::{Subsystem, write_control_file};

const CPUSET_CPUS: &str = "cpuset.cpus";
const CPUSET_MEMS: &str = "cpuset.mems";

/// Writes the allowed CPU list (e.g. `0-1,3`) to `cpuset.cpus`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpusetSubsystem;

impl Subsystem for CpusetSubsystem {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn limit_file(&self) -> &'static str {
        CPUSET_CPUS
    }

    fn limit<'l>(&self, limits: &'l ResourceLimits) -> Option<&'l str> {
        limits.cpuset_cpus.as_deref()
    }

    fn prepare(&self, hierarchy: &CgroupHierarchy, cgroup: &Path) -> Result<()> {
        let Some(root) = hierarchy.root(self.name()) else {
            return Ok(());
        };
        for file in [CPUSET_CPUS, CPUSET_MEMS] {
            inherit(root, cgroup, file)?;
        }
        Ok(())
    }
}

/// Copies `file` down from `root` into every empty level of `cgroup`.
///
/// A root without the file is not a cpuset mount and is left alone.
fn inherit(root: &Path, cgroup: &Path, file: &str) -> Result<()> {
    let mut current = root.to_path_buf();
    let Some(mut inherited) = read_value(&current.join(file))? else {
        return Ok(());
    };
    for component in cgroup.components() {
        let Component::Normal(level) = component else {
            continue;
        };
        if inherited.is_empty() {
            return Err(CellarError::Cgroup {
                subsystem: "cpuset".to_owned(),
                path: current.join(file),
                source: std::io::Error::other("parent value is empty"),
            });
        }
        current.push(level);
        let target = current.join(file);
        match read_value(&target)? {
            Some(value) if !value.is_empty() => inherited = value,
            _ => {
                write_control_file("cpuset", &target, &inherited)?;
                tracing::debug!(path = %target.display(), value = %inherited, "cpuset inherited from parent");
            }
        }
    }
    Ok(())
}

fn read_value(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(value) => Ok(Some(value.trim().to_owned())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CellarError::Cgroup {
            subsystem: "cpuset".to_owned(),
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_root() -> (tempfile::TempDir, CgroupHierarchy) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CPUSET_CPUS), "0-3\n").unwrap();
        std::fs::write(dir.path().join(CPUSET_MEMS), "0\n").unwrap();
        let hierarchy = CgroupHierarchy::from_roots([("cpuset", dir.path())]);
        (dir, hierarchy)
    }

    #[test]
    fn new_group_inherits_cpus_and_mems_at_every_level() {
        let (dir, hierarchy) = seeded_root();
        let cgroup = Path::new("cellar/c1");

        CpusetSubsystem.apply(&hierarchy, cgroup, 99).unwrap();

        let read = |rel: &str| std::fs::read_to_string(dir.path().join(rel)).unwrap();
        assert_eq!(read("cellar/cpuset.cpus"), "0-3");
        assert_eq!(read("cellar/cpuset.mems"), "0");
        assert_eq!(read("cellar/c1/cpuset.cpus"), "0-3");
        assert_eq!(read("cellar/c1/cpuset.mems"), "0");
        assert_eq!(read("cellar/c1/tasks"), "99");
    }

    #[test]
    fn requested_cpus_override_the_inherited_value() {
        let (dir, hierarchy) = seeded_root();
        let limits = ResourceLimits {
            cpuset_cpus: Some("1".into()),
            ..ResourceLimits::default()
        };

        CpusetSubsystem.set(&hierarchy, Path::new("cellar/c2"), &limits).unwrap();

        let read = |rel: &str| std::fs::read_to_string(dir.path().join(rel)).unwrap();
        assert_eq!(read("cellar/c2/cpuset.cpus"), "1");
        assert_eq!(read("cellar/c2/cpuset.mems"), "0");
    }

    #[test]
    fn configured_levels_are_left_alone() {
        let (dir, hierarchy) = seeded_root();
        std::fs::create_dir_all(dir.path().join("cellar")).unwrap();
        std::fs::write(dir.path().join("cellar/cpuset.cpus"), "2").unwrap();

        CpusetSubsystem.apply(&hierarchy, Path::new("cellar/c3"), 7).unwrap();

        let read = |rel: &str| std::fs::read_to_string(dir.path().join(rel)).unwrap();
        assert_eq!(read("cellar/cpuset.cpus"), "2");
        assert_eq!(read("cellar/c3/cpuset.cpus"), "2");
    }

    #[test]
    fn empty_root_value_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CPUSET_CPUS), "\n").unwrap();
        let hierarchy = CgroupHierarchy::from_roots([("cpuset", dir.path())]);

        let err = CpusetSubsystem.apply(&hierarchy, Path::new("cellar/c4"), 7).unwrap_err();
        assert!(matches!(err, CellarError::Cgroup { .. }), "{err}");
        assert!(!dir.path().join("cellar/c4/tasks").exists());
    }
}
