//! Cgroup v1 mount discovery.
//!
//! Each v1 subsystem is mounted at its own root, usually under
//! `/sys/fs/cgroup`. A `cgroup` mount whose super options name the
//! subsystem gives that subsystem's root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cellar_common::error::{CellarError, Result};
use procfs::process::{MountInfo, Process};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Mount roots of the cgroup v1 subsystems.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupHierarchy {
    roots: HashMap<String, PathBuf>,
}

impl CgroupHierarchy {
    /// Reads the subsystem mount roots of the current process.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Io`] if mountinfo cannot be read.
    pub fn discover() -> Result<Self> {
        let mounts = Process::myself()
            .and_then(|process| process.mountinfo())
            .map_err(|e| CellarError::io(MOUNTINFO, std::io::Error::other(e.to_string())))?;
        let hierarchy = Self::from_mounts(mounts);
        tracing::debug!(subsystems = hierarchy.roots.len(), "cgroup hierarchy discovered");
        Ok(hierarchy)
    }

    /// Collects the roots of every `cgroup` mount in `mounts`. The first
    /// mount naming a subsystem wins.
    #[must_use]
    pub fn from_mounts<I>(mounts: I) -> Self
    where
        I: IntoIterator<Item = MountInfo>,
    {
        let mut roots = HashMap::new();
        for mount in mounts.into_iter().filter(|m| m.fs_type == "cgroup") {
            for option in mount.super_options.keys() {
                let _ = roots
                    .entry(option.clone())
                    .or_insert_with(|| mount.mount_point.clone());
            }
        }
        Self { roots }
    }

    /// Builds a hierarchy from explicit `(subsystem, root)` pairs.
    pub fn from_roots<I, S, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots
                .into_iter()
                .map(|(s, p)| (s.into(), p.into()))
                .collect(),
        }
    }

    /// Mount root of `subsystem`, if it is mounted.
    #[must_use]
    pub fn root(&self, subsystem: &str) -> Option<&Path> {
        self.roots.get(subsystem).map(PathBuf::as_path)
    }

    /// Resolves `cgroup` under the root of `subsystem`.
    ///
    /// With `create`, a missing directory is created.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] if the subsystem is not mounted
    /// or the directory is missing and `create` is false, and
    /// [`CellarError::Cgroup`] if creation fails.
    pub fn subsystem_path(&self, subsystem: &str, cgroup: &Path, create: bool) -> Result<PathBuf> {
        let root = self.root(subsystem).ok_or_else(|| CellarError::NotFound {
            kind: "cgroup subsystem mount",
            id: subsystem.to_owned(),
        })?;
        let path = root.join(cgroup.strip_prefix("/").unwrap_or(cgroup));
        if path.is_dir() {
            return Ok(path);
        }
        if !create {
            return Err(CellarError::NotFound {
                kind: "cgroup",
                id: path.display().to_string(),
            });
        }
        std::fs::create_dir_all(&path).map_err(|e| CellarError::Cgroup {
            subsystem: subsystem.to_owned(),
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }
}
