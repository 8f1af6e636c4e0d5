//! Host-to-container volume mappings.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use cellar_common::error::{CellarError, Result};

/// A host directory bound into the container at a given path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMapping {
    /// Directory on the host.
    pub host: PathBuf,
    /// Path inside the container root.
    pub container: PathBuf,
}

impl VolumeMapping {
    /// Parses a `HOST:CONTAINER` mapping.
    ///
    /// An empty or blank string means no volume and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Config`] unless the string splits into
    /// exactly two non-empty parts on `:`.
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            [host, container] if !host.is_empty() && !container.is_empty() => Ok(Some(Self {
                host: PathBuf::from(host),
                container: PathBuf::from(container),
            })),
            _ => Err(CellarError::config(format!(
                "volume mapping {raw:?} must have the form HOST:CONTAINER"
            ))),
        }
    }

    /// Where the container path lands under `root`.
    ///
    /// The container path is always resolved relative to `root`, even
    /// when written as absolute; `..` components are dropped.
    #[must_use]
    pub fn target_under(&self, root: &Path) -> PathBuf {
        self.container
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part),
                _ => None,
            })
            .fold(root.to_path_buf(), |acc, part| acc.join(part))
    }
}

impl FromStr for VolumeMapping {
    type Err = CellarError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)?.ok_or_else(|| CellarError::config("volume mapping is empty"))
    }
}

impl fmt::Display for VolumeMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.container.display())
    }
}
