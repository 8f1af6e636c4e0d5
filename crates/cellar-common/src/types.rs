//! Domain primitive types used across the cellar workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of generated container identifiers.
pub const CONTAINER_ID_LEN: usize = 10;

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID of [`CONTAINER_ID_LEN`] hex digits.
    #[must_use]
    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(CONTAINER_ID_LEN);
        Self(id)
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Desired cgroup limits for one container.
///
/// Each value is written verbatim to the matching control file. `None`
/// or an empty string means no constraint was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory cap, e.g. `"100m"` or a byte count.
    pub memory: Option<String>,
    /// Relative CPU weight.
    pub cpu_shares: Option<String>,
    /// CPU set specification, e.g. `"0-1"`.
    pub cpuset_cpus: Option<String>,
}

impl ResourceLimits {
    /// Returns `true` if at least one limit has a non-empty value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        [&self.memory, &self.cpu_shares, &self.cpuset_cpus]
            .iter()
            .all(|v| v.as_deref().is_none_or(str::is_empty))
    }
}

/// Lifecycle status of a container record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The init process is alive.
    Running,
    /// The container was stopped on request.
    Stopped,
    /// The init process exited on its own.
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
        }
    }
}
