//! Persisted container metadata.

use std::net::Ipv4Addr;

use cellar_common::error::{CellarError, Result};
use cellar_common::types::{ContainerId, ContainerStatus};
use cellar_core::filesystem::VolumeMapping;
use cellar_network::{Endpoint, PortMapping, VethPair};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// Metadata file of one container.
///
/// The first eight fields are the stable on-disk format. The optional
/// fields after them let teardown be rebuilt by a later invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Host pid of the init process.
    pub pid: u32,
    /// Unique identifier.
    pub id: ContainerId,
    /// Human-readable name, also the record directory name.
    pub name: String,
    /// Space-joined user command.
    pub command: String,
    /// RFC 3339 creation timestamp.
    pub create_time: String,
    /// Lifecycle status.
    pub status: ContainerStatus,
    /// Raw `host:container` volume mapping, empty if none.
    pub volume: String,
    /// Published ports as `host:container` strings.
    pub port_mapping: Vec<String>,
    /// Image the root filesystem was built from.
    #[serde(default)]
    pub image: String,
    /// Network the container is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Address allocated on `network`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<Ipv4Addr>,
    /// Host end of the container's veth pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_device: Option<String>,
    /// Cgroup path relative to each subsystem root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup_path: Option<String>,
}

impl ContainerRecord {
    /// Creates a running record stamped with the current time.
    #[must_use]
    pub fn new(id: ContainerId, name: &str, image: &str, command: &[String], pid: u32) -> Self {
        Self {
            pid,
            id,
            name: name.to_owned(),
            command: command.join(" "),
            create_time: chrono::Utc::now().to_rfc3339(),
            status: ContainerStatus::Running,
            volume: String::new(),
            port_mapping: Vec::new(),
            image: image.to_owned(),
            network: None,
            ip_address: None,
            endpoint_device: None,
            cgroup_path: None,
        }
    }

    /// Marks a running record as exited if its pid is gone.
    ///
    /// Returns `true` if the status changed.
    pub fn refresh_status(&mut self) -> bool {
        if self.status == ContainerStatus::Running && !is_alive(self.pid) {
            self.status = ContainerStatus::Exited;
            return true;
        }
        false
    }

    /// Stores the endpoint fields of an attached network.
    pub fn set_endpoint(&mut self, endpoint: &Endpoint) {
        self.network = Some(endpoint.network.clone());
        self.ip_address = Some(endpoint.ip_address);
        self.endpoint_device = endpoint.device.as_ref().map(|d| d.peer.clone());
        self.port_mapping = endpoint
            .port_mappings
            .iter()
            .map(ToString::to_string)
            .collect();
    }

    /// Forgets the network endpoint once it has been released. Port
    /// mappings stay as a record of what was published.
    pub fn clear_endpoint(&mut self) {
        self.network = None;
        self.ip_address = None;
        self.endpoint_device = None;
    }

    /// Rebuilds the network endpoint, if the container has one.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Config`] if a stored port mapping no longer
    /// parses.
    pub fn endpoint(&self) -> Result<Option<Endpoint>> {
        let (Some(network), Some(ip)) = (&self.network, self.ip_address) else {
            return Ok(None);
        };
        let ports = self
            .port_mapping
            .iter()
            .map(|p| p.parse::<PortMapping>())
            .collect::<Result<Vec<_>>>()?;
        let mut endpoint = Endpoint::new(self.id.as_str(), network, ip, ports);
        if self.endpoint_device.is_some() {
            endpoint.device = Some(VethPair::for_endpoint(&endpoint.id));
        }
        Ok(Some(endpoint))
    }

    /// The bound volume, if the stored mapping was valid.
    #[must_use]
    pub fn volume_mapping(&self) -> Option<VolumeMapping> {
        VolumeMapping::parse(&self.volume).ok().flatten()
    }
}

/// Returns `true` if a process with `pid` exists.
///
/// A process owned by another user still counts as alive.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Checks that `name` can be used as a record directory name.
///
/// # Errors
///
/// Returns [`CellarError::Config`] for an empty name, `.`/`..`, or a name
/// containing `/` or whitespace.
pub fn validate_container_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.chars().any(char::is_whitespace)
    {
        return Err(CellarError::config(format!("invalid container name {name:?}")));
    }
    Ok(())
}
