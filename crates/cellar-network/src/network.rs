//! Network and endpoint descriptors.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use cellar_common::constants::{MAX_INTERFACE_NAME_LEN, VETH_ID_PREFIX_LEN, VETH_PEER_PREFIX};
use cellar_common::error::{CellarError, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::ipam::parse_subnet;

/// A named network, persisted as `<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network name; also the bridge interface name.
    pub name: String,
    /// Canonical subnet CIDR.
    pub subnet: String,
    /// Address of the bridge, handed to containers as their gateway.
    pub gateway_ip: Ipv4Addr,
    /// Name of the driver that owns it.
    pub driver: String,
}

impl Network {
    /// Parsed subnet.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored subnet is malformed.
    pub fn subnet(&self) -> Result<Ipv4Network> {
        parse_subnet(&self.subnet)
    }

    /// Gateway address with the subnet's prefix, as assigned to the bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored subnet is malformed.
    pub fn gateway_cidr(&self) -> Result<Ipv4Network> {
        host_cidr(self.gateway_ip, &self.subnet()?)
    }
}

/// Builds `ip/prefix` for a host address in `subnet`.
///
/// # Errors
///
/// Returns [`CellarError::Config`] if the prefix is invalid.
pub fn host_cidr(ip: Ipv4Addr, subnet: &Ipv4Network) -> Result<Ipv4Network> {
    Ipv4Network::new(ip, subnet.prefix())
        .map_err(|e| CellarError::config(format!("invalid address {ip}/{}: {e}", subnet.prefix())))
}

/// Checks that `name` is usable as an interface and file name.
///
/// # Errors
///
/// Returns [`CellarError::Config`] if it is empty, too long, or
/// contains anything but ASCII letters, digits, `-`, and `_`.
pub fn validate_network_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(CellarError::config(format!(
            "network name {name:?} must be 1 to {MAX_INTERFACE_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CellarError::config(format!(
            "network name {name:?} may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

/// A host port published to a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

impl FromStr for PortMapping {
    type Err = CellarError;

    /// Parses `HOST:CONTAINER`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CellarError::config(format!("port mapping {s:?} must be HOST:CONTAINER"));
        let (host, container) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            host_port: host.trim().parse().map_err(|_| invalid())?,
            container_port: container.trim().parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.container_port)
    }
}

/// The two ends of a container's veth pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VethPair {
    /// End moved into the container.
    pub name: String,
    /// End left on the host and enslaved to the bridge.
    pub peer: String,
}

impl VethPair {
    /// Derives both names from an endpoint id.
    #[must_use]
    pub fn for_endpoint(endpoint_id: &str) -> Self {
        let prefix: String = endpoint_id.chars().take(VETH_ID_PREFIX_LEN).collect();
        Self {
            peer: format!("{VETH_PEER_PREFIX}{prefix}"),
            name: prefix,
        }
    }
}

/// A container's attachment to one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// `<container>-<network>`.
    pub id: String,
    /// Network name.
    pub network: String,
    /// Address assigned to the container.
    pub ip_address: Ipv4Addr,
    /// Veth pair, once the driver has created it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<VethPair>,
    /// Published ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub port_mappings: Vec<PortMapping>,
}

impl Endpoint {
    /// Creates an endpoint with no device yet.
    #[must_use]
    pub fn new(
        container_id: &str,
        network: &str,
        ip_address: Ipv4Addr,
        port_mappings: Vec<PortMapping>,
    ) -> Self {
        Self {
            id: format!("{container_id}-{network}"),
            network: network.to_owned(),
            ip_address,
            device: None,
            port_mappings,
        }
    }
}
