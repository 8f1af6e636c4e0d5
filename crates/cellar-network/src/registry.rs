//! Registry of network drivers and known networks.
//!
//! One registry is built at start-up and passed to whatever needs
//! network lookups. Network descriptors live one per file in the
//! networks directory; creation and deletion hold an exclusive lock on
//! that directory so concurrent invocations cannot claim the same name.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use cellar_common::config::RuntimePaths;
use cellar_common::constants::BRIDGE_DRIVER_NAME;
use cellar_common::error::{CellarError, Result, StepErrors};
use cellar_common::persist;

use crate::bridge::BridgeDriver;
use crate::driver::NetworkDriver;
use crate::firewall::{Firewall, Iptables, NatRule};
use crate::ipam::IpAddressManager;
use crate::link::{IpCommand, LinkControl};
use crate::network::{Endpoint, Network, PortMapping, host_cidr, validate_network_name};

const REGISTRY_LOCK_NAME: &str = "registry";

/// Drivers, networks, and the address allocator.
pub struct NetworkRegistry {
    paths: RuntimePaths,
    ipam: IpAddressManager,
    links: Arc<dyn LinkControl>,
    firewall: Arc<dyn Firewall>,
    drivers: BTreeMap<String, Box<dyn NetworkDriver>>,
    networks: BTreeMap<String, Network>,
}

impl std::fmt::Debug for NetworkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("networks", &self.networks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl NetworkRegistry {
    /// Creates an empty registry with the bridge driver registered.
    #[must_use]
    pub fn new(
        paths: RuntimePaths,
        links: Arc<dyn LinkControl>,
        firewall: Arc<dyn Firewall>,
    ) -> Self {
        let mut registry = Self {
            ipam: IpAddressManager::new(paths.ipam_file()),
            paths,
            drivers: BTreeMap::new(),
            networks: BTreeMap::new(),
            links: links.clone(),
            firewall: firewall.clone(),
        };
        registry.register_driver(Box::new(BridgeDriver::new(links, firewall)));
        registry
    }

    /// Creates a registry using `ip` and `iptables` and loads every
    /// persisted network.
    ///
    /// # Errors
    ///
    /// Returns an error if the networks directory cannot be read.
    pub fn open(paths: RuntimePaths) -> Result<Self> {
        let mut registry = Self::new(paths, Arc::new(IpCommand::new()), Arc::new(Iptables));
        registry.load()?;
        Ok(registry)
    }

    /// Adds or replaces a driver under its own name.
    pub fn register_driver(&mut self, driver: Box<dyn NetworkDriver>) {
        let _ = self.drivers.insert(driver.name().to_owned(), driver);
    }

    /// Reads every descriptor in the networks directory.
    ///
    /// A missing directory means no networks. Unreadable descriptors are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be listed.
    pub fn load(&mut self) -> Result<()> {
        let dir = self.paths.networks_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CellarError::io(&dir, e)),
        };
        for entry in entries {
            let path = entry.map_err(|e| CellarError::io(&dir, e))?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match persist::load::<Network>(&path) {
                Ok(Some(network)) => {
                    let _ = self.networks.insert(network.name.clone(), network);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping network descriptor"),
            }
        }
        tracing::debug!(networks = self.networks.len(), "networks loaded");
        Ok(())
    }

    /// Known networks, ordered by name.
    pub fn list(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    /// The network called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] if there is none.
    pub fn get(&self, name: &str) -> Result<&Network> {
        self.networks.get(name).ok_or_else(|| CellarError::NotFound {
            kind: "network",
            id: name.to_owned(),
        })
    }

    /// The address allocator.
    #[must_use]
    pub const fn ipam(&self) -> &IpAddressManager {
        &self.ipam
    }

    fn driver(&self, name: &str) -> Result<&dyn NetworkDriver> {
        self.drivers
            .get(name)
            .map(|d| d.as_ref())
            .ok_or_else(|| CellarError::NotFound {
                kind: "network driver",
                id: name.to_owned(),
            })
    }

    /// Creates network `name` on `subnet` with `driver`.
    ///
    /// The gateway is the first address allocated from the subnet. If
    /// the driver or the descriptor write fails, everything done so far
    /// is undone.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NetworkExists`] for a taken name, plus any
    /// allocation, driver, or persistence error.
    pub fn create_network(&mut self, driver: &str, subnet: &str, name: &str) -> Result<Network> {
        validate_network_name(name)?;
        let _lock = persist::lock(&self.paths.networks_dir().join(REGISTRY_LOCK_NAME))?;
        let file = self.paths.network_file(name);
        if self.networks.contains_key(name) || file.exists() {
            return Err(CellarError::NetworkExists {
                name: name.to_owned(),
            });
        }
        let driver = self.driver(driver)?;

        let gateway = self.ipam.alloc(subnet)?;
        let network = match driver.create(name, subnet, gateway) {
            Ok(network) => network,
            Err(e) => {
                self.release_quietly(subnet, gateway);
                return Err(e);
            }
        };
        if let Err(e) = persist::dump(&file, &network) {
            if let Err(cleanup) = driver.delete(&network) {
                tracing::error!(network = name, error = %cleanup, "failed to remove network after write failure");
            }
            self.release_quietly(subnet, gateway);
            return Err(e);
        }

        tracing::info!(network = name, driver = driver.name(), subnet, %gateway, "network created");
        let _ = self.networks.insert(name.to_owned(), network.clone());
        Ok(network)
    }

    /// Deletes network `name`: its kernel state, gateway address, and
    /// descriptor. Every step is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] for an unknown network, or
    /// [`CellarError::Partial`] listing the steps that failed.
    pub fn delete_network(&mut self, name: &str) -> Result<()> {
        let _lock = persist::lock(&self.paths.networks_dir().join(REGISTRY_LOCK_NAME))?;
        let network = self.get(name)?.clone();
        let mut errors = StepErrors::new();

        let _ = errors.record(
            "delete interface",
            self.driver(&network.driver).and_then(|d| d.delete(&network)),
        );
        let _ = errors.record(
            "release gateway",
            self.ipam.release(&network.subnet, network.gateway_ip),
        );
        let _ = errors.record(
            "remove descriptor",
            persist::remove(&self.paths.network_file(name)),
        );
        let _ = self.networks.remove(name);

        if errors.is_empty() {
            tracing::info!(network = name, "network deleted");
        }
        errors.into_result("network delete")
    }

    /// Allocates an address on `network` and has its driver create the
    /// endpoint's link.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] for an unknown network, plus any
    /// allocation or driver error. A failed driver call releases the
    /// address again.
    pub fn connect(
        &self,
        network: &str,
        container_id: &str,
        port_mappings: Vec<PortMapping>,
    ) -> Result<Endpoint> {
        let net = self.get(network)?;
        let driver = self.driver(&net.driver)?;
        let ip = self.ipam.alloc(&net.subnet)?;
        let mut endpoint = Endpoint::new(container_id, network, ip, port_mappings);
        if let Err(e) = driver.connect(net, &mut endpoint) {
            self.release_quietly(&net.subnet, ip);
            return Err(e);
        }
        Ok(endpoint)
    }

    /// Moves the container end of `endpoint` into the network namespace
    /// of `pid`, configures its address and default route, and installs
    /// its port forwards.
    ///
    /// # Errors
    ///
    /// Returns the first failing step. [`NetworkRegistry::release`]
    /// undoes whatever was done.
    pub fn attach(&self, endpoint: &Endpoint, pid: u32) -> Result<()> {
        let net = self.get(&endpoint.network)?;
        let device = endpoint.device.as_ref().ok_or_else(|| CellarError::NotFound {
            kind: "endpoint device",
            id: endpoint.id.clone(),
        })?;
        let address = host_cidr(endpoint.ip_address, &net.subnet()?)?;

        self.links.set_netns(&device.name, pid)?;
        self.links
            .configure_in_netns(pid, &device.name, address, net.gateway_ip)?;
        for mapping in &endpoint.port_mappings {
            self.firewall
                .append(&NatRule::port_forward(*mapping, endpoint.ip_address))?;
        }
        tracing::info!(endpoint = %endpoint.id, pid, ip = %endpoint.ip_address, "endpoint attached");
        Ok(())
    }

    /// Undoes [`NetworkRegistry::connect`] and
    /// [`NetworkRegistry::attach`]: removes port forwards, deletes the
    /// host end of the veth pair if it still exists, and releases the
    /// address. Every step is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Partial`] listing the steps that failed.
    pub fn release(&self, endpoint: &Endpoint) -> Result<()> {
        let mut errors = StepErrors::new();

        for mapping in &endpoint.port_mappings {
            let rule = NatRule::port_forward(*mapping, endpoint.ip_address);
            if let Err(e) = self.firewall.delete(&rule) {
                tracing::debug!(%rule, error = %e, "port forward not removed");
            }
        }

        if let Some(device) = &endpoint.device {
            match self.links.link_index(&device.peer) {
                Ok(Some(_)) => {
                    let _ = errors.record("delete veth", self.links.delete_link(&device.peer));
                }
                Ok(None) => {}
                Err(e) => errors.push("delete veth", e),
            }
        }

        match self.get(&endpoint.network) {
            Ok(net) => {
                let _ = errors.record(
                    "release address",
                    self.ipam.release(&net.subnet, endpoint.ip_address),
                );
            }
            Err(e) => errors.push("release address", e),
        }

        if errors.is_empty() {
            tracing::info!(endpoint = %endpoint.id, "endpoint released");
        }
        errors.into_result("endpoint release")
    }

    /// Asks the endpoint's driver to detach it.
    ///
    /// # Errors
    ///
    /// The bridge driver returns [`CellarError::Unsupported`].
    pub fn disconnect(&self, endpoint: &Endpoint) -> Result<()> {
        let net = self.get(&endpoint.network)?;
        self.driver(&net.driver)?.disconnect(net, endpoint)
    }

    fn release_quietly(&self, subnet: &str, ip: Ipv4Addr) {
        if let Err(e) = self.ipam.release(subnet, ip) {
            tracing::error!(subnet, %ip, error = %e, "failed to release address during rollback");
        }
    }
}

/// Name of the driver used when none is given.
#[must_use]
pub const fn default_driver() -> &'static str {
    BRIDGE_DRIVER_NAME
}
