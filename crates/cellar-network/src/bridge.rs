//! The `bridge` network driver.
//!
//! A network is a Linux bridge named after it, holding the gateway
//! address, with a `MASQUERADE` rule for the subnet. An endpoint is a
//! veth pair: one end stays on the host enslaved to the bridge, the
//! other is later moved into the container's network namespace.

use std::net::Ipv4Addr;
use std::sync::Arc;

use cellar_common::constants::BRIDGE_DRIVER_NAME;
use cellar_common::error::{CellarError, Result};

use crate::driver::{NetworkDriver, RetryPolicy};
use crate::firewall::{Firewall, NatRule};
use crate::ipam::parse_subnet;
use crate::link::LinkControl;
use crate::network::{Endpoint, Network, VethPair, host_cidr, validate_network_name};

/// Bridge driver over a [`LinkControl`] and a [`Firewall`].
pub struct BridgeDriver {
    links: Arc<dyn LinkControl>,
    firewall: Arc<dyn Firewall>,
    lookup: RetryPolicy,
}

impl std::fmt::Debug for BridgeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeDriver")
            .field("lookup", &self.lookup)
            .finish_non_exhaustive()
    }
}

impl BridgeDriver {
    /// Creates a driver with the default lookup retry policy.
    #[must_use]
    pub fn new(links: Arc<dyn LinkControl>, firewall: Arc<dyn Firewall>) -> Self {
        Self {
            links,
            firewall,
            lookup: RetryPolicy::default(),
        }
    }

    /// Replaces the lookup retry policy.
    #[must_use]
    pub const fn with_lookup_policy(mut self, lookup: RetryPolicy) -> Self {
        self.lookup = lookup;
        self
    }

    /// Looks `name` up, retrying per the lookup policy.
    ///
    /// Newly created links can take a moment to become visible.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::NotFound`] if every attempt misses.
    pub fn find_interface(&self, name: &str) -> Result<u32> {
        for attempt in 1..=self.lookup.attempts {
            if let Some(index) = self.links.link_index(name)? {
                return Ok(index);
            }
            tracing::debug!(interface = name, attempt, "interface not visible yet");
            if attempt < self.lookup.attempts && !self.lookup.delay.is_zero() {
                std::thread::sleep(self.lookup.delay);
            }
        }
        Err(CellarError::NotFound {
            kind: "interface",
            id: name.to_owned(),
        })
    }

    fn setup_bridge(&self, network: &Network) -> Result<()> {
        let name = network.name.as_str();
        let _ = self.find_interface(name)?;
        self.links.add_address(name, network.gateway_cidr()?)?;
        self.links.set_up(name)?;
        self.firewall
            .append(&NatRule::masquerade(network.subnet()?, name))
    }

    fn attach_veth(&self, bridge: &str, pair: &VethPair) -> Result<()> {
        self.links.set_master(&pair.peer, bridge)?;
        self.links.set_up(&pair.peer)
    }
}

impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &str {
        BRIDGE_DRIVER_NAME
    }

    fn create(&self, name: &str, subnet: &str, gateway: Ipv4Addr) -> Result<Network> {
        validate_network_name(name)?;
        let subnet = parse_subnet(subnet)?;
        let _ = host_cidr(gateway, &subnet)?;

        if self.links.link_index(name)?.is_some() {
            return Err(CellarError::NetworkExists {
                name: name.to_owned(),
            });
        }
        self.links.add_bridge(name)?;

        let network = Network {
            name: name.to_owned(),
            subnet: subnet.to_string(),
            gateway_ip: gateway,
            driver: BRIDGE_DRIVER_NAME.to_owned(),
        };
        if let Err(e) = self.setup_bridge(&network) {
            if let Err(cleanup) = self.links.delete_link(name) {
                tracing::error!(bridge = name, error = %cleanup, "failed to remove half-created bridge");
            }
            return Err(e);
        }
        tracing::info!(bridge = name, subnet = %network.subnet, %gateway, "bridge network created");
        Ok(network)
    }

    fn delete(&self, network: &Network) -> Result<()> {
        let _ = self.find_interface(&network.name)?;
        self.links.delete_link(&network.name)?;
        // A leftover rule is logged, not returned.
        match network
            .subnet()
            .and_then(|subnet| self.firewall.delete(&NatRule::masquerade(subnet, &network.name)))
        {
            Ok(()) => {}
            Err(e) => tracing::warn!(network = %network.name, error = %e, "failed to remove masquerade rule"),
        }
        tracing::info!(network = %network.name, "bridge network deleted");
        Ok(())
    }

    fn connect(&self, network: &Network, endpoint: &mut Endpoint) -> Result<()> {
        let _ = self.find_interface(&network.name)?;
        let pair = VethPair::for_endpoint(&endpoint.id);
        self.links.add_veth(&pair.name, &pair.peer)?;
        if let Err(e) = self.attach_veth(&network.name, &pair) {
            if let Err(cleanup) = self.links.delete_link(&pair.peer) {
                tracing::error!(veth = %pair.peer, error = %cleanup, "failed to remove half-attached veth");
            }
            return Err(e);
        }
        tracing::info!(
            endpoint = %endpoint.id,
            bridge = %network.name,
            veth = %pair.name,
            "endpoint connected"
        );
        endpoint.device = Some(pair);
        Ok(())
    }

    fn disconnect(&self, _network: &Network, _endpoint: &Endpoint) -> Result<()> {
        Err(CellarError::Unsupported {
            operation: "bridge disconnect",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::RecordingFirewall;
    use crate::link::{LinkCall, RecordingLinks};

    fn driver() -> (Arc<RecordingLinks>, Arc<RecordingFirewall>, BridgeDriver) {
        let links = Arc::new(RecordingLinks::new());
        let firewall = Arc::new(RecordingFirewall::new());
        let driver = BridgeDriver::new(links.clone(), firewall.clone())
            .with_lookup_policy(RetryPolicy::immediate(2));
        (links, firewall, driver)
    }

    #[test]
    fn create_sets_up_bridge_address_and_nat() {
        let (links, firewall, driver) = driver();
        let network = driver
            .create("br0", "192.168.10.0/24", Ipv4Addr::new(192, 168, 10, 1))
            .unwrap();

        assert_eq!(network.driver, "bridge");
        assert_eq!(
            links.calls(),
            vec![
                LinkCall::AddBridge("br0".into()),
                LinkCall::AddAddress("br0".into(), "192.168.10.1/24".parse().unwrap()),
                LinkCall::SetUp("br0".into()),
            ]
        );
        assert_eq!(
            firewall.rules(),
            vec![NatRule::masquerade("192.168.10.0/24".parse().unwrap(), "br0")]
        );
    }

    #[test]
    fn existing_interface_is_network_exists() {
        let (links, _firewall, driver) = driver();
        links.insert("br0");
        let err = driver
            .create("br0", "192.168.10.0/24", Ipv4Addr::new(192, 168, 10, 1))
            .unwrap_err();
        assert!(matches!(err, CellarError::NetworkExists { .. }));
        assert!(links.calls().is_empty());
    }

    #[test]
    fn slow_interface_is_found_on_retry() {
        let (links, _firewall, driver) = driver();
        links.hide_for("br0", 1);
        driver
            .create("br0", "10.1.0.0/16", Ipv4Addr::new(10, 1, 0, 1))
            .unwrap();
    }

    #[test]
    fn failed_setup_removes_the_bridge() {
        let (links, firewall, driver) = driver();
        links.fail("set up", "br0");
        let err = driver
            .create("br0", "10.1.0.0/16", Ipv4Addr::new(10, 1, 0, 1))
            .unwrap_err();
        assert!(matches!(err, CellarError::Link { op: "set up", .. }));
        assert!(links.links().is_empty());
        assert!(firewall.rules().is_empty());
    }

    #[test]
    fn connect_attaches_host_end_to_bridge() {
        let (links, _firewall, driver) = driver();
        let network = driver
            .create("br0", "10.1.0.0/16", Ipv4Addr::new(10, 1, 0, 1))
            .unwrap();
        let mut endpoint = Endpoint::new("a1b2c3d4e5", "br0", Ipv4Addr::new(10, 1, 0, 2), vec![]);

        driver.connect(&network, &mut endpoint).unwrap();

        let pair = endpoint.device.clone().unwrap();
        assert_eq!(pair.name, "a1b2c3d4");
        assert!(links.calls().contains(&LinkCall::SetMaster(pair.peer.clone(), "br0".into())));
        assert!(links.links().contains(&pair.name));
    }

    #[test]
    fn disconnect_is_unsupported() {
        let (_links, _firewall, driver) = driver();
        let network = Network {
            name: "br0".into(),
            subnet: "10.1.0.0/16".into(),
            gateway_ip: Ipv4Addr::new(10, 1, 0, 1),
            driver: "bridge".into(),
        };
        let endpoint = Endpoint::new("a1b2c3d4e5", "br0", Ipv4Addr::new(10, 1, 0, 2), vec![]);
        assert!(matches!(
            driver.disconnect(&network, &endpoint),
            Err(CellarError::Unsupported { .. })
        ));
    }

    #[test]
    fn delete_of_missing_bridge_is_not_found() {
        let (_links, _firewall, driver) = driver();
        let network = Network {
            name: "ghost".into(),
            subnet: "10.1.0.0/16".into(),
            gateway_ip: Ipv4Addr::new(10, 1, 0, 1),
            driver: "bridge".into(),
        };
        assert!(matches!(
            driver.delete(&network),
            Err(CellarError::NotFound { kind: "interface", .. })
        ));
    }
}
