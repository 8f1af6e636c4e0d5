//! Subnet-bitmap IP address management.
//!
//! Every subnet ever allocated from has one bit vector with a slot per
//! address. Slot 0 (network) and the last slot (broadcast) are never
//! handed out. All subnets live in one JSON file mapping the canonical
//! CIDR to its vector; each allocation or release is a locked
//! load-modify-store of that file.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use cellar_common::error::{CellarError, Result};
use cellar_common::persist;
use ipnetwork::{IpNetwork, Ipv4Network};

/// Persisted allocation state: canonical subnet to per-address bits.
pub type SubnetAllocations = BTreeMap<String, Vec<bool>>;

/// Parses a CIDR and canonicalizes it to its network address.
///
/// # Errors
///
/// Returns [`CellarError::Config`] for malformed or IPv6 input that
/// fits in a bitmap, and [`CellarError::SubnetTooLarge`] when the host
/// part is too wide to index.
pub fn parse_subnet(cidr: &str) -> Result<Ipv4Network> {
    let network: IpNetwork = cidr
        .trim()
        .parse()
        .map_err(|e| CellarError::config(format!("invalid subnet {cidr:?}: {e}")))?;
    let host_bits = u32::from(max_prefix(&network) - network.prefix());
    if host_bits >= usize::BITS {
        return Err(CellarError::SubnetTooLarge {
            subnet: cidr.to_owned(),
        });
    }
    match network {
        IpNetwork::V4(v4) => Ipv4Network::new(v4.network(), v4.prefix())
            .map_err(|e| CellarError::config(format!("invalid subnet {cidr:?}: {e}"))),
        IpNetwork::V6(_) => Err(CellarError::config(format!(
            "subnet {cidr:?} is not IPv4"
        ))),
    }
}

const fn max_prefix(network: &IpNetwork) -> u8 {
    match network {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    }
}

fn slots(subnet: &Ipv4Network) -> usize {
    1usize << (32 - u32::from(subnet.prefix()))
}

/// Allocates and releases addresses, persisting to one file.
#[derive(Debug, Clone)]
pub struct IpAddressManager {
    path: PathBuf,
}

impl IpAddressManager {
    /// Creates a manager backed by `path`. Nothing is read until used.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current state. A missing file is empty state.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<SubnetAllocations> {
        let loaded = persist::load(&self.path)?;
        if loaded.is_none() {
            tracing::debug!(path = %self.path.display(), "no IPAM state yet");
        }
        Ok(loaded.unwrap_or_default())
    }

    /// Claims the lowest free host address of `subnet`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::AddressExhausted`] when every host address
    /// is taken, plus any [`parse_subnet`] or persistence error.
    pub fn alloc(&self, subnet: &str) -> Result<Ipv4Addr> {
        let net = parse_subnet(subnet)?;
        let key = net.to_string();
        let ip = persist::update(&self.path, |state: &mut SubnetAllocations| {
            let bits = state.entry(key.clone()).or_insert_with(|| vec![false; slots(&net)]);
            let last = bits.len().saturating_sub(1);
            let offset = (1..last)
                .find(|&i| !bits[i])
                .ok_or_else(|| CellarError::AddressExhausted {
                    subnet: key.clone(),
                })?;
            bits[offset] = true;
            Ok(address_at(&net, offset))
        })?;
        tracing::info!(subnet = %key, %ip, "address allocated");
        Ok(ip)
    }

    /// Returns `ip` to the free pool of `subnet`.
    ///
    /// Releasing an address that is not currently allocated is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::InvalidAddress`] if `ip` is outside the
    /// subnet or is its network or broadcast address.
    pub fn release(&self, subnet: &str, ip: Ipv4Addr) -> Result<()> {
        let net = parse_subnet(subnet)?;
        let key = net.to_string();
        let invalid = || CellarError::InvalidAddress {
            ip: ip.to_string(),
            subnet: key.clone(),
        };
        if !net.contains(ip) {
            return Err(invalid());
        }
        let offset = usize::try_from(u32::from(ip) - u32::from(net.network()))
            .map_err(|_| invalid())?;
        if offset == 0 || offset >= slots(&net) - 1 {
            return Err(invalid());
        }

        persist::update(&self.path, |state: &mut SubnetAllocations| {
            if let Some(slot) = state.get_mut(&key).and_then(|bits| bits.get_mut(offset)) {
                *slot = false;
            }
            Ok(())
        })?;
        tracing::info!(subnet = %key, %ip, "address released");
        Ok(())
    }
}

fn address_at(net: &Ipv4Network, offset: usize) -> Ipv4Addr {
    // offset < 2^(32 - prefix), so it fits in the host part.
    #[allow(clippy::cast_possible_truncation)]
    Ipv4Addr::from(u32::from(net.network()) + offset as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, IpAddressManager) {
        let dir = tempfile::tempdir().unwrap();
        let ipam = IpAddressManager::new(dir.path().join("ipam").join("subnet.json"));
        (dir, ipam)
    }

    #[test]
    fn allocation_starts_after_network_address() {
        let (_dir, ipam) = manager();
        assert_eq!(ipam.alloc("192.168.1.0/24").unwrap(), Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(ipam.alloc("192.168.1.0/24").unwrap(), Ipv4Addr::new(192, 168, 1, 2));
    }

    #[test]
    fn released_address_is_handed_out_again() {
        let (_dir, ipam) = manager();
        let first = ipam.alloc("192.168.1.0/24").unwrap();
        let _second = ipam.alloc("192.168.1.0/24").unwrap();
        ipam.release("192.168.1.0/24", first).unwrap();
        assert_eq!(ipam.alloc("192.168.1.0/24").unwrap(), first);
    }

    #[test]
    fn subnet_key_is_canonical() {
        let (_dir, ipam) = manager();
        let ip = ipam.alloc("10.0.0.77/24").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 1));
        let state = ipam.load().unwrap();
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["10.0.0.0/24"]);
        assert_eq!(state["10.0.0.0/24"].len(), 256);
    }

    #[test]
    fn slash_thirty_has_two_hosts() {
        let (_dir, ipam) = manager();
        assert_eq!(ipam.alloc("172.16.0.0/30").unwrap(), Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(ipam.alloc("172.16.0.0/30").unwrap(), Ipv4Addr::new(172, 16, 0, 2));
        assert!(matches!(
            ipam.alloc("172.16.0.0/30"),
            Err(CellarError::AddressExhausted { .. })
        ));
    }

    #[test]
    fn point_to_point_prefixes_have_no_hosts() {
        let (_dir, ipam) = manager();
        for cidr in ["10.9.9.9/32", "10.9.9.8/31"] {
            assert!(matches!(ipam.alloc(cidr), Err(CellarError::AddressExhausted { .. })));
        }
    }

    #[test]
    fn network_and_broadcast_cannot_be_released() {
        let (_dir, ipam) = manager();
        for ip in [Ipv4Addr::new(192, 168, 1, 0), Ipv4Addr::new(192, 168, 1, 255)] {
            assert!(matches!(
                ipam.release("192.168.1.0/24", ip),
                Err(CellarError::InvalidAddress { .. })
            ));
        }
        assert!(matches!(
            ipam.release("192.168.1.0/24", Ipv4Addr::new(10, 0, 0, 1)),
            Err(CellarError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn wide_ipv6_subnet_is_too_large() {
        assert!(matches!(
            parse_subnet("fd00::/48"),
            Err(CellarError::SubnetTooLarge { .. })
        ));
        assert!(matches!(parse_subnet("fd00::/120"), Err(CellarError::Config { .. })));
        assert!(matches!(parse_subnet("not-a-cidr"), Err(CellarError::Config { .. })));
    }

    #[test]
    fn state_survives_a_new_manager() {
        let (dir, ipam) = manager();
        let _ = ipam.alloc("192.168.5.0/24").unwrap();
        let reopened = IpAddressManager::new(dir.path().join("ipam").join("subnet.json"));
        assert_eq!(reopened.alloc("192.168.5.0/24").unwrap(), Ipv4Addr::new(192, 168, 5, 2));
    }
}
