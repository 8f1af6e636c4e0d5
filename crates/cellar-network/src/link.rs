//! Network interface control.
//!
//! [`LinkControl`] is the set of link operations the bridge driver and
//! the registry need. [`IpCommand`] implements it with iproute2 and
//! sysfs; [`RecordingLinks`] is an in-memory double.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use cellar_common::error::{CellarError, Result};
use ipnetwork::Ipv4Network;

use crate::command;

/// Link-level operations on host (and container) interfaces.
pub trait LinkControl: Send + Sync {
    /// Interface index of `name`, or `None` if no such link exists.
    ///
    /// # Errors
    ///
    /// Returns an error only if the lookup itself failed.
    fn link_index(&self, name: &str) -> Result<Option<u32>>;

    /// Creates a Linux bridge.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Link`] on failure.
    fn add_bridge(&self, name: &str) -> Result<()>;

    /// Assigns `address` (host address plus prefix) to `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Link`] on failure.
    fn add_address(&self, name: &str, address: Ipv4Network) -> Result<()>;

    /// Brings `name` up.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Link`] on failure.
    fn set_up(&self, name: &str) -> Result<()>;

    /// Deletes `name` (and its veth peer, if it has one).
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Link`] on failure.
    fn delete_link(&self, name: &str) -> Result<()>;

    /// Creates a veth pair `name` / `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Link`] on failure.
    fn add_veth(&self, name: &str, peer: &str) -> Result<()>;

    /// Enslaves `name` to the bridge `master`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Link`] on failure.
    fn set_master(&self, name: &str, master: &str) -> Result<()>;

    /// Moves `name` into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Link`] on failure.
    fn set_netns(&self, name: &str, pid: u32) -> Result<()>;

    /// Inside the network namespace of `pid`: assigns `address` to
    /// `name`, brings it and loopback up, and routes by default through
    /// `gateway`.
    ///
    /// # Errors
    ///
    /// Returns [`CellarError::Link`] on failure.
    fn configure_in_netns(
        &self,
        pid: u32,
        name: &str,
        address: Ipv4Network,
        gateway: Ipv4Addr,
    ) -> Result<()>;
}

/// [`LinkControl`] backed by the `ip` and `nsenter` tools.
#[derive(Debug, Clone)]
pub struct IpCommand {
    sysfs_net: PathBuf,
}

impl Default for IpCommand {
    fn default() -> Self {
        Self {
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl IpCommand {
    /// Creates an instance using the host's tools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ip(op: &'static str, name: &str, args: &[&str]) -> Result<()> {
        command::run("ip", args)
            .map(|_| ())
            .map_err(|e| link_error(op, name, &e))
    }

    fn nsenter(op: &'static str, name: &str, pid: u32, args: &[&str]) -> Result<()> {
        let target = pid.to_string();
        let mut full = vec!["--target", target.as_str(), "--net", "ip"];
        full.extend_from_slice(args);
        command::run("nsenter", &full)
            .map(|_| ())
            .map_err(|e| link_error(op, name, &e))
    }
}

fn link_error(op: &'static str, name: &str, cause: &CellarError) -> CellarError {
    CellarError::Link {
        op,
        name: name.to_owned(),
        message: cause.to_string(),
    }
}

impl LinkControl for IpCommand {
    fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let path = self.sysfs_net.join(name).join("ifindex");
        match std::fs::read_to_string(&path) {
            Ok(raw) => raw.trim().parse().map(Some).map_err(|e| CellarError::Link {
                op: "lookup",
                name: name.to_owned(),
                message: format!("unparsable ifindex {raw:?}: {e}"),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CellarError::Link {
                op: "lookup",
                name: name.to_owned(),
                message: e.to_string(),
            }),
        }
    }

    fn add_bridge(&self, name: &str) -> Result<()> {
        Self::ip("add bridge", name, &["link", "add", name, "type", "bridge"])
    }

    fn add_address(&self, name: &str, address: Ipv4Network) -> Result<()> {
        let cidr = address.to_string();
        Self::ip("add address", name, &["addr", "add", &cidr, "dev", name])
    }

    fn set_up(&self, name: &str) -> Result<()> {
        Self::ip("set up", name, &["link", "set", name, "up"])
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        Self::ip("delete", name, &["link", "del", name])
    }

    fn add_veth(&self, name: &str, peer: &str) -> Result<()> {
        Self::ip(
            "add veth",
            name,
            &["link", "add", name, "type", "veth", "peer", "name", peer],
        )
    }

    fn set_master(&self, name: &str, master: &str) -> Result<()> {
        Self::ip("set master", name, &["link", "set", name, "master", master])
    }

    fn set_netns(&self, name: &str, pid: u32) -> Result<()> {
        let pid = pid.to_string();
        Self::ip("set netns", name, &["link", "set", name, "netns", &pid])
    }

    fn configure_in_netns(
        &self,
        pid: u32,
        name: &str,
        address: Ipv4Network,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        let cidr = address.to_string();
        let gateway = gateway.to_string();
        Self::nsenter("add address", name, pid, &["addr", "add", &cidr, "dev", name])?;
        Self::nsenter("set up", name, pid, &["link", "set", name, "up"])?;
        Self::nsenter("set up", "lo", pid, &["link", "set", "lo", "up"])?;
        Self::nsenter(
            "add default route",
            name,
            pid,
            &["route", "add", "default", "via", &gateway, "dev", name],
        )
    }
}

/// One operation seen by [`RecordingLinks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    /// `add_bridge`.
    AddBridge(String),
    /// `add_address`.
    AddAddress(String, Ipv4Network),
    /// `set_up`.
    SetUp(String),
    /// `delete_link`.
    Delete(String),
    /// `add_veth`.
    AddVeth(String, String),
    /// `set_master`.
    SetMaster(String, String),
    /// `set_netns`.
    SetNetns(String, u32),
    /// `configure_in_netns`.
    Configure {
        /// Namespace owner.
        pid: u32,
        /// Interface.
        name: String,
        /// Assigned address.
        address: Ipv4Network,
        /// Default gateway.
        gateway: Ipv4Addr,
    },
}

#[derive(Debug, Default)]
struct LinkState {
    links: BTreeMap<String, u32>,
    next_index: u32,
    calls: Vec<LinkCall>,
    peers: BTreeMap<String, String>,
    hidden: BTreeMap<String, u32>,
    failures: Vec<(&'static str, String)>,
}

/// In-memory [`LinkControl`] that records every call.
///
/// Created links become visible to [`LinkControl::link_index`]
/// immediately unless [`RecordingLinks::hide_for`] delays them.
#[derive(Debug, Default)]
pub struct RecordingLinks {
    state: Mutex<LinkState>,
}

impl RecordingLinks {
    /// Creates a double with no links.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretends `name` already exists.
    pub fn insert(&self, name: &str) {
        let mut state = self.lock();
        state.next_index += 1;
        let index = state.next_index;
        let _ = state.links.insert(name.to_owned(), index);
    }

    /// Makes the first `lookups` lookups of `name` miss.
    pub fn hide_for(&self, name: &str, lookups: u32) {
        let _ = self.lock().hidden.insert(name.to_owned(), lookups);
    }

    /// Makes operation `op` (the [`CellarError::Link`] op name) on
    /// `name` fail.
    pub fn fail(&self, op: &'static str, name: &str) {
        self.lock().failures.push((op, name.to_owned()));
    }

    /// Every mutating call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<LinkCall> {
        self.lock().calls.clone()
    }

    /// Names of the links that currently exist.
    #[must_use]
    pub fn links(&self) -> Vec<String> {
        self.lock().links.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, op: &'static str, name: &str, call: LinkCall) -> Result<MutexGuard<'_, LinkState>> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.failures.iter().any(|(o, n)| *o == op && n == name) {
            return Err(CellarError::Link {
                op,
                name: name.to_owned(),
                message: "injected failure".into(),
            });
        }
        Ok(state)
    }

    fn require(state: &LinkState, op: &'static str, name: &str) -> Result<()> {
        if state.links.contains_key(name) {
            Ok(())
        } else {
            Err(CellarError::Link {
                op,
                name: name.to_owned(),
                message: "no such device".into(),
            })
        }
    }

    fn create(state: &mut LinkState, op: &'static str, name: &str) -> Result<()> {
        if state.links.contains_key(name) {
            return Err(CellarError::Link {
                op,
                name: name.to_owned(),
                message: "file exists".into(),
            });
        }
        state.next_index += 1;
        let index = state.next_index;
        let _ = state.links.insert(name.to_owned(), index);
        Ok(())
    }
}

impl LinkControl for RecordingLinks {
    fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut state = self.lock();
        if let Some(remaining) = state.hidden.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(None);
            }
        }
        Ok(state.links.get(name).copied())
    }

    fn add_bridge(&self, name: &str) -> Result<()> {
        let mut state = self.record("add bridge", name, LinkCall::AddBridge(name.to_owned()))?;
        Self::create(&mut state, "add bridge", name)
    }

    fn add_address(&self, name: &str, address: Ipv4Network) -> Result<()> {
        let state = self.record("add address", name, LinkCall::AddAddress(name.to_owned(), address))?;
        Self::require(&state, "add address", name)
    }

    fn set_up(&self, name: &str) -> Result<()> {
        let state = self.record("set up", name, LinkCall::SetUp(name.to_owned()))?;
        Self::require(&state, "set up", name)
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        let mut state = self.record("delete", name, LinkCall::Delete(name.to_owned()))?;
        Self::require(&state, "delete", name)?;
        let _ = state.links.remove(name);
        if let Some(peer) = state.peers.remove(name) {
            let _ = state.peers.remove(&peer);
            let _ = state.links.remove(&peer);
        }
        Ok(())
    }

    fn add_veth(&self, name: &str, peer: &str) -> Result<()> {
        let mut state = self.record(
            "add veth",
            name,
            LinkCall::AddVeth(name.to_owned(), peer.to_owned()),
        )?;
        Self::create(&mut state, "add veth", name)?;
        Self::create(&mut state, "add veth", peer)?;
        let _ = state.peers.insert(name.to_owned(), peer.to_owned());
        let _ = state.peers.insert(peer.to_owned(), name.to_owned());
        Ok(())
    }

    fn set_master(&self, name: &str, master: &str) -> Result<()> {
        let state = self.record(
            "set master",
            name,
            LinkCall::SetMaster(name.to_owned(), master.to_owned()),
        )?;
        Self::require(&state, "set master", name)?;
        Self::require(&state, "set master", master)
    }

    fn set_netns(&self, name: &str, pid: u32) -> Result<()> {
        let mut state = self.record("set netns", name, LinkCall::SetNetns(name.to_owned(), pid))?;
        Self::require(&state, "set netns", name)?;
        // Gone from the host's view once moved.
        let _ = state.links.remove(name);
        Ok(())
    }

    fn configure_in_netns(
        &self,
        pid: u32,
        name: &str,
        address: Ipv4Network,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        let _state = self.record(
            "configure",
            name,
            LinkCall::Configure {
                pid,
                name: name.to_owned(),
                address,
                gateway,
            },
        )?;
        Ok(())
    }
}
