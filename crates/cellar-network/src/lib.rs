//! # cellar-network
//!
//! Container networking for the cellar runtime.
//!
//! - [`ipam`]: subnet-bitmap IP allocation persisted to a single JSON file.
//! - [`bridge`]: the `bridge` driver (Linux bridge, veth pairs, NAT).
//! - [`registry`]: the explicit registry of drivers and networks that
//!   ties allocation, drivers, and descriptor files together.
//!
//! Kernel state is changed through the [`link::LinkControl`] and
//! [`firewall::Firewall`] traits; the host implementations shell out to
//! `ip` and `iptables`.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bridge;
pub mod command;
pub mod driver;
pub mod firewall;
pub mod ipam;
pub mod link;
pub mod network;
pub mod registry;

pub use network::{Endpoint, Network, PortMapping, VethPair};
pub use registry::NetworkRegistry;
