//! The network driver abstraction.

use std::net::Ipv4Addr;
use std::time::Duration;

use cellar_common::constants::{INTERFACE_LOOKUP_ATTEMPTS, INTERFACE_LOOKUP_DELAY};
use cellar_common::error::Result;

use crate::network::{Endpoint, Network};

/// Creates and removes networks of one kind and attaches endpoints.
pub trait NetworkDriver: Send + Sync {
    /// Driver name, as stored in network descriptors.
    fn name(&self) -> &str;

    /// Creates network `name` on `subnet` with the given gateway address.
    ///
    /// # Errors
    ///
    /// Returns an error if the network cannot be created; nothing the
    /// call created is left behind.
    fn create(&self, name: &str, subnet: &str, gateway: Ipv4Addr) -> Result<Network>;

    /// Removes the kernel state of `network`.
    ///
    /// # Errors
    ///
    /// Returns an error if the network's interface cannot be removed.
    fn delete(&self, network: &Network) -> Result<()>;

    /// Creates the link for `endpoint` and records it in
    /// [`Endpoint::device`].
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be created or attached.
    fn connect(&self, network: &Network, endpoint: &mut Endpoint) -> Result<()>;

    /// Detaches `endpoint` from `network`.
    ///
    /// # Errors
    ///
    /// Drivers without live detach return
    /// [`cellar_common::error::CellarError::Unsupported`].
    fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> Result<()>;
}

/// How often and how patiently to look for a freshly created interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total lookups, including the first.
    pub attempts: u32,
    /// Pause between lookups.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: INTERFACE_LOOKUP_ATTEMPTS,
            delay: INTERFACE_LOOKUP_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping.
    #[must_use]
    pub const fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            delay: Duration::ZERO,
        }
    }
}
