//! NAT rules for container networks.
//!
//! Two rule kinds are used: source NAT (`MASQUERADE`) for traffic leaving
//! a bridge subnet, and destination NAT for published ports.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

use cellar_common::error::Result;
use ipnetwork::Ipv4Network;

use crate::command;
use crate::network::PortMapping;

/// A rule in the `nat` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatRule {
    /// Masquerade traffic from `source` that leaves through any
    /// interface other than `bridge`.
    Masquerade {
        /// Bridge subnet.
        source: Ipv4Network,
        /// Bridge interface.
        bridge: String,
    },
    /// Forward a host TCP port to a container address.
    PortForward {
        /// Host and container ports.
        mapping: PortMapping,
        /// Container address.
        destination: Ipv4Addr,
    },
}

impl NatRule {
    /// Creates a masquerade rule for a bridge subnet.
    #[must_use]
    pub fn masquerade(source: Ipv4Network, bridge: impl Into<String>) -> Self {
        Self::Masquerade {
            source,
            bridge: bridge.into(),
        }
    }

    /// Creates a port forwarding rule.
    #[must_use]
    pub const fn port_forward(mapping: PortMapping, destination: Ipv4Addr) -> Self {
        Self::PortForward {
            mapping,
            destination,
        }
    }

    /// `iptables` arguments for this rule with `action` (`-A` or `-D`).
    #[must_use]
    pub fn iptables_args(&self, action: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["-t".into(), "nat".into(), action.into()];
        match self {
            Self::Masquerade { source, bridge } => {
                args.extend(
                    [
                        "POSTROUTING",
                        "-s",
                        source.to_string().as_str(),
                        "!",
                        "-o",
                        bridge.as_str(),
                        "-j",
                        "MASQUERADE",
                    ]
                    .map(str::to_owned),
                );
            }
            Self::PortForward {
                mapping,
                destination,
            } => {
                args.extend(
                    [
                        "PREROUTING",
                        "-p",
                        "tcp",
                        "-m",
                        "tcp",
                        "--dport",
                        mapping.host_port.to_string().as_str(),
                        "-j",
                        "DNAT",
                        "--to-destination",
                        format!("{destination}:{}", mapping.container_port).as_str(),
                    ]
                    .map(str::to_owned),
                );
            }
        }
        args
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Masquerade { source, bridge } => write!(f, "masquerade {source} !{bridge}"),
            Self::PortForward {
                mapping,
                destination,
            } => write!(f, "dnat {} -> {destination}:{}", mapping.host_port, mapping.container_port),
        }
    }
}

/// Installs and removes [`NatRule`]s.
pub trait Firewall: Send + Sync {
    /// Appends `rule`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be installed.
    fn append(&self, rule: &NatRule) -> Result<()>;

    /// Deletes `rule`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule cannot be removed.
    fn delete(&self, rule: &NatRule) -> Result<()>;
}

/// [`Firewall`] backed by the `iptables` tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct Iptables;

impl Iptables {
    fn run(rule: &NatRule, action: &str) -> Result<()> {
        let args = rule.iptables_args(action);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let _ = command::run("iptables", &args)?;
        Ok(())
    }
}

impl Firewall for Iptables {
    fn append(&self, rule: &NatRule) -> Result<()> {
        Self::run(rule, "-A")?;
        tracing::debug!(%rule, "nat rule added");
        Ok(())
    }

    fn delete(&self, rule: &NatRule) -> Result<()> {
        Self::run(rule, "-D")?;
        tracing::debug!(%rule, "nat rule removed");
        Ok(())
    }
}

/// In-memory [`Firewall`] holding the installed rules.
#[derive(Debug, Default)]
pub struct RecordingFirewall {
    rules: Mutex<Vec<NatRule>>,
}

impl RecordingFirewall {
    /// Creates an empty rule set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules currently installed.
    #[must_use]
    pub fn rules(&self) -> Vec<NatRule> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Firewall for RecordingFirewall {
    fn append(&self, rule: &NatRule) -> Result<()> {
        self.rules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule.clone());
        Ok(())
    }

    fn delete(&self, rule: &NatRule) -> Result<()> {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let index = rules.iter().position(|r| r == rule).ok_or_else(|| {
            cellar_common::error::CellarError::ExternalCommand {
                program: "iptables".into(),
                message: format!("no rule matching {rule}"),
            }
        })?;
        let _ = rules.remove(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masquerade_excludes_the_bridge_itself() {
        let rule = NatRule::masquerade("192.168.10.0/24".parse().unwrap(), "br0");
        assert_eq!(
            rule.iptables_args("-A").join(" "),
            "-t nat -A POSTROUTING -s 192.168.10.0/24 ! -o br0 -j MASQUERADE"
        );
    }

    #[test]
    fn port_forward_targets_container_address() {
        let rule = NatRule::port_forward(
            PortMapping {
                host_port: 8080,
                container_port: 80,
            },
            Ipv4Addr::new(192, 168, 10, 2),
        );
        assert_eq!(
            rule.iptables_args("-D").join(" "),
            "-t nat -D PREROUTING -p tcp -m tcp --dport 8080 -j DNAT --to-destination 192.168.10.2:80"
        );
    }
}
