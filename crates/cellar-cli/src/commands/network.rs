//! `cellar network`: Manage bridge networks.

use anyhow::Context;
use cellar_common::config::RuntimePaths;
use cellar_network::NetworkRegistry;
use cellar_network::registry::default_driver;
use clap::{Args, Subcommand};

use crate::output::Table;

/// Network subcommands.
#[derive(Subcommand, Debug)]
pub enum NetworkCommand {
    /// Create a network and its bridge.
    Create(CreateArgs),
    /// List networks.
    Ls,
    /// Delete a network and its bridge.
    Rm(RmArgs),
}

/// Arguments for `network create`.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Network driver.
    #[arg(long, default_value = default_driver())]
    pub driver: String,

    /// Subnet in CIDR form, e.g. 192.168.10.0/24.
    #[arg(long)]
    pub subnet: String,

    /// Network name; also the bridge interface name.
    pub name: String,
}

/// Arguments for `network rm`.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Network name.
    pub name: String,
}

/// Executes a `network` subcommand.
///
/// # Errors
///
/// Returns an error if the registry cannot be loaded or the operation
/// fails.
pub fn execute(command: NetworkCommand, paths: RuntimePaths) -> anyhow::Result<()> {
    let mut registry = NetworkRegistry::open(paths)?;
    match command {
        NetworkCommand::Create(args) => {
            let network = registry
                .create_network(&args.driver, &args.subnet, &args.name)
                .with_context(|| format!("failed to create network {}", args.name))?;
            tracing::info!(network = %network.name, gateway = %network.gateway_ip, "network created");
            println!("{}", network.name);
        }
        NetworkCommand::Ls => {
            let mut table = Table::new(["NAME", "SUBNET", "GATEWAY", "DRIVER"]);
            for network in registry.list() {
                table.row(vec![
                    network.name.clone(),
                    network.subnet.clone(),
                    network.gateway_ip.to_string(),
                    network.driver.clone(),
                ]);
            }
            print!("{}", table.render());
        }
        NetworkCommand::Rm(args) => {
            registry
                .delete_network(&args.name)
                .with_context(|| format!("failed to delete network {}", args.name))?;
            println!("{}", args.name);
        }
    }
    Ok(())
}
