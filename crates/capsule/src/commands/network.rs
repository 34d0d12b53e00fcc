//! Manage bridge networks.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libcapsule::network::NetworkStore;

#[derive(Subcommand, Debug)]
pub enum Network {
    Create(NetworkCreate),
    Delete(NetworkDelete),
    List(NetworkList),
}

/// Create a bridge network
#[derive(Parser, Debug)]
pub struct NetworkCreate {
    /// Subnet in CIDR notation, e.g. 10.20.0.0/16
    #[arg(long, required = true)]
    pub subnet: String,
    /// Name of the network (and of the bridge interface)
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub name: String,
}

/// Delete a bridge network
#[derive(Parser, Debug)]
pub struct NetworkDelete {
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub name: String,
}

/// List networks
#[derive(Parser, Debug)]
pub struct NetworkList {}

pub fn network(args: Network, root: PathBuf) -> Result<()> {
    let store = NetworkStore::new(&root).context("failed to open network store")?;
    match args {
        Network::Create(args) => {
            let network = store
                .create(&args.name, &args.subnet)
                .with_context(|| format!("failed to create network {}", args.name))?;
            println!("{} {}", network.name, network.ip_range);
            Ok(())
        }
        Network::Delete(args) => store
            .delete(&args.name)
            .with_context(|| format!("failed to delete network {}", args.name)),
        Network::List(_) => {
            for network in store.list()? {
                println!("{}\t{}\t{}", network.name, network.ip_range, network.driver);
            }
            Ok(())
        }
    }
}
