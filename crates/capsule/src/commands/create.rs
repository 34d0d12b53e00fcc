//! Create a container from a bundle without running the user program yet.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libcapsule::config::{BundleSpec, ContainerConfig};
use libcapsule::network::PortMapping;

use super::{load_factory, new_process, reclaim_after_error};

/// Create a container
#[derive(Parser, Debug)]
pub struct Create {
    /// Path to the bundle directory, containing config.json and a rootfs
    #[arg(short, long, default_value = ".")]
    pub bundle: PathBuf,
    /// Attach the container to this network
    #[arg(long)]
    pub network: Option<String>,
    /// Publish a container port as host:container (repeatable)
    #[arg(short = 'p', long = "publish")]
    pub port_mappings: Vec<PortMapping>,
    /// Name of the container instance
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}

pub fn create(args: Create, root: PathBuf) -> Result<()> {
    let spec = BundleSpec::load(&args.bundle)
        .with_context(|| format!("failed to load bundle {:?}", args.bundle))?;
    let config = ContainerConfig::from_spec(&spec, &args.bundle)?;

    let factory = load_factory(&root)?;
    let mut container = factory.create(&args.container_id, config)?;
    container
        .create(new_process(&spec, true))
        .with_context(|| format!("failed to create container {}", args.container_id))?;

    if let Some(network) = &args.network {
        if let Err(err) = container.connect_network(network, args.port_mappings.clone()) {
            reclaim_after_error(&mut container);
            return Err(err)
                .with_context(|| format!("failed to connect container to network {network}"));
        }
    }
    Ok(())
}
