//! Create and immediately start a container.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libcapsule::config::{BundleSpec, ContainerConfig};
use libcapsule::network::PortMapping;

use super::{load_factory, new_process, reclaim_after_error};

/// Create and run a container
#[derive(Parser, Debug)]
pub struct Run {
    /// Path to the bundle directory, containing config.json and a rootfs
    #[arg(short, long, default_value = ".")]
    pub bundle: PathBuf,
    /// Leave the container running in the background
    #[arg(short, long)]
    pub detach: bool,
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

pub fn run(args: Run, root: PathBuf) -> Result<i32> {
    let spec = BundleSpec::load(&args.bundle)
        .with_context(|| format!("failed to load bundle {:?}", args.bundle))?;
    let config = ContainerConfig::from_spec(&spec, &args.bundle)?;

    let factory = load_factory(&root)?;
    let mut container = factory.create(&args.container_id, config)?;
    if let Err(err) = container.run(new_process(&spec, args.detach)) {
        reclaim_after_error(&mut container);
        return Err(err)
            .with_context(|| format!("failed to run container {}", args.container_id));
    }

    if let Some(network) = &args.network {
        if let Err(err) = container.connect_network(network, args.port_mappings.clone()) {
            reclaim_after_error(&mut container);
            return Err(err)
                .with_context(|| format!("failed to connect container to network {network}"));
        }
    }

    if args.detach {
        return Ok(0);
    }

    // foreground: hold on until the init process is gone, then reclaim the
    // container like it was never there
    let exit_code = container.wait()?;
    container
        .destroy()
        .with_context(|| format!("failed to destroy container {}", args.container_id))?;
    Ok(exit_code)
}
