//! Release the resources held by a container.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libcapsule::container::ContainerStatus;

use super::load_container;

/// Delete a stopped container
#[derive(Parser, Debug)]
pub struct Delete {
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
    /// Kill the container first if it is still running
    #[arg(short, long)]
    pub force: bool,
}

pub fn delete(args: Delete, root: PathBuf) -> Result<()> {
    let mut container = load_container(&root, &args.container_id)?;
    if args.force && container.status() != ContainerStatus::Stopped {
        container
            .signal(nix::sys::signal::Signal::SIGKILL)
            .context("failed to kill container before delete")?;
        container.wait().context("failed to await container exit")?;
    }
    container
        .destroy()
        .with_context(|| format!("failed to delete container {}", args.container_id))
}
