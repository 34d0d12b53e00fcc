//! Send a signal to a container's init process.
use std::convert::TryInto;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libcapsule::signal::Signal;

use super::load_container;

/// Send a signal to the container init process
#[derive(Parser, Debug)]
pub struct Kill {
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
    /// Signal name or number to send
    #[arg(default_value = "SIGTERM")]
    pub signal: String,
}

pub fn kill(args: Kill, root: PathBuf) -> Result<()> {
    let mut container = load_container(&root, &args.container_id)?;
    let signal: Signal = args
        .signal
        .as_str()
        .try_into()
        .with_context(|| format!("invalid signal {}", args.signal))?;
    container
        .signal(signal)
        .with_context(|| format!("failed to kill container {}", args.container_id))
}
