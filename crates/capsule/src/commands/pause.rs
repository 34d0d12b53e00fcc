//! Freeze all processes of a container.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use super::load_container;

/// Pause a running container
#[derive(Parser, Debug)]
pub struct Pause {
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}

pub fn pause(args: Pause, root: PathBuf) -> Result<()> {
    let mut container = load_container(&root, &args.container_id)?;
    container
        .pause()
        .with_context(|| format!("failed to pause container {}", args.container_id))
}
