//! Start a previously created container.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use super::load_container;

/// Start a previously created container
#[derive(Parser, Debug)]
pub struct Start {
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}

pub fn start(args: Start, root: PathBuf) -> Result<()> {
    let mut container = load_container(&root, &args.container_id)?;
    container
        .start()
        .with_context(|| format!("failed to start container {}", args.container_id))
}
