//! Thaw a paused container.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use super::load_container;

/// Resume a paused container
#[derive(Parser, Debug)]
pub struct Resume {
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}

pub fn resume(args: Resume, root: PathBuf) -> Result<()> {
    let mut container = load_container(&root, &args.container_id)?;
    container
        .resume()
        .with_context(|| format!("failed to resume container {}", args.container_id))
}
