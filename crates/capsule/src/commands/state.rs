//! Print the observed state of a container.
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde_json::json;

use super::load_container;

/// Show the state of a container
#[derive(Parser, Debug)]
pub struct State {
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
}

pub fn state(args: State, root: PathBuf) -> Result<()> {
    let container = load_container(&root, &args.container_id)?;
    let state = json!({
        "id": container.id(),
        "status": container.status().to_string(),
        "pid": container.pid().map(|pid| pid.as_raw()),
        "created": container.created(),
        "rootfs": container.config().rootfs,
    });
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
