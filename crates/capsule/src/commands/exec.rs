//! Run an additional process inside a running container.
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use libcapsule::process::args::ProcessSpec;

use super::load_container;

/// Execute a process inside a running container
#[derive(Parser, Debug)]
pub struct Exec {
    /// Current working directory inside the container
    #[arg(long, default_value = "/")]
    pub cwd: PathBuf,
    /// Environment variables as KEY=VAL (repeatable)
    #[arg(short, long)]
    pub env: Vec<String>,
    /// Do not wait for the process to exit
    #[arg(short, long)]
    pub detach: bool,
    #[arg(value_parser = clap::builder::NonEmptyStringValueParser::new(), required = true)]
    pub container_id: String,
    /// Command to execute
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}

pub fn exec(args: Exec, root: PathBuf) -> Result<i32> {
    let mut container = load_container(&root, &args.container_id)?;
    let process = ProcessSpec {
        args: args.command,
        env: args.env,
        cwd: args.cwd,
        detach: args.detach,
        ..Default::default()
    };
    Ok(container.exec(process)?)
}
