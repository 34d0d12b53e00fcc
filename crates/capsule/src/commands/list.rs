//! List all containers under the runtime root.
use std::fmt::Write as _;
use std::io;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Local};
use clap::Parser;
use tabwriter::TabWriter;

use super::load_factory;

/// List containers
#[derive(Parser, Debug)]
pub struct List {}

pub fn list(_: List, root: PathBuf) -> Result<()> {
    let factory = load_factory(&root)?;

    let mut content = String::new();
    for container in factory.list()? {
        let pid = container
            .pid()
            .map(|pid| pid.to_string())
            .unwrap_or_default();
        let created = container
            .created()
            .map(|utc| {
                DateTime::<Local>::from(utc).to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
            })
            .unwrap_or_default();
        let _ = writeln!(
            content,
            "{}\t{}\t{}\t{}",
            container.id(),
            pid,
            container.status(),
            created,
        );
    }

    let mut tab_writer = TabWriter::new(io::stdout());
    writeln!(&mut tab_writer, "ID\tPID\tSTATUS\tCREATED")?;
    write!(&mut tab_writer, "{content}")?;
    tab_writer.flush()?;
    Ok(())
}
