use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use libcapsule::container::Container;
use libcapsule::factory::CapsuleFactory;

pub mod create;
pub mod delete;
pub mod exec;
pub mod image;
pub mod kill;
pub mod list;
pub mod network;
pub mod pause;
pub mod resume;
pub mod run;
pub mod start;
pub mod state;

#[derive(Subcommand, Debug)]
pub enum SubCommand {
    Create(create::Create),
    Start(start::Start),
    Run(run::Run),
    Exec(exec::Exec),
    Kill(kill::Kill),
    Delete(delete::Delete),
    Pause(pause::Pause),
    Resume(resume::Resume),
    State(state::State),
    List(list::List),
    #[command(subcommand)]
    Network(network::Network),
    #[command(subcommand)]
    Image(image::Image),
}

pub(crate) fn load_factory(root: &Path) -> Result<CapsuleFactory> {
    CapsuleFactory::new(root).context("failed to open runtime root")
}

pub(crate) fn load_container(root: &Path, container_id: &str) -> Result<Container> {
    load_factory(root)?
        .load(container_id)
        .with_context(|| format!("failed to load container {container_id}"))
}

/// Best-effort teardown after a failure past the spawn point: kill the
/// init process, await it, destroy the container. Failures here are logged
/// and swallowed so the primary error stays visible.
pub(crate) fn reclaim_after_error(container: &mut Container) {
    if container.pid().is_some() {
        if let Err(err) = container.signal(nix::sys::signal::Signal::SIGKILL) {
            tracing::warn!(%err, "failed to kill container during rollback");
        }
        if let Err(err) = container.wait() {
            tracing::warn!(%err, "failed to await container exit during rollback");
        }
    }
    if let Err(err) = container.destroy() {
        tracing::warn!(%err, "failed to destroy container during rollback");
    }
}

/// Turns the process section of a bundle spec into the runtime's process
/// description.
pub(crate) fn new_process(
    spec: &libcapsule::config::BundleSpec,
    detach: bool,
) -> libcapsule::process::args::ProcessSpec {
    libcapsule::process::args::ProcessSpec {
        args: spec.process.args.clone(),
        env: spec.process.env.clone(),
        cwd: spec.process.cwd.clone(),
        console_size: None,
        additional_gids: Vec::new(),
        no_new_privileges: spec.process.no_new_privileges,
        init: true,
        detach,
    }
}
