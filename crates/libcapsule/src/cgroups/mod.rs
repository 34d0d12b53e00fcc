//! Resource control for container processes. The manager is an interface
//! on purpose: cgroup v1 and v2 hierarchies differ enough that callers
//! should not care which one is underneath.
use std::collections::HashMap;
use std::path::PathBuf;

use nix::unistd::Pid;

use crate::config::CgroupResources;

mod fs;

pub use fs::V1Manager;

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("failed to create cgroup {path:?}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write cgroup file {path:?}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove cgroup {path:?}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, CgroupError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FreezerState {
    Frozen,
    Thawed,
}

pub trait CgroupManager {
    /// Adds a pid to the container's cgroups, creating them if needed.
    fn apply(&self, pid: Pid) -> Result<()>;

    /// Writes the resource limits into the cgroup files.
    fn set(&self, resources: &CgroupResources) -> Result<()>;

    /// Removes the container's cgroups.
    fn destroy(&self) -> Result<()>;

    /// The subsystem to path map, as persisted in the state file.
    fn get_paths(&self) -> &HashMap<String, String>;

    /// Freezes or thaws every process in the cgroup.
    fn freeze(&self, state: FreezerState) -> Result<()>;
}

/// Builds the manager for a container. `paths` comes from a persisted state
/// on load and is empty for a fresh container.
pub fn create_cgroup_manager(
    container_id: &str,
    paths: HashMap<String, String>,
) -> Box<dyn CgroupManager> {
    Box::new(V1Manager::new(container_id, paths))
}
