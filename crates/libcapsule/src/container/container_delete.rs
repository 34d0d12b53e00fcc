//! Destroy: releases everything a stopped container still holds.
use std::fs;

use super::{Container, ContainerStatus};
use crate::error::CapsuleError;
use crate::Result;

impl Container {
    /// Removes the cgroups, the network endpoints, and the container
    /// directory with its state file. Refused while the init process is
    /// alive; a second destroy on an already reclaimed container is a
    /// no-op.
    pub fn destroy(&mut self) -> Result<()> {
        self.refresh_status()?;
        if !self.status().can_destroy() {
            tracing::error!(id = self.id(), status = %self.status(), "cannot destroy a live container");
            return Err(CapsuleError::ContainerNotStopped);
        }

        if !self.root.exists() {
            tracing::debug!(id = self.id(), "nothing left to destroy");
            return Ok(());
        }

        // cleanup failures on the way out are logged at warn and do not
        // mask each other; only failing to drop the state dir is fatal,
        // because a half-present directory would poison the next create
        self.release_endpoints();

        if let Err(err) = self.cgroup_manager.destroy() {
            tracing::warn!(id = self.id(), %err, "failed to remove cgroup");
        }

        tracing::debug!(id = self.id(), root = ?self.root, "removing container directory");
        fs::remove_dir_all(&self.root)?;

        self.state.init_pid = None;
        self.state.init_start_time = None;
        self.set_status(ContainerStatus::Stopped);
        Ok(())
    }
}
