//! Pause through the cgroup freezer.
use super::{Container, ContainerStatus};
use crate::cgroups::FreezerState;
use crate::error::CapsuleError;
use crate::Result;

impl Container {
    pub fn pause(&mut self) -> Result<()> {
        self.refresh_status()?;
        if !self.status().can_pause() {
            return Err(CapsuleError::InvalidStateTransition {
                from: self.status(),
                to: ContainerStatus::Paused,
            });
        }

        self.cgroup_manager.freeze(FreezerState::Frozen)?;
        self.set_status(ContainerStatus::Paused);
        self.save()?;
        Ok(())
    }
}
