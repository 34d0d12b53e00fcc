//! Resume a frozen container.
use super::{Container, ContainerStatus};
use crate::cgroups::FreezerState;
use crate::error::CapsuleError;
use crate::Result;

impl Container {
    pub fn resume(&mut self) -> Result<()> {
        self.refresh_status()?;
        if !self.status().can_resume() {
            return Err(CapsuleError::InvalidStateTransition {
                from: self.status(),
                to: ContainerStatus::Running,
            });
        }

        self.cgroup_manager.freeze(FreezerState::Thawed)?;
        self.set_status(ContainerStatus::Running);
        self.save()?;
        Ok(())
    }
}
