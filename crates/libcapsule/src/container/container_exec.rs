//! Exec: an additional process inside a running container's namespaces.
use super::{Container, ContainerStatus};
use crate::error::CapsuleError;
use crate::process::args::{InitConfig, InitializerType, ProcessSpec};
use crate::process::parent::{InitParentProcess, ParentProcess};
use crate::Result;

impl Container {
    /// Runs one more process in the container. Blocks for the exit code
    /// unless the process spec asks to detach.
    pub fn exec(&mut self, mut process: ProcessSpec) -> Result<i32> {
        self.refresh_status()?;
        if !self.status().can_exec() {
            return Err(CapsuleError::InvalidStateTransition {
                from: self.status(),
                to: ContainerStatus::Running,
            });
        }

        process.init = false;
        let detach = process.detach;
        let init_config = InitConfig {
            container_config: self.state.config.clone(),
            process,
            initializer: InitializerType::Exec,
            container_root: self.root.clone(),
            init_pid: self.state.init_pid,
        };

        let mut parent = InitParentProcess::new(self.root.clone(), init_config);
        parent
            .start()
            .map_err(|err| CapsuleError::Other(err.to_string()))?;

        if detach {
            return Ok(0);
        }
        parent
            .wait()
            .map_err(|err| CapsuleError::Other(err.to_string()))
    }
}
