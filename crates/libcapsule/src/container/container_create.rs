//! Create and Run: the spawn path of the init process.
use super::{Container, ContainerStatus};
use crate::error::CapsuleError;
use crate::process::args::{InitConfig, InitializerType, ProcessSpec};
use crate::process::parent::{InitParentProcess, ParentProcess};
use crate::Result;

impl Container {
    /// Spawns the init process and leaves it gated before exec. The
    /// container ends up Created with its state persisted.
    pub fn create(&mut self, process: ProcessSpec) -> Result<()> {
        self.refresh_status()?;
        if self.status() != ContainerStatus::Stopped {
            return Err(CapsuleError::InvalidStateTransition {
                from: self.status(),
                to: ContainerStatus::Created,
            });
        }
        self.spawn_init(process)?;
        self.set_status(ContainerStatus::Created);
        self.save()?;
        Ok(())
    }

    /// Create plus immediate start: the init process execs the user program
    /// as soon as it reaches the gate.
    pub fn run(&mut self, process: ProcessSpec) -> Result<()> {
        self.refresh_status()?;
        if self.status() != ContainerStatus::Stopped {
            return Err(CapsuleError::InvalidStateTransition {
                from: self.status(),
                to: ContainerStatus::Running,
            });
        }
        self.spawn_init(process)?;
        self.set_status(ContainerStatus::Created);
        self.save()?;

        if let Err(err) = self.send_start_signal() {
            self.cleanup_after_failed_spawn();
            return Err(err);
        }
        self.set_status(ContainerStatus::Running);
        self.save()?;
        Ok(())
    }

    // Clones the init process, waits until it reports ready, and captures
    // it in the container's cgroups while it is still gated. Any failure
    // after the clone kills the child and rolls the artifacts back; the
    // original error is returned.
    fn spawn_init(&mut self, mut process: ProcessSpec) -> Result<()> {
        process.init = true;
        let init_config = InitConfig {
            container_config: self.state.config.clone(),
            process,
            initializer: InitializerType::Standard,
            container_root: self.root.clone(),
            init_pid: None,
        };

        let mut parent = InitParentProcess::new(self.root.clone(), init_config);
        parent
            .start()
            .map_err(|err| CapsuleError::Other(err.to_string()))?;

        let pid = parent
            .pid()
            .expect("init parent has a pid after a successful start");
        let start_time = parent
            .start_time()
            .map_err(|err| CapsuleError::Other(err.to_string()))?;
        self.state.init_pid = Some(pid.as_raw());
        self.state.init_start_time = Some(start_time);
        self.parent = Some(Box::new(parent));

        if let Err(err) = self.capture_in_cgroups(pid) {
            tracing::error!(%err, "failed to apply cgroups, rolling back");
            self.cleanup_after_failed_spawn();
            return Err(err);
        }
        Ok(())
    }

    fn capture_in_cgroups(&mut self, pid: nix::unistd::Pid) -> Result<()> {
        self.cgroup_manager.apply(pid)?;
        self.cgroup_manager.set(&self.state.config.resources)?;
        self.state.cgroup_paths = self.cgroup_manager.get_paths().clone();
        Ok(())
    }
}
