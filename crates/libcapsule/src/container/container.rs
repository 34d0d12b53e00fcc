//! The container handle. All verbs delegate through the status stored in
//! the persisted state; the status is swapped by value on every transition.
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::unistd::Pid;

use super::state::{not_exec_flag_path, ContainerStatus, State};
use crate::cgroups::{self, CgroupManager};
use crate::config::ContainerConfig;
use crate::error::CapsuleError;
use crate::network::{NetworkStore, PortMapping};
use crate::process::nochild::NoChildParentProcess;
use crate::process::parent::{process_alive, ParentProcess};
use crate::Result;

pub struct Container {
    pub(super) state: State,
    pub(super) root: PathBuf,
    pub(super) parent: Option<Box<dyn ParentProcess>>,
    pub(super) cgroup_manager: Box<dyn CgroupManager>,
}

impl Container {
    /// A fresh handle for a container that has never been started.
    pub fn new(container_id: &str, config: ContainerConfig, container_root: PathBuf) -> Self {
        Self {
            state: State::new(container_id, config),
            root: container_root,
            parent: None,
            cgroup_manager: cgroups::create_cgroup_manager(container_id, Default::default()),
        }
    }

    /// Rehydrates a handle from a persisted state file and probes the
    /// actual status of the init process.
    pub fn load(container_root: PathBuf) -> Result<Self> {
        let state = State::load(&container_root)?;
        let parent: Option<Box<dyn ParentProcess>> =
            match (state.init_pid, state.init_start_time) {
                (Some(pid), Some(start_time)) => {
                    Some(Box::new(NoChildParentProcess::new(pid, start_time)))
                }
                _ => None,
            };
        let cgroup_manager = cgroups::create_cgroup_manager(&state.id, state.cgroup_paths.clone());
        let mut container = Self {
            state,
            root: container_root,
            parent,
            cgroup_manager,
        };
        container.refresh_status()?;
        Ok(container)
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status(&self) -> ContainerStatus {
        self.state.status
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.state.config
    }

    pub fn pid(&self) -> Option<Pid> {
        self.state.init_pid.map(Pid::from_raw)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.state.created
    }

    pub(super) fn set_status(&mut self, status: ContainerStatus) -> &mut Self {
        if status == ContainerStatus::Created && self.state.created.is_none() {
            self.state.created = Some(Utc::now());
        }
        self.state.status = status;
        self
    }

    pub fn save(&self) -> Result<()> {
        tracing::debug!(id = self.id(), status = %self.status(), "saving container state");
        self.state.save(&self.root)?;
        Ok(())
    }

    /// Re-derives the status from the world: a dead or recycled
    /// `(pid, start_time)` means Stopped, a live pid with the sentinel file
    /// still present means Created, a live pid without it means the user
    /// program is running (or frozen, if that is what we recorded).
    pub fn refresh_status(&mut self) -> Result<()> {
        let detected = self.detect_status()?;
        if detected == ContainerStatus::Stopped && self.status() != ContainerStatus::Stopped {
            // stale pid; the state file keeps the config but drops liveness
            self.state.init_pid = None;
            self.state.init_start_time = None;
            self.set_status(ContainerStatus::Stopped);
            if State::file_path(&self.root).exists() {
                self.save()?;
            }
        } else {
            self.set_status(detected);
        }
        Ok(())
    }

    fn detect_status(&self) -> Result<ContainerStatus> {
        let (pid, start_time) = match (self.state.init_pid, self.state.init_start_time) {
            (Some(pid), Some(start_time)) => (pid, start_time),
            _ => return Ok(ContainerStatus::Stopped),
        };
        if !process_alive(pid, start_time)? {
            return Ok(ContainerStatus::Stopped);
        }
        if not_exec_flag_path(&self.root).exists() {
            return Ok(ContainerStatus::Created);
        }
        if self.state.status == ContainerStatus::Paused {
            return Ok(ContainerStatus::Paused);
        }
        Ok(ContainerStatus::Running)
    }

    /// Blocks until the init process exits. Works for both the owning and
    /// the reacquired driver; for the latter the exit code is not
    /// observable and 0 is reported.
    pub fn wait(&mut self) -> Result<i32> {
        let parent = match self.parent.as_mut() {
            Some(parent) => parent,
            None => return Err(CapsuleError::Other("container has no init process".into())),
        };
        let exit_code = parent
            .wait()
            .map_err(|err| CapsuleError::Other(err.to_string()))?;
        self.state.init_pid = None;
        self.state.init_start_time = None;
        self.set_status(ContainerStatus::Stopped);
        if State::file_path(&self.root).exists() {
            self.save()?;
        }
        Ok(exit_code)
    }

    /// Attaches the container to a named network. The endpoint is owned by
    /// the container and released again on destroy.
    pub fn connect_network(
        &mut self,
        network_name: &str,
        port_mappings: Vec<PortMapping>,
    ) -> Result<()> {
        let pid = self
            .pid()
            .ok_or_else(|| CapsuleError::Other("container has no init process".into()))?;
        let store = NetworkStore::new(self.runtime_root())?;
        let endpoint_id = format!("{}-{}", self.id(), network_name);
        let endpoint = store.connect(&endpoint_id, network_name, port_mappings, pid.as_raw())?;
        self.state.endpoints.push(endpoint);
        self.save()
    }

    pub(super) fn runtime_root(&self) -> &Path {
        self.root.parent().unwrap_or(Path::new("/"))
    }

    /// Releases the container's endpoints. Failures are logged; a stale
    /// iptables rule must not block resource reclamation.
    pub(super) fn release_endpoints(&mut self) {
        if self.state.endpoints.is_empty() {
            return;
        }
        match NetworkStore::new(self.runtime_root()) {
            Ok(store) => {
                for endpoint in self.state.endpoints.drain(..) {
                    if let Err(err) = store.disconnect(&endpoint) {
                        tracing::warn!(endpoint_id = %endpoint.id, %err, "failed to release endpoint");
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "failed to open network store during cleanup"),
        }
    }

    /// Best-effort rollback used when a spawn fails halfway: kill the
    /// child, drop cgroups, release endpoints. Rollback errors are logged,
    /// never returned; the primary error wins.
    pub(super) fn cleanup_after_failed_spawn(&mut self) {
        if let Some(parent) = self.parent.as_mut() {
            if let Err(err) = parent.terminate() {
                tracing::warn!(%err, "failed to terminate init process during rollback");
            }
        }
        self.release_endpoints();
        if let Err(err) = self.cgroup_manager.destroy() {
            tracing::warn!(%err, "failed to remove cgroup during rollback");
        }
        let _ = fs::remove_file(not_exec_flag_path(&self.root));
        self.state.init_pid = None;
        self.state.init_start_time = None;
        self.set_status(ContainerStatus::Stopped);
    }
}
