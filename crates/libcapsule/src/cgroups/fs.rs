//! Cgroup v1 manager backed by the split hierarchies under
//! /sys/fs/cgroup/{subsystem}.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use super::{CgroupError, CgroupManager, FreezerState, Result};
use crate::config::CgroupResources;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CGROUP_PROCS: &str = "cgroup.procs";

const SUBSYSTEMS: &[&str] = &["cpu", "memory", "pids", "freezer"];

pub struct V1Manager {
    container_id: String,
    paths: HashMap<String, String>,
}

impl V1Manager {
    pub fn new(container_id: &str, mut paths: HashMap<String, String>) -> Self {
        for subsystem in SUBSYSTEMS {
            paths.entry((*subsystem).to_owned()).or_insert_with(|| {
                format!("{CGROUP_ROOT}/{subsystem}/capsule/{container_id}")
            });
        }
        Self {
            container_id: container_id.to_owned(),
            paths,
        }
    }

    fn subsystem_path(&self, subsystem: &str) -> PathBuf {
        self.paths
            .get(subsystem)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                PathBuf::from(format!(
                    "{CGROUP_ROOT}/{subsystem}/capsule/{}",
                    self.container_id
                ))
            })
    }

    fn write_file(path: &Path, content: &str) -> Result<()> {
        fs::write(path, content).map_err(|err| CgroupError::WriteFile {
            path: path.to_owned(),
            source: err,
        })
    }

    fn ensure(&self, subsystem: &str) -> Result<PathBuf> {
        let path = self.subsystem_path(subsystem);
        fs::create_dir_all(&path).map_err(|err| CgroupError::Create {
            path: path.clone(),
            source: err,
        })?;
        Ok(path)
    }
}

impl CgroupManager for V1Manager {
    fn apply(&self, pid: Pid) -> Result<()> {
        for subsystem in SUBSYSTEMS {
            let path = self.ensure(subsystem)?;
            tracing::debug!(?path, %pid, "adding pid to cgroup");
            Self::write_file(&path.join(CGROUP_PROCS), &pid.to_string())?;
        }
        Ok(())
    }

    fn set(&self, resources: &CgroupResources) -> Result<()> {
        if let Some(cpu_shares) = resources.cpu_shares {
            let path = self.ensure("cpu")?;
            Self::write_file(&path.join("cpu.shares"), &cpu_shares.to_string())?;
        }
        if let Some(memory_limit) = resources.memory_limit {
            let path = self.ensure("memory")?;
            Self::write_file(
                &path.join("memory.limit_in_bytes"),
                &memory_limit.to_string(),
            )?;
        }
        if let Some(pids_limit) = resources.pids_limit {
            let path = self.ensure("pids")?;
            Self::write_file(&path.join("pids.max"), &pids_limit.to_string())?;
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        for subsystem in SUBSYSTEMS {
            let path = self.subsystem_path(subsystem);
            if !path.exists() {
                continue;
            }
            // rmdir only; a v1 cgroup dir cannot be removed recursively and
            // its virtual files disappear with it
            fs::remove_dir(&path).map_err(|err| CgroupError::Remove {
                path: path.clone(),
                source: err,
            })?;
        }
        Ok(())
    }

    fn get_paths(&self) -> &HashMap<String, String> {
        &self.paths
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        let path = self.ensure("freezer")?;
        let value = match state {
            FreezerState::Frozen => "FROZEN",
            FreezerState::Thawed => "THAWED",
        };
        Self::write_file(&path.join("freezer.state"), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths_cover_all_subsystems() {
        let manager = V1Manager::new("c1", HashMap::new());
        let paths = manager.get_paths();
        for subsystem in SUBSYSTEMS {
            let path = paths.get(*subsystem).unwrap();
            assert!(path.contains("capsule/c1"), "unexpected path {path}");
            assert!(path.starts_with(CGROUP_ROOT));
        }
    }

    #[test]
    fn test_persisted_paths_win_over_defaults() {
        let mut persisted = HashMap::new();
        persisted.insert(
            "memory".to_owned(),
            "/sys/fs/cgroup/memory/custom/c1".to_owned(),
        );
        let manager = V1Manager::new("c1", persisted);
        assert_eq!(
            manager.subsystem_path("memory"),
            PathBuf::from("/sys/fs/cgroup/memory/custom/c1")
        );
        // untouched subsystems still get the default layout
        assert_eq!(
            manager.subsystem_path("cpu"),
            PathBuf::from("/sys/fs/cgroup/cpu/capsule/c1")
        );
    }
}
