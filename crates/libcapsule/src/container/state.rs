//! Status of the container and the state document persisted for it.
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ContainerConfig;
use crate::network::Endpoint;
use crate::utils;

/// Runtime status of a container. Exactly one status is current at a time;
/// it is stored by value in the container and swapped wholesale on each
/// transition.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ContainerStatus {
    // No init process, or the previous one is gone
    #[default]
    Stopped,
    // The init process is alive but still gated on the exec pipe
    Created,
    // The user program has been exec'd and has not exited
    Running,
    // The init process is frozen through the cgroup freezer
    Paused,
}

impl ContainerStatus {
    pub fn can_start(&self) -> bool {
        matches!(self, ContainerStatus::Created)
    }

    pub fn can_kill(&self) -> bool {
        matches!(self, ContainerStatus::Created | ContainerStatus::Running | ContainerStatus::Paused)
    }

    pub fn can_destroy(&self) -> bool {
        matches!(self, ContainerStatus::Stopped)
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, ContainerStatus::Paused)
    }

    pub fn can_exec(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }

    /// Whether the state diagram permits moving from `self` to `to`.
    /// Identity transitions are always permitted.
    pub fn can_transition_to(&self, to: ContainerStatus) -> bool {
        use ContainerStatus::*;
        if *self == to {
            return true;
        }
        matches!(
            (*self, to),
            (Stopped, Created)
                | (Stopped, Running)
                | (Created, Running)
                | (Created, Stopped)
                | (Running, Stopped)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Stopped)
        )
    }
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Stopped => "Stopped",
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Paused => "Paused",
        };
        write!(f, "{print}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to open container state file {state_file_path:?}")]
    OpenStateFile {
        state_file_path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse container state file {state_file_path:?}")]
    ParseStateFile {
        state_file_path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write container state file {state_file_path:?}")]
    WriteStateFile {
        state_file_path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode container state")]
    EncodeState(#[source] serde_json::Error),
}

type Result<T> = std::result::Result<T, StateError>;

/// The document persisted at `{runtime_root}/{id}/state.json`. The pair
/// `(init_pid, init_start_time)` identifies the init process across pid
/// reuse: a recycled pid will not report the same start time.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub id: String,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_start_time: Option<u64>,
    pub config: ContainerConfig,
    #[serde(default)]
    pub cgroup_paths: HashMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl State {
    const STATE_FILE: &'static str = "state.json";

    pub fn new(container_id: &str, config: ContainerConfig) -> Self {
        Self {
            id: container_id.to_owned(),
            status: ContainerStatus::Stopped,
            created: None,
            init_pid: None,
            init_start_time: None,
            config,
            cgroup_paths: HashMap::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn save(&self, container_root: &Path) -> Result<()> {
        let state_file_path = Self::file_path(container_root);
        let content = serde_json::to_vec(self).map_err(StateError::EncodeState)?;
        utils::atomic_write(&state_file_path, &content).map_err(|err| {
            tracing::error!(?state_file_path, %err, "failed to write container state file");
            StateError::WriteStateFile {
                state_file_path,
                source: err,
            }
        })?;
        Ok(())
    }

    pub fn load(container_root: &Path) -> Result<Self> {
        let state_file_path = Self::file_path(container_root);
        let content = fs::read(&state_file_path).map_err(|err| StateError::OpenStateFile {
            state_file_path: state_file_path.clone(),
            source: err,
        })?;
        let state: Self =
            serde_json::from_slice(&content).map_err(|err| StateError::ParseStateFile {
                state_file_path,
                source: err,
            })?;
        Ok(state)
    }

    pub fn file_path(container_root: &Path) -> PathBuf {
        container_root.join(Self::STATE_FILE)
    }
}

/// Present in the container directory exactly while the init process is
/// blocked on the exec pipe, which is how `Created` is told apart from
/// `Running` when a fresh runtime invocation probes a live pid.
pub const NOT_EXEC_FLAG: &str = "not_exec.flag";

pub fn not_exec_flag_path(container_root: &Path) -> PathBuf {
    container_root.join(NOT_EXEC_FLAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_transitions() {
        let status = ContainerStatus::Stopped;
        assert!(status.can_transition_to(ContainerStatus::Created));
        assert!(status.can_transition_to(ContainerStatus::Running));
        assert!(!status.can_transition_to(ContainerStatus::Paused));
        assert!(status.can_destroy());
        assert!(!status.can_kill());
        assert!(!status.can_start());
    }

    #[test]
    fn test_created_transitions() {
        let status = ContainerStatus::Created;
        assert!(status.can_transition_to(ContainerStatus::Running));
        assert!(status.can_transition_to(ContainerStatus::Stopped));
        assert!(!status.can_transition_to(ContainerStatus::Paused));
        assert!(status.can_start());
        assert!(status.can_kill());
        assert!(!status.can_destroy());
    }

    #[test]
    fn test_running_transitions() {
        let status = ContainerStatus::Running;
        assert!(status.can_transition_to(ContainerStatus::Stopped));
        assert!(status.can_transition_to(ContainerStatus::Paused));
        assert!(!status.can_transition_to(ContainerStatus::Created));
        assert!(status.can_pause());
        assert!(status.can_exec());
        assert!(!status.can_destroy());
    }

    #[test]
    fn test_paused_transitions() {
        let status = ContainerStatus::Paused;
        assert!(status.can_transition_to(ContainerStatus::Running));
        assert!(status.can_transition_to(ContainerStatus::Stopped));
        assert!(!status.can_transition_to(ContainerStatus::Created));
        assert!(status.can_resume());
        assert!(!status.can_pause());
    }

    #[test]
    fn test_identity_transition_allowed() {
        for status in [
            ContainerStatus::Stopped,
            ContainerStatus::Created,
            ContainerStatus::Running,
            ContainerStatus::Paused,
        ] {
            assert!(status.can_transition_to(status));
        }
    }

    #[test]
    fn test_state_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = State::new("c1", ContainerConfig::default());
        state.status = ContainerStatus::Created;
        state.init_pid = Some(42);
        state.init_start_time = Some(12345);
        state.save(dir.path()).unwrap();

        let loaded = State::load(dir.path()).unwrap();
        assert_eq!(loaded.id, "c1");
        assert_eq!(loaded.status, ContainerStatus::Created);
        assert_eq!(loaded.init_pid, Some(42));
        assert_eq!(loaded.init_start_time, Some(12345));
    }

    #[test]
    fn test_state_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(State::load(dir.path()).is_err());
    }
}
