use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::ContainerConfig;

/// Environment variable holding the config pipe read end fd in the child.
pub const ENV_CONFIG_PIPE: &str = "CAPSULE_CONFIG_PIPE";
/// Environment variable holding the exec (readiness) pipe write end fd.
pub const ENV_EXEC_PIPE: &str = "CAPSULE_EXEC_PIPE";
/// Environment variable selecting the initializer variant in the child.
pub const ENV_INITIALIZER_TYPE: &str = "CAPSULE_INITIALIZER_TYPE";

/// Fifo in the container directory the init process blocks on until `start`
/// releases it. Lives on the host filesystem so that a later runtime
/// invocation can open it.
pub const EXEC_FIFO: &str = "exec.fifo";

/// A process defaults to stdin/stdout/stderr; inherited pipes start after.
pub const DEFAULT_STD_FD_COUNT: i32 = 3;

/// Which initializer runs in the child.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InitializerType {
    Standard,
    Exec,
}

impl InitializerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitializerType::Standard => "standard",
            InitializerType::Exec => "exec",
        }
    }
}

impl std::str::FromStr for InitializerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(InitializerType::Standard),
            "exec" => Ok(InitializerType::Exec),
            other => Err(format!("unknown initializer type: {other}")),
        }
    }
}

/// A user program invocation. Only alive for the duration of a launch; never
/// persisted.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    /// `KEY=VAL` pairs.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_size: Option<(u16, u16)>,
    #[serde(default)]
    pub additional_gids: Vec<u32>,
    #[serde(default)]
    pub no_new_privileges: bool,
    /// True for the first process of a container, false for later execs.
    #[serde(default)]
    pub init: bool,
    #[serde(default)]
    pub detach: bool,
}

/// The payload serialized over the config pipe, parent to child. Canonical
/// encoding is a single JSON document read to EOF.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InitConfig {
    pub container_config: ContainerConfig,
    pub process: ProcessSpec,
    pub initializer: InitializerType,
    /// Host side container directory; the child keeps a directory fd to it
    /// across the pivot for the sentinel file and the exec fifo.
    pub container_root: PathBuf,
    /// Target init pid, set for exec-type processes entering existing
    /// namespaces.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_pid: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_config_round_trip() {
        let config = InitConfig {
            container_config: ContainerConfig::default(),
            process: ProcessSpec {
                args: vec!["/bin/true".into()],
                env: vec!["PATH=/usr/bin".into()],
                init: true,
                ..Default::default()
            },
            initializer: InitializerType::Standard,
            container_root: PathBuf::from("/run/capsule/c1"),
            init_pid: None,
        };
        let first = serde_json::to_vec(&config).unwrap();
        let decoded: InitConfig = serde_json::from_slice(&first).unwrap();
        let second = serde_json::to_vec(&decoded).unwrap();
        assert_eq!(decoded, config);
        // canonical encoding is stable byte for byte
        assert_eq!(first, second);
    }

    #[test]
    fn test_initializer_type_parse() {
        use std::str::FromStr;
        assert_eq!(
            InitializerType::from_str("standard").unwrap(),
            InitializerType::Standard
        );
        assert_eq!(
            InitializerType::from_str("exec").unwrap(),
            InitializerType::Exec
        );
        assert!(InitializerType::from_str("bogus").is_err());
    }
}
