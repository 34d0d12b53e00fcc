//! The immutable per container configuration. It is derived once from the
//! bundle spec when the container is created and travels with the container
//! from then on, both in the persisted state file and across the init pipe.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use caps::Capability;
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load bundle spec from {path:?}")]
    LoadIo {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to parse bundle spec from {path:?}")]
    LoadParse {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("failed to save bundle spec to {path:?}")]
    SaveIo {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to encode bundle spec")]
    SaveEncode(#[source] serde_json::Error),
    #[error("invalid rootfs path {path:?}")]
    InvalidRootfs {
        source: std::io::Error,
        path: PathBuf,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Namespace kinds the runtime knows how to create or enter.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    Pid,
    Net,
    Ipc,
    Uts,
    Mount,
    User,
    Cgroup,
}

impl NamespaceType {
    pub fn clone_flag(&self) -> CloneFlags {
        match self {
            NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceType::Net => CloneFlags::CLONE_NEWNET,
            NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceType::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceType::User => CloneFlags::CLONE_NEWUSER,
            NamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    /// Name of the namespace link under `/proc/{pid}/ns/`.
    pub fn proc_ns_name(&self) -> &'static str {
        match self {
            NamespaceType::Pid => "pid",
            NamespaceType::Net => "net",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Uts => "uts",
            NamespaceType::Mount => "mnt",
            NamespaceType::User => "user",
            NamespaceType::Cgroup => "cgroup",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespaces(Vec<NamespaceType>);

impl Namespaces {
    pub fn new(types: Vec<NamespaceType>) -> Self {
        Self(types)
    }

    /// The combined clone flags for spawning the init process.
    pub fn clone_flags(&self) -> CloneFlags {
        self.0
            .iter()
            .fold(CloneFlags::empty(), |acc, ns| acc | ns.clone_flag())
    }

    pub fn contains(&self, typ: NamespaceType) -> bool {
        self.0.contains(&typ)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NamespaceType> {
        self.0.iter()
    }
}

/// A single mount to apply inside the container, in spec order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: Option<PathBuf>,
    pub destination: PathBuf,
    #[serde(rename = "type")]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RlimitType {
    RlimitCpu,
    RlimitFsize,
    RlimitData,
    RlimitStack,
    RlimitCore,
    RlimitRss,
    RlimitNproc,
    RlimitNofile,
    RlimitMemlock,
    RlimitAs,
    RlimitLocks,
    RlimitSigpending,
    RlimitMsgqueue,
    RlimitNice,
    RlimitRtprio,
    RlimitRttime,
}

impl RlimitType {
    pub fn resource(&self) -> nix::sys::resource::Resource {
        use nix::sys::resource::Resource;
        match self {
            RlimitType::RlimitCpu => Resource::RLIMIT_CPU,
            RlimitType::RlimitFsize => Resource::RLIMIT_FSIZE,
            RlimitType::RlimitData => Resource::RLIMIT_DATA,
            RlimitType::RlimitStack => Resource::RLIMIT_STACK,
            RlimitType::RlimitCore => Resource::RLIMIT_CORE,
            RlimitType::RlimitRss => Resource::RLIMIT_RSS,
            RlimitType::RlimitNproc => Resource::RLIMIT_NPROC,
            RlimitType::RlimitNofile => Resource::RLIMIT_NOFILE,
            RlimitType::RlimitMemlock => Resource::RLIMIT_MEMLOCK,
            RlimitType::RlimitAs => Resource::RLIMIT_AS,
            RlimitType::RlimitLocks => Resource::RLIMIT_LOCKS,
            RlimitType::RlimitSigpending => Resource::RLIMIT_SIGPENDING,
            RlimitType::RlimitMsgqueue => Resource::RLIMIT_MSGQUEUE,
            RlimitType::RlimitNice => Resource::RLIMIT_NICE,
            RlimitType::RlimitRtprio => Resource::RLIMIT_RTPRIO,
            RlimitType::RlimitRttime => Resource::RLIMIT_RTTIME,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rlimit {
    #[serde(rename = "type")]
    pub typ: RlimitType,
    pub soft: u64,
    pub hard: u64,
}

/// The five capability sets applied to the container process.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySets {
    #[serde(default)]
    pub bounding: Vec<Capability>,
    #[serde(default)]
    pub effective: Vec<Capability>,
    #[serde(default)]
    pub inheritable: Vec<Capability>,
    #[serde(default)]
    pub permitted: Vec<Capability>,
    #[serde(default)]
    pub ambient: Vec<Capability>,
}

/// Resource limits handed to the cgroup manager.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
}

/// Everything the runtime needs to know about a container, fixed at create
/// time.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub namespaces: Namespaces,
    pub rootfs: PathBuf,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub capabilities: CapabilitySets,
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    #[serde(default)]
    pub resources: CgroupResources,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ContainerConfig {
    /// Derives the runtime configuration from a bundle spec. The rootfs path
    /// is resolved against the bundle directory and canonicalized so that the
    /// child can pivot into it without caring where the caller ran from.
    pub fn from_spec(spec: &BundleSpec, bundle: &Path) -> Result<Self> {
        let rootfs = if spec.root.path.is_absolute() {
            spec.root.path.clone()
        } else {
            bundle.join(&spec.root.path)
        };
        let rootfs = fs::canonicalize(&rootfs).map_err(|err| ConfigError::InvalidRootfs {
            source: err,
            path: rootfs,
        })?;

        Ok(ContainerConfig {
            namespaces: spec.linux.namespaces.clone(),
            rootfs,
            mounts: spec.mounts.clone(),
            hostname: spec.hostname.clone(),
            capabilities: spec.linux.capabilities.clone(),
            rlimits: spec.linux.rlimits.clone(),
            resources: spec.linux.resources.clone(),
            annotations: spec.annotations.clone(),
        })
    }
}

/// The root filesystem section of a bundle spec.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Root {
    pub path: PathBuf,
}

/// The process section of a bundle spec.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SpecProcess {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    #[serde(default)]
    pub no_new_privileges: bool,
}

fn default_cwd() -> PathBuf {
    PathBuf::from("/")
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SpecLinux {
    #[serde(default)]
    pub namespaces: Namespaces,
    #[serde(default)]
    pub capabilities: CapabilitySets,
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    #[serde(default)]
    pub resources: CgroupResources,
}

/// The `config.json` document found in a bundle directory. Parsing the full
/// OCI schema is a collaborator concern; this is the subset the runtime
/// consumes.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BundleSpec {
    #[serde(default)]
    pub hostname: Option<String>,
    pub root: Root,
    pub process: SpecProcess,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub linux: SpecLinux,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

pub const BUNDLE_SPEC_FILE: &str = "config.json";

impl BundleSpec {
    pub fn load(bundle: &Path) -> Result<Self> {
        let path = bundle.join(BUNDLE_SPEC_FILE);
        let content = fs::read(&path).map_err(|err| ConfigError::LoadIo {
            source: err,
            path: path.clone(),
        })?;
        serde_json::from_slice(&content)
            .map_err(|err| ConfigError::LoadParse { source: err, path })
    }

    pub fn save(&self, bundle: &Path) -> Result<()> {
        let path = bundle.join(BUNDLE_SPEC_FILE);
        let content = serde_json::to_vec(self).map_err(ConfigError::SaveEncode)?;
        crate::utils::atomic_write(&path, &content)
            .map_err(|err| ConfigError::SaveIo { source: err, path })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_clone_flags() {
        let namespaces = Namespaces::new(vec![
            NamespaceType::Pid,
            NamespaceType::Net,
            NamespaceType::Uts,
        ]);
        let flags = namespaces.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNS));
    }

    #[test]
    fn test_config_round_trip() {
        let config = ContainerConfig {
            namespaces: Namespaces::new(vec![NamespaceType::Pid, NamespaceType::Mount]),
            rootfs: PathBuf::from("/tmp/rootfs"),
            hostname: Some("capsule".into()),
            rlimits: vec![Rlimit {
                typ: RlimitType::RlimitNofile,
                soft: 1024,
                hard: 4096,
            }],
            ..Default::default()
        };
        let encoded = serde_json::to_vec(&config).unwrap();
        let decoded: ContainerConfig = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_spec_rootfs_resolved_against_bundle() {
        let bundle = tempfile::tempdir().unwrap();
        std::fs::create_dir(bundle.path().join("rootfs")).unwrap();
        let spec = BundleSpec {
            root: Root {
                path: PathBuf::from("rootfs"),
            },
            process: SpecProcess {
                args: vec!["/bin/true".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let config = ContainerConfig::from_spec(&spec, bundle.path()).unwrap();
        assert!(config.rootfs.is_absolute());
        assert!(config.rootfs.ends_with("rootfs"));
    }
}
