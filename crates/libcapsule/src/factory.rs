//! The factory owns the runtime root directory and hands out container
//! handles, either freshly created or rehydrated from persisted state. It
//! also hosts the entry point the re-exec'd binary lands in on the child
//! side.
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::panic;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::ContainerConfig;
use crate::container::{Container, State};
use crate::error::CapsuleError;
use crate::process::args::{
    InitConfig, InitializerType, ENV_CONFIG_PIPE, ENV_EXEC_PIPE, ENV_INITIALIZER_TYPE,
};
use crate::process::channel::{ReadySender, Receiver};
use crate::process::initializer::{self, new_initializer};
use crate::utils;
use crate::Result;

pub const DEFAULT_RUNTIME_ROOT: &str = "/run/capsule";

pub struct CapsuleFactory {
    runtime_root: PathBuf,
}

impl CapsuleFactory {
    /// Opens (and creates if needed) the runtime root.
    pub fn new<P: Into<PathBuf>>(runtime_root: P) -> Result<Self> {
        let runtime_root = runtime_root.into();
        utils::create_dir_all_with_mode(&runtime_root, 0o700)?;
        Ok(Self { runtime_root })
    }

    pub fn runtime_root(&self) -> &Path {
        &self.runtime_root
    }

    /// Creates a container handle in Stopped state. The container directory
    /// is claimed with an exclusive mkdir, which is what serializes
    /// concurrent creates of the same id.
    pub fn create(&self, id: &str, config: ContainerConfig) -> Result<Container> {
        if id.is_empty() {
            return Err(CapsuleError::EmptyContainerId);
        }
        let container_root = self.runtime_root.join(id);
        let mut builder = fs::DirBuilder::new();
        builder.mode(0o711);
        match builder.create(&container_root) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::error!(id, ?container_root, "container already exists");
                return Err(CapsuleError::ContainerIdExists);
            }
            Err(err) => return Err(err.into()),
        }
        tracing::debug!(id, ?container_root, "created container directory");
        let container = Container::new(id, config, container_root);
        container.save()?;
        Ok(container)
    }

    /// Loads a container created by this or an earlier runtime invocation
    /// and probes its actual status.
    pub fn load(&self, id: &str) -> Result<Container> {
        if id.is_empty() {
            return Err(CapsuleError::EmptyContainerId);
        }
        let container_root = self.runtime_root.join(id);
        if !State::file_path(&container_root).exists() {
            return Err(CapsuleError::ContainerNotExists);
        }
        Container::load(container_root)
    }

    /// Whether a container directory with this id is claimed.
    pub fn exists(&self, id: &str) -> bool {
        self.runtime_root.join(id).exists()
    }

    /// All containers with a persisted state under this runtime root.
    pub fn list(&self) -> Result<Vec<Container>> {
        let mut containers = Vec::new();
        for entry in fs::read_dir(&self.runtime_root)? {
            let path = entry?.path();
            if !State::file_path(&path).exists() {
                continue;
            }
            match Container::load(path.clone()) {
                Ok(container) => containers.push(container),
                Err(err) => tracing::warn!(?path, %err, "skipping unreadable container"),
            }
        }
        containers.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(containers)
    }
}

/// Entry point of the re-exec'd child. Recovers the pipes from the
/// environment, decodes the InitConfig, and hands off to the initializer.
/// Returns only on failure; the caller exits non-zero with the error
/// logged. Never touches the factory's own directories.
pub fn start_initialization() -> Result<()> {
    // a fault between clone and exec would otherwise die without a trace;
    // the hook runs at the panic site, where the backtrace still means
    // something
    panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!(%info, %backtrace, "panic during container initialization");
    }));

    match panic::catch_unwind(run_initialization) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            Err(CapsuleError::Other(format!(
                "panic during initialization: {message}"
            )))
        }
    }
}

fn run_initialization() -> Result<()> {
    let initializer_type = std::env::var(ENV_INITIALIZER_TYPE)
        .map_err(|_| CapsuleError::Other(format!("{ENV_INITIALIZER_TYPE} is not set")))?;
    let initializer_type = InitializerType::from_str(&initializer_type).map_err(CapsuleError::Other)?;
    tracing::debug!(?initializer_type, "child initialization starting");

    let receiver = Receiver::<InitConfig>::from_env(ENV_CONFIG_PIPE)?;
    let init_config = receiver.recv()?;
    tracing::debug!(container_root = ?init_config.container_root, "init config received");

    initializer::populate_process_env(&init_config.process.env)?;

    let ready_sender = if init_config.process.init
        && initializer_type == InitializerType::Standard
    {
        Some(ReadySender::from_env(ENV_EXEC_PIPE)?)
    } else {
        None
    };

    new_initializer(initializer_type, init_config, ready_sender).init()?;
    // on success the exec replaced this process image
    Err(CapsuleError::Other(
        "initializer returned without exec".to_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let factory = CapsuleFactory::new(dir.path()).unwrap();
        let container = factory
            .create("c1", ContainerConfig::default())
            .unwrap();
        assert_eq!(container.id(), "c1");
        assert!(factory.exists("c1"));
    }

    #[test]
    fn test_create_rejects_empty_id() {
        let dir = tempfile::tempdir().unwrap();
        let factory = CapsuleFactory::new(dir.path()).unwrap();
        assert!(matches!(
            factory.create("", ContainerConfig::default()),
            Err(CapsuleError::EmptyContainerId)
        ));
    }

    #[test]
    fn test_double_create_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let factory = CapsuleFactory::new(dir.path()).unwrap();
        factory.create("c3", ContainerConfig::default()).unwrap();
        assert!(matches!(
            factory.create("c3", ContainerConfig::default()),
            Err(CapsuleError::ContainerIdExists)
        ));
    }

    #[test]
    fn test_load_missing_container() {
        let dir = tempfile::tempdir().unwrap();
        let factory = CapsuleFactory::new(dir.path()).unwrap();
        assert!(matches!(
            factory.load("ghost"),
            Err(CapsuleError::ContainerNotExists)
        ));
    }

    #[test]
    fn test_list_skips_dirs_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let factory = CapsuleFactory::new(dir.path()).unwrap();
        factory.create("real", ContainerConfig::default()).unwrap();
        // a foreign directory without a state file is not a container
        fs::create_dir(dir.path().join("debris")).unwrap();

        let listed = factory.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), "real");
    }
}
