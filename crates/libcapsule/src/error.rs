use crate::container::ContainerStatus;

/// Top level error type of the library. Every module rolls its own error up
/// into this one, so callers at the binary boundary only ever match on a
/// single enum.
#[derive(Debug, thiserror::Error)]
pub enum CapsuleError {
    #[error("container with given id already exists")]
    ContainerIdExists,
    #[error("container does not exist")]
    ContainerNotExists,
    #[error("container is not stopped")]
    ContainerNotStopped,
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        from: ContainerStatus,
        to: ContainerStatus,
    },
    #[error("container id cannot be empty")]
    EmptyContainerId,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unix error: {0}")]
    Unix(#[from] nix::errno::Errno),
    #[error("failed to get proc state")]
    Procfs(#[from] procfs::ProcError),
    #[error(transparent)]
    State(#[from] crate::container::StateError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Channel(#[from] crate::process::channel::ChannelError),
    #[error(transparent)]
    Cgroup(#[from] crate::cgroups::CgroupError),
    #[error(transparent)]
    Image(#[from] crate::image::ImageError),
    #[error(transparent)]
    Network(#[from] crate::network::NetworkError),
    #[error(transparent)]
    Init(#[from] crate::process::initializer::InitError),
    #[error("system error: {0}")]
    Other(String),
}
