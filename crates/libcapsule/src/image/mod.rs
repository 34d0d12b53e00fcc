//! Image storage and the layered rootfs builder.
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod layers;
mod service;

pub use layers::LayerBuilder;
pub use service::ImageService;

pub const IMAGE_DIR: &str = "images";
pub const LAYERS_DIR: &str = "layers";
pub const MOUNTS_DIR: &str = "mounts";
pub const CONTAINERS_DIR: &str = "containers";
pub const REPOSITORIES_FILE: &str = "repositories.json";

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("image with id {0} already exists")]
    ImageIdExists(String),
    #[error("image {0} does not exist")]
    ImageIdNotExists(String),
    #[error("failed to prepare union filesystem: {0}")]
    UnionFs(String),
    #[error("failed to mount union filesystem onto {path:?}")]
    UnionFsMount {
        path: PathBuf,
        source: nix::Error,
    },
    #[error("failed to persist image repositories")]
    RepositoriesDump(#[source] std::io::Error),
    #[error("failed to encode image repositories")]
    RepositoriesEncode(#[source] serde_json::Error),
    #[error("failed to parse image repositories")]
    RepositoriesParse(#[source] serde_json::Error),
    #[error("failed to save bundle spec")]
    SpecSave(#[from] crate::config::ConfigError),
    #[error("failed to extract image tarball: {0}")]
    Extract(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which of the three layers a mount record refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LayerKind {
    ReadOnly,
    ReadWrite,
    Init,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::ReadOnly => "read_only",
            LayerKind::ReadWrite => "read_write",
            LayerKind::Init => "init",
        }
    }
}

/// A stored image: one shared read-only layer keyed by the image id.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Image {
    pub id: String,
    pub layer_id: String,
    pub created: DateTime<Utc>,
    pub size: u64,
}
