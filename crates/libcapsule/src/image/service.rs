//! The image store: tarballs extracted into shared read-only layers, with
//! the id to layer mapping persisted in repositories.json.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    Image, ImageError, LayerBuilder, CONTAINERS_DIR, IMAGE_DIR, LAYERS_DIR, REPOSITORIES_FILE,
};
use crate::config::BundleSpec;
use crate::utils;

type Result<T> = std::result::Result<T, ImageError>;

pub struct ImageService {
    image_root: PathBuf,
    // maps image id to read-only layer id; the guard covers the whole
    // read-modify-flush cycle of every operation
    repositories: Mutex<HashMap<String, String>>,
}

impl ImageService {
    pub fn new(runtime_root: &Path) -> Result<Self> {
        let image_root = runtime_root.join(IMAGE_DIR);
        utils::create_dir_all_with_mode(&image_root, 0o700)?;
        fs::create_dir_all(image_root.join(LAYERS_DIR))?;

        let repositories_path = image_root.join(REPOSITORIES_FILE);
        let repositories = if repositories_path.exists() {
            let content = fs::read(&repositories_path)?;
            serde_json::from_slice(&content).map_err(ImageError::RepositoriesParse)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            image_root,
            repositories: Mutex::new(repositories),
        })
    }

    pub fn layer_builder(&self) -> LayerBuilder {
        LayerBuilder::new(self.image_root.clone())
    }

    fn layer_path(&self, layer_id: &str) -> PathBuf {
        self.image_root.join(LAYERS_DIR).join(layer_id)
    }

    fn bundle_dir(&self, container_id: &str) -> PathBuf {
        self.image_root.join(CONTAINERS_DIR).join(container_id)
    }

    fn flush_repositories(&self, repositories: &HashMap<String, String>) -> Result<()> {
        let content =
            serde_json::to_vec(repositories).map_err(ImageError::RepositoriesEncode)?;
        utils::atomic_write(&self.image_root.join(REPOSITORIES_FILE), &content)
            .map_err(ImageError::RepositoriesDump)
    }

    /// Registers a new image by extracting `tar_path` into a fresh layer
    /// directory.
    pub fn create(&self, id: &str, tar_path: &Path) -> Result<()> {
        let mut repositories = self.repositories.lock().expect("repositories mutex poisoned");
        if repositories.contains_key(id) {
            return Err(ImageError::ImageIdExists(id.to_owned()));
        }

        let layer_id = Uuid::new_v4().to_string();
        let layer_dir = self.layer_path(&layer_id);
        utils::create_dir_all_with_mode(&layer_dir, 0o700)?;

        tracing::info!(id, ?tar_path, "extracting image tarball");
        let output = Command::new("tar")
            .arg("-xf")
            .arg(tar_path)
            .arg("-C")
            .arg(&layer_dir)
            .output()?;
        if !output.status.success() {
            let _ = fs::remove_dir_all(&layer_dir);
            return Err(ImageError::Extract(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }

        repositories.insert(id.to_owned(), layer_id);
        if let Err(err) = self.flush_repositories(&repositories) {
            repositories.remove(id);
            let _ = fs::remove_dir_all(&layer_dir);
            return Err(err);
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut repositories = self.repositories.lock().expect("repositories mutex poisoned");
        let layer_id = repositories
            .get(id)
            .cloned()
            .ok_or_else(|| ImageError::ImageIdNotExists(id.to_owned()))?;

        let layer_dir = self.layer_path(&layer_id);
        if layer_dir.exists() {
            fs::remove_dir_all(&layer_dir)?;
        }
        repositories.remove(id);
        self.flush_repositories(&repositories)
    }

    pub fn list(&self) -> Result<Vec<Image>> {
        let repositories = self.repositories.lock().expect("repositories mutex poisoned");
        let mut images = Vec::new();
        for (id, layer_id) in repositories.iter() {
            let metadata = fs::metadata(self.layer_path(layer_id))?;
            images.push(Image {
                id: id.clone(),
                layer_id: layer_id.clone(),
                created: DateTime::<Utc>::from(
                    metadata.modified().unwrap_or(std::time::UNIX_EPOCH),
                ),
                size: metadata.len(),
            });
        }
        images.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(images)
    }

    pub fn get(&self, id: &str) -> Result<Image> {
        let repositories = self.repositories.lock().expect("repositories mutex poisoned");
        let layer_id = repositories
            .get(id)
            .ok_or_else(|| ImageError::ImageIdNotExists(id.to_owned()))?;
        let metadata = fs::metadata(self.layer_path(layer_id))
            .map_err(|_| ImageError::ImageIdNotExists(id.to_owned()))?;
        Ok(Image {
            id: id.to_owned(),
            layer_id: layer_id.clone(),
            created: DateTime::<Utc>::from(metadata.modified().unwrap_or(std::time::UNIX_EPOCH)),
            size: metadata.len(),
        })
    }

    /// Builds the union rootfs of `container_id` on top of the image's
    /// read-only layer.
    pub fn prepare_container_rootfs(&self, container_id: &str, image_id: &str) -> Result<PathBuf> {
        let layer_id = {
            let repositories = self.repositories.lock().expect("repositories mutex poisoned");
            repositories
                .get(image_id)
                .cloned()
                .ok_or_else(|| ImageError::ImageIdNotExists(image_id.to_owned()))?
        };
        self.layer_builder().prepare_union_fs(container_id, &layer_id)
    }

    /// Writes the derived bundle spec for an image-backed container into
    /// its bundle directory and returns that directory.
    pub fn write_bundle_spec(&self, container_id: &str, spec: &BundleSpec) -> Result<PathBuf> {
        let bundle = self.bundle_dir(container_id);
        fs::create_dir_all(&bundle)?;
        spec.save(&bundle)?;
        Ok(bundle)
    }

    /// Reclaims everything an image-backed container held: the union
    /// layers, the mount records, and the bundle directory.
    pub fn destroy_container(&self, container_id: &str) {
        self.layer_builder().destroy(container_id);
        let bundle = self.bundle_dir(container_id);
        if let Err(err) = fs::remove_dir_all(&bundle) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(?bundle, %err, "failed to remove bundle directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> (tempfile::TempDir, ImageService) {
        let dir = tempfile::tempdir().unwrap();
        let service = ImageService::new(dir.path()).unwrap();
        (dir, service)
    }

    #[test]
    fn test_delete_missing_image() {
        let (_dir, service) = service();
        assert!(matches!(
            service.delete("ghost"),
            Err(ImageError::ImageIdNotExists(_))
        ));
    }

    #[test]
    fn test_get_missing_image() {
        let (_dir, service) = service();
        assert!(matches!(
            service.get("ghost"),
            Err(ImageError::ImageIdNotExists(_))
        ));
    }

    #[test]
    fn test_repositories_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let service = ImageService::new(dir.path()).unwrap();
            let mut repositories = service.repositories.lock().unwrap();
            repositories.insert("img".to_owned(), "layer-1".to_owned());
            service.flush_repositories(&repositories).unwrap();
        }
        let reloaded = ImageService::new(dir.path()).unwrap();
        let repositories = reloaded.repositories.lock().unwrap();
        assert_eq!(repositories.get("img").map(String::as_str), Some("layer-1"));
    }

    #[test]
    fn test_prepare_rootfs_for_missing_image() {
        let (_dir, service) = service();
        assert!(matches!(
            service.prepare_container_rootfs("c1", "ghost"),
            Err(ImageError::ImageIdNotExists(_))
        ));
    }

    #[test]
    fn test_bundle_spec_round_trip() {
        let (_dir, service) = service();
        let spec = BundleSpec::default();
        let bundle = service.write_bundle_spec("c1", &spec).unwrap();
        assert!(bundle.join("config.json").exists());
        service.destroy_container("c1");
        assert!(!bundle.exists());
    }
}
