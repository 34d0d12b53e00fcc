//! Assembles the three-layer rootfs of an image-backed container: the
//! image's shared read-only layer, a fresh read-write layer, and an init
//! layer that receives the union mount and becomes the rootfs.
use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use uuid::Uuid;

use super::{ImageError, LayerKind, LAYERS_DIR, MOUNTS_DIR};

type Result<T> = std::result::Result<T, ImageError>;

// overlayfs needs a scratch dir on the same filesystem as the upper layer,
// so the read-write layer dir carries both
const RW_DIFF: &str = "diff";
const RW_WORK: &str = "work";

pub struct LayerBuilder {
    image_root: PathBuf,
}

impl LayerBuilder {
    pub fn new(image_root: PathBuf) -> Self {
        Self { image_root }
    }

    pub fn layer_path(&self, layer_id: &str) -> PathBuf {
        self.image_root.join(LAYERS_DIR).join(layer_id)
    }

    fn mount_record_dir(&self, container_id: &str) -> PathBuf {
        self.image_root.join(MOUNTS_DIR).join(container_id)
    }

    fn record_layer(&self, container_id: &str, kind: LayerKind, layer_id: &str) -> Result<()> {
        let dir = self.mount_record_dir(container_id);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(kind.as_str()), layer_id)?;
        Ok(())
    }

    fn read_record(&self, container_id: &str, kind: LayerKind) -> Option<String> {
        fs::read_to_string(self.mount_record_dir(container_id).join(kind.as_str())).ok()
    }

    /// Builds the union mount for a container on top of the image's
    /// read-only layer and returns the init layer path, which is the
    /// container's rootfs. Everything created here is torn down again if a
    /// later step fails.
    pub fn prepare_union_fs(&self, container_id: &str, ro_layer_id: &str) -> Result<PathBuf> {
        let ro_path = self.layer_path(ro_layer_id);
        if !ro_path.exists() {
            return Err(ImageError::UnionFs(format!(
                "read only layer {ro_layer_id} has no data directory"
            )));
        }

        match self.build_layers(container_id, ro_layer_id, &ro_path) {
            Ok(init_path) => Ok(init_path),
            Err(err) => {
                tracing::warn!(container_id, %err, "union fs setup failed, rolling back");
                self.destroy(container_id);
                Err(err)
            }
        }
    }

    fn build_layers(
        &self,
        container_id: &str,
        ro_layer_id: &str,
        ro_path: &Path,
    ) -> Result<PathBuf> {
        self.record_layer(container_id, LayerKind::ReadOnly, ro_layer_id)?;

        let rw_layer_id = Uuid::new_v4().to_string();
        let rw_path = self.layer_path(&rw_layer_id);
        fs::create_dir_all(rw_path.join(RW_DIFF))?;
        fs::create_dir_all(rw_path.join(RW_WORK))?;
        self.record_layer(container_id, LayerKind::ReadWrite, &rw_layer_id)?;

        let init_layer_id = Uuid::new_v4().to_string();
        let init_path = self.layer_path(&init_layer_id);
        fs::create_dir_all(&init_path)?;
        self.record_layer(container_id, LayerKind::Init, &init_layer_id)?;

        let data = format!(
            "lowerdir={},upperdir={},workdir={}",
            ro_path.display(),
            rw_path.join(RW_DIFF).display(),
            rw_path.join(RW_WORK).display(),
        );
        tracing::debug!(container_id, %data, ?init_path, "mounting overlay");
        mount(
            Some("overlay"),
            &init_path,
            Some("overlay"),
            MsFlags::empty(),
            Some(data.as_str()),
        )
        .map_err(|err| ImageError::UnionFsMount {
            path: init_path.clone(),
            source: err,
        })?;

        Ok(init_path)
    }

    /// Unmounts and deletes everything the builder created for a
    /// container: the init and read-write layers and the mount records.
    /// The read-only layer is shared with other containers of the same
    /// image and stays. Failures are logged, not returned; teardown keeps
    /// going so one stuck mount cannot pin the rest.
    pub fn destroy(&self, container_id: &str) {
        if let Some(init_layer_id) = self.read_record(container_id, LayerKind::Init) {
            let init_path = self.layer_path(&init_layer_id);
            if let Err(err) = umount2(&init_path, MntFlags::MNT_DETACH) {
                if err != nix::errno::Errno::EINVAL && err != nix::errno::Errno::ENOENT {
                    tracing::warn!(?init_path, %err, "failed to unmount init layer");
                }
            }
            if let Err(err) = fs::remove_dir_all(&init_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(?init_path, %err, "failed to remove init layer");
                }
            }
        }

        if let Some(rw_layer_id) = self.read_record(container_id, LayerKind::ReadWrite) {
            let rw_path = self.layer_path(&rw_layer_id);
            if let Err(err) = fs::remove_dir_all(&rw_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(?rw_path, %err, "failed to remove read write layer");
                }
            }
        }

        let record_dir = self.mount_record_dir(container_id);
        if let Err(err) = fs::remove_dir_all(&record_dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(?record_dir, %err, "failed to remove mount records");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_read_only_layer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let builder = LayerBuilder::new(dir.path().to_owned());
        assert!(matches!(
            builder.prepare_union_fs("c1", "no-such-layer"),
            Err(ImageError::UnionFs(_))
        ));
    }

    #[test]
    fn test_records_written_and_destroyed() {
        let dir = tempfile::tempdir().unwrap();
        let builder = LayerBuilder::new(dir.path().to_owned());
        builder.record_layer("c1", LayerKind::ReadOnly, "ro-123").unwrap();
        builder.record_layer("c1", LayerKind::ReadWrite, "rw-456").unwrap();
        assert_eq!(
            builder.read_record("c1", LayerKind::ReadOnly).unwrap(),
            "ro-123"
        );

        builder.destroy("c1");
        assert!(builder.read_record("c1", LayerKind::ReadOnly).is_none());
        assert!(!dir.path().join(MOUNTS_DIR).join("c1").exists());
    }

    #[test]
    fn test_destroy_removes_rw_layer_but_not_ro() {
        let dir = tempfile::tempdir().unwrap();
        let builder = LayerBuilder::new(dir.path().to_owned());

        let ro_path = builder.layer_path("ro-layer");
        fs::create_dir_all(&ro_path).unwrap();
        builder.record_layer("c1", LayerKind::ReadOnly, "ro-layer").unwrap();

        let rw_path = builder.layer_path("rw-layer");
        fs::create_dir_all(&rw_path).unwrap();
        builder.record_layer("c1", LayerKind::ReadWrite, "rw-layer").unwrap();

        builder.destroy("c1");
        assert!(ro_path.exists());
        assert!(!rw_path.exists());
    }
}
