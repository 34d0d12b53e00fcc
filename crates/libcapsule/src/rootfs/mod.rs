//! Rootfs preparation for the init process: applies the configured mounts
//! in order and pivots into the new root.
use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd;

use crate::config::{ContainerConfig, Mount};

#[derive(Debug, thiserror::Error)]
pub enum RootfsError {
    #[error("failed to mount {destination:?}")]
    Mount {
        destination: PathBuf,
        source: nix::Error,
    },
    #[error("failed to create mount point {path:?}")]
    MountPoint {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to pivot into rootfs {path:?}")]
    Pivot { path: PathBuf, source: nix::Error },
    #[error("mount destination {0:?} is not absolute")]
    RelativeDestination(PathBuf),
}

type Result<T> = std::result::Result<T, RootfsError>;

/// Applies the mount list in spec order onto the rootfs and pivots into it.
/// Must run inside the new mount namespace.
pub fn prepare_rootfs(config: &ContainerConfig) -> Result<()> {
    let rootfs = &config.rootfs;

    // recursively privatize propagation so none of the following mounts
    // leak back into the host namespace
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|err| RootfsError::Mount {
        destination: PathBuf::from("/"),
        source: err,
    })?;

    // pivot_root requires the new root to be a mount point
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|err| RootfsError::Mount {
        destination: rootfs.clone(),
        source: err,
    })?;

    for m in &config.mounts {
        apply_mount(rootfs, m)?;
    }

    pivot_rootfs(rootfs)
}

fn apply_mount(rootfs: &Path, m: &Mount) -> Result<()> {
    if !m.destination.is_absolute() {
        return Err(RootfsError::RelativeDestination(m.destination.clone()));
    }
    let destination = rootfs.join(
        m.destination
            .strip_prefix("/")
            .expect("absolute path has a root to strip"),
    );
    fs::create_dir_all(&destination).map_err(|err| RootfsError::MountPoint {
        path: destination.clone(),
        source: err,
    })?;

    let (flags, data) = parse_mount_options(&m.options);
    tracing::debug!(?destination, fs_type = ?m.fs_type, ?flags, "applying mount");
    mount(
        m.source.as_deref(),
        &destination,
        m.fs_type.as_deref(),
        flags,
        if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        },
    )
    .map_err(|err| RootfsError::Mount {
        destination,
        source: err,
    })?;
    Ok(())
}

/// Splits mount options into kernel mount flags and leftover fs data.
fn parse_mount_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        let flag = match option.as_str() {
            "bind" => Some(MsFlags::MS_BIND),
            "rbind" => Some(MsFlags::MS_BIND | MsFlags::MS_REC),
            "ro" => Some(MsFlags::MS_RDONLY),
            "rw" => None,
            "nosuid" => Some(MsFlags::MS_NOSUID),
            "nodev" => Some(MsFlags::MS_NODEV),
            "noexec" => Some(MsFlags::MS_NOEXEC),
            "noatime" => Some(MsFlags::MS_NOATIME),
            "relatime" => Some(MsFlags::MS_RELATIME),
            "strictatime" => Some(MsFlags::MS_STRICTATIME),
            "sync" => Some(MsFlags::MS_SYNCHRONOUS),
            "dirsync" => Some(MsFlags::MS_DIRSYNC),
            "remount" => Some(MsFlags::MS_REMOUNT),
            "private" => Some(MsFlags::MS_PRIVATE),
            "rprivate" => Some(MsFlags::MS_PRIVATE | MsFlags::MS_REC),
            "shared" => Some(MsFlags::MS_SHARED),
            "slave" => Some(MsFlags::MS_SLAVE),
            _ => {
                data.push(option.clone());
                None
            }
        };
        if let Some(flag) = flag {
            flags |= flag;
        }
    }
    (flags, data.join(","))
}

// Pivot into the rootfs with the stacked-root trick: with cwd on the new
// root, pivot_root(".", ".") stacks the old root underneath, which a lazy
// unmount then drops. Falls back to chroot on kernels or filesystems where
// pivot_root is unavailable.
fn pivot_rootfs(path: &Path) -> Result<()> {
    let wrap = |source: nix::Error| RootfsError::Pivot {
        path: path.to_owned(),
        source,
    };

    unistd::chdir(path).map_err(wrap)?;
    match unistd::pivot_root(".", ".") {
        Ok(()) => {
            umount2(".", MntFlags::MNT_DETACH).map_err(wrap)?;
        }
        Err(nix::errno::Errno::EINVAL) => {
            tracing::warn!(?path, "pivot_root unavailable, falling back to chroot");
            unistd::chroot(".").map_err(wrap)?;
        }
        Err(err) => return Err(wrap(err)),
    }
    unistd::chdir("/").map_err(wrap)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount_options_flags() {
        let (flags, data) = parse_mount_options(&[
            "nosuid".to_owned(),
            "noexec".to_owned(),
            "nodev".to_owned(),
        ]);
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_NOEXEC));
        assert!(flags.contains(MsFlags::MS_NODEV));
        assert!(data.is_empty());
    }

    #[test]
    fn test_parse_mount_options_data_passthrough() {
        let (flags, data) = parse_mount_options(&[
            "ro".to_owned(),
            "size=65536k".to_owned(),
            "mode=755".to_owned(),
        ]);
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert_eq!(data, "size=65536k,mode=755");
    }

    #[test]
    fn test_rbind_is_recursive() {
        let (flags, _) = parse_mount_options(&["rbind".to_owned()]);
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(flags.contains(MsFlags::MS_REC));
    }
}
