//! Standard filesystem paths for Silo.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default var directory for Silo data.
pub static SILO_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SILO_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/silo"))
});

/// Standard paths used by the storage manager.
///
/// Every mountpoint and symlink location external tooling relies on is
/// derived here, so drivers never build these paths by hand.
#[derive(Debug, Clone)]
pub struct SiloPaths {
    /// Var directory (default: /var/lib/silo).
    pub root: PathBuf,
}

impl SiloPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom var directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one mount root per storage pool.
    #[must_use]
    pub fn storage_pools(&self) -> PathBuf {
        self.root.join("storage-pools")
    }

    /// Mount root of a pool.
    #[must_use]
    pub fn pool_mount_root(&self, pool: &str) -> PathBuf {
        self.storage_pools().join(pool)
    }

    /// Mountpoint of a container volume.
    #[must_use]
    pub fn container_mountpoint(&self, pool: &str, name: &str) -> PathBuf {
        self.pool_mount_root(pool).join("containers").join(name)
    }

    /// Mountpoint of an image volume.
    #[must_use]
    pub fn image_mountpoint(&self, pool: &str, fingerprint: &str) -> PathBuf {
        self.pool_mount_root(pool).join("images").join(fingerprint)
    }

    /// Mountpoint of a custom volume.
    #[must_use]
    pub fn custom_mountpoint(&self, pool: &str, name: &str) -> PathBuf {
        self.pool_mount_root(pool).join("custom").join(name)
    }

    /// Directory holding the snapshot mountpoints of one container.
    #[must_use]
    pub fn snapshots_dir(&self, pool: &str, container: &str) -> PathBuf {
        self.pool_mount_root(pool).join("snapshots").join(container)
    }

    /// Mountpoint of a container snapshot.
    #[must_use]
    pub fn snapshot_mountpoint(&self, pool: &str, container: &str, snap: &str) -> PathBuf {
        self.snapshots_dir(pool, container).join(snap)
    }

    /// Stable symlink pointing at a container's snapshot directory.
    #[must_use]
    pub fn snapshot_symlink(&self, container: &str) -> PathBuf {
        self.root.join("snapshots").join(container)
    }

    /// Directory for loop-file backed pools.
    #[must_use]
    pub fn disks(&self) -> PathBuf {
        self.root.join("disks")
    }

    /// Loop file of a pool.
    #[must_use]
    pub fn disk_image(&self, pool: &str) -> PathBuf {
        self.disks().join(format!("{pool}.img"))
    }

    /// Directory of image tarballs, keyed by fingerprint.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Tarball of an image.
    #[must_use]
    pub fn image_tarball(&self, fingerprint: &str) -> PathBuf {
        self.images().join(fingerprint)
    }

    /// Directory of the file-backed catalog.
    #[must_use]
    pub fn catalog(&self) -> PathBuf {
        self.root.join("catalog")
    }

    /// Scratch directory for temporary mounts during image unpacking.
    #[must_use]
    pub fn scratch(&self) -> PathBuf {
        self.root.join("scratch")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.storage_pools())?;
        std::fs::create_dir_all(self.root.join("snapshots"))?;
        std::fs::create_dir_all(self.disks())?;
        std::fs::create_dir_all(self.images())?;
        std::fs::create_dir_all(self.catalog())?;
        std::fs::create_dir_all(self.scratch())?;
        Ok(())
    }
}

impl Default for SiloPaths {
    fn default() -> Self {
        Self {
            root: SILO_ROOT.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_root() {
        let paths = SiloPaths::with_root("/tmp/silo-test");
        assert_eq!(
            paths.container_mountpoint("default", "c1"),
            PathBuf::from("/tmp/silo-test/storage-pools/default/containers/c1")
        );
        assert_eq!(
            paths.image_mountpoint("default", "abc123"),
            PathBuf::from("/tmp/silo-test/storage-pools/default/images/abc123")
        );
    }

    #[test]
    fn snapshot_paths() {
        let paths = SiloPaths::with_root("/var/lib/silo");
        assert_eq!(
            paths.snapshot_mountpoint("default", "c1", "snap0"),
            PathBuf::from("/var/lib/silo/storage-pools/default/snapshots/c1/snap0")
        );
        assert_eq!(
            paths.snapshot_symlink("c1"),
            PathBuf::from("/var/lib/silo/snapshots/c1")
        );
    }

    #[test]
    fn disk_image_path() {
        let paths = SiloPaths::with_root("/var/lib/silo");
        assert_eq!(
            paths.disk_image("tank"),
            PathBuf::from("/var/lib/silo/disks/tank.img")
        );
    }
}
