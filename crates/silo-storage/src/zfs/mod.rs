//! ZFS storage driver.
//!
//! Datasets live under the pool's on-disk root:
//!
//! ```text
//! <root>/containers/<name>            container root filesystems
//! <root>/containers/<name>@snapshot-<s>   user snapshots
//! <root>/images/<fp>@readonly         images containers are cloned from
//! <root>/custom/<name>                custom volumes
//! <root>/snapshots/<name>/<s>         clones exposing a snapshot read-only
//! <root>/deleted/<kind>/<id>          deletions deferred by dependent clones
//! ```

pub mod graph;
pub mod tool;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use silo_common::{ByteSize, Fingerprint, SiloError, SiloResult};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::DriverContext;
use crate::driver::{Capabilities, StorageDriver};
use crate::filesystem;
use crate::migration::DiffChannel;
use crate::volume::{
    LeaseKind, READONLY_SNAPSHOT, SnapshotName, StoragePool, VolumeRef, VolumeType, parse_bool,
};

pub use graph::{DELETED, DatasetGraph};
pub use tool::Zfs;

/// Loop file size when a pool is created without `size`.
pub const DEFAULT_LOOP_SIZE: &str = "10GB";

/// Datasets created under the root of every pool.
const POOL_DATASETS: [&str; 5] = ["containers", "images", "custom", "deleted", "snapshots"];

/// Properties applied to the root of every pool.
const POOL_DEFAULTS: [(&str, &str); 6] = [
    ("mountpoint", "none"),
    ("setuid", "on"),
    ("exec", "on"),
    ("devices", "on"),
    ("acltype", "posixacl"),
    ("xattr", "sa"),
];

/// Pool keys that may change after creation.
const CHANGEABLE_KEYS: [&str; 5] = [
    "rsync.bwlimit",
    "volume.size",
    "volume.zfs.use_refquota",
    "volume.zfs.remove_snapshots",
    "zfs.clone_copy",
];

/// Driver for one ZFS-backed pool.
#[derive(Debug)]
pub struct ZfsDriver {
    pool: RwLock<StoragePool>,
    ctx: DriverContext,
}

impl ZfsDriver {
    /// Technology identifier.
    pub const NAME: &'static str = "zfs";

    /// Create a driver for `pool`.
    #[must_use]
    pub fn new(pool: StoragePool, ctx: DriverContext) -> Self {
        Self {
            pool: RwLock::new(pool),
            ctx,
        }
    }

    fn pool_name(&self) -> String {
        self.pool.read().name.clone()
    }

    /// The pool or dataset holding this pool's datasets.
    #[must_use]
    pub fn on_disk_root(&self) -> String {
        let pool = self.pool.read();
        if let Some(name) = pool.get("zfs.pool_name").filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        match pool.get("source") {
            Some(source) if !source.is_empty() && !Path::new(source).is_absolute() => {
                source.to_string()
            }
            _ => pool.name.clone(),
        }
    }

    fn zfs(&self) -> Zfs {
        Zfs::new(self.ctx.runner.clone(), self.on_disk_root(), self.ctx.retry)
    }

    fn use_refquota(&self) -> SiloResult<bool> {
        self.pool.read().flag("volume.zfs.use_refquota", false)
    }

    fn ensure_filesystem(vol: &VolumeRef) -> SiloResult<()> {
        match vol.kind {
            VolumeType::Container | VolumeType::Custom => Ok(()),
            kind => Err(SiloError::validation(format!(
                "Operation not supported on {kind} volume {}",
                vol.name
            ))),
        }
    }

    /// Dataset (or snapshot) path of a volume.
    fn dataset(vol: &VolumeRef) -> SiloResult<String> {
        if vol.kind == VolumeType::Snapshot {
            let (parent, snap) = vol.split_snapshot()?;
            return Ok(format!("{}@{}", parent.relative_path(), snap.disk_name()));
        }
        Ok(vol.relative_path())
    }

    /// Dataset exposing a user snapshot at its mountpoint.
    fn snapshot_clone_path(container: &str, snap: &SnapshotName) -> String {
        format!("{}/{container}/{}", VolumeType::Snapshot.dir_name(), snap.as_str())
    }

    /// Create the loop file, block device or dataset the pool lives on.
    ///
    /// Returns the keys to persist and whether anything was created.
    async fn provision(&self) -> SiloResult<(BTreeMap<String, String>, bool)> {
        let pool = self.pool.read().clone();
        let source = pool.get("source").unwrap_or_default().to_string();
        let mut persisted = BTreeMap::new();
        persisted.insert("volatile.initial_source".to_string(), source.clone());

        if source.is_empty() {
            let size = ByteSize::parse(pool.get("size").unwrap_or(DEFAULT_LOOP_SIZE))?;
            let zpool = pool.get("zfs.pool_name").unwrap_or(&pool.name).to_string();
            let disk = self.ctx.paths.disk_image(&pool.name);
            create_loop_file(&disk, size).await?;

            let disk = disk.display().to_string();
            let zfs = Zfs::new(self.ctx.runner.clone(), zpool.clone(), self.ctx.retry);
            if let Err(err) = zfs.pool_create(&zpool, &disk).await {
                filesystem::remove_file(Path::new(&disk)).await?;
                return Err(err);
            }
            persisted.insert("source".to_string(), disk);
            persisted.insert("size".to_string(), size.to_string());
            persisted.insert("zfs.pool_name".to_string(), zpool);
            return Ok((persisted, true));
        }

        if Path::new(&source).is_absolute() {
            if !is_block_device(Path::new(&source)).await {
                return Err(SiloError::validation(format!(
                    "Custom loop file locations are not supported: {source}"
                )));
            }
            let zpool = pool.get("zfs.pool_name").unwrap_or(&pool.name).to_string();
            let zfs = Zfs::new(self.ctx.runner.clone(), zpool.clone(), self.ctx.retry);
            zfs.pool_create(&zpool, &source).await?;
            persisted.insert("zfs.pool_name".to_string(), zpool);
            return Ok((persisted, true));
        }

        if let Some(name) = pool.get("zfs.pool_name").filter(|n| *n != source) {
            return Err(SiloError::validation(format!(
                "The source must match zfs.pool_name if specified (got {name:?} and {source:?})"
            )));
        }
        persisted.insert("zfs.pool_name".to_string(), source.clone());

        let zfs = Zfs::new(self.ctx.runner.clone(), source.clone(), self.ctx.retry);
        let mut created = false;
        if source.contains('/') {
            if !zfs.exists_full(&source).await {
                zfs.create_full(&source, &[("mountpoint", "none")]).await?;
                created = true;
            }
        } else if !zfs.exists_full(&source).await {
            zfs.pool_import(&source, None).await?;
        }

        if !created && zfs.list_filesystems_full(&source).await?.len() > 1 {
            return Err(SiloError::validation(format!(
                "Provided ZFS pool (or dataset) isn't empty: {source}"
            )));
        }
        Ok((persisted, created))
    }

    async fn apply_pool_defaults(&self) -> SiloResult<()> {
        let zfs = self.zfs();
        for (key, value) in POOL_DEFAULTS {
            zfs.set_full(zfs.root(), key, value).await?;
        }
        for dataset in POOL_DATASETS {
            if !zfs.exists(dataset).await {
                zfs.create(dataset, &[("mountpoint", "none")]).await?;
            }
        }

        let mount_root = self.ctx.paths.pool_mount_root(&self.pool_name());
        for dir in ["containers", "images", "custom", "snapshots"] {
            filesystem::create_mountpoint(&mount_root.join(dir)).await?;
        }
        Ok(())
    }

    /// Unmount a filesystem before it is destroyed, detaching it if the
    /// tool refuses.
    async fn force_unmount(&self, zfs: &Zfs, path: &str, mountpoint: &Path) -> SiloResult<()> {
        if !zfs.is_mounted(path).await? {
            return Ok(());
        }
        if let Err(err) = zfs.unmount(path, true).await {
            tracing::warn!(dataset = path, error = %err, "Forced unmount failed, detaching");
            if filesystem::detach(mountpoint).is_err() {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn delete_filesystem(&self, vol: &VolumeRef) -> SiloResult<()> {
        let zfs = self.zfs();
        let path = vol.relative_path();
        let mountpoint = vol.mountpoint(&self.ctx.paths);

        if vol.kind == VolumeType::Container {
            let exposed = format!("{}/{}", VolumeType::Snapshot.dir_name(), vol.name);
            if zfs.exists(&exposed).await {
                zfs.destroy(&exposed).await?;
            }
        }

        if zfs.exists(&path).await {
            self.force_unmount(&zfs, &path, &mountpoint).await?;
            DatasetGraph::new(&zfs)
                .delete_filesystem(&path, vol.kind.dir_name())
                .await?;
        }

        filesystem::remove_tree(&mountpoint).await?;
        if vol.kind == VolumeType::Container {
            filesystem::remove_all_snapshot_dirs(&self.ctx.paths, &vol.pool, &vol.name).await?;
        }
        tracing::info!(volume = %vol, "Deleted volume");
        Ok(())
    }

    async fn populate_image(&self, zfs: &Zfs, path: &str, tarball: &Path, tmp: &Path) -> SiloResult<()> {
        filesystem::create_mountpoint(tmp).await?;
        zfs.set(path, "mountpoint", &tmp.display().to_string()).await?;
        if !zfs.is_mounted(path).await? {
            zfs.mount(path).await?;
        }

        crate::image::unpack(tarball, tmp).await?;

        zfs.set(path, "readonly", "on").await?;
        zfs.unmount(path, false).await?;
        zfs.set(path, "mountpoint", "none").await?;
        zfs.snapshot(path, READONLY_SNAPSHOT).await
    }
}

async fn create_loop_file(path: &Path, size: ByteSize) -> SiloResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let file = options.open(path).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::AlreadyExists => SiloError::AlreadyExists {
            what: format!("loop file {}", path.display()),
        },
        _ => SiloError::Io(err),
    })?;
    file.set_len(size.as_bytes()).await?;
    tracing::debug!(path = %path.display(), %size, "Created loop file");
    Ok(())
}

async fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.file_type().is_block_device())
}

#[async_trait]
impl StorageDriver for ZfsDriver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            clone: true,
            quota: true,
            incremental_diff: true,
            restore_latest_only: true,
        }
    }

    fn pool(&self) -> StoragePool {
        self.pool.read().clone()
    }

    #[tracing::instrument(skip_all, fields(pool = %self.pool_name()))]
    async fn pool_create(&self) -> SiloResult<BTreeMap<String, String>> {
        let (persisted, created) = self.provision().await?;
        self.pool.write().config.extend(persisted.clone());

        if let Err(err) = self.apply_pool_defaults().await {
            if created {
                if let Err(revert) = self.pool_delete().await {
                    tracing::warn!(error = %revert, "Failed to revert pool creation");
                }
            }
            return Err(err);
        }

        tracing::info!(root = %self.on_disk_root(), "Created ZFS pool");
        Ok(persisted)
    }

    #[tracing::instrument(skip_all, fields(pool = %self.pool_name()))]
    async fn pool_delete(&self) -> SiloResult<()> {
        let zfs = self.zfs();
        let root = zfs.root().to_string();
        if zfs.exists_full(&root).await {
            if root.contains('/') {
                zfs.destroy("").await?;
            } else {
                zfs.pool_destroy(&root).await?;
            }
        }

        let name = self.pool_name();
        let disk = self.ctx.paths.disk_image(&name);
        if self.pool.read().get("source") == Some(disk.display().to_string().as_str()) {
            filesystem::remove_file(&disk).await?;
        }
        filesystem::remove_tree(&self.ctx.paths.pool_mount_root(&name)).await?;
        tracing::info!("Deleted ZFS pool");
        Ok(())
    }

    async fn pool_check(&self) -> SiloResult<()> {
        let zfs = self.zfs();
        let root = zfs.root().to_string();
        let zpool = root.split('/').next().unwrap_or(&root).to_string();
        if zfs.exists_full(&zpool).await {
            return Ok(());
        }

        let source = self.pool.read().get("source").unwrap_or_default().to_string();
        let search_dir = Path::new(&source)
            .is_absolute()
            .then(|| Path::new(&source).parent().map(|p| p.display().to_string()))
            .flatten();
        tracing::info!(pool = %zpool, "Pool not imported, importing");
        zfs.pool_import(&zpool, search_dir.as_deref()).await?;

        if zfs.exists_full(&root).await {
            Ok(())
        } else {
            Err(SiloError::PoolNotFound { name: root })
        }
    }

    fn pool_update(&self, changes: &BTreeMap<String, String>) -> SiloResult<()> {
        for (key, value) in changes {
            if !CHANGEABLE_KEYS.contains(&key.as_str()) {
                return Err(SiloError::validation(format!(
                    "The {key:?} property cannot be changed"
                )));
            }
            match key.as_str() {
                "volume.size" => {
                    ByteSize::parse(value)?;
                }
                "volume.zfs.use_refquota" | "volume.zfs.remove_snapshots" | "zfs.clone_copy" => {
                    parse_bool(key, value)?;
                }
                _ => {}
            }
        }
        self.pool
            .write()
            .config
            .extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(volume = %vol))]
    async fn volume_create(&self, vol: &VolumeRef) -> SiloResult<()> {
        Self::ensure_filesystem(vol)?;
        let zfs = self.zfs();
        let path = vol.relative_path();
        let mountpoint = vol.mountpoint(&self.ctx.paths);
        if zfs.exists(&path).await {
            return Err(SiloError::AlreadyExists {
                what: format!("volume {vol}"),
            });
        }

        let mp = mountpoint.display().to_string();
        zfs.create(&path, &[("mountpoint", &mp), ("canmount", "noauto")])
            .await?;
        filesystem::create_mountpoint(&mountpoint).await?;
        tracing::debug!("Created dataset");
        Ok(())
    }

    async fn volume_delete(&self, vol: &VolumeRef) -> SiloResult<()> {
        match vol.kind {
            VolumeType::Container | VolumeType::Custom => self.delete_filesystem(vol).await,
            VolumeType::Snapshot => {
                let (parent, snap) = vol.split_snapshot()?;
                self.snapshot_delete(&parent, &snap).await
            }
            VolumeType::Image => self.image_delete(&Fingerprint::new(vol.name.as_str())?).await,
        }
    }

    async fn volume_exists(&self, vol: &VolumeRef) -> SiloResult<bool> {
        Ok(self.zfs().exists(&Self::dataset(vol)?).await)
    }

    #[tracing::instrument(skip_all, fields(src = %src, dest = %dest))]
    async fn volume_clone(
        &self,
        src: &VolumeRef,
        snap: &SnapshotName,
        dest: &VolumeRef,
    ) -> SiloResult<()> {
        Self::ensure_filesystem(dest)?;
        let zfs = self.zfs();
        let mountpoint = dest.mountpoint(&self.ctx.paths);
        zfs.clone_snapshot(
            &src.relative_path(),
            &snap.disk_name(),
            &dest.relative_path(),
            &mountpoint.display().to_string(),
        )
        .await?;
        filesystem::create_mountpoint(&mountpoint).await?;
        tracing::debug!(%snap, "Cloned dataset");
        Ok(())
    }

    async fn volume_rename(&self, vol: &VolumeRef, new_name: &str) -> SiloResult<()> {
        Self::ensure_filesystem(vol)?;
        let zfs = self.zfs();
        let target = VolumeRef::new(vol.pool.clone(), vol.kind, new_name);
        self.volume_unmount(vol).await?;

        zfs.rename(&vol.relative_path(), &target.relative_path())
            .await?;
        let mountpoint = target.mountpoint(&self.ctx.paths);
        zfs.set(
            &target.relative_path(),
            "mountpoint",
            &mountpoint.display().to_string(),
        )
        .await?;

        filesystem::remove_dir(&vol.mountpoint(&self.ctx.paths)).await?;
        filesystem::create_mountpoint(&mountpoint).await?;
        if vol.kind == VolumeType::Container {
            filesystem::rename_snapshot_dirs(&self.ctx.paths, &vol.pool, &vol.name, new_name)
                .await?;
            let exposed = format!("{}/{}", VolumeType::Snapshot.dir_name(), vol.name);
            if zfs.exists(&exposed).await {
                let renamed = format!("{}/{new_name}", VolumeType::Snapshot.dir_name());
                zfs.rename(&exposed, &renamed).await?;
            }
        }
        tracing::info!(volume = %vol, new_name, "Renamed volume");
        Ok(())
    }

    async fn volume_mount(&self, vol: &VolumeRef) -> SiloResult<bool> {
        if vol.kind == VolumeType::Snapshot {
            let (parent, snap) = vol.split_snapshot()?;
            return self.snapshot_mount(&parent, &snap).await;
        }
        Self::ensure_filesystem(vol)?;

        let zfs = self.zfs();
        let path = vol.relative_path();
        let mountpoint = vol.mountpoint(&self.ctx.paths);
        self.ctx
            .coordinator
            .run(vol.lease(LeaseKind::Mount), || async move {
                if zfs.is_mounted(&path).await? {
                    tracing::debug!(dataset = %path, "Already mounted");
                    return Ok(false);
                }
                filesystem::create_mountpoint(&mountpoint).await?;
                zfs.mount(&path).await?;
                tracing::debug!(dataset = %path, "Mounted");
                Ok(true)
            })
            .await
    }

    async fn volume_unmount(&self, vol: &VolumeRef) -> SiloResult<bool> {
        if vol.kind == VolumeType::Snapshot {
            let (parent, snap) = vol.split_snapshot()?;
            return self.snapshot_unmount(&parent, &snap).await;
        }
        Self::ensure_filesystem(vol)?;

        let zfs = self.zfs();
        let path = vol.relative_path();
        self.ctx
            .coordinator
            .run(vol.lease(LeaseKind::Unmount), || async move {
                if !zfs.is_mounted(&path).await? {
                    tracing::debug!(dataset = %path, "Not mounted");
                    return Ok(false);
                }
                zfs.unmount(&path, false).await?;
                tracing::debug!(dataset = %path, "Unmounted");
                Ok(true)
            })
            .await
    }

    async fn volume_usage(&self, vol: &VolumeRef) -> SiloResult<u64> {
        let key = if vol.kind != VolumeType::Snapshot && self.use_refquota()? {
            "referenced"
        } else {
            "used"
        };
        let value = self.zfs().get(&Self::dataset(vol)?, key).await?;
        tool::parse_bytes(key, &value)
    }

    async fn set_quota(&self, vol: &VolumeRef, size: Option<ByteSize>) -> SiloResult<()> {
        Self::ensure_filesystem(vol)?;
        let key = if self.use_refquota()? { "refquota" } else { "quota" };
        let value = size.map_or_else(|| "none".to_string(), |s| s.as_bytes().to_string());
        self.zfs().set(&vol.relative_path(), key, &value).await?;
        tracing::debug!(volume = %vol, key, value, "Set quota");
        Ok(())
    }

    async fn set_property(&self, vol: &VolumeRef, key: &str, value: &str) -> SiloResult<()> {
        self.zfs().set(&Self::dataset(vol)?, key, value).await
    }

    async fn snapshot_create(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<()> {
        Self::ensure_filesystem(vol)?;
        self.zfs()
            .snapshot(&vol.relative_path(), &snap.disk_name())
            .await?;
        if snap.is_user() && vol.kind == VolumeType::Container {
            filesystem::ensure_snapshot_dirs(&self.ctx.paths, &vol.pool, &vol.name, snap.as_str())
                .await?;
        }
        tracing::debug!(volume = %vol, %snap, "Created snapshot");
        Ok(())
    }

    async fn snapshot_delete(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<()> {
        Self::ensure_filesystem(vol)?;
        let zfs = self.zfs();
        let path = vol.relative_path();
        let user_container = snap.is_user() && vol.kind == VolumeType::Container;

        if user_container {
            self.snapshot_unmount(vol, snap).await?;
        }
        if zfs.exists(&format!("{path}@{}", snap.disk_name())).await {
            DatasetGraph::new(&zfs)
                .delete_snapshot(&path, &snap.disk_name())
                .await?;
        }
        if user_container {
            filesystem::remove_snapshot_dirs(&self.ctx.paths, &vol.pool, &vol.name, snap.as_str())
                .await?;
        }
        tracing::debug!(volume = %vol, %snap, "Deleted snapshot");
        Ok(())
    }

    async fn snapshot_rename(
        &self,
        vol: &VolumeRef,
        snap: &SnapshotName,
        new_name: &str,
    ) -> SiloResult<()> {
        Self::ensure_filesystem(vol)?;
        let renamed = SnapshotName::user(new_name);
        self.zfs()
            .rename_snapshot(&vol.relative_path(), &snap.disk_name(), &renamed.disk_name())
            .await?;

        if vol.kind == VolumeType::Container {
            let paths = &self.ctx.paths;
            let old = paths.snapshot_mountpoint(&vol.pool, &vol.name, snap.as_str());
            if filesystem::present(&old).await {
                tokio::fs::rename(&old, paths.snapshot_mountpoint(&vol.pool, &vol.name, new_name))
                    .await?;
            } else {
                filesystem::ensure_snapshot_dirs(paths, &vol.pool, &vol.name, new_name).await?;
            }
        }
        Ok(())
    }

    async fn snapshot_restore(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<()> {
        Self::ensure_filesystem(vol)?;
        self.zfs()
            .rollback(&vol.relative_path(), &snap.disk_name())
            .await?;
        tracing::info!(volume = %vol, %snap, "Restored snapshot");
        Ok(())
    }

    async fn snapshot_list(&self, vol: &VolumeRef) -> SiloResult<Vec<SnapshotName>> {
        let names = self.zfs().list_snapshots(&vol.relative_path()).await?;
        Ok(names.iter().map(|n| SnapshotName::from_disk(n)).collect())
    }

    async fn snapshot_removable(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<bool> {
        let zfs = self.zfs();
        DatasetGraph::new(&zfs)
            .snapshot_removable(&vol.relative_path(), &snap.disk_name())
            .await
    }

    async fn snapshot_mount(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<bool> {
        if vol.kind != VolumeType::Container || !snap.is_user() {
            return Err(SiloError::validation(format!(
                "Only user snapshots of containers can be mounted, not {vol}@{snap}"
            )));
        }
        let zfs = self.zfs();
        let exposed = Self::snapshot_clone_path(&vol.name, snap);
        let mountpoint = self
            .ctx
            .paths
            .snapshot_mountpoint(&vol.pool, &vol.name, snap.as_str());
        let origin = vol.relative_path();
        let disk_name = snap.disk_name();
        let lease = VolumeRef::snapshot(vol.pool.clone(), &vol.name, snap.as_str());

        self.ctx
            .coordinator
            .run(lease.lease(LeaseKind::Mount), || async move {
                if zfs.exists(&exposed).await {
                    if zfs.is_mounted(&exposed).await? {
                        return Ok(false);
                    }
                } else {
                    zfs.clone_snapshot(
                        &origin,
                        &disk_name,
                        &exposed,
                        &mountpoint.display().to_string(),
                    )
                    .await?;
                    zfs.set(&exposed, "readonly", "on").await?;
                }
                filesystem::create_mountpoint(&mountpoint).await?;
                zfs.mount(&exposed).await?;
                Ok(true)
            })
            .await
    }

    async fn snapshot_unmount(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<bool> {
        let zfs = self.zfs();
        let exposed = Self::snapshot_clone_path(&vol.name, snap);
        let mountpoint = self
            .ctx
            .paths
            .snapshot_mountpoint(&vol.pool, &vol.name, snap.as_str());
        let lease = VolumeRef::snapshot(vol.pool.clone(), &vol.name, snap.as_str());

        self.ctx
            .coordinator
            .run(lease.lease(LeaseKind::Unmount), || async move {
                if !zfs.exists(&exposed).await {
                    return Ok(false);
                }
                self.force_unmount(&zfs, &exposed, &mountpoint).await?;
                zfs.destroy(&exposed).await?;
                Ok(true)
            })
            .await
    }

    #[tracing::instrument(skip_all, fields(pool = %self.pool_name(), image = %fingerprint))]
    async fn image_create(&self, fingerprint: &Fingerprint, tarball: &Path) -> SiloResult<()> {
        let zfs = self.zfs();
        let vol = VolumeRef::image(self.pool_name(), fingerprint.as_str());
        let path = vol.relative_path();
        if zfs.exists(&path).await {
            return Ok(());
        }

        let deleted = format!("{DELETED}/{path}");
        if zfs.exists(&deleted).await {
            zfs.rename(&deleted, &path).await?;
            zfs.set(&path, "mountpoint", "none").await?;
            tracing::info!("Revived deleted image");
            return Ok(());
        }

        zfs.create(&path, &[("mountpoint", "none")]).await?;
        let tmp = self
            .ctx
            .paths
            .scratch()
            .join(format!("image-{}", uuid::Uuid::new_v4()));
        let result = self.populate_image(&zfs, &path, tarball, &tmp).await;
        if result.is_err() {
            if let Err(err) = zfs.destroy(&path).await {
                tracing::warn!(error = %err, "Failed to remove partial image dataset");
            }
        }
        if let Err(err) = filesystem::remove_tree(&tmp).await {
            tracing::warn!(dir = %tmp.display(), error = %err, "Failed to remove unpack directory");
        }
        result?;
        tracing::info!("Created image volume");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(pool = %self.pool_name()))]
    async fn image_delete(&self, fingerprint: &Fingerprint) -> SiloResult<()> {
        let zfs = self.zfs();
        let vol = VolumeRef::image(self.pool_name(), fingerprint.as_str());
        let path = vol.relative_path();

        if zfs.exists(&path).await {
            let graph = DatasetGraph::new(&zfs);
            let has_readonly = zfs.exists(&format!("{path}@{READONLY_SNAPSHOT}")).await;
            if !has_readonly || graph.snapshot_removable(&path, READONLY_SNAPSHOT).await? {
                zfs.destroy(&path).await?;
                tracing::info!("Destroyed image volume");
            } else {
                zfs.set(&path, "mountpoint", "none").await?;
                zfs.rename(&path, &format!("{DELETED}/{path}")).await?;
                tracing::info!("Image has dependent containers, deferring deletion");
            }
        }
        filesystem::remove_tree(&vol.mountpoint(&self.ctx.paths)).await
    }

    async fn diff_send(
        &self,
        vol: &VolumeRef,
        snap: &SnapshotName,
        parent: Option<&SnapshotName>,
        channel: &mut dyn DiffChannel,
    ) -> SiloResult<()> {
        Self::ensure_filesystem(vol)?;
        let parent = parent.map(SnapshotName::disk_name);
        let mut command = self
            .zfs()
            .send(&vol.relative_path(), &snap.disk_name(), parent.as_deref())
            .await?;
        let stdout = command
            .take_stdout()
            .ok_or_else(|| SiloError::internal("zfs send started without stdout"))?;

        let mut stream = ReaderStream::new(stdout);
        while let Some(chunk) = stream.next().await {
            channel.write_chunk(chunk?).await?;
        }
        drop(stream);
        command.wait().await?;
        channel.finish().await
    }

    async fn diff_receive(
        &self,
        vol: &VolumeRef,
        snap: Option<&SnapshotName>,
        channel: &mut dyn DiffChannel,
    ) -> SiloResult<()> {
        Self::ensure_filesystem(vol)?;
        let path = vol.relative_path();
        let target = snap.map_or_else(|| path.clone(), |s| format!("{path}@{}", s.disk_name()));
        let mut command = self.zfs().receive(&target).await?;
        let mut stdin = command
            .take_stdin()
            .ok_or_else(|| SiloError::internal("zfs receive started without stdin"))?;

        let copied = async {
            while let Some(chunk) = channel.read_chunk().await? {
                stdin.write_all(&chunk).await?;
            }
            stdin.shutdown().await?;
            Ok::<_, SiloError>(())
        }
        .await;
        drop(stdin);
        let exited = command.wait().await;

        match (copied, exited) {
            (Err(err @ SiloError::Migration { .. }), _) | (_, Err(err)) | (Err(err), Ok(())) => {
                return Err(err);
            }
            (Ok(()), Ok(())) => {}
        }

        match snap {
            Some(snap) if snap.is_user() && vol.kind == VolumeType::Container => {
                filesystem::ensure_snapshot_dirs(&self.ctx.paths, &vol.pool, &vol.name, snap.as_str())
                    .await?;
            }
            Some(_) => {}
            None => {
                // A full stream replaces the dataset's local properties.
                let zfs = self.zfs();
                let mountpoint = vol.mountpoint(&self.ctx.paths).display().to_string();
                zfs.set(&path, "mountpoint", &mountpoint).await?;
                zfs.set(&path, "canmount", "noauto").await?;
            }
        }
        tracing::debug!(dataset = %target, "Received diff");
        Ok(())
    }
}
