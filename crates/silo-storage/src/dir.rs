//! Plain-directory storage driver.
//!
//! Every volume is a directory at its mountpoint. Snapshots and clones are
//! full copies, so nothing ever depends on anything else and every snapshot
//! is removable. Diffs are complete tar streams of the snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use silo_common::{ByteSize, Fingerprint, SiloError, SiloPaths, SiloResult};
use tokio::io::AsyncWriteExt;
use tokio_util::io::{ReaderStream, SyncIoBridge};

use crate::driver::{Capabilities, StorageDriver};
use crate::filesystem::{self, blocking};
use crate::migration::DiffChannel;
use crate::volume::{READONLY_SNAPSHOT, SnapshotName, StoragePool, VolumeRef, VolumeType};

const PIPE_CAPACITY: usize = 256 * 1024;

/// Pool keys that may change after creation.
const CHANGEABLE_KEYS: [&str; 2] = ["rsync.bwlimit", "volume.size"];

/// Driver for one directory-backed pool.
#[derive(Debug)]
pub struct DirDriver {
    pool: RwLock<StoragePool>,
    paths: SiloPaths,
}

impl DirDriver {
    /// Technology identifier.
    pub const NAME: &'static str = "dir";

    /// Create a driver for `pool`.
    #[must_use]
    pub fn new(pool: StoragePool, paths: SiloPaths) -> Self {
        Self {
            pool: RwLock::new(pool),
            paths,
        }
    }

    fn pool_name(&self) -> String {
        self.pool.read().name.clone()
    }

    /// Directory holding the snapshots of a volume.
    fn snapshot_root(&self, vol: &VolumeRef) -> PathBuf {
        match vol.kind {
            VolumeType::Custom => self
                .paths
                .pool_mount_root(&vol.pool)
                .join("custom-snapshots")
                .join(&vol.name),
            _ => self.paths.snapshots_dir(&vol.pool, &vol.name),
        }
    }

    /// Where a snapshot of `vol` lives. Transient snapshots are hidden
    /// entries next to the user ones; an image's `readonly` snapshot is the
    /// image itself.
    fn snapshot_path(&self, vol: &VolumeRef, snap: &SnapshotName) -> PathBuf {
        if vol.kind == VolumeType::Image && snap.as_str() == READONLY_SNAPSHOT {
            return vol.mountpoint(&self.paths);
        }
        match snap {
            SnapshotName::User(name) => self.snapshot_root(vol).join(name),
            SnapshotName::Transient(name) => self.snapshot_root(vol).join(format!(".{name}")),
        }
    }

    /// Resolve snapshot volumes to their directory.
    fn volume_path(&self, vol: &VolumeRef) -> SiloResult<PathBuf> {
        if vol.kind == VolumeType::Snapshot {
            let (parent, snap) = vol.split_snapshot()?;
            return Ok(self.snapshot_path(&parent, &snap));
        }
        Ok(vol.mountpoint(&self.paths))
    }

    async fn copy(src: PathBuf, dest: PathBuf) -> SiloResult<()> {
        blocking(move || filesystem::copy_tree(&src, &dest)).await
    }
}

fn unsupported(feature: &str) -> SiloError {
    SiloError::Unsupported {
        feature: format!("{feature} on {} pools", DirDriver::NAME),
    }
}

#[async_trait]
impl StorageDriver for DirDriver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            clone: false,
            quota: false,
            incremental_diff: false,
            restore_latest_only: false,
        }
    }

    fn pool(&self) -> StoragePool {
        self.pool.read().clone()
    }

    async fn pool_create(&self) -> SiloResult<BTreeMap<String, String>> {
        let root = self.paths.pool_mount_root(&self.pool_name());
        for dir in ["containers", "images", "custom", "snapshots", "custom-snapshots"] {
            filesystem::create_mountpoint(&root.join(dir)).await?;
        }
        let mut persisted = BTreeMap::new();
        persisted.insert("source".to_string(), root.display().to_string());
        self.pool.write().config.extend(persisted.clone());
        tracing::info!(pool = %self.pool_name(), root = %root.display(), "Created directory pool");
        Ok(persisted)
    }

    async fn pool_delete(&self) -> SiloResult<()> {
        filesystem::remove_tree(&self.paths.pool_mount_root(&self.pool_name())).await
    }

    async fn pool_check(&self) -> SiloResult<()> {
        let name = self.pool_name();
        if tokio::fs::metadata(self.paths.pool_mount_root(&name)).await.is_ok_and(|m| m.is_dir()) {
            Ok(())
        } else {
            Err(SiloError::PoolNotFound { name })
        }
    }

    fn pool_update(&self, changes: &BTreeMap<String, String>) -> SiloResult<()> {
        for (key, value) in changes {
            if !CHANGEABLE_KEYS.contains(&key.as_str()) {
                return Err(SiloError::validation(format!(
                    "The {key:?} property cannot be changed"
                )));
            }
            if key == "volume.size" {
                ByteSize::parse(value)?;
            }
        }
        self.pool
            .write()
            .config
            .extend(changes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn volume_create(&self, vol: &VolumeRef) -> SiloResult<()> {
        if !matches!(vol.kind, VolumeType::Container | VolumeType::Custom) {
            return Err(SiloError::validation(format!("Cannot create {vol} directly")));
        }
        let path = vol.mountpoint(&self.paths);
        if filesystem::present(&path).await {
            return Err(SiloError::AlreadyExists {
                what: format!("volume {vol}"),
            });
        }
        filesystem::create_mountpoint(&path).await
    }

    async fn volume_delete(&self, vol: &VolumeRef) -> SiloResult<()> {
        match vol.kind {
            VolumeType::Container => {
                filesystem::remove_tree(&vol.mountpoint(&self.paths)).await?;
                filesystem::remove_all_snapshot_dirs(&self.paths, &vol.pool, &vol.name).await
            }
            VolumeType::Custom => {
                filesystem::remove_tree(&vol.mountpoint(&self.paths)).await?;
                filesystem::remove_tree(&self.snapshot_root(vol)).await
            }
            VolumeType::Snapshot => {
                let (parent, snap) = vol.split_snapshot()?;
                self.snapshot_delete(&parent, &snap).await
            }
            VolumeType::Image => self.image_delete(&Fingerprint::new(vol.name.as_str())?).await,
        }
    }

    async fn volume_exists(&self, vol: &VolumeRef) -> SiloResult<bool> {
        Ok(filesystem::present(&self.volume_path(vol)?).await)
    }

    async fn volume_clone(
        &self,
        src: &VolumeRef,
        snap: &SnapshotName,
        dest: &VolumeRef,
    ) -> SiloResult<()> {
        self.volume_create(dest).await?;
        Self::copy(self.snapshot_path(src, snap), dest.mountpoint(&self.paths)).await
    }

    async fn volume_rename(&self, vol: &VolumeRef, new_name: &str) -> SiloResult<()> {
        let target = VolumeRef::new(vol.pool.clone(), vol.kind, new_name);
        tokio::fs::rename(vol.mountpoint(&self.paths), target.mountpoint(&self.paths)).await?;
        match vol.kind {
            VolumeType::Container => {
                filesystem::rename_snapshot_dirs(&self.paths, &vol.pool, &vol.name, new_name).await
            }
            VolumeType::Custom => {
                let old = self.snapshot_root(vol);
                if filesystem::present(&old).await {
                    tokio::fs::rename(old, self.snapshot_root(&target)).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn volume_mount(&self, _vol: &VolumeRef) -> SiloResult<bool> {
        Ok(false)
    }

    async fn volume_unmount(&self, _vol: &VolumeRef) -> SiloResult<bool> {
        Ok(false)
    }

    async fn volume_usage(&self, vol: &VolumeRef) -> SiloResult<u64> {
        let path = self.volume_path(vol)?;
        blocking(move || filesystem::tree_size(&path)).await
    }

    async fn set_quota(&self, _vol: &VolumeRef, size: Option<ByteSize>) -> SiloResult<()> {
        match size {
            None => Ok(()),
            Some(_) => Err(unsupported("quotas")),
        }
    }

    async fn set_property(&self, _vol: &VolumeRef, _key: &str, _value: &str) -> SiloResult<()> {
        Err(unsupported("volume properties"))
    }

    async fn snapshot_create(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<()> {
        let dest = self.snapshot_path(vol, snap);
        if filesystem::present(&dest).await {
            return Err(SiloError::AlreadyExists {
                what: format!("snapshot {vol}@{snap}"),
            });
        }
        Self::copy(vol.mountpoint(&self.paths), dest).await?;
        if snap.is_user() && vol.kind == VolumeType::Container {
            filesystem::ensure_snapshot_link(&self.paths, &vol.pool, &vol.name).await?;
        }
        Ok(())
    }

    async fn snapshot_delete(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<()> {
        if snap.is_user() && vol.kind == VolumeType::Container {
            return filesystem::remove_snapshot_dirs(&self.paths, &vol.pool, &vol.name, snap.as_str())
                .await;
        }
        filesystem::remove_tree(&self.snapshot_path(vol, snap)).await
    }

    async fn snapshot_rename(
        &self,
        vol: &VolumeRef,
        snap: &SnapshotName,
        new_name: &str,
    ) -> SiloResult<()> {
        let target = self.snapshot_path(vol, &SnapshotName::user(new_name));
        tokio::fs::rename(self.snapshot_path(vol, snap), target).await?;
        Ok(())
    }

    async fn snapshot_restore(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<()> {
        let src = self.snapshot_path(vol, snap);
        if !filesystem::present(&src).await {
            return Err(SiloError::VolumeNotFound {
                what: format!("snapshot {vol}@{snap}"),
            });
        }
        let dest = vol.mountpoint(&self.paths);
        blocking(move || {
            filesystem::clear_dir(&dest)?;
            filesystem::copy_tree(&src, &dest)
        })
        .await
    }

    async fn snapshot_list(&self, vol: &VolumeRef) -> SiloResult<Vec<SnapshotName>> {
        if vol.kind == VolumeType::Image {
            let present = filesystem::present(&vol.mountpoint(&self.paths)).await;
            return Ok(if present { vec![SnapshotName::readonly()] } else { Vec::new() });
        }

        let mut entries = match tokio::fs::read_dir(self.snapshot_root(vol)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut found: Vec<(SystemTime, SnapshotName)> = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let modified = entry.metadata().await?.modified()?;
            let snap = name.strip_prefix('.').map_or_else(
                || SnapshotName::user(name.as_str()),
                |transient| SnapshotName::Transient(transient.to_string()),
            );
            found.push((modified, snap));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.as_str().cmp(b.1.as_str())));
        Ok(found.into_iter().map(|(_, snap)| snap).collect())
    }

    async fn snapshot_removable(&self, _vol: &VolumeRef, _snap: &SnapshotName) -> SiloResult<bool> {
        Ok(true)
    }

    async fn snapshot_mount(&self, _vol: &VolumeRef, _snap: &SnapshotName) -> SiloResult<bool> {
        Ok(false)
    }

    async fn snapshot_unmount(&self, _vol: &VolumeRef, _snap: &SnapshotName) -> SiloResult<bool> {
        Ok(false)
    }

    async fn image_create(&self, fingerprint: &Fingerprint, tarball: &Path) -> SiloResult<()> {
        let vol = VolumeRef::image(self.pool_name(), fingerprint.as_str());
        let dest = vol.mountpoint(&self.paths);
        if filesystem::present(&dest).await {
            return Ok(());
        }
        if let Err(err) = crate::image::unpack(tarball, &dest).await {
            if let Err(cleanup) = filesystem::remove_tree(&dest).await {
                tracing::warn!(image = %fingerprint, error = %cleanup, "Failed to remove partial image");
            }
            return Err(err);
        }
        tracing::info!(image = %fingerprint, "Created image volume");
        Ok(())
    }

    async fn image_delete(&self, fingerprint: &Fingerprint) -> SiloResult<()> {
        let vol = VolumeRef::image(self.pool_name(), fingerprint.as_str());
        filesystem::remove_tree(&vol.mountpoint(&self.paths)).await
    }

    async fn diff_send(
        &self,
        vol: &VolumeRef,
        snap: &SnapshotName,
        _parent: Option<&SnapshotName>,
        channel: &mut dyn DiffChannel,
    ) -> SiloResult<()> {
        let src = self.snapshot_path(vol, snap);
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let bridge = SyncIoBridge::new(writer);
        let producer = tokio::task::spawn_blocking(move || -> SiloResult<()> {
            let mut builder = tar::Builder::new(bridge);
            builder.follow_symlinks(false);
            builder.append_dir_all(".", &src)?;
            let mut bridge = builder.into_inner()?;
            bridge.shutdown()?;
            Ok(())
        });

        let mut stream = ReaderStream::new(reader);
        while let Some(chunk) = stream.next().await {
            channel.write_chunk(chunk?).await?;
        }
        producer
            .await
            .map_err(|e| SiloError::internal(format!("archive task failed: {e}")))??;
        channel.finish().await
    }

    async fn diff_receive(
        &self,
        vol: &VolumeRef,
        snap: Option<&SnapshotName>,
        channel: &mut dyn DiffChannel,
    ) -> SiloResult<()> {
        let target = snap.map_or_else(
            || vol.mountpoint(&self.paths),
            |s| self.snapshot_path(vol, s),
        );
        let (mut writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let bridge = SyncIoBridge::new(reader);
        let dest = target.clone();
        let consumer = tokio::task::spawn_blocking(move || -> SiloResult<()> {
            if dest.is_dir() {
                filesystem::clear_dir(&dest)?;
            } else {
                std::fs::create_dir_all(&dest)?;
            }
            let mut archive = tar::Archive::new(bridge);
            archive.set_preserve_permissions(true);
            archive.unpack(&dest)?;
            std::io::copy(&mut archive.into_inner(), &mut std::io::sink())?;
            Ok(())
        });

        let copied = async {
            while let Some(chunk) = channel.read_chunk().await? {
                writer.write_all(&chunk).await?;
            }
            writer.shutdown().await?;
            Ok::<_, SiloError>(())
        }
        .await;
        drop(writer);
        let unpacked = consumer
            .await
            .map_err(|e| SiloError::internal(format!("unpack task failed: {e}")));

        match (copied, unpacked) {
            (Err(err @ SiloError::Migration { .. }), _)
            | (_, Err(err) | Ok(Err(err)))
            | (Err(err), Ok(Ok(()))) => return Err(err),
            (Ok(()), Ok(Ok(()))) => {}
        }

        if let Some(snap) = snap {
            if snap.is_user() && vol.kind == VolumeType::Container {
                filesystem::ensure_snapshot_link(&self.paths, &vol.pool, &vol.name).await?;
            }
        }
        tracing::debug!(target = %target.display(), "Received diff");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(root: &Path) -> DirDriver {
        DirDriver::new(StoragePool::new("default", DirDriver::NAME), SiloPaths::with_root(root))
    }

    #[tokio::test]
    async fn snapshots_are_copies_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver(tmp.path());
        driver.pool_create().await.unwrap();
        let vol = VolumeRef::container("default", "c1");
        driver.volume_create(&vol).await.unwrap();
        let rootfs = vol.mountpoint(&driver.paths);

        std::fs::write(rootfs.join("state"), "v0").unwrap();
        driver.snapshot_create(&vol, &SnapshotName::user("snap0")).await.unwrap();
        std::fs::write(rootfs.join("state"), "v1").unwrap();
        driver.snapshot_create(&vol, &SnapshotName::user("snap1")).await.unwrap();
        driver.snapshot_create(&vol, &SnapshotName::copy()).await.unwrap();

        let list = driver.snapshot_list(&vol).await.unwrap();
        let users: Vec<&str> = list.iter().filter(|s| s.is_user()).map(SnapshotName::as_str).collect();
        assert_eq!(users, ["snap0", "snap1"]);
        assert_eq!(list.len(), 3);
        assert!(tmp.path().join("snapshots/c1/snap0").is_dir());

        driver
            .snapshot_restore(&vol, &SnapshotName::user("snap0"))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(rootfs.join("state")).unwrap(), "v0");
    }

    #[tokio::test]
    async fn quotas_are_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = driver(tmp.path());
        let vol = VolumeRef::container("default", "c1");
        let err = driver
            .set_quota(&vol, Some(ByteSize::gibibytes(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SiloError::Unsupported { .. }));
        driver.set_quota(&vol, None).await.unwrap();
    }

    #[tokio::test]
    async fn diff_round_trip_between_pools() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let src = driver(a.path());
        let dst = driver(b.path());
        src.pool_create().await.unwrap();
        dst.pool_create().await.unwrap();

        let vol = VolumeRef::container("default", "c1");
        src.volume_create(&vol).await.unwrap();
        std::fs::create_dir_all(vol.mountpoint(&src.paths).join("etc")).unwrap();
        std::fs::write(vol.mountpoint(&src.paths).join("etc/hostname"), "c1\n").unwrap();
        let snap = SnapshotName::user("snap0");
        src.snapshot_create(&vol, &snap).await.unwrap();
        dst.volume_create(&vol).await.unwrap();

        let (x, y) = tokio::io::duplex(64 * 1024);
        let mut tx = crate::migration::FramedChannel::new(x);
        let mut rx = crate::migration::FramedChannel::new(y);
        let send = src.diff_send(&vol, &snap, None, &mut tx);
        let receive = dst.diff_receive(&vol, Some(&snap), &mut rx);
        let (sent, received) = tokio::join!(send, receive);
        sent.unwrap();
        received.unwrap();

        let copy = b.path().join("storage-pools/default/snapshots/c1/snap0/etc/hostname");
        assert_eq!(std::fs::read_to_string(copy).unwrap(), "c1\n");
        assert!(b.path().join("snapshots/c1").exists());
    }
}
