//! The storage driver contract.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use silo_common::{ByteSize, Fingerprint, SiloResult};

use crate::migration::DiffChannel;
use crate::volume::{SnapshotName, StoragePool, VolumeRef};

/// What a storage technology can do natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Writable clones of snapshots without copying data.
    pub clone: bool,
    /// Per-volume quotas.
    pub quota: bool,
    /// Diffs between two snapshots rather than full copies.
    pub incremental_diff: bool,
    /// Restore only from the most recent snapshot.
    pub restore_latest_only: bool,
}

/// Pool and volume operations against one storage technology.
///
/// One driver instance serves one pool. All mutating operations go through
/// the technology's command-line tools; failures carry the command and its
/// output.
#[async_trait]
pub trait StorageDriver: Send + Sync + fmt::Debug {
    /// Technology identifier (`zfs`, `dir`).
    fn name(&self) -> &'static str;

    /// What this technology supports.
    fn capabilities(&self) -> Capabilities;

    /// Snapshot of the pool description, including applied updates.
    fn pool(&self) -> StoragePool;

    /// Create the pool on disk.
    ///
    /// Returns the configuration keys the driver filled in, to be persisted
    /// with the pool.
    async fn pool_create(&self) -> SiloResult<BTreeMap<String, String>>;

    /// Destroy the pool on disk.
    async fn pool_delete(&self) -> SiloResult<()>;

    /// Verify the pool is present, re-importing it if needed.
    async fn pool_check(&self) -> SiloResult<()>;

    /// Validate and apply configuration changes.
    fn pool_update(&self, changes: &BTreeMap<String, String>) -> SiloResult<()>;

    /// Create an empty volume.
    async fn volume_create(&self, vol: &VolumeRef) -> SiloResult<()>;

    /// Delete a volume and all of its snapshots.
    ///
    /// Volumes still referenced by clones are deferred rather than
    /// destroyed.
    async fn volume_delete(&self, vol: &VolumeRef) -> SiloResult<()>;

    /// Whether a volume exists on disk.
    async fn volume_exists(&self, vol: &VolumeRef) -> SiloResult<bool>;

    /// Create `dest` as a writable clone of `src` at snapshot `snap`.
    async fn volume_clone(&self, src: &VolumeRef, snap: &SnapshotName, dest: &VolumeRef)
    -> SiloResult<()>;

    /// Rename a container volume, its snapshot directory and symlink.
    async fn volume_rename(&self, vol: &VolumeRef, new_name: &str) -> SiloResult<()>;

    /// Mount a volume. Returns whether this call performed the mount.
    async fn volume_mount(&self, vol: &VolumeRef) -> SiloResult<bool>;

    /// Unmount a volume. Returns whether this call performed the unmount.
    async fn volume_unmount(&self, vol: &VolumeRef) -> SiloResult<bool>;

    /// Bytes used by a volume.
    async fn volume_usage(&self, vol: &VolumeRef) -> SiloResult<u64>;

    /// Set or clear (`None`) the quota of a volume.
    async fn set_quota(&self, vol: &VolumeRef, size: Option<ByteSize>) -> SiloResult<()>;

    /// Set a technology property on a volume.
    async fn set_property(&self, vol: &VolumeRef, key: &str, value: &str) -> SiloResult<()>;

    /// Take a snapshot of a volume.
    async fn snapshot_create(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<()>;

    /// Delete a snapshot, deferring it if clones depend on it.
    async fn snapshot_delete(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<()>;

    /// Rename a user snapshot.
    async fn snapshot_rename(
        &self,
        vol: &VolumeRef,
        snap: &SnapshotName,
        new_name: &str,
    ) -> SiloResult<()>;

    /// Roll a volume back to a snapshot.
    async fn snapshot_restore(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<()>;

    /// Snapshots of a volume, oldest first.
    async fn snapshot_list(&self, vol: &VolumeRef) -> SiloResult<Vec<SnapshotName>>;

    /// Whether no clone depends on the snapshot.
    async fn snapshot_removable(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<bool>;

    /// Expose a snapshot read-only at its mountpoint.
    async fn snapshot_mount(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<bool>;

    /// Withdraw a snapshot exposed by [`StorageDriver::snapshot_mount`].
    async fn snapshot_unmount(&self, vol: &VolumeRef, snap: &SnapshotName) -> SiloResult<bool>;

    /// Build the image volume for `fingerprint` from its tarball.
    async fn image_create(&self, fingerprint: &Fingerprint, tarball: &Path) -> SiloResult<()>;

    /// Delete an image volume, deferring it while containers use it.
    async fn image_delete(&self, fingerprint: &Fingerprint) -> SiloResult<()>;

    /// Write snapshot `snap` of `vol` to `channel` as one diff, relative to
    /// `parent` when the technology supports incremental diffs.
    async fn diff_send(
        &self,
        vol: &VolumeRef,
        snap: &SnapshotName,
        parent: Option<&SnapshotName>,
        channel: &mut dyn DiffChannel,
    ) -> SiloResult<()>;

    /// Apply one diff from `channel` to `vol`, or to its snapshot `snap`.
    async fn diff_receive(
        &self,
        vol: &VolumeRef,
        snap: Option<&SnapshotName>,
        channel: &mut dyn DiffChannel,
    ) -> SiloResult<()>;
}
