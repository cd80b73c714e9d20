//! Pool, volume and snapshot identities.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use silo_common::{SNAPSHOT_DELIMITER, SiloError, SiloPaths, SiloResult};

/// Prefix of user snapshot names on copy-on-write technologies.
pub const USER_SNAPSHOT_PREFIX: &str = "snapshot-";
/// Prefix of the transient snapshot backing a same-pool copy.
pub const COPY_PREFIX: &str = "copy-";
/// Prefix of the transient snapshots sent during migration.
pub const MIGRATION_PREFIX: &str = "migration-send-";
/// Name of the snapshot images are cloned from.
pub const READONLY_SNAPSHOT: &str = "readonly";

/// A storage pool as recorded in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    /// Pool name.
    pub name: String,
    /// Storage technology (`zfs` or `dir`).
    pub driver: String,
    /// Technology-specific configuration.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl StoragePool {
    /// Create a pool description.
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            config: BTreeMap::new(),
        }
    }

    /// Add a configuration key.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Look up a configuration key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    /// Read a boolean configuration key.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the value is not a boolean.
    pub fn flag(&self, key: &str, default: bool) -> SiloResult<bool> {
        self.get(key).map_or(Ok(default), |value| parse_bool(key, value))
    }
}

/// Parse the boolean spellings accepted in configuration.
///
/// # Errors
///
/// Returns a validation error for anything else.
pub fn parse_bool(key: &str, value: &str) -> SiloResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(SiloError::validation(format!(
            "Invalid value for {key:?}: {value:?} is not a boolean"
        ))),
    }
}

/// Kind of storage volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    /// Root filesystem of an instance.
    Container,
    /// Unpacked image that containers are cloned from.
    Image,
    /// User-created volume.
    Custom,
    /// Point-in-time snapshot of a container.
    Snapshot,
}

impl VolumeType {
    /// Directory (and dataset) name for volumes of this type.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Container => "containers",
            Self::Image => "images",
            Self::Custom => "custom",
            Self::Snapshot => "snapshots",
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Identity of a storage volume: (pool, type, name).
///
/// Snapshot volumes are named `<parent>/<snapshot>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeRef {
    /// Pool the volume lives in.
    pub pool: String,
    /// Volume type.
    pub kind: VolumeType,
    /// Volume name.
    pub name: String,
}

impl VolumeRef {
    /// Create a volume reference.
    pub fn new(pool: impl Into<String>, kind: VolumeType, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            kind,
            name: name.into(),
        }
    }

    /// A container volume.
    pub fn container(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(pool, VolumeType::Container, name)
    }

    /// An image volume.
    pub fn image(pool: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self::new(pool, VolumeType::Image, fingerprint)
    }

    /// A custom volume.
    pub fn custom(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(pool, VolumeType::Custom, name)
    }

    /// A snapshot volume of container `parent`.
    pub fn snapshot(pool: impl Into<String>, parent: &str, snap: &str) -> Self {
        Self::new(
            pool,
            VolumeType::Snapshot,
            format!("{parent}{SNAPSHOT_DELIMITER}{snap}"),
        )
    }

    /// Split a snapshot volume into its parent container and snapshot name.
    ///
    /// # Errors
    ///
    /// Returns a validation error for non-snapshot volumes.
    pub fn split_snapshot(&self) -> SiloResult<(Self, SnapshotName)> {
        match (self.kind, self.name.split_once(SNAPSHOT_DELIMITER)) {
            (VolumeType::Snapshot, Some((parent, snap))) => Ok((
                Self::container(self.pool.clone(), parent),
                SnapshotName::user(snap),
            )),
            _ => Err(SiloError::validation(format!(
                "{self} is not a snapshot volume"
            ))),
        }
    }

    /// Dataset path relative to the pool's on-disk root.
    #[must_use]
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.kind.dir_name(), self.name)
    }

    /// Where the volume is mounted.
    #[must_use]
    pub fn mountpoint(&self, paths: &SiloPaths) -> PathBuf {
        match self.kind {
            VolumeType::Container => paths.container_mountpoint(&self.pool, &self.name),
            VolumeType::Image => paths.image_mountpoint(&self.pool, &self.name),
            VolumeType::Custom => paths.custom_mountpoint(&self.pool, &self.name),
            VolumeType::Snapshot => match self.name.split_once(SNAPSHOT_DELIMITER) {
                Some((parent, snap)) => paths.snapshot_mountpoint(&self.pool, parent, snap),
                None => paths.snapshots_dir(&self.pool, &self.name),
            },
        }
    }

    /// Lease key for a mount, unmount or image import of this volume.
    #[must_use]
    pub fn lease(&self, kind: LeaseKind) -> LeaseKey {
        LeaseKey {
            pool: self.pool.clone(),
            volume: self.relative_path(),
            kind,
        }
    }
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.relative_path())
    }
}

/// Name of a snapshot of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotName {
    /// Part of the user-visible history (`snapshot-<name>` on disk).
    User(String),
    /// Driver-internal point (`readonly`, `copy-*`, `migration-send-*`).
    Transient(String),
}

impl SnapshotName {
    /// A user snapshot.
    pub fn user(name: impl Into<String>) -> Self {
        Self::User(name.into())
    }

    /// The snapshot images are cloned from.
    #[must_use]
    pub fn readonly() -> Self {
        Self::Transient(READONLY_SNAPSHOT.to_string())
    }

    /// A fresh transient snapshot for a same-pool copy.
    #[must_use]
    pub fn copy() -> Self {
        Self::Transient(format!("{COPY_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// A fresh transient snapshot for a migration send.
    #[must_use]
    pub fn migration_send() -> Self {
        Self::Transient(format!("{MIGRATION_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Parse an on-disk snapshot name.
    #[must_use]
    pub fn from_disk(name: &str) -> Self {
        name.strip_prefix(USER_SNAPSHOT_PREFIX)
            .map_or_else(|| Self::Transient(name.to_string()), Self::user)
    }

    /// On-disk snapshot name.
    #[must_use]
    pub fn disk_name(&self) -> String {
        match self {
            Self::User(name) => format!("{USER_SNAPSHOT_PREFIX}{name}"),
            Self::Transient(name) => name.clone(),
        }
    }

    /// The name without any on-disk prefix.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::User(name) | Self::Transient(name) => name,
        }
    }

    /// Whether this is part of the user-visible history.
    #[must_use]
    pub const fn is_user(&self) -> bool {
        matches!(self, Self::User(_))
    }

    /// Whether this is a leftover migration transfer point.
    #[must_use]
    pub fn is_migration_send(&self) -> bool {
        matches!(self, Self::Transient(name) if name.starts_with(MIGRATION_PREFIX))
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.disk_name())
    }
}

/// Kind of single-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseKind {
    /// Physical mount.
    Mount,
    /// Physical unmount.
    Unmount,
    /// Building an image volume on first use.
    ImageCreate,
}

/// Identity of an in-flight mount, unmount or image import.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    /// Pool name.
    pub pool: String,
    /// Volume path relative to the pool root.
    pub volume: String,
    /// Operation kind.
    pub kind: LeaseKind,
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            LeaseKind::Mount => "mount",
            LeaseKind::Unmount => "unmount",
            LeaseKind::ImageCreate => "image import",
        };
        write!(f, "{kind} of {}/{}", self.pool, self.volume)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn volume_paths() {
        let paths = SiloPaths::with_root("/var/lib/silo");
        let vol = VolumeRef::container("default", "c1");
        assert_eq!(vol.relative_path(), "containers/c1");
        assert_eq!(vol.to_string(), "default/containers/c1");
        assert_eq!(
            vol.mountpoint(&paths),
            PathBuf::from("/var/lib/silo/storage-pools/default/containers/c1")
        );

        let snap = VolumeRef::snapshot("default", "c1", "snap0");
        assert_eq!(
            snap.mountpoint(&paths),
            PathBuf::from("/var/lib/silo/storage-pools/default/snapshots/c1/snap0")
        );
        let (parent, name) = snap.split_snapshot().unwrap();
        assert_eq!(parent, vol);
        assert_eq!(name, SnapshotName::user("snap0"));
        assert!(vol.split_snapshot().is_err());
    }

    #[test]
    fn snapshot_disk_names() {
        assert_eq!(SnapshotName::user("snap0").disk_name(), "snapshot-snap0");
        assert_eq!(SnapshotName::readonly().disk_name(), "readonly");
        assert_eq!(SnapshotName::from_disk("snapshot-snap0"), SnapshotName::user("snap0"));
        assert!(!SnapshotName::from_disk("copy-1234").is_user());
        assert!(SnapshotName::migration_send().is_migration_send());
        assert!(SnapshotName::copy().as_str().starts_with(COPY_PREFIX));
    }

    #[test]
    fn lease_keys_are_distinct_per_kind() {
        let vol = VolumeRef::container("default", "c1");
        assert_ne!(vol.lease(LeaseKind::Mount), vol.lease(LeaseKind::Unmount));
        assert_eq!(
            vol.lease(LeaseKind::Mount).to_string(),
            "mount of default/containers/c1"
        );
    }

    #[test]
    fn pool_flags() {
        let pool = StoragePool::new("default", "zfs")
            .with_config("volume.zfs.remove_snapshots", "true")
            .with_config("zfs.clone_copy", "maybe");
        assert!(pool.flag("volume.zfs.remove_snapshots", false).unwrap());
        assert!(!pool.flag("volume.zfs.use_refquota", false).unwrap());
        assert!(pool.flag("zfs.clone_copy", true).is_err());
    }

    proptest! {
        #[test]
        fn user_snapshots_survive_the_disk(name in "[a-z0-9][a-z0-9._-]{0,30}") {
            let snap = SnapshotName::user(name.clone());
            let back = SnapshotName::from_disk(&snap.disk_name());
            prop_assert!(back.is_user());
            prop_assert_eq!(back.as_str(), name.as_str());
        }

        #[test]
        fn unprefixed_disk_names_stay_transient(name in "(copy|migration-send|readonly)[a-z0-9-]{0,20}") {
            let snap = SnapshotName::from_disk(&name);
            prop_assert!(!snap.is_user());
            prop_assert_eq!(snap.disk_name(), name);
        }

        #[test]
        fn leases_follow_the_volume(a in "[a-z][a-z0-9]{0,10}", b in "[a-z][a-z0-9]{0,10}") {
            let left = VolumeRef::container("default", a.as_str()).lease(LeaseKind::Mount);
            let right = VolumeRef::custom("default", b.as_str()).lease(LeaseKind::Mount);
            prop_assert_ne!(left, right);
        }
    }
}
