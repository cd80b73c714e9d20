//! Custom storage volumes.
//!
//! Custom volumes live on a pool next to containers but have no catalog
//! row; the driver is the only record of them. Deleting one that still
//! backs a copy defers it the same way containers are deferred.

use std::sync::Arc;

use silo_common::{ByteSize, InstanceName, SiloError, SiloResult};
use silo_storage::{SnapshotName, StorageDriver, VolumeRef, VolumeType};

use super::Orchestrator;
use crate::events::{LifecycleEvent, now};
use crate::revert::Reverter;

/// Validate a custom volume name. Volume names follow instance names and
/// may not name a snapshot.
fn volume_name(name: &str) -> SiloResult<InstanceName> {
    let parsed = InstanceName::new(name)?;
    if parsed.is_snapshot() {
        return Err(SiloError::InvalidName {
            name: name.to_string(),
            reason: "volume names cannot contain '/'".to_string(),
        });
    }
    Ok(parsed)
}

impl Orchestrator {
    async fn existing_custom(
        &self,
        pool: &str,
        name: &str,
    ) -> SiloResult<(Arc<dyn StorageDriver>, VolumeRef)> {
        let driver = self.driver(pool)?;
        let vol = VolumeRef::custom(pool, volume_name(name)?.as_str());
        if !driver.volume_exists(&vol).await? {
            return Err(SiloError::VolumeNotFound {
                what: format!("custom volume {vol}"),
            });
        }
        Ok((driver, vol))
    }

    async fn vacant_custom(
        &self,
        pool: &str,
        name: &str,
    ) -> SiloResult<(Arc<dyn StorageDriver>, VolumeRef)> {
        let driver = self.driver(pool)?;
        let vol = VolumeRef::custom(pool, volume_name(name)?.as_str());
        if driver.volume_exists(&vol).await? {
            return Err(SiloError::AlreadyExists {
                what: format!("custom volume {vol}"),
            });
        }
        Ok((driver, vol))
    }

    /// Names of the custom volumes on `pool`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::PoolNotFound`] for unknown pools.
    pub async fn custom_volumes(&self, pool: &str) -> SiloResult<Vec<String>> {
        self.driver(pool)?;
        let root = self
            .paths
            .pool_mount_root(pool)
            .join(VolumeType::Custom.dir_name());
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Create an empty custom volume, optionally with a quota.
    ///
    /// # Errors
    ///
    /// Returns the first failure after removing the volume again.
    #[tracing::instrument(skip_all, fields(pool = %pool, volume = %name))]
    pub async fn custom_volume_create(
        &self,
        pool: &str,
        name: &str,
        size: Option<ByteSize>,
    ) -> SiloResult<VolumeRef> {
        let (driver, vol) = self.vacant_custom(pool, name).await?;

        let mut revert = Reverter::new();
        let result = Self::custom_volume_create_steps(&driver, &vol, size, &mut revert).await;
        revert.finish(result).await?;

        tracing::info!(volume = %vol, "Created custom volume");
        self.publish(LifecycleEvent::VolumeCreated {
            pool: pool.to_string(),
            name: name.to_string(),
            timestamp: now(),
        });
        Ok(vol)
    }

    async fn custom_volume_create_steps(
        driver: &Arc<dyn StorageDriver>,
        vol: &VolumeRef,
        size: Option<ByteSize>,
        revert: &mut Reverter,
    ) -> SiloResult<()> {
        driver.volume_create(vol).await?;
        Self::revert_volume(revert, driver, vol);
        if size.is_some() {
            driver.set_quota(vol, size).await?;
        }
        Ok(())
    }

    /// Copy a custom volume without its snapshots.
    ///
    /// Within a pool that supports clones the copy is a clone of a transient
    /// snapshot of the source, so the source is pinned until the copy goes.
    ///
    /// # Errors
    ///
    /// Returns the first failure after removing the partial copy.
    #[tracing::instrument(skip_all, fields(pool = %pool, source = %source, target = %target))]
    pub async fn custom_volume_copy(
        &self,
        pool: &str,
        source: &str,
        target_pool: Option<&str>,
        target: &str,
    ) -> SiloResult<VolumeRef> {
        let (src_driver, src_vol) = self.existing_custom(pool, source).await?;
        let (dst_driver, dst_vol) = self
            .vacant_custom(target_pool.unwrap_or(pool), target)
            .await?;

        let mut revert = Reverter::new();
        let result = self
            .copy_volume(&src_driver, &src_vol, &dst_driver, &dst_vol, &mut revert)
            .await;
        revert.finish(result).await?;

        tracing::info!(src = %src_vol, dest = %dst_vol, "Copied custom volume");
        self.publish(LifecycleEvent::VolumeCreated {
            pool: dst_vol.pool.clone(),
            name: dst_vol.name.clone(),
            timestamp: now(),
        });
        Ok(dst_vol)
    }

    /// Delete a custom volume and its snapshots, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::VolumeNotFound`] for unknown volumes, otherwise
    /// propagates driver errors.
    #[tracing::instrument(skip_all, fields(pool = %pool, volume = %name))]
    pub async fn custom_volume_delete(&self, pool: &str, name: &str) -> SiloResult<()> {
        let (driver, vol) = self.existing_custom(pool, name).await?;

        let snapshots = driver.snapshot_list(&vol).await?;
        for snap in snapshots.iter().rev().filter(|snap| snap.is_user()) {
            driver.snapshot_delete(&vol, snap).await?;
        }
        driver.volume_delete(&vol).await?;

        tracing::info!(volume = %vol, snapshots = snapshots.len(), "Deleted custom volume");
        self.publish(LifecycleEvent::VolumeDeleted {
            pool: pool.to_string(),
            name: name.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Rename a custom volume together with its snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::AlreadyExists`] if `new_name` is taken.
    #[tracing::instrument(skip_all, fields(pool = %pool, volume = %name, new_name = %new_name))]
    pub async fn custom_volume_rename(
        &self,
        pool: &str,
        name: &str,
        new_name: &str,
    ) -> SiloResult<()> {
        let (driver, vol) = self.existing_custom(pool, name).await?;
        self.vacant_custom(pool, new_name).await?;

        driver.volume_rename(&vol, new_name).await?;

        tracing::info!(volume = %vol, new_name, "Renamed custom volume");
        self.publish(LifecycleEvent::VolumeRenamed {
            pool: pool.to_string(),
            old: name.to_string(),
            new: new_name.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Take a user snapshot of a custom volume.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::AlreadyExists`] for a duplicate snapshot name.
    #[tracing::instrument(skip_all, fields(pool = %pool, volume = %name, snapshot = %snapshot))]
    pub async fn custom_volume_snapshot(
        &self,
        pool: &str,
        name: &str,
        snapshot: &str,
    ) -> SiloResult<()> {
        let (driver, vol) = self.existing_custom(pool, name).await?;
        let full = volume_name(name)?.snapshot_of(snapshot)?;

        let snap = SnapshotName::user(snapshot);
        if driver.snapshot_list(&vol).await?.contains(&snap) {
            return Err(SiloError::AlreadyExists {
                what: format!("snapshot {full} on pool {pool}"),
            });
        }
        driver.snapshot_create(&vol, &snap).await?;

        tracing::info!(volume = %vol, %snap, "Created custom volume snapshot");
        self.publish(LifecycleEvent::SnapshotCreated {
            name: full.to_string(),
            stateful: false,
            timestamp: now(),
        });
        Ok(())
    }

    /// Delete a user snapshot of a custom volume.
    ///
    /// A snapshot that backs a copy leaves the user history but stays on
    /// disk until the copy is gone.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::VolumeNotFound`] for unknown snapshots.
    #[tracing::instrument(skip_all, fields(pool = %pool, volume = %name, snapshot = %snapshot))]
    pub async fn custom_volume_snapshot_delete(
        &self,
        pool: &str,
        name: &str,
        snapshot: &str,
    ) -> SiloResult<()> {
        let (driver, vol) = self.existing_custom(pool, name).await?;
        let full = volume_name(name)?.snapshot_of(snapshot)?;

        let snap = SnapshotName::user(snapshot);
        if !driver.snapshot_list(&vol).await?.contains(&snap) {
            return Err(SiloError::VolumeNotFound {
                what: format!("snapshot {full} on pool {pool}"),
            });
        }
        driver.snapshot_delete(&vol, &snap).await?;

        self.publish(LifecycleEvent::SnapshotDeleted {
            name: full.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// User snapshot names of a custom volume, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::VolumeNotFound`] for unknown volumes.
    pub async fn custom_volume_snapshots(
        &self,
        pool: &str,
        name: &str,
    ) -> SiloResult<Vec<String>> {
        let (driver, vol) = self.existing_custom(pool, name).await?;
        Ok(driver
            .snapshot_list(&vol)
            .await?
            .into_iter()
            .filter(SnapshotName::is_user)
            .map(|snap| snap.as_str().to_string())
            .collect())
    }
}
