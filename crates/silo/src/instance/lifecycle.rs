//! Delete, rename, restore and snapshot management of existing instances.

use silo_common::{Fingerprint, InstanceName, SiloError, SiloResult};
use silo_storage::{SnapshotName, StorageDriver, VolumeRef};

use super::Orchestrator;
use crate::catalog::InstanceRecord;
use crate::events::{LifecycleEvent, now};
use crate::revert::Reverter;

/// Pool key allowing a restore to discard snapshots newer than its target.
const REMOVE_SNAPSHOTS_KEY: &str = "volume.zfs.remove_snapshots";

fn snapshot_part(record: &InstanceRecord) -> SiloResult<&str> {
    record
        .name
        .snapshot()
        .ok_or_else(|| SiloError::internal(format!("{} has no snapshot part", record.name)))
}

impl Orchestrator {
    /// Delete an instance: its snapshots newest first, then its volume,
    /// then its row. Snapshot names are delegated to
    /// [`Orchestrator::snapshot_delete`].
    ///
    /// Volumes that still back clones are soft-deleted by the driver and
    /// reclaimed once their last dependent goes away.
    ///
    /// # Errors
    ///
    /// Returns the first failure; whatever was already removed stays removed.
    #[tracing::instrument(skip_all, fields(instance = %name))]
    pub async fn delete(&self, name: &InstanceName) -> SiloResult<()> {
        if name.is_snapshot() {
            return self.snapshot_delete(name).await;
        }
        let record = self.catalog.get(name).await?;
        let driver = self.driver(&record.pool)?;
        let vol = VolumeRef::container(&record.pool, name.as_str());

        let snapshots = self.catalog.snapshots(name).await?;
        for snap in snapshots.iter().rev() {
            driver
                .snapshot_delete(&vol, &SnapshotName::user(snapshot_part(snap)?))
                .await?;
            self.catalog.delete(&snap.name).await?;
        }

        driver.volume_delete(&vol).await?;
        self.catalog.delete(name).await?;

        tracing::info!(snapshots = snapshots.len(), "Deleted instance");
        self.publish(LifecycleEvent::InstanceDeleted {
            name: name.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Delete one snapshot and its row.
    ///
    /// # Errors
    ///
    /// Returns a validation error for container names.
    #[tracing::instrument(skip_all, fields(snapshot = %name))]
    pub async fn snapshot_delete(&self, name: &InstanceName) -> SiloResult<()> {
        let Some(snap) = name.snapshot() else {
            return Err(SiloError::validation(format!("{name} is not a snapshot")));
        };
        let record = self.catalog.get(name).await?;
        let driver = self.driver(&record.pool)?;
        let vol = VolumeRef::container(&record.pool, name.parent());

        driver
            .snapshot_delete(&vol, &SnapshotName::user(snap))
            .await?;
        self.catalog.delete(name).await?;

        tracing::info!("Deleted snapshot");
        self.publish(LifecycleEvent::SnapshotDeleted {
            name: name.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Rename a container together with the rows of its snapshots.
    /// Snapshot names are delegated to [`Orchestrator::snapshot_rename`].
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::AlreadyExists`] if `new` is taken, or the first
    /// failure after renaming everything back.
    #[tracing::instrument(skip_all, fields(instance = %old, new = %new))]
    pub async fn rename(&self, old: &InstanceName, new: &InstanceName) -> SiloResult<()> {
        if old.is_snapshot() {
            return self.snapshot_rename(old, new).await;
        }
        if new.is_snapshot() {
            return Err(SiloError::validation(format!(
                "Cannot rename container {old} to snapshot name {new}"
            )));
        }
        match self.catalog.get(new).await {
            Ok(_) => {
                return Err(SiloError::AlreadyExists {
                    what: format!("instance {new}"),
                });
            }
            Err(SiloError::InstanceNotFound { .. }) => {}
            Err(err) => return Err(err),
        }

        let mut revert = Reverter::new();
        let result = self.rename_steps(old, new, &mut revert).await;
        revert.finish(result).await?;

        tracing::info!("Renamed instance");
        self.publish(LifecycleEvent::InstanceRenamed {
            old: old.to_string(),
            new: new.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    async fn rename_steps(
        &self,
        old: &InstanceName,
        new: &InstanceName,
        revert: &mut Reverter,
    ) -> SiloResult<()> {
        let record = self.catalog.get(old).await?;
        let driver = self.driver(&record.pool)?;
        let snapshots = self.catalog.snapshots(old).await?;

        let vol = VolumeRef::container(&record.pool, old.as_str());
        driver.volume_rename(&vol, new.as_str()).await?;
        {
            let driver = driver.clone();
            let renamed = VolumeRef::container(&record.pool, new.as_str());
            let old = old.to_string();
            revert.add(format!("rename volume back to {old}"), move || async move {
                driver.volume_rename(&renamed, &old).await
            });
        }

        self.rename_row(old, new, revert).await?;
        for snap in &snapshots {
            let renamed = new.snapshot_of(snapshot_part(snap)?)?;
            self.rename_row(&snap.name, &renamed, revert).await?;
        }
        Ok(())
    }

    async fn rename_row(
        &self,
        old: &InstanceName,
        new: &InstanceName,
        revert: &mut Reverter,
    ) -> SiloResult<()> {
        self.catalog.rename(old, new).await?;
        let catalog = self.catalog.clone();
        let (old, new) = (old.clone(), new.clone());
        revert.add(format!("rename row {new} back"), move || async move {
            catalog.rename(&new, &old).await
        });
        Ok(())
    }

    /// Rename a snapshot within its container.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `new` belongs to another container.
    #[tracing::instrument(skip_all, fields(snapshot = %old, new = %new))]
    pub async fn snapshot_rename(&self, old: &InstanceName, new: &InstanceName) -> SiloResult<()> {
        let (Some(snap), Some(new_snap)) = (old.snapshot(), new.snapshot()) else {
            return Err(SiloError::validation(format!(
                "Cannot rename snapshot {old} to container name {new}"
            )));
        };
        if old.parent() != new.parent() {
            return Err(SiloError::validation(format!(
                "Snapshot {old} cannot move to another instance ({new})"
            )));
        }
        let record = self.catalog.get(old).await?;
        let driver = self.driver(&record.pool)?;
        let vol = VolumeRef::container(&record.pool, old.parent());

        driver
            .snapshot_rename(&vol, &SnapshotName::user(snap), new_snap)
            .await?;
        if let Err(err) = self.catalog.rename(old, new).await {
            if let Err(undo) = driver
                .snapshot_rename(&vol, &SnapshotName::user(new_snap), snap)
                .await
            {
                tracing::warn!(error = %undo, "Failed to rename snapshot back");
            }
            return Err(err);
        }

        tracing::info!("Renamed snapshot");
        self.publish(LifecycleEvent::SnapshotRenamed {
            old: old.to_string(),
            new: new.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Roll a container back to one of its snapshots.
    ///
    /// On technologies that can only roll back to the latest snapshot, the
    /// newer snapshots are deleted first, which the pool must allow through
    /// `volume.zfs.remove_snapshots`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown snapshots, or when newer
    /// snapshots exist and may not be removed.
    #[tracing::instrument(skip_all, fields(instance = %name, snapshot))]
    pub async fn restore(&self, name: &InstanceName, snapshot: &str) -> SiloResult<()> {
        let record = self.catalog.get(name).await?;
        let driver = self.driver(&record.pool)?;
        let target = name.snapshot_of(snapshot)?;

        let snapshots = self.catalog.snapshots(name).await?;
        let Some(position) = snapshots.iter().position(|snap| snap.name == target) else {
            return Err(SiloError::validation(format!(
                "{name} has no snapshot {snapshot}"
            )));
        };
        let newer = &snapshots[position + 1..];

        let vol = VolumeRef::container(&record.pool, name.as_str());
        if driver.capabilities().restore_latest_only {
            Self::ensure_rollback_clear(driver.as_ref(), &vol, snapshot).await?;
        }
        if !newer.is_empty() && driver.capabilities().restore_latest_only {
            if !driver.pool().flag(REMOVE_SNAPSHOTS_KEY, false)? {
                return Err(SiloError::validation(format!(
                    "Snapshot {snapshot} is not the latest of {name}; set {REMOVE_SNAPSHOTS_KEY} \
                     to discard the {} newer snapshot(s)",
                    newer.len()
                )));
            }
            for snap in newer.iter().rev() {
                driver
                    .snapshot_delete(&vol, &SnapshotName::user(snapshot_part(snap)?))
                    .await?;
                self.catalog.delete(&snap.name).await?;
            }
        }

        driver
            .snapshot_restore(&vol, &SnapshotName::user(snapshot))
            .await?;

        tracing::info!(discarded = newer.len(), "Restored instance");
        self.publish(LifecycleEvent::InstanceRestored {
            name: name.to_string(),
            snapshot: snapshot.to_string(),
            timestamp: now(),
        });
        Ok(())
    }

    /// Refuse a rollback that would have to go through a snapshot backing a
    /// clone. Newer user snapshots are fine as long as nothing was cloned
    /// from them, transient ones never are.
    async fn ensure_rollback_clear(
        driver: &dyn StorageDriver,
        vol: &VolumeRef,
        snapshot: &str,
    ) -> SiloResult<()> {
        let on_disk = driver.snapshot_list(vol).await?;
        let wanted = SnapshotName::user(snapshot);
        let Some(position) = on_disk.iter().position(|snap| *snap == wanted) else {
            return Ok(());
        };
        for snap in &on_disk[position + 1..] {
            if !snap.is_user() || !driver.snapshot_removable(vol, snap).await? {
                return Err(SiloError::validation(format!(
                    "Cannot restore {} to {snapshot}: newer snapshot {snap} still backs a copy",
                    vol.name
                )));
            }
        }
        Ok(())
    }

    /// Bytes used by an instance's volume.
    ///
    /// # Errors
    ///
    /// Propagates catalog and driver errors.
    pub async fn usage(&self, name: &InstanceName) -> SiloResult<u64> {
        let record = self.catalog.get(name).await?;
        let driver = self.driver(&record.pool)?;
        driver.volume_usage(&Self::volume_of(&record)).await
    }

    /// Remove an image volume from a pool.
    ///
    /// Images that still have clones are soft-deleted.
    ///
    /// # Errors
    ///
    /// Propagates driver errors.
    #[tracing::instrument(skip_all, fields(image = %fingerprint))]
    pub async fn image_delete(&self, pool: &str, fingerprint: &Fingerprint) -> SiloResult<()> {
        self.driver(pool)?.image_delete(fingerprint).await
    }
}
