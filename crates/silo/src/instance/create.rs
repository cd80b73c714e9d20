//! Creation pathways.

use std::path::Path;
use std::sync::Arc;

use silo_common::{Fingerprint, InstanceName, SiloError, SiloResult};
use silo_storage::filesystem;
use silo_storage::migration::{FramedChannel, MigrationSink, MigrationSource, NoopObserver};
use silo_storage::{LeaseKind, SnapshotName, StorageDriver, VolumeRef, VolumeType};

use super::{Orchestrator, STATE_DIR};
use crate::args::{InstanceArgs, InstanceKind};
use crate::catalog::InstanceRecord;
use crate::events::{LifecycleEvent, now};
use crate::hooks::TemplateTrigger;
use crate::revert::Reverter;

/// Buffer of the in-process stream joining both ends of a local copy.
const LOCAL_STREAM_BUFFER: usize = 256 * 1024;

fn ensure_container(args: &InstanceArgs) -> SiloResult<()> {
    if args.kind == InstanceKind::Snapshot {
        return Err(SiloError::validation(format!(
            "{} is a snapshot name; use the snapshot pathway",
            args.name
        )));
    }
    Ok(())
}

/// Whether an error only reports that the other end of a stream went away.
pub(super) fn is_transport_error(err: &SiloError) -> bool {
    matches!(err, SiloError::Migration { .. } | SiloError::Io(_))
}

/// Pick the root cause out of the two ends of a transfer.
pub(super) fn first_cause(sent: SiloResult<()>, received: SiloResult<()>) -> SiloResult<()> {
    match (sent, received) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        (Err(sent), Err(received)) if is_transport_error(&sent) => Err(received),
        (Err(sent), Err(_)) => Err(sent),
    }
}

impl Orchestrator {
    fn pool_for(&self, args: &InstanceArgs) -> String {
        args.root_pool().unwrap_or(&self.default_pool).to_string()
    }

    /// Create a container with an empty volume.
    ///
    /// # Errors
    ///
    /// Returns the first failure after reverting the row and the volume.
    #[tracing::instrument(skip_all, fields(instance = %args.name))]
    pub async fn create_empty(&self, args: InstanceArgs) -> SiloResult<InstanceRecord> {
        args.validate()?;
        ensure_container(&args)?;

        let mut revert = Reverter::new();
        let result = self.create_empty_steps(&args, &mut revert).await;
        revert.finish(result).await
    }

    async fn create_empty_steps(
        &self,
        args: &InstanceArgs,
        revert: &mut Reverter,
    ) -> SiloResult<InstanceRecord> {
        let pool = self.pool_for(args);
        let driver = self.driver(&pool)?;
        let record = self
            .insert_record(InstanceRecord::from_args(args, &pool), revert)
            .await?;

        let vol = VolumeRef::container(&pool, record.name.as_str());
        driver.volume_create(&vol).await?;
        Self::revert_volume(revert, &driver, &vol);

        self.finish_container(&driver, &vol, &record, args, false, TemplateTrigger::Create)
            .await?;
        tracing::info!(pool = %pool, "Created empty instance");
        self.publish_created(&record);
        Ok(record)
    }

    /// Create a container as a clone of an image.
    ///
    /// The image volume is built from its tarball on first use in the pool;
    /// concurrent first uses share one import.
    ///
    /// # Errors
    ///
    /// Returns the first failure after reverting the row and the volume. An
    /// image volume built by this call is kept.
    #[tracing::instrument(skip_all, fields(instance = %args.name))]
    pub async fn create_from_image(&self, args: InstanceArgs) -> SiloResult<InstanceRecord> {
        args.validate()?;
        ensure_container(&args)?;
        let Some(reference) = args.base_image.clone() else {
            return Err(SiloError::validation(format!(
                "No image given for {}",
                args.name
            )));
        };
        let (fingerprint, tarball) = self.images.resolve(&reference).await?;
        let args = args.with_image(fingerprint.clone());

        let mut revert = Reverter::new();
        let result = self
            .create_from_image_steps(&args, &fingerprint, &tarball, &mut revert)
            .await;
        let record = revert.finish(result).await?;

        if let Err(err) = self.images.mark_used(&fingerprint).await {
            tracing::warn!(image = %fingerprint, error = %err, "Failed to record image use");
        }
        Ok(record)
    }

    async fn create_from_image_steps(
        &self,
        args: &InstanceArgs,
        fingerprint: &Fingerprint,
        tarball: &Path,
        revert: &mut Reverter,
    ) -> SiloResult<InstanceRecord> {
        let pool = self.pool_for(args);
        let driver = self.driver(&pool)?;
        let record = self
            .insert_record(InstanceRecord::from_args(args, &pool), revert)
            .await?;

        self.ensure_image(&driver, &pool, fingerprint, tarball).await?;

        let image = VolumeRef::image(&pool, fingerprint.as_str());
        let vol = VolumeRef::container(&pool, record.name.as_str());
        driver
            .volume_clone(&image, &SnapshotName::readonly(), &vol)
            .await?;
        Self::revert_volume(revert, &driver, &vol);

        self.finish_container(&driver, &vol, &record, args, true, TemplateTrigger::Create)
            .await?;
        tracing::info!(pool = %pool, image = %fingerprint, "Created instance from image");
        self.publish_created(&record);
        Ok(record)
    }

    async fn ensure_image(
        &self,
        driver: &Arc<dyn StorageDriver>,
        pool: &str,
        fingerprint: &Fingerprint,
        tarball: &Path,
    ) -> SiloResult<()> {
        let image = VolumeRef::image(pool, fingerprint.as_str());
        self.coordinator
            .run(image.lease(LeaseKind::ImageCreate), || async {
                if driver.volume_exists(&image).await? {
                    return Ok(false);
                }
                driver.image_create(fingerprint, tarball).await?;
                Ok(true)
            })
            .await?;
        Ok(())
    }

    /// Copy `source` (a container or a snapshot) to `target`, keeping its
    /// configuration.
    ///
    /// The copy lands on `pool` if given, else on the source's pool.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::create_as_copy`].
    pub async fn copy(
        &self,
        source: &InstanceName,
        target: InstanceName,
        pool: Option<&str>,
        instance_only: bool,
    ) -> SiloResult<InstanceRecord> {
        let record = self.catalog.get(source).await?;
        let mut args = record.to_args(target).with_stateful(false);
        if let Some(pool) = pool {
            args = args.with_root_pool(pool);
        }
        self.create_as_copy(args, source, instance_only).await
    }

    /// Create a container as a copy of `source`.
    ///
    /// Without history (or with `instance_only`), a same-pool copy on a
    /// technology with clones clones a transient snapshot of the source;
    /// anything else is created empty and filled by a file copy. With
    /// history, every snapshot is replicated oldest first and gets its own
    /// row.
    ///
    /// # Errors
    ///
    /// Returns the first failure after reverting every row and volume the
    /// copy created.
    #[tracing::instrument(skip_all, fields(instance = %args.name, source = %source))]
    pub async fn create_as_copy(
        &self,
        args: InstanceArgs,
        source: &InstanceName,
        instance_only: bool,
    ) -> SiloResult<InstanceRecord> {
        args.validate()?;
        ensure_container(&args)?;
        let source = self.catalog.get(source).await?;

        let mut revert = Reverter::new();
        let result = self
            .create_as_copy_steps(&args, &source, instance_only, &mut revert)
            .await;
        revert.finish(result).await
    }

    async fn create_as_copy_steps(
        &self,
        args: &InstanceArgs,
        source: &InstanceRecord,
        instance_only: bool,
        revert: &mut Reverter,
    ) -> SiloResult<InstanceRecord> {
        let pool = args
            .root_pool()
            .map_or_else(|| source.pool.clone(), str::to_string);
        let src_driver = self.driver(&source.pool)?;
        let dst_driver = self.driver(&pool)?;
        let record = self
            .insert_record(InstanceRecord::from_args(args, &pool), revert)
            .await?;

        let src_vol = Self::volume_of(source);
        let dst_vol = VolumeRef::container(&pool, record.name.as_str());

        let history = if instance_only || source.is_snapshot() {
            Vec::new()
        } else {
            self.catalog.snapshots(&source.name).await?
        };

        if history.is_empty() {
            self.copy_volume(&src_driver, &src_vol, &dst_driver, &dst_vol, revert)
                .await?;
        } else {
            let mut snapshots = Vec::with_capacity(history.len());
            for snap in &history {
                let Some(snap_name) = snap.name.snapshot() else {
                    continue;
                };
                let replica = snap.to_args(record.name.snapshot_of(snap_name)?);
                self.insert_record(InstanceRecord::from_args(&replica, &pool), revert)
                    .await?;
                snapshots.push(snap_name.to_string());
            }

            dst_driver.volume_create(&dst_vol).await?;
            Self::revert_volume(revert, &dst_driver, &dst_vol);

            if src_driver.name() == dst_driver.name() {
                self.replicate(&src_driver, &src_vol, &dst_driver, &dst_vol, snapshots)
                    .await?;
            } else {
                self.copy_history(&src_driver, &src_vol, &dst_driver, &dst_vol, &snapshots)
                    .await?;
            }
        }

        self.finish_container(&dst_driver, &dst_vol, &record, args, false, TemplateTrigger::Copy)
            .await?;
        tracing::info!(pool = %pool, snapshots = history.len(), "Copied instance");
        self.publish_created(&record);
        Ok(record)
    }

    /// Copy a single volume without history.
    pub(super) async fn copy_volume(
        &self,
        src_driver: &Arc<dyn StorageDriver>,
        src_vol: &VolumeRef,
        dst_driver: &Arc<dyn StorageDriver>,
        dst_vol: &VolumeRef,
        revert: &mut Reverter,
    ) -> SiloResult<()> {
        let clone = src_vol.pool == dst_vol.pool
            && src_driver.capabilities().clone
            && src_driver.pool().flag("zfs.clone_copy", true)?;

        if !clone {
            dst_driver.volume_create(dst_vol).await?;
            Self::revert_volume(revert, dst_driver, dst_vol);
            return self
                .copy_contents(src_driver, src_vol, dst_driver, dst_vol)
                .await;
        }

        if src_vol.kind == VolumeType::Snapshot {
            let (parent, snap) = src_vol.split_snapshot()?;
            src_driver.volume_clone(&parent, &snap, dst_vol).await?;
        } else {
            let copy = SnapshotName::copy();
            src_driver.snapshot_create(src_vol, &copy).await?;
            if let Err(err) = src_driver.volume_clone(src_vol, &copy, dst_vol).await {
                if let Err(cleanup) = src_driver.snapshot_delete(src_vol, &copy).await {
                    tracing::warn!(snapshot = %copy, error = %cleanup, "Failed to remove copy snapshot");
                }
                return Err(err);
            }
        }
        Self::revert_volume(revert, dst_driver, dst_vol);
        tracing::debug!(src = %src_vol, dest = %dst_vol, "Cloned volume");
        Ok(())
    }

    /// Replace the content of `dst_vol` with that of `src_vol`.
    async fn copy_contents(
        &self,
        src_driver: &Arc<dyn StorageDriver>,
        src_vol: &VolumeRef,
        dst_driver: &Arc<dyn StorageDriver>,
        dst_vol: &VolumeRef,
    ) -> SiloResult<()> {
        let (src, src_mounted) = self.expose(src_driver, src_vol).await?;
        let result = async {
            let (dst, _) = self.expose(dst_driver, dst_vol).await?;
            filesystem::blocking(move || {
                filesystem::clear_dir(&dst)?;
                filesystem::copy_tree(&src, &dst)
            })
            .await
        }
        .await;
        Self::conceal(src_driver, src_vol, src_mounted).await;
        result
    }

    /// Replicate history across technologies: each snapshot's content is
    /// copied in and snapshotted, then the live content is copied.
    async fn copy_history(
        &self,
        src_driver: &Arc<dyn StorageDriver>,
        src_vol: &VolumeRef,
        dst_driver: &Arc<dyn StorageDriver>,
        dst_vol: &VolumeRef,
        snapshots: &[String],
    ) -> SiloResult<()> {
        for name in snapshots {
            let snap_vol = VolumeRef::snapshot(&src_vol.pool, &src_vol.name, name);
            self.copy_contents(src_driver, &snap_vol, dst_driver, dst_vol)
                .await?;
            dst_driver
                .snapshot_create(dst_vol, &SnapshotName::user(name.as_str()))
                .await?;
        }
        self.copy_contents(src_driver, src_vol, dst_driver, dst_vol)
            .await
    }

    /// Replicate history on the same technology by joining a migration
    /// source and sink over an in-process stream.
    async fn replicate(
        &self,
        src_driver: &Arc<dyn StorageDriver>,
        src_vol: &VolumeRef,
        dst_driver: &Arc<dyn StorageDriver>,
        dst_vol: &VolumeRef,
        snapshots: Vec<String>,
    ) -> SiloResult<()> {
        let (near, far) = tokio::io::duplex(LOCAL_STREAM_BUFFER);
        let mut source = MigrationSource::new(src_driver.clone(), src_vol.clone(), snapshots.clone())?;
        let sink = MigrationSink::new(dst_driver.clone(), dst_vol.clone(), snapshots, false);

        let send = async {
            let mut channel = FramedChannel::new(near);
            let result = source.send_while_running(&mut channel).await;
            source.cleanup().await;
            result
        };
        let receive = async {
            let mut channel = FramedChannel::new(far);
            sink.receive(&mut channel, &mut NoopObserver).await
        };

        let (sent, received) = tokio::join!(send, receive);
        first_cause(sent, received)
    }

    /// Create a snapshot of a container.
    ///
    /// A stateful snapshot checkpoints the running instance into the
    /// volume first, so the dump is captured by the snapshot; the dump is
    /// then removed from the live volume.
    ///
    /// # Errors
    ///
    /// Returns a validation error for stateful snapshots of stopped
    /// instances, [`SiloError::Unsupported`] without a checkpoint tool, or
    /// the first storage failure after reverting.
    #[tracing::instrument(skip(self))]
    pub async fn create_as_snapshot(
        &self,
        name: InstanceName,
        stateful: bool,
    ) -> SiloResult<InstanceRecord> {
        let Some(snap) = name.snapshot().map(str::to_string) else {
            return Err(SiloError::validation(format!(
                "{name} is not a snapshot name"
            )));
        };
        let parent = self.catalog.get(&InstanceName::new(name.parent())?).await?;
        let args = parent.to_args(name).with_stateful(stateful);
        args.validate()?;

        let mut revert = Reverter::new();
        let result = self
            .create_as_snapshot_steps(&args, &parent, &snap, &mut revert)
            .await;
        revert.finish(result).await
    }

    async fn create_as_snapshot_steps(
        &self,
        args: &InstanceArgs,
        parent: &InstanceRecord,
        snap: &str,
        revert: &mut Reverter,
    ) -> SiloResult<InstanceRecord> {
        let driver = self.driver(&parent.pool)?;
        let record = self
            .insert_record(InstanceRecord::from_args(args, &parent.pool), revert)
            .await?;

        let vol = VolumeRef::container(&parent.pool, parent.name.as_str());
        let snap_name = SnapshotName::user(snap);
        if args.stateful {
            self.checkpointed_snapshot(&driver, &vol, &parent.name, &snap_name)
                .await?;
        } else {
            driver.snapshot_create(&vol, &snap_name).await?;
        }
        {
            let driver = driver.clone();
            let vol = vol.clone();
            let snap_name = snap_name.clone();
            revert.add(format!("delete snapshot {snap_name}"), move || async move {
                driver.snapshot_delete(&vol, &snap_name).await
            });
        }

        tracing::info!(snapshot = %record.name, stateful = args.stateful, "Created snapshot");
        self.publish(LifecycleEvent::SnapshotCreated {
            name: record.name.to_string(),
            stateful: args.stateful,
            timestamp: now(),
        });
        Ok(record)
    }

    async fn checkpointed_snapshot(
        &self,
        driver: &Arc<dyn StorageDriver>,
        vol: &VolumeRef,
        instance: &InstanceName,
        snap: &SnapshotName,
    ) -> SiloResult<()> {
        if !self.runtime.is_running(instance).await? {
            return Err(SiloError::validation(format!(
                "Unable to create a stateful snapshot: {instance} isn't running"
            )));
        }
        if !self.runtime.checkpoint_supported() {
            return Err(SiloError::Unsupported {
                feature: "stateful snapshots without a checkpoint tool".to_string(),
            });
        }

        let (mountpoint, mounted) = self.expose(driver, vol).await?;
        let state = mountpoint.join(STATE_DIR);
        let result = async {
            tokio::fs::create_dir_all(&state).await?;
            self.runtime.checkpoint(instance, &state, false).await?;
            driver.snapshot_create(vol, snap).await
        }
        .await;

        if let Err(err) = filesystem::remove_tree(&state).await {
            tracing::warn!(dir = %state.display(), error = %err, "Failed to remove checkpoint state");
        }
        Self::conceal(driver, vol, mounted).await;
        result
    }

    /// Mount a new container and run its post-storage steps.
    ///
    /// Containers stay mounted once created.
    pub(super) async fn finish_container(
        &self,
        driver: &Arc<dyn StorageDriver>,
        vol: &VolumeRef,
        record: &InstanceRecord,
        args: &InstanceArgs,
        shift: bool,
        trigger: TemplateTrigger,
    ) -> SiloResult<()> {
        let (mountpoint, _) = self.expose(driver, vol).await?;
        if shift && !args.is_privileged() {
            self.hooks.shift_rootfs(record, &mountpoint).await?;
        }
        if let Some(size) = args.root_size()? {
            driver.set_quota(vol, Some(size)).await?;
        }
        self.hooks.apply_template(record, &mountpoint, trigger).await
    }

    pub(super) fn publish_created(&self, record: &InstanceRecord) {
        self.publish(LifecycleEvent::InstanceCreated {
            name: record.name.to_string(),
            pool: record.pool.clone(),
            timestamp: now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_wins_over_transport_errors() {
        let tool = || SiloError::Tool {
            command: "zfs receive".to_string(),
            status: Some(1),
            output: "cannot receive".to_string(),
        };
        let hangup = || SiloError::migration("peer closed the stream mid-diff");

        assert!(first_cause(Ok(()), Ok(())).is_ok());
        assert!(matches!(
            first_cause(Err(hangup()), Err(tool())),
            Err(SiloError::Tool { .. })
        ));
        assert!(matches!(
            first_cause(Err(tool()), Err(hangup())),
            Err(SiloError::Tool { .. })
        ));
        assert!(matches!(
            first_cause(Ok(()), Err(hangup())),
            Err(SiloError::Migration { .. })
        ));
    }
}
