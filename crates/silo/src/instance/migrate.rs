//! Both ends of instance migration.

use std::sync::Arc;

use async_trait::async_trait;
use silo_common::{InstanceName, SiloError, SiloResult};
use silo_storage::filesystem;
use silo_storage::migration::{
    DiffChannel, MigrationHeader, MigrationSink, MigrationSource, ReceiveObserver,
};
use silo_storage::{StorageDriver, VolumeRef};

use super::{Orchestrator, STATE_DIR};
use crate::args::InstanceArgs;
use crate::catalog::{Catalog, InstanceRecord};
use crate::events::{LifecycleEvent, now};
use crate::hooks::TemplateTrigger;
use crate::revert::Reverter;

/// Creates the row of each snapshot as its diff arrives.
struct SnapshotRows {
    catalog: Arc<dyn Catalog>,
    parent: InstanceRecord,
    created: Vec<InstanceName>,
}

#[async_trait]
impl ReceiveObserver for SnapshotRows {
    async fn snapshot_arriving(&mut self, name: &str) -> SiloResult<()> {
        let snap = self.parent.name.snapshot_of(name)?;
        let args = self.parent.to_args(snap.clone());
        self.catalog
            .create(InstanceRecord::from_args(&args, &self.parent.pool))
            .await?;
        self.created.push(snap);
        Ok(())
    }
}

impl Orchestrator {
    /// Stream an instance to a migration peer: a header, then each
    /// snapshot oldest first, then the live state.
    ///
    /// A live send checkpoints the running instance (stopping it) after the
    /// first pass and sends a second, final diff carrying the dump.
    ///
    /// # Errors
    ///
    /// Returns a validation error for live sends of stopped instances or
    /// snapshots, [`SiloError::Unsupported`] without a checkpoint tool, or
    /// the first storage or channel failure. Transient snapshots are removed
    /// on every exit path.
    #[tracing::instrument(skip_all, fields(instance = %name, live))]
    pub async fn migrate_send(
        &self,
        name: &InstanceName,
        live: bool,
        channel: &mut dyn DiffChannel,
    ) -> SiloResult<()> {
        let record = self.catalog.get(name).await?;
        let driver = self.driver(&record.pool)?;

        if live {
            if record.is_snapshot() {
                return Err(SiloError::validation(format!(
                    "Snapshot {name} cannot be migrated live"
                )));
            }
            if !self.runtime.is_running(name).await? {
                return Err(SiloError::validation(format!(
                    "Unable to migrate {name} live: it isn't running"
                )));
            }
            if !self.runtime.checkpoint_supported() {
                return Err(SiloError::Unsupported {
                    feature: "live migration without a checkpoint tool".to_string(),
                });
            }
        }

        let snapshots = if record.is_snapshot() {
            Vec::new()
        } else {
            self.catalog
                .snapshots(name)
                .await?
                .iter()
                .filter_map(|snap| snap.name.snapshot().map(str::to_string))
                .collect()
        };

        let vol = Self::volume_of(&record);
        let mut source = MigrationSource::new(driver.clone(), vol.clone(), snapshots)?;
        let result = self
            .send_steps(&driver, &vol, &record, &mut source, live, channel)
            .await;
        source.cleanup().await;
        result?;

        tracing::info!("Sent instance");
        self.publish(LifecycleEvent::InstanceSent {
            name: name.to_string(),
            live,
            timestamp: now(),
        });
        Ok(())
    }

    async fn send_steps(
        &self,
        driver: &Arc<dyn StorageDriver>,
        vol: &VolumeRef,
        record: &InstanceRecord,
        source: &mut MigrationSource,
        live: bool,
        channel: &mut dyn DiffChannel,
    ) -> SiloResult<()> {
        MigrationHeader {
            instance: record.name.to_string(),
            driver: driver.name().to_string(),
            snapshots: source.snapshots().to_vec(),
            live,
        }
        .write(channel)
        .await?;

        source.send_while_running(channel).await?;
        if !live {
            return Ok(());
        }

        let (mountpoint, mounted) = self.expose(driver, vol).await?;
        let state = mountpoint.join(STATE_DIR);
        let result = async {
            tokio::fs::create_dir_all(&state).await?;
            self.runtime.checkpoint(&record.name, &state, true).await?;
            source.send_after_checkpoint(channel).await
        }
        .await;

        if let Err(err) = filesystem::remove_tree(&state).await {
            tracing::warn!(dir = %state.display(), error = %err, "Failed to remove checkpoint state");
        }
        Self::conceal(driver, vol, mounted).await;
        result
    }

    /// Receive an instance streamed by [`Orchestrator::migrate_send`].
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::create_from_migration`].
    pub async fn migrate_receive(
        &self,
        args: InstanceArgs,
        channel: &mut dyn DiffChannel,
    ) -> SiloResult<InstanceRecord> {
        let header = MigrationHeader::read(channel).await?;
        tracing::debug!(
            from = %header.instance,
            snapshots = header.snapshots.len(),
            live = header.live,
            "Migration header received"
        );
        self.create_from_migration(args, &header, channel).await
    }

    /// Create a container from a migration stream described by `header`.
    ///
    /// A row is created for each snapshot as it arrives.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the sender uses another storage
    /// technology, or the first failure (including the peer closing the
    /// stream) after removing the volume and every row created.
    #[tracing::instrument(skip_all, fields(instance = %args.name))]
    pub async fn create_from_migration(
        &self,
        args: InstanceArgs,
        header: &MigrationHeader,
        channel: &mut dyn DiffChannel,
    ) -> SiloResult<InstanceRecord> {
        args.validate()?;
        if args.name.is_snapshot() {
            return Err(SiloError::validation(format!(
                "Cannot receive into snapshot name {}",
                args.name
            )));
        }

        let mut revert = Reverter::new();
        let result = self
            .create_from_migration_steps(&args, header, channel, &mut revert)
            .await;
        revert.finish(result).await
    }

    async fn create_from_migration_steps(
        &self,
        args: &InstanceArgs,
        header: &MigrationHeader,
        channel: &mut dyn DiffChannel,
        revert: &mut Reverter,
    ) -> SiloResult<InstanceRecord> {
        let pool = args
            .root_pool()
            .map_or_else(|| self.default_pool.clone(), str::to_string);
        let driver = self.driver(&pool)?;
        if header.driver != driver.name() {
            return Err(SiloError::validation(format!(
                "Cannot receive a {} stream into {} pool {pool}",
                header.driver,
                driver.name()
            )));
        }

        let record = self
            .insert_record(InstanceRecord::from_args(args, &pool), revert)
            .await?;
        let vol = VolumeRef::container(&pool, record.name.as_str());
        driver.volume_create(&vol).await?;
        Self::revert_volume(revert, &driver, &vol);

        let sink = MigrationSink::new(
            driver.clone(),
            vol.clone(),
            header.snapshots.clone(),
            header.live,
        );
        let mut rows = SnapshotRows {
            catalog: self.catalog.clone(),
            parent: record.clone(),
            created: Vec::new(),
        };
        let received = sink.receive(channel, &mut rows).await;
        for snap in rows.created {
            let catalog = self.catalog.clone();
            revert.add(format!("remove row {snap}"), move || async move {
                catalog.delete(&snap).await
            });
        }
        received?;

        self.finish_container(&driver, &vol, &record, args, true, TemplateTrigger::Copy)
            .await?;
        tracing::info!(
            pool = %pool,
            snapshots = header.snapshots.len(),
            from = %header.instance,
            "Received instance"
        );
        self.publish_created(&record);
        Ok(record)
    }
}
