//! Sending side of a migration.

use std::sync::Arc;

use silo_common::{SiloError, SiloResult};

use super::DiffChannel;
use crate::driver::StorageDriver;
use crate::volume::{SnapshotName, VolumeRef, VolumeType};

/// Streams a volume and its snapshot history as diffs.
///
/// Transient snapshots taken while sending are destroyed by
/// [`MigrationSource::cleanup`], which callers run whatever the outcome.
#[derive(Debug)]
pub struct MigrationSource {
    driver: Arc<dyn StorageDriver>,
    volume: VolumeRef,
    snapshots: Vec<String>,
    only_snapshot: Option<SnapshotName>,
    running: Option<SnapshotName>,
    checkpointed: Option<SnapshotName>,
}

impl MigrationSource {
    /// Prepare to send `volume` with the given user snapshots, oldest first.
    ///
    /// A snapshot volume sends only that snapshot.
    ///
    /// # Errors
    ///
    /// Returns a validation error for image or custom volumes.
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        volume: VolumeRef,
        snapshots: Vec<String>,
    ) -> SiloResult<Self> {
        let (volume, only_snapshot, snapshots) = match volume.kind {
            VolumeType::Container => (volume, None, snapshots),
            VolumeType::Snapshot => {
                let (parent, snap) = volume.split_snapshot()?;
                (parent, Some(snap), Vec::new())
            }
            kind => {
                return Err(SiloError::validation(format!(
                    "Cannot migrate {kind} volume {}",
                    volume.name
                )));
            }
        };
        Ok(Self {
            driver,
            volume,
            snapshots,
            only_snapshot,
            running: None,
            checkpointed: None,
        })
    }

    /// User snapshots that will be sent.
    #[must_use]
    pub fn snapshots(&self) -> &[String] {
        &self.snapshots
    }

    /// Send every snapshot, then the live state as of now.
    ///
    /// # Errors
    ///
    /// Aborts on the first failed diff.
    pub async fn send_while_running(&mut self, channel: &mut dyn DiffChannel) -> SiloResult<()> {
        if let Some(snap) = &self.only_snapshot {
            return self.driver.diff_send(&self.volume, snap, None, channel).await;
        }

        let mut previous: Option<SnapshotName> = None;
        for name in &self.snapshots {
            let snap = SnapshotName::user(name.as_str());
            tracing::debug!(volume = %self.volume, snapshot = %snap, "Sending snapshot");
            self.driver
                .diff_send(&self.volume, &snap, previous.as_ref(), channel)
                .await?;
            previous = Some(snap);
        }

        let running = SnapshotName::migration_send();
        self.driver.snapshot_create(&self.volume, &running).await?;
        self.running = Some(running.clone());
        self.driver
            .diff_send(&self.volume, &running, previous.as_ref(), channel)
            .await?;

        tracing::info!(volume = %self.volume, snapshots = self.snapshots.len(), "Volume sent");
        Ok(())
    }

    /// Send what changed since [`MigrationSource::send_while_running`],
    /// once the instance has been checkpointed.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing was sent yet or the diff fails.
    pub async fn send_after_checkpoint(&mut self, channel: &mut dyn DiffChannel) -> SiloResult<()> {
        let Some(running) = self.running.clone() else {
            return Err(SiloError::migration(
                "post-checkpoint diff requested before the live diff",
            ));
        };

        let checkpointed = SnapshotName::migration_send();
        self.driver
            .snapshot_create(&self.volume, &checkpointed)
            .await?;
        self.checkpointed = Some(checkpointed.clone());
        self.driver
            .diff_send(&self.volume, &checkpointed, Some(&running), channel)
            .await
    }

    /// Destroy the transient snapshots. Failures are logged, never returned.
    pub async fn cleanup(&mut self) {
        for snap in [self.checkpointed.take(), self.running.take()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = self.driver.snapshot_delete(&self.volume, &snap).await {
                tracing::warn!(
                    volume = %self.volume,
                    snapshot = %snap,
                    error = %err,
                    "Failed to remove migration snapshot"
                );
            }
        }
    }
}
