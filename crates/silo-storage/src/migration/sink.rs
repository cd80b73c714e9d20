//! Receiving side of a migration.

use std::sync::Arc;

use async_trait::async_trait;
use silo_common::SiloResult;

use super::DiffChannel;
use crate::driver::StorageDriver;
use crate::volume::{SnapshotName, VolumeRef};

/// Told about each snapshot before its diff is applied.
#[async_trait]
pub trait ReceiveObserver: Send {
    /// Snapshot `name` is about to be received.
    async fn snapshot_arriving(&mut self, name: &str) -> SiloResult<()>;
}

/// Observer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl ReceiveObserver for NoopObserver {
    async fn snapshot_arriving(&mut self, _name: &str) -> SiloResult<()> {
        Ok(())
    }
}

/// Rebuilds a volume and its history from a diff sequence.
#[derive(Debug)]
pub struct MigrationSink {
    driver: Arc<dyn StorageDriver>,
    volume: VolumeRef,
    snapshots: Vec<String>,
    live: bool,
}

impl MigrationSink {
    /// Prepare to receive into the existing, empty `volume`.
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        volume: VolumeRef,
        snapshots: Vec<String>,
        live: bool,
    ) -> Self {
        Self {
            driver,
            volume,
            snapshots,
            live,
        }
    }

    /// Apply every expected diff.
    ///
    /// # Errors
    ///
    /// Aborts on the first failure; the caller removes the partial volume.
    pub async fn receive(
        &self,
        channel: &mut dyn DiffChannel,
        observer: &mut dyn ReceiveObserver,
    ) -> SiloResult<()> {
        self.driver.volume_unmount(&self.volume).await?;

        for name in &self.snapshots {
            observer.snapshot_arriving(name).await?;
            let snap = SnapshotName::user(name.as_str());
            tracing::debug!(volume = %self.volume, snapshot = %snap, "Receiving snapshot");
            self.driver
                .diff_receive(&self.volume, Some(&snap), channel)
                .await?;
        }

        self.driver.diff_receive(&self.volume, None, channel).await?;
        if self.live {
            self.driver.diff_receive(&self.volume, None, channel).await?;
        }

        self.prune().await?;

        if let Err(err) = self.driver.volume_mount(&self.volume).await {
            tracing::warn!(volume = %self.volume, error = %err, "Failed to mount received volume");
        }

        tracing::info!(volume = %self.volume, snapshots = self.snapshots.len(), "Volume received");
        Ok(())
    }

    async fn prune(&self) -> SiloResult<()> {
        let keep_history = !self.snapshots.is_empty();
        for snap in self.driver.snapshot_list(&self.volume).await? {
            if snap.is_migration_send() || !keep_history {
                self.driver.snapshot_delete(&self.volume, &snap).await?;
            }
        }
        Ok(())
    }
}
