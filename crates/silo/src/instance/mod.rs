//! Instance lifecycle orchestration.
//!
//! The [`Orchestrator`] composes storage drivers, the mount coordinator and
//! the catalog into the creation pathways (empty, from image, as copy, as
//! snapshot, from migration) and the delete, rename and restore pathways.
//! Every pathway either realizes the instance completely or reverts
//! everything it created before returning the first fatal error.

mod create;
mod lifecycle;
mod migrate;
mod pools;
mod volumes;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use silo_common::{InstanceName, SiloError, SiloPaths, SiloResult};
use silo_storage::{
    CommandRunner, DriverContext, MountCoordinator, RetryPolicy, StorageDriver, VolumeRef,
};

use crate::catalog::{Catalog, InstanceRecord};
use crate::events::{EventBus, LifecycleEvent};
use crate::hooks::{InstanceHooks, NoopHooks};
use crate::images::{DirImageStore, ImageStore};
use crate::revert::Reverter;
use crate::runtime::{InstanceRuntime, NullRuntime};

/// Subdirectory of a container volume holding checkpoint state.
pub const STATE_DIR: &str = "state";

/// Orchestrates instance storage across every registered pool.
#[derive(Debug)]
pub struct Orchestrator {
    catalog: Arc<dyn Catalog>,
    images: Arc<dyn ImageStore>,
    runtime: Arc<dyn InstanceRuntime>,
    hooks: Arc<dyn InstanceHooks>,
    events: EventBus,
    paths: SiloPaths,
    runner: Arc<dyn CommandRunner>,
    coordinator: Arc<MountCoordinator>,
    retry: RetryPolicy,
    default_pool: String,
    drivers: RwLock<HashMap<String, Arc<dyn StorageDriver>>>,
}

impl Orchestrator {
    /// Create an orchestrator with no pools loaded.
    ///
    /// Images come from the var directory, no instance is ever running and
    /// no hooks run until configured otherwise.
    pub fn new(catalog: Arc<dyn Catalog>, runner: Arc<dyn CommandRunner>, paths: SiloPaths) -> Self {
        Self {
            catalog,
            images: Arc::new(DirImageStore::new(paths.clone())),
            runtime: Arc::new(NullRuntime::default()),
            hooks: Arc::new(NoopHooks),
            events: EventBus::new(),
            paths,
            runner,
            coordinator: Arc::new(MountCoordinator::new()),
            retry: RetryPolicy::default(),
            default_pool: "default".to_string(),
            drivers: RwLock::new(HashMap::new()),
        }
    }

    /// Set the image store.
    #[must_use]
    pub fn with_images(mut self, images: Arc<dyn ImageStore>) -> Self {
        self.images = images;
        self
    }

    /// Set the instance runtime.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Arc<dyn InstanceRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    /// Set the post-storage hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn InstanceHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Share an existing mount coordinator.
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: Arc<MountCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Set the retry policy handed to drivers.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the pool used when an instance has no root disk device.
    #[must_use]
    pub fn with_default_pool(mut self, pool: impl Into<String>) -> Self {
        self.default_pool = pool.into();
        self
    }

    /// The event bus lifecycle events are published on.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// The catalog.
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Filesystem layout.
    #[must_use]
    pub const fn paths(&self) -> &SiloPaths {
        &self.paths
    }

    /// The driver serving `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::PoolNotFound`] if the pool is not loaded.
    pub fn driver(&self, pool: &str) -> SiloResult<Arc<dyn StorageDriver>> {
        self.drivers
            .read()
            .get(pool)
            .cloned()
            .ok_or_else(|| SiloError::PoolNotFound {
                name: pool.to_string(),
            })
    }

    /// Every instance row.
    ///
    /// # Errors
    ///
    /// Propagates catalog errors.
    pub async fn list(&self) -> SiloResult<Vec<InstanceRecord>> {
        self.catalog.list().await
    }

    /// Fetch an instance row.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::InstanceNotFound`] for unknown instances.
    pub async fn get(&self, name: &InstanceName) -> SiloResult<InstanceRecord> {
        self.catalog.get(name).await
    }

    fn driver_context(&self) -> DriverContext {
        DriverContext::new(
            self.runner.clone(),
            self.coordinator.clone(),
            self.paths.clone(),
        )
        .with_retry(self.retry)
    }

    fn publish(&self, event: LifecycleEvent) {
        self.events.publish(event);
    }

    /// Volume of an instance row: its container, or the snapshot volume.
    fn volume_of(record: &InstanceRecord) -> VolumeRef {
        match record.name.snapshot() {
            Some(snap) => VolumeRef::snapshot(&record.pool, record.name.parent(), snap),
            None => VolumeRef::container(&record.pool, record.name.as_str()),
        }
    }

    /// Insert the row for `record` and register its removal.
    async fn insert_record(
        &self,
        mut record: InstanceRecord,
        revert: &mut Reverter,
    ) -> SiloResult<InstanceRecord> {
        record.id = self.catalog.create(record.clone()).await?;
        let catalog = self.catalog.clone();
        let name = record.name.clone();
        revert.add(format!("remove row {name}"), move || async move {
            catalog.delete(&name).await
        });
        Ok(record)
    }

    /// Register the deletion of a volume this pathway created.
    fn revert_volume(revert: &mut Reverter, driver: &Arc<dyn StorageDriver>, vol: &VolumeRef) {
        let driver = driver.clone();
        let vol = vol.clone();
        revert.add(format!("delete volume {vol}"), move || async move {
            driver.volume_delete(&vol).await
        });
    }

    /// Mount `vol` if needed and return where its content is.
    ///
    /// The flag says whether this call mounted it, and so owes the unmount.
    async fn expose(
        &self,
        driver: &Arc<dyn StorageDriver>,
        vol: &VolumeRef,
    ) -> SiloResult<(PathBuf, bool)> {
        let performed = driver.volume_mount(vol).await?;
        Ok((vol.mountpoint(&self.paths), performed))
    }

    /// Undo [`Orchestrator::expose`], logging failures.
    async fn conceal(driver: &Arc<dyn StorageDriver>, vol: &VolumeRef, performed: bool) {
        if !performed {
            return;
        }
        if let Err(err) = driver.volume_unmount(vol).await {
            tracing::warn!(volume = %vol, error = %err, "Failed to unmount after use");
        }
    }
}
