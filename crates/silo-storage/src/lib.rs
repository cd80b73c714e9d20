//! # silo-storage
//!
//! Storage backends for the Silo storage manager.
//!
//! This crate provides:
//! - A [`CommandRunner`] abstraction over the storage technology's tools
//! - The [`StorageDriver`] contract with ZFS and plain-directory drivers
//! - Single-flight mount coordination ([`MountCoordinator`])
//! - The migration transport ([`migration`]) streaming volumes as diffs

#![warn(missing_docs)]

pub mod coordinator;
pub mod dir;
pub mod driver;
pub mod filesystem;
pub mod image;
pub mod migration;
pub mod runner;
pub mod volume;
pub mod zfs;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

use silo_common::{SiloError, SiloPaths, SiloResult};

pub use coordinator::MountCoordinator;
pub use dir::DirDriver;
pub use driver::{Capabilities, StorageDriver};
pub use runner::{CommandRunner, Pipe, PipedCommand, RetryPolicy, ToolRunner};
pub use volume::{LeaseKey, LeaseKind, SnapshotName, StoragePool, VolumeRef, VolumeType};
pub use zfs::ZfsDriver;

/// Shared collaborators every driver is constructed with.
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// Runner for external tools.
    pub runner: Arc<dyn CommandRunner>,
    /// Process-wide mount coordinator.
    pub coordinator: Arc<MountCoordinator>,
    /// Filesystem layout.
    pub paths: SiloPaths,
    /// Retry policy for operations the technology reports as busy.
    pub retry: RetryPolicy,
}

impl DriverContext {
    /// Create a context with the default retry policy.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        coordinator: Arc<MountCoordinator>,
        paths: SiloPaths,
    ) -> Self {
        Self {
            runner,
            coordinator,
            paths,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Build the driver for a pool from its `driver` field.
///
/// # Errors
///
/// Returns [`SiloError::Unsupported`] for unknown storage technologies.
pub fn new_driver(pool: StoragePool, ctx: DriverContext) -> SiloResult<Arc<dyn StorageDriver>> {
    match pool.driver.as_str() {
        ZfsDriver::NAME => Ok(Arc::new(ZfsDriver::new(pool, ctx))),
        DirDriver::NAME => Ok(Arc::new(DirDriver::new(pool, ctx.paths))),
        other => Err(SiloError::Unsupported {
            feature: format!("storage driver {other:?}"),
        }),
    }
}
