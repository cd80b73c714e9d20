//! # Silo
//!
//! Silo manages the on-disk lifecycle of system container storage.
//!
//! ## Features
//!
//! - **Pluggable storage**: ZFS datasets with copy-on-write clones, or plain directories
//! - **Creation pathways**: empty, from an image, as a copy, as a snapshot, from a migration stream
//! - **All or nothing**: every pathway reverts what it created before reporting a failure
//! - **Migration**: instances stream as ordered diffs, optionally live with a checkpoint
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use silo::args::InstanceArgs;
//! use silo::catalog::FileCatalog;
//! use silo::instance::Orchestrator;
//! use silo_common::{InstanceName, SiloPaths};
//! use silo_storage::{StoragePool, ToolRunner};
//!
//! # async fn example() -> silo_common::SiloResult<()> {
//! let paths = SiloPaths::new();
//! let catalog = Arc::new(FileCatalog::new(paths.catalog()));
//! let silo = Orchestrator::new(catalog, Arc::new(ToolRunner::new()), paths);
//! silo.load_pools().await?;
//!
//! // Register a pool and create a container on it
//! silo.pool_create(StoragePool::new("default", "zfs").with_config("size", "20GiB"))
//!     .await?;
//! let args = InstanceArgs::new(InstanceName::new("c1")?);
//! silo.create_empty(args).await?;
//!
//! // Snapshot it
//! silo.create_as_snapshot(InstanceName::new("c1/snap0")?, false).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod args;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod events;
pub mod hooks;
pub mod images;
pub mod instance;
pub mod revert;
pub mod runtime;

pub use args::InstanceArgs;
pub use catalog::{Catalog, FileCatalog, InstanceRecord, MemoryCatalog};
pub use config::DaemonConfig;
pub use events::{EventBus, LifecycleEvent};
pub use instance::Orchestrator;
