//! # silo-common
//!
//! Shared utilities and types for the Silo storage manager.
//!
//! This crate provides common functionality used across all Silo crates:
//! - Instance, snapshot and image name validation
//! - Standard filesystem paths
//! - Byte size parsing
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod name;
pub mod paths;
pub mod size;

pub use error::{SiloError, SiloResult};
pub use name::{Fingerprint, InstanceName, SNAPSHOT_DELIMITER};
pub use paths::SiloPaths;
pub use size::ByteSize;
