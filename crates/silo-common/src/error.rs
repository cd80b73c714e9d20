//! Common error types for Silo.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`SiloError`].
pub type SiloResult<T> = Result<T, SiloError>;

/// Errors raised anywhere in the storage stack.
#[derive(Error, Diagnostic, Debug)]
pub enum SiloError {
    /// An external storage tool exited unsuccessfully.
    #[error("Command `{command}` failed ({}): {output}", status.map_or_else(|| "killed".to_string(), |s| format!("exit status {s}")))]
    #[diagnostic(code(silo::tool::failed))]
    Tool {
        /// The command line that was run.
        command: String,
        /// Exit status, if the process exited normally.
        status: Option<i32>,
        /// Captured output of the command.
        output: String,
    },

    /// A dataset still has dependent clones.
    ///
    /// Handled inside the drivers by soft-deleting; never surfaced from a
    /// delete pathway.
    #[error("Dataset {dataset} still has dependent clones")]
    #[diagnostic(code(silo::storage::not_removable))]
    NotRemovable {
        /// The dataset that cannot be destroyed yet.
        dataset: String,
    },

    /// A catalog row or on-disk volume already exists.
    #[error("{what} already exists")]
    #[diagnostic(code(silo::conflict))]
    AlreadyExists {
        /// Description of the colliding object.
        what: String,
    },

    /// Instance not found in the catalog.
    #[error("Instance not found: {name}")]
    #[diagnostic(code(silo::instance::not_found))]
    InstanceNotFound {
        /// The instance name.
        name: String,
    },

    /// Storage pool not found.
    #[error("Storage pool not found: {name}")]
    #[diagnostic(code(silo::pool::not_found))]
    PoolNotFound {
        /// The pool name.
        name: String,
    },

    /// Storage volume or dataset not found.
    #[error("Storage volume not found: {what}")]
    #[diagnostic(code(silo::volume::not_found))]
    VolumeNotFound {
        /// The volume description.
        what: String,
    },

    /// Image not found.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(silo::image::not_found))]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Invalid instance, snapshot or volume name.
    #[error("Invalid name {name:?}: {reason}")]
    #[diagnostic(
        code(silo::name::invalid),
        help("Names must be 1-63 characters of letters, digits and hyphens, starting with a letter")
    )]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Invalid byte size string.
    #[error("Invalid size: {value}")]
    #[diagnostic(
        code(silo::size::invalid),
        help("Use formats like '512MB', '10GB', '2GiB' or a plain number of bytes")
    )]
    InvalidSize {
        /// The invalid value.
        value: String,
    },

    /// Malformed configuration key, device or request.
    #[error("Validation failed: {message}")]
    #[diagnostic(code(silo::validation))]
    Validation {
        /// The error message.
        message: String,
    },

    /// A coalesced operation failed in the caller that performed it.
    #[error("Concurrent {key} failed: {message}")]
    #[diagnostic(code(silo::coordinator::coalesced))]
    Coalesced {
        /// The lease the waiter was attached to.
        key: String,
        /// The owner's error message.
        message: String,
    },

    /// Migration stream failure.
    #[error("Migration failed: {message}")]
    #[diagnostic(code(silo::migration))]
    Migration {
        /// The error message.
        message: String,
    },

    /// Feature not supported by the storage technology.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(silo::unsupported))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(silo::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(silo::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(silo::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(silo::internal),
        help("This is a bug, please report it at https://github.com/fishmindlabs360/silo/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl SiloError {
    /// Shorthand for a [`SiloError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a [`SiloError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for a [`SiloError::Migration`].
    pub fn migration(message: impl Into<String>) -> Self {
        Self::Migration {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SiloError {
    fn from(err: serde_json::Error) -> Self {
        SiloError::Serialization(err.to_string())
    }
}
