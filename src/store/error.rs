//! Error types for the persisted records.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{InvalidTimestamp, ValidationError};

/// Configuration store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record file does not exist.
    #[error("configuration file {} not found", .0.display())]
    Missing(PathBuf),

    /// The record file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The record file could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// File path
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The record file is not valid YAML for its record type.
    #[error("malformed {}: {source}", path.display())]
    Parse {
        /// File path
        path: PathBuf,
        /// Parser error
        #[source]
        source: serde_yaml::Error,
    },

    /// The record could not be serialised.
    #[error("failed to serialise record: {0}")]
    Serialize(#[source] serde_yaml::Error),

    /// A persisted timestamp is malformed.
    #[error(transparent)]
    InvalidTimestamp(#[from] InvalidTimestamp),

    /// An edit was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
