//! Errors raised while manipulating port files.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of port file operations.
#[derive(Debug, Error)]
pub enum PortFileError {
    /// The port file path has no parent directory.
    #[error("port file path '{path}' has no parent directory")]
    MissingParent {
        /// Configured port file path.
        path: PathBuf,
    },
    /// The port file path could not be made absolute.
    #[error("failed to resolve port file path '{path}': {source}")]
    Resolve {
        /// Configured port file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The directory holding the port file could not be created.
    #[error("failed to create port file directory '{path}': {source}")]
    Directory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The advisory lock could not be taken or released.
    #[error("failed to lock port file '{path}': {source}")]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Reading the record failed.
    #[error("failed to read port file '{path}': {source}")]
    Read {
        /// Port file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The record held malformed JSON.
    #[error("port file '{path}' is malformed: {source}")]
    Decode {
        /// Port file path.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// The record could not be serialised.
    #[error("failed to encode port file '{path}': {source}")]
    Encode {
        /// Port file path.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
    /// Writing the record failed.
    #[error("failed to write port file '{path}': {source}")]
    Write {
        /// Port file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Removing the record or the stop sentinel failed.
    #[error("failed to remove '{path}': {source}")]
    Remove {
        /// Path that could not be removed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// No valid record appeared in time.
    #[error("port file '{path}' held no valid values after {timeout:?}")]
    Timeout {
        /// Port file path.
        path: PathBuf,
        /// How long the caller waited.
        timeout: Duration,
    },
}
