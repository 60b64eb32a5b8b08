//! Errors surfaced while starting or running the server.

use std::io;
use std::path::PathBuf;

use kiln_config::SettingsError;
use kiln_portfile::PortFileError;
use thiserror::Error;

use crate::pool::PoolError;

/// Failures that abort server startup or end its accept loop.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The resolved settings were unusable.
    #[error("invalid server settings: {source}")]
    Settings {
        /// Validation failure.
        #[source]
        source: SettingsError,
    },
    /// Binding the loopback listener failed.
    #[error("failed to bind loopback listener: {source}")]
    Bind {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The listener could not be switched to non-blocking mode.
    #[error("failed to configure listener: {source}")]
    Listener {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The port file could not be claimed, checked or released.
    #[error(transparent)]
    PortFile {
        /// Underlying port file error.
        #[from]
        source: PortFileError,
    },
    /// A live server already owns the port file.
    #[error("a server is already running on port {port} (pid {pid}) according to '{path}'")]
    AlreadyRunning {
        /// Port file naming the live server.
        path: PathBuf,
        /// Port the live server listens on.
        port: u16,
        /// Pid recorded by the live server.
        pid: u32,
    },
    /// The pool refused to hand out a worker.
    #[error("compiler pool unavailable: {source}")]
    Pool {
        /// Underlying pool error.
        #[source]
        source: PoolError,
    },
    /// The server thread panicked.
    #[error("server thread panicked")]
    ThreadPanic,
}
