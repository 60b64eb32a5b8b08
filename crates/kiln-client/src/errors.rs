//! Errors raised while reaching a compile server.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use kiln_config::SettingsError;
use kiln_portfile::PortFileError;
use kiln_protocol::{CompilationResult, ProtocolError, ReturnCode};
use kilnd::ServerError;
use thiserror::Error;

/// Failures of a single attempt to use the server.
///
/// The service API never returns these directly; they are folded into a
/// [`CompilationResult`] whose return code tells the caller whether a retry
/// could help.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client settings cannot describe a server.
    #[error("invalid client settings: {source}")]
    Settings {
        /// Validation failure.
        #[source]
        source: SettingsError,
    },
    /// The working directory of the client could not be determined.
    #[error("failed to resolve the working directory: {source}")]
    WorkingDirectory {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The port file could not be read or written.
    #[error(transparent)]
    PortFile(#[from] PortFileError),
    /// No server could be started.
    #[error(transparent)]
    Launch(#[from] LaunchError),
    /// The server recorded in the port file did not accept the connection.
    #[error("failed to connect to compile server on port {port}: {source}")]
    Connect {
        /// Port read from the port file.
        port: u16,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The exchange with the server broke off or was malformed.
    #[error("compile server exchange failed: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ClientError {
    /// Return code a caller sees for this failure.
    #[must_use]
    pub const fn return_code(&self) -> ReturnCode {
        match self {
            Self::Connect { .. } => ReturnCode::ErrorButTryAgain,
            _ => ReturnCode::ErrorFatal,
        }
    }

    /// Folds the failure into a result whose stderr carries the diagnostic.
    #[must_use]
    pub fn into_result(self) -> CompilationResult {
        CompilationResult::failure(self.return_code(), self.to_string())
    }
}

/// Failures to bring a server up.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The server output file could not be prepared.
    #[error("failed to open server output file '{path}': {source}")]
    Output {
        /// Output file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The server binary could not be executed.
    #[error("failed to launch compile server binary '{binary:?}': {source}")]
    Spawn {
        /// Binary that failed to start.
        binary: OsString,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The server exited before publishing its port.
    #[error(
        "compile server exited with {status} before it was ready\n\
         command: {command}\n\
         output:\n{output}"
    )]
    Exited {
        /// Command line used to start the server.
        command: String,
        /// Exit status reported by the process.
        status: String,
        /// Captured stdout and stderr of the server.
        output: String,
    },
    /// No valid port file appeared in time.
    #[error(
        "compile server did not become ready within {timeout:?}\n\
         command: {command}\n\
         output:\n{output}"
    )]
    StartupTimeout {
        /// Command line used to start the server.
        command: String,
        /// How long the client waited.
        timeout: Duration,
        /// Captured stdout and stderr of the server.
        output: String,
    },
    /// Waiting on the port file failed.
    #[error(transparent)]
    PortFile(#[from] PortFileError),
    /// The in-process server failed to start.
    #[error("failed to start in-process server: {source}")]
    Server {
        /// Underlying server error.
        #[source]
        source: ServerError,
    },
}
