//! Stops the server when the process receives a termination signal.

use std::io;
use std::thread;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::info;

use crate::server::{SERVER_TARGET, ServerHandle};

/// Errors reported by shutdown signal listeners.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Spawns a thread that asks `handle` to stop on the first termination
/// signal.
///
/// # Errors
///
/// Fails when the signal handlers cannot be installed.
pub fn watch_signals(handle: ServerHandle) -> Result<(), ShutdownError> {
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT, SIGHUP])
        .map_err(|source| ShutdownError::Install { source })?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(target: SERVER_TARGET, signal, "shutdown signal received");
            handle.shutdown();
        }
    });
    Ok(())
}
