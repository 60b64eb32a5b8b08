//! Resolved server start settings and the start directive that carries them.
//!
//! A client that has to launch a detached server renders these settings as
//! command-line flags (the *start directive*); `kilnd` parses the same flags
//! back through [`crate::Config`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::defaults::{DEFAULT_KEEPALIVE, default_poolsize};

/// Interval at which the accept loop re-evaluates its lifecycle conditions.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Time a draining server keeps serving after deleting its port file.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How long a worker waits for a connected client to send its request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Typed settings used to start a compile server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Rendezvous record the server claims.
    pub portfile: PathBuf,
    /// Structured log destination; stderr when absent.
    pub logfile: Option<PathBuf>,
    /// Raw stdout/stderr destination of a detached server.
    pub stdouterrfile: Option<PathBuf>,
    /// Maximum number of concurrent compilations.
    pub poolsize: usize,
    /// Idle time before the server deletes its port file.
    pub keepalive: Duration,
    /// Accept loop lifecycle tick.
    pub poll_interval: Duration,
    /// Grace window between deleting the port file and stopping.
    pub drain_grace: Duration,
    /// Bound on waiting for a connected client's request.
    pub request_timeout: Duration,
    /// External compiler program for the command compiler.
    pub compiler: Option<String>,
}

impl ServerSettings {
    /// Builds settings for `portfile` with every other value at its default.
    #[must_use]
    pub fn new(portfile: impl Into<PathBuf>) -> Self {
        Self {
            portfile: portfile.into(),
            logfile: None,
            stdouterrfile: None,
            poolsize: default_poolsize(),
            keepalive: DEFAULT_KEEPALIVE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_grace: DEFAULT_DRAIN_GRACE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            compiler: None,
        }
    }

    /// Checks the invariants the server relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant: a missing port file path, a
    /// zero pool size, or a zero poll interval or request timeout.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.portfile.as_os_str().is_empty() {
            return Err(SettingsError::MissingPortfile);
        }
        if self.poolsize == 0 {
            return Err(SettingsError::ZeroPoolSize);
        }
        if self.poll_interval.is_zero() {
            return Err(SettingsError::ZeroPollInterval);
        }
        if self.request_timeout.is_zero() {
            return Err(SettingsError::ZeroRequestTimeout);
        }
        Ok(())
    }

    /// Destination for the raw output of a detached server.
    ///
    /// Falls back to a sibling of the port file so a failed start can always
    /// be diagnosed.
    #[must_use]
    pub fn stdouterr_path(&self) -> PathBuf {
        self.stdouterrfile
            .clone()
            .unwrap_or_else(|| sibling(&self.portfile, ".stdouterr"))
    }

    /// Renders the flags that make `kilnd` start with these settings.
    #[must_use]
    pub fn start_directive(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("--portfile"),
            self.portfile.clone().into_os_string(),
            OsString::from("--poolsize"),
            OsString::from(self.poolsize.to_string()),
            OsString::from("--keepalive"),
            OsString::from(self.keepalive.as_secs().to_string()),
        ];
        if let Some(logfile) = &self.logfile {
            args.push(OsString::from("--logfile"));
            args.push(logfile.clone().into_os_string());
        }
        args.push(OsString::from("--stdouterrfile"));
        args.push(self.stdouterr_path().into_os_string());
        if let Some(compiler) = &self.compiler {
            args.push(OsString::from("--compiler"));
            args.push(OsString::from(compiler));
        }
        args
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Invalid server settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// No port file path was configured.
    #[error("a port file path is required to start the server")]
    MissingPortfile,
    /// The pool must admit at least one compilation.
    #[error("poolsize must be at least 1")]
    ZeroPoolSize,
    /// The accept loop needs a nonzero tick.
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    /// Workers need a nonzero bound on waiting for a request.
    #[error("request timeout must be greater than zero")]
    ZeroRequestTimeout,
}
