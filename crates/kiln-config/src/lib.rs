//! Shared configuration for the Kiln compile server and its clients.
//!
//! Configuration is layered by [`ortho_config`]: built-in defaults, an
//! optional configuration file (`--config-path` / `KILN_CONFIG_PATH`),
//! `KILN_*` environment variables and finally command-line flags. Every field
//! is optional on the wire; the accessors on [`Config`] resolve the defaults
//! so the server and the client agree on them.

mod defaults;
mod logging;
mod settings;

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use defaults::{
    DEFAULT_KEEPALIVE, DEFAULT_LOG_FILTER, default_log_format, default_poolsize, default_portfile,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use settings::{
    DEFAULT_DRAIN_GRACE, DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT, ServerSettings,
    SettingsError,
};

/// Layered configuration consumed by `kilnd` and `kiln`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "KILN")]
pub struct Config {
    /// Rendezvous record shared by the server and its clients.
    pub portfile: Option<Utf8PathBuf>,
    /// File receiving the server's structured log.
    pub logfile: Option<Utf8PathBuf>,
    /// File receiving the raw stdout and stderr of a detached server.
    pub stdouterrfile: Option<Utf8PathBuf>,
    /// Maximum number of concurrent compilations.
    pub poolsize: Option<usize>,
    /// Idle seconds before the server retires itself.
    pub keepalive: Option<u64>,
    /// External compiler program driven by the command compiler.
    pub compiler: Option<String>,
    /// Tracing filter expression.
    pub log_filter: Option<String>,
    /// Log output format.
    pub log_format: Option<LogFormat>,
}

impl Config {
    /// Port file path, falling back to the per-user runtime directory.
    #[must_use]
    pub fn portfile(&self) -> Utf8PathBuf {
        self.portfile.clone().unwrap_or_else(default_portfile)
    }

    /// Worker pool size; defaults to the host's available parallelism.
    #[must_use]
    pub fn poolsize(&self) -> usize {
        self.poolsize
            .filter(|size| *size > 0)
            .unwrap_or_else(default_poolsize)
    }

    /// Idle duration after which the server deletes its port file.
    #[must_use]
    pub fn keepalive(&self) -> Duration {
        self.keepalive
            .map_or(DEFAULT_KEEPALIVE, Duration::from_secs)
    }

    /// Log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format.unwrap_or_else(default_log_format)
    }

    /// Resolves the typed server settings described by this configuration.
    #[must_use]
    pub fn server_settings(&self) -> ServerSettings {
        let mut settings = ServerSettings::new(self.portfile().into_std_path_buf());
        settings.logfile = self.logfile.clone().map(Utf8PathBuf::into_std_path_buf);
        settings.stdouterrfile = self
            .stdouterrfile
            .clone()
            .map(Utf8PathBuf::into_std_path_buf);
        settings.poolsize = self.poolsize();
        settings.keepalive = self.keepalive();
        settings.compiler = self.compiler.clone();
        settings
    }
}
