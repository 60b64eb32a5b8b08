//! Client side of the compile service.
//!
//! [`ServiceClient`] turns a compile invocation into a request, finds (or
//! starts) the server named by the port file, and retries transient
//! failures. Every outcome is reported as a [`CompilationResult`]; the
//! client never panics or returns an error to its caller.

use std::collections::BTreeSet;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kiln_config::ServerSettings;
use kiln_portfile::{PortFile, PortFileError, PortFileLock, PortFileRegistry, PortFileValues};
use kiln_protocol::{CompilationResult, CompileRequest, ReturnCode, SourceSuffixes, SysInfo};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::ClientError;
use crate::launcher::ServerLauncher;
use crate::paths::absolute_normalised;
use crate::transport;

pub(crate) const SERVICE_TARGET: &str = module_path!();

/// Id sent with capacity queries.
const SYSINFO_ID: &str = "sysinfo";

/// How hard the client tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Pause between two attempts.
    pub backoff: Duration,
    /// Bound on establishing one connection.
    pub connect_timeout: Duration,
    /// Bound on waiting for a freshly started server.
    pub startup_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
            startup_timeout: Duration::from_secs(10),
        }
    }
}

/// Sends compile requests to the server named by a port file.
pub struct ServiceClient {
    settings: ServerSettings,
    registry: Arc<PortFileRegistry>,
    launcher: Arc<dyn ServerLauncher>,
    policy: RetryPolicy,
    suffixes: SourceSuffixes,
    working_directory: Option<PathBuf>,
}

impl ServiceClient {
    /// Builds a client that starts servers with `launcher` when none runs.
    #[must_use]
    pub fn new(settings: ServerSettings, launcher: Arc<dyn ServerLauncher>) -> Self {
        Self {
            settings,
            registry: Arc::new(PortFileRegistry::new()),
            launcher,
            policy: RetryPolicy::default(),
            suffixes: SourceSuffixes::default(),
            working_directory: None,
        }
    }

    /// Shares a port file registry, typically with an in-process server.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<PortFileRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the suffixes that mark arguments as source files.
    #[must_use]
    pub fn with_source_suffixes(mut self, suffixes: SourceSuffixes) -> Self {
        self.suffixes = suffixes;
        self
    }

    /// Resolves relative files against `cwd` instead of the process directory.
    #[must_use]
    pub fn with_working_directory(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(cwd.into());
        self
    }

    /// Settings used to find and start the server.
    #[must_use]
    pub const fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Compiles `args` on the server.
    ///
    /// Arguments ending in a source suffix are sent as absolute, normalised
    /// paths. Failures to reach the server come back as
    /// [`ReturnCode::ErrorButTryAgain`] once the retries are spent, and as
    /// [`ReturnCode::ErrorFatal`] otherwise.
    #[must_use]
    pub fn compile(
        &self,
        id: &str,
        args: &[String],
        sources_to_compile: &BTreeSet<Url>,
        visible_sources: &BTreeSet<Url>,
    ) -> CompilationResult {
        let cwd = match self.resolve_working_directory() {
            Ok(cwd) => cwd,
            Err(error) => return error.into_result(),
        };
        let mut request = CompileRequest::from_args(id, args.iter().cloned(), &self.suffixes);
        request.cwd = cwd.to_string_lossy().into_owned();
        request.explicit_files = request
            .explicit_files
            .iter()
            .map(|file| {
                absolute_normalised(&cwd, Path::new(file))
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        request.sources_to_compile.clone_from(sources_to_compile);
        request.visible_sources.clone_from(visible_sources);

        let result = self.use_server(&request);
        info!(
            target: SERVICE_TARGET,
            id,
            code = %result.return_code,
            "compile finished"
        );
        result
    }

    /// Capacity of the server host, or [`SysInfo::UNAVAILABLE`].
    #[must_use]
    pub fn sys_info(&self) -> SysInfo {
        let request = CompileRequest {
            id: String::from(SYSINFO_ID),
            ..CompileRequest::default()
        };
        let result = self.use_server(&request);
        if result.return_code.is_success() {
            result.sys_info
        } else {
            debug!(target: SERVICE_TARGET, stderr = %result.stderr, "sysinfo unavailable");
            SysInfo::UNAVAILABLE
        }
    }

    /// Asks the running server to stop.
    ///
    /// Returns `false` when the port file names no server.
    ///
    /// # Errors
    ///
    /// Fails when the settings are invalid or the port file cannot be read
    /// or marked.
    pub fn stop_server(&self) -> Result<bool, ClientError> {
        let port_file = self.port_file()?;
        let lock = port_file.lock()?;
        if valid_values(&lock)?.is_none() {
            info!(
                target: SERVICE_TARGET,
                file = %port_file.path().display(),
                "no server to stop"
            );
            return Ok(false);
        }
        lock.mark_for_stop()?;
        Ok(true)
    }

    /// Runs `request` against the server, retrying transient failures.
    ///
    /// The recorded server is kept for every attempt. A record whose port
    /// still refuses connections after the last attempt is removed, so the
    /// next call starts a fresh server.
    fn use_server(&self, request: &CompileRequest) -> CompilationResult {
        let port_file = match self.port_file() {
            Ok(port_file) => port_file,
            Err(error) => return error.into_result(),
        };
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            let Attempt { result, refused_by } = self.attempt(&port_file, request, attempt);
            if !result.return_code.is_transient() || attempt >= attempts {
                if result.return_code.is_transient() {
                    warn!(
                        target: SERVICE_TARGET,
                        attempts,
                        id = %request.id,
                        "compile server unavailable; giving up"
                    );
                    if let Some(stale) = refused_by {
                        forget_stale_values(&port_file, stale);
                    }
                }
                return result;
            }
            info!(
                target: SERVICE_TARGET,
                attempt,
                id = %request.id,
                backoff_ms = u64::try_from(self.policy.backoff.as_millis()).unwrap_or(u64::MAX),
                "transient failure; retrying"
            );
            thread::sleep(self.policy.backoff);
            attempt += 1;
        }
    }

    fn attempt(&self, port_file: &PortFile, request: &CompileRequest, attempt: u32) -> Attempt {
        let values = match self.discover(port_file) {
            Ok(values) => values,
            Err(error) => return Attempt::failed(attempt, error, None),
        };
        let mut request = request.clone();
        request.cookie = values.cookie;
        match transport::exchange(values.port, self.policy.connect_timeout, &request) {
            Ok(result) => Attempt {
                result,
                refused_by: None,
            },
            Err(error) => {
                let refused = matches!(
                    &error,
                    ClientError::Connect { source, .. }
                        if source.kind() == io::ErrorKind::ConnectionRefused
                );
                Attempt::failed(attempt, error, refused.then_some(values))
            }
        }
    }

    /// Reads the recorded server, starting one when the record is unusable.
    fn discover(&self, port_file: &PortFile) -> Result<PortFileValues, ClientError> {
        if let Some(values) = read_values(port_file)? {
            return Ok(values);
        }
        info!(
            target: SERVICE_TARGET,
            file = %port_file.path().display(),
            "no compile server recorded; starting one"
        );
        Ok(self
            .launcher
            .launch(&self.settings, port_file, self.policy.startup_timeout)?)
    }

    fn port_file(&self) -> Result<Arc<PortFile>, ClientError> {
        self.settings
            .validate()
            .map_err(|source| ClientError::Settings { source })?;
        Ok(self.registry.port_file(&self.settings.portfile)?)
    }

    fn resolve_working_directory(&self) -> Result<PathBuf, ClientError> {
        match &self.working_directory {
            Some(cwd) => Ok(cwd.clone()),
            None => env::current_dir().map_err(|source| ClientError::WorkingDirectory { source }),
        }
    }
}

/// Outcome of one attempt to use the server.
struct Attempt {
    result: CompilationResult,
    /// Record whose port refused the connection.
    refused_by: Option<PortFileValues>,
}

impl Attempt {
    fn failed(attempt: u32, error: ClientError, refused_by: Option<PortFileValues>) -> Self {
        debug!(target: SERVICE_TARGET, attempt, %error, "attempt failed");
        Self {
            result: error.into_result(),
            refused_by,
        }
    }
}

/// Returns the recorded values when they are valid; malformed records count
/// as absent.
fn read_values(port_file: &PortFile) -> Result<Option<PortFileValues>, ClientError> {
    valid_values(&port_file.lock()?)
}

fn valid_values(lock: &PortFileLock<'_>) -> Result<Option<PortFileValues>, ClientError> {
    match lock.values() {
        Ok(values) => Ok(values.filter(PortFileValues::is_valid)),
        Err(error @ PortFileError::Decode { .. }) => {
            debug!(target: SERVICE_TARGET, %error, "ignoring malformed port file");
            Ok(None)
        }
        Err(error) => Err(error.into()),
    }
}

/// Removes a record whose port refuses connections, unless a new server has
/// replaced it meanwhile.
fn forget_stale_values(port_file: &PortFile, stale: PortFileValues) {
    let outcome = port_file.lock().and_then(|lock| match lock.values() {
        Ok(Some(current)) if current == stale => lock.delete().map(|()| true),
        _ => Ok(false),
    });
    match outcome {
        Ok(true) => info!(
            target: SERVICE_TARGET,
            port = stale.port,
            file = %port_file.path().display(),
            "removed stale port file"
        ),
        Ok(false) => {}
        Err(error) => warn!(target: SERVICE_TARGET, %error, "failed to remove stale port file"),
    }
}

/// Maps a result onto a process exit status byte.
#[must_use]
pub fn exit_status(code: ReturnCode) -> u8 {
    match code {
        ReturnCode::Ok => 0,
        ReturnCode::Exit(status) => u8::try_from(status)
            .ok()
            .filter(|status| *status != 0)
            .unwrap_or(1),
        ReturnCode::ErrorButTryAgain | ReturnCode::ErrorFatal => 1,
    }
}
