//! Strategies for starting a compile server when none is running.
//!
//! [`DetachedLauncher`] runs `kilnd` as its own process group so the server
//! outlives the client. [`InProcessLauncher`] hosts the server on background
//! threads of the calling process, which is what tests and embedders use.

use std::env;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use kiln_config::ServerSettings;
use kiln_portfile::{PortFile, PortFileError, PortFileRegistry, PortFileValues};
use kilnd::{CompilerFactory, RunningServer, Server, ServerError, ServerReport};
use tracing::{info, warn};

use crate::errors::LaunchError;
use crate::service::SERVICE_TARGET;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const SERVER_BIN_ENV: &str = "KILND_BIN";
const DEFAULT_SERVER_BIN: &str = "kilnd";

/// Starts a server and waits until it has published its port.
pub trait ServerLauncher: Send + Sync {
    /// Starts a server for `settings` and returns the values it recorded.
    ///
    /// When another server claims the port file first, its values are
    /// returned instead.
    ///
    /// # Errors
    ///
    /// Fails when the server cannot be started or does not become ready
    /// within `timeout`.
    fn launch(
        &self,
        settings: &ServerSettings,
        port_file: &PortFile,
        timeout: Duration,
    ) -> Result<PortFileValues, LaunchError>;
}

/// Runs `kilnd` as a detached background process.
#[derive(Debug, Clone, Default)]
pub struct DetachedLauncher {
    binary: Option<OsString>,
}

impl DetachedLauncher {
    /// Resolves the server binary from `KILND_BIN`, a sibling of the
    /// current executable or `PATH`.
    #[must_use]
    pub const fn new() -> Self {
        Self { binary: None }
    }

    /// Always runs `binary`.
    #[must_use]
    pub fn with_binary(binary: impl Into<OsString>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }
}

impl ServerLauncher for DetachedLauncher {
    fn launch(
        &self,
        settings: &ServerSettings,
        port_file: &PortFile,
        timeout: Duration,
    ) -> Result<PortFileValues, LaunchError> {
        let binary = resolve_server_binary(self.binary.as_deref());
        let args = settings.start_directive();
        let command = render_command(&binary, &args);
        let output = settings.stdouterr_path();
        let mut child = spawn_detached(&binary, &args, &output)?;
        info!(
            target: SERVICE_TARGET,
            pid = child.id(),
            command = %command,
            "started compile server"
        );

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match port_file.wait_for_valid_values(remaining.min(POLL_INTERVAL)) {
                Ok(values) => return Ok(values),
                Err(PortFileError::Timeout { .. }) => {}
                Err(error) => return Err(error.into()),
            }
            if let Some(status) = exit_status(&mut child) {
                // A server that lost the race to another one exits early.
                if let Ok(values) = port_file.wait_for_valid_values(POLL_INTERVAL) {
                    return Ok(values);
                }
                return Err(LaunchError::Exited {
                    command,
                    status,
                    output: read_output(&output),
                });
            }
            if remaining.is_zero() {
                warn!(target: SERVICE_TARGET, command = %command, "compile server start timed out");
                return Err(LaunchError::StartupTimeout {
                    command,
                    timeout,
                    output: read_output(&output),
                });
            }
        }
    }
}

fn spawn_detached(binary: &OsStr, args: &[OsString], output: &Path) -> Result<Child, LaunchError> {
    let output_error = |source: io::Error| LaunchError::Output {
        path: output.to_path_buf(),
        source,
    };
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(output_error)?;
    }
    let stdout = File::create(output).map_err(output_error)?;
    let stderr = stdout.try_clone().map_err(output_error)?;

    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.spawn().map_err(|source| LaunchError::Spawn {
        binary: binary.to_os_string(),
        source,
    })
}

fn exit_status(child: &mut Child) -> Option<String> {
    match child.try_wait() {
        Ok(Some(status)) => Some(status.to_string()),
        Ok(None) => None,
        Err(error) => Some(format!("unknown status ({error})")),
    }
}

fn resolve_server_binary(binary_override: Option<&OsStr>) -> OsString {
    binary_override
        .map(OsString::from)
        .or_else(|| env::var_os(SERVER_BIN_ENV))
        .or_else(sibling_binary)
        .unwrap_or_else(|| OsString::from(DEFAULT_SERVER_BIN))
}

/// `kilnd` installed next to the running executable.
fn sibling_binary() -> Option<OsString> {
    let name = format!("{DEFAULT_SERVER_BIN}{}", env::consts::EXE_SUFFIX);
    let candidate = env::current_exe().ok()?.with_file_name(name);
    candidate.is_file().then(|| candidate.into_os_string())
}

fn render_command(binary: &OsStr, args: &[OsString]) -> String {
    std::iter::once(binary)
        .chain(args.iter().map(OsString::as_os_str))
        .map(OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_output(path: &Path) -> String {
    fs::read_to_string(path)
        .unwrap_or_else(|error| format!("<unable to read '{}': {error}>", path.display()))
}

/// Hosts servers on background threads of the current process.
///
/// Servers started here stop when [`InProcessLauncher::shutdown`] is called
/// or the launcher is dropped.
pub struct InProcessLauncher {
    factory: Arc<dyn CompilerFactory>,
    registry: Arc<PortFileRegistry>,
    servers: Mutex<Vec<RunningServer>>,
}

impl InProcessLauncher {
    /// Builds a launcher whose servers compile with `factory`.
    #[must_use]
    pub fn new(factory: Arc<dyn CompilerFactory>, registry: Arc<PortFileRegistry>) -> Self {
        Self {
            factory,
            registry,
            servers: Mutex::new(Vec::new()),
        }
    }

    /// Number of servers started by this launcher that have not stopped.
    #[must_use]
    pub fn running(&self) -> usize {
        self.servers()
            .iter()
            .filter(|server| !server.is_finished())
            .count()
    }

    /// Stops every server this launcher started and collects their reports.
    pub fn shutdown(&self) -> Vec<Result<ServerReport, ServerError>> {
        let servers = std::mem::take(&mut *self.servers());
        servers.into_iter().map(RunningServer::stop).collect()
    }

    fn servers(&self) -> std::sync::MutexGuard<'_, Vec<RunningServer>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServerLauncher for InProcessLauncher {
    fn launch(
        &self,
        settings: &ServerSettings,
        port_file: &PortFile,
        timeout: Duration,
    ) -> Result<PortFileValues, LaunchError> {
        match Server::bind(settings.clone(), &self.registry, Arc::clone(&self.factory)) {
            Ok(server) => {
                let values = PortFileValues::new(server.port(), server.cookie());
                info!(
                    target: SERVICE_TARGET,
                    port = values.port,
                    "started in-process compile server"
                );
                self.servers().push(server.spawn());
                Ok(values)
            }
            Err(ServerError::AlreadyRunning { port, .. }) => {
                info!(target: SERVICE_TARGET, port, "another server claimed the port file");
                Ok(port_file.wait_for_valid_values(timeout)?)
            }
            Err(source) => Err(LaunchError::Server { source }),
        }
    }
}

impl Drop for InProcessLauncher {
    fn drop(&mut self) {
        for outcome in self.shutdown() {
            if let Err(error) = outcome {
                warn!(target: SERVICE_TARGET, %error, "in-process server stopped with an error");
            }
        }
    }
}
