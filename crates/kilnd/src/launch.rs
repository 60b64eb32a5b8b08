//! Entry point used by the `kilnd` binary.

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use kiln_config::Config;
use kiln_portfile::PortFileRegistry;
use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;
use tracing::info;

use crate::compiler::{CommandCompiler, CommandCompilerFactory, CompilerFactory};
use crate::server::{SERVER_TARGET, Server, ServerError, ServerReport};
use crate::shutdown::{ShutdownError, watch_signals};
use crate::telemetry::{self, TelemetryError};

/// Compiler command used when none is configured.
pub const DEFAULT_COMPILER: &str = "javac";

/// Errors that stop `kilnd` before or while serving.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Config {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// The configured compiler command was blank.
    #[error("compiler command {command:?} names no program")]
    Compiler {
        /// Configured command line.
        command: String,
    },
    /// The server failed to start or stopped with an error.
    #[error(transparent)]
    Server(#[from] ServerError),
    /// Signal handlers could not be installed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Parses `args`, serves until stopped and maps the outcome to an exit code.
pub fn run<I, E>(args: I, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    E: Write,
{
    let outcome = Config::load_from_iter(args)
        .map_err(|source| LaunchError::Config { source })
        .and_then(|config| run_server(&config));
    match outcome {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            let _ = writeln!(stderr, "kilnd: {error}");
            ExitCode::FAILURE
        }
    }
}

/// Starts a server for `config` and blocks until it stops.
///
/// # Errors
///
/// Fails when telemetry, the compiler command, the port file or the listener
/// cannot be set up, or when the accept loop ends with an error.
pub fn run_server(config: &Config) -> Result<ServerReport, LaunchError> {
    telemetry::initialise(config)?;
    let settings = config.server_settings();
    let command = settings
        .compiler
        .clone()
        .unwrap_or_else(|| String::from(DEFAULT_COMPILER));
    let compiler =
        CommandCompiler::parse(&command).ok_or_else(|| LaunchError::Compiler { command })?;
    info!(target: SERVER_TARGET, program = compiler.program(), "starting kilnd");
    let factory: Arc<dyn CompilerFactory> = Arc::new(CommandCompilerFactory::new(compiler));

    let registry = PortFileRegistry::new();
    let server = Server::bind(settings, &registry, factory)?;
    watch_signals(server.handle())?;
    Ok(server.run()?)
}
