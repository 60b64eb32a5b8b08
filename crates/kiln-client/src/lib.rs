//! Client side of the Kiln compile server.
//!
//! [`ServiceClient`] finds the server recorded in a port file, starts one
//! through a [`ServerLauncher`] when none is running, and exchanges a single
//! request and response per compile. The `kiln` binary wraps the client in a
//! small command-line interface driven by [`run`].

mod cli;
mod config;
mod errors;
mod launcher;
pub mod paths;
mod service;
mod transport;

#[cfg(test)]
mod tests;

use std::ffi::OsString;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use kiln_config::Config;
use kiln_protocol::SysInfo;
use ortho_config::{OrthoConfig, OrthoError};
use thiserror::Error;

use cli::{Cli, CliCommand};
use config::split_arguments;

pub use errors::{ClientError, LaunchError};
pub use launcher::{DetachedLauncher, InProcessLauncher, ServerLauncher};
pub use service::{RetryPolicy, ServiceClient, exit_status};

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    CliUsage(clap::Error),
    #[error("kiln: failed to load configuration: {0}")]
    LoadConfiguration(Arc<OrthoError>),
    #[error("kiln: {0}")]
    Client(#[from] ClientError),
    #[error("kiln: failed to write output: {0}")]
    Output(#[from] io::Error),
}

/// Runs the `kiln` command with the given arguments and IO handles.
#[must_use]
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    run_with_launcher(args, stdout, stderr, Arc::new(DetachedLauncher::new()))
}

fn run_with_launcher<I, W, E>(
    args: I,
    stdout: &mut W,
    stderr: &mut E,
    launcher: Arc<dyn ServerLauncher>,
) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let args: Vec<OsString> = args.into_iter().collect();
    let split = split_arguments(&args);
    let outcome = Cli::try_parse_from(&split.command_arguments)
        .map_err(AppError::CliUsage)
        .and_then(|cli| {
            Config::load_from_iter(split.config_arguments.iter().cloned())
                .map_err(AppError::LoadConfiguration)
                .map(|config| (cli, config))
        })
        .and_then(|(cli, config)| {
            let client = ServiceClient::new(config.server_settings(), launcher);
            execute(&client, cli.command, stdout, stderr)
        });
    match outcome {
        Ok(exit_code) => exit_code,
        Err(AppError::CliUsage(error)) if !error.use_stderr() => {
            let _ = write!(stdout, "{error}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            let _ = writeln!(stderr, "{error}");
            ExitCode::FAILURE
        }
    }
}

fn execute<W: Write, E: Write>(
    client: &ServiceClient,
    command: CliCommand,
    stdout: &mut W,
    stderr: &mut E,
) -> Result<ExitCode, AppError> {
    match command {
        CliCommand::Compile {
            id,
            sources,
            visible,
            arguments,
        } => {
            let result = client.compile(
                &id,
                &arguments,
                &sources.into_iter().collect(),
                &visible.into_iter().collect(),
            );
            write_stream(stdout, &result.stdout)?;
            write_stream(stderr, &result.stderr)?;
            Ok(ExitCode::from(exit_status(result.return_code)))
        }
        CliCommand::Sysinfo => {
            let info = client.sys_info();
            writeln!(stdout, "num_cores={}", info.num_cores)?;
            writeln!(stdout, "max_memory={}", info.max_memory)?;
            if info == SysInfo::UNAVAILABLE {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        CliCommand::Stop => {
            let path = client.settings().portfile.display();
            if client.stop_server()? {
                writeln!(stdout, "asked the compile server recorded in {path} to stop")?;
            } else {
                writeln!(stdout, "no compile server is recorded in {path}")?;
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Copies captured compiler output, terminating the last line.
fn write_stream<W: Write>(writer: &mut W, text: &str) -> io::Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    writer.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        writer.write_all(b"\n")?;
    }
    writer.flush()
}
