//! Compiler that runs an external program for every request.

use std::process::{Command, Output};

use kiln_protocol::ReturnCode;
use tracing::debug;

use super::{CompileInvocation, CompileOutput, Compiler, CompilerFactory};
use crate::pool::SubtaskScope;
use crate::worker::WORKER_TARGET;

/// Runs `program [fixed args] options files` in the client's directory.
///
/// Keeps no state between requests and reports no package metadata; it is the
/// fallback used when the server is started without an embedded front-end.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    program: String,
    fixed_args: Vec<String>,
}

impl CommandCompiler {
    /// Parses a whitespace separated command line such as `javac -J-Xmx1g`.
    ///
    /// Returns `None` when `command_line` is blank.
    #[must_use]
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut words = command_line.split_whitespace().map(str::to_owned);
        let program = words.next()?;
        Some(Self {
            program,
            fixed_args: words.collect(),
        })
    }

    /// Program this compiler executes.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Compiler for CommandCompiler {
    fn compile(&mut self, invocation: &CompileInvocation, _subtasks: &SubtaskScope) -> CompileOutput {
        let files = invocation.input_files();
        if let Some(hidden) = files.iter().find(|file| !invocation.view.is_path_visible(file)) {
            return CompileOutput::failure(
                ReturnCode::ErrorFatal,
                format!(
                    "{} is not among the visible sources of this compilation",
                    hidden.display()
                ),
            );
        }

        debug!(
            target: WORKER_TARGET,
            id = %invocation.id,
            program = %self.program,
            files = files.len(),
            "running compiler command"
        );
        let spawned = Command::new(&self.program)
            .args(&self.fixed_args)
            .args(&invocation.options)
            .args(&files)
            .current_dir(&invocation.cwd)
            .output();
        match spawned {
            Ok(output) => collect(output),
            Err(error) => CompileOutput::failure(
                ReturnCode::ErrorFatal,
                format!("failed to run compiler '{}': {error}", self.program),
            ),
        }
    }
}

fn collect(output: Output) -> CompileOutput {
    let return_code = match output.status.code() {
        Some(0) => ReturnCode::Ok,
        Some(code) => ReturnCode::Exit(code),
        None => ReturnCode::ErrorFatal,
    };
    CompileOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        ..CompileOutput::with_code(return_code)
    }
}

/// Hands every worker its own [`CommandCompiler`].
#[derive(Debug, Clone)]
pub struct CommandCompilerFactory {
    template: CommandCompiler,
}

impl CommandCompilerFactory {
    /// Builds a factory for the given command line.
    #[must_use]
    pub const fn new(template: CommandCompiler) -> Self {
        Self { template }
    }
}

impl CompilerFactory for CommandCompilerFactory {
    fn create(&self) -> Box<dyn Compiler> {
        Box::new(self.template.clone())
    }
}
