//! Seam between the server and the compiler front-end it keeps warm.
//!
//! The server never compiles anything itself. Each pooled worker owns one
//! [`Compiler`] built by the configured [`CompilerFactory`] and reuses it for
//! every request it serves, so whatever state the compiler keeps between
//! calls stays warm for the lifetime of the server.

mod command;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use kiln_protocol::{CompilationResult, CompileRequest, ReturnCode};
use url::Url;

use crate::pool::SubtaskScope;

pub use command::{CommandCompiler, CommandCompilerFactory};

/// A warm compiler front-end owned by one worker.
pub trait Compiler: Send {
    /// Runs one compilation.
    ///
    /// Ancillary work may be handed to `subtasks`; the worker waits for all
    /// of it before answering the client.
    fn compile(&mut self, invocation: &CompileInvocation, subtasks: &SubtaskScope)
    -> CompileOutput;
}

/// Builds compilers for newly created workers.
pub trait CompilerFactory: Send + Sync {
    /// Creates a fresh compiler.
    fn create(&self) -> Box<dyn Compiler>;
}

impl<F> CompilerFactory for F
where
    F: Fn() -> Box<dyn Compiler> + Send + Sync,
{
    fn create(&self) -> Box<dyn Compiler> {
        self()
    }
}

/// Restricts which sources a compilation may read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceView {
    visible: Option<BTreeSet<Url>>,
}

impl SourceView {
    /// A view through which every file is visible.
    #[must_use]
    pub const fn unrestricted() -> Self {
        Self { visible: None }
    }

    /// Builds the view of a request: its visible sources plus the sources it
    /// compiles, or everything when it names no visible sources.
    #[must_use]
    pub fn from_request(request: &CompileRequest) -> Self {
        if request.visible_sources.is_empty() {
            return Self::unrestricted();
        }
        let visible = request
            .visible_sources
            .union(&request.sources_to_compile)
            .cloned()
            .collect();
        Self {
            visible: Some(visible),
        }
    }

    /// Returns true when the view hides some files.
    #[must_use]
    pub const fn is_restricted(&self) -> bool {
        self.visible.is_some()
    }

    /// Returns true when `uri` may be read.
    #[must_use]
    pub fn is_visible(&self, uri: &Url) -> bool {
        self.visible
            .as_ref()
            .is_none_or(|visible| visible.contains(uri))
    }

    /// Returns true when the absolute `path` may be read.
    #[must_use]
    pub fn is_path_visible(&self, path: &Path) -> bool {
        match &self.visible {
            None => true,
            Some(visible) => {
                Url::from_file_path(path).is_ok_and(|uri| visible.contains(&uri))
            }
        }
    }
}

/// Everything a compiler needs to know about one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileInvocation {
    /// Caller-chosen id, for logs.
    pub id: String,
    /// Working directory of the client.
    pub cwd: PathBuf,
    /// Compiler options in order.
    pub options: Vec<String>,
    /// Source files named on the command line, resolved against `cwd`.
    pub explicit_files: Vec<PathBuf>,
    /// Sources the compile must translate.
    pub sources_to_compile: BTreeSet<Url>,
    /// What the compile may see.
    pub view: SourceView,
}

impl CompileInvocation {
    /// Derives an invocation from a decoded request.
    #[must_use]
    pub fn from_request(request: &CompileRequest) -> Self {
        let cwd = PathBuf::from(&request.cwd);
        let explicit_files = request
            .explicit_files
            .iter()
            .map(|file| cwd.join(file))
            .collect();
        Self {
            id: request.id.clone(),
            explicit_files,
            options: request.options.clone(),
            sources_to_compile: request.sources_to_compile.clone(),
            view: SourceView::from_request(request),
            cwd,
        }
    }

    /// Files to hand to the compiler: explicit files first, then the
    /// sources to compile that were not already named.
    #[must_use]
    pub fn input_files(&self) -> Vec<PathBuf> {
        let mut files = self.explicit_files.clone();
        for uri in &self.sources_to_compile {
            if let Ok(path) = uri.to_file_path()
                && !files.contains(&path)
            {
                files.push(path);
            }
        }
        files
    }
}

/// What a compiler reports back for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutput {
    /// Compiler verdict; [`ReturnCode::Exit`] carries nonzero exit codes.
    pub return_code: ReturnCode,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Artifacts produced per package.
    pub package_artifacts: BTreeMap<String, BTreeSet<Url>>,
    /// Packages each package depends on.
    pub package_dependencies: BTreeMap<String, BTreeSet<String>>,
    /// Public API fingerprint per package.
    pub package_pubapis: BTreeMap<String, String>,
}

impl CompileOutput {
    /// A successful output with no metadata.
    #[must_use]
    pub fn success() -> Self {
        Self::with_code(ReturnCode::Ok)
    }

    /// A failed output carrying a diagnostic.
    #[must_use]
    pub fn failure(return_code: ReturnCode, diagnostic: impl Into<String>) -> Self {
        Self {
            stderr: diagnostic.into(),
            ..Self::with_code(return_code)
        }
    }

    /// An output with the given verdict and nothing else.
    #[must_use]
    pub fn with_code(return_code: ReturnCode) -> Self {
        Self {
            return_code,
            stdout: String::new(),
            stderr: String::new(),
            package_artifacts: BTreeMap::new(),
            package_dependencies: BTreeMap::new(),
            package_pubapis: BTreeMap::new(),
        }
    }
}

impl Default for CompileOutput {
    fn default() -> Self {
        Self::success()
    }
}

impl From<CompileOutput> for CompilationResult {
    fn from(output: CompileOutput) -> Self {
        let mut result = Self::new(output.return_code);
        result.stdout = output.stdout;
        result.stderr = output.stderr;
        result.package_artifacts = output.package_artifacts;
        result.package_dependencies = output.package_dependencies;
        result.package_pubapis = output.package_pubapis;
        result.ensure_baselib();
        result
    }
}
