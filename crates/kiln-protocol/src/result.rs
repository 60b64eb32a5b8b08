//! Compilation results and the metadata returned with them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use url::Url;

/// Synthetic package every compiled package implicitly depends on.
pub const BASELIB: &str = ":baselib";

const OK_CODE: i32 = 0;
const ERROR_FATAL_CODE: i32 = -1;
const ERROR_BUT_TRY_AGAIN_CODE: i32 = -4712;

/// Outcome of a request as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    /// The compile succeeded.
    Ok,
    /// A transient failure; the client should retry.
    ErrorButTryAgain,
    /// A final failure that retrying cannot fix.
    ErrorFatal,
    /// The compiler exited with this nonzero status.
    Exit(i32),
}

impl ReturnCode {
    /// Decodes a wire integer.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            OK_CODE => Self::Ok,
            ERROR_FATAL_CODE => Self::ErrorFatal,
            ERROR_BUT_TRY_AGAIN_CODE => Self::ErrorButTryAgain,
            other => Self::Exit(other),
        }
    }

    /// Encodes the wire integer.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => OK_CODE,
            Self::ErrorFatal => ERROR_FATAL_CODE,
            Self::ErrorButTryAgain => ERROR_BUT_TRY_AGAIN_CODE,
            Self::Exit(code) => code,
        }
    }

    /// True only for [`ReturnCode::Ok`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// True when the client should retry.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::ErrorButTryAgain)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => formatter.write_str("ok"),
            Self::ErrorButTryAgain => formatter.write_str("error-but-try-again"),
            Self::ErrorFatal => formatter.write_str("error-fatal"),
            Self::Exit(code) => write!(formatter, "exit({code})"),
        }
    }
}

/// Capacity of the server host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SysInfo {
    /// Number of cores available to the server, or -1.
    pub num_cores: i64,
    /// Memory available to the server in bytes, or -1.
    pub max_memory: i64,
}

impl SysInfo {
    /// Reported when the server could not be queried.
    pub const UNAVAILABLE: Self = Self {
        num_cores: -1,
        max_memory: -1,
    };
}

impl Default for SysInfo {
    fn default() -> Self {
        Self::UNAVAILABLE
    }
}

/// Everything a client learns from one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationResult {
    /// Overall outcome.
    pub return_code: ReturnCode,
    /// Artifacts produced per package.
    pub package_artifacts: BTreeMap<String, BTreeSet<Url>>,
    /// Packages each package depends on.
    pub package_dependencies: BTreeMap<String, BTreeSet<String>>,
    /// Public API fingerprint per package.
    pub package_pubapis: BTreeMap<String, String>,
    /// Capacity of the server that handled the request.
    pub sys_info: SysInfo,
    /// Captured compiler stdout.
    pub stdout: String,
    /// Captured compiler stderr and server diagnostics.
    pub stderr: String,
}

impl CompilationResult {
    /// Builds an empty result carrying `return_code`.
    #[must_use]
    pub fn new(return_code: ReturnCode) -> Self {
        Self {
            return_code,
            package_artifacts: BTreeMap::new(),
            package_dependencies: BTreeMap::new(),
            package_pubapis: BTreeMap::new(),
            sys_info: SysInfo::UNAVAILABLE,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Builds a failed result whose stderr explains the failure.
    #[must_use]
    pub fn failure(return_code: ReturnCode, diagnostic: impl Into<String>) -> Self {
        let mut result = Self::new(return_code);
        result.stderr = diagnostic.into();
        result
    }

    /// Appends a diagnostic line to stderr.
    pub fn append_stderr(&mut self, diagnostic: &str) {
        if !self.stderr.is_empty() && !self.stderr.ends_with('\n') {
            self.stderr.push('\n');
        }
        self.stderr.push_str(diagnostic);
    }

    /// Adds [`BASELIB`] to the dependency set of every known package.
    pub fn ensure_baselib(&mut self) {
        let packages: BTreeSet<String> = self
            .package_artifacts
            .keys()
            .chain(self.package_pubapis.keys())
            .cloned()
            .collect();
        for package in packages {
            self.package_dependencies.entry(package).or_default();
        }
        for dependencies in self.package_dependencies.values_mut() {
            dependencies.insert(BASELIB.to_owned());
        }
    }
}

impl Default for CompilationResult {
    fn default() -> Self {
        Self::new(ReturnCode::Ok)
    }
}
