//! Compile requests as carried over the wire.

use std::collections::BTreeSet;

use url::Url;

/// Compile request sent by a client for a single invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileRequest {
    /// Secret of the server the client believes it is talking to.
    pub cookie: u64,
    /// Working directory of the requesting process.
    pub cwd: String,
    /// Caller-chosen id used to correlate logs.
    pub id: String,
    /// Compiler options in the order they were given.
    pub options: Vec<String>,
    /// Source files named explicitly on the command line.
    pub explicit_files: Vec<String>,
    /// Sources the compile must translate.
    pub sources_to_compile: BTreeSet<Url>,
    /// The only sources the compile may see when non-empty.
    pub visible_sources: BTreeSet<Url>,
}

impl CompileRequest {
    /// Builds a request by classifying raw arguments into options and files.
    #[must_use]
    pub fn from_args<I, S>(id: impl Into<String>, args: I, suffixes: &SourceSuffixes) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut request = Self {
            id: id.into(),
            ..Self::default()
        };
        for arg in args {
            request.push_arg(arg.into(), suffixes);
        }
        request
    }

    /// Appends an argument line, routing it by [`SourceSuffixes::is_source_file`].
    pub fn push_arg(&mut self, arg: String, suffixes: &SourceSuffixes) {
        if suffixes.is_source_file(&arg) {
            self.explicit_files.push(arg);
        } else {
            self.options.push(arg);
        }
    }

    /// Returns true when the request names nothing to compile.
    ///
    /// Clients send empty requests to query the server's capacity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
            && self.explicit_files.is_empty()
            && self.sources_to_compile.is_empty()
    }

    /// Returns true when `uri` may be seen by this compile.
    ///
    /// With no visible sources every file is visible; sources to compile are
    /// always visible.
    #[must_use]
    pub fn is_visible(&self, uri: &Url) -> bool {
        self.visible_sources.is_empty()
            || self.visible_sources.contains(uri)
            || self.sources_to_compile.contains(uri)
    }
}

/// File name suffixes that mark an argument as an explicit source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSuffixes(Vec<String>);

impl SourceSuffixes {
    /// Builds a suffix set; each suffix should include its leading dot.
    #[must_use]
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(suffixes.into_iter().map(Into::into).collect())
    }

    /// An argument is a source file when it does not start with `-` and ends
    /// with a recognised suffix.
    #[must_use]
    pub fn is_source_file(&self, arg: &str) -> bool {
        !arg.starts_with('-') && self.0.iter().any(|suffix| arg.ends_with(suffix.as_str()))
    }
}

impl Default for SourceSuffixes {
    fn default() -> Self {
        Self::new([".java"])
    }
}
