//! Request and response codecs.
//!
//! Writers emit sentinel-delimited sections in a fixed order. Readers consume
//! the same order, collecting payload lines until the next expected sentinel.
//! Any other sentinel in between is a desync, and end-of-stream before the
//! final [`sentinel::END`] is reported as [`ProtocolError::UnexpectedEof`].

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Write};

use url::Url;

use crate::escape::{escape, join_lines, text_lines, unescape};
use crate::request::{CompileRequest, SourceSuffixes};
use crate::result::{CompilationResult, ReturnCode, SysInfo};
use crate::sentinel;
use crate::ProtocolError;

const PACKAGE_PREFIX: char = '+';
const ENTRY_PREFIX: char = ' ';
const NUM_CORES_KEY: &str = "num_cores";
const MAX_MEMORY_KEY: &str = "max_memory";

/// Writes a complete request and flushes the writer.
pub fn write_request<W: Write>(
    writer: &mut W,
    request: &CompileRequest,
) -> Result<(), ProtocolError> {
    writeln!(writer, "{}", sentinel::COOKIE)?;
    writeln!(writer, "{}", request.cookie)?;
    writeln!(writer, "{}", sentinel::CWD)?;
    writeln!(writer, "{}", escape(&request.cwd))?;
    writeln!(writer, "{}", sentinel::ID)?;
    writeln!(writer, "{}", escape(&request.id))?;
    writeln!(writer, "{}", sentinel::ARGS)?;
    for arg in request.options.iter().chain(&request.explicit_files) {
        writeln!(writer, "{}", escape(arg))?;
    }
    writeln!(writer, "{}", sentinel::SOURCES_TO_COMPILE)?;
    for uri in &request.sources_to_compile {
        writeln!(writer, "{}", escape(uri.as_str()))?;
    }
    writeln!(writer, "{}", sentinel::VISIBLE_SOURCES)?;
    for uri in &request.visible_sources {
        writeln!(writer, "{}", escape(uri.as_str()))?;
    }
    writeln!(writer, "{}", sentinel::END)?;
    writer.flush()?;
    Ok(())
}

/// Reads a complete request, classifying arguments with `suffixes`.
pub fn read_request<R: BufRead>(
    reader: &mut R,
    suffixes: &SourceSuffixes,
) -> Result<CompileRequest, ProtocolError> {
    let mut lines = LineReader::new(reader);
    let header = lines.next("request header")?;
    if header != sentinel::COOKIE {
        if sentinel::looks_like_sentinel(&header) {
            return Err(ProtocolError::UnsupportedVersion { found: header });
        }
        return Err(ProtocolError::UnexpectedLine {
            expected: sentinel::COOKIE,
            found: header,
        });
    }
    let cookie_line = lines.next("cookie")?;
    let cookie = cookie_line
        .trim()
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidCookie { value: cookie_line })?;
    lines.expect(sentinel::CWD)?;
    let cwd = unescape(&lines.next("working directory")?);
    lines.expect(sentinel::ID)?;
    let id = unescape(&lines.next("invocation id")?);
    lines.expect(sentinel::ARGS)?;

    let mut request = CompileRequest {
        cookie,
        cwd,
        id,
        ..CompileRequest::default()
    };
    for line in lines.until(sentinel::SOURCES_TO_COMPILE)? {
        request.push_arg(unescape(&line), suffixes);
    }
    request.sources_to_compile = parse_uris(lines.until(sentinel::VISIBLE_SOURCES)?)?;
    request.visible_sources = parse_uris(lines.until(sentinel::END)?)?;
    Ok(request)
}

/// Writes a complete response and flushes the writer.
pub fn write_response<W: Write>(
    writer: &mut W,
    result: &CompilationResult,
) -> Result<(), ProtocolError> {
    writeln!(writer, "{}", sentinel::STDOUT)?;
    for line in text_lines(&result.stdout) {
        writeln!(writer, "{line}")?;
    }
    writeln!(writer, "{}", sentinel::STDERR)?;
    for line in text_lines(&result.stderr) {
        writeln!(writer, "{line}")?;
    }

    writeln!(writer, "{}", sentinel::PACKAGE_ARTIFACTS)?;
    for (package, artifacts) in &result.package_artifacts {
        write_package(writer, package, artifacts.iter().map(Url::as_str))?;
    }
    writeln!(writer, "{}", sentinel::PACKAGE_DEPENDENCIES)?;
    for (package, dependencies) in &result.package_dependencies {
        write_package(writer, package, dependencies.iter().map(String::as_str))?;
    }
    writeln!(writer, "{}", sentinel::PACKAGE_PUBLIC_APIS)?;
    for (package, pubapi) in &result.package_pubapis {
        write_package(writer, package, pubapi.split('\n'))?;
    }

    writeln!(writer, "{}", sentinel::SYSINFO)?;
    writeln!(writer, "{NUM_CORES_KEY}={}", result.sys_info.num_cores)?;
    writeln!(writer, "{MAX_MEMORY_KEY}={}", result.sys_info.max_memory)?;
    writeln!(writer, "{}", sentinel::RETURN_CODE)?;
    writeln!(writer, "{}", result.return_code.code())?;
    writeln!(writer, "{}", sentinel::END)?;
    writer.flush()?;
    Ok(())
}

/// Reads a complete response.
pub fn read_response<R: BufRead>(reader: &mut R) -> Result<CompilationResult, ProtocolError> {
    let mut lines = LineReader::new(reader);
    lines.expect(sentinel::STDOUT)?;
    let stdout = join_lines(&lines.until(sentinel::STDERR)?);
    let stderr = join_lines(&lines.until(sentinel::PACKAGE_ARTIFACTS)?);

    let artifacts = read_packages(
        lines.until(sentinel::PACKAGE_DEPENDENCIES)?,
        sentinel::PACKAGE_ARTIFACTS,
    )?;
    let dependencies = read_packages(
        lines.until(sentinel::PACKAGE_PUBLIC_APIS)?,
        sentinel::PACKAGE_DEPENDENCIES,
    )?;
    let pubapis = read_packages(lines.until(sentinel::SYSINFO)?, sentinel::PACKAGE_PUBLIC_APIS)?;
    let sys_info = parse_sys_info(&lines.until(sentinel::RETURN_CODE)?)?;
    let return_code = parse_return_code(&lines.until(sentinel::END)?)?;

    let mut result = CompilationResult::new(return_code);
    result.stdout = stdout;
    result.stderr = stderr;
    result.sys_info = sys_info;
    for (package, entries) in artifacts {
        result
            .package_artifacts
            .insert(package, parse_uris(entries)?);
    }
    result.package_dependencies = dependencies
        .into_iter()
        .map(|(package, entries)| (package, entries.into_iter().collect()))
        .collect();
    result.package_pubapis = pubapis
        .into_iter()
        .map(|(package, entries)| (package, entries.join("\n")))
        .collect();
    result.ensure_baselib();
    Ok(result)
}

fn write_package<'a, W, I>(writer: &mut W, package: &str, entries: I) -> Result<(), ProtocolError>
where
    W: Write,
    I: Iterator<Item = &'a str>,
{
    writeln!(writer, "{PACKAGE_PREFIX}{}", escape(package))?;
    for entry in entries {
        writeln!(writer, "{ENTRY_PREFIX}{}", escape(entry))?;
    }
    Ok(())
}

/// Groups `+package` headers with the entries indented below them.
fn read_packages(
    lines: Vec<String>,
    section: &'static str,
) -> Result<BTreeMap<String, Vec<String>>, ProtocolError> {
    let mut packages = BTreeMap::new();
    let mut current: Option<(String, Vec<String>)> = None;
    for line in lines {
        if let Some(name) = line.strip_prefix(PACKAGE_PREFIX) {
            if let Some((package, entries)) = current.take() {
                packages.insert(package, entries);
            }
            current = Some((unescape(name), Vec::new()));
            continue;
        }
        match (line.strip_prefix(ENTRY_PREFIX), current.as_mut()) {
            (Some(entry), Some((_, entries))) => entries.push(unescape(entry)),
            _ => return Err(ProtocolError::MalformedPackageBlock { section, line }),
        }
    }
    if let Some((package, entries)) = current {
        packages.insert(package, entries);
    }
    Ok(packages)
}

fn parse_uris(lines: Vec<String>) -> Result<BTreeSet<Url>, ProtocolError> {
    lines
        .into_iter()
        .map(|line| {
            let value = unescape(&line);
            Url::parse(&value).map_err(|source| ProtocolError::InvalidUri { value, source })
        })
        .collect()
}

fn parse_sys_info(lines: &[String]) -> Result<SysInfo, ProtocolError> {
    let mut info = SysInfo::UNAVAILABLE;
    for line in lines {
        let Some((key, value)) = line.split_once('=') else {
            return Err(ProtocolError::InvalidSysInfo { line: line.clone() });
        };
        let parsed = value
            .trim()
            .parse::<i64>()
            .map_err(|_| ProtocolError::InvalidSysInfo { line: line.clone() })?;
        match key.trim() {
            NUM_CORES_KEY => info.num_cores = parsed,
            MAX_MEMORY_KEY => info.max_memory = parsed,
            _ => {}
        }
    }
    Ok(info)
}

fn parse_return_code(lines: &[String]) -> Result<ReturnCode, ProtocolError> {
    let [line] = lines else {
        return Err(ProtocolError::InvalidReturnCode {
            value: lines.join("\n"),
        });
    };
    line.trim()
        .parse::<i32>()
        .map(ReturnCode::from_code)
        .map_err(|_| ProtocolError::InvalidReturnCode {
            value: line.clone(),
        })
}

/// Reads protocol lines, treating end-of-stream as a violation.
struct LineReader<'a, R> {
    inner: &'a mut R,
}

impl<'a, R: BufRead> LineReader<'a, R> {
    fn new(inner: &'a mut R) -> Self {
        Self { inner }
    }

    fn next(&mut self, expected: &'static str) -> Result<String, ProtocolError> {
        let mut line = String::new();
        if self.inner.read_line(&mut line)? == 0 {
            return Err(ProtocolError::UnexpectedEof { expected });
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(line)
    }

    fn expect(&mut self, expected: &'static str) -> Result<(), ProtocolError> {
        let line = self.next(expected)?;
        if line == expected {
            Ok(())
        } else {
            Err(ProtocolError::UnexpectedLine {
                expected,
                found: line,
            })
        }
    }

    /// Collects payload lines up to (and consuming) the `terminator` sentinel.
    fn until(&mut self, terminator: &'static str) -> Result<Vec<String>, ProtocolError> {
        let mut lines = Vec::new();
        loop {
            let line = self.next(terminator)?;
            if line == terminator {
                return Ok(lines);
            }
            if sentinel::is_sentinel(&line) {
                return Err(ProtocolError::UnexpectedLine {
                    expected: terminator,
                    found: line,
                });
            }
            lines.push(line);
        }
    }
}

#[cfg(test)]
mod tests;
