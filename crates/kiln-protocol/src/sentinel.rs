//! Section sentinels of the wire protocol.

/// Protocol version carried in the cookie sentinel.
pub const PROTOCOL_ID: &str = "V2";

/// Opens a request; followed by the server cookie.
pub const COOKIE: &str = "----THE-COOKIE-V2----";
/// Followed by the client's working directory.
pub const CWD: &str = "----THE-CWD----";
/// Followed by the invocation id.
pub const ID: &str = "----THE-ID----";
/// Followed by option and explicit source file lines.
pub const ARGS: &str = "----THE-ARGS----";
/// Followed by the URIs to compile.
pub const SOURCES_TO_COMPILE: &str = "----THE-SOURCES-TO-COMPILE----";
/// Followed by the URIs the compile may see.
pub const VISIBLE_SOURCES: &str = "----THE-VISIBLE-SOURCES----";
/// Terminates both requests and responses.
pub const END: &str = "----THE-END----";
/// Opens the captured compiler stdout.
pub const STDOUT: &str = "----THE-STDOUT----";
/// Opens the captured compiler stderr.
pub const STDERR: &str = "----THE-STDERR----";
/// Opens the package to artifact block.
pub const PACKAGE_ARTIFACTS: &str = "----THE-PACKAGE_ARTIFACTS----";
/// Opens the package to dependency block.
pub const PACKAGE_DEPENDENCIES: &str = "----THE-PACKAGE_DEPENDENCIES----";
/// Opens the package to public API fingerprint block.
pub const PACKAGE_PUBLIC_APIS: &str = "----THE-PACKAGE-PUBLIC-APIS----";
/// Opens the server capacity block.
pub const SYSINFO: &str = "----THE-SYSINFO----";
/// Opens the return code block.
pub const RETURN_CODE: &str = "----THE-RETURN-CODE----";

const ALL: [&str; 14] = [
    COOKIE,
    CWD,
    ID,
    ARGS,
    SOURCES_TO_COMPILE,
    VISIBLE_SOURCES,
    END,
    STDOUT,
    STDERR,
    PACKAGE_ARTIFACTS,
    PACKAGE_DEPENDENCIES,
    PACKAGE_PUBLIC_APIS,
    SYSINFO,
    RETURN_CODE,
];

/// Returns true when `line` is one of the protocol sentinels.
#[must_use]
pub fn is_sentinel(line: &str) -> bool {
    ALL.contains(&line)
}

/// Returns true when `line` looks like a sentinel of any protocol version.
///
/// Used to report version mismatches rather than generic desyncs.
#[must_use]
pub fn looks_like_sentinel(line: &str) -> bool {
    line.starts_with("----THE-") && line.ends_with("----")
}
