use camino::Utf8PathBuf;
use std::env;
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use libc::geteuid;

#[cfg(unix)]
use dirs::runtime_dir;

use crate::logging::LogFormat;

/// Idle time after the last finished request before the server retires.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(120);

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

const PORTFILE_NAME: &str = "kilnd.port";
const FALLBACK_POOLSIZE: usize = 4;

/// Default logging format for the binaries.
#[must_use]
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Number of concurrent compilations when none is configured.
#[must_use]
pub fn default_poolsize() -> usize {
    thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(FALLBACK_POOLSIZE)
}

/// Computes the default port file location shared by server and clients.
#[must_use]
pub fn default_portfile() -> Utf8PathBuf {
    default_runtime_directory().join(PORTFILE_NAME)
}

#[cfg(unix)]
fn default_runtime_directory() -> Utf8PathBuf {
    let (mut base, apply_namespace) = match runtime_base_directory() {
        Some(dir) => (dir, false),
        None => (fallback_base_directory(), true),
    };

    base.push("kiln");
    if apply_namespace {
        base.push(user_namespace());
    }
    base
}

#[cfg(unix)]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn default_runtime_directory() -> Utf8PathBuf {
    let mut base = fallback_base_directory();
    base.push("kiln");
    base
}
