//! Verifies the layering of defaults, files, environment and CLI flags.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::sync::{Mutex, MutexGuard};

use kiln_config::{Config, LogFormat};
use once_cell::sync::Lazy;
use ortho_config::OrthoConfig;
use rstest::{fixture, rstest};
use tempfile::TempDir;

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct EnvOverride {
    key: &'static str,
    previous: Option<OsString>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvOverride {
    fn set_var(key: &'static str, value: &OsStr) -> Self {
        let guard = ENV_MUTEX
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let previous = std::env::var_os(key);
        // Environment mutation is unsafe in edition 2024; the override is
        // reverted in `Drop` while the mutex is still held.
        unsafe { std::env::set_var(key, value) };
        Self {
            key,
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => unsafe { std::env::set_var(self.key, value) },
            None => unsafe { std::env::remove_var(self.key) },
        }
    }
}

#[fixture]
fn temp_dir() -> TempDir {
    TempDir::new().expect("create temp dir")
}

fn write_config(dir: &TempDir, contents: &str) -> OsString {
    let path = dir.path().join("kiln.toml");
    fs::write(&path, contents).expect("write config file");
    path.into_os_string()
}

#[rstest]
fn file_values_apply_when_nothing_overrides_them(temp_dir: TempDir) {
    let _guard = ENV_MUTEX
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let path = write_config(&temp_dir, "poolsize = 3\nkeepalive = 45\nlog_format = \"compact\"\n");
    let args = vec![
        OsString::from("kilnd"),
        OsString::from("--config-path"),
        path,
    ];

    let config = Config::load_from_iter(args).expect("load config");

    assert_eq!(config.poolsize(), 3);
    assert_eq!(config.keepalive().as_secs(), 45);
    assert_eq!(config.log_format(), LogFormat::Compact);
}

#[rstest]
fn environment_overrides_file(temp_dir: TempDir) {
    let path = write_config(&temp_dir, "poolsize = 3\n");
    let _env = EnvOverride::set_var("KILN_POOLSIZE", OsStr::new("6"));
    let args = vec![
        OsString::from("kilnd"),
        OsString::from("--config-path"),
        path,
    ];

    let config = Config::load_from_iter(args).expect("load config");

    assert_eq!(config.poolsize(), 6);
}

#[rstest]
fn cli_flags_override_environment(temp_dir: TempDir) {
    let path = write_config(&temp_dir, "keepalive = 10\n");
    let _env = EnvOverride::set_var("KILN_KEEPALIVE", OsStr::new("20"));
    let args = vec![
        OsString::from("kilnd"),
        OsString::from("--config-path"),
        path,
        OsString::from("--keepalive"),
        OsString::from("30"),
    ];

    let config = Config::load_from_iter(args).expect("load config");

    assert_eq!(config.keepalive().as_secs(), 30);
}
