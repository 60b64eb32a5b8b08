//! Process-level checks of the `kiln` binary.

use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

#[test]
fn help_lists_the_commands() {
    let mut command = cargo_bin_cmd!("kiln");
    command.arg("--help");
    command
        .assert()
        .success()
        .stdout(contains("compile"))
        .stdout(contains("sysinfo"))
        .stdout(contains("stop"));
}

#[test]
fn rejects_unparseable_configuration() {
    let mut command = cargo_bin_cmd!("kiln");
    command.args(["--poolsize", "many", "sysinfo"]);
    command
        .assert()
        .failure()
        .stderr(contains("kiln: failed to load configuration"));
}

#[test]
fn stop_without_a_server_succeeds() {
    let dir = TempDir::new().expect("temp dir");
    let portfile = dir.path().join("kilnd.port");

    let mut command = cargo_bin_cmd!("kiln");
    command.arg("--portfile").arg(&portfile).arg("stop");
    command
        .assert()
        .success()
        .stdout(contains("no compile server is recorded"));
}

#[test]
fn unlaunchable_server_fails_the_compile() {
    let dir = TempDir::new().expect("temp dir");
    let portfile = dir.path().join("kilnd.port");

    let mut command = cargo_bin_cmd!("kiln");
    command
        .env("KILND_BIN", dir.path().join("missing-kilnd"))
        .arg("--portfile")
        .arg(&portfile)
        .args(["compile", "--", "-g"]);
    command
        .assert()
        .code(1)
        .stderr(contains("failed to launch compile server binary"));
}

/// `kilnd` from the same target directory, when it has been built.
fn built_server() -> Option<PathBuf> {
    let deps = env::current_exe().ok()?.parent()?.to_path_buf();
    let candidate = deps
        .parent()?
        .join(format!("kilnd{}", env::consts::EXE_SUFFIX));
    candidate.is_file().then_some(candidate)
}

#[cfg(unix)]
#[test]
fn detached_server_compiles_and_stops() {
    let Some(kilnd) = built_server() else {
        return;
    };
    let dir = TempDir::new().expect("temp dir");
    let portfile = dir.path().join("kilnd.port");
    let config = [
        String::from("--portfile"),
        portfile.display().to_string(),
        String::from("--keepalive"),
        String::from("30"),
        String::from("--compiler"),
        String::from("true"),
    ];

    let mut compile = cargo_bin_cmd!("kiln");
    compile
        .env("KILND_BIN", &kilnd)
        .args(&config)
        .args(["compile", "--", "-g"]);
    compile.assert().success();
    assert!(portfile.exists(), "detached server should own the port file");

    let mut stop = cargo_bin_cmd!("kiln");
    stop.args(&config).arg("stop");
    stop.assert().success().stdout(contains("to stop"));

    let deadline = Instant::now() + Duration::from_secs(20);
    while portfile.exists() {
        assert!(Instant::now() < deadline, "server did not stop");
        thread::sleep(Duration::from_millis(100));
    }
}
