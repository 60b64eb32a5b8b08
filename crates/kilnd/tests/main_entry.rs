//! Process-level checks of the `kilnd` binary.

use std::net::{Ipv4Addr, TcpListener};

use assert_cmd::cargo::cargo_bin_cmd;
use kiln_portfile::{PortFile, PortFileValues};
use predicates::str::contains;
use tempfile::TempDir;

#[test]
fn rejects_unparseable_flags() {
    let mut command = cargo_bin_cmd!("kilnd");
    command.args(["--poolsize", "many"]);
    command
        .assert()
        .failure()
        .stderr(contains("kilnd: failed to load configuration"));
}

#[test]
fn refuses_to_replace_a_live_server() {
    let dir = TempDir::new().expect("temp dir");
    let portfile = dir.path().join("kilnd.port");
    let live = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
    let port = live.local_addr().expect("addr").port();
    PortFile::new(&portfile)
        .lock()
        .expect("lock")
        .set_values(&PortFileValues::new(port, 42))
        .expect("write record");

    let mut command = cargo_bin_cmd!("kilnd");
    command.arg("--portfile").arg(&portfile);
    command
        .assert()
        .failure()
        .stderr(contains("already running"));

    let values = PortFile::new(&portfile)
        .lock()
        .expect("lock")
        .values()
        .expect("read");
    assert_eq!(values.map(|values| values.cookie), Some(42));
}

#[test]
fn idle_server_exits_cleanly() {
    let dir = TempDir::new().expect("temp dir");
    let portfile = dir.path().join("kilnd.port");

    let mut command = cargo_bin_cmd!("kilnd");
    command
        .arg("--portfile")
        .arg(&portfile)
        .args(["--keepalive", "1", "--compiler", "true"]);
    command.timeout(std::time::Duration::from_secs(30));
    command.assert().success();
    assert!(!portfile.exists());
}
