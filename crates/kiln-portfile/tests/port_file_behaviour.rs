//! Port file behaviour across handles and threads.

use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use kiln_portfile::{PortFile, PortFileError, PortFileRegistry, PortFileValues};
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Scratch {
    _dir: TempDir,
    path: PathBuf,
}

#[fixture]
fn scratch() -> Scratch {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("run").join("kilnd.port");
    Scratch { _dir: dir, path }
}

#[rstest]
fn empty_port_file_holds_no_info(scratch: Scratch) {
    let port_file = PortFile::new(&scratch.path);
    assert!(!port_file.exists());
    assert!(!port_file.contains_port_info().expect("query"));
    assert_eq!(port_file.lock().expect("lock").values().expect("read"), None);
}

#[rstest]
fn written_values_are_read_back(scratch: Scratch) {
    let port_file = PortFile::new(&scratch.path);
    let values = PortFileValues::new(4242, 0xdead_beef);
    port_file
        .lock()
        .expect("lock")
        .set_values(&values)
        .expect("write");

    let reader = PortFile::new(&scratch.path);
    assert!(reader.exists());
    assert!(reader.contains_port_info().expect("query"));
    assert!(reader.still_my_values(4242, 0xdead_beef).expect("query"));
    assert!(!reader.still_my_values(4242, 1).expect("query"));
    assert_eq!(
        reader.lock().expect("lock").values().expect("read"),
        Some(values)
    );
}

#[rstest]
fn concurrent_readers_see_identical_values(scratch: Scratch) {
    let registry = Arc::new(PortFileRegistry::new());
    let values = PortFileValues::new(5151, 77);
    registry
        .port_file(&scratch.path)
        .expect("resolve")
        .lock()
        .expect("lock")
        .set_values(&values)
        .expect("write");

    let readers = 8;
    let barrier = Arc::new(Barrier::new(readers));
    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            let path = scratch.path.clone();
            thread::spawn(move || {
                let port_file = registry.port_file(&path).expect("resolve");
                barrier.wait();
                let lock = port_file.lock().expect("lock");
                lock.values().expect("read")
            })
        })
        .collect();

    for handle in handles {
        let seen = handle.join().expect("reader thread");
        assert_eq!(seen, Some(values));
    }
    assert_eq!(registry.len(), 1);
}

#[rstest]
fn delete_removes_record_and_stop_sentinel(scratch: Scratch) {
    let port_file = PortFile::new(&scratch.path);
    port_file
        .lock()
        .expect("lock")
        .set_values(&PortFileValues::new(1, 1))
        .expect("write");
    port_file.mark_for_stop().expect("mark");
    assert!(port_file.marked_for_stop());

    port_file.delete().expect("delete");

    assert!(!port_file.exists());
    assert!(!port_file.marked_for_stop());
    port_file.delete().expect("deleting twice is harmless");
}

#[rstest]
fn marking_for_stop_waits_for_the_lock(scratch: Scratch) {
    let port_file = Arc::new(PortFile::new(&scratch.path));
    let held = port_file.lock().expect("lock");

    let marker = {
        let port_file = Arc::clone(&port_file);
        thread::spawn(move || port_file.mark_for_stop())
    };
    thread::sleep(Duration::from_millis(150));
    assert!(!port_file.marked_for_stop(), "sentinel written while the lock was held");

    held.unlock();
    marker.join().expect("marker thread").expect("mark");
    assert!(port_file.marked_for_stop());
}

#[rstest]
fn waiting_times_out_without_a_server(scratch: Scratch) {
    let port_file = PortFile::new(&scratch.path);
    let started = Instant::now();
    let error = port_file
        .wait_for_valid_values(Duration::from_millis(250))
        .expect_err("nothing writes the record");
    assert!(matches!(error, PortFileError::Timeout { .. }), "{error}");
    assert!(started.elapsed() >= Duration::from_millis(250));
}

#[rstest]
fn waiting_sees_values_written_later(scratch: Scratch) {
    let path = scratch.path.clone();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        PortFile::new(&path)
            .lock()
            .expect("lock")
            .set_values(&PortFileValues::new(6000, 12))
            .expect("write");
    });

    let values = PortFile::new(&scratch.path)
        .wait_for_valid_values(Duration::from_secs(5))
        .expect("values should appear");
    writer.join().expect("writer thread");
    assert_eq!((values.port, values.cookie), (6000, 12));
}

#[rstest]
fn malformed_record_is_reported(scratch: Scratch) {
    let port_file = PortFile::new(&scratch.path);
    drop(port_file.lock().expect("lock creates the directory"));
    std::fs::write(&scratch.path, b"not json").expect("write garbage");
    let error = port_file
        .contains_port_info()
        .expect_err("garbage should not decode");
    assert!(matches!(error, PortFileError::Decode { .. }), "{error}");
}
