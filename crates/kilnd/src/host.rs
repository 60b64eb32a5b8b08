//! Capacity of the machine the server runs on.

use std::thread;

use kiln_protocol::SysInfo;
use sysinfo::System;

/// Reads the core count and total memory of this host.
///
/// Values that cannot be determined are reported as `-1`.
#[must_use]
pub fn host_sys_info() -> SysInfo {
    let num_cores = thread::available_parallelism()
        .ok()
        .and_then(|cores| i64::try_from(cores.get()).ok())
        .unwrap_or(-1);

    let mut system = System::new();
    system.refresh_memory();
    let max_memory = match system.total_memory() {
        0 => -1,
        bytes => i64::try_from(bytes).unwrap_or(i64::MAX),
    };

    SysInfo {
        num_cores,
        max_memory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_at_least_one_core() {
        let info = host_sys_info();
        assert!(info.num_cores >= 1);
        assert!(info.max_memory != 0);
    }
}
