//! `kilnd` binary: serves compile requests until idle or stopped.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stderr = io::stderr().lock();
    kilnd::run(std::env::args_os(), &mut stderr)
}
