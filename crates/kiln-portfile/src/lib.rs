//! Discovery record shared by a Kiln server and its clients.
//!
//! A server advertises itself by writing its loopback port, a random cookie
//! and its pid into a port file. Clients read the record to find the server
//! and prove they are talking to the right one. Every read and write happens
//! while holding [`PortFileLock`], which combines an in-process mutex with an
//! advisory OS lock on the sibling `<portfile>.lock`, so the record is safe
//! to share between threads and processes alike.
//!
//! Writing an empty `<portfile>.stop` sentinel asks the owning server to shut
//! down at its next lifecycle check.

mod error;
mod files;
mod port_file;
mod registry;
mod values;

pub use error::PortFileError;
pub use port_file::{PortFile, PortFileLock};
pub use registry::PortFileRegistry;
pub use values::PortFileValues;

/// Tracing target used by port file events.
pub(crate) const PORTFILE_TARGET: &str = env!("CARGO_PKG_NAME");
