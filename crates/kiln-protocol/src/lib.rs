//! Line-oriented wire protocol spoken between Kiln clients and `kilnd`.
//!
//! A request and its response are sequences of text lines. Every section
//! opens with a sentinel line (see [`sentinel`]) and payload lines are escaped
//! (see [`escape`]) so that no payload can ever be mistaken for a sentinel.
//! The protocol has no length prefixes: a reader consumes lines until the
//! next expected sentinel, and reaching end-of-stream before
//! [`sentinel::END`] is a fatal [`ProtocolError::UnexpectedEof`].

mod codec;
mod error;
pub mod escape;
mod request;
mod result;
pub mod sentinel;

pub use codec::{read_request, read_response, write_request, write_response};
pub use error::ProtocolError;
pub use request::{CompileRequest, SourceSuffixes};
pub use result::{BASELIB, CompilationResult, ReturnCode, SysInfo};
