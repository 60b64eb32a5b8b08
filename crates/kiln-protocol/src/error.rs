//! Errors raised while reading or writing protocol messages.

use std::io;

use thiserror::Error;

/// Failures of the wire protocol. All of them are fatal for the exchange.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The underlying stream failed.
    #[error("protocol stream failed: {source}")]
    Io {
        /// Underlying IO error.
        #[from]
        source: io::Error,
    },
    /// The peer closed the stream before the exchange was complete.
    #[error("unexpected end of stream while expecting {expected}")]
    UnexpectedEof {
        /// Description of what the reader was waiting for.
        expected: &'static str,
    },
    /// A line did not match the section the reader was in.
    #[error("expected {expected} but found line {found:?}")]
    UnexpectedLine {
        /// Description of the expected line.
        expected: &'static str,
        /// The offending line as received.
        found: String,
    },
    /// The peer speaks a different protocol version.
    #[error("unsupported protocol header {found:?}")]
    UnsupportedVersion {
        /// Header line the peer sent.
        found: String,
    },
    /// The cookie line was not an unsigned integer.
    #[error("invalid cookie {value:?}")]
    InvalidCookie {
        /// Raw cookie text.
        value: String,
    },
    /// A source line was not a valid URI.
    #[error("invalid source URI {value:?}: {source}")]
    InvalidUri {
        /// Raw URI text.
        value: String,
        /// Parser failure.
        #[source]
        source: url::ParseError,
    },
    /// A package block line was neither a header nor an indented entry.
    #[error("malformed line {line:?} in {section}")]
    MalformedPackageBlock {
        /// Sentinel of the block being read.
        section: &'static str,
        /// The offending line.
        line: String,
    },
    /// A sysinfo entry carried a non-numeric value.
    #[error("invalid sysinfo entry {line:?}")]
    InvalidSysInfo {
        /// The offending line.
        line: String,
    },
    /// The return code was not an integer.
    #[error("invalid return code {value:?}")]
    InvalidReturnCode {
        /// Raw return code text.
        value: String,
    },
}
