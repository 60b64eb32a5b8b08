//! Loopback connections to a compile server.

use std::io::{self, BufReader};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use kiln_protocol::{CompilationResult, CompileRequest, read_response, write_request};

use crate::errors::ClientError;

/// Connects to the server listening on `port` of the loopback interface.
pub(crate) fn connect(port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&address, timeout)
}

/// Sends `request` to `port` and reads the complete response.
pub(crate) fn exchange(
    port: u16,
    timeout: Duration,
    request: &CompileRequest,
) -> Result<CompilationResult, ClientError> {
    let stream = connect(port, timeout).map_err(|source| ClientError::Connect { port, source })?;
    let mut writer = &stream;
    write_request(&mut writer, request)?;
    let mut reader = BufReader::new(&stream);
    Ok(read_response(&mut reader)?)
}
