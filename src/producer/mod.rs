use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::wire::codec::{self, CodecError};
use crate::wire::message::VariableSnapshot;

#[derive(Debug)]
pub enum ProducerError {
    Encode(CodecError),
    Io(io::Error),
}

impl fmt::Display for ProducerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(source) => write!(f, "encode error: {source}"),
            Self::Io(source) => write!(f, "io error: {source}"),
        }
    }
}

impl std::error::Error for ProducerError {}

impl From<io::Error> for ProducerError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Pushes one snapshot the way a debugger hook does: connect, write a single
/// frame, close. Returns the number of bytes written.
pub fn send_snapshot(
    addr: SocketAddr,
    identity: &str,
    vars: &VariableSnapshot,
    timeout: Duration,
) -> Result<usize, ProducerError> {
    let frame = codec::encode(identity, vars).map_err(ProducerError::Encode)?;
    send_raw(addr, &frame, timeout)?;
    Ok(frame.len())
}

/// Writes arbitrary bytes as one connection's entire content.
pub fn send_raw(addr: SocketAddr, bytes: &[u8], timeout: Duration) -> Result<(), ProducerError> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(bytes)?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write)?;
    Ok(())
}
