//! Client half of the three-command memory-access protocol: INFO, READ,
//! WRITE over a blocking TCP stream. The responder (firmware side) is not
//! our concern here.
//!
//! Wire format, all integers little-endian:
//! - INFO: opcode `0`, no args -> `u64` table address.
//! - READ: opcode `1`, `addr: u64, size: u64` -> exactly `size` bytes.
//! - WRITE: opcode `2`, `addr: u64, size: u64, data: [u8; size]` -> no
//!   response.
//!
//! A `size == 0` read is a no-op that returns an empty buffer without
//! touching the wire's data payload. Every read/write is exact: a short
//! read or a write that doesn't accept the whole buffer is fatal.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::{error, fmt};

const OP_INFO: u8 = 0;
const OP_READ: u8 = 1;
const OP_WRITE: u8 = 2;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    ShortRead { expected: usize, got: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport I/O error: {e}"),
            Self::ShortRead { expected, got } => {
                write!(f, "short read: expected {expected} bytes, got {got}")
            }
        }
    }
}

impl error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A single, exclusively-owned connection to the target's memory-access
/// responder. No retries, no background tasks: every call blocks until
/// the whole request/response has gone over the wire.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        Ok(Self { stream })
    }

    /// Ask the target for the address of its embedded debug-data table.
    pub fn info(&mut self) -> Result<u64, Error> {
        self.stream.write_all(&[OP_INFO])?;
        let mut buf = [0u8; 8];
        self.stream.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read exactly `size` bytes from target memory at `addr`. `size == 0`
    /// returns an empty buffer without sending anything past the opcode.
    pub fn read(&mut self, addr: u64, size: u64) -> Result<Vec<u8>, Error> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut header = Vec::with_capacity(17);
        header.push(OP_READ);
        header.extend_from_slice(&addr.to_le_bytes());
        header.extend_from_slice(&size.to_le_bytes());
        self.stream.write_all(&header)?;

        let mut buf = vec![0u8; size as usize];
        self.stream.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::ShortRead {
                    expected: size as usize,
                    got: 0,
                }
            } else {
                Error::Io(e)
            }
        })?;
        Ok(buf)
    }

    /// Write `data` to target memory at `addr`. No response is expected.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        let mut header = Vec::with_capacity(17 + data.len());
        header.push(OP_WRITE);
        header.extend_from_slice(&addr.to_le_bytes());
        header.extend_from_slice(&(data.len() as u64).to_le_bytes());
        header.extend_from_slice(data);
        self.stream.write_all(&header)?;
        Ok(())
    }
}
