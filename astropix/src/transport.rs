/*!
Byte-level link to the readout board.

Components hold a transport and call it; nothing inherits from it. All calls
block and every failure is surfaced unchanged to the caller.
*/

use thiserror::Error;

use crate::protocol::{READ_ADDRESS, WRITE_ADDRESS};

/// Errors raised by a transport implementation
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("Link closed")]
    Closed,

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

/// Blocking byte write/read and register access on the physical link
pub trait TransportChannel {
    /// Write raw bytes
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `n` bytes
    fn read(&mut self, n: usize) -> Result<Vec<u8>, TransportError>;

    /// Write a single byte to a board register
    fn write_register(&mut self, addr: u8, value: u8) -> Result<(), TransportError> {
        self.write(&[WRITE_ADDRESS, addr, 0x00, 0x01, value])
    }

    /// Read `n` bytes from a board register
    fn read_register(&mut self, addr: u8, n: u16) -> Result<Vec<u8>, TransportError> {
        let [hi, lo] = n.to_be_bytes();
        self.write(&[READ_ADDRESS, addr, hi, lo])?;
        let answer = self.read(usize::from(n))?;
        tracing::trace!("Read register {} value 0x{}", addr, hex::encode(&answer));
        Ok(answer)
    }
}

impl<T: TransportChannel + ?Sized> TransportChannel for &mut T {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).write(bytes)
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(n)
    }

    fn write_register(&mut self, addr: u8, value: u8) -> Result<(), TransportError> {
        (**self).write_register(addr, value)
    }

    fn read_register(&mut self, addr: u8, n: u16) -> Result<Vec<u8>, TransportError> {
        (**self).read_register(addr, n)
    }
}
