/*!
Stream transport to the readout board.

The board's USB FIFO is bridged to a TCP socket that carries the raw register
protocol unchanged, so the transport is plain blocking byte I/O.
*/

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result};
use astropix::{TransportChannel, TransportError};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::info;

/// Receive buffer requested from the kernel; a full FIFO drain fits several times
const RECV_BUFFER_SIZE: usize = 1024 * 1024;

/// Blocking byte stream speaking the board protocol
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
}

pub type TcpTransport = StreamTransport<TcpStream>;

impl<S: Read + Write> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

impl TcpTransport {
    /// Connect to the bridge with nodelay and an enlarged receive buffer
    pub fn connect(address: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = (address, port)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}:{}", address, port))?
            .next()
            .with_context(|| format!("No address for {}:{}", address, port))?;

        info!("🔌 Connecting to readout board at {}", addr);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
        socket
            .connect_timeout(&SockAddr::from(addr), timeout)
            .with_context(|| format!("Failed to connect to {}", addr))?;

        let stream = TcpStream::from(socket);
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        info!("✅ Connected");

        Ok(Self::new(stream))
    }
}

impl<S: Read + Write> TransportChannel for StreamTransport<S> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let mut buffer = vec![0u8; n];
        let mut got = 0;
        while got < n {
            match self.stream.read(&mut buffer[got..]) {
                Ok(0) if got == 0 => return Err(TransportError::Closed),
                Ok(0) => return Err(TransportError::ShortRead { expected: n, got }),
                Ok(k) => got += k,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(TransportError::Timeout(format!("{} bytes ({} received)", n, got)));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buffer)
    }
}
