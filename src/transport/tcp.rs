use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{Transport, TransportError};

/// Autobaud character recognized by the OCD after a link reset.
const AUTOBAUD: u8 = 0x80;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// A transport that relays debugger bytes through a TCP server sitting in
/// front of the physical link.
///
/// The relay is a transparent byte pipe; baud rate selection happens on
/// the far side, so [`set_baudrate`](Transport::set_baudrate) only records
/// the value for timeout computations.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: String,
    timeout: Duration,
    speed: u32,
    error_seen: bool,
}

impl TcpTransport {
    /// Connects to an OCD relay server, e.g. `"localhost:4040"`.
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self, TransportError> {
        let peer = addr.to_string();
        tracing::debug!("connecting to OCD relay at {peer}");
        let stream = TcpStream::connect(&addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
        Ok(TcpTransport {
            stream,
            peer,
            timeout: DEFAULT_TIMEOUT,
            speed: 0,
            error_seen: false,
        })
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.peer
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        // Drain anything the far side buffered before the handshake.
        while self.available()? {
            let mut scratch = [0u8; 64];
            self.stream.set_nonblocking(true)?;
            let _ = self.stream.read(&mut scratch);
            self.stream.set_nonblocking(false)?;
        }
        self.stream.write_all(&[AUTOBAUD])?;
        self.error_seen = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.stream.read_exact(buf).map_err(|e| {
            if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                TransportError::Timeout
            } else {
                self.error_seen = true;
                TransportError::Io(e)
            }
        })
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(buf)?;
        Ok(())
    }

    fn available(&mut self) -> Result<bool, TransportError> {
        let mut probe = [0u8; 1];
        self.stream.set_nonblocking(true)?;
        let result = match self.stream.peek(&mut probe) {
            Ok(n) => Ok(n > 0),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) => Err(TransportError::Io(e)),
        };
        self.stream.set_nonblocking(false)?;
        result
    }

    fn error_pending(&mut self) -> bool {
        self.error_seen
    }

    fn link_open(&self) -> bool {
        true
    }

    fn link_up(&self) -> bool {
        !self.error_seen
    }

    fn set_baudrate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.speed = baud;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        if let Err(e) = self.stream.set_read_timeout(Some(timeout)) {
            tracing::warn!("failed to set relay read timeout: {e}");
        }
    }

    fn link_speed(&self) -> u32 {
        self.speed
    }
}
