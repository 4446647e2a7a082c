//! Byte transports to the on-chip debugger.
//!
//! The debug wire is half-duplex and byte-exact: every command is a short
//! write followed by an exactly-sized read, with no framing overhead. A
//! [`Transport`] hides whether those bytes travel over a serial line, a
//! parallel port adapter or a TCP relay; the protocol layer treats any
//! implementation polymorphically through this trait.

pub mod fake;
mod tcp;

pub use fake::{FakeDevice, FakeOcd};
pub use tcp::TcpTransport;

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a concrete transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A read completed with fewer bytes than requested.
    #[error("Read from debug link timed out")]
    Timeout,
    /// The transport is not connected.
    #[error("Debug link is not open")]
    NotOpen,
    /// Loopback verification failed: what came back on the half-duplex
    /// wire was not what we transmitted, so two parties were driving the
    /// line at once.
    #[error("Transmission collision detected on debug link")]
    Collision,
    /// An OS level I/O failure.
    #[error("I/O error on debug link")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// A byte-exact duplex channel to the on-chip debugger.
///
/// Contract: [`read`](Transport::read) either fills the whole buffer or
/// fails (a short read is a [`TransportError::Timeout`]);
/// [`write`](Transport::write) either transmits every byte or fails. There
/// is no cancellation: a blocking read completes, times out or errors.
pub trait Transport: fmt::Debug + Send {
    /// Human readable name of this transport, for diagnostics.
    fn name(&self) -> &str;

    /// Re-establishes the debug link: sends the autobaud/handshake
    /// sequence and clears any pending error condition.
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Reads exactly `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Writes all of `buf`.
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Whether at least one byte can be read without blocking.
    fn available(&mut self) -> Result<bool, TransportError>;

    /// Whether the transport has observed an error condition (e.g. a
    /// serial break) since the last [`reset`](Transport::reset). The
    /// protocol layer resets the link before issuing further commands
    /// when this reports `true`.
    fn error_pending(&mut self) -> bool;

    /// Whether the transport is connected at all.
    fn link_open(&self) -> bool;

    /// Whether the device behind the transport is responding.
    fn link_up(&self) -> bool;

    /// Changes the link baud rate.
    fn set_baudrate(&mut self, baud: u32) -> Result<(), TransportError>;

    /// Sets the read timeout. Implementations must honor this for
    /// [`read`](Transport::read).
    fn set_timeout(&mut self, timeout: Duration);

    /// Current link speed in baud, or `0` if the transport has no
    /// meaningful notion of one.
    fn link_speed(&self) -> u32;

    /// The largest number of bytes that may be transferred in one unit,
    /// if the transport imposes a limit. Commands and responses larger
    /// than this are fragmented by the protocol layer.
    fn max_transmission_unit(&self) -> Option<usize> {
        None
    }
}
