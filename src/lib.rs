//! # Debugging toolset for Z8 Encore! devices
//!
//! This crate talks to the eZ8 on-chip debugger (OCD) over a byte-oriented
//! link: a serial line, a parallel port adapter or a TCP relay. It provides
//! program/register/data memory access, software breakpoints, flash
//! programming with verification, and execution control, while caching
//! device state to avoid redundant round trips over the (slow, half-duplex)
//! wire.
//!
//! # Examples
//!
//! ## Halting the attached device
//! ```no_run
//! # use ez8_ocd::Error;
//! use ez8_ocd::{Permissions, Session, SessionConfig};
//! use ez8_ocd::transport::TcpTransport;
//!
//! // Connect to an OCD relay server.
//! let transport = TcpTransport::connect("localhost:4040")?;
//!
//! // Attach to the device behind it.
//! let mut session = Session::attach(
//!     Box::new(transport),
//!     SessionConfig::default(),
//!     Permissions::default(),
//! )?;
//!
//! // Stop the CPU and inspect it.
//! session.stop()?;
//! let pc = session.program_counter()?;
//! println!("stopped at {pc:#06x}");
//! # Ok::<(), Error>(())
//! ```
//!
//! ## Reading program memory
//! ```no_run
//! # use ez8_ocd::Error;
//! # use ez8_ocd::{Permissions, Session, SessionConfig};
//! # use ez8_ocd::transport::TcpTransport;
//! # let transport = TcpTransport::connect("localhost:4040")?;
//! # let mut session = Session::attach(
//! #     Box::new(transport),
//! #     SessionConfig::default(),
//! #     Permissions::default(),
//! # )?;
//! session.stop()?;
//!
//! // Reads are served from the shadow cache whenever the device CRC
//! // proves it is still current.
//! let mut buf = [0u8; 64];
//! session.read_code(0x0000, &mut buf)?;
//! # Ok::<(), Error>(())
//! ```
//!
//! The crate is built around three layers: a [`transport::Transport`]
//! implementation carries raw bytes, the [`protocol::Link`] frames OCD
//! commands over it, and a [`Session`] maintains the cached device state
//! and the higher level operations on top.

pub mod crc;
mod error;
pub mod policy;
pub mod protocol;
mod session;
pub mod transport;

pub use crate::error::Error;
pub use crate::policy::RevisionPolicy;
pub use crate::session::{
    Breakpoint, CoreStatus, Permissions, Session, SessionConfig, VerifyPolicy,
};
pub use crate::transport::{Transport, TransportError};
