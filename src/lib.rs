//! Host-side client for the Spectranext RAMFS file-access protocol.
//!
//! `spx` speaks the GDB Remote Serial Protocol (RSP) — `$payload#cc` framed
//! packets — carrying the standard `vFile:` file-I/O packet family plus a
//! vendor `vSpectranext:` extension for directory iteration, rename, reboot
//! and autoboot, over either a serial port or a TCP socket.
//!
//! # Example
//! ```no_run
//! # fn example() -> spx::SpxResult<()> {
//! use spx::Connection;
//!
//! let mut conn = Connection::open(None, true, false)?;
//! for entry in conn.ls("/")? {
//!     println!("{} {} {}", entry.kind, entry.name, entry.size);
//! }
//! # Ok(())
//! # }
//! ```
use std::net::AddrParseError;
use std::str::Utf8Error;

use thiserror::Error;

pub mod client;
pub mod codec;
pub mod discovery;
pub(crate) mod ops;
pub(crate) mod session;
pub mod transport;

pub use client::{Connection, DirEntry, EntryKind};
pub use transport::Endpoint;

/// Closed error taxonomy for the `spx` client.
#[derive(Error, Debug)]
pub enum Error {
    /// The device did not advertise `vSpectranext+` in `qSupported`.
    #[error("device does not support the vSpectranext extension")]
    NotSupported,
    /// Transport failure, malformed frame, checksum exhaustion, or an
    /// unmapped errno.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("already exists")]
    Exists,
    #[error("{0}")]
    Invalid(String),
    /// Framing-level failure that isn't a plain I/O error (bad escape
    /// sequence, unterminated frame, non-hex payload).
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The transport's exclusive advisory lock is held by another process.
    #[error("device is locked by another process: {0}")]
    Locked(String),
    #[error(transparent)]
    AddrParse(#[from] AddrParseError),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
}

pub type SpxResult<T> = std::result::Result<T, Error>;

pub(crate) fn io_err(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::other(msg.into())
}
