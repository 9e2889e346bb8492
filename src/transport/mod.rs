//! Byte-level instrument links.
//!
//! The core never talks to GPIB directly; it consumes a [`Transport`] handed to
//! [`InstrumentSession::connect`](crate::session::InstrumentSession::connect).
//! Two implementations ship with the crate:
//!
//! - [`MockTransport`] - simulated 2290-5 / 6485 with failure injection and a
//!   write log, used by tests and the `simulate` command
//! - `VisaTransport` - GPIB via `visa-rs` (feature `instrument_visa`)

pub mod mock;
#[cfg(feature = "instrument_visa")]
pub mod visa;

pub use mock::MockTransport;
#[cfg(feature = "instrument_visa")]
pub use visa::VisaTransport;

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

/// Session-oriented link to one instrument.
///
/// Implementations need not be thread-safe beyond `Send`: the owning
/// [`InstrumentSession`](crate::session::InstrumentSession) moves the transport
/// into its command task and is the only caller.
#[async_trait]
pub trait Transport: Send {
    /// Write raw bytes (already newline terminated).
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read one reply line, terminator excluded.
    async fn read_line(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Link-level I/O timeout.
    fn timeout(&self) -> Duration;

    /// Change the link-level I/O timeout.
    fn set_timeout(&mut self, timeout: Duration);

    /// Release the link. Further I/O fails with [`TransportError::Closed`].
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human-readable resource name, e.g. `GPIB0::14::INSTR`.
    fn resource_name(&self) -> String;
}

/// VISA resource string for a GPIB primary address.
pub fn gpib_resource(board: u8, address: u8) -> String {
    format!("GPIB{}::{}::INSTR", board, address)
}
