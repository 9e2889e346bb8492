//! Error types for the instrument-control core.
//!
//! Each layer owns a focused error enum built with `thiserror`, and
//! [`DaqError`] consolidates them for callers that just want one type:
//!
//! - **`InvalidArgument`**: a numeric argument that is non-finite, non-positive
//!   or outside the instrument's documented range. Produced by the SCPI codec
//!   and by the safety interlock when limits are set.
//! - **`DecodeError`**: a reply line that could not be turned into a typed value.
//! - **`TransportError`**: byte-level link failures reported by a [`Transport`].
//! - **`ExecError`**: failures of a single command on an [`InstrumentSession`].
//!   Timeouts and transport failures also move the session to `Faulted`.
//! - **`ConnectError`**: failures of the connect handshake.
//! - **`SafetyError`**: transitions the interlock refuses.
//! - **`SchedulerError`**: acquisition start/stop misuse.
//!
//! By using `#[from]`, `DaqError` can be created from any of these with `?`.
//!
//! [`Transport`]: crate::transport::Transport
//! [`InstrumentSession`]: crate::session::InstrumentSession

use crate::config::ConfigError;
use crate::events::{ConnectionState, InstrumentKind, SafetyState};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// A numeric argument was malformed or out of range.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid {name} '{value}': {reason}")]
pub struct InvalidArgument {
    /// Name of the rejected argument (e.g. `"voltage"`).
    pub name: &'static str,
    /// The offending value, rendered as text.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

impl InvalidArgument {
    pub(crate) fn new(name: &'static str, value: impl ToString, reason: impl Into<String>) -> Self {
        Self {
            name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// A reply line could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The raw line was not a valid reply for the queried field.
    #[error("malformed reply: {0:?}")]
    Malformed(String),
}

/// Byte-level link failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The instrument did not answer within the transport timeout.
    #[error("transport timed out")]
    Timeout,

    /// The link has been closed or severed.
    #[error("transport closed")]
    Closed,

    /// Any other driver or OS failure.
    #[error("transport I/O error: {0}")]
    Io(String),
}

/// Failures of a single command executed on an instrument session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
    /// No reply within the command's timeout. Faults the session.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The link failed mid-command. Faults the session.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// The reply arrived but was not understood.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// The session was not `Connected` when the command was submitted.
    #[error("session is not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// `HVON` while the interlock is not enabling output.
    #[error("high-voltage command refused by the safety interlock")]
    Interlocked,

    /// Dropped from the queue by an emergency stop.
    #[error("command abandoned by emergency stop before dispatch")]
    Abandoned,

    /// The command targets the other instrument.
    #[error("command addressed to {got} sent to the {expected} session")]
    WrongInstrument {
        /// Instrument the session drives.
        expected: InstrumentKind,
        /// Instrument the command was encoded for.
        got: InstrumentKind,
    },
}

impl ExecError {
    /// Whether this failure moved (or would move) the session to `Faulted`.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::TransportClosed(_))
    }
}

impl From<TransportError> for ExecError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout(Duration::ZERO),
            other => Self::TransportClosed(other.to_string()),
        }
    }
}

/// Failures of the connect handshake.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    /// The identity query failed or returned nothing usable.
    #[error("instrument unresponsive: {0}")]
    Unresponsive(String),

    /// `connect` called on a connected session.
    #[error("session already connected")]
    AlreadyConnected,
}

/// Transitions refused by the safety interlock.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafetyError {
    /// `arm` before `set_limits`.
    #[error("limits must be set before arming")]
    LimitsNotSet,

    /// Enable requested without a preceding successful arm.
    #[error("interlock is not armed")]
    NotArmed,

    /// Enable requested while output is already on.
    #[error("high voltage already enabled")]
    AlreadyEnabled,

    /// Disable requested while output is off.
    #[error("high voltage is not enabled")]
    NotEnabled,

    /// Any other refused transition.
    #[error("{operation} not allowed while {state}")]
    InvalidTransition {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the interlock was in.
        state: SafetyState,
    },

    /// Limits out of range.
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),
}

/// Acquisition scheduler misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// `start` while a loop is running.
    #[error("acquisition already running")]
    AlreadyRunning,

    /// `start` before the picoammeter session is connected.
    #[error("picoammeter is not connected")]
    NotConnected,
}

/// Crate-level error aggregating every component error.
#[derive(Error, Debug)]
pub enum DaqError {
    /// See [`ConfigError`].
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// See [`InvalidArgument`].
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),

    /// See [`DecodeError`].
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// See [`ExecError`].
    #[error("Command failed: {0}")]
    Exec(#[from] ExecError),

    /// See [`ConnectError`].
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// See [`SafetyError`].
    #[error("Safety interlock: {0}")]
    Safety(#[from] SafetyError),

    /// See [`SchedulerError`].
    #[error("Acquisition: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Operation needs a cargo feature this build lacks.
    #[error("Feature '{0}' is not enabled in this build")]
    FeatureNotEnabled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::from(ExecError::Timeout(Duration::from_millis(250)));
        assert_eq!(err.to_string(), "Command failed: no reply within 250ms");
    }

    #[test]
    fn test_invalid_argument_display() {
        let err = InvalidArgument::new("voltage", -1.0, "must be positive");
        assert_eq!(err.to_string(), "invalid voltage '-1': must be positive");
    }

    #[test]
    fn test_link_fault_classification() {
        assert!(ExecError::Timeout(Duration::ZERO).is_link_fault());
        assert!(ExecError::TransportClosed("gone".into()).is_link_fault());
        assert!(!ExecError::Decode(DecodeError::Malformed("x".into())).is_link_fault());
        assert!(!ExecError::Interlocked.is_link_fault());
    }

    #[test]
    fn test_transport_error_maps_to_exec_error() {
        assert!(matches!(
            ExecError::from(TransportError::Closed),
            ExecError::TransportClosed(_)
        ));
        assert!(matches!(
            ExecError::from(TransportError::Timeout),
            ExecError::Timeout(_)
        ));
    }
}
