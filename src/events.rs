//! Shared value types: instrument identity, state enums, samples and events.
//!
//! Samples and events are plain values. Each consumer of the
//! [`SampleBus`](crate::bus::SampleBus) receives its own clone; nothing here
//! is shared mutably.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

/// Which of the two instruments a session, command or event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    /// Keithley 2290-5 high-voltage power supply.
    PowerSupply,
    /// Keithley 6485 picoammeter.
    Picoammeter,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerSupply => f.write_str("power supply"),
            Self::Picoammeter => f.write_str("picoammeter"),
        }
    }
}

/// Connection lifecycle of one instrument session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link; commands are refused.
    Disconnected,
    /// Link opened, identity check in progress.
    Connecting,
    /// Identified and accepting commands.
    Connected,
    /// The link failed and must be reconnected.
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// State of the process-wide safety interlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyState {
    /// No HV path armed.
    Idle,
    /// Limits validated, HV not yet enabled.
    Armed,
    /// HV output on.
    Enabled,
    /// Transport or limit violation.
    Fault,
    /// Terminal until an explicit reset.
    EmergencyStopped,
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Enabled => "enabled",
            Self::Fault => "fault",
            Self::EmergencyStopped => "emergency-stopped",
        };
        f.write_str(s)
    }
}

/// Monotonic plus wall-clock capture of one instant.
///
/// The monotonic part orders and spaces samples; the wall-clock part is what
/// gets exported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timestamp {
    /// Monotonic instant, immune to wall-clock adjustments.
    pub monotonic: Instant,
    /// Wall-clock time in UTC.
    pub wall: DateTime<Utc>,
}

impl Timestamp {
    /// Capture the current instant.
    pub fn now() -> Self {
        Self {
            monotonic: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// One acquisition tick's readings.
///
/// A field is `None` when its query failed during that tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// When the tick started.
    pub timestamp: Timestamp,
    /// Power supply output voltage in volts.
    pub voltage: Option<f64>,
    /// Picoammeter reading in amperes.
    pub current: Option<f64>,
}

/// Category of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A session identified its instrument.
    Connected,
    /// A session released its instrument.
    Disconnected,
    /// A link or the interlock faulted.
    Fault,
    /// Emergency stop requested.
    EmergencyStop,
    /// Interlock returned to idle.
    Reset,
    /// A bus consumer fell behind and lost its oldest items.
    Overflow,
    /// A reply could not be decoded.
    Decode,
    /// An operation failed without faulting anything.
    Error,
    /// High-voltage output switched on or off, or an HV timer fired.
    Output,
    /// Acquisition started or stopped.
    Acquisition,
}

/// Human-readable notification routed through the sample bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Instrument concerned, if any.
    pub instrument: Option<InstrumentKind>,
    /// Free-form description.
    pub message: String,
    /// Wall-clock time of the event.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn new(
        kind: EventKind,
        instrument: Option<InstrumentKind>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            instrument,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Represent any error as an event, so the GUI layer only has to subscribe.
    pub fn from_error(
        kind: EventKind,
        instrument: Option<InstrumentKind>,
        err: &dyn std::error::Error,
    ) -> Self {
        Self::new(kind, instrument, err.to_string())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instrument {
            Some(instrument) => write!(
                f,
                "[{}] {:?} ({}): {}",
                self.timestamp.format("%H:%M:%S%.3f"),
                self.kind,
                instrument,
                self.message
            ),
            None => write!(
                f,
                "[{}] {:?}: {}",
                self.timestamp.format("%H:%M:%S%.3f"),
                self.kind,
                self.message
            ),
        }
    }
}

/// Item delivered to bus consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// One acquisition tick.
    Sample(Sample),
    /// A notification.
    Event(Event),
}

impl From<Sample> for BusMessage {
    fn from(sample: Sample) -> Self {
        Self::Sample(sample)
    }
}

impl From<Event> for BusMessage {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}
