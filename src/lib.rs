//! Core library for the hv_daq application.
//!
//! Controls a high-voltage power supply and a picoammeter over GPIB/SCPI:
//! command encoding, one serialized session per instrument, a safety
//! interlock gating HV output, a fixed-rate acquisition scheduler and a
//! bounded sample bus that fans readings out to consumers.

pub mod acquisition;
pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod safety;
pub mod session;
pub mod station;
pub mod transport;

pub use acquisition::{AcquisitionScheduler, AcquisitionState, AcquisitionStats};
pub use bus::{ConsumerHandle, SampleBus};
pub use codec::{Action, Command, CommandCodec, QueryField, Value};
pub use config::Settings;
pub use error::{AppResult, DaqError};
pub use events::{BusMessage, ConnectionState, Event, EventKind, InstrumentKind, Sample, SafetyState};
pub use safety::{FaultPolicy, SafetyInterlock};
pub use session::{InstrumentSession, SessionConfig};
pub use station::Station;
