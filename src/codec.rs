//! SCPI command codec for the Keithley 2290-5 supply and 6485 picoammeter.
//!
//! Pure translation between domain intents and SCPI wire text. Every operation
//! either instrument supports is a variant of a closed enum ([`QueryField`],
//! [`Action`]) or a dedicated `encode_*` method, so no command string is ever
//! assembled outside this module.
//!
//! Numbers are written and parsed with Rust's locale-independent float
//! formatting. Decoding never substitutes a default: anything that is not a
//! finite number yields [`DecodeError::Malformed`].

use crate::error::{DecodeError, InvalidArgument};
use crate::events::InstrumentKind;
use std::time::Duration;

/// Maximum output voltage of the 2290-5 (volts).
pub const MAX_OUTPUT_VOLTAGE: f64 = 5000.0;
/// Maximum current limit of the 2290-5 (amperes).
pub const MAX_CURRENT_LIMIT: f64 = 5.25e-3;
/// Manual current ranges offered by the 6485 (amperes).
pub const PICOAMMETER_RANGES: [f64; 8] = [2e-9, 2e-8, 2e-7, 2e-6, 2e-5, 2e-4, 2e-3, 2e-2];
/// Largest expected reading the 6485 accepts for range selection (amperes).
pub const MAX_CURRENT_RANGE: f64 = 2.1e-2;
/// Accepted integration time, in power line cycles.
pub const NPLC_RANGE: (f64, f64) = (0.01, 60.0);
/// Default per-command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Kind of outbound operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Changes an instrument setting.
    Set,
    /// Reads a value back.
    Query,
    /// Triggers an instrument action.
    Action,
}

/// Readable instrument fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryField {
    /// `VOUT?` on the power supply.
    OutputVoltage,
    /// `READ?` on the picoammeter.
    Current,
    /// `*IDN?` on either instrument.
    Identity,
    /// `SYST:ERR?` on either instrument.
    ErrorQueue,
    /// `*OPC?` on either instrument; answers `1` once pending operations finish.
    OperationComplete,
}

impl QueryField {
    fn scpi(self) -> &'static str {
        match self {
            Self::OutputVoltage => "VOUT?",
            Self::Current => "READ?",
            Self::Identity => "*IDN?",
            Self::ErrorQueue => "SYST:ERR?",
            Self::OperationComplete => "*OPC?",
        }
    }

    fn target(self) -> Option<InstrumentKind> {
        match self {
            Self::OutputVoltage => Some(InstrumentKind::PowerSupply),
            Self::Current => Some(InstrumentKind::Picoammeter),
            Self::Identity | Self::ErrorQueue | Self::OperationComplete => None,
        }
    }

    fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::OutputVoltage | Self::Current | Self::OperationComplete
        )
    }
}

/// Instrument actions and settings without a dedicated encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// `HVON`
    EnableHighVoltage,
    /// `HVOF`
    DisableHighVoltage,
    /// `*RST`
    Reset,
    /// `*CLS`
    ClearStatus,
    /// `SYST:LOC`
    ReturnToLocal,
    /// `SYST:ZCH ON|OFF`
    SetZeroCheck(bool),
    /// `SYST:ZCOR:ACQ`
    AcquireZeroCorrection,
    /// `CURR:RANG:AUTO ON|OFF`
    SetAutoRange(bool),
    /// `CURR:RANG <amps>`
    SetRange(f64),
    /// `CURR:NPLC <nplc>`
    SetIntegrationTime(f64),
    /// `SYST:AZER ON|OFF`
    SetAutoZero(bool),
    /// `INIT`
    Initiate,
    /// `FORM:ELEM READ`
    FormatReadingsOnly,
    /// `ABOR`
    Abort,
}

/// Decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Reply of a numeric query.
    Number(f64),
    /// Reply of a text query, trimmed.
    Text(String),
}

impl Value {
    /// The numeric payload, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// The text payload, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Number(_) => None,
        }
    }
}

/// A single outbound operation, consumed once by an instrument session.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    verb: Verb,
    scpi: String,
    reply: Option<QueryField>,
    timeout: Duration,
    target: Option<InstrumentKind>,
    hv_enabling: bool,
}

impl Command {
    /// Operation kind.
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// Wire text without terminator.
    pub fn scpi_text(&self) -> &str {
        &self.scpi
    }

    /// Whether a reply line must be read after the write.
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Field the reply decodes as, for queries.
    pub fn reply_field(&self) -> Option<QueryField> {
        self.reply
    }

    /// Upper bound on write plus reply.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Instrument this command is only valid for; `None` for common commands.
    pub fn target(&self) -> Option<InstrumentKind> {
        self.target
    }

    /// True for `HVON`, which the interlock gates.
    pub fn is_hv_enabling(&self) -> bool {
        self.hv_enabling
    }

    /// True for `HVOF`.
    pub fn is_hv_disabling(&self) -> bool {
        self.scpi == "HVOF"
    }

    /// Same command with a different timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bytes written to the transport, newline terminated.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.scpi.len() + 1);
        bytes.extend_from_slice(self.scpi.as_bytes());
        bytes.push(b'\n');
        bytes
    }
}

/// Encoder/decoder stamping every command with one default timeout.
#[derive(Debug, Clone, Copy)]
pub struct CommandCodec {
    timeout: Duration,
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl CommandCodec {
    /// Codec whose commands carry `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Default timeout stamped on commands.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, verb: Verb, scpi: String, target: Option<InstrumentKind>) -> Command {
        Command {
            verb,
            scpi,
            reply: None,
            timeout: self.timeout,
            target,
            hv_enabling: false,
        }
    }

    /// `VSET <v>`; `v` must be finite and within 0..=5000 V.
    pub fn encode_set_voltage(&self, v: f64) -> Result<Command, InvalidArgument> {
        check_range("voltage", v, 0.0, MAX_OUTPUT_VOLTAGE)?;
        Ok(self.command(
            Verb::Set,
            format!("VSET {}", v),
            Some(InstrumentKind::PowerSupply),
        ))
    }

    /// `VLIM <v>`; `v` must be positive and at most 5000 V.
    pub fn encode_set_voltage_limit(&self, v: f64) -> Result<Command, InvalidArgument> {
        check_positive("voltage limit", v, MAX_OUTPUT_VOLTAGE)?;
        Ok(self.command(
            Verb::Set,
            format!("VLIM {}", v),
            Some(InstrumentKind::PowerSupply),
        ))
    }

    /// `ILIM <a>`; `a` must be positive and at most 5.25 mA.
    pub fn encode_set_current_limit(&self, a: f64) -> Result<Command, InvalidArgument> {
        check_positive("current limit", a, MAX_CURRENT_LIMIT)?;
        Ok(self.command(
            Verb::Set,
            format!("ILIM {:E}", a),
            Some(InstrumentKind::PowerSupply),
        ))
    }

    /// Query for one readable field.
    pub fn encode_query(&self, field: QueryField) -> Command {
        Command {
            reply: Some(field),
            ..self.command(Verb::Query, field.scpi().to_string(), field.target())
        }
    }

    /// Encode an action; numeric actions are range-checked.
    pub fn encode_action(&self, action: Action) -> Result<Command, InvalidArgument> {
        use InstrumentKind::{Picoammeter, PowerSupply};

        let (scpi, target) = match action {
            Action::EnableHighVoltage => {
                return Ok(Command {
                    hv_enabling: true,
                    ..self.command(Verb::Action, "HVON".to_string(), Some(PowerSupply))
                });
            }
            Action::DisableHighVoltage => ("HVOF".to_string(), Some(PowerSupply)),
            Action::Reset => ("*RST".to_string(), None),
            Action::ClearStatus => ("*CLS".to_string(), None),
            Action::ReturnToLocal => ("SYST:LOC".to_string(), None),
            Action::SetZeroCheck(on) => (format!("SYST:ZCH {}", on_off(on)), Some(Picoammeter)),
            Action::AcquireZeroCorrection => ("SYST:ZCOR:ACQ".to_string(), Some(Picoammeter)),
            Action::SetAutoRange(on) => {
                (format!("CURR:RANG:AUTO {}", on_off(on)), Some(Picoammeter))
            }
            Action::SetRange(amps) => {
                check_positive("current range", amps, MAX_CURRENT_RANGE)?;
                (format!("CURR:RANG {:E}", amps), Some(Picoammeter))
            }
            Action::SetIntegrationTime(nplc) => {
                check_range("integration time (NPLC)", nplc, NPLC_RANGE.0, NPLC_RANGE.1)?;
                (format!("CURR:NPLC {}", nplc), Some(Picoammeter))
            }
            Action::SetAutoZero(on) => (format!("SYST:AZER {}", on_off(on)), Some(Picoammeter)),
            Action::Initiate => ("INIT".to_string(), Some(Picoammeter)),
            Action::FormatReadingsOnly => ("FORM:ELEM READ".to_string(), Some(Picoammeter)),
            Action::Abort => ("ABOR".to_string(), Some(Picoammeter)),
        };
        let verb = match action {
            Action::SetZeroCheck(_)
            | Action::SetAutoRange(_)
            | Action::SetRange(_)
            | Action::SetIntegrationTime(_)
            | Action::SetAutoZero(_)
            | Action::FormatReadingsOnly => Verb::Set,
            _ => Verb::Action,
        };
        Ok(self.command(verb, scpi, target))
    }

    /// Decode one reply line for `field`.
    pub fn decode_reply(field: QueryField, raw_line: &str) -> Result<Value, DecodeError> {
        let trimmed = raw_line.trim();
        if field.is_numeric() {
            parse_number(trimmed)
                .map(Value::Number)
                .ok_or_else(|| DecodeError::Malformed(raw_line.to_string()))
        } else if trimmed.is_empty() {
            Err(DecodeError::Malformed(raw_line.to_string()))
        } else {
            Ok(Value::Text(trimmed.to_string()))
        }
    }

    /// Render a reply line the way the instruments report numbers (`2.5E-9`).
    pub fn encode_numeric_reply(x: f64) -> String {
        format!("{:E}", x)
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

fn parse_number(text: &str) -> Option<f64> {
    // Rust also accepts "inf"/"NaN"; neither instrument ever sends those.
    let starts_ok = text
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.'));
    if !starts_ok {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn check_range(name: &'static str, v: f64, min: f64, max: f64) -> Result<(), InvalidArgument> {
    if !v.is_finite() {
        return Err(InvalidArgument::new(name, v, "must be a finite number"));
    }
    if v < min || v > max {
        return Err(InvalidArgument::new(
            name,
            v,
            format!("must be within {}..={}", min, max),
        ));
    }
    Ok(())
}

fn check_positive(name: &'static str, v: f64, max: f64) -> Result<(), InvalidArgument> {
    if !v.is_finite() {
        return Err(InvalidArgument::new(name, v, "must be a finite number"));
    }
    if v <= 0.0 {
        return Err(InvalidArgument::new(name, v, "must be positive"));
    }
    if v > max {
        return Err(InvalidArgument::new(name, v, format!("must not exceed {}", max)));
    }
    Ok(())
}
