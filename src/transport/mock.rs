//! Simulated instrument link for testing
//!
//! This transport provides a simulated 2290-5 supply or 6485 picoammeter for
//! exercising sessions without physical hardware. It provides:
//! - Simulated reply latency
//! - Controllable failure injection (hung replies, dead links, silence)
//! - A write log shared by every clone, for test verification

use super::Transport;
use crate::codec::CommandCodec;
use crate::error::TransportError;
use crate::events::InstrumentKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Identity reported by the simulated power supply.
pub const MOCK_SUPPLY_IDN: &str = "KEITHLEY INSTRUMENTS,MODEL 2290-5,4471830,1.4.0";
/// Identity reported by the simulated picoammeter.
pub const MOCK_PICOAMMETER_IDN: &str = "KEITHLEY INSTRUMENTS INC.,MODEL 6485,1234567,B03";

struct MockState {
    identity: String,
    written: Vec<String>,
    pending: VecDeque<String>,
    scripted: HashMap<String, VecDeque<String>>,
    hung: HashSet<String>,
    latency: Duration,
    unresponsive: bool,
    closed: bool,
    timeout: Duration,
    voltage_setpoint: f64,
    hv_on: bool,
    current: f64,
}

/// Simulated instrument link.
///
/// Clones share state, so a test can keep one clone for assertions while the
/// session owns another.
///
/// # Example
///
/// ```
/// use hv_daq::transport::MockTransport;
///
/// let supply = MockTransport::power_supply();
/// let observer = supply.clone();
/// assert!(observer.written().is_empty());
/// ```
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    resource: String,
}

impl MockTransport {
    fn with_identity(identity: &str, resource: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                identity: identity.to_string(),
                written: Vec::new(),
                pending: VecDeque::new(),
                scripted: HashMap::new(),
                hung: HashSet::new(),
                latency: Duration::ZERO,
                unresponsive: false,
                closed: false,
                timeout: Duration::from_secs(5),
                voltage_setpoint: 0.0,
                hv_on: false,
                current: 2.5e-9,
            })),
            resource: resource.to_string(),
        }
    }

    /// Simulated 2290-5 at the default address.
    pub fn power_supply() -> Self {
        Self::with_identity(MOCK_SUPPLY_IDN, "MOCK::GPIB0::14::INSTR")
    }

    /// Simulated 6485 at the default address.
    pub fn picoammeter() -> Self {
        Self::with_identity(MOCK_PICOAMMETER_IDN, "MOCK::GPIB0::22::INSTR")
    }

    /// Simulated instrument of the given kind.
    pub fn for_instrument(kind: InstrumentKind) -> Self {
        match kind {
            InstrumentKind::PowerSupply => Self::power_supply(),
            InstrumentKind::Picoammeter => Self::picoammeter(),
        }
    }

    /// Override the `*IDN?` reply.
    pub fn set_identity(&self, identity: &str) {
        self.state.lock().identity = identity.to_string();
    }

    /// Delay every reply by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Queue `reply` as the next answer to `command`, ahead of the simulation.
    pub fn script_reply(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .scripted
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    /// Never answer `command`.
    pub fn hang_on(&self, command: &str) {
        self.state.lock().hung.insert(command.to_string());
    }

    /// Stop answering any query.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.state.lock().unresponsive = unresponsive;
    }

    /// Kill the link: every further write or read fails.
    pub fn sever(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
    }

    /// Picoammeter reading returned by `READ?`.
    pub fn set_current(&self, amps: f64) {
        self.state.lock().current = amps;
    }

    /// Commands written so far, terminators stripped.
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// Clear the write log.
    pub fn clear_log(&self) {
        self.state.lock().written.clear();
    }

    /// Whether the simulated HV output is on.
    pub fn hv_on(&self) -> bool {
        self.state.lock().hv_on
    }

    /// Whether the link has been closed or severed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn simulate(state: &mut MockState, command: &str) -> Option<String> {
        let (head, arg) = match command.split_once(' ') {
            Some((head, arg)) => (head, Some(arg.trim())),
            None => (command, None),
        };
        match head {
            "*IDN?" => Some(state.identity.clone()),
            "*OPC?" => Some("1".to_string()),
            "SYST:ERR?" => Some("0,\"No error\"".to_string()),
            "VOUT?" => {
                let v = if state.hv_on { state.voltage_setpoint } else { 0.0 };
                Some(CommandCodec::encode_numeric_reply(v))
            }
            "READ?" => Some(CommandCodec::encode_numeric_reply(state.current)),
            "VSET" => {
                if let Some(v) = arg.and_then(|a| a.parse::<f64>().ok()) {
                    state.voltage_setpoint = v;
                }
                None
            }
            "HVON" => {
                state.hv_on = true;
                None
            }
            "HVOF" => {
                state.hv_on = false;
                None
            }
            "*RST" => {
                state.hv_on = false;
                state.voltage_setpoint = 0.0;
                None
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let command = String::from_utf8_lossy(bytes).trim().to_string();
        state.written.push(command.clone());

        let scripted = state
            .scripted
            .get_mut(&command)
            .and_then(|replies| replies.pop_front());
        let reply = match scripted {
            Some(reply) => Some(reply),
            None => Self::simulate(&mut state, &command),
        };
        if let Some(reply) = reply {
            if !state.unresponsive && !state.hung.contains(&command) {
                state.pending.push_back(reply);
            }
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, TransportError> {
        let latency = {
            let state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let reply = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::Closed);
            }
            state.pending.pop_front()
        };
        match reply {
            Some(line) => Ok(line.into_bytes()),
            // No reply is coming; the caller's timeout decides.
            None => futures::future::pending().await,
        }
    }

    fn timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.state.lock().timeout = timeout;
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
        Ok(())
    }

    fn resource_name(&self) -> String {
        self.resource.clone()
    }
}
