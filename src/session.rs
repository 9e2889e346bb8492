//! Instrument session with a serialized command queue
//!
//! A GPIB link is stateful and cannot interleave traffic, so every command to
//! one instrument goes through a single queue:
//!
//! - One worker task per connected session owns the [`Transport`]
//! - Commands queue FIFO from any number of callers
//! - Each command completes (write, read, decode) before the next starts
//! - Replies return to callers over oneshot channels
//! - A separate priority queue lets `HVOF` overtake queued traffic
//!
//! Timeouts and transport failures move the session to `Faulted` and publish
//! a Fault event. There is no automatic recovery: the operator reconnects.
//!
//! # Example
//!
//! ```no_run
//! use hv_daq::bus::SampleBus;
//! use hv_daq::codec::QueryField;
//! use hv_daq::session::{InstrumentSession, SessionConfig};
//! use hv_daq::transport::MockTransport;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let session = InstrumentSession::new(SessionConfig::picoammeter(), SampleBus::new(64));
//! session.connect(Box::new(MockTransport::picoammeter())).await?;
//!
//! let query = session.codec().encode_query(QueryField::Current);
//! let reading = session.execute(query).await?;
//! println!("current: {:?}", reading);
//!
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

use crate::bus::SampleBus;
use crate::codec::{Action, Command, CommandCodec, QueryField, Value};
use crate::config::{InstrumentSettings, SafetySettings};
use crate::error::{ConnectError, ExecError};
use crate::events::{ConnectionState, Event, EventKind, InstrumentKind};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

const QUEUE_DEPTH: usize = 64;
const PRIORITY_DEPTH: usize = 8;
/// Bound on the `SYST:LOC` sent while disconnecting.
const LOCAL_TIMEOUT: Duration = Duration::from_millis(500);
const WORKER_SHUTDOWN: Duration = Duration::from_secs(1);

/// The interlock as seen from the session driving the HV supply.
///
/// Every method is synchronous and lock-bounded: the worker calls them inline
/// and must never wait on its own queue.
pub trait HvGate: Send + Sync {
    /// Asked immediately before `HVON` is written.
    fn permit_hv_on(&self) -> bool;

    /// The supply link faulted.
    fn session_faulted(&self, reason: &str);

    /// The supply link connected and identified itself.
    fn session_recovered(&self);
}

/// Static description of one instrument link.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Which instrument this session drives.
    pub kind: InstrumentKind,
    /// GPIB board index.
    pub board: u8,
    /// GPIB primary address.
    pub address: u8,
    /// Default command timeout.
    pub timeout: Duration,
    /// Fragment the `*IDN?` reply must contain.
    pub identity_match: String,
    /// Bound on the `HVOF` written when the supply link faults.
    pub fault_hvof_timeout: Duration,
}

impl SessionConfig {
    /// Keithley 2290-5 at GPIB0::14.
    pub fn power_supply() -> Self {
        Self {
            kind: InstrumentKind::PowerSupply,
            board: 0,
            address: 14,
            timeout: crate::codec::DEFAULT_TIMEOUT,
            identity_match: "2290".to_string(),
            fault_hvof_timeout: Duration::from_millis(250),
        }
    }

    /// Keithley 6485 at GPIB0::22.
    pub fn picoammeter() -> Self {
        Self {
            kind: InstrumentKind::Picoammeter,
            board: 0,
            address: 22,
            timeout: crate::codec::DEFAULT_TIMEOUT,
            identity_match: "6485".to_string(),
            fault_hvof_timeout: Duration::from_millis(250),
        }
    }

    /// Build from the configuration sections.
    pub fn from_settings(
        kind: InstrumentKind,
        link: &InstrumentSettings,
        safety: &SafetySettings,
    ) -> Self {
        Self {
            kind,
            board: link.board,
            address: link.address,
            timeout: link.timeout,
            identity_match: link.identity_match.clone(),
            fault_hvof_timeout: safety.emergency_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobClass {
    Normal,
    Priority,
}

struct Job {
    command: Command,
    class: JobClass,
    hv_generation: u64,
    reply: oneshot::Sender<Result<Option<Value>, ExecError>>,
}

struct Link {
    tx: mpsc::Sender<Job>,
    priority_tx: mpsc::Sender<Job>,
    worker: JoinHandle<()>,
}

struct Core {
    config: SessionConfig,
    codec: CommandCodec,
    state: watch::Sender<ConnectionState>,
    bus: SampleBus,
    gate: Mutex<Option<Weak<dyn HvGate>>>,
    hv_generation: AtomicU64,
    identity: Mutex<Option<String>>,
}

impl Core {
    fn kind(&self) -> InstrumentKind {
        self.config.kind
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                instrument = %self.kind(),
                address = self.config.address,
                from = %previous,
                to = %next,
                "Session state changed"
            );
        }
        previous
    }

    fn gate(&self) -> Option<Arc<dyn HvGate>> {
        self.gate.lock().as_ref().and_then(Weak::upgrade)
    }

    async fn process(&self, transport: &mut dyn Transport, job: Job) {
        let Job {
            command,
            class,
            hv_generation,
            reply,
        } = job;
        let result = self.run(transport, &command, class, hv_generation).await;
        // The caller may have stopped waiting; the command still ran.
        let _ = reply.send(result);
    }

    async fn run(
        &self,
        transport: &mut dyn Transport,
        command: &Command,
        class: JobClass,
        hv_generation: u64,
    ) -> Result<Option<Value>, ExecError> {
        if class == JobClass::Normal {
            let state = self.state();
            if !matches!(
                state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return Err(ExecError::NotConnected(state));
            }
        }

        if command.is_hv_enabling() {
            if hv_generation != self.hv_generation.load(Ordering::SeqCst) {
                warn!(instrument = %self.kind(), "Discarding HVON queued before an HV shutdown");
                return Err(ExecError::Abandoned);
            }
            let permitted = self.gate().map_or(false, |gate| gate.permit_hv_on());
            if !permitted {
                warn!(instrument = %self.kind(), "HVON refused by interlock at dispatch");
                return Err(ExecError::Interlocked);
            }
        }

        trace!(
            instrument = %self.kind(),
            command = %command.scpi_text(),
            "Dispatching command"
        );
        transport.set_timeout(command.timeout());
        let result = match tokio::time::timeout(command.timeout(), dispatch(transport, command))
            .await
        {
            Ok(Err(ExecError::Timeout(_))) | Err(_) => Err(ExecError::Timeout(command.timeout())),
            Ok(result) => result,
        };

        match &result {
            Err(err) if err.is_link_fault() => self.on_link_fault(transport, command, err).await,
            Err(err) => debug!(
                instrument = %self.kind(),
                command = %command.scpi_text(),
                error = %err,
                "Command failed"
            ),
            Ok(value) => trace!(
                instrument = %self.kind(),
                command = %command.scpi_text(),
                reply = ?value,
                "Command completed"
            ),
        }
        result
    }

    async fn on_link_fault(&self, transport: &mut dyn Transport, command: &Command, err: &ExecError) {
        let faulted = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Faulted;
                true
            } else {
                false
            }
        });

        if faulted {
            error!(
                instrument = %self.kind(),
                address = self.config.address,
                command = %command.scpi_text(),
                error = %err,
                "Link fault, session faulted"
            );
            let reason = format!("{} failed: {}", command.scpi_text(), err);
            self.bus
                .publish(Event::new(EventKind::Fault, Some(self.kind()), reason.clone()));
            if let Some(gate) = self.gate() {
                gate.session_faulted(&reason);
            }
        }

        if self.kind() == InstrumentKind::PowerSupply && !command.is_hv_disabling() {
            if let Ok(hvof) = self.codec.encode_action(Action::DisableHighVoltage) {
                transport.set_timeout(self.config.fault_hvof_timeout);
                match tokio::time::timeout(
                    self.config.fault_hvof_timeout,
                    transport.write(&hvof.wire_bytes()),
                )
                .await
                {
                    Ok(Ok(())) => info!(instrument = %self.kind(), "HVOF written after link fault"),
                    Ok(Err(e)) => warn!(instrument = %self.kind(), error = %e, "HVOF after link fault failed"),
                    Err(_) => warn!(instrument = %self.kind(), "HVOF after link fault timed out"),
                }
            }
        }
    }
}

async fn dispatch(transport: &mut dyn Transport, command: &Command) -> Result<Option<Value>, ExecError> {
    transport.write(&command.wire_bytes()).await?;
    let Some(field) = command.reply_field() else {
        return Ok(None);
    };
    let line = transport.read_line().await?;
    let text = String::from_utf8_lossy(&line);
    Ok(Some(CommandCodec::decode_reply(field, &text)?))
}

async fn run_worker(
    core: Arc<Core>,
    mut transport: Box<dyn Transport>,
    mut normal: mpsc::Receiver<Job>,
    mut priority: mpsc::Receiver<Job>,
) {
    debug!(
        instrument = %core.kind(),
        resource = %transport.resource_name(),
        "Starting command queue task"
    );

    loop {
        let job = tokio::select! {
            biased;
            Some(job) = priority.recv() => job,
            job = normal.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        core.process(transport.as_mut(), job).await;
    }

    while let Ok(job) = priority.try_recv() {
        let _ = job.reply.send(Err(ExecError::NotConnected(core.state())));
    }
    if let Err(e) = transport.close().await {
        warn!(instrument = %core.kind(), error = %e, "Closing transport failed");
    }
    debug!(instrument = %core.kind(), "Command queue task ended");
}

/// Handle to one instrument link. Clones share the same session.
#[derive(Clone)]
pub struct InstrumentSession {
    core: Arc<Core>,
    link: Arc<Mutex<Option<Link>>>,
    /// Held for the whole of `connect` and `disconnect`.
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl InstrumentSession {
    /// Disconnected session publishing to `bus`.
    pub fn new(config: SessionConfig, bus: SampleBus) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            core: Arc::new(Core {
                codec: CommandCodec::new(config.timeout),
                config,
                state,
                bus,
                gate: Mutex::new(None),
                hv_generation: AtomicU64::new(0),
                identity: Mutex::new(None),
            }),
            link: Arc::new(Mutex::new(None)),
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Instrument this session drives.
    pub fn kind(&self) -> InstrumentKind {
        self.core.kind()
    }

    /// GPIB primary address.
    pub fn address(&self) -> u8 {
        self.core.config.address
    }

    /// Link configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    /// Codec stamping this session's default timeout.
    pub fn codec(&self) -> CommandCodec {
        self.core.codec
    }

    /// Snapshot of the connection state.
    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    /// Whether the session accepts commands.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// `*IDN?` reply from the last successful connect.
    pub fn identity(&self) -> Option<String> {
        self.core.identity.lock().clone()
    }

    /// Route `HVON` dispatch decisions and link faults through `gate`.
    pub fn attach_interlock(&self, gate: Weak<dyn HvGate>) {
        *self.core.gate.lock() = Some(gate);
    }

    /// Discard every `HVON` queued but not yet dispatched.
    pub fn abandon_hv_enables(&self) {
        self.core.hv_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Take ownership of `transport`, start the command queue and validate the
    /// instrument with `*IDN?`.
    ///
    /// A faulted session releases its old link first. Connect and disconnect
    /// never overlap: a concurrent `disconnect` waits for this call to finish.
    ///
    /// # Errors
    ///
    /// - [`ConnectError::AlreadyConnected`] if connected or connecting
    /// - [`ConnectError::Unresponsive`] on timeout or unexpected identity; the
    ///   session is then `Faulted`
    pub async fn connect(&self, transport: Box<dyn Transport>) -> Result<(), ConnectError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Faulted {
            info!(instrument = %self.kind(), "Releasing faulted link before reconnect");
            self.release_link().await;
        }

        let claimed = self.core.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ConnectError::AlreadyConnected);
        }
        let resource = transport.resource_name();
        info!(
            instrument = %self.kind(),
            address = self.address(),
            resource = %resource,
            "Connecting"
        );

        let (tx, normal_rx) = mpsc::channel(QUEUE_DEPTH);
        let (priority_tx, priority_rx) = mpsc::channel(PRIORITY_DEPTH);
        let worker = tokio::spawn(run_worker(
            self.core.clone(),
            transport,
            normal_rx,
            priority_rx,
        ));
        *self.link.lock() = Some(Link {
            tx,
            priority_tx,
            worker,
        });

        let query = self.core.codec.encode_query(QueryField::Identity);
        let expected = &self.core.config.identity_match;
        let outcome = match self.submit(query, JobClass::Normal).await {
            Ok(Some(Value::Text(identity))) if identity.contains(expected.as_str()) => Ok(identity),
            Ok(Some(other)) => Err(format!(
                "unexpected identity {:?}, expected '{}'",
                other, expected
            )),
            Ok(None) => Err("no identity reply".to_string()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(identity) => {
                if !self.leave_connecting(ConnectionState::Connected) {
                    return Err(ConnectError::Unresponsive(format!(
                        "link lost while identifying ({})",
                        self.state()
                    )));
                }
                info!(instrument = %self.kind(), identity = %identity, "Instrument identified");
                self.core.bus.publish(Event::new(
                    EventKind::Connected,
                    Some(self.kind()),
                    format!("{} at {}", identity, resource),
                ));
                *self.core.identity.lock() = Some(identity);
                if let Some(gate) = self.core.gate() {
                    gate.session_recovered();
                }
                Ok(())
            }
            Err(reason) => {
                self.leave_connecting(ConnectionState::Faulted);
                warn!(instrument = %self.kind(), reason = %reason, "Connect failed");
                self.core.bus.publish(Event::new(
                    EventKind::Fault,
                    Some(self.kind()),
                    format!("connect to {} failed: {}", resource, reason),
                ));
                Err(ConnectError::Unresponsive(reason))
            }
        }
    }

    /// `Connecting -> next`; false if something else moved the state first.
    fn leave_connecting(&self, next: ConnectionState) -> bool {
        let moved = self.core.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!(
                instrument = %self.kind(),
                address = self.address(),
                from = %ConnectionState::Connecting,
                to = %next,
                "Session state changed"
            );
        }
        moved
    }

    /// Run one command through the queue.
    ///
    /// Calls complete in submission order. A timeout or transport failure also
    /// faults the session and publishes a Fault event.
    pub async fn execute(&self, command: Command) -> Result<Option<Value>, ExecError> {
        self.check_target(&command)?;
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ExecError::NotConnected(state));
        }
        self.submit(command, JobClass::Normal).await
    }

    /// Run `command` ahead of queued traffic, even while `Faulted`.
    ///
    /// Reserved for shutdown commands; `HVON` is refused.
    pub async fn execute_priority(&self, command: Command) -> Result<Option<Value>, ExecError> {
        self.check_target(&command)?;
        if command.is_hv_enabling() {
            return Err(ExecError::Interlocked);
        }
        self.submit(command, JobClass::Priority).await
    }

    fn check_target(&self, command: &Command) -> Result<(), ExecError> {
        match command.target() {
            Some(target) if target != self.kind() => Err(ExecError::WrongInstrument {
                expected: self.kind(),
                got: target,
            }),
            _ => Ok(()),
        }
    }

    async fn submit(&self, command: Command, class: JobClass) -> Result<Option<Value>, ExecError> {
        let hv_generation = self.core.hv_generation.load(Ordering::SeqCst);
        let sender = {
            let link = self.link.lock();
            match link.as_ref() {
                Some(link) if class == JobClass::Priority => link.priority_tx.clone(),
                Some(link) => link.tx.clone(),
                None => return Err(ExecError::NotConnected(self.state())),
            }
        };

        let (reply, response) = oneshot::channel();
        sender
            .send(Job {
                command,
                class,
                hv_generation,
                reply,
            })
            .await
            .map_err(|_| ExecError::TransportClosed("command queue stopped".to_string()))?;
        response
            .await
            .map_err(|_| ExecError::TransportClosed("command queue stopped".to_string()))?
    }

    /// Return the instrument to local control and release the link.
    ///
    /// Idempotent; never fails, even on a dead transport. Always ends
    /// `Disconnected`.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.release_link().await;
    }

    async fn release_link(&self) {
        let link = self.link.lock().take();
        let Some(link) = link else {
            self.core.set_state(ConnectionState::Disconnected);
            return;
        };
        let Link {
            tx,
            priority_tx,
            mut worker,
        } = link;

        // Queued traffic is refused from here on; only the priority path runs.
        self.core.set_state(ConnectionState::Disconnected);

        if let Ok(local) = self.core.codec.encode_action(Action::ReturnToLocal) {
            let (reply, response) = oneshot::channel();
            let job = Job {
                command: local.with_timeout(LOCAL_TIMEOUT),
                class: JobClass::Priority,
                hv_generation: 0,
                reply,
            };
            if priority_tx.try_send(job).is_ok() {
                match tokio::time::timeout(LOCAL_TIMEOUT * 2, response).await {
                    Ok(Ok(Ok(_))) => debug!(instrument = %self.kind(), "Returned to local control"),
                    Ok(Ok(Err(e))) => debug!(instrument = %self.kind(), error = %e, "SYST:LOC failed"),
                    _ => debug!(instrument = %self.kind(), "SYST:LOC not confirmed"),
                }
            }
        }

        drop(tx);
        drop(priority_tx);
        if tokio::time::timeout(WORKER_SHUTDOWN, &mut worker).await.is_err() {
            warn!(instrument = %self.kind(), "Command queue task did not stop in time, aborting");
            worker.abort();
        }

        *self.core.identity.lock() = None;
        self.core.bus.publish(Event::new(
            EventKind::Disconnected,
            Some(self.kind()),
            "link released",
        ));
    }
}

impl std::fmt::Debug for InstrumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentSession")
            .field("kind", &self.kind())
            .field("address", &self.address())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusMessage;
    use crate::transport::MockTransport;
    use std::sync::atomic::AtomicBool;

    struct TestGate {
        permit: AtomicBool,
        faults: Mutex<Vec<String>>,
    }

    impl TestGate {
        fn new(permit: bool) -> Arc<Self> {
            Arc::new(Self {
                permit: AtomicBool::new(permit),
                faults: Mutex::new(Vec::new()),
            })
        }
    }

    impl HvGate for TestGate {
        fn permit_hv_on(&self) -> bool {
            self.permit.load(Ordering::SeqCst)
        }

        fn session_faulted(&self, reason: &str) {
            self.faults.lock().push(reason.to_string());
        }

        fn session_recovered(&self) {}
    }

    async fn connected_supply() -> (InstrumentSession, MockTransport, SampleBus) {
        let bus = SampleBus::new(64);
        let session = InstrumentSession::new(SessionConfig::power_supply(), bus.clone());
        let mock = MockTransport::power_supply();
        session.connect(Box::new(mock.clone())).await.unwrap();
        (session, mock, bus)
    }

    fn events(bus_rx: &mut crate::bus::ConsumerHandle) -> Vec<EventKind> {
        bus_rx
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                BusMessage::Event(e) => Some(e.kind),
                BusMessage::Sample(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_validates_identity() {
        let (session, mock, _bus) = connected_supply().await;
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.identity().unwrap().contains("2290"));
        assert_eq!(mock.written(), vec!["*IDN?".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_twice_rejected() {
        let (session, _mock, _bus) = connected_supply().await;
        let err = session
            .connect(Box::new(MockTransport::power_supply()))
            .await
            .unwrap_err();
        assert_eq!(err, ConnectError::AlreadyConnected);
    }

    #[tokio::test]
    async fn test_wrong_identity_faults() {
        let session = InstrumentSession::new(SessionConfig::picoammeter(), SampleBus::new(8));
        let err = session
            .connect(Box::new(MockTransport::power_supply()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Unresponsive(_)));
        assert_eq!(session.state(), ConnectionState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_instrument_is_unresponsive() {
        let mut config = SessionConfig::picoammeter();
        config.timeout = Duration::from_millis(200);
        let session = InstrumentSession::new(config, SampleBus::new(8));
        let mock = MockTransport::picoammeter();
        mock.set_unresponsive(true);

        let err = session.connect(Box::new(mock)).await.unwrap_err();
        assert!(matches!(err, ConnectError::Unresponsive(_)));
        assert_eq!(session.state(), ConnectionState::Faulted);
    }

    #[tokio::test]
    async fn test_execute_requires_connection() {
        let session = InstrumentSession::new(SessionConfig::power_supply(), SampleBus::new(8));
        let query = session.codec().encode_query(QueryField::OutputVoltage);
        let err = session.execute(query).await.unwrap_err();
        assert_eq!(err, ExecError::NotConnected(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_wrong_instrument_rejected() {
        let (session, _mock, _bus) = connected_supply().await;
        let query = session.codec().encode_query(QueryField::Current);
        let err = session.execute(query).await.unwrap_err();
        assert!(matches!(err, ExecError::WrongInstrument { .. }));
    }

    #[tokio::test]
    async fn test_query_decodes_reply() {
        let bus = SampleBus::new(8);
        let session = InstrumentSession::new(SessionConfig::picoammeter(), bus);
        let mock = MockTransport::picoammeter();
        mock.script_reply("READ?", "2.500000E-09");
        session.connect(Box::new(mock)).await.unwrap();

        let query = session.codec().encode_query(QueryField::Current);
        let value = session.execute(query).await.unwrap();
        assert_eq!(value.and_then(|v| v.as_f64()), Some(2.5e-9));
    }

    #[tokio::test]
    async fn test_command_timeout_reaches_transport() {
        let (session, mock, _bus) = connected_supply().await;
        let query = session
            .codec()
            .encode_query(QueryField::OutputVoltage)
            .with_timeout(Duration::from_millis(750));
        session.execute(query).await.unwrap();
        assert_eq!(mock.timeout(), Duration::from_millis(750));

        let query = session
            .codec()
            .encode_query(QueryField::OutputVoltage)
            .with_timeout(Duration::from_millis(120));
        session.execute(query).await.unwrap();
        assert_eq!(mock.timeout(), Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_decode_error_does_not_fault() {
        let bus = SampleBus::new(8);
        let session = InstrumentSession::new(SessionConfig::picoammeter(), bus);
        let mock = MockTransport::picoammeter();
        mock.script_reply("READ?", "ERROR");
        session.connect(Box::new(mock)).await.unwrap();

        let query = session.codec().encode_query(QueryField::Current);
        let err = session.execute(query).await.unwrap_err();
        assert!(matches!(err, ExecError::Decode(_)));
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_faults_session_and_writes_hvof() {
        let (session, mock, bus) = connected_supply().await;
        let mut watcher = bus.subscribe("watcher");
        let gate = TestGate::new(true);
        let gate_dyn: Arc<dyn HvGate> = gate.clone();
        session.attach_interlock(Arc::downgrade(&gate_dyn));
        mock.hang_on("VOUT?");

        let query = session
            .codec()
            .encode_query(QueryField::OutputVoltage)
            .with_timeout(Duration::from_millis(100));
        let err = session.execute(query).await.unwrap_err();
        assert_eq!(err, ExecError::Timeout(Duration::from_millis(100)));
        assert_eq!(session.state(), ConnectionState::Faulted);
        assert_eq!(mock.written().last().map(String::as_str), Some("HVOF"));
        assert_eq!(gate.faults.lock().len(), 1);
        assert!(events(&mut watcher).contains(&EventKind::Fault));

        // no silent retry: later commands are refused until reconnect
        let again = session.codec().encode_query(QueryField::OutputVoltage);
        assert_eq!(
            session.execute(again).await.unwrap_err(),
            ExecError::NotConnected(ConnectionState::Faulted)
        );
    }

    #[tokio::test]
    async fn test_severed_link_reports_transport_closed() {
        let (session, mock, _bus) = connected_supply().await;
        mock.sever();
        let set = session.codec().encode_set_voltage(10.0).unwrap();
        let err = session.execute(set).await.unwrap_err();
        assert!(matches!(err, ExecError::TransportClosed(_)));
        assert_eq!(session.state(), ConnectionState::Faulted);
    }

    #[tokio::test]
    async fn test_hv_on_without_interlock_refused() {
        let (session, mock, _bus) = connected_supply().await;
        let hvon = session
            .codec()
            .encode_action(Action::EnableHighVoltage)
            .unwrap();
        assert_eq!(session.execute(hvon).await.unwrap_err(), ExecError::Interlocked);
        assert!(!mock.written().contains(&"HVON".to_string()));
    }

    #[tokio::test]
    async fn test_hv_on_gated_at_dispatch() {
        let (session, mock, _bus) = connected_supply().await;
        let gate = TestGate::new(false);
        let gate_dyn: Arc<dyn HvGate> = gate.clone();
        session.attach_interlock(Arc::downgrade(&gate_dyn));
        let hvon = || session.codec().encode_action(Action::EnableHighVoltage).unwrap();

        assert_eq!(session.execute(hvon()).await.unwrap_err(), ExecError::Interlocked);
        gate.permit.store(true, Ordering::SeqCst);
        session.execute(hvon()).await.unwrap();
        assert!(mock.hv_on());
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_hv_on_never_written() {
        let (session, mock, _bus) = connected_supply().await;
        let gate = TestGate::new(true);
        let gate_dyn: Arc<dyn HvGate> = gate.clone();
        session.attach_interlock(Arc::downgrade(&gate_dyn));
        let mock = mock.with_latency(Duration::from_millis(300));

        // park the queue behind a slow query
        let first = session.clone();
        let busy = tokio::spawn(async move {
            let query = first.codec().encode_query(QueryField::OutputVoltage);
            first.execute(query).await
        });
        settle().await;

        let second = session.clone();
        let pending = tokio::spawn(async move {
            let hvon = second.codec().encode_action(Action::EnableHighVoltage).unwrap();
            second.execute(hvon).await
        });
        settle().await;
        session.abandon_hv_enables();

        busy.await.unwrap().unwrap();
        assert_eq!(pending.await.unwrap().unwrap_err(), ExecError::Abandoned);
        assert!(!mock.written().contains(&"HVON".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_writes_keep_submission_order() {
        let (session, mock, _bus) = connected_supply().await;
        mock.clear_log();

        let calls: Vec<_> = (0..20)
            .map(|i| {
                let cmd = session.codec().encode_set_voltage(i as f64).unwrap();
                session.execute(cmd)
            })
            .collect();
        for result in futures::future::join_all(calls).await {
            result.unwrap();
        }

        let expected: Vec<String> = (0..20).map(|i| format!("VSET {}", i)).collect();
        assert_eq!(mock.written(), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_callers_on_many_tasks_never_interleave() {
        let (session, mock, _bus) = connected_supply().await;
        mock.clear_log();

        let mut handles = Vec::new();
        for caller in 0..4u32 {
            let s = session.clone();
            handles.push(tokio::spawn(async move {
                for step in 0..10u32 {
                    let v = f64::from(caller * 100 + step);
                    s.execute(s.codec().encode_set_voltage(v).unwrap())
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let written = mock.written();
        assert_eq!(written.len(), 40);
        for caller in 0..4u32 {
            let mine: Vec<&String> = written
                .iter()
                .filter(|w| {
                    w.trim_start_matches("VSET ")
                        .parse::<u32>()
                        .map_or(false, |v| v / 100 == caller)
                })
                .collect();
            let expected: Vec<String> = (0..10).map(|s| format!("VSET {}", caller * 100 + s)).collect();
            assert_eq!(mine, expected.iter().collect::<Vec<_>>());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_hvof_runs_while_faulted() {
        let (session, mock, _bus) = connected_supply().await;
        mock.hang_on("VOUT?");
        let query = session
            .codec()
            .encode_query(QueryField::OutputVoltage)
            .with_timeout(Duration::from_millis(50));
        let _ = session.execute(query).await;
        assert_eq!(session.state(), ConnectionState::Faulted);
        mock.clear_log();

        let hvof = session
            .codec()
            .encode_action(Action::DisableHighVoltage)
            .unwrap();
        session.execute_priority(hvof).await.unwrap();
        assert_eq!(mock.written(), vec!["HVOF".to_string()]);
    }

    #[tokio::test]
    async fn test_disconnect_returns_to_local_and_is_idempotent() {
        let (session, mock, bus) = connected_supply().await;
        let mut watcher = bus.subscribe("watcher");
        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(mock.written().last().map(String::as_str), Some("SYST:LOC"));
        assert!(mock.is_closed());
        assert_eq!(events(&mut watcher), vec![EventKind::Disconnected]);
    }

    #[tokio::test]
    async fn test_disconnect_on_dead_link_does_not_fail() {
        let (session, mock, _bus) = connected_supply().await;
        mock.sever();
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_after_fault() {
        let (session, mock, _bus) = connected_supply().await;
        mock.sever();
        let set = session.codec().encode_set_voltage(1.0).unwrap();
        let _ = session.execute(set).await;
        assert_eq!(session.state(), ConnectionState::Faulted);

        session
            .connect(Box::new(MockTransport::power_supply()))
            .await
            .unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_connect_leaves_session_usable() {
        let session = InstrumentSession::new(SessionConfig::power_supply(), SampleBus::new(16));
        let mock = MockTransport::power_supply().with_latency(Duration::from_millis(100));

        let connecting = {
            let session = session.clone();
            let mock = mock.clone();
            tokio::spawn(async move { session.connect(Box::new(mock)).await })
        };
        settle().await;
        assert_eq!(session.state(), ConnectionState::Connecting);

        session.disconnect().await;
        assert!(connecting.await.unwrap().is_ok());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(mock.is_closed());

        // Nothing is left half-open: commands are refused and a fresh link works.
        let query = session.codec().encode_query(QueryField::OutputVoltage);
        assert!(matches!(
            session.execute(query).await,
            Err(ExecError::NotConnected(ConnectionState::Disconnected))
        ));
        session
            .connect(Box::new(MockTransport::power_supply()))
            .await
            .unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_without_link_forces_disconnected() {
        let session = InstrumentSession::new(SessionConfig::power_supply(), SampleBus::new(16));
        session.core.set_state(ConnectionState::Faulted);
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
