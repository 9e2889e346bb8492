//! Command API over the whole instrument pair.
//!
//! `Station` owns the bus, the interlock, one session per instrument and the
//! acquisition scheduler, all built from [`Settings`]. A front end forwards
//! user actions here and subscribes to the bus for everything else. Every
//! failed operation is also published as an [`EventKind::Error`] event.

use crate::acquisition::{AcquisitionScheduler, SchedulerConfig};
use crate::bus::{ConsumerHandle, SampleBus};
use crate::codec::{Action, QueryField, Value};
use crate::config::Settings;
use crate::error::{AppResult, DaqError, DecodeError, InvalidArgument};
use crate::events::{Event, EventKind, InstrumentKind, SafetyState};
use crate::safety::SafetyInterlock;
use crate::session::{InstrumentSession, SessionConfig};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Longest HV auto-off timer.
pub const MAX_HV_TIMER: Duration = Duration::from_secs(24 * 60 * 60);
/// Most entries read from an instrument error queue on disconnect.
const ERROR_QUEUE_DRAIN: usize = 10;
const ERROR_QUERY_TIMEOUT: Duration = Duration::from_millis(500);
/// How long a disconnect waits for `*OPC?` to report `1` after `HVOF`.
const READY_WAIT: Duration = Duration::from_secs(3);
const READY_POLL: Duration = Duration::from_millis(100);

/// The instrument pair and everything around it.
pub struct Station {
    settings: Settings,
    bus: SampleBus,
    interlock: SafetyInterlock,
    supply: InstrumentSession,
    picoammeter: InstrumentSession,
    scheduler: AcquisitionScheduler,
    hv_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Station {
    /// Build every component from `settings`. Nothing is connected yet.
    pub fn new(settings: Settings) -> Self {
        let bus = SampleBus::new(settings.bus.capacity);
        let interlock = SafetyInterlock::new(&settings.safety, bus.clone());
        let supply = InstrumentSession::new(
            SessionConfig::from_settings(
                InstrumentKind::PowerSupply,
                &settings.power_supply,
                &settings.safety,
            ),
            bus.clone(),
        );
        let picoammeter = InstrumentSession::new(
            SessionConfig::from_settings(
                InstrumentKind::Picoammeter,
                &settings.picoammeter,
                &settings.safety,
            ),
            bus.clone(),
        );
        interlock.attach_output(&supply);
        let scheduler = AcquisitionScheduler::new(
            picoammeter.clone(),
            supply.clone(),
            interlock.clone(),
            bus.clone(),
            SchedulerConfig::from(&settings.acquisition),
        );

        Self {
            settings,
            bus,
            interlock,
            supply,
            picoammeter,
            scheduler,
            hv_timer: Mutex::new(None),
        }
    }

    /// Effective settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Shared bus.
    pub fn bus(&self) -> &SampleBus {
        &self.bus
    }

    /// Subscribe to samples and events from now on.
    pub fn subscribe(&self, name: &str) -> ConsumerHandle {
        self.bus.subscribe(name)
    }

    /// The safety interlock.
    pub fn interlock(&self) -> &SafetyInterlock {
        &self.interlock
    }

    /// Session for `kind`.
    pub fn session(&self, kind: InstrumentKind) -> &InstrumentSession {
        match kind {
            InstrumentKind::PowerSupply => &self.supply,
            InstrumentKind::Picoammeter => &self.picoammeter,
        }
    }

    /// The acquisition scheduler.
    pub fn scheduler(&self) -> &AcquisitionScheduler {
        &self.scheduler
    }

    fn report<T, E>(&self, instrument: Option<InstrumentKind>, result: Result<T, E>) -> AppResult<T>
    where
        E: Into<DaqError>,
    {
        result.map_err(|e| {
            let err: DaqError = e.into();
            warn!(instrument = ?instrument, error = %err, "Operation failed");
            self.bus
                .publish(Event::from_error(EventKind::Error, instrument, &err));
            err
        })
    }

    async fn run_sequence(&self, kind: InstrumentKind, actions: &[Action]) -> AppResult<()> {
        let session = self.session(kind);
        for action in actions {
            let command = self.report(Some(kind), session.codec().encode_action(*action))?;
            self.report(Some(kind), session.execute(command).await)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    /// Connect the supply, then reset it and program the configured maxima as
    /// its hardware limits.
    pub async fn connect_power_supply(&self, transport: Box<dyn Transport>) -> AppResult<()> {
        let kind = InstrumentKind::PowerSupply;
        self.report(Some(kind), self.supply.connect(transport).await)?;
        self.run_sequence(kind, &[Action::Reset, Action::ClearStatus])
            .await?;

        let codec = self.supply.codec();
        let vlim = self.report(
            Some(kind),
            codec.encode_set_voltage_limit(self.settings.safety.max_voltage),
        )?;
        let ilim = self.report(
            Some(kind),
            codec.encode_set_current_limit(self.settings.safety.max_current),
        )?;
        self.report(Some(kind), self.supply.execute(vlim).await)?;
        self.report(Some(kind), self.supply.execute(ilim).await)?;
        info!(instrument = %kind, "Power supply initialised");
        Ok(())
    }

    /// Connect the picoammeter and put it in a known measuring state.
    pub async fn connect_picoammeter(&self, transport: Box<dyn Transport>) -> AppResult<()> {
        let kind = InstrumentKind::Picoammeter;
        self.report(Some(kind), self.picoammeter.connect(transport).await)?;
        self.run_sequence(
            kind,
            &[
                Action::Reset,
                Action::ClearStatus,
                Action::SetZeroCheck(false),
                Action::SetAutoRange(true),
                Action::SetIntegrationTime(1.0),
                Action::FormatReadingsOnly,
            ],
        )
        .await?;
        info!(instrument = %kind, "Picoammeter initialised");
        Ok(())
    }

    /// Read and log up to ten entries from an instrument's error queue.
    pub async fn drain_error_queue(&self, kind: InstrumentKind) -> Vec<String> {
        let session = self.session(kind);
        let mut errors = Vec::new();
        for _ in 0..ERROR_QUEUE_DRAIN {
            let query = session
                .codec()
                .encode_query(QueryField::ErrorQueue)
                .with_timeout(ERROR_QUERY_TIMEOUT);
            match session.execute(query).await {
                Ok(Some(Value::Text(entry))) if !entry.starts_with('0') => {
                    warn!(instrument = %kind, entry = %entry, "Instrument error queue");
                    errors.push(entry);
                }
                _ => break,
            }
        }
        errors
    }

    /// Poll `*OPC?` until the instrument reports `1` or [`READY_WAIT`] runs
    /// out. A failed link ends the wait early.
    pub async fn wait_until_ready(&self, kind: InstrumentKind) -> bool {
        let session = self.session(kind);
        let deadline = tokio::time::Instant::now() + READY_WAIT;
        loop {
            let query = session
                .codec()
                .encode_query(QueryField::OperationComplete)
                .with_timeout(ERROR_QUERY_TIMEOUT);
            match session.execute(query).await {
                Ok(Some(value)) if value.as_f64() == Some(1.0) => return true,
                Err(e) if e.is_link_fault() || !session.is_connected() => {
                    warn!(instrument = %kind, error = %e, "Ready check abandoned");
                    return false;
                }
                _ => {}
            }
            if tokio::time::Instant::now() + READY_POLL >= deadline {
                warn!(instrument = %kind, "Instrument did not report ready in time");
                return false;
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// Switch HV off, wait for the supply to settle, drain the error queue
    /// and release the supply to local control.
    ///
    /// With output enabled `HVOF` goes first. Otherwise stale errors are read
    /// before `HVOF` so the second drain only shows what the shutdown raised.
    pub async fn disconnect_power_supply(&self) {
        self.cancel_hv_timer();
        if self.interlock.state() == SafetyState::Enabled {
            let _ = self.interlock.disable().await;
        } else {
            self.drain_error_queue(InstrumentKind::PowerSupply).await;
            if let Ok(hvof) = self.supply.codec().encode_action(Action::DisableHighVoltage) {
                let hvof = hvof.with_timeout(self.settings.safety.emergency_timeout);
                if let Err(e) = self.supply.execute_priority(hvof).await {
                    warn!(error = %e, "HVOF before disconnect failed");
                }
            }
        }
        self.wait_until_ready(InstrumentKind::PowerSupply).await;
        self.drain_error_queue(InstrumentKind::PowerSupply).await;
        self.supply.disconnect().await;
    }

    /// Stop acquisition, drain the error queue and release the picoammeter.
    pub async fn disconnect_picoammeter(&self) {
        self.scheduler.stop().await;
        self.drain_error_queue(InstrumentKind::Picoammeter).await;
        self.picoammeter.disconnect().await;
    }

    // ------------------------------------------------------------------
    // Power supply
    // ------------------------------------------------------------------

    /// `VSET`, bounded by the interlock's voltage limit (or the configured
    /// maximum before limits are set).
    pub async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        let kind = Some(InstrumentKind::PowerSupply);
        let bound = self
            .interlock
            .limits()
            .map_or(self.settings.safety.max_voltage, |l| l.voltage_limit);
        if volts > bound {
            return self.report(
                kind,
                Err(InvalidArgument::new(
                    "voltage",
                    volts,
                    format!("exceeds voltage limit {}", bound),
                )),
            );
        }
        let command = self.report(kind, self.supply.codec().encode_set_voltage(volts))?;
        self.report(kind, self.supply.execute(command).await)?;
        Ok(())
    }

    /// Output voltage as reported by the supply.
    pub async fn read_voltage(&self) -> AppResult<f64> {
        let kind = Some(InstrumentKind::PowerSupply);
        let query = self.supply.codec().encode_query(QueryField::OutputVoltage);
        let value = self.report(kind, self.supply.execute(query).await)?;
        let voltage = value
            .and_then(|v| v.as_f64())
            .ok_or_else(|| DecodeError::Malformed("missing voltage reading".to_string()));
        self.report(kind, voltage)
    }

    /// Store limits in the interlock, then program `VLIM`/`ILIM` if the supply
    /// is connected.
    pub async fn set_limits(&self, voltage_limit: f64, current_limit: f64) -> AppResult<()> {
        let kind = Some(InstrumentKind::PowerSupply);
        self.report(kind, self.interlock.set_limits(voltage_limit, current_limit))?;
        if !self.supply.is_connected() {
            return Ok(());
        }
        let codec = self.supply.codec();
        let vlim = self.report(kind, codec.encode_set_voltage_limit(voltage_limit))?;
        let ilim = self.report(kind, codec.encode_set_current_limit(current_limit))?;
        self.report(kind, self.supply.execute(vlim).await)?;
        self.report(kind, self.supply.execute(ilim).await)?;
        Ok(())
    }

    /// Arm the interlock.
    pub fn arm(&self) -> AppResult<()> {
        self.report(Some(InstrumentKind::PowerSupply), self.interlock.arm())
    }

    /// Enable HV output.
    pub async fn enable_hv(&self) -> AppResult<()> {
        self.report(
            Some(InstrumentKind::PowerSupply),
            self.interlock.enable_output().await,
        )
    }

    /// Enable HV output and switch it off again after `duration`
    /// (0 < duration <= 24 h).
    pub async fn enable_hv_for(&self, duration: Duration) -> AppResult<()> {
        let kind = Some(InstrumentKind::PowerSupply);
        if duration.is_zero() || duration > MAX_HV_TIMER {
            return self.report(
                kind,
                Err(InvalidArgument::new(
                    "HV timer",
                    format!("{:?}", duration),
                    "must be greater than zero and at most 24h",
                )),
            );
        }
        self.enable_hv().await?;

        let interlock = self.interlock.clone();
        let bus = self.bus.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            info!(?duration, "HV timer expired");
            let _ = interlock.disable().await;
            bus.publish(Event::new(
                EventKind::Output,
                Some(InstrumentKind::PowerSupply),
                format!("HV timer expired after {:?}", duration),
            ));
        });
        if let Some(previous) = self.hv_timer.lock().replace(timer) {
            previous.abort();
        }
        Ok(())
    }

    /// Cancel a pending HV timer. Returns whether one was pending.
    pub fn cancel_hv_timer(&self) -> bool {
        match self.hv_timer.lock().take() {
            Some(timer) if !timer.is_finished() => {
                timer.abort();
                info!("HV timer cancelled");
                true
            }
            _ => false,
        }
    }

    /// Disable HV output.
    pub async fn disable_hv(&self) -> AppResult<()> {
        self.cancel_hv_timer();
        self.report(
            Some(InstrumentKind::PowerSupply),
            self.interlock.disable().await,
        )
    }

    /// Emergency stop from any state.
    pub async fn emergency_stop(&self, actor: &str) {
        self.cancel_hv_timer();
        self.interlock.emergency_stop(actor).await;
    }

    /// Leave `EmergencyStopped`.
    pub fn reset(&self, actor: &str) -> AppResult<()> {
        self.report(Some(InstrumentKind::PowerSupply), self.interlock.reset(actor))
    }

    /// Leave `Fault`.
    pub fn clear_fault(&self, actor: &str) -> AppResult<()> {
        self.report(
            Some(InstrumentKind::PowerSupply),
            self.interlock.clear_fault(actor),
        )
    }

    // ------------------------------------------------------------------
    // Picoammeter
    // ------------------------------------------------------------------

    /// Auto-range with `None`, otherwise a fixed range in amperes.
    pub async fn set_range(&self, range: Option<f64>) -> AppResult<()> {
        match range {
            None => {
                self.run_sequence(InstrumentKind::Picoammeter, &[Action::SetAutoRange(true)])
                    .await
            }
            Some(amps) => {
                self.run_sequence(
                    InstrumentKind::Picoammeter,
                    &[Action::SetAutoRange(false), Action::SetRange(amps)],
                )
                .await
            }
        }
    }

    /// Integration time in power line cycles.
    pub async fn set_integration_time(&self, nplc: f64) -> AppResult<()> {
        self.run_sequence(
            InstrumentKind::Picoammeter,
            &[Action::SetIntegrationTime(nplc)],
        )
        .await
    }

    /// Zero check on or off.
    pub async fn set_zero_check(&self, on: bool) -> AppResult<()> {
        self.run_sequence(InstrumentKind::Picoammeter, &[Action::SetZeroCheck(on)])
            .await
    }

    /// Auto-zero on or off.
    pub async fn set_auto_zero(&self, on: bool) -> AppResult<()> {
        self.run_sequence(InstrumentKind::Picoammeter, &[Action::SetAutoZero(on)])
            .await
    }

    /// Full zero-correction: zero check on, acquire the correction, zero
    /// check off.
    pub async fn zero_correct(&self) -> AppResult<()> {
        self.run_sequence(
            InstrumentKind::Picoammeter,
            &[
                Action::SetZeroCheck(true),
                Action::Initiate,
                Action::AcquireZeroCorrection,
                Action::SetZeroCheck(false),
            ],
        )
        .await?;
        info!("Zero correction acquired");
        Ok(())
    }

    /// One current reading outside the acquisition loop.
    pub async fn read_current(&self) -> AppResult<f64> {
        let kind = Some(InstrumentKind::Picoammeter);
        let query = self.picoammeter.codec().encode_query(QueryField::Current);
        let value = self.report(kind, self.picoammeter.execute(query).await)?;
        let current = value
            .and_then(|v| v.as_f64())
            .ok_or_else(|| DecodeError::Malformed("missing current reading".to_string()));
        self.report(kind, current)
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    /// Start polling, at the configured rate unless `period` is given.
    pub fn start_acquisition(&self, period: Option<Duration>) -> AppResult<Duration> {
        let period = period.unwrap_or_else(|| self.settings.sample_period());
        self.report(None, self.scheduler.start(period))
    }

    /// Stop polling after the in-flight tick.
    pub async fn stop_acquisition(&self) {
        self.scheduler.stop().await;
    }

    /// Stop acquisition, switch HV off and release both instruments.
    pub async fn shutdown(&self) {
        info!("Station shutting down");
        self.scheduler.stop().await;
        self.disconnect_power_supply().await;
        self.disconnect_picoammeter().await;
    }
}
