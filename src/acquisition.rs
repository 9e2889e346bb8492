//! Periodic acquisition of current and voltage readings.
//!
//! One task per run polls the picoammeter (`READ?`) and the supply (`VOUT?`)
//! concurrently, then publishes one [`Sample`] per tick. The tick work runs
//! inline in the task, so at most one read per instrument is ever in flight;
//! when a tick overruns its period the missed ticks are skipped, not queued.
//!
//! A failed read leaves its field `None` and publishes an event. Only
//! `failure_threshold` consecutive failed ticks stop acquisition and trip the
//! safety interlock.

use crate::bus::SampleBus;
use crate::codec::QueryField;
use crate::config::AcquisitionSettings;
use crate::error::{ExecError, SchedulerError};
use crate::events::{Event, EventKind, InstrumentKind, Sample, Timestamp};
use crate::safety::SafetyInterlock;
use crate::session::InstrumentSession;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Shortest supported period (10 Hz).
pub const MIN_PERIOD: Duration = Duration::from_millis(100);
/// Longest supported period (0.1 Hz).
pub const MAX_PERIOD: Duration = Duration::from_secs(10);

/// Clamp `period` to [`MIN_PERIOD`]..=[`MAX_PERIOD`].
pub fn clamp_period(period: Duration) -> Duration {
    period.clamp(MIN_PERIOD, MAX_PERIOD)
}

/// Lifecycle of the acquisition task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Not polling.
    Stopped,
    /// Polling.
    Running,
    /// Stopped after too many consecutive failed ticks.
    Faulted,
}

/// Tuning for the acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// Consecutive failed ticks that fault acquisition.
    pub failure_threshold: u32,
    /// Timeout applied to each periodic query.
    pub read_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            read_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&AcquisitionSettings> for SchedulerConfig {
    fn from(settings: &AcquisitionSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            read_timeout: settings.read_timeout,
        }
    }
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    /// Ticks whose sample was published.
    pub ticks_completed: u64,
    /// Ticks skipped because the previous one overran.
    pub ticks_skipped: u64,
    /// Ticks with at least one failed read.
    pub ticks_failed: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    picoammeter: InstrumentSession,
    supply: InstrumentSession,
    interlock: SafetyInterlock,
    bus: SampleBus,
    config: SchedulerConfig,
    state: watch::Sender<AcquisitionState>,
    counters: Counters,
    running: Mutex<Option<Running>>,
}

impl Inner {
    fn set_state(&self, next: AcquisitionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "Acquisition state changed");
        }
    }

    /// Run one tick. Returns `true` when every attempted read succeeded.
    async fn tick(&self) -> bool {
        let timestamp = Timestamp::now();
        let current_query = self
            .picoammeter
            .codec()
            .encode_query(QueryField::Current)
            .with_timeout(self.config.read_timeout);
        let voltage_query = self
            .supply
            .codec()
            .encode_query(QueryField::OutputVoltage)
            .with_timeout(self.config.read_timeout);

        let (current, voltage) = tokio::join!(
            self.picoammeter.execute(current_query),
            self.supply.execute(voltage_query)
        );

        let mut ok = true;
        let current = self.reading(InstrumentKind::Picoammeter, current, &mut ok);
        let voltage = match voltage {
            // An absent supply is not an acquisition failure.
            Err(ExecError::NotConnected(_)) => None,
            other => self.reading(InstrumentKind::PowerSupply, other, &mut ok),
        };

        self.bus.publish(Sample {
            timestamp,
            voltage,
            current,
        });
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    fn reading(
        &self,
        instrument: InstrumentKind,
        result: Result<Option<crate::codec::Value>, ExecError>,
        ok: &mut bool,
    ) -> Option<f64> {
        let err = match result {
            Ok(Some(value)) => match value.as_f64() {
                Some(v) => return Some(v),
                None => ExecError::Decode(crate::error::DecodeError::Malformed(format!(
                    "{:?}",
                    value
                ))),
            },
            Ok(None) => ExecError::Decode(crate::error::DecodeError::Malformed(String::new())),
            Err(err) => err,
        };
        *ok = false;
        let kind = match err {
            ExecError::Decode(_) => EventKind::Decode,
            _ => EventKind::Error,
        };
        warn!(instrument = %instrument, error = %err, "Acquisition read failed");
        self.bus
            .publish(Event::from_error(kind, Some(instrument), &err));
        None
    }

    async fn fault(&self, failures: u32) {
        self.set_state(AcquisitionState::Faulted);
        let reason = format!("{} consecutive acquisition failures", failures);
        error!(failures, "Acquisition faulted");
        self.bus.publish(Event::new(
            EventKind::Fault,
            Some(InstrumentKind::Picoammeter),
            reason.clone(),
        ));
        self.interlock.trip_fault(&reason).await;
    }
}

async fn run_loop(inner: Arc<Inner>, period: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut previous: Option<Instant> = None;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            scheduled = ticker.tick() => {
                if let Some(prev) = previous {
                    let gap = scheduled.duration_since(prev).as_nanos() / period.as_nanos().max(1);
                    if gap > 1 {
                        let skipped = u64::try_from(gap - 1).unwrap_or(u64::MAX);
                        inner.counters.skipped.fetch_add(skipped, Ordering::Relaxed);
                        debug!(skipped, "Acquisition tick overran its period");
                    }
                }
                previous = Some(scheduled);

                if inner.tick().await {
                    failures = 0;
                } else {
                    failures += 1;
                    if failures >= inner.config.failure_threshold {
                        inner.fault(failures).await;
                        return;
                    }
                }
            }
        }
    }
    debug!("Acquisition loop ended");
}

/// Periodic poller for the two instruments. Clones share one scheduler.
#[derive(Clone)]
pub struct AcquisitionScheduler {
    inner: Arc<Inner>,
}

impl AcquisitionScheduler {
    /// Scheduler reading from the two sessions and publishing to `bus`.
    pub fn new(
        picoammeter: InstrumentSession,
        supply: InstrumentSession,
        interlock: SafetyInterlock,
        bus: SampleBus,
        config: SchedulerConfig,
    ) -> Self {
        let (state, _) = watch::channel(AcquisitionState::Stopped);
        Self {
            inner: Arc::new(Inner {
                picoammeter,
                supply,
                interlock,
                bus,
                config,
                state,
                counters: Counters::default(),
                running: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AcquisitionState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on lifecycle changes.
    pub fn watch_state(&self) -> watch::Receiver<AcquisitionState> {
        self.inner.state.subscribe()
    }

    /// Whether the polling task is active.
    pub fn is_running(&self) -> bool {
        self.state() == AcquisitionState::Running
    }

    /// Counters since construction.
    pub fn stats(&self) -> AcquisitionStats {
        let c = &self.inner.counters;
        AcquisitionStats {
            ticks_completed: c.completed.load(Ordering::Relaxed),
            ticks_skipped: c.skipped.load(Ordering::Relaxed),
            ticks_failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// Start polling every `period`, clamped to 100 ms..=10 s. Returns the
    /// period in use.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::AlreadyRunning`] if a run is active (nothing changes)
    /// - [`SchedulerError::NotConnected`] if the picoammeter is not connected
    pub fn start(&self, period: Duration) -> Result<Duration, SchedulerError> {
        let mut running = self.inner.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(SchedulerError::AlreadyRunning);
        }
        if !self.inner.picoammeter.is_connected() {
            return Err(SchedulerError::NotConnected);
        }

        let period = clamp_period(period);
        let (stop_tx, stop_rx) = watch::channel(false);
        self.inner.set_state(AcquisitionState::Running);
        let handle = tokio::spawn(run_loop(self.inner.clone(), period, stop_rx));
        *running = Some(Running { stop_tx, handle });

        info!(period_ms = period.as_millis() as u64, "Acquisition started");
        self.inner.bus.publish(Event::new(
            EventKind::Acquisition,
            None,
            format!("acquisition started, period {:?}", period),
        ));
        Ok(period)
    }

    /// Stop polling. An in-flight tick completes first. Idempotent.
    pub async fn stop(&self) {
        let running = self.inner.running.lock().take();
        let Some(Running { stop_tx, handle }) = running else {
            return;
        };
        let _ = stop_tx.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "Acquisition task ended abnormally");
        }
        self.inner.set_state(AcquisitionState::Stopped);
        info!("Acquisition stopped");
        self.inner.bus.publish(Event::new(
            EventKind::Acquisition,
            None,
            "acquisition stopped",
        ));
    }
}
