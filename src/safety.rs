//! Process-wide safety interlock for the high-voltage output.
//!
//! ```text
//!            set_limits + arm          enable
//!    Idle ───────────────────→ Armed ─────────→ Enabled
//!     ↑                          ↑    disable      │
//!     │ reset / clear_fault      └─────────────────┘
//!     │
//!   Fault ←── trip_fault (any state)    EmergencyStopped ←── emergency_stop (any state)
//! ```
//!
//! All state lives behind one mutex. No lock is held across I/O: transitions
//! happen first, then the best-effort `HVOF` goes out on the supply session's
//! priority path, bounded by the emergency timeout. `EmergencyStopped` only
//! leaves through an audited [`SafetyInterlock::reset`].
//!
//! The interlock is also the supply session's [`HvGate`]: the session asks it
//! right before writing `HVON`, so a stop that lands while an enable is queued
//! always wins.

use crate::bus::SampleBus;
use crate::codec::{Action, CommandCodec};
use crate::config::SafetySettings;
use crate::error::{ExecError, InvalidArgument, SafetyError};
use crate::events::{Event, EventKind, InstrumentKind, SafetyState};
use crate::session::{HvGate, InstrumentSession};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Whether a successful supply reconnect clears `Fault`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// `Fault -> Idle` as soon as the supply session reconnects.
    AutoClearOnReconnect,
    /// `Fault` persists until [`SafetyInterlock::clear_fault`].
    RequireOperatorClear,
}

/// Validated output limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Limits {
    /// Volts.
    pub voltage_limit: f64,
    /// Amperes.
    pub current_limit: f64,
}

/// One recorded operator or automatic action on the interlock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Who triggered it.
    pub actor: String,
    /// What was done (`reset`, `emergency_stop`, `clear_fault`, ...).
    pub action: String,
    /// State before.
    pub from: SafetyState,
    /// State after.
    pub to: SafetyState,
}

struct Core {
    state: SafetyState,
    limits: Option<Limits>,
}

struct Inner {
    core: Mutex<Core>,
    state_tx: watch::Sender<SafetyState>,
    output: Mutex<Option<InstrumentSession>>,
    audit: Mutex<Vec<AuditEntry>>,
    bus: SampleBus,
    max_voltage: f64,
    max_current: f64,
    emergency_timeout: Duration,
    policy: FaultPolicy,
}

impl Inner {
    fn transition(&self, core: &mut Core, to: SafetyState, cause: &str) -> SafetyState {
        let from = core.state;
        core.state = to;
        self.state_tx.send_replace(to);
        info!(from = %from, to = %to, cause = %cause, "Interlock transition");
        from
    }

    fn record(&self, actor: &str, action: &str, from: SafetyState, to: SafetyState) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            from,
            to,
        };
        info!(actor = %actor, action = %action, from = %from, to = %to, "Interlock audit");
        self.audit.lock().push(entry);
    }

    fn reject(&self, operation: &'static str, err: SafetyError) -> SafetyError {
        warn!(operation = operation, error = %err, "Interlock refused transition");
        err
    }

    fn output(&self) -> Option<InstrumentSession> {
        self.output.lock().clone()
    }

    fn abandon_enables(&self) {
        if let Some(output) = self.output() {
            output.abandon_hv_enables();
        }
    }

    /// Force `Fault` unless emergency-stopped. Returns the previous state.
    fn enter_fault(&self, reason: &str) -> SafetyState {
        let from = {
            let mut core = self.core.lock();
            if core.state == SafetyState::EmergencyStopped {
                core.state
            } else {
                self.transition(&mut core, SafetyState::Fault, reason)
            }
        };
        self.abandon_enables();
        error!(reason = %reason, from = %from, "Interlock fault");
        self.bus.publish(Event::new(
            EventKind::Fault,
            Some(InstrumentKind::PowerSupply),
            format!("interlock fault: {}", reason),
        ));
        from
    }

    async fn hv_off_best_effort(&self, context: &str) {
        let Some(output) = self.output() else {
            warn!(context = %context, "No supply session attached, HVOF not sent");
            return;
        };
        let hvof = match CommandCodec::new(self.emergency_timeout)
            .encode_action(Action::DisableHighVoltage)
        {
            Ok(command) => command,
            Err(e) => {
                error!(error = %e, "Cannot encode HVOF");
                return;
            }
        };
        let outcome =
            tokio::time::timeout(self.emergency_timeout, output.execute_priority(hvof)).await;
        let failure = match outcome {
            Ok(Ok(_)) => {
                info!(context = %context, "HVOF sent");
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => ExecError::Timeout(self.emergency_timeout),
        };
        // Shutdown paths report and carry on.
        warn!(context = %context, error = %failure, "Best-effort HVOF failed");
        self.bus.publish(Event::new(
            EventKind::Error,
            Some(InstrumentKind::PowerSupply),
            format!("HVOF during {} failed: {}", context, failure),
        ));
    }
}

impl HvGate for Inner {
    fn permit_hv_on(&self) -> bool {
        let core = self.core.lock();
        core.state == SafetyState::Enabled && core.limits.is_some()
    }

    fn session_faulted(&self, reason: &str) {
        self.enter_fault(reason);
    }

    fn session_recovered(&self) {
        if self.policy != FaultPolicy::AutoClearOnReconnect {
            return;
        }
        let cleared = {
            let mut core = self.core.lock();
            if core.state == SafetyState::Fault {
                Some(self.transition(&mut core, SafetyState::Idle, "supply reconnected"))
            } else {
                None
            }
        };
        if let Some(from) = cleared {
            self.record("auto", "fault_auto_cleared", from, SafetyState::Idle);
            self.bus.publish(Event::new(
                EventKind::Reset,
                Some(InstrumentKind::PowerSupply),
                "fault cleared on reconnect",
            ));
        }
    }
}

/// Shared handle to the interlock. Clones refer to the same state machine.
#[derive(Clone)]
pub struct SafetyInterlock {
    inner: Arc<Inner>,
}

impl SafetyInterlock {
    /// Idle interlock without limits.
    pub fn new(settings: &SafetySettings, bus: SampleBus) -> Self {
        let (state_tx, _) = watch::channel(SafetyState::Idle);
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state: SafetyState::Idle,
                    limits: None,
                }),
                state_tx,
                output: Mutex::new(None),
                audit: Mutex::new(Vec::new()),
                bus,
                max_voltage: settings.max_voltage,
                max_current: settings.max_current,
                emergency_timeout: settings.emergency_timeout,
                policy: settings.fault_policy,
            }),
        }
    }

    /// Gate `session`'s `HVON` traffic and send shutdown `HVOF` through it.
    pub fn attach_output(&self, session: &InstrumentSession) {
        let gate: Weak<dyn HvGate> = Arc::downgrade(&self.inner) as Weak<dyn HvGate>;
        session.attach_interlock(gate);
        *self.inner.output.lock() = Some(session.clone());
    }

    /// Display snapshot. Never gate a write on it.
    pub fn state(&self) -> SafetyState {
        self.inner.core.lock().state
    }

    /// Receiver notified on every transition.
    pub fn watch(&self) -> watch::Receiver<SafetyState> {
        self.inner.state_tx.subscribe()
    }

    /// Current limits, if set.
    pub fn limits(&self) -> Option<Limits> {
        self.inner.core.lock().limits
    }

    /// Fault-clear policy in force.
    pub fn fault_policy(&self) -> FaultPolicy {
        self.inner.policy
    }

    /// Audited actions so far, oldest first.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.inner.audit.lock().clone()
    }

    /// Validate and store limits. Allowed in `Idle` and `Armed`; an armed
    /// interlock stays armed with the new limits.
    ///
    /// # Errors
    ///
    /// [`SafetyError::InvalidArgument`] for non-finite, non-positive or
    /// over-range values; [`SafetyError::InvalidTransition`] in other states.
    /// The state is unchanged on error.
    pub fn set_limits(&self, voltage_limit: f64, current_limit: f64) -> Result<(), SafetyError> {
        check_limit("voltage limit", voltage_limit, self.inner.max_voltage)
            .and_then(|()| check_limit("current limit", current_limit, self.inner.max_current))
            .map_err(|e| self.inner.reject("set_limits", e.into()))?;

        let mut core = self.inner.core.lock();
        match core.state {
            SafetyState::Idle | SafetyState::Armed => {
                core.limits = Some(Limits {
                    voltage_limit,
                    current_limit,
                });
                info!(
                    voltage_limit,
                    current_limit,
                    state = %core.state,
                    "Interlock limits set"
                );
                Ok(())
            }
            state => Err(self.inner.reject(
                "set_limits",
                SafetyError::InvalidTransition {
                    operation: "set_limits",
                    state,
                },
            )),
        }
    }

    /// `Idle -> Armed`.
    pub fn arm(&self) -> Result<(), SafetyError> {
        let mut core = self.inner.core.lock();
        match core.state {
            SafetyState::Idle if core.limits.is_none() => {
                Err(self.inner.reject("arm", SafetyError::LimitsNotSet))
            }
            SafetyState::Idle => {
                self.inner.transition(&mut core, SafetyState::Armed, "arm");
                Ok(())
            }
            state => Err(self.inner.reject(
                "arm",
                SafetyError::InvalidTransition {
                    operation: "arm",
                    state,
                },
            )),
        }
    }

    /// `Armed -> Enabled`. `HVON` may only be sent after this succeeds.
    pub fn enable(&self) -> Result<(), SafetyError> {
        let mut core = self.inner.core.lock();
        match core.state {
            SafetyState::Armed if core.limits.is_some() => {
                self.inner.transition(&mut core, SafetyState::Enabled, "enable");
                Ok(())
            }
            SafetyState::Enabled => Err(self.inner.reject("enable", SafetyError::AlreadyEnabled)),
            _ => Err(self.inner.reject("enable", SafetyError::NotArmed)),
        }
    }

    /// [`enable`](Self::enable), then send `HVON` to the attached supply.
    ///
    /// If `HVON` could not be written and the interlock is still `Enabled`, it
    /// falls back to `Armed`.
    pub async fn enable_output(&self) -> Result<(), crate::error::DaqError> {
        let output = self
            .inner
            .output()
            .ok_or(ExecError::NotConnected(crate::events::ConnectionState::Disconnected))?;
        let hvon = output.codec().encode_action(Action::EnableHighVoltage)?;

        self.enable()?;
        match output.execute(hvon).await {
            Ok(_) => {
                self.inner.bus.publish(Event::new(
                    EventKind::Output,
                    Some(InstrumentKind::PowerSupply),
                    "high voltage on",
                ));
                Ok(())
            }
            Err(err) => {
                let mut core = self.inner.core.lock();
                if core.state == SafetyState::Enabled {
                    self.inner
                        .transition(&mut core, SafetyState::Armed, "HVON not sent");
                }
                Err(err.into())
            }
        }
    }

    /// Send `HVOF`, then `Enabled -> Armed`. Limits stay set.
    ///
    /// `HVOF` goes out whatever the state; the transition does not wait for
    /// the instrument to confirm.
    pub async fn disable(&self) -> Result<(), SafetyError> {
        self.inner.abandon_enables();
        self.inner.hv_off_best_effort("disable").await;

        let mut core = self.inner.core.lock();
        if core.state == SafetyState::Enabled {
            self.inner.transition(&mut core, SafetyState::Armed, "disable");
            drop(core);
            self.inner.bus.publish(Event::new(
                EventKind::Output,
                Some(InstrumentKind::PowerSupply),
                "high voltage off",
            ));
            Ok(())
        } else {
            drop(core);
            Err(self.inner.reject("disable", SafetyError::NotEnabled))
        }
    }

    /// Force `Fault` from any state and send `HVOF` best-effort.
    ///
    /// An emergency-stopped interlock stays emergency-stopped.
    pub async fn trip_fault(&self, reason: &str) {
        self.inner.enter_fault(reason);
        self.inner.hv_off_best_effort("fault").await;
    }

    /// Stop high voltage now, from any state.
    ///
    /// The transition happens under the interlock lock before any I/O, so a
    /// concurrent `HVON` is refused at dispatch. Queued `HVON` commands are
    /// discarded and `HVOF` overtakes queued traffic on the supply session.
    pub async fn emergency_stop(&self, actor: &str) {
        let from = {
            let mut core = self.inner.core.lock();
            self.inner
                .transition(&mut core, SafetyState::EmergencyStopped, "emergency stop")
        };
        self.inner.abandon_enables();
        self.inner
            .record(actor, "emergency_stop", from, SafetyState::EmergencyStopped);
        error!(actor = %actor, from = %from, "EMERGENCY STOP");
        self.inner.bus.publish(Event::new(
            EventKind::EmergencyStop,
            Some(InstrumentKind::PowerSupply),
            format!("emergency stop by {}", actor),
        ));
        self.inner.hv_off_best_effort("emergency stop").await;
    }

    /// `EmergencyStopped -> Idle`, audited.
    pub fn reset(&self, actor: &str) -> Result<(), SafetyError> {
        let from = {
            let mut core = self.inner.core.lock();
            match core.state {
                SafetyState::EmergencyStopped => {
                    self.inner.transition(&mut core, SafetyState::Idle, "reset")
                }
                state => {
                    return Err(self.inner.reject(
                        "reset",
                        SafetyError::InvalidTransition {
                            operation: "reset",
                            state,
                        },
                    ))
                }
            }
        };
        self.inner.record(actor, "reset", from, SafetyState::Idle);
        self.inner.bus.publish(Event::new(
            EventKind::Reset,
            Some(InstrumentKind::PowerSupply),
            format!("interlock reset by {}", actor),
        ));
        Ok(())
    }

    /// `Fault -> Idle`, audited.
    pub fn clear_fault(&self, actor: &str) -> Result<(), SafetyError> {
        let from = {
            let mut core = self.inner.core.lock();
            match core.state {
                SafetyState::Fault => {
                    self.inner
                        .transition(&mut core, SafetyState::Idle, "clear fault")
                }
                state => {
                    return Err(self.inner.reject(
                        "clear_fault",
                        SafetyError::InvalidTransition {
                            operation: "clear_fault",
                            state,
                        },
                    ))
                }
            }
        };
        self.inner.record(actor, "clear_fault", from, SafetyState::Idle);
        self.inner.bus.publish(Event::new(
            EventKind::Reset,
            Some(InstrumentKind::PowerSupply),
            format!("fault cleared by {}", actor),
        ));
        Ok(())
    }
}

impl std::fmt::Debug for SafetyInterlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("SafetyInterlock")
            .field("state", &core.state)
            .field("limits", &core.limits)
            .finish()
    }
}

fn check_limit(name: &'static str, value: f64, max: f64) -> Result<(), InvalidArgument> {
    if !value.is_finite() {
        return Err(InvalidArgument::new(name, value, "must be finite"));
    }
    if value <= 0.0 {
        return Err(InvalidArgument::new(name, value, "must be positive"));
    }
    if value > max {
        return Err(InvalidArgument::new(
            name,
            value,
            format!("exceeds maximum {}", max),
        ));
    }
    Ok(())
}
