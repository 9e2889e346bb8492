//! Full operator flows through `Station` with simulated instruments.

use hv_daq::{
    config::Settings,
    events::{BusMessage, EventKind, InstrumentKind, SafetyState},
    safety::FaultPolicy,
    transport::MockTransport,
    Station,
};
use std::time::Duration;

async fn connected(settings: Settings) -> (Station, MockTransport, MockTransport) {
    let station = Station::new(settings);
    let supply = MockTransport::power_supply();
    let pico = MockTransport::picoammeter();
    pico.set_current(1.25e-9);
    station
        .connect_power_supply(Box::new(supply.clone()))
        .await
        .expect("Failed to connect supply");
    station
        .connect_picoammeter(Box::new(pico.clone()))
        .await
        .expect("Failed to connect picoammeter");
    (station, supply, pico)
}

fn event_kinds(messages: &[BusMessage]) -> Vec<EventKind> {
    messages
        .iter()
        .filter_map(|m| match m {
            BusMessage::Event(e) => Some(e.kind),
            BusMessage::Sample(_) => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_timed_run_with_acquisition() {
    let (station, supply, _pico) = connected(Settings::default()).await;
    let mut consumer = station.subscribe("flow");

    station.set_limits(500.0, 1e-6).await.expect("limits");
    station.arm().expect("arm");
    station.set_voltage(250.0).await.expect("voltage");
    station
        .enable_hv_for(Duration::from_secs(3))
        .await
        .expect("enable");
    station.start_acquisition(None).expect("start");

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(supply.hv_on());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!supply.hv_on());
    assert_eq!(station.interlock().state(), SafetyState::Armed);
    station.stop_acquisition().await;

    let messages = consumer.drain();
    let samples: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            BusMessage::Sample(s) => Some(s.clone()),
            BusMessage::Event(_) => None,
        })
        .collect();
    assert!(samples.len() >= 4, "only {} samples", samples.len());
    assert!(samples.iter().all(|s| s.current == Some(1.25e-9)));
    assert!(samples.iter().any(|s| s.voltage == Some(250.0)));
    assert_eq!(samples.last().and_then(|s| s.voltage), Some(0.0));

    let output_events: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            BusMessage::Event(e) if e.kind == EventKind::Output => Some(e.message.clone()),
            _ => None,
        })
        .collect();
    assert!(output_events.iter().any(|m| m.contains("HV timer expired")));
}

#[tokio::test]
async fn test_emergency_stop_cancels_timer_and_reports() {
    let (station, supply, _pico) = connected(Settings::default()).await;
    let mut consumer = station.subscribe("flow");

    station.set_limits(100.0, 1e-6).await.expect("limits");
    station.arm().expect("arm");
    station
        .enable_hv_for(Duration::from_secs(600))
        .await
        .expect("enable");
    station.emergency_stop("operator").await;

    assert!(!supply.hv_on());
    assert!(!station.cancel_hv_timer());
    assert!(station.enable_hv().await.is_err());
    station.reset("operator").expect("reset");
    assert_eq!(station.interlock().state(), SafetyState::Idle);

    let kinds = event_kinds(&consumer.drain());
    assert!(kinds.contains(&EventKind::EmergencyStop));
    assert!(kinds.contains(&EventKind::Error));
    assert!(kinds.contains(&EventKind::Reset));
}

#[tokio::test]
async fn test_shutdown_leaves_instruments_local_and_safe() {
    let (station, supply, pico) = connected(Settings::default()).await;
    station.set_limits(100.0, 1e-6).await.expect("limits");
    station.arm().expect("arm");
    station.enable_hv().await.expect("enable");
    station.start_acquisition(None).expect("start");

    station.shutdown().await;
    assert!(!supply.hv_on());
    assert!(supply.is_closed());
    assert!(pico.is_closed());
    assert!(!station.scheduler().is_running());

    let written = supply.written();
    let hvof = written.iter().rposition(|c| c == "HVOF").expect("no HVOF");
    let local = written.iter().rposition(|c| c == "SYST:LOC").expect("no SYST:LOC");
    assert!(hvof < local);
    assert!(pico.written().iter().any(|c| c == "SYST:LOC"));
}

#[tokio::test]
async fn test_auto_clear_policy_recovers_on_reconnect() {
    let mut settings = Settings::default();
    settings.safety.fault_policy = FaultPolicy::AutoClearOnReconnect;
    let (station, supply, _pico) = connected(settings).await;
    station.set_limits(100.0, 1e-6).await.expect("limits");

    supply.sever();
    assert!(station.set_voltage(10.0).await.is_err());
    assert_eq!(station.interlock().state(), SafetyState::Fault);

    station
        .connect_power_supply(Box::new(MockTransport::power_supply()))
        .await
        .expect("reconnect");
    assert_eq!(station.interlock().state(), SafetyState::Idle);
    station.arm().expect("arm after recovery");
}

#[tokio::test]
async fn test_picoammeter_settings_reach_instrument() {
    let (station, _supply, pico) = connected(Settings::default()).await;
    pico.clear_log();

    station.set_integration_time(10.0).await.expect("nplc");
    station.set_auto_zero(false).await.expect("azer");
    station.set_range(None).await.expect("auto range");
    assert!(station.set_integration_time(100.0).await.is_err());

    assert_eq!(
        pico.written(),
        vec!["CURR:NPLC 10", "SYST:AZER OFF", "CURR:RANG:AUTO ON"]
    );
    assert!((station.read_current().await.expect("read") - 1.25e-9).abs() < 1e-18);
    assert!(station
        .session(InstrumentKind::Picoammeter)
        .identity()
        .is_some_and(|idn| idn.contains("6485")));
}
