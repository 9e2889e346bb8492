//! Acquisition scheduling against slow and misbehaving instruments.

use hv_daq::{
    acquisition::{AcquisitionScheduler, AcquisitionState, SchedulerConfig},
    bus::SampleBus,
    config::SafetySettings,
    events::{BusMessage, EventKind, InstrumentKind, SafetyState},
    safety::SafetyInterlock,
    session::{InstrumentSession, SessionConfig},
    transport::MockTransport,
};
use std::time::Duration;

struct Rig {
    bus: SampleBus,
    interlock: SafetyInterlock,
    scheduler: AcquisitionScheduler,
    pico_mock: MockTransport,
    supply_mock: MockTransport,
}

async fn rig(pico_latency: Duration, connect_supply: bool, config: SchedulerConfig) -> Rig {
    let bus = SampleBus::new(1024);
    let interlock = SafetyInterlock::new(&SafetySettings::default(), bus.clone());
    let pico = InstrumentSession::new(SessionConfig::picoammeter(), bus.clone());
    let supply = InstrumentSession::new(SessionConfig::power_supply(), bus.clone());
    interlock.attach_output(&supply);

    let pico_mock = MockTransport::picoammeter().with_latency(pico_latency);
    pico.connect(Box::new(pico_mock.clone()))
        .await
        .expect("Failed to connect picoammeter");
    let supply_mock = MockTransport::power_supply();
    if connect_supply {
        supply
            .connect(Box::new(supply_mock.clone()))
            .await
            .expect("Failed to connect supply");
    }
    pico_mock.clear_log();
    supply_mock.clear_log();

    let scheduler = AcquisitionScheduler::new(pico, supply, interlock.clone(), bus.clone(), config);
    Rig {
        bus,
        interlock,
        scheduler,
        pico_mock,
        supply_mock,
    }
}

fn count(written: &[String], command: &str) -> u64 {
    written.iter().filter(|c| c.as_str() == command).count() as u64
}

#[tokio::test(start_paused = true)]
async fn test_slow_instrument_skips_ticks_instead_of_queueing() {
    let rig = rig(
        Duration::from_millis(500),
        false,
        SchedulerConfig::default(),
    )
    .await;

    rig.scheduler
        .start(Duration::from_millis(100))
        .expect("start");
    tokio::time::sleep(Duration::from_secs(5)).await;
    rig.scheduler.stop().await;

    let stats = rig.scheduler.stats();
    // Each tick is bounded by the 500 ms reply, so about ten complete.
    assert!(
        (8..=12).contains(&stats.ticks_completed),
        "completed {}",
        stats.ticks_completed
    );
    assert!(stats.ticks_skipped >= 25, "skipped {}", stats.ticks_skipped);
    assert_eq!(stats.ticks_failed, 0);

    // Never more than one READ? in flight: every write belongs to a finished tick.
    assert_eq!(count(&rig.pico_mock.written(), "READ?"), stats.ticks_completed);
}

#[tokio::test(start_paused = true)]
async fn test_reading_decoded_and_error_reply_reported() {
    let rig = rig(Duration::ZERO, true, SchedulerConfig::default()).await;
    let mut consumer = rig.bus.subscribe("test");

    rig.pico_mock.script_reply("READ?", "2.500000E-09");
    rig.pico_mock.script_reply("READ?", "ERROR");
    rig.scheduler.start(Duration::from_millis(200)).expect("start");
    tokio::time::sleep(Duration::from_millis(300)).await;
    rig.scheduler.stop().await;

    let messages = consumer.drain();
    let samples: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            BusMessage::Sample(s) => Some(s.clone()),
            BusMessage::Event(_) => None,
        })
        .collect();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].current, Some(2.5e-9));
    assert_eq!(samples[1].current, None);
    // The supply is off, so its output reads zero.
    assert_eq!(samples[0].voltage, Some(0.0));

    let decode = messages.iter().find_map(|m| match m {
        BusMessage::Event(e) if e.kind == EventKind::Decode => Some(e.clone()),
        _ => None,
    });
    let decode = decode.expect("no decode event");
    assert_eq!(decode.instrument, Some(InstrumentKind::Picoammeter));
    assert!(decode.message.contains("ERROR"));

    // The bad tick still completed on schedule.
    let gap = samples[1]
        .timestamp
        .monotonic
        .duration_since(samples[0].timestamp.monotonic);
    assert_eq!(gap, Duration::from_millis(200));
    assert_eq!(rig.scheduler.stats().ticks_failed, 1);
    assert_eq!(count(&rig.supply_mock.written(), "VOUT?"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_hung_picoammeter_faults_acquisition_and_interlock() {
    let config = SchedulerConfig {
        failure_threshold: 3,
        read_timeout: Duration::from_millis(50),
    };
    let rig = rig(Duration::ZERO, true, config).await;
    rig.interlock.set_limits(100.0, 1e-6).expect("limits");
    rig.interlock.arm().expect("arm");
    rig.interlock.enable_output().await.expect("enable");
    assert!(rig.supply_mock.hv_on());

    rig.pico_mock.hang_on("READ?");
    rig.scheduler.start(Duration::from_millis(100)).expect("start");

    let mut state = rig.scheduler.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == AcquisitionState::Faulted),
    )
    .await
    .expect("scheduler never faulted")
    .expect("watch closed");

    // Let the interlock finish its HVOF.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(rig.interlock.state(), SafetyState::Fault);
    assert!(!rig.supply_mock.hv_on());
    assert!(!rig.scheduler.is_running());
}
