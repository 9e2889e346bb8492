//! hv_daq command-line front end.
//!
//! `simulate` drives the whole station against simulated instruments,
//! `config` prints the effective configuration and `run` (feature
//! `instrument_visa`) talks to real GPIB hardware.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use hv_daq::events::BusMessage;
use hv_daq::export::CsvRecorder;
use hv_daq::transport::MockTransport;
use hv_daq::{Settings, Station};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// High-voltage supply and picoammeter controller
#[derive(Parser)]
#[command(name = "hv_daq")]
#[command(about = "HV supply and picoammeter control over GPIB/SCPI", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs and console output as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the station against simulated instruments
    Simulate {
        /// How long to acquire, in seconds
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,

        /// Output voltage to apply
        #[arg(short, long, default_value_t = 100.0)]
        voltage: f64,

        /// Simulated reply latency in milliseconds
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,

        /// Record samples to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config,

    /// Stream samples from real instruments until Ctrl-C
    #[cfg(feature = "instrument_visa")]
    Run {
        /// Record samples to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings =
        Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&settings.application.log_level, cli.json);

    match cli.command {
        Commands::Config => {
            print!("{}", settings.to_toml().context("Failed to render configuration")?);
            Ok(())
        }
        Commands::Simulate {
            seconds,
            voltage,
            latency_ms,
            csv,
        } => simulate(
            settings,
            cli.json,
            Duration::from_secs(seconds),
            voltage,
            latency_ms,
            csv,
        )
        .await,
        #[cfg(feature = "instrument_visa")]
        Commands::Run { csv } => run_hardware(settings, cli.json, csv).await,
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn spawn_recorder(
    station: &Station,
    csv: Option<PathBuf>,
) -> Result<Option<tokio::task::JoinHandle<Result<u64>>>> {
    let Some(path) = csv else {
        return Ok(None);
    };
    let recorder = CsvRecorder::create(&path)?;
    Ok(Some(tokio::spawn(recorder.run(station.subscribe("csv")))))
}

async fn finish_recorder(handle: Option<tokio::task::JoinHandle<Result<u64>>>) -> Result<()> {
    if let Some(handle) = handle {
        let rows = handle.await.context("CSV recorder task panicked")??;
        info!(rows, "CSV recording complete");
    }
    Ok(())
}

fn print_message(message: &BusMessage, json: bool) {
    if json {
        let line = match message {
            BusMessage::Sample(sample) => serde_json::json!({
                "timestamp": sample.timestamp.wall,
                "current_a": sample.current,
                "voltage_v": sample.voltage,
            }),
            BusMessage::Event(event) => serde_json::json!({ "event": event }),
        };
        println!("{}", line);
        return;
    }
    match message {
        BusMessage::Sample(sample) => println!(
            "{}  I = {}  V = {}",
            sample.timestamp.wall.format("%H:%M:%S%.3f"),
            sample
                .current
                .map_or_else(|| "-".to_string(), |a| format!("{:.4E} A", a)),
            sample
                .voltage
                .map_or_else(|| "-".to_string(), |v| format!("{:.1} V", v)),
        ),
        BusMessage::Event(event) => println!("{}", event),
    }
}

async fn simulate(
    settings: Settings,
    json: bool,
    duration: Duration,
    voltage: f64,
    latency_ms: u64,
    csv: Option<PathBuf>,
) -> Result<()> {
    let latency = Duration::from_millis(latency_ms);
    let station = Station::new(settings);
    let mut printer = Box::pin(station.subscribe("console").into_stream());
    let recorder = spawn_recorder(&station, csv)?;

    let supply = MockTransport::power_supply().with_latency(latency);
    let pico = MockTransport::picoammeter().with_latency(latency);
    pico.set_current(2.5e-9);

    station
        .connect_power_supply(Box::new(supply))
        .await
        .context("Failed to connect simulated power supply")?;
    station
        .connect_picoammeter(Box::new(pico))
        .await
        .context("Failed to connect simulated picoammeter")?;

    let max = &station.settings().safety;
    station
        .set_limits(voltage.max(1.0), max.max_current)
        .await
        .context("Failed to set limits")?;
    station.arm()?;
    station.set_voltage(voltage).await?;
    station.enable_hv().await.context("Failed to enable HV")?;
    let period = station.start_acquisition(None)?;
    info!(?period, ?duration, "Simulation running");

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            message = printer.next() => match message {
                Some(message) => print_message(&message, json),
                None => break,
            },
        }
    }

    if let Err(e) = station.disable_hv().await {
        tracing::warn!(error = %e, "HV was not enabled at the end of the simulation");
    }
    station.shutdown().await;
    station.bus().close();
    finish_recorder(recorder).await?;

    let stats = station.scheduler().stats();
    println!(
        "ticks completed: {}, skipped: {}, failed: {}",
        stats.ticks_completed, stats.ticks_skipped, stats.ticks_failed
    );
    Ok(())
}

#[cfg(feature = "instrument_visa")]
async fn run_hardware(settings: Settings, json: bool, csv: Option<PathBuf>) -> Result<()> {
    use hv_daq::transport::VisaTransport;

    let ps = settings.power_supply.clone();
    let pa = settings.picoammeter.clone();
    let station = Station::new(settings);
    let mut printer = Box::pin(station.subscribe("console").into_stream());
    let recorder = spawn_recorder(&station, csv)?;

    let supply = VisaTransport::open(ps.board, ps.address, ps.timeout)
        .await
        .with_context(|| format!("Failed to open power supply at GPIB address {}", ps.address))?;
    station
        .connect_power_supply(Box::new(supply))
        .await
        .context("Failed to connect power supply")?;
    let pico = VisaTransport::open(pa.board, pa.address, pa.timeout)
        .await
        .with_context(|| format!("Failed to open picoammeter at GPIB address {}", pa.address))?;
    station
        .connect_picoammeter(Box::new(pico))
        .await
        .context("Failed to connect picoammeter")?;

    station.start_acquisition(None)?;
    info!("Streaming samples, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = printer.next() => match message {
                Some(message) => print_message(&message, json),
                None => break,
            },
        }
    }

    info!("Ctrl-C received, switching HV off");
    let _ = station.disable_hv().await;
    station.shutdown().await;
    station.bus().close();
    finish_recorder(recorder).await
}
