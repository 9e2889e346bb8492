//! Export rows and the CSV recorder consumer.
//!
//! [`ExportRow`] is the column contract for exported samples:
//! `Time (s), Current (A), Voltage (V), Timestamp`. Missing readings export
//! as empty cells.

use crate::events::Sample;
use serde::Serialize;
use tokio::time::Instant;

/// Column headers, in order.
pub const EXPORT_HEADERS: [&str; 4] = ["Time (s)", "Current (A)", "Voltage (V)", "Timestamp"];

/// One exported sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    /// Seconds since the recording origin.
    #[serde(rename = "Time (s)")]
    pub time_s: f64,
    /// Picoammeter reading.
    #[serde(rename = "Current (A)")]
    pub current_a: Option<f64>,
    /// Supply output voltage.
    #[serde(rename = "Voltage (V)")]
    pub voltage_v: Option<f64>,
    /// Wall-clock time, `YYYY-MM-DD HH:MM:SS.mmm` UTC.
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

impl ExportRow {
    /// Row for `sample`, timed relative to `origin`.
    pub fn from_sample(sample: &Sample, origin: Instant) -> Self {
        Self {
            time_s: sample
                .timestamp
                .monotonic
                .saturating_duration_since(origin)
                .as_secs_f64(),
            current_a: sample.current,
            voltage_v: sample.voltage,
            timestamp: sample
                .timestamp
                .wall
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string(),
        }
    }
}

// ============================================================================
// CSV Recorder
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use crate::bus::ConsumerHandle;
    use crate::events::BusMessage;
    use anyhow::{Context, Result};
    use std::fs::File;
    use std::path::{Path, PathBuf};

    /// Writes every sample from a bus subscription to a CSV file.
    pub struct CsvRecorder {
        path: PathBuf,
        writer: csv::Writer<File>,
        origin: Option<Instant>,
        rows: u64,
    }

    impl CsvRecorder {
        /// Create (or truncate) `path`, creating parent directories.
        pub fn create(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref().to_path_buf();
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create export directory at {:?}", parent)
                })?;
            }
            let file = File::create(&path)
                .with_context(|| format!("Failed to create CSV file at {:?}", path))?;
            tracing::info!(path = %path.display(), "CSV recorder created");
            Ok(Self {
                path,
                writer: csv::Writer::from_writer(file),
                origin: None,
                rows: 0,
            })
        }

        /// Output file.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Rows written so far.
        pub fn rows_written(&self) -> u64 {
            self.rows
        }

        /// Append one sample. The first sample recorded fixes time zero.
        pub fn record(&mut self, sample: &Sample) -> Result<()> {
            let origin = *self.origin.get_or_insert(sample.timestamp.monotonic);
            self.writer
                .serialize(ExportRow::from_sample(sample, origin))
                .context("Failed to write sample to CSV file")?;
            self.rows += 1;
            Ok(())
        }

        /// Flush and close, returning the row count.
        pub fn finish(mut self) -> Result<u64> {
            self.writer.flush().context("Failed to flush CSV writer")?;
            tracing::info!(path = %self.path.display(), rows = self.rows, "CSV recorder closed");
            Ok(self.rows)
        }

        /// Record samples from `consumer` until its stream ends.
        pub async fn run(mut self, mut consumer: ConsumerHandle) -> Result<u64> {
            while let Some(message) = consumer.recv().await {
                match message {
                    BusMessage::Sample(sample) => {
                        self.record(&sample)?;
                        if self.rows % 10 == 0 {
                            self.writer.flush().context("Failed to flush CSV writer")?;
                        }
                    }
                    BusMessage::Event(event) => {
                        tracing::debug!(event = %event, "CSV recorder skipping event");
                    }
                }
            }
            self.finish()
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use crate::bus::ConsumerHandle;
    use crate::error::DaqError;
    use std::path::Path;

    /// Placeholder when the `storage_csv` feature is disabled.
    pub struct CsvRecorder;

    impl CsvRecorder {
        /// Always fails: CSV support is compiled out.
        pub fn create(_path: impl AsRef<Path>) -> anyhow::Result<Self> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        /// Never reached, since `create` always fails.
        pub async fn run(self, _consumer: ConsumerHandle) -> anyhow::Result<u64> {
            Ok(0)
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvRecorder;
#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvRecorder;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Timestamp;
    use std::time::Duration;

    fn sample_at(offset: Duration, current: Option<f64>, voltage: Option<f64>) -> (Sample, Instant) {
        let now = Timestamp::now();
        let origin = now.monotonic;
        let sample = Sample {
            timestamp: Timestamp {
                monotonic: origin + offset,
                wall: now.wall,
            },
            voltage,
            current,
        };
        (sample, origin)
    }

    #[test]
    fn test_row_from_sample() {
        let (sample, origin) = sample_at(Duration::from_millis(1500), Some(2.5e-9), None);
        let row = ExportRow::from_sample(&sample, origin);
        assert!((row.time_s - 1.5).abs() < 1e-9);
        assert_eq!(row.current_a, Some(2.5e-9));
        assert_eq!(row.voltage_v, None);
        assert_eq!(row.timestamp.len(), "2024-01-01 00:00:00.000".len());
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_csv_headers_and_empty_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run.csv");
        let mut recorder = CsvRecorder::create(&path).unwrap();

        let (first, _) = sample_at(Duration::ZERO, Some(1e-9), Some(100.0));
        let (second, _) = sample_at(Duration::ZERO, None, Some(100.0));
        recorder.record(&first).unwrap();
        recorder.record(&second).unwrap();
        assert_eq!(recorder.finish().unwrap(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(EXPORT_HEADERS.join(",").as_str()));
        let first_row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(first_row[1].parse::<f64>().unwrap(), 1e-9);
        assert_eq!(first_row[2].parse::<f64>().unwrap(), 100.0);
        let second_row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(second_row[1], "");
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn test_recorder_consumes_bus() {
        use crate::bus::SampleBus;
        use crate::events::{Event, EventKind};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.csv");
        let bus = SampleBus::new(16);
        let recorder = CsvRecorder::create(&path).unwrap();
        let task = tokio::spawn(recorder.run(bus.subscribe("csv")));

        for i in 0..3 {
            let (sample, _) = sample_at(Duration::from_secs(i), Some(1e-9), None);
            bus.publish(sample);
        }
        bus.publish(Event::new(EventKind::Reset, None, "ignored"));
        bus.close();

        assert_eq!(task.await.unwrap().unwrap(), 3);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 4);
    }
}
