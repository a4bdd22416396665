//! Run log written as CSV, one flushed row per entry.

use anyhow::{Context, Result};
use chemflow_experiment::{LogEntry, RunLogSink};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Column header of every run-log file.
pub const HEADER: [&str; 6] = ["Time_s", "Component", "Action", "Parameters", "Output", "Notes"];

/// File name for a run started at `started`: `2025_03_01_14-05-09_{run}.csv`.
pub fn log_file_name(started: DateTime<Local>, run: &str) -> String {
    format!("{}_{}.csv", started.format("%Y_%m_%d_%H-%M-%S"), run)
}

/// CSV run-log sink.
pub struct CsvRunLog {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
}

impl CsvRunLog {
    /// Create `{dir}/{timestamp}_{run}.csv` (creating `dir` if needed) and
    /// write the header.
    pub fn create(dir: &Path, run: &str, started: DateTime<Local>) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let path = dir.join(log_file_name(started, run));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create run log {}", path.display()))?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(HEADER)?;
        writer.flush()?;
        tracing::info!(path = %path.display(), "run log opened");

        Ok(Self {
            path,
            writer: Mutex::new(writer),
        })
    }

    /// Where the log is written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RunLogSink for CsvRunLog {
    fn write(&self, entry: &LogEntry) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_record([
            format!("{:.2}", entry.elapsed_s).as_str(),
            entry.component.as_str(),
            entry.action.as_str(),
            entry.parameters.as_str(),
            entry.outcome.as_str(),
            entry.notes.as_str(),
        ])?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tracing_test::traced_test;

    fn entry(elapsed_s: f64, outcome: &str) -> LogEntry {
        LogEntry {
            elapsed_s,
            component: "Pump".into(),
            action: "dispense".into(),
            parameters: "flow_rate=1000,pump_id=1,volume=500".into(),
            outcome: outcome.into(),
            notes: String::new(),
        }
    }

    #[test]
    fn file_name_uses_start_timestamp() {
        let started = Local.with_ymd_and_hms(2025, 3, 1, 14, 5, 9).unwrap();
        assert_eq!(log_file_name(started, "flush"), "2025_03_01_14-05-09_flush.csv");
    }

    #[test]
    fn rows_are_readable_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let log = CsvRunLog::create(&dir.path().join("runs"), "test", Local::now()).unwrap();
        log.write(&entry(0.0, "Started async dispense on Pump_1")).unwrap();
        log.write(&entry(12.3456, "Dispensed 500.0 uL @ 1000.0 uL/min on Pump_1"))
            .unwrap();

        let mut reader = csv::Reader::from_path(log.path()).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), HEADER.to_vec());

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][0], "12.35");
        assert_eq!(&rows[1][3], "flow_rate=1000,pump_id=1,volume=500");
        assert!(rows[1][4].starts_with("Dispensed"));
    }

    #[traced_test]
    #[test]
    fn opening_is_traced() {
        let dir = tempfile::tempdir().unwrap();
        CsvRunLog::create(dir.path(), "traced", Local::now()).unwrap();
        assert!(logs_contain("run log opened"));
        assert!(logs_contain("_traced.csv"));
    }
}
