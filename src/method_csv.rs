//! Method scripts as CSV.
//!
//! One command per row, columns `Component, Action, Parameters, Notes, delay`:
//!
//! ```text
//! Component,Action,Parameters,Notes,delay
//! Temperature,set_temperature,"temp_id=1,temp=40",warm up,
//! Pump,dispense,"pump_id=1,flow_rate=1000,volume=500",,0.25
//! SYNC,wait_for_pumps,,,
//! ```
//!
//! Missing columns read as empty. An empty delay takes the caller's default.

use chemflow_experiment::{Action, Command};
use chemflow_core::LabError;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Failure reading a method script.
#[derive(Debug, Error)]
pub enum MethodError {
    /// The file could not be opened or is not valid CSV
    #[error("cannot read method script: {0}")]
    Csv(#[from] csv::Error),
    /// A row has a malformed cell
    #[error("method row {row}: {message}")]
    Row {
        /// 1-based data row (header excluded)
        row: usize,
        /// What is wrong
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct MethodRow {
    #[serde(rename = "Component", default)]
    component: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Parameters", default)]
    parameters: String,
    #[serde(rename = "Notes", default)]
    notes: String,
    #[serde(rename = "delay", alias = "Delay", default)]
    delay: String,
}

/// Read a method script from disk.
pub fn read_method_file(path: &Path, default_delay: Duration) -> Result<Vec<Command>, MethodError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;
    collect_rows(reader, default_delay)
}

/// Read a method script from any reader.
pub fn read_method<R: Read>(input: R, default_delay: Duration) -> Result<Vec<Command>, MethodError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input);
    collect_rows(reader, default_delay)
}

fn collect_rows<R: Read>(
    mut reader: csv::Reader<R>,
    default_delay: Duration,
) -> Result<Vec<Command>, MethodError> {
    let mut commands = Vec::new();
    for (index, record) in reader.deserialize::<MethodRow>().enumerate() {
        let row = index + 1;
        let record = record?;
        if record.component.is_empty() && record.action.is_empty() {
            continue;
        }
        let delay = parse_delay(&record.delay, default_delay).map_err(|message| MethodError::Row {
            row,
            message,
        })?;
        commands.push(
            Command::new(record.component, record.action)
                .with_params(&record.parameters)
                .with_notes(record.notes)
                .with_delay(delay),
        );
    }
    Ok(commands)
}

fn parse_delay(cell: &str, default_delay: Duration) -> Result<Duration, String> {
    if cell.is_empty() {
        return Ok(default_delay);
    }
    let seconds: f64 = cell
        .parse()
        .map_err(|_| format!("delay '{cell}' is not a number"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("delay must be zero or positive, got {cell}"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// A command that will not survive dispatch.
#[derive(Debug)]
pub struct MethodIssue {
    /// 1-based command index
    pub index: usize,
    /// The command as written
    pub command: Command,
    /// Why it fails
    pub error: LabError,
}

/// Type-check every command without touching hardware.
pub fn check_commands(commands: &[Command]) -> Vec<MethodIssue> {
    commands
        .iter()
        .enumerate()
        .filter_map(|(i, command)| {
            Action::from_command(command).err().map(|error| MethodIssue {
                index: i + 1,
                command: command.clone(),
                error,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chemflow_experiment::{Component, DEFAULT_SCRIPT_DELAY};

    const SCRIPT: &str = "\
Component,Action,Parameters,Notes,delay
Temperature,set_temperature,\"temp_id=1, temp=40\",warm up,
Pump,dispense,\"pump_id=1,flow_rate=1000,volume=500\",,0.25
,,,,
SYNC,wait_for_pumps,,,
";

    #[test]
    fn rows_become_commands() {
        let commands = read_method(SCRIPT.as_bytes(), DEFAULT_SCRIPT_DELAY).unwrap();
        assert_eq!(commands.len(), 3);

        assert_eq!(commands[0].component(), Component::Temperature);
        assert_eq!(commands[0].get("temp"), Some("40"));
        assert_eq!(commands[0].notes, "warm up");
        assert_eq!(commands[0].delay, Duration::from_millis(500));

        assert_eq!(commands[1].action, "dispense");
        assert_eq!(commands[1].delay, Duration::from_millis(250));
        assert_eq!(commands[2].component(), Component::Sync);
    }

    #[test]
    fn missing_columns_read_as_empty() {
        let script = "Component,Action\nSYNC,wait_for_pumps\n";
        let commands = read_method(script.as_bytes(), Duration::from_secs(1)).unwrap();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].params.is_empty());
        assert_eq!(commands[0].delay, Duration::from_secs(1));
    }

    #[test]
    fn bad_delay_names_the_row() {
        let script = "Component,Action,Parameters,Notes,delay\nSYNC,wait_for_pumps,,,soon\n";
        let err = read_method(script.as_bytes(), DEFAULT_SCRIPT_DELAY).unwrap_err();
        assert!(matches!(err, MethodError::Row { row: 1, .. }));
        assert!(err.to_string().contains("'soon'"));

        let script = "Component,Action,Parameters,Notes,delay\nSYNC,wait_for_pumps,,,-2\n";
        assert!(read_method(script.as_bytes(), DEFAULT_SCRIPT_DELAY).is_err());
    }

    #[test]
    fn check_reports_only_failing_commands() {
        let script = "\
Component,Action,Parameters,Notes,delay
Pump,dispense,\"pump_id=1,flow_rate=1000,volume=500\",,
Pump,dispense,\"pump_id=1,volume=500\",,
Centrifuge,spin,,,
";
        let commands = read_method(script.as_bytes(), DEFAULT_SCRIPT_DELAY).unwrap();
        let issues = check_commands(&commands);
        let indexes: Vec<_> = issues.iter().map(|issue| issue.index).collect();
        assert_eq!(indexes, vec![2, 3]);
        assert!(matches!(issues[0].error, LabError::Validation(_)));
        assert!(matches!(issues[1].error, LabError::NotFound(_)));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = read_method_file(Path::new("/nonexistent/method.csv"), DEFAULT_SCRIPT_DELAY);
        assert!(matches!(result, Err(MethodError::Csv(_))));
    }
}
