//! End-to-end runs of CSV methods against simulated benches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chemflow::config::AppConfig;
use chemflow::runner::{read_console, run_method, HardwareSource, RunOptions};
use chemflow_experiment::{Dispatcher, EngineState, MemoryRunLog, RunLogger};
use chemflow_hardware::DeviceRegistry;

const BENCH: &str = r#"
pump_settle_margin_s = 0.0

[[devices]]
name = "Pump_1"
[devices.driver]
type = "mock_pump"

[[devices]]
name = "Pump_2"
[devices.driver]
type = "mock_pump"

[[devices]]
name = "Valve_1"
[devices.driver]
type = "mock_valve"

[[devices]]
name = "TC720_1"
[devices.driver]
type = "mock_temperature"
"#;

const INSTRUMENTS: &str = "\
InstrumentType,DeviceNumber,Name,COMPort,OtherParams
MockPump,1,Feed,,
MockPump,2,Quench,,
MockValve,1,Selector,,
MockTemperature,1,Jacket,,
";

const METHOD: &str = "\
Component,Action,Parameters,Notes,delay
Temperature,set_temperature,\"temp_id=1,temp=40\",warm up,
VICI-6Way,go_to_position,\"valve_id=1,position=3\",,
Pump,dispense,\"pump_id=1,flow_rate=600,volume=100\",slow,
Pump,aspirate,\"pump_id=2,flow_rate=1200,volume=100\",fast,
SYNC,wait_for_pumps,,,
Centrifuge,spin,,,
";

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn read_log(path: &Path) -> Vec<Vec<String>> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader
        .records()
        .map(|record| record.unwrap().iter().map(str::to_string).collect())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn toml_bench_runs_method_and_writes_csv_log() {
    let dir = tempfile::tempdir().unwrap();
    let options = RunOptions {
        method: write(dir.path(), "flush.csv", METHOD),
        hardware: HardwareSource::Toml(write(dir.path(), "bench.toml", BENCH)),
        log_dir: dir.path().join("logs"),
        interactive: false,
    };

    let outcome = run_method(&options, &AppConfig::default()).await.unwrap();
    assert_eq!(outcome.summary.state, EngineState::Finished);
    assert_eq!(outcome.summary.commands_executed, 5);
    assert_eq!(outcome.summary.recoverable_failures, 1);
    assert_eq!(outcome.summary.background_completed, 2);

    let name = outcome.log_path.file_name().unwrap().to_str().unwrap();
    assert!(name.ends_with("_flush.csv"), "{name}");
    assert!(outcome.log_path.starts_with(dir.path().join("logs")));

    let rows = read_log(&outcome.log_path);
    assert_eq!(rows[0][2], "load_method");
    assert!(rows
        .iter()
        .any(|row| row[1] == "SYNC" && row[4] == "All pumps finished"));
    assert!(rows
        .iter()
        .any(|row| row[1] == "Centrifuge" && row[4].starts_with("Error")));
    assert_eq!(rows.last().unwrap()[2], "finished");
}

#[tokio::test(start_paused = true)]
async fn instrument_table_builds_the_same_bench() {
    let dir = tempfile::tempdir().unwrap();
    let options = RunOptions {
        method: write(dir.path(), "flush.csv", METHOD),
        hardware: HardwareSource::Instruments(write(dir.path(), "instruments.csv", INSTRUMENTS)),
        log_dir: dir.path().to_path_buf(),
        interactive: false,
    };

    let mut app = AppConfig::default();
    app.run.pump_settle_margin_s = Some(0.0);
    let outcome = run_method(&options, &app).await.unwrap();
    assert_eq!(outcome.summary.commands_executed, 5);
    assert_eq!(outcome.summary.background_failed, 0);
}

#[tokio::test]
async fn invalid_bench_fails_before_the_log_is_created() {
    let dir = tempfile::tempdir().unwrap();
    let bench = "[[devices]]\nname = \"Pump_1\"\n[devices.driver]\ntype = \"vici_m6\"\nport = \"\"\n";
    let options = RunOptions {
        method: write(dir.path(), "flush.csv", METHOD),
        hardware: HardwareSource::Toml(write(dir.path(), "bench.toml", bench)),
        log_dir: dir.path().join("logs"),
        interactive: false,
    };

    let err = run_method(&options, &AppConfig::default()).await.unwrap_err();
    assert!(format!("{err:#}").contains("validation failed"));
    assert!(!dir.path().join("logs").exists());
}

#[tokio::test]
async fn console_lines_pause_and_resume() {
    let dispatcher = Dispatcher::new(
        Arc::new(DeviceRegistry::new()),
        RunLogger::new(Arc::new(MemoryRunLog::new())),
    );
    let control = dispatcher.control();

    read_console(&b"pause\nbogus\n"[..], control.clone()).await.unwrap();
    assert!(control.is_paused());

    read_console(&b"  RESUME \n"[..], control.clone()).await.unwrap();
    assert!(!control.is_paused());
}
