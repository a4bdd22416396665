//! One method run, from files to a closed bench.
//!
//! [`run_method`] loads the method script and the hardware description,
//! connects every device, opens the CSV run log and hands the commands to the
//! [`Dispatcher`]. Ctrl+C stops and closes the bench.

use anyhow::{Context, Result};
use chemflow_experiment::{Dispatcher, RunControl, RunLogger, RunSummary};
use chemflow_hardware::registry::DeviceRegistry;
use chemflow_hardware::{create_registry_from_config, HardwareConfig};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::instruments::load_instrument_table;
use crate::method_csv::read_method_file;
use crate::run_log_csv::CsvRunLog;

/// Where the bench description comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareSource {
    /// TOML hardware file
    Toml(PathBuf),
    /// Instrument table CSV
    Instruments(PathBuf),
}

impl HardwareSource {
    /// Load the hardware description and apply the run-level overrides.
    pub fn load(&self, app: &AppConfig) -> Result<HardwareConfig> {
        let mut config = match self {
            HardwareSource::Toml(path) => HardwareConfig::from_file(path)?,
            HardwareSource::Instruments(path) => load_instrument_table(path)?,
        };
        app.apply_to(&mut config.defaults);
        Ok(config)
    }
}

/// Inputs of one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Method script
    pub method: PathBuf,
    /// Bench description
    pub hardware: HardwareSource,
    /// Directory for the run-log CSV
    pub log_dir: PathBuf,
    /// Read pause/resume from stdin
    pub interactive: bool,
}

/// Result of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Dispatcher totals
    pub summary: RunSummary,
    /// Run-log file
    pub log_path: PathBuf,
}

/// Run name derived from the method file (`flush_lines.csv` → `flush_lines`).
pub fn run_name(method: &Path) -> String {
    method
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("run")
        .to_string()
}

/// Execute a method file end to end.
pub async fn run_method(options: &RunOptions, app: &AppConfig) -> Result<RunOutcome> {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("run", %run_id, method = %options.method.display());
    run_inner(options, app).instrument(span).await
}

async fn run_inner(options: &RunOptions, app: &AppConfig) -> Result<RunOutcome> {
    let commands = read_method_file(&options.method, app.default_delay())
        .with_context(|| format!("Failed to load method {}", options.method.display()))?;
    let hardware = options.hardware.load(app)?;
    let registry = Arc::new(create_registry_from_config(&hardware)?);
    tracing::info!(commands = commands.len(), devices = registry.len(), "method loaded");

    if let Err(e) = registry.connect_all().await {
        registry.close_all().await;
        return Err(e).context("Failed to connect the bench");
    }

    let started = Local::now();
    let sink = Arc::new(CsvRunLog::create(&options.log_dir, &run_name(&options.method), started)?);
    let log_path = sink.path().to_path_buf();
    let logger = RunLogger::new(sink);
    logger.log(
        "RUN",
        "load_method",
        format!("input={}", options.method.display()),
        format!("Loading input file: {}", options.method.display()),
        "",
    );

    let mut dispatcher = Dispatcher::new(registry.clone(), logger.clone());
    let console = options
        .interactive
        .then(|| spawn_console(dispatcher.control()));

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let result = tokio::select! {
        result = dispatcher.run(commands) => result.map_err(anyhow::Error::from),
        _ = interrupted => Err(shut_down_interrupted(&registry, &logger).await),
    };

    if let Some(console) = console {
        console.abort();
    }

    let summary = result?;
    Ok(RunOutcome { summary, log_path })
}

/// Record the interruption in the run log, then stop and close every device.
async fn shut_down_interrupted(registry: &DeviceRegistry, logger: &RunLogger) -> anyhow::Error {
    tracing::warn!("interrupted, stopping the bench");
    logger.log(
        "RUN",
        "abort",
        "",
        "Interrupted by user",
        "stopping and closing all devices",
    );
    let stop_failures = registry.stop_all().await;
    let close_failures = registry.close_all().await;
    anyhow::anyhow!("Run interrupted ({stop_failures} stop and {close_failures} close failures)")
}

fn spawn_console(control: RunControl) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        if let Err(e) = read_console(stdin, control).await {
            tracing::warn!(error = %e, "console input closed");
        }
    })
}

/// Apply `pause` / `resume` lines from `input` to `control` until EOF.
pub async fn read_console<R: AsyncBufRead + Unpin>(input: R, control: RunControl) -> Result<()> {
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim().to_ascii_lowercase().as_str() {
            "pause" | "p" => control.pause(),
            "resume" | "r" => control.resume(),
            "status" | "s" => println!("state: {}", control.state()),
            "" => {}
            other => println!("unknown input '{other}' (pause, resume, status)"),
        }
    }
    Ok(())
}
