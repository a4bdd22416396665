//! # chemflow
//!
//! Command-stream controller for a chemistry bench: flow and syringe pumps,
//! selector valves, temperature controllers and liquid handlers driven from a
//! CSV method script.
//!
//! ## Crate Structure
//!
//! The device and execution layers live in workspace crates:
//!
//! - **`chemflow-core`**: error taxonomy, device contract, capability traits,
//!   serial links, bed/well geometry.
//! - **`chemflow-hardware`**: protocol drivers, mocks, the device registry and
//!   the TOML hardware configuration.
//! - **`chemflow-experiment`**: commands, typed actions, the scheduler and the
//!   dispatcher.
//!
//! This crate adds what the `chemflow` binary needs around them:
//!
//! - **`config`**: layered application settings (defaults, TOML, `CHEMFLOW_*`).
//! - **`telemetry`**: `tracing` subscriber setup.
//! - **`method_csv`**: method scripts as CSV.
//! - **`instruments`**: the instrument table CSV as a hardware configuration.
//! - **`run_log_csv`**: the run log as a CSV file.
//! - **`runner`**: one run from files to a closed bench.
//! - **`layout`**: printable well tables.

pub mod config;
pub mod instruments;
pub mod layout;
pub mod method_csv;
pub mod run_log_csv;
pub mod runner;
pub mod telemetry;

pub use chemflow_core as core;
pub use chemflow_experiment as experiment;
pub use chemflow_hardware as hardware;

pub use config::AppConfig;
pub use runner::{run_method, HardwareSource, RunOptions, RunOutcome};
