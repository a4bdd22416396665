//! CLI Entry Point for chemflow
//!
//! Provides command-line interface for:
//! - Running a CSV method script against a bench
//! - Checking a method and a bench description without touching hardware
//! - Printing rack well tables
//!
//! # Usage
//!
//! Run a method:
//! ```bash
//! chemflow run --method methods/flush.csv --hardware config/bench.toml
//! chemflow run --method methods/flush.csv --instruments config/instruments.csv --interactive
//! ```
//!
//! Check a method:
//! ```bash
//! chemflow validate --method methods/flush.csv --hardware config/bench.toml
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use chemflow::config::AppConfig;
use chemflow::layout::well_table;
use chemflow::method_csv::{check_commands, read_method_file};
use chemflow::runner::{run_method, HardwareSource, RunOptions};
use chemflow::telemetry;
use chemflow_core::geometry::RackType;
use chemflow_hardware::create_registry_from_config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chemflow")]
#[command(about = "Command-stream controller for a chemistry bench", long_about = None)]
struct Cli {
    /// Application configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a method script
    Run {
        /// Method script (CSV)
        #[arg(long)]
        method: PathBuf,

        /// Hardware configuration file (TOML)
        #[arg(long, required_unless_present = "instruments", conflicts_with = "instruments")]
        hardware: Option<PathBuf>,

        /// Instrument table (CSV)
        #[arg(long)]
        instruments: Option<PathBuf>,

        /// Directory for the run log (overrides the configuration)
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Accept pause/resume on stdin
        #[arg(long)]
        interactive: bool,
    },

    /// Check a method script and bench description without touching hardware
    Validate {
        /// Method script (CSV)
        #[arg(long)]
        method: PathBuf,

        /// Hardware configuration file (TOML)
        #[arg(long, conflicts_with = "instruments")]
        hardware: Option<PathBuf>,

        /// Instrument table (CSV)
        #[arg(long)]
        instruments: Option<PathBuf>,
    },

    /// Print the well table of a rack
    Layout {
        /// Rack code (204, 207, 209, 304)
        #[arg(long)]
        rack: u16,

        /// Bed slot
        #[arg(long, default_value = "1")]
        bed: u8,
    },
}

fn hardware_source(hardware: Option<PathBuf>, instruments: Option<PathBuf>) -> Option<HardwareSource> {
    hardware
        .map(HardwareSource::Toml)
        .or_else(|| instruments.map(HardwareSource::Instruments))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let app = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    app.validate().context("Invalid application configuration")?;
    telemetry::init_from_config(&app)?;

    match cli.command {
        Commands::Run {
            method,
            hardware,
            instruments,
            log_dir,
            interactive,
        } => {
            let Some(hardware) = hardware_source(hardware, instruments) else {
                bail!("either --hardware or --instruments is required");
            };
            let options = RunOptions {
                method,
                hardware,
                log_dir: log_dir.unwrap_or_else(|| app.run.log_dir.clone()),
                interactive: interactive || app.run.interactive,
            };
            run(&options, &app).await
        }
        Commands::Validate {
            method,
            hardware,
            instruments,
        } => validate(method, hardware_source(hardware, instruments), &app),
        Commands::Layout { rack, bed } => {
            let rack = RackType::try_from(rack)?;
            print!("{}", well_table(rack, bed)?);
            Ok(())
        }
    }
}

async fn run(options: &RunOptions, app: &AppConfig) -> Result<()> {
    println!("📜 Method: {}", options.method.display());
    if options.interactive {
        println!("⌨️  Type 'pause' or 'resume' and press Enter to control the run");
    }

    let outcome = run_method(options, app).await?;
    let summary = outcome.summary;

    println!();
    println!("✅ Run {}", summary.state);
    println!("   Commands executed:    {}", summary.commands_executed);
    println!("   Recoverable failures: {}", summary.recoverable_failures);
    println!("   Skipped pump runs:    {}", summary.skipped);
    println!(
        "   Background runs:      {} completed, {} failed",
        summary.background_completed, summary.background_failed
    );
    println!("   Run log:              {}", outcome.log_path.display());
    Ok(())
}

fn validate(method: PathBuf, hardware: Option<HardwareSource>, app: &AppConfig) -> Result<()> {
    let commands = read_method_file(&method, app.default_delay())
        .with_context(|| format!("Failed to load method {}", method.display()))?;
    let issues = check_commands(&commands);
    for issue in &issues {
        println!(
            "❌ command {} ({} / {}): {}",
            issue.index, issue.command.component, issue.command.action, issue.error
        );
    }

    if let Some(hardware) = hardware {
        let config = hardware.load(app)?;
        let registry = create_registry_from_config(&config)?;
        println!("🔧 Bench: {} devices configured", registry.len());
    }

    if !issues.is_empty() {
        bail!("{} of {} commands failed validation", issues.len(), commands.len());
    }
    println!("✅ {} commands OK", commands.len());
    Ok(())
}
