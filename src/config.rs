//! Application configuration using Figment
//!
//! Settings are layered, later sources winning:
//! 1. Built-in defaults
//! 2. A TOML file (optional; a missing file is skipped)
//! 3. Environment variables prefixed with `CHEMFLOW_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use chemflow::config::AppConfig;
//!
//! // CHEMFLOW_RUN__LOG_DIR=/data/runs overrides [run] log_dir
//! let config = AppConfig::load_from("config/chemflow.toml")?;
//! println!("Run logs go to {}", config.run.log_dir.display());
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{bail, Context, Result};
use chemflow_hardware::drivers::motion_profile::UncalibratedPolicy;
use chemflow_hardware::HardwareDefaults;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CHEMFLOW_";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Method run settings
    pub run: RunConfig,
    /// Flow pump settings
    pub pumps: PumpConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Diagnostic output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "chemflow".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Diagnostic output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// JSON lines
    Json,
}

/// Method run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Directory for run-log CSV files
    pub log_dir: PathBuf,
    /// Delay after a method row whose delay cell is empty (s)
    pub default_delay_s: f64,
    /// Overrides the hardware file's wait after a pump's nominal run time (s)
    pub pump_settle_margin_s: Option<f64>,
    /// Read pause/resume from stdin while running
    pub interactive: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            default_delay_s: 0.5,
            pump_settle_margin_s: None,
            interactive: false,
        }
    }
}

/// Flow pump configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Overrides the hardware file's uncalibrated-rate policy
    pub uncalibrated_policy: Option<UncalibratedPolicy>,
}

impl AppConfig {
    /// Defaults plus environment overrides, no file.
    pub fn load() -> Result<Self> {
        Self::figment(None).extract().context("Failed to load configuration")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        Self::figment(Some(path))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            bail!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            );
        }

        if !self.run.default_delay_s.is_finite() || self.run.default_delay_s < 0.0 {
            bail!(
                "Invalid default_delay_s {}. Must be zero or positive",
                self.run.default_delay_s
            );
        }

        if let Some(margin) = self.run.pump_settle_margin_s {
            if !margin.is_finite() || margin < 0.0 {
                bail!("Invalid pump_settle_margin_s {margin}. Must be zero or positive");
            }
        }

        Ok(())
    }

    /// Delay applied after method rows without their own.
    pub fn default_delay(&self) -> Duration {
        Duration::from_secs_f64(self.run.default_delay_s.max(0.0))
    }

    /// Apply the run-level pump overrides to a hardware file's shared settings.
    pub fn apply_to(&self, defaults: &mut HardwareDefaults) {
        if let Some(margin) = self.run.pump_settle_margin_s {
            defaults.pump_settle_margin_s = margin;
        }
        if let Some(policy) = self.pumps.uncalibrated_policy {
            defaults.uncalibrated_policy = policy;
        }
    }
}
