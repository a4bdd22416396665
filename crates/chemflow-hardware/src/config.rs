//! Hardware configuration and registry construction.
//!
//! A hardware file lists the bench as `[[devices]]` entries, each naming a
//! driver by its `type` tag:
//!
//! ```toml
//! timeout_ms = 1000
//!
//! [[devices]]
//! name = "Pump_1"
//! [devices.driver]
//! type = "vici_m6"
//! port = "/dev/ttyUSB0"
//!
//! [[devices]]
//! name = "Valve_1"
//! [devices.driver]
//! type = "vici_valve"
//! port = "/dev/ttyUSB1"
//! valve = "10-way"
//!
//! [[devices]]
//! name = "GX281_1"
//! [devices.driver]
//! type = "mock_liquid_handler"
//! rack = 204
//! ```
//!
//! Every entry is validated before any device is built, and all problems are
//! reported together.

use anyhow::{anyhow, bail, Context, Result};
use chemflow_core::geometry::RackType;
use chemflow_core::serial::PortOpener;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::drivers::gx281::{MotionTiming, DEFAULT_UNIT};
use crate::drivers::mock::{
    MockLiquidHandler, MockPump, MockSpectrometer, MockSyringePump, MockTemperatureController,
    MockValve,
};
use crate::drivers::motion_profile::UncalibratedPolicy;
use crate::drivers::tc720::SafeRange;
use crate::drivers::vici_m6::M6Settings;
use crate::drivers::{
    gsioc, marlin, phd_ultra, tc720, vici_m6, vici_valve, Ender3LiquidHandler, Gx281,
    MarlinStage, PhdUltra, SerialGsioc, Tc720, ValveKind, ViciM6Pump, ViciValve,
};
use crate::registry::{DeviceCategory, DeviceHandle, DeviceRegistry};

// =============================================================================
// Driver Types
// =============================================================================

/// Driver selection and its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverType {
    /// VICI multiposition selector valve
    ViciValve {
        /// Serial port path
        port: String,
        /// Preset (`"6-way"`) or position count
        #[serde(default = "default_valve_kind")]
        valve: ValveKind,
        /// Baud override
        #[serde(default)]
        baud: Option<u32>,
    },

    /// VICI M6 stepper pump
    ViciM6 {
        /// Serial port path
        port: String,
        /// Baud override
        #[serde(default)]
        baud: Option<u32>,
        /// Uncalibrated-rate policy override
        #[serde(default)]
        policy: Option<UncalibratedPolicy>,
    },

    /// Harvard PHD ULTRA syringe pump
    PhdUltra {
        /// Serial port path
        port: String,
        /// Daisy-chain address (0 = none)
        #[serde(default)]
        address: u8,
        /// Baud override
        #[serde(default)]
        baud: Option<u32>,
    },

    /// TE Technology TC-720 temperature controller
    Tc720 {
        /// Serial port path
        port: String,
        /// Baud override
        #[serde(default)]
        baud: Option<u32>,
        /// Lowest accepted set point (°C)
        #[serde(default)]
        min_c: Option<f64>,
        /// Highest accepted set point (°C)
        #[serde(default)]
        max_c: Option<f64>,
    },

    /// Gilson GX-281 liquid handler on a GSIOC bus
    Gx281 {
        /// Serial port path of the GSIOC adapter
        port: String,
        /// GSIOC unit id
        #[serde(default = "default_gsioc_unit")]
        unit: u8,
        /// Rack initially on every bed
        #[serde(default = "default_gx_rack")]
        rack: RackType,
        /// Baud override
        #[serde(default)]
        baud: Option<u32>,
    },

    /// Ender-3 printer used as a liquid handler
    Ender3 {
        /// Serial port path
        port: String,
        /// Baud override
        #[serde(default)]
        baud: Option<u32>,
    },

    /// Simulated selector valve
    MockValve {
        /// Number of ports
        #[serde(default = "default_mock_positions")]
        positions: u8,
    },

    /// Simulated flow pump
    MockPump,

    /// Simulated syringe pump
    MockSyringePump,

    /// Simulated temperature controller
    MockTemperature {
        /// Starting set point (°C)
        #[serde(default = "default_initial_temperature")]
        initial_c: f64,
    },

    /// Simulated liquid handler
    MockLiquidHandler {
        /// Rack on every bed
        #[serde(default = "default_gx_rack")]
        rack: RackType,
    },

    /// Simulated spectrometer
    MockSpectrometer {
        /// Pixels across 200–800 nm
        #[serde(default = "default_pixels")]
        pixels: usize,
    },
}

fn default_valve_kind() -> ValveKind {
    ValveKind::SixWay
}

fn default_gsioc_unit() -> u8 {
    DEFAULT_UNIT
}

fn default_gx_rack() -> RackType {
    RackType::R204
}

fn default_mock_positions() -> u8 {
    6
}

fn default_initial_temperature() -> f64 {
    25.0
}

fn default_pixels() -> usize {
    1024
}

impl DriverType {
    /// Type tag as written in configuration.
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::ViciValve { .. } => "vici_valve",
            DriverType::ViciM6 { .. } => "vici_m6",
            DriverType::PhdUltra { .. } => "phd_ultra",
            DriverType::Tc720 { .. } => "tc720",
            DriverType::Gx281 { .. } => "gx281",
            DriverType::Ender3 { .. } => "ender3",
            DriverType::MockValve { .. } => "mock_valve",
            DriverType::MockPump => "mock_pump",
            DriverType::MockSyringePump => "mock_syringe_pump",
            DriverType::MockTemperature { .. } => "mock_temperature",
            DriverType::MockLiquidHandler { .. } => "mock_liquid_handler",
            DriverType::MockSpectrometer { .. } => "mock_spectrometer",
        }
    }

    /// Registry category this driver belongs to.
    pub fn category(&self) -> DeviceCategory {
        match self {
            DriverType::ViciValve { .. } | DriverType::MockValve { .. } => DeviceCategory::Valves,
            DriverType::ViciM6 { .. }
            | DriverType::PhdUltra { .. }
            | DriverType::MockPump
            | DriverType::MockSyringePump => DeviceCategory::Pumps,
            DriverType::Tc720 { .. } | DriverType::MockTemperature { .. } => {
                DeviceCategory::TemperatureControllers
            }
            DriverType::Gx281 { .. }
            | DriverType::Ender3 { .. }
            | DriverType::MockLiquidHandler { .. } => DeviceCategory::LiquidHandlers,
            DriverType::MockSpectrometer { .. } => DeviceCategory::UvDetectors,
        }
    }

    /// Serial port and effective baud rate, for real drivers.
    pub fn serial(&self) -> Option<(&str, u32)> {
        match self {
            DriverType::ViciValve { port, baud, .. } => {
                Some((port, baud.unwrap_or(vici_valve::DEFAULT_BAUD)))
            }
            DriverType::ViciM6 { port, baud, .. } => {
                Some((port, baud.unwrap_or(vici_m6::DEFAULT_BAUD)))
            }
            DriverType::PhdUltra { port, baud, .. } => {
                Some((port, baud.unwrap_or(phd_ultra::DEFAULT_BAUD)))
            }
            DriverType::Tc720 { port, baud, .. } => Some((port, baud.unwrap_or(tc720::DEFAULT_BAUD))),
            DriverType::Gx281 { port, baud, .. } => Some((port, baud.unwrap_or(gsioc::DEFAULT_BAUD))),
            DriverType::Ender3 { port, baud } => Some((port, baud.unwrap_or(marlin::DEFAULT_BAUD))),
            _ => None,
        }
    }

    /// Whether this is a simulated device.
    pub fn is_mock(&self) -> bool {
        self.serial().is_none()
    }
}

// =============================================================================
// Configuration Validation
// =============================================================================

/// Validate one driver configuration before instantiating it.
pub fn validate_driver_config(driver: &DriverType) -> Result<()> {
    if let Some((port, baud)) = driver.serial() {
        if !cfg!(feature = "serial") {
            bail!("built without serial support; use a mock_* driver instead");
        }
        if port.trim().is_empty() {
            bail!("serial port cannot be empty");
        }
        if baud == 0 {
            bail!("baud rate must be positive");
        }
    }

    match driver {
        DriverType::PhdUltra { address, .. } if *address > 99 => {
            bail!("PHD ULTRA address {address} out of range (0-99)");
        }
        DriverType::Tc720 { min_c, max_c, .. } => {
            let range = safe_range(*min_c, *max_c);
            if !(range.min_c < range.max_c) {
                bail!(
                    "TC-720 safe range is empty ({}..={} °C)",
                    range.min_c,
                    range.max_c
                );
            }
        }
        DriverType::Gx281 { unit, .. } if *unit > 63 => {
            bail!("GSIOC unit id {unit} out of range (0-63)");
        }
        DriverType::Gx281 { rack, .. } if rack.is_single_bed() => {
            bail!("rack {rack} is a single-bed rack and cannot populate the GX-281 deck");
        }
        DriverType::MockValve { positions } => {
            ValveKind::from_positions(*positions).map_err(|e| anyhow!("{e}"))?;
        }
        DriverType::MockTemperature { initial_c } if !initial_c.is_finite() => {
            bail!("initial temperature must be finite");
        }
        DriverType::MockSpectrometer { pixels } if *pixels < 2 => {
            bail!("spectrometer needs at least 2 pixels, got {pixels}");
        }
        _ => {}
    }
    Ok(())
}

fn safe_range(min_c: Option<f64>, max_c: Option<f64>) -> SafeRange {
    let default = SafeRange::default();
    SafeRange {
        min_c: min_c.unwrap_or(default.min_c),
        max_c: max_c.unwrap_or(default.max_c),
    }
}

// =============================================================================
// Device Configuration
// =============================================================================

/// One device on the bench.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Registry name, unique within the driver's category (e.g. `"Pump_1"`)
    pub name: String,
    /// Driver and its settings
    pub driver: DriverType,
    /// Per-device reply timeout override (ms)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Settings shared by every device in a hardware file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareDefaults {
    /// Reply timeout (ms)
    pub timeout_ms: u64,
    /// Wait after a pump's nominal run time (s)
    pub pump_settle_margin_s: f64,
    /// Uncalibrated-rate policy for flow pumps
    pub uncalibrated_policy: UncalibratedPolicy,
    /// Pause after opening a Marlin port while the firmware resets (ms)
    pub marlin_boot_delay_ms: u64,
}

impl Default for HardwareDefaults {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            pump_settle_margin_s: 2.0,
            uncalibrated_policy: UncalibratedPolicy::Fallback,
            marlin_boot_delay_ms: 2000,
        }
    }
}

/// Hardware configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Shared settings
    #[serde(flatten)]
    pub defaults: HardwareDefaults,
    /// Devices to register
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl HardwareConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow!("Failed to parse hardware config: {e}"))
    }

    /// Load a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read hardware config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("in hardware config file {}", path.display()))
    }

    /// Check every entry, reporting all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        if self.defaults.timeout_ms == 0 {
            errors.push("timeout_ms must be positive".to_string());
        }
        if !(self.defaults.pump_settle_margin_s >= 0.0) {
            errors.push("pump_settle_margin_s cannot be negative".to_string());
        }
        for device in &self.devices {
            if device.name.trim().is_empty() {
                errors.push(format!(
                    "Device with driver {} has an empty name",
                    device.driver.driver_name()
                ));
            }
            if !seen.insert((device.driver.category(), device.name.as_str())) {
                errors.push(format!(
                    "Device '{}' is listed twice under {}",
                    device.name,
                    device.driver.category()
                ));
            }
            if let Err(e) = validate_driver_config(&device.driver) {
                errors.push(format!(
                    "Device '{}' ({}): {}",
                    device.name,
                    device.driver.driver_name(),
                    e
                ));
            }
        }

        if !errors.is_empty() {
            bail!(
                "Hardware configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
        Ok(())
    }
}

// =============================================================================
// Registry construction
// =============================================================================

#[cfg(feature = "serial")]
fn serial_opener(port: &str, baud: u32, even_parity: bool) -> Result<Arc<dyn PortOpener>> {
    let opener = chemflow_core::serial::SerialOpener::new(port, baud);
    let opener = if even_parity {
        opener.with_even_parity()
    } else {
        opener
    };
    Ok(Arc::new(opener))
}

#[cfg(not(feature = "serial"))]
fn serial_opener(port: &str, _baud: u32, _even_parity: bool) -> Result<Arc<dyn PortOpener>> {
    bail!("cannot open {port}: built without serial support")
}

fn opener_for(driver: &DriverType, even_parity: bool) -> Result<Arc<dyn PortOpener>> {
    let (port, baud) = driver
        .serial()
        .ok_or_else(|| anyhow!("{} has no serial port", driver.driver_name()))?;
    serial_opener(port, baud, even_parity)
}

/// Instantiate one configured device.
pub fn build_device(config: &DeviceConfig, defaults: &HardwareDefaults) -> Result<DeviceHandle> {
    let name = config.name.as_str();
    let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(defaults.timeout_ms));
    let settle_margin = Duration::from_secs_f64(defaults.pump_settle_margin_s.max(0.0));

    let handle = match &config.driver {
        DriverType::ViciValve { valve, .. } => {
            let opener = opener_for(&config.driver, false)?;
            DeviceHandle::valve(Arc::new(ViciValve::new(name, opener, *valve, timeout)))
        }
        DriverType::ViciM6 { policy, .. } => {
            let opener = opener_for(&config.driver, false)?;
            let settings = M6Settings {
                settle_margin,
                policy: policy.unwrap_or(defaults.uncalibrated_policy),
                ..M6Settings::default()
            };
            DeviceHandle::flow_pump(Arc::new(ViciM6Pump::new(name, opener, timeout, settings)))
        }
        DriverType::PhdUltra { address, .. } => {
            let opener = opener_for(&config.driver, false)?;
            DeviceHandle::syringe_pump(Arc::new(PhdUltra::new(
                name,
                opener,
                *address,
                timeout,
                settle_margin,
            )))
        }
        DriverType::Tc720 { min_c, max_c, .. } => {
            let opener = opener_for(&config.driver, false)?;
            DeviceHandle::temperature(Arc::new(Tc720::new(
                name,
                opener,
                timeout,
                safe_range(*min_c, *max_c),
            )))
        }
        DriverType::Gx281 { unit, rack, .. } => {
            let opener = opener_for(&config.driver, true)?;
            let bus = Arc::new(SerialGsioc::new(name, opener, timeout));
            let handler = Gx281::new(name, bus, *unit, *rack, MotionTiming::default())?;
            DeviceHandle::liquid_handler(Arc::new(handler))
        }
        DriverType::Ender3 { .. } => {
            let opener = opener_for(&config.driver, false)?;
            let stage = MarlinStage::new(
                name,
                opener,
                timeout,
                Duration::from_millis(defaults.marlin_boot_delay_ms),
            );
            DeviceHandle::liquid_handler(Arc::new(Ender3LiquidHandler::new(name, stage)?))
        }
        DriverType::MockValve { positions } => {
            DeviceHandle::valve(Arc::new(MockValve::new(name, *positions)))
        }
        DriverType::MockPump => DeviceHandle::flow_pump(Arc::new(MockPump::new(name))),
        DriverType::MockSyringePump => {
            DeviceHandle::syringe_pump(Arc::new(MockSyringePump::new(name)))
        }
        DriverType::MockTemperature { initial_c } => DeviceHandle::temperature(Arc::new(
            MockTemperatureController::new(name, *initial_c),
        )),
        DriverType::MockLiquidHandler { rack } => {
            DeviceHandle::liquid_handler(Arc::new(MockLiquidHandler::new(name, *rack)?))
        }
        DriverType::MockSpectrometer { pixels } => {
            DeviceHandle::spectrometer(Arc::new(MockSpectrometer::new(name, *pixels)))
        }
    };
    Ok(handle)
}

/// Validate `config`, then build and register every device (unconnected).
pub fn create_registry_from_config(config: &HardwareConfig) -> Result<DeviceRegistry> {
    config.validate()?;

    let mut registry = DeviceRegistry::new();
    for device in &config.devices {
        let handle = build_device(device, &config.defaults).with_context(|| {
            format!(
                "Failed to build device '{}' ({})",
                device.name,
                device.driver.driver_name()
            )
        })?;
        registry.register(device.driver.category(), device.name.clone(), handle)?;
        tracing::info!(
            name = %device.name,
            driver = device.driver.driver_name(),
            port = device.driver.serial().map(|(port, _)| port).unwrap_or("-"),
            "device configured"
        );
    }
    Ok(registry)
}

/// Load a hardware file and build its registry.
pub fn create_registry_from_file(path: &Path) -> Result<DeviceRegistry> {
    let config = HardwareConfig::from_file(path)?;
    create_registry_from_config(&config)
}
