//! Instrument table CSV.
//!
//! The tabular way of describing a bench, one device per row:
//!
//! ```text
//! InstrumentType,DeviceNumber,Name,COMPort,OtherParams
//! Pump,1,Main feed,/dev/ttyUSB0,
//! Valve10Way,2,,/dev/ttyUSB1,baud=19200
//! GX281,1,,/dev/ttyUSB2,"unit=25,rack=209"
//! MockTemperature,1,,,initial_c=30
//! ```
//!
//! Rows become a [`HardwareConfig`]. Device names follow the resolver
//! conventions (`Pump_1`, `Valve_2`, `GX281_1`, ...), so method scripts can
//! address them by id. The `Name` column is descriptive only.

use anyhow::{anyhow, bail, Context, Result};
use chemflow_core::geometry::RackType;
use chemflow_experiment::parse_kv_params;
use chemflow_hardware::drivers::motion_profile::UncalibratedPolicy;
use chemflow_hardware::drivers::ValveKind;
use chemflow_hardware::{DeviceConfig, DriverType, HardwareConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
struct InstrumentRow {
    #[serde(rename = "InstrumentType", default)]
    instrument_type: String,
    #[serde(rename = "DeviceNumber", default)]
    device_number: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "COMPort", default)]
    com_port: String,
    #[serde(rename = "OtherParams", default)]
    other_params: String,
}

/// Load an instrument table from disk.
pub fn load_instrument_table(path: &Path) -> Result<HardwareConfig> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open instrument table {}", path.display()))?;
    parse_instrument_table(file)
        .with_context(|| format!("in instrument table {}", path.display()))
}

/// Parse an instrument table. Unknown instrument types are skipped with a
/// warning; malformed parameters fail the load.
pub fn parse_instrument_table<R: Read>(input: R) -> Result<HardwareConfig> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(input);

    let mut config = HardwareConfig::default();
    for (index, record) in reader.deserialize::<InstrumentRow>().enumerate() {
        let row = index + 1;
        let record = record.with_context(|| format!("row {row}"))?;
        if record.instrument_type.is_empty() {
            continue;
        }
        match device_from_row(&record).with_context(|| format!("row {row} ({})", record.instrument_type))? {
            Some(device) => {
                tracing::debug!(
                    name = %device.name,
                    driver = device.driver.driver_name(),
                    label = %record.name,
                    "instrument row"
                );
                config.devices.push(device);
            }
            None => tracing::warn!(
                row,
                instrument_type = %record.instrument_type,
                "unknown instrument type, row skipped"
            ),
        }
    }
    Ok(config)
}

fn device_from_row(row: &InstrumentRow) -> Result<Option<DeviceConfig>> {
    let params = Params(parse_kv_params(&row.other_params));
    let number = normalise_number(&row.device_number);
    let port = row.com_port.clone();
    let baud = params.get::<u32>("baud")?;

    let (prefix, driver) = match row.instrument_type.as_str() {
        "GX281" => (
            "GX281",
            DriverType::Gx281 {
                port,
                unit: params.get("unit")?.unwrap_or(25),
                rack: params.rack()?.unwrap_or(RackType::R204),
                baud,
            },
        ),
        "Pump" => (
            "Pump",
            DriverType::ViciM6 {
                port,
                baud,
                policy: params.get::<PolicyParam>("policy")?.map(|p| p.0),
            },
        ),
        "Valve6Way" | "Valve10Way" | "Valve24Way" => {
            let valve = match row.instrument_type.as_str() {
                "Valve6Way" => ValveKind::SixWay,
                "Valve10Way" => ValveKind::TenWay,
                _ => ValveKind::TwentyFourWay,
            };
            ("Valve", DriverType::ViciValve { port, valve, baud })
        }
        "Temperature" => (
            "TC720",
            DriverType::Tc720 {
                port,
                baud,
                min_c: params.get("min_c")?,
                max_c: params.get("max_c")?,
            },
        ),
        "HarvardPump" => (
            "HarvardPump",
            DriverType::PhdUltra {
                port,
                address: params.get("address")?.unwrap_or(0),
                baud,
            },
        ),
        "Ender3" => ("Ender3", DriverType::Ender3 { port, baud }),
        "MockValve" => (
            "Valve",
            DriverType::MockValve {
                positions: params.get("positions")?.unwrap_or(6),
            },
        ),
        "MockPump" => ("Pump", DriverType::MockPump),
        "MockSyringePump" => ("HarvardPump", DriverType::MockSyringePump),
        "MockTemperature" => (
            "TC720",
            DriverType::MockTemperature {
                initial_c: params.get("initial_c")?.unwrap_or(25.0),
            },
        ),
        "MockLiquidHandler" => (
            "GX281",
            DriverType::MockLiquidHandler {
                rack: params.rack()?.unwrap_or(RackType::R204),
            },
        ),
        "MockSpectrometer" => (
            "Spectrometer",
            DriverType::MockSpectrometer {
                pixels: params.get("pixels")?.unwrap_or(1024),
            },
        ),
        _ => return Ok(None),
    };

    let name = match number {
        Some(n) => format!("{prefix}_{n}"),
        None => prefix.to_string(),
    };
    Ok(Some(DeviceConfig {
        name,
        driver,
        timeout_ms: params.get("timeout_ms")?,
    }))
}

/// `"2"`, `"2.0"` (spreadsheet export) → `"2"`; empty → `None`.
fn normalise_number(cell: &str) -> Option<String> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    let cell = cell.strip_suffix(".0").unwrap_or(cell);
    Some(cell.to_string())
}

struct Params(BTreeMap<String, String>);

impl Params {
    fn get<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.0.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("invalid value '{raw}' for {key}")),
        }
    }

    fn rack(&self) -> Result<Option<RackType>> {
        match self.0.get("rack") {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|e| anyhow!("{e}")),
        }
    }
}

struct PolicyParam(UncalibratedPolicy);

impl FromStr for PolicyParam {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fallback" => Ok(Self(UncalibratedPolicy::Fallback)),
            "reject" => Ok(Self(UncalibratedPolicy::Reject)),
            other => bail!("unknown policy '{other}'"),
        }
    }
}
