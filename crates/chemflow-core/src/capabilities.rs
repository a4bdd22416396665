//! Capability traits for the device kinds on the bench.
//!
//! Each trait extends [`Device`] with the operations of one kind of
//! instrument. Drivers implement exactly the capabilities they support, and the
//! dispatcher works against `Arc<dyn Capability>` handles from the registry.
//!
//! # Design
//!
//! Each capability trait:
//! - Is async (`#[async_trait]`)
//! - Is thread-safe (`Send + Sync` via [`Device`])
//! - Returns [`LabResult`] so the dispatcher can classify failures
//!
//! # Liquid-handler interlock
//!
//! [`LiquidHandler`] splits motion into raw primitives (`travel_xy`,
//! `travel_z`) and provided operations (`move_xy`, `move_z`, `move_to_well`).
//! The provided `move_xy` always raises the needle to the safe height before a
//! lateral move unless Z is known to be at or above it, and holds the handler's
//! motion lock for the whole sequence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::device::Device;
use crate::error::{LabError, LabResult};
use crate::geometry::{Deck, RackType, Well};

// =============================================================================
// Pumps
// =============================================================================

/// Direction of a flow-pump run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpDirection {
    /// Draw liquid in (negative step count)
    Aspirate,
    /// Push liquid out (positive step count)
    Dispense,
}

impl PumpDirection {
    /// Sign applied to the step count.
    pub fn multiplier(self) -> i64 {
        match self {
            PumpDirection::Aspirate => -1,
            PumpDirection::Dispense => 1,
        }
    }
}

impl std::str::FromStr for PumpDirection {
    type Err = LabError;

    fn from_str(s: &str) -> LabResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aspirate" | "aspirating" => Ok(PumpDirection::Aspirate),
            "dispense" | "dispensing" => Ok(PumpDirection::Dispense),
            other => Err(LabError::validation(format!(
                "unknown pump direction '{other}' (expected aspirate or dispense)"
            ))),
        }
    }
}

impl std::fmt::Display for PumpDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PumpDirection::Aspirate => write!(f, "aspirate"),
            PumpDirection::Dispense => write!(f, "dispense"),
        }
    }
}

/// Outcome of one flow-pump run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpReport {
    /// Direction of the run
    pub direction: PumpDirection,
    /// Volume requested (µL)
    pub requested_ul: f64,
    /// Volume derived from the measured step delta (µL)
    pub delivered_ul: f64,
    /// Delivered volume over the wall time of the run (µL/min)
    pub realized_rate_ul_min: f64,
    /// Whether the (rate, direction) pair had a calibration entry
    pub calibrated: bool,
    /// Wall time spent in the run
    pub elapsed: Duration,
}

/// Nominal travel time for `volume_ul` at `rate_ul_min`.
///
/// Returns zero for non-positive inputs.
pub fn nominal_travel_time(rate_ul_min: f64, volume_ul: f64) -> Duration {
    if rate_ul_min > 0.0 && volume_ul > 0.0 && rate_ul_min.is_finite() && volume_ul.is_finite() {
        Duration::from_secs_f64(volume_ul / rate_ul_min * 60.0)
    } else {
        Duration::ZERO
    }
}

/// Continuous-flow stepper pump.
#[async_trait]
pub trait FlowPump: Device {
    /// Move `volume_ul` at `rate_ul_min` in `direction` and block until the
    /// move has settled.
    ///
    /// # Errors
    /// `Validation` for non-positive rate or volume, before any I/O.
    async fn pump(
        &self,
        direction: PumpDirection,
        rate_ul_min: f64,
        volume_ul: f64,
    ) -> LabResult<PumpReport>;

    /// Expected duration of a run, used for scheduling and run-log notes.
    fn estimate(&self, rate_ul_min: f64, volume_ul: f64) -> Duration {
        nominal_travel_time(rate_ul_min, volume_ul)
    }
}

/// Syringe pump driven by volume and rate targets.
#[async_trait]
pub trait SyringePump: Device {
    /// Configure for a syringe size (mL). Unknown sizes are a `Validation` error.
    async fn select_syringe(&self, size_ml: f64) -> LabResult<()>;

    /// Infuse `volume_ul` at `rate_ul_min` and wait for the nominal duration.
    async fn infuse(&self, volume_ul: f64, rate_ul_min: f64) -> LabResult<()>;

    /// Start a withdrawal with the currently configured parameters.
    async fn withdraw(&self) -> LabResult<()>;
}

// =============================================================================
// Valves
// =============================================================================

/// Multi-position selector valve.
#[async_trait]
pub trait SelectorValve: Device {
    /// Number of positions.
    fn positions(&self) -> u8;

    /// Return to position 1.
    async fn home(&self) -> LabResult<()>;

    /// Move to `position` (1..=positions). Out-of-range is rejected locally.
    async fn go_to_position(&self, position: u8) -> LabResult<()>;

    /// Query the current position.
    async fn current_position(&self) -> LabResult<u8>;

    /// Step clockwise, to `position` if given, else by one.
    async fn move_clockwise(&self, position: Option<u8>) -> LabResult<()>;

    /// Step counterclockwise, to `position` if given, else by one.
    async fn move_counterclockwise(&self, position: Option<u8>) -> LabResult<()>;
}

/// Check a requested valve position against the valve's position count.
pub fn check_position(device: &str, position: u8, positions: u8) -> LabResult<()> {
    if (1..=positions).contains(&position) {
        Ok(())
    } else {
        Err(LabError::validation(format!(
            "{device}: position {position} out of range 1-{positions}"
        )))
    }
}

// =============================================================================
// Temperature
// =============================================================================

/// Temperature-controller sensor input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sensor {
    /// Control sensor
    Input1,
    /// Secondary sensor
    Input2,
}

impl TryFrom<i64> for Sensor {
    type Error = LabError;

    fn try_from(value: i64) -> LabResult<Self> {
        match value {
            1 => Ok(Sensor::Input1),
            2 => Ok(Sensor::Input2),
            other => Err(LabError::validation(format!(
                "sensor {other} does not exist (expected 1 or 2)"
            ))),
        }
    }
}

/// Set-point temperature controller.
#[async_trait]
pub trait TemperatureController: Device {
    /// Set the target temperature (°C). Returns the set point the device echoed.
    async fn set_temperature(&self, celsius: f64) -> LabResult<f64>;

    /// Read the temperature (°C) of one sensor.
    async fn read_temperature(&self, sensor: Sensor) -> LabResult<f64>;
}

// =============================================================================
// Liquid handlers
// =============================================================================

/// Result of an XY position query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum XyReading {
    /// Arm is at rest at this coordinate
    At {
        /// X (mm)
        x: f64,
        /// Y (mm)
        y: f64,
    },
    /// Arm is not homed or still moving
    NotReady,
}

/// XYZ needle robot with a bed/well deck.
#[async_trait]
pub trait LiquidHandler: Device {
    /// Height (mm) at which lateral moves are safe.
    fn safe_z(&self) -> f64;

    /// Deck of bed layouts.
    fn deck(&self) -> &Deck;

    /// Lock serializing motion sequences on this handler.
    fn motion_lock(&self) -> &tokio::sync::Mutex<()>;

    /// Last commanded Z, if the driver tracks it.
    fn tracked_z(&self) -> Option<f64> {
        None
    }

    /// Home all axes. Called with the motion lock held.
    async fn home_axes(&self) -> LabResult<()>;

    /// Raw lateral move without the interlock. Returns the clamped target.
    async fn travel_xy(&self, x: f64, y: f64) -> LabResult<(f64, f64)>;

    /// Raw vertical move. Returns the clamped target.
    async fn travel_z(&self, z: f64) -> LabResult<f64>;

    /// Query the XY position.
    async fn read_xy(&self) -> LabResult<XyReading>;

    /// Query the Z position. `None` when the arm is not ready.
    async fn read_z(&self) -> LabResult<Option<f64>>;

    /// Raise to the safe height unless Z is known to be at or above it.
    ///
    /// Must be called with the motion lock held.
    async fn raise_to_safe_z(&self) -> LabResult<()> {
        let safe = self.safe_z();
        let z = match self.tracked_z() {
            Some(z) => Some(z),
            None => self.read_z().await?,
        };
        if z.map_or(true, |z| z < safe) {
            tracing::debug!(device = self.name(), ?z, safe, "raising to safe height");
            self.travel_z(safe).await?;
        }
        Ok(())
    }

    /// Home all axes.
    async fn home(&self) -> LabResult<()> {
        let _motion = self.motion_lock().lock().await;
        self.home_axes().await
    }

    /// Lateral move behind the safe-height interlock.
    async fn move_xy(&self, x: f64, y: f64) -> LabResult<(f64, f64)> {
        let _motion = self.motion_lock().lock().await;
        self.raise_to_safe_z().await?;
        self.travel_xy(x, y).await
    }

    /// Vertical move.
    async fn move_z(&self, z: f64) -> LabResult<f64> {
        let _motion = self.motion_lock().lock().await;
        self.travel_z(z).await
    }

    /// Replace the rack on one bed.
    async fn set_bed_layout(&self, bed: u8, rack: RackType) -> LabResult<()> {
        self.deck().set_layout(bed, rack)
    }

    /// Move above a well (interlocked XY move).
    async fn move_to_well(&self, bed: u8, well: usize) -> LabResult<Well> {
        let target = self.deck().well(bed, well)?;
        self.move_xy(target.x, target.y).await?;
        Ok(target)
    }

    /// Move above a well, then lower to the rack's well depth.
    async fn lower_to_well(&self, bed: u8, well: usize) -> LabResult<Well> {
        let target = self.deck().well(bed, well)?;
        let _motion = self.motion_lock().lock().await;
        self.raise_to_safe_z().await?;
        self.travel_xy(target.x, target.y).await?;
        self.travel_z(target.z).await?;
        Ok(target)
    }
}

/// Clamp `value` into `[min, max]`, reporting whether it was changed.
pub fn clamp_axis(value: f64, min: f64, max: f64) -> (f64, bool) {
    let clamped = value.clamp(min, max);
    (clamped, clamped != value)
}

/// Travel limits of a three-axis handler (mm).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// X range
    pub x: (f64, f64),
    /// Y range
    pub y: (f64, f64),
    /// Z range
    pub z: (f64, f64),
}

impl Envelope {
    /// Clamp an XY target, warning when it leaves the envelope.
    pub fn clamp_xy(&self, device: &str, x: f64, y: f64) -> (f64, f64) {
        let (cx, x_changed) = clamp_axis(x, self.x.0, self.x.1);
        let (cy, y_changed) = clamp_axis(y, self.y.0, self.y.1);
        if x_changed || y_changed {
            tracing::warn!(device, x, y, clamped_x = cx, clamped_y = cy, "XY target clamped");
        }
        (cx, cy)
    }

    /// Clamp a Z target, warning when it leaves the envelope.
    pub fn clamp_z(&self, device: &str, z: f64) -> f64 {
        let (cz, changed) = clamp_axis(z, self.z.0, self.z.1);
        if changed {
            tracing::warn!(device, z, clamped_z = cz, "Z target clamped");
        }
        cz
    }
}

// =============================================================================
// Spectrometers
// =============================================================================

/// One acquired spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    /// Wavelength axis (nm)
    pub wavelengths_nm: Vec<f64>,
    /// Intensity per wavelength (counts)
    pub intensities: Vec<f64>,
    /// Integration time used
    pub integration: Duration,
}

/// UV/Vis detector.
#[async_trait]
pub trait Spectrometer: Device {
    /// Acquire one spectrum with the given integration time.
    async fn acquire(&self, integration: Duration) -> LabResult<Spectrum>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parses_both_verb_forms() {
        assert_eq!("Aspirating".parse::<PumpDirection>().unwrap(), PumpDirection::Aspirate);
        assert_eq!("dispense".parse::<PumpDirection>().unwrap(), PumpDirection::Dispense);
        assert!("pour".parse::<PumpDirection>().is_err());
        assert_eq!(PumpDirection::Aspirate.multiplier(), -1);
    }

    #[test]
    fn travel_time_is_volume_over_rate() {
        assert_eq!(nominal_travel_time(1000.0, 500.0), Duration::from_secs(30));
        assert_eq!(nominal_travel_time(0.0, 500.0), Duration::ZERO);
        assert_eq!(nominal_travel_time(100.0, -1.0), Duration::ZERO);
    }

    #[test]
    fn position_check_rejects_out_of_range() {
        assert!(check_position("Valve_1", 6, 6).is_ok());
        assert!(matches!(
            check_position("Valve_1", 41, 6),
            Err(LabError::Validation(_))
        ));
        assert!(check_position("Valve_1", 0, 6).is_err());
    }

    #[test]
    fn clamp_reports_changes() {
        assert_eq!(clamp_axis(750.0, 0.0, 700.0), (700.0, true));
        assert_eq!(clamp_axis(12.5, 0.0, 700.0), (12.5, false));
    }

    #[test]
    fn envelope_clamps_each_axis() {
        let envelope = Envelope {
            x: (0.0, 700.0),
            y: (0.0, 380.0),
            z: (0.0, 125.0),
        };
        assert_eq!(envelope.clamp_xy("GX281_1", -5.0, 400.0), (0.0, 380.0));
        assert_eq!(envelope.clamp_z("GX281_1", 90.0), 90.0);
        assert_eq!(envelope.clamp_z("GX281_1", 200.0), 125.0);
    }
}
