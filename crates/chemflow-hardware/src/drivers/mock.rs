//! Mock Hardware Implementations
//!
//! Simulated devices for every capability, for running methods and tests
//! without a bench. Timed operations sleep on the tokio clock, so tests with a
//! paused clock complete instantly.
//!
//! Every mock records its calls in a [`CallLog`] (`"go_to_position 3"`,
//! `"travel_z 125"`, ...) and can be told to fail a named operation with a
//! `Hardware` error.

use async_trait::async_trait;
use chemflow_core::capabilities::{
    check_position, nominal_travel_time, Envelope, FlowPump, LiquidHandler, PumpDirection,
    PumpReport, SelectorValve, Sensor, Spectrometer, Spectrum, SyringePump,
    TemperatureController, XyReading,
};
use chemflow_core::geometry::{Deck, RackType};
use chemflow_core::{ConnectionCell, ConnectionState, Device, LabError, LabResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;

use super::phd_ultra::{syringe_diameter, AIR_TITE_SYRINGES};
use super::tc720::SafeRange;

// =============================================================================
// Call log
// =============================================================================

/// Recorded calls plus failure injection.
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl CallLog {
    /// Record `call`; fails if its operation name was passed to [`fail_on`](Self::fail_on).
    pub fn record(&self, device: &str, call: impl Into<String>) -> LabResult<()> {
        let call = call.into();
        let operation = call.split_whitespace().next().unwrap_or_default().to_string();
        self.calls.lock().push(call);
        if self.failing.lock().contains(&operation) {
            return Err(LabError::hardware(device, format!("injected {operation} failure")));
        }
        Ok(())
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Make every later `operation` call fail.
    pub fn fail_on(&self, operation: &str) {
        self.failing.lock().insert(operation.to_string());
    }

    /// Stop failing `operation`.
    pub fn clear_failure(&self, operation: &str) {
        self.failing.lock().remove(operation);
    }
}

macro_rules! mock_device {
    ($ty:ty, $kind:literal) => {
        #[async_trait]
        impl Device for $ty {
            fn name(&self) -> &str {
                &self.name
            }

            fn state(&self) -> ConnectionState {
                self.state.get()
            }

            async fn connect(&self) -> LabResult<()> {
                self.log.record(&self.name, "connect")?;
                self.state.set(ConnectionState::Connected);
                tracing::info!(device = %self.name, kind = $kind, "mock device connected");
                Ok(())
            }

            async fn close(&self) -> LabResult<()> {
                self.state.set(ConnectionState::Disconnected);
                self.log.record(&self.name, "close")
            }

            async fn stop(&self) -> LabResult<()> {
                self.log.record(&self.name, "stop")
            }
        }

        impl $ty {
            /// Calls recorded so far.
            pub fn log(&self) -> &CallLog {
                &self.log
            }
        }
    };
}

// =============================================================================
// MockValve
// =============================================================================

/// Simulated selector valve.
pub struct MockValve {
    name: String,
    state: ConnectionCell,
    log: CallLog,
    positions: u8,
    position: Mutex<u8>,
}

impl MockValve {
    /// Valve with `positions` ports, resting at port 1.
    pub fn new(name: impl Into<String>, positions: u8) -> Self {
        Self {
            name: name.into(),
            state: ConnectionCell::new(),
            log: CallLog::default(),
            positions,
            position: Mutex::new(1),
        }
    }

    fn step(&self, forward: bool) -> u8 {
        let current = *self.position.lock();
        match (forward, current) {
            (true, p) if p >= self.positions => 1,
            (true, p) => p + 1,
            (false, 1) => self.positions,
            (false, p) => p - 1,
        }
    }
}

mock_device!(MockValve, "valve");

#[async_trait]
impl SelectorValve for MockValve {
    fn positions(&self) -> u8 {
        self.positions
    }

    async fn home(&self) -> LabResult<()> {
        self.log.record(&self.name, "home")?;
        *self.position.lock() = 1;
        Ok(())
    }

    async fn go_to_position(&self, position: u8) -> LabResult<()> {
        check_position(&self.name, position, self.positions)?;
        self.log.record(&self.name, format!("go_to_position {position}"))?;
        *self.position.lock() = position;
        Ok(())
    }

    async fn current_position(&self) -> LabResult<u8> {
        self.log.record(&self.name, "current_position")?;
        Ok(*self.position.lock())
    }

    async fn move_clockwise(&self, position: Option<u8>) -> LabResult<()> {
        let target = match position {
            Some(p) => {
                check_position(&self.name, p, self.positions)?;
                p
            }
            None => self.step(true),
        };
        self.log.record(&self.name, format!("move_clockwise {target}"))?;
        *self.position.lock() = target;
        Ok(())
    }

    async fn move_counterclockwise(&self, position: Option<u8>) -> LabResult<()> {
        let target = match position {
            Some(p) => {
                check_position(&self.name, p, self.positions)?;
                p
            }
            None => self.step(false),
        };
        self.log.record(&self.name, format!("move_counterclockwise {target}"))?;
        *self.position.lock() = target;
        Ok(())
    }
}

// =============================================================================
// MockPump
// =============================================================================

/// Simulated flow pump; every run takes its nominal travel time.
pub struct MockPump {
    name: String,
    state: ConnectionCell,
    log: CallLog,
    operation: tokio::sync::Mutex<()>,
}

impl MockPump {
    /// New mock pump.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ConnectionCell::new(),
            log: CallLog::default(),
            operation: tokio::sync::Mutex::new(()),
        }
    }
}

mock_device!(MockPump, "pump");

#[async_trait]
impl FlowPump for MockPump {
    async fn pump(
        &self,
        direction: PumpDirection,
        rate_ul_min: f64,
        volume_ul: f64,
    ) -> LabResult<PumpReport> {
        if !(rate_ul_min.is_finite() && rate_ul_min > 0.0 && volume_ul.is_finite() && volume_ul > 0.0)
        {
            return Err(LabError::validation(format!(
                "rate and volume must be positive, got {rate_ul_min} uL/min and {volume_ul} uL"
            )));
        }
        let _operation = self.operation.lock().await;
        self.log
            .record(&self.name, format!("pump {direction} {rate_ul_min} {volume_ul}"))?;
        let elapsed = nominal_travel_time(rate_ul_min, volume_ul);
        tokio::time::sleep(elapsed).await;
        Ok(PumpReport {
            direction,
            requested_ul: volume_ul,
            delivered_ul: volume_ul,
            realized_rate_ul_min: rate_ul_min,
            calibrated: true,
            elapsed,
        })
    }
}

// =============================================================================
// MockSyringePump
// =============================================================================

/// Simulated syringe pump using the Air-Tite catalogue.
pub struct MockSyringePump {
    name: String,
    state: ConnectionCell,
    log: CallLog,
    syringe_ml: Mutex<Option<f64>>,
    operation: tokio::sync::Mutex<()>,
}

impl MockSyringePump {
    /// New mock syringe pump with no syringe selected.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ConnectionCell::new(),
            log: CallLog::default(),
            syringe_ml: Mutex::new(None),
            operation: tokio::sync::Mutex::new(()),
        }
    }

    /// Selected syringe size (mL).
    pub fn syringe(&self) -> Option<f64> {
        *self.syringe_ml.lock()
    }
}

mock_device!(MockSyringePump, "syringe_pump");

#[async_trait]
impl SyringePump for MockSyringePump {
    async fn select_syringe(&self, size_ml: f64) -> LabResult<()> {
        if syringe_diameter(size_ml).is_none() {
            let sizes: Vec<f64> = AIR_TITE_SYRINGES.iter().map(|(size, _)| *size).collect();
            return Err(LabError::validation(format!(
                "unsupported syringe size {size_ml} mL; choose from {sizes:?}"
            )));
        }
        self.log.record(&self.name, format!("select_syringe {size_ml}"))?;
        *self.syringe_ml.lock() = Some(size_ml);
        Ok(())
    }

    async fn infuse(&self, volume_ul: f64, rate_ul_min: f64) -> LabResult<()> {
        if !(rate_ul_min > 0.0 && volume_ul > 0.0) {
            return Err(LabError::validation(format!(
                "infusion needs positive volume and rate, got {volume_ul} uL at {rate_ul_min} uL/min"
            )));
        }
        let _operation = self.operation.lock().await;
        self.log
            .record(&self.name, format!("infuse {volume_ul} {rate_ul_min}"))?;
        tokio::time::sleep(nominal_travel_time(rate_ul_min, volume_ul)).await;
        Ok(())
    }

    async fn withdraw(&self) -> LabResult<()> {
        let _operation = self.operation.lock().await;
        self.log.record(&self.name, "withdraw")
    }
}

// =============================================================================
// MockTemperatureController
// =============================================================================

/// Simulated temperature controller that reaches its set point instantly.
pub struct MockTemperatureController {
    name: String,
    state: ConnectionCell,
    log: CallLog,
    range: SafeRange,
    set_point: Mutex<f64>,
    ambient: f64,
}

impl MockTemperatureController {
    /// Controller starting at `initial_c` with the default safe range.
    pub fn new(name: impl Into<String>, initial_c: f64) -> Self {
        Self {
            name: name.into(),
            state: ConnectionCell::new(),
            log: CallLog::default(),
            range: SafeRange::default(),
            set_point: Mutex::new(initial_c),
            ambient: 22.0,
        }
    }
}

mock_device!(MockTemperatureController, "temperature");

#[async_trait]
impl TemperatureController for MockTemperatureController {
    async fn set_temperature(&self, celsius: f64) -> LabResult<f64> {
        if !(celsius.is_finite() && (self.range.min_c..=self.range.max_c).contains(&celsius)) {
            return Err(LabError::validation(format!(
                "set point {celsius} °C outside safe range {}..={} °C",
                self.range.min_c, self.range.max_c
            )));
        }
        self.log.record(&self.name, format!("set_temperature {celsius}"))?;
        *self.set_point.lock() = celsius;
        Ok(celsius)
    }

    async fn read_temperature(&self, sensor: Sensor) -> LabResult<f64> {
        self.log.record(&self.name, format!("read_temperature {sensor:?}"))?;
        Ok(match sensor {
            Sensor::Input1 => *self.set_point.lock(),
            Sensor::Input2 => self.ambient,
        })
    }
}

// =============================================================================
// MockLiquidHandler
// =============================================================================

/// Simulated XYZ handler with the GX-281 envelope.
pub struct MockLiquidHandler {
    name: String,
    state: ConnectionCell,
    log: CallLog,
    deck: Deck,
    envelope: Envelope,
    safe_z: f64,
    motion: tokio::sync::Mutex<()>,
    position: Mutex<Option<(f64, f64, f64)>>,
}

impl MockLiquidHandler {
    /// Multi-bed handler with every bed holding `rack`, unhomed.
    pub fn new(name: impl Into<String>, rack: RackType) -> LabResult<Self> {
        let deck = if rack.is_single_bed() {
            Deck::single_bed(rack)?
        } else {
            Deck::multi_bed(rack)?
        };
        Ok(Self {
            name: name.into(),
            state: ConnectionCell::new(),
            log: CallLog::default(),
            deck,
            envelope: super::gx281::GX281_ENVELOPE,
            safe_z: super::gx281::GX281_SAFE_Z,
            motion: tokio::sync::Mutex::new(()),
            position: Mutex::new(None),
        })
    }

    /// Current position, `None` before homing.
    pub fn position(&self) -> Option<(f64, f64, f64)> {
        *self.position.lock()
    }
}

mock_device!(MockLiquidHandler, "liquid_handler");

#[async_trait]
impl LiquidHandler for MockLiquidHandler {
    fn safe_z(&self) -> f64 {
        self.safe_z
    }

    fn deck(&self) -> &Deck {
        &self.deck
    }

    fn motion_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.motion
    }

    async fn home_axes(&self) -> LabResult<()> {
        self.log.record(&self.name, "home")?;
        *self.position.lock() = Some((0.0, 0.0, self.safe_z));
        Ok(())
    }

    async fn travel_xy(&self, x: f64, y: f64) -> LabResult<(f64, f64)> {
        let (x, y) = self.envelope.clamp_xy(&self.name, x, y);
        self.log.record(&self.name, format!("travel_xy {x} {y}"))?;
        let mut position = self.position.lock();
        let z = position.map_or(self.safe_z, |(_, _, z)| z);
        *position = Some((x, y, z));
        Ok((x, y))
    }

    async fn travel_z(&self, z: f64) -> LabResult<f64> {
        let z = self.envelope.clamp_z(&self.name, z);
        self.log.record(&self.name, format!("travel_z {z}"))?;
        let mut position = self.position.lock();
        let (x, y) = position.map_or((0.0, 0.0), |(x, y, _)| (x, y));
        *position = Some((x, y, z));
        Ok(z)
    }

    async fn read_xy(&self) -> LabResult<XyReading> {
        Ok(match *self.position.lock() {
            Some((x, y, _)) => XyReading::At { x, y },
            None => XyReading::NotReady,
        })
    }

    async fn read_z(&self) -> LabResult<Option<f64>> {
        Ok(self.position.lock().map(|(_, _, z)| z))
    }
}

// =============================================================================
// MockSpectrometer
// =============================================================================

/// Simulated UV/Vis spectrometer returning a fixed absorption band.
pub struct MockSpectrometer {
    name: String,
    state: ConnectionCell,
    log: CallLog,
    pixels: usize,
}

impl MockSpectrometer {
    /// Spectrometer with `pixels` points over 200–800 nm.
    pub fn new(name: impl Into<String>, pixels: usize) -> Self {
        Self {
            name: name.into(),
            state: ConnectionCell::new(),
            log: CallLog::default(),
            pixels: pixels.max(2),
        }
    }
}

mock_device!(MockSpectrometer, "spectrometer");

#[async_trait]
impl Spectrometer for MockSpectrometer {
    async fn acquire(&self, integration: Duration) -> LabResult<Spectrum> {
        self.log
            .record(&self.name, format!("acquire {}", integration.as_millis()))?;
        tokio::time::sleep(integration).await;

        let step = 600.0 / (self.pixels - 1) as f64;
        let wavelengths_nm: Vec<f64> = (0..self.pixels).map(|i| 200.0 + i as f64 * step).collect();
        let scale = integration.as_secs_f64() * 1000.0;
        // lamp baseline with a band at 450 nm
        let intensities = wavelengths_nm
            .iter()
            .map(|nm| {
                let band = (-((nm - 450.0) / 25.0).powi(2)).exp();
                scale * (1.0 - 0.8 * band)
            })
            .collect();
        Ok(Spectrum {
            wavelengths_nm,
            intensities,
            integration,
        })
    }
}
