//! Flow-rate/volume to stepper-motion conversion for the VICI M6 pump.
//!
//! The pump head moves a fixed volume per microstep, but the effective
//! steps-per-µL drifts with speed and direction. A [`CalibrationTable`] holds the
//! measured values; rates without an entry fall back to a single constant or
//! are rejected, depending on the [`UncalibratedPolicy`].

use chemflow_core::capabilities::PumpDirection;
use chemflow_core::{LabError, LabResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Steps per µL used when a rate has no calibration entry.
pub const FALLBACK_STEPS_PER_UL: f64 = 2606.371104;

/// Rates closer than this (µL/min) to a table entry use that entry.
const RATE_TOLERANCE: f64 = 1e-6;

/// What to do when a (direction, rate) pair is not in the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncalibratedPolicy {
    /// Use [`FALLBACK_STEPS_PER_UL`] and flag the run as uncalibrated.
    #[default]
    Fallback,
    /// Refuse the run with a `Validation` error.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CalibrationPoint {
    rate_ul_min: f64,
    dispense: f64,
    aspirate: f64,
}

/// Measured steps-per-µL by rate and direction.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    points: Vec<CalibrationPoint>,
    fallback: f64,
}

impl CalibrationTable {
    /// Factory calibration of the bench M6 pump heads.
    pub fn vici_m6_default() -> Self {
        let point = |rate_ul_min, dispense, aspirate| CalibrationPoint {
            rate_ul_min,
            dispense,
            aspirate,
        };
        Self {
            points: vec![
                point(41.33, 2426.062, 2451.378376),
                point(200.0, 2426.062, 2451.378376),
                point(1000.0, 2494.720, 2606.371104),
                point(1500.0, 2584.774, 3166.612),
                point(2000.0, 2440.881, 2955.059),
            ],
            fallback: FALLBACK_STEPS_PER_UL,
        }
    }

    /// Calibrated steps-per-µL, if the rate is in the table.
    pub fn lookup(&self, direction: PumpDirection, rate_ul_min: f64) -> Option<f64> {
        self.points
            .iter()
            .find(|p| (p.rate_ul_min - rate_ul_min).abs() < RATE_TOLERANCE)
            .map(|p| match direction {
                PumpDirection::Dispense => p.dispense,
                PumpDirection::Aspirate => p.aspirate,
            })
    }

    /// Calibrated rates, ascending.
    pub fn rates(&self) -> Vec<f64> {
        let mut rates: Vec<f64> = self.points.iter().map(|p| p.rate_ul_min).collect();
        rates.sort_by(f64::total_cmp);
        rates
    }
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self::vici_m6_default()
    }
}

/// One planned pump move.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionProfile {
    /// Direction of the move
    pub direction: PumpDirection,
    /// Steps per µL used for the conversion
    pub steps_per_ul: f64,
    /// Whether `steps_per_ul` came from the table
    pub calibrated: bool,
    /// Max velocity (`VM`, steps/s)
    pub velocity: i64,
    /// Signed absolute move (`MA`, microsteps)
    pub total_steps: i64,
    /// Nominal duration of the move
    pub travel_time: Duration,
}

impl MotionProfile {
    /// Plan a move of `volume_ul` at `rate_ul_min`.
    ///
    /// # Errors
    /// `Validation` for a non-positive or non-finite rate or volume, or for an
    /// uncalibrated rate under [`UncalibratedPolicy::Reject`].
    pub fn compute(
        table: &CalibrationTable,
        policy: UncalibratedPolicy,
        direction: PumpDirection,
        rate_ul_min: f64,
        volume_ul: f64,
    ) -> LabResult<Self> {
        if !(rate_ul_min.is_finite() && rate_ul_min > 0.0) {
            return Err(LabError::validation(format!(
                "flow rate must be positive, got {rate_ul_min} uL/min"
            )));
        }
        if !(volume_ul.is_finite() && volume_ul > 0.0) {
            return Err(LabError::validation(format!(
                "volume must be positive, got {volume_ul} uL"
            )));
        }

        let (steps_per_ul, calibrated) = match (table.lookup(direction, rate_ul_min), policy) {
            (Some(spu), _) => (spu, true),
            (None, UncalibratedPolicy::Fallback) => {
                tracing::warn!(
                    rate_ul_min,
                    %direction,
                    fallback = table.fallback,
                    "no calibration entry, using fallback steps/uL"
                );
                (table.fallback, false)
            }
            (None, UncalibratedPolicy::Reject) => {
                return Err(LabError::validation(format!(
                    "no calibration for {direction} at {rate_ul_min} uL/min (calibrated rates: {:?})",
                    table.rates()
                )));
            }
        };

        let velocity = (steps_per_ul * rate_ul_min / 60.0).round() as i64;
        let total_steps = (steps_per_ul * volume_ul).round() as i64 * direction.multiplier();
        let travel_time = Duration::from_secs_f64(volume_ul / rate_ul_min * 60.0);

        Ok(Self {
            direction,
            steps_per_ul,
            calibrated,
            velocity,
            total_steps,
            travel_time,
        })
    }

    /// Flow rate commanded after velocity rounding (µL/min).
    pub fn commanded_rate(&self) -> f64 {
        self.velocity as f64 / self.steps_per_ul * 60.0
    }

    /// Volume moved for a measured step delta (µL).
    pub fn volume_for_steps(&self, steps: i64) -> f64 {
        steps.unsigned_abs() as f64 / self.steps_per_ul
    }
}

/// Flow rate achieved by a finished run (µL/min), from the measured volume
/// and wall time.
pub fn measured_rate(delivered_ul: f64, elapsed: Duration) -> f64 {
    let minutes = elapsed.as_secs_f64() / 60.0;
    if minutes > 0.0 {
        delivered_ul / minutes
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(direction: PumpDirection, rate: f64, volume: f64) -> LabResult<MotionProfile> {
        MotionProfile::compute(
            &CalibrationTable::vici_m6_default(),
            UncalibratedPolicy::Fallback,
            direction,
            rate,
            volume,
        )
    }

    #[test]
    fn calibrated_dispense_uses_table_entry() {
        let profile = plan(PumpDirection::Dispense, 1000.0, 500.0).unwrap();
        assert!(profile.calibrated);
        assert_eq!(profile.steps_per_ul, 2494.720);
        // 2494.72 * 1000 / 60 = 41578.67
        assert_eq!(profile.velocity, 41579);
        assert_eq!(profile.total_steps, 1_247_360);
        assert_eq!(profile.travel_time, Duration::from_secs(30));
    }

    #[test]
    fn aspirate_steps_are_negative() {
        let profile = plan(PumpDirection::Aspirate, 200.0, 10.0).unwrap();
        assert_eq!(profile.steps_per_ul, 2451.378376);
        assert_eq!(profile.total_steps, -24_514);
        assert!(profile.velocity > 0);
    }

    #[test]
    fn odd_calibration_rate_matches() {
        let profile = plan(PumpDirection::Dispense, 41.33, 1.0).unwrap();
        assert!(profile.calibrated);
    }

    #[test]
    fn uncalibrated_rate_falls_back_or_rejects() {
        let fallback = plan(PumpDirection::Dispense, 750.0, 100.0).unwrap();
        assert!(!fallback.calibrated);
        assert_eq!(fallback.steps_per_ul, FALLBACK_STEPS_PER_UL);

        let rejected = MotionProfile::compute(
            &CalibrationTable::default(),
            UncalibratedPolicy::Reject,
            PumpDirection::Dispense,
            750.0,
            100.0,
        );
        assert!(matches!(rejected, Err(LabError::Validation(_))));
    }

    #[test]
    fn non_positive_inputs_are_rejected() {
        assert!(plan(PumpDirection::Dispense, 0.0, 100.0).is_err());
        assert!(plan(PumpDirection::Dispense, -5.0, 100.0).is_err());
        assert!(plan(PumpDirection::Dispense, 1000.0, 0.0).is_err());
        assert!(plan(PumpDirection::Dispense, f64::NAN, 10.0).is_err());
    }

    #[test]
    fn commanded_rate_and_volume_round_trip_steps() {
        let profile = plan(PumpDirection::Dispense, 1500.0, 250.0).unwrap();
        assert!((profile.commanded_rate() - 1500.0).abs() < 0.05);
        let delivered = profile.volume_for_steps(profile.total_steps);
        assert!((delivered - 250.0).abs() < 0.001);
    }

    #[test]
    fn planning_is_deterministic() {
        for direction in [PumpDirection::Dispense, PumpDirection::Aspirate] {
            for rate in [41.33, 200.0, 750.0, 1000.0, 2000.0] {
                let first = plan(direction, rate, 123.4).unwrap();
                let second = plan(direction, rate, 123.4).unwrap();
                assert_eq!(first.velocity, second.velocity);
                assert_eq!(first.total_steps, second.total_steps);
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn measured_rate_follows_delivery() {
        assert!((measured_rate(500.0, Duration::from_secs(30)) - 1000.0).abs() < 1e-9);
        assert_eq!(measured_rate(0.0, Duration::from_secs(32)), 0.0);
        assert_eq!(measured_rate(10.0, Duration::ZERO), 0.0);
    }
}
