//! Typed per-action parameters.
//!
//! [`Action::from_command`] validates a [`Command`]'s string parameters once,
//! at the dispatcher boundary. Everything downstream works with numbers and
//! enums.

use chemflow_core::capabilities::{PumpDirection, Sensor};
use chemflow_core::geometry::RackType;
use chemflow_core::{LabError, LabResult};

use crate::command::{Command, Component};

/// Numeric device id from a command (`pump_id=2` addresses `Pump_2`).
pub type DeviceId = u32;

/// Which valves a valve command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveTarget {
    /// One valve by id
    One(DeviceId),
    /// Every registered valve (`valve_id=-1` or `valve_id=all`)
    All,
}

/// Lateral move target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum XyTarget {
    /// Above a well of the deck
    Well {
        /// Bed slot
        bed: u8,
        /// 1-based well
        well: usize,
    },
    /// Raw coordinates (mm)
    Point {
        /// X (mm)
        x: f64,
        /// Y (mm)
        y: f64,
    },
}

/// Vertical move target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZTarget {
    /// The rack's well depth
    Well {
        /// Bed slot
        bed: u8,
        /// 1-based well
        well: usize,
    },
    /// Absolute height (mm)
    Height(f64),
}

/// A validated command.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Wait for every background operation
    WaitForPumps,
    /// Change a temperature set point
    SetTemperature {
        /// Controller id
        id: DeviceId,
        /// Set point (°C)
        celsius: f64,
    },
    /// Read one sensor
    ReadTemperature {
        /// Controller id
        id: DeviceId,
        /// Sensor input
        sensor: Sensor,
    },
    /// Select a valve port
    ValveGoTo {
        /// Valve(s)
        target: ValveTarget,
        /// Port number
        position: u8,
    },
    /// Home a valve
    ValveHome {
        /// Valve(s)
        target: ValveTarget,
    },
    /// Background flow-pump run
    Pump {
        /// Pump id
        id: DeviceId,
        /// Aspirate or dispense
        direction: PumpDirection,
        /// Flow rate (µL/min); non-positive runs are skipped
        rate_ul_min: f64,
        /// Volume (µL); non-positive runs are skipped
        volume_ul: f64,
    },
    /// Load a syringe size
    SelectSyringe {
        /// Pump id
        id: DeviceId,
        /// Syringe size (mL)
        size_ml: f64,
    },
    /// Background infusion
    Infuse {
        /// Pump id
        id: DeviceId,
        /// Volume (µL)
        volume_ul: f64,
        /// Rate (µL/min)
        rate_ul_min: f64,
    },
    /// Halt a syringe pump
    StopSyringe {
        /// Pump id
        id: DeviceId,
    },
    /// Replace the rack on a bed
    SetBedLayout {
        /// Handler id
        id: DeviceId,
        /// Bed slot
        bed: u8,
        /// New rack
        rack: RackType,
    },
    /// Home a liquid handler
    Home {
        /// Handler id
        id: DeviceId,
    },
    /// Interlocked lateral move
    MoveXy {
        /// Handler id
        id: DeviceId,
        /// Destination
        target: XyTarget,
    },
    /// Vertical move
    MoveZ {
        /// Handler id
        id: DeviceId,
        /// Destination
        target: ZTarget,
    },
}

struct Params<'a> {
    command: &'a Command,
}

impl<'a> Params<'a> {
    fn invalid(&self, message: impl std::fmt::Display) -> LabError {
        LabError::validation(format!(
            "{}/{}: {message}",
            self.command.component, self.command.action
        ))
    }

    fn raw(&self, keys: &[&str]) -> Option<&'a str> {
        keys.iter().find_map(|key| self.command.get(key))
    }

    fn number(&self, keys: &[&str]) -> LabResult<Option<f64>> {
        match self.raw(keys) {
            None => Ok(None),
            Some(raw) => match raw.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(Some(value)),
                _ => Err(self.invalid(format!("'{}' is not a number: {raw:?}", keys[0]))),
            },
        }
    }

    fn required(&self, keys: &[&str]) -> LabResult<f64> {
        self.number(keys)?
            .ok_or_else(|| self.invalid(format!("missing parameter '{}'", keys[0])))
    }

    /// Integer parameter; accepts `"3"` and `"3.0"`.
    fn integer(&self, keys: &[&str]) -> LabResult<Option<i64>> {
        match self.number(keys)? {
            None => Ok(None),
            Some(value) if value.fract() == 0.0 => Ok(Some(value as i64)),
            Some(value) => Err(self.invalid(format!("'{}' must be a whole number, got {value}", keys[0]))),
        }
    }

    fn bounded<T: TryFrom<i64>>(&self, keys: &[&str], default: Option<T>) -> LabResult<T> {
        match self.integer(keys)? {
            Some(value) => T::try_from(value)
                .map_err(|_| self.invalid(format!("'{}' out of range: {value}", keys[0]))),
            None => default.ok_or_else(|| self.invalid(format!("missing parameter '{}'", keys[0]))),
        }
    }

    fn id(&self, keys: &[&str], default: Option<DeviceId>) -> LabResult<DeviceId> {
        self.bounded(keys, default)
    }

    fn bed_well(&self) -> LabResult<Option<(u8, usize)>> {
        match (self.raw(&["bed"]), self.raw(&["well"])) {
            (None, None) => Ok(None),
            _ => Ok(Some((self.bounded(&["bed"], None)?, self.bounded(&["well"], None)?))),
        }
    }

    fn valve_target(&self) -> LabResult<ValveTarget> {
        match self.raw(&["valve_id"]) {
            Some(raw) if raw.eq_ignore_ascii_case("all") => Ok(ValveTarget::All),
            _ => match self.integer(&["valve_id"])? {
                Some(-1) => Ok(ValveTarget::All),
                Some(_) | None => Ok(ValveTarget::One(self.id(&["valve_id"], Some(1))?)),
            },
        }
    }
}

impl Action {
    /// Validate `command` into a typed action.
    ///
    /// # Errors
    /// `NotFound` for an unknown component, `Validation` for an unknown action
    /// or a missing or malformed parameter.
    pub fn from_command(command: &Command) -> LabResult<Self> {
        let p = Params { command };
        let action = command.action.trim();
        let component = command.component();
        let unknown_action = || p.invalid("unknown action");

        match component {
            Component::Sync => match action {
                "wait_for_pumps" => Ok(Action::WaitForPumps),
                _ => Err(unknown_action()),
            },

            Component::Temperature => {
                let id = p.id(&["temp_id", "id"], Some(1))?;
                match action {
                    "set_temperature" => Ok(Action::SetTemperature {
                        id,
                        celsius: p.required(&["temp", "temperature"])?,
                    }),
                    "read_temperature" => Ok(Action::ReadTemperature {
                        id,
                        sensor: Sensor::try_from(p.bounded::<i64>(&["sensor"], Some(1))?)?,
                    }),
                    _ => Err(unknown_action()),
                }
            }

            Component::Valve(_) => {
                let target = p.valve_target()?;
                match action {
                    "go_to_position" => Ok(Action::ValveGoTo {
                        target,
                        position: p.bounded(&["position"], None)?,
                    }),
                    "move_home" | "home" => Ok(Action::ValveHome { target }),
                    _ => Err(unknown_action()),
                }
            }

            Component::Pump => {
                let direction = action.parse::<PumpDirection>().map_err(|_| unknown_action())?;
                Ok(Action::Pump {
                    id: p.id(&["pump_id"], None)?,
                    direction,
                    rate_ul_min: p.required(&["flow_rate"])?,
                    volume_ul: p.required(&["volume"])?,
                })
            }

            Component::HarvardPump => {
                let id = p.id(&["pump_id"], None)?;
                match action {
                    "select_syringe" => Ok(Action::SelectSyringe {
                        id,
                        size_ml: p.required(&["syringe"])?,
                    }),
                    "infuse" => Ok(Action::Infuse {
                        id,
                        volume_ul: p.required(&["volume"])?,
                        rate_ul_min: p.required(&["rate", "flow_rate"])?,
                    }),
                    "stop" => Ok(Action::StopSyringe { id }),
                    _ => Err(unknown_action()),
                }
            }

            Component::Gx281 | Component::Ender3 => {
                let id = p.id(&["handler_id", "id"], Some(1))?;
                match action {
                    "set_bedlayout" => {
                        let code: u16 = p.bounded(&["rack_layout", "rack"], None)?;
                        Ok(Action::SetBedLayout {
                            id,
                            bed: p.bounded(&["bed"], None)?,
                            rack: RackType::try_from(code)?,
                        })
                    }
                    "move_home" | "home" => Ok(Action::Home { id }),
                    "move_z_height" => Ok(Action::MoveZ {
                        id,
                        target: ZTarget::Height(p.required(&["height", "z"])?),
                    }),
                    "move_xy" => {
                        let target = match p.bed_well()? {
                            Some((bed, well)) => XyTarget::Well { bed, well },
                            None => XyTarget::Point {
                                x: p.required(&["x"])?,
                                y: p.required(&["y"])?,
                            },
                        };
                        Ok(Action::MoveXy { id, target })
                    }
                    "move_z" => {
                        let target = match p.bed_well()? {
                            Some((bed, well)) => ZTarget::Well { bed, well },
                            None => ZTarget::Height(p.required(&["z", "height"])?),
                        };
                        Ok(Action::MoveZ { id, target })
                    }
                    _ => Err(unknown_action()),
                }
            }

            Component::Unknown(tag) => Err(LabError::not_found(format!(
                "unknown component '{tag}'"
            ))),
        }
    }

    /// Whether the action runs in the background.
    pub fn is_background(&self) -> bool {
        matches!(self, Action::Pump { .. } | Action::Infuse { .. })
    }
}
