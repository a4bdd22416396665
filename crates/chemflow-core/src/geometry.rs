//! Bed and well geometry for liquid handlers.
//!
//! Maps an abstract `(rack type, bed, well)` triple to physical millimeter
//! coordinates. Everything here is pure and deterministic: the same triple
//! always produces the same coordinate.
//!
//! # Numbering
//!
//! Wells are numbered from 1, iterating X columns outer and Y rows inner, both
//! ascending. Rack 209 staggers every odd column by +8.5 mm in Y. The bed index
//! shifts the whole grid by a per-rack X offset (one per bed slot, 1–6). Rack
//! 304 sits on the single fixed bed of a 3-D-printer deck and has no offset.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{LabError, LabResult};

/// Number of physical bed slots on a multi-bed deck.
pub const MAX_BEDS: u8 = 6;

/// Supported rack types. Closed set: anything else is rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum RackType {
    /// 27 positions, 3 × 9
    R204,
    /// 75 positions, 5 × 15
    R207,
    /// 96 positions, 6 × 16, staggered
    R209,
    /// 20 positions, 5 × 4, single fixed bed
    R304,
}

enum YPitch {
    List(&'static [f64]),
    Uniform { start: f64, step: f64, count: usize },
}

struct RackSpec {
    x: &'static [f64],
    y: YPitch,
    z: f64,
    wells: usize,
    stagger: Option<f64>,
    bed_offsets: Option<[f64; MAX_BEDS as usize]>,
}

const RACK_204: RackSpec = RackSpec {
    x: &[0.0, 31.8, 63.6],
    y: YPitch::List(&[103.4, 135.2, 166.9, 198.7, 230.4, 262.1, 293.9, 325.6, 357.4]),
    z: 60.0,
    wells: 27,
    stagger: None,
    bed_offsets: Some([22.2, 141.8, 261.3, 380.9, 500.5, 620.0]),
};

const RACK_207: RackSpec = RackSpec {
    x: &[0.0, 19.3, 38.6, 57.9, 77.2],
    y: YPitch::List(&[
        95.0, 114.3, 133.6, 152.9, 172.2, 191.5, 210.8, 230.1, 249.4, 268.7, 288.0, 307.3, 326.6,
        345.9, 365.0,
    ]),
    z: 115.0,
    wells: 75,
    stagger: None,
    bed_offsets: Some([15.0, 134.6, 254.2, 373.8, 493.4, 613.0]),
};

const RACK_209: RackSpec = RackSpec {
    x: &[0.0, 16.6, 33.2, 49.8, 66.4, 83.0],
    y: YPitch::Uniform {
        start: 93.0,
        step: 17.7,
        count: 16,
    },
    z: 86.0,
    wells: 96,
    stagger: Some(8.5),
    bed_offsets: Some([13.0, 132.6, 252.2, 371.8, 491.4, 611.0]),
};

const RACK_304: RackSpec = RackSpec {
    x: &[30.5, 71.5, 112.5, 153.5, 194.5],
    y: YPitch::List(&[30.5, 71.5, 112.5, 153.5]),
    z: 10.0,
    wells: 20,
    stagger: None,
    bed_offsets: None,
};

impl RackType {
    /// Every supported rack type.
    pub const ALL: [RackType; 4] = [
        RackType::R204,
        RackType::R207,
        RackType::R209,
        RackType::R304,
    ];

    /// Numeric rack code as printed on the rack.
    pub fn code(self) -> u16 {
        match self {
            RackType::R204 => 204,
            RackType::R207 => 207,
            RackType::R209 => 209,
            RackType::R304 => 304,
        }
    }

    /// Number of wells in one rack.
    pub fn num_wells(self) -> usize {
        self.spec().wells
    }

    /// Whether this rack type sits on the single fixed bed (no bed offset).
    pub fn is_single_bed(self) -> bool {
        self.spec().bed_offsets.is_none()
    }

    fn spec(self) -> &'static RackSpec {
        match self {
            RackType::R204 => &RACK_204,
            RackType::R207 => &RACK_207,
            RackType::R209 => &RACK_209,
            RackType::R304 => &RACK_304,
        }
    }
}

impl TryFrom<u16> for RackType {
    type Error = LabError;

    fn try_from(code: u16) -> LabResult<Self> {
        match code {
            204 => Ok(RackType::R204),
            207 => Ok(RackType::R207),
            209 => Ok(RackType::R209),
            304 => Ok(RackType::R304),
            other => Err(LabError::validation(format!(
                "unsupported rack layout {other}; supported types: 204, 207, 209, 304"
            ))),
        }
    }
}

impl From<RackType> for u16 {
    fn from(rack: RackType) -> u16 {
        rack.code()
    }
}

impl std::str::FromStr for RackType {
    type Err = LabError;

    fn from_str(s: &str) -> LabResult<Self> {
        let code: u16 = s
            .trim()
            .parse()
            .map_err(|_| LabError::validation(format!("rack layout '{s}' is not a number")))?;
        RackType::try_from(code)
    }
}

impl std::fmt::Display for RackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One resolved well position in millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Well {
    /// 1-based well number
    pub number: usize,
    /// X coordinate (mm)
    pub x: f64,
    /// Y coordinate (mm)
    pub y: f64,
    /// Needle depth for this rack (mm)
    pub z: f64,
}

/// A rack of a given type placed on a given bed slot.
///
/// Wells are computed once at construction and never change.
#[derive(Debug, Clone, PartialEq)]
pub struct BedLayout {
    bed: u8,
    rack: RackType,
    wells: Vec<Well>,
}

impl BedLayout {
    /// Build the layout for `rack` on bed slot `bed`.
    ///
    /// # Errors
    /// `Validation` if the bed index is outside 1–6, or not 1 for a
    /// single-bed rack.
    pub fn new(bed: u8, rack: RackType) -> LabResult<Self> {
        let spec = rack.spec();
        let x_offset = match spec.bed_offsets {
            Some(offsets) => {
                if !(1..=MAX_BEDS).contains(&bed) {
                    return Err(LabError::validation(format!(
                        "bed {bed} out of range 1-{MAX_BEDS} for rack {rack}"
                    )));
                }
                offsets[usize::from(bed - 1)]
            }
            None => {
                if bed != 1 {
                    return Err(LabError::validation(format!(
                        "rack {rack} has a single fixed bed; got bed {bed}"
                    )));
                }
                0.0
            }
        };

        let rows: Vec<f64> = match spec.y {
            YPitch::List(values) => values.to_vec(),
            YPitch::Uniform { start, step, count } => {
                (0..count).map(|i| start + step * i as f64).collect()
            }
        };

        let mut wells = Vec::with_capacity(spec.wells);
        for (column, x) in spec.x.iter().enumerate() {
            let stagger = match spec.stagger {
                Some(shift) if column % 2 == 1 => shift,
                _ => 0.0,
            };
            for y in &rows {
                wells.push(Well {
                    number: wells.len() + 1,
                    x: x + x_offset,
                    y: y + stagger,
                    z: spec.z,
                });
            }
        }
        debug_assert_eq!(wells.len(), spec.wells);

        Ok(Self { bed, rack, wells })
    }

    /// Build from a raw rack code (e.g. a method-script parameter).
    pub fn from_code(bed: u8, rack_code: u16) -> LabResult<Self> {
        Self::new(bed, RackType::try_from(rack_code)?)
    }

    /// Bed slot index.
    pub fn bed(&self) -> u8 {
        self.bed
    }

    /// Rack type.
    pub fn rack(&self) -> RackType {
        self.rack
    }

    /// All wells, in numbering order.
    pub fn wells(&self) -> &[Well] {
        &self.wells
    }

    /// Look up a well by its 1-based number.
    pub fn well(&self, number: usize) -> LabResult<Well> {
        number
            .checked_sub(1)
            .and_then(|index| self.wells.get(index))
            .copied()
            .ok_or_else(|| {
                LabError::validation(format!(
                    "well {number} out of range 1-{} for rack {}",
                    self.wells.len(),
                    self.rack
                ))
            })
    }
}

/// The set of bed layouts loaded on one liquid handler.
///
/// Layouts can be swapped mid-run (`set_bedlayout` commands), so the deck is
/// interior-mutable.
#[derive(Debug)]
pub struct Deck {
    layouts: RwLock<BTreeMap<u8, BedLayout>>,
    single_bed: bool,
}

impl Deck {
    /// Six-bed deck with every slot holding `default_rack`.
    pub fn multi_bed(default_rack: RackType) -> LabResult<Self> {
        let mut layouts = BTreeMap::new();
        for bed in 1..=MAX_BEDS {
            layouts.insert(bed, BedLayout::new(bed, default_rack)?);
        }
        Ok(Self {
            layouts: RwLock::new(layouts),
            single_bed: false,
        })
    }

    /// Single fixed bed holding `rack`.
    pub fn single_bed(rack: RackType) -> LabResult<Self> {
        let mut layouts = BTreeMap::new();
        layouts.insert(1, BedLayout::new(1, rack)?);
        Ok(Self {
            layouts: RwLock::new(layouts),
            single_bed: true,
        })
    }

    /// Replace the rack on `bed`.
    pub fn set_layout(&self, bed: u8, rack: RackType) -> LabResult<()> {
        if self.single_bed && bed != 1 {
            return Err(LabError::validation(format!(
                "deck has a single fixed bed; got bed {bed}"
            )));
        }
        let layout = BedLayout::new(bed, rack)?;
        self.layouts.write().insert(bed, layout);
        Ok(())
    }

    /// Resolve a well on a bed.
    pub fn well(&self, bed: u8, well: usize) -> LabResult<Well> {
        let layouts = self.layouts.read();
        let layout = layouts
            .get(&bed)
            .ok_or_else(|| LabError::validation(format!("no rack loaded on bed {bed}")))?;
        layout.well(well)
    }

    /// Snapshot of the layout on `bed`.
    pub fn layout(&self, bed: u8) -> Option<BedLayout> {
        self.layouts.read().get(&bed).cloned()
    }

    /// Bed indices currently holding a rack.
    pub fn beds(&self) -> Vec<u8> {
        self.layouts.read().keys().copied().collect()
    }
}
