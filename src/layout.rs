//! Printable well tables.

use chemflow_core::geometry::{BedLayout, RackType};
use chemflow_core::LabResult;
use std::fmt::Write;

/// Well coordinates of `rack` on `bed`, one line per well.
pub fn well_table(rack: RackType, bed: u8) -> LabResult<String> {
    let layout = BedLayout::new(bed, rack)?;
    let mut table = format!("rack {rack} on bed {bed}: {} wells\n", layout.wells().len());
    table.push_str(" well        x        y        z\n");
    for well in layout.wells() {
        // Writing to a String cannot fail
        let _ = writeln!(
            table,
            "{:>5} {:>8.2} {:>8.2} {:>8.2}",
            well.number, well.x, well.y, well.z
        );
    }
    Ok(table)
}
