//! Multiwell plate position lists.
//!
//! Expands a plate region into labelled XY stage positions, optionally tiling
//! each well. Wells are visited column by column, snaking over rows; tiles
//! inside a well snake the same way over tile rows. X decreases with column
//! and Y increases with row.

use serde::{Deserialize, Serialize};
use sols_core::request::StagePosition;
use thiserror::Error;

/// Largest plate: 16 rows (A-P).
pub const MAX_PLATE_ROWS: u32 = 16;
/// Largest plate: 24 columns.
pub const MAX_PLATE_COLS: u32 = 24;
/// Largest tile grid per axis.
pub const MAX_TILES: u32 = 100;

/// Invalid plate layout.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlateError {
    /// Row or column count outside the supported plate sizes.
    #[error("Plate must have 1-{max} {axis}, got {value}")]
    PlateSize {
        /// "rows" or "columns"
        axis: &'static str,
        /// Requested count
        value: u32,
        /// Supported maximum
        max: u32,
    },

    /// Tile grid outside 1-100 per axis.
    #[error("Tile {axis} must be 1-{max}, got {value}")]
    TileCount {
        /// "rows" or "columns"
        axis: &'static str,
        /// Requested count
        value: u32,
        /// Supported maximum
        max: u32,
    },

    /// A well name that does not parse or is not on the plate.
    #[error("Well '{0}' is not on the plate")]
    UnknownWell(String),

    /// `stop` precedes `start` on some axis.
    #[error("Region start '{start}' is after stop '{stop}'")]
    InvertedRegion {
        /// Start well
        start: String,
        /// Stop well
        stop: String,
    },

    /// Non-finite spacing or A1 corner.
    #[error("'{0}' must be finite")]
    NonFinite(&'static str),
}

/// Plate geometry and the region to visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateScan {
    /// Rows on the plate (8 for 96-well, 16 for 384-well)
    pub total_rows: u32,
    /// Columns on the plate (12 for 96-well, 24 for 384-well)
    pub total_cols: u32,
    /// Centre-to-centre well spacing (mm)
    pub well_spacing_mm: f64,
    /// First well of the region, e.g. `A1`
    pub start: String,
    /// Last well of the region, e.g. `B2`
    pub stop: String,
    /// Tile rows per well
    #[serde(default = "one")]
    pub tile_rows: u32,
    /// Tile columns per well
    #[serde(default = "one")]
    pub tile_cols: u32,
    /// X spacing between tiles (mm)
    #[serde(default)]
    pub tile_spacing_x_mm: f64,
    /// Y spacing between tiles (mm)
    #[serde(default)]
    pub tile_spacing_y_mm: f64,
    /// Upper-left corner of well A1, X (mm)
    pub a1_ul_x_mm: f64,
    /// Upper-left corner of well A1, Y (mm)
    pub a1_ul_y_mm: f64,
    /// Lower-right corner of well A1, X (mm)
    pub a1_lr_x_mm: f64,
    /// Lower-right corner of well A1, Y (mm)
    pub a1_lr_y_mm: f64,
}

fn one() -> u32 {
    1
}

impl PlateScan {
    /// Stage positions in visiting order.
    pub fn positions(&self) -> Result<Vec<StagePosition>, PlateError> {
        self.validate()?;
        let (row_start, col_start) = self.well(&self.start)?;
        let (row_stop, col_stop) = self.well(&self.stop)?;
        if row_start > row_stop || col_start > col_stop {
            return Err(PlateError::InvertedRegion {
                start: self.start.clone(),
                stop: self.stop.clone(),
            });
        }

        let a1_x = self.a1_ul_x_mm - 0.5 * (self.a1_ul_x_mm - self.a1_lr_x_mm);
        let a1_y = self.a1_ul_y_mm - 0.5 * (self.a1_ul_y_mm - self.a1_lr_y_mm);
        // Centres the tile grid on the well.
        let offset_x = 0.5 * f64::from(self.tile_cols - 1) * self.tile_spacing_x_mm;
        let offset_y = 0.5 * f64::from(self.tile_rows - 1) * self.tile_spacing_y_mm;

        let mut positions = Vec::new();
        for c in col_start..=col_stop {
            let well_x = a1_x - f64::from(c) * self.well_spacing_mm;
            for r in snake(row_start..=row_stop, c % 2 == 1) {
                let well_y = a1_y + f64::from(r) * self.well_spacing_mm;
                for tc in 0..self.tile_cols {
                    for tr in snake(0..=self.tile_rows - 1, tc % 2 == 1) {
                        positions.push(StagePosition {
                            label: format!("{}{:02}r{:02}c{:02}", row_label(r), c + 1, tr, tc),
                            x_mm: well_x + offset_x - f64::from(tc) * self.tile_spacing_x_mm,
                            y_mm: well_y - offset_y + f64::from(tr) * self.tile_spacing_y_mm,
                        });
                    }
                }
            }
        }
        Ok(positions)
    }

    fn validate(&self) -> Result<(), PlateError> {
        for (axis, value, max) in [
            ("rows", self.total_rows, MAX_PLATE_ROWS),
            ("columns", self.total_cols, MAX_PLATE_COLS),
        ] {
            if value == 0 || value > max {
                return Err(PlateError::PlateSize { axis, value, max });
            }
        }
        for (axis, value) in [("rows", self.tile_rows), ("columns", self.tile_cols)] {
            if value == 0 || value > MAX_TILES {
                return Err(PlateError::TileCount {
                    axis,
                    value,
                    max: MAX_TILES,
                });
            }
        }
        for (name, value) in [
            ("well_spacing_mm", self.well_spacing_mm),
            ("tile_spacing_x_mm", self.tile_spacing_x_mm),
            ("tile_spacing_y_mm", self.tile_spacing_y_mm),
            ("a1_ul_x_mm", self.a1_ul_x_mm),
            ("a1_ul_y_mm", self.a1_ul_y_mm),
            ("a1_lr_x_mm", self.a1_lr_x_mm),
            ("a1_lr_y_mm", self.a1_lr_y_mm),
        ] {
            if !value.is_finite() {
                return Err(PlateError::NonFinite(name));
            }
        }
        Ok(())
    }

    /// Zero-based (row, column) of a well name like `C07`.
    fn well(&self, name: &str) -> Result<(u32, u32), PlateError> {
        let unknown = || PlateError::UnknownWell(name.to_string());
        let mut chars = name.trim().chars();
        let letter = chars.next().ok_or_else(unknown)?.to_ascii_uppercase();
        if !letter.is_ascii_uppercase() {
            return Err(unknown());
        }
        let row = u32::from(letter) - u32::from('A');
        let col: u32 = chars.as_str().parse().map_err(|_| unknown())?;
        if row >= self.total_rows || col == 0 || col > self.total_cols {
            return Err(unknown());
        }
        Ok((row, col - 1))
    }
}

fn row_label(row: u32) -> char {
    char::from_u32(u32::from('A') + row).unwrap_or('?')
}

fn snake(range: std::ops::RangeInclusive<u32>, reverse: bool) -> Box<dyn Iterator<Item = u32>> {
    if reverse {
        Box::new(range.rev())
    } else {
        Box::new(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plate() -> PlateScan {
        PlateScan {
            total_rows: 16,
            total_cols: 24,
            well_spacing_mm: 4.5,
            start: "A1".into(),
            stop: "B2".into(),
            tile_rows: 1,
            tile_cols: 1,
            tile_spacing_x_mm: 0.0,
            tile_spacing_y_mm: 0.0,
            a1_ul_x_mm: 50.0,
            a1_ul_y_mm: -35.0,
            a1_lr_x_mm: 47.0,
            a1_lr_y_mm: -32.0,
        }
    }

    fn labels(positions: &[StagePosition]) -> Vec<&str> {
        positions.iter().map(|p| p.label.as_str()).collect()
    }

    #[test]
    fn wells_snake_over_columns() {
        let positions = plate().positions().unwrap();
        assert_eq!(
            labels(&positions),
            ["A01r00c00", "B01r00c00", "B02r00c00", "A02r00c00"]
        );
        // A1 centre
        assert!((positions[0].x_mm - 48.5).abs() < 1e-9);
        assert!((positions[0].y_mm + 33.5).abs() < 1e-9);
        // B1: one row down
        assert!((positions[1].y_mm + 29.0).abs() < 1e-9);
        // B2: one column over, x decreases
        assert!((positions[2].x_mm - 44.0).abs() < 1e-9);
    }

    #[test]
    fn tiles_snake_and_centre_on_the_well() {
        let mut scan = plate();
        scan.stop = "A1".into();
        scan.tile_rows = 2;
        scan.tile_cols = 2;
        scan.tile_spacing_x_mm = 1.0;
        scan.tile_spacing_y_mm = 0.5;
        let positions = scan.positions().unwrap();
        assert_eq!(
            labels(&positions),
            ["A01r00c00", "A01r01c00", "A01r01c01", "A01r00c01"]
        );

        let mean_x = positions.iter().map(|p| p.x_mm).sum::<f64>() / 4.0;
        let mean_y = positions.iter().map(|p| p.y_mm).sum::<f64>() / 4.0;
        assert!((mean_x - 48.5).abs() < 1e-9);
        assert!((mean_y + 33.5).abs() < 1e-9);
        assert!((positions[0].x_mm - 49.0).abs() < 1e-9);
        assert!((positions[2].x_mm - 48.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_layouts() {
        let mut scan = plate();
        scan.total_rows = 17;
        assert!(matches!(scan.positions(), Err(PlateError::PlateSize { .. })));

        let mut scan = plate();
        scan.tile_cols = 0;
        assert!(matches!(scan.positions(), Err(PlateError::TileCount { .. })));

        let mut scan = plate();
        scan.stop = "Q1".into();
        assert_eq!(scan.positions(), Err(PlateError::UnknownWell("Q1".into())));

        let mut scan = plate();
        scan.start = "B2".into();
        scan.stop = "A1".into();
        assert!(matches!(scan.positions(), Err(PlateError::InvertedRegion { .. })));
    }
}
