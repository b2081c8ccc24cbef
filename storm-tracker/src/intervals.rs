//! Interval extraction from dense grids
//!
//! Thresholding normally happens upstream, but a dense in-memory grid is
//! handy for tests, demos and the CLI's JSON scan files.

use serde::{Deserialize, Serialize};

use crate::storm::FieldSource;
use crate::types::{Interval, Result, TrackError};

/// A dense 3-D field stored plane-major, then row-major.
///
/// Deserialization goes through [`Grid3::from_data`], so a grid read from
/// a file always has `nz * ny * nx` values. Cells missing from a grid built
/// by hand read as outside the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGrid3")]
pub struct Grid3 {
    /// Number of columns
    pub nx: u32,
    /// Number of rows per plane
    pub ny: u32,
    /// Number of planes
    pub nz: u32,
    /// Values, `nz * ny * nx` long
    pub data: Vec<f32>,
}

impl Grid3 {
    /// Create a grid filled with a constant value
    pub fn filled(nx: u32, ny: u32, nz: u32, value: f32) -> Self {
        Self {
            nx,
            ny,
            nz,
            data: vec![value; (nx as usize) * (ny as usize) * (nz as usize)],
        }
    }

    /// Wrap existing data, checking its length
    pub fn from_data(nx: u32, ny: u32, nz: u32, data: Vec<f32>) -> Result<Self> {
        let expected = (nx as usize) * (ny as usize) * (nz as usize);
        if data.len() != expected {
            return Err(TrackError::Config(format!(
                "grid data length {} does not match {}x{}x{} = {}",
                data.len(),
                nx,
                ny,
                nz,
                expected
            )));
        }
        Ok(Self { nx, ny, nz, data })
    }

    fn index(&self, plane: u32, row: u32, col: u32) -> Option<usize> {
        if plane >= self.nz || row >= self.ny || col >= self.nx {
            return None;
        }
        Some(((plane as usize * self.ny as usize) + row as usize) * self.nx as usize + col as usize)
    }

    /// Value at a cell, if inside the grid
    pub fn get(&self, plane: u32, row: u32, col: u32) -> Option<f32> {
        self.index(plane, row, col)
            .and_then(|i| self.data.get(i).copied())
    }

    /// Set a cell; out-of-range cells are ignored
    pub fn set(&mut self, plane: u32, row: u32, col: u32, value: f32) {
        if let Some(cell) = self
            .index(plane, row, col)
            .and_then(|i| self.data.get_mut(i))
        {
            *cell = value;
        }
    }

    /// Fill an inclusive rectangle of columns/rows on one plane
    pub fn fill_rect(&mut self, plane: u32, rows: (u32, u32), cols: (u32, u32), value: f32) {
        for row in rows.0..=rows.1 {
            for col in cols.0..=cols.1 {
                self.set(plane, row, col, value);
            }
        }
    }
}

#[derive(Deserialize)]
struct RawGrid3 {
    nx: u32,
    ny: u32,
    nz: u32,
    data: Vec<f32>,
}

impl TryFrom<RawGrid3> for Grid3 {
    type Error = TrackError;

    fn try_from(raw: RawGrid3) -> Result<Self> {
        Grid3::from_data(raw.nx, raw.ny, raw.nz, raw.data)
    }
}

impl FieldSource for Grid3 {
    fn value(&self, plane: u32, row: u32, col: i32) -> Option<f64> {
        if col < 0 {
            return None;
        }
        self.get(plane, row, col as u32).map(f64::from)
    }
}

/// Extract maximal runs of cells with `value >= threshold`.
///
/// Intervals come out in canonical (plane, row, begin) order.
pub fn find_intervals(grid: &Grid3, threshold: f32) -> Vec<Interval> {
    let mut intervals = Vec::new();

    for plane in 0..grid.nz {
        for row in 0..grid.ny {
            let mut begin: Option<u32> = None;
            for col in 0..grid.nx {
                let above = grid.get(plane, row, col).map_or(false, |v| v >= threshold);
                match (above, begin) {
                    (true, None) => begin = Some(col),
                    (false, Some(b)) => {
                        intervals.push(Interval::new(plane, row, b as i32, col as i32 - 1));
                        begin = None;
                    }
                    _ => {}
                }
            }
            if let Some(b) = begin {
                intervals.push(Interval::new(plane, row, b as i32, grid.nx as i32 - 1));
            }
        }
    }

    log::trace!("Found {} intervals above {}", intervals.len(), threshold);
    intervals
}
