//! Clump to storm descriptor conversion
//!
//! A [`StormDescriptor`] is the deterministic reduction of one clump: its
//! centroid in grid, projected and geographic coordinates, its size and the
//! location of its peak value. Sums are accumulated in canonical interval
//! order so the floating-point result does not depend on input order.

use serde::Serialize;

use crate::clump::Clump;
use crate::geometry::{GeoPoint, GridGeometry, Projection};
use crate::types::{Interval, Result, TrackError};

/// Source of field values for locating a storm's peak
pub trait FieldSource {
    /// Field value at a cell, or None outside the field
    fn value(&self, plane: u32, row: u32, col: i32) -> Option<f64>;
}

/// Index of one grid cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellIndex {
    pub plane: u32,
    pub row: u32,
    pub col: i32,
}

/// Number of storm cells on one plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaneCount {
    pub plane: u32,
    pub n_points: u32,
}

/// Shape and position summary of one storm at one scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StormDescriptor {
    /// Id of the clump this storm came from
    pub clump_id: u32,
    /// Centroid column (fractional grid index)
    pub centroid_x: f64,
    /// Centroid row (fractional grid index)
    pub centroid_y: f64,
    /// Centroid plane (fractional grid index)
    pub centroid_z: f64,
    /// Centroid in projected km
    pub x_km: f64,
    pub y_km: f64,
    pub z_km: f64,
    /// Centroid position on the globe
    pub location: GeoPoint,
    /// Number of grid cells
    pub n_points: u32,
    /// Number of intervals in the clump
    pub n_intervals: u32,
    /// Storm volume (km^3)
    pub volume_km3: f64,
    /// Area of the storm projected onto the horizontal plane (km^2)
    pub proj_area_km2: f64,
    /// Cell counts per plane, lowest plane first
    pub plane_counts: Vec<PlaneCount>,
    /// Lowest plane containing storm cells
    pub base_plane: u32,
    /// Highest plane containing storm cells
    pub top_plane: u32,
    /// Peak field value (0 without a field source)
    pub max_value: f64,
    /// Cell holding the peak value
    pub max_location: CellIndex,
}

/// Converts clumps into storm descriptors for one grid
pub struct StormConverter<'a> {
    geometry: &'a GridGeometry,
    projection: &'a dyn Projection,
}

impl<'a> StormConverter<'a> {
    /// Create a converter for a grid and projection
    pub fn new(geometry: &'a GridGeometry, projection: &'a dyn Projection) -> Self {
        Self {
            geometry,
            projection,
        }
    }

    /// Reduce a clump to a storm descriptor.
    ///
    /// # Panics
    /// Panics if the clump has no intervals.
    ///
    /// # Errors
    /// Returns [`TrackError::Geometry`] if the centroid falls outside the grid.
    pub fn convert(
        &self,
        clump: &Clump,
        field: Option<&dyn FieldSource>,
    ) -> Result<StormDescriptor> {
        assert!(
            !clump.intervals.is_empty(),
            "clump {} has no intervals",
            clump.id
        );

        let mut members: Vec<&Interval> = clump.intervals.iter().collect();
        members.sort_by_key(|iv| iv.sort_key());

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_z = 0.0;
        let mut n_points: u64 = 0;
        let mut plane_counts: Vec<PlaneCount> = Vec::new();

        for iv in &members {
            let len = iv.n_points() as f64;
            sum_x += iv.midpoint() * len;
            sum_y += iv.row as f64 * len;
            sum_z += iv.plane as f64 * len;
            n_points += iv.n_points() as u64;

            match plane_counts.last_mut() {
                Some(pc) if pc.plane == iv.plane => pc.n_points += iv.n_points(),
                _ => plane_counts.push(PlaneCount {
                    plane: iv.plane,
                    n_points: iv.n_points(),
                }),
            }
        }

        let n = n_points as f64;
        let (cx, cy, cz) = (sum_x / n, sum_y / n, sum_z / n);

        if !self.geometry.contains(cx, cy, cz) {
            return Err(TrackError::Geometry(format!(
                "clump {} centroid ({:.2}, {:.2}, {:.2}) outside {}x{}x{} grid",
                clump.id, cx, cy, cz, self.geometry.nx, self.geometry.ny, self.geometry.nz
            )));
        }

        let (x_km, y_km, z_km) = self.geometry.grid_to_km(cx, cy, cz);
        let location = self.projection.xy_to_latlon(x_km, y_km);

        let (max_value, max_location) = find_peak(&members, field);

        let base_plane = plane_counts.first().map_or(0, |pc| pc.plane);
        let top_plane = plane_counts.last().map_or(0, |pc| pc.plane);

        Ok(StormDescriptor {
            clump_id: clump.id,
            centroid_x: cx,
            centroid_y: cy,
            centroid_z: cz,
            x_km,
            y_km,
            z_km,
            location,
            n_points: n_points as u32,
            n_intervals: members.len() as u32,
            volume_km3: n * self.geometry.cell_volume_km3(),
            proj_area_km2: projected_points(&members) as f64 * self.geometry.cell_area_km2(),
            plane_counts,
            base_plane,
            top_plane,
            max_value,
            max_location,
        })
    }
}

/// Peak value and its cell; the first maximum in canonical order wins
fn find_peak(members: &[&Interval], field: Option<&dyn FieldSource>) -> (f64, CellIndex) {
    let first = members[0];
    let mut best = (
        0.0,
        CellIndex {
            plane: first.plane,
            row: first.row,
            col: first.begin,
        },
    );

    let Some(field) = field else {
        return best;
    };

    let mut found = false;
    for iv in members {
        for col in iv.begin..=iv.end {
            if let Some(v) = field.value(iv.plane, iv.row, col) {
                if !found || v > best.0 {
                    found = true;
                    best = (
                        v,
                        CellIndex {
                            plane: iv.plane,
                            row: iv.row,
                            col,
                        },
                    );
                }
            }
        }
    }
    best
}

/// Number of distinct (row, column) cells covered on any plane
fn projected_points(members: &[&Interval]) -> u64 {
    let mut by_row: Vec<(u32, i32, i32)> =
        members.iter().map(|iv| (iv.row, iv.begin, iv.end)).collect();
    by_row.sort_unstable();

    let mut total: u64 = 0;
    let mut current: Option<(u32, i32, i32)> = None;
    for (row, begin, end) in by_row {
        current = match current {
            Some((r, b, e)) if r == row && begin <= e + 1 => Some((r, b, e.max(end))),
            Some((_, b, e)) => {
                total += (e - b + 1) as u64;
                Some((row, begin, end))
            }
            None => Some((row, begin, end)),
        };
    }
    if let Some((_, b, e)) = current {
        total += (e - b + 1) as u64;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clump::{ClumpParams, IntervalClumper};
    use crate::geometry::FlatProjection;
    use crate::intervals::Grid3;

    fn single_clump(intervals: &[Interval]) -> Clump {
        let set = IntervalClumper::new(ClumpParams::default()).clump(intervals).unwrap();
        assert_eq!(set.len(), 1);
        set.clumps.into_iter().next().unwrap()
    }

    #[test]
    fn test_centroid_is_area_weighted() {
        let geometry = GridGeometry::new_2d(20, 20, 1.0);
        let projection = geometry.flat_projection();
        let converter = StormConverter::new(&geometry, &projection);

        // Row 5 cols 5-7 (3 cells) and row 6 cols 5-5 (1 cell)
        let clump = single_clump(&[Interval::new(0, 5, 5, 7), Interval::new(0, 6, 5, 5)]);
        let storm = converter.convert(&clump, None).unwrap();

        assert!((storm.centroid_x - (6.0 * 3.0 + 5.0) / 4.0).abs() < 1e-12);
        assert!((storm.centroid_y - (5.0 * 3.0 + 6.0) / 4.0).abs() < 1e-12);
        assert_eq!(storm.n_points, 4);
        assert_eq!(storm.n_intervals, 2);
        assert_eq!(storm.proj_area_km2, 4.0);
        assert_eq!(storm.max_value, 0.0);
        assert_eq!(storm.max_location, CellIndex { plane: 0, row: 5, col: 5 });
    }

    #[test]
    fn test_plane_counts_and_projected_area() {
        let geometry = GridGeometry::new_2d(20, 20, 2.0).with_planes(3, 1.0, 0.5);
        let projection = geometry.flat_projection();
        let converter = StormConverter::new(&geometry, &projection);

        let clump = single_clump(&[
            Interval::new(0, 4, 2, 6),
            Interval::new(1, 4, 4, 8),
            Interval::new(2, 4, 5, 5),
        ]);
        let storm = converter.convert(&clump, None).unwrap();

        assert_eq!(
            storm.plane_counts,
            vec![
                PlaneCount { plane: 0, n_points: 5 },
                PlaneCount { plane: 1, n_points: 5 },
                PlaneCount { plane: 2, n_points: 1 },
            ]
        );
        assert_eq!(storm.base_plane, 0);
        assert_eq!(storm.top_plane, 2);
        // Columns 2..=8 on row 4
        assert_eq!(storm.proj_area_km2, 7.0 * 4.0);
        assert_eq!(storm.volume_km3, 11.0 * 2.0);
    }

    #[test]
    fn test_peak_from_field() {
        let geometry = GridGeometry::new_2d(10, 10, 1.0);
        let projection = geometry.flat_projection();
        let converter = StormConverter::new(&geometry, &projection);

        let mut grid = Grid3::filled(10, 10, 1, 35.0);
        grid.set(0, 3, 4, 52.5);
        let clump = single_clump(&[Interval::new(0, 3, 2, 6), Interval::new(0, 4, 2, 6)]);
        let storm = converter.convert(&clump, Some(&grid)).unwrap();

        assert_eq!(storm.max_value, 52.5);
        assert_eq!(storm.max_location, CellIndex { plane: 0, row: 3, col: 4 });
    }

    #[test]
    fn test_centroid_outside_grid_is_geometry_error() {
        let geometry = GridGeometry::new_2d(5, 5, 1.0);
        let projection = FlatProjection::new(0.0, 0.0);
        let converter = StormConverter::new(&geometry, &projection);

        let clump = single_clump(&[Interval::new(0, 7, 1, 2)]);
        let result = converter.convert(&clump, None);
        assert!(matches!(result, Err(TrackError::Geometry(_))));
    }

    #[test]
    fn test_geo_location_uses_projection() {
        let geometry = GridGeometry::new_2d(10, 10, 1.0).with_origin(35.0, 139.0);
        let projection = geometry.flat_projection();
        let converter = StormConverter::new(&geometry, &projection);

        let clump = single_clump(&[Interval::new(0, 0, 0, 0)]);
        let storm = converter.convert(&clump, None).unwrap();
        assert!((storm.location.lat - 35.0).abs() < 1e-9);
        assert!((storm.location.lon - 139.0).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "has no intervals")]
    fn test_empty_clump_panics() {
        let geometry = GridGeometry::default();
        let projection = geometry.flat_projection();
        let converter = StormConverter::new(&geometry, &projection);
        let clump = Clump {
            id: 9,
            intervals: Vec::new(),
            n_points: 0,
            bbox: crate::clump::BoundingBox {
                min_plane: 0,
                max_plane: 0,
                min_row: 0,
                max_row: 0,
                min_col: 0,
                max_col: 0,
            },
        };
        let _ = converter.convert(&clump, None);
    }
}
