//! Weighted-neighbour motion estimation
//!
//! A storm with little or no history of its own borrows the motion of the
//! storms around it. Each neighbour inside the search radius contributes
//! its U/V velocity with a weight falling linearly from 1 at zero distance
//! to 0 at the radius.

use serde::{Deserialize, Serialize};

use crate::geometry::GeoPoint;
use crate::types::{MotionSource, MotionVector, Result, TrackError};

/// Forecaster configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastParams {
    /// Neighbour search radius (km)
    #[serde(default = "default_radius_km")]
    pub radius_km: f64,

    /// Forward projection applied to the query position (minutes)
    #[serde(default = "default_lookahead_minutes")]
    pub lookahead_minutes: f64,
}

fn default_radius_km() -> f64 {
    50.0
}

fn default_lookahead_minutes() -> f64 {
    30.0
}

impl Default for ForecastParams {
    fn default() -> Self {
        Self {
            radius_km: default_radius_km(),
            lookahead_minutes: default_lookahead_minutes(),
        }
    }
}

impl ForecastParams {
    /// Check parameter ranges
    pub fn validate(&self) -> Result<()> {
        if !(self.radius_km > 0.0) {
            return Err(TrackError::Config(format!(
                "forecast radius must be positive, got {}",
                self.radius_km
            )));
        }
        if !(self.lookahead_minutes >= 0.0) {
            return Err(TrackError::Config(format!(
                "forecast lookahead must not be negative, got {}",
                self.lookahead_minutes
            )));
        }
        Ok(())
    }
}

/// A neighbouring storm's last position and motion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborEntry {
    pub location: GeoPoint,
    pub motion: MotionVector,
}

/// Outcome of a constrained-motion query
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionConstraint {
    /// Weighted mean of the neighbours in range
    Constrained {
        motion: MotionVector,
        /// Number of neighbours that contributed
        n_neighbors: usize,
    },
    /// No neighbour within the search radius
    NoConstraint,
}

impl MotionConstraint {
    /// The constrained motion, if any
    pub fn motion(&self) -> Option<MotionVector> {
        match self {
            MotionConstraint::Constrained { motion, .. } => Some(*motion),
            MotionConstraint::NoConstraint => None,
        }
    }
}

/// Weighted-neighbour motion estimator
#[derive(Debug, Clone)]
pub struct MotionForecaster {
    params: ForecastParams,
}

impl MotionForecaster {
    /// Create a forecaster
    pub fn new(params: ForecastParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ForecastParams {
        &self.params
    }

    /// Position of `centroid` after moving with `motion` for the lookahead period
    pub fn project(&self, centroid: GeoPoint, motion: &MotionVector) -> GeoPoint {
        let hours = self.params.lookahead_minutes / 60.0;
        centroid.offset_km(motion.u_kmh * hours, motion.v_kmh * hours)
    }

    /// Estimate motion at `centroid` from the motion of nearby storms.
    ///
    /// With `project_forward` and a `current` motion, the query point is
    /// first moved forward by the lookahead period.
    pub fn compute_constrained_motion(
        &self,
        centroid: GeoPoint,
        current: Option<&MotionVector>,
        neighbors: &[NeighborEntry],
        project_forward: bool,
    ) -> MotionConstraint {
        let query = match current {
            Some(motion) if project_forward => self.project(centroid, motion),
            _ => centroid,
        };

        let radius = self.params.radius_km;
        let mut sum_wt = 0.0;
        let mut sum_u = 0.0;
        let mut sum_v = 0.0;
        let mut n_neighbors = 0;

        for neighbor in neighbors {
            let dist = query.distance_km(&neighbor.location);
            if dist >= radius {
                continue;
            }
            let wt = (radius - dist) / radius;
            log::trace!(
                "Neighbour at {:.1} km, weight {:.3}, u={:.1} v={:.1}",
                dist,
                wt,
                neighbor.motion.u_kmh,
                neighbor.motion.v_kmh
            );
            sum_wt += wt;
            sum_u += wt * neighbor.motion.u_kmh;
            sum_v += wt * neighbor.motion.v_kmh;
            n_neighbors += 1;
        }

        // A neighbour sitting exactly on the query point still has weight 1,
        // so sum_wt is only zero when nothing was in range.
        if n_neighbors == 0 || sum_wt <= 0.0 {
            return MotionConstraint::NoConstraint;
        }

        MotionConstraint::Constrained {
            motion: MotionVector::new(sum_u / sum_wt, sum_v / sum_wt, MotionSource::Constrained),
            n_neighbors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(location: GeoPoint, u: f64, v: f64) -> NeighborEntry {
        NeighborEntry {
            location,
            motion: MotionVector::new(u, v, MotionSource::History),
        }
    }

    fn forecaster(radius_km: f64) -> MotionForecaster {
        MotionForecaster::new(ForecastParams {
            radius_km,
            lookahead_minutes: 30.0,
        })
    }

    #[test]
    fn test_no_neighbors_in_range() {
        let origin = GeoPoint::new(40.0, -105.0);
        let far = neighbor(origin.offset_km(80.0, 0.0), 20.0, 0.0);
        let result = forecaster(50.0).compute_constrained_motion(origin, None, &[far], false);
        assert_eq!(result, MotionConstraint::NoConstraint);
        assert_eq!(result.motion(), None);
    }

    #[test]
    fn test_neighbor_on_boundary_excluded() {
        let origin = GeoPoint::new(0.0, 0.0);
        let at = origin.offset_km(30.0, 0.0);
        let radius = origin.distance_km(&at);
        let result = forecaster(radius).compute_constrained_motion(
            origin,
            None,
            &[neighbor(at, 20.0, 0.0)],
            false,
        );
        assert_eq!(result, MotionConstraint::NoConstraint);
    }

    #[test]
    fn test_weighted_mean() {
        let origin = GeoPoint::new(40.0, -105.0);
        // Weight 1.0 and 0.5
        let near = neighbor(origin, 10.0, 0.0);
        let mid = neighbor(origin.offset_km(0.0, 25.0), 40.0, 0.0);
        let result = forecaster(origin.distance_km(&origin.offset_km(0.0, 50.0)))
            .compute_constrained_motion(origin, None, &[near, mid], false);

        match result {
            MotionConstraint::Constrained { motion, n_neighbors } => {
                assert_eq!(n_neighbors, 2);
                assert!((motion.u_kmh - 20.0).abs() < 1e-3, "u was {}", motion.u_kmh);
                assert!(motion.v_kmh.abs() < 1e-9);
                assert_eq!(motion.source, MotionSource::Constrained);
            }
            MotionConstraint::NoConstraint => panic!("expected a constraint"),
        }
    }

    #[test]
    fn test_opposing_neighbors_cancel() {
        let origin = GeoPoint::new(10.0, 20.0);
        let west = neighbor(origin.offset_km(-25.0, 0.0), 30.0, 15.0);
        let east = neighbor(origin.offset_km(25.0, 0.0), -30.0, -15.0);
        let result =
            forecaster(50.0).compute_constrained_motion(origin, None, &[west, east], false);

        let motion = result.motion().unwrap();
        assert!(motion.speed() < 1e-6);
        assert!(motion.direction() == 0.0 || motion.speed() < 1e-6);
    }

    #[test]
    fn test_project_forward_moves_query() {
        let origin = GeoPoint::new(0.0, 0.0);
        // Current motion carries the query 30 km east in 30 minutes
        let current = MotionVector::new(60.0, 0.0, MotionSource::History);
        let ahead = neighbor(origin.offset_km(30.0, 0.0), 5.0, 5.0);
        let f = forecaster(10.0);

        assert_eq!(
            f.compute_constrained_motion(origin, Some(&current), &[ahead], false),
            MotionConstraint::NoConstraint
        );
        let projected = f.compute_constrained_motion(origin, Some(&current), &[ahead], true);
        let motion = projected.motion().unwrap();
        assert!((motion.u_kmh - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_neighbors_across_date_line() {
        let origin = GeoPoint::new(0.0, 179.95);
        let other = neighbor(GeoPoint::new(0.0, -179.95), 12.0, -3.0);
        let result = forecaster(50.0).compute_constrained_motion(origin, None, &[other], false);
        let motion = result.motion().unwrap();
        assert!((motion.u_kmh - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_params_validate() {
        assert!(ForecastParams::default().validate().is_ok());
        let bad = ForecastParams {
            radius_km: 0.0,
            ..ForecastParams::default()
        };
        assert!(matches!(bad.validate(), Err(TrackError::Config(_))));
    }
}
