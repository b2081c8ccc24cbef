//! Tracker configuration
//!
//! One immutable [`TrackerConfig`] is built at startup and handed to
//! [`StormTracker::new`](crate::StormTracker::new), which validates it and
//! passes each section to the component that uses it.

use serde::{Deserialize, Serialize};

use crate::clump::ClumpParams;
use crate::forecast::ForecastParams;
use crate::geometry::GridGeometry;
use crate::matcher::MatchParams;
use crate::restart::RestartSchedule;
use crate::types::{Result, TrackError};

/// Configuration for one tracking run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Interval linking rules
    #[serde(default)]
    pub clump: ClumpParams,

    /// Scan-to-scan matching
    #[serde(default)]
    pub matching: MatchParams,

    /// Neighbour motion estimation
    #[serde(default)]
    pub forecast: ForecastParams,

    /// Daily restart schedule, if the run restarts
    #[serde(default)]
    pub restart: Option<RestartSchedule>,

    /// Grid the intervals are defined on
    #[serde(default)]
    pub geometry: GridGeometry,

    /// Field threshold used when extracting intervals from dense grids
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Minimum storm size in grid cells; smaller clumps are dropped
    #[serde(default = "default_min_storm_points")]
    pub min_storm_points: u32,
}

fn default_threshold() -> f32 {
    35.0
}

fn default_min_storm_points() -> u32 {
    1
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            clump: ClumpParams::default(),
            matching: MatchParams::default(),
            forecast: ForecastParams::default(),
            restart: None,
            geometry: GridGeometry::default(),
            threshold: default_threshold(),
            min_storm_points: default_min_storm_points(),
        }
    }
}

impl TrackerConfig {
    /// Builder method: set the grid geometry
    pub fn with_geometry(mut self, geometry: GridGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Builder method: set the clumping rules
    pub fn with_clump(mut self, clump: ClumpParams) -> Self {
        self.clump = clump;
        self
    }

    /// Builder method: set the matching parameters
    pub fn with_matching(mut self, matching: MatchParams) -> Self {
        self.matching = matching;
        self
    }

    /// Builder method: set the forecast parameters
    pub fn with_forecast(mut self, forecast: ForecastParams) -> Self {
        self.forecast = forecast;
        self
    }

    /// Builder method: enable daily restarts
    pub fn with_restart(mut self, restart: RestartSchedule) -> Self {
        self.restart = Some(restart);
        self
    }

    /// Builder method: set the dense-grid threshold
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Builder method: set the minimum storm size
    pub fn with_min_storm_points(mut self, points: u32) -> Self {
        self.min_storm_points = points;
        self
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        self.matching.validate()?;
        self.forecast.validate()?;
        if let Some(restart) = &self.restart {
            restart.validate()?;
        }
        if !self.threshold.is_finite() {
            return Err(TrackError::Config(format!(
                "threshold must be finite, got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}
