//! Core types for the storm tracker library
//!
//! This module defines the fundamental values that flow between the clumper,
//! the storm converter and the continuity matcher, together with the error
//! type shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storm::StormDescriptor;

/// Timestamp type used throughout the tracker
pub type Timestamp = DateTime<Utc>;

/// Result type for tracker operations
pub type Result<T> = std::result::Result<T, TrackError>;

/// Errors that can occur while clumping, tracking or (de)serializing
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storm outside grid bounds: {0}")]
    Geometry(String),

    #[error("Scan out of sequence: received {received}, previous scan was {previous}")]
    Sequence {
        previous: Timestamp,
        received: Timestamp,
    },

    #[error("Failed to decode track buffer: {0}")]
    Decode(String),

    #[error("Allocation failed during clumping: {0}")]
    Allocation(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Unknown track: simple track {0}")]
    UnknownTrack(u32),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A maximal run of threshold-exceeding cells in one row of one plane.
///
/// `row` is the row index within the plane; use [`Interval::row_in_vol`]
/// for the row index in the stacked volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    /// Plane (vertical level) index
    pub plane: u32,
    /// Row index within the plane
    pub row: u32,
    /// First column of the run (inclusive)
    pub begin: i32,
    /// Last column of the run (inclusive)
    pub end: i32,
}

impl Interval {
    /// Create a new interval
    pub fn new(plane: u32, row: u32, begin: i32, end: i32) -> Self {
        Self {
            plane,
            row,
            begin,
            end,
        }
    }

    /// Number of grid cells covered by this interval
    pub fn n_points(&self) -> u32 {
        (self.end - self.begin + 1).max(0) as u32
    }

    /// Row index in the stacked volume, given the number of rows per plane
    pub fn row_in_vol(&self, nrows_per_plane: u32) -> u32 {
        self.plane * nrows_per_plane + self.row
    }

    /// Column midpoint of the interval
    pub fn midpoint(&self) -> f64 {
        (self.begin as f64 + self.end as f64) / 2.0
    }

    /// Signed overlap in columns with another interval.
    ///
    /// Positive values count shared columns, 0 means the runs touch at a
    /// corner, -n means a gap of n columns separates them.
    pub fn overlap(&self, other: &Interval) -> i64 {
        let lo = self.begin.max(other.begin) as i64;
        let hi = self.end.min(other.end) as i64;
        hi - lo + 1
    }

    /// Canonical ordering key: (plane, row, begin, end)
    pub(crate) fn sort_key(&self) -> (u32, u32, i32, i32) {
        (self.plane, self.row, self.begin, self.end)
    }
}

/// Origin of a motion estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionSource {
    /// Derived from the track's own previous position
    History,
    /// Derived from the weighted motion of neighbouring storms
    Constrained,
}

impl MotionSource {
    /// Wire code used in track archives (0 is reserved for "no motion")
    pub(crate) fn code(self) -> u32 {
        match self {
            MotionSource::History => 1,
            MotionSource::Constrained => 2,
        }
    }

    pub(crate) fn from_code(code: u32) -> Option<Option<Self>> {
        match code {
            0 => Some(None),
            1 => Some(Some(MotionSource::History)),
            2 => Some(Some(MotionSource::Constrained)),
            _ => None,
        }
    }
}

/// Storm motion as U (east) / V (north) components in km/h
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionVector {
    /// Eastward component (km/h)
    pub u_kmh: f64,
    /// Northward component (km/h)
    pub v_kmh: f64,
    /// Where this estimate came from
    pub source: MotionSource,
}

impl MotionVector {
    /// Create a motion vector from U/V components
    pub fn new(u_kmh: f64, v_kmh: f64, source: MotionSource) -> Self {
        Self {
            u_kmh,
            v_kmh,
            source,
        }
    }

    /// Create a motion vector from speed and direction (degrees clockwise
    /// from north, the direction the storm moves towards)
    pub fn from_speed_direction(speed_kmh: f64, direction_deg: f64, source: MotionSource) -> Self {
        let rad = direction_deg.to_radians();
        Self {
            u_kmh: speed_kmh * rad.sin(),
            v_kmh: speed_kmh * rad.cos(),
            source,
        }
    }

    /// Speed in km/h
    pub fn speed(&self) -> f64 {
        self.u_kmh.hypot(self.v_kmh)
    }

    /// Direction of travel in degrees clockwise from north, in [0, 360).
    ///
    /// A zero vector has direction 0.
    pub fn direction(&self) -> f64 {
        if self.u_kmh == 0.0 && self.v_kmh == 0.0 {
            return 0.0;
        }
        let mut dirn = self.u_kmh.atan2(self.v_kmh).to_degrees();
        if dirn < 0.0 {
            dirn += 360.0;
        }
        if dirn >= 360.0 {
            dirn -= 360.0;
        }
        dirn
    }
}

/// Lifecycle event reported for a track while ingesting a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrackEventKind {
    /// A storm with no predecessor started a new simple and complex track
    New,
    /// A storm extended an existing simple track
    Continued,
    /// A storm started a new simple track as one of several children
    Split,
    /// A storm started a new simple track with several parents
    Merged,
    /// A simple track ended
    Ended,
}

impl TrackEventKind {
    /// All kinds, in reporting order
    pub fn all() -> [TrackEventKind; 5] {
        [
            TrackEventKind::New,
            TrackEventKind::Continued,
            TrackEventKind::Split,
            TrackEventKind::Merged,
            TrackEventKind::Ended,
        ]
    }
}

impl fmt::Display for TrackEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackEventKind::New => write!(f, "NEW"),
            TrackEventKind::Continued => write!(f, "CONTINUED"),
            TrackEventKind::Split => write!(f, "SPLIT"),
            TrackEventKind::Merged => write!(f, "MERGED"),
            TrackEventKind::Ended => write!(f, "ENDED"),
        }
    }
}

/// One entry in the per-scan output list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackEvent {
    /// What happened to the track
    pub kind: TrackEventKind,
    /// Simple track affected
    pub simple_track_id: u32,
    /// Complex track the simple track belongs to after this scan
    pub complex_track_id: u32,
    /// The storm involved (None for ENDED events)
    pub storm: Option<StormDescriptor>,
}

/// A storm that was dropped while converting clumps
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedStorm {
    /// Clump id within the scan
    pub clump_id: u32,
    /// Human-readable reason
    pub reason: String,
}

/// Result of ingesting one scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// Sequential scan number within the run (0-based)
    pub scan_num: u32,
    /// Scan time
    pub time: Timestamp,
    /// Number of clumps found before conversion
    pub n_clumps: usize,
    /// Track events, in storm order followed by ENDED events
    pub events: Vec<TrackEvent>,
    /// Storms dropped with a geometry problem
    pub dropped: Vec<DroppedStorm>,
}

impl ScanReport {
    /// Count events of a given kind
    pub fn count(&self, kind: TrackEventKind) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }

    /// Events that carry a storm (everything but ENDED)
    pub fn storm_events(&self) -> impl Iterator<Item = &TrackEvent> {
        self.events.iter().filter(|e| e.storm.is_some())
    }
}
