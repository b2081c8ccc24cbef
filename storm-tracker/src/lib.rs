//! Storm Tracker Library
//!
//! Identifies storm cells in successive thresholded radar/grid scans and
//! tracks them through time, keeping a stable identity across splits and
//! merges.
//!
//! # Architecture
//!
//! Each scan flows through the same pipeline:
//! - Run-length intervals are clumped into connected components
//! - Each clump is reduced to a storm descriptor (centroid, size, peak)
//! - Storms are matched against the open tracks of earlier scans
//! - The updated track archive is snapshotted for persistence
//!
//! Tracks form a two-level hierarchy: a simple track is one unbroken storm
//! identity, a complex track is the family of simple tracks joined by
//! splits and merges. Complex tracks serialize to a fixed-layout big-endian
//! format and concatenate into archive files.
//!
//! The library does NOT:
//! - Read radar volumes or apply thresholds to them
//! - Render tracks
//! - Mosaic multiple radars
//!
//! # Example Usage
//!
//! ```
//! use storm_tracker::{GridGeometry, Interval, Scan, StormTracker, TrackerConfig, TrackEventKind};
//! use chrono::{Duration, TimeZone, Utc};
//!
//! let config = TrackerConfig::default().with_geometry(GridGeometry::new_2d(50, 50, 1.0));
//! let mut tracker = StormTracker::new(config).unwrap();
//!
//! let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap();
//! let report = tracker
//!     .ingest_scan(Scan::new(t0, vec![Interval::new(0, 5, 5, 7)]))
//!     .unwrap();
//! assert_eq!(report.count(TrackEventKind::New), 1);
//!
//! let report = tracker
//!     .ingest_scan(Scan::new(t0 + Duration::minutes(5), vec![Interval::new(0, 5, 6, 8)]))
//!     .unwrap();
//! assert_eq!(report.count(TrackEventKind::Continued), 1);
//! ```

// Public modules
pub mod archive;
pub mod clump;
pub mod codec;
pub mod config;
pub mod forecast;
pub mod geometry;
pub mod intervals;
pub mod matcher;
pub mod restart;
pub mod storm;
pub mod track;
pub mod tracker;
pub mod types;
pub mod xml;

// Re-export main types for convenience
pub use archive::{
    index_archive, read_archive, read_at, write_archive, ArchiveSink, FileArchiveSink, IndexEntry,
};
pub use clump::{Clump, ClumpParams, ClumpSet, IntervalClumper};
pub use codec::{assemble, disassemble};
pub use config::TrackerConfig;
pub use forecast::{ForecastParams, MotionConstraint, MotionForecaster, NeighborEntry};
pub use geometry::{FlatProjection, GeoPoint, GridGeometry, Projection};
pub use intervals::{find_intervals, Grid3};
pub use matcher::{MatchParams, ScanContext, TrackContinuityMatcher};
pub use restart::{compute_restart, RestartSchedule, RestartWindow};
pub use storm::{FieldSource, StormConverter, StormDescriptor};
pub use track::{ArchiveSnapshot, ComplexTrack, SimpleTrack, TrackArchive, TrackEntry, TrackState};
pub use tracker::{RunSummary, Scan, StormTracker};
pub use types::{
    DroppedStorm, Interval, MotionSource, MotionVector, Result, ScanReport, Timestamp,
    TrackError, TrackEvent, TrackEventKind,
};
pub use xml::to_xml;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_tracker_creation() {
        let tracker = StormTracker::new(TrackerConfig::default());
        assert!(tracker.is_ok());
    }
}
