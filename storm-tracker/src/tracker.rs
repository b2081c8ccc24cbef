//! Main tracking API
//!
//! [`StormTracker`] owns one tracking run: it clumps each scan's intervals,
//! converts the clumps to storms, matches the storms into its
//! [`TrackArchive`] and hands snapshots of the archive to an optional
//! [`ArchiveSink`].

use serde::Serialize;
use std::collections::BTreeMap;

use crate::archive::ArchiveSink;
use crate::clump::IntervalClumper;
use crate::config::TrackerConfig;
use crate::forecast::{MotionConstraint, MotionForecaster};
use crate::geometry::FlatProjection;
use crate::intervals::{find_intervals, Grid3};
use crate::matcher::{ScanContext, TrackContinuityMatcher};
use crate::restart::RestartWindow;
use crate::storm::{FieldSource, StormConverter};
use crate::track::{ComplexTrack, TrackArchive};
use crate::types::{
    DroppedStorm, Interval, Result, ScanReport, Timestamp, TrackError, TrackEventKind,
};

/// One scan presented to the tracker
#[derive(Debug, Clone)]
pub struct Scan {
    /// Scan time
    pub time: Timestamp,
    /// Threshold-exceeding intervals
    pub intervals: Vec<Interval>,
    /// Field values for locating storm peaks
    pub field: Option<Grid3>,
}

impl Scan {
    /// Create a scan from pre-extracted intervals
    pub fn new(time: Timestamp, intervals: Vec<Interval>) -> Self {
        Self {
            time,
            intervals,
            field: None,
        }
    }

    /// Create a scan by thresholding a dense grid; the grid is kept as
    /// the field source
    pub fn from_grid(time: Timestamp, grid: Grid3, threshold: f32) -> Self {
        Self {
            time,
            intervals: find_intervals(&grid, threshold),
            field: Some(grid),
        }
    }

    /// Builder method: attach a field source
    pub fn with_field(mut self, field: Grid3) -> Self {
        self.field = Some(field);
        self
    }
}

/// Totals accumulated over a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// Scans ingested
    pub n_scans: usize,
    /// Storms accepted into tracks
    pub n_storms: usize,
    /// Events by kind
    pub events: BTreeMap<String, usize>,
    /// Dropped storms by reason
    pub drop_reasons: BTreeMap<String, usize>,
    /// Failed persistence attempts
    pub persist_failures: usize,
}

impl RunSummary {
    /// Add one scan report to the totals
    pub fn record(&mut self, report: &ScanReport) {
        self.n_scans += 1;
        self.n_storms += report.storm_events().count();
        for event in &report.events {
            *self.events.entry(event.kind.to_string()).or_default() += 1;
        }
        for dropped in &report.dropped {
            *self.drop_reasons.entry(dropped.reason.clone()).or_default() += 1;
        }
    }

    /// Fold another run's totals into these, as when a restarted run
    /// continues the same data stream
    pub fn merge(&mut self, other: &RunSummary) {
        self.n_scans += other.n_scans;
        self.n_storms += other.n_storms;
        for (kind, n) in &other.events {
            *self.events.entry(kind.clone()).or_default() += n;
        }
        for (reason, n) in &other.drop_reasons {
            *self.drop_reasons.entry(reason.clone()).or_default() += n;
        }
        self.persist_failures += other.persist_failures;
    }

    /// Number of events of one kind
    pub fn count(&self, kind: TrackEventKind) -> usize {
        self.events.get(&kind.to_string()).copied().unwrap_or(0)
    }

    /// Total dropped storms
    pub fn n_dropped(&self) -> usize {
        self.drop_reasons.values().sum()
    }
}

/// Reason recorded for clumps below the minimum storm size
pub const DROP_TOO_SMALL: &str = "below minimum size";

/// Reason recorded for storms whose centroid is off the grid
pub const DROP_OUTSIDE_GRID: &str = "centroid outside grid";

/// One tracking run
pub struct StormTracker {
    config: TrackerConfig,
    clumper: IntervalClumper,
    matcher: TrackContinuityMatcher,
    forecaster: MotionForecaster,
    projection: FlatProjection,
    archive: TrackArchive,
    sink: Option<Box<dyn ArchiveSink + Send>>,
    persist_pending: bool,
    next_scan_num: u32,
    run_start: Option<Timestamp>,
    summary: RunSummary,
}

impl StormTracker {
    /// Create a tracker for a fresh run
    ///
    /// # Arguments
    /// * `config` - Run configuration, validated here
    ///
    /// # Returns
    /// * `Result<StormTracker>` - Err with [`TrackError::Config`] if the
    ///   configuration is invalid
    ///
    /// # Example
    /// ```
    /// use storm_tracker::{StormTracker, TrackerConfig};
    ///
    /// let tracker = StormTracker::new(TrackerConfig::default()).unwrap();
    /// assert_eq!(tracker.archive().n_complex_tracks(), 0);
    /// ```
    pub fn new(config: TrackerConfig) -> Result<Self> {
        Self::with_archive(config, TrackArchive::new())
    }

    /// Resume a run from previously persisted complex tracks
    pub fn resume(config: TrackerConfig, tracks: Vec<ComplexTrack>) -> Result<Self> {
        let archive = TrackArchive::from_complex_tracks(tracks)?;
        Self::with_archive(config, archive)
    }

    fn with_archive(config: TrackerConfig, archive: TrackArchive) -> Result<Self> {
        config.validate()?;

        let forecaster = MotionForecaster::new(config.forecast.clone());
        let matcher = TrackContinuityMatcher::new(config.matching.clone())
            .with_forecaster(forecaster.clone());
        let next_scan_num = archive.last_scan().map_or(0, |(n, _)| n + 1);

        log::info!(
            "Storm tracker ready: {}x{}x{} grid, min_overlap {}, {} existing complex tracks",
            config.geometry.nx,
            config.geometry.ny,
            config.geometry.nz,
            config.clump.min_overlap,
            archive.n_complex_tracks()
        );

        Ok(Self {
            clumper: IntervalClumper::new(config.clump),
            projection: config.geometry.flat_projection(),
            matcher,
            forecaster,
            archive,
            sink: None,
            persist_pending: false,
            next_scan_num,
            run_start: None,
            summary: RunSummary::default(),
            config,
        })
    }

    /// Builder method: persist a snapshot after every scan
    pub fn with_sink(mut self, sink: Box<dyn ArchiveSink + Send>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builder method: anchor the restart schedule at `time` instead of
    /// the first ingested scan. A restarted run starts at its restart
    /// reference even though it first reprocesses earlier overlap scans.
    pub fn with_run_start(mut self, time: Timestamp) -> Self {
        self.run_start = Some(time);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// The run's tracks
    pub fn archive(&self) -> &TrackArchive {
        &self.archive
    }

    /// Give up the tracker, keeping its tracks
    pub fn into_archive(self) -> TrackArchive {
        self.archive
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// True if the last persistence attempt failed
    pub fn persist_pending(&self) -> bool {
        self.persist_pending
    }

    /// Clump, convert and match one scan
    ///
    /// # Arguments
    /// * `scan` - The scan; its time must be later than the previous scan's
    ///
    /// # Returns
    /// * `Result<ScanReport>` - Events for this scan. Storms with a bad
    ///   geometry are dropped and listed in the report; an out-of-order
    ///   scan or an allocation failure while clumping is an error and
    ///   leaves the tracks untouched.
    pub fn ingest_scan(&mut self, scan: Scan) -> Result<ScanReport> {
        let ctx = ScanContext::new(self.next_scan_num, scan.time);
        if let Some((_, previous)) = self.archive.last_scan() {
            if ctx.time <= previous {
                return Err(TrackError::Sequence {
                    previous,
                    received: ctx.time,
                });
            }
        }

        let clumps = self.clumper.clump(&scan.intervals)?;
        let converter = StormConverter::new(&self.config.geometry, &self.projection);
        let field = scan.field.as_ref().map(|g| g as &dyn FieldSource);

        let mut storms = Vec::with_capacity(clumps.len());
        let mut dropped = Vec::new();
        for clump in &clumps.clumps {
            if clump.n_points < self.config.min_storm_points {
                dropped.push(DroppedStorm {
                    clump_id: clump.id,
                    reason: DROP_TOO_SMALL.to_string(),
                });
                continue;
            }
            match converter.convert(clump, field) {
                Ok(storm) => storms.push(storm),
                Err(TrackError::Geometry(msg)) => {
                    log::warn!("Scan {}: dropping storm: {}", ctx.scan_num, msg);
                    dropped.push(DroppedStorm {
                        clump_id: clump.id,
                        reason: DROP_OUTSIDE_GRID.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let events = self.matcher.match_scan(&mut self.archive, &ctx, &storms)?;
        self.next_scan_num += 1;
        self.run_start.get_or_insert(ctx.time);

        let report = ScanReport {
            scan_num: ctx.scan_num,
            time: ctx.time,
            n_clumps: clumps.len(),
            events,
            dropped,
        };
        self.summary.record(&report);

        log::debug!(
            "Scan {} at {}: {} clumps, {} storms, {} dropped, {} active tracks",
            report.scan_num,
            report.time,
            report.n_clumps,
            storms.len(),
            report.dropped.len(),
            self.archive.active_heads(ctx.scan_num)
        );

        if self.sink.is_some() {
            if let Err(e) = self.persist() {
                log::warn!("Failed to persist track archive, will retry next scan: {}", e);
            }
        }

        Ok(report)
    }

    /// Hand a snapshot of the archive to the sink.
    ///
    /// On failure the tracks stay in memory and the snapshot is marked
    /// pending; the next scan tries again.
    pub fn persist(&mut self) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let snapshot = self.archive.snapshot();
        match sink.persist(&snapshot) {
            Ok(()) => {
                if self.persist_pending {
                    log::info!("Track archive persisted after earlier failure");
                }
                self.persist_pending = false;
                Ok(())
            }
            Err(e) => {
                self.persist_pending = true;
                self.summary.persist_failures += 1;
                Err(e)
            }
        }
    }

    /// Motion of a track's last entry as constrained by its neighbours,
    /// projected forward by the lookahead period
    pub fn constrained_motion(&self, simple_id: u32) -> Result<MotionConstraint> {
        let last = self
            .archive
            .simple_track(simple_id)
            .and_then(|t| t.last_entry())
            .ok_or(TrackError::UnknownTrack(simple_id))?;

        let neighbors = self.archive.neighbor_entries(last.scan_num, Some(simple_id));
        Ok(self.forecaster.compute_constrained_motion(
            last.location,
            last.motion.as_ref(),
            &neighbors,
            true,
        ))
    }

    /// Restart window of this run, once the first scan has been ingested
    pub fn restart_window(&self) -> Result<Option<RestartWindow>> {
        match (&self.config.restart, self.run_start) {
            (Some(schedule), Some(start)) => schedule.window(start).map(Some),
            _ => Ok(None),
        }
    }

    /// True if the restart schedule says the run should restart before
    /// ingesting a scan at `scan_time`
    pub fn restart_due(&self, scan_time: Timestamp) -> Result<bool> {
        Ok(self
            .restart_window()?
            .map_or(false, |window| window.is_due(scan_time)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GridGeometry;
    use crate::restart::RestartSchedule;
    use crate::track::ArchiveSnapshot;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    fn t(minutes: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 20, 22, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn config() -> TrackerConfig {
        TrackerConfig::default().with_geometry(GridGeometry::new_2d(40, 40, 1.0))
    }

    fn block(row: u32, begin: i32, end: i32) -> Vec<Interval> {
        (row..row + 3).map(|r| Interval::new(0, r, begin, end)).collect()
    }

    /// Sink that fails a set number of times, then records snapshots
    struct FlakySink {
        failures_left: usize,
        saved: Arc<Mutex<Vec<ArchiveSnapshot>>>,
    }

    impl ArchiveSink for FlakySink {
        fn persist(&mut self, snapshot: &ArchiveSnapshot) -> Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(TrackError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.saved.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    #[test]
    fn test_two_scans_continue() {
        let mut tracker = StormTracker::new(config()).unwrap();
        let first = tracker.ingest_scan(Scan::new(t(0), block(5, 5, 8))).unwrap();
        let second = tracker.ingest_scan(Scan::new(t(5), block(5, 6, 9))).unwrap();

        assert_eq!(first.scan_num, 0);
        assert_eq!(second.scan_num, 1);
        assert_eq!(first.count(TrackEventKind::New), 1);
        assert_eq!(second.count(TrackEventKind::Continued), 1);
        assert_eq!(tracker.summary().n_scans, 2);
        assert_eq!(tracker.summary().n_storms, 2);
    }

    #[test]
    fn test_out_of_order_scan_rejected_before_clumping() {
        let mut tracker = StormTracker::new(config()).unwrap();
        tracker.ingest_scan(Scan::new(t(10), block(5, 5, 8))).unwrap();

        // Invalid intervals would fail clumping, but the time check comes first
        let bad = vec![Interval::new(0, 1, 9, 2)];
        let result = tracker.ingest_scan(Scan::new(t(5), bad));
        assert!(matches!(result, Err(TrackError::Sequence { .. })));
        assert_eq!(tracker.summary().n_scans, 1);
    }

    #[test]
    fn test_invalid_interval_aborts_scan_only() {
        let mut tracker = StormTracker::new(config()).unwrap();
        let bad = vec![Interval::new(0, 1, 9, 2)];
        assert!(matches!(
            tracker.ingest_scan(Scan::new(t(0), bad)),
            Err(TrackError::InvalidInterval(_))
        ));
        // The scan number is not consumed
        let report = tracker.ingest_scan(Scan::new(t(5), block(5, 5, 8))).unwrap();
        assert_eq!(report.scan_num, 0);
    }

    #[test]
    fn test_short_grid_ingests_without_panic() {
        let grid = Grid3 {
            nx: 4,
            ny: 4,
            nz: 1,
            data: vec![50.0; 3],
        };
        let mut tracker = StormTracker::new(config()).unwrap();
        let report = tracker
            .ingest_scan(Scan::from_grid(t(0), grid, 30.0))
            .unwrap();
        assert_eq!(report.n_clumps, 1);
    }

    #[test]
    fn test_storms_outside_grid_are_dropped() {
        let config = TrackerConfig::default().with_geometry(GridGeometry::new_2d(10, 10, 1.0));
        let mut tracker = StormTracker::new(config).unwrap();
        let mut intervals = block(2, 2, 4);
        intervals.extend(block(20, 2, 4));

        let report = tracker.ingest_scan(Scan::new(t(0), intervals)).unwrap();
        assert_eq!(report.n_clumps, 2);
        assert_eq!(report.count(TrackEventKind::New), 1);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].reason, DROP_OUTSIDE_GRID);
        assert_eq!(tracker.summary().n_dropped(), 1);
    }

    #[test]
    fn test_small_clumps_are_dropped() {
        let mut tracker = StormTracker::new(config().with_min_storm_points(5)).unwrap();
        let mut intervals = block(2, 2, 4);
        intervals.push(Interval::new(0, 30, 30, 31));
        let report = tracker.ingest_scan(Scan::new(t(0), intervals)).unwrap();
        assert_eq!(report.count(TrackEventKind::New), 1);
        assert_eq!(report.dropped[0].reason, DROP_TOO_SMALL);
    }

    #[test]
    fn test_failed_persist_is_retried() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = FlakySink {
            failures_left: 1,
            saved: Arc::clone(&saved),
        };
        let mut tracker = StormTracker::new(config()).unwrap().with_sink(Box::new(sink));

        tracker.ingest_scan(Scan::new(t(0), block(5, 5, 8))).unwrap();
        assert!(tracker.persist_pending());
        assert!(saved.lock().unwrap().is_empty());
        assert_eq!(tracker.archive().n_simple_tracks(), 1);

        tracker.ingest_scan(Scan::new(t(5), block(5, 6, 9))).unwrap();
        assert!(!tracker.persist_pending());
        assert_eq!(tracker.summary().persist_failures, 1);

        let saved = saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].complex_tracks[0].n_entries(), 2);
    }

    #[test]
    fn test_resume_continues_numbering() {
        let mut tracker = StormTracker::new(config()).unwrap();
        tracker.ingest_scan(Scan::new(t(0), block(5, 5, 8))).unwrap();
        tracker.ingest_scan(Scan::new(t(5), block(5, 6, 9))).unwrap();
        let tracks = tracker.archive().snapshot().complex_tracks;

        let mut resumed = StormTracker::resume(config(), tracks).unwrap();
        let report = resumed.ingest_scan(Scan::new(t(10), block(5, 7, 10))).unwrap();
        assert_eq!(report.scan_num, 2);
        assert_eq!(report.count(TrackEventKind::Continued), 1);

        assert!(matches!(
            resumed.ingest_scan(Scan::new(t(10), block(5, 7, 10))),
            Err(TrackError::Sequence { .. })
        ));
    }

    #[test]
    fn test_constrained_motion_on_demand() {
        let mut tracker = StormTracker::new(config()).unwrap();
        let mut first = block(5, 5, 8);
        first.extend(block(20, 5, 8));
        tracker.ingest_scan(Scan::new(t(0), first)).unwrap();

        let mut second = block(5, 7, 10);
        second.extend(block(20, 7, 10));
        let report = tracker.ingest_scan(Scan::new(t(5), second)).unwrap();
        let ids: Vec<u32> = report.events.iter().map(|e| e.simple_track_id).collect();

        // The other track moved 2 km east in 5 minutes
        let constraint = tracker.constrained_motion(ids[0]).unwrap();
        let motion = constraint.motion().unwrap();
        assert!((motion.u_kmh - 24.0).abs() < 0.5, "u was {}", motion.u_kmh);

        assert!(matches!(
            tracker.constrained_motion(999),
            Err(TrackError::UnknownTrack(999))
        ));
    }

    #[test]
    fn test_restart_due() {
        let config = config().with_restart(RestartSchedule::new(23, 0, Duration::hours(1)));
        let mut tracker = StormTracker::new(config).unwrap();
        assert!(!tracker.restart_due(t(0)).unwrap());

        tracker.ingest_scan(Scan::new(t(0), block(5, 5, 8))).unwrap();
        let window = tracker.restart_window().unwrap().unwrap();
        assert_eq!(window.next_restart, t(60));
        assert!(!tracker.restart_due(t(55)).unwrap());
        assert!(tracker.restart_due(t(60)).unwrap());
    }

    #[test]
    fn test_restarted_run_anchored_at_reference() {
        let config = config().with_restart(RestartSchedule::new(23, 0, Duration::minutes(30)));
        let mut tracker = StormTracker::new(config).unwrap().with_run_start(t(60));

        // Overlap scans come before the reference but do not move the anchor
        tracker.ingest_scan(Scan::new(t(35), block(5, 5, 8))).unwrap();
        let window = tracker.restart_window().unwrap().unwrap();
        assert_eq!(window.reference, t(60));
        assert!(!tracker.restart_due(t(65)).unwrap());
    }

    #[test]
    fn test_summary_merge() {
        let mut a = StormTracker::new(config()).unwrap();
        a.ingest_scan(Scan::new(t(0), block(5, 5, 8))).unwrap();
        let mut b = StormTracker::new(config()).unwrap();
        b.ingest_scan(Scan::new(t(0), block(5, 5, 8))).unwrap();
        b.ingest_scan(Scan::new(t(5), block(5, 6, 9))).unwrap();

        let mut total = a.summary().clone();
        total.merge(b.summary());
        assert_eq!(total.n_scans, 3);
        assert_eq!(total.count(TrackEventKind::New), 2);
        assert_eq!(total.count(TrackEventKind::Continued), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TrackerConfig::default().with_geometry(GridGeometry::new_2d(0, 10, 1.0));
        assert!(matches!(StormTracker::new(config), Err(TrackError::Config(_))));
    }
}
