//! End-to-end tracking scenarios

use chrono::{Duration, TimeZone, Utc};
use storm_tracker::forecast::NeighborEntry;
use storm_tracker::geometry::GeoPoint;
use storm_tracker::storm::CellIndex;
use storm_tracker::{
    assemble, compute_restart, disassemble, read_archive, write_archive, ComplexTrack,
    ForecastParams, GridGeometry, Interval, MotionForecaster, MotionSource, MotionVector, Scan,
    SimpleTrack, StormTracker, Timestamp, TrackEntry, TrackEventKind, TrackerConfig,
};

fn t(minutes: i64) -> Timestamp {
    Utc.with_ymd_and_hms(2023, 8, 14, 20, 0, 0).unwrap() + Duration::minutes(minutes)
}

fn tracker() -> StormTracker {
    let config = TrackerConfig::default().with_geometry(GridGeometry::new_2d(60, 60, 1.0));
    StormTracker::new(config).unwrap()
}

fn rect(rows: std::ops::RangeInclusive<u32>, begin: i32, end: i32) -> Vec<Interval> {
    rows.map(|r| Interval::new(0, r, begin, end)).collect()
}

#[test]
fn test_scenario_continued_track() {
    let mut tracker = tracker();

    let first = tracker
        .ingest_scan(Scan::new(t(0), vec![Interval::new(0, 5, 5, 7)]))
        .unwrap();
    assert_eq!(first.n_clumps, 1);
    assert_eq!(first.events[0].kind, TrackEventKind::New);

    let second = tracker
        .ingest_scan(Scan::new(t(5), vec![Interval::new(0, 5, 6, 8)]))
        .unwrap();
    assert_eq!(second.events.len(), 1);
    assert_eq!(second.events[0].kind, TrackEventKind::Continued);
    assert_eq!(second.events[0].simple_track_id, first.events[0].simple_track_id);

    let track = tracker
        .archive()
        .simple_track(first.events[0].simple_track_id)
        .unwrap();
    assert_eq!(track.entries().len(), 2);
}

#[test]
fn test_scenario_split() {
    let mut tracker = tracker();

    let first = tracker
        .ingest_scan(Scan::new(t(0), rect(5..=7, 5, 14)))
        .unwrap();
    let parent = first.events[0].simple_track_id;
    let complex = first.events[0].complex_track_id;

    let mut halves = rect(5..=7, 5, 8);
    halves.extend(rect(5..=7, 11, 14));
    let second = tracker.ingest_scan(Scan::new(t(5), halves)).unwrap();

    assert_eq!(second.n_clumps, 2);
    assert_eq!(second.count(TrackEventKind::Split), 2);
    assert_eq!(second.count(TrackEventKind::Ended), 1);

    for event in second.storm_events() {
        assert_eq!(event.complex_track_id, complex);
        assert_ne!(event.simple_track_id, parent);
        let child = tracker.archive().simple_track(event.simple_track_id).unwrap();
        assert_eq!(child.parents, vec![parent]);
    }
    assert_eq!(tracker.archive().n_complex_tracks(), 1);
    assert_eq!(
        tracker.archive().simple_track(parent).unwrap().children.len(),
        2
    );
}

#[test]
fn test_merge_never_adds_complex_tracks() {
    let mut tracker = tracker();
    let mut pair = rect(5..=7, 5, 8);
    pair.extend(rect(5..=7, 11, 14));
    tracker.ingest_scan(Scan::new(t(0), pair)).unwrap();
    let before = tracker.archive().n_complex_tracks();
    assert_eq!(before, 2);

    let report = tracker
        .ingest_scan(Scan::new(t(5), rect(5..=7, 5, 14)))
        .unwrap();
    assert_eq!(report.count(TrackEventKind::Merged), 1);
    assert_eq!(report.count(TrackEventKind::Ended), 2);
    assert!(tracker.archive().n_complex_tracks() < before);
}

#[test]
fn test_resume_after_merge_keeps_complex_ids_unique() {
    let mut tracker = tracker();
    let mut pair = rect(5..=7, 5, 8);
    pair.extend(rect(5..=7, 11, 14));
    let first = tracker.ingest_scan(Scan::new(t(0), pair)).unwrap();
    let absorbed = first
        .storm_events()
        .map(|e| e.complex_track_id)
        .max()
        .unwrap();
    tracker
        .ingest_scan(Scan::new(t(5), rect(5..=7, 5, 14)))
        .unwrap();
    assert_ne!(tracker.archive().resolve_complex(absorbed), absorbed);

    let mut buf = Vec::new();
    write_archive(&mut buf, &tracker.archive().snapshot().complex_tracks).unwrap();
    let tracks = read_archive(&buf).unwrap();
    let mut resumed = StormTracker::resume(tracker.config().clone(), tracks).unwrap();

    let mut intervals = rect(5..=7, 5, 14);
    intervals.extend(rect(40..=42, 40, 44));
    let report = resumed.ingest_scan(Scan::new(t(10), intervals)).unwrap();
    let new_ids: Vec<u32> = report
        .events
        .iter()
        .filter(|e| e.kind == TrackEventKind::New)
        .map(|e| e.complex_track_id)
        .collect();
    assert_eq!(new_ids.len(), 1);
    assert!(new_ids[0] > absorbed);
}

#[test]
fn test_active_heads_match_accepted_storms() {
    let mut tracker = tracker();
    let scans: Vec<Vec<Interval>> = vec![
        [rect(5..=7, 5, 8), rect(30..=32, 30, 34)].concat(),
        [rect(5..=7, 6, 9), rect(30..=32, 31, 35), rect(50..=51, 2, 4)].concat(),
        [rect(5..=7, 5, 7), rect(5..=7, 10, 12), rect(30..=32, 31, 35)].concat(),
        [rect(5..=7, 6, 12), rect(45..=46, 45, 50)].concat(),
        Vec::new(),
        rect(40..=42, 10, 12),
    ];

    for (i, intervals) in scans.into_iter().enumerate() {
        let complex_before = tracker.archive().n_complex_tracks();
        let report = tracker
            .ingest_scan(Scan::new(t(5 * i as i64), intervals))
            .unwrap();

        let accepted = report.storm_events().count();
        assert_eq!(
            tracker.archive().active_heads(report.scan_num),
            accepted,
            "scan {}",
            i
        );
        assert!(
            tracker.archive().n_complex_tracks()
                <= complex_before + report.count(TrackEventKind::New),
            "scan {}",
            i
        );
    }
}

fn entry(scan_num: u32, motion: Option<MotionVector>) -> TrackEntry {
    TrackEntry {
        scan_num,
        time: t(6 * scan_num as i64),
        storm_num: 0,
        centroid_x: 20.0 + scan_num as f64 * 0.5,
        centroid_y: 31.25,
        centroid_z: 0.0,
        location: GeoPoint::new(51.5, -0.12),
        n_points: 40,
        n_intervals: 6,
        base_plane: 0,
        top_plane: 0,
        max_value: 48.5,
        max_location: CellIndex {
            plane: 0,
            row: 31,
            col: 20,
        },
        motion,
    }
}

#[test]
fn test_scenario_serialized_length() {
    let mut complex = ComplexTrack::new(3);

    let mut first = SimpleTrack::new(10, 3);
    for scan in 0..3 {
        first.push_entry(entry(scan, None)).unwrap();
    }
    first.children = vec![11];

    let mut second = SimpleTrack::new(11, 3);
    for scan in 3..8 {
        let motion = MotionVector::new(8.0, 3.0, MotionSource::History);
        second.push_entry(entry(scan, Some(motion))).unwrap();
    }
    second.parents = vec![10];

    complex.add_simple_track(first);
    complex.add_simple_track(second);

    let bytes = assemble(&complex);
    assert_eq!(bytes.len(), 72 + 2 * 104 + 8 * 112);

    let (decoded, consumed) = disassemble(&bytes).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(decoded.id, 3);
    assert_eq!(decoded.simple_tracks().len(), 2);
    assert_eq!(decoded.simple_tracks()[0].entries().len(), 3);
    assert_eq!(decoded.simple_tracks()[1].entries().len(), 5);
    assert_eq!(decoded, complex);
}

#[test]
fn test_restart_is_idempotent() {
    let trigger = t(137);
    for (hour, minute) in [(0, 0), (12, 30), (23, 59)] {
        let a = compute_restart(trigger, hour, minute, Duration::hours(2)).unwrap();
        let b = compute_restart(trigger, hour, minute, Duration::hours(2)).unwrap();
        assert_eq!(a, b);
        assert!(a.reference <= trigger);
        assert!(a.next_restart > trigger);
    }
}

#[test]
fn test_forecaster_symmetry() {
    let radius = 40.0;
    let forecaster = MotionForecaster::new(ForecastParams {
        radius_km: radius,
        lookahead_minutes: 0.0,
    });
    let center = GeoPoint::new(-12.0, 131.0);

    for (east, north) in [(1.0, 0.0), (0.0, 1.0), (0.6, 0.8)] {
        let d = radius / 2.0;
        let a = NeighborEntry {
            location: center.offset_km(east * d, north * d),
            motion: MotionVector::new(25.0, -10.0, MotionSource::History),
        };
        let b = NeighborEntry {
            location: center.offset_km(-east * d, -north * d),
            motion: MotionVector::new(-25.0, 10.0, MotionSource::History),
        };
        let motion = forecaster
            .compute_constrained_motion(center, None, &[a, b], false)
            .motion()
            .unwrap();
        assert!(motion.speed() < 1e-2, "speed was {}", motion.speed());
    }
}
