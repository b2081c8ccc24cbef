//! Synthetic storm tracking demo
//!
//! Builds a short sequence of dense grids in which one storm drifts east
//! and splits in two while a second storm appears to the north. Prints the
//! events of every scan and the XML dump of each complex track.
//!
//! Run with `RUST_LOG=debug` to see the tracker's own logging.

use chrono::{Duration, TimeZone, Utc};
use storm_tracker::{Grid3, GridGeometry, Scan, StormTracker, TrackerConfig};

fn scan_grid(step: u32) -> Grid3 {
    let mut grid = Grid3::filled(80, 60, 1, 5.0);
    match step {
        0 | 1 => grid.fill_rect(0, (20, 24), (10 + 2 * step, 22 + 2 * step), 45.0),
        _ => {
            // The storm has broken into two cells
            let shift = 2 * step;
            grid.fill_rect(0, (20, 24), (10 + shift, 14 + shift), 48.0);
            grid.fill_rect(0, (20, 24), (18 + shift, 22 + shift), 42.0);
        }
    }
    if step >= 1 {
        grid.fill_rect(0, (30, 33), (40, 44), 38.0);
    }
    grid
}

fn main() {
    env_logger::init();

    let config = TrackerConfig::default()
        .with_geometry(GridGeometry::new_2d(80, 60, 1.0).with_origin(-27.5, 153.0))
        .with_threshold(35.0);
    let threshold = config.threshold;

    let mut tracker = match StormTracker::new(config) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return;
        }
    };

    let t0 = Utc.with_ymd_and_hms(2024, 11, 16, 4, 0, 0).unwrap();

    println!("\n=== Synthetic storm tracking ===\n");
    for step in 0..5 {
        let time = t0 + Duration::minutes(6 * step as i64);
        let report = match tracker.ingest_scan(Scan::from_grid(time, scan_grid(step), threshold)) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Scan {} failed: {}", step, e);
                continue;
            }
        };

        println!("Scan {} at {} ({} clumps)", report.scan_num, report.time, report.n_clumps);
        for event in &report.events {
            match &event.storm {
                Some(storm) => println!(
                    "  {:<9} simple {:>3} complex {:>3}  at ({:.3}, {:.3})  {} cells",
                    event.kind.to_string(),
                    event.simple_track_id,
                    event.complex_track_id,
                    storm.location.lat,
                    storm.location.lon,
                    storm.n_points
                ),
                None => println!(
                    "  {:<9} simple {:>3} complex {:>3}",
                    event.kind.to_string(),
                    event.simple_track_id,
                    event.complex_track_id
                ),
            }
        }
    }

    println!("\n=== Complex tracks ===\n");
    for complex in tracker.archive().complex_tracks() {
        match storm_tracker::to_xml(complex) {
            Ok(xml) => println!("{}\n", xml),
            Err(e) => eprintln!("XML dump failed: {}", e),
        }
    }

    let summary = tracker.summary();
    println!(
        "Scans: {}, storms: {}, dropped: {}",
        summary.n_scans,
        summary.n_storms,
        summary.n_dropped()
    );
    for (kind, count) in &summary.events {
        println!("  {:<9} {}", kind, count);
    }
}
