//! Tracking runs over scan series files
//!
//! A scan series is a JSON document holding the scans of one data stream in
//! time order. Every series is tracked independently and writes its own
//! archive file(s). With a restart schedule configured the run is cut at the
//! daily restart time; the new run reprocesses the overlap period so tracks
//! alive across the boundary keep going.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use storm_tracker::{
    FileArchiveSink, Grid3, Interval, RestartWindow, RunSummary, Scan, ScanReport, StormTracker,
    TrackError, TrackerConfig,
};

/// One scan as stored in a series file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanInput {
    pub time: DateTime<Utc>,
    /// Pre-extracted intervals
    #[serde(default)]
    pub intervals: Vec<Interval>,
    /// Dense field; when present it is thresholded and replaces `intervals`
    #[serde(default)]
    pub grid: Option<Grid3>,
}

/// A scan series file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanSeries {
    /// Series name, used for archive file names (defaults to the file stem)
    #[serde(default)]
    pub name: Option<String>,
    pub scans: Vec<ScanInput>,
}

impl ScanInput {
    fn to_scan(&self, threshold: f32) -> Scan {
        match &self.grid {
            Some(grid) => Scan::from_grid(self.time, grid.clone(), threshold),
            None => Scan::new(self.time, self.intervals.clone()),
        }
    }
}

/// Load a scan series from a JSON file
pub fn load_series(path: &Path) -> Result<ScanSeries> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scan file: {:?}", path))?;
    let mut series: ScanSeries = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse scan file: {:?}", path))?;

    if series.name.is_none() {
        series.name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned());
    }
    Ok(series)
}

/// Options shared by all runs
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub archive_dir: PathBuf,
    /// Continue from an existing archive instead of starting fresh
    pub resume: bool,
    /// Write every scan report as JSON lines next to the archive
    pub write_events: bool,
}

/// Result of tracking one scan series
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub name: String,
    /// Archive files written, one per run segment
    pub archives: Vec<PathBuf>,
    /// Totals over all segments; overlap scans count once per segment
    pub summary: RunSummary,
    pub restarts: usize,
    /// Complex tracks in the final segment
    pub n_complex_tracks: usize,
    /// Scans that could not be ingested
    pub scan_errors: Vec<String>,
}

/// Track one scan series
pub fn run_series(
    series: &ScanSeries,
    config: &TrackerConfig,
    options: &RunOptions,
) -> Result<RunOutcome> {
    let name = series.name.clone().unwrap_or_else(|| "series".to_string());
    log::info!("Tracking series '{}' ({} scans)", name, series.scans.len());

    let mut events_out = if options.write_events {
        let path = options.archive_dir.join(format!("{}.events.jsonl", name));
        // A resumed run extends the event log of the run it continues
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(options.resume)
            .truncate(!options.resume)
            .open(&path)
            .with_context(|| format!("Failed to open events file: {:?}", path))?;
        Some(BufWriter::new(file))
    } else {
        None
    };

    let mut outcome = RunOutcome {
        name: name.clone(),
        archives: Vec::new(),
        summary: RunSummary::default(),
        restarts: 0,
        n_complex_tracks: 0,
        scan_errors: Vec::new(),
    };

    let first_window = match (&config.restart, series.scans.first()) {
        (Some(schedule), Some(first)) => Some(schedule.window(first.time)?),
        _ => None,
    };
    let path = archive_path(&options.archive_dir, &name, first_window.as_ref());
    let mut tracker = open_tracker(config, &path, options.resume)?;
    if let Some(window) = &first_window {
        tracker = tracker.with_run_start(window.reference);
    }
    let skip_until = if options.resume {
        tracker.archive().last_scan().map(|(_, time)| time)
    } else {
        None
    };
    outcome.archives.push(path);

    for (i, input) in series.scans.iter().enumerate() {
        if skip_until.map_or(false, |last| input.time <= last) {
            log::debug!("Series '{}': scan at {} already tracked", name, input.time);
            continue;
        }

        if tracker.restart_due(input.time)? {
            let window = config
                .restart
                .as_ref()
                .map(|schedule| schedule.window(input.time))
                .transpose()?
                .context("restart due without a schedule")?;
            log::info!(
                "Series '{}': restarting at {}, reprocessing from {}",
                name,
                window.reference,
                window.start
            );

            close_tracker(&mut tracker, &name);
            outcome.summary.merge(tracker.summary());

            let path = archive_path(&options.archive_dir, &name, Some(&window));
            tracker = open_tracker(config, &path, false)?.with_run_start(window.reference);
            outcome.archives.push(path);
            outcome.restarts += 1;

            let overlap = series.scans[..i]
                .iter()
                .filter(|s| s.time >= window.start && s.time < input.time);
            for earlier in overlap {
                ingest(&mut tracker, earlier, config.threshold, &mut outcome, events_out.as_mut())?;
            }
        }

        ingest(&mut tracker, input, config.threshold, &mut outcome, events_out.as_mut())?;
    }

    close_tracker(&mut tracker, &name);
    outcome.summary.merge(tracker.summary());
    outcome.n_complex_tracks = tracker.archive().n_complex_tracks();

    if let Some(mut out) = events_out {
        out.flush().context("Failed to flush events file")?;
    }

    log::info!(
        "Series '{}' done: {} scans, {} storms, {} complex tracks",
        name,
        outcome.summary.n_scans,
        outcome.summary.n_storms,
        outcome.n_complex_tracks
    );
    Ok(outcome)
}

/// Archive file for a run segment, named after its restart reference
fn archive_path(dir: &Path, name: &str, window: Option<&RestartWindow>) -> PathBuf {
    match window {
        Some(w) => dir.join(format!("{}_{}.ctrk", name, w.reference.format("%Y%m%d_%H%M"))),
        None => dir.join(format!("{}.ctrk", name)),
    }
}

fn open_tracker(config: &TrackerConfig, path: &Path, resume: bool) -> Result<StormTracker> {
    let sink = FileArchiveSink::new(path);
    let tracker = if resume && path.exists() {
        let tracks = sink
            .load()
            .with_context(|| format!("Failed to load archive: {:?}", path))?;
        log::info!("Resuming from {:?} ({} complex tracks)", path, tracks.len());
        StormTracker::resume(config.clone(), tracks)?
    } else {
        StormTracker::new(config.clone())?
    };
    Ok(tracker.with_sink(Box::new(sink)))
}

/// Final persistence attempt for a run segment
fn close_tracker(tracker: &mut StormTracker, name: &str) {
    if let Err(e) = tracker.persist() {
        log::error!("Series '{}': failed to persist track archive: {}", name, e);
    }
}

/// Ingest one scan; bad scans are logged and recorded, not fatal
fn ingest(
    tracker: &mut StormTracker,
    input: &ScanInput,
    threshold: f32,
    outcome: &mut RunOutcome,
    events_out: Option<&mut BufWriter<File>>,
) -> Result<()> {
    let report: ScanReport = match tracker.ingest_scan(input.to_scan(threshold)) {
        Ok(report) => report,
        Err(e @ (TrackError::Sequence { .. } | TrackError::InvalidInterval(_))) => {
            log::warn!("Series '{}': skipping scan at {}: {}", outcome.name, input.time, e);
            outcome.scan_errors.push(format!("{}: {}", input.time, e));
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(out) = events_out {
        serde_json::to_writer(&mut *out, &report).context("Failed to write scan report")?;
        writeln!(out).context("Failed to write scan report")?;
    }
    Ok(())
}
