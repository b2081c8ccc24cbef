//! Report generation
//!
//! Run summaries and archive listings as plain text or JSON.

use anyhow::{Context, Result};
use std::fmt::Write;
use storm_tracker::{IndexEntry, TrackEventKind};

use crate::runner::RunOutcome;

const RULE: &str = "═══════════════════════════════════════════════";

/// Plain text summary of all runs
pub fn outcomes_txt(outcomes: &[RunOutcome]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "  Storm Tracking Summary");
    let _ = writeln!(out, "{}\n", RULE);

    for outcome in outcomes {
        let s = &outcome.summary;
        let _ = writeln!(out, "Series: {}", outcome.name);
        let _ = writeln!(out, "  Scans:          {}", s.n_scans);
        let _ = writeln!(out, "  Storms:         {}", s.n_storms);
        let _ = writeln!(out, "  Dropped:        {}", s.n_dropped());
        let _ = writeln!(out, "  Complex tracks: {}", outcome.n_complex_tracks);
        if outcome.restarts > 0 {
            let _ = writeln!(out, "  Restarts:       {}", outcome.restarts);
        }
        if s.persist_failures > 0 {
            let _ = writeln!(out, "  Persist errors: {}", s.persist_failures);
        }

        let _ = writeln!(out, "  Events:");
        for kind in TrackEventKind::all() {
            let _ = writeln!(out, "    {:<10} {}", kind.to_string(), s.count(kind));
        }

        if !s.drop_reasons.is_empty() {
            let _ = writeln!(out, "  Drop reasons:");
            for (reason, n) in &s.drop_reasons {
                let _ = writeln!(out, "    {:<22} {}", reason, n);
            }
        }

        for error in &outcome.scan_errors {
            let _ = writeln!(out, "  Skipped scan {}", error);
        }

        for archive in &outcome.archives {
            let _ = writeln!(out, "  Archive: {:?}", archive);
        }
        let _ = writeln!(out);
    }
    out
}

/// JSON summary of all runs
pub fn outcomes_json(outcomes: &[RunOutcome]) -> Result<String> {
    serde_json::to_string_pretty(outcomes).context("Failed to serialize run summary")
}

/// Table of the complex tracks in an archive
pub fn index_txt(index: &[IndexEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>8}  {:>10}  {:>8}  {:<20}  {:<20}",
        "complex", "offset", "bytes", "start", "end"
    );
    for entry in index {
        let _ = writeln!(
            out,
            "{:>8}  {:>10}  {:>8}  {:<20}  {:<20}",
            entry.complex_id,
            entry.offset,
            entry.len,
            entry.start_time.format("%Y-%m-%d %H:%M:%S"),
            entry.end_time.format("%Y-%m-%d %H:%M:%S")
        );
    }
    let _ = writeln!(out, "{} complex tracks", index.len());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;
    use storm_tracker::RunSummary;

    fn outcome() -> RunOutcome {
        let mut summary = RunSummary::default();
        summary.n_scans = 12;
        summary.n_storms = 30;
        summary.events.insert("NEW".to_string(), 4);
        summary.events.insert("CONTINUED".to_string(), 26);
        summary.drop_reasons.insert("below minimum size".to_string(), 2);

        RunOutcome {
            name: "kfws".to_string(),
            archives: vec![PathBuf::from("tracks/kfws.ctrk")],
            summary,
            restarts: 0,
            n_complex_tracks: 3,
            scan_errors: Vec::new(),
        }
    }

    #[test]
    fn test_txt_summary() {
        let txt = outcomes_txt(&[outcome()]);
        assert!(txt.contains("Series: kfws"));
        assert!(txt.contains("Scans:          12"));
        assert!(txt.contains("CONTINUED  26"));
        assert!(txt.contains("MERGED     0"));
        assert!(txt.contains("below minimum size"));
        assert!(!txt.contains("Restarts"));
    }

    #[test]
    fn test_json_summary() {
        let json = outcomes_json(&[outcome()]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["name"], "kfws");
        assert_eq!(value[0]["summary"]["events"]["NEW"], 4);
    }

    #[test]
    fn test_index_table() {
        let t = Utc.with_ymd_and_hms(2021, 5, 2, 18, 0, 0).unwrap();
        let index = vec![IndexEntry {
            offset: 0,
            len: 392,
            complex_id: 7,
            start_time: t,
            end_time: t,
        }];
        let txt = index_txt(&index);
        assert!(txt.contains("2021-05-02 18:00:00"));
        assert!(txt.ends_with("1 complex tracks\n"));
    }
}
