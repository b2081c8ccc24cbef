//! Human-readable XML dump of complex tracks
//!
//! Used for diffable fixtures and for eyeballing archives. The layout is a
//! flat view of the in-memory hierarchy; it is not read back.

use serde::Serialize;

use crate::track::{ComplexTrack, SimpleTrack, TrackEntry, TrackState};
use crate::types::{MotionSource, Result, Timestamp, TrackError};

#[derive(Serialize)]
struct XmlComplexTrack {
    #[serde(rename = "@id")]
    id: u32,
    start_scan: u32,
    end_scan: u32,
    start_time: String,
    end_time: String,
    duration_in_scans: u32,
    duration_secs: i64,
    n_entries: u32,
    max_points: u32,
    max_value: f64,
    simple_track: Vec<XmlSimpleTrack>,
}

#[derive(Serialize)]
struct XmlSimpleTrack {
    #[serde(rename = "@id")]
    id: u32,
    #[serde(rename = "@state")]
    state: &'static str,
    parent: Vec<u32>,
    child: Vec<u32>,
    entry: Vec<XmlEntry>,
}

#[derive(Serialize)]
struct XmlEntry {
    #[serde(rename = "@scan")]
    scan_num: u32,
    #[serde(rename = "@storm")]
    storm_num: u32,
    time: String,
    lat: String,
    lon: String,
    centroid: String,
    n_points: u32,
    n_intervals: u32,
    planes: String,
    max_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    motion: Option<XmlMotion>,
}

#[derive(Serialize)]
struct XmlMotion {
    #[serde(rename = "@source")]
    source: &'static str,
    speed_kmh: String,
    direction_deg: String,
}

fn time_str(t: &Timestamp) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

impl From<&TrackEntry> for XmlEntry {
    fn from(e: &TrackEntry) -> Self {
        Self {
            scan_num: e.scan_num,
            storm_num: e.storm_num,
            time: time_str(&e.time),
            lat: format!("{:.4}", e.location.lat),
            lon: format!("{:.4}", e.location.lon),
            centroid: format!("{:.2} {:.2} {:.2}", e.centroid_x, e.centroid_y, e.centroid_z),
            n_points: e.n_points,
            n_intervals: e.n_intervals,
            planes: format!("{}-{}", e.base_plane, e.top_plane),
            max_value: e.max_value,
            motion: e.motion.map(|m| XmlMotion {
                source: match m.source {
                    MotionSource::History => "history",
                    MotionSource::Constrained => "constrained",
                },
                speed_kmh: format!("{:.2}", m.speed()),
                direction_deg: format!("{:.1}", m.direction()),
            }),
        }
    }
}

impl From<&SimpleTrack> for XmlSimpleTrack {
    fn from(s: &SimpleTrack) -> Self {
        Self {
            id: s.id,
            state: match s.state {
                TrackState::Active => "active",
                TrackState::Ended => "ended",
            },
            parent: s.parents.clone(),
            child: s.children.clone(),
            entry: s.entries().iter().map(XmlEntry::from).collect(),
        }
    }
}

/// Render one complex track as an XML document fragment
pub fn to_xml(track: &ComplexTrack) -> Result<String> {
    let stats = track.stats();
    let view = XmlComplexTrack {
        id: track.id,
        start_scan: stats.start_scan,
        end_scan: stats.end_scan,
        start_time: time_str(&stats.start_time),
        end_time: time_str(&stats.end_time),
        duration_in_scans: stats.duration_in_scans,
        duration_secs: stats.duration_secs,
        n_entries: stats.n_entries,
        max_points: stats.max_points,
        max_value: stats.max_value,
        simple_track: track.simple_tracks().iter().map(XmlSimpleTrack::from).collect(),
    };

    quick_xml::se::to_string_with_root("complex_track", &view)
        .map_err(|e| {
            TrackError::Serialization(format!("XML dump of complex track {}: {}", track.id, e))
        })
}
