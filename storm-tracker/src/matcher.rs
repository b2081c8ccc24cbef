//! Scan-to-scan track continuity
//!
//! Each scan's storms are associated with the tracks still open from
//! earlier scans. Candidate pairs are scored by how far the storm lies from
//! the track's predicted position, relative to the distance the track could
//! reasonably have moved. Pairs are then resolved into a bipartite graph
//! whose connected components decide the outcome:
//!
//! - one track and one storm: the track continues
//! - anything larger: the tracks end and every storm starts a new track
//!   with its linked tracks as parents (a split or a merge)
//!
//! Storms with no candidate start new tracks; open tracks with no
//! candidate wait out the missed-scan tolerance, then end.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::forecast::MotionForecaster;
use crate::storm::StormDescriptor;
use crate::track::{whole_seconds, TrackArchive, TrackEntry, MAX_CHILDREN, MAX_PARENTS};
use crate::types::{
    MotionSource, MotionVector, Result, Timestamp, TrackError, TrackEvent, TrackEventKind,
};

/// Matching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchParams {
    /// Scans a track may go without a storm before it ends
    #[serde(default = "default_max_missed_scans")]
    pub max_missed_scans: u32,

    /// Maximum age of a track's last entry (seconds)
    #[serde(default = "default_max_delta_time_secs")]
    pub max_delta_time_secs: i64,

    /// Assumed speed for tracks without a motion estimate (km/h)
    #[serde(default = "default_speed_kmh")]
    pub default_speed_kmh: f64,

    /// Multiplier applied to speed x time to get the search distance
    #[serde(default = "default_speed_tolerance")]
    pub speed_tolerance: f64,

    /// Lower bound on the search distance (km)
    #[serde(default = "default_min_search_radius_km")]
    pub min_search_radius_km: f64,

    /// Pairs scoring below this are discarded
    #[serde(default)]
    pub min_match_score: f64,

    /// Maximum parents of a merged track
    #[serde(default = "default_max_links")]
    pub max_parents: usize,

    /// Maximum children of a split track
    #[serde(default = "default_max_links")]
    pub max_children: usize,

    /// Give new tracks a motion borrowed from their neighbours
    #[serde(default = "default_smooth_new_tracks")]
    pub smooth_new_tracks: bool,
}

fn default_max_missed_scans() -> u32 {
    1
}

fn default_max_delta_time_secs() -> i64 {
    1800
}

fn default_speed_kmh() -> f64 {
    30.0
}

fn default_speed_tolerance() -> f64 {
    1.5
}

fn default_min_search_radius_km() -> f64 {
    10.0
}

fn default_max_links() -> usize {
    MAX_PARENTS
}

fn default_smooth_new_tracks() -> bool {
    true
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            max_missed_scans: default_max_missed_scans(),
            max_delta_time_secs: default_max_delta_time_secs(),
            default_speed_kmh: default_speed_kmh(),
            speed_tolerance: default_speed_tolerance(),
            min_search_radius_km: default_min_search_radius_km(),
            min_match_score: 0.0,
            max_parents: default_max_links(),
            max_children: default_max_links(),
            smooth_new_tracks: default_smooth_new_tracks(),
        }
    }
}

impl MatchParams {
    /// Builder method: set the missed-scan tolerance
    pub fn with_max_missed_scans(mut self, scans: u32) -> Self {
        self.max_missed_scans = scans;
        self
    }

    /// Builder method: set the minimum search radius
    pub fn with_min_search_radius_km(mut self, km: f64) -> Self {
        self.min_search_radius_km = km;
        self
    }

    /// Builder method: set the minimum match score
    pub fn with_min_match_score(mut self, score: f64) -> Self {
        self.min_match_score = score;
        self
    }

    /// Check parameter ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_delta_time_secs <= 0 {
            return Err(TrackError::Config(format!(
                "max_delta_time_secs must be positive, got {}",
                self.max_delta_time_secs
            )));
        }
        if !(self.default_speed_kmh >= 0.0) || !(self.speed_tolerance > 0.0) {
            return Err(TrackError::Config(format!(
                "invalid speed settings: default {} km/h, tolerance {}",
                self.default_speed_kmh, self.speed_tolerance
            )));
        }
        if !(self.min_search_radius_km > 0.0) {
            return Err(TrackError::Config(format!(
                "min_search_radius_km must be positive, got {}",
                self.min_search_radius_km
            )));
        }
        if !(self.min_match_score <= 1.0) {
            return Err(TrackError::Config(format!(
                "min_match_score must not exceed 1, got {}",
                self.min_match_score
            )));
        }
        if !(1..=MAX_PARENTS).contains(&self.max_parents) {
            return Err(TrackError::Config(format!(
                "max_parents must be in 1..={}, got {}",
                MAX_PARENTS, self.max_parents
            )));
        }
        if !(1..=MAX_CHILDREN).contains(&self.max_children) {
            return Err(TrackError::Config(format!(
                "max_children must be in 1..={}, got {}",
                MAX_CHILDREN, self.max_children
            )));
        }
        Ok(())
    }
}

/// Scan being matched
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanContext {
    /// Sequential scan number
    pub scan_num: u32,
    /// Scan time, whole seconds
    pub time: Timestamp,
}

impl ScanContext {
    pub fn new(scan_num: u32, time: Timestamp) -> Self {
        Self {
            scan_num,
            time: whole_seconds(time),
        }
    }
}

/// A scored (track, storm) pair
#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f64,
    track: u32,
    storm: usize,
}

/// Track/storm links forming the bipartite match graph
struct Links {
    track_storms: BTreeMap<u32, Vec<usize>>,
    storm_tracks: Vec<Vec<u32>>,
}

impl Links {
    fn new(n_storms: usize) -> Self {
        Self {
            track_storms: BTreeMap::new(),
            storm_tracks: vec![Vec::new(); n_storms],
        }
    }

    fn add(&mut self, track: u32, storm: usize) {
        self.track_storms.entry(track).or_default().push(storm);
        self.storm_tracks[storm].push(track);
    }

    fn track_degree(&self, track: u32) -> usize {
        self.track_storms.get(&track).map_or(0, Vec::len)
    }

    /// Tracks and storms connected to `storm`, both ascending
    fn component(&self, storm: usize) -> (Vec<u32>, Vec<usize>) {
        let mut tracks = BTreeSet::new();
        let mut storms = BTreeSet::new();
        let mut queue = VecDeque::from([storm]);
        storms.insert(storm);

        while let Some(s) = queue.pop_front() {
            for &t in &self.storm_tracks[s] {
                if !tracks.insert(t) {
                    continue;
                }
                for &next in self.track_storms.get(&t).into_iter().flatten() {
                    if storms.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        (tracks.into_iter().collect(), storms.into_iter().collect())
    }
}

/// A component that does not simply continue one track
struct Branch {
    tracks: Vec<u32>,
    storms: Vec<usize>,
}

/// Associates each scan's storms with existing tracks
#[derive(Debug, Clone)]
pub struct TrackContinuityMatcher {
    params: MatchParams,
    forecaster: Option<MotionForecaster>,
}

impl TrackContinuityMatcher {
    /// Create a matcher without motion smoothing for new tracks
    pub fn new(params: MatchParams) -> Self {
        Self {
            params,
            forecaster: None,
        }
    }

    /// Builder method: use a forecaster for new-track motion
    pub fn with_forecaster(mut self, forecaster: MotionForecaster) -> Self {
        self.forecaster = Some(forecaster);
        self
    }

    pub fn params(&self) -> &MatchParams {
        &self.params
    }

    /// Score a storm against a track's last entry; higher is better.
    ///
    /// 1 means the storm sits on the predicted position, 0 means it lies at
    /// the edge of the reasonable search distance.
    pub fn score(&self, last: &TrackEntry, storm: &StormDescriptor, time: Timestamp) -> f64 {
        let dt_hours = hours_between(last.time, time);

        let (predicted, speed) = match last.motion {
            Some(m) => (
                last.location.offset_km(m.u_kmh * dt_hours, m.v_kmh * dt_hours),
                m.speed(),
            ),
            None => (last.location, self.params.default_speed_kmh),
        };

        let reasonable = (speed * dt_hours * self.params.speed_tolerance)
            .max(self.params.min_search_radius_km);
        1.0 - predicted.distance_km(&storm.location) / reasonable
    }

    /// Match one scan's storms into the archive.
    ///
    /// Returns the events in storm order, followed by ENDED events in
    /// ascending track id order.
    pub fn match_scan(
        &self,
        archive: &mut TrackArchive,
        ctx: &ScanContext,
        storms: &[StormDescriptor],
    ) -> Result<Vec<TrackEvent>> {
        if let Some((_, previous)) = archive.last_scan() {
            if ctx.time <= previous {
                return Err(TrackError::Sequence {
                    previous,
                    received: ctx.time,
                });
            }
        }

        let mut ended = Vec::new();
        let open = self.close_stale_tracks(archive, ctx, &mut ended)?;
        let candidates = self.score_candidates(&open, ctx, storms);
        let links = self.resolve(&open, storms.len(), &candidates);

        let mut storm_events: Vec<Option<TrackEvent>> = vec![None; storms.len()];
        let mut branches = Vec::new();
        let mut visited = vec![false; storms.len()];

        // Continuations first, so new tracks can borrow their motion
        for idx in 0..storms.len() {
            if visited[idx] {
                continue;
            }
            let (tracks, members) = links.component(idx);
            for &s in &members {
                visited[s] = true;
            }

            match (tracks.as_slice(), members.as_slice()) {
                ([], _) => {}
                ([track], [storm]) => {
                    let last = open
                        .get(track)
                        .ok_or(TrackError::UnknownTrack(*track))?;
                    let motion = history_motion(last, &storms[*storm], ctx.time);
                    let entry = TrackEntry::from_storm(
                        ctx.scan_num,
                        ctx.time,
                        *storm as u32,
                        &storms[*storm],
                        motion,
                    );
                    archive.append_entry(*track, entry)?;
                    storm_events[*storm] = Some(TrackEvent {
                        kind: TrackEventKind::Continued,
                        simple_track_id: *track,
                        complex_track_id: archive
                            .complex_id_of(*track)
                            .ok_or(TrackError::UnknownTrack(*track))?,
                        storm: Some(storms[*storm].clone()),
                    });
                }
                _ => branches.push(Branch {
                    tracks,
                    storms: members,
                }),
            }
        }

        let neighbors = match &self.forecaster {
            Some(_) if self.params.smooth_new_tracks => {
                archive.neighbor_entries(ctx.scan_num, None)
            }
            _ => Vec::new(),
        };
        let new_track_motion = |storm: &StormDescriptor| -> Option<MotionVector> {
            let forecaster = self.forecaster.as_ref()?;
            if !self.params.smooth_new_tracks {
                return None;
            }
            forecaster
                .compute_constrained_motion(storm.location, None, &neighbors, false)
                .motion()
        };

        for branch in branches {
            let complex_ids = branch
                .tracks
                .iter()
                .map(|&t| archive.complex_id_of(t).ok_or(TrackError::UnknownTrack(t)))
                .collect::<Result<Vec<u32>>>()?;
            let survivor = archive.merge_complex(&complex_ids)?;

            for &track in &branch.tracks {
                archive.end_track(track)?;
                ended.push(ended_event(track, survivor));
            }

            for &idx in &branch.storms {
                let parents = &links.storm_tracks[idx];
                let entry = TrackEntry::from_storm(
                    ctx.scan_num,
                    ctx.time,
                    idx as u32,
                    &storms[idx],
                    new_track_motion(&storms[idx]),
                );
                let mut sorted_parents = parents.clone();
                sorted_parents.sort_unstable();
                let (simple_id, complex_id) =
                    archive.start_track(&sorted_parents, Some(survivor), entry)?;
                for &parent in &sorted_parents {
                    archive.add_child(parent, simple_id)?;
                }

                let kind = if sorted_parents.len() >= 2 {
                    TrackEventKind::Merged
                } else {
                    TrackEventKind::Split
                };
                log::debug!(
                    "Scan {}: storm {} {} from {:?} as track {}",
                    ctx.scan_num,
                    idx,
                    kind,
                    sorted_parents,
                    simple_id
                );
                storm_events[idx] = Some(TrackEvent {
                    kind,
                    simple_track_id: simple_id,
                    complex_track_id: complex_id,
                    storm: Some(storms[idx].clone()),
                });
            }
        }

        for (idx, storm) in storms.iter().enumerate() {
            if storm_events[idx].is_some() {
                continue;
            }
            let entry = TrackEntry::from_storm(
                ctx.scan_num,
                ctx.time,
                idx as u32,
                storm,
                new_track_motion(storm),
            );
            let (simple_id, complex_id) = archive.start_track(&[], None, entry)?;
            storm_events[idx] = Some(TrackEvent {
                kind: TrackEventKind::New,
                simple_track_id: simple_id,
                complex_track_id: complex_id,
                storm: Some(storm.clone()),
            });
        }

        // Unmatched open tracks wait, or end once the gap is too long
        for (&id, last) in &open {
            if links.track_degree(id) > 0 {
                continue;
            }
            let missed = ctx.scan_num.saturating_sub(last.scan_num);
            if missed > self.params.max_missed_scans {
                archive.end_track(id)?;
                let complex_id = archive
                    .complex_id_of(id)
                    .ok_or(TrackError::UnknownTrack(id))?;
                ended.push(ended_event(id, complex_id));
            } else {
                log::trace!("Track {} unmatched, {} scan(s) missed", id, missed);
            }
        }

        archive.set_last_scan(ctx.scan_num, ctx.time);

        ended.sort_by_key(|e| e.simple_track_id);
        let mut events: Vec<TrackEvent> = storm_events.into_iter().flatten().collect();
        events.extend(ended);

        // A later merge may have forwarded a complex id reported earlier
        for event in &mut events {
            event.complex_track_id = archive.resolve_complex(event.complex_track_id);
        }

        log::debug!(
            "Scan {}: {} storms, {} open tracks, {} candidate pairs, {} events",
            ctx.scan_num,
            storms.len(),
            open.len(),
            candidates.len(),
            events.len()
        );
        Ok(events)
    }

    /// End tracks that are too old to match; return the last entries of the rest
    fn close_stale_tracks(
        &self,
        archive: &mut TrackArchive,
        ctx: &ScanContext,
        ended: &mut Vec<TrackEvent>,
    ) -> Result<BTreeMap<u32, TrackEntry>> {
        let mut open = BTreeMap::new();

        for id in archive.active_tracks() {
            let Some(last) = archive.simple_track(id).and_then(|t| t.last_entry()).cloned() else {
                continue;
            };

            let missed = ctx.scan_num.saturating_sub(last.scan_num).saturating_sub(1);
            let age = (ctx.time - last.time).num_seconds();

            if missed > self.params.max_missed_scans || age > self.params.max_delta_time_secs {
                log::debug!(
                    "Track {} too old to match ({} missed scans, {} s)",
                    id,
                    missed,
                    age
                );
                archive.end_track(id)?;
                let complex_id = archive
                    .complex_id_of(id)
                    .ok_or(TrackError::UnknownTrack(id))?;
                ended.push(ended_event(id, complex_id));
            } else {
                open.insert(id, last);
            }
        }
        Ok(open)
    }

    /// Candidate pairs in resolution order
    fn score_candidates(
        &self,
        open: &BTreeMap<u32, TrackEntry>,
        ctx: &ScanContext,
        storms: &[StormDescriptor],
    ) -> Vec<Candidate> {
        let mut candidates = Vec::new();

        for (&track, last) in open {
            for (storm, desc) in storms.iter().enumerate() {
                let score = self.score(last, desc, ctx.time);
                log::trace!("Track {} vs storm {}: score {:.3}", track, storm, score);
                if score >= self.params.min_match_score {
                    candidates.push(Candidate { score, track, storm });
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.track.cmp(&b.track))
                .then(a.storm.cmp(&b.storm))
        });
        candidates
    }

    /// Build the match graph from sorted candidates
    fn resolve(
        &self,
        open: &BTreeMap<u32, TrackEntry>,
        n_storms: usize,
        candidates: &[Candidate],
    ) -> Links {
        let mut links = Links::new(n_storms);

        // Primary one-to-one assignment
        for c in candidates {
            if links.storm_tracks[c.storm].is_empty() && links.track_degree(c.track) == 0 {
                links.add(c.track, c.storm);
            }
        }

        // Leftover storms split off their best track
        for storm in 0..n_storms {
            if !links.storm_tracks[storm].is_empty() {
                continue;
            }
            let best = candidates
                .iter()
                .find(|c| {
                    c.storm == storm && links.track_degree(c.track) < self.params.max_children
                });
            if let Some(c) = best {
                links.add(c.track, storm);
            }
        }

        // Leftover tracks merge into their best storm
        for &track in open.keys() {
            if links.track_degree(track) > 0 {
                continue;
            }
            let best = candidates
                .iter()
                .find(|c| {
                    c.track == track && links.storm_tracks[c.storm].len() < self.params.max_parents
                });
            if let Some(c) = best {
                links.add(track, c.storm);
            }
        }

        links
    }
}

fn ended_event(simple_track_id: u32, complex_track_id: u32) -> TrackEvent {
    TrackEvent {
        kind: TrackEventKind::Ended,
        simple_track_id,
        complex_track_id,
        storm: None,
    }
}

fn hours_between(earlier: Timestamp, later: Timestamp) -> f64 {
    (later - earlier).num_seconds() as f64 / 3600.0
}

/// Motion implied by moving from the last entry to the storm
fn history_motion(
    last: &TrackEntry,
    storm: &StormDescriptor,
    time: Timestamp,
) -> Option<MotionVector> {
    let dt_hours = hours_between(last.time, time);
    if dt_hours <= 0.0 {
        return None;
    }
    let (east, north) = last.location.displacement_km(&storm.location);
    Some(MotionVector::new(
        east / dt_hours,
        north / dt_hours,
        MotionSource::History,
    ))
}
