//! Track hierarchy and the track archive
//!
//! A [`ComplexTrack`] owns its [`SimpleTrack`]s by value and each simple
//! track owns its [`TrackEntry`]s by value. Split/merge ancestry is kept as
//! integer ids, resolved through the [`TrackArchive`], so absorbing one
//! complex track into another never leaves a dangling reference.

use chrono::DateTime;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::forecast::NeighborEntry;
use crate::geometry::GeoPoint;
use crate::storm::{CellIndex, StormDescriptor};
use crate::types::{MotionSource, MotionVector, Result, Timestamp, TrackError};

/// Maximum number of parents recorded for one simple track
pub const MAX_PARENTS: usize = 8;

/// Maximum number of children recorded for one simple track
pub const MAX_CHILDREN: usize = 8;

/// Lifecycle state of a simple track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackState {
    Active,
    Ended,
}

/// One storm's recorded state at one scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackEntry {
    /// Scan number within the run
    pub scan_num: u32,
    /// Scan time, whole seconds
    pub time: Timestamp,
    /// Index of the storm within its scan
    pub storm_num: u32,
    /// Centroid in fractional grid indices
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub centroid_z: f64,
    /// Centroid on the globe
    pub location: GeoPoint,
    pub n_points: u32,
    pub n_intervals: u32,
    pub base_plane: u32,
    pub top_plane: u32,
    pub max_value: f64,
    pub max_location: CellIndex,
    /// Motion estimate, if one could be made
    pub motion: Option<MotionVector>,
}

impl TrackEntry {
    /// Build an entry from a storm descriptor.
    ///
    /// Sub-second precision is dropped from `time`.
    pub fn from_storm(
        scan_num: u32,
        time: Timestamp,
        storm_num: u32,
        storm: &StormDescriptor,
        motion: Option<MotionVector>,
    ) -> Self {
        Self {
            scan_num,
            time: whole_seconds(time),
            storm_num,
            centroid_x: storm.centroid_x,
            centroid_y: storm.centroid_y,
            centroid_z: storm.centroid_z,
            location: storm.location,
            n_points: storm.n_points,
            n_intervals: storm.n_intervals,
            base_plane: storm.base_plane,
            top_plane: storm.top_plane,
            max_value: storm.max_value,
            max_location: storm.max_location,
            motion,
        }
    }
}

/// Truncate a timestamp to whole seconds
pub fn whole_seconds(time: Timestamp) -> Timestamp {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}

/// An unbroken sequence of entries sharing one identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimpleTrack {
    /// Simple track id, unique within the archive
    pub id: u32,
    /// Owning complex track
    pub complex_id: u32,
    pub state: TrackState,
    /// Ids of the tracks this one split or merged from
    pub parents: Vec<u32>,
    /// Ids of the tracks this one split or merged into
    pub children: Vec<u32>,
    entries: Vec<TrackEntry>,
}

impl SimpleTrack {
    /// Create an active track with no entries
    pub fn new(id: u32, complex_id: u32) -> Self {
        Self {
            id,
            complex_id,
            state: TrackState::Active,
            parents: Vec::new(),
            children: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        id: u32,
        complex_id: u32,
        state: TrackState,
        parents: Vec<u32>,
        children: Vec<u32>,
        entries: Vec<TrackEntry>,
    ) -> Self {
        Self {
            id,
            complex_id,
            state,
            parents,
            children,
            entries,
        }
    }

    /// Append an entry; its time must be later than the last entry's
    pub fn push_entry(&mut self, entry: TrackEntry) -> Result<()> {
        if let Some(last) = self.entries.last() {
            if entry.time <= last.time {
                return Err(TrackError::Sequence {
                    previous: last.time,
                    received: entry.time,
                });
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Entries in time order
    pub fn entries(&self) -> &[TrackEntry] {
        &self.entries
    }

    /// Most recent entry
    pub fn last_entry(&self) -> Option<&TrackEntry> {
        self.entries.last()
    }

    pub fn is_active(&self) -> bool {
        self.state == TrackState::Active
    }

    pub fn start_scan(&self) -> u32 {
        self.entries.first().map_or(0, |e| e.scan_num)
    }

    pub fn end_scan(&self) -> u32 {
        self.entries.last().map_or(0, |e| e.scan_num)
    }

    pub fn start_time(&self) -> Timestamp {
        self.entries.first().map_or_else(Timestamp::default, |e| e.time)
    }

    pub fn end_time(&self) -> Timestamp {
        self.entries.last().map_or_else(Timestamp::default, |e| e.time)
    }
}

/// Summary statistics of a complex track, derived from its members
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplexStats {
    pub start_scan: u32,
    pub end_scan: u32,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub duration_in_scans: u32,
    pub duration_secs: i64,
    pub n_entries: u32,
    pub max_points: u32,
    pub max_value: f64,
}

impl Default for ComplexStats {
    fn default() -> Self {
        Self {
            start_scan: 0,
            end_scan: 0,
            start_time: Timestamp::default(),
            end_time: Timestamp::default(),
            duration_in_scans: 0,
            duration_secs: 0,
            n_entries: 0,
            max_points: 0,
            max_value: 0.0,
        }
    }
}

/// A family of simple tracks connected through splits and merges
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplexTrack {
    /// Complex track id, unique within the archive
    pub id: u32,
    simple_tracks: Vec<SimpleTrack>,
    stats: ComplexStats,
    /// Next complex id the owning archive would have issued when this
    /// track was snapshotted. Zero for tracks never snapshotted.
    #[serde(skip)]
    next_complex_id: u32,
}

impl ComplexTrack {
    /// Create an empty complex track
    pub fn new(id: u32) -> Self {
        Self {
            id,
            simple_tracks: Vec::new(),
            stats: ComplexStats::default(),
            next_complex_id: 0,
        }
    }

    pub(crate) fn from_parts(
        id: u32,
        simple_tracks: Vec<SimpleTrack>,
        stats: ComplexStats,
        next_complex_id: u32,
    ) -> Self {
        Self {
            id,
            simple_tracks,
            stats,
            next_complex_id,
        }
    }

    /// Complex id high-water mark recorded at the last snapshot
    pub fn next_complex_id(&self) -> u32 {
        self.next_complex_id
    }

    /// Add a member, keeping members ordered by id
    pub fn add_simple_track(&mut self, mut track: SimpleTrack) {
        track.complex_id = self.id;
        let pos = self.simple_tracks.partition_point(|t| t.id < track.id);
        self.simple_tracks.insert(pos, track);
        self.recompute_stats();
    }

    /// Members ordered by id
    pub fn simple_tracks(&self) -> &[SimpleTrack] {
        &self.simple_tracks
    }

    /// Find a member by id
    pub fn simple_track(&self, id: u32) -> Option<&SimpleTrack> {
        self.simple_tracks
            .binary_search_by_key(&id, |t| t.id)
            .ok()
            .map(|i| &self.simple_tracks[i])
    }

    pub(crate) fn simple_track_mut(&mut self, id: u32) -> Option<&mut SimpleTrack> {
        match self.simple_tracks.binary_search_by_key(&id, |t| t.id) {
            Ok(i) => Some(&mut self.simple_tracks[i]),
            Err(_) => None,
        }
    }

    /// Derived summary statistics
    pub fn stats(&self) -> &ComplexStats {
        &self.stats
    }

    /// Total number of entries across all members
    pub fn n_entries(&self) -> usize {
        self.simple_tracks.iter().map(|t| t.entries.len()).sum()
    }

    /// Recompute the summary statistics from the members
    pub fn recompute_stats(&mut self) {
        let mut stats = ComplexStats::default();
        let mut first = true;

        for entry in self.simple_tracks.iter().flat_map(|t| t.entries.iter()) {
            if first || entry.scan_num < stats.start_scan {
                stats.start_scan = entry.scan_num;
                stats.start_time = entry.time;
            }
            if first || entry.scan_num > stats.end_scan {
                stats.end_scan = entry.scan_num;
                stats.end_time = entry.time;
            }
            first = false;
            stats.n_entries += 1;
            stats.max_points = stats.max_points.max(entry.n_points);
            stats.max_value = stats.max_value.max(entry.max_value);
        }

        if !first {
            stats.duration_in_scans = stats.end_scan - stats.start_scan + 1;
            stats.duration_secs = (stats.end_time - stats.start_time).num_seconds();
        }
        self.stats = stats;
    }

    /// Move every member of `other` into this track
    fn absorb(&mut self, other: ComplexTrack) {
        for mut track in other.simple_tracks {
            track.complex_id = self.id;
            let pos = self.simple_tracks.partition_point(|t| t.id < track.id);
            self.simple_tracks.insert(pos, track);
        }
        self.recompute_stats();
    }
}

/// Immutable copy of the archive handed to persistence
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveSnapshot {
    /// Complex tracks ordered by id
    pub complex_tracks: Vec<ComplexTrack>,
    /// Last scan ingested, if any
    pub last_scan: Option<(u32, Timestamp)>,
}

/// All tracks of one tracking run
#[derive(Debug, Clone, Default)]
pub struct TrackArchive {
    complex_tracks: BTreeMap<u32, ComplexTrack>,
    /// Simple track id -> owning complex track id
    simple_index: HashMap<u32, u32>,
    /// Absorbed complex track id -> surviving id
    forwarded: BTreeMap<u32, u32>,
    next_simple_id: u32,
    next_complex_id: u32,
    last_scan: Option<(u32, Timestamp)>,
}

impl TrackArchive {
    /// Create an empty archive
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an archive from previously persisted complex tracks
    pub fn from_complex_tracks(tracks: Vec<ComplexTrack>) -> Result<Self> {
        let mut archive = Self::new();

        for complex in tracks {
            if archive.complex_tracks.contains_key(&complex.id) {
                return Err(TrackError::Decode(format!(
                    "duplicate complex track {}",
                    complex.id
                )));
            }
            check_member_order(&complex)?;
            for simple in complex.simple_tracks() {
                if archive.simple_index.insert(simple.id, complex.id).is_some() {
                    return Err(TrackError::Decode(format!(
                        "simple track {} appears twice",
                        simple.id
                    )));
                }
                archive.next_simple_id = archive.next_simple_id.max(simple.id + 1);
                if let Some(last) = simple.last_entry() {
                    let newer = archive
                        .last_scan
                        .map_or(true, |(scan, _)| last.scan_num > scan);
                    if newer {
                        archive.last_scan = Some((last.scan_num, last.time));
                    }
                }
            }
            // Absorbed ids are gone from the file but must never be reissued
            archive.next_complex_id = archive
                .next_complex_id
                .max(complex.id + 1)
                .max(complex.next_complex_id);
            archive.complex_tracks.insert(complex.id, complex);
        }

        log::info!(
            "Restored archive: {} complex tracks, {} simple tracks",
            archive.complex_tracks.len(),
            archive.simple_index.len()
        );
        Ok(archive)
    }

    /// Complex tracks ordered by id
    pub fn complex_tracks(&self) -> impl Iterator<Item = &ComplexTrack> {
        self.complex_tracks.values()
    }

    pub fn n_complex_tracks(&self) -> usize {
        self.complex_tracks.len()
    }

    pub fn n_simple_tracks(&self) -> usize {
        self.simple_index.len()
    }

    /// Follow merge forwarding to the surviving complex id
    pub fn resolve_complex(&self, mut id: u32) -> u32 {
        while let Some(&next) = self.forwarded.get(&id) {
            id = next;
        }
        id
    }

    /// Look up a complex track, following merge forwarding
    pub fn complex_track(&self, id: u32) -> Option<&ComplexTrack> {
        self.complex_tracks.get(&self.resolve_complex(id))
    }

    /// Look up a simple track by id
    pub fn simple_track(&self, id: u32) -> Option<&SimpleTrack> {
        let complex_id = self.simple_index.get(&id)?;
        self.complex_tracks.get(complex_id)?.simple_track(id)
    }

    /// Complex id owning a simple track
    pub fn complex_id_of(&self, simple_id: u32) -> Option<u32> {
        self.simple_index.get(&simple_id).copied()
    }

    /// Ids of all active simple tracks, ascending
    pub fn active_tracks(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .complex_tracks
            .values()
            .flat_map(|c| c.simple_tracks())
            .filter(|t| t.is_active())
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of active tracks with an entry at the given scan
    pub fn active_heads(&self, scan_num: u32) -> usize {
        self.complex_tracks
            .values()
            .flat_map(|c| c.simple_tracks())
            .filter(|t| t.is_active() && t.last_entry().map_or(false, |e| e.scan_num == scan_num))
            .count()
    }

    /// Last entries at `scan_num` that carry a track-history motion,
    /// optionally excluding one simple track
    pub fn neighbor_entries(&self, scan_num: u32, exclude: Option<u32>) -> Vec<NeighborEntry> {
        self.complex_tracks
            .values()
            .flat_map(|c| c.simple_tracks())
            .filter(|t| t.is_active() && Some(t.id) != exclude)
            .filter_map(|t| t.last_entry())
            .filter(|e| e.scan_num == scan_num)
            .filter_map(|e| match e.motion {
                Some(m) if m.source == MotionSource::History => Some(NeighborEntry {
                    location: e.location,
                    motion: m,
                }),
                _ => None,
            })
            .collect()
    }

    /// Last scan ingested
    pub fn last_scan(&self) -> Option<(u32, Timestamp)> {
        self.last_scan
    }

    pub(crate) fn set_last_scan(&mut self, scan_num: u32, time: Timestamp) {
        self.last_scan = Some((scan_num, time));
    }

    /// Copy of the current state for persistence
    pub fn snapshot(&self) -> ArchiveSnapshot {
        ArchiveSnapshot {
            complex_tracks: self
                .complex_tracks
                .values()
                .map(|track| ComplexTrack {
                    next_complex_id: self.next_complex_id,
                    ..track.clone()
                })
                .collect(),
            last_scan: self.last_scan,
        }
    }

    /// Start a simple track with a first entry.
    ///
    /// With no `complex_id` a new complex track is created for it.
    pub(crate) fn start_track(
        &mut self,
        parents: &[u32],
        complex_id: Option<u32>,
        entry: TrackEntry,
    ) -> Result<(u32, u32)> {
        let simple_id = self.next_simple_id;
        self.next_simple_id += 1;

        let complex_id = match complex_id {
            Some(id) => self.resolve_complex(id),
            None => {
                let id = self.next_complex_id;
                self.next_complex_id += 1;
                self.complex_tracks.insert(id, ComplexTrack::new(id));
                id
            }
        };

        let mut track = SimpleTrack::new(simple_id, complex_id);
        track.parents = parents.iter().copied().take(MAX_PARENTS).collect();
        track.push_entry(entry)?;

        let complex = self
            .complex_tracks
            .get_mut(&complex_id)
            .ok_or(TrackError::UnknownTrack(simple_id))?;
        complex.add_simple_track(track);
        self.simple_index.insert(simple_id, complex_id);

        Ok((simple_id, complex_id))
    }

    /// Append an entry to an existing simple track
    pub(crate) fn append_entry(&mut self, simple_id: u32, entry: TrackEntry) -> Result<()> {
        let complex = self.complex_mut_for(simple_id)?;
        let track = complex
            .simple_track_mut(simple_id)
            .ok_or(TrackError::UnknownTrack(simple_id))?;
        track.push_entry(entry)?;
        complex.recompute_stats();
        Ok(())
    }

    /// Mark a simple track as ended
    pub(crate) fn end_track(&mut self, simple_id: u32) -> Result<()> {
        let complex = self.complex_mut_for(simple_id)?;
        let track = complex
            .simple_track_mut(simple_id)
            .ok_or(TrackError::UnknownTrack(simple_id))?;
        track.state = TrackState::Ended;
        Ok(())
    }

    /// Record `child` as a child of `parent`
    pub(crate) fn add_child(&mut self, parent: u32, child: u32) -> Result<()> {
        let complex = self.complex_mut_for(parent)?;
        let track = complex
            .simple_track_mut(parent)
            .ok_or(TrackError::UnknownTrack(parent))?;
        if track.children.len() < MAX_CHILDREN && !track.children.contains(&child) {
            track.children.push(child);
        }
        Ok(())
    }

    /// Fold several complex tracks into the one with the smallest id.
    ///
    /// Returns the surviving id.
    pub(crate) fn merge_complex(&mut self, ids: &[u32]) -> Result<u32> {
        let mut resolved: Vec<u32> = ids.iter().map(|&id| self.resolve_complex(id)).collect();
        resolved.sort_unstable();
        resolved.dedup();

        let Some((&survivor, absorbed)) = resolved.split_first() else {
            return Err(TrackError::Config("merge of zero complex tracks".to_string()));
        };

        for &id in absorbed {
            let Some(other) = self.complex_tracks.remove(&id) else {
                continue;
            };
            for simple in other.simple_tracks() {
                self.simple_index.insert(simple.id, survivor);
            }
            if let Some(target) = self.complex_tracks.get_mut(&survivor) {
                target.absorb(other);
            }
            self.forwarded.insert(id, survivor);
            log::debug!("Complex track {} folded into {}", id, survivor);
        }

        Ok(survivor)
    }

    fn complex_mut_for(&mut self, simple_id: u32) -> Result<&mut ComplexTrack> {
        let complex_id = *self
            .simple_index
            .get(&simple_id)
            .ok_or(TrackError::UnknownTrack(simple_id))?;
        self.complex_tracks
            .get_mut(&complex_id)
            .ok_or(TrackError::UnknownTrack(simple_id))
    }
}

/// Members must be in ascending id order and each member's entries in
/// strictly increasing time, or id lookups by binary search go wrong
fn check_member_order(complex: &ComplexTrack) -> Result<()> {
    for pair in complex.simple_tracks.windows(2) {
        if pair[0].id >= pair[1].id {
            return Err(TrackError::Decode(format!(
                "complex track {}: simple track {} stored after {}",
                complex.id, pair[1].id, pair[0].id
            )));
        }
    }
    for simple in &complex.simple_tracks {
        for pair in simple.entries.windows(2) {
            if pair[1].time <= pair[0].time {
                return Err(TrackError::Decode(format!(
                    "simple track {}: entry at {} does not follow {}",
                    simple.id, pair[1].time, pair[0].time
                )));
            }
        }
    }
    Ok(())
}
