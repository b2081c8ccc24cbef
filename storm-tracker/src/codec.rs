//! Binary track codec
//!
//! A complex track is written as one self-delimiting buffer:
//!
//! ```text
//! [ComplexTrack header 72B]
//!   [SimpleTrack header 104B] [TrackEntry 112B x n_entries]
//!   ... repeated n_simple times
//! ```
//!
//! All fields are big-endian. Every record has a fixed size, so a reader
//! can check the remaining length before touching a record.

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use chrono::DateTime;
use std::io::Cursor;

use crate::geometry::GeoPoint;
use crate::storm::CellIndex;
use crate::track::{
    ComplexStats, ComplexTrack, SimpleTrack, TrackEntry, TrackState, MAX_CHILDREN, MAX_PARENTS,
};
use crate::types::{MotionSource, MotionVector, Result, Timestamp, TrackError};

/// Magic number opening every complex track buffer ("CTRK")
pub const MAGIC: u32 = 0x4354_524B;

/// Current wire format version
pub const VERSION: u16 = 1;

/// Size of a complex track header
pub const COMPLEX_HEADER_LEN: usize = 72;

/// Size of a simple track header
pub const SIMPLE_HEADER_LEN: usize = 104;

/// Size of one track entry record
pub const ENTRY_LEN: usize = 112;

const STATE_ACTIVE: u8 = 0;
const STATE_ENDED: u8 = 1;

/// Exact length of the buffer `assemble` produces for a track
pub fn encoded_len(track: &ComplexTrack) -> usize {
    COMPLEX_HEADER_LEN
        + track
            .simple_tracks()
            .iter()
            .map(|s| SIMPLE_HEADER_LEN + s.entries().len() * ENTRY_LEN)
            .sum::<usize>()
}

/// Serialize a complex track with all its simple tracks and entries
pub fn assemble(track: &ComplexTrack) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(track));
    let stats = track.stats();

    put_u32(&mut buf, MAGIC);
    put_u16(&mut buf, VERSION);
    put_u16(&mut buf, 0);
    put_u32(&mut buf, track.id);
    put_u32(&mut buf, track.simple_tracks().len() as u32);
    put_u32(&mut buf, stats.start_scan);
    put_u32(&mut buf, stats.end_scan);
    put_u32(&mut buf, stats.duration_in_scans);
    put_u32(&mut buf, stats.n_entries);
    put_i64(&mut buf, stats.start_time.timestamp());
    put_i64(&mut buf, stats.end_time.timestamp());
    put_i64(&mut buf, stats.duration_secs);
    put_u32(&mut buf, stats.max_points);
    put_u32(&mut buf, track.next_complex_id());
    put_f64(&mut buf, stats.max_value);

    for simple in track.simple_tracks() {
        write_simple_header(&mut buf, simple);
        for entry in simple.entries() {
            write_entry(&mut buf, entry);
        }
    }

    debug_assert_eq!(buf.len(), encoded_len(track));
    buf
}

/// Parse one complex track from the start of `bytes`.
///
/// Returns the track and the number of bytes consumed. Trailing bytes
/// are left for the caller.
pub fn disassemble(bytes: &[u8]) -> Result<(ComplexTrack, usize)> {
    let mut r = Reader::new(bytes);

    r.require(COMPLEX_HEADER_LEN, "complex track header")?;
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(TrackError::Decode(format!(
            "bad magic 0x{:08X}, expected 0x{:08X}",
            magic, MAGIC
        )));
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(TrackError::Decode(format!(
            "unsupported version {}",
            version
        )));
    }
    let _reserved = r.u16()?;
    let complex_id = r.u32()?;
    let n_simple = r.u32()?;
    let start_scan = r.u32()?;
    let end_scan = r.u32()?;
    let duration_in_scans = r.u32()?;
    let n_entries = r.u32()?;
    let start_time = r.time()?;
    let end_time = r.time()?;
    let duration_secs = r.i64()?;
    let max_points = r.u32()?;
    let next_complex_id = r.u32()?;
    let max_value = r.f64()?;

    let stats = ComplexStats {
        start_scan,
        end_scan,
        start_time,
        end_time,
        duration_in_scans,
        duration_secs,
        n_entries,
        max_points,
        max_value,
    };

    // Each simple track needs at least its header
    r.require(n_simple as usize * SIMPLE_HEADER_LEN, "simple track headers")?;

    let mut simple_tracks = Vec::with_capacity(n_simple as usize);
    let mut total_entries: u64 = 0;
    for _ in 0..n_simple {
        let simple = read_simple_track(&mut r, complex_id)?;
        total_entries += simple.entries().len() as u64;
        simple_tracks.push(simple);
    }

    if total_entries != n_entries as u64 {
        return Err(TrackError::Decode(format!(
            "complex track {} declares {} entries, found {}",
            complex_id, n_entries, total_entries
        )));
    }

    let consumed = r.position();
    Ok((
        ComplexTrack::from_parts(complex_id, simple_tracks, stats, next_complex_id),
        consumed,
    ))
}

/// Summary of one complex track buffer, read from headers only
#[derive(Debug, Clone, PartialEq)]
pub struct TrackHeader {
    pub complex_id: u32,
    pub n_simple: u32,
    pub n_entries: u32,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    /// Total length of the buffer, headers and entries included
    pub encoded_len: usize,
}

/// Read the headers of the complex track at the start of `bytes`,
/// skipping over entry records without decoding them
pub fn peek_header(bytes: &[u8]) -> Result<TrackHeader> {
    let mut r = Reader::new(bytes);

    r.require(COMPLEX_HEADER_LEN, "complex track header")?;
    let magic = r.u32()?;
    let version = r.u16()?;
    if magic != MAGIC || version != VERSION {
        return Err(TrackError::Decode(format!(
            "not a track buffer (magic 0x{:08X}, version {})",
            magic, version
        )));
    }
    let _reserved = r.u16()?;
    let complex_id = r.u32()?;
    let n_simple = r.u32()?;
    r.skip(12)?;
    let n_entries = r.u32()?;
    let start_time = r.time()?;
    let end_time = r.time()?;
    r.skip(COMPLEX_HEADER_LEN - 48)?;

    for _ in 0..n_simple {
        r.require(SIMPLE_HEADER_LEN, "simple track header")?;
        r.skip(32)?;
        let entries = r.u32()? as usize;
        r.skip(SIMPLE_HEADER_LEN - 36)?;
        r.require(entries * ENTRY_LEN, "track entries")?;
        r.skip(entries * ENTRY_LEN)?;
    }

    Ok(TrackHeader {
        complex_id,
        n_simple,
        n_entries,
        start_time,
        end_time,
        encoded_len: r.position(),
    })
}

fn write_simple_header(buf: &mut Vec<u8>, simple: &SimpleTrack) {
    put_u32(buf, simple.id);
    put_u32(buf, simple.complex_id);
    put_u32(buf, simple.start_scan());
    put_u32(buf, simple.end_scan());
    put_i64(buf, simple.start_time().timestamp());
    put_i64(buf, simple.end_time().timestamp());
    put_u32(buf, simple.entries().len() as u32);
    buf.push(match simple.state {
        TrackState::Active => STATE_ACTIVE,
        TrackState::Ended => STATE_ENDED,
    });
    buf.push(simple.parents.len().min(MAX_PARENTS) as u8);
    buf.push(simple.children.len().min(MAX_CHILDREN) as u8);
    buf.push(0);
    put_ids(buf, &simple.parents, MAX_PARENTS);
    put_ids(buf, &simple.children, MAX_CHILDREN);
}

fn write_entry(buf: &mut Vec<u8>, entry: &TrackEntry) {
    put_u32(buf, entry.scan_num);
    put_u32(buf, entry.storm_num);
    put_i64(buf, entry.time.timestamp());
    put_f64(buf, entry.centroid_x);
    put_f64(buf, entry.centroid_y);
    put_f64(buf, entry.centroid_z);
    put_f64(buf, entry.location.lat);
    put_f64(buf, entry.location.lon);
    put_u32(buf, entry.n_points);
    put_u32(buf, entry.n_intervals);
    put_u32(buf, entry.base_plane);
    put_u32(buf, entry.top_plane);
    put_u32(buf, entry.max_location.plane);
    put_u32(buf, entry.max_location.row);
    put_i32(buf, entry.max_location.col);
    match entry.motion {
        Some(m) => {
            put_u32(buf, m.source.code());
            put_f64(buf, entry.max_value);
            put_f64(buf, m.u_kmh);
            put_f64(buf, m.v_kmh);
        }
        None => {
            put_u32(buf, 0);
            put_f64(buf, entry.max_value);
            put_f64(buf, 0.0);
            put_f64(buf, 0.0);
        }
    }
}

fn read_simple_track(r: &mut Reader<'_>, complex_id: u32) -> Result<SimpleTrack> {
    r.require(SIMPLE_HEADER_LEN, "simple track header")?;
    let id = r.u32()?;
    let owner = r.u32()?;
    if owner != complex_id {
        return Err(TrackError::Decode(format!(
            "simple track {} claims complex track {}, found inside {}",
            id, owner, complex_id
        )));
    }
    let _start_scan = r.u32()?;
    let _end_scan = r.u32()?;
    let _start_time = r.i64()?;
    let _end_time = r.i64()?;
    let n_entries = r.u32()? as usize;
    let state = match r.u8()? {
        STATE_ACTIVE => TrackState::Active,
        STATE_ENDED => TrackState::Ended,
        other => {
            return Err(TrackError::Decode(format!(
                "simple track {} has invalid state {}",
                id, other
            )))
        }
    };
    let n_parents = r.u8()? as usize;
    let n_children = r.u8()? as usize;
    let _reserved = r.u8()?;
    if n_parents > MAX_PARENTS || n_children > MAX_CHILDREN {
        return Err(TrackError::Decode(format!(
            "simple track {} has {} parents and {} children",
            id, n_parents, n_children
        )));
    }
    let parents = r.ids(n_parents, MAX_PARENTS)?;
    let children = r.ids(n_children, MAX_CHILDREN)?;

    r.require(n_entries * ENTRY_LEN, "track entries")?;
    let mut entries = Vec::with_capacity(n_entries);
    for _ in 0..n_entries {
        entries.push(read_entry(r)?);
    }

    Ok(SimpleTrack::from_parts(
        id, complex_id, state, parents, children, entries,
    ))
}

fn read_entry(r: &mut Reader<'_>) -> Result<TrackEntry> {
    let scan_num = r.u32()?;
    let storm_num = r.u32()?;
    let time = r.time()?;
    let centroid_x = r.f64()?;
    let centroid_y = r.f64()?;
    let centroid_z = r.f64()?;
    let lat = r.f64()?;
    let lon = r.f64()?;
    let n_points = r.u32()?;
    let n_intervals = r.u32()?;
    let base_plane = r.u32()?;
    let top_plane = r.u32()?;
    let max_location = CellIndex {
        plane: r.u32()?,
        row: r.u32()?,
        col: r.i32()?,
    };
    let code = r.u32()?;
    let max_value = r.f64()?;
    let u_kmh = r.f64()?;
    let v_kmh = r.f64()?;

    let source = MotionSource::from_code(code)
        .ok_or_else(|| TrackError::Decode(format!("invalid motion source {}", code)))?;

    Ok(TrackEntry {
        scan_num,
        time,
        storm_num,
        centroid_x,
        centroid_y,
        centroid_z,
        location: GeoPoint { lat, lon },
        n_points,
        n_intervals,
        base_plane,
        top_plane,
        max_value,
        max_location,
        motion: source.map(|s| MotionVector::new(u_kmh, v_kmh, s)),
    })
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    let mut b = [0u8; 4];
    BigEndian::write_i32(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    let mut b = [0u8; 8];
    BigEndian::write_i64(&mut b, v);
    buf.extend_from_slice(&b);
}

fn put_f64(buf: &mut Vec<u8>, v: f64) {
    let mut b = [0u8; 8];
    BigEndian::write_f64(&mut b, v);
    buf.extend_from_slice(&b);
}

/// Fixed-width id array, zero padded
fn put_ids(buf: &mut Vec<u8>, ids: &[u32], width: usize) {
    for i in 0..width {
        put_u32(buf, ids.get(i).copied().unwrap_or(0));
    }
}

/// Big-endian cursor that reports short reads as decode errors
struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len().saturating_sub(self.position())
    }

    fn require(&self, len: usize, what: &str) -> Result<()> {
        if self.remaining() < len {
            return Err(TrackError::Decode(format!(
                "truncated {}: need {} bytes at offset {}, have {}",
                what,
                len,
                self.position(),
                self.remaining()
            )));
        }
        Ok(())
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.require(len, "record")?;
        self.cursor.set_position((self.position() + len) as u64);
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.cursor.read_u8().map_err(short_read)
    }

    fn u16(&mut self) -> Result<u16> {
        self.cursor.read_u16::<BigEndian>().map_err(short_read)
    }

    fn u32(&mut self) -> Result<u32> {
        self.cursor.read_u32::<BigEndian>().map_err(short_read)
    }

    fn i32(&mut self) -> Result<i32> {
        self.cursor.read_i32::<BigEndian>().map_err(short_read)
    }

    fn i64(&mut self) -> Result<i64> {
        self.cursor.read_i64::<BigEndian>().map_err(short_read)
    }

    fn f64(&mut self) -> Result<f64> {
        self.cursor.read_f64::<BigEndian>().map_err(short_read)
    }

    fn time(&mut self) -> Result<Timestamp> {
        let secs = self.i64()?;
        DateTime::from_timestamp(secs, 0)
            .ok_or_else(|| TrackError::Decode(format!("timestamp {} out of range", secs)))
    }

    /// Read a fixed-width id array, keeping the first `count`
    fn ids(&mut self, count: usize, width: usize) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..width {
            let id = self.u32()?;
            if i < count {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

fn short_read(err: std::io::Error) -> TrackError {
    TrackError::Decode(format!("unexpected end of buffer: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackArchive;
    use crate::types::MotionSource;
    use chrono::{TimeZone, Utc};

    fn entry(scan_num: u32, motion: Option<MotionVector>) -> TrackEntry {
        TrackEntry {
            scan_num,
            time: Utc.timestamp_opt(1_717_264_800 + 300 * scan_num as i64, 0).unwrap(),
            storm_num: scan_num % 3,
            centroid_x: 12.25 + scan_num as f64,
            centroid_y: 40.5,
            centroid_z: 0.0,
            location: GeoPoint::new(39.75, -104.87),
            n_points: 20 + scan_num,
            n_intervals: 4,
            base_plane: 0,
            top_plane: 2,
            max_value: 51.5,
            max_location: CellIndex { plane: 1, row: 40, col: -3 },
            motion,
        }
    }

    fn sample_track() -> ComplexTrack {
        let mut archive = TrackArchive::new();
        let (a, c) = archive.start_track(&[], None, entry(0, None)).unwrap();
        archive
            .append_entry(a, entry(1, Some(MotionVector::new(12.0, -4.5, MotionSource::History))))
            .unwrap();
        archive.start_track(&[a], Some(c), entry(2, None)).unwrap();
        archive.end_track(a).unwrap();
        archive.add_child(a, 1).unwrap();
        archive.complex_track(c).unwrap().clone()
    }

    #[test]
    fn test_record_sizes() {
        let track = sample_track();
        let bytes = assemble(&track);
        assert_eq!(
            bytes.len(),
            COMPLEX_HEADER_LEN + 2 * SIMPLE_HEADER_LEN + 3 * ENTRY_LEN
        );
        assert_eq!(&bytes[..4], b"CTRK");
    }

    #[test]
    fn test_round_trip() {
        let track = sample_track();
        let bytes = assemble(&track);
        let (decoded, consumed) = disassemble(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, track);
        assert_eq!(assemble(&decoded), bytes);
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let track = sample_track();
        let mut bytes = assemble(&track);
        let len = bytes.len();
        bytes.extend_from_slice(&[0xAB; 17]);
        let (_, consumed) = disassemble(&bytes).unwrap();
        assert_eq!(consumed, len);
    }

    #[test]
    fn test_truncated_buffer() {
        let bytes = assemble(&sample_track());
        for cut in [0, 10, COMPLEX_HEADER_LEN, COMPLEX_HEADER_LEN + 50, bytes.len() - 1] {
            let result = disassemble(&bytes[..cut]);
            assert!(
                matches!(result, Err(TrackError::Decode(_))),
                "cut at {} should fail",
                cut
            );
        }
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut bytes = assemble(&sample_track());
        bytes[0] = b'X';
        assert!(matches!(disassemble(&bytes), Err(TrackError::Decode(_))));

        let mut bytes = assemble(&sample_track());
        bytes[5] = 9;
        assert!(matches!(disassemble(&bytes), Err(TrackError::Decode(_))));
    }

    #[test]
    fn test_bad_state_rejected() {
        let mut bytes = assemble(&sample_track());
        // State byte of the first simple track header
        bytes[COMPLEX_HEADER_LEN + 36] = 7;
        assert!(matches!(disassemble(&bytes), Err(TrackError::Decode(_))));
    }

    #[test]
    fn test_entry_count_mismatch_rejected() {
        let mut bytes = assemble(&sample_track());
        // n_entries field of the complex header
        BigEndian::write_u32(&mut bytes[28..32], 99);
        assert!(matches!(disassemble(&bytes), Err(TrackError::Decode(_))));
    }

    #[test]
    fn test_peek_header_matches_stats() {
        let track = sample_track();
        let bytes = assemble(&track);
        let header = peek_header(&bytes).unwrap();
        assert_eq!(header.complex_id, track.id);
        assert_eq!(header.n_simple, 2);
        assert_eq!(header.n_entries, 3);
        assert_eq!(header.start_time, track.stats().start_time);
        assert_eq!(header.end_time, track.stats().end_time);
        assert_eq!(header.encoded_len, bytes.len());

        assert!(peek_header(&bytes[..bytes.len() - 8]).is_err());
    }

    #[test]
    fn test_id_high_water_mark_stored() {
        let mut archive = TrackArchive::new();
        archive.start_track(&[], None, entry(0, None)).unwrap();
        archive.start_track(&[], None, entry(0, None)).unwrap();
        archive.merge_complex(&[0, 1]).unwrap();

        let snapshot = archive.snapshot();
        let bytes = assemble(&snapshot.complex_tracks[0]);
        assert_eq!(BigEndian::read_u32(&bytes[60..64]), 2);

        let (decoded, _) = disassemble(&bytes).unwrap();
        assert_eq!(decoded.next_complex_id(), 2);
        assert_eq!(decoded, snapshot.complex_tracks[0]);
    }

    #[test]
    fn test_empty_complex_track() {
        let track = ComplexTrack::new(5);
        let bytes = assemble(&track);
        assert_eq!(bytes.len(), COMPLEX_HEADER_LEN);
        let (decoded, consumed) = disassemble(&bytes).unwrap();
        assert_eq!(consumed, COMPLEX_HEADER_LEN);
        assert_eq!(decoded, track);
    }
}
