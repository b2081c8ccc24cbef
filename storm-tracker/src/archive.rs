//! Track archive files
//!
//! An archive file is a plain concatenation of [`codec::assemble`]d complex
//! tracks. It can be read end to end without an index; [`index_archive`]
//! builds one from the headers when random access is wanted.

use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::codec::{self, TrackHeader};
use crate::track::{ArchiveSnapshot, ComplexTrack};
use crate::types::{Result, Timestamp, TrackError};

/// Location of one complex track within an archive buffer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexEntry {
    /// Byte offset of the track's header
    pub offset: usize,
    /// Length of the track's buffer
    pub len: usize,
    pub complex_id: u32,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

impl IndexEntry {
    /// True if the track was alive at some point in `[from, to]`
    pub fn overlaps(&self, from: Timestamp, to: Timestamp) -> bool {
        self.start_time <= to && self.end_time >= from
    }
}

/// Write complex tracks back to back
pub fn write_archive<'a, W, I>(writer: &mut W, tracks: I) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a ComplexTrack>,
{
    let mut written = 0;
    for track in tracks {
        let bytes = codec::assemble(track);
        writer.write_all(&bytes)?;
        written += bytes.len();
    }
    writer.flush()?;
    Ok(written)
}

/// Decode every complex track in an archive buffer
pub fn read_archive(bytes: &[u8]) -> Result<Vec<ComplexTrack>> {
    let mut tracks = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let (track, consumed) =
            codec::disassemble(&bytes[offset..]).map_err(|e| at_offset(e, offset))?;
        offset += consumed;
        tracks.push(track);
    }

    log::debug!("Read {} complex tracks ({} bytes)", tracks.len(), bytes.len());
    Ok(tracks)
}

/// Build an offset index from the track headers
pub fn index_archive(bytes: &[u8]) -> Result<Vec<IndexEntry>> {
    let mut index = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let TrackHeader {
            complex_id,
            start_time,
            end_time,
            encoded_len,
            ..
        } = codec::peek_header(&bytes[offset..]).map_err(|e| at_offset(e, offset))?;

        index.push(IndexEntry {
            offset,
            len: encoded_len,
            complex_id,
            start_time,
            end_time,
        });
        offset += encoded_len;
    }
    Ok(index)
}

/// Decode the complex track starting at `offset`
pub fn read_at(bytes: &[u8], offset: usize) -> Result<ComplexTrack> {
    let slice = bytes.get(offset..).ok_or_else(|| {
        TrackError::Decode(format!(
            "offset {} beyond archive of {} bytes",
            offset,
            bytes.len()
        ))
    })?;
    codec::disassemble(slice)
        .map(|(track, _)| track)
        .map_err(|e| at_offset(e, offset))
}

fn at_offset(err: TrackError, offset: usize) -> TrackError {
    match err {
        TrackError::Decode(msg) => TrackError::Decode(format!("at offset {}: {}", offset, msg)),
        other => other,
    }
}

/// Destination for archive snapshots
pub trait ArchiveSink {
    /// Persist a snapshot, replacing whatever was persisted before
    fn persist(&mut self, snapshot: &ArchiveSnapshot) -> Result<()>;
}

/// Archive sink writing a single file.
///
/// Each snapshot is written to a temporary file next to the target and
/// renamed over it, so readers never see a half-written archive.
#[derive(Debug, Clone)]
pub struct FileArchiveSink {
    path: PathBuf,
}

impl FileArchiveSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back the tracks of an existing archive file
    pub fn load(&self) -> Result<Vec<ComplexTrack>> {
        let bytes = fs::read(&self.path)?;
        read_archive(&bytes)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl ArchiveSink for FileArchiveSink {
    fn persist(&mut self, snapshot: &ArchiveSnapshot) -> Result<()> {
        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            let written = write_archive(&mut file, &snapshot.complex_tracks)?;
            file.sync_all()?;
            log::debug!(
                "Wrote {} complex tracks ({} bytes) to {}",
                snapshot.complex_tracks.len(),
                written,
                tmp.display()
            );
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeoPoint;
    use crate::storm::CellIndex;
    use crate::track::{TrackArchive, TrackEntry};
    use chrono::{Duration, TimeZone, Utc};

    fn entry(scan_num: u32) -> TrackEntry {
        TrackEntry {
            scan_num,
            time: Utc.timestamp_opt(1_600_000_000, 0).unwrap()
                + Duration::minutes(6 * scan_num as i64),
            storm_num: 0,
            centroid_x: 3.0,
            centroid_y: 4.0,
            centroid_z: 0.0,
            location: GeoPoint::new(-33.9, 151.2),
            n_points: 9,
            n_intervals: 3,
            base_plane: 0,
            top_plane: 0,
            max_value: 0.0,
            max_location: CellIndex { plane: 0, row: 3, col: 2 },
            motion: None,
        }
    }

    fn sample_archive() -> TrackArchive {
        let mut archive = TrackArchive::new();
        let (a, _) = archive.start_track(&[], None, entry(0)).unwrap();
        archive.append_entry(a, entry(1)).unwrap();
        let (b, _) = archive.start_track(&[], None, entry(2)).unwrap();
        archive.append_entry(b, entry(3)).unwrap();
        archive.append_entry(b, entry(4)).unwrap();
        archive.start_track(&[], None, entry(5)).unwrap();
        archive
    }

    #[test]
    fn test_write_then_read() {
        let snapshot = sample_archive().snapshot();
        let mut buf = Vec::new();
        let written = write_archive(&mut buf, &snapshot.complex_tracks).unwrap();
        assert_eq!(written, buf.len());

        let tracks = read_archive(&buf).unwrap();
        assert_eq!(tracks, snapshot.complex_tracks);
    }

    #[test]
    fn test_index_and_random_access() {
        let snapshot = sample_archive().snapshot();
        let mut buf = Vec::new();
        write_archive(&mut buf, &snapshot.complex_tracks).unwrap();

        let index = index_archive(&buf).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index[0].offset, 0);
        assert_eq!(index[1].offset, index[0].len);
        assert_eq!(index.iter().map(|e| e.len).sum::<usize>(), buf.len());

        let second = read_at(&buf, index[1].offset).unwrap();
        assert_eq!(second, snapshot.complex_tracks[1]);
        assert_eq!(second.id, index[1].complex_id);

        let t = |scan: i64| Utc.timestamp_opt(1_600_000_000 + 360 * scan, 0).unwrap();
        let alive: Vec<u32> = index
            .iter()
            .filter(|e| e.overlaps(t(3), t(3)))
            .map(|e| e.complex_id)
            .collect();
        assert_eq!(alive, vec![1]);
    }

    #[test]
    fn test_corrupt_archive_reports_offset() {
        let snapshot = sample_archive().snapshot();
        let mut buf = Vec::new();
        write_archive(&mut buf, &snapshot.complex_tracks).unwrap();
        buf.truncate(buf.len() - 5);

        match read_archive(&buf) {
            Err(TrackError::Decode(msg)) => assert!(msg.contains("at offset"), "{}", msg),
            other => panic!("expected decode error, got {:?}", other),
        }
        assert!(index_archive(&buf).is_err());
        assert!(read_at(&buf, buf.len() + 10).is_err());
    }

    #[test]
    fn test_empty_archive() {
        assert!(read_archive(&[]).unwrap().is_empty());
        assert!(index_archive(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_file_sink_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracks.ctrk");
        let mut sink = FileArchiveSink::new(&path);

        let archive = sample_archive();
        sink.persist(&archive.snapshot()).unwrap();
        assert_eq!(sink.load().unwrap(), archive.snapshot().complex_tracks);

        let empty = TrackArchive::new();
        sink.persist(&empty.snapshot()).unwrap();
        assert!(sink.load().unwrap().is_empty());
        assert!(!dir.path().join("tracks.ctrk.tmp").exists());
    }
}
