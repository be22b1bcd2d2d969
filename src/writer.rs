use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::Path;

use log::{info, warn};

use crate::header::{read_segment_header, SegmentHeader, SEGMENT_HEADER_SIZE};
use crate::scan::{walk_items, Tail};
use crate::segment::Segment;
use crate::{Error, Result};

/// Append side of the queue: the open tail segment.
#[derive(Debug)]
pub(crate) struct WriteCursor {
    file: File,
    segment_id: u64,
    len: u64,
}

impl WriteCursor {
    pub(crate) fn segment_id(&self) -> u64 {
        self.segment_id
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Pick the write segment on startup, repairing a torn tail.
    ///
    /// `segments` must be sorted. The highest segment is reused while it is
    /// under `capacity` and its header is intact; otherwise a new segment
    /// is created after it.
    pub(crate) fn select(root: &Path, segments: &mut Vec<Segment>, capacity: u64) -> Result<Self> {
        let last = match segments.last() {
            Some(last) => last.clone(),
            None => return Self::create(root, segments, 0),
        };
        if last.size >= capacity {
            return Self::create(root, segments, next_id(last.id)?);
        }

        let path = last.path(root);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|err| Error::fs(&path, err))?;
        let len = match prepare_tail(&mut file, &path, last.id)? {
            Some(len) => len,
            None => return Self::create(root, segments, next_id(last.id)?),
        };

        if let Some(segment) = segments.last_mut() {
            segment.size = len;
        }
        Ok(Self {
            file,
            segment_id: last.id,
            len,
        })
    }

    /// Create segment `id` with a fresh header and append its descriptor.
    pub(crate) fn create(root: &Path, segments: &mut Vec<Segment>, id: u64) -> Result<Self> {
        let segment = Segment::new(id, SEGMENT_HEADER_SIZE as u64);
        let path = segment.path(root);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| Error::fs(&path, err))?;
        if let Err(err) = file
            .write_all(&SegmentHeader::default().to_bytes())
            .and_then(|()| file.sync_all())
        {
            drop(file);
            if let Err(cleanup) = fs::remove_file(&path) {
                warn!("cannot remove half-created segment {id}: {cleanup}");
            }
            return Err(Error::fs(&path, err));
        }
        sync_dir(root)?;

        segments.try_reserve(1)?;
        segments.push(segment);
        info!("created segment {id}");
        Ok(Self {
            file,
            segment_id: id,
            len: SEGMENT_HEADER_SIZE as u64,
        })
    }

    pub(crate) fn needs_roll(&self, capacity: u64) -> bool {
        self.len >= capacity
    }

    /// Close the current segment and continue in the next id.
    pub(crate) fn rotate(&mut self, root: &Path, segments: &mut Vec<Segment>) -> Result<()> {
        self.file.sync_all()?;
        let next = Self::create(root, segments, next_id(self.segment_id)?)?;
        info!("rotated write segment {} -> {}", self.segment_id, next.segment_id);
        *self = next;
        Ok(())
    }

    /// Append one encoded item and sync it to stable storage.
    ///
    /// On failure the segment is cut back to its previous length so no
    /// partial item is left behind.
    pub(crate) fn append(&mut self, frame: &[u8], segments: &mut [Segment]) -> Result<()> {
        let written = self
            .file
            .write_all(frame)
            .and_then(|()| self.file.sync_data());
        if let Err(err) = written {
            if let Err(trunc) = self.file.set_len(self.len) {
                warn!(
                    "segment {} append failed and truncate failed: {trunc}",
                    self.segment_id
                );
            }
            return Err(err.into());
        }
        self.len += frame.len() as u64;
        if let Some(segment) = segments.last_mut() {
            if segment.id == self.segment_id {
                segment.size = self.len;
            }
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Repair the tail of an existing write segment in place.
///
/// Returns the usable length, or `None` when the segment is corrupt and a
/// new one must be started after it.
fn prepare_tail(file: &mut File, path: &Path, id: u64) -> Result<Option<u64>> {
    let at = |err: io::Error| Error::fs(path, err);
    let len = file.metadata().map_err(at)?.len();

    if len < SEGMENT_HEADER_SIZE as u64 {
        warn!("segment {id} has no complete header, rewriting");
        file.set_len(0)
            .and_then(|()| file.write_all(&SegmentHeader::default().to_bytes()))
            .and_then(|()| file.sync_all())
            .map_err(at)?;
        return Ok(Some(SEGMENT_HEADER_SIZE as u64));
    }

    file.seek(SeekFrom::Start(0)).map_err(at)?;
    match read_segment_header(file) {
        Ok(_) => {}
        Err(err) if err.is_corruption() => {
            warn!("segment {id} header unusable ({err}), rotating");
            return Ok(None);
        }
        Err(Error::Io(err)) => return Err(at(err)),
        Err(err) => return Err(err),
    }

    let walk = {
        let mut reader = BufReader::new(&*file);
        walk_items(&mut reader, SEGMENT_HEADER_SIZE as u64, len, |_, _| {
            ControlFlow::Continue(())
        })
        .map_err(at)?
    };
    match walk.tail {
        Tail::Torn => {
            warn!(
                "segment {id} has a torn tail, truncating {len} -> {} bytes",
                walk.offset
            );
            file.set_len(walk.offset)
                .and_then(|()| file.sync_all())
                .map_err(at)?;
            Ok(Some(walk.offset))
        }
        Tail::Corrupt => {
            warn!("segment {id} corrupt at offset {}, rotating", walk.offset);
            Ok(None)
        }
        Tail::End | Tail::Stopped => Ok(Some(len)),
    }
}

fn next_id(id: u64) -> Result<u64> {
    id.checked_add(1)
        .ok_or(Error::Corrupt("segment id space exhausted"))
}

#[cfg(unix)]
fn sync_dir(root: &Path) -> Result<()> {
    File::open(root)
        .and_then(|dir| dir.sync_all())
        .map_err(|err| Error::fs(root, err))
}

#[cfg(not(unix))]
fn sync_dir(_root: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::encode_item;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_directory_starts_at_zero() {
        let dir = tempdir().expect("tempdir");
        let mut segments = Vec::new();
        let writer = WriteCursor::select(dir.path(), &mut segments, 64).expect("select");
        assert_eq!(writer.segment_id(), 0);
        assert_eq!(writer.len(), 3);
        assert_eq!(fs::read(dir.path().join("0")).expect("read"), vec![b'P', 1, 0]);
        assert_eq!(segments, vec![Segment::new(0, 3)]);
    }

    #[test]
    fn full_tail_segment_rotates() {
        let dir = tempdir().expect("tempdir");
        let mut segments = Vec::new();
        let mut writer = WriteCursor::select(dir.path(), &mut segments, 16).expect("select");
        let frame = encode_item(b"0123456789").expect("encode");
        writer.append(&frame, &mut segments).expect("append");
        assert!(writer.needs_roll(16));
        drop(writer);

        let writer = WriteCursor::select(dir.path(), &mut segments, 16).expect("reselect");
        assert_eq!(writer.segment_id(), 1);
        let ids: Vec<u64> = segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempdir().expect("tempdir");
        let mut bytes = vec![b'P', 1, 0];
        bytes.extend_from_slice(&encode_item(b"kept").expect("encode"));
        bytes.extend_from_slice(&[0xF0, 0x01, 0x20, 0x00, b'x']);
        fs::write(dir.path().join("4"), &bytes).expect("write");

        let mut segments = vec![Segment::new(4, bytes.len() as u64)];
        let writer = WriteCursor::select(dir.path(), &mut segments, 1024).expect("select");
        assert_eq!(writer.segment_id(), 4);
        assert_eq!(writer.len(), 11);
        assert_eq!(segments[0].size, 11);
        assert_eq!(fs::metadata(dir.path().join("4")).expect("meta").len(), 11);
    }

    #[test]
    fn headerless_file_gets_a_header() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("2"), b"P").expect("write");
        let mut segments = vec![Segment::new(2, 1)];
        let writer = WriteCursor::select(dir.path(), &mut segments, 1024).expect("select");
        assert_eq!(writer.segment_id(), 2);
        assert_eq!(fs::read(dir.path().join("2")).expect("read"), vec![b'P', 1, 0]);
    }

    #[test]
    fn corrupt_header_rotates() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("0"), b"XYZ").expect("write");
        let mut segments = vec![Segment::new(0, 3)];
        let writer = WriteCursor::select(dir.path(), &mut segments, 1024).expect("select");
        assert_eq!(writer.segment_id(), 1);
        assert_eq!(fs::read(dir.path().join("0")).expect("read"), b"XYZ".to_vec());
    }

    #[test]
    fn last_segment_id_does_not_wrap() {
        let dir = tempdir().expect("tempdir");
        let mut bytes = vec![b'P', 1, 0];
        bytes.extend_from_slice(&encode_item(&[9u8; 64]).expect("encode"));
        let name = u64::MAX.to_string();
        fs::write(dir.path().join(&name), &bytes).expect("write");

        let mut segments = vec![Segment::new(u64::MAX, bytes.len() as u64)];
        let err = WriteCursor::select(dir.path(), &mut segments, 32).expect_err("exhausted");
        assert!(matches!(err, Error::Corrupt(_)));
        assert!(!dir.path().join("0").exists());
        assert_eq!(segments.len(), 1);
        assert!(next_id(u64::MAX - 1).is_ok());
    }

    #[test]
    fn repair_failure_names_the_segment() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("3");
        fs::write(&path, b"P").expect("write");
        let mut read_only = File::open(&path).expect("open read-only");

        match prepare_tail(&mut read_only, &path, 3) {
            Err(Error::FileSystem { path: failed, .. }) => assert_eq!(failed, path),
            other => panic!("unexpected {other:?}"),
        }
    }
}
