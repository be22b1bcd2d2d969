//! Segment descriptors and directory discovery.
//!
//! A queue directory holds one file per segment, named by its decimal id
//! with no extension:
//!
//! ```text
//! {queue_dir}/
//!   0        <- oldest, read side
//!   1
//!   2        <- newest, write side
//!   .lock
//! ```
//!
//! Anything whose name is not purely decimal digits is ignored, which is how
//! the lock file and quarantined `<id>.corrupt` files stay out of the queue.
//! Two spellings of one id (`7`, `007`) yield a single segment.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::{Error, Result};

/// Suffix appended to the name of a quarantined segment.
pub const QUARANTINE_SUFFIX: &str = ".corrupt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: u64,
    /// Bytes on disk. Observed at scan time, then tracked for segments the
    /// queue writes to.
    pub size: u64,
    /// File name as found on disk (`007` stays `007`).
    pub name: String,
}

impl Segment {
    pub fn new(id: u64, size: u64) -> Self {
        Self {
            id,
            size,
            name: segment_filename(id),
        }
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.name)
    }

    pub fn quarantine_path(&self, root: &Path) -> PathBuf {
        root.join(format!("{}{QUARANTINE_SUFFIX}", self.name))
    }

    /// First quarantine name not already taken: `<name>.corrupt`, then
    /// `<name>.corrupt.1`, `<name>.corrupt.2`, ...
    pub fn free_quarantine_path(&self, root: &Path) -> PathBuf {
        let first = self.quarantine_path(root);
        if fs::symlink_metadata(&first).is_err() {
            return first;
        }
        (1u64..)
            .map(|n| root.join(format!("{}{QUARANTINE_SUFFIX}.{n}", self.name)))
            .find(|candidate| fs::symlink_metadata(candidate).is_err())
            .unwrap_or(first)
    }
}

pub fn segment_filename(id: u64) -> String {
    id.to_string()
}

/// Returns the segment id for a purely decimal file name.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u64>().ok()
}

/// List every regular file in `dir` that names a segment. Unsorted.
pub fn discover_segments(dir: &Path) -> Result<Vec<Segment>> {
    let entries = fs::read_dir(dir).map_err(|err| Error::fs(dir, err))?;
    let mut segments: Vec<Segment> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| Error::fs(dir, err))?;
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(_) => continue,
        };
        if !file_type.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let name = match file_name.to_str() {
            Some(name) => name,
            None => continue,
        };
        let id = match parse_segment_filename(name) {
            Some(id) => id,
            None => continue,
        };
        let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        let found = Segment {
            id,
            size,
            name: name.to_string(),
        };
        match segments.iter_mut().find(|segment| segment.id == id) {
            Some(existing) => {
                // One file per id; the canonical spelling wins.
                let keep_new = found.name == segment_filename(id);
                let skipped = if keep_new {
                    std::mem::replace(existing, found)
                } else {
                    found
                };
                warn!(
                    "ignoring {} in {}: segment {id} is already {}",
                    skipped.name,
                    dir.display(),
                    if keep_new { name } else { existing.name.as_str() }
                );
            }
            None => {
                segments.try_reserve(1)?;
                segments.push(found);
            }
        }
    }
    Ok(segments)
}

/// Order descriptors by ascending id. Ties keep their scan order.
pub fn sort_segments(segments: &mut [Segment]) {
    segments.sort_by_key(|segment| segment.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn only_decimal_names_are_segments() {
        assert_eq!(parse_segment_filename("0"), Some(0));
        assert_eq!(parse_segment_filename("42"), Some(42));
        assert_eq!(parse_segment_filename("007"), Some(7));
        assert_eq!(parse_segment_filename(""), None);
        assert_eq!(parse_segment_filename("abc"), None);
        assert_eq!(parse_segment_filename("12a"), None);
        assert_eq!(parse_segment_filename("+12"), None);
        assert_eq!(parse_segment_filename("3.corrupt"), None);
        assert_eq!(parse_segment_filename(".lock"), None);
        assert_eq!(parse_segment_filename("99999999999999999999999"), None);
    }

    #[test]
    fn sort_handles_empty_and_unordered() {
        let mut empty: Vec<Segment> = Vec::new();
        sort_segments(&mut empty);
        assert!(empty.is_empty());

        let mut segments = vec![Segment::new(10, 0), Segment::new(2, 0), Segment::new(7, 0)];
        sort_segments(&mut segments);
        let ids: Vec<u64> = segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![2, 7, 10]);
    }

    #[test]
    fn discover_skips_non_segments() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("2"), b"P\x01\x00").expect("write 2");
        fs::write(dir.path().join("0"), b"").expect("write 0");
        fs::write(dir.path().join("abc"), b"junk").expect("write abc");
        fs::write(dir.path().join("1.corrupt"), b"junk").expect("write quarantined");
        fs::create_dir(dir.path().join("5")).expect("mkdir 5");

        let mut segments = discover_segments(dir.path()).expect("discover");
        sort_segments(&mut segments);
        let ids: Vec<u64> = segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 2]);
        assert_eq!(segments[1].size, 3);
    }

    #[test]
    fn discover_missing_dir_is_fs_error() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("missing");
        assert!(matches!(
            discover_segments(&missing),
            Err(Error::FileSystem { .. })
        ));
    }

    #[test]
    fn quarantine_name_is_not_a_segment() {
        let segment = Segment::new(3, 0);
        let root = Path::new("/q");
        assert_eq!(segment.path(root), PathBuf::from("/q/3"));
        let quarantined = segment.quarantine_path(root);
        let name = quarantined.file_name().and_then(|n| n.to_str()).expect("name");
        assert_eq!(parse_segment_filename(name), None);
    }

    #[test]
    fn duplicate_ids_keep_one_descriptor() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("007"), b"padded").expect("write 007");
        fs::write(dir.path().join("7"), b"P\x01\x00").expect("write 7");
        fs::write(dir.path().join("0009"), b"P\x01\x00").expect("write 0009");
        fs::write(dir.path().join("09"), b"P\x01\x00").expect("write 09");

        let mut segments = discover_segments(dir.path()).expect("discover");
        sort_segments(&mut segments);
        let ids: Vec<u64> = segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![7, 9]);
        assert_eq!(segments[0].name, "7");
        assert_eq!(segments[0].size, 3);
    }

    #[test]
    fn quarantine_never_overwrites() {
        let dir = tempdir().expect("tempdir");
        let segment = Segment::new(4, 0);
        assert_eq!(segment.free_quarantine_path(dir.path()), dir.path().join("4.corrupt"));

        fs::write(dir.path().join("4.corrupt"), b"first").expect("write");
        let second = segment.free_quarantine_path(dir.path());
        assert_eq!(second, dir.path().join("4.corrupt.1"));
        fs::write(&second, b"second").expect("write");
        assert_eq!(
            segment.free_quarantine_path(dir.path()),
            dir.path().join("4.corrupt.2")
        );
        assert_eq!(parse_segment_filename("4.corrupt.1"), None);
    }
}
