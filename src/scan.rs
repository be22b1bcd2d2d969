//! Sequential walk over the items of one segment.
//!
//! Shared by startup recovery, tail repair and `inspect`. Walking never
//! reads payloads; it seeks past them and checks them against the file
//! length instead.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::Path;

use crate::header::{
    read_item_header, read_segment_header, ItemHeader, ItemRead, SegmentHeader,
    SEGMENT_HEADER_SIZE,
};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    /// The visitor asked to stop; `offset` is the header it stopped on.
    Stopped,
    End,
    Torn,
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    /// Offset of the last item boundary reached.
    pub offset: u64,
    pub tail: Tail,
}

/// Walk items from `start` until the visitor breaks or the data ends.
pub fn walk_items<R, F>(
    reader: &mut BufReader<R>,
    start: u64,
    file_len: u64,
    mut visit: F,
) -> io::Result<Walk>
where
    R: Read + Seek,
    F: FnMut(u64, &ItemHeader) -> ControlFlow<()>,
{
    let mut offset = start;
    reader.seek(SeekFrom::Start(start))?;
    loop {
        let header = match read_item_header(reader)? {
            ItemRead::Item(header) => header,
            ItemRead::End => return Ok(Walk { offset, tail: Tail::End }),
            ItemRead::Torn => return Ok(Walk { offset, tail: Tail::Torn }),
            ItemRead::Corrupt => return Ok(Walk { offset, tail: Tail::Corrupt }),
        };
        let next = offset + header.framed_len();
        if next > file_len {
            return Ok(Walk { offset, tail: Tail::Torn });
        }
        if visit(offset, &header).is_break() {
            return Ok(Walk {
                offset,
                tail: Tail::Stopped,
            });
        }
        reader.seek_relative(header.payload_len() as i64)?;
        offset = next;
    }
}

/// Read-only summary of one segment file, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReport {
    pub file_len: u64,
    /// `None` when the file header is missing or invalid.
    pub header: Option<SegmentHeader>,
    pub active_items: u64,
    pub active_bytes: u64,
    pub consumed_items: u64,
    /// End of the last complete item.
    pub valid_len: u64,
    pub tail: Tail,
}

pub fn inspect_segment(path: &Path) -> Result<SegmentReport> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let header = match read_segment_header(&mut file) {
        Ok(header) => header,
        Err(err) if err.is_corruption() => {
            return Ok(SegmentReport {
                file_len,
                header: None,
                active_items: 0,
                active_bytes: 0,
                consumed_items: 0,
                valid_len: 0,
                tail: Tail::Corrupt,
            })
        }
        Err(err) => return Err(err),
    };

    let mut active_items = 0;
    let mut active_bytes = 0;
    let mut consumed_items = 0;
    let mut reader = BufReader::new(file);
    let walk = walk_items(&mut reader, SEGMENT_HEADER_SIZE as u64, file_len, |_, item| {
        if item.is_active() {
            active_items += 1;
            active_bytes += item.payload_len() as u64;
        } else {
            consumed_items += 1;
        }
        ControlFlow::Continue(())
    })?;
    Ok(SegmentReport {
        file_len,
        header: Some(header),
        active_items,
        active_bytes,
        consumed_items,
        valid_len: walk.offset,
        tail: walk.tail,
    })
}
