use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::Path;

use log::debug;

use crate::header::{
    read_full, read_item_header, read_segment_header, ItemHeader, ItemRead, ITEM_FLAGS_OFFSET,
    ITEM_FLAG_ACTIVE, ITEM_HEADER_SIZE, SEGMENT_HEADER_SIZE,
};
use crate::scan::walk_items;
use crate::segment::Segment;
use crate::{Error, Result};

/// Consume side of the queue: the open head segment and the offset of the
/// next unread item header.
#[derive(Debug)]
pub(crate) struct ReadCursor {
    file: File,
    segment_id: u64,
    offset: u64,
}

impl ReadCursor {
    /// Open `segment` and run the recovery scan.
    ///
    /// The scan starts at `resume` when given (a known item boundary),
    /// otherwise at the first item, and stops on the first item whose
    /// active flag is still set. A fully consumed segment leaves the cursor
    /// at the end of its data.
    pub(crate) fn open(root: &Path, segment: &Segment, resume: Option<u64>) -> Result<Self> {
        let path = segment.path(root);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::fs(&path, err))?;
        read_segment_header(&mut file)?;

        let file_len = file.metadata()?.len();
        let start = resume
            .unwrap_or(SEGMENT_HEADER_SIZE as u64)
            .max(SEGMENT_HEADER_SIZE as u64);
        let walk = {
            let mut reader = BufReader::new(&file);
            walk_items(&mut reader, start, file_len, |_, header| {
                if header.is_active() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })?
        };
        debug!(
            "read cursor on segment {} at offset {} ({:?})",
            segment.id, walk.offset, walk.tail
        );
        Ok(Self {
            file,
            segment_id: segment.id,
            offset: walk.offset,
        })
    }

    pub(crate) fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Decode the item header at the cursor without moving it.
    pub(crate) fn peek_header(&mut self) -> io::Result<ItemRead> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        read_item_header(&mut self.file)
    }

    /// Whether the whole payload of `header` is on disk.
    pub(crate) fn is_complete(&self, header: &ItemHeader) -> io::Result<bool> {
        let file_len = self.file.metadata()?.len();
        Ok(self.offset + header.framed_len() <= file_len)
    }

    /// Copy up to `buf.len()` payload bytes. Returns `None` on a short read.
    pub(crate) fn read_payload(
        &mut self,
        header: &ItemHeader,
        buf: &mut [u8],
    ) -> io::Result<Option<usize>> {
        let want = header.payload_len().min(buf.len());
        self.file
            .seek(SeekFrom::Start(self.offset + ITEM_HEADER_SIZE as u64))?;
        let got = read_full(&mut self.file, &mut buf[..want])?;
        Ok((got == want).then_some(want))
    }

    pub(crate) fn skip(&mut self, header: &ItemHeader) {
        self.offset += header.framed_len();
    }

    /// Clear the active flag of the item at the cursor, then move past it.
    pub(crate) fn consume(&mut self, header: &ItemHeader, sync: bool) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(self.offset + ITEM_FLAGS_OFFSET))?;
        self.file.write_all(&[header.flags & !ITEM_FLAG_ACTIVE])?;
        if sync {
            self.file.sync_data()?;
        }
        self.skip(header);
        Ok(())
    }
}
