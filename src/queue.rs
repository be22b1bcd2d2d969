//! The queue object: lifecycle, locking and the glue between the write and
//! read cursors.
//!
//! All state lives behind one re-entrant lock. Public methods take the lock
//! and borrow the state once; everything below them works on `&mut State`.

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use parking_lot::ReentrantMutex;

use crate::config::{OverflowPolicy, QueueConfig};
use crate::dir_lock::DirLock;
use crate::header::{encode_item, ItemHeader, ItemRead};
use crate::reader::ReadCursor;
use crate::retention::{disk_usage, eviction_count};
use crate::segment::{discover_segments, sort_segments, Segment};
use crate::writer::WriteCursor;
use crate::{Error, Result};

/// Persistent FIFO queue spilled to numbered segment files.
///
/// Intended for one producer and one consumer thread, possibly the same
/// one; share it behind an `Arc`.
///
/// ```no_run
/// use diskqueue::DiskQueue;
///
/// let queue = DiskQueue::with_capacity(4096, 0);
/// queue.start("/var/spool/telemetry")?;
/// queue.push_back(b"reading 1")?;
///
/// if let Some(payload) = queue.front_vec() {
///     // hand payload off, then
///     queue.pop_front();
/// }
/// queue.stop()?;
/// # Ok::<(), diskqueue::Error>(())
/// ```
pub struct DiskQueue {
    config: QueueConfig,
    state: ReentrantMutex<RefCell<State>>,
}

#[derive(Debug, Default)]
struct State {
    root: PathBuf,
    segments: Vec<Segment>,
    writer: Option<WriteCursor>,
    reader: Option<ReadCursor>,
    /// Item boundary to resume from when the read handle was dropped at the
    /// end of the write segment: `(segment id, offset)`.
    resume: Option<(u64, u64)>,
    lock: Option<DirLock>,
    running: bool,
}

impl DiskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: ReentrantMutex::new(RefCell::new(State::default())),
        }
    }

    /// Queue with `capacity` bytes per segment and an overall `disk_limit`
    /// (zero for none).
    pub fn with_capacity(capacity: u64, disk_limit: u64) -> Self {
        Self::new(QueueConfig::new(capacity, disk_limit))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Open or create the queue in `path` and recover its read position.
    ///
    /// Succeeds without doing anything if the queue is already running.
    /// The directory is created if missing, but its parents are not.
    ///
    /// # Errors
    ///
    /// - `Error::FileSystem`: the directory or a segment cannot be created or opened
    /// - `Error::Locked`: another process holds the directory
    /// - `Error::OutOfMemory`: the segment list cannot grow
    /// - `Error::InvalidConfig`: the configuration is unusable
    pub fn start(&self, path: impl AsRef<Path>) -> Result<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.running {
            return Ok(());
        }
        self.config.validate()?;

        let root = path.as_ref();
        match state.open(root, &self.config) {
            Ok(()) => {
                state.running = true;
                info!(
                    "disk queue started at {} with segments {:?}",
                    root.display(),
                    state.ids()
                );
                Ok(())
            }
            Err(err) => {
                state.release();
                Err(err)
            }
        }
    }

    /// Close every file handle and release the directory. On-disk data is
    /// kept. Stopping an idle queue is a no-op.
    pub fn stop(&self) -> Result<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if state.running {
            info!("disk queue stopped at {}", state.root.display());
        }
        state.release();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        let guard = self.state.lock();
        let running = guard.borrow().running;
        running
    }

    /// Append `data` as one item and sync it to stable storage.
    ///
    /// # Errors
    ///
    /// - `Error::NotRunning`: the queue is stopped
    /// - `Error::PayloadTooLarge`: more than 65535 bytes
    /// - `Error::DiskFull`: the disk limit is reached under `OverflowPolicy::RejectNew`
    /// - `Error::FileSystem`/`Error::Io`: rotation or the write failed
    pub fn push_back(&self, data: &[u8]) -> Result<()> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.running {
            return Err(Error::NotRunning);
        }
        let frame = encode_item(data)?;
        state.push(&frame, &self.config)
    }

    /// Copy the front item into `buf` without consuming it.
    ///
    /// Copies at most `buf.len()` bytes and returns the full payload length,
    /// so a return larger than `buf.len()` means the copy was cut short.
    /// Repeated calls return the same item until `pop_front`.
    pub fn front(&self, buf: &mut [u8]) -> Option<usize> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.running {
            return None;
        }
        let header = state.front_item()?;
        state
            .read_front(&header, buf)
            .map(|_| header.payload_len())
    }

    /// The front item's payload, without consuming it.
    pub fn front_vec(&self) -> Option<Vec<u8>> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.running {
            return None;
        }
        let header = state.front_item()?;
        let mut buf = vec![0u8; header.payload_len()];
        state.read_front(&header, &mut buf)?;
        Some(buf)
    }

    /// Payload length of the front item.
    pub fn front_size(&self) -> Option<usize> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.running {
            return None;
        }
        state.front_item().map(|header| header.payload_len())
    }

    /// Consume the front item. Returns false if there was nothing to consume.
    ///
    /// The item's active flag is cleared on disk, so it stays consumed
    /// across a restart.
    pub fn pop_front(&self) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if !state.running {
            return false;
        }
        match state.front_item() {
            Some(header) => state.consume_front(&header, self.config.sync_consumed),
            None => false,
        }
    }

    /// Ids of the segments currently making up the queue, ascending.
    pub fn list(&self) -> Vec<u64> {
        let guard = self.state.lock();
        let ids = guard.borrow().ids();
        ids
    }

    /// Bytes held by the queue's segment files.
    pub fn disk_usage(&self) -> u64 {
        let guard = self.state.lock();
        let usage = disk_usage(&guard.borrow().segments);
        usage
    }

    /// Directory of a running queue.
    pub fn path(&self) -> Option<PathBuf> {
        let guard = self.state.lock();
        let state = guard.borrow();
        let root = state.running.then(|| state.root.clone());
        root
    }
}

impl Drop for DiskQueue {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for DiskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.state.lock();
        let state = guard.borrow();
        f.debug_struct("DiskQueue")
            .field("config", &self.config)
            .field("root", &state.root)
            .field("segments", &state.ids())
            .field("running", &state.running)
            .finish()
    }
}

impl State {
    fn ids(&self) -> Vec<u64> {
        self.segments.iter().map(|segment| segment.id).collect()
    }

    fn write_segment(&self) -> Option<u64> {
        self.writer.as_ref().map(WriteCursor::segment_id)
    }

    fn open(&mut self, root: &Path, config: &QueueConfig) -> Result<()> {
        ensure_dir(root)?;
        self.root = root.to_path_buf();
        self.lock = Some(DirLock::acquire(root)?);

        let mut segments = discover_segments(root)?;
        sort_segments(&mut segments);
        self.segments = segments;

        self.writer = Some(WriteCursor::select(
            root,
            &mut self.segments,
            config.segment_capacity,
        )?);
        self.open_reader(false)?;
        Ok(())
    }

    fn release(&mut self) {
        self.running = false;
        self.reader = None;
        if let Some(writer) = self.writer.take() {
            if let Err(err) = writer.sync() {
                warn!("sync of segment {} on stop failed: {err}", writer.segment_id());
            }
        }
        self.segments.clear();
        self.resume = None;
        self.lock = None;
    }

    fn push(&mut self, frame: &[u8], config: &QueueConfig) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(Error::NotRunning)?;
        if writer.needs_roll(config.segment_capacity) {
            writer.rotate(&self.root, &mut self.segments)?;
        }
        self.make_room(frame.len() as u64, config)?;
        let writer = self.writer.as_mut().ok_or(Error::NotRunning)?;
        writer.append(frame, &mut self.segments)
    }

    /// Apply the disk limit before appending `incoming` bytes.
    fn make_room(&mut self, incoming: u64, config: &QueueConfig) -> Result<()> {
        if !config.limit_enabled() {
            return Ok(());
        }
        let usage = disk_usage(&self.segments);
        let needed = usage.saturating_add(incoming);
        if needed <= config.disk_limit {
            return Ok(());
        }
        match config.overflow {
            OverflowPolicy::RejectNew => Err(Error::DiskFull),
            OverflowPolicy::DropOldest => {
                let write_segment = self.write_segment().ok_or(Error::NotRunning)?;
                let count = eviction_count(&self.segments, write_segment, needed - config.disk_limit);
                let evicted: Vec<Segment> = self.segments.drain(..count).collect();
                for segment in &evicted {
                    warn!(
                        "disk limit {} reached, dropping segment {} ({} bytes)",
                        config.disk_limit, segment.id, segment.size
                    );
                    self.discard(segment);
                }
                Ok(())
            }
        }
    }

    /// Position the read cursor on the next active item and return its
    /// header. Crosses, retires and quarantines segments as needed.
    fn front_item(&mut self) -> Option<ItemHeader> {
        match self.locate_front() {
            Ok(header) => header,
            Err(err) => {
                warn!("read path error: {err}");
                self.drop_reader();
                None
            }
        }
    }

    fn locate_front(&mut self) -> Result<Option<ItemHeader>> {
        loop {
            if self.reader.is_none() && !self.open_reader(true)? {
                return Ok(None);
            }
            let reader = match self.reader.as_mut() {
                Some(reader) => reader,
                None => return Ok(None),
            };
            let header = match reader.peek_header()? {
                ItemRead::Item(header) if reader.is_complete(&header)? => header,
                ItemRead::Item(_) | ItemRead::End | ItemRead::Torn => {
                    if self.end_of_segment()? {
                        continue;
                    }
                    return Ok(None);
                }
                ItemRead::Corrupt => {
                    let segment_id = reader.segment_id();
                    warn!(
                        "segment {} has a bad item header at offset {}",
                        segment_id,
                        reader.offset()
                    );
                    self.quarantine(segment_id)?;
                    continue;
                }
            };
            if header.is_active() {
                return Ok(Some(header));
            }
            reader.skip(&header);
        }
    }

    /// Open a read cursor on the oldest segment.
    ///
    /// Segments that cannot be opened are dropped from the list. With
    /// `retire` set, unusable segments are retired or quarantined and the
    /// next one is tried; without it the cursor is simply left closed.
    fn open_reader(&mut self, retire: bool) -> Result<bool> {
        loop {
            let segment = match self.segments.first() {
                Some(segment) => segment.clone(),
                None => return Ok(false),
            };
            let resume = self
                .resume
                .filter(|(id, _)| *id == segment.id)
                .map(|(_, offset)| offset);
            let is_write_segment = self.write_segment() == Some(segment.id);
            match ReadCursor::open(&self.root, &segment, resume) {
                Ok(cursor) => {
                    self.reader = Some(cursor);
                    self.resume = None;
                    return Ok(true);
                }
                Err(err) if is_write_segment => return Err(err),
                Err(Error::FileSystem { path, source }) => {
                    warn!(
                        "cannot open segment {} ({source}), removing stale entry",
                        path.display()
                    );
                    self.segments.remove(0);
                    self.discard(&segment);
                }
                Err(err) if err.is_corruption() && !retire => {
                    warn!("segment {} unusable: {err}", segment.id);
                    return Ok(false);
                }
                Err(Error::ShortHeader) => {
                    self.segments.remove(0);
                    debug!("retiring headerless segment {}", segment.id);
                    self.discard(&segment);
                }
                Err(err) if err.is_corruption() => {
                    warn!("segment {} unusable: {err}", segment.id);
                    self.quarantine(segment.id)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The read cursor hit the end of its data. Returns true when the
    /// segment was retired and reading can continue in the next one.
    fn end_of_segment(&mut self) -> Result<bool> {
        let reader = match self.reader.take() {
            Some(reader) => reader,
            None => return Ok(false),
        };
        let segment_id = reader.segment_id();
        if self.write_segment() == Some(segment_id) {
            self.resume = Some((segment_id, reader.offset()));
            return Ok(false);
        }
        drop(reader);
        if let Some(index) = self.position(segment_id) {
            let segment = self.segments.remove(index);
            debug!("segment {segment_id} drained, retiring");
            self.discard(&segment);
        }
        Ok(true)
    }

    /// Move a corrupt segment out of the queue as `<name>.corrupt`.
    fn quarantine(&mut self, segment_id: u64) -> Result<()> {
        if self.write_segment() == Some(segment_id) {
            if let Some(writer) = self.writer.as_mut() {
                writer.rotate(&self.root, &mut self.segments)?;
            }
        }
        let index = match self.position(segment_id) {
            Some(index) => index,
            None => return Ok(()),
        };
        let segment = self.segments.remove(index);
        self.forget(segment.id);
        let target = segment.free_quarantine_path(&self.root);
        match fs::rename(segment.path(&self.root), &target) {
            Ok(()) => warn!("quarantined segment {} as {}", segment.id, target.display()),
            Err(err) => {
                warn!("cannot quarantine segment {}: {err}", segment.id);
                self.discard(&segment);
            }
        }
        Ok(())
    }

    /// Delete the file of a segment already taken out of the list.
    fn discard(&mut self, segment: &Segment) {
        self.forget(segment.id);
        match fs::remove_file(segment.path(&self.root)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("cannot remove segment {}: {err}", segment.id),
        }
    }

    /// Drop any read state that refers to `segment_id`.
    fn forget(&mut self, segment_id: u64) {
        if self.reader.as_ref().map(ReadCursor::segment_id) == Some(segment_id) {
            self.reader = None;
        }
        if self.resume.map(|(id, _)| id) == Some(segment_id) {
            self.resume = None;
        }
    }

    fn drop_reader(&mut self) {
        self.reader = None;
        self.resume = None;
    }

    fn position(&self, segment_id: u64) -> Option<usize> {
        self.segments.iter().position(|segment| segment.id == segment_id)
    }

    fn read_front(&mut self, header: &ItemHeader, buf: &mut [u8]) -> Option<usize> {
        let reader = self.reader.as_mut()?;
        match reader.read_payload(header, buf) {
            Ok(Some(n)) => Some(n),
            Ok(None) => {
                warn!("short payload read in segment {}", reader.segment_id());
                self.drop_reader();
                None
            }
            Err(err) => {
                warn!("payload read failed in segment {}: {err}", reader.segment_id());
                self.drop_reader();
                None
            }
        }
    }

    fn consume_front(&mut self, header: &ItemHeader, sync: bool) -> bool {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return false,
        };
        match reader.consume(header, sync) {
            Ok(()) => true,
            Err(err) => {
                warn!("cannot mark item consumed in segment {}: {err}", reader.segment_id());
                self.drop_reader();
                false
            }
        }
    }
}

fn ensure_dir(root: &Path) -> Result<()> {
    match fs::metadata(root) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(Error::fs(
            root,
            io::Error::new(io::ErrorKind::AlreadyExists, "not a directory"),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir(root).map_err(|err| Error::fs(root, err))
        }
        Err(err) => Err(Error::fs(root, err)),
    }
}
