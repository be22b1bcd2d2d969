use crate::header::SEGMENT_HEADER_SIZE;
use crate::{Error, Result};

/// Default per-segment capacity: 64 KiB.
pub const DEFAULT_SEGMENT_CAPACITY: u64 = 64 * 1024;

/// What `push_back` does when the disk limit would be exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict whole segments from the head of the queue, oldest first.
    #[default]
    DropOldest,
    /// Leave existing data alone and fail the push with `Error::DiskFull`.
    RejectNew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Size at or beyond which the write segment is rotated.
    pub segment_capacity: u64,
    /// Upper bound on the bytes held by all segments. Zero disables the limit.
    pub disk_limit: u64,
    pub overflow: OverflowPolicy,
    /// Sync the consumed flag to disk on every `pop_front`.
    pub sync_consumed: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            segment_capacity: DEFAULT_SEGMENT_CAPACITY,
            disk_limit: 0,
            overflow: OverflowPolicy::default(),
            sync_consumed: true,
        }
    }
}

impl QueueConfig {
    pub fn new(segment_capacity: u64, disk_limit: u64) -> Self {
        Self {
            segment_capacity,
            disk_limit,
            ..Self::default()
        }
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_sync_consumed(mut self, sync_consumed: bool) -> Self {
        self.sync_consumed = sync_consumed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_capacity <= SEGMENT_HEADER_SIZE as u64 {
            return Err(Error::InvalidConfig(
                "segment capacity must exceed the segment header",
            ));
        }
        if self.disk_limit != 0 && self.disk_limit < self.segment_capacity {
            return Err(Error::InvalidConfig(
                "disk limit must be zero or at least one segment",
            ));
        }
        Ok(())
    }

    pub(crate) fn limit_enabled(&self) -> bool {
        self.disk_limit != 0
    }
}
