//! Crash-recoverable FIFO queue that spills items to numbered segment files.
//!
//! Every push is synced before it returns and every pop clears the item's
//! active flag on disk, so a queue reopened after power loss resumes at the
//! first unconsumed item.

pub mod config;
pub mod dir_lock;
pub mod error;
pub mod header;
mod queue;
mod reader;
pub mod retention;
pub mod scan;
pub mod segment;
mod writer;

pub use config::{OverflowPolicy, QueueConfig};
pub use error::{Error, Result};
pub use queue::DiskQueue;
pub use scan::{inspect_segment, SegmentReport};
