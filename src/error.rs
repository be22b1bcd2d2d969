use std::collections::TryReserveError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file system error at {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("out of memory")]
    OutOfMemory,
    #[error("short segment header")]
    ShortHeader,
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported segment version: {0}")]
    UnsupportedVersion(u8),
    #[error("queue is not running")]
    NotRunning,
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("disk limit reached")]
    DiskFull,
    #[error("queue directory locked by another process: {}", .0.display())]
    Locked(PathBuf),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FileSystem {
            path: path.into(),
            source,
        }
    }

    /// True for errors that mean the segment content itself is unusable.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corrupt(_) | Error::UnsupportedVersion(_) | Error::ShortHeader
        )
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::OutOfMemory
    }
}

pub type Result<T> = std::result::Result<T, Error>;
