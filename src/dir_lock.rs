//! Advisory lock that keeps a second process off a queue directory.
//!
//! The lock file lives next to the segments as `.lock`; its name is not a
//! decimal number so the segment scan never sees it. It records the holder
//! pid for diagnostics only, the `flock` is what excludes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub const LOCK_FILE: &str = ".lock";

#[derive(Debug)]
pub(crate) struct DirLock {
    _file: File,
}

impl DirLock {
    pub(crate) fn acquire(root: &Path) -> Result<Self> {
        let path = lock_path(root);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| Error::fs(&path, err))?;
        if !try_lock(&file)? {
            return Err(Error::Locked(root.to_path_buf()));
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

/// Pid recorded by the last holder, if any. The holder may be gone.
pub fn read_lock_pid(root: &Path) -> Result<Option<u32>> {
    let mut file = match File::open(lock_path(root)) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(contents.trim().parse::<u32>().ok())
}

#[cfg(unix)]
fn try_lock(file: &File) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(Error::Io(err))
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempdir().expect("tempdir");
        let first = DirLock::acquire(dir.path()).expect("first lock");
        assert!(matches!(DirLock::acquire(dir.path()), Err(Error::Locked(_))));
        assert_eq!(
            read_lock_pid(dir.path()).expect("pid"),
            Some(std::process::id())
        );
        drop(first);
        DirLock::acquire(dir.path()).expect("relock");
    }

    #[test]
    fn missing_lock_file_has_no_pid() {
        let dir = tempdir().expect("tempdir");
        assert_eq!(read_lock_pid(dir.path()).expect("pid"), None);
    }
}
