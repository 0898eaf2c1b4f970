//! Exclusive directory locks for file-backed drivers.
//!
//! Only one process may write a store at a time. The lock is an advisory
//! `flock`/`LockFileEx` on a `.lock` file inside the store directory and is
//! held until the [`FileLock`] is dropped. Read-only legacy stores never
//! take it.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

use super::traits::StorageError;

/// Name of the lock file inside a store directory.
pub const LOCK_FILE: &str = ".lock";

/// Exclusive lock on a store directory.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Takes the lock on `dir` without waiting.
    ///
    /// # Errors
    /// `ErrorKind::WouldBlock` while another handle holds it, or the error
    /// from creating the lock file.
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !sys::try_lock_exclusive(&file)? {
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("{} is held by another process", path.display()),
            ));
        }
        Ok(Self { _file: file, path })
    }

    /// [`acquire`](Self::acquire) with the error mapped for drivers.
    ///
    /// # Errors
    /// `StorageError::Locked` when the store is in use, `StorageError::Io`
    /// otherwise.
    pub fn acquire_store(dir: &Path) -> Result<Self, StorageError> {
        Self::acquire(dir).map_err(|e| match e.kind() {
            ErrorKind::WouldBlock => StorageError::Locked(dir.display().to_string()),
            _ => StorageError::io(format!("failed to lock {}", dir.display()), e),
        })
    }

    /// Lock file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io::{Error as IoError, Result as IoResult};
    use std::os::unix::io::AsRawFd;

    /// `Ok(false)` when the lock is held elsewhere.
    pub fn try_lock_exclusive(file: &File) -> IoResult<bool> {
        // SAFETY: the descriptor stays owned by `file` for the whole call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = IoError::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK => Ok(false),
            _ => Err(err),
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io::{Error as IoError, Result as IoResult};
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    /// `Ok(false)` when the lock is held elsewhere.
    pub fn try_lock_exclusive(file: &File) -> IoResult<bool> {
        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: the handle stays owned by `file`; OVERLAPPED is plain data.
        let ok = unsafe {
            let mut overlapped: OVERLAPPED = std::mem::zeroed();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = IoError::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == ERROR_LOCK_VIOLATION as i32 => Ok(false),
            _ => Err(err),
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::fs::File;
    use std::io::{Error as IoError, ErrorKind, Result as IoResult};

    pub fn try_lock_exclusive(_file: &File) -> IoResult<bool> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "file locking is not supported on this platform",
        ))
    }
}
