// SPDX-License-Identifier: GPL-3.0-only

//! Advisory lock preventing two resolvers from working on the same image.
//!
//! Uses `flock` on a `<image>.lock` file next to the image.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SysError};

/// Exclusive lock held for the lifetime of the guard.
///
/// The OS releases the lock when the process exits or crashes.
#[derive(Debug)]
pub struct ImageLock {
    file: File,
    path: PathBuf,
}

impl ImageLock {
    /// Try to take the lock for `image` without blocking.
    pub fn acquire(image: &Path) -> Result<Self> {
        let mut name = image.as_os_str().to_os_string();
        name.push(".lock");
        let lock_path = PathBuf::from(name);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(SysError::Locked(image.to_path_buf()));
            }
            return Err(SysError::Io(err));
        }

        debug!(lock_path = %lock_path.display(), "Acquired image lock");
        Ok(Self {
            file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ImageLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(lock_path = %self.path.display(), "Released image lock");
    }
}
