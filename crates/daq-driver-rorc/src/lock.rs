//! Exclusive, cross-process channel lock.
//!
//! Readout card channels have no internal arbitration: two processes pushing
//! descriptors to the same channel silently corrupt each other's DMA state.
//! [`ChannelLock`] wraps an advisory `flock(2)` on the channel's lock file.
//! Acquisition never blocks, and the only way to release the lock is to drop
//! the guard (or for the process to exit, in which case the kernel drops it).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, RorcError};
use crate::identity::ChannelId;

/// RAII guard for a channel's lock file.
#[derive(Debug)]
pub struct ChannelLock {
    file: File,
    path: PathBuf,
    channel: ChannelId,
}

impl ChannelLock {
    /// Create the lock file if needed and take a non-blocking exclusive lock.
    ///
    /// # Errors
    ///
    /// - [`RorcError::ChannelBusy`] if another open file description holds the lock
    /// - [`RorcError::Filesystem`] if the lock file cannot be created or locked
    pub fn acquire(path: &Path, channel: &ChannelId) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| RorcError::filesystem(path, e))?;

        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) => RorcError::ChannelBusy {
                    channel: channel.clone(),
                },
                _ => RorcError::filesystem(path, err),
            });
        }

        debug!(path = %path.display(), %channel, "Acquired channel lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            channel: channel.clone(),
        })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The channel this lock guards.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }
}

impl Drop for ChannelLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            // Closing the descriptor below releases the lock regardless.
            warn!(path = %self.path.display(), "Explicit unlock failed: {}", io::Error::last_os_error());
        }
        debug!(path = %self.path.display(), channel = %self.channel, "Released channel lock");
    }
}
