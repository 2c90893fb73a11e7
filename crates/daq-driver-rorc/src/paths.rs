//! Canonical filesystem locations of a channel's persisted artifacts.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/serial_<serial>/channel_<n>/pages      DMA page buffer
//! <root>/serial_<serial>/channel_<n>/fifo.json  FIFO descriptor state
//! <root>/serial_<serial>/channel_<n>/state.json channel state
//! <root>/serial_<serial>/channel_<n>/lock       exclusive lock file
//! ```

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::identity::ChannelId;

/// The four artifact paths of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    pages: PathBuf,
    fifo: PathBuf,
    state: PathBuf,
    lock: PathBuf,
}

impl ChannelPaths {
    /// Resolve the paths for `channel` under `root`. Performs no I/O.
    pub fn resolve(root: &Path, channel: &ChannelId) -> Result<Self> {
        channel.validate()?;

        let dir = root
            .join(format!("serial_{}", channel.serial()))
            .join(format!("channel_{}", channel.channel()));

        Ok(Self {
            pages: dir.join("pages"),
            fifo: dir.join("fifo.json"),
            state: dir.join("state.json"),
            lock: dir.join("lock"),
        })
    }

    /// DMA page buffer file.
    pub fn pages(&self) -> &Path {
        &self.pages
    }

    /// FIFO descriptor state file.
    pub fn fifo(&self) -> &Path {
        &self.fifo
    }

    /// Channel state file.
    pub fn state(&self) -> &Path {
        &self.state
    }

    /// Lock file.
    pub fn lock(&self) -> &Path {
        &self.lock
    }

    /// All four paths.
    pub fn all(&self) -> [&Path; 4] {
        [&self.pages, &self.fifo, &self.state, &self.lock]
    }

    /// Distinct parent directories of the four paths.
    pub fn parent_dirs(&self) -> Vec<&Path> {
        let mut dirs: Vec<&Path> = Vec::with_capacity(4);
        for parent in self.all().iter().filter_map(|p| p.parent()) {
            if !dirs.contains(&parent) {
                dirs.push(parent);
            }
        }
        dirs
    }
}
