//! Durable channel state store.
//!
//! Two JSON files describe a channel between processes:
//!
//! - `state.json`: parameters, the DMA page slot table (bus address and fill
//!   state per page) and the clean-shutdown marker
//! - `fifo.json`: FIFO cursors and the ring of outstanding descriptors
//!
//! Both are written with temp file + `fsync` + `rename`, FIFO first. The
//! state file is the commit point: its clean-shutdown marker is only set by a
//! graceful close, after the FIFO file describing that close has landed.
//!
//! # Reload policy
//!
//! A record without the clean-shutdown marker belongs to a process that died
//! with descriptors possibly in flight. Those cannot be trusted, so reloading
//! it zeroes the cursors and frees every slot. A cleanly closed record is
//! restored verbatim, provided its FIFO file is present and consistent.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, RorcError};
use crate::fifo::{DescriptorFifo, FifoCursors, PageDescriptor, SlotState};
use crate::identity::ChannelId;
use crate::params::ChannelParameters;
use crate::paths::ChannelPaths;

/// Version of the on-disk record layout.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// One entry of the persisted slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSlot {
    /// Slot index
    pub index: u32,
    /// Bus address the card uses for this page
    pub bus_address: u64,
    /// Fill state
    pub state: SlotState,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    format_version: u32,
    serial: i32,
    channel: u32,
    parameters: ChannelParameters,
    slots: Vec<PageSlot>,
    closed_cleanly: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct FifoRecord {
    format_version: u32,
    serial: i32,
    channel: u32,
    cursors: FifoCursors,
    ring: Vec<Option<PageDescriptor>>,
}

/// Configuration and page table of a channel, as persisted.
///
/// The FIFO itself lives in the backend while the channel is open and is
/// passed alongside this record to [`StateStore::persist`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelState {
    /// Channel this state belongs to
    pub channel: ChannelId,
    /// Parameters in effect
    pub parameters: ChannelParameters,
    /// Bus address of each page
    pub bus_addresses: Vec<u64>,
    /// Set only by a graceful close
    pub closed_cleanly: bool,
}

impl ChannelState {
    /// Fresh state: dummy bus addresses (byte offsets) and no clean marker.
    pub fn new(channel: ChannelId, parameters: ChannelParameters) -> Self {
        let bus_addresses = (0..parameters.page_count)
            .map(|i| u64::from(i) * parameters.page_size as u64)
            .collect();
        Self {
            channel,
            parameters,
            bus_addresses,
            closed_cleanly: false,
        }
    }
}

/// Result of [`StateStore::load_or_create`].
#[derive(Debug)]
pub struct LoadedState {
    /// Channel record
    pub state: ChannelState,
    /// FIFO to hand to the backend
    pub fifo: DescriptorFifo,
    /// The state files did not exist and were created by this call
    pub created: bool,
    /// Cursors were restored from a cleanly closed record
    pub restored: bool,
}

/// Reads and writes a channel's state and FIFO files.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    fifo_path: PathBuf,
}

impl StateStore {
    /// Bind to the state and FIFO paths of a channel.
    pub fn new(paths: &ChannelPaths) -> Self {
        Self {
            state_path: paths.state().to_path_buf(),
            fifo_path: paths.fifo().to_path_buf(),
        }
    }

    /// Path of the state file.
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Path of the FIFO file.
    pub fn fifo_path(&self) -> &Path {
        &self.fifo_path
    }

    /// Whether a state record exists on disk.
    pub fn exists(&self) -> bool {
        self.state_path.exists()
    }

    /// Load the persisted state, or create it if none exists.
    ///
    /// # Errors
    ///
    /// - [`RorcError::ChannelStateConflict`] if the record exists but is
    ///   unreadable or incompatible with `params`. The files are not modified.
    /// - [`RorcError::Filesystem`] on I/O failure.
    pub fn load_or_create(
        &self,
        channel: &ChannelId,
        params: &ChannelParameters,
    ) -> Result<LoadedState> {
        if !self.exists() {
            return self.create(channel, params);
        }

        let bytes = fs::read(&self.state_path).map_err(|e| RorcError::filesystem(&self.state_path, e))?;
        let record: StateRecord = serde_json::from_slice(&bytes)
            .map_err(|e| RorcError::state_conflict(channel, format!("unreadable state file: {}", e)))?;

        if record.format_version != STATE_FORMAT_VERSION {
            return Err(RorcError::state_conflict(
                channel,
                format!("unsupported state format version {}", record.format_version),
            ));
        }
        if record.serial != channel.serial() || record.channel != channel.channel() {
            return Err(RorcError::state_conflict(
                channel,
                format!(
                    "state file belongs to serial {} channel {}",
                    record.serial, record.channel
                ),
            ));
        }
        if let Some(reason) = params.incompatibility(&record.parameters) {
            return Err(RorcError::state_conflict(channel, reason));
        }
        if record.slots.len() != params.page_count as usize {
            return Err(RorcError::state_conflict(
                channel,
                format!(
                    "slot table has {} entries for {} pages",
                    record.slots.len(),
                    params.page_count
                ),
            ));
        }

        let restored = if record.closed_cleanly {
            self.restore_fifo(channel, &record)
        } else {
            warn!(%channel, "Previous owner did not close cleanly, discarding in-flight descriptors");
            None
        };

        let (fifo, restored) = match restored {
            Some(fifo) => (fifo, true),
            None => (DescriptorFifo::new(channel.clone(), params.page_count), false),
        };

        info!(
            %channel,
            restored,
            write = fifo.cursors().write,
            read = fifo.cursors().read,
            "Loaded channel state"
        );

        Ok(LoadedState {
            state: ChannelState {
                channel: channel.clone(),
                parameters: params.clone(),
                bus_addresses: record.slots.iter().map(|s| s.bus_address).collect(),
                closed_cleanly: record.closed_cleanly,
            },
            fifo,
            created: false,
            restored,
        })
    }

    /// Durably write the FIFO, then the state record.
    pub fn persist(&self, state: &ChannelState, fifo: &DescriptorFifo) -> Result<()> {
        let channel = &state.channel;

        let fifo_record = FifoRecord {
            format_version: STATE_FORMAT_VERSION,
            serial: channel.serial(),
            channel: channel.channel(),
            cursors: fifo.cursors(),
            ring: fifo.ring().to_vec(),
        };

        let slots = state
            .bus_addresses
            .iter()
            .zip(fifo.slots())
            .enumerate()
            .map(|(index, (&bus_address, &slot))| PageSlot {
                index: index as u32,
                bus_address,
                state: slot,
            })
            .collect();
        let state_record = StateRecord {
            format_version: STATE_FORMAT_VERSION,
            serial: channel.serial(),
            channel: channel.channel(),
            parameters: state.parameters.clone(),
            slots,
            closed_cleanly: state.closed_cleanly,
        };

        write_json_atomic(&self.fifo_path, &fifo_record)?;
        write_json_atomic(&self.state_path, &state_record)?;

        debug!(
            %channel,
            write = fifo_record.cursors.write,
            read = fifo_record.cursors.read,
            clean = state.closed_cleanly,
            "Persisted channel state"
        );
        Ok(())
    }

    /// Parameters of the persisted record, without validating or modifying it.
    pub fn read_parameters(&self, channel: &ChannelId) -> Result<Option<ChannelParameters>> {
        let bytes = match fs::read(&self.state_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RorcError::filesystem(&self.state_path, e)),
        };
        let record: StateRecord = serde_json::from_slice(&bytes)
            .map_err(|e| RorcError::state_conflict(channel, format!("unreadable state file: {}", e)))?;
        Ok(Some(record.parameters))
    }

    /// Delete the state and FIFO files. Missing files are not an error.
    pub fn remove(&self) -> Result<()> {
        for path in [&self.state_path, &self.fifo_path] {
            remove_if_exists(path)?;
        }
        Ok(())
    }

    fn create(&self, channel: &ChannelId, params: &ChannelParameters) -> Result<LoadedState> {
        let state = ChannelState::new(channel.clone(), params.clone());
        let fifo = DescriptorFifo::new(channel.clone(), params.page_count);

        if let Err(e) = self.persist(&state, &fifo) {
            // Do not leave a half-created record behind
            if let Err(cleanup) = self.remove() {
                warn!(%channel, "Failed to remove partially created state: {}", cleanup);
            }
            return Err(e);
        }

        info!(%channel, page_size = params.page_size, page_count = params.page_count, "Created channel state");

        Ok(LoadedState {
            state,
            fifo,
            created: true,
            restored: false,
        })
    }

    fn restore_fifo(&self, channel: &ChannelId, record: &StateRecord) -> Option<DescriptorFifo> {
        let bytes = match fs::read(&self.fifo_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%channel, "FIFO state unreadable, resetting cursors: {}", e);
                return None;
            }
        };
        let fifo: FifoRecord = match serde_json::from_slice(&bytes) {
            Ok(fifo) => fifo,
            Err(e) => {
                warn!(%channel, "FIFO state corrupt, resetting cursors: {}", e);
                return None;
            }
        };

        if fifo.format_version != STATE_FORMAT_VERSION
            || fifo.serial != record.serial
            || fifo.channel != record.channel
        {
            warn!(%channel, "FIFO state belongs to another record, resetting cursors");
            return None;
        }

        let page_size = record.parameters.page_size;
        let misplaced = fifo.ring.iter().flatten().any(|page| {
            page.offset != u64::from(page.index) * page_size as u64 || page.size as usize != page_size
        });
        if misplaced {
            warn!(%channel, "FIFO descriptors do not match the page geometry, resetting cursors");
            return None;
        }

        let slots = record.slots.iter().map(|s| s.state).collect();
        let restored = DescriptorFifo::restore(channel.clone(), fifo.cursors, fifo.ring, slots);
        if restored.is_none() {
            warn!(%channel, "FIFO state inconsistent with slot table, resetting cursors");
        }
        restored
    }
}

/// Serialize `value` to `path` via a synced temp file and an atomic rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| RorcError::filesystem(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| RorcError::filesystem(&tmp, e))?;
    file.write_all(&bytes).map_err(|e| RorcError::filesystem(&tmp, e))?;
    file.sync_all().map_err(|e| RorcError::filesystem(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| RorcError::filesystem(path, e))?;

    // Make the rename itself durable
    if let Some(parent) = path.parent() {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            warn!(path = %parent.display(), "Failed to sync directory after rename: {}", e);
        }
    }
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RorcError::filesystem(path, e)),
    }
}
