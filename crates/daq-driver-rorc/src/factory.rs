//! Channel factory and runtime channel handle.
//!
//! [`ChannelFactory::get_channel`] is the only way to obtain a
//! [`ChannelHandle`]. Opening a channel runs these steps in order, each one
//! failing fast:
//!
//! 1. validate parameters and resolve the artifact paths
//! 2. create the channel directory
//! 3. take the exclusive channel lock
//! 4. load (or create) the persisted state
//! 5. map the page buffer and construct the backend
//! 6. persist the opened record
//!
//! If step 2 fails, directories it created are removed. If steps 4-5 fail,
//! the state, FIFO and page buffer files created by the call are removed
//! before the lock is released. The lock file itself stays: it is never
//! deleted once created, and an empty lock file reads as a channel that was
//! never opened. A `ChannelBusy` failure touches nothing.
//!
//! # Example
//!
//! ```no_run
//! use daq_driver_rorc::{CardId, ChannelFactory, ChannelParameters, RorcConfig};
//!
//! let factory = ChannelFactory::new(RorcConfig::default());
//! let params = ChannelParameters::builder().page_size(8192).page_count(4).build()?;
//! let mut handle = factory.get_channel(&CardId::new(12345), 0, &params)?;
//!
//! if let Some(page) = handle.next_free_page() {
//!     handle.push_page(page)?;
//! }
//! while let Some(page) = handle.pop_completed()? {
//!     println!("page {} ready: {} bytes", page.index, handle.page_data(&page)?.len());
//! }
//! handle.close()?;
//! # Ok::<(), daq_driver_rorc::RorcError>(())
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::backend::{self, BackendKind, BackendState, ChannelBackend};
use crate::buffer::PageBuffer;
use crate::config::RorcConfig;
use crate::error::{Result, RorcError};
use crate::fifo::{FifoCursors, PageDescriptor, SlotState};
use crate::identity::{CardId, ChannelId};
use crate::lock::ChannelLock;
use crate::params::ChannelParameters;
use crate::paths::ChannelPaths;
use crate::state::{self, ChannelState, StateStore};

// =============================================================================
// Factory
// =============================================================================

/// Opens and destroys readout card channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelFactory {
    config: RorcConfig,
}

impl ChannelFactory {
    /// Create a factory from an already loaded configuration.
    pub fn new(config: RorcConfig) -> Self {
        Self { config }
    }

    /// Create a factory from a TOML file layered under `RORC_` environment variables.
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        RorcConfig::load_from(path).map(Self::new)
    }

    /// Create a factory from defaults layered under `RORC_` environment variables.
    pub fn from_env() -> Result<Self> {
        RorcConfig::load().map(Self::new)
    }

    /// The configuration in use.
    pub fn config(&self) -> &RorcConfig {
        &self.config
    }

    /// Artifact paths of a channel under this factory's root.
    pub fn channel_paths(&self, card: &CardId, channel: u32) -> Result<ChannelPaths> {
        ChannelPaths::resolve(&self.config.root_dir, &ChannelId::new(card.clone(), channel))
    }

    /// Parameters persisted for a channel, if it has state on disk.
    ///
    /// Reads without taking the lock, so the answer may be stale by the time
    /// the channel is opened.
    pub fn persisted_parameters(&self, card: &CardId, channel: u32) -> Result<Option<ChannelParameters>> {
        let id = ChannelId::new(card.clone(), channel);
        let paths = ChannelPaths::resolve(&self.config.root_dir, &id)?;
        StateStore::new(&paths).read_parameters(&id)
    }

    /// Open a channel for exclusive use.
    ///
    /// # Errors
    ///
    /// - [`RorcError::InvalidArgument`] for bad parameters or channel number
    /// - [`RorcError::Filesystem`] if the channel directory or files cannot be created
    /// - [`RorcError::ChannelBusy`] if another handle holds the channel
    /// - [`RorcError::ChannelStateConflict`] if persisted state is incompatible
    /// - [`RorcError::HardwareFault`] if the card cannot be opened
    pub fn get_channel(
        &self,
        card: &CardId,
        channel: u32,
        params: &ChannelParameters,
    ) -> Result<ChannelHandle> {
        params.validate()?;
        let id = ChannelId::new(card.clone(), channel);
        let paths = ChannelPaths::resolve(&self.config.root_dir, &id)?;

        let mut dirs = ArtifactGuard::directories(&paths);
        for dir in paths.parent_dirs() {
            fs::create_dir_all(dir).map_err(|e| RorcError::filesystem(dir, e))?;
        }
        // Past this point the directories hold the lock file, which is never removed
        dirs.disarm();

        // On ChannelBusy every artifact belongs to the holder
        let lock = ChannelLock::acquire(paths.lock(), &id)?;

        // Taken under the lock, so only files created by this call are listed
        let mut files = ArtifactGuard::files(&paths);

        match self.open_locked(&id, &paths, params) {
            Ok((state, backend, buffer)) => {
                files.disarm();
                info!(
                    channel = %id,
                    backend = %backend.kind(),
                    write = backend.fifo().cursors().write,
                    read = backend.fifo().cursors().read,
                    "Opened channel"
                );
                Ok(ChannelHandle {
                    channel: id,
                    state,
                    backend,
                    buffer,
                    store: StateStore::new(&paths),
                    paths,
                    lock,
                })
            }
            Err(e) => {
                warn!(channel = %id, "Failed to open channel: {}", e);
                // Clean up while still holding the lock
                files.cleanup();
                drop(lock);
                Err(e)
            }
        }
    }

    fn open_locked(
        &self,
        id: &ChannelId,
        paths: &ChannelPaths,
        params: &ChannelParameters,
    ) -> Result<(ChannelState, Box<dyn ChannelBackend>, PageBuffer)> {
        let store = StateStore::new(paths);
        let loaded = store.load_or_create(id, params)?;

        let buffer = PageBuffer::open_or_create(paths.pages(), params)?;
        let backend = backend::open_backend(
            self.config.backend,
            &self.config.sysfs_root,
            id,
            params,
            loaded.fifo,
            &buffer,
        )?;

        let mut state = loaded.state;
        state.bus_addresses = backend.bus_addresses().to_vec();
        state.closed_cleanly = false;
        store.persist(&state, backend.fifo())?;

        Ok((state, backend, buffer))
    }

    /// Remove a channel's persisted state, FIFO and page buffer files.
    ///
    /// The lock file and directory are kept. Fails with `ChannelBusy` while a
    /// handle for the channel is alive.
    pub fn destroy_channel(&self, card: &CardId, channel: u32) -> Result<()> {
        let id = ChannelId::new(card.clone(), channel);
        let paths = ChannelPaths::resolve(&self.config.root_dir, &id)?;

        let exists = paths.lock().parent().is_some_and(Path::exists);
        if !exists {
            debug!(channel = %id, "No channel state to destroy");
            return Ok(());
        }

        let _lock = ChannelLock::acquire(paths.lock(), &id)?;
        StateStore::new(&paths).remove()?;
        state::remove_if_exists(paths.pages())?;

        info!(channel = %id, "Destroyed channel state");
        Ok(())
    }
}

// =============================================================================
// Channel Handle
// =============================================================================

/// Exclusive, open channel.
///
/// Every push, successful pop and reset is persisted before the call
/// returns. [`close`](Self::close) marks the persisted record as cleanly
/// closed. Dropping the handle without closing only releases the lock, which
/// is what happens when the owning process dies; the next open then discards
/// the in-flight cursors.
#[derive(Debug)]
pub struct ChannelHandle {
    channel: ChannelId,
    state: ChannelState,
    backend: Box<dyn ChannelBackend>,
    buffer: PageBuffer,
    store: StateStore,
    paths: ChannelPaths,
    // Dropped last
    lock: ChannelLock,
}

impl ChannelHandle {
    /// The channel this handle owns.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Parameters the channel was opened with.
    pub fn parameters(&self) -> &ChannelParameters {
        &self.state.parameters
    }

    /// Artifact paths.
    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    /// Lock file held by this handle.
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Which backend serves the channel.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Backend lifecycle state.
    pub fn backend_state(&self) -> BackendState {
        self.backend.state()
    }

    /// Read a channel register (32-bit word index).
    pub fn read_register(&self, index: u32) -> Result<u32> {
        self.backend.read_register(index)
    }

    /// Write a channel register (32-bit word index).
    ///
    /// A write that sets the control register's reset bit resets the channel
    /// like [`reset`](Self::reset), and is persisted the same way.
    pub fn write_register(&mut self, index: u32, value: u32) -> Result<()> {
        self.backend.write_register(index, value)?;
        if backend::is_reset_write(index, value) {
            info!(channel = %self.channel, "Reset channel through control register");
            self.persist()?;
        }
        Ok(())
    }

    /// Descriptor of page `index`.
    pub fn page(&self, index: u32) -> Result<PageDescriptor> {
        let bus_address = self
            .backend
            .bus_addresses()
            .get(index as usize)
            .copied()
            .ok_or_else(|| {
                RorcError::invalid_argument(format!(
                    "Page {} out of range: buffer has {} pages",
                    index,
                    self.buffer.page_count()
                ))
            })?;
        self.buffer.descriptor(index, bus_address)
    }

    /// The next page that is not owned by the card, starting at the write cursor.
    pub fn next_free_page(&self) -> Option<PageDescriptor> {
        let fifo = self.backend.fifo();
        let cursors = fifo.cursors();
        if cursors.is_full() {
            return None;
        }
        let capacity = cursors.capacity as usize;
        let start = cursors.position(cursors.write);
        (0..capacity)
            .map(|i| (start + i) % capacity)
            .find(|&slot| fifo.slots()[slot] != SlotState::Filled)
            .and_then(|slot| self.page(slot as u32).ok())
    }

    /// Hand a page to the card.
    ///
    /// Fails with `HardwareBusy` (cursors unchanged) when the FIFO is full.
    pub fn push_page(&mut self, page: PageDescriptor) -> Result<()> {
        self.backend.push_page(page)?;
        self.persist()
    }

    /// The oldest completed page, or `None` if nothing has completed yet.
    pub fn pop_completed(&mut self) -> Result<Option<PageDescriptor>> {
        let page = self.backend.pop_completed()?;
        if page.is_some() {
            self.persist()?;
        }
        Ok(page)
    }

    /// Bytes of a page.
    pub fn page_data(&self, page: &PageDescriptor) -> Result<&[u8]> {
        self.buffer.data(page)
    }

    /// FIFO cursor snapshot.
    pub fn fifo_status(&self) -> FifoCursors {
        self.backend.fifo().cursors()
    }

    /// Fill state of every page slot.
    pub fn slot_states(&self) -> &[SlotState] {
        self.backend.fifo().slots()
    }

    /// Reset the channel: DMA engine reset, FIFO zeroed, every slot free.
    pub fn reset(&mut self) -> Result<()> {
        self.backend.reset()?;
        info!(channel = %self.channel, "Reset channel");
        self.persist()
    }

    /// Quiesce the backend, persist a cleanly closed record and release the lock.
    pub fn close(mut self) -> Result<()> {
        self.backend.close()?;
        self.buffer.flush()?;
        self.state.closed_cleanly = true;
        self.persist()?;
        info!(
            channel = %self.channel,
            outstanding = self.fifo_status().filled(),
            "Closed channel"
        );
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        self.store.persist(&self.state, self.backend.fifo())
    }
}

// =============================================================================
// Failure Cleanup
// =============================================================================

/// Removes the channel artifacts that did not exist when it was created.
///
/// Cleans up on drop unless disarmed. The lock file is never listed:
/// unlinking a lock file lets a later opener lock a new inode while an
/// earlier one still holds the old.
#[derive(Debug)]
struct ArtifactGuard {
    files: Vec<PathBuf>,
    /// Deepest first
    dirs: Vec<PathBuf>,
    armed: bool,
}

impl ArtifactGuard {
    /// Channel directories that do not exist yet.
    fn directories(paths: &ChannelPaths) -> Self {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for parent in paths.parent_dirs() {
            for dir in parent.ancestors().take_while(|d| !d.as_os_str().is_empty() && !d.exists()) {
                if !dirs.iter().any(|d| d == dir) {
                    dirs.push(dir.to_path_buf());
                }
            }
        }
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));

        Self {
            files: Vec::new(),
            dirs,
            armed: true,
        }
    }

    /// State, FIFO and page buffer files that do not exist yet.
    fn files(paths: &ChannelPaths) -> Self {
        let files = [paths.state(), paths.fifo(), paths.pages()]
            .into_iter()
            .filter(|p| !p.exists())
            .map(Path::to_path_buf)
            .collect();

        Self {
            files,
            dirs: Vec::new(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn cleanup(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        for file in &self.files {
            match fs::remove_file(file) {
                Ok(()) => debug!(path = %file.display(), "Removed artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %file.display(), "Failed to remove artifact: {}", e),
            }
        }
        // Only empty directories go; anything else was not ours
        for dir in &self.dirs {
            if fs::remove_dir(dir).is_ok() {
                debug!(path = %dir.display(), "Removed directory");
            }
        }
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}
