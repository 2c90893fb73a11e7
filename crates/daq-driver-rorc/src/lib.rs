//! Channel driver for ALICE-style readout receiver cards (C-RORC / CRU).
//!
//! A readout card exposes several DMA channels. This crate gives a process
//! exclusive, crash-safe ownership of one channel at a time: it resolves the
//! channel's files, takes an advisory lock, restores or creates the persisted
//! DMA state, and hands back a [`ChannelHandle`] backed either by the real
//! card or by an in-memory dummy.
//!
//! # Architecture
//!
//! ## Channel Access
//! - [`ChannelFactory`] - Opens and destroys channels
//! - [`ChannelHandle`] - Exclusive open channel, releases its lock on drop
//! - [`RorcConfig`] - Artifact root, backend selection and sysfs root
//!
//! ## Persistence
//! - [`ChannelPaths`] - Where a channel's artifacts live
//! - [`ChannelLock`] - Non-blocking `flock(2)` guard
//! - [`StateStore`] - Atomic state and FIFO records with a clean-shutdown marker
//! - [`PageBuffer`] - File-backed DMA page buffer mapping
//!
//! ## DMA
//! - [`DescriptorFifo`] - Outstanding descriptors and per-page fill states
//! - [`ChannelBackend`] - Register access and FIFO traffic
//! - [`HardwareChannel`] / [`DummyChannel`] - Backend variants
//! - [`PciAccess`] / [`SysfsPci`] - Register and DMA access to the card
//!
//! # Artifact Layout
//!
//! ```text
//! <root_dir>/serial_<serial>/channel_<n>/
//!     pages       DMA page buffer
//!     fifo.json   FIFO cursors and outstanding descriptors
//!     state.json  parameters, page slots, clean-shutdown marker
//!     lock        exclusive lock file
//! ```
//!
//! The root defaults to `/dev/shm/rorc`, so state survives process restarts
//! but not reboots.
//!
//! # Examples
//!
//! ## Register Access
//!
//! ```no_run
//! use daq_driver_rorc::{CardId, ChannelFactory, ChannelParameters};
//!
//! # fn example() -> daq_driver_rorc::Result<()> {
//! let factory = ChannelFactory::from_env()?;
//! let handle = factory.get_channel(&CardId::new(12345), 0, &ChannelParameters::default())?;
//!
//! // Byte address 0x8 is word 2
//! println!("page size register: {:#x}", handle.read_register(0x8 / 4)?);
//! handle.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## DMA With The Data Generator
//!
//! ```no_run
//! use daq_driver_rorc::{CardId, ChannelFactory, ChannelParameters, GeneratorPattern, RorcError};
//!
//! # fn example() -> daq_driver_rorc::Result<()> {
//! let factory = ChannelFactory::from_env()?;
//! let params = ChannelParameters::builder()
//!     .page_size(8192)
//!     .page_count(4)
//!     .generator(GeneratorPattern::Incremental)
//!     .build()?;
//! let mut handle = factory.get_channel(&CardId::new(12345), 0, &params)?;
//!
//! let mut received = 0;
//! while received < 100 {
//!     if let Some(page) = handle.next_free_page() {
//!         match handle.push_page(page) {
//!             Ok(()) | Err(RorcError::HardwareBusy { .. }) => {}
//!             Err(e) => return Err(e),
//!         }
//!     }
//!     if let Some(page) = handle.pop_completed()? {
//!         let data = handle.page_data(&page)?;
//!         received += 1;
//!         println!("page {}: first word {:02x?}", page.index, &data[..4]);
//!     }
//! }
//! handle.close()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod factory;
pub mod fifo;
pub mod identity;
pub mod lock;
pub mod params;
pub mod paths;
pub mod pda;
pub mod state;

/// Driver version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use backend::{
    BackendKind, BackendSelection, BackendState, ChannelBackend, DummyChannel, HardwareChannel,
    CHANNEL_REGISTERS,
};
pub use buffer::PageBuffer;
pub use config::RorcConfig;
pub use error::{ErrorKind, Result, RorcError};
pub use factory::{ChannelFactory, ChannelHandle};
pub use fifo::{DescriptorFifo, FifoCursors, PageDescriptor, SlotState};
pub use identity::{CardId, ChannelId, PciAddress, DUMMY_SERIAL_NUMBER, MAX_CHANNELS};
pub use lock::ChannelLock;
pub use params::{ChannelParameters, ChannelParametersBuilder, GeneratorPattern, LoopbackMode};
pub use paths::ChannelPaths;
pub use pda::{PciAccess, SysfsPci};
pub use state::{ChannelState, LoadedState, StateStore};
