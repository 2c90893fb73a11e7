//! Channel backends.
//!
//! A backend performs register access and descriptor FIFO traffic for one
//! channel. Two variants exist:
//!
//! - [`HardwareChannel`] drives a real card through [`PciAccess`]
//! - [`DummyChannel`] emulates a card in memory, for absent hardware and tests
//!
//! Both own the channel's [`DescriptorFifo`] and share the same state machine:
//!
//! ```text
//! Closed -> Open -> Streaming -> Closed
//! ```
//!
//! Pushing a page moves an open backend to `Streaming`. `reset()` is valid in
//! every state and leaves the backend `Open` with the FIFO zeroed. Any other
//! operation on a `Closed` backend fails with `InvalidArgument`.
//!
//! Register indices are 32-bit words relative to the channel's register
//! window of [`CHANNEL_REGISTERS`] words.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::buffer::PageBuffer;
use crate::error::{Result, RorcError};
use crate::fifo::{DescriptorFifo, PageDescriptor};
use crate::identity::ChannelId;
use crate::params::{ChannelParameters, GeneratorPattern};
use crate::pda::{self, regs};

mod dummy;
mod hardware;

pub use dummy::DummyChannel;
pub use hardware::HardwareChannel;

/// Size of a channel's register window in 32-bit words.
pub const CHANNEL_REGISTERS: u32 = regs::CHANNEL_STRIDE;

/// Which backend variant serves a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Real card through the PCI access layer
    Hardware,
    /// In-memory emulation
    Dummy,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hardware => write!(f, "hardware"),
            Self::Dummy => write!(f, "dummy"),
        }
    }
}

/// Lifecycle state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Quiesced; only `reset()` is accepted
    Closed,
    /// Registers accessible, no descriptor pushed since the last reset
    Open,
    /// Descriptors have been pushed
    Streaming,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// Backend selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendSelection {
    /// Hardware when the card is found, dummy otherwise
    #[default]
    Auto,
    /// Hardware only; a missing card is a fault
    Hardware,
    /// Always the dummy backend
    Dummy,
}

impl fmt::Display for BackendSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Hardware => write!(f, "hardware"),
            Self::Dummy => write!(f, "dummy"),
        }
    }
}

impl FromStr for BackendSelection {
    type Err = RorcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "hardware" => Ok(Self::Hardware),
            "dummy" => Ok(Self::Dummy),
            _ => Err(RorcError::invalid_argument(format!(
                "Unknown backend '{}' (expected auto, hardware or dummy)",
                s
            ))),
        }
    }
}

/// Register access and descriptor FIFO traffic for one channel.
pub trait ChannelBackend: fmt::Debug + Send {
    /// Which variant this is.
    fn kind(&self) -> BackendKind;

    /// Current lifecycle state.
    fn state(&self) -> BackendState;

    /// Read a channel register.
    fn read_register(&self, index: u32) -> Result<u32>;

    /// Write a channel register.
    fn write_register(&mut self, index: u32, value: u32) -> Result<()>;

    /// Hand a page to the card. `HardwareBusy` when the FIFO is full.
    fn push_page(&mut self, page: PageDescriptor) -> Result<()>;

    /// The oldest page the card has finished with, if any.
    fn pop_completed(&mut self) -> Result<Option<PageDescriptor>>;

    /// Reset the DMA engine and zero the FIFO.
    fn reset(&mut self) -> Result<()>;

    /// Quiesce the channel. Outstanding descriptors stay in the FIFO.
    fn close(&mut self) -> Result<()>;

    /// The descriptor FIFO.
    fn fifo(&self) -> &DescriptorFifo;

    /// Bus address of every page of the buffer.
    fn bus_addresses(&self) -> &[u64];
}

/// Construct the backend for a channel according to `selection`.
///
/// `sysfs_root` is where card discovery looks. `fifo` is the FIFO loaded
/// from the state store; the hardware backend re-submits its outstanding
/// descriptors after resetting the channel.
pub fn open_backend(
    selection: BackendSelection,
    sysfs_root: &Path,
    channel: &ChannelId,
    params: &ChannelParameters,
    fifo: DescriptorFifo,
    buffer: &PageBuffer,
) -> Result<Box<dyn ChannelBackend>> {
    let card = channel.card();

    let use_dummy = match selection {
        BackendSelection::Dummy => true,
        BackendSelection::Auto => card.is_dummy(),
        BackendSelection::Hardware if card.is_dummy() => {
            return Err(RorcError::invalid_argument(format!(
                "{} is the dummy card and has no hardware",
                card
            )));
        }
        BackendSelection::Hardware => false,
    };

    if !use_dummy {
        match pda::discover(sysfs_root, card)? {
            Some(pci) => {
                info!(%channel, address = %pda::PciAccess::address(&pci), "Using hardware backend");
                let backend = HardwareChannel::open(Box::new(pci), channel.clone(), params, fifo, buffer)?;
                return Ok(Box::new(backend));
            }
            None if selection == BackendSelection::Hardware => {
                return Err(RorcError::hardware_fault(format!("No readout card found for {}", card)));
            }
            None => {
                warn!(%channel, "Readout card not found, falling back to dummy backend");
            }
        }
    }

    info!(%channel, "Using dummy backend");
    let backend = DummyChannel::open(channel.clone(), params, fifo, buffer.path())?;
    Ok(Box::new(backend))
}

/// Control word for the generator and loopback settings in `params`.
pub(crate) fn control_word(params: &ChannelParameters) -> u32 {
    let mut flags = regs::Control::ENABLE;
    if params.generator.is_some() {
        flags |= regs::Control::GENERATOR;
    }
    let pattern = params.generator.as_ref().map_or(0, GeneratorPattern::code);
    flags.bits()
        | (pattern << regs::GENERATOR_PATTERN_SHIFT)
        | (params.loopback.code() << regs::LOOPBACK_SHIFT)
}

pub(crate) fn check_register(channel: &ChannelId, index: u32) -> Result<()> {
    if index >= CHANNEL_REGISTERS {
        return Err(RorcError::invalid_argument(format!(
            "Register {} outside the {}-word window of {}",
            index, CHANNEL_REGISTERS, channel
        )));
    }
    Ok(())
}

/// Check that `page` is the descriptor of its slot: offset, size and bus address.
pub(crate) fn check_descriptor(
    channel: &ChannelId,
    params: &ChannelParameters,
    bus_addresses: &[u64],
    page: &PageDescriptor,
) -> Result<()> {
    let Some(&bus_address) = bus_addresses.get(page.index as usize) else {
        return Err(RorcError::invalid_argument(format!(
            "Page {} out of range: {} has {} pages",
            page.index,
            channel,
            bus_addresses.len()
        )));
    };
    let offset = u64::from(page.index) * params.page_size as u64;
    if page.offset != offset || page.size as usize != params.page_size || page.bus_address != bus_address {
        return Err(RorcError::invalid_argument(format!(
            "Descriptor of page {} on {} does not match its slot (offset {}, size {}, bus address 0x{:x})",
            page.index, channel, page.offset, page.size, page.bus_address
        )));
    }
    Ok(())
}

/// Whether a register write pulses the channel reset bit.
pub(crate) fn is_reset_write(index: u32, value: u32) -> bool {
    index == regs::CONTROL && value & regs::Control::RESET.bits() != 0
}

pub(crate) fn ensure_active(state: BackendState, channel: &ChannelId) -> Result<()> {
    if state == BackendState::Closed {
        return Err(RorcError::invalid_argument(format!("{} is closed", channel)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CardId;
    use crate::params::LoopbackMode;

    #[test]
    fn test_control_word_encoding() {
        let plain = ChannelParameters::default();
        assert_eq!(control_word(&plain), regs::Control::ENABLE.bits());

        let params = ChannelParameters::builder()
            .generator(GeneratorPattern::Alternating)
            .loopback(LoopbackMode::Siu)
            .build()
            .unwrap();
        let word = control_word(&params);
        assert_ne!(word & regs::Control::GENERATOR.bits(), 0);
        assert_eq!((word >> regs::GENERATOR_PATTERN_SHIFT) & 0xf, 1);
        assert_eq!((word >> regs::LOOPBACK_SHIFT) & 0xf, 3);
    }

    #[test]
    fn test_selection_parsing() {
        assert_eq!("Dummy".parse::<BackendSelection>().unwrap(), BackendSelection::Dummy);
        assert!("fpga".parse::<BackendSelection>().is_err());
        assert_eq!(BackendSelection::default(), BackendSelection::Auto);
    }

    fn open(
        selection: BackendSelection,
        card: CardId,
    ) -> (tempfile::TempDir, Result<Box<dyn ChannelBackend>>) {
        let dir = tempfile::tempdir().unwrap();
        let channel = ChannelId::new(card, 0);
        let params = ChannelParameters::builder().page_count(4).build().unwrap();
        let buffer = PageBuffer::open_or_create(&dir.path().join("pages"), &params).unwrap();
        let fifo = DescriptorFifo::new(channel.clone(), 4);
        // Empty sysfs root: no card is ever discovered
        let backend = open_backend(selection, dir.path(), &channel, &params, fifo, &buffer);
        (dir, backend)
    }

    #[test]
    fn test_auto_falls_back_to_dummy() {
        let (_dir, backend) = open(BackendSelection::Auto, CardId::new(12345));
        assert_eq!(backend.unwrap().kind(), BackendKind::Dummy);

        let (_dir, backend) = open(BackendSelection::Auto, CardId::dummy());
        assert_eq!(backend.unwrap().kind(), BackendKind::Dummy);
    }

    #[test]
    fn test_forced_hardware_without_card() {
        let (_dir, backend) = open(BackendSelection::Hardware, CardId::new(12345));
        assert_eq!(backend.unwrap_err().kind(), crate::error::ErrorKind::HardwareFault);

        let (_dir, backend) = open(BackendSelection::Hardware, CardId::dummy());
        assert_eq!(backend.unwrap_err().kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_descriptor_checked_against_slot() {
        let channel = ChannelId::new(CardId::new(12345), 0);
        let params = ChannelParameters::builder().page_size(8192).page_count(4).build().unwrap();
        let table = [0x1000, 0x9000, 0x11000, 0x19000];
        let page = PageDescriptor {
            index: 1,
            offset: 8192,
            size: 8192,
            bus_address: 0x9000,
        };
        check_descriptor(&channel, &params, &table, &page).unwrap();

        for bad in [
            PageDescriptor { offset: 1 << 40, ..page },
            PageDescriptor { size: 4096, ..page },
            PageDescriptor { bus_address: 999, ..page },
            PageDescriptor { index: 4, ..page },
        ] {
            let err = check_descriptor(&channel, &params, &table, &bad).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
        }
    }

    #[test]
    fn test_reset_write_detection() {
        assert!(is_reset_write(regs::CONTROL, regs::Control::RESET.bits() | regs::Control::ENABLE.bits()));
        assert!(!is_reset_write(regs::CONTROL, regs::Control::ENABLE.bits()));
        assert!(!is_reset_write(regs::PAGE_SIZE, regs::Control::RESET.bits()));
    }
}
