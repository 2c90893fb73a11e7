//! Card and channel identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RorcError};

/// Serial number reserved for the dummy card.
///
/// Automatic backend selection always serves this serial with the dummy
/// backend, whether or not a physical card is installed.
pub const DUMMY_SERIAL_NUMBER: i32 = -1;

/// Number of DMA channels exposed by a C-RORC.
pub const MAX_CHANNELS: u32 = 6;

/// PCI address in `domain:bus:device.function` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// Create a PCI address in domain 0.
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            domain: 0,
            bus,
            device,
            function,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = RorcError;

    /// Accepts `0000:42:00.0` and the short form `42:00.0`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || RorcError::invalid_argument(format!("Invalid PCI address: '{}'", s));

        let (head, function) = s.rsplit_once('.').ok_or_else(invalid)?;
        let parts: Vec<&str> = head.split(':').collect();
        let (domain, bus, device) = match parts.as_slice() {
            [bus, device] => ("0", *bus, *device),
            [domain, bus, device] => (*domain, *bus, *device),
            _ => return Err(invalid()),
        };

        let address = Self {
            domain: u16::from_str_radix(domain, 16).map_err(|_| invalid())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| invalid())?,
            device: u8::from_str_radix(device, 16).map_err(|_| invalid())?,
            function: u8::from_str_radix(function, 16).map_err(|_| invalid())?,
        };

        if address.device > 0x1f || address.function > 7 {
            return Err(invalid());
        }
        Ok(address)
    }
}

/// Identity of a physical (or dummy) card.
///
/// The vendor-assigned serial number is the primary key. The PCI address is
/// an optional fallback used by discovery when the serial cannot be read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CardId {
    serial: i32,
    pci_address: Option<PciAddress>,
}

impl CardId {
    /// Identify a card by serial number.
    pub fn new(serial: i32) -> Self {
        Self {
            serial,
            pci_address: None,
        }
    }

    /// The dummy card.
    pub fn dummy() -> Self {
        Self::new(DUMMY_SERIAL_NUMBER)
    }

    /// Attach a PCI address as fallback identity.
    pub fn with_pci_address(mut self, address: PciAddress) -> Self {
        self.pci_address = Some(address);
        self
    }

    /// Vendor-assigned serial number.
    pub fn serial(&self) -> i32 {
        self.serial
    }

    /// Fallback PCI address, if known.
    pub fn pci_address(&self) -> Option<PciAddress> {
        self.pci_address
    }

    /// Whether this is the reserved dummy card.
    pub fn is_dummy(&self) -> bool {
        self.serial == DUMMY_SERIAL_NUMBER
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pci_address {
            Some(address) => write!(f, "serial {} ({})", self.serial, address),
            None => write!(f, "serial {}", self.serial),
        }
    }
}

/// A card plus channel number: the key for the lock and every persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId {
    card: CardId,
    channel: u32,
}

impl ChannelId {
    /// Create a channel identity. The channel number is range-checked by
    /// [`ChannelId::validate`], which path resolution calls.
    pub fn new(card: CardId, channel: u32) -> Self {
        Self { card, channel }
    }

    /// The card this channel belongs to.
    pub fn card(&self) -> &CardId {
        &self.card
    }

    /// Vendor serial of the card.
    pub fn serial(&self) -> i32 {
        self.card.serial
    }

    /// Channel number on the card.
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Reject channel numbers beyond what the card exposes.
    pub fn validate(&self) -> Result<()> {
        if self.channel >= MAX_CHANNELS {
            return Err(RorcError::invalid_argument(format!(
                "Invalid channel {}: card has {} channels",
                self.channel, MAX_CHANNELS
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} channel {}", self.card, self.channel)
    }
}
