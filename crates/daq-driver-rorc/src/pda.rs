//! PCI device access for readout cards.
//!
//! The hardware backend talks to the card through [`PciAccess`]: word-indexed
//! BAR0 register access plus translation of the DMA page buffer into bus
//! addresses. [`SysfsPci`] implements it on Linux by mapping
//! `/sys/bus/pci/devices/<address>/resource0` and resolving bus addresses
//! through `/proc/self/pagemap`.
//!
//! # Discovery
//!
//! [`discover`] walks `<sysfs_root>/bus/pci/devices`, keeps devices whose
//! vendor/device IDs name a known readout card, and matches them against a
//! [`CardId`]: by PCI address when the card identity carries one, otherwise
//! by the serial number register.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::ptr;

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, info, warn};

use crate::buffer::PageBuffer;
use crate::error::{Result, RorcError};
use crate::identity::{CardId, PciAddress};

/// Host page size used for bus address translation.
const HOST_PAGE_SIZE: usize = 4096;

/// Known readout card PCI IDs: (vendor, device, name).
pub const KNOWN_CARDS: &[(u16, u16, &str)] = &[(0x10dc, 0x0033, "C-RORC"), (0x1172, 0xe001, "CRU")];

/// Register map of the card's BAR0, in 32-bit word indices.
pub mod regs {
    use bitflags::bitflags;

    /// Card serial number
    pub const SERIAL_NUMBER: u32 = 0;
    /// Firmware version
    pub const FIRMWARE_VERSION: u32 = 1;

    /// First word of channel 0's register block
    pub const CHANNEL_BASE: u32 = 0x100;
    /// Words between consecutive channel blocks
    pub const CHANNEL_STRIDE: u32 = 0x40;

    /// Channel control word (see [`Control`])
    pub const CONTROL: u32 = 0x0;
    /// Channel status word
    pub const STATUS: u32 = 0x1;
    /// DMA page size in bytes
    pub const PAGE_SIZE: u32 = 0x2;
    /// Low half of the pending descriptor's bus address
    pub const DESC_ADDR_LO: u32 = 0x3;
    /// High half of the pending descriptor's bus address
    pub const DESC_ADDR_HI: u32 = 0x4;
    /// Pending descriptor length in bytes
    pub const DESC_LENGTH: u32 = 0x5;
    /// Writing a slot index here queues the pending descriptor
    pub const DESC_PUSH: u32 = 0x6;
    /// Descriptors completed since the last reset (read only)
    pub const COMPLETED_COUNT: u32 = 0x7;
    /// Word written by the generator in constant mode
    pub const GENERATOR_CONSTANT: u32 = 0x8;

    /// Generator pattern field in the control word
    pub const GENERATOR_PATTERN_SHIFT: u32 = 4;
    /// Loopback mode field in the control word
    pub const LOOPBACK_SHIFT: u32 = 8;

    /// Set in the status word when the channel's DMA engine faulted
    pub const STATUS_ERROR: u32 = 1 << 31;

    bitflags! {
        /// Single-bit flags of the channel control word.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct Control: u32 {
            /// Reset the DMA engine and its completion counter
            const RESET = 1 << 0;
            /// Accept descriptors
            const ENABLE = 1 << 1;
            /// Feed the DMA engine from the internal data generator
            const GENERATOR = 1 << 2;
        }
    }

    /// Absolute word index of a channel register.
    pub fn channel_register(channel: u32, offset: u32) -> u32 {
        CHANNEL_BASE + channel * CHANNEL_STRIDE + offset
    }
}

/// Register and DMA access to one PCI readout card.
pub trait PciAccess: fmt::Debug + Send {
    /// PCI address of the card.
    fn address(&self) -> PciAddress;

    /// Read a 32-bit BAR0 word.
    fn read_register(&self, index: u32) -> Result<u32>;

    /// Write a 32-bit BAR0 word.
    fn write_register(&mut self, index: u32, value: u32) -> Result<()>;

    /// Pin the page buffer and return the bus address of every page.
    fn map_dma_buffer(&mut self, buffer: &PageBuffer) -> Result<Vec<u64>>;
}

/// [`PciAccess`] over sysfs resource files.
pub struct SysfsPci {
    address: PciAddress,
    resource: PathBuf,
    bar: MmapRaw,
}

impl SysfsPci {
    /// Map BAR0 of the device at `address`.
    pub fn open(sysfs_root: &Path, address: PciAddress) -> Result<Self> {
        let resource = device_dir(sysfs_root, &address).join("resource0");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&resource)
            .map_err(|e| map_fault(&resource, e))?;

        let len = file.metadata().map_err(|e| map_fault(&resource, e))?.len() as usize;
        if len < 4 {
            return Err(RorcError::hardware_fault(format!(
                "BAR0 of {} is only {} bytes",
                address, len
            )));
        }

        let bar = MmapOptions::new()
            .len(len)
            .map_raw(&file)
            .map_err(|e| map_fault(&resource, e))?;

        debug!(%address, size = len, "Mapped BAR0");

        Ok(Self {
            address,
            resource,
            bar,
        })
    }

    /// Serial number reported by the card.
    pub fn serial(&self) -> Result<i32> {
        self.read_register(regs::SERIAL_NUMBER).map(|v| v as i32)
    }

    /// Firmware version reported by the card.
    pub fn firmware_version(&self) -> Result<u32> {
        self.read_register(regs::FIRMWARE_VERSION)
    }

    fn word_ptr(&self, index: u32) -> Result<*mut u32> {
        let offset = index as usize * 4;
        if offset + 4 > self.bar.len() {
            return Err(RorcError::invalid_argument(format!(
                "Register {} outside BAR0 of {} ({} bytes)",
                index,
                self.address,
                self.bar.len()
            )));
        }
        // SAFETY: offset + 4 is within the mapping checked above.
        Ok(unsafe { self.bar.as_mut_ptr().add(offset) }.cast::<u32>())
    }
}

impl PciAccess for SysfsPci {
    fn address(&self) -> PciAddress {
        self.address
    }

    fn read_register(&self, index: u32) -> Result<u32> {
        let word = self.word_ptr(index)?;
        // SAFETY: word_ptr returns an in-bounds, 4-byte aligned pointer into
        // the live mapping; MMIO requires a volatile access.
        Ok(unsafe { ptr::read_volatile(word) })
    }

    fn write_register(&mut self, index: u32, value: u32) -> Result<()> {
        let word = self.word_ptr(index)?;
        // SAFETY: as in read_register.
        unsafe { ptr::write_volatile(word, value) };
        Ok(())
    }

    fn map_dma_buffer(&mut self, buffer: &PageBuffer) -> Result<Vec<u64>> {
        // SAFETY: the range is the buffer's own live mapping. The lock is
        // released by the kernel when the mapping goes away.
        let rc = unsafe { libc::mlock(buffer.as_ptr().cast(), buffer.len()) };
        if rc != 0 {
            return Err(RorcError::hardware_fault(format!(
                "Cannot pin DMA buffer {}: {}",
                buffer.path().display(),
                io::Error::last_os_error()
            )));
        }

        let pagemap = File::open("/proc/self/pagemap")
            .map_err(|e| map_fault(Path::new("/proc/self/pagemap"), e))?;

        let base = buffer.as_ptr() as usize;
        let mut addresses = Vec::with_capacity(buffer.page_count() as usize);
        for page in 0..buffer.page_count() as usize {
            let start = base + page * buffer.page_size();
            let first = bus_address(&pagemap, start)?;

            // The card needs every DMA page physically contiguous
            for sub in (HOST_PAGE_SIZE..buffer.page_size()).step_by(HOST_PAGE_SIZE) {
                let expected = first + sub as u64;
                if bus_address(&pagemap, start + sub)? != expected {
                    return Err(RorcError::hardware_fault(format!(
                        "DMA page {} of {} is not physically contiguous; use a hugepage-backed root_dir",
                        page,
                        buffer.path().display()
                    )));
                }
            }
            addresses.push(first);
        }

        info!(address = %self.address, pages = addresses.len(), "Mapped DMA buffer");
        Ok(addresses)
    }
}

impl fmt::Debug for SysfsPci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysfsPci")
            .field("address", &self.address)
            .field("resource", &self.resource)
            .field("size", &self.bar.len())
            .finish()
    }
}

/// Find the readout card matching `card` under `sysfs_root`.
///
/// Returns `Ok(None)` when no matching card is present (including when the
/// PCI device directory does not exist at all).
pub fn discover(sysfs_root: &Path, card: &CardId) -> Result<Option<SysfsPci>> {
    let devices = sysfs_root.join("bus").join("pci").join("devices");
    let entries = match fs::read_dir(&devices) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %devices.display(), "No PCI device directory");
            return Ok(None);
        }
        Err(e) => return Err(RorcError::filesystem(&devices, e)),
    };

    let mut candidates: Vec<(PciAddress, &str)> = entries
        .flatten()
        .filter_map(|entry| {
            let address = entry.file_name().to_str()?.parse::<PciAddress>().ok()?;
            let name = card_model(&entry.path())?;
            Some((address, name))
        })
        .collect();
    candidates.sort_by_key(|(address, _)| *address);

    for (address, name) in candidates {
        if let Some(wanted) = card.pci_address() {
            if wanted == address {
                info!(%address, model = name, "Found readout card by PCI address");
                return SysfsPci::open(sysfs_root, address).map(Some);
            }
            continue;
        }

        let pci = match SysfsPci::open(sysfs_root, address) {
            Ok(pci) => pci,
            Err(e) => {
                warn!(%address, "Skipping readout card: {}", e);
                continue;
            }
        };
        let serial = pci.serial()?;
        debug!(%address, model = name, serial, "Probed readout card");
        if serial == card.serial() {
            info!(%address, model = name, serial, "Found readout card");
            return Ok(Some(pci));
        }
    }

    Ok(None)
}

fn device_dir(sysfs_root: &Path, address: &PciAddress) -> PathBuf {
    sysfs_root
        .join("bus")
        .join("pci")
        .join("devices")
        .join(address.to_string())
}

/// Model name if the device's vendor/device IDs name a known card.
fn card_model(dir: &Path) -> Option<&'static str> {
    let vendor = read_hex_id(&dir.join("vendor"))?;
    let device = read_hex_id(&dir.join("device"))?;
    KNOWN_CARDS
        .iter()
        .find(|(v, d, _)| *v == vendor && *d == device)
        .map(|(_, _, name)| *name)
}

fn read_hex_id(path: &Path) -> Option<u16> {
    let text = fs::read_to_string(path).ok()?;
    let text = text.trim();
    u16::from_str_radix(text.strip_prefix("0x").unwrap_or(text), 16).ok()
}

/// Physical address of a virtual address, from `/proc/self/pagemap`.
fn bus_address(pagemap: &File, vaddr: usize) -> Result<u64> {
    const PRESENT: u64 = 1 << 63;
    const PFN_MASK: u64 = (1 << 55) - 1;

    let mut entry = [0u8; 8];
    let offset = (vaddr / HOST_PAGE_SIZE * 8) as u64;
    pagemap
        .read_exact_at(&mut entry, offset)
        .map_err(|e| map_fault(Path::new("/proc/self/pagemap"), e))?;
    let entry = u64::from_ne_bytes(entry);

    let pfn = entry & PFN_MASK;
    if entry & PRESENT == 0 || pfn == 0 {
        return Err(RorcError::hardware_fault(
            "Page frame numbers unavailable from /proc/self/pagemap (requires CAP_SYS_ADMIN)",
        ));
    }
    Ok(pfn * HOST_PAGE_SIZE as u64 + (vaddr % HOST_PAGE_SIZE) as u64)
}

fn map_fault(path: &Path, err: io::Error) -> RorcError {
    RorcError::hardware_fault(format!("{}: {}", path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    /// Build `<root>/bus/pci/devices/<address>` with a BAR0 file holding `serial`.
    fn fake_card(root: &Path, address: &str, vendor: &str, device: &str, serial: i32) {
        let dir = root.join("bus/pci/devices").join(address);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("{}\n", device)).unwrap();
        let mut bar = vec![0u8; 4096];
        bar[..4].copy_from_slice(&serial.to_ne_bytes());
        fs::write(dir.join("resource0"), bar).unwrap();
    }

    #[test]
    fn test_discover_by_serial() {
        let root = tempfile::tempdir().unwrap();
        fake_card(root.path(), "0000:03:00.0", "0x10dc", "0x0033", 111);
        fake_card(root.path(), "0000:04:00.0", "0x10dc", "0x0033", 12345);

        let pci = discover(root.path(), &CardId::new(12345)).unwrap().unwrap();
        assert_eq!(pci.address().to_string(), "0000:04:00.0");
        assert_eq!(pci.serial().unwrap(), 12345);
    }

    #[test]
    fn test_discover_by_pci_address() {
        let root = tempfile::tempdir().unwrap();
        fake_card(root.path(), "0000:03:00.0", "0x1172", "0xe001", 7);

        let card = CardId::new(999).with_pci_address("0000:03:00.0".parse().unwrap());
        let pci = discover(root.path(), &card).unwrap().unwrap();
        assert_eq!(pci.serial().unwrap(), 7);
    }

    #[test]
    fn test_discover_ignores_unknown_devices() {
        let root = tempfile::tempdir().unwrap();
        fake_card(root.path(), "0000:05:00.0", "0x8086", "0x1234", 12345);

        assert!(discover(root.path(), &CardId::new(12345)).unwrap().is_none());
    }

    #[test]
    fn test_discover_without_sysfs() {
        let root = tempfile::tempdir().unwrap();
        assert!(discover(root.path(), &CardId::new(1)).unwrap().is_none());
    }

    #[test]
    fn test_register_access() {
        let root = tempfile::tempdir().unwrap();
        fake_card(root.path(), "0000:03:00.0", "0x10dc", "0x0033", 42);

        let address = "0000:03:00.0".parse().unwrap();
        let mut pci = SysfsPci::open(root.path(), address).unwrap();
        let control = regs::channel_register(2, regs::CONTROL);
        pci.write_register(control, 0xabcd).unwrap();
        assert_eq!(pci.read_register(control).unwrap(), 0xabcd);

        let err = pci.read_register(1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_open_missing_device_is_fault() {
        let root = tempfile::tempdir().unwrap();
        let err = SysfsPci::open(root.path(), "0000:09:00.0".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HardwareFault);
    }
}
