//! Descriptor FIFO shared by every channel backend.
//!
//! The FIFO tracks which DMA pages are owned by the card. Cursors are
//! free-running counters; the ring position of a cursor is
//! `cursor % capacity` and the number of outstanding descriptors is
//! `write - read`, which always stays within `0..=capacity`.
//!
//! Each page slot has a fill state. A slot is `Filled` exactly while its
//! descriptor sits in the arc between the read and write cursors, so a slot
//! can never be both free and referenced by an outstanding descriptor.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RorcError};
use crate::identity::ChannelId;

/// One DMA page handed to or returned from the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDescriptor {
    /// Slot index in the page buffer
    pub index: u32,
    /// Byte offset of the page in the buffer
    pub offset: u64,
    /// Page size in bytes
    pub size: u32,
    /// Address the card uses for DMA (opaque, owned by the access library)
    pub bus_address: u64,
}

/// Fill state of a page slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Never pushed since the last reset
    #[default]
    Free,
    /// Pushed to the card and not yet popped
    Filled,
    /// Popped; software owns the data until it pushes the slot again
    Consumed,
}

/// FIFO cursor snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FifoCursors {
    /// Number of descriptors ever pushed
    pub write: u64,
    /// Number of descriptors ever popped
    pub read: u64,
    /// Maximum number of outstanding descriptors
    pub capacity: u32,
}

impl FifoCursors {
    /// Zeroed cursors.
    pub fn new(capacity: u32) -> Self {
        Self {
            write: 0,
            read: 0,
            capacity,
        }
    }

    /// Outstanding descriptors.
    pub fn filled(&self) -> u64 {
        self.write - self.read
    }

    /// True when no descriptor is outstanding.
    pub fn is_empty(&self) -> bool {
        self.filled() == 0
    }

    /// True when a push would overrun the FIFO.
    pub fn is_full(&self) -> bool {
        self.filled() >= u64::from(self.capacity)
    }

    /// Ring position of a cursor.
    pub fn position(&self, cursor: u64) -> usize {
        (cursor % u64::from(self.capacity)) as usize
    }

    fn is_valid(&self) -> bool {
        self.capacity > 0 && self.read <= self.write && self.filled() <= u64::from(self.capacity)
    }
}

/// Ring of outstanding page descriptors plus per-slot fill states.
#[derive(Debug, Clone)]
pub struct DescriptorFifo {
    channel: ChannelId,
    cursors: FifoCursors,
    ring: Vec<Option<PageDescriptor>>,
    slots: Vec<SlotState>,
}

impl DescriptorFifo {
    /// An empty FIFO with all slots free. Capacity equals the page count.
    pub fn new(channel: ChannelId, capacity: u32) -> Self {
        Self {
            channel,
            cursors: FifoCursors::new(capacity),
            ring: vec![None; capacity as usize],
            slots: vec![SlotState::Free; capacity as usize],
        }
    }

    /// Rebuild a FIFO from persisted parts.
    ///
    /// Returns `None` unless the parts form a valid FIFO: consistent sizes,
    /// descriptors present exactly in the outstanding arc, and the `Filled`
    /// slots being exactly the slots referenced by that arc.
    pub fn restore(
        channel: ChannelId,
        cursors: FifoCursors,
        ring: Vec<Option<PageDescriptor>>,
        slots: Vec<SlotState>,
    ) -> Option<Self> {
        let capacity = cursors.capacity as usize;
        if !cursors.is_valid() || ring.len() != capacity || slots.len() != capacity {
            return None;
        }

        let mut referenced = vec![false; capacity];
        for cursor in cursors.read..cursors.write {
            let page = ring[cursors.position(cursor)]?;
            let index = page.index as usize;
            if index >= capacity || referenced[index] {
                return None;
            }
            referenced[index] = true;
        }

        let outside_arc_empty = (0..capacity as u64)
            .map(|i| cursors.write + i)
            .take(capacity - cursors.filled() as usize)
            .all(|cursor| ring[cursors.position(cursor)].is_none());
        let slots_match = slots
            .iter()
            .zip(&referenced)
            .all(|(state, &outstanding)| (*state == SlotState::Filled) == outstanding);

        if !outside_arc_empty || !slots_match {
            return None;
        }

        Some(Self {
            channel,
            cursors,
            ring,
            slots,
        })
    }

    /// Check that `page` could be queued, without queuing it.
    ///
    /// `HardwareBusy` when full, `InvalidArgument` for an unknown or already
    /// queued slot. A page accepted here is accepted by [`push`](Self::push)
    /// as long as the FIFO is not modified in between.
    pub fn check_push(&self, page: &PageDescriptor) -> Result<()> {
        if self.cursors.is_full() {
            return Err(RorcError::HardwareBusy {
                channel: self.channel.clone(),
                capacity: self.cursors.capacity,
            });
        }

        let slot = self.slots.get(page.index as usize).copied().ok_or_else(|| {
            RorcError::invalid_argument(format!(
                "Page {} out of range: buffer has {} pages",
                page.index,
                self.slots.len()
            ))
        })?;
        if slot == SlotState::Filled {
            return Err(RorcError::invalid_argument(format!(
                "Page {} is already queued to the card",
                page.index
            )));
        }
        Ok(())
    }

    /// Queue a page. On error the FIFO is unchanged.
    pub fn push(&mut self, page: PageDescriptor) -> Result<()> {
        self.check_push(&page)?;

        let position = self.cursors.position(self.cursors.write);
        self.ring[position] = Some(page);
        self.slots[page.index as usize] = SlotState::Filled;
        self.cursors.write += 1;

        debug!(channel = %self.channel, page = page.index, write = self.cursors.write, "Pushed descriptor");
        Ok(())
    }

    /// Point outstanding descriptors at the current bus address table.
    ///
    /// Bus addresses change when the buffer is mapped again, so descriptors
    /// restored from disk carry stale ones.
    pub fn rebind(&mut self, bus_addresses: &[u64]) {
        for page in self.ring.iter_mut().flatten() {
            if let Some(&address) = bus_addresses.get(page.index as usize) {
                page.bus_address = address;
            }
        }
    }

    /// The oldest outstanding descriptor.
    pub fn oldest(&self) -> Option<&PageDescriptor> {
        if self.cursors.is_empty() {
            return None;
        }
        self.ring[self.cursors.position(self.cursors.read)].as_ref()
    }

    /// Remove the oldest outstanding descriptor and mark its slot consumed.
    pub fn pop(&mut self) -> Option<PageDescriptor> {
        if self.cursors.is_empty() {
            return None;
        }

        let position = self.cursors.position(self.cursors.read);
        let page = self.ring[position].take()?;
        self.slots[page.index as usize] = SlotState::Consumed;
        self.cursors.read += 1;

        debug!(channel = %self.channel, page = page.index, read = self.cursors.read, "Popped descriptor");
        Some(page)
    }

    /// Outstanding descriptors, oldest first.
    pub fn outstanding(&self) -> impl Iterator<Item = &PageDescriptor> + '_ {
        (self.cursors.read..self.cursors.write)
            .filter_map(move |cursor| self.ring[self.cursors.position(cursor)].as_ref())
    }

    /// Zero the cursors and free every slot.
    pub fn reset(&mut self) {
        let capacity = self.cursors.capacity;
        self.cursors = FifoCursors::new(capacity);
        self.ring.iter_mut().for_each(|entry| *entry = None);
        self.slots.iter_mut().for_each(|slot| *slot = SlotState::Free);
    }

    /// Cursor snapshot.
    pub fn cursors(&self) -> FifoCursors {
        self.cursors
    }

    /// Ring entries indexed by ring position.
    pub fn ring(&self) -> &[Option<PageDescriptor>] {
        &self.ring
    }

    /// Fill state of every page slot.
    pub fn slots(&self) -> &[SlotState] {
        &self.slots
    }

    /// The channel this FIFO belongs to.
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }
}
