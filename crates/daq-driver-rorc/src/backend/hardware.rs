//! Channel backend for a real readout card.

use tracing::{debug, info, warn};

use super::{
    check_descriptor, check_register, control_word, ensure_active, is_reset_write, BackendKind,
    BackendState, ChannelBackend,
};
use crate::buffer::PageBuffer;
use crate::error::{Result, RorcError};
use crate::fifo::{DescriptorFifo, PageDescriptor};
use crate::identity::ChannelId;
use crate::params::{ChannelParameters, GeneratorPattern};
use crate::pda::{regs, PciAccess};

/// Channel backend driving the card's DMA engine through [`PciAccess`].
///
/// Completion is tracked with the card's completed-descriptor counter: every
/// increment past the number of pages already popped completes the oldest
/// outstanding descriptor.
#[derive(Debug)]
pub struct HardwareChannel {
    pci: Box<dyn PciAccess>,
    channel: ChannelId,
    params: ChannelParameters,
    fifo: DescriptorFifo,
    bus_addresses: Vec<u64>,
    /// Completions popped since the last engine reset
    acknowledged: u32,
    state: BackendState,
}

impl HardwareChannel {
    /// Map the page buffer, configure and reset the channel, then re-submit
    /// any outstanding descriptors carried by `fifo`.
    pub fn open(
        mut pci: Box<dyn PciAccess>,
        channel: ChannelId,
        params: &ChannelParameters,
        mut fifo: DescriptorFifo,
        buffer: &PageBuffer,
    ) -> Result<Self> {
        let bus_addresses = pci.map_dma_buffer(buffer)?;
        if bus_addresses.len() != params.page_count as usize {
            return Err(RorcError::hardware_fault(format!(
                "Access layer mapped {} pages, expected {}",
                bus_addresses.len(),
                params.page_count
            )));
        }
        fifo.rebind(&bus_addresses);

        let mut hw = Self {
            pci,
            channel,
            params: params.clone(),
            fifo,
            bus_addresses,
            acknowledged: 0,
            state: BackendState::Open,
        };

        hw.reset_engine()?;

        let outstanding: Vec<PageDescriptor> = hw.fifo.outstanding().copied().collect();
        for page in &outstanding {
            hw.submit(page)?;
        }
        if !outstanding.is_empty() {
            hw.state = BackendState::Streaming;
        }

        info!(
            channel = %hw.channel,
            address = %hw.pci.address(),
            resubmitted = outstanding.len(),
            "Opened hardware channel"
        );
        Ok(hw)
    }

    fn register(&self, offset: u32) -> u32 {
        regs::channel_register(self.channel.channel(), offset)
    }

    fn write(&mut self, offset: u32, value: u32) -> Result<()> {
        let index = self.register(offset);
        self.pci.write_register(index, value)
    }

    fn read(&self, offset: u32) -> Result<u32> {
        self.pci.read_register(self.register(offset))
    }

    fn check_status(&self, operation: &str) -> Result<()> {
        let status = self.read(regs::STATUS)?;
        if status & regs::STATUS_ERROR != 0 {
            return Err(RorcError::hardware_fault(format!(
                "{} on {} failed: status 0x{:08x}",
                operation, self.channel, status
            )));
        }
        Ok(())
    }

    /// Pulse the reset bit, then program page size and control bits.
    fn reset_engine(&mut self) -> Result<()> {
        let control = control_word(&self.params);
        self.write(regs::CONTROL, control | regs::Control::RESET.bits())?;
        self.check_status("reset")?;

        self.write(regs::PAGE_SIZE, self.params.page_size as u32)?;
        if let Some(GeneratorPattern::Constant(value)) = self.params.generator {
            self.write(regs::GENERATOR_CONSTANT, value)?;
        }
        self.write(regs::CONTROL, control)?;
        self.acknowledged = 0;
        Ok(())
    }

    fn submit(&mut self, page: &PageDescriptor) -> Result<()> {
        let bus_address = self.bus_addresses[page.index as usize];
        self.write(regs::DESC_ADDR_LO, bus_address as u32)?;
        self.write(regs::DESC_ADDR_HI, (bus_address >> 32) as u32)?;
        self.write(regs::DESC_LENGTH, page.size)?;
        self.write(regs::DESC_PUSH, page.index)
    }
}

impl ChannelBackend for HardwareChannel {
    fn kind(&self) -> BackendKind {
        BackendKind::Hardware
    }

    fn state(&self) -> BackendState {
        self.state
    }

    fn read_register(&self, index: u32) -> Result<u32> {
        ensure_active(self.state, &self.channel)?;
        check_register(&self.channel, index)?;
        self.read(index)
    }

    fn write_register(&mut self, index: u32, value: u32) -> Result<()> {
        ensure_active(self.state, &self.channel)?;
        check_register(&self.channel, index)?;
        if is_reset_write(index, value) {
            return self.reset();
        }
        self.write(index, value)
    }

    fn push_page(&mut self, page: PageDescriptor) -> Result<()> {
        ensure_active(self.state, &self.channel)?;
        check_descriptor(&self.channel, &self.params, &self.bus_addresses, &page)?;
        self.fifo.check_push(&page)?;
        self.submit(&page)?;
        self.fifo.push(page)?;
        self.state = BackendState::Streaming;
        Ok(())
    }

    fn pop_completed(&mut self) -> Result<Option<PageDescriptor>> {
        ensure_active(self.state, &self.channel)?;

        let completed = self.read(regs::COMPLETED_COUNT)?;
        let pending = completed.wrapping_sub(self.acknowledged);
        if pending == 0 {
            return Ok(None);
        }
        if u64::from(pending) > self.fifo.cursors().filled() {
            self.check_status("DMA")?;
            return Err(RorcError::hardware_fault(format!(
                "{} reports {} completions with {} descriptors outstanding",
                self.channel,
                pending,
                self.fifo.cursors().filled()
            )));
        }

        let page = self.fifo.pop();
        self.acknowledged = self.acknowledged.wrapping_add(1);
        Ok(page)
    }

    fn reset(&mut self) -> Result<()> {
        self.fifo.reset();
        self.reset_engine()?;
        self.state = BackendState::Open;
        debug!(channel = %self.channel, "Reset hardware channel");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == BackendState::Closed {
            return Ok(());
        }
        self.state = BackendState::Closed;
        if let Err(e) = self.write(regs::CONTROL, 0) {
            warn!(channel = %self.channel, "Failed to disable DMA engine: {}", e);
            return Err(e);
        }
        debug!(channel = %self.channel, outstanding = self.fifo.cursors().filled(), "Closed hardware channel");
        Ok(())
    }

    fn fifo(&self) -> &DescriptorFifo {
        &self.fifo
    }

    fn bus_addresses(&self) -> &[u64] {
        &self.bus_addresses
    }
}
