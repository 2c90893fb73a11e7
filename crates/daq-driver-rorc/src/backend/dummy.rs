//! In-memory channel emulation.

use std::path::Path;

use tracing::{debug, info};

use super::{
    check_descriptor, check_register, control_word, ensure_active, is_reset_write, BackendKind,
    BackendState, ChannelBackend, CHANNEL_REGISTERS,
};
use crate::buffer::PageBuffer;
use crate::error::Result;
use crate::fifo::{DescriptorFifo, PageDescriptor};
use crate::identity::ChannelId;
use crate::params::ChannelParameters;
use crate::pda::regs;

/// Channel backend that completes every pushed page immediately.
///
/// The register window is a plain array. When the generator is enabled, a
/// pushed page is filled with the pattern through a separate mapping of the
/// page buffer file, so the caller's mapping sees the data.
#[derive(Debug)]
pub struct DummyChannel {
    channel: ChannelId,
    params: ChannelParameters,
    registers: [u32; CHANNEL_REGISTERS as usize],
    pages: PageBuffer,
    fifo: DescriptorFifo,
    bus_addresses: Vec<u64>,
    state: BackendState,
}

impl DummyChannel {
    /// Open the emulated channel over the page buffer file at `pages`.
    pub fn open(
        channel: ChannelId,
        params: &ChannelParameters,
        mut fifo: DescriptorFifo,
        pages: &Path,
    ) -> Result<Self> {
        let pages = PageBuffer::open_or_create(pages, params)?;
        let bus_addresses: Vec<u64> = (0..params.page_count)
            .map(|i| u64::from(i) * params.page_size as u64)
            .collect();
        fifo.rebind(&bus_addresses);

        let mut dummy = Self {
            channel,
            params: params.clone(),
            registers: [0; CHANNEL_REGISTERS as usize],
            pages,
            fifo,
            bus_addresses,
            state: BackendState::Open,
        };
        dummy.load_defaults();

        info!(channel = %dummy.channel, outstanding = dummy.fifo.cursors().filled(), "Opened dummy channel");
        Ok(dummy)
    }

    fn load_defaults(&mut self) {
        self.registers = [0; CHANNEL_REGISTERS as usize];
        self.registers[regs::CONTROL as usize] = control_word(&self.params);
        self.registers[regs::PAGE_SIZE as usize] = self.params.page_size as u32;
        if let Some(crate::params::GeneratorPattern::Constant(value)) = self.params.generator {
            self.registers[regs::GENERATOR_CONSTANT as usize] = value;
        }
    }

    fn generate(&mut self, page: &PageDescriptor) -> Result<()> {
        let Some(pattern) = self.params.generator else {
            return Ok(());
        };
        let data = self.pages.data_mut(page)?;
        for (i, word) in data.chunks_exact_mut(4).enumerate() {
            word.copy_from_slice(&pattern.word(i).to_le_bytes());
        }
        Ok(())
    }
}

impl ChannelBackend for DummyChannel {
    fn kind(&self) -> BackendKind {
        BackendKind::Dummy
    }

    fn state(&self) -> BackendState {
        self.state
    }

    fn read_register(&self, index: u32) -> Result<u32> {
        ensure_active(self.state, &self.channel)?;
        check_register(&self.channel, index)?;
        Ok(self.registers[index as usize])
    }

    fn write_register(&mut self, index: u32, value: u32) -> Result<()> {
        ensure_active(self.state, &self.channel)?;
        check_register(&self.channel, index)?;
        if is_reset_write(index, value) {
            return self.reset();
        }
        self.registers[index as usize] = value;
        Ok(())
    }

    fn push_page(&mut self, page: PageDescriptor) -> Result<()> {
        ensure_active(self.state, &self.channel)?;
        check_descriptor(&self.channel, &self.params, &self.bus_addresses, &page)?;
        self.fifo.check_push(&page)?;
        // Fill before queuing so a failure leaves the FIFO untouched
        self.generate(&page)?;
        self.fifo.push(page)?;

        let completed = &mut self.registers[regs::COMPLETED_COUNT as usize];
        *completed = completed.wrapping_add(1);
        self.state = BackendState::Streaming;
        Ok(())
    }

    fn pop_completed(&mut self) -> Result<Option<PageDescriptor>> {
        ensure_active(self.state, &self.channel)?;
        Ok(self.fifo.pop())
    }

    fn reset(&mut self) -> Result<()> {
        self.fifo.reset();
        self.load_defaults();
        self.state = BackendState::Open;
        debug!(channel = %self.channel, "Reset dummy channel");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == BackendState::Closed {
            return Ok(());
        }
        self.pages.flush()?;
        self.state = BackendState::Closed;
        debug!(channel = %self.channel, "Closed dummy channel");
        Ok(())
    }

    fn fifo(&self) -> &DescriptorFifo {
        &self.fifo
    }

    fn bus_addresses(&self) -> &[u64] {
        &self.bus_addresses
    }
}
