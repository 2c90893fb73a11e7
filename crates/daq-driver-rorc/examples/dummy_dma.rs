//! DMA round trip on the dummy card.
//!
//! Opens channel 0 of the dummy card under a temporary root, streams a few
//! generator pages, and shows that the cursors survive a clean close.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p daq-driver-rorc --example dummy_dma
//! ```

use daq_driver_rorc::{
    CardId, ChannelFactory, ChannelParameters, GeneratorPattern, RorcConfig, RorcError,
};

fn main() -> anyhow::Result<()> {
    let root = std::env::temp_dir().join("rorc-dummy-dma");
    let factory = ChannelFactory::new(RorcConfig::default().with_root_dir(&root));
    let card = CardId::dummy();

    let params = ChannelParameters::builder()
        .page_size(8192)
        .page_count(8)
        .generator(GeneratorPattern::Alternating)
        .build()?;

    println!("Opening {} channel 0 under {}", card, root.display());
    let mut handle = factory.get_channel(&card, 0, &params)?;
    println!("  Backend: {} ({})", handle.backend_kind(), handle.backend_state());

    let mut received = 0;
    while received < 20 {
        if let Some(page) = handle.next_free_page() {
            match handle.push_page(page) {
                Ok(()) => {}
                Err(RorcError::HardwareBusy { .. }) => println!("  FIFO full, draining"),
                Err(e) => return Err(e.into()),
            }
        }
        while let Some(page) = handle.pop_completed()? {
            let data = handle.page_data(&page)?;
            println!("  page {:>2}: {:02x?}...", page.index, &data[..8]);
            received += 1;
        }
    }

    let cursors = handle.fifo_status();
    println!("\nCursors before close: write {} read {}", cursors.write, cursors.read);
    handle.close()?;

    let handle = factory.get_channel(&card, 0, &params)?;
    let cursors = handle.fifo_status();
    println!("Cursors after reopen: write {} read {}", cursors.write, cursors.read);
    drop(handle);

    factory.destroy_channel(&card, 0)?;
    Ok(())
}
