//! Channel Lifecycle Test Suite
//!
//! Exercises the channel factory end to end against the dummy backend, with a
//! temporary artifact root and an empty sysfs tree so no real card is probed.
//!
//! # Running
//!
//! ```bash
//! cargo nextest run -p daq-driver-rorc -- channel_lifecycle
//! ```
//!
//! # Test Coverage
//!
//! | Test | Description |
//! |------|-------------|
//! | `test_second_open_is_busy` | Lock contention, first handle unaffected |
//! | `test_drop_releases_lock` | Crash-equivalent drop frees the channel |
//! | `test_fifo_end_to_end` | 4 pushes, busy on the 5th, FIFO order |
//! | `test_unclosed_reopen_zeroes_cursors` | Restart after an unclean exit |
//! | `test_clean_close_restores_cursors` | Restart after `close()` |
//! | `test_generator_data_visible` | Dummy generator fills the caller's pages |
//! | `test_reset_persists` | Reset frees every slot on disk too |
//! | `test_bad_descriptor_leaves_fifo_unchanged` | Mismatched descriptors are refused before queuing |
//! | `test_control_reset_write_persists` | Reset bit written to CONTROL resets and persists |

use daq_driver_rorc::pda::regs;
use daq_driver_rorc::{
    BackendKind, BackendSelection, BackendState, CardId, ChannelFactory, ChannelHandle,
    ChannelParameters, ErrorKind, GeneratorPattern, PageDescriptor, RorcConfig, SlotState,
    DUMMY_SERIAL_NUMBER,
};
use tempfile::TempDir;

// =============================================================================
// Test Fixtures
// =============================================================================

const SERIAL: i32 = 12345;

struct Setup {
    root: TempDir,
    sysfs: TempDir,
}

impl Setup {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            sysfs: tempfile::tempdir().unwrap(),
        }
    }

    fn factory(&self) -> ChannelFactory {
        let mut config = RorcConfig::default().with_root_dir(self.root.path());
        config.sysfs_root = self.sysfs.path().to_path_buf();
        ChannelFactory::new(config)
    }

    fn open(&self, params: &ChannelParameters) -> ChannelHandle {
        self.factory().get_channel(&CardId::new(SERIAL), 0, params).unwrap()
    }
}

fn params() -> ChannelParameters {
    ChannelParameters::builder().page_size(8192).page_count(4).build().unwrap()
}

fn push_next(handle: &mut ChannelHandle) -> u32 {
    let page = handle.next_free_page().expect("free page");
    handle.push_page(page).unwrap();
    page.index
}

// =============================================================================
// Exclusive Ownership
// =============================================================================

#[test]
fn test_second_open_is_busy() {
    let setup = Setup::new();
    let mut first = setup.open(&params());

    let err = setup
        .factory()
        .get_channel(&CardId::new(SERIAL), 0, &params())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelBusy);
    assert!(!err.is_retryable());

    // The first handle keeps working
    push_next(&mut first);
    assert_eq!(first.pop_completed().unwrap().map(|p| p.index), Some(0));

    // Other channels of the same card are independent
    let other = setup
        .factory()
        .get_channel(&CardId::new(SERIAL), 1, &params())
        .unwrap();
    assert_eq!(other.channel().channel(), 1);
}

#[test]
fn test_drop_releases_lock() {
    let setup = Setup::new();
    let handle = setup.open(&params());
    drop(handle);

    let reopened = setup.open(&params());
    assert_eq!(reopened.backend_state(), BackendState::Open);
}

// =============================================================================
// FIFO Traffic
// =============================================================================

#[test]
fn test_fifo_end_to_end() {
    let setup = Setup::new();
    let mut handle = setup.open(&params());
    assert_eq!(handle.backend_kind(), BackendKind::Dummy);

    for expected in 0..4 {
        assert_eq!(push_next(&mut handle), expected);
    }
    assert_eq!(handle.fifo_status().filled(), 4);

    // Every slot is owned by the card, so reuse one explicitly
    let page = handle.page(0).unwrap();
    let before = handle.fifo_status();
    let err = handle.push_page(page).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HardwareBusy);
    assert!(err.is_retryable());
    assert_eq!(handle.fifo_status(), before);

    let oldest = handle.pop_completed().unwrap().unwrap();
    assert_eq!(oldest.index, 0);
    assert_eq!(handle.slot_states()[0], SlotState::Consumed);

    handle.push_page(oldest).unwrap();
    assert_eq!(handle.fifo_status().filled(), 4);
    assert_eq!(handle.fifo_status().write, 5);
    assert_eq!(handle.backend_state(), BackendState::Streaming);
}

#[test]
fn test_generator_data_visible() {
    let setup = Setup::new();
    let params = ChannelParameters::builder()
        .page_size(8192)
        .page_count(4)
        .generator(GeneratorPattern::Constant(0xcafe_f00d))
        .build()
        .unwrap();
    let mut handle = setup.open(&params);

    push_next(&mut handle);
    let page = handle.pop_completed().unwrap().unwrap();
    let data = handle.page_data(&page).unwrap();
    assert_eq!(data.len(), 8192);
    assert!(data
        .chunks_exact(4)
        .all(|w| w == 0xcafe_f00du32.to_le_bytes()));
}

#[test]
fn test_reset_persists() {
    let setup = Setup::new();
    let mut handle = setup.open(&params());
    push_next(&mut handle);
    push_next(&mut handle);

    handle.reset().unwrap();
    assert!(handle.fifo_status().is_empty());
    assert!(handle.slot_states().iter().all(|s| *s == SlotState::Free));
    handle.close().unwrap();

    let reopened = setup.open(&params());
    assert!(reopened.fifo_status().is_empty());
    assert_eq!(reopened.fifo_status().write, 0);
}

#[test]
fn test_bad_descriptor_leaves_fifo_unchanged() {
    let setup = Setup::new();
    let params = ChannelParameters::builder()
        .page_size(8192)
        .page_count(4)
        .generator(GeneratorPattern::Incremental)
        .build()
        .unwrap();
    let mut handle = setup.open(&params);
    let page = handle.page(1).unwrap();

    let rejected = [
        PageDescriptor {
            offset: 1 << 40,
            ..page
        },
        PageDescriptor {
            offset: 3 * 8192,
            ..page
        },
        PageDescriptor {
            bus_address: 999,
            ..page
        },
    ];
    for bad in rejected {
        let err = handle.push_page(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(handle.fifo_status().write, 0);
        assert_eq!(handle.slot_states()[1], SlotState::Free);
    }

    let overflowing = PageDescriptor {
        offset: u64::MAX - 10,
        ..handle.page(0).unwrap()
    };
    assert_eq!(handle.page_data(&overflowing).unwrap_err().kind(), ErrorKind::InvalidArgument);

    handle.push_page(page).unwrap();
    assert_eq!(handle.pop_completed().unwrap(), Some(page));
}

#[test]
fn test_control_reset_write_persists() {
    let setup = Setup::new();
    let mut handle = setup.open(&params());
    push_next(&mut handle);
    push_next(&mut handle);
    handle.pop_completed().unwrap();

    handle
        .write_register(regs::CONTROL, regs::Control::RESET.bits())
        .unwrap();
    assert!(handle.fifo_status().is_empty());
    assert!(handle.slot_states().iter().all(|s| *s == SlotState::Free));

    let fifo: serde_json::Value =
        serde_json::from_slice(&std::fs::read(handle.paths().fifo()).unwrap()).unwrap();
    assert_eq!(fifo["cursors"]["write"], 0);
    assert_eq!(fifo["cursors"]["read"], 0);
}

// =============================================================================
// Restart Behaviour
// =============================================================================

#[test]
fn test_unclosed_reopen_zeroes_cursors() {
    let setup = Setup::new();

    // First "process": pushes and dies without closing
    {
        let mut handle = setup.open(&params());
        push_next(&mut handle);
        push_next(&mut handle);
        handle.pop_completed().unwrap();
    }

    let handle = setup.open(&params());
    let cursors = handle.fifo_status();
    assert_eq!(cursors.write, 0);
    assert_eq!(cursors.read, 0);
    assert!(handle.slot_states().iter().all(|s| *s == SlotState::Free));
}

#[test]
fn test_clean_close_restores_cursors() {
    let setup = Setup::new();

    let mut handle = setup.open(&params());
    push_next(&mut handle);
    push_next(&mut handle);
    push_next(&mut handle);
    handle.pop_completed().unwrap();
    let before = handle.fifo_status();
    handle.close().unwrap();

    let mut handle = setup.open(&params());
    assert_eq!(handle.fifo_status(), before);
    assert_eq!(handle.slot_states()[0], SlotState::Consumed);
    assert_eq!(handle.slot_states()[1], SlotState::Filled);

    // Outstanding descriptors survive and complete in order
    assert_eq!(handle.pop_completed().unwrap().map(|p| p.index), Some(1));
    assert_eq!(push_next(&mut handle), 3);
}

#[test]
fn test_dummy_serial_always_uses_dummy() {
    let setup = Setup::new();
    let mut config = RorcConfig::default()
        .with_root_dir(setup.root.path())
        .with_backend(BackendSelection::Auto);
    config.sysfs_root = "/sys".into();

    let handle = ChannelFactory::new(config)
        .get_channel(&CardId::new(DUMMY_SERIAL_NUMBER), 0, &params())
        .unwrap();
    assert_eq!(handle.backend_kind(), BackendKind::Dummy);
    assert!(handle.lock_path().ends_with("serial_-1/channel_0/lock"));
}
