//! CLI Entry Point for readout card channels
//!
//! Provides command-line access to a single card channel:
//! - Register reads and writes
//! - Channel reset and state destruction
//! - DMA streaming with the card's data generator
//!
//! # Usage
//!
//! ```bash
//! rorc reg-read --serial 12345 --channel 0 --address 0x8
//! rorc dma --serial 12345 --channel 0 --pages 128 --count 10000 --generator incremental
//! rorc --backend dummy status --serial -1 --channel 0
//! ```
//!
//! # Exit Codes
//!
//! | Code | Error kind |
//! |------|------------|
//! | 0 | success |
//! | 1 | other failure |
//! | 2 | InvalidArgument |
//! | 3 | ChannelBusy |
//! | 4 | FilesystemError |
//! | 5 | ChannelStateConflict |
//! | 6 | HardwareBusy |
//! | 7 | HardwareFault |

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use daq_driver_rorc::{
    BackendSelection, CardId, ChannelFactory, ChannelHandle, ChannelParameters, ErrorKind,
    GeneratorPattern, LoopbackMode, PciAddress, RorcConfig, RorcError, SlotState,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Set once SIGINT arrives; long-running commands poll it.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Back-off while the card has neither free slots nor completed pages.
const IDLE_BACKOFF: Duration = Duration::from_micros(100);

#[derive(Parser, Debug)]
#[command(name = "rorc")]
#[command(about = "Readout card channel tools", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend selection: auto, hardware or dummy
    #[arg(long, global = true)]
    backend: Option<BackendSelection>,

    /// Root directory of channel state files
    #[arg(long, global = true)]
    root_dir: Option<PathBuf>,

    /// Verbose output and debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Which channel to operate on.
#[derive(Args, Debug, Clone)]
struct ChannelArgs {
    /// Card serial number (-1 for the dummy card)
    #[arg(long, allow_hyphen_values = true)]
    serial: i32,

    /// Channel number
    #[arg(long, default_value_t = 0)]
    channel: u32,

    /// PCI address of the card (domain:bus:device.function)
    #[arg(long)]
    pci_address: Option<PciAddress>,
}

impl ChannelArgs {
    fn card(&self) -> CardId {
        let card = CardId::new(self.serial);
        match self.pci_address {
            Some(address) => card.with_pci_address(address),
            None => card,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read a register
    RegRead {
        #[command(flatten)]
        target: ChannelArgs,

        /// Byte address within the channel's register window
        #[arg(long, value_parser = parse_u32)]
        address: u32,
    },

    /// Write a register
    RegWrite {
        #[command(flatten)]
        target: ChannelArgs,

        /// Byte address within the channel's register window
        #[arg(long, value_parser = parse_u32)]
        address: u32,

        /// Value to write
        #[arg(long, value_parser = parse_u32)]
        value: u32,
    },

    /// Reset the channel's DMA engine and FIFO
    Reset {
        #[command(flatten)]
        target: ChannelArgs,
    },

    /// Stream DMA pages until the count is reached or Ctrl-C
    Dma {
        #[command(flatten)]
        target: ChannelArgs,

        /// DMA page size in bytes
        #[arg(long, default_value_t = 8192, value_parser = parse_usize)]
        page_size: usize,

        /// Number of pages in the buffer
        #[arg(long, default_value_t = 128)]
        pages: u32,

        /// Pages to read (0 = until interrupted)
        #[arg(long, default_value_t = 1000)]
        count: u64,

        /// Data generator pattern: incremental, alternating or constant:<value>
        #[arg(long)]
        generator: Option<GeneratorPattern>,

        /// Loopback mode: none, internal, diu or siu
        #[arg(long, default_value = "none")]
        loopback: LoopbackMode,
    },

    /// Show backend, lifecycle state and FIFO cursors
    Status {
        #[command(flatten)]
        target: ChannelArgs,
    },

    /// Remove the channel's persisted state
    Destroy {
        #[command(flatten)]
        target: ChannelArgs,
    },

    /// Print the version
    Version,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            INTERRUPTED.store(true, Ordering::SeqCst);
        }
    });

    // Channel operations are blocking; keep them off the signal task's thread
    let result = match tokio::task::spawn_blocking(move || run(cli)).await {
        Ok(result) => result,
        Err(e) => Err(anyhow::Error::from(e).context("command task failed")),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Map a failure to the process exit code of its error kind.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<RorcError>().map(RorcError::kind) {
        Some(ErrorKind::InvalidArgument) => 2,
        Some(ErrorKind::ChannelBusy) => 3,
        Some(ErrorKind::FilesystemError) => 4,
        Some(ErrorKind::ChannelStateConflict) => 5,
        Some(ErrorKind::HardwareBusy) => 6,
        Some(ErrorKind::HardwareFault) => 7,
        None => 1,
    }
}

fn load_config(cli: &Cli) -> Result<RorcConfig> {
    let mut config = match &cli.config {
        Some(path) => RorcConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => RorcConfig::load().context("loading configuration")?,
    };
    if let Some(root_dir) = &cli.root_dir {
        config.root_dir = root_dir.clone();
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    config.validate()?;
    debug!(?config, "Loaded configuration");
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Version = cli.command {
        println!("rorc {}", daq_driver_rorc::VERSION);
        return Ok(());
    }

    let factory = ChannelFactory::new(load_config(&cli)?);
    let verbose = cli.verbose;

    match cli.command {
        Commands::RegRead { target, address } => {
            let index = word_index(address)?;
            let handle = open_existing(&factory, &target)?;
            let value = handle.read_register(index)?;
            if verbose {
                println!("{}", register_line(address, value));
            } else {
                println!("0x{:x}", value);
            }
            handle.close()?;
        }
        Commands::RegWrite {
            target,
            address,
            value,
        } => {
            let index = word_index(address)?;
            let mut handle = open_existing(&factory, &target)?;
            handle.write_register(index, value)?;
            if verbose {
                println!("{}", register_line(address, value));
            }
            handle.close()?;
        }
        Commands::Reset { target } => {
            let mut handle = open_existing(&factory, &target)?;
            handle.reset()?;
            println!("{} reset", handle.channel());
            handle.close()?;
        }
        Commands::Dma {
            target,
            page_size,
            pages,
            count,
            generator,
            loopback,
        } => {
            let mut builder = ChannelParameters::builder()
                .page_size(page_size)
                .page_count(pages)
                .loopback(loopback);
            if let Some(pattern) = generator {
                builder = builder.generator(pattern);
            }
            let params = builder.build()?;
            let handle = factory.get_channel(&target.card(), target.channel, &params)?;
            stream(handle, count, verbose)?;
        }
        Commands::Status { target } => {
            let handle = open_existing(&factory, &target)?;
            print_status(&handle);
            handle.close()?;
        }
        Commands::Destroy { target } => {
            factory.destroy_channel(&target.card(), target.channel)?;
            println!("Destroyed state of serial {} channel {}", target.serial, target.channel);
        }
        Commands::Version => {}
    }
    Ok(())
}

/// Open a channel with the parameters it was persisted with (defaults if none).
fn open_existing(factory: &ChannelFactory, target: &ChannelArgs) -> Result<ChannelHandle> {
    let card = target.card();
    let params = factory
        .persisted_parameters(&card, target.channel)?
        .unwrap_or_default();
    Ok(factory.get_channel(&card, target.channel, &params)?)
}

fn stream(mut handle: ChannelHandle, count: u64, verbose: bool) -> Result<()> {
    info!(channel = %handle.channel(), count, "Starting DMA");

    let start = Instant::now();
    let mut received: u64 = 0;
    let mut bytes: u64 = 0;
    let mut busy: u64 = 0;

    'outer: while !INTERRUPTED.load(Ordering::SeqCst) {
        let mut progressed = false;

        if let Some(page) = handle.next_free_page() {
            match handle.push_page(page) {
                Ok(()) => progressed = true,
                Err(e) if e.is_retryable() => busy += 1,
                Err(e) => return Err(e.into()),
            }
        }

        while let Some(page) = handle.pop_completed()? {
            let data = handle.page_data(&page)?;
            bytes += data.len() as u64;
            received += 1;
            progressed = true;
            if verbose && received % 1000 == 0 {
                debug!(received, first_word = ?&data[..4.min(data.len())], "Progress");
            }
            if count != 0 && received >= count {
                break 'outer;
            }
        }

        if !progressed {
            std::thread::sleep(IDLE_BACKOFF);
        }
    }

    let interrupted = INTERRUPTED.load(Ordering::SeqCst);
    if interrupted {
        warn!("Interrupted");
    }

    let elapsed = start.elapsed().as_secs_f64();
    handle.close()?;

    println!("Pages received : {}", received);
    println!("Bytes received : {}", bytes);
    println!("FIFO full      : {}", busy);
    println!("Elapsed        : {:.3} s", elapsed);
    if elapsed > 0.0 {
        println!("Throughput     : {:.1} MB/s", bytes as f64 / elapsed / 1e6);
    }
    if interrupted {
        println!("(interrupted)");
    }
    Ok(())
}

fn print_status(handle: &ChannelHandle) {
    let cursors = handle.fifo_status();
    let params = handle.parameters();
    let count = |state: SlotState| handle.slot_states().iter().filter(|s| **s == state).count();

    println!("Channel   : {}", handle.channel());
    println!("Backend   : {} ({})", handle.backend_kind(), handle.backend_state());
    println!("Pages     : {} x {} bytes", params.page_count, params.page_size);
    println!("Loopback  : {}", params.loopback);
    println!("Cursors   : write {} read {} ({} outstanding)", cursors.write, cursors.read, cursors.filled());
    println!(
        "Slots     : {} free, {} filled, {} consumed",
        count(SlotState::Free),
        count(SlotState::Filled),
        count(SlotState::Consumed)
    );
}

/// Register word index for a byte address.
fn word_index(address: u32) -> Result<u32> {
    if address % 4 != 0 {
        return Err(RorcError::invalid_argument(format!(
            "Register address 0x{:x} is not 4-byte aligned",
            address
        ))
        .into());
    }
    Ok(address / 4)
}

fn register_line(address: u32, value: u32) -> String {
    format!("0x{:x} (word {}) = 0x{:08x}", address, address / 4, value)
}

fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("'{}' is not a 32-bit value: {}", s, e))
}

fn parse_usize(s: &str) -> std::result::Result<usize, String> {
    parse_u32(s).map(|v| v as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_reg_read() {
        let cli = Cli::try_parse_from([
            "rorc", "--backend", "dummy", "reg-read", "--serial", "-1", "--address", "0x1c",
        ])
        .unwrap();
        assert_eq!(cli.backend, Some(BackendSelection::Dummy));
        match cli.command {
            Commands::RegRead { target, address } => {
                assert_eq!(target.serial, -1);
                assert_eq!(target.channel, 0);
                assert_eq!(address, 0x1c);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_dma_options() {
        let cli = Cli::try_parse_from([
            "rorc",
            "dma",
            "--serial",
            "12345",
            "--channel",
            "2",
            "--page-size",
            "0x4000",
            "--generator",
            "constant:0xff",
            "--loopback",
            "diu",
        ])
        .unwrap();
        match cli.command {
            Commands::Dma {
                page_size,
                pages,
                generator,
                loopback,
                ..
            } => {
                assert_eq!(page_size, 0x4000);
                assert_eq!(pages, 128);
                assert_eq!(generator, Some(GeneratorPattern::Constant(0xff)));
                assert_eq!(loopback, LoopbackMode::Diu);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(Cli::try_parse_from(["rorc", "dma", "--serial", "1", "--generator", "noise"]).is_err());
        assert!(Cli::try_parse_from(["rorc", "reg-read", "--serial", "1", "--address", "0xzz"]).is_err());
        assert!(Cli::try_parse_from(["rorc", "status", "--serial", "1", "--backend", "gpu"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let busy = anyhow::Error::from(RorcError::hardware_fault("boom")).context("opening channel");
        assert_eq!(exit_code(&busy), 7);
        assert_eq!(exit_code(&RorcError::invalid_argument("x").into()), 2);
        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_word_index() {
        assert_eq!(word_index(0x1c).unwrap(), 7);
        assert_eq!(exit_code(&word_index(0x1d).unwrap_err()), 2);
        assert_eq!(register_line(0x8, 0x2000), "0x8 (word 2) = 0x00002000");
    }

    #[test]
    fn test_run_against_dummy_backend() {
        let root = tempfile::tempdir().unwrap();
        let root_dir = root.path().to_str().unwrap();

        let cli = Cli::try_parse_from([
            "rorc", "--backend", "dummy", "--root-dir", root_dir, "dma", "--serial", "5", "--pages", "4",
            "--count", "10", "--generator", "incremental",
        ])
        .unwrap();
        run(cli).unwrap();

        let cli = Cli::try_parse_from([
            "rorc", "--backend", "dummy", "--root-dir", root_dir, "reg-write", "--serial", "5",
            "--address", "0x40", "--value", "7",
        ])
        .unwrap();
        run(cli).unwrap();

        let cli = Cli::try_parse_from([
            "rorc", "--backend", "dummy", "--root-dir", root_dir, "destroy", "--serial", "5",
        ])
        .unwrap();
        run(cli).unwrap();
        assert!(!root.path().join("serial_5/channel_0/state.json").exists());
    }
}
