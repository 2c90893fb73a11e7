//! Channel parameters supplied at open time.
//!
//! Parameters are validated before the factory touches the filesystem or the
//! card. The page geometry (`page_size`, `page_count`) is structural: it must
//! match any state already persisted for the channel. Generator and loopback
//! toggles may change from one open to the next.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RorcError};

/// DMA pages are allocated in multiples of the host page size.
pub const PAGE_ALIGNMENT: usize = 4096;

/// Largest DMA page the card accepts (one 2 MiB huge page).
pub const MAX_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Largest page buffer depth (one descriptor FIFO worth of pages).
pub const MAX_PAGE_COUNT: u32 = 1024;

/// Data pattern produced by the card's internal data generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GeneratorPattern {
    /// 32-bit words counting up from zero across the page
    Incremental,
    /// Alternating `0xa5a5a5a5` / `0x5a5a5a5a` words
    Alternating,
    /// Every word set to the given value
    Constant(u32),
}

impl GeneratorPattern {
    /// The word the generator writes at `word_index` of a page.
    pub fn word(&self, word_index: usize) -> u32 {
        match self {
            Self::Incremental => word_index as u32,
            Self::Alternating => {
                if word_index % 2 == 0 {
                    0xa5a5_a5a5
                } else {
                    0x5a5a_5a5a
                }
            }
            Self::Constant(value) => *value,
        }
    }

    /// Register encoding used by the channel control register.
    pub fn code(&self) -> u32 {
        match self {
            Self::Incremental => 0,
            Self::Alternating => 1,
            Self::Constant(_) => 2,
        }
    }
}

impl FromStr for GeneratorPattern {
    type Err = RorcError;

    /// Accepts `incremental`, `alternating`, or `constant:<value>` (hex with `0x`).
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "incremental" => Ok(Self::Incremental),
            "alternating" => Ok(Self::Alternating),
            other => {
                let value = other
                    .strip_prefix("constant:")
                    .ok_or_else(|| {
                        RorcError::invalid_argument(format!("Unknown generator pattern '{}'", s))
                    })?;
                let parsed = match value.strip_prefix("0x") {
                    Some(hex) => u32::from_str_radix(hex, 16),
                    None => value.parse(),
                };
                parsed.map(Self::Constant).map_err(|_| {
                    RorcError::invalid_argument(format!("Invalid generator constant '{}'", value))
                })
            }
        }
    }
}

/// Where the card loops data back before it reaches the DMA engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopbackMode {
    /// No loopback, data comes from the detector link
    #[default]
    None,
    /// Loop back inside the card firmware
    Internal,
    /// Loop back at the destination interface unit
    Diu,
    /// Loop back at the source interface unit
    Siu,
}

impl LoopbackMode {
    /// Register encoding used by the channel control register.
    pub fn code(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Internal => 1,
            Self::Diu => 2,
            Self::Siu => 3,
        }
    }
}

impl fmt::Display for LoopbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Internal => write!(f, "internal"),
            Self::Diu => write!(f, "diu"),
            Self::Siu => write!(f, "siu"),
        }
    }
}

impl FromStr for LoopbackMode {
    type Err = RorcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "internal" => Ok(Self::Internal),
            "diu" => Ok(Self::Diu),
            "siu" => Ok(Self::Siu),
            _ => Err(RorcError::invalid_argument(format!(
                "Unknown loopback mode '{}'",
                s
            ))),
        }
    }
}

/// User-supplied configuration of a DMA channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelParameters {
    /// Size of one DMA page in bytes
    pub page_size: usize,
    /// Number of pages in the DMA page buffer (also the FIFO capacity)
    pub page_count: u32,
    /// Internal data generator, `None` when disabled
    #[serde(default)]
    pub generator: Option<GeneratorPattern>,
    /// Loopback mode
    #[serde(default)]
    pub loopback: LoopbackMode,
}

impl Default for ChannelParameters {
    fn default() -> Self {
        Self {
            page_size: 8 * 1024,
            page_count: 128,
            generator: None,
            loopback: LoopbackMode::None,
        }
    }
}

impl ChannelParameters {
    /// Create a new parameters builder.
    pub fn builder() -> ChannelParametersBuilder {
        ChannelParametersBuilder::default()
    }

    /// Validate the parameters.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size % PAGE_ALIGNMENT != 0 {
            return Err(RorcError::invalid_argument(format!(
                "Page size {} is not a non-zero multiple of {}",
                self.page_size, PAGE_ALIGNMENT
            )));
        }

        if self.page_size > MAX_PAGE_SIZE {
            return Err(RorcError::invalid_argument(format!(
                "Page size {} exceeds maximum {}",
                self.page_size, MAX_PAGE_SIZE
            )));
        }

        if self.page_count == 0 || self.page_count > MAX_PAGE_COUNT {
            return Err(RorcError::invalid_argument(format!(
                "Page count {} out of range 1..={}",
                self.page_count, MAX_PAGE_COUNT
            )));
        }

        Ok(())
    }

    /// Total size of the DMA page buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.page_size * self.page_count as usize
    }

    /// Describe why persisted parameters cannot be reused, or `None` if they can.
    pub fn incompatibility(&self, persisted: &ChannelParameters) -> Option<String> {
        if self.page_size != persisted.page_size {
            return Some(format!(
                "page size {} does not match persisted {}",
                self.page_size, persisted.page_size
            ));
        }
        if self.page_count != persisted.page_count {
            return Some(format!(
                "page count {} does not match persisted {}",
                self.page_count, persisted.page_count
            ));
        }
        None
    }
}

/// Builder for [`ChannelParameters`].
#[derive(Debug, Default)]
pub struct ChannelParametersBuilder {
    params: ChannelParameters,
}

impl ChannelParametersBuilder {
    /// Set the DMA page size in bytes.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.params.page_size = bytes;
        self
    }

    /// Set the number of pages in the buffer.
    pub fn page_count(mut self, count: u32) -> Self {
        self.params.page_count = count;
        self
    }

    /// Enable the data generator with the given pattern.
    pub fn generator(mut self, pattern: GeneratorPattern) -> Self {
        self.params.generator = Some(pattern);
        self
    }

    /// Set the loopback mode.
    pub fn loopback(mut self, mode: LoopbackMode) -> Self {
        self.params.loopback = mode;
        self
    }

    /// Build the parameters.
    pub fn build(self) -> Result<ChannelParameters> {
        self.params.validate()?;
        Ok(self.params)
    }
}
