//! Error types for readout card channel operations.
//!
//! Every failure carries one of six [`ErrorKind`]s. The kind alone is enough
//! for a caller to decide whether retrying makes sense: only
//! [`ErrorKind::HardwareBusy`] is transient.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::identity::ChannelId;

/// Result type alias for RORC operations.
pub type Result<T> = std::result::Result<T, RorcError>;

/// Errors that can occur when opening or driving a readout card channel.
#[derive(Error, Debug)]
pub enum RorcError {
    /// Bad channel number, malformed parameters or invalid configuration
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Another process holds the channel lock
    #[error("Channel {channel} is busy (locked by another process)")]
    ChannelBusy { channel: ChannelId },

    /// Directory or file creation, read or write failed
    #[error("Filesystem error on '{}': {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Persisted state cannot be reused with the requested parameters
    #[error("Channel {channel} state conflict: {reason}. Destroy the channel state before reopening")]
    ChannelStateConflict { channel: ChannelId, reason: String },

    /// The descriptor FIFO is full
    #[error("Channel {channel} FIFO is full ({capacity} descriptors outstanding)")]
    HardwareBusy { channel: ChannelId, capacity: u32 },

    /// The card or the access library reported an error
    #[error("Hardware fault: {message}")]
    HardwareFault { message: String },
}

/// Distinguishable error categories exposed to the CLI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    ChannelBusy,
    FilesystemError,
    ChannelStateConflict,
    HardwareBusy,
    HardwareFault,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "InvalidArgument"),
            Self::ChannelBusy => write!(f, "ChannelBusy"),
            Self::FilesystemError => write!(f, "FilesystemError"),
            Self::ChannelStateConflict => write!(f, "ChannelStateConflict"),
            Self::HardwareBusy => write!(f, "HardwareBusy"),
            Self::HardwareFault => write!(f, "HardwareFault"),
        }
    }
}

impl RorcError {
    /// Create an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a hardware fault error.
    pub fn hardware_fault(message: impl Into<String>) -> Self {
        Self::HardwareFault {
            message: message.into(),
        }
    }

    /// Wrap an I/O error with the path it happened on.
    pub fn filesystem(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a state conflict error.
    pub fn state_conflict(channel: &ChannelId, reason: impl Into<String>) -> Self {
        Self::ChannelStateConflict {
            channel: channel.clone(),
            reason: reason.into(),
        }
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::ChannelBusy { .. } => ErrorKind::ChannelBusy,
            Self::Filesystem { .. } => ErrorKind::FilesystemError,
            Self::ChannelStateConflict { .. } => ErrorKind::ChannelStateConflict,
            Self::HardwareBusy { .. } => ErrorKind::HardwareBusy,
            Self::HardwareFault { .. } => ErrorKind::HardwareFault,
        }
    }

    /// Whether retrying the same call later can succeed without caller intervention.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::HardwareBusy
    }

    /// Check if the channel is locked by someone else.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::ChannelBusy { .. })
    }
}

impl From<figment::Error> for RorcError {
    fn from(err: figment::Error) -> Self {
        Self::invalid_argument(format!("configuration: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CardId;

    #[test]
    fn test_error_display() {
        let channel = ChannelId::new(CardId::new(12345), 2);
        let err = RorcError::HardwareBusy {
            channel,
            capacity: 4,
        };
        assert!(err.to_string().contains("12345"));
        assert!(err.to_string().contains("4 descriptors"));
    }

    #[test]
    fn test_only_hardware_busy_is_retryable() {
        let channel = ChannelId::new(CardId::new(1), 0);
        let errors = [
            RorcError::invalid_argument("bad"),
            RorcError::ChannelBusy {
                channel: channel.clone(),
            },
            RorcError::filesystem("/tmp/x", io::Error::other("boom")),
            RorcError::state_conflict(&channel, "page size"),
            RorcError::HardwareBusy {
                channel,
                capacity: 1,
            },
            RorcError::hardware_fault("reset failed"),
        ];

        let retryable: Vec<ErrorKind> = errors
            .iter()
            .filter(|e| e.is_retryable())
            .map(RorcError::kind)
            .collect();
        assert_eq!(retryable, vec![ErrorKind::HardwareBusy]);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::ChannelStateConflict.to_string(), "ChannelStateConflict");
        assert_eq!(ErrorKind::FilesystemError.to_string(), "FilesystemError");
    }
}
