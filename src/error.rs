//! Error types for the fiscal printer driver.
//!
//! Codec, transport and configuration failures each have their own enum; the
//! session facade folds them into [`FiscalError`], which is what callers see.

use crate::protocol::status::StatusSnapshot;
use thiserror::Error;

/// Frame codec failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("BCC mismatch: computed {expected:#06x}, frame carries {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Byte-level transport failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Failed to open {target}: {reason}")]
    Open { target: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Closed,
}

/// Configuration loading / validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported baud rate {0} (expected one of 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200)")]
    UnsupportedBaudRate(u32),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors surfaced by [`crate::Session`].
///
/// Variants that can follow a device reply carry the last status snapshot the
/// session decoded, so callers can still act on device state (paper out,
/// cover open) when the command itself failed.
#[derive(Error, Debug)]
pub enum FiscalError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Reply checksum mismatch persisted after {attempts} attempts")]
    ChecksumMismatch {
        attempts: u32,
        last_status: Option<StatusSnapshot>,
    },

    #[error("Device unresponsive: command {command:#06x} unanswered after {attempts} transmissions")]
    DeviceUnresponsive {
        command: u16,
        attempts: u32,
        /// The command is not idempotent and reached the wire at least once.
        may_have_executed: bool,
        last_status: Option<StatusSnapshot>,
    },

    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        reason: String,
        last_status: Option<StatusSnapshot>,
    },

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(#[from] TransportError),

    #[error("Session is closed")]
    Closed,

    #[error("Session is faulted after retry exhaustion; open a new session")]
    Faulted,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl FiscalError {
    /// Last known device status, when the failure happened after at least one
    /// decoded reply.
    pub fn last_status(&self) -> Option<&StatusSnapshot> {
        match self {
            Self::ChecksumMismatch { last_status, .. }
            | Self::DeviceUnresponsive { last_status, .. }
            | Self::ProtocolViolation { last_status, .. } => last_status.as_ref(),
            _ => None,
        }
    }

    /// Whether this failure leaves the session in its terminal fault state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::DeviceUnresponsive { .. } | Self::Faulted
        )
    }
}
