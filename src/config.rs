//! Driver configuration.
//!
//! Loaded from JSON (camelCase keys), e.g.
//!
//! ```json
//! {
//!   "transport": { "type": "serial", "port": "/dev/ttyUSB0", "baudRate": 115200 },
//!   "retry": { "maxRetries": 6 },
//!   "escapeControlBytes": false
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::protocol::engine::RetryPolicy;

/// Baud rates the FP-700X-class devices accept on the serial link.
pub const SUPPORTED_BAUD_RATES: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const DEFAULT_NETWORK_PORT: u16 = 4999;

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_serial_timeout_ms() -> u64 {
    100
}

fn default_network_port() -> u16 {
    DEFAULT_NETWORK_PORT
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Where the device lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TransportConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Initial read timeout on the port; the engine overrides it per poll.
        #[serde(default = "default_serial_timeout_ms")]
        timeout_ms: u64,
    },
    Network {
        ip: String,
        #[serde(default = "default_network_port")]
        port: u16,
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
    },
}

impl TransportConfig {
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self::Serial {
            port: port.into(),
            baud_rate,
            timeout_ms: default_serial_timeout_ms(),
        }
    }

    pub fn network(ip: impl Into<String>, port: u16) -> Self {
        Self::Network {
            ip: ip.into(),
            port,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Serial {
                port, baud_rate, ..
            } => {
                if port.trim().is_empty() {
                    return Err(ConfigError::Invalid("serial port name is empty".into()));
                }
                if !SUPPORTED_BAUD_RATES.contains(baud_rate) {
                    return Err(ConfigError::UnsupportedBaudRate(*baud_rate));
                }
            }
            Self::Network { ip, port, .. } => {
                if ip.trim().is_empty() {
                    return Err(ConfigError::Invalid("network host is empty".into()));
                }
                if *port == 0 {
                    return Err(ConfigError::Invalid("network port must be non-zero".into()));
                }
            }
        }
        Ok(())
    }
}

/// Everything needed to open a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub transport: TransportConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Send bytes below 0x20 (other than TAB) as ESC-prefixed pairs instead
    /// of rejecting them.
    #[serde(default)]
    pub escape_control_bytes: bool,
}

impl DriverConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            escape_control_bytes: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading driver config from {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;
        if self.retry.reply_timeout_ms == 0 {
            return Err(ConfigError::Invalid("retry.replyTimeoutMs must be non-zero".into()));
        }
        Ok(())
    }
}
