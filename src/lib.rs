//! Fiscal Link - FP-700X-class fiscal printer driver
//!
//! Host (master) side of the framed, BCC-checked, sequence-numbered
//! protocol spoken by Datecs-style fiscal printers over RS-232, USB-serial
//! or TCP. A [`Session`] owns one link and turns `(command, fields)` into a
//! decoded [`Reply`] or a typed [`FiscalError`].
//!
//! ```no_run
//! use fiscal_link::{codes, DriverConfig, Session, TransportConfig};
//!
//! # fn main() -> Result<(), fiscal_link::FiscalError> {
//! let config = DriverConfig::new(TransportConfig::serial("/dev/ttyUSB0", 115200));
//! let session = Session::open(&config)?;
//! let reply = session.execute::<&str>(codes::READ_STATUS, &[])?;
//! if reply.status.end_of_paper {
//!     println!("out of paper");
//! }
//! session.close();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod probe;
pub mod protocol;
pub mod session;
pub mod simulator;
pub mod transport;

pub use config::{DriverConfig, TransportConfig};
pub use error::{ConfigError, FiscalError, FrameError, TransportError};
pub use protocol::{codes, Answer, StatusSnapshot};
pub use session::{Reply, Session, SessionOptions};
pub use transport::{create_transport, list_ports, PortInfo, Transport, TransportState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
