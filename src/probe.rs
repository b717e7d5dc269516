//! Device discovery: baud-rate auto-detection and identification.

use serde::Serialize;
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::error::{FiscalError, TransportError};
use crate::protocol::commands::{codes, Answer};
use crate::protocol::engine::RetryPolicy;
use crate::session::{Session, SessionOptions};
use crate::transport::{create_transport, Transport};

/// Baud rates tried by [`detect`], most common first.
pub const DETECTION_BAUD_RATES: [u32; 5] = [115200, 9600, 19200, 38400, 57600];

/// Identity reported by the diagnostic-info command (0x5A).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model: String,
    pub firmware_version: String,
    pub firmware_date: String,
    pub serial_number: String,
    pub fiscal_memory_serial: String,
}

impl DeviceInfo {
    /// Parse `ErrorCode \t Model \t FwRev \t FwDate \t SerialNo \t FMNo`.
    pub fn from_answer(answer: &Answer) -> Result<Self, FiscalError> {
        if answer.is_device_error() {
            return Err(FiscalError::ProtocolViolation {
                reason: format!(
                    "diagnostic info rejected with code {}",
                    answer.error_code().unwrap_or_default()
                ),
                last_status: None,
            });
        }
        let field = |i: usize| {
            answer
                .text(i)
                .map(|t| t.trim().to_string())
                .unwrap_or_default()
        };
        let info = Self {
            model: field(1),
            firmware_version: field(2),
            firmware_date: field(3),
            serial_number: field(4),
            fiscal_memory_serial: field(5),
        };
        if info.model.is_empty() {
            return Err(FiscalError::ProtocolViolation {
                reason: "diagnostic info carries no model name".into(),
                last_status: None,
            });
        }
        Ok(info)
    }
}

/// Ask an open session's device who it is.
pub fn identify(session: &Session) -> Result<DeviceInfo, FiscalError> {
    let reply = session.execute::<&str>(codes::DIAGNOSTIC_INFO, &[])?;
    let info = DeviceInfo::from_answer(&reply.answer)?;
    info!(
        session = %session.id(),
        model = %info.model,
        serial = %info.serial_number,
        "Identified device"
    );
    Ok(info)
}

/// A baud rate that produced a valid device frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub baud_rate: u32,
    pub transport: TransportConfig,
}

/// Try each candidate baud rate on `port` with the status command and return
/// the first that gets an answer.
pub fn detect(port: &str, candidates: &[u32]) -> Result<Option<Detection>, FiscalError> {
    let found = detect_with(candidates, SessionOptions::default(), |baud| {
        Ok(create_transport(&TransportConfig::serial(port, baud)))
    })?;
    Ok(found.map(|baud_rate| Detection {
        baud_rate,
        transport: TransportConfig::serial(port, baud_rate),
    }))
}

/// Detection over caller-built transports. A short retry policy is applied
/// on top of `options` so a silent rate is abandoned quickly.
pub fn detect_with<F>(
    candidates: &[u32],
    options: SessionOptions,
    mut connect: F,
) -> Result<Option<u32>, FiscalError>
where
    F: FnMut(u32) -> Result<Box<dyn Transport>, TransportError>,
{
    let options = options.with_retry(RetryPolicy::with_max_retries(1));
    for &baud in candidates {
        debug!("Probing at {baud} baud");
        let transport = match connect(baud) {
            Ok(t) => t,
            Err(e) => {
                debug!("Cannot open link at {baud} baud: {e}");
                continue;
            }
        };
        // an unopenable port fails the same way at every rate
        let session = Session::open_with(transport, options.clone())?;
        let outcome = session.execute::<&str>(codes::READ_STATUS, &[]);
        session.close();
        match outcome {
            Ok(_) | Err(FiscalError::ProtocolViolation { .. }) => {
                info!("Device answered at {baud} baud");
                return Ok(Some(baud));
            }
            Err(e) => debug!("No answer at {baud} baud: {e}"),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::simulator::SimulatedPrinter;

    #[test]
    fn test_device_info_from_answer() {
        let answer = Answer::parse(b"0\tFP-700X\t1.00BG\t27Nov23 1200\tDT123456\t02123456\t".to_vec());
        let info = DeviceInfo::from_answer(&answer).unwrap();
        assert_eq!(info.model, "FP-700X");
        assert_eq!(info.firmware_version, "1.00BG");
        assert_eq!(info.firmware_date, "27Nov23 1200");
        assert_eq!(info.serial_number, "DT123456");
        assert_eq!(info.fiscal_memory_serial, "02123456");
    }

    #[test]
    fn test_device_info_rejects_error_answer() {
        assert!(DeviceInfo::from_answer(&Answer::parse(b"-100001\t".to_vec())).is_err());
        assert!(DeviceInfo::from_answer(&Answer::parse(b"0\t".to_vec())).is_err());
    }

    #[test]
    fn test_identify_over_simulator() {
        let printer = SimulatedPrinter::new();
        let options = SessionOptions::default().with_clock(printer.clock());
        let session = Session::open_with(Box::new(printer), options).unwrap();
        let info = identify(&session).unwrap();
        assert_eq!(info.model, "FP-700X");
        assert_eq!(info.serial_number, "DT123456");
    }

    #[test]
    fn test_detect_finds_answering_rate() {
        let clock = Arc::new(ManualClock::new());
        let options = SessionOptions::default().with_clock(clock.clone());
        let mut tried = Vec::new();
        let found = detect_with(&DETECTION_BAUD_RATES, options, |baud| {
            tried.push(baud);
            let printer = SimulatedPrinter::with_clock(clock.clone());
            printer.handle().set_online(baud == 19200);
            Ok(Box::new(printer) as Box<dyn Transport>)
        })
        .unwrap();
        assert_eq!(found, Some(19200));
        assert_eq!(tried, vec![115200, 9600, 19200]);
        // two silent rates, two transmissions each
        assert_eq!(clock.elapsed().as_millis(), 2 * 2 * 500 + 10);
    }

    #[test]
    fn test_detect_none_when_silent() {
        let clock = Arc::new(ManualClock::new());
        let options = SessionOptions::default().with_clock(clock.clone());
        let found = detect_with(&[9600, 57600], options, |_| {
            let printer = SimulatedPrinter::with_clock(clock.clone());
            printer.handle().set_online(false);
            Ok(Box::new(printer) as Box<dyn Transport>)
        })
        .unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn test_detect_skips_unopenable_links() {
        let clock = Arc::new(ManualClock::new());
        let options = SessionOptions::default().with_clock(clock.clone());
        let found = detect_with(&[9600, 115200], options, |baud| {
            if baud == 9600 {
                return Err(TransportError::NotConnected);
            }
            Ok(Box::new(SimulatedPrinter::with_clock(clock.clone())) as Box<dyn Transport>)
        })
        .unwrap();
        assert_eq!(found, Some(115200));
    }
}
