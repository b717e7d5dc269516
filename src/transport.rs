//! Transport layer for fiscal printer communication.
//!
//! Defines the `Transport` trait and concrete implementations for serial
//! (RS-232 / USB-serial) and network (TCP) links. Transports move raw bytes
//! only; framing and retries live in [`crate::protocol`].

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::TransportError;

/// Smallest read timeout handed to the OS; zero means "block forever" to some
/// platforms and is rejected by others.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Transport state
// ---------------------------------------------------------------------------

/// Connection state for transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Byte-level link to one device.
pub trait Transport: Send {
    /// Establish the connection.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Tear down the connection.
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Write all of `data`. Returns number of bytes written.
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Wait at most `timeout` for bytes. An empty vector means nothing arrived.
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Whether the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// Current transport state.
    fn state(&self) -> TransportState;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// Serial transport
// ---------------------------------------------------------------------------

/// Serial transport, 8 data bits, no parity, 1 stop bit.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    timeout_ms: u64,
    port: Option<Box<dyn serialport::SerialPort>>,
    state: TransportState,
}

impl SerialTransport {
    pub fn new(port_name: &str, baud_rate: u32, timeout_ms: u64) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            timeout_ms,
            port: None,
            state: TransportState::Disconnected,
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.state = TransportState::Connecting;
        info!(
            "Opening serial port {} @ {} baud",
            self.port_name, self.baud_rate
        );

        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(self.timeout_ms))
            .open()
            .map_err(|e| {
                self.state = TransportState::Error;
                TransportError::Open {
                    target: self.port_name.clone(),
                    reason: e.to_string(),
                }
            })?;

        // stale bytes from a previous session would desynchronise the first reply
        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            warn!("Could not clear buffers on {}: {e}", self.port_name);
        }

        self.port = Some(port);
        self.state = TransportState::Connected;
        info!("Serial port {} connected", self.port_name);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.port = None;
        self.state = TransportState::Disconnected;
        info!("Serial port {} disconnected", self.port_name);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        debug!("Serial TX ({} bytes): {:02X?}", data.len(), data);
        let result = port.write_all(data).and_then(|()| port.flush());
        if let Err(e) = result {
            self.state = TransportState::Error;
            return Err(e.into());
        }
        Ok(data.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.set_timeout(timeout.max(MIN_READ_TIMEOUT))
            .map_err(|e| TransportError::Io(e.into()))?;

        let mut buf = vec![0u8; 256];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                debug!("Serial RX ({n} bytes): {:02X?}", &buf);
                Ok(buf)
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => {
                self.state = TransportState::Error;
                Err(e.into())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state == TransportState::Connected && self.port.is_some()
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn description(&self) -> String {
        format!("Serial({}@{})", self.port_name, self.baud_rate)
    }
}

// ---------------------------------------------------------------------------
// Network (TCP) transport
// ---------------------------------------------------------------------------

/// TCP transport for LAN-attached printers.
pub struct NetworkTransport {
    host: String,
    port: u16,
    connect_timeout_ms: u64,
    stream: Option<TcpStream>,
    state: TransportState,
}

impl NetworkTransport {
    pub fn new(host: &str, port: u16, connect_timeout_ms: u64) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout_ms,
            stream: None,
            state: TransportState::Disconnected,
        }
    }
}

impl Transport for NetworkTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.state = TransportState::Connecting;
        let target = format!("{}:{}", self.host, self.port);
        info!("Connecting TCP to {target}");

        let open_error = |reason: String| TransportError::Open {
            target: target.clone(),
            reason,
        };
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| open_error(e.to_string()))?
            .next()
            .ok_or_else(|| open_error("no address resolved".into()));
        let stream = addr.and_then(|addr| {
            TcpStream::connect_timeout(&addr, Duration::from_millis(self.connect_timeout_ms))
                .map_err(|e| open_error(e.to_string()))
        });
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                self.state = TransportState::Error;
                return Err(e);
            }
        };

        let _ = stream.set_write_timeout(Some(Duration::from_millis(5000)));
        let _ = stream.set_nodelay(true);

        self.stream = Some(stream);
        self.state = TransportState::Connected;
        info!("TCP connected to {target}");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(ref stream) = self.stream {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.stream = None;
        self.state = TransportState::Disconnected;
        info!("TCP disconnected from {}:{}", self.host, self.port);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        debug!("TCP TX ({} bytes): {:02X?}", data.len(), data);
        let result = stream.write_all(data).and_then(|()| stream.flush());
        if let Err(e) = result {
            self.state = TransportState::Error;
            return Err(e.into());
        }
        Ok(data.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;

        let mut buf = vec![0u8; 256];
        match stream.read(&mut buf) {
            Ok(0) => {
                warn!("TCP connection closed by peer");
                self.state = TransportState::Error;
                Err(TransportError::Closed)
            }
            Ok(n) => {
                buf.truncate(n);
                debug!("TCP RX ({n} bytes): {:02X?}", &buf);
                Ok(buf)
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(Vec::new())
            }
            Err(e) => {
                self.state = TransportState::Error;
                Err(e.into())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state == TransportState::Connected && self.stream.is_some()
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn description(&self) -> String {
        format!("TCP({}:{})", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Factory / enumeration
// ---------------------------------------------------------------------------

/// Build (but do not connect) the transport a config describes.
pub fn create_transport(config: &TransportConfig) -> Box<dyn Transport> {
    match config {
        TransportConfig::Serial {
            port,
            baud_rate,
            timeout_ms,
        } => Box::new(SerialTransport::new(port, *baud_rate, *timeout_ms)),
        TransportConfig::Network {
            ip,
            port,
            connect_timeout_ms,
        } => Box::new(NetworkTransport::new(ip, *port, *connect_timeout_ms)),
    }
}

/// A serial port visible on this system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub name: String,
    pub port_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// List available serial ports.
pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| TransportError::Io(e.into()))?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let mut info = PortInfo {
                name: p.port_name,
                port_type: "unknown",
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial_number: None,
            };
            match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    info.port_type = "usb";
                    info.vid = Some(usb.vid);
                    info.pid = Some(usb.pid);
                    info.manufacturer = usb.manufacturer;
                    info.product = usb.product;
                    info.serial_number = usb.serial_number;
                }
                serialport::SerialPortType::BluetoothPort => info.port_type = "bluetooth",
                serialport::SerialPortType::PciPort => info.port_type = "pci",
                serialport::SerialPortType::Unknown => {}
            }
            info
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
