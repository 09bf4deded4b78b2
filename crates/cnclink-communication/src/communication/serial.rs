//! Serial port transport
//!
//! Low-level serial operations for direct hardware connection to CNC
//! controllers via USB or RS-232: port enumeration and discovery, baud/parity
//! configuration, and the line-assembling [`SerialTransport`].

use super::{ConnectionParams, SerialParity, Transport};
use cnclink_core::{ControllerError, Result};
use std::io::{Read, Write};
use std::time::Duration;

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port_name: String,
    /// Port description (e.g. "USB Serial Port")
    pub description: String,
    /// Manufacturer name if available
    pub manufacturer: Option<String>,
    /// Serial number if available
    pub serial_number: Option<String>,
    /// USB vendor ID if applicable
    pub vid: Option<u16>,
    /// USB product ID if applicable
    pub pid: Option<u16>,
}

/// List serial ports that look like CNC controllers
///
/// Filters the system's ports to the patterns hobby controllers show up as:
/// - Windows: `COM*`
/// - Linux: `/dev/ttyUSB*`, `/dev/ttyACM*`
/// - macOS: `/dev/cu.usbserial-*`, `/dev/cu.usbmodem*`
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| ControllerError::comm(format!("failed to enumerate ports: {}", e)))?;

    Ok(ports
        .iter()
        .filter(|port| is_cnc_port(&port.port_name))
        .map(|port| {
            let mut info = SerialPortInfo {
                port_name: port.port_name.clone(),
                description: port_description(port),
                manufacturer: None,
                serial_number: None,
                vid: None,
                pid: None,
            };
            if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                info.manufacturer = usb.manufacturer.clone();
                info.serial_number = usb.serial_number.clone();
            }
            info
        })
        .collect())
}

/// Check if a port name matches CNC controller patterns
fn is_cnc_port(port_name: &str) -> bool {
    if port_name.starts_with("COM") && port_name[3..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if port_name.starts_with("/dev/ttyUSB") || port_name.starts_with("/dev/ttyACM") {
        return true;
    }
    if port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem") {
        return true;
    }
    false
}

/// User-friendly description for a port
fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "USB {} {}",
            usb.manufacturer.as_deref().unwrap_or("Device"),
            usb.product.as_deref().unwrap_or("Serial Port")
        ),
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

fn to_serialport_parity(parity: SerialParity) -> serialport::Parity {
    match parity {
        SerialParity::None => serialport::Parity::None,
        SerialParity::Even => serialport::Parity::Even,
        SerialParity::Odd => serialport::Parity::Odd,
    }
}

/// Byte stream the transport runs over
pub trait ReadWrite: Read + Write + Send {}
impl<T: Read + Write + Send> ReadWrite for T {}

/// Serial transport with internal line assembly
///
/// Writes append `\n`; reads are buffered until a full line terminator
/// arrives, so [`Transport::poll_lines`] only ever yields complete lines
/// with terminators stripped.
pub struct SerialTransport {
    params: ConnectionParams,
    stream: Option<Box<dyn ReadWrite>>,
    pending: String,
}

impl SerialTransport {
    /// Create a transport for the given parameters; opened on demand
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            stream: None,
            pending: String::new(),
        }
    }

    /// Wrap an already-open byte stream (used by tests and loopbacks)
    pub fn from_stream(params: ConnectionParams, stream: Box<dyn ReadWrite>) -> Self {
        Self {
            params,
            stream: Some(stream),
            pending: String::new(),
        }
    }

    /// The configured connection parameters
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    fn open_native(&self) -> Result<Box<dyn ReadWrite>> {
        let params = &self.params;
        let builder = serialport::new(&params.port, params.baud_rate)
            .timeout(Duration::from_millis(params.timeout_ms))
            .data_bits(match params.data_bits {
                5 => serialport::DataBits::Five,
                6 => serialport::DataBits::Six,
                7 => serialport::DataBits::Seven,
                8 => serialport::DataBits::Eight,
                other => {
                    return Err(ControllerError::comm(format!(
                        "invalid data bits: {}",
                        other
                    )))
                }
            })
            .stop_bits(match params.stop_bits {
                1 => serialport::StopBits::One,
                2 => serialport::StopBits::Two,
                other => {
                    return Err(ControllerError::comm(format!(
                        "invalid stop bits: {}",
                        other
                    )))
                }
            })
            .parity(to_serialport_parity(params.parity))
            .flow_control(if params.flow_control {
                serialport::FlowControl::Hardware
            } else {
                serialport::FlowControl::None
            });

        match builder.open() {
            Ok(port) => Ok(Box::new(port)),
            Err(e) => {
                tracing::warn!("failed to open serial port {}: {}", params.port, e);
                Err(ControllerError::comm(format!(
                    "failed to open port {}: {}",
                    params.port, e
                )))
            }
        }
    }

    fn drain_pending(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.stream = Some(self.open_native()?);
        self.pending.clear();
        tracing::info!("opened serial port {}", self.params.port);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stream = None;
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ControllerError::comm("port not open"))?;
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        Ok(())
    }

    fn send_realtime(&mut self, byte: u8) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ControllerError::comm("port not open"))?;
        stream.write_all(&[byte])?;
        stream.flush()?;
        Ok(())
    }

    fn poll_lines(&mut self) -> Result<Vec<String>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ControllerError::comm("port not open"))?;

        let mut buf = [0u8; 512];
        match stream.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => self.pending.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.drain_pending())
    }

    fn description(&self) -> String {
        format!("serial:{}@{}", self.params.port, self.params.baud_rate)
    }
}
