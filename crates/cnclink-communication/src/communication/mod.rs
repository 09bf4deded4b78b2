//! Device transports
//!
//! A [`Transport`] carries raw lines and real-time bytes between the host
//! and one device. It is exclusively owned by one controller instance; the
//! controller's IO task is the only caller. Implementations here: the serial
//! adapter ([`serial::SerialTransport`]) and a discarding placeholder
//! ([`NoOpTransport`]) for backends under construction.

pub mod serial;

use cnclink_core::Result;
use serde::{Deserialize, Serialize};

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Connection parameters for a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1-2)
    pub stop_bits: u8,
    /// Parity setting
    pub parity: SerialParity,
    /// Hardware flow control
    pub flow_control: bool,
    /// Read timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: false,
            timeout_ms: 50,
        }
    }
}

/// Line-oriented device transport
///
/// `poll_lines` is non-blocking: it returns whatever complete lines arrived
/// since the last poll, assembling partial reads internally.
pub trait Transport: Send {
    /// Open the underlying connection
    fn open(&mut self) -> Result<()>;

    /// Close the underlying connection
    fn close(&mut self) -> Result<()>;

    /// Whether the connection is open
    fn is_open(&self) -> bool;

    /// Transmit one line; the transport appends the line terminator
    fn send_line(&mut self, line: &str) -> Result<()>;

    /// Transmit a single real-time byte, bypassing line framing
    fn send_realtime(&mut self, byte: u8) -> Result<()>;

    /// Complete lines received since the last poll, terminators stripped
    fn poll_lines(&mut self) -> Result<Vec<String>>;

    /// Human-readable description of the endpoint
    fn description(&self) -> String;
}

/// Transport that accepts everything and receives nothing
///
/// Stand-in while wiring up a new backend; also useful in tests that only
/// exercise the host side of a controller.
#[derive(Debug, Default)]
pub struct NoOpTransport {
    open: bool,
}

impl NoOpTransport {
    /// Create a closed no-op transport
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for NoOpTransport {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn send_line(&mut self, _line: &str) -> Result<()> {
        Ok(())
    }

    fn send_realtime(&mut self, _byte: u8) -> Result<()> {
        Ok(())
    }

    fn poll_lines(&mut self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn description(&self) -> String {
        "no-op".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_transport_tracks_open_state() {
        let mut transport = NoOpTransport::new();
        assert!(!transport.is_open());
        transport.open().unwrap();
        assert!(transport.is_open());
        transport.send_line("G0 X0").unwrap();
        transport.send_realtime(b'?').unwrap();
        assert!(transport.poll_lines().unwrap().is_empty());
        transport.close().unwrap();
        assert!(!transport.is_open());
    }

    #[test]
    fn default_params_are_grbl_friendly() {
        let params = ConnectionParams::default();
        assert_eq!(params.baud_rate, 115_200);
        assert_eq!(params.data_bits, 8);
        assert_eq!(params.stop_bits, 1);
        assert_eq!(params.parity, SerialParity::None);
    }
}
