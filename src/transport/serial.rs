//! Serial Transportation.
use std::{
    io::{ErrorKind, Read, Write},
    time::{Duration, Instant},
};

use anyhow::Result;
use serialport::SerialPort;

use super::{Transport, TransportError, byte_checksum};
use crate::constants::MAX_PACKET_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baudrate: u32,
    /// Append (and expect) a byte checksum after every packet.
    pub checksum: bool,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>) -> Self {
        SerialSettings {
            port: port.into(),
            baudrate: 57600,
            checksum: false,
        }
    }
}

/// Packets are framed as `[len][data...][checksum?]`.
pub struct SerialTransport {
    settings: SerialSettings,
    serial_port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn new(settings: SerialSettings) -> Self {
        SerialTransport {
            settings,
            serial_port: None,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        Ok(self
            .serial_port
            .as_mut()
            .ok_or(TransportError::NotConnected)?)
    }

    /// Read one byte, giving up once `deadline` has passed.
    fn read_byte(&mut self, deadline: Instant, timeout: Duration) -> Result<u8> {
        let port = self.port()?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout).into());
            }
            port.set_timeout(remaining)?;
            let mut byte = [0u8; 1];
            match port.read(&mut byte) {
                Ok(1) => return Ok(byte[0]),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout(timeout).into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "Opening serial port: \"{}\" @ {} baud",
            self.settings.port,
            self.settings.baudrate
        );
        let port = serialport::new(&self.settings.port, self.settings.baudrate)
            .timeout(Duration::from_millis(10))
            .open()?;
        self.serial_port = Some(port);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.serial_port = None;
    }

    fn send_packet(&mut self, tx: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        assert!(tx.len() <= MAX_PACKET_SIZE, "packet exceeds transport buffer");
        let checksum = self.settings.checksum;

        if !tx.is_empty() {
            let mut v = Vec::with_capacity(tx.len() + 2);
            v.push(tx.len() as u8);
            v.extend_from_slice(tx);
            if checksum {
                v.push(byte_checksum(tx.len() as u8, tx));
            }
            let port = self.port()?;
            port.write_all(&v)?;
            port.flush()?;
        }

        let deadline = Instant::now() + timeout;
        // The length byte of a packet is never zero, skip line noise until one arrives.
        let len = loop {
            let len = self.read_byte(deadline, timeout)?;
            if len > 0 {
                break len;
            }
        };
        let total = len as usize + usize::from(checksum);
        let mut data = Vec::with_capacity(total);
        while data.len() < total {
            data.push(self.read_byte(deadline, timeout)?);
        }
        if checksum {
            let cs = data.pop().unwrap_or_default();
            anyhow::ensure!(
                cs == byte_checksum(len, &data),
                TransportError::Malformed("packet checksum mismatch")
            );
        }
        Ok(data)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
