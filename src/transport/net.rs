//! TCP/IP Transportation.
use std::{
    io::{ErrorKind, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};

use anyhow::Result;
use scroll::{LE, Pread};

use super::{Transport, TransportError};
use crate::constants::{MAX_PACKET_SIZE, NET_DEFAULT_PORT};

const CONNECT_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetSettings {
    pub address: String,
    pub port: u16,
}

impl NetSettings {
    pub fn new(address: impl Into<String>) -> Self {
        NetSettings {
            address: address.into(),
            port: NET_DEFAULT_PORT,
        }
    }
}

/// Every command is prefixed with a 32-bit CRO counter, every response with a DTO
/// counter.
pub struct NetTransport {
    settings: NetSettings,
    stream: Option<TcpStream>,
    /// Starts at 1 for each new connection.
    cro_counter: u32,
}

impl NetTransport {
    pub fn new(settings: NetSettings) -> Self {
        NetTransport {
            settings,
            stream: None,
            cro_counter: 1,
        }
    }
}

impl Transport for NetTransport {
    fn connect(&mut self) -> Result<()> {
        let addr = (self.settings.address.as_str(), self.settings.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::format_err!("cannot resolve {}", self.settings.address))?;
        log::info!("Connecting to {}", addr);
        let stream =
            TcpStream::connect_timeout(&addr, Duration::from_millis(CONNECT_TIMEOUT_MS))?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.cro_counter = 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn send_packet(&mut self, tx: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        assert!(tx.len() <= MAX_PACKET_SIZE, "packet exceeds transport buffer");
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;

        if !tx.is_empty() {
            let mut raw = Vec::with_capacity(tx.len() + 4);
            raw.extend_from_slice(&self.cro_counter.to_le_bytes());
            raw.extend_from_slice(tx);
            self.cro_counter = self.cro_counter.wrapping_add(1);
            stream.write_all(&raw)?;
        }

        stream.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; MAX_PACKET_SIZE + 4];
        let nread = match stream.read(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(TransportError::Timeout(timeout).into());
            }
            Err(e) => return Err(e.into()),
        };
        anyhow::ensure!(
            nread > 4,
            TransportError::Malformed("response shorter than its DTO counter")
        );
        let dto_counter: u32 = buf.pread_with(0, LE)?;
        log::trace!("DTO counter {}", dto_counter);
        Ok(buf[4..nread].to_vec())
    }
}

impl Drop for NetTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
