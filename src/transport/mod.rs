//! Abstract Device transport interface.
use std::time::Duration;

use anyhow::Result;
use scroll::Endian;

use crate::protocol::{Command, Response};

pub use self::net::{NetSettings, NetTransport};
pub use self::serial::{SerialSettings, SerialTransport};
pub use self::usb::{UsbSettings, UsbTransport};

mod net;
mod serial;
mod usb;

/// Failures a transport reports, wrapped into the `anyhow::Error` it returns.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("transport is not connected")]
    NotConnected,
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

/// Returns true if `err` is a response timeout, as opposed to any other failure.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TransportError>(),
        Some(TransportError::Timeout(_))
    )
}

/// Abstraction of the transport layer.
/// Might be a serial port, USB bulk or TCP/IP.
///
/// A transport is initialized from its settings when constructed and released on drop.
pub trait Transport {
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self);

    /// Send a raw XCP packet and wait up to `timeout` for the response packet.
    ///
    /// An empty `tx` only receives, which is used to drain a stray response.
    fn send_packet(&mut self, tx: &[u8], timeout: Duration) -> Result<Vec<u8>>;

    fn transfer(&mut self, cmd: Command, order: Endian, timeout: Duration) -> Result<Response> {
        let req = cmd.into_raw(order)?;
        log::debug!("=> {}", hex::encode(&req));
        let resp = self.send_packet(&req, timeout)?;
        log::debug!("<= {}", hex::encode(&resp));
        Response::from_raw(&resp)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn send_packet(&mut self, tx: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        (**self).send_packet(tx, timeout)
    }
}

/// 8-bit sum of the length byte and the packet bytes, as used by the optional byte
/// checksum of the serial framing.
pub fn byte_checksum(len: u8, data: &[u8]) -> u8 {
    data.iter().fold(len, |acc, &val| acc.wrapping_add(val))
}
