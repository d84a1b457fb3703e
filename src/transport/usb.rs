//! USB Transportation.
use std::time::{Duration, Instant};

use anyhow::Result;
use rusb::{Context, DeviceHandle, UsbContext};

use super::{Transport, TransportError};
use crate::constants::{MAX_PACKET_SIZE, USB_PRODUCT_ID, USB_VENDOR_ID};

const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;

/// Size of the bulk endpoint buffer on the device. Reads are always done in this size.
const ENDPOINT_SIZE: usize = 64;

const WRITE_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbSettings {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for UsbSettings {
    fn default() -> Self {
        UsbSettings {
            vendor_id: USB_VENDOR_ID,
            product_id: USB_PRODUCT_ID,
        }
    }
}

/// Packets are framed as `[len][data...]` on a pair of bulk endpoints.
pub struct UsbTransport {
    settings: UsbSettings,
    device_handle: Option<DeviceHandle<Context>>,
    /// Bytes read from the endpoint but not yet consumed.
    pending: Vec<u8>,
}

impl UsbTransport {
    pub fn scan_devices(settings: UsbSettings) -> Result<usize> {
        let context = Context::new()?;

        let n = context
            .devices()?
            .iter()
            .filter(|device| {
                device
                    .device_descriptor()
                    .map(|desc| {
                        desc.vendor_id() == settings.vendor_id
                            && desc.product_id() == settings.product_id
                    })
                    .unwrap_or(false)
            })
            .enumerate()
            .map(|(i, device)| {
                log::debug!("Found bootloader USB device #{}: [{:?}]", i, device);
            })
            .count();
        Ok(n)
    }

    pub fn new(settings: UsbSettings) -> Self {
        UsbTransport {
            settings,
            device_handle: None,
            pending: Vec::new(),
        }
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>> {
        Ok(self
            .device_handle
            .as_ref()
            .ok_or(TransportError::NotConnected)?)
    }

    /// Read one byte, refilling the endpoint buffer when needed.
    fn read_byte(&mut self, deadline: Instant, timeout: Duration) -> Result<u8> {
        while self.pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(timeout).into());
            }
            let mut buf = [0u8; ENDPOINT_SIZE];
            let nread = match self.handle()?.read_bulk(ENDPOINT_IN, &mut buf, remaining) {
                Ok(n) => n,
                Err(rusb::Error::Timeout) => {
                    return Err(TransportError::Timeout(timeout).into());
                }
                Err(e) => return Err(e.into()),
            };
            self.pending.extend_from_slice(&buf[..nread]);
        }
        Ok(self.pending.remove(0))
    }
}

impl Transport for UsbTransport {
    fn connect(&mut self) -> Result<()> {
        let context = Context::new()?;
        let (vid, pid) = (self.settings.vendor_id, self.settings.product_id);

        let device = context
            .devices()?
            .iter()
            .find(|device| {
                device
                    .device_descriptor()
                    .map(|desc| desc.vendor_id() == vid && desc.product_id() == pid)
                    .unwrap_or(false)
            })
            .ok_or(anyhow::format_err!(
                "No bootloader USB device found({:04x}:{:04x} device not found)",
                vid,
                pid
            ))?;
        log::debug!("Found USB Device {:?}", device);

        let device_handle = device.open()?;

        let config = device.config_descriptor(0)?;

        let mut endpoint_out_found = false;
        let mut endpoint_in_found = false;
        if let Some(intf) = config.interfaces().next() {
            if let Some(desc) = intf.descriptors().next() {
                for endpoint in desc.endpoint_descriptors() {
                    if endpoint.address() == ENDPOINT_OUT {
                        endpoint_out_found = true;
                    }
                    if endpoint.address() == ENDPOINT_IN {
                        endpoint_in_found = true;
                    }
                }
            }
        }

        if !(endpoint_out_found && endpoint_in_found) {
            anyhow::bail!("USB Endpoints not found");
        }

        device_handle.claim_interface(0)?;

        self.pending.clear();
        self.device_handle = Some(device_handle);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(handle) = self.device_handle.take() {
            let _ = handle.release_interface(0);
        }
        self.pending.clear();
    }

    fn send_packet(&mut self, tx: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        assert!(tx.len() <= MAX_PACKET_SIZE, "packet exceeds transport buffer");

        if !tx.is_empty() {
            let mut raw = Vec::with_capacity(tx.len() + 1);
            raw.push(tx.len() as u8);
            raw.extend_from_slice(tx);
            self.handle()?.write_bulk(
                ENDPOINT_OUT,
                &raw,
                Duration::from_millis(WRITE_TIMEOUT_MS),
            )?;
        }

        let deadline = Instant::now() + timeout;
        let len = loop {
            let len = self.read_byte(deadline, timeout)?;
            if len > 0 {
                break len as usize;
            }
        };
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            data.push(self.read_byte(deadline, timeout)?);
        }
        Ok(data)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
