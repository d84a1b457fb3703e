//! Firmware update session logic.

use anyhow::{Context, Result};

use crate::{
    firmware::FirmwareData,
    loader::{LoaderSettings, XcpLoader},
    transport::{NetSettings, NetTransport, SerialSettings, SerialTransport, Transport, UsbSettings, UsbTransport},
};

/// Runs complete bootloader sessions: every public operation connects, does its work and
/// ends with a PROGRAM_RESET so the user program starts again.
pub struct Flashing<T: Transport> {
    loader: XcpLoader<T>,
}

impl Flashing<Box<dyn Transport>> {
    pub fn new_from_serial(settings: SerialSettings, loader_settings: LoaderSettings) -> Self {
        log::debug!("Using serial port {} at {} baud", settings.port, settings.baudrate);
        Self::new(XcpLoader::new(Box::new(SerialTransport::new(settings)), loader_settings))
    }

    pub fn new_from_usb(settings: UsbSettings, loader_settings: LoaderSettings) -> Result<Self> {
        let n = UsbTransport::scan_devices(settings)?;
        anyhow::ensure!(
            n > 0,
            "No bootloader found on USB ({:04x}:{:04x})",
            settings.vendor_id,
            settings.product_id
        );
        if n > 1 {
            log::warn!("Found {} bootloaders on USB, using the first one", n);
        }
        Ok(Self::new(XcpLoader::new(Box::new(UsbTransport::new(settings)), loader_settings)))
    }

    pub fn new_from_net(settings: NetSettings, loader_settings: LoaderSettings) -> Self {
        log::debug!("Using TCP {}:{}", settings.address, settings.port);
        Self::new(XcpLoader::new(Box::new(NetTransport::new(settings)), loader_settings))
    }
}

impl<T: Transport> Flashing<T> {
    pub fn new(loader: XcpLoader<T>) -> Self {
        Flashing { loader }
    }

    pub fn loader(&self) -> &XcpLoader<T> {
        &self.loader
    }

    pub fn into_loader(self) -> XcpLoader<T> {
        self.loader
    }

    /// Connect and report the negotiated session parameters.
    pub fn dump_info(&mut self) -> Result<()> {
        self.session(|loader| {
            let Some(session) = loader.session() else {
                anyhow::bail!("not connected to the bootloader");
            };
            log::info!(
                "Byte order: {}",
                if session.byte_order.is_little() { "little endian" } else { "big endian" }
            );
            log::info!("Max CTO: {} bytes", session.max_cto);
            log::info!("Max DTO: {} bytes", session.max_dto);
            loader.start_programming_session()?;
            if let Some(session) = loader.session() {
                log::info!("Max programming CTO: {} bytes", session.max_prog_cto);
            }
            loader.stop_programming_session()
        })
    }

    /// Erase and program every segment of `firmware`.
    ///
    /// `progress` is called with the number of bytes of every programmed chunk.
    pub fn download<F>(&mut self, firmware: &FirmwareData, progress: F) -> Result<()>
    where
        F: FnMut(usize),
    {
        self.session(|loader| program_image(loader, firmware, progress))?;
        log::info!("Downloaded {} bytes", firmware.total_len());
        Ok(())
    }

    /// Like [`Self::download`], reading the image back before the session ends.
    pub fn download_and_verify<F>(&mut self, firmware: &FirmwareData, progress: F) -> Result<()>
    where
        F: FnMut(usize),
    {
        self.session(|loader| {
            program_image(loader, firmware, progress)?;
            compare_image(loader, firmware)
        })?;
        log::info!("Downloaded and verified {} bytes", firmware.total_len());
        Ok(())
    }

    /// Read back every segment of `firmware` and compare.
    pub fn verify(&mut self, firmware: &FirmwareData) -> Result<()> {
        self.session(|loader| compare_image(loader, firmware))?;
        log::info!("Verify OK");
        Ok(())
    }

    pub fn erase(&mut self, address: u32, len: u32) -> Result<()> {
        self.session(|loader| {
            loader.start_programming_session()?;
            loader.clear_memory(address, len)?;
            loader.stop_programming_session()
        })?;
        log::info!("Erased {} bytes at 0x{:08x}", len, address);
        Ok(())
    }

    pub fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.session(|loader| loader.read_data(address, &mut buf))?;
        Ok(buf)
    }

    /// Connect and immediately reset into the user program.
    pub fn reset(&mut self) -> Result<()> {
        self.session(|_| Ok(()))
    }

    /// Connect, run `f` and disconnect. On failure the transport is closed without the
    /// reset, leaving the slave in its bootloader.
    fn session<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut XcpLoader<T>) -> Result<R>,
    {
        self.loader.connect()?;
        match f(&mut self.loader) {
            Ok(r) => {
                self.loader.disconnect()?;
                Ok(r)
            }
            Err(e) => {
                self.loader.abort();
                Err(e)
            }
        }
    }
}

fn program_image<T, F>(loader: &mut XcpLoader<T>, firmware: &FirmwareData, mut progress: F) -> Result<()>
where
    T: Transport,
    F: FnMut(usize),
{
    anyhow::ensure!(!firmware.is_empty(), "firmware image is empty");
    loader.start_programming_session()?;
    for segment in firmware.segments() {
        let len = segment.len() as u32;
        log::debug!("Erasing {} bytes at 0x{:08x}", len, segment.base);
        loader
            .clear_memory(segment.base, len)
            .with_context(|| format!("erasing 0x{:08x}..0x{:08x}", segment.base, segment.end()))?;
        log::debug!("Programming {} bytes at 0x{:08x}", len, segment.base);
        loader
            .program_data_with_progress(segment.base, &segment.data, &mut progress)
            .with_context(|| format!("programming 0x{:08x}..0x{:08x}", segment.base, segment.end()))?;
    }
    loader.stop_programming_session()
}

fn compare_image<T: Transport>(loader: &mut XcpLoader<T>, firmware: &FirmwareData) -> Result<()> {
    for segment in firmware.segments() {
        let mut buf = vec![0; segment.len()];
        loader.read_data(segment.base, &mut buf)?;
        if let Some(pos) = buf.iter().zip(&segment.data).position(|(a, b)| a != b) {
            anyhow::bail!(
                "Verify failed at 0x{:08x}: expected 0x{:02x}, read 0x{:02x}",
                segment.base + pos as u32,
                segment.data[pos],
                buf[pos]
            );
        }
    }
    Ok(())
}
