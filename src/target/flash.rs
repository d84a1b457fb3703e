//! Flash block manager.
//!
//! Byte writes are collected in RAM copies of aligned, fixed size flash blocks and only
//! programmed once a block is left or the session is finished. The block holding the
//! vector table (the boot block) gets its own buffer and is programmed exactly once, in
//! [`FlashBlockManager::done`], after [`FlashBlockManager::write_checksum`] patched the
//! checksum into it.
use scroll::{Endian, Pread, Pwrite};
use thiserror::Error;

use super::Watchdog;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("{len} bytes at {address:#010x} are not in flash range")]
    NotInRange { address: u32, len: u32 },
    #[error("block address {0:#010x} is not aligned to the write block size")]
    Misaligned(u32),
    #[error("address {0:#010x} is not inside any flash sector")]
    InvalidSector(u32),
    #[error("erasing the sector at {0:#010x} failed")]
    Erase(u32),
    #[error("programming at {0:#010x} failed")]
    Program(u32),
    #[error("read back of the block at {0:#010x} does not match")]
    Verify(u32),
    #[error("vector table checksum mismatch")]
    Checksum,
}

/// Erasable unit of the flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub start: u32,
    pub size: u32,
}

impl Sector {
    fn contains(&self, address: u32) -> bool {
        address >= self.start && u64::from(address) < u64::from(self.start) + u64::from(self.size)
    }
}

/// Sectors available to the user program, in ascending order. The first sector holds the
/// vector table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashLayout {
    sectors: Vec<Sector>,
}

impl FlashLayout {
    /// Panics if `sectors` is empty or not sorted.
    pub fn new(sectors: Vec<Sector>) -> Self {
        assert!(!sectors.is_empty(), "flash layout without sectors");
        assert!(
            sectors.windows(2).all(|w| w[0].start < w[1].start),
            "flash sectors must be in ascending order"
        );
        FlashLayout { sectors }
    }

    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    pub fn start(&self) -> u32 {
        self.sectors[0].start
    }

    /// Last address in flash.
    pub fn end(&self) -> u32 {
        let last = self.sectors[self.sectors.len() - 1];
        last.start + (last.size - 1)
    }

    pub fn sector_index(&self, address: u32) -> Option<usize> {
        self.sectors.iter().position(|s| s.contains(address))
    }

    pub fn contains(&self, address: u32, len: u32) -> bool {
        len > 0
            && address >= self.start()
            && u64::from(address) + u64::from(len) - 1 <= u64::from(self.end())
    }
}

/// Location of the vector table checksum and the words it covers, as offsets into the
/// boot block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumConfig {
    pub offset: u32,
    pub vector_offsets: Vec<u32>,
    pub byte_order: Endian,
}

impl ChecksumConfig {
    /// Two's complement of the sum of the first seven exception vectors, stored at 0x150.
    pub fn cortex_m() -> Self {
        ChecksumConfig {
            offset: 0x150,
            vector_offsets: (0..7).map(|i| i * 4).collect(),
            byte_order: Endian::Little,
        }
    }
}

/// Low level flash driver.
pub trait FlashDevice {
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    fn erase_sector(&mut self, sector: &Sector) -> Result<(), FlashError>;
    /// Program already erased memory.
    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Generic,
    Boot,
}

#[derive(Debug)]
struct Block {
    /// None while the block holds no data.
    base: Option<u32>,
    data: Vec<u8>,
}

pub struct FlashBlockManager<D, W> {
    device: D,
    watchdog: W,
    layout: FlashLayout,
    block_size: u32,
    checksum: ChecksumConfig,
    generic: Block,
    boot: Block,
}

impl<D: FlashDevice, W: Watchdog> FlashBlockManager<D, W> {
    /// Panics if the configuration is inconsistent: the layout must start on a block
    /// boundary and the checksum slot and vectors must lie in the first block.
    pub fn new(
        device: D,
        layout: FlashLayout,
        block_size: u32,
        checksum: ChecksumConfig,
        watchdog: W,
    ) -> Self {
        assert!(block_size > 0, "write block size must not be zero");
        assert!(
            layout.start() % block_size == 0,
            "flash start must be aligned to the write block size"
        );
        assert!(
            checksum
                .vector_offsets
                .iter()
                .chain(std::iter::once(&checksum.offset))
                .all(|&off| off.checked_add(4).is_some_and(|end| end <= block_size)),
            "checksum words must lie in the boot block"
        );
        let empty = || Block {
            base: None,
            data: vec![0xff; block_size as usize],
        };
        FlashBlockManager {
            device,
            watchdog,
            layout,
            block_size,
            checksum,
            generic: empty(),
            boot: empty(),
        }
    }

    /// Forget any buffered data.
    pub fn init(&mut self) {
        self.generic.base = None;
        self.boot.base = None;
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// Start of the user program, where the vector table lives.
    pub fn user_program_base(&self) -> u32 {
        self.layout.start()
    }

    fn boot_base(&self) -> u32 {
        self.layout.start()
    }

    fn align(&self, address: u32) -> u32 {
        address / self.block_size * self.block_size
    }

    fn block(&self, slot: Slot) -> &Block {
        match slot {
            Slot::Generic => &self.generic,
            Slot::Boot => &self.boot,
        }
    }

    fn block_mut(&mut self, slot: Slot) -> &mut Block {
        match slot {
            Slot::Generic => &mut self.generic,
            Slot::Boot => &mut self.boot,
        }
    }

    /// Buffer `data` for programming at `address`.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = u32::try_from(data.len()).map_err(|_| FlashError::NotInRange {
            address,
            len: u32::MAX,
        })?;
        if !self.layout.contains(address, len) {
            return Err(FlashError::NotInRange { address, len });
        }

        let base = self.align(address);
        let slot = if base == self.boot_base() {
            Slot::Boot
        } else {
            Slot::Generic
        };
        self.add_to_block(slot, address, data)
    }

    fn add_to_block(
        &mut self,
        mut slot: Slot,
        address: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        let block_size = self.block_size as usize;
        let mut base = self.align(address);

        if self.block(slot).base.is_none() {
            self.open_block(slot, base)?;
        }
        if self.block(slot).base != Some(base) {
            slot = self.switch_block(slot, base)?;
        }

        let mut offset = (address - base) as usize;
        let mut src = data;
        while !src.is_empty() {
            self.watchdog.service();
            if offset >= block_size {
                base += self.block_size;
                slot = self.switch_block(slot, base)?;
                offset = 0;
            }
            let cnt = (block_size - offset).min(src.len());
            self.block_mut(slot).data[offset..offset + cnt].copy_from_slice(&src[..cnt]);
            offset += cnt;
            src = &src[cnt..];
        }
        Ok(())
    }

    /// Leave the block in `from` for the one at `base`, returning the slot now in use.
    ///
    /// The boot block is never programmed here. A generic block is programmed when it is
    /// replaced by another generic block, but stays pending while the boot block is in use.
    fn switch_block(&mut self, from: Slot, base: u32) -> Result<Slot, FlashError> {
        let to = if base == self.boot_base() {
            Slot::Boot
        } else {
            Slot::Generic
        };
        if to == Slot::Generic {
            match self.generic.base {
                Some(pending) if pending != base => self.write_block(Slot::Generic)?,
                _ => (),
            }
        }
        log::trace!("switching from {:?} block to {:?} block at {:#010x}", from, to, base);
        self.open_block(to, base)?;
        Ok(to)
    }

    /// Load the current flash contents of the block at `base` into the buffer of `slot`.
    fn open_block(&mut self, slot: Slot, base: u32) -> Result<(), FlashError> {
        if base % self.block_size != 0 {
            return Err(FlashError::Misaligned(base));
        }
        if self.block(slot).base == Some(base) {
            return Ok(());
        }
        let mut data = std::mem::take(&mut self.block_mut(slot).data);
        let result = self.device.read(base, &mut data);
        let block = self.block_mut(slot);
        block.data = data;
        // A failed read leaves the buffer matching no block.
        block.base = result.is_ok().then_some(base);
        result
    }

    /// Program the block in `slot` and verify it by reading it back.
    fn write_block(&mut self, slot: Slot) -> Result<(), FlashError> {
        let Some(base) = self.block(slot).base else {
            return Ok(());
        };
        if base % self.block_size != 0 {
            return Err(FlashError::Misaligned(base));
        }
        log::debug!("programming {:?} block at {:#010x}", slot, base);
        self.watchdog.service();
        let data = std::mem::take(&mut self.block_mut(slot).data);
        let result = self.program_and_verify(base, &data);
        self.block_mut(slot).data = data;
        result
    }

    fn program_and_verify(&mut self, base: u32, data: &[u8]) -> Result<(), FlashError> {
        self.device.program(base, data)?;
        let mut readback = vec![0u8; data.len()];
        self.device.read(base, &mut readback)?;
        if readback != data {
            return Err(FlashError::Verify(base));
        }
        Ok(())
    }

    /// Erase every sector touched by `[address, address + len)`.
    pub fn erase(&mut self, address: u32, len: u32) -> Result<(), FlashError> {
        if len == 0 {
            return Err(FlashError::NotInRange { address, len });
        }
        let last_address = address
            .checked_add(len - 1)
            .ok_or(FlashError::NotInRange { address, len })?;
        let first = self
            .layout
            .sector_index(address)
            .ok_or(FlashError::InvalidSector(address))?;
        let last = self
            .layout
            .sector_index(last_address)
            .ok_or(FlashError::InvalidSector(last_address))?;
        assert!(first <= last, "invalid sector range {}..={}", first, last);

        for idx in first..=last {
            self.watchdog.service();
            let sector = self.layout.sectors[idx];
            log::debug!("erasing sector {} at {:#010x}", idx, sector.start);
            self.device.erase_sector(&sector)?;
        }
        Ok(())
    }

    fn vector_sum(&self, words: &[u8]) -> Result<u32, FlashError> {
        let mut sum = 0u32;
        for &off in &self.checksum.vector_offsets {
            let word: u32 = words
                .pread_with(off as usize, self.checksum.byte_order)
                .map_err(|_| FlashError::Checksum)?;
            sum = sum.wrapping_add(word);
        }
        Ok(sum)
    }

    /// Patch the vector table checksum into the boot block buffer.
    ///
    /// Nothing to do when the boot block was not written during this session.
    pub fn write_checksum(&mut self) -> Result<(), FlashError> {
        if self.boot.base.is_none() {
            return Ok(());
        }
        let checksum = self.vector_sum(&self.boot.data)?.wrapping_neg();
        let mut raw = [0u8; 4];
        raw.pwrite_with(checksum, 0, self.checksum.byte_order)
            .map_err(|_| FlashError::Checksum)?;
        log::debug!("vector table checksum {:#010x}", checksum);
        self.write(self.boot_base() + self.checksum.offset, &raw)
    }

    /// Check the programmed vector table against its checksum.
    pub fn verify_checksum(&mut self) -> Result<(), FlashError> {
        let mut words = vec![0u8; self.block_size as usize];
        self.device.read(self.boot_base(), &mut words)?;
        let checksum: u32 = words
            .pread_with(self.checksum.offset as usize, self.checksum.byte_order)
            .map_err(|_| FlashError::Checksum)?;
        if self.vector_sum(&words)?.wrapping_add(checksum) != 0 {
            return Err(FlashError::Checksum);
        }
        Ok(())
    }

    /// Program whatever is still buffered, the boot block first.
    pub fn done(&mut self) -> Result<(), FlashError> {
        for slot in [Slot::Boot, Slot::Generic] {
            self.write_block(slot)?;
            self.block_mut(slot).base = None;
        }
        Ok(())
    }
}
