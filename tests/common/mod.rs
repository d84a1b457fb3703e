#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use scroll::{Endian, Pread, Pwrite};

use xcpflash::constants::{commands, pid};
use xcpflash::loader::{LoaderSettings, XcpLoader};
use xcpflash::target::{ChecksumConfig, FlashBlockManager, FlashDevice, FlashError, FlashLayout, Sector};
use xcpflash::transport::{Transport, TransportError};

pub const OK: &[u8] = &[pid::RES];

static COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn temp_dir(prefix: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut dir = std::env::temp_dir();
    dir.push(format!("xcpflash_{prefix}_{}_{}", std::process::id(), id));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub enum Reply {
    Packet(Vec<u8>),
    Timeout,
}

/// Transport answering from a script, recording every request.
#[derive(Default)]
pub struct MockTransport {
    pub replies: VecDeque<Reply>,
    pub requests: Vec<Vec<u8>>,
    pub timeouts: Vec<Duration>,
    pub connects: usize,
    pub disconnects: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, packet: &[u8]) -> Self {
        self.replies.push_back(Reply::Packet(packet.to_vec()));
        self
    }

    pub fn timeout(mut self) -> Self {
        self.replies.push_back(Reply::Timeout);
        self
    }

    /// Scripted CONNECT and GET_STATUS exchange of an unprotected slave.
    pub fn connected(max_cto: u8, max_dto: u16) -> Self {
        Self::new()
            .reply(&connect_response(max_cto, max_dto, Endian::Little))
            .reply(&status_response(0))
    }

    /// Requests starting with `opcode`.
    pub fn sent(&self, opcode: u8) -> Vec<&Vec<u8>> {
        self.requests.iter().filter(|r| r.first() == Some(&opcode)).collect()
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> Result<()> {
        self.connects += 1;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
    }

    fn send_packet(&mut self, tx: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.requests.push(tx.to_vec());
        self.timeouts.push(timeout);
        match self.replies.pop_front() {
            Some(Reply::Packet(packet)) => Ok(packet),
            Some(Reply::Timeout) | None => Err(TransportError::Timeout(timeout).into()),
        }
    }
}

pub fn connect_response(max_cto: u8, max_dto: u16, order: Endian) -> Vec<u8> {
    let comm_mode = if order.is_little() { 0x00 } else { 0x01 };
    let mut raw = vec![pid::RES, 0x10, comm_mode, max_cto, 0, 0, 0x01, 0x01];
    raw.pwrite_with(max_dto, 4, order).unwrap();
    raw
}

pub fn status_response(protection: u8) -> Vec<u8> {
    vec![pid::RES, 0x00, protection, 0x00, 0x00, 0x00]
}

pub fn program_start_response(max_prog_cto: u8) -> Vec<u8> {
    vec![pid::RES, 0x00, 0x00, max_prog_cto, 0x00, 0x00, 0x00]
}

pub fn loader<T: Transport>(transport: T) -> XcpLoader<T> {
    XcpLoader::new(transport, LoaderSettings::default())
}

/// RAM backed flash. Programming can only clear bits, like the real thing.
pub struct SimFlash {
    pub start: u32,
    pub mem: Vec<u8>,
    /// Address and length of every program call.
    pub programs: Vec<(u32, usize)>,
    /// Start of every erased sector.
    pub erases: Vec<u32>,
}

impl SimFlash {
    pub fn new(start: u32, size: usize) -> Self {
        SimFlash {
            start,
            mem: vec![0xff; size],
            programs: vec![],
            erases: vec![],
        }
    }

    fn range(&self, address: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let off = address.checked_sub(self.start)? as usize;
        (off + len <= self.mem.len()).then_some(off..off + len)
    }

    pub fn bytes(&self, address: u32, len: usize) -> &[u8] {
        let range = self.range(address, len).unwrap();
        &self.mem[range]
    }
}

impl FlashDevice for SimFlash {
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(address, buf.len()).ok_or(FlashError::NotInRange {
            address,
            len: buf.len() as u32,
        })?;
        buf.copy_from_slice(&self.mem[range]);
        Ok(())
    }

    fn erase_sector(&mut self, sector: &Sector) -> Result<(), FlashError> {
        let range = self
            .range(sector.start, sector.size as usize)
            .ok_or(FlashError::Erase(sector.start))?;
        self.erases.push(sector.start);
        self.mem[range].fill(0xff);
        Ok(())
    }

    fn program(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let range = self.range(address, data.len()).ok_or(FlashError::Program(address))?;
        self.programs.push((address, data.len()));
        for (cell, &byte) in self.mem[range].iter_mut().zip(data) {
            *cell &= byte;
        }
        Ok(())
    }
}

/// Four 1K sectors at 0x8000 in 256 byte blocks, checksum of three vectors at 0x40.
pub fn small_layout() -> (FlashLayout, ChecksumConfig) {
    let layout = FlashLayout::new(
        (0..4)
            .map(|i| Sector {
                start: 0x8000 + i * 0x400,
                size: 0x400,
            })
            .collect(),
    );
    let checksum = ChecksumConfig {
        offset: 0x40,
        vector_offsets: vec![0x00, 0x04, 0x08],
        byte_order: Endian::Little,
    };
    (layout, checksum)
}

pub type SimManager = FlashBlockManager<SimFlash, fn()>;

pub fn sim_manager() -> SimManager {
    let (layout, checksum) = small_layout();
    FlashBlockManager::new(SimFlash::new(0x8000, 0x1000), layout, 0x100, checksum, (|| {}) as fn())
}

/// A bootloader running the command set on top of a [`SimManager`], reachable as a
/// transport.
pub struct SimSlave {
    pub manager: SimManager,
    pub order: Endian,
    pub max_cto: u8,
    pub max_dto: u16,
    pub max_prog_cto: u8,
    pub mta: u32,
    pub resets: usize,
    pub commands: Vec<u8>,
    /// Answer PROGRAM_RESET instead of going silent.
    pub ack_reset: bool,
}

impl SimSlave {
    pub fn new(manager: SimManager, order: Endian) -> Self {
        SimSlave {
            manager,
            order,
            max_cto: 8,
            max_dto: 8,
            max_prog_cto: 8,
            mta: 0,
            resets: 0,
            commands: vec![],
            ack_reset: false,
        }
    }

    fn handle(&mut self, cmd: &[u8]) -> Result<Vec<u8>, u8> {
        const ERR_CMD_SYNTAX: u8 = 0x21;
        const ERR_OUT_OF_RANGE: u8 = 0x22;
        const ERR_GENERIC: u8 = 0x31;

        let opcode = *cmd.first().ok_or(ERR_CMD_SYNTAX)?;
        self.commands.push(opcode);
        let flash_err = |e: FlashError| match e {
            FlashError::NotInRange { .. } | FlashError::InvalidSector(_) => ERR_OUT_OF_RANGE,
            _ => ERR_GENERIC,
        };
        match opcode {
            commands::CONNECT => Ok(connect_response(self.max_cto, self.max_dto, self.order)),
            commands::GET_STATUS => Ok(status_response(0)),
            commands::SET_MTA => {
                self.mta = cmd.pread_with(4, self.order).map_err(|_| ERR_CMD_SYNTAX)?;
                Ok(OK.to_vec())
            }
            commands::UPLOAD => {
                let len = usize::from(*cmd.get(1).ok_or(ERR_CMD_SYNTAX)?);
                let mut resp = vec![0; len + 1];
                resp[0] = pid::RES;
                self.manager
                    .device_mut()
                    .read(self.mta, &mut resp[1..])
                    .map_err(flash_err)?;
                self.mta += len as u32;
                Ok(resp)
            }
            commands::PROGRAM_START => Ok(program_start_response(self.max_prog_cto)),
            commands::PROGRAM_CLEAR => {
                let len: u32 = cmd.pread_with(4, self.order).map_err(|_| ERR_CMD_SYNTAX)?;
                self.manager.erase(self.mta, len).map_err(flash_err)?;
                Ok(OK.to_vec())
            }
            commands::PROGRAM => {
                let len = usize::from(*cmd.get(1).ok_or(ERR_CMD_SYNTAX)?);
                if len == 0 {
                    self.manager.write_checksum().map_err(flash_err)?;
                    self.manager.done().map_err(flash_err)?;
                } else {
                    let data = cmd.get(2..2 + len).ok_or(ERR_CMD_SYNTAX)?;
                    self.manager.write(self.mta, data).map_err(flash_err)?;
                    self.mta += len as u32;
                }
                Ok(OK.to_vec())
            }
            commands::PROGRAM_MAX => {
                let data = &cmd[1..];
                if data.len() != usize::from(self.max_prog_cto) - 1 {
                    return Err(ERR_CMD_SYNTAX);
                }
                self.manager.write(self.mta, data).map_err(flash_err)?;
                self.mta += data.len() as u32;
                Ok(OK.to_vec())
            }
            _ => Err(ERR_CMD_SYNTAX),
        }
    }
}

impl Transport for SimSlave {
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn send_packet(&mut self, tx: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        if tx.first() == Some(&commands::PROGRAM_RESET) {
            self.commands.push(commands::PROGRAM_RESET);
            self.resets += 1;
            self.manager.init();
            if self.ack_reset {
                return Ok(OK.to_vec());
            }
            return Err(TransportError::Timeout(timeout).into());
        }
        match self.handle(tx) {
            Ok(resp) => Ok(resp),
            Err(code) => Ok(vec![pid::ERR, code]),
        }
    }
}
