//! The underlying binary protocol of the XCP bootloader

use std::fmt;

use anyhow::Result;
use bitfield::bitfield;
use scroll::{Endian, Pread, Pwrite};

use crate::constants::{commands, pid};

/// XCP Command, as sent from master to slave.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Command {
    /// Start a session. The response announces byte order and packet sizes.
    Connect { mode: u8 },
    /// Plain protocol disconnect. The loader ends sessions with `ProgramReset` instead.
    Disconnect,
    /// Read the session status and resource protection state.
    GetStatus,
    /// Request (part of) the seed for unlocking `resource`.
    ///
    /// `mode` 0 requests the first part, 1 the remaining parts.
    GetSeed { mode: u8, resource: u8 },
    /// Send (part of) the key. `remaining` is the number of key bytes still to be
    /// sent including the ones in `key`.
    Unlock { remaining: u8, key: Vec<u8> },
    /// Set the memory transfer address.
    SetMta { address: u32 },
    /// Read `len` bytes starting at the MTA, post-incrementing it.
    Upload { len: u8 },
    /// Enter the programming session.
    ProgramStart,
    /// Erase `len` bytes starting at the MTA.
    ProgramClear { len: u32 },
    /// Program the bytes at the MTA. An empty `data` marks the end of programming.
    Program { data: Vec<u8> },
    /// Reset the slave, which starts the user program when one is present.
    ///
    /// The slave might not respond before resetting.
    ProgramReset,
    /// Program exactly `max_prog_cto - 1` bytes at the MTA, without a length field.
    ProgramMax { data: Vec<u8> },
}

impl Command {
    pub fn connect(mode: u8) -> Self {
        Command::Connect { mode }
    }

    pub fn set_mta(address: u32) -> Self {
        Command::SetMta { address }
    }

    pub fn upload(len: u8) -> Self {
        Command::Upload { len }
    }

    pub fn program_clear(len: u32) -> Self {
        Command::ProgramClear { len }
    }

    pub fn program(data: &[u8]) -> Self {
        Command::Program {
            data: data.to_vec(),
        }
    }

    pub fn program_max(data: &[u8]) -> Self {
        Command::ProgramMax {
            data: data.to_vec(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "CONNECT",
            Command::Disconnect => "DISCONNECT",
            Command::GetStatus => "GET_STATUS",
            Command::GetSeed { .. } => "GET_SEED",
            Command::Unlock { .. } => "UNLOCK",
            Command::SetMta { .. } => "SET_MTA",
            Command::Upload { .. } => "UPLOAD",
            Command::ProgramStart => "PROGRAM_START",
            Command::ProgramClear { .. } => "PROGRAM_CLEAR",
            Command::Program { .. } => "PROGRAM",
            Command::ProgramReset => "PROGRAM_RESET",
            Command::ProgramMax { .. } => "PROGRAM_MAX",
        }
    }

    /// Serialize into a CTO packet. Multi-byte fields follow the slave's byte order.
    pub fn into_raw(self, order: Endian) -> Result<Vec<u8>> {
        match self {
            Command::Connect { mode } => Ok(vec![commands::CONNECT, mode]),
            Command::Disconnect => Ok(vec![commands::DISCONNECT]),
            Command::GetStatus => Ok(vec![commands::GET_STATUS]),
            Command::GetSeed { mode, resource } => Ok(vec![commands::GET_SEED, mode, resource]),
            Command::Unlock { remaining, key } => {
                let mut buf = Vec::with_capacity(2 + key.len());
                buf.push(commands::UNLOCK);
                buf.push(remaining);
                buf.extend(key);
                Ok(buf)
            }
            Command::SetMta { address } => {
                // CMD, RESERVED x2, ADDRESS EXTENSION, ADDRESS
                let mut buf = [commands::SET_MTA, 0, 0, 0, 0, 0, 0, 0];
                buf.pwrite_with(address, 4, order)?;
                Ok(buf.to_vec())
            }
            Command::Upload { len } => Ok(vec![commands::UPLOAD, len]),
            Command::ProgramStart => Ok(vec![commands::PROGRAM_START]),
            Command::ProgramClear { len } => {
                // CMD, MODE (absolute), RESERVED x2, LENGTH
                let mut buf = [commands::PROGRAM_CLEAR, 0, 0, 0, 0, 0, 0, 0];
                buf.pwrite_with(len, 4, order)?;
                Ok(buf.to_vec())
            }
            Command::Program { data } => {
                anyhow::ensure!(data.len() <= u8::MAX as usize, "program data too long");
                let mut buf = Vec::with_capacity(2 + data.len());
                buf.push(commands::PROGRAM);
                buf.push(data.len() as u8);
                buf.extend(data);
                Ok(buf)
            }
            Command::ProgramReset => Ok(vec![commands::PROGRAM_RESET]),
            Command::ProgramMax { data } => {
                let mut buf = Vec::with_capacity(1 + data.len());
                buf.push(commands::PROGRAM_MAX);
                buf.extend(data);
                Ok(buf)
            }
        }
    }
}

/// Response to a Command. The leading PID is omitted from the payload.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Response {
    /// PID = 0xFF
    Ok(Vec<u8>),
    /// PID = 0xFE, with the error code
    Err(u8, Vec<u8>),
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(data) => write!(f, "OK[{}]", hex::encode(data)),
            Response::Err(code, data) => write!(f, "ERROR({:x})[{}]", code, hex::encode(data)),
        }
    }
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Response::Ok(payload) => payload,
            Response::Err(_, payload) => payload,
        }
    }

    /// Length of the packet on the wire, PID included.
    pub fn packet_len(&self) -> usize {
        match self {
            Response::Ok(payload) => 1 + payload.len(),
            Response::Err(_, payload) => 2 + payload.len(),
        }
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        match raw.first() {
            None => anyhow::bail!("empty response packet"),
            Some(&pid::RES) => Ok(Response::Ok(raw[1..].to_vec())),
            Some(&pid::ERR) if raw.len() >= 2 => Ok(Response::Err(raw[1], raw[2..].to_vec())),
            Some(&other) => anyhow::bail!("invalid response PID 0x{:02x}", other),
        }
    }
}

bitfield! {
    /// COMM_MODE_BASIC byte of the CONNECT response.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct CommModeBasic(u8);
    impl Debug;
    u8;
    /// Set when the slave is big endian (Motorola).
    pub motorola, _: 0;
    pub address_granularity, _: 2, 1;
    pub slave_block_mode, _: 6;
    pub optional, _: 7;
}

impl CommModeBasic {
    pub fn byte_order(&self) -> Endian {
        if self.motorola() {
            Endian::Big
        } else {
            Endian::Little
        }
    }
}

/// Session parameters announced by the slave in its CONNECT response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo {
    pub resource: u8,
    pub comm_mode: CommModeBasic,
    pub max_cto: u8,
    pub max_dto: u16,
    pub protocol_version: u8,
    pub transport_version: u8,
}

impl ConnectInfo {
    /// Payload length of a CONNECT response, PID excluded.
    pub const PAYLOAD_LEN: usize = 7;

    /// Parse a CONNECT response payload.
    ///
    /// The byte order flag is taken from this very packet and then used to decode the
    /// MAX_DTO field that follows it.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        anyhow::ensure!(
            payload.len() == Self::PAYLOAD_LEN,
            "CONNECT response has {} payload bytes, expected {}",
            payload.len(),
            Self::PAYLOAD_LEN
        );
        let comm_mode = CommModeBasic(payload[1]);
        let max_dto = payload.pread_with::<u16>(3, comm_mode.byte_order())?;
        Ok(ConnectInfo {
            resource: payload[0],
            comm_mode,
            max_cto: payload[2],
            max_dto,
            protocol_version: payload[5],
            transport_version: payload[6],
        })
    }

    pub fn byte_order(&self) -> Endian {
        self.comm_mode.byte_order()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_mta_follows_byte_order() {
        let raw = Command::set_mta(0x0800_6000)
            .into_raw(Endian::Little)
            .unwrap();
        assert_eq!(raw, [0xf6, 0, 0, 0, 0x00, 0x60, 0x00, 0x08]);

        let raw = Command::set_mta(0x0800_6000).into_raw(Endian::Big).unwrap();
        assert_eq!(raw, [0xf6, 0, 0, 0, 0x08, 0x00, 0x60, 0x00]);
    }

    #[test]
    fn program_clear_layout() {
        let raw = Command::program_clear(0x1234).into_raw(Endian::Big).unwrap();
        assert_eq!(raw, [0xd1, 0, 0, 0, 0, 0, 0x12, 0x34]);
    }

    #[test]
    fn program_carries_length_and_program_max_does_not() {
        let raw = Command::program(&[1, 2, 3]).into_raw(Endian::Little).unwrap();
        assert_eq!(raw, [0xd0, 3, 1, 2, 3]);

        let raw = Command::program_max(&[1, 2, 3]).into_raw(Endian::Little).unwrap();
        assert_eq!(raw, [0xc9, 1, 2, 3]);

        let raw = Command::program(&[]).into_raw(Endian::Little).unwrap();
        assert_eq!(raw, [0xd0, 0]);
    }

    #[test]
    fn connect_response_decodes_dto_in_announced_order() {
        // Intel slave: MAX_DTO 0x0108 stored LSB first.
        let intel = ConnectInfo::parse(&[0x10, 0x00, 0x40, 0x08, 0x01, 0x01, 0x01]).unwrap();
        assert_eq!(intel.byte_order(), Endian::Little);
        assert_eq!(intel.max_cto, 0x40);
        assert_eq!(intel.max_dto, 0x0108);

        // Motorola slave: the same bytes now read MSB first.
        let motorola = ConnectInfo::parse(&[0x10, 0x01, 0x40, 0x08, 0x01, 0x01, 0x01]).unwrap();
        assert_eq!(motorola.byte_order(), Endian::Big);
        assert_eq!(motorola.max_dto, 0x0801);
    }

    #[test]
    fn connect_response_with_wrong_length_is_rejected() {
        assert!(ConnectInfo::parse(&[0x10, 0x00, 0x40]).is_err());
    }

    #[test]
    fn response_pid_handling() {
        assert!(Response::from_raw(&[]).is_err());
        assert!(Response::from_raw(&[0x12, 0x00]).is_err());

        let ok = Response::from_raw(&[0xff, 0xaa]).unwrap();
        assert!(ok.is_ok());
        assert_eq!(ok.payload(), &[0xaa]);
        assert_eq!(ok.packet_len(), 2);

        let err = Response::from_raw(&[0xfe, 0x20]).unwrap();
        assert!(!err.is_ok());
        assert_eq!(format!("{:?}", err), "ERROR(20)[]");
    }
}
