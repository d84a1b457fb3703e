//! Firmware file formats
use std::fmt::Write as _;
use std::path::Path;
use std::str;

use anyhow::Result;
use object::{
    Endianness,
    elf::{FileHeader32, PT_LOAD},
    read::elf::{FileHeader, ProgramHeader},
};
use thiserror::Error;

use crate::firmware::FirmwareData;

/// Data bytes per S-record line written by [`write_srec`].
const SREC_BYTES_PER_LINE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    SRecord,
    IntelHex,
    ELF,
    Binary,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    InvalidRecord { line: usize, message: String },
    #[error("line {line}: checksum mismatch, expected {expected:02X} but found {actual:02X}")]
    ChecksumMismatch {
        line: usize,
        expected: u8,
        actual: u8,
    },
    #[error("line {line}: invalid hex digit {digit:?}")]
    InvalidHexDigit { line: usize, digit: char },
    #[error("line {line}: unsupported record type S{record_type}")]
    UnsupportedRecordType { line: usize, record_type: char },
}

/// Load a firmware file. Raw binaries are placed at `bin_base`.
pub fn read_firmware_from_file<P: AsRef<Path>>(path: P, bin_base: u32) -> Result<FirmwareData> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;
    anyhow::ensure!(!raw.is_empty(), "{} is empty", p.display());

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    let firmware = match format {
        FirmwareFormat::SRecord => parse_srec(&raw)?,
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?)?,
        FirmwareFormat::ELF => read_elf(&raw)?,
        FirmwareFormat::Binary => {
            let mut firmware = FirmwareData::new();
            firmware.add_data(bin_base, &raw)?;
            firmware
        }
    };
    log::debug!(
        "{} segment(s), {} bytes in total",
        firmware.segment_count(),
        firmware.total_len()
    );
    Ok(firmware)
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["srec", "s19", "s28", "s37", "mot", "sx"].contains(&&*ext) {
        return FirmwareFormat::SRecord;
    }
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    let is_text = |c: u8| (c as char).is_ascii_alphanumeric() || c == b'\n' || c == b'\r';
    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::ELF
    } else if raw.len() >= 2
        && raw[0] == b'S'
        && raw[1].is_ascii_digit()
        && raw.iter().all(|&c| is_text(c))
    {
        FirmwareFormat::SRecord
    } else if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Parse Motorola S-records. Any malformed line aborts the whole load.
pub fn parse_srec(data: &[u8]) -> Result<FirmwareData, ParseError> {
    let mut firmware = FirmwareData::new();

    for (idx, line) in data.split(|&b| b == b'\n').enumerate() {
        let line_no = idx + 1;
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        let invalid = |message: &str| ParseError::InvalidRecord {
            line: line_no,
            message: message.to_string(),
        };
        if line.len() < 4 || !matches!(line[0], b'S' | b's') {
            return Err(invalid("not an S-record"));
        }

        let record_type = line[1] as char;
        let bytes = decode_hex(&line[2..], line_no)?;
        let (&count, body) = bytes.split_first().ok_or_else(|| invalid("missing byte count"))?;
        if body.len() != count as usize {
            return Err(invalid(&format!(
                "byte count {} does not match the {} bytes on the line",
                count,
                body.len()
            )));
        }
        let (&actual, _) = body.split_last().ok_or_else(|| invalid("missing checksum"))?;
        let expected = srec_checksum(&bytes[..bytes.len() - 1]);
        if actual != expected {
            return Err(ParseError::ChecksumMismatch {
                line: line_no,
                expected,
                actual,
            });
        }

        let addr_len = match record_type {
            '1' => 2,
            '2' => 3,
            '3' => 4,
            '0' | '5' | '7' | '8' | '9' => continue,
            other => {
                return Err(ParseError::UnsupportedRecordType {
                    line: line_no,
                    record_type: other,
                });
            }
        };
        // Body is address, data and the trailing checksum.
        if body.len() < addr_len + 1 {
            return Err(invalid("record too short for its address"));
        }
        let address = body[..addr_len]
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        let payload = &body[addr_len..body.len() - 1];
        if !payload.is_empty() {
            firmware
                .add_data(address, payload)
                .map_err(|e| invalid(&e.to_string()))?;
        }
    }

    Ok(firmware)
}

/// Serialize as S-records. The record type is picked from the highest address.
pub fn write_srec(firmware: &FirmwareData) -> String {
    let max = firmware.max_address().unwrap_or(0).saturating_sub(1);
    let (addr_len, data_type, term_type) = if max <= 0xffff {
        (2, '1', '9')
    } else if max <= 0xff_ffff {
        (3, '2', '8')
    } else {
        (4, '3', '7')
    };

    let mut out = String::new();
    for segment in firmware.segments() {
        let mut address = segment.base;
        for chunk in segment.data.chunks(SREC_BYTES_PER_LINE) {
            push_srec_line(&mut out, data_type, addr_len, address, chunk);
            address = address.wrapping_add(chunk.len() as u32);
        }
    }
    push_srec_line(&mut out, term_type, addr_len, 0, &[]);
    out
}

fn push_srec_line(out: &mut String, record_type: char, addr_len: usize, address: u32, data: &[u8]) {
    let mut record = Vec::with_capacity(1 + addr_len + data.len());
    record.push((addr_len + data.len() + 1) as u8);
    record.extend_from_slice(&address.to_be_bytes()[4 - addr_len..]);
    record.extend_from_slice(data);
    let checksum = srec_checksum(&record);

    out.push('S');
    out.push(record_type);
    for byte in record {
        let _ = write!(out, "{:02X}", byte);
    }
    let _ = writeln!(out, "{:02X}", checksum);
}

/// One's complement of the sum of count, address and data bytes.
fn srec_checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn decode_hex(digits: &[u8], line: usize) -> Result<Vec<u8>, ParseError> {
    if let Some(&bad) = digits.iter().find(|c| !c.is_ascii_hexdigit()) {
        return Err(ParseError::InvalidHexDigit {
            line,
            digit: bad as char,
        });
    }
    hex::decode(digits).map_err(|_| ParseError::InvalidRecord {
        line,
        message: "odd number of hex digits".to_string(),
    })
}

pub fn read_ihex(data: &str) -> Result<FirmwareData> {
    use ihex::Record;

    let mut base_address = 0;
    let mut firmware = FirmwareData::new();
    for record in ihex::Reader::new(data) {
        let record = record?;
        use Record::*;
        match record {
            Data { offset, value } => {
                firmware.add_data(base_address + offset as u32, &value)?;
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    Ok(firmware)
}

/// Collect the loadable program headers of an ELF32 file at their physical addresses.
pub fn read_elf(elf_data: &[u8]) -> Result<FirmwareData> {
    let file_kind = object::FileKind::parse(elf_data)?;

    match file_kind {
        object::FileKind::Elf32 => (),
        _ => anyhow::bail!("cannot read file as ELF32 format"),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
    let endian = elf_header.endian()?;

    let mut firmware = FirmwareData::new();
    for segment in elf_header.program_headers(endian, elf_data)? {
        if segment.p_type(endian) != PT_LOAD {
            continue;
        }
        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| anyhow::format_err!("Failed to access data for an ELF segment."))?;
        if segment_data.is_empty() {
            continue;
        }
        let p_paddr = segment.p_paddr(endian);
        log::info!(
            "Found loadable segment, physical address: {:#010x}, size: {:#x}",
            p_paddr,
            segment_data.len()
        );
        firmware.add_data(p_paddr, segment_data)?;
    }

    if firmware.is_empty() {
        anyhow::bail!("empty ELF file");
    }
    Ok(firmware)
}
