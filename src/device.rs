//! Target MCU definitions: flash layout and vector table checksum of each supported device
use std::fmt;

use anyhow::Result;
use scroll::Endian;
use serde::{Deserialize, Serialize};

use crate::firmware::FirmwareData;
use crate::target::{ChecksumConfig, FlashBlockManager, FlashDevice, FlashLayout, Sector, Watchdog};

/// Byte order of the words in the vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordOrder {
    #[default]
    Little,
    Big,
}

impl From<WordOrder> for Endian {
    fn from(order: WordOrder) -> Self {
        match order {
            WordOrder::Little => Endian::Little,
            WordOrder::Big => Endian::Big,
        }
    }
}

/// `count` equally sized sectors starting at `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectorRun {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub start: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub size: u32,
    #[serde(default = "one")]
    pub count: u32,
}

fn one() -> u32 {
    1
}

/// MCU Family, sharing the flash driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Family {
    pub name: String,
    pub description: String,
    /// Start of the flash memory, including the part taken by the bootloader.
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub flash_start: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub write_block_size: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub checksum_offset: u32,
    #[serde(deserialize_with = "parse_address_list")]
    pub vector_offsets: Vec<u32>,
    #[serde(default)]
    pub word_order: WordOrder,
    /// Sectors available to the user program on the largest variant.
    pub sectors: Vec<SectorRun>,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub flash_size: u32,
}

/// A fully resolved target MCU.
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub family: String,
    pub flash_size: u32,
    pub write_block_size: u32,
    pub layout: FlashLayout,
    pub checksum: ChecksumConfig,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}, {}KiB, user program at 0x{:08x})",
            self.name,
            self.family,
            self.flash_size / 1024,
            self.layout.start()
        )
    }
}

pub struct TargetDB {
    families: Vec<Family>,
}

impl TargetDB {
    pub fn load() -> Result<Self> {
        Ok(TargetDB {
            families: vec![
                serde_yaml::from_str(include_str!("../devices/stm32f1.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/stm32g4.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/stm32f7.yaml"))?,
            ],
        })
    }

    pub fn families(&self) -> &[Family] {
        &self.families
    }

    /// Look up a variant by name, ignoring case.
    pub fn find_target(&self, name: &str) -> Result<Target> {
        let (family, variant) = self
            .families
            .iter()
            .flat_map(|f| f.variants.iter().map(move |v| (f, v)))
            .find(|(_, v)| v.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow::format_err!("Unknown target {:?}", name))?;
        log::debug!("Found target family: {}", family.name);
        family.resolve(variant)
    }
}

impl Family {
    fn resolve(&self, variant: &Variant) -> Result<Target> {
        let flash_end = u64::from(self.flash_start) + u64::from(variant.flash_size);
        let sectors: Vec<Sector> = self
            .sectors
            .iter()
            .flat_map(|run| {
                (0..run.count).map(move |i| Sector {
                    start: run.start + i * run.size,
                    size: run.size,
                })
            })
            .filter(|s| u64::from(s.start) + u64::from(s.size) <= flash_end)
            .collect();

        anyhow::ensure!(!sectors.is_empty(), "{} has no flash left for the user program", variant.name);
        anyhow::ensure!(
            sectors.windows(2).all(|w| w[0].start + w[0].size <= w[1].start),
            "{}: sectors overlap or are out of order",
            self.name
        );
        anyhow::ensure!(
            self.write_block_size > 0 && sectors[0].start % self.write_block_size == 0,
            "{}: user program start is not aligned to the write block size",
            self.name
        );
        anyhow::ensure!(
            self.vector_offsets
                .iter()
                .chain(std::iter::once(&self.checksum_offset))
                .all(|&off| off + 4 <= self.write_block_size),
            "{}: checksum words must lie in the first write block",
            self.name
        );

        Ok(Target {
            name: variant.name.clone(),
            family: self.name.clone(),
            flash_size: variant.flash_size,
            write_block_size: self.write_block_size,
            layout: FlashLayout::new(sectors),
            checksum: ChecksumConfig {
                offset: self.checksum_offset,
                vector_offsets: self.vector_offsets.clone(),
                byte_order: self.word_order.into(),
            },
        })
    }
}

impl Target {
    /// Make sure every byte of `firmware` lands in flash available to the user program.
    pub fn check_firmware(&self, firmware: &FirmwareData) -> Result<()> {
        for segment in firmware.segments() {
            anyhow::ensure!(
                self.layout.contains(segment.base, segment.len() as u32),
                "{} bytes at 0x{:08x} are outside the flash of {}",
                segment.len(),
                segment.base,
                self.name
            );
        }
        Ok(())
    }

    /// Block manager for this target's flash.
    pub fn block_manager<D: FlashDevice, W: Watchdog>(&self, device: D, watchdog: W) -> FlashBlockManager<D, W> {
        FlashBlockManager::new(
            device,
            self.layout.clone(),
            self.write_block_size,
            self.checksum.clone(),
            watchdog,
        )
    }
}

/// Parse a size or an address: `0x` hex, plain decimal or a `K`, `KB`, `KiB` suffix.
pub fn parse_number(s: &str) -> Result<u32> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if let Some(kib) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix('K'))
    {
        return kib
            .parse::<u32>()
            .ok()
            .and_then(|k| k.checked_mul(1024))
            .ok_or_else(|| anyhow::format_err!("error while parsing {:?}", s));
    } else {
        s.parse()
    };
    parsed.map_err(|e| anyhow::format_err!("error while parsing {:?}: {}", s, e))
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    parse_number(&s).map_err(serde::de::Error::custom)
}

fn parse_address_list<'de, D>(deserializer: D) -> std::result::Result<Vec<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let items: Vec<String> = serde::Deserialize::deserialize(deserializer)?;
    items
        .iter()
        .map(|s| parse_number(s).map_err(serde::de::Error::custom))
        .collect()
}
