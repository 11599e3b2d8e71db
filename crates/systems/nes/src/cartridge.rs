//! iNES image loader.

use serde::Serialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const HEADER_SIZE: usize = 16;
pub const TRAINER_SIZE: usize = 512;
pub const PRG_BANK_SIZE: usize = 16 * 1024;
pub const CHR_BANK_SIZE: usize = 8 * 1024;
const SIGNATURE: &[u8; 4] = b"NES\x1A";

const FLAG6_VERTICAL: u8 = 0x01;
const FLAG6_BATTERY: u8 = 0x02;
const FLAG6_TRAINER: u8 = 0x04;
const FLAG6_FOUR_SCREEN: u8 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mirroring {
    Horizontal,
    Vertical,
}

#[derive(Debug, Error)]
pub enum CartridgeError {
    #[error("not an iNES image (bad signature)")]
    BadSignature,
    #[error("truncated {section}: expected {expected} bytes, found {actual}")]
    Truncated {
        section: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("failed to read ROM file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub prg_rom: Vec<u8>,
    pub chr_rom: Vec<u8>,
    pub trainer: Option<Vec<u8>>,
    pub mapper: u8,
    pub mirroring: Mirroring,
    pub four_screen: bool,
    pub battery: bool,
}

impl Cartridge {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CartridgeError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CartridgeError> {
        if data.len() < SIGNATURE.len() || &data[..SIGNATURE.len()] != SIGNATURE {
            return Err(CartridgeError::BadSignature);
        }
        let header = data.get(..HEADER_SIZE).ok_or(CartridgeError::Truncated {
            section: "header",
            expected: HEADER_SIZE,
            actual: data.len(),
        })?;

        let prg_size = header[4] as usize * PRG_BANK_SIZE;
        let chr_size = header[5] as usize * CHR_BANK_SIZE;
        let flags6 = header[6];
        let flags7 = header[7];

        let mut reader = SectionReader {
            data,
            pos: HEADER_SIZE,
        };
        let trainer = if flags6 & FLAG6_TRAINER != 0 {
            Some(reader.take("trainer", TRAINER_SIZE)?.to_vec())
        } else {
            None
        };
        let prg_rom = reader.take("PRG ROM", prg_size)?.to_vec();
        let chr_rom = reader.take("CHR ROM", chr_size)?.to_vec();

        Ok(Self {
            prg_rom,
            chr_rom,
            trainer,
            mapper: (flags7 & 0xF0) | (flags6 >> 4),
            mirroring: if flags6 & FLAG6_VERTICAL != 0 {
                Mirroring::Vertical
            } else {
                Mirroring::Horizontal
            },
            four_screen: flags6 & FLAG6_FOUR_SCREEN != 0,
            battery: flags6 & FLAG6_BATTERY != 0,
        })
    }

    /// 32 KiB PRG image for the fixed 0x8000-0xFFFF mapping. A single
    /// 16 KiB bank appears in both halves.
    pub fn prg_image(&self) -> Vec<u8> {
        if self.prg_rom.len() == PRG_BANK_SIZE {
            self.prg_rom.repeat(2)
        } else {
            self.prg_rom.clone()
        }
    }
}

struct SectionReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SectionReader<'a> {
    fn take(&mut self, section: &'static str, len: usize) -> Result<&'a [u8], CartridgeError> {
        let available = self.data.len().saturating_sub(self.pos);
        if available < len {
            return Err(CartridgeError::Truncated {
                section,
                expected: len,
                actual: available,
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }
}
