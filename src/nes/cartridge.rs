use anyhow::{Context, Result, bail};
use std::{fs, path::Path};

use super::ppu::MirrorMode;

const HEADER_LEN: usize = 16;
const TRAINER_LEN: usize = 512;
const PRG_UNIT: usize = 16 * 1024;
const CHR_UNIT: usize = 8 * 1024;

/// A parsed iNES image.
#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u16,
    pub mirroring: MirrorMode,
    pub four_screen: bool,
    pub has_battery_backed_ram: bool,
    pub prg_rom: Vec<u8>,
    /// `None` when the board carries 8KB of CHR RAM instead of ROM.
    pub chr_rom: Option<Vec<u8>>,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            bail!("ROM is too small to contain an iNES header");
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let is_nes2 = (flags7 & 0x0C) == 0x08;

        let mut mapper_id = ((flags6 as u16) >> 4) | ((flags7 as u16) & 0xF0);
        if is_nes2 {
            mapper_id |= ((bytes[8] as u16) & 0x0F) << 8;
        }

        let four_screen = (flags6 & 0x08) != 0;
        let mirroring = if (flags6 & 0x01) != 0 {
            MirrorMode::Vertical
        } else {
            MirrorMode::Horizontal
        };
        if four_screen {
            log::warn!("four-screen VRAM is not emulated; using {mirroring:?} mirroring");
        }
        let trainer_present = (flags6 & 0x04) != 0;
        let has_battery_backed_ram = (flags6 & 0x02) != 0;

        let prg_rom_size = bytes[4] as usize * PRG_UNIT;
        let chr_rom_size = bytes[5] as usize * CHR_UNIT;
        if prg_rom_size == 0 {
            bail!("invalid PRG ROM: header declares no PRG banks");
        }

        let mut cursor = HEADER_LEN;
        if trainer_present {
            cursor += TRAINER_LEN;
        }

        let prg_rom_end = cursor + prg_rom_size;
        if bytes.len() < prg_rom_end {
            bail!(
                "ROM truncated: expected {} PRG bytes but file ended early",
                prg_rom_size
            );
        }
        let prg_rom = bytes[cursor..prg_rom_end].to_vec();
        cursor = prg_rom_end;

        let chr_rom = if chr_rom_size == 0 {
            None
        } else {
            if bytes.len() < cursor + chr_rom_size {
                bail!(
                    "ROM truncated: expected {} CHR bytes but file ended early",
                    chr_rom_size
                );
            }
            Some(bytes[cursor..cursor + chr_rom_size].to_vec())
        };

        log::info!(
            "iNES mapper={} prg={}KB chr={} mirroring={:?} battery={}",
            mapper_id,
            prg_rom.len() / 1024,
            chr_rom
                .as_ref()
                .map_or_else(|| "RAM".to_string(), |chr| format!("{}KB", chr.len() / 1024)),
            mirroring,
            has_battery_backed_ram
        );

        Ok(Self {
            mapper_id,
            mirroring,
            four_screen,
            has_battery_backed_ram,
            prg_rom,
            chr_rom,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds an iNES image whose PRG banks are filled with their index + 1
    /// and whose reset vector points at `$8000`.
    pub(crate) fn build_rom(mapper_id: u8, prg_banks: u8, chr_banks: u8, flags6_low: u8) -> Vec<u8> {
        let mut rom = vec![
            b'N',
            b'E',
            b'S',
            0x1A,
            prg_banks,
            chr_banks,
            ((mapper_id & 0x0F) << 4) | flags6_low,
            mapper_id & 0xF0,
        ];
        rom.resize(HEADER_LEN, 0);
        for bank in 0..prg_banks {
            rom.extend(std::iter::repeat_n(bank + 1, PRG_UNIT));
        }
        for bank in 0..chr_banks {
            rom.extend(std::iter::repeat_n(0x80 | bank, CHR_UNIT));
        }
        rom
    }

    #[test]
    fn parses_header_fields() {
        let cart = Cartridge::from_bytes(&build_rom(66, 2, 1, 0x03)).unwrap();
        assert_eq!(cart.mapper_id, 66);
        assert_eq!(cart.mirroring, MirrorMode::Vertical);
        assert!(cart.has_battery_backed_ram);
        assert_eq!(cart.prg_rom.len(), 2 * PRG_UNIT);
        assert_eq!(cart.prg_rom[PRG_UNIT], 2);
        assert_eq!(cart.chr_rom.as_ref().map(Vec::len), Some(CHR_UNIT));
    }

    #[test]
    fn zero_chr_banks_means_chr_ram() {
        let cart = Cartridge::from_bytes(&build_rom(2, 1, 0, 0)).unwrap();
        assert!(cart.chr_rom.is_none());
        assert_eq!(cart.mirroring, MirrorMode::Horizontal);
    }

    #[test]
    fn trainer_is_skipped() {
        let mut rom = build_rom(0, 1, 0, 0x04);
        let trainer = vec![0xEE; TRAINER_LEN];
        rom.splice(HEADER_LEN..HEADER_LEN, trainer);
        let cart = Cartridge::from_bytes(&rom).unwrap();
        assert_eq!(cart.prg_rom[0], 1);
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let mut rom = build_rom(0, 1, 1, 0);
        rom[3] = 0;
        let err = Cartridge::from_bytes(&rom).unwrap_err();
        assert!(err.to_string().contains("magic"));

        let rom = build_rom(0, 2, 0, 0);
        let err = Cartridge::from_bytes(&rom[..HEADER_LEN + PRG_UNIT]).unwrap_err();
        assert!(err.to_string().contains("truncated"));

        assert!(Cartridge::from_bytes(b"NES").is_err());
    }
}
