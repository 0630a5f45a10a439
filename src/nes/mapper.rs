use anyhow::{Result, bail, ensure};

use super::bus::{Bus, ReadHandler, WriteHandler};
use super::cartridge::Cartridge;
use super::ppu::MirrorMode;

const PRG_SLOT: usize = 0x2000;
const PRG_16K: usize = 0x4000;
const PRG_32K: usize = 0x8000;
const CHR_RAM_BANKS_1K: usize = 8;

/// What a mapper may change on the video side. Pattern banks and
/// mirroring are pushed to the PPU, which records them as scanline events.
pub trait VideoPort {
    /// Maps one 8KB CHR bank over the whole pattern space.
    fn set_chr_bank(&mut self, bank_8k: usize);
    /// Maps a 1KB CHR bank into one of the eight pattern windows.
    fn set_chr_bank_offset(&mut self, slot: usize, bank_1k: usize);
    fn set_mirror_mode(&mut self, mode: MirrorMode);
}

pub trait Mapper {
    fn mapper_id(&self) -> u16;

    /// Claims `$8000-$FFFF` on the bus and publishes the power-on banking.
    fn install(&mut self, bus: &mut Bus, video: &mut dyn VideoPort) {
        bus.install_read_handler(0x8000, 0xFFFF, ReadHandler::Mapper);
        bus.install_write_handler(0x8000, 0xFFFF, WriteHandler::Mapper);
        self.reset(video);
    }

    fn reset(&mut self, video: &mut dyn VideoPort);
    fn cpu_read(&self, addr: u16) -> u8;
    fn cpu_write(&mut self, addr: u16, value: u8, video: &mut dyn VideoPort);

    /// Called once per scanline after the PPU moved to `hcount`.
    fn on_hblank(&mut self, _hcount: u16, _rendering: bool) {}
    fn irq_pending(&self) -> bool {
        false
    }

    /// ROM byte offset backing each 8KB window of `$8000-$FFFF`.
    fn prg_bank_offsets(&self) -> [usize; 4];

    fn save_regs(&self) -> Vec<u8>;
    fn load_regs(&mut self, regs: &[u8], video: &mut dyn VideoPort) -> Result<()>;

    fn debug_state(&self) -> String {
        String::new()
    }
}

pub fn mapper_name(mapper_id: u16) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "MMC1",
        2 => "UxROM",
        3 => "CNROM",
        4 => "MMC3",
        7 => "AxROM",
        66 => "GxROM",
        _ => "Unsupported",
    }
}

pub fn create_mapper(cart: Cartridge) -> Result<Box<dyn Mapper>> {
    let mapper: Box<dyn Mapper> = match cart.mapper_id {
        0 => Box::new(Mapper0::new(cart)),
        1 => Box::new(Mapper1::new(cart)),
        2 => Box::new(Mapper2::new(cart)),
        3 => Box::new(Mapper3::new(cart)),
        4 => Box::new(Mapper4::new(cart)),
        7 => Box::new(Mapper7::new(cart)),
        66 => Box::new(Mapper66::new(cart)),
        id => bail!("mapper {id} is not supported"),
    };
    Ok(mapper)
}

fn expect_regs(regs: &[u8], len: usize, name: &str) -> Result<()> {
    ensure!(
        regs.len() == len,
        "{name} state is {} bytes, expected {len}",
        regs.len()
    );
    Ok(())
}

/// PRG ROM seen through four 8KB windows. Every bank index is reduced
/// modulo the number of banks of the requested size.
struct PrgBanks {
    rom: Vec<u8>,
    offsets: [usize; 4],
}

impl PrgBanks {
    fn new(rom: Vec<u8>) -> Self {
        Self {
            rom,
            offsets: [0, PRG_SLOT, 2 * PRG_SLOT, 3 * PRG_SLOT],
        }
    }

    fn count(&self, size: usize) -> usize {
        (self.rom.len() / size).max(1)
    }

    fn last(&self, size: usize) -> usize {
        self.count(size) - 1
    }

    fn map(&mut self, first_slot: usize, size: usize, bank: usize) {
        let bank = bank % self.count(size);
        for i in 0..size / PRG_SLOT {
            self.offsets[first_slot + i] = bank * size + i * PRG_SLOT;
        }
    }

    fn read(&self, addr: u16) -> u8 {
        let offset = self.offsets[((addr >> 13) & 3) as usize] + (addr as usize & (PRG_SLOT - 1));
        self.rom[offset % self.rom.len()]
    }
}

fn chr_banks_1k(cart: &Cartridge) -> usize {
    cart.chr_rom
        .as_ref()
        .map_or(CHR_RAM_BANKS_1K, |chr| (chr.len() / 0x400).max(1))
}

// NROM: fixed 16KB or 32KB, no registers.
struct Mapper0 {
    prg: PrgBanks,
}

impl Mapper0 {
    fn new(cart: Cartridge) -> Self {
        Self {
            prg: PrgBanks::new(cart.prg_rom),
        }
    }
}

impl Mapper for Mapper0 {
    fn mapper_id(&self) -> u16 {
        0
    }

    fn reset(&mut self, video: &mut dyn VideoPort) {
        self.prg.map(0, PRG_16K, 0);
        self.prg.map(2, PRG_16K, self.prg.last(PRG_16K));
        video.set_chr_bank(0);
    }

    fn cpu_read(&self, addr: u16) -> u8 {
        self.prg.read(addr)
    }

    fn cpu_write(&mut self, _addr: u16, _value: u8, _video: &mut dyn VideoPort) {}

    fn prg_bank_offsets(&self) -> [usize; 4] {
        self.prg.offsets
    }

    fn save_regs(&self) -> Vec<u8> {
        Vec::new()
    }

    fn load_regs(&mut self, regs: &[u8], video: &mut dyn VideoPort) -> Result<()> {
        expect_regs(regs, 0, "NROM")?;
        self.reset(video);
        Ok(())
    }
}

// MMC1: five-write serial port feeding four internal registers.
struct Mapper1 {
    prg: PrgBanks,
    chr_banks_1k: usize,
    shift_register: u8,
    control: u8,
    chr_bank0: u8,
    chr_bank1: u8,
    prg_bank: u8,
}

impl Mapper1 {
    fn new(cart: Cartridge) -> Self {
        Self {
            chr_banks_1k: chr_banks_1k(&cart),
            prg: PrgBanks::new(cart.prg_rom),
            shift_register: 0x10,
            control: 0x0C,
            chr_bank0: 0,
            chr_bank1: 0,
            prg_bank: 0,
        }
    }

    fn write_shift_register(&mut self, addr: u16, value: u8, video: &mut dyn VideoPort) {
        if (value & 0x80) != 0 {
            self.shift_register = 0x10;
            self.control |= 0x0C;
            self.apply(video);
            return;
        }

        let commit = (self.shift_register & 0x01) != 0;
        self.shift_register >>= 1;
        self.shift_register |= (value & 0x01) << 4;

        if commit {
            let data = self.shift_register;
            match addr {
                0x8000..=0x9FFF => self.control = data,
                0xA000..=0xBFFF => self.chr_bank0 = data,
                0xC000..=0xDFFF => self.chr_bank1 = data,
                _ => self.prg_bank = data & 0x0F,
            }
            self.shift_register = 0x10;
            self.apply(video);
        }
    }

    fn apply(&mut self, video: &mut dyn VideoPort) {
        video.set_mirror_mode(match self.control & 0x03 {
            0 => MirrorMode::SingleScreen0,
            1 => MirrorMode::SingleScreen1,
            2 => MirrorMode::Vertical,
            _ => MirrorMode::Horizontal,
        });

        let bank = self.prg_bank as usize;
        match (self.control >> 2) & 0x03 {
            0 | 1 => self.prg.map(0, PRG_32K, bank >> 1),
            2 => {
                self.prg.map(0, PRG_16K, 0);
                self.prg.map(2, PRG_16K, bank);
            }
            _ => {
                self.prg.map(0, PRG_16K, bank);
                self.prg.map(2, PRG_16K, self.prg.last(PRG_16K));
            }
        }

        if (self.control & 0x10) == 0 {
            let banks_8k = (self.chr_banks_1k / 8).max(1);
            video.set_chr_bank((self.chr_bank0 as usize >> 1) % banks_8k);
        } else {
            let banks_4k = (self.chr_banks_1k / 4).max(1);
            let lower = (self.chr_bank0 as usize % banks_4k) * 4;
            let upper = (self.chr_bank1 as usize % banks_4k) * 4;
            for i in 0..4 {
                video.set_chr_bank_offset(i, lower + i);
                video.set_chr_bank_offset(4 + i, upper + i);
            }
        }
    }
}

impl Mapper for Mapper1 {
    fn mapper_id(&self) -> u16 {
        1
    }

    fn reset(&mut self, video: &mut dyn VideoPort) {
        self.shift_register = 0x10;
        self.control = 0x0C;
        self.chr_bank0 = 0;
        self.chr_bank1 = 0;
        self.prg_bank = 0;
        self.apply(video);
    }

    fn cpu_read(&self, addr: u16) -> u8 {
        self.prg.read(addr)
    }

    fn cpu_write(&mut self, addr: u16, value: u8, video: &mut dyn VideoPort) {
        self.write_shift_register(addr, value, video);
    }

    fn prg_bank_offsets(&self) -> [usize; 4] {
        self.prg.offsets
    }

    fn save_regs(&self) -> Vec<u8> {
        vec![
            self.shift_register,
            self.control,
            self.chr_bank0,
            self.chr_bank1,
            self.prg_bank,
        ]
    }

    fn load_regs(&mut self, regs: &[u8], video: &mut dyn VideoPort) -> Result<()> {
        expect_regs(regs, 5, "MMC1")?;
        self.shift_register = regs[0];
        self.control = regs[1];
        self.chr_bank0 = regs[2];
        self.chr_bank1 = regs[3];
        self.prg_bank = regs[4];
        self.apply(video);
        Ok(())
    }

    fn debug_state(&self) -> String {
        format!(
            "MMC1 ctrl=${:02X} prg={} chr0={} chr1={} shift=${:02X}",
            self.control, self.prg_bank, self.chr_bank0, self.chr_bank1, self.shift_register
        )
    }
}

// UxROM: switchable 16KB at $8000, last bank fixed at $C000.
struct Mapper2 {
    prg: PrgBanks,
    bank: u8,
}

impl Mapper2 {
    fn new(cart: Cartridge) -> Self {
        Self {
            prg: PrgBanks::new(cart.prg_rom),
            bank: 0,
        }
    }

    fn apply(&mut self) {
        self.prg.map(0, PRG_16K, self.bank as usize);
        self.prg.map(2, PRG_16K, self.prg.last(PRG_16K));
    }
}

impl Mapper for Mapper2 {
    fn mapper_id(&self) -> u16 {
        2
    }

    fn reset(&mut self, video: &mut dyn VideoPort) {
        self.bank = 0;
        self.apply();
        video.set_chr_bank(0);
    }

    fn cpu_read(&self, addr: u16) -> u8 {
        self.prg.read(addr)
    }

    fn cpu_write(&mut self, _addr: u16, value: u8, _video: &mut dyn VideoPort) {
        self.bank = value;
        self.apply();
    }

    fn prg_bank_offsets(&self) -> [usize; 4] {
        self.prg.offsets
    }

    fn save_regs(&self) -> Vec<u8> {
        vec![self.bank]
    }

    fn load_regs(&mut self, regs: &[u8], _video: &mut dyn VideoPort) -> Result<()> {
        expect_regs(regs, 1, "UxROM")?;
        self.bank = regs[0];
        self.apply();
        Ok(())
    }
}

// CNROM: fixed PRG, switchable 8KB CHR.
struct Mapper3 {
    prg: PrgBanks,
    chr_banks_8k: usize,
    chr_bank: u8,
}

impl Mapper3 {
    fn new(cart: Cartridge) -> Self {
        Self {
            chr_banks_8k: (chr_banks_1k(&cart) / 8).max(1),
            prg: PrgBanks::new(cart.prg_rom),
            chr_bank: 0,
        }
    }
}

impl Mapper for Mapper3 {
    fn mapper_id(&self) -> u16 {
        3
    }

    fn reset(&mut self, video: &mut dyn VideoPort) {
        self.prg.map(0, PRG_16K, 0);
        self.prg.map(2, PRG_16K, self.prg.last(PRG_16K));
        self.chr_bank = 0;
        video.set_chr_bank(0);
    }

    fn cpu_read(&self, addr: u16) -> u8 {
        self.prg.read(addr)
    }

    fn cpu_write(&mut self, _addr: u16, value: u8, video: &mut dyn VideoPort) {
        self.chr_bank = value;
        video.set_chr_bank(value as usize % self.chr_banks_8k);
    }

    fn prg_bank_offsets(&self) -> [usize; 4] {
        self.prg.offsets
    }

    fn save_regs(&self) -> Vec<u8> {
        vec![self.chr_bank]
    }

    fn load_regs(&mut self, regs: &[u8], video: &mut dyn VideoPort) -> Result<()> {
        expect_regs(regs, 1, "CNROM")?;
        self.chr_bank = regs[0];
        video.set_chr_bank(self.chr_bank as usize % self.chr_banks_8k);
        Ok(())
    }
}

// MMC3: 8KB PRG / 1KB CHR banking with a scanline IRQ counter.
struct Mapper4 {
    prg: PrgBanks,
    chr_banks_1k: usize,
    bank_select: u8,
    bank_regs: [u8; 8],
    /// `$A000` value: 0 vertical, 1 horizontal.
    mirroring: u8,
    header_mirroring: u8,

    irq_latch: u8,
    irq_counter: u8,
    irq_reload: bool,
    irq_enabled: bool,
    irq_pending: bool,
    debug_irq_clocks: u64,
}

impl Mapper4 {
    const STATE_LEN: usize = 15;

    fn new(cart: Cartridge) -> Self {
        let header_mirroring = u8::from(cart.mirroring == MirrorMode::Horizontal);
        Self {
            chr_banks_1k: chr_banks_1k(&cart),
            prg: PrgBanks::new(cart.prg_rom),
            bank_select: 0,
            bank_regs: [0, 2, 4, 5, 6, 7, 0, 1],
            mirroring: header_mirroring,
            header_mirroring,
            irq_latch: 0,
            irq_counter: 0,
            irq_reload: false,
            irq_enabled: false,
            irq_pending: false,
            debug_irq_clocks: 0,
        }
    }

    fn apply_prg(&mut self) {
        let second_last = self.prg.count(PRG_SLOT).saturating_sub(2);
        let last = self.prg.last(PRG_SLOT);
        let r6 = self.bank_regs[6] as usize;
        let r7 = self.bank_regs[7] as usize;
        if (self.bank_select & 0x40) == 0 {
            self.prg.map(0, PRG_SLOT, r6);
            self.prg.map(2, PRG_SLOT, second_last);
        } else {
            self.prg.map(0, PRG_SLOT, second_last);
            self.prg.map(2, PRG_SLOT, r6);
        }
        self.prg.map(1, PRG_SLOT, r7);
        self.prg.map(3, PRG_SLOT, last);
    }

    fn apply_chr(&self, video: &mut dyn VideoPort) {
        let r0 = (self.bank_regs[0] & 0xFE) as usize;
        let r1 = (self.bank_regs[1] & 0xFE) as usize;
        let singles = [
            self.bank_regs[2] as usize,
            self.bank_regs[3] as usize,
            self.bank_regs[4] as usize,
            self.bank_regs[5] as usize,
        ];
        let pairs = [r0, r0 + 1, r1, r1 + 1];
        let banks = if (self.bank_select & 0x80) == 0 {
            [pairs, singles].concat()
        } else {
            [singles, pairs].concat()
        };
        for (slot, bank) in banks.into_iter().enumerate() {
            video.set_chr_bank_offset(slot, bank % self.chr_banks_1k);
        }
    }

    fn apply_mirroring(&self, video: &mut dyn VideoPort) {
        video.set_mirror_mode(if (self.mirroring & 1) == 0 {
            MirrorMode::Vertical
        } else {
            MirrorMode::Horizontal
        });
    }

    fn clock_irq_counter(&mut self) {
        self.debug_irq_clocks = self.debug_irq_clocks.wrapping_add(1);
        if self.irq_counter == 0 || self.irq_reload {
            self.irq_counter = self.irq_latch;
            self.irq_reload = false;
        } else {
            self.irq_counter -= 1;
        }

        if self.irq_counter == 0 && self.irq_enabled {
            self.irq_pending = true;
        }
    }
}

impl Mapper for Mapper4 {
    fn mapper_id(&self) -> u16 {
        4
    }

    fn reset(&mut self, video: &mut dyn VideoPort) {
        self.bank_select = 0;
        self.bank_regs = [0, 2, 4, 5, 6, 7, 0, 1];
        self.mirroring = self.header_mirroring;
        self.irq_latch = 0;
        self.irq_counter = 0;
        self.irq_reload = false;
        self.irq_enabled = false;
        self.irq_pending = false;
        self.apply_prg();
        self.apply_chr(video);
        self.apply_mirroring(video);
    }

    fn cpu_read(&self, addr: u16) -> u8 {
        self.prg.read(addr)
    }

    fn cpu_write(&mut self, addr: u16, value: u8, video: &mut dyn VideoPort) {
        let even = (addr & 1) == 0;
        match (addr, even) {
            (0x8000..=0x9FFF, true) => {
                self.bank_select = value;
                self.apply_prg();
                self.apply_chr(video);
            }
            (0x8000..=0x9FFF, false) => {
                let target = (self.bank_select & 0x07) as usize;
                self.bank_regs[target] = value;
                if target >= 6 {
                    self.apply_prg();
                } else {
                    self.apply_chr(video);
                }
            }
            (0xA000..=0xBFFF, true) => {
                self.mirroring = value & 1;
                self.apply_mirroring(video);
            }
            // PRG-RAM protect is ignored; the RAM is always enabled.
            (0xA000..=0xBFFF, false) => {}
            (0xC000..=0xDFFF, true) => self.irq_latch = value,
            (0xC000..=0xDFFF, false) => {
                self.irq_counter = 0;
                self.irq_reload = true;
            }
            (_, true) => {
                self.irq_enabled = false;
                self.irq_pending = false;
            }
            (_, false) => self.irq_enabled = true,
        }
    }

    fn on_hblank(&mut self, hcount: u16, rendering: bool) {
        if rendering && (hcount < 240 || hcount == 261) {
            self.clock_irq_counter();
        }
    }

    fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    fn prg_bank_offsets(&self) -> [usize; 4] {
        self.prg.offsets
    }

    fn save_regs(&self) -> Vec<u8> {
        let mut regs = Vec::with_capacity(Self::STATE_LEN);
        regs.push(self.bank_select);
        regs.extend_from_slice(&self.bank_regs);
        regs.extend_from_slice(&[
            self.mirroring,
            self.irq_latch,
            self.irq_counter,
            self.irq_reload as u8,
            self.irq_enabled as u8,
            self.irq_pending as u8,
        ]);
        regs
    }

    fn load_regs(&mut self, regs: &[u8], video: &mut dyn VideoPort) -> Result<()> {
        expect_regs(regs, Self::STATE_LEN, "MMC3")?;
        self.bank_select = regs[0];
        self.bank_regs.copy_from_slice(&regs[1..9]);
        self.mirroring = regs[9];
        self.irq_latch = regs[10];
        self.irq_counter = regs[11];
        self.irq_reload = regs[12] != 0;
        self.irq_enabled = regs[13] != 0;
        self.irq_pending = regs[14] != 0;
        self.apply_prg();
        self.apply_chr(video);
        self.apply_mirroring(video);
        Ok(())
    }

    fn debug_state(&self) -> String {
        format!(
            "MMC3 select=${:02X} regs={:?} irq latch={} counter={} enabled={} pending={} clocks={}",
            self.bank_select,
            self.bank_regs,
            self.irq_latch,
            self.irq_counter,
            self.irq_enabled,
            self.irq_pending,
            self.debug_irq_clocks
        )
    }
}

// AxROM: 32KB PRG switching and single-screen mirroring select.
struct Mapper7 {
    prg: PrgBanks,
    reg: u8,
}

impl Mapper7 {
    fn new(cart: Cartridge) -> Self {
        Self {
            prg: PrgBanks::new(cart.prg_rom),
            reg: 0,
        }
    }

    fn apply(&mut self, video: &mut dyn VideoPort) {
        self.prg.map(0, PRG_32K, (self.reg & 0x0F) as usize);
        video.set_mirror_mode(if (self.reg >> 4) & 1 == 0 {
            MirrorMode::SingleScreen0
        } else {
            MirrorMode::SingleScreen1
        });
    }
}

impl Mapper for Mapper7 {
    fn mapper_id(&self) -> u16 {
        7
    }

    fn reset(&mut self, video: &mut dyn VideoPort) {
        self.reg = 0;
        video.set_chr_bank(0);
        self.apply(video);
    }

    fn cpu_read(&self, addr: u16) -> u8 {
        self.prg.read(addr)
    }

    fn cpu_write(&mut self, _addr: u16, value: u8, video: &mut dyn VideoPort) {
        self.reg = value;
        self.apply(video);
    }

    fn prg_bank_offsets(&self) -> [usize; 4] {
        self.prg.offsets
    }

    fn save_regs(&self) -> Vec<u8> {
        vec![self.reg]
    }

    fn load_regs(&mut self, regs: &[u8], video: &mut dyn VideoPort) -> Result<()> {
        expect_regs(regs, 1, "AxROM")?;
        self.reg = regs[0];
        self.apply(video);
        Ok(())
    }

    fn debug_state(&self) -> String {
        format!(
            "AxROM bank={} page={}",
            self.reg & 0x0F,
            (self.reg >> 4) & 1
        )
    }
}

// GxROM: one register selecting a 32KB PRG bank and an 8KB CHR bank.
struct Mapper66 {
    prg: PrgBanks,
    chr_banks_8k: usize,
    reg: u8,
}

impl Mapper66 {
    fn new(cart: Cartridge) -> Self {
        Self {
            chr_banks_8k: (chr_banks_1k(&cart) / 8).max(1),
            prg: PrgBanks::new(cart.prg_rom),
            reg: 0,
        }
    }

    fn apply(&mut self, video: &mut dyn VideoPort) {
        self.prg.map(0, PRG_32K, ((self.reg >> 4) & 0x03) as usize);
        video.set_chr_bank((self.reg & 0x03) as usize % self.chr_banks_8k);
    }
}

impl Mapper for Mapper66 {
    fn mapper_id(&self) -> u16 {
        66
    }

    fn reset(&mut self, video: &mut dyn VideoPort) {
        self.reg = 0;
        self.apply(video);
    }

    fn cpu_read(&self, addr: u16) -> u8 {
        self.prg.read(addr)
    }

    fn cpu_write(&mut self, _addr: u16, value: u8, video: &mut dyn VideoPort) {
        self.reg = value;
        self.apply(video);
    }

    fn prg_bank_offsets(&self) -> [usize; 4] {
        self.prg.offsets
    }

    fn save_regs(&self) -> Vec<u8> {
        vec![self.reg]
    }

    fn load_regs(&mut self, regs: &[u8], video: &mut dyn VideoPort) -> Result<()> {
        expect_regs(regs, 1, "GxROM")?;
        self.reg = regs[0];
        self.apply(video);
        Ok(())
    }
}
