use anyhow::{Result, bail, ensure};

use super::hevent::{HEventKind, HEventQueue, HStatus};
use super::mapper::VideoPort;
use super::palette::NES_PALETTE;
use super::state::PpuState;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;
const FRAME_LINES: u16 = FRAME_HEIGHT as u16;
const VBLANK_LINE: u16 = 241;

const REGISTER_COUNT: usize = 8;
pub const VRAM_SIZE: usize = 0x4000;
const CHR_RAM_SIZE: usize = 0x2000;
const OAM_SIZE: usize = 0x100;
const MAX_SPRITES: usize = 64;

const PPUCTRL: usize = 0;
const PPUMASK: usize = 1;
const PPUSTATUS: usize = 2;
const OAMADDR: usize = 3;
const OAMDATA: usize = 4;
const PPUSCROLL: usize = 5;
const PPUADDR: usize = 6;
const PPUDATA: usize = 7;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_BASE_NAMETABLE: u8 = 0x03;

const MASK_SHOW_SPRITES: u8 = 0x10;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG_LEFT: u8 = 0x02;

const STATUS_VBLANK: u8 = 0x80;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_SPRITE_OVERFLOW: u8 = 0x20;

const ATTR_FLIP_VERT: u8 = 0x80;
const ATTR_FLIP_HORZ: u8 = 0x40;
const ATTR_PALETTE: u8 = 0x03;

const PALETTE_BASE: u16 = 0x3F00;

// Offscreen pixels hold a 5-bit palette index. The top bit marks pixels
// already claimed by a sprite so lower priority sprites stay hidden.
const SPRITE_MASK: u8 = 0x80;
const SPRITE_PRIORITY_MASK: [u8; 2] = [SPRITE_MASK, 0xFF];

#[rustfmt::skip]
const INITIAL_PALETTE: [u8; 32] = [
    0x09, 0x01, 0x00, 0x01, 0x00, 0x02, 0x02, 0x0D, 0x08, 0x10, 0x08, 0x24, 0x00, 0x00, 0x04, 0x2C,
    0x09, 0x01, 0x34, 0x03, 0x00, 0x04, 0x00, 0x14, 0x08, 0x3A, 0x00, 0x02, 0x00, 0x20, 0x2C, 0x08,
];

/// Two bits per nametable quadrant selecting which 1KB page backs it,
/// quadrant 0 in the low bits.
const MIRROR_MODE_BITS: [u8; 4] = [0x50, 0x44, 0x00, 0x55];

/// Spreads bit `n` of a pattern byte to bit `2n`, so a low and a high
/// plane combine into 2-bit pixels with the leftmost pixel on top.
const STAGGERED: [u16; 256] = build_staggered();

const fn build_staggered() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut bit = 0;
        while bit < 8 {
            if i & (1 << bit) != 0 {
                table[i] |= 1 << (bit * 2);
            }
            bit += 1;
        }
        i += 1;
    }
    table
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MirrorMode {
    Horizontal,
    #[default]
    Vertical,
    SingleScreen0,
    SingleScreen1,
}

impl MirrorMode {
    pub fn bits(self) -> u8 {
        MIRROR_MODE_BITS[self as usize]
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Horizontal),
            1 => Some(Self::Vertical),
            2 => Some(Self::SingleScreen0),
            3 => Some(Self::SingleScreen1),
            _ => None,
        }
    }
}

/// Physical nametable page offset (0, 0x400, 0x800 or 0xC00) backing a
/// logical quadrant.
fn fold_nametable(page: usize, mirror_bits: u8) -> usize {
    ((mirror_bits as usize) << (10 - (page << 1))) & 0x0C00
}

/// Maps a PPU bus address onto the 16KB VRAM array, applying nametable
/// mirroring and the palette aliases.
pub(crate) fn mirrored_address(addr: u16, mirror_bits: u8) -> u16 {
    let mut addr = addr & 0x3FFF;
    if (0x3000..PALETTE_BASE).contains(&addr) {
        addr -= 0x1000;
    }
    if (0x2000..0x3000).contains(&addr) {
        let page = ((addr >> 10) & 3) as usize;
        return (addr & 0xF3FF) | fold_nametable(page, mirror_bits) as u16;
    }
    if addr >= PALETTE_BASE {
        addr &= 0xFF1F;
        // $3F10/$3F14/$3F18/$3F1C alias the background entries.
        if addr & 0xFFF3 == 0x3F10 {
            addr &= 0xFFEF;
        }
    }
    addr
}

fn name_table_base(base: usize, bx: usize, by: usize, mirror_bits: u8) -> usize {
    let page = (((bx >> 5) & 1) + (((by / 30) & 1) << 1)) ^ base;
    0x2000 + fold_nametable(page, mirror_bits)
}

/// Moves the vertical part of a loopy address down by `dy` scanlines,
/// carrying into the vertical nametable bit every 240 lines.
fn advance_scroll_lines(t: u16, dy: i32) -> u16 {
    let page_y = ((t >> 11) & 1) as i32 * 240;
    let mut y = (((t & 0x03E0) >> 2) | ((t >> 12) & 7)) as i32;
    if y >= 240 {
        y -= 256;
    }
    let ny = page_y + y + dy;
    let page = (ny.div_euclid(240) & 1) as u16;
    let sy = ny.rem_euclid(240) as u16;
    (t & !0x7BE0) | ((sy & 0xF8) << 2) | ((sy & 0x07) << 12) | (page << 11)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PpuDebugCounters {
    pub vblank_entries: u64,
    pub events_recorded: u64,
    pub sprite0_hits: u64,
    pub sprite0_hit_last_line: u16,
    pub status_reads: u64,
    pub chr_rom_writes_ignored: u64,
}

pub struct Ppu {
    regs: [u8; REGISTER_COUNT],
    vram: Vec<u8>,
    oam: [u8; OAM_SIZE],
    /// Empty when the cartridge uses CHR RAM; patterns then live in the
    /// bottom 8KB of `vram`.
    chr_rom: Vec<u8>,
    mirror_mode: MirrorMode,

    hcount: u16,
    latch: bool,
    ppu_addr: u16,
    buffered_value: u8,
    scroll_temp: u16,

    events: HEventQueue,
    hstatus: HStatus,
    hstatus_prev: HStatus,
    hstatus_bak: HStatus,

    offscreen: Vec<u8>,
    debug: PpuDebugCounters,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        let mut ppu = Self {
            regs: [0; REGISTER_COUNT],
            vram: vec![0; VRAM_SIZE],
            oam: [0; OAM_SIZE],
            chr_rom: Vec::new(),
            mirror_mode: MirrorMode::default(),
            hcount: 0,
            latch: false,
            ppu_addr: 0,
            buffered_value: 0,
            scroll_temp: 0,
            events: HEventQueue::new(),
            hstatus: HStatus::default(),
            hstatus_prev: HStatus::default(),
            hstatus_bak: HStatus::default(),
            offscreen: vec![0; FRAME_WIDTH * FRAME_HEIGHT],
            debug: PpuDebugCounters::default(),
        };
        ppu.reset();
        ppu
    }

    /// Power-on state. CHR ROM and the mirroring mode belong to the
    /// cartridge and are kept.
    pub fn reset(&mut self) {
        self.regs = [0; REGISTER_COUNT];
        self.vram.fill(0);
        self.oam = [0; OAM_SIZE];
        self.hcount = 0;
        self.latch = false;
        self.ppu_addr = 0;
        self.buffered_value = 0;
        self.scroll_temp = 0;
        self.hstatus.reset();
        self.rebase_events();
        self.offscreen.fill(0);
        let palette = PALETTE_BASE as usize;
        self.vram[palette..palette + INITIAL_PALETTE.len()].copy_from_slice(&INITIAL_PALETTE);
    }

    /// Installs cartridge pattern data. `None` selects 8KB of CHR RAM.
    pub fn set_chr_data(&mut self, chr_rom: Option<Vec<u8>>) {
        self.chr_rom = chr_rom.unwrap_or_default();
    }

    pub fn is_chr_ram(&self) -> bool {
        self.chr_rom.is_empty()
    }

    fn chr_len(&self) -> usize {
        if self.is_chr_ram() {
            CHR_RAM_SIZE
        } else {
            self.chr_rom.len()
        }
    }

    pub fn mirror_mode(&self) -> MirrorMode {
        self.mirror_mode
    }

    pub fn nmi_enabled(&self) -> bool {
        (self.regs[PPUCTRL] & CTRL_NMI_ENABLE) != 0
    }

    pub fn rendering_enabled(&self) -> bool {
        (self.regs[PPUMASK] & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    pub fn registers(&self) -> [u8; REGISTER_COUNT] {
        self.regs
    }

    pub fn scroll_temp(&self) -> u16 {
        self.scroll_temp
    }

    pub fn scroll_curr(&self) -> u16 {
        self.hstatus.scroll_curr
    }

    pub fn oam(&self) -> &[u8] {
        &self.oam
    }

    pub fn debug_counters(&self) -> PpuDebugCounters {
        self.debug
    }

    /// Register read as seen from `$2000-$2007`.
    pub fn read(&mut self, reg: usize) -> u8 {
        let reg = reg & 7;
        match reg {
            PPUSTATUS => {
                let result = self.regs[PPUSTATUS]
                    & (STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
                self.regs[PPUSTATUS] &= !STATUS_VBLANK;
                self.latch = false;
                self.debug.status_reads = self.debug.status_reads.wrapping_add(1);
                result
            }
            OAMDATA => self.oam[self.regs[OAMADDR] as usize],
            PPUDATA => {
                let bits = self.hstatus.mirror_mode_bit;
                let addr = mirrored_address(self.ppu_addr, bits);
                let result = if addr >= PALETTE_BASE {
                    // Palette reads bypass the buffer, which picks up the
                    // nametable byte underneath instead.
                    let below = mirrored_address(self.ppu_addr.wrapping_sub(0x1000), bits);
                    self.buffered_value = self.read_direct(below);
                    self.read_direct(addr)
                } else {
                    let result = self.buffered_value;
                    self.buffered_value = self.read_direct(addr);
                    result
                };
                self.increment_address();
                result
            }
            _ => self.regs[reg],
        }
    }

    pub fn write(&mut self, reg: usize, value: u8) {
        let reg = reg & 7;
        if reg == PPUSTATUS {
            return;
        }
        self.regs[reg] = value;

        match reg {
            PPUCTRL => {
                self.inc_scroll_counter();
                self.scroll_temp = (self.scroll_temp & !0x0C00)
                    | (((value & CTRL_BASE_NAMETABLE) as u16) << 10);
                let scroll_curr = (self.hstatus.scroll_curr & !0x041F) | (self.scroll_temp & 0x041F);
                self.add_hevent(HEventKind::PpuCtrl, value as u32);
                self.add_hevent(HEventKind::ScrollCurr, scroll_curr as u32);
            }
            PPUMASK => {
                self.inc_scroll_counter();
                self.add_hevent(HEventKind::PpuMask, value as u32);
            }
            OAMDATA => {
                let oam_addr = self.regs[OAMADDR];
                self.oam[oam_addr as usize] = value;
                self.regs[OAMADDR] = oam_addr.wrapping_add(1);
            }
            PPUSCROLL => {
                self.inc_scroll_counter();
                if !self.latch {
                    self.scroll_temp = (self.scroll_temp & !0x001F) | (value >> 3) as u16;
                    self.add_hevent(HEventKind::ScrollFineX, (value & 7) as u32);
                    let scroll_curr =
                        (self.hstatus.scroll_curr & !0x041F) | (self.scroll_temp & 0x041F);
                    self.add_hevent(HEventKind::ScrollCurr, scroll_curr as u32);
                } else {
                    self.scroll_temp = (self.scroll_temp & !0x73E0)
                        | (((value & 0xF8) as u16) << 2)
                        | (((value & 0x07) as u16) << 12);
                }
                self.latch = !self.latch;
            }
            PPUADDR => {
                if !self.latch {
                    self.scroll_temp =
                        (self.scroll_temp & !0x7F00) | (((value & 0x3F) as u16) << 8);
                } else {
                    self.scroll_temp = (self.scroll_temp & !0x00FF) | value as u16;
                    self.ppu_addr = self.scroll_temp;
                    self.add_hevent(HEventKind::ScrollCurr, self.scroll_temp as u32);
                }
                self.latch = !self.latch;
            }
            PPUDATA => {
                let addr = mirrored_address(self.ppu_addr, self.hstatus.mirror_mode_bit);
                self.write_direct(addr, value);
                self.increment_address();
            }
            _ => {}
        }
    }

    /// OAM DMA: 256 bytes land in OAM starting at OAMADDR and wrapping.
    pub fn copy_with_dma(&mut self, page: &[u8]) {
        let mut dst = self.regs[OAMADDR];
        for &byte in page.iter().take(OAM_SIZE) {
            self.oam[dst as usize] = byte;
            dst = dst.wrapping_add(1);
        }
    }

    pub fn set_hcount(&mut self, hcount: u16) {
        self.hcount = hcount;
        self.check_sprite0_hit(hcount);
    }

    /// Moves the line counter without running the per-line checks.
    pub(crate) fn restore_hcount(&mut self, hcount: u16) {
        self.hcount = hcount;
    }

    /// Start of vblank: freezes the finished frame's events and rotates
    /// the snapshots so the replay starts from the state at the previous
    /// vblank.
    pub fn set_vblank(&mut self) {
        self.regs[PPUSTATUS] |= STATUS_VBLANK;
        self.events.swap(FRAME_LINES);
        self.hstatus_prev = self.hstatus_bak;
        self.hstatus_bak = self.hstatus;
        self.debug.vblank_entries = self.debug.vblank_entries.wrapping_add(1);
    }

    /// End of vblank: the pre-render line reloads the whole scroll
    /// position from the temporary address.
    pub fn clear_vblank(&mut self) {
        self.regs[PPUSTATUS] &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT);
        self.add_hevent(HEventKind::ScrollCurr, self.scroll_temp as u32);
    }

    /// Replays the last frozen frame into `pixels` (RGBA, 256x240).
    pub fn render(&mut self, pixels: &mut [u8]) {
        let mut offscreen = std::mem::take(&mut self.offscreen);
        let mut h = self.hstatus_prev;
        let mut sprite_chr_start = 0usize;

        for pair in self.events.current().windows(2) {
            let event = pair[0];
            h.apply(event.kind, event.value);

            let line0 = event.line as usize;
            let line1 = (pair[1].line as usize).min(FRAME_HEIGHT);
            if line0 >= line1 {
                continue;
            }

            if (h.ppu_mask & MASK_SHOW_BG) == 0 {
                clear_bg(&mut offscreen, line0, line1, FRAME_WIDTH);
            } else {
                let mut x0 = 0;
                if (h.ppu_mask & MASK_SHOW_BG_LEFT) == 0 {
                    x0 = 8;
                    clear_bg(&mut offscreen, line0, line1, x0);
                }
                self.render_bg(&mut offscreen, &h, line0, line1, x0);
            }

            if (h.ppu_mask & MASK_SHOW_SPRITES) != 0 {
                if (h.ppu_ctrl & CTRL_SPRITE_SIZE_16) == 0 {
                    sprite_chr_start = ((h.ppu_ctrl & CTRL_SPRITE_TABLE) as usize) << 9;
                }
                let x0 = if (h.ppu_mask & MASK_SHOW_SPRITE_LEFT) != 0 { 0 } else { 8 };
                self.render_sprites(&mut offscreen, &h, line0, line1, x0, sprite_chr_start);
            }
        }

        for (pixel, &index) in pixels.chunks_exact_mut(4).zip(offscreen.iter()) {
            let rgb = self.palette_color((index & 0x1F) as usize);
            pixel[..3].copy_from_slice(&rgb);
            pixel[3] = 0xFF;
        }
        self.offscreen = offscreen;
    }

    /// Colour of one of the 32 palette RAM entries.
    pub fn palette_color(&self, index: usize) -> [u8; 3] {
        let code = self.vram[PALETTE_BASE as usize + (index & 0x1F)] & 0x3F;
        NES_PALETTE[code as usize]
    }

    /// Draws both pattern tables side by side (256x128) with one of the
    /// eight palettes.
    pub fn render_pattern_table(&self, pixels: &mut [u8], line_width: usize, palette: usize) {
        let palette = (palette & 7) << 2;
        for table in 0..2 {
            for tile in 0..256 {
                let chridx = (table << 12) + tile * 16;
                let left = table * 128 + (tile % 16) * 8;
                let top = (tile / 16) * 8;
                for py in 0..8 {
                    let pat = self.bg_pattern(chridx, py, &self.hstatus.chr_bank_offset);
                    for px in 0..8 {
                        let pal = ((pat >> ((7 - px) << 1)) & 3) as usize;
                        let color = if pal == 0 {
                            self.palette_color(0)
                        } else {
                            self.palette_color(palette | pal)
                        };
                        put_pixel(pixels, line_width, left + px, top + py, color);
                    }
                }
            }
        }
    }

    /// Draws all four logical nametables (512x480) with the current
    /// background pattern table and mirroring.
    pub fn render_name_table(&self, pixels: &mut [u8], line_width: usize) {
        let chr_start = ((self.regs[PPUCTRL] & CTRL_BG_TABLE) as usize) << 8;
        let bits = self.hstatus.mirror_mode_bit;
        for by in 0..60 {
            let ay = by % 30;
            for bx in 0..64 {
                let ax = bx & 31;
                let name_table = name_table_base(0, bx, by, bits);
                let name = self.vram[name_table + ax + (ay << 5)] as usize;
                let pal_shift = (ax & 2) + ((ay & 2) << 1);
                let attr_block = (ax >> 2) + ((ay << 1) & 0xF8);
                let high = (((self.vram[name_table + 0x3C0 + attr_block] >> pal_shift) & 3) << 2) as usize;
                for py in 0..8 {
                    let pat = self.bg_pattern(name * 16 + chr_start, py, &self.hstatus.chr_bank_offset);
                    for px in 0..8 {
                        let pal = ((pat >> ((7 - px) << 1)) & 3) as usize;
                        let index = if pal == 0 { 0 } else { high | pal };
                        put_pixel(pixels, line_width, bx * 8 + px, by * 8 + py, self.palette_color(index));
                    }
                }
            }
        }
    }

    pub fn save(&self) -> PpuState {
        let (vram, vram_high) = if self.is_chr_ram() {
            (Some(self.vram.clone()), None)
        } else {
            (None, Some(self.vram[0x2000..].to_vec()))
        };
        PpuState {
            regs: self.regs.to_vec(),
            oam: self.oam.to_vec(),
            mirror_mode: self.mirror_mode.index(),
            vram,
            vram_high,
        }
    }

    /// Restores raw state and rebuilds the derived scroll registers and
    /// replay snapshots from it.
    pub fn load(&mut self, state: &PpuState) -> Result<()> {
        ensure!(
            state.regs.len() == REGISTER_COUNT,
            "PPU state has {} registers, expected {}",
            state.regs.len(),
            REGISTER_COUNT
        );
        ensure!(
            state.oam.len() == OAM_SIZE,
            "PPU state has {} OAM bytes, expected {}",
            state.oam.len(),
            OAM_SIZE
        );
        let Some(mirror_mode) = MirrorMode::from_index(state.mirror_mode) else {
            bail!("invalid mirror mode {} in PPU state", state.mirror_mode);
        };

        if self.is_chr_ram() {
            let Some(vram) = state.vram.as_ref() else {
                bail!("PPU state lacks VRAM for a CHR RAM cartridge");
            };
            ensure!(vram.len() == VRAM_SIZE, "PPU VRAM is {} bytes", vram.len());
            self.vram.copy_from_slice(vram);
        } else {
            let Some(high) = state.vram_high.as_ref() else {
                bail!("PPU state lacks nametable VRAM for a CHR ROM cartridge");
            };
            ensure!(high.len() == VRAM_SIZE - 0x2000, "PPU VRAM is {} bytes", high.len());
            self.vram[0x2000..].copy_from_slice(high);
        }

        self.regs.copy_from_slice(&state.regs);
        self.oam.copy_from_slice(&state.oam);
        self.mirror_mode = mirror_mode;

        self.latch = false;
        self.ppu_addr = 0;
        self.buffered_value = 0;
        self.hstatus.reset();
        self.hstatus.apply(HEventKind::PpuCtrl, self.regs[PPUCTRL] as u32);
        self.hstatus.apply(HEventKind::PpuMask, self.regs[PPUMASK] as u32);
        self.hstatus.apply(HEventKind::MirrorModeBit, mirror_mode.bits() as u32);
        self.restore_scroll();
        Ok(())
    }

    /// Derives both loopy addresses from the nametable bits of PPUCTRL and
    /// restarts the event log. Runs again after the cartridge republishes
    /// its banks, since every published bank advances the scroll by the
    /// lines elapsed on the current frame.
    pub(crate) fn restore_scroll(&mut self) {
        self.scroll_temp = ((self.regs[PPUCTRL] & CTRL_BASE_NAMETABLE) as u16) << 10;
        self.hstatus.scroll_curr = self.scroll_temp;
        self.rebase_events();
    }

    /// Drops recorded events and makes the live state the starting point
    /// of both replay snapshots.
    fn rebase_events(&mut self) {
        self.events.clear();
        self.hstatus_prev = self.hstatus;
        self.hstatus_bak = self.hstatus;
    }

    fn increment_address(&mut self) {
        let step = if (self.regs[PPUCTRL] & CTRL_VRAM_INC_32) != 0 { 32 } else { 1 };
        self.ppu_addr = self.ppu_addr.wrapping_add(step) & (VRAM_SIZE as u16 - 1);
    }

    fn read_direct(&self, addr: u16) -> u8 {
        if addr >= 0x2000 {
            self.vram[addr as usize]
        } else {
            let offset = self.hstatus.chr_bank_offset[((addr >> 10) & 7) as usize] as usize;
            self.chr_byte(offset + (addr & 0x3FF) as usize)
        }
    }

    fn write_direct(&mut self, addr: u16, value: u8) {
        if addr >= 0x2000 {
            self.vram[addr as usize] = value;
        } else if self.is_chr_ram() {
            let offset = self.hstatus.chr_bank_offset[((addr >> 10) & 7) as usize] as usize;
            self.vram[(offset + (addr & 0x3FF) as usize) & (CHR_RAM_SIZE - 1)] = value;
        } else {
            self.debug.chr_rom_writes_ignored = self.debug.chr_rom_writes_ignored.wrapping_add(1);
        }
    }

    fn chr_byte(&self, offset: usize) -> u8 {
        if self.is_chr_ram() {
            self.vram[offset & (CHR_RAM_SIZE - 1)]
        } else {
            self.chr_rom[offset % self.chr_rom.len()]
        }
    }

    fn pattern_planes(&self, idx: usize, chr_bank_offset: &[u32; 8]) -> (u8, u8) {
        let base = chr_bank_offset[(idx >> 10) & 7] as usize + (idx & 0x03FF);
        (self.chr_byte(base), self.chr_byte(base + 8))
    }

    fn bg_pattern(&self, chridx: usize, py: usize, chr_bank_offset: &[u32; 8]) -> u32 {
        let (lo, hi) = self.pattern_planes(chridx + py, chr_bank_offset);
        (STAGGERED[lo as usize] | (STAGGERED[hi as usize] << 1)) as u32
    }

    fn sprite_pattern(&self, chridx: usize, ppy: usize, flip_horz: bool, chr_bank_offset: &[u32; 8]) -> u32 {
        let idx = chridx + (ppy & 7) + ((ppy & 8) << 1);
        let (mut lo, mut hi) = self.pattern_planes(idx, chr_bank_offset);
        if flip_horz {
            lo = lo.reverse_bits();
            hi = hi.reverse_bits();
        }
        (STAGGERED[lo as usize] | (STAGGERED[hi as usize] << 1)) as u32
    }

    fn render_bg(&self, offscreen: &mut [u8], h: &HStatus, line0: usize, line1: usize, x0: usize) {
        let base_name_table = ((h.scroll_curr & 0x0C00) >> 10) as usize;
        let chr_start = ((h.ppu_ctrl & CTRL_BG_TABLE) as usize) << 8;
        let scroll_x = (h.scroll_fine_x as usize) | (((h.scroll_curr & 0x001F) as usize) << 3);
        let mut scroll_y = (((h.scroll_curr & 0x7000) >> 12) | ((h.scroll_curr & 0x03E0) >> 2)) as i32;
        if scroll_y >= 240 {
            scroll_y -= 256;
        }

        for yy in line0..line1 {
            let yyy = (yy - line0) as i32 + scroll_y;
            let by = ((yyy >> 3) + 60).rem_euclid(60) as usize;
            let ay = by % 30;
            let fine_y = (yyy & 7) as usize;

            for bbx in 0..=(FRAME_WIDTH / 8) {
                let bx = (bbx + (scroll_x >> 3)) & 63;
                let ax = bx & 31;

                let px0 = (bbx * 8) as i32 - (scroll_x & 7) as i32;
                let px_start = (x0 as i32 - px0).max(0);
                let px_end = (FRAME_WIDTH as i32 - px0).min(8);
                if px_start >= px_end {
                    continue;
                }

                let name_table = name_table_base(base_name_table, bx, by, h.mirror_mode_bit);
                let name = self.vram[name_table + ax + (ay << 5)] as usize;
                let pal_shift = (ax & 2) + ((ay & 2) << 1);
                let attr_block = (ax >> 2) + ((ay << 1) & 0xF8);
                let palette_high = ((self.vram[name_table + 0x3C0 + attr_block] >> pal_shift) & 3) << 2;

                let mut pat = self.bg_pattern(name * 16 + chr_start, fine_y, &h.chr_bank_offset);
                pat = (pat << (px_start * 2)) & 0xFFFF;
                let row = yy * FRAME_WIDTH;
                for px in px_start..px_end {
                    let mut pal = (pat >> 14) as u8;
                    pat = (pat << 2) & 0xFFFF;
                    if pal != 0 {
                        pal |= palette_high;
                    }
                    offscreen[row + (px + px0) as usize] = pal;
                }
            }
        }
    }

    fn render_sprites(
        &self,
        offscreen: &mut [u8],
        h: &HStatus,
        line0: usize,
        line1: usize,
        x0: usize,
        chr_start: usize,
    ) {
        let tall = (h.ppu_ctrl & CTRL_SPRITE_SIZE_16) != 0;
        let height = if tall { 16 } else { 8 };

        for sprite in self.oam.chunks_exact(4).take(MAX_SPRITES) {
            let y = sprite[0] as usize + 1;
            if y + height < line0 || y >= line1 {
                continue;
            }
            let index = sprite[1] as usize;
            let attr = sprite[2];
            let x = sprite[3] as usize;
            let flip_vert = (attr & ATTR_FLIP_VERT) != 0;
            let flip_horz = (attr & ATTR_FLIP_HORZ) != 0;
            let priority_mask = SPRITE_PRIORITY_MASK[((attr >> 5) & 1) as usize];

            let chridx = if tall {
                (index & 0xFE) * 16 + ((index & 1) << 12)
            } else {
                index * 16 + chr_start
            };
            let palette_high = ((attr & ATTR_PALETTE) << 2) | 0x10 | SPRITE_MASK;

            let py0 = line0.saturating_sub(y);
            let py1 = height.min(line1 - y).min(FRAME_HEIGHT.saturating_sub(y));
            let px0 = x0.saturating_sub(x);
            let px1 = (FRAME_WIDTH - x).min(8);
            for py in py0..py1 {
                let ppy = if flip_vert { height - 1 - py } else { py };
                let pat = self.sprite_pattern(chridx, ppy, flip_horz, &h.chr_bank_offset);
                let row = (y + py) * FRAME_WIDTH + x;
                for px in px0..px1 {
                    let pal = ((pat >> ((7 - px) << 1)) & 3) as u8;
                    if pal == 0 {
                        continue;
                    }
                    let pixel = &mut offscreen[row + px];
                    if (*pixel & priority_mask) != 0 {
                        *pixel |= SPRITE_MASK;
                        continue;
                    }
                    *pixel = palette_high + pal;
                }
            }
        }
    }

    fn sprite_pattern_table_address(&self) -> usize {
        if (self.regs[PPUCTRL] & CTRL_SPRITE_SIZE_16) == 0 {
            ((self.regs[PPUCTRL] & CTRL_SPRITE_TABLE) as usize) << 9
        } else {
            0
        }
    }

    /// Sprite-zero hit approximation: fires on the first scanline where
    /// sprite 0 has any opaque pixel, provided both layers are enabled.
    fn check_sprite0_hit(&mut self, hcount: u16) {
        if (self.regs[PPUSTATUS] & STATUS_SPRITE_ZERO_HIT) != 0
            || (self.regs[PPUMASK] & (MASK_SHOW_BG | MASK_SHOW_SPRITES))
                != (MASK_SHOW_BG | MASK_SHOW_SPRITES)
        {
            return;
        }

        let sprite0_y = self.oam[0] as u16;
        if hcount < sprite0_y || hcount >= sprite0_y + 16 {
            return;
        }
        if self.oam[3] == 0xFF {
            return;
        }
        match self.first_opaque_sprite0_row() {
            Some(dy) if hcount == sprite0_y + dy => {
                self.regs[PPUSTATUS] |= STATUS_SPRITE_ZERO_HIT;
                self.debug.sprite0_hits = self.debug.sprite0_hits.wrapping_add(1);
                self.debug.sprite0_hit_last_line = hcount;
            }
            _ => {}
        }
    }

    fn first_opaque_sprite0_row(&self) -> Option<u16> {
        let tall = (self.regs[PPUCTRL] & CTRL_SPRITE_SIZE_16) != 0;
        let height = if tall { 16 } else { 8 };
        let index = self.oam[1] as usize;
        let flip_vert = (self.oam[2] & ATTR_FLIP_VERT) != 0;
        let chridx = if tall {
            (index & 0xFE) * 16 + ((index & 1) << 12)
        } else {
            index * 16 + self.sprite_pattern_table_address()
        };

        (0..height).find_map(|py| {
            let ppy = if flip_vert { height - 1 - py } else { py };
            let pat = self.sprite_pattern(chridx, ppy, false, &self.hstatus.chr_bank_offset);
            (pat != 0).then_some(py as u16)
        })
    }

    /// Scanline at which a change made now becomes visible. Writes late in
    /// the visible frame are pinned to its end; writes during vblank go to
    /// the top of the next frame.
    fn event_line(&self) -> u16 {
        if self.hcount < VBLANK_LINE {
            (self.hcount + 1).min(FRAME_LINES)
        } else {
            0
        }
    }

    fn add_hevent(&mut self, kind: HEventKind, value: u32) {
        if !self.hstatus.apply(kind, value) {
            return;
        }
        self.events.add(self.event_line(), kind, value);
        self.debug.events_recorded = self.debug.events_recorded.wrapping_add(1);
    }

    /// The renderer does not increment Y itself, so before any change the
    /// scroll registers are advanced by the lines drawn since the last
    /// recorded event.
    fn inc_scroll_counter(&mut self) {
        let Some(last) = self.events.pending().last() else {
            return;
        };
        let dy = self.event_line() as i32 - last.line as i32;
        if dy <= 0 {
            return;
        }
        self.scroll_temp = advance_scroll_lines(self.scroll_temp, dy);
        let scroll_curr = advance_scroll_lines(self.hstatus.scroll_curr, dy);
        self.add_hevent(HEventKind::ScrollCurr, scroll_curr as u32);
    }
}

impl VideoPort for Ppu {
    fn set_chr_bank(&mut self, bank_8k: usize) {
        let base = bank_8k << 3;
        for slot in 0..8 {
            self.set_chr_bank_offset(slot, base + slot);
        }
    }

    fn set_chr_bank_offset(&mut self, slot: usize, bank_1k: usize) {
        let offset = ((bank_1k << 10) % self.chr_len()) as u32;
        self.inc_scroll_counter();
        self.add_hevent(HEventKind::ChrBankOffset((slot & 7) as u8), offset);
    }

    fn set_mirror_mode(&mut self, mode: MirrorMode) {
        if self.mirror_mode != mode {
            log::debug!("mirroring {:?} -> {:?} at line {}", self.mirror_mode, mode, self.hcount);
        }
        self.mirror_mode = mode;
        self.inc_scroll_counter();
        self.add_hevent(HEventKind::MirrorModeBit, mode.bits() as u32);
    }
}

fn clear_bg(offscreen: &mut [u8], line0: usize, line1: usize, width: usize) {
    for line in line0..line1 {
        let row = line * FRAME_WIDTH;
        offscreen[row..row + width].fill(0);
    }
}

fn put_pixel(pixels: &mut [u8], line_width: usize, x: usize, y: usize, rgb: [u8; 3]) {
    let index = (y * line_width + x) * 4;
    if let Some(pixel) = pixels.get_mut(index..index + 4) {
        pixel[..3].copy_from_slice(&rgb);
        pixel[3] = 0xFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadrant_pages(mode: MirrorMode) -> [u16; 4] {
        let mut pages = [0; 4];
        for (quadrant, page) in pages.iter_mut().enumerate() {
            let addr = 0x2000 + (quadrant as u16) * 0x400 + 0x12;
            *page = (mirrored_address(addr, mode.bits()) - 0x2012) / 0x400;
        }
        pages
    }

    fn set_line(ppu: &mut Ppu, line: u16) {
        ppu.set_hcount(line);
    }

    #[test]
    fn mirror_modes_fold_quadrants() {
        assert_eq!(quadrant_pages(MirrorMode::Horizontal), [0, 0, 1, 1]);
        assert_eq!(quadrant_pages(MirrorMode::Vertical), [0, 1, 0, 1]);
        assert_eq!(quadrant_pages(MirrorMode::SingleScreen0), [0, 0, 0, 0]);
        assert_eq!(quadrant_pages(MirrorMode::SingleScreen1), [1, 1, 1, 1]);
    }

    #[test]
    fn upper_nametable_mirror_and_palette_aliases() {
        let bits = MirrorMode::Vertical.bits();
        assert_eq!(mirrored_address(0x3456, bits), mirrored_address(0x2456, bits));
        assert_eq!(mirrored_address(0x3F10, bits), 0x3F00);
        assert_eq!(mirrored_address(0x3F1C, bits), 0x3F0C);
        assert_eq!(mirrored_address(0x3F11, bits), 0x3F11);
        assert_eq!(mirrored_address(0x3F25, bits), 0x3F05);
    }

    #[test]
    fn ppudata_reads_are_buffered_except_palette() {
        let mut ppu = Ppu::new();
        ppu.write(PPUADDR, 0x24);
        ppu.write(PPUADDR, 0x00);
        ppu.write(PPUDATA, 0xAB);
        ppu.write(PPUDATA, 0xCD);

        ppu.write(PPUADDR, 0x24);
        ppu.write(PPUADDR, 0x00);
        let _stale = ppu.read(PPUDATA);
        assert_eq!(ppu.read(PPUDATA), 0xAB);
        assert_eq!(ppu.read(PPUDATA), 0xCD);

        ppu.write(PPUADDR, 0x3F);
        ppu.write(PPUADDR, 0x00);
        assert_eq!(ppu.read(PPUDATA), INITIAL_PALETTE[0]);
    }

    #[test]
    fn status_read_clears_vblank_and_latch() {
        let mut ppu = Ppu::new();
        ppu.set_vblank();
        ppu.write(PPUSCROLL, 0x10);
        assert_eq!(ppu.read(PPUSTATUS) & STATUS_VBLANK, STATUS_VBLANK);
        assert_eq!(ppu.read(PPUSTATUS) & STATUS_VBLANK, 0);

        // Latch was reset, so this is a first write again (coarse X).
        ppu.write(PPUSCROLL, 0x28);
        assert_eq!(ppu.scroll_temp() & 0x001F, 0x05);
    }

    #[test]
    fn scroll_writes_fill_loopy_temp() {
        let mut ppu = Ppu::new();
        set_line(&mut ppu, 261);
        ppu.write(PPUCTRL, 0x02);
        ppu.write(PPUSCROLL, 0x7D); // coarse X 15, fine X 5
        ppu.write(PPUSCROLL, 0x5E); // coarse Y 11, fine Y 6
        let t = ppu.scroll_temp();
        assert_eq!(t & 0x001F, 15);
        assert_eq!((t >> 5) & 0x1F, 11);
        assert_eq!((t >> 12) & 7, 6);
        assert_eq!((t >> 10) & 3, 2);
        // Only the horizontal part reaches the live address mid-frame.
        assert_eq!(ppu.scroll_curr() & 0x041F, 15);
        assert_eq!(ppu.scroll_curr() & 0x7BE0, 0);
    }

    #[test]
    fn events_are_ordered_and_end_with_sentinel() {
        let mut ppu = Ppu::new();
        set_line(&mut ppu, 10);
        ppu.write(PPUMASK, 0x18);
        set_line(&mut ppu, 100);
        ppu.write(PPUCTRL, 0x01);
        set_line(&mut ppu, 239);
        ppu.write(PPUMASK, 0x08);
        set_line(&mut ppu, 241);
        ppu.set_vblank();

        let events = ppu.events.current();
        assert!(events.windows(2).all(|w| w[0].line <= w[1].line));
        assert_eq!(events.first().map(|e| e.line), Some(0));
        let last = events.last().copied().unwrap();
        assert_eq!((last.line, last.kind), (240, HEventKind::Dummy));
        assert!(events.iter().any(|e| e.line == 11 && e.kind == HEventKind::PpuMask));
    }

    #[test]
    fn vblank_writes_land_on_next_frame_top() {
        let mut ppu = Ppu::new();
        set_line(&mut ppu, 241);
        ppu.set_vblank();
        set_line(&mut ppu, 250);
        ppu.write(PPUMASK, 0x1E);
        let pending = ppu.events.pending();
        assert!(pending.iter().all(|e| e.line == 0));
        assert!(pending.iter().any(|e| e.kind == HEventKind::PpuMask));
    }

    #[test]
    fn sprite_zero_needs_both_layers() {
        let mut ppu = Ppu::new();
        ppu.set_chr_data(Some(vec![0xFF; 0x2000]));
        ppu.oam[0] = 20;
        ppu.oam[3] = 40;

        ppu.write(PPUMASK, MASK_SHOW_SPRITES);
        for line in 0..40 {
            ppu.set_hcount(line);
        }
        assert_eq!(ppu.regs[PPUSTATUS] & STATUS_SPRITE_ZERO_HIT, 0);

        ppu.write(PPUMASK, MASK_SHOW_SPRITES | MASK_SHOW_BG);
        for line in 0..40 {
            ppu.set_hcount(line);
        }
        assert_ne!(ppu.regs[PPUSTATUS] & STATUS_SPRITE_ZERO_HIT, 0);
        assert_eq!(ppu.debug_counters().sprite0_hit_last_line, 20);

        ppu.clear_vblank();
        assert_eq!(ppu.regs[PPUSTATUS] & STATUS_SPRITE_ZERO_HIT, 0);
    }

    #[test]
    fn chr_bank_offsets_wrap_to_chr_size() {
        let mut ppu = Ppu::new();
        ppu.set_chr_data(Some(vec![0; 0x4000]));
        ppu.set_chr_bank_offset(0, 17);
        assert_eq!(ppu.hstatus.chr_bank_offset[0], 1 << 10);
        ppu.set_chr_bank(3);
        assert_eq!(ppu.hstatus.chr_bank_offset[7], (8 + 7) << 10);
    }

    #[test]
    fn render_replays_mask_change_mid_frame() {
        let mut ppu = Ppu::new();
        // Tile 1 is solid colour 1; the first nametable is filled with it.
        let mut chr = vec![0u8; 0x2000];
        chr[16..24].fill(0xFF);
        ppu.set_chr_data(Some(chr));
        for addr in 0x2000..0x23C0 {
            ppu.vram[addr] = 1;
        }
        ppu.vram[0x3F00] = 0x0F;
        ppu.vram[0x3F01] = 0x30;

        set_line(&mut ppu, 261);
        ppu.clear_vblank();
        set_line(&mut ppu, 0);
        ppu.write(PPUMASK, MASK_SHOW_BG | MASK_SHOW_BG_LEFT);
        set_line(&mut ppu, 119);
        ppu.write(PPUMASK, 0);
        set_line(&mut ppu, 241);
        ppu.set_vblank();

        let mut pixels = vec![0u8; FRAME_WIDTH * FRAME_HEIGHT * 4];
        ppu.render(&mut pixels);
        let at = |x: usize, y: usize| {
            let i = (y * FRAME_WIDTH + x) * 4;
            [pixels[i], pixels[i + 1], pixels[i + 2]]
        };
        assert_eq!(at(10, 50), NES_PALETTE[0x30]);
        assert_eq!(at(10, 119), NES_PALETTE[0x30]);
        assert_eq!(at(10, 120), NES_PALETTE[0x0F]);
        assert_eq!(pixels[3], 0xFF);
    }

    #[test]
    fn lines_drawn_since_last_event_advance_both_scroll_registers() {
        let mut ppu = Ppu::new();
        set_line(&mut ppu, 250);
        ppu.write(PPUSCROLL, 0x00);
        ppu.write(PPUSCROLL, 236); // coarse Y 29, fine Y 4
        set_line(&mut ppu, 261);
        ppu.clear_vblank();
        assert_eq!(ppu.scroll_curr(), 0x43A0);

        // Six lines later the position crosses the bottom of the
        // nametable, wrapping coarse Y and flipping the vertical page.
        set_line(&mut ppu, 5);
        ppu.write(PPUMASK, MASK_SHOW_BG);
        assert_eq!(ppu.scroll_temp(), 0x2800);
        assert_eq!(ppu.scroll_curr(), 0x2800);
        assert!(ppu.events.pending().iter().any(|e| {
            e.line == 6 && e.kind == HEventKind::ScrollCurr && e.value == 0x2800
        }));

        // The next step is measured from line 6, not from the frame top.
        set_line(&mut ppu, 9);
        ppu.write(PPUMASK, MASK_SHOW_BG | MASK_SHOW_SPRITES);
        assert_eq!(ppu.scroll_temp(), 0x6800);
        assert_eq!(ppu.scroll_curr(), 0x6800);
    }

    /// Pattern data for the sprite tests: tile 1 has one pixel in its top
    /// left corner, tile 3 is solid, tile 0 of the upper table is solid
    /// background and tile 5 of the upper table has a colour 3 pixel at
    /// the right end of its first row.
    fn sprite_chr() -> Vec<u8> {
        let mut chr = vec![0u8; 0x2000];
        chr[0x0010] = 0x80;
        chr[0x0030..0x0038].fill(0xFF);
        chr[0x1000..0x1008].fill(0xFF);
        chr[0x1050] = 0x01;
        chr[0x1058] = 0x01;
        chr
    }

    fn sprite_ppu() -> Ppu {
        let mut ppu = Ppu::new();
        ppu.set_chr_data(Some(sprite_chr()));
        ppu.oam.fill(0xFF);
        ppu
    }

    fn place_sprite(ppu: &mut Ppu, slot: usize, y: u8, tile: u8, attr: u8, x: u8) {
        ppu.oam[slot * 4..slot * 4 + 4].copy_from_slice(&[y, tile, attr, x]);
    }

    /// Runs one frame with `ctrl` and `mask` set during vblank and returns
    /// the palette index of every pixel.
    fn render_indices(ppu: &mut Ppu, ctrl: u8, mask: u8) -> Vec<u8> {
        set_line(ppu, 250);
        ppu.write(PPUCTRL, ctrl);
        ppu.write(PPUMASK, mask);
        set_line(ppu, 261);
        ppu.clear_vblank();
        set_line(ppu, 241);
        ppu.set_vblank();
        let mut pixels = vec![0u8; FRAME_WIDTH * FRAME_HEIGHT * 4];
        ppu.render(&mut pixels);
        ppu.offscreen.iter().map(|&index| index & 0x1F).collect()
    }

    fn at(indices: &[u8], x: usize, y: usize) -> u8 {
        indices[y * FRAME_WIDTH + x]
    }

    #[test]
    fn sprite_flips_pick_the_mirrored_pixel() {
        let mut ppu = sprite_ppu();
        place_sprite(&mut ppu, 0, 19, 1, 0x00, 40);
        place_sprite(&mut ppu, 1, 19, 1, 0x41, 60);
        place_sprite(&mut ppu, 2, 39, 1, 0x82, 40);
        place_sprite(&mut ppu, 3, 59, 1, 0xC3, 40);
        let frame = render_indices(&mut ppu, 0, MASK_SHOW_SPRITES | MASK_SHOW_SPRITE_LEFT);

        assert_eq!(at(&frame, 40, 20), 0x11);
        assert_eq!(at(&frame, 47, 20), 0);
        assert_eq!(at(&frame, 67, 20), 0x15);
        assert_eq!(at(&frame, 60, 20), 0);
        assert_eq!(at(&frame, 40, 47), 0x19);
        assert_eq!(at(&frame, 40, 40), 0);
        assert_eq!(at(&frame, 47, 67), 0x1D);
        assert_eq!(at(&frame, 40, 60), 0);
    }

    #[test]
    fn lower_oam_index_wins_overlaps() {
        let mut ppu = sprite_ppu();
        place_sprite(&mut ppu, 4, 99, 3, 0x01, 100);
        place_sprite(&mut ppu, 5, 99, 3, 0x02, 104);
        let frame = render_indices(&mut ppu, 0, MASK_SHOW_SPRITES | MASK_SHOW_SPRITE_LEFT);

        assert_eq!(at(&frame, 100, 100), 0x15);
        assert_eq!(at(&frame, 105, 100), 0x15);
        assert_eq!(at(&frame, 107, 107), 0x15);
        assert_eq!(at(&frame, 110, 100), 0x19);
    }

    #[test]
    fn left_column_mask_hides_sprite_pixels() {
        let mut ppu = sprite_ppu();
        place_sprite(&mut ppu, 0, 149, 3, 0x00, 2);

        let frame = render_indices(&mut ppu, 0, MASK_SHOW_SPRITES);
        assert_eq!(at(&frame, 2, 150), 0);
        assert_eq!(at(&frame, 7, 150), 0);
        assert_eq!(at(&frame, 8, 150), 0x11);
        assert_eq!(at(&frame, 9, 150), 0x11);

        let frame = render_indices(&mut ppu, 0, MASK_SHOW_SPRITES | MASK_SHOW_SPRITE_LEFT);
        assert_eq!(at(&frame, 2, 150), 0x11);
    }

    #[test]
    fn behind_background_sprites_show_only_through_transparent_tiles() {
        let mut ppu = sprite_ppu();
        // Tile 1 of the upper table is blank: one transparent hole at
        // coarse (10, 5) in a solid background.
        ppu.vram[0x2000 + 5 * 32 + 10] = 1;
        place_sprite(&mut ppu, 0, 19, 3, 0x20, 40);
        place_sprite(&mut ppu, 1, 19, 3, 0x00, 80);
        place_sprite(&mut ppu, 2, 39, 3, 0x20, 80);
        let mask = MASK_SHOW_BG | MASK_SHOW_BG_LEFT | MASK_SHOW_SPRITES | MASK_SHOW_SPRITE_LEFT;
        let frame = render_indices(&mut ppu, CTRL_BG_TABLE, mask);

        assert_eq!(at(&frame, 30, 20), 0x01);
        assert_eq!(at(&frame, 40, 20), 0x01);
        assert_eq!(at(&frame, 80, 20), 0x11);
        assert_eq!(at(&frame, 80, 40), 0x11);
        assert_eq!(at(&frame, 88, 40), 0x01);
    }

    #[test]
    fn tall_sprites_take_their_bank_from_tile_bit_zero() {
        let mut ppu = sprite_ppu();
        place_sprite(&mut ppu, 0, 19, 0x05, 0x00, 40);
        place_sprite(&mut ppu, 1, 19, 0x05, 0x80, 80);
        place_sprite(&mut ppu, 2, 19, 0x04, 0x00, 120);
        let frame = render_indices(
            &mut ppu,
            CTRL_SPRITE_SIZE_16,
            MASK_SHOW_SPRITES | MASK_SHOW_SPRITE_LEFT,
        );

        assert_eq!(at(&frame, 47, 28), 0x13);
        assert_eq!(at(&frame, 47, 20), 0);
        assert_eq!(at(&frame, 87, 27), 0x13);
        assert_eq!(at(&frame, 87, 28), 0);
        let even_tile = (20..36).all(|y| (120..128).all(|x| at(&frame, x, y) == 0));
        assert!(even_tile);
    }

    #[test]
    fn save_and_load_restore_raw_state() {
        let mut ppu = Ppu::new();
        ppu.write(PPUCTRL, 0x91);
        ppu.write(PPUMASK, 0x1E);
        ppu.write(OAMADDR, 0x10);
        ppu.write(OAMDATA, 0x42);
        ppu.write(PPUADDR, 0x21);
        ppu.write(PPUADDR, 0x00);
        ppu.write(PPUDATA, 0x77);
        let saved = ppu.save();
        assert!(saved.vram.is_some());

        let mut restored = Ppu::new();
        restored.load(&saved).unwrap();
        assert_eq!(restored.save(), saved);
        assert_eq!(restored.hstatus.ppu_mask, 0x1E);
        assert_eq!(restored.scroll_temp() & 0x0C00, 0x0400);
        assert_eq!(restored.events.pending().len(), 1);

        let mut chr_rom = Ppu::new();
        chr_rom.set_chr_data(Some(vec![0; 0x2000]));
        assert!(chr_rom.load(&saved).is_err());
    }
}
