pub mod apu;
pub mod bus;
pub mod cartridge;
pub mod cpu;
pub mod hevent;
pub mod mapper;
mod palette;
pub mod ppu;
pub mod state;

use anyhow::{Result, bail, ensure};
use std::{collections::VecDeque, path::Path};

use apu::{Apu, ChannelKind};
use bus::{Bus, ReadHandler, WriteHandler};
use cartridge::Cartridge;
use cpu::{Cpu, CpuBus, IRQ_APU, IRQ_MAPPER};
use mapper::{Mapper, VideoPort, create_mapper, mapper_name};
use ppu::{FRAME_HEIGHT, FRAME_WIDTH, MirrorMode, Ppu, PpuDebugCounters};
use state::SaveState;

pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

pub(crate) const FLAG_CARRY: u8 = 0x01;
pub(crate) const FLAG_ZERO: u8 = 0x02;
pub(crate) const FLAG_INTERRUPT: u8 = 0x04;
pub(crate) const FLAG_DECIMAL: u8 = 0x08;
pub(crate) const FLAG_BREAK: u8 = 0x10;
pub(crate) const FLAG_UNUSED: u8 = 0x20;
pub(crate) const FLAG_OVERFLOW: u8 = 0x40;
pub(crate) const FLAG_NEGATIVE: u8 = 0x80;

pub const CPU_HZ: u32 = 1_789_773;
/// PPU dots per scanline; the PPU runs three dots per CPU cycle.
pub const DOTS_PER_LINE: u32 = 341;
pub const TOTAL_LINES: u16 = 262;
pub const VBLANK_LINE: u16 = 241;
pub const PRE_RENDER_LINE: u16 = 261;
pub const CYCLES_PER_FRAME: u32 = 29_780;

const RAM_SIZE: usize = 0x800;
const PRG_RAM_SIZE: usize = 0x2000;
const OAM_DMA_CYCLES: u32 = 513;
const MAX_DEBUG_EVENTS: usize = 512;

#[derive(Debug, Clone, Copy, Default)]
pub struct NesDebugCounters {
    pub frame_count: u64,
    pub cpu_steps: u64,
    pub cpu_reads: u64,
    pub cpu_writes: u64,
    pub cpu_reads_ram: u64,
    pub cpu_reads_ppu_regs: u64,
    pub cpu_reads_apu_io: u64,
    pub cpu_reads_cart: u64,
    pub cpu_writes_ram: u64,
    pub cpu_writes_ppu_regs: u64,
    pub cpu_writes_apu_io: u64,
    pub cpu_writes_cart: u64,
    pub open_bus_reads: u64,
    pub ignored_writes: u64,
    pub dma_transfers: u64,
    pub nmi_raised: u64,
    pub last_cpu_read_addr: u16,
    pub last_cpu_write_addr: u16,
    pub last_cpu_write_value: u8,
}

/// Handed to the vblank callback once per frame, right after rendering.
pub struct VblankFrame<'a> {
    pub frame: u64,
    /// RGBA, 256x240.
    pub pixels: &'a [u8],
    /// Controller masks for the next frame.
    pub pads: &'a mut [u8; 2],
}

pub type VblankCallback = Box<dyn FnMut(&mut VblankFrame<'_>)>;
pub type BreakpointCallback = Box<dyn FnMut(u16)>;

/// Input source driven once per frame from the console's work RAM.
pub trait AutoPlayer {
    fn push_ram_snapshot(&mut self, ram: &[u8]);
    fn next_button_mask(&mut self) -> u8;
}

/// Everything on the CPU side of the bus. Accesses are routed through
/// the hook table to the device that claimed the address.
struct Board {
    bus: Bus,
    ram: [u8; RAM_SIZE],
    prg_ram: Vec<u8>,
    ppu: Ppu,
    apu: Apu,
    mapper: Option<Box<dyn Mapper>>,
    header_mirroring: MirrorMode,

    pads: [u8; 2],
    pad_shift: [u8; 2],
    pad_strobe: bool,
    open_bus: u8,

    cpu_cycles: u64,
    dma_stall: u32,
    debug: NesDebugCounters,
    debug_events: VecDeque<String>,
}

impl Board {
    fn new() -> Self {
        Self {
            bus: Bus::new(),
            ram: [0; RAM_SIZE],
            prg_ram: vec![0; PRG_RAM_SIZE],
            ppu: Ppu::new(),
            apu: Apu::new(),
            mapper: None,
            header_mirroring: MirrorMode::default(),
            pads: [0; 2],
            pad_shift: [0; 2],
            pad_strobe: false,
            open_bus: 0,
            cpu_cycles: 0,
            dma_stall: 0,
            debug: NesDebugCounters::default(),
            debug_events: VecDeque::with_capacity(MAX_DEBUG_EVENTS),
        }
    }

    fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        if self.debug_events.len() >= MAX_DEBUG_EVENTS {
            self.debug_events.pop_front();
        }
        self.debug_events.push_back(event.into());
    }

    /// Rebuilds the hook table. The mapper installs last so it owns the
    /// cartridge window and publishes its power-on banks.
    fn install_handlers(&mut self) {
        self.bus.clear();
        self.bus.install_read_handler(0x0000, 0x1FFF, ReadHandler::Ram);
        self.bus.install_write_handler(0x0000, 0x1FFF, WriteHandler::Ram);
        self.bus.install_read_handler(0x2000, 0x3FFF, ReadHandler::PpuRegister);
        self.bus.install_write_handler(0x2000, 0x3FFF, WriteHandler::PpuRegister);
        self.bus.install_write_handler(0x4000, 0x4013, WriteHandler::Apu);
        self.bus.install_write_handler(0x4014, 0x4014, WriteHandler::OamDma);
        self.bus.install_read_handler(0x4015, 0x4015, ReadHandler::ApuStatus);
        self.bus.install_write_handler(0x4015, 0x4015, WriteHandler::Apu);
        self.bus.install_read_handler(0x4016, 0x4016, ReadHandler::Controller(0));
        self.bus.install_write_handler(0x4016, 0x4016, WriteHandler::ControllerStrobe);
        self.bus.install_read_handler(0x4017, 0x4017, ReadHandler::Controller(1));
        self.bus.install_write_handler(0x4017, 0x4017, WriteHandler::Apu);
        self.bus.install_read_handler(0x6000, 0x7FFF, ReadHandler::PrgRam);
        self.bus.install_write_handler(0x6000, 0x7FFF, WriteHandler::PrgRam);

        self.ppu.set_mirror_mode(self.header_mirroring);
        if let Some(mapper) = self.mapper.as_mut() {
            mapper.install(&mut self.bus, &mut self.ppu);
        }
    }

    fn read_controller(&mut self, port: usize) -> u8 {
        let bit = if self.pad_strobe {
            self.pads[port] & 0x01
        } else {
            let out = self.pad_shift[port] & 0x01;
            self.pad_shift[port] = (self.pad_shift[port] >> 1) | 0x80;
            out
        };
        0x40 | bit
    }

    fn write_controller_strobe(&mut self, value: u8) {
        self.pad_strobe = (value & 0x01) != 0;
        if self.pad_strobe {
            self.pad_shift = self.pads;
        }
    }

    fn oam_dma(&mut self, page: u8) {
        self.debug.dma_transfers = self.debug.dma_transfers.wrapping_add(1);
        let base = (page as u16) << 8;
        let mut bytes = [0u8; 256];
        for (idx, slot) in bytes.iter_mut().enumerate() {
            *slot = self.read(base.wrapping_add(idx as u16));
        }
        self.ppu.copy_with_dma(&bytes);

        // One extra alignment cycle when the DMA starts on an odd cycle.
        let stall = OAM_DMA_CYCLES + (self.cpu_cycles & 1) as u32;
        self.dma_stall = self.dma_stall.saturating_add(stall);
        log::debug!("OAM DMA page=${page:02X} stall={stall}");
        self.push_debug_event(format!("OAM DMA page=${page:02X} stall_cycles={stall}"));
    }

    fn irq_lines(&self) -> (bool, bool) {
        let mapper_irq = self
            .mapper
            .as_ref()
            .is_some_and(|mapper| mapper.irq_pending());
        (self.apu.irq_pending(), mapper_irq)
    }

    /// Side-effect free read for inspectors.
    fn peek(&self, addr: u16) -> u8 {
        match self.bus.read_handler(addr) {
            ReadHandler::Ram => self.ram[addr as usize & (RAM_SIZE - 1)],
            ReadHandler::PrgRam => self.prg_ram[addr as usize & (PRG_RAM_SIZE - 1)],
            ReadHandler::PpuRegister => self.ppu.registers()[addr as usize & 7],
            ReadHandler::Mapper => self
                .mapper
                .as_ref()
                .map_or(self.open_bus, |mapper| mapper.cpu_read(addr)),
            _ => self.open_bus,
        }
    }
}

impl CpuBus for Board {
    fn read(&mut self, addr: u16) -> u8 {
        self.debug.cpu_reads = self.debug.cpu_reads.wrapping_add(1);
        self.debug.last_cpu_read_addr = addr;
        let value = match self.bus.read_handler(addr) {
            ReadHandler::OpenBus => {
                self.debug.open_bus_reads = self.debug.open_bus_reads.wrapping_add(1);
                log::trace!("open bus read ${addr:04X}");
                self.open_bus
            }
            ReadHandler::Ram => {
                self.debug.cpu_reads_ram = self.debug.cpu_reads_ram.wrapping_add(1);
                self.ram[addr as usize & (RAM_SIZE - 1)]
            }
            ReadHandler::PpuRegister => {
                self.debug.cpu_reads_ppu_regs = self.debug.cpu_reads_ppu_regs.wrapping_add(1);
                self.ppu.read(addr as usize & 7)
            }
            ReadHandler::ApuStatus => {
                self.debug.cpu_reads_apu_io = self.debug.cpu_reads_apu_io.wrapping_add(1);
                // Bit 5 is not driven.
                self.apu.read_status() | (self.open_bus & 0x20)
            }
            ReadHandler::Controller(port) => {
                self.debug.cpu_reads_apu_io = self.debug.cpu_reads_apu_io.wrapping_add(1);
                self.read_controller(port as usize & 1)
            }
            ReadHandler::PrgRam => {
                self.debug.cpu_reads_cart = self.debug.cpu_reads_cart.wrapping_add(1);
                self.prg_ram[addr as usize & (PRG_RAM_SIZE - 1)]
            }
            ReadHandler::Mapper => {
                self.debug.cpu_reads_cart = self.debug.cpu_reads_cart.wrapping_add(1);
                match self.mapper.as_ref() {
                    Some(mapper) => mapper.cpu_read(addr),
                    None => self.open_bus,
                }
            }
        };
        self.open_bus = value;
        value
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.debug.cpu_writes = self.debug.cpu_writes.wrapping_add(1);
        self.debug.last_cpu_write_addr = addr;
        self.debug.last_cpu_write_value = value;
        self.open_bus = value;
        match self.bus.write_handler(addr) {
            WriteHandler::Ignore => {
                self.debug.ignored_writes = self.debug.ignored_writes.wrapping_add(1);
                log::trace!("ignored write ${addr:04X} <- ${value:02X}");
            }
            WriteHandler::Ram => {
                self.debug.cpu_writes_ram = self.debug.cpu_writes_ram.wrapping_add(1);
                self.ram[addr as usize & (RAM_SIZE - 1)] = value;
            }
            WriteHandler::PpuRegister => {
                self.debug.cpu_writes_ppu_regs = self.debug.cpu_writes_ppu_regs.wrapping_add(1);
                self.ppu.write(addr as usize & 7, value);
            }
            WriteHandler::Apu => {
                self.debug.cpu_writes_apu_io = self.debug.cpu_writes_apu_io.wrapping_add(1);
                self.apu.write_register(addr, value);
            }
            WriteHandler::OamDma => {
                self.debug.cpu_writes_apu_io = self.debug.cpu_writes_apu_io.wrapping_add(1);
                self.oam_dma(value);
            }
            WriteHandler::ControllerStrobe => {
                self.debug.cpu_writes_apu_io = self.debug.cpu_writes_apu_io.wrapping_add(1);
                self.write_controller_strobe(value);
            }
            WriteHandler::PrgRam => {
                self.debug.cpu_writes_cart = self.debug.cpu_writes_cart.wrapping_add(1);
                self.prg_ram[addr as usize & (PRG_RAM_SIZE - 1)] = value;
            }
            WriteHandler::Mapper => {
                self.debug.cpu_writes_cart = self.debug.cpu_writes_cart.wrapping_add(1);
                if let Some(mapper) = self.mapper.as_mut() {
                    mapper.cpu_write(addr, value, &mut self.ppu);
                }
            }
        }
    }
}

pub struct Nes {
    cpu: Cpu,
    board: Board,
    mapper_name: String,

    hcount: u16,
    line_dots: u32,
    frame_carry: u32,
    frame_buffer: Vec<u8>,

    vblank_callback: Option<VblankCallback>,
    breakpoint_callback: Option<BreakpointCallback>,
    breakpoints: Vec<u16>,
    /// Breakpoint just reported; skipped once so a resume can leave it.
    last_break: Option<u16>,
}

impl Default for Nes {
    fn default() -> Self {
        Self::new()
    }
}

impl Nes {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new(),
            board: Board::new(),
            mapper_name: "No ROM loaded".to_string(),
            hcount: 0,
            line_dots: 0,
            frame_carry: 0,
            frame_buffer: vec![0; FRAME_WIDTH * FRAME_HEIGHT * 4],
            vblank_callback: None,
            breakpoint_callback: None,
            breakpoints: Vec::new(),
            last_break: None,
        }
    }

    pub fn mapper_name(&self) -> &str {
        &self.mapper_name
    }

    pub fn has_rom(&self) -> bool {
        self.board.mapper.is_some()
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn ppu(&self) -> &Ppu {
        &self.board.ppu
    }

    pub fn hcount(&self) -> u16 {
        self.hcount
    }

    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    /// Work RAM, as handed to an [`AutoPlayer`].
    pub fn ram(&self) -> &[u8] {
        &self.board.ram
    }

    pub fn set_vblank_callback(&mut self, callback: VblankCallback) {
        self.vblank_callback = Some(callback);
    }

    pub fn set_breakpoint_callback(&mut self, callback: BreakpointCallback) {
        self.breakpoint_callback = Some(callback);
    }

    pub fn add_breakpoint(&mut self, pc: u16) {
        if !self.breakpoints.contains(&pc) {
            self.breakpoints.push(pc);
        }
    }

    pub fn remove_breakpoint(&mut self, pc: u16) {
        self.breakpoints.retain(|&bp| bp != pc);
    }

    pub fn breakpoints(&self) -> &[u16] {
        &self.breakpoints
    }

    pub fn pause(&mut self) {
        self.cpu.pause();
    }

    pub fn resume(&mut self) {
        self.cpu.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.cpu.is_paused()
    }

    pub fn set_pad_status(&mut self, port: usize, mask: u8) {
        self.board.pads[port & 1] = mask;
        if self.board.pad_strobe {
            self.board.pad_shift = self.board.pads;
        }
    }

    pub fn load_rom(&mut self, bytes: &[u8]) -> Result<()> {
        self.unload();
        let cart = Cartridge::from_bytes(bytes)?;
        self.load_cartridge(cart)
    }

    pub fn load_rom_from_path(&mut self, path: &Path) -> Result<()> {
        self.unload();
        let cart = Cartridge::from_file(path)?;
        self.load_cartridge(cart)
    }

    fn unload(&mut self) {
        self.board.mapper = None;
        self.board.bus.clear();
        self.mapper_name = "No ROM loaded".to_string();
    }

    fn load_cartridge(&mut self, cart: Cartridge) -> Result<()> {
        let mapper_id = cart.mapper_id;
        let mirroring = cart.mirroring;
        let chr_rom = cart.chr_rom.clone();
        let mapper = create_mapper(cart)?;

        self.board.ppu.set_chr_data(chr_rom);
        self.board.header_mirroring = mirroring;
        self.board.mapper = Some(mapper);
        self.board.ram.fill(0);
        self.board.prg_ram.fill(0);
        self.mapper_name = format!("{} (mapper {mapper_id})", mapper_name(mapper_id));
        self.reset();
        log::info!("ROM loaded: {}", self.mapper_name);
        self.board.push_debug_event(format!("ROM loaded: {}", self.mapper_name));
        Ok(())
    }

    /// Console reset. The mapper re-publishes its banks and mirroring.
    pub fn reset(&mut self) {
        if self.board.mapper.is_none() {
            return;
        }

        self.board.ppu.reset();
        self.board.apu.reset();
        self.board.pad_shift = [0; 2];
        self.board.pad_strobe = false;
        self.board.open_bus = 0;
        self.board.dma_stall = 0;
        self.board.debug = NesDebugCounters::default();
        self.board.debug_events.clear();
        self.board.install_handlers();
        self.board.ppu.restore_scroll();

        self.hcount = 0;
        self.line_dots = 0;
        self.frame_carry = 0;
        self.last_break = None;
        self.cpu.reset(&mut self.board);
        log::info!("reset, PC=${:04X}", self.cpu.pc());
        self.board
            .push_debug_event(format!("CPU reset, PC=${:04X}", self.cpu.pc()));
    }

    /// Executes one CPU step and advances the video timing by the cycles
    /// it took.
    pub fn step(&mut self) -> u32 {
        let jams = self.cpu.debug_counters().jam_count;
        self.board.cpu_cycles = self.cpu.cycles();
        self.board.debug.cpu_steps = self.board.debug.cpu_steps.wrapping_add(1);

        let cycles = self.cpu.step(&mut self.board);
        if self.board.dma_stall > 0 {
            self.cpu.stall(std::mem::take(&mut self.board.dma_stall));
        }
        self.board.apu.run_cycles(cycles);
        self.sync_irq_lines();

        self.line_dots += cycles * 3;
        while self.line_dots >= DOTS_PER_LINE {
            self.line_dots -= DOTS_PER_LINE;
            self.next_hblank();
        }

        if self.cpu.debug_counters().jam_count != jams {
            let pc = self.cpu.pc();
            self.board.push_debug_event(format!("CPU jammed at ${pc:04X}"));
            if let Some(callback) = self.breakpoint_callback.as_mut() {
                callback(pc);
            }
        }
        cycles
    }

    /// Runs until at least `cycles` CPU cycles have elapsed and returns how
    /// far the last instruction overshot. A pause, whether already set,
    /// hit at a breakpoint or caused by a jam, ends the batch early.
    pub fn run_cycles(&mut self, cycles: u32) -> u32 {
        if !self.has_rom() {
            return 0;
        }

        let mut elapsed = 0u32;
        while elapsed < cycles {
            if self.cpu.is_paused() || self.check_breakpoint() {
                return 0;
            }
            elapsed += self.step();
            self.last_break = None;
        }
        elapsed - cycles
    }

    /// Runs one frame's worth of cycles, carrying the previous overshoot.
    pub fn run_frame(&mut self) -> u32 {
        let target = CYCLES_PER_FRAME.saturating_sub(self.frame_carry);
        self.frame_carry = self.run_cycles(target);
        self.frame_carry
    }

    /// Feeds `player` one RAM snapshot, applies its button mask to pad 0,
    /// then runs a frame.
    pub fn step_frame_with(&mut self, player: &mut dyn AutoPlayer) -> u32 {
        player.push_ram_snapshot(self.ram());
        let mask = player.next_button_mask();
        self.set_pad_status(0, mask);
        self.run_frame()
    }

    fn check_breakpoint(&mut self) -> bool {
        if self.breakpoints.is_empty() {
            return false;
        }
        let pc = self.cpu.pc();
        if self.last_break == Some(pc) || !self.breakpoints.contains(&pc) {
            return false;
        }
        self.last_break = Some(pc);
        self.cpu.pause();
        self.board.push_debug_event(format!("breakpoint ${pc:04X}"));
        if let Some(callback) = self.breakpoint_callback.as_mut() {
            callback(pc);
        }
        true
    }

    fn next_hblank(&mut self) {
        self.hcount = (self.hcount + 1) % TOTAL_LINES;
        let hcount = self.hcount;
        self.board.ppu.set_hcount(hcount);

        match hcount {
            VBLANK_LINE => {
                self.board.ppu.set_vblank();
                self.board.ppu.render(&mut self.frame_buffer);
                self.board.debug.frame_count = self.board.debug.frame_count.wrapping_add(1);
                if let Some(callback) = self.vblank_callback.as_mut() {
                    let mut frame = VblankFrame {
                        frame: self.board.debug.frame_count,
                        pixels: &self.frame_buffer,
                        pads: &mut self.board.pads,
                    };
                    callback(&mut frame);
                }
                if self.board.ppu.nmi_enabled() {
                    self.board.debug.nmi_raised = self.board.debug.nmi_raised.wrapping_add(1);
                    self.cpu.raise_nmi();
                }
            }
            PRE_RENDER_LINE => self.board.ppu.clear_vblank(),
            _ => {}
        }

        let rendering = self.board.ppu.rendering_enabled();
        if let Some(mapper) = self.board.mapper.as_mut() {
            mapper.on_hblank(hcount, rendering);
        }
        self.sync_irq_lines();
    }

    fn sync_irq_lines(&mut self) {
        let (apu_irq, mapper_irq) = self.board.irq_lines();
        self.cpu.set_irq(IRQ_APU, apu_irq);
        self.cpu.set_irq(IRQ_MAPPER, mapper_irq);
    }

    pub fn save_state(&self) -> Result<SaveState> {
        let Some(mapper) = self.board.mapper.as_ref() else {
            bail!("cannot save state without a loaded ROM");
        };
        Ok(SaveState {
            mapper_id: mapper.mapper_id(),
            cpu: self.cpu.save(),
            ram: self.board.ram.to_vec(),
            prg_ram: self.board.prg_ram.clone(),
            ppu: self.board.ppu.save(),
            apu: self.board.apu.save()?,
            mapper: mapper.save_regs(),
            hcount: self.hcount,
            line_dots: self.line_dots,
        })
    }

    /// Restores a saved machine. Recorded scanline events are not part of
    /// the blob; replay restarts from the restored registers.
    pub fn load_state(&mut self, state: &SaveState) -> Result<()> {
        let Some(mapper_id) = self.board.mapper.as_ref().map(|m| m.mapper_id()) else {
            bail!("cannot load state without a loaded ROM");
        };
        ensure!(
            state.mapper_id == mapper_id,
            "save state is for mapper {}, loaded ROM uses mapper {mapper_id}",
            state.mapper_id
        );
        ensure!(
            state.ram.len() == RAM_SIZE,
            "RAM state is {} bytes, expected {RAM_SIZE}",
            state.ram.len()
        );
        ensure!(
            state.prg_ram.len() == PRG_RAM_SIZE,
            "PRG RAM state is {} bytes, expected {PRG_RAM_SIZE}",
            state.prg_ram.len()
        );
        ensure!(state.hcount < TOTAL_LINES, "invalid scanline {}", state.hcount);
        ensure!(state.line_dots < DOTS_PER_LINE, "invalid dot {}", state.line_dots);

        self.cpu.load(&state.cpu)?;
        self.board.ppu.load(&state.ppu)?;
        self.board.apu.load(&state.apu)?;
        self.board.ppu.restore_hcount(state.hcount);
        if let Some(mapper) = self.board.mapper.as_mut() {
            mapper.load_regs(&state.mapper, &mut self.board.ppu)?;
        }
        self.board.ppu.restore_scroll();

        self.board.ram.copy_from_slice(&state.ram);
        self.board.prg_ram.copy_from_slice(&state.prg_ram);
        self.board.dma_stall = 0;
        self.hcount = state.hcount;
        self.line_dots = state.line_dots;
        self.frame_carry = 0;
        self.last_break = None;
        self.sync_irq_lines();
        self.board.push_debug_event("save state loaded");
        Ok(())
    }

    /// Loads `state`; on failure the console is reset and the error is
    /// still returned for the caller to report.
    pub fn load_state_or_reset(&mut self, state: &SaveState) -> Result<()> {
        let result = self.load_state(state);
        if let Err(err) = &result {
            log::warn!("save state rejected, resetting: {err:#}");
            self.reset();
        }
        result
    }

    pub fn sound_channel_count(&self) -> usize {
        self.board.apu.channel_count()
    }

    pub fn sound_channel_kind(&self, ch: usize) -> Option<ChannelKind> {
        self.board.apu.channel_kind(ch)
    }

    pub fn sound_frequency(&self, ch: usize) -> f32 {
        self.board.apu.frequency(ch)
    }

    pub fn sound_duty_ratio(&self, ch: usize) -> f32 {
        self.board.apu.duty_ratio(ch)
    }

    pub fn sound_volume(&self, ch: usize) -> f32 {
        self.board.apu.volume(ch)
    }

    pub fn debug_peek(&self, addr: u16) -> u8 {
        self.board.peek(addr)
    }

    pub fn debug_counters(&self) -> NesDebugCounters {
        self.board.debug
    }

    pub fn debug_ppu_counters(&self) -> PpuDebugCounters {
        self.board.ppu.debug_counters()
    }

    pub fn debug_mapper_state(&self) -> String {
        match self.board.mapper.as_ref() {
            Some(mapper) => {
                let state = mapper.debug_state();
                if state.is_empty() {
                    format!("{} banks={:05X?}", self.mapper_name, mapper.prg_bank_offsets())
                } else {
                    state
                }
            }
            None => "No mapper".to_string(),
        }
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        self.board
            .debug_events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartridge::tests::build_rom;
    use std::{cell::Cell, rc::Rc};

    const PRG_START: usize = 16;

    /// iNES image with `program` at `$8000` and the vectors pointing at
    /// `nmi`, `$8000` and `irq`.
    fn program_rom(mapper_id: u8, prg_banks: u8, program: &[u8], nmi: u16, irq: u16) -> Vec<u8> {
        let mut rom = build_rom(mapper_id, prg_banks, 0, 0);
        rom[PRG_START..PRG_START + program.len()].copy_from_slice(program);
        let end = PRG_START + prg_banks as usize * 0x4000;
        let vectors = [nmi.to_le_bytes(), 0x8000u16.to_le_bytes(), irq.to_le_bytes()].concat();
        rom[end - 6..end].copy_from_slice(&vectors);
        rom
    }

    fn spin_rom() -> Vec<u8> {
        // JMP $8000
        program_rom(0, 1, &[0x4C, 0x00, 0x80], 0x8000, 0x8000)
    }

    /// Enables NMI, then spins; the handler counts into `$10`.
    fn nmi_counter_rom() -> Vec<u8> {
        #[rustfmt::skip]
        let program = [
            0xA9, 0x80,       // LDA #$80
            0x8D, 0x00, 0x20, // STA $2000
            0x4C, 0x05, 0x80, // JMP $8005
            0xE6, 0x10,       // INC $10
            0x40,             // RTI
        ];
        program_rom(0, 1, &program, 0x8008, 0x800A)
    }

    #[test]
    fn one_frame_of_cycles_fires_one_vblank() {
        let mut nes = Nes::new();
        nes.load_rom(&spin_rom()).unwrap();

        let vblanks = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&vblanks);
        nes.set_vblank_callback(Box::new(move |frame| {
            assert_eq!(frame.pixels.len(), FRAME_WIDTH * FRAME_HEIGHT * 4);
            seen.set(seen.get() + 1);
        }));

        let overshoot = nes.run_cycles(CYCLES_PER_FRAME);
        assert_eq!(vblanks.get(), 1);
        assert!(nes.cpu().cycles() >= CYCLES_PER_FRAME as u64);
        assert!(overshoot < 3);
    }

    #[test]
    fn vblank_raises_nmi_when_enabled() {
        let mut nes = Nes::new();
        nes.load_rom(&nmi_counter_rom()).unwrap();
        for _ in 0..3 {
            nes.run_frame();
        }
        assert_eq!(nes.ram()[0x10], 3);
        assert_eq!(nes.cpu().debug_counters().nmi_serviced, 3);
        assert_eq!(nes.debug_counters().frame_count, 3);
    }

    #[test]
    fn load_errors_leave_console_unloaded() {
        let mut nes = Nes::new();
        nes.load_rom(&spin_rom()).unwrap();
        assert!(nes.has_rom());
        assert_eq!(nes.mapper_name(), "NROM (mapper 0)");

        let mut bad = spin_rom();
        bad[0] = b'X';
        let err = nes.load_rom(&bad).unwrap_err();
        assert!(err.to_string().contains("magic"));
        assert!(!nes.has_rom());
        assert_eq!(nes.run_cycles(100), 0);

        let err = nes.load_rom(&build_rom(5, 1, 0, 0)).unwrap_err();
        assert_eq!(err.to_string(), "mapper 5 is not supported");
        assert!(!nes.has_rom());
    }

    #[test]
    fn axrom_page_select_switches_visible_nametable() {
        let mut nes = Nes::new();
        nes.load_rom(&program_rom(7, 2, &[0x4C, 0x00, 0x80], 0x8000, 0x8000))
            .unwrap();
        let board = &mut nes.board;
        assert_eq!(board.ppu.mirror_mode(), MirrorMode::SingleScreen0);

        board.write(0x8000, 0x10);
        assert_eq!(board.ppu.mirror_mode(), MirrorMode::SingleScreen1);
        board.write(0x2006, 0x20);
        board.write(0x2006, 0x00);
        board.write(0x2007, 0xAA);

        fn read_nametable(board: &mut Board) -> u8 {
            board.read(0x2002);
            board.write(0x2006, 0x2C);
            board.write(0x2006, 0x00);
            board.read(0x2007);
            board.read(0x2007)
        }
        assert_eq!(read_nametable(board), 0xAA);

        board.write(0x8000, 0x00);
        assert_eq!(board.ppu.mirror_mode(), MirrorMode::SingleScreen0);
        assert_eq!(read_nametable(board), 0x00);

        board.write(0x8000, 0x10);
        assert_eq!(read_nametable(board), 0xAA);
    }

    #[test]
    fn oam_dma_copies_page_and_stalls_cpu() {
        let mut nes = Nes::new();
        nes.load_rom(&spin_rom()).unwrap();
        for i in 0..256 {
            nes.board.ram[0x200 + i] = i as u8;
        }
        nes.board.cpu_cycles = 10;
        nes.board.write(0x4014, 0x02);
        assert_eq!(nes.board.dma_stall, 513);
        assert_eq!(nes.ppu().oam()[0x7F], 0x7F);
        assert_eq!(nes.debug_counters().dma_transfers, 1);

        nes.board.dma_stall = 0;
        nes.board.cpu_cycles = 11;
        nes.board.write(0x4014, 0x02);
        assert_eq!(nes.board.dma_stall, 514);
    }

    #[test]
    fn controller_reports_buttons_in_order() {
        let mut nes = Nes::new();
        nes.load_rom(&spin_rom()).unwrap();
        nes.set_pad_status(0, BUTTON_A | BUTTON_START | BUTTON_RIGHT);

        nes.board.write(0x4016, 1);
        nes.board.write(0x4016, 0);
        let bits: Vec<u8> = (0..8).map(|_| nes.board.read(0x4016) & 1).collect();
        assert_eq!(bits, vec![1, 0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(nes.board.read(0x4016), 0x41);
        assert_eq!(nes.board.read(0x4017), 0x40);
    }

    #[test]
    fn unmapped_reads_return_last_bus_value() {
        let mut nes = Nes::new();
        nes.load_rom(&spin_rom()).unwrap();
        nes.board.ram[0] = 0x5A;
        nes.board.read(0x0800);
        assert_eq!(nes.board.read(0x5000), 0x5A);
        nes.board.write(0x5000, 0x33);
        assert_eq!(nes.board.read(0x4020), 0x33);
        assert_eq!(nes.debug_counters().open_bus_reads, 2);
    }

    #[test]
    fn save_and_load_state_round_trip() {
        let mut nes = Nes::new();
        nes.load_rom(&nmi_counter_rom()).unwrap();
        nes.run_frame();
        nes.run_cycles(1234);
        nes.board.prg_ram[5] = 0x99;

        let saved = nes.save_state().unwrap();
        let json = saved.to_json().unwrap();

        let mut restored = Nes::new();
        restored.load_rom(&nmi_counter_rom()).unwrap();
        restored.load_state(&SaveState::from_json(&json).unwrap()).unwrap();
        assert_eq!(restored.save_state().unwrap(), saved);
        assert_eq!(restored.cpu().registers(), nes.cpu().registers());

        nes.run_cycles(CYCLES_PER_FRAME);
        restored.run_cycles(CYCLES_PER_FRAME);
        assert_eq!(restored.ram(), nes.ram());
        assert_eq!(restored.cpu().cycles(), nes.cpu().cycles());
    }

    #[test]
    fn mmc3_reset_keeps_mirroring_across_save_and_load() {
        let mut rom = program_rom(4, 2, &[0x4C, 0x00, 0x80], 0x8000, 0x8000);
        rom[6] |= 0x01;
        let mut nes = Nes::new();
        nes.load_rom(&rom).unwrap();
        assert_eq!(nes.ppu().mirror_mode(), MirrorMode::Vertical);

        nes.board.write(0xA000, 0x01);
        assert_eq!(nes.ppu().mirror_mode(), MirrorMode::Horizontal);
        nes.reset();
        assert_eq!(nes.ppu().mirror_mode(), MirrorMode::Vertical);

        let saved = nes.save_state().unwrap();
        let mut restored = Nes::new();
        restored.load_rom(&rom).unwrap();
        restored.load_state(&saved).unwrap();
        assert_eq!(restored.ppu().mirror_mode(), MirrorMode::Vertical);
        assert_eq!(restored.save_state().unwrap(), saved);
    }

    #[test]
    fn reset_and_load_state_leave_scroll_untouched() {
        for rom in [spin_rom(), program_rom(4, 2, &[0x4C, 0x00, 0x80], 0x8000, 0x8000)] {
            let mut nes = Nes::new();
            nes.load_rom(&rom).unwrap();
            assert_eq!((nes.ppu().scroll_temp(), nes.ppu().scroll_curr()), (0, 0));

            while nes.hcount() < 100 {
                nes.step();
            }
            let saved = nes.save_state().unwrap();
            let mut restored = Nes::new();
            restored.load_rom(&rom).unwrap();
            restored.load_state(&saved).unwrap();

            assert_eq!(restored.hcount(), 100);
            assert_eq!(restored.ppu().scroll_temp(), nes.ppu().scroll_temp());
            assert_eq!(restored.ppu().scroll_curr(), nes.ppu().scroll_curr());
            assert_eq!(restored.ppu().scroll_temp(), 0);
        }
    }

    #[test]
    fn mismatched_state_resets_console() {
        let mut source = Nes::new();
        source
            .load_rom(&program_rom(7, 2, &[0x4C, 0x00, 0x80], 0x8000, 0x8000))
            .unwrap();
        let foreign = source.save_state().unwrap();

        let mut nes = Nes::new();
        nes.load_rom(&spin_rom()).unwrap();
        nes.run_cycles(500);
        let err = nes.load_state_or_reset(&foreign).unwrap_err();
        assert!(err.to_string().contains("mapper 7"));
        assert_eq!(nes.cpu().pc(), 0x8000);
        assert_eq!(nes.hcount(), 0);

        let mut truncated = nes.save_state().unwrap();
        truncated.cpu.pop();
        assert!(nes.load_state_or_reset(&truncated).is_err());
    }

    #[test]
    fn breakpoint_pauses_and_resume_moves_past_it() {
        let mut nes = Nes::new();
        nes.load_rom(&nmi_counter_rom()).unwrap();
        let hits = Rc::new(Cell::new(0u32));
        let seen = Rc::clone(&hits);
        nes.set_breakpoint_callback(Box::new(move |pc| {
            assert_eq!(pc, 0x8005);
            seen.set(seen.get() + 1);
        }));
        nes.add_breakpoint(0x8005);

        assert_eq!(nes.run_cycles(100), 0);
        assert_eq!(hits.get(), 1);
        assert!(nes.is_paused());
        assert_eq!(nes.cpu().pc(), 0x8005);
        assert_eq!(nes.run_cycles(100), 0);
        assert_eq!(hits.get(), 1);

        nes.resume();
        nes.run_cycles(100);
        assert_eq!(hits.get(), 2);

        nes.remove_breakpoint(0x8005);
        nes.resume();
        assert!(nes.run_cycles(100) < 3);
    }

    #[test]
    fn auto_player_sees_ram_and_drives_pad_zero() {
        struct Recorder {
            snapshots: usize,
        }
        impl AutoPlayer for Recorder {
            fn push_ram_snapshot(&mut self, ram: &[u8]) {
                assert_eq!(ram.len(), RAM_SIZE);
                self.snapshots += 1;
            }
            fn next_button_mask(&mut self) -> u8 {
                BUTTON_B
            }
        }

        let mut nes = Nes::new();
        nes.load_rom(&spin_rom()).unwrap();
        let mut player = Recorder { snapshots: 0 };
        nes.step_frame_with(&mut player);
        nes.step_frame_with(&mut player);
        assert_eq!(player.snapshots, 2);
        assert_eq!(nes.board.pads[0], BUTTON_B);
    }

    #[test]
    fn sound_accessors_forward_to_apu() {
        let mut nes = Nes::new();
        nes.load_rom(&spin_rom()).unwrap();
        nes.board.write(0x4015, 0x01);
        nes.board.write(0x4000, 0x7F);
        nes.board.write(0x4002, 0xFD);
        nes.board.write(0x4003, 0x00);
        assert_eq!(nes.sound_channel_count(), 4);
        assert_eq!(nes.sound_channel_kind(2), Some(ChannelKind::Triangle));
        assert_eq!(nes.sound_duty_ratio(0), 0.25);
        assert_eq!(nes.sound_volume(0), 1.0);
        assert!(nes.sound_frequency(0) > 400.0);
    }
}
