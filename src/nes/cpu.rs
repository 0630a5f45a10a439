use anyhow::{Result, ensure};

use super::{
    FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO,
};

/// Memory seen by the 6502. The console board implements this over the
/// hook table; tests use a flat 64K array.
pub trait CpuBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
}

pub const IRQ_APU: u8 = 0x01;
pub const IRQ_MAPPER: u8 = 0x02;

const NMI_VECTOR: u16 = 0xFFFA;
const RESET_VECTOR: u16 = 0xFFFC;
const IRQ_VECTOR: u16 = 0xFFFE;
const INTERRUPT_CYCLES: u32 = 7;

/// a, x, y, p, sp, pc (2), nmi, irq lines, cycle counter (8).
pub const CPU_STATE_LEN: usize = 17;

#[rustfmt::skip]
const BASE_CYCLES: [u8; 256] = [
    7, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 3, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 5, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4,
    2, 6, 2, 6, 4, 4, 4, 4, 2, 5, 2, 5, 5, 5, 5, 5,
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4,
    2, 5, 2, 5, 4, 4, 4, 4, 2, 4, 2, 4, 4, 4, 4, 4,
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Imp,
    Acc,
    Imm,
    Zp,
    ZpX,
    ZpY,
    Abs,
    AbsX,
    AbsY,
    Ind,
    IndX,
    IndY,
    Rel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs, Clc,
    Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny, Jmp,
    Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror, Rti,
    Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs, Tya,
    // unofficial
    Slo, Rla, Sre, Rra, Sax, Lax, Dcp, Isc, Anc, Alr, Arr, Ane, Lxa, Axs,
    Sha, Shx, Shy, Tas, Las, Jam,
}

// Opcode decode follows the aaabbbcc layout. Each group table is indexed
// [bbb][aaa].
use Mode::*;
use Op::*;

#[rustfmt::skip]
const GROUP0: [[(Op, Mode); 8]; 8] = [
    [(Brk, Imp), (Jsr, Abs), (Rti, Imp), (Rts, Imp), (Nop, Imm), (Ldy, Imm), (Cpy, Imm), (Cpx, Imm)],
    [(Nop, Zp), (Bit, Zp), (Nop, Zp), (Nop, Zp), (Sty, Zp), (Ldy, Zp), (Cpy, Zp), (Cpx, Zp)],
    [(Php, Imp), (Plp, Imp), (Pha, Imp), (Pla, Imp), (Dey, Imp), (Tay, Imp), (Iny, Imp), (Inx, Imp)],
    [(Nop, Abs), (Bit, Abs), (Jmp, Abs), (Jmp, Ind), (Sty, Abs), (Ldy, Abs), (Cpy, Abs), (Cpx, Abs)],
    [(Bpl, Rel), (Bmi, Rel), (Bvc, Rel), (Bvs, Rel), (Bcc, Rel), (Bcs, Rel), (Bne, Rel), (Beq, Rel)],
    [(Nop, ZpX), (Nop, ZpX), (Nop, ZpX), (Nop, ZpX), (Sty, ZpX), (Ldy, ZpX), (Nop, ZpX), (Nop, ZpX)],
    [(Clc, Imp), (Sec, Imp), (Cli, Imp), (Sei, Imp), (Tya, Imp), (Clv, Imp), (Cld, Imp), (Sed, Imp)],
    [(Nop, AbsX), (Nop, AbsX), (Nop, AbsX), (Nop, AbsX), (Shy, AbsX), (Ldy, AbsX), (Nop, AbsX), (Nop, AbsX)],
];

const GROUP1_OPS: [Op; 8] = [Ora, And, Eor, Adc, Sta, Lda, Cmp, Sbc];
const GROUP1_MODES: [Mode; 8] = [IndX, Zp, Imm, Abs, IndY, ZpX, AbsY, AbsX];

#[rustfmt::skip]
const GROUP2: [[(Op, Mode); 8]; 8] = [
    [(Jam, Imp), (Jam, Imp), (Jam, Imp), (Jam, Imp), (Nop, Imm), (Ldx, Imm), (Nop, Imm), (Nop, Imm)],
    [(Asl, Zp), (Rol, Zp), (Lsr, Zp), (Ror, Zp), (Stx, Zp), (Ldx, Zp), (Dec, Zp), (Inc, Zp)],
    [(Asl, Acc), (Rol, Acc), (Lsr, Acc), (Ror, Acc), (Txa, Imp), (Tax, Imp), (Dex, Imp), (Nop, Imp)],
    [(Asl, Abs), (Rol, Abs), (Lsr, Abs), (Ror, Abs), (Stx, Abs), (Ldx, Abs), (Dec, Abs), (Inc, Abs)],
    [(Jam, Imp); 8],
    [(Asl, ZpX), (Rol, ZpX), (Lsr, ZpX), (Ror, ZpX), (Stx, ZpY), (Ldx, ZpY), (Dec, ZpX), (Inc, ZpX)],
    [(Nop, Imp), (Nop, Imp), (Nop, Imp), (Nop, Imp), (Txs, Imp), (Tsx, Imp), (Nop, Imp), (Nop, Imp)],
    [(Asl, AbsX), (Rol, AbsX), (Lsr, AbsX), (Ror, AbsX), (Shx, AbsY), (Ldx, AbsY), (Dec, AbsX), (Inc, AbsX)],
];

#[rustfmt::skip]
const GROUP3: [[(Op, Mode); 8]; 8] = [
    [(Slo, IndX), (Rla, IndX), (Sre, IndX), (Rra, IndX), (Sax, IndX), (Lax, IndX), (Dcp, IndX), (Isc, IndX)],
    [(Slo, Zp), (Rla, Zp), (Sre, Zp), (Rra, Zp), (Sax, Zp), (Lax, Zp), (Dcp, Zp), (Isc, Zp)],
    [(Anc, Imm), (Anc, Imm), (Alr, Imm), (Arr, Imm), (Ane, Imm), (Lxa, Imm), (Axs, Imm), (Sbc, Imm)],
    [(Slo, Abs), (Rla, Abs), (Sre, Abs), (Rra, Abs), (Sax, Abs), (Lax, Abs), (Dcp, Abs), (Isc, Abs)],
    [(Slo, IndY), (Rla, IndY), (Sre, IndY), (Rra, IndY), (Sha, IndY), (Lax, IndY), (Dcp, IndY), (Isc, IndY)],
    [(Slo, ZpX), (Rla, ZpX), (Sre, ZpX), (Rra, ZpX), (Sax, ZpY), (Lax, ZpY), (Dcp, ZpX), (Isc, ZpX)],
    [(Slo, AbsY), (Rla, AbsY), (Sre, AbsY), (Rra, AbsY), (Tas, AbsY), (Las, AbsY), (Dcp, AbsY), (Isc, AbsY)],
    [(Slo, AbsX), (Rla, AbsX), (Sre, AbsX), (Rra, AbsX), (Sha, AbsY), (Lax, AbsY), (Dcp, AbsX), (Isc, AbsX)],
];

fn decode(opcode: u8) -> (Op, Mode) {
    let aaa = (opcode >> 5) as usize;
    let bbb = ((opcode >> 2) & 0x07) as usize;
    match opcode & 0x03 {
        0x00 => GROUP0[bbb][aaa],
        // STA #imm does not exist; the slot is a two-byte NOP.
        0x01 if opcode == 0x89 => (Nop, Imm),
        0x01 => (GROUP1_OPS[aaa], GROUP1_MODES[bbb]),
        0x02 => GROUP2[bbb][aaa],
        _ => GROUP3[bbb][aaa],
    }
}

/// Reads that take one extra cycle when the indexed address crosses a page.
fn has_page_penalty(op: Op) -> bool {
    matches!(
        op,
        Adc | And | Cmp | Eor | Lda | Ldx | Ldy | Ora | Sbc | Lax | Las | Nop
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDebugCounters {
    pub instructions: u64,
    pub nmi_serviced: u64,
    pub irq_serviced: u64,
    pub unofficial_executed: u64,
    pub jam_count: u64,
    pub last_jam_pc: u16,
}

pub struct Cpu {
    pub(crate) a: u8,
    pub(crate) x: u8,
    pub(crate) y: u8,
    pub(crate) p: u8,
    pub(crate) sp: u8,
    pub(crate) pc: u16,

    nmi_pending: bool,
    irq_lines: u8,
    cycles: u64,
    stall_cycles: u32,
    paused: bool,
    pub(crate) debug: CpuDebugCounters,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
            sp: 0xFD,
            pc: 0,
            nmi_pending: false,
            irq_lines: 0,
            cycles: 0,
            stall_cycles: 0,
            paused: false,
            debug: CpuDebugCounters::default(),
        }
    }

    /// Loads PC from the reset vector and returns registers to power-up
    /// values. Pending interrupts, stalls and the pause flag are dropped.
    pub fn reset<B: CpuBus>(&mut self, bus: &mut B) {
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.p = FLAG_INTERRUPT | FLAG_UNUSED;
        self.sp = 0xFD;
        self.nmi_pending = false;
        self.irq_lines = 0;
        self.stall_cycles = 0;
        self.paused = false;
        self.pc = read_u16(bus, RESET_VECTOR);
        self.cycles = self.cycles.wrapping_add(INTERRUPT_CYCLES as u64);
    }

    pub fn raise_nmi(&mut self) {
        self.nmi_pending = true;
    }

    pub fn raise_irq(&mut self, line: u8) {
        self.irq_lines |= line;
    }

    pub fn clear_irq(&mut self, line: u8) {
        self.irq_lines &= !line;
    }

    pub fn set_irq(&mut self, line: u8, asserted: bool) {
        if asserted {
            self.raise_irq(line);
        } else {
            self.clear_irq(line);
        }
    }

    /// Suspends execution. Only the caller can clear it with `resume`.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Burns `cycles` before the next instruction. Used for OAM DMA.
    pub fn stall(&mut self, cycles: u32) {
        self.stall_cycles = self.stall_cycles.saturating_add(cycles);
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn registers(&self) -> (u8, u8, u8, u8, u8, u16) {
        (self.a, self.x, self.y, self.p, self.sp, self.pc)
    }

    pub fn debug_counters(&self) -> CpuDebugCounters {
        self.debug
    }

    /// Executes one instruction, or services one pending interrupt, or
    /// drains a pending stall. Returns the CPU cycles consumed.
    pub fn step<B: CpuBus>(&mut self, bus: &mut B) -> u32 {
        if self.stall_cycles > 0 {
            let stalled = self.stall_cycles;
            self.stall_cycles = 0;
            self.cycles = self.cycles.wrapping_add(stalled as u64);
            return stalled;
        }

        if self.nmi_pending {
            self.nmi_pending = false;
            self.interrupt(bus, NMI_VECTOR, false);
            self.debug.nmi_serviced = self.debug.nmi_serviced.wrapping_add(1);
            log::trace!("NMI serviced -> PC=${:04X}", self.pc);
            self.cycles = self.cycles.wrapping_add(INTERRUPT_CYCLES as u64);
            return INTERRUPT_CYCLES;
        }

        if self.irq_lines != 0 && !self.get_flag(FLAG_INTERRUPT) {
            self.interrupt(bus, IRQ_VECTOR, false);
            self.debug.irq_serviced = self.debug.irq_serviced.wrapping_add(1);
            log::trace!("IRQ serviced -> PC=${:04X}", self.pc);
            self.cycles = self.cycles.wrapping_add(INTERRUPT_CYCLES as u64);
            return INTERRUPT_CYCLES;
        }

        let opcode_pc = self.pc;
        let opcode = self.fetch_byte(bus);
        let (op, mode) = decode(opcode);
        let cycles = BASE_CYCLES[opcode as usize] as u32 + self.execute(bus, op, mode, opcode_pc);

        self.debug.instructions = self.debug.instructions.wrapping_add(1);
        self.cycles = self.cycles.wrapping_add(cycles as u64);
        cycles
    }

    pub fn save(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CPU_STATE_LEN);
        out.extend_from_slice(&[self.a, self.x, self.y, self.p, self.sp]);
        out.extend_from_slice(&self.pc.to_le_bytes());
        out.push(self.nmi_pending as u8);
        out.push(self.irq_lines);
        out.extend_from_slice(&self.cycles.to_le_bytes());
        out
    }

    pub fn load(&mut self, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() == CPU_STATE_LEN,
            "CPU state is {} bytes, expected {}",
            data.len(),
            CPU_STATE_LEN
        );
        self.a = data[0];
        self.x = data[1];
        self.y = data[2];
        self.p = data[3] | FLAG_UNUSED;
        self.sp = data[4];
        self.pc = u16::from_le_bytes([data[5], data[6]]);
        self.nmi_pending = data[7] != 0;
        self.irq_lines = data[8];
        let mut cycles = [0u8; 8];
        cycles.copy_from_slice(&data[9..17]);
        self.cycles = u64::from_le_bytes(cycles);
        self.stall_cycles = 0;
        self.paused = false;
        Ok(())
    }

    fn execute<B: CpuBus>(&mut self, bus: &mut B, op: Op, mode: Mode, opcode_pc: u16) -> u32 {
        match op {
            Lda => {
                let (value, extra) = self.read_operand(bus, mode, op);
                self.a = value;
                self.update_zn(value);
                extra
            }
            Ldx => {
                let (value, extra) = self.read_operand(bus, mode, op);
                self.x = value;
                self.update_zn(value);
                extra
            }
            Ldy => {
                let (value, extra) = self.read_operand(bus, mode, op);
                self.y = value;
                self.update_zn(value);
                extra
            }
            Ora | And | Eor | Adc | Sbc | Cmp | Cpx | Cpy | Bit => {
                let (value, extra) = self.read_operand(bus, mode, op);
                match op {
                    Ora => self.ora(value),
                    And => self.and(value),
                    Eor => self.eor(value),
                    Adc => self.adc(value),
                    Sbc => self.sbc(value),
                    Cmp => self.compare(self.a, value),
                    Cpx => self.compare(self.x, value),
                    Cpy => self.compare(self.y, value),
                    _ => self.bit(value),
                }
                extra
            }
            Sta => self.store(bus, mode, self.a),
            Stx => self.store(bus, mode, self.x),
            Sty => self.store(bus, mode, self.y),
            Asl | Lsr | Rol | Ror | Inc | Dec => {
                if mode == Acc {
                    self.a = self.apply_rmw(op, self.a);
                } else {
                    let (addr, _) = self.operand_address(bus, mode);
                    let value = bus.read(addr);
                    let out = self.apply_rmw(op, value);
                    bus.write(addr, out);
                }
                0
            }

            Bpl => self.branch(bus, !self.get_flag(FLAG_NEGATIVE)),
            Bmi => self.branch(bus, self.get_flag(FLAG_NEGATIVE)),
            Bvc => self.branch(bus, !self.get_flag(FLAG_OVERFLOW)),
            Bvs => self.branch(bus, self.get_flag(FLAG_OVERFLOW)),
            Bcc => self.branch(bus, !self.get_flag(FLAG_CARRY)),
            Bcs => self.branch(bus, self.get_flag(FLAG_CARRY)),
            Bne => self.branch(bus, !self.get_flag(FLAG_ZERO)),
            Beq => self.branch(bus, self.get_flag(FLAG_ZERO)),

            Jmp => {
                self.pc = if mode == Ind {
                    let ptr = self.fetch_word(bus);
                    // The high byte never carries out of the pointer's page.
                    let lo = bus.read(ptr) as u16;
                    let hi = bus.read((ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF)) as u16;
                    (hi << 8) | lo
                } else {
                    self.fetch_word(bus)
                };
                0
            }
            Jsr => {
                let target = self.fetch_word(bus);
                self.push_u16(bus, self.pc.wrapping_sub(1));
                self.pc = target;
                0
            }
            Rts => {
                self.pc = self.pop_u16(bus).wrapping_add(1);
                0
            }
            Rti => {
                let p = self.pop(bus);
                self.p = (p & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pop_u16(bus);
                0
            }
            Brk => {
                self.pc = self.pc.wrapping_add(1);
                self.interrupt(bus, IRQ_VECTOR, true);
                0
            }

            Php => {
                self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED);
                0
            }
            Plp => {
                let p = self.pop(bus);
                self.p = (p & !FLAG_BREAK) | FLAG_UNUSED;
                0
            }
            Pha => {
                self.push(bus, self.a);
                0
            }
            Pla => {
                self.a = self.pop(bus);
                self.update_zn(self.a);
                0
            }

            Tax => self.transfer(|cpu| cpu.x = cpu.a, |cpu| cpu.x),
            Tay => self.transfer(|cpu| cpu.y = cpu.a, |cpu| cpu.y),
            Txa => self.transfer(|cpu| cpu.a = cpu.x, |cpu| cpu.a),
            Tya => self.transfer(|cpu| cpu.a = cpu.y, |cpu| cpu.a),
            Tsx => self.transfer(|cpu| cpu.x = cpu.sp, |cpu| cpu.x),
            Txs => {
                self.sp = self.x;
                0
            }
            Inx => self.transfer(|cpu| cpu.x = cpu.x.wrapping_add(1), |cpu| cpu.x),
            Iny => self.transfer(|cpu| cpu.y = cpu.y.wrapping_add(1), |cpu| cpu.y),
            Dex => self.transfer(|cpu| cpu.x = cpu.x.wrapping_sub(1), |cpu| cpu.x),
            Dey => self.transfer(|cpu| cpu.y = cpu.y.wrapping_sub(1), |cpu| cpu.y),

            Clc => self.flag_op(FLAG_CARRY, false),
            Sec => self.flag_op(FLAG_CARRY, true),
            Cli => self.flag_op(FLAG_INTERRUPT, false),
            Sei => self.flag_op(FLAG_INTERRUPT, true),
            Clv => self.flag_op(FLAG_OVERFLOW, false),
            Cld => self.flag_op(FLAG_DECIMAL, false),
            Sed => self.flag_op(FLAG_DECIMAL, true),

            Nop => {
                if mode == Imp {
                    0
                } else {
                    let (_, extra) = self.read_operand(bus, mode, op);
                    extra
                }
            }

            Jam => {
                // The real chip locks up; stay on the opcode so a resume
                // retries it rather than running into garbage.
                self.pc = opcode_pc;
                self.paused = true;
                self.debug.jam_count = self.debug.jam_count.wrapping_add(1);
                self.debug.last_jam_pc = opcode_pc;
                log::warn!("CPU jammed at ${opcode_pc:04X}");
                0
            }

            _ => {
                self.debug.unofficial_executed = self.debug.unofficial_executed.wrapping_add(1);
                self.execute_unofficial(bus, op, mode)
            }
        }
    }

    fn execute_unofficial<B: CpuBus>(&mut self, bus: &mut B, op: Op, mode: Mode) -> u32 {
        match op {
            Slo | Rla | Sre | Rra | Dcp | Isc => {
                let (addr, _) = self.operand_address(bus, mode);
                let value = bus.read(addr);
                let out = match op {
                    Slo => {
                        let shifted = self.asl(value);
                        self.ora(shifted);
                        shifted
                    }
                    Rla => {
                        let shifted = self.rol(value);
                        self.and(shifted);
                        shifted
                    }
                    Sre => {
                        let shifted = self.lsr(value);
                        self.eor(shifted);
                        shifted
                    }
                    Rra => {
                        let shifted = self.ror(value);
                        self.adc(shifted);
                        shifted
                    }
                    Dcp => {
                        let decremented = value.wrapping_sub(1);
                        self.compare(self.a, decremented);
                        decremented
                    }
                    _ => {
                        let incremented = value.wrapping_add(1);
                        self.sbc(incremented);
                        incremented
                    }
                };
                bus.write(addr, out);
                0
            }
            Sax => self.store(bus, mode, self.a & self.x),
            Lax => {
                let (value, extra) = self.read_operand(bus, mode, op);
                self.a = value;
                self.x = value;
                self.update_zn(value);
                extra
            }
            Las => {
                let (value, extra) = self.read_operand(bus, mode, op);
                let value = value & self.sp;
                self.a = value;
                self.x = value;
                self.sp = value;
                self.update_zn(value);
                extra
            }
            Anc => {
                let imm = self.fetch_byte(bus);
                self.and(imm);
                self.set_flag(FLAG_CARRY, (self.a & 0x80) != 0);
                0
            }
            Alr => {
                let imm = self.fetch_byte(bus);
                self.a = self.lsr(self.a & imm);
                0
            }
            Arr => {
                let imm = self.fetch_byte(bus);
                let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
                self.a = ((self.a & imm) >> 1) | carry_in;
                self.update_zn(self.a);
                self.set_flag(FLAG_CARRY, (self.a & 0x40) != 0);
                self.set_flag(
                    FLAG_OVERFLOW,
                    (((self.a >> 6) & 0x01) ^ ((self.a >> 5) & 0x01)) != 0,
                );
                0
            }
            // ANE and LXA are unstable on hardware; the 0xEE magic constant
            // keeps them deterministic.
            Ane => {
                let imm = self.fetch_byte(bus);
                self.a = (self.a | 0xEE) & self.x & imm;
                self.update_zn(self.a);
                0
            }
            Lxa => {
                let imm = self.fetch_byte(bus);
                self.a = (self.a | 0xEE) & imm;
                self.x = self.a;
                self.update_zn(self.a);
                0
            }
            Axs => {
                let imm = self.fetch_byte(bus);
                let in_ax = self.a & self.x;
                self.set_flag(FLAG_CARRY, in_ax >= imm);
                self.x = in_ax.wrapping_sub(imm);
                self.update_zn(self.x);
                0
            }
            Sha | Shx | Shy | Tas => {
                let (addr, base) = self.indexed_with_base(bus, mode);
                let high = ((base >> 8) as u8).wrapping_add(1);
                let value = match op {
                    Sha => self.a & self.x & high,
                    Shx => self.x & high,
                    Shy => self.y & high,
                    _ => {
                        self.sp = self.a & self.x;
                        self.sp & high
                    }
                };
                let crossed = (base & 0xFF00) != (addr & 0xFF00);
                let target = if crossed {
                    ((value as u16) << 8) | (addr & 0x00FF)
                } else {
                    addr
                };
                bus.write(target, value);
                0
            }
            _ => 0,
        }
    }

    /// Resolves the effective address. The flag reports a page crossing
    /// on indexed modes.
    fn operand_address<B: CpuBus>(&mut self, bus: &mut B, mode: Mode) -> (u16, bool) {
        match mode {
            Zp => (self.fetch_byte(bus) as u16, false),
            ZpX => (self.fetch_byte(bus).wrapping_add(self.x) as u16, false),
            ZpY => (self.fetch_byte(bus).wrapping_add(self.y) as u16, false),
            Abs => (self.fetch_word(bus), false),
            AbsX | AbsY | IndY => {
                let (addr, base) = self.indexed_with_base(bus, mode);
                (addr, (base & 0xFF00) != (addr & 0xFF00))
            }
            IndX => {
                let zp = self.fetch_byte(bus).wrapping_add(self.x);
                (read_zp_u16(bus, zp), false)
            }
            Imp | Acc | Imm | Ind | Rel => {
                debug_assert!(false, "mode {mode:?} has no memory operand");
                (self.pc, false)
            }
        }
    }

    fn indexed_with_base<B: CpuBus>(&mut self, bus: &mut B, mode: Mode) -> (u16, u16) {
        match mode {
            AbsX => {
                let base = self.fetch_word(bus);
                (base.wrapping_add(self.x as u16), base)
            }
            IndY => {
                let zp = self.fetch_byte(bus);
                let base = read_zp_u16(bus, zp);
                (base.wrapping_add(self.y as u16), base)
            }
            _ => {
                let base = self.fetch_word(bus);
                (base.wrapping_add(self.y as u16), base)
            }
        }
    }

    fn read_operand<B: CpuBus>(&mut self, bus: &mut B, mode: Mode, op: Op) -> (u8, u32) {
        match mode {
            Imm => (self.fetch_byte(bus), 0),
            Acc => (self.a, 0),
            _ => {
                let (addr, crossed) = self.operand_address(bus, mode);
                let extra = (crossed && has_page_penalty(op)) as u32;
                (bus.read(addr), extra)
            }
        }
    }

    fn store<B: CpuBus>(&mut self, bus: &mut B, mode: Mode, value: u8) -> u32 {
        let (addr, _) = self.operand_address(bus, mode);
        bus.write(addr, value);
        0
    }

    fn transfer(&mut self, apply: impl FnOnce(&mut Self), result: impl FnOnce(&Self) -> u8) -> u32 {
        apply(self);
        let value = result(self);
        self.update_zn(value);
        0
    }

    fn flag_op(&mut self, flag: u8, value: bool) -> u32 {
        self.set_flag(flag, value);
        0
    }

    fn apply_rmw(&mut self, op: Op, value: u8) -> u8 {
        match op {
            Asl => self.asl(value),
            Lsr => self.lsr(value),
            Rol => self.rol(value),
            Ror => self.ror(value),
            Inc => {
                let out = value.wrapping_add(1);
                self.update_zn(out);
                out
            }
            _ => {
                let out = value.wrapping_sub(1);
                self.update_zn(out);
                out
            }
        }
    }

    fn branch<B: CpuBus>(&mut self, bus: &mut B, condition: bool) -> u32 {
        let offset = self.fetch_byte(bus) as i8;
        if !condition {
            return 0;
        }
        let old_pc = self.pc;
        self.pc = old_pc.wrapping_add(offset as i16 as u16);
        if (old_pc & 0xFF00) != (self.pc & 0xFF00) {
            2
        } else {
            1
        }
    }

    fn interrupt<B: CpuBus>(&mut self, bus: &mut B, vector: u16, brk: bool) {
        self.push_u16(bus, self.pc);
        let pushed = if brk {
            self.p | FLAG_BREAK | FLAG_UNUSED
        } else {
            (self.p & !FLAG_BREAK) | FLAG_UNUSED
        };
        self.push(bus, pushed);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = read_u16(bus, vector);
    }

    fn fetch_byte<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        let byte = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }

    fn fetch_word<B: CpuBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.fetch_byte(bus) as u16;
        let hi = self.fetch_byte(bus) as u16;
        (hi << 8) | lo
    }

    fn push<B: CpuBus>(&mut self, bus: &mut B, value: u8) {
        bus.write(0x0100 | self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop<B: CpuBus>(&mut self, bus: &mut B) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x0100 | self.sp as u16)
    }

    fn push_u16<B: CpuBus>(&mut self, bus: &mut B, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pop_u16<B: CpuBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.pop(bus) as u16;
        let hi = self.pop(bus) as u16;
        (hi << 8) | lo
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    pub(crate) fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn ora(&mut self, value: u8) {
        self.a |= value;
        self.update_zn(self.a);
    }

    fn and(&mut self, value: u8) {
        self.a &= value;
        self.update_zn(self.a);
    }

    fn eor(&mut self, value: u8) {
        self.a ^= value;
        self.update_zn(self.a);
    }

    fn bit(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, (self.a & value) == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
        self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
    }

    fn compare(&mut self, register: u8, value: u8) {
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(register.wrapping_sub(value));
    }

    // The 2A03 has no decimal mode; D is stored but ignored.
    fn adc(&mut self, value: u8) {
        let carry_in = self.get_flag(FLAG_CARRY) as u16;
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, ((self.a ^ out) & (value ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(self.a);
    }

    fn sbc(&mut self, value: u8) {
        self.adc(value ^ 0xFF);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = self.get_flag(FLAG_CARRY) as u8;
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }
}

fn read_u16<B: CpuBus>(bus: &mut B, addr: u16) -> u16 {
    let lo = bus.read(addr) as u16;
    let hi = bus.read(addr.wrapping_add(1)) as u16;
    (hi << 8) | lo
}

fn read_zp_u16<B: CpuBus>(bus: &mut B, addr: u8) -> u16 {
    let lo = bus.read(addr as u16) as u16;
    let hi = bus.read(addr.wrapping_add(1) as u16) as u16;
    (hi << 8) | lo
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestBus {
        mem: Vec<u8>,
    }

    impl TestBus {
        fn with_program(origin: u16, program: &[u8]) -> Self {
            let mut mem = vec![0u8; 0x1_0000];
            mem[origin as usize..origin as usize + program.len()].copy_from_slice(program);
            mem[RESET_VECTOR as usize] = origin as u8;
            mem[RESET_VECTOR as usize + 1] = (origin >> 8) as u8;
            Self { mem }
        }

        fn set_vector(&mut self, vector: u16, target: u16) {
            self.mem[vector as usize] = target as u8;
            self.mem[vector as usize + 1] = (target >> 8) as u8;
        }
    }

    impl CpuBus for TestBus {
        fn read(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }

        fn write(&mut self, addr: u16, value: u8) {
            self.mem[addr as usize] = value;
        }
    }

    fn boot(program: &[u8]) -> (Cpu, TestBus) {
        let mut bus = TestBus::with_program(0x8000, program);
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        (cpu, bus)
    }

    #[test]
    fn reset_loads_vector_and_power_up_registers() {
        let (cpu, _) = boot(&[0xEA]);
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.sp, 0xFD);
        assert!(cpu.get_flag(FLAG_INTERRUPT));
        assert!(!cpu.is_paused());
    }

    #[test]
    fn lda_immediate_sets_zero_and_negative() {
        let (mut cpu, mut bus) = boot(&[0xA9, 0x00, 0xA9, 0x80]);
        assert_eq!(cpu.step(&mut bus), 2);
        assert!(cpu.get_flag(FLAG_ZERO));
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.get_flag(FLAG_NEGATIVE));
        assert!(!cpu.get_flag(FLAG_ZERO));
    }

    #[test]
    fn absolute_indexed_read_pays_for_page_cross() {
        // LDX #$01; LDA $80FF,X; LDA $8000,X
        let (mut cpu, mut bus) = boot(&[0xA2, 0x01, 0xBD, 0xFF, 0x80, 0xBD, 0x00, 0x80]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(cpu.step(&mut bus), 4);
    }

    #[test]
    fn store_indexed_has_fixed_cost() {
        // LDX #$01; STA $02FF,X
        let (mut cpu, mut bus) = boot(&[0xA2, 0x01, 0x9D, 0xFF, 0x02]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 5);
    }

    #[test]
    fn branch_costs_depend_on_taken_and_page() {
        // CLC; BCS +2 (not taken); BCC +2 (taken, same page)
        let (mut cpu, mut bus) = boot(&[0x18, 0xB0, 0x02, 0x90, 0x02]);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.step(&mut bus), 3);
        assert_eq!(cpu.pc, 0x8007);

        // Branch from $80FD across into $8100.
        let mut bus = TestBus::with_program(0x80FB, &[0x18, 0x90, 0x04]);
        let mut cpu = Cpu::new();
        cpu.reset(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 4);
        assert_eq!(cpu.pc, 0x8102);
    }

    #[test]
    fn adc_and_sbc_track_carry_and_overflow() {
        // CLC; LDA #$7F; ADC #$01
        let (mut cpu, mut bus) = boot(&[0x18, 0xA9, 0x7F, 0x69, 0x01, 0x38, 0xE9, 0x01]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.get_flag(FLAG_OVERFLOW));
        assert!(!cpu.get_flag(FLAG_CARRY));
        // SEC; SBC #$01
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x7F);
        assert!(cpu.get_flag(FLAG_CARRY));
        assert!(cpu.get_flag(FLAG_OVERFLOW));
    }

    #[test]
    fn jsr_rts_round_trip() {
        // JSR $8005; NOP; NOP; LDA #$42; RTS
        let (mut cpu, mut bus) = boot(&[0x20, 0x05, 0x80, 0xEA, 0xEA, 0xA9, 0x42, 0x60]);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.pc, 0x8005);
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 6);
        assert_eq!(cpu.pc, 0x8003);
        assert_eq!(cpu.sp, 0xFD);
    }

    #[test]
    fn jmp_indirect_wraps_within_page() {
        let (mut cpu, mut bus) = boot(&[0x6C, 0xFF, 0x02]);
        bus.mem[0x02FF] = 0x34;
        bus.mem[0x0200] = 0x12;
        bus.mem[0x0300] = 0x99;
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x1234);
    }

    #[test]
    fn nmi_is_serviced_before_irq() {
        let (mut cpu, mut bus) = boot(&[0x58, 0xEA]);
        bus.set_vector(NMI_VECTOR, 0x9000);
        bus.set_vector(IRQ_VECTOR, 0xA000);
        cpu.step(&mut bus); // CLI

        cpu.raise_irq(IRQ_MAPPER);
        cpu.raise_nmi();
        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.pc, 0x9000);
        assert!(cpu.get_flag(FLAG_INTERRUPT));

        // The IRQ line is still asserted but masked until RTI restores I.
        bus.mem[0x9000] = 0x40;
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.pc, 0xA000);
    }

    #[test]
    fn masked_irq_waits_for_cli() {
        let (mut cpu, mut bus) = boot(&[0xEA, 0x58, 0xEA]);
        bus.set_vector(IRQ_VECTOR, 0xA000);
        cpu.raise_irq(IRQ_APU);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0x8001);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, 0xA000);

        // Pushed status has B clear for hardware interrupts.
        assert_eq!(bus.mem[0x01FB] & FLAG_BREAK, 0);
    }

    #[test]
    fn brk_pushes_break_flag_and_skips_padding() {
        let (mut cpu, mut bus) = boot(&[0x00, 0xFF]);
        bus.set_vector(IRQ_VECTOR, 0xA000);
        assert_eq!(cpu.step(&mut bus), 7);
        assert_eq!(cpu.pc, 0xA000);
        assert_ne!(bus.mem[0x01FB] & FLAG_BREAK, 0);
        assert_eq!(bus.mem[0x01FC], 0x02);
        assert_eq!(bus.mem[0x01FD], 0x80);
    }

    #[test]
    fn unofficial_opcodes_are_deterministic() {
        // LAX $10; DCP $11; SBC #$00 (0xEB alias)
        let program = [0xA7, 0x10, 0xC7, 0x11, 0x38, 0xEB, 0x00];
        let run = || {
            let (mut cpu, mut bus) = boot(&program);
            bus.mem[0x10] = 0x33;
            bus.mem[0x11] = 0x34;
            for _ in 0..4 {
                cpu.step(&mut bus);
            }
            (cpu.registers(), bus.mem[0x11])
        };
        let first = run();
        assert_eq!(first, run());
        let ((a, x, _, p, _, _), m) = first;
        assert_eq!(a, 0x33);
        assert_eq!(x, 0x33);
        assert_eq!(m, 0x33);
        assert_ne!(p & FLAG_CARRY, 0);
    }

    #[test]
    fn jam_pauses_on_the_opcode() {
        let (mut cpu, mut bus) = boot(&[0xEA, 0x02]);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert!(cpu.is_paused());
        assert_eq!(cpu.pc, 0x8001);
        assert_eq!(cpu.debug_counters().jam_count, 1);
    }

    #[test]
    fn stall_is_drained_before_next_instruction() {
        let (mut cpu, mut bus) = boot(&[0xEA]);
        let before = cpu.cycles();
        cpu.stall(513);
        assert_eq!(cpu.step(&mut bus), 513);
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.cycles(), before + 515);
    }

    #[test]
    fn save_and_load_restore_registers() {
        let (mut cpu, mut bus) = boot(&[0xA9, 0x5A, 0xA2, 0x11, 0xA0, 0x22]);
        for _ in 0..3 {
            cpu.step(&mut bus);
        }
        cpu.raise_nmi();
        let saved = cpu.save();
        assert_eq!(saved.len(), CPU_STATE_LEN);

        let mut restored = Cpu::new();
        restored.load(&saved).unwrap();
        assert_eq!(restored.registers(), cpu.registers());
        assert_eq!(restored.cycles(), cpu.cycles());
        assert_eq!(restored.save(), saved);

        assert!(restored.load(&saved[..4]).is_err());
    }
}
