//! Audio register file.
//!
//! Waveforms are synthesized by the host. This side tracks what a host
//! needs to drive its oscillators (period, duty, envelope volume, length
//! and linear counters) plus the frame sequencer and its IRQ.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CPU_CLOCK_HZ: f64 = 1_789_772.727_272_727_3;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_RATIO: [f32; 4] = [0.125, 0.25, 0.5, 0.75];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

/// Largest period the sweep unit may produce before it mutes the pulse.
const MAX_PULSE_PERIOD: u16 = 0x07FF;

pub const CHANNEL_COUNT: usize = 4;

// Sequencer actions, combined per step.
const QUARTER: u8 = 1 << 0;
const HALF: u8 = 1 << 1;
const IRQ: u8 = 1 << 2;
const WRAP: u8 = 1 << 3;

/// (cycle, actions) pairs, in CPU cycles since the sequencer last wrapped.
const FOUR_STEP: [(u32, u8); 5] = [
    (7_457, QUARTER),
    (14_913, QUARTER | HALF),
    (22_371, QUARTER),
    (29_829, QUARTER | HALF | IRQ),
    (29_830, IRQ | WRAP),
];

const FIVE_STEP: [(u32, u8); 5] = [
    (7_457, QUARTER),
    (14_913, QUARTER | HALF),
    (22_371, QUARTER),
    (37_281, QUARTER | HALF),
    (37_282, WRAP),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Pulse,
    Triangle,
    Noise,
}

impl ChannelKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pulse => "pulse",
            Self::Triangle => "triangle",
            Self::Noise => "noise",
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Apu {
    pulses: [Pulse; 2],
    triangle: Triangle,
    noise: Noise,
    sequencer: Sequencer,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

impl Apu {
    pub fn new() -> Self {
        Self {
            pulses: [Pulse::new(1), Pulse::new(0)],
            triangle: Triangle::default(),
            noise: Noise::default(),
            sequencer: Sequencer::default(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Register writes in `$4000..=$4017`. DMC registers are accepted and
    /// ignored.
    pub fn write_register(&mut self, addr: u16, value: u8) {
        let reg = (addr & 0x03) as u8;
        match addr {
            0x4000..=0x4007 => self.pulses[usize::from(addr >= 0x4004)].write(reg, value),
            0x4008..=0x400B => self.triangle.write(reg, value),
            0x400C..=0x400F => self.noise.write(reg, value),
            0x4015 => {
                for (bit, length) in self.lengths_mut().into_iter().enumerate() {
                    length.set_enabled(value & (1 << bit) != 0);
                }
            }
            0x4017 => {
                let actions = self.sequencer.set_mode(value);
                self.run_actions(actions);
            }
            _ => {}
        }
    }

    /// `$4015`: one bit per running length counter plus the frame IRQ in
    /// bit 6. Reading acknowledges the IRQ.
    pub fn read_status(&mut self) -> u8 {
        let running = self
            .lengths()
            .iter()
            .enumerate()
            .filter(|(_, length)| length.running())
            .fold(0u8, |bits, (bit, _)| bits | (1 << bit));
        let irq = u8::from(std::mem::take(&mut self.sequencer.irq)) << 6;
        running | irq
    }

    pub fn irq_pending(&self) -> bool {
        self.sequencer.irq
    }

    /// Advances the frame sequencer by `cycles` CPU cycles.
    pub fn run_cycles(&mut self, cycles: u32) {
        for _ in 0..cycles {
            let actions = self.sequencer.tick();
            self.run_actions(actions);
        }
    }

    pub fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }

    pub fn channel_kind(&self, ch: usize) -> Option<ChannelKind> {
        match ch {
            0 | 1 => Some(ChannelKind::Pulse),
            2 => Some(ChannelKind::Triangle),
            3 => Some(ChannelKind::Noise),
            _ => None,
        }
    }

    /// Oscillator frequency in Hz. For noise this is the shift-register
    /// clock rate.
    pub fn frequency(&self, ch: usize) -> f32 {
        let hz = match ch {
            0 | 1 => CPU_CLOCK_HZ / (16.0 * f64::from(self.pulses[ch].period + 1)),
            2 => CPU_CLOCK_HZ / (32.0 * f64::from(self.triangle.period + 1)),
            3 => CPU_CLOCK_HZ / f64::from(NOISE_PERIOD_TABLE[usize::from(self.noise.rate)]),
            _ => 0.0,
        };
        hz as f32
    }

    pub fn duty_ratio(&self, ch: usize) -> f32 {
        match ch {
            0 | 1 => DUTY_RATIO[usize::from(self.pulses[ch].duty)],
            _ => 0.5,
        }
    }

    /// Output level in `0.0..=1.0`; zero whenever the channel is silenced.
    pub fn volume(&self, ch: usize) -> f32 {
        let level = match ch {
            0 | 1 => self.pulses[ch].level(),
            2 => 15 * u8::from(self.triangle.audible()),
            3 => self.noise.level(),
            _ => 0,
        };
        f32::from(level) / 15.0
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to encode APU state")
    }

    pub fn load(&mut self, bytes: &[u8]) -> Result<()> {
        *self = serde_json::from_slice(bytes).context("failed to decode APU state")?;
        Ok(())
    }

    fn run_actions(&mut self, actions: u8) {
        if actions & QUARTER != 0 {
            let [first, second] = &mut self.pulses;
            first.envelope.tick();
            second.envelope.tick();
            self.noise.envelope.tick();
            self.triangle.tick_linear();
        }
        if actions & HALF != 0 {
            for pulse in &mut self.pulses {
                pulse.length.tick();
                pulse.sweep.tick(&mut pulse.period);
            }
            self.triangle.length.tick();
            self.noise.length.tick();
        }
    }

    fn lengths(&self) -> [&LengthCounter; CHANNEL_COUNT] {
        let [first, second] = &self.pulses;
        [
            &first.length,
            &second.length,
            &self.triangle.length,
            &self.noise.length,
        ]
    }

    fn lengths_mut(&mut self) -> [&mut LengthCounter; CHANNEL_COUNT] {
        let [first, second] = &mut self.pulses;
        [
            &mut first.length,
            &mut second.length,
            &mut self.triangle.length,
            &mut self.noise.length,
        ]
    }
}

#[derive(Clone, Copy, Default, Serialize, Deserialize)]
struct Sequencer {
    cycle: u32,
    five_step: bool,
    irq_inhibit: bool,
    irq: bool,
}

impl Sequencer {
    fn steps(&self) -> &'static [(u32, u8)] {
        if self.five_step { &FIVE_STEP } else { &FOUR_STEP }
    }

    /// `$4017`. Restarts the sequence; five-step mode also fires a quarter
    /// and a half frame right away.
    fn set_mode(&mut self, value: u8) -> u8 {
        self.five_step = value & 0x80 != 0;
        self.irq_inhibit = value & 0x40 != 0;
        self.irq &= !self.irq_inhibit;
        self.cycle = 0;
        if self.five_step { QUARTER | HALF } else { 0 }
    }

    fn tick(&mut self) -> u8 {
        self.cycle += 1;
        let Some(&(_, actions)) = self.steps().iter().find(|(at, _)| *at == self.cycle) else {
            return 0;
        };
        if actions & IRQ != 0 && !self.irq_inhibit {
            self.irq = true;
        }
        if actions & WRAP != 0 {
            self.cycle = 0;
        }
        actions
    }
}

#[derive(Clone, Copy, Default, Serialize, Deserialize)]
struct LengthCounter {
    enabled: bool,
    halted: bool,
    count: u8,
}

impl LengthCounter {
    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.count = 0;
        }
    }

    /// Loads from the upper five bits of a channel's last register.
    fn load(&mut self, value: u8) {
        if self.enabled {
            self.count = LENGTH_TABLE[usize::from(value >> 3)];
        }
    }

    fn tick(&mut self) {
        if !self.halted {
            self.count = self.count.saturating_sub(1);
        }
    }

    fn running(&self) -> bool {
        self.count > 0
    }
}

#[derive(Clone, Copy, Default, Serialize, Deserialize)]
struct Envelope {
    looping: bool,
    constant: bool,
    /// Constant volume, or the divider reload when decaying.
    param: u8,
    restart: bool,
    divider: u8,
    decay: u8,
}

impl Envelope {
    fn configure(&mut self, value: u8) {
        self.looping = value & 0x20 != 0;
        self.constant = value & 0x10 != 0;
        self.param = value & 0x0F;
    }

    fn tick(&mut self) {
        if std::mem::take(&mut self.restart) {
            self.decay = 15;
            self.divider = self.param;
            return;
        }
        match self.divider.checked_sub(1) {
            Some(divider) => self.divider = divider,
            None => {
                self.divider = self.param;
                self.decay = match self.decay {
                    0 if self.looping => 15,
                    0 => 0,
                    decay => decay - 1,
                };
            }
        }
    }

    fn level(&self) -> u8 {
        if self.constant { self.param } else { self.decay }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize)]
struct Sweep {
    enabled: bool,
    negate: bool,
    shift: u8,
    reload_period: u8,
    divider: u8,
    reload: bool,
    /// Pulse 1 subtracts one more than pulse 2 when negating.
    negate_bias: u16,
}

impl Sweep {
    fn new(negate_bias: u16) -> Self {
        Self {
            enabled: false,
            negate: false,
            shift: 0,
            reload_period: 1,
            divider: 0,
            reload: false,
            negate_bias,
        }
    }

    fn configure(&mut self, value: u8) {
        self.enabled = value & 0x80 != 0;
        self.reload_period = ((value >> 4) & 0x07) + 1;
        self.negate = value & 0x08 != 0;
        self.shift = value & 0x07;
        self.reload = true;
    }

    fn target(&self, period: u16) -> u16 {
        if self.shift == 0 {
            return period;
        }
        let delta = period >> self.shift;
        if self.negate {
            period.wrapping_sub(delta + self.negate_bias)
        } else {
            period.wrapping_add(delta)
        }
    }

    fn tick(&mut self, period: &mut u16) {
        if self.divider > 0 && !self.reload {
            self.divider -= 1;
            return;
        }
        if self.divider == 0 && self.enabled && self.shift > 0 {
            let target = self.target(*period);
            if target <= MAX_PULSE_PERIOD {
                *period = target;
            }
        }
        self.divider = self.reload_period;
        self.reload = false;
    }
}

fn with_low_byte(period: u16, value: u8) -> u16 {
    (period & 0x0700) | u16::from(value)
}

fn with_high_bits(period: u16, value: u8) -> u16 {
    (period & 0x00FF) | (u16::from(value & 0x07) << 8)
}

#[derive(Clone, Copy, Serialize, Deserialize)]
struct Pulse {
    duty: u8,
    period: u16,
    length: LengthCounter,
    envelope: Envelope,
    sweep: Sweep,
}

impl Pulse {
    fn new(negate_bias: u16) -> Self {
        Self {
            duty: 0,
            period: 0,
            length: LengthCounter::default(),
            envelope: Envelope::default(),
            sweep: Sweep::new(negate_bias),
        }
    }

    fn write(&mut self, reg: u8, value: u8) {
        match reg {
            0 => {
                self.duty = value >> 6;
                self.envelope.configure(value);
                self.length.halted = self.envelope.looping;
            }
            1 => self.sweep.configure(value),
            2 => self.period = with_low_byte(self.period, value),
            _ => {
                self.period = with_high_bits(self.period, value);
                self.length.load(value);
                self.envelope.restart = true;
            }
        }
    }

    fn level(&self) -> u8 {
        let muted = !self.length.running()
            || self.period < 8
            || self.sweep.target(self.period) > MAX_PULSE_PERIOD;
        if muted { 0 } else { self.envelope.level() }
    }
}

#[derive(Clone, Copy, Default, Serialize, Deserialize)]
struct Triangle {
    period: u16,
    length: LengthCounter,
    /// Length halt and linear reload hold share this bit.
    control: bool,
    linear_reload: u8,
    linear: u8,
    reload_linear: bool,
}

impl Triangle {
    fn write(&mut self, reg: u8, value: u8) {
        match reg {
            0 => {
                self.control = value & 0x80 != 0;
                self.length.halted = self.control;
                self.linear_reload = value & 0x7F;
            }
            2 => self.period = with_low_byte(self.period, value),
            3 => {
                self.period = with_high_bits(self.period, value);
                self.length.load(value);
                self.reload_linear = true;
            }
            _ => {}
        }
    }

    fn tick_linear(&mut self) {
        self.linear = if self.reload_linear {
            self.linear_reload
        } else {
            self.linear.saturating_sub(1)
        };
        self.reload_linear &= self.control;
    }

    fn audible(&self) -> bool {
        self.length.running() && self.linear > 0 && self.period >= 2
    }
}

#[derive(Clone, Copy, Default, Serialize, Deserialize)]
struct Noise {
    length: LengthCounter,
    envelope: Envelope,
    short_mode: bool,
    rate: u8,
}

impl Noise {
    fn write(&mut self, reg: u8, value: u8) {
        match reg {
            0 => {
                self.envelope.configure(value);
                self.length.halted = self.envelope.looping;
            }
            2 => {
                self.short_mode = value & 0x80 != 0;
                self.rate = value & 0x0F;
            }
            3 => {
                self.length.load(value);
                self.envelope.restart = true;
            }
            _ => {}
        }
    }

    fn level(&self) -> u8 {
        if self.length.running() { self.envelope.level() } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIRST_QUARTER: u32 = FOUR_STEP[0].0;
    const FIRST_HALF: u32 = FOUR_STEP[1].0;
    const LAST_HALF: u32 = FOUR_STEP[3].0;

    #[test]
    fn length_counter_loads_only_when_enabled() {
        let mut apu = Apu::new();
        apu.write_register(0x4003, 0x08);
        assert_eq!(apu.read_status() & 0x01, 0);

        apu.write_register(0x4015, 0x0F);
        apu.write_register(0x4003, 0x08);
        apu.write_register(0x400F, 0x08);
        assert_eq!(apu.read_status() & 0x0F, 0x09);

        apu.write_register(0x4015, 0x00);
        assert_eq!(apu.read_status() & 0x0F, 0);
    }

    #[test]
    fn four_step_sequence_raises_frame_irq() {
        let mut apu = Apu::new();
        apu.run_cycles(LAST_HALF - 1);
        assert!(!apu.irq_pending());
        apu.run_cycles(1);
        assert!(apu.irq_pending());

        assert_eq!(apu.read_status() & 0x40, 0x40);
        assert!(!apu.irq_pending());

        // The wrap cycle raises it a second time.
        apu.run_cycles(1);
        assert!(apu.irq_pending());
    }

    #[test]
    fn irq_inhibit_and_five_step_mode_stay_quiet() {
        let mut apu = Apu::new();
        apu.write_register(0x4017, 0x40);
        apu.run_cycles(2 * FOUR_STEP[4].0);
        assert!(!apu.irq_pending());

        apu.write_register(0x4017, 0x80);
        apu.run_cycles(2 * FIVE_STEP[4].0);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn setting_inhibit_acknowledges_pending_irq() {
        let mut apu = Apu::new();
        apu.run_cycles(LAST_HALF);
        assert!(apu.irq_pending());
        apu.write_register(0x4017, 0x40);
        assert!(!apu.irq_pending());
    }

    #[test]
    fn half_frame_clocks_shorten_length() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0x10);
        apu.write_register(0x4003, 0x18); // length index 3 -> 2
        apu.run_cycles(FIRST_HALF);
        assert_eq!(apu.read_status() & 0x01, 0x01);
        apu.run_cycles(LAST_HALF - FIRST_HALF);
        assert_eq!(apu.read_status() & 0x01, 0);
    }

    #[test]
    fn halted_length_survives_half_frames() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x04);
        apu.write_register(0x4008, 0xFF); // control set
        apu.write_register(0x400B, 0x18);
        apu.run_cycles(2 * FOUR_STEP[4].0);
        assert_eq!(apu.read_status() & 0x04, 0x04);
    }

    #[test]
    fn channel_parameters_for_host_synthesis() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x0F);
        apu.write_register(0x4000, 0xBF); // duty 2, halt, constant volume 15
        apu.write_register(0x4002, 0xFD);
        apu.write_register(0x4003, 0x00); // period 253

        assert_eq!(apu.channel_count(), 4);
        assert_eq!(apu.channel_kind(0), Some(ChannelKind::Pulse));
        assert_eq!(apu.channel_kind(3).map(ChannelKind::name), Some("noise"));
        assert!((apu.frequency(0) - 440.4).abs() < 0.5);
        assert_eq!(apu.duty_ratio(0), 0.5);
        assert_eq!(apu.volume(0), 1.0);
        assert_eq!(apu.volume(1), 0.0);
        assert_eq!(apu.volume(2), 0.0);
    }

    #[test]
    fn envelope_decays_without_constant_volume() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x08);
        apu.write_register(0x400C, 0x20); // loop, envelope period 0
        apu.write_register(0x400F, 0x00);
        apu.run_cycles(FIRST_QUARTER);
        assert_eq!(apu.volume(3), 1.0);
        apu.run_cycles(FIRST_HALF - FIRST_QUARTER);
        assert_eq!(apu.volume(3), 14.0 / 15.0);
    }

    #[test]
    fn negated_sweep_subtracts_one_more_on_pulse_one() {
        let mut first = Sweep::new(1);
        let mut second = Sweep::new(0);
        first.configure(0x89); // enabled, period 1, negate, shift 1
        second.configure(0x89);
        assert_eq!(first.target(0x100), 0x7F);
        assert_eq!(second.target(0x100), 0x80);

        let mut period = 0x100;
        first.tick(&mut period);
        assert_eq!(period, 0x7F);
    }

    #[test]
    fn sweep_past_max_period_mutes_without_retuning() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x01);
        apu.write_register(0x4000, 0x3F);
        apu.write_register(0x4001, 0x81); // enabled, add, shift 1
        apu.write_register(0x4002, 0x00);
        apu.write_register(0x4003, 0x06); // period 0x600
        assert_eq!(apu.volume(0), 0.0);
        let hz = apu.frequency(0);
        apu.run_cycles(FIRST_HALF);
        assert_eq!(apu.frequency(0), hz);
    }

    #[test]
    fn save_and_load_round_trip() {
        let mut apu = Apu::new();
        apu.write_register(0x4015, 0x03);
        apu.write_register(0x4004, 0x7A);
        apu.write_register(0x4006, 0x40);
        apu.write_register(0x4007, 0x21);
        apu.run_cycles(1000);

        let saved = apu.save().unwrap();
        let mut restored = Apu::new();
        restored.load(&saved).unwrap();
        assert_eq!(restored.save().unwrap(), saved);
        assert_eq!(restored.frequency(1), apu.frequency(1));

        assert!(restored.load(b"not json").is_err());
    }
}
