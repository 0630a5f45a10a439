//! Per-scanline record of PPU state changes.
//!
//! The CPU runs ahead of the renderer: register writes are applied to the
//! live state immediately and also logged with the scanline they take
//! effect on. At vblank the log of the finished frame is frozen and the
//! renderer replays it against the state snapshot taken at the previous
//! vblank. Two reusable buffers alternate roles so steady-state frames do
//! not allocate.

/// Minimum capacity of each buffer. Busy raster effects may exceed it;
/// the buffers then grow once and keep the space.
const INITIAL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HEventKind {
    /// Marks a line boundary without changing state.
    Dummy,
    PpuCtrl,
    PpuMask,
    ChrBankOffset(u8),
    MirrorModeBit,
    ScrollCurr,
    ScrollFineX,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HEvent {
    pub line: u16,
    pub kind: HEventKind,
    pub value: u32,
}

/// PPU state that can change mid-frame and that the renderer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HStatus {
    pub ppu_ctrl: u8,
    pub ppu_mask: u8,
    /// Byte offset of each 1KB pattern window into CHR memory.
    pub chr_bank_offset: [u32; 8],
    pub mirror_mode_bit: u8,
    pub scroll_curr: u16,
    pub scroll_fine_x: u8,
}

impl Default for HStatus {
    fn default() -> Self {
        let mut chr_bank_offset = [0u32; 8];
        for (i, offset) in chr_bank_offset.iter_mut().enumerate() {
            *offset = (i as u32) << 10;
        }
        Self {
            ppu_ctrl: 0,
            ppu_mask: 0,
            chr_bank_offset,
            mirror_mode_bit: 0x44,
            scroll_curr: 0,
            scroll_fine_x: 0,
        }
    }
}

impl HStatus {
    /// Resets everything except the mirroring bits, which belong to the
    /// cartridge and survive a console reset.
    pub fn reset(&mut self) {
        let mirror_mode_bit = self.mirror_mode_bit;
        *self = Self {
            mirror_mode_bit,
            ..Self::default()
        };
    }

    /// Applies one change. Returns false when the value was already set,
    /// in which case the caller records nothing.
    pub fn apply(&mut self, kind: HEventKind, value: u32) -> bool {
        macro_rules! update {
            ($field:expr, $new:expr) => {{
                let new = $new;
                if $field == new {
                    return false;
                }
                $field = new;
            }};
        }
        match kind {
            HEventKind::Dummy => return false,
            HEventKind::PpuCtrl => update!(self.ppu_ctrl, value as u8),
            HEventKind::PpuMask => update!(self.ppu_mask, value as u8),
            HEventKind::ChrBankOffset(index) => {
                update!(self.chr_bank_offset[index as usize & 7], value)
            }
            HEventKind::MirrorModeBit => update!(self.mirror_mode_bit, value as u8),
            HEventKind::ScrollCurr => update!(self.scroll_curr, value as u16),
            HEventKind::ScrollFineX => update!(self.scroll_fine_x, value as u8),
        }
        true
    }
}

/// Double-buffered event log. `next` collects the frame being emulated;
/// the other buffer holds the frozen frame the renderer replays.
pub struct HEventQueue {
    buffers: [Vec<HEvent>; 2],
    live: [usize; 2],
    next: usize,
}

impl Default for HEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl HEventQueue {
    pub fn new() -> Self {
        let mut queue = Self {
            buffers: [
                Vec::with_capacity(INITIAL_CAPACITY),
                Vec::with_capacity(INITIAL_CAPACITY),
            ],
            live: [0, 0],
            next: 0,
        };
        queue.clear();
        queue
    }

    /// Empties both buffers. The collecting buffer starts with a line-0
    /// marker so a replay always covers the frame from its first line.
    pub fn clear(&mut self) {
        self.live = [0, 0];
        self.add(0, HEventKind::Dummy, 0);
    }

    /// Appends an event. Lines never decrease within a frame; an event
    /// for an earlier line is pinned to the last recorded one.
    pub fn add(&mut self, line: u16, kind: HEventKind, value: u32) {
        let next = self.next;
        let count = self.live[next];
        let line = match count {
            0 => line,
            _ => line.max(self.buffers[next][count - 1].line),
        };
        let event = HEvent { line, kind, value };
        let buffer = &mut self.buffers[next];
        if count < buffer.len() {
            buffer[count] = event;
        } else {
            buffer.push(event);
        }
        self.live[next] = count + 1;
    }

    /// Closes the collecting buffer with an end-of-frame sentinel at
    /// `height`, freezes it for rendering and starts a new one.
    pub fn swap(&mut self, height: u16) {
        self.add(height, HEventKind::Dummy, 0);
        self.next ^= 1;
        self.live[self.next] = 0;
        self.add(0, HEventKind::Dummy, 0);
    }

    /// The frozen frame, sentinel included.
    pub fn current(&self) -> &[HEvent] {
        let frozen = self.next ^ 1;
        &self.buffers[frozen][..self.live[frozen]]
    }

    /// Events collected so far for the frame in progress.
    pub fn pending(&self) -> &[HEvent] {
        &self.buffers[self.next][..self.live[self.next]]
    }
}
