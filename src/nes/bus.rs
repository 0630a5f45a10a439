//! CPU address space hook table.
//!
//! Every one of the 64K addresses carries one read handler and one write
//! handler. Devices claim ranges at cartridge-load time; a later install
//! replaces whatever an earlier install left on the same addresses. The
//! console board consults the table on every access and dispatches to the
//! owning device, so no handler needs to hold a reference to the hardware.

const ADDRESS_SPACE: usize = 0x1_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadHandler {
    /// Nothing drives the data bus; the last value seen on it is returned.
    OpenBus,
    Ram,
    PpuRegister,
    ApuStatus,
    Controller(u8),
    PrgRam,
    Mapper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHandler {
    Ignore,
    Ram,
    PpuRegister,
    Apu,
    OamDma,
    ControllerStrobe,
    PrgRam,
    Mapper,
}

pub struct Bus {
    readers: Vec<ReadHandler>,
    writers: Vec<WriteHandler>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            readers: vec![ReadHandler::OpenBus; ADDRESS_SPACE],
            writers: vec![WriteHandler::Ignore; ADDRESS_SPACE],
        }
    }

    /// Drops every installed handler.
    pub fn clear(&mut self) {
        self.readers.fill(ReadHandler::OpenBus);
        self.writers.fill(WriteHandler::Ignore);
    }

    pub fn install_read_handler(&mut self, low: u16, high: u16, handler: ReadHandler) {
        debug_assert!(low <= high, "inverted read range ${low:04X}-${high:04X}");
        self.readers[low as usize..=high as usize].fill(handler);
    }

    pub fn install_write_handler(&mut self, low: u16, high: u16, handler: WriteHandler) {
        debug_assert!(low <= high, "inverted write range ${low:04X}-${high:04X}");
        self.writers[low as usize..=high as usize].fill(handler);
    }

    #[inline]
    pub fn read_handler(&self, addr: u16) -> ReadHandler {
        self.readers[addr as usize]
    }

    #[inline]
    pub fn write_handler(&self, addr: u16) -> WriteHandler {
        self.writers[addr as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_is_open_bus() {
        let bus = Bus::new();
        assert_eq!(bus.read_handler(0x0000), ReadHandler::OpenBus);
        assert_eq!(bus.read_handler(0xFFFF), ReadHandler::OpenBus);
        assert_eq!(bus.write_handler(0x8000), WriteHandler::Ignore);
    }

    #[test]
    fn later_install_replaces_overlap_only() {
        let mut bus = Bus::new();
        bus.install_read_handler(0x6000, 0xFFFF, ReadHandler::PrgRam);
        bus.install_read_handler(0x8000, 0xFFFF, ReadHandler::Mapper);

        assert_eq!(bus.read_handler(0x5FFF), ReadHandler::OpenBus);
        assert_eq!(bus.read_handler(0x7FFF), ReadHandler::PrgRam);
        assert_eq!(bus.read_handler(0x8000), ReadHandler::Mapper);
        assert_eq!(bus.read_handler(0xFFFF), ReadHandler::Mapper);
    }

    #[test]
    fn read_and_write_sides_are_independent() {
        let mut bus = Bus::new();
        bus.install_write_handler(0x4014, 0x4014, WriteHandler::OamDma);
        assert_eq!(bus.write_handler(0x4014), WriteHandler::OamDma);
        assert_eq!(bus.read_handler(0x4014), ReadHandler::OpenBus);

        bus.clear();
        assert_eq!(bus.write_handler(0x4014), WriteHandler::Ignore);
    }
}
