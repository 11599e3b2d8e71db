//! CPU address bus: 2 KiB RAM, the PPU register window and 32 KiB of PRG ROM.

use crate::ppu::Ppu;
use nesboy_core::cpu_6502::Memory6502;
use nesboy_core::logging::{log, LogCategory, LogLevel, LogSink};

pub const RAM_SIZE: usize = 0x0800;
pub const PRG_ROM_SIZE: usize = 0x8000;
const PPU_REGISTER_BASE: u16 = 0x2000;

#[derive(Debug)]
pub struct Bus {
    ram: [u8; RAM_SIZE],
    prg_rom: Box<[u8; PRG_ROM_SIZE]>,
}

impl Bus {
    /// Map `prg` at 0x8000. At most 32 KiB is used; shorter images are
    /// zero-filled.
    pub fn new(prg: &[u8]) -> Self {
        let mut prg_rom = Box::new([0u8; PRG_ROM_SIZE]);
        let len = prg.len().min(PRG_ROM_SIZE);
        prg_rom[..len].copy_from_slice(&prg[..len]);
        Self {
            ram: [0; RAM_SIZE],
            prg_rom,
        }
    }

    pub fn read(&self, ppu: &Ppu, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[addr as usize % RAM_SIZE],
            0x2000..=0x3FFF => ppu.read_register(PPU_REGISTER_BASE + addr % 8),
            0x8000..=0xFFFF => self.prg_rom[(addr - 0x8000) as usize],
            _ => 0,
        }
    }

    pub fn write(&mut self, ppu: &mut Ppu, addr: u16, data: u8, sink: &mut dyn LogSink) {
        match addr {
            0x0000..=0x1FFF => self.ram[addr as usize % RAM_SIZE] = data,
            0x2000..=0x3FFF => ppu.write_register(PPU_REGISTER_BASE + addr % 8, data, sink),
            0x8000..=0xFFFF => log(sink, LogCategory::Bus, LogLevel::Trace, || {
                format!("ignored write 0x{:02X} to PRG ROM at 0x{:04X}", data, addr)
            }),
            _ => log(sink, LogCategory::Bus, LogLevel::Trace, || {
                format!("open bus write 0x{:02X} at 0x{:04X}", data, addr)
            }),
        }
    }

    pub fn ram(&self) -> &[u8; RAM_SIZE] {
        &self.ram
    }

    pub fn prg_rom(&self) -> &[u8; PRG_ROM_SIZE] {
        &self.prg_rom
    }

    /// Little-endian word straight from PRG ROM (interrupt vectors).
    pub fn prg_word(&self, addr: u16) -> u16 {
        let idx = (addr.max(0x8000) - 0x8000) as usize;
        let lo = self.prg_rom[idx] as u16;
        let hi = self.prg_rom[(idx + 1) % PRG_ROM_SIZE] as u16;
        (hi << 8) | lo
    }
}

/// Borrowed view of the bus and PPU for the duration of one CPU step.
pub struct CpuBus<'a> {
    pub bus: &'a mut Bus,
    pub ppu: &'a mut Ppu,
    pub log: &'a mut dyn LogSink,
}

impl Memory6502 for CpuBus<'_> {
    fn read(&self, addr: u16) -> u8 {
        self.bus.read(&*self.ppu, addr)
    }

    fn write(&mut self, addr: u16, val: u8) {
        self.bus.write(self.ppu, addr, val, self.log);
    }
}
