//! NES machine: a 6502 core, the CPU bus and a cycle-stepped PPU driven at a
//! configurable clock ratio.

pub mod bus;
pub mod cartridge;
pub mod config;
pub mod ppu;

pub use bus::{Bus, CpuBus};
pub use cartridge::{Cartridge, CartridgeError, Mirroring};
pub use config::{ClockRatio, ConfigError, MachineConfig};
pub use ppu::Ppu;

use nesboy_core::cpu_6502::{Cpu6502, Interrupt, IRQ_VECTOR, NMI_VECTOR};
use nesboy_core::logging::{log, LogCategory, LogLevel, LogSink, Logger, SharedSink};
use nesboy_core::{types::Frame, System};
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use thiserror::Error;

const RESET_VECTOR: u16 = 0xFFFC;

#[derive(Debug, Error)]
pub enum NesError {
    #[error("clock ratio {0:?} never advances the PPU")]
    StalledClock(ClockRatio),
    #[error(transparent)]
    Cartridge(#[from] CartridgeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Header fields kept for the debug dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CartridgeInfo {
    pub mapper: u8,
    pub mirroring: Mirroring,
    pub four_screen: bool,
    pub battery: bool,
    pub prg_size: usize,
    pub chr_size: usize,
}

impl From<&Cartridge> for CartridgeInfo {
    fn from(cart: &Cartridge) -> Self {
        Self {
            mapper: cart.mapper,
            mirroring: cart.mirroring,
            four_screen: cart.four_screen,
            battery: cart.battery,
            prg_size: cart.prg_rom.len(),
            chr_size: cart.chr_rom.len(),
        }
    }
}

pub struct NesSystem {
    cpu: Cpu6502,
    bus: Bus,
    ppu: Ppu,
    config: MachineConfig,
    cartridge: Option<CartridgeInfo>,
    log: RefCell<Box<dyn LogSink>>,
}

impl fmt::Debug for NesSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NesSystem")
            .field("cpu", &self.cpu)
            .field("ppu", &self.ppu)
            .field("config", &self.config)
            .field("cartridge", &self.cartridge)
            .finish_non_exhaustive()
    }
}

impl Default for NesSystem {
    fn default() -> Self {
        Self::new(&[], &[], MachineConfig::default())
    }
}

impl NesSystem {
    /// Machine with `prg` mapped at 0x8000 and `chr` in the pattern tables.
    /// Diagnostics go to the `log` facade filtered by `config.log`.
    pub fn new(prg: &[u8], chr: &[u8], config: MachineConfig) -> Self {
        let sink = Box::new(Logger::new(config.log.clone()));
        Self::with_parts(prg, chr, config, sink)
    }

    fn with_parts(prg: &[u8], chr: &[u8], config: MachineConfig, sink: Box<dyn LogSink>) -> Self {
        Self {
            cpu: Cpu6502::new(),
            bus: Bus::new(prg),
            ppu: Ppu::new(chr),
            config,
            cartridge: None,
            log: RefCell::new(sink),
        }
    }

    pub fn from_cartridge(cart: &Cartridge, config: MachineConfig) -> Self {
        let sink = Box::new(Logger::new(config.log.clone()));
        Self::from_cartridge_with_sink(cart, config, sink)
    }

    /// Build from a parsed image, logging the load through `sink`.
    ///
    /// Every mapper is run with the fixed NROM layout; anything else gets a
    /// warning and will likely misbehave.
    pub fn from_cartridge_with_sink(
        cart: &Cartridge,
        config: MachineConfig,
        mut sink: Box<dyn LogSink>,
    ) -> Self {
        log(sink.as_mut(), LogCategory::Loader, LogLevel::Info, || {
            format!(
                "cartridge: mapper {}, PRG {} KiB, CHR {} KiB, {:?} mirroring",
                cart.mapper,
                cart.prg_rom.len() / 1024,
                cart.chr_rom.len() / 1024,
                cart.mirroring
            )
        });
        if cart.mapper != 0 {
            log(sink.as_mut(), LogCategory::Loader, LogLevel::Warn, || {
                format!(
                    "mapper {} is not supported, running with the fixed NROM layout",
                    cart.mapper
                )
            });
        }
        if cart.trainer.is_some() {
            log(sink.as_mut(), LogCategory::Loader, LogLevel::Debug, || {
                "trainer present, not mapped".to_string()
            });
        }

        let mut system = Self::with_parts(&cart.prg_image(), &cart.chr_rom, config, sink);
        system.cartridge = Some(CartridgeInfo::from(cart));
        system
    }

    pub fn from_file<P: AsRef<Path>>(path: P, config: MachineConfig) -> Result<Self, NesError> {
        let cart = Cartridge::from_file(path)?;
        Ok(Self::from_cartridge(&cart, config))
    }

    /// Replace the diagnostic sink.
    pub fn with_log_sink(mut self, sink: Box<dyn LogSink>) -> Self {
        self.log = RefCell::new(sink);
        self
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Execute one CPU step (an instruction or an interrupt entry) and run
    /// the PPU for the matching number of dots. Returns the CPU cycles used.
    pub fn step(&mut self) -> u32 {
        let cycles = {
            let mut cpu_log = SharedSink::new(&self.log);
            let mut bus_log = SharedSink::new(&self.log);
            let mut view = CpuBus {
                bus: &mut self.bus,
                ppu: &mut self.ppu,
                log: &mut bus_log,
            };
            self.cpu.step(&mut view, &mut cpu_log)
        };

        let sink = self.log.get_mut().as_mut();
        for _ in 0..self.config.clock.ppu_ticks(cycles) {
            self.ppu.step(sink);
        }

        // Latched now, serviced before the next opcode fetch.
        if self.ppu.take_nmi() {
            self.cpu.request_interrupt(Interrupt::Nmi);
        }
        cycles
    }

    /// Step until the PPU reports a finished frame. Returns the CPU cycles
    /// spent. The frame flag is left set for the caller to clear.
    pub fn run_until_frame(&mut self) -> Result<u64, NesError> {
        if self.config.clock.ppu_ticks(2) == 0 {
            return Err(NesError::StalledClock(self.config.clock));
        }
        let start = self.cpu.cycles;
        while !self.ppu.is_frame_complete() {
            self.step();
        }
        Ok(self.cpu.cycles - start)
    }

    pub fn cpu(&self) -> &Cpu6502 {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu6502 {
        &mut self.cpu
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn ppu_mut(&mut self) -> &mut Ppu {
        &mut self.ppu
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// CPU-visible read. PPU register side effects apply.
    pub fn read(&self, addr: u16) -> u8 {
        self.bus.read(&self.ppu, addr)
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        let sink = self.log.get_mut().as_mut();
        self.bus.write(&mut self.ppu, addr, val, sink);
    }
}

impl System for NesSystem {
    type Error = NesError;

    /// Resets the CPU only; RAM, VRAM and PPU timing keep their state.
    fn reset(&mut self) {
        self.cpu.reset();
    }

    fn step_frame(&mut self) -> Result<Frame, Self::Error> {
        self.run_until_frame()?;
        let frame = self.ppu.to_frame();
        self.ppu.reset_frame_complete();
        Ok(frame)
    }

    fn debug_state(&self) -> serde_json::Value {
        let cpu = &self.cpu;
        let ppu = &self.ppu;
        let (scroll_x, scroll_y) = ppu.scroll();
        serde_json::json!({
            "system": "nes",
            "cpu": {
                "a": cpu.a,
                "x": cpu.x,
                "y": cpu.y,
                "sp": cpu.sp,
                "pc": cpu.pc,
                "status": cpu.status,
                "cycles": cpu.cycles,
                "pending_interrupt": format!("{:?}", cpu.pending_interrupt()),
            },
            "ppu": {
                "scanline": ppu.scanline(),
                "cycle": ppu.cycle(),
                "frame_count": ppu.frame_count(),
                "control": ppu.control(),
                "mask": ppu.mask(),
                "status": ppu.status(),
                "oam_addr": ppu.oam_addr(),
                "vram_addr": ppu.vram_addr(),
                "scroll": [scroll_x, scroll_y],
                "sprites_on_line": ppu.sprites().sprites_found(),
            },
            "vectors": {
                "nmi": self.bus.prg_word(NMI_VECTOR),
                "reset": self.bus.prg_word(RESET_VECTOR),
                "irq": self.bus.prg_word(IRQ_VECTOR),
            },
            "clock": self.config.clock,
            "cartridge": self.cartridge,
            "mirroring_applied": false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nesboy_core::logging::{LogEvent, MemorySink, NullSink};
    use std::rc::Rc;

    fn prg_with(program: &[u8]) -> Vec<u8> {
        let mut prg = vec![0xEA; bus::PRG_ROM_SIZE];
        prg[..program.len()].copy_from_slice(program);
        prg
    }

    fn machine(program: &[u8], clock: ClockRatio) -> NesSystem {
        let config = MachineConfig {
            clock,
            ..MachineConfig::default()
        };
        NesSystem::new(&prg_with(program), &[], config).with_log_sink(Box::new(NullSink))
    }

    /// Records into a sink the test can still look at.
    struct Recorder(Rc<RefCell<MemorySink>>);

    impl LogSink for Recorder {
        fn enabled(&self, category: LogCategory, level: LogLevel) -> bool {
            self.0.borrow().enabled(category, level)
        }

        fn record(&mut self, event: LogEvent) {
            self.0.borrow_mut().record(event);
        }
    }

    fn ines(mapper: u8) -> Vec<u8> {
        let mut rom = vec![b'N', b'E', b'S', 0x1A, 1, 1, mapper << 4, 0];
        rom.resize(cartridge::HEADER_SIZE, 0);
        rom.extend(std::iter::repeat(0xEA).take(cartridge::PRG_BANK_SIZE));
        rom.extend(std::iter::repeat(0x00).take(cartridge::CHR_BANK_SIZE));
        rom
    }

    #[test]
    fn clock_ratio_sets_ppu_dots_per_step() {
        // LDA #$01 takes 2 cycles
        let mut nes = machine(&[0xA9, 0x01], ClockRatio::PerCpuCycle(3));
        assert_eq!(nes.step(), 2);
        assert_eq!(nes.ppu().cycle(), 6);

        let mut nes = machine(&[0xA9, 0x01], ClockRatio::PerInstruction(1));
        assert_eq!(nes.step(), 2);
        assert_eq!(nes.ppu().cycle(), 1);
    }

    #[test]
    fn program_writes_ram() {
        // LDA #$42; STA $0300; LDX #$07; STX $0901
        let mut nes = machine(
            &[0xA9, 0x42, 0x8D, 0x00, 0x03, 0xA2, 0x07, 0x8E, 0x01, 0x09],
            ClockRatio::default(),
        );
        for _ in 0..4 {
            nes.step();
        }
        assert_eq!(nes.bus().ram()[0x0300], 0x42);
        assert_eq!(nes.read(0x0101), 0x07);
        assert_eq!(nes.read(0x1901), 0x07);
    }

    #[test]
    fn program_writes_vram_through_ppu_ports() {
        // LDA #$21; STA $2006; LDA #$08; STA $2006; LDA #$5A; STA $2007
        let mut nes = machine(
            &[
                0xA9, 0x21, 0x8D, 0x06, 0x20, 0xA9, 0x08, 0x8D, 0x06, 0x20, 0xA9, 0x5A, 0x8D,
                0x07, 0x20,
            ],
            ClockRatio::default(),
        );
        for _ in 0..6 {
            nes.step();
        }
        assert_eq!(nes.ppu().read_vram(0x2108), 0x5A);
        assert_eq!(nes.ppu().vram_addr(), 0x2109);
    }

    #[test]
    fn vblank_nmi_runs_handler_once_per_frame() {
        // 8000: LDA #$80; STA $2000; JMP $8005
        let mut prg = prg_with(&[0xA9, 0x80, 0x8D, 0x00, 0x20, 0x4C, 0x05, 0x80]);
        // 9000: INC $10; RTI
        prg[0x1000..0x1003].copy_from_slice(&[0xE6, 0x10, 0x40]);
        prg[0x7FFA] = 0x00;
        prg[0x7FFB] = 0x90;
        let mut nes =
            NesSystem::new(&prg, &[], MachineConfig::default()).with_log_sink(Box::new(NullSink));

        nes.step_frame().expect("frame");
        assert_eq!(nes.bus().ram()[0x10], 1);
        nes.step_frame().expect("frame");
        assert_eq!(nes.bus().ram()[0x10], 2);
        assert_eq!(nes.ppu().frame_count(), 2);
    }

    #[test]
    fn step_frame_returns_full_frame_and_clears_flag() {
        let mut nes = machine(&[0x4C, 0x00, 0x80], ClockRatio::default());
        let frame = nes.step_frame().expect("frame");
        assert_eq!(frame.width, ppu::SCREEN_WIDTH as u32);
        assert_eq!(frame.height, ppu::SCREEN_HEIGHT as u32);
        assert_eq!(frame.pixels.len(), ppu::FRAME_SIZE);
        assert!(!nes.ppu().is_frame_complete());
    }

    #[test]
    fn first_frame_takes_expected_cpu_cycles() {
        // JMP $8000 is 3 cycles = 9 dots; 89342 dots need 9927 jumps
        let mut nes = machine(&[0x4C, 0x00, 0x80], ClockRatio::default());
        let spent = nes.run_until_frame().expect("frame");
        assert_eq!(spent, 29781);
        assert_eq!(nes.cpu().cycles, 29781);
        assert!(nes.ppu().is_frame_complete());
    }

    #[test]
    fn zero_ratio_is_rejected() {
        let mut nes = machine(&[], ClockRatio::PerCpuCycle(0));
        assert!(matches!(
            nes.run_until_frame(),
            Err(NesError::StalledClock(ClockRatio::PerCpuCycle(0)))
        ));
        let mut nes = machine(&[], ClockRatio::PerInstruction(0));
        assert!(nes.step_frame().is_err());
    }

    #[test]
    fn unsupported_mapper_warns_and_runs() {
        let cart = Cartridge::from_bytes(&ines(1)).expect("valid image");
        let events = Rc::new(RefCell::new(MemorySink::new(LogLevel::Info)));
        let mut nes = NesSystem::from_cartridge_with_sink(
            &cart,
            MachineConfig::default(),
            Box::new(Recorder(Rc::clone(&events))),
        );
        {
            let events = events.borrow();
            assert!(events.contains("mapper 1 is not supported"));
            assert!(events
                .events()
                .iter()
                .any(|e| e.category == LogCategory::Loader && e.level == LogLevel::Warn));
        }
        nes.step();
        assert_eq!(nes.cpu().pc, 0x8001);
    }

    #[test]
    fn unknown_opcode_reaches_sink() {
        let events = Rc::new(RefCell::new(MemorySink::new(LogLevel::Warn)));
        let mut nes = machine(&[0x02, 0xEA], ClockRatio::default())
            .with_log_sink(Box::new(Recorder(Rc::clone(&events))));
        assert_eq!(nes.step(), 2);
        assert_eq!(nes.cpu().pc, 0x8001);
        assert!(events.borrow().contains("unknown opcode 0x02"));
    }

    #[test]
    fn write_helper_reaches_ppu() {
        let mut nes = machine(&[], ClockRatio::default());
        nes.write(0x2003, 0x20);
        nes.write(0x2004, 0x77);
        assert_eq!(nes.ppu().oam()[0x20], 0x77);
        nes.write(0x8000, 0x00);
        assert_eq!(nes.read(0x8000), 0xEA);
    }

    #[test]
    fn reset_keeps_memory() {
        let mut nes = machine(&[0xA9, 0x42, 0x85, 0x10], ClockRatio::default());
        nes.step();
        nes.step();
        nes.reset();
        assert_eq!(nes.cpu().pc, 0x8000);
        assert_eq!(nes.cpu().a, 0);
        assert_eq!(nes.bus().ram()[0x10], 0x42);
    }

    #[test]
    fn debug_state_reports_machine() {
        let cart = Cartridge::from_bytes(&ines(0)).expect("valid image");
        let mut nes = NesSystem::from_cartridge_with_sink(
            &cart,
            MachineConfig::default(),
            Box::new(NullSink),
        );
        nes.step();
        let state = nes.debug_state();
        assert_eq!(state["system"], "nes");
        assert_eq!(state["cpu"]["pc"], 0x8001);
        assert_eq!(state["cpu"]["cycles"], 2);
        assert_eq!(state["ppu"]["cycle"], 6);
        assert_eq!(state["clock"]["per_cpu_cycle"], 3);
        assert_eq!(state["cartridge"]["mapper"], 0);
        assert_eq!(state["cartridge"]["mirroring"], "horizontal");
        assert_eq!(state["vectors"]["reset"], 0xEAEA);
        assert_eq!(state["mirroring_applied"], false);
    }
}
