//! MOS 6502 CPU core implementation
//!
//! The CPU holds only its architectural registers and a pending-interrupt
//! latch. Memory is borrowed for the duration of each `step` through the
//! `Memory6502` trait, so the machine that composes CPU, bus and PPU owns
//! all of them side by side.
//!
//! Instructions are decoded through a 256-entry table (see `opcodes`), the
//! operand is resolved from the addressing mode, then the operation is
//! applied. Decimal mode is not implemented (the NES 2A03 lacks it).

mod opcodes;

pub use opcodes::{decode, AddrMode, Opcode, Operation, OPCODES};

use crate::logging::{log, LogCategory, LogLevel, LogSink};

/// Memory interface trait for the 6502 CPU
///
/// Systems using the 6502 must implement this trait to provide memory access.
pub trait Memory6502 {
    /// Read a byte from memory at the given address
    fn read(&self, addr: u16) -> u8;

    /// Write a byte to memory at the given address
    fn write(&mut self, addr: u16, val: u8);
}

/// Status register bits (NV-BDIZC)
pub mod flags {
    pub const CARRY: u8 = 0x01;
    pub const ZERO: u8 = 0x02;
    pub const INTERRUPT_DISABLE: u8 = 0x04;
    pub const DECIMAL: u8 = 0x08;
    pub const BREAK: u8 = 0x10;
    /// Always reads back as 1
    pub const UNUSED: u8 = 0x20;
    pub const OVERFLOW: u8 = 0x40;
    pub const NEGATIVE: u8 = 0x80;
}

use flags::*;

pub const STACK_BASE: u16 = 0x0100;
pub const NMI_VECTOR: u16 = 0xFFFA;
pub const IRQ_VECTOR: u16 = 0xFFFE;
/// Execution starts here after reset; the reset vector is not consulted.
pub const RESET_PC: u16 = 0x8000;

const RESET_SP: u8 = 0xFD;
const RESET_STATUS: u8 = INTERRUPT_DISABLE | UNUSED;
const INTERRUPT_CYCLES: u32 = 7;
/// Cost charged for an undocumented opcode (treated as a NOP)
const UNKNOWN_OPCODE_CYCLES: u32 = 2;

/// Interrupt waiting to be serviced at the next instruction boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interrupt {
    #[default]
    None,
    Nmi,
    Irq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Implied,
    Accumulator,
    Immediate(u8),
    Address(u16),
}

/// MOS 6502 CPU state and execution engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu6502 {
    /// Accumulator register
    pub a: u8,
    /// X index register
    pub x: u8,
    /// Y index register
    pub y: u8,
    /// Stack pointer (points to 0x0100 + sp)
    pub sp: u8,
    /// Status register (NV-BDIZC)
    pub status: u8,
    /// Program counter
    pub pc: u16,
    /// Total cycles executed
    pub cycles: u64,
    pending: Interrupt,
}

impl Default for Cpu6502 {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu6502 {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: RESET_SP,
            status: RESET_STATUS,
            pc: RESET_PC,
            cycles: 0,
            pending: Interrupt::None,
        }
    }

    /// Reset to power-on register values and drop any pending interrupt.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[inline]
    pub fn flag(&self, mask: u8) -> bool {
        self.status & mask != 0
    }

    #[inline]
    pub fn set_flag(&mut self, mask: u8, on: bool) {
        if on {
            self.status |= mask;
        } else {
            self.status &= !mask;
        }
    }

    pub fn pending_interrupt(&self) -> Interrupt {
        self.pending
    }

    /// Latch an interrupt request. A pending NMI is never replaced by an IRQ.
    pub fn request_interrupt(&mut self, interrupt: Interrupt) {
        match (self.pending, interrupt) {
            (_, Interrupt::None) => {}
            (Interrupt::Nmi, Interrupt::Irq) => {}
            _ => self.pending = interrupt,
        }
    }

    /// Execute one instruction (or service one pending interrupt) and return
    /// the cycles consumed.
    pub fn step<M: Memory6502 + ?Sized>(&mut self, mem: &mut M, sink: &mut dyn LogSink) -> u32 {
        if let Some(cycles) = self.poll_interrupt(mem, sink) {
            return cycles;
        }

        log(sink, LogCategory::Cpu, LogLevel::Trace, || self.trace(mem));

        let pc = self.pc;
        let byte = self.fetch_u8(mem);
        let opcode = match decode(byte) {
            Some(opcode) => opcode,
            None => {
                log(sink, LogCategory::Cpu, LogLevel::Warn, || {
                    format!(
                        "unknown opcode 0x{:02X} at 0x{:04X} (A:{:02X} X:{:02X} Y:{:02X} P:{:02X} SP:{:02X})",
                        byte, pc, self.a, self.x, self.y, self.status, self.sp
                    )
                });
                self.cycles += UNKNOWN_OPCODE_CYCLES as u64;
                return UNKNOWN_OPCODE_CYCLES;
            }
        };

        let operand = self.resolve(mem, opcode.mode);
        let extra = self.execute(mem, sink, opcode.operation, operand);
        let cycles = opcode.cycles as u32 + extra;
        self.cycles += cycles as u64;
        cycles
    }

    /// One-line register dump of the instruction at PC.
    pub fn trace<M: Memory6502 + ?Sized>(&self, mem: &M) -> String {
        let byte = mem.read(self.pc);
        let (len, mnemonic) = match decode(byte) {
            Some(opcode) => (opcode.mode.operand_len(), opcode.operation.mnemonic()),
            None => (0, "???".to_string()),
        };
        let bytes = (0..=len)
            .map(|i| format!("{:02X}", mem.read(self.pc.wrapping_add(i))))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{:04X}  {:<8}  {:<3}  A:{:02X} X:{:02X} Y:{:02X} P:{:02X} SP:{:02X}",
            self.pc, bytes, mnemonic, self.a, self.x, self.y, self.status, self.sp
        )
    }

    fn poll_interrupt<M: Memory6502 + ?Sized>(
        &mut self,
        mem: &mut M,
        sink: &mut dyn LogSink,
    ) -> Option<u32> {
        let (vector, name) = match self.pending {
            Interrupt::None => return None,
            Interrupt::Irq if self.flag(INTERRUPT_DISABLE) => return None,
            Interrupt::Irq => (IRQ_VECTOR, "IRQ"),
            Interrupt::Nmi => (NMI_VECTOR, "NMI"),
        };
        self.pending = Interrupt::None;

        let return_pc = self.pc;
        self.push_u16(mem, return_pc);
        let pushed = (self.status & !BREAK) | UNUSED;
        self.push_u8(mem, pushed);
        self.status |= INTERRUPT_DISABLE;
        self.pc = read_u16(mem, vector);
        self.cycles += INTERRUPT_CYCLES as u64;

        log(sink, LogCategory::Interrupts, LogLevel::Debug, || {
            format!("{} serviced: 0x{:04X} -> 0x{:04X}", name, return_pc, self.pc)
        });
        Some(INTERRUPT_CYCLES)
    }

    #[inline]
    fn fetch_u8<M: Memory6502 + ?Sized>(&mut self, mem: &M) -> u8 {
        let v = mem.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        v
    }

    #[inline]
    fn fetch_u16<M: Memory6502 + ?Sized>(&mut self, mem: &M) -> u16 {
        let lo = self.fetch_u8(mem) as u16;
        let hi = self.fetch_u8(mem) as u16;
        (hi << 8) | lo
    }

    #[inline]
    fn push_u8<M: Memory6502 + ?Sized>(&mut self, mem: &mut M, v: u8) {
        mem.write(STACK_BASE | self.sp as u16, v);
        self.sp = self.sp.wrapping_sub(1);
    }

    #[inline]
    fn pop_u8<M: Memory6502 + ?Sized>(&mut self, mem: &M) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        mem.read(STACK_BASE | self.sp as u16)
    }

    fn push_u16<M: Memory6502 + ?Sized>(&mut self, mem: &mut M, v: u16) {
        self.push_u8(mem, (v >> 8) as u8);
        self.push_u8(mem, v as u8);
    }

    fn pop_u16<M: Memory6502 + ?Sized>(&mut self, mem: &M) -> u16 {
        let lo = self.pop_u8(mem) as u16;
        let hi = self.pop_u8(mem) as u16;
        (hi << 8) | lo
    }

    fn resolve<M: Memory6502 + ?Sized>(&mut self, mem: &M, mode: AddrMode) -> Operand {
        match mode {
            AddrMode::Implied => Operand::Implied,
            AddrMode::Accumulator => Operand::Accumulator,
            AddrMode::Immediate => Operand::Immediate(self.fetch_u8(mem)),
            AddrMode::ZeroPage => Operand::Address(self.fetch_u8(mem) as u16),
            AddrMode::ZeroPageX => Operand::Address(self.fetch_u8(mem).wrapping_add(self.x) as u16),
            AddrMode::ZeroPageY => Operand::Address(self.fetch_u8(mem).wrapping_add(self.y) as u16),
            AddrMode::Absolute => Operand::Address(self.fetch_u16(mem)),
            AddrMode::AbsoluteX => {
                Operand::Address(self.fetch_u16(mem).wrapping_add(self.x as u16))
            }
            AddrMode::AbsoluteY => {
                Operand::Address(self.fetch_u16(mem).wrapping_add(self.y as u16))
            }
            AddrMode::Indirect => {
                let ptr = self.fetch_u16(mem);
                Operand::Address(read_indirect_u16_bug(mem, ptr))
            }
            AddrMode::IndirectX => {
                let zp = self.fetch_u8(mem).wrapping_add(self.x);
                Operand::Address(read_zero_page_u16(mem, zp))
            }
            AddrMode::IndirectY => {
                let zp = self.fetch_u8(mem);
                Operand::Address(read_zero_page_u16(mem, zp).wrapping_add(self.y as u16))
            }
            AddrMode::Relative => {
                let offset = self.fetch_u8(mem) as i8;
                Operand::Address(self.pc.wrapping_add(offset as u16))
            }
        }
    }

    fn load<M: Memory6502 + ?Sized>(&self, mem: &M, operand: Operand) -> u8 {
        match operand {
            Operand::Immediate(v) => v,
            Operand::Address(addr) => mem.read(addr),
            Operand::Accumulator => self.a,
            Operand::Implied => 0,
        }
    }

    fn store<M: Memory6502 + ?Sized>(&mut self, mem: &mut M, operand: Operand, v: u8) {
        match operand {
            Operand::Address(addr) => mem.write(addr, v),
            Operand::Accumulator => self.a = v,
            Operand::Immediate(_) | Operand::Implied => {}
        }
    }

    fn target(operand: Operand) -> u16 {
        match operand {
            Operand::Address(addr) => addr,
            _ => 0,
        }
    }

    /// Apply `operation`; returns cycles beyond the table's base count.
    fn execute<M: Memory6502 + ?Sized>(
        &mut self,
        mem: &mut M,
        sink: &mut dyn LogSink,
        operation: Operation,
        operand: Operand,
    ) -> u32 {
        use Operation::*;

        match operation {
            Lda => {
                self.a = self.load(mem, operand);
                self.set_zero_and_negative(self.a);
            }
            Ldx => {
                self.x = self.load(mem, operand);
                self.set_zero_and_negative(self.x);
            }
            Ldy => {
                self.y = self.load(mem, operand);
                self.set_zero_and_negative(self.y);
            }
            Sta => self.store(mem, operand, self.a),
            Stx => self.store(mem, operand, self.x),
            Sty => self.store(mem, operand, self.y),

            Tax => {
                self.x = self.a;
                self.set_zero_and_negative(self.x);
            }
            Tay => {
                self.y = self.a;
                self.set_zero_and_negative(self.y);
            }
            Txa => {
                self.a = self.x;
                self.set_zero_and_negative(self.a);
            }
            Tya => {
                self.a = self.y;
                self.set_zero_and_negative(self.a);
            }
            Tsx => {
                self.x = self.sp;
                self.set_zero_and_negative(self.x);
            }
            Txs => self.sp = self.x,

            Adc => {
                let m = self.load(mem, operand);
                self.add_with_carry(m);
            }
            Sbc => {
                let m = self.load(mem, operand);
                self.add_with_carry(!m);
            }
            And => {
                self.a &= self.load(mem, operand);
                self.set_zero_and_negative(self.a);
            }
            Ora => {
                self.a |= self.load(mem, operand);
                self.set_zero_and_negative(self.a);
            }
            Eor => {
                self.a ^= self.load(mem, operand);
                self.set_zero_and_negative(self.a);
            }
            Cmp => {
                let m = self.load(mem, operand);
                self.compare(self.a, m);
            }
            Cpx => {
                let m = self.load(mem, operand);
                self.compare(self.x, m);
            }
            Cpy => {
                let m = self.load(mem, operand);
                self.compare(self.y, m);
            }
            Bit => {
                let m = self.load(mem, operand);
                self.set_flag(ZERO, self.a & m == 0);
                self.set_flag(OVERFLOW, m & 0x40 != 0);
                self.set_flag(NEGATIVE, m & 0x80 != 0);
            }

            Asl => {
                let v = self.load(mem, operand);
                self.set_flag(CARRY, v & 0x80 != 0);
                let r = v << 1;
                self.store(mem, operand, r);
                self.set_zero_and_negative(r);
            }
            Lsr => {
                let v = self.load(mem, operand);
                self.set_flag(CARRY, v & 0x01 != 0);
                let r = v >> 1;
                self.store(mem, operand, r);
                self.set_zero_and_negative(r);
            }
            Rol => {
                let v = self.load(mem, operand);
                let carry_in = self.status & CARRY;
                self.set_flag(CARRY, v & 0x80 != 0);
                let r = (v << 1) | carry_in;
                self.store(mem, operand, r);
                self.set_zero_and_negative(r);
            }
            Ror => {
                let v = self.load(mem, operand);
                let carry_in = (self.status & CARRY) << 7;
                self.set_flag(CARRY, v & 0x01 != 0);
                let r = (v >> 1) | carry_in;
                self.store(mem, operand, r);
                self.set_zero_and_negative(r);
            }

            Inc => {
                let r = self.load(mem, operand).wrapping_add(1);
                self.store(mem, operand, r);
                self.set_zero_and_negative(r);
            }
            Dec => {
                let r = self.load(mem, operand).wrapping_sub(1);
                self.store(mem, operand, r);
                self.set_zero_and_negative(r);
            }
            Inx => {
                self.x = self.x.wrapping_add(1);
                self.set_zero_and_negative(self.x);
            }
            Iny => {
                self.y = self.y.wrapping_add(1);
                self.set_zero_and_negative(self.y);
            }
            Dex => {
                self.x = self.x.wrapping_sub(1);
                self.set_zero_and_negative(self.x);
            }
            Dey => {
                self.y = self.y.wrapping_sub(1);
                self.set_zero_and_negative(self.y);
            }

            Bpl => return self.branch(!self.flag(NEGATIVE), operand),
            Bmi => return self.branch(self.flag(NEGATIVE), operand),
            Bvc => return self.branch(!self.flag(OVERFLOW), operand),
            Bvs => return self.branch(self.flag(OVERFLOW), operand),
            Bcc => return self.branch(!self.flag(CARRY), operand),
            Bcs => return self.branch(self.flag(CARRY), operand),
            Bne => return self.branch(!self.flag(ZERO), operand),
            Beq => return self.branch(self.flag(ZERO), operand),

            Jmp => self.pc = Self::target(operand),
            Jsr => {
                let return_addr = self.pc.wrapping_sub(1);
                self.push_u16(mem, return_addr);
                self.pc = Self::target(operand);
            }
            Rts => self.pc = self.pop_u16(mem).wrapping_add(1),
            Rti => {
                self.status = (self.pop_u8(mem) & !BREAK) | UNUSED;
                self.pc = self.pop_u16(mem);
            }
            Brk => {
                // Skips the padding byte after the opcode.
                let return_pc = self.pc.wrapping_add(1);
                self.push_u16(mem, return_pc);
                let pushed = self.status | BREAK | UNUSED;
                self.push_u8(mem, pushed);
                self.status |= INTERRUPT_DISABLE;
                self.pc = read_u16(mem, IRQ_VECTOR);
                log(sink, LogCategory::Interrupts, LogLevel::Debug, || {
                    format!("BRK at 0x{:04X} -> 0x{:04X}", return_pc.wrapping_sub(2), self.pc)
                });
            }

            Pha => self.push_u8(mem, self.a),
            Php => {
                let pushed = self.status | BREAK | UNUSED;
                self.push_u8(mem, pushed);
            }
            Pla => {
                self.a = self.pop_u8(mem);
                self.set_zero_and_negative(self.a);
            }
            Plp => self.status = (self.pop_u8(mem) & !BREAK) | UNUSED,

            Clc => self.set_flag(CARRY, false),
            Sec => self.set_flag(CARRY, true),
            Cli => self.set_flag(INTERRUPT_DISABLE, false),
            Sei => self.set_flag(INTERRUPT_DISABLE, true),
            Clv => self.set_flag(OVERFLOW, false),
            Cld => self.set_flag(DECIMAL, false),
            Sed => self.set_flag(DECIMAL, true),

            Nop => {}
        }
        0
    }

    /// Binary add with carry; SBC reuses this with the operand inverted.
    fn add_with_carry(&mut self, value: u8) {
        let sum = self.a as u16 + value as u16 + (self.status & CARRY) as u16;
        let result = sum as u8;
        self.set_flag(CARRY, sum > 0xFF);
        // Set when both inputs share a sign the result does not.
        self.set_flag(OVERFLOW, (!(self.a ^ value) & (self.a ^ result) & 0x80) != 0);
        self.a = result;
        self.set_zero_and_negative(result);
    }

    fn compare(&mut self, reg: u8, value: u8) {
        self.set_flag(CARRY, reg >= value);
        self.set_zero_and_negative(reg.wrapping_sub(value));
    }

    fn branch(&mut self, taken: bool, operand: Operand) -> u32 {
        if taken {
            self.pc = Self::target(operand);
            1
        } else {
            0
        }
    }

    fn set_zero_and_negative(&mut self, v: u8) {
        self.set_flag(ZERO, v == 0);
        self.set_flag(NEGATIVE, v & 0x80 != 0);
    }
}

fn read_u16<M: Memory6502 + ?Sized>(mem: &M, addr: u16) -> u16 {
    let lo = mem.read(addr) as u16;
    let hi = mem.read(addr.wrapping_add(1)) as u16;
    (hi << 8) | lo
}

/// Pointer read that stays inside the zero page.
fn read_zero_page_u16<M: Memory6502 + ?Sized>(mem: &M, zp: u8) -> u16 {
    let lo = mem.read(zp as u16) as u16;
    let hi = mem.read(zp.wrapping_add(1) as u16) as u16;
    (hi << 8) | lo
}

/// Read a 16-bit pointer for JMP (indirect) with the 6502 page-wrapping bug.
fn read_indirect_u16_bug<M: Memory6502 + ?Sized>(mem: &M, addr: u16) -> u16 {
    let lo = mem.read(addr) as u16;
    let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
    let hi = mem.read(hi_addr) as u16;
    (hi << 8) | lo
}

/// Flat 64 KiB memory for tests and benchmarks.
#[derive(Debug)]
pub struct ArrayMemory {
    pub data: [u8; 0x10000],
}

impl ArrayMemory {
    pub fn new() -> Self {
        Self { data: [0; 0x10000] }
    }

    pub fn load_program(&mut self, offset: u16, data: &[u8]) {
        let off = offset as usize;
        self.data[off..off + data.len()].copy_from_slice(data);
    }
}

impl Default for ArrayMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory6502 for ArrayMemory {
    fn read(&self, addr: u16) -> u8 {
        self.data[addr as usize]
    }

    fn write(&mut self, addr: u16, val: u8) {
        self.data[addr as usize] = val;
    }
}
