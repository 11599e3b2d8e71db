//! Opcode table for the documented 6502 instruction set.
//!
//! Each of the 256 opcode bytes maps to an (operation, addressing mode, base
//! cycle count) triple, or to `None` for undocumented opcodes.

/// Rule for locating an instruction's operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    /// JMP only; reproduces the page-wrap bug
    Indirect,
    /// (zp,X)
    IndirectX,
    /// (zp),Y
    IndirectY,
    /// Signed 8-bit branch offset
    Relative,
}

impl AddrMode {
    /// Number of operand bytes following the opcode.
    pub fn operand_len(self) -> u16 {
        match self {
            AddrMode::Implied | AddrMode::Accumulator => 0,
            AddrMode::Immediate
            | AddrMode::ZeroPage
            | AddrMode::ZeroPageX
            | AddrMode::ZeroPageY
            | AddrMode::IndirectX
            | AddrMode::IndirectY
            | AddrMode::Relative => 1,
            AddrMode::Absolute | AddrMode::AbsoluteX | AddrMode::AbsoluteY | AddrMode::Indirect => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
}

impl Operation {
    pub fn mnemonic(self) -> String {
        format!("{:?}", self).to_uppercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub operation: Operation,
    pub mode: AddrMode,
    /// Documented base cycle count (no page-cross penalties)
    pub cycles: u8,
}

macro_rules! opcode_table {
    ($($byte:literal => $op:ident, $mode:ident, $cycles:literal;)*) => {
        const fn build_table() -> [Option<Opcode>; 256] {
            let mut table: [Option<Opcode>; 256] = [None; 256];
            $(
                table[$byte] = Some(Opcode {
                    operation: Operation::$op,
                    mode: AddrMode::$mode,
                    cycles: $cycles,
                });
            )*
            table
        }
    };
}

opcode_table! {
    0x69 => Adc, Immediate, 2;
    0x65 => Adc, ZeroPage, 3;
    0x75 => Adc, ZeroPageX, 4;
    0x6D => Adc, Absolute, 4;
    0x7D => Adc, AbsoluteX, 4;
    0x79 => Adc, AbsoluteY, 4;
    0x61 => Adc, IndirectX, 6;
    0x71 => Adc, IndirectY, 5;

    0x29 => And, Immediate, 2;
    0x25 => And, ZeroPage, 3;
    0x35 => And, ZeroPageX, 4;
    0x2D => And, Absolute, 4;
    0x3D => And, AbsoluteX, 4;
    0x39 => And, AbsoluteY, 4;
    0x21 => And, IndirectX, 6;
    0x31 => And, IndirectY, 5;

    0x0A => Asl, Accumulator, 2;
    0x06 => Asl, ZeroPage, 5;
    0x16 => Asl, ZeroPageX, 6;
    0x0E => Asl, Absolute, 6;
    0x1E => Asl, AbsoluteX, 7;

    0x90 => Bcc, Relative, 2;
    0xB0 => Bcs, Relative, 2;
    0xF0 => Beq, Relative, 2;
    0x30 => Bmi, Relative, 2;
    0xD0 => Bne, Relative, 2;
    0x10 => Bpl, Relative, 2;
    0x50 => Bvc, Relative, 2;
    0x70 => Bvs, Relative, 2;

    0x24 => Bit, ZeroPage, 3;
    0x2C => Bit, Absolute, 4;

    0x00 => Brk, Implied, 7;

    0x18 => Clc, Implied, 2;
    0xD8 => Cld, Implied, 2;
    0x58 => Cli, Implied, 2;
    0xB8 => Clv, Implied, 2;

    0xC9 => Cmp, Immediate, 2;
    0xC5 => Cmp, ZeroPage, 3;
    0xD5 => Cmp, ZeroPageX, 4;
    0xCD => Cmp, Absolute, 4;
    0xDD => Cmp, AbsoluteX, 4;
    0xD9 => Cmp, AbsoluteY, 4;
    0xC1 => Cmp, IndirectX, 6;
    0xD1 => Cmp, IndirectY, 5;

    0xE0 => Cpx, Immediate, 2;
    0xE4 => Cpx, ZeroPage, 3;
    0xEC => Cpx, Absolute, 4;

    0xC0 => Cpy, Immediate, 2;
    0xC4 => Cpy, ZeroPage, 3;
    0xCC => Cpy, Absolute, 4;

    0xC6 => Dec, ZeroPage, 5;
    0xD6 => Dec, ZeroPageX, 6;
    0xCE => Dec, Absolute, 6;
    0xDE => Dec, AbsoluteX, 7;
    0xCA => Dex, Implied, 2;
    0x88 => Dey, Implied, 2;

    0x49 => Eor, Immediate, 2;
    0x45 => Eor, ZeroPage, 3;
    0x55 => Eor, ZeroPageX, 4;
    0x4D => Eor, Absolute, 4;
    0x5D => Eor, AbsoluteX, 4;
    0x59 => Eor, AbsoluteY, 4;
    0x41 => Eor, IndirectX, 6;
    0x51 => Eor, IndirectY, 5;

    0xE6 => Inc, ZeroPage, 5;
    0xF6 => Inc, ZeroPageX, 6;
    0xEE => Inc, Absolute, 6;
    0xFE => Inc, AbsoluteX, 7;
    0xE8 => Inx, Implied, 2;
    0xC8 => Iny, Implied, 2;

    0x4C => Jmp, Absolute, 3;
    0x6C => Jmp, Indirect, 5;
    0x20 => Jsr, Absolute, 6;

    0xA9 => Lda, Immediate, 2;
    0xA5 => Lda, ZeroPage, 3;
    0xB5 => Lda, ZeroPageX, 4;
    0xAD => Lda, Absolute, 4;
    0xBD => Lda, AbsoluteX, 4;
    0xB9 => Lda, AbsoluteY, 4;
    0xA1 => Lda, IndirectX, 6;
    0xB1 => Lda, IndirectY, 5;

    0xA2 => Ldx, Immediate, 2;
    0xA6 => Ldx, ZeroPage, 3;
    0xB6 => Ldx, ZeroPageY, 4;
    0xAE => Ldx, Absolute, 4;
    0xBE => Ldx, AbsoluteY, 4;

    0xA0 => Ldy, Immediate, 2;
    0xA4 => Ldy, ZeroPage, 3;
    0xB4 => Ldy, ZeroPageX, 4;
    0xAC => Ldy, Absolute, 4;
    0xBC => Ldy, AbsoluteX, 4;

    0x4A => Lsr, Accumulator, 2;
    0x46 => Lsr, ZeroPage, 5;
    0x56 => Lsr, ZeroPageX, 6;
    0x4E => Lsr, Absolute, 6;
    0x5E => Lsr, AbsoluteX, 7;

    0xEA => Nop, Implied, 2;

    0x09 => Ora, Immediate, 2;
    0x05 => Ora, ZeroPage, 3;
    0x15 => Ora, ZeroPageX, 4;
    0x0D => Ora, Absolute, 4;
    0x1D => Ora, AbsoluteX, 4;
    0x19 => Ora, AbsoluteY, 4;
    0x01 => Ora, IndirectX, 6;
    0x11 => Ora, IndirectY, 5;

    0x48 => Pha, Implied, 3;
    0x08 => Php, Implied, 3;
    0x68 => Pla, Implied, 4;
    0x28 => Plp, Implied, 4;

    0x2A => Rol, Accumulator, 2;
    0x26 => Rol, ZeroPage, 5;
    0x36 => Rol, ZeroPageX, 6;
    0x2E => Rol, Absolute, 6;
    0x3E => Rol, AbsoluteX, 7;

    0x6A => Ror, Accumulator, 2;
    0x66 => Ror, ZeroPage, 5;
    0x76 => Ror, ZeroPageX, 6;
    0x6E => Ror, Absolute, 6;
    0x7E => Ror, AbsoluteX, 7;

    0x40 => Rti, Implied, 6;
    0x60 => Rts, Implied, 6;

    0xE9 => Sbc, Immediate, 2;
    0xE5 => Sbc, ZeroPage, 3;
    0xF5 => Sbc, ZeroPageX, 4;
    0xED => Sbc, Absolute, 4;
    0xFD => Sbc, AbsoluteX, 4;
    0xF9 => Sbc, AbsoluteY, 4;
    0xE1 => Sbc, IndirectX, 6;
    0xF1 => Sbc, IndirectY, 5;

    0x38 => Sec, Implied, 2;
    0xF8 => Sed, Implied, 2;
    0x78 => Sei, Implied, 2;

    0x85 => Sta, ZeroPage, 3;
    0x95 => Sta, ZeroPageX, 4;
    0x8D => Sta, Absolute, 4;
    0x9D => Sta, AbsoluteX, 5;
    0x99 => Sta, AbsoluteY, 5;
    0x81 => Sta, IndirectX, 6;
    0x91 => Sta, IndirectY, 6;

    0x86 => Stx, ZeroPage, 3;
    0x96 => Stx, ZeroPageY, 4;
    0x8E => Stx, Absolute, 4;

    0x84 => Sty, ZeroPage, 3;
    0x94 => Sty, ZeroPageX, 4;
    0x8C => Sty, Absolute, 4;

    0xAA => Tax, Implied, 2;
    0xA8 => Tay, Implied, 2;
    0xBA => Tsx, Implied, 2;
    0x8A => Txa, Implied, 2;
    0x9A => Txs, Implied, 2;
    0x98 => Tya, Implied, 2;
}

/// Opcode byte -> decoded instruction.
pub static OPCODES: [Option<Opcode>; 256] = build_table();

#[inline]
pub fn decode(byte: u8) -> Option<Opcode> {
    OPCODES[byte as usize]
}
