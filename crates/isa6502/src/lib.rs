use thiserror::Error;

/// Addressing modes the assembler can ask this table about. These are the
/// modes of the NMOS 6502; indexed-indirect forms are zero-page only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndexedIndirectX,
    IndirectIndexedY,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeDescriptor {
    pub mnemonic: &'static str,
    pub mode: AddressingMode,
}

#[derive(Debug, Error)]
pub enum CpuError {
    #[error("unknown mnemonic '{mnemonic}'")]
    UnknownMnemonic { mnemonic: String },
}

macro_rules! op {
    ($mnemonic:literal, $mode:ident) => {
        Some(OpcodeDescriptor {
            mnemonic: $mnemonic,
            mode: AddressingMode::$mode,
        })
    };
}

/// NMOS 6502 opcode map, indexed by opcode byte. Undocumented opcodes are
/// left empty; the assembler never emits them.
const MOS6502_TABLE: [Option<OpcodeDescriptor>; 256] = [
    // 0x00
    op!("brk", Implied),
    op!("ora", IndexedIndirectX),
    None,
    None,
    None,
    op!("ora", ZeroPage),
    op!("asl", ZeroPage),
    None,
    op!("php", Implied),
    op!("ora", Immediate),
    op!("asl", Accumulator),
    None,
    None,
    op!("ora", Absolute),
    op!("asl", Absolute),
    None,
    // 0x10
    op!("bpl", Relative),
    op!("ora", IndirectIndexedY),
    None,
    None,
    None,
    op!("ora", ZeroPageX),
    op!("asl", ZeroPageX),
    None,
    op!("clc", Implied),
    op!("ora", AbsoluteY),
    None,
    None,
    None,
    op!("ora", AbsoluteX),
    op!("asl", AbsoluteX),
    None,
    // 0x20
    op!("jsr", Absolute),
    op!("and", IndexedIndirectX),
    None,
    None,
    op!("bit", ZeroPage),
    op!("and", ZeroPage),
    op!("rol", ZeroPage),
    None,
    op!("plp", Implied),
    op!("and", Immediate),
    op!("rol", Accumulator),
    None,
    op!("bit", Absolute),
    op!("and", Absolute),
    op!("rol", Absolute),
    None,
    // 0x30
    op!("bmi", Relative),
    op!("and", IndirectIndexedY),
    None,
    None,
    None,
    op!("and", ZeroPageX),
    op!("rol", ZeroPageX),
    None,
    op!("sec", Implied),
    op!("and", AbsoluteY),
    None,
    None,
    None,
    op!("and", AbsoluteX),
    op!("rol", AbsoluteX),
    None,
    // 0x40
    op!("rti", Implied),
    op!("eor", IndexedIndirectX),
    None,
    None,
    None,
    op!("eor", ZeroPage),
    op!("lsr", ZeroPage),
    None,
    op!("pha", Implied),
    op!("eor", Immediate),
    op!("lsr", Accumulator),
    None,
    op!("jmp", Absolute),
    op!("eor", Absolute),
    op!("lsr", Absolute),
    None,
    // 0x50
    op!("bvc", Relative),
    op!("eor", IndirectIndexedY),
    None,
    None,
    None,
    op!("eor", ZeroPageX),
    op!("lsr", ZeroPageX),
    None,
    op!("cli", Implied),
    op!("eor", AbsoluteY),
    None,
    None,
    None,
    op!("eor", AbsoluteX),
    op!("lsr", AbsoluteX),
    None,
    // 0x60
    op!("rts", Implied),
    op!("adc", IndexedIndirectX),
    None,
    None,
    None,
    op!("adc", ZeroPage),
    op!("ror", ZeroPage),
    None,
    op!("pla", Implied),
    op!("adc", Immediate),
    op!("ror", Accumulator),
    None,
    op!("jmp", Indirect),
    op!("adc", Absolute),
    op!("ror", Absolute),
    None,
    // 0x70
    op!("bvs", Relative),
    op!("adc", IndirectIndexedY),
    None,
    None,
    None,
    op!("adc", ZeroPageX),
    op!("ror", ZeroPageX),
    None,
    op!("sei", Implied),
    op!("adc", AbsoluteY),
    None,
    None,
    None,
    op!("adc", AbsoluteX),
    op!("ror", AbsoluteX),
    None,
    // 0x80
    None,
    op!("sta", IndexedIndirectX),
    None,
    None,
    op!("sty", ZeroPage),
    op!("sta", ZeroPage),
    op!("stx", ZeroPage),
    None,
    op!("dey", Implied),
    None,
    op!("txa", Implied),
    None,
    op!("sty", Absolute),
    op!("sta", Absolute),
    op!("stx", Absolute),
    None,
    // 0x90
    op!("bcc", Relative),
    op!("sta", IndirectIndexedY),
    None,
    None,
    op!("sty", ZeroPageX),
    op!("sta", ZeroPageX),
    op!("stx", ZeroPageY),
    None,
    op!("tya", Implied),
    op!("sta", AbsoluteY),
    op!("txs", Implied),
    None,
    None,
    op!("sta", AbsoluteX),
    None,
    None,
    // 0xA0
    op!("ldy", Immediate),
    op!("lda", IndexedIndirectX),
    op!("ldx", Immediate),
    None,
    op!("ldy", ZeroPage),
    op!("lda", ZeroPage),
    op!("ldx", ZeroPage),
    None,
    op!("tay", Implied),
    op!("lda", Immediate),
    op!("tax", Implied),
    None,
    op!("ldy", Absolute),
    op!("lda", Absolute),
    op!("ldx", Absolute),
    None,
    // 0xB0
    op!("bcs", Relative),
    op!("lda", IndirectIndexedY),
    None,
    None,
    op!("ldy", ZeroPageX),
    op!("lda", ZeroPageX),
    op!("ldx", ZeroPageY),
    None,
    op!("clv", Implied),
    op!("lda", AbsoluteY),
    op!("tsx", Implied),
    None,
    op!("ldy", AbsoluteX),
    op!("lda", AbsoluteX),
    op!("ldx", AbsoluteY),
    None,
    // 0xC0
    op!("cpy", Immediate),
    op!("cmp", IndexedIndirectX),
    None,
    None,
    op!("cpy", ZeroPage),
    op!("cmp", ZeroPage),
    op!("dec", ZeroPage),
    None,
    op!("iny", Implied),
    op!("cmp", Immediate),
    op!("dex", Implied),
    None,
    op!("cpy", Absolute),
    op!("cmp", Absolute),
    op!("dec", Absolute),
    None,
    // 0xD0
    op!("bne", Relative),
    op!("cmp", IndirectIndexedY),
    None,
    None,
    None,
    op!("cmp", ZeroPageX),
    op!("dec", ZeroPageX),
    None,
    op!("cld", Implied),
    op!("cmp", AbsoluteY),
    None,
    None,
    None,
    op!("cmp", AbsoluteX),
    op!("dec", AbsoluteX),
    None,
    // 0xE0
    op!("cpx", Immediate),
    op!("sbc", IndexedIndirectX),
    None,
    None,
    op!("cpx", ZeroPage),
    op!("sbc", ZeroPage),
    op!("inc", ZeroPage),
    None,
    op!("inx", Implied),
    op!("sbc", Immediate),
    op!("nop", Implied),
    None,
    op!("cpx", Absolute),
    op!("sbc", Absolute),
    op!("inc", Absolute),
    None,
    // 0xF0
    op!("beq", Relative),
    op!("sbc", IndirectIndexedY),
    None,
    None,
    None,
    op!("sbc", ZeroPageX),
    op!("inc", ZeroPageX),
    None,
    op!("sed", Implied),
    op!("sbc", AbsoluteY),
    None,
    None,
    None,
    op!("sbc", AbsoluteX),
    op!("inc", AbsoluteX),
    None,
];

/// Handle on one CPU's opcode table. The assembler keeps a reference to the
/// table for the target it was configured with.
#[derive(Debug)]
pub struct Cpu {
    name: &'static str,
    table: &'static [Option<OpcodeDescriptor>; 256],
}

static MOS6502: Cpu = Cpu {
    name: "6502",
    table: &MOS6502_TABLE,
};

impl Cpu {
    pub fn mos6502() -> &'static Cpu {
        &MOS6502
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True if any addressing mode of `mnemonic` exists. Case-insensitive.
    pub fn is_mnemonic(&self, mnemonic: &str) -> bool {
        let lower = mnemonic.to_ascii_lowercase();
        self.table
            .iter()
            .flatten()
            .any(|entry| entry.mnemonic == lower)
    }

    /// Opcode byte for `mnemonic` in `mode`, if that encoding exists.
    pub fn opcode(&self, mnemonic: &str, mode: AddressingMode) -> Option<u8> {
        let lower = mnemonic.to_ascii_lowercase();
        self.table
            .iter()
            .position(|entry| {
                entry.is_some_and(|entry| entry.mnemonic == lower && entry.mode == mode)
            })
            .map(|index| index as u8)
    }

    /// All addressing modes defined for `mnemonic`, in opcode order.
    pub fn modes(&self, mnemonic: &str) -> Vec<AddressingMode> {
        let lower = mnemonic.to_ascii_lowercase();
        self.table
            .iter()
            .flatten()
            .filter(|entry| entry.mnemonic == lower)
            .map(|entry| entry.mode)
            .collect()
    }

    /// Table entry for `mnemonic`, or the error the assembler reports for an
    /// unknown instruction.
    pub fn require_mnemonic(&self, mnemonic: &str) -> Result<Vec<AddressingMode>, CpuError> {
        let modes = self.modes(mnemonic);
        if modes.is_empty() {
            return Err(CpuError::UnknownMnemonic {
                mnemonic: mnemonic.to_string(),
            });
        }
        Ok(modes)
    }
}

/// Operand byte count for a mode (the instruction is one opcode byte plus
/// this many argument bytes).
pub fn operand_width(mode: AddressingMode) -> usize {
    match mode {
        AddressingMode::Implied | AddressingMode::Accumulator => 0,
        AddressingMode::Immediate
        | AddressingMode::ZeroPage
        | AddressingMode::ZeroPageX
        | AddressingMode::ZeroPageY
        | AddressingMode::IndexedIndirectX
        | AddressingMode::IndirectIndexedY
        | AddressingMode::Relative => 1,
        AddressingMode::Absolute
        | AddressingMode::AbsoluteX
        | AddressingMode::AbsoluteY
        | AddressingMode::Indirect => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_opcode_count() {
        let populated = MOS6502_TABLE.iter().flatten().count();
        assert_eq!(populated, 151);
    }

    #[test]
    fn looks_up_common_encodings() {
        let cpu = Cpu::mos6502();
        assert_eq!(cpu.opcode("lda", AddressingMode::Immediate), Some(0xA9));
        assert_eq!(cpu.opcode("lda", AddressingMode::ZeroPage), Some(0xA5));
        assert_eq!(cpu.opcode("lda", AddressingMode::Absolute), Some(0xAD));
        assert_eq!(cpu.opcode("jmp", AddressingMode::Indirect), Some(0x6C));
        assert_eq!(cpu.opcode("beq", AddressingMode::Relative), Some(0xF0));
        assert_eq!(cpu.opcode("rts", AddressingMode::Implied), Some(0x60));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let cpu = Cpu::mos6502();
        assert_eq!(cpu.opcode("LDA", AddressingMode::Immediate), Some(0xA9));
        assert!(cpu.is_mnemonic("Nop"));
    }

    #[test]
    fn missing_encodings_are_absent() {
        let cpu = Cpu::mos6502();
        assert_eq!(cpu.opcode("jsr", AddressingMode::ZeroPage), None);
        assert_eq!(cpu.opcode("stx", AddressingMode::AbsoluteX), None);
        assert_eq!(cpu.opcode("lda", AddressingMode::Implied), None);
    }

    #[test]
    fn unknown_mnemonic_is_an_error() {
        let err = Cpu::mos6502().require_mnemonic("xyzzy").expect_err("must fail");
        assert!(matches!(err, CpuError::UnknownMnemonic { .. }));
    }

    #[test]
    fn operand_widths() {
        assert_eq!(operand_width(AddressingMode::Implied), 0);
        assert_eq!(operand_width(AddressingMode::Immediate), 1);
        assert_eq!(operand_width(AddressingMode::Relative), 1);
        assert_eq!(operand_width(AddressingMode::Absolute), 2);
        assert_eq!(operand_width(AddressingMode::Indirect), 2);
    }

    #[test]
    fn store_instructions_have_no_immediate() {
        let cpu = Cpu::mos6502();
        for mnemonic in ["sta", "stx", "sty"] {
            assert_eq!(cpu.opcode(mnemonic, AddressingMode::Immediate), None);
        }
    }

    #[test]
    fn branch_instructions_are_relative_only() {
        let cpu = Cpu::mos6502();
        for mnemonic in ["bpl", "bmi", "bvc", "bvs", "bcc", "bcs", "bne", "beq"] {
            assert_eq!(cpu.modes(mnemonic), vec![AddressingMode::Relative]);
        }
    }
}
