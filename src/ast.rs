//! The instruction set: opcodes, instruction formats, and bit-field
//! layouts.
//!
//! This module is the single source of truth for how an 18-bit instruction
//! word is laid out. The assembler packs fields through it and the IR
//! decoder unpacks through it, so the two can never disagree.
//!
//! Every instruction starts with a 6-bit opcode in the top bits. The rest
//! of the word is packed immediately after the opcode, with no padding,
//! according to one of eight formats (see [`InstrFormat`]). Bit positions
//! follow the machine convention: bit 0 is the MSB.

use crate::sim::word::{Word, WORD_BITS};

/// The number of bits in the opcode field.
pub const OPCODE_BITS: u32 = 6;
/// Exclusive upper bound of the 5-bit ADDR field.
///
/// Address operands at or above this value cannot be encoded directly and
/// go through the jump indirection trampoline instead.
pub const ADDR_LIMIT: u32 = 1 << 5;

/// A machine opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    Hlt, Ldr, Str, Lda, Amr, Smr, Air, Sir,
    Jz, Jne, Jcc, Jmp, Jsr, Rfs, Sob, Jge,
    Mlt, Dvd, Trr, And, Orr, Not, Trap, Src, Rrc,
    Ldx, Stx, In, Out,
}

impl Opcode {
    /// Every opcode.
    pub const ALL: [Opcode; 29] = [
        Opcode::Hlt, Opcode::Ldr, Opcode::Str, Opcode::Lda,
        Opcode::Amr, Opcode::Smr, Opcode::Air, Opcode::Sir,
        Opcode::Jz, Opcode::Jne, Opcode::Jcc, Opcode::Jmp,
        Opcode::Jsr, Opcode::Rfs, Opcode::Sob, Opcode::Jge,
        Opcode::Mlt, Opcode::Dvd, Opcode::Trr, Opcode::And,
        Opcode::Orr, Opcode::Not, Opcode::Trap, Opcode::Src,
        Opcode::Rrc, Opcode::Ldx, Opcode::Stx, Opcode::In, Opcode::Out,
    ];

    /// The 6-bit binary code of this opcode.
    pub fn code(self) -> u32 {
        match self {
            Opcode::Hlt => 0o00,
            Opcode::Ldr => 0o01,
            Opcode::Str => 0o02,
            Opcode::Lda => 0o03,
            Opcode::Amr => 0o04,
            Opcode::Smr => 0o05,
            Opcode::Air => 0o06,
            Opcode::Sir => 0o07,
            Opcode::Jz => 0o10,
            Opcode::Jne => 0o11,
            Opcode::Jcc => 0o12,
            Opcode::Jmp => 0o13,
            Opcode::Jsr => 0o14,
            Opcode::Rfs => 0o15,
            Opcode::Sob => 0o16,
            Opcode::Jge => 0o17,
            Opcode::Mlt => 0o20,
            Opcode::Dvd => 0o21,
            Opcode::Trr => 0o22,
            Opcode::And => 0o23,
            Opcode::Orr => 0o24,
            Opcode::Not => 0o25,
            Opcode::Trap => 0o30,
            Opcode::Src => 0o31,
            Opcode::Rrc => 0o32,
            Opcode::Ldx => 0o41,
            Opcode::Stx => 0o42,
            Opcode::In => 0o61,
            Opcode::Out => 0o62,
        }
    }

    /// Looks an opcode up by its binary code.
    pub fn from_code(code: u32) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| op.code() == code)
    }

    /// The assembly mnemonic of this opcode.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Hlt => "HLT",
            Opcode::Ldr => "LDR",
            Opcode::Str => "STR",
            Opcode::Lda => "LDA",
            Opcode::Amr => "AMR",
            Opcode::Smr => "SMR",
            Opcode::Air => "AIR",
            Opcode::Sir => "SIR",
            Opcode::Jz => "JZ",
            Opcode::Jne => "JNE",
            Opcode::Jcc => "JCC",
            Opcode::Jmp => "JMP",
            Opcode::Jsr => "JSR",
            Opcode::Rfs => "RFS",
            Opcode::Sob => "SOB",
            Opcode::Jge => "JGE",
            Opcode::Mlt => "MLT",
            Opcode::Dvd => "DVD",
            Opcode::Trr => "TRR",
            Opcode::And => "AND",
            Opcode::Orr => "ORR",
            Opcode::Not => "NOT",
            Opcode::Trap => "TRAP",
            Opcode::Src => "SRC",
            Opcode::Rrc => "RRC",
            Opcode::Ldx => "LDX",
            Opcode::Stx => "STX",
            Opcode::In => "IN",
            Opcode::Out => "OUT",
        }
    }

    /// Looks an opcode up by mnemonic (case-insensitive).
    pub fn from_mnemonic(mnemonic: &str) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| op.mnemonic().eq_ignore_ascii_case(mnemonic))
    }

    /// The instruction format this opcode is encoded with.
    pub fn format(self) -> InstrFormat {
        match self {
            Opcode::Ldr | Opcode::Str | Opcode::Lda
            | Opcode::Amr | Opcode::Smr
            | Opcode::Jz | Opcode::Jne | Opcode::Jcc | Opcode::Jmp
            | Opcode::Jsr | Opcode::Sob | Opcode::Jge => InstrFormat::LoadStore,
            Opcode::Ldx | Opcode::Stx => InstrFormat::Index,
            // RFS carries only an immediate; its R slot is left zero.
            Opcode::Air | Opcode::Sir | Opcode::Rfs => InstrFormat::Immediate,
            // HLT is a bare opcode; the trap-code slot is ignored.
            Opcode::Trap | Opcode::Hlt => InstrFormat::Trap,
            Opcode::Mlt | Opcode::Dvd | Opcode::Trr
            | Opcode::And | Opcode::Orr => InstrFormat::RegReg,
            Opcode::Not => InstrFormat::RegOnly,
            Opcode::Src | Opcode::Rrc => InstrFormat::Shift,
            Opcode::In | Opcode::Out => InstrFormat::Io,
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// One of the eight instruction formats.
///
/// | format      | fields after the opcode        | used by                          |
/// |-------------|--------------------------------|----------------------------------|
/// | `LoadStore` | R(2), IX(2), I(1), ADDR(5)     | loads, stores, jumps, AMR/SMR    |
/// | `Index`     | IX(2), I(1), ADDR(5)           | LDX, STX                         |
/// | `Immediate` | R(2), ADDR(5) as immediate     | AIR, SIR, RFS                    |
/// | `Trap`      | TRAPCODE(4)                    | TRAP, HLT                        |
/// | `RegReg`    | RX(2), RY(2)                   | MLT, DVD, TRR, AND, ORR          |
/// | `RegOnly`   | RX(2)                          | NOT                              |
/// | `Shift`     | R(2), AL(1), LR(1), COUNT(4)   | SRC, RRC                         |
/// | `Io`        | R(2), DEVID(5)                 | IN, OUT                          |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum InstrFormat {
    LoadStore,
    Index,
    Immediate,
    Trap,
    RegReg,
    RegOnly,
    Shift,
    Io,
}

/// The decoded (or to-be-encoded) fields of an instruction word.
///
/// Only the fields belonging to the instruction's format are meaningful;
/// the rest stay zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Fields {
    pub r: u32,
    pub ix: u32,
    pub i: u32,
    pub addr: u32,
    pub rx: u32,
    pub ry: u32,
    pub al: u32,
    pub lr: u32,
    pub count: u32,
    pub devid: u32,
    pub trapcode: u32,
}

/// A field slot within the word: its MSB position and width.
#[derive(Clone, Copy)]
struct Slot {
    pos: u32,
    width: u32,
}

impl Slot {
    const fn new(pos: u32, width: u32) -> Self {
        Slot { pos, width }
    }

    fn shift(self) -> u32 {
        WORD_BITS - self.pos - self.width
    }

    fn extract(self, word: Word) -> u32 {
        word.as_unsigned() >> self.shift() & ((1 << self.width) - 1)
    }

    fn insert(self, bits: u32, value: u32) -> u32 {
        let m = ((1u32 << self.width) - 1) << self.shift();
        (bits & !m) | (value << self.shift() & m)
    }
}

const OPCODE_SLOT: Slot = Slot::new(0, OPCODE_BITS);

// LoadStore
const LS_R: Slot = Slot::new(6, 2);
const LS_IX: Slot = Slot::new(8, 2);
const LS_I: Slot = Slot::new(10, 1);
const LS_ADDR: Slot = Slot::new(11, 5);
// Index
const IX_IX: Slot = Slot::new(6, 2);
const IX_I: Slot = Slot::new(8, 1);
const IX_ADDR: Slot = Slot::new(9, 5);
// Immediate
const IMM_R: Slot = Slot::new(6, 2);
const IMM_ADDR: Slot = Slot::new(8, 5);
// Trap
const TRAP_CODE: Slot = Slot::new(6, 4);
// RegReg / RegOnly
const XY_RX: Slot = Slot::new(6, 2);
const XY_RY: Slot = Slot::new(8, 2);
// Shift
const SH_R: Slot = Slot::new(6, 2);
const SH_AL: Slot = Slot::new(8, 1);
const SH_LR: Slot = Slot::new(9, 1);
const SH_COUNT: Slot = Slot::new(10, 4);
// Io
const IO_R: Slot = Slot::new(6, 2);
const IO_DEVID: Slot = Slot::new(8, 5);

impl InstrFormat {
    /// Packs an opcode and its fields into an instruction word.
    pub fn pack(self, opcode: Opcode, f: &Fields) -> Word {
        let mut bits = OPCODE_SLOT.insert(0, opcode.code());
        match self {
            InstrFormat::LoadStore => {
                bits = LS_R.insert(bits, f.r);
                bits = LS_IX.insert(bits, f.ix);
                bits = LS_I.insert(bits, f.i);
                bits = LS_ADDR.insert(bits, f.addr);
            }
            InstrFormat::Index => {
                bits = IX_IX.insert(bits, f.ix);
                bits = IX_I.insert(bits, f.i);
                bits = IX_ADDR.insert(bits, f.addr);
            }
            InstrFormat::Immediate => {
                bits = IMM_R.insert(bits, f.r);
                bits = IMM_ADDR.insert(bits, f.addr);
            }
            InstrFormat::Trap => {
                bits = TRAP_CODE.insert(bits, f.trapcode);
            }
            InstrFormat::RegReg => {
                bits = XY_RX.insert(bits, f.rx);
                bits = XY_RY.insert(bits, f.ry);
            }
            InstrFormat::RegOnly => {
                bits = XY_RX.insert(bits, f.rx);
            }
            InstrFormat::Shift => {
                bits = SH_R.insert(bits, f.r);
                bits = SH_AL.insert(bits, f.al);
                bits = SH_LR.insert(bits, f.lr);
                bits = SH_COUNT.insert(bits, f.count);
            }
            InstrFormat::Io => {
                bits = IO_R.insert(bits, f.r);
                bits = IO_DEVID.insert(bits, f.devid);
            }
        }
        Word::from_unsigned(bits)
    }

    /// Unpacks the fields of an instruction word under this format.
    pub fn unpack(self, word: Word) -> Fields {
        let mut f = Fields::default();
        match self {
            InstrFormat::LoadStore => {
                f.r = LS_R.extract(word);
                f.ix = LS_IX.extract(word);
                f.i = LS_I.extract(word);
                f.addr = LS_ADDR.extract(word);
            }
            InstrFormat::Index => {
                f.ix = IX_IX.extract(word);
                f.i = IX_I.extract(word);
                f.addr = IX_ADDR.extract(word);
            }
            InstrFormat::Immediate => {
                f.r = IMM_R.extract(word);
                f.addr = IMM_ADDR.extract(word);
            }
            InstrFormat::Trap => {
                f.trapcode = TRAP_CODE.extract(word);
            }
            InstrFormat::RegReg => {
                f.rx = XY_RX.extract(word);
                f.ry = XY_RY.extract(word);
            }
            InstrFormat::RegOnly => {
                f.rx = XY_RX.extract(word);
            }
            InstrFormat::Shift => {
                f.r = SH_R.extract(word);
                f.al = SH_AL.extract(word);
                f.lr = SH_LR.extract(word);
                f.count = SH_COUNT.extract(word);
            }
            InstrFormat::Io => {
                f.r = IO_R.extract(word);
                f.devid = IO_DEVID.extract(word);
            }
        }
        f
    }

    /// Whether this format carries an address field.
    pub fn has_addr(self) -> bool {
        matches!(
            self,
            InstrFormat::LoadStore | InstrFormat::Index | InstrFormat::Immediate
        )
    }

    /// Whether this format carries an indirection flag, i.e. whether its
    /// address field can ride the jump trampoline.
    pub fn can_indirect(self) -> bool {
        matches!(self, InstrFormat::LoadStore | InstrFormat::Index)
    }

    /// Rewrites the address field of an already-encoded word.
    ///
    /// Used by the loader to patch forward references in place.
    pub fn set_addr(self, word: Word, addr: u32) -> Word {
        let slot = match self {
            InstrFormat::LoadStore => LS_ADDR,
            InstrFormat::Index => IX_ADDR,
            InstrFormat::Immediate => IMM_ADDR,
            _ => return word,
        };
        Word::from_unsigned(slot.insert(word.as_unsigned(), addr))
    }

    /// Sets the indirection flag of an already-encoded word.
    pub fn set_indirect(self, word: Word) -> Word {
        let slot = match self {
            InstrFormat::LoadStore => LS_I,
            InstrFormat::Index => IX_I,
            _ => return word,
        };
        Word::from_unsigned(slot.insert(word.as_unsigned(), 1))
    }
}

/// Extracts the opcode field (the top 6 bits) of an instruction word.
pub fn opcode_bits(word: Word) -> u32 {
    OPCODE_SLOT.extract(word)
}
