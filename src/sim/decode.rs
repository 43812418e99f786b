//! The instruction register decoder.
//!
//! Splits the 18-bit word sitting in IR into its named bit fields and
//! deposits them in the decode-time field registers. The partitioning is
//! chosen by the opcode (the top 6 bits) through the fixed format table in
//! [`crate::ast`].

use crate::ast::{opcode_bits, Opcode};

use super::word::{RegFile, RegId};

/// Decodes the word in IR into the field registers.
///
/// Every field register of the selected format is written; fields outside
/// the format are zeroed. Returns `None` when the opcode bits do not name
/// an instruction (the word is data, or garbage).
pub fn decode(regs: &mut RegFile) -> Option<Opcode> {
    let ir = regs[RegId::Ir].to_word();

    let code = opcode_bits(ir);
    regs[RegId::Opcode].set_unsigned(code);

    let opcode = Opcode::from_code(code)?;
    let f = opcode.format().unpack(ir);

    regs[RegId::R].set_unsigned(f.r);
    regs[RegId::Ix].set_unsigned(f.ix);
    regs[RegId::I].set_unsigned(f.i);
    regs[RegId::Addr].set_unsigned(f.addr);
    regs[RegId::Rx].set_unsigned(f.rx);
    regs[RegId::Ry].set_unsigned(f.ry);
    regs[RegId::Al].set_unsigned(f.al);
    regs[RegId::Lr].set_unsigned(f.lr);
    regs[RegId::Count].set_unsigned(f.count);
    regs[RegId::Devid].set_unsigned(f.devid);
    regs[RegId::Trapcode].set_unsigned(f.trapcode);

    Some(opcode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Fields, InstrFormat};

    fn decode_word(w: crate::sim::word::Word) -> (RegFile, Option<Opcode>) {
        let mut regs = RegFile::new();
        regs[RegId::Ir].load_word(w);
        let op = decode(&mut regs);
        (regs, op)
    }

    #[test]
    fn decodes_load_store() {
        let f = Fields { r: 1, ix: 2, i: 1, addr: 20, ..Default::default() };
        let w = InstrFormat::LoadStore.pack(Opcode::Ldr, &f);

        let (regs, op) = decode_word(w);
        assert_eq!(op, Some(Opcode::Ldr));
        assert_eq!(regs[RegId::Opcode].as_unsigned(), Opcode::Ldr.code());
        assert_eq!(regs[RegId::R].as_unsigned(), 1);
        assert_eq!(regs[RegId::Ix].as_unsigned(), 2);
        assert_eq!(regs[RegId::I].as_unsigned(), 1);
        assert_eq!(regs[RegId::Addr].as_unsigned(), 20);
    }

    #[test]
    fn decodes_reg_reg_and_clears_stale_fields() {
        let mut regs = RegFile::new();
        regs[RegId::Addr].set_unsigned(31); // stale from a previous decode

        let f = Fields { rx: 2, ry: 3, ..Default::default() };
        regs[RegId::Ir].load_word(InstrFormat::RegReg.pack(Opcode::Mlt, &f));
        assert_eq!(decode(&mut regs), Some(Opcode::Mlt));
        assert_eq!(regs[RegId::Rx].as_unsigned(), 2);
        assert_eq!(regs[RegId::Ry].as_unsigned(), 3);
        assert_eq!(regs[RegId::Addr].as_unsigned(), 0);
    }

    #[test]
    fn decodes_shift_and_trap() {
        let f = Fields { r: 3, al: 1, lr: 1, count: 7, ..Default::default() };
        let (regs, op) = decode_word(InstrFormat::Shift.pack(Opcode::Rrc, &f));
        assert_eq!(op, Some(Opcode::Rrc));
        assert_eq!(regs[RegId::Al].as_unsigned(), 1);
        assert_eq!(regs[RegId::Lr].as_unsigned(), 1);
        assert_eq!(regs[RegId::Count].as_unsigned(), 7);

        let f = Fields { trapcode: 5, ..Default::default() };
        let (regs, op) = decode_word(InstrFormat::Trap.pack(Opcode::Trap, &f));
        assert_eq!(op, Some(Opcode::Trap));
        assert_eq!(regs[RegId::Trapcode].as_unsigned(), 5);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let (regs, op) = decode_word(crate::sim::word::Word::from_unsigned(0o77 << 12));
        assert_eq!(op, None);
        assert_eq!(regs[RegId::Opcode].as_unsigned(), 0o77);
    }
}
