//! The arithmetic/logic unit.
//!
//! Every operation reads its inputs from the operand registers OP1..OP4
//! and leaves its output in RESULT (and RESULT2 for multiply/divide). The
//! condition code register CC holds four 1-bit flags, indexed MSB-first:
//! position 0 OVERFLOW, 1 UNDERFLOW, 2 DIVZERO, 3 EQUALORNOT. At most one
//! flag is set per call; operations that can set a flag clear CC first.

use super::word::{RegFile, RegId, Word, WORD_BITS};

/// CC flag position for arithmetic overflow.
pub const OVERFLOW: u32 = 0;
/// CC flag position for arithmetic underflow.
pub const UNDERFLOW: u32 = 1;
/// CC flag position for division by zero.
pub const DIVZERO: u32 = 2;
/// CC flag position for the equality test.
pub const EQUALORNOT: u32 = 3;

const WORD_MASK: u32 = (1 << WORD_BITS) - 1;

fn set_cc(regs: &mut RegFile, flag: u32) {
    regs[RegId::Cc].clear();
    regs[RegId::Cc].set(flag, true);
}

/// OP1 + OP2 -> RESULT (used by AIR and AMR).
///
/// A zero OP2 is a no-op that copies OP1 through. OVERFLOW is raised when
/// the unsigned 18-bit sum wraps.
pub fn add(regs: &mut RegFile) {
    regs[RegId::Cc].clear();
    if regs[RegId::Op2].is_zero() {
        let op1 = regs[RegId::Op1].clone();
        regs[RegId::Result].load_reg(&op1);
        return;
    }

    let sum = regs[RegId::Op1].as_unsigned() + regs[RegId::Op2].as_unsigned();
    if sum > WORD_MASK {
        set_cc(regs, OVERFLOW);
    }
    regs[RegId::Result].set_unsigned(sum);
}

/// OP1 - OP2 -> RESULT (used by SIR and SMR).
///
/// A zero OP2 is a no-op that copies OP1 through. UNDERFLOW is raised when
/// the signed result exceeds the original OP1.
pub fn subtract(regs: &mut RegFile) {
    regs[RegId::Cc].clear();
    if regs[RegId::Op2].is_zero() {
        let op1 = regs[RegId::Op1].clone();
        regs[RegId::Result].load_reg(&op1);
        return;
    }

    let before = regs[RegId::Op1].as_signed();
    let result = before - regs[RegId::Op2].as_signed();
    if result > before {
        set_cc(regs, UNDERFLOW);
    }
    regs[RegId::Result].set_signed(result);
}

/// OP1 * OP2 -> RESULT:RESULT2.
///
/// Both operands are taken unsigned. The 36-bit product is split into its
/// high 18 bits (RESULT) and low 18 bits (RESULT2).
pub fn multiply(regs: &mut RegFile) {
    regs[RegId::Cc].clear();

    let product =
        u64::from(regs[RegId::Op1].as_unsigned()) * u64::from(regs[RegId::Op2].as_unsigned());
    if product >> (2 * WORD_BITS) != 0 {
        set_cc(regs, OVERFLOW);
    }
    regs[RegId::Result].set_unsigned((product >> WORD_BITS) as u32);
    regs[RegId::Result2].set_unsigned(product as u32 & WORD_MASK);
}

/// OP1 / OP2 -> RESULT (quotient) and RESULT2 (remainder).
///
/// Division by zero sets DIVZERO and aborts without touching the result
/// registers.
pub fn divide(regs: &mut RegFile) {
    regs[RegId::Cc].clear();

    let divisor = regs[RegId::Op2].as_signed();
    if divisor == 0 {
        set_cc(regs, DIVZERO);
        return;
    }
    let dividend = regs[RegId::Op1].as_signed();
    regs[RegId::Result].set_signed(dividend / divisor);
    regs[RegId::Result2].set_signed(dividend % divisor);
}

/// Equality test of OP1 and OP2.
///
/// Sets EQUALORNOT (alone) when equal; explicitly clears just that flag
/// when not equal.
pub fn test_equal(regs: &mut RegFile) {
    if regs[RegId::Op1].as_unsigned() == regs[RegId::Op2].as_unsigned() {
        set_cc(regs, EQUALORNOT);
    } else {
        regs[RegId::Cc].set(EQUALORNOT, false);
    }
}

/// OP1 & OP2 -> RESULT.
pub fn and(regs: &mut RegFile) {
    let result = regs[RegId::Op1].as_unsigned() & regs[RegId::Op2].as_unsigned();
    regs[RegId::Result].set_unsigned(result);
}

/// OP1 | OP2 -> RESULT.
pub fn or(regs: &mut RegFile) {
    let result = regs[RegId::Op1].as_unsigned() | regs[RegId::Op2].as_unsigned();
    regs[RegId::Result].set_unsigned(result);
}

/// !OP1 -> RESULT, complementing all 18 bits.
pub fn not(regs: &mut RegFile) {
    let result = !Word::from_unsigned(regs[RegId::Op1].as_unsigned());
    regs[RegId::Result].load_word(result);
}

/// Shifts OP1 by OP2 places -> RESULT.
///
/// OP3 selects the direction (nonzero = left) and OP4 the kind (nonzero =
/// logical). Left shifts are identical for both kinds; a logical right
/// shift fills with zeros while an arithmetic right shift extends the sign
/// bit across the 18-bit window.
pub fn shift(regs: &mut RegFile) {
    let value = regs[RegId::Op1].as_unsigned();
    let count = regs[RegId::Op2].as_unsigned();
    let left = !regs[RegId::Op3].is_zero();
    let logical = !regs[RegId::Op4].is_zero();

    let result = if left {
        value << count
    } else if logical {
        value >> count
    } else {
        (regs[RegId::Op1].as_signed() >> count) as u32
    };
    regs[RegId::Result].set_unsigned(result);
}

/// Rotates OP1 by OP2 places within the 18-bit width -> RESULT.
///
/// OP3 selects the direction (nonzero = left); the arithmetic/logical flag
/// is ignored for rotates.
pub fn rotate(regs: &mut RegFile) {
    let value = regs[RegId::Op1].as_unsigned();
    let count = regs[RegId::Op2].as_unsigned() % WORD_BITS;
    let left = !regs[RegId::Op3].is_zero();

    let result = match (left, count) {
        (_, 0) => value,
        (true, n) => value << n | value >> (WORD_BITS - n),
        (false, n) => value >> n | value << (WORD_BITS - n),
    };
    regs[RegId::Result].set_unsigned(result);
}

/// Greater-or-equal comparison: RESULT becomes 1 iff OP1 >= OP2 (signed),
/// else 0.
pub fn gte(regs: &mut RegFile) {
    let ge = regs[RegId::Op1].as_signed() >= regs[RegId::Op2].as_signed();
    regs[RegId::Result].set_unsigned(ge as u32);
}
