//! The assembler/loader: translates assembly source text into machine
//! words and places them in memory.
//!
//! The loader makes a single traversal over the source but resolves labels
//! two-pass-style: references to labels that are already bound are written
//! directly, while references to labels not yet seen are queued on the
//! label's forward-reference stack and patched in place the moment the
//! label is bound. The module notably consists of:
//! - [`Loader`]: the single-traversal translator.
//! - [`LabelTable`] and [`LabelEntry`]: label bookkeeping, retained after
//!   the load so the engine can service the jump indirection trampoline.
//! - [`LoadSink`]: where words go; the simulator routes them through its
//!   cache, tests use a plain map.
//!
//! Address operands that do not fit the 5-bit ADDR field (labels *or*
//! literals) are encoded as `ADDR = 8, I = 1`: at decode time the engine
//! looks the instruction up in the reference table, plants the true target
//! at memory address 8, and the ordinary indirect effective-address path
//! completes the jump through it.

use log::{debug, error};
use logos::Logos;

use crate::ast::{opcode_bits, Fields, InstrFormat, Opcode, ADDR_LIMIT};
use crate::sim::mem::MAX_ADDR;
use crate::sim::word::Word;

/// The jump indirection trampoline slot.
pub const JUMP_INDIRECTION_ADDR: u32 = 8;
/// Where the boot program loads.
pub const BOOT_PROGRAM_ADDR: u32 = 24;
/// Where general programs load once the boot region is occupied.
pub const GENERAL_PROGRAM_ADDR: u32 = 100;
/// End-of-text terminator written after preloaded text data.
pub const EOT: u32 = 0x04;

/// Destination of loaded words.
///
/// The simulator implements this by writing through its cache; tests can
/// implement it with a plain map. Reads are needed because forward
/// references are patched in place after their words were already stored.
pub trait LoadSink {
    /// Reads the word previously stored at `addr`.
    fn read_word(&mut self, addr: u32) -> Word;
    /// Stores `word` at `addr`.
    fn write_word(&mut self, word: Word, addr: u32);
}

/// Kinds of fatal errors that can occur while loading a program.
///
/// Per-line problems (unknown mnemonics, malformed operands) are not
/// fatal: the line yields a null word, is logged at error level, and is
/// skipped without advancing the write pointer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum AsmErrKind {
    /// A label was defined a second time.
    DuplicateLabel(String),
    /// A label was referenced but never defined.
    UnresolvedLabel(String),
    /// The program ran past the top of memory.
    ProgramTooLarge,
    /// A forward reference resolved to an address too large for the ADDR
    /// field while the instruction also uses indexing; the trampoline
    /// cannot service it.
    IndexedAddrTooLarge(String),
}

impl std::fmt::Display for AsmErrKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateLabel(name) => write!(f, "duplicate label: {name}"),
            Self::UnresolvedLabel(name) => write!(f, "unresolved label: {name}"),
            Self::ProgramTooLarge => f.write_str("program does not fit in memory"),
            Self::IndexedAddrTooLarge(name) => {
                write!(f, "label {name} is out of direct range for an indexed instruction")
            }
        }
    }
}

/// A fatal load error, with the source line it occurred on.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AsmErr {
    /// What went wrong.
    pub kind: AsmErrKind,
    /// 1-based source line number.
    pub line: usize,
}

impl AsmErr {
    fn new(kind: AsmErrKind, line: usize) -> Self {
        AsmErr { kind, line }
    }
}
impl std::fmt::Display for AsmErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.kind)
    }
}
impl std::error::Error for AsmErr {}

/// An entry in the label table.
///
/// `forward_refs` is the LIFO of instruction addresses still waiting for
/// this label to be bound; `refs` records every instruction address that
/// referenced the label, and is what the trampoline resolves through at
/// run time. An `address` of zero means the label is not yet bound.
#[derive(Debug, Clone)]
pub struct LabelEntry {
    name: String,
    address: u32,
    forward_refs: Vec<u32>,
    refs: Vec<u32>,
}

impl LabelEntry {
    /// The label's name. Synthetic entries for out-of-range literals use
    /// the literal's text.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address, or 0 while unbound.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Whether any forward references are still waiting on this label.
    pub fn has_forward_refs(&self) -> bool {
        !self.forward_refs.is_empty()
    }
}

/// The label table built during a load and retained for trampoline lookup.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    entries: Vec<LabelEntry>,
}

impl LabelTable {
    fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// The address a bound label resolves to.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.find(name).map(|i| self.entries[i].address)
    }

    /// The jump target for the instruction at `instr_addr`.
    ///
    /// This is the trampoline's lookup: the engine calls it when a decoded
    /// instruction's ADDR field equals the indirection slot, and writes
    /// the result to memory address 8. Returns 0 when the instruction is
    /// not in the reference table, matching an empty trampoline slot.
    pub fn jump_target_for(&self, instr_addr: u32) -> u32 {
        self.entries
            .iter()
            .find(|e| e.refs.contains(&instr_addr))
            .map(|e| e.address)
            .unwrap_or(0)
    }

    /// Iterates over the table's entries.
    pub fn entries(&self) -> impl Iterator<Item = &LabelEntry> {
        self.entries.iter()
    }
}

/// A successfully loaded program.
#[derive(Debug)]
pub struct LoadedProgram {
    /// First address the program occupies.
    pub start: u32,
    /// One past the last address written.
    pub end: u32,
    /// The label table, for trampoline lookups during execution.
    pub labels: LabelTable,
}

#[derive(Logos, Debug, PartialEq, Clone, Copy)]
#[logos(skip r"[ \t\r]+")]
enum Token<'src> {
    #[regex(r"[A-Za-z][A-Za-z0-9_]*", |lex| lex.slice())]
    Ident(&'src str),
    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
}

/// One comma-separated operand.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Operand<'src> {
    Num(i64),
    Label(&'src str),
}

/// Non-fatal problems with a single line; the line is logged and skipped.
#[derive(Debug, PartialEq)]
enum LineIssue {
    Lex,
    UnknownMnemonic,
    BadOperandCount,
    BadOperand,
    AddrOutOfRange(i64),
    IndexedAddrTooLarge,
    UnboundLabel,
}

impl std::fmt::Display for LineIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lex => f.write_str("unrecognized character"),
            Self::UnknownMnemonic => f.write_str("illegal operation code"),
            Self::BadOperandCount => f.write_str("wrong number of operands"),
            Self::BadOperand => f.write_str("malformed operand"),
            Self::AddrOutOfRange(n) => write!(f, "address {n} is outside memory"),
            Self::IndexedAddrTooLarge => {
                f.write_str("address too large for the ADDR field of an indexed instruction")
            }
            Self::UnboundLabel => f.write_str("label is not bound"),
        }
    }
}

/// What an instruction line parsed into, before address resolution.
struct ParsedInstr<'src> {
    opcode: Opcode,
    fields: Fields,
    /// The address operand, if this format carries one that may name a
    /// label or an out-of-range literal.
    addr_operand: Option<Operand<'src>>,
}

fn lex_line(line: &str) -> Result<Vec<Token<'_>>, LineIssue> {
    Token::lexer(line)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| LineIssue::Lex)
}

/// Splits the tokens after the mnemonic into comma-separated operands.
fn split_operands<'src>(tokens: &[Token<'src>]) -> Result<Vec<Operand<'src>>, LineIssue> {
    let mut operands = Vec::new();
    if tokens.is_empty() {
        return Ok(operands);
    }
    for group in tokens.split(|t| *t == Token::Comma) {
        match group {
            &[Token::Int(n)] => operands.push(Operand::Num(n)),
            &[Token::Ident(name)] => operands.push(Operand::Label(name)),
            _ => return Err(LineIssue::BadOperand),
        }
    }
    Ok(operands)
}

fn num(op: Operand<'_>, limit: u32) -> Result<u32, LineIssue> {
    match op {
        Operand::Num(n) if (0..i64::from(limit)).contains(&n) => Ok(n as u32),
        _ => Err(LineIssue::BadOperand),
    }
}

/// Parses one instruction line into fields, leaving the address operand
/// (if any) unresolved.
fn parse_instruction<'src>(
    mnemonic: &str,
    operands: &[Operand<'src>],
) -> Result<ParsedInstr<'src>, LineIssue> {
    let opcode = Opcode::from_mnemonic(mnemonic).ok_or(LineIssue::UnknownMnemonic)?;
    let mut fields = Fields::default();
    let mut addr_operand = None;

    match opcode.format() {
        // The trailing indirection operand of the two memory formats is
        // optional.
        InstrFormat::LoadStore => {
            let (r, ix, addr) = match operands {
                &[r, ix, addr] => (r, ix, addr),
                &[r, ix, addr, i] => {
                    fields.i = num(i, 2)?;
                    (r, ix, addr)
                }
                _ => return Err(LineIssue::BadOperandCount),
            };
            fields.r = num(r, 4)?;
            fields.ix = num(ix, 4)?;
            addr_operand = Some(addr);
        }
        InstrFormat::Index => {
            let (ix, addr) = match operands {
                &[ix, addr] => (ix, addr),
                &[ix, addr, i] => {
                    fields.i = num(i, 2)?;
                    (ix, addr)
                }
                _ => return Err(LineIssue::BadOperandCount),
            };
            fields.ix = num(ix, 4)?;
            addr_operand = Some(addr);
        }
        InstrFormat::Immediate => match (opcode, operands) {
            // RFS takes a single optional immediate.
            (Opcode::Rfs, &[]) => {}
            (Opcode::Rfs, &[imm]) => fields.addr = num(imm, ADDR_LIMIT)?,
            (_, &[r, imm]) => {
                fields.r = num(r, 4)?;
                fields.addr = num(imm, ADDR_LIMIT)?;
            }
            _ => return Err(LineIssue::BadOperandCount),
        },
        InstrFormat::Trap => match (opcode, operands) {
            (Opcode::Hlt, &[]) => {}
            (Opcode::Trap, &[]) => {}
            (Opcode::Trap, &[code]) => fields.trapcode = num(code, 16)?,
            _ => return Err(LineIssue::BadOperandCount),
        },
        InstrFormat::RegReg => match operands {
            &[rx, ry] => {
                fields.rx = num(rx, 4)?;
                fields.ry = num(ry, 4)?;
            }
            _ => return Err(LineIssue::BadOperandCount),
        },
        InstrFormat::RegOnly => match operands {
            &[rx] => fields.rx = num(rx, 4)?,
            _ => return Err(LineIssue::BadOperandCount),
        },
        InstrFormat::Shift => match operands {
            &[r, count, lr, al] => {
                fields.r = num(r, 4)?;
                fields.count = num(count, 16)?;
                fields.lr = num(lr, 2)?;
                fields.al = num(al, 2)?;
            }
            _ => return Err(LineIssue::BadOperandCount),
        },
        InstrFormat::Io => match operands {
            &[r, devid] => {
                fields.r = num(r, 4)?;
                fields.devid = num(devid, 32)?;
            }
            _ => return Err(LineIssue::BadOperandCount),
        },
    }

    Ok(ParsedInstr { opcode, fields, addr_operand })
}

/// The single-traversal loader.
///
/// Construct one aimed at a start address, feed it a source, and it writes
/// words through the sink while resolving labels.
#[derive(Debug)]
pub struct Loader {
    table: LabelTable,
    cursor: u32,
    start: u32,
}

impl Loader {
    /// Creates a loader that writes its first word at `start`.
    pub fn new(start: u32) -> Self {
        Loader { table: LabelTable::default(), cursor: start, start }
    }

    /// Translates `source` and writes it through `sink`.
    ///
    /// Blank lines and `/` comments are accepted anywhere; a `/` mid-line
    /// trims the remainder. Lines that fail to parse are logged and
    /// skipped without advancing the write pointer. Duplicate labels,
    /// unresolved labels at end of load, and running out of memory abort
    /// the load.
    pub fn load(mut self, source: &str, sink: &mut dyn LoadSink) -> Result<LoadedProgram, AsmErr> {
        for (idx, raw) in source.lines().enumerate() {
            let lineno = idx + 1;
            let line = match raw.find('/') {
                Some(slash) => &raw[..slash],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let tokens = match lex_line(line) {
                Ok(tokens) => tokens,
                Err(issue) => {
                    error!("line {lineno}: {issue}; skipping");
                    continue;
                }
            };

            match tokens.as_slice() {
                [] => continue,
                [Token::Ident(label), Token::Colon, ..] => {
                    self.define_label(label, sink).map_err(|k| AsmErr::new(k, lineno))?;
                }
                [Token::Ident(mnemonic), rest @ ..] => {
                    if self.cursor > MAX_ADDR {
                        return Err(AsmErr::new(AsmErrKind::ProgramTooLarge, lineno));
                    }
                    match self.translate(mnemonic, rest) {
                        Ok(word) => {
                            debug!("loading word {word} at address {}", self.cursor);
                            sink.write_word(word, self.cursor);
                            self.cursor += 1;
                        }
                        Err(issue) => error!("line {lineno}: {issue}; skipping"),
                    }
                }
                _ => error!("line {lineno}: {}; skipping", LineIssue::BadOperand),
            }
        }

        if let Some(entry) = self.table.entries().find(|e| e.has_forward_refs()) {
            let name = entry.name.clone();
            return Err(AsmErr::new(AsmErrKind::UnresolvedLabel(name), source.lines().count()));
        }

        debug!("final instruction loaded at memory location {}", self.cursor);
        Ok(LoadedProgram { start: self.start, end: self.cursor, labels: self.table })
    }

    /// Binds a label at the current write pointer, patching any queued
    /// forward references.
    fn define_label(&mut self, label: &str, sink: &mut dyn LoadSink) -> Result<(), AsmErrKind> {
        let Some(idx) = self.table.find(label) else {
            debug!("new label {label} at address {}", self.cursor);
            self.table.entries.push(LabelEntry {
                name: label.to_string(),
                address: self.cursor,
                forward_refs: Vec::new(),
                refs: Vec::new(),
            });
            return Ok(());
        };

        let entry = &mut self.table.entries[idx];
        if entry.address != 0 {
            return Err(AsmErrKind::DuplicateLabel(label.to_string()));
        }
        entry.address = self.cursor;

        // Resolve every queued forward reference, most recent first.
        while let Some(ref_addr) = entry.forward_refs.pop() {
            let word = sink.read_word(ref_addr);
            let Some(opcode) = Opcode::from_code(opcode_bits(word)) else {
                continue;
            };
            let format = opcode.format();
            let patched = if entry.address < ADDR_LIMIT {
                debug!("resolving forward reference at {ref_addr}: target {}", entry.address);
                format.set_addr(word, entry.address)
            } else {
                if format == InstrFormat::LoadStore && format.unpack(word).ix != 0 {
                    return Err(AsmErrKind::IndexedAddrTooLarge(label.to_string()));
                }
                debug!(
                    "resolving forward reference at {ref_addr}: target {}, using indirection",
                    entry.address
                );
                format.set_indirect(format.set_addr(word, JUMP_INDIRECTION_ADDR))
            };
            sink.write_word(patched, ref_addr);
        }
        Ok(())
    }

    /// Translates one instruction line into a word, resolving its address
    /// operand against the label table.
    fn translate(&mut self, mnemonic: &str, tokens: &[Token<'_>]) -> Result<Word, LineIssue> {
        let operands = split_operands(tokens)?;
        let mut parsed = parse_instruction(mnemonic, &operands)?;

        if let Some(operand) = parsed.addr_operand {
            // For LDX/STX the IX field names the transfer register, not an
            // index source, so it never blocks the trampoline.
            let indexed =
                parsed.opcode.format() == InstrFormat::LoadStore && parsed.fields.ix != 0;
            self.resolve_addr(operand, &mut parsed.fields, indexed)?;
        }
        Ok(parsed.opcode.format().pack(parsed.opcode, &parsed.fields))
    }

    /// Resolves the address operand of a memory-referencing instruction.
    ///
    /// In-range values land directly in the ADDR field. Out-of-range
    /// values (bound labels and literals alike) are routed through the
    /// trampoline; unbound labels are queued as forward references. An
    /// `indexed` instruction cannot ride the trampoline: its effective
    /// address would go through X[ix]+8 instead of the slot itself.
    fn resolve_addr(
        &mut self,
        operand: Operand<'_>,
        fields: &mut Fields,
        indexed: bool,
    ) -> Result<(), LineIssue> {
        match operand {
            Operand::Label(name) => {
                let idx = match self.table.find(name) {
                    Some(idx) => idx,
                    None => {
                        debug!(
                            "new label {name} for forward reference at address {}",
                            self.cursor
                        );
                        self.table.entries.push(LabelEntry {
                            name: name.to_string(),
                            address: 0,
                            forward_refs: vec![self.cursor],
                            refs: vec![self.cursor],
                        });
                        return Ok(());
                    }
                };
                let target = self.table.entries[idx].address;
                if target == 0 {
                    debug!("forward reference to {name} at address {}", self.cursor);
                    self.table.entries[idx].forward_refs.push(self.cursor);
                    self.table.entries[idx].refs.push(self.cursor);
                } else if target < ADDR_LIMIT {
                    // A target in the trampoline slot itself still
                    // resolves correctly through it, under the same
                    // no-indexing restriction as any trampoline ride.
                    if target == JUMP_INDIRECTION_ADDR && indexed {
                        return Err(LineIssue::IndexedAddrTooLarge);
                    }
                    self.table.entries[idx].refs.push(self.cursor);
                    fields.addr = target;
                    if target == JUMP_INDIRECTION_ADDR {
                        fields.i = 1;
                    }
                } else {
                    if indexed {
                        return Err(LineIssue::IndexedAddrTooLarge);
                    }
                    self.table.entries[idx].refs.push(self.cursor);
                    fields.addr = JUMP_INDIRECTION_ADDR;
                    fields.i = 1;
                }
            }
            Operand::Num(n) => {
                if !(0..=i64::from(MAX_ADDR)).contains(&n) {
                    return Err(LineIssue::AddrOutOfRange(n));
                }
                let target = n as u32;
                if target < ADDR_LIMIT && target != JUMP_INDIRECTION_ADDR {
                    fields.addr = target;
                } else {
                    // Out-of-field literals ride the trampoline too, under
                    // a synthetic entry named by the literal itself.
                    if indexed {
                        return Err(LineIssue::IndexedAddrTooLarge);
                    }
                    self.record_literal(target);
                    fields.addr = JUMP_INDIRECTION_ADDR;
                    fields.i = 1;
                }
            }
        }
        Ok(())
    }

    fn record_literal(&mut self, target: u32) {
        let name = target.to_string();
        match self.table.find(&name) {
            Some(idx) => self.table.entries[idx].refs.push(self.cursor),
            None => self.table.entries.push(LabelEntry {
                name,
                address: target,
                forward_refs: Vec::new(),
                refs: vec![self.cursor],
            }),
        }
    }
}

/// Encodes a single instruction line for direct execution.
///
/// Labels must already be bound in `table`; forward references and
/// out-of-field addresses are not available in direct mode (there is no
/// instruction address to hang a trampoline reference on). Returns `None`
/// (with the problem logged) when the line cannot be encoded.
pub fn encode_direct(line: &str, table: &LabelTable) -> Option<Word> {
    let line = match line.find('/') {
        Some(slash) => &line[..slash],
        None => line,
    }
    .trim();

    let issue = match direct_word(line, table) {
        Ok(word) => return Some(word),
        Err(issue) => issue,
    };
    error!("direct input {line:?}: {issue}");
    None
}

fn direct_word(line: &str, table: &LabelTable) -> Result<Word, LineIssue> {
    let tokens = lex_line(line)?;
    let [Token::Ident(mnemonic), rest @ ..] = tokens.as_slice() else {
        return Err(LineIssue::BadOperand);
    };

    let operands = split_operands(rest)?;
    let mut parsed = parse_instruction(mnemonic, &operands)?;

    if let Some(operand) = parsed.addr_operand {
        let target = match operand {
            Operand::Num(n) if (0..=i64::from(MAX_ADDR)).contains(&n) => n as u32,
            Operand::Num(n) => return Err(LineIssue::AddrOutOfRange(n)),
            Operand::Label(name) => match table.lookup(name) {
                Some(addr) if addr != 0 => addr,
                _ => return Err(LineIssue::UnboundLabel),
            },
        };
        if target >= ADDR_LIMIT {
            return Err(LineIssue::AddrOutOfRange(i64::from(target)));
        }
        parsed.fields.addr = target;
    }
    Ok(parsed.opcode.format().pack(parsed.opcode, &parsed.fields))
}

/// Writes `text` into memory one character per word starting at `start`,
/// terminated by the EOT word (0x04). Returns the address of the
/// terminator.
pub fn load_text(text: &str, start: u32, sink: &mut dyn LoadSink) -> u32 {
    let mut addr = start;
    for ch in text.chars() {
        if addr >= MAX_ADDR {
            error!("text preload ran past the top of memory at address {addr}");
            break;
        }
        sink.write_word(Word::from_unsigned(ch as u32), addr);
        addr += 1;
    }
    sink.write_word(Word::from_unsigned(EOT), addr);
    addr
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::sim::word::Word;

    #[derive(Default)]
    struct MapSink(HashMap<u32, Word>);

    impl LoadSink for MapSink {
        fn read_word(&mut self, addr: u32) -> Word {
            self.0.get(&addr).copied().unwrap_or_default()
        }
        fn write_word(&mut self, word: Word, addr: u32) {
            self.0.insert(addr, word);
        }
    }

    fn load_at(src: &str, start: u32) -> (MapSink, LoadedProgram) {
        let mut sink = MapSink::default();
        let prog = Loader::new(start).load(src, &mut sink).expect("load failed");
        (sink, prog)
    }

    fn fields_at(sink: &mut MapSink, addr: u32, fmt: InstrFormat) -> Fields {
        fmt.unpack(sink.read_word(addr))
    }

    #[test]
    fn loads_immediate_program() {
        let src = "AIR 0,5\nAIR 0,7\nHLT\n";
        let (mut sink, prog) = load_at(src, 100);
        assert_eq!((prog.start, prog.end), (100, 103));

        let f = fields_at(&mut sink, 100, InstrFormat::Immediate);
        assert_eq!((f.r, f.addr), (0, 5));
        let f = fields_at(&mut sink, 101, InstrFormat::Immediate);
        assert_eq!((f.r, f.addr), (0, 7));
        assert_eq!(opcode_bits(sink.read_word(102)), Opcode::Hlt.code());
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let src = "/ a comment line\n\nAIR 1,3 / trailing comment\n   \nHLT\n";
        let (mut sink, prog) = load_at(src, 24);
        assert_eq!(prog.end, 26);
        let f = fields_at(&mut sink, 24, InstrFormat::Immediate);
        assert_eq!((f.r, f.addr), (1, 3));
    }

    #[test]
    fn backward_label_resolves_directly() {
        let src = "TOP:\nAIR 0,1\nJMP 0,TOP\n";
        let (mut sink, prog) = load_at(src, 24);
        let f = fields_at(&mut sink, 25, InstrFormat::LoadStore);
        assert_eq!(f.addr, 24);
        assert_eq!(f.i, 0);
        assert_eq!(prog.labels.lookup("TOP"), Some(24));
    }

    #[test]
    fn forward_label_is_patched_once_bound() {
        let src = "JMP 0,TARGET\nAIR 0,1\nTARGET:\nAIR 0,10\nHLT\n";
        let (mut sink, prog) = load_at(src, 24);

        // Forward queue fully drained after the load.
        assert!(prog.labels.entries().all(|e| !e.has_forward_refs()));

        // Target landed at 26 and fits the field directly.
        let f = fields_at(&mut sink, 24, InstrFormat::LoadStore);
        assert_eq!((f.addr, f.i), (26, 0));
    }

    #[test]
    fn far_forward_label_uses_the_trampoline() {
        let mut src = String::from("JMP 0,FAR\n");
        for _ in 0..40 {
            src.push_str("AIR 0,0\n");
        }
        src.push_str("FAR:\nHLT\n");

        let (mut sink, prog) = load_at(&src, 100);
        assert_eq!(prog.labels.lookup("FAR"), Some(141));

        let f = fields_at(&mut sink, 100, InstrFormat::LoadStore);
        assert_eq!((f.addr, f.i), (JUMP_INDIRECTION_ADDR, 1));
        assert_eq!(prog.labels.jump_target_for(100), 141);
    }

    #[test]
    fn far_backward_label_uses_the_trampoline() {
        let mut src = String::new();
        src.push_str("FAR:\n");
        for _ in 0..40 {
            src.push_str("AIR 0,0\n");
        }
        src.push_str("JMP 0,FAR\n");

        let (mut sink, prog) = load_at(&src, 100);
        let f = fields_at(&mut sink, 140, InstrFormat::LoadStore);
        assert_eq!((f.addr, f.i), (JUMP_INDIRECTION_ADDR, 1));
        assert_eq!(prog.labels.jump_target_for(140), 100);
    }

    #[test]
    fn out_of_field_literal_uses_the_trampoline() {
        let src = "STR 0,0,200\nLDR 1,0,200\nHLT\n";
        let (mut sink, prog) = load_at(src, 100);

        for addr in [100, 101] {
            let f = fields_at(&mut sink, addr, InstrFormat::LoadStore);
            assert_eq!((f.addr, f.i), (JUMP_INDIRECTION_ADDR, 1), "at {addr}");
            assert_eq!(prog.labels.jump_target_for(addr), 200);
        }

        // Small literals stay direct.
        let (mut sink, _) = load_at("LDR 1,0,20\n", 100);
        let f = fields_at(&mut sink, 100, InstrFormat::LoadStore);
        assert_eq!((f.addr, f.i), (20, 0));
    }

    #[test]
    fn label_in_the_trampoline_slot_rides_it() {
        // Loading at 8 binds the label to the trampoline slot itself.
        let src = "SLOT:\nLDR 0,2,SLOT\nLDR 0,0,SLOT\n";
        let (mut sink, prog) = load_at(src, 8);
        assert_eq!(prog.labels.lookup("SLOT"), Some(8));

        // The indexed reference was rejected and left no word behind; the
        // plain reference rides the trampoline with indirection forced on.
        assert_eq!(prog.end, 9);
        let f = fields_at(&mut sink, 8, InstrFormat::LoadStore);
        assert_eq!((f.ix, f.addr, f.i), (0, JUMP_INDIRECTION_ADDR, 1));
        assert_eq!(prog.labels.jump_target_for(8), 8);
    }

    #[test]
    fn duplicate_label_is_fatal() {
        let src = "A:\nHLT\nA:\nHLT\n";
        let mut sink = MapSink::default();
        let err = Loader::new(24).load(src, &mut sink).unwrap_err();
        assert_eq!(err.kind, AsmErrKind::DuplicateLabel("A".into()));
        assert_eq!(err.line, 3);
    }

    #[test]
    fn unresolved_label_is_fatal() {
        let src = "JMP 0,NOWHERE\nHLT\n";
        let mut sink = MapSink::default();
        let err = Loader::new(24).load(src, &mut sink).unwrap_err();
        assert_eq!(err.kind, AsmErrKind::UnresolvedLabel("NOWHERE".into()));
    }

    #[test]
    fn bad_lines_are_skipped_without_advancing() {
        let src = "AIR 0,5\nBOGUS 1,2\nAIR 0,7\n";
        let (mut sink, prog) = load_at(src, 24);
        // The bad line left no hole: the second AIR sits right after the
        // first.
        assert_eq!(prog.end, 26);
        let f = fields_at(&mut sink, 25, InstrFormat::Immediate);
        assert_eq!(f.addr, 7);
    }

    #[test]
    fn index_format_has_no_r_field() {
        let src = "LDX 2,20\nSTX 2,20,1\n";
        let (mut sink, _) = load_at(src, 24);

        let f = fields_at(&mut sink, 24, InstrFormat::Index);
        assert_eq!((f.ix, f.addr, f.i), (2, 20, 0));
        let f = fields_at(&mut sink, 25, InstrFormat::Index);
        assert_eq!((f.ix, f.addr, f.i), (2, 20, 1));
    }

    #[test]
    fn shift_and_io_operands() {
        let src = "SRC 1,4,1,1\nOUT 2,1\nIN 0,0\n";
        let (mut sink, _) = load_at(src, 24);

        let f = fields_at(&mut sink, 24, InstrFormat::Shift);
        assert_eq!((f.r, f.count, f.lr, f.al), (1, 4, 1, 1));
        let f = fields_at(&mut sink, 25, InstrFormat::Io);
        assert_eq!((f.r, f.devid), (2, 1));
        let f = fields_at(&mut sink, 26, InstrFormat::Io);
        assert_eq!((f.r, f.devid), (0, 0));
    }

    #[test]
    fn direct_encoding() {
        let (_, prog) = load_at("NEAR:\nHLT\n", 24);

        let w = encode_direct("AIR 0,5", &prog.labels).expect("encodes");
        let f = InstrFormat::Immediate.unpack(w);
        assert_eq!((f.r, f.addr), (0, 5));

        let w = encode_direct("JMP 0,NEAR", &prog.labels).expect("encodes");
        assert_eq!(InstrFormat::LoadStore.unpack(w).addr, 24);

        assert!(encode_direct("JMP 0,NOWHERE", &prog.labels).is_none());
        assert!(encode_direct("FROB 1", &prog.labels).is_none());
    }

    #[test]
    fn text_preload_terminates_with_eot() {
        let mut sink = MapSink::default();
        let end = load_text("ab", 1000, &mut sink);
        assert_eq!(end, 1002);
        assert_eq!(sink.read_word(1000).as_unsigned(), 'a' as u32);
        assert_eq!(sink.read_word(1001).as_unsigned(), 'b' as u32);
        assert_eq!(sink.read_word(1002).as_unsigned(), EOT);
    }
}
