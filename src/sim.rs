//! Simulating and execution for the 18-bit machine.
//!
//! This module is focused on executing loaded programs. It consists of:
//! - [`Simulator`]: the struct that drives the micro-stepped instruction
//!   cycle.
//! - [`word`]: words, registers, and the register file.
//! - [`mem`]: main memory.
//! - [`cache`]: the L1 cache, write buffer, and memory controller.
//! - [`alu`]: the arithmetic/logic unit.
//! - [`decode`]: the instruction register decoder.
//! - [`io`]: the front-end adapter surface.
//!
//! Execution is cycle-stepped: a driver calls [`Simulator::execute`] with a
//! mode, and the engine runs the micro-op state machine. Step 0 is the
//! universal fetch, the decoder runs at step 3, and opcode-specific
//! micro-ops start at step 4. When the step counter returns to 0 the
//! instruction is complete and the PC advances (unless a jump already
//! redirected it).

pub mod alu;
pub mod cache;
pub mod decode;
pub mod io;
pub mod mem;
pub mod word;

use std::sync::{Arc, PoisonError};

use log::{debug, error, info};

use crate::asm::{
    self, AsmErr, LabelTable, LoadSink, Loader, BOOT_PROGRAM_ADDR, GENERAL_PROGRAM_ADDR,
    JUMP_INDIRECTION_ADDR,
};
use crate::ast::Opcode;

use self::cache::{L1Cache, L1CacheLine, MemoryController};
use self::io::{FrontEnd, NoOpFrontEnd, DEV_CONSOLE};
use self::mem::{MainMemory, MemBank, BLOCK_WORDS, MAX_ADDR};
use self::word::{RegFile, RegId, Register, Word};

/// Reserved address holding the trap-subroutine-table base.
pub const TRAP_TABLE_PTR: u32 = 0;
/// Reserved address holding the machine-fault handler entry.
pub const FAULT_HANDLER_PTR: u32 = 1;
/// Reserved address where TRAP saves the return PC.
pub const TRAP_PC_SAVE: u32 = 2;
/// Reserved address where a machine fault saves the PC.
pub const FAULT_PC_SAVE: u32 = 4;
/// Reserved address where a machine fault saves the MSR image.
pub const FAULT_MSR_SAVE: u32 = 5;

/// How [`Simulator::execute`] drives the machine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Run instructions until something halts or stalls the machine.
    #[default]
    Continue,
    /// Run a single micro-step.
    MicroStep,
    /// Run micro-steps until the current instruction completes.
    MacroStep,
    /// Assemble and run one instruction directly, without touching the PC.
    Direct(String),
}

/// Interrupts a driver can raise against the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// I/O arrived; restart an instruction stalled on input.
    Io,
}

/// A machine-detected error, routed through the in-memory fault handler.
///
/// Faults are not surfaced to the driver: the engine saves state to the
/// reserved addresses and transfers control through [`FAULT_HANDLER_PTR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A memory access outside `[0, 2047]`.
    IllegalAddress(i64),
    /// A TRAP code whose table slot is empty.
    IllegalTrapCode(u32),
}

impl Fault {
    /// The MFR bit position recording this fault kind.
    fn mfr_position(self) -> u32 {
        match self {
            Fault::IllegalAddress(_) => 0,
            Fault::IllegalTrapCode(_) => 1,
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::IllegalAddress(addr) => write!(f, "illegal memory address {addr}"),
            Fault::IllegalTrapCode(code) => write!(f, "illegal trap code {code}"),
        }
    }
}
impl std::error::Error for Fault {}

/// Configuration flags for [`Simulator`].
///
/// These can be modified after the simulator is created and their effects
/// still apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimFlags {
    /// Echo the input buffer to the terminal when `IN` consumes its first
    /// character.
    pub echo_input: bool,

    /// When a user program halts, immediately continue execution in the
    /// boot program instead of stopping and leaving the PC at the boot
    /// address.
    pub resume_boot_on_halt: bool,
}

impl Default for SimFlags {
    fn default() -> Self {
        SimFlags { echo_input: true, resume_boot_on_halt: false }
    }
}

/// Executes loaded programs against the register file, ALU, cache, and
/// memory controller.
///
/// The simulator owns the execution thread's half of the machine; the
/// memory-controller worker is spawned at construction and stopped on
/// [`Simulator::shutdown`] (or drop).
pub struct Simulator {
    regs: RegFile,
    mem: MemBank,
    cache: L1Cache,
    controller: MemoryController,
    labels: LabelTable,
    frontend: Box<dyn FrontEnd>,

    /// Configuration settings; see [`SimFlags`].
    pub flags: SimFlags,

    prog_step: u32,
    cycle_count: u64,
    cont_execution: bool,
    jump_taken: bool,
    wait_for_interrupt: bool,
    bootloader_running: bool,
    resume_boot: bool,
    input_buffer: String,
    character_pointer: usize,
    current_mode: ExecMode,
}

impl Simulator {
    /// Creates a simulator wired to the given front end, with zeroed
    /// memory and registers and the memory controller running.
    pub fn new(frontend: Box<dyn FrontEnd>) -> Self {
        let mem = MainMemory::bank();
        let controller = MemoryController::spawn(Arc::clone(&mem));
        Simulator {
            regs: RegFile::new(),
            mem,
            cache: L1Cache::new(),
            controller,
            labels: LabelTable::default(),
            frontend,
            flags: SimFlags::default(),
            prog_step: 0,
            cycle_count: 0,
            cont_execution: true,
            jump_taken: false,
            wait_for_interrupt: false,
            bootloader_running: false,
            resume_boot: false,
            input_buffer: String::new(),
            character_pointer: 0,
            current_mode: ExecMode::default(),
        }
    }

    // ------------------ driver surface ------------------

    /// Loads a program from assembly source.
    ///
    /// If the boot region (address 24) is empty the program loads there
    /// and becomes the boot program; otherwise it loads at the general
    /// program area (address 100). The PC is pointed at the program.
    /// Returns the load address.
    pub fn load_rom(&mut self, source: &str) -> Result<u32, AsmErr> {
        let start = match self.read_mem(BOOT_PROGRAM_ADDR).is_zero() {
            true => BOOT_PROGRAM_ADDR,
            false => GENERAL_PROGRAM_ADDR,
        };
        self.load_rom_at(source, start)
    }

    /// Loads a program from assembly source at a caller-chosen address.
    pub fn load_rom_at(&mut self, source: &str, start: u32) -> Result<u32, AsmErr> {
        let program = Loader::new(start).load(source, self)?;
        self.labels = program.labels;
        self.initialize_program_counter(start);
        Ok(start)
    }

    /// Writes the trap-table base to address 0 and the fault-handler entry
    /// to address 1.
    pub fn init_vectors(&mut self, trap_table: u32, fault_handler: u32) {
        self.write_memory(trap_table, TRAP_TABLE_PTR);
        self.write_memory(fault_handler, FAULT_HANDLER_PTR);
    }

    /// Driver-level memory poke, routed through the cache like every other
    /// write. Used to fill vector tables and preload data.
    pub fn write_memory(&mut self, value: u32, addr: u32) {
        match addr <= MAX_ADDR {
            true => self.write_mem(Word::from_unsigned(value), addr),
            false => error!("poke target {addr} is outside memory; dropping word"),
        }
    }

    /// Preloads text into memory one character per word starting at
    /// `start`, terminated by EOT. Returns the terminator's address.
    pub fn load_text(&mut self, text: &str, start: u32) -> u32 {
        asm::load_text(text, start, self)
    }

    /// Points the PC at `addr` and resets the instruction cycle. Loading a
    /// program at the boot address marks the bootloader as running.
    pub fn initialize_program_counter(&mut self, addr: u32) {
        self.set_reg_unsigned(RegId::Pc, addr);
        self.bootloader_running = addr == BOOT_PROGRAM_ADDR;
        self.prog_step = 0;
    }

    /// Runs the machine in the given mode.
    pub fn execute(&mut self, mode: ExecMode) {
        self.current_mode = mode.clone();
        self.cont_execution = true;

        match mode {
            ExecMode::Continue => {
                self.frontend.toggle_button("load", false);
                debug!("continue");
                self.run_continue();
            }
            ExecMode::MicroStep => {
                self.frontend.toggle_button("load", false);
                debug!("micro step");
                self.single_step();
                if self.wait_for_interrupt {
                    return;
                }
                if self.prog_step == 0 {
                    self.finish_instruction();
                    self.frontend.toggle_button("runinput", true);
                }
            }
            ExecMode::MacroStep => {
                self.frontend.toggle_button("load", false);
                debug!("macro step");
                loop {
                    self.single_step();
                    if self.wait_for_interrupt {
                        return;
                    }
                    if self.prog_step == 0 {
                        break;
                    }
                }
                self.finish_instruction();
                self.frontend.toggle_button("runinput", true);
            }
            ExecMode::Direct(line) => self.run_direct(&line),
        }
    }

    /// Raises an interrupt against the engine.
    ///
    /// An I/O interrupt restarts the instruction stalled on input, in the
    /// mode it was originally executing under.
    pub fn interrupt(&mut self, kind: InterruptKind) {
        match kind {
            InterruptKind::Io => {
                if !self.input_buffer.is_empty() && self.wait_for_interrupt {
                    debug!("restarting instruction after I/O interrupt");
                    self.wait_for_interrupt = false;
                    let mode = self.current_mode.clone();
                    self.execute(mode);
                }
            }
        }
    }

    /// Appends text to the keyboard input buffer.
    ///
    /// Pair with [`Simulator::interrupt`] to wake an instruction stalled
    /// on empty input.
    pub fn feed_input(&mut self, text: &str) {
        self.input_buffer.push_str(text);
    }

    /// Drains the write buffer and stops the memory controller.
    pub fn shutdown(&mut self) {
        self.controller.drain();
        self.controller.stop();
        info!("memory controller shut down");
    }

    // ------------------ inspection ------------------

    /// The register file.
    pub fn regs(&self) -> &RegFile {
        &self.regs
    }

    /// One register, by id.
    pub fn reg(&self, id: RegId) -> &Register {
        &self.regs[id]
    }

    /// The micro-step counter (0 = between instructions).
    pub fn prog_step(&self) -> u32 {
        self.prog_step
    }

    /// Total micro-step transitions since construction.
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Whether the engine is stalled waiting for an I/O interrupt.
    pub fn waiting_for_interrupt(&self) -> bool {
        self.wait_for_interrupt
    }

    /// The L1 cache, for state inspection.
    pub fn cache(&self) -> &L1Cache {
        &self.cache
    }

    /// Reads main memory directly, bypassing the cache.
    ///
    /// This is the external observer's view (a UI memory dump): it may lag
    /// the program's view by at most the write-buffer depth. Call
    /// [`Simulator::drain_writes`] first for an exact view.
    pub fn inspect_memory(&self, addr: u32) -> Word {
        self.mem
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .read(addr)
    }

    /// Blocks until every pending write is durable in main memory.
    pub fn drain_writes(&self) {
        self.controller.drain();
    }

    // ------------------ register plumbing ------------------

    fn publish(&mut self, id: RegId) {
        self.frontend.update_register(id.name(), &self.regs[id]);
    }

    fn set_reg_from(&mut self, dst: RegId, src: RegId) {
        let value = self.regs[src].as_unsigned();
        self.regs[dst].set_unsigned(value);
        self.publish(dst);
    }

    fn set_reg_word(&mut self, dst: RegId, word: Word) {
        self.regs[dst].load_word(word);
        self.publish(dst);
    }

    fn set_reg_unsigned(&mut self, dst: RegId, value: u32) {
        self.regs[dst].set_unsigned(value);
        self.publish(dst);
    }

    fn set_reg_signed(&mut self, dst: RegId, value: i32) {
        self.regs[dst].set_signed(value);
        self.publish(dst);
    }

    /// The general register named by the R field.
    fn r_target(&self) -> RegId {
        RegId::general(self.regs[RegId::R].as_unsigned())
    }

    /// The general register named by the RX field.
    fn rx_target(&self) -> RegId {
        RegId::general(self.regs[RegId::Rx].as_unsigned())
    }

    fn publish_fields(&mut self) {
        for id in [
            RegId::Opcode, RegId::Ix, RegId::R, RegId::I, RegId::Addr, RegId::Rx,
            RegId::Ry, RegId::Al, RegId::Lr, RegId::Count, RegId::Devid, RegId::Trapcode,
        ] {
            self.publish(id);
        }
    }

    // ------------------ memory plumbing ------------------

    fn check_addr(addr: i64) -> Result<u32, Fault> {
        match (0..=i64::from(MAX_ADDR)).contains(&addr) {
            true => Ok(addr as u32),
            false => Err(Fault::IllegalAddress(addr)),
        }
    }

    /// Reads through the cache, filling a line from main memory on a miss.
    fn read_mem(&mut self, addr: u32) -> Word {
        match self.cache.read(addr) {
            Some(word) => word,
            None => self.fill_line(addr),
        }
    }

    /// Fetches the aligned block containing `addr` from main memory,
    /// inserts it as a fresh cache line, and returns the requested word.
    fn fill_line(&mut self, addr: u32) -> Word {
        let block = self
            .mem
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .block(addr);
        let tag = addr & !(BLOCK_WORDS as u32 - 1);
        let word = block[(addr - tag) as usize];
        self.cache.add(L1CacheLine::new(tag, block));
        word
    }

    /// Writes through the cache. A miss fills the line first; a hit hands
    /// the pending write to the memory controller (blocking if the write
    /// buffer is full).
    fn write_mem(&mut self, word: Word, addr: u32) {
        loop {
            if let Some(pending) = self.cache.write(word, addr) {
                self.controller.submit(pending);
                return;
            }
            self.fill_line(addr);
        }
    }

    fn read_checked(&mut self, addr: i64) -> Result<Word, Fault> {
        Ok(self.read_mem(Self::check_addr(addr)?))
    }

    fn write_checked(&mut self, word: Word, addr: i64) -> Result<(), Fault> {
        self.write_mem(word, Self::check_addr(addr)?);
        Ok(())
    }

    // ------------------ execution core ------------------

    fn run_continue(&mut self) {
        loop {
            self.single_step();
            if self.wait_for_interrupt {
                return;
            }
            if self.prog_step == 0 {
                self.finish_instruction();
            }
            if !self.cont_execution {
                self.cont_execution = true;
                if self.resume_boot {
                    self.resume_boot = false;
                    continue;
                }
                break;
            }
        }
    }

    fn run_direct(&mut self, line: &str) {
        debug!("running direct input {line:?}");
        let Some(word) = asm::encode_direct(line, &self.labels) else {
            return;
        };

        // Skip the fetch: plant the word in MDR and enter the cycle at the
        // IR transfer.
        self.set_reg_word(RegId::Mdr, word);
        self.cycle_count += 1;
        self.prog_step = 2;
        while self.prog_step != 0 {
            self.single_step();
            if self.wait_for_interrupt {
                self.prog_step = 0;
                return;
            }
        }
        debug!("--------- instruction done ---------");
        // Direct execution never advances the PC, so a jump flag must not
        // leak into the next fetched instruction.
        self.jump_taken = false;
    }

    fn finish_instruction(&mut self) {
        debug!("--------- instruction done ---------");
        self.advance_pc();
    }

    fn advance_pc(&mut self) {
        if self.jump_taken {
            self.jump_taken = false;
            return;
        }
        let pc = self.regs[RegId::Pc].as_unsigned();
        self.set_reg_unsigned(RegId::Pc, pc + 1);
    }

    fn bump(&mut self) {
        self.cycle_count += 1;
        self.prog_step += 1;
    }

    fn done(&mut self) {
        self.cycle_count += 1;
        self.prog_step = 0;
    }

    /// Runs one micro-step of the instruction cycle.
    fn single_step(&mut self) {
        match self.prog_step {
            // PC -> MAR
            0 => {
                self.set_reg_from(RegId::Mar, RegId::Pc);
                self.bump();
            }
            // Mem(MAR) -> MDR
            1 => {
                let addr = self.regs[RegId::Mar].as_signed();
                match self.read_checked(i64::from(addr)) {
                    Ok(word) => {
                        self.set_reg_word(RegId::Mdr, word);
                        self.bump();
                    }
                    Err(fault) => self.machine_fault(fault),
                }
            }
            // MDR -> IR
            2 => {
                self.set_reg_from(RegId::Ir, RegId::Mdr);
                self.bump();
            }
            // Decode, and service the jump trampoline.
            3 => {
                let opcode = decode::decode(&mut self.regs);
                self.publish_fields();

                // Only an indirect access actually reads the trampoline
                // slot; a direct reference to address 8 must not clobber
                // it.
                let rides_trampoline = opcode.is_some_and(|op| op.format().can_indirect())
                    && self.regs[RegId::Addr].as_unsigned() == JUMP_INDIRECTION_ADDR
                    && self.regs[RegId::I].as_unsigned() == 1;
                if rides_trampoline {
                    let pc = self.regs[RegId::Pc].as_unsigned();
                    let target = self.labels.jump_target_for(pc);
                    debug!("planting jump target {target} in the trampoline slot");
                    self.write_mem(Word::from_unsigned(target), JUMP_INDIRECTION_ADDR);
                }
                self.bump();
            }
            _ => self.opcode_step(),
        }
    }

    fn opcode_step(&mut self) {
        let code = self.regs[RegId::Opcode].as_unsigned();
        let Some(opcode) = Opcode::from_code(code) else {
            // A data word reached the IR; treat it as a one-cycle no-op.
            error!("no instruction with opcode {code:o}; skipping");
            self.done();
            return;
        };
        if let Err(fault) = self.dispatch(opcode) {
            self.machine_fault(fault);
        }
    }

    /// Computes the effective address into EA.
    ///
    /// For LDX/STX the IX field names the transfer target, not an index
    /// source, so indexing is skipped. With I set, one level of
    /// indirection follows: MAR <- EA, MDR <- Mem(MAR), EA <- MDR.
    fn calculate_ea(&mut self, index_instr: bool) -> Result<(), Fault> {
        let ix = self.regs[RegId::Ix].as_unsigned();
        match RegId::index(ix) {
            Some(xreg) if !index_instr => {
                let ea = self.regs[xreg].as_signed()
                    + self.regs[RegId::Addr].as_unsigned() as i32;
                self.set_reg_signed(RegId::Ea, ea);
            }
            _ => self.set_reg_from(RegId::Ea, RegId::Addr),
        }

        if self.regs[RegId::I].as_unsigned() == 1 {
            self.set_reg_from(RegId::Mar, RegId::Ea);
            let addr = self.regs[RegId::Mar].as_signed();
            let word = self.read_checked(i64::from(addr))?;
            self.set_reg_word(RegId::Mdr, word);
            self.set_reg_from(RegId::Ea, RegId::Mdr);
        }
        Ok(())
    }

    /// EA -> PC, marking the jump so the PC does not advance afterwards.
    fn jump_to_ea(&mut self) {
        self.set_reg_from(RegId::Pc, RegId::Ea);
        self.jump_taken = true;
    }

    /// Runs one opcode-specific micro-step (step counter >= 4).
    fn dispatch(&mut self, opcode: Opcode) -> Result<(), Fault> {
        match opcode {
            Opcode::Ldr => match self.prog_step {
                4 => {
                    self.calculate_ea(false)?;
                    self.bump();
                }
                5 => {
                    self.set_reg_from(RegId::Mar, RegId::Ea);
                    self.bump();
                }
                6 => {
                    let addr = self.regs[RegId::Mar].as_signed();
                    let word = self.read_checked(i64::from(addr))?;
                    self.set_reg_word(RegId::Mdr, word);
                    self.bump();
                }
                _ => {
                    self.set_reg_from(self.r_target(), RegId::Mdr);
                    self.done();
                }
            },

            Opcode::Str => match self.prog_step {
                4 => {
                    self.calculate_ea(false)?;
                    self.bump();
                }
                5 => {
                    self.set_reg_from(RegId::Mar, RegId::Ea);
                    self.set_reg_from(RegId::Mdr, self.r_target());
                    self.bump();
                }
                _ => {
                    let word = self.regs[RegId::Mdr].to_word();
                    let addr = self.regs[RegId::Mar].as_signed();
                    self.write_checked(word, i64::from(addr))?;
                    self.done();
                }
            },

            Opcode::Lda => match self.prog_step {
                4 => {
                    self.calculate_ea(false)?;
                    self.bump();
                }
                _ => {
                    self.set_reg_from(self.r_target(), RegId::Ea);
                    self.done();
                }
            },

            Opcode::Ldx => match self.prog_step {
                4 => {
                    self.calculate_ea(true)?;
                    self.bump();
                }
                5 => {
                    self.set_reg_from(RegId::Mar, RegId::Ea);
                    self.bump();
                }
                6 => {
                    let addr = self.regs[RegId::Mar].as_signed();
                    let word = self.read_checked(i64::from(addr))?;
                    self.set_reg_word(RegId::Mdr, word);
                    self.bump();
                }
                _ => {
                    let ix = self.regs[RegId::Ix].as_unsigned();
                    if let Some(xreg) = RegId::index(ix) {
                        self.set_reg_from(xreg, RegId::Mdr);
                    }
                    self.done();
                }
            },

            Opcode::Stx => match self.prog_step {
                4 => {
                    self.calculate_ea(true)?;
                    self.bump();
                }
                5 => {
                    self.set_reg_from(RegId::Mar, RegId::Ea);
                    let ix = self.regs[RegId::Ix].as_unsigned();
                    if let Some(xreg) = RegId::index(ix) {
                        self.set_reg_from(RegId::Mdr, xreg);
                    }
                    self.bump();
                }
                _ => {
                    let word = self.regs[RegId::Mdr].to_word();
                    let addr = self.regs[RegId::Mar].as_signed();
                    self.write_checked(word, i64::from(addr))?;
                    self.done();
                }
            },

            Opcode::Jz | Opcode::Jne => match self.prog_step {
                4 => {
                    self.calculate_ea(false)?;
                    self.bump();
                }
                5 => {
                    self.set_reg_from(RegId::Op1, self.r_target());
                    self.regs[RegId::Op2].clear();
                    self.publish(RegId::Op2);
                    self.bump();
                }
                6 => {
                    alu::test_equal(&mut self.regs);
                    self.publish(RegId::Cc);
                    self.bump();
                }
                _ => {
                    let equal = self.regs[RegId::Cc].get(alu::EQUALORNOT);
                    let take = match opcode {
                        Opcode::Jz => equal,
                        _ => !equal,
                    };
                    if take {
                        self.jump_to_ea();
                    }
                    self.done();
                }
            },

            Opcode::Jcc => match self.prog_step {
                4 => {
                    self.calculate_ea(false)?;
                    self.bump();
                }
                _ => {
                    let position = self.regs[RegId::R].as_unsigned();
                    if self.regs[RegId::Cc].get(position) {
                        self.jump_to_ea();
                    }
                    self.done();
                }
            },

            Opcode::Jmp => match self.prog_step {
                4 => {
                    self.calculate_ea(false)?;
                    self.bump();
                }
                _ => {
                    self.jump_to_ea();
                    self.done();
                }
            },

            Opcode::Jsr => match self.prog_step {
                4 => {
                    self.calculate_ea(false)?;
                    self.bump();
                }
                5 => {
                    let ret = self.regs[RegId::Pc].as_unsigned() + 1;
                    self.set_reg_unsigned(RegId::R3, ret);
                    self.bump();
                }
                _ => {
                    self.jump_to_ea();
                    self.done();
                }
            },

            Opcode::Rfs => match self.prog_step {
                4 => {
                    self.set_reg_from(RegId::R0, RegId::Addr);
                    self.bump();
                }
                _ => {
                    self.set_reg_from(RegId::Pc, RegId::R3);
                    self.jump_taken = true;
                    self.done();
                }
            },

            Opcode::Sob => match self.prog_step {
                4 => {
                    self.calculate_ea(false)?;
                    self.bump();
                }
                5 => {
                    self.set_reg_from(RegId::Op1, self.r_target());
                    self.set_reg_unsigned(RegId::Op2, 1);
                    self.bump();
                }
                6 => {
                    alu::subtract(&mut self.regs);
                    self.publish(RegId::Cc);
                    self.bump();
                }
                7 => {
                    self.set_reg_from(self.r_target(), RegId::Result);
                    self.set_reg_from(RegId::Op1, RegId::Result);
                    self.regs[RegId::Op2].clear();
                    self.publish(RegId::Op2);
                    alu::gte(&mut self.regs);
                    self.bump();
                }
                _ => {
                    if self.regs[RegId::Result].as_unsigned() == 1 {
                        self.jump_to_ea();
                    }
                    self.done();
                }
            },

            Opcode::Jge => match self.prog_step {
                4 => {
                    self.calculate_ea(false)?;
                    self.bump();
                }
                5 => {
                    self.set_reg_from(RegId::Op1, self.r_target());
                    self.regs[RegId::Op2].clear();
                    self.publish(RegId::Op2);
                    self.bump();
                }
                6 => {
                    alu::gte(&mut self.regs);
                    self.bump();
                }
                _ => {
                    if self.regs[RegId::Result].as_unsigned() == 1 {
                        self.jump_to_ea();
                    }
                    self.done();
                }
            },

            Opcode::Amr | Opcode::Smr => match self.prog_step {
                4 => {
                    self.calculate_ea(false)?;
                    self.bump();
                }
                5 => {
                    self.set_reg_from(RegId::Mar, RegId::Ea);
                    self.bump();
                }
                6 => {
                    let addr = self.regs[RegId::Mar].as_signed();
                    let word = self.read_checked(i64::from(addr))?;
                    self.set_reg_word(RegId::Mdr, word);
                    self.bump();
                }
                7 => {
                    self.set_reg_from(RegId::Op1, self.r_target());
                    self.set_reg_from(RegId::Op2, RegId::Mdr);
                    self.bump();
                }
                8 => {
                    match opcode {
                        Opcode::Amr => alu::add(&mut self.regs),
                        _ => alu::subtract(&mut self.regs),
                    }
                    self.publish(RegId::Cc);
                    self.bump();
                }
                _ => {
                    self.set_reg_from(self.r_target(), RegId::Result);
                    self.done();
                }
            },

            Opcode::Air | Opcode::Sir => match self.prog_step {
                4 => {
                    self.set_reg_from(RegId::Op1, self.r_target());
                    // ADDR holds the immediate.
                    self.set_reg_from(RegId::Op2, RegId::Addr);
                    self.bump();
                }
                5 => {
                    match opcode {
                        Opcode::Air => alu::add(&mut self.regs),
                        _ => alu::subtract(&mut self.regs),
                    }
                    self.publish(RegId::Cc);
                    self.bump();
                }
                _ => {
                    self.set_reg_from(self.r_target(), RegId::Result);
                    self.done();
                }
            },

            Opcode::Mlt | Opcode::Dvd => match self.prog_step {
                4 => {
                    self.set_reg_from(RegId::Op1, self.rx_target());
                    let ry = RegId::general(self.regs[RegId::Ry].as_unsigned());
                    self.set_reg_from(RegId::Op2, ry);
                    self.bump();
                }
                5 => {
                    match opcode {
                        Opcode::Mlt => alu::multiply(&mut self.regs),
                        _ => alu::divide(&mut self.regs),
                    }
                    self.publish(RegId::Cc);
                    self.bump();
                }
                _ => {
                    // An aborted divide leaves the destination pair alone.
                    if !self.regs[RegId::Cc].get(alu::DIVZERO) {
                        let rx = self.rx_target();
                        self.set_reg_from(rx, RegId::Result);
                        // RX+1 takes the low word; RX must be 0 or 2.
                        let low = match rx {
                            RegId::R0 => RegId::R1,
                            _ => RegId::R3,
                        };
                        self.set_reg_from(low, RegId::Result2);
                    }
                    self.done();
                }
            },

            Opcode::Trr => match self.prog_step {
                4 => {
                    self.set_reg_from(RegId::Op1, self.rx_target());
                    let ry = RegId::general(self.regs[RegId::Ry].as_unsigned());
                    self.set_reg_from(RegId::Op2, ry);
                    self.bump();
                }
                _ => {
                    alu::test_equal(&mut self.regs);
                    self.publish(RegId::Cc);
                    self.done();
                }
            },

            Opcode::And | Opcode::Orr => match self.prog_step {
                4 => {
                    self.set_reg_from(RegId::Op1, self.rx_target());
                    let ry = RegId::general(self.regs[RegId::Ry].as_unsigned());
                    self.set_reg_from(RegId::Op2, ry);
                    self.bump();
                }
                5 => {
                    match opcode {
                        Opcode::And => alu::and(&mut self.regs),
                        _ => alu::or(&mut self.regs),
                    }
                    self.bump();
                }
                _ => {
                    self.set_reg_from(self.rx_target(), RegId::Result);
                    self.done();
                }
            },

            Opcode::Not => match self.prog_step {
                4 => {
                    self.set_reg_from(RegId::Op1, self.rx_target());
                    self.bump();
                }
                5 => {
                    alu::not(&mut self.regs);
                    self.bump();
                }
                _ => {
                    self.set_reg_from(self.rx_target(), RegId::Result);
                    self.done();
                }
            },

            Opcode::Src | Opcode::Rrc => match self.prog_step {
                4 => {
                    self.set_reg_from(RegId::Op1, self.r_target());
                    self.set_reg_from(RegId::Op2, RegId::Count);
                    self.set_reg_from(RegId::Op3, RegId::Lr);
                    self.set_reg_from(RegId::Op4, RegId::Al);
                    self.bump();
                }
                5 => {
                    match opcode {
                        Opcode::Src => alu::shift(&mut self.regs),
                        _ => alu::rotate(&mut self.regs),
                    }
                    self.bump();
                }
                _ => {
                    self.set_reg_from(self.r_target(), RegId::Result);
                    self.done();
                }
            },

            Opcode::In => {
                if self.input_buffer.is_empty() {
                    info!("waiting for interrupt");
                    self.wait_for_interrupt = true;
                    return Ok(());
                }

                if self.character_pointer == 0 && self.flags.echo_input {
                    self.frontend.append_terminal(&self.input_buffer);
                }

                let ch = self.input_buffer.chars().nth(self.character_pointer);
                if let Some(ch) = ch {
                    self.character_pointer += 1;
                    self.set_reg_unsigned(self.r_target(), ch as u32);
                }

                // Once the whole buffer is consumed, reset for the next
                // line of input.
                if self.character_pointer >= self.input_buffer.chars().count() {
                    self.character_pointer = 0;
                    self.input_buffer.clear();
                }
                self.done();
            }

            Opcode::Out => {
                if self.regs[RegId::Devid].as_unsigned() == DEV_CONSOLE {
                    let value = self.regs[self.r_target()].as_unsigned();
                    let byte = (value & 0xFF) as u8;
                    self.frontend.append_terminal(&char::from(byte).to_string());
                }
                self.done();
            }

            Opcode::Trap => match self.prog_step {
                4 => {
                    debug!("trap");
                    // Save the return PC.
                    let ret = self.regs[RegId::Pc].as_unsigned() + 1;
                    self.write_mem(Word::from_unsigned(ret), TRAP_PC_SAVE);
                    self.bump();
                }
                _ => {
                    let base = self.read_mem(TRAP_TABLE_PTR).as_signed();
                    let code = self.regs[RegId::Trapcode].as_unsigned();
                    let entry = self.read_checked(i64::from(base) + i64::from(code))?;
                    if entry.is_zero() {
                        return Err(Fault::IllegalTrapCode(code));
                    }
                    self.set_reg_word(RegId::Pc, entry);
                    self.jump_taken = true;
                    self.done();
                }
            },

            Opcode::Hlt => {
                info!("end of the program");
                self.cont_execution = false;
                self.frontend.disable_buttons();
                self.frontend.toggle_button("load", true);
                self.clear_main_registers();

                if self.bootloader_running {
                    // The boot program finished; idle until a new program
                    // is loaded.
                    self.bootloader_running = false;
                } else {
                    // A user program finished; hand control back to the
                    // boot program.
                    self.bootloader_running = true;
                    self.jump_taken = true;
                    self.set_reg_unsigned(RegId::Pc, BOOT_PROGRAM_ADDR);
                    if self.flags.resume_boot_on_halt {
                        self.resume_boot = true;
                    }
                }
                self.done();
            }
        }
        Ok(())
    }

    fn clear_main_registers(&mut self) {
        for id in [
            RegId::R0, RegId::R1, RegId::R2, RegId::R3,
            RegId::X1, RegId::X2, RegId::X3,
        ] {
            self.regs[id].clear();
            self.publish(id);
        }
    }

    /// Routes a machine fault through the in-memory handler.
    ///
    /// Saves the PC to address 4 and its 18-bit MSR image to address 5,
    /// records the fault kind in MFR, and transfers control through the
    /// handler entry at address 1. When the fault interrupted a stepped
    /// mode, the handler runs to completion in continue mode.
    fn machine_fault(&mut self, fault: Fault) {
        error!("machine fault: {fault}");

        self.regs[RegId::Mfr].clear();
        self.regs[RegId::Mfr].set(fault.mfr_position(), true);
        self.publish(RegId::Mfr);

        let pc_image = self.regs[RegId::Pc].to_word();
        self.write_mem(pc_image, FAULT_PC_SAVE);
        self.set_reg_word(RegId::Msr, pc_image);
        self.write_mem(pc_image, FAULT_MSR_SAVE);

        let handler = self.read_mem(FAULT_HANDLER_PTR);
        self.set_reg_word(RegId::Pc, handler);
        self.prog_step = 0;
        self.jump_taken = true;

        if !matches!(self.current_mode, ExecMode::Continue) {
            self.current_mode = ExecMode::Continue;
            self.run_continue();
        }
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(Box::new(NoOpFrontEnd))
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("prog_step", &self.prog_step)
            .field("cycle_count", &self.cycle_count)
            .field("bootloader_running", &self.bootloader_running)
            .field("wait_for_interrupt", &self.wait_for_interrupt)
            .finish_non_exhaustive()
    }
}

/// The loader writes programs through the cache, like every other memory
/// access in the machine.
impl LoadSink for Simulator {
    fn read_word(&mut self, addr: u32) -> Word {
        match addr <= MAX_ADDR {
            true => self.read_mem(addr),
            false => Word::new(),
        }
    }

    fn write_word(&mut self, word: Word, addr: u32) {
        match addr <= MAX_ADDR {
            true => self.write_mem(word, addr),
            false => error!("load target {addr} is outside memory; dropping word"),
        }
    }
}
