//! An assembler and cycle-stepped simulator for a small 18-bit Von
//! Neumann minicomputer.
//!
//! The machine has a 2048-word main memory, four general and three index
//! registers, a unified write-through L1 cache whose write buffer is
//! drained by a memory controller on its own thread, and a minimal I/O
//! facility with interrupts and traps. Source programs are assembled and
//! loaded in a single traversal that resolves forward jump labels,
//! spilling out-of-range jump targets through the indirection trampoline
//! at memory address 8.
//!
//! # Usage
//!
//! Load assembly text into a simulator and run it:
//!
//! ```
//! use vn18::sim::{ExecMode, Simulator};
//! use vn18::sim::word::RegId;
//!
//! let mut sim = Simulator::default();
//! sim.load_rom("
//! AIR 0,5
//! AIR 0,7
//! HLT
//! ").unwrap();
//!
//! sim.execute(ExecMode::Continue);
//! assert_eq!(sim.reg(RegId::Pc).as_unsigned(), 27);
//! sim.shutdown();
//! ```
//!
//! Execution can also be driven one micro-step ([`sim::ExecMode::MicroStep`])
//! or one instruction ([`sim::ExecMode::MacroStep`]) at a time, and single
//! instructions can be injected without touching the PC
//! ([`sim::ExecMode::Direct`]). See the [`sim`] module for details.
#![warn(missing_docs)]

pub mod asm;
pub mod ast;
pub mod sim;
