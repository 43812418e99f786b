//! End-to-end execution tests: whole programs assembled, loaded, and run
//! against the full machine (cache, write buffer, and memory controller
//! included).

use vn18::asm::EOT;
use vn18::ast::{InstrFormat, Opcode};
use vn18::sim::io::BufferedFrontEnd;
use vn18::sim::word::RegId;
use vn18::sim::{ExecMode, InterruptKind, Simulator};

const USER: u32 = 100;

/// Micro-steps until the HLT instruction has been decoded but not yet
/// executed, so register state is observable before the halt cleanup
/// clears it.
fn run_until_halt_decoded(sim: &mut Simulator) {
    for _ in 0..200_000 {
        if sim.reg(RegId::Opcode).as_unsigned() == Opcode::Hlt.code() && sim.prog_step() == 4 {
            return;
        }
        sim.execute(ExecMode::MicroStep);
    }
    panic!("program never reached HLT");
}

#[test]
fn s1_immediate_add() {
    let mut sim = Simulator::default();
    sim.load_rom_at("AIR 0,5\nAIR 0,7\nHLT\n", USER).unwrap();

    run_until_halt_decoded(&mut sim);
    assert_eq!(sim.reg(RegId::R0).as_signed(), 12);
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), 102);

    // Executing the HLT hands control back to the boot program and clears
    // the working registers.
    sim.execute(ExecMode::MicroStep);
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), 24);
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 0);
    sim.shutdown();
}

#[test]
fn s2_memory_store_load() {
    let mut sim = Simulator::default();
    sim.load_rom_at("LDA 0,0,42\nSTR 0,0,200\nLDR 1,0,200\nHLT\n", USER)
        .unwrap();

    run_until_halt_decoded(&mut sim);
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 42);
    assert_eq!(sim.reg(RegId::R1).as_unsigned(), 42);

    sim.drain_writes();
    assert_eq!(sim.inspect_memory(200).as_unsigned(), 42);
    sim.shutdown();
}

#[test]
fn s3_forward_jump() {
    let mut sim = Simulator::default();
    sim.load_rom_at("JMP 0,TARGET\nAIR 0,1\nTARGET:\nAIR 0,10\nHLT\n", USER)
        .unwrap();

    run_until_halt_decoded(&mut sim);
    // The skipped AIR never ran.
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 10);
    sim.shutdown();
}

#[test]
fn s4_indirect_trampoline() {
    // Pad the program so the jump target lands at address 200.
    let mut src = String::from("JMP 0,TARGET\n");
    for _ in 0..99 {
        src.push_str("AIR 3,1\n");
    }
    src.push_str("TARGET:\nHLT\n");

    let mut sim = Simulator::default();
    sim.load_rom_at(&src, USER).unwrap();
    sim.drain_writes();

    // The emitted jump rides the trampoline.
    let jmp = InstrFormat::LoadStore.unpack(sim.inspect_memory(100));
    assert_eq!((jmp.addr, jmp.i), (8, 1));

    run_until_halt_decoded(&mut sim);
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), 200);

    // The true target was planted in the trampoline slot on the way.
    sim.drain_writes();
    assert_eq!(sim.inspect_memory(8).as_unsigned(), 200);
    sim.shutdown();
}

#[test]
fn s5_multiply() {
    let mut sim = Simulator::default();
    sim.load_rom_at("AIR 0,6\nAIR 2,7\nMLT 0,2\nHLT\n", USER).unwrap();

    run_until_halt_decoded(&mut sim);
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 0); // high word
    assert_eq!(sim.reg(RegId::R1).as_unsigned(), 42); // low word
    assert_eq!(sim.reg(RegId::R2).as_unsigned(), 7);
    sim.shutdown();
}

#[test]
fn s6_divide_by_zero() {
    let mut sim = Simulator::default();
    sim.load_rom_at("AIR 0,5\nDVD 0,2\nHLT\n", USER).unwrap();

    run_until_halt_decoded(&mut sim);
    assert!(sim.reg(RegId::Cc).get(2), "DIVZERO flag not set");
    // The aborted divide left the destination pair alone.
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 5);
    assert_eq!(sim.reg(RegId::R1).as_unsigned(), 0);
    sim.shutdown();
}

#[test]
fn boot_halt_advances_past_the_hlt() {
    let mut sim = Simulator::default();
    // Address 24 is empty, so this becomes the boot program.
    let start = sim.load_rom("AIR 0,5\nAIR 0,7\nHLT\n").unwrap();
    assert_eq!(start, 24);

    sim.execute(ExecMode::Continue);
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), 27);
    sim.shutdown();
}

#[test]
fn second_program_loads_at_the_general_area() {
    let mut sim = Simulator::default();
    sim.load_rom("AIR 0,1\nHLT\n").unwrap();
    let start = sim.load_rom("AIR 0,2\nHLT\n").unwrap();
    assert_eq!(start, USER);
    sim.shutdown();
}

#[test]
fn user_halt_returns_to_boot_and_clears_registers() {
    let mut sim = Simulator::default();
    sim.load_rom_at("AIR 0,3\nSTR 0,0,20\nLDX 1,20\nAIR 1,2\nHLT\n", USER).unwrap();

    sim.execute(ExecMode::Continue);
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), 24);
    for id in [RegId::R0, RegId::R1, RegId::R2, RegId::R3, RegId::X1, RegId::X2, RegId::X3] {
        assert_eq!(sim.reg(id).as_unsigned(), 0, "{id:?} not cleared");
    }
    sim.shutdown();
}

#[test]
fn indirect_effective_address_is_one_level() {
    // mem[20] holds a pointer to 25; mem[25] holds the data.
    let src = "
AIR 0,25
STR 0,0,20
AIR 1,9
STR 1,0,25
LDR 2,0,20,1
HLT
";
    let mut sim = Simulator::default();
    sim.load_rom_at(src, USER).unwrap();

    run_until_halt_decoded(&mut sim);
    // One level of indirection: the pointer is followed once, not twice.
    assert_eq!(sim.reg(RegId::R2).as_unsigned(), 9);
    sim.shutdown();
}

#[test]
fn index_registers_offset_the_address() {
    // X2 <- mem[20] = 6, then LDR through X2 + 25 reads mem[31].
    let src = "
AIR 0,6
STR 0,0,20
AIR 1,8
STR 1,0,31
LDX 2,20
LDR 3,2,25
HLT
";
    let mut sim = Simulator::default();
    sim.load_rom_at(src, USER).unwrap();

    run_until_halt_decoded(&mut sim);
    assert_eq!(sim.reg(RegId::X2).as_unsigned(), 6);
    assert_eq!(sim.reg(RegId::R3).as_unsigned(), 8);
    sim.shutdown();
}

#[test]
fn sob_counts_down_through_the_loop() {
    let mut sim = Simulator::default();
    sim.load_rom_at("AIR 0,3\nTOP:\nAIR 1,2\nSOB 0,0,TOP\nHLT\n", USER).unwrap();

    run_until_halt_decoded(&mut sim);
    // Body runs once plus once per jump while the counter stays >= 0.
    assert_eq!(sim.reg(RegId::R1).as_unsigned(), 8);
    assert_eq!(sim.reg(RegId::R0).as_signed(), -1);
    sim.shutdown();
}

#[test]
fn jsr_and_rfs_round_trip() {
    let src = "
JSR 0,SUB
AIR 1,1
HLT
SUB:
AIR 2,5
RFS 0
";
    let mut sim = Simulator::default();
    sim.load_rom_at(src, USER).unwrap();

    run_until_halt_decoded(&mut sim);
    assert_eq!(sim.reg(RegId::R3).as_unsigned(), 101); // return address
    assert_eq!(sim.reg(RegId::R2).as_unsigned(), 5); // subroutine ran
    assert_eq!(sim.reg(RegId::R1).as_unsigned(), 1); // fell back through
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 0); // RFS immediate
    sim.shutdown();
}

#[test]
fn in_stalls_until_interrupt_then_out_echoes() {
    let fe = BufferedFrontEnd::new();
    let handle = fe.clone();

    let mut sim = Simulator::new(Box::new(fe));
    sim.flags.echo_input = false;
    sim.load_rom_at("IN 0,0\nOUT 0,1\nHLT\n", USER).unwrap();

    sim.execute(ExecMode::Continue);
    assert!(sim.waiting_for_interrupt());
    assert_eq!(handle.terminal(), "");

    sim.feed_input("A");
    sim.interrupt(InterruptKind::Io);

    assert!(!sim.waiting_for_interrupt());
    assert_eq!(handle.terminal(), "A");
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), 24); // halted back to boot
    sim.shutdown();
}

#[test]
fn in_consumes_the_buffer_character_by_character() {
    let fe = BufferedFrontEnd::new();
    let handle = fe.clone();

    let mut sim = Simulator::new(Box::new(fe));
    sim.flags.echo_input = false;
    sim.load_rom_at("IN 0,0\nOUT 0,1\nIN 0,0\nOUT 0,1\nHLT\n", USER).unwrap();

    sim.feed_input("hi");
    sim.execute(ExecMode::Continue);

    assert_eq!(handle.terminal(), "hi");
    sim.shutdown();
}

#[test]
fn machine_fault_on_illegal_address() {
    let mut sim = Simulator::default();
    sim.init_vectors(64, 60);
    sim.load_rom_at("HLT\n", 60).unwrap();

    // Build a pointer word of -1 and follow it indirectly.
    let src = "
AIR 0,1
SIR 0,2
STR 0,0,20
LDR 1,0,20,1
HLT
";
    sim.load_rom_at(src, USER).unwrap();
    sim.execute(ExecMode::Continue);

    sim.drain_writes();
    // The faulting instruction's PC and MSR image were saved.
    assert_eq!(sim.inspect_memory(4).as_unsigned(), 103);
    assert_eq!(sim.inspect_memory(5).as_unsigned(), 103);
    // MFR records an illegal address, and the handler ran to its HLT.
    assert!(sim.reg(RegId::Mfr).get(0));
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), 24);
    sim.shutdown();
}

#[test]
fn trap_transfers_control_through_the_table() {
    let mut sim = Simulator::default();
    sim.init_vectors(64, 60);
    sim.load_rom_at("HLT\n", 60).unwrap();
    // Trap table entry 2 points at the routine.
    sim.write_memory(70, 66);
    sim.load_rom_at("AIR 1,7\nHLT\n", 70).unwrap();

    sim.load_rom_at("TRAP 2\nHLT\n", USER).unwrap();
    run_until_halt_decoded(&mut sim);

    assert_eq!(sim.reg(RegId::R1).as_unsigned(), 7);
    sim.drain_writes();
    // The return PC was saved for the trap routine.
    assert_eq!(sim.inspect_memory(2).as_unsigned(), 101);
    sim.shutdown();
}

#[test]
fn illegal_trap_code_faults() {
    let mut sim = Simulator::default();
    sim.init_vectors(64, 60);
    sim.load_rom_at("HLT\n", 60).unwrap();

    // Slot 3 of the trap table is empty.
    sim.load_rom_at("TRAP 3\nHLT\n", USER).unwrap();
    sim.execute(ExecMode::Continue);

    assert!(sim.reg(RegId::Mfr).get(1), "MFR did not record the trap fault");
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), 24);
    sim.shutdown();
}

#[test]
fn cache_agrees_with_memory_after_drain() {
    let src = "
AIR 0,17
STR 0,0,200
STR 0,0,201
STR 0,0,500
STR 0,0,1000
HLT
";
    let mut sim = Simulator::default();
    sim.load_rom_at(src, USER).unwrap();
    sim.execute(ExecMode::Continue);
    sim.drain_writes();

    // Every in-flight counter is back to zero and every cached word
    // matches main memory.
    for line in sim.cache().lines() {
        assert_eq!(line.writes(), 0, "line {} still dirty", line.tag());
        for offset in 0..8 {
            let addr = line.tag() + offset;
            assert_eq!(
                sim.cache().read(addr).map(|w| w.as_unsigned()),
                Some(sim.inspect_memory(addr).as_unsigned()),
                "cache and memory disagree at {addr}"
            );
        }
    }
    sim.shutdown();
}

#[test]
fn macro_step_runs_one_instruction() {
    let mut sim = Simulator::default();
    sim.load_rom_at("AIR 0,1\nAIR 0,2\nHLT\n", USER).unwrap();

    sim.execute(ExecMode::MacroStep);
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 1);
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), 101);
    assert_eq!(sim.prog_step(), 0);

    sim.execute(ExecMode::MacroStep);
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 3);
    sim.shutdown();
}

#[test]
fn direct_mode_leaves_the_pc_alone() {
    let mut sim = Simulator::default();
    sim.load_rom_at("HLT\n", USER).unwrap();

    sim.execute(ExecMode::Direct("AIR 0,5".into()));
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 5);
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), USER);

    sim.execute(ExecMode::Direct("AIR 0,6".into()));
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 11);
    assert_eq!(sim.reg(RegId::Pc).as_unsigned(), USER);
    sim.shutdown();
}

#[test]
fn direct_reference_to_address_8_leaves_the_trampoline_alone() {
    let mut sim = Simulator::default();
    sim.load_rom_at("HLT\n", USER).unwrap();
    sim.write_memory(123, 8);

    // A direct (non-indirect) load from address 8 reads the slot without
    // the decoder planting anything over it.
    sim.execute(ExecMode::Direct("LDR 0,0,8".into()));
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 123);

    sim.drain_writes();
    assert_eq!(sim.inspect_memory(8).as_unsigned(), 123);
    sim.shutdown();
}

#[test]
fn shifts_and_rotates_through_the_pipeline() {
    // R0 = 3 << 4 = 48; R1 = rotate right 1 of 1 = top bit.
    let src = "
AIR 0,3
SRC 0,4,1,1
AIR 1,1
RRC 1,1,0,0
HLT
";
    let mut sim = Simulator::default();
    sim.load_rom_at(src, USER).unwrap();

    run_until_halt_decoded(&mut sim);
    assert_eq!(sim.reg(RegId::R0).as_unsigned(), 48);
    assert_eq!(sim.reg(RegId::R1).as_unsigned(), 1 << 17);
    sim.shutdown();
}

#[test]
fn text_preload_is_eot_terminated() {
    let mut sim = Simulator::default();
    let end = sim.load_text("This is a test.", 1000);

    sim.drain_writes();
    assert_eq!(sim.inspect_memory(1000).as_unsigned(), 'T' as u32);
    assert_eq!(sim.inspect_memory(1014).as_unsigned(), '.' as u32);
    assert_eq!(sim.inspect_memory(end).as_unsigned(), EOT);
    sim.shutdown();
}
