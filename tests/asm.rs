use thumbscript::asm::{Assembler, Cond, Label, R0, R1, R2, R4, R7, LR};
use thumbscript::consts::CODE_BASE;
use thumbscript::error::CompileError;
use thumbscript::prelude::*;

fn link_words(mut build: impl FnMut(&mut Assembler)) -> Vec<u16> {
    let mut asm = Assembler::new();
    build(&mut asm);
    let end = asm.writer().tell(false);
    asm.link().expect("link");
    asm.writer().halfwords()[..end].to_vec()
}

#[test]
fn forward_labels_resolve_to_pipeline_adjusted_deltas() {
    let words = link_words(|asm| {
        asm.b(Label(1));
        asm.nop();
        asm.nop();
        asm.label(Label(1));
        asm.nop();
    });
    // Branch at 0, target 3: delta = 3 - (0 + 2) = 1.
    assert_eq!(words[0], 0xE001);
}

#[test]
fn conditional_and_unconditional_ranges_are_checked() {
    let mut asm = Assembler::new();
    asm.b_cond(Cond::Eq, Label(1));
    for _ in 0..200 {
        asm.nop();
    }
    asm.label(Label(1));
    assert!(matches!(asm.link(), Err(CompileError::BranchRange)));
}

#[test]
fn pool_loads_reach_across_the_function() {
    let mut machine = Machine::new();
    let mut asm = Assembler::new();
    asm.load_const(R0, 0xCAFE_F00D);
    asm.bx(LR);
    asm.pool();
    asm.link().unwrap();
    machine.load_code(&asm.writer().to_bytes());
    assert_eq!(machine.call(CODE_BASE | 1, &[]).unwrap(), 0xCAFE_F00D);
}

#[test]
fn chunks_link_independently() {
    let mut machine = Machine::new();
    let mut asm = Assembler::new();

    // Chunk 1: a callee that doubles R0.
    asm.adds(R0, R0, R0);
    asm.bx(LR);
    asm.link().unwrap();

    // Chunk 2: call chunk 1 through a negative-reach BL.
    let callee_bytes = -((asm.writer().tell(true) as i32) * 2);
    asm.push(0x100); // lr
    asm.bind_at(Label(9), callee_bytes);
    asm.bl(Label(9));
    asm.adds_imm(R0, 1);
    asm.pop(0x100); // pc
    asm.link().unwrap();

    machine.load_code(&asm.writer().to_bytes());
    let entry = CODE_BASE + 4; // chunk 2 starts after 2 halfwords
    assert_eq!(machine.call(entry | 1, &[20]).unwrap(), 41);
}

#[test]
fn udf_placeholders_skip_inline_data() {
    let mut machine = Machine::new();
    let mut asm = Assembler::new();
    asm.movs_imm(R0, 1);
    asm.udf(1);
    asm.u32_data(0xDEAD_DEAD);
    asm.adds_imm(R0, 1);
    asm.bx(LR);
    asm.link().unwrap();
    machine.load_code(&asm.writer().to_bytes());
    // Execution hops over the data word and still increments.
    assert_eq!(machine.call(CODE_BASE | 1, &[]).unwrap(), 2);
}

#[test]
fn flag_sequences_compute_boolean_casts() {
    // The != materialization: RSBS/ADCS leaves 1 for nonzero, 0 for
    // zero.
    let ne = |x: u32| {
        let mut machine = Machine::new();
        let mut asm = Assembler::new();
        asm.rsbs(R7, R0);
        asm.adcs(R0, R7);
        asm.bx(LR);
        asm.link().unwrap();
        machine.load_code(&asm.writer().to_bytes());
        machine.call(CODE_BASE | 1, &[x]).unwrap()
    };
    assert_eq!(ne(0), 1); // tag is the failing condition; 0 means ==
    assert_eq!(ne(5), 0);
    assert_eq!(ne(0x8000_0000), 0);
}

#[test]
fn known_immediate_cache_spans_labels_conservatively() {
    let words = link_words(|asm| {
        asm.load_imm(R1, 7, false);
        asm.label(Label(3)); // join point: cached knowledge dropped
        asm.load_imm(R1, 7, false);
        asm.b(Label(3));
    });
    let movs = words.iter().filter(|&&w| w & 0xF800 == 0x2000).count();
    assert_eq!(movs, 2);
}

#[test]
fn writer_chunks_report_relative_and_absolute_positions() {
    let mut asm = Assembler::new();
    asm.nop();
    asm.nop();
    asm.link().unwrap();
    assert_eq!(asm.writer().tell(false), 0);
    assert_eq!(asm.writer().tell(true), 2);
    asm.nop();
    assert_eq!(asm.writer().tell(false), 1);
    assert_eq!(asm.writer().tell(true), 3);
    assert_eq!(asm.tell(), 6);
}

#[test]
fn stm_ldm_move_register_blocks() {
    let mut machine = Machine::new();
    let mut asm = Assembler::new();
    // Store r1,r2 at [r0], reload into r4 and r7, sum into r0.
    asm.stmia(R0, 0b0000_0110);
    asm.subs_imm(R0, 8);
    asm.ldm(R0, 0b1001_0000);
    asm.movs(R1, R4);
    asm.adds(R0, R1, R7);
    asm.bx(LR);
    asm.link().unwrap();
    machine.load_code(&asm.writer().to_bytes());
    let dst = thumbscript::consts::SRAM_BASE + 0x100;
    let r = machine.call(CODE_BASE | 1, &[dst, 30, 12]).unwrap();
    assert_eq!(r, 42);
}

#[test]
fn sign_extension_ops() {
    let run1 = |f: fn(&mut Assembler), x: u32| {
        let mut machine = Machine::new();
        let mut asm = Assembler::new();
        f(&mut asm);
        asm.bx(LR);
        asm.link().unwrap();
        machine.load_code(&asm.writer().to_bytes());
        machine.call(CODE_BASE | 1, &[x]).unwrap()
    };
    assert_eq!(run1(|a| a.sxtb(R0, R0), 0x80), 0xFFFF_FF80);
    assert_eq!(run1(|a| a.sxth(R0, R0), 0x8000), 0xFFFF_8000);
    assert_eq!(run1(|a| a.uxtb(R0, R0), 0x1FF), 0xFF);
    assert_eq!(run1(|a| a.uxth(R0, R0), 0x1_FFFF), 0xFFFF);
    assert_eq!(run1(|a| a.rev(R0, R0), 0x1122_3344), 0x4433_2211);
}

#[test]
fn low_register_constraint_is_enforced() {
    let mut asm = Assembler::new();
    // R4 is fine, LR is not a low register.
    asm.movs(R4, R0);
    asm.movs(R0, LR);
    assert!(asm.has_error());
    assert!(matches!(asm.link(), Err(CompileError::ImmediateRange { .. })));
}

#[test]
fn division_helpers_follow_aapcs_result_registers() {
    let mut machine = Machine::new();
    let mut asm = Assembler::new();
    // quotient in r0, remainder in r1
    asm.load_const(
        R2,
        thumbscript::consts::NATIVE_BASE + (thumbscript::consts::NATIVE_IDIVMOD << 2) | 1,
    );
    asm.blx(R2);
    asm.lsls_imm(R1, R1, 8);
    asm.orrs(R0, R1);
    asm.bx(LR);
    asm.pool();
    asm.link().unwrap();
    machine.load_code(&asm.writer().to_bytes());
    let r = machine.call(CODE_BASE | 1, &[47, 10]).unwrap();
    assert_eq!(r, (7 << 8) | 4);
}
