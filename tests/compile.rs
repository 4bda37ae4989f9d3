use std::cell::RefCell;
use std::io::{Cursor, Read};
use std::rc::Rc;

use quickcheck_macros::quickcheck;

use thumbscript::consts::*;
use thumbscript::error::{CompileError, ExecError};
use thumbscript::prelude::*;

type MemScript = Script<Cursor<Vec<u8>>, Cursor<Vec<u8>>>;

fn compiled(source: &str) -> MemScript {
    let mut script = Script::from_source(source).expect("pipeline");
    script.compile().expect("compile");
    script
}

/// Compile, run program start, then call `main`.
fn run_main(source: &str) -> u32 {
    let mut script = compiled(source);
    script.run().expect("run");
    script.call("main", &[]).expect("main")
}

fn halfwords(script: &mut MemScript) -> Vec<u16> {
    script
        .image()
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

#[test]
fn fold_constant_expression() {
    let mut script = compiled("function main(){ return 2 + 3 * 4; }");
    script.run().unwrap();
    assert_eq!(script.call("main", &[]).unwrap(), 14);
    // The multiply folded away: no MULS anywhere in the image.
    let muls = halfwords(&mut script)
        .iter()
        .filter(|&&w| w & 0xFFC0 == 0x4340)
        .count();
    assert_eq!(muls, 0);
}

#[test]
fn pure_function_folds_at_call_site() {
    let src = "function sq(x){ return x * x; }
               function main(){ const y = sq(5); return y; }";
    let mut script = compiled(src);
    script.run().unwrap();
    assert_eq!(script.call("main", &[]).unwrap(), 25);
    // sq stays callable for non-constant callers.
    assert_eq!(script.call("sq", &[9]).unwrap(), 81);
    // main never actually calls sq: no BLX and no BL pair after the
    // loader (which itself has neither).
    let words = halfwords(&mut script);
    let blx = words.iter().filter(|&&w| w & 0xFF87 == 0x4780).count();
    assert_eq!(blx, 0);
}

#[test]
fn for_of_over_literal_array() {
    let src = "const a = [10, 20, 30];
               function main(){ var s = 0; for(var v of a) s += v; return s; }";
    let mut script = compiled(src);
    script.run().unwrap();
    assert_eq!(script.call("main", &[]).unwrap(), 60);
    // The loop iterates with an LDM on the cursor register.
    let ldm = halfwords(&mut script)
        .iter()
        .filter(|&&w| w & 0xF800 == 0xC800)
        .count();
    assert!(ldm >= 1);
}

#[test]
fn length_of_literal_array_folds() {
    let src = "const a = [7, 8, 9];
               const k = length(a);
               function main(){ return k; }";
    // `const k` only compiles because length() folded to a KCTV.
    assert_eq!(run_main(src), 3);
}

#[test]
fn const_init_must_be_compile_time() {
    let src = "function main(p){\nconst x = p; }";
    let mut script = Script::from_source(src).unwrap();
    let err = script.compile().unwrap_err();
    assert!(matches!(err.error, CompileError::ConstInitNotKnown));
    assert_eq!(err.line, 2);
}

#[test]
fn global_initializers_apply_at_start() {
    let src = "var g = 123;
               var h = 0x10000;
               function main(){ return g + h; }";
    assert_eq!(run_main(src), 123 + 0x10000);
}

#[test]
fn two_phase_allows_forward_calls() {
    let src = "function main(){ return helper(4); }
               function helper(x){ return x + 1; }";
    assert_eq!(run_main(src), 5);
}

#[test]
fn recursion_and_comparisons() {
    let src = "function fact(n){ if(n < 2) return 1; return n * fact(n - 1); }
               function main(){ return fact(6); }";
    assert_eq!(run_main(src), 720);
}

#[test]
fn arguments_pass_through_registers() {
    let src = "function add3(a, b, c){ return a + b + c; }
               function main(){ return add3(100, 20, 3); }";
    let mut script = compiled(src);
    script.run().unwrap();
    assert_eq!(script.call("add3", &[1, 2, 3]).unwrap(), 6);
    assert_eq!(script.call("main", &[]).unwrap(), 123);
}

#[test]
fn runtime_binary_operators() {
    let cases: &[(&str, fn(i32, i32) -> i32)] = &[
        ("a + b", |a, b| a.wrapping_add(b)),
        ("a - b", |a, b| a.wrapping_sub(b)),
        ("a * b", |a, b| a.wrapping_mul(b)),
        ("a & b", |a, b| a & b),
        ("a | b", |a, b| a | b),
        ("a ^ b", |a, b| a ^ b),
    ];
    for (expr, expected) in cases {
        let src = format!("function f(a, b){{ return {expr}; }}");
        let mut script = compiled(&src);
        script.run().unwrap();
        for (a, b) in [(13, 5), (-7i32 as u32 as i32, 3), (0, 0), (1 << 20, 255)] {
            let got = script.call("f", &[a as u32, b as u32]).unwrap();
            assert_eq!(got as i32, expected(a, b), "{expr} with {a}, {b}");
        }
    }
}

#[test]
fn runtime_division_uses_helper() {
    let src = "function div(a, b){ return a / b; }
               function rem(a, b){ return a % b; }";
    let mut script = compiled(src);
    script.run().unwrap();
    for (a, b) in [(17, 5), (-17i32, 5), (17, -5i32), (0, 9), (255, 3)] {
        let q = script.call("div", &[a as u32, b as u32]).unwrap();
        let r = script.call("rem", &[a as u32, b as u32]).unwrap();
        assert_eq!(q as i32, (a as i32).wrapping_div(b), "{a}/{b}");
        assert_eq!(r as i32, (a as i32).wrapping_rem(b), "{a}%{b}");
    }
}

#[test]
fn shifts_match_signed_and_unsigned_semantics() {
    let src = "function sar(a){ return a >> 4; }
               function shr(a){ return a >>> 4; }
               function shl(a){ return a << 4; }";
    let mut script = compiled(src);
    script.run().unwrap();
    let v = -256i32 as u32;
    assert_eq!(script.call("sar", &[v]).unwrap(), (-16i32) as u32);
    assert_eq!(script.call("shr", &[v]).unwrap(), v >> 4);
    assert_eq!(script.call("shl", &[3]).unwrap(), 48);
}

#[test]
fn compound_assignment_and_increments() {
    let src = "function f(x){ var t = x; t += 5; t *= 2; t -= 1; t++; ++t; t--; return t; }
               function main(){ return f(10); }";
    assert_eq!(run_main(src), (10 + 5) * 2 - 1 + 1 + 1 - 1);
}

#[test]
fn while_and_do_loops() {
    let src = "function countdown(n){ var s = 0; while(n > 0){ s += n; n -= 1; } return s; }
               function once(){ var i = 0; do { i++; } while(i < 3); return i; }";
    let mut script = compiled(src);
    script.run().unwrap();
    assert_eq!(script.call("countdown", &[10]).unwrap(), 55);
    assert_eq!(script.call("once", &[]).unwrap(), 3);
}

#[test]
fn classic_for_with_break_and_continue() {
    let src = "function f(){
                 var s = 0;
                 for(var i = 0; i < 10; i++){
                   if(i == 3) continue;
                   if(i == 7) break;
                   s += i;
                 }
                 return s;
               }
               function main(){ return f(); }";
    // 0+1+2+4+5+6
    assert_eq!(run_main(src), 18);
}

#[test]
fn loops_over_runtime_arrays() {
    // The array pointer is a runtime value here, so both loops read
    // the bound from the header at run time.
    let src = "function vals(){
                 var a = Array(3);
                 a[0] = 4; a[1] = 5; a[2] = 6;
                 var s = 0;
                 for(var v of a) s += v;
                 return s;
               }
               function idx(){
                 var a = Array(3);
                 var s = 0;
                 for(var i in a) s += i;
                 return s;
               }";
    let mut script = compiled(src);
    script.run().unwrap();
    assert_eq!(script.call("vals", &[]).unwrap(), 15);
    assert_eq!(script.call("idx", &[]).unwrap(), 3);
}

#[test]
fn for_in_yields_indices() {
    let src = "const a = [5, 5, 5, 5];
               function main(){ var s = 0; for(var i in a) s += i; return s; }";
    assert_eq!(run_main(src), 0 + 1 + 2 + 3);
}

#[test]
fn array_indexing_reads_and_writes() {
    let src = "function main(){
                 var a = Array(4);
                 a[0] = 11;
                 a[1] = 22;
                 a[2] = a[0] + a[1];
                 a[3] = a[2];
                 a[3]++;
                 return a[2] + a[3];
               }";
    assert_eq!(run_main(src), 33 + 34);
}

#[test]
fn array_length_at_runtime() {
    let src = "function main(){ var a = Array(6); return length(a); }";
    assert_eq!(run_main(src), 6);
}

#[test]
fn intrinsics_abs_min_max() {
    let src = "function f(a, b){ return abs(a) + min(a, b) + max(a, b); }
               function folded(){ return abs(0 - 9) + min(2, 3) + max(2, 3); }";
    let mut script = compiled(src);
    script.run().unwrap();
    let a = -4i32 as u32;
    assert_eq!(script.call("f", &[a, 10]).unwrap() as i32, 4 + -4 + 10);
    assert_eq!(script.call("folded", &[]).unwrap(), 9 + 2 + 3);
}

#[test]
fn peek_and_poke_bytes() {
    let src = "function main(){
                 var a = Array(2);
                 poke(a, 65);
                 poke(a, 1, 66);
                 return peek(a) + peek(a, 1);
               }";
    assert_eq!(run_main(src), 65 + 66);
}

#[test]
fn pressed_reads_the_input_page() {
    let src = "function a(){ return pressed(\"A\"); }
               function left(){ return pressed(\"LEFT\"); }";
    let mut script = compiled(src);
    script.run().unwrap();
    assert_eq!(script.call("a", &[]).unwrap(), 0);
    script.machine_mut().set_input(9, 1);
    script.machine_mut().set_input(25, 1);
    assert_eq!(script.call("a", &[]).unwrap(), 1);
    assert_eq!(script.call("left", &[]).unwrap(), 1);
}

#[test]
fn natives_receive_arguments_and_return() {
    let mut script = Script::from_source(
        "var seen = 0;
         function main(){ seen = probe(40, 2); return seen; }",
    )
    .unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    script
        .bind("probe", move |_, args| {
            sink.borrow_mut().push((args[0], args[1]));
            Ok(args[0] + args[1])
        })
        .unwrap();
    script.compile().unwrap();
    script.run().unwrap();
    assert_eq!(script.call("main", &[]).unwrap(), 42);
    assert_eq!(log.borrow().as_slice(), &[(40, 2)]);
}

#[test]
fn pure_natives_fold_at_compile_time() {
    let mut script = Script::from_source(
        "const x = double(21);
         function main(){ return x; }",
    )
    .unwrap();
    let calls = Rc::new(RefCell::new(0u32));
    let counter = calls.clone();
    script
        .bind_pure("double", move |_, args| {
            *counter.borrow_mut() += 1;
            Ok(args[0] * 2)
        })
        .unwrap();
    script.compile().unwrap();
    // Folded during compilation, exactly once.
    assert_eq!(*calls.borrow(), 1);
    script.run().unwrap();
    assert_eq!(script.call("main", &[]).unwrap(), 42);
    assert_eq!(*calls.borrow(), 1);
}

#[test]
fn string_literals_intern_into_the_resource_table() {
    let src = "function main(){ return say(\"hi\"); }";
    let mut script = Script::from_source(src).unwrap();
    script.bind("say", |_, args| Ok(args[0])).unwrap();
    script.compile().unwrap();
    script.run().unwrap();
    let hash = script.call("main", &[]).unwrap();

    // The fingerprint accumulates from the string seed.
    let expected = {
        let mut acc = 5381u32.wrapping_mul(31).wrapping_add(u32::from(b'"'));
        for b in b"hi" {
            acc = acc.wrapping_mul(31).wrapping_add(u32::from(*b));
        }
        acc
    };
    assert_eq!(hash, expected);

    // And the body is retrievable by that fingerprint.
    let offset = script.resources().find(hash).unwrap();
    assert_ne!(offset, 0);
    let file = script.resources().at(offset).unwrap();
    let mut body = [0u8; 3];
    file.read_exact(&mut body).unwrap();
    assert_eq!(&body, b"hi\0");
}

#[test]
fn duplicate_strings_intern_once() {
    let src = "function f(){ return tag(\"x\"); }
               function g(){ return tag(\"x\"); }";
    let mut script = Script::from_source(src).unwrap();
    script.bind("tag", |_, args| Ok(args[0])).unwrap();
    script.compile().unwrap();
    script.run().unwrap();
    assert_eq!(script.call("f", &[]).unwrap(), script.call("g", &[]).unwrap());
}

#[test]
fn dead_if_arms_are_skipped() {
    let src = "const DEBUG = 0;
               function main(){
                 var v = 1;
                 if(DEBUG){ v = trap(); }
                 if(1){ v += 10; } else { v = trap(); }
                 return v;
               }";
    let mut script = Script::from_source(src).unwrap();
    // Never bound: reaching it would be an unbound-native fault, and
    // referencing it in live code would emit a load of an undefined
    // global.
    script.bind("trap", |_, _| Err(ExecError::OutOfMemory { words: 0 })).unwrap();
    script.compile().unwrap();
    script.run().unwrap();
    assert_eq!(script.call("main", &[]).unwrap(), 11);
}

#[test]
fn logical_operators() {
    let src = "function f(a, b){ return (a && b) + (a || b); }
               function main(){ return f(0, 7) + f(3, 0); }";
    // (0&&7)+(0||7) = 0 + 7; (3&&0)+(3||0) = 0 + 3.
    // && lowers through multiply, || through bitwise or.
    assert_eq!(run_main(src), 7 + 3);
}

#[test]
fn unary_operators() {
    let src = "function f(x){ return -x + ~x + !x; }
               function main(){ return f(5); }";
    assert_eq!(run_main(src) as i32, -5 + !5 + 0);
}

#[test]
fn crash_recovers_source_line() {
    let src = "function main(){\nreturn peek(0);\n}";
    let mut script = compiled(src);
    script.run().unwrap();
    let err = script.call("main", &[]).unwrap_err();
    let pc = err.fault_pc().expect("fault pc");
    let line = script.recover_line(pc).expect("line");
    assert_eq!(line, 2);
}

#[test]
fn debugger_statement_breaks() {
    let src = "function main(){ debugger; return 1; }";
    let mut script = compiled(src);
    script.run().unwrap();
    let err = script.call("main", &[]).unwrap_err();
    assert!(matches!(err, ExecError::Breakpoint { .. }));
}

#[test]
fn break_outside_loop_is_an_error() {
    let mut script = Script::from_source("function main(){ break; }").unwrap();
    let err = script.compile().unwrap_err();
    assert!(matches!(err.error, CompileError::BreakOutsideLoop));
}

#[test]
fn return_outside_function_is_an_error() {
    let mut script = Script::from_source("return 1;").unwrap();
    let err = script.compile().unwrap_err();
    assert!(matches!(err.error, CompileError::ReturnOutsideFunction));
}

#[test]
fn const_redeclaration_is_an_error() {
    let mut script = Script::from_source("const k = 1; const k = 2;").unwrap();
    let err = script.compile().unwrap_err();
    assert!(matches!(err.error, CompileError::ConstRedeclaration));
}

#[test]
fn locals_are_scoped_per_function() {
    let src = "var shared = 5;
               function a(){ var t = 1; return t + shared; }
               function b(){ var t = 2; return t + shared; }
               function main(){ return a() * 100 + b(); }";
    // Each function sees its own `t`; both see the global.
    assert_eq!(run_main(src), 6 * 100 + 7);
}

#[test]
fn function_redefinition_is_an_error() {
    let mut script =
        Script::from_source("function f(){ return 1; } function f(){ return 2; }").unwrap();
    let err = script.compile().unwrap_err();
    assert!(matches!(err.error, CompileError::FunctionRedefinition));
}

#[test]
fn division_by_literal_zero_is_an_error() {
    let mut script = Script::from_source("function f(x){ return x / 0; }").unwrap();
    let err = script.compile().unwrap_err();
    assert!(matches!(err.error, CompileError::DivisionByZero));
}

#[test]
fn run_enters_only_once() {
    let src = "var n = 0;
               function main(){ n += 1; return n; }";
    let mut script = compiled(src);
    script.run().unwrap();
    script.run().unwrap();
    assert_eq!(script.call("main", &[]).unwrap(), 1);
}

#[quickcheck]
fn qc_fold_matches_runtime_arithmetic(a: i32, b: i32) -> bool {
    let src = format!(
        "function f(x, y){{ return x * 3 + y - (x ^ y); }}
         function main(){{ return ({a}) * 3 + ({b}) - (({a}) ^ ({b})); }}"
    );
    let mut script = compiled(&src);
    script.run().unwrap();
    let folded = script.call("main", &[]).unwrap();
    let runtime = script.call("f", &[a as u32, b as u32]).unwrap();
    folded == runtime
}

#[quickcheck]
fn qc_power_of_two_division_matches_helper(x: i32, k: u8) -> bool {
    let k = u32::from(k % 10) + 1;
    let d = 1i32 << k;
    let src = format!(
        "function fast(v){{ return v / {d}; }}
         function fastrem(v){{ return v % {d}; }}
         function slow(v, w){{ return v / w; }}
         function slowrem(v, w){{ return v % w; }}"
    );
    let mut script = compiled(&src);
    script.run().unwrap();
    let args = [x as u32];
    let both = [x as u32, d as u32];
    script.call("fast", &args).unwrap() == script.call("slow", &both).unwrap()
        && script.call("fastrem", &args).unwrap() == script.call("slowrem", &both).unwrap()
}

#[quickcheck]
fn qc_unsigned_shift_is_unsigned(x: u32) -> bool {
    let src = "function f(v){ return v >>> 1; }";
    let mut script = compiled(src);
    script.run().unwrap();
    script.call("f", &[x]).unwrap() == x >> 1
}

#[test]
fn code_buffer_overflow_is_reported() {
    // Enough statements to blow through 2 KiB of emitted code.
    let mut src = String::from("var x = 0;\n");
    for i in 0..400 {
        src.push_str(&format!("x = x + peek({});\n", 0x2000_4000u32 + i));
    }
    let mut script = Script::from_source(&src).unwrap();
    let err = script.compile().unwrap_err();
    assert!(err.error.is_codegen(), "got {:?}", err.error);
}

#[test]
fn a2l_lines_do_not_decrease_over_straight_line_code() {
    // Global-only code compiles in one forward pass, so recovered
    // lines are non-decreasing over increasing code offsets.
    let src = "var a = 0;\nvar b = 0;\na = peek(0x20004000);\nb = peek(0x20004100);\na = a + b;\n";
    let mut script = compiled(src);
    let mut last = 0u16;
    let mut decreased = false;
    for offset in (0..CODE_SIZE).step_by(2) {
        if let Some(line) = script.recover_line(CODE_BASE + offset) {
            if line < last {
                decreased = true;
            }
            last = line;
        }
    }
    assert!(!decreased, "a2l lines regressed");
}
