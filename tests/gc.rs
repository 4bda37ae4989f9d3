use std::io::Cursor;

use thumbscript::prelude::*;

type MemScript = Script<Cursor<Vec<u8>>, Cursor<Vec<u8>>>;

fn compiled(source: &str) -> MemScript {
    let mut script = Script::from_source(source).expect("pipeline");
    script.compile().expect("compile");
    script.run().expect("run");
    script
}

#[test]
fn collection_frees_dropped_arrays_and_keeps_reachable_ones() {
    let src = "var a = 0; var b = 0;
               function setup(){
                 a = Array(4);
                 b = Array(4);
                 a[0] = 11; a[1] = 12;
                 b[0] = 22;
               }
               function dropb(){ b = 0; }
               function big(){ return Array(64); }
               function geta(){ return a; }";
    let mut script = compiled(src);

    script.call("setup", &[]).unwrap();
    let a = script.call("geta", &[]).unwrap();
    assert_eq!(script.machine().live_arrays().len(), 2);

    script.call("dropb", &[]).unwrap();
    // Allocating with the lock released runs a collection first.
    let c = script.call("big", &[]).unwrap();

    let live = script.machine().live_arrays();
    assert!(live.contains(&a), "a must survive");
    assert!(live.contains(&c), "c just got allocated");
    assert_eq!(live.len(), 2, "b must be swept");

    // a kept its contents; c has the requested length.
    assert_eq!(script.machine().read_u32(a).unwrap(), 11);
    assert_eq!(script.machine().read_u32(a + 4).unwrap(), 12);
    assert_eq!(script.machine().read_u32(c - 4).unwrap() & 0xFFFF, 64);
}

#[test]
fn arrays_reachable_through_other_arrays_survive() {
    let src = "var outer = 0;
               function setup(){
                 var inner = Array(2);
                 inner[0] = 7;
                 outer = Array(2);
                 outer[0] = inner;
               }
               function churn(){ return Array(32); }
               function read(){ var i = outer[0]; return i[0]; }";
    let mut script = compiled(src);
    script.call("setup", &[]).unwrap();
    script.call("churn", &[]).unwrap();
    script.call("churn", &[]).unwrap();
    assert_eq!(script.call("read", &[]).unwrap(), 7);
}

#[test]
fn stack_words_pin_arrays_during_calls() {
    // `keep` holds the only reference to its array in a local while
    // the allocating call collects; the stack scan must retain it.
    let src = "function keep(){
                 var t = Array(3);
                 t[0] = 99;
                 churn();
                 return t[0];
               }
               function churn(){ return Array(16); }";
    let mut script = compiled(src);
    assert_eq!(script.call("keep", &[]).unwrap(), 99);
}

#[test]
fn literal_arrays_are_pinned_roots() {
    // Nothing at runtime references the literal except the folded
    // pointer constant, which lives in code, not in scanned memory.
    // The root pin keeps it alive through collections.
    let src = "const tab = [1, 2, 3];
               function churn(){ return Array(16); }
               function read(){ return tab[1]; }";
    let mut script = compiled(src);
    script.call("churn", &[]).unwrap();
    script.call("churn", &[]).unwrap();
    assert_eq!(script.call("read", &[]).unwrap(), 2);
}

#[test]
fn out_of_memory_surfaces_as_a_fault() {
    let src = "function hog(){ return Array(8000); }";
    let mut script = compiled(src);
    let err = script.call("hog", &[]).unwrap_err();
    assert!(matches!(err, thumbscript::error::ExecError::OutOfMemory { .. }));
}
