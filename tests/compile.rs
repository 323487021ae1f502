//! End-to-end compilation tests: source text in, assembly text out.
//!
//! The emitted assembly is inspected structurally rather than executed;
//! the assembler, linker and emulator live outside this repository.

use rucow::{Options, compile_source};
use std::fs;
use std::path::PathBuf;

fn compile(source: &str) -> String {
  compile_source(source, "test.cow", &Options::default()).expect("compilation failed")
}

fn compile_opt(source: &str) -> String {
  let options = Options {
    optimize: true,
    ..Options::default()
  };
  compile_source(source, "test.cow", &options).expect("compilation failed")
}

/// A scratch include directory holding a header that declares the
/// runtime's print surface, the way cowgol.coh does.
fn runtime_header_dir() -> PathBuf {
  let dir = std::env::temp_dir().join("rucow_test_headers");
  fs::create_dir_all(&dir).expect("header dir");
  fs::write(
    dir.join("cowgol.coh"),
    "@decl sub print(s: [uint8]) @extern(\"print\");\n\
     @decl sub print_char(c: uint8) @extern(\"print_char\");\n\
     @decl sub print_dec16(n: uint16) @extern(\"print_dec16\");\n\
     @decl sub print_nl() @extern(\"print_nl\");\n",
  )
  .expect("write header");
  dir
}

#[test]
fn hello_world_emits_call_and_string() {
  let options = Options {
    include_dirs: vec![runtime_header_dir()],
    ..Options::default()
  };
  let asm = compile_source(
    "include \"cowgol.coh\";\nprint(\"Hello\\n\");",
    "hello.cow",
    &options,
  )
  .expect("compilation failed");

  // The string is addressed, the runtime routine called, and the bytes
  // of "Hello\n" land null-terminated in the data section.
  assert!(asm.contains("CALL\tprint"));
  assert!(asm.contains("72,101,108,108,111,10,0"));
  assert!(asm.contains("JMP\t_main"));
  assert!(asm.contains("\tEND"));
}

#[test]
fn arithmetic_folds_when_optimized() {
  let source = "\
    var a: uint16; var b: uint16;\n\
    var r1: uint16; var r2: uint16; var r3: uint16;\n\
    var r4: uint16; var r5: uint16;\n\
    a := 10; b := 3;\n\
    r1 := a + b; r2 := a - b; r3 := a * b;\n\
    r4 := a / b; r5 := a % b;\n";

  let optimized = compile_opt(source);
  for value in ["H,13", "H,7", "H,30", "H,3", "H,1"] {
    assert!(
      optimized.contains(value),
      "missing folded constant {value} in:\n{optimized}"
    );
  }
  assert!(!optimized.contains("_mul16"));

  let plain = compile(source);
  assert!(plain.contains("_mul16"));
  assert!(plain.contains("_div16"));
  assert!(plain.contains("_mod16"));
}

#[test]
fn summing_loop_keeps_counting_up() {
  // The body reads the counter, so loop reversal must not fire.
  let asm = compile_opt(
    "var s: uint8; var i: uint8;\n\
     s := 0; i := 0;\n\
     while i < 10 loop s := s + i; i := i + 1; end loop;\n",
  );
  assert!(asm.contains("CPI\t10"), "count-up compare missing:\n{asm}");
  assert!(!asm.contains("DCR"), "reversal fired on a counter the body reads");
}

#[test]
fn counting_loop_reverses_to_a_decrement() {
  // The body walks a pointer and never reads the counter; reversal must
  // rewrite it to count down and the decrement must reach the stream.
  let asm = compile_opt(
    "record Buf is bytes: uint8[10]; end record;\n\
     var buf: Buf;\n\
     var p: [uint8];\n\
     var i: uint8;\n\
     p := &buf.bytes as [uint8];\n\
     i := 0;\n\
     while i < 10 loop [p] := 0; p := @next p; i := i + 1; end loop;\n",
  );
  assert!(asm.contains("DCR"), "no decrement in reversed loop:\n{asm}");

  // Unoptimized, the loop still counts up.
  let plain = compile(
    "record Buf is bytes: uint8[10]; end record;\n\
     var buf: Buf;\n\
     var p: [uint8];\n\
     var i: uint8;\n\
     p := &buf.bytes as [uint8];\n\
     i := 0;\n\
     while i < 10 loop [p] := 0; p := @next p; i := i + 1; end loop;\n",
  );
  assert!(!plain.contains("DCR"));
}

#[test]
fn record_inheritance_offsets_reach_codegen() {
  let asm = compile(
    "record Point is x: int16; y: int16; end record;\n\
     record Point3D: Point is z: int16; end record;\n\
     var p3: Point3D;\n\
     var v: int16;\n\
     p3.z := 7;\n\
     v := p3.y;\n",
  );
  // z sits after the inherited fields at offset 4; the peephole pass
  // turns y's offset of 2 into a pair of increments.
  assert!(asm.contains("D,4"), "offset of z missing:\n{asm}");
  assert!(asm.contains("INX\tH"), "offset of y missing:\n{asm}");
  // The record reserves base plus derived storage.
  assert!(asm.contains("v_p3:\tDS\t6"));
}

#[test]
fn forward_declaration_compiles_and_recursion_does_not() {
  let asm = compile(
    "@decl sub Later(n: uint8);\n\
     sub Caller(n: uint8) is Later(n); end sub;\n\
     @impl sub Later is end sub;\n\
     Caller(1);\n",
  );
  assert!(asm.contains("CALL\tLater"));

  let result = compile_source(
    "@decl sub A();\n\
     sub B() is A(); end sub;\n\
     @impl sub A is B(); end sub;\n",
    "rec.cow",
    &Options::default(),
  );
  assert!(result.is_err(), "mutual recursion was accepted");
}

#[test]
fn interface_call_goes_through_callhl() {
  let asm = compile(
    "interface Handler(code: uint8);\n\
     sub OnByte implements Handler is end sub;\n\
     var h: Handler;\n\
     h := OnByte;\n\
     h(7);\n",
  );
  // The variable holds the routine's address; the call is indirect.
  assert!(asm.contains("H,OnByte"));
  assert!(asm.contains("CALL\t_callhl"));
}

#[test]
fn inline_asm_passes_through_with_mangled_names() {
  let asm = compile(
    "var status: uint8;\n\
     const READY := 3;\n\
     @asm \"LDA\", status;\n\
     @asm \"CPI\", READY;\n",
  );
  assert!(asm.contains("LDA\tv_status"));
  assert!(asm.contains("CPI\t3"));
}

#[test]
fn case_statement_dispatches_and_falls_to_else() {
  let asm = compile(
    "var x: uint8; var y: uint8;\n\
     case x is\n\
     when 1, 2: y := 1;\n\
     when 9: y := 2;\n\
     when else: y := 0;\n\
     end case;\n",
  );
  // Multi-value arms test each alternative against the scrutinee.
  assert!(asm.contains("CPI\t1"));
  assert!(asm.contains("CPI\t2"));
  assert!(asm.contains("CPI\t9"));
}

#[test]
fn static_data_and_bss_are_separated() {
  let asm = compile(
    "var table: uint8[4] := { 1, 2, 3, 4 };\n\
     var greeting: [uint8] := \"hi\";\n\
     var scratch: uint16;\n",
  );
  assert!(asm.contains("v_table:\tDB\t1,2,3,4"));
  // The pointer points at the interned string, which carries its
  // terminator.
  assert!(asm.contains("104,105,0"));
  assert!(asm.contains("v_scratch:\tDS\t2"));
}

#[test]
fn locals_overlay_the_workspace() {
  let asm = compile(
    "sub First is var a: uint16; a := 1; end sub;\n\
     sub Second is var b: uint16; b := 2; end sub;\n\
     First();\n\
     Second();\n",
  );
  // Neither sub calls the other, so both frames start at offset zero.
  assert!(asm.contains("v_First_a\tEQU\t_workspace+0"));
  assert!(asm.contains("v_Second_b\tEQU\t_workspace+0"));
}

#[test]
fn nested_calls_stack_their_frames() {
  let asm = compile(
    "sub Inner(n: uint16) is end sub;\n\
     sub Outer is var a: uint16; Inner(a); end sub;\n\
     Outer();\n",
  );
  // Outer's frame occupies the first two bytes; Inner's parameter must
  // come after.
  assert!(asm.contains("v_Outer_a\tEQU\t_workspace+0"));
  assert!(asm.contains("v_Inner_n\tEQU\t_workspace+2"));
}

#[test]
fn single_call_site_is_inlined() {
  let asm = compile(
    "var g: uint8;\n\
     sub Bump is g := g + 1; end sub;\n\
     Bump();\n",
  );
  // The body lands in the main code; no CALL and no standalone label.
  assert!(!asm.contains("CALL\tBump"));
  assert!(!asm.contains("Bump:"));
}

#[test]
fn multi_return_destructuring_reads_both_slots() {
  let asm = compile(
    "sub Split(w: uint16): (hi: uint8, lo: uint8) is\n\
     hi := (w >> 8) as uint8; lo := w as uint8;\n\
     end sub;\n\
     var a: uint8; var b: uint8;\n\
     a, b := Split(0x1234);\n",
  );
  assert!(asm.contains("LDA\tv_Split_hi"));
  assert!(asm.contains("LDA\tv_Split_lo"));
}

#[test]
fn optimization_preserves_program_shape() {
  // Both configurations must produce a complete program with the same
  // externally visible calls in the same order.
  let source = "\
    @decl sub print_dec16(n: uint16) @extern(\"print_dec16\");\n\
    var a: uint16; var b: uint16;\n\
    a := 6; b := 7;\n\
    print_dec16(a * b);\n\
    print_dec16(a + b);\n";
  let plain = compile(source);
  let optimized = compile_opt(source);

  let calls = |asm: &str| {
    asm
      .lines()
      .filter(|l| l.contains("CALL\tprint_dec16"))
      .count()
  };
  assert_eq!(calls(&plain), 2);
  assert_eq!(calls(&optimized), 2);
  // The optimized build folds the product.
  assert!(optimized.contains("H,42"));
}

#[test]
fn peephole_output_is_a_fixpoint() {
  let source = "\
    var a: uint8[4];\n\
    var i: uint8;\n\
    i := 2;\n\
    a[i] := 1;\n\
    i := i + 1;\n";
  let first = compile(source);
  // Compiling the same program again goes through the same peephole
  // pass; the output must be stable across runs.
  let second = compile(source);
  assert_eq!(first, second);
}

#[test]
fn include_splices_headers() {
  let dir = runtime_header_dir();
  let options = Options {
    include_dirs: vec![dir],
    ..Options::default()
  };
  let asm = compile_source(
    "include \"cowgol.coh\";\nprint_nl();\n",
    "t.cow",
    &options,
  )
  .expect("compilation failed");
  assert!(asm.contains("CALL\tprint_nl"));
}

#[test]
fn errors_abort_before_code_generation() {
  let result = compile_source(
    "var a: uint8; var b: uint16; a := b;",
    "t.cow",
    &Options::default(),
  );
  let diagnostics = result.expect_err("type mismatch must fail");
  assert!(!diagnostics.has_internal());
  let rendered = format!("{diagnostics}");
  assert!(rendered.contains("type error"));
}
