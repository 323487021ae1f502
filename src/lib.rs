//! Crate root: wires together the compilation pipeline.
//!
//! The stages are intentionally small and composable so they can be
//! evolved independently:
//! - `preprocessor` resolves `include` directives into one token stream.
//! - `tokenizer` performs lexical analysis for a single file.
//! - `parser` owns all syntactic knowledge and returns the program AST.
//! - `sema` resolves names, checks types and computes layouts.
//! - `optimizer` runs the AST transformation passes to a fixpoint.
//! - `codegen` lowers the AST into an 8080 instruction stream.
//! - `peephole` rewrites that stream locally before rendering.
//! - `error` centralises diagnostics shared by the other modules.
//!
//! Data flows strictly forward. The first error in a stage stops the
//! pipeline; the semantic analyzer is the only stage that accumulates
//! several diagnostics before doing so.

pub mod error;
pub mod optimizer;
pub mod parser;
pub mod preprocessor;
pub mod sema;
pub mod tokenizer;
pub mod ty;

pub mod codegen;
mod peephole;

pub use error::{CompileError, CompileResult, Diagnostics};

use std::path::{Path, PathBuf};

/// Knobs exposed by the driver.
#[derive(Debug, Clone, Default)]
pub struct Options {
  pub include_dirs: Vec<PathBuf>,
  pub optimize: bool,
  /// Emit the optimizer's change log through `tracing`.
  pub debug_opt: bool,
}

/// Compile a source file into 8080 assembly text.
pub fn compile_file(input: &Path, options: &Options) -> Result<String, Diagnostics> {
  let tokens = preprocessor::preprocess(input, &options.include_dirs)?;
  compile_tokens(tokens, options)
}

/// Compile in-memory source text; includes still resolve against the
/// configured search path.
pub fn compile_source(
  source: &str,
  name: &str,
  options: &Options,
) -> Result<String, Diagnostics> {
  let tokens = preprocessor::preprocess_source(source, name, &options.include_dirs)?;
  compile_tokens(tokens, options)
}

fn compile_tokens(
  tokens: Vec<tokenizer::Token>,
  options: &Options,
) -> Result<String, Diagnostics> {
  let mut program = parser::parse(tokens)?;
  let mut analysis = sema::analyze(&mut program).map_err(Diagnostics::from)?;

  if options.optimize {
    optimizer::optimize(&mut program, &mut analysis);
  }

  let lines = codegen::generate(&program, &analysis)?;
  let lines = peephole::optimize(lines);
  Ok(codegen::render(&lines))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pipeline_compiles_a_minimal_program() {
    let asm = compile_source("var x: uint8; x := 1;", "t.cow", &Options::default())
      .expect("compile");
    assert!(asm.contains("_main"));
    assert!(asm.contains("END"));
  }

  #[test]
  fn diagnostics_carry_positions() {
    let result = compile_source("var x: uint8;\nx := y;", "t.cow", &Options::default());
    let diagnostics = result.expect_err("undeclared identifier");
    let error = diagnostics.iter().next().expect("one diagnostic");
    assert_eq!(error.pos().line, 2);
    assert!(!diagnostics.has_internal());
  }
}
