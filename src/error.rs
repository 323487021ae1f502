//! Shared error utilities used across the compilation pipeline.
//!
//! Every diagnostic carries a [`Position`] naming the file, line and column
//! it was raised at. User-facing errors and internal invariant failures
//! travel through the same enum but are distinguishable, so a test harness
//! can assert that a rejected program produced a user error rather than a
//! compiler bug.

use snafu::Snafu;
use std::fmt::{self, Display};
use std::rc::Rc;

pub type CompileResult<T> = Result<T, CompileError>;

/// A line/column location in a named source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
  pub file: Rc<str>,
  pub line: u32,
  pub column: u32,
}

impl Position {
  pub fn new(file: Rc<str>, line: u32, column: u32) -> Self {
    Self { file, line, column }
  }

  /// Placeholder position for objects synthesized by the compiler itself.
  pub fn builtin() -> Self {
    Self {
      file: Rc::from("<builtin>"),
      line: 0,
      column: 0,
    }
  }
}

impl Display for Position {
  fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(fmt, "{}:{}:{}", self.file, self.line, self.column)
  }
}

/// One diagnostic, tagged by the pipeline phase that raised it.
#[derive(Debug, Clone, Snafu)]
pub enum CompileError {
  #[snafu(display("{pos}: lex error: {message}"))]
  Lex { pos: Position, message: String },

  #[snafu(display("{pos}: parse error: {message}"))]
  Parse { pos: Position, message: String },

  #[snafu(display("{pos}: resolution error: {message}"))]
  Resolution { pos: Position, message: String },

  #[snafu(display("{pos}: type error: {message}"))]
  Type { pos: Position, message: String },

  #[snafu(display("{pos}: semantic error: {message}"))]
  Semantic { pos: Position, message: String },

  #[snafu(display("{pos}: internal compiler error: {message}"))]
  Internal { pos: Position, message: String },
}

impl CompileError {
  pub fn lex(pos: Position, message: impl Into<String>) -> Self {
    Self::Lex {
      pos,
      message: message.into(),
    }
  }

  pub fn parse(pos: Position, message: impl Into<String>) -> Self {
    Self::Parse {
      pos,
      message: message.into(),
    }
  }

  pub fn resolution(pos: Position, message: impl Into<String>) -> Self {
    Self::Resolution {
      pos,
      message: message.into(),
    }
  }

  pub fn type_error(pos: Position, message: impl Into<String>) -> Self {
    Self::Type {
      pos,
      message: message.into(),
    }
  }

  pub fn semantic(pos: Position, message: impl Into<String>) -> Self {
    Self::Semantic {
      pos,
      message: message.into(),
    }
  }

  pub fn internal(pos: Position, message: impl Into<String>) -> Self {
    Self::Internal {
      pos,
      message: message.into(),
    }
  }

  pub fn pos(&self) -> &Position {
    match self {
      Self::Lex { pos, .. }
      | Self::Parse { pos, .. }
      | Self::Resolution { pos, .. }
      | Self::Type { pos, .. }
      | Self::Semantic { pos, .. }
      | Self::Internal { pos, .. } => pos,
    }
  }

  pub fn is_internal(&self) -> bool {
    matches!(self, Self::Internal { .. })
  }
}

/// Accumulated diagnostics from one compilation attempt.
///
/// A failing pass usually contributes a single error, but the semantic
/// analyzer keeps going across top-level declarations and may report
/// several before the pipeline stops.
#[derive(Debug, Default)]
pub struct Diagnostics(Vec<CompileError>);

impl Diagnostics {
  pub fn push(&mut self, error: CompileError) {
    self.0.push(error);
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &CompileError> {
    self.0.iter()
  }

  /// True when any diagnostic is a compiler soundness failure rather than
  /// a user error.
  pub fn has_internal(&self) -> bool {
    self.0.iter().any(CompileError::is_internal)
  }
}

impl From<CompileError> for Diagnostics {
  fn from(error: CompileError) -> Self {
    Diagnostics(vec![error])
  }
}

impl From<Vec<CompileError>> for Diagnostics {
  fn from(errors: Vec<CompileError>) -> Self {
    Diagnostics(errors)
  }
}

impl Display for Diagnostics {
  fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
    for error in &self.0 {
      writeln!(fmt, "error: {error}")?;
    }
    let noun = if self.0.len() == 1 { "error" } else { "errors" };
    write!(fmt, "compilation failed with {} {}", self.0.len(), noun)
  }
}
