//! Include resolution: produces one linear token stream.
//!
//! An `include "name"` directive is resolved against the search path and
//! the named file is tokenized to completion before the including file
//! resumes, exactly as if the text had been pasted at the directive. A
//! file may be included any number of times; there is no once-only
//! semantics. The entry file's own directory is searched first.

use crate::error::{CompileError, CompileResult, Position};
use crate::tokenizer::{self, Keyword, Token, TokenKind};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Read and tokenize the entry file and everything it includes,
/// terminating the spliced stream with a single `Eof` token.
pub fn preprocess(entry: &Path, include_dirs: &[PathBuf]) -> CompileResult<Vec<Token>> {
  let mut search = Vec::new();
  if let Some(parent) = entry.parent() {
    search.push(parent.to_path_buf());
  }
  search.extend(include_dirs.iter().cloned());

  let source = read_source(entry, &Position::builtin())?;
  let mut tokens = Vec::new();
  splice(&source, &entry.to_string_lossy(), &search, &mut tokens)?;
  tokens.push(eof_token(entry));
  Ok(tokens)
}

/// Preprocess source text that is already in memory; used by tests and
/// the dump modes. Includes still resolve against `include_dirs`.
pub fn preprocess_source(
  source: &str,
  name: &str,
  include_dirs: &[PathBuf],
) -> CompileResult<Vec<Token>> {
  let mut tokens = Vec::new();
  splice(source, name, include_dirs, &mut tokens)?;
  tokens.push(Token {
    kind: TokenKind::Eof,
    text: String::new(),
    value: None,
    string: None,
    pos: Position::new(Rc::from(name), 0, 0),
  });
  Ok(tokens)
}

fn eof_token(entry: &Path) -> Token {
  Token {
    kind: TokenKind::Eof,
    text: String::new(),
    value: None,
    string: None,
    pos: Position::new(Rc::from(entry.to_string_lossy().as_ref()), 0, 0),
  }
}

fn read_source(path: &Path, pos: &Position) -> CompileResult<String> {
  fs::read_to_string(path).map_err(|err| {
    CompileError::resolution(
      pos.clone(),
      format!("cannot read \"{}\": {err}", path.display()),
    )
  })
}

/// Tokenize one file and append its stream, recursing into includes.
fn splice(
  source: &str,
  name: &str,
  search: &[PathBuf],
  out: &mut Vec<Token>,
) -> CompileResult<()> {
  let tokens = tokenizer::tokenize(source, Rc::from(name))?;
  let mut iter = tokens.into_iter().peekable();

  while let Some(token) = iter.next() {
    if token.kind != TokenKind::Keyword(Keyword::Include) {
      out.push(token);
      continue;
    }

    let target = match iter.next() {
      Some(t) if t.kind == TokenKind::StrLit => t,
      other => {
        let pos = other.map(|t| t.pos).unwrap_or(token.pos);
        return Err(CompileError::parse(pos, "include expects a string literal"));
      }
    };
    // A terminating semicolon after the directive is accepted and eaten.
    if let Some(next) = iter.peek()
      && next.text == ";"
    {
      iter.next();
    }

    let wanted = target.string.as_deref().unwrap_or("");
    let resolved = resolve(wanted, search).ok_or_else(|| {
      CompileError::resolution(
        target.pos.clone(),
        format!("cannot find include file \"{wanted}\""),
      )
    })?;

    let included = read_source(&resolved, &target.pos)?;
    splice(&included, &resolved.to_string_lossy(), search, out)?;
  }

  Ok(())
}

fn resolve(name: &str, search: &[PathBuf]) -> Option<PathBuf> {
  for dir in search {
    let candidate = dir.join(name);
    if candidate.is_file() {
      return Some(candidate);
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_source_gets_eof_terminator() {
    let tokens = preprocess_source("var x;", "t.cow", &[]).expect("preprocess");
    assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
    assert_eq!(tokens.len(), 4);
  }

  #[test]
  fn missing_include_is_fatal() {
    let result = preprocess_source("include \"no_such_file.coh\";", "t.cow", &[]);
    assert!(matches!(result, Err(CompileError::Resolution { .. })));
  }

  #[test]
  fn include_resolves_against_search_path() {
    let dir = std::env::temp_dir().join("rucow_pp_test");
    fs::create_dir_all(&dir).expect("temp dir");
    fs::write(dir.join("defs.coh"), "const TEN := 10;").expect("write header");

    let tokens =
      preprocess_source("include \"defs.coh\"; var x;", "t.cow", &[dir.clone()])
        .expect("preprocess");
    let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
    assert!(texts.contains(&"TEN"));
    assert!(texts.contains(&"x"));
  }

  #[test]
  fn repeated_includes_are_spliced_each_time() {
    let dir = std::env::temp_dir().join("rucow_pp_twice");
    fs::create_dir_all(&dir).expect("temp dir");
    fs::write(dir.join("twice.coh"), "var marker;").expect("write header");

    let tokens = preprocess_source(
      "include \"twice.coh\"; include \"twice.coh\";",
      "t.cow",
      &[dir.clone()],
    )
    .expect("preprocess");
    let count = tokens.iter().filter(|t| t.text == "marker").count();
    assert_eq!(count, 2);
  }
}
