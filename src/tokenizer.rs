//! Lexical analysis: turns one source file into a vector of tokens.
//!
//! The tokenizer knows nothing about include resolution or semantics; it
//! recognises keywords, identifiers, prefixed numeric literals, character
//! and string literals, and punctuation. Multi-character operators are
//! matched before single-character ones to avoid ambiguity. Every token
//! keeps its original lexeme, so concatenating lexemes reproduces the
//! source up to comments and whitespace.

use crate::error::{CompileError, CompileResult, Position};
use std::rc::Rc;

/// Keywords of the language, including the `@`-prefixed directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
  Var,
  Const,
  Sub,
  Is,
  End,
  If,
  Then,
  Elseif,
  Else,
  While,
  Loop,
  Break,
  Continue,
  Return,
  Case,
  When,
  Record,
  Typedef,
  Interface,
  Implements,
  Include,
  And,
  Or,
  Not,
  As,
  Nil,
  Decl,
  Impl,
  At,
  Extern,
  Asm,
  SizeOf,
  BytesOf,
  IndexOf,
  Next,
  Prev,
  Alias,
}

const KEYWORDS: &[(&str, Keyword)] = &[
  ("var", Keyword::Var),
  ("const", Keyword::Const),
  ("sub", Keyword::Sub),
  ("is", Keyword::Is),
  ("end", Keyword::End),
  ("if", Keyword::If),
  ("then", Keyword::Then),
  ("elseif", Keyword::Elseif),
  ("else", Keyword::Else),
  ("while", Keyword::While),
  ("loop", Keyword::Loop),
  ("break", Keyword::Break),
  ("continue", Keyword::Continue),
  ("return", Keyword::Return),
  ("case", Keyword::Case),
  ("when", Keyword::When),
  ("record", Keyword::Record),
  ("typedef", Keyword::Typedef),
  ("interface", Keyword::Interface),
  ("implements", Keyword::Implements),
  ("include", Keyword::Include),
  ("and", Keyword::And),
  ("or", Keyword::Or),
  ("not", Keyword::Not),
  ("as", Keyword::As),
  ("nil", Keyword::Nil),
  ("@decl", Keyword::Decl),
  ("@impl", Keyword::Impl),
  ("@at", Keyword::At),
  ("@extern", Keyword::Extern),
  ("@asm", Keyword::Asm),
  ("@sizeof", Keyword::SizeOf),
  ("@bytesof", Keyword::BytesOf),
  ("@indexof", Keyword::IndexOf),
  ("@next", Keyword::Next),
  ("@prev", Keyword::Prev),
  ("@alias", Keyword::Alias),
];

/// Punctuation and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Punct {
  Assign, // :=
  Eq,     // ==
  Ne,     // !=
  Le,     // <=
  Ge,     // >=
  Shl,    // <<
  Shr,    // >>
  Lt,     // <
  Gt,     // >
  Plus,
  Minus,
  Star,
  Slash,
  Percent,
  Amp,
  Pipe,
  Caret,
  LParen,
  RParen,
  LBracket,
  RBracket,
  LBrace,
  RBrace,
  Comma,
  Colon,
  Semicolon,
  Dot,
}

const MULTI_PUNCT: &[(&str, Punct)] = &[
  (":=", Punct::Assign),
  ("==", Punct::Eq),
  ("!=", Punct::Ne),
  ("<=", Punct::Le),
  (">=", Punct::Ge),
  ("<<", Punct::Shl),
  (">>", Punct::Shr),
];

const SINGLE_PUNCT: &[(u8, Punct)] = &[
  (b'<', Punct::Lt),
  (b'>', Punct::Gt),
  (b'+', Punct::Plus),
  (b'-', Punct::Minus),
  (b'*', Punct::Star),
  (b'/', Punct::Slash),
  (b'%', Punct::Percent),
  (b'&', Punct::Amp),
  (b'|', Punct::Pipe),
  (b'^', Punct::Caret),
  (b'(', Punct::LParen),
  (b')', Punct::RParen),
  (b'[', Punct::LBracket),
  (b']', Punct::RBracket),
  (b'{', Punct::LBrace),
  (b'}', Punct::RBrace),
  (b',', Punct::Comma),
  (b':', Punct::Colon),
  (b';', Punct::Semicolon),
  (b'.', Punct::Dot),
];

/// Kinds of tokens recognised by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
  Keyword(Keyword),
  Ident,
  Int,
  CharLit,
  StrLit,
  Punct(Punct),
  Eof,
}

/// Thin wrapper for lexical information needed by later stages.
#[derive(Debug, Clone)]
pub struct Token {
  pub kind: TokenKind,
  /// The original lexeme, exactly as it appears in the source.
  pub text: String,
  /// Numeric value for integer and character literals.
  pub value: Option<i64>,
  /// Decoded bytes for string literals, escapes applied.
  pub string: Option<String>,
  pub pos: Position,
}

impl Token {
  /// Convenience constructor to keep the scanning loop readable.
  fn new(kind: TokenKind, text: impl Into<String>, pos: Position) -> Self {
    Self {
      kind,
      text: text.into(),
      value: None,
      string: None,
      pos,
    }
  }

  /// Human-friendly description used in diagnostics.
  pub fn describe(&self) -> String {
    match self.kind {
      TokenKind::Eof => "end of input".to_string(),
      TokenKind::StrLit => "string literal".to_string(),
      _ => format!("\"{}\"", self.text),
    }
  }
}

struct Scanner<'a> {
  bytes: &'a [u8],
  source: &'a str,
  file: Rc<str>,
  i: usize,
  line: u32,
  column: u32,
}

impl<'a> Scanner<'a> {
  fn pos(&self) -> Position {
    Position::new(Rc::clone(&self.file), self.line, self.column)
  }

  fn peek(&self) -> Option<u8> {
    self.bytes.get(self.i).copied()
  }

  fn bump(&mut self) -> Option<u8> {
    let c = self.peek()?;
    self.i += 1;
    if c == b'\n' {
      self.line += 1;
      self.column = 1;
    } else {
      self.column += 1;
    }
    Some(c)
  }

  /// Consume `n` bytes known not to contain a newline.
  fn bump_n(&mut self, n: usize) {
    self.i += n;
    self.column += n as u32;
  }
}

/// Lex a single file into a flat vector of tokens. No `Eof` marker is
/// appended here; the preprocessor terminates the spliced stream.
pub fn tokenize(source: &str, file: Rc<str>) -> CompileResult<Vec<Token>> {
  let mut scanner = Scanner {
    bytes: source.as_bytes(),
    source,
    file,
    i: 0,
    line: 1,
    column: 1,
  };
  let mut tokens = Vec::new();

  while let Some(c) = scanner.peek() {
    if c.is_ascii_whitespace() {
      scanner.bump();
      continue;
    }

    // Comments run from '#' to end of line.
    if c == b'#' {
      while let Some(c) = scanner.peek() {
        if c == b'\n' {
          break;
        }
        scanner.bump();
      }
      continue;
    }

    let pos = scanner.pos();

    if c.is_ascii_digit() {
      tokens.push(lex_number(&mut scanner, pos)?);
      continue;
    }

    if c.is_ascii_alphabetic() || c == b'_' || c == b'@' {
      tokens.push(lex_word(&mut scanner, pos)?);
      continue;
    }

    if c == b'\'' {
      tokens.push(lex_char(&mut scanner, pos)?);
      continue;
    }

    if c == b'"' {
      tokens.push(lex_string(&mut scanner, pos)?);
      continue;
    }

    if let Some((text, punct)) = MULTI_PUNCT
      .iter()
      .find(|(op, _)| scanner.source[scanner.i..].starts_with(op))
    {
      tokens.push(Token::new(TokenKind::Punct(*punct), *text, pos));
      scanner.bump_n(text.len());
      continue;
    }

    if let Some((_, punct)) = SINGLE_PUNCT.iter().find(|(ch, _)| *ch == c) {
      tokens.push(Token::new(TokenKind::Punct(*punct), (c as char).to_string(), pos));
      scanner.bump();
      continue;
    }

    let bad = scanner.source[scanner.i..].chars().next().unwrap_or('\0');
    return Err(CompileError::lex(pos, format!("unexpected character {bad:?}")));
  }

  Ok(tokens)
}

fn lex_word(scanner: &mut Scanner, pos: Position) -> CompileResult<Token> {
  let start = scanner.i;
  let at_word = scanner.peek() == Some(b'@');
  if at_word {
    scanner.bump();
  }

  while let Some(c) = scanner.peek() {
    if c.is_ascii_alphanumeric() || c == b'_' {
      scanner.bump();
    } else {
      break;
    }
  }

  let text = &scanner.source[start..scanner.i];
  if at_word && text.len() == 1 {
    return Err(CompileError::lex(pos, "'@' must begin a directive keyword"));
  }

  match KEYWORDS.iter().find(|(word, _)| *word == text) {
    Some((_, keyword)) => Ok(Token::new(TokenKind::Keyword(*keyword), text, pos)),
    None if at_word => Err(CompileError::lex(
      pos,
      format!("unknown directive \"{text}\""),
    )),
    None => Ok(Token::new(TokenKind::Ident, text, pos)),
  }
}

fn lex_number(scanner: &mut Scanner, pos: Position) -> CompileResult<Token> {
  let start = scanner.i;
  let radix = if scanner.source[scanner.i..].len() >= 2
    && scanner.peek() == Some(b'0')
  {
    match scanner.bytes.get(scanner.i + 1) {
      Some(b'x') | Some(b'X') => Some(16),
      Some(b'd') | Some(b'D') => Some(10),
      Some(b'o') | Some(b'O') => Some(8),
      Some(b'b') | Some(b'B') => Some(2),
      _ => None,
    }
  } else {
    None
  };

  if radix.is_some() {
    scanner.bump();
    scanner.bump();
  }
  let radix = radix.unwrap_or(10);

  let digits_start = scanner.i;
  while let Some(c) = scanner.peek() {
    if c.is_ascii_alphanumeric() || c == b'_' {
      scanner.bump();
    } else {
      break;
    }
  }

  let text = &scanner.source[start..scanner.i];
  let digits: String = scanner.source[digits_start..scanner.i]
    .chars()
    .filter(|c| *c != '_')
    .collect();
  if digits.is_empty() {
    return Err(CompileError::lex(pos, format!("malformed number \"{text}\"")));
  }

  let value = i64::from_str_radix(&digits, radix)
    .map_err(|_| CompileError::lex(pos.clone(), format!("malformed number \"{text}\"")))?;

  let mut token = Token::new(TokenKind::Int, text, pos);
  token.value = Some(value);
  Ok(token)
}

/// Decode one escape sequence after the backslash has been consumed.
fn lex_escape(scanner: &mut Scanner, pos: &Position) -> CompileResult<u8> {
  let c = scanner
    .bump()
    .ok_or_else(|| CompileError::lex(pos.clone(), "unterminated escape sequence"))?;
  Ok(match c {
    b'n' => b'\n',
    b't' => b'\t',
    b'r' => b'\r',
    b'0' => 0,
    b'\\' => b'\\',
    b'\'' => b'\'',
    b'"' => b'"',
    b'x' => {
      let mut value = 0u8;
      for _ in 0..2 {
        let digit = scanner
          .bump()
          .and_then(|c| (c as char).to_digit(16))
          .ok_or_else(|| {
            CompileError::lex(pos.clone(), "\\x escape needs two hex digits")
          })?;
        value = value.wrapping_mul(16).wrapping_add(digit as u8);
      }
      value
    }
    _ => {
      return Err(CompileError::lex(
        pos.clone(),
        format!("unknown escape \"\\{}\"", c as char),
      ));
    }
  })
}

fn lex_char(scanner: &mut Scanner, pos: Position) -> CompileResult<Token> {
  let start = scanner.i;
  scanner.bump(); // opening quote

  let c = scanner
    .bump()
    .ok_or_else(|| CompileError::lex(pos.clone(), "unterminated character literal"))?;
  let value = if c == b'\\' {
    lex_escape(scanner, &pos)?
  } else {
    c
  };

  if scanner.bump() != Some(b'\'') {
    return Err(CompileError::lex(pos, "unterminated character literal"));
  }

  let mut token = Token::new(TokenKind::CharLit, &scanner.source[start..scanner.i], pos);
  token.value = Some(value as i64);
  Ok(token)
}

fn lex_string(scanner: &mut Scanner, pos: Position) -> CompileResult<Token> {
  let start = scanner.i;
  scanner.bump(); // opening quote

  let mut decoded = String::new();
  loop {
    let c = scanner
      .bump()
      .ok_or_else(|| CompileError::lex(pos.clone(), "unterminated string literal"))?;
    match c {
      b'"' => break,
      b'\n' => {
        return Err(CompileError::lex(pos, "unterminated string literal"));
      }
      b'\\' => decoded.push(lex_escape(scanner, &pos)? as char),
      _ => decoded.push(c as char),
    }
  }

  let mut token = Token::new(TokenKind::StrLit, &scanner.source[start..scanner.i], pos);
  token.string = Some(decoded);
  Ok(token)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn lex(source: &str) -> Vec<Token> {
    tokenize(source, Rc::from("test.cow")).expect("lex failure")
  }

  #[test]
  fn keywords_and_identifiers() {
    let tokens = lex("var counter := 0;");
    assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Var));
    assert_eq!(tokens[1].kind, TokenKind::Ident);
    assert_eq!(tokens[1].text, "counter");
    assert_eq!(tokens[2].kind, TokenKind::Punct(Punct::Assign));
    assert_eq!(tokens[3].value, Some(0));
  }

  #[test]
  fn numeric_prefixes_and_separators() {
    let tokens = lex("0x1F 0b1010 0o17 0d42 1_000");
    let values: Vec<i64> = tokens.iter().filter_map(|t| t.value).collect();
    assert_eq!(values, vec![0x1F, 0b1010, 0o17, 42, 1000]);
  }

  #[test]
  fn char_escapes() {
    let tokens = lex(r"'\n' '\x41' 'a'");
    let values: Vec<i64> = tokens.iter().filter_map(|t| t.value).collect();
    assert_eq!(values, vec![10, 0x41, 97]);
  }

  #[test]
  fn string_decoding_keeps_lexeme() {
    let tokens = lex(r#""hi\n""#);
    assert_eq!(tokens[0].string.as_deref(), Some("hi\n"));
    assert_eq!(tokens[0].text, r#""hi\n""#);
  }

  #[test]
  fn greedy_operators() {
    let tokens = lex("<< <= < := :");
    let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
      kinds,
      vec![
        TokenKind::Punct(Punct::Shl),
        TokenKind::Punct(Punct::Le),
        TokenKind::Punct(Punct::Lt),
        TokenKind::Punct(Punct::Assign),
        TokenKind::Punct(Punct::Colon),
      ]
    );
  }

  #[test]
  fn comments_are_skipped() {
    let tokens = lex("var x; # trailing words := ;\nvar y;");
    assert_eq!(tokens.len(), 6);
    assert_eq!(tokens[4].text, "y");
  }

  #[test]
  fn at_directives() {
    let tokens = lex("@decl @sizeof @next");
    assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Decl));
    assert_eq!(tokens[1].kind, TokenKind::Keyword(Keyword::SizeOf));
    assert_eq!(tokens[2].kind, TokenKind::Keyword(Keyword::Next));
  }

  #[test]
  fn unknown_directive_is_fatal() {
    assert!(tokenize("@bogus", Rc::from("t")).is_err());
  }

  #[test]
  fn unknown_character_is_fatal() {
    assert!(tokenize("var $x;", Rc::from("t")).is_err());
  }

  #[test]
  fn lexeme_concat_reproduces_source() {
    let source = "var x: uint8 := 0x10; # comment\nwhile x != 0 loop end loop;";
    let tokens = lex(source);
    let rebuilt: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
    let rebuilt = rebuilt.join(" ");
    let normalize = |s: &str| {
      s.split('#')
        .next()
        .unwrap_or("")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("")
    };
    // Up to whitespace and comments, the token stream carries the source.
    let source_flat: String = source
      .lines()
      .map(normalize)
      .collect::<Vec<_>>()
      .join("");
    assert_eq!(rebuilt.split_whitespace().collect::<String>(), source_flat);
  }

  #[test]
  fn positions_track_lines_and_columns() {
    let tokens = lex("var\n  x;");
    assert_eq!((tokens[0].pos.line, tokens[0].pos.column), (1, 1));
    assert_eq!((tokens[1].pos.line, tokens[1].pos.column), (2, 3));
  }
}
