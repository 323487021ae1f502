//! Recursive-descent parser producing the program AST.
//!
//! The parser maintains a precedence-climbing set of helpers for
//! expressions and a keyword-dispatched statement layer. Comparisons and
//! the logical operators live at the bottom of the precedence ladder and
//! are only reachable from conditional contexts (`if`, `while`, `case`
//! guards and the subtrees of `and`/`or`/`not`); a comparison anywhere
//! else is rejected outright rather than parsed and diagnosed later.
//!
//! Name resolution does not happen here: references stay as [`ExprKind::Name`]
//! until the semantic analyzer rewrites them, and the `ty` slot of every
//! expression stays empty until the same pass fills it in.

use crate::error::{CompileError, CompileResult, Position};
use crate::sema::{SubId, VarId};
use crate::tokenizer::{Keyword, Punct, Token, TokenKind};
use crate::ty::TypeId;

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
  Add,
  Sub,
  Mul,
  Div,
  Mod,
  BitAnd,
  BitOr,
  BitXor,
  Shl,
  Shr,
}

impl BinOp {
  pub fn is_commutative(self) -> bool {
    matches!(
      self,
      BinOp::Add | BinOp::Mul | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor
    )
  }
}

/// Comparison operators. These only appear in conditional contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
}

impl CmpOp {
  pub fn negated(self) -> Self {
    match self {
      CmpOp::Eq => CmpOp::Ne,
      CmpOp::Ne => CmpOp::Eq,
      CmpOp::Lt => CmpOp::Ge,
      CmpOp::Le => CmpOp::Gt,
      CmpOp::Gt => CmpOp::Le,
      CmpOp::Ge => CmpOp::Lt,
    }
  }

  /// The operator that holds when the operands are exchanged.
  pub fn swapped(self) -> Self {
    match self {
      CmpOp::Eq => CmpOp::Eq,
      CmpOp::Ne => CmpOp::Ne,
      CmpOp::Lt => CmpOp::Gt,
      CmpOp::Le => CmpOp::Ge,
      CmpOp::Gt => CmpOp::Lt,
      CmpOp::Ge => CmpOp::Le,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
  And,
  Or,
}

/// A syntactic type expression; resolved to a [`TypeId`] by sema.
///
/// `[T]` is a pointer to `T`, `T[n]` an array, `T[]` an array whose
/// extent is inferred from an initializer.
#[derive(Debug, Clone)]
pub enum TypeRef {
  Named(String, Position),
  Ptr(Box<TypeRef>),
  Array {
    element: Box<TypeRef>,
    extent: Option<Box<Expr>>,
  },
  /// `@indexof arr`: the natural index type of a named array variable.
  IndexOf(String, Position),
}

/// Expression tree. The `ty` slot is filled by semantic analysis.
#[derive(Debug, Clone)]
pub struct Expr {
  pub kind: ExprKind,
  pub pos: Position,
  pub ty: Option<TypeId>,
}

impl Expr {
  pub fn new(kind: ExprKind, pos: Position) -> Self {
    Self {
      kind,
      pos,
      ty: None,
    }
  }

  pub fn int(value: i64, pos: Position) -> Self {
    Self::new(ExprKind::Int(value), pos)
  }

  /// An integer literal carrying an already-decided type; the optimizer
  /// uses this to replace folded subtrees without losing their type.
  pub fn typed_int(value: i64, pos: Position, ty: Option<TypeId>) -> Self {
    Self {
      kind: ExprKind::Int(value),
      pos,
      ty,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self.kind {
      ExprKind::Int(value) => Some(value),
      _ => None,
    }
  }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
  Int(i64),
  Str(String),
  Nil,
  /// Unresolved reference; sema rewrites it to `Var` or `SubRef`,
  /// or folds it away for constants.
  Name(String),
  Var(VarId),
  SubRef(SubId),
  Field {
    base: Box<Expr>,
    field: String,
    /// Byte offset within the record, filled by sema.
    offset: Option<u16>,
  },
  Index {
    base: Box<Expr>,
    index: Box<Expr>,
  },
  Deref(Box<Expr>),
  AddrOf(Box<Expr>),
  Neg(Box<Expr>),
  Binary {
    op: BinOp,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
  },
  Cmp {
    op: CmpOp,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
  },
  Logical {
    op: LogicalOp,
    lhs: Box<Expr>,
    rhs: Box<Expr>,
  },
  Not(Box<Expr>),
  Cast {
    expr: Box<Expr>,
    to: TypeRef,
  },
  Call {
    target: Box<Expr>,
    args: Vec<Expr>,
  },
  /// Element count of an array.
  SizeOf(Box<Expr>),
  /// Byte size of a value or of a named type.
  BytesOf(Box<Expr>),
  /// The natural index type of an array; always folds to a type, so it
  /// only appears as the annotation authority for index expressions.
  IndexOf(Box<Expr>),
  NextPtr(Box<Expr>),
  PrevPtr(Box<Expr>),
  ArrayInit(Vec<Expr>),
}

/// One statement with its source position.
#[derive(Debug, Clone)]
pub struct Stmt {
  pub kind: StmtKind,
  pub pos: Position,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
  Var(VarDecl),
  Const {
    name: String,
    value: Expr,
  },
  Typedef {
    name: String,
    target: TypeRef,
  },
  Record(RecordDecl),
  Interface(InterfaceDecl),
  Sub(Box<SubDecl>),
  Assign {
    target: Expr,
    value: Expr,
  },
  /// Destructuring assignment from a multi-return call.
  MultiAssign {
    targets: Vec<Expr>,
    call: Expr,
  },
  If {
    arms: Vec<CondArm>,
    else_body: Vec<Stmt>,
  },
  While {
    cond: Expr,
    body: Vec<Stmt>,
  },
  Loop {
    body: Vec<Stmt>,
  },
  Break,
  Continue,
  Return,
  Case {
    scrutinee: Expr,
    arms: Vec<CaseArm>,
    else_body: Vec<Stmt>,
  },
  Asm {
    parts: Vec<AsmPart>,
  },
  Expr(Expr),
}

#[derive(Debug, Clone)]
pub struct CondArm {
  pub cond: Expr,
  pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct CaseArm {
  pub values: Vec<Expr>,
  pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum AsmPart {
  Text(String),
  Name(String),
  /// Resolved forms, filled by sema.
  Var(VarId),
  Const(i64),
  Sub(SubId),
}

#[derive(Debug, Clone)]
pub struct VarDecl {
  pub name: String,
  pub ty: Option<TypeRef>,
  pub init: Option<Expr>,
  /// Filled by sema.
  pub var: Option<VarId>,
}

#[derive(Debug, Clone)]
pub struct RecordFieldDecl {
  pub name: String,
  pub ty: TypeRef,
  /// Explicit byte offset from `@at(n)`.
  pub at: Option<Expr>,
  pub pos: Position,
}

#[derive(Debug, Clone)]
pub struct RecordDecl {
  pub name: String,
  pub base: Option<String>,
  pub fields: Vec<RecordFieldDecl>,
}

#[derive(Debug, Clone)]
pub struct ParamDecl {
  pub name: String,
  pub ty: TypeRef,
}

#[derive(Debug, Clone)]
pub struct InterfaceDecl {
  pub name: String,
  pub params: Vec<ParamDecl>,
  pub returns: Vec<ParamDecl>,
}

/// How a subroutine statement relates to its body.
#[derive(Debug, Clone)]
pub enum SubKind {
  /// `sub F ... is ... end sub`
  Define,
  /// `@decl sub F ...;` with optional `@extern("label")`.
  Forward { extern_name: Option<String> },
  /// `@impl sub F is ... end sub`
  Implement,
}

#[derive(Debug, Clone)]
pub struct SubDecl {
  pub name: String,
  pub params: Vec<ParamDecl>,
  pub returns: Vec<ParamDecl>,
  /// Interface this subroutine implements; its signature then comes from
  /// the interface and `params`/`returns` stay empty.
  pub implements: Option<String>,
  pub kind: SubKind,
  pub body: Option<Vec<Stmt>>,
  /// Filled by sema.
  pub id: Option<SubId>,
  pub pos: Position,
}

#[derive(Debug, Clone)]
pub struct Program {
  pub body: Vec<Stmt>,
}

/// Parse a preprocessed token stream into a program.
pub fn parse(tokens: Vec<Token>) -> CompileResult<Program> {
  let mut stream = TokenStream::new(tokens);
  let body = parse_stmts(&mut stream, &[])?;
  stream.expect_eof()?;
  Ok(Program { body })
}

// ----- Statement parsing -----

/// Keywords that close the current statement list.
type Terminators = [Keyword];

fn parse_stmts(stream: &mut TokenStream, terminators: &Terminators) -> CompileResult<Vec<Stmt>> {
  let mut stmts = Vec::new();
  loop {
    if stream.at_eof() {
      if terminators.is_empty() {
        break;
      }
      return Err(CompileError::parse(
        stream.pos(),
        "unexpected end of input inside a block",
      ));
    }
    if let Some(keyword) = stream.peek_keyword()
      && terminators.contains(&keyword)
    {
      break;
    }
    stmts.push(parse_stmt(stream)?);
  }
  Ok(stmts)
}

fn parse_stmt(stream: &mut TokenStream) -> CompileResult<Stmt> {
  let pos = stream.pos();
  match stream.peek_keyword() {
    Some(Keyword::Var) => parse_var(stream, pos),
    Some(Keyword::Const) => parse_const(stream, pos),
    Some(Keyword::Typedef) => parse_typedef(stream, pos),
    Some(Keyword::Record) => parse_record(stream, pos),
    Some(Keyword::Interface) => parse_interface(stream, pos),
    Some(Keyword::Sub) => parse_sub(stream, pos, SubKind::Define),
    Some(Keyword::Decl) => {
      stream.eat_keyword(Keyword::Decl);
      parse_sub_forward(stream, pos)
    }
    Some(Keyword::Impl) => {
      stream.eat_keyword(Keyword::Impl);
      parse_sub(stream, pos, SubKind::Implement)
    }
    Some(Keyword::If) => parse_if(stream, pos),
    Some(Keyword::While) => parse_while(stream, pos),
    Some(Keyword::Loop) => {
      stream.eat_keyword(Keyword::Loop);
      let body = parse_stmts(stream, &[Keyword::End])?;
      stream.skip_keyword(Keyword::End)?;
      stream.skip_keyword(Keyword::Loop)?;
      stream.skip_punct(Punct::Semicolon)?;
      Ok(Stmt {
        kind: StmtKind::Loop { body },
        pos,
      })
    }
    Some(Keyword::Break) => {
      stream.eat_keyword(Keyword::Break);
      stream.skip_punct(Punct::Semicolon)?;
      Ok(Stmt {
        kind: StmtKind::Break,
        pos,
      })
    }
    Some(Keyword::Continue) => {
      stream.eat_keyword(Keyword::Continue);
      stream.skip_punct(Punct::Semicolon)?;
      Ok(Stmt {
        kind: StmtKind::Continue,
        pos,
      })
    }
    Some(Keyword::Return) => {
      stream.eat_keyword(Keyword::Return);
      stream.skip_punct(Punct::Semicolon)?;
      Ok(Stmt {
        kind: StmtKind::Return,
        pos,
      })
    }
    Some(Keyword::Case) => parse_case(stream, pos),
    Some(Keyword::Asm) => parse_asm(stream, pos),
    // `end`, `elseif`, `else` and `when` arrive here when a block is
    // closed in the wrong place.
    Some(_) => Err(CompileError::parse(
      pos,
      format!("keyword \"{}\" cannot start a statement", stream.peek_text()),
    )),
    None => parse_simple_stmt(stream, pos),
  }
}

fn parse_var(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  stream.eat_keyword(Keyword::Var);
  let name = stream.get_ident()?;

  let ty = if stream.eat_punct(Punct::Colon) {
    Some(parse_type(stream)?)
  } else {
    None
  };

  let init = if stream.eat_punct(Punct::Assign) {
    Some(parse_initializer(stream)?)
  } else {
    None
  };

  if ty.is_none() {
    match &init {
      None => {
        return Err(CompileError::parse(
          pos,
          format!("variable \"{name}\" needs a type or an initializer"),
        ));
      }
      Some(expr) => {
        if matches!(expr.kind, ExprKind::Int(_)) {
          return Err(CompileError::type_error(
            expr.pos.clone(),
            "type of a bare integer literal is ambiguous; annotate the variable",
          ));
        }
      }
    }
  }

  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::Var(VarDecl {
      name,
      ty,
      init,
      var: None,
    }),
    pos,
  })
}

/// A variable initializer: an ordinary value, or `{ ... }` for arrays.
fn parse_initializer(stream: &mut TokenStream) -> CompileResult<Expr> {
  if stream.check_punct(Punct::LBrace) {
    let pos = stream.pos();
    stream.eat_punct(Punct::LBrace);
    let mut elements = Vec::new();
    if !stream.check_punct(Punct::RBrace) {
      loop {
        elements.push(parse_value(stream)?);
        if !stream.eat_punct(Punct::Comma) {
          break;
        }
      }
    }
    stream.skip_punct(Punct::RBrace)?;
    return Ok(Expr::new(ExprKind::ArrayInit(elements), pos));
  }
  parse_value(stream)
}

fn parse_const(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  stream.eat_keyword(Keyword::Const);
  let name = stream.get_ident()?;
  stream.skip_punct(Punct::Assign)?;
  let value = parse_value(stream)?;
  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::Const { name, value },
    pos,
  })
}

fn parse_typedef(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  stream.eat_keyword(Keyword::Typedef);
  let name = stream.get_ident()?;
  stream.skip_keyword(Keyword::Is)?;
  let target = parse_type(stream)?;
  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::Typedef { name, target },
    pos,
  })
}

fn parse_record(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  stream.eat_keyword(Keyword::Record);
  let name = stream.get_ident()?;
  let base = if stream.eat_punct(Punct::Colon) {
    Some(stream.get_ident()?)
  } else {
    None
  };
  stream.skip_keyword(Keyword::Is)?;

  let mut fields = Vec::new();
  while !stream.check_keyword(Keyword::End) {
    let field_pos = stream.pos();
    let field_name = stream.get_ident()?;
    stream.skip_punct(Punct::Colon)?;
    let field_ty = parse_type(stream)?;
    let at = if stream.eat_keyword_if(Keyword::At) {
      stream.skip_punct(Punct::LParen)?;
      let offset = parse_value(stream)?;
      stream.skip_punct(Punct::RParen)?;
      Some(offset)
    } else {
      None
    };
    stream.skip_punct(Punct::Semicolon)?;
    fields.push(RecordFieldDecl {
      name: field_name,
      ty: field_ty,
      at,
      pos: field_pos,
    });
  }

  stream.skip_keyword(Keyword::End)?;
  stream.skip_keyword(Keyword::Record)?;
  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::Record(RecordDecl { name, base, fields }),
    pos,
  })
}

fn parse_param_list(stream: &mut TokenStream) -> CompileResult<Vec<ParamDecl>> {
  stream.skip_punct(Punct::LParen)?;
  let mut params = Vec::new();
  if !stream.check_punct(Punct::RParen) {
    loop {
      let name = stream.get_ident()?;
      stream.skip_punct(Punct::Colon)?;
      let ty = parse_type(stream)?;
      params.push(ParamDecl { name, ty });
      if !stream.eat_punct(Punct::Comma) {
        break;
      }
    }
  }
  stream.skip_punct(Punct::RParen)?;
  Ok(params)
}

/// The optional `: (name: type, ...)` return list of subs and interfaces.
fn parse_return_list(stream: &mut TokenStream) -> CompileResult<Vec<ParamDecl>> {
  if stream.eat_punct(Punct::Colon) {
    parse_param_list(stream)
  } else {
    Ok(Vec::new())
  }
}

fn parse_interface(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  stream.eat_keyword(Keyword::Interface);
  let name = stream.get_ident()?;
  let params = parse_param_list(stream)?;
  let returns = parse_return_list(stream)?;
  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::Interface(InterfaceDecl {
      name,
      params,
      returns,
    }),
    pos,
  })
}

fn parse_sub(stream: &mut TokenStream, pos: Position, kind: SubKind) -> CompileResult<Stmt> {
  stream.skip_keyword(Keyword::Sub)?;
  let name = stream.get_ident()?;

  let (params, returns, implements) = if stream.eat_keyword_if(Keyword::Implements) {
    (Vec::new(), Vec::new(), Some(stream.get_ident()?))
  } else if matches!(kind, SubKind::Implement) && !stream.check_punct(Punct::LParen) {
    // `@impl` may repeat only the name; the signature then comes from
    // the `@decl`.
    (Vec::new(), Vec::new(), None)
  } else {
    let params = parse_param_list(stream)?;
    let returns = parse_return_list(stream)?;
    (params, returns, None)
  };

  stream.skip_keyword(Keyword::Is)?;
  let body = parse_stmts(stream, &[Keyword::End])?;
  stream.skip_keyword(Keyword::End)?;
  stream.skip_keyword(Keyword::Sub)?;
  stream.skip_punct(Punct::Semicolon)?;

  Ok(Stmt {
    kind: StmtKind::Sub(Box::new(SubDecl {
      name,
      params,
      returns,
      implements,
      kind,
      body: Some(body),
      id: None,
      pos: pos.clone(),
    })),
    pos,
  })
}

fn parse_sub_forward(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  stream.skip_keyword(Keyword::Sub)?;
  let name = stream.get_ident()?;
  let params = parse_param_list(stream)?;
  let returns = parse_return_list(stream)?;

  let extern_name = if stream.eat_keyword_if(Keyword::Extern) {
    stream.skip_punct(Punct::LParen)?;
    let label = stream.get_string()?;
    stream.skip_punct(Punct::RParen)?;
    Some(label)
  } else {
    None
  };

  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::Sub(Box::new(SubDecl {
      name,
      params,
      returns,
      implements: None,
      kind: SubKind::Forward { extern_name },
      body: None,
      id: None,
      pos: pos.clone(),
    })),
    pos,
  })
}

fn parse_if(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  stream.eat_keyword(Keyword::If);
  let mut arms = Vec::new();

  let cond = parse_cond(stream)?;
  stream.skip_keyword(Keyword::Then)?;
  let body = parse_stmts(stream, &[Keyword::Elseif, Keyword::Else, Keyword::End])?;
  arms.push(CondArm { cond, body });

  while stream.eat_keyword_if(Keyword::Elseif) {
    let cond = parse_cond(stream)?;
    stream.skip_keyword(Keyword::Then)?;
    let body = parse_stmts(stream, &[Keyword::Elseif, Keyword::Else, Keyword::End])?;
    arms.push(CondArm { cond, body });
  }

  let else_body = if stream.eat_keyword_if(Keyword::Else) {
    parse_stmts(stream, &[Keyword::End])?
  } else {
    Vec::new()
  };

  stream.skip_keyword(Keyword::End)?;
  stream.skip_keyword(Keyword::If)?;
  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::If { arms, else_body },
    pos,
  })
}

fn parse_while(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  stream.eat_keyword(Keyword::While);
  let cond = parse_cond(stream)?;
  stream.skip_keyword(Keyword::Loop)?;
  let body = parse_stmts(stream, &[Keyword::End])?;
  stream.skip_keyword(Keyword::End)?;
  stream.skip_keyword(Keyword::Loop)?;
  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::While { cond, body },
    pos,
  })
}

fn parse_case(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  stream.eat_keyword(Keyword::Case);
  let scrutinee = parse_value(stream)?;
  stream.skip_keyword(Keyword::Is)?;

  let mut arms = Vec::new();
  let mut else_body = Vec::new();
  while !stream.check_keyword(Keyword::End) {
    stream.skip_keyword(Keyword::When)?;
    if stream.eat_keyword_if(Keyword::Else) {
      stream.skip_punct(Punct::Colon)?;
      else_body = parse_stmts(stream, &[Keyword::When, Keyword::End])?;
      continue;
    }

    // Multi-value arms: each value is an alternative for the same body.
    let mut values = vec![parse_value(stream)?];
    while stream.eat_punct(Punct::Comma) {
      values.push(parse_value(stream)?);
    }
    stream.skip_punct(Punct::Colon)?;
    let body = parse_stmts(stream, &[Keyword::When, Keyword::End])?;
    arms.push(CaseArm { values, body });
  }

  stream.skip_keyword(Keyword::End)?;
  stream.skip_keyword(Keyword::Case)?;
  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::Case {
      scrutinee,
      arms,
      else_body,
    },
    pos,
  })
}

fn parse_asm(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  stream.eat_keyword(Keyword::Asm);
  let mut parts = Vec::new();
  loop {
    if let Some(text) = stream.try_string() {
      parts.push(AsmPart::Text(text));
    } else {
      parts.push(AsmPart::Name(stream.get_ident()?));
    }
    if !stream.eat_punct(Punct::Comma) {
      break;
    }
  }
  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::Asm { parts },
    pos,
  })
}

/// Assignments, destructuring assignments, and call statements.
fn parse_simple_stmt(stream: &mut TokenStream, pos: Position) -> CompileResult<Stmt> {
  let first = parse_value(stream)?;

  if stream.check_punct(Punct::Comma) {
    let mut targets = vec![first];
    while stream.eat_punct(Punct::Comma) {
      targets.push(parse_value(stream)?);
    }
    stream.skip_punct(Punct::Assign)?;
    let call = parse_value(stream)?;
    if !matches!(call.kind, ExprKind::Call { .. }) {
      return Err(CompileError::parse(
        call.pos,
        "destructuring assignment needs a call on the right-hand side",
      ));
    }
    stream.skip_punct(Punct::Semicolon)?;
    return Ok(Stmt {
      kind: StmtKind::MultiAssign { targets, call },
      pos,
    });
  }

  if stream.eat_punct(Punct::Assign) {
    let value = parse_initializer(stream)?;
    stream.skip_punct(Punct::Semicolon)?;
    return Ok(Stmt {
      kind: StmtKind::Assign {
        target: first,
        value,
      },
      pos,
    });
  }

  if !matches!(first.kind, ExprKind::Call { .. }) {
    return Err(CompileError::parse(
      first.pos,
      "expected an assignment or a call",
    ));
  }
  stream.skip_punct(Punct::Semicolon)?;
  Ok(Stmt {
    kind: StmtKind::Expr(first),
    pos,
  })
}

// ----- Type parsing -----

fn parse_type(stream: &mut TokenStream) -> CompileResult<TypeRef> {
  // `[T]` is a pointer to T.
  if stream.eat_punct(Punct::LBracket) {
    let inner = parse_type(stream)?;
    stream.skip_punct(Punct::RBracket)?;
    return parse_array_suffix(stream, TypeRef::Ptr(Box::new(inner)));
  }

  let pos = stream.pos();
  if stream.eat_keyword_if(Keyword::IndexOf) {
    let name = stream.get_ident()?;
    return Ok(TypeRef::IndexOf(name, pos));
  }

  let name = stream.get_ident()?;
  parse_array_suffix(stream, TypeRef::Named(name, pos))
}

fn parse_array_suffix(stream: &mut TokenStream, mut ty: TypeRef) -> CompileResult<TypeRef> {
  while stream.eat_punct(Punct::LBracket) {
    let extent = if stream.check_punct(Punct::RBracket) {
      None
    } else {
      Some(Box::new(parse_value(stream)?))
    };
    stream.skip_punct(Punct::RBracket)?;
    ty = TypeRef::Array {
      element: Box::new(ty),
      extent,
    };
  }
  Ok(ty)
}

// ----- Expression parsing -----
//
// Binding powers, loosest first: or, and, comparisons, `<< >>`,
// `& | ^`, `+ -`, `* / %`, unary, postfix. Levels 1-3 exist only in
// conditional contexts.

const LEVEL_OR: u8 = 1;
const LEVEL_AND: u8 = 2;
const LEVEL_CMP: u8 = 3;
const LEVEL_SHIFT: u8 = 4;

/// A condition: the full ladder including comparisons and logicals.
pub fn parse_cond(stream: &mut TokenStream) -> CompileResult<Expr> {
  parse_binary(stream, LEVEL_OR, true)
}

/// A value: the arithmetic ladder only. Finding a comparison or logical
/// operator here is the "comparison outside conditional context" error.
pub fn parse_value(stream: &mut TokenStream) -> CompileResult<Expr> {
  let expr = parse_binary(stream, LEVEL_SHIFT, false)?;
  if stream.peek_cmp_op().is_some() {
    return Err(CompileError::semantic(
      stream.pos(),
      "comparison is only allowed in a conditional context",
    ));
  }
  if matches!(
    stream.peek_keyword(),
    Some(Keyword::And) | Some(Keyword::Or)
  ) {
    return Err(CompileError::semantic(
      stream.pos(),
      "logical operator is only allowed in a conditional context",
    ));
  }
  Ok(expr)
}

fn parse_binary(stream: &mut TokenStream, min_level: u8, in_cond: bool) -> CompileResult<Expr> {
  if min_level <= LEVEL_AND {
    // `or` and `and` layers delegate downward and fold left.
    let next = if min_level == LEVEL_OR {
      LEVEL_AND
    } else {
      LEVEL_CMP
    };
    let (keyword, op) = if min_level == LEVEL_OR {
      (Keyword::Or, LogicalOp::Or)
    } else {
      (Keyword::And, LogicalOp::And)
    };
    let mut node = parse_binary(stream, next, in_cond)?;
    while stream.check_keyword(keyword) {
      let pos = stream.pos();
      stream.eat_keyword(keyword);
      let rhs = parse_binary(stream, next, in_cond)?;
      node = Expr::new(
        ExprKind::Logical {
          op,
          lhs: Box::new(node),
          rhs: Box::new(rhs),
        },
        pos,
      );
    }
    return Ok(node);
  }

  if min_level == LEVEL_CMP {
    let lhs = parse_binary(stream, LEVEL_SHIFT, in_cond)?;
    if let Some(op) = stream.peek_cmp_op() {
      let pos = stream.pos();
      stream.bump();
      let rhs = parse_binary(stream, LEVEL_SHIFT, in_cond)?;
      if stream.peek_cmp_op().is_some() {
        return Err(CompileError::parse(
          stream.pos(),
          "comparisons cannot be chained",
        ));
      }
      return Ok(Expr::new(
        ExprKind::Cmp {
          op,
          lhs: Box::new(lhs),
          rhs: Box::new(rhs),
        },
        pos,
      ));
    }
    return Ok(lhs);
  }

  // Plain left-associative arithmetic layers.
  let mut node = parse_arith_level(stream, min_level, in_cond)?;
  loop {
    let Some(op) = stream.peek_bin_op(min_level) else {
      break;
    };
    let pos = stream.pos();
    stream.bump();
    let rhs = parse_arith_level(stream, min_level, in_cond)?;
    node = Expr::new(
      ExprKind::Binary {
        op,
        lhs: Box::new(node),
        rhs: Box::new(rhs),
      },
      pos,
    );
  }
  Ok(node)
}

fn parse_arith_level(stream: &mut TokenStream, level: u8, in_cond: bool) -> CompileResult<Expr> {
  // 4: shifts, 5: bitwise, 6: additive, 7: multiplicative, then unary.
  if level >= 7 {
    parse_unary(stream, in_cond)
  } else {
    parse_binary(stream, level + 1, in_cond)
  }
}

fn parse_unary(stream: &mut TokenStream, in_cond: bool) -> CompileResult<Expr> {
  let pos = stream.pos();

  if stream.eat_punct(Punct::Minus) {
    let operand = parse_unary(stream, in_cond)?;
    return Ok(Expr::new(ExprKind::Neg(Box::new(operand)), pos));
  }

  if stream.check_keyword(Keyword::Not) {
    if !in_cond {
      return Err(CompileError::semantic(
        pos,
        "\"not\" is only allowed in a conditional context",
      ));
    }
    stream.eat_keyword(Keyword::Not);
    let operand = parse_binary(stream, LEVEL_CMP, true)?;
    return Ok(Expr::new(ExprKind::Not(Box::new(operand)), pos));
  }

  if stream.eat_punct(Punct::Amp) {
    let operand = parse_unary(stream, in_cond)?;
    return Ok(Expr::new(ExprKind::AddrOf(Box::new(operand)), pos));
  }

  if stream.eat_keyword_if(Keyword::Next) {
    let operand = parse_unary(stream, in_cond)?;
    return Ok(Expr::new(ExprKind::NextPtr(Box::new(operand)), pos));
  }

  if stream.eat_keyword_if(Keyword::Prev) {
    let operand = parse_unary(stream, in_cond)?;
    return Ok(Expr::new(ExprKind::PrevPtr(Box::new(operand)), pos));
  }

  if stream.eat_keyword_if(Keyword::SizeOf) {
    let operand = parse_unary(stream, in_cond)?;
    return Ok(Expr::new(ExprKind::SizeOf(Box::new(operand)), pos));
  }

  if stream.eat_keyword_if(Keyword::BytesOf) {
    let operand = parse_unary(stream, in_cond)?;
    return Ok(Expr::new(ExprKind::BytesOf(Box::new(operand)), pos));
  }

  if stream.eat_keyword_if(Keyword::IndexOf) {
    let operand = parse_unary(stream, in_cond)?;
    return Ok(Expr::new(ExprKind::IndexOf(Box::new(operand)), pos));
  }

  // `[expr]` dereferences a pointer.
  if stream.eat_punct(Punct::LBracket) {
    let inner = parse_binary(stream, LEVEL_SHIFT, false)?;
    stream.skip_punct(Punct::RBracket)?;
    let deref = Expr::new(ExprKind::Deref(Box::new(inner)), pos);
    return parse_postfix(stream, deref);
  }

  let primary = parse_primary(stream, in_cond)?;
  parse_postfix(stream, primary)
}

fn parse_postfix(stream: &mut TokenStream, mut node: Expr) -> CompileResult<Expr> {
  loop {
    let pos = stream.pos();
    if stream.eat_punct(Punct::LParen) {
      let mut args = Vec::new();
      if !stream.check_punct(Punct::RParen) {
        loop {
          args.push(parse_value(stream)?);
          if !stream.eat_punct(Punct::Comma) {
            break;
          }
        }
      }
      stream.skip_punct(Punct::RParen)?;
      node = Expr::new(
        ExprKind::Call {
          target: Box::new(node),
          args,
        },
        pos,
      );
    } else if stream.eat_punct(Punct::LBracket) {
      let index = parse_binary(stream, LEVEL_SHIFT, false)?;
      stream.skip_punct(Punct::RBracket)?;
      node = Expr::new(
        ExprKind::Index {
          base: Box::new(node),
          index: Box::new(index),
        },
        pos,
      );
    } else if stream.eat_punct(Punct::Dot) {
      let field = stream.get_ident()?;
      node = Expr::new(
        ExprKind::Field {
          base: Box::new(node),
          field,
          offset: None,
        },
        pos,
      );
    } else if stream.eat_keyword_if(Keyword::As) {
      let to = parse_type(stream)?;
      node = Expr::new(
        ExprKind::Cast {
          expr: Box::new(node),
          to,
        },
        pos,
      );
    } else {
      break;
    }
  }
  Ok(node)
}

fn parse_primary(stream: &mut TokenStream, in_cond: bool) -> CompileResult<Expr> {
  let pos = stream.pos();

  if stream.eat_punct(Punct::LParen) {
    // Parentheses keep their context: a parenthesized comparison is
    // still only valid where the whole expression is conditional.
    let level = if in_cond { LEVEL_OR } else { LEVEL_SHIFT };
    let node = parse_binary(stream, level, in_cond)?;
    stream.skip_punct(Punct::RParen)?;
    return Ok(node);
  }

  if let Some(token) = stream.peek() {
    match token.kind {
      TokenKind::Int | TokenKind::CharLit => {
        let value = token.value.unwrap_or(0);
        stream.bump();
        return Ok(Expr::int(value, pos));
      }
      TokenKind::StrLit => {
        let text = token.string.clone().unwrap_or_default();
        stream.bump();
        return Ok(Expr::new(ExprKind::Str(text), pos));
      }
      TokenKind::Keyword(Keyword::Nil) => {
        stream.bump();
        return Ok(Expr::new(ExprKind::Nil, pos));
      }
      TokenKind::Ident => {
        let name = token.text.clone();
        stream.bump();
        return Ok(Expr::new(ExprKind::Name(name), pos));
      }
      _ => {}
    }
  }

  Err(CompileError::parse(
    pos,
    format!("expected an expression, found {}", stream.describe_current()),
  ))
}

// ----- Token cursor -----

/// Lightweight cursor over the token vector.
pub struct TokenStream {
  tokens: Vec<Token>,
  pos: usize,
}

impl TokenStream {
  pub fn new(tokens: Vec<Token>) -> Self {
    Self { tokens, pos: 0 }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  fn bump(&mut self) {
    self.pos += 1;
  }

  fn pos(&self) -> Position {
    self
      .peek()
      .map(|t| t.pos.clone())
      .unwrap_or_else(Position::builtin)
  }

  fn peek_text(&self) -> &str {
    self.peek().map(|t| t.text.as_str()).unwrap_or("")
  }

  fn describe_current(&self) -> String {
    self
      .peek()
      .map(|t| t.describe())
      .unwrap_or_else(|| "end of input".to_string())
  }

  fn at_eof(&self) -> bool {
    matches!(self.peek().map(|t| t.kind), Some(TokenKind::Eof) | None)
  }

  fn expect_eof(&self) -> CompileResult<()> {
    if self.at_eof() {
      Ok(())
    } else {
      Err(CompileError::parse(
        self.pos(),
        format!("unexpected {}", self.describe_current()),
      ))
    }
  }

  fn peek_keyword(&self) -> Option<Keyword> {
    match self.peek().map(|t| t.kind) {
      Some(TokenKind::Keyword(keyword)) => Some(keyword),
      _ => None,
    }
  }

  fn check_keyword(&self, keyword: Keyword) -> bool {
    self.peek_keyword() == Some(keyword)
  }

  /// Consume a keyword known (by a prior peek) to be present.
  fn eat_keyword(&mut self, keyword: Keyword) {
    debug_assert!(self.check_keyword(keyword));
    self.bump();
  }

  fn eat_keyword_if(&mut self, keyword: Keyword) -> bool {
    if self.check_keyword(keyword) {
      self.bump();
      true
    } else {
      false
    }
  }

  fn skip_keyword(&mut self, keyword: Keyword) -> CompileResult<()> {
    if self.eat_keyword_if(keyword) {
      Ok(())
    } else {
      Err(CompileError::parse(
        self.pos(),
        format!(
          "expected keyword \"{keyword:?}\", found {}",
          self.describe_current()
        )
        .to_lowercase(),
      ))
    }
  }

  fn check_punct(&self, punct: Punct) -> bool {
    matches!(self.peek().map(|t| t.kind), Some(TokenKind::Punct(p)) if p == punct)
  }

  fn eat_punct(&mut self, punct: Punct) -> bool {
    if self.check_punct(punct) {
      self.bump();
      true
    } else {
      false
    }
  }

  fn skip_punct(&mut self, punct: Punct) -> CompileResult<()> {
    if self.eat_punct(punct) {
      Ok(())
    } else {
      let spelled = match punct {
        Punct::Semicolon => ";",
        Punct::Colon => ":",
        Punct::Comma => ",",
        Punct::Assign => ":=",
        Punct::LParen => "(",
        Punct::RParen => ")",
        Punct::LBracket => "[",
        Punct::RBracket => "]",
        Punct::LBrace => "{",
        Punct::RBrace => "}",
        _ => "operator",
      };
      Err(CompileError::parse(
        self.pos(),
        format!("expected \"{spelled}\", found {}", self.describe_current()),
      ))
    }
  }

  fn peek_cmp_op(&self) -> Option<CmpOp> {
    match self.peek().map(|t| t.kind) {
      Some(TokenKind::Punct(Punct::Eq)) => Some(CmpOp::Eq),
      Some(TokenKind::Punct(Punct::Ne)) => Some(CmpOp::Ne),
      Some(TokenKind::Punct(Punct::Lt)) => Some(CmpOp::Lt),
      Some(TokenKind::Punct(Punct::Le)) => Some(CmpOp::Le),
      Some(TokenKind::Punct(Punct::Gt)) => Some(CmpOp::Gt),
      Some(TokenKind::Punct(Punct::Ge)) => Some(CmpOp::Ge),
      _ => None,
    }
  }

  /// Binary operator at the given precedence level, if the current token
  /// is one.
  fn peek_bin_op(&self, level: u8) -> Option<BinOp> {
    let punct = match self.peek().map(|t| t.kind) {
      Some(TokenKind::Punct(p)) => p,
      _ => return None,
    };
    let (op, op_level) = match punct {
      Punct::Shl => (BinOp::Shl, LEVEL_SHIFT),
      Punct::Shr => (BinOp::Shr, LEVEL_SHIFT),
      Punct::Amp => (BinOp::BitAnd, 5),
      Punct::Pipe => (BinOp::BitOr, 5),
      Punct::Caret => (BinOp::BitXor, 5),
      Punct::Plus => (BinOp::Add, 6),
      Punct::Minus => (BinOp::Sub, 6),
      Punct::Star => (BinOp::Mul, 7),
      Punct::Slash => (BinOp::Div, 7),
      Punct::Percent => (BinOp::Mod, 7),
      _ => return None,
    };
    if op_level == level { Some(op) } else { None }
  }

  fn get_ident(&mut self) -> CompileResult<String> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Ident
    {
      let text = token.text.clone();
      self.bump();
      return Ok(text);
    }
    Err(CompileError::parse(
      self.pos(),
      format!("expected an identifier, found {}", self.describe_current()),
    ))
  }

  fn get_string(&mut self) -> CompileResult<String> {
    self.try_string().ok_or_else(|| {
      CompileError::parse(
        self.pos(),
        format!("expected a string literal, found {}", self.describe_current()),
      )
    })
  }

  fn try_string(&mut self) -> Option<String> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::StrLit
    {
      let text = token.string.clone().unwrap_or_default();
      self.bump();
      return Some(text);
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::preprocessor::preprocess_source;

  fn parse_str(source: &str) -> CompileResult<Program> {
    let tokens = preprocess_source(source, "test.cow", &[])?;
    parse(tokens)
  }

  fn parse_ok(source: &str) -> Program {
    parse_str(source).expect("parse failure")
  }

  #[test]
  fn var_declarations() {
    let program = parse_ok("var x: uint8; var p: [uint8]; var a: uint8[10];");
    assert_eq!(program.body.len(), 3);
    let StmtKind::Var(decl) = &program.body[1].kind else {
      panic!("expected var");
    };
    assert!(matches!(decl.ty, Some(TypeRef::Ptr(_))));
  }

  #[test]
  fn inferred_var_rejects_bare_literal() {
    assert!(parse_str("var x := 5;").is_err());
    assert!(parse_str("var x := 5 as uint8;").is_ok());
  }

  #[test]
  fn operator_precedence_groups_mul_before_add() {
    let program = parse_ok("var x: uint8; x := 1 + 2 * 3;");
    let StmtKind::Assign { value, .. } = &program.body[1].kind else {
      panic!("expected assignment");
    };
    let ExprKind::Binary { op: BinOp::Add, rhs, .. } = &value.kind else {
      panic!("expected addition at the top");
    };
    assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
  }

  #[test]
  fn shifts_bind_looser_than_bitwise() {
    let program = parse_ok("var x: uint8; x := 1 & 3 << 2;");
    let StmtKind::Assign { value, .. } = &program.body[1].kind else {
      panic!("expected assignment");
    };
    // `& ` binds tighter, so the shift is the root.
    assert!(matches!(
      value.kind,
      ExprKind::Binary { op: BinOp::Shl, .. }
    ));
  }

  #[test]
  fn comparison_outside_conditional_is_rejected() {
    let result = parse_str("var x: uint8; x := 1 == 2;");
    assert!(matches!(result, Err(CompileError::Semantic { .. })));
  }

  #[test]
  fn comparison_inside_if_is_accepted() {
    let program = parse_ok("var x: uint8; if x == 2 then x := 3; end if;");
    let StmtKind::If { arms, .. } = &program.body[1].kind else {
      panic!("expected if");
    };
    assert!(matches!(arms[0].cond.kind, ExprKind::Cmp { .. }));
  }

  #[test]
  fn logical_operators_nest_conditions() {
    let program = parse_ok("var x: uint8; while x < 9 and not (x == 4) loop end loop;");
    let StmtKind::While { cond, .. } = &program.body[1].kind else {
      panic!("expected while");
    };
    let ExprKind::Logical { op: LogicalOp::And, rhs, .. } = &cond.kind else {
      panic!("expected and");
    };
    assert!(matches!(rhs.kind, ExprKind::Not(_)));
  }

  #[test]
  fn record_with_base_and_at() {
    let program = parse_ok(
      "record Point is x: int16; y: int16; end record;\
       record Packet is tag: uint8; word: uint16 @at(0); end record;\
       record Point3D: Point is z: int16; end record;",
    );
    let StmtKind::Record(packet) = &program.body[1].kind else {
      panic!("expected record");
    };
    assert!(packet.fields[1].at.is_some());
    let StmtKind::Record(derived) = &program.body[2].kind else {
      panic!("expected record");
    };
    assert_eq!(derived.base.as_deref(), Some("Point"));
  }

  #[test]
  fn sub_with_params_and_returns() {
    let program = parse_ok(
      "sub AddOne(n: uint8): (r: uint8) is r := n + 1; end sub;",
    );
    let StmtKind::Sub(sub) = &program.body[0].kind else {
      panic!("expected sub");
    };
    assert_eq!(sub.params.len(), 1);
    assert_eq!(sub.returns.len(), 1);
    assert!(matches!(sub.kind, SubKind::Define));
  }

  #[test]
  fn forward_decl_and_impl() {
    let program = parse_ok(
      "@decl sub Later(n: uint8);\
       @impl sub Later is end sub;\
       @decl sub PutChar(c: uint8) @extern(\"putchar\");",
    );
    let StmtKind::Sub(fwd) = &program.body[0].kind else {
      panic!("expected sub");
    };
    assert!(matches!(fwd.kind, SubKind::Forward { .. }));
    let StmtKind::Sub(ext) = &program.body[2].kind else {
      panic!("expected sub");
    };
    let SubKind::Forward { extern_name } = &ext.kind else {
      panic!("expected forward");
    };
    assert_eq!(extern_name.as_deref(), Some("putchar"));
  }

  #[test]
  fn interface_and_implements() {
    let program = parse_ok(
      "interface Handler(code: uint8): (ok: uint8);\
       sub OnByte implements Handler is ok := code; end sub;",
    );
    let StmtKind::Sub(sub) = &program.body[1].kind else {
      panic!("expected sub");
    };
    assert_eq!(sub.implements.as_deref(), Some("Handler"));
  }

  #[test]
  fn case_with_multi_value_arms() {
    let program = parse_ok(
      "var x: uint8;\
       case x is\
       when 1, 2: x := 0;\
       when 3: x := 1;\
       when else: x := 9;\
       end case;",
    );
    let StmtKind::Case { arms, else_body, .. } = &program.body[1].kind else {
      panic!("expected case");
    };
    assert_eq!(arms[0].values.len(), 2);
    assert_eq!(arms.len(), 2);
    assert_eq!(else_body.len(), 1);
  }

  #[test]
  fn deref_and_index_postfix() {
    let program = parse_ok("var p: [uint8]; var a: uint8[4]; [p] := a[2];");
    let StmtKind::Assign { target, value } = &program.body[2].kind else {
      panic!("expected assignment");
    };
    assert!(matches!(target.kind, ExprKind::Deref(_)));
    assert!(matches!(value.kind, ExprKind::Index { .. }));
  }

  #[test]
  fn multi_assignment_requires_call() {
    assert!(parse_str("var a: uint8; var b: uint8; a, b := 5;").is_err());
    let program = parse_ok(
      "sub DivMod(n: uint8, d: uint8): (q: uint8, r: uint8) is end sub;\
       var a: uint8; var b: uint8; a, b := DivMod(7 as uint8, 2 as uint8);",
    );
    assert!(matches!(
      program.body[3].kind,
      StmtKind::MultiAssign { .. }
    ));
  }

  #[test]
  fn asm_parts() {
    let program = parse_ok("var x: uint8; @asm \"LDA\", x;");
    let StmtKind::Asm { parts } = &program.body[1].kind else {
      panic!("expected asm");
    };
    assert_eq!(parts.len(), 2);
    assert!(matches!(&parts[1], AsmPart::Name(name) if name == "x"));
  }

  #[test]
  fn nested_sub_is_a_statement() {
    let program = parse_ok(
      "sub Outer is var x: uint8; sub Inner is x := 1; end sub; Inner(); end sub;",
    );
    let StmtKind::Sub(outer) = &program.body[0].kind else {
      panic!("expected sub");
    };
    let body = outer.body.as_ref().expect("body");
    assert!(matches!(body[1].kind, StmtKind::Sub(_)));
  }

  #[test]
  fn pointer_ops() {
    let program = parse_ok("var p: [uint16]; p := @next p; p := @prev p;");
    assert!(matches!(
      program.body[1].kind,
      StmtKind::Assign { ref value, .. } if matches!(value.kind, ExprKind::NextPtr(_))
    ));
  }
}
