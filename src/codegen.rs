//! Code generation: lower the optimized AST into 8080 assembly text.
//!
//! Expressions evaluate into HL (16-bit) or A (8-bit); binary operators
//! compute the left subtree, push, compute the right subtree, pop and
//! combine. Multiply, divide and the 16-bit shifts of non-constant
//! operands call runtime helpers; the runtime is spliced in by the
//! assembler via `INCLUDE 'runtime.mac'`.
//!
//! There are no stack frames. Every variable has a fixed address:
//! globals get `DS` reservations, and the locals of each subroutine live
//! at `EQU` offsets into one shared workspace, packed so that only
//! subroutines which can be live at the same time occupy disjoint
//! ranges. The no-recursion rule is what makes that sound.
//!
//! The emitted stream is a vector of [`Line`]s rather than text so the
//! peephole pass can pattern-match instructions before rendering.

use crate::error::{CompileError, CompileResult, Position};
use crate::parser::{
  AsmPart, BinOp, CmpOp, Expr, ExprKind, LogicalOp, Program, Stmt, StmtKind, SubDecl,
};
use crate::sema::{Analysis, SubId, VarId};
use crate::ty::TypeId;
use std::collections::HashMap;

/// One line of the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
  Inst { op: String, args: String },
  Label(String),
  /// Pre-formatted data directives and `@asm` passthrough.
  Raw(String),
  Comment(String),
  Blank,
}

impl Line {
  pub fn inst(op: &str, args: impl Into<String>) -> Self {
    Line::Inst {
      op: op.to_string(),
      args: args.into(),
    }
  }
}

/// Render the instruction stream in the syntax the macro assembler
/// accepts.
pub fn render(lines: &[Line]) -> String {
  let mut out = String::new();
  for line in lines {
    match line {
      Line::Inst { op, args } => {
        if args.is_empty() {
          out.push_str(&format!("\t{op}\n"));
        } else {
          out.push_str(&format!("\t{op}\t{args}\n"));
        }
      }
      Line::Label(name) => out.push_str(&format!("{name}:\n")),
      Line::Raw(text) => out.push_str(&format!("{text}\n")),
      Line::Comment(text) => out.push_str(&format!("; {text}\n")),
      Line::Blank => out.push('\n'),
    }
  }
  out
}

/// Register names the assembler reserves; variables and subroutines
/// whose names collide get a mangling prefix.
const REGISTER_NAMES: &[&str] = &["A", "B", "C", "D", "E", "H", "L", "M", "SP", "PSW"];

/// Generate the whole program.
pub fn generate<'a>(program: &'a Program, analysis: &'a Analysis) -> CompileResult<Vec<Line>> {
  let mut generator = CodeGen::new(analysis);
  generator.layout_variables();
  generator.plan_inlining(program)?;
  generator.gen_program(program)?;
  Ok(generator.code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
  A,
  HL,
}

struct CodeGen<'a> {
  analysis: &'a Analysis,
  code: Vec<Line>,
  label_counter: u32,
  /// Interned string literals, in first-use order.
  strings: Vec<(String, String)>,
  break_labels: Vec<String>,
  continue_labels: Vec<String>,
  /// Mangled operand label for every variable.
  var_labels: HashMap<VarId, String>,
  /// Workspace offset for frame-allocated variables.
  frame_offsets: HashMap<VarId, u32>,
  workspace_size: u32,
  /// Bodies of subroutines expanded at their call sites.
  inlined: HashMap<SubId, &'a [Stmt]>,
  /// Suppress instruction emission while measuring a body.
  measuring: bool,
  measured: usize,
}

impl<'a> CodeGen<'a> {
  fn new(analysis: &'a Analysis) -> Self {
    Self {
      analysis,
      code: Vec::new(),
      label_counter: 0,
      strings: Vec::new(),
      break_labels: Vec::new(),
      continue_labels: Vec::new(),
      var_labels: HashMap::new(),
      frame_offsets: HashMap::new(),
      workspace_size: 0,
      inlined: HashMap::new(),
      measuring: false,
      measured: 0,
    }
  }

  // ----- Emission primitives -----

  fn emit(&mut self, op: &str, args: impl Into<String>) {
    if self.measuring {
      self.measured += 1;
      return;
    }
    self.code.push(Line::inst(op, args));
  }

  fn emit_label(&mut self, name: impl Into<String>) {
    if self.measuring {
      return;
    }
    self.code.push(Line::Label(name.into()));
  }

  fn emit_comment(&mut self, text: impl Into<String>) {
    if self.measuring {
      return;
    }
    self.code.push(Line::Comment(text.into()));
  }

  fn emit_blank(&mut self) {
    if !self.measuring {
      self.code.push(Line::Blank);
    }
  }

  fn new_label(&mut self, prefix: &str) -> String {
    self.label_counter += 1;
    format!("{prefix}{}", self.label_counter)
  }

  fn string_label(&mut self, text: &str) -> String {
    if self.measuring {
      return "STR0".to_string();
    }
    if let Some((label, _)) = self.strings.iter().find(|(_, t)| t == text) {
      return label.clone();
    }
    let label = self.new_label("STR");
    self.strings.push((label.clone(), text.to_string()));
    label
  }

  // ----- Names and sizes -----

  /// A subroutine's name, qualified by its lexical parents so nested
  /// subs of the same name in different parents stay distinct.
  fn sub_qualified_name(&self, id: SubId) -> String {
    let info = self.analysis.sub(id);
    match info.parent {
      Some(parent) => format!("{}_{}", self.sub_qualified_name(parent), info.name),
      None => info.name.clone(),
    }
  }

  fn sub_label(&self, id: SubId) -> String {
    let info = self.analysis.sub(id);
    if let Some(extern_name) = &info.extern_name {
      return extern_name.clone();
    }
    mangle_sub(&self.sub_qualified_name(id))
  }

  fn var_label(&self, id: VarId) -> String {
    self.var_labels[&id].clone()
  }

  fn size_of_expr(&self, expr: &Expr) -> u16 {
    expr
      .ty
      .map(|t| self.analysis.types.size_of(t))
      .unwrap_or(2)
  }

  fn expr_ty(&self, expr: &Expr, what: &str) -> CompileResult<TypeId> {
    expr.ty.ok_or_else(|| {
      CompileError::internal(
        expr.pos.clone(),
        format!("{what} reached code generation without a type"),
      )
    })
  }

  // ----- Variable layout -----

  /// Assign every variable an address: globals stand alone, locals pack
  /// into overlay ranges of one workspace, based on the call graph.
  fn layout_variables(&mut self) {
    let sub_count = self.analysis.subs.len();

    // Per-subroutine frame sizes.
    let mut frame_size = vec![0u32; sub_count];
    for var in &self.analysis.vars {
      if let Some(owner) = var.owner {
        frame_size[owner.0 as usize] += self.analysis.types.size_of(var.ty) as u32;
      }
    }

    // frame_base(sub) = max over callers of caller's base + size.
    // Top-level code owns no frame, so its callees start at zero. The
    // call graph is acyclic, so relaxation converges within n rounds.
    let mut frame_base = vec![0u32; sub_count];
    for _ in 0..sub_count {
      let mut changed = false;
      for caller in 0..sub_count {
        let floor = frame_base[caller] + frame_size[caller];
        for callee in &self.analysis.subs[caller].calls {
          let base = &mut frame_base[callee.0 as usize];
          if *base < floor {
            *base = floor;
            changed = true;
          }
        }
      }
      if !changed {
        break;
      }
    }

    // Hand out offsets within each frame in declaration order.
    let mut cursor: Vec<u32> = frame_base.clone();
    self.workspace_size = 0;
    for (index, var) in self.analysis.vars.iter().enumerate() {
      let id = VarId(index as u32);
      match var.owner {
        Some(owner) => {
          let offset = cursor[owner.0 as usize];
          cursor[owner.0 as usize] += self.analysis.types.size_of(var.ty) as u32;
          self.frame_offsets.insert(id, offset);
          self.workspace_size = self
            .workspace_size
            .max(offset + self.analysis.types.size_of(var.ty) as u32);
          let sub_name = self.sub_qualified_name(owner);
          self
            .var_labels
            .insert(id, format!("v_{sub_name}_{}", var.name));
        }
        None => {
          self.var_labels.insert(id, format!("v_{}", var.name));
        }
      }
    }
  }

  // ----- Inlining -----

  /// Decide which subroutines to expand at their call sites. Candidates
  /// have no parameters, returns, locals, loops or early returns; a
  /// single call site always inlines, more sites inline only when the
  /// emitted bytes shrink: `N*body < body + 3*N + 1`.
  fn plan_inlining(&mut self, program: &'a Program) -> CompileResult<()> {
    let mut counts: HashMap<SubId, usize> = HashMap::new();
    count_direct_calls(&program.body, &mut counts);

    let mut subs = Vec::new();
    collect_subs(&program.body, &mut subs);

    for decl in subs {
      let Some(id) = decl.id else { continue };
      let Some(body) = &decl.body else { continue };
      let info = self.analysis.sub(id);

      let has_locals = self
        .analysis
        .vars
        .iter()
        .any(|v| v.owner == Some(id));
      let candidate = info.params.is_empty()
        && info.returns.is_empty()
        && info.implements.is_none()
        && info.extern_name.is_none()
        && !has_locals
        && body_is_inlinable(body);
      if !candidate {
        continue;
      }

      let call_count = counts.get(&id).copied().unwrap_or(0);
      if call_count == 0 {
        continue;
      }

      let inline = if call_count == 1 {
        true
      } else {
        let size = self.measure_body(body)?;
        call_count * size < size + 3 * call_count + 1
      };
      if inline {
        self.inlined.insert(id, body.as_slice());
      }
    }
    Ok(())
  }

  fn measure_body(&mut self, body: &[Stmt]) -> CompileResult<usize> {
    self.measuring = true;
    self.measured = 0;
    let result = self.gen_stmts(body);
    self.measuring = false;
    result?;
    Ok(self.measured)
  }

  fn gen_program(&mut self, program: &Program) -> CompileResult<()> {
    self.emit_comment("Generated by rucow");
    self.emit_blank();
    self.code.push(Line::Raw("\t.8080".to_string()));
    self.emit_blank();
    self.code.push(Line::Raw("\tCSEG".to_string()));
    self.emit_blank();
    self.emit("JMP", "_main");
    self.emit_blank();
    self.code.push(Line::Raw("\tINCLUDE\t'runtime.mac'".to_string()));
    self.emit_blank();

    // Subroutine bodies first, then the top-level code.
    let mut subs = Vec::new();
    collect_subs(&program.body, &mut subs);
    for decl in &subs {
      self.gen_sub(decl)?;
    }

    self.emit_blank();
    self.emit_comment("Main program");
    self.emit_label("_main");
    self.gen_stmts(&program.body)?;
    self.emit("JMP", "0");
    self.emit_blank();

    self.gen_data_sections(program)?;
    Ok(())
  }

  fn gen_sub(&mut self, decl: &SubDecl) -> CompileResult<()> {
    let Some(body) = &decl.body else {
      return Ok(());
    };
    let id = decl.id.ok_or_else(|| {
      CompileError::internal(decl.pos.clone(), "subroutine without an id survived sema")
    })?;
    if self.inlined.contains_key(&id) {
      return Ok(());
    }

    self.emit_blank();
    self.emit_comment(format!("Subroutine {}", decl.name));
    self.emit_label(self.sub_label(id));
    self.gen_stmts(body)?;
    self.emit("RET", "");
    Ok(())
  }

  // ----- Statements -----

  fn gen_stmts(&mut self, stmts: &[Stmt]) -> CompileResult<()> {
    for stmt in stmts {
      self.gen_stmt(stmt)?;
    }
    Ok(())
  }

  fn gen_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
    match &stmt.kind {
      // Subroutines are emitted separately; type and constant
      // declarations produce no code.
      StmtKind::Sub(_)
      | StmtKind::Const { .. }
      | StmtKind::Typedef { .. }
      | StmtKind::Record(_)
      | StmtKind::Interface(_) => Ok(()),

      StmtKind::Var(decl) => {
        let Some(init) = &decl.init else {
          return Ok(());
        };
        let var = decl.var.ok_or_else(|| {
          CompileError::internal(stmt.pos.clone(), "variable without an id survived sema")
        })?;
        // Constant initializers of globals live in the data section.
        if self.analysis.var(var).owner.is_none() && is_const_init(init) {
          return Ok(());
        }
        self.gen_store_to_var(var, init, &stmt.pos)
      }

      StmtKind::Assign { target, value } => self.gen_assign(target, value),

      StmtKind::MultiAssign { targets, call } => {
        let returns = self.gen_call_stmt(call)?;
        if returns.len() != targets.len() {
          return Err(CompileError::internal(
            stmt.pos.clone(),
            "destructuring arity survived sema mismatched",
          ));
        }
        for (target, ret) in targets.iter().zip(&returns) {
          let ret_label = self.var_label(*ret);
          let size = self.analysis.types.size_of(self.analysis.var(*ret).ty);
          if size == 1 {
            self.emit("LDA", ret_label);
          } else {
            self.emit("LHLD", ret_label);
          }
          self.store_register_to(target, size)?;
        }
        Ok(())
      }

      StmtKind::If { arms, else_body } => {
        let end = self.new_label("ENDIF");
        for (index, arm) in arms.iter().enumerate() {
          let last_arm = index + 1 == arms.len() && else_body.is_empty();
          let next = if last_arm {
            end.clone()
          } else {
            self.new_label("ELSE")
          };
          self.gen_branch(&arm.cond, &next, false)?;
          self.gen_stmts(&arm.body)?;
          if !last_arm {
            self.emit("JMP", end.clone());
            self.emit_label(next);
          }
        }
        self.gen_stmts(else_body)?;
        self.emit_label(end);
        Ok(())
      }

      StmtKind::While { cond, body } => {
        let top = self.new_label("WHILE");
        let end = self.new_label("ENDW");
        self.break_labels.push(end.clone());
        self.continue_labels.push(top.clone());

        self.emit_label(top.clone());
        self.gen_branch(cond, &end, false)?;
        self.gen_stmts(body)?;
        self.emit("JMP", top);
        self.emit_label(end);

        self.break_labels.pop();
        self.continue_labels.pop();
        Ok(())
      }

      StmtKind::Loop { body } => {
        let top = self.new_label("LOOP");
        let end = self.new_label("ENDL");
        self.break_labels.push(end.clone());
        self.continue_labels.push(top.clone());

        self.emit_label(top.clone());
        self.gen_stmts(body)?;
        self.emit("JMP", top);
        self.emit_label(end);

        self.break_labels.pop();
        self.continue_labels.pop();
        Ok(())
      }

      StmtKind::Break => match self.break_labels.last() {
        Some(label) => {
          let label = label.clone();
          self.emit("JMP", label);
          Ok(())
        }
        None => Err(CompileError::internal(
          stmt.pos.clone(),
          "break outside loop survived sema",
        )),
      },

      StmtKind::Continue => match self.continue_labels.last() {
        Some(label) => {
          let label = label.clone();
          self.emit("JMP", label);
          Ok(())
        }
        None => Err(CompileError::internal(
          stmt.pos.clone(),
          "continue outside loop survived sema",
        )),
      },

      StmtKind::Return => {
        self.emit("RET", "");
        Ok(())
      }

      StmtKind::Case {
        scrutinee,
        arms,
        else_body,
      } => self.gen_case(scrutinee, arms, else_body),

      StmtKind::Asm { parts } => {
        let mut text = String::new();
        for part in parts {
          let piece = match part {
            AsmPart::Text(t) => t.clone(),
            AsmPart::Var(id) => self.var_label(*id),
            AsmPart::Const(value) => value.to_string(),
            AsmPart::Sub(id) => self.sub_label(*id),
            AsmPart::Name(name) => {
              return Err(CompileError::internal(
                stmt.pos.clone(),
                format!("unresolved @asm operand \"{name}\" survived sema"),
              ));
            }
          };
          // Separate an instruction from its operands.
          if !text.is_empty()
            && !text.ends_with(char::is_whitespace)
            && !piece.starts_with(char::is_whitespace)
          {
            text.push('\t');
          }
          text.push_str(&piece);
        }
        if self.measuring {
          self.measured += 1;
        } else {
          self.code.push(Line::Raw(format!("\t{text}")));
        }
        Ok(())
      }

      StmtKind::Expr(expr) => {
        self.gen_call_stmt(expr)?;
        Ok(())
      }
    }
  }

  fn gen_case(
    &mut self,
    scrutinee: &Expr,
    arms: &[crate::parser::CaseArm],
    else_body: &[Stmt],
  ) -> CompileResult<()> {
    let size = self.size_of_expr(scrutinee);
    let end = self.new_label("ENDC");
    let else_label = self.new_label("ELSEC");

    let mut arm_labels = Vec::new();
    if size == 1 {
      self.gen_expr(scrutinee, Target::A)?;
      // CPI leaves the scrutinee in A for the next test.
      for arm in arms {
        let label = self.new_label("WHEN");
        for value in &arm.values {
          let v = value.as_int().unwrap_or(0) & 0xFF;
          self.emit("CPI", v.to_string());
          self.emit("JZ", label.clone());
        }
        arm_labels.push(label);
      }
    } else {
      self.gen_expr(scrutinee, Target::HL)?;
      for arm in arms {
        let label = self.new_label("WHEN");
        for value in &arm.values {
          let v = value.as_int().unwrap_or(0) & 0xFFFF;
          let skip = self.new_label("NEXTW");
          self.emit("MOV", "A,H");
          self.emit("CPI", (v >> 8).to_string());
          self.emit("JNZ", skip.clone());
          self.emit("MOV", "A,L");
          self.emit("CPI", (v & 0xFF).to_string());
          self.emit("JZ", label.clone());
          self.emit_label(skip);
        }
        arm_labels.push(label);
      }
    }
    self.emit("JMP", else_label.clone());

    for (arm, label) in arms.iter().zip(arm_labels) {
      self.emit_label(label);
      self.gen_stmts(&arm.body)?;
      self.emit("JMP", end.clone());
    }

    self.emit_label(else_label);
    self.gen_stmts(else_body)?;
    self.emit_label(end);
    Ok(())
  }

  // ----- Assignment -----

  fn gen_assign(&mut self, target: &Expr, value: &Expr) -> CompileResult<()> {
    let target_ty = self.expr_ty(target, "assignment target")?;
    let size = self.analysis.types.size_of(target_ty);

    // Aggregate assignment copies memory.
    if self.analysis.types.as_record(target_ty).is_some()
      || self.analysis.types.is_array(target_ty)
    {
      return self.gen_aggregate_copy(target, value, size);
    }

    if size > 2 {
      return self.gen_wide_assign(target, value);
    }

    if let ExprKind::Var(var) = target.kind {
      return self.gen_store_to_var(var, value, &target.pos);
    }

    // Value first, then the address, exactly like the stores the
    // peephole pass knows how to tighten.
    self.gen_expr(value, Target::HL)?;
    self.emit("PUSH", "H");
    self.gen_lvalue_address(target)?;
    self.emit("XCHG", "");
    self.emit("POP", "H");
    if size == 1 {
      self.emit("MOV", "A,L");
      self.emit("STAX", "D");
    } else {
      self.emit("XCHG", "");
      self.emit("MOV", "M,E");
      self.emit("INX", "H");
      self.emit("MOV", "M,D");
    }
    Ok(())
  }

  /// Store a value into a directly-addressed variable.
  fn gen_store_to_var(&mut self, var: VarId, value: &Expr, pos: &Position) -> CompileResult<()> {
    let var_ty = self.analysis.var(var).ty;
    let size = self.analysis.types.size_of(var_ty);
    let label = self.var_label(var);

    // Interface variables store a subroutine's address.
    if let ExprKind::SubRef(sub) = value.kind {
      let target = self.sub_label(sub);
      self.emit("LXI", format!("H,{target}"));
      self.emit("SHLD", label);
      return Ok(());
    }

    if self.analysis.types.as_record(var_ty).is_some() || self.analysis.types.is_array(var_ty)
    {
      // Runtime aggregate initialization: element-wise stores.
      return self.gen_aggregate_init(var, value, pos);
    }

    if size > 2 {
      return self.gen_wide_store(var, value, pos);
    }

    if size == 1 {
      self.gen_expr(value, Target::A)?;
      self.emit("STA", label);
    } else {
      self.gen_expr(value, Target::HL)?;
      self.emit("SHLD", label);
    }
    Ok(())
  }

  fn gen_aggregate_init(&mut self, var: VarId, value: &Expr, pos: &Position) -> CompileResult<()> {
    let var_ty = self.analysis.var(var).ty;
    let label = self.var_label(var);
    match &value.kind {
      ExprKind::ArrayInit(elements) => {
        let element_ty = self.analysis.types.element_of(var_ty).ok_or_else(|| {
          CompileError::internal(pos.clone(), "brace initializer on non-array survived sema")
        })?;
        let element_size = self.analysis.types.size_of(element_ty);
        let mut offset = 0u32;
        for element in elements {
          if element_size == 1 {
            self.gen_expr(element, Target::A)?;
            self.emit("STA", format!("{label}+{offset}"));
          } else {
            self.gen_expr(element, Target::HL)?;
            self.emit("SHLD", format!("{label}+{offset}"));
          }
          offset += element_size as u32;
        }
        Ok(())
      }
      ExprKind::Str(text) => {
        // A string initializer for a byte array copies the bytes.
        let text = text.clone();
        let source = self.string_label(&text);
        let count = text.len() as u32 + 1;
        self.emit("LXI", format!("D,{source}"));
        self.emit("LXI", format!("H,{label}"));
        self.emit("LXI", format!("B,{count}"));
        self.emit("CALL", "_memcpy");
        Ok(())
      }
      ExprKind::Var(source) => {
        let source_label = self.var_label(*source);
        let count = self.analysis.types.size_of(var_ty);
        self.emit("LXI", format!("D,{source_label}"));
        self.emit("LXI", format!("H,{label}"));
        self.emit("LXI", format!("B,{count}"));
        self.emit("CALL", "_memcpy");
        Ok(())
      }
      _ => Err(CompileError::type_error(
        pos.clone(),
        "aggregates can only be initialized from literals or whole variables",
      )),
    }
  }

  fn gen_aggregate_copy(&mut self, target: &Expr, value: &Expr, size: u16) -> CompileResult<()> {
    self.gen_lvalue_address(value)?;
    self.emit("XCHG", "");
    self.gen_lvalue_address(target)?;
    self.emit("LXI", format!("B,{size}"));
    self.emit("CALL", "_memcpy");
    Ok(())
  }

  /// 32-bit stores support constants and whole-variable copies; wider
  /// arithmetic has no 8080 lowering here.
  fn gen_wide_store(&mut self, var: VarId, value: &Expr, pos: &Position) -> CompileResult<()> {
    let label = self.var_label(var);
    match &value.kind {
      ExprKind::Int(v) => {
        let v = *v;
        self.emit("LXI", format!("H,{}", v & 0xFFFF));
        self.emit("SHLD", label.clone());
        self.emit("LXI", format!("H,{}", (v >> 16) & 0xFFFF));
        self.emit("SHLD", format!("{label}+2"));
        Ok(())
      }
      ExprKind::Var(source) => {
        let source_label = self.var_label(*source);
        self.emit("LHLD", source_label.clone());
        self.emit("SHLD", label.clone());
        self.emit("LHLD", format!("{source_label}+2"));
        self.emit("SHLD", format!("{label}+2"));
        Ok(())
      }
      _ => Err(CompileError::type_error(
        pos.clone(),
        "32-bit values only support constant and variable-to-variable assignment",
      )),
    }
  }

  fn gen_wide_assign(&mut self, target: &Expr, value: &Expr) -> CompileResult<()> {
    match target.kind {
      ExprKind::Var(var) => self.gen_wide_store(var, value, &target.pos),
      _ => Err(CompileError::type_error(
        target.pos.clone(),
        "32-bit values only support direct variable assignment",
      )),
    }
  }

  fn store_register_to(&mut self, target: &Expr, size: u16) -> CompileResult<()> {
    match target.kind {
      ExprKind::Var(var) => {
        let label = self.var_label(var);
        if size == 1 {
          self.emit("STA", label);
        } else {
          self.emit("SHLD", label);
        }
        Ok(())
      }
      _ => Err(CompileError::type_error(
        target.pos.clone(),
        "destructuring targets must be plain variables",
      )),
    }
  }

  // ----- Expressions -----

  fn gen_expr(&mut self, expr: &Expr, target: Target) -> CompileResult<()> {
    let size = self.size_of_expr(expr);
    match &expr.kind {
      ExprKind::Int(value) => {
        match target {
          Target::A => self.emit("MVI", format!("A,{}", value & 0xFF)),
          Target::HL => self.emit("LXI", format!("H,{}", value & 0xFFFF)),
        }
        Ok(())
      }

      ExprKind::Str(text) => {
        let text = text.clone();
        let label = self.string_label(&text);
        self.emit("LXI", format!("H,{label}"));
        if target == Target::A {
          self.emit("MOV", "A,L");
        }
        Ok(())
      }

      ExprKind::Nil => {
        match target {
          Target::A => self.emit("MVI", "A,0"),
          Target::HL => self.emit("LXI", "H,0"),
        }
        Ok(())
      }

      ExprKind::Var(var) => {
        let label = self.var_label(*var);
        if size == 1 {
          self.emit("LDA", label);
          if target == Target::HL {
            self.emit("MOV", "L,A");
            self.emit("MVI", "H,0");
          }
        } else {
          self.emit("LHLD", label);
          if target == Target::A {
            self.emit("MOV", "A,L");
          }
        }
        Ok(())
      }

      ExprKind::SubRef(sub) => {
        let label = self.sub_label(*sub);
        self.emit("LXI", format!("H,{label}"));
        if target == Target::A {
          self.emit("MOV", "A,L");
        }
        Ok(())
      }

      ExprKind::Neg(inner) => {
        if size == 1 {
          self.gen_expr(inner, Target::A)?;
          self.emit("CMA", "");
          self.emit("INR", "A");
          if target == Target::HL {
            self.emit("MOV", "L,A");
            self.emit("MVI", "H,0");
          }
        } else {
          self.gen_expr(inner, Target::HL)?;
          self.emit("MOV", "A,L");
          self.emit("CMA", "");
          self.emit("MOV", "L,A");
          self.emit("MOV", "A,H");
          self.emit("CMA", "");
          self.emit("MOV", "H,A");
          self.emit("INX", "H");
          if target == Target::A {
            self.emit("MOV", "A,L");
          }
        }
        Ok(())
      }

      ExprKind::Binary { op, lhs, rhs } => self.gen_binop(expr, *op, lhs, rhs, target),

      ExprKind::Deref(inner) => {
        self.gen_expr(inner, Target::HL)?;
        self.load_through_hl(size, target);
        Ok(())
      }

      ExprKind::Index { .. } | ExprKind::Field { .. } => {
        self.gen_lvalue_address(expr)?;
        self.load_through_hl(size, target);
        Ok(())
      }

      ExprKind::AddrOf(inner) => {
        self.gen_lvalue_address(inner)?;
        if target == Target::A {
          self.emit("MOV", "A,L");
        }
        Ok(())
      }

      ExprKind::Cast { expr: inner, .. } => self.gen_cast(expr, inner, target),

      ExprKind::Call { .. } => {
        let returns = self.gen_call_stmt(expr)?;
        let ret = returns.first().ok_or_else(|| {
          CompileError::internal(
            expr.pos.clone(),
            "value call without returns survived sema",
          )
        })?;
        let label = self.var_label(*ret);
        let ret_size = self.analysis.types.size_of(self.analysis.var(*ret).ty);
        if ret_size == 1 {
          self.emit("LDA", label);
          if target == Target::HL {
            self.emit("MOV", "L,A");
            self.emit("MVI", "H,0");
          }
        } else {
          self.emit("LHLD", label);
          if target == Target::A {
            self.emit("MOV", "A,L");
          }
        }
        Ok(())
      }

      ExprKind::NextPtr(inner) | ExprKind::PrevPtr(inner) => {
        let forward = matches!(expr.kind, ExprKind::NextPtr(_));
        let inner_ty = self.expr_ty(inner, "pointer step operand")?;
        let step = self
          .analysis
          .types
          .pointee(inner_ty)
          .map(|p| self.analysis.types.size_of(p))
          .unwrap_or(1);
        self.gen_expr(inner, Target::HL)?;
        match (forward, step) {
          (true, 1) => self.emit("INX", "H"),
          (false, 1) => self.emit("DCX", "H"),
          (true, step) => {
            self.emit("LXI", format!("D,{step}"));
            self.emit("DAD", "D");
          }
          (false, step) => {
            self.emit("LXI", format!("D,{}", (0x10000 - step as u32) & 0xFFFF));
            self.emit("DAD", "D");
          }
        }
        if target == Target::A {
          self.emit("MOV", "A,L");
        }
        Ok(())
      }

      ExprKind::Cmp { .. } | ExprKind::Logical { .. } | ExprKind::Not(_) => {
        Err(CompileError::internal(
          expr.pos.clone(),
          "comparison in value position survived sema",
        ))
      }

      ExprKind::Name(name) => Err(CompileError::internal(
        expr.pos.clone(),
        format!("unresolved name \"{name}\" survived sema"),
      )),

      ExprKind::ArrayInit(_)
      | ExprKind::SizeOf(_)
      | ExprKind::BytesOf(_)
      | ExprKind::IndexOf(_) => Err(CompileError::internal(
        expr.pos.clone(),
        "unlowered construct survived sema",
      )),
    }
  }

  /// HL holds an address; load the value it points at.
  fn load_through_hl(&mut self, size: u16, target: Target) {
    if size == 1 {
      self.emit("MOV", "A,M");
      if target == Target::HL {
        self.emit("MOV", "L,A");
        self.emit("MVI", "H,0");
      }
    } else {
      self.emit("MOV", "E,M");
      self.emit("INX", "H");
      self.emit("MOV", "D,M");
      self.emit("XCHG", "");
      if target == Target::A {
        self.emit("MOV", "A,L");
      }
    }
  }

  fn gen_cast(&mut self, expr: &Expr, inner: &Expr, target: Target) -> CompileResult<()> {
    let to_size = self.size_of_expr(expr);
    let from_size = self.size_of_expr(inner);
    let from_signed = inner
      .ty
      .map(|t| self.analysis.types.is_signed(t))
      .unwrap_or(false);

    if from_size == 1 && to_size == 2 {
      self.gen_expr(inner, Target::A)?;
      if from_signed {
        // Sign-extend A into H.
        self.emit("MOV", "L,A");
        self.emit("RAL", "");
        self.emit("SBB", "A");
        self.emit("MOV", "H,A");
      } else {
        self.emit("MOV", "L,A");
        self.emit("MVI", "H,0");
      }
      if target == Target::A {
        self.emit("MOV", "A,L");
      }
      return Ok(());
    }

    if from_size == 2 && to_size == 1 {
      self.gen_expr(inner, Target::HL)?;
      self.emit("MOV", "A,L");
      if target == Target::HL {
        self.emit("MOV", "L,A");
        self.emit("MVI", "H,0");
      }
      return Ok(());
    }

    // Same representation: reinterpretation only.
    self.gen_expr(inner, target)
  }

  fn gen_binop(
    &mut self,
    expr: &Expr,
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    target: Target,
  ) -> CompileResult<()> {
    let size = self.size_of_expr(expr);
    if size > 2 {
      return Err(CompileError::type_error(
        expr.pos.clone(),
        "32-bit arithmetic is not supported on the 8080 target",
      ));
    }

    if size == 1 {
      self.gen_binop8(op, lhs, rhs)?;
      if target == Target::HL {
        self.emit("MOV", "L,A");
        self.emit("MVI", "H,0");
      }
    } else {
      self.gen_binop16(op, lhs, rhs, expr)?;
      if target == Target::A {
        self.emit("MOV", "A,L");
      }
    }
    Ok(())
  }

  fn gen_binop8(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> CompileResult<()> {
    // Constant shifts unroll instead of looping.
    if let (BinOp::Shl | BinOp::Shr, Some(count)) = (op, rhs.as_int()) {
      self.gen_expr(lhs, Target::A)?;
      for _ in 0..count.clamp(0, 7) {
        if op == BinOp::Shl {
          self.emit("ADD", "A");
        } else {
          // Clear carry, then rotate right through it.
          self.emit("ORA", "A");
          self.emit("RAR", "");
        }
      }
      return Ok(());
    }

    // Immediate right-hand sides skip the push/pop dance.
    if let Some(value) = rhs.as_int() {
      let value = value & 0xFF;
      self.gen_expr(lhs, Target::A)?;
      match op {
        BinOp::Add => self.emit("ADI", value.to_string()),
        BinOp::Sub => self.emit("SUI", value.to_string()),
        BinOp::BitAnd => self.emit("ANI", value.to_string()),
        BinOp::BitOr => self.emit("ORI", value.to_string()),
        BinOp::BitXor => self.emit("XRI", value.to_string()),
        BinOp::Mul | BinOp::Div | BinOp::Mod => {
          self.emit("MVI", format!("B,{value}"));
          let helper = match op {
            BinOp::Mul => "_mul8",
            BinOp::Div => "_div8",
            _ => "_mod8",
          };
          self.emit("CALL", helper);
        }
        BinOp::Shl | BinOp::Shr => unreachable!("constant shifts handled above"),
      }
      return Ok(());
    }

    self.gen_expr(lhs, Target::A)?;
    self.emit("PUSH", "PSW");
    self.gen_expr(rhs, Target::A)?;
    self.emit("MOV", "B,A");
    self.emit("POP", "PSW");

    match op {
      BinOp::Add => self.emit("ADD", "B"),
      BinOp::Sub => self.emit("SUB", "B"),
      BinOp::BitAnd => self.emit("ANA", "B"),
      BinOp::BitOr => self.emit("ORA", "B"),
      BinOp::BitXor => self.emit("XRA", "B"),
      BinOp::Mul => self.emit("CALL", "_mul8"),
      BinOp::Div => self.emit("CALL", "_div8"),
      BinOp::Mod => self.emit("CALL", "_mod8"),
      BinOp::Shl => {
        let top = self.new_label("SHL");
        let done = self.new_label("SHLE");
        self.emit_label(top.clone());
        self.emit("MOV", "C,A");
        self.emit("MOV", "A,B");
        self.emit("ORA", "A");
        self.emit("JZ", done.clone());
        self.emit("DCR", "B");
        self.emit("MOV", "A,C");
        self.emit("ADD", "A");
        self.emit("JMP", top);
        self.emit_label(done);
        self.emit("MOV", "A,C");
      }
      BinOp::Shr => {
        let top = self.new_label("SHR");
        let done = self.new_label("SHRE");
        self.emit_label(top.clone());
        self.emit("MOV", "C,A");
        self.emit("MOV", "A,B");
        self.emit("ORA", "A");
        self.emit("JZ", done.clone());
        self.emit("DCR", "B");
        self.emit("MOV", "A,C");
        self.emit("ORA", "A");
        self.emit("RAR", "");
        self.emit("JMP", top);
        self.emit_label(done);
        self.emit("MOV", "A,C");
      }
    }
    Ok(())
  }

  fn gen_binop16(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, expr: &Expr) -> CompileResult<()> {
    // Constant 16-bit shifts by a small count unroll into DAD H.
    if op == BinOp::Shl
      && let Some(count) = rhs.as_int()
      && (0..=3).contains(&count)
    {
      self.gen_expr(lhs, Target::HL)?;
      for _ in 0..count {
        self.emit("DAD", "H");
      }
      return Ok(());
    }

    // Constant multipliers: powers of two shift, and constants with two
    // set bits shift-and-add, both beating the LXI/CALL helper pair.
    if op == BinOp::Mul
      && let Some(value) = rhs.as_int()
      && (0..=255).contains(&value)
    {
      let value = value as u32;
      if value.count_ones() == 1 {
        let shifts = value.trailing_zeros();
        self.gen_expr(lhs, Target::HL)?;
        for _ in 0..shifts {
          self.emit("DAD", "H");
        }
        return Ok(());
      }
      if value.count_ones() == 2 {
        let low = value.trailing_zeros();
        let high = 31 - value.leading_zeros();
        self.gen_expr(lhs, Target::HL)?;
        for _ in 0..low {
          self.emit("DAD", "H");
        }
        self.emit("MOV", "D,H");
        self.emit("MOV", "E,L");
        for _ in low..high {
          self.emit("DAD", "H");
        }
        self.emit("DAD", "D");
        return Ok(());
      }
    }

    // Adding a constant keeps the right operand out of the way.
    if op == BinOp::Add
      && let Some(value) = rhs.as_int()
    {
      self.gen_expr(lhs, Target::HL)?;
      self.emit("LXI", format!("D,{}", value & 0xFFFF));
      self.emit("DAD", "D");
      return Ok(());
    }
    if op == BinOp::Sub
      && let Some(value) = rhs.as_int()
    {
      self.gen_expr(lhs, Target::HL)?;
      self.emit("LXI", format!("D,{}", (0x10000 - (value & 0xFFFF)) & 0xFFFF));
      self.emit("DAD", "D");
      return Ok(());
    }

    self.gen_expr(lhs, Target::HL)?;
    self.emit("PUSH", "H");
    self.gen_expr(rhs, Target::HL)?;
    self.emit("XCHG", "");
    self.emit("POP", "H");

    match op {
      BinOp::Add => self.emit("DAD", "D"),
      BinOp::Sub => {
        self.emit("MOV", "A,L");
        self.emit("SUB", "E");
        self.emit("MOV", "L,A");
        self.emit("MOV", "A,H");
        self.emit("SBB", "D");
        self.emit("MOV", "H,A");
      }
      BinOp::BitAnd => {
        self.emit("MOV", "A,L");
        self.emit("ANA", "E");
        self.emit("MOV", "L,A");
        self.emit("MOV", "A,H");
        self.emit("ANA", "D");
        self.emit("MOV", "H,A");
      }
      BinOp::BitOr => {
        self.emit("MOV", "A,L");
        self.emit("ORA", "E");
        self.emit("MOV", "L,A");
        self.emit("MOV", "A,H");
        self.emit("ORA", "D");
        self.emit("MOV", "H,A");
      }
      BinOp::BitXor => {
        self.emit("MOV", "A,L");
        self.emit("XRA", "E");
        self.emit("MOV", "L,A");
        self.emit("MOV", "A,H");
        self.emit("XRA", "D");
        self.emit("MOV", "H,A");
      }
      BinOp::Mul => self.emit("CALL", "_mul16"),
      BinOp::Div => self.emit("CALL", "_div16"),
      BinOp::Mod => self.emit("CALL", "_mod16"),
      BinOp::Shl => self.emit("CALL", "_shl16"),
      BinOp::Shr => self.emit("CALL", "_shr16"),
    }
    Ok(())
  }

  /// Leave the address of an lvalue in HL.
  fn gen_lvalue_address(&mut self, expr: &Expr) -> CompileResult<()> {
    match &expr.kind {
      ExprKind::Var(var) => {
        let label = self.var_label(*var);
        self.emit("LXI", format!("H,{label}"));
        Ok(())
      }
      ExprKind::Deref(inner) => self.gen_expr(inner, Target::HL),
      ExprKind::Index { base, index } => {
        let base_ty = self.expr_ty(base, "array expression")?;
        let element_size = self
          .analysis
          .types
          .element_of(base_ty)
          .map(|e| self.analysis.types.size_of(e))
          .unwrap_or(1);

        self.gen_expr(index, Target::HL)?;
        match element_size {
          1 => {}
          2 => self.emit("DAD", "H"),
          4 => {
            self.emit("DAD", "H");
            self.emit("DAD", "H");
          }
          size => {
            self.emit("LXI", format!("D,{size}"));
            self.emit("CALL", "_mul16");
          }
        }

        // The array-index idiom the peephole pass recognises.
        self.emit("PUSH", "H");
        if let ExprKind::Var(var) = base.kind {
          let label = self.var_label(var);
          self.emit("LXI", format!("H,{label}"));
        } else {
          self.gen_lvalue_address(base)?;
        }
        self.emit("POP", "D");
        self.emit("DAD", "D");
        Ok(())
      }
      ExprKind::Field { base, offset, .. } => {
        let offset = offset.ok_or_else(|| {
          CompileError::internal(expr.pos.clone(), "field without an offset survived sema")
        })?;
        let base_ty = self.expr_ty(base, "record expression")?;

        // Through a pointer the base is a value; otherwise it is a place.
        if self.analysis.types.is_pointer(base_ty) {
          self.gen_expr(base, Target::HL)?;
        } else {
          self.gen_lvalue_address(base)?;
        }

        if offset > 0 {
          self.emit("LXI", format!("D,{offset}"));
          self.emit("DAD", "D");
        }
        Ok(())
      }
      ExprKind::Str(text) => {
        let text = text.clone();
        let label = self.string_label(&text);
        self.emit("LXI", format!("H,{label}"));
        Ok(())
      }
      _ => Err(CompileError::internal(
        expr.pos.clone(),
        "address of a non-place expression survived sema",
      )),
    }
  }

  // ----- Conditions -----

  /// Emit a branch: jump to `label` when the condition's truth equals
  /// `jump_when`, fall through otherwise.
  fn gen_branch(&mut self, cond: &Expr, label: &str, jump_when: bool) -> CompileResult<()> {
    match &cond.kind {
      ExprKind::Int(value) => {
        if (*value != 0) == jump_when {
          self.emit("JMP", label);
        }
        Ok(())
      }
      ExprKind::Not(inner) => self.gen_branch(inner, label, !jump_when),
      ExprKind::Logical { op, lhs, rhs } => {
        match (op, jump_when) {
          // Jump somewhere when the conjunction fails.
          (LogicalOp::And, false) => {
            self.gen_branch(lhs, label, false)?;
            self.gen_branch(rhs, label, false)
          }
          (LogicalOp::And, true) => {
            let fall = self.new_label("ANDF");
            self.gen_branch(lhs, &fall, false)?;
            self.gen_branch(rhs, label, true)?;
            self.emit_label(fall);
            Ok(())
          }
          (LogicalOp::Or, true) => {
            self.gen_branch(lhs, label, true)?;
            self.gen_branch(rhs, label, true)
          }
          (LogicalOp::Or, false) => {
            let fall = self.new_label("ORT");
            self.gen_branch(lhs, &fall, true)?;
            self.gen_branch(rhs, label, false)?;
            self.emit_label(fall);
            Ok(())
          }
        }
      }
      ExprKind::Cmp { op, lhs, rhs } => self.gen_compare(*op, lhs, rhs, label, jump_when),
      _ => {
        // Truth test of a plain value.
        let size = self.size_of_expr(cond);
        if size == 1 {
          self.gen_expr(cond, Target::A)?;
          self.emit("ORA", "A");
        } else {
          self.gen_expr(cond, Target::HL)?;
          self.emit("MOV", "A,L");
          self.emit("ORA", "H");
        }
        let jump = if jump_when { "JNZ" } else { "JZ" };
        self.emit(jump, label);
        Ok(())
      }
    }
  }

  fn gen_compare(
    &mut self,
    op: CmpOp,
    lhs: &Expr,
    rhs: &Expr,
    label: &str,
    jump_when: bool,
  ) -> CompileResult<()> {
    let size = self.size_of_expr(lhs).max(self.size_of_expr(rhs));
    let signed = lhs
      .ty
      .map(|t| self.analysis.types.is_signed(t))
      .unwrap_or(false);

    // Reduce `>` and `<=` to `<` and `>=` by swapping operands.
    let (op, lhs, rhs) = match op {
      CmpOp::Gt => (CmpOp::Lt, rhs, lhs),
      CmpOp::Le => (CmpOp::Ge, rhs, lhs),
      other => (other, lhs, rhs),
    };

    // The condition under which we jump.
    let op = if jump_when { op } else { op.negated() };

    if size == 1 {
      // Byte comparison against an immediate uses a direct compare.
      if let Some(value) = rhs.as_int() {
        self.gen_expr(lhs, Target::A)?;
        self.emit("CPI", (value & 0xFF).to_string());
      } else {
        self.gen_expr(lhs, Target::A)?;
        self.emit("PUSH", "PSW");
        self.gen_expr(rhs, Target::A)?;
        self.emit("MOV", "B,A");
        self.emit("POP", "PSW");
        self.emit("CMP", "B");
      }
      self.emit_cmp_jumps(op, signed, label);
      return Ok(());
    }

    // 16-bit: subtract and test.
    self.gen_expr(lhs, Target::HL)?;
    self.emit("PUSH", "H");
    self.gen_expr(rhs, Target::HL)?;
    self.emit("XCHG", "");
    self.emit("POP", "H");

    match op {
      CmpOp::Eq | CmpOp::Ne => {
        self.emit("MOV", "A,L");
        self.emit("SUB", "E");
        self.emit("MOV", "B,A");
        self.emit("MOV", "A,H");
        self.emit("SBB", "D");
        self.emit("ORA", "B");
        let jump = if op == CmpOp::Eq { "JZ" } else { "JNZ" };
        self.emit(jump, label);
      }
      _ => {
        self.emit("MOV", "A,L");
        self.emit("SUB", "E");
        self.emit("MOV", "A,H");
        self.emit("SBB", "D");
        self.emit_cmp_jumps(op, signed, label);
      }
    }
    Ok(())
  }

  /// After a compare or subtract whose flags describe `lhs - rhs`, jump
  /// when `op` holds.
  fn emit_cmp_jumps(&mut self, op: CmpOp, signed: bool, label: &str) {
    match (op, signed) {
      (CmpOp::Eq, _) => self.emit("JZ", label),
      (CmpOp::Ne, _) => self.emit("JNZ", label),
      (CmpOp::Lt, false) => self.emit("JC", label),
      (CmpOp::Ge, false) => self.emit("JNC", label),
      (CmpOp::Lt, true) => self.emit("JM", label),
      (CmpOp::Ge, true) => self.emit("JP", label),
      (CmpOp::Gt, false) => {
        // Not below and not equal.
        let skip = self.new_label("CMPS");
        self.emit("JZ", skip.clone());
        self.emit("JNC", label);
        self.emit_label(skip);
      }
      (CmpOp::Le, false) => {
        self.emit("JZ", label);
        self.emit("JC", label);
      }
      (CmpOp::Gt, true) => {
        let skip = self.new_label("CMPS");
        self.emit("JZ", skip.clone());
        self.emit("JP", label);
        self.emit_label(skip);
      }
      (CmpOp::Le, true) => {
        self.emit("JZ", label);
        self.emit("JM", label);
      }
    }
  }

  // ----- Calls -----

  /// Emit a call and return the callee's return slots.
  fn gen_call_stmt(&mut self, call: &Expr) -> CompileResult<Vec<VarId>> {
    let ExprKind::Call { target, args } = &call.kind else {
      return Err(CompileError::internal(
        call.pos.clone(),
        "call statement without a call survived sema",
      ));
    };

    match &target.kind {
      ExprKind::SubRef(sub) => {
        let info = self.analysis.sub(*sub);
        let params = info.params.clone();
        let returns = info.returns.clone();
        let is_extern = info.extern_name.is_some() && !info.defined;

        if is_extern {
          self.gen_extern_call(*sub, args)?;
          return Ok(returns);
        }

        self.store_args(&params, args)?;
        if let Some(body) = self.inlined.get(sub).copied() {
          // Expand the body in place of the call.
          self.gen_stmts(body)?;
        } else {
          let label = self.sub_label(*sub);
          self.emit("CALL", label);
        }
        Ok(returns)
      }
      _ => {
        // Indirect call through an interface value.
        let target_ty = self.expr_ty(target, "call target")?;
        let resolved = self.analysis.types.resolve(target_ty);
        let (params, returns) = self
          .analysis
          .interface_slots
          .get(&resolved)
          .cloned()
          .ok_or_else(|| {
            CompileError::internal(call.pos.clone(), "indirect call without an interface")
          })?;
        self.store_args(&params, args)?;
        self.gen_expr(target, Target::HL)?;
        self.emit("CALL", "_callhl");
        Ok(returns)
      }
    }
  }

  /// Store evaluated arguments into the callee's static slots. When a
  /// later argument performs calls of its own, every argument is staged
  /// on the stack first so the slots cannot be clobbered mid-setup.
  fn store_args(&mut self, params: &[VarId], args: &[Expr]) -> CompileResult<()> {
    let risky = args.iter().any(contains_call);
    if !risky {
      for (param, arg) in params.iter().zip(args) {
        self.gen_store_to_var(*param, arg, &arg.pos)?;
      }
      return Ok(());
    }

    for arg in args {
      self.gen_expr(arg, Target::HL)?;
      self.emit("PUSH", "H");
    }
    for param in params.iter().rev() {
      self.emit("POP", "H");
      let label = self.var_label(*param);
      let size = self.analysis.types.size_of(self.analysis.var(*param).ty);
      if size == 1 {
        self.emit("MOV", "A,L");
        self.emit("STA", label);
      } else {
        self.emit("SHLD", label);
      }
    }
    Ok(())
  }

  /// Externally-linked routines take their first argument in a register
  /// (A for bytes, HL otherwise); further arguments go on the stack.
  fn gen_extern_call(&mut self, sub: SubId, args: &[Expr]) -> CompileResult<()> {
    for arg in args.iter().skip(1).rev() {
      self.gen_expr(arg, Target::HL)?;
      self.emit("PUSH", "H");
    }
    if let Some(first) = args.first() {
      let size = self.size_of_expr(first);
      if size == 1 {
        self.gen_expr(first, Target::A)?;
      } else {
        self.gen_expr(first, Target::HL)?;
      }
    }
    let label = self.sub_label(sub);
    self.emit("CALL", label);
    for _ in args.iter().skip(1) {
      self.emit("POP", "D");
    }
    Ok(())
  }

  // ----- Data sections -----

  fn gen_data_sections(&mut self, program: &Program) -> CompileResult<()> {
    self.emit_comment("Data segment");
    self.emit_label("_data");

    // Globals with constant initializers.
    let mut initialized: Vec<VarId> = Vec::new();
    for stmt in &program.body {
      if let StmtKind::Var(decl) = &stmt.kind
        && let Some(var) = decl.var
        && self.analysis.var(var).owner.is_none()
        && let Some(init) = &decl.init
      {
        if let Some(lines) = self.render_const_init(var, init) {
          for line in lines {
            self.code.push(Line::Raw(line));
          }
          initialized.push(var);
        }
      }
    }

    // String literals, null-terminated.
    for (label, text) in self.strings.clone() {
      let mut bytes: Vec<String> = text.bytes().map(|b| b.to_string()).collect();
      bytes.push("0".to_string());
      self.code.push(Line::Raw(format!("{label}:\tDB\t{}", bytes.join(","))));
    }

    self.emit_blank();
    self.emit_comment("Uninitialized data");

    // Globals without static initializers.
    for (index, var) in self.analysis.vars.iter().enumerate() {
      let id = VarId(index as u32);
      if var.owner.is_some() || initialized.contains(&id) {
        continue;
      }
      let label = self.var_label(id);
      let size = self.analysis.types.size_of(var.ty);
      self.code.push(Line::Raw(format!("{label}:\tDS\t{size}")));
    }

    // The overlay workspace plus the EQU table addressing into it.
    if self.workspace_size > 0 {
      self
        .code
        .push(Line::Raw(format!("_workspace:\tDS\t{}", self.workspace_size)));
      for (index, var) in self.analysis.vars.iter().enumerate() {
        let id = VarId(index as u32);
        if var.owner.is_none() {
          continue;
        }
        let label = self.var_label(id);
        let offset = self.frame_offsets[&id];
        self
          .code
          .push(Line::Raw(format!("{label}\tEQU\t_workspace+{offset}")));
      }
    }

    self.emit_blank();
    self.code.push(Line::Raw("\tEND".to_string()));
    Ok(())
  }

  /// Render a global's constant initializer as `DB`/`DW` lines.
  fn render_const_init(&mut self, var: VarId, init: &Expr) -> Option<Vec<String>> {
    let label = self.var_label(var);
    let ty = self.analysis.var(var).ty;
    let types = &self.analysis.types;

    match &init.kind {
      ExprKind::Int(value) => {
        let size = types.size_of(ty);
        Some(match size {
          1 => vec![format!("{label}:\tDB\t{}", value & 0xFF)],
          2 => vec![format!("{label}:\tDW\t{}", value & 0xFFFF)],
          _ => vec![
            format!("{label}:\tDW\t{}", value & 0xFFFF),
            format!("\tDW\t{}", (value >> 16) & 0xFFFF),
          ],
        })
      }
      ExprKind::Str(text) => {
        if types.is_array(ty) {
          let mut bytes: Vec<String> = text.bytes().map(|b| b.to_string()).collect();
          bytes.push("0".to_string());
          Some(vec![format!("{label}:\tDB\t{}", bytes.join(","))])
        } else {
          let text = text.clone();
          let string = self.string_label(&text);
          Some(vec![format!("{label}:\tDW\t{string}")])
        }
      }
      ExprKind::ArrayInit(elements) => {
        if !elements.iter().all(|e| e.as_int().is_some()) {
          return None;
        }
        let element_size = types.element_of(ty).map(|e| types.size_of(e)).unwrap_or(1);
        let rendered: Vec<String> = elements
          .iter()
          .map(|e| {
            let v = e.as_int().unwrap_or(0);
            if element_size == 1 {
              (v & 0xFF).to_string()
            } else {
              (v & 0xFFFF).to_string()
            }
          })
          .collect();
        let directive = if element_size == 1 { "DB" } else { "DW" };
        Some(vec![format!(
          "{label}:\t{directive}\t{}",
          rendered.join(",")
        )])
      }
      ExprKind::SubRef(sub) => {
        let target = self.sub_label(*sub);
        Some(vec![format!("{label}:\tDW\t{target}")])
      }
      _ => None,
    }
  }
}

fn mangle_sub(name: &str) -> String {
  if REGISTER_NAMES
    .iter()
    .any(|r| r.eq_ignore_ascii_case(name))
  {
    format!("s_{name}")
  } else {
    name.to_string()
  }
}

fn collect_subs<'a>(stmts: &'a [Stmt], out: &mut Vec<&'a SubDecl>) {
  for stmt in stmts {
    match &stmt.kind {
      StmtKind::Sub(decl) => {
        if decl.body.is_some() {
          out.push(decl);
          if let Some(body) = &decl.body {
            collect_subs(body, out);
          }
        }
      }
      StmtKind::If { arms, else_body } => {
        for arm in arms {
          collect_subs(&arm.body, out);
        }
        collect_subs(else_body, out);
      }
      StmtKind::While { body, .. } | StmtKind::Loop { body } => collect_subs(body, out),
      StmtKind::Case { arms, else_body, .. } => {
        for arm in arms {
          collect_subs(&arm.body, out);
        }
        collect_subs(else_body, out);
      }
      _ => {}
    }
  }
}

/// Shapes the data section can carry directly; everything else gets a
/// runtime store in the main code.
fn is_const_init(init: &Expr) -> bool {
  match &init.kind {
    ExprKind::Int(_) | ExprKind::Str(_) | ExprKind::SubRef(_) => true,
    ExprKind::ArrayInit(elements) => elements.iter().all(|e| e.as_int().is_some()),
    _ => false,
  }
}

fn count_direct_calls(stmts: &[Stmt], counts: &mut HashMap<SubId, usize>) {
  fn walk_expr(expr: &Expr, counts: &mut HashMap<SubId, usize>) {
    if let ExprKind::Call { target, args } = &expr.kind {
      if let ExprKind::SubRef(sub) = target.kind {
        *counts.entry(sub).or_insert(0) += 1;
      } else {
        walk_expr(target, counts);
      }
      for arg in args {
        walk_expr(arg, counts);
      }
      return;
    }
    match &expr.kind {
      ExprKind::Neg(inner)
      | ExprKind::Not(inner)
      | ExprKind::Deref(inner)
      | ExprKind::AddrOf(inner)
      | ExprKind::Cast { expr: inner, .. }
      | ExprKind::NextPtr(inner)
      | ExprKind::PrevPtr(inner) => walk_expr(inner, counts),
      ExprKind::Field { base, .. } => walk_expr(base, counts),
      ExprKind::Index { base, index } => {
        walk_expr(base, counts);
        walk_expr(index, counts);
      }
      ExprKind::Binary { lhs, rhs, .. }
      | ExprKind::Cmp { lhs, rhs, .. }
      | ExprKind::Logical { lhs, rhs, .. } => {
        walk_expr(lhs, counts);
        walk_expr(rhs, counts);
      }
      ExprKind::ArrayInit(elements) => {
        for element in elements {
          walk_expr(element, counts);
        }
      }
      _ => {}
    }
  }

  for stmt in stmts {
    match &stmt.kind {
      StmtKind::Var(decl) => {
        if let Some(init) = &decl.init {
          walk_expr(init, counts);
        }
      }
      StmtKind::Assign { target, value } => {
        walk_expr(target, counts);
        walk_expr(value, counts);
      }
      StmtKind::MultiAssign { targets, call } => {
        for target in targets {
          walk_expr(target, counts);
        }
        walk_expr(call, counts);
      }
      StmtKind::If { arms, else_body } => {
        for arm in arms {
          walk_expr(&arm.cond, counts);
          count_direct_calls(&arm.body, counts);
        }
        count_direct_calls(else_body, counts);
      }
      StmtKind::While { cond, body } => {
        walk_expr(cond, counts);
        count_direct_calls(body, counts);
      }
      StmtKind::Loop { body } => count_direct_calls(body, counts),
      StmtKind::Case {
        scrutinee,
        arms,
        else_body,
      } => {
        walk_expr(scrutinee, counts);
        for arm in arms {
          count_direct_calls(&arm.body, counts);
        }
        count_direct_calls(else_body, counts);
      }
      StmtKind::Expr(expr) => walk_expr(expr, counts),
      StmtKind::Sub(decl) => {
        if let Some(body) = &decl.body {
          count_direct_calls(body, counts);
        }
      }
      _ => {}
    }
  }
}

/// Candidates for inlining carry no control structure the expansion
/// could break: no loops, no early returns, no nested subroutines.
fn body_is_inlinable(stmts: &[Stmt]) -> bool {
  stmts.iter().all(|stmt| match &stmt.kind {
    StmtKind::While { .. } | StmtKind::Loop { .. } | StmtKind::Return | StmtKind::Sub(_) => {
      false
    }
    StmtKind::Break | StmtKind::Continue => false,
    StmtKind::If { arms, else_body } => {
      arms.iter().all(|arm| body_is_inlinable(&arm.body)) && body_is_inlinable(else_body)
    }
    StmtKind::Case { arms, else_body, .. } => {
      arms.iter().all(|arm| body_is_inlinable(&arm.body)) && body_is_inlinable(else_body)
    }
    _ => true,
  })
}

fn contains_call(expr: &Expr) -> bool {
  match &expr.kind {
    ExprKind::Call { .. } => true,
    ExprKind::Neg(inner)
    | ExprKind::Not(inner)
    | ExprKind::Deref(inner)
    | ExprKind::AddrOf(inner)
    | ExprKind::Cast { expr: inner, .. }
    | ExprKind::NextPtr(inner)
    | ExprKind::PrevPtr(inner) => contains_call(inner),
    ExprKind::Field { base, .. } => contains_call(base),
    ExprKind::Index { base, index } => contains_call(base) || contains_call(index),
    ExprKind::Binary { lhs, rhs, .. }
    | ExprKind::Cmp { lhs, rhs, .. }
    | ExprKind::Logical { lhs, rhs, .. } => contains_call(lhs) || contains_call(rhs),
    ExprKind::ArrayInit(elements) => elements.iter().any(contains_call),
    _ => false,
  }
}
