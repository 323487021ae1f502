//! Semantic analysis: resolves names, checks types, computes record
//! layouts and verifies the call graph.
//!
//! Expressions are typed bottom-up and every node's `ty` slot is filled
//! before this pass returns; name references are rewritten to variable or
//! subroutine handles so later stages never see a string lookup. Integer
//! literals are the only flexible point in the type system: a literal
//! adopts the concrete type of the other operand, the assignment target
//! or the parameter it is passed to. Everything else converts only
//! through `as`.
//!
//! The analyzer keeps going after an error in a top-level declaration so
//! one run can report several diagnostics, but the pipeline does not
//! proceed past this pass if any were raised.

use crate::error::{CompileError, CompileResult, Position};
use crate::parser::{
  AsmPart, BinOp, CaseArm, CondArm, Expr, ExprKind, ParamDecl, Program, RecordDecl, Stmt,
  StmtKind, SubDecl, SubKind, TypeRef, VarDecl,
};
use crate::ty::{self, FieldDef, InterfaceDef, RecordDef, TypeDef, TypeId, TypeTable};
use std::collections::HashMap;

/// Handle into [`Analysis::vars`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub u32);

/// Handle into [`Analysis::subs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubId(pub u32);

#[derive(Debug, Clone)]
pub struct VarInfo {
  pub name: String,
  pub ty: TypeId,
  /// Subroutine whose frame this variable lives in; `None` for globals
  /// and for interface parameter slots.
  pub owner: Option<SubId>,
  pub pos: Position,
}

#[derive(Debug, Clone)]
pub struct SubInfo {
  pub name: String,
  pub params: Vec<VarId>,
  pub returns: Vec<VarId>,
  /// Interface whose shared slots carry this sub's parameters.
  pub implements: Option<TypeId>,
  pub extern_name: Option<String>,
  pub parent: Option<SubId>,
  /// Whether a body has been seen.
  pub defined: bool,
  /// Whether the sub was introduced by `@decl`.
  pub forward: bool,
  /// Direct callees, plus nested subs (whose frames must not overlap).
  pub calls: Vec<SubId>,
  pub pos: Position,
}

/// Everything later stages need to know about names and types.
#[derive(Debug)]
pub struct Analysis {
  pub types: TypeTable,
  pub vars: Vec<VarInfo>,
  pub subs: Vec<SubInfo>,
  /// Parameter and return slots owned by each interface type.
  pub interface_slots: HashMap<TypeId, (Vec<VarId>, Vec<VarId>)>,
  /// Subroutines called directly from top-level code.
  pub main_calls: Vec<SubId>,
  next_temp: u32,
}

impl Analysis {
  pub fn var(&self, id: VarId) -> &VarInfo {
    &self.vars[id.0 as usize]
  }

  pub fn sub(&self, id: SubId) -> &SubInfo {
    &self.subs[id.0 as usize]
  }

  pub fn sub_ids(&self) -> impl Iterator<Item = SubId> {
    (0..self.subs.len() as u32).map(SubId)
  }

  /// Allocate a compiler temporary in `owner`'s frame. The `$` in the
  /// name cannot appear in a source identifier, so temporaries never
  /// collide with user variables.
  pub fn add_temp(&mut self, owner: Option<SubId>, ty: TypeId, pos: Position) -> VarId {
    let id = VarId(self.vars.len() as u32);
    let name = format!("$t{}", self.next_temp);
    self.next_temp += 1;
    self.vars.push(VarInfo {
      name,
      ty,
      owner,
      pos,
    });
    id
  }
}

/// Run semantic analysis over the program, rewriting the AST in place.
pub fn analyze(program: &mut Program) -> Result<Analysis, Vec<CompileError>> {
  let mut analyzer = Analyzer::new();
  analyzer.scopes.push(Scope::default());
  for (name, id) in ty::PRIMITIVES {
    analyzer.bind(name, Binding::Type(*id));
  }

  for stmt in &mut program.body {
    if let Err(error) = analyzer.check_stmt(stmt) {
      analyzer.errors.push(error);
    }
  }

  analyzer.expand_indirect_calls();
  analyzer.check_forward_completeness();
  analyzer.check_call_graph();

  if analyzer.errors.is_empty() {
    Ok(analyzer.analysis)
  } else {
    Err(analyzer.errors)
  }
}

#[derive(Debug, Clone, Copy)]
enum Binding {
  Var(VarId),
  Const(i64),
  Sub(SubId),
  Type(TypeId),
}

#[derive(Debug, Default)]
struct Scope {
  map: HashMap<String, Binding>,
}

struct Analyzer {
  analysis: Analysis,
  scopes: Vec<Scope>,
  errors: Vec<CompileError>,
  current_sub: Option<SubId>,
  loop_depth: usize,
  /// Indirect call sites, expanded into call-graph edges to every
  /// implementor once all declarations are known.
  indirect_calls: Vec<(Option<SubId>, TypeId)>,
}

impl Analyzer {
  fn new() -> Self {
    Self {
      analysis: Analysis {
        types: TypeTable::new(),
        vars: Vec::new(),
        subs: Vec::new(),
        interface_slots: HashMap::new(),
        main_calls: Vec::new(),
        next_temp: 0,
      },
      scopes: Vec::new(),
      errors: Vec::new(),
      current_sub: None,
      loop_depth: 0,
      indirect_calls: Vec::new(),
    }
  }

  // ----- Scope helpers -----

  fn bind(&mut self, name: &str, binding: Binding) {
    if let Some(scope) = self.scopes.last_mut() {
      scope.map.insert(name.to_string(), binding);
    }
  }

  fn declare(&mut self, name: &str, binding: Binding, pos: &Position) -> CompileResult<()> {
    let scope = self.scopes.last_mut().expect("scope stack is never empty");
    if scope.map.contains_key(name) {
      return Err(CompileError::resolution(
        pos.clone(),
        format!("duplicate declaration of \"{name}\""),
      ));
    }
    scope.map.insert(name.to_string(), binding);
    Ok(())
  }

  fn lookup(&self, name: &str) -> Option<Binding> {
    for scope in self.scopes.iter().rev() {
      if let Some(binding) = scope.map.get(name) {
        return Some(*binding);
      }
    }
    None
  }

  fn add_var(&mut self, name: &str, ty: TypeId, pos: &Position) -> VarId {
    let id = VarId(self.analysis.vars.len() as u32);
    self.analysis.vars.push(VarInfo {
      name: name.to_string(),
      ty,
      owner: self.current_sub,
      pos: pos.clone(),
    });
    id
  }

  // ----- Type references -----

  fn resolve_type(&mut self, type_ref: &TypeRef) -> CompileResult<TypeId> {
    match type_ref {
      TypeRef::Named(name, pos) => match self.lookup(name) {
        Some(Binding::Type(id)) => Ok(id),
        Some(_) => Err(CompileError::type_error(
          pos.clone(),
          format!("\"{name}\" is not a type"),
        )),
        None => Err(CompileError::resolution(
          pos.clone(),
          format!("undeclared type \"{name}\""),
        )),
      },
      TypeRef::Ptr(inner) => {
        let target = self.resolve_type(inner)?;
        Ok(self.analysis.types.ptr_to(target))
      }
      TypeRef::Array { element, extent } => {
        let element = self.resolve_type(element)?;
        let extent = match extent {
          Some(expr) => {
            let count = self.const_eval(expr)?;
            if count <= 0 {
              return Err(CompileError::type_error(
                expr.pos.clone(),
                "array extent must be positive",
              ));
            }
            Some(count as u32)
          }
          None => None,
        };
        Ok(self.analysis.types.array_of(element, extent))
      }
      TypeRef::IndexOf(name, pos) => match self.lookup(name) {
        Some(Binding::Var(id)) => {
          let var_ty = self.analysis.var(id).ty;
          if !self.analysis.types.is_array(var_ty) {
            return Err(CompileError::type_error(
              pos.clone(),
              format!("\"{name}\" is not an array"),
            ));
          }
          Ok(self.analysis.types.index_type(var_ty))
        }
        Some(_) => Err(CompileError::type_error(
          pos.clone(),
          format!("@indexof needs an array variable, \"{name}\" is not one"),
        )),
        None => Err(CompileError::resolution(
          pos.clone(),
          format!("undeclared identifier \"{name}\""),
        )),
      },
    }
  }

  // ----- Constant evaluation -----
  //
  // Constants are folded eagerly at their declaration, so a constant can
  // only mention constants that already exist; a would-be cycle surfaces
  // as an undeclared identifier on its first edge.

  fn const_eval(&mut self, expr: &Expr) -> CompileResult<i64> {
    match &expr.kind {
      ExprKind::Int(value) => Ok(*value),
      ExprKind::Neg(inner) => Ok(self.const_eval(inner)?.wrapping_neg()),
      ExprKind::Name(name) => match self.lookup(name) {
        Some(Binding::Const(value)) => Ok(value),
        Some(_) => Err(CompileError::semantic(
          expr.pos.clone(),
          format!("\"{name}\" is not a constant"),
        )),
        None => Err(CompileError::resolution(
          expr.pos.clone(),
          format!("undeclared identifier \"{name}\""),
        )),
      },
      ExprKind::Binary { op, lhs, rhs } => {
        let lhs = self.const_eval(lhs)?;
        let rhs = self.const_eval(rhs)?;
        eval_binop(*op, lhs, rhs, &expr.pos)
      }
      ExprKind::Cast { expr: inner, to } => {
        let value = self.const_eval(inner)?;
        let target = self.resolve_type(to)?;
        Ok(wrap_to_type(&self.analysis.types, value, target))
      }
      _ => Err(CompileError::semantic(
        expr.pos.clone(),
        "expression is not resolvable at compile time",
      )),
    }
  }

  // ----- Statements -----

  fn check_stmt(&mut self, stmt: &mut Stmt) -> CompileResult<()> {
    match &mut stmt.kind {
      StmtKind::Var(decl) => self.check_var_decl(decl, &stmt.pos),
      StmtKind::Const { name, value } => {
        let value = self.const_eval(value)?;
        let name = name.clone();
        self.declare(&name, Binding::Const(value), &stmt.pos)
      }
      StmtKind::Typedef { name, target } => {
        let target = self.resolve_type(target)?;
        let id = self.analysis.types.add(TypeDef::Alias {
          name: name.clone(),
          target,
        });
        let name = name.clone();
        self.declare(&name, Binding::Type(id), &stmt.pos)
      }
      StmtKind::Record(decl) => self.check_record_decl(decl, &stmt.pos),
      StmtKind::Interface(decl) => {
        let params = self.resolve_signature(&decl.params)?;
        let returns = self.resolve_signature(&decl.returns)?;
        let id = self.analysis.types.add(TypeDef::Interface(InterfaceDef {
          name: decl.name.clone(),
          params: params.clone(),
          returns: returns.clone(),
        }));

        // The interface owns the static slots its implementors read. The
        // `$` keeps slot names out of the user namespace.
        let make_slots = |analyzer: &mut Self, list: &[(String, TypeId)]| {
          list
            .iter()
            .map(|(param, ty)| {
              let slot = format!("{}${param}", decl.name);
              let id = VarId(analyzer.analysis.vars.len() as u32);
              analyzer.analysis.vars.push(VarInfo {
                name: slot,
                ty: *ty,
                owner: None,
                pos: stmt.pos.clone(),
              });
              id
            })
            .collect::<Vec<_>>()
        };
        let param_slots = make_slots(self, &params);
        let return_slots = make_slots(self, &returns);
        self
          .analysis
          .interface_slots
          .insert(id, (param_slots, return_slots));

        let name = decl.name.clone();
        self.declare(&name, Binding::Type(id), &stmt.pos)
      }
      StmtKind::Sub(decl) => self.check_sub_decl(decl),
      StmtKind::Assign { target, value } => self.check_assign(target, value),
      StmtKind::MultiAssign { targets, call } => self.check_multi_assign(targets, call),
      StmtKind::If { arms, else_body } => {
        for CondArm { cond, body } in arms.iter_mut() {
          self.check_cond(cond)?;
          self.check_body(body)?;
        }
        self.check_body(else_body)
      }
      StmtKind::While { cond, body } => {
        self.check_cond(cond)?;
        self.loop_depth += 1;
        let result = self.check_body(body);
        self.loop_depth -= 1;
        result
      }
      StmtKind::Loop { body } => {
        self.loop_depth += 1;
        let result = self.check_body(body);
        self.loop_depth -= 1;
        result
      }
      StmtKind::Break | StmtKind::Continue => {
        if self.loop_depth == 0 {
          return Err(CompileError::semantic(
            stmt.pos.clone(),
            "break/continue outside of a loop",
          ));
        }
        Ok(())
      }
      StmtKind::Return => {
        if self.current_sub.is_none() {
          return Err(CompileError::semantic(
            stmt.pos.clone(),
            "return outside of a subroutine",
          ));
        }
        Ok(())
      }
      StmtKind::Case {
        scrutinee,
        arms,
        else_body,
      } => {
        let scrutinee_ty = self.type_expr(scrutinee, None)?;
        if !self.analysis.types.is_integer(scrutinee_ty) {
          return Err(CompileError::type_error(
            scrutinee.pos.clone(),
            "case needs an integer scrutinee",
          ));
        }
        for CaseArm { values, body } in arms.iter_mut() {
          for value in values.iter_mut() {
            let folded = self.const_eval(value)?;
            let folded = wrap_to_type(&self.analysis.types, folded, scrutinee_ty);
            *value = Expr::typed_int(folded, value.pos.clone(), Some(scrutinee_ty));
          }
          self.check_body(body)?;
        }
        self.check_body(else_body)
      }
      StmtKind::Asm { parts } => {
        for part in parts.iter_mut() {
          if let AsmPart::Name(name) = part {
            match self.lookup(name) {
              Some(Binding::Var(id)) => *part = AsmPart::Var(id),
              Some(Binding::Const(value)) => *part = AsmPart::Const(value),
              Some(Binding::Sub(id)) => *part = AsmPart::Sub(id),
              Some(Binding::Type(_)) | None => {
                return Err(CompileError::resolution(
                  stmt.pos.clone(),
                  format!("undeclared identifier \"{name}\" in @asm"),
                ));
              }
            }
          }
        }
        Ok(())
      }
      StmtKind::Expr(expr) => {
        if !matches!(expr.kind, ExprKind::Call { .. }) {
          return Err(CompileError::semantic(
            expr.pos.clone(),
            "only calls can stand as statements",
          ));
        }
        self.type_expr(expr, None)?;
        Ok(())
      }
    }
  }

  fn check_body(&mut self, body: &mut [Stmt]) -> CompileResult<()> {
    for stmt in body {
      self.check_stmt(stmt)?;
    }
    Ok(())
  }

  fn check_var_decl(&mut self, decl: &mut VarDecl, pos: &Position) -> CompileResult<()> {
    let declared = match &decl.ty {
      Some(type_ref) => Some(self.resolve_type(type_ref)?),
      None => None,
    };

    let ty = match (&declared, &mut decl.init) {
      (Some(ty), None) => *ty,
      (Some(ty), Some(init)) => {
        let ty = *ty;
        let ty = self.fit_array_extent(ty, init)?;
        self.check_initializer(init, ty)?;
        ty
      }
      (None, Some(init)) => {
        let ty = self.type_expr(init, None)?;
        if self.analysis.types.is_array(ty) && self.analysis.types.extent_of(ty).is_none() {
          return Err(CompileError::type_error(
            init.pos.clone(),
            "cannot infer an array type without an extent",
          ));
        }
        ty
      }
      (None, None) => unreachable!("parser requires a type or an initializer"),
    };

    let id = self.add_var(&decl.name, ty, pos);
    decl.var = Some(id);
    let name = decl.name.clone();
    self.declare(&name, Binding::Var(id), pos)
  }

  /// Resolve an inferred array extent from the initializer and return the
  /// concrete variable type.
  fn fit_array_extent(&mut self, ty: TypeId, init: &Expr) -> CompileResult<TypeId> {
    if !self.analysis.types.is_array(ty) || self.analysis.types.extent_of(ty).is_some() {
      return Ok(ty);
    }
    let element = self
      .analysis
      .types
      .element_of(ty)
      .expect("array type has an element");
    let count = match &init.kind {
      ExprKind::ArrayInit(elements) => elements.len() as u32,
      ExprKind::Str(text) => text.len() as u32 + 1,
      _ => {
        return Err(CompileError::type_error(
          init.pos.clone(),
          "array extent can only be inferred from an initializer",
        ));
      }
    };
    Ok(self.analysis.types.array_of(element, Some(count)))
  }

  fn check_initializer(&mut self, init: &mut Expr, ty: TypeId) -> CompileResult<()> {
    if let ExprKind::ArrayInit(elements) = &mut init.kind {
      let Some(element_ty) = self.analysis.types.element_of(ty) else {
        return Err(CompileError::type_error(
          init.pos.clone(),
          "brace initializer needs an array variable",
        ));
      };
      let extent = self.analysis.types.extent_of(ty).unwrap_or(0) as usize;
      if elements.len() != extent {
        return Err(CompileError::type_error(
          init.pos.clone(),
          format!(
            "initializer has {} elements but the array holds {extent}",
            elements.len()
          ),
        ));
      }
      for element in elements.iter_mut() {
        let element_ty = element_ty;
        let got = self.type_expr(element, Some(element_ty))?;
        self.require_same(element_ty, got, &element.pos)?;
      }
      init.ty = Some(ty);
      return Ok(());
    }

    let got = self.type_expr(init, Some(ty))?;
    // A string may initialize either a pointer or a byte array.
    if matches!(init.kind, ExprKind::Str(_)) && self.analysis.types.is_array(ty) {
      init.ty = Some(ty);
      return Ok(());
    }
    self.require_same(ty, got, &init.pos)
  }

  fn resolve_signature(&mut self, params: &[ParamDecl]) -> CompileResult<Vec<(String, TypeId)>> {
    params
      .iter()
      .map(|p| Ok((p.name.clone(), self.resolve_type(&p.ty)?)))
      .collect()
  }

  fn check_record_decl(&mut self, decl: &RecordDecl, pos: &Position) -> CompileResult<()> {
    let base = match &decl.base {
      Some(name) => match self.lookup(name) {
        Some(Binding::Type(id)) if self.analysis.types.as_record(id).is_some() => Some(id),
        Some(_) => {
          return Err(CompileError::type_error(
            pos.clone(),
            format!("record base \"{name}\" is not a record"),
          ));
        }
        None => {
          return Err(CompileError::resolution(
            pos.clone(),
            format!("undeclared record \"{name}\""),
          ));
        }
      },
      None => None,
    };

    // A derived record begins with the base's fields at their offsets.
    let mut fields: Vec<FieldDef> = match base {
      Some(id) => {
        self
          .analysis
          .types
          .as_record(id)
          .map(|r| r.fields.clone())
          .unwrap_or_default()
      }
      None => Vec::new(),
    };
    let mut high_water: u16 = base
      .map(|id| self.analysis.types.size_of(id))
      .unwrap_or(0);

    for field in &decl.fields {
      if fields.iter().any(|f| f.name == field.name) {
        return Err(CompileError::semantic(
          field.pos.clone(),
          format!("duplicate field \"{}\"", field.name),
        ));
      }
      let ty = self.resolve_type(&field.ty)?;
      let size = self.analysis.types.size_of(ty);
      let offset = match &field.at {
        // Explicit placement may overlap earlier fields.
        Some(expr) => self.const_eval(expr)? as u16,
        // Implicit placement resumes past the highest occupied byte.
        None => high_water,
      };
      high_water = high_water.max(offset + size);
      fields.push(FieldDef {
        name: field.name.clone(),
        ty,
        offset,
      });
    }

    let id = self.analysis.types.add(TypeDef::Record(RecordDef {
      name: decl.name.clone(),
      base,
      fields,
      size: high_water,
    }));
    self.declare(&decl.name, Binding::Type(id), pos)
  }

  // ----- Subroutines -----

  fn check_sub_decl(&mut self, decl: &mut SubDecl) -> CompileResult<()> {
    match decl.kind {
      SubKind::Forward { .. } => self.declare_sub(decl),
      SubKind::Define => {
        self.declare_sub(decl)?;
        self.check_sub_body(decl)
      }
      SubKind::Implement => {
        let id = match self.lookup(&decl.name) {
          Some(Binding::Sub(id)) => id,
          _ => {
            return Err(CompileError::semantic(
              decl.pos.clone(),
              format!("@impl without a matching @decl for \"{}\"", decl.name),
            ));
          }
        };
        let info = self.analysis.sub(id);
        if !info.forward || info.extern_name.is_some() {
          return Err(CompileError::semantic(
            decl.pos.clone(),
            format!("\"{}\" cannot be implemented here", decl.name),
          ));
        }
        if info.defined {
          return Err(CompileError::semantic(
            decl.pos.clone(),
            format!("\"{}\" is already implemented", decl.name),
          ));
        }
        // An @impl may restate the signature; it must then match the
        // @decl, whose parameter names stay authoritative.
        if !decl.params.is_empty() || !decl.returns.is_empty() {
          self.check_impl_signature(decl, id)?;
        }
        decl.id = Some(id);
        self.analysis.subs[id.0 as usize].defined = true;
        self.check_sub_body(decl)
      }
    }
  }

  fn check_impl_signature(&mut self, decl: &SubDecl, id: SubId) -> CompileResult<()> {
    let declared: Vec<VarId> = {
      let info = self.analysis.sub(id);
      info.params.iter().chain(info.returns.iter()).copied().collect()
    };
    let restated: Vec<&ParamDecl> = decl.params.iter().chain(decl.returns.iter()).collect();

    let param_count = self.analysis.sub(id).params.len();
    if decl.params.len() != param_count
      || decl.returns.len() != self.analysis.sub(id).returns.len()
    {
      return Err(CompileError::semantic(
        decl.pos.clone(),
        format!("signature of @impl \"{}\" does not match its @decl", decl.name),
      ));
    }

    for (slot, restated) in declared.iter().zip(restated) {
      let want = self.analysis.var(*slot).ty;
      let got = self.resolve_type(&restated.ty)?;
      if !self.analysis.types.same(want, got) {
        return Err(CompileError::semantic(
          decl.pos.clone(),
          format!("signature of @impl \"{}\" does not match its @decl", decl.name),
        ));
      }
    }
    Ok(())
  }

  fn declare_sub(&mut self, decl: &mut SubDecl) -> CompileResult<()> {
    let id = SubId(self.analysis.subs.len() as u32);

    let (params, returns, implements) = match &decl.implements {
      Some(interface_name) => {
        let interface = match self.lookup(interface_name) {
          Some(Binding::Type(t)) if self.analysis.types.as_interface(t).is_some() => t,
          _ => {
            return Err(CompileError::resolution(
              decl.pos.clone(),
              format!("\"{interface_name}\" is not an interface"),
            ));
          }
        };
        let (params, returns) = self
          .analysis
          .interface_slots
          .get(&interface)
          .cloned()
          .expect("interface has slots");
        (params, returns, Some(interface))
      }
      None => {
        let previous_sub = self.current_sub;
        self.current_sub = Some(id);
        let params = self.declare_sub_vars(&decl.params)?;
        let returns = self.declare_sub_vars(&decl.returns)?;
        self.current_sub = previous_sub;
        (params, returns, None)
      }
    };

    let (forward, extern_name, defined) = match &decl.kind {
      SubKind::Forward { extern_name } => (true, extern_name.clone(), false),
      _ => (false, None, true),
    };

    self.analysis.subs.push(SubInfo {
      name: decl.name.clone(),
      params,
      returns,
      implements,
      extern_name,
      parent: self.current_sub,
      defined,
      forward,
      calls: Vec::new(),
      pos: decl.pos.clone(),
    });

    // Nested subs share storage lifetime with their parent.
    if let Some(parent) = self.current_sub {
      self.analysis.subs[parent.0 as usize].calls.push(id);
    }

    decl.id = Some(id);
    self.declare(&decl.name, Binding::Sub(id), &decl.pos)
  }

  fn declare_sub_vars(&mut self, params: &[ParamDecl]) -> CompileResult<Vec<VarId>> {
    params
      .iter()
      .map(|p| {
        let ty = self.resolve_type(&p.ty)?;
        Ok(self.add_var(&p.name, ty, &Position::builtin()))
      })
      .collect()
  }

  fn check_sub_body(&mut self, decl: &mut SubDecl) -> CompileResult<()> {
    let id = decl.id.expect("sub was declared");
    let Some(body) = &mut decl.body else {
      return Ok(());
    };

    let previous_sub = self.current_sub;
    let previous_depth = self.loop_depth;
    self.current_sub = Some(id);
    self.loop_depth = 0;
    self.scopes.push(Scope::default());

    let info = self.analysis.sub(id);
    let bindings: Vec<(String, VarId)> = match info.implements {
      // The body of an implementor refers to the interface's parameter
      // names; the slots themselves carry mangled names.
      Some(interface) => {
        let def = self
          .analysis
          .types
          .as_interface(interface)
          .expect("implements resolves to an interface");
        def
          .params
          .iter()
          .chain(def.returns.iter())
          .map(|(name, _)| name.clone())
          .zip(info.params.iter().chain(info.returns.iter()).copied())
          .collect()
      }
      None => info
        .params
        .iter()
        .chain(info.returns.iter())
        .map(|v| (self.analysis.var(*v).name.clone(), *v))
        .collect(),
    };
    for (name, var) in bindings {
      self.bind(&name, Binding::Var(var));
    }

    let result = self.check_body(body);

    self.scopes.pop();
    self.current_sub = previous_sub;
    self.loop_depth = previous_depth;
    result
  }

  fn check_forward_completeness(&mut self) {
    for info in &self.analysis.subs {
      if info.forward && !info.defined && info.extern_name.is_none() {
        self.errors.push(CompileError::semantic(
          info.pos.clone(),
          format!("forward-declared \"{}\" was never implemented", info.name),
        ));
      }
    }
  }

  /// The language forbids recursion: the call graph must be acyclic.
  fn check_call_graph(&mut self) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
      White,
      Grey,
      Black,
    }

    fn visit(subs: &[SubInfo], marks: &mut [Mark], id: SubId) -> Option<SubId> {
      match marks[id.0 as usize] {
        Mark::Black => return None,
        Mark::Grey => return Some(id),
        Mark::White => {}
      }
      marks[id.0 as usize] = Mark::Grey;
      for callee in &subs[id.0 as usize].calls {
        if let Some(cycle) = visit(subs, marks, *callee) {
          return Some(cycle);
        }
      }
      marks[id.0 as usize] = Mark::Black;
      None
    }

    let mut marks = vec![Mark::White; self.analysis.subs.len()];
    for id in 0..self.analysis.subs.len() as u32 {
      if let Some(cycle) = visit(&self.analysis.subs, &mut marks, SubId(id)) {
        let info = self.analysis.sub(cycle);
        self.errors.push(CompileError::semantic(
          info.pos.clone(),
          format!("\"{}\" calls itself, directly or transitively", info.name),
        ));
        return;
      }
    }
  }

  // ----- Assignments -----

  fn check_assign(&mut self, target: &mut Expr, value: &mut Expr) -> CompileResult<()> {
    let target_ty = self.type_expr(target, None)?;
    if !is_lvalue(&target.kind) {
      return Err(CompileError::semantic(
        target.pos.clone(),
        "left-hand side is not assignable",
      ));
    }

    // Interface variables accept references to implementing subs.
    if self.analysis.types.as_interface(target_ty).is_some() {
      let got = self.type_expr(value, Some(target_ty))?;
      if let ExprKind::SubRef(sub) = value.kind {
        let implements = self.analysis.sub(sub).implements;
        if implements != Some(self.analysis.types.resolve(target_ty))
          && implements != Some(target_ty)
        {
          return Err(CompileError::type_error(
            value.pos.clone(),
            format!(
              "\"{}\" does not implement this interface",
              self.analysis.sub(sub).name
            ),
          ));
        }
        return Ok(());
      }
      return self.require_same(target_ty, got, &value.pos);
    }

    let value_ty = self.type_expr(value, Some(target_ty))?;
    if let ExprKind::Call { .. } = &value.kind {
      // A call in value position uses its first return slot; arity was
      // checked while typing the call.
    }
    self.require_same(target_ty, value_ty, &value.pos)
  }

  fn check_multi_assign(&mut self, targets: &mut [Expr], call: &mut Expr) -> CompileResult<()> {
    self.type_expr(call, None)?;
    let returns = match &call.kind {
      ExprKind::Call { target, .. } => match &target.kind {
        ExprKind::SubRef(sub) => self.analysis.sub(*sub).returns.clone(),
        _ => {
          let ty = target.ty.expect("call target is typed");
          let (_, returns) = self
            .analysis
            .interface_slots
            .get(&self.analysis.types.resolve(ty))
            .cloned()
            .unwrap_or_default();
          returns
        }
      },
      _ => unreachable!("parser guarantees a call"),
    };

    if returns.len() != targets.len() {
      return Err(CompileError::type_error(
        call.pos.clone(),
        format!(
          "call returns {} values but {} targets were given",
          returns.len(),
          targets.len()
        ),
      ));
    }

    for (target, ret) in targets.iter_mut().zip(&returns) {
      let target_ty = self.type_expr(target, None)?;
      if !is_lvalue(&target.kind) {
        return Err(CompileError::semantic(
          target.pos.clone(),
          "left-hand side is not assignable",
        ));
      }
      let ret_ty = self.analysis.var(*ret).ty;
      self.require_same(target_ty, ret_ty, &target.pos)?;
    }
    Ok(())
  }

  // ----- Conditions -----

  fn check_cond(&mut self, cond: &mut Expr) -> CompileResult<()> {
    match &mut cond.kind {
      ExprKind::Cmp { op: _, lhs, rhs } => {
        let lhs_ty;
        let rhs_ty;
        if is_untyped_literal(lhs) && !is_untyped_literal(rhs) {
          rhs_ty = self.type_expr(rhs, None)?;
          lhs_ty = self.type_expr(lhs, Some(rhs_ty))?;
        } else {
          lhs_ty = self.type_expr(lhs, None)?;
          rhs_ty = self.type_expr(rhs, Some(lhs_ty))?;
        }
        self.require_same(lhs_ty, rhs_ty, &cond.pos)?;
        if !self.analysis.types.is_integer(lhs_ty) && !self.analysis.types.is_pointer(lhs_ty) {
          return Err(CompileError::type_error(
            cond.pos.clone(),
            "only integers and pointers can be compared",
          ));
        }
        cond.ty = Some(ty::UINT8);
        Ok(())
      }
      ExprKind::Logical { lhs, rhs, .. } => {
        self.check_cond(lhs)?;
        self.check_cond(rhs)?;
        cond.ty = Some(ty::UINT8);
        Ok(())
      }
      ExprKind::Not(inner) => {
        self.check_cond(inner)?;
        cond.ty = Some(ty::UINT8);
        Ok(())
      }
      _ => {
        // A plain integer value is a truth test against zero.
        let ty = self.type_expr(cond, None)?;
        if !self.analysis.types.is_integer(ty) && !self.analysis.types.is_pointer(ty) {
          return Err(CompileError::type_error(
            cond.pos.clone(),
            "condition must compare, test an integer, or test a pointer",
          ));
        }
        Ok(())
      }
    }
  }

  // ----- Expressions -----

  fn require_same(&self, want: TypeId, got: TypeId, pos: &Position) -> CompileResult<()> {
    if self.analysis.types.same(want, got) {
      Ok(())
    } else {
      Err(CompileError::type_error(
        pos.clone(),
        format!(
          "expected type {}, found {}",
          self.analysis.types.name_of(want),
          self.analysis.types.name_of(got)
        ),
      ))
    }
  }

  fn type_expr(&mut self, expr: &mut Expr, expected: Option<TypeId>) -> CompileResult<TypeId> {
    let ty = self.type_expr_inner(expr, expected)?;
    expr.ty = Some(ty);
    Ok(ty)
  }

  fn type_expr_inner(&mut self, expr: &mut Expr, expected: Option<TypeId>) -> CompileResult<TypeId> {
    let pos = expr.pos.clone();
    match &mut expr.kind {
      ExprKind::Int(value) => {
        let ty = match expected {
          Some(t) if self.analysis.types.is_integer(t) => t,
          _ => ty::INTPTR,
        };
        *value = wrap_to_type(&self.analysis.types, *value, ty);
        Ok(ty)
      }
      ExprKind::Str(_) => Ok(self.analysis.types.ptr_to(ty::UINT8)),
      ExprKind::Nil => match expected {
        Some(t)
          if self.analysis.types.is_pointer(t)
            || self.analysis.types.as_interface(t).is_some() =>
        {
          Ok(t)
        }
        _ => Err(CompileError::type_error(
          pos,
          "nil needs a pointer or interface context",
        )),
      },
      ExprKind::Name(name) => {
        let name = name.clone();
        match self.lookup(&name) {
          Some(Binding::Var(id)) => {
            expr.kind = ExprKind::Var(id);
            Ok(self.analysis.var(id).ty)
          }
          Some(Binding::Const(value)) => {
            let ty = match expected {
              Some(t) if self.analysis.types.is_integer(t) => t,
              _ => ty::INTPTR,
            };
            expr.kind = ExprKind::Int(wrap_to_type(&self.analysis.types, value, ty));
            Ok(ty)
          }
          Some(Binding::Sub(id)) => {
            expr.kind = ExprKind::SubRef(id);
            match self.analysis.sub(id).implements {
              Some(interface) => Ok(interface),
              None => Err(CompileError::semantic(
                pos,
                format!("\"{name}\" can only be referenced through an interface"),
              )),
            }
          }
          Some(Binding::Type(_)) => Err(CompileError::semantic(
            pos,
            format!("type \"{name}\" cannot be used as a value"),
          )),
          None => Err(CompileError::resolution(
            pos,
            format!("undeclared identifier \"{name}\""),
          )),
        }
      }
      ExprKind::Var(id) => Ok(self.analysis.var(*id).ty),
      ExprKind::SubRef(id) => match self.analysis.sub(*id).implements {
        Some(interface) => Ok(interface),
        None => Err(CompileError::semantic(
          pos,
          "subroutine reference needs an interface",
        )),
      },
      ExprKind::Field {
        base,
        field,
        offset,
      } => {
        let base_ty = self.type_expr(base, None)?;
        // Accessing a field through a pointer dereferences implicitly.
        let record_ty = match self.analysis.types.pointee(base_ty) {
          Some(inner) => inner,
          None => base_ty,
        };
        let Some(record) = self.analysis.types.as_record(record_ty) else {
          return Err(CompileError::type_error(
            pos,
            format!(
              "type {} has no fields",
              self.analysis.types.name_of(base_ty)
            ),
          ));
        };
        let Some(def) = record.field(field) else {
          return Err(CompileError::resolution(
            pos,
            format!("record {} has no field \"{field}\"", record.name),
          ));
        };
        *offset = Some(def.offset);
        Ok(def.ty)
      }
      ExprKind::Index { base, index } => {
        let base_ty = self.type_expr(base, None)?;
        if !self.analysis.types.is_array(base_ty) {
          return Err(CompileError::type_error(
            base.pos.clone(),
            "only arrays can be indexed",
          ));
        }
        let index_ty = self.analysis.types.index_type(base_ty);
        let got = self.type_expr(index, Some(index_ty))?;
        self.require_same(index_ty, got, &index.pos)?;
        Ok(
          self
            .analysis
            .types
            .element_of(base_ty)
            .expect("arrays have elements"),
        )
      }
      ExprKind::Deref(inner) => {
        let inner_ty = self.type_expr(inner, None)?;
        self.analysis.types.pointee(inner_ty).ok_or_else(|| {
          CompileError::type_error(pos, "only pointers can be dereferenced")
        })
      }
      ExprKind::AddrOf(inner) => {
        if !matches!(inner.kind, ExprKind::Field { .. }) {
          return Err(CompileError::type_error(
            pos,
            "\"&\" is only legal on a record field",
          ));
        }
        let inner_ty = self.type_expr(inner, None)?;
        Ok(self.analysis.types.ptr_to(inner_ty))
      }
      ExprKind::Neg(inner) => {
        let ty = self.type_expr(inner, expected)?;
        if !self.analysis.types.is_integer(ty) {
          return Err(CompileError::type_error(pos, "negation needs an integer"));
        }
        Ok(ty)
      }
      ExprKind::Binary { op, lhs, rhs } => {
        let op = *op;
        if matches!(op, BinOp::Shl | BinOp::Shr) {
          let lhs_ty = self.type_expr(lhs, expected)?;
          if !self.analysis.types.is_integer(lhs_ty) {
            return Err(CompileError::type_error(pos, "shift needs an integer"));
          }
          let rhs_ty = self.type_expr(rhs, Some(ty::UINT8))?;
          if !self.analysis.types.same(rhs_ty, ty::UINT8) {
            return Err(CompileError::type_error(
              rhs.pos.clone(),
              "shift count must be a uint8",
            ));
          }
          return Ok(lhs_ty);
        }

        let lhs_ty;
        let rhs_ty;
        if is_untyped_literal(lhs) && !is_untyped_literal(rhs) {
          rhs_ty = self.type_expr(rhs, expected)?;
          lhs_ty = self.type_expr(lhs, Some(rhs_ty))?;
        } else {
          lhs_ty = self.type_expr(lhs, expected)?;
          rhs_ty = self.type_expr(rhs, Some(lhs_ty))?;
        }

        // Pointer arithmetic counts bytes, whatever the pointee is.
        if self.analysis.types.is_pointer(lhs_ty)
          && matches!(op, BinOp::Add | BinOp::Sub)
          && self.analysis.types.is_integer(rhs_ty)
        {
          return Ok(lhs_ty);
        }

        if !self.analysis.types.is_integer(lhs_ty) {
          return Err(CompileError::type_error(
            lhs.pos.clone(),
            "arithmetic needs integer operands",
          ));
        }
        self.require_same(lhs_ty, rhs_ty, &rhs.pos)?;
        Ok(lhs_ty)
      }
      ExprKind::Cmp { .. } | ExprKind::Logical { .. } | ExprKind::Not(_) => {
        Err(CompileError::semantic(
          pos,
          "comparison is only allowed in a conditional context",
        ))
      }
      ExprKind::Cast { expr: inner, to } => {
        let to = to.clone();
        let from = self.type_expr(inner, None)?;
        let target = self.resolve_type(&to)?;
        let types = &self.analysis.types;
        let ok = (types.is_integer(from) && types.is_integer(target))
          || (types.is_pointer(from) && types.is_pointer(target))
          || (types.is_pointer(from) && types.same(target, ty::INTPTR))
          || (types.same(from, ty::INTPTR) && types.is_pointer(target));
        if !ok {
          return Err(CompileError::type_error(
            pos,
            format!(
              "cannot cast {} to {}",
              types.name_of(from),
              types.name_of(target)
            ),
          ));
        }
        if let ExprKind::Int(value) = &mut inner.kind {
          *value = wrap_to_type(&self.analysis.types, *value, target);
        }
        Ok(target)
      }
      ExprKind::Call { target, args } => {
        let (params, returns, callee) = self.resolve_call_target(target)?;
        if args.len() != params.len() {
          return Err(CompileError::type_error(
            pos,
            format!(
              "call needs {} arguments but got {}",
              params.len(),
              args.len()
            ),
          ));
        }
        for (arg, param) in args.iter_mut().zip(&params) {
          let param_ty = self.analysis.var(*param).ty;
          // Interface-typed parameters accept implementing subs.
          let got = self.type_expr(arg, Some(param_ty))?;
          if let ExprKind::SubRef(sub) = arg.kind
            && self.analysis.types.as_interface(param_ty).is_some()
          {
            let implements = self.analysis.sub(sub).implements;
            if implements != Some(self.analysis.types.resolve(param_ty)) {
              return Err(CompileError::type_error(
                arg.pos.clone(),
                "subroutine does not implement the parameter's interface",
              ));
            }
            continue;
          }
          self.require_same(param_ty, got, &arg.pos)?;
        }

        if let Some(callee) = callee {
          match self.current_sub {
            Some(current) => self.analysis.subs[current.0 as usize].calls.push(callee),
            None => self.analysis.main_calls.push(callee),
          }
        }

        match returns.first() {
          Some(ret) => Ok(self.analysis.var(*ret).ty),
          None => {
            if expected.is_some() {
              return Err(CompileError::type_error(
                pos,
                "call returns nothing but a value is needed",
              ));
            }
            Ok(ty::INTPTR)
          }
        }
      }
      ExprKind::SizeOf(inner) => {
        let inner_ty = self.type_expr(inner, None)?;
        let Some(extent) = self.analysis.types.extent_of(inner_ty) else {
          return Err(CompileError::type_error(
            pos.clone(),
            "@sizeof needs an array with a known extent",
          ));
        };
        let ty = match expected {
          Some(t) if self.analysis.types.is_integer(t) => t,
          _ => ty::INTPTR,
        };
        expr.kind = ExprKind::Int(wrap_to_type(&self.analysis.types, extent as i64, ty));
        Ok(ty)
      }
      ExprKind::BytesOf(inner) => {
        // `@bytesof` accepts a type name or a value.
        let size = if let ExprKind::Name(name) = &inner.kind
          && let Some(Binding::Type(t)) = self.lookup(name)
        {
          self.analysis.types.size_of(t)
        } else {
          let inner_ty = self.type_expr(inner, None)?;
          self.analysis.types.size_of(inner_ty)
        };
        let ty = match expected {
          Some(t) if self.analysis.types.is_integer(t) => t,
          _ => ty::INTPTR,
        };
        expr.kind = ExprKind::Int(wrap_to_type(&self.analysis.types, size as i64, ty));
        Ok(ty)
      }
      ExprKind::IndexOf(_) => Err(CompileError::semantic(
        pos,
        "@indexof names a type; use it in a declaration",
      )),
      ExprKind::NextPtr(inner) | ExprKind::PrevPtr(inner) => {
        let inner_ty = self.type_expr(inner, None)?;
        if !self.analysis.types.is_pointer(inner_ty) {
          return Err(CompileError::type_error(
            pos,
            "@next/@prev need a pointer operand",
          ));
        }
        Ok(inner_ty)
      }
      ExprKind::ArrayInit(_) => Err(CompileError::semantic(
        pos,
        "brace initializer is only allowed in a variable declaration",
      )),
    }
  }

  /// Work out the parameter and return slots a call reads and writes,
  /// plus the callee when the call is direct.
  fn resolve_call_target(
    &mut self,
    target: &mut Expr,
  ) -> CompileResult<(Vec<VarId>, Vec<VarId>, Option<SubId>)> {
    if let ExprKind::Name(name) = &target.kind {
      let name = name.clone();
      match self.lookup(&name) {
        Some(Binding::Sub(id)) => {
          target.kind = ExprKind::SubRef(id);
          let info = self.analysis.sub(id);
          target.ty = Some(info.implements.unwrap_or(ty::INTPTR));
          return Ok((info.params.clone(), info.returns.clone(), Some(id)));
        }
        Some(_) => {}
        None => {
          return Err(CompileError::resolution(
            target.pos.clone(),
            format!("undeclared identifier \"{name}\""),
          ));
        }
      }
    }

    // Indirect call through an interface-typed expression.
    let ty = self.type_expr(target, None)?;
    let resolved = self.analysis.types.resolve(ty);
    if self.analysis.types.as_interface(resolved).is_none() {
      return Err(CompileError::type_error(
        target.pos.clone(),
        "call target is neither a subroutine nor an interface value",
      ));
    }
    let (params, returns) = self
      .analysis
      .interface_slots
      .get(&resolved)
      .cloned()
      .expect("interface has slots");
    self.indirect_calls.push((self.current_sub, resolved));
    Ok((params, returns, None))
  }

  /// An indirect call may land in any implementor of the interface; the
  /// overlay allocator and the recursion check both need those edges.
  fn expand_indirect_calls(&mut self) {
    for (caller, interface) in std::mem::take(&mut self.indirect_calls) {
      let implementors: Vec<SubId> = self
        .analysis
        .sub_ids()
        .filter(|id| self.analysis.sub(*id).implements == Some(interface))
        .collect();
      for callee in implementors {
        match caller {
          Some(caller) => self.analysis.subs[caller.0 as usize].calls.push(callee),
          None => self.analysis.main_calls.push(callee),
        }
      }
    }
  }
}

fn is_lvalue(kind: &ExprKind) -> bool {
  matches!(
    kind,
    ExprKind::Var(_) | ExprKind::Deref(_) | ExprKind::Index { .. } | ExprKind::Field { .. }
  )
}

fn is_untyped_literal(expr: &Expr) -> bool {
  match &expr.kind {
    ExprKind::Int(_) => true,
    ExprKind::Neg(inner) => is_untyped_literal(inner),
    _ => false,
  }
}

/// Evaluate a binary operator over constants with the target's
/// 2's-complement semantics.
pub fn eval_binop(op: BinOp, lhs: i64, rhs: i64, pos: &Position) -> CompileResult<i64> {
  Ok(match op {
    BinOp::Add => lhs.wrapping_add(rhs),
    BinOp::Sub => lhs.wrapping_sub(rhs),
    BinOp::Mul => lhs.wrapping_mul(rhs),
    BinOp::Div => {
      if rhs == 0 {
        return Err(CompileError::semantic(pos.clone(), "division by zero"));
      }
      lhs.wrapping_div(rhs)
    }
    BinOp::Mod => {
      if rhs == 0 {
        return Err(CompileError::semantic(pos.clone(), "division by zero"));
      }
      lhs.wrapping_rem(rhs)
    }
    BinOp::BitAnd => lhs & rhs,
    BinOp::BitOr => lhs | rhs,
    BinOp::BitXor => lhs ^ rhs,
    BinOp::Shl => lhs.wrapping_shl(rhs as u32 & 63),
    BinOp::Shr => ((lhs as u64).wrapping_shr(rhs as u32 & 63)) as i64,
  })
}

/// Truncate a constant to a type's width, sign-extending when signed.
/// Signed overflow wraps 2's-complement at the declared width.
pub fn wrap_to_type(types: &TypeTable, value: i64, ty: TypeId) -> i64 {
  let Some(width) = types.width_of(ty) else {
    return value & 0xFFFF;
  };
  let bits = width.bits();
  let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
  let truncated = (value as u64) & mask;
  if types.is_signed(ty) {
    let sign = 1u64 << (bits - 1);
    if truncated & sign != 0 {
      (truncated | !mask) as i64
    } else {
      truncated as i64
    }
  } else {
    truncated as i64
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::parser;
  use crate::preprocessor::preprocess_source;

  fn analyze_str(source: &str) -> Result<(Program, Analysis), Vec<CompileError>> {
    let tokens = preprocess_source(source, "test.cow", &[]).map_err(|e| vec![e])?;
    let mut program = parser::parse(tokens).map_err(|e| vec![e])?;
    let analysis = analyze(&mut program)?;
    Ok((program, analysis))
  }

  fn analyze_ok(source: &str) -> (Program, Analysis) {
    match analyze_str(source) {
      Ok(result) => result,
      Err(errors) => panic!("analysis failed: {errors:?}"),
    }
  }

  fn first_error(source: &str) -> CompileError {
    match analyze_str(source) {
      Ok(_) => panic!("expected an error"),
      Err(mut errors) => errors.remove(0),
    }
  }

  /// Walk an expression tree asserting the resolved-type invariant.
  fn assert_typed(expr: &Expr) {
    assert!(expr.ty.is_some(), "untyped expression: {:?}", expr.kind);
    match &expr.kind {
      ExprKind::Field { base, .. }
      | ExprKind::Deref(base)
      | ExprKind::AddrOf(base)
      | ExprKind::Neg(base)
      | ExprKind::Not(base)
      | ExprKind::Cast { expr: base, .. }
      | ExprKind::NextPtr(base)
      | ExprKind::PrevPtr(base) => assert_typed(base),
      ExprKind::Index { base, index } => {
        assert_typed(base);
        assert_typed(index);
      }
      ExprKind::Binary { lhs, rhs, .. }
      | ExprKind::Cmp { lhs, rhs, .. }
      | ExprKind::Logical { lhs, rhs, .. } => {
        assert_typed(lhs);
        assert_typed(rhs);
      }
      ExprKind::Call { target: _, args } => {
        for arg in args {
          assert_typed(arg);
        }
      }
      _ => {}
    }
  }

  fn assert_stmts_typed(stmts: &[Stmt]) {
    for stmt in stmts {
      match &stmt.kind {
        StmtKind::Var(decl) => {
          if let Some(init) = &decl.init {
            assert_typed(init);
          }
        }
        StmtKind::Assign { target, value } => {
          assert_typed(target);
          assert_typed(value);
        }
        StmtKind::If { arms, else_body } => {
          for arm in arms {
            assert_typed(&arm.cond);
            assert_stmts_typed(&arm.body);
          }
          assert_stmts_typed(else_body);
        }
        StmtKind::While { cond, body } => {
          assert_typed(cond);
          assert_stmts_typed(body);
        }
        StmtKind::Loop { body } => assert_stmts_typed(body),
        StmtKind::Expr(expr) => assert_typed(expr),
        StmtKind::Sub(sub) => {
          if let Some(body) = &sub.body {
            assert_stmts_typed(body);
          }
        }
        _ => {}
      }
    }
  }

  #[test]
  fn every_expression_gets_a_type() {
    let (program, _) = analyze_ok(
      "var a: uint8; var b: uint8;\
       sub Mix(n: uint8): (r: uint8) is r := n + 1; end sub;\
       a := Mix(b);\
       if a < 10 and b != 0 then a := a * 2; end if;\
       while a != 0 loop a := a - 1; end loop;",
    );
    assert_stmts_typed(&program.body);
  }

  #[test]
  fn literal_adopts_concrete_operand_type() {
    let (program, analysis) = analyze_ok("var x: uint8; x := x + 1;");
    let StmtKind::Assign { value, .. } = &program.body[1].kind else {
      panic!("expected assignment");
    };
    assert!(analysis.types.same(value.ty.expect("typed"), ty::UINT8));
  }

  #[test]
  fn mixed_operand_types_are_rejected() {
    let error = first_error("var a: uint8; var b: uint16; a := a + b;");
    assert!(matches!(error, CompileError::Type { .. }));
  }

  #[test]
  fn shift_count_must_be_uint8() {
    analyze_ok("var a: uint16; var n: uint8; a := a << n;");
    let error = first_error("var a: uint16; var n: uint16; a := a << n;");
    assert!(matches!(error, CompileError::Type { .. }));
  }

  #[test]
  fn address_of_is_field_only() {
    let error = first_error("var x: uint8; var p: [uint8]; p := &x;");
    assert!(matches!(error, CompileError::Type { .. }));
    analyze_ok(
      "record Pair is a: uint8; b: uint8; end record;\
       var pair: Pair; var p: [uint8]; p := &pair.b;",
    );
  }

  #[test]
  fn record_layout_with_inheritance() {
    let (_, analysis) = analyze_ok(
      "record Point is x: int16; y: int16; end record;\
       record Point3D: Point is z: int16; end record;\
       var p: Point3D;",
    );
    let ty = analysis.var(VarId(0)).ty;
    let record = analysis.types.as_record(ty).expect("record");
    let z = record.field("z").expect("field z");
    assert_eq!(z.offset, 4);
    assert_eq!(record.size, 6);
    // @bytesof equals max over fields of offset + size.
    let computed = record
      .fields
      .iter()
      .map(|f| f.offset + analysis.types.size_of(f.ty))
      .max()
      .unwrap_or(0);
    assert_eq!(record.size, computed);
  }

  #[test]
  fn at_fields_may_overlap_and_layout_resumes_after_high_water() {
    let (_, analysis) = analyze_ok(
      "record Packet is tag: uint8; word: uint16 @at(0); tail: uint8; end record;\
       var pk: Packet;",
    );
    let ty = analysis.var(VarId(0)).ty;
    let record = analysis.types.as_record(ty).expect("record");
    assert_eq!(record.field("word").expect("word").offset, 0);
    assert_eq!(record.field("tail").expect("tail").offset, 2);
    assert_eq!(record.size, 3);
  }

  #[test]
  fn recursion_is_rejected() {
    let errors = match analyze_str(
      "@decl sub A();\
       sub B() is A(); end sub;\
       @impl sub A is B(); end sub;",
    ) {
      Err(errors) => errors,
      Ok(_) => panic!("expected recursion error"),
    };
    assert!(errors.iter().any(|e| matches!(e, CompileError::Semantic { .. })));
  }

  #[test]
  fn forward_decl_without_impl_is_fatal() {
    let error = first_error("@decl sub Never(n: uint8);");
    assert!(matches!(error, CompileError::Semantic { .. }));
  }

  #[test]
  fn extern_forward_decl_needs_no_impl() {
    analyze_ok("@decl sub PutChar(c: uint8) @extern(\"putchar\"); PutChar('A');");
  }

  #[test]
  fn impl_without_decl_is_fatal() {
    let error = first_error("@impl sub Ghost is end sub;");
    assert!(matches!(error, CompileError::Semantic { .. }));
  }

  #[test]
  fn interface_assignment_checks_implementor() {
    analyze_ok(
      "interface Handler(code: uint8);\
       sub OnByte implements Handler is end sub;\
       var h: Handler; h := OnByte; h(7);",
    );
    let error = first_error(
      "interface Handler(code: uint8);\
       sub Plain(code: uint8) is end sub;\
       var h: Handler; h := Plain;",
    );
    assert!(matches!(error, CompileError::Semantic { .. } | CompileError::Type { .. }));
  }

  #[test]
  fn index_type_follows_extent() {
    analyze_ok("var a: uint8[10]; var i: uint8; a[i] := 0;");
    let error = first_error("var a: uint8[10]; var i: uint16; a[i] := 0;");
    assert!(matches!(error, CompileError::Type { .. }));
  }

  #[test]
  fn sizeof_and_bytesof_fold() {
    let (program, _) = analyze_ok(
      "var a: uint16[8]; var n: uint16;\
       n := @sizeof a; n := @bytesof a; n := @bytesof uint16;",
    );
    for stmt in &program.body[2..] {
      let StmtKind::Assign { value, .. } = &stmt.kind else {
        panic!("expected assignment");
      };
      assert!(matches!(value.kind, ExprKind::Int(_)));
    }
    let StmtKind::Assign { value, .. } = &program.body[3].kind else {
      panic!("expected assignment");
    };
    assert_eq!(value.as_int(), Some(16));
  }

  #[test]
  fn constants_fold_eagerly_and_cycles_cannot_form() {
    analyze_ok("const A := 4; const B := A * 2; var x: uint8; x := B;");
    let error = first_error("const A := B; const B := 1;");
    assert!(matches!(error, CompileError::Resolution { .. }));
  }

  #[test]
  fn nested_sub_sees_enclosing_locals() {
    analyze_ok(
      "sub Outer is var x: uint8; sub Inner is x := 1; end sub; Inner(); end sub;",
    );
  }

  #[test]
  fn break_outside_loop_is_fatal() {
    let error = first_error("break;");
    assert!(matches!(error, CompileError::Semantic { .. }));
  }

  #[test]
  fn signed_constant_wraparound() {
    let types = TypeTable::new();
    assert_eq!(wrap_to_type(&types, 130, ty::INT8), -126);
    assert_eq!(wrap_to_type(&types, 255, ty::UINT8), 255);
    assert_eq!(wrap_to_type(&types, 0x1_0005, ty::UINT16), 5);
  }
}
