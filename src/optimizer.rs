//! AST-level optimizer: a fixed set of passes run to fixpoint.
//!
//! Every pass preserves the type and source position of the nodes it
//! replaces, so the invariants established by semantic analysis keep
//! holding on the rewritten tree. Side effects are barriers throughout:
//! calls, stores through pointers, and inline assembly stop propagation,
//! elimination and motion.
//!
//! The driver loops until one complete iteration reports zero changes;
//! each applied rewrite emits a `tracing` debug event naming its pass,
//! which is the optimizer's change log.

use crate::error::Position;
use crate::parser::{
  AsmPart, BinOp, CmpOp, Expr, ExprKind, Program, Stmt, StmtKind,
};
use crate::sema::{Analysis, SubId, VarId, eval_binop, wrap_to_type};
use crate::ty::TypeId;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Upper bound on fixpoint iterations; a correct pass set converges far
/// earlier, this only guards against a rule pair fighting each other.
const MAX_ROUNDS: usize = 64;

pub fn optimize(program: &mut Program, analysis: &mut Analysis) {
  let mut optimizer = Optimizer {
    analysis,
    changes: 0,
  };

  for round in 0..MAX_ROUNDS {
    optimizer.changes = 0;
    optimizer.run_round(program);
    debug!(round, changes = optimizer.changes, "optimizer round done");
    if optimizer.changes == 0 {
      break;
    }
  }
}

struct Optimizer<'a> {
  analysis: &'a mut Analysis,
  changes: usize,
}

impl<'a> Optimizer<'a> {
  fn note(&mut self, pass: &str, pos: &Position) {
    debug!(pass, at = %pos, "rewrite applied");
    self.changes += 1;
  }

  fn run_round(&mut self, program: &mut Program) {
    self.simplify_region(&mut program.body);
    self.propagate_region(&mut program.body);
    self.eliminate_dead_code(&mut program.body);
    self.eliminate_dead_variables(program);
    self.cse_region(&mut program.body, None);
    self.licm_region(&mut program.body, None);
    self.reverse_loops(&mut program.body);
  }

  // ----- Expression simplification -----
  //
  // Constant folding, algebraic identities, strength reduction,
  // reassociation and the boolean/comparison rules share one bottom-up
  // traversal; each rule reports under its own pass name.

  fn simplify_region(&mut self, stmts: &mut [Stmt]) {
    self.walk_exprs(stmts, &mut |opt, expr| opt.simplify_expr(expr));
  }

  /// Apply `f` to every expression in the region, bottom-up, recursing
  /// into nested subroutine bodies as their own regions.
  fn walk_exprs(&mut self, stmts: &mut [Stmt], f: &mut dyn FnMut(&mut Self, &mut Expr)) {
    for stmt in stmts {
      match &mut stmt.kind {
        StmtKind::Var(decl) => {
          if let Some(init) = &mut decl.init {
            self.walk_expr(init, f);
          }
        }
        StmtKind::Assign { target, value } => {
          self.walk_expr(target, f);
          self.walk_expr(value, f);
        }
        StmtKind::MultiAssign { targets, call } => {
          for target in targets.iter_mut() {
            self.walk_expr(target, f);
          }
          self.walk_expr(call, f);
        }
        StmtKind::If { arms, else_body } => {
          for arm in arms.iter_mut() {
            self.walk_expr(&mut arm.cond, f);
            self.walk_exprs(&mut arm.body, f);
          }
          self.walk_exprs(else_body, f);
        }
        StmtKind::While { cond, body } => {
          self.walk_expr(cond, f);
          self.walk_exprs(body, f);
        }
        StmtKind::Loop { body } => self.walk_exprs(body, f),
        StmtKind::Case {
          scrutinee, arms, else_body, ..
        } => {
          self.walk_expr(scrutinee, f);
          for arm in arms.iter_mut() {
            self.walk_exprs(&mut arm.body, f);
          }
          self.walk_exprs(else_body, f);
        }
        StmtKind::Expr(expr) => self.walk_expr(expr, f),
        StmtKind::Sub(decl) => {
          if let Some(body) = &mut decl.body {
            self.walk_exprs(body, f);
          }
        }
        _ => {}
      }
    }
  }

  fn walk_expr(&mut self, expr: &mut Expr, f: &mut dyn FnMut(&mut Self, &mut Expr)) {
    match &mut expr.kind {
      ExprKind::Neg(inner)
      | ExprKind::Not(inner)
      | ExprKind::Deref(inner)
      | ExprKind::AddrOf(inner)
      | ExprKind::Cast { expr: inner, .. }
      | ExprKind::NextPtr(inner)
      | ExprKind::PrevPtr(inner)
      | ExprKind::SizeOf(inner)
      | ExprKind::BytesOf(inner)
      | ExprKind::IndexOf(inner) => self.walk_expr(inner, f),
      ExprKind::Field { base, .. } => self.walk_expr(base, f),
      ExprKind::Index { base, index } => {
        self.walk_expr(base, f);
        self.walk_expr(index, f);
      }
      ExprKind::Binary { lhs, rhs, .. }
      | ExprKind::Cmp { lhs, rhs, .. }
      | ExprKind::Logical { lhs, rhs, .. } => {
        self.walk_expr(lhs, f);
        self.walk_expr(rhs, f);
      }
      ExprKind::Call { args, .. } => {
        for arg in args.iter_mut() {
          self.walk_expr(arg, f);
        }
      }
      ExprKind::ArrayInit(elements) => {
        for element in elements.iter_mut() {
          self.walk_expr(element, f);
        }
      }
      _ => {}
    }
    f(self, expr);
  }

  fn simplify_expr(&mut self, expr: &mut Expr) {
    self.fold_constants(expr);
    self.reassociate(expr);
    self.simplify_algebraic(expr);
    self.reduce_strength(expr);
    self.simplify_booleans(expr);
    self.simplify_comparisons(expr);
  }

  fn fold_constants(&mut self, expr: &mut Expr) {
    let ty = expr.ty;
    match &expr.kind {
      ExprKind::Binary { op, lhs, rhs } => {
        if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
          if let Some(folded) = self.fold_binop(*op, a, b, ty, &expr.pos) {
            expr.kind = ExprKind::Int(folded);
            self.note("constant-folding", &expr.pos.clone());
          }
        }
      }
      ExprKind::Neg(inner) => {
        if let Some(a) = inner.as_int() {
          let folded = self.wrap(a.wrapping_neg(), ty);
          expr.kind = ExprKind::Int(folded);
          self.note("constant-folding", &expr.pos.clone());
        }
      }
      ExprKind::Cast { expr: inner, .. } => {
        if let Some(a) = inner.as_int() {
          let folded = self.wrap(a, ty);
          expr.kind = ExprKind::Int(folded);
          self.note("constant-folding", &expr.pos.clone());
        }
      }
      ExprKind::Cmp { op, lhs, rhs } => {
        if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
          let signed = lhs
            .ty
            .map(|t| self.analysis.types.is_signed(t))
            .unwrap_or(false);
          let truth = cmp_holds(*op, a, b, signed);
          expr.kind = ExprKind::Int(truth as i64);
          self.note("constant-folding", &expr.pos.clone());
        }
      }
      _ => {}
    }
  }

  /// 2's-complement fold at the node's declared width.
  fn fold_binop(&self, op: BinOp, a: i64, b: i64, ty: Option<TypeId>, pos: &Position) -> Option<i64> {
    let types = &self.analysis.types;
    let unsigned = ty.map(|t| !types.is_signed(t)).unwrap_or(true);
    let value = match op {
      BinOp::Div | BinOp::Mod if b == 0 => return None,
      BinOp::Div if unsigned => {
        let (a, b) = (self.unsigned_value(a, ty), self.unsigned_value(b, ty));
        (a / b) as i64
      }
      BinOp::Mod if unsigned => {
        let (a, b) = (self.unsigned_value(a, ty), self.unsigned_value(b, ty));
        (a % b) as i64
      }
      BinOp::Shr if unsigned => {
        let a = self.unsigned_value(a, ty);
        (a >> (b as u32 & 63)) as i64
      }
      _ => eval_binop(op, a, b, pos).ok()?,
    };
    Some(self.wrap(value, ty))
  }

  fn unsigned_value(&self, value: i64, ty: Option<TypeId>) -> u64 {
    let bits = ty
      .and_then(|t| self.analysis.types.width_of(t))
      .map(|w| w.bits())
      .unwrap_or(16);
    (value as u64) & (if bits == 64 { u64::MAX } else { (1 << bits) - 1 })
  }

  fn wrap(&self, value: i64, ty: Option<TypeId>) -> i64 {
    match ty {
      Some(t) => wrap_to_type(&self.analysis.types, value, t),
      None => value,
    }
  }

  /// Group constants rightward so folding and the code generator see a
  /// canonical shape: `(a+1)+2` becomes `a+3`, `2*a` becomes `a*2`.
  fn reassociate(&mut self, expr: &mut Expr) {
    if !matches!(expr.kind, ExprKind::Binary { .. }) {
      return;
    }
    let pos = expr.pos.clone();
    let ty = expr.ty;

    let kind = std::mem::replace(&mut expr.kind, ExprKind::Int(0));
    let ExprKind::Binary { op, mut lhs, mut rhs } = kind else {
      unreachable!("checked above");
    };

    if op.is_commutative() && lhs.as_int().is_some() && rhs.as_int().is_none() {
      std::mem::swap(&mut lhs, &mut rhs);
      expr.kind = ExprKind::Binary { op, lhs, rhs };
      self.note("reassociation", &pos);
      return;
    }

    // `(a op c1) op c2` with both constants foldable.
    let groupable = op.is_commutative()
      && rhs.as_int().is_some()
      && matches!(
        &lhs.kind,
        ExprKind::Binary { op: inner, rhs: c1, .. } if *inner == op && c1.as_int().is_some()
      );
    if groupable {
      let c2 = rhs.as_int().expect("checked above");
      let ExprKind::Binary { lhs: a, rhs: c1, .. } = lhs.kind else {
        unreachable!("checked above");
      };
      let c1 = c1.as_int().expect("checked above");
      if let Some(folded) = self.fold_binop(op, c1, c2, ty, &pos) {
        expr.kind = ExprKind::Binary {
          op,
          lhs: a,
          rhs: Box::new(Expr::typed_int(folded, pos.clone(), ty)),
        };
        self.note("reassociation", &pos);
        return;
      }
      // Folding refused (division by zero); the original operands were
      // consumed, so rebuild the inner node unchanged.
      unreachable!("commutative operators always fold");
    }

    expr.kind = ExprKind::Binary { op, lhs, rhs };
  }

  fn simplify_algebraic(&mut self, expr: &mut Expr) {
    let ExprKind::Binary { op, lhs, rhs } = &expr.kind else {
      return;
    };
    let op = *op;
    let pos = expr.pos.clone();
    let ty = expr.ty;

    // `x op c` identities.
    if let Some(c) = rhs.as_int() {
      let keep_lhs = matches!(
        (op, c),
        (BinOp::Add, 0)
          | (BinOp::Sub, 0)
          | (BinOp::Mul, 1)
          | (BinOp::Div, 1)
          | (BinOp::BitOr, 0)
          | (BinOp::BitXor, 0)
          | (BinOp::Shl, 0)
          | (BinOp::Shr, 0)
      );
      if keep_lhs {
        let lhs = (**lhs).clone();
        *expr = Expr { ty, ..lhs };
        self.note("algebraic-simplification", &pos);
        return;
      }

      let to_zero = matches!((op, c), (BinOp::Mul, 0) | (BinOp::BitAnd, 0));
      if to_zero && is_pure(lhs) {
        expr.kind = ExprKind::Int(0);
        self.note("algebraic-simplification", &pos);
        return;
      }
    }

    // `x - x` and `x ^ x`.
    if matches!(op, BinOp::Sub | BinOp::BitXor) && is_pure(lhs) && expr_eq(lhs, rhs) {
      expr.kind = ExprKind::Int(0);
      self.note("algebraic-simplification", &pos);
    }
  }

  fn reduce_strength(&mut self, expr: &mut Expr) {
    let constant = match &expr.kind {
      ExprKind::Binary { rhs, .. } => rhs.as_int(),
      _ => None,
    };
    let Some(c) = constant else {
      return;
    };

    let pos = expr.pos.clone();
    let ty = expr.ty;
    let unsigned = ty
      .map(|t| !self.analysis.types.is_signed(t))
      .unwrap_or(false);

    let kind = std::mem::replace(&mut expr.kind, ExprKind::Int(0));
    let ExprKind::Binary { op, lhs, rhs } = kind else {
      unreachable!("checked above");
    };

    // `x * 2` is an add; the left operand is duplicated, so it has to be
    // cheap to re-evaluate.
    if op == BinOp::Mul && c == 2 && is_cheap(&lhs) {
      let copy = (*lhs).clone();
      expr.kind = ExprKind::Binary {
        op: BinOp::Add,
        lhs,
        rhs: Box::new(copy),
      };
      self.note("strength-reduction", &pos);
      return;
    }

    let shift = |k: u32| Box::new(Expr::typed_int(k as i64, pos.clone(), Some(crate::ty::UINT8)));

    match (op, power_of_two(c)) {
      (BinOp::Mul, Some(k)) if c > 2 => {
        expr.kind = ExprKind::Binary {
          op: BinOp::Shl,
          lhs,
          rhs: shift(k),
        };
        self.note("strength-reduction", &pos);
      }
      (BinOp::Div, Some(k)) if unsigned && c > 1 => {
        expr.kind = ExprKind::Binary {
          op: BinOp::Shr,
          lhs,
          rhs: shift(k),
        };
        self.note("strength-reduction", &pos);
      }
      (BinOp::Mod, Some(_)) if unsigned && c > 1 => {
        expr.kind = ExprKind::Binary {
          op: BinOp::BitAnd,
          lhs,
          rhs: Box::new(Expr::typed_int(c - 1, pos.clone(), ty)),
        };
        self.note("strength-reduction", &pos);
      }
      _ => {
        expr.kind = ExprKind::Binary { op, lhs, rhs };
      }
    }
  }

  fn simplify_booleans(&mut self, expr: &mut Expr) {
    if !matches!(expr.kind, ExprKind::Not(_)) {
      return;
    }
    let pos = expr.pos.clone();

    let kind = std::mem::replace(&mut expr.kind, ExprKind::Int(0));
    let ExprKind::Not(mut inner) = kind else {
      unreachable!("checked above");
    };

    let inner_kind = std::mem::replace(&mut inner.kind, ExprKind::Int(0));
    match inner_kind {
      ExprKind::Not(grand) => {
        *expr = *grand;
        self.note("boolean-simplification", &pos);
      }
      ExprKind::Cmp { op, lhs, rhs } => {
        expr.kind = ExprKind::Cmp {
          op: op.negated(),
          lhs,
          rhs,
        };
        self.note("boolean-simplification", &pos);
      }
      ExprKind::Int(value) => {
        expr.kind = ExprKind::Int((value == 0) as i64);
        self.note("boolean-simplification", &pos);
      }
      other => {
        inner.kind = other;
        expr.kind = ExprKind::Not(inner);
      }
    }
  }

  fn simplify_comparisons(&mut self, expr: &mut Expr) {
    let ExprKind::Cmp { op, lhs, rhs } = &mut expr.kind else {
      return;
    };
    let pos = expr.pos.clone();

    // `x == x` holds, `x != x` (and the strict orders) cannot.
    if is_pure(lhs) && expr_eq(lhs, rhs) {
      let truth = matches!(op, CmpOp::Eq | CmpOp::Le | CmpOp::Ge) as i64;
      expr.kind = ExprKind::Int(truth);
      self.note("comparison-simplification", &pos);
      return;
    }

    // Constants move to the right so the code generator sees one shape.
    if lhs.as_int().is_some() && rhs.as_int().is_none() {
      *op = op.swapped();
      std::mem::swap(lhs, rhs);
      self.note("comparison-simplification", &pos);
    }
  }

  // ----- Propagation: constants, copies, dead stores -----

  fn propagate_region(&mut self, stmts: &mut Vec<Stmt>) {
    let mut env: PropEnv = HashMap::new();
    self.propagate_list(stmts, &mut env);
  }

  fn propagate_list(&mut self, stmts: &mut Vec<Stmt>, env: &mut PropEnv) {
    let mut index = 0;
    while index < stmts.len() {
      let remove = self.propagate_stmt(&mut stmts[index], env);
      if remove {
        stmts.remove(index);
      } else {
        index += 1;
      }
    }
  }

  /// Returns true when the statement became a dead store and should go.
  fn propagate_stmt(&mut self, stmt: &mut Stmt, env: &mut PropEnv) -> bool {
    match &mut stmt.kind {
      StmtKind::Var(decl) => {
        if let Some(init) = &mut decl.init {
          self.substitute(init, env);
          if contains_call(init) {
            env.clear();
          }
          if let (Some(var), Some(value)) = (decl.var, init.as_int()) {
            env.insert(var, PropValue::Const(value));
          }
        }
        false
      }
      StmtKind::Assign { target, value } => {
        self.substitute_reads_in_target(target, env);
        self.substitute(value, env);
        if contains_call(value) || contains_call(target) {
          env.clear();
        }

        if let ExprKind::Var(var) = target.kind {
          let var = var;
          // Dead store: the variable already holds this value.
          if let Some(value_int) = value.as_int()
            && env.get(&var) == Some(&PropValue::Const(value_int))
          {
            self.note("dead-store-elimination", &stmt.pos);
            return true;
          }
          if let ExprKind::Var(source) = value.kind
            && source == var
          {
            self.note("dead-store-elimination", &stmt.pos);
            return true;
          }

          invalidate(env, var);
          match value.kind {
            ExprKind::Int(value_int) => {
              env.insert(var, PropValue::Const(value_int));
            }
            ExprKind::Var(source) if source != var => {
              env.insert(var, PropValue::Copy(source));
            }
            _ => {}
          }
        }
        // Stores through pointers, into arrays or record fields cannot
        // overwrite a scalar: scalars never have their address taken.
        false
      }
      StmtKind::MultiAssign { targets, call } => {
        self.substitute(call, env);
        env.clear();
        for target in targets.iter() {
          if let ExprKind::Var(var) = target.kind {
            invalidate(env, var);
          }
        }
        false
      }
      StmtKind::Expr(expr) => {
        self.substitute(expr, env);
        env.clear();
        false
      }
      StmtKind::Asm { .. } => {
        env.clear();
        false
      }
      StmtKind::If { arms, else_body } => {
        let mut exits: Vec<PropEnv> = Vec::new();
        let mut entry = env.clone();
        for arm in arms.iter_mut() {
          self.substitute(&mut arm.cond, &entry);
          if contains_call(&arm.cond) {
            entry.clear();
          }
          let mut arm_env = entry.clone();
          self.propagate_list(&mut arm.body, &mut arm_env);
          exits.push(arm_env);
        }
        let mut else_env = entry.clone();
        self.propagate_list(else_body, &mut else_env);
        exits.push(else_env);

        *env = intersect_envs(&exits);
        false
      }
      StmtKind::While { cond, body } => {
        // Anything the body assigns is unknown before the condition runs
        // again, and unknown after the loop.
        restrict_to_loop_safe(env, body);
        self.substitute(cond, env);
        if contains_call(cond) {
          env.clear();
        }
        let mut body_env = env.clone();
        self.propagate_list(body, &mut body_env);
        restrict_to_loop_safe(env, body);
        false
      }
      StmtKind::Loop { body } => {
        restrict_to_loop_safe(env, body);
        let mut body_env = env.clone();
        self.propagate_list(body, &mut body_env);
        restrict_to_loop_safe(env, body);
        false
      }
      StmtKind::Case {
        scrutinee,
        arms,
        else_body,
      } => {
        self.substitute(scrutinee, env);
        if contains_call(scrutinee) {
          env.clear();
        }
        let entry = env.clone();
        let mut exits: Vec<PropEnv> = Vec::new();
        for arm in arms.iter_mut() {
          let mut arm_env = entry.clone();
          self.propagate_list(&mut arm.body, &mut arm_env);
          exits.push(arm_env);
        }
        let mut else_env = entry.clone();
        self.propagate_list(else_body, &mut else_env);
        exits.push(else_env);
        *env = intersect_envs(&exits);
        false
      }
      StmtKind::Sub(decl) => {
        if let Some(body) = &mut decl.body {
          let mut sub_env = HashMap::new();
          self.propagate_list(body, &mut sub_env);
        }
        false
      }
      _ => false,
    }
  }

  /// Replace variable reads according to the environment.
  fn substitute(&mut self, expr: &mut Expr, env: &PropEnv) {
    let mut rewrites: Vec<(Position, &'static str)> = Vec::new();
    substitute_inner(expr, env, &mut rewrites);
    for (pos, pass) in rewrites {
      self.note(pass, &pos);
    }
  }

  /// An assignment target is not a read, but its index and base
  /// subexpressions are.
  fn substitute_reads_in_target(&mut self, target: &mut Expr, env: &PropEnv) {
    match &mut target.kind {
      ExprKind::Index { base, index } => {
        self.substitute_reads_in_target(base, env);
        self.substitute(index, env);
      }
      ExprKind::Field { base, .. } => self.substitute_reads_in_target(base, env),
      ExprKind::Deref(inner) => self.substitute(inner, env),
      _ => {}
    }
  }

  // ----- Dead code elimination -----

  fn eliminate_dead_code(&mut self, stmts: &mut Vec<Stmt>) {
    let mut index = 0;
    let mut terminated = false;
    while index < stmts.len() {
      if terminated && !is_declaration(&stmts[index]) {
        self.note("dead-code-elimination", &stmts[index].pos);
        stmts.remove(index);
        continue;
      }

      let replacement = self.dce_stmt(&mut stmts[index]);
      match replacement {
        Some(body) => {
          let pos = stmts[index].pos.clone();
          stmts.splice(index..=index, body);
          self.note("dead-code-elimination", &pos);
          continue;
        }
        None => {}
      }

      if matches!(
        stmts[index].kind,
        StmtKind::Break | StmtKind::Continue | StmtKind::Return
      ) {
        terminated = true;
      }
      index += 1;
    }
  }

  /// Returns a replacement statement list when the whole statement
  /// reduces; recurses into bodies otherwise.
  fn dce_stmt(&mut self, stmt: &mut Stmt) -> Option<Vec<Stmt>> {
    match &mut stmt.kind {
      StmtKind::If { arms, else_body } => {
        // A false arm drops; a true arm drops everything after it.
        let mut index = 0;
        while index < arms.len() {
          match arms[index].cond.as_int() {
            Some(0) => {
              self.note("dead-code-elimination", &arms[index].cond.pos);
              arms.remove(index);
            }
            Some(_) => {
              arms.truncate(index + 1);
              else_body.clear();
              break;
            }
            None => index += 1,
          }
        }

        if arms.is_empty() {
          return Some(std::mem::take(else_body));
        }
        if arms.len() == 1 && arms[0].cond.as_int().is_some() {
          // `if 1 then body end if` is just the body.
          return Some(std::mem::take(&mut arms[0].body));
        }

        for arm in arms.iter_mut() {
          self.eliminate_dead_code(&mut arm.body);
        }
        self.eliminate_dead_code(else_body);
        None
      }
      StmtKind::While { cond, body } => {
        if cond.as_int() == Some(0) {
          return Some(Vec::new());
        }
        self.eliminate_dead_code(body);
        None
      }
      StmtKind::Loop { body } => {
        self.eliminate_dead_code(body);
        None
      }
      StmtKind::Case { arms, else_body, .. } => {
        for arm in arms.iter_mut() {
          self.eliminate_dead_code(&mut arm.body);
        }
        self.eliminate_dead_code(else_body);
        None
      }
      StmtKind::Sub(decl) => {
        if let Some(body) = &mut decl.body {
          self.eliminate_dead_code(body);
        }
        None
      }
      _ => None,
    }
  }

  // ----- Dead variable elimination -----

  fn eliminate_dead_variables(&mut self, program: &mut Program) {
    let mut reads: HashSet<VarId> = HashSet::new();

    // Return slots are read by callers, interface slots by indirect
    // callers; both count as live.
    for sub in 0..self.analysis.subs.len() as u32 {
      for ret in &self.analysis.sub(SubId(sub)).returns {
        reads.insert(*ret);
      }
    }
    for (params, returns) in self.analysis.interface_slots.values() {
      reads.extend(params.iter().copied());
      reads.extend(returns.iter().copied());
    }

    collect_reads(&program.body, &mut reads);

    self.remove_dead_assignments(&mut program.body, &reads);
  }

  fn remove_dead_assignments(&mut self, stmts: &mut Vec<Stmt>, reads: &HashSet<VarId>) {
    let mut index = 0;
    while index < stmts.len() {
      let mut remove = false;
      let mut cleared = false;
      match &mut stmts[index].kind {
        StmtKind::Assign { target, value } => {
          if let ExprKind::Var(var) = target.kind {
            remove = !reads.contains(&var)
              && self.analysis.var(var).owner.is_some()
              && is_pure(value);
          }
        }
        StmtKind::Var(decl) => {
          if let Some(var) = decl.var
            && !reads.contains(&var)
            && self.analysis.var(var).owner.is_some()
            && decl.init.as_ref().map(is_pure).unwrap_or(false)
          {
            decl.init = None;
            cleared = true;
          }
        }
        StmtKind::If { arms, else_body } => {
          for arm in arms.iter_mut() {
            self.remove_dead_assignments(&mut arm.body, reads);
          }
          self.remove_dead_assignments(else_body, reads);
        }
        StmtKind::While { body, .. } | StmtKind::Loop { body } => {
          self.remove_dead_assignments(body, reads);
        }
        StmtKind::Case { arms, else_body, .. } => {
          for arm in arms.iter_mut() {
            self.remove_dead_assignments(&mut arm.body, reads);
          }
          self.remove_dead_assignments(else_body, reads);
        }
        StmtKind::Sub(decl) => {
          if let Some(body) = &mut decl.body {
            self.remove_dead_assignments(body, reads);
          }
        }
        _ => {}
      }

      if remove {
        let pos = stmts[index].pos.clone();
        stmts.remove(index);
        self.note("dead-variable-elimination", &pos);
      } else {
        if cleared {
          let pos = stmts[index].pos.clone();
          self.note("dead-variable-elimination", &pos);
        }
        index += 1;
      }
    }
  }

  // ----- Common subexpression elimination -----

  fn cse_region(&mut self, stmts: &mut Vec<Stmt>, owner: Option<SubId>) {
    // One rewrite per round keeps the bookkeeping simple; the fixpoint
    // driver reruns until the block is clean.
    self.cse_list(stmts, owner);
  }

  fn cse_list(&mut self, stmts: &mut Vec<Stmt>, owner: Option<SubId>) {
    // Recurse into nested bodies first.
    for stmt in stmts.iter_mut() {
      match &mut stmt.kind {
        StmtKind::If { arms, else_body } => {
          for arm in arms.iter_mut() {
            self.cse_list(&mut arm.body, owner);
          }
          self.cse_list(else_body, owner);
        }
        StmtKind::While { body, .. } | StmtKind::Loop { body } => {
          self.cse_list(body, owner)
        }
        StmtKind::Case { arms, else_body, .. } => {
          for arm in arms.iter_mut() {
            self.cse_list(&mut arm.body, owner);
          }
          self.cse_list(else_body, owner);
        }
        StmtKind::Sub(decl) => {
          let id = decl.id;
          if let Some(body) = &mut decl.body {
            self.cse_list(body, id);
          }
        }
        _ => {}
      }
    }

    // Then scan straight-line runs in this list.
    let Some((first, candidate)) = self.find_common_subexpr(stmts) else {
      return;
    };

    let ty = candidate.ty.expect("sema typed every expression");
    let pos = candidate.pos.clone();
    let temp = self.analysis.add_temp(owner, ty, pos.clone());

    let mut replaced = 0usize;
    let mut killed: HashSet<VarId> = HashSet::new();
    for stmt in stmts[first..].iter_mut() {
      if !is_straightline(stmt) {
        break;
      }
      if let Some(value) = assigned_value_mut(stmt) {
        if !vars_of(&candidate).is_disjoint(&killed) {
          break;
        }
        replaced += replace_subexpr(value, &candidate, temp);
      }
      if let Some(var) = assigned_var(stmt) {
        killed.insert(var);
      }
      if stmt_is_barrier(stmt) {
        break;
      }
    }

    if replaced >= 2 {
      let assign = Stmt {
        kind: StmtKind::Assign {
          target: Expr {
            kind: ExprKind::Var(temp),
            pos: pos.clone(),
            ty: Some(ty),
          },
          value: candidate.clone(),
        },
        pos: pos.clone(),
      };
      stmts.insert(first, assign);
      self.note("common-subexpression-elimination", &pos);
    } else {
      // Not actually shared; undo by substituting the expression back.
      for stmt in stmts[first..].iter_mut() {
        if let Some(value) = assigned_value_mut(stmt) {
          restore_subexpr(value, temp, &candidate);
        }
      }
    }
  }

  /// Find a pure subexpression that occurs at least twice in a
  /// straight-line run, with no intervening reassignment of its inputs.
  fn find_common_subexpr(&self, stmts: &[Stmt]) -> Option<(usize, Expr)> {
    for first in 0..stmts.len() {
      if !is_straightline(&stmts[first]) {
        continue;
      }
      let Some(value) = assigned_value(&stmts[first]) else {
        continue;
      };
      let mut candidates = Vec::new();
      collect_candidates(value, &mut candidates);

      for candidate in candidates {
        let inputs = vars_of(&candidate);
        let mut seen = 0usize;
        let mut killed: HashSet<VarId> = HashSet::new();
        for stmt in stmts[first..].iter() {
          if !is_straightline(stmt) {
            break;
          }
          if !inputs.is_disjoint(&killed) {
            break;
          }
          if let Some(value) = assigned_value(stmt) {
            seen += count_subexpr(value, &candidate);
          }
          if let Some(var) = assigned_var(stmt) {
            killed.insert(var);
          }
          if stmt_is_barrier(stmt) {
            break;
          }
        }
        if seen >= 2 {
          return Some((first, candidate));
        }
      }
    }
    None
  }

  // ----- Loop-invariant code motion -----

  fn licm_region(&mut self, stmts: &mut Vec<Stmt>, owner: Option<SubId>) {
    let mut index = 0;
    while index < stmts.len() {
      match &mut stmts[index].kind {
        StmtKind::If { arms, else_body } => {
          for arm in arms.iter_mut() {
            self.licm_region(&mut arm.body, owner);
          }
          self.licm_region(else_body, owner);
          index += 1;
        }
        StmtKind::Case { arms, else_body, .. } => {
          for arm in arms.iter_mut() {
            self.licm_region(&mut arm.body, owner);
          }
          self.licm_region(else_body, owner);
          index += 1;
        }
        StmtKind::Sub(decl) => {
          let id = decl.id;
          if let Some(body) = &mut decl.body {
            self.licm_region(body, id);
          }
          index += 1;
        }
        StmtKind::While { .. } | StmtKind::Loop { .. } => {
          if let Some(pre) = self.hoist_invariant(&mut stmts[index], owner) {
            stmts.insert(index, pre);
            index += 2;
          } else {
            index += 1;
          }
        }
        _ => index += 1,
      }
    }
  }

  /// Hoist one invariant subexpression out of a loop, returning the
  /// pre-header assignment to insert before it.
  fn hoist_invariant(&mut self, stmt: &mut Stmt, owner: Option<SubId>) -> Option<Stmt> {
    let (cond, body): (Option<&mut Expr>, &mut Vec<Stmt>) = match &mut stmt.kind {
      StmtKind::While { cond, body } => (Some(cond), body),
      StmtKind::Loop { body } => (None, body),
      _ => return None,
    };

    let Some(assigned) = assigned_vars_in(body) else {
      // A call or inline assembly in the body blocks all motion.
      return None;
    };

    // Inner loops first.
    self.licm_region(body, owner);

    let mut candidate: Option<Expr> = None;
    let mut probe = |expr: &Expr| {
      if candidate.is_some() {
        return;
      }
      let mut found = Vec::new();
      collect_candidates(expr, &mut found);
      for c in found {
        if vars_of(&c).is_disjoint(&assigned) {
          candidate = Some(c);
          return;
        }
      }
    };

    if let Some(cond) = &cond {
      probe(cond);
    }
    for inner in body.iter() {
      if let Some(value) = assigned_value(inner) {
        probe(value);
      }
    }

    let candidate = candidate?;
    let ty = candidate.ty.expect("sema typed every expression");
    let pos = candidate.pos.clone();
    let temp = self.analysis.add_temp(owner, ty, pos.clone());

    if let Some(cond) = cond {
      replace_subexpr(cond, &candidate, temp);
    }
    for inner in body.iter_mut() {
      if let Some(value) = assigned_value_mut(inner) {
        replace_subexpr(value, &candidate, temp);
      }
    }

    self.note("loop-invariant-code-motion", &pos);
    Some(Stmt {
      kind: StmtKind::Assign {
        target: Expr {
          kind: ExprKind::Var(temp),
          pos: pos.clone(),
          ty: Some(ty),
        },
        value: candidate,
      },
      pos,
    })
  }

  // ----- Loop reversal -----

  /// `i := 0; while i < N loop body; i := i + 1 end loop` becomes a
  /// countdown when the body ignores `i`, so the code generator can use
  /// a decrement that sets the zero flag.
  fn reverse_loops(&mut self, stmts: &mut Vec<Stmt>) {
    // Recurse first.
    for stmt in stmts.iter_mut() {
      match &mut stmt.kind {
        StmtKind::If { arms, else_body } => {
          for arm in arms.iter_mut() {
            self.reverse_loops(&mut arm.body);
          }
          self.reverse_loops(else_body);
        }
        StmtKind::While { body, .. } | StmtKind::Loop { body } => self.reverse_loops(body),
        StmtKind::Case { arms, else_body, .. } => {
          for arm in arms.iter_mut() {
            self.reverse_loops(&mut arm.body);
          }
          self.reverse_loops(else_body);
        }
        StmtKind::Sub(decl) => {
          if let Some(body) = &mut decl.body {
            self.reverse_loops(body);
          }
        }
        _ => {}
      }
    }

    for index in 0..stmts.len().saturating_sub(1) {
      if self.try_reverse_at(stmts, index) {
        return;
      }
    }
  }

  fn try_reverse_at(&mut self, stmts: &mut [Stmt], index: usize) -> bool {
    // `i := 0`
    let StmtKind::Assign { target, value } = &stmts[index].kind else {
      return false;
    };
    let ExprKind::Var(counter) = target.kind else {
      return false;
    };
    if value.as_int() != Some(0) {
      return false;
    }
    let counter_ty = target.ty.expect("sema typed every expression");
    if self.analysis.types.size_of(counter_ty) != 1
      || self.analysis.types.is_signed(counter_ty)
    {
      return false;
    }

    // `while i < N loop ... i := i + 1 end loop`
    let StmtKind::While { cond, body } = &stmts[index + 1].kind else {
      return false;
    };
    let ExprKind::Cmp {
      op: CmpOp::Lt,
      lhs,
      rhs,
    } = &cond.kind
    else {
      return false;
    };
    if !matches!(lhs.kind, ExprKind::Var(v) if v == counter) {
      return false;
    }
    let Some(limit) = rhs.as_int() else {
      return false;
    };
    if limit <= 0 {
      return false;
    }

    let Some((last, rest)) = body.split_last() else {
      return false;
    };
    let StmtKind::Assign {
      target: inc_target,
      value: inc_value,
    } = &last.kind
    else {
      return false;
    };
    if !matches!(inc_target.kind, ExprKind::Var(v) if v == counter) {
      return false;
    }
    let ExprKind::Binary {
      op: BinOp::Add,
      lhs: inc_lhs,
      rhs: inc_rhs,
    } = &inc_value.kind
    else {
      return false;
    };
    if !matches!(inc_lhs.kind, ExprKind::Var(v) if v == counter) || inc_rhs.as_int() != Some(1)
    {
      return false;
    }

    // The rest of the body must ignore the counter entirely, and must
    // not hide a reader behind a call or inline assembly. Stores
    // through pointers are fine: nothing can alias a scalar.
    for inner in rest {
      if stmt_mentions_var(inner, counter) || stmt_hides_reader(inner) {
        return false;
      }
    }

    // Rewrite in place.
    let pos = stmts[index].pos.clone();
    let counter_expr = |ty: TypeId| Expr {
      kind: ExprKind::Var(counter),
      pos: pos.clone(),
      ty: Some(ty),
    };

    if let StmtKind::Assign { value, .. } = &mut stmts[index].kind {
      *value = Expr::typed_int(limit, pos.clone(), Some(counter_ty));
    }
    if let StmtKind::While { cond, body } = &mut stmts[index + 1].kind {
      *cond = Expr {
        kind: ExprKind::Cmp {
          op: CmpOp::Ne,
          lhs: Box::new(counter_expr(counter_ty)),
          rhs: Box::new(Expr::typed_int(0, pos.clone(), Some(counter_ty))),
        },
        pos: pos.clone(),
        ty: Some(crate::ty::UINT8),
      };
      body.pop();
      let decrement = Stmt {
        kind: StmtKind::Assign {
          target: counter_expr(counter_ty),
          value: Expr {
            kind: ExprKind::Binary {
              op: BinOp::Sub,
              lhs: Box::new(counter_expr(counter_ty)),
              rhs: Box::new(Expr::typed_int(1, pos.clone(), Some(counter_ty))),
            },
            pos: pos.clone(),
            ty: Some(counter_ty),
          },
        },
        pos: pos.clone(),
      };
      body.insert(0, decrement);
    }

    self.note("loop-reversal", &pos);
    true
  }
}

// ----- Shared expression predicates and helpers -----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropValue {
  Const(i64),
  Copy(VarId),
}

type PropEnv = HashMap<VarId, PropValue>;

fn invalidate(env: &mut PropEnv, var: VarId) {
  env.remove(&var);
  env.retain(|_, value| !matches!(value, PropValue::Copy(v) if *v == var));
}

fn intersect_envs(envs: &[PropEnv]) -> PropEnv {
  let Some((first, rest)) = envs.split_first() else {
    return HashMap::new();
  };
  first
    .iter()
    .filter(|(var, value)| rest.iter().all(|env| env.get(var) == Some(value)))
    .map(|(var, value)| (*var, *value))
    .collect()
}

/// Drop every entry a loop body might change.
fn restrict_to_loop_safe(env: &mut PropEnv, body: &[Stmt]) {
  match assigned_vars_in(body) {
    Some(assigned) => {
      for var in &assigned {
        invalidate(env, *var);
      }
    }
    None => env.clear(),
  }
}

fn substitute_inner(expr: &mut Expr, env: &PropEnv, rewrites: &mut Vec<(Position, &'static str)>) {
  if let ExprKind::Var(var) = expr.kind {
    match env.get(&var) {
      Some(PropValue::Const(value)) => {
        expr.kind = ExprKind::Int(*value);
        rewrites.push((expr.pos.clone(), "constant-propagation"));
      }
      Some(PropValue::Copy(source)) => {
        expr.kind = ExprKind::Var(*source);
        rewrites.push((expr.pos.clone(), "copy-propagation"));
      }
      None => {}
    }
    return;
  }

  match &mut expr.kind {
    ExprKind::Neg(inner)
    | ExprKind::Not(inner)
    | ExprKind::Deref(inner)
    | ExprKind::Cast { expr: inner, .. }
    | ExprKind::NextPtr(inner)
    | ExprKind::PrevPtr(inner) => substitute_inner(inner, env, rewrites),
    ExprKind::Index { base, index } => {
      substitute_inner(base, env, rewrites);
      substitute_inner(index, env, rewrites);
    }
    ExprKind::Field { base, .. } => substitute_inner(base, env, rewrites),
    ExprKind::Binary { lhs, rhs, .. }
    | ExprKind::Cmp { lhs, rhs, .. }
    | ExprKind::Logical { lhs, rhs, .. } => {
      substitute_inner(lhs, env, rewrites);
      substitute_inner(rhs, env, rewrites);
    }
    ExprKind::Call { args, .. } => {
      for arg in args.iter_mut() {
        substitute_inner(arg, env, rewrites);
      }
    }
    ExprKind::ArrayInit(elements) => {
      for element in elements.iter_mut() {
        substitute_inner(element, env, rewrites);
      }
    }
    _ => {}
  }
}

/// Pure: re-evaluating yields the same value with no side effects, and
/// no aliased memory is read. Scalar variables qualify; loads through
/// pointers, array elements and record fields do not.
fn is_pure(expr: &Expr) -> bool {
  match &expr.kind {
    ExprKind::Int(_) | ExprKind::Var(_) | ExprKind::Nil | ExprKind::Str(_) => true,
    ExprKind::Neg(inner) | ExprKind::Not(inner) | ExprKind::Cast { expr: inner, .. } => {
      is_pure(inner)
    }
    ExprKind::Binary { lhs, rhs, .. }
    | ExprKind::Cmp { lhs, rhs, .. }
    | ExprKind::Logical { lhs, rhs, .. } => is_pure(lhs) && is_pure(rhs),
    _ => false,
  }
}

/// Cheap to re-evaluate: a literal or a scalar load.
fn is_cheap(expr: &Expr) -> bool {
  matches!(expr.kind, ExprKind::Int(_) | ExprKind::Var(_))
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

fn expr_eq(a: &Expr, b: &Expr) -> bool {
  match (&a.kind, &b.kind) {
    (ExprKind::Int(x), ExprKind::Int(y)) => x == y,
    (ExprKind::Var(x), ExprKind::Var(y)) => x == y,
    (ExprKind::Neg(x), ExprKind::Neg(y)) => expr_eq(x, y),
    (
      ExprKind::Binary {
        op: op_a,
        lhs: lhs_a,
        rhs: rhs_a,
      },
      ExprKind::Binary {
        op: op_b,
        lhs: lhs_b,
        rhs: rhs_b,
      },
    ) => op_a == op_b && expr_eq(lhs_a, lhs_b) && expr_eq(rhs_a, rhs_b),
    _ => false,
  }
}

fn vars_of(expr: &Expr) -> HashSet<VarId> {
  fn walk(expr: &Expr, out: &mut HashSet<VarId>) {
    match &expr.kind {
      ExprKind::Var(var) => {
        out.insert(*var);
      }
      ExprKind::Neg(inner) | ExprKind::Cast { expr: inner, .. } => walk(inner, out),
      ExprKind::Binary { lhs, rhs, .. } => {
        walk(lhs, out);
        walk(rhs, out);
      }
      _ => {}
    }
  }
  let mut out = HashSet::new();
  walk(expr, &mut out);
  out
}

/// CSE/LICM candidates: pure arithmetic over scalars with at least one
/// operator and at least one variable.
fn collect_candidates(expr: &Expr, out: &mut Vec<Expr>) {
  if let ExprKind::Binary { lhs, rhs, .. } = &expr.kind {
    if is_pure(expr) && !vars_of(expr).is_empty() {
      out.push(expr.clone());
    }
    collect_candidates(lhs, out);
    collect_candidates(rhs, out);
  }
  match &expr.kind {
    ExprKind::Neg(inner) | ExprKind::Cast { expr: inner, .. } => {
      collect_candidates(inner, out)
    }
    ExprKind::Index { base, index } => {
      collect_candidates(base, out);
      collect_candidates(index, out);
    }
    ExprKind::Cmp { lhs, rhs, .. } => {
      collect_candidates(lhs, out);
      collect_candidates(rhs, out);
    }
    _ => {}
  }
}

fn count_subexpr(haystack: &Expr, needle: &Expr) -> usize {
  let mut count = if expr_eq(haystack, needle) { 1 } else { 0 };
  match &haystack.kind {
    ExprKind::Neg(inner) | ExprKind::Cast { expr: inner, .. } => {
      count += count_subexpr(inner, needle);
    }
    ExprKind::Binary { lhs, rhs, .. } | ExprKind::Cmp { lhs, rhs, .. } => {
      count += count_subexpr(lhs, needle);
      count += count_subexpr(rhs, needle);
    }
    ExprKind::Index { base, index } => {
      count += count_subexpr(base, needle);
      count += count_subexpr(index, needle);
    }
    _ => {}
  }
  count
}

fn replace_subexpr(haystack: &mut Expr, needle: &Expr, temp: VarId) -> usize {
  if expr_eq(haystack, needle) {
    haystack.kind = ExprKind::Var(temp);
    return 1;
  }
  let mut count = 0;
  match &mut haystack.kind {
    ExprKind::Neg(inner) | ExprKind::Cast { expr: inner, .. } => {
      count += replace_subexpr(inner, needle, temp);
    }
    ExprKind::Binary { lhs, rhs, .. } | ExprKind::Cmp { lhs, rhs, .. } => {
      count += replace_subexpr(lhs, needle, temp);
      count += replace_subexpr(rhs, needle, temp);
    }
    ExprKind::Index { base, index } => {
      count += replace_subexpr(base, needle, temp);
      count += replace_subexpr(index, needle, temp);
    }
    _ => {}
  }
  count
}

fn restore_subexpr(haystack: &mut Expr, temp: VarId, original: &Expr) {
  if matches!(haystack.kind, ExprKind::Var(v) if v == temp) {
    *haystack = Expr {
      ty: haystack.ty,
      ..original.clone()
    };
    return;
  }
  match &mut haystack.kind {
    ExprKind::Neg(inner) | ExprKind::Cast { expr: inner, .. } => {
      restore_subexpr(inner, temp, original);
    }
    ExprKind::Binary { lhs, rhs, .. } | ExprKind::Cmp { lhs, rhs, .. } => {
      restore_subexpr(lhs, temp, original);
      restore_subexpr(rhs, temp, original);
    }
    ExprKind::Index { base, index } => {
      restore_subexpr(base, temp, original);
      restore_subexpr(index, temp, original);
    }
    _ => {}
  }
}

/// Whether a statement could read a scalar variable without naming it:
/// calls may reach it through a nested subroutine, inline assembly
/// through its label.
fn stmt_hides_reader(stmt: &Stmt) -> bool {
  match &stmt.kind {
    StmtKind::Asm { .. } | StmtKind::MultiAssign { .. } => true,
    StmtKind::Expr(expr) => contains_call(expr),
    StmtKind::Assign { target, value } => contains_call(target) || contains_call(value),
    StmtKind::Var(decl) => decl.init.as_ref().map(contains_call).unwrap_or(false),
    StmtKind::If { arms, else_body } => {
      arms
        .iter()
        .any(|arm| contains_call(&arm.cond) || arm.body.iter().any(stmt_hides_reader))
        || else_body.iter().any(stmt_hides_reader)
    }
    StmtKind::While { cond, body } => {
      contains_call(cond) || body.iter().any(stmt_hides_reader)
    }
    StmtKind::Loop { body } => body.iter().any(stmt_hides_reader),
    StmtKind::Case {
      scrutinee,
      arms,
      else_body,
    } => {
      contains_call(scrutinee)
        || arms.iter().any(|arm| arm.body.iter().any(stmt_hides_reader))
        || else_body.iter().any(stmt_hides_reader)
    }
    StmtKind::Sub(_) => true,
    _ => false,
  }
}

fn is_declaration(stmt: &Stmt) -> bool {
  matches!(
    stmt.kind,
    StmtKind::Var(_)
      | StmtKind::Const { .. }
      | StmtKind::Typedef { .. }
      | StmtKind::Record(_)
      | StmtKind::Interface(_)
      | StmtKind::Sub(_)
  )
}

fn is_straightline(stmt: &Stmt) -> bool {
  matches!(
    stmt.kind,
    StmtKind::Assign { .. } | StmtKind::Var(_) | StmtKind::Expr(_)
  )
}

fn stmt_is_barrier(stmt: &Stmt) -> bool {
  match &stmt.kind {
    StmtKind::Asm { .. } | StmtKind::MultiAssign { .. } => true,
    StmtKind::Expr(expr) => contains_call(expr),
    StmtKind::Assign { target, value } => {
      contains_call(value)
        || contains_call(target)
        // A store through a pointer may alias anything readable.
        || matches!(target.kind, ExprKind::Deref(_))
    }
    StmtKind::Var(decl) => decl
      .init
      .as_ref()
      .map(contains_call)
      .unwrap_or(false),
    _ => false,
  }
}

fn assigned_value(stmt: &Stmt) -> Option<&Expr> {
  match &stmt.kind {
    StmtKind::Assign { value, .. } => Some(value),
    StmtKind::Var(decl) => decl.init.as_ref(),
    _ => None,
  }
}

fn assigned_value_mut(stmt: &mut Stmt) -> Option<&mut Expr> {
  match &mut stmt.kind {
    StmtKind::Assign { value, .. } => Some(value),
    StmtKind::Var(decl) => decl.init.as_mut(),
    _ => None,
  }
}

fn assigned_var(stmt: &Stmt) -> Option<VarId> {
  match &stmt.kind {
    StmtKind::Assign { target, .. } => match target.kind {
      ExprKind::Var(var) => Some(var),
      _ => None,
    },
    StmtKind::Var(decl) => decl.var,
    _ => None,
  }
}

/// Every scalar assigned anywhere in the statement list. `None` means a
/// call or inline assembly makes the set unbounded.
fn assigned_vars_in(stmts: &[Stmt]) -> Option<HashSet<VarId>> {
  let mut out = HashSet::new();
  if collect_assigned(stmts, &mut out) {
    Some(out)
  } else {
    None
  }
}

fn collect_assigned(stmts: &[Stmt], out: &mut HashSet<VarId>) -> bool {
  for stmt in stmts {
    match &stmt.kind {
      StmtKind::Asm { .. } => return false,
      StmtKind::Assign { target, value } => {
        if contains_call(value) || contains_call(target) {
          return false;
        }
        if let ExprKind::Var(var) = target.kind {
          out.insert(var);
        }
      }
      StmtKind::MultiAssign { .. } => return false,
      StmtKind::Expr(expr) => {
        if contains_call(expr) {
          return false;
        }
      }
      StmtKind::Var(decl) => {
        if decl.init.as_ref().map(contains_call).unwrap_or(false) {
          return false;
        }
        if let Some(var) = decl.var {
          out.insert(var);
        }
      }
      StmtKind::If { arms, else_body } => {
        for arm in arms {
          if contains_call(&arm.cond) || !collect_assigned(&arm.body, out) {
            return false;
          }
        }
        if !collect_assigned(else_body, out) {
          return false;
        }
      }
      StmtKind::While { cond, body } => {
        if contains_call(cond) || !collect_assigned(body, out) {
          return false;
        }
      }
      StmtKind::Loop { body } => {
        if !collect_assigned(body, out) {
          return false;
        }
      }
      StmtKind::Case {
        scrutinee,
        arms,
        else_body,
      } => {
        if contains_call(scrutinee) {
          return false;
        }
        for arm in arms {
          if !collect_assigned(&arm.body, out) {
            return false;
          }
        }
        if !collect_assigned(else_body, out) {
          return false;
        }
      }
      _ => {}
    }
  }
  true
}

fn stmt_mentions_var(stmt: &Stmt, var: VarId) -> bool {
  fn expr_mentions(expr: &Expr, var: VarId) -> bool {
    match &expr.kind {
      ExprKind::Var(v) => *v == var,
      ExprKind::Neg(inner)
      | ExprKind::Not(inner)
      | ExprKind::Deref(inner)
      | ExprKind::AddrOf(inner)
      | ExprKind::Cast { expr: inner, .. }
      | ExprKind::NextPtr(inner)
      | ExprKind::PrevPtr(inner) => expr_mentions(inner, var),
      ExprKind::Field { base, .. } => expr_mentions(base, var),
      ExprKind::Index { base, index } => {
        expr_mentions(base, var) || expr_mentions(index, var)
      }
      ExprKind::Binary { lhs, rhs, .. }
      | ExprKind::Cmp { lhs, rhs, .. }
      | ExprKind::Logical { lhs, rhs, .. } => {
        expr_mentions(lhs, var) || expr_mentions(rhs, var)
      }
      ExprKind::Call { args, .. } => args.iter().any(|a| expr_mentions(a, var)),
      ExprKind::ArrayInit(elements) => elements.iter().any(|e| expr_mentions(e, var)),
      _ => false,
    }
  }

  match &stmt.kind {
    StmtKind::Assign { target, value } => {
      expr_mentions(target, var) || expr_mentions(value, var)
    }
    StmtKind::Var(decl) => decl
      .init
      .as_ref()
      .map(|init| expr_mentions(init, var))
      .unwrap_or(false),
    StmtKind::MultiAssign { targets, call } => {
      targets.iter().any(|t| expr_mentions(t, var)) || expr_mentions(call, var)
    }
    StmtKind::Expr(expr) => expr_mentions(expr, var),
    StmtKind::If { arms, else_body } => {
      arms.iter().any(|arm| {
        expr_mentions(&arm.cond, var) || arm.body.iter().any(|s| stmt_mentions_var(s, var))
      }) || else_body.iter().any(|s| stmt_mentions_var(s, var))
    }
    StmtKind::While { cond, body } => {
      expr_mentions(cond, var) || body.iter().any(|s| stmt_mentions_var(s, var))
    }
    StmtKind::Loop { body } => body.iter().any(|s| stmt_mentions_var(s, var)),
    StmtKind::Case {
      scrutinee,
      arms,
      else_body,
    } => {
      expr_mentions(scrutinee, var)
        || arms.iter().any(|arm| {
          arm.values.iter().any(|v| expr_mentions(v, var))
            || arm.body.iter().any(|s| stmt_mentions_var(s, var))
        })
        || else_body.iter().any(|s| stmt_mentions_var(s, var))
    }
    StmtKind::Asm { parts } => parts
      .iter()
      .any(|p| matches!(p, AsmPart::Var(v) if *v == var)),
    StmtKind::Sub(decl) => decl
      .body
      .as_ref()
      .map(|body| body.iter().any(|s| stmt_mentions_var(s, var)))
      .unwrap_or(false),
    _ => false,
  }
}

fn power_of_two(value: i64) -> Option<u32> {
  if value > 0 && (value & (value - 1)) == 0 {
    Some(value.trailing_zeros())
  } else {
    None
  }
}

fn cmp_holds(op: CmpOp, a: i64, b: i64, signed: bool) -> bool {
  if signed {
    match op {
      CmpOp::Eq => a == b,
      CmpOp::Ne => a != b,
      CmpOp::Lt => a < b,
      CmpOp::Le => a <= b,
      CmpOp::Gt => a > b,
      CmpOp::Ge => a >= b,
    }
  } else {
    let (a, b) = (a as u64, b as u64);
    match op {
      CmpOp::Eq => a == b,
      CmpOp::Ne => a != b,
      CmpOp::Lt => a < b,
      CmpOp::Le => a <= b,
      CmpOp::Gt => a > b,
      CmpOp::Ge => a >= b,
    }
  }
}

fn collect_reads(stmts: &[Stmt], reads: &mut HashSet<VarId>) {
  fn expr_reads(expr: &Expr, reads: &mut HashSet<VarId>) {
    match &expr.kind {
      ExprKind::Var(var) => {
        reads.insert(*var);
      }
      ExprKind::Neg(inner)
      | ExprKind::Not(inner)
      | ExprKind::Deref(inner)
      | ExprKind::AddrOf(inner)
      | ExprKind::Cast { expr: inner, .. }
      | ExprKind::NextPtr(inner)
      | ExprKind::PrevPtr(inner) => expr_reads(inner, reads),
      ExprKind::Field { base, .. } => expr_reads(base, reads),
      ExprKind::Index { base, index } => {
        expr_reads(base, reads);
        expr_reads(index, reads);
      }
      ExprKind::Binary { lhs, rhs, .. }
      | ExprKind::Cmp { lhs, rhs, .. }
      | ExprKind::Logical { lhs, rhs, .. } => {
        expr_reads(lhs, reads);
        expr_reads(rhs, reads);
      }
      ExprKind::Call { args, .. } => {
        for arg in args {
          expr_reads(arg, reads);
        }
      }
      ExprKind::ArrayInit(elements) => {
        for element in elements {
          expr_reads(element, reads);
        }
      }
      _ => {}
    }
  }

  for stmt in stmts {
    match &stmt.kind {
      StmtKind::Var(decl) => {
        if let Some(init) = &decl.init {
          expr_reads(init, reads);
        }
      }
      StmtKind::Assign { target, value } => {
        // The target itself is a write, but array indices, field bases
        // and dereferenced pointers inside it are reads.
        match &target.kind {
          ExprKind::Index { base, index } => {
            expr_reads(base, reads);
            expr_reads(index, reads);
          }
          ExprKind::Field { base, .. } => expr_reads(base, reads),
          ExprKind::Deref(inner) => expr_reads(inner, reads),
          _ => {}
        }
        expr_reads(value, reads);
      }
      StmtKind::MultiAssign { targets, call } => {
        for target in targets {
          match &target.kind {
            ExprKind::Index { base, index } => {
              expr_reads(base, reads);
              expr_reads(index, reads);
            }
            ExprKind::Field { base, .. } => expr_reads(base, reads),
            ExprKind::Deref(inner) => expr_reads(inner, reads),
            _ => {}
          }
        }
        expr_reads(call, reads);
      }
      StmtKind::If { arms, else_body } => {
        for arm in arms {
          expr_reads(&arm.cond, reads);
          collect_reads(&arm.body, reads);
        }
        collect_reads(else_body, reads);
      }
      StmtKind::While { cond, body } => {
        expr_reads(cond, reads);
        collect_reads(body, reads);
      }
      StmtKind::Loop { body } => collect_reads(body, reads),
      StmtKind::Case {
        scrutinee,
        arms,
        else_body,
      } => {
        expr_reads(scrutinee, reads);
        for arm in arms {
          collect_reads(&arm.body, reads);
        }
        collect_reads(else_body, reads);
      }
      StmtKind::Expr(expr) => expr_reads(expr, reads),
      // Inline assembly reads and writes whatever it names.
      StmtKind::Asm { parts } => {
        for part in parts {
          if let AsmPart::Var(var) = part {
            reads.insert(*var);
          }
        }
      }
      StmtKind::Sub(decl) => {
        if let Some(body) = &decl.body {
          collect_reads(body, reads);
        }
      }
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::parser;
  use crate::preprocessor::preprocess_source;
  use crate::sema;

  fn optimized(source: &str) -> (Program, Analysis) {
    let tokens = preprocess_source(source, "test.cow", &[]).expect("preprocess");
    let mut program = parser::parse(tokens).expect("parse");
    let mut analysis = sema::analyze(&mut program).expect("analyze");
    optimize(&mut program, &mut analysis);
    (program, analysis)
  }

  fn assign_value(program: &Program, index: usize) -> &Expr {
    match &program.body[index].kind {
      StmtKind::Assign { value, .. } => value,
      StmtKind::Var(decl) => decl.init.as_ref().expect("initializer"),
      other => panic!("expected assignment, found {other:?}"),
    }
  }

  #[test]
  fn constants_fold_at_width() {
    let (program, _) = optimized("var x: uint8; x := (250 + 10) as uint8;");
    // 260 wraps to 4 at uint8.
    assert_eq!(assign_value(&program, 1).as_int(), Some(4));
  }

  #[test]
  fn reassociation_combines_constants() {
    let (program, _) = optimized("var a: uint16; var x: uint16; x := (a + 1) + 2;");
    let ExprKind::Binary { op: BinOp::Add, rhs, .. } = &assign_value(&program, 2).kind
    else {
      panic!("expected addition");
    };
    assert_eq!(rhs.as_int(), Some(3));
  }

  #[test]
  fn strength_reduction_shifts_and_masks() {
    let (program, _) = optimized(
      "var x: uint16; var y: uint16;\
       y := x * 8; y := x / 4; y := x % 8; y := x * 2;",
    );
    assert!(matches!(
      assign_value(&program, 2).kind,
      ExprKind::Binary { op: BinOp::Shl, .. }
    ));
    assert!(matches!(
      assign_value(&program, 3).kind,
      ExprKind::Binary { op: BinOp::Shr, .. }
    ));
    assert!(matches!(
      assign_value(&program, 4).kind,
      ExprKind::Binary { op: BinOp::BitAnd, .. }
    ));
    assert!(matches!(
      assign_value(&program, 5).kind,
      ExprKind::Binary { op: BinOp::Add, .. }
    ));
  }

  #[test]
  fn algebraic_identities_collapse() {
    let (program, _) = optimized(
      "var x: uint16; var y: uint16;\
       y := x + 0; y := x ^ x; y := x * 1;",
    );
    assert!(matches!(assign_value(&program, 2).kind, ExprKind::Var(_)));
    assert_eq!(assign_value(&program, 3).as_int(), Some(0));
    assert!(matches!(assign_value(&program, 4).kind, ExprKind::Var(_)));
  }

  #[test]
  fn constant_propagation_reaches_uses() {
    let (program, _) = optimized(
      "var x: uint16; var y: uint16; x := 7; y := x + 1;",
    );
    assert_eq!(assign_value(&program, 3).as_int(), Some(8));
  }

  #[test]
  fn propagation_stops_at_calls() {
    let (program, _) = optimized(
      "sub Touch is end sub;\
       var x: uint16; var y: uint16;\
       x := 7; Touch(); y := x + 1;",
    );
    // After the call the value of x is unknown again.
    assert!(matches!(
      assign_value(&program, 5).kind,
      ExprKind::Binary { .. }
    ));
  }

  #[test]
  fn dead_branches_disappear() {
    let (program, _) = optimized(
      "var x: uint8;\
       if 0 then x := 1; else x := 2; end if;\
       while 0 loop x := 3; end loop;",
    );
    // Only the var decl and `x := 2` survive.
    assert_eq!(program.body.len(), 2);
    assert_eq!(assign_value(&program, 1).as_int(), Some(2));
  }

  #[test]
  fn unreachable_statements_after_break_are_removed() {
    let (program, _) = optimized(
      "var x: uint8; loop break; x := 1; end loop;",
    );
    let StmtKind::Loop { body } = &program.body[1].kind else {
      panic!("expected loop");
    };
    assert_eq!(body.len(), 1);
  }

  #[test]
  fn dead_local_assignments_are_removed() {
    let (program, _) = optimized(
      "sub Waste is var x: uint16; x := 4; x := 5; end sub; Waste();",
    );
    let StmtKind::Sub(sub) = &program.body[0].kind else {
      panic!("expected sub");
    };
    let body = sub.body.as_ref().expect("body");
    // x is never read: both stores go.
    assert!(body.iter().all(|s| !matches!(s.kind, StmtKind::Assign { .. })));
  }

  #[test]
  fn globals_are_never_eliminated() {
    let (program, _) = optimized("var g: uint16; g := 4;");
    assert!(matches!(program.body[1].kind, StmtKind::Assign { .. }));
  }

  #[test]
  fn cse_introduces_a_temporary() {
    let (program, analysis) = optimized(
      "var a: uint16; var b: uint16; var c: uint16; var d: uint16;\
       c := a + b; d := a + b;",
    );
    // The shared `a + b` computes once into a temp.
    let temp_assign = assign_value(&program, 4);
    assert!(matches!(
      temp_assign.kind,
      ExprKind::Binary { op: BinOp::Add, .. }
    ));
    let c_value = assign_value(&program, 5);
    let d_value = assign_value(&program, 6);
    assert!(matches!(c_value.kind, ExprKind::Var(_)));
    assert!(matches!(d_value.kind, ExprKind::Var(_)));
    assert!(analysis.vars.iter().any(|v| v.name.starts_with("$t")));
  }

  #[test]
  fn licm_hoists_invariant_arithmetic() {
    let (program, _) = optimized(
      "var a: uint16; var b: uint16; var i: uint16; var s: uint16;\
       while i != 0 loop s := a * b; i := i - 1; end loop;",
    );
    // `a * b` moved to a pre-header assignment before the while.
    let StmtKind::Assign { value, .. } = &program.body[4].kind else {
      panic!("expected hoisted assignment");
    };
    assert!(matches!(value.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    assert!(matches!(program.body[5].kind, StmtKind::While { .. }));
  }

  #[test]
  fn count_up_loop_reverses_when_body_ignores_counter() {
    let (program, _) = optimized(
      "var a: uint8[10]; var i: uint8;\
       i := 0;\
       while i < 10 loop a[0] := 0; i := i + 1; end loop;",
    );
    // `i := 10` then countdown to zero.
    assert_eq!(assign_value(&program, 2).as_int(), Some(10));
    let StmtKind::While { cond, body } = &program.body[3].kind else {
      panic!("expected while");
    };
    assert!(matches!(
      cond.kind,
      ExprKind::Cmp { op: CmpOp::Ne, .. }
    ));
    // First body statement decrements the counter.
    let StmtKind::Assign { value, .. } = &body[0].kind else {
      panic!("expected decrement");
    };
    assert!(matches!(
      value.kind,
      ExprKind::Binary { op: BinOp::Sub, .. }
    ));
  }

  #[test]
  fn loop_reading_its_counter_is_not_reversed() {
    let (program, _) = optimized(
      "var s: uint8; var i: uint8;\
       i := 0;\
       while i < 10 loop s := s + i; i := i + 1; end loop;",
    );
    let StmtKind::While { cond, .. } = &program.body[3].kind else {
      panic!("expected while");
    };
    assert!(matches!(cond.kind, ExprKind::Cmp { op: CmpOp::Lt, .. }));
  }

  #[test]
  fn optimizer_is_idempotent() {
    let source = "var a: uint16; var b: uint16; var i: uint8; var s: uint16;\
       i := 0;\
       while i < 10 loop b := a * 4; a := a + 1; i := i + 1; end loop;\
       if a != 0 then s := a + b; else s := a + b; end if;";
    let tokens = preprocess_source(source, "test.cow", &[]).expect("preprocess");
    let mut program = parser::parse(tokens).expect("parse");
    let mut analysis = sema::analyze(&mut program).expect("analyze");
    optimize(&mut program, &mut analysis);

    let snapshot = format!("{program:?}");
    optimize(&mut program, &mut analysis);
    assert_eq!(snapshot, format!("{program:?}"));
  }
}
