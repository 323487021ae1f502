//! Peephole optimization and register tracking over the emitted stream.
//!
//! The pass slides a window over adjacent instructions and rewrites
//! until no rule fires. Rules that change which flags an instruction
//! produces consult flag liveness first: a rewrite is allowed only when
//! the next flag-dependent instruction cannot observe the difference.
//! The generated code re-establishes flags immediately before every
//! conditional jump, so control transfers and labels end flag liveness.
//!
//! A second scan tracks which variable each of A and HL most recently
//! loaded and drops reloads that cannot have gone stale.

use crate::codegen::Line;

pub fn optimize(mut lines: Vec<Line>) -> Vec<Line> {
  loop {
    let mut changed = apply_window_rules(&mut lines);
    changed |= eliminate_redundant_loads(&mut lines);
    if !changed {
      break;
    }
  }
  lines
}

// ----- Window rules -----

fn apply_window_rules(lines: &mut Vec<Line>) -> bool {
  let mut changed = false;
  let mut index = 0;

  while index < lines.len() {
    if let Some(rewrite) = match_rule(lines, index) {
      let Rewrite { consumed, replacement } = rewrite;
      lines.splice(index..index + consumed, replacement);
      changed = true;
      // A rewrite can enable another one just before it.
      index = index.saturating_sub(3);
      continue;
    }
    index += 1;
  }
  changed
}

struct Rewrite {
  consumed: usize,
  replacement: Vec<Line>,
}

/// Instruction at `index`, if the line is an instruction.
fn inst(lines: &[Line], index: usize) -> Option<(&str, &str)> {
  match lines.get(index) {
    Some(Line::Inst { op, args }) => Some((op.as_str(), args.as_str())),
    _ => None,
  }
}

fn match_rule(lines: &[Line], index: usize) -> Option<Rewrite> {
  let (op0, args0) = inst(lines, index)?;

  // PUSH rp / POP rp of the same pair cancels.
  if op0 == "PUSH"
    && let Some(("POP", args1)) = inst(lines, index + 1)
    && args0 == args1
  {
    return Some(Rewrite {
      consumed: 2,
      replacement: vec![],
    });
  }

  // MOV r,r moves nothing.
  if op0 == "MOV"
    && let Some((dst, src)) = args0.split_once(',')
    && dst == src
  {
    return Some(Rewrite {
      consumed: 1,
      replacement: vec![],
    });
  }

  // XCHG / XCHG restores both pairs.
  if op0 == "XCHG" && inst(lines, index + 1) == Some(("XCHG", "")) {
    return Some(Rewrite {
      consumed: 2,
      replacement: vec![],
    });
  }

  // INX H / DCX H (either order) cancels.
  if (op0 == "INX" && args0 == "H" && inst(lines, index + 1) == Some(("DCX", "H")))
    || (op0 == "DCX" && args0 == "H" && inst(lines, index + 1) == Some(("INX", "H")))
  {
    return Some(Rewrite {
      consumed: 2,
      replacement: vec![],
    });
  }

  // MVI A,0 becomes the shorter XRA A where the flags it sets are dead.
  if op0 == "MVI" && args0 == "A,0" && flags_dead_after(lines, index + 1) {
    return Some(Rewrite {
      consumed: 1,
      replacement: vec![Line::inst("XRA", "A")],
    });
  }

  // The zero-test idiom collapses: XRA A leaves the same flags.
  if op0 == "LXI"
    && args0 == "H,0"
    && inst(lines, index + 1) == Some(("MOV", "A,L"))
    && inst(lines, index + 2) == Some(("ORA", "H"))
  {
    return Some(Rewrite {
      consumed: 3,
      replacement: vec![Line::inst("XRA", "A")],
    });
  }

  // A tail call: CALL x / RET is JMP x.
  if op0 == "CALL" && matches!(inst(lines, index + 1), Some(("RET", ""))) {
    return Some(Rewrite {
      consumed: 2,
      replacement: vec![Line::inst("JMP", args0.to_string())],
    });
  }

  // Small constant pointer bumps become increments. DAD sets carry and
  // INX does not, so the flags must be dead.
  if op0 == "LXI"
    && let Some(n) = args0
      .strip_prefix("D,")
      .and_then(|v| v.parse::<u32>().ok())
    && (1..=3).contains(&n)
    && inst(lines, index + 1) == Some(("DAD", "D"))
    && flags_dead_after(lines, index + 2)
  {
    return Some(Rewrite {
      consumed: 2,
      replacement: (0..n).map(|_| Line::inst("INX", "H")).collect(),
    });
  }

  // The array-index idiom: the pushed offset can ride in DE directly.
  if op0 == "PUSH"
    && args0 == "H"
    && let Some(("LXI", lxi_args)) = inst(lines, index + 1)
    && let Some(address) = lxi_args.strip_prefix("H,")
    && inst(lines, index + 2) == Some(("POP", "D"))
    && inst(lines, index + 3) == Some(("DAD", "D"))
  {
    return Some(Rewrite {
      consumed: 4,
      replacement: vec![
        Line::inst("LXI", format!("D,{address}")),
        Line::inst("DAD", "D"),
      ],
    });
  }

  // Byte increment/decrement of a variable in memory. ADI/SUI set the
  // carry and INR/DCR do not, so the flags must be dead.
  if op0 == "LDA"
    && let Some((op1, args1)) = inst(lines, index + 1)
    && ((op1 == "ADI" && args1 == "1") || (op1 == "SUI" && args1 == "1"))
    && let Some(("STA", store)) = inst(lines, index + 2)
    && store == args0
    && flags_dead_after(lines, index + 3)
  {
    let memory_op = if op1 == "ADI" { "INR" } else { "DCR" };
    return Some(Rewrite {
      consumed: 3,
      replacement: vec![
        Line::inst("LXI", format!("H,{args0}")),
        Line::inst(memory_op, "M"),
      ],
    });
  }

  None
}

// ----- Flag liveness -----

fn reads_flags(op: &str) -> bool {
  matches!(
    op,
    "JZ"
      | "JNZ"
      | "JC"
      | "JNC"
      | "JM"
      | "JP"
      | "JPE"
      | "JPO"
      | "RZ"
      | "RNZ"
      | "RC"
      | "RNC"
      | "RM"
      | "RP"
      | "RPE"
      | "RPO"
      | "CZ"
      | "CNZ"
      | "CC"
      | "CNC"
      | "CM"
      | "CP"
      | "CPE"
      | "CPO"
      | "RAR"
      | "RAL"
      | "ADC"
      | "ACI"
      | "SBB"
      | "SBI"
      | "DAA"
  )
}

fn writes_flags(op: &str) -> bool {
  matches!(
    op,
    "ADD"
      | "ADI"
      | "ADC"
      | "ACI"
      | "SUB"
      | "SUI"
      | "SBB"
      | "SBI"
      | "ANA"
      | "ANI"
      | "ORA"
      | "ORI"
      | "XRA"
      | "XRI"
      | "CMP"
      | "CPI"
      | "INR"
      | "DCR"
      | "DAD"
      | "DAA"
      | "RLC"
      | "RRC"
      | "RAL"
      | "RAR"
  )
}

/// Whether the flags produced before `index` can still be observed.
/// Labels and unconditional transfers end liveness: generated code sets
/// its flags directly before every reader.
fn flags_dead_after(lines: &[Line], index: usize) -> bool {
  for line in &lines[index.min(lines.len())..] {
    match line {
      Line::Inst { op, .. } => {
        if reads_flags(op) {
          return false;
        }
        if writes_flags(op) || matches!(op.as_str(), "JMP" | "RET" | "CALL") {
          return true;
        }
        if op == "POP" {
          // POP PSW restores flags from the stack.
          return true;
        }
      }
      Line::Label(_) | Line::Raw(_) => return true,
      Line::Comment(_) | Line::Blank => {}
    }
  }
  true
}

// ----- Register tracking -----

/// The memory symbol an operand names, without any `+offset` suffix.
fn base_symbol(operand: &str) -> &str {
  operand.split('+').next().unwrap_or(operand)
}

fn eliminate_redundant_loads(lines: &mut Vec<Line>) -> bool {
  let mut changed = false;
  let mut a_holds: Option<String> = None;
  let mut hl_holds: Option<String> = None;
  let mut index = 0;

  while index < lines.len() {
    let action = match &lines[index] {
      Line::Label(_) | Line::Raw(_) => {
        a_holds = None;
        hl_holds = None;
        Action::Keep
      }
      Line::Comment(_) | Line::Blank => Action::Keep,
      Line::Inst { op, args } => track(op, args, &mut a_holds, &mut hl_holds),
    };

    match action {
      Action::Keep => index += 1,
      Action::Remove => {
        lines.remove(index);
        changed = true;
      }
    }
  }
  changed
}

enum Action {
  Keep,
  Remove,
}

/// Update the tracker for one instruction; `Remove` means the load is
/// redundant because the register already holds that variable.
fn track(
  op: &str,
  args: &str,
  a_holds: &mut Option<String>,
  hl_holds: &mut Option<String>,
) -> Action {
  match op {
    "LDA" => {
      if a_holds.as_deref() == Some(args) {
        return Action::Remove;
      }
      *a_holds = Some(args.to_string());
    }
    "STA" => {
      // A store to the tracked variable invalidates it, in either
      // register.
      if let Some(held) = a_holds.as_deref()
        && base_symbol(held) == base_symbol(args)
      {
        *a_holds = None;
      }
      if let Some(held) = hl_holds.as_deref()
        && base_symbol(held) == base_symbol(args)
      {
        *hl_holds = None;
      }
    }
    "LHLD" => {
      if hl_holds.as_deref() == Some(args) {
        return Action::Remove;
      }
      *hl_holds = Some(args.to_string());
    }
    "SHLD" => {
      if let Some(held) = a_holds.as_deref()
        && base_symbol(held) == base_symbol(args)
      {
        *a_holds = None;
      }
      if let Some(held) = hl_holds.as_deref()
        && base_symbol(held) == base_symbol(args)
      {
        *hl_holds = None;
      }
    }
    // Calls clobber everything; unconditional transfers only fall
    // through to labels, which reset the tracker anyway.
    "CALL" | "CZ" | "CNZ" | "CC" | "CNC" | "CM" | "CP" | "CPE" | "CPO" => {
      *a_holds = None;
      *hl_holds = None;
    }
    // Stores through a pointer may write any tracked memory.
    "STAX" => {
      *a_holds = None;
      *hl_holds = None;
    }
    "MOV" => {
      if let Some((dst, _)) = args.split_once(',') {
        match dst {
          "A" => *a_holds = None,
          "H" | "L" => *hl_holds = None,
          "M" => {
            // Store through HL; anything may have changed.
            *a_holds = None;
          }
          _ => {}
        }
      }
    }
    "MVI" => {
      if let Some((dst, _)) = args.split_once(',') {
        match dst {
          "A" => *a_holds = None,
          "H" | "L" => *hl_holds = None,
          "M" => *a_holds = None,
          _ => {}
        }
      }
    }
    "LXI" | "POP" => {
      if args.starts_with('H') {
        *hl_holds = None;
      }
      if op == "POP" && args == "PSW" {
        *a_holds = None;
      }
    }
    "XCHG" | "DAD" | "INX" | "DCX" | "PCHL" | "SPHL" => {
      if op == "XCHG" || args.starts_with('H') || op == "DAD" {
        *hl_holds = None;
      }
    }
    // A-modifying arithmetic.
    "ADD" | "ADI" | "ADC" | "ACI" | "SUB" | "SUI" | "SBB" | "SBI" | "ANA" | "ANI"
    | "ORA" | "ORI" | "XRA" | "XRI" | "CMA" | "RLC" | "RRC" | "RAL" | "RAR" | "DAA" => {
      *a_holds = None;
    }
    "INR" | "DCR" => {
      // `M` rewrites memory through HL, which may be tracked in A.
      if args == "A" || args == "M" {
        *a_holds = None;
      }
    }
    // CPI, CMP, PUSH, conditional jumps, JMP, RET, NOP: registers keep
    // their contents.
    "CPI" | "CMP" | "PUSH" | "JMP" | "RET" | "NOP" | "JZ" | "JNZ" | "JC" | "JNC" | "JM"
    | "JP" | "JPE" | "JPO" | "RZ" | "RNZ" | "RC" | "RNC" | "RM" | "RP" | "RPE" | "RPO" => {}
    _ => {
      // Unknown instruction: assume the worst.
      *a_holds = None;
      *hl_holds = None;
    }
  }
  Action::Keep
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codegen::render;

  fn run(lines: Vec<Line>) -> Vec<Line> {
    optimize(lines)
  }

  #[test]
  fn push_pop_pair_cancels() {
    let lines = run(vec![
      Line::inst("PUSH", "H"),
      Line::inst("POP", "H"),
      Line::inst("RET", ""),
    ]);
    assert_eq!(lines, vec![Line::inst("RET", "")]);
  }

  #[test]
  fn mov_to_self_disappears() {
    let lines = run(vec![Line::inst("MOV", "A,A"), Line::inst("RET", "")]);
    assert_eq!(lines, vec![Line::inst("RET", "")]);
  }

  #[test]
  fn mvi_zero_becomes_xra_when_flags_dead() {
    let lines = run(vec![
      Line::inst("MVI", "A,0"),
      Line::inst("STA", "v_x"),
      Line::inst("RET", ""),
    ]);
    assert_eq!(lines[0], Line::inst("XRA", "A"));
  }

  #[test]
  fn mvi_zero_survives_when_flags_are_read() {
    // The conditional jump depends on earlier flags; rewriting MVI into
    // XRA would clobber them.
    let lines = run(vec![
      Line::inst("CPI", "5"),
      Line::inst("MVI", "A,0"),
      Line::inst("JZ", "L1"),
      Line::inst("RET", ""),
    ]);
    assert_eq!(lines[1], Line::inst("MVI", "A,0"));
  }

  #[test]
  fn call_ret_becomes_jmp() {
    let lines = run(vec![Line::inst("CALL", "helper"), Line::inst("RET", "")]);
    assert_eq!(lines, vec![Line::inst("JMP", "helper")]);
  }

  #[test]
  fn small_dad_becomes_inx() {
    let lines = run(vec![
      Line::inst("LXI", "D,2"),
      Line::inst("DAD", "D"),
      Line::inst("MOV", "A,M"),
      Line::inst("RET", ""),
    ]);
    assert_eq!(
      lines,
      vec![
        Line::inst("INX", "H"),
        Line::inst("INX", "H"),
        Line::inst("MOV", "A,M"),
        Line::inst("RET", ""),
      ]
    );
  }

  #[test]
  fn array_index_idiom_tightens() {
    let lines = run(vec![
      Line::inst("PUSH", "H"),
      Line::inst("LXI", "H,v_arr"),
      Line::inst("POP", "D"),
      Line::inst("DAD", "D"),
      Line::inst("RET", ""),
    ]);
    assert_eq!(
      lines,
      vec![
        Line::inst("LXI", "D,v_arr"),
        Line::inst("DAD", "D"),
        Line::inst("RET", ""),
      ]
    );
  }

  #[test]
  fn byte_increment_uses_inr_m() {
    let lines = run(vec![
      Line::inst("LDA", "v_x"),
      Line::inst("ADI", "1"),
      Line::inst("STA", "v_x"),
      Line::inst("RET", ""),
    ]);
    assert_eq!(
      lines,
      vec![
        Line::inst("LXI", "H,v_x"),
        Line::inst("INR", "M"),
        Line::inst("RET", ""),
      ]
    );
  }

  #[test]
  fn byte_decrement_uses_dcr_m() {
    let lines = run(vec![
      Line::inst("LDA", "v_i"),
      Line::inst("SUI", "1"),
      Line::inst("STA", "v_i"),
      Line::inst("RET", ""),
    ]);
    assert!(lines.contains(&Line::inst("DCR", "M")));
  }

  #[test]
  fn redundant_reload_is_removed() {
    let lines = run(vec![
      Line::inst("LDA", "v_x"),
      Line::inst("STA", "v_y"),
      Line::inst("LDA", "v_x"),
      Line::inst("RET", ""),
    ]);
    assert_eq!(
      lines,
      vec![
        Line::inst("LDA", "v_x"),
        Line::inst("STA", "v_y"),
        Line::inst("RET", ""),
      ]
    );
  }

  #[test]
  fn reload_after_call_is_kept() {
    let lines = run(vec![
      Line::inst("LDA", "v_x"),
      Line::inst("CALL", "helper"),
      Line::inst("LDA", "v_x"),
      Line::inst("RET", ""),
    ]);
    assert_eq!(lines.len(), 4);
  }

  #[test]
  fn reload_after_label_is_kept() {
    let lines = run(vec![
      Line::inst("LHLD", "v_p"),
      Line::Label("L1".to_string()),
      Line::inst("LHLD", "v_p"),
      Line::inst("RET", ""),
    ]);
    assert_eq!(lines.len(), 4);
  }

  #[test]
  fn pass_is_a_fixpoint() {
    let lines = vec![
      Line::inst("PUSH", "H"),
      Line::inst("LXI", "H,v_arr"),
      Line::inst("POP", "D"),
      Line::inst("DAD", "D"),
      Line::inst("LDA", "v_x"),
      Line::inst("LDA", "v_x"),
      Line::inst("MVI", "A,0"),
      Line::inst("STA", "v_x"),
      Line::inst("RET", ""),
    ];
    let once = optimize(lines);
    let twice = optimize(once.clone());
    assert_eq!(render(&once), render(&twice));
  }
}
