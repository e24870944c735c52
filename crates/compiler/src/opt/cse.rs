//! Common-subexpression elimination
//!
//! Block-local: two structurally identical pure instructions in one block
//! compute the same value, so the second is deleted and its uses are
//! redirected to the first destination. Loads are not deduplicated (a
//! store may intervene) and nothing is hoisted across blocks.

use crate::ir::{Function, Instruction, TempId, Value};
use std::collections::HashMap;

/// Sentinel destination so instructions differing only in dest compare
/// equal as map keys.
const KEY_DEST: TempId = TempId(u32::MAX);

fn key_of(instr: &Instruction) -> Option<Instruction> {
    if !instr.is_pure() {
        return None;
    }
    let mut key = instr.clone();
    match &mut key {
        Instruction::Const { dest, .. }
        | Instruction::Binary { dest, .. }
        | Instruction::Unary { dest, .. }
        | Instruction::ComputeSlot { dest, .. }
        | Instruction::ComputeArraySlot { dest, .. }
        | Instruction::ComputeFieldOffset { dest, .. }
        | Instruction::Env { dest, .. }
        | Instruction::Hash { dest, .. }
        | Instruction::Cast { dest, .. }
        | Instruction::Length { dest, .. } => *dest = KEY_DEST,
        _ => return None,
    }
    Some(key)
}

/// Deduplicate pure computations inside each block. Returns true when
/// anything changed.
pub fn eliminate_common_subexpressions(function: &mut Function) -> bool {
    let mut replacements: HashMap<TempId, TempId> = HashMap::new();
    let mut changed = false;

    for block in function.blocks.values_mut() {
        let mut seen: HashMap<Instruction, TempId> = HashMap::new();
        let instructions = std::mem::take(&mut block.instructions);
        let mut kept = Vec::with_capacity(instructions.len());
        for instr in instructions {
            match key_of(&instr) {
                Some(key) => {
                    let dest = instr.dest().expect("pure keyed instructions define");
                    match seen.get(&key) {
                        Some(&first) => {
                            replacements.insert(dest, first);
                            changed = true;
                        }
                        None => {
                            seen.insert(key, dest);
                            kept.push(instr);
                        }
                    }
                }
                None => kept.push(instr),
            }
        }
        block.instructions = kept;
    }

    if replacements.is_empty() {
        return changed;
    }

    // Redirect uses. Replacements never chain within one round: the first
    // occurrence always survives, so one lookup suffices; a second
    // CSE round can still collapse further.
    let substitute = |value: &mut Value| {
        if let Value::Temp { id, ty } = value {
            if let Some(&first) = replacements.get(id) {
                *value = Value::Temp {
                    id: first,
                    ty: ty.clone(),
                };
            }
        }
    };
    for block in function.blocks.values_mut() {
        for phi in &mut block.phis {
            for value in phi.sources.values_mut() {
                substitute(value);
            }
        }
        for instr in &mut block.instructions {
            for value in instr.operands_mut() {
                substitute(value);
            }
        }
        if let Some(term) = &mut block.terminator {
            for value in term.operands_mut() {
                substitute(value);
            }
        }
    }
    true
}
