//! Block layout: linearization for emission
//!
//! Depth-first from the entry so related blocks stay adjacent; branch
//! terminators visit the true target before the false target. Blocks the
//! traversal never reaches (possible on partially-broken input kept alive
//! for diagnostics) are appended at the tail in id order.

use crate::ir::{BlockId, Function, Terminator};
use std::collections::BTreeSet;

/// Produce the emission order over all blocks of `function`.
pub fn linearize(function: &Function) -> Vec<BlockId> {
    let mut order = Vec::with_capacity(function.blocks.len());
    let mut visited: BTreeSet<BlockId> = BTreeSet::new();
    let mut stack = vec![function.entry];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id);
        let Some(term) = function.block(id).and_then(|b| b.terminator.as_ref()) else {
            continue;
        };
        match term {
            Terminator::Jump { target } => stack.push(*target),
            Terminator::Branch {
                true_target,
                false_target,
                ..
            } => {
                // Pushed false-first so the true target pops first.
                stack.push(*false_target);
                stack.push(*true_target);
            }
            Terminator::Return { .. } => {}
        }
    }
    for &id in function.blocks.keys() {
        if !visited.contains(&id) {
            order.push(id);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Value;
    use crate::types::Type;
    use alloy_primitives::U256;

    #[test]
    fn entry_always_first() {
        let mut f = Function::new("main");
        let next = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Jump { target: next });
        f.block_mut(next).unwrap().terminator = Some(Terminator::Return { value: None });
        assert_eq!(linearize(&f), vec![entry, next]);
    }

    #[test]
    fn true_target_before_false_target() {
        let mut f = Function::new("main");
        let t = f.fresh_block();
        let e = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Branch {
            condition: Value::word(U256::from(1), Type::Bool),
            true_target: t,
            false_target: e,
        });
        f.block_mut(t).unwrap().terminator = Some(Terminator::Return { value: None });
        f.block_mut(e).unwrap().terminator = Some(Terminator::Return { value: None });
        assert_eq!(linearize(&f), vec![entry, t, e]);
    }

    #[test]
    fn unreachable_blocks_at_tail() {
        let mut f = Function::new("main");
        let orphan = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Return { value: None });
        f.block_mut(orphan).unwrap().terminator = Some(Terminator::Return { value: None });
        assert_eq!(linearize(&f), vec![entry, orphan]);
    }

    #[test]
    fn every_block_appears_once() {
        let mut f = Function::new("main");
        let header = f.fresh_block();
        let body = f.fresh_block();
        let exit = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Jump { target: header });
        f.block_mut(header).unwrap().terminator = Some(Terminator::Branch {
            condition: Value::word(U256::from(1), Type::Bool),
            true_target: body,
            false_target: exit,
        });
        f.block_mut(body).unwrap().terminator = Some(Terminator::Jump { target: header });
        f.block_mut(exit).unwrap().terminator = Some(Terminator::Return { value: None });
        let order = linearize(&f);
        assert_eq!(order.len(), 4);
        let unique: BTreeSet<_> = order.iter().collect();
        assert_eq!(unique.len(), 4);
        assert_eq!(order, vec![entry, header, body, exit]);
    }
}
