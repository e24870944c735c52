//! Block merging and return merging (level 3)
//!
//! Merging folds a block into its unique jump predecessor. Return merging
//! deduplicates blocks that do nothing but return the same value, then
//! redirects every jump to the surviving copy.

use crate::ir::{BlockId, Function, Terminator};
use std::collections::BTreeMap;

/// Merge single-predecessor blocks into their jump-terminated predecessor.
/// Returns true when anything changed.
pub fn merge_blocks(function: &mut Function) -> bool {
    let mut changed = false;
    loop {
        function.recompute_predecessors();
        let candidate = function.blocks.iter().find_map(|(&id, block)| {
            if id == function.entry {
                return None;
            }
            if !block.phis.is_empty() {
                return None;
            }
            if block.predecessors.len() != 1 {
                return None;
            }
            let pred = *block.predecessors.iter().next()?;
            if pred == id {
                return None;
            }
            match function.block(pred)?.terminator {
                Some(Terminator::Jump { target }) if target == id => Some((pred, id)),
                _ => None,
            }
        });
        let Some((pred, id)) = candidate else {
            break;
        };

        let merged = function.blocks.remove(&id).expect("candidate exists");
        // Successor phis keyed by the merged block now flow from pred.
        for succ in merged
            .terminator
            .as_ref()
            .map(Terminator::targets)
            .unwrap_or_default()
        {
            if let Some(sblock) = function.blocks.get_mut(&succ) {
                for phi in &mut sblock.phis {
                    if let Some(value) = phi.sources.remove(&id) {
                        phi.sources.insert(pred, value);
                    }
                }
            }
        }
        let pred_block = function.block_mut(pred).expect("predecessor exists");
        pred_block.instructions.extend(merged.instructions);
        pred_block.terminator = merged.terminator;
        changed = true;
    }
    if changed {
        function.recompute_predecessors();
    }
    changed
}

/// Deduplicate return-only blocks with identical values. Returns true when
/// anything changed.
pub fn merge_returns(function: &mut Function) -> bool {
    // Group return-only blocks by their returned value.
    let mut canonical: BTreeMap<String, BlockId> = BTreeMap::new();
    let mut redirect: BTreeMap<BlockId, BlockId> = BTreeMap::new();
    for (&id, block) in &function.blocks {
        if id == function.entry || !block.instructions.is_empty() || !block.phis.is_empty() {
            continue;
        }
        let Some(term @ Terminator::Return { .. }) = &block.terminator else {
            continue;
        };
        let key = format!("{}", term);
        match canonical.get(&key) {
            Some(&keep) => {
                redirect.insert(id, keep);
            }
            None => {
                canonical.insert(key, id);
            }
        }
    }
    if redirect.is_empty() {
        return false;
    }
    for block in function.blocks.values_mut() {
        if let Some(term) = &mut block.terminator {
            for target in term.targets_mut() {
                if let Some(&keep) = redirect.get(target) {
                    *target = keep;
                }
            }
        }
    }
    // The bypassed return blocks are now unreachable; DCE sweeps them.
    function.recompute_predecessors();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Instruction, Literal, Terminator, Value};
    use crate::opt::eliminate_dead_code;
    use crate::types::Type;
    use alloy_primitives::U256;

    #[test]
    fn straight_chain_merges_into_one_block() {
        let mut f = Function::new("main");
        let mid = f.fresh_block();
        let end = f.fresh_block();
        let t = f.fresh_temp();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Jump { target: mid });
        {
            let block = f.block_mut(mid).unwrap();
            block.instructions.push(Instruction::Const {
                dest: t,
                value: Literal::Word(U256::from(1)),
                ty: Type::uint256(),
            });
            block.terminator = Some(Terminator::Jump { target: end });
        }
        f.block_mut(end).unwrap().terminator = Some(Terminator::Return { value: None });
        assert!(merge_blocks(&mut f));
        assert_eq!(f.blocks.len(), 1);
        let entry_block = f.block(entry).unwrap();
        assert_eq!(entry_block.instructions.len(), 1);
        assert_eq!(
            entry_block.terminator,
            Some(Terminator::Return { value: None })
        );
    }

    #[test]
    fn branch_targets_not_merged() {
        let mut f = Function::new("main");
        let a = f.fresh_block();
        let b = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Branch {
            condition: Value::Temp {
                id: f.fresh_temp(),
                ty: Type::Bool,
            },
            true_target: a,
            false_target: b,
        });
        f.block_mut(a).unwrap().terminator = Some(Terminator::Return { value: None });
        f.block_mut(b).unwrap().terminator = Some(Terminator::Return { value: None });
        assert!(!merge_blocks(&mut f));
        assert_eq!(f.blocks.len(), 3);
    }

    #[test]
    fn identical_returns_merge() {
        let mut f = Function::new("main");
        let a = f.fresh_block();
        let b = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Branch {
            condition: Value::Temp {
                id: f.fresh_temp(),
                ty: Type::Bool,
            },
            true_target: a,
            false_target: b,
        });
        let ret = Some(Terminator::Return {
            value: Some(Value::word(U256::from(1), Type::uint256())),
        });
        f.block_mut(a).unwrap().terminator = ret.clone();
        f.block_mut(b).unwrap().terminator = ret;
        assert!(merge_returns(&mut f));
        let Some(Terminator::Branch {
            true_target,
            false_target,
            ..
        }) = f.block(entry).unwrap().terminator
        else {
            panic!()
        };
        assert_eq!(true_target, false_target);
        // After the sweep only two blocks remain.
        eliminate_dead_code(&mut f);
        assert_eq!(f.blocks.len(), 2);
    }

    #[test]
    fn different_returns_kept_apart() {
        let mut f = Function::new("main");
        let a = f.fresh_block();
        let b = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Branch {
            condition: Value::Temp {
                id: f.fresh_temp(),
                ty: Type::Bool,
            },
            true_target: a,
            false_target: b,
        });
        f.block_mut(a).unwrap().terminator = Some(Terminator::Return {
            value: Some(Value::word(U256::from(1), Type::uint256())),
        });
        f.block_mut(b).unwrap().terminator = Some(Terminator::Return {
            value: Some(Value::word(U256::from(2), Type::uint256())),
        });
        assert!(!merge_returns(&mut f));
    }
}
