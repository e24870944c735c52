//! Jump optimization
//!
//! Three rewrites, all local to terminators:
//!
//! - a branch on a constant condition becomes a jump to the taken side;
//! - a branch whose arms agree becomes a jump;
//! - a jump to an empty block that only jumps onward is threaded through,
//!   unless the final target has phis (those edge blocks carry phi moves
//!   and must survive).
//!
//! Unreachable blocks produced here are left for DCE's sweep.

use crate::ir::{BlockId, Function, Terminator};
use std::collections::BTreeMap;

/// Returns true when anything changed.
pub fn optimize_jumps(function: &mut Function) -> bool {
    let mut changed = false;

    // Branch folding first: constant conditions and equal arms. Dropped
    // edges are remembered so the abandoned target's phis lose their
    // source for this predecessor.
    let mut dropped_edges: Vec<(BlockId, BlockId)> = Vec::new();
    for block in function.blocks.values_mut() {
        let Some(term) = &block.terminator else {
            continue;
        };
        if let Terminator::Branch {
            condition,
            true_target,
            false_target,
        } = term
        {
            if let Some(word) = condition.as_const_word() {
                let (target, dropped) = if word.is_zero() {
                    (*false_target, *true_target)
                } else {
                    (*true_target, *false_target)
                };
                if dropped != target {
                    dropped_edges.push((block.id, dropped));
                }
                block.terminator = Some(Terminator::Jump { target });
                changed = true;
            } else if true_target == false_target {
                let target = *true_target;
                block.terminator = Some(Terminator::Jump { target });
                changed = true;
            }
        }
    }
    for (pred, target) in dropped_edges {
        if let Some(block) = function.blocks.get_mut(&target) {
            for phi in &mut block.phis {
                phi.sources.remove(&pred);
            }
        }
    }

    // Thread jumps through empty forwarding blocks.
    let forward: BTreeMap<BlockId, BlockId> = function
        .blocks
        .iter()
        .filter_map(|(&id, block)| match &block.terminator {
            Some(Terminator::Jump { target })
                if block.instructions.is_empty()
                    && block.phis.is_empty()
                    && *target != id
                    // Threading into a phi-carrying block would change
                    // which predecessor the phi sees.
                    && function
                        .block(*target)
                        .is_some_and(|t| t.phis.is_empty()) =>
            {
                Some((id, *target))
            }
            _ => None,
        })
        .collect();

    if !forward.is_empty() {
        let resolve = |mut target: BlockId| {
            // Follow the forwarding chain with a hop bound to stay safe on
            // degenerate jump cycles.
            for _ in 0..forward.len() {
                match forward.get(&target) {
                    Some(&next) if next != target => target = next,
                    _ => break,
                }
            }
            target
        };
        for block in function.blocks.values_mut() {
            if let Some(term) = &mut block.terminator {
                for target in term.targets_mut() {
                    let resolved = resolve(*target);
                    if resolved != *target {
                        *target = resolved;
                        changed = true;
                    }
                }
            }
        }
    }

    if changed {
        function.recompute_predecessors();
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Terminator, Value};
    use crate::types::Type;
    use alloy_primitives::U256;

    #[test]
    fn constant_branch_becomes_jump() {
        let mut f = Function::new("main");
        let a = f.fresh_block();
        let b = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Branch {
            condition: Value::word(U256::from(1), Type::Bool),
            true_target: a,
            false_target: b,
        });
        f.block_mut(a).unwrap().terminator = Some(Terminator::Return { value: None });
        f.block_mut(b).unwrap().terminator = Some(Terminator::Return { value: None });
        assert!(optimize_jumps(&mut f));
        assert_eq!(
            f.block(entry).unwrap().terminator,
            Some(Terminator::Jump { target: a })
        );
    }

    #[test]
    fn false_constant_takes_false_arm() {
        let mut f = Function::new("main");
        let a = f.fresh_block();
        let b = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Branch {
            condition: Value::word(U256::ZERO, Type::Bool),
            true_target: a,
            false_target: b,
        });
        f.block_mut(a).unwrap().terminator = Some(Terminator::Return { value: None });
        f.block_mut(b).unwrap().terminator = Some(Terminator::Return { value: None });
        optimize_jumps(&mut f);
        assert_eq!(
            f.block(entry).unwrap().terminator,
            Some(Terminator::Jump { target: b })
        );
    }

    #[test]
    fn jump_threaded_through_empty_block() {
        let mut f = Function::new("main");
        let mid = f.fresh_block();
        let end = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Jump { target: mid });
        f.block_mut(mid).unwrap().terminator = Some(Terminator::Jump { target: end });
        f.block_mut(end).unwrap().terminator = Some(Terminator::Return { value: None });
        assert!(optimize_jumps(&mut f));
        assert_eq!(
            f.block(entry).unwrap().terminator,
            Some(Terminator::Jump { target: end })
        );
    }

    #[test]
    fn folded_branch_prunes_dropped_phi_source() {
        let mut f = Function::new("main");
        let taken = f.fresh_block();
        let dropped = f.fresh_block();
        let entry = f.entry;
        let dest = f.fresh_temp();
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Branch {
            condition: Value::word(U256::from(1), Type::Bool),
            true_target: taken,
            false_target: dropped,
        });
        f.block_mut(taken).unwrap().terminator = Some(Terminator::Jump { target: dropped });
        {
            let block = f.block_mut(dropped).unwrap();
            let mut sources = std::collections::BTreeMap::new();
            sources.insert(entry, Value::word(U256::from(1), Type::uint256()));
            sources.insert(taken, Value::word(U256::from(2), Type::uint256()));
            block.phis.push(crate::ir::Phi {
                dest,
                ty: Type::uint256(),
                sources,
            });
            block.terminator = Some(Terminator::Return {
                value: Some(Value::Temp {
                    id: dest,
                    ty: Type::uint256(),
                }),
            });
        }
        f.recompute_predecessors();
        assert!(optimize_jumps(&mut f));
        let phi = &f.block(dropped).unwrap().phis[0];
        assert!(!phi.sources.contains_key(&entry));
        assert!(phi.sources.contains_key(&taken));
    }

    #[test]
    fn threading_stops_at_phi_blocks() {
        let mut f = Function::new("main");
        let mid = f.fresh_block();
        let end = f.fresh_block();
        let entry = f.entry;
        let dest = f.fresh_temp();
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Jump { target: mid });
        f.block_mut(mid).unwrap().terminator = Some(Terminator::Jump { target: end });
        {
            let block = f.block_mut(end).unwrap();
            let mut sources = std::collections::BTreeMap::new();
            sources.insert(mid, Value::word(U256::from(1), Type::uint256()));
            block.phis.push(crate::ir::Phi {
                dest,
                ty: Type::uint256(),
                sources,
            });
            block.terminator = Some(Terminator::Return {
                value: Some(Value::Temp {
                    id: dest,
                    ty: Type::uint256(),
                }),
            });
        }
        f.recompute_predecessors();
        assert!(!optimize_jumps(&mut f));
        assert_eq!(
            f.block(entry).unwrap().terminator,
            Some(Terminator::Jump { target: mid })
        );
    }
}
