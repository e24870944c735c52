//! Dead-code elimination
//!
//! Two sweeps: instructions whose destination is never used and which can
//! be removed without changing observable behavior (pure computations and
//! loads), and blocks unreachable from the entry. Removing an unreachable
//! predecessor also drops the matching phi sources so phi completeness
//! survives the pass.

use crate::ir::{Function, TempId, ValueId};
use std::collections::BTreeSet;

/// Remove dead instructions and unreachable blocks. Returns true when
/// anything changed.
pub fn eliminate_dead_code(function: &mut Function) -> bool {
    let mut changed = false;
    // Dead values can chain (a dead add keeps its operands alive), so
    // iterate until a round removes nothing.
    loop {
        let used = used_temps(function);
        let mut removed = false;
        for block in function.blocks.values_mut() {
            let before = block.instructions.len();
            block.instructions.retain(|instr| {
                let dead = instr
                    .dest()
                    .map(|d| !used.contains(&d))
                    .unwrap_or(false);
                !(dead && instr.removable_when_dead())
            });
            removed |= block.instructions.len() != before;

            let phis_before = block.phis.len();
            block.phis.retain(|phi| used.contains(&phi.dest));
            removed |= block.phis.len() != phis_before;
        }
        changed |= removed;
        if !removed {
            break;
        }
    }

    changed |= remove_unreachable_blocks(function);

    // Locals with no remaining loads or stores are gone too.
    let live_locals: BTreeSet<String> = function
        .blocks
        .values()
        .flat_map(|b| b.instructions.iter())
        .flat_map(|i| {
            let mut names: Vec<String> = i
                .operands()
                .iter()
                .filter_map(|v| match v.id() {
                    Some(ValueId::Local(name)) => Some(name),
                    _ => None,
                })
                .collect();
            if let crate::ir::Instruction::LoadLocal { local, .. }
            | crate::ir::Instruction::StoreLocal { local, .. } = i
            {
                names.push(local.clone());
            }
            names
        })
        .collect();
    let before = function.locals.len();
    function.locals.retain(|l| live_locals.contains(&l.name));
    changed |= function.locals.len() != before;

    changed
}

/// Every temp referenced by any operand, phi source or terminator.
fn used_temps(function: &Function) -> BTreeSet<TempId> {
    let mut used = BTreeSet::new();
    let mut mark = |vid: Option<ValueId>| {
        if let Some(ValueId::Temp(id)) = vid {
            used.insert(id);
        }
    };
    for block in function.blocks.values() {
        for phi in &block.phis {
            for value in phi.sources.values() {
                mark(value.id());
            }
        }
        for instr in &block.instructions {
            for value in instr.operands() {
                mark(value.id());
            }
        }
        if let Some(term) = &block.terminator {
            for value in term.operands() {
                mark(value.id());
            }
        }
    }
    used
}

/// Drop blocks the entry cannot reach; prune phi sources from the removed
/// predecessors.
pub fn remove_unreachable_blocks(function: &mut Function) -> bool {
    let reachable: BTreeSet<_> = function.reverse_postorder().into_iter().collect();
    if reachable.len() == function.blocks.len() {
        return false;
    }
    function.blocks.retain(|id, _| reachable.contains(id));
    for block in function.blocks.values_mut() {
        for phi in &mut block.phis {
            phi.sources.retain(|pred, _| reachable.contains(pred));
        }
    }
    function.recompute_predecessors();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Instruction, IrBinOp, Literal, Terminator, Value};
    use crate::types::Type;
    use alloy_primitives::U256;

    #[test]
    fn removes_dead_chain() {
        let mut f = Function::new("main");
        let a = f.fresh_temp();
        let b = f.fresh_temp();
        let entry = f.entry;
        let block = f.block_mut(entry).unwrap();
        block.instructions.push(Instruction::Const {
            dest: a,
            value: Literal::Word(U256::from(1)),
            ty: Type::uint256(),
        });
        block.instructions.push(Instruction::Binary {
            dest: b,
            op: IrBinOp::Add,
            lhs: Value::Temp {
                id: a,
                ty: Type::uint256(),
            },
            rhs: Value::word(U256::from(2), Type::uint256()),
            ty: Type::uint256(),
        });
        block.terminator = Some(Terminator::Return { value: None });
        assert!(eliminate_dead_code(&mut f));
        assert_eq!(f.block(entry).unwrap().instructions.len(), 0);
    }

    #[test]
    fn keeps_stores() {
        let mut f = Function::new("main");
        let entry = f.entry;
        let block = f.block_mut(entry).unwrap();
        block.instructions.push(Instruction::StoreStorage {
            slot: Value::word(U256::ZERO, Type::uint256()),
            value: Value::word(U256::from(9), Type::uint256()),
        });
        block.terminator = Some(Terminator::Return { value: None });
        eliminate_dead_code(&mut f);
        assert_eq!(f.block(entry).unwrap().instructions.len(), 1);
    }

    #[test]
    fn keeps_live_values() {
        let mut f = Function::new("main");
        let a = f.fresh_temp();
        let entry = f.entry;
        let block = f.block_mut(entry).unwrap();
        block.instructions.push(Instruction::Const {
            dest: a,
            value: Literal::Word(U256::from(1)),
            ty: Type::uint256(),
        });
        block.terminator = Some(Terminator::Return {
            value: Some(Value::Temp {
                id: a,
                ty: Type::uint256(),
            }),
        });
        assert!(!eliminate_dead_code(&mut f));
        assert_eq!(f.block(entry).unwrap().instructions.len(), 1);
    }

    #[test]
    fn sweeps_unreachable_blocks_and_phi_sources() {
        let mut f = Function::new("main");
        let reach = f.fresh_block();
        let orphan = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Jump { target: reach });
        let dest = f.fresh_temp();
        let t_orphan = f.fresh_temp();
        {
            let block = f.block_mut(orphan).unwrap();
            block.instructions.push(Instruction::Const {
                dest: t_orphan,
                value: Literal::Word(U256::from(3)),
                ty: Type::uint256(),
            });
            block.terminator = Some(Terminator::Jump { target: reach });
        }
        {
            let block = f.block_mut(reach).unwrap();
            let mut sources = std::collections::BTreeMap::new();
            sources.insert(entry, Value::word(U256::from(1), Type::uint256()));
            sources.insert(
                orphan,
                Value::Temp {
                    id: t_orphan,
                    ty: Type::uint256(),
                },
            );
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
        assert!(eliminate_dead_code(&mut f));
        assert!(f.block(orphan).is_none());
        let phi = &f.block(reach).unwrap().phis[0];
        assert_eq!(phi.sources.len(), 1);
        assert!(phi.sources.contains_key(&entry));
    }
}
