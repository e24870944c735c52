//! IR validator
//!
//! Checks the structural invariants every module must satisfy after the
//! builder and after any optimizer pass. Violations are reported as
//! internal-error diagnostics; the validator never panics, so `--validate`
//! can run on deliberately broken input.

use crate::diagnostics::{codes, Diagnostic};
use crate::ir::{Function, Module, TempId, ValueId};
use std::collections::{BTreeSet, HashMap};

/// Validate the whole module. An empty result means all invariants hold.
pub fn validate(module: &Module) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    // Storage slot indices are unique within a module.
    let mut slots = BTreeSet::new();
    for decl in &module.storage {
        if !slots.insert(decl.slot) {
            diagnostics.push(Diagnostic::error(
                codes::INVARIANT_VIOLATED,
                format!(
                    "storage slot {} assigned to more than one declaration",
                    decl.slot
                ),
            ));
        }
    }

    if module.main().is_none() {
        diagnostics.push(Diagnostic::error(
            codes::INVARIANT_VIOLATED,
            "module has no main function",
        ));
    }

    for function in module.functions.values() {
        validate_function(function, &mut diagnostics);
    }
    diagnostics
}

fn validate_function(function: &Function, diagnostics: &mut Vec<Diagnostic>) {
    let name = &function.name;

    // Every temp is assigned exactly once, by an instruction or a phi.
    let mut defs: HashMap<TempId, usize> = HashMap::new();
    for block in function.blocks.values() {
        for phi in &block.phis {
            *defs.entry(phi.dest).or_insert(0) += 1;
        }
        for instr in &block.instructions {
            if let Some(dest) = instr.dest() {
                *defs.entry(dest).or_insert(0) += 1;
            }
        }
    }
    for (temp, count) in &defs {
        if *count > 1 {
            diagnostics.push(Diagnostic::error(
                codes::INVARIANT_VIOLATED,
                format!("{}: temp {} defined {} times", name, temp, count),
            ));
        }
    }

    // Uses of undefined temps.
    for block in function.blocks.values() {
        let check_value = |value: &crate::ir::Value, diagnostics: &mut Vec<Diagnostic>| {
            if let Some(ValueId::Temp(id)) = value.id() {
                if !defs.contains_key(&id) {
                    diagnostics.push(Diagnostic::error(
                        codes::INVARIANT_VIOLATED,
                        format!("{}: use of undefined temp {} in {}", name, id, block.id),
                    ));
                }
            }
        };
        for phi in &block.phis {
            for value in phi.sources.values() {
                check_value(value, diagnostics);
            }
        }
        for instr in &block.instructions {
            for value in instr.operands() {
                check_value(value, diagnostics);
            }
        }
        if let Some(term) = &block.terminator {
            for value in term.operands() {
                check_value(value, diagnostics);
            }
        }
    }

    for (&id, block) in &function.blocks {
        // Exactly one terminator.
        let Some(term) = &block.terminator else {
            diagnostics.push(Diagnostic::error(
                codes::INVARIANT_VIOLATED,
                format!("{}: block {} has no terminator", name, id),
            ));
            continue;
        };

        // Every terminator target exists in this function.
        for target in term.targets() {
            if !function.blocks.contains_key(&target) {
                diagnostics.push(Diagnostic::error(
                    codes::INVARIANT_VIOLATED,
                    format!("{}: {} targets missing block {}", name, id, target),
                ));
            }
        }

        // Non-entry blocks have predecessors.
        if id != function.entry && block.predecessors.is_empty() {
            diagnostics.push(Diagnostic::error(
                codes::INVARIANT_VIOLATED,
                format!("{}: block {} is unreachable (no predecessors)", name, id),
            ));
        }

        // Phi completeness: source keys equal the predecessor set.
        for phi in &block.phis {
            let keys: BTreeSet<_> = phi.sources.keys().copied().collect();
            if keys != block.predecessors {
                diagnostics.push(Diagnostic::error(
                    codes::INVARIANT_VIOLATED,
                    format!(
                        "{}: phi {} in {} covers [{}], predecessors are [{}]",
                        name,
                        phi.dest,
                        id,
                        keys.iter()
                            .map(|b| b.to_string())
                            .collect::<Vec<_>>()
                            .join(", "),
                        block
                            .predecessors
                            .iter()
                            .map(|b| b.to_string())
                            .collect::<Vec<_>>()
                            .join(", "),
                    ),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockId, Instruction, Literal, Terminator, Value};
    use crate::types::Type;
    use alloy_primitives::U256;

    fn empty_module() -> Module {
        let mut module = Module::new("t");
        let mut main = Function::new("main");
        let entry = main.entry;
        main.block_mut(entry).unwrap().terminator = Some(Terminator::Return { value: None });
        module.functions.insert("main".into(), main);
        module
    }

    #[test]
    fn clean_module_validates() {
        let module = empty_module();
        assert!(validate(&module).is_empty());
    }

    #[test]
    fn duplicate_temp_detected() {
        let mut module = empty_module();
        let main = module.functions.get_mut("main").unwrap();
        let t = main.fresh_temp();
        let entry = main.entry;
        let block = main.block_mut(entry).unwrap();
        for _ in 0..2 {
            block.instructions.push(Instruction::Const {
                dest: t,
                value: Literal::Word(U256::from(1)),
                ty: Type::uint256(),
            });
        }
        let diags = validate(&module);
        assert!(diags.iter().any(|d| d.message.contains("defined 2 times")));
    }

    #[test]
    fn missing_jump_target_detected() {
        let mut module = empty_module();
        let main = module.functions.get_mut("main").unwrap();
        let entry = main.entry;
        main.block_mut(entry).unwrap().terminator = Some(Terminator::Jump {
            target: BlockId(99),
        });
        let diags = validate(&module);
        assert!(diags.iter().any(|d| d.message.contains("missing block")));
    }

    #[test]
    fn unreachable_block_detected() {
        let mut module = empty_module();
        let main = module.functions.get_mut("main").unwrap();
        let orphan = main.fresh_block();
        main.block_mut(orphan).unwrap().terminator = Some(Terminator::Return { value: None });
        let diags = validate(&module);
        assert!(diags.iter().any(|d| d.message.contains("unreachable")));
    }

    #[test]
    fn incomplete_phi_detected() {
        let mut module = empty_module();
        let main = module.functions.get_mut("main").unwrap();
        let join = main.fresh_block();
        let entry = main.entry;
        main.block_mut(entry).unwrap().terminator = Some(Terminator::Jump { target: join });
        let dest = main.fresh_temp();
        {
            let block = main.block_mut(join).unwrap();
            block.terminator = Some(Terminator::Return { value: None });
            block.phis.push(crate::ir::Phi {
                dest,
                ty: Type::uint256(),
                sources: std::collections::BTreeMap::new(),
            });
        }
        main.recompute_predecessors();
        let diags = validate(&module);
        assert!(diags.iter().any(|d| d.message.contains("phi")));
    }

    #[test]
    fn duplicate_storage_slot_detected() {
        let mut module = empty_module();
        module.storage.push(crate::ir::StorageSlot {
            slot: 0,
            name: "a".into(),
            ty: Type::uint256(),
        });
        module.storage.push(crate::ir::StorageSlot {
            slot: 0,
            name: "b".into(),
            ty: Type::uint256(),
        });
        let diags = validate(&module);
        assert!(diags
            .iter()
            .any(|d| d.message.contains("storage slot 0")));
    }

    #[test]
    fn use_of_undefined_temp_detected() {
        let mut module = empty_module();
        let main = module.functions.get_mut("main").unwrap();
        let entry = main.entry;
        main.block_mut(entry).unwrap().terminator = Some(Terminator::Return {
            value: Some(Value::Temp {
                id: crate::ir::TempId(42),
                ty: Type::uint256(),
            }),
        });
        let diags = validate(&module);
        assert!(diags.iter().any(|d| d.message.contains("undefined temp")));
    }
}
