//! Structural hashing for the optimizer's fixed-point check
//!
//! The optimizer at level ≥ 2 re-runs its passes until the module stops
//! changing. Equality is decided by this hash: a canonical walk in stable
//! iteration order (functions by name, blocks by id, phi sources by
//! predecessor id; all maps are `BTreeMap`s, so iteration follows key order).
//! No textual serialization is involved.

use crate::ir::Module;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A structural fingerprint of the module. Equal modules hash equal;
/// distinct hashes mean the optimizer changed something.
pub fn structural_hash(module: &Module) -> u64 {
    let mut hasher = DefaultHasher::new();
    module.name.hash(&mut hasher);
    for slot in &module.storage {
        slot.slot.hash(&mut hasher);
        slot.name.hash(&mut hasher);
        slot.ty.hash(&mut hasher);
    }
    for (name, function) in &module.functions {
        name.hash(&mut hasher);
        function.entry.hash(&mut hasher);
        function.param_count.hash(&mut hasher);
        for local in &function.locals {
            local.name.hash(&mut hasher);
            local.ty.hash(&mut hasher);
        }
        for (id, block) in &function.blocks {
            id.hash(&mut hasher);
            block.phis.hash(&mut hasher);
            block.instructions.hash(&mut hasher);
            block.terminator.hash(&mut hasher);
            // Predecessors are derived from terminators; hashing them too
            // would only mask a failure to recompute them.
        }
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Instruction, Literal, Terminator};
    use crate::types::Type;
    use alloy_primitives::U256;

    fn module_with_const(value: u64) -> Module {
        let mut module = Module::new("t");
        let mut main = Function::new("main");
        let t = main.fresh_temp();
        let entry = main.entry;
        let block = main.block_mut(entry).unwrap();
        block.instructions.push(Instruction::Const {
            dest: t,
            value: Literal::Word(U256::from(value)),
            ty: Type::uint256(),
        });
        block.terminator = Some(Terminator::Return { value: None });
        module.functions.insert("main".into(), main);
        module
    }

    #[test]
    fn identical_modules_hash_equal() {
        assert_eq!(
            structural_hash(&module_with_const(1)),
            structural_hash(&module_with_const(1))
        );
    }

    #[test]
    fn different_constants_hash_differently() {
        assert_ne!(
            structural_hash(&module_with_const(1)),
            structural_hash(&module_with_const(2))
        );
    }

    #[test]
    fn hash_is_stable_across_clones() {
        let m = module_with_const(7);
        assert_eq!(structural_hash(&m), structural_hash(&m.clone()));
    }
}
