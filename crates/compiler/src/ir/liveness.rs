//! Liveness analysis
//!
//! Standard backward dataflow over `ValueId` sets. Phi sources count as
//! uses on the predecessor edge, not in the phi's own block; phi
//! destinations are definitions of the block holding the phi.
//!
//! The result is monotone in its inputs: adding uses can only grow the
//! sets. `cross_block_values` is exactly the union of all live-out sets.

use crate::ir::{BlockId, Function, ValueId};
use std::collections::{BTreeMap, HashSet};

/// Per-function liveness facts consumed by the memory planner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Liveness {
    pub live_in: BTreeMap<BlockId, HashSet<ValueId>>,
    pub live_out: BTreeMap<BlockId, HashSet<ValueId>>,
    /// Every value live across any block boundary.
    pub cross_block_values: HashSet<ValueId>,
}

impl Liveness {
    pub fn live_in(&self, block: BlockId) -> &HashSet<ValueId> {
        static EMPTY: std::sync::OnceLock<HashSet<ValueId>> = std::sync::OnceLock::new();
        self.live_in
            .get(&block)
            .unwrap_or_else(|| EMPTY.get_or_init(HashSet::new))
    }

    pub fn live_out(&self, block: BlockId) -> &HashSet<ValueId> {
        static EMPTY: std::sync::OnceLock<HashSet<ValueId>> = std::sync::OnceLock::new();
        self.live_out
            .get(&block)
            .unwrap_or_else(|| EMPTY.get_or_init(HashSet::new))
    }
}

/// Compute liveness for `function`.
pub fn analyze(function: &Function) -> Liveness {
    // Per-block use (used before defined) and def sets. Phi sources are
    // not uses here; they are added on the predecessor edge during the
    // live-out computation below.
    let mut uses: BTreeMap<BlockId, HashSet<ValueId>> = BTreeMap::new();
    let mut defs: BTreeMap<BlockId, HashSet<ValueId>> = BTreeMap::new();

    for (&id, block) in &function.blocks {
        let use_set = uses.entry(id).or_default();
        let def_set = defs.entry(id).or_default();

        for phi in &block.phis {
            def_set.insert(ValueId::Temp(phi.dest));
        }

        for instr in &block.instructions {
            for operand in instr.operands() {
                if let Some(vid) = operand.id() {
                    if !def_set.contains(&vid) {
                        use_set.insert(vid);
                    }
                }
            }
            if let Some(dest) = instr.dest() {
                def_set.insert(ValueId::Temp(dest));
            }
            if let Some(local) = instr.defined_local() {
                def_set.insert(ValueId::Local(local.to_string()));
            }
        }

        if let Some(term) = &block.terminator {
            for operand in term.operands() {
                if let Some(vid) = operand.id() {
                    if !def_set.contains(&vid) {
                        use_set.insert(vid);
                    }
                }
            }
        }
    }

    let mut live_in: BTreeMap<BlockId, HashSet<ValueId>> = BTreeMap::new();
    let mut live_out: BTreeMap<BlockId, HashSet<ValueId>> = BTreeMap::new();
    for &id in function.blocks.keys() {
        live_in.insert(id, HashSet::new());
        live_out.insert(id, HashSet::new());
    }

    // Iterate to a fixed point; postorder (reverse of RPO) converges in a
    // couple of rounds for reducible CFGs.
    let mut order = function.reverse_postorder();
    order.reverse();
    let mut changed = true;
    while changed {
        changed = false;
        for &id in &order {
            let mut out: HashSet<ValueId> = HashSet::new();
            for succ in function.successors(id) {
                if let Some(succ_in) = live_in.get(&succ) {
                    out.extend(succ_in.iter().cloned());
                }
                // Values flowing into succ's phis along this edge are live
                // at the end of this block.
                if let Some(sblock) = function.block(succ) {
                    for phi in &sblock.phis {
                        if let Some(value) = phi.sources.get(&id) {
                            if let Some(vid) = value.id() {
                                out.insert(vid);
                            }
                        }
                        // The phi dest is defined at the join, not live in
                        // from the edge.
                    }
                }
            }

            let mut inn: HashSet<ValueId> = uses.get(&id).cloned().unwrap_or_default();
            let def_set = defs.get(&id).cloned().unwrap_or_default();
            for vid in &out {
                if !def_set.contains(vid) {
                    inn.insert(vid.clone());
                }
            }

            if live_out.get(&id) != Some(&out) {
                live_out.insert(id, out);
                changed = true;
            }
            if live_in.get(&id) != Some(&inn) {
                live_in.insert(id, inn);
                changed = true;
            }
        }
    }

    let mut cross_block_values = HashSet::new();
    for set in live_out.values() {
        cross_block_values.extend(set.iter().cloned());
    }

    Liveness {
        live_in,
        live_out,
        cross_block_values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder;
    use crate::ir::ssa;
    use crate::ir::Module;
    use crate::parser::Parser;
    use crate::typechecker::TypeChecker;

    fn module_for(source: &str) -> Module {
        let (program, diags) = Parser::new(source).parse();
        assert!(diags.is_empty(), "parse: {:?}", diags);
        let mut program = program.unwrap();
        let (symbols, diags) = TypeChecker::new().check(&mut program);
        assert!(diags.is_empty(), "types: {:?}", diags);
        let (mut module, diags) = builder::build(&program, &symbols);
        assert!(diags.is_empty(), "build: {:?}", diags);
        ssa::insert_phis(&mut module);
        module
    }

    #[test]
    fn straight_line_has_no_cross_block_values() {
        let module = module_for("name X; code { let a = 1 + 2; let b = a + 3; }");
        let main = module.main().unwrap();
        let liveness = analyze(main);
        assert!(liveness.cross_block_values.is_empty());
    }

    #[test]
    fn loop_carried_value_is_cross_block() {
        let module = module_for(
            "name X; code -> uint256 { let i = 0; while (i < 10) { i = i + 1; } return i; }",
        );
        let main = module.main().unwrap();
        let liveness = analyze(main);
        // The phi dest lives across the loop.
        let phi_dest = main
            .blocks
            .values()
            .flat_map(|b| &b.phis)
            .map(|p| ValueId::Temp(p.dest))
            .next()
            .expect("phi exists");
        assert!(liveness.cross_block_values.contains(&phi_dest));
    }

    #[test]
    fn phi_sources_live_out_of_predecessors() {
        let module = module_for(
            "name X; code -> uint256 { let i = 0; while (i < 10) { i = i + 1; } return i; }",
        );
        let main = module.main().unwrap();
        let liveness = analyze(main);
        // Find the body block: it defines the incremented temp that flows
        // into the header phi.
        let (header_id, phi) = main
            .blocks
            .values()
            .find(|b| !b.phis.is_empty())
            .map(|b| (b.id, b.phis[0].clone()))
            .expect("header with phi");
        for (&pred, value) in &phi.sources {
            if let Some(vid) = value.id() {
                assert!(
                    liveness.live_out(pred).contains(&vid),
                    "phi source {:?} must be live out of {}",
                    vid,
                    pred
                );
            }
        }
        // The phi dest is live into the header's successors that use it.
        let _ = header_id;
    }

    #[test]
    fn cross_block_equals_union_of_live_out() {
        let module = module_for(
            "name X; code -> uint256 { let a = 1; if (a) { a = 2; } return a; }",
        );
        let main = module.main().unwrap();
        let liveness = analyze(main);
        let mut union = HashSet::new();
        for set in liveness.live_out.values() {
            union.extend(set.iter().cloned());
        }
        assert_eq!(liveness.cross_block_values, union);
    }

    #[test]
    fn reference_local_live_across_blocks() {
        let module = module_for(
            "name X; code { let s = \"hello\"; if (1) { let n = s.length; } }",
        );
        let main = module.main().unwrap();
        let liveness = analyze(main);
        assert!(liveness
            .cross_block_values
            .iter()
            .any(|v| matches!(v, ValueId::Local(name) if name == "s")));
    }
}
