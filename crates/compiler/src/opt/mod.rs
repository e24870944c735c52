//! The optimizer: a fixed-point pass driver over the IR
//!
//! Levels select pass sets:
//!
//! - **0**: optimizer disabled.
//! - **1**: constant folding, constant propagation, dead-code elimination.
//! - **2**: adds common-subexpression elimination and jump optimization,
//!   and re-runs all enabled passes until the module's structural hash
//!   stops changing.
//! - **3**: adds block merging and return merging.
//!
//! Every pass is `fn(&mut Function) -> bool` (did anything change) and must
//! preserve the IR invariants the validator checks. Passes only remove or
//! replace instructions, so instruction counts are monotonically
//! non-increasing in the level.

mod blocks;
mod constants;
mod cse;
mod dce;
mod jumps;

pub use blocks::{merge_blocks, merge_returns};
pub use constants::{fold_constants, propagate_constants};
pub use cse::eliminate_common_subexpressions;
pub use dce::eliminate_dead_code;
pub use jumps::optimize_jumps;

use crate::ir::hash::structural_hash;
use crate::ir::{Function, Module};
use tracing::debug;

/// Upper bound on fixed-point iterations; a safety net against a pass pair
/// that oscillates.
const MAX_ROUNDS: usize = 10;

type Pass = (&'static str, fn(&mut Function) -> bool);

fn passes_for_level(level: u8) -> Vec<Pass> {
    let mut passes: Vec<Pass> = Vec::new();
    if level >= 1 {
        passes.push(("fold-constants", fold_constants));
        passes.push(("propagate-constants", propagate_constants));
        passes.push(("dce", eliminate_dead_code));
    }
    if level >= 2 {
        passes.push(("cse", eliminate_common_subexpressions));
        passes.push(("optimize-jumps", optimize_jumps));
    }
    if level >= 3 {
        passes.push(("merge-blocks", merge_blocks));
        passes.push(("merge-returns", merge_returns));
    }
    passes
}

/// Run the optimizer at `level` (0–3) over every function.
pub fn optimize(module: &mut Module, level: u8) {
    if level == 0 {
        return;
    }
    let passes = passes_for_level(level);
    let fixed_point = level >= 2;

    let mut rounds = 0;
    loop {
        let before = structural_hash(module);
        for (name, pass) in &passes {
            let mut changed = false;
            for function in module.functions.values_mut() {
                changed |= pass(function);
            }
            if changed {
                debug!(pass = name, "optimizer pass changed the module");
            }
        }
        rounds += 1;
        if !fixed_point || structural_hash(module) == before || rounds >= MAX_ROUNDS {
            break;
        }
    }
    debug!(level, rounds, "optimizer finished");
}
