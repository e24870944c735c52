//! The memory planner: spill analysis and scratch-memory layout
//!
//! The VM's stack is addressable only 16 deep, so not every SSA value can
//! live on it. This pass decides which values must be spilled to scratch
//! memory and assigns them byte offsets.
//!
//! Spilled by rule:
//!
//! 1. values live across a block boundary,
//! 2. phi destinations,
//! 3. named locals that kept memory identity,
//! 4. values a per-block stack simulation cannot keep reachable: missing,
//!    misplaced relative to their consumer, or deeper than the DUP/SWAP
//!    window, plus the deepest values whenever simulated depth exceeds a
//!    conservative threshold of 14.
//!
//! The simulation iterates to a fixed point: spilled values never occupy
//! the simulated stack, so each round works on the stack the code
//! generator will actually maintain. Offsets are then packed by descending
//! type size into 32-byte slots starting at `STATIC_BASE`.

use crate::diagnostics::{codes, Diagnostic};
use crate::ir::liveness::Liveness;
use crate::ir::{Function, ValueId};
use crate::types::Type;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Scratch slot used by hashing sequences.
pub const SCRATCH1: usize = 0x00;
/// Second scratch slot (mapping-key hashing writes key ‖ slot here).
pub const SCRATCH2: usize = 0x20;
/// The free-memory-pointer cell.
pub const FREE_PTR: usize = 0x40;
/// Reserved zero slot.
pub const ZERO_SLOT: usize = 0x60;
/// First byte available for static allocations.
pub const STATIC_BASE: usize = 0x80;

/// Hard ceiling on spill count; exceeding it is an allocation failure.
const MAX_SPILLS: usize = 1000;
/// Simulated depth above which the deepest values are evicted.
const DEPTH_THRESHOLD: usize = 14;
/// DUP/SWAP reach.
const STACK_WINDOW: usize = 16;

/// One spilled value's home.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub offset: usize,
    pub size: usize,
}

/// Per-function memory layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryLayout {
    pub allocations: BTreeMap<ValueId, Allocation>,
    /// First free static byte after all allocations, 32-byte aligned.
    pub next_static_offset: usize,
}

impl MemoryLayout {
    pub fn allocation(&self, id: &ValueId) -> Option<Allocation> {
        self.allocations.get(id).copied()
    }

    pub fn is_spilled(&self, id: &ValueId) -> bool {
        self.allocations.contains_key(id)
    }
}

/// Plan scratch memory for `function`.
pub fn plan(function: &Function, liveness: &Liveness) -> Result<MemoryLayout, Vec<Diagnostic>> {
    let types = value_types(function);

    // Rules 1–3: cross-block values, phi destinations, locals.
    let mut spilled: BTreeSet<ValueId> = liveness.cross_block_values.iter().cloned().collect();
    for block in function.blocks.values() {
        for phi in &block.phis {
            spilled.insert(ValueId::Temp(phi.dest));
        }
    }
    for local in &function.locals {
        spilled.insert(ValueId::Local(local.name.clone()));
    }

    // Rule 4: per-block stack simulation, iterated with the growing spill
    // set so the simulated stack matches what the generator will keep.
    loop {
        let before = spilled.len();
        for block in function.blocks.values() {
            simulate_block(function, block, &mut spilled);
        }
        if spilled.len() == before {
            break;
        }
    }

    if spilled.len() > MAX_SPILLS {
        return Err(vec![Diagnostic::error(
            codes::ALLOCATION_FAILED,
            format!(
                "{}: {} values require memory, limit is {}",
                function.name,
                spilled.len(),
                MAX_SPILLS
            ),
        )]);
    }

    // Pack by descending size; ties broken by id for determinism.
    let mut sized: Vec<(ValueId, usize)> = Vec::with_capacity(spilled.len());
    let mut diagnostics = Vec::new();
    for id in spilled {
        match types.get(&id) {
            Some(ty) => sized.push((id, ty.byte_size().clamp(1, 32))),
            None => diagnostics.push(Diagnostic::error(
                codes::INVALID_LAYOUT,
                format!("{}: no type recorded for {}", function.name, id),
            )),
        }
    }
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }
    sized.sort_by(|(a_id, a_size), (b_id, b_size)| {
        b_size.cmp(a_size).then_with(|| a_id.cmp(b_id))
    });

    let mut layout = MemoryLayout {
        allocations: BTreeMap::new(),
        next_static_offset: STATIC_BASE,
    };
    let mut cursor = STATIC_BASE;
    let mut slot_used = 32usize; // force a fresh slot for the first value
    for (id, size) in sized {
        let offset = if size >= 32 {
            let offset = align32(cursor.max(STATIC_BASE));
            cursor = offset + size;
            slot_used = 32;
            offset
        } else if slot_used + size > 32 {
            let offset = align32(cursor);
            cursor = offset + size;
            slot_used = size;
            offset
        } else {
            let offset = cursor;
            cursor += size;
            slot_used += size;
            offset
        };
        layout.allocations.insert(id, Allocation { offset, size });
    }
    layout.next_static_offset = align32(cursor);
    Ok(layout)
}

fn align32(n: usize) -> usize {
    (n + 31) & !31
}

/// Types of every value the planner may need to size.
fn value_types(function: &Function) -> HashMap<ValueId, Type> {
    let mut types = HashMap::new();
    for local in &function.locals {
        types.insert(ValueId::Local(local.name.clone()), local.ty.clone());
    }
    for block in function.blocks.values() {
        for phi in &block.phis {
            types.insert(ValueId::Temp(phi.dest), phi.ty.clone());
        }
        for instr in &block.instructions {
            if let (Some(dest), Some(ty)) = (instr.dest(), instr.result_type()) {
                types.insert(ValueId::Temp(dest), ty);
            }
        }
    }
    types
}

/// Simulate one block's stack, growing `spilled` where the generator could
/// not reach an operand.
fn simulate_block(
    function: &Function,
    block: &crate::ir::Block,
    spilled: &mut BTreeSet<ValueId>,
) {
    let mut stack: Vec<ValueId> = Vec::new();

    for instr in &block.instructions {
        let operand_ids: Vec<ValueId> = instr.operands().iter().filter_map(|v| v.id()).collect();
        consume(operand_ids, &mut stack, spilled);

        if let Some(dest) = instr.dest() {
            let id = ValueId::Temp(dest);
            if !spilled.contains(&id) {
                stack.push(id);
            }
        }

        // Conservative depth limit: evict from the bottom.
        while stack.len() > DEPTH_THRESHOLD {
            let bottom = stack.remove(0);
            spilled.insert(bottom);
        }
    }

    if let Some(term) = &block.terminator {
        // The generator stages successor phi sources at the block exit
        // (in phi order) before the terminator's own operands.
        let mut operand_ids: Vec<ValueId> = Vec::new();
        for succ in term.targets() {
            if let Some(sblock) = function.block(succ) {
                for phi in &sblock.phis {
                    if let Some(vid) = phi.sources.get(&block.id).and_then(|v| v.id()) {
                        operand_ids.push(vid);
                    }
                }
            }
        }
        operand_ids.extend(term.operands().iter().filter_map(|v| v.id()));
        consume(operand_ids, &mut stack, spilled);
    }
}

/// Consume one instruction's operands from the simulated stack.
///
/// Operands already in memory are loaded fresh by the generator; only
/// stack-resident ones are checked. The generator pulls stack operands
/// from the top region in operand order, so a value used out of place,
/// used a second time, or buried beyond the DUP/SWAP window is spilled.
fn consume(
    operand_ids: Vec<ValueId>,
    stack: &mut Vec<ValueId>,
    spilled: &mut BTreeSet<ValueId>,
) {
    let wanted: Vec<ValueId> = operand_ids
        .into_iter()
        .filter(|id| !spilled.contains(id))
        .collect();
    // A wanted value missing from the stack was consumed by an earlier
    // use; it must live in memory instead.
    for id in &wanted {
        if !stack.contains(id) {
            spilled.insert(id.clone());
        }
    }
    let on_stack: Vec<ValueId> = wanted
        .iter()
        .filter(|id| stack.contains(id))
        .cloned()
        .collect();

    let n = on_stack.len();
    let placed_ok = stack.len() >= n
        && stack
            .iter()
            .rev()
            .take(n)
            .eq(on_stack.iter().rev());
    let too_deep = on_stack.iter().any(|id| {
        stack
            .iter()
            .rev()
            .position(|s| s == id)
            .is_some_and(|d| d >= STACK_WINDOW)
    });
    if placed_ok && !too_deep {
        for id in &on_stack {
            if let Some(pos) = stack.iter().position(|s| s == id) {
                stack.remove(pos);
            }
        }
    } else {
        for id in on_stack {
            spilled.insert(id.clone());
            if let Some(pos) = stack.iter().position(|s| *s == id) {
                stack.remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::liveness;
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
        let (mut module, diags) = crate::ir::builder::build(&program, &symbols);
        assert!(diags.is_empty(), "build: {:?}", diags);
        ssa::insert_phis(&mut module);
        module
    }

    fn plan_main(source: &str) -> MemoryLayout {
        let module = module_for(source);
        let main = module.main().unwrap();
        let live = liveness::analyze(main);
        plan(main, &live).expect("planning succeeds")
    }

    #[test]
    fn straight_line_needs_no_memory() {
        let layout = plan_main("name X; code { let a = 1 + 2; let b = a + 3; }");
        assert!(layout.allocations.is_empty());
        assert_eq!(layout.next_static_offset, STATIC_BASE);
    }

    #[test]
    fn phi_destination_allocated() {
        let module = module_for(
            "name X; code -> uint256 { let i = 0; while (i < 10) { i = i + 1; } return i; }",
        );
        let main = module.main().unwrap();
        let live = liveness::analyze(main);
        let layout = plan(main, &live).unwrap();
        let phi_dest = main
            .blocks
            .values()
            .flat_map(|b| &b.phis)
            .map(|p| ValueId::Temp(p.dest))
            .next()
            .expect("phi exists");
        assert!(layout.is_spilled(&phi_dest));
    }

    #[test]
    fn locals_with_memory_identity_allocated() {
        let layout = plan_main("name X; code { let s = \"hello\"; let n = s.length; }");
        assert!(layout
            .allocations
            .keys()
            .any(|id| matches!(id, ValueId::Local(name) if name == "s")));
    }

    #[test]
    fn allocations_32_byte_slots_and_aligned_base() {
        let layout = plan_main(
            "name X; code -> uint256 { let i = 0; let j = 0; while (i < 10) { i = i + 1; j = j + i; } return j; }",
        );
        assert!(!layout.allocations.is_empty());
        for alloc in layout.allocations.values() {
            assert!(alloc.offset >= STATIC_BASE);
            if alloc.size >= 32 {
                assert_eq!(alloc.offset % 32, 0);
            }
        }
        assert_eq!(layout.next_static_offset % 32, 0);
    }

    #[test]
    fn allocations_do_not_overlap() {
        let layout = plan_main(
            "name X; code -> uint256 { let i = 0; let j = 1; let k = 2; while (i < 9) { i = i + 1; j = j + i; k = k + j; } return k; }",
        );
        let mut spans: Vec<(usize, usize)> = layout
            .allocations
            .values()
            .map(|a| (a.offset, a.offset + a.size))
            .collect();
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", spans);
        }
    }

    #[test]
    fn deep_expression_forces_spills() {
        // 17 runtime-derived values all live at once (each is used again
        // by the final sum), so the simulated stack climbs past the
        // 14-deep threshold and the deepest ones land in memory.
        let n = 17usize;
        let mut source = String::from("name X; code -> uint256 {\n");
        for i in 1..=n {
            source.push_str(&format!("  let a{} = msg.value + {};\n", i, i));
        }
        source.push_str("  let r = a1");
        for i in 2..=n {
            source.push_str(&format!(" + a{}", i));
        }
        source.push_str(";\n  return r;\n}");
        let layout = plan_main(&source);
        assert!(
            layout.allocations.len() >= n - DEPTH_THRESHOLD,
            "expected at least {} spills, got {:?}",
            n - DEPTH_THRESHOLD,
            layout.allocations
        );
    }

    #[test]
    fn planning_is_idempotent() {
        let module = module_for(
            "name X; code -> uint256 { let i = 0; while (i < 10) { i = i + 1; } return i; }",
        );
        let main = module.main().unwrap();
        let live = liveness::analyze(main);
        let first = plan(main, &live).unwrap();
        let second = plan(main, &live).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn packing_shares_slots_for_small_values() {
        use crate::ir::{Local, Terminator};
        // An address and two bools pack into a single 32-byte slot:
        // 20 + 1 + 1 = 22 bytes.
        let mut f = Function::new("main");
        for (name, ty) in [
            ("owner", Type::Address),
            ("a", Type::Bool),
            ("b", Type::Bool),
        ] {
            f.locals.push(Local {
                id: f.locals.len() as u32,
                name: name.into(),
                ty,
                location: None,
            });
        }
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Return { value: None });
        let live = liveness::analyze(&f);
        let layout = plan(&f, &live).unwrap();
        let get = |name: &str| layout.allocation(&ValueId::Local(name.into())).unwrap();
        assert_eq!(get("owner"), Allocation { offset: 0x80, size: 20 });
        assert_eq!(get("a"), Allocation { offset: 0x94, size: 1 });
        assert_eq!(get("b"), Allocation { offset: 0x95, size: 1 });
        assert_eq!(layout.next_static_offset, 0xa0);
    }
}
