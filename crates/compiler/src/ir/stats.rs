//! IR statistics for `--stats`
//!
//! Counts per module: functions, blocks, instructions, phis, temps and
//! locals, plus a histogram keyed by instruction kind.

use crate::ir::{Instruction, Module};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleStats {
    pub functions: usize,
    pub blocks: usize,
    pub instructions: usize,
    pub phis: usize,
    pub temps: usize,
    pub locals: usize,
    pub by_kind: BTreeMap<&'static str, usize>,
}

fn kind_name(instr: &Instruction) -> &'static str {
    use Instruction::*;
    match instr {
        Const { .. } => "const",
        Binary { .. } => "binary",
        Unary { .. } => "unary",
        LoadStorage { .. } => "load_storage",
        StoreStorage { .. } => "store_storage",
        LoadMapping { .. } => "load_mapping",
        StoreMapping { .. } => "store_mapping",
        LoadLocal { .. } => "load_local",
        StoreLocal { .. } => "store_local",
        LoadField { .. } => "load_field",
        StoreField { .. } => "store_field",
        LoadIndex { .. } => "load_index",
        StoreIndex { .. } => "store_index",
        ComputeSlot { .. } => "compute_slot",
        ComputeArraySlot { .. } => "compute_array_slot",
        ComputeFieldOffset { .. } => "compute_field_offset",
        Env { .. } => "env",
        Hash { .. } => "hash",
        Cast { .. } => "cast",
        Slice { .. } => "slice",
        Length { .. } => "length",
        Call { .. } => "call",
    }
}

/// Collect statistics over every function in the module.
pub fn collect(module: &Module) -> ModuleStats {
    let mut stats = ModuleStats {
        functions: module.functions.len(),
        ..Default::default()
    };
    for function in module.functions.values() {
        stats.blocks += function.blocks.len();
        stats.locals += function.locals.len();
        for block in function.blocks.values() {
            stats.phis += block.phis.len();
            stats.temps += block.phis.len();
            for instr in &block.instructions {
                stats.instructions += 1;
                if instr.dest().is_some() {
                    stats.temps += 1;
                }
                *stats.by_kind.entry(kind_name(instr)).or_insert(0) += 1;
            }
        }
    }
    stats
}

impl std::fmt::Display for ModuleStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "functions:    {}", self.functions)?;
        writeln!(f, "blocks:       {}", self.blocks)?;
        writeln!(f, "instructions: {}", self.instructions)?;
        writeln!(f, "phis:         {}", self.phis)?;
        writeln!(f, "temps:        {}", self.temps)?;
        writeln!(f, "locals:       {}", self.locals)?;
        if !self.by_kind.is_empty() {
            writeln!(f, "by kind:")?;
            for (kind, count) in &self.by_kind {
                writeln!(f, "  {:<22} {}", kind, count)?;
            }
        }
        Ok(())
    }
}
