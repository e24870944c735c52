//! Code generation: IR → VM instructions → bytecode
//!
//! Functions are emitted block by block in layout order over the typed
//! stack model. Jump targets are PUSH2 placeholders recorded in a patch
//! list and rewritten once every block's byte offset is known. Phi moves
//! are emitted at the *predecessor's* exit, ahead of its jump; the SSA
//! pass split critical edges so a branching predecessor never has to move
//! phis itself.
//!
//! Module layout mirrors the pass structure:
//!
//! - `memory`: spill analysis and scratch layout
//! - `layout`: block linearization
//! - `stack`: the branded stack model and emission combinators
//! - `instr`: per-instruction lowering
//! - `deploy`: the deployment wrapper
//! - `error`: fatal error type

pub mod deploy;
pub mod error;
mod instr;
pub mod layout;
pub mod memory;
pub mod stack;

pub use error::CodegenError;

use crate::diagnostics::Diagnostic;
use crate::ir::{liveness, BlockId, Function, Module, TempId, Terminator, ValueId};
use memory::MemoryLayout;
use stack::Emitter;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A compiled function: its instruction buffer plus soft warnings.
#[derive(Debug)]
pub struct FunctionCode {
    pub instructions: Vec<ember_evm::Instruction>,
    pub warnings: Vec<Diagnostic>,
}

/// The bytecode artifacts of a module.
#[derive(Debug)]
pub struct BytecodeArtifact {
    /// Runtime code bytes (the `main` function).
    pub runtime: Vec<u8>,
    /// Deployment bytecode: constructor ‖ stub ‖ runtime.
    pub create: Vec<u8>,
    pub runtime_instructions: Vec<ember_evm::Instruction>,
    pub create_instructions: Vec<ember_evm::Instruction>,
    pub warnings: Vec<Diagnostic>,
}

/// Generate bytecode for a whole module.
pub fn generate(module: &Module) -> Result<BytecodeArtifact, Vec<Diagnostic>> {
    let mut warnings = Vec::new();

    let Some(main) = module.main() else {
        return Err(vec![Diagnostic::error(
            crate::diagnostics::codes::INVARIANT_VIOLATED,
            "module has no main function",
        )]);
    };

    let main_code = compile_function(main)?;
    warnings.extend(main_code.warnings);
    let runtime = ember_evm::serialize(&main_code.instructions).map_err(|e| {
        vec![Diagnostic::error(
            crate::diagnostics::codes::INVARIANT_VIOLATED,
            e.to_string(),
        )]
    })?;

    let create_code = match module.create() {
        Some(create) => {
            let mut code = compile_function(create)?;
            warnings.append(&mut code.warnings);
            Some(code.instructions)
        }
        None => None,
    };

    let (create_instructions, create) =
        deploy::wrap(create_code.as_deref().unwrap_or(&[]), &runtime).map_err(|e| {
            vec![Diagnostic::error(
                crate::diagnostics::codes::INVARIANT_VIOLATED,
                e.to_string(),
            )]
        })?;

    debug!(
        runtime_len = runtime.len(),
        create_len = create.len(),
        "bytecode generated"
    );

    Ok(BytecodeArtifact {
        runtime,
        create,
        runtime_instructions: main_code.instructions,
        create_instructions,
        warnings,
    })
}

/// Run liveness, memory planning and emission for one function.
pub fn compile_function(function: &Function) -> Result<FunctionCode, Vec<Diagnostic>> {
    let live = liveness::analyze(function);
    let layout = memory::plan(function, &live)?;
    let emitter = FunctionEmitter::new(function, &layout);
    emitter.emit().map_err(|e| vec![e.into_diagnostic()])
}

/// A recorded PUSH2 placeholder awaiting its target's byte offset.
struct Patch {
    /// Index of the placeholder instruction in the buffer.
    index: usize,
    target: BlockId,
}

/// Per-function emission state.
pub struct FunctionEmitter<'a> {
    pub(crate) function: &'a Function,
    pub(crate) layout: &'a MemoryLayout,
    pub(crate) em: Emitter,
    pub(crate) warnings: Vec<Diagnostic>,
    /// Uses per temp, counting instruction operands, phi sources and
    /// terminator operands. Zero-use results are popped at creation.
    pub(crate) use_counts: HashMap<TempId, usize>,
    order: Vec<BlockId>,
    block_offsets: BTreeMap<BlockId, usize>,
    patches: Vec<Patch>,
}

impl<'a> FunctionEmitter<'a> {
    fn new(function: &'a Function, layout: &'a MemoryLayout) -> Self {
        let mut use_counts: HashMap<TempId, usize> = HashMap::new();
        let mut count = |id: Option<ValueId>| {
            if let Some(ValueId::Temp(t)) = id {
                *use_counts.entry(t).or_insert(0) += 1;
            }
        };
        for block in function.blocks.values() {
            for phi in &block.phis {
                for value in phi.sources.values() {
                    count(value.id());
                }
            }
            for instr in &block.instructions {
                for value in instr.operands() {
                    count(value.id());
                }
            }
            if let Some(term) = &block.terminator {
                for value in term.operands() {
                    count(value.id());
                }
            }
        }
        FunctionEmitter {
            function,
            layout,
            em: Emitter::new(),
            warnings: Vec::new(),
            use_counts,
            order: layout::linearize(function),
            block_offsets: BTreeMap::new(),
            patches: Vec::new(),
        }
    }

    fn emit(mut self) -> Result<FunctionCode, CodegenError> {
        let order = self.order.clone();
        for (position, &block_id) in order.iter().enumerate() {
            self.em.clear_stack();
            self.block_offsets.insert(block_id, self.em.offset());

            if position == 0 {
                // Initialize the free-memory pointer, unless the function
                // is completely empty and never touches memory.
                let empty =
                    self.function.instruction_count() == 0 && self.layout.allocations.is_empty();
                if !empty {
                    self.em.push_usize(self.layout.next_static_offset, "value");
                    self.em.push_usize(memory::FREE_PTR, "offset");
                    self.em
                        .op(ember_evm::Opcode::Mstore, &["offset", "value"], None)?;
                }
            } else {
                self.em.raw(ember_evm::Opcode::Jumpdest);
            }

            let block = self
                .function
                .block(block_id)
                .expect("layout only lists existing blocks");
            for instruction in &block.instructions {
                self.lower_instruction(instruction)?;
            }

            let next = order.get(position + 1).copied();
            let is_last = position == order.len() - 1;
            self.emit_terminator(block_id, next, is_last)?;
        }

        self.patch_jumps()?;

        Ok(FunctionCode {
            instructions: self.em.instructions,
            warnings: self.warnings,
        })
    }

    fn emit_terminator(
        &mut self,
        block_id: BlockId,
        next: Option<BlockId>,
        is_last: bool,
    ) -> Result<(), CodegenError> {
        let term = self
            .function
            .block(block_id)
            .and_then(|b| b.terminator.clone())
            .ok_or_else(|| {
                CodegenError::MissingJumpTarget(format!("{} has no terminator", block_id))
            })?;
        match term {
            Terminator::Jump { target } => {
                self.emit_phi_moves(block_id, target)?;
                // A jump to the immediately following block falls through.
                if next == Some(target) {
                    return Ok(());
                }
                let index = self.em.push2_placeholder("counter");
                self.em.op(ember_evm::Opcode::Jump, &["counter"], None)?;
                self.patches.push(Patch { index, target });
                Ok(())
            }
            Terminator::Branch {
                condition,
                true_target,
                false_target,
            } => {
                for target in [true_target, false_target] {
                    let has_phis = self
                        .function
                        .block(target)
                        .is_some_and(|b| !b.phis.is_empty());
                    if has_phis {
                        return Err(CodegenError::UnresolvedPhi(format!(
                            "branch target {} has phis; critical edge was not split",
                            target
                        )));
                    }
                }
                self.materialize(&[(&condition, "cond")])?;
                let index = self.em.push2_placeholder("counter");
                self.em
                    .op(ember_evm::Opcode::Jumpi, &["counter", "cond"], None)?;
                self.patches.push(Patch {
                    index,
                    target: true_target,
                });
                if next == Some(false_target) {
                    return Ok(());
                }
                let index = self.em.push2_placeholder("counter");
                self.em.op(ember_evm::Opcode::Jump, &["counter"], None)?;
                self.patches.push(Patch {
                    index,
                    target: false_target,
                });
                Ok(())
            }
            Terminator::Return { value: Some(value) } => {
                // A value already in memory returns straight from its
                // word-sized slot; anything else is stored first.
                if let Some(alloc) = value.id().and_then(|id| self.layout.allocation(&id)) {
                    if alloc.size == 32 {
                        self.em.push_usize(32, "size");
                        self.em.push_usize(alloc.offset, "offset");
                        return self
                            .em
                            .op(ember_evm::Opcode::Return, &["offset", "size"], None);
                    }
                }
                self.materialize(&[(&value, "value")])?;
                let offset = self.layout.next_static_offset;
                self.em.push_usize(offset, "offset");
                self.em
                    .op(ember_evm::Opcode::Mstore, &["offset", "value"], None)?;
                self.em.push_usize(32, "size");
                self.em.push_usize(offset, "offset");
                self.em
                    .op(ember_evm::Opcode::Return, &["offset", "size"], None)
            }
            Terminator::Return { value: None } => {
                // Falling off the end of the code stops implicitly.
                if !is_last {
                    self.em.op(ember_evm::Opcode::Stop, &[], None)?;
                }
                Ok(())
            }
        }
    }

    /// Stage every phi source for the `pred → target` edge, then store
    /// them into the phis' memory slots. Staging everything before the
    /// first store keeps simultaneous phis (loop-carried swaps) correct.
    fn emit_phi_moves(&mut self, pred: BlockId, target: BlockId) -> Result<(), CodegenError> {
        let phis = match self.function.block(target) {
            Some(block) if !block.phis.is_empty() => block.phis.clone(),
            _ => return Ok(()),
        };
        if phis.len() > 14 {
            return Err(CodegenError::StackShape(format!(
                "{} simultaneous phi moves exceed the stack window",
                phis.len()
            )));
        }
        let mut staged = Vec::with_capacity(phis.len());
        for phi in &phis {
            let source = phi.sources.get(&pred).ok_or_else(|| {
                CodegenError::UnresolvedPhi(format!(
                    "phi {} in {} has no source for predecessor {}",
                    phi.dest, target, pred
                ))
            })?;
            staged.push((source, "value"));
        }
        self.materialize(&staged)?;
        for phi in phis.iter().rev() {
            let alloc = self
                .layout
                .allocation(&ValueId::Temp(phi.dest))
                .ok_or_else(|| {
                    CodegenError::UnallocatedValue(format!("phi destination {}", phi.dest))
                })?;
            self.store_allocation(alloc)?;
        }
        Ok(())
    }

    /// Rewrite every PUSH2 placeholder with its target's big-endian byte
    /// offset.
    fn patch_jumps(&mut self) -> Result<(), CodegenError> {
        for patch in &self.patches {
            let offset = self
                .block_offsets
                .get(&patch.target)
                .copied()
                .ok_or_else(|| {
                    CodegenError::MissingJumpTarget(format!(
                        "no offset recorded for {}",
                        patch.target
                    ))
                })?;
            let offset = u16::try_from(offset).map_err(|_| {
                CodegenError::MissingJumpTarget(format!(
                    "{} at byte offset {} exceeds PUSH2 range",
                    patch.target, offset
                ))
            })?;
            self.em.instructions[patch.index].patch_push2(offset);
        }
        Ok(())
    }
}
