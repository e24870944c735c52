//! The typed stack model
//!
//! Every code-emitting primitive is a transition from one stack shape to
//! another, annotated with *brands*: symbolic role names ("offset", "size",
//! "value", "slot", …). The emitter tracks the symbolic stack alongside the
//! instruction buffer and rejects sequences whose shapes disagree: a brand
//! mismatch is a compiler bug surfacing at emission time instead of a
//! corrupted runtime stack.
//!
//! Stack items optionally carry the SSA id they hold, which is how operand
//! fetching finds already-computed values for SWAP/DUP reuse.

use crate::codegen::error::CodegenError;
use crate::codegen::memory::FREE_PTR;
use crate::ir::ValueId;
use alloy_primitives::U256;
use ember_evm::{Instruction, Opcode};

/// A symbolic role name. Checked at emission time.
pub type Brand = &'static str;

/// One tracked stack slot.
#[derive(Debug, Clone, PartialEq)]
pub struct StackItem {
    pub brand: Brand,
    /// The SSA value this slot holds, when it holds one.
    pub value: Option<ValueId>,
}

/// Instruction buffer plus symbolic stack.
#[derive(Debug, Default)]
pub struct Emitter {
    pub instructions: Vec<Instruction>,
    stack: Vec<StackItem>,
    byte_offset: usize,
}

impl Emitter {
    pub fn new() -> Self {
        Emitter::default()
    }

    /// Current byte offset: where the next instruction will land.
    pub fn offset(&self) -> usize {
        self.byte_offset
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Reset the symbolic stack at a block boundary. Cross-block values
    /// live in memory, so each block starts from an empty model.
    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    fn append(&mut self, instruction: Instruction) {
        self.byte_offset += instruction.size();
        self.instructions.push(instruction);
    }

    /// Emit a bare opcode without touching the model. Only for JUMPDEST,
    /// which has no stack effect.
    pub fn raw(&mut self, opcode: Opcode) {
        debug_assert_eq!(opcode, Opcode::Jumpdest);
        self.append(Instruction::new(opcode));
    }

    /// Push an immediate word with minimal PUSH width.
    pub fn push_word(&mut self, value: U256, brand: Brand) {
        self.append(Instruction::push_value(value));
        self.stack.push(StackItem { brand, value: None });
    }

    pub fn push_usize(&mut self, value: usize, brand: Brand) {
        self.push_word(U256::from(value), brand);
    }

    /// Reserve a PUSH2 placeholder for a jump target; returns the index of
    /// the placeholder in the buffer for later patching.
    pub fn push2_placeholder(&mut self, brand: Brand) -> usize {
        let index = self.instructions.len();
        self.append(Instruction::push2_placeholder());
        self.stack.push(StackItem { brand, value: None });
        index
    }

    /// Emit `opcode`, consuming `pops` (top first) and producing `push`.
    ///
    /// The symbolic stack must match: same depth, same brands. The pushed
    /// item is untagged; use [`Emitter::tag_top`] to associate an SSA id.
    pub fn op(
        &mut self,
        opcode: Opcode,
        pops: &[Brand],
        push: Option<Brand>,
    ) -> Result<(), CodegenError> {
        if self.stack.len() < pops.len() {
            return Err(CodegenError::StackShape(format!(
                "{} needs {} items, stack has {}",
                opcode,
                pops.len(),
                self.stack.len()
            )));
        }
        for (i, expected) in pops.iter().enumerate() {
            let actual = &self.stack[self.stack.len() - 1 - i];
            if actual.brand != *expected {
                return Err(CodegenError::StackShape(format!(
                    "{} expects `{}` at depth {}, found `{}`",
                    opcode, expected, i, actual.brand
                )));
            }
        }
        let keep = self.stack.len() - pops.len();
        self.stack.truncate(keep);
        self.append(Instruction::new(opcode));
        if let Some(brand) = push {
            self.stack.push(StackItem { brand, value: None });
        }
        Ok(())
    }

    /// `DUPn`, n ∈ [1, 16]: copies the item at depth n−1 to the top.
    pub fn dup(&mut self, n: usize) -> Result<(), CodegenError> {
        if n == 0 || n > 16 || n > self.stack.len() {
            return Err(CodegenError::StackShape(format!(
                "DUP{} with stack depth {}",
                n,
                self.stack.len()
            )));
        }
        let item = self.stack[self.stack.len() - n].clone();
        self.append(Instruction::new(Opcode::dup(n)));
        self.stack.push(item);
        Ok(())
    }

    /// `SWAPn`, n ∈ [1, 16]: exchanges the top with the item at depth n.
    pub fn swap(&mut self, n: usize) -> Result<(), CodegenError> {
        if n == 0 || n > 16 || n >= self.stack.len() {
            return Err(CodegenError::StackShape(format!(
                "SWAP{} with stack depth {}",
                n,
                self.stack.len()
            )));
        }
        let top = self.stack.len() - 1;
        self.stack.swap(top, top - n);
        self.append(Instruction::new(Opcode::swap(n)));
        Ok(())
    }

    /// Discard the top item.
    pub fn pop(&mut self) -> Result<(), CodegenError> {
        if self.stack.is_empty() {
            return Err(CodegenError::StackShape("POP on empty stack".into()));
        }
        self.stack.pop();
        self.append(Instruction::new(Opcode::Pop));
        Ok(())
    }

    /// Re-brand the top item; emits nothing.
    pub fn rebrand_top(&mut self, brand: Brand) -> Result<(), CodegenError> {
        self.rebrand_at(0, brand)
    }

    /// Re-brand the item at `depth` (0 = top); emits nothing.
    pub fn rebrand_at(&mut self, depth: usize, brand: Brand) -> Result<(), CodegenError> {
        let len = self.stack.len();
        if depth >= len {
            return Err(CodegenError::StackShape(format!(
                "rebrand at depth {} with stack depth {}",
                depth, len
            )));
        }
        self.stack[len - 1 - depth].brand = brand;
        Ok(())
    }

    /// Associate the top item with an SSA id; emits nothing.
    pub fn tag_top(&mut self, value: ValueId) -> Result<(), CodegenError> {
        match self.stack.last_mut() {
            Some(item) => {
                item.value = Some(value);
                Ok(())
            }
            None => Err(CodegenError::StackShape("tag on empty stack".into())),
        }
    }

    /// Depth (0 = top) of the slot holding `value`, if any.
    pub fn find(&self, value: &ValueId) -> Option<usize> {
        self.stack
            .iter()
            .rev()
            .position(|item| item.value.as_ref() == Some(value))
    }

    /// Clear the SSA tag of the item at `depth`.
    pub fn untag(&mut self, depth: usize) {
        let len = self.stack.len();
        if depth < len {
            self.stack[len - 1 - depth].value = None;
        }
    }

    // --------------------------------------------------------------
    // Dynamic memory allocator
    // --------------------------------------------------------------

    /// Allocate `size` bytes of dynamic memory: reads the free-memory
    /// pointer, bumps it, writes it back. Leaves the allocated pointer on
    /// the stack branded `ptr`.
    pub fn allocate_immediate(&mut self, size: usize) -> Result<(), CodegenError> {
        self.push_usize(FREE_PTR, "offset");
        self.op(Opcode::Mload, &["offset"], Some("ptr"))?;
        self.dup(1)?; // [ptr, ptr]
        self.push_usize(size, "size");
        self.op(Opcode::Add, &["size", "ptr"], Some("value"))?; // new free pointer
        self.push_usize(FREE_PTR, "offset");
        self.op(Opcode::Mstore, &["offset", "value"], None)?; // [ptr]
        Ok(())
    }

    /// Allocator variant taking the size from the stack (brand `size` on
    /// top). Leaves `ptr`.
    pub fn allocate_from_stack(&mut self) -> Result<(), CodegenError> {
        // [size]
        self.push_usize(FREE_PTR, "offset");
        self.op(Opcode::Mload, &["offset"], Some("ptr"))?; // [size, ptr]
        self.dup(1)?; // [size, ptr, ptr]
        self.swap(2)?; // [ptr, ptr, size]
        self.op(Opcode::Add, &["size", "ptr"], Some("value"))?; // [ptr, end]
        self.push_usize(FREE_PTR, "offset");
        self.op(Opcode::Mstore, &["offset", "value"], None)?; // [ptr]
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_op_track_shape() {
        let mut em = Emitter::new();
        em.push_word(U256::from(1), "value");
        em.push_word(U256::from(2), "value");
        em.op(Opcode::Add, &["value", "value"], Some("value"))
            .unwrap();
        assert_eq!(em.depth(), 1);
        assert_eq!(em.instructions.len(), 3);
        assert_eq!(em.offset(), 2 + 2 + 1);
    }

    #[test]
    fn brand_mismatch_rejected() {
        let mut em = Emitter::new();
        em.push_word(U256::from(1), "value");
        em.push_word(U256::from(2), "size");
        let err = em
            .op(Opcode::Mstore, &["offset", "value"], None)
            .unwrap_err();
        assert!(matches!(err, CodegenError::StackShape(_)));
    }

    #[test]
    fn underflow_rejected() {
        let mut em = Emitter::new();
        let err = em.op(Opcode::Add, &["value", "value"], None).unwrap_err();
        assert!(matches!(err, CodegenError::StackShape(_)));
    }

    #[test]
    fn dup_copies_tag() {
        let mut em = Emitter::new();
        em.push_word(U256::from(7), "value");
        em.tag_top(ValueId::Temp(crate::ir::TempId(3))).unwrap();
        em.dup(1).unwrap();
        assert_eq!(em.depth(), 2);
        assert_eq!(em.find(&ValueId::Temp(crate::ir::TempId(3))), Some(0));
    }

    #[test]
    fn swap_moves_items() {
        let mut em = Emitter::new();
        em.push_word(U256::from(1), "a");
        em.push_word(U256::from(2), "b");
        em.swap(1).unwrap();
        // a is now on top.
        em.rebrand_top("a2").unwrap();
        assert!(em.op(Opcode::Pop, &["a2"], None).is_ok());
    }

    #[test]
    fn swap_depth_validated() {
        let mut em = Emitter::new();
        em.push_word(U256::from(1), "value");
        assert!(em.swap(1).is_err());
        assert!(em.swap(17).is_err());
    }

    #[test]
    fn allocator_immediate_sequence() {
        let mut em = Emitter::new();
        em.allocate_immediate(64).unwrap();
        assert_eq!(em.depth(), 1);
        let mnemonics: Vec<String> = em
            .instructions
            .iter()
            .map(|i| i.opcode.mnemonic().to_string())
            .collect();
        assert_eq!(
            mnemonics,
            vec!["PUSH1", "MLOAD", "DUP1", "PUSH1", "ADD", "PUSH1", "MSTORE"]
        );
    }

    #[test]
    fn allocator_from_stack_leaves_pointer() {
        let mut em = Emitter::new();
        em.push_word(U256::from(96), "size");
        em.allocate_from_stack().unwrap();
        assert_eq!(em.depth(), 1);
    }

    #[test]
    fn byte_offset_counts_immediates() {
        let mut em = Emitter::new();
        em.push_word(U256::from(0x1234), "value"); // PUSH2: 3 bytes
        em.push2_placeholder("dest"); // PUSH2: 3 bytes
        em.raw(Opcode::Jumpdest); // 1 byte
        assert_eq!(em.offset(), 7);
    }
}
