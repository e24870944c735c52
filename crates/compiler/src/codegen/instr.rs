//! Per-instruction lowering
//!
//! Implements the transition from one IR instruction to a VM instruction
//! sequence over the typed stack model. Operand fetching understands three
//! homes for a value: an inline constant (PUSH), a memory allocation
//! (MLOAD, masked when packed), or a tagged slot on the symbolic stack.
//!
//! Stack-resident operands must sit in the top region in operand order;
//! the memory planner guarantees this by spilling anything misplaced, so a
//! violation here is a compiler bug and fails hard.

use crate::codegen::error::CodegenError;
use crate::codegen::memory::Allocation;
use crate::codegen::stack::Brand;
use crate::codegen::FunctionEmitter;
use crate::diagnostics::{codes, Diagnostic};
use crate::ir::{
    EnvOp, Instruction, IrBinOp, IrUnOp, LengthOf, Literal, SliceSource, TempId, Value, ValueId,
};
use crate::types::Type;
use alloy_primitives::U256;
use ember_evm::Opcode;

impl FunctionEmitter<'_> {
    pub(super) fn lower_instruction(&mut self, instr: &Instruction) -> Result<(), CodegenError> {
        match instr {
            Instruction::Const { dest, value, ty } => match value {
                Literal::Word(w) => {
                    self.em.push_word(*w, "value");
                    self.store_dest(*dest)
                }
                Literal::Bytes(bytes) => self.lower_const_bytes(*dest, bytes, ty),
            },
            Instruction::Binary {
                dest, op, lhs, rhs, ..
            } => {
                self.materialize(&[(lhs, "value"), (rhs, "value")])?;
                self.lower_binop(*op)?;
                self.store_dest(*dest)
            }
            Instruction::Unary {
                dest, op, operand, ..
            } => {
                self.materialize(&[(operand, "value")])?;
                match op {
                    IrUnOp::IsZero => self.em.op(Opcode::Iszero, &["value"], Some("value"))?,
                    IrUnOp::Not => self.em.op(Opcode::Not, &["value"], Some("value"))?,
                    IrUnOp::Neg => {
                        // 0 - x
                        self.em.push_word(U256::ZERO, "value");
                        self.em.op(Opcode::Sub, &["value", "value"], Some("value"))?;
                    }
                }
                self.store_dest(*dest)
            }
            Instruction::LoadStorage { dest, slot, .. } => {
                self.materialize(&[(slot, "slot")])?;
                self.em.op(Opcode::Sload, &["slot"], Some("value"))?;
                self.store_dest(*dest)
            }
            Instruction::StoreStorage { slot, value } => {
                self.materialize(&[(slot, "slot"), (value, "value")])?;
                self.em.swap(1)?; // slot to the top
                self.em.op(Opcode::Sstore, &["slot", "value"], None)
            }
            Instruction::LoadMapping {
                dest, slot, key, ..
            } => {
                self.materialize(&[(key, "key")])?;
                self.hash_key_with_slot(slot)?;
                self.em.op(Opcode::Sload, &["slot"], Some("value"))?;
                self.store_dest(*dest)
            }
            Instruction::StoreMapping { slot, key, value } => {
                self.materialize(&[(key, "key"), (value, "value")])?;
                self.em.swap(1)?; // [value, key]
                self.hash_key_with_slot(slot)?; // [value, slot]
                self.em.op(Opcode::Sstore, &["slot", "value"], None)
            }
            Instruction::LoadLocal { dest, local, .. } => {
                let alloc = self.local_allocation(local)?;
                self.load_allocation(alloc, "value")?;
                self.store_dest(*dest)
            }
            Instruction::StoreLocal { local, value } => self.lower_store_local(local, value),
            Instruction::LoadField {
                dest,
                base,
                field_index,
                ..
            } => {
                self.materialize(&[(base, "slot")])?;
                self.em.push_usize(*field_index, "value");
                self.em.op(Opcode::Add, &["value", "slot"], Some("slot"))?;
                self.em.op(Opcode::Sload, &["slot"], Some("value"))?;
                self.store_dest(*dest)
            }
            Instruction::StoreField {
                base,
                field_index,
                value,
            } => {
                self.materialize(&[(value, "value")])?;
                self.materialize(&[(base, "slot")])?;
                self.em.push_usize(*field_index, "value");
                self.em.op(Opcode::Add, &["value", "slot"], Some("slot"))?;
                self.em.op(Opcode::Sstore, &["slot", "value"], None)
            }
            Instruction::LoadIndex {
                dest, base, index, ..
            } => {
                self.materialize(&[(index, "key")])?;
                self.hash_slot(base)?; // [index, hash]
                self.em.op(Opcode::Add, &["slot", "key"], Some("slot"))?;
                self.em.op(Opcode::Sload, &["slot"], Some("value"))?;
                self.store_dest(*dest)
            }
            Instruction::StoreIndex { base, index, value } => {
                self.materialize(&[(index, "key"), (value, "value")])?;
                self.em.swap(1)?; // [value, index]
                self.hash_slot(base)?; // [value, index, hash]
                self.em.op(Opcode::Add, &["slot", "key"], Some("slot"))?;
                self.em.op(Opcode::Sstore, &["slot", "value"], None)
            }
            Instruction::ComputeSlot { dest, base, key } => {
                self.materialize(&[(base, "slot"), (key, "key")])?;
                // key ‖ base slot into scratch, hash 64 bytes
                self.em.push_usize(0, "offset");
                self.em.op(Opcode::Mstore, &["offset", "key"], None)?; // [base]
                self.em.push_usize(0x20, "offset");
                self.em.op(Opcode::Mstore, &["offset", "slot"], None)?;
                self.em.push_usize(0x40, "size");
                self.em.push_usize(0, "offset");
                self.em
                    .op(Opcode::Keccak256, &["offset", "size"], Some("slot"))?;
                self.store_dest(*dest)
            }
            Instruction::ComputeArraySlot { dest, base } => {
                self.hash_slot(base)?;
                self.store_dest(*dest)
            }
            Instruction::ComputeFieldOffset {
                dest,
                base,
                field_index,
            } => {
                self.materialize(&[(base, "slot")])?;
                self.em.push_usize(*field_index, "value");
                self.em.op(Opcode::Add, &["value", "slot"], Some("slot"))?;
                self.store_dest(*dest)
            }
            Instruction::Env { dest, op, .. } => {
                match op {
                    EnvOp::Caller => self.em.op(Opcode::Caller, &[], Some("value"))?,
                    EnvOp::CallValue => self.em.op(Opcode::Callvalue, &[], Some("value"))?,
                    // msg.data is identified by this explicit op; its value
                    // is the calldata base offset.
                    EnvOp::CalldataOffset => self.em.push_word(U256::ZERO, "value"),
                    EnvOp::CalldataSize => {
                        self.em.op(Opcode::Calldatasize, &[], Some("value"))?
                    }
                    EnvOp::BlockNumber => self.em.op(Opcode::Number, &[], Some("value"))?,
                    EnvOp::BlockTimestamp => {
                        self.em.op(Opcode::Timestamp, &[], Some("value"))?
                    }
                }
                self.store_dest(*dest)
            }
            Instruction::Hash { dest, value } => {
                self.materialize(&[(value, "value")])?;
                self.em.push_usize(0, "offset");
                self.em.op(Opcode::Mstore, &["offset", "value"], None)?;
                self.em.push_usize(0x20, "size");
                self.em.push_usize(0, "offset");
                self.em
                    .op(Opcode::Keccak256, &["offset", "size"], Some("value"))?;
                self.store_dest(*dest)
            }
            Instruction::Cast { dest, value, .. } => {
                // No bytecode: the stack item is re-tagged only.
                self.materialize(&[(value, "value")])?;
                self.store_dest(*dest)
            }
            Instruction::Slice {
                dest,
                base,
                start,
                end,
                source,
                ..
            } => self.lower_slice(*dest, base, start, end, *source),
            Instruction::Length { dest, value, of } => self.lower_length(*dest, value, of),
            Instruction::Call {
                dest, callee, args, ..
            } => self.lower_call(*dest, callee, args),
        }
    }

    fn lower_binop(&mut self, op: IrBinOp) -> Result<(), CodegenError> {
        use IrBinOp::*;
        // Stack is [lhs, rhs] with rhs on top. Commutative ops and shifts
        // (whose shift amount is the top operand) consume directly; the
        // rest want lhs on top first.
        match op {
            Add => self.commutative(Opcode::Add),
            Mul => self.commutative(Opcode::Mul),
            And => self.commutative(Opcode::And),
            Or => self.commutative(Opcode::Or),
            Xor => self.commutative(Opcode::Xor),
            Eq => self.commutative(Opcode::Eq),
            Sub => self.oriented(Opcode::Sub),
            Div => self.oriented(Opcode::Div),
            SDiv => self.oriented(Opcode::Sdiv),
            Mod => self.oriented(Opcode::Mod),
            SMod => self.oriented(Opcode::Smod),
            Lt => self.oriented(Opcode::Lt),
            Gt => self.oriented(Opcode::Gt),
            SLt => self.oriented(Opcode::Slt),
            SGt => self.oriented(Opcode::Sgt),
            Shl => self.commutative(Opcode::Shl),
            Shr => self.commutative(Opcode::Shr),
            Sar => self.commutative(Opcode::Sar),
            Ne => {
                self.commutative(Opcode::Eq)?;
                self.em.op(Opcode::Iszero, &["value"], Some("value"))
            }
            Le => {
                self.oriented(Opcode::Gt)?;
                self.em.op(Opcode::Iszero, &["value"], Some("value"))
            }
            Ge => {
                self.oriented(Opcode::Lt)?;
                self.em.op(Opcode::Iszero, &["value"], Some("value"))
            }
            SLe => {
                self.oriented(Opcode::Sgt)?;
                self.em.op(Opcode::Iszero, &["value"], Some("value"))
            }
            SGe => {
                self.oriented(Opcode::Slt)?;
                self.em.op(Opcode::Iszero, &["value"], Some("value"))
            }
        }
    }

    fn commutative(&mut self, opcode: Opcode) -> Result<(), CodegenError> {
        self.em.op(opcode, &["value", "value"], Some("value"))
    }

    /// The machine computes `s[0] op s[1]`; bring lhs to the top first.
    fn oriented(&mut self, opcode: Opcode) -> Result<(), CodegenError> {
        self.em.swap(1)?;
        self.em.op(opcode, &["value", "value"], Some("value"))
    }

    /// `keccak256(key ‖ slot)` with the key already on top of the stack.
    /// Consumes the key, leaves the derived slot.
    fn hash_key_with_slot(&mut self, slot: &Value) -> Result<(), CodegenError> {
        self.em.push_usize(0, "offset");
        self.em.op(Opcode::Mstore, &["offset", "key"], None)?;
        self.fetch_simple(slot, "slot")?;
        self.em.push_usize(0x20, "offset");
        self.em.op(Opcode::Mstore, &["offset", "slot"], None)?;
        self.em.push_usize(0x40, "size");
        self.em.push_usize(0, "offset");
        self.em
            .op(Opcode::Keccak256, &["offset", "size"], Some("slot"))
    }

    /// `keccak256(slot)` over 32 bytes. Leaves the hash branded `slot`.
    fn hash_slot(&mut self, base: &Value) -> Result<(), CodegenError> {
        self.fetch_simple(base, "slot")?;
        self.em.push_usize(0, "offset");
        self.em.op(Opcode::Mstore, &["offset", "slot"], None)?;
        self.em.push_usize(0x20, "size");
        self.em.push_usize(0, "offset");
        self.em
            .op(Opcode::Keccak256, &["offset", "size"], Some("slot"))
    }

    fn lower_const_bytes(
        &mut self,
        dest: TempId,
        bytes: &[u8],
        _ty: &Type,
    ) -> Result<(), CodegenError> {
        // Length word plus data padded to whole words.
        let padded = bytes.len().div_ceil(32) * 32;
        self.em.allocate_immediate(32 + padded)?;
        // mem[ptr] = length
        self.em.dup(1)?;
        self.em.push_usize(bytes.len(), "value");
        self.em.swap(1)?;
        self.em.rebrand_top("offset")?;
        self.em.op(Opcode::Mstore, &["offset", "value"], None)?;
        // Data words, big-endian, zero-padded at the tail.
        for (i, chunk) in bytes.chunks(32).enumerate() {
            let mut word = [0u8; 32];
            word[..chunk.len()].copy_from_slice(chunk);
            self.em.push_word(U256::from_be_bytes(word), "value");
            self.em.dup(2)?; // the pointer
            self.em.push_usize(32 * (i + 1), "value");
            self.em.rebrand_top("ptr")?;
            self.em.op(Opcode::Add, &["ptr", "ptr"], Some("offset"))?;
            self.em.op(Opcode::Mstore, &["offset", "value"], None)?;
        }
        self.em.rebrand_top("value")?;
        self.store_dest(dest)
    }

    fn lower_store_local(&mut self, local: &str, value: &Value) -> Result<(), CodegenError> {
        let alloc = self.local_allocation(local)?;
        let local_ty = self.function.local(local).map(|l| l.ty.clone());
        let coerce = matches!(
            (value.ty(), &local_ty),
            (Type::Bytes { size: Some(_) }, Some(Type::Bytes { size: None }))
        );
        if coerce {
            // Promote a fixed-bytes word to a dynamic bytes object: a
            // fresh allocation holding length then data.
            let n = value.ty().byte_size();
            self.materialize(&[(value, "value")])?;
            self.em.allocate_immediate(64)?; // [val, ptr]
            self.em.dup(1)?;
            self.em.push_usize(n, "value");
            self.em.swap(1)?;
            self.em.rebrand_top("offset")?;
            self.em.op(Opcode::Mstore, &["offset", "value"], None)?; // [val, ptr]
            self.em.dup(2)?; // [val, ptr, val]
            self.em.dup(2)?; // [val, ptr, val, ptr]
            self.em.push_usize(32, "value");
            self.em.rebrand_top("ptr")?;
            self.em.op(Opcode::Add, &["ptr", "ptr"], Some("offset"))?;
            self.em.op(Opcode::Mstore, &["offset", "value"], None)?; // [val, ptr]
            self.em.swap(1)?;
            self.em.pop()?; // [ptr]
            self.em.rebrand_top("value")?;
        } else {
            self.materialize(&[(value, "value")])?;
        }
        self.store_allocation(alloc)
    }

    fn lower_slice(
        &mut self,
        dest: TempId,
        base: &Value,
        start: &Value,
        end: &Value,
        source: SliceSource,
    ) -> Result<(), CodegenError> {
        if source == SliceSource::Storage {
            // Not supported; keep the stack shape sound with a null
            // pointer result so downstream code still compiles.
            self.warnings.push(Diagnostic::warning(
                codes::SLICE_OF_STORAGE,
                "slicing storage values is not supported; result is a null pointer",
            ));
            // Operands may sit on the stack; consume them.
            for operand in [base, start, end] {
                self.consume_if_resident(operand)?;
            }
            self.em.push_word(U256::ZERO, "value");
            return self.store_dest(dest);
        }

        self.materialize(&[(base, "ptr"), (start, "value"), (end, "value")])?;
        // [base, start, end] → length = end - start
        self.em.dup(2)?; // [base, start, end, start]
        self.em.swap(1)?; // [base, start, start, end]
        self.em.op(Opcode::Sub, &["value", "value"], Some("size"))?; // [base, start, len]
        self.em.dup(1)?;
        self.em.push_usize(32, "value");
        self.em.rebrand_top("size")?;
        self.em.op(Opcode::Add, &["size", "size"], Some("size"))?; // [base, start, len, len+32]
        self.em.allocate_from_stack()?; // [base, start, len, ptr]
        // mem[ptr] = len
        self.em.dup(2)?; // [.., len, ptr, len]
        self.em.dup(2)?; // [.., len, ptr, len, ptr]
        self.em.rebrand_top("offset")?;
        self.em.rebrand_at(1, "value")?;
        self.em.op(Opcode::Mstore, &["offset", "value"], None)?; // [base, start, len, ptr]
        // dst = ptr + 32
        self.em.dup(1)?;
        self.em.push_usize(32, "value");
        self.em.rebrand_top("ptr")?;
        self.em.op(Opcode::Add, &["ptr", "ptr"], Some("dst"))?; // [.., ptr, dst]
        // src = base + start (+32 header for memory objects)
        self.em.dup(5)?; // base
        self.em.dup(5)?; // start
        self.em.rebrand_top("ptr")?;
        self.em.rebrand_at(1, "ptr")?;
        self.em.op(Opcode::Add, &["ptr", "ptr"], Some("src"))?;
        if source == SliceSource::Memory {
            self.em.push_usize(32, "value");
            self.em.rebrand_top("src")?;
            self.em.op(Opcode::Add, &["src", "src"], Some("src"))?;
        }
        // [base, start, len, ptr, dst, src]
        self.em.dup(4)?; // len
        self.em.rebrand_top("size")?;
        self.em.swap(2)?; // [.., len→? size, src, dst]
        let copy = match source {
            SliceSource::Memory => Opcode::Mcopy,
            SliceSource::Calldata => Opcode::Calldatacopy,
            SliceSource::Storage => unreachable!("handled above"),
        };
        self.em.op(copy, &["dst", "src", "size"], None)?; // [base, start, len, ptr]
        // Keep the pointer, drop the rest.
        self.em.swap(3)?; // [ptr, start, len, base]
        self.em.pop()?;
        self.em.pop()?;
        self.em.pop()?; // [ptr]
        self.em.rebrand_top("value")?;
        self.store_dest(dest)
    }

    fn lower_length(
        &mut self,
        dest: TempId,
        value: &Value,
        of: &LengthOf,
    ) -> Result<(), CodegenError> {
        match of {
            LengthOf::Fixed(n) => {
                self.consume_if_resident(value)?;
                self.em.push_usize(*n, "value");
            }
            LengthOf::StorageBytes => {
                // Long-string encoding only: length = (word - 1) >> 1.
                // Strings of 31 bytes or fewer use the packed short form
                // and decode incorrectly here.
                self.warnings.push(Diagnostic::warning(
                    codes::SHORT_STRING_LENGTH,
                    "storage length assumes the long encoding; values of 31 bytes or fewer decode incorrectly",
                ));
                self.materialize(&[(value, "slot")])?;
                self.em.op(Opcode::Sload, &["slot"], Some("value"))?;
                self.em.push_word(U256::from(1), "value");
                self.em.swap(1)?;
                self.em.op(Opcode::Sub, &["value", "value"], Some("value"))?;
                self.em.push_word(U256::from(1), "shift");
                self.em.op(Opcode::Shr, &["shift", "value"], Some("value"))?;
            }
            LengthOf::MemoryBytes => {
                self.materialize(&[(value, "offset")])?;
                self.em.op(Opcode::Mload, &["offset"], Some("value"))?;
            }
            LengthOf::Calldata => {
                self.consume_if_resident(value)?;
                self.em.op(Opcode::Calldatasize, &[], Some("value"))?;
            }
        }
        self.store_dest(dest)
    }

    fn lower_call(
        &mut self,
        dest: Option<TempId>,
        callee: &str,
        args: &[Value],
    ) -> Result<(), CodegenError> {
        match callee {
            "addmod" | "mulmod" if args.len() == 3 => {
                self.materialize(&[
                    (&args[0], "value"),
                    (&args[1], "value"),
                    (&args[2], "value"),
                ])?;
                // [a, b, n] → machine wants a on top.
                self.em.swap(2)?;
                let opcode = if callee == "addmod" {
                    Opcode::Addmod
                } else {
                    Opcode::Mulmod
                };
                self.em
                    .op(opcode, &["value", "value", "value"], Some("value"))?;
                if let Some(dest) = dest {
                    self.store_dest(dest)?;
                } else {
                    self.em.pop()?;
                }
                Ok(())
            }
            other => {
                // Unknown instruction kinds degrade to a warning; the
                // value is materialized as zero to keep the stack sound.
                self.warnings.push(Diagnostic::warning(
                    codes::UNKNOWN_CALL,
                    format!("call to unknown builtin `{}` compiles to zero", other),
                ));
                for arg in args {
                    self.consume_if_resident(arg)?;
                }
                if let Some(dest) = dest {
                    self.em.push_word(U256::ZERO, "value");
                    self.store_dest(dest)?;
                }
                Ok(())
            }
        }
    }

    // --------------------------------------------------------------
    // Operand plumbing
    // --------------------------------------------------------------

    /// Bring `operands` onto the stack in order (last ends on top), with
    /// the given brands. Stack-resident operands must already occupy the
    /// top region in operand order; constants and memory-resident values
    /// are pushed and woven into place.
    pub(super) fn materialize(
        &mut self,
        operands: &[(&Value, Brand)],
    ) -> Result<(), CodegenError> {
        let resident: Vec<(usize, ValueId)> = operands
            .iter()
            .enumerate()
            .filter_map(|(i, (v, _))| {
                v.id()
                    .filter(|id| !self.layout.is_spilled(id) && self.em.find(id).is_some())
                    .map(|id| (i, id))
            })
            .collect();

        // Verify the resident operands sit in the top region in order:
        // the j-th resident (left to right) at depth (count-1-j).
        let count = resident.len();
        for (j, (_, id)) in resident.iter().enumerate() {
            let expected = count - 1 - j;
            let actual = self.em.find(id).expect("resident located above");
            if actual != expected {
                return Err(CodegenError::StackShape(format!(
                    "operand {} expected at depth {}, found at {}",
                    id, expected, actual
                )));
            }
        }
        for (_, id) in &resident {
            if let Some(depth) = self.em.find(id) {
                self.em.untag(depth);
            }
        }

        // Weave non-resident operands in, bubbling each below the
        // residents that follow it.
        for (i, (value, _)) in operands.iter().enumerate() {
            let is_resident = resident.iter().any(|(ri, _)| *ri == i);
            if is_resident {
                continue;
            }
            self.push_value(value)?;
            let trailing = resident.iter().filter(|(ri, _)| *ri > i).count();
            for s in (1..=trailing).rev() {
                self.em.swap(s)?;
            }
        }

        // Brand every operand position: operand i at depth (k-1-i).
        let k = operands.len();
        for (i, (_, brand)) in operands.iter().enumerate() {
            self.em.rebrand_at(k - 1 - i, brand)?;
        }
        Ok(())
    }

    /// Fetch a value that is guaranteed not to be stack-resident (constant
    /// slot numbers, chained-slot temps already consumed into memory).
    fn fetch_simple(&mut self, value: &Value, brand: Brand) -> Result<(), CodegenError> {
        if let Some(id) = value.id() {
            if !self.layout.is_spilled(&id) && self.em.find(&id).is_some() {
                return Err(CodegenError::StackShape(format!(
                    "{} unexpectedly stack-resident",
                    id
                )));
            }
        }
        self.push_value(value)?;
        self.em.rebrand_top(brand)
    }

    /// Push a constant or load an allocated value to the top.
    fn push_value(&mut self, value: &Value) -> Result<(), CodegenError> {
        match value {
            Value::Const {
                value: Literal::Word(w),
                ..
            } => {
                self.em.push_word(*w, "value");
                Ok(())
            }
            Value::Const {
                value: Literal::Bytes(_),
                ..
            } => Err(CodegenError::StackShape(
                "byte constant used as a direct operand".into(),
            )),
            Value::Temp { .. } | Value::Local { .. } => {
                let id = value.id().expect("non-constant carries an id");
                match self.layout.allocation(&id) {
                    Some(alloc) => self.load_allocation(alloc, "value"),
                    None => Err(CodegenError::UnallocatedValue(format!("{}", id))),
                }
            }
        }
    }

    /// If `value` is tagged on the stack (and not memory-backed), pop it.
    /// Used by lowerings that discard operands (unknown calls, fixed
    /// lengths).
    fn consume_if_resident(&mut self, value: &Value) -> Result<(), CodegenError> {
        if let Some(id) = value.id() {
            if !self.layout.is_spilled(&id) {
                if let Some(depth) = self.em.find(&id) {
                    if depth == 0 {
                        return self.em.pop();
                    }
                    self.em.swap(depth)?;
                    return self.em.pop();
                }
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------
    // Memory access
    // --------------------------------------------------------------

    pub(super) fn local_allocation(&self, local: &str) -> Result<Allocation, CodegenError> {
        self.layout
            .allocation(&ValueId::Local(local.to_string()))
            .ok_or_else(|| CodegenError::UnallocatedValue(format!("%{}", local)))
    }

    /// Load an allocated value to the top of the stack. Whole-word
    /// allocations are a plain MLOAD; packed sub-word values are shifted
    /// and masked out of their shared slot.
    pub(super) fn load_allocation(
        &mut self,
        alloc: Allocation,
        brand: Brand,
    ) -> Result<(), CodegenError> {
        if alloc.size >= 32 {
            self.em.push_usize(alloc.offset, "offset");
            self.em.op(Opcode::Mload, &["offset"], Some(brand))?;
            return Ok(());
        }
        let slot_base = alloc.offset & !31;
        let shift_bits = (32 - (alloc.offset - slot_base) - alloc.size) * 8;
        let mask = (U256::from(1) << (alloc.size * 8)) - U256::from(1);
        self.em.push_usize(slot_base, "offset");
        self.em.op(Opcode::Mload, &["offset"], Some("value"))?;
        self.em.push_usize(shift_bits, "shift");
        self.em.op(Opcode::Shr, &["shift", "value"], Some("value"))?;
        self.em.push_word(mask, "mask");
        self.em.op(Opcode::And, &["mask", "value"], Some(brand))?;
        Ok(())
    }

    /// Store the value on top of the stack into `alloc`.
    pub(super) fn store_allocation(&mut self, alloc: Allocation) -> Result<(), CodegenError> {
        self.em.rebrand_top("value")?;
        if alloc.size >= 32 {
            self.em.push_usize(alloc.offset, "offset");
            return self.em.op(Opcode::Mstore, &["offset", "value"], None);
        }
        // Masked read-modify-write so slot neighbors survive.
        let slot_base = alloc.offset & !31;
        let shift_bits = (32 - (alloc.offset - slot_base) - alloc.size) * 8;
        let mask = (U256::from(1) << (alloc.size * 8)) - U256::from(1);
        let hole = !(mask << shift_bits);
        self.em.push_word(mask, "mask");
        self.em.op(Opcode::And, &["mask", "value"], Some("value"))?;
        self.em.push_usize(shift_bits, "shift");
        self.em.op(Opcode::Shl, &["shift", "value"], Some("value"))?;
        self.em.push_usize(slot_base, "offset");
        self.em.op(Opcode::Mload, &["offset"], Some("word"))?;
        self.em.push_word(hole, "mask");
        self.em.op(Opcode::And, &["mask", "word"], Some("word"))?;
        self.em.op(Opcode::Or, &["word", "value"], Some("value"))?;
        self.em.push_usize(slot_base, "offset");
        self.em.op(Opcode::Mstore, &["offset", "value"], None)
    }

    /// Route a freshly computed result: spill to memory when allocated,
    /// drop when unused, otherwise keep it tagged on the stack.
    pub(super) fn store_dest(&mut self, dest: TempId) -> Result<(), CodegenError> {
        let id = ValueId::Temp(dest);
        if let Some(alloc) = self.layout.allocation(&id) {
            return self.store_allocation(alloc);
        }
        if self.use_counts.get(&dest).copied().unwrap_or(0) == 0 {
            return self.em.pop();
        }
        self.em.rebrand_top("value")?;
        self.em.tag_top(id)
    }
}
