//! The Ember intermediate representation
//!
//! A module of functions of basic blocks in SSA form. Ownership is strictly
//! hierarchical: a module owns its functions, a function owns its blocks and
//! locals, and control-flow edges are block *ids* resolved by lookup, never
//! pointers, so cyclic CFGs (loops) need no reference counting.
//!
//! The builder produces near-SSA (each temp assigned once, locals accessed
//! through `load_local`/`store_local`); the SSA pass promotes word-typed
//! locals to temps and inserts phis at join points.

pub mod builder;
pub mod hash;
pub mod liveness;
pub mod ssa;
pub mod stats;
pub mod validate;

use crate::diagnostics::SourceLocation;
use crate::types::Type;
use alloy_primitives::U256;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Identifier of a basic block, unique within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Identifier of an SSA temporary, unique within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TempId(pub u32);

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A value name as used by liveness and memory planning: either an SSA temp
/// or a named local that kept its memory identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ValueId {
    Temp(TempId),
    Local(String),
}

impl std::fmt::Display for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueId::Temp(t) => write!(f, "{}", t),
            ValueId::Local(name) => write!(f, "%{}", name),
        }
    }
}

/// A literal constant: a 256-bit word or raw byte data (dynamic bytes and
/// string literals).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Literal {
    Word(U256),
    Bytes(Vec<u8>),
}

impl Literal {
    pub fn word(&self) -> Option<U256> {
        match self {
            Literal::Word(w) => Some(*w),
            Literal::Bytes(_) => None,
        }
    }
}

/// An operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Value {
    Const { value: Literal, ty: Type },
    Temp { id: TempId, ty: Type },
    Local { name: String, ty: Type },
}

impl Value {
    pub fn word(value: U256, ty: Type) -> Value {
        Value::Const {
            value: Literal::Word(value),
            ty,
        }
    }

    pub fn ty(&self) -> &Type {
        match self {
            Value::Const { ty, .. } | Value::Temp { ty, .. } | Value::Local { ty, .. } => ty,
        }
    }

    /// The id liveness tracks, if this is not a constant.
    pub fn id(&self) -> Option<ValueId> {
        match self {
            Value::Const { .. } => None,
            Value::Temp { id, .. } => Some(ValueId::Temp(*id)),
            Value::Local { name, .. } => Some(ValueId::Local(name.clone())),
        }
    }

    pub fn as_const_word(&self) -> Option<U256> {
        match self {
            Value::Const { value, .. } => value.word(),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Const {
                value: Literal::Word(w),
                ..
            } => write!(f, "{}", w),
            Value::Const {
                value: Literal::Bytes(b),
                ..
            } => write!(f, "0x{}", hex::encode(b)),
            Value::Temp { id, .. } => write!(f, "{}", id),
            Value::Local { name, .. } => write!(f, "%{}", name),
        }
    }
}

/// Binary operators at the IR level. Comparison operators yield 0/1 words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IrBinOp {
    Add,
    Sub,
    Mul,
    Div,
    SDiv,
    Mod,
    SMod,
    Lt,
    Gt,
    SLt,
    SGt,
    Le,
    Ge,
    SLe,
    SGe,
    Eq,
    Ne,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IrUnOp {
    /// Logical not: 1 → 0, nonzero → 0, 0 → 1.
    IsZero,
    /// Bitwise complement.
    Not,
    /// Two's-complement negation.
    Neg,
}

/// Environment queries. Calldata identity is explicit here; downstream
/// passes never guess from value names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvOp {
    Caller,
    CallValue,
    /// Base offset of calldata (always 0); marks `msg.data` itself.
    CalldataOffset,
    CalldataSize,
    BlockNumber,
    BlockTimestamp,
}

/// Where sliced data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceSource {
    Memory,
    Calldata,
    Storage,
}

/// How `length` resolves its operand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthOf {
    /// Compile-time-known size of fixed arrays and `bytesN`.
    Fixed(usize),
    /// Dynamic value in storage: SLOAD the slot, decode the length word.
    StorageBytes,
    /// Dynamic value in memory: MLOAD the length header at the pointer.
    MemoryBytes,
    /// `msg.data`: CALLDATASIZE.
    Calldata,
}

/// One IR instruction. Terminators are not instructions; a block carries
/// exactly one terminator separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    Const {
        dest: TempId,
        value: Literal,
        ty: Type,
    },
    Binary {
        dest: TempId,
        op: IrBinOp,
        lhs: Value,
        rhs: Value,
        ty: Type,
    },
    Unary {
        dest: TempId,
        op: IrUnOp,
        operand: Value,
        ty: Type,
    },
    /// SLOAD from a slot value.
    LoadStorage {
        dest: TempId,
        slot: Value,
        ty: Type,
    },
    /// SSTORE to a slot value.
    StoreStorage { slot: Value, value: Value },
    /// Single-level mapping read: computes `keccak(key ‖ slot)` and loads.
    LoadMapping {
        dest: TempId,
        slot: Value,
        key: Value,
        ty: Type,
    },
    StoreMapping {
        slot: Value,
        key: Value,
        value: Value,
    },
    LoadLocal {
        dest: TempId,
        local: String,
        ty: Type,
    },
    StoreLocal { local: String, value: Value },
    /// Single-level struct field read at `base + offset` slots.
    LoadField {
        dest: TempId,
        base: Value,
        field_index: usize,
        ty: Type,
    },
    StoreField {
        base: Value,
        field_index: usize,
        value: Value,
    },
    /// Single-level array element read at `keccak(slot) + index`.
    LoadIndex {
        dest: TempId,
        base: Value,
        index: Value,
        ty: Type,
    },
    StoreIndex {
        base: Value,
        index: Value,
        value: Value,
    },
    /// Mapping step of a collapsed access chain: `keccak(key ‖ base)`.
    ComputeSlot {
        dest: TempId,
        base: Value,
        key: Value,
    },
    /// Array step of a collapsed access chain: `keccak(base)`.
    ComputeArraySlot { dest: TempId, base: Value },
    /// Struct step of a collapsed access chain: `base + field_index`.
    ComputeFieldOffset {
        dest: TempId,
        base: Value,
        field_index: usize,
    },
    Env {
        dest: TempId,
        op: EnvOp,
        ty: Type,
    },
    /// keccak256 of one 32-byte word.
    Hash { dest: TempId, value: Value },
    /// Type cast; no bytecode is emitted, the stack item is rebranded.
    Cast {
        dest: TempId,
        value: Value,
        ty: Type,
    },
    Slice {
        dest: TempId,
        base: Value,
        start: Value,
        end: Value,
        source: SliceSource,
        ty: Type,
    },
    Length {
        dest: TempId,
        value: Value,
        of: LengthOf,
    },
    /// Builtin call (`addmod`, `mulmod`); the callee set is open so unknown
    /// names surface as soft code-generation warnings, not build failures.
    Call {
        dest: Option<TempId>,
        callee: String,
        args: Vec<Value>,
        ty: Type,
    },
}

impl Instruction {
    /// The destination temp, if the instruction defines one.
    pub fn dest(&self) -> Option<TempId> {
        use Instruction::*;
        match self {
            Const { dest, .. }
            | Binary { dest, .. }
            | Unary { dest, .. }
            | LoadStorage { dest, .. }
            | LoadMapping { dest, .. }
            | LoadLocal { dest, .. }
            | LoadField { dest, .. }
            | LoadIndex { dest, .. }
            | ComputeSlot { dest, .. }
            | ComputeArraySlot { dest, .. }
            | ComputeFieldOffset { dest, .. }
            | Env { dest, .. }
            | Hash { dest, .. }
            | Cast { dest, .. }
            | Slice { dest, .. }
            | Length { dest, .. } => Some(*dest),
            Call { dest, .. } => *dest,
            StoreStorage { .. }
            | StoreMapping { .. }
            | StoreLocal { .. }
            | StoreField { .. }
            | StoreIndex { .. } => None,
        }
    }

    /// The id a `store_local` defines, for liveness purposes.
    pub fn defined_local(&self) -> Option<&str> {
        match self {
            Instruction::StoreLocal { local, .. } => Some(local),
            _ => None,
        }
    }

    /// All operand values, in evaluation order.
    pub fn operands(&self) -> Vec<&Value> {
        use Instruction::*;
        match self {
            Const { .. } | Env { .. } => vec![],
            Unary { operand, .. } => vec![operand],
            Binary { lhs, rhs, .. } => vec![lhs, rhs],
            LoadStorage { slot, .. } => vec![slot],
            StoreStorage { slot, value } => vec![slot, value],
            LoadMapping { slot, key, .. } => vec![slot, key],
            StoreMapping { slot, key, value } => vec![slot, key, value],
            LoadLocal { .. } => vec![],
            StoreLocal { value, .. } => vec![value],
            LoadField { base, .. } => vec![base],
            StoreField { base, value, .. } => vec![base, value],
            LoadIndex { base, index, .. } => vec![base, index],
            StoreIndex { base, index, value } => vec![base, index, value],
            ComputeSlot { base, key, .. } => vec![base, key],
            ComputeArraySlot { base, .. } => vec![base],
            ComputeFieldOffset { base, .. } => vec![base],
            Hash { value, .. } => vec![value],
            Cast { value, .. } => vec![value],
            Slice {
                base, start, end, ..
            } => vec![base, start, end],
            Length { value, .. } => vec![value],
            Call { args, .. } => args.iter().collect(),
        }
    }

    /// Mutable operand access for renaming passes.
    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        use Instruction::*;
        match self {
            Const { .. } | Env { .. } => vec![],
            Unary { operand, .. } => vec![operand],
            Binary { lhs, rhs, .. } => vec![lhs, rhs],
            LoadStorage { slot, .. } => vec![slot],
            StoreStorage { slot, value } => vec![slot, value],
            LoadMapping { slot, key, .. } => vec![slot, key],
            StoreMapping { slot, key, value } => vec![slot, key, value],
            LoadLocal { .. } => vec![],
            StoreLocal { value, .. } => vec![value],
            LoadField { base, .. } => vec![base],
            StoreField { base, value, .. } => vec![base, value],
            LoadIndex { base, index, .. } => vec![base, index],
            StoreIndex { base, index, value } => vec![base, index, value],
            ComputeSlot { base, key, .. } => vec![base, key],
            ComputeArraySlot { base, .. } => vec![base],
            ComputeFieldOffset { base, .. } => vec![base],
            Hash { value, .. } => vec![value],
            Cast { value, .. } => vec![value],
            Slice {
                base, start, end, ..
            } => vec![base, start, end],
            Length { value, .. } => vec![value],
            Call { args, .. } => args.iter_mut().collect(),
        }
    }

    /// True when the instruction has no observable effect beyond its
    /// destination: safe to remove when the destination is dead, and safe
    /// to deduplicate.
    pub fn is_pure(&self) -> bool {
        use Instruction::*;
        match self {
            Const { .. }
            | Binary { .. }
            | Unary { .. }
            | ComputeSlot { .. }
            | ComputeArraySlot { .. }
            | ComputeFieldOffset { .. }
            | Cast { .. }
            | Hash { .. }
            | Length { .. }
            | Env { .. } => true,
            // Loads observe mutable state; removing them when dead is fine,
            // but CSE across stores is not. Kept impure for simplicity.
            LoadStorage { .. } | LoadMapping { .. } | LoadLocal { .. } | LoadField { .. }
            | LoadIndex { .. } => false,
            StoreStorage { .. } | StoreMapping { .. } | StoreLocal { .. } | StoreField { .. }
            | StoreIndex { .. } => false,
            // Allocates memory.
            Slice { .. } => false,
            Call { .. } => false,
        }
    }

    /// True when the instruction can be removed if its destination is
    /// unused: pure instructions plus loads (reads have no side effects).
    pub fn removable_when_dead(&self) -> bool {
        use Instruction::*;
        self.is_pure()
            || matches!(
                self,
                LoadStorage { .. }
                    | LoadMapping { .. }
                    | LoadLocal { .. }
                    | LoadField { .. }
                    | LoadIndex { .. }
            )
    }

    /// The declared result type, when there is a destination.
    pub fn result_type(&self) -> Option<Type> {
        use Instruction::*;
        match self {
            Const { ty, .. }
            | Binary { ty, .. }
            | Unary { ty, .. }
            | LoadStorage { ty, .. }
            | LoadMapping { ty, .. }
            | LoadLocal { ty, .. }
            | LoadField { ty, .. }
            | LoadIndex { ty, .. }
            | Env { ty, .. }
            | Cast { ty, .. }
            | Slice { ty, .. } => Some(ty.clone()),
            ComputeSlot { .. } | ComputeArraySlot { .. } | ComputeFieldOffset { .. } => {
                Some(Type::uint256())
            }
            Hash { .. } => Some(Type::Bytes { size: Some(32) }),
            Length { .. } => Some(Type::uint256()),
            Call { dest, ty, .. } => dest.map(|_| ty.clone()),
            StoreStorage { .. }
            | StoreMapping { .. }
            | StoreLocal { .. }
            | StoreField { .. }
            | StoreIndex { .. } => None,
        }
    }
}

/// Block terminators: the only way control leaves a block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Terminator {
    Jump { target: BlockId },
    Branch {
        condition: Value,
        true_target: BlockId,
        false_target: BlockId,
    },
    Return { value: Option<Value> },
}

impl Terminator {
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump { target } => vec![*target],
            Terminator::Branch {
                true_target,
                false_target,
                ..
            } => vec![*true_target, *false_target],
            Terminator::Return { .. } => vec![],
        }
    }

    pub fn targets_mut(&mut self) -> Vec<&mut BlockId> {
        match self {
            Terminator::Jump { target } => vec![target],
            Terminator::Branch {
                true_target,
                false_target,
                ..
            } => vec![true_target, false_target],
            Terminator::Return { .. } => vec![],
        }
    }

    /// Operand values read by the terminator.
    pub fn operands(&self) -> Vec<&Value> {
        match self {
            Terminator::Branch { condition, .. } => vec![condition],
            Terminator::Return { value: Some(v) } => vec![v],
            _ => vec![],
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Terminator::Branch { condition, .. } => vec![condition],
            Terminator::Return { value: Some(v) } => vec![v],
            _ => vec![],
        }
    }
}

/// A phi node: selects a value by incoming edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Phi {
    pub dest: TempId,
    pub ty: Type,
    /// Predecessor block → value flowing in along that edge.
    pub sources: BTreeMap<BlockId, Value>,
}

/// A basic block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub id: BlockId,
    pub phis: Vec<Phi>,
    pub instructions: Vec<Instruction>,
    /// `None` only transiently inside the builder; a finished function has
    /// exactly one terminator per block.
    pub terminator: Option<Terminator>,
    pub predecessors: BTreeSet<BlockId>,
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Block {
            id,
            phis: Vec::new(),
            instructions: Vec::new(),
            terminator: None,
            predecessors: BTreeSet::new(),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator.is_some()
    }
}

/// A named local variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Local {
    pub id: u32,
    pub name: String,
    pub ty: Type,
    pub location: Option<SourceLocation>,
}

/// One declared storage slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageSlot {
    pub slot: usize,
    pub name: String,
    pub ty: Type,
}

/// A function: `main` (runtime entry) or `create` (constructor).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Function {
    pub name: String,
    /// Parameters first; `param_count` records how many.
    pub locals: Vec<Local>,
    pub param_count: usize,
    pub entry: BlockId,
    pub blocks: BTreeMap<BlockId, Block>,
    /// Declared return type of the function body (None = void).
    pub return_type: Option<Type>,
    next_temp: u32,
    next_block: u32,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        let entry = BlockId(0);
        let mut blocks = BTreeMap::new();
        blocks.insert(entry, Block::new(entry));
        Function {
            name: name.into(),
            locals: Vec::new(),
            param_count: 0,
            entry,
            blocks,
            return_type: None,
            next_temp: 0,
            next_block: 1,
        }
    }

    pub fn fresh_temp(&mut self) -> TempId {
        let id = TempId(self.next_temp);
        self.next_temp += 1;
        id
    }

    pub fn fresh_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        self.blocks.insert(id, Block::new(id));
        id
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&id)
    }

    pub fn local(&self, name: &str) -> Option<&Local> {
        self.locals.iter().find(|l| l.name == name)
    }

    /// Successors of `id` per its terminator.
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks
            .get(&id)
            .and_then(|b| b.terminator.as_ref())
            .map(Terminator::targets)
            .unwrap_or_default()
    }

    /// Recompute every block's predecessor set from the terminators.
    pub fn recompute_predecessors(&mut self) {
        let edges: Vec<(BlockId, BlockId)> = self
            .blocks
            .values()
            .flat_map(|b| {
                b.terminator
                    .as_ref()
                    .map(Terminator::targets)
                    .unwrap_or_default()
                    .into_iter()
                    .map(move |t| (b.id, t))
            })
            .collect();
        for block in self.blocks.values_mut() {
            block.predecessors.clear();
        }
        for (from, to) in edges {
            if let Some(block) = self.blocks.get_mut(&to) {
                block.predecessors.insert(from);
            }
        }
    }

    /// Reverse postorder over reachable blocks, starting at entry.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = BTreeSet::new();
        let mut postorder = Vec::new();
        let mut stack = vec![(self.entry, false)];
        while let Some((id, processed)) = stack.pop() {
            if processed {
                postorder.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            // Reversed so the first successor is visited first.
            for succ in self.successors(id).into_iter().rev() {
                if !visited.contains(&succ) {
                    stack.push((succ, false));
                }
            }
        }
        postorder.reverse();
        postorder
    }

    /// Total instruction count (phis not included).
    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.instructions.len()).sum()
    }
}

/// A compiled program: storage layout plus its functions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Module {
    pub name: String,
    pub storage: Vec<StorageSlot>,
    /// Keyed by function name; contains `main` and optionally `create`.
    pub functions: BTreeMap<String, Function>,
}

impl Module {
    pub const MAIN: &'static str = "main";
    pub const CREATE: &'static str = "create";

    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            storage: Vec::new(),
            functions: BTreeMap::new(),
        }
    }

    pub fn main(&self) -> Option<&Function> {
        self.functions.get(Self::MAIN)
    }

    pub fn create(&self) -> Option<&Function> {
        self.functions.get(Self::CREATE)
    }

    pub fn instruction_count(&self) -> usize {
        self.functions.values().map(Function::instruction_count).sum()
    }
}

// ----------------------------------------------------------------------
// Text rendering
// ----------------------------------------------------------------------

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Instruction::*;
        match self {
            Const { dest, value, ty } => match value {
                Literal::Word(w) => write!(f, "{} = const {} : {}", dest, w, ty),
                Literal::Bytes(b) => {
                    write!(f, "{} = const 0x{} : {}", dest, hex::encode(b), ty)
                }
            },
            Binary {
                dest, op, lhs, rhs, ..
            } => write!(f, "{} = {:?} {}, {}", dest, op, lhs, rhs),
            Unary {
                dest, op, operand, ..
            } => write!(f, "{} = {:?} {}", dest, op, operand),
            LoadStorage { dest, slot, .. } => write!(f, "{} = load_storage {}", dest, slot),
            StoreStorage { slot, value } => write!(f, "store_storage {}, {}", slot, value),
            LoadMapping {
                dest, slot, key, ..
            } => write!(f, "{} = load_mapping {}[{}]", dest, slot, key),
            StoreMapping { slot, key, value } => {
                write!(f, "store_mapping {}[{}], {}", slot, key, value)
            }
            LoadLocal { dest, local, .. } => write!(f, "{} = load_local %{}", dest, local),
            StoreLocal { local, value } => write!(f, "store_local %{}, {}", local, value),
            LoadField {
                dest,
                base,
                field_index,
                ..
            } => write!(f, "{} = load_field {}.{}", dest, base, field_index),
            StoreField {
                base,
                field_index,
                value,
            } => write!(f, "store_field {}.{}, {}", base, field_index, value),
            LoadIndex {
                dest, base, index, ..
            } => write!(f, "{} = load_index {}[{}]", dest, base, index),
            StoreIndex { base, index, value } => {
                write!(f, "store_index {}[{}], {}", base, index, value)
            }
            ComputeSlot { dest, base, key } => {
                write!(f, "{} = compute_slot {}, {}", dest, base, key)
            }
            ComputeArraySlot { dest, base } => {
                write!(f, "{} = compute_array_slot {}", dest, base)
            }
            ComputeFieldOffset {
                dest,
                base,
                field_index,
            } => write!(f, "{} = compute_field_offset {}, {}", dest, base, field_index),
            Env { dest, op, .. } => write!(f, "{} = env {:?}", dest, op),
            Hash { dest, value } => write!(f, "{} = hash {}", dest, value),
            Cast { dest, value, ty } => write!(f, "{} = cast {} : {}", dest, value, ty),
            Slice {
                dest,
                base,
                start,
                end,
                source,
                ..
            } => write!(f, "{} = slice {}[{}:{}] ({:?})", dest, base, start, end, source),
            Length { dest, value, .. } => write!(f, "{} = length {}", dest, value),
            Call {
                dest, callee, args, ..
            } => {
                if let Some(dest) = dest {
                    write!(f, "{} = call {}(", dest, callee)?;
                } else {
                    write!(f, "call {}(", callee)?;
                }
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl std::fmt::Display for Terminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Terminator::Jump { target } => write!(f, "jump {}", target),
            Terminator::Branch {
                condition,
                true_target,
                false_target,
            } => write!(f, "branch {}, {}, {}", condition, true_target, false_target),
            Terminator::Return { value: Some(v) } => write!(f, "return {}", v),
            Terminator::Return { value: None } => write!(f, "return"),
        }
    }
}

impl std::fmt::Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, local) in self.locals.iter().take(self.param_count).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "%{}: {}", local.name, local.ty)?;
        }
        writeln!(f, ") {{")?;
        for block in self.blocks.values() {
            write!(f, "  {}:", block.id)?;
            if !block.predecessors.is_empty() {
                let preds: Vec<String> =
                    block.predecessors.iter().map(BlockId::to_string).collect();
                write!(f, "  ; preds: {}", preds.join(", "))?;
            }
            writeln!(f)?;
            for phi in &block.phis {
                write!(f, "    {} = phi ", phi.dest)?;
                for (i, (pred, value)) in phi.sources.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[{}: {}]", pred, value)?;
                }
                writeln!(f)?;
            }
            for instr in &block.instructions {
                writeln!(f, "    {}", instr)?;
            }
            match &block.terminator {
                Some(t) => writeln!(f, "    {}", t)?,
                None => writeln!(f, "    <unterminated>")?,
            }
        }
        writeln!(f, "}}")
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "module {}", self.name)?;
        for slot in &self.storage {
            writeln!(f, "storage [{}] {}: {}", slot.slot, slot.name, slot.ty)?;
        }
        for function in self.functions.values() {
            writeln!(f)?;
            write!(f, "{}", function)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_unique() {
        let mut f = Function::new("main");
        let a = f.fresh_temp();
        let b = f.fresh_temp();
        assert_ne!(a, b);
        let b1 = f.fresh_block();
        let b2 = f.fresh_block();
        assert_ne!(b1, b2);
        assert!(f.block(b1).is_some());
    }

    #[test]
    fn predecessors_recomputed_from_terminators() {
        let mut f = Function::new("main");
        let exit = f.fresh_block();
        f.block_mut(f.entry).unwrap().terminator = Some(Terminator::Jump { target: exit });
        f.block_mut(exit).unwrap().terminator = Some(Terminator::Return { value: None });
        f.recompute_predecessors();
        assert!(f.block(exit).unwrap().predecessors.contains(&f.entry));
        assert!(f.block(f.entry).unwrap().predecessors.is_empty());
    }

    #[test]
    fn reverse_postorder_visits_entry_first() {
        let mut f = Function::new("main");
        let then_b = f.fresh_block();
        let else_b = f.fresh_block();
        let merge = f.fresh_block();
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Branch {
            condition: Value::word(U256::from(1), Type::uint256()),
            true_target: then_b,
            false_target: else_b,
        });
        f.block_mut(then_b).unwrap().terminator = Some(Terminator::Jump { target: merge });
        f.block_mut(else_b).unwrap().terminator = Some(Terminator::Jump { target: merge });
        f.block_mut(merge).unwrap().terminator = Some(Terminator::Return { value: None });
        let rpo = f.reverse_postorder();
        assert_eq!(rpo[0], entry);
        assert_eq!(*rpo.last().unwrap(), merge);
        assert_eq!(rpo.len(), 4);
    }

    #[test]
    fn instruction_dest_and_operands() {
        let lhs = Value::word(U256::from(1), Type::uint256());
        let rhs = Value::Temp {
            id: TempId(3),
            ty: Type::uint256(),
        };
        let i = Instruction::Binary {
            dest: TempId(7),
            op: IrBinOp::Add,
            lhs,
            rhs,
            ty: Type::uint256(),
        };
        assert_eq!(i.dest(), Some(TempId(7)));
        assert_eq!(i.operands().len(), 2);
        assert!(i.is_pure());
    }

    #[test]
    fn stores_have_no_dest_and_are_impure() {
        let i = Instruction::StoreStorage {
            slot: Value::word(U256::ZERO, Type::uint256()),
            value: Value::word(U256::from(5), Type::uint256()),
        };
        assert_eq!(i.dest(), None);
        assert!(!i.is_pure());
        assert!(!i.removable_when_dead());
    }

    #[test]
    fn display_forms() {
        let i = Instruction::Hash {
            dest: TempId(1),
            value: Value::word(U256::from(2), Type::uint256()),
        };
        assert_eq!(i.to_string(), "t1 = hash 2");
        let t = Terminator::Branch {
            condition: Value::Temp {
                id: TempId(0),
                ty: Type::Bool,
            },
            true_target: BlockId(1),
            false_target: BlockId(2),
        };
        assert_eq!(t.to_string(), "branch t0, b1, b2");
    }
}
