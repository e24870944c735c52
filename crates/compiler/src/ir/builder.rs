//! AST → IR lowering
//!
//! Walks the type-annotated AST and emits a [`Module`] in near-SSA form:
//! every temp is assigned exactly once, locals go through
//! `load_local`/`store_local` until the SSA pass promotes them.
//!
//! Control flow becomes explicit blocks and terminators here. Chains of
//! index/member accesses rooted at a storage identifier are collapsed into a
//! single computed-slot expression; the final slot feeds
//! `load_storage`/`store_storage`.
//!
//! Errors accumulate. Non-fatal errors still produce partial IR so later
//! passes can report on top of it.

use crate::ast::{
    BinOp, Block as AstBlock, EnvField, Expr, ExprKind, Program, Statement, UnOp,
};
use crate::diagnostics::{codes, Diagnostic, SourceLocation};
use crate::ir::{
    Block, BlockId, EnvOp, Function, Instruction, IrBinOp, IrUnOp, LengthOf, Literal, Local,
    Module, SliceSource, StorageSlot, Terminator, Value,
};
use crate::typechecker::Symbols;
use crate::types::Type;
use alloy_primitives::U256;
use std::collections::HashMap;

/// Targets the innermost enclosing loop exposes to `break`/`continue`.
struct LoopContext {
    continue_target: BlockId,
    break_target: BlockId,
}

/// Build a module from a checked program. A partial module is produced even
/// in the presence of (non-fatal) errors.
pub fn build(program: &Program, symbols: &Symbols) -> (Module, Vec<Diagnostic>) {
    let mut module = Module::new(program.name.clone());
    module.storage = symbols
        .storage_order
        .iter()
        .map(|(slot, name, ty)| StorageSlot {
            slot: *slot,
            name: name.clone(),
            ty: ty.clone(),
        })
        .collect();

    let mut diagnostics = Vec::new();

    if let Some(code) = &program.code {
        let mut builder = FunctionBuilder::new(Module::MAIN, symbols);
        builder.func.return_type = declared_return_type(code);
        builder.lower_block(&code.body);
        let func = builder.finish(&mut diagnostics);
        module.functions.insert(Module::MAIN.to_string(), func);
    } else {
        diagnostics.push(Diagnostic::error(
            codes::MISSING_RETURN,
            "program has no `code` block",
        ));
    }

    if let Some(create) = &program.create {
        let mut builder = FunctionBuilder::new(Module::CREATE, symbols);
        builder.lower_block(create);
        let func = builder.finish(&mut diagnostics);
        // An empty constructor (no instructions, bare return) is the same
        // as no constructor; both source variants produce the same module.
        let trivial = func.blocks.len() == 1
            && func.instruction_count() == 0
            && matches!(
                func.blocks.values().next().and_then(|b| b.terminator.as_ref()),
                Some(Terminator::Return { value: None })
            );
        if !trivial {
            module.functions.insert(Module::CREATE.to_string(), func);
        }
    }

    (module, diagnostics)
}

/// The declared return type of the `code` block. The checker already
/// rejected programs whose returns disagree with the declaration, so the
/// written type is authoritative here.
fn declared_return_type(code: &crate::ast::CodeBlock) -> Option<Type> {
    code.returns.as_ref().map(resolve_written)
}

/// Minimal structural resolution for the declared return type (word types
/// only reach here; aggregates cannot be returned).
pub(crate) fn resolve_written(te: &crate::ast::TypeExpr) -> Type {
    use crate::ast::TypeExpr;
    match te {
        TypeExpr::Uint(bits) => Type::Uint { bits: *bits },
        TypeExpr::Int(bits) => Type::Int { bits: *bits },
        TypeExpr::Address => Type::Address,
        TypeExpr::Bool => Type::Bool,
        TypeExpr::Bytes(size) => Type::Bytes { size: *size },
        TypeExpr::String => Type::String,
        TypeExpr::Array(element, size) => Type::Array {
            element: Box::new(resolve_written(element)),
            size: *size,
        },
        TypeExpr::Mapping(key, value) => Type::Mapping {
            key: Box::new(resolve_written(key)),
            value: Box::new(resolve_written(value)),
        },
        TypeExpr::Named(name) => Type::Struct {
            name: name.clone(),
            fields: Vec::new(),
        },
    }
}

struct FunctionBuilder<'a> {
    func: Function,
    current: BlockId,
    symbols: &'a Symbols,
    /// Lexical scopes mapping source names to unique local names.
    scopes: Vec<HashMap<String, String>>,
    loops: Vec<LoopContext>,
    diagnostics: Vec<Diagnostic>,
    next_local: u32,
}

impl<'a> FunctionBuilder<'a> {
    fn new(name: &str, symbols: &'a Symbols) -> Self {
        let func = Function::new(name);
        let current = func.entry;
        FunctionBuilder {
            func,
            current,
            symbols,
            scopes: vec![HashMap::new()],
            loops: Vec::new(),
            diagnostics: Vec::new(),
            next_local: 0,
        }
    }

    fn finish(mut self, diagnostics: &mut Vec<Diagnostic>) -> Function {
        // Terminate the exit block.
        if !self.block().is_terminated() {
            match self.func.return_type.clone() {
                None => self.terminate(Terminator::Return { value: None }),
                Some(ty) => {
                    self.diagnostics.push(Diagnostic::error(
                        codes::MISSING_RETURN,
                        format!(
                            "`{}` must return a value of type {} on every path",
                            self.func.name, ty
                        ),
                    ));
                    self.terminate(Terminator::Return { value: None });
                }
            }
        }
        self.prune_unreachable();
        self.func.recompute_predecessors();
        diagnostics.append(&mut self.diagnostics);
        self.func
    }

    /// Drop blocks not reachable from entry (dead code after returns,
    /// breaks out of both branches, and similar).
    fn prune_unreachable(&mut self) {
        let reachable: std::collections::BTreeSet<BlockId> =
            self.func.reverse_postorder().into_iter().collect();
        self.func.blocks.retain(|id, _| reachable.contains(id));
        // Any surviving unterminated block (possible when source ends in a
        // dead branch) falls through as a bare return.
        for block in self.func.blocks.values_mut() {
            if block.terminator.is_none() {
                block.terminator = Some(Terminator::Return { value: None });
            }
        }
    }

    // --------------------------------------------------------------
    // Block plumbing
    // --------------------------------------------------------------

    fn block(&self) -> &Block {
        &self.func.blocks[&self.current]
    }

    fn emit(&mut self, instr: Instruction) {
        let current = self.current;
        self.func
            .block_mut(current)
            .expect("current block exists")
            .instructions
            .push(instr);
    }

    fn terminate(&mut self, terminator: Terminator) {
        let current = self.current;
        let block = self.func.block_mut(current).expect("current block exists");
        if block.terminator.is_none() {
            block.terminator = Some(terminator);
        }
    }

    /// Terminate the current block and continue in a fresh one. Used after
    /// `return`/`break`/`continue`: trailing statements land in an
    /// unreachable block that the reachability sweep strips.
    fn terminate_and_continue(&mut self, terminator: Terminator) {
        self.terminate(terminator);
        let next = self.func.fresh_block();
        self.current = next;
    }

    fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    // --------------------------------------------------------------
    // Locals and scope
    // --------------------------------------------------------------

    fn declare_local(&mut self, source_name: &str, ty: Type, location: SourceLocation) -> String {
        let unique = if self.lookup_local(source_name).is_some() {
            let name = format!("{}.{}", source_name, self.next_local);
            self.next_local += 1;
            name
        } else {
            source_name.to_string()
        };
        self.func.locals.push(Local {
            id: self.func.locals.len() as u32,
            name: unique.clone(),
            ty,
            location: Some(location),
        });
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(source_name.to_string(), unique.clone());
        unique
    }

    fn lookup_local(&self, source_name: &str) -> Option<&str> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(source_name))
            .map(String::as_str)
    }

    fn local_type(&self, unique_name: &str) -> Option<Type> {
        self.func.local(unique_name).map(|l| l.ty.clone())
    }

    // --------------------------------------------------------------
    // Statements
    // --------------------------------------------------------------

    fn lower_block(&mut self, block: &AstBlock) {
        self.scopes.push(HashMap::new());
        for stmt in &block.statements {
            self.lower_statement(stmt);
        }
        self.scopes.pop();
    }

    fn lower_statement(&mut self, stmt: &Statement) {
        match stmt {
            Statement::Let {
                name,
                value,
                location,
                ..
            } => {
                let Some(v) = self.lower_expr(value) else {
                    return;
                };
                let ty = v.ty().clone();
                let unique = self.declare_local(name, ty, *location);
                self.emit(Instruction::StoreLocal {
                    local: unique,
                    value: v,
                });
            }
            Statement::Assign {
                target,
                value,
                location,
            } => {
                self.lower_assignment(target, value, *location);
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                let cond = self.lower_expr(condition);
                let then_block = self.func.fresh_block();
                // An absent or empty else arm branches straight to the
                // merge block instead of materializing an empty block.
                let has_else = else_branch
                    .as_ref()
                    .is_some_and(|b| !b.statements.is_empty());
                let else_block = has_else.then(|| self.func.fresh_block());
                let merge = self.func.fresh_block();
                if let Some(cond) = cond {
                    self.terminate(Terminator::Branch {
                        condition: cond,
                        true_target: then_block,
                        false_target: else_block.unwrap_or(merge),
                    });
                }
                self.switch_to(then_block);
                self.lower_block(then_branch);
                self.terminate(Terminator::Jump { target: merge });
                if let (Some(else_block), Some(else_branch)) = (else_block, else_branch.as_ref()) {
                    self.switch_to(else_block);
                    self.lower_block(else_branch);
                    self.terminate(Terminator::Jump { target: merge });
                }
                self.switch_to(merge);
            }
            Statement::While {
                condition, body, ..
            } => {
                let header = self.func.fresh_block();
                let body_block = self.func.fresh_block();
                let exit = self.func.fresh_block();
                self.terminate(Terminator::Jump { target: header });
                self.switch_to(header);
                if let Some(cond) = self.lower_expr(condition) {
                    self.terminate(Terminator::Branch {
                        condition: cond,
                        true_target: body_block,
                        false_target: exit,
                    });
                }
                self.loops.push(LoopContext {
                    continue_target: header,
                    break_target: exit,
                });
                self.switch_to(body_block);
                self.lower_block(body);
                self.terminate(Terminator::Jump { target: header });
                self.loops.pop();
                self.switch_to(exit);
            }
            Statement::For {
                init,
                condition,
                update,
                body,
                ..
            } => {
                // The init binding scopes over the whole loop.
                self.scopes.push(HashMap::new());
                self.lower_statement(init);
                let header = self.func.fresh_block();
                let body_block = self.func.fresh_block();
                let update_block = self.func.fresh_block();
                let exit = self.func.fresh_block();
                self.terminate(Terminator::Jump { target: header });
                self.switch_to(header);
                if let Some(cond) = self.lower_expr(condition) {
                    self.terminate(Terminator::Branch {
                        condition: cond,
                        true_target: body_block,
                        false_target: exit,
                    });
                }
                self.loops.push(LoopContext {
                    continue_target: update_block,
                    break_target: exit,
                });
                self.switch_to(body_block);
                self.lower_block(body);
                self.terminate(Terminator::Jump {
                    target: update_block,
                });
                self.loops.pop();
                self.switch_to(update_block);
                self.lower_statement(update);
                self.terminate(Terminator::Jump { target: header });
                self.scopes.pop();
                self.switch_to(exit);
            }
            Statement::Break { location } => match self.loops.last() {
                Some(ctx) => {
                    let target = ctx.break_target;
                    self.terminate_and_continue(Terminator::Jump { target });
                }
                None => self.diagnostics.push(
                    Diagnostic::error(
                        codes::LOOP_CONTROL_OUTSIDE_LOOP,
                        "`break` outside of a loop",
                    )
                    .at(*location),
                ),
            },
            Statement::Continue { location } => match self.loops.last() {
                Some(ctx) => {
                    let target = ctx.continue_target;
                    self.terminate_and_continue(Terminator::Jump { target });
                }
                None => self.diagnostics.push(
                    Diagnostic::error(
                        codes::LOOP_CONTROL_OUTSIDE_LOOP,
                        "`continue` outside of a loop",
                    )
                    .at(*location),
                ),
            },
            Statement::Return { value, .. } => {
                let value = value.as_ref().and_then(|v| self.lower_expr(v));
                self.terminate_and_continue(Terminator::Return { value });
            }
            Statement::Expr { expr } => {
                self.lower_expr(expr);
            }
        }
    }

    /// Assignment lowering. Target index/key expressions are lowered before
    /// the assigned value, so emitted operands read left to right the way
    /// the source does.
    fn lower_assignment(&mut self, target: &Expr, value_expr: &Expr, location: SourceLocation) {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some(unique) = self.lookup_local(name).map(str::to_string) {
                    if let Some(value) = self.lower_expr(value_expr) {
                        self.emit(Instruction::StoreLocal {
                            local: unique,
                            value,
                        });
                    }
                    return;
                }
                if let Some((slot, ty)) = self.symbols.storage.get(name).cloned() {
                    if ty.is_reference() {
                        self.diagnostics.push(
                            Diagnostic::error(
                                codes::INVALID_LVALUE,
                                format!("cannot assign whole {} `{}`", ty, name),
                            )
                            .at(location),
                        );
                        return;
                    }
                    if let Some(value) = self.lower_expr(value_expr) {
                        self.emit(Instruction::StoreStorage {
                            slot: Value::word(U256::from(slot), Type::uint256()),
                            value,
                        });
                    }
                    return;
                }
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::UNKNOWN_IDENTIFIER,
                        format!("unknown identifier `{}`", name),
                    )
                    .at(location),
                );
            }
            ExprKind::Index { .. } | ExprKind::Member { .. } => {
                self.lower_storage_store(target, value_expr, location);
            }
            _ => self.diagnostics.push(
                Diagnostic::error(codes::INVALID_LVALUE, "expression is not assignable")
                    .at(location),
            ),
        }
    }

    // --------------------------------------------------------------
    // Expressions
    // --------------------------------------------------------------

    fn lower_expr(&mut self, expr: &Expr) -> Option<Value> {
        let ty = expr.ty.clone().unwrap_or(Type::uint256());
        match &expr.kind {
            ExprKind::Number(n) => Some(Value::word(*n, ty)),
            ExprKind::Bool(b) => Some(Value::word(
                if *b { U256::from(1) } else { U256::ZERO },
                Type::Bool,
            )),
            ExprKind::HexBytes(bytes) => {
                // Fixed bytes are left-aligned in the word.
                let mut word = [0u8; 32];
                let n = bytes.len().min(32);
                word[..n].copy_from_slice(&bytes[..n]);
                Some(Value::word(U256::from_be_bytes(word), ty))
            }
            ExprKind::Str(text) => {
                // Dynamic data gets materialized in memory by codegen; the
                // const instruction carries the raw bytes.
                let dest = self.func.fresh_temp();
                self.emit(Instruction::Const {
                    dest,
                    value: Literal::Bytes(text.clone().into_bytes()),
                    ty: ty.clone(),
                });
                Some(Value::Temp { id: dest, ty })
            }
            ExprKind::Ident(name) => self.lower_ident(name, ty, expr.location),
            ExprKind::Env(field) => {
                let (op, ty) = match field {
                    EnvField::MsgSender => (EnvOp::Caller, Type::Address),
                    EnvField::MsgValue => (EnvOp::CallValue, Type::uint256()),
                    EnvField::MsgData => (EnvOp::CalldataOffset, Type::Bytes { size: None }),
                    EnvField::BlockNumber => (EnvOp::BlockNumber, Type::uint256()),
                    EnvField::BlockTimestamp => (EnvOp::BlockTimestamp, Type::uint256()),
                };
                let dest = self.func.fresh_temp();
                self.emit(Instruction::Env {
                    dest,
                    op,
                    ty: ty.clone(),
                });
                Some(Value::Temp { id: dest, ty })
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let signed = matches!(lhs.ty, Some(Type::Int { .. }));
                let l = self.lower_expr(lhs)?;
                let r = self.lower_expr(rhs)?;
                let ir_op = lower_binop(*op, signed);
                let dest = self.func.fresh_temp();
                self.emit(Instruction::Binary {
                    dest,
                    op: ir_op,
                    lhs: l,
                    rhs: r,
                    ty: ty.clone(),
                });
                Some(Value::Temp { id: dest, ty })
            }
            ExprKind::Unary { op, operand } => {
                let v = self.lower_expr(operand)?;
                let ir_op = match op {
                    UnOp::Not => IrUnOp::IsZero,
                    UnOp::BitNot => IrUnOp::Not,
                    UnOp::Neg => IrUnOp::Neg,
                };
                let dest = self.func.fresh_temp();
                self.emit(Instruction::Unary {
                    dest,
                    op: ir_op,
                    operand: v,
                    ty: ty.clone(),
                });
                Some(Value::Temp { id: dest, ty })
            }
            ExprKind::Index { .. } => self.lower_storage_load(expr),
            ExprKind::Member { base, field } if field == "length" => {
                self.lower_length(base, expr.location)
            }
            ExprKind::Member { .. } => self.lower_storage_load(expr),
            ExprKind::Slice { base, start, end } => {
                let source = self.slice_source(base);
                // Storage slices carry the slot, not a loaded aggregate.
                let base_value = match source {
                    SliceSource::Storage => self.storage_slot_of(base, expr.location)?,
                    _ => self.lower_expr(base)?,
                };
                let start_value = self.lower_expr(start)?;
                let end_value = self.lower_expr(end)?;
                let dest = self.func.fresh_temp();
                self.emit(Instruction::Slice {
                    dest,
                    base: base_value,
                    start: start_value,
                    end: end_value,
                    source,
                    ty: ty.clone(),
                });
                Some(Value::Temp { id: dest, ty })
            }
            ExprKind::Cast { operand, .. } => {
                let v = self.lower_expr(operand)?;
                let dest = self.func.fresh_temp();
                self.emit(Instruction::Cast {
                    dest,
                    value: v,
                    ty: ty.clone(),
                });
                Some(Value::Temp { id: dest, ty })
            }
            ExprKind::Call { callee, args } => self.lower_call(callee, args, ty, expr.location),
        }
    }

    fn lower_ident(&mut self, name: &str, ty: Type, location: SourceLocation) -> Option<Value> {
        if let Some(unique) = self.lookup_local(name).map(str::to_string) {
            let ty = self.local_type(&unique).unwrap_or(ty);
            let dest = self.func.fresh_temp();
            self.emit(Instruction::LoadLocal {
                dest,
                local: unique,
                ty: ty.clone(),
            });
            return Some(Value::Temp { id: dest, ty });
        }
        if let Some((slot, sty)) = self.symbols.storage.get(name).cloned() {
            if sty.is_reference() {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::UNSUPPORTED_EXPRESSION,
                        format!("`{}` of type {} cannot be read as a whole", name, sty),
                    )
                    .at(location),
                );
                return None;
            }
            let dest = self.func.fresh_temp();
            self.emit(Instruction::LoadStorage {
                dest,
                slot: Value::word(U256::from(slot), Type::uint256()),
                ty: sty.clone(),
            });
            return Some(Value::Temp { id: dest, ty: sty });
        }
        self.diagnostics.push(
            Diagnostic::error(
                codes::UNKNOWN_IDENTIFIER,
                format!("unknown identifier `{}`", name),
            )
            .at(location),
        );
        None
    }

    fn lower_call(
        &mut self,
        callee: &str,
        args: &[Expr],
        ty: Type,
        location: SourceLocation,
    ) -> Option<Value> {
        match callee {
            "keccak256" => {
                let v = self.lower_expr(args.first()?)?;
                let dest = self.func.fresh_temp();
                self.emit(Instruction::Hash { dest, value: v });
                Some(Value::Temp {
                    id: dest,
                    ty: Type::Bytes { size: Some(32) },
                })
            }
            "addmod" | "mulmod" => {
                let mut lowered = Vec::new();
                for arg in args {
                    lowered.push(self.lower_expr(arg)?);
                }
                let dest = self.func.fresh_temp();
                self.emit(Instruction::Call {
                    dest: Some(dest),
                    callee: callee.to_string(),
                    args: lowered,
                    ty: ty.clone(),
                });
                Some(Value::Temp { id: dest, ty })
            }
            other => {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::UNSUPPORTED_EXPRESSION,
                        format!("unsupported call `{}`", other),
                    )
                    .at(location),
                );
                None
            }
        }
    }

    fn lower_length(&mut self, base: &Expr, location: SourceLocation) -> Option<Value> {
        let ty = Type::uint256();
        // msg.data.length never goes through the generic length path: the
        // builder resolves it to CALLDATASIZE so no later pass has to
        // recover calldata identity from value names.
        if matches!(base.kind, ExprKind::Env(EnvField::MsgData)) {
            let dest = self.func.fresh_temp();
            self.emit(Instruction::Env {
                dest,
                op: EnvOp::CalldataSize,
                ty: ty.clone(),
            });
            return Some(Value::Temp { id: dest, ty });
        }
        let base_ty = base.ty.clone()?;
        match &base_ty {
            Type::Bytes { size: Some(n) } => {
                let n = *n;
                self.emit_length(Value::word(U256::ZERO, Type::uint256()), LengthOf::Fixed(n))
            }
            Type::Array {
                size: Some(n), ..
            } => {
                let n = *n;
                self.emit_length(Value::word(U256::ZERO, Type::uint256()), LengthOf::Fixed(n))
            }
            Type::Bytes { size: None } | Type::String | Type::Array { size: None, .. } => {
                if self.is_storage_rooted(base) {
                    let slot = self.storage_slot_of(base, location)?;
                    self.emit_length(slot, LengthOf::StorageBytes)
                } else {
                    let pointer = self.lower_expr(base)?;
                    self.emit_length(pointer, LengthOf::MemoryBytes)
                }
            }
            other => {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::UNSUPPORTED_EXPRESSION,
                        format!("type {} has no length", other),
                    )
                    .at(location),
                );
                None
            }
        }
    }

    fn emit_length(&mut self, value: Value, of: LengthOf) -> Option<Value> {
        let dest = self.func.fresh_temp();
        self.emit(Instruction::Length { dest, value, of });
        Some(Value::Temp {
            id: dest,
            ty: Type::uint256(),
        })
    }

    fn slice_source(&self, base: &Expr) -> SliceSource {
        if matches!(base.kind, ExprKind::Env(EnvField::MsgData)) {
            SliceSource::Calldata
        } else if self.is_storage_rooted(base) {
            SliceSource::Storage
        } else {
            SliceSource::Memory
        }
    }

    // --------------------------------------------------------------
    // Storage access chains
    // --------------------------------------------------------------

    /// Whether the expression reads directly from a storage identifier.
    /// Slices are excluded: a slice result is a fresh memory copy.
    fn is_storage_rooted(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Ident(name) => {
                self.lookup_local(name).is_none() && self.symbols.storage.contains_key(name)
            }
            ExprKind::Index { base, .. } | ExprKind::Member { base, .. } => {
                self.is_storage_rooted(base)
            }
            _ => false,
        }
    }

    /// One step of an access chain, outermost last.
    fn collect_chain<'e>(&mut self, expr: &'e Expr, steps: &mut Vec<&'e Expr>) -> Option<&'e str> {
        match &expr.kind {
            ExprKind::Ident(name) => Some(name),
            ExprKind::Index { base, .. } | ExprKind::Member { base, .. } => {
                let root = self.collect_chain(base, steps)?;
                steps.push(expr);
                Some(root)
            }
            _ => None,
        }
    }

    /// Compute the storage slot of a chained access, returning the slot
    /// value. Used by loads, stores and `length`.
    fn storage_slot_of(&mut self, expr: &Expr, location: SourceLocation) -> Option<Value> {
        let mut steps = Vec::new();
        let root = self.collect_chain(expr, &mut steps)?;
        if self.lookup_local(root).is_some() {
            self.diagnostics.push(
                Diagnostic::error(
                    codes::STORAGE_THROUGH_LOCAL,
                    format!("cannot reach storage through local `{}`", root),
                )
                .at(location),
            );
            return None;
        }
        let (slot, root_ty) = self.symbols.storage.get(root).cloned()?;
        let mut slot_value = Value::word(U256::from(slot), Type::uint256());
        let mut current_ty = root_ty;
        for step in steps {
            slot_value = self.lower_chain_step(step, slot_value, &mut current_ty, location)?;
        }
        Some(slot_value)
    }

    /// Lower one mapping/array/struct step: consumes the base slot value,
    /// produces the element slot value and updates the carried type.
    fn lower_chain_step(
        &mut self,
        step: &Expr,
        base: Value,
        current_ty: &mut Type,
        location: SourceLocation,
    ) -> Option<Value> {
        match (&step.kind, current_ty.clone()) {
            (ExprKind::Index { index, .. }, Type::Mapping { value, .. }) => {
                let key = self.lower_expr(index)?;
                let dest = self.func.fresh_temp();
                self.emit(Instruction::ComputeSlot { dest, base, key });
                *current_ty = *value;
                Some(Value::Temp {
                    id: dest,
                    ty: Type::uint256(),
                })
            }
            (ExprKind::Index { index, .. }, Type::Array { element, .. }) => {
                let idx = self.lower_expr(index)?;
                let hashed = self.func.fresh_temp();
                self.emit(Instruction::ComputeArraySlot { dest: hashed, base });
                let dest = self.func.fresh_temp();
                self.emit(Instruction::Binary {
                    dest,
                    op: IrBinOp::Add,
                    lhs: Value::Temp {
                        id: hashed,
                        ty: Type::uint256(),
                    },
                    rhs: idx,
                    ty: Type::uint256(),
                });
                *current_ty = *element;
                Some(Value::Temp {
                    id: dest,
                    ty: Type::uint256(),
                })
            }
            (ExprKind::Member { field, .. }, Type::Struct { name, fields }) => {
                let index = fields.iter().position(|f| &f.name == field);
                match index {
                    Some(field_index) => {
                        let dest = self.func.fresh_temp();
                        self.emit(Instruction::ComputeFieldOffset {
                            dest,
                            base,
                            field_index,
                        });
                        *current_ty = fields[field_index].ty.clone();
                        Some(Value::Temp {
                            id: dest,
                            ty: Type::uint256(),
                        })
                    }
                    None => {
                        self.diagnostics.push(
                            Diagnostic::error(
                                codes::UNKNOWN_IDENTIFIER,
                                format!("struct `{}` has no field `{}`", name, field),
                            )
                            .at(location),
                        );
                        None
                    }
                }
            }
            (_, ty) => {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::UNSUPPORTED_EXPRESSION,
                        format!("unsupported storage access through {}", ty),
                    )
                    .at(location),
                );
                None
            }
        }
    }

    /// Load through an index/member chain. Single-step accesses use the
    /// dedicated mapping/array/field instructions; deeper chains collapse
    /// into computed slots feeding `load_storage`.
    fn lower_storage_load(&mut self, expr: &Expr) -> Option<Value> {
        let location = expr.location;
        let result_ty = expr.ty.clone().unwrap_or(Type::uint256());
        let mut steps = Vec::new();
        let Some(root) = self.collect_chain(expr, &mut steps) else {
            self.diagnostics.push(
                Diagnostic::error(codes::UNSUPPORTED_EXPRESSION, "unsupported expression")
                    .at(location),
            );
            return None;
        };
        if self.lookup_local(root).is_some() {
            self.diagnostics.push(
                Diagnostic::error(
                    codes::STORAGE_THROUGH_LOCAL,
                    format!("cannot reach storage through local `{}`", root),
                )
                .at(location),
            );
            return None;
        }
        let root = root.to_string();
        let Some((slot, root_ty)) = self.symbols.storage.get(&root).cloned() else {
            self.diagnostics.push(
                Diagnostic::error(
                    codes::UNKNOWN_IDENTIFIER,
                    format!("unknown identifier `{}`", root),
                )
                .at(location),
            );
            return None;
        };
        let base = Value::word(U256::from(slot), Type::uint256());

        if steps.len() == 1 {
            if let Some(value) = self.lower_single_step_load(steps[0], &base, &root_ty, &result_ty)
            {
                return Some(value);
            }
        }

        let mut slot_value = base;
        let mut current_ty = root_ty;
        for step in steps {
            slot_value = self.lower_chain_step(step, slot_value, &mut current_ty, location)?;
        }
        let dest = self.func.fresh_temp();
        self.emit(Instruction::LoadStorage {
            dest,
            slot: slot_value,
            ty: result_ty.clone(),
        });
        Some(Value::Temp {
            id: dest,
            ty: result_ty,
        })
    }

    /// The specialized single-level forms: `load_mapping`, `load_index`,
    /// `load_field`. Returns `None` when the step shape doesn't match and
    /// the generic chain lowering should run instead.
    fn lower_single_step_load(
        &mut self,
        step: &Expr,
        base: &Value,
        root_ty: &Type,
        result_ty: &Type,
    ) -> Option<Value> {
        match (&step.kind, root_ty) {
            (ExprKind::Index { index, .. }, Type::Mapping { .. }) => {
                let key = self.lower_expr(index)?;
                let dest = self.func.fresh_temp();
                self.emit(Instruction::LoadMapping {
                    dest,
                    slot: base.clone(),
                    key,
                    ty: result_ty.clone(),
                });
                Some(Value::Temp {
                    id: dest,
                    ty: result_ty.clone(),
                })
            }
            (ExprKind::Index { index, .. }, Type::Array { .. }) => {
                let idx = self.lower_expr(index)?;
                let dest = self.func.fresh_temp();
                self.emit(Instruction::LoadIndex {
                    dest,
                    base: base.clone(),
                    index: idx,
                    ty: result_ty.clone(),
                });
                Some(Value::Temp {
                    id: dest,
                    ty: result_ty.clone(),
                })
            }
            (ExprKind::Member { field, .. }, Type::Struct { fields, .. }) => {
                let field_index = fields.iter().position(|f| &f.name == field)?;
                let dest = self.func.fresh_temp();
                self.emit(Instruction::LoadField {
                    dest,
                    base: base.clone(),
                    field_index,
                    ty: result_ty.clone(),
                });
                Some(Value::Temp {
                    id: dest,
                    ty: result_ty.clone(),
                })
            }
            _ => None,
        }
    }

    /// Store counterpart of [`lower_storage_load`]. Keys and indices are
    /// lowered before the stored value.
    fn lower_storage_store(&mut self, target: &Expr, value_expr: &Expr, location: SourceLocation) {
        let mut steps = Vec::new();
        let Some(root) = self.collect_chain(target, &mut steps) else {
            self.diagnostics.push(
                Diagnostic::error(codes::INVALID_LVALUE, "expression is not assignable")
                    .at(location),
            );
            return;
        };
        if self.lookup_local(root).is_some() {
            self.diagnostics.push(
                Diagnostic::error(
                    codes::STORAGE_THROUGH_LOCAL,
                    format!("cannot reach storage through local `{}`", root),
                )
                .at(location),
            );
            return;
        }
        let root = root.to_string();
        let Some((slot, root_ty)) = self.symbols.storage.get(&root).cloned() else {
            self.diagnostics.push(
                Diagnostic::error(
                    codes::UNKNOWN_IDENTIFIER,
                    format!("unknown identifier `{}`", root),
                )
                .at(location),
            );
            return;
        };
        let base = Value::word(U256::from(slot), Type::uint256());

        if steps.len() == 1 {
            match (&steps[0].kind, &root_ty) {
                (ExprKind::Index { index, .. }, Type::Mapping { .. }) => {
                    let Some(key) = self.lower_expr(index) else {
                        return;
                    };
                    let Some(value) = self.lower_expr(value_expr) else {
                        return;
                    };
                    self.emit(Instruction::StoreMapping {
                        slot: base,
                        key,
                        value,
                    });
                    return;
                }
                (ExprKind::Index { index, .. }, Type::Array { .. }) => {
                    let Some(idx) = self.lower_expr(index) else {
                        return;
                    };
                    let Some(value) = self.lower_expr(value_expr) else {
                        return;
                    };
                    self.emit(Instruction::StoreIndex {
                        base,
                        index: idx,
                        value,
                    });
                    return;
                }
                (ExprKind::Member { field, .. }, Type::Struct { fields, .. }) => {
                    if let Some(field_index) = fields.iter().position(|f| &f.name == field) {
                        let Some(value) = self.lower_expr(value_expr) else {
                            return;
                        };
                        self.emit(Instruction::StoreField {
                            base,
                            field_index,
                            value,
                        });
                        return;
                    }
                }
                _ => {}
            }
        }

        let mut slot_value = base;
        let mut current_ty = root_ty;
        for step in steps {
            let Some(next) = self.lower_chain_step(step, slot_value, &mut current_ty, location)
            else {
                return;
            };
            slot_value = next;
        }
        let Some(value) = self.lower_expr(value_expr) else {
            return;
        };
        self.emit(Instruction::StoreStorage {
            slot: slot_value,
            value,
        });
    }
}

fn lower_binop(op: BinOp, signed: bool) -> IrBinOp {
    match op {
        BinOp::Add => IrBinOp::Add,
        BinOp::Sub => IrBinOp::Sub,
        BinOp::Mul => IrBinOp::Mul,
        BinOp::Div => {
            if signed {
                IrBinOp::SDiv
            } else {
                IrBinOp::Div
            }
        }
        BinOp::Mod => {
            if signed {
                IrBinOp::SMod
            } else {
                IrBinOp::Mod
            }
        }
        BinOp::Lt => {
            if signed {
                IrBinOp::SLt
            } else {
                IrBinOp::Lt
            }
        }
        BinOp::Gt => {
            if signed {
                IrBinOp::SGt
            } else {
                IrBinOp::Gt
            }
        }
        BinOp::Le => {
            if signed {
                IrBinOp::SLe
            } else {
                IrBinOp::Le
            }
        }
        BinOp::Ge => {
            if signed {
                IrBinOp::SGe
            } else {
                IrBinOp::Ge
            }
        }
        BinOp::Eq => IrBinOp::Eq,
        BinOp::Ne => IrBinOp::Ne,
        // Logical and/or on 0/1 words coincide with the bitwise ops.
        BinOp::And | BinOp::BitAnd => IrBinOp::And,
        BinOp::Or | BinOp::BitOr => IrBinOp::Or,
        BinOp::BitXor => IrBinOp::Xor,
        BinOp::Shl => IrBinOp::Shl,
        // A right shift of a signed value must sign-fill.
        BinOp::Shr => {
            if signed {
                IrBinOp::Sar
            } else {
                IrBinOp::Shr
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::typechecker::TypeChecker;

    fn build_source(source: &str) -> (Module, Vec<Diagnostic>) {
        let (program, diags) = Parser::new(source).parse();
        assert!(diags.is_empty(), "parse errors: {:?}", diags);
        let mut program = program.unwrap();
        let (symbols, diags) = TypeChecker::new().check(&mut program);
        assert!(diags.is_empty(), "type errors: {:?}", diags);
        build(&program, &symbols)
    }

    fn main_fn(module: &Module) -> &Function {
        module.main().expect("main function")
    }

    #[test]
    fn minimal_program_builds_empty_main() {
        let (module, diags) = build_source("name X; code {}");
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        assert_eq!(main.blocks.len(), 1);
        assert_eq!(main.instruction_count(), 0);
        assert!(module.create().is_none());
    }

    #[test]
    fn let_and_return_lowering() {
        let (module, diags) = build_source("name X; code -> uint256 { let x = 42; return x; }");
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        let entry = main.block(main.entry).unwrap();
        assert!(matches!(
            entry.instructions[0],
            Instruction::StoreLocal { .. }
        ));
        assert!(matches!(
            entry.instructions[1],
            Instruction::LoadLocal { .. }
        ));
        assert!(matches!(
            entry.terminator,
            Some(Terminator::Return { value: Some(_) })
        ));
    }

    #[test]
    fn empty_if_else_branches_to_merge() {
        let (module, diags) = build_source("name X; code { if (1) { } else { } }");
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        // entry + then + merge; empty arms never materialize a block.
        assert_eq!(main.blocks.len(), 3);
        let entry = main.block(main.entry).unwrap();
        let Some(Terminator::Branch {
            true_target,
            false_target,
            ..
        }) = entry.terminator
        else {
            panic!("expected branch");
        };
        assert_eq!(main.successors(true_target), vec![false_target]);
    }

    #[test]
    fn nonempty_if_else_creates_diamond() {
        let (module, diags) = build_source(
            "name X;\nstorage { t: uint256; }\ncode { if (1) { t = 1; } else { t = 2; } }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        // entry + then + else + merge
        assert_eq!(main.blocks.len(), 4);
        let entry = main.block(main.entry).unwrap();
        let Some(Terminator::Branch {
            true_target,
            false_target,
            ..
        }) = entry.terminator
        else {
            panic!("expected branch");
        };
        let merge_of = |b: BlockId| main.successors(b)[0];
        assert_eq!(merge_of(true_target), merge_of(false_target));
    }

    #[test]
    fn while_loop_shape() {
        let (module, diags) =
            build_source("name X; code { let i = 0; while (i < 10) { i = i + 1; } }");
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        // entry, header, body, exit
        assert_eq!(main.blocks.len(), 4);
        // The header must have two predecessors: entry and body.
        let header = main.successors(main.entry)[0];
        assert_eq!(main.block(header).unwrap().predecessors.len(), 2);
    }

    #[test]
    fn break_jumps_to_exit() {
        let (module, diags) =
            build_source("name X; code { while (1) { break; } }");
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        let header = main.successors(main.entry)[0];
        let Some(Terminator::Branch {
            true_target: body,
            false_target: exit,
            ..
        }) = main.block(header).unwrap().terminator
        else {
            panic!("header must branch");
        };
        assert_eq!(
            main.block(body).unwrap().terminator,
            Some(Terminator::Jump { target: exit })
        );
    }

    #[test]
    fn break_outside_loop_reported() {
        let (program, _) = Parser::new("name X; code { break; }").parse();
        let mut program = program.unwrap();
        let (symbols, _) = TypeChecker::new().check(&mut program);
        let (_, diags) = build(&program, &symbols);
        assert!(diags
            .iter()
            .any(|d| d.code == codes::LOOP_CONTROL_OUTSIDE_LOOP));
    }

    #[test]
    fn mapping_store_uses_store_mapping() {
        let (module, diags) = build_source(
            "name X;\nstorage { balances: mapping<address, uint256>; }\ncode { balances[msg.sender] = msg.value; }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        let entry = main.block(main.entry).unwrap();
        assert!(entry
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::StoreMapping { .. })));
    }

    #[test]
    fn nested_mapping_collapses_to_compute_slots() {
        let (module, diags) = build_source(
            "name X;\nstorage { allowance: mapping<address, mapping<address, uint256>>; }\ncode { let a = allowance[msg.sender][msg.sender]; }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        let entry = main.block(main.entry).unwrap();
        let slots = entry
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::ComputeSlot { .. }))
            .count();
        assert_eq!(slots, 2);
        assert!(entry
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::LoadStorage { .. })));
    }

    #[test]
    fn msg_data_length_is_calldatasize() {
        let (module, diags) = build_source("name X; code { let n = msg.data.length; }");
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        let entry = main.block(main.entry).unwrap();
        assert!(entry.instructions.iter().any(|i| matches!(
            i,
            Instruction::Env {
                op: EnvOp::CalldataSize,
                ..
            }
        )));
        assert!(!entry
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::Length { .. })));
    }

    #[test]
    fn return_strips_trailing_code() {
        let (module, diags) =
            build_source("name X; code -> uint256 { return 1; let x = 2; }");
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        // Only the entry survives; trailing code was unreachable.
        assert_eq!(main.blocks.len(), 1);
    }

    #[test]
    fn missing_return_reported() {
        let (program, _) =
            Parser::new("name X; code -> uint256 { let x = 1; }").parse();
        let mut program = program.unwrap();
        let (symbols, _) = TypeChecker::new().check(&mut program);
        let (_, diags) = build(&program, &symbols);
        assert!(diags.iter().any(|d| d.code == codes::MISSING_RETURN));
    }

    #[test]
    fn empty_create_elided() {
        let (module, diags) = build_source("name X; create { } code { }");
        assert!(diags.is_empty(), "{:?}", diags);
        assert!(module.create().is_none());
    }

    #[test]
    fn nonempty_create_kept() {
        let (module, diags) = build_source(
            "name X;\nstorage { owner: address; }\ncreate { owner = msg.sender; }\ncode { }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
        assert!(module.create().is_some());
    }

    #[test]
    fn builtin_call_lowered() {
        let (module, diags) =
            build_source("name X; code { let r = addmod(1, 2, 3); }");
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        let entry = main.block(main.entry).unwrap();
        assert!(entry
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::Call { callee, .. } if callee == "addmod")));
    }

    #[test]
    fn int_operands_select_signed_comparison_and_shift_ops() {
        let (module, diags) = build_source(
            "name X; code { let a = int256(1) - int256(2); let le = a <= int256(0); let ge = a >= int256(0); let lt = a < int256(0); let sh = a >> 1; }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        let ops: Vec<crate::ir::IrBinOp> = main
            .block(main.entry)
            .unwrap()
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Binary { op, .. } => Some(*op),
                _ => None,
            })
            .collect();
        assert!(ops.contains(&crate::ir::IrBinOp::SLe));
        assert!(ops.contains(&crate::ir::IrBinOp::SGe));
        assert!(ops.contains(&crate::ir::IrBinOp::SLt));
        assert!(ops.contains(&crate::ir::IrBinOp::Sar));
        assert!(!ops.contains(&crate::ir::IrBinOp::Le));
        assert!(!ops.contains(&crate::ir::IrBinOp::Ge));
        assert!(!ops.contains(&crate::ir::IrBinOp::Shr));
    }

    #[test]
    fn uint_operands_select_unsigned_comparison_and_shift_ops() {
        let (module, diags) = build_source(
            "name X; code { let a = 1 + 2; let le = a <= 3; let ge = a >= 3; let sh = a >> 1; }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        let ops: Vec<crate::ir::IrBinOp> = main
            .block(main.entry)
            .unwrap()
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Binary { op, .. } => Some(*op),
                _ => None,
            })
            .collect();
        assert!(ops.contains(&crate::ir::IrBinOp::Le));
        assert!(ops.contains(&crate::ir::IrBinOp::Ge));
        assert!(ops.contains(&crate::ir::IrBinOp::Shr));
        assert!(!ops.contains(&crate::ir::IrBinOp::SLe));
        assert!(!ops.contains(&crate::ir::IrBinOp::SGe));
        assert!(!ops.contains(&crate::ir::IrBinOp::Sar));
    }

    #[test]
    fn temps_unique_across_function() {
        let (module, diags) = build_source(
            "name X; code { let a = 1 + 2; let b = a + 3; let c = b + a; }",
        );
        assert!(diags.is_empty(), "{:?}", diags);
        let main = main_fn(&module);
        let mut seen = std::collections::BTreeSet::new();
        for block in main.blocks.values() {
            for instr in &block.instructions {
                if let Some(dest) = instr.dest() {
                    assert!(seen.insert(dest), "temp {} defined twice", dest);
                }
            }
        }
    }
}
