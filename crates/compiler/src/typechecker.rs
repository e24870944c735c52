//! Type checker for Ember
//!
//! Walks the parsed program, resolves written types against the struct
//! table, and annotates every expression with its semantic [`Type`] in
//! place. Diagnostics accumulate; checking continues past errors so one run
//! reports as much as possible.

use crate::ast::{
    BinOp, Block, EnvField, Expr, ExprKind, Program, Statement, TypeExpr, UnOp,
};
use crate::diagnostics::{codes, Diagnostic, SourceLocation};
use crate::types::{StructField, Type};
use std::collections::HashMap;

/// Resolved symbol tables handed to the IR builder: storage declarations
/// with semantic types, and the struct definitions.
#[derive(Debug, Clone, Default)]
pub struct Symbols {
    /// Storage name → (slot index, type), in declaration order in `order`.
    pub storage: HashMap<String, (usize, Type)>,
    pub storage_order: Vec<(usize, String, Type)>,
    pub structs: HashMap<String, Type>,
}

pub struct TypeChecker {
    structs: HashMap<String, Type>,
    storage: HashMap<String, (usize, Type)>,
    /// Lexical scopes, innermost last.
    scopes: Vec<HashMap<String, Type>>,
    diagnostics: Vec<Diagnostic>,
    /// Declared return type of the block being checked (None = void).
    return_type: Option<Type>,
}

impl TypeChecker {
    pub fn new() -> Self {
        TypeChecker {
            structs: HashMap::new(),
            storage: HashMap::new(),
            scopes: Vec::new(),
            diagnostics: Vec::new(),
            return_type: None,
        }
    }

    /// Check `program`, annotating expression types in place. Returns the
    /// resolved symbol tables alongside the diagnostics so the IR builder
    /// never re-resolves written types.
    pub fn check(mut self, program: &mut Program) -> (Symbols, Vec<Diagnostic>) {
        self.collect_structs(program);
        self.collect_storage(program);

        if let Some(create) = &mut program.create {
            self.return_type = None;
            self.check_block_scoped(create);
        }
        if let Some(code) = &mut program.code {
            self.return_type = code
                .returns
                .clone()
                .and_then(|te| self.resolve_type(&te, None));
            let mut body = std::mem::replace(&mut code.body, Block { statements: vec![] });
            self.check_block_scoped(&mut body);
            code.body = body;
        }

        let mut storage_order: Vec<(usize, String, Type)> = self
            .storage
            .iter()
            .map(|(name, (slot, ty))| (*slot, name.clone(), ty.clone()))
            .collect();
        storage_order.sort_by_key(|(slot, _, _)| *slot);
        let symbols = Symbols {
            storage: self.storage.clone(),
            storage_order,
            structs: self.structs.clone(),
        };
        (symbols, self.diagnostics)
    }

    fn collect_structs(&mut self, program: &Program) {
        for def in &program.structs {
            if self.structs.contains_key(&def.name) {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::DUPLICATE_DEFINITION,
                        format!("struct `{}` is defined twice", def.name),
                    )
                    .at(def.location),
                );
                continue;
            }
            let mut fields = Vec::new();
            for (index, (fname, fty)) in def.fields.iter().enumerate() {
                let Some(ty) = self.resolve_type(fty, Some(def.location)) else {
                    continue;
                };
                fields.push(StructField {
                    name: fname.clone(),
                    ty,
                    // One storage slot per field.
                    offset: index * 32,
                });
            }
            self.structs.insert(
                def.name.clone(),
                Type::Struct {
                    name: def.name.clone(),
                    fields,
                },
            );
        }
    }

    fn collect_storage(&mut self, program: &Program) {
        for decl in &program.storage {
            let Some(ty) = self.resolve_type(&decl.ty, Some(decl.location)) else {
                continue;
            };
            if let Type::Mapping { key, .. } = &ty {
                if !key.valid_mapping_key() {
                    self.diagnostics.push(
                        Diagnostic::error(
                            codes::UNKNOWN_TYPE,
                            format!("`{}` cannot be used as a mapping key", key),
                        )
                        .at(decl.location),
                    );
                }
            }
            if self
                .storage
                .insert(decl.name.clone(), (decl.slot, ty))
                .is_some()
            {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::DUPLICATE_DEFINITION,
                        format!("storage field `{}` is declared twice", decl.name),
                    )
                    .at(decl.location),
                );
            }
        }
    }

    /// Resolve a written type to a semantic type; named types come from the
    /// struct table.
    fn resolve_type(&mut self, te: &TypeExpr, loc: Option<SourceLocation>) -> Option<Type> {
        let ty = match te {
            TypeExpr::Uint(bits) => Type::Uint { bits: *bits },
            TypeExpr::Int(bits) => Type::Int { bits: *bits },
            TypeExpr::Address => Type::Address,
            TypeExpr::Bool => Type::Bool,
            TypeExpr::Bytes(size) => Type::Bytes { size: *size },
            TypeExpr::String => Type::String,
            TypeExpr::Array(element, size) => {
                let element = self.resolve_type(element, loc)?;
                Type::Array {
                    element: Box::new(element),
                    size: *size,
                }
            }
            TypeExpr::Mapping(key, value) => {
                let key = self.resolve_type(key, loc)?;
                let value = self.resolve_type(value, loc)?;
                Type::Mapping {
                    key: Box::new(key),
                    value: Box::new(value),
                }
            }
            TypeExpr::Named(name) => match self.structs.get(name) {
                Some(ty) => ty.clone(),
                None => {
                    let mut d = Diagnostic::error(
                        codes::UNKNOWN_TYPE,
                        format!("unknown type `{}`", name),
                    );
                    if let Some(loc) = loc {
                        d = d.at(loc);
                    }
                    self.diagnostics.push(d);
                    return None;
                }
            },
        };
        Some(ty)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn check_block_scoped(&mut self, block: &mut Block) {
        self.scopes.push(HashMap::new());
        for stmt in &mut block.statements {
            self.check_statement(stmt);
        }
        self.scopes.pop();
    }

    fn check_statement(&mut self, stmt: &mut Statement) {
        match stmt {
            Statement::Let {
                name,
                ty,
                value,
                location,
            } => {
                let value_ty = self.check_expr(value);
                let declared = ty.as_ref().and_then(|te| {
                    let te = te.clone();
                    self.resolve_type(&te, Some(*location))
                });
                let final_ty = match (declared, value_ty) {
                    (Some(decl), Some(actual)) => {
                        if !decl.assignable_from(&actual) {
                            self.diagnostics.push(
                                Diagnostic::error(
                                    codes::TYPE_MISMATCH,
                                    format!("expected {}, found {}", decl, actual),
                                )
                                .at(*location),
                            );
                        }
                        decl
                    }
                    (Some(decl), None) => decl,
                    (None, Some(actual)) => actual,
                    (None, None) => return,
                };
                // Storage aggregates never alias through locals.
                if matches!(final_ty, Type::Mapping { .. })
                    || (final_ty.is_reference() && self.is_storage_rooted(value))
                {
                    self.diagnostics.push(
                        Diagnostic::error(
                            codes::STORAGE_THROUGH_LOCAL,
                            format!(
                                "cannot bind storage value of type {} to local `{}`",
                                final_ty, name
                            ),
                        )
                        .at(*location),
                    );
                    return;
                }
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(name.clone(), final_ty);
                }
            }
            Statement::Assign {
                target,
                value,
                location,
            } => {
                let target_ty = self.check_lvalue(target);
                let value_ty = self.check_expr(value);
                if let (Some(t), Some(v)) = (target_ty, value_ty) {
                    if !t.assignable_from(&v) {
                        self.diagnostics.push(
                            Diagnostic::error(
                                codes::TYPE_MISMATCH,
                                format!("cannot assign {} to {}", v, t),
                            )
                            .at(*location),
                        );
                    }
                }
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
                location,
            } => {
                self.check_condition(condition, *location);
                self.check_block_scoped(then_branch);
                if let Some(else_branch) = else_branch {
                    self.check_block_scoped(else_branch);
                }
            }
            Statement::While {
                condition,
                body,
                location,
            } => {
                self.check_condition(condition, *location);
                self.check_block_scoped(body);
            }
            Statement::For {
                init,
                condition,
                update,
                body,
                location,
            } => {
                // The init binding is visible in the condition, update and
                // body, so the for statement opens its own scope.
                self.scopes.push(HashMap::new());
                self.check_statement(init);
                self.check_condition(condition, *location);
                self.check_statement(update);
                self.check_block_scoped(body);
                self.scopes.pop();
            }
            Statement::Break { .. } | Statement::Continue { .. } => {}
            Statement::Return { value, location } => {
                let value_ty = value.as_mut().and_then(|v| self.check_expr(v));
                match (&self.return_type, value_ty) {
                    (Some(expected), Some(actual)) => {
                        if !expected.assignable_from(&actual) {
                            self.diagnostics.push(
                                Diagnostic::error(
                                    codes::TYPE_MISMATCH,
                                    format!("return type is {}, found {}", expected, actual),
                                )
                                .at(*location),
                            );
                        }
                    }
                    (Some(expected), None) if value.is_none() => {
                        self.diagnostics.push(
                            Diagnostic::error(
                                codes::TYPE_MISMATCH,
                                format!("return value of type {} required", expected),
                            )
                            .at(*location),
                        );
                    }
                    (None, Some(_)) => {
                        self.diagnostics.push(
                            Diagnostic::error(
                                codes::TYPE_MISMATCH,
                                "this block does not return a value",
                            )
                            .at(*location),
                        );
                    }
                    _ => {}
                }
            }
            Statement::Expr { expr } => {
                self.check_expr(expr);
            }
        }
    }

    fn check_condition(&mut self, condition: &mut Expr, location: SourceLocation) {
        if let Some(ty) = self.check_expr(condition) {
            // Integer conditions are allowed (nonzero = true), matching the
            // VM's JUMPI semantics.
            let ok = matches!(ty, Type::Bool | Type::Uint { .. } | Type::Int { .. });
            if !ok {
                self.diagnostics.push(
                    Diagnostic::error(
                        codes::TYPE_MISMATCH,
                        format!("condition must be bool or integer, found {}", ty),
                    )
                    .at(location),
                );
            }
        }
    }

    /// Check an assignment target: a local name, a storage name, or an
    /// index/member chain rooted at one.
    fn check_lvalue(&mut self, target: &mut Expr) -> Option<Type> {
        match &target.kind {
            ExprKind::Ident(_) | ExprKind::Index { .. } | ExprKind::Member { .. } => {
                self.check_expr(target)
            }
            _ => {
                self.diagnostics.push(
                    Diagnostic::error(codes::INVALID_LVALUE, "expression is not assignable")
                        .at(target.location),
                );
                None
            }
        }
    }

    /// Whether the expression reads directly from a storage identifier
    /// (possibly through an index/member chain). Slices are excluded: a
    /// slice result is a fresh memory copy, never a storage alias.
    fn is_storage_rooted(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Ident(name) => {
                self.lookup_local(name).is_none() && self.storage.contains_key(name)
            }
            ExprKind::Index { base, .. } | ExprKind::Member { base, .. } => {
                self.is_storage_rooted(base)
            }
            _ => false,
        }
    }

    fn lookup_local(&self, name: &str) -> Option<&Type> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Type an expression, storing the result in `expr.ty`. Returns `None`
    /// (and reports) on error.
    fn check_expr(&mut self, expr: &mut Expr) -> Option<Type> {
        let ty = self.infer_expr(expr)?;
        expr.ty = Some(ty.clone());
        Some(ty)
    }

    fn infer_expr(&mut self, expr: &mut Expr) -> Option<Type> {
        let location = expr.location;
        match &mut expr.kind {
            ExprKind::Number(_) => Some(Type::uint256()),
            ExprKind::Bool(_) => Some(Type::Bool),
            ExprKind::Str(_) => Some(Type::String),
            ExprKind::HexBytes(bytes) => Some(Type::Bytes {
                size: Some(bytes.len()),
            }),
            ExprKind::Ident(name) => {
                if let Some(ty) = self.lookup_local(name) {
                    return Some(ty.clone());
                }
                if let Some((_, ty)) = self.storage.get(name) {
                    return Some(ty.clone());
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
            ExprKind::Env(field) => Some(match field {
                EnvField::MsgSender => Type::Address,
                EnvField::MsgValue => Type::uint256(),
                EnvField::MsgData => Type::Bytes { size: None },
                EnvField::BlockNumber | EnvField::BlockTimestamp => Type::uint256(),
            }),
            ExprKind::Binary { op, lhs, rhs } => {
                let op = *op;
                let lt = self.check_expr(lhs)?;
                let rt = self.check_expr(rhs)?;
                self.check_binary(op, lt, rt, location)
            }
            ExprKind::Unary { op, operand } => {
                let op = *op;
                let ot = self.check_expr(operand)?;
                match op {
                    UnOp::Not => {
                        if ot != Type::Bool {
                            self.type_error(location, format!("`!` needs bool, found {}", ot));
                            return None;
                        }
                        Some(Type::Bool)
                    }
                    UnOp::Neg | UnOp::BitNot => {
                        if !matches!(ot, Type::Uint { .. } | Type::Int { .. }) {
                            self.type_error(
                                location,
                                format!("operator needs an integer, found {}", ot),
                            );
                            return None;
                        }
                        Some(ot)
                    }
                }
            }
            ExprKind::Index { base, index } => {
                let bt = self.check_expr(base)?;
                let it = self.check_expr(index)?;
                match bt {
                    Type::Mapping { key, value } => {
                        if !key.assignable_from(&it) {
                            self.type_error(
                                location,
                                format!("mapping key is {}, found {}", key, it),
                            );
                        }
                        Some(*value)
                    }
                    Type::Array { element, .. } => {
                        self.require_integer(&it, location);
                        Some(*element)
                    }
                    Type::Bytes { .. } | Type::String => {
                        self.require_integer(&it, location);
                        Some(Type::Uint { bits: 8 })
                    }
                    other => {
                        self.diagnostics.push(
                            Diagnostic::error(
                                codes::NOT_INDEXABLE,
                                format!("type {} cannot be indexed", other),
                            )
                            .at(location),
                        );
                        None
                    }
                }
            }
            ExprKind::Member { base, field } => {
                let field = field.clone();
                let bt = self.check_expr(base)?;
                if field == "length" {
                    return match bt {
                        Type::Array { .. } | Type::Bytes { .. } | Type::String => {
                            Some(Type::uint256())
                        }
                        other => {
                            self.diagnostics.push(
                                Diagnostic::error(
                                    codes::UNKNOWN_MEMBER,
                                    format!("type {} has no `.length`", other),
                                )
                                .at(location),
                            );
                            None
                        }
                    };
                }
                match bt {
                    Type::Struct { name, fields } => {
                        match fields.iter().find(|f| f.name == field) {
                            Some(f) => Some(f.ty.clone()),
                            None => {
                                self.diagnostics.push(
                                    Diagnostic::error(
                                        codes::UNKNOWN_MEMBER,
                                        format!("struct `{}` has no field `{}`", name, field),
                                    )
                                    .at(location),
                                );
                                None
                            }
                        }
                    }
                    other => {
                        self.diagnostics.push(
                            Diagnostic::error(
                                codes::UNKNOWN_MEMBER,
                                format!("type {} has no member `{}`", other, field),
                            )
                            .at(location),
                        );
                        None
                    }
                }
            }
            ExprKind::Slice { base, start, end } => {
                let bt = self.check_expr(base)?;
                let st = self.check_expr(start)?;
                let et = self.check_expr(end)?;
                self.require_integer(&st, location);
                self.require_integer(&et, location);
                match bt {
                    Type::Bytes { .. } => Some(Type::Bytes { size: None }),
                    Type::String => Some(Type::String),
                    other => {
                        self.type_error(location, format!("type {} cannot be sliced", other));
                        None
                    }
                }
            }
            ExprKind::Cast { target, operand } => {
                let target = target.clone();
                let ot = self.check_expr(operand)?;
                let tt = self.resolve_type(&target, Some(location))?;
                if !ot.is_word() || !tt.is_word() {
                    self.type_error(
                        location,
                        format!("cannot cast {} to {}", ot, tt),
                    );
                    return None;
                }
                Some(tt)
            }
            ExprKind::Call { callee, args } => {
                let callee = callee.clone();
                let mut arg_types = Vec::new();
                for arg in args.iter_mut() {
                    arg_types.push(self.check_expr(arg));
                }
                match callee.as_str() {
                    "keccak256" => {
                        if args.len() != 1 {
                            self.bad_builtin(location, "keccak256 takes exactly one argument");
                            return None;
                        }
                        if let Some(Some(ty)) = arg_types.first() {
                            if !ty.is_word() {
                                self.bad_builtin(
                                    location,
                                    format!("keccak256 hashes a single word, found {}", ty),
                                );
                                return None;
                            }
                        }
                        Some(Type::Bytes { size: Some(32) })
                    }
                    "addmod" | "mulmod" => {
                        if args.len() != 3 {
                            self.bad_builtin(
                                location,
                                format!("{} takes exactly three arguments", callee),
                            );
                            return None;
                        }
                        for ty in arg_types.iter().flatten() {
                            self.require_integer(ty, location);
                        }
                        Some(Type::uint256())
                    }
                    _ => {
                        self.diagnostics.push(
                            Diagnostic::error(
                                codes::UNKNOWN_IDENTIFIER,
                                format!("unknown function `{}`", callee),
                            )
                            .at(location),
                        );
                        None
                    }
                }
            }
        }
    }

    fn check_binary(
        &mut self,
        op: BinOp,
        lt: Type,
        rt: Type,
        location: SourceLocation,
    ) -> Option<Type> {
        use BinOp::*;
        match op {
            And | Or => {
                if lt != Type::Bool || rt != Type::Bool {
                    self.type_error(
                        location,
                        format!("logical operator needs bool operands, found {} and {}", lt, rt),
                    );
                    return None;
                }
                Some(Type::Bool)
            }
            Eq | Ne => {
                if !comparable(&lt, &rt) {
                    self.type_error(location, format!("cannot compare {} with {}", lt, rt));
                    return None;
                }
                Some(Type::Bool)
            }
            Lt | Gt | Le | Ge => {
                self.require_integer(&lt, location);
                self.require_integer(&rt, location);
                if lt != rt {
                    self.type_error(location, format!("cannot compare {} with {}", lt, rt));
                    return None;
                }
                Some(Type::Bool)
            }
            Add | Sub | Mul | Div | Mod | BitAnd | BitOr | BitXor => {
                self.require_integer(&lt, location);
                self.require_integer(&rt, location);
                if lt != rt {
                    self.type_error(
                        location,
                        format!("mismatched operand types {} and {}", lt, rt),
                    );
                    return None;
                }
                Some(lt)
            }
            Shl | Shr => {
                self.require_integer(&lt, location);
                self.require_integer(&rt, location);
                Some(lt)
            }
        }
    }

    fn require_integer(&mut self, ty: &Type, location: SourceLocation) {
        if !matches!(ty, Type::Uint { .. } | Type::Int { .. }) {
            self.type_error(location, format!("expected an integer, found {}", ty));
        }
    }

    fn type_error(&mut self, location: SourceLocation, message: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::error(codes::TYPE_MISMATCH, message).at(location));
    }

    fn bad_builtin(&mut self, location: SourceLocation, message: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::error(codes::BAD_BUILTIN, message).at(location));
    }
}

impl Default for TypeChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Equality comparison is allowed between identical word types, and between
/// address and uint256 is not (an explicit cast is required).
fn comparable(a: &Type, b: &Type) -> bool {
    a == b && a.is_word()
}
