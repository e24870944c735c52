//! Abstract Syntax Tree for Ember
//!
//! The parser produces this tree with every expression's `ty` slot empty;
//! the type checker fills the slots in place. Downstream passes (the IR
//! builder) require annotated trees and treat a missing annotation as an
//! internal error.

use crate::diagnostics::SourceLocation;
use crate::types::Type;
use alloy_primitives::U256;
use serde::Serialize;

/// A complete parsed program: one `name` declaration, struct definitions,
/// an ordered storage block, an optional `create` block and the `code`
/// block.
#[derive(Debug, Clone, Serialize)]
pub struct Program {
    pub name: String,
    pub structs: Vec<StructDef>,
    pub storage: Vec<StorageDecl>,
    pub create: Option<Block>,
    pub code: Option<CodeBlock>,
}

impl Program {
    pub fn new(name: String) -> Self {
        Program {
            name,
            structs: Vec::new(),
            storage: Vec::new(),
            create: None,
            code: None,
        }
    }
}

/// `struct Point { x: uint256; y: uint256; }`
#[derive(Debug, Clone, Serialize)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<(String, TypeExpr)>,
    pub location: SourceLocation,
}

/// One declaration inside the `storage { … }` block. Slots are assigned in
/// declaration order starting at 0.
#[derive(Debug, Clone, Serialize)]
pub struct StorageDecl {
    pub slot: usize,
    pub name: String,
    pub ty: TypeExpr,
    pub location: SourceLocation,
}

/// The runtime entry block with its optional declared return type:
/// `code -> uint256 { … }`.
#[derive(Debug, Clone, Serialize)]
pub struct CodeBlock {
    pub returns: Option<TypeExpr>,
    pub body: Block,
}

/// A type as written in source; resolved to a semantic [`Type`] by the
/// type checker (struct names need the definition table).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TypeExpr {
    Uint(u16),
    Int(u16),
    Address,
    Bool,
    Bytes(Option<usize>),
    String,
    Array(Box<TypeExpr>, Option<usize>),
    Mapping(Box<TypeExpr>, Box<TypeExpr>),
    Named(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Block {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, Serialize)]
pub enum Statement {
    /// `let x: T = e;`
    Let {
        name: String,
        ty: Option<TypeExpr>,
        value: Expr,
        location: SourceLocation,
    },
    /// `lvalue = e;`
    Assign {
        target: Expr,
        value: Expr,
        location: SourceLocation,
    },
    If {
        condition: Expr,
        then_branch: Block,
        else_branch: Option<Block>,
        location: SourceLocation,
    },
    While {
        condition: Expr,
        body: Block,
        location: SourceLocation,
    },
    /// `for (init; condition; update) { body }`
    For {
        init: Box<Statement>,
        condition: Expr,
        update: Box<Statement>,
        body: Block,
        location: SourceLocation,
    },
    Break {
        location: SourceLocation,
    },
    Continue {
        location: SourceLocation,
    },
    Return {
        value: Option<Expr>,
        location: SourceLocation,
    },
    /// Bare expression statement (value discarded).
    Expr { expr: Expr },
}

/// Binary operators, source-level. Comparison operators produce `bool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnOp {
    Not,
    Neg,
    BitNot,
}

/// Environment queries exposed by the language surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvField {
    MsgSender,
    MsgValue,
    MsgData,
    BlockNumber,
    BlockTimestamp,
}

/// An expression with its source span and (post-typecheck) type.
#[derive(Debug, Clone, Serialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: SourceLocation,
    /// Filled by the type checker.
    pub ty: Option<Type>,
}

impl Expr {
    pub fn new(kind: ExprKind, location: SourceLocation) -> Self {
        Expr {
            kind,
            location,
            ty: None,
        }
    }

    /// The annotated type. Only valid after the checker ran; the IR builder
    /// surfaces a diagnostic (not a panic) when the slot is empty.
    pub fn annotated(&self) -> Option<&Type> {
        self.ty.as_ref()
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum ExprKind {
    /// Numeric literal (decimal or hex) as a 256-bit word.
    Number(U256),
    Bool(bool),
    /// `"text"` literal.
    Str(String),
    /// `hex"…"` literal.
    HexBytes(Vec<u8>),
    Ident(String),
    Env(EnvField),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// `base[index]`
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    /// `base.field`; also carries `.length` before the checker classifies
    /// it.
    Member {
        base: Box<Expr>,
        field: String,
    },
    /// `base[start:end]`
    Slice {
        base: Box<Expr>,
        start: Box<Expr>,
        end: Box<Expr>,
    },
    /// `callee(args...)`: builtins (`keccak256`, `addmod`, `mulmod`) and
    /// type casts (`uint128(x)`) both parse as calls; the checker
    /// disambiguates.
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    /// A cast recognized by the type checker: `uint128(x)`, `address(x)`.
    Cast {
        target: TypeExpr,
        operand: Box<Expr>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expr_starts_unannotated() {
        let e = Expr::new(ExprKind::Number(U256::from(7)), SourceLocation::new(0, 0));
        assert!(e.annotated().is_none());
    }

    #[test]
    fn program_defaults_empty() {
        let p = Program::new("Test".into());
        assert!(p.storage.is_empty());
        assert!(p.create.is_none());
        assert!(p.code.is_none());
    }
}
