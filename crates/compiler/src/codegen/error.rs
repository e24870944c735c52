//! Code generation error types.

use crate::diagnostics::{codes, Diagnostic};

/// Fatal code-generation failure.
///
/// Soft conditions (slice of storage, unknown call targets) are reported as
/// warnings and code generation continues; this type is reserved for
/// conditions where the emitted bytecode would be wrong: a jump target with
/// no recorded offset, a stack-shape violation, or a value with no
/// allocation to load from.
#[derive(Debug)]
pub enum CodegenError {
    /// A jump target had no offset at patch time.
    MissingJumpTarget(String),
    /// The typed stack model rejected an emission sequence.
    StackShape(String),
    /// An operand had neither a stack slot nor a memory allocation.
    UnallocatedValue(String),
    /// A phi had no source for the emitting predecessor.
    UnresolvedPhi(String),
}

impl CodegenError {
    /// The stable diagnostic code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            CodegenError::MissingJumpTarget(_) => codes::MISSING_JUMP_TARGET,
            CodegenError::StackShape(_) => codes::STACK_SHAPE,
            CodegenError::UnallocatedValue(_) => codes::UNALLOCATED_VALUE,
            CodegenError::UnresolvedPhi(_) => codes::UNRESOLVED_PHI,
        }
    }

    pub fn into_diagnostic(self) -> Diagnostic {
        let code = self.code();
        Diagnostic::error(code, self.to_string())
    }
}

impl std::fmt::Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodegenError::MissingJumpTarget(s) => write!(f, "missing jump target: {}", s),
            CodegenError::StackShape(s) => write!(f, "stack shape violation: {}", s),
            CodegenError::UnallocatedValue(s) => write!(f, "unallocated value: {}", s),
            CodegenError::UnresolvedPhi(s) => write!(f, "unresolved phi source: {}", s),
        }
    }
}

impl std::error::Error for CodegenError {}
