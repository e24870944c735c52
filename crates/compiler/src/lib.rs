//! Ember Compiler Library
//!
//! Compiles Ember source (a small imperative smart-contract language) to
//! EVM bytecode through a fixed pipeline:
//!
//! ```text
//! parse → typecheck → IR build → phi insertion → optimize (fixed point)
//!       → liveness → memory plan → block layout → code generate → serialize
//! ```
//!
//! Each pass is a pure function from inputs to outputs plus diagnostics;
//! passes accumulate diagnostics rather than short-circuiting, so one run
//! surfaces as many problems as possible. A pass fails only when its
//! output cannot be constructed at all.
//!
//! The single entry point is [`compile`]:
//!
//! ```rust
//! use emberc::{compile, Artifact, CompileOptions, EmitTarget};
//!
//! let options = CompileOptions {
//!     to: EmitTarget::Bytecode,
//!     source: "name Counter; code { }".into(),
//!     source_path: "counter.mb".into(),
//!     optimizer_level: 1,
//! };
//! let output = compile(&options).expect("compiles");
//! let Artifact::Bytecode(bytecode) = output.artifact else { panic!() };
//! assert!(bytecode.runtime.is_empty());
//! ```

pub mod ast;
pub mod codegen;
pub mod diagnostics;
pub mod format;
pub mod ir;
pub mod lexer;
pub mod opt;
pub mod parser;
pub mod typechecker;
pub mod types;

pub use codegen::BytecodeArtifact;
pub use diagnostics::{Diagnostic, Severity};
pub use format::OutputFormat;
pub use parser::Parser;
pub use typechecker::{Symbols, TypeChecker};

use crate::ast::Program;
use crate::diagnostics::has_errors;
use crate::ir::Module;
use tracing::debug;

/// Which artifact [`compile`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitTarget {
    Ast,
    Ir,
    Bytecode,
}

/// Compilation options. `source_path` is used only in diagnostics.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub to: EmitTarget,
    pub source: String,
    pub source_path: String,
    /// 0 disables the optimizer; 1 adds constant folding, propagation and
    /// DCE; 2 adds CSE and jump optimization and re-runs to a fixed
    /// point; 3 adds block and return merging.
    pub optimizer_level: u8,
}

/// The requested artifact.
#[derive(Debug)]
pub enum Artifact {
    Ast(Program),
    Ir(Module),
    Bytecode(BytecodeArtifact),
}

/// Successful compilation: the artifact plus non-fatal warnings.
#[derive(Debug)]
pub struct CompileOutput {
    pub artifact: Artifact,
    pub warnings: Vec<Diagnostic>,
}

/// Parse and type-check; the frontend half of the pipeline. The program
/// is `None` only when parsing could not produce one at all.
pub fn frontend(source: &str) -> (Option<(Program, Symbols)>, Vec<Diagnostic>) {
    let (program, mut diagnostics) = Parser::new(source).parse();
    let Some(mut program) = program else {
        return (None, diagnostics);
    };
    let (symbols, mut type_diags) = TypeChecker::new().check(&mut program);
    diagnostics.append(&mut type_diags);
    (Some((program, symbols)), diagnostics)
}

/// Build the optimized IR module for a checked program.
pub fn build_ir(
    program: &Program,
    symbols: &Symbols,
    optimizer_level: u8,
) -> (Module, Vec<Diagnostic>) {
    let (mut module, diagnostics) = ir::builder::build(program, symbols);
    ir::ssa::insert_phis(&mut module);
    opt::optimize(&mut module, optimizer_level);
    (module, diagnostics)
}

/// Compile `options.source` to the requested artifact.
///
/// On failure the full accumulated diagnostic list is returned, warnings
/// included, so callers can render everything at once.
pub fn compile(options: &CompileOptions) -> Result<CompileOutput, Vec<Diagnostic>> {
    debug!(path = %options.source_path, to = ?options.to, "compiling");
    let (parsed, mut diagnostics) = frontend(&options.source);
    let Some((program, symbols)) = parsed else {
        return Err(diagnostics);
    };
    if has_errors(&diagnostics) {
        return Err(diagnostics);
    }

    if options.to == EmitTarget::Ast {
        return Ok(CompileOutput {
            artifact: Artifact::Ast(program),
            warnings: diagnostics,
        });
    }

    let (module, mut build_diags) = build_ir(&program, &symbols, options.optimizer_level);
    diagnostics.append(&mut build_diags);
    if has_errors(&diagnostics) {
        return Err(diagnostics);
    }

    if options.to == EmitTarget::Ir {
        return Ok(CompileOutput {
            artifact: Artifact::Ir(module),
            warnings: diagnostics,
        });
    }

    match codegen::generate(&module) {
        Ok(artifact) => {
            diagnostics.extend(artifact.warnings.iter().cloned());
            Ok(CompileOutput {
                artifact: Artifact::Bytecode(artifact),
                warnings: diagnostics,
            })
        }
        Err(mut errors) => {
            diagnostics.append(&mut errors);
            Err(diagnostics)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::codes;
    use ember_evm::Opcode;

    fn options(source: &str, to: EmitTarget, level: u8) -> CompileOptions {
        CompileOptions {
            to,
            source: source.into(),
            source_path: "test.mb".into(),
            optimizer_level: level,
        }
    }

    #[test]
    fn scenario_minimal_empty_program() {
        let out = compile(&options("name X; code {}", EmitTarget::Bytecode, 0)).unwrap();
        let Artifact::Bytecode(bytecode) = out.artifact else {
            panic!()
        };
        assert_eq!(bytecode.runtime.len(), 0);
        assert_eq!(
            bytecode.create_instructions.last().map(|i| i.opcode),
            Some(Opcode::Return)
        );
    }

    #[test]
    fn scenario_single_constant_return() {
        let out = compile(&options(
            "name X; code -> uint256 { let x = 42; return x; }",
            EmitTarget::Bytecode,
            0,
        ))
        .unwrap();
        let Artifact::Bytecode(bytecode) = out.artifact else {
            panic!()
        };
        let instrs = &bytecode.runtime_instructions;
        assert!(instrs
            .iter()
            .any(|i| i.opcode == Opcode::Push1 && i.immediate.as_deref() == Some(&[0x2a][..])));
        assert!(instrs.iter().any(|i| i.opcode == Opcode::Mstore));
        assert!(instrs.iter().any(|i| i.opcode == Opcode::Return));
    }

    #[test]
    fn ast_target_returns_ast() {
        let out = compile(&options("name X; code {}", EmitTarget::Ast, 0)).unwrap();
        assert!(matches!(out.artifact, Artifact::Ast(p) if p.name == "X"));
    }

    #[test]
    fn ir_target_returns_module() {
        let out = compile(&options(
            "name X; code -> uint256 { return 7; }",
            EmitTarget::Ir,
            0,
        ))
        .unwrap();
        let Artifact::Ir(module) = out.artifact else {
            panic!()
        };
        assert!(module.main().is_some());
    }

    #[test]
    fn type_errors_fail_compilation() {
        let err = compile(&options(
            "name X; code { let x = nope; }",
            EmitTarget::Bytecode,
            0,
        ))
        .unwrap_err();
        assert!(err.iter().any(|d| d.code == codes::UNKNOWN_IDENTIFIER));
    }

    #[test]
    fn parse_errors_fail_compilation() {
        let err = compile(&options("code {}", EmitTarget::Bytecode, 0)).unwrap_err();
        assert!(err.iter().any(|d| d.code == codes::EXPECTED_DECLARATION));
    }

    #[test]
    fn optimizer_levels_shrink_or_hold_instruction_count() {
        let source = "name X;\nstorage { total: uint256; }\ncode -> uint256 {\n  let a = 2 + 3;\n  let b = a * 4;\n  if (b > 10) { total = b; } else { total = a; }\n  return total;\n}";
        let mut counts = Vec::new();
        for level in 0..=3u8 {
            let out = compile(&options(source, EmitTarget::Bytecode, level)).unwrap();
            let Artifact::Bytecode(bytecode) = out.artifact else {
                panic!()
            };
            counts.push(bytecode.runtime_instructions.len());
        }
        for pair in counts.windows(2) {
            assert!(pair[1] <= pair[0], "counts: {:?}", counts);
        }
    }

    #[test]
    fn warnings_do_not_fail_compilation() {
        let out = compile(&options(
            "name X;\nstorage { data: bytes; }\ncode { let n = data.length; }",
            EmitTarget::Bytecode,
            0,
        ))
        .unwrap();
        assert!(out
            .warnings
            .iter()
            .any(|w| w.code == codes::SHORT_STRING_LENGTH));
    }

    #[test]
    fn signed_le_compiles_to_sgt_iszero() {
        // -1 <= 0 over int256 is true. The two's-complement pattern of -1
        // is 2^256-1, so an unsigned GT would call it greater than 0 and
        // the ISZERO would flip the answer to false; the emitted code must
        // compare with SGT.
        let out = compile(&options(
            "name X; code -> bool { let a = int256(0) - int256(1); return a <= int256(0); }",
            EmitTarget::Bytecode,
            0,
        ))
        .unwrap();
        let Artifact::Bytecode(bytecode) = out.artifact else {
            panic!()
        };
        let instrs = &bytecode.runtime_instructions;
        assert!(instrs.iter().any(|i| i.opcode == Opcode::Sgt));
        assert!(instrs.iter().any(|i| i.opcode == Opcode::Iszero));
        assert!(!instrs.iter().any(|i| i.opcode == Opcode::Gt));
    }

    #[test]
    fn signed_ge_compiles_to_slt_iszero() {
        let out = compile(&options(
            "name X; code -> bool { let a = int256(0) - int256(1); return a >= int256(0); }",
            EmitTarget::Bytecode,
            0,
        ))
        .unwrap();
        let Artifact::Bytecode(bytecode) = out.artifact else {
            panic!()
        };
        let instrs = &bytecode.runtime_instructions;
        assert!(instrs.iter().any(|i| i.opcode == Opcode::Slt));
        assert!(instrs.iter().any(|i| i.opcode == Opcode::Iszero));
        assert!(!instrs.iter().any(|i| i.opcode == Opcode::Lt));
    }

    #[test]
    fn signed_shift_compiles_to_sar() {
        // -4 >> 1 over int256 is -2: the shift must sign-fill. A logical
        // SHR would zero-fill the top bit and produce a huge positive
        // word instead.
        let out = compile(&options(
            "name X; code -> int256 { let a = int256(0) - int256(4); return a >> 1; }",
            EmitTarget::Bytecode,
            0,
        ))
        .unwrap();
        let Artifact::Bytecode(bytecode) = out.artifact else {
            panic!()
        };
        let instrs = &bytecode.runtime_instructions;
        assert!(instrs.iter().any(|i| i.opcode == Opcode::Sar));
        assert!(!instrs.iter().any(|i| i.opcode == Opcode::Shr));
    }

    #[test]
    fn optimized_constant_branch_collapses() {
        let out = compile(&options(
            "name X; code -> uint256 { if (1) { return 7; } return 8; }",
            EmitTarget::Bytecode,
            2,
        ))
        .unwrap();
        let Artifact::Bytecode(bytecode) = out.artifact else {
            panic!()
        };
        assert!(!bytecode
            .runtime_instructions
            .iter()
            .any(|i| i.opcode == Opcode::Jumpi));
    }
}
