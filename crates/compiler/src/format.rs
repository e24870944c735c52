//! Artifact rendering: text, JSON and asm output formats

use crate::ast::Program;
use crate::codegen::BytecodeArtifact;
use crate::ir::Module;
use ember_evm::Instruction;
use serde::Serialize;
use serde_json::json;

/// Output format selected by `-f/--format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Asm,
}

fn to_json<T: Serialize>(value: &T, pretty: bool) -> String {
    let result = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    // Serialization of our own artifact types cannot fail.
    result.unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
}

/// Render a parsed program.
pub fn render_ast(program: &Program, format: OutputFormat, pretty: bool) -> String {
    match format {
        OutputFormat::Json => to_json(program, pretty),
        // The AST has no dedicated text or asm form; a pretty JSON dump
        // is the readable fallback.
        OutputFormat::Text | OutputFormat::Asm => to_json(program, true),
    }
}

/// Render an IR module.
pub fn render_ir(module: &Module, format: OutputFormat, pretty: bool) -> String {
    match format {
        OutputFormat::Text | OutputFormat::Asm => module.to_string(),
        OutputFormat::Json => to_json(module, pretty),
    }
}

/// One listing line per instruction: `OFFSET: MNEMONIC 0xIMM`.
fn asm_listing(instructions: &[Instruction]) -> String {
    let mut out = String::new();
    let mut offset = 0usize;
    for instr in instructions {
        out.push_str(&format!("{:04x}: {}\n", offset, instr));
        offset += instr.size();
    }
    out
}

fn instructions_json(instructions: &[Instruction]) -> serde_json::Value {
    serde_json::Value::Array(
        instructions
            .iter()
            .map(|i| match &i.immediate {
                Some(imm) => json!({
                    "mnemonic": i.opcode.mnemonic(),
                    "immediate": format!("0x{}", hex::encode(imm)),
                }),
                None => json!({ "mnemonic": i.opcode.mnemonic() }),
            })
            .collect(),
    )
}

/// Render the bytecode artifact.
pub fn render_bytecode(artifact: &BytecodeArtifact, format: OutputFormat, pretty: bool) -> String {
    match format {
        OutputFormat::Text => {
            let mut out = String::new();
            out.push_str(&format!("runtime: 0x{}\n", hex::encode(&artifact.runtime)));
            out.push_str(&format!("create:  0x{}\n", hex::encode(&artifact.create)));
            out
        }
        OutputFormat::Asm => {
            let mut out = String::new();
            out.push_str("; runtime\n");
            out.push_str(&asm_listing(&artifact.runtime_instructions));
            out.push_str("\n; create\n");
            out.push_str(&asm_listing(&artifact.create_instructions));
            out
        }
        OutputFormat::Json => {
            let value = json!({
                "runtime": format!("0x{}", hex::encode(&artifact.runtime)),
                "create": format!("0x{}", hex::encode(&artifact.create)),
                "runtimeInstructions": instructions_json(&artifact.runtime_instructions),
                "createInstructions": instructions_json(&artifact.create_instructions),
            });
            if pretty {
                serde_json::to_string_pretty(&value).unwrap_or_default()
            } else {
                value.to_string()
            }
        }
    }
}
