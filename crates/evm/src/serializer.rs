//! Bytecode serialization
//!
//! Encodes an instruction buffer into the byte stream the VM executes. The
//! size calculation is exposed separately so deployment-wrapper sizing can
//! measure without allocating output.

use crate::instruction::Instruction;

/// Serialization failure: an immediate whose length disagrees with its
/// opcode's declared width. This is an internal consistency error, it can
/// only come from a bug in the emitter.
#[derive(Debug, PartialEq, Eq)]
pub struct SerializeError {
    pub index: usize,
    pub message: String,
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instruction {}: {}", self.index, self.message)
    }
}

impl std::error::Error for SerializeError {}

/// Total encoded size of `instructions` in bytes, without allocating.
pub fn calculate_size(instructions: &[Instruction]) -> usize {
    instructions.iter().map(Instruction::size).sum()
}

/// Encode the buffer: opcode byte followed by exactly
/// `opcode.immediate_len()` immediate bytes per instruction.
pub fn serialize(instructions: &[Instruction]) -> Result<Vec<u8>, SerializeError> {
    let mut bytes = Vec::with_capacity(calculate_size(instructions));
    for (index, instr) in instructions.iter().enumerate() {
        let want = instr.opcode.immediate_len();
        let got = instr.immediate.as_ref().map_or(0, Vec::len);
        if want != got {
            return Err(SerializeError {
                index,
                message: format!(
                    "{} expects {} immediate bytes, found {}",
                    instr.opcode, want, got
                ),
            });
        }
        bytes.push(instr.opcode.byte());
        if let Some(imm) = &instr.immediate {
            bytes.extend_from_slice(imm);
        }
    }
    Ok(bytes)
}
