//! Deployment wrapping
//!
//! The deployment bytecode is `constructor ‖ stub ‖ runtime`. The stub
//! copies the runtime into memory and returns it:
//!
//! ```text
//! PUSH runtime_len
//! PUSH runtime_offset   ; constructor + stub length
//! PUSH0                 ; memory destination
//! CODECOPY
//! PUSH runtime_len
//! PUSH0
//! RETURN
//! ```
//!
//! `runtime_offset` includes the stub's own length, and the PUSH widths of
//! the offset depend on its value, so the stub size is found by fixed-point
//! iteration: guess zero, emit, measure, repeat until stable.

use alloy_primitives::U256;
use ember_evm::{calculate_size, serialize, Instruction, Opcode, SerializeError};

/// Build the full deployment artifact from the compiled constructor body
/// (may be empty) and the serialized runtime. Returns the complete
/// instruction listing and the deployment bytes.
pub fn wrap(
    constructor: &[Instruction],
    runtime: &[u8],
) -> Result<(Vec<Instruction>, Vec<u8>), SerializeError> {
    let constructor_size = calculate_size(constructor);
    let stub = build_stub(constructor_size, runtime.len());

    let mut instructions: Vec<Instruction> = constructor.to_vec();
    instructions.extend(stub);

    let mut bytes = serialize(&instructions)?;
    bytes.extend_from_slice(runtime);
    Ok((instructions, bytes))
}

/// The stub for a runtime of `runtime_len` bytes placed after
/// `constructor_size` bytes of constructor code.
fn build_stub(constructor_size: usize, runtime_len: usize) -> Vec<Instruction> {
    // The offset push width depends on the stub size, which depends on
    // the offset push width. Iterate from a zero guess until stable; the
    // width can only grow, so this terminates in a couple of rounds.
    let mut stub_size = 0usize;
    loop {
        let stub = stub_for(constructor_size + stub_size, runtime_len);
        let measured = calculate_size(&stub);
        if measured == stub_size {
            return stub;
        }
        stub_size = measured;
    }
}

fn stub_for(runtime_offset: usize, runtime_len: usize) -> Vec<Instruction> {
    vec![
        Instruction::push_value(U256::from(runtime_len)),
        Instruction::push_value(U256::from(runtime_offset)),
        Instruction::push_value(U256::ZERO),
        Instruction::new(Opcode::Codecopy),
        Instruction::push_value(U256::from(runtime_len)),
        Instruction::push_value(U256::ZERO),
        Instruction::new(Opcode::Return),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_runtime_wraps_to_stub_only() {
        let (instructions, bytes) = wrap(&[], &[]).unwrap();
        assert_eq!(
            instructions.last().map(|i| i.opcode),
            Some(Opcode::Return)
        );
        assert_eq!(bytes.len(), calculate_size(&instructions));
        // PUSH0 len, PUSH offset, PUSH0, CODECOPY, PUSH0 len, PUSH0, RETURN
        assert!(instructions.iter().any(|i| i.opcode == Opcode::Codecopy));
    }

    #[test]
    fn stub_size_fixed_point_is_stable() {
        for runtime_len in [0usize, 1, 255, 256, 65535, 70000] {
            let stub = build_stub(0, runtime_len);
            let size = calculate_size(&stub);
            // Re-deriving with the measured size reproduces the stub.
            let again = stub_for(size, runtime_len);
            assert_eq!(calculate_size(&again), size, "len {}", runtime_len);
        }
    }

    #[test]
    fn runtime_offset_points_at_runtime() {
        let runtime = vec![0x5b, 0x00]; // JUMPDEST, STOP
        let (instructions, bytes) = wrap(&[], &runtime).unwrap();
        // The second push is the runtime offset.
        let offset_push = &instructions[1];
        let offset = offset_push
            .immediate
            .as_ref()
            .map(|imm| imm.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
            .unwrap_or(0);
        assert_eq!(&bytes[offset..], &runtime[..]);
    }

    #[test]
    fn constructor_prefix_precedes_stub() {
        let constructor = vec![
            Instruction::push_value(U256::from(1)),
            Instruction::push_value(U256::ZERO),
            Instruction::new(Opcode::Sstore),
        ];
        let runtime = vec![0x00];
        let (instructions, bytes) = wrap(&constructor, &runtime).unwrap();
        assert_eq!(instructions[0].opcode, Opcode::Push1);
        assert_eq!(instructions[2].opcode, Opcode::Sstore);
        // Runtime trails the serialized constructor+stub.
        assert_eq!(*bytes.last().unwrap(), 0x00);
        let offset_push = &instructions[4];
        let offset = offset_push
            .immediate
            .as_ref()
            .map(|imm| imm.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
            .unwrap_or(0);
        assert_eq!(offset, bytes.len() - runtime.len());
    }

    #[test]
    fn deployment_size_matches_remeasure() {
        let runtime = vec![0xfe; 300];
        let (instructions, bytes) = wrap(&[], &runtime).unwrap();
        let deployment_size = calculate_size(&instructions);
        assert_eq!(bytes.len(), deployment_size + runtime.len());
        assert_eq!(serialize(&instructions).unwrap().len(), deployment_size);
    }
}
