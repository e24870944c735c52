//! Instructions: an opcode plus its immediate bytes
//!
//! The code generator works with `Vec<Instruction>` buffers so jump targets
//! can be patched by index before serialization. Immediates exist only for
//! the PUSH family; everything else carries `None`.

use crate::opcode::Opcode;
use alloy_primitives::U256;
use serde::Serialize;

/// A single EVM instruction as held in the emission buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instruction {
    /// Mnemonic-bearing opcode.
    pub opcode: Opcode,
    /// Immediate bytes, present exactly when `opcode.immediate_len() > 0`.
    /// Length must equal `opcode.immediate_len()`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub immediate: Option<Vec<u8>>,
}

impl Instruction {
    /// A plain instruction with no immediate.
    pub fn new(opcode: Opcode) -> Self {
        debug_assert_eq!(opcode.immediate_len(), 0);
        Instruction {
            opcode,
            immediate: None,
        }
    }

    /// A push of `value` using the minimal representation: `PUSH0` for zero,
    /// otherwise `PUSHn` where `n` is the byte length of the value.
    pub fn push_value(value: U256) -> Self {
        if value.is_zero() {
            return Instruction {
                opcode: Opcode::Push0,
                immediate: None,
            };
        }
        let be = value.to_be_bytes::<32>();
        let skip = be.iter().take_while(|b| **b == 0).count();
        let imm = be[skip..].to_vec();
        Instruction {
            opcode: Opcode::push(imm.len()),
            immediate: Some(imm),
        }
    }

    /// A push of a small machine integer (offsets, sizes, slot numbers).
    pub fn push_usize(value: usize) -> Self {
        Self::push_value(U256::from(value))
    }

    /// A `PUSH2` placeholder for a jump target patched after block emission.
    /// The immediate starts as `0x0000` and is rewritten by the patcher.
    pub fn push2_placeholder() -> Self {
        Instruction {
            opcode: Opcode::Push2,
            immediate: Some(vec![0, 0]),
        }
    }

    /// Rewrite the immediate of a `PUSH2` with a big-endian code offset.
    ///
    /// Panics if this is not a PUSH2: patching anything else is a compiler
    /// bug, not a recoverable condition.
    pub fn patch_push2(&mut self, offset: u16) {
        assert_eq!(self.opcode, Opcode::Push2, "patch target must be a PUSH2");
        self.immediate = Some(offset.to_be_bytes().to_vec());
    }

    /// Encoded size in bytes: opcode byte plus immediate bytes.
    pub fn size(&self) -> usize {
        1 + self.opcode.immediate_len()
    }
}

impl std::fmt::Display for Instruction {
    /// Assembly form: `MNEMONIC` or `MNEMONIC 0xIMM`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.immediate {
            Some(imm) => write!(f, "{} 0x{}", self.opcode, hex::encode(imm)),
            None => write!(f, "{}", self.opcode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_zero_is_push0() {
        let i = Instruction::push_value(U256::ZERO);
        assert_eq!(i.opcode, Opcode::Push0);
        assert_eq!(i.immediate, None);
        assert_eq!(i.size(), 1);
    }

    #[test]
    fn push_minimal_width() {
        let i = Instruction::push_value(U256::from(0x2a));
        assert_eq!(i.opcode, Opcode::Push1);
        assert_eq!(i.immediate.as_deref(), Some(&[0x2a][..]));

        let i = Instruction::push_value(U256::from(0x1234));
        assert_eq!(i.opcode, Opcode::Push2);
        assert_eq!(i.immediate.as_deref(), Some(&[0x12, 0x34][..]));

        let i = Instruction::push_value(U256::from(0x0100));
        assert_eq!(i.opcode, Opcode::Push2);
        assert_eq!(i.immediate.as_deref(), Some(&[0x01, 0x00][..]));
    }

    #[test]
    fn push_full_word() {
        let i = Instruction::push_value(U256::MAX);
        assert_eq!(i.opcode, Opcode::Push32);
        assert_eq!(i.immediate.as_ref().unwrap().len(), 32);
    }

    #[test]
    fn placeholder_patches_big_endian() {
        let mut i = Instruction::push2_placeholder();
        assert_eq!(i.immediate.as_deref(), Some(&[0, 0][..]));
        i.patch_push2(0x0102);
        assert_eq!(i.immediate.as_deref(), Some(&[0x01, 0x02][..]));
    }

    #[test]
    fn display_asm_form() {
        assert_eq!(Instruction::new(Opcode::Caller).to_string(), "CALLER");
        assert_eq!(
            Instruction::push_value(U256::from(0x2a)).to_string(),
            "PUSH1 0x2a"
        );
    }
}
