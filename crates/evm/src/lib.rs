//! EVM instruction set for the Ember compiler
//!
//! This crate owns everything the compiler knows about the target machine:
//! the opcode table, the instruction type (opcode plus optional push
//! immediate), and the byte serializer. The compiler's code generator builds
//! `Vec<Instruction>` buffers; this crate turns them into deployable bytes.

pub mod instruction;
pub mod opcode;
pub mod serializer;

pub use instruction::Instruction;
pub use opcode::Opcode;
pub use serializer::{calculate_size, serialize, SerializeError};
