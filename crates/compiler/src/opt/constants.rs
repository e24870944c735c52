//! Constant folding and constant propagation
//!
//! Folding evaluates `binary`/`unary`/`cast` over constant word operands in
//! 256-bit wrapping arithmetic. Division and modulo by zero fold to zero,
//! which is what the target machine computes. Signed variants are left
//! unfolded; the machine evaluates them at runtime.
//!
//! Propagation replaces uses of `const`-defined temps with the constant
//! itself and collapses phis whose sources all carry one identical
//! constant. The emptied `const` definitions become dead and fall to DCE.

use crate::ir::{Function, Instruction, IrBinOp, IrUnOp, Literal, TempId, Value};
use alloy_primitives::U256;
use std::collections::HashMap;

/// Fold constant expressions. Returns true when anything changed.
pub fn fold_constants(function: &mut Function) -> bool {
    let mut changed = false;
    for block in function.blocks.values_mut() {
        for instr in &mut block.instructions {
            let folded = match instr {
                Instruction::Binary {
                    dest, op, lhs, rhs, ty,
                } => match (lhs.as_const_word(), rhs.as_const_word()) {
                    (Some(a), Some(b)) => eval_binary(*op, a, b).map(|value| Instruction::Const {
                        dest: *dest,
                        value: Literal::Word(value),
                        ty: ty.clone(),
                    }),
                    _ => None,
                },
                Instruction::Unary {
                    dest, op, operand, ty,
                } => operand.as_const_word().map(|a| Instruction::Const {
                    dest: *dest,
                    value: Literal::Word(eval_unary(*op, a)),
                    ty: ty.clone(),
                }),
                // A cast never changes bits, only the carried type.
                Instruction::Cast { dest, value, ty } => {
                    value.as_const_word().map(|w| Instruction::Const {
                        dest: *dest,
                        value: Literal::Word(w),
                        ty: ty.clone(),
                    })
                }
                _ => None,
            };
            if let Some(folded) = folded {
                *instr = folded;
                changed = true;
            }
        }
    }
    changed
}

fn eval_binary(op: IrBinOp, a: U256, b: U256) -> Option<U256> {
    let bool_word = |v: bool| if v { U256::from(1) } else { U256::ZERO };
    Some(match op {
        IrBinOp::Add => a.wrapping_add(b),
        IrBinOp::Sub => a.wrapping_sub(b),
        IrBinOp::Mul => a.wrapping_mul(b),
        IrBinOp::Div => {
            if b.is_zero() {
                U256::ZERO
            } else {
                a / b
            }
        }
        IrBinOp::Mod => {
            if b.is_zero() {
                U256::ZERO
            } else {
                a % b
            }
        }
        IrBinOp::Lt => bool_word(a < b),
        IrBinOp::Gt => bool_word(a > b),
        IrBinOp::Le => bool_word(a <= b),
        IrBinOp::Ge => bool_word(a >= b),
        IrBinOp::Eq => bool_word(a == b),
        IrBinOp::Ne => bool_word(a != b),
        IrBinOp::And => a & b,
        IrBinOp::Or => a | b,
        IrBinOp::Xor => a ^ b,
        IrBinOp::Shl => {
            if b >= U256::from(256) {
                U256::ZERO
            } else {
                a << b.saturating_to::<usize>()
            }
        }
        IrBinOp::Shr => {
            if b >= U256::from(256) {
                U256::ZERO
            } else {
                a >> b.saturating_to::<usize>()
            }
        }
        // Signed arithmetic is left for the machine.
        IrBinOp::SDiv
        | IrBinOp::SMod
        | IrBinOp::SLt
        | IrBinOp::SGt
        | IrBinOp::SLe
        | IrBinOp::SGe
        | IrBinOp::Sar => {
            return None;
        }
    })
}

fn eval_unary(op: IrUnOp, a: U256) -> U256 {
    match op {
        IrUnOp::IsZero => {
            if a.is_zero() {
                U256::from(1)
            } else {
                U256::ZERO
            }
        }
        IrUnOp::Not => !a,
        IrUnOp::Neg => U256::ZERO.wrapping_sub(a),
    }
}

/// Propagate word constants into uses. Returns true when anything changed.
pub fn propagate_constants(function: &mut Function) -> bool {
    // Collect const-word definitions. Byte constants stay put: codegen
    // materializes them in memory at their definition site.
    let mut consts: HashMap<TempId, Value> = HashMap::new();
    for block in function.blocks.values() {
        for instr in &block.instructions {
            if let Instruction::Const {
                dest,
                value: Literal::Word(w),
                ty,
            } = instr
            {
                consts.insert(
                    *dest,
                    Value::Const {
                        value: Literal::Word(*w),
                        ty: ty.clone(),
                    },
                );
            }
        }
        // A phi whose sources agree on one constant is that constant.
        for phi in &block.phis {
            let mut words = phi.sources.values().map(Value::as_const_word);
            if let Some(Some(first)) = words.next() {
                if words.all(|w| w == Some(first)) {
                    consts.insert(
                        phi.dest,
                        Value::Const {
                            value: Literal::Word(first),
                            ty: phi.ty.clone(),
                        },
                    );
                }
            }
        }
    }
    if consts.is_empty() {
        return false;
    }

    let mut changed = false;
    let mut substitute = |value: &mut Value| {
        if let Value::Temp { id, .. } = value {
            if let Some(constant) = consts.get(id) {
                *value = constant.clone();
                return true;
            }
        }
        false
    };
    for block in function.blocks.values_mut() {
        for phi in &mut block.phis {
            for value in phi.sources.values_mut() {
                changed |= substitute(value);
            }
        }
        for instr in &mut block.instructions {
            for value in instr.operands_mut() {
                changed |= substitute(value);
            }
        }
        if let Some(term) = &mut block.terminator {
            for value in term.operands_mut() {
                changed |= substitute(value);
            }
        }
        // Collapsed phis are dropped; their value now flows as a constant.
        let before = block.phis.len();
        block.phis.retain(|phi| !consts.contains_key(&phi.dest));
        changed |= block.phis.len() != before;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Terminator;
    use crate::types::Type;

    fn function_with(instructions: Vec<Instruction>) -> Function {
        let mut f = Function::new("main");
        let entry = f.entry;
        let block = f.block_mut(entry).unwrap();
        block.instructions = instructions;
        block.terminator = Some(Terminator::Return { value: None });
        f
    }

    fn const_word(dest: u32, v: u64) -> Instruction {
        Instruction::Const {
            dest: TempId(dest),
            value: Literal::Word(U256::from(v)),
            ty: Type::uint256(),
        }
    }

    #[test]
    fn folds_arithmetic() {
        let mut f = function_with(vec![Instruction::Binary {
            dest: TempId(0),
            op: IrBinOp::Add,
            lhs: Value::word(U256::from(2), Type::uint256()),
            rhs: Value::word(U256::from(3), Type::uint256()),
            ty: Type::uint256(),
        }]);
        assert!(fold_constants(&mut f));
        let entry = f.entry;
        match &f.block(entry).unwrap().instructions[0] {
            Instruction::Const {
                value: Literal::Word(w),
                ..
            } => assert_eq!(*w, U256::from(5)),
            other => panic!("expected const, got {}", other),
        }
    }

    #[test]
    fn division_by_zero_folds_to_zero() {
        assert_eq!(
            eval_binary(IrBinOp::Div, U256::from(7), U256::ZERO),
            Some(U256::ZERO)
        );
        assert_eq!(
            eval_binary(IrBinOp::Mod, U256::from(7), U256::ZERO),
            Some(U256::ZERO)
        );
    }

    #[test]
    fn comparisons_fold_to_bool_words() {
        assert_eq!(
            eval_binary(IrBinOp::Lt, U256::from(1), U256::from(2)),
            Some(U256::from(1))
        );
        assert_eq!(
            eval_binary(IrBinOp::Ge, U256::from(1), U256::from(2)),
            Some(U256::ZERO)
        );
    }

    #[test]
    fn wrapping_add_wraps() {
        assert_eq!(
            eval_binary(IrBinOp::Add, U256::MAX, U256::from(1)),
            Some(U256::ZERO)
        );
    }

    #[test]
    fn signed_ops_not_folded() {
        assert_eq!(eval_binary(IrBinOp::SDiv, U256::from(4), U256::from(2)), None);
    }

    #[test]
    fn oversized_shift_folds_to_zero() {
        assert_eq!(
            eval_binary(IrBinOp::Shl, U256::from(1), U256::from(256)),
            Some(U256::ZERO)
        );
    }

    #[test]
    fn propagates_const_into_terminator() {
        let mut f = function_with(vec![const_word(0, 42)]);
        let entry = f.entry;
        f.block_mut(entry).unwrap().terminator = Some(Terminator::Return {
            value: Some(Value::Temp {
                id: TempId(0),
                ty: Type::uint256(),
            }),
        });
        assert!(propagate_constants(&mut f));
        match &f.block(entry).unwrap().terminator {
            Some(Terminator::Return { value: Some(v) }) => {
                assert_eq!(v.as_const_word(), Some(U256::from(42)));
            }
            other => panic!("unexpected terminator {:?}", other),
        }
    }

    #[test]
    fn iszero_folds() {
        assert_eq!(eval_unary(IrUnOp::IsZero, U256::ZERO), U256::from(1));
        assert_eq!(eval_unary(IrUnOp::IsZero, U256::from(3)), U256::ZERO);
    }
}
