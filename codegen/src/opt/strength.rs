//! Strength reduction.
//!
//! Multiplications and unsigned divisions by powers of two become shifts,
//! and the trivial multiplier cases collapse. The shift amount is written
//! over the multiplier's constant node, which is only legal when this
//! instruction is its sole user.

use crate::ir::node::{IntOp, NodeData};
use crate::ir::{Function, Reg};

pub fn strength_reduce(f: &mut Function) -> bool {
    let use_counts = f.use_counts();
    let mut changes = 0usize;

    for i in 1..f.len() {
        let r = Reg::from_u32(i);
        let NodeData::IntBinary { op, behavior, a, b } = f.node(r).data else {
            continue;
        };
        let Some(c) = f.node(b).data.as_int_const() else {
            continue;
        };

        let replacement = match op {
            IntOp::Mul if c == 0 => Some(NodeData::UintConst { imm: 0 }),
            IntOp::Mul if c == 1 => Some(NodeData::Pass { value: a }),
            IntOp::Mul if c.is_power_of_two() && use_counts[b.index()] == 1 => {
                let shift = c.trailing_zeros() as u64;
                f.node_mut(b).data = NodeData::UintConst { imm: shift };
                Some(NodeData::IntBinary { op: IntOp::Shl, behavior, a, b })
            }
            IntOp::Udiv if c.is_power_of_two() && c > 1 && use_counts[b.index()] == 1 => {
                let shift = c.trailing_zeros() as u64;
                f.node_mut(b).data = NodeData::UintConst { imm: shift };
                Some(NodeData::IntBinary { op: IntOp::Shr, behavior, a, b })
            }
            IntOp::Shl | IntOp::Shr | IntOp::Sar if c == 0 => {
                Some(NodeData::Pass { value: a })
            }
            _ => None,
        };

        if let Some(data) = replacement {
            log::trace!("{}: strength-reduce {r}", f.name);
            f.node_mut(r).data = data;
            changes += 1;
        }
    }

    changes > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::ArithBehavior;
    use crate::ir::types::I32;
    use crate::ir::{FuncId, Function, Prototype};

    #[test]
    fn multiply_by_power_of_two_becomes_shift() {
        let mut f =
            Function::new(FuncId::from_u32(0), "s", Prototype::new(vec![I32], I32));
        let p = f.param(0);
        let eight = f.uint(I32, 8);
        let prod = f.mul(p, eight, ArithBehavior::Wrap);
        f.ret(prod);

        assert!(strength_reduce(&mut f));
        match f.node(prod).data {
            NodeData::IntBinary { op: IntOp::Shl, a, b, .. } => {
                assert_eq!(a, p);
                assert_eq!(f.node(b).data.as_int_const(), Some(3));
            }
            ref other => panic!("expected shift, got {other:?}"),
        }
    }

    #[test]
    fn multiply_by_zero_and_one() {
        let mut f =
            Function::new(FuncId::from_u32(0), "s", Prototype::new(vec![I32], I32));
        let p = f.param(0);
        let zero = f.uint(I32, 0);
        let one = f.uint(I32, 1);
        let a = f.mul(p, zero, ArithBehavior::Wrap);
        let b = f.mul(p, one, ArithBehavior::Wrap);
        let sum = f.add(a, b, ArithBehavior::Wrap);
        f.ret(sum);

        assert!(strength_reduce(&mut f));
        assert_eq!(f.node(a).data.as_int_const(), Some(0));
        assert!(matches!(f.node(b).data, NodeData::Pass { .. }));
    }

    #[test]
    fn shared_constant_is_left_alone() {
        let mut f =
            Function::new(FuncId::from_u32(0), "s", Prototype::new(vec![I32, I32], I32));
        let (p, q) = (f.param(0), f.param(1));
        let four = f.uint(I32, 4);
        let a = f.mul(p, four, ArithBehavior::Wrap);
        let b = f.add(q, four, ArithBehavior::Wrap);
        let sum = f.add(a, b, ArithBehavior::Wrap);
        f.ret(sum);

        // The constant feeds two instructions, so the multiply must not
        // repurpose it as a shift amount.
        assert!(!strength_reduce(&mut f));
    }
}
