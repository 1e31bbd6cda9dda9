//! Canonicalisation.
//!
//! Applies the builder's normal forms across the whole function: constant
//! folding, identity reductions and constant-to-the-right ordering of
//! commutative operands. Later passes assume these forms hold, and the
//! pass is idempotent once a fixed point is reached.

use crate::ir::builder::{fold_int_binary, sign_extend};
use crate::ir::node::{IntOp, NodeData, UnaryOp};
use crate::ir::{Function, Reg};

pub fn canonicalize(f: &mut Function) -> bool {
    let mut changes = 0usize;

    for i in 1..f.len() {
        let r = Reg::from_u32(i);
        let dt = f.node(r).dt;

        let replacement = match f.node(r).data {
            NodeData::IntBinary { op, behavior, a, b } => {
                let ca = f.node(a).data.as_int_const();
                let cb = f.node(b).data.as_int_const();
                if let (Some(x), Some(y)) = (ca, cb) {
                    let v = fold_int_binary(op, behavior, dt, x, y);
                    let signed = matches!(f.node(a).data, NodeData::SintConst { .. })
                        && matches!(f.node(b).data, NodeData::SintConst { .. });
                    if signed {
                        Some(NodeData::SintConst { imm: v as i64 })
                    } else {
                        Some(NodeData::UintConst { imm: v })
                    }
                } else if op.is_commutative() && ca.is_some() {
                    Some(NodeData::IntBinary { op, behavior, a: b, b: a })
                } else {
                    match op {
                        IntOp::Add if cb == Some(0) => Some(NodeData::Pass { value: a }),
                        IntOp::Sub if a == b => Some(NodeData::UintConst { imm: 0 }),
                        IntOp::Sub if cb == Some(0) => Some(NodeData::Pass { value: a }),
                        IntOp::Udiv | IntOp::Sdiv if cb == Some(1) => {
                            Some(NodeData::Pass { value: a })
                        }
                        _ => None,
                    }
                }
            }
            NodeData::Unary { op, value } => {
                let src_dt = f.node(value).dt;
                match (op, f.node(value).data.as_int_const()) {
                    (UnaryOp::Zext, Some(v)) => {
                        Some(NodeData::UintConst { imm: v & src_dt.mask() })
                    }
                    (UnaryOp::Sext, Some(v)) => {
                        let wide = sign_extend(v, src_dt.lane_bits().max(1)) as u64;
                        Some(NodeData::SintConst { imm: (wide & dt.mask()) as i64 })
                    }
                    (UnaryOp::Trunc, Some(v)) if dt.is_int() => {
                        Some(NodeData::UintConst { imm: v & dt.mask() })
                    }
                    (UnaryOp::Not, Some(v)) => {
                        Some(NodeData::UintConst { imm: !v & dt.mask() })
                    }
                    (UnaryOp::Neg, Some(v)) => {
                        Some(NodeData::UintConst { imm: v.wrapping_neg() & dt.mask() })
                    }
                    (UnaryOp::IntToFloat, Some(v)) => {
                        let bits = src_dt.lane_bits().max(1);
                        Some(NodeData::FloatConst { imm: sign_extend(v, bits) as f64 })
                    }
                    (UnaryOp::UintToFloat, Some(v)) => {
                        Some(NodeData::FloatConst { imm: v as f64 })
                    }
                    _ => None,
                }
            }
            _ => None,
        };

        if let Some(data) = replacement {
            log::trace!("{}: canonicalize {r}", f.name);
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
    use crate::ir::types::{I16, I32, I8};
    use crate::ir::{FuncId, Function, Prototype};

    fn func(params: &[crate::ir::DataType]) -> Function {
        Function::new(FuncId::from_u32(0), "c", Prototype::new(params.to_vec(), I32))
    }

    #[test]
    fn folds_raw_constant_adds() {
        let mut f = func(&[]);
        let a = f.uint(I32, 3);
        let b = f.uint(I32, 4);
        let sum = f.make_raw(
            NodeData::IntBinary { op: IntOp::Add, behavior: ArithBehavior::Wrap, a, b },
            I32,
        );
        f.ret(sum);
        assert!(canonicalize(&mut f));
        assert_eq!(f.node(sum).data.as_int_const(), Some(7));
        // A second run changes nothing.
        assert!(!canonicalize(&mut f));
    }

    #[test]
    fn sign_extension_of_constants() {
        let mut f = func(&[]);
        let v = f.uint(I8, 0x80);
        let wide = f.sext(v, I16);
        f.ret(wide);
        assert!(canonicalize(&mut f));
        assert_eq!(f.node(wide).data.as_int_const(), Some(0xFF80));
    }

    #[test]
    fn constant_moves_right_in_whole_function_pass() {
        let mut f = func(&[I32]);
        let p = f.param(0);
        let c = f.uint(I32, 9);
        let mul = f.make_raw(
            NodeData::IntBinary { op: IntOp::Mul, behavior: ArithBehavior::Wrap, a: c, b: p },
            I32,
        );
        f.ret(mul);
        assert!(canonicalize(&mut f));
        match f.node(mul).data {
            NodeData::IntBinary { a, b, .. } => assert_eq!((a, b), (p, c)),
            ref other => panic!("unexpected {other:?}"),
        }
    }
}
