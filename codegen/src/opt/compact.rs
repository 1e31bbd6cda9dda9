//! Register compaction.
//!
//! Rebuilds the node stream without `Nop` and `Pass` nodes, renumbering
//! every register and rewriting every operand. Uses of a `Pass` collapse
//! onto whatever it forwarded, across chains. After this pass, registers
//! are dense again and the auxiliary pool holds no dead slices.

use crate::ir::node::NodeData;
use crate::ir::{Function, Reg};
use crate::opt::rewrite::Rewriter;

pub fn compact(f: &mut Function) -> bool {
    let mut dead = 0usize;
    for i in 1..f.len() {
        if matches!(f.node(Reg::from_u32(i)).data, NodeData::Nop | NodeData::Pass { .. }) {
            dead += 1;
        }
    }
    if dead == 0 {
        return false;
    }

    let mut rw = Rewriter::new(f);
    for i in 1..f.len() {
        let r = Reg::from_u32(i);
        match f.node(r).data {
            NodeData::Nop => {}
            NodeData::Pass { value } => rw.alias(0, r, value),
            _ => {
                rw.keep(f, r);
            }
        }
    }
    log::trace!("{}: compacted {dead} dead registers", f.name);
    rw.finish(f);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::ArithBehavior;
    use crate::ir::types::I32;
    use crate::ir::{FuncId, Function, Prototype};

    #[test]
    fn removes_holes_and_rewrites_operands() {
        let mut f = Function::new(FuncId::from_u32(0), "cp", Prototype::new(vec![I32], I32));
        let p = f.param(0);
        let c = f.uint(I32, 3);
        let dead = f.make_raw(NodeData::Nop, crate::ir::types::VOID);
        let fwd = f.make_raw(NodeData::Pass { value: c }, I32);
        let sum = f.make_raw(
            NodeData::IntBinary {
                op: crate::ir::IntOp::Add,
                behavior: ArithBehavior::Wrap,
                a: p,
                b: fwd,
            },
            I32,
        );
        f.ret(sum);
        let before = f.len();

        assert!(compact(&mut f));
        assert_eq!(f.len(), before - 2);
        let _ = dead;

        // No nop or pass survives, and operands reference valid registers.
        for i in 1..f.len() {
            let r = Reg::from_u32(i);
            assert!(!matches!(f.node(r).data, NodeData::Nop | NodeData::Pass { .. }));
            f.for_each_operand(r, |op| assert!(op < r));
        }
        assert!(crate::verifier::verify_function(&f).is_ok());

        // The add now reads the constant directly.
        let printed = f.to_string();
        assert!(printed.contains("add.i32"), "{printed}");
        assert!(!compact(&mut f));
    }
}
