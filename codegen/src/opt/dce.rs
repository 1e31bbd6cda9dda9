//! Dead code elimination.
//!
//! A node dies when nothing reads its value and it has no side effects.
//! Dead nodes decay to `Nop` in place so every other register keeps its
//! id; compaction removes the holes afterwards. The sweep runs backwards,
//! decrementing operand counts as it kills, so whole dead chains disappear
//! in one pass.

use crate::ir::node::NodeData;
use crate::ir::{Function, Reg};

pub fn dce(f: &mut Function) -> bool {
    let mut use_counts = f.use_counts();
    let mut changes = 0usize;

    for i in (1..f.len()).rev() {
        let r = Reg::from_u32(i);
        let data = &f.node(r).data;
        if use_counts[r.index()] != 0
            || data.has_side_effect()
            || data.is_terminator()
            || matches!(data, NodeData::Param { .. } | NodeData::Nop)
        {
            continue;
        }

        f.for_each_operand(r, |op| use_counts[op.index()] -= 1);
        log::trace!("{}: kill {r}", f.name);
        f.node_mut(r).data = NodeData::Nop;
        changes += 1;
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
    fn kills_dead_chains() {
        let mut f = Function::new(FuncId::from_u32(0), "d", Prototype::new(vec![I32], I32));
        let p = f.param(0);
        let two = f.uint(I32, 2);
        let dead = f.make_raw(
            NodeData::IntBinary { op: crate::ir::IntOp::Add, behavior: ArithBehavior::Wrap, a: p, b: two },
            I32,
        );
        let deader = f.make_raw(
            NodeData::IntBinary { op: crate::ir::IntOp::Mul, behavior: ArithBehavior::Wrap, a: dead, b: two },
            I32,
        );
        f.ret(p);

        assert!(dce(&mut f));
        assert!(matches!(f.node(dead).data, NodeData::Nop));
        assert!(matches!(f.node(deader).data, NodeData::Nop));
        // The constant fed only dead nodes, so it dies too.
        assert!(matches!(f.node(two).data, NodeData::Nop));
    }

    #[test]
    fn loads_and_stores_survive() {
        let mut f = Function::new(FuncId::from_u32(0), "d", Prototype::new(vec![], I32));
        let slot = f.local(4, 4);
        let v = f.uint(I32, 1);
        f.store(I32, slot, v, 4);
        let loaded = f.load(I32, slot, 4);
        let ret = f.uint(I32, 0);
        f.ret(ret);
        let _ = loaded;

        assert!(!dce(&mut f));
    }
}
