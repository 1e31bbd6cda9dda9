//! Store-to-load forwarding within basic blocks.
//!
//! For each load, scan backwards through its block. A store with the same
//! type, address and alignment supplies the value, so the load decays into
//! a `Pass` of it. Any other effectful node or the block boundary stops the
//! scan: without alias information a store to an unknown address may cover
//! the loaded location. The store itself always stays; it may be observed
//! elsewhere.

use crate::ir::node::NodeData;
use crate::ir::{Function, Reg};

pub fn load_elim(f: &mut Function) -> bool {
    let mut changes = 0usize;

    for i in 1..f.len() {
        let r = Reg::from_u32(i);
        let NodeData::Load { addr, align, volatile: false } = f.node(r).data else {
            continue;
        };
        let dt = f.node(r).dt;

        let mut j = i - 1;
        while j >= 1 {
            let prev = Reg::from_u32(j);
            match f.node(prev).data {
                NodeData::Store { addr: sa, value, align: sal, volatile: false } => {
                    if sa == addr && sal == align && f.node(prev).dt == dt {
                        log::trace!("{}: forward {prev} into {r}", f.name);
                        f.node_mut(r).data = NodeData::Pass { value };
                        changes += 1;
                    }
                    // Aliasing: any other store may cover this address.
                    break;
                }
                ref data if data.is_terminator() || data.has_side_effect() => break,
                _ => {}
            }
            j -= 1;
        }
    }

    changes > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::I32;
    use crate::ir::{FuncId, Function, Prototype};

    #[test]
    fn store_feeds_load() {
        let mut f = Function::new(FuncId::from_u32(0), "le", Prototype::new(vec![], I32));
        let slot = f.local(4, 4);
        let five = f.uint(I32, 5);
        f.store(I32, slot, five, 4);
        let loaded = f.volatile_load(I32, slot, 4);
        // Strip the volatile marker so the pass may touch it; the builder's
        // own load would have been value numbered away already.
        if let NodeData::Load { volatile, .. } = &mut f.node_mut(loaded).data {
            *volatile = false;
        }
        f.ret(loaded);

        assert!(load_elim(&mut f));
        match f.node(loaded).data {
            NodeData::Pass { value } => assert_eq!(value, five),
            ref other => panic!("expected pass, got {other:?}"),
        }
    }

    #[test]
    fn intervening_store_blocks_forwarding() {
        let mut f = Function::new(FuncId::from_u32(0), "le", Prototype::new(vec![], I32));
        let a = f.local(4, 4);
        let b = f.local(4, 4);
        let five = f.uint(I32, 5);
        let six = f.uint(I32, 6);
        f.store(I32, a, five, 4);
        f.store(I32, b, six, 4);
        let loaded = f.volatile_load(I32, a, 4);
        if let NodeData::Load { volatile, .. } = &mut f.node_mut(loaded).data {
            *volatile = false;
        }
        f.ret(loaded);

        assert!(!load_elim(&mut f));
    }
}
