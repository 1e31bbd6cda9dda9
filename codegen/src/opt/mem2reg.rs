//! Promotion of stack slots to SSA values.
//!
//! A local qualifies when its address never escapes: every use is the
//! address of a plain load or store of one consistent type. Promoted
//! stores become value definitions, loads forward the reaching value, and
//! blocks that receive different values from different predecessors get a
//! phi at their head. Anything address-taken stays in memory.
//!
//! Reaching values are solved per block: a block that reads the slot
//! before writing it needs an incoming value, and that need propagates to
//! every predecessor that does not itself write the slot. A needy block
//! gets a phi over its predecessors' outgoing values; a slot whose need
//! reaches the entry block would read uninitialised memory and is left
//! alone.

use crate::ir::node::{Node, NodeData};
use crate::ir::types::DataType;
use crate::ir::{Function, Label, Reg};
use crate::opt::rewrite::Rewriter;
use rustc_hash::{FxHashMap, FxHashSet};

pub fn mem2reg(f: &mut Function) -> bool {
    // Locals whose every use is a direct, type-consistent load or store.
    let mut candidates: FxHashMap<Reg, Option<DataType>> = FxHashMap::default();
    for i in 1..f.len() {
        let r = Reg::from_u32(i);
        if let NodeData::Local { .. } = f.node(r).data {
            candidates.insert(r, None);
        }
    }
    if candidates.is_empty() {
        return false;
    }

    let record_access = |candidates: &mut FxHashMap<Reg, Option<DataType>>,
                             slot: Reg,
                             dt: DataType,
                             volatile: bool| {
        let Some(&seen) = candidates.get(&slot) else { return };
        let consistent = !volatile && seen.map_or(true, |prev| prev == dt);
        if consistent {
            candidates.insert(slot, Some(dt));
        } else {
            candidates.remove(&slot);
        }
    };

    for i in 1..f.len() {
        let r = Reg::from_u32(i);
        let dt = f.node(r).dt;
        match f.node(r).data {
            NodeData::Load { addr, volatile, .. } => {
                record_access(&mut candidates, addr, dt, volatile);
            }
            NodeData::Store { addr, value, volatile, .. } => {
                // A stored slot address escapes.
                candidates.remove(&value);
                record_access(&mut candidates, addr, dt, volatile);
            }
            _ => {
                f.for_each_operand(r, |op| {
                    candidates.remove(&op);
                });
            }
        }
    }
    candidates.retain(|_, dt| dt.is_some());
    if candidates.is_empty() {
        return false;
    }

    // Control flow graph in layout order.
    let blocks = f.blocks();
    let mut block_label: Vec<Label> = Vec::with_capacity(blocks.len());
    let mut block_of_label: FxHashMap<Label, usize> = FxHashMap::default();
    for (bi, &(label_reg, _)) in blocks.iter().enumerate() {
        let NodeData::Label { label, .. } = f.node(label_reg).data else { unreachable!() };
        block_label.push(label);
        block_of_label.insert(label, bi);
    }
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); blocks.len()];
    for (bi, &(_, term)) in blocks.iter().enumerate() {
        for succ in f.successors(term) {
            if let Some(&si) = block_of_label.get(&succ) {
                preds[si].push(bi);
            }
        }
    }

    // Per block: the last stored value, and whether the slot is read
    // before any store.
    let mut out_store: FxHashMap<(usize, Reg), Reg> = FxHashMap::default();
    let mut needs_in: FxHashSet<(usize, Reg)> = FxHashSet::default();
    for (bi, &(label_reg, term)) in blocks.iter().enumerate() {
        let body_end =
            if f.node(term).data.is_label() { term.as_u32() } else { term.as_u32() + 1 };
        for i in label_reg.as_u32() + 1..body_end {
            let r = Reg::from_u32(i);
            match f.node(r).data {
                NodeData::Load { addr, .. } if candidates.contains_key(&addr) => {
                    if !out_store.contains_key(&(bi, addr)) {
                        needs_in.insert((bi, addr));
                    }
                }
                NodeData::Store { addr, value, .. } if candidates.contains_key(&addr) => {
                    out_store.insert((bi, addr), value);
                }
                _ => {}
            }
        }
    }

    // Propagate the need for an incoming value to predecessors that do not
    // write the slot themselves.
    let mut worklist: Vec<(usize, Reg)> = needs_in.iter().copied().collect();
    while let Some((bi, slot)) = worklist.pop() {
        for &p in &preds[bi] {
            if !out_store.contains_key(&(p, slot)) && needs_in.insert((p, slot)) {
                worklist.push((p, slot));
            }
        }
    }

    // A need that reaches the entry block, or any block with no
    // predecessors, would read uninitialised memory.
    let mut promoted: Vec<Reg> = candidates.keys().copied().collect();
    promoted.sort();
    promoted.retain(|&slot| {
        !(0..blocks.len())
            .any(|bi| needs_in.contains(&(bi, slot)) && (bi == 0 || preds[bi].is_empty()))
    });
    if promoted.is_empty() {
        return false;
    }

    log::trace!("{}: promoting {} stack slots", f.name, promoted.len());

    // Rewrite. Phis get synthetic ids up front so block walking can refer
    // to values that are only emitted later.
    let mut rw = Rewriter::new(f);
    let mut phi_for: FxHashMap<(usize, Reg), Reg> = FxHashMap::default();
    for bi in 0..blocks.len() {
        for &slot in &promoted {
            if needs_in.contains(&(bi, slot)) {
                phi_for.insert((bi, slot), rw.synth(0));
            }
        }
    }
    let val_out = |bi: usize, slot: Reg| -> Reg {
        out_store.get(&(bi, slot)).copied().unwrap_or_else(|| phi_for[&(bi, slot)])
    };

    let mut cur_block = 0usize;
    let mut cur_val: FxHashMap<Reg, Reg> = FxHashMap::default();
    for i in 1..f.len() {
        let r = Reg::from_u32(i);
        match f.node(r).data {
            NodeData::Label { label, .. } => {
                rw.keep(f, r);
                cur_block = block_of_label[&label];
                cur_val.clear();
                for &slot in &promoted {
                    let Some(&phi) = phi_for.get(&(cur_block, slot)) else { continue };
                    let dt = candidates[&slot].unwrap();
                    let inputs: Vec<(Label, Reg)> = preds[cur_block]
                        .iter()
                        .map(|&p| (block_label[p], val_out(p, slot)))
                        .collect();
                    let data = match inputs.as_slice() {
                        [(l, v)] => NodeData::Phi1 { label: *l, value: *v },
                        [(la, va), (lb, vb)] => {
                            NodeData::Phi2 { a_label: *la, a: *va, b_label: *lb, b: *vb }
                        }
                        _ => {
                            let mut words = Vec::with_capacity(inputs.len() * 2);
                            for (l, v) in &inputs {
                                words.push(l.as_u32());
                                words.push(v.as_u32());
                            }
                            NodeData::PhiN { args: rw.push_aux(&words) }
                        }
                    };
                    rw.push_mapped(0, phi, Node { data, dt });
                    cur_val.insert(slot, phi);
                }
            }
            NodeData::Load { addr, .. } if promoted.contains(&addr) => {
                let reaching = cur_val
                    .get(&addr)
                    .copied()
                    .unwrap_or_else(|| panic!("{}: no reaching value for {r}", f.name));
                rw.alias(0, r, reaching);
            }
            NodeData::Store { addr, value, .. } if promoted.contains(&addr) => {
                cur_val.insert(addr, value);
            }
            NodeData::Local { .. } if promoted.contains(&r) => {}
            _ => {
                rw.keep(f, r);
            }
        }
    }
    rw.finish(f);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::ArithBehavior;
    use crate::ir::types::I32;
    use crate::ir::{FuncId, Function, Prototype};
    use crate::verifier::verify_function;

    #[test]
    fn straight_line_promotion() {
        let mut f = Function::new(FuncId::from_u32(0), "m", Prototype::new(vec![I32], I32));
        let p = f.param(0);
        let slot = f.local(4, 4);
        f.store(I32, slot, p, 4);
        let loaded = f.volatile_load(I32, slot, 4);
        if let NodeData::Load { volatile, .. } = &mut f.node_mut(loaded).data {
            *volatile = false;
        }
        f.ret(loaded);

        assert!(mem2reg(&mut f));
        assert!(verify_function(&f).is_ok());
        let printed = f.to_string();
        assert!(!printed.contains("local"), "{printed}");
        assert!(!printed.contains("store"), "{printed}");
    }

    #[test]
    fn diamond_gets_a_phi() {
        // if (p) slot = 1; else slot = 2; return slot;
        let mut f =
            Function::new(FuncId::from_u32(0), "m", Prototype::new(vec![I32], I32));
        let p = f.param(0);
        let slot = f.local(4, 4);
        let then_l = f.new_label_id();
        let else_l = f.new_label_id();
        let join_l = f.new_label_id();

        f.br_if(p, then_l, else_l);

        f.begin_label(then_l);
        let one = f.uint(I32, 1);
        f.store(I32, slot, one, 4);
        f.goto(join_l);

        f.begin_label(else_l);
        let two = f.uint(I32, 2);
        f.store(I32, slot, two, 4);
        f.goto(join_l);

        f.begin_label(join_l);
        let out = f.load(I32, slot, 4);
        f.ret(out);

        assert!(mem2reg(&mut f));
        assert!(verify_function(&f).is_ok());
        let printed = f.to_string();
        assert!(printed.contains("phi"), "{printed}");
        assert!(!printed.contains("local"), "{printed}");
    }

    #[test]
    fn escaping_locals_stay_in_memory() {
        let mut f = Function::new(FuncId::from_u32(0), "m", Prototype::new(vec![], I32));
        let slot = f.local(4, 4);
        let holder = f.local(8, 8);
        // The slot's address is itself stored, so it escapes.
        f.store(crate::ir::types::PTR, holder, slot, 8);
        let v = f.load(I32, slot, 4);
        f.ret(v);

        assert!(!mem2reg(&mut f));
        let _ = v;
    }

    #[test]
    fn loop_carried_value() {
        // slot = 0; while (cond) slot = slot + 1; return slot;
        let mut f =
            Function::new(FuncId::from_u32(0), "m", Prototype::new(vec![I32], I32));
        let p = f.param(0);
        let slot = f.local(4, 4);
        let head = f.new_label_id();
        let body = f.new_label_id();
        let exit = f.new_label_id();

        let zero = f.uint(I32, 0);
        f.store(I32, slot, zero, 4);
        f.goto(head);

        f.begin_label(head);
        f.br_if(p, body, exit);

        f.begin_label(body);
        let cur = f.load(I32, slot, 4);
        let one = f.uint(I32, 1);
        let next = f.add(cur, one, ArithBehavior::Wrap);
        f.store(I32, slot, next, 4);
        f.goto(head);

        f.begin_label(exit);
        let out = f.load(I32, slot, 4);
        f.ret(out);

        assert!(mem2reg(&mut f));
        assert!(verify_function(&f).is_ok());
        assert!(mem2reg(&mut f) == false);
        let printed = f.to_string();
        assert!(printed.contains("phi"), "{printed}");
    }
}
