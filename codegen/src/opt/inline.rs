//! Call site inlining.
//!
//! Small leaf callees are spliced into the caller: the call becomes a jump
//! to a renamed copy of the callee's blocks, parameters map onto the
//! argument registers, and each return jumps to a fresh resume block where
//! a phi merges the returned values. One call site is expanded per
//! invocation; the fixed point driver picks up the rest.

use crate::ir::node::{Node, NodeData};
use crate::ir::{Function, Label, Reg};
use crate::opt::rewrite::Rewriter;

/// Callees above this node count stay out of line.
const MAX_INLINE_NODES: u32 = 48;

fn is_candidate(caller: &Function, callee: &Function) -> bool {
    if callee.id == caller.id || callee.prototype.varargs || callee.len() > MAX_INLINE_NODES {
        return false;
    }
    let mut returns = 0;
    for i in 1..callee.len() {
        match callee.node(Reg::from_u32(i)).data {
            // Stack slots and nested calls keep a callee out of line: the
            // caller's frame layout and register pressure stay predictable.
            NodeData::Local { .. }
            | NodeData::ParamAddr { .. }
            | NodeData::VaStart { .. }
            | NodeData::Call { .. }
            | NodeData::ECall { .. }
            | NodeData::VCall { .. } => return false,
            NodeData::Ret { .. } => returns += 1,
            _ => {}
        }
    }
    returns >= 1
}

pub fn inline(f: &mut Function, module_funcs: &[Function]) -> bool {
    // Find the first expandable call site.
    let mut site = None;
    for i in 1..f.len() {
        let r = Reg::from_u32(i);
        if let NodeData::Call { target, args } = f.node(r).data {
            let callee = &module_funcs[target.index()];
            if is_candidate(f, callee) && f.aux(args).len() == callee.prototype.params.len() {
                site = Some((r, target, args));
                break;
            }
        }
    }
    let Some((call_site, target, call_args)) = site else {
        return false;
    };
    let callee = &module_funcs[target.index()];
    log::debug!("{}: inlining {} at {call_site}", f.name, callee.name);

    // Fresh label ids for the callee's blocks plus the resume block.
    let label_base = f.label_count;
    let new_label = |l: Label| Label::from_u32(label_base + l.as_u32());
    let resume = Label::from_u32(label_base + callee.label_count);
    let new_label_count = label_base + callee.label_count + 1;

    let args: Vec<Reg> = f.call_args(call_args).collect();
    let mut rw = Rewriter::with_extra_space(f, 1);
    rw.size_space(1, callee.len() as usize);

    for i in 1..f.len() {
        let r = Reg::from_u32(i);
        if r != call_site {
            rw.keep(f, r);
            continue;
        }

        // Arguments precede the call, so their new homes are known.
        for (k, &arg) in args.iter().enumerate() {
            let new_arg = rw
                .lookup(0, arg)
                .unwrap_or_else(|| panic!("{}: argument {arg} not yet emitted", f.name));
            rw.map_to(1, Reg::param(k as u32), new_arg);
        }

        rw.push(
            Node {
                data: NodeData::Goto { dest: new_label(Label::from_u32(0)) },
                dt: crate::ir::types::VOID,
            },
            0,
        );

        // Splice the callee body with renamed labels.
        let mut ret_sites: Vec<(Label, Reg)> = Vec::new();
        let mut cur_label = Label::from_u32(0);
        for j in 1..callee.len() {
            let cr = Reg::from_u32(j);
            let n = callee.node(cr);
            match n.data {
                NodeData::Param { .. } => {}
                NodeData::Label { label, .. } => {
                    cur_label = label;
                    rw.push_mapped(
                        1,
                        cr,
                        Node {
                            data: NodeData::Label {
                                label: new_label(label),
                                terminator: Reg::NONE,
                            },
                            dt: n.dt,
                        },
                    );
                }
                NodeData::Ret { value } => {
                    if value != Reg::NONE {
                        ret_sites.push((new_label(cur_label), value));
                    }
                    rw.push(
                        Node { data: NodeData::Goto { dest: resume }, dt: crate::ir::types::VOID },
                        1,
                    );
                }
                NodeData::Goto { dest } => {
                    rw.push_mapped(
                        1,
                        cr,
                        Node { data: NodeData::Goto { dest: new_label(dest) }, dt: n.dt },
                    );
                }
                NodeData::BrIf { cond, then_dest, else_dest } => {
                    rw.push_mapped(
                        1,
                        cr,
                        Node {
                            data: NodeData::BrIf {
                                cond,
                                then_dest: new_label(then_dest),
                                else_dest: new_label(else_dest),
                            },
                            dt: n.dt,
                        },
                    );
                }
                NodeData::Switch { key, default_dest, entries } => {
                    let mut words = Vec::with_capacity(entries.len());
                    for e in callee.switch_entries(entries) {
                        words.push(e.key);
                        words.push(new_label(e.dest).as_u32());
                    }
                    let slice = rw.push_aux(&words);
                    rw.push_mapped(
                        1,
                        cr,
                        Node {
                            data: NodeData::Switch {
                                key,
                                default_dest: new_label(default_dest),
                                entries: slice,
                            },
                            dt: n.dt,
                        },
                    );
                }
                NodeData::Phi1 { label, value } => {
                    rw.push_mapped(
                        1,
                        cr,
                        Node { data: NodeData::Phi1 { label: new_label(label), value }, dt: n.dt },
                    );
                }
                NodeData::Phi2 { a_label, a, b_label, b } => {
                    rw.push_mapped(
                        1,
                        cr,
                        Node {
                            data: NodeData::Phi2 {
                                a_label: new_label(a_label),
                                a,
                                b_label: new_label(b_label),
                                b,
                            },
                            dt: n.dt,
                        },
                    );
                }
                NodeData::PhiN { args } => {
                    let mut words = Vec::with_capacity(args.len());
                    for (l, v) in callee.phi_args(args) {
                        words.push(new_label(l).as_u32());
                        words.push(v.as_u32());
                    }
                    let slice = rw.push_aux(&words);
                    rw.push_mapped(1, cr, Node { data: NodeData::PhiN { args: slice }, dt: n.dt });
                }
                _ => {
                    let mut node = n.clone();
                    rw.import_aux(callee, &mut node.data);
                    rw.push_mapped(1, cr, node);
                }
            }
        }

        // The resume block. Returned values merge through a phi that takes
        // over the call's register.
        rw.push(
            Node {
                data: NodeData::Label { label: resume, terminator: Reg::NONE },
                dt: crate::ir::types::PTR,
            },
            0,
        );
        let call_dt = f.node(call_site).dt;
        if !call_dt.is_void() && !ret_sites.is_empty() {
            let data = match ret_sites.as_slice() {
                [(l, v)] => NodeData::Phi1 { label: *l, value: *v },
                [(la, va), (lb, vb)] => {
                    NodeData::Phi2 { a_label: *la, a: *va, b_label: *lb, b: *vb }
                }
                _ => {
                    let mut words = Vec::with_capacity(ret_sites.len() * 2);
                    for (l, v) in &ret_sites {
                        words.push(l.as_u32());
                        words.push(v.as_u32());
                    }
                    NodeData::PhiN { args: rw.push_aux(&words) }
                }
            };
            let phi = rw.push(Node { data, dt: call_dt }, 1);
            rw.map_to(0, call_site, phi);
        }
    }

    f.label_count = new_label_count;
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

    fn make_square() -> Function {
        let mut g =
            Function::new(FuncId::from_u32(1), "square", Prototype::new(vec![I32], I32));
        let x = g.param(0);
        let sq = g.mul(x, x, ArithBehavior::Wrap);
        g.ret(sq);
        g
    }

    #[test]
    fn single_block_callee_inlines() {
        let mut caller =
            Function::new(FuncId::from_u32(0), "outer", Prototype::new(vec![I32], I32));
        let p = caller.param(0);
        let call = caller.call(I32, FuncId::from_u32(1), &[p]);
        let one = caller.uint(I32, 1);
        let out = caller.add(call, one, ArithBehavior::Wrap);
        caller.ret(out);

        let funcs = vec![caller.clone(), make_square()];
        assert!(inline(&mut caller, &funcs));
        assert!(verify_function(&caller).is_ok());
        let printed = caller.to_string();
        assert!(!printed.contains("call"), "{printed}");
        assert!(printed.contains("mul.i32"), "{printed}");
        assert!(printed.contains("phi"), "{printed}");

        // Nothing left to expand.
        assert!(!inline(&mut caller, &funcs));
    }

    #[test]
    fn large_callees_stay_out_of_line() {
        let mut big =
            Function::new(FuncId::from_u32(1), "big", Prototype::new(vec![I32], I32));
        let mut acc = big.param(0);
        for i in 0..MAX_INLINE_NODES {
            let c = big.uint(I32, u64::from(i) + 2);
            acc = big.mul(acc, c, ArithBehavior::Wrap);
        }
        big.ret(acc);

        let mut caller =
            Function::new(FuncId::from_u32(0), "caller", Prototype::new(vec![I32], I32));
        let p = caller.param(0);
        let call = caller.call(I32, FuncId::from_u32(1), &[p]);
        caller.ret(call);

        let funcs = vec![caller.clone(), big];
        assert!(!inline(&mut caller, &funcs));
    }
}
