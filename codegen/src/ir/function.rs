//! Function bodies.
//!
//! A function owns a flat node stream indexed by [`Reg`]. Node 0 is the
//! null sentinel, node 1 the entry label, and nodes `2 .. 2 + param_count`
//! the parameters, in declaration order. Everything after that is appended
//! by the builder. Nodes are only ever rewritten in place or re-kinded to
//! `Nop`; their indices stay stable until an explicit compaction pass
//! renumbers the whole stream.

use crate::ir::node::{Node, NodeData};
use crate::ir::types::{self, DataType};
use crate::ir::{AuxSlice, FuncId, Label, Reg, SwitchEntry};

/// The type signature of a function.
#[derive(Clone, Debug)]
pub struct Prototype {
    /// Parameter types, in order.
    pub params: Vec<DataType>,
    /// Return type. `types::VOID` for procedures.
    pub ret: DataType,
    /// True when the function accepts variadic arguments after `params`.
    pub varargs: bool,
}

impl Prototype {
    /// A signature with the given parameters and return type.
    pub fn new(params: Vec<DataType>, ret: DataType) -> Prototype {
        Prototype { params, ret, varargs: false }
    }

    /// Mark the signature variadic.
    pub fn with_varargs(mut self) -> Prototype {
        self.varargs = true;
        self
    }
}

/// A single routine: name, signature, node stream and auxiliary pool.
#[derive(Clone)]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Id within the owning module.
    pub id: FuncId,
    /// Type signature.
    pub prototype: Prototype,

    pub(crate) nodes: Vec<Node>,
    pub(crate) aux: Vec<u32>,
    pub(crate) label_count: u32,
    /// The open basic block's label node, or `Reg::NONE` after a
    /// terminator.
    pub(crate) current_label: Reg,
}

impl Function {
    /// Create a function, seeding the null node, the entry label and the
    /// parameter nodes.
    pub fn new(id: FuncId, name: impl Into<String>, prototype: Prototype) -> Function {
        let mut f = Function {
            name: name.into(),
            id,
            prototype,
            nodes: Vec::with_capacity(64),
            aux: Vec::new(),
            label_count: 1,
            current_label: Reg::ENTRY,
        };
        f.nodes.push(Node::nop());
        f.nodes.push(Node {
            data: NodeData::Label { label: Label::from_u32(0), terminator: Reg::NONE },
            dt: types::PTR,
        });
        for i in 0..f.prototype.params.len() {
            let dt = f.prototype.params[i];
            assert!(dt.bytes() >= 1 && dt.bytes() <= 8, "parameter {i} too big: {dt}");
            f.nodes.push(Node {
                data: NodeData::Param { index: i as u32, size: dt.bytes() },
                dt,
            });
        }
        f
    }

    /// Number of nodes in the stream, including the sentinel.
    pub fn len(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// True if the function has no body beyond its preamble.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() as usize == 2 + self.prototype.params.len()
    }

    /// The node behind a register.
    pub fn node(&self, r: Reg) -> &Node {
        &self.nodes[r.index()]
    }

    /// Mutable access to a node.
    pub fn node_mut(&mut self, r: Reg) -> &mut Node {
        &mut self.nodes[r.index()]
    }

    /// The register of parameter `index`.
    pub fn param(&self, index: u32) -> Reg {
        assert!(
            (index as usize) < self.prototype.params.len(),
            "{}: parameter {index} out of range",
            self.name
        );
        Reg::param(index)
    }

    /// The auxiliary pool words behind a slice handle.
    pub fn aux(&self, slice: AuxSlice) -> &[u32] {
        &self.aux[slice.start as usize..slice.end as usize]
    }

    /// The call argument registers of a call node's slice.
    pub fn call_args(&self, slice: AuxSlice) -> impl Iterator<Item = Reg> + '_ {
        self.aux(slice).iter().map(|&w| Reg::from_u32(w))
    }

    /// The switch entries of a switch node's slice.
    pub fn switch_entries(&self, slice: AuxSlice) -> impl Iterator<Item = SwitchEntry> + '_ {
        self.aux(slice)
            .chunks_exact(2)
            .map(|p| SwitchEntry { key: p[0], dest: Label::from_u32(p[1]) })
    }

    /// The `(label, value)` inputs of a wide phi's slice.
    pub fn phi_args(&self, slice: AuxSlice) -> impl Iterator<Item = (Label, Reg)> + '_ {
        self.aux(slice)
            .chunks_exact(2)
            .map(|p| (Label::from_u32(p[0]), Reg::from_u32(p[1])))
    }

    /// The `(label, value)` inputs of any phi node.
    pub fn phi_inputs(&self, r: Reg) -> Vec<(Label, Reg)> {
        match self.node(r).data {
            NodeData::Phi1 { label, value } => vec![(label, value)],
            NodeData::Phi2 { a_label, a, b_label, b } => vec![(a_label, a), (b_label, b)],
            NodeData::PhiN { args } => self.phi_args(args).collect(),
            _ => panic!("{} is not a phi", r),
        }
    }

    pub(crate) fn push_aux(&mut self, words: &[u32]) -> AuxSlice {
        let start = self.aux.len() as u32;
        self.aux.extend_from_slice(words);
        AuxSlice { start, end: self.aux.len() as u32 }
    }

    /// The node that starts the block a given label id names.
    pub fn label_reg(&self, label: Label) -> Reg {
        for (i, n) in self.nodes.iter().enumerate() {
            if let NodeData::Label { label: l, .. } = n.data {
                if l == label {
                    return Reg::from_u32(i as u32);
                }
            }
        }
        panic!("{}: no block named {label}", self.name);
    }

    /// Basic blocks in stream order as `(label_reg, terminator_reg)` pairs.
    ///
    /// A block whose terminator is the following label falls through into
    /// it.
    pub fn blocks(&self) -> Vec<(Reg, Reg)> {
        let mut out = Vec::new();
        let mut bb = Reg::ENTRY;
        loop {
            let NodeData::Label { terminator, .. } = self.node(bb).data else {
                panic!("{}: {bb} does not start a block", self.name);
            };
            assert!(terminator != Reg::NONE, "{}: unterminated block at {bb}", self.name);
            out.push((bb, terminator));

            bb = if self.node(terminator).data.is_label() {
                terminator
            } else if terminator.index() + 1 < self.nodes.len() {
                Reg::from_u32(terminator.as_u32() + 1)
            } else {
                break;
            };
        }
        out
    }

    /// The destination labels of a terminator node.
    pub fn successors(&self, term: Reg) -> Vec<Label> {
        match self.node(term).data {
            NodeData::Goto { dest } => vec![dest],
            NodeData::BrIf { then_dest, else_dest, .. } => vec![then_dest, else_dest],
            NodeData::Switch { default_dest, entries, .. } => {
                let mut out: Vec<Label> = self.switch_entries(entries).map(|e| e.dest).collect();
                out.push(default_dest);
                out
            }
            NodeData::Label { label, .. } => vec![label],
            NodeData::Ret { .. } | NodeData::Unreachable => Vec::new(),
            _ => panic!("{}: {term} is not a terminator", self.name),
        }
    }

    /// Visit every register this node reads, including aux pool operands.
    ///
    /// Label references and the label's terminator back-pointer are not
    /// value uses and are not visited.
    pub fn for_each_operand(&self, r: Reg, mut visit: impl FnMut(Reg)) {
        let mut arg = |x: Reg| {
            if x != Reg::NONE {
                visit(x)
            }
        };
        match self.node(r).data {
            NodeData::Pass { value } => arg(value),
            NodeData::BrIf { cond, .. } => arg(cond),
            NodeData::Switch { key, .. } => arg(key),
            NodeData::Ret { value } => arg(value),
            NodeData::ParamAddr { param, .. } => arg(param),
            NodeData::Load { addr, .. } => arg(addr),
            NodeData::Store { addr, value, .. } => {
                arg(addr);
                arg(value);
            }
            NodeData::Initialize { addr, .. } => arg(addr),
            NodeData::Memset { dst, value, size, .. } => {
                arg(dst);
                arg(value);
                arg(size);
            }
            NodeData::Memcpy { dst, src, size, .. } => {
                arg(dst);
                arg(src);
                arg(size);
            }
            NodeData::Memclr { addr, .. } => arg(addr),
            NodeData::ArrayAccess { base, index, .. } => {
                arg(base);
                arg(index);
            }
            NodeData::MemberAccess { base, .. } => arg(base),
            NodeData::Restrict { value } => arg(value),
            NodeData::VaStart { base } => arg(base),
            NodeData::IntBinary { a, b, .. }
            | NodeData::FloatBinary { a, b, .. }
            | NodeData::Icmp { a, b, .. }
            | NodeData::Fcmp { a, b, .. } => {
                arg(a);
                arg(b);
            }
            NodeData::Unary { value, .. } => arg(value),
            NodeData::Select { cond, then_value, else_value } => {
                arg(cond);
                arg(then_value);
                arg(else_value);
            }
            NodeData::Phi1 { value, .. } => arg(value),
            NodeData::Phi2 { a, b, .. } => {
                arg(a);
                arg(b);
            }
            NodeData::PhiN { args } => {
                for i in (args.start..args.end).skip(1).step_by(2) {
                    arg(Reg::from_u32(self.aux[i as usize]));
                }
            }
            NodeData::Call { args, .. } | NodeData::ECall { args, .. } => {
                for i in args.start..args.end {
                    arg(Reg::from_u32(self.aux[i as usize]));
                }
            }
            NodeData::VCall { target, args } => {
                arg(target);
                for i in args.start..args.end {
                    arg(Reg::from_u32(self.aux[i as usize]));
                }
            }
            NodeData::AtomicLoad { addr, .. } => arg(addr),
            NodeData::AtomicRmw { addr, src, .. } => {
                arg(addr);
                arg(src);
            }
            NodeData::AtomicCmpxchg { addr, expected, .. } => {
                arg(addr);
                arg(expected);
            }
            NodeData::AtomicCmpxchgOld { addr, desired } => {
                arg(addr);
                arg(desired);
            }
            NodeData::AtomicTestAndSet { addr, .. } | NodeData::AtomicClear { addr, .. } => {
                arg(addr)
            }
            NodeData::Nop
            | NodeData::Label { .. }
            | NodeData::Goto { .. }
            | NodeData::Unreachable
            | NodeData::UintConst { .. }
            | NodeData::SintConst { .. }
            | NodeData::FloatConst { .. }
            | NodeData::StringConst { .. }
            | NodeData::FuncAddr { .. }
            | NodeData::ExternAddr { .. }
            | NodeData::GlobalAddr { .. }
            | NodeData::Local { .. }
            | NodeData::Param { .. }
            | NodeData::Line { .. }
            | NodeData::DebugBreak => {}
        }
    }

    /// The number of times each register is read as an operand.
    pub fn use_counts(&self) -> Vec<u32> {
        let mut counts = vec![0u32; self.nodes.len()];
        for i in 0..self.nodes.len() {
            self.for_each_operand(Reg::from_u32(i as u32), |r| counts[r.index()] += 1);
        }
        counts
    }
}
