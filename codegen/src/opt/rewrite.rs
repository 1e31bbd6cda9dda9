//! Node stream rewriting.
//!
//! Compaction, local promotion and inlining all rebuild the node stream:
//! they copy surviving nodes into a fresh stream, insert new ones, and
//! renumber every register. The `Rewriter` collects the new stream while
//! the pass walks the old one and defers operand renumbering until the
//! stream is complete, which is what lets phi inputs reference registers
//! that have not been emitted yet.
//!
//! Inlining splices nodes from a second function, so every emitted node is
//! tagged with the *space* its operands are written in. Space 0 is the
//! function being rewritten; a pass may add more.

use crate::ir::node::{Node, NodeData};
use crate::ir::{AuxSlice, Function, Reg};

const UNMAPPED: u32 = u32::MAX;

struct Space {
    /// old register -> new register, or `UNMAPPED`.
    map: Vec<u32>,
    /// old register -> old register it forwards to, or `UNMAPPED`.
    alias: Vec<u32>,
}

impl Space {
    fn with_len(len: usize) -> Space {
        Space { map: vec![UNMAPPED; len], alias: vec![UNMAPPED; len] }
    }

    fn grow_for(&mut self, index: usize) {
        if index >= self.map.len() {
            self.map.resize(index + 1, UNMAPPED);
            self.alias.resize(index + 1, UNMAPPED);
        }
    }

    fn resolve(&self, r: Reg) -> Option<Reg> {
        let mut cur = r.index();
        for _ in 0..self.map.len() + 1 {
            if self.map[cur] != UNMAPPED {
                return Some(Reg::from_u32(self.map[cur]));
            }
            if self.alias[cur] == UNMAPPED {
                return None;
            }
            cur = self.alias[cur] as usize;
        }
        None
    }
}

pub(crate) struct Rewriter {
    nodes: Vec<Node>,
    aux: Vec<u32>,
    tags: Vec<u8>,
    spaces: Vec<Space>,
}

impl Rewriter {
    /// A rewriter over `f` with only the default operand space.
    pub fn new(f: &Function) -> Rewriter {
        Rewriter::with_extra_space(f, 0)
    }

    /// A rewriter over `f` plus `extra` additional operand spaces.
    pub fn with_extra_space(f: &Function, extra: usize) -> Rewriter {
        let mut spaces = Vec::with_capacity(1 + extra);
        let mut space0 = Space::with_len(f.len() as usize);
        space0.map[0] = 0;
        spaces.push(space0);
        for _ in 0..extra {
            spaces.push(Space::with_len(0));
        }
        Rewriter {
            nodes: vec![Node::nop()],
            aux: Vec::new(),
            tags: vec![0],
            spaces,
        }
    }

    /// Declare the operand range of a secondary space.
    pub fn size_space(&mut self, space: u8, len: usize) {
        self.spaces[space as usize].grow_for(len.saturating_sub(1));
        self.spaces[space as usize].map[0] = 0;
    }

    /// Append a node whose operands are written in `space` coordinates.
    pub fn push(&mut self, node: Node, space: u8) -> Reg {
        let r = Reg::from_u32(self.nodes.len() as u32);
        self.nodes.push(node);
        self.tags.push(space);
        r
    }

    /// Append a node and record it as the new home of `old`.
    pub fn push_mapped(&mut self, space: u8, old: Reg, node: Node) -> Reg {
        let new = self.push(node, space);
        self.map_to(space, old, new);
        new
    }

    /// Copy a node of `f` verbatim, including any aux pool slice it owns.
    pub fn keep(&mut self, f: &Function, old: Reg) -> Reg {
        let mut node = f.node(old).clone();
        self.import_aux(f, &mut node.data);
        self.push_mapped(0, old, node)
    }

    /// Re-home a node's aux slice into the new pool.
    pub fn import_aux(&mut self, f: &Function, data: &mut NodeData) {
        let slice = match data {
            NodeData::Switch { entries, .. } => entries,
            NodeData::PhiN { args } => args,
            NodeData::Call { args, .. }
            | NodeData::ECall { args, .. }
            | NodeData::VCall { args, .. } => args,
            _ => return,
        };
        *slice = self.push_aux(f.aux(*slice));
    }

    /// Append raw words to the new aux pool.
    pub fn push_aux(&mut self, words: &[u32]) -> AuxSlice {
        let start = self.aux.len() as u32;
        self.aux.extend_from_slice(words);
        AuxSlice { start, end: self.aux.len() as u32 }
    }

    /// Allocate a fresh id in `space` with no node behind it yet. Used for
    /// values that will only be emitted later, like phis created while the
    /// blocks feeding them are still being walked.
    pub fn synth(&mut self, space: u8) -> Reg {
        let s = &mut self.spaces[space as usize];
        let id = s.map.len();
        s.grow_for(id);
        Reg::from_u32(id as u32)
    }

    /// Where `old` has been placed, if it has been emitted or aliased yet.
    pub fn lookup(&self, space: u8, old: Reg) -> Option<Reg> {
        self.spaces[space as usize].resolve(old)
    }

    /// Record `new` as the home of `old`.
    pub fn map_to(&mut self, space: u8, old: Reg, new: Reg) {
        let s = &mut self.spaces[space as usize];
        s.grow_for(old.index());
        debug_assert_eq!(s.map[old.index()], UNMAPPED, "{old} mapped twice");
        s.map[old.index()] = new.as_u32();
    }

    /// Make `old` forward to wherever `target` (same space) ends up.
    pub fn alias(&mut self, space: u8, old: Reg, target: Reg) {
        let s = &mut self.spaces[space as usize];
        s.grow_for(old.index().max(target.index()));
        s.alias[old.index()] = target.as_u32();
    }

    /// Renumber every operand and install the new stream into `f`.
    ///
    /// Label terminator fields are recomputed from the final layout, so
    /// passes never have to maintain them while splicing blocks around.
    pub fn finish(mut self, f: &mut Function) {
        for i in 1..self.nodes.len() {
            let space = &self.spaces[self.tags[i] as usize];
            let mut data = core::mem::replace(&mut self.nodes[i].data, NodeData::Nop);
            remap_operands(&mut data, &mut self.aux, |r| {
                space.resolve(r).unwrap_or_else(|| {
                    panic!("rewrite dropped {r} but a surviving node still uses it")
                })
            });
            self.nodes[i].data = data;
        }

        f.nodes = self.nodes;
        f.aux = self.aux;
        f.current_label = Reg::NONE;
        recompute_terminators(f);
    }
}

/// Apply `map` to every register operand of a node, including the words of
/// its aux slice. Labels are stable and are not touched.
fn remap_operands(data: &mut NodeData, aux: &mut [u32], mut map: impl FnMut(Reg) -> Reg) {
    let mut m = |r: &mut Reg| {
        if *r != Reg::NONE {
            *r = map(*r);
        }
    };
    match data {
        NodeData::Pass { value } => m(value),
        NodeData::BrIf { cond, .. } => m(cond),
        NodeData::Switch { key, .. } => m(key),
        NodeData::Ret { value } => m(value),
        NodeData::ParamAddr { param, .. } => m(param),
        NodeData::Load { addr, .. } => m(addr),
        NodeData::Store { addr, value, .. } => {
            m(addr);
            m(value);
        }
        NodeData::Initialize { addr, .. } => m(addr),
        NodeData::Memset { dst, value, size, .. } => {
            m(dst);
            m(value);
            m(size);
        }
        NodeData::Memcpy { dst, src, size, .. } => {
            m(dst);
            m(src);
            m(size);
        }
        NodeData::Memclr { addr, .. } => m(addr),
        NodeData::ArrayAccess { base, index, .. } => {
            m(base);
            m(index);
        }
        NodeData::MemberAccess { base, .. } => m(base),
        NodeData::Restrict { value } => m(value),
        NodeData::VaStart { base } => m(base),
        NodeData::IntBinary { a, b, .. }
        | NodeData::FloatBinary { a, b, .. }
        | NodeData::Icmp { a, b, .. }
        | NodeData::Fcmp { a, b, .. } => {
            m(a);
            m(b);
        }
        NodeData::Unary { value, .. } => m(value),
        NodeData::Select { cond, then_value, else_value } => {
            m(cond);
            m(then_value);
            m(else_value);
        }
        NodeData::Phi1 { value, .. } => m(value),
        NodeData::Phi2 { a, b, .. } => {
            m(a);
            m(b);
        }
        NodeData::PhiN { args } => {
            for i in (args.start..args.end).skip(1).step_by(2) {
                let mut r = Reg::from_u32(aux[i as usize]);
                m(&mut r);
                aux[i as usize] = r.as_u32();
            }
        }
        NodeData::Call { args, .. } | NodeData::ECall { args, .. } => {
            for i in args.start..args.end {
                let mut r = Reg::from_u32(aux[i as usize]);
                m(&mut r);
                aux[i as usize] = r.as_u32();
            }
        }
        NodeData::VCall { target, args } => {
            m(target);
            for i in args.start..args.end {
                let mut r = Reg::from_u32(aux[i as usize]);
                m(&mut r);
                aux[i as usize] = r.as_u32();
            }
        }
        NodeData::AtomicLoad { addr, .. } => m(addr),
        NodeData::AtomicRmw { addr, src, .. } => {
            m(addr);
            m(src);
        }
        NodeData::AtomicCmpxchg { addr, expected, .. } => {
            m(addr);
            m(expected);
        }
        NodeData::AtomicCmpxchgOld { addr, desired } => {
            m(addr);
            m(desired);
        }
        NodeData::AtomicTestAndSet { addr, .. } | NodeData::AtomicClear { addr, .. } => m(addr),
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

/// Refill every label's terminator back-pointer from the stream layout.
pub(crate) fn recompute_terminators(f: &mut Function) {
    let len = f.len();
    let mut open: Option<Reg> = None;
    for i in 1..len {
        let r = Reg::from_u32(i);
        let is_label = f.node(r).data.is_label();
        let is_term = f.node(r).data.is_terminator();
        if let Some(l) = open {
            if is_term {
                match &mut f.node_mut(l).data {
                    NodeData::Label { terminator, .. } => *terminator = r,
                    _ => unreachable!(),
                }
            }
        }
        if is_label {
            open = Some(r);
        } else if is_term {
            open = None;
        }
    }
}
