//! Register state for the single-pass x86-64 code generator.
//!
//! Every IR register has a current location: nowhere yet, a GPR, an XMM, a
//! fixed stack address, a compiler-owned spill slot, or a pending condition
//! in EFLAGS. Two sixteen-entry ownership tables map physical registers
//! back to the IR value living in them. There is no lookahead: when the
//! tables run dry, the owner with the lowest ordinal before the current
//! barrier is spilled.
//!
//! Location semantics: `Stack` means the value *is* the address
//! `rbp + offset` (locals, homed parameter addresses, collapsed tiles);
//! `Spill` means the value is *stored at* `rbp + offset` (spilled
//! temporaries, stack-passed parameters, phi slots).

use crate::ir::node::NodeData;
use crate::ir::types::{DataType, Family};
use crate::ir::{builder::sign_extend, Function, Reg};
use crate::isa::x64::encode::{Asm, Op2, OpSse, Val};
use crate::isa::x64::regs::{
    callee_saved_gprs, first_callee_saved_xmm, Cond, Gpr, Xmm, GPR_PRIORITY,
};
use crate::isa::CallConv;
use crate::binemit::{CodeOffset, LineInfo};
use crate::ir::ExternalId;

/// Where a value currently lives.
#[derive(Copy, Clone, PartialEq, Debug)]
pub(super) enum ValueLoc {
    None,
    Gpr(Gpr),
    Xmm(Xmm),
    /// The value is the address `rbp + offset`.
    Stack(i32),
    /// The value is stored at `rbp + offset`.
    Spill(i32),
    /// The value is a pending condition code with one consumer.
    Flags(Cond),
}

/// Who holds a physical register.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(super) enum Owner {
    Free,
    /// Reserved for the current instruction only.
    Temp,
    Node(Reg),
}

/// A pending `[base + index * scale + disp]` expression waiting to be
/// folded into the next load or store. Deliberately a single slot.
#[derive(Copy, Clone, Debug)]
pub(super) struct Tile {
    pub mapping: Reg,
    pub base: Gpr,
    pub index: Option<Gpr>,
    pub scale: u8,
    pub disp: i32,
}

/// An integer type squeezed onto a machine width. `mask` is non-zero when
/// results must be masked back down after every operation.
#[derive(Copy, Clone, Debug)]
pub(super) struct LegalInt {
    pub bits: u8,
    pub mask: u64,
}

pub(super) fn legalize_int(dt: DataType) -> LegalInt {
    if dt.is_vector() {
        unimplemented!("vector integer operations");
    }
    match dt.family {
        Family::Int | Family::Bool => {
            let want = dt.lane_bits().max(1);
            let bits = match want {
                0..=8 => 8,
                9..=16 => 16,
                17..=32 => 32,
                _ => 64,
            };
            let mask = if u32::from(bits) == want { 0 } else { dt.mask() };
            LegalInt { bits, mask }
        }
        Family::Ptr => LegalInt { bits: 64, mask: 0 },
        Family::Void => LegalInt { bits: 32, mask: 0 },
        Family::F32 | Family::F64 => panic!("legalize_int on {dt}"),
    }
}

/// True when the f64 SSE variant applies.
pub(super) fn is_double(dt: DataType) -> bool {
    match dt.family {
        Family::F64 => true,
        Family::F32 => false,
        _ => panic!("{dt} is not a scalar float"),
    }
}

/// A fixed amount of frame reserved for pushed callee-saved GPRs, so body
/// offsets can be assigned before the final save set is known.
pub(super) const SAVED_GPR_AREA: u32 = 64;

pub(super) struct Ctx<'a> {
    pub f: &'a Function,
    pub cc: CallConv,
    pub is_sysv: bool,
    pub tls_index: Option<ExternalId>,
    pub tls_globals: &'a [bool],

    pub asm: Asm,
    pub labels: Vec<CodeOffset>,
    pub lines: Vec<LineInfo>,

    pub use_count: &'a mut [u32],
    /// Ordinal of the most recently finished node. The stream is in
    /// program order, so a register's index is its ordinal.
    pub barrier: u32,
    pub temp_load: Option<Gpr>,
    pub tile: Option<Tile>,

    pub locs: &'a mut [ValueLoc],
    pub gpr_owner: [Owner; 16],
    pub xmm_owner: [Owner; 16],
    pub gpr_avail: u32,
    pub xmm_avail: u32,

    pub stack_usage: u32,
    pub saved_regs: u32,
    pub caller_arg_bytes: u32,
}

impl<'a> Ctx<'a> {
    /// Carve a new slot out of the frame. Offsets are negative,
    /// rbp-relative.
    pub fn stack_alloc(&mut self, size: u32, align: u32) -> i32 {
        debug_assert!(align.is_power_of_two());
        self.stack_usage = (self.stack_usage + size + (align - 1)) & !(align - 1);
        -(self.stack_usage as i32)
    }

    pub fn set_loc(&mut self, r: Reg, loc: ValueLoc) {
        self.locs[r.index()] = loc;
    }

    // ------------------------------------------------------------------
    // GPR allocation.

    pub fn alloc_gpr(&mut self, owner: Owner) -> Gpr {
        assert!(self.gpr_avail > 0, "{}: out of integer registers", self.f.name);
        for &g in GPR_PRIORITY.iter() {
            if self.gpr_owner[g.enc() as usize] == Owner::Free {
                self.gpr_owner[g.enc() as usize] = owner;
                self.gpr_avail -= 1;
                self.saved_regs |=
                    u32::from((1u16 << g.enc()) & callee_saved_gprs(self.cc));
                return g;
            }
        }
        unreachable!()
    }

    pub fn alloc_xmm(&mut self, owner: Owner) -> Xmm {
        assert!(self.xmm_avail > 0, "{}: out of sse registers", self.f.name);
        for enc in 0..16u8 {
            if self.xmm_owner[enc as usize] == Owner::Free {
                self.xmm_owner[enc as usize] = owner;
                self.xmm_avail -= 1;
                if enc >= first_callee_saved_xmm(self.cc) {
                    self.saved_regs |= 1u32 << (16 + enc);
                }
                return Xmm::from_enc(enc);
            }
        }
        unreachable!()
    }

    fn free_gpr(&mut self, g: Gpr) {
        self.gpr_owner[g.enc() as usize] = Owner::Free;
        self.gpr_avail += 1;
    }

    fn free_xmm(&mut self, x: Xmm) {
        self.xmm_owner[x.enc() as usize] = Owner::Free;
        self.xmm_avail += 1;
    }

    /// Move a register's live value out to a spill slot (or drop it when
    /// dead) so the register can be reused.
    pub fn evict_gpr(&mut self, g: Gpr) {
        match self.gpr_owner[g.enc() as usize] {
            Owner::Free => {}
            Owner::Temp => self.free_gpr(g),
            Owner::Node(r) => {
                if self.use_count[r.index()] == 0 {
                    self.set_loc(r, ValueLoc::None);
                    self.free_gpr(g);
                    return;
                }
                let l = legalize_int(self.f.node(r).dt);
                let size = u32::from(l.bits) / 8;
                let pos = self.stack_alloc(size, size);
                log::trace!("{}: spill {r} from {}", self.f.name, g.name());
                self.set_loc(r, ValueLoc::Spill(pos));
                self.free_gpr(g);
                self.asm.inst2(Op2::Mov, &Val::spill(pos), &Val::Gpr(g), l.bits);
            }
        }
    }

    pub fn evict_xmm(&mut self, x: Xmm) {
        match self.xmm_owner[x.enc() as usize] {
            Owner::Free => {}
            Owner::Temp => self.free_xmm(x),
            Owner::Node(r) => {
                if self.use_count[r.index()] == 0 {
                    self.set_loc(r, ValueLoc::None);
                    self.free_xmm(x);
                    return;
                }
                let dt = self.f.node(r).dt;
                let size = dt.bytes().max(4);
                let pos = self.stack_alloc(size, size);
                self.set_loc(r, ValueLoc::Spill(pos));
                self.free_xmm(x);
                self.asm.inst2_sse(OpSse::Mov, &Val::spill(pos), &Val::Xmm(x), is_double(dt));
            }
        }
    }

    /// Claim a specific register as a per-instruction scratch, evicting
    /// any current owner.
    pub fn reserve_gpr(&mut self, g: Gpr) {
        self.evict_gpr(g);
        debug_assert_eq!(self.gpr_owner[g.enc() as usize], Owner::Free);
        self.gpr_owner[g.enc() as usize] = Owner::Temp;
        self.gpr_avail -= 1;
    }

    pub fn release_gpr(&mut self, g: Gpr) {
        debug_assert_ne!(self.gpr_owner[g.enc() as usize], Owner::Free);
        self.free_gpr(g);
    }

    pub fn kill_temp_gpr(&mut self, g: Gpr) {
        if self.gpr_owner[g.enc() as usize] == Owner::Temp {
            self.free_gpr(g);
        }
    }

    pub fn kill_temp_xmm(&mut self, x: Xmm) {
        if self.xmm_owner[x.enc() as usize] == Owner::Temp {
            self.free_xmm(x);
        }
    }

    /// Drop a value whose uses are exhausted, freeing anything it owns.
    /// Ownership is swept from the tables rather than derived from the
    /// location, because tiling can park a value's register behind a
    /// pending address expression.
    pub fn kill(&mut self, r: Reg) {
        if self.use_count[r.index()] != 0 {
            return;
        }
        for enc in 0..16u8 {
            if self.gpr_owner[enc as usize] == Owner::Node(r) {
                self.free_gpr(Gpr::from_enc(enc));
            }
            if self.xmm_owner[enc as usize] == Owner::Node(r) {
                self.free_xmm(Xmm::from_enc(enc));
            }
        }
        self.set_loc(r, ValueLoc::None);
    }

    /// Hand ownership of `r`'s register to `to` without moving data.
    pub fn rename_gpr_owner(&mut self, g: Gpr, to: Reg) {
        self.gpr_owner[g.enc() as usize] = Owner::Node(to);
    }

    pub fn rename_xmm_owner(&mut self, x: Xmm, to: Reg) {
        self.xmm_owner[x.enc() as usize] = Owner::Node(to);
    }

    /// Spill every owned register. Runs at block boundaries: locations are
    /// only tracked within a block.
    pub fn evict_everything(&mut self) {
        for &g in GPR_PRIORITY.iter() {
            if self.gpr_owner[g.enc() as usize] != Owner::Free {
                self.evict_gpr(g);
            }
        }
        for enc in 0..16u8 {
            if self.xmm_owner[enc as usize] != Owner::Free {
                self.evict_xmm(Xmm::from_enc(enc));
            }
        }
    }

    /// Make room before a node when the tables are nearly full, evicting
    /// only values defined before the current instruction barrier.
    pub fn ensure_headroom(&mut self, current: Reg) {
        if self.gpr_avail < 4 {
            for &g in GPR_PRIORITY.iter() {
                if let Owner::Node(r) = self.gpr_owner[g.enc() as usize] {
                    if r.as_u32() < self.barrier {
                        debug_assert_ne!(r, current);
                        self.evict_gpr(g);
                        if self.gpr_avail >= 4 {
                            break;
                        }
                    }
                }
            }
        }
        if self.xmm_avail < 4 {
            for enc in 0..16u8 {
                if let Owner::Node(r) = self.xmm_owner[enc as usize] {
                    if r.as_u32() < self.barrier {
                        self.evict_xmm(Xmm::from_enc(enc));
                        if self.xmm_avail >= 4 {
                            break;
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Tile handling.

    /// Consume the pending tile as a memory operand. Counts as the one use
    /// of the address value it stands for.
    pub fn use_tile(&mut self, r: Reg) -> Val {
        let tile = self.tile.take().expect("no pending tile");
        debug_assert_eq!(tile.mapping, r);
        self.use_count[r.index()] -= 1;
        Val::Mem {
            base: tile.base,
            index: tile.index,
            scale: tile.scale,
            disp: tile.disp,
            spill: false,
        }
    }

    /// The next node cannot fold the tile: materialise it with `lea`.
    pub fn spill_tile(&mut self) {
        let tile = self.tile.take().expect("no pending tile");
        let src = Val::Mem {
            base: tile.base,
            index: tile.index,
            scale: tile.scale,
            disp: tile.disp,
            spill: false,
        };

        // Reuse a register already feeding the address if the tile owns it.
        let dst = if self.gpr_owner[tile.base.enc() as usize] == Owner::Node(tile.mapping) {
            tile.base
        } else if let Some(index) = tile.index {
            if self.gpr_owner[index.enc() as usize] == Owner::Node(tile.mapping) {
                index
            } else {
                self.alloc_gpr(Owner::Node(tile.mapping))
            }
        } else {
            self.alloc_gpr(Owner::Node(tile.mapping))
        };

        self.set_loc(tile.mapping, ValueLoc::Gpr(dst));
        self.asm.inst2(Op2::Lea, &Val::Gpr(dst), &src, 64);

        // Scratch registers that fed the address are done now.
        if tile.base != dst {
            self.kill_temp_gpr(tile.base);
        }
        if let Some(i) = tile.index {
            if i != dst {
                self.kill_temp_gpr(i);
            }
        }
    }

    // ------------------------------------------------------------------
    // Value evaluation.

    /// Produce an operand for `r` and consume one use.
    pub fn eval(&mut self, r: Reg) -> Val {
        self.use_count[r.index()] -= 1;

        match self.locs[r.index()] {
            ValueLoc::Gpr(g) => return Val::Gpr(g),
            ValueLoc::Xmm(x) => return Val::Xmm(x),
            ValueLoc::Stack(disp) => return Val::mem(Gpr::Rbp, disp),
            ValueLoc::Spill(disp) => return Val::spill(disp),
            ValueLoc::Flags(cc) => return Val::Flags(cc),
            ValueLoc::None => {}
        }

        match self.f.node(r).data {
            NodeData::UintConst { imm } if imm <= i32::MAX as u64 => Val::Imm(imm as i32),
            NodeData::SintConst { imm } => {
                let dt = self.f.node(r).dt;
                let v = sign_extend(imm as u64, dt.lane_bits().max(1));
                if v == i64::from(v as i32) {
                    Val::Imm(v as i32)
                } else {
                    self.could_not_eval(r)
                }
            }
            NodeData::GlobalAddr { global } => {
                if self.tls_globals.get(global.index()).copied().unwrap_or(false) {
                    self.eval_tls_global(r, global)
                } else {
                    Val::Global(global)
                }
            }
            _ => self.could_not_eval(r),
        }
    }

    fn could_not_eval(&self, r: Reg) -> ! {
        panic!("{}: could not evaluate {r} in:\n{}", self.f.name, self.f)
    }

    /// The Windows TLS access sequence: read `_tls_index`, index the TEB's
    /// TLS array at `gs:[0x58]`, then address the global section-relative.
    fn eval_tls_global(&mut self, r: Reg, global: crate::ir::GlobalId) -> Val {
        assert!(!self.is_sysv, "{}: TLS globals are Windows-only here", self.f.name);
        let tls_index = self
            .tls_index
            .unwrap_or_else(|| panic!("{}: no _tls_index import declared", self.f.name));

        let dst = self.alloc_gpr(Owner::Node(r));
        self.asm.mov_rip_extern32(dst, tls_index);

        let t1 = self.alloc_gpr(Owner::Temp);
        self.asm.mov_gs_tls_array(t1);

        let slot = Val::base_index(t1, dst, 3);
        self.asm.inst2(Op2::Mov, &Val::Gpr(t1), &slot, 64);
        self.asm.lea_tls_global(dst, t1, global);

        self.set_loc(r, ValueLoc::Gpr(dst));
        self.kill_temp_gpr(t1);
        Val::Gpr(dst)
    }

    /// Produce a memory address for `r`. Register-held pointers become
    /// `[reg]`; spilled pointers are reloaded through a scratch register
    /// first.
    pub fn eval_address(&mut self, r: Reg) -> Val {
        let v = self.eval(r);
        match v {
            Val::Gpr(g) => Val::mem(g, 0),
            Val::Mem { spill: true, .. } => {
                let tmp = self.alloc_gpr(Owner::Temp);
                self.temp_load = Some(tmp);
                self.asm.inst2(Op2::Mov, &Val::Gpr(tmp), &v, 64);
                Val::mem(tmp, 0)
            }
            Val::Imm(imm) => {
                // An absolute address: materialise it.
                let tmp = self.alloc_gpr(Owner::Temp);
                self.temp_load = Some(tmp);
                self.asm.inst2(Op2::Mov, &Val::Gpr(tmp), &Val::Imm(imm), 64);
                Val::mem(tmp, 0)
            }
            _ => v,
        }
    }

    // ------------------------------------------------------------------
    // Folded operations.

    fn op_takes_imm(op: Op2) -> bool {
        matches!(
            op,
            Op2::Add | Op2::Or | Op2::And | Op2::Sub | Op2::Xor | Op2::Cmp | Op2::Mov | Op2::Test
        )
    }

    /// `op lhs, value-of(rhs)`, with the operand-shape fixups the encoder
    /// cannot express: address values materialise through `lea`,
    /// memory-to-memory goes through a scratch register, and immediates
    /// are loaded when the operation has no immediate form. Results are
    /// masked back to the IR width when it is not a machine width.
    pub fn folded_op(&mut self, op: Op2, lhs: &Val, rhs_reg: Reg) {
        let dt = match op {
            Op2::Movsxd => crate::ir::types::I64,
            _ => self.f.node(rhs_reg).dt,
        };
        let l = legalize_int(dt);
        let rhs = self.folded_op_inner(op, lhs, rhs_reg, l.bits);

        // Compares write only EFLAGS; masking after them would destroy the
        // very flags they produced.
        let writes_dst = !matches!(op, Op2::Cmp | Op2::Test);
        let skip_mask = op == Op2::Mov
            && matches!(rhs, Val::Imm(imm) if (imm as u64) & l.mask == imm as u64);
        if l.mask != 0 && writes_dst && !skip_mask {
            self.mask_out(l, lhs);
        }
    }

    /// [`Ctx::folded_op`] at an explicit operand width and with no result
    /// masking; the extension lowering owns both decisions there.
    pub fn folded_op_bits(&mut self, op: Op2, lhs: &Val, rhs_reg: Reg, bits: u8) {
        self.folded_op_inner(op, lhs, rhs_reg, bits);
    }

    fn folded_op_inner(&mut self, op: Op2, lhs: &Val, rhs_reg: Reg, bits: u8) -> Val {
        let rhs = self.eval(rhs_reg);
        let l = LegalInt { bits, mask: 0 };

        match rhs {
            // Address values: the operand is rbp-relative arithmetic, not a
            // load. Materialise the address itself.
            Val::Mem { spill: false, base, index, disp, .. } if !matches!(self.f.node(rhs_reg).data, NodeData::Load { .. }) => {
                let tmp = self.alloc_gpr(Owner::Temp);
                if index.is_none() && disp == 0 {
                    self.asm.inst2(Op2::Mov, &Val::Gpr(tmp), &Val::Gpr(base), 64);
                } else {
                    self.asm.inst2(Op2::Lea, &Val::Gpr(tmp), &rhs, 64);
                }
                self.asm.inst2(op, lhs, &Val::Gpr(tmp), l.bits);
                self.kill_temp_gpr(tmp);
            }
            _ if lhs.is_mem() && rhs.is_mem() => {
                let tmp = self.alloc_gpr(Owner::Temp);
                self.asm.inst2(Op2::Mov, &Val::Gpr(tmp), &rhs, l.bits);
                self.asm.inst2(op, lhs, &Val::Gpr(tmp), l.bits);
                self.kill_temp_gpr(tmp);
            }
            Val::Imm(imm) if !Self::op_takes_imm(op) => {
                let tmp = self.alloc_gpr(Owner::Temp);
                self.asm.inst2(Op2::Mov, &Val::Gpr(tmp), &Val::Imm(imm), l.bits);
                self.asm.inst2(op, lhs, &Val::Gpr(tmp), l.bits);
                self.kill_temp_gpr(tmp);
            }
            Val::Gpr(g) if op == Op2::Mov && lhs.as_gpr() == Some(g) => {
                // mov a, a
            }
            Val::Flags(cc) => {
                // Materialise a pending condition into a register first.
                // mov leaves EFLAGS intact, so it may precede the setcc.
                match (op, lhs.as_gpr()) {
                    (Op2::Mov, Some(d)) => {
                        self.asm.inst2(Op2::Mov, lhs, &Val::Imm(0), l.bits);
                        self.asm.setcc(cc, d);
                    }
                    _ => {
                        let tmp = self.alloc_gpr(Owner::Temp);
                        self.asm.inst2(Op2::Mov, &Val::Gpr(tmp), &Val::Imm(0), 32);
                        self.asm.setcc(cc, tmp);
                        self.asm.inst2(op, lhs, &Val::Gpr(tmp), l.bits);
                        self.kill_temp_gpr(tmp);
                    }
                }
            }
            _ => {
                self.asm.inst2(op, lhs, &rhs, l.bits);
            }
        }
        rhs
    }

    /// The SSE version of [`Ctx::folded_op`].
    pub fn folded_op_sse(&mut self, op: OpSse, lhs: &Val, rhs_reg: Reg) {
        let rhs = self.eval(rhs_reg);
        let double = is_double(self.f.node(rhs_reg).dt);

        if lhs.is_mem() && rhs.is_mem() {
            let tmp = self.alloc_xmm(Owner::Temp);
            self.asm.inst2_sse(OpSse::Mov, &Val::Xmm(tmp), &rhs, double);
            self.asm.inst2_sse(op, lhs, &Val::Xmm(tmp), double);
            self.kill_temp_xmm(tmp);
        } else if op == OpSse::Mov && matches!(rhs, Val::Xmm(x) if *lhs == Val::Xmm(x)) {
            // movss a, a
        } else {
            self.asm.inst2_sse(op, lhs, &rhs, double);
        }
    }

    /// Evaluate `r` as a branch condition: the condition code under which
    /// the value is non-zero.
    pub fn eval_cond(&mut self, r: Reg) -> Cond {
        let src = self.eval(r);
        let l = legalize_int(self.f.node(r).dt);

        match src {
            Val::Flags(cc) => cc,
            Val::Gpr(g) => {
                self.asm.inst2(Op2::Test, &Val::Gpr(g), &Val::Gpr(g), l.bits);
                Cond::Ne
            }
            Val::Mem { spill: true, .. } => {
                self.asm.inst2(Op2::Cmp, &src, &Val::Imm(0), l.bits);
                Cond::Ne
            }
            Val::Mem { .. } | Val::Global(_) => {
                // An address value: compare the computed address, not the
                // memory behind it.
                let tmp = self.alloc_gpr(Owner::Temp);
                self.asm.inst2(Op2::Lea, &Val::Gpr(tmp), &src, 64);
                self.asm.inst2(Op2::Test, &Val::Gpr(tmp), &Val::Gpr(tmp), 64);
                self.kill_temp_gpr(tmp);
                Cond::Ne
            }
            Val::Imm(imm) => {
                // Force a known ZF: xor sets it, then pick the branch sense
                // from the constant.
                let tmp = self.alloc_gpr(Owner::Temp);
                self.asm.inst2(Op2::Xor, &Val::Gpr(tmp), &Val::Gpr(tmp), 32);
                self.kill_temp_gpr(tmp);
                if imm != 0 { Cond::E } else { Cond::Ne }
            }
            Val::Xmm(_) => panic!("{}: float used as branch condition", self.f.name),
        }
    }

    /// Mask a result back down to a non-machine integer width.
    pub fn mask_out(&mut self, l: LegalInt, dst: &Val) {
        if l.mask <= i32::MAX as u64 {
            self.asm.inst2(Op2::And, dst, &Val::Imm(l.mask as i32), l.bits);
        } else {
            let tmp = self.alloc_gpr(Owner::Temp);
            self.asm.movabs(tmp, l.mask);
            self.asm.inst2(Op2::And, dst, &Val::Gpr(tmp), l.bits);
            self.kill_temp_gpr(tmp);
        }
    }

}
