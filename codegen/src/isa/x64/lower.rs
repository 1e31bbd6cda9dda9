//! Per-node lowering for the x86-64 fast code generator.
//!
//! One forward pass over each basic block. Every node is lowered into a
//! bounded burst of instructions; value locations and register ownership
//! are updated as a side effect. Address-producing nodes try to park their
//! result in the one-slot tile so the following load or store can fold the
//! whole `[base + index * scale + disp]` expression into its memory
//! operand.

use crate::ir::node::{AtomicOp, FloatCond, FloatOp, IntCond, IntOp, NodeData, UnaryOp};
use crate::ir::Reg;
use crate::isa::x64::alloc::{is_double, legalize_int, Ctx, Owner, Tile, ValueLoc};
use crate::isa::x64::encode::{Op1, Op2, OpSse, ShiftKind, Val};
use crate::isa::x64::regs::{
    caller_saved_gprs, param_gpr, param_gpr_count, param_xmm_count, Cond, Gpr, Xmm,
};
use crate::binemit::LineInfo;
use crate::isa::CallConv;
use smallvec::SmallVec;

fn int_op2(op: IntOp) -> Op2 {
    match op {
        IntOp::Add => Op2::Add,
        IntOp::Sub => Op2::Sub,
        IntOp::Mul => Op2::Imul,
        IntOp::And => Op2::And,
        IntOp::Or => Op2::Or,
        IntOp::Xor => Op2::Xor,
        _ => panic!("{op:?} has no direct two-operand form"),
    }
}

fn float_sse(op: FloatOp) -> OpSse {
    match op {
        FloatOp::Add => OpSse::Add,
        FloatOp::Sub => OpSse::Sub,
        FloatOp::Mul => OpSse::Mul,
        FloatOp::Div => OpSse::Div,
    }
}

impl<'a> Ctx<'a> {
    /// True when the pending tile belongs to `addr`.
    fn tile_covers(&self, addr: Reg) -> bool {
        self.tile.map_or(false, |t| t.mapping == addr)
    }

    /// The address operand of a memory access, folding the tile if the
    /// access owns it.
    fn access_address(&mut self, addr: Reg) -> Val {
        if self.tile_covers(addr) { self.use_tile(addr) } else { self.eval_address(addr) }
    }

    /// Lower the body of one basic block, label and terminator excluded.
    pub fn lower_block(&mut self, bb: Reg, bb_end: Reg) {
        for i in bb.as_u32() + 1..bb_end.as_u32() {
            let r = Reg::from_u32(i);
            self.ensure_headroom(r);
            self.step_tile(r);
            self.lower_node(r);

            if let Some(t) = self.temp_load.take() {
                self.kill_temp_gpr(t);
            }
            self.barrier = r.as_u32();
        }

        // The tile never crosses a block boundary.
        if self.tile.is_some() {
            self.spill_tile();
        }
    }

    /// Decide whether the pending tile survives into this node.
    fn step_tile(&mut self, r: Reg) {
        let Some(tile) = self.tile else { return };
        let n = self.f.node(r);

        let mut keep = false;
        if self.use_count[r.index()] <= 1 && self.use_count[tile.mapping.index()] <= 1 {
            match n.data {
                NodeData::Load { addr, .. } if addr == tile.mapping => keep = true,
                NodeData::Store { addr, .. } if addr == tile.mapping => keep = true,
                NodeData::AtomicLoad { addr, .. } | NodeData::AtomicRmw { addr, .. }
                    if addr == tile.mapping =>
                {
                    keep = true
                }
                _ => {}
            }
        }

        // A sign extension of a load can still swallow the tile.
        if let NodeData::Unary { op: UnaryOp::Sext, value } = n.data {
            if let NodeData::Load { addr, .. } = self.f.node(value).data {
                if addr == tile.mapping && self.use_count[value.index()] == 1 {
                    keep = true;
                }
            }
        }

        // An rbp-relative tile is a constant address; park it as one.
        if tile.base == Gpr::Rbp && tile.index.is_none() {
            self.set_loc(tile.mapping, ValueLoc::Stack(tile.disp));
            self.tile = None;
            return;
        }

        if !keep {
            self.spill_tile();
        }
    }

    fn lower_node(&mut self, r: Reg) {
        let dt = self.f.node(r).dt;
        match self.f.node(r).data.clone() {
            NodeData::Nop
            | NodeData::Param { .. }
            | NodeData::Phi1 { .. }
            | NodeData::Phi2 { .. }
            | NodeData::PhiN { .. }
            | NodeData::GlobalAddr { .. }
            | NodeData::ParamAddr { .. }
            | NodeData::Local { .. }
            | NodeData::AtomicCmpxchgOld { .. } => {}

            NodeData::Restrict { value } => {
                // Aliasing metadata carries no code; the pointer passes
                // through untouched.
                let dst = self.alloc_gpr(Owner::Node(r));
                self.set_loc(r, ValueLoc::Gpr(dst));
                self.folded_op(Op2::Mov, &Val::Gpr(dst), value);
                self.kill(value);
            }

            NodeData::Pass { value } => {
                // Compaction normally removes these; lower as a plain copy.
                if dt.is_float() {
                    let dst = self.alloc_xmm(Owner::Node(r));
                    self.set_loc(r, ValueLoc::Xmm(dst));
                    self.folded_op_sse(OpSse::Mov, &Val::Xmm(dst), value);
                } else {
                    let dst = self.alloc_gpr(Owner::Node(r));
                    self.set_loc(r, ValueLoc::Gpr(dst));
                    self.folded_op(Op2::Mov, &Val::Gpr(dst), value);
                }
                self.kill(value);
            }

            NodeData::UintConst { imm } => {
                if imm > i32::MAX as u64 {
                    let dst = self.alloc_gpr(Owner::Node(r));
                    self.set_loc(r, ValueLoc::Gpr(dst));
                    self.asm.movabs(dst, imm);
                }
            }
            NodeData::SintConst { imm } => {
                let wide = crate::ir::builder::sign_extend(imm as u64, dt.lane_bits().max(1));
                if wide != i64::from(wide as i32) {
                    let dst = self.alloc_gpr(Owner::Node(r));
                    self.set_loc(r, ValueLoc::Gpr(dst));
                    self.asm.movabs(dst, wide as u64);
                }
            }
            NodeData::FloatConst { imm } => {
                let double = is_double(dt);
                let dst = self.alloc_xmm(Owner::Node(r));
                self.set_loc(r, ValueLoc::Xmm(dst));
                if imm == 0.0 && !imm.is_sign_negative() {
                    self.asm.xorps(dst, dst);
                } else if double {
                    self.asm.sse_load_rodata(dst, &imm.to_bits().to_le_bytes(), true);
                } else {
                    self.asm.sse_load_rodata(dst, &(imm as f32).to_bits().to_le_bytes(), false);
                }
            }
            NodeData::StringConst { data } => {
                let dst = self.alloc_gpr(Owner::Node(r));
                self.set_loc(r, ValueLoc::Gpr(dst));
                self.asm.lea_rip_rodata(dst, &data, 1);
            }
            NodeData::FuncAddr { func } => {
                let dst = self.alloc_gpr(Owner::Node(r));
                self.set_loc(r, ValueLoc::Gpr(dst));
                self.asm.lea_rip_func(dst, func);
            }
            NodeData::ExternAddr { ext } => {
                let dst = self.alloc_gpr(Owner::Node(r));
                self.set_loc(r, ValueLoc::Gpr(dst));
                self.asm.lea_rip_extern(dst, ext);
            }

            NodeData::Line { file, line } => {
                self.lines.push(LineInfo { file, line, offset: self.asm.offset() });
            }
            NodeData::DebugBreak => self.asm.int3(),

            NodeData::VaStart { base } => {
                assert!(!self.is_sysv, "{}: va_start without the Windows ABI", self.f.name);
                let mut addr = self.eval_address(base);
                let Val::Mem { disp, .. } = &mut addr else {
                    panic!("{}: va_start operand is not a frame slot", self.f.name)
                };
                // The variadic area begins one slot past the named
                // parameter's home.
                *disp += 8;
                let dst = self.alloc_gpr(Owner::Node(r));
                self.set_loc(r, ValueLoc::Gpr(dst));
                self.asm.inst2(Op2::Lea, &Val::Gpr(dst), &addr, 64);
                self.kill(base);
            }

            NodeData::MemberAccess { base, offset } => {
                let addr = self.eval_address(base);
                match addr {
                    Val::Mem { base: mb, index, scale, disp, .. } => {
                        debug_assert!(self.tile.is_none());
                        self.tile = Some(Tile {
                            mapping: r,
                            base: mb,
                            index,
                            scale,
                            disp: disp + offset,
                        });
                    }
                    Val::Global(_) => {
                        let dst = self.alloc_gpr(Owner::Node(r));
                        self.set_loc(r, ValueLoc::Gpr(dst));
                        self.asm.inst2(Op2::Lea, &Val::Gpr(dst), &addr, 64);
                        if offset != 0 {
                            self.asm.inst2(Op2::Add, &Val::Gpr(dst), &Val::Imm(offset), 64);
                        }
                    }
                    _ => panic!("{}: bad member access base {addr:?}", self.f.name),
                }
                self.kill(base);
            }

            NodeData::ArrayAccess { base, index, stride } => {
                // Scale the index first, then either park the whole
                // expression in the tile or fold the base in with an add.
                let idx = if self.use_count[index.index()] == 1
                    && matches!(self.locs[index.index()], ValueLoc::Gpr(_))
                {
                    match self.eval(index) {
                        Val::Gpr(g) => g,
                        _ => unreachable!(),
                    }
                } else {
                    let g = self.alloc_gpr(Owner::Node(r));
                    self.folded_op(Op2::Mov, &Val::Gpr(g), index);
                    g
                };

                let mut scale_shift = 0u8;
                if stride.is_power_of_two() {
                    let shift = stride.trailing_zeros() as u8;
                    if shift > 3 {
                        self.asm.shift_imm(ShiftKind::Shl, &Val::Gpr(idx), shift, 64);
                    } else {
                        scale_shift = shift;
                    }
                } else {
                    self.asm.imul_imm(idx, &Val::Gpr(idx), stride as i32, 64);
                }

                if scale_shift > 0 {
                    debug_assert!(self.tile.is_none());
                    let base_gpr = if self.use_count[base.index()] == 1
                        && matches!(self.locs[base.index()], ValueLoc::Gpr(_))
                    {
                        match self.eval(base) {
                            Val::Gpr(g) => g,
                            _ => unreachable!(),
                        }
                    } else {
                        let tmp = self.alloc_gpr(Owner::Temp);
                        self.folded_op(Op2::Mov, &Val::Gpr(tmp), base);
                        tmp
                    };
                    self.tile = Some(Tile {
                        mapping: r,
                        base: base_gpr,
                        index: Some(idx),
                        scale: scale_shift,
                        disp: 0,
                    });
                } else {
                    self.folded_op(Op2::Add, &Val::Gpr(idx), base);
                    self.set_loc(r, ValueLoc::Gpr(idx));
                    self.rename_gpr_owner(idx, r);
                }
                self.kill(base);
            }

            NodeData::Load { addr, .. } | NodeData::AtomicLoad { addr, .. } => {
                if self.tile_covers(addr) {
                    // A following sign extension reads through the tile
                    // itself.
                    let next = Reg::from_u32(r.as_u32() + 1);
                    if (next.as_u32()) < self.f.len() {
                        if let NodeData::Unary { op: UnaryOp::Sext, value } =
                            self.f.node(next).data
                        {
                            if value == r {
                                return;
                            }
                        }
                    }
                }
                let src = self.access_address(addr);

                if dt.is_float() || dt.is_vector() {
                    let dst = self.alloc_xmm(Owner::Node(r));
                    self.set_loc(r, ValueLoc::Xmm(dst));
                    self.asm.inst2_sse(OpSse::Mov, &Val::Xmm(dst), &src, is_double(dt));
                } else {
                    let l = legalize_int(dt);
                    let dst = self.alloc_gpr(Owner::Node(r));
                    self.set_loc(r, ValueLoc::Gpr(dst));
                    self.asm.inst2(Op2::Mov, &Val::Gpr(dst), &src, l.bits);
                    if l.mask != 0 {
                        self.mask_out(l, &Val::Gpr(dst));
                    }
                }
                self.release_address_temps(&src);
                self.kill(addr);
            }

            NodeData::Store { addr, value, .. } => {
                let dst = self.access_address(addr);
                if dt.is_float() || dt.is_vector() {
                    self.folded_op_sse(OpSse::Mov, &dst, value);
                } else {
                    self.folded_op(Op2::Mov, &dst, value);
                }
                self.release_address_temps(&dst);
                self.kill(addr);
                self.kill(value);
            }

            NodeData::Initialize { addr, size } => {
                self.memset_const_size(addr, &Val::Imm(0), size as u64, true);
                self.kill(addr);
            }
            NodeData::Memclr { addr, size, .. } => {
                self.memset_const_size(addr, &Val::Imm(0), u64::from(size), true);
                self.kill(addr);
            }

            NodeData::Memset { dst, value, size, .. } => {
                if let Some(sz) = self.f.node(size).data.as_int_const() {
                    assert!(sz > 0, "{}: memset of zero bytes", self.f.name);
                    let src = self.alloc_gpr(Owner::Temp);
                    self.asm.inst2(Op2::Xor, &Val::Gpr(src), &Val::Gpr(src), 32);
                    if self.f.node(value).data.as_int_const() == Some(0) {
                        self.use_count[value.index()] -= 1;
                        self.memset_const_size(dst, &Val::Gpr(src), sz, true);
                    } else {
                        // Splat the fill byte across a 32-bit pattern.
                        self.folded_op(Op2::Mov, &Val::Gpr(src), value);
                        self.asm.inst2(Op2::And, &Val::Gpr(src), &Val::Imm(0xFF), 32);
                        self.asm.imul_imm(src, &Val::Gpr(src), 0x0101_0101, 32);
                        self.memset_const_size(dst, &Val::Gpr(src), sz, false);
                    }
                    self.kill_temp_gpr(src);
                    self.use_count[size.index()] -= 1;
                    self.kill(dst);
                    self.kill(value);
                    self.kill(size);
                    return;
                }

                // rep stosb wants rax, rdi, rcx.
                self.reserve_gpr(Gpr::Rax);
                self.folded_op(Op2::Mov, &Val::Gpr(Gpr::Rax), value);
                self.reserve_gpr(Gpr::Rdi);
                self.folded_op(Op2::Mov, &Val::Gpr(Gpr::Rdi), dst);
                self.reserve_gpr(Gpr::Rcx);
                self.folded_op(Op2::Mov, &Val::Gpr(Gpr::Rcx), size);
                self.asm.rep_stosb();
                self.release_gpr(Gpr::Rax);
                self.release_gpr(Gpr::Rdi);
                self.release_gpr(Gpr::Rcx);
                self.kill(dst);
                self.kill(value);
                self.kill(size);
            }

            NodeData::Memcpy { dst, src, size, .. } => {
                self.reserve_gpr(Gpr::Rdi);
                self.folded_op(Op2::Mov, &Val::Gpr(Gpr::Rdi), dst);
                self.reserve_gpr(Gpr::Rsi);
                self.folded_op(Op2::Mov, &Val::Gpr(Gpr::Rsi), src);
                self.reserve_gpr(Gpr::Rcx);
                self.folded_op(Op2::Mov, &Val::Gpr(Gpr::Rcx), size);
                self.asm.rep_movsb();
                self.release_gpr(Gpr::Rdi);
                self.release_gpr(Gpr::Rsi);
                self.release_gpr(Gpr::Rcx);
                self.kill(dst);
                self.kill(src);
                self.kill(size);
            }

            NodeData::IntBinary { op, a, b, .. } => match op {
                IntOp::Add | IntOp::Sub | IntOp::Mul | IntOp::And | IntOp::Or | IntOp::Xor => {
                    self.lower_simple_binary(r, int_op2(op), a, b);
                }
                IntOp::Udiv | IntOp::Sdiv | IntOp::Umod | IntOp::Smod => {
                    self.lower_div(r, op, a, b);
                }
                IntOp::Shl | IntOp::Shr | IntOp::Sar => {
                    let kind = match op {
                        IntOp::Shl => ShiftKind::Shl,
                        IntOp::Shr => ShiftKind::Shr,
                        _ => ShiftKind::Sar,
                    };
                    self.lower_shift(r, kind, a, b);
                }
            },

            NodeData::FloatBinary { op, a, b } => {
                let sse = float_sse(op);
                if self.use_count[a.index()] == 1 {
                    if let ValueLoc::Xmm(x) = self.locs[a.index()] {
                        self.use_count[a.index()] -= 1;
                        self.rename_xmm_owner(x, r);
                        self.set_loc(r, ValueLoc::Xmm(x));
                        self.folded_op_sse(sse, &Val::Xmm(x), b);
                        if a != b {
                            self.kill(b);
                        }
                        return;
                    }
                }
                let dst = self.alloc_xmm(Owner::Node(r));
                self.set_loc(r, ValueLoc::Xmm(dst));
                self.folded_op_sse(OpSse::Mov, &Val::Xmm(dst), a);
                self.folded_op_sse(sse, &Val::Xmm(dst), b);
                self.kill(a);
                if a != b {
                    self.kill(b);
                }
            }

            NodeData::Icmp { cond, a, b, operand_dt } => {
                self.lower_cmp(r, CmpKind::Int(cond), a, b, operand_dt);
            }
            NodeData::Fcmp { cond, a, b, operand_dt } => {
                self.lower_cmp(r, CmpKind::Float(cond), a, b, operand_dt);
            }

            NodeData::Select { cond, then_value, else_value } => {
                if dt.is_float() {
                    unimplemented!("float select");
                }
                let l = legalize_int(dt);
                let dst = self.alloc_gpr(Owner::Node(r));
                self.set_loc(r, ValueLoc::Gpr(dst));
                self.folded_op(Op2::Mov, &Val::Gpr(dst), else_value);
                let tmp = self.alloc_gpr(Owner::Temp);
                self.folded_op(Op2::Mov, &Val::Gpr(tmp), then_value);
                let cc = self.eval_cond(cond);
                self.asm.cmovcc(cc, dst, &Val::Gpr(tmp), l.bits);
                self.kill_temp_gpr(tmp);
                self.kill(cond);
                self.kill(then_value);
                self.kill(else_value);
            }

            NodeData::Unary { op, value } => self.lower_unary(r, op, value),

            NodeData::Call { target, args } => {
                let args: SmallVec<[Reg; 8]> = self.f.call_args(args).collect();
                self.lower_call(r, CallTarget::Direct(target), &args);
            }
            NodeData::ECall { target, args } => {
                let args: SmallVec<[Reg; 8]> = self.f.call_args(args).collect();
                self.lower_call(r, CallTarget::Extern(target), &args);
            }
            NodeData::VCall { target, args } => {
                let args: SmallVec<[Reg; 8]> = self.f.call_args(args).collect();
                self.lower_call(r, CallTarget::Indirect(target), &args);
            }

            NodeData::AtomicRmw { op, addr, src, .. } => {
                self.lower_atomic_rmw(r, op, addr, src);
            }
            NodeData::AtomicCmpxchg { addr, expected, .. } => {
                self.lower_cmpxchg(r, addr, expected);
            }
            NodeData::AtomicTestAndSet { .. } => {
                unimplemented!("atomic test-and-set")
            }
            NodeData::AtomicClear { .. } => unimplemented!("atomic clear"),

            NodeData::Label { .. }
            | NodeData::Goto { .. }
            | NodeData::BrIf { .. }
            | NodeData::Switch { .. }
            | NodeData::Ret { .. }
            | NodeData::Unreachable => {
                panic!("{}: terminator {r} inside a block body", self.f.name)
            }
        }
    }

    /// Free scratch registers a consumed tile was holding its base or
    /// index in.
    fn release_address_temps(&mut self, addr: &Val) {
        if let Val::Mem { base, index, .. } = addr {
            self.kill_temp_gpr(*base);
            if let Some(i) = index {
                self.kill_temp_gpr(*i);
            }
        }
    }

    /// Straight-line stores for a constant-size fill, walking down from
    /// 8-byte chunks.
    fn memset_const_size(&mut self, addr: Reg, src: &Val, size: u64, allow_8byte: bool) {
        let mut dst = self.access_address(addr);
        assert!(
            matches!(dst, Val::Mem { .. }),
            "{}: memset destination is not a frame or pointer address",
            self.f.name
        );

        let mut left = size;
        if allow_8byte {
            while left >= 8 {
                self.asm.inst2(Op2::Mov, &dst, src, 64);
                left -= 8;
                if let Val::Mem { disp, .. } = &mut dst {
                    *disp += 8;
                }
            }
        }
        for (chunk, bits) in [(4u64, 32u8), (2, 16), (1, 8)] {
            while left >= chunk {
                self.asm.inst2(Op2::Mov, &dst, src, bits);
                left -= chunk;
                if let Val::Mem { disp, .. } = &mut dst {
                    *disp += chunk as i32;
                }
            }
        }
        self.release_address_temps(&dst);
    }

    fn lower_simple_binary(&mut self, r: Reg, op: Op2, a: Reg, b: Reg) {
        if self.use_count[a.index()] == 1 {
            if let ValueLoc::Gpr(g) = self.locs[a.index()] {
                // Rename: reuse a's register for the result.
                self.use_count[a.index()] -= 1;
                self.rename_gpr_owner(g, r);
                self.set_loc(r, ValueLoc::Gpr(g));
                self.folded_op(op, &Val::Gpr(g), b);
                if a != b {
                    self.kill(b);
                }
                return;
            }
        }
        let dst = self.alloc_gpr(Owner::Node(r));
        self.set_loc(r, ValueLoc::Gpr(dst));
        self.folded_op(Op2::Mov, &Val::Gpr(dst), a);
        self.folded_op(op, &Val::Gpr(dst), b);
        self.kill(a);
        if a != b {
            self.kill(b);
        }
    }

    fn lower_div(&mut self, r: Reg, op: IntOp, a: Reg, b: Reg) {
        let dt = self.f.node(r).dt;
        if dt.is_vector() {
            unimplemented!("vector division");
        }
        let signed = matches!(op, IntOp::Sdiv | IntOp::Smod);
        let is_div = matches!(op, IntOp::Sdiv | IntOp::Udiv);

        self.reserve_gpr(Gpr::Rax);
        self.reserve_gpr(Gpr::Rdx);

        let l = legalize_int(dt);
        // Narrow divisions run at 32 bits with extended operands; the
        // 8/16-bit hardware forms use AH and are not worth the trouble.
        let div_bits = if l.bits == 64 { 64 } else { 32 };

        self.folded_op(Op2::Mov, &Val::Gpr(Gpr::Rax), a);
        if l.bits < 32 {
            let ext = extend_op(signed, l.bits);
            self.asm.inst2(ext, &Val::Gpr(Gpr::Rax), &Val::Gpr(Gpr::Rax), 32);
        }

        if signed {
            self.asm.sign_extend_ax(div_bits == 64);
        } else {
            self.asm.inst2(Op2::Xor, &Val::Gpr(Gpr::Rdx), &Val::Gpr(Gpr::Rdx), 32);
        }

        let tmp = self.alloc_gpr(Owner::Temp);
        self.folded_op(Op2::Mov, &Val::Gpr(tmp), b);
        if l.bits < 32 {
            let ext = extend_op(signed, l.bits);
            self.asm.inst2(ext, &Val::Gpr(tmp), &Val::Gpr(tmp), 32);
        }
        self.asm.inst1(if signed { Op1::Idiv } else { Op1::Div }, &Val::Gpr(tmp), div_bits);
        self.kill_temp_gpr(tmp);

        self.kill(a);
        if a != b {
            self.kill(b);
        }

        let result = if is_div { Gpr::Rax } else { Gpr::Rdx };
        let other = if is_div { Gpr::Rdx } else { Gpr::Rax };
        self.set_loc(r, ValueLoc::Gpr(result));
        self.rename_gpr_owner(result, r);
        self.release_gpr(other);

        if l.mask != 0 {
            self.mask_out(l, &Val::Gpr(result));
        }
    }

    fn lower_shift(&mut self, r: Reg, kind: ShiftKind, a: Reg, b: Reg) {
        let dt = self.f.node(r).dt;
        let l = legalize_int(dt);

        if let Some(imm) = self.f.node(b).data.as_int_const() {
            let dst = self.alloc_gpr(Owner::Node(r));
            self.set_loc(r, ValueLoc::Gpr(dst));
            self.folded_op(Op2::Mov, &Val::Gpr(dst), a);
            self.asm.shift_imm(kind, &Val::Gpr(dst), (imm & 63) as u8, l.bits);
            if l.mask != 0 {
                self.mask_out(l, &Val::Gpr(dst));
            }
            self.use_count[b.index()] -= 1;
            self.kill(a);
            self.kill(b);
            return;
        }

        // Variable counts go through cl.
        self.reserve_gpr(Gpr::Rcx);
        let dst = self.alloc_gpr(Owner::Node(r));
        self.set_loc(r, ValueLoc::Gpr(dst));
        self.folded_op(Op2::Mov, &Val::Gpr(dst), a);
        self.folded_op(Op2::Mov, &Val::Gpr(Gpr::Rcx), b);
        self.asm.shift_cl(kind, &Val::Gpr(dst), l.bits);
        if l.mask != 0 {
            self.mask_out(l, &Val::Gpr(dst));
        }
        self.release_gpr(Gpr::Rcx);
        self.kill(a);
        if a != b {
            self.kill(b);
        }
    }

    fn lower_cmp(&mut self, r: Reg, kind: CmpKind, a: Reg, b: Reg, operand_dt: crate::ir::DataType) {
        if operand_dt.is_vector() {
            unimplemented!("vector compare");
        }

        // If the only consumer is the branch right behind us, leave the
        // result in EFLAGS.
        let next = Reg::from_u32(r.as_u32() + 1);
        let returns_flags = self.use_count[r.index()] == 1
            && (next.as_u32()) < self.f.len()
            && matches!(self.f.node(next).data, NodeData::BrIf { cond, .. } if cond == r);

        let dst = if returns_flags {
            None
        } else {
            let g = self.alloc_gpr(Owner::Node(r));
            self.set_loc(r, ValueLoc::Gpr(g));
            // Zero the destination ahead of the compare; xor would wipe
            // the flags afterwards.
            self.asm.inst2(Op2::Xor, &Val::Gpr(g), &Val::Gpr(g), 32);
            Some(g)
        };

        let cc = match kind {
            CmpKind::Float(cond) => {
                let tmp = self.alloc_xmm(Owner::Temp);
                self.folded_op_sse(OpSse::Mov, &Val::Xmm(tmp), a);
                self.folded_op_sse(OpSse::Ucomi, &Val::Xmm(tmp), b);
                self.kill_temp_xmm(tmp);
                match cond {
                    FloatCond::Eq => Cond::E,
                    FloatCond::Ne => Cond::Ne,
                    FloatCond::Lt => Cond::B,
                    FloatCond::Le => Cond::Be,
                }
            }
            CmpKind::Int(cond) => {
                let (mut lhs, mut rhs) = (a, b);
                let mut inverted = false;
                if self.f.node(a).data.as_int_const().is_some() {
                    core::mem::swap(&mut lhs, &mut rhs);
                    inverted = true;
                }

                let reuse = self.use_count[lhs.index()] == 1
                    && matches!(self.locs[lhs.index()], ValueLoc::Gpr(_));
                if reuse {
                    let ValueLoc::Gpr(g) = self.locs[lhs.index()] else { unreachable!() };
                    self.use_count[lhs.index()] -= 1;
                    self.folded_op(Op2::Cmp, &Val::Gpr(g), rhs);
                } else {
                    let tmp = self.alloc_gpr(Owner::Temp);
                    self.folded_op(Op2::Mov, &Val::Gpr(tmp), lhs);
                    self.folded_op(Op2::Cmp, &Val::Gpr(tmp), rhs);
                    self.kill_temp_gpr(tmp);
                }

                match (cond, inverted) {
                    (IntCond::Eq, _) => Cond::E,
                    (IntCond::Ne, _) => Cond::Ne,
                    (IntCond::Slt, false) => Cond::L,
                    (IntCond::Slt, true) => Cond::G,
                    (IntCond::Sle, false) => Cond::Le,
                    (IntCond::Sle, true) => Cond::Ge,
                    (IntCond::Ult, false) => Cond::B,
                    (IntCond::Ult, true) => Cond::A,
                    (IntCond::Ule, false) => Cond::Be,
                    (IntCond::Ule, true) => Cond::Nb,
                }
            }
        };

        match dst {
            Some(g) => self.asm.setcc(cc, g),
            None => self.set_loc(r, ValueLoc::Flags(cc)),
        }

        self.kill(a);
        if a != b {
            self.kill(b);
        }
    }

    fn lower_unary(&mut self, r: Reg, op: UnaryOp, value: Reg) {
        let dt = self.f.node(r).dt;
        if dt.is_vector() {
            unimplemented!("vector unary operations");
        }
        match op {
            UnaryOp::Not | UnaryOp::Neg => {
                if dt.is_float() {
                    assert!(op == UnaryOp::Neg, "float bitwise not");
                    // Flip the sign bit with a pooled mask.
                    let dst = self.alloc_xmm(Owner::Node(r));
                    self.set_loc(r, ValueLoc::Xmm(dst));
                    self.folded_op_sse(OpSse::Mov, &Val::Xmm(dst), value);
                    let mask: Vec<u8> = if is_double(dt) {
                        (0..2).flat_map(|_| (1u64 << 63).to_le_bytes()).collect()
                    } else {
                        (0..4).flat_map(|_| (1u32 << 31).to_le_bytes()).collect()
                    };
                    self.asm.xorps_rodata(dst, &mask, 16);
                } else {
                    let l = legalize_int(dt);
                    let dst = self.alloc_gpr(Owner::Node(r));
                    self.set_loc(r, ValueLoc::Gpr(dst));
                    self.folded_op(Op2::Mov, &Val::Gpr(dst), value);
                    self.asm.inst1(
                        if op == UnaryOp::Not { Op1::Not } else { Op1::Neg },
                        &Val::Gpr(dst),
                        l.bits,
                    );
                    if l.mask != 0 {
                        self.mask_out(l, &Val::Gpr(dst));
                    }
                }
                self.kill(value);
            }

            UnaryOp::Sqrt | UnaryOp::Rsqrt => {
                if op == UnaryOp::Rsqrt {
                    assert!(!is_double(dt), "rsqrt exists only for f32");
                }
                let dst = self.alloc_xmm(Owner::Node(r));
                self.set_loc(r, ValueLoc::Xmm(dst));
                self.folded_op_sse(
                    if op == UnaryOp::Sqrt { OpSse::Sqrt } else { OpSse::Rsqrt },
                    &Val::Xmm(dst),
                    value,
                );
                self.kill(value);
            }

            UnaryOp::Trunc => {
                if dt.is_float() {
                    let src = self.eval(value);
                    let dst = self.alloc_xmm(Owner::Node(r));
                    self.set_loc(r, ValueLoc::Xmm(dst));
                    self.asm.inst2_sse(
                        OpSse::Cvt,
                        &Val::Xmm(dst),
                        &src,
                        is_double(self.f.node(value).dt),
                    );
                } else {
                    let l = legalize_int(dt);
                    let dst = self.alloc_gpr(Owner::Node(r));
                    self.set_loc(r, ValueLoc::Gpr(dst));
                    self.folded_op(Op2::Mov, &Val::Gpr(dst), value);
                    if l.mask != 0 {
                        self.mask_out(l, &Val::Gpr(dst));
                    }
                }
                self.kill(value);
            }

            UnaryOp::Sext | UnaryOp::Zext | UnaryOp::IntToPtr => {
                self.lower_extend(r, op == UnaryOp::Sext, value);
            }

            UnaryOp::PtrToInt => {
                let l = legalize_int(dt);
                let dst = self.alloc_gpr(Owner::Node(r));
                self.set_loc(r, ValueLoc::Gpr(dst));
                self.folded_op(Op2::Mov, &Val::Gpr(dst), value);
                if l.mask != 0 {
                    self.mask_out(l, &Val::Gpr(dst));
                }
                self.kill(value);
            }

            UnaryOp::FloatExt => {
                let src = self.eval(value);
                let src_dt = self.f.node(value).dt;
                let dst = self.alloc_xmm(Owner::Node(r));
                self.set_loc(r, ValueLoc::Xmm(dst));
                if src_dt == dt {
                    self.asm.inst2_sse(OpSse::Mov, &Val::Xmm(dst), &src, is_double(dt));
                } else {
                    self.asm.inst2_sse(OpSse::Cvt, &Val::Xmm(dst), &src, is_double(src_dt));
                }
                self.kill(value);
            }

            UnaryOp::IntToFloat | UnaryOp::UintToFloat => {
                let src_dt = self.f.node(value).dt;
                let src_bits = legalize_int(src_dt).bits;
                let tmp = self.alloc_gpr(Owner::Temp);
                self.folded_op(Op2::Mov, &Val::Gpr(tmp), value);
                if op == UnaryOp::UintToFloat && src_bits <= 32 {
                    // Clear the upper half so the widening conversion sees
                    // the unsigned value.
                    self.asm.inst2(Op2::Mov, &Val::Gpr(tmp), &Val::Gpr(tmp), 32);
                }
                let dst = self.alloc_xmm(Owner::Node(r));
                self.set_loc(r, ValueLoc::Xmm(dst));
                let int64 = src_bits > 32 || op == UnaryOp::UintToFloat;
                self.asm.cvt_int_to_float(dst, &Val::Gpr(tmp), is_double(dt), int64);
                self.kill_temp_gpr(tmp);
                self.kill(value);
            }

            UnaryOp::FloatToInt | UnaryOp::FloatToUint => {
                let src_dt = self.f.node(value).dt;
                let tmp = self.alloc_xmm(Owner::Temp);
                self.folded_op_sse(OpSse::Mov, &Val::Xmm(tmp), value);
                let dst = self.alloc_gpr(Owner::Node(r));
                self.set_loc(r, ValueLoc::Gpr(dst));
                let int64 = dt.lane_bits() > 32 || op == UnaryOp::FloatToUint;
                self.asm.cvt_float_to_int(dst, &Val::Xmm(tmp), is_double(src_dt), int64);
                self.kill_temp_xmm(tmp);
                self.kill(value);
            }

            UnaryOp::Bitcast => {
                let src = self.eval(value);
                let src_dt = self.f.node(value).dt;
                debug_assert_eq!(src_dt.bytes(), dt.bytes());
                let src_int = src_dt.is_int() || src_dt.is_ptr();
                let dst_int = dt.is_int() || dt.is_ptr();
                let wide = dt.bytes() > 4;

                match (src_int, dst_int) {
                    (true, false) => {
                        let dst = self.alloc_xmm(Owner::Node(r));
                        self.set_loc(r, ValueLoc::Xmm(dst));
                        match src {
                            Val::Gpr(g) => self.asm.mov_gpr_xmm(dst, g, true, wide),
                            ref m if m.is_mem() => {
                                self.asm.inst2_sse(OpSse::Mov, &Val::Xmm(dst), m, is_double(dt))
                            }
                            _ => {
                                let tmp = self.alloc_gpr(Owner::Temp);
                                self.asm.inst2(Op2::Mov, &Val::Gpr(tmp), &src, 64);
                                self.asm.mov_gpr_xmm(dst, tmp, true, wide);
                                self.kill_temp_gpr(tmp);
                            }
                        }
                    }
                    (false, true) => {
                        let dst = self.alloc_gpr(Owner::Node(r));
                        self.set_loc(r, ValueLoc::Gpr(dst));
                        match src {
                            Val::Xmm(x) => self.asm.mov_gpr_xmm(x, dst, false, wide),
                            ref m if m.is_mem() => {
                                let l = legalize_int(dt);
                                self.asm.inst2(Op2::Mov, &Val::Gpr(dst), m, l.bits)
                            }
                            _ => panic!("{}: bad bitcast source {src:?}", self.f.name),
                        }
                    }
                    _ => {
                        // Same register class: a plain copy.
                        if dt.is_float() {
                            let dst = self.alloc_xmm(Owner::Node(r));
                            self.set_loc(r, ValueLoc::Xmm(dst));
                            self.asm.inst2_sse(OpSse::Mov, &Val::Xmm(dst), &src, is_double(dt));
                        } else {
                            let l = legalize_int(dt);
                            let dst = self.alloc_gpr(Owner::Node(r));
                            self.set_loc(r, ValueLoc::Gpr(dst));
                            self.asm.inst2(Op2::Mov, &Val::Gpr(dst), &src, l.bits);
                        }
                    }
                }
                self.kill(value);
            }
        }
    }

    fn lower_extend(&mut self, r: Reg, sign: bool, value: Reg) {
        let dt = self.f.node(r).dt;
        let src_dt = self.f.node(value).dt;
        let src = legalize_int(src_dt);
        let dst_l = legalize_int(dt);

        // A 32-bit value in a register is already zero extended.
        if !sign
            && src.bits >= 32
            && src.mask == 0
            && self.use_count[value.index()] == 1
            && matches!(self.locs[value.index()], ValueLoc::Gpr(_))
        {
            let ValueLoc::Gpr(g) = self.locs[value.index()] else { unreachable!() };
            self.use_count[value.index()] -= 1;
            self.rename_gpr_owner(g, r);
            self.set_loc(r, ValueLoc::Gpr(g));
            return;
        }

        let (op2, bits) = match (src.bits, sign) {
            (64, _) => (Op2::Mov, 64),
            (32, true) => (Op2::Movsxd, 64),
            (32, false) => (Op2::Mov, 32),
            (16, true) => (Op2::Movsxw, dst_l.bits.max(32)),
            (16, false) => (Op2::Movzxw, 32),
            (8, true) => (Op2::Movsxb, dst_l.bits.max(32)),
            (8, false) => (Op2::Movzxb, 32),
            _ => unreachable!(),
        };

        let dst = self.alloc_gpr(Owner::Node(r));
        self.set_loc(r, ValueLoc::Gpr(dst));

        // A deferred load can feed the extension straight from memory.
        if let NodeData::Load { addr, .. } = self.f.node(value).data {
            if self.tile_covers(addr) {
                let mem = self.use_tile(addr);
                self.asm.inst2(op2, &Val::Gpr(dst), &mem, bits);
                self.release_address_temps(&mem);
                self.use_count[value.index()] -= 1;
                if src.mask != 0 && sign {
                    self.sext_from_odd_width(dst, src, dst_l.bits);
                }
                if dst_l.mask != 0 {
                    self.mask_out(dst_l, &Val::Gpr(dst));
                }
                self.kill(value);
                self.kill(addr);
                return;
            }
        }

        self.folded_op_bits(op2, &Val::Gpr(dst), value, bits);
        if src.mask != 0 && sign {
            self.sext_from_odd_width(dst, src, dst_l.bits);
        }
        if dst_l.mask != 0 {
            self.mask_out(dst_l, &Val::Gpr(dst));
        }
        self.kill(value);
    }

    /// Sign-extend from a width with no hardware form: shift up, then
    /// arithmetic shift back down.
    fn sext_from_odd_width(
        &mut self,
        dst: Gpr,
        src: crate::isa::x64::alloc::LegalInt,
        dst_bits: u8,
    ) {
        let src_width = 64 - src.mask.leading_zeros() as u8;
        let shift = dst_bits - src_width;
        self.asm.shift_imm(ShiftKind::Shl, &Val::Gpr(dst), shift, dst_bits);
        self.asm.shift_imm(ShiftKind::Sar, &Val::Gpr(dst), shift, dst_bits);
    }

    fn lower_atomic_rmw(&mut self, r: Reg, op: AtomicOp, addr: Reg, src: Reg) {
        let dt = self.f.node(r).dt;
        let fetch = self.use_count[r.index()] > 0;
        if fetch && matches!(op, AtomicOp::And | AtomicOp::Or | AtomicOp::Xor) {
            unimplemented!("atomic fetch-and-{op:?}");
        }

        let mem = self.access_address(addr);
        let l = legalize_int(dt);

        let tmp_owner = if fetch { Owner::Node(r) } else { Owner::Temp };
        let tmp = self.alloc_gpr(tmp_owner);
        if fetch {
            self.set_loc(r, ValueLoc::Gpr(tmp));
        }
        self.folded_op(Op2::Mov, &Val::Gpr(tmp), src);
        if l.mask != 0 {
            self.mask_out(l, &Val::Gpr(tmp));
        }

        // No fetching subtract exists; negate and exchange-add.
        if fetch && op == AtomicOp::Sub {
            debug_assert_eq!(l.mask, 0);
            self.asm.inst1(Op1::Neg, &Val::Gpr(tmp), l.bits);
        }

        let op2 = match (fetch, op) {
            (true, AtomicOp::Xchg) => Op2::Xchg,
            (true, AtomicOp::Add | AtomicOp::Sub) => Op2::Xadd,
            // An unfetched exchange is a plain store; mov is naturally
            // atomic when aligned.
            (false, AtomicOp::Xchg) => Op2::Mov,
            (false, AtomicOp::Add) => Op2::Add,
            (false, AtomicOp::Sub) => Op2::Sub,
            (false, AtomicOp::And) => Op2::And,
            (false, AtomicOp::Or) => Op2::Or,
            (false, AtomicOp::Xor) => Op2::Xor,
            (true, _) => unreachable!(),
        };
        if !matches!(op2, Op2::Xchg | Op2::Mov) {
            self.asm.lock_prefix();
        }
        self.asm.inst2(op2, &mem, &Val::Gpr(tmp), l.bits);

        if !fetch {
            self.kill_temp_gpr(tmp);
        }
        self.release_address_temps(&mem);
        self.kill(addr);
        if addr != src {
            self.kill(src);
        }
    }

    fn lower_cmpxchg(&mut self, r: Reg, addr: Reg, expected: Reg) {
        let next = Reg::from_u32(r.as_u32() + 1);
        let NodeData::AtomicCmpxchgOld { desired, .. } = self.f.node(next).data else {
            panic!("{}: compare-exchange halves are not adjacent at {r}", self.f.name)
        };
        let dt = self.f.node(next).dt;
        let l = legalize_int(dt);

        // The expected operand must sit in rax.
        self.reserve_gpr(Gpr::Rax);
        let mem = self.access_address(addr);
        // The twin node shares the address operand; this one instruction
        // consumes both uses.
        self.use_count[addr.index()] -= 1;

        let tmp = self.alloc_gpr(Owner::Temp);
        self.folded_op(Op2::Mov, &Val::Gpr(tmp), desired);
        self.folded_op(Op2::Mov, &Val::Gpr(Gpr::Rax), expected);

        self.asm.lock_prefix();
        self.asm.inst2(Op2::Cmpxchg, &mem, &Val::Gpr(tmp), l.bits);

        self.kill_temp_gpr(tmp);
        self.release_address_temps(&mem);
        self.kill(addr);
        self.kill(expected);
        if expected != desired {
            self.kill(desired);
        }

        // Success flag for this node, previous value for its twin.
        if self.use_count[r.index()] > 0 {
            self.set_loc(r, ValueLoc::Flags(Cond::E));
        }
        if self.use_count[next.index()] > 0 {
            self.rename_gpr_owner(Gpr::Rax, next);
            self.set_loc(next, ValueLoc::Gpr(Gpr::Rax));
        } else {
            self.release_gpr(Gpr::Rax);
        }
    }

    fn lower_call(&mut self, r: Reg, target: CallTarget, args: &[Reg]) {
        let dt = self.f.node(r).dt;
        let mut caller_saved = u32::from(caller_saved_gprs(self.cc));

        // Argument classification walks int and float slots separately
        // under System V; Windows burns one slot per argument.
        let mut int_idx = 0usize;
        let mut float_idx = 0usize;
        let mut stack_idx = 0usize;

        for (j, &arg) in args.iter().enumerate() {
            let arg_dt = self.f.node(arg).dt;
            let is_fp = arg_dt.is_float() || arg_dt.is_vector();

            if is_fp {
                let slot = match self.cc {
                    CallConv::WindowsFastcall => j,
                    CallConv::SystemV => float_idx,
                };
                float_idx += 1;
                if slot < param_xmm_count(self.cc) {
                    let x = Xmm::from_enc(slot as u8);
                    self.evict_xmm(x);
                    self.folded_op_sse(OpSse::Mov, &Val::Xmm(x), arg);
                    if self.xmm_owner[slot] == Owner::Free {
                        self.xmm_avail -= 1;
                    }
                    self.xmm_owner[slot] = Owner::Temp;
                } else {
                    let off = self.arg_stack_offset(j, &mut stack_idx);
                    self.folded_op_sse(OpSse::Mov, &Val::mem(Gpr::Rsp, off), arg);
                }
            } else {
                let slot = match self.cc {
                    CallConv::WindowsFastcall => j,
                    CallConv::SystemV => int_idx,
                };
                int_idx += 1;
                if slot < param_gpr_count(self.cc) {
                    let g = param_gpr(self.cc, slot);
                    if self.gpr_owner[g.enc() as usize] != Owner::Node(arg) {
                        self.evict_gpr(g);
                        caller_saved &= !(1u32 << g.enc());
                    }
                    self.folded_op(Op2::Mov, &Val::Gpr(g), arg);
                    if self.gpr_owner[g.enc() as usize] == Owner::Free {
                        self.gpr_avail -= 1;
                    }
                    self.gpr_owner[g.enc() as usize] = Owner::Temp;
                } else {
                    let off = self.arg_stack_offset(j, &mut stack_idx);
                    self.folded_op(Op2::Mov, &Val::mem(Gpr::Rsp, off), arg);
                }
            }
            self.kill(arg);
        }

        // Everything else that lives in a caller-saved register must move
        // to the stack now.
        for enc in 0..16u8 {
            if caller_saved & (1u32 << enc) != 0 {
                self.evict_gpr(Gpr::from_enc(enc));
            }
        }
        let first_saved_xmm = match self.cc {
            CallConv::SystemV => 16,
            CallConv::WindowsFastcall => 6,
        };
        for enc in 0..first_saved_xmm {
            if self.xmm_owner[enc as usize] != Owner::Temp {
                self.evict_xmm(Xmm::from_enc(enc));
            }
        }

        match target {
            CallTarget::Direct(func) => self.asm.call_func(func),
            CallTarget::Extern(ext) => self.asm.call_extern(ext),
            CallTarget::Indirect(ptr) => {
                let v = self.eval_address(ptr);
                match v {
                    Val::Mem { base, index: None, disp: 0, .. } => {
                        self.asm.inst1(Op1::CallRm, &Val::Gpr(base), 64);
                    }
                    _ => {
                        let tmp = self.alloc_gpr(Owner::Temp);
                        self.asm.inst2(Op2::Mov, &Val::Gpr(tmp), &v, 64);
                        self.asm.inst1(Op1::CallRm, &Val::Gpr(tmp), 64);
                        self.kill_temp_gpr(tmp);
                    }
                }
                self.kill(ptr);
            }
        }

        // Free the per-call reservations.
        for enc in 0..16u8 {
            if self.gpr_owner[enc as usize] == Owner::Temp {
                self.gpr_owner[enc as usize] = Owner::Free;
                self.gpr_avail += 1;
            }
            if self.xmm_owner[enc as usize] == Owner::Temp {
                self.xmm_owner[enc as usize] = Owner::Free;
                self.xmm_avail += 1;
            }
        }

        // Claim the return register.
        if dt.is_float() || dt.is_vector() {
            if self.xmm_owner[0] == Owner::Free {
                self.xmm_avail -= 1;
            }
            self.xmm_owner[0] = Owner::Node(r);
            self.set_loc(r, ValueLoc::Xmm(Xmm::Xmm0));
        } else if !dt.is_void() {
            if self.gpr_owner[0] == Owner::Free {
                self.gpr_avail -= 1;
            }
            self.gpr_owner[0] = Owner::Node(r);
            self.set_loc(r, ValueLoc::Gpr(Gpr::Rax));
        }
    }

    /// The rsp-relative offset of an outgoing stack argument.
    fn arg_stack_offset(&mut self, j: usize, stack_idx: &mut usize) -> i32 {
        match self.cc {
            // Slot positions are fixed on Windows; the first four are the
            // shadow space.
            CallConv::WindowsFastcall => (8 * j) as i32,
            CallConv::SystemV => {
                let off = (8 * *stack_idx) as i32;
                *stack_idx += 1;
                off
            }
        }
    }
}

enum CmpKind {
    Int(IntCond),
    Float(FloatCond),
}

enum CallTarget {
    Direct(crate::ir::FuncId),
    Extern(crate::ir::ExternalId),
    Indirect(Reg),
}

fn extend_op(signed: bool, bits: u8) -> Op2 {
    match (signed, bits) {
        (true, 8) => Op2::Movsxb,
        (false, 8) => Op2::Movzxb,
        (true, 16) => Op2::Movsxw,
        (false, 16) => Op2::Movzxw,
        _ => unreachable!(),
    }
}
