//! The x86-64 fast code generator.
//!
//! One forward pass per function: parameters and stack objects get their
//! frame locations up front, each basic block is lowered in stream order,
//! phi moves are written on the edges, and internal branches are patched
//! once every label has a byte offset. The prologue and epilogue are
//! produced separately so the module layer can compose the final image
//! after it knows where each function lands.

mod alloc;
mod encode;
mod lower;
pub mod regs;

use crate::binemit::CompiledCode;
use crate::ir::node::NodeData;
use crate::ir::types::Family;
use crate::ir::{ExternalId, Function, Label, Reg};
use crate::isa::{Arch, CallConv, TargetIsa};
use alloc::{legalize_int, Ctx, Owner, ValueLoc, SAVED_GPR_AREA};
use bumpalo::Bump;
use encode::{Asm, Op2, OpSse, Val};
use regs::{param_gpr, param_gpr_count, param_xmm_count, Gpr, Xmm, WIN64_PARAM_GPRS};

/// Module-level facts the code generator needs about symbols: which
/// globals are thread local, and the import slot of `_tls_index` on
/// Windows.
#[derive(Default)]
pub struct FuncEnv<'a> {
    pub tls_globals: &'a [bool],
    pub tls_index: Option<ExternalId>,
}

fn align_up(x: u32, to: u32) -> u32 {
    (x + to - 1) & !(to - 1)
}

/// Compile one function to machine code.
///
/// `scratch` is per-thread scratch memory, reset by the caller between
/// functions.
pub fn compile_function(
    f: &Function,
    isa: &TargetIsa,
    env: &FuncEnv,
    scratch: &Bump,
) -> CompiledCode {
    match isa.arch {
        Arch::X86_64 => {}
        Arch::Aarch64 => unimplemented!("aarch64 code generation"),
    }
    let cc = isa.call_conv();
    let is_sysv = cc == CallConv::SystemV;
    let len = f.len() as usize;

    let counts = f.use_counts();
    let use_count = scratch.alloc_slice_copy(&counts);
    let locs = scratch.alloc_slice_fill_copy(len, ValueLoc::None);

    let mut ctx = Ctx {
        f,
        cc,
        is_sysv,
        tls_index: env.tls_index,
        tls_globals: env.tls_globals,
        asm: Asm::new(),
        labels: vec![0; f.label_count as usize],
        lines: Vec::new(),
        use_count,
        barrier: 0,
        temp_load: None,
        tile: None,
        locs,
        gpr_owner: [Owner::Free; 16],
        xmm_owner: [Owner::Free; 16],
        gpr_avail: 14,
        xmm_avail: 16,
        stack_usage: SAVED_GPR_AREA,
        saved_regs: 0,
        caller_arg_bytes: 0,
    };

    ctx.caller_arg_bytes = outgoing_arg_bytes(f, cc);
    place_parameters(&mut ctx);
    home_stack_objects(&mut ctx);

    // Lower every basic block and its terminator.
    let mut bb = Reg::ENTRY;
    loop {
        let NodeData::Label { label, terminator } = f.node(bb).data else {
            panic!("{}: block cursor {bb} is not a label", f.name);
        };
        ctx.labels[label.index()] = ctx.asm.offset();
        ctx.lower_block(bb, terminator);

        let next_bb = if f.node(terminator).data.is_label() {
            Some(terminator)
        } else if terminator.index() + 1 < len {
            Some(Reg::from_u32(terminator.as_u32() + 1))
        } else {
            None
        };
        let fallthrough = next_bb.map(|r| match f.node(r).data {
            NodeData::Label { label, .. } => label,
            _ => panic!("{}: expected a label after {terminator}", f.name),
        });

        lower_terminator(&mut ctx, label, terminator, fallthrough, next_bb.is_some());

        match next_bb {
            Some(r) => bb = r,
            None => break,
        }
    }

    finish(ctx, f)
}

/// Bytes of outgoing argument space any call in the function needs,
/// including the Windows shadow space.
fn outgoing_arg_bytes(f: &Function, cc: CallConv) -> u32 {
    let mut slots = 0u32;
    for i in 1..f.len() {
        let r = Reg::from_u32(i);
        let args = match f.node(r).data {
            NodeData::Call { args, .. }
            | NodeData::ECall { args, .. }
            | NodeData::VCall { args, .. } => args,
            _ => continue,
        };
        match cc {
            CallConv::WindowsFastcall => {
                slots = slots.max(args.len() as u32);
            }
            CallConv::SystemV => {
                let mut ints = 0u32;
                let mut floats = 0u32;
                for arg in f.call_args(args) {
                    if f.node(arg).dt.is_float() || f.node(arg).dt.is_vector() {
                        floats += 1;
                    } else {
                        ints += 1;
                    }
                }
                let stack = ints.saturating_sub(6) + floats.saturating_sub(8);
                slots = slots.max(stack);
            }
        }
    }
    // Callers on Windows always reserve the four shadow slots.
    if cc == CallConv::WindowsFastcall && slots > 0 && slots < 4 {
        slots = 4;
    }
    slots * 8
}

/// Assign every parameter its ABI location.
fn place_parameters(ctx: &mut Ctx) {
    let cc = ctx.cc;
    let mut int_idx = 0usize;
    let mut float_idx = 0usize;
    let mut stack_idx = 0usize;

    for i in 0..ctx.f.prototype.params.len() {
        let dt = ctx.f.prototype.params[i];
        let r = Reg::param(i as u32);
        let is_fp = dt.is_float() || dt.is_vector();

        let slot = match cc {
            CallConv::WindowsFastcall => i,
            CallConv::SystemV => {
                if is_fp {
                    let s = float_idx;
                    float_idx += 1;
                    s
                } else {
                    let s = int_idx;
                    int_idx += 1;
                    s
                }
            }
        };

        if is_fp && slot < param_xmm_count(cc) {
            let x = Xmm::from_enc(slot as u8);
            ctx.xmm_owner[slot] = Owner::Node(r);
            ctx.xmm_avail -= 1;
            ctx.set_loc(r, ValueLoc::Xmm(x));
        } else if !is_fp && slot < param_gpr_count(cc) {
            let g = param_gpr(cc, slot);
            ctx.gpr_owner[g.enc() as usize] = Owner::Node(r);
            ctx.gpr_avail -= 1;
            ctx.set_loc(r, ValueLoc::Gpr(g));
        } else {
            let pos = match cc {
                CallConv::WindowsFastcall => i,
                CallConv::SystemV => {
                    let s = stack_idx;
                    stack_idx += 1;
                    s
                }
            };
            ctx.set_loc(r, ValueLoc::Spill(16 + 8 * pos as i32));
        }
    }

    // Windows varargs: home the remaining register slots so the variadic
    // area is contiguous in memory.
    if ctx.f.prototype.varargs && cc == CallConv::WindowsFastcall {
        let named = ctx.f.prototype.params.len();
        for k in named..WIN64_PARAM_GPRS.len() {
            let dst = Val::spill(16 + 8 * k as i32);
            let src = Val::Gpr(WIN64_PARAM_GPRS[k]);
            ctx.asm.inst2(Op2::Mov, &dst, &src, 64);
        }
    }
}

/// Give every local its frame slot, and home every address-taken
/// parameter into memory.
fn home_stack_objects(ctx: &mut Ctx) {
    for i in 1..ctx.f.len() {
        let r = Reg::from_u32(i);
        match ctx.f.node(r).data {
            NodeData::Local { size, align } => {
                let pos = ctx.stack_alloc(size, align);
                ctx.set_loc(r, ValueLoc::Stack(pos));
            }
            NodeData::ParamAddr { param, .. } => {
                let dt = ctx.f.node(param).dt;
                if dt.is_float() || dt.is_vector() {
                    unimplemented!("address-taken float parameter");
                }
                let NodeData::Param { index, .. } = ctx.f.node(param).data else {
                    panic!("{}: {r} does not address a parameter", ctx.f.name);
                };
                match ctx.locs[param.index()] {
                    ValueLoc::Gpr(g) => {
                        // Write the register down; the home slot is the
                        // shadow space on Windows, a fresh slot elsewhere.
                        let home = if ctx.is_sysv {
                            ctx.stack_alloc(8, 8)
                        } else {
                            16 + 8 * index as i32
                        };
                        ctx.asm.inst2(Op2::Mov, &Val::spill(home), &Val::Gpr(g), 64);
                        ctx.gpr_owner[g.enc() as usize] = Owner::Free;
                        ctx.gpr_avail += 1;
                        ctx.set_loc(param, ValueLoc::Spill(home));
                        ctx.set_loc(r, ValueLoc::Stack(home));
                    }
                    ValueLoc::Spill(home) => {
                        ctx.set_loc(r, ValueLoc::Stack(home));
                    }
                    ref other => {
                        panic!("{}: parameter {param} has no home ({other:?})", ctx.f.name)
                    }
                }
            }
            _ => {}
        }
    }
}

/// Write the phi moves for the edge `from -> to`: each phi input that
/// flows along the edge is stored into the phi's stable spill slot.
fn eval_edge_phis(ctx: &mut Ctx, from: Label, to: Label) {
    let to_reg = ctx.f.label_reg(to);
    let NodeData::Label { terminator, .. } = ctx.f.node(to_reg).data else { unreachable!() };

    for i in to_reg.as_u32() + 1..terminator.as_u32() {
        let phi = Reg::from_u32(i);
        if !ctx.f.node(phi).data.is_phi() {
            continue;
        }
        let dt = ctx.f.node(phi).dt;
        for (label, value) in ctx.f.phi_inputs(phi) {
            if label != from || value == Reg::NONE {
                continue;
            }
            let pos = match ctx.locs[phi.index()] {
                ValueLoc::None => {
                    let size = dt.bytes().max(4);
                    let pos = ctx.stack_alloc(size, size);
                    ctx.set_loc(phi, ValueLoc::Spill(pos));
                    pos
                }
                ValueLoc::Spill(pos) => pos,
                ref other => {
                    panic!("{}: phi {phi} in a register ({other:?})", ctx.f.name)
                }
            };
            let slot = Val::spill(pos);
            if dt.is_float() || dt.is_vector() {
                ctx.folded_op_sse(OpSse::Mov, &slot, value);
            } else {
                // Plain width-only move: the stored value is already in
                // canonical masked form, and an `and` here would clobber a
                // branch condition pending in EFLAGS.
                let bits = legalize_int(dt).bits;
                ctx.folded_op_bits(Op2::Mov, &slot, value, bits);
            }
        }
    }
}

fn lower_terminator(
    ctx: &mut Ctx,
    block_label: Label,
    term: Reg,
    fallthrough: Option<Label>,
    has_next: bool,
) {
    match ctx.f.node(term).data {
        NodeData::Ret { value } => {
            if value != Reg::NONE {
                let dt = ctx.f.node(term).dt;
                match dt.family {
                    Family::F32 | Family::F64 => {
                        ctx.folded_op_sse(OpSse::Mov, &Val::Xmm(Xmm::Xmm0), value);
                    }
                    Family::Void => {}
                    _ => {
                        ctx.folded_op(Op2::Mov, &Val::Gpr(Gpr::Rax), value);
                    }
                }
                ctx.kill(value);
            }
            // The last return falls through into the epilogue.
            if has_next {
                ctx.asm.jmp_to_epilogue();
            }
        }

        NodeData::BrIf { cond, then_dest, else_dest } => {
            eval_edge_phis(ctx, block_label, then_dest);
            eval_edge_phis(ctx, block_label, else_dest);

            let mut cc = ctx.eval_cond(cond);
            ctx.kill(cond);
            ctx.evict_everything();

            // Invert so the false edge falls through and the jmp drops.
            let (mut taken, mut not_taken) = (then_dest, else_dest);
            let mut falls = fallthrough == Some(else_dest);
            if fallthrough == Some(then_dest) {
                core::mem::swap(&mut taken, &mut not_taken);
                cc = cc.invert();
                falls = true;
            }
            ctx.asm.jcc(cc, taken);
            if !falls {
                ctx.asm.jmp(not_taken);
            }
        }

        NodeData::Label { label: next_label, .. } => {
            eval_edge_phis(ctx, block_label, next_label);
            ctx.evict_everything();
        }

        NodeData::Goto { dest } => {
            eval_edge_phis(ctx, block_label, dest);
            ctx.evict_everything();
            if fallthrough != Some(dest) {
                ctx.asm.jmp(dest);
            }
        }

        NodeData::Unreachable => {
            ctx.asm.ud2();
        }

        NodeData::Switch { key, default_dest, entries } => {
            let dt = ctx.f.node(term).dt;
            if let Some(imm) = ctx.f.node(key).data.as_int_const() {
                // Constant scrutinee: the switch is a single jump.
                let masked = imm & dt.mask();
                let mut target = default_dest;
                for e in ctx.f.switch_entries(entries) {
                    if u64::from(e.key) == masked {
                        target = e.dest;
                        break;
                    }
                }
                ctx.use_count[key.index()] -= 1;
                ctx.kill(key);
                eval_edge_phis(ctx, block_label, target);
                ctx.evict_everything();
                if fallthrough != Some(target) {
                    ctx.asm.jmp(target);
                }
            } else {
                let l = legalize_int(dt);
                let tmp = ctx.alloc_gpr(Owner::Temp);
                ctx.folded_op(Op2::Mov, &Val::Gpr(tmp), key);
                if l.mask != 0 {
                    ctx.mask_out(l, &Val::Gpr(tmp));
                }
                ctx.kill_temp_gpr(tmp);
                ctx.kill(key);
                ctx.evict_everything();

                // A compare-and-branch chain; anything fancier belongs to
                // a smarter tier.
                let entries: Vec<_> = ctx.f.switch_entries(entries).collect();
                for e in entries {
                    ctx.asm.inst2(Op2::Cmp, &Val::Gpr(tmp), &Val::Imm(e.key as i32), l.bits);
                    ctx.asm.jcc(regs::Cond::E, e.dest);
                }
                ctx.asm.jmp(default_dest);
            }
        }

        ref other => panic!("{}: {term} ({other:?}) does not terminate a block", ctx.f.name),
    }
}

/// Resolve internal branches, lay out the save areas and produce the
/// prologue and epilogue.
fn finish(mut ctx: Ctx, f: &Function) -> CompiledCode {
    // Callee-saved XMM slots sit at the very bottom of the frame.
    let saved_xmms: Vec<u8> = (0..16u8).filter(|x| ctx.saved_regs & (1 << (16 + x)) != 0).collect();
    let mut xmm_slots = Vec::with_capacity(saved_xmms.len());
    for _ in &saved_xmms {
        ctx.stack_usage = align_up(ctx.stack_usage, 16) + 16;
        xmm_slots.push(-(ctx.stack_usage as i32));
    }

    ctx.stack_usage += ctx.caller_arg_bytes;

    let saved_gprs: Vec<Gpr> = (0..16u8)
        .filter(|g| ctx.saved_regs & (1 << g) != 0)
        .map(Gpr::from_enc)
        .collect();
    let push_bytes = 8 * saved_gprs.len() as u32;
    debug_assert!(push_bytes < SAVED_GPR_AREA);

    // Keep rsp 16-aligned at call sites: rsp is aligned after `push rbp`,
    // so the subtraction has to absorb the odd push count.
    let mut frame = align_up(ctx.stack_usage, 16);
    if push_bytes % 16 != 0 {
        frame += 8;
    }

    let code_len = ctx.asm.offset();
    for pos in core::mem::take(&mut ctx.asm.ret_patches) {
        ctx.asm.buf.patch4(pos, code_len - (pos + 4));
    }
    for patch in core::mem::take(&mut ctx.asm.label_patches) {
        let target = ctx.labels[patch.target.index()];
        ctx.asm.buf.patch4(patch.pos, target.wrapping_sub(patch.pos + 4));
    }

    if let Some(first) = ctx.lines.first_mut() {
        first.offset = 0;
    }

    let mut prologue = Asm::new();
    prologue.push_reg(Gpr::Rbp);
    prologue.inst2(Op2::Mov, &Val::Gpr(Gpr::Rbp), &Val::Gpr(Gpr::Rsp), 64);
    for &g in &saved_gprs {
        prologue.push_reg(g);
    }
    prologue.inst2(Op2::Sub, &Val::Gpr(Gpr::Rsp), &Val::Imm(frame as i32), 64);
    for (&x, &slot) in saved_xmms.iter().zip(&xmm_slots) {
        prologue.movaps_store(&Val::mem(Gpr::Rbp, slot), Xmm::from_enc(x));
    }

    let mut epilogue = Asm::new();
    for (&x, &slot) in saved_xmms.iter().zip(&xmm_slots) {
        epilogue.movaps_load(Xmm::from_enc(x), &Val::mem(Gpr::Rbp, slot));
    }
    if saved_gprs.is_empty() {
        epilogue.inst2(Op2::Mov, &Val::Gpr(Gpr::Rsp), &Val::Gpr(Gpr::Rbp), 64);
    } else {
        epilogue.inst2(
            Op2::Lea,
            &Val::Gpr(Gpr::Rsp),
            &Val::mem(Gpr::Rbp, -(push_bytes as i32)),
            64,
        );
        for &g in saved_gprs.iter().rev() {
            epilogue.pop_reg(g);
        }
    }
    epilogue.pop_reg(Gpr::Rbp);
    epilogue.ret();

    log::debug!(
        "{}: {} bytes of code, frame {} bytes, saves {:#x}",
        f.name,
        code_len,
        frame,
        ctx.saved_regs
    );

    CompiledCode {
        prologue: prologue.buf.into_vec(),
        code: ctx.asm.buf.into_vec(),
        epilogue: epilogue.buf.into_vec(),
        stack_usage: align_up(frame + push_bytes + 8, 16) + 8,
        saved_regs: ctx.saved_regs,
        lines: ctx.lines,
        rodata_patches: ctx.asm.rodata_patches,
        call_patches: ctx.asm.call_patches,
        extern_patches: ctx.asm.extern_patches,
        global_patches: ctx.asm.global_patches,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::{ArithBehavior, MemOrder};
    use crate::ir::types::{I32, PTR};
    use crate::ir::{FuncId, Prototype};
    use crate::isa::{FeatureSet, System};

    fn linux_isa() -> TargetIsa {
        TargetIsa { arch: Arch::X86_64, system: System::Linux, features: FeatureSet::default() }
    }

    fn compile(f: &Function) -> CompiledCode {
        let scratch = Bump::new();
        compile_function(f, &linux_isa(), &FuncEnv::default(), &scratch)
    }

    fn count_jcc(code: &[u8]) -> usize {
        code.windows(2).filter(|w| w[0] == 0x0F && (0x80..=0x8F).contains(&w[1])).count()
    }

    #[test]
    fn straight_line_add() {
        let mut f =
            Function::new(FuncId::from_u32(0), "add", Prototype::new(vec![I32, I32], I32));
        let (a, b) = (f.param(0), f.param(1));
        let sum = f.add(a, b, ArithBehavior::Wrap);
        f.ret(sum);

        let out = compile(&f);
        // push rbp; mov rbp, rsp
        assert_eq!(&out.prologue[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(*out.epilogue.last().unwrap(), 0xC3);
        // add edi, esi; mov eax, edi
        assert_eq!(out.code, vec![0x01, 0xF7, 0x89, 0xF8]);
    }

    #[test]
    fn division_runs_through_rax() {
        let mut f =
            Function::new(FuncId::from_u32(0), "quot", Prototype::new(vec![I32, I32], I32));
        let (a, b) = (f.param(0), f.param(1));
        let q = f.div(a, b, true);
        f.ret(q);

        let out = compile(&f);
        // cdq must appear, followed eventually by an idiv (F7 /7).
        let cdq = out.code.iter().position(|&b| b == 0x99).expect("no cdq");
        let idiv = out
            .code
            .windows(2)
            .position(|w| w[0] == 0xF7 && (w[1] >> 3) & 7 == 7 && w[1] >= 0xC0)
            .expect("no idiv");
        assert!(cdq < idiv);
    }

    #[test]
    fn fall_through_branch_emits_one_jcc_and_no_jmp() {
        // The false edge is the next block in layout order, so the branch
        // must invert and fall through.
        let mut f =
            Function::new(FuncId::from_u32(0), "pick", Prototype::new(vec![I32, I32], I32));
        let (a, b) = (f.param(0), f.param(1));
        let else_l = f.new_label_id();
        let then_l = f.new_label_id();
        let cond = f.icmp_lt(a, b, true);
        f.br_if(cond, then_l, else_l);

        f.begin_label(else_l);
        f.ret(b);

        f.begin_label(then_l);
        f.ret(a);

        let out = compile(&f);
        assert_eq!(count_jcc(&out.code), 1);
        // One E9: the first return's jump to the shared epilogue. The
        // branch itself needed none.
        let jmps = out.code.iter().filter(|&&b| b == 0xE9).count();
        assert_eq!(jmps, 1);

        // The branch displacement lands exactly on its target label.
        let jcc_at = out
            .code
            .windows(2)
            .position(|w| w[0] == 0x0F && (0x80..=0x8F).contains(&w[1]))
            .unwrap();
        let disp = i32::from_le_bytes(out.code[jcc_at + 2..jcc_at + 6].try_into().unwrap());
        let target = (jcc_at as i32 + 6 + disp) as usize;
        assert!(target <= out.code.len());
        // The target is the last block: the code there moves a parameter
        // home into eax (8B 45 disp8).
        assert_eq!(&out.code[target..target + 2], &[0x8B, 0x45]);
    }

    #[test]
    fn cmpxchg_shape() {
        let mut f =
            Function::new(FuncId::from_u32(0), "cas", Prototype::new(vec![PTR, I32, I32], I32));
        let (p, expected, desired) = (f.param(0), f.param(1), f.param(2));
        let pair = f.atomic_cmpxchg(p, expected, desired, MemOrder::SeqCst, MemOrder::SeqCst);
        f.ret(pair.old_value);

        let out = compile(&f);
        // lock cmpxchg => F0 0F B1
        assert!(
            out.code.windows(3).any(|w| w == [0xF0, 0x0F, 0xB1]),
            "no lock cmpxchg in {:02x?}",
            out.code
        );
    }

    #[test]
    fn zero_placeholders_for_external_references() {
        let mut f = Function::new(FuncId::from_u32(0), "callsite", Prototype::new(vec![], I32));
        let target = FuncId::from_u32(7);
        let v = f.call(I32, target, &[]);
        f.ret(v);

        let out = compile(&f);
        assert_eq!(out.call_patches.len(), 1);
        let p = out.call_patches[0];
        assert_eq!(p.target, target);
        assert_eq!(&out.code[p.pos as usize..p.pos as usize + 4], &[0, 0, 0, 0]);
        assert_eq!(out.code[p.pos as usize - 1], 0xE8);
    }

    #[test]
    fn float_constant_goes_through_the_pool() {
        let mut f = Function::new(
            FuncId::from_u32(0),
            "fval",
            Prototype::new(vec![], crate::ir::types::F32),
        );
        let c = f.fconst(crate::ir::types::F32, 1.5);
        f.ret(c);

        let out = compile(&f);
        assert_eq!(out.rodata_patches.len(), 1);
        assert_eq!(&*out.rodata_patches[0].data, &1.5f32.to_bits().to_le_bytes());

        // And 0.0 prefers xorps over a pool load.
        let mut z = Function::new(
            FuncId::from_u32(0),
            "zval",
            Prototype::new(vec![], crate::ir::types::F32),
        );
        let c = z.fconst(crate::ir::types::F32, 0.0);
        z.ret(c);
        let out = compile(&z);
        assert!(out.rodata_patches.is_empty());
        assert!(out.code.windows(2).any(|w| w == [0x0F, 0x57]));
    }
}
