//! x86-64 instruction encoding.
//!
//! A small fixed menu of encodings: the classic ALU group, moves with sign
//! and zero extension, unary group-F7 forms, shifts, scalar SSE, and the
//! control flow instructions. Operands are [`Val`]s; the assembler picks
//! the ModR/M, SIB, REX and immediate forms from the operand shapes and the
//! operand width in bits.
//!
//! Branches to labels and references to pooled constants, other functions,
//! imported symbols and globals are emitted as zeroed 32-bit fields with a
//! patch recorded for each; internal branches are resolved at the end of
//! the function, everything else by the module layer.

use crate::binemit::{
    CallPatch, CodeBuffer, CodeOffset, ExternPatch, GlobalPatch, LabelPatch, RodataPatch,
};
use crate::ir::{ExternalId, FuncId, GlobalId, Label};
use crate::isa::x64::regs::{Cond, Gpr, Xmm};

/// A value an instruction can name.
#[derive(Copy, Clone, PartialEq, Debug)]
pub(super) enum Val {
    Gpr(Gpr),
    Xmm(Xmm),
    /// `[base + index * 2^scale + disp]`. `spill` marks a compiler-owned
    /// spill slot holding a value, as opposed to an address computation.
    Mem { base: Gpr, index: Option<Gpr>, scale: u8, disp: i32, spill: bool },
    /// A 32-bit immediate, sign-extended to the operand width.
    Imm(i32),
    /// A module global, addressed RIP-relative through a patch.
    Global(GlobalId),
    /// A condition held in EFLAGS. Never an instruction operand; the
    /// lowering materialises it first.
    Flags(Cond),
}

impl Val {
    pub fn mem(base: Gpr, disp: i32) -> Val {
        Val::Mem { base, index: None, scale: 0, disp, spill: false }
    }

    pub fn spill(disp: i32) -> Val {
        Val::Mem { base: Gpr::Rbp, index: None, scale: 0, disp, spill: true }
    }

    pub fn base_index(base: Gpr, index: Gpr, scale: u8) -> Val {
        Val::Mem { base, index: Some(index), scale, disp: 0, spill: false }
    }

    /// True for memory-shaped operands.
    pub fn is_mem(&self) -> bool {
        matches!(self, Val::Mem { .. } | Val::Global(_))
    }

    pub fn is_spill(&self) -> bool {
        matches!(self, Val::Mem { spill: true, .. })
    }

    pub fn as_gpr(&self) -> Option<Gpr> {
        match self {
            Val::Gpr(g) => Some(*g),
            _ => None,
        }
    }
}

/// Two-operand integer operations.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(super) enum Op2 {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
    Mov,
    Test,
    Lea,
    Imul,
    Xchg,
    Xadd,
    Cmpxchg,
    Movsxb,
    Movsxw,
    Movsxd,
    Movzxb,
    Movzxw,
}

impl Op2 {
    /// ALU group opcode base and the /digit of its immediate form.
    fn alu(self) -> Option<(u8, u8)> {
        match self {
            Op2::Add => Some((0x00, 0)),
            Op2::Or => Some((0x08, 1)),
            Op2::And => Some((0x20, 4)),
            Op2::Sub => Some((0x28, 5)),
            Op2::Xor => Some((0x30, 6)),
            Op2::Cmp => Some((0x38, 7)),
            _ => None,
        }
    }

    /// True for register-destination-only loads (`r <- r/m`).
    fn is_load_form(self) -> bool {
        matches!(
            self,
            Op2::Lea | Op2::Imul | Op2::Movsxb | Op2::Movsxw | Op2::Movsxd | Op2::Movzxb
                | Op2::Movzxw
        )
    }
}

/// One-operand group F7/FF operations.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(super) enum Op1 {
    Not,
    Neg,
    Div,
    Idiv,
    CallRm,
}

/// Scalar SSE operations.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(super) enum OpSse {
    Mov,
    Add,
    Mul,
    Sub,
    Div,
    Sqrt,
    Rsqrt,
    /// `cvtss2sd` / `cvtsd2ss`, keyed by the source width.
    Cvt,
    Ucomi,
}

impl OpSse {
    fn opcode(self) -> u8 {
        match self {
            OpSse::Mov => 0x10,
            OpSse::Add => 0x58,
            OpSse::Mul => 0x59,
            OpSse::Sub => 0x5C,
            OpSse::Div => 0x5E,
            OpSse::Sqrt => 0x51,
            OpSse::Rsqrt => 0x52,
            OpSse::Cvt => 0x5A,
            OpSse::Ucomi => 0x2E,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(super) enum ShiftKind {
    Shl,
    Shr,
    Sar,
}

impl ShiftKind {
    fn digit(self) -> u8 {
        match self {
            ShiftKind::Shl => 4,
            ShiftKind::Shr => 5,
            ShiftKind::Sar => 7,
        }
    }
}

#[inline]
fn modrm(m0d: u8, rx: u8, rm: u8) -> u8 {
    debug_assert!(m0d < 4);
    ((m0d & 3) << 6) | ((rx & 7) << 3) | (rm & 7)
}

#[inline]
fn sib(scale: u8, index: u8, base: u8) -> u8 {
    debug_assert!(scale < 4);
    ((scale & 3) << 6) | ((index & 7) << 3) | (base & 7)
}

#[inline]
fn rex(w: bool, rx: u8, base: u8, index: u8) -> u8 {
    0x40 | ((w as u8) << 3) | ((rx >> 3) << 2) | ((index >> 3) << 1) | (base >> 3)
}

/// The assembler: a code buffer plus the patch lists the function
/// accumulates while it is emitted.
pub(super) struct Asm {
    pub buf: CodeBuffer,
    pub label_patches: Vec<LabelPatch>,
    pub ret_patches: Vec<CodeOffset>,
    pub rodata_patches: Vec<RodataPatch>,
    pub call_patches: Vec<CallPatch>,
    pub extern_patches: Vec<ExternPatch>,
    pub global_patches: Vec<GlobalPatch>,
}

impl Asm {
    pub fn new() -> Asm {
        Asm {
            buf: CodeBuffer::new(),
            label_patches: Vec::new(),
            ret_patches: Vec::new(),
            rodata_patches: Vec::new(),
            call_patches: Vec::new(),
            extern_patches: Vec::new(),
            global_patches: Vec::new(),
        }
    }

    pub fn offset(&self) -> CodeOffset {
        self.buf.offset()
    }

    /// The base register encoding and index encoding of an r/m operand,
    /// for REX computation.
    fn rm_encs(v: &Val) -> (u8, u8) {
        match v {
            Val::Gpr(g) => (g.enc(), 0),
            Val::Xmm(x) => (x.enc(), 0),
            Val::Mem { base, index, .. } => (base.enc(), index.map_or(0, |i| i.enc())),
            Val::Global(_) => (0, 0),
            Val::Imm(_) | Val::Flags(_) => (0, 0),
        }
    }

    /// Emit the ModR/M byte (plus SIB, displacement and patch) selecting
    /// `rm`, with `rx` in the reg field.
    fn mem_operand(&mut self, rx: u8, rm: &Val) {
        match *rm {
            Val::Gpr(g) => self.buf.put1(modrm(3, rx, g.enc())),
            Val::Xmm(x) => self.buf.put1(modrm(3, rx, x.enc())),
            Val::Mem { base, index, scale, disp, .. } => {
                let base_enc = base.enc();
                let needs_sib = index.is_some() || (base_enc & 7) == 4;

                // rbp/r13 as a bare base has no disp-free form.
                let m0d = if disp == 0 && (base_enc & 7) != 5 {
                    0
                } else if disp == i32::from(disp as i8) {
                    1
                } else {
                    2
                };

                self.buf.put1(modrm(m0d, rx, if needs_sib { 4 } else { base_enc }));
                if needs_sib {
                    let index_enc = index.map_or(4, |i| i.enc());
                    debug_assert!(index.map_or(true, |i| i != Gpr::Rsp));
                    self.buf.put1(sib(scale, index_enc, base_enc));
                }
                match m0d {
                    1 => self.buf.put1(disp as i8 as u8),
                    2 => self.buf.put4(disp as u32),
                    _ => {}
                }
            }
            Val::Global(global) => {
                self.buf.put1(modrm(0, rx, 5));
                let pos = self.buf.offset();
                self.buf.put4(0);
                self.global_patches.push(GlobalPatch { pos, target: global, section_relative: false });
            }
            Val::Imm(_) | Val::Flags(_) => panic!("{rm:?} is not an r/m operand"),
        }
    }

    fn rex_for(&mut self, bits: u8, rx: u8, rm: &Val) {
        let (base, index) = Self::rm_encs(rm);
        let w = bits == 64;
        // 8-bit accesses to encodings 4..7 must carry a REX prefix to mean
        // spl/bpl/sil/dil rather than the legacy high-byte registers.
        let force = bits == 8 && ((4..8).contains(&rx) || (4..8).contains(&base));
        if w || rx >= 8 || base >= 8 || index >= 8 || force {
            self.buf.put1(rex(w, rx, base, index));
        }
    }

    /// A two-operand integer instruction. `dst` and `src` follow Intel
    /// order. Immediates sit in `src`; `Lea`-class ops require a register
    /// destination.
    pub fn inst2(&mut self, op: Op2, dst: &Val, src: &Val, bits: u8) {
        debug_assert!(matches!(bits, 8 | 16 | 32 | 64));
        let wide = bits != 8;

        if bits == 16 {
            self.buf.put1(0x66);
        }

        match (op, dst, src) {
            // Register-destination loads: r <- r/m.
            (_, Val::Gpr(d), _) if op.is_load_form() => {
                // The extension forms encode their own source width; the
                // REX.W bit follows the destination width.
                self.rex_for(bits, d.enc(), src);
                match op {
                    Op2::Lea => self.buf.put1(0x8D),
                    Op2::Movsxd => self.buf.put1(0x63),
                    Op2::Imul => {
                        self.buf.put1(0x0F);
                        self.buf.put1(0xAF);
                    }
                    Op2::Movsxb => {
                        self.buf.put1(0x0F);
                        self.buf.put1(0xBE);
                    }
                    Op2::Movsxw => {
                        self.buf.put1(0x0F);
                        self.buf.put1(0xBF);
                    }
                    Op2::Movzxb => {
                        self.buf.put1(0x0F);
                        self.buf.put1(0xB6);
                    }
                    Op2::Movzxw => {
                        self.buf.put1(0x0F);
                        self.buf.put1(0xB7);
                    }
                    _ => unreachable!(),
                }
                self.mem_operand(d.enc(), src);
            }

            // Lock-friendly read-modify-write forms: r/m, r.
            (Op2::Xchg | Op2::Xadd | Op2::Cmpxchg, _, Val::Gpr(s)) => {
                self.rex_for(bits, s.enc(), dst);
                match op {
                    Op2::Xchg => self.buf.put1(if wide { 0x87 } else { 0x86 }),
                    Op2::Xadd => {
                        self.buf.put1(0x0F);
                        self.buf.put1(if wide { 0xC1 } else { 0xC0 });
                    }
                    Op2::Cmpxchg => {
                        self.buf.put1(0x0F);
                        self.buf.put1(if wide { 0xB1 } else { 0xB0 });
                    }
                    _ => unreachable!(),
                }
                self.mem_operand(s.enc(), dst);
            }

            // Immediate forms.
            (_, _, Val::Imm(imm)) => {
                let imm = *imm;
                match op {
                    Op2::Mov => match dst {
                        // B8+r zero-extends for free; the 64-bit form must
                        // go through C7 /0, which sign-extends imm32.
                        Val::Gpr(d) if bits != 64 => {
                            self.rex_for(bits, 0, dst);
                            self.buf.put1(if bits == 8 { 0xB0 } else { 0xB8 } + (d.enc() & 7));
                            match bits {
                                8 => self.buf.put1(imm as u8),
                                16 => self.buf.put2(imm as u16),
                                _ => self.buf.put4(imm as u32),
                            }
                        }
                        _ => {
                            self.rex_for(bits, 0, dst);
                            self.buf.put1(if wide { 0xC7 } else { 0xC6 });
                            self.mem_operand(0, dst);
                            match bits {
                                8 => self.buf.put1(imm as u8),
                                16 => self.buf.put2(imm as u16),
                                _ => self.buf.put4(imm as u32),
                            }
                        }
                    },
                    Op2::Test => {
                        self.rex_for(bits, 0, dst);
                        self.buf.put1(if wide { 0xF7 } else { 0xF6 });
                        self.mem_operand(0, dst);
                        match bits {
                            8 => self.buf.put1(imm as u8),
                            16 => self.buf.put2(imm as u16),
                            _ => self.buf.put4(imm as u32),
                        }
                    }
                    _ => {
                        let (_, digit) = op.alu().expect("no immediate form");
                        let short = wide && imm == i32::from(imm as i8);
                        self.rex_for(bits, digit, dst);
                        self.buf.put1(if !wide {
                            0x80
                        } else if short {
                            0x83
                        } else {
                            0x81
                        });
                        self.mem_operand(digit, dst);
                        if !wide || short {
                            self.buf.put1(imm as u8);
                        } else if bits == 16 {
                            self.buf.put2(imm as u16);
                        } else {
                            self.buf.put4(imm as u32);
                        }
                    }
                }
            }

            // Store direction: r/m, r.
            (_, _, Val::Gpr(s)) => {
                let base = match op {
                    Op2::Mov => 0x88,
                    Op2::Test => 0x84,
                    _ => op.alu().expect("unencodable operands").0,
                };
                self.rex_for(bits, s.enc(), dst);
                self.buf.put1(base + wide as u8);
                self.mem_operand(s.enc(), dst);
            }

            // Load direction: r, r/m.
            (_, Val::Gpr(d), _) if src.is_mem() => {
                let base = match op {
                    Op2::Mov => 0x8A,
                    _ => op.alu().expect("unencodable operands").0 + 2,
                };
                self.rex_for(bits, d.enc(), src);
                self.buf.put1(base + wide as u8);
                self.mem_operand(d.enc(), src);
            }

            _ => panic!("inst2 {op:?} cannot encode {dst:?}, {src:?}"),
        }
    }

    /// A group F7/FF one-operand instruction.
    pub fn inst1(&mut self, op: Op1, v: &Val, bits: u8) {
        let (opcode, digit, bits) = match op {
            Op1::Not => (0xF7, 2, bits),
            Op1::Neg => (0xF7, 3, bits),
            Op1::Div => (0xF7, 6, bits),
            Op1::Idiv => (0xF7, 7, bits),
            Op1::CallRm => (0xFF, 2, 32),
        };
        let opcode = if bits == 8 && op != Op1::CallRm { opcode - 1 } else { opcode };
        if bits == 16 {
            self.buf.put1(0x66);
        }
        self.rex_for(bits, digit, v);
        self.buf.put1(opcode);
        self.mem_operand(digit, v);
    }

    /// A scalar SSE instruction. `double` selects the f64 variant.
    pub fn inst2_sse(&mut self, op: OpSse, dst: &Val, src: &Val, double: bool) {
        // movs__ is the only op with a store form.
        let (store, a, b) = if op == OpSse::Mov && dst.is_mem() {
            (true, src, dst)
        } else {
            (false, dst, src)
        };
        let rx = match a {
            Val::Xmm(x) => x.enc(),
            _ => panic!("sse operand {a:?} must be an xmm register"),
        };

        match op {
            OpSse::Ucomi => {
                if double {
                    self.buf.put1(0x66);
                }
            }
            _ => self.buf.put1(if double { 0xF2 } else { 0xF3 }),
        }
        let (base, index) = Self::rm_encs(b);
        if rx >= 8 || base >= 8 || index >= 8 {
            self.buf.put1(rex(false, rx, base, index));
        }
        self.buf.put1(0x0F);
        self.buf.put1(op.opcode() + store as u8);
        self.mem_operand(rx, b);
    }

    /// `xorps dst, src`: bitwise zero or sign flip of an xmm register.
    pub fn xorps(&mut self, dst: Xmm, src: Xmm) {
        if dst.enc() >= 8 || src.enc() >= 8 {
            self.buf.put1(rex(false, dst.enc(), src.enc(), 0));
        }
        self.buf.put1(0x0F);
        self.buf.put1(0x57);
        self.buf.put1(modrm(3, dst.enc(), src.enc()));
    }

    /// `xorps dst, [rip + pooled constant]`.
    pub fn xorps_rodata(&mut self, dst: Xmm, data: &[u8], align: u32) {
        if dst.enc() >= 8 {
            self.buf.put1(rex(false, dst.enc(), 0, 0));
        }
        self.buf.put1(0x0F);
        self.buf.put1(0x57);
        self.buf.put1(modrm(0, dst.enc(), 5));
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.rodata_patches.push(RodataPatch { pos, data: data.into(), align });
    }

    /// `movss`/`movsd` from a pooled constant.
    pub fn sse_load_rodata(&mut self, dst: Xmm, data: &[u8], double: bool) {
        self.buf.put1(if double { 0xF2 } else { 0xF3 });
        if dst.enc() >= 8 {
            self.buf.put1(rex(false, dst.enc(), 0, 0));
        }
        self.buf.put1(0x0F);
        self.buf.put1(0x10);
        self.buf.put1(modrm(0, dst.enc(), 5));
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.rodata_patches
            .push(RodataPatch { pos, data: data.into(), align: data.len() as u32 });
    }

    /// `cvtsi2ss`/`cvtsi2sd` from a GPR or memory.
    pub fn cvt_int_to_float(&mut self, dst: Xmm, src: &Val, double: bool, int64: bool) {
        self.buf.put1(if double { 0xF2 } else { 0xF3 });
        let (base, index) = Self::rm_encs(src);
        if int64 || dst.enc() >= 8 || base >= 8 || index >= 8 {
            self.buf.put1(rex(int64, dst.enc(), base, index));
        }
        self.buf.put1(0x0F);
        self.buf.put1(0x2A);
        self.mem_operand(dst.enc(), src);
    }

    /// `cvttss2si`/`cvttsd2si`: truncating float-to-int.
    pub fn cvt_float_to_int(&mut self, dst: Gpr, src: &Val, double: bool, int64: bool) {
        self.buf.put1(if double { 0xF2 } else { 0xF3 });
        let (base, index) = Self::rm_encs(src);
        if int64 || dst.enc() >= 8 || base >= 8 || index >= 8 {
            self.buf.put1(rex(int64, dst.enc(), base, index));
        }
        self.buf.put1(0x0F);
        self.buf.put1(0x2C);
        self.mem_operand(dst.enc(), src);
    }

    /// `movd`/`movq` between a GPR and an XMM, in either direction.
    pub fn mov_gpr_xmm(&mut self, xmm: Xmm, gpr: Gpr, to_xmm: bool, wide: bool) {
        self.buf.put1(0x66);
        if wide || xmm.enc() >= 8 || gpr.enc() >= 8 {
            self.buf.put1(rex(wide, xmm.enc(), gpr.enc(), 0));
        }
        self.buf.put1(0x0F);
        self.buf.put1(if to_xmm { 0x6E } else { 0x7E });
        self.buf.put1(modrm(3, xmm.enc(), gpr.enc()));
    }

    /// `movabs dst, imm64`.
    pub fn movabs(&mut self, dst: Gpr, imm: u64) {
        self.buf.put1(rex(true, 0, dst.enc(), 0));
        self.buf.put1(0xB8 + (dst.enc() & 7));
        self.buf.put8(imm);
    }

    /// A constant-count shift.
    pub fn shift_imm(&mut self, kind: ShiftKind, dst: &Val, imm: u8, bits: u8) {
        if bits == 16 {
            self.buf.put1(0x66);
        }
        self.rex_for(bits, kind.digit(), dst);
        self.buf.put1(if bits == 8 { 0xC0 } else { 0xC1 });
        self.mem_operand(kind.digit(), dst);
        self.buf.put1(imm);
    }

    /// A `cl`-count shift.
    pub fn shift_cl(&mut self, kind: ShiftKind, dst: &Val, bits: u8) {
        if bits == 16 {
            self.buf.put1(0x66);
        }
        self.rex_for(bits, kind.digit(), dst);
        self.buf.put1(if bits == 8 { 0xD2 } else { 0xD3 });
        self.mem_operand(kind.digit(), dst);
    }

    /// `imul dst, src, imm32`.
    pub fn imul_imm(&mut self, dst: Gpr, src: &Val, imm: i32, bits: u8) {
        self.rex_for(bits, dst.enc(), src);
        self.buf.put1(0x69);
        self.mem_operand(dst.enc(), src);
        self.buf.put4(imm as u32);
    }

    /// Sign-extend rax into rdx (`cqo`) or eax into edx (`cdq`).
    pub fn sign_extend_ax(&mut self, wide: bool) {
        if wide {
            self.buf.put1(0x48);
        }
        self.buf.put1(0x99);
    }

    /// `setcc` into the low byte of a register.
    pub fn setcc(&mut self, cc: Cond, dst: Gpr) {
        self.buf.put1(if dst.enc() >= 8 { 0x41 } else { 0x40 });
        self.buf.put1(0x0F);
        self.buf.put1(0x90 + cc.enc());
        self.buf.put1(modrm(3, 0, dst.enc()));
    }

    /// `cmovcc dst, src`.
    pub fn cmovcc(&mut self, cc: Cond, dst: Gpr, src: &Val, bits: u8) {
        // There is no 8-bit cmov; promote to 32.
        let bits = bits.max(32);
        self.rex_for(bits, dst.enc(), src);
        self.buf.put1(0x0F);
        self.buf.put1(0x40 + cc.enc());
        self.mem_operand(dst.enc(), src);
    }

    /// A conditional branch to a label, as `Jcc rel32`.
    pub fn jcc(&mut self, cc: Cond, target: Label) {
        self.buf.put1(0x0F);
        self.buf.put1(0x80 + cc.enc());
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.label_patches.push(LabelPatch { pos, target });
    }

    /// `jmp rel32` to a label.
    pub fn jmp(&mut self, target: Label) {
        self.buf.put1(0xE9);
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.label_patches.push(LabelPatch { pos, target });
    }

    /// `jmp rel32` to the function's shared epilogue.
    pub fn jmp_to_epilogue(&mut self) {
        self.buf.put1(0xE9);
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.ret_patches.push(pos);
    }

    /// `call rel32` to another function in the module.
    pub fn call_func(&mut self, target: FuncId) {
        self.buf.put1(0xE8);
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.call_patches.push(CallPatch { pos, target });
    }

    /// `call rel32` to an imported symbol.
    pub fn call_extern(&mut self, target: ExternalId) {
        self.buf.put1(0xE8);
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.extern_patches.push(ExternPatch { pos, target });
    }

    /// `lea dst, [rip + sym]` against a function or import, through the
    /// matching patch table.
    pub fn lea_rip_func(&mut self, dst: Gpr, target: FuncId) {
        self.buf.put1(rex(true, dst.enc(), 5, 0));
        self.buf.put1(0x8D);
        self.buf.put1(modrm(0, dst.enc(), 5));
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.call_patches.push(CallPatch { pos, target });
    }

    pub fn lea_rip_extern(&mut self, dst: Gpr, target: ExternalId) {
        self.buf.put1(rex(true, dst.enc(), 5, 0));
        self.buf.put1(0x8D);
        self.buf.put1(modrm(0, dst.enc(), 5));
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.extern_patches.push(ExternPatch { pos, target });
    }

    /// `lea dst, [rip + pooled bytes]`.
    pub fn lea_rip_rodata(&mut self, dst: Gpr, data: &[u8], align: u32) {
        self.buf.put1(rex(true, dst.enc(), 5, 0));
        self.buf.put1(0x8D);
        self.buf.put1(modrm(0, dst.enc(), 5));
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.rodata_patches.push(RodataPatch { pos, data: data.into(), align });
    }

    /// `mov dst, dword [rip + extern]`, for the Windows `_tls_index` read.
    pub fn mov_rip_extern32(&mut self, dst: Gpr, target: ExternalId) {
        if dst.enc() >= 8 {
            self.buf.put1(rex(false, dst.enc(), 0, 0));
        }
        self.buf.put1(0x8B);
        self.buf.put1(modrm(0, dst.enc(), 5));
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.extern_patches.push(ExternPatch { pos, target });
    }

    /// `lea dst, [base + secrel(global)]` with a section-relative patch,
    /// the tail of the Windows TLS sequence.
    pub fn lea_tls_global(&mut self, dst: Gpr, base: Gpr, global: GlobalId) {
        self.buf.put1(rex(true, dst.enc(), base.enc(), 0));
        self.buf.put1(0x8D);
        if (base.enc() & 7) == 4 {
            self.buf.put1(modrm(2, dst.enc(), 4));
            self.buf.put1(sib(0, 4, base.enc()));
        } else {
            self.buf.put1(modrm(2, dst.enc(), base.enc()));
        }
        let pos = self.buf.offset();
        self.buf.put4(0);
        self.global_patches.push(GlobalPatch { pos, target: global, section_relative: true });
    }

    /// `mov dst, qword gs:[0x58]`: the Windows TEB TLS array.
    pub fn mov_gs_tls_array(&mut self, dst: Gpr) {
        self.buf.put1(0x65);
        self.buf.put1(rex(true, dst.enc(), 0, 0));
        self.buf.put1(0x8B);
        // mod 00 with SIB base 101 selects a bare disp32.
        self.buf.put1(modrm(0, dst.enc(), 4));
        self.buf.put1(sib(0, 4, 5));
        self.buf.put4(0x58);
    }

    pub fn push_reg(&mut self, g: Gpr) {
        if g.enc() >= 8 {
            self.buf.put1(0x41);
        }
        self.buf.put1(0x50 + (g.enc() & 7));
    }

    pub fn pop_reg(&mut self, g: Gpr) {
        if g.enc() >= 8 {
            self.buf.put1(0x41);
        }
        self.buf.put1(0x58 + (g.enc() & 7));
    }

    pub fn ret(&mut self) {
        self.buf.put1(0xC3);
    }

    pub fn int3(&mut self) {
        self.buf.put1(0xCC);
    }

    pub fn ud2(&mut self) {
        self.buf.put1(0x0F);
        self.buf.put1(0x0B);
    }

    pub fn lock_prefix(&mut self) {
        self.buf.put1(0xF0);
    }

    pub fn rep_stosb(&mut self) {
        self.buf.put1(0xF3);
        self.buf.put1(0xAA);
    }

    pub fn rep_movsb(&mut self) {
        self.buf.put1(0xF3);
        self.buf.put1(0xA4);
    }

    /// `movaps` between an XMM and a 16-byte frame slot.
    pub fn movaps_store(&mut self, slot: &Val, src: Xmm) {
        let (base, index) = Self::rm_encs(slot);
        if src.enc() >= 8 || base >= 8 || index >= 8 {
            self.buf.put1(rex(false, src.enc(), base, index));
        }
        self.buf.put1(0x0F);
        self.buf.put1(0x29);
        self.mem_operand(src.enc(), slot);
    }

    pub fn movaps_load(&mut self, dst: Xmm, slot: &Val) {
        let (base, index) = Self::rm_encs(slot);
        if dst.enc() >= 8 || base >= 8 || index >= 8 {
            self.buf.put1(rex(false, dst.enc(), base, index));
        }
        self.buf.put1(0x0F);
        self.buf.put1(0x28);
        self.mem_operand(dst.enc(), slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(f: impl FnOnce(&mut Asm)) -> Vec<u8> {
        let mut asm = Asm::new();
        f(&mut asm);
        asm.buf.into_vec()
    }

    #[test]
    fn mov_reg_reg() {
        // mov rax, rcx => 48 89 C8
        assert_eq!(
            bytes(|a| a.inst2(Op2::Mov, &Val::Gpr(Gpr::Rax), &Val::Gpr(Gpr::Rcx), 64)),
            vec![0x48, 0x89, 0xC8]
        );
        // mov eax, ecx => 89 C8
        assert_eq!(
            bytes(|a| a.inst2(Op2::Mov, &Val::Gpr(Gpr::Rax), &Val::Gpr(Gpr::Rcx), 32)),
            vec![0x89, 0xC8]
        );
        // mov r8d, eax => 41 89 C0
        assert_eq!(
            bytes(|a| a.inst2(Op2::Mov, &Val::Gpr(Gpr::R8), &Val::Gpr(Gpr::Rax), 32)),
            vec![0x41, 0x89, 0xC0]
        );
    }

    #[test]
    fn add_reg_imm() {
        // add eax, 1 => 83 C0 01 (short immediate)
        assert_eq!(
            bytes(|a| a.inst2(Op2::Add, &Val::Gpr(Gpr::Rax), &Val::Imm(1), 32)),
            vec![0x83, 0xC0, 0x01]
        );
        // add eax, 0x12345 => 81 C0 45 23 01 00
        assert_eq!(
            bytes(|a| a.inst2(Op2::Add, &Val::Gpr(Gpr::Rax), &Val::Imm(0x12345), 32)),
            vec![0x81, 0xC0, 0x45, 0x23, 0x01, 0x00]
        );
    }

    #[test]
    fn load_with_disp() {
        // mov eax, [rbp - 8] => 8B 45 F8
        assert_eq!(
            bytes(|a| a.inst2(Op2::Mov, &Val::Gpr(Gpr::Rax), &Val::mem(Gpr::Rbp, -8), 32)),
            vec![0x8B, 0x45, 0xF8]
        );
        // mov rcx, [rax + rdx*4 + 0x100] => 48 8B 8C 90 00 01 00 00
        assert_eq!(
            bytes(|a| a.inst2(
                Op2::Mov,
                &Val::Gpr(Gpr::Rcx),
                &Val::Mem { base: Gpr::Rax, index: Some(Gpr::Rdx), scale: 2, disp: 0x100, spill: false },
                64
            )),
            vec![0x48, 0x8B, 0x8C, 0x90, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[test]
    fn rsp_base_needs_sib() {
        // mov [rsp + 8], ecx => 89 4C 24 08
        assert_eq!(
            bytes(|a| a.inst2(Op2::Mov, &Val::mem(Gpr::Rsp, 8), &Val::Gpr(Gpr::Rcx), 32)),
            vec![0x89, 0x4C, 0x24, 0x08]
        );
    }

    #[test]
    fn idiv_and_cqo() {
        // cqo; idiv rcx => 48 99 48 F7 F9
        assert_eq!(
            bytes(|a| {
                a.sign_extend_ax(true);
                a.inst1(Op1::Idiv, &Val::Gpr(Gpr::Rcx), 64);
            }),
            vec![0x48, 0x99, 0x48, 0xF7, 0xF9]
        );
        // cdq; idiv ecx => 99 F7 F9
        assert_eq!(
            bytes(|a| {
                a.sign_extend_ax(false);
                a.inst1(Op1::Idiv, &Val::Gpr(Gpr::Rcx), 32);
            }),
            vec![0x99, 0xF7, 0xF9]
        );
    }

    #[test]
    fn shifts() {
        // shl eax, 3 => C1 E0 03
        assert_eq!(
            bytes(|a| a.shift_imm(ShiftKind::Shl, &Val::Gpr(Gpr::Rax), 3, 32)),
            vec![0xC1, 0xE0, 0x03]
        );
        // sar rdx, cl => 48 D3 FA
        assert_eq!(
            bytes(|a| a.shift_cl(ShiftKind::Sar, &Val::Gpr(Gpr::Rdx), 64)),
            vec![0x48, 0xD3, 0xFA]
        );
    }

    #[test]
    fn setcc_and_cmov() {
        // setne al => 40 0F 95 C0
        assert_eq!(bytes(|a| a.setcc(Cond::Ne, Gpr::Rax)), vec![0x40, 0x0F, 0x95, 0xC0]);
        // cmove eax, ecx => 0F 44 C1
        assert_eq!(
            bytes(|a| a.cmovcc(Cond::E, Gpr::Rax, &Val::Gpr(Gpr::Rcx), 32)),
            vec![0x0F, 0x44, 0xC1]
        );
    }

    #[test]
    fn sse_moves() {
        // movss xmm0, [rbp - 4] => F3 0F 10 45 FC
        assert_eq!(
            bytes(|a| a.inst2_sse(
                OpSse::Mov,
                &Val::Xmm(Xmm::Xmm0),
                &Val::mem(Gpr::Rbp, -4),
                false
            )),
            vec![0xF3, 0x0F, 0x10, 0x45, 0xFC]
        );
        // movsd [rbp - 8], xmm1 => F2 0F 11 4D F8
        assert_eq!(
            bytes(|a| a.inst2_sse(
                OpSse::Mov,
                &Val::mem(Gpr::Rbp, -8),
                &Val::Xmm(Xmm::Xmm1),
                true
            )),
            vec![0xF2, 0x0F, 0x11, 0x4D, 0xF8]
        );
        // ucomisd xmm0, xmm1 => 66 0F 2E C1
        assert_eq!(
            bytes(|a| a.inst2_sse(OpSse::Ucomi, &Val::Xmm(Xmm::Xmm0), &Val::Xmm(Xmm::Xmm1), true)),
            vec![0x66, 0x0F, 0x2E, 0xC1]
        );
    }

    #[test]
    fn movabs_encoding() {
        // movabs rax, 0x1122334455667788
        assert_eq!(
            bytes(|a| a.movabs(Gpr::Rax, 0x1122_3344_5566_7788)),
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn branch_placeholders_are_zero() {
        let mut asm = Asm::new();
        asm.jcc(Cond::E, Label::from_u32(1));
        asm.jmp(Label::from_u32(2));
        let code = asm.buf.as_slice();
        assert_eq!(&code[0..2], &[0x0F, 0x84]);
        assert_eq!(&code[2..6], &[0, 0, 0, 0]);
        assert_eq!(code[6], 0xE9);
        assert_eq!(&code[7..11], &[0, 0, 0, 0]);
        assert_eq!(asm.label_patches.len(), 2);
        assert_eq!(asm.label_patches[0].pos, 2);
        assert_eq!(asm.label_patches[1].pos, 7);
    }

    #[test]
    fn lock_cmpxchg() {
        // lock cmpxchg [rdi], ecx => F0 0F B1 0F
        assert_eq!(
            bytes(|a| {
                a.lock_prefix();
                a.inst2(Op2::Cmpxchg, &Val::mem(Gpr::Rdi, 0), &Val::Gpr(Gpr::Rcx), 32);
            }),
            vec![0xF0, 0x0F, 0xB1, 0x0F]
        );
    }

    #[test]
    fn push_pop() {
        assert_eq!(bytes(|a| a.push_reg(Gpr::Rbp)), vec![0x55]);
        assert_eq!(bytes(|a| a.push_reg(Gpr::R12)), vec![0x41, 0x54]);
        assert_eq!(bytes(|a| a.pop_reg(Gpr::Rbx)), vec![0x5B]);
    }
}
