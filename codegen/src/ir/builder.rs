//! IR construction.
//!
//! Nodes are appended to the function's current basic block. The builder
//! performs a handful of peepholes while it appends: integer constant
//! folding, identity reductions, normalisation of commutative operands
//! (constant on the right), block-local value numbering of pure arithmetic
//! and loads, and elision of duplicate stores. Downstream passes rely on
//! these normal forms.
//!
//! Builder misuse is a programmer error: type mismatches and appends into a
//! closed block print the function and panic.

use crate::ir::node::{
    ArithBehavior, AtomicOp, FloatCond, FloatOp, IntCond, IntOp, MemOrder, Node, NodeData,
    UnaryOp,
};
use crate::ir::types::{self, DataType};
use crate::ir::{CmpxchgResult, ExternalId, FileId, FuncId, GlobalId, Label, Reg, SwitchEntry};
use crate::ir::Function;
use smallvec::SmallVec;

/// Sign-extend the low `bits` of `v` to 64 bits.
pub(crate) fn sign_extend(v: u64, bits: u32) -> i64 {
    if bits >= 64 {
        v as i64
    } else {
        let shift = 64 - bits;
        ((v << shift) as i64) >> shift
    }
}

/// Evaluate an integer operation over already-masked payloads.
///
/// Division by zero folds to 0. Results are always masked to the width of
/// `dt`, whatever the overflow behaviour.
pub(crate) fn fold_int_binary(
    op: IntOp,
    behavior: ArithBehavior,
    dt: DataType,
    a: u64,
    b: u64,
) -> u64 {
    let bits = dt.lane_bits().max(1);
    let mask = if dt.is_ptr() { !0u64 } else { dt.mask() };
    let ua = a & mask;
    let ub = b & mask;
    let sa = sign_extend(ua, bits);
    let sb = sign_extend(ub, bits);

    let saturate = |wide: i128| -> u64 {
        match behavior {
            ArithBehavior::SaturateUnsigned => wide.clamp(0, mask as i128) as u64,
            ArithBehavior::SaturateSigned => {
                let lo = -(1i128 << (bits - 1));
                let hi = (1i128 << (bits - 1)) - 1;
                wide.clamp(lo, hi) as u64 & mask
            }
            ArithBehavior::Wrap | ArithBehavior::AssumeNoWrap => wide as u64 & mask,
        }
    };

    match op {
        IntOp::And => ua & ub,
        IntOp::Or => ua | ub,
        IntOp::Xor => ua ^ ub,
        IntOp::Add => match behavior {
            ArithBehavior::SaturateSigned => saturate(i128::from(sa) + i128::from(sb)),
            _ => saturate(i128::from(ua) + i128::from(ub)),
        },
        IntOp::Sub => match behavior {
            ArithBehavior::SaturateSigned => saturate(i128::from(sa) - i128::from(sb)),
            _ => saturate(i128::from(ua) - i128::from(ub)),
        },
        IntOp::Mul => match behavior {
            ArithBehavior::SaturateSigned => saturate(i128::from(sa) * i128::from(sb)),
            _ => saturate(i128::from(ua) * i128::from(ub)),
        },
        IntOp::Udiv => {
            if ub == 0 { 0 } else { (ua / ub) & mask }
        }
        IntOp::Umod => {
            if ub == 0 { 0 } else { (ua % ub) & mask }
        }
        IntOp::Sdiv => {
            if sb == 0 { 0 } else { (i128::from(sa) / i128::from(sb)) as u64 & mask }
        }
        IntOp::Smod => {
            if sb == 0 { 0 } else { (i128::from(sa) % i128::from(sb)) as u64 & mask }
        }
        IntOp::Shl => {
            if ub >= u64::from(bits) { 0 } else { (ua << ub) & mask }
        }
        IntOp::Shr => {
            if ub >= u64::from(bits) { 0 } else { (ua >> ub) & mask }
        }
        IntOp::Sar => (sa >> ub.min(63)) as u64 & mask,
    }
}

impl Function {
    fn make(&mut self, data: NodeData, dt: DataType) -> Reg {
        if !data.is_label() && self.current_label == Reg::NONE {
            panic!("{}: node appended without an open basic block in:\n{}", self.name, self);
        }
        let r = Reg::from_u32(self.nodes.len() as u32);
        self.nodes.push(Node { data, dt });
        r
    }

    /// Append a node without any of the builder peepholes. Test scaffolding
    /// for passes that need to see unfolded input.
    #[cfg(test)]
    pub(crate) fn make_raw(&mut self, data: NodeData, dt: DataType) -> Reg {
        self.make(data, dt)
    }

    fn close_block(&mut self, terminator: Reg) {
        let cur = self.current_label;
        assert!(cur != Reg::NONE);
        match &mut self.node_mut(cur).data {
            NodeData::Label { terminator: t, .. } => *t = terminator,
            _ => unreachable!(),
        }
        self.current_label = Reg::NONE;
    }

    /// Registers appended to the open block so far, oldest first.
    fn block_range(&self) -> impl Iterator<Item = Reg> {
        let start = self.current_label.index() + 1;
        (start..self.nodes.len()).map(|i| Reg::from_u32(i as u32))
    }

    fn check_same_type(&self, a: Reg, b: Reg) {
        if self.node(a).dt != self.node(b).dt {
            panic!(
                "{}: operand type mismatch, {a} is {} but {b} is {} in:\n{}",
                self.name,
                self.node(a).dt,
                self.node(b).dt,
                self
            );
        }
    }

    // ------------------------------------------------------------------
    // Block structure.

    /// Reserve a fresh block id. The block itself is placed later with
    /// [`Function::begin_label`], which makes forward branches possible.
    pub fn new_label_id(&mut self) -> Label {
        let id = Label::from_u32(self.label_count);
        self.label_count += 1;
        id
    }

    /// Start the block named `label`. A still-open previous block falls
    /// through into it.
    pub fn begin_label(&mut self, label: Label) -> Reg {
        assert!(
            label.as_u32() >= 1 && label.as_u32() < self.label_count,
            "{}: unknown label {label}",
            self.name
        );
        let r = self.make(NodeData::Label { label, terminator: Reg::NONE }, types::PTR);
        if self.current_label != Reg::NONE {
            match &mut self.node_mut(self.current_label).data {
                NodeData::Label { terminator, .. } => *terminator = r,
                _ => unreachable!(),
            }
        }
        self.current_label = r;
        r
    }

    /// Unconditional branch. Silently dropped when the block is already
    /// closed, so front ends may emit a jump after a `ret` without harm.
    pub fn goto(&mut self, dest: Label) {
        if self.current_label == Reg::NONE {
            return;
        }
        let r = self.make(NodeData::Goto { dest }, types::VOID);
        self.close_block(r);
    }

    /// Two-way conditional branch on `cond != 0`.
    pub fn br_if(&mut self, cond: Reg, then_dest: Label, else_dest: Label) -> Reg {
        let r = self.make(NodeData::BrIf { cond, then_dest, else_dest }, types::VOID);
        self.close_block(r);
        r
    }

    /// Multi-way branch over integer keys.
    pub fn switch(&mut self, dt: DataType, key: Reg, default_dest: Label, entries: &[SwitchEntry]) {
        let mut words: SmallVec<[u32; 16]> = SmallVec::with_capacity(entries.len() * 2);
        for e in entries {
            words.push(e.key);
            words.push(e.dest.as_u32());
        }
        let slice = self.push_aux(&words);
        let r = self.make(NodeData::Switch { key, default_dest, entries: slice }, dt);
        self.close_block(r);
    }

    /// Return. Pass `Reg::NONE` from a void function.
    pub fn ret(&mut self, value: Reg) {
        let dt = self.prototype.ret;
        let r = self.make(NodeData::Ret { value }, dt);
        self.close_block(r);
    }

    /// Mark the current point as unreachable.
    pub fn unreachable(&mut self) {
        let r = self.make(NodeData::Unreachable, types::VOID);
        self.close_block(r);
    }

    // ------------------------------------------------------------------
    // Constants.

    /// An unsigned integer constant. The payload is masked to the width of
    /// `dt` before it is stored.
    pub fn uint(&mut self, dt: DataType, imm: u64) -> Reg {
        debug_assert!(dt.is_int() || dt.is_ptr());
        let imm = imm & dt.mask();
        for r in self.block_range() {
            if let NodeData::UintConst { imm: other } = self.node(r).data {
                if other == imm && self.node(r).dt == dt {
                    return r;
                }
            }
        }
        self.make(NodeData::UintConst { imm }, dt)
    }

    /// A signed integer constant, stored in its canonical masked form.
    pub fn sint(&mut self, dt: DataType, imm: i64) -> Reg {
        debug_assert!(dt.is_int() || dt.is_ptr());
        let imm = (imm as u64 & dt.mask()) as i64;
        for r in self.block_range() {
            if let NodeData::SintConst { imm: other } = self.node(r).data {
                if other == imm && self.node(r).dt == dt {
                    return r;
                }
            }
        }
        self.make(NodeData::SintConst { imm }, dt)
    }

    /// A boolean constant.
    pub fn bconst(&mut self, imm: bool) -> Reg {
        self.uint(types::BOOL, imm as u64)
    }

    /// A pointer-typed constant.
    pub fn ptr_imm(&mut self, imm: u64) -> Reg {
        self.make(NodeData::UintConst { imm }, types::PTR)
    }

    /// A float constant.
    pub fn fconst(&mut self, dt: DataType, imm: f64) -> Reg {
        debug_assert!(dt.is_float());
        self.make(NodeData::FloatConst { imm }, dt)
    }

    /// A pooled byte string; produces its address.
    pub fn string_const(&mut self, data: &[u8]) -> Reg {
        self.make(NodeData::StringConst { data: data.into() }, types::PTR)
    }

    /// A pooled NUL-terminated string; produces its address.
    pub fn cstring(&mut self, s: &str) -> Reg {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
        self.make(NodeData::StringConst { data: data.into() }, types::PTR)
    }

    /// The address of another function in the module.
    pub fn func_addr(&mut self, func: FuncId) -> Reg {
        self.make(NodeData::FuncAddr { func }, types::PTR)
    }

    /// The address of an imported symbol.
    pub fn extern_addr(&mut self, ext: ExternalId) -> Reg {
        self.make(NodeData::ExternAddr { ext }, types::PTR)
    }

    /// The address of a module global.
    pub fn global_addr(&mut self, global: GlobalId) -> Reg {
        self.make(NodeData::GlobalAddr { global }, types::PTR)
    }

    // ------------------------------------------------------------------
    // Memory.

    /// A stack slot of the given size and alignment; produces its address.
    pub fn local(&mut self, size: u32, align: u32) -> Reg {
        assert!(size > 0, "{}: empty local", self.name);
        assert!(align.is_power_of_two(), "{}: local alignment {align}", self.name);
        self.make(NodeData::Local { size, align }, types::PTR)
    }

    /// The address of parameter `index`'s home slot.
    pub fn param_addr(&mut self, index: u32) -> Reg {
        let param = self.param(index);
        let size = self.prototype.params[index as usize].bytes();
        self.make(NodeData::ParamAddr { param, size, align: size }, types::PTR)
    }

    /// A load. A second load of the same `(dt, addr, align)` within the
    /// block reuses the first one's register.
    pub fn load(&mut self, dt: DataType, addr: Reg, align: u32) -> Reg {
        for r in self.block_range() {
            if let NodeData::Load { addr: a, align: al, volatile: false } = self.node(r).data {
                if a == addr && al == align && self.node(r).dt == dt {
                    return r;
                }
            }
        }
        self.make(NodeData::Load { addr, align, volatile: false }, dt)
    }

    /// A store. A duplicate of an earlier store in the block with the same
    /// `(dt, addr, value, align)` is dropped.
    pub fn store(&mut self, dt: DataType, addr: Reg, value: Reg, align: u32) {
        for r in self.block_range() {
            if let NodeData::Store { addr: a, value: v, align: al, volatile: false } =
                self.node(r).data
            {
                if a == addr && v == value && al == align && self.node(r).dt == dt {
                    return;
                }
            }
        }
        self.make(NodeData::Store { addr, value, align, volatile: false }, dt);
    }

    /// A load that must not be elided or reordered.
    pub fn volatile_load(&mut self, dt: DataType, addr: Reg, align: u32) -> Reg {
        self.make(NodeData::Load { addr, align, volatile: true }, dt)
    }

    /// A store that must not be elided or reordered.
    pub fn volatile_store(&mut self, dt: DataType, addr: Reg, value: Reg, align: u32) {
        self.make(NodeData::Store { addr, value, align, volatile: true }, dt);
    }

    /// Fill `size` bytes at `dst` with the low byte of `value`.
    pub fn memset(&mut self, dst: Reg, value: Reg, size: Reg, align: u32) {
        self.make(NodeData::Memset { dst, value, size, align }, types::PTR);
    }

    /// Copy `size` bytes from `src` to `dst`.
    pub fn memcpy(&mut self, dst: Reg, src: Reg, size: Reg, align: u32) {
        self.make(NodeData::Memcpy { dst, src, size, align }, types::PTR);
    }

    /// Zero `size` bytes at `addr`.
    pub fn memclr(&mut self, addr: Reg, size: u32, align: u32) {
        self.make(NodeData::Memclr { addr, size, align }, types::PTR);
    }

    /// Zero-initialise a fresh allocation.
    pub fn initialize(&mut self, addr: Reg, size: u32) {
        self.make(NodeData::Initialize { addr, size }, types::PTR);
    }

    /// Assert that a pointer has no aliases in its scope.
    pub fn restrict_(&mut self, value: Reg) -> Reg {
        self.make(NodeData::Restrict { value }, types::PTR)
    }

    /// The variadic argument cursor. `base` must be a parameter address.
    pub fn va_start(&mut self, base: Reg) -> Reg {
        assert!(
            matches!(self.node(base).data, NodeData::ParamAddr { .. }),
            "{}: va_start needs a parameter address",
            self.name
        );
        self.make(NodeData::VaStart { base }, types::PTR)
    }

    /// `base + index * stride`, as an address.
    pub fn array_access(&mut self, base: Reg, index: Reg, stride: u32) -> Reg {
        self.make(NodeData::ArrayAccess { base, index, stride }, types::PTR)
    }

    /// `base + offset`, as an address.
    pub fn member_access(&mut self, base: Reg, offset: i32) -> Reg {
        self.make(NodeData::MemberAccess { base, offset }, types::PTR)
    }

    // ------------------------------------------------------------------
    // Integer arithmetic.

    fn int_binary(&mut self, op: IntOp, behavior: ArithBehavior, mut a: Reg, mut b: Reg) -> Reg {
        self.check_same_type(a, b);
        let dt = self.node(a).dt;

        // Commutative operands are normalised constant-to-the-right.
        if op.is_commutative() && self.node(a).data.as_int_const().is_some() {
            core::mem::swap(&mut a, &mut b);
        }

        let ca = self.node(a).data.as_int_const();
        let cb = self.node(b).data.as_int_const();
        if let (Some(x), Some(y)) = (ca, cb) {
            let folded = fold_int_binary(op, behavior, dt, x, y);
            let signed = matches!(self.node(a).data, NodeData::SintConst { .. })
                && matches!(self.node(b).data, NodeData::SintConst { .. });
            return if signed { self.sint(dt, folded as i64) } else { self.uint(dt, folded) };
        }

        match op {
            IntOp::Add => {
                if cb == Some(0) {
                    return a;
                }
                // Left-leaning reassociation keeps constants bubbling to the
                // outermost right operand.
                if let NodeData::IntBinary { op: IntOp::Add, behavior: inner, a: aa, b: ab } =
                    self.node(a).data
                {
                    if inner == behavior {
                        let rhs = self.add(ab, b, behavior);
                        return self.add(aa, rhs, behavior);
                    }
                }
            }
            IntOp::Sub => {
                if a == b {
                    return self.uint(dt, 0);
                }
                if cb == Some(0) {
                    return a;
                }
            }
            IntOp::Udiv | IntOp::Sdiv => {
                if cb == Some(1) {
                    return a;
                }
            }
            _ => {}
        }

        // Block-local value numbering of pure arithmetic.
        for r in self.block_range() {
            if let NodeData::IntBinary { op: o, behavior: ab, a: x, b: y } = self.node(r).data {
                if o == op && ab == behavior && x == a && y == b && self.node(r).dt == dt {
                    return r;
                }
            }
        }
        self.make(NodeData::IntBinary { op, behavior, a, b }, dt)
    }

    pub fn add(&mut self, a: Reg, b: Reg, behavior: ArithBehavior) -> Reg {
        self.int_binary(IntOp::Add, behavior, a, b)
    }

    pub fn sub(&mut self, a: Reg, b: Reg, behavior: ArithBehavior) -> Reg {
        self.int_binary(IntOp::Sub, behavior, a, b)
    }

    pub fn mul(&mut self, a: Reg, b: Reg, behavior: ArithBehavior) -> Reg {
        self.int_binary(IntOp::Mul, behavior, a, b)
    }

    /// Integer division. Division cannot overflow, so no behaviour tag.
    pub fn div(&mut self, a: Reg, b: Reg, signed: bool) -> Reg {
        let op = if signed { IntOp::Sdiv } else { IntOp::Udiv };
        self.int_binary(op, ArithBehavior::AssumeNoWrap, a, b)
    }

    /// Integer remainder.
    pub fn rem(&mut self, a: Reg, b: Reg, signed: bool) -> Reg {
        let op = if signed { IntOp::Smod } else { IntOp::Umod };
        self.int_binary(op, ArithBehavior::AssumeNoWrap, a, b)
    }

    pub fn and(&mut self, a: Reg, b: Reg) -> Reg {
        self.int_binary(IntOp::And, ArithBehavior::AssumeNoWrap, a, b)
    }

    pub fn or(&mut self, a: Reg, b: Reg) -> Reg {
        self.int_binary(IntOp::Or, ArithBehavior::AssumeNoWrap, a, b)
    }

    pub fn xor(&mut self, a: Reg, b: Reg) -> Reg {
        self.int_binary(IntOp::Xor, ArithBehavior::AssumeNoWrap, a, b)
    }

    pub fn shl(&mut self, a: Reg, b: Reg, behavior: ArithBehavior) -> Reg {
        self.int_binary(IntOp::Shl, behavior, a, b)
    }

    /// Logical shift right.
    pub fn shr(&mut self, a: Reg, b: Reg) -> Reg {
        self.int_binary(IntOp::Shr, ArithBehavior::AssumeNoWrap, a, b)
    }

    /// Arithmetic shift right.
    pub fn sar(&mut self, a: Reg, b: Reg) -> Reg {
        self.int_binary(IntOp::Sar, ArithBehavior::AssumeNoWrap, a, b)
    }

    pub fn not(&mut self, value: Reg) -> Reg {
        let dt = self.node(value).dt;
        if let Some(v) = self.node(value).data.as_int_const() {
            return self.uint(dt, !v);
        }
        self.make(NodeData::Unary { op: UnaryOp::Not, value }, dt)
    }

    pub fn neg(&mut self, value: Reg) -> Reg {
        let dt = self.node(value).dt;
        match self.node(value).data {
            NodeData::SintConst { imm } => return self.sint(dt, imm.wrapping_neg()),
            NodeData::FloatConst { imm } => return self.fconst(dt, -imm),
            _ => {}
        }
        self.make(NodeData::Unary { op: UnaryOp::Neg, value }, dt)
    }

    // ------------------------------------------------------------------
    // Float arithmetic.

    fn float_binary(&mut self, op: FloatOp, a: Reg, b: Reg) -> Reg {
        self.check_same_type(a, b);
        let dt = self.node(a).dt;
        self.make(NodeData::FloatBinary { op, a, b }, dt)
    }

    pub fn fadd(&mut self, a: Reg, b: Reg) -> Reg {
        self.float_binary(FloatOp::Add, a, b)
    }

    pub fn fsub(&mut self, a: Reg, b: Reg) -> Reg {
        self.float_binary(FloatOp::Sub, a, b)
    }

    pub fn fmul(&mut self, a: Reg, b: Reg) -> Reg {
        self.float_binary(FloatOp::Mul, a, b)
    }

    pub fn fdiv(&mut self, a: Reg, b: Reg) -> Reg {
        self.float_binary(FloatOp::Div, a, b)
    }

    /// `sqrtss`/`sqrtsd`.
    pub fn x86_sqrt(&mut self, value: Reg) -> Reg {
        let dt = self.node(value).dt;
        self.make(NodeData::Unary { op: UnaryOp::Sqrt, value }, dt)
    }

    /// `rsqrtss`: a fast approximate reciprocal square root.
    pub fn x86_rsqrt(&mut self, value: Reg) -> Reg {
        let dt = self.node(value).dt;
        self.make(NodeData::Unary { op: UnaryOp::Rsqrt, value }, dt)
    }

    // ------------------------------------------------------------------
    // Conversions.

    fn unary(&mut self, op: UnaryOp, value: Reg, dt: DataType) -> Reg {
        self.make(NodeData::Unary { op, value }, dt)
    }

    pub fn trunc(&mut self, value: Reg, dt: DataType) -> Reg {
        self.unary(UnaryOp::Trunc, value, dt)
    }

    pub fn sext(&mut self, value: Reg, dt: DataType) -> Reg {
        self.unary(UnaryOp::Sext, value, dt)
    }

    pub fn zext(&mut self, value: Reg, dt: DataType) -> Reg {
        self.unary(UnaryOp::Zext, value, dt)
    }

    pub fn fpext(&mut self, value: Reg, dt: DataType) -> Reg {
        self.unary(UnaryOp::FloatExt, value, dt)
    }

    pub fn int_to_float(&mut self, value: Reg, dt: DataType) -> Reg {
        match self.node(value).data {
            NodeData::SintConst { imm } => return self.fconst(dt, imm as f64),
            NodeData::UintConst { imm } => return self.fconst(dt, imm as f64),
            _ => {}
        }
        self.unary(UnaryOp::IntToFloat, value, dt)
    }

    pub fn uint_to_float(&mut self, value: Reg, dt: DataType) -> Reg {
        if let NodeData::UintConst { imm } = self.node(value).data {
            return self.fconst(dt, imm as f64);
        }
        self.unary(UnaryOp::UintToFloat, value, dt)
    }

    pub fn float_to_int(&mut self, value: Reg, dt: DataType) -> Reg {
        self.unary(UnaryOp::FloatToInt, value, dt)
    }

    pub fn float_to_uint(&mut self, value: Reg, dt: DataType) -> Reg {
        self.unary(UnaryOp::FloatToUint, value, dt)
    }

    pub fn int_to_ptr(&mut self, value: Reg) -> Reg {
        self.unary(UnaryOp::IntToPtr, value, types::PTR)
    }

    pub fn ptr_to_int(&mut self, value: Reg, dt: DataType) -> Reg {
        self.unary(UnaryOp::PtrToInt, value, dt)
    }

    pub fn bitcast(&mut self, value: Reg, dt: DataType) -> Reg {
        assert_eq!(
            self.node(value).dt.bytes(),
            dt.bytes(),
            "{}: bitcast must preserve size",
            self.name
        );
        self.unary(UnaryOp::Bitcast, value, dt)
    }

    // ------------------------------------------------------------------
    // Comparisons. Greater-than forms compile to their swapped less-than
    // counterparts so the IR carries one canonical comparison set.

    fn icmp(&mut self, cond: IntCond, a: Reg, b: Reg) -> Reg {
        self.check_same_type(a, b);
        let operand_dt = self.node(a).dt;
        self.make(NodeData::Icmp { cond, a, b, operand_dt }, types::BOOL)
    }

    pub fn icmp_eq(&mut self, a: Reg, b: Reg) -> Reg {
        self.icmp(IntCond::Eq, a, b)
    }

    pub fn icmp_ne(&mut self, a: Reg, b: Reg) -> Reg {
        self.icmp(IntCond::Ne, a, b)
    }

    pub fn icmp_lt(&mut self, a: Reg, b: Reg, signed: bool) -> Reg {
        self.icmp(if signed { IntCond::Slt } else { IntCond::Ult }, a, b)
    }

    pub fn icmp_le(&mut self, a: Reg, b: Reg, signed: bool) -> Reg {
        self.icmp(if signed { IntCond::Sle } else { IntCond::Ule }, a, b)
    }

    pub fn icmp_gt(&mut self, a: Reg, b: Reg, signed: bool) -> Reg {
        self.icmp(if signed { IntCond::Slt } else { IntCond::Ult }, b, a)
    }

    pub fn icmp_ge(&mut self, a: Reg, b: Reg, signed: bool) -> Reg {
        self.icmp(if signed { IntCond::Sle } else { IntCond::Ule }, b, a)
    }

    fn fcmp(&mut self, cond: FloatCond, a: Reg, b: Reg) -> Reg {
        self.check_same_type(a, b);
        assert!(self.node(a).dt.is_float(), "{}: fcmp on non-float operands", self.name);
        let operand_dt = self.node(a).dt;
        self.make(NodeData::Fcmp { cond, a, b, operand_dt }, types::BOOL)
    }

    pub fn fcmp_eq(&mut self, a: Reg, b: Reg) -> Reg {
        self.fcmp(FloatCond::Eq, a, b)
    }

    pub fn fcmp_ne(&mut self, a: Reg, b: Reg) -> Reg {
        self.fcmp(FloatCond::Ne, a, b)
    }

    pub fn fcmp_lt(&mut self, a: Reg, b: Reg) -> Reg {
        self.fcmp(FloatCond::Lt, a, b)
    }

    pub fn fcmp_le(&mut self, a: Reg, b: Reg) -> Reg {
        self.fcmp(FloatCond::Le, a, b)
    }

    pub fn fcmp_gt(&mut self, a: Reg, b: Reg) -> Reg {
        self.fcmp(FloatCond::Lt, b, a)
    }

    pub fn fcmp_ge(&mut self, a: Reg, b: Reg) -> Reg {
        self.fcmp(FloatCond::Le, b, a)
    }

    // ------------------------------------------------------------------
    // Value selection.

    pub fn select(&mut self, cond: Reg, then_value: Reg, else_value: Reg) -> Reg {
        self.check_same_type(then_value, else_value);
        let dt = self.node(then_value).dt;
        self.make(NodeData::Select { cond, then_value, else_value }, dt)
    }

    /// A two-input phi. Inputs are tagged with the block the value flows in
    /// from; an input may name a register defined later in the stream.
    pub fn phi2(&mut self, a_label: Label, a: Reg, b_label: Label, b: Reg) -> Reg {
        self.check_same_type(a, b);
        let dt = self.node(a).dt;
        self.make(NodeData::Phi2 { a_label, a, b_label, b }, dt)
    }

    // ------------------------------------------------------------------
    // Calls.

    /// Call another function in the module.
    pub fn call(&mut self, dt: DataType, target: FuncId, args: &[Reg]) -> Reg {
        let words: SmallVec<[u32; 8]> = args.iter().map(|r| r.as_u32()).collect();
        let slice = self.push_aux(&words);
        self.make(NodeData::Call { target, args: slice }, dt)
    }

    /// Call an imported symbol.
    pub fn ecall(&mut self, dt: DataType, target: ExternalId, args: &[Reg]) -> Reg {
        let words: SmallVec<[u32; 8]> = args.iter().map(|r| r.as_u32()).collect();
        let slice = self.push_aux(&words);
        self.make(NodeData::ECall { target, args: slice }, dt)
    }

    /// Call through a function pointer.
    pub fn vcall(&mut self, dt: DataType, target: Reg, args: &[Reg]) -> Reg {
        let words: SmallVec<[u32; 8]> = args.iter().map(|r| r.as_u32()).collect();
        let slice = self.push_aux(&words);
        self.make(NodeData::VCall { target, args: slice }, dt)
    }

    // ------------------------------------------------------------------
    // Atomics.

    pub fn atomic_load(&mut self, dt: DataType, addr: Reg, order: MemOrder) -> Reg {
        self.make(NodeData::AtomicLoad { addr, order }, dt)
    }

    fn atomic_rmw(&mut self, op: AtomicOp, addr: Reg, src: Reg, order: MemOrder) -> Reg {
        let dt = self.node(src).dt;
        self.make(NodeData::AtomicRmw { op, addr, src, order }, dt)
    }

    pub fn atomic_xchg(&mut self, addr: Reg, src: Reg, order: MemOrder) -> Reg {
        self.atomic_rmw(AtomicOp::Xchg, addr, src, order)
    }

    pub fn atomic_add(&mut self, addr: Reg, src: Reg, order: MemOrder) -> Reg {
        self.atomic_rmw(AtomicOp::Add, addr, src, order)
    }

    pub fn atomic_sub(&mut self, addr: Reg, src: Reg, order: MemOrder) -> Reg {
        self.atomic_rmw(AtomicOp::Sub, addr, src, order)
    }

    pub fn atomic_and(&mut self, addr: Reg, src: Reg, order: MemOrder) -> Reg {
        self.atomic_rmw(AtomicOp::And, addr, src, order)
    }

    pub fn atomic_or(&mut self, addr: Reg, src: Reg, order: MemOrder) -> Reg {
        self.atomic_rmw(AtomicOp::Or, addr, src, order)
    }

    pub fn atomic_xor(&mut self, addr: Reg, src: Reg, order: MemOrder) -> Reg {
        self.atomic_rmw(AtomicOp::Xor, addr, src, order)
    }

    /// Compare-exchange. Produces a pair of adjacent nodes: the success flag
    /// and the previous memory value.
    pub fn atomic_cmpxchg(
        &mut self,
        addr: Reg,
        expected: Reg,
        desired: Reg,
        success: MemOrder,
        failure: MemOrder,
    ) -> CmpxchgResult {
        self.check_same_type(expected, desired);
        let dt = self.node(desired).dt;
        let flag = self.make(NodeData::AtomicCmpxchg { addr, expected, success, failure }, types::BOOL);
        let old = self.make(NodeData::AtomicCmpxchgOld { addr, desired }, dt);
        debug_assert_eq!(flag.as_u32() + 1, old.as_u32());
        CmpxchgResult { success: flag, old_value: old }
    }

    pub fn atomic_test_and_set(&mut self, addr: Reg, order: MemOrder) -> Reg {
        self.make(NodeData::AtomicTestAndSet { addr, order }, types::BOOL)
    }

    pub fn atomic_clear(&mut self, addr: Reg, order: MemOrder) -> Reg {
        self.make(NodeData::AtomicClear { addr, order }, types::BOOL)
    }

    // ------------------------------------------------------------------
    // Debug.

    /// Record a source position. Consecutive markers coalesce.
    pub fn source_line(&mut self, file: FileId, line: u32) {
        if let Some(last) = self.nodes.last() {
            if matches!(last.data, NodeData::Line { .. }) {
                return;
            }
        }
        self.make(NodeData::Line { file, line }, types::VOID);
    }

    /// An `int3` breakpoint.
    pub fn debug_break(&mut self) {
        self.make(NodeData::DebugBreak, types::VOID);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::I32;
    use crate::ir::Prototype;

    fn func(params: &[DataType], ret: DataType) -> Function {
        Function::new(FuncId::from_u32(0), "test", Prototype::new(params.to_vec(), ret))
    }

    #[test]
    fn fold_masks_to_width() {
        assert_eq!(
            fold_int_binary(IntOp::Add, ArithBehavior::Wrap, types::I8, 0xF0, 0x20),
            0x10
        );
        assert_eq!(
            fold_int_binary(IntOp::Add, ArithBehavior::AssumeNoWrap, types::I8, 0xF0, 0x20),
            0x10
        );
        assert_eq!(
            fold_int_binary(IntOp::Add, ArithBehavior::SaturateUnsigned, types::I8, 0xF0, 0x20),
            0xFF
        );
        assert_eq!(fold_int_binary(IntOp::Udiv, ArithBehavior::Wrap, I32, 7, 0), 0);
        assert_eq!(
            fold_int_binary(IntOp::Sdiv, ArithBehavior::Wrap, I32, (-6i64) as u64, 3),
            0xFFFF_FFFE
        );
    }

    #[test]
    fn constants_fold_in_builder() {
        let mut f = func(&[], I32);
        let three = f.uint(I32, 3);
        let four = f.uint(I32, 4);
        let sum = f.add(three, four, ArithBehavior::Wrap);
        assert_eq!(f.node(sum).data.as_int_const(), Some(7));
    }

    #[test]
    fn commutative_constant_moves_right() {
        let mut f = func(&[I32], I32);
        let p = f.param(0);
        let one = f.uint(I32, 1);
        let sum = f.add(one, p, ArithBehavior::Wrap);
        match f.node(sum).data {
            NodeData::IntBinary { op: IntOp::Add, a, b, .. } => {
                assert_eq!(a, p);
                assert_eq!(b, one);
            }
            ref other => panic!("expected add, got {other:?}"),
        }
    }

    #[test]
    fn identities() {
        let mut f = func(&[I32], I32);
        let p = f.param(0);
        let zero = f.uint(I32, 0);
        assert_eq!(f.add(p, zero, ArithBehavior::Wrap), p);
        let diff = f.sub(p, p, ArithBehavior::Wrap);
        assert_eq!(f.node(diff).data.as_int_const(), Some(0));
        let one = f.uint(I32, 1);
        assert_eq!(f.div(p, one, true), p);
    }

    #[test]
    fn loads_value_number_within_a_block() {
        let mut f = func(&[], I32);
        let slot = f.local(4, 4);
        let a = f.load(I32, slot, 4);
        let b = f.load(I32, slot, 4);
        assert_eq!(a, b);
        let c = f.volatile_load(I32, slot, 4);
        assert_ne!(a, c);
    }

    #[test]
    fn duplicate_stores_elide() {
        let mut f = func(&[], I32);
        let slot = f.local(4, 4);
        let v = f.uint(I32, 5);
        let before = f.len();
        f.store(I32, slot, v, 4);
        let after_one = f.len();
        f.store(I32, slot, v, 4);
        assert_eq!(after_one, before + 1);
        assert_eq!(f.len(), after_one);
    }

    #[test]
    fn greater_than_swaps_into_less_than() {
        let mut f = func(&[I32, I32], I32);
        let (a, b) = (f.param(0), f.param(1));
        let cmp = f.icmp_gt(a, b, true);
        match f.node(cmp).data {
            NodeData::Icmp { cond: IntCond::Slt, a: x, b: y, .. } => {
                assert_eq!((x, y), (b, a));
            }
            ref other => panic!("expected slt, got {other:?}"),
        }
    }

    #[test]
    fn goto_after_ret_is_dropped() {
        let mut f = func(&[], I32);
        let v = f.uint(I32, 1);
        let dest = f.new_label_id();
        f.ret(v);
        let before = f.len();
        f.goto(dest);
        assert_eq!(f.len(), before);
        f.begin_label(dest);
        f.ret(v);
    }

    #[test]
    #[should_panic(expected = "without an open basic block")]
    fn append_after_terminator_panics() {
        let mut f = func(&[], I32);
        let v = f.uint(I32, 1);
        f.ret(v);
        let _ = f.uint(I32, 2);
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn mismatched_operands_panic() {
        let mut f = func(&[I32], I32);
        let p = f.param(0);
        let wide = f.uint(types::I64, 1);
        let _ = f.add(p, wide, ArithBehavior::Wrap);
    }
}
