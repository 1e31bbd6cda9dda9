//! Textual dump of a function.
//!
//! The printed form is what the optimisation driver logs between passes and
//! what panics attach to a misused builder. It is line oriented and stable:
//! printing the same function twice yields identical text.

use crate::ir::node::{
    ArithBehavior, AtomicOp, FloatCond, FloatOp, IntCond, IntOp, NodeData, UnaryOp,
};
use crate::ir::{builder::sign_extend, Function, Reg};
use core::fmt;

fn int_op_name(op: IntOp) -> &'static str {
    match op {
        IntOp::Add => "add",
        IntOp::Sub => "sub",
        IntOp::Mul => "mul",
        IntOp::Udiv => "udiv",
        IntOp::Sdiv => "sdiv",
        IntOp::Umod => "umod",
        IntOp::Smod => "smod",
        IntOp::And => "and",
        IntOp::Or => "or",
        IntOp::Xor => "xor",
        IntOp::Shl => "shl",
        IntOp::Shr => "shr",
        IntOp::Sar => "sar",
    }
}

fn behavior_suffix(b: ArithBehavior) -> &'static str {
    match b {
        ArithBehavior::Wrap => "",
        ArithBehavior::AssumeNoWrap => " nw",
        ArithBehavior::SaturateUnsigned => " sat_u",
        ArithBehavior::SaturateSigned => " sat_s",
    }
}

impl fmt::Display for Function {
    fn fmt(&self, w: &mut fmt::Formatter) -> fmt::Result {
        write!(w, "fn {}(", self.name)?;
        for (i, p) in self.prototype.params.iter().enumerate() {
            if i != 0 {
                write!(w, ", ")?;
            }
            write!(w, "{p}")?;
        }
        if self.prototype.varargs {
            write!(w, ", ...")?;
        }
        writeln!(w, ") -> {} {{", self.prototype.ret)?;

        for i in 1..self.nodes.len() {
            let r = Reg::from_u32(i as u32);
            let n = self.node(r);
            let dt = n.dt;
            match &n.data {
                NodeData::Nop => writeln!(w, "  {r} = nop")?,
                NodeData::Pass { value } => writeln!(w, "  {r} = pass.{dt} {value}")?,
                NodeData::Label { label, .. } => writeln!(w, "{label}:")?,
                NodeData::Goto { dest } => writeln!(w, "  goto {dest}")?,
                NodeData::BrIf { cond, then_dest, else_dest } => {
                    writeln!(w, "  if {cond} then {then_dest} else {else_dest}")?
                }
                NodeData::Switch { key, default_dest, entries } => {
                    write!(w, "  switch.{dt} {key} [")?;
                    for (i, e) in self.switch_entries(*entries).enumerate() {
                        if i != 0 {
                            write!(w, ", ")?;
                        }
                        write!(w, "{} -> {}", e.key, e.dest)?;
                    }
                    writeln!(w, "] else {default_dest}")?
                }
                NodeData::Ret { value } => {
                    if *value == Reg::NONE {
                        writeln!(w, "  ret")?
                    } else {
                        writeln!(w, "  ret.{dt} {value}")?
                    }
                }
                NodeData::Unreachable => writeln!(w, "  unreachable")?,
                NodeData::UintConst { imm } => writeln!(w, "  {r} = uconst.{dt} {imm}")?,
                NodeData::SintConst { imm } => {
                    let v = sign_extend(*imm as u64, dt.lane_bits().max(1));
                    writeln!(w, "  {r} = sconst.{dt} {v}")?
                }
                NodeData::FloatConst { imm } => writeln!(w, "  {r} = fconst.{dt} {imm}")?,
                NodeData::StringConst { data } => {
                    writeln!(w, "  {r} = string {} bytes", data.len())?
                }
                NodeData::FuncAddr { func } => writeln!(w, "  {r} = func_addr {func}")?,
                NodeData::ExternAddr { ext } => writeln!(w, "  {r} = extern_addr {ext}")?,
                NodeData::GlobalAddr { global } => writeln!(w, "  {r} = global_addr {global}")?,
                NodeData::Local { size, align } => {
                    writeln!(w, "  {r} = local {size} (align {align})")?
                }
                NodeData::Param { index, .. } => writeln!(w, "  {r} = param.{dt} {index}")?,
                NodeData::ParamAddr { param, .. } => writeln!(w, "  {r} = &{param}")?,
                NodeData::Load { addr, align, volatile } => {
                    let v = if *volatile { " volatile" } else { "" };
                    writeln!(w, "  {r} = load.{dt} [{addr}] (align {align}){v}")?
                }
                NodeData::Store { addr, value, align, volatile } => {
                    let v = if *volatile { " volatile" } else { "" };
                    writeln!(w, "  store.{dt} [{addr}], {value} (align {align}){v}")?
                }
                NodeData::Initialize { addr, size } => {
                    writeln!(w, "  initialize [{addr}], {size} bytes")?
                }
                NodeData::Memset { dst, value, size, .. } => {
                    writeln!(w, "  memset [{dst}], {value}, {size}")?
                }
                NodeData::Memcpy { dst, src, size, .. } => {
                    writeln!(w, "  memcpy [{dst}], [{src}], {size}")?
                }
                NodeData::Memclr { addr, size, .. } => {
                    writeln!(w, "  memclr [{addr}], {size} bytes")?
                }
                NodeData::ArrayAccess { base, index, stride } => {
                    writeln!(w, "  {r} = &{base}[{index} * {stride}]")?
                }
                NodeData::MemberAccess { base, offset } => {
                    writeln!(w, "  {r} = &{base}[{offset}]")?
                }
                NodeData::Restrict { value } => writeln!(w, "  {r} = restrict {value}")?,
                NodeData::VaStart { base } => writeln!(w, "  {r} = va_start {base}")?,
                NodeData::IntBinary { op, behavior, a, b } => writeln!(
                    w,
                    "  {r} = {}.{dt} {a}, {b}{}",
                    int_op_name(*op),
                    behavior_suffix(*behavior)
                )?,
                NodeData::FloatBinary { op, a, b } => {
                    let name = match op {
                        FloatOp::Add => "fadd",
                        FloatOp::Sub => "fsub",
                        FloatOp::Mul => "fmul",
                        FloatOp::Div => "fdiv",
                    };
                    writeln!(w, "  {r} = {name}.{dt} {a}, {b}")?
                }
                NodeData::Unary { op, value } => {
                    let name = match op {
                        UnaryOp::Not => "not",
                        UnaryOp::Neg => "neg",
                        UnaryOp::Trunc => "trunc",
                        UnaryOp::Sext => "sext",
                        UnaryOp::Zext => "zext",
                        UnaryOp::FloatExt => "fpext",
                        UnaryOp::IntToFloat => "int_to_float",
                        UnaryOp::UintToFloat => "uint_to_float",
                        UnaryOp::FloatToInt => "float_to_int",
                        UnaryOp::FloatToUint => "float_to_uint",
                        UnaryOp::IntToPtr => "int_to_ptr",
                        UnaryOp::PtrToInt => "ptr_to_int",
                        UnaryOp::Bitcast => "bitcast",
                        UnaryOp::Sqrt => "sqrt",
                        UnaryOp::Rsqrt => "rsqrt",
                    };
                    writeln!(w, "  {r} = {name}.{dt} {value}")?
                }
                NodeData::Icmp { cond, a, b, operand_dt } => {
                    let name = match cond {
                        IntCond::Eq => "eq",
                        IntCond::Ne => "ne",
                        IntCond::Slt => "slt",
                        IntCond::Sle => "sle",
                        IntCond::Ult => "ult",
                        IntCond::Ule => "ule",
                    };
                    writeln!(w, "  {r} = icmp_{name}.{operand_dt} {a}, {b}")?
                }
                NodeData::Fcmp { cond, a, b, operand_dt } => {
                    let name = match cond {
                        FloatCond::Eq => "eq",
                        FloatCond::Ne => "ne",
                        FloatCond::Lt => "lt",
                        FloatCond::Le => "le",
                    };
                    writeln!(w, "  {r} = fcmp_{name}.{operand_dt} {a}, {b}")?
                }
                NodeData::Select { cond, then_value, else_value } => {
                    writeln!(w, "  {r} = select.{dt} {cond}, {then_value}, {else_value}")?
                }
                NodeData::Phi1 { label, value } => {
                    writeln!(w, "  {r} = phi.{dt} [{label}: {value}]")?
                }
                NodeData::Phi2 { a_label, a, b_label, b } => {
                    writeln!(w, "  {r} = phi.{dt} [{a_label}: {a}], [{b_label}: {b}]")?
                }
                NodeData::PhiN { args } => {
                    write!(w, "  {r} = phi.{dt}")?;
                    for (i, (l, v)) in self.phi_args(*args).enumerate() {
                        if i != 0 {
                            write!(w, ",")?;
                        }
                        write!(w, " [{l}: {v}]")?;
                    }
                    writeln!(w)?
                }
                NodeData::Call { target, args } => {
                    write!(w, "  {r} = call.{dt} {target}(")?;
                    for (i, a) in self.call_args(*args).enumerate() {
                        if i != 0 {
                            write!(w, ", ")?;
                        }
                        write!(w, "{a}")?;
                    }
                    writeln!(w, ")")?
                }
                NodeData::ECall { target, args } => {
                    write!(w, "  {r} = ecall.{dt} {target}(")?;
                    for (i, a) in self.call_args(*args).enumerate() {
                        if i != 0 {
                            write!(w, ", ")?;
                        }
                        write!(w, "{a}")?;
                    }
                    writeln!(w, ")")?
                }
                NodeData::VCall { target, args } => {
                    write!(w, "  {r} = vcall.{dt} [{target}](")?;
                    for (i, a) in self.call_args(*args).enumerate() {
                        if i != 0 {
                            write!(w, ", ")?;
                        }
                        write!(w, "{a}")?;
                    }
                    writeln!(w, ")")?
                }
                NodeData::AtomicLoad { addr, order } => {
                    writeln!(w, "  {r} = atomic_load.{dt} [{addr}] {order:?}")?
                }
                NodeData::AtomicRmw { op, addr, src, order } => {
                    let name = match op {
                        AtomicOp::Xchg => "xchg",
                        AtomicOp::Add => "add",
                        AtomicOp::Sub => "sub",
                        AtomicOp::And => "and",
                        AtomicOp::Or => "or",
                        AtomicOp::Xor => "xor",
                    };
                    writeln!(w, "  {r} = atomic_{name}.{dt} [{addr}], {src} {order:?}")?
                }
                NodeData::AtomicCmpxchg { addr, expected, .. } => {
                    writeln!(w, "  {r} = cmpxchg_flag [{addr}], expect {expected}")?
                }
                NodeData::AtomicCmpxchgOld { addr, desired } => {
                    writeln!(w, "  {r} = cmpxchg_old.{dt} [{addr}], desire {desired}")?
                }
                NodeData::AtomicTestAndSet { addr, .. } => {
                    writeln!(w, "  {r} = atomic_test_and_set [{addr}]")?
                }
                NodeData::AtomicClear { addr, .. } => {
                    writeln!(w, "  {r} = atomic_clear [{addr}]")?
                }
                NodeData::Line { file, line } => writeln!(w, "  ; {file}:{line}")?,
                NodeData::DebugBreak => writeln!(w, "  debugbreak")?,
            }
        }
        writeln!(w, "}}")
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::node::ArithBehavior;
    use crate::ir::types::I32;
    use crate::ir::{FuncId, Function, Prototype};

    #[test]
    fn printing_is_stable() {
        let mut f = Function::new(
            FuncId::from_u32(0),
            "stable",
            Prototype::new(vec![I32, I32], I32),
        );
        let (a, b) = (f.param(0), f.param(1));
        let sum = f.add(a, b, ArithBehavior::Wrap);
        f.ret(sum);

        let first = f.to_string();
        let second = f.to_string();
        assert_eq!(first, second);
        assert!(first.contains("add.i32"));
        assert!(first.starts_with("fn stable(i32, i32) -> i32 {"));
    }
}
