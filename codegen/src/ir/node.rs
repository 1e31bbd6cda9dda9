//! IR nodes.
//!
//! A function is a flat stream of `Node`s indexed by [`Reg`]. Each node is a
//! single tagged value: the kind and its payload live together in
//! [`NodeData`] and every consumer pattern-matches on it. The data type of
//! the produced value is stored alongside.

use crate::ir::types::DataType;
use crate::ir::{AuxSlice, ExternalId, FileId, FuncId, GlobalId, Label, Reg};

/// How integer arithmetic treats overflow.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ArithBehavior {
    /// Two's complement wrap around.
    Wrap,
    /// Overflow is assumed not to happen; the result is still masked to the
    /// type width.
    AssumeNoWrap,
    /// Clamp to the unsigned range on overflow.
    SaturateUnsigned,
    /// Clamp to the signed range on overflow.
    SaturateSigned,
}

/// Memory ordering for atomic operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MemOrder {
    Relaxed,
    Acquire,
    Release,
    AcqRel,
    SeqCst,
}

/// Two-operand integer operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    Udiv,
    Sdiv,
    Umod,
    Smod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
}

impl IntOp {
    /// True for operations where the operand order does not matter.
    pub fn is_commutative(self) -> bool {
        matches!(self, IntOp::Add | IntOp::Mul | IntOp::And | IntOp::Or | IntOp::Xor)
    }
}

/// Two-operand float operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// One-operand operations: bit manipulation, conversions and the x86 SSE
/// reciprocal intrinsics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum UnaryOp {
    Not,
    Neg,
    Trunc,
    Sext,
    Zext,
    FloatExt,
    IntToFloat,
    UintToFloat,
    FloatToInt,
    FloatToUint,
    IntToPtr,
    PtrToInt,
    Bitcast,
    Sqrt,
    Rsqrt,
}

/// Integer comparison conditions. Greater-than forms are canonicalised away
/// by the builder, so only the less-than family exists in the IR.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum IntCond {
    Eq,
    Ne,
    Slt,
    Sle,
    Ult,
    Ule,
}

/// Float comparison conditions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum FloatCond {
    Eq,
    Ne,
    Lt,
    Le,
}

/// Read-modify-write atomic operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AtomicOp {
    Xchg,
    Add,
    Sub,
    And,
    Or,
    Xor,
}

/// A node in the IR stream.
#[derive(Clone, Debug)]
pub struct Node {
    /// Kind and payload.
    pub data: NodeData,
    /// Type of the produced value. `types::VOID` for pure effects.
    pub dt: DataType,
}

/// The kind of a node together with its payload.
///
/// Call arguments, switch entries and wide phi inputs do not fit inline;
/// they live in the function's auxiliary pool and the node holds an
/// [`AuxSlice`] into it.
#[derive(Clone, Debug)]
pub enum NodeData {
    /// The null node, also what dead nodes decay into.
    Nop,
    /// Forwards another value. Produced by rewrites in place of an elided
    /// node so that `Reg` ids stay stable; removed by compaction.
    Pass { value: Reg },

    // Block structure and terminators.
    /// Starts a basic block. `terminator` is filled in when the block is
    /// closed.
    Label { label: Label, terminator: Reg },
    /// Unconditional branch.
    Goto { dest: Label },
    /// Two-way conditional branch.
    BrIf { cond: Reg, then_dest: Label, else_dest: Label },
    /// Multi-way branch. The aux slice holds `(key, label)` pairs.
    Switch { key: Reg, default_dest: Label, entries: AuxSlice },
    /// Function return. `value` is `Reg::NONE` for void returns.
    Ret { value: Reg },
    /// Control never reaches this point.
    Unreachable,

    // Constants.
    UintConst { imm: u64 },
    SintConst { imm: i64 },
    FloatConst { imm: f64 },
    StringConst { data: Box<[u8]> },
    FuncAddr { func: FuncId },
    ExternAddr { ext: ExternalId },
    GlobalAddr { global: GlobalId },

    // Memory.
    /// A stack allocation. Produces the address.
    Local { size: u32, align: u32 },
    /// The i'th function parameter.
    Param { index: u32, size: u32 },
    /// The address of a parameter's home slot.
    ParamAddr { param: Reg, size: u32, align: u32 },
    Load { addr: Reg, align: u32, volatile: bool },
    Store { addr: Reg, value: Reg, align: u32, volatile: bool },
    /// Zero-initialise a fresh allocation of a known size.
    Initialize { addr: Reg, size: u32 },
    Memset { dst: Reg, value: Reg, size: Reg, align: u32 },
    Memcpy { dst: Reg, src: Reg, size: Reg, align: u32 },
    Memclr { addr: Reg, size: u32, align: u32 },
    /// `base + index * stride`, produced as an address.
    ArrayAccess { base: Reg, index: Reg, stride: u32 },
    /// `base + offset`, produced as an address.
    MemberAccess { base: Reg, offset: i32 },
    /// Marks a pointer as free of aliases within its scope.
    Restrict { value: Reg },
    /// The variadic cursor for a parameter's home slot.
    VaStart { base: Reg },

    // Arithmetic.
    IntBinary { op: IntOp, behavior: ArithBehavior, a: Reg, b: Reg },
    FloatBinary { op: FloatOp, a: Reg, b: Reg },
    Unary { op: UnaryOp, value: Reg },

    // Comparisons. `operand_dt` is the type of the compared values; the
    // node itself produces a bool.
    Icmp { cond: IntCond, a: Reg, b: Reg, operand_dt: DataType },
    Fcmp { cond: FloatCond, a: Reg, b: Reg, operand_dt: DataType },

    // Value selection.
    Select { cond: Reg, then_value: Reg, else_value: Reg },
    /// Single-input phi. The input is tagged with its source block.
    Phi1 { label: Label, value: Reg },
    /// Two-input phi.
    Phi2 { a_label: Label, a: Reg, b_label: Label, b: Reg },
    /// Wide phi. The aux slice holds `(label, value)` pairs.
    PhiN { args: AuxSlice },

    // Calls. Arguments live in the aux pool.
    Call { target: FuncId, args: AuxSlice },
    ECall { target: ExternalId, args: AuxSlice },
    VCall { target: Reg, args: AuxSlice },

    // Atomics.
    AtomicLoad { addr: Reg, order: MemOrder },
    AtomicRmw { op: AtomicOp, addr: Reg, src: Reg, order: MemOrder },
    /// First half of a compare-exchange; produces the success flag. Always
    /// immediately followed by its [`NodeData::AtomicCmpxchgOld`] twin.
    AtomicCmpxchg { addr: Reg, expected: Reg, success: MemOrder, failure: MemOrder },
    /// Second half of a compare-exchange; produces the previous value.
    AtomicCmpxchgOld { addr: Reg, desired: Reg },
    AtomicTestAndSet { addr: Reg, order: MemOrder },
    AtomicClear { addr: Reg, order: MemOrder },

    // Debug.
    /// Source line marker, recorded into the line table during emission.
    Line { file: FileId, line: u32 },
    DebugBreak,
}

impl Node {
    /// The null node.
    pub fn nop() -> Node {
        Node { data: NodeData::Nop, dt: crate::ir::types::VOID }
    }
}

impl NodeData {
    /// True for nodes that close a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            NodeData::Goto { .. }
                | NodeData::BrIf { .. }
                | NodeData::Switch { .. }
                | NodeData::Ret { .. }
                | NodeData::Unreachable
                | NodeData::Label { .. }
        )
    }

    /// True for labels.
    pub fn is_label(&self) -> bool {
        matches!(self, NodeData::Label { .. })
    }

    /// True for phi nodes of any width.
    pub fn is_phi(&self) -> bool {
        matches!(self, NodeData::Phi1 { .. } | NodeData::Phi2 { .. } | NodeData::PhiN { .. })
    }

    /// True for nodes that must not be removed even when their value is
    /// unused. Loads count as effects here: the conservative aliasing model
    /// cannot prove a load will not fault or race.
    pub fn has_side_effect(&self) -> bool {
        match self {
            NodeData::Load { .. }
            | NodeData::Store { .. }
            | NodeData::Initialize { .. }
            | NodeData::Memset { .. }
            | NodeData::Memcpy { .. }
            | NodeData::Memclr { .. }
            | NodeData::Call { .. }
            | NodeData::ECall { .. }
            | NodeData::VCall { .. }
            | NodeData::AtomicLoad { .. }
            | NodeData::AtomicRmw { .. }
            | NodeData::AtomicCmpxchg { .. }
            | NodeData::AtomicCmpxchgOld { .. }
            | NodeData::AtomicTestAndSet { .. }
            | NodeData::AtomicClear { .. }
            | NodeData::Line { .. }
            | NodeData::DebugBreak => true,
            _ => false,
        }
    }

    /// True for nodes whose result is an address expression the x86 tiler
    /// can fold into a memory operand.
    pub fn is_address(&self) -> bool {
        matches!(
            self,
            NodeData::Local { .. }
                | NodeData::ParamAddr { .. }
                | NodeData::ExternAddr { .. }
                | NodeData::GlobalAddr { .. }
                | NodeData::ArrayAccess { .. }
                | NodeData::MemberAccess { .. }
        )
    }

    /// The constant payload if this is an integer constant.
    pub fn as_int_const(&self) -> Option<u64> {
        match *self {
            NodeData::UintConst { imm } => Some(imm),
            NodeData::SintConst { imm } => Some(imm as u64),
            _ => None,
        }
    }
}
