//! Structural verification of functions.
//!
//! The verifier checks the invariants every pass and the code generator
//! rely on: block structure, operand ordering, canonical constant payloads
//! and aux pool bounds. It collects every violation instead of stopping at
//! the first so a corrupt function can be diagnosed in one dump.

use crate::ir::node::NodeData;
use crate::ir::{Function, Reg};
use core::fmt;

/// One verifier finding, anchored to the node it concerns.
#[derive(Debug, Clone)]
pub struct VerifierError {
    pub reg: Reg,
    pub message: String,
}

impl fmt::Display for VerifierError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.reg, self.message)
    }
}

/// Check a function. Returns every violation found.
pub fn verify_function(f: &Function) -> Result<(), Vec<VerifierError>> {
    let mut errors = Vec::new();
    let count = f.len();
    let mut err = |reg: Reg, message: String| errors.push(VerifierError { reg, message });

    if count < 2 || !f.node(Reg::ENTRY).data.is_label() {
        err(Reg::ENTRY, "function has no entry label".into());
        return Err(errors);
    }

    // Operands reference earlier nodes; phi inputs are exempt because their
    // edges are label indirected.
    for i in 1..count {
        let r = Reg::from_u32(i);
        let is_phi = f.node(r).data.is_phi();
        f.for_each_operand(r, |op| {
            if op.as_u32() >= count {
                err(r, format!("operand {op} is out of range (node count {count})"));
            } else if !is_phi && op >= r {
                err(r, format!("operand {op} does not precede its use"));
            }
        });
    }

    // Integer constants carry canonically masked payloads.
    for i in 1..count {
        let r = Reg::from_u32(i);
        let n = f.node(r);
        if let Some(v) = n.data.as_int_const() {
            let mask = n.dt.mask();
            if mask != 0 && v & mask != v {
                err(r, format!("constant {v:#x} has bits above the {} mask", n.dt));
            }
        }
    }

    // Parameter nodes sit in their reserved slots with in-range indices.
    let param_count = f.prototype.params.len() as u32;
    for i in 1..count {
        let r = Reg::from_u32(i);
        if let NodeData::Param { index, .. } = f.node(r).data {
            if index >= param_count {
                err(r, format!("parameter index {index} out of range"));
            } else if r != Reg::param(index) {
                err(r, format!("parameter {index} is not in its reserved slot"));
            }
        }
    }

    // Block structure: every label is closed by exactly one terminator, and
    // nothing between a label and its terminator terminates.
    let mut bb = Reg::ENTRY;
    loop {
        let NodeData::Label { terminator, label } = f.node(bb).data else {
            err(bb, "expected a label at block start".into());
            break;
        };
        if label.as_u32() >= f.label_count {
            err(bb, format!("label id {label} out of range"));
        }
        if terminator == Reg::NONE || terminator.as_u32() >= count {
            err(bb, "block has no terminator".into());
            break;
        }
        if !f.node(terminator).data.is_terminator() {
            err(terminator, "label's terminator field does not name a terminator".into());
            break;
        }
        for i in bb.as_u32() + 1..terminator.as_u32() {
            let r = Reg::from_u32(i);
            if f.node(r).data.is_terminator() {
                err(r, "terminator in the middle of a block".into());
            }
        }

        bb = if f.node(terminator).data.is_label() {
            terminator
        } else if terminator.as_u32() + 1 < count {
            let next = Reg::from_u32(terminator.as_u32() + 1);
            if !f.node(next).data.is_label() {
                err(next, "expected a label after a terminator".into());
                break;
            }
            next
        } else {
            break;
        };
    }

    // Aux slices stay within the pool.
    let aux_len = f.aux.len() as u32;
    for i in 1..count {
        let r = Reg::from_u32(i);
        let slice = match f.node(r).data {
            NodeData::Switch { entries, .. } => Some(entries),
            NodeData::PhiN { args } => Some(args),
            NodeData::Call { args, .. }
            | NodeData::ECall { args, .. }
            | NodeData::VCall { args, .. } => Some(args),
            _ => None,
        };
        if let Some(s) = slice {
            if s.start > s.end || s.end > aux_len {
                err(r, format!("aux slice {}..{} escapes the pool ({aux_len})", s.start, s.end));
            }
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::ArithBehavior;
    use crate::ir::types::I32;
    use crate::ir::{FuncId, Function, Prototype};

    #[test]
    fn accepts_a_well_formed_function() {
        let mut f =
            Function::new(FuncId::from_u32(0), "ok", Prototype::new(vec![I32, I32], I32));
        let (a, b) = (f.param(0), f.param(1));
        let sum = f.add(a, b, ArithBehavior::Wrap);
        f.ret(sum);
        assert!(verify_function(&f).is_ok());
    }

    #[test]
    fn rejects_unterminated_blocks() {
        let mut f = Function::new(FuncId::from_u32(0), "open", Prototype::new(vec![I32], I32));
        let _ = f.param(0);
        let errors = verify_function(&f).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("no terminator")));
    }

    #[test]
    fn rejects_unmasked_constants() {
        let mut f = Function::new(FuncId::from_u32(0), "bad", Prototype::new(vec![], I32));
        let v = f.uint(I32, 3);
        f.ret(v);
        // Corrupt the payload behind the builder's back.
        if let crate::ir::NodeData::UintConst { imm } = &mut f.node_mut(v).data {
            *imm = 0x1_0000_0001;
        }
        let errors = verify_function(&f).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("mask")));
    }
}
