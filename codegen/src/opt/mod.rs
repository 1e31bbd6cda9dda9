//! The optimisation pipeline.
//!
//! Every pass is single-function and reports whether it changed anything.
//! The driver runs the sequence to a local fixed point: as long as some
//! pass makes progress, the whole sequence runs again. A round cap bounds
//! the loop against rewrite oscillations; hitting it is a pass bug, not a
//! correctness problem, since every pass leaves the function well formed.

mod canonical;
mod compact;
mod dce;
mod inline;
mod load_elim;
mod mem2reg;
mod rewrite;
mod strength;

pub use canonical::canonicalize;
pub use compact::compact;
pub use dce::dce;
pub use inline::inline;
pub use load_elim::load_elim;
pub use mem2reg::mem2reg;
pub use strength::strength_reduce;

use crate::ir::Function;

/// How much work the compiler puts into a function.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OptLevel {
    /// Straight to code generation.
    None,
    /// Run the full pass pipeline to a fixed point.
    Speed,
}

const MAX_ROUNDS: usize = 64;

/// Optimise one function. `module_funcs` supplies callee bodies for
/// inlining; pass `None` to leave calls alone.
pub fn run(f: &mut Function, module_funcs: Option<&[Function]>) {
    for round in 0..MAX_ROUNDS {
        let mut changed = false;
        changed |= canonicalize(f);
        changed |= strength_reduce(f);
        changed |= mem2reg(f);
        changed |= load_elim(f);
        changed |= dce(f);
        if let Some(funcs) = module_funcs {
            changed |= inline(f, funcs);
        }
        changed |= compact(f);

        log::trace!("{} after round {round}:\n{f}", f.name);
        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::{ArithBehavior, NodeData};
    use crate::ir::types::I32;
    use crate::ir::{FuncId, Function, Prototype, Reg};
    use crate::verifier::verify_function;

    #[test]
    fn pipeline_reaches_a_fixed_point() {
        // store 5; x = load; ret x  collapses to  ret 5.
        let mut f = Function::new(FuncId::from_u32(0), "fx", Prototype::new(vec![], I32));
        let slot = f.local(4, 4);
        let five = f.uint(I32, 5);
        f.store(I32, slot, five, 4);
        let x = f.volatile_load(I32, slot, 4);
        if let NodeData::Load { volatile, .. } = &mut f.node_mut(x).data {
            *volatile = false;
        }
        f.ret(x);

        run(&mut f, None);
        assert!(verify_function(&f).is_ok());

        // Just the label, the constant and the return remain.
        assert_eq!(f.len(), 4);
        let NodeData::Ret { value } = f.node(Reg::from_u32(3)).data else {
            panic!("expected ret last");
        };
        assert_eq!(f.node(value).data.as_int_const(), Some(5));

        // Running the pipeline again is a no-op.
        let before = f.to_string();
        run(&mut f, None);
        assert_eq!(before, f.to_string());
    }

    #[test]
    fn folding_scenario() {
        let mut f = Function::new(FuncId::from_u32(0), "fold", Prototype::new(vec![], I32));
        let a = f.uint(I32, 3);
        let b = f.uint(I32, 4);
        let sum = f.make_raw(
            NodeData::IntBinary {
                op: crate::ir::IntOp::Add,
                behavior: ArithBehavior::Wrap,
                a,
                b,
            },
            I32,
        );
        f.ret(sum);

        run(&mut f, None);
        assert!(verify_function(&f).is_ok());
        let printed = f.to_string();
        assert!(!printed.contains("add"), "{printed}");
        assert!(printed.contains("uconst.i32 7"), "{printed}");
    }
}
