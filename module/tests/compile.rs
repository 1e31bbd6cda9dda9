//! Module-level compilation scenarios: the optimisation pipeline observed
//! through the module API, and object emission smoke tests.

use keel_codegen::ir::node::ArithBehavior;
use keel_codegen::ir::types::I32;
use keel_codegen::isa::FeatureSet;
use keel_codegen::OptLevel;
use keel_module::{Module, Storage};
use std::str::FromStr;
use target_lexicon::Triple;

fn linux_module() -> Module {
    let _ = env_logger::try_init();
    let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
    Module::new(&triple, FeatureSet::default()).unwrap()
}

fn windows_module() -> Module {
    let _ = env_logger::try_init();
    let triple = Triple::from_str("x86_64-pc-windows-msvc").unwrap();
    Module::new(&triple, FeatureSet::default()).unwrap()
}

#[test]
fn constant_folding_reaches_the_return() {
    let mut m = linux_module();
    let id = m.declare_function("seven", keel_codegen::ir::Prototype::new(vec![], I32));
    {
        let f = m.func_mut(id);
        let a = f.uint(I32, 3);
        let b = f.uint(I32, 4);
        let sum = f.add(a, b, ArithBehavior::Wrap);
        f.ret(sum);
    }
    m.compile(OptLevel::Speed, 1).unwrap();

    let printed = m.func(id).to_string();
    assert!(printed.contains("uconst.i32 7"), "{printed}");
    assert!(!printed.contains("add"), "{printed}");
}

#[test]
fn store_load_chain_collapses() {
    let mut m = linux_module();
    let id = m.declare_function("chain", keel_codegen::ir::Prototype::new(vec![], I32));
    {
        let f = m.func_mut(id);
        let slot = f.local(4, 4);
        let five = f.uint(I32, 5);
        f.store(I32, slot, five, 4);
        let loaded = f.load(I32, slot, 4);
        f.ret(loaded);
    }
    m.compile(OptLevel::Speed, 1).unwrap();

    let printed = m.func(id).to_string();
    assert!(!printed.contains("load"), "{printed}");
    assert!(!printed.contains("local"), "{printed}");
    assert!(printed.contains("ret.i32"), "{printed}");
}

#[test]
fn optimisation_is_idempotent() {
    let mut m = linux_module();
    let id = m.declare_function(
        "mix",
        keel_codegen::ir::Prototype::new(vec![I32, I32], I32),
    );
    {
        let f = m.func_mut(id);
        let (a, b) = (f.param(0), f.param(1));
        let slot = f.local(4, 4);
        let sum = f.add(a, b, ArithBehavior::Wrap);
        f.store(I32, slot, sum, 4);
        let back = f.load(I32, slot, 4);
        let four = f.uint(I32, 4);
        let scaled = f.mul(back, four, ArithBehavior::Wrap);
        f.ret(scaled);
    }

    // The pipeline must be a fixed point of itself: running it again over
    // its own output changes nothing.
    let snapshot = vec![m.func(id).clone()];
    let mut once = m.func(id).clone();
    keel_codegen::opt::run(&mut once, Some(snapshot.as_slice()));
    let first = once.to_string();
    keel_codegen::opt::run(&mut once, Some(snapshot.as_slice()));
    assert_eq!(first, once.to_string());
}

#[test]
fn small_callees_disappear_into_callers() {
    let mut m = linux_module();
    let callee = m.declare_function("twice", keel_codegen::ir::Prototype::new(vec![I32], I32));
    {
        let f = m.func_mut(callee);
        let x = f.param(0);
        let two = f.uint(I32, 2);
        let d = f.mul(x, two, ArithBehavior::Wrap);
        f.ret(d);
    }
    let caller = m.declare_function("outer", keel_codegen::ir::Prototype::new(vec![I32], I32));
    {
        let f = m.func_mut(caller);
        let p = f.param(0);
        let c = f.call(I32, callee, &[p]);
        f.ret(c);
    }
    m.compile(OptLevel::Speed, 1).unwrap();

    let printed = m.func(caller).to_string();
    assert!(!printed.contains("call"), "{printed}");
}

#[test]
fn verifier_failures_abort_compilation() {
    let mut m = linux_module();
    let id = m.declare_function("open_block", keel_codegen::ir::Prototype::new(vec![], I32));
    {
        let f = m.func_mut(id);
        // A function left without a terminator is structurally invalid.
        let _ = f.uint(I32, 1);
    }
    let err = m.compile(OptLevel::None, 1).unwrap_err();
    assert!(matches!(err, keel_module::ModuleError::Verification { .. }), "{err}");
}

#[test]
fn parallel_and_serial_compiles_agree() {
    let build = |m: &mut Module| {
        for i in 0..16u32 {
            let id = m.declare_function(
                format!("f{i}"),
                keel_codegen::ir::Prototype::new(vec![I32, I32], I32),
            );
            let f = m.func_mut(id);
            let (a, b) = (f.param(0), f.param(1));
            let k = f.uint(I32, u64::from(i));
            let s = f.add(a, b, ArithBehavior::Wrap);
            let t = f.add(s, k, ArithBehavior::Wrap);
            f.ret(t);
        }
    };

    let mut serial = linux_module();
    build(&mut serial);
    serial.compile(OptLevel::Speed, 1).unwrap();

    let mut parallel = linux_module();
    build(&mut parallel);
    parallel.compile(OptLevel::Speed, 4).unwrap();

    for i in 0..16u32 {
        let id = keel_codegen::ir::FuncId::from_u32(i);
        let a = serial.compiled(id).unwrap();
        let b = parallel.compiled(id).unwrap();
        assert_eq!(a.code, b.code, "f{i} diverged between drivers");
        assert_eq!(a.stack_usage, b.stack_usage);
    }
}

#[test]
fn elf_object_smoke() {
    let mut m = linux_module();
    let id = m.declare_function("answer", keel_codegen::ir::Prototype::new(vec![], I32));
    {
        let f = m.func_mut(id);
        let v = f.uint(I32, 42);
        f.ret(v);
    }
    let g = m.declare_global("counter", 8, 8, Storage::Data);
    m.define_global(g, vec![0; 8]);

    m.compile(OptLevel::Speed, 1).unwrap();
    let mut bytes = Vec::new();
    m.write_object(&mut bytes).unwrap();
    assert_eq!(&bytes[..4], b"\x7fELF");
}

#[test]
fn coff_object_smoke() {
    let mut m = windows_module();
    let ext = m.declare_external("puts");
    let id = m.declare_function("hello", keel_codegen::ir::Prototype::new(vec![], I32));
    {
        let f = m.func_mut(id);
        let s = f.cstring("hi");
        let r = f.ecall(I32, ext, &[s]);
        f.ret(r);
    }
    m.compile(OptLevel::None, 1).unwrap();
    let mut bytes = Vec::new();
    m.write_object(&mut bytes).unwrap();
    // x86-64 COFF machine magic.
    assert_eq!(&bytes[..2], &[0x64, 0x86]);
}
