//! End-to-end execution: compile, finalise into executable pages, call.
//!
//! These run the generated code on the host, so they are gated to x86-64
//! Linux where the System V convention matches what we emit.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use keel_codegen::ir::node::ArithBehavior;
use keel_codegen::ir::types::{F32, I32, I64, PTR};
use keel_codegen::ir::{FuncId, Prototype};
use keel_codegen::isa::FeatureSet;
use keel_codegen::OptLevel;
use keel_module::{JitModule, Module, Storage};
use std::str::FromStr;
use target_lexicon::Triple;

fn module() -> Module {
    let _ = env_logger::try_init();
    let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
    Module::new(&triple, FeatureSet::default()).unwrap()
}

fn finalize(m: &mut Module, opt: OptLevel) -> JitModule {
    m.compile(opt, 1).unwrap();
    m.finalize_jit(|_| None).unwrap()
}

unsafe fn as_fn2(jit: &JitModule, id: FuncId) -> extern "C" fn(i32, i32) -> i32 {
    unsafe { std::mem::transmute(jit.code_ptr(id)) }
}

#[test]
fn add_two_numbers() {
    for opt in [OptLevel::None, OptLevel::Speed] {
        let mut m = module();
        let id = m.declare_function("add", Prototype::new(vec![I32, I32], I32));
        {
            let f = m.func_mut(id);
            let (a, b) = (f.param(0), f.param(1));
            let sum = f.add(a, b, ArithBehavior::Wrap);
            f.ret(sum);
        }
        let jit = finalize(&mut m, opt);
        let add = unsafe { as_fn2(&jit, id) };
        assert_eq!(add(3, 4), 7);
        assert_eq!(add(-3, 4), 1);
        assert_eq!(add(i32::MAX, 1), i32::MIN);
    }
}

#[test]
fn branches_pick_the_larger_value() {
    for opt in [OptLevel::None, OptLevel::Speed] {
        let mut m = module();
        let id = m.declare_function("max", Prototype::new(vec![I32, I32], I32));
        {
            let f = m.func_mut(id);
            let (a, b) = (f.param(0), f.param(1));
            let then_l = f.new_label_id();
            let else_l = f.new_label_id();
            let c = f.icmp_gt(a, b, true);
            f.br_if(c, then_l, else_l);
            f.begin_label(then_l);
            f.ret(a);
            f.begin_label(else_l);
            f.ret(b);
        }
        let jit = finalize(&mut m, opt);
        let max = unsafe { as_fn2(&jit, id) };
        assert_eq!(max(3, 9), 9);
        assert_eq!(max(9, 3), 9);
        assert_eq!(max(-5, -9), -5);
        assert_eq!(max(7, 7), 7);
    }
}

#[test]
fn loop_sums_through_a_stack_slot() {
    for opt in [OptLevel::None, OptLevel::Speed] {
        let mut m = module();
        let id = m.declare_function("sum_to", Prototype::new(vec![I32], I32));
        {
            let f = m.func_mut(id);
            let n = f.param(0);
            let i_slot = f.local(4, 4);
            let acc_slot = f.local(4, 4);
            let head = f.new_label_id();
            let body = f.new_label_id();
            let exit = f.new_label_id();

            let zero = f.uint(I32, 0);
            f.store(I32, i_slot, zero, 4);
            f.store(I32, acc_slot, zero, 4);
            f.goto(head);

            f.begin_label(head);
            let i = f.load(I32, i_slot, 4);
            let c = f.icmp_lt(i, n, true);
            f.br_if(c, body, exit);

            f.begin_label(body);
            let i2 = f.load(I32, i_slot, 4);
            let acc = f.load(I32, acc_slot, 4);
            let acc2 = f.add(acc, i2, ArithBehavior::Wrap);
            f.store(I32, acc_slot, acc2, 4);
            let one = f.uint(I32, 1);
            let i3 = f.add(i2, one, ArithBehavior::Wrap);
            f.store(I32, i_slot, i3, 4);
            f.goto(head);

            f.begin_label(exit);
            let out = f.load(I32, acc_slot, 4);
            f.ret(out);
        }
        let jit = finalize(&mut m, opt);
        let sum_to: extern "C" fn(i32) -> i32 =
            unsafe { std::mem::transmute(jit.code_ptr(id)) };
        assert_eq!(sum_to(0), 0);
        assert_eq!(sum_to(1), 0);
        assert_eq!(sum_to(5), 10);
        assert_eq!(sum_to(100), 4950);
    }
}

#[test]
fn division_and_remainder() {
    let mut m = module();
    let d = m.declare_function("quot", Prototype::new(vec![I32, I32], I32));
    {
        let f = m.func_mut(d);
        let (a, b) = (f.param(0), f.param(1));
        let q = f.div(a, b, true);
        f.ret(q);
    }
    let r = m.declare_function("rem", Prototype::new(vec![I32, I32], I32));
    {
        let f = m.func_mut(r);
        let (a, b) = (f.param(0), f.param(1));
        let q = f.rem(a, b, true);
        f.ret(q);
    }
    let jit = finalize(&mut m, OptLevel::None);
    let quot = unsafe { as_fn2(&jit, d) };
    let rem = unsafe { as_fn2(&jit, r) };
    assert_eq!(quot(42, 5), 8);
    assert_eq!(quot(-42, 5), -8);
    assert_eq!(rem(42, 5), 2);
    assert_eq!(rem(-42, 5), -2);
}

#[test]
fn shifts_and_masks() {
    let mut m = module();
    let id = m.declare_function("shmix", Prototype::new(vec![I32, I32], I32));
    {
        let f = m.func_mut(id);
        let (a, b) = (f.param(0), f.param(1));
        let l = f.shl(a, b, ArithBehavior::Wrap);
        let four = f.uint(I32, 4);
        let r = f.shr(a, four);
        let x = f.xor(l, r);
        f.ret(x);
    }
    let jit = finalize(&mut m, OptLevel::None);
    let shmix = unsafe { as_fn2(&jit, id) };
    let reference = |a: i32, b: i32| ((a as u32) << b ^ (a as u32) >> 4) as i32;
    assert_eq!(shmix(0x1234, 3), reference(0x1234, 3));
    assert_eq!(shmix(-77, 7), reference(-77, 7));
}

#[test]
fn calls_between_module_functions() {
    let mut m = module();
    let callee = m.declare_function("square", Prototype::new(vec![I32], I32));
    {
        let f = m.func_mut(callee);
        let x = f.param(0);
        let sq = f.mul(x, x, ArithBehavior::Wrap);
        f.ret(sq);
    }
    let caller = m.declare_function("sum_sq", Prototype::new(vec![I32, I32], I32));
    {
        let f = m.func_mut(caller);
        let (a, b) = (f.param(0), f.param(1));
        let qa = f.call(I32, callee, &[a]);
        let qb = f.call(I32, callee, &[b]);
        let sum = f.add(qa, qb, ArithBehavior::Wrap);
        f.ret(sum);
    }
    // No inlining at OptLevel::None, so the call path is exercised for
    // real.
    let jit = finalize(&mut m, OptLevel::None);
    let sum_sq = unsafe { as_fn2(&jit, caller) };
    assert_eq!(sum_sq(3, 4), 25);
    assert_eq!(sum_sq(0, -7), 49);
}

#[test]
fn float_arithmetic() {
    let mut m = module();
    let id = m.declare_function("lerp", Prototype::new(vec![F32, F32], F32));
    {
        let f = m.func_mut(id);
        let (a, b) = (f.param(0), f.param(1));
        let half = f.fconst(F32, 0.5);
        let d = f.fsub(b, a);
        let scaled = f.fmul(d, half);
        let out = f.fadd(a, scaled);
        f.ret(out);
    }
    let jit = finalize(&mut m, OptLevel::None);
    let lerp: extern "C" fn(f32, f32) -> f32 =
        unsafe { std::mem::transmute(jit.code_ptr(id)) };
    assert_eq!(lerp(0.0, 10.0), 5.0);
    assert_eq!(lerp(2.0, 4.0), 3.0);
}

#[test]
fn globals_are_shared_state() {
    let mut m = module();
    let g = m.declare_global("cell", 8, 8, Storage::Data);
    m.define_global(g, 123i64.to_le_bytes().to_vec());

    let read = m.declare_function("read_cell", Prototype::new(vec![], I64));
    {
        let f = m.func_mut(read);
        let addr = f.global_addr(g);
        let v = f.load(I64, addr, 8);
        f.ret(v);
    }
    let write = m.declare_function("write_cell", Prototype::new(vec![I64], I64));
    {
        let f = m.func_mut(write);
        let x = f.param(0);
        let addr = f.global_addr(g);
        f.store(I64, addr, x, 8);
        f.ret(x);
    }

    let jit = finalize(&mut m, OptLevel::None);
    let read_cell: extern "C" fn() -> i64 = unsafe { std::mem::transmute(jit.code_ptr(read)) };
    let write_cell: extern "C" fn(i64) -> i64 =
        unsafe { std::mem::transmute(jit.code_ptr(write)) };
    assert_eq!(read_cell(), 123);
    write_cell(-9);
    assert_eq!(read_cell(), -9);
}

#[test]
fn memory_through_pointers() {
    let mut m = module();
    let id = m.declare_function("swap_add", Prototype::new(vec![PTR, PTR], I32));
    {
        let f = m.func_mut(id);
        let (p, q) = (f.param(0), f.param(1));
        let a = f.load(I32, p, 4);
        let b = f.load(I32, q, 4);
        f.store(I32, p, b, 4);
        f.store(I32, q, a, 4);
        let sum = f.add(a, b, ArithBehavior::Wrap);
        f.ret(sum);
    }
    let jit = finalize(&mut m, OptLevel::None);
    let swap_add: extern "C" fn(*mut i32, *mut i32) -> i32 =
        unsafe { std::mem::transmute(jit.code_ptr(id)) };
    let (mut x, mut y) = (3i32, 9i32);
    assert_eq!(swap_add(&mut x, &mut y), 12);
    assert_eq!((x, y), (9, 3));
}

#[test]
fn switch_dispatches_on_keys() {
    use keel_codegen::ir::SwitchEntry;
    let mut m = module();
    let id = m.declare_function("day_len", Prototype::new(vec![I32], I32));
    {
        let f = m.func_mut(id);
        let key = f.param(0);
        let short = f.new_label_id();
        let long = f.new_label_id();
        let fallback = f.new_label_id();
        let entries = [
            SwitchEntry { key: 1, dest: short },
            SwitchEntry { key: 2, dest: long },
            SwitchEntry { key: 3, dest: long },
        ];
        f.switch(I32, key, fallback, &entries);

        f.begin_label(short);
        let a = f.uint(I32, 10);
        f.ret(a);
        f.begin_label(long);
        let b = f.uint(I32, 20);
        f.ret(b);
        f.begin_label(fallback);
        let c = f.uint(I32, 0);
        f.ret(c);
    }
    let jit = finalize(&mut m, OptLevel::None);
    let day_len: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(jit.code_ptr(id)) };
    assert_eq!(day_len(1), 10);
    assert_eq!(day_len(2), 20);
    assert_eq!(day_len(3), 20);
    assert_eq!(day_len(9), 0);
}

#[test]
fn memcpy_moves_bytes() {
    let mut m = module();
    let id = m.declare_function("copy16", Prototype::new(vec![PTR, PTR], I32));
    {
        let f = m.func_mut(id);
        let (dst, src) = (f.param(0), f.param(1));
        let len = f.uint(I64, 16);
        f.memcpy(dst, src, len, 1);
        let zero = f.uint(I32, 0);
        f.ret(zero);
    }
    let jit = finalize(&mut m, OptLevel::None);
    let copy16: extern "C" fn(*mut u8, *const u8) -> i32 =
        unsafe { std::mem::transmute(jit.code_ptr(id)) };
    let src: [u8; 16] = *b"a quick brown fx";
    let mut dst = [0u8; 16];
    copy16(dst.as_mut_ptr(), src.as_ptr());
    assert_eq!(dst, src);
}

#[test]
fn widths_extend_and_truncate() {
    use keel_codegen::ir::types::I8;
    let mut m = module();
    let id = m.declare_function("low_byte_signed", Prototype::new(vec![I32], I32));
    {
        let f = m.func_mut(id);
        let x = f.param(0);
        let narrow = f.trunc(x, I8);
        let wide = f.sext(narrow, I32);
        f.ret(wide);
    }
    let jit = finalize(&mut m, OptLevel::None);
    let low_byte: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(jit.code_ptr(id)) };
    assert_eq!(low_byte(0x17F), 0x7F);
    assert_eq!(low_byte(0x180), -128);
    assert_eq!(low_byte(-1), -1);
}

#[test]
fn select_picks_without_branching() {
    let mut m = module();
    let id = m.declare_function("clamp0", Prototype::new(vec![I32], I32));
    {
        let f = m.func_mut(id);
        let x = f.param(0);
        let zero = f.uint(I32, 0);
        let c = f.icmp_lt(x, zero, true);
        let out = f.select(c, zero, x);
        f.ret(out);
    }
    let jit = finalize(&mut m, OptLevel::None);
    let clamp0: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(jit.code_ptr(id)) };
    assert_eq!(clamp0(5), 5);
    assert_eq!(clamp0(-5), 0);
    assert_eq!(clamp0(0), 0);
}
