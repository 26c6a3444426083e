//! Execution tests: build fragments, compile them and call the generated code.

#![cfg(all(unix, target_arch = "x86_64"))]

use std::sync::atomic::{AtomicI32, Ordering};

use lirjit::{Callable, JitContext, ReturnKind, ValueKind};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_double_it() {
    init_logger();

    for optimize in [false, true] {
        let mut ctx = JitContext::new(false);
        let mut fb = ctx.create_function_builder("double_it", optimize);
        let x = fb.insert_parameter();
        let x = fb.q2i(x);
        let two = fb.immi(2);
        let result = fb.muli(x, two);
        fb.reti(result);
        let entry = fb.finalize().unwrap();

        let f: extern "C" fn(i64) -> i32 = unsafe { entry.cast() };
        assert_eq!(f(21), 42);
        assert_eq!(f(-4), -8);
        assert_eq!(ctx.lookup("double_it"), Some(entry));
        assert_eq!(ctx.fragment("double_it").unwrap().return_kind(), ReturnKind::Int);
    }
}

#[test]
fn test_double_it_by_self_addition() {
    init_logger();

    let mut ctx = JitContext::new(false);
    let mut fb = ctx.create_function_builder("double_it", true);
    let x = fb.parameter(ValueKind::I32);
    let result = fb.addi(x, x);
    fb.reti(result);
    fb.finalize().unwrap();

    let entry = ctx.lookup("double_it").unwrap();
    let f: extern "C" fn(i32) -> i32 = unsafe { entry.cast() };
    assert_eq!(f(21), 42);
}

#[test]
fn test_forward_branch_max() {
    init_logger();

    let mut ctx = JitContext::new(false);
    let mut fb = ctx.create_function_builder("max", false);
    let a = fb.insert_parameter();
    let b = fb.insert_parameter();
    let a_greater = fb.gtq(a, b);
    let jmp = fb.cbr_false(a_greater, None);
    fb.retq(a);
    let else_label = fb.add_label();
    fb.set_jmp_target(jmp, else_label);
    fb.retq(b);
    let entry = fb.finalize().unwrap();

    let max: extern "C" fn(i64, i64) -> i64 = unsafe { entry.cast() };
    assert_eq!(max(3, 9), 9);
    assert_eq!(max(9, 3), 9);
    assert_eq!(max(-5, -7), -5);
    assert_eq!(ctx.fragment("max").unwrap().return_kind(), ReturnKind::Quad);
}

#[test]
fn test_backward_branch_loop() {
    init_logger();

    for optimize in [false, true] {
        let mut ctx = JitContext::new(false);
        let mut fb = ctx.create_function_builder("sum_to", optimize);
        let n = fb.insert_parameter();
        let n = fb.q2i(n);
        let vars = fb.alloca(8);
        let zero = fb.immi(0);
        let one = fb.immi(1);
        fb.store_i(zero, vars, 0);
        fb.store_i(one, vars, 4);

        let test = fb.add_label();
        let i = fb.load_i(vars, 4);
        let done = fb.gti(i, n);
        let exit = fb.cbr_true(done, None);
        let sum = fb.load_i(vars, 0);
        let sum = fb.addi(sum, i);
        fb.store_i(sum, vars, 0);
        let next = fb.addi(i, one);
        fb.store_i(next, vars, 4);
        fb.br(Some(test));

        let out = fb.add_label();
        fb.set_jmp_target(exit, out);
        let sum = fb.load_i(vars, 0);
        fb.reti(sum);
        let entry = fb.finalize().unwrap();

        let sum_to: extern "C" fn(i64) -> i32 = unsafe { entry.cast() };
        assert_eq!(sum_to(0), 0);
        assert_eq!(sum_to(10), 55);
        assert_eq!(sum_to(100), 5050);
    }
}

#[test]
fn test_alloca_sized_memory() {
    init_logger();

    let mut ctx = JitContext::new(false);
    let mut fb = ctx.create_function_builder("bytes", false);
    let buf = fb.alloca(16);
    let q = fb.immq(0x1122_3344_5566_7788);
    fb.store_q(q, buf, 8);

    let ff = fb.immi(0xFF);
    fb.store_i2c(ff, buf, 0);
    let signed = fb.load_c2i(buf, 0);
    let unsigned = fb.load_uc2ui(buf, 0);
    // -1 + 255
    let bytes = fb.addi(signed, unsigned);

    let half = fb.immi(0x8001);
    fb.store_i2s(half, buf, 2);
    let s = fb.load_s2i(buf, 2);
    let us = fb.load_us2ui(buf, 2);
    // -32767 + 32769
    let halves = fb.addi(s, us);

    let low = fb.load_i(buf, 8);
    let expected_low = fb.immi(0x5566_7788);
    let low_ok = fb.eqi(low, expected_low);
    let whole = fb.load_q(buf, 8);
    let thirty_two = fb.immi(32);
    let high = fb.rshuq(whole, thirty_two);
    let high = fb.q2i(high);
    let expected_high = fb.immi(0x1122_3344);
    let high_ok = fb.eqi(high, expected_high);

    let total = fb.addi(bytes, halves);
    let total = fb.addi(total, low_ok);
    let total = fb.addi(total, high_ok);
    fb.reti(total);
    let entry = fb.finalize().unwrap();

    let f: extern "C" fn() -> i32 = unsafe { entry.cast() };
    assert_eq!(f(), 254 + 2 + 1 + 1);
}

#[test]
fn test_pointer_parameter_and_void_return() {
    init_logger();

    let mut ctx = JitContext::new(false);
    let mut fb = ctx.create_function_builder("scale_all", false);
    let ptr = fb.insert_parameter();
    let factor = fb.parameter(ValueKind::F64);
    for offset in [0, 8, 16] {
        let v = fb.load_d(ptr, offset);
        let v = fb.muld(v, factor);
        fb.store_d(v, ptr, offset);
    }
    fb.ret();
    let entry = fb.finalize().unwrap();

    assert!(matches!(
        ctx.fragment("scale_all").unwrap().callable,
        Callable::Void(_)
    ));
    let scale_all: extern "C" fn(*mut f64, f64) = unsafe { entry.cast() };
    let mut values = [1.0f64, -2.5, 4.0];
    scale_all(values.as_mut_ptr(), 2.0);
    assert_eq!(values, [2.0, -5.0, 8.0]);
}

#[test]
fn test_float_and_double_arithmetic() {
    init_logger();

    let mut ctx = JitContext::new(false);
    let mut fb = ctx.create_function_builder("mixed", false);
    let x = fb.parameter(ValueKind::F32);
    let n = fb.parameter(ValueKind::I32);
    let half = fb.immf(0.5);
    let xf = fb.addf(x, half);
    let xd = fb.f2d(xf);
    let nd = fb.i2d(n);
    let sum = fb.addd(xd, nd);
    let three = fb.immd(3.0);
    let result = fb.divd(sum, three);
    fb.retd(result);
    let entry = fb.finalize().unwrap();

    let mixed: extern "C" fn(f32, i32) -> f64 = unsafe { entry.cast() };
    assert_eq!(mixed(1.5, 7), 3.0);
    assert_eq!(mixed(-0.5, -3), -1.0);
    assert_eq!(ctx.fragment("mixed").unwrap().return_kind(), ReturnKind::Double);
}

#[test]
fn test_double_comparisons_with_nan() {
    init_logger();

    let mut ctx = JitContext::new(false);
    let mut fb = ctx.create_function_builder("compare_bits", false);
    let a = fb.parameter(ValueKind::F64);
    let b = fb.parameter(ValueKind::F64);
    let mut result = fb.immi(0);
    let cmps = [
        fb.eqd(a, b),
        fb.ltd(a, b),
        fb.gtd(a, b),
        fb.led(a, b),
        fb.ged(a, b),
    ];
    for (bit, cmp) in cmps.into_iter().enumerate() {
        let shift = fb.immi(bit as i32);
        let shifted = fb.lshi(cmp, shift);
        result = fb.ori(result, shifted);
    }
    fb.reti(result);
    let entry = fb.finalize().unwrap();

    let bits: extern "C" fn(f64, f64) -> i32 = unsafe { entry.cast() };
    // eq | le | ge
    assert_eq!(bits(1.0, 1.0), 0b11001);
    // lt | le
    assert_eq!(bits(1.0, 2.0), 0b01010);
    // gt | ge
    assert_eq!(bits(2.0, 1.0), 0b10100);
    assert_eq!(bits(f64::NAN, 1.0), 0);
    assert_eq!(bits(1.0, f64::NAN), 0);
}

#[test]
fn test_conversions() {
    init_logger();

    let mut ctx = JitContext::new(false);
    let mut fb = ctx.create_function_builder("widen", false);
    let x = fb.parameter(ValueKind::I32);
    let signed = fb.i2q(x);
    let unsigned = fb.ui2uq(x);
    let diff = fb.subq(unsigned, signed);
    fb.retq(diff);
    let widen: extern "C" fn(i32) -> i64 = unsafe { fb.finalize().unwrap().cast() };
    assert_eq!(widen(5), 0);
    assert_eq!(widen(-1), 1i64 << 32);

    let mut fb = ctx.create_function_builder("truncate", false);
    let d = fb.parameter(ValueKind::F64);
    let i = fb.d2i(d);
    fb.reti(i);
    let truncate: extern "C" fn(f64) -> i32 = unsafe { fb.finalize().unwrap().cast() };
    assert_eq!(truncate(2.9), 2);
    assert_eq!(truncate(-2.9), -2);
    assert_eq!(truncate(f64::NAN), i32::MIN);

    let mut fb = ctx.create_function_builder("round_trip", false);
    let d = fb.parameter(ValueKind::F64);
    let f = fb.d2f(d);
    let d = fb.f2d(f);
    fb.retd(d);
    let round_trip: extern "C" fn(f64) -> f64 = unsafe { fb.finalize().unwrap().cast() };
    assert_eq!(round_trip(0.1), 0.1f32 as f64);
}

#[test]
fn test_shifts_and_select() {
    init_logger();

    let mut ctx = JitContext::new(false);
    let mut fb = ctx.create_function_builder("shifts", false);
    let x = fb.parameter(ValueKind::I32);
    let count = fb.parameter(ValueKind::I32);
    let use_logical = fb.parameter(ValueKind::I32);
    let arithmetic = fb.rshi(x, count);
    let logical = fb.rshui(x, count);
    let picked = fb.cmovi(use_logical, logical, arithmetic);
    fb.reti(picked);
    let shifts: extern "C" fn(i32, i32, i32) -> i32 = unsafe { fb.finalize().unwrap().cast() };
    assert_eq!(shifts(-16, 2, 0), -4);
    assert_eq!(shifts(-16, 2, 1), (-16i32 as u32 >> 2) as i32);
    // counts are masked to the operand width
    assert_eq!(shifts(64, 33, 0), 32);

    let mut fb = ctx.create_function_builder("select_q", false);
    let cond = fb.parameter(ValueKind::I32);
    let big = fb.immq(1 << 40);
    let small = fb.immq(-7);
    let one = fb.immi(1);
    let wide = fb.lshq(big, one);
    let picked = fb.cmovq(cond, wide, small);
    fb.retq(picked);
    let select_q: extern "C" fn(i32) -> i64 = unsafe { fb.finalize().unwrap().cast() };
    assert_eq!(select_q(1), 1 << 41);
    assert_eq!(select_q(0), -7);
}

extern "C" fn add3(a: i64, b: i64, c: i64) -> i64 {
    a + b + c
}

extern "C" fn weighted(x: f64, weight: i32) -> f64 {
    x * weight as f64
}

static CALLS: AtomicI32 = AtomicI32::new(0);

extern "C" fn bump() {
    CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_native_calls() {
    init_logger();

    let mut ctx = JitContext::new(false);
    let mut fb = ctx.create_function_builder("calls", false);
    let a = fb.insert_parameter();
    let one = fb.immq(1);
    let two = fb.immq(2);
    fb.call(bump as *const u8, None, &[]);
    let sum = fb.call(add3 as *const u8, Some(ValueKind::I64), &[a, one, two]);
    let sum_i = fb.q2i(sum);
    let half = fb.immd(0.5);
    let w = fb.call(weighted as *const u8, Some(ValueKind::F64), &[half, sum_i]);
    let w = fb.d2i(w);
    fb.reti(w);
    let entry = fb.finalize().unwrap();

    let calls: extern "C" fn(i64) -> i32 = unsafe { entry.cast() };
    assert_eq!(calls(7), 5);
    assert_eq!(calls(97), 50);
    assert_eq!(CALLS.load(Ordering::SeqCst), 2);
}

#[test]
fn test_guards_leave_the_fragment() {
    init_logger();

    let mut ctx = JitContext::new(false);
    let mut fb = ctx.create_function_builder("guarded", false);
    let x = fb.parameter(ValueKind::I32);
    let zero = fb.immi(0);
    let is_zero = fb.eqi(x, zero);
    fb.guard_true(is_zero);
    let hundred = fb.immi(100);
    let is_small = fb.lti(x, hundred);
    fb.guard_false(is_small);
    fb.reti(x);
    let guarded: extern "C" fn(i32) -> i32 = unsafe { fb.finalize().unwrap().cast() };

    assert_eq!(guarded(0), 0);
    assert_eq!(guarded(5), 5);
    assert_eq!(guarded(500), 0);
}

#[test]
fn test_large_quad_constant() {
    init_logger();

    let mut ctx = JitContext::new(true);
    let mut fb = ctx.create_function_builder("constant", true);
    let q = fb.immq(0x0123_4567_89AB_CDEF);
    fb.retq(q);
    let constant: extern "C" fn() -> i64 = unsafe { fb.finalize().unwrap().cast() };
    assert_eq!(constant(), 0x0123_4567_89AB_CDEF);
    assert!(!ctx.fragment("constant").unwrap().trace.is_empty());
}
