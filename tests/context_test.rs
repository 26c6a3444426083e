//! Context lifecycle, fragment publication and the C boundary.

use std::ffi::CString;
use std::ptr;

use lirjit::capi::*;
use lirjit::{
    CodegenError, FinalizeError, JitConfig, JitContext, ReturnKind, ReturnKinds, Severity,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn quiet_context() -> JitContext {
    JitContext::with_config(JitConfig {
        echo_diagnostics: false,
        ..JitConfig::default()
    })
}

#[test]
fn test_conflicting_return_kinds_fail_finalize() {
    init_logger();

    let mut ctx = quiet_context();
    let mut fb = ctx.create_function_builder("mixed_returns", false);
    let i = fb.immi(1);
    let d = fb.immd(1.0);
    let c = fb.immi(0);
    let jmp = fb.cbr_true(c, None);
    fb.reti(i);
    let label = fb.add_label();
    fb.set_jmp_target(jmp, label);
    fb.retd(d);

    let err = fb.finalize().unwrap_err();
    let FinalizeError::ConflictingReturnKinds { name, kinds } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(name, "mixed_returns");
    assert!(kinds.contains(ReturnKind::Int) && kinds.contains(ReturnKind::Double));
    assert!(err.to_string().contains("multiple return types"));

    assert!(ctx.lookup("mixed_returns").is_none());
    assert_eq!(ctx.diagnostics().count(Severity::Warning), 1);
    assert_eq!(ctx.stats().fragments_failed, 1);
}

#[test]
fn test_missing_return_warns_and_publishes_void() {
    init_logger();

    let mut ctx = quiet_context();
    let fb = ctx.create_function_builder("nothing", false);
    assert!(fb.finalize().is_ok());

    let fragment = ctx.fragment("nothing").unwrap();
    assert_eq!(fragment.return_kind(), ReturnKind::Void);
    let warning = ctx.diagnostics().last().unwrap();
    assert_eq!(warning.severity, Severity::Warning);
    assert!(warning.to_string().starts_with("warning: no return type in fragment 'nothing'"));
}

#[test]
fn test_unresolved_branch_keeps_previous_fragment() {
    init_logger();

    let mut ctx = quiet_context();
    let mut fb = ctx.create_function_builder("f", false);
    let one = fb.immi(1);
    fb.reti(one);
    let old = fb.finalize().unwrap();

    let mut fb = ctx.create_function_builder("f", false);
    fb.br(None);
    let two = fb.immi(2);
    fb.reti(two);
    let err = fb.finalize().unwrap_err();
    assert!(matches!(err, FinalizeError::Codegen { .. }));

    assert_eq!(ctx.lookup("f"), Some(old));
    assert_eq!(ctx.stats().fragments_compiled, 1);
    assert_eq!(ctx.diagnostics().count(Severity::Error), 1);
}

#[test]
fn test_oversized_alloca_is_stack_full() {
    init_logger();

    let mut ctx = quiet_context();
    for (i, size) in [u32::MAX, 0x8000_0000, 2 * 1024 * 1024].into_iter().enumerate() {
        let name = format!("huge_{}", i);
        let mut fb = ctx.create_function_builder(&name, false);
        let block = fb.alloca(size);
        let one = fb.immi(1);
        fb.store_i(one, block, 0);
        fb.ret();

        let err = fb.finalize().unwrap_err();
        assert!(
            matches!(
                &err,
                FinalizeError::Codegen { source: CodegenError::StackFull { .. }, .. }
            ),
            "alloca({size}): {err}"
        );
        assert!(ctx.lookup(&name).is_none());
    }
    assert_eq!(ctx.stats().fragments_failed, 3);
    assert_eq!(ctx.stats().fragments_compiled, 0);
    assert_eq!(ctx.diagnostics().count(Severity::Error), 3);
}

#[test]
fn test_capi_oversized_alloca_returns_null() {
    init_logger();

    let name = CString::new("huge").unwrap();
    unsafe {
        let ctx = njx_create_context(0);
        let fb = njx_create_function_builder(ctx, name.as_ptr(), 0);
        let block = njx_alloca(fb, i32::MAX);
        let one = njx_immi(fb, 1);
        njx_store_i(fb, one, block, 0);
        njx_ret(fb);
        assert!(njx_finalize(fb).is_null());
        njx_destroy_function_builder(fb);
        assert!(njx_get_function_by_name(ctx, name.as_ptr()).is_null());
        njx_destroy_context(ctx);
    }
}

#[test]
fn test_take_diagnostics_drains_the_sink() {
    init_logger();

    let mut ctx = quiet_context();
    let fb = ctx.create_function_builder("silent", false);
    fb.finalize().unwrap();
    assert_eq!(ctx.diagnostics().count(Severity::Warning), 1);

    let taken = ctx.take_diagnostics();
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].severity, Severity::Warning);
    assert!(ctx.diagnostics().entries().is_empty());
}

#[test]
fn test_republishing_replaces_lookup() {
    init_logger();

    let mut ctx = quiet_context();
    let mut entries = Vec::new();
    for value in [1, 2] {
        let mut fb = ctx.create_function_builder("answer", false);
        let v = fb.immi(value);
        fb.reti(v);
        entries.push(fb.finalize().unwrap());
    }
    assert_ne!(entries[0], entries[1]);
    assert_eq!(ctx.lookup("answer"), Some(entries[1]));
    assert_eq!(ctx.fragments().len(), 1);
    assert_eq!(ctx.stats().fragments_replaced, 1);

    #[cfg(all(unix, target_arch = "x86_64"))]
    {
        let callable = ctx.fragment("answer").unwrap().callable;
        assert_eq!(unsafe { callable.call_int() }, Some(2));
        assert_eq!(unsafe { callable.call_double() }, None);
        // The replaced fragment's code stays valid while the context lives.
        let old: extern "C" fn() -> i32 = unsafe { entries[0].cast() };
        assert_eq!(old(), 1);
    }
}

#[test]
fn test_fragment_listing_and_stats() {
    init_logger();

    let mut ctx = JitContext::new(true);
    let mut fb = ctx.create_function_builder("listed", true);
    let p = fb.insert_parameter();
    let q = fb.addq(p, p);
    fb.retq(q);
    fb.finalize().unwrap();

    let listing = ctx.fragment_listing("listed").unwrap();
    assert!(listing.contains("start"));
    assert!(listing.contains("addq"));
    assert!(listing.contains("retq"));

    let stats = ctx.stats();
    assert_eq!(stats.fragments_compiled, 1);
    assert_eq!(stats.instructions_emitted, ctx.lir().len());
    assert!(stats.code_bytes > 0);
    assert_eq!(stats.largest_fragment_name, "listed");
    assert!(ctx.arena_bytes() > 0);
}

#[test]
fn test_return_kinds_display() {
    let mut kinds = ReturnKinds::default();
    assert_eq!(kinds.to_string(), "none");
    kinds.insert(ReturnKind::Double);
    kinds.insert(ReturnKind::Int);
    assert_eq!(kinds.to_string(), "int, double");
    assert_eq!(kinds.single(), None);
}

#[test]
fn test_capi_round_trip() {
    init_logger();

    let name = CString::new("add_one").unwrap();
    unsafe {
        let ctx = njx_create_context(0);
        let fb = njx_create_function_builder(ctx, name.as_ptr(), 1);
        let p = njx_insert_parameter(fb);
        let x = njx_q2i(fb, p);
        let one = njx_immi(fb, 1);
        let jmp = njx_br(fb, ptr::null_mut());
        let label = njx_add_label(fb);
        njx_set_jmp_target(fb, jmp, label);
        let sum = njx_addi(fb, x, one);
        assert!(njx_is_i(fb, sum));
        njx_reti(fb, sum);
        let entry = njx_finalize(fb);
        njx_destroy_function_builder(fb);

        assert!(!entry.is_null());
        assert_eq!(njx_get_function_by_name(ctx, name.as_ptr()), entry);

        #[cfg(all(unix, target_arch = "x86_64"))]
        {
            let add_one: extern "C" fn(i64) -> i32 = std::mem::transmute(entry);
            assert_eq!(add_one(41), 42);
        }

        let missing = CString::new("missing").unwrap();
        assert!(njx_get_function_by_name(ctx, missing.as_ptr()).is_null());
        njx_destroy_context(ctx);
    }
}

#[test]
fn test_capi_finalize_failure_returns_null() {
    init_logger();

    let name = CString::new("broken").unwrap();
    unsafe {
        let ctx = njx_create_context(0);
        let fb = njx_create_function_builder(ctx, name.as_ptr(), 0);
        let i = njx_immi(fb, 1);
        let d = njx_immd(fb, 2.0);
        njx_reti(fb, i);
        njx_retd(fb, d);
        assert!(njx_finalize(fb).is_null());
        // A second finalize has nothing left to compile.
        assert!(njx_finalize(fb).is_null());
        njx_destroy_function_builder(fb);
        assert!(njx_get_function_by_name(ctx, name.as_ptr()).is_null());
        njx_destroy_context(ctx);
    }
}

#[test]
fn test_capi_native_call() {
    init_logger();

    extern "C" fn triple(x: i64) -> i64 {
        x * 3
    }

    let name = CString::new("call_triple").unwrap();
    unsafe {
        let ctx = njx_create_context(0);
        let fb = njx_create_function_builder(ctx, name.as_ptr(), 0);
        let p = njx_insert_parameter(fb);
        let args = [p];
        let r = njx_call(fb, triple as *const std::ffi::c_void, NJX_QUAD_KIND, args.as_ptr(), 1);
        assert!(njx_is_q(fb, r));
        njx_retq(fb, r);
        let entry = njx_finalize(fb);
        njx_destroy_function_builder(fb);
        assert!(!entry.is_null());

        #[cfg(all(unix, target_arch = "x86_64"))]
        {
            let f: extern "C" fn(i64) -> i64 = std::mem::transmute(entry);
            assert_eq!(f(14), 42);
        }
        njx_destroy_context(ctx);
    }
}
