// This module exposes lirjit to C and other languages through opaque handles. A context
// handle is a boxed JitContext; a builder handle is a boxed slot holding a FunctionBuilder
// whose borrow of its context has been erased to 'static, so the caller must destroy every
// builder before destroying the context that created it. Instruction handles are buffer
// indices plus one, which keeps null free to mean "no instruction" (an unpatched branch
// target). Emission functions forward one-to-one to FunctionBuilder; misuse such as a null
// builder, a null operand or emitting into a finalized builder is a programming error and
// panics, which aborts the process at this boundary. njx_finalize compiles and publishes
// the fragment and returns its entry point, or null when finalize reported an error (the
// diagnostic has already been written). The builder handle still has to be destroyed after
// finalize.

//! `extern "C"` boundary (`njx_*`).
//!
//! # Safety
//!
//! Every function takes raw handles produced by this module. Passing a
//! handle that was not created here, or one that has already been
//! destroyed, is undefined behavior.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr;

use crate::builder::FunctionBuilder;
use crate::core::JitContext;
use crate::lir::{LInsRef, ValueKind};

/// Opaque context handle.
pub struct NjxContext {
    ctx: JitContext,
}

/// Opaque builder handle.
pub struct NjxFunctionBuilder {
    builder: Option<FunctionBuilder<'static>>,
}

/// Opaque instruction handle type.
#[repr(C)]
pub struct NjxLIns {
    _private: [u8; 0],
}

pub type NjxContextRef = *mut NjxContext;
pub type NjxFunctionBuilderRef = *mut NjxFunctionBuilder;
pub type NjxLInsRef = *mut NjxLIns;

/// Value kind codes used by `njx_parameter` and `njx_call`.
pub const NJX_VOID_KIND: c_int = 0;
pub const NJX_INT_KIND: c_int = 1;
pub const NJX_QUAD_KIND: c_int = 2;
pub const NJX_PTR_KIND: c_int = 2;
pub const NJX_DOUBLE_KIND: c_int = 3;
pub const NJX_FLOAT_KIND: c_int = 4;

fn kind_from_code(code: c_int) -> Option<ValueKind> {
    match code {
        NJX_INT_KIND => Some(ValueKind::I32),
        NJX_QUAD_KIND => Some(ValueKind::I64),
        NJX_DOUBLE_KIND => Some(ValueKind::F64),
        NJX_FLOAT_KIND => Some(ValueKind::F32),
        _ => None,
    }
}

fn handle(r: LInsRef) -> NjxLInsRef {
    (r.index() + 1) as NjxLInsRef
}

fn optional(h: NjxLInsRef) -> Option<LInsRef> {
    if h.is_null() {
        None
    } else {
        Some(LInsRef::from_index(h as usize - 1))
    }
}

fn required(h: NjxLInsRef) -> LInsRef {
    match optional(h) {
        Some(r) => r,
        None => panic!("null instruction handle passed where an operand is required"),
    }
}

unsafe fn builder_mut<'a>(fb: NjxFunctionBuilderRef) -> &'a mut FunctionBuilder<'static> {
    let Some(slot) = fb.as_mut() else {
        panic!("null function builder handle");
    };
    match slot.builder.as_mut() {
        Some(builder) => builder,
        None => panic!("function builder has already been finalized"),
    }
}

unsafe fn string_arg(s: *const c_char) -> Option<String> {
    if s.is_null() {
        None
    } else {
        Some(CStr::from_ptr(s).to_string_lossy().into_owned())
    }
}

// ==== CONTEXT ====

/// Create a JIT context. Non-zero `verbose` enables tracing and listings.
#[no_mangle]
pub extern "C" fn njx_create_context(verbose: c_int) -> NjxContextRef {
    Box::into_raw(Box::new(NjxContext { ctx: JitContext::new(verbose != 0) }))
}

/// Destroy a context and all code compiled in it.
///
/// # Safety
///
/// All builders created from `ctx` must have been destroyed.
#[no_mangle]
pub unsafe extern "C" fn njx_destroy_context(ctx: NjxContextRef) {
    if !ctx.is_null() {
        drop(Box::from_raw(ctx));
    }
}

/// Entry point of the fragment published as `name`, or null.
///
/// # Safety
///
/// `ctx` must be null or a live context; `name` must be null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn njx_get_function_by_name(ctx: NjxContextRef, name: *const c_char) -> *mut c_void {
    let (Some(ctx), Some(name)) = (ctx.as_ref(), string_arg(name)) else {
        return ptr::null_mut();
    };
    ctx.ctx
        .lookup(&name)
        .map_or(ptr::null_mut(), |entry| entry.as_ptr() as *mut c_void)
}

// ==== BUILDER ====

/// Start building a fragment called `name` in `ctx`. Non-zero `optimize`
/// enables CSE and expression simplification.
///
/// # Safety
///
/// `ctx` must be a live context with no other live builder, and it must
/// outlive the returned builder. `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn njx_create_function_builder(
    ctx: NjxContextRef,
    name: *const c_char,
    optimize: c_int,
) -> NjxFunctionBuilderRef {
    let Some(ctx) = ctx.as_mut() else {
        return ptr::null_mut();
    };
    let name = string_arg(name).unwrap_or_default();
    // The caller keeps the context alive for as long as the builder.
    let ctx: &'static mut JitContext = &mut *(&mut ctx.ctx as *mut JitContext);
    let builder = ctx.create_function_builder(&name, optimize != 0);
    Box::into_raw(Box::new(NjxFunctionBuilder { builder: Some(builder) }))
}

/// Destroy a builder, finalized or not.
///
/// # Safety
///
/// `fb` must be null or a builder handle that has not been destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn njx_destroy_function_builder(fb: NjxFunctionBuilderRef) {
    if !fb.is_null() {
        drop(Box::from_raw(fb));
    }
}

/// Compile and publish the fragment. Returns its entry point, or null on error.
///
/// # Safety
///
/// `fb` must be a live builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_finalize(fb: NjxFunctionBuilderRef) -> *mut c_void {
    let Some(slot) = fb.as_mut() else {
        return ptr::null_mut();
    };
    let Some(builder) = slot.builder.take() else {
        return ptr::null_mut();
    };
    match builder.finalize() {
        Ok(entry) => entry.as_ptr() as *mut c_void,
        Err(e) => {
            log::debug!("njx_finalize: {e}");
            ptr::null_mut()
        }
    }
}

// ==== EMISSION ====

macro_rules! nullary_ops {
    ($($c_name:ident => $method:ident),* $(,)?) => {
        $(
            /// # Safety
            ///
            /// `fb` must be a live, unfinalized builder handle.
            #[no_mangle]
            pub unsafe extern "C" fn $c_name(fb: NjxFunctionBuilderRef) -> NjxLInsRef {
                handle(builder_mut(fb).$method())
            }
        )*
    };
}

macro_rules! unary_ops {
    ($($c_name:ident => $method:ident),* $(,)?) => {
        $(
            /// # Safety
            ///
            /// `fb` must be a live, unfinalized builder handle and `a` one of its instructions.
            #[no_mangle]
            pub unsafe extern "C" fn $c_name(fb: NjxFunctionBuilderRef, a: NjxLInsRef) -> NjxLInsRef {
                handle(builder_mut(fb).$method(required(a)))
            }
        )*
    };
}

macro_rules! binary_ops {
    ($($c_name:ident => $method:ident),* $(,)?) => {
        $(
            /// # Safety
            ///
            /// `fb` must be a live, unfinalized builder handle and `lhs`, `rhs` its instructions.
            #[no_mangle]
            pub unsafe extern "C" fn $c_name(
                fb: NjxFunctionBuilderRef,
                lhs: NjxLInsRef,
                rhs: NjxLInsRef,
            ) -> NjxLInsRef {
                handle(builder_mut(fb).$method(required(lhs), required(rhs)))
            }
        )*
    };
}

macro_rules! load_ops {
    ($($c_name:ident => $method:ident),* $(,)?) => {
        $(
            /// # Safety
            ///
            /// `fb` must be a live, unfinalized builder handle and `ptr` one of its instructions.
            #[no_mangle]
            pub unsafe extern "C" fn $c_name(
                fb: NjxFunctionBuilderRef,
                ptr: NjxLInsRef,
                offset: i32,
            ) -> NjxLInsRef {
                handle(builder_mut(fb).$method(required(ptr), offset))
            }
        )*
    };
}

macro_rules! store_ops {
    ($($c_name:ident => $method:ident),* $(,)?) => {
        $(
            /// # Safety
            ///
            /// `fb` must be a live, unfinalized builder handle and `value`, `ptr` its instructions.
            #[no_mangle]
            pub unsafe extern "C" fn $c_name(
                fb: NjxFunctionBuilderRef,
                value: NjxLInsRef,
                ptr: NjxLInsRef,
                offset: i32,
            ) -> NjxLInsRef {
                handle(builder_mut(fb).$method(required(value), required(ptr), offset))
            }
        )*
    };
}

/// # Safety
///
/// `fb` must be a live, unfinalized builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_immi(fb: NjxFunctionBuilderRef, i: i32) -> NjxLInsRef {
    handle(builder_mut(fb).immi(i))
}

/// # Safety
///
/// `fb` must be a live, unfinalized builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_immq(fb: NjxFunctionBuilderRef, q: i64) -> NjxLInsRef {
    handle(builder_mut(fb).immq(q))
}

/// # Safety
///
/// `fb` must be a live, unfinalized builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_immf(fb: NjxFunctionBuilderRef, f: f32) -> NjxLInsRef {
    handle(builder_mut(fb).immf(f))
}

/// # Safety
///
/// `fb` must be a live, unfinalized builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_immd(fb: NjxFunctionBuilderRef, d: f64) -> NjxLInsRef {
    handle(builder_mut(fb).immd(d))
}

/// Typed parameter; `kind` is one of the `NJX_*_KIND` codes other than void.
///
/// # Safety
///
/// `fb` must be a live, unfinalized builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_parameter(fb: NjxFunctionBuilderRef, kind: c_int) -> NjxLInsRef {
    let Some(kind) = kind_from_code(kind) else {
        panic!("njx_parameter: invalid kind code {kind}");
    };
    handle(builder_mut(fb).parameter(kind))
}

/// # Safety
///
/// `fb` must be a live, unfinalized builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_alloca(fb: NjxFunctionBuilderRef, size: i32) -> NjxLInsRef {
    let Ok(size) = u32::try_from(size) else {
        panic!("njx_alloca: negative size {size}");
    };
    handle(builder_mut(fb).alloca(size))
}

nullary_ops! {
    njx_insert_parameter => insert_parameter,
    njx_add_label => add_label,
    njx_ret => ret,
}

unary_ops! {
    njx_reti => reti,
    njx_retq => retq,
    njx_retd => retd,
    njx_q2i => q2i,
    njx_i2q => i2q,
    njx_ui2uq => ui2uq,
    njx_i2d => i2d,
    njx_d2i => d2i,
    njx_f2d => f2d,
    njx_d2f => d2f,
    njx_guard_true => guard_true,
    njx_guard_false => guard_false,
}

binary_ops! {
    njx_addi => addi,
    njx_subi => subi,
    njx_muli => muli,
    njx_andi => andi,
    njx_ori => ori,
    njx_xori => xori,
    njx_lshi => lshi,
    njx_rshi => rshi,
    njx_rshui => rshui,
    njx_addq => addq,
    njx_subq => subq,
    njx_mulq => mulq,
    njx_andq => andq,
    njx_orq => orq,
    njx_xorq => xorq,
    njx_lshq => lshq,
    njx_rshq => rshq,
    njx_rshuq => rshuq,
    njx_addf => addf,
    njx_subf => subf,
    njx_mulf => mulf,
    njx_divf => divf,
    njx_addd => addd,
    njx_subd => subd,
    njx_muld => muld,
    njx_divd => divd,
    njx_eqi => eqi,
    njx_lti => lti,
    njx_gti => gti,
    njx_lei => lei,
    njx_gei => gei,
    njx_eqq => eqq,
    njx_ltq => ltq,
    njx_gtq => gtq,
    njx_leq => leq,
    njx_geq => geq,
    njx_eqf => eqf,
    njx_ltf => ltf,
    njx_gtf => gtf,
    njx_lef => lef,
    njx_gef => gef,
    njx_eqd => eqd,
    njx_ltd => ltd,
    njx_gtd => gtd,
    njx_led => led,
    njx_ged => ged,
}

load_ops! {
    njx_load_c2i => load_c2i,
    njx_load_uc2ui => load_uc2ui,
    njx_load_s2i => load_s2i,
    njx_load_us2ui => load_us2ui,
    njx_load_i => load_i,
    njx_load_q => load_q,
    njx_load_f => load_f,
    njx_load_d => load_d,
    njx_load_f2d => load_f2d,
}

store_ops! {
    njx_store_i2c => store_i2c,
    njx_store_i2s => store_i2s,
    njx_store_i => store_i,
    njx_store_q => store_q,
    njx_store_f => store_f,
    njx_store_d => store_d,
}

/// `cond ? if_true : if_false` on ints.
///
/// # Safety
///
/// `fb` must be a live, unfinalized builder handle and the operands its instructions.
#[no_mangle]
pub unsafe extern "C" fn njx_cmovi(
    fb: NjxFunctionBuilderRef,
    cond: NjxLInsRef,
    if_true: NjxLInsRef,
    if_false: NjxLInsRef,
) -> NjxLInsRef {
    handle(builder_mut(fb).cmovi(required(cond), required(if_true), required(if_false)))
}

/// # Safety
///
/// `fb` must be a live, unfinalized builder handle and the operands its instructions.
#[no_mangle]
pub unsafe extern "C" fn njx_cmovq(
    fb: NjxFunctionBuilderRef,
    cond: NjxLInsRef,
    if_true: NjxLInsRef,
    if_false: NjxLInsRef,
) -> NjxLInsRef {
    handle(builder_mut(fb).cmovq(required(cond), required(if_true), required(if_false)))
}

// ==== CONTROL FLOW ====

/// Unconditional branch; `to` may be null and patched later.
///
/// # Safety
///
/// `fb` must be a live, unfinalized builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_br(fb: NjxFunctionBuilderRef, to: NjxLInsRef) -> NjxLInsRef {
    handle(builder_mut(fb).br(optional(to)))
}

/// # Safety
///
/// `fb` must be a live, unfinalized builder handle and `cond` one of its instructions.
#[no_mangle]
pub unsafe extern "C" fn njx_cbr_true(fb: NjxFunctionBuilderRef, cond: NjxLInsRef, to: NjxLInsRef) -> NjxLInsRef {
    handle(builder_mut(fb).cbr_true(required(cond), optional(to)))
}

/// # Safety
///
/// `fb` must be a live, unfinalized builder handle and `cond` one of its instructions.
#[no_mangle]
pub unsafe extern "C" fn njx_cbr_false(fb: NjxFunctionBuilderRef, cond: NjxLInsRef, to: NjxLInsRef) -> NjxLInsRef {
    handle(builder_mut(fb).cbr_false(required(cond), optional(to)))
}

/// Point `jmp` (from `njx_br`, `njx_cbr_true` or `njx_cbr_false`) at the label `target`.
///
/// # Safety
///
/// `fb` must be a live, unfinalized builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_set_jmp_target(fb: NjxFunctionBuilderRef, jmp: NjxLInsRef, target: NjxLInsRef) {
    builder_mut(fb).set_jmp_target(required(jmp), required(target));
}

/// Call the native function `func` with `nargs` arguments from `args`.
///
/// # Safety
///
/// `fb` must be a live, unfinalized builder handle, `args` must point to
/// `nargs` instruction handles of the builder, and `func` must have a C
/// signature matching the argument kinds and `ret_kind`.
#[no_mangle]
pub unsafe extern "C" fn njx_call(
    fb: NjxFunctionBuilderRef,
    func: *const c_void,
    ret_kind: c_int,
    args: *const NjxLInsRef,
    nargs: c_int,
) -> NjxLInsRef {
    let args: Vec<LInsRef> = if args.is_null() || nargs <= 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(args, nargs as usize)
            .iter()
            .map(|a| required(*a))
            .collect()
    };
    let ret = if ret_kind == NJX_VOID_KIND {
        None
    } else {
        match kind_from_code(ret_kind) {
            Some(kind) => Some(kind),
            None => panic!("njx_call: invalid return kind code {ret_kind}"),
        }
    };
    handle(builder_mut(fb).call(func as *const u8, ret, &args))
}

// ==== QUERIES ====

/// Handles that name no instruction of the buffer answer `None`.
unsafe fn ins_kind(fb: NjxFunctionBuilderRef, ins: NjxLInsRef) -> Option<ValueKind> {
    let index = (ins as usize).checked_sub(1)?;
    u32::try_from(index).ok()?;
    fb.as_ref()?.builder.as_ref()?.get(LInsRef::from_index(index))?.kind()
}

/// # Safety
///
/// `fb` must be null or a live builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_is_i(fb: NjxFunctionBuilderRef, ins: NjxLInsRef) -> bool {
    ins_kind(fb, ins) == Some(ValueKind::I32)
}

/// # Safety
///
/// `fb` must be null or a live builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_is_q(fb: NjxFunctionBuilderRef, ins: NjxLInsRef) -> bool {
    ins_kind(fb, ins) == Some(ValueKind::I64)
}

/// # Safety
///
/// `fb` must be null or a live builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_is_f(fb: NjxFunctionBuilderRef, ins: NjxLInsRef) -> bool {
    ins_kind(fb, ins) == Some(ValueKind::F32)
}

/// # Safety
///
/// `fb` must be null or a live builder handle.
#[no_mangle]
pub unsafe extern "C" fn njx_is_d(fb: NjxFunctionBuilderRef, ins: NjxLInsRef) -> bool {
    ins_kind(fb, ins) == Some(ValueKind::F64)
}
