//! lirjit - a small LIR just-in-time compiler.
//!
//! Client code builds functions ("fragments") one instruction at a time
//! through a [`FunctionBuilder`]. Every emission flows through a writer
//! pipeline (validation, optional tracing, optional CSE and expression
//! simplification) into the instruction buffer shared by all fragments of a
//! [`JitContext`]. Finalizing a builder compiles its fragment to x86-64
//! machine code and publishes it by name.
//!
//! # Primary Usage
//!
//! ```no_run
//! use lirjit::JitContext;
//!
//! let mut ctx = JitContext::new(false);
//! let mut fb = ctx.create_function_builder("double_it", true);
//! let x = fb.insert_parameter();
//! let x = fb.q2i(x);
//! let two = fb.immi(2);
//! let y = fb.muli(x, two);
//! fb.reti(y);
//! let entry = fb.finalize().expect("compiles");
//!
//! let double_it: extern "C" fn(i64) -> i32 = unsafe { entry.cast() };
//! assert_eq!(double_it(21), 42);
//! ```
//!
//! # Architecture
//!
//! - [`lir`] - instruction model, shared buffer and writer pipeline
//! - [`builder`] - the fragment emission API and finalize
//! - [`core`] - context, fragments, diagnostics and errors
//! - [`x64`] - x86-64 encoder, calling convention, code memory, codegen
//! - [`capi`] - `extern "C"` handle-based boundary

pub mod builder;
pub mod capi;
pub mod core;
pub mod lir;
pub mod x64;

pub use builder::FunctionBuilder;
pub use core::{
    Callable, CodeAllocError, CodegenError, ContextStats, Diagnostic, Diagnostics, EntryPoint,
    FinalizeError, Fragment, FragmentTable, JitConfig, JitContext, ReturnKind, ReturnKinds,
    Severity,
};
pub use lir::{Immediate, LIns, LInsRef, LirBuffer, LirOpcode, ValueKind};
