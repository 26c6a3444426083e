// This module groups the infrastructure shared by every fragment built from a context:
// the JIT context itself (shared bump arena, executable memory, LIR buffer, fragment
// table, statistics), the records a successful finalize publishes (Fragment, Callable,
// EntryPoint, ReturnKinds), the diagnostic sink that mirrors warnings and errors to
// standard error, and the thiserror-based error enums reported by finalize and the code
// generator.

//! Core lirjit infrastructure
//!
//! # Key Components
//!
//! ## Context (`context`)
//! - Owns the `bumpalo` arena, code memory and the shared LIR buffer
//! - Publishes fragments by name and keeps statistics
//!
//! ## Fragments (`fragment`)
//! - Tagged callables decided once at finalize
//! - Last-writer-wins fragment table
//!
//! ## Diagnostics (`diagnostics`) and errors (`error`)

pub mod context;
pub mod diagnostics;
pub mod error;
pub mod fragment;

pub use context::{ContextStats, JitConfig, JitContext};
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use error::{CodeAllocError, CodegenError, CodegenResult, FinalizeError};
pub use fragment::{Callable, EntryPoint, Fragment, FragmentTable, ReturnKind, ReturnKinds};
