// This module collects the x86-64 backend: the System V calling convention and frame
// layout, the iced-x86 based instruction encoder, the executable memory allocator and the
// code generator that lowers a LIR fragment through all of them.

//! x86-64 architecture-specific components.
//!
//! - Instruction encoding using iced-x86
//! - System V calling convention and frame layout
//! - Executable memory
//! - LIR to machine code lowering

pub mod calling_convention;
pub mod code_alloc;
pub mod codegen;
pub mod encoder;

pub use calling_convention::{ArgReg, CCAssigner, CCAssignment, FunctionFrame, RegBank, SysVAssigner};
pub use code_alloc::CodeAlloc;
pub use codegen::{CompiledCode, X64CodeGenerator};
pub use encoder::{EncodingError, X64Encoder};
