// This module defines the error types for lirjit using the thiserror crate. FinalizeError is
// what FunctionBuilder::finalize reports to the caller: either the fragment returned values
// of more than one kind, or the code generator rejected it. CodegenError covers what the
// x86-64 backend can run into: running out of executable memory, a frame larger than the
// configured maximum, a branch whose target was never patched, a branch whose target is
// not a label of the fragment, too many parameters or call arguments for the System V
// registers, a missing operand, and encoder failures from iced-x86. is_fatal() separates
// the internal faults (which indicate an inconsistent instruction graph and terminate the
// process) from resource and shape errors that the caller can recover from by building a
// different fragment. CodeAllocError reports failures of the executable page allocator.

//! Error types for lirjit.

use thiserror::Error;

use crate::core::fragment::ReturnKinds;
use crate::lir::LInsRef;
use crate::x64::encoder::EncodingError;

/// Why `FunctionBuilder::finalize` did not publish a fragment.
#[derive(Error, Debug)]
pub enum FinalizeError {
    #[error("multiple return types in fragment '{name}': {kinds}")]
    ConflictingReturnKinds { name: String, kinds: ReturnKinds },

    #[error("code generation failed for fragment '{name}': {source}")]
    Codegen {
        name: String,
        #[source]
        source: CodegenError,
    },
}

/// Failures of the x86-64 code generator.
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("BufferExhausted: {needed} bytes of code do not fit in executable memory")]
    BufferExhausted { needed: usize },

    #[error("StackFull: frame of {size} bytes exceeds the {limit} byte limit")]
    StackFull { size: u64, limit: u32 },

    #[error("UnresolvedBranch: branch {ins} has no target")]
    UnresolvedBranch { ins: LInsRef },

    #[error("UnknownBranch: branch {ins} targets {target}, which is not a label of the fragment")]
    UnknownBranch { ins: LInsRef, target: LInsRef },

    #[error("too many {class} parameters ({count}, at most {max})")]
    TooManyParameters { class: &'static str, count: usize, max: usize },

    #[error("call {ins} passes too many {class} arguments ({count}, at most {max})")]
    TooManyArguments {
        ins: LInsRef,
        class: &'static str,
        count: usize,
        max: usize,
    },

    #[error("instruction {ins} is missing operand {slot}")]
    MissingOperand { ins: LInsRef, slot: usize },

    #[error("executable memory: {0}")]
    CodeMemory(CodeAllocError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl CodegenError {
    /// Internal faults that must not be recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodegenError::UnknownBranch { .. }
                | CodegenError::MissingOperand { .. }
                | CodegenError::Encoding(_)
        )
    }
}

impl From<iced_x86::IcedError> for CodegenError {
    fn from(e: iced_x86::IcedError) -> Self {
        CodegenError::Encoding(EncodingError::AssemblyError(e.to_string()))
    }
}

impl From<CodeAllocError> for CodegenError {
    fn from(e: CodeAllocError) -> Self {
        match e {
            CodeAllocError::Exhausted { needed, .. } => CodegenError::BufferExhausted { needed },
            other => CodegenError::CodeMemory(other),
        }
    }
}

/// Failures of the executable memory allocator.
#[derive(Error, Debug)]
pub enum CodeAllocError {
    #[error("code limit reached: {needed} more bytes requested, {used} of {limit} in use")]
    Exhausted { needed: usize, used: usize, limit: usize },

    #[error("mmap of {size} bytes failed: {source}")]
    Map {
        size: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("mprotect failed: {0}")]
    Protect(#[source] std::io::Error),

    #[error("executable memory is not supported on this platform")]
    Unsupported,
}

/// Result type alias for code generation.
pub type CodegenResult<T> = Result<T, CodegenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let unknown = CodegenError::UnknownBranch {
            ins: LInsRef::from_index(3),
            target: LInsRef::from_index(1),
        };
        assert!(unknown.is_fatal());
        assert!(unknown.to_string().starts_with("UnknownBranch"));

        let unresolved = CodegenError::UnresolvedBranch { ins: LInsRef::from_index(3) };
        assert!(!unresolved.is_fatal());
        assert!(!CodegenError::StackFull { size: 32, limit: 16 }.is_fatal());
    }

    #[test]
    fn test_exhausted_code_memory_is_buffer_exhaustion() {
        let e: CodegenError = CodeAllocError::Exhausted { needed: 64, used: 0, limit: 32 }.into();
        assert!(matches!(e, CodegenError::BufferExhausted { needed: 64 }));
        assert!(!e.is_fatal());
    }
}
