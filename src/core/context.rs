// This module provides the JIT context, the long-lived owner of everything fragments share.
// JitContext holds the bump arena (bumpalo) that per-builder scratch data is allocated in,
// the executable memory allocator, the single LIR buffer every fragment appends to, the
// name to fragment table, the diagnostic sink and running statistics. A FunctionBuilder
// borrows the context mutably for its whole lifetime, so only one fragment can be under
// construction at a time and the borrow checker enforces the single-threaded contract.
// Dropping the context unmaps all generated code: every entry point obtained from it
// becomes invalid at that moment. ContextStats follows the same layout as a compilation
// session summary and is printed by the demo driver.

//! JIT context and configuration.

use std::fmt;

use bumpalo::Bump;

use crate::builder::FunctionBuilder;
use crate::core::diagnostics::{Diagnostic, Diagnostics};
use crate::core::fragment::{EntryPoint, Fragment, FragmentTable};
use crate::lir::{LIns, LInsRef, LirBuffer};
use crate::x64::code_alloc::CodeAlloc;

/// Context configuration.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Attach a tracer to every builder and log native listings.
    pub verbose: bool,
    /// Size of each executable memory chunk.
    pub code_chunk_size: usize,
    /// Upper bound on executable memory mapped by one context.
    pub code_limit: usize,
    /// Largest stack frame a fragment may use.
    pub max_frame_size: u32,
    /// Optional cap on the bump arena.
    pub arena_limit: Option<usize>,
    /// Echo diagnostics to standard error.
    pub echo_diagnostics: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            code_chunk_size: 64 * 1024,
            code_limit: 16 * 1024 * 1024,
            max_frame_size: 1024 * 1024,
            arena_limit: None,
            echo_diagnostics: true,
        }
    }
}

/// Running totals over the lifetime of a context.
#[derive(Debug, Default, Clone)]
pub struct ContextStats {
    /// Fragments published.
    pub fragments_compiled: usize,
    /// Finalize calls that returned an error.
    pub fragments_failed: usize,
    /// Publications that replaced an existing name.
    pub fragments_replaced: usize,
    /// Instructions in the shared buffer.
    pub instructions_emitted: usize,
    /// Requests answered by CSE.
    pub cse_hits: usize,
    /// Requests simplified by the expression filter.
    pub expr_folds: usize,
    /// Machine code bytes generated.
    pub code_bytes: usize,
    pub largest_fragment_size: usize,
    pub largest_fragment_name: String,
}

impl ContextStats {
    pub(crate) fn record_fragment(&mut self, name: &str, code_size: usize, replaced: bool) {
        self.fragments_compiled += 1;
        self.code_bytes += code_size;
        if replaced {
            self.fragments_replaced += 1;
        }
        if code_size > self.largest_fragment_size {
            self.largest_fragment_size = code_size;
            self.largest_fragment_name = name.to_string();
        }
    }
}

impl fmt::Display for ContextStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "JIT Context Statistics:")?;
        writeln!(f, "  Fragments compiled: {}", self.fragments_compiled)?;
        writeln!(f, "  Fragments failed: {}", self.fragments_failed)?;
        writeln!(f, "  Fragments replaced: {}", self.fragments_replaced)?;
        writeln!(f, "  Instructions emitted: {}", self.instructions_emitted)?;
        writeln!(f, "  CSE hits: {}", self.cse_hits)?;
        writeln!(f, "  Expressions simplified: {}", self.expr_folds)?;
        writeln!(f, "  Total code size: {} bytes", self.code_bytes)?;

        if !self.largest_fragment_name.is_empty() {
            writeln!(
                f,
                "  Largest fragment: {} ({} bytes)",
                self.largest_fragment_name, self.largest_fragment_size
            )?;
        }

        Ok(())
    }
}

/// Mutable view of a context held by a builder.
pub(crate) struct ContextRef<'ctx> {
    pub config: &'ctx JitConfig,
    pub arena: &'ctx Bump,
    pub lirbuf: &'ctx mut LirBuffer,
    pub code_alloc: &'ctx mut CodeAlloc,
    pub fragments: &'ctx mut FragmentTable,
    pub diagnostics: &'ctx mut Diagnostics,
    pub stats: &'ctx mut ContextStats,
}

/// Owner of shared JIT state.
pub struct JitContext {
    config: JitConfig,
    arena: Bump,
    code_alloc: CodeAlloc,
    lirbuf: LirBuffer,
    fragments: FragmentTable,
    diagnostics: Diagnostics,
    stats: ContextStats,
}

impl JitContext {
    /// Create a context with default configuration.
    pub fn new(verbose: bool) -> Self {
        Self::with_config(JitConfig { verbose, ..JitConfig::default() })
    }

    pub fn with_config(config: JitConfig) -> Self {
        let arena = Bump::new();
        arena.set_allocation_limit(config.arena_limit);
        log::debug!(
            "creating JIT context (verbose: {}, code limit: {} bytes)",
            config.verbose,
            config.code_limit
        );
        Self {
            code_alloc: CodeAlloc::new(config.code_chunk_size, config.code_limit),
            diagnostics: Diagnostics::new(config.echo_diagnostics),
            arena,
            lirbuf: LirBuffer::new(),
            fragments: FragmentTable::new(),
            stats: ContextStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn is_verbose(&self) -> bool {
        self.config.verbose
    }

    /// Start building a fragment called `name`.
    ///
    /// With `optimize` the builder's pipeline includes CSE and expression
    /// simplification.
    pub fn create_function_builder(&mut self, name: &str, optimize: bool) -> FunctionBuilder<'_> {
        let JitContext {
            config,
            arena,
            code_alloc,
            lirbuf,
            fragments,
            diagnostics,
            stats,
        } = self;
        FunctionBuilder::new(
            ContextRef {
                config,
                arena,
                lirbuf,
                code_alloc,
                fragments,
                diagnostics,
                stats,
            },
            name,
            optimize,
        )
    }

    /// Entry point published under `name`.
    pub fn lookup(&self, name: &str) -> Option<EntryPoint> {
        self.fragments.get(name).map(|f| f.entry())
    }

    pub fn fragment(&self, name: &str) -> Option<&Fragment> {
        self.fragments.get(name)
    }

    pub fn fragments(&self) -> &FragmentTable {
        &self.fragments
    }

    /// LIR listing of the published fragment `name`.
    pub fn fragment_listing(&self, name: &str) -> Option<String> {
        self.fragments
            .get(name)
            .map(|f| self.lirbuf.listing(f.first_ins, f.last_ins))
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Drain the recorded diagnostics, e.g. after reporting them.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        self.diagnostics.take_entries()
    }

    pub fn stats(&self) -> &ContextStats {
        &self.stats
    }

    pub fn lir(&self) -> &LirBuffer {
        &self.lirbuf
    }

    pub fn ins(&self, r: LInsRef) -> Option<&LIns> {
        self.lirbuf.get(r)
    }

    /// Bytes allocated from the shared arena.
    pub fn arena_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }

    /// Release all fragments and generated code.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for JitContext {
    fn drop(&mut self) {
        log::debug!(
            "destroying JIT context: {} fragments, {} bytes of code",
            self.fragments.len(),
            self.code_alloc.bytes_used()
        );
        self.fragments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JitConfig::default();
        assert!(!config.verbose);
        assert_eq!(config.code_chunk_size, 64 * 1024);
        assert_eq!(config.max_frame_size, 1024 * 1024);
        assert!(config.echo_diagnostics);
    }

    #[test]
    fn test_empty_context() {
        let ctx = JitContext::new(true);
        assert!(ctx.is_verbose());
        assert!(ctx.lookup("missing").is_none());
        assert!(ctx.fragment_listing("missing").is_none());
        assert!(ctx.lir().is_empty());
        ctx.destroy();
    }

    #[test]
    fn test_stats_display() {
        let mut stats = ContextStats::default();
        stats.record_fragment("small", 16, false);
        stats.record_fragment("big", 64, true);
        let text = stats.to_string();
        assert!(text.contains("Fragments compiled: 2"));
        assert!(text.contains("Fragments replaced: 1"));
        assert!(text.contains("Largest fragment: big (64 bytes)"));
    }
}
