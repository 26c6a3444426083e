// This module provides FunctionBuilder, the public emission API for one fragment. A builder
// is created by JitContext::create_function_builder, emits a `start` marker, and then turns
// each call (constants, parameters, arithmetic, comparisons, conversions, selects, loads,
// stores, labels, branches, calls, returns, guards, stack allocation) into a LirRequest
// that is sent through the builder's writer pipeline; the handle that comes back may be a
// fresh instruction or, with optimization enabled, an earlier equivalent one. Return
// instructions also record their kind in a bitmask. finalize() consumes the builder, which
// is how the Building -> Finalizing -> Compiled/Failed lifecycle is enforced: there is no
// builder left to call after it returns. Finalize checks the return kinds, appends the
// terminating `x` guard, runs the x86-64 code generator, and on success publishes the
// fragment in the context's table. Fatal generator faults print one diagnostic line and
// terminate the process with status 1; everything else comes back as a FinalizeError.

//! Fragment builder.

use crate::core::context::ContextRef;
use crate::core::error::FinalizeError;
use crate::core::fragment::{Callable, EntryPoint, Fragment, ReturnKind, ReturnKinds};
use crate::lir::validate::ValidateWriter;
use crate::lir::{
    Immediate, LIns, LInsRef, LirOpcode, LirRequest, ValueKind, WriterPipeline, ACC_OTHER,
};
use crate::x64::codegen::X64CodeGenerator;

/// Builds one fragment. See the module documentation.
pub struct FunctionBuilder<'ctx> {
    ctx: ContextRef<'ctx>,
    name: String,
    optimize: bool,
    pipeline: WriterPipeline<'ctx>,
    return_kinds: ReturnKinds,
    param_count: u32,
    start: LInsRef,
}

impl<'ctx> FunctionBuilder<'ctx> {
    pub(crate) fn new(ctx: ContextRef<'ctx>, name: &str, optimize: bool) -> Self {
        let first = ctx.lirbuf.next_ref();
        let pipeline = WriterPipeline::new(first, optimize, ctx.config.verbose, ctx.arena);
        let mut builder = Self {
            ctx,
            name: name.to_string(),
            optimize,
            pipeline,
            return_kinds: ReturnKinds::default(),
            param_count: 0,
            start: first,
        };
        builder.start = builder.emit(LirRequest::new(LirOpcode::Start));
        log::debug!("building fragment '{}' (optimize: {})", name, optimize);
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_optimizing(&self) -> bool {
        self.optimize
    }

    /// The fragment's `start` instruction.
    pub fn start(&self) -> LInsRef {
        self.start
    }

    /// Instruction behind a handle returned by this builder.
    pub fn ins(&self, r: LInsRef) -> &LIns {
        self.ctx.lirbuf.ins(r)
    }

    /// Instruction behind `r`, or `None` for a handle the buffer never issued.
    pub fn get(&self, r: LInsRef) -> Option<&LIns> {
        self.ctx.lirbuf.get(r)
    }

    pub fn return_kinds(&self) -> ReturnKinds {
        self.return_kinds
    }

    /// Tracer output so far (verbose contexts only).
    pub fn trace(&self) -> &[String] {
        self.pipeline.trace()
    }

    fn emit(&mut self, req: LirRequest) -> LInsRef {
        self.pipeline.write(self.ctx.lirbuf, req)
    }

    fn unary(&mut self, opcode: LirOpcode, a: LInsRef) -> LInsRef {
        self.emit(LirRequest::new(opcode).with_operands(&[a]))
    }

    fn binary(&mut self, opcode: LirOpcode, a: LInsRef, b: LInsRef) -> LInsRef {
        self.emit(LirRequest::new(opcode).with_operands(&[a, b]))
    }

    // ==== CONSTANTS AND PARAMETERS ====

    pub fn immi(&mut self, v: i32) -> LInsRef {
        self.emit(LirRequest::imm_int(v))
    }

    pub fn immq(&mut self, v: i64) -> LInsRef {
        self.emit(LirRequest::imm_quad(v))
    }

    pub fn immf(&mut self, v: f32) -> LInsRef {
        self.emit(LirRequest::imm_float(v))
    }

    pub fn immd(&mut self, v: f64) -> LInsRef {
        self.emit(LirRequest::imm_double(v))
    }

    /// Next positional parameter, of kind `kind`.
    pub fn parameter(&mut self, kind: ValueKind) -> LInsRef {
        let index = self.param_count;
        self.param_count += 1;
        self.emit(LirRequest::new(LirOpcode::Param).with_imm(Immediate::Param { index, kind }))
    }

    /// Next positional parameter as a register-sized integer.
    pub fn insert_parameter(&mut self) -> LInsRef {
        self.parameter(ValueKind::I64)
    }

    pub fn param_count(&self) -> u32 {
        self.param_count
    }

    // ==== ARITHMETIC ====

    pub fn addi(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::AddI, a, b)
    }

    pub fn subi(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::SubI, a, b)
    }

    pub fn muli(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::MulI, a, b)
    }

    pub fn andi(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::AndI, a, b)
    }

    pub fn ori(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::OrI, a, b)
    }

    pub fn xori(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::XorI, a, b)
    }

    pub fn lshi(&mut self, a: LInsRef, count: LInsRef) -> LInsRef {
        self.binary(LirOpcode::LshI, a, count)
    }

    pub fn rshi(&mut self, a: LInsRef, count: LInsRef) -> LInsRef {
        self.binary(LirOpcode::RshI, a, count)
    }

    pub fn rshui(&mut self, a: LInsRef, count: LInsRef) -> LInsRef {
        self.binary(LirOpcode::RshuI, a, count)
    }

    pub fn addq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::AddQ, a, b)
    }

    pub fn subq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::SubQ, a, b)
    }

    pub fn mulq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::MulQ, a, b)
    }

    pub fn andq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::AndQ, a, b)
    }

    pub fn orq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::OrQ, a, b)
    }

    pub fn xorq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::XorQ, a, b)
    }

    /// 64-bit shifts take a 32-bit count.
    pub fn lshq(&mut self, a: LInsRef, count: LInsRef) -> LInsRef {
        self.binary(LirOpcode::LshQ, a, count)
    }

    pub fn rshq(&mut self, a: LInsRef, count: LInsRef) -> LInsRef {
        self.binary(LirOpcode::RshQ, a, count)
    }

    pub fn rshuq(&mut self, a: LInsRef, count: LInsRef) -> LInsRef {
        self.binary(LirOpcode::RshuQ, a, count)
    }

    pub fn addf(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::AddF, a, b)
    }

    pub fn subf(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::SubF, a, b)
    }

    pub fn mulf(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::MulF, a, b)
    }

    pub fn divf(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::DivF, a, b)
    }

    pub fn addd(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::AddD, a, b)
    }

    pub fn subd(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::SubD, a, b)
    }

    pub fn muld(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::MulD, a, b)
    }

    pub fn divd(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::DivD, a, b)
    }

    // ==== COMPARISONS (result is an int, 0 or 1) ====

    pub fn eqi(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::EqI, a, b)
    }

    pub fn lti(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::LtI, a, b)
    }

    pub fn gti(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::GtI, a, b)
    }

    pub fn lei(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::LeI, a, b)
    }

    pub fn gei(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::GeI, a, b)
    }

    pub fn eqq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::EqQ, a, b)
    }

    pub fn ltq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::LtQ, a, b)
    }

    pub fn gtq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::GtQ, a, b)
    }

    pub fn leq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::LeQ, a, b)
    }

    pub fn geq(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::GeQ, a, b)
    }

    pub fn eqf(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::EqF, a, b)
    }

    pub fn ltf(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::LtF, a, b)
    }

    pub fn gtf(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::GtF, a, b)
    }

    pub fn lef(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::LeF, a, b)
    }

    pub fn gef(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::GeF, a, b)
    }

    pub fn eqd(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::EqD, a, b)
    }

    pub fn ltd(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::LtD, a, b)
    }

    pub fn gtd(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::GtD, a, b)
    }

    pub fn led(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::LeD, a, b)
    }

    pub fn ged(&mut self, a: LInsRef, b: LInsRef) -> LInsRef {
        self.binary(LirOpcode::GeD, a, b)
    }

    // ==== CONVERSIONS AND SELECTS ====

    pub fn q2i(&mut self, q: LInsRef) -> LInsRef {
        self.unary(LirOpcode::Q2I, q)
    }

    pub fn i2q(&mut self, i: LInsRef) -> LInsRef {
        self.unary(LirOpcode::I2Q, i)
    }

    pub fn ui2uq(&mut self, i: LInsRef) -> LInsRef {
        self.unary(LirOpcode::UI2UQ, i)
    }

    pub fn i2d(&mut self, i: LInsRef) -> LInsRef {
        self.unary(LirOpcode::I2D, i)
    }

    pub fn d2i(&mut self, d: LInsRef) -> LInsRef {
        self.unary(LirOpcode::D2I, d)
    }

    pub fn f2d(&mut self, f: LInsRef) -> LInsRef {
        self.unary(LirOpcode::F2D, f)
    }

    pub fn d2f(&mut self, d: LInsRef) -> LInsRef {
        self.unary(LirOpcode::D2F, d)
    }

    /// `cond ? if_true : if_false` on ints.
    pub fn cmovi(&mut self, cond: LInsRef, if_true: LInsRef, if_false: LInsRef) -> LInsRef {
        self.emit(LirRequest::new(LirOpcode::CmovI).with_operands(&[cond, if_true, if_false]))
    }

    pub fn cmovq(&mut self, cond: LInsRef, if_true: LInsRef, if_false: LInsRef) -> LInsRef {
        self.emit(LirRequest::new(LirOpcode::CmovQ).with_operands(&[cond, if_true, if_false]))
    }

    // ==== MEMORY ====

    fn load(&mut self, opcode: LirOpcode, ptr: LInsRef, offset: i32) -> LInsRef {
        self.emit(
            LirRequest::new(opcode)
                .with_operands(&[ptr])
                .with_imm(Immediate::Disp { offset, acc: ACC_OTHER }),
        )
    }

    fn store(&mut self, opcode: LirOpcode, value: LInsRef, ptr: LInsRef, offset: i32) -> LInsRef {
        self.emit(
            LirRequest::new(opcode)
                .with_operands(&[value, ptr])
                .with_imm(Immediate::Disp { offset, acc: ACC_OTHER }),
        )
    }

    /// Sign-extending 8-bit load.
    pub fn load_c2i(&mut self, ptr: LInsRef, offset: i32) -> LInsRef {
        self.load(LirOpcode::LdC2I, ptr, offset)
    }

    /// Zero-extending 8-bit load.
    pub fn load_uc2ui(&mut self, ptr: LInsRef, offset: i32) -> LInsRef {
        self.load(LirOpcode::LdUC2UI, ptr, offset)
    }

    pub fn load_s2i(&mut self, ptr: LInsRef, offset: i32) -> LInsRef {
        self.load(LirOpcode::LdS2I, ptr, offset)
    }

    pub fn load_us2ui(&mut self, ptr: LInsRef, offset: i32) -> LInsRef {
        self.load(LirOpcode::LdUS2UI, ptr, offset)
    }

    pub fn load_i(&mut self, ptr: LInsRef, offset: i32) -> LInsRef {
        self.load(LirOpcode::LdI, ptr, offset)
    }

    pub fn load_q(&mut self, ptr: LInsRef, offset: i32) -> LInsRef {
        self.load(LirOpcode::LdQ, ptr, offset)
    }

    pub fn load_f(&mut self, ptr: LInsRef, offset: i32) -> LInsRef {
        self.load(LirOpcode::LdF, ptr, offset)
    }

    pub fn load_d(&mut self, ptr: LInsRef, offset: i32) -> LInsRef {
        self.load(LirOpcode::LdD, ptr, offset)
    }

    /// Load a float and widen it to a double.
    pub fn load_f2d(&mut self, ptr: LInsRef, offset: i32) -> LInsRef {
        self.load(LirOpcode::LdF2D, ptr, offset)
    }

    /// Store the low byte of an int.
    pub fn store_i2c(&mut self, value: LInsRef, ptr: LInsRef, offset: i32) -> LInsRef {
        self.store(LirOpcode::StI2C, value, ptr, offset)
    }

    pub fn store_i2s(&mut self, value: LInsRef, ptr: LInsRef, offset: i32) -> LInsRef {
        self.store(LirOpcode::StI2S, value, ptr, offset)
    }

    pub fn store_i(&mut self, value: LInsRef, ptr: LInsRef, offset: i32) -> LInsRef {
        self.store(LirOpcode::StI, value, ptr, offset)
    }

    pub fn store_q(&mut self, value: LInsRef, ptr: LInsRef, offset: i32) -> LInsRef {
        self.store(LirOpcode::StQ, value, ptr, offset)
    }

    pub fn store_f(&mut self, value: LInsRef, ptr: LInsRef, offset: i32) -> LInsRef {
        self.store(LirOpcode::StF, value, ptr, offset)
    }

    pub fn store_d(&mut self, value: LInsRef, ptr: LInsRef, offset: i32) -> LInsRef {
        self.store(LirOpcode::StD, value, ptr, offset)
    }

    /// Reserve `size` bytes in the fragment's stack frame. The result is the
    /// address of the block.
    pub fn alloca(&mut self, size: u32) -> LInsRef {
        self.emit(LirRequest::new(LirOpcode::Alloc).with_imm(Immediate::Size(size)))
    }

    // ==== CONTROL FLOW ====

    pub fn add_label(&mut self) -> LInsRef {
        self.emit(LirRequest::new(LirOpcode::Label))
    }

    /// Unconditional branch. `None` leaves the target to [`Self::set_jmp_target`].
    pub fn br(&mut self, target: Option<LInsRef>) -> LInsRef {
        self.emit(LirRequest::new(LirOpcode::J).with_target(target))
    }

    /// Branch when `cond` is non-zero.
    pub fn cbr_true(&mut self, cond: LInsRef, target: Option<LInsRef>) -> LInsRef {
        self.emit(LirRequest::new(LirOpcode::JT).with_operands(&[cond]).with_target(target))
    }

    /// Branch when `cond` is zero.
    pub fn cbr_false(&mut self, cond: LInsRef, target: Option<LInsRef>) -> LInsRef {
        self.emit(LirRequest::new(LirOpcode::JF).with_operands(&[cond]).with_target(target))
    }

    /// Point a branch of this fragment at a label of this fragment.
    ///
    /// Panics if `jmp` is not a branch or `target` is not a label.
    pub fn set_jmp_target(&mut self, jmp: LInsRef, target: LInsRef) {
        let check = ValidateWriter::new("set_jmp_target", self.start);
        let opcode = self
            .ctx
            .lirbuf
            .get(jmp)
            .map(|ins| ins.opcode())
            .filter(|op| op.is_branch() && jmp >= self.start);
        let Some(opcode) = opcode else {
            panic!("set_jmp_target: {} is not a branch of fragment '{}'", jmp, self.name);
        };
        check.check_label(self.ctx.lirbuf, opcode, target);
        self.ctx.lirbuf.set_target(jmp, target);
        log::trace!("set_jmp_target {} -> {}", jmp, target);
    }

    /// Call the native function at `func` with `args`.
    ///
    /// `ret` is the kind of value the function returns, `None` for void.
    pub fn call(&mut self, func: *const u8, ret: Option<ValueKind>, args: &[LInsRef]) -> LInsRef {
        self.emit(
            LirRequest::new(LirOpcode::call_for(ret))
                .with_imm(Immediate::Addr(func as usize))
                .with_args(args),
        )
    }

    fn ret_value(&mut self, opcode: LirOpcode, kind: ReturnKind, value: Option<LInsRef>) -> LInsRef {
        self.return_kinds.insert(kind);
        let req = LirRequest::new(opcode);
        match value {
            Some(v) => self.emit(req.with_operands(&[v])),
            None => self.emit(req),
        }
    }

    pub fn reti(&mut self, value: LInsRef) -> LInsRef {
        self.ret_value(LirOpcode::RetI, ReturnKind::Int, Some(value))
    }

    pub fn retq(&mut self, value: LInsRef) -> LInsRef {
        self.ret_value(LirOpcode::RetQ, ReturnKind::Quad, Some(value))
    }

    pub fn retd(&mut self, value: LInsRef) -> LInsRef {
        self.ret_value(LirOpcode::RetD, ReturnKind::Double, Some(value))
    }

    /// Return without a value.
    pub fn ret(&mut self) -> LInsRef {
        self.ret_value(LirOpcode::Ret, ReturnKind::Void, None)
    }

    /// Leave the fragment when `cond` is non-zero.
    pub fn guard_true(&mut self, cond: LInsRef) -> LInsRef {
        self.unary(LirOpcode::XT, cond)
    }

    /// Leave the fragment when `cond` is zero.
    pub fn guard_false(&mut self, cond: LInsRef) -> LInsRef {
        self.unary(LirOpcode::XF, cond)
    }

    // ==== FINALIZE ====

    /// Compile the fragment and publish it under the builder's name.
    ///
    /// On error nothing is published; an earlier fragment of the same name
    /// stays reachable.
    pub fn finalize(mut self) -> Result<EntryPoint, FinalizeError> {
        let kind = match self.return_kinds.len() {
            0 => {
                self.ctx
                    .diagnostics
                    .warn(format!("no return type in fragment '{}'", self.name));
                ReturnKind::Void
            }
            1 => self.return_kinds.single().unwrap_or(ReturnKind::Void),
            _ => {
                self.ctx.diagnostics.warn(format!(
                    "multiple return types in fragment '{}' ({})",
                    self.name, self.return_kinds
                ));
                self.finish_stats();
                self.ctx.stats.fragments_failed += 1;
                return Err(FinalizeError::ConflictingReturnKinds {
                    name: self.name,
                    kinds: self.return_kinds,
                });
            }
        };

        let last = self.emit(LirRequest::new(LirOpcode::X));
        self.finish_stats();

        let codegen = X64CodeGenerator::new(self.ctx.config, self.ctx.arena);
        let compiled = match codegen.compile(self.ctx.lirbuf, self.start, last, self.ctx.code_alloc) {
            Ok(compiled) => compiled,
            Err(e) if e.is_fatal() => {
                self.ctx.diagnostics.error(format!("error during assembly: {}", e));
                std::process::exit(1);
            }
            Err(e) => {
                self.ctx
                    .diagnostics
                    .error(format!("error during assembly: {}", e));
                self.ctx.stats.fragments_failed += 1;
                return Err(FinalizeError::Codegen { name: self.name, source: e });
            }
        };

        let callable = Callable::new(kind, compiled.entry);
        let fragment = Fragment {
            name: self.name.clone(),
            callable,
            first_ins: self.start,
            last_ins: last,
            code_size: compiled.size,
            trace: self.pipeline.take_trace(),
        };
        let replaced = self.ctx.fragments.publish(fragment).is_some();
        self.ctx.stats.record_fragment(&self.name, compiled.size, replaced);
        log::debug!(
            "published fragment '{}' ({} returning, {} bytes at {:p})",
            self.name,
            kind,
            compiled.size,
            compiled.entry.as_ptr()
        );
        Ok(compiled.entry)
    }

    fn finish_stats(&mut self) {
        self.ctx.stats.instructions_emitted = self.ctx.lirbuf.len();
        self.ctx.stats.cse_hits += self.pipeline.cse_hits();
        self.ctx.stats.expr_folds += self.pipeline.expr_folds();
    }
}

#[cfg(test)]
mod tests {
    use crate::core::JitContext;
    use crate::lir::{LirOpcode, ValueKind};

    #[test]
    fn test_builder_emits_start_and_params() {
        let mut ctx = JitContext::new(false);
        let mut fb = ctx.create_function_builder("params", false);
        assert_eq!(fb.ins(fb.start()).opcode(), LirOpcode::Start);

        let a = fb.insert_parameter();
        let b = fb.parameter(ValueKind::F64);
        assert_eq!(fb.param_count(), 2);
        assert_eq!(fb.ins(a).kind(), Some(ValueKind::I64));
        assert_eq!(fb.ins(b).kind(), Some(ValueKind::F64));
    }

    #[test]
    fn test_return_kinds_accumulate() {
        let mut ctx = JitContext::new(false);
        let mut fb = ctx.create_function_builder("kinds", false);
        let one = fb.immi(1);
        fb.reti(one);
        fb.ret();
        assert_eq!(fb.return_kinds().len(), 2);
    }

    #[test]
    fn test_forward_branch_patching() {
        let mut ctx = JitContext::new(false);
        let mut fb = ctx.create_function_builder("patch", false);
        let jmp = fb.br(None);
        let label = fb.add_label();
        fb.set_jmp_target(jmp, label);
        assert_eq!(fb.ins(jmp).target(), Some(label));
    }

    #[test]
    #[should_panic(expected = "not a branch")]
    fn test_set_jmp_target_rejects_non_branch() {
        let mut ctx = JitContext::new(false);
        let mut fb = ctx.create_function_builder("bad", false);
        let one = fb.immi(1);
        let label = fb.add_label();
        fb.set_jmp_target(one, label);
    }

    #[test]
    #[should_panic(expected = "not a label")]
    fn test_set_jmp_target_rejects_non_label() {
        let mut ctx = JitContext::new(false);
        let mut fb = ctx.create_function_builder("bad", false);
        let jmp = fb.br(None);
        let one = fb.immi(1);
        fb.set_jmp_target(jmp, one);
    }
}
