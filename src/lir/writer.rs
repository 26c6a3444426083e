// This module implements the writer pipeline every emission request walks through before
// it reaches the shared LIR buffer. Instead of a chain of objects each wrapping the next,
// the pipeline is a small closed set of stage variants (WriterStage) held in an explicit
// ordered list that is assembled once, when a function builder is created. A single
// dispatch function walks the list: each stage may forward the request unchanged, rewrite
// it into a different request, or answer it with an already emitted instruction, and may
// observe the result on the way back (the tracer logs it, CSE remembers it). The order is
// fixed: validator, tracer, CSE, expression filter, second validator, buffer writer. The
// buffer writer always terminates the list, so every request that is not answered early
// is physically appended to the buffer.

//! Writer pipeline: emission requests and stage dispatch.

use bumpalo::Bump;

use super::cse::CseFilter;
use super::expr::{ExprFilter, Simplified};
use super::validate::ValidateWriter;
use super::verbose::VerboseWriter;
use super::{Immediate, LInsRef, LirBuffer, LirOpcode, ValueKind};

/// An instruction that has not been committed to the buffer yet.
#[derive(Debug, Clone, PartialEq)]
pub struct LirRequest {
    pub opcode: LirOpcode,
    pub operands: [Option<LInsRef>; 3],
    pub imm: Immediate,
    pub target: Option<LInsRef>,
    pub args: Vec<LInsRef>,
}

impl LirRequest {
    pub fn new(opcode: LirOpcode) -> Self {
        Self {
            opcode,
            operands: [None; 3],
            imm: Immediate::None,
            target: None,
            args: Vec::new(),
        }
    }

    pub fn with_operands(mut self, operands: &[LInsRef]) -> Self {
        for (slot, op) in self.operands.iter_mut().zip(operands) {
            *slot = Some(*op);
        }
        self
    }

    pub fn with_imm(mut self, imm: Immediate) -> Self {
        self.imm = imm;
        self
    }

    pub fn with_target(mut self, target: Option<LInsRef>) -> Self {
        self.target = target;
        self
    }

    pub fn with_args(mut self, args: &[LInsRef]) -> Self {
        self.args = args.to_vec();
        self
    }

    pub fn imm_int(v: i32) -> Self {
        Self::new(LirOpcode::ImmI).with_imm(Immediate::Int(v))
    }

    pub fn imm_quad(v: i64) -> Self {
        Self::new(LirOpcode::ImmQ).with_imm(Immediate::Quad(v))
    }

    pub fn imm_float(v: f32) -> Self {
        Self::new(LirOpcode::ImmF).with_imm(Immediate::Float(v))
    }

    pub fn imm_double(v: f64) -> Self {
        Self::new(LirOpcode::ImmD).with_imm(Immediate::Double(v))
    }

    /// Kind of the value the committed instruction will produce.
    pub fn kind(&self) -> Option<ValueKind> {
        match (self.opcode, self.imm) {
            (LirOpcode::Param, Immediate::Param { kind, .. }) => Some(kind),
            _ => self.opcode.info().result,
        }
    }

    pub fn operand(&self, slot: usize) -> Option<LInsRef> {
        self.operands.get(slot).copied().flatten()
    }
}

/// One stage of the writer pipeline.
pub enum WriterStage<'a> {
    Validate(ValidateWriter),
    Verbose(VerboseWriter),
    Cse(CseFilter<'a>),
    Expr(ExprFilter),
    /// Terminal stage: appends to the buffer.
    Buffer,
}

impl WriterStage<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            WriterStage::Validate(_) => "validate",
            WriterStage::Verbose(_) => "verbose",
            WriterStage::Cse(_) => "cse",
            WriterStage::Expr(_) => "expr",
            WriterStage::Buffer => "buffer",
        }
    }
}

/// Walk `stages` front to back with `req`.
fn dispatch(stages: &mut [WriterStage<'_>], buf: &mut LirBuffer, req: LirRequest) -> LInsRef {
    let Some((stage, rest)) = stages.split_first_mut() else {
        unreachable!("writer pipeline without a buffer writer");
    };
    match stage {
        WriterStage::Validate(v) => {
            v.check(buf, &req);
            dispatch(rest, buf, req)
        }
        WriterStage::Verbose(v) => {
            let before = buf.len();
            let r = dispatch(rest, buf, req);
            v.record(buf, r, r.index() < before);
            r
        }
        WriterStage::Cse(cse) => {
            cse.observe(&req);
            let Some(key) = cse.key_for(&req) else {
                return dispatch(rest, buf, req);
            };
            if let Some(hit) = cse.find(&key) {
                return hit;
            }
            let r = dispatch(rest, buf, req);
            cse.insert(key, r);
            r
        }
        WriterStage::Expr(expr) => match expr.simplify(buf, req) {
            Simplified::Existing(r) => r,
            Simplified::Request(req) => dispatch(rest, buf, req),
        },
        WriterStage::Buffer => buf.append(req),
    }
}

/// Ordered list of stages owned by one function builder.
pub struct WriterPipeline<'a> {
    stages: Vec<WriterStage<'a>>,
}

impl<'a> WriterPipeline<'a> {
    /// Assemble the pipeline for a fragment whose first instruction is `first`.
    ///
    /// The CSE tables are allocated in `arena` and live as long as it does.
    pub fn new(first: LInsRef, optimize: bool, verbose: bool, arena: &'a Bump) -> Self {
        let mut stages = vec![WriterStage::Validate(ValidateWriter::new(
            "start of writer pipeline",
            first,
        ))];
        if verbose {
            stages.push(WriterStage::Verbose(VerboseWriter::new()));
        }
        if optimize {
            stages.push(WriterStage::Cse(CseFilter::new_in(arena)));
            stages.push(WriterStage::Expr(ExprFilter::new()));
            // Re-check what the optimizers produced.
            stages.push(WriterStage::Validate(ValidateWriter::new(
                "end of writer pipeline",
                first,
            )));
        }
        stages.push(WriterStage::Buffer);
        log::debug!(
            "writer pipeline: {}",
            stages.iter().map(|s| s.name()).collect::<Vec<_>>().join(" -> ")
        );
        Self { stages }
    }

    /// Send a request through every stage.
    pub fn write(&mut self, buf: &mut LirBuffer, req: LirRequest) -> LInsRef {
        dispatch(&mut self.stages, buf, req)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Lines recorded by the tracer, if one is attached.
    pub fn trace(&self) -> &[String] {
        self.stages
            .iter()
            .find_map(|s| match s {
                WriterStage::Verbose(v) => Some(v.lines()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn take_trace(&mut self) -> Vec<String> {
        self.stages
            .iter_mut()
            .find_map(|s| match s {
                WriterStage::Verbose(v) => Some(v.take_lines()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Requests answered by CSE so far.
    pub fn cse_hits(&self) -> usize {
        self.stages
            .iter()
            .map(|s| match s {
                WriterStage::Cse(c) => c.hits(),
                _ => 0,
            })
            .sum()
    }

    /// Requests rewritten or answered by the expression filter so far.
    pub fn expr_folds(&self) -> usize {
        self.stages
            .iter()
            .map(|s| match s {
                WriterStage::Expr(e) => e.folds(),
                _ => 0,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline_with_start<'a>(
        buf: &mut LirBuffer,
        optimize: bool,
        verbose: bool,
        arena: &'a Bump,
    ) -> WriterPipeline<'a> {
        let mut pipeline = WriterPipeline::new(buf.next_ref(), optimize, verbose, arena);
        pipeline.write(buf, LirRequest::new(LirOpcode::Start));
        pipeline
    }

    #[test]
    fn test_stage_order() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new();
        let plain = pipeline_with_start(&mut buf, false, false, &arena);
        assert_eq!(plain.stage_names(), vec!["validate", "buffer"]);

        let full = pipeline_with_start(&mut buf, true, true, &arena);
        assert_eq!(
            full.stage_names(),
            vec!["validate", "verbose", "cse", "expr", "validate", "buffer"]
        );
    }

    #[test]
    fn test_optimized_pipeline_dedups_and_folds() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new();
        let mut pipeline = pipeline_with_start(&mut buf, true, false, &arena);

        let a = pipeline.write(&mut buf, LirRequest::imm_int(2));
        let b = pipeline.write(&mut buf, LirRequest::imm_int(2));
        assert_eq!(a, b);
        assert_eq!(pipeline.cse_hits(), 1);

        let c = pipeline.write(&mut buf, LirRequest::imm_int(3));
        let sum = pipeline.write(&mut buf, LirRequest::new(LirOpcode::AddI).with_operands(&[a, c]));
        assert_eq!(buf.ins(sum).int_const(), Some(5));
        assert_eq!(pipeline.expr_folds(), 1);
    }

    #[test]
    fn test_plain_pipeline_appends_everything() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new();
        let mut pipeline = pipeline_with_start(&mut buf, false, false, &arena);

        let a = pipeline.write(&mut buf, LirRequest::imm_int(2));
        let b = pipeline.write(&mut buf, LirRequest::imm_int(2));
        assert_ne!(a, b);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_tracer_records_lines() {
        let arena = Bump::new();
        let mut buf = LirBuffer::new();
        let mut pipeline = pipeline_with_start(&mut buf, true, true, &arena);
        pipeline.write(&mut buf, LirRequest::imm_quad(9));
        pipeline.write(&mut buf, LirRequest::imm_quad(9));

        let trace = pipeline.take_trace();
        assert_eq!(trace.len(), 3);
        assert_eq!(trace[1], "%1 = immq 9");
        assert!(trace[2].ends_with("; reused"));
        assert!(pipeline.trace().is_empty());
    }
}
