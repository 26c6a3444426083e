//! Structural checks on emission requests.
//!
//! A failed check means the builder API was misused (wrong operand kind,
//! missing operand, reference into another fragment). That is a programming
//! error, so the validator panics instead of returning an error.

use super::writer::LirRequest;
use super::{Immediate, LInsRef, LirBuffer, LirOpcode, OpClass, ValueKind};

pub struct ValidateWriter {
    whereami: &'static str,
    /// First instruction of the fragment being built.
    first: LInsRef,
}

impl ValidateWriter {
    pub fn new(whereami: &'static str, first: LInsRef) -> Self {
        Self { whereami, first }
    }

    pub fn whereami(&self) -> &'static str {
        self.whereami
    }

    /// Check one request against the opcode table and the buffer.
    pub fn check(&self, buf: &LirBuffer, req: &LirRequest) {
        let info = req.opcode.info();

        for (slot, expected) in info.operands.iter().enumerate() {
            match (expected, req.operands[slot]) {
                (Some(kind), Some(r)) => self.check_value(buf, req.opcode, slot, r, Some(*kind)),
                (Some(_), None) => self.fail(req.opcode, format_args!("operand {} is missing", slot)),
                (None, Some(r)) => {
                    self.fail(req.opcode, format_args!("unexpected operand {} ({})", slot, r))
                }
                (None, None) => {}
            }
        }

        self.check_imm(req);

        if req.opcode.is_call() {
            for (i, arg) in req.args.iter().enumerate() {
                self.check_value(buf, req.opcode, i, *arg, None);
            }
        } else if !req.args.is_empty() {
            self.fail(req.opcode, format_args!("argument list on a non-call"));
        }

        if let Some(target) = req.target {
            if !req.opcode.is_branch() {
                self.fail(req.opcode, format_args!("branch target on a non-branch"));
            }
            self.check_label(buf, req.opcode, target);
        }
    }

    /// A branch target must be a label of the fragment being built.
    pub fn check_label(&self, buf: &LirBuffer, opcode: LirOpcode, target: LInsRef) {
        self.check_local(buf, opcode, target);
        if !buf.ins(target).is_label() {
            self.fail(
                opcode,
                format_args!("branch target {} is {}, not a label", target, buf.ins(target).opcode()),
            );
        }
    }

    fn check_local(&self, buf: &LirBuffer, opcode: LirOpcode, r: LInsRef) {
        if !buf.contains(r) {
            self.fail(opcode, format_args!("{} does not exist", r));
        }
        if r < self.first {
            self.fail(opcode, format_args!("{} belongs to another fragment", r));
        }
    }

    /// `expected == None` accepts any value kind (call arguments).
    fn check_value(
        &self,
        buf: &LirBuffer,
        opcode: LirOpcode,
        slot: usize,
        r: LInsRef,
        expected: Option<ValueKind>,
    ) {
        self.check_local(buf, opcode, r);
        let Some(actual) = buf.ins(r).kind() else {
            self.fail(
                opcode,
                format_args!("operand {} ({} = {}) produces no value", slot, r, buf.ins(r).opcode()),
            );
        };
        if let Some(expected) = expected {
            if actual != expected {
                self.fail(
                    opcode,
                    format_args!("operand {} ({}) is {}, expected {}", slot, r, actual, expected),
                );
            }
        }
    }

    fn check_imm(&self, req: &LirRequest) {
        use LirOpcode::*;
        let ok = match req.opcode {
            ImmI => matches!(req.imm, Immediate::Int(_)),
            ImmQ => matches!(req.imm, Immediate::Quad(_)),
            ImmF => matches!(req.imm, Immediate::Float(_)),
            ImmD => matches!(req.imm, Immediate::Double(_)),
            Param => matches!(req.imm, Immediate::Param { .. }),
            Alloc => matches!(req.imm, Immediate::Size(n) if n > 0),
            _ => match req.opcode.info().class {
                OpClass::Load | OpClass::Store => matches!(req.imm, Immediate::Disp { .. }),
                OpClass::Call => matches!(req.imm, Immediate::Addr(a) if a != 0),
                _ => matches!(req.imm, Immediate::None),
            },
        };
        if !ok {
            self.fail(req.opcode, format_args!("bad immediate {:?}", req.imm));
        }
    }

    fn fail(&self, opcode: LirOpcode, what: std::fmt::Arguments<'_>) -> ! {
        log::error!("LIR check failed at {}: {}: {}", self.whereami, opcode, what);
        panic!("LIR check failed at {}: {}: {}", self.whereami, opcode, what);
    }
}
