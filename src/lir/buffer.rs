//! Shared LIR instruction buffer.
//!
//! One buffer backs every fragment built from a context. A fragment is a view
//! `[start, guard]` over it; instructions are never removed, so handles stay
//! valid until the context is dropped.

use std::fmt::Write as _;

use super::writer::LirRequest;
use super::{ArgRange, Immediate, LIns, LInsRef, LirOpcode};

#[derive(Debug, Default)]
pub struct LirBuffer {
    ins: Vec<LIns>,
    /// Call arguments, referenced by `LIns::args` ranges.
    args: Vec<LInsRef>,
}

impl LirBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ins.is_empty()
    }

    /// Handle the next appended instruction will get.
    pub fn next_ref(&self) -> LInsRef {
        LInsRef::from_index(self.ins.len())
    }

    pub fn contains(&self, r: LInsRef) -> bool {
        r.index() < self.ins.len()
    }

    /// Instruction behind a handle.
    ///
    /// Handles are only produced by this buffer, so an out-of-range handle is a
    /// caller bug and panics.
    pub fn ins(&self, r: LInsRef) -> &LIns {
        &self.ins[r.index()]
    }

    pub fn get(&self, r: LInsRef) -> Option<&LIns> {
        self.ins.get(r.index())
    }

    pub fn call_args(&self, ins: &LIns) -> &[LInsRef] {
        &self.args[ins.args.begin as usize..ins.args.end as usize]
    }

    /// Instructions in `[first, last]` with their handles.
    pub fn range(&self, first: LInsRef, last: LInsRef) -> impl Iterator<Item = (LInsRef, &LIns)> + '_ {
        let end = (last.index() + 1).min(self.ins.len());
        let begin = first.index().min(end);
        self.ins[begin..end]
            .iter()
            .enumerate()
            .map(move |(i, ins)| (LInsRef::from_index(begin + i), ins))
    }

    /// Physically commit a request. Only the terminal pipeline stage calls this.
    pub(crate) fn append(&mut self, req: LirRequest) -> LInsRef {
        let r = self.next_ref();
        let args = if req.args.is_empty() {
            ArgRange::EMPTY
        } else {
            let begin = self.args.len() as u32;
            self.args.extend_from_slice(&req.args);
            ArgRange { begin, end: self.args.len() as u32 }
        };
        self.ins.push(LIns {
            opcode: req.opcode,
            kind: req.kind(),
            operands: req.operands,
            imm: req.imm,
            target: req.target,
            args,
        });
        log::trace!("lir append {} = {}", r, req.opcode);
        r
    }

    pub(crate) fn set_target(&mut self, jmp: LInsRef, target: LInsRef) {
        self.ins[jmp.index()].target = Some(target);
    }

    /// One-line textual form of an instruction.
    pub fn format_ins(&self, r: LInsRef) -> String {
        let ins = self.ins(r);
        let mut out = String::new();
        if ins.kind.is_some() {
            let _ = write!(out, "{} = ", r);
        }
        out.push_str(ins.opcode.name());
        match ins.imm {
            Immediate::None => {}
            Immediate::Int(v) => {
                let _ = write!(out, " {}", v);
            }
            Immediate::Quad(v) => {
                let _ = write!(out, " {}", v);
            }
            Immediate::Float(v) => {
                let _ = write!(out, " {:?}", v);
            }
            Immediate::Double(v) => {
                let _ = write!(out, " {:?}", v);
            }
            Immediate::Param { index, kind } => {
                let _ = write!(out, " {} {}", index, kind);
            }
            Immediate::Size(v) => {
                let _ = write!(out, " {}", v);
            }
            Immediate::Addr(v) => {
                let _ = write!(out, " {:#x}", v);
            }
            Immediate::Disp { .. } => {}
        }
        let operands: Vec<String> = ins.operands().map(|o| o.to_string()).collect();
        if let Immediate::Disp { offset, .. } = ins.imm {
            // Loads: base[off]. Stores: value, base[off].
            match operands.as_slice() {
                [base] => {
                    let _ = write!(out, ".other {}[{}]", base, offset);
                }
                [value, base] => {
                    let _ = write!(out, ".other {}, {}[{}]", value, base, offset);
                }
                _ => {}
            }
        } else if !operands.is_empty() {
            let _ = write!(out, " {}", operands.join(", "));
        }
        if ins.opcode.is_call() {
            let args: Vec<String> = self.call_args(ins).iter().map(|a| a.to_string()).collect();
            let _ = write!(out, "({})", args.join(", "));
        }
        if ins.opcode.is_branch() {
            match ins.target {
                Some(t) => {
                    let _ = write!(out, " -> {}", t);
                }
                None => out.push_str(" -> ?"),
            }
        }
        if ins.opcode == LirOpcode::Label {
            let _ = write!(out, " {}", r);
        }
        out
    }

    /// Multi-line listing of `[first, last]`.
    pub fn listing(&self, first: LInsRef, last: LInsRef) -> String {
        let mut out = String::new();
        for (r, _) in self.range(first, last) {
            out.push_str(&self.format_ins(r));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::ValueKind;

    #[test]
    fn test_append_and_format() {
        let mut buf = LirBuffer::new();
        let a = buf.append(LirRequest::new(LirOpcode::ImmI).with_imm(Immediate::Int(7)));
        let b = buf.append(LirRequest::new(LirOpcode::ImmI).with_imm(Immediate::Int(5)));
        let sum = buf.append(LirRequest::new(LirOpcode::AddI).with_operands(&[a, b]));

        assert_eq!(buf.len(), 3);
        assert_eq!(buf.ins(sum).kind(), Some(ValueKind::I32));
        assert_eq!(buf.format_ins(a), "%0 = immi 7");
        assert_eq!(buf.format_ins(sum), "%2 = addi %0, %1");
    }

    #[test]
    fn test_call_args_pool() {
        let mut buf = LirBuffer::new();
        let a = buf.append(LirRequest::new(LirOpcode::ImmQ).with_imm(Immediate::Quad(1)));
        let call = buf.append(
            LirRequest::new(LirOpcode::CallQ)
                .with_imm(Immediate::Addr(0x1000))
                .with_args(&[a, a]),
        );
        let ins = buf.ins(call);
        assert_eq!(ins.args().len(), 2);
        assert_eq!(buf.call_args(ins), &[a, a]);
        assert_eq!(buf.format_ins(call), "%1 = callq 0x1000(%0, %0)");
    }

    #[test]
    fn test_branch_target_patch_and_range() {
        let mut buf = LirBuffer::new();
        let start = buf.append(LirRequest::new(LirOpcode::Start));
        let jmp = buf.append(LirRequest::new(LirOpcode::J));
        let label = buf.append(LirRequest::new(LirOpcode::Label));
        assert_eq!(buf.format_ins(jmp), "j -> ?");

        buf.set_target(jmp, label);
        assert_eq!(buf.ins(jmp).target(), Some(label));
        assert_eq!(buf.range(start, label).count(), 3);
        assert!(buf.listing(start, label).contains("j -> %2"));
    }
}
