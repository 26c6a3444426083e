// This module defines the low-level intermediate representation (LIR) that the function
// builder emits. An LIns is an immutable node: an opcode from a closed enumeration, up to
// three value operands referring to earlier instructions, an immediate payload (constant,
// displacement, parameter slot, stack size or call address), and for calls a range into
// the buffer's argument pool. The opcode table (LirOpcode::info) is the single source of
// truth for arity, operand kinds, result kind and side-effect class; the validator, CSE
// filter, expression filter and x86-64 code generator all dispatch on it. Instructions
// are addressed only through LInsRef, a plain index into the shared LirBuffer owned by
// the JIT context, so handles stay valid for the lifetime of that context.

//! LIR instruction model.
//!
//! The writer pipeline lives in [`writer`]; the individual stages are in
//! [`validate`], [`verbose`], [`cse`] and [`expr`].

use std::fmt;

pub mod buffer;
pub mod cse;
pub mod expr;
pub mod validate;
pub mod verbose;
pub mod writer;

pub use buffer::LirBuffer;
pub use writer::{LirRequest, WriterPipeline, WriterStage};

/// Access-region set carried by every load and store.
pub type AccSet = u8;

/// The only access region. All memory operations are assumed to alias.
pub const ACC_OTHER: AccSet = 1 << 0;

/// Value kind produced by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// 32-bit integer.
    I32,
    /// 64-bit integer, also used for pointers.
    I64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl ValueKind {
    pub const fn is_int(self) -> bool {
        matches!(self, ValueKind::I32 | ValueKind::I64)
    }

    pub const fn is_float(self) -> bool {
        matches!(self, ValueKind::F32 | ValueKind::F64)
    }

    /// Size of a value of this kind in bytes.
    pub const fn size(self) -> u32 {
        match self {
            ValueKind::I32 | ValueKind::F32 => 4,
            ValueKind::I64 | ValueKind::F64 => 8,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::I32 => "int",
            ValueKind::I64 => "quad",
            ValueKind::F32 => "float",
            ValueKind::F64 => "double",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque handle to an instruction in a [`LirBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LInsRef(u32);

impl LInsRef {
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Position of the instruction in the shared buffer.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LInsRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Half-open range into the buffer's call-argument pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArgRange {
    pub begin: u32,
    pub end: u32,
}

impl ArgRange {
    pub const EMPTY: ArgRange = ArgRange { begin: 0, end: 0 };

    pub const fn len(&self) -> usize {
        (self.end - self.begin) as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

/// Immediate payload of an instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    None,
    Int(i32),
    Quad(i64),
    Float(f32),
    Double(f64),
    /// Positional parameter slot.
    Param { index: u32, kind: ValueKind },
    /// Memory displacement plus access region.
    Disp { offset: i32, acc: AccSet },
    /// Stack allocation size in bytes.
    Size(u32),
    /// Absolute native call target.
    Addr(usize),
}

impl Immediate {
    /// Bit pattern used for hashing and identity comparison.
    ///
    /// Floats compare by representation so `0.0` and `-0.0` stay distinct.
    pub fn key_bits(&self) -> u64 {
        match *self {
            Immediate::None => 0,
            Immediate::Int(v) => v as u32 as u64,
            Immediate::Quad(v) => v as u64,
            Immediate::Float(v) => v.to_bits() as u64,
            Immediate::Double(v) => v.to_bits(),
            Immediate::Param { index, .. } => index as u64,
            Immediate::Disp { offset, acc } => (offset as u32 as u64) | ((acc as u64) << 32),
            Immediate::Size(v) => v as u64,
            Immediate::Addr(v) => v as u64,
        }
    }
}

/// Side-effect class of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// `start`, `label`: positions with no value.
    Marker,
    Const,
    Param,
    /// Pure value computation.
    Pure,
    Load,
    Store,
    Branch,
    Call,
    Return,
    Guard,
    Alloc,
}

/// Static description of an opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub class: OpClass,
    /// Result kind, `None` for instructions that produce no value.
    pub result: Option<ValueKind>,
    /// Required kind of each value operand slot.
    pub operands: [Option<ValueKind>; 3],
}

impl OpInfo {
    /// Number of fixed value operands.
    pub const fn arity(&self) -> usize {
        let mut n = 0;
        let mut i = 0;
        while i < 3 {
            if self.operands[i].is_some() {
                n += 1;
            }
            i += 1;
        }
        n
    }

    /// Pure value producers are the only CSE candidates.
    pub const fn is_pure(&self) -> bool {
        matches!(self.class, OpClass::Const | OpClass::Pure)
    }

    pub const fn has_side_effect(&self) -> bool {
        matches!(
            self.class,
            OpClass::Store | OpClass::Call | OpClass::Guard | OpClass::Return | OpClass::Branch
        )
    }
}

const N: Option<ValueKind> = None;
const I: Option<ValueKind> = Some(ValueKind::I32);
const Q: Option<ValueKind> = Some(ValueKind::I64);
const F: Option<ValueKind> = Some(ValueKind::F32);
const D: Option<ValueKind> = Some(ValueKind::F64);

const fn op(
    name: &'static str,
    class: OpClass,
    result: Option<ValueKind>,
    operands: [Option<ValueKind>; 3],
) -> OpInfo {
    OpInfo { name, class, result, operands }
}

const fn bin(name: &'static str, kind: Option<ValueKind>) -> OpInfo {
    op(name, OpClass::Pure, kind, [kind, kind, N])
}

const fn cmp(name: &'static str, kind: Option<ValueKind>) -> OpInfo {
    op(name, OpClass::Pure, I, [kind, kind, N])
}

const fn cvt(name: &'static str, from: Option<ValueKind>, to: Option<ValueKind>) -> OpInfo {
    op(name, OpClass::Pure, to, [from, N, N])
}

const fn load(name: &'static str, kind: Option<ValueKind>) -> OpInfo {
    op(name, OpClass::Load, kind, [Q, N, N])
}

const fn store(name: &'static str, kind: Option<ValueKind>) -> OpInfo {
    op(name, OpClass::Store, N, [kind, Q, N])
}

/// LIR opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LirOpcode {
    Start,
    ImmI,
    ImmQ,
    ImmF,
    ImmD,
    Param,
    AddI,
    SubI,
    MulI,
    AndI,
    OrI,
    XorI,
    LshI,
    RshI,
    RshuI,
    AddQ,
    SubQ,
    MulQ,
    AndQ,
    OrQ,
    XorQ,
    LshQ,
    RshQ,
    RshuQ,
    AddF,
    SubF,
    MulF,
    DivF,
    AddD,
    SubD,
    MulD,
    DivD,
    EqI,
    LtI,
    GtI,
    LeI,
    GeI,
    EqQ,
    LtQ,
    GtQ,
    LeQ,
    GeQ,
    EqF,
    LtF,
    GtF,
    LeF,
    GeF,
    EqD,
    LtD,
    GtD,
    LeD,
    GeD,
    Q2I,
    I2Q,
    UI2UQ,
    I2D,
    D2I,
    F2D,
    D2F,
    CmovI,
    CmovQ,
    LdC2I,
    LdUC2UI,
    LdS2I,
    LdUS2UI,
    LdI,
    LdQ,
    LdF,
    LdD,
    LdF2D,
    StI2C,
    StI2S,
    StI,
    StQ,
    StF,
    StD,
    Label,
    J,
    JT,
    JF,
    CallI,
    CallQ,
    CallF,
    CallD,
    CallV,
    RetI,
    RetQ,
    RetD,
    Ret,
    X,
    XT,
    XF,
    Alloc,
}

impl LirOpcode {
    pub const fn info(self) -> OpInfo {
        use LirOpcode::*;
        match self {
            Start => op("start", OpClass::Marker, N, [N, N, N]),
            ImmI => op("immi", OpClass::Const, I, [N, N, N]),
            ImmQ => op("immq", OpClass::Const, Q, [N, N, N]),
            ImmF => op("immf", OpClass::Const, F, [N, N, N]),
            ImmD => op("immd", OpClass::Const, D, [N, N, N]),
            // The kind of a parameter lives in its immediate.
            Param => op("param", OpClass::Param, N, [N, N, N]),
            AddI => bin("addi", I),
            SubI => bin("subi", I),
            MulI => bin("muli", I),
            AndI => bin("andi", I),
            OrI => bin("ori", I),
            XorI => bin("xori", I),
            LshI => bin("lshi", I),
            RshI => bin("rshi", I),
            RshuI => bin("rshui", I),
            AddQ => bin("addq", Q),
            SubQ => bin("subq", Q),
            MulQ => bin("mulq", Q),
            AndQ => bin("andq", Q),
            OrQ => bin("orq", Q),
            XorQ => bin("xorq", Q),
            LshQ => op("lshq", OpClass::Pure, Q, [Q, I, N]),
            RshQ => op("rshq", OpClass::Pure, Q, [Q, I, N]),
            RshuQ => op("rshuq", OpClass::Pure, Q, [Q, I, N]),
            AddF => bin("addf", F),
            SubF => bin("subf", F),
            MulF => bin("mulf", F),
            DivF => bin("divf", F),
            AddD => bin("addd", D),
            SubD => bin("subd", D),
            MulD => bin("muld", D),
            DivD => bin("divd", D),
            EqI => cmp("eqi", I),
            LtI => cmp("lti", I),
            GtI => cmp("gti", I),
            LeI => cmp("lei", I),
            GeI => cmp("gei", I),
            EqQ => cmp("eqq", Q),
            LtQ => cmp("ltq", Q),
            GtQ => cmp("gtq", Q),
            LeQ => cmp("leq", Q),
            GeQ => cmp("geq", Q),
            EqF => cmp("eqf", F),
            LtF => cmp("ltf", F),
            GtF => cmp("gtf", F),
            LeF => cmp("lef", F),
            GeF => cmp("gef", F),
            EqD => cmp("eqd", D),
            LtD => cmp("ltd", D),
            GtD => cmp("gtd", D),
            LeD => cmp("led", D),
            GeD => cmp("ged", D),
            Q2I => cvt("q2i", Q, I),
            I2Q => cvt("i2q", I, Q),
            UI2UQ => cvt("ui2uq", I, Q),
            I2D => cvt("i2d", I, D),
            D2I => cvt("d2i", D, I),
            F2D => cvt("f2d", F, D),
            D2F => cvt("d2f", D, F),
            CmovI => op("cmovi", OpClass::Pure, I, [I, I, I]),
            CmovQ => op("cmovq", OpClass::Pure, Q, [I, Q, Q]),
            LdC2I => load("ldc2i", I),
            LdUC2UI => load("lduc2ui", I),
            LdS2I => load("lds2i", I),
            LdUS2UI => load("ldus2ui", I),
            LdI => load("ldi", I),
            LdQ => load("ldq", Q),
            LdF => load("ldf", F),
            LdD => load("ldd", D),
            LdF2D => load("ldf2d", D),
            StI2C => store("sti2c", I),
            StI2S => store("sti2s", I),
            StI => store("sti", I),
            StQ => store("stq", Q),
            StF => store("stf", F),
            StD => store("std", D),
            Label => op("label", OpClass::Marker, N, [N, N, N]),
            J => op("j", OpClass::Branch, N, [N, N, N]),
            JT => op("jt", OpClass::Branch, N, [I, N, N]),
            JF => op("jf", OpClass::Branch, N, [I, N, N]),
            CallI => op("calli", OpClass::Call, I, [N, N, N]),
            CallQ => op("callq", OpClass::Call, Q, [N, N, N]),
            CallF => op("callf", OpClass::Call, F, [N, N, N]),
            CallD => op("calld", OpClass::Call, D, [N, N, N]),
            CallV => op("callv", OpClass::Call, N, [N, N, N]),
            RetI => op("reti", OpClass::Return, N, [I, N, N]),
            RetQ => op("retq", OpClass::Return, N, [Q, N, N]),
            RetD => op("retd", OpClass::Return, N, [D, N, N]),
            Ret => op("ret", OpClass::Return, N, [N, N, N]),
            X => op("x", OpClass::Guard, N, [N, N, N]),
            XT => op("xt", OpClass::Guard, N, [I, N, N]),
            XF => op("xf", OpClass::Guard, N, [I, N, N]),
            Alloc => op("alloc", OpClass::Alloc, Q, [N, N, N]),
        }
    }

    pub const fn name(self) -> &'static str {
        self.info().name
    }

    pub const fn is_branch(self) -> bool {
        matches!(self, LirOpcode::J | LirOpcode::JT | LirOpcode::JF)
    }

    pub const fn is_call(self) -> bool {
        matches!(self.info().class, OpClass::Call)
    }

    /// Call opcode returning a value of `kind`, or nothing.
    pub const fn call_for(kind: Option<ValueKind>) -> LirOpcode {
        match kind {
            Some(ValueKind::I32) => LirOpcode::CallI,
            Some(ValueKind::I64) => LirOpcode::CallQ,
            Some(ValueKind::F32) => LirOpcode::CallF,
            Some(ValueKind::F64) => LirOpcode::CallD,
            None => LirOpcode::CallV,
        }
    }
}

impl fmt::Display for LirOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An emitted LIR instruction.
///
/// Only the branch target of `j`/`jt`/`jf` may change after emission, and only
/// through `FunctionBuilder::set_jmp_target`.
#[derive(Debug, Clone, PartialEq)]
pub struct LIns {
    pub(crate) opcode: LirOpcode,
    pub(crate) kind: Option<ValueKind>,
    pub(crate) operands: [Option<LInsRef>; 3],
    pub(crate) imm: Immediate,
    pub(crate) target: Option<LInsRef>,
    pub(crate) args: ArgRange,
}

impl LIns {
    pub fn opcode(&self) -> LirOpcode {
        self.opcode
    }

    /// Kind of the value this instruction produces.
    pub fn kind(&self) -> Option<ValueKind> {
        self.kind
    }

    pub fn operand(&self, slot: usize) -> Option<LInsRef> {
        self.operands.get(slot).copied().flatten()
    }

    pub fn operands(&self) -> impl Iterator<Item = LInsRef> + '_ {
        self.operands.iter().filter_map(|o| *o)
    }

    pub fn imm(&self) -> Immediate {
        self.imm
    }

    pub fn target(&self) -> Option<LInsRef> {
        self.target
    }

    pub fn args(&self) -> ArgRange {
        self.args
    }

    pub fn is_i(&self) -> bool {
        self.kind == Some(ValueKind::I32)
    }

    pub fn is_q(&self) -> bool {
        self.kind == Some(ValueKind::I64)
    }

    pub fn is_f(&self) -> bool {
        self.kind == Some(ValueKind::F32)
    }

    pub fn is_d(&self) -> bool {
        self.kind == Some(ValueKind::F64)
    }

    pub fn is_label(&self) -> bool {
        self.opcode == LirOpcode::Label
    }

    pub fn int_const(&self) -> Option<i32> {
        match (self.opcode, self.imm) {
            (LirOpcode::ImmI, Immediate::Int(v)) => Some(v),
            _ => None,
        }
    }

    pub fn quad_const(&self) -> Option<i64> {
        match (self.opcode, self.imm) {
            (LirOpcode::ImmQ, Immediate::Quad(v)) => Some(v),
            _ => None,
        }
    }

    pub fn float_const(&self) -> Option<f32> {
        match (self.opcode, self.imm) {
            (LirOpcode::ImmF, Immediate::Float(v)) => Some(v),
            _ => None,
        }
    }

    pub fn double_const(&self) -> Option<f64> {
        match (self.opcode, self.imm) {
            (LirOpcode::ImmD, Immediate::Double(v)) => Some(v),
            _ => None,
        }
    }
}
