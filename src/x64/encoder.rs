// This module wraps the iced-x86 CodeAssembler in the small instruction vocabulary the LIR
// code generator needs. Every LIR value lives in an RBP-relative 8-byte frame slot, so the
// encoder mostly moves values between slots and a fixed set of scratch registers (EAX/RAX,
// ECX/RCX, EDX and XMM0/XMM1), applies one operation, and writes the result back. It covers
// 32- and 64-bit integer arithmetic and shifts, integer and SSE comparisons materialized
// with SETcc, SSE scalar float arithmetic and conversions, CMOVcc selects, sized loads and
// stores through a base pointer, LEA of frame addresses, indirect calls to absolute
// addresses, and the fragment prologue, epilogue and exit sequence. Labels are keyed by the
// LIR instruction that defines them so forward and backward branches resolve the same way.
// iced-x86 rejects two labels on one instruction, so placing a label directly after another
// inserts a NOP. The final code is position independent (assembled at IP 0) because it is
// copied into executable memory afterwards.

//! x86-64 instruction encoding using iced-x86.

use hashbrown::{HashMap, HashSet};
use iced_x86::code_asm::*;
use iced_x86::IcedError;

use crate::lir::LInsRef;

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Unsupported instruction or operand combination.
    UnsupportedInstruction(&'static str),
    /// Assembly error from iced-x86.
    AssemblyError(String),
    /// A branch refers to a label that was never placed.
    UnplacedLabel(LInsRef),
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::UnsupportedInstruction(what) => {
                write!(f, "Unsupported instruction or operand combination: {what}")
            }
            EncodingError::AssemblyError(msg) => write!(f, "Assembly error: {msg}"),
            EncodingError::UnplacedLabel(r) => write!(f, "Label {r} was never placed"),
        }
    }
}

impl std::error::Error for EncodingError {}

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// Two-operand integer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Sar,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Comparison conditions. Integer comparisons are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Width and extension of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    I8Signed,
    I8Unsigned,
    I16Signed,
    I16Unsigned,
    I32,
    I64,
    F32,
    F64,
    /// Float load widened to double.
    F32ToF64,
}

/// Operand width of an integer or float operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W32,
    W64,
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
    /// Labels for LIR `label` instructions.
    labels: HashMap<LInsRef, CodeLabel>,
    /// Track which labels have been placed.
    placed: HashSet<LInsRef>,
    /// Instruction count at the most recent label placement.
    last_label_at: Option<usize>,
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;

        Ok(Self {
            assembler,
            labels: HashMap::new(),
            placed: HashSet::new(),
            last_label_at: None,
        })
    }

    fn frame(off: i32) -> AsmMemoryOperand {
        rbp + off
    }

    // ==== FRAME SLOTS ====

    /// MOV r32, [rbp + off].
    pub fn load_slot32(&mut self, dst: AsmRegister32, off: i32) -> Result<(), EncodingError> {
        self.assembler.mov(dst, dword_ptr(Self::frame(off))).map_err(asm_err)
    }

    /// MOV r64, [rbp + off].
    pub fn load_slot64(&mut self, dst: AsmRegister64, off: i32) -> Result<(), EncodingError> {
        self.assembler.mov(dst, qword_ptr(Self::frame(off))).map_err(asm_err)
    }

    pub fn store_slot32(&mut self, off: i32, src: AsmRegister32) -> Result<(), EncodingError> {
        self.assembler.mov(dword_ptr(Self::frame(off)), src).map_err(asm_err)
    }

    pub fn store_slot64(&mut self, off: i32, src: AsmRegister64) -> Result<(), EncodingError> {
        self.assembler.mov(qword_ptr(Self::frame(off)), src).map_err(asm_err)
    }

    /// MOVSS/MOVSD xmm, [rbp + off].
    pub fn load_slot_xmm(&mut self, dst: AsmRegisterXmm, off: i32, width: Width) -> Result<(), EncodingError> {
        match width {
            Width::W32 => self.assembler.movss(dst, dword_ptr(Self::frame(off))),
            Width::W64 => self.assembler.movsd_2(dst, qword_ptr(Self::frame(off))),
        }
        .map_err(asm_err)
    }

    pub fn store_slot_xmm(&mut self, off: i32, src: AsmRegisterXmm, width: Width) -> Result<(), EncodingError> {
        match width {
            Width::W32 => self.assembler.movss(dword_ptr(Self::frame(off)), src),
            Width::W64 => self.assembler.movsd_2(qword_ptr(Self::frame(off)), src),
        }
        .map_err(asm_err)
    }

    /// Store a 32-bit immediate into a slot.
    pub fn store_slot_imm32(&mut self, off: i32, imm: i32) -> Result<(), EncodingError> {
        self.assembler.mov(dword_ptr(Self::frame(off)), imm).map_err(asm_err)
    }

    /// Store a 64-bit immediate into a slot (through RAX).
    pub fn store_slot_imm64(&mut self, off: i32, imm: i64) -> Result<(), EncodingError> {
        self.mov_reg_imm(rax, imm)?;
        self.store_slot64(off, rax)
    }

    /// LEA r64, [rbp + off].
    pub fn lea_slot(&mut self, dst: AsmRegister64, off: i32) -> Result<(), EncodingError> {
        self.assembler.lea(dst, qword_ptr(Self::frame(off))).map_err(asm_err)
    }

    pub fn mov_reg_imm(&mut self, dst: AsmRegister64, imm: i64) -> Result<(), EncodingError> {
        self.assembler.mov(dst, imm).map_err(asm_err)
    }

    // ==== INTEGER OPERATIONS (EAX/RAX op= ECX/RCX) ====

    pub fn int_op(&mut self, op: IntOp, width: Width) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match width {
            Width::W32 => match op {
                IntOp::Add => a.add(eax, ecx),
                IntOp::Sub => a.sub(eax, ecx),
                IntOp::Mul => a.imul_2(eax, ecx),
                IntOp::And => a.and(eax, ecx),
                IntOp::Or => a.or(eax, ecx),
                IntOp::Xor => a.xor(eax, ecx),
            },
            Width::W64 => match op {
                IntOp::Add => a.add(rax, rcx),
                IntOp::Sub => a.sub(rax, rcx),
                IntOp::Mul => a.imul_2(rax, rcx),
                IntOp::And => a.and(rax, rcx),
                IntOp::Or => a.or(rax, rcx),
                IntOp::Xor => a.xor(rax, rcx),
            },
        }
        .map_err(asm_err)
    }

    /// Shift EAX/RAX by CL. The CPU masks the count to the operand width.
    pub fn shift(&mut self, op: ShiftOp, width: Width) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match (op, width) {
            (ShiftOp::Shl, Width::W32) => a.shl(eax, cl),
            (ShiftOp::Sar, Width::W32) => a.sar(eax, cl),
            (ShiftOp::Shr, Width::W32) => a.shr(eax, cl),
            (ShiftOp::Shl, Width::W64) => a.shl(rax, cl),
            (ShiftOp::Sar, Width::W64) => a.sar(rax, cl),
            (ShiftOp::Shr, Width::W64) => a.shr(rax, cl),
        }
        .map_err(asm_err)
    }

    /// EAX = (EAX/RAX cond ECX/RCX) as 0 or 1.
    pub fn compare_int(&mut self, cond: Cond, width: Width) -> Result<(), EncodingError> {
        match width {
            Width::W32 => self.assembler.cmp(eax, ecx),
            Width::W64 => self.assembler.cmp(rax, rcx),
        }
        .map_err(asm_err)?;
        match cond {
            Cond::Eq => self.assembler.sete(al),
            Cond::Lt => self.assembler.setl(al),
            Cond::Gt => self.assembler.setg(al),
            Cond::Le => self.assembler.setle(al),
            Cond::Ge => self.assembler.setge(al),
        }
        .map_err(asm_err)?;
        self.assembler.movzx(eax, al).map_err(asm_err)
    }

    /// EAX/RAX = EDX != 0 ? EAX/RAX : ECX/RCX.
    pub fn select(&mut self, width: Width) -> Result<(), EncodingError> {
        self.assembler.test(edx, edx).map_err(asm_err)?;
        match width {
            Width::W32 => self.assembler.cmove(eax, ecx),
            Width::W64 => self.assembler.cmove(rax, rcx),
        }
        .map_err(asm_err)
    }

    // ==== FLOAT OPERATIONS (XMM0 op= XMM1) ====

    pub fn float_op(&mut self, op: FloatOp, width: Width) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match width {
            Width::W32 => match op {
                FloatOp::Add => a.addss(xmm0, xmm1),
                FloatOp::Sub => a.subss(xmm0, xmm1),
                FloatOp::Mul => a.mulss(xmm0, xmm1),
                FloatOp::Div => a.divss(xmm0, xmm1),
            },
            Width::W64 => match op {
                FloatOp::Add => a.addsd(xmm0, xmm1),
                FloatOp::Sub => a.subsd(xmm0, xmm1),
                FloatOp::Mul => a.mulsd(xmm0, xmm1),
                FloatOp::Div => a.divsd(xmm0, xmm1),
            },
        }
        .map_err(asm_err)
    }

    fn ucomis(&mut self, lhs: AsmRegisterXmm, rhs: AsmRegisterXmm, width: Width) -> Result<(), EncodingError> {
        match width {
            Width::W32 => self.assembler.ucomiss(lhs, rhs),
            Width::W64 => self.assembler.ucomisd(lhs, rhs),
        }
        .map_err(asm_err)
    }

    /// EAX = (XMM0 cond XMM1) as 0 or 1. Any comparison with NaN is false.
    pub fn compare_float(&mut self, cond: Cond, width: Width) -> Result<(), EncodingError> {
        match cond {
            Cond::Eq => {
                // ZF=1 and PF=0
                self.ucomis(xmm0, xmm1, width)?;
                self.assembler.sete(al).map_err(asm_err)?;
                self.assembler.setnp(cl).map_err(asm_err)?;
                self.assembler.and(al, cl).map_err(asm_err)?;
            }
            // a < b as b > a, so unordered (CF=1) gives false.
            Cond::Lt => {
                self.ucomis(xmm1, xmm0, width)?;
                self.assembler.seta(al).map_err(asm_err)?;
            }
            Cond::Le => {
                self.ucomis(xmm1, xmm0, width)?;
                self.assembler.setae(al).map_err(asm_err)?;
            }
            Cond::Gt => {
                self.ucomis(xmm0, xmm1, width)?;
                self.assembler.seta(al).map_err(asm_err)?;
            }
            Cond::Ge => {
                self.ucomis(xmm0, xmm1, width)?;
                self.assembler.setae(al).map_err(asm_err)?;
            }
        }
        self.assembler.movzx(eax, al).map_err(asm_err)
    }

    // ==== CONVERSIONS ====

    /// RAX = sign-extended EAX.
    pub fn sign_extend(&mut self) -> Result<(), EncodingError> {
        self.assembler.movsxd(rax, eax).map_err(asm_err)
    }

    /// XMM0 = (double) EAX.
    pub fn int_to_double(&mut self) -> Result<(), EncodingError> {
        self.assembler.cvtsi2sd(xmm0, eax).map_err(asm_err)
    }

    /// EAX = (int) XMM0, truncating. NaN and out-of-range give 0x80000000.
    pub fn double_to_int(&mut self) -> Result<(), EncodingError> {
        self.assembler.cvttsd2si(eax, xmm0).map_err(asm_err)
    }

    pub fn float_to_double(&mut self) -> Result<(), EncodingError> {
        self.assembler.cvtss2sd(xmm0, xmm0).map_err(asm_err)
    }

    pub fn double_to_float(&mut self) -> Result<(), EncodingError> {
        self.assembler.cvtsd2ss(xmm0, xmm0).map_err(asm_err)
    }

    // ==== MEMORY THROUGH A BASE POINTER IN RAX ====

    /// Load `[rax + disp]` into ECX, RCX or XMM0 depending on `access`.
    pub fn load_mem(&mut self, access: MemAccess, disp: i32) -> Result<(), EncodingError> {
        let addr = rax + disp;
        let a = &mut self.assembler;
        match access {
            MemAccess::I8Signed => a.movsx(ecx, byte_ptr(addr)),
            MemAccess::I8Unsigned => a.movzx(ecx, byte_ptr(addr)),
            MemAccess::I16Signed => a.movsx(ecx, word_ptr(addr)),
            MemAccess::I16Unsigned => a.movzx(ecx, word_ptr(addr)),
            MemAccess::I32 => a.mov(ecx, dword_ptr(addr)),
            MemAccess::I64 => a.mov(rcx, qword_ptr(addr)),
            MemAccess::F32 => a.movss(xmm0, dword_ptr(addr)),
            MemAccess::F64 => a.movsd_2(xmm0, qword_ptr(addr)),
            MemAccess::F32ToF64 => {
                a.movss(xmm0, dword_ptr(addr)).map_err(asm_err)?;
                a.cvtss2sd(xmm0, xmm0)
            }
        }
        .map_err(asm_err)
    }

    /// Store ECX, RCX or XMM0 to `[rax + disp]`.
    pub fn store_mem(&mut self, access: MemAccess, disp: i32) -> Result<(), EncodingError> {
        let addr = rax + disp;
        let a = &mut self.assembler;
        match access {
            MemAccess::I8Signed | MemAccess::I8Unsigned => a.mov(byte_ptr(addr), cl),
            MemAccess::I16Signed | MemAccess::I16Unsigned => a.mov(word_ptr(addr), cx),
            MemAccess::I32 => a.mov(dword_ptr(addr), ecx),
            MemAccess::I64 => a.mov(qword_ptr(addr), rcx),
            MemAccess::F32 => a.movss(dword_ptr(addr), xmm0),
            MemAccess::F64 => a.movsd_2(qword_ptr(addr), xmm0),
            MemAccess::F32ToF64 => return Err(EncodingError::UnsupportedInstruction("widening store")),
        }
        .map_err(asm_err)
    }

    // ==== CALLS, FRAME AND EXITS ====

    /// Call an absolute address through RAX.
    pub fn call_abs(&mut self, addr: usize) -> Result<(), EncodingError> {
        self.mov_reg_imm(rax, addr as i64)?;
        self.assembler.call(rax).map_err(asm_err)
    }

    /// Generate prologue for a fragment.
    pub fn emit_prologue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        self.assembler.push(rbp).map_err(asm_err)?;
        self.assembler.mov(rbp, rsp).map_err(asm_err)?;
        if frame_size > 0 {
            self.assembler.sub(rsp, frame_size as i32).map_err(asm_err)?;
        }
        Ok(())
    }

    /// Generate epilogue: LEAVE; RET.
    pub fn emit_epilogue(&mut self) -> Result<(), EncodingError> {
        self.assembler.leave().map_err(asm_err)?;
        self.assembler.ret().map_err(asm_err)
    }

    /// Leave the fragment with zeroed return registers.
    pub fn emit_exit(&mut self) -> Result<(), EncodingError> {
        self.assembler.xor(eax, eax).map_err(asm_err)?;
        self.assembler.xorps(xmm0, xmm0).map_err(asm_err)?;
        self.emit_epilogue()
    }

    // ==== LABEL MANAGEMENT FOR CONTROL FLOW ====

    /// Create or get the label of a LIR `label` instruction.
    pub fn label_for(&mut self, r: LInsRef) -> CodeLabel {
        if let Some(&label) = self.labels.get(&r) {
            label
        } else {
            let label = self.assembler.create_label();
            self.labels.insert(r, label);
            label
        }
    }

    /// Place the label of `r` at the current position.
    pub fn place_label_for(&mut self, r: LInsRef) -> Result<(), EncodingError> {
        let mut label = self.label_for(r);
        self.place(&mut label)?;
        self.placed.insert(r);
        Ok(())
    }

    /// A label private to the code generator.
    pub fn new_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    pub fn place(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        let count = self.assembler.instructions().len();
        if self.last_label_at == Some(count) {
            self.nop()?;
        }
        self.assembler.set_label(label).map_err(asm_err)?;
        self.last_label_at = Some(self.assembler.instructions().len());
        Ok(())
    }

    pub fn is_placed(&self, r: LInsRef) -> bool {
        self.placed.contains(&r)
    }

    pub fn jmp(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.jmp(label).map_err(asm_err)
    }

    /// Jump to `label` when EAX is non-zero (`when_true`) or zero.
    pub fn branch_on_eax(&mut self, when_true: bool, label: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.test(eax, eax).map_err(asm_err)?;
        if when_true {
            self.assembler.jne(label)
        } else {
            self.assembler.je(label)
        }
        .map_err(asm_err)
    }

    /// Emit a NOP instruction.
    pub fn nop(&mut self) -> Result<(), EncodingError> {
        self.assembler.nop().map_err(asm_err)
    }

    /// Generate the final machine code bytes.
    pub fn finalize(&mut self) -> Result<Vec<u8>, EncodingError> {
        if let Some(r) = self.labels.keys().find(|r| !self.is_placed(**r)) {
            return Err(EncodingError::UnplacedLabel(*r));
        }
        self.assembler.assemble(0).map_err(asm_err)
    }
}

/// NASM-syntax listing of `code`, one line per instruction, addressed from `ip`.
pub fn listing(code: &[u8], ip: u64) -> Vec<String> {
    use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};

    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    let mut instruction = Instruction::default();
    let mut text = String::new();
    let mut lines = Vec::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        text.clear();
        formatter.format(&instruction, &mut text);
        lines.push(format!("{:016X} {}", instruction.ip(), text));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prologue_epilogue() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.emit_prologue(32).unwrap();
        encoder.emit_epilogue().unwrap();

        let code = encoder.finalize().unwrap();
        // push rbp; mov rbp,rsp; sub rsp,32; leave; ret
        assert_eq!(code[0], 0x55);
        assert_eq!(*code.last().unwrap(), 0xC3);
        let text = listing(&code, 0).join("\n");
        assert!(text.contains("push rbp"));
        assert!(text.contains("leave"));
    }

    #[test]
    fn test_consecutive_labels_get_separate_instructions() {
        let mut encoder = X64Encoder::new().unwrap();
        let first = LInsRef::from_index(1);
        let second = LInsRef::from_index(2);
        let target = encoder.label_for(second);
        encoder.jmp(target).unwrap();
        encoder.place_label_for(first).unwrap();
        encoder.place_label_for(second).unwrap();
        encoder.emit_exit().unwrap();

        assert!(encoder.is_placed(first) && encoder.is_placed(second));
        let code = encoder.finalize().unwrap();
        assert!(listing(&code, 0).iter().any(|l| l.ends_with("nop")));
    }

    #[test]
    fn test_unplaced_label_is_an_error() {
        let mut encoder = X64Encoder::new().unwrap();
        let target = encoder.label_for(LInsRef::from_index(7));
        encoder.jmp(target).unwrap();
        encoder.emit_exit().unwrap();
        assert_eq!(
            encoder.finalize(),
            Err(EncodingError::UnplacedLabel(LInsRef::from_index(7)))
        );
    }

    #[test]
    fn test_arithmetic_and_compare_encoding() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.emit_prologue(16).unwrap();
        encoder.load_slot32(eax, -8).unwrap();
        encoder.load_slot32(ecx, -16).unwrap();
        encoder.int_op(IntOp::Mul, Width::W32).unwrap();
        encoder.compare_int(Cond::Le, Width::W64).unwrap();
        encoder.load_slot_xmm(xmm0, -8, Width::W64).unwrap();
        encoder.load_slot_xmm(xmm1, -16, Width::W64).unwrap();
        encoder.compare_float(Cond::Eq, Width::W64).unwrap();
        encoder.emit_exit().unwrap();

        let text = listing(&encoder.finalize().unwrap(), 0).join("\n");
        assert!(text.contains("imul eax,ecx"));
        assert!(text.contains("setle al"));
        assert!(text.contains("ucomisd xmm0,xmm1"));
        assert!(text.contains("setnp cl"));
    }
}
