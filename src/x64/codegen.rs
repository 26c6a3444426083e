// This module turns the LIR of one fragment into x86-64 machine code and installs it in
// executable memory. X64CodeGenerator runs in three steps. The frame pass walks the
// fragment once: every value-producing instruction gets an 8-byte slot in the FunctionFrame,
// every `alloc` also gets a 16-byte aligned block, parameters are assigned System V argument
// registers by SysVAssigner, and every branch is checked to have a target that is a label
// of the same fragment. A frame larger than the configured maximum is rejected before any
// code is emitted. The lowering pass then emits a standard RBP frame, copies the parameter
// registers into their slots, and lowers each instruction with the X64Encoder by loading
// operands from their slots into scratch registers, applying the operation and storing the
// result back. Calls load their arguments straight into the argument registers and store
// the result from RAX or XMM0. Guards leave through the shared exit sequence. Finally the
// assembled bytes are copied into the context's code memory; with a verbose context the
// native listing is written to the log.

//! x86-64 code generation for LIR fragments.

use bumpalo::Bump;
use hashbrown::HashMap;
use iced_x86::code_asm::*;

use crate::core::context::JitConfig;
use crate::core::error::{CodegenError, CodegenResult};
use crate::core::fragment::EntryPoint;
use crate::lir::{Immediate, LIns, LInsRef, LirBuffer, LirOpcode, ValueKind};
use crate::x64::calling_convention::{ArgReg, CCAssigner, FunctionFrame, RegBank, SysVAssigner};
use crate::x64::code_alloc::CodeAlloc;
use crate::x64::encoder::{listing, Cond, FloatOp, IntOp, MemAccess, ShiftOp, Width, X64Encoder};

/// Machine code of one fragment.
#[derive(Debug, Clone, Copy)]
pub struct CompiledCode {
    pub entry: EntryPoint,
    pub size: usize,
}

/// Compiles LIR fragments for x86-64 System V targets.
pub struct X64CodeGenerator<'a> {
    config: &'a JitConfig,
    arena: &'a Bump,
}

impl<'a> X64CodeGenerator<'a> {
    pub fn new(config: &'a JitConfig, arena: &'a Bump) -> Self {
        Self { config, arena }
    }

    /// Compile the instructions `[first, last]` of `buf` and install the code.
    pub fn compile(
        &self,
        buf: &LirBuffer,
        first: LInsRef,
        last: LInsRef,
        code_alloc: &mut CodeAlloc,
    ) -> CodegenResult<CompiledCode> {
        let count = last.index() + 1 - first.index();
        let mut lowering = FragmentLowering {
            buf,
            first,
            last,
            frame: FunctionFrame::new(self.arena, first, count, self.config.max_frame_size),
            blocks: HashMap::new(),
            call_args: SysVAssigner::new(),
            enc: X64Encoder::new()?,
        };

        lowering.layout_frame()?;

        lowering.emit_prologue()?;
        for (r, ins) in buf.range(first, last) {
            lowering.lower(r, ins)?;
        }
        let code = lowering.enc.finalize()?;

        let ptr = code_alloc.install(&code)?;
        if self.config.verbose {
            for line in listing(&code, ptr.as_ptr() as u64) {
                log::info!(target: "lirjit::x64", "{}", line);
            }
        }
        log::debug!(
            "compiled {} LIR instructions into {} bytes (frame {} bytes)",
            count,
            code.len(),
            lowering.frame.frame_size
        );

        Ok(CompiledCode {
            entry: EntryPoint::new(ptr),
            size: code.len(),
        })
    }
}

/// State of one fragment's compilation.
struct FragmentLowering<'a, 'b> {
    buf: &'b LirBuffer,
    first: LInsRef,
    last: LInsRef,
    frame: FunctionFrame<'a>,
    /// Frame offset of each `alloc` block.
    blocks: HashMap<LInsRef, i32>,
    /// Argument assignment, reset for every call.
    call_args: SysVAssigner,
    enc: X64Encoder,
}

impl FragmentLowering<'_, '_> {
    // ==== FRAME PASS ====

    fn layout_frame(&mut self) -> CodegenResult<()> {
        let buf = self.buf;
        let mut params = SysVAssigner::new();

        for (r, ins) in buf.range(self.first, self.last) {
            match ins.opcode() {
                LirOpcode::Param => {
                    let kind = match ins.imm() {
                        Immediate::Param { kind, .. } => kind,
                        _ => ins.kind().unwrap_or(ValueKind::I64),
                    };
                    let assignment = params.assign_arg(kind);
                    self.frame.param_assignments.push((r, assignment));
                }
                LirOpcode::Alloc => {
                    let size = match ins.imm() {
                        Immediate::Size(size) => size,
                        _ => 0,
                    };
                    let block = self.frame.allocate_block(size.max(1))?;
                    self.blocks.insert(r, block);
                }
                opcode if opcode.is_branch() => self.check_branch(r, ins)?,
                _ => {}
            }
            if ins.kind().is_some() {
                self.frame.allocate_value_slot(r)?;
            }
        }

        for bank in [RegBank::GeneralPurpose, RegBank::Xmm] {
            let count = params.requested(bank);
            let max = params.capacity(bank);
            if count > max {
                return Err(CodegenError::TooManyParameters { class: bank.name(), count, max });
            }
        }

        self.frame.calculate_frame_size()?;
        Ok(())
    }

    fn check_branch(&self, r: LInsRef, ins: &LIns) -> CodegenResult<()> {
        let Some(target) = ins.target() else {
            return Err(CodegenError::UnresolvedBranch { ins: r });
        };
        let in_fragment = target >= self.first && target <= self.last;
        let is_label = self.buf.get(target).is_some_and(|t| t.is_label());
        if !in_fragment || !is_label {
            return Err(CodegenError::UnknownBranch { ins: r, target });
        }
        Ok(())
    }

    fn emit_prologue(&mut self) -> CodegenResult<()> {
        self.enc.emit_prologue(self.frame.frame_size)?;
        for i in 0..self.frame.param_assignments.len() {
            let (r, assignment) = self.frame.param_assignments[i];
            let off = self.slot(r, r, 0)?;
            match assignment.reg {
                Some(ArgReg::Gp(reg)) => self.enc.store_slot64(off, reg)?,
                Some(ArgReg::Xmm(reg)) => self.enc.store_slot_xmm(off, reg, width_of(assignment.kind))?,
                None => {}
            }
        }
        Ok(())
    }

    // ==== OPERANDS ====

    fn slot(&self, ins: LInsRef, value: LInsRef, slot: usize) -> CodegenResult<i32> {
        self.frame
            .slot(value)
            .ok_or(CodegenError::MissingOperand { ins, slot })
    }

    fn operand(&self, r: LInsRef, ins: &LIns, slot: usize) -> CodegenResult<i32> {
        let value = ins.operand(slot).ok_or(CodegenError::MissingOperand { ins: r, slot })?;
        self.slot(r, value, slot)
    }

    fn result(&self, r: LInsRef) -> CodegenResult<i32> {
        self.frame
            .slot(r)
            .ok_or(CodegenError::MissingOperand { ins: r, slot: 0 })
    }

    // ==== LOWERING ====

    fn lower(&mut self, r: LInsRef, ins: &LIns) -> CodegenResult<()> {
        use LirOpcode::*;

        match ins.opcode() {
            Start | Param => {}

            ImmI | ImmQ | ImmF | ImmD => self.lower_const(r, ins)?,

            AddI => self.int_binary(r, ins, IntOp::Add, Width::W32)?,
            SubI => self.int_binary(r, ins, IntOp::Sub, Width::W32)?,
            MulI => self.int_binary(r, ins, IntOp::Mul, Width::W32)?,
            AndI => self.int_binary(r, ins, IntOp::And, Width::W32)?,
            OrI => self.int_binary(r, ins, IntOp::Or, Width::W32)?,
            XorI => self.int_binary(r, ins, IntOp::Xor, Width::W32)?,
            AddQ => self.int_binary(r, ins, IntOp::Add, Width::W64)?,
            SubQ => self.int_binary(r, ins, IntOp::Sub, Width::W64)?,
            MulQ => self.int_binary(r, ins, IntOp::Mul, Width::W64)?,
            AndQ => self.int_binary(r, ins, IntOp::And, Width::W64)?,
            OrQ => self.int_binary(r, ins, IntOp::Or, Width::W64)?,
            XorQ => self.int_binary(r, ins, IntOp::Xor, Width::W64)?,

            LshI => self.shift(r, ins, ShiftOp::Shl, Width::W32)?,
            RshI => self.shift(r, ins, ShiftOp::Sar, Width::W32)?,
            RshuI => self.shift(r, ins, ShiftOp::Shr, Width::W32)?,
            LshQ => self.shift(r, ins, ShiftOp::Shl, Width::W64)?,
            RshQ => self.shift(r, ins, ShiftOp::Sar, Width::W64)?,
            RshuQ => self.shift(r, ins, ShiftOp::Shr, Width::W64)?,

            AddF => self.float_binary(r, ins, FloatOp::Add, Width::W32)?,
            SubF => self.float_binary(r, ins, FloatOp::Sub, Width::W32)?,
            MulF => self.float_binary(r, ins, FloatOp::Mul, Width::W32)?,
            DivF => self.float_binary(r, ins, FloatOp::Div, Width::W32)?,
            AddD => self.float_binary(r, ins, FloatOp::Add, Width::W64)?,
            SubD => self.float_binary(r, ins, FloatOp::Sub, Width::W64)?,
            MulD => self.float_binary(r, ins, FloatOp::Mul, Width::W64)?,
            DivD => self.float_binary(r, ins, FloatOp::Div, Width::W64)?,

            EqI => self.int_compare(r, ins, Cond::Eq, Width::W32)?,
            LtI => self.int_compare(r, ins, Cond::Lt, Width::W32)?,
            GtI => self.int_compare(r, ins, Cond::Gt, Width::W32)?,
            LeI => self.int_compare(r, ins, Cond::Le, Width::W32)?,
            GeI => self.int_compare(r, ins, Cond::Ge, Width::W32)?,
            EqQ => self.int_compare(r, ins, Cond::Eq, Width::W64)?,
            LtQ => self.int_compare(r, ins, Cond::Lt, Width::W64)?,
            GtQ => self.int_compare(r, ins, Cond::Gt, Width::W64)?,
            LeQ => self.int_compare(r, ins, Cond::Le, Width::W64)?,
            GeQ => self.int_compare(r, ins, Cond::Ge, Width::W64)?,

            EqF => self.float_compare(r, ins, Cond::Eq, Width::W32)?,
            LtF => self.float_compare(r, ins, Cond::Lt, Width::W32)?,
            GtF => self.float_compare(r, ins, Cond::Gt, Width::W32)?,
            LeF => self.float_compare(r, ins, Cond::Le, Width::W32)?,
            GeF => self.float_compare(r, ins, Cond::Ge, Width::W32)?,
            EqD => self.float_compare(r, ins, Cond::Eq, Width::W64)?,
            LtD => self.float_compare(r, ins, Cond::Lt, Width::W64)?,
            GtD => self.float_compare(r, ins, Cond::Gt, Width::W64)?,
            LeD => self.float_compare(r, ins, Cond::Le, Width::W64)?,
            GeD => self.float_compare(r, ins, Cond::Ge, Width::W64)?,

            Q2I | I2Q | UI2UQ | I2D | D2I | F2D | D2F => self.convert(r, ins)?,

            CmovI => self.select(r, ins, Width::W32)?,
            CmovQ => self.select(r, ins, Width::W64)?,

            LdC2I => self.load(r, ins, MemAccess::I8Signed)?,
            LdUC2UI => self.load(r, ins, MemAccess::I8Unsigned)?,
            LdS2I => self.load(r, ins, MemAccess::I16Signed)?,
            LdUS2UI => self.load(r, ins, MemAccess::I16Unsigned)?,
            LdI => self.load(r, ins, MemAccess::I32)?,
            LdQ => self.load(r, ins, MemAccess::I64)?,
            LdF => self.load(r, ins, MemAccess::F32)?,
            LdD => self.load(r, ins, MemAccess::F64)?,
            LdF2D => self.load(r, ins, MemAccess::F32ToF64)?,

            StI2C => self.store(r, ins, MemAccess::I8Unsigned)?,
            StI2S => self.store(r, ins, MemAccess::I16Unsigned)?,
            StI => self.store(r, ins, MemAccess::I32)?,
            StQ => self.store(r, ins, MemAccess::I64)?,
            StF => self.store(r, ins, MemAccess::F32)?,
            StD => self.store(r, ins, MemAccess::F64)?,

            Alloc => {
                let block = self
                    .blocks
                    .get(&r)
                    .copied()
                    .ok_or(CodegenError::MissingOperand { ins: r, slot: 0 })?;
                let dst = self.result(r)?;
                self.enc.lea_slot(rax, block)?;
                self.enc.store_slot64(dst, rax)?;
            }

            Label => self.enc.place_label_for(r)?,
            J | JT | JF => self.branch(r, ins)?,

            CallI | CallQ | CallF | CallD | CallV => self.call(r, ins)?,

            RetI => {
                let value = self.operand(r, ins, 0)?;
                self.enc.load_slot32(eax, value)?;
                self.enc.emit_epilogue()?;
            }
            RetQ => {
                let value = self.operand(r, ins, 0)?;
                self.enc.load_slot64(rax, value)?;
                self.enc.emit_epilogue()?;
            }
            RetD => {
                let value = self.operand(r, ins, 0)?;
                self.enc.load_slot_xmm(xmm0, value, Width::W64)?;
                self.enc.emit_epilogue()?;
            }
            Ret | X => self.enc.emit_exit()?,
            XT | XF => {
                let cond = self.operand(r, ins, 0)?;
                let mut stay = self.enc.new_label();
                self.enc.load_slot32(eax, cond)?;
                // Jump over the exit when the guard does not fire.
                self.enc.branch_on_eax(ins.opcode() == XF, stay)?;
                self.enc.emit_exit()?;
                self.enc.place(&mut stay)?;
            }
        }
        Ok(())
    }

    fn lower_const(&mut self, r: LInsRef, ins: &LIns) -> CodegenResult<()> {
        let dst = self.result(r)?;
        match ins.imm() {
            Immediate::Int(v) => self.enc.store_slot_imm32(dst, v)?,
            Immediate::Quad(v) => self.enc.store_slot_imm64(dst, v)?,
            Immediate::Float(v) => self.enc.store_slot_imm32(dst, v.to_bits() as i32)?,
            Immediate::Double(v) => self.enc.store_slot_imm64(dst, v.to_bits() as i64)?,
            _ => return Err(CodegenError::MissingOperand { ins: r, slot: 0 }),
        }
        Ok(())
    }

    fn int_binary(&mut self, r: LInsRef, ins: &LIns, op: IntOp, width: Width) -> CodegenResult<()> {
        let (a, b, dst) = (self.operand(r, ins, 0)?, self.operand(r, ins, 1)?, self.result(r)?);
        match width {
            Width::W32 => {
                self.enc.load_slot32(eax, a)?;
                self.enc.load_slot32(ecx, b)?;
                self.enc.int_op(op, width)?;
                self.enc.store_slot32(dst, eax)?;
            }
            Width::W64 => {
                self.enc.load_slot64(rax, a)?;
                self.enc.load_slot64(rcx, b)?;
                self.enc.int_op(op, width)?;
                self.enc.store_slot64(dst, rax)?;
            }
        }
        Ok(())
    }

    fn shift(&mut self, r: LInsRef, ins: &LIns, op: ShiftOp, width: Width) -> CodegenResult<()> {
        let (a, count, dst) = (self.operand(r, ins, 0)?, self.operand(r, ins, 1)?, self.result(r)?);
        self.enc.load_slot32(ecx, count)?;
        match width {
            Width::W32 => {
                self.enc.load_slot32(eax, a)?;
                self.enc.shift(op, width)?;
                self.enc.store_slot32(dst, eax)?;
            }
            Width::W64 => {
                self.enc.load_slot64(rax, a)?;
                self.enc.shift(op, width)?;
                self.enc.store_slot64(dst, rax)?;
            }
        }
        Ok(())
    }

    fn float_binary(&mut self, r: LInsRef, ins: &LIns, op: FloatOp, width: Width) -> CodegenResult<()> {
        let (a, b, dst) = (self.operand(r, ins, 0)?, self.operand(r, ins, 1)?, self.result(r)?);
        self.enc.load_slot_xmm(xmm0, a, width)?;
        self.enc.load_slot_xmm(xmm1, b, width)?;
        self.enc.float_op(op, width)?;
        self.enc.store_slot_xmm(dst, xmm0, width)?;
        Ok(())
    }

    fn int_compare(&mut self, r: LInsRef, ins: &LIns, cond: Cond, width: Width) -> CodegenResult<()> {
        let (a, b, dst) = (self.operand(r, ins, 0)?, self.operand(r, ins, 1)?, self.result(r)?);
        match width {
            Width::W32 => {
                self.enc.load_slot32(eax, a)?;
                self.enc.load_slot32(ecx, b)?;
            }
            Width::W64 => {
                self.enc.load_slot64(rax, a)?;
                self.enc.load_slot64(rcx, b)?;
            }
        }
        self.enc.compare_int(cond, width)?;
        self.enc.store_slot32(dst, eax)?;
        Ok(())
    }

    fn float_compare(&mut self, r: LInsRef, ins: &LIns, cond: Cond, width: Width) -> CodegenResult<()> {
        let (a, b, dst) = (self.operand(r, ins, 0)?, self.operand(r, ins, 1)?, self.result(r)?);
        self.enc.load_slot_xmm(xmm0, a, width)?;
        self.enc.load_slot_xmm(xmm1, b, width)?;
        self.enc.compare_float(cond, width)?;
        self.enc.store_slot32(dst, eax)?;
        Ok(())
    }

    fn convert(&mut self, r: LInsRef, ins: &LIns) -> CodegenResult<()> {
        let (src, dst) = (self.operand(r, ins, 0)?, self.result(r)?);
        match ins.opcode() {
            LirOpcode::Q2I => {
                self.enc.load_slot32(eax, src)?;
                self.enc.store_slot32(dst, eax)?;
            }
            LirOpcode::I2Q => {
                self.enc.load_slot32(eax, src)?;
                self.enc.sign_extend()?;
                self.enc.store_slot64(dst, rax)?;
            }
            LirOpcode::UI2UQ => {
                // A 32-bit load clears the upper half of RAX.
                self.enc.load_slot32(eax, src)?;
                self.enc.store_slot64(dst, rax)?;
            }
            LirOpcode::I2D => {
                self.enc.load_slot32(eax, src)?;
                self.enc.int_to_double()?;
                self.enc.store_slot_xmm(dst, xmm0, Width::W64)?;
            }
            LirOpcode::D2I => {
                self.enc.load_slot_xmm(xmm0, src, Width::W64)?;
                self.enc.double_to_int()?;
                self.enc.store_slot32(dst, eax)?;
            }
            LirOpcode::F2D => {
                self.enc.load_slot_xmm(xmm0, src, Width::W32)?;
                self.enc.float_to_double()?;
                self.enc.store_slot_xmm(dst, xmm0, Width::W64)?;
            }
            LirOpcode::D2F => {
                self.enc.load_slot_xmm(xmm0, src, Width::W64)?;
                self.enc.double_to_float()?;
                self.enc.store_slot_xmm(dst, xmm0, Width::W32)?;
            }
            _ => return Err(CodegenError::MissingOperand { ins: r, slot: 0 }),
        }
        Ok(())
    }

    fn select(&mut self, r: LInsRef, ins: &LIns, width: Width) -> CodegenResult<()> {
        let cond = self.operand(r, ins, 0)?;
        let (if_true, if_false) = (self.operand(r, ins, 1)?, self.operand(r, ins, 2)?);
        let dst = self.result(r)?;
        self.enc.load_slot32(edx, cond)?;
        match width {
            Width::W32 => {
                self.enc.load_slot32(eax, if_true)?;
                self.enc.load_slot32(ecx, if_false)?;
                self.enc.select(width)?;
                self.enc.store_slot32(dst, eax)?;
            }
            Width::W64 => {
                self.enc.load_slot64(rax, if_true)?;
                self.enc.load_slot64(rcx, if_false)?;
                self.enc.select(width)?;
                self.enc.store_slot64(dst, rax)?;
            }
        }
        Ok(())
    }

    fn load(&mut self, r: LInsRef, ins: &LIns, access: MemAccess) -> CodegenResult<()> {
        let (ptr, dst) = (self.operand(r, ins, 0)?, self.result(r)?);
        self.enc.load_slot64(rax, ptr)?;
        self.enc.load_mem(access, displacement(ins))?;
        match access {
            MemAccess::I64 => self.enc.store_slot64(dst, rcx)?,
            MemAccess::F32 => self.enc.store_slot_xmm(dst, xmm0, Width::W32)?,
            MemAccess::F64 | MemAccess::F32ToF64 => self.enc.store_slot_xmm(dst, xmm0, Width::W64)?,
            _ => self.enc.store_slot32(dst, ecx)?,
        }
        Ok(())
    }

    fn store(&mut self, r: LInsRef, ins: &LIns, access: MemAccess) -> CodegenResult<()> {
        let (value, ptr) = (self.operand(r, ins, 0)?, self.operand(r, ins, 1)?);
        match access {
            MemAccess::I64 => self.enc.load_slot64(rcx, value)?,
            MemAccess::F32 => self.enc.load_slot_xmm(xmm0, value, Width::W32)?,
            MemAccess::F64 => self.enc.load_slot_xmm(xmm0, value, Width::W64)?,
            _ => self.enc.load_slot32(ecx, value)?,
        }
        self.enc.load_slot64(rax, ptr)?;
        self.enc.store_mem(access, displacement(ins))?;
        Ok(())
    }

    fn branch(&mut self, r: LInsRef, ins: &LIns) -> CodegenResult<()> {
        let target = ins.target().ok_or(CodegenError::UnresolvedBranch { ins: r })?;
        let label = self.enc.label_for(target);
        match ins.opcode() {
            LirOpcode::J => self.enc.jmp(label)?,
            opcode => {
                let cond = self.operand(r, ins, 0)?;
                self.enc.load_slot32(eax, cond)?;
                self.enc.branch_on_eax(opcode == LirOpcode::JT, label)?;
            }
        }
        Ok(())
    }

    fn call(&mut self, r: LInsRef, ins: &LIns) -> CodegenResult<()> {
        let Immediate::Addr(addr) = ins.imm() else {
            return Err(CodegenError::MissingOperand { ins: r, slot: 0 });
        };

        self.call_args.reset();
        for (i, &arg) in self.buf.call_args(ins).iter().enumerate() {
            let kind = self
                .buf
                .get(arg)
                .and_then(|a| a.kind())
                .ok_or(CodegenError::MissingOperand { ins: r, slot: i })?;
            let off = self.slot(r, arg, i)?;
            let assignment = self.call_args.assign_arg(kind);
            match assignment.reg {
                Some(ArgReg::Gp(reg)) => self.enc.load_slot64(reg, off)?,
                Some(ArgReg::Xmm(reg)) => self.enc.load_slot_xmm(reg, off, width_of(kind))?,
                None => {
                    let bank = RegBank::of(kind);
                    return Err(CodegenError::TooManyArguments {
                        ins: r,
                        class: bank.name(),
                        count: self.count_args(ins, bank),
                        max: self.call_args.capacity(bank),
                    });
                }
            }
        }

        self.enc.call_abs(addr)?;

        match ins.kind() {
            None => {}
            Some(kind) => {
                let dst = self.result(r)?;
                match kind {
                    ValueKind::I32 => self.enc.store_slot32(dst, eax)?,
                    ValueKind::I64 => self.enc.store_slot64(dst, rax)?,
                    ValueKind::F32 => self.enc.store_slot_xmm(dst, xmm0, Width::W32)?,
                    ValueKind::F64 => self.enc.store_slot_xmm(dst, xmm0, Width::W64)?,
                }
            }
        }
        Ok(())
    }

    fn count_args(&self, ins: &LIns, bank: RegBank) -> usize {
        self.buf
            .call_args(ins)
            .iter()
            .filter_map(|a| self.buf.get(*a).and_then(|a| a.kind()))
            .filter(|k| RegBank::of(*k) == bank)
            .count()
    }
}

fn width_of(kind: ValueKind) -> Width {
    match kind {
        ValueKind::I32 | ValueKind::F32 => Width::W32,
        ValueKind::I64 | ValueKind::F64 => Width::W64,
    }
}

fn displacement(ins: &LIns) -> i32 {
    match ins.imm() {
        Immediate::Disp { offset, .. } => offset,
        _ => 0,
    }
}
