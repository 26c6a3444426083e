// This module implements the parts of the System V AMD64 ABI that generated fragments need.
// Fragment parameters and native call arguments are passed in registers only: integer and
// pointer values in RDI, RSI, RDX, RCX, R8, R9 and float values in XMM0-XMM7, each class
// counted independently. A value that does not fit in the remaining registers of its class
// gets no assignment, and the code generator reports that as too many parameters or
// arguments. Integer results come back in RAX and float results in XMM0. FunctionFrame
// lays out the fragment's stack frame below the saved RBP: one 8-byte slot for every
// value-producing instruction, then 16-byte aligned blocks for `alloc`, with the total
// rounded up to 16 bytes so the stack stays ABI-aligned at every call the fragment makes.
// Frame offsets are accumulated in 64 bits and checked against the configured maximum as
// each slot or block is handed out, so an oversized `alloc` is reported as StackFull
// instead of wrapping around.

//! System V x86-64 calling convention and frame layout.

use bumpalo::{collections::Vec as BumpVec, Bump};
use iced_x86::code_asm::*;

use crate::core::error::{CodegenError, CodegenResult};
use crate::lir::{LInsRef, ValueKind};

/// Register banks for different register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBank {
    GeneralPurpose = 0,
    Xmm = 1,
}

impl RegBank {
    pub fn of(kind: ValueKind) -> Self {
        if kind.is_float() {
            RegBank::Xmm
        } else {
            RegBank::GeneralPurpose
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RegBank::GeneralPurpose => "integer",
            RegBank::Xmm => "float",
        }
    }
}

/// Register an argument is passed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgReg {
    Gp(AsmRegister64),
    Xmm(AsmRegisterXmm),
}

/// Argument assignment result from calling convention analysis.
#[derive(Debug, Clone, Copy)]
pub struct CCAssignment {
    pub kind: ValueKind,
    /// Assigned register, `None` when the bank's registers are used up.
    pub reg: Option<ArgReg>,
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    /// Assign the next argument of `kind`.
    fn assign_arg(&mut self, kind: ValueKind) -> CCAssignment;

    /// Reset state for a new parameter or argument list.
    fn reset(&mut self);

    /// Number of registers of `bank` the convention provides.
    fn capacity(&self, bank: RegBank) -> usize;

    /// Arguments of `bank` assigned so far, including unassigned overflow.
    fn requested(&self, bank: RegBank) -> usize;
}

/// System V x86-64 calling convention assigner.
#[derive(Debug, Default)]
pub struct SysVAssigner {
    /// GP arguments seen.
    gp_cnt: usize,
    /// XMM arguments seen.
    xmm_cnt: usize,
}

impl SysVAssigner {
    /// System V x86-64 GP argument registers.
    pub const GP_ARG_REGS: [AsmRegister64; 6] = [rdi, rsi, rdx, rcx, r8, r9];

    /// System V x86-64 XMM argument registers.
    pub const XMM_ARG_REGS: [AsmRegisterXmm; 8] = [xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7];

    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self, kind: ValueKind) -> CCAssignment {
        let reg = match RegBank::of(kind) {
            RegBank::GeneralPurpose => {
                let reg = Self::GP_ARG_REGS.get(self.gp_cnt).map(|r| ArgReg::Gp(*r));
                self.gp_cnt += 1;
                reg
            }
            RegBank::Xmm => {
                let reg = Self::XMM_ARG_REGS.get(self.xmm_cnt).map(|r| ArgReg::Xmm(*r));
                self.xmm_cnt += 1;
                reg
            }
        };
        CCAssignment { kind, reg }
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.xmm_cnt = 0;
    }

    fn capacity(&self, bank: RegBank) -> usize {
        match bank {
            RegBank::GeneralPurpose => Self::GP_ARG_REGS.len(),
            RegBank::Xmm => Self::XMM_ARG_REGS.len(),
        }
    }

    fn requested(&self, bank: RegBank) -> usize {
        match bank {
            RegBank::GeneralPurpose => self.gp_cnt,
            RegBank::Xmm => self.xmm_cnt,
        }
    }
}

/// Stack frame of one fragment.
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// First instruction of the fragment; slot indices are relative to it.
    first: LInsRef,
    /// RBP-relative slot per instruction, 0 for instructions without a value.
    slots: BumpVec<'a, i32>,
    /// Bytes handed out below RBP so far.
    used: u64,
    /// Largest frame the fragment may use.
    limit: u32,
    /// Total size of the stack frame.
    pub frame_size: u32,
    /// Parameters to copy out of their registers in the prologue.
    pub param_assignments: BumpVec<'a, (LInsRef, CCAssignment)>,
}

impl<'a> FunctionFrame<'a> {
    /// Create a frame for the instructions `[first, first + count)` that may
    /// grow to at most `limit` bytes.
    pub fn new(arena: &'a Bump, first: LInsRef, count: usize, limit: u32) -> Self {
        let mut slots = BumpVec::with_capacity_in(count, arena);
        slots.resize(count, 0);
        Self {
            first,
            slots,
            used: 0,
            limit,
            frame_size: 0,
            param_assignments: BumpVec::new_in(arena),
        }
    }

    /// Grow the frame to `used` bytes and return the matching RBP offset.
    fn grow_to(&mut self, used: u64) -> CodegenResult<i32> {
        let offset = i32::try_from(used).ok().filter(|_| used <= u64::from(self.limit));
        let Some(offset) = offset else {
            return Err(CodegenError::StackFull { size: used, limit: self.limit });
        };
        self.used = used;
        Ok(-offset)
    }

    /// Give `r` an 8-byte value slot and return its offset.
    pub fn allocate_value_slot(&mut self, r: LInsRef) -> CodegenResult<i32> {
        let offset = self.grow_to(self.used + 8)?;
        if let Some(slot) = self.slots.get_mut(r.index() - self.first.index()) {
            *slot = offset;
        }
        Ok(offset)
    }

    /// Reserve a 16-byte aligned block of `size` bytes and return its offset.
    pub fn allocate_block(&mut self, size: u32) -> CodegenResult<i32> {
        let aligned_size = u64::from(size).div_ceil(16) * 16;
        self.grow_to((self.used + aligned_size).div_ceil(16) * 16)
    }

    /// Slot of a value-producing instruction of this fragment.
    pub fn slot(&self, r: LInsRef) -> Option<i32> {
        let index = r.index().checked_sub(self.first.index())?;
        self.slots.get(index).copied().filter(|off| *off != 0)
    }

    /// Calculate the final frame size.
    pub fn calculate_frame_size(&mut self) -> CodegenResult<u32> {
        // rbp + 8: return address
        // rbp:     saved rbp
        // rbp - X: value slots and alloc blocks
        let size = self.used.div_ceil(16) * 16;
        self.grow_to(size)?;
        self.frame_size = size as u32;
        Ok(self.frame_size)
    }
}
