//! A small assembler for building guest images.
//!
//! Branch helpers take absolute targets and compute the PC-relative encoding
//! against the address the instruction will occupy, so images can be written
//! top-down without manual offset arithmetic.

use crate::inst::{Cond, Inst};
use crate::regs::{Fpr, Gpr};

pub struct Assembler {
    base: u64,
    buf: Vec<u8>,
}

impl Assembler {
    /// Start assembling at guest address `base`.
    pub fn new(base: u64) -> Self {
        Self { base, buf: Vec::new() }
    }

    /// Guest address of the next emitted instruction.
    pub fn pc(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    /// Emit a raw instruction.
    pub fn raw(&mut self, inst: Inst) -> &mut Self {
        inst.encode(&mut self.buf);
        self
    }

    fn rel_to(&self, target: u64, inst_len: u8) -> i32 {
        let next = self.pc() + u64::from(inst_len);
        let delta = target.wrapping_sub(next) as i64;
        i32::try_from(delta).expect("branch target out of 32-bit range")
    }

    pub fn nop(&mut self) -> &mut Self {
        self.raw(Inst::Nop)
    }

    pub fn mov_imm(&mut self, rd: Gpr, imm: i32) -> &mut Self {
        self.raw(Inst::MovImm { rd, imm })
    }

    /// Emit an `Ext`-prefixed `mov` loading a full 64-bit constant.
    pub fn mov_imm64(&mut self, rd: Gpr, value: u64) -> &mut Self {
        self.raw(Inst::Ext {
            imm: (value >> 32) as u32,
        });
        self.raw(Inst::MovImm {
            rd,
            imm: value as u32 as i32,
        })
    }

    pub fn mov_reg(&mut self, rd: Gpr, rs: Gpr) -> &mut Self {
        self.raw(Inst::MovReg { rd, rs })
    }

    pub fn add(&mut self, rd: Gpr, rs: Gpr) -> &mut Self {
        self.raw(Inst::Add { rd, rs })
    }

    pub fn sub(&mut self, rd: Gpr, rs: Gpr) -> &mut Self {
        self.raw(Inst::Sub { rd, rs })
    }

    pub fn add_imm(&mut self, rd: Gpr, imm: i32) -> &mut Self {
        self.raw(Inst::AddImm { rd, imm })
    }

    pub fn cmp(&mut self, ra: Gpr, rb: Gpr) -> &mut Self {
        self.raw(Inst::Cmp { ra, rb })
    }

    pub fn load(&mut self, rd: Gpr, base: Gpr, offset: i16) -> &mut Self {
        self.raw(Inst::Load { rd, base, offset })
    }

    pub fn store(&mut self, base: Gpr, src: Gpr, offset: i16) -> &mut Self {
        self.raw(Inst::Store { base, src, offset })
    }

    pub fn push(&mut self, rs: Gpr) -> &mut Self {
        self.raw(Inst::Push { rs })
    }

    pub fn pop(&mut self, rd: Gpr) -> &mut Self {
        self.raw(Inst::Pop { rd })
    }

    /// `lea` of an absolute guest address, encoded PC-relative.
    pub fn lea_abs(&mut self, rd: Gpr, target: u64) -> &mut Self {
        let offset = self.rel_to(target, 6);
        self.raw(Inst::Lea { rd, offset })
    }

    pub fn fmov_imm(&mut self, fd: Fpr, imm: i32) -> &mut Self {
        self.raw(Inst::FMovImm { fd, imm })
    }

    pub fn fadd(&mut self, fd: Fpr, fs: Fpr) -> &mut Self {
        self.raw(Inst::FAdd { fd, fs })
    }

    pub fn jmp_to(&mut self, target: u64) -> &mut Self {
        let offset = self.rel_to(target, 5);
        self.raw(Inst::Jmp { offset })
    }

    pub fn jcc_to(&mut self, cond: Cond, target: u64) -> &mut Self {
        let offset = self.rel_to(target, 6);
        self.raw(Inst::Jcc { cond, offset })
    }

    pub fn call_to(&mut self, target: u64) -> &mut Self {
        let offset = self.rel_to(target, 5);
        self.raw(Inst::Call { offset })
    }

    pub fn jmp_reg(&mut self, rs: Gpr) -> &mut Self {
        self.raw(Inst::JmpReg { rs })
    }

    pub fn call_reg(&mut self, rs: Gpr) -> &mut Self {
        self.raw(Inst::CallReg { rs })
    }

    pub fn ret(&mut self) -> &mut Self {
        self.raw(Inst::Ret)
    }

    pub fn brk(&mut self) -> &mut Self {
        self.raw(Inst::Brk)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
